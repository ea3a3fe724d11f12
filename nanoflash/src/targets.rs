//! Flashable target devices
//!
//! A target is a named firmware build for a specific board. Its [Platform]
//! decides which tools are used to flash it and which fixed flash addresses
//! apply to the firmware pieces shipped in a package.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, VariantNames};

use crate::Error;

/// Address of the partition table on all ESP32 chips
pub const ESP32_PARTITION_TABLE_ADDRESS: u32 = 0x8000;
/// Address of the interpreter image on all ESP32 chips
pub const ESP32_CLR_ADDRESS: u32 = 0x10000;
/// Address of the second stage bootloader on ESP32 and ESP32-S2
pub const ESP32_BOOTLOADER_ADDRESS: u32 = 0x1000;

/// Default application deployment address for ESP32 targets
pub const ESP32_DEFAULT_DEPLOYMENT_ADDRESS: u32 = 0x1B_0000;

/// Default application deployment address on STM32 targets with 1 MB of flash
pub const STM32_DEFAULT_DEPLOYMENT_ADDRESS: u32 = 0x080C_0000;

/// Start of the internal flash on STM32 parts
pub const STM32_FLASH_START: u32 = 0x0800_0000;

/// Hardware platform a target runs on
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Display,
    EnumIter,
    EnumString,
    VariantNames,
    Serialize,
    Deserialize,
)]
#[non_exhaustive]
#[strum(ascii_case_insensitive)]
pub enum Platform {
    /// Espressif ESP32 family
    #[strum(serialize = "esp32")]
    #[serde(alias = "esp32", alias = "ESP32")]
    Esp32,
    /// ST STM32 family
    #[strum(serialize = "stm32")]
    #[serde(alias = "stm32", alias = "STM32")]
    Stm32,
    /// TI CC13x2/CC26x2 SimpleLink family
    #[strum(serialize = "ti")]
    #[serde(alias = "ti", alias = "TI_SimpleLink", alias = "cc13x2")]
    Ti,
    /// Silabs EFM32 Giant Gecko family
    #[strum(serialize = "efm32")]
    #[serde(alias = "efm32", alias = "gg11")]
    Efm32,
    /// NXP family
    #[strum(serialize = "nxp")]
    #[serde(alias = "nxp", alias = "NXP")]
    Nxp,
}

impl Platform {
    /// Guess the platform from a target name, following the naming
    /// conventions used by the reference targets.
    pub fn from_target_name(target: &str) -> Option<Self> {
        let upper = target.to_uppercase();

        if upper.starts_with("ESP32") || upper.starts_with("M5") || upper.starts_with("FEATHER_S")
        {
            Some(Platform::Esp32)
        } else if upper.starts_with("ST_")
            || upper.starts_with("MBN_")
            || upper.starts_with("NETDUINO3")
            || upper.starts_with("GHI_")
            || upper.starts_with("ORGPAL_")
            || upper.contains("STM32")
        {
            Some(Platform::Stm32)
        } else if upper.starts_with("TI_") {
            Some(Platform::Ti)
        } else if upper.starts_with("SL_") || upper.contains("GIANT_GECKO") {
            Some(Platform::Efm32)
        } else if upper.starts_with("NXP_") {
            Some(Platform::Nxp)
        } else {
            None
        }
    }
}

/// Identity of the target being flashed
///
/// Built once before a flashing operation starts and never changed after.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetIdentity {
    target_name: String,
    platform: Platform,
    chip_variant: Option<String>,
}

impl TargetIdentity {
    pub fn new(target_name: impl Into<String>, platform: Platform) -> Self {
        Self {
            target_name: target_name.into(),
            platform,
            chip_variant: None,
        }
    }

    pub fn with_chip_variant(mut self, variant: impl Into<String>) -> Self {
        self.chip_variant = Some(variant.into());
        self
    }

    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn chip_variant(&self) -> Option<&str> {
        self.chip_variant.as_deref()
    }

    /// Address of the second stage bootloader for ESP32 targets.
    ///
    /// ESP32 and ESP32-S2 load it from `0x1000`, the newer parts (S3, C3,
    /// C6, H2) from `0x0`. The detected chip variant wins over the target
    /// name when both are known.
    pub fn esp32_bootloader_address(&self) -> u32 {
        let variant = self
            .chip_variant
            .as_deref()
            .unwrap_or(&self.target_name)
            .to_uppercase()
            .replace('-', "_");

        const ZERO_OFFSET: &[&str] = &["ESP32_S3", "ESP32_C3", "ESP32_C6", "ESP32_H2"];

        if ZERO_OFFSET.iter().any(|v| variant.starts_with(v)) {
            0x0
        } else {
            ESP32_BOOTLOADER_ADDRESS
        }
    }

    /// Default application deployment address when none was given
    pub fn default_deployment_address(&self) -> Option<u32> {
        match self.platform {
            Platform::Esp32 => Some(ESP32_DEFAULT_DEPLOYMENT_ADDRESS),
            Platform::Stm32 => Some(match self.target_name.as_str() {
                "ST_STM32F429I_DISCOVERY" | "ST_STM32F769I_DISCOVERY" => 0x0808_0000,
                "ST_NUCLEO64_F091RC" => 0x0801_0000,
                "ORGPAL_PALTHREE" | "ORGPAL_PALX" => 0x0810_0000,
                _ => STM32_DEFAULT_DEPLOYMENT_ADDRESS,
            }),
            Platform::Ti => Some(0x000F_0000),
            Platform::Efm32 => Some(0x0010_0000),
            Platform::Nxp => None,
        }
    }
}

/// Supported flash sizes
///
/// Only the sizes for which packages ship a partition table are listed.
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    Hash,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Display,
    VariantNames,
    EnumIter,
    Serialize,
    Deserialize,
)]
#[non_exhaustive]
pub enum FlashSize {
    /// 2 MB
    #[serde(rename = "2MB")]
    #[strum(serialize = "2MB")]
    #[cfg_attr(feature = "cli", value(name = "2MB"))]
    _2Mb,
    /// 4 MB
    #[default]
    #[serde(rename = "4MB")]
    #[strum(serialize = "4MB")]
    #[cfg_attr(feature = "cli", value(name = "4MB"))]
    _4Mb,
    /// 8 MB
    #[serde(rename = "8MB")]
    #[strum(serialize = "8MB")]
    #[cfg_attr(feature = "cli", value(name = "8MB"))]
    _8Mb,
    /// 16 MB
    #[serde(rename = "16MB")]
    #[strum(serialize = "16MB")]
    #[cfg_attr(feature = "cli", value(name = "16MB"))]
    _16Mb,
}

impl FlashSize {
    /// Size in bytes
    pub const fn size(self) -> u32 {
        match self {
            FlashSize::_2Mb => 0x20_0000,
            FlashSize::_4Mb => 0x40_0000,
            FlashSize::_8Mb => 0x80_0000,
            FlashSize::_16Mb => 0x100_0000,
        }
    }

    /// Label used in the partition file names shipped with a package
    pub const fn file_label(self) -> &'static str {
        match self {
            FlashSize::_2Mb => "2mb",
            FlashSize::_4Mb => "4mb",
            FlashSize::_8Mb => "8mb",
            FlashSize::_16Mb => "16mb",
        }
    }

    /// Parse a size as reported by esptool (`4MB`) or given by a user (`4mb`)
    pub fn from_label(label: &str) -> Result<Self, Error> {
        match label.trim().to_uppercase().as_str() {
            "2MB" => Ok(FlashSize::_2Mb),
            "4MB" => Ok(FlashSize::_4Mb),
            "8MB" => Ok(FlashSize::_8Mb),
            "16MB" => Ok(FlashSize::_16Mb),
            _ => Err(Error::UnsupportedFlashSize(label.to_owned())),
        }
    }

    /// Pick the flash size used to select the partition table:
    /// explicit override, then the size detected on the device, then the
    /// default.
    pub fn select(explicit: Option<&str>, detected: Option<&str>) -> Result<Self, Error> {
        match (explicit, detected) {
            (Some(label), _) | (None, Some(label)) => Self::from_label(label),
            (None, None) => Ok(FlashSize::default()),
        }
    }
}

/// Chip details reported by esptool for a connected ESP32
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Esp32ChipInfo {
    /// Chip family, e.g. `ESP32-S3`
    pub chip_type: String,
    /// Full chip name, e.g. `ESP32-D0WD-V3`
    pub chip_name: String,
    /// Major silicon revision
    pub revision: u8,
    /// Feature list reported by the ROM
    pub features: Vec<String>,
    /// Crystal frequency in MHz
    pub crystal_mhz: Option<u32>,
    /// MAC address
    pub mac: Option<String>,
    /// Detected flash size label, e.g. `4MB`
    pub flash_size: Option<String>,
}

impl Esp32ChipInfo {
    pub fn has_psram(&self) -> bool {
        self.features
            .iter()
            .any(|f| f.to_uppercase().contains("PSRAM"))
    }
}

/// Guess the name of the reference target matching a connected ESP32.
///
/// This is a fixed decision table against the strings esptool reports; user
/// scripts rely on the exact names it returns.
pub fn guess_esp32_target(info: &Esp32ChipInfo) -> Result<String, Error> {
    let chip_type = info.chip_type.to_uppercase();
    let chip_name = info.chip_name.to_uppercase();

    let target = match chip_type.as_str() {
        "ESP32" if chip_name.contains("PICO") => "ESP32_PICO",
        "ESP32" => match (info.has_psram(), info.crystal_mhz, info.revision >= 3) {
            (true, Some(26), _) => "ESP32_PSRAM_XTAL26_REV0",
            (true, _, true) => "ESP32_PSRAM_REV3",
            (true, _, false) => "ESP32_PSRAM_REV0",
            (false, _, true) => "ESP32_REV3",
            (false, _, false) => "ESP32_REV0",
        },
        "ESP32-S2" => "ESP32_S2",
        "ESP32-S3" if info.has_psram() => "ESP32_S3_ALL",
        "ESP32-S3" => "ESP32_S3",
        "ESP32-C3" if info.revision >= 3 => "ESP32_C3_REV3",
        "ESP32-C3" => "ESP32_C3",
        "ESP32-C6" => "ESP32_C6_THREAD",
        "ESP32-H2" => "ESP32_H2_THREAD",
        _ => return Err(Error::ChipDetect(info.chip_type.clone())),
    };

    Ok(target.to_owned())
}
