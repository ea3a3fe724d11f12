//! Espressif `esptool`
//!
//! Output markers:
//!
//! - write: `Hash of data verified`
//! - mass erase: `Chip erase completed successfully`
//! - read: `Read N bytes at 0x...`
//! - reset: `Hard resetting`
//!
//! Chips switched into download mode through their USB peripheral report
//! `can not exit the download mode over USB` and exit non-zero. The write
//! itself succeeded, the operator only has to reset the board.

use std::{
    path::{Path, PathBuf},
    sync::LazyLock,
};

use regex::Regex;

use super::{Invocation, ToolOutcome, ToolOutput, ToolRunner};
use crate::{
    error::{Error, Stage, Transport},
    session::FlashTransport,
    targets::Esp32ChipInfo,
};

const WRITE_MARKER: &str = "Hash of data verified";
const ERASE_MARKER: &str = "Chip erase completed successfully";
const RESET_MARKER: &str = "Hard resetting";
const USB_DOWNLOAD_MODE: &str = "can not exit the download mode over USB";

pub const DEFAULT_BAUD: u32 = 921_600;

static RE_DETECTING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Detecting chip type\.*\s*(ESP32[-\w]*)").unwrap());
static RE_CHIP_IS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Chip is (ESP32[-\w]*)(?:\s*\([^)]*\))*?\s*\(revision v?(\d+)").unwrap()
});
static RE_FEATURES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"Features:\s*(.+)").unwrap());
static RE_CRYSTAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Crystal is (\d+)MHz").unwrap());
static RE_MAC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"MAC:\s*([0-9a-fA-F:]{17})").unwrap());
static RE_FLASH_SIZE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Detected flash size:\s*(\w+)").unwrap());
static RE_READ: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Read \d+ bytes at 0x[0-9a-fA-F]+").unwrap());

/// esptool driven over a serial port
pub struct Esptool<R> {
    runner: R,
    program: PathBuf,
    ports: Vec<String>,
    baud: u32,
}

impl<R: ToolRunner> Esptool<R> {
    /// `ports` are the serial ports a device may be connected to, in the
    /// order they should be tried
    pub fn new(runner: R, program: impl Into<PathBuf>, ports: Vec<String>) -> Self {
        Self {
            runner,
            program: program.into(),
            ports,
            baud: DEFAULT_BAUD,
        }
    }

    pub fn with_baud(mut self, baud: u32) -> Self {
        self.baud = baud;
        self
    }

    fn invoke(&self, port: &str, after: &str, command: &[String]) -> Result<ToolOutput, Error> {
        let mut args = vec![
            "--chip".to_owned(),
            "auto".to_owned(),
            "--port".to_owned(),
            port.to_owned(),
            "--baud".to_owned(),
            self.baud.to_string(),
            "--before".to_owned(),
            "default_reset".to_owned(),
            "--after".to_owned(),
            after.to_owned(),
        ];
        args.extend_from_slice(command);

        let invocation = Invocation::new(&self.program, args).watch_connect();

        self.runner
            .run(&invocation)
            .map_err(|source| Error::ToolLaunch {
                transport: Transport::Serial,
                program: self.program.display().to_string(),
                source,
            })
    }

    /// Read the chip details of the device on `port`
    pub fn chip_info(&self, port: &str) -> Result<Esp32ChipInfo, Error> {
        let output = self.invoke(port, "no_reset", &["flash_id".to_owned()])?;

        parse_chip_info(&output.text).ok_or_else(|| Error::ToolFailed {
            transport: Transport::Serial,
            stage: Stage::Execute,
            message: output.failure_summary(),
        })
    }

    /// Save `size` bytes of flash at `address` into `file`
    pub fn read_flash(&self, port: &str, address: u32, size: u32, file: &Path) -> Result<(), Error> {
        let output = self.invoke(
            port,
            "no_reset",
            &[
                "read_flash".to_owned(),
                format!("{address:#x}"),
                format!("{size:#x}"),
                file.display().to_string(),
            ],
        )?;

        classify_read(&output).into_result(Transport::Serial, Stage::Read)
    }
}

impl<R: ToolRunner> FlashTransport for Esptool<R> {
    fn transport(&self) -> Transport {
        Transport::Serial
    }

    fn list_devices(&self) -> Result<Vec<String>, Error> {
        Ok(self.ports.clone())
    }

    fn mass_erase(&self, device: &str) -> Result<ToolOutcome, Error> {
        let output = self.invoke(device, "no_reset", &["erase_flash".to_owned()])?;
        Ok(classify_erase(&output))
    }

    fn write(&self, device: &str, address: u32, file: &Path) -> Result<ToolOutcome, Error> {
        let output = self.invoke(
            device,
            "no_reset",
            &[
                "write_flash".to_owned(),
                "-z".to_owned(),
                "--flash_mode".to_owned(),
                "dio".to_owned(),
                "--flash_freq".to_owned(),
                "40m".to_owned(),
                "--flash_size".to_owned(),
                "detect".to_owned(),
                format!("{address:#x}"),
                file.display().to_string(),
            ],
        )?;

        Ok(classify_write(&output))
    }

    fn reset(&self, device: &str) -> Result<ToolOutcome, Error> {
        let output = self.invoke(device, "hard_reset", &["read_mac".to_owned()])?;
        Ok(classify_reset(&output))
    }
}

fn usb_download_mode_warning() -> ToolOutcome {
    ToolOutcome::SuccessWithWarning(
        "The device can't leave download mode by itself, press its RESET button to start the new firmware"
            .into(),
    )
}

/// The marker is required; the USB download mode notice only excuses a
/// non-zero exit status
pub fn classify_write(output: &ToolOutput) -> ToolOutcome {
    if !output.contains(WRITE_MARKER) {
        ToolOutcome::Failure(output.failure_summary())
    } else if output.contains(USB_DOWNLOAD_MODE) {
        usb_download_mode_warning()
    } else {
        ToolOutcome::Success
    }
}

pub fn classify_erase(output: &ToolOutput) -> ToolOutcome {
    if output.contains(ERASE_MARKER) {
        ToolOutcome::Success
    } else {
        ToolOutcome::Failure(output.failure_summary())
    }
}

pub fn classify_read(output: &ToolOutput) -> ToolOutcome {
    if RE_READ.is_match(&output.text) {
        ToolOutcome::Success
    } else {
        ToolOutcome::Failure(output.failure_summary())
    }
}

/// The marker is required; the USB download mode notice only excuses a
/// non-zero exit status
pub fn classify_reset(output: &ToolOutput) -> ToolOutcome {
    if !output.contains(RESET_MARKER) {
        ToolOutcome::Failure(output.failure_summary())
    } else if output.contains(USB_DOWNLOAD_MODE) {
        usb_download_mode_warning()
    } else {
        ToolOutcome::Success
    }
}

/// Parse the chip details printed by `esptool flash_id`
pub fn parse_chip_info(output: &str) -> Option<Esp32ChipInfo> {
    let chip = RE_CHIP_IS.captures(output)?;
    let chip_name = chip[1].to_owned();
    let revision = chip[2].parse().ok()?;

    let chip_type = RE_DETECTING
        .captures(output)
        .map(|c| c[1].to_owned())
        .unwrap_or_else(|| chip_family(&chip_name));

    let features = RE_FEATURES
        .captures(output)
        .map(|c| {
            c[1].split(',')
                .map(|f| f.trim().to_owned())
                .filter(|f| !f.is_empty())
                .collect()
        })
        .unwrap_or_default();

    Some(Esp32ChipInfo {
        chip_type,
        chip_name,
        revision,
        features,
        crystal_mhz: RE_CRYSTAL
            .captures(output)
            .and_then(|c| c[1].parse().ok()),
        mac: RE_MAC.captures(output).map(|c| c[1].to_lowercase()),
        flash_size: RE_FLASH_SIZE.captures(output).map(|c| c[1].to_owned()),
    })
}

/// `ESP32-D0WD-V3` → `ESP32`, `ESP32-S3` → `ESP32-S3`
fn chip_family(chip_name: &str) -> String {
    let upper = chip_name.to_uppercase();

    ["ESP32-S2", "ESP32-S3", "ESP32-C3", "ESP32-C6", "ESP32-H2"]
        .into_iter()
        .find(|family| upper.starts_with(family))
        .unwrap_or("ESP32")
        .to_owned()
}
