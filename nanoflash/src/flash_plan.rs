//! Which files get written where
//!
//! A [FlashPartitionMap] pairs flash addresses with the files written there.
//! It is built incrementally: the firmware pieces of a package first, then
//! an optional application image, then an optional backup of the
//! configuration partition. Every check happens while the map is built, so
//! an invalid plan is rejected before any device is contacted.

use std::{
    fs,
    path::{Path, PathBuf},
};

use esp_idf_part::PartitionTable;
use log::debug;

use crate::{
    package::ExtractedFirmwareSet,
    targets::{
        FlashSize, Platform, TargetIdentity, ESP32_CLR_ADDRESS, ESP32_PARTITION_TABLE_ADDRESS,
    },
    Error,
};

/// Name of the configuration partition in the partition tables shipped
/// with ESP32 packages
pub const CONFIG_PARTITION_NAME: &str = "config";

/// Ordered `address → file` pairs written in one flashing operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlashPartitionMap {
    entries: Vec<(u32, PathBuf)>,
}

impl FlashPartitionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `file` at `address`, which must not be used yet
    pub fn insert(&mut self, address: u32, file: impl Into<PathBuf>) -> Result<(), Error> {
        if self.get(address).is_some() {
            return Err(Error::DuplicateAddress(address));
        }

        self.entries.push((address, file.into()));
        Ok(())
    }

    /// Substitute the file at `address`, keeping its slot
    pub fn replace(&mut self, address: u32, file: impl Into<PathBuf>) {
        let file = file.into();

        match self.entries.iter_mut().find(|(a, _)| *a == address) {
            Some(entry) => entry.1 = file,
            None => self.entries.push((address, file)),
        }
    }

    pub fn get(&self, address: u32) -> Option<&Path> {
        self.entries
            .iter()
            .find(|(a, _)| *a == address)
            .map(|(_, f)| f.as_path())
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &Path)> {
        self.entries.iter().map(|(a, f)| (*a, f.as_path()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Parse a `0x` prefixed hexadecimal flash address
pub fn parse_address(address: &str) -> Result<u32, Error> {
    let trimmed = address.trim();

    trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .filter(|digits| !digits.is_empty())
        .and_then(|digits| u32::from_str_radix(digits, 16).ok())
        .ok_or_else(|| Error::InvalidAddress(address.to_owned()))
}

fn existing_file(file: &Path) -> Result<PathBuf, Error> {
    if !file.is_file() {
        return Err(Error::FileNotFound(file.to_owned()));
    }

    Ok(std::path::absolute(file)?)
}

/// Firmware pieces of a package at their fixed addresses.
///
/// ESP32 packages ship binary images written at addresses fixed by the chip
/// family, with the partition table picked by `flash_size`. The other
/// platforms ship Intel HEX images whose load address is recovered from the
/// files themselves.
pub fn firmware(
    target: &TargetIdentity,
    firmware: &ExtractedFirmwareSet,
    flash_size: FlashSize,
) -> Result<FlashPartitionMap, Error> {
    let mut map = FlashPartitionMap::new();

    match target.platform() {
        Platform::Esp32 => {
            if let Some(bootloader) = &firmware.bootloader {
                map.insert(target.esp32_bootloader_address(), bootloader)?;
            }

            let clr = firmware
                .clr_bin
                .as_ref()
                .ok_or_else(|| Error::FileNotFound(firmware.location.join("nanoCLR.bin")))?;
            map.insert(ESP32_CLR_ADDRESS, clr)?;

            let partition_table = firmware
                .partition_table(flash_size)
                .ok_or_else(|| Error::UnsupportedFlashSize(flash_size.to_string()))?;
            map.insert(ESP32_PARTITION_TABLE_ADDRESS, partition_table)?;
        }
        _ => {
            let hex_images = [
                (&firmware.booter_hex, firmware.booter_start_address),
                (&firmware.clr_hex, firmware.clr_start_address),
            ];

            for (file, address) in hex_images {
                if let (Some(file), Some(address)) = (file, address) {
                    map.insert(address, file)?;
                }
            }

            if map.is_empty() {
                return Err(Error::FileNotFound(firmware.location.join("nanoCLR.hex")));
            }
        }
    }

    debug!("Firmware plan: {map:x?}");
    Ok(map)
}

/// Add the application image at `address`, or at the target's default
/// deployment address when none is given
pub fn with_application(
    map: &mut FlashPartitionMap,
    target: &TargetIdentity,
    address: Option<&str>,
    file: &Path,
) -> Result<(), Error> {
    let address = match address {
        Some(address) => parse_address(address)?,
        None => target
            .default_deployment_address()
            .ok_or_else(|| Error::MissingDeploymentAddress(target.target_name().to_owned()))?,
    };

    map.insert(address, existing_file(file)?)
}

/// Application-only deployment: one address per file
pub fn application_only<A, F>(addresses: &[A], files: &[F]) -> Result<FlashPartitionMap, Error>
where
    A: AsRef<str>,
    F: AsRef<Path>,
{
    if addresses.len() != files.len() {
        return Err(Error::AddressCountMismatch {
            addresses: addresses.len(),
            files: files.len(),
        });
    }

    let mut map = FlashPartitionMap::new();
    for (address, file) in addresses.iter().zip(files) {
        map.insert(parse_address(address.as_ref())?, existing_file(file.as_ref())?)?;
    }

    Ok(map)
}

/// Deployment plan of the `deploy` command: a single image without an
/// address goes to the default deployment address of `target`, otherwise
/// every image needs its own address.
pub fn deployment<A, F>(
    target: Option<&TargetIdentity>,
    addresses: &[A],
    files: &[F],
) -> Result<FlashPartitionMap, Error>
where
    A: AsRef<str>,
    F: AsRef<Path>,
{
    match (target, addresses, files) {
        (Some(target), [], [file]) => {
            let mut map = FlashPartitionMap::new();
            with_application(&mut map, target, None, file.as_ref())?;
            Ok(map)
        }
        _ => application_only(addresses, files),
    }
}

/// Substitute a local interpreter image for the one from the package. The
/// override always takes the slot of the interpreter at `clr_address`.
pub fn override_clr(
    map: &mut FlashPartitionMap,
    clr_address: u32,
    file: &Path,
) -> Result<(), Error> {
    let file = existing_file(file)?;

    if let Some(previous) = map.get(clr_address) {
        debug!("Replacing {} with {}", previous.display(), file.display());
    }

    map.replace(clr_address, file);
    Ok(())
}

/// Region of flash holding the configuration of a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigBackup {
    pub address: u32,
    pub size: u32,
    /// Where the contents are saved before flashing
    pub file: PathBuf,
}

/// Locate the configuration partition in a partition table CSV
pub fn config_partition(csv: &Path) -> Result<(u32, u32), Error> {
    let invalid = |reason: String| Error::InvalidPartitionTable {
        path: csv.to_owned(),
        reason,
    };

    let data = fs::read(csv)?;
    let table = PartitionTable::try_from(data).map_err(|e| invalid(e.to_string()))?;

    let partition = table
        .find(CONFIG_PARTITION_NAME)
        .ok_or_else(|| invalid(format!("no '{CONFIG_PARTITION_NAME}' partition")))?;

    Ok((partition.offset(), partition.size()))
}

/// Decide whether the configuration partition is saved before flashing.
///
/// The backup is skipped when the whole flash is erased or the caller opted
/// out. Callers treat an error as "no backup": it must never stop a
/// firmware update.
pub fn plan_config_backup(
    csv: Option<&Path>,
    backup_dir: &Path,
    mass_erase: bool,
    opt_out: bool,
) -> Result<Option<ConfigBackup>, Error> {
    if mass_erase || opt_out {
        return Ok(None);
    }

    let Some(csv) = csv else {
        return Ok(None);
    };

    let (address, size) = config_partition(csv)?;

    Ok(Some(ConfigBackup {
        address,
        size,
        file: backup_dir.join(format!("config_{address:#x}.bin")),
    }))
}
