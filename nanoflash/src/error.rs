//! Library and application errors
//!
//! Every terminal [Error] maps onto exactly one numbered [ExitCode]. The
//! numbers are grouped by subsystem and are stable, user-facing values:
//!
//! - `1xxx` DFU
//! - `2xxx` live device (debug wire protocol)
//! - `4xxx` esptool
//! - `5xxx` STM32 Programmer CLI / JTAG, flash plan validation
//! - `6xxx` serial ports
//! - `7xxx` TI Uniflash / XDS110
//! - `8xxx` J-Link
//! - `9xxx` general and package handling

use std::{io, path::PathBuf};

use miette::Diagnostic;
use strum::{Display, VariantNames};
use thiserror::Error;

use crate::targets::FlashSize;

/// All possible errors returned by nanoflash
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("No firmware package found for target '{target}' ({})", .version.as_deref().unwrap_or("latest"))]
    #[diagnostic(
        code(nanoflash::package_not_found),
        help("Check the target name with `nanoflash list-targets`, or drop `--fw-version` to use the latest version")
    )]
    PackageNotFound {
        target: String,
        version: Option<String>,
    },

    #[error("Firmware archive '{}' could not be found", .0.display())]
    #[diagnostic(
        code(nanoflash::archive_not_found),
        help("When using `--archive-path` the package must already be present in the archive directory")
    )]
    ArchiveNotFound(PathBuf),

    #[error("Package index returned '{found}' when '{requested}' was requested")]
    #[diagnostic(code(nanoflash::package_name_mismatch))]
    PackageNameMismatch { requested: String, found: String },

    #[error("Failed to query the package repository: {0}")]
    #[diagnostic(
        code(nanoflash::index_query),
        help("Check your internet connection, or use `--archive-path` to work offline")
    )]
    IndexQuery(String),

    #[error("Failed to download '{url}': {reason}")]
    #[diagnostic(
        code(nanoflash::download_failed),
        help("Check your internet connection. Previously downloaded packages can be used with `--use-existing`")
    )]
    DownloadFailed { url: String, reason: String },

    #[error("Failed to extract firmware package")]
    #[diagnostic(code(nanoflash::extract))]
    Extract(#[from] zip::result::ZipError),

    #[error("Invalid Intel HEX file '{}': {reason}", .path.display())]
    #[diagnostic(code(nanoflash::invalid_hex))]
    InvalidHex { path: PathBuf, reason: String },

    #[error("Invalid partition table '{}': {reason}", .path.display())]
    #[diagnostic(code(nanoflash::invalid_partition_table))]
    InvalidPartitionTable { path: PathBuf, reason: String },

    #[error("Invalid package version '{0}'")]
    #[diagnostic(code(nanoflash::invalid_version))]
    InvalidVersion(String, #[source] semver::Error),

    #[error("The flash size '{0}' is not supported by this target")]
    #[diagnostic(
        code(nanoflash::unsupported_flash_size),
        help("The supported values are: {:?}", FlashSize::VARIANTS)
    )]
    UnsupportedFlashSize(String),

    #[error("Invalid flash address '{0}'")]
    #[diagnostic(
        code(nanoflash::invalid_address),
        help("Addresses must be given as `0x` prefixed hexadecimal numbers, e.g. `0x08000000`")
    )]
    InvalidAddress(String),

    #[error("Target '{0}' has no default deployment address")]
    #[diagnostic(
        code(nanoflash::no_deployment_address),
        help("Pass the address of the deployment region with `--address`")
    )]
    MissingDeploymentAddress(String),

    #[error("Flash address {0:#010x} is used more than once")]
    #[diagnostic(code(nanoflash::duplicate_address))]
    DuplicateAddress(u32),

    #[error("{files} file(s) were given but {addresses} address(es)")]
    #[diagnostic(
        code(nanoflash::address_count_mismatch),
        help("Provide exactly one `--address` for each binary file")
    )]
    AddressCountMismatch { addresses: usize, files: usize },

    #[error("File '{}' could not be found", .0.display())]
    #[diagnostic(code(nanoflash::file_not_found))]
    FileNotFound(PathBuf),

    #[error("No {0} device could be detected")]
    #[diagnostic(
        code(nanoflash::no_device),
        help("Make sure you have connected a device to the host system and that the drivers are installed")
    )]
    DeviceNotFound(Transport),

    #[error("The {transport} device '{id}' could not be found")]
    #[diagnostic(
        code(nanoflash::device_not_found),
        help("List the connected devices and check the requested id")
    )]
    DeviceIdNotFound { transport: Transport, id: String },

    #[error("{stage} failed on {transport} device: {message}")]
    #[diagnostic(code(nanoflash::tool_failed))]
    ToolFailed {
        transport: Transport,
        stage: Stage,
        message: String,
    },

    #[error("Failed to run '{program}'")]
    #[diagnostic(
        code(nanoflash::tool_launch),
        help("Make sure the tool is installed, or set its path in the `[tools]` section of nanoflash.toml")
    )]
    ToolLaunch {
        transport: Transport,
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("J-Link can't handle the path '{}'", .0.display())]
    #[diagnostic(
        code(nanoflash::unsupported_path),
        help("Move the file to a path without spaces or diacritics")
    )]
    UnsupportedPath(PathBuf),

    #[error("Unable to determine the platform of target '{0}'")]
    #[diagnostic(
        code(nanoflash::unknown_platform),
        help("Pass the platform explicitly with `--platform`")
    )]
    UnknownPlatform(String),

    #[error("Unable to determine the target for the connected {0}")]
    #[diagnostic(
        code(nanoflash::chip_detect),
        help("Specify the target explicitly with `--target`")
    )]
    ChipDetect(String),

    #[error("Failed to connect to the device")]
    #[diagnostic(
        code(nanoflash::wire_connect),
        help("Ensure that the device is running and not in use by another debugger")
    )]
    WireConnect,

    #[error("Device did not leave its initialize state after {0} attempts")]
    #[diagnostic(
        code(nanoflash::device_busy),
        help("Power cycle the device and try again")
    )]
    DeviceBusy(usize),

    #[error("Device expects the interpreter at {device:#010x} but the package places it at {package:#010x}")]
    #[diagnostic(
        code(nanoflash::address_mismatch),
        help("Update nanoBooter with a full firmware update before updating the interpreter")
    )]
    InterpreterAddressMismatch { device: u32, package: u32 },

    #[error("Device doesn't report where it expects the interpreter, the package places it at {0:#010x}")]
    #[diagnostic(
        code(nanoflash::address_unknown),
        help("Update nanoBooter with a full firmware update before updating the interpreter")
    )]
    InterpreterAddressUnknown(u32),

    #[error("Failed to deploy to the device: {0}")]
    #[diagnostic(code(nanoflash::wire_deploy))]
    WireDeploy(String),

    #[error("{failed} of {total} storage file operation(s) failed")]
    #[diagnostic(code(nanoflash::partial_failure))]
    PartialFailure { failed: usize, total: usize },

    #[error("Invalid file deployment descriptor")]
    #[diagnostic(code(nanoflash::deployment_descriptor))]
    DeploymentDescriptor(#[from] serde_json::Error),

    #[error("{operation} is not supported for {platform} targets")]
    #[diagnostic(code(nanoflash::unsupported_operation))]
    UnsupportedOperation {
        platform: String,
        operation: &'static str,
    },

    #[error(transparent)]
    #[diagnostic(code(nanoflash::io))]
    Io(#[from] io::Error),
}

/// Device transports a [crate::session::DeviceSession] can drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Transport {
    #[strum(serialize = "serial")]
    Serial,
    #[strum(serialize = "JTAG")]
    Jtag,
    #[strum(serialize = "DFU")]
    Dfu,
    #[strum(serialize = "J-Link")]
    JLink,
    #[strum(serialize = "XDS110")]
    Xds110,
}

/// The step of a flashing sequence an error originates from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Stage {
    #[strum(serialize = "Command")]
    Execute,
    #[strum(serialize = "Mass erase")]
    Erase,
    #[strum(serialize = "Write")]
    Write,
    #[strum(serialize = "Flash read")]
    Read,
}

/// Coarse classification of errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ErrorKind {
    NotFound,
    DownloadFailed,
    FormatError,
    DeviceNotPresent,
    DeviceMismatch,
    ToolExecutionFailed,
    Timeout,
    PartialFailure,
    InvalidArgument,
    Io,
}

/// Numbered process exit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[repr(u16)]
pub enum ExitCode {
    #[strum(serialize = "OK")]
    Ok = 0,

    E1000 = 1000,
    E1001 = 1001,
    E1003 = 1003,
    E1005 = 1005,

    E2000 = 2000,
    E2001 = 2001,
    E2002 = 2002,
    E2003 = 2003,
    E2004 = 2004,
    E2005 = 2005,

    E4000 = 4000,
    E4001 = 4001,
    E4002 = 4002,
    E4003 = 4003,
    E4004 = 4004,
    E4005 = 4005,

    E5000 = 5000,
    E5001 = 5001,
    E5002 = 5002,
    E5003 = 5003,
    E5004 = 5004,
    E5007 = 5007,
    E5008 = 5008,
    E5009 = 5009,

    E6000 = 6000,
    E6001 = 6001,

    E7000 = 7000,
    E7001 = 7001,
    E7002 = 7002,
    E7003 = 7003,

    E8000 = 8000,
    E8001 = 8001,
    E8002 = 8002,
    E8003 = 8003,
    E8004 = 8004,

    E9000 = 9000,
    E9001 = 9001,
    E9002 = 9002,
    E9003 = 9003,
    E9004 = 9004,
    E9005 = 9005,
    E9006 = 9006,
    E9007 = 9007,
    E9008 = 9008,
    E9009 = 9009,
}

impl ExitCode {
    /// The numeric value handed to the operating system
    pub fn code(self) -> i32 {
        self as u16 as i32
    }

    /// Fixed human readable description of the exit code
    pub fn message(self) -> &'static str {
        use ExitCode::*;

        match self {
            Ok => "Operation completed successfully",

            E1000 => "Error executing DFU command",
            E1001 => "No DFU device found",
            E1003 => "Error flashing DFU device",
            E1005 => "Can't connect to specified DFU device",

            E2000 => "Error executing operation with device",
            E2001 => "Error connecting to device",
            E2002 => "Error deploying binary to device",
            E2003 => "Device remained busy in its initialize state",
            E2004 => "Interpreter address mismatch, nanoBooter update required",
            E2005 => "Some storage file operations failed",

            E4000 => "Error executing esptool command",
            E4001 => "Unsupported flash size for ESP32 target",
            E4002 => "Failed to erase ESP32 flash",
            E4003 => "Failed to write new firmware to ESP32",
            E4004 => "Can't read flash of ESP32",
            E4005 => "Can't determine target for connected ESP32",

            E5000 => "Error executing STM32 Programmer CLI command",
            E5001 => "No JTAG device found",
            E5002 => "Can't connect to specified JTAG device",
            E5003 => "Error mass erasing STM32 device",
            E5004 => "Error writing firmware to STM32 device",
            E5007 => "Invalid flash address",
            E5008 => "Duplicate flash address",
            E5009 => "Address count doesn't match file count",

            E6000 => "Couldn't find serial port",
            E6001 => "Can't open serial port",

            E7000 => "Error executing Uniflash command",
            E7001 => "Error flashing TI device",
            E7002 => "No XDS110 probe found",
            E7003 => "Can't connect to specified XDS110 probe",

            E8000 => "Error executing J-Link command",
            E8001 => "No J-Link device found",
            E8002 => "Can't connect to specified J-Link device",
            E8003 => "Error flashing J-Link device",
            E8004 => "File path not supported by J-Link",

            E9000 => "Invalid or missing arguments",
            E9001 => "File system error",
            E9002 => "Error extracting firmware package",
            E9003 => "Malformed firmware file",
            E9004 => "Error downloading firmware package",
            E9005 => "Couldn't find firmware package for target",
            E9006 => "Package target name doesn't match requested target",
            E9007 => "Couldn't find file",
            E9008 => "Error querying package repository",
            E9009 => "Operation not supported for target platform",
        }
    }
}

impl Error {
    /// Numbered exit code reported to the user for this error
    pub fn exit_code(&self) -> ExitCode {
        use Transport::*;

        match self {
            Error::PackageNotFound { .. } | Error::ArchiveNotFound(_) => ExitCode::E9005,
            Error::PackageNameMismatch { .. } => ExitCode::E9006,
            Error::IndexQuery(_) => ExitCode::E9008,
            Error::DownloadFailed { .. } => ExitCode::E9004,
            Error::Extract(_) => ExitCode::E9002,
            Error::InvalidHex { .. } | Error::InvalidPartitionTable { .. } => ExitCode::E9003,
            Error::InvalidVersion(..) => ExitCode::E9000,
            Error::UnsupportedFlashSize(_) => ExitCode::E4001,
            Error::InvalidAddress(_) => ExitCode::E5007,
            Error::MissingDeploymentAddress(_) | Error::UnknownPlatform(_) => ExitCode::E9000,
            Error::DuplicateAddress(_) => ExitCode::E5008,
            Error::AddressCountMismatch { .. } => ExitCode::E5009,
            Error::FileNotFound(_) => ExitCode::E9007,
            Error::DeviceNotFound(transport) => match transport {
                Serial => ExitCode::E6000,
                Jtag => ExitCode::E5001,
                Dfu => ExitCode::E1001,
                JLink => ExitCode::E8001,
                Xds110 => ExitCode::E7002,
            },
            Error::DeviceIdNotFound { transport, .. } => match transport {
                Serial => ExitCode::E6000,
                Jtag => ExitCode::E5002,
                Dfu => ExitCode::E1005,
                JLink => ExitCode::E8002,
                Xds110 => ExitCode::E7003,
            },
            Error::ToolFailed {
                transport, stage, ..
            } => match (transport, stage) {
                (Serial, Stage::Execute) => ExitCode::E4000,
                (Serial, Stage::Erase) => ExitCode::E4002,
                (Serial, Stage::Write) => ExitCode::E4003,
                (Serial, Stage::Read) => ExitCode::E4004,
                (Jtag, Stage::Erase) => ExitCode::E5003,
                (Jtag, Stage::Write) => ExitCode::E5004,
                (Jtag, _) => ExitCode::E5000,
                (Dfu, Stage::Execute) => ExitCode::E1000,
                (Dfu, _) => ExitCode::E1003,
                (JLink, Stage::Execute) => ExitCode::E8000,
                (JLink, _) => ExitCode::E8003,
                (Xds110, Stage::Execute) => ExitCode::E7000,
                (Xds110, _) => ExitCode::E7001,
            },
            Error::ToolLaunch { transport, .. } => match transport {
                Serial => ExitCode::E4000,
                Jtag => ExitCode::E5000,
                Dfu => ExitCode::E1000,
                JLink => ExitCode::E8000,
                Xds110 => ExitCode::E7000,
            },
            Error::UnsupportedPath(_) => ExitCode::E8004,
            Error::ChipDetect(_) => ExitCode::E4005,
            Error::WireConnect => ExitCode::E2001,
            Error::DeviceBusy(_) => ExitCode::E2003,
            Error::InterpreterAddressMismatch { .. } | Error::InterpreterAddressUnknown(_) => {
                ExitCode::E2004
            }
            Error::WireDeploy(_) => ExitCode::E2002,
            Error::PartialFailure { .. } => ExitCode::E2005,
            Error::DeploymentDescriptor(_) => ExitCode::E9000,
            Error::UnsupportedOperation { .. } => ExitCode::E9009,
            Error::Io(_) => ExitCode::E9001,
        }
    }

    /// Coarse classification of the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::PackageNotFound { .. } | Error::ArchiveNotFound(_) | Error::FileNotFound(_) => {
                ErrorKind::NotFound
            }
            Error::IndexQuery(_) | Error::DownloadFailed { .. } => ErrorKind::DownloadFailed,
            Error::Extract(_)
            | Error::InvalidHex { .. }
            | Error::InvalidPartitionTable { .. }
            | Error::DeploymentDescriptor(_) => ErrorKind::FormatError,
            Error::DeviceNotFound(_) | Error::WireConnect => ErrorKind::DeviceNotPresent,
            Error::DeviceIdNotFound { .. }
            | Error::PackageNameMismatch { .. }
            | Error::InterpreterAddressMismatch { .. }
            | Error::InterpreterAddressUnknown(_)
            | Error::ChipDetect(_) => ErrorKind::DeviceMismatch,
            Error::ToolFailed { .. }
            | Error::ToolLaunch { .. }
            | Error::UnsupportedPath(_)
            | Error::WireDeploy(_) => ErrorKind::ToolExecutionFailed,
            Error::DeviceBusy(_) => ErrorKind::Timeout,
            Error::PartialFailure { .. } => ErrorKind::PartialFailure,
            Error::InvalidVersion(..)
            | Error::UnsupportedFlashSize(_)
            | Error::InvalidAddress(_)
            | Error::MissingDeploymentAddress(_)
            | Error::UnknownPlatform(_)
            | Error::DuplicateAddress(_)
            | Error::AddressCountMismatch { .. }
            | Error::UnsupportedOperation { .. } => ErrorKind::InvalidArgument,
            Error::Io(_) => ErrorKind::Io,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_transport() {
        let err = Error::DeviceIdNotFound {
            transport: Transport::Jtag,
            id: "066CFF535752877167012515".into(),
        };
        assert_eq!(err.exit_code(), ExitCode::E5002);
        assert_eq!(err.exit_code().code(), 5002);
        assert_eq!(err.kind(), ErrorKind::DeviceMismatch);

        let err = Error::DeviceNotFound(Transport::JLink);
        assert_eq!(err.exit_code(), ExitCode::E8001);
    }

    #[test]
    fn exit_code_display() {
        assert_eq!(ExitCode::E5009.to_string(), "E5009");
        assert_eq!(ExitCode::Ok.to_string(), "OK");
        assert_eq!(
            ExitCode::E5009.message(),
            "Address count doesn't match file count"
        );
    }
}
