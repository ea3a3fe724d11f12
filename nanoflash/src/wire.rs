//! Updating a device that is already running firmware
//!
//! The device is reached through a [DebugEngine], the debug wire protocol
//! engine. This crate ships no engine; callers provide one.

use std::{path::Path, thread, time::Duration};

use log::{debug, info, warn};
use semver::Version;

use crate::error::Error;

/// Number of attempts for connecting and for waiting on the booter
pub const WIRE_RETRIES: usize = 5;

/// What answered a ping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PingReply {
    Booter,
    Clr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RebootMode {
    /// Full reboot into the interpreter
    Normal,
    /// Reboot and stay in the booter
    EnterBooter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeState {
    /// Nothing answered, or the device is still initializing
    Uninitialized,
    RunningBooter,
    RunningInterpreter,
}

/// What a running device reports about itself
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WireDeviceInfo {
    /// Version of the running interpreter, if one is running
    pub clr_version: Option<Version>,
    /// Address the booter loads the interpreter from
    pub clr_start_address: Option<u32>,
}

/// Capabilities of a debug wire protocol engine
pub trait DebugEngine {
    fn connect(&mut self, timeout: Duration) -> Result<(), Error>;

    /// `None` when nothing answered
    fn ping(&mut self) -> Result<Option<PingReply>, Error>;

    fn device_info(&mut self) -> Result<WireDeviceInfo, Error>;

    fn is_device_in_initialize_state(&mut self) -> Result<bool, Error>;

    /// Start execution at `address`
    fn execute_memory(&mut self, address: u32) -> Result<(), Error>;

    fn reboot_device(&mut self, mode: RebootMode) -> Result<(), Error>;

    fn deploy_binary_file(&mut self, file: &Path, address: u32) -> Result<(), Error>;

    fn add_storage_file(&mut self, destination: &str, contents: &[u8]) -> Result<(), Error>;

    fn delete_storage_file(&mut self, destination: &str) -> Result<(), Error>;
}

/// Timing of a [DeviceWireSession]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireOptions {
    /// Timeout of a single connection attempt
    pub connect_timeout: Duration,
    /// Pause between connection attempts
    pub connect_spacing: Duration,
    /// Base wait while polling for the booter, multiplied by the attempt
    /// number
    pub poll_timeout: Duration,
}

impl Default for WireOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            connect_spacing: Duration::from_millis(100),
            poll_timeout: Duration::from_millis(500),
        }
    }
}

/// Interpreter image to write to a running device
#[derive(Debug, Clone, Copy)]
pub enum InterpreterImage<'a> {
    /// The interpreter of a firmware package
    Package {
        version: &'a Version,
        file: &'a Path,
        address: u32,
    },
    /// A local file, written regardless of the running version
    LocalOverride { file: &'a Path, address: u32 },
}

impl InterpreterImage<'_> {
    fn file(&self) -> &Path {
        match *self {
            InterpreterImage::Package { file, .. }
            | InterpreterImage::LocalOverride { file, .. } => file,
        }
    }

    fn address(&self) -> u32 {
        match *self {
            InterpreterImage::Package { address, .. }
            | InterpreterImage::LocalOverride { address, .. } => address,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The running interpreter is as new as the package, nothing was written
    UpToDate,
    Updated,
}

/// Time to wait before the given poll attempt, counted from zero
pub fn poll_backoff(timeout: Duration, attempt: usize) -> Duration {
    timeout * (attempt as u32 + 1)
}

pub struct DeviceWireSession<E> {
    engine: E,
    options: WireOptions,
}

impl<E: DebugEngine> DeviceWireSession<E> {
    pub fn new(engine: E, options: WireOptions) -> Self {
        Self { engine, options }
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn into_engine(self) -> E {
        self.engine
    }

    /// Connect to the device and find out what it is running
    pub fn connect(&mut self) -> Result<RuntimeState, Error> {
        let mut connected = false;

        for attempt in 0..WIRE_RETRIES {
            if attempt > 0 {
                thread::sleep(self.options.connect_spacing);
            }

            match self.engine.connect(self.options.connect_timeout) {
                Ok(()) => {
                    connected = true;
                    break;
                }
                Err(e) => debug!("Connection attempt {} failed: {e}", attempt + 1),
            }
        }

        if !connected {
            return Err(Error::WireConnect);
        }

        self.runtime_state()
    }

    pub fn runtime_state(&mut self) -> Result<RuntimeState, Error> {
        let state = match self.engine.ping()? {
            None => RuntimeState::Uninitialized,
            Some(_) if self.engine.is_device_in_initialize_state()? => RuntimeState::Uninitialized,
            Some(PingReply::Booter) => RuntimeState::RunningBooter,
            Some(PingReply::Clr) => RuntimeState::RunningInterpreter,
        };
        debug!("Device state: {state:?}");

        Ok(state)
    }

    /// Wait with increasing pauses until the booter answers
    fn wait_for_booter(&mut self) -> Result<(), Error> {
        for attempt in 0..WIRE_RETRIES {
            thread::sleep(poll_backoff(self.options.poll_timeout, attempt));

            match self.runtime_state() {
                Ok(RuntimeState::RunningBooter) => return Ok(()),
                Ok(state) => debug!("Waiting for booter, device is {state:?}"),
                Err(e) => debug!("Waiting for booter: {e}"),
            }
        }

        Err(Error::DeviceBusy(WIRE_RETRIES))
    }

    /// Write a new interpreter image through the booter and restart the
    /// device
    pub fn update_interpreter(&mut self, image: InterpreterImage<'_>) -> Result<UpdateOutcome, Error> {
        let state = self.connect()?;
        let info = self.engine.device_info()?;

        if let InterpreterImage::Package { version, .. } = image {
            if let Some(running) = &info.clr_version {
                if version <= running {
                    info!("Device runs {running}, nothing to update");
                    return Ok(UpdateOutcome::UpToDate);
                }
            }
        }

        match info.clr_start_address {
            Some(device) if device == image.address() => {}
            Some(device) => {
                return Err(Error::InterpreterAddressMismatch {
                    device,
                    package: image.address(),
                })
            }
            None => return Err(Error::InterpreterAddressUnknown(image.address())),
        }

        if state != RuntimeState::RunningBooter {
            info!("Rebooting device into nanoBooter");
            if let Err(e) = self.engine.reboot_device(RebootMode::EnterBooter) {
                warn!("Failed to request a reboot into nanoBooter: {e}");
            }
            self.wait_for_booter()?;
        }

        info!(
            "Deploying {} at {:#010x}",
            image.file().display(),
            image.address()
        );
        self.engine
            .deploy_binary_file(image.file(), image.address())
            .map_err(|e| Error::WireDeploy(e.to_string()))?;

        if let Err(e) = self.engine.reboot_device(RebootMode::Normal) {
            warn!("Reboot failed ({e}), starting the interpreter directly");
            self.engine.execute_memory(image.address())?;
        }

        Ok(UpdateOutcome::Updated)
    }
}
