//! Flashing a device through a vendor tool
//!
//! A [DeviceSession] drives one [FlashTransport] through
//! `Disconnected → Identified → (MassErasing) → Writing → Verified →
//! (Resetting) → Done`. Any failure moves it to [SessionState::Error], which
//! it never leaves.

use std::path::Path;

use log::{debug, info};

use crate::{
    error::{Error, Stage, Transport},
    flash_plan::FlashPartitionMap,
    progress::ProgressCallbacks,
    tools::ToolOutcome,
};

/// A device transport backed by a vendor tool.
///
/// The methods return `Err` only when the tool could not be run at all; what
/// the tool reported is classified into a [ToolOutcome].
pub trait FlashTransport {
    fn transport(&self) -> Transport;

    /// Ids of the connected devices, in enumeration order
    fn list_devices(&self) -> Result<Vec<String>, Error>;

    fn mass_erase(&self, device: &str) -> Result<ToolOutcome, Error>;

    /// Program `file` at `address` and verify it
    fn write(&self, device: &str, address: u32, file: &Path) -> Result<ToolOutcome, Error>;

    /// Reset the device so it starts the new firmware
    fn reset(&self, device: &str) -> Result<ToolOutcome, Error>;
}

impl<T: FlashTransport + ?Sized> FlashTransport for &T {
    fn transport(&self) -> Transport {
        (**self).transport()
    }

    fn list_devices(&self) -> Result<Vec<String>, Error> {
        (**self).list_devices()
    }

    fn mass_erase(&self, device: &str) -> Result<ToolOutcome, Error> {
        (**self).mass_erase(device)
    }

    fn write(&self, device: &str, address: u32, file: &Path) -> Result<ToolOutcome, Error> {
        (**self).write(device, address, file)
    }

    fn reset(&self, device: &str) -> Result<ToolOutcome, Error> {
        (**self).reset(device)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Disconnected,
    Identified,
    MassErasing,
    Writing,
    Verified,
    Resetting,
    Done,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionOptions {
    /// Device to use; the first enumerated device when `None`
    pub device_id: Option<String>,
    /// Erase the whole flash before the first write
    pub mass_erase: bool,
    /// Reset the device after a successful write sequence
    pub reset: bool,
}

pub struct DeviceSession<T> {
    transport: T,
    state: SessionState,
    device: Option<String>,
    requested_device: Option<String>,
    mass_erase_pending: bool,
    reset: bool,
}

impl<T: FlashTransport> DeviceSession<T> {
    pub fn new(transport: T, options: SessionOptions) -> Self {
        Self {
            transport,
            state: SessionState::Disconnected,
            device: None,
            requested_device: options.device_id,
            mass_erase_pending: options.mass_erase,
            reset: options.reset,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Id of the identified device
    pub fn device(&self) -> Option<&str> {
        self.device.as_deref()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn fail(&mut self, err: Error) -> Error {
        self.state = SessionState::Error;
        err
    }

    fn ensure_usable(&self) -> Result<(), Error> {
        if self.state == SessionState::Error {
            return Err(Error::ToolFailed {
                transport: self.transport.transport(),
                stage: Stage::Execute,
                message: "a previous step of this session failed".into(),
            });
        }

        Ok(())
    }

    /// Pick the device to flash. A requested device must be connected, it is
    /// never replaced by another one.
    pub fn identify(&mut self) -> Result<String, Error> {
        self.ensure_usable()?;

        if let Some(device) = &self.device {
            return Ok(device.clone());
        }

        let transport = self.transport.transport();
        let devices = self
            .transport
            .list_devices()
            .map_err(|e| self.fail(e))?;
        debug!("Connected {transport} devices: {devices:?}");

        let device = match &self.requested_device {
            Some(id) => devices
                .into_iter()
                .find(|d| d.eq_ignore_ascii_case(id))
                .ok_or_else(|| Error::DeviceIdNotFound {
                    transport,
                    id: id.clone(),
                }),
            None => devices
                .into_iter()
                .next()
                .ok_or(Error::DeviceNotFound(transport)),
        }
        .map_err(|e| self.fail(e))?;

        info!("Using {transport} device {device}");

        self.device = Some(device.clone());
        self.state = SessionState::Identified;
        Ok(device)
    }

    fn run_step(
        &mut self,
        stage: Stage,
        step: impl FnOnce(&T, &str) -> Result<ToolOutcome, Error>,
    ) -> Result<(), Error> {
        let device = self.identify()?;
        let transport = self.transport.transport();

        step(&self.transport, &device)
            .and_then(|outcome| outcome.into_result(transport, stage))
            .map_err(|e| self.fail(e))
    }

    /// Write every entry of `map`, in order. The first failed write ends the
    /// session.
    pub fn flash(
        &mut self,
        map: &FlashPartitionMap,
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error> {
        self.identify()?;

        if self.mass_erase_pending {
            info!("Mass erasing device");
            self.state = SessionState::MassErasing;
            self.run_step(Stage::Erase, |t, d| t.mass_erase(d))?;
            self.mass_erase_pending = false;
        }

        self.state = SessionState::Writing;
        progress.init(Some(map.len() as u64));

        for (index, (address, file)) in map.iter().enumerate() {
            info!("Writing {} at {address:#010x}", file.display());
            self.run_step(Stage::Write, |t, d| t.write(d, address, file))?;
            progress.update(index as u64 + 1);
        }

        progress.finish();
        self.state = SessionState::Verified;

        if self.reset {
            self.state = SessionState::Resetting;
            self.run_step(Stage::Execute, |t, d| t.reset(d))?;
        }

        self.state = SessionState::Done;
        Ok(())
    }
}
