//! Storage file deployment to a running device
//!
//! A deployment descriptor lists storage files to write or delete:
//!
//! ```json
//! {
//!   "serialport": "COM3",
//!   "files": [
//!     { "DestinationFilePath": "I:\\config.json", "SourceFilePath": "config.json" },
//!     { "DestinationFilePath": "I:\\old.json" }
//!   ]
//! }
//! ```
//!
//! An entry without `SourceFilePath` deletes its destination.

use std::{
    fs,
    path::{Path, PathBuf},
};

use log::{error, info};
use serde::Deserialize;

use crate::{
    error::Error,
    wire::{DebugEngine, DeviceWireSession},
};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FileDeployment {
    /// Serial port of the device, when the descriptor names one
    #[serde(default)]
    pub serialport: Option<String>,
    pub files: Vec<DeploymentEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeploymentEntry {
    pub destination_file_path: String,
    #[serde(default)]
    pub source_file_path: Option<PathBuf>,
}

impl FileDeployment {
    pub fn from_json(json: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a descriptor; relative source paths are taken relative to the
    /// descriptor's directory
    pub fn from_path(path: &Path) -> Result<Self, Error> {
        if !path.is_file() {
            return Err(Error::FileNotFound(path.to_owned()));
        }

        let mut deployment = Self::from_json(&fs::read_to_string(path)?)?;

        if let Some(base) = path.parent() {
            for source in deployment
                .files
                .iter_mut()
                .filter_map(|f| f.source_file_path.as_mut())
            {
                if source.is_relative() {
                    *source = base.join(&*source);
                }
            }
        }

        Ok(deployment)
    }
}

fn deploy_entry<E: DebugEngine>(engine: &mut E, entry: &DeploymentEntry) -> Result<(), Error> {
    match &entry.source_file_path {
        Some(source) => {
            let contents = fs::read(source)?;
            engine.add_storage_file(&entry.destination_file_path, &contents)
        }
        None => engine.delete_storage_file(&entry.destination_file_path),
    }
}

/// Apply every entry of `deployment`. Failed entries are reported and the
/// remaining ones are still applied.
pub fn deploy_files<E: DebugEngine>(
    session: &mut DeviceWireSession<E>,
    deployment: &FileDeployment,
) -> Result<(), Error> {
    session.connect()?;

    let total = deployment.files.len();
    let mut failed = 0;

    for entry in &deployment.files {
        let action = if entry.source_file_path.is_some() {
            "Writing"
        } else {
            "Deleting"
        };
        info!("{action} {}", entry.destination_file_path);

        if let Err(e) = deploy_entry(session.engine_mut(), entry) {
            error!("{action} {} failed: {e}", entry.destination_file_path);
            failed += 1;
        }
    }

    if failed > 0 {
        return Err(Error::PartialFailure { failed, total });
    }

    Ok(())
}
