//! Command-line interface configuration
//!
//! The [Config] type is loaded from `nanoflash.toml`, searched for in the
//! current directory, its parent and finally the user's configuration
//! directory. Every key is optional:
//!
//! ```toml
//! cache_dir = "/var/cache/nanoflash"
//!
//! [index]
//! base_url = "https://api.cloudsmith.io/v1/packages/net-nanoframework"
//! page_size = 100
//!
//! [tools]
//! esptool = "/opt/esptool/esptool"
//! jlink = "/opt/SEGGER/JLink/JLinkExe"
//!
//! [connection]
//! serial = "/dev/ttyUSB0"
//! baud = 921600
//! ```

use std::{
    env,
    fs::read_to_string,
    path::{Path, PathBuf},
};

use directories::ProjectDirs;
use log::debug;
use miette::{IntoDiagnostic, Result, WrapErr};
use serde::{Deserialize, Serialize};

use crate::{
    package::{IndexSettings, PackageSettings},
    Error,
};

const CONFIG_FILE: &str = "nanoflash.toml";

/// A configured, known serial connection
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq, Eq)]
pub struct Connection {
    /// Name of the serial port used for communication
    pub serial: Option<String>,
    /// Baud rate used by esptool
    pub baud: Option<u32>,
}

/// Executables of the vendor tools
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ToolsConfig {
    pub esptool: PathBuf,
    pub stm32_programmer: PathBuf,
    pub jlink: PathBuf,
    pub uniflash: PathBuf,
    pub xdsdfu: PathBuf,
    /// Directory holding `{target}.ccxml` files for TI targets
    pub uniflash_configs: Option<PathBuf>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            esptool: "esptool".into(),
            stm32_programmer: "STM32_Programmer_CLI".into(),
            jlink: if cfg!(windows) { "JLink" } else { "JLinkExe" }.into(),
            uniflash: "dslite".into(),
            xdsdfu: "xdsdfu".into(),
            uniflash_configs: None,
        }
    }
}

/// Deserialized contents of a configuration file
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Root of the package cache
    pub cache_dir: Option<PathBuf>,
    /// Package repository settings
    pub index: IndexSettings,
    /// Vendor tool executables
    pub tools: ToolsConfig,
    /// Preferred serial port connection information
    pub connection: Connection,
}

impl Config {
    /// Load configuration from the configuration file, defaults when there
    /// is none
    pub fn load() -> Result<Self> {
        let file = Self::config_path()?;
        let config = Self::load_from(&file)?;
        debug!("Config: {:#?}", &config);

        Ok(config)
    }

    fn load_from(file: &Path) -> Result<Self> {
        match read_to_string(file) {
            Ok(data) => toml::from_str(&data)
                .into_diagnostic()
                .wrap_err_with(|| format!("Failed to parse {}", file.display())),
            Err(_) => Ok(Config::default()),
        }
    }

    /// Root of the package cache: the configured directory, otherwise the
    /// user's cache directory
    pub fn cache_dir(&self) -> PathBuf {
        if let Some(dir) = &self.cache_dir {
            return dir.clone();
        }

        match Self::project_dirs() {
            Some(dirs) => dirs.cache_dir().to_owned(),
            None => env::temp_dir().join("nanoflash"),
        }
    }

    /// Settings for the package pipeline, taking packages only from
    /// `archive_dir` when given
    pub fn package_settings(&self, archive_dir: Option<PathBuf>) -> PackageSettings {
        PackageSettings {
            cache_dir: self.cache_dir(),
            archive_dir,
            index: self.index.clone(),
        }
    }

    fn project_dirs() -> Option<ProjectDirs> {
        ProjectDirs::from("net", "nanoframework", "nanoflash")
    }

    fn config_path() -> Result<PathBuf, Error> {
        let local_config = env::current_dir()?.join(CONFIG_FILE);
        if local_config.exists() {
            return Ok(local_config);
        }
        if let Some(parent_folder) = env::current_dir()?.parent() {
            let workspace_config = parent_folder.join(CONFIG_FILE);
            if workspace_config.exists() {
                return Ok(workspace_config);
            }
        }

        Ok(match Self::project_dirs() {
            Some(dirs) => dirs.config_dir().join(CONFIG_FILE),
            None => local_config,
        })
    }
}
