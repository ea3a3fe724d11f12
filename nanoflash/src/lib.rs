//! Fetch firmware packages and flash them onto ESP32, STM32, TI and Silabs
//! boards.
//!
//! ## As an application
//!
//! [nanoflash] can be installed using `cargo install`, and additionally
//! supports installation via [cargo-binstall]:
//!
//! ```bash
//! $ cargo install nanoflash
//! $ cargo binstall nanoflash
//! ```
//!
//! ## As a library
//!
//! [nanoflash] can be used as a library in other applications:
//!
//! ```toml
//! nanoflash = { version = "0.1", default-features = false }
//! ```
//!
//! We add `default-features` here to disable the `cli` feature, which is
//! enabled by default. Its important to note that the cli module does not
//! provide SemVer guarantees.
//!
//! The library drives the firmware pipeline end to end:
//! [package::PackageResolver] picks a package, [package::PackageFetcher]
//! downloads and extracts it, [flash_plan] maps its files to flash addresses
//! and [session::DeviceSession] writes them through one of the vendor tools
//! in [tools]. Devices already running firmware are updated through
//! [wire::DeviceWireSession].
//!
//! [nanoflash]: https://crates.io/crates/nanoflash
//! [cargo-binstall]: https://github.com/cargo-bins/cargo-binstall

#![cfg_attr(docsrs, feature(doc_cfg))]

pub use self::error::{Error, ErrorKind, ExitCode, Stage, Transport};

#[cfg(feature = "cli")]
#[cfg_attr(docsrs, doc(cfg(feature = "cli")))]
pub mod cli;
pub mod deploy;
pub mod error;
pub mod flash_plan;
pub mod ihex;
pub mod package;
pub mod progress;
pub mod session;
pub mod targets;
pub mod tools;
pub mod wire;

/// Logging utilities
#[cfg(feature = "cli")]
#[cfg_attr(docsrs, doc(cfg(feature = "cli")))]
pub mod logging {
    use env_logger::Env;
    use log::LevelFilter;

    /// Initialize the logger with the given [LevelFilter], `RUST_LOG` takes
    /// precedence when set
    pub fn initialize_logger(filter: LevelFilter) {
        env_logger::Builder::from_env(Env::default().default_filter_or(filter.as_str()))
            .format_target(false)
            .init();
    }
}
