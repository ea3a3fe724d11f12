//! Types and functions for the command-line interface
//!
//! The contents of this module are intended for use with the [nanoflash]
//! command-line application, and are likely not of much use otherwise.
//!
//! Important note: The cli module DOES NOT provide SemVer guarantees,
//! feel free to opt-out by disabling the default `cli` feature.
//!
//! [nanoflash]: https://crates.io/crates/nanoflash

use std::{path::PathBuf, time::Duration};

use chrono::NaiveDate;
use clap::Args;
use comfy_table::{modifiers, presets::UTF8_FULL, Attribute, Cell, Color, Table};
use crossterm::style::Stylize;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use miette::{IntoDiagnostic, Result, WrapErr};
use serialport::SerialPortType;

use self::{
    config::Config,
    serial::{detect_serial_ports, get_serial_port},
};
use crate::{
    error::Error,
    flash_plan::{self, FlashPartitionMap},
    package::{
        obtain_firmware, parse_version, ExtractedFirmwareSet, FetchOptions, HttpDownloader,
        HttpIndex, ListOptions, PackageCache, PackageRequest, PackageResolver,
    },
    progress::ProgressCallbacks,
    session::{DeviceSession, FlashTransport, SessionOptions},
    targets::{
        guess_esp32_target, Esp32ChipInfo, FlashSize, Platform, TargetIdentity, ESP32_CLR_ADDRESS,
    },
    tools::{
        esptool::{Esptool, DEFAULT_BAUD},
        jlink::JLink,
        stm32::{Stm32Link, Stm32Programmer},
        uniflash::Uniflash,
        ProcessRunner, ToolRunner,
    },
};

pub mod config;
mod serial;

/// J-Link device name of the Silabs Giant Gecko 11 boards
pub const DEFAULT_JLINK_DEVICE: &str = "EFM32GG11B820F2048";

/// Firmware package selection
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct PackageArgs {
    /// Name of the target, e.g. `ESP32_PSRAM_REV0`
    #[arg(short = 't', long)]
    pub target: Option<String>,
    /// Exact firmware version, the latest one when omitted
    #[arg(long = "fw-version")]
    pub version: Option<String>,
    /// Use the preview channel
    #[arg(long)]
    pub preview: bool,
    /// Take packages only from this local archive directory
    #[arg(long, env = "NANOFLASH_ARCHIVE_PATH")]
    pub archive_path: Option<PathBuf>,
    /// Use a previously downloaded package when the download fails
    #[arg(long)]
    pub use_existing: bool,
}

/// Device connection
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct DeviceArgs {
    /// Serial port of an ESP32 device
    #[arg(short = 's', long = "serialport")]
    pub serial: Option<String>,
    /// Baud rate used by esptool
    #[arg(short = 'b', long)]
    pub baud: Option<u32>,
    /// Serial number of the probe, or USB index of the DFU device
    #[arg(long)]
    pub device_id: Option<String>,
    /// Update STM32 devices through their USB DFU bootloader
    #[arg(long)]
    pub dfu: bool,
    /// J-Link device name of Silabs targets
    #[arg(long, default_value = DEFAULT_JLINK_DEVICE)]
    pub jlink_device: String,
}

/// Flashing behavior
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct FlashArgs {
    /// Erase the whole flash before writing
    #[arg(long)]
    pub mass_erase: bool,
    /// Leave the device halted after flashing
    #[arg(long)]
    pub no_reset: bool,
}

impl FlashArgs {
    fn session_options(&self, device_id: Option<String>) -> SessionOptions {
        SessionOptions {
            device_id,
            mass_erase: self.mass_erase,
            reset: !self.no_reset,
        }
    }
}

/// Update the firmware of a device
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct UpdateArgs {
    /// Platform of the target, taken from the target name when omitted
    #[arg(long, value_enum, required_unless_present = "target")]
    pub platform: Option<Platform>,
    #[command(flatten)]
    pub package: PackageArgs,
    #[command(flatten)]
    pub device: DeviceArgs,
    #[command(flatten)]
    pub flash: FlashArgs,
    /// Flash size of ESP32 devices, detected when omitted
    #[arg(long, value_enum)]
    pub flash_size: Option<FlashSize>,
    /// Local interpreter image to flash instead of the packaged one
    #[arg(long)]
    pub clr_file: Option<PathBuf>,
    /// Application deployment image to flash with the firmware
    #[arg(long)]
    pub deployment: Option<PathBuf>,
    /// Address of the deployment image, the target's default when omitted
    #[arg(long, requires = "deployment")]
    pub address: Option<String>,
    /// Don't save and restore the configuration partition of ESP32 devices
    #[arg(long)]
    pub no_backup_config: bool,
}

/// Flash application images only
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct DeployArgs {
    /// Platform of the device
    #[arg(long, value_enum)]
    pub platform: Platform,
    /// Target name, picks the default address of a single image and the
    /// UniFlash configuration of TI targets
    #[arg(short = 't', long)]
    pub target: Option<String>,
    /// Image to write, repeat for several images
    #[arg(long = "image", required = true)]
    pub images: Vec<PathBuf>,
    /// Flash address of each image, in the same order as the images. May be
    /// omitted for a single image when `--target` is given
    #[arg(long = "address")]
    pub addresses: Vec<String>,
    #[command(flatten)]
    pub device: DeviceArgs,
    #[command(flatten)]
    pub flash: FlashArgs,
}

/// List the available firmware packages
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct ListTargetsArgs {
    /// Only list targets of this platform
    #[arg(long, value_enum)]
    pub platform: Option<Platform>,
    /// List the preview channel
    #[arg(long)]
    pub preview: bool,
    /// List community targets
    #[arg(long, conflicts_with = "preview")]
    pub community: bool,
    /// List the packages of a local archive directory
    #[arg(long, env = "NANOFLASH_ARCHIVE_PATH")]
    pub archive_path: Option<PathBuf>,
    /// Only list packages uploaded after this date (YYYY-MM-DD)
    #[arg(long)]
    pub uploaded_after: Option<NaiveDate>,
}

/// List the debug probes or DFU devices of a platform
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct ListProbesArgs {
    #[arg(long, value_enum)]
    pub platform: Platform,
    /// List STM32 devices in DFU mode instead of ST-LINK probes
    #[arg(long)]
    pub dfu: bool,
}

/// Show the details of a connected ESP32
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct DeviceDetailsArgs {
    /// Serial port of the device
    #[arg(short = 's', long = "serialport")]
    pub serial: Option<String>,
    /// Baud rate used by esptool
    #[arg(short = 'b', long)]
    pub baud: Option<u32>,
}

/// Progress bar for downloads and flashing
#[derive(Debug, Default)]
pub struct NanoflashProgress {
    message: &'static str,
    pb: Option<ProgressBar>,
}

impl NanoflashProgress {
    pub fn new(message: &'static str) -> Self {
        Self { message, pb: None }
    }
}

impl ProgressCallbacks for NanoflashProgress {
    fn init(&mut self, total: Option<u64>) {
        let pb = match total {
            Some(total) => ProgressBar::new(total).with_style(
                ProgressStyle::default_bar()
                    .template("[{elapsed_precise}] [{bar:40}] {pos:>7}/{len:7} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("=> "),
            ),
            None => ProgressBar::new_spinner().with_style(
                ProgressStyle::default_spinner()
                    .template("{spinner} [{elapsed_precise}] {bytes} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            ),
        };

        self.pb = Some(pb.with_message(self.message));
    }

    fn update(&mut self, current: u64) {
        if let Some(ref pb) = self.pb {
            pb.set_position(current);
        }
    }

    fn finish(&mut self) {
        if let Some(ref pb) = self.pb {
            pb.finish();
        }
    }
}

fn runner() -> ProcessRunner {
    ProcessRunner::new(|| {
        eprintln!(
            "{}",
            "Still connecting, hold down the BOOT button of the device".yellow().bold()
        )
    })
}

fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(30))
        .build()
        .into_diagnostic()
        .wrap_err("Failed to create HTTP client")
}

fn scratch_dir(config: &Config) -> PathBuf {
    config.cache_dir().join("scratch")
}

fn platform_of(platform: Option<Platform>, target: Option<&str>) -> Result<Platform, Error> {
    match (platform, target) {
        (Some(platform), _) => Ok(platform),
        (None, Some(target)) => {
            Platform::from_target_name(target).ok_or_else(|| Error::UnknownPlatform(target.to_owned()))
        }
        (None, None) => Err(Error::UnknownPlatform(String::new())),
    }
}

fn package_request(
    args: &PackageArgs,
    target: String,
    platform: Platform,
) -> Result<PackageRequest, Error> {
    Ok(PackageRequest {
        target,
        version: args.version.as_deref().map(parse_version).transpose()?,
        preview: args.preview,
        platform: Some(platform),
    })
}

async fn fetch_firmware(
    args: &PackageArgs,
    request: PackageRequest,
    config: &Config,
) -> Result<ExtractedFirmwareSet> {
    let client = http_client()?;
    let index = HttpIndex::new(client.clone(), &config.index);
    let downloader = HttpDownloader::new(client);
    let settings = config.package_settings(args.archive_path.clone());

    let options = FetchOptions {
        use_existing_if_download_fails: args.use_existing,
    };
    let mut progress = NanoflashProgress::new("Downloading");

    let (package, firmware) =
        obtain_firmware(&index, &downloader, &settings, &request, options, &mut progress).await?;
    println!("Firmware package: {} {}", package.name, package.version);

    Ok(firmware)
}

/// Location of the UniFlash target configuration of a TI target: shipped
/// with the package, or in the configured directory
fn uniflash_config(
    config: &Config,
    target: Option<&str>,
    firmware: Option<&ExtractedFirmwareSet>,
) -> Result<PathBuf, Error> {
    let target = target.ok_or_else(|| Error::ChipDetect(Platform::Ti.to_string()))?;
    let file = format!("{target}.ccxml");

    firmware
        .map(|f| f.location.join(&file))
        .into_iter()
        .chain(config.tools.uniflash_configs.as_ref().map(|d| d.join(&file)))
        .find(|p| p.is_file())
        .ok_or_else(|| Error::FileNotFound(PathBuf::from(&file)))
}

/// Transport of a probe based platform
fn probe_transport(
    platform: Platform,
    dfu: bool,
    jlink_device: &str,
    ti_config: Option<PathBuf>,
    config: &Config,
) -> Result<Box<dyn FlashTransport>, Error> {
    let tools = &config.tools;

    Ok(match platform {
        Platform::Stm32 => {
            let link = if dfu { Stm32Link::Dfu } else { Stm32Link::Swd };
            Box::new(Stm32Programmer::new(runner(), &tools.stm32_programmer, link))
        }
        Platform::Ti => Box::new(Uniflash::new(
            runner(),
            &tools.uniflash,
            &tools.xdsdfu,
            ti_config.unwrap_or_default(),
            scratch_dir(config),
        )),
        Platform::Efm32 => Box::new(JLink::new(
            runner(),
            &tools.jlink,
            jlink_device,
            scratch_dir(config),
        )),
        Platform::Esp32 | Platform::Nxp => {
            return Err(Error::UnsupportedOperation {
                platform: platform.to_string(),
                operation: "Probe access",
            })
        }
    })
}

fn esptool(port: &str, baud: Option<u32>, config: &Config) -> Esptool<ProcessRunner> {
    let baud = baud.or(config.connection.baud).unwrap_or(DEFAULT_BAUD);
    Esptool::new(runner(), &config.tools.esptool, vec![port.to_owned()]).with_baud(baud)
}

fn flash(
    transport: &dyn FlashTransport,
    map: &FlashPartitionMap,
    options: SessionOptions,
) -> Result<(), Error> {
    let mut session = DeviceSession::new(transport, options);
    session.flash(map, &mut NanoflashProgress::new("Flashing"))?;

    println!("{}", "Flashing completed".green());
    Ok(())
}

/// Update the firmware of a device
pub async fn update(args: UpdateArgs, config: &Config) -> Result<()> {
    let platform = platform_of(args.platform, args.package.target.as_deref())?;

    match platform {
        Platform::Esp32 => update_esp32(args, config).await,
        Platform::Stm32 | Platform::Ti | Platform::Efm32 => {
            update_with_probe(args, platform, config).await
        }
        Platform::Nxp => Err(Error::UnsupportedOperation {
            platform: platform.to_string(),
            operation: "Firmware update",
        }
        .into()),
    }
}

async fn update_esp32(args: UpdateArgs, config: &Config) -> Result<()> {
    let port = get_serial_port(args.device.serial.as_deref(), config)?;
    let esptool = esptool(&port, args.device.baud, config);

    let info = esptool.chip_info(&port)?;
    print_chip_info(&info);

    let target = match args.package.target.clone() {
        Some(target) => target,
        None => guess_esp32_target(&info)?,
    };
    let identity =
        TargetIdentity::new(target.clone(), Platform::Esp32).with_chip_variant(info.chip_type.clone());

    let request = package_request(&args.package, target, Platform::Esp32)?;
    let firmware = fetch_firmware(&args.package, request, config).await?;

    let explicit = args.flash_size.map(|size| size.to_string());
    let flash_size = FlashSize::select(explicit.as_deref(), info.flash_size.as_deref())?;

    let mut map = flash_plan::firmware(&identity, &firmware, flash_size)?;
    if let Some(clr) = &args.clr_file {
        flash_plan::override_clr(&mut map, ESP32_CLR_ADDRESS, clr)?;
    }
    if let Some(deployment) = &args.deployment {
        flash_plan::with_application(&mut map, &identity, args.address.as_deref(), deployment)?;
    }

    if let Err(e) = backup_config(&esptool, &port, &firmware, flash_size, &args, &mut map) {
        warn!("Configuration partition not saved: {e}");
    }

    flash(&esptool, &map, args.flash.session_options(Some(port)))?;
    Ok(())
}

/// Save the configuration partition and write it back with the firmware
fn backup_config<R: ToolRunner>(
    esptool: &Esptool<R>,
    port: &str,
    firmware: &ExtractedFirmwareSet,
    flash_size: FlashSize,
    args: &UpdateArgs,
    map: &mut FlashPartitionMap,
) -> Result<(), Error> {
    let csv = firmware.partition_csv(flash_size);
    let Some(backup) = flash_plan::plan_config_backup(
        csv.as_deref(),
        &firmware.location,
        args.flash.mass_erase,
        args.no_backup_config,
    )?
    else {
        return Ok(());
    };

    info!("Saving configuration partition to {}", backup.file.display());
    esptool.read_flash(port, backup.address, backup.size, &backup.file)?;

    map.insert(backup.address, backup.file)
}

async fn update_with_probe(args: UpdateArgs, platform: Platform, config: &Config) -> Result<()> {
    let target = args
        .package
        .target
        .clone()
        .ok_or_else(|| Error::ChipDetect(platform.to_string()))?;
    let identity = TargetIdentity::new(target.clone(), platform);

    let request = package_request(&args.package, target.clone(), platform)?;
    let firmware = fetch_firmware(&args.package, request, config).await?;

    let mut map = flash_plan::firmware(&identity, &firmware, FlashSize::default())?;
    if let Some(clr) = &args.clr_file {
        let address = firmware
            .clr_start_address
            .ok_or_else(|| Error::FileNotFound(firmware.location.join("nanoCLR.hex")))?;
        flash_plan::override_clr(&mut map, address, clr)?;
    }
    if let Some(deployment) = &args.deployment {
        flash_plan::with_application(&mut map, &identity, args.address.as_deref(), deployment)?;
    }

    let ti_config = match platform {
        Platform::Ti => Some(uniflash_config(config, Some(&target), Some(&firmware))?),
        _ => None,
    };
    let transport = probe_transport(
        platform,
        args.device.dfu,
        &args.device.jlink_device,
        ti_config,
        config,
    )?;

    flash(
        &*transport,
        &map,
        args.flash.session_options(args.device.device_id.clone()),
    )?;
    Ok(())
}

/// Flash application images, without touching the firmware
pub fn deploy(args: DeployArgs, config: &Config) -> Result<()> {
    let target = args
        .target
        .as_ref()
        .map(|target| TargetIdentity::new(target.clone(), args.platform));
    let map = flash_plan::deployment(target.as_ref(), &args.addresses, &args.images)?;
    debug!("Deployment plan: {map:x?}");

    match args.platform {
        Platform::Esp32 => {
            let port = get_serial_port(args.device.serial.as_deref(), config)?;
            let esptool = esptool(&port, args.device.baud, config);
            flash(&esptool, &map, args.flash.session_options(Some(port)))?;
        }
        platform => {
            let ti_config = match platform {
                Platform::Ti => Some(uniflash_config(config, args.target.as_deref(), None)?),
                _ => None,
            };
            let transport = probe_transport(
                platform,
                args.device.dfu,
                &args.device.jlink_device,
                ti_config,
                config,
            )?;

            flash(
                &*transport,
                &map,
                args.flash.session_options(args.device.device_id.clone()),
            )?;
        }
    }

    Ok(())
}

/// Print the firmware packages available for the given filters
pub async fn list_targets(args: ListTargetsArgs, config: &Config) -> Result<()> {
    let settings = config.package_settings(args.archive_path.clone());
    let index = HttpIndex::new(http_client()?, &config.index);
    let resolver = PackageResolver::new(&index, &settings);

    let packages = resolver
        .list(ListOptions {
            platform: args.platform,
            preview: args.preview,
            community: args.community,
            uploaded_after: args
                .uploaded_after
                .and_then(|date| date.and_hms_opt(0, 0, 0))
                .map(|date| date.and_utc()),
        })
        .await?;

    if packages.is_empty() {
        println!("No packages found");
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(modifiers::UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("Target")
                .fg(Color::Green)
                .add_attribute(Attribute::Bold),
            Cell::new("Version")
                .fg(Color::Cyan)
                .add_attribute(Attribute::Bold),
            Cell::new("Channel")
                .fg(Color::Magenta)
                .add_attribute(Attribute::Bold),
            Cell::new("Published")
                .fg(Color::Yellow)
                .add_attribute(Attribute::Bold),
        ]);

    for package in &packages {
        table.add_row(vec![
            Cell::new(&package.name).fg(Color::Green),
            Cell::new(package.version.to_string()).fg(Color::Cyan),
            Cell::new(package.channel().to_string()).fg(Color::Magenta),
            Cell::new(
                package
                    .published
                    .map(|p| p.format("%Y-%m-%d").to_string())
                    .unwrap_or_default(),
            )
            .fg(Color::Yellow),
        ]);
    }

    println!("{table}");
    Ok(())
}

/// Print the serial ports of the host
pub fn list_ports() -> Result<()> {
    let ports = detect_serial_ports()?;

    if ports.is_empty() {
        println!("No serial ports found");
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(modifiers::UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("Port").add_attribute(Attribute::Bold),
            Cell::new("VID:PID").add_attribute(Attribute::Bold),
            Cell::new("Product").add_attribute(Attribute::Bold),
        ]);

    for port in ports {
        let (ids, product) = match &port.port_type {
            SerialPortType::UsbPort(usb) => (
                format!("{:04x}:{:04x}", usb.vid, usb.pid),
                usb.product.clone().unwrap_or_default(),
            ),
            _ => (String::new(), String::new()),
        };

        table.add_row(vec![Cell::new(&port.port_name), Cell::new(ids), Cell::new(product)]);
    }

    println!("{table}");
    Ok(())
}

/// Print the connected probes of a platform
pub fn list_probes(args: ListProbesArgs, config: &Config) -> Result<()> {
    if args.platform == Platform::Esp32 {
        return list_ports();
    }

    let transport = probe_transport(args.platform, args.dfu, DEFAULT_JLINK_DEVICE, None, config)?;
    let devices = transport.list_devices()?;

    if devices.is_empty() {
        println!("No {} devices found", transport.transport());
    }
    for device in devices {
        println!("{device}");
    }

    Ok(())
}

/// Print the details of a connected ESP32 and the target matching it
pub fn device_details(args: DeviceDetailsArgs, config: &Config) -> Result<()> {
    let port = get_serial_port(args.serial.as_deref(), config)?;
    let info = esptool(&port, args.baud, config).chip_info(&port)?;

    print_chip_info(&info);
    Ok(())
}

fn print_chip_info(info: &Esp32ChipInfo) {
    let target = match guess_esp32_target(info) {
        Ok(target) => target,
        Err(e) => {
            warn!("{e}");
            String::from("unknown")
        }
    };

    let rows = [
        ("Chip", format!("{} ({})", info.chip_type, info.chip_name)),
        ("Revision", info.revision.to_string()),
        ("Features", info.features.join(", ")),
        (
            "Crystal",
            info.crystal_mhz
                .map(|mhz| format!("{mhz} MHz"))
                .unwrap_or_default(),
        ),
        ("MAC address", info.mac.clone().unwrap_or_default()),
        ("Flash size", info.flash_size.clone().unwrap_or_default()),
        ("Target", target),
    ];

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(modifiers::UTF8_ROUND_CORNERS);
    for (name, value) in rows {
        table.add_row(vec![
            Cell::new(name).add_attribute(Attribute::Bold),
            Cell::new(value),
        ]);
    }

    println!("{table}");
}

/// Delete every cached package
pub fn clear_cache(config: &Config) -> Result<()> {
    let cache = PackageCache::new(config.cache_dir());
    cache
        .clear()
        .wrap_err_with(|| format!("Failed to clear {}", cache.root().display()))?;

    println!("Cleared {}", cache.root().display());
    Ok(())
}
