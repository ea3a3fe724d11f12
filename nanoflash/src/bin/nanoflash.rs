use clap::{Parser, Subcommand};
use log::{debug, LevelFilter};
use miette::Result;
use nanoflash::{
    cli::{
        self, config::Config, DeployArgs, DeviceDetailsArgs, ListProbesArgs, ListTargetsArgs,
        UpdateArgs,
    },
    logging::initialize_logger,
    Error, ExitCode,
};

#[derive(Debug, Parser)]
#[command(about, max_term_width = 100, propagate_version = true, version)]
struct Cli {
    #[command(subcommand)]
    subcommand: Commands,

    /// Log level: off, error, warn, info, debug or trace
    #[arg(long, global = true, default_value = "info")]
    log_level: LevelFilter,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Update the firmware of a device with a firmware package
    ///
    /// The package is resolved from the package repository, or from a local
    /// archive directory with `--archive-path`, and cached locally.
    Update(UpdateArgs),
    /// Flash application images without updating the firmware
    Deploy(DeployArgs),
    /// List the available firmware packages
    ListTargets(ListTargetsArgs),
    /// List the serial ports of the host
    ListPorts,
    /// List the connected debug probes or DFU devices
    ListProbes(ListProbesArgs),
    /// Show the details of a connected ESP32 and the matching target
    DeviceDetails(DeviceDetailsArgs),
    /// Delete every cached firmware package
    ClearCache,
}

#[tokio::main]
async fn main() {
    miette::set_panic_hook();

    // Attempt to parse any provided command-line arguments, or print the help
    // message and terminate if the invocation is not correct.
    let cli = Cli::parse();
    initialize_logger(cli.log_level);
    debug!("{:#?}", cli.subcommand);

    if let Err(report) = run(cli.subcommand).await {
        let exit_code = report
            .downcast_ref::<Error>()
            .map(Error::exit_code)
            .unwrap_or(ExitCode::E9000);

        eprintln!("{report:?}");
        eprintln!("Error {exit_code}: {}", exit_code.message());

        std::process::exit(exit_code.code());
    }
}

async fn run(subcommand: Commands) -> Result<()> {
    // Load any user configuration, if present.
    let config = Config::load()?;

    // Execute the correct action based on the provided subcommand and its
    // associated arguments.
    match subcommand {
        Commands::Update(args) => cli::update(args, &config).await,
        Commands::Deploy(args) => cli::deploy(args, &config),
        Commands::ListTargets(args) => cli::list_targets(args, &config).await,
        Commands::ListPorts => cli::list_ports(),
        Commands::ListProbes(args) => cli::list_probes(args, &config),
        Commands::DeviceDetails(args) => cli::device_details(args, &config),
        Commands::ClearCache => cli::clear_cache(&config),
    }
}
