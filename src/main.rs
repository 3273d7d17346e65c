//! hostdev CLI entry point.

use clap::{Parser, Subcommand};
use hostdev::config::{DaemonConfig, LogFormat};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod cli;

/// hostdev - instance device lifecycle manager
#[derive(Parser, Debug)]
#[command(name = "hostdev")]
#[command(about = "Instance device lifecycle manager")]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to the user config directory).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate the devices of an instance definition.
    Validate(cli::validate::ValidateCmd),

    /// Start devices and print what the runtime must attach.
    Start(cli::start::StartCmd),

    /// Stop devices and clean up host state.
    Stop(cli::stop::StopCmd),

    /// List recorded volatile state.
    Volatile(cli::volatile::VolatileCmd),

    /// Start devices and stream hotplug changes.
    Watch(cli::watch::WatchCmd),

    /// Manage configuration.
    #[command(subcommand)]
    Config(cli::config::ConfigCmd),
}

fn main() {
    let cli = Cli::parse();

    // Load configuration
    let (config, config_err) = match DaemonConfig::load(cli.config.as_deref()) {
        Ok(c) => (c, None),
        Err(e) => (DaemonConfig::default(), Some(e)),
    };

    init_logging(cli.log_json || config.log_format == LogFormat::Json);
    tracing::debug!(version = hostdev::VERSION, "starting hostdev");
    if let Some(e) = config_err {
        tracing::warn!(error = %e, "failed to load config, using defaults");
    }

    // Execute command
    let result = match cli.command {
        Commands::Validate(cmd) => cmd.run(&config),
        Commands::Start(cmd) => cmd.run(&config),
        Commands::Stop(cmd) => cmd.run(&config),
        Commands::Volatile(cmd) => cmd.run(&config),
        Commands::Watch(cmd) => cmd.run(&config),
        Commands::Config(cmd) => cmd.run(&config, cli.config),
    };

    // Handle errors
    if let Err(e) = result {
        tracing::error!(error = %e, "command failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Initialize the tracing subscriber.
fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("hostdev=warn"));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}
