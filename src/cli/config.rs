//! Configuration CLI commands.

use clap::{Args, Subcommand};
use hostdev::config::DaemonConfig;
use hostdev::Result;
use std::path::PathBuf;

/// Configuration commands
#[derive(Subcommand, Debug)]
pub enum ConfigCmd {
    /// Show the effective configuration
    Show(ShowCmd),

    /// Write the effective configuration to a file
    Init(InitCmd),
}

impl ConfigCmd {
    pub fn run(self, config: &DaemonConfig, path: Option<PathBuf>) -> Result<()> {
        match self {
            ConfigCmd::Show(cmd) => cmd.run(config),
            ConfigCmd::Init(cmd) => cmd.run(config, path),
        }
    }
}

// ============================================================================
// Show Command
// ============================================================================

/// Show the effective configuration
#[derive(Args, Debug)]
pub struct ShowCmd {}

impl ShowCmd {
    pub fn run(self, config: &DaemonConfig) -> Result<()> {
        print!("{}", config.to_toml()?);
        Ok(())
    }
}

// ============================================================================
// Init Command
// ============================================================================

/// Write the effective configuration to a file
#[derive(Args, Debug)]
pub struct InitCmd {
    /// Overwrite an existing file.
    #[arg(long)]
    pub force: bool,
}

impl InitCmd {
    pub fn run(self, config: &DaemonConfig, path: Option<PathBuf>) -> Result<()> {
        let path = match path {
            Some(p) => p,
            None => DaemonConfig::default_path()?,
        };
        if path.exists() && !self.force {
            return Err(hostdev::Error::ConfigSave(format!(
                "{} already exists (use --force to overwrite)",
                path.display()
            )));
        }
        config.save(&path)?;
        println!("Wrote {}", path.display());
        Ok(())
    }
}
