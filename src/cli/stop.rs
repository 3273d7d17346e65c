//! Stop command implementation.

use clap::Args;
use hostdev::config::DaemonConfig;
use hostdev::manager::DeviceManager;
use std::path::PathBuf;

/// Stop the devices of an instance, print what to detach and clean up.
#[derive(Args, Debug)]
pub struct StopCmd {
    /// Instance definition file (TOML).
    pub instance: PathBuf,

    /// Only stop this device.
    #[arg(long)]
    pub device: Option<String>,
}

impl StopCmd {
    /// Execute the stop command.
    pub fn run(self, config: &DaemonConfig) -> hostdev::Result<()> {
        let inst = super::load_instance(&self.instance)?;
        let manager = DeviceManager::open(config)?;

        let runs = manager.stop(&inst, self.device.as_deref())?;
        super::print_runs(&runs)?;
        DeviceManager::run_post_hooks(runs)
    }
}
