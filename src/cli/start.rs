//! Start command implementation.

use clap::Args;
use hostdev::config::DaemonConfig;
use hostdev::manager::DeviceManager;
use std::path::PathBuf;

/// Start the devices of an instance and print what to attach.
#[derive(Args, Debug)]
pub struct StartCmd {
    /// Instance definition file (TOML).
    pub instance: PathBuf,

    /// Only start this device.
    #[arg(long)]
    pub device: Option<String>,
}

impl StartCmd {
    /// Execute the start command.
    pub fn run(self, config: &DaemonConfig) -> hostdev::Result<()> {
        let inst = super::load_instance(&self.instance)?;
        let manager = DeviceManager::open(config)?;

        let runs = manager.start(&inst, self.device.as_deref())?;
        super::print_runs(&runs)?;
        DeviceManager::run_post_hooks(runs)
    }
}
