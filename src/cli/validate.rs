//! Validate command implementation.

use clap::Args;
use hostdev::config::DaemonConfig;
use std::path::PathBuf;

/// Validate every device of an instance definition.
#[derive(Args, Debug)]
pub struct ValidateCmd {
    /// Instance definition file (TOML).
    pub instance: PathBuf,
}

impl ValidateCmd {
    /// Execute the validate command.
    pub fn run(self, config: &DaemonConfig) -> hostdev::Result<()> {
        let inst = super::load_instance(&self.instance)?;
        let manager = super::offline_manager(config);
        let names = manager.validate(&inst)?;

        let skipped = inst.expanded_devices().len() - names.len();
        println!("{}: {} device(s) valid", inst.key(), names.len());
        for name in &names {
            println!("  {}", name);
        }
        if skipped > 0 {
            println!("  ({} profile device(s) not applicable to a {})", skipped, inst.kind);
        }
        Ok(())
    }
}
