//! Volatile command implementation.

use clap::Args;
use hostdev::config::DaemonConfig;
use hostdev::storage::{RedbVolatileStore, VolatileStore};

/// List recorded volatile state.
#[derive(Args, Debug)]
pub struct VolatileCmd {
    /// Only show this instance (`name` or `project/name`).
    #[arg(long)]
    pub instance: Option<String>,

    /// Output as JSON.
    #[arg(long)]
    pub json: bool,
}

impl VolatileCmd {
    fn selects(&self, instance: &str) -> bool {
        match &self.instance {
            None => true,
            Some(want) if want.contains('/') => instance == want,
            Some(want) => instance.rsplit('/').next() == Some(want.as_str()),
        }
    }

    /// Execute the volatile command.
    pub fn run(self, config: &DaemonConfig) -> hostdev::Result<()> {
        let store = RedbVolatileStore::open(&config.state_db)?;
        let entries: Vec<_> = store
            .list()?
            .into_iter()
            .filter(|e| self.selects(&e.instance))
            .collect();

        if self.json {
            let doc: Vec<serde_json::Value> = entries
                .iter()
                .map(|e| {
                    serde_json::json!({
                        "instance": e.instance,
                        "device": e.device,
                        "key": e.key,
                        "value": e.value,
                    })
                })
                .collect();
            println!("{}", serde_json::Value::Array(doc));
            return Ok(());
        }

        if entries.is_empty() {
            println!("No volatile state recorded");
            return Ok(());
        }

        println!("{:<24} {:<12} {:<28} VALUE", "INSTANCE", "DEVICE", "KEY");
        println!("{}", "-".repeat(80));
        for e in entries {
            println!("{:<24} {:<12} {:<28} {}", e.instance, e.device, e.key, e.value);
        }
        Ok(())
    }
}
