//! CLI command implementations.

pub mod config;
pub mod start;
pub mod stop;
pub mod validate;
pub mod volatile;
pub mod watch;

use hostdev::config::DaemonConfig;
use hostdev::device::{HostContext, RunConfig};
use hostdev::host::LinuxHost;
use hostdev::hotplug::HotplugRegistry;
use hostdev::instance::InstanceContext;
use hostdev::manager::{DeviceManager, DeviceRuns};
use hostdev::resources::HostResources;
use hostdev::storage::MemoryVolatileStore;
use std::path::Path;
use std::sync::Arc;

/// Load an instance definition.
pub(crate) fn load_instance(path: &Path) -> hostdev::Result<Arc<InstanceContext>> {
    let inst = InstanceContext::load(path)?;
    tracing::debug!(instance = %inst.key(), kind = %inst.kind, path = %path.display(), "loaded instance definition");
    Ok(Arc::new(inst))
}

/// Manager that never touches the volatile database.
pub(crate) fn offline_manager(config: &DaemonConfig) -> DeviceManager {
    DeviceManager::new(HostContext {
        host: Arc::new(LinuxHost::new(config)),
        store: Arc::new(MemoryVolatileStore::new()),
        resources: Arc::new(HostResources::new()),
        networks: Arc::new(config.clone()),
        hotplug: Arc::new(HotplugRegistry::new()),
        probe_timeout: config.neighbor_probe_timeout,
        devices_dir: config.devices_dir.clone(),
    })
}

/// Print the descriptors of `runs` as one JSON document.
pub(crate) fn print_runs(runs: &DeviceRuns) -> hostdev::Result<()> {
    let doc: Vec<serde_json::Value> = runs
        .iter()
        .map(|(name, run): &(String, RunConfig)| {
            serde_json::json!({
                "device": name,
                "descriptor": run.descriptor,
            })
        })
        .collect();
    let text = serde_json::to_string_pretty(&doc)
        .map_err(|e| hostdev::Error::config(format!("failed to render descriptors: {}", e)))?;
    println!("{}", text);
    Ok(())
}
