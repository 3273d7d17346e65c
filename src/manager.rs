//! Entry point for the instance runtime.
//!
//! [`DeviceManager`] loads the drivers of an instance and drives them
//! through validation, start, update, hot-plug and stop. It never applies
//! the returned [`RunConfig`]s itself; the caller attaches what they describe
//! and then runs their post hooks.

use crate::config::DaemonConfig;
use crate::device::{self, Device, DeviceChanges, DeviceConfig, Devices, Driver, HostContext, RunConfig};
use crate::error::{Error, Result};
use crate::host::LinuxHost;
use crate::hotplug::HotplugRegistry;
use crate::instance::InstanceContext;
use crate::resources::HostResources;
use crate::storage::{RedbVolatileStore, VolatileStore};
use std::sync::Arc;

/// Per-device output of a lifecycle call, in the order the calls were made.
pub type DeviceRuns = Vec<(String, RunConfig)>;

/// Device lifecycle for all instances on this host.
pub struct DeviceManager {
    ctx: HostContext,
}

impl DeviceManager {
    /// Manager over an existing host context.
    pub fn new(ctx: HostContext) -> Self {
        Self { ctx }
    }

    /// Manager for the running kernel.
    ///
    /// Opens the volatile database and re-registers the shared resource
    /// claims recorded in it.
    pub fn open(config: &DaemonConfig) -> Result<Self> {
        let store: Arc<dyn VolatileStore> = Arc::new(RedbVolatileStore::open(&config.state_db)?);
        let resources = Arc::new(HostResources::new());
        resources.recover(store.as_ref())?;

        let ctx = HostContext {
            host: Arc::new(LinuxHost::new(config)),
            store,
            resources,
            networks: Arc::new(config.clone()),
            hotplug: Arc::new(HotplugRegistry::new()),
            probe_timeout: config.neighbor_probe_timeout,
            devices_dir: config.devices_dir.clone(),
        };
        tracing::debug!(state_db = %config.state_db.display(), "device manager ready");
        Ok(Self::new(ctx))
    }

    /// Host context shared by every driver.
    pub fn context(&self) -> &HostContext {
        &self.ctx
    }

    fn load_one(&self, inst: &Arc<InstanceContext>, name: &str, config: &DeviceConfig) -> Result<Driver> {
        device::load(inst.clone(), &self.ctx, name, config)
    }

    /// Load every expanded device of an instance.
    ///
    /// Devices that only come from profiles and do not apply to this
    /// instance kind are skipped. The same device defined locally is an
    /// error.
    pub fn load(&self, inst: &Arc<InstanceContext>) -> Result<Vec<Driver>> {
        let mut drivers = Vec::new();
        for (name, config) in inst.expanded_devices().iter() {
            match self.load_one(inst, name, config) {
                Ok(driver) => drivers.push(driver),
                Err(e) if e.is_unsupported_dev_type() && inst.devices.get(name).is_none() => {
                    tracing::debug!(device = %name, instance = %inst.key(), "skipping profile device not supported by instance");
                }
                Err(e) => {
                    tracing::warn!(device = %name, instance = %inst.key(), error = %e, "invalid device");
                    return Err(e);
                }
            }
        }
        Ok(drivers)
    }

    /// Validate every device, returning the names of those that apply.
    pub fn validate(&self, inst: &Arc<InstanceContext>) -> Result<Vec<String>> {
        Ok(self
            .load(inst)?
            .iter()
            .map(|d| d.name().to_string())
            .collect())
    }

    fn selected(&self, inst: &Arc<InstanceContext>, only: Option<&str>) -> Result<Vec<Driver>> {
        let drivers = self.load(inst)?;
        match only {
            None => Ok(drivers),
            Some(name) => {
                let driver = drivers
                    .into_iter()
                    .find(|d| d.name() == name)
                    .ok_or_else(|| Error::not_found(format!("device {:?} of instance {}", name, inst.key())))?;
                Ok(vec![driver])
            }
        }
    }

    /// Start the devices of an instance, or just `only`.
    ///
    /// If a device fails, the devices started before it are stopped again
    /// and their post hooks run before the error is returned.
    pub fn start(&self, inst: &Arc<InstanceContext>, only: Option<&str>) -> Result<DeviceRuns> {
        let mut started: Vec<Driver> = Vec::new();
        let mut runs = DeviceRuns::new();

        for mut driver in self.selected(inst, only)? {
            match driver.start() {
                Ok(run) => {
                    tracing::info!(device = %driver.name(), instance = %inst.key(), kind = driver.kind(), "device started");
                    runs.push((driver.name().to_string(), run));
                    started.push(driver);
                }
                Err(e) => {
                    tracing::warn!(device = %driver.name(), instance = %inst.key(), error = %e, "device failed to start, stopping the others");
                    for mut done in started.into_iter().rev() {
                        if let Err(stop_err) = Self::stop_driver(&mut done) {
                            tracing::warn!(device = %done.name(), error = %stop_err, "failed to stop device after start failure");
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(runs)
    }

    fn stop_driver(driver: &mut Driver) -> Result<()> {
        let run = driver.stop()?;
        RunConfig::run_post_hooks(run.post_hooks)
    }

    /// Stop the devices of an instance, or just `only`, in reverse order.
    ///
    /// Every device is stopped even if an earlier one fails; the failures
    /// are returned together.
    pub fn stop(&self, inst: &Arc<InstanceContext>, only: Option<&str>) -> Result<DeviceRuns> {
        let mut runs = DeviceRuns::new();
        let mut errs = Vec::new();
        for mut driver in self.selected(inst, only)?.into_iter().rev() {
            match driver.stop() {
                Ok(run) => {
                    tracing::info!(device = %driver.name(), instance = %inst.key(), "device stopped");
                    runs.push((driver.name().to_string(), run));
                }
                Err(e) => {
                    tracing::warn!(device = %driver.name(), instance = %inst.key(), error = %e, "device failed to stop");
                    errs.push(e);
                }
            }
        }
        Error::from_cleanup(errs)?;
        Ok(runs)
    }

    /// Run the post hooks of every run config.
    pub fn run_post_hooks(runs: DeviceRuns) -> Result<()> {
        let mut errs = Vec::new();
        for (name, run) in runs {
            if let Err(e) = RunConfig::run_post_hooks(run.post_hooks) {
                tracing::warn!(device = %name, error = %e, "post hooks failed");
                errs.push(e);
            }
        }
        Error::from_cleanup(errs)
    }

    /// Attach one new device.
    pub fn hot_plug(&self, inst: &Arc<InstanceContext>, running: bool, name: &str, config: &DeviceConfig) -> Result<RunConfig> {
        let mut driver = self.load_one(inst, name, config)?;
        if running && !driver.can_hot_plug() {
            return Err(Error::config(format!(
                "Device {:?} cannot be added while the instance is running",
                name
            )));
        }
        driver.start()
    }

    /// Detach one device.
    pub fn hot_unplug(&self, inst: &Arc<InstanceContext>, running: bool, name: &str, config: &DeviceConfig) -> Result<RunConfig> {
        let mut driver = self.load_one(inst, name, config)?;
        if running && !driver.can_hot_plug() {
            return Err(Error::config(format!(
                "Device {:?} cannot be removed while the instance is running",
                name
            )));
        }
        driver.stop()
    }

    /// Apply a change of the device list.
    ///
    /// Devices whose only changes are live-updatable keys are updated in
    /// place. The returned partition tells the caller which devices still
    /// need [`hot_unplug`](Self::hot_unplug) and [`hot_plug`](Self::hot_plug).
    /// While the instance runs, adding or removing a device that cannot be
    /// hot-plugged is rejected before anything is touched.
    pub fn update(&self, inst: &Arc<InstanceContext>, old: &Devices, new: &Devices, running: bool) -> Result<DeviceChanges> {
        let changes = old.update(new, |name, old_config, new_config| {
            match self.load_one(inst, name, new_config) {
                Ok(driver) => Ok(driver.updatable_fields(old_config)),
                Err(e) if e.is_unsupported_dev_type() => Ok(Vec::new()),
                Err(e) => Err(e),
            }
        })?;

        if running {
            for (name, config) in changes.removed.iter().chain(changes.added.iter()) {
                match self.load_one(inst, name, config) {
                    Ok(driver) if !driver.can_hot_plug() => {
                        return Err(Error::config(format!(
                            "Device {:?} cannot be changed while the instance is running",
                            name
                        )))
                    }
                    Err(e) if !e.is_unsupported_dev_type() => return Err(e),
                    _ => {}
                }
            }
        }

        for (name, config) in changes.updated.iter() {
            let mut driver = self.load_one(inst, name, config)?;
            driver.update(old, running)?;
            tracing::info!(device = %name, instance = %inst.key(), "device updated");
        }
        Ok(changes)
    }
}
