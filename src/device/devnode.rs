//! Device nodes created in an instance's devices directory.
//!
//! USB and Unix devices hand a container bind mounts of nodes created under
//! `<devices_dir>/<project>_<instance>/`. Created nodes are recorded in the
//! device's volatile state so stop can find them after a restart or after a
//! hotplug handler added one.

use super::validate;
use super::{DeviceCommon, RunConfig, VOLATILE_NODES};
use crate::error::{Error, Result};
use crate::host::{DeviceNode, Host, NodeOwner};
use crate::storage::Volatile;
use hostdev_protocol::{keys, MountEntry};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

const DEFAULT_MODE: u32 = 0o660;

/// Node creation for one device, detached from the driver so hotplug
/// handlers can own a copy.
#[derive(Clone)]
pub(super) struct NodeSetup {
    host: Arc<dyn Host>,
    volatile: Volatile,
    devices_path: PathBuf,
    device: String,
    owner: NodeOwner,
}

impl NodeSetup {
    pub(super) fn new(common: &DeviceCommon) -> Result<Self> {
        let config = &common.config;
        let id = |key: &str| -> Result<u32> {
            match config.get(key) {
                "" => Ok(0),
                v => v
                    .parse()
                    .map_err(|_| Error::validation(key, format!("invalid value {:?}", v))),
            }
        };
        let mode = match config.get("mode") {
            "" => DEFAULT_MODE,
            v => u32::from_str_radix(v, 8)
                .map_err(|_| Error::validation("mode", format!("invalid file mode {:?}", v)))?,
        };
        Ok(Self {
            host: common.ctx.host.clone(),
            volatile: common.volatile.clone(),
            devices_path: common.inst.devices_path(&common.ctx.devices_dir),
            device: common.name.clone(),
            owner: NodeOwner {
                uid: id("uid")?,
                gid: id("gid")?,
                mode,
            },
        })
    }

    /// File name of the node for `dest` (`unix.<device>.<encoded dest>`).
    fn file_name(&self, dest: &str) -> String {
        let encoded = dest.trim_start_matches('/').replace('-', "--").replace('/', "-");
        format!("unix.{}.{}", self.device, encoded)
    }

    fn host_path(&self, dest: &str) -> PathBuf {
        self.devices_path.join(self.file_name(dest))
    }

    fn entry(&self, dest: &str) -> MountEntry {
        MountEntry {
            dev_name: self.file_name(dest),
            dev_path: self.host_path(dest).to_string_lossy().into_owned(),
            target_path: dest.trim_start_matches('/').to_string(),
            fs_type: "none".to_string(),
            opts: vec!["bind".to_string(), "create=file".to_string()],
            owner_shift: false,
        }
    }

    fn recorded(&self) -> Result<Vec<String>> {
        Ok(self
            .volatile
            .get()?
            .get(VOLATILE_NODES)
            .map(|v| v.split(',').filter(|s| !s.is_empty()).map(str::to_string).collect())
            .unwrap_or_default())
    }

    fn record(&self, nodes: &[String]) -> Result<()> {
        if nodes.is_empty() {
            return self.volatile.clear(&[VOLATILE_NODES]);
        }
        let values: HashMap<String, String> = [(VOLATILE_NODES.to_string(), nodes.join(","))].into_iter().collect();
        self.volatile.set(&values)
    }

    /// Whether the node for `dest` has been created.
    pub(super) fn exists(&self, dest: &str) -> Result<bool> {
        Ok(self.host.device_node(&self.host_path(dest))?.is_some())
    }

    /// Create the node for `dest` and describe its mount and cgroup rule.
    pub(super) fn add(&self, node: &DeviceNode, dest: &str, run: &mut RunConfig) -> Result<()> {
        let path = self.host_path(dest);
        self.host.create_device_node(&path, node, &self.owner)?;
        tracing::debug!(device = %self.device, path = %path.display(), major = node.major, minor = node.minor, "created device node");

        let mut nodes = self.recorded()?;
        if !nodes.iter().any(|n| n == dest) {
            nodes.push(dest.to_string());
            self.record(&nodes)?;
        }

        run.mount(self.entry(dest)).cgroup(
            keys::DEVICES_ALLOW,
            format!("{} {}:{} rwm", node.kind.letter(), node.major, node.minor),
        );
        Ok(())
    }

    /// Describe the detach of the node for `dest`.
    pub(super) fn detach(&self, dest: &str, run: &mut RunConfig) -> Result<()> {
        if let Some(node) = self.host.device_node(&self.host_path(dest))? {
            run.cgroup(
                keys::DEVICES_DENY,
                format!("{} {}:{} rwm", node.kind.letter(), node.major, node.minor),
            );
        }
        run.mount(self.entry(dest));
        Ok(())
    }

    /// Delete the node for `dest` and forget it.
    pub(super) fn delete(&self, dest: &str) -> Result<()> {
        self.host.remove_file(&self.host_path(dest))?;
        let nodes: Vec<String> = self.recorded()?.into_iter().filter(|n| n != dest).collect();
        self.record(&nodes)
    }

    /// Describe the detach of every recorded node.
    pub(super) fn detach_all(&self, run: &mut RunConfig) -> Result<()> {
        for dest in self.recorded()? {
            self.detach(&dest, run)?;
        }
        Ok(())
    }

    /// Delete every recorded node.
    pub(super) fn delete_all(&self) -> Result<()> {
        let mut errs = Vec::new();
        for dest in self.recorded()? {
            if let Err(e) = self.host.remove_file(&self.host_path(&dest)) {
                errs.push(e);
            }
        }
        if let Err(e) = self.volatile.clear(&[VOLATILE_NODES]) {
            errs.push(e);
        }
        Error::from_cleanup(errs)
    }
}

/// Validators shared by the node creating drivers.
pub(super) fn owner_rules(rules: &mut super::Rules) {
    rules
        .insert("uid", validate::optional(validate::is_uint32))
        .insert("gid", validate::optional(validate::is_uint32))
        .insert("mode", validate::optional(validate::is_octal_mode));
}
