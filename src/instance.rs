//! Instance context handed to device drivers.
//!
//! Drivers never see the instance runtime. They get a read-only snapshot of
//! the instance's identity and expanded configuration.

use crate::device::Devices;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Project used when an instance definition does not name one.
pub const DEFAULT_PROJECT: &str = "default";

/// Container or virtual machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum InstanceKind {
    /// System container.
    #[default]
    #[serde(rename = "container")]
    Container,
    /// Virtual machine.
    #[serde(rename = "virtual-machine", alias = "vm")]
    Vm,
}

impl std::fmt::Display for InstanceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceKind::Container => write!(f, "container"),
            InstanceKind::Vm => write!(f, "virtual-machine"),
        }
    }
}

/// Identity and expanded configuration of one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceContext {
    /// Instance name.
    pub name: String,

    /// Project the instance belongs to.
    #[serde(default = "default_project")]
    pub project: String,

    /// Container or VM.
    #[serde(default)]
    pub kind: InstanceKind,

    /// Kernel architecture name (`x86_64`, `aarch64`, `s390x`).
    #[serde(default = "default_architecture")]
    pub architecture: String,

    /// Expanded instance configuration.
    #[serde(default)]
    pub config: BTreeMap<String, String>,

    /// Devices defined on the instance itself.
    #[serde(default)]
    pub devices: Devices,

    /// Devices inherited from profiles.
    #[serde(default)]
    pub profile_devices: Devices,
}

fn default_project() -> String {
    DEFAULT_PROJECT.to_string()
}

fn default_architecture() -> String {
    std::env::consts::ARCH.to_string()
}

impl InstanceContext {
    /// New instance in the default project with no devices.
    pub fn new(name: impl Into<String>, kind: InstanceKind) -> Self {
        Self {
            name: name.into(),
            project: default_project(),
            kind,
            architecture: default_architecture(),
            config: BTreeMap::new(),
            devices: Devices::new(),
            profile_devices: Devices::new(),
        }
    }

    /// Load an instance definition from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigLoad(format!("{}: {}", path.display(), e)))?;
        Self::parse(&contents)
    }

    /// Parse an instance definition.
    pub fn parse(contents: &str) -> Result<Self> {
        let inst: Self = toml::from_str(contents).map_err(|e| Error::ConfigLoad(e.to_string()))?;
        if inst.name.is_empty() {
            return Err(Error::ConfigLoad("instance name is required".into()));
        }
        Ok(inst)
    }

    /// Unique key of the instance across projects (`project/name`).
    pub fn key(&self) -> String {
        format!("{}/{}", self.project, self.name)
    }

    /// Whether this is a virtual machine.
    pub fn is_vm(&self) -> bool {
        self.kind == InstanceKind::Vm
    }

    /// Whether this is a container.
    pub fn is_container(&self) -> bool {
        self.kind == InstanceKind::Container
    }

    /// Value of an expanded config key, `""` when unset.
    pub fn config_value(&self, key: &str) -> &str {
        self.config.get(key).map(String::as_str).unwrap_or("")
    }

    /// Whether stateful migration is enabled.
    pub fn is_stateful_migration(&self) -> bool {
        crate::device::validate::is_true(self.config_value("migration.stateful"))
    }

    /// Profile devices overlaid with the instance's own devices.
    pub fn expanded_devices(&self) -> Devices {
        self.profile_devices.merged_with(&self.devices)
    }

    /// Directory holding device nodes and mount sources for this instance.
    pub fn devices_path(&self, root: &Path) -> PathBuf {
        root.join(format!("{}_{}", self.project, self.name))
    }

    /// NUMA nodes the instance is pinned to, empty when unrestricted.
    pub fn numa_nodes(&self) -> Result<Vec<u32>> {
        let mut value = self.config_value("limits.cpu.nodes");
        if value == "balanced" {
            value = self.config_value("volatile.cpu.nodes");
        }
        parse_node_set(value)
    }
}

/// Parse a node list such as `0,2-3`.
pub fn parse_node_set(value: &str) -> Result<Vec<u32>> {
    let mut nodes = BTreeSet::new();
    for part in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let invalid = || Error::config(format!("invalid NUMA node set {:?}", value));
        match part.split_once('-') {
            Some((start, end)) => {
                let start: u32 = start.trim().parse().map_err(|_| invalid())?;
                let end: u32 = end.trim().parse().map_err(|_| invalid())?;
                if start > end {
                    return Err(invalid());
                }
                nodes.extend(start..=end);
            }
            None => {
                nodes.insert(part.parse().map_err(|_| invalid())?);
            }
        }
    }
    Ok(nodes.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_definition() {
        let inst = InstanceContext::parse(
            r#"
            name = "c1"
            kind = "container"

            [config]
            "limits.cpu.nodes" = "0,2-3"

            [devices.eth0]
            type = "nic"
            nictype = "routed"
            parent = "eth0"
            "ipv4.address" = "203.0.113.5"

            [profile_devices.eth0]
            type = "nic"
            nictype = "p2p"

            [profile_devices.eth1]
            type = "nic"
            nictype = "p2p"
            "#,
        )
        .unwrap();

        assert_eq!(inst.project, "default");
        assert_eq!(inst.key(), "default/c1");
        assert!(inst.is_container());
        assert_eq!(inst.numa_nodes().unwrap(), vec![0, 2, 3]);

        let expanded = inst.expanded_devices();
        assert_eq!(expanded.len(), 2);
        assert_eq!(expanded.get("eth0").unwrap().get("nictype"), "routed");
    }

    #[test]
    fn test_vm_alias() {
        let inst = InstanceContext::parse("name = \"v1\"\nkind = \"vm\"\n").unwrap();
        assert!(inst.is_vm());
        assert_eq!(inst.kind.to_string(), "virtual-machine");
    }

    #[test]
    fn test_missing_name_rejected() {
        let err = InstanceContext::parse("kind = \"container\"\n").unwrap_err();
        assert!(err.to_string().contains("name"));
    }

    #[test]
    fn test_node_set_errors() {
        assert!(parse_node_set("").unwrap().is_empty());
        assert!(parse_node_set("3-1").is_err());
        assert!(parse_node_set("a").is_err());
    }
}
