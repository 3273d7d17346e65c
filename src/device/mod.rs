//! Device drivers and the capability contract they share.
//!
//! Every device kind is one variant of [`Driver`], and every variant
//! implements [`Device`]. The runtime drives a device through:
//!
//! ```text
//! load (validate_config) -> validate_environment -> start -> [update] -> stop -> post hooks
//! ```
//!
//! Drivers see the host only through [`HostContext`]: the [`Host`] backend,
//! their own slice of the volatile store and the shared resource registry.

pub mod config;
mod devnode;
mod gpu_mdev;
mod gpu_mig;
mod nic;
mod pci;
mod revert;
mod runconfig;
mod unix;
mod usb;
pub mod validate;

pub use config::{DeviceChanges, DeviceConfig, Devices, Rules};
pub use gpu_mdev::GpuMdev;
pub use gpu_mig::GpuMig;
pub use nic::{NicBridged, NicIpvlan, NicP2p, NicPhysical, NicRouted, NicSriov, NicWireguard};
pub use pci::PciPassthrough;
pub use revert::Reverter;
pub use runconfig::{PostHook, RunConfig};
pub use unix::UnixDevice;
pub use usb::Usb;

use crate::error::{Error, Result};
use crate::host::{GpuCard, Host};
use crate::hotplug::HotplugRegistry;
use crate::instance::InstanceContext;
use crate::resources::{HostResources, ResourceUser};
use crate::storage::{Volatile, VolatileStore};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Volatile keys
// ============================================================================

/// Host-side interface name.
pub const VOLATILE_HOST_NAME: &str = "host_name";
/// Whether the device created its parent interface.
pub const VOLATILE_CREATED: &str = "last_state.created";
/// MAC address of a reused interface before start.
pub const VOLATILE_HWADDR: &str = "last_state.hwaddr";
/// MTU of a reused interface before start.
pub const VOLATILE_MTU: &str = "last_state.mtu";
/// PCI slot handed to the instance.
pub const VOLATILE_PCI_SLOT: &str = "last_state.pci.slot.name";
/// Driver the PCI slot was bound to before start.
pub const VOLATILE_PCI_DRIVER: &str = "last_state.pci.driver";
/// Physical function of the claimed VF.
pub const VOLATILE_VF_PARENT: &str = "last_state.vf.parent";
/// Index of the claimed VF.
pub const VOLATILE_VF_ID: &str = "last_state.vf.id";
/// VF MAC before start.
pub const VOLATILE_VF_HWADDR: &str = "last_state.vf.hwaddr";
/// VF VLAN before start.
pub const VOLATILE_VF_VLAN: &str = "last_state.vf.vlan";
/// VF spoof checking before start.
pub const VOLATILE_VF_SPOOFCHECK: &str = "last_state.vf.spoofcheck";
/// Device nodes created for the instance, comma separated.
pub const VOLATILE_NODES: &str = "last_state.nodes";
/// Mediated device UUID.
pub const VOLATILE_VGPU_UUID: &str = "vgpu.uuid";
/// Parent GPU whose mdev lock guards the mediated device.
pub const VOLATILE_VGPU_PARENT: &str = "last_state.vgpu.parent";

// ============================================================================
// Collaborators
// ============================================================================

/// A managed network a NIC can reference with `network=`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedNetwork {
    /// Network name.
    pub name: String,
    /// Network type (`wireguard`, `sriov`, `physical`, `bridge`).
    pub kind: String,
    /// Whether the network is fully created on this host.
    pub created: bool,
    /// Network configuration.
    pub config: BTreeMap<String, String>,
}

impl ManagedNetwork {
    /// Value of a config key, `""` when unset.
    pub fn config_value(&self, key: &str) -> &str {
        self.config.get(key).map(String::as_str).unwrap_or("")
    }
}

/// Resolves `network=` references.
pub trait NetworkLookup: Send + Sync {
    /// Look up a network by project and name.
    fn network(&self, project: &str, name: &str) -> Result<ManagedNetwork>;
}

/// Everything a driver may touch outside its own config.
#[derive(Clone)]
pub struct HostContext {
    /// Host kernel backend.
    pub host: Arc<dyn Host>,
    /// Volatile state backend.
    pub store: Arc<dyn VolatileStore>,
    /// Shared resource registry.
    pub resources: Arc<HostResources>,
    /// Managed network lookup.
    pub networks: Arc<dyn NetworkLookup>,
    /// Hotplug subscriptions.
    pub hotplug: Arc<HotplugRegistry>,
    /// Per-address neighbour probe timeout.
    pub probe_timeout: Duration,
    /// Root of per-instance device node directories.
    pub devices_dir: PathBuf,
}

/// State every driver carries.
#[derive(Clone)]
pub struct DeviceCommon {
    /// Device name within the instance.
    pub name: String,
    /// Device configuration, possibly rewritten by `validate_config`.
    pub config: DeviceConfig,
    /// Owning instance.
    pub inst: Arc<InstanceContext>,
    /// Host access.
    pub ctx: HostContext,
    /// This device's volatile keys.
    pub volatile: Volatile,
}

impl DeviceCommon {
    fn new(inst: Arc<InstanceContext>, ctx: HostContext, name: &str, config: DeviceConfig) -> Self {
        let volatile = Volatile::new(ctx.store.clone(), &inst.key(), name);
        Self {
            name: name.to_string(),
            config,
            inst,
            ctx,
            volatile,
        }
    }

    /// Host backend.
    pub fn host(&self) -> &dyn Host {
        self.ctx.host.as_ref()
    }

    /// Identity used when registering on shared resources.
    pub fn user(&self) -> ResourceUser {
        (self.inst.key(), self.name.clone())
    }

    /// Owner string used for SR-IOV claims (`project/instance/device`).
    pub fn owner(&self) -> String {
        format!("{}/{}", self.inst.key(), self.name)
    }

    /// Value of a volatile key, `""` when unset.
    pub fn volatile_value(&self, key: &str) -> Result<String> {
        Ok(self.volatile.get()?.remove(key).unwrap_or_default())
    }

    /// Write a batch of volatile keys.
    pub fn save(&self, pairs: &[(&str, String)]) -> Result<()> {
        let values: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        self.volatile.set(&values)
    }

    /// Reject the device for VMs with stateful migration enabled.
    fn reject_stateful_migration(&self, what: &str) -> Result<()> {
        if self.inst.is_vm() && self.inst.is_stateful_migration() {
            return Err(Error::environment(format!(
                "{} cannot be used when migration.stateful is enabled",
                what
            )));
        }
        Ok(())
    }
}

/// Restrict a device to some instance kinds.
fn require_kind(inst: &InstanceContext, container: bool, vm: bool) -> Result<()> {
    if (inst.is_container() && container) || (inst.is_vm() && vm) {
        Ok(())
    } else {
        Err(Error::UnsupportedDevType)
    }
}

/// Whether `gpu` is selected by the `vendorid`, `productid`, `pci` and `id`
/// keys. Unset keys match anything.
fn gpu_selected(config: &DeviceConfig, gpu: &GpuCard) -> bool {
    let id_matches = match config.get("id") {
        "" => true,
        id => gpu.drm_card_id.is_some_and(|card| card.to_string() == id),
    };
    (config.get("vendorid").is_empty() || gpu.vendor_id == config.get("vendorid"))
        && (config.get("productid").is_empty() || gpu.product_id == config.get("productid"))
        && (config.get("pci").is_empty() || gpu.pci_address == config.get("pci"))
        && id_matches
}

/// GPU selection keys must not be combined with `pci` or `id`.
fn validate_gpu_selection(config: &DeviceConfig) -> Result<()> {
    if config.has("pci") {
        for key in ["id", "productid", "vendorid"] {
            if config.has(key) {
                return Err(Error::config(format!(
                    "Cannot use {:?} when \"pci\" is set",
                    key
                )));
            }
        }
    }
    if config.has("id") {
        for key in ["pci", "productid", "vendorid"] {
            if config.has(key) {
                return Err(Error::config(format!(
                    "Cannot use {:?} when \"id\" is set",
                    key
                )));
            }
        }
    }
    Ok(())
}

// ============================================================================
// Capability contract
// ============================================================================

/// Lifecycle of one device.
pub trait Device: Send {
    /// Device name within the instance.
    fn name(&self) -> &str;

    /// Effective configuration.
    fn config(&self) -> &DeviceConfig;

    /// Check the configuration without touching the host.
    ///
    /// May rewrite derived fields, such as `parent` from `network`.
    fn validate_config(&mut self) -> Result<()>;

    /// Host preconditions checked right before [`start`](Self::start).
    fn validate_environment(&self) -> Result<()> {
        Ok(())
    }

    /// Whether the device can be attached to a running instance.
    fn can_hot_plug(&self) -> bool;

    /// Keys that may change on a running device without re-adding it.
    fn updatable_fields(&self, _old: &DeviceConfig) -> Vec<String> {
        Vec::new()
    }

    /// Set up host state and describe what to attach.
    ///
    /// On error no host state is left behind.
    fn start(&mut self) -> Result<RunConfig>;

    /// Apply a change to updatable fields.
    fn update(&mut self, _old_devices: &Devices, _is_running: bool) -> Result<()> {
        Ok(())
    }

    /// Describe what to detach. The returned post hooks do the host cleanup
    /// and clear volatile state.
    fn stop(&mut self) -> Result<RunConfig>;
}

/// One variant per device kind.
#[derive(Clone)]
pub enum Driver {
    /// Routed NIC.
    Routed(NicRouted),
    /// IPVLAN NIC.
    Ipvlan(NicIpvlan),
    /// Point-to-point NIC.
    P2p(NicP2p),
    /// Bridged NIC.
    Bridged(NicBridged),
    /// Physical NIC.
    Physical(NicPhysical),
    /// SR-IOV NIC.
    Sriov(NicSriov),
    /// WireGuard NIC.
    Wireguard(NicWireguard),
    /// PCI passthrough.
    Pci(PciPassthrough),
    /// GPU mediated device.
    GpuMdev(GpuMdev),
    /// GPU MIG slice.
    GpuMig(GpuMig),
    /// USB passthrough.
    Usb(Usb),
    /// Unix char or block device.
    Unix(UnixDevice),
}

macro_rules! dispatch {
    ($self:expr, $d:ident => $body:expr) => {
        match $self {
            Driver::Routed($d) => $body,
            Driver::Ipvlan($d) => $body,
            Driver::P2p($d) => $body,
            Driver::Bridged($d) => $body,
            Driver::Physical($d) => $body,
            Driver::Sriov($d) => $body,
            Driver::Wireguard($d) => $body,
            Driver::Pci($d) => $body,
            Driver::GpuMdev($d) => $body,
            Driver::GpuMig($d) => $body,
            Driver::Usb($d) => $body,
            Driver::Unix($d) => $body,
        }
    };
}

impl Driver {
    /// Short kind label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Driver::Routed(_) => "nic.routed",
            Driver::Ipvlan(_) => "nic.ipvlan",
            Driver::P2p(_) => "nic.p2p",
            Driver::Bridged(_) => "nic.bridged",
            Driver::Physical(_) => "nic.physical",
            Driver::Sriov(_) => "nic.sriov",
            Driver::Wireguard(_) => "nic.wireguard",
            Driver::Pci(_) => "pci",
            Driver::GpuMdev(_) => "gpu.mdev",
            Driver::GpuMig(_) => "gpu.mig",
            Driver::Usb(_) => "usb",
            Driver::Unix(_) => "unix",
        }
    }
}

impl Device for Driver {
    fn name(&self) -> &str {
        dispatch!(self, d => d.name())
    }

    fn config(&self) -> &DeviceConfig {
        dispatch!(self, d => d.config())
    }

    fn validate_config(&mut self) -> Result<()> {
        dispatch!(self, d => d.validate_config())
    }

    fn validate_environment(&self) -> Result<()> {
        dispatch!(self, d => d.validate_environment())
    }

    fn can_hot_plug(&self) -> bool {
        dispatch!(self, d => d.can_hot_plug())
    }

    fn updatable_fields(&self, old: &DeviceConfig) -> Vec<String> {
        dispatch!(self, d => d.updatable_fields(old))
    }

    fn start(&mut self) -> Result<RunConfig> {
        dispatch!(self, d => d.start())
    }

    fn update(&mut self, old_devices: &Devices, is_running: bool) -> Result<()> {
        dispatch!(self, d => d.update(old_devices, is_running))
    }

    fn stop(&mut self) -> Result<RunConfig> {
        dispatch!(self, d => d.stop())
    }
}

/// Resolve the NIC type of a config, following `network=` when `nictype`
/// is unset.
fn resolve_nictype(inst: &InstanceContext, ctx: &HostContext, config: &DeviceConfig) -> Result<String> {
    if !config.get("nictype").is_empty() {
        return Ok(config.get("nictype").to_string());
    }
    if config.get("network").is_empty() {
        return Err(Error::validation("nictype", "required value"));
    }
    let network = ctx.networks.network(&inst.project, config.get("network"))?;
    let nictype = match network.kind.as_str() {
        "bridge" => "bridged",
        "sriov" => "sriov",
        "physical" => "physical",
        "wireguard" => "wireguard",
        other => {
            return Err(Error::validation(
                "network",
                format!("unsupported network type {:?}", other),
            ))
        }
    };
    Ok(nictype.to_string())
}

/// Build and validate the driver for one device.
pub fn load(
    inst: Arc<InstanceContext>,
    ctx: &HostContext,
    name: &str,
    config: &DeviceConfig,
) -> Result<Driver> {
    let common = |config: DeviceConfig| DeviceCommon::new(inst.clone(), ctx.clone(), name, config);

    let mut driver = match config.kind() {
        "nic" => match resolve_nictype(&inst, ctx, config)?.as_str() {
            "routed" => Driver::Routed(NicRouted::new(common(config.clone()))),
            "ipvlan" => Driver::Ipvlan(NicIpvlan::new(common(config.clone()))),
            "p2p" => Driver::P2p(NicP2p::new(common(config.clone()))),
            "bridged" => Driver::Bridged(NicBridged::new(common(config.clone()))),
            "sriov" => Driver::Sriov(NicSriov::new(common(config.clone()))),
            "wireguard" => Driver::Wireguard(NicWireguard::new(common(config.clone()))),
            "physical" => {
                let parent = config.get("parent");
                if !parent.is_empty() && ctx.host.is_bridge(parent) {
                    tracing::debug!(device = %name, %parent, "physical parent is a bridge, using bridged NIC");
                    Driver::Bridged(NicBridged::new(common(config.clone().with("nictype", "bridged"))))
                } else {
                    Driver::Physical(NicPhysical::new(common(config.clone())))
                }
            }
            other => {
                return Err(Error::validation("nictype", format!("unsupported NIC type {:?}", other)))
            }
        },
        "gpu" => match config.get("gputype") {
            "mdev" => Driver::GpuMdev(GpuMdev::new(common(config.clone()))),
            "mig" => Driver::GpuMig(GpuMig::new(common(config.clone()))),
            other => {
                return Err(Error::validation("gputype", format!("unsupported GPU type {:?}", other)))
            }
        },
        "pci" => Driver::Pci(PciPassthrough::new(common(config.clone()))),
        "usb" => Driver::Usb(Usb::new(common(config.clone()))),
        "unix-char" | "unix-block" => Driver::Unix(UnixDevice::new(common(config.clone()))),
        "" => return Err(Error::validation("type", "required value")),
        other => return Err(Error::validation("type", format!("unsupported device type {:?}", other))),
    };

    driver.validate_config()?;
    tracing::debug!(device = %name, instance = %inst.key(), kind = driver.kind(), "loaded device");
    Ok(driver)
}
