//! Descriptor types exchanged between hostdev and the instance runtime.
//!
//! Device drivers never touch the running instance themselves. Each lifecycle
//! call returns a [`RunDescriptor`] describing what the runtime must attach or
//! detach, and hotplug monitors emit [`HotplugEvent`]s carrying incremental
//! descriptors.
//!
//! All types serialize to JSON so the runtime may live in another process:
//!
//! ```text
//! {"network_interface":[{"key":"type","value":"phys"}, ...], "pci_device":[], ...}
//! ```

#![deny(missing_docs)]

use serde::{Deserialize, Serialize};

/// Descriptor format version.
pub const DESCRIPTOR_VERSION: u32 = 1;

/// Well-known item keys used in network, PCI and GPU item lists.
pub mod keys {
    /// Interface type inside the instance (`phys`, `ipvlan`).
    pub const TYPE: &str = "type";
    /// Interface name inside the instance.
    pub const NAME: &str = "name";
    /// Interface flags (`up`).
    pub const FLAGS: &str = "flags";
    /// Host-side peer or parent the instance interface is linked to.
    pub const LINK: &str = "link";
    /// MAC address.
    pub const HWADDR: &str = "hwaddr";
    /// MTU.
    pub const MTU: &str = "mtu";
    /// Device name as configured on the instance.
    pub const DEV_NAME: &str = "devName";
    /// PCI slot name (`0000:01:00.0`).
    pub const PCI_SLOT_NAME: &str = "pciSlotName";
    /// IOMMU group number of a PCI slot.
    pub const PCI_IOMMU_GROUP: &str = "pciIOMMUGroup";
    /// Mediated device UUID.
    pub const VGPU: &str = "vgpu";
    /// NVIDIA device selector for container runtimes.
    pub const NVIDIA_DEVICE: &str = "nvidia.device";
    /// IPVLAN mode.
    pub const IPVLAN_MODE: &str = "ipvlan.mode";
    /// IPVLAN isolation.
    pub const IPVLAN_ISOLATION: &str = "ipvlan.isolation";
    /// Egress traffic priority.
    pub const LIMITS_PRIORITY: &str = "limits.priority";
    /// Device cgroup allow rule.
    pub const DEVICES_ALLOW: &str = "devices.allow";
    /// Device cgroup deny rule.
    pub const DEVICES_DENY: &str = "devices.deny";
}

// ============================================================================
// Items
// ============================================================================

/// A single key/value item in a descriptor list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfigItem {
    /// Item key.
    pub key: String,
    /// Item value.
    pub value: String,
}

impl RunConfigItem {
    /// Create an item.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A USB device to pass through to a virtual machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbDevice {
    /// Runtime-facing device name (`<device>-BBB-DDD`).
    pub device_name: String,
    /// Host device node (`/dev/bus/usb/BBB/DDD`).
    pub host_device_path: String,
}

/// A bind mount the runtime must set up inside a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountEntry {
    /// Name of the device the mount belongs to.
    pub dev_name: String,
    /// Source path on the host.
    pub dev_path: String,
    /// Target path relative to the container root.
    pub target_path: String,
    /// Filesystem type (`none` for bind mounts).
    pub fs_type: String,
    /// Mount options.
    #[serde(default)]
    pub opts: Vec<String>,
    /// Whether the mount must be id-shifted.
    #[serde(default)]
    pub owner_shift: bool,
}

// ============================================================================
// Descriptor
// ============================================================================

/// What the runtime must attach or detach for one device lifecycle call.
///
/// Lists are append-only: producers only ever extend them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunDescriptor {
    /// Network interface items.
    #[serde(default)]
    pub network_interface: Vec<RunConfigItem>,
    /// PCI device items.
    #[serde(default)]
    pub pci_device: Vec<RunConfigItem>,
    /// GPU device items.
    #[serde(default)]
    pub gpu_device: Vec<RunConfigItem>,
    /// USB devices.
    #[serde(default)]
    pub usb_device: Vec<UsbDevice>,
    /// Device cgroup rules.
    #[serde(default)]
    pub cgroups: Vec<RunConfigItem>,
    /// Mount entries.
    #[serde(default)]
    pub mounts: Vec<MountEntry>,
    /// Raw kernel uevents to forward into the instance.
    #[serde(default)]
    pub uevents: Vec<Vec<String>>,
    /// Attach the NIC on the USB bus instead of PCI.
    #[serde(default)]
    pub use_usb_bus: bool,
}

impl RunDescriptor {
    /// True when there is nothing for the runtime to do.
    pub fn is_empty(&self) -> bool {
        self.network_interface.is_empty()
            && self.pci_device.is_empty()
            && self.gpu_device.is_empty()
            && self.usb_device.is_empty()
            && self.cgroups.is_empty()
            && self.mounts.is_empty()
            && self.uevents.is_empty()
            && !self.use_usb_bus
    }

    /// Append every list of `other` onto this descriptor.
    pub fn extend(&mut self, other: RunDescriptor) {
        self.network_interface.extend(other.network_interface);
        self.pci_device.extend(other.pci_device);
        self.gpu_device.extend(other.gpu_device);
        self.usb_device.extend(other.usb_device);
        self.cgroups.extend(other.cgroups);
        self.mounts.extend(other.mounts);
        self.uevents.extend(other.uevents);
        self.use_usb_bus |= other.use_usb_bus;
    }

    /// Look up the value of a network interface item.
    pub fn network_value(&self, key: &str) -> Option<&str> {
        self.network_interface
            .iter()
            .find(|item| item.key == key)
            .map(|item| item.value.as_str())
    }
}

// ============================================================================
// Hotplug
// ============================================================================

/// Direction of a hotplug change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HotplugAction {
    /// A host device appeared.
    Add,
    /// A host device went away.
    Remove,
}

/// An incremental descriptor produced outside of start/stop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HotplugEvent {
    /// Project of the instance.
    pub project: String,
    /// Instance name.
    pub instance: String,
    /// Device name within the instance.
    pub device: String,
    /// Add or remove.
    pub action: HotplugAction,
    /// What the runtime must attach or detach.
    pub descriptor: RunDescriptor,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extend_appends_in_order() {
        let mut a = RunDescriptor::default();
        a.network_interface.push(RunConfigItem::new(keys::TYPE, "phys"));

        let mut b = RunDescriptor::default();
        b.network_interface.push(RunConfigItem::new(keys::NAME, "eth0"));
        b.use_usb_bus = true;

        a.extend(b);
        assert_eq!(a.network_interface.len(), 2);
        assert_eq!(a.network_interface[1].key, "name");
        assert!(a.use_usb_bus);
        assert_eq!(a.network_value(keys::NAME), Some("eth0"));
    }

    #[test]
    fn test_empty_descriptor() {
        assert!(RunDescriptor::default().is_empty());
    }

    #[test]
    fn test_missing_lists_deserialize_empty() {
        let json = r#"{"network_interface":[{"key":"link","value":"veth1"}]}"#;
        let desc: RunDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(desc.network_value("link"), Some("veth1"));
        assert!(desc.pci_device.is_empty());
        assert!(!desc.use_usb_bus);
    }

    #[test]
    fn test_hotplug_action_wire_names() {
        let json = serde_json::to_string(&HotplugAction::Remove).unwrap();
        assert_eq!(json, "\"remove\"");
    }
}
