//! Host kernel access.
//!
//! Every interface, route, sysctl, sysfs and firewall operation a device
//! driver performs goes through the [`Host`] trait. [`LinuxHost`] talks to
//! the running kernel; tests use an in-memory model.

mod linux;
pub mod sysfs;

#[cfg(test)]
pub(crate) mod fake;

pub use linux::LinuxHost;

use crate::error::Result;
use crate::network::{IpNet, MacAddr};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

/// A route programmed on the host.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Route {
    /// Output device.
    pub dev: String,
    /// Destination network.
    pub dest: IpNet,
    /// Routing table, `None` for the default lookup.
    pub table: Option<String>,
    /// Next hop.
    pub via: Option<IpAddr>,
    /// VRF device the route lives in.
    pub vrf: Option<String>,
}

impl Route {
    /// Route to `dest` through `dev`.
    pub fn new(dev: impl Into<String>, dest: IpNet) -> Self {
        Self {
            dev: dev.into(),
            dest,
            table: None,
            via: None,
            vrf: None,
        }
    }

    /// Set the routing table.
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// Set the next hop.
    pub fn via(mut self, via: IpAddr) -> Self {
        self.via = Some(via);
        self
    }

    /// Set the VRF.
    pub fn vrf(mut self, vrf: impl Into<String>) -> Self {
        self.vrf = Some(vrf.into());
        self
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} dev {}", self.dest, self.dev)?;
        if let Some(via) = &self.via {
            write!(f, " via {}", via)?;
        }
        if let Some(table) = &self.table {
            write!(f, " table {}", table)?;
        }
        if let Some(vrf) = &self.vrf {
            write!(f, " vrf {}", vrf)?;
        }
        Ok(())
    }
}

/// Link attributes to apply when creating or updating an interface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkSettings {
    /// MTU.
    pub mtu: Option<u32>,
    /// MAC address.
    pub hwaddr: Option<MacAddr>,
    /// Transmit queue length.
    pub tx_queue_len: Option<u32>,
}

/// Current attributes of an interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    /// MTU.
    pub mtu: u32,
    /// MAC address.
    pub hwaddr: Option<MacAddr>,
    /// Bridge or bond the interface is enslaved to.
    pub master: Option<String>,
}

/// Traffic shaping limits in bits per second.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficLimits {
    /// Traffic towards the instance.
    pub ingress: Option<u64>,
    /// Traffic from the instance.
    pub egress: Option<u64>,
}

impl TrafficLimits {
    /// Whether no limit is set.
    pub fn is_empty(&self) -> bool {
        self.ingress.is_none() && self.egress.is_none()
    }
}

/// A PCI function as seen in sysfs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PciDevice {
    /// Slot name (`0000:01:00.0`).
    pub slot_name: String,
    /// Bound driver, empty when unbound.
    pub driver: String,
    /// Vendor ID (4 hex digits).
    pub vendor_id: String,
    /// Product ID (4 hex digits).
    pub product_id: String,
    /// NUMA node, if reported.
    pub numa_node: Option<u32>,
}

/// An SR-IOV capable network card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkCard {
    /// Interface name of the physical function.
    pub interface: String,
    /// PCI address of the physical function.
    pub pci_address: String,
    /// Vendor ID.
    pub vendor_id: String,
    /// Product ID.
    pub product_id: String,
    /// NUMA node, if reported.
    pub numa_node: Option<u32>,
}

/// Current state of one SR-IOV virtual function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualFunction {
    /// VF index on its parent.
    pub id: u32,
    /// PCI slot of the VF.
    pub pci_slot: String,
    /// Host interface of the VF when bound to a network driver.
    pub interface: Option<String>,
    /// Current VF settings.
    pub settings: VfSettings,
}

/// Per-VF settings held by the physical function.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VfSettings {
    /// Administrative MAC address.
    pub hwaddr: Option<MacAddr>,
    /// VLAN tag, 0 for none.
    pub vlan: u16,
    /// MAC spoof checking.
    pub spoofcheck: bool,
}

/// NVIDIA specific GPU details.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NvidiaGpu {
    /// GPU UUID (`GPU-...`).
    pub uuid: String,
    /// Device minor number.
    pub minor: u32,
}

/// A GPU and its mediated device capabilities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuCard {
    /// PCI address.
    pub pci_address: String,
    /// Vendor ID.
    pub vendor_id: String,
    /// Product ID.
    pub product_id: String,
    /// DRM card number.
    pub drm_card_id: Option<u32>,
    /// NUMA node, if reported.
    pub numa_node: Option<u32>,
    /// Supported mdev profiles and their available instance count.
    pub mdev_profiles: BTreeMap<String, u64>,
    /// SR-IOV virtual functions, which may carry their own mdev profiles.
    pub vfs: Vec<GpuCard>,
    /// NVIDIA details, if any.
    pub nvidia: Option<NvidiaGpu>,
}

/// A USB device present on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbDeviceInfo {
    /// Vendor ID (4 hex digits).
    pub vendor_id: String,
    /// Product ID (4 hex digits).
    pub product_id: String,
    /// Serial number, may be empty.
    pub serial: String,
    /// Bus number.
    pub busnum: u32,
    /// Device number on the bus.
    pub devnum: u32,
    /// Character device major.
    pub major: u32,
    /// Character device minor.
    pub minor: u32,
}

impl UsbDeviceInfo {
    /// Device node path (`/dev/bus/usb/BBB/DDD`).
    pub fn dev_path(&self) -> String {
        format!("/dev/bus/usb/{:03}/{:03}", self.busnum, self.devnum)
    }
}

/// Character or block device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NodeKind {
    /// Character device.
    Char,
    /// Block device.
    Block,
}

impl NodeKind {
    /// Single letter used in cgroup rules.
    pub fn letter(self) -> char {
        match self {
            NodeKind::Char => 'c',
            NodeKind::Block => 'b',
        }
    }
}

/// A device node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceNode {
    /// Char or block.
    pub kind: NodeKind,
    /// Major number.
    pub major: u32,
    /// Minor number.
    pub minor: u32,
}

/// Ownership and permissions of a created device node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeOwner {
    /// Owner uid.
    pub uid: u32,
    /// Owner gid.
    pub gid: u32,
    /// Permission bits.
    pub mode: u32,
}

/// Operations against the host kernel.
///
/// Query methods never mutate. Mutations report failure as
/// [`Error::HostMutation`](crate::Error::HostMutation) or
/// [`Error::CommandFailed`](crate::Error::CommandFailed); missing objects
/// surface as not-found errors so teardown can skip them.
pub trait Host: Send + Sync {
    // ------------------------------------------------------------------
    // Links
    // ------------------------------------------------------------------

    /// Whether an interface exists.
    fn interface_exists(&self, name: &str) -> bool;

    /// Whether an interface is a bridge.
    fn is_bridge(&self, name: &str) -> bool;

    /// Current attributes of an interface.
    fn link_info(&self, name: &str) -> Result<LinkInfo>;

    /// Create a veth pair and bring the host side up.
    fn create_veth(&self, host_name: &str, peer: &str, settings: &LinkSettings) -> Result<()>;

    /// Create a tap device and bring it up.
    fn create_tap(&self, name: &str, settings: &LinkSettings) -> Result<()>;

    /// Create a VLAN sub-interface and bring it up.
    fn create_vlan(&self, parent: &str, name: &str, vlan: u16, gvrp: bool) -> Result<()>;

    /// Delete an interface.
    fn remove_interface(&self, name: &str) -> Result<()>;

    /// Apply link settings to an existing interface.
    fn set_link(&self, name: &str, settings: &LinkSettings) -> Result<()>;

    /// Bring an interface up.
    fn set_link_up(&self, name: &str) -> Result<()>;

    /// Enslave an interface to a bridge.
    fn bridge_attach(&self, bridge: &str, iface: &str) -> Result<()>;

    // ------------------------------------------------------------------
    // Addresses, routes and neighbours
    // ------------------------------------------------------------------

    /// Add an address to an interface.
    fn addr_add(&self, dev: &str, addr: &IpNet) -> Result<()>;

    /// Add a route.
    fn route_add(&self, route: &Route) -> Result<()>;

    /// Delete a route.
    fn route_delete(&self, route: &Route) -> Result<()>;

    /// Add a proxy ARP/NDP entry.
    fn neigh_proxy_add(&self, dev: &str, addr: &IpAddr) -> Result<()>;

    /// Delete a proxy ARP/NDP entry.
    fn neigh_proxy_delete(&self, dev: &str, addr: &IpAddr) -> Result<()>;

    /// Whether another host answers for `addr` on `parent`.
    fn probe_address(&self, parent: &str, addr: &IpAddr, timeout: Duration) -> Result<bool>;

    // ------------------------------------------------------------------
    // sysctl and firewall
    // ------------------------------------------------------------------

    /// Read a sysctl by path below `/proc/sys` (`net/ipv4/conf/eth0/forwarding`).
    fn sysctl_get(&self, key: &str) -> Result<String>;

    /// Write a sysctl.
    fn sysctl_set(&self, key: &str, value: &str) -> Result<()>;

    /// Drop packets from `host_name` whose source would not route back to it.
    fn rp_filter_setup(&self, project: &str, instance: &str, device: &str, host_name: &str) -> Result<()>;

    /// Remove the filter installed by [`rp_filter_setup`](Self::rp_filter_setup).
    fn rp_filter_clear(&self, project: &str, instance: &str, device: &str) -> Result<()>;

    /// Apply traffic limits to an interface, replacing previous ones.
    fn set_limits(&self, iface: &str, limits: &TrafficLimits) -> Result<()>;

    /// Remove traffic limits.
    fn clear_limits(&self, iface: &str) -> Result<()>;

    // ------------------------------------------------------------------
    // PCI
    // ------------------------------------------------------------------

    /// Look up a PCI function by slot.
    fn pci_device(&self, slot: &str) -> Result<PciDevice>;

    /// PCI function backing a network interface.
    fn pci_device_of_interface(&self, iface: &str) -> Result<PciDevice>;

    /// IOMMU group of a PCI function.
    fn pci_iommu_group(&self, slot: &str) -> Result<u64>;

    /// Bind a PCI function to exactly `driver`; empty leaves it unbound.
    fn pci_bind(&self, slot: &str, driver: &str) -> Result<()>;

    /// Load a kernel module.
    fn load_module(&self, name: &str) -> Result<()>;

    // ------------------------------------------------------------------
    // SR-IOV and NUMA
    // ------------------------------------------------------------------

    /// SR-IOV capable network cards.
    fn network_cards(&self) -> Result<Vec<NetworkCard>>;

    /// Virtual functions of a physical function.
    fn virtual_functions(&self, parent: &str) -> Result<Vec<VirtualFunction>>;

    /// Change the settings of one VF.
    fn set_vf(&self, parent: &str, id: u32, settings: &VfSettings) -> Result<()>;

    /// NUMA nodes present on the host.
    fn numa_nodes(&self) -> Result<Vec<u32>>;

    // ------------------------------------------------------------------
    // GPU
    // ------------------------------------------------------------------

    /// GPUs with their mdev capabilities.
    fn gpus(&self) -> Result<Vec<GpuCard>>;

    /// Create a mediated device.
    fn mdev_create(&self, pci_address: &str, profile: &str, uuid: &str) -> Result<()>;

    /// Remove a mediated device.
    fn mdev_remove(&self, uuid: &str) -> Result<()>;

    /// Whether a mediated device exists.
    fn mdev_exists(&self, uuid: &str) -> bool;

    /// Whether an NVIDIA MIG compute instance exists.
    fn mig_instance_exists(&self, gpu_minor: u32, gi: u32, ci: u32) -> bool;

    // ------------------------------------------------------------------
    // USB and device nodes
    // ------------------------------------------------------------------

    /// USB devices currently present.
    fn usb_devices(&self) -> Result<Vec<UsbDeviceInfo>>;

    /// Node type and numbers of a path; `None` when it does not exist.
    fn device_node(&self, path: &Path) -> Result<Option<DeviceNode>>;

    /// Create a device node, replacing whatever is at `path`.
    fn create_device_node(&self, path: &Path, node: &DeviceNode, owner: &NodeOwner) -> Result<()>;

    /// Remove a file; missing files are fine.
    fn remove_file(&self, path: &Path) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_display() {
        let route = Route::new("veth1", IpNet::host("203.0.113.5".parse().unwrap())).table("100");
        assert_eq!(route.to_string(), "203.0.113.5/32 dev veth1 table 100");

        let via = Route::new("veth1", "198.51.100.0/24".parse().unwrap())
            .via("203.0.113.5".parse().unwrap())
            .vrf("blue");
        assert_eq!(
            via.to_string(),
            "198.51.100.0/24 dev veth1 via 203.0.113.5 vrf blue"
        );
    }

    #[test]
    fn test_usb_dev_path() {
        let dev = UsbDeviceInfo {
            vendor_id: "0781".into(),
            product_id: "5581".into(),
            serial: String::new(),
            busnum: 1,
            devnum: 12,
            major: 189,
            minor: 11,
        };
        assert_eq!(dev.dev_path(), "/dev/bus/usb/001/012");
    }
}
