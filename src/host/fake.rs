//! In-memory host used by unit tests.
//!
//! Models just enough kernel behaviour for driver tests: deleting an
//! interface drops its routes, addresses and veth peer; duplicate routes and
//! proxies are rejected; missing objects are reported as not found. Any
//! operation can be made to fail with [`FakeHost::fail_on`].

use super::{
    DeviceNode, GpuCard, Host, LinkInfo, LinkSettings, NetworkCard, NodeOwner, PciDevice, Route,
    TrafficLimits, UsbDeviceInfo, VfSettings, VirtualFunction,
};
use crate::error::{Error, Result};
use crate::network::{IpNet, MacAddr};
use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkKind {
    Physical,
    Bridge,
    Veth { peer: String },
    Tap,
    Vlan { parent: String, id: u16 },
}

#[derive(Debug, Clone)]
pub struct FakeLink {
    pub kind: LinkKind,
    pub mtu: u32,
    pub hwaddr: Option<MacAddr>,
    pub master: Option<String>,
    pub up: bool,
}

impl FakeLink {
    fn new(kind: LinkKind, mtu: u32) -> Self {
        Self {
            kind,
            mtu,
            hwaddr: None,
            master: None,
            up: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct FakeState {
    pub links: BTreeMap<String, FakeLink>,
    pub addrs: BTreeSet<(String, IpNet)>,
    pub routes: BTreeSet<Route>,
    pub neigh_proxies: BTreeSet<(String, IpAddr)>,
    pub sysctls: BTreeMap<String, String>,
    pub rp_filters: BTreeMap<String, String>,
    pub limits: BTreeMap<String, TrafficLimits>,
    pub pci: BTreeMap<String, PciDevice>,
    pub iommu_groups: BTreeMap<String, u64>,
    pub iface_pci: BTreeMap<String, String>,
    pub cards: Vec<NetworkCard>,
    pub vfs: BTreeMap<String, Vec<VirtualFunction>>,
    pub numa_nodes: Vec<u32>,
    pub gpus: Vec<GpuCard>,
    pub mdevs: BTreeMap<String, (String, String)>,
    pub mig: BTreeSet<(u32, u32, u32)>,
    pub usb: Vec<UsbDeviceInfo>,
    pub nodes: BTreeMap<PathBuf, DeviceNode>,
    pub modules: BTreeSet<String>,
    pub in_use: BTreeSet<IpAddr>,
    pub fail: BTreeSet<String>,
    pub ops: Vec<String>,
}

impl FakeState {
    fn check(&mut self, op: &str) -> Result<()> {
        if self.fail.contains(op) {
            return Err(Error::host(op, "injected failure"));
        }
        self.ops.push(op.to_string());
        Ok(())
    }

    fn apply(&mut self, name: &str, settings: &LinkSettings) -> Result<()> {
        let link = self
            .links
            .get_mut(name)
            .ok_or_else(|| Error::not_found(format!("interface {}", name)))?;
        if let Some(mtu) = settings.mtu {
            link.mtu = mtu;
        }
        if let Some(hwaddr) = settings.hwaddr {
            link.hwaddr = Some(hwaddr);
        }
        Ok(())
    }

    fn mdev_profile(&mut self, pci_address: &str, profile: &str) -> Option<&mut u64> {
        for gpu in &mut self.gpus {
            if gpu.pci_address == pci_address {
                return gpu.mdev_profiles.get_mut(profile);
            }
            for vf in &mut gpu.vfs {
                if vf.pci_address == pci_address {
                    return vf.mdev_profiles.get_mut(profile);
                }
            }
        }
        None
    }
}

#[derive(Default)]
pub struct FakeHost {
    state: Mutex<FakeState>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_interface(self, name: &str) -> Self {
        self.state
            .lock()
            .links
            .insert(name.to_string(), FakeLink::new(LinkKind::Physical, 1500));
        self
    }

    pub fn with_bridge(self, name: &str) -> Self {
        self.state
            .lock()
            .links
            .insert(name.to_string(), FakeLink::new(LinkKind::Bridge, 1500));
        self
    }

    pub fn with_sysctl(self, key: &str, value: &str) -> Self {
        self.state
            .lock()
            .sysctls
            .insert(key.to_string(), format!("{}\n", value));
        self
    }

    /// Parent interface ready for routed mode in both families.
    pub fn with_routed_parent(self, name: &str) -> Self {
        self.with_interface(name)
            .with_sysctl(&format!("net/ipv4/conf/{}/forwarding", name), "1")
            .with_sysctl(&format!("net/ipv6/conf/{}/forwarding", name), "1")
            .with_sysctl(&format!("net/ipv6/conf/{}/proxy_ndp", name), "1")
            .with_sysctl("net/ipv6/conf/all/forwarding", "1")
            .with_sysctl("net/ipv6/conf/all/proxy_ndp", "1")
    }

    pub fn with_pci(self, dev: PciDevice, iommu_group: u64) -> Self {
        {
            let mut st = self.state.lock();
            st.iommu_groups.insert(dev.slot_name.clone(), iommu_group);
            st.pci.insert(dev.slot_name.clone(), dev);
        }
        self
    }

    pub fn with_interface_pci(self, iface: &str, slot: &str) -> Self {
        self.state
            .lock()
            .iface_pci
            .insert(iface.to_string(), slot.to_string());
        self
    }

    pub fn with_sriov_card(self, card: NetworkCard, vfs: Vec<VirtualFunction>) -> Self {
        {
            let mut st = self.state.lock();
            st.links
                .insert(card.interface.clone(), FakeLink::new(LinkKind::Physical, 1500));
            for vf in &vfs {
                if let Some(iface) = &vf.interface {
                    st.links
                        .insert(iface.clone(), FakeLink::new(LinkKind::Physical, 1500));
                }
                st.pci.insert(
                    vf.pci_slot.clone(),
                    PciDevice {
                        slot_name: vf.pci_slot.clone(),
                        driver: "iavf".to_string(),
                        vendor_id: card.vendor_id.clone(),
                        product_id: "154c".to_string(),
                        numa_node: card.numa_node,
                    },
                );
                st.iommu_groups.insert(vf.pci_slot.clone(), 40 + u64::from(vf.id));
            }
            st.vfs.insert(card.interface.clone(), vfs);
            st.cards.push(card);
        }
        self
    }

    pub fn with_numa_nodes(self, nodes: &[u32]) -> Self {
        self.state.lock().numa_nodes = nodes.to_vec();
        self
    }

    pub fn with_gpu(self, gpu: GpuCard) -> Self {
        {
            let mut st = self.state.lock();
            st.pci.insert(
                gpu.pci_address.clone(),
                PciDevice {
                    slot_name: gpu.pci_address.clone(),
                    driver: "nvidia".to_string(),
                    vendor_id: gpu.vendor_id.clone(),
                    product_id: gpu.product_id.clone(),
                    numa_node: gpu.numa_node,
                },
            );
            st.gpus.push(gpu);
        }
        self
    }

    pub fn with_mig(self, minor: u32, gi: u32, ci: u32) -> Self {
        self.state.lock().mig.insert((minor, gi, ci));
        self
    }

    pub fn with_usb(self, dev: UsbDeviceInfo) -> Self {
        self.state.lock().usb.push(dev);
        self
    }

    pub fn with_node(self, path: &str, node: DeviceNode) -> Self {
        self.state.lock().nodes.insert(PathBuf::from(path), node);
        self
    }

    pub fn with_address_in_use(self, addr: &str) -> Self {
        if let Ok(ip) = addr.parse() {
            self.state.lock().in_use.insert(ip);
        }
        self
    }

    pub fn fail_on(&self, op: &str) {
        self.state.lock().fail.insert(op.to_string());
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock()
    }

    pub fn has_link(&self, name: &str) -> bool {
        self.state.lock().links.contains_key(name)
    }

    pub fn routes(&self) -> Vec<Route> {
        self.state.lock().routes.iter().cloned().collect()
    }

    pub fn has_neigh_proxy(&self, dev: &str, addr: &str) -> bool {
        match addr.parse::<IpAddr>() {
            Ok(ip) => self
                .state
                .lock()
                .neigh_proxies
                .contains(&(dev.to_string(), ip)),
            Err(_) => false,
        }
    }

    pub fn sysctl(&self, key: &str) -> Option<String> {
        self.state
            .lock()
            .sysctls
            .get(key)
            .map(|v| v.trim().to_string())
    }

    pub fn pci_driver(&self, slot: &str) -> Option<String> {
        self.state.lock().pci.get(slot).map(|d| d.driver.clone())
    }

    pub fn op_count(&self, op: &str) -> usize {
        self.state.lock().ops.iter().filter(|o| *o == op).count()
    }
}

impl Host for FakeHost {
    fn interface_exists(&self, name: &str) -> bool {
        self.state.lock().links.contains_key(name)
    }

    fn is_bridge(&self, name: &str) -> bool {
        self.state
            .lock()
            .links
            .get(name)
            .is_some_and(|l| l.kind == LinkKind::Bridge)
    }

    fn link_info(&self, name: &str) -> Result<LinkInfo> {
        let st = self.state.lock();
        let link = st
            .links
            .get(name)
            .ok_or_else(|| Error::not_found(format!("interface {}", name)))?;
        Ok(LinkInfo {
            mtu: link.mtu,
            hwaddr: link.hwaddr,
            master: link.master.clone(),
        })
    }

    fn create_veth(&self, host_name: &str, peer: &str, settings: &LinkSettings) -> Result<()> {
        let mut st = self.state.lock();
        st.check("create_veth")?;
        if st.links.contains_key(host_name) || st.links.contains_key(peer) {
            return Err(Error::host("create veth", format!("{} exists", host_name)));
        }
        let mtu = settings.mtu.unwrap_or(1500);
        let mut host = FakeLink::new(
            LinkKind::Veth {
                peer: peer.to_string(),
            },
            mtu,
        );
        host.up = true;
        let mut peer_link = FakeLink::new(
            LinkKind::Veth {
                peer: host_name.to_string(),
            },
            mtu,
        );
        peer_link.hwaddr = settings.hwaddr;
        st.links.insert(host_name.to_string(), host);
        st.links.insert(peer.to_string(), peer_link);
        Ok(())
    }

    fn create_tap(&self, name: &str, settings: &LinkSettings) -> Result<()> {
        let mut st = self.state.lock();
        st.check("create_tap")?;
        if st.links.contains_key(name) {
            return Err(Error::host("create tap", format!("{} exists", name)));
        }
        let mut link = FakeLink::new(LinkKind::Tap, settings.mtu.unwrap_or(1500));
        link.up = true;
        st.links.insert(name.to_string(), link);
        Ok(())
    }

    fn create_vlan(&self, parent: &str, name: &str, vlan: u16, _gvrp: bool) -> Result<()> {
        let mut st = self.state.lock();
        st.check("create_vlan")?;
        let mtu = st
            .links
            .get(parent)
            .ok_or_else(|| Error::not_found(format!("interface {}", parent)))?
            .mtu;
        if st.links.contains_key(name) {
            return Err(Error::host("create vlan", format!("{} exists", name)));
        }
        let mut link = FakeLink::new(
            LinkKind::Vlan {
                parent: parent.to_string(),
                id: vlan,
            },
            mtu,
        );
        link.up = true;
        st.links.insert(name.to_string(), link);
        Ok(())
    }

    fn remove_interface(&self, name: &str) -> Result<()> {
        let mut st = self.state.lock();
        st.check("remove_interface")?;
        let link = st
            .links
            .remove(name)
            .ok_or_else(|| Error::not_found(format!("interface {}", name)))?;
        if let LinkKind::Veth { peer } = &link.kind {
            st.links.remove(peer);
        }
        st.addrs.retain(|(dev, _)| dev != name);
        st.routes.retain(|r| r.dev != name);
        st.limits.remove(name);
        Ok(())
    }

    fn set_link(&self, name: &str, settings: &LinkSettings) -> Result<()> {
        let mut st = self.state.lock();
        st.check("set_link")?;
        st.apply(name, settings)
    }

    fn set_link_up(&self, name: &str) -> Result<()> {
        let mut st = self.state.lock();
        st.check("set_link_up")?;
        st.links
            .get_mut(name)
            .ok_or_else(|| Error::not_found(format!("interface {}", name)))?
            .up = true;
        Ok(())
    }

    fn bridge_attach(&self, bridge: &str, iface: &str) -> Result<()> {
        let mut st = self.state.lock();
        st.check("bridge_attach")?;
        if !st.links.contains_key(bridge) {
            return Err(Error::not_found(format!("bridge {}", bridge)));
        }
        st.links
            .get_mut(iface)
            .ok_or_else(|| Error::not_found(format!("interface {}", iface)))?
            .master = Some(bridge.to_string());
        Ok(())
    }

    fn addr_add(&self, dev: &str, addr: &IpNet) -> Result<()> {
        let mut st = self.state.lock();
        st.check("addr_add")?;
        if !st.links.contains_key(dev) {
            return Err(Error::not_found(format!("interface {}", dev)));
        }
        st.addrs.insert((dev.to_string(), *addr));
        Ok(())
    }

    fn route_add(&self, route: &Route) -> Result<()> {
        let mut st = self.state.lock();
        st.check("route_add")?;
        if !st.links.contains_key(&route.dev) {
            return Err(Error::not_found(format!("interface {}", route.dev)));
        }
        if !st.routes.insert(route.clone()) {
            return Err(Error::host("add route", format!("{}: File exists", route)));
        }
        Ok(())
    }

    fn route_delete(&self, route: &Route) -> Result<()> {
        let mut st = self.state.lock();
        st.check("route_delete")?;
        if !st.routes.remove(route) {
            return Err(Error::not_found(format!("route {}", route)));
        }
        Ok(())
    }

    fn neigh_proxy_add(&self, dev: &str, addr: &IpAddr) -> Result<()> {
        let mut st = self.state.lock();
        st.check("neigh_proxy_add")?;
        if !st.neigh_proxies.insert((dev.to_string(), *addr)) {
            return Err(Error::host("add neighbour proxy", "File exists"));
        }
        Ok(())
    }

    fn neigh_proxy_delete(&self, dev: &str, addr: &IpAddr) -> Result<()> {
        let mut st = self.state.lock();
        st.check("neigh_proxy_delete")?;
        if !st.neigh_proxies.remove(&(dev.to_string(), *addr)) {
            return Err(Error::not_found(format!("neighbour proxy {} on {}", addr, dev)));
        }
        Ok(())
    }

    fn probe_address(&self, _parent: &str, addr: &IpAddr, _timeout: Duration) -> Result<bool> {
        let mut st = self.state.lock();
        st.check("probe_address")?;
        Ok(st.in_use.contains(addr))
    }

    fn sysctl_get(&self, key: &str) -> Result<String> {
        self.state
            .lock()
            .sysctls
            .get(key)
            .cloned()
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotFound).into())
    }

    fn sysctl_set(&self, key: &str, value: &str) -> Result<()> {
        let mut st = self.state.lock();
        st.check("sysctl_set")?;
        st.sysctls.insert(key.to_string(), format!("{}\n", value));
        Ok(())
    }

    fn rp_filter_setup(&self, project: &str, instance: &str, device: &str, host_name: &str) -> Result<()> {
        let mut st = self.state.lock();
        st.check("rp_filter_setup")?;
        st.rp_filters.insert(
            format!("{}.{}.{}", project, instance, device),
            host_name.to_string(),
        );
        Ok(())
    }

    fn rp_filter_clear(&self, project: &str, instance: &str, device: &str) -> Result<()> {
        let mut st = self.state.lock();
        st.check("rp_filter_clear")?;
        st.rp_filters
            .remove(&format!("{}.{}.{}", project, instance, device));
        Ok(())
    }

    fn set_limits(&self, iface: &str, limits: &TrafficLimits) -> Result<()> {
        let mut st = self.state.lock();
        st.check("set_limits")?;
        if limits.is_empty() {
            st.limits.remove(iface);
        } else {
            st.limits.insert(iface.to_string(), *limits);
        }
        Ok(())
    }

    fn clear_limits(&self, iface: &str) -> Result<()> {
        let mut st = self.state.lock();
        st.check("clear_limits")?;
        st.limits.remove(iface);
        Ok(())
    }

    fn pci_device(&self, slot: &str) -> Result<PciDevice> {
        self.state
            .lock()
            .pci
            .get(slot)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("PCI device {}", slot)))
    }

    fn pci_device_of_interface(&self, iface: &str) -> Result<PciDevice> {
        let slot = self
            .state
            .lock()
            .iface_pci
            .get(iface)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("PCI device of {}", iface)))?;
        self.pci_device(&slot)
    }

    fn pci_iommu_group(&self, slot: &str) -> Result<u64> {
        self.state
            .lock()
            .iommu_groups
            .get(slot)
            .copied()
            .ok_or_else(|| Error::not_found(format!("IOMMU group of {}", slot)))
    }

    fn pci_bind(&self, slot: &str, driver: &str) -> Result<()> {
        let mut st = self.state.lock();
        st.check("pci_bind")?;
        st.pci
            .get_mut(slot)
            .ok_or_else(|| Error::not_found(format!("PCI device {}", slot)))?
            .driver = driver.to_string();
        Ok(())
    }

    fn load_module(&self, name: &str) -> Result<()> {
        let mut st = self.state.lock();
        st.check("load_module")?;
        st.modules.insert(name.to_string());
        Ok(())
    }

    fn network_cards(&self) -> Result<Vec<NetworkCard>> {
        Ok(self.state.lock().cards.clone())
    }

    fn virtual_functions(&self, parent: &str) -> Result<Vec<VirtualFunction>> {
        self.state
            .lock()
            .vfs
            .get(parent)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("interface {}", parent)))
    }

    fn set_vf(&self, parent: &str, id: u32, settings: &VfSettings) -> Result<()> {
        let mut st = self.state.lock();
        st.check("set_vf")?;
        let vf = st
            .vfs
            .get_mut(parent)
            .and_then(|vfs| vfs.iter_mut().find(|vf| vf.id == id))
            .ok_or_else(|| Error::not_found(format!("VF {} on {}", id, parent)))?;
        vf.settings = settings.clone();
        Ok(())
    }

    fn numa_nodes(&self) -> Result<Vec<u32>> {
        Ok(self.state.lock().numa_nodes.clone())
    }

    fn gpus(&self) -> Result<Vec<GpuCard>> {
        Ok(self.state.lock().gpus.clone())
    }

    fn mdev_create(&self, pci_address: &str, profile: &str, uuid: &str) -> Result<()> {
        let mut st = self.state.lock();
        st.check("mdev_create")?;
        let available = st
            .mdev_profile(pci_address, profile)
            .ok_or_else(|| Error::not_found(format!("mdev profile {} on {}", profile, pci_address)))?;
        if *available == 0 {
            return Err(Error::host("create mdev", "no available instances"));
        }
        *available -= 1;
        st.mdevs.insert(
            uuid.to_string(),
            (pci_address.to_string(), profile.to_string()),
        );
        Ok(())
    }

    fn mdev_remove(&self, uuid: &str) -> Result<()> {
        let mut st = self.state.lock();
        st.check("mdev_remove")?;
        let (pci, profile) = st
            .mdevs
            .remove(uuid)
            .ok_or_else(|| Error::not_found(format!("mdev {}", uuid)))?;
        if let Some(available) = st.mdev_profile(&pci, &profile) {
            *available += 1;
        }
        Ok(())
    }

    fn mdev_exists(&self, uuid: &str) -> bool {
        self.state.lock().mdevs.contains_key(uuid)
    }

    fn mig_instance_exists(&self, gpu_minor: u32, gi: u32, ci: u32) -> bool {
        self.state.lock().mig.contains(&(gpu_minor, gi, ci))
    }

    fn usb_devices(&self) -> Result<Vec<UsbDeviceInfo>> {
        Ok(self.state.lock().usb.clone())
    }

    fn device_node(&self, path: &Path) -> Result<Option<DeviceNode>> {
        Ok(self.state.lock().nodes.get(path).copied())
    }

    fn create_device_node(&self, path: &Path, node: &DeviceNode, _owner: &NodeOwner) -> Result<()> {
        let mut st = self.state.lock();
        st.check("create_device_node")?;
        st.nodes.insert(path.to_path_buf(), *node);
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        let mut st = self.state.lock();
        st.check("remove_file")?;
        st.nodes.remove(path);
        Ok(())
    }
}
