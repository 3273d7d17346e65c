//! Host backend for a running Linux kernel.
//!
//! Links, routes and neighbours go through the `ip` command, shaping through
//! `tc` and reverse path filtering through `nft`. PCI, mdev and USB state is
//! read and written under sysfs.

use super::sysfs;
use super::{
    DeviceNode, GpuCard, Host, LinkInfo, LinkSettings, NetworkCard, NodeKind, NodeOwner,
    PciDevice, Route, TrafficLimits, UsbDeviceInfo, VfSettings, VirtualFunction,
};
use crate::config::{DaemonConfig, FirewallBackend};
use crate::error::{Error, Result};
use crate::network::{Family, IpNet, MacAddr};
use std::ffi::CString;
use std::net::IpAddr;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// nftables table holding per-device filter chains.
const NFT_TABLE: &str = "hostdev";

/// Run a command, returning stdout or an error carrying stderr.
fn run(program: &str, args: &[&str]) -> Result<String> {
    let cmdline = format!("{} {}", program, args.join(" "));
    tracing::debug!(command = %cmdline, "running");

    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| Error::command_failed(&cmdline, e.to_string()))?;

    if !output.status.success() {
        return Err(Error::command_failed(
            cmdline,
            String::from_utf8_lossy(&output.stderr).trim(),
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn ip(args: &[&str]) -> Result<String> {
    run("ip", args)
}

fn family_flag(family: Family) -> &'static str {
    match family {
        Family::V4 => "-4",
        Family::V6 => "-6",
    }
}

fn route_args(op: &str, route: &Route) -> Vec<String> {
    let mut args = vec![
        family_flag(route.dest.family()).to_string(),
        "route".to_string(),
        op.to_string(),
        route.dest.network().to_string(),
        "dev".to_string(),
        route.dev.clone(),
    ];
    if let Some(via) = route.via {
        args.extend(["via".to_string(), via.to_string()]);
    }
    if let Some(table) = &route.table {
        args.extend(["table".to_string(), table.clone()]);
    }
    if let Some(vrf) = &route.vrf {
        args.extend(["vrf".to_string(), vrf.clone()]);
    }
    args
}

fn as_strs(args: &[String]) -> Vec<&str> {
    args.iter().map(String::as_str).collect()
}

/// Whether a command error means the object was already gone.
fn is_missing(err: &Error) -> bool {
    match err {
        Error::CommandFailed { message, .. } => {
            message.contains("No such file or directory")
                || message.contains("Cannot find device")
                || message.contains("No such process")
        }
        other => other.is_not_found(),
    }
}

/// Host backend for the running kernel.
#[derive(Debug, Clone)]
pub struct LinuxHost {
    sysfs: PathBuf,
    procfs: PathBuf,
    firewall: FirewallBackend,
}

impl LinuxHost {
    /// Backend rooted at the configured sysfs/procfs mounts.
    pub fn new(config: &DaemonConfig) -> Self {
        Self {
            sysfs: config.sysfs_root.clone(),
            procfs: config.procfs_root.clone(),
            firewall: config.firewall,
        }
    }

    fn net_dir(&self, name: &str) -> PathBuf {
        self.sysfs.join("class/net").join(name)
    }

    fn sysctl_path(&self, key: &str) -> PathBuf {
        self.procfs.join("sys").join(key)
    }

    fn rp_chain(project: &str, instance: &str, device: &str) -> String {
        format!("prert.{}.{}.{}", project, instance, device)
    }

    fn apply_settings(&self, name: &str, settings: &LinkSettings) -> Result<()> {
        if let Some(mtu) = settings.mtu {
            ip(&["link", "set", "dev", name, "mtu", &mtu.to_string()])?;
        }
        if let Some(hwaddr) = settings.hwaddr {
            ip(&["link", "set", "dev", name, "address", &hwaddr.to_string()])?;
        }
        if let Some(qlen) = settings.tx_queue_len {
            ip(&["link", "set", "dev", name, "txqueuelen", &qlen.to_string()])?;
        }
        Ok(())
    }
}

impl Host for LinuxHost {
    fn interface_exists(&self, name: &str) -> bool {
        !name.is_empty() && self.net_dir(name).exists()
    }

    fn is_bridge(&self, name: &str) -> bool {
        !name.is_empty() && self.net_dir(name).join("bridge").exists()
    }

    fn link_info(&self, name: &str) -> Result<LinkInfo> {
        let dir = self.net_dir(name);
        if !dir.exists() {
            return Err(Error::not_found(format!("interface {}", name)));
        }
        let mtu = std::fs::read_to_string(dir.join("mtu"))?
            .trim()
            .parse()
            .map_err(|_| Error::host("read MTU", name))?;
        let hwaddr = std::fs::read_to_string(dir.join("address"))
            .ok()
            .and_then(|s| s.trim().parse::<MacAddr>().ok());
        let master = std::fs::read_link(dir.join("master"))
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()));
        Ok(LinkInfo {
            mtu,
            hwaddr,
            master,
        })
    }

    fn create_veth(&self, host_name: &str, peer: &str, settings: &LinkSettings) -> Result<()> {
        ip(&["link", "add", "dev", host_name, "type", "veth", "peer", "name", peer])?;

        let host_side = LinkSettings {
            hwaddr: None,
            ..settings.clone()
        };
        let result = self
            .apply_settings(host_name, &host_side)
            .and_then(|_| self.apply_settings(peer, settings))
            .and_then(|_| self.set_link_up(host_name));
        if result.is_err() {
            let _ = ip(&["link", "del", "dev", host_name]);
        }
        result
    }

    fn create_tap(&self, name: &str, settings: &LinkSettings) -> Result<()> {
        ip(&["tuntap", "add", "name", name, "mode", "tap", "multi_queue"])?;

        let tap_side = LinkSettings {
            hwaddr: None,
            ..settings.clone()
        };
        let result = self
            .apply_settings(name, &tap_side)
            .and_then(|_| self.set_link_up(name));
        if result.is_err() {
            let _ = ip(&["link", "del", "dev", name]);
        }
        result
    }

    fn create_vlan(&self, parent: &str, name: &str, vlan: u16, gvrp: bool) -> Result<()> {
        ip(&[
            "link",
            "add",
            "link",
            parent,
            "name",
            name,
            "up",
            "type",
            "vlan",
            "id",
            &vlan.to_string(),
            "gvrp",
            if gvrp { "on" } else { "off" },
        ])?;
        Ok(())
    }

    fn remove_interface(&self, name: &str) -> Result<()> {
        ip(&["link", "del", "dev", name]).map(|_| ())
    }

    fn set_link(&self, name: &str, settings: &LinkSettings) -> Result<()> {
        self.apply_settings(name, settings)
    }

    fn set_link_up(&self, name: &str) -> Result<()> {
        ip(&["link", "set", "dev", name, "up"]).map(|_| ())
    }

    fn bridge_attach(&self, bridge: &str, iface: &str) -> Result<()> {
        ip(&["link", "set", "dev", iface, "master", bridge]).map(|_| ())
    }

    fn addr_add(&self, dev: &str, addr: &IpNet) -> Result<()> {
        ip(&[
            family_flag(addr.family()),
            "addr",
            "add",
            &addr.to_string(),
            "dev",
            dev,
        ])
        .map(|_| ())
    }

    fn route_add(&self, route: &Route) -> Result<()> {
        ip(&as_strs(&route_args("add", route))).map(|_| ())
    }

    fn route_delete(&self, route: &Route) -> Result<()> {
        match ip(&as_strs(&route_args("del", route))) {
            Err(e) if is_missing(&e) => Err(Error::not_found(format!("route {}", route))),
            other => other.map(|_| ()),
        }
    }

    fn neigh_proxy_add(&self, dev: &str, addr: &IpAddr) -> Result<()> {
        ip(&["neigh", "add", "proxy", &addr.to_string(), "dev", dev]).map(|_| ())
    }

    fn neigh_proxy_delete(&self, dev: &str, addr: &IpAddr) -> Result<()> {
        match ip(&["neigh", "delete", "proxy", &addr.to_string(), "dev", dev]) {
            Err(e) if is_missing(&e) => Err(Error::not_found(format!(
                "neighbour proxy {} on {}",
                addr, dev
            ))),
            other => other.map(|_| ()),
        }
    }

    fn probe_address(&self, parent: &str, addr: &IpAddr, timeout: Duration) -> Result<bool> {
        let target = addr.to_string();
        let mut cmd = match addr {
            // Duplicate address detection exits 1 once anyone replies.
            IpAddr::V4(_) => {
                let mut c = Command::new("arping");
                c.args(["-D", "-q", "-c", "1", "-w", "1", "-I", parent, &target]);
                c
            }
            IpAddr::V6(_) => {
                let mut c = Command::new("ndisc6");
                c.args(["-q", "-1", "-r", "1", &target, parent]);
                c
            }
        };

        let mut child = match cmd.stdout(Stdio::null()).stderr(Stdio::null()).spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(address = %addr, "neighbour probe tool not installed, skipping probe");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(match addr {
                    IpAddr::V4(_) => status.code() == Some(1),
                    IpAddr::V6(_) => status.success(),
                });
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Ok(false);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn sysctl_get(&self, key: &str) -> Result<String> {
        Ok(std::fs::read_to_string(self.sysctl_path(key))?)
    }

    fn sysctl_set(&self, key: &str, value: &str) -> Result<()> {
        std::fs::write(self.sysctl_path(key), value)?;
        Ok(())
    }

    fn rp_filter_setup(&self, project: &str, instance: &str, device: &str, host_name: &str) -> Result<()> {
        if self.firewall == FirewallBackend::None {
            return Ok(());
        }
        let chain = Self::rp_chain(project, instance, device);
        run("nft", &["add", "table", "inet", NFT_TABLE])?;
        run(
            "nft",
            &[
                "add", "chain", "inet", NFT_TABLE, &chain, "{", "type", "filter", "hook",
                "prerouting", "priority", "-300", ";", "}",
            ],
        )?;
        run("nft", &["flush", "chain", "inet", NFT_TABLE, &chain])?;
        run(
            "nft",
            &[
                "add", "rule", "inet", NFT_TABLE, &chain, "iifname", host_name, "fib", "saddr",
                ".", "iif", "oif", "missing", "drop",
            ],
        )?;
        Ok(())
    }

    fn rp_filter_clear(&self, project: &str, instance: &str, device: &str) -> Result<()> {
        if self.firewall == FirewallBackend::None {
            return Ok(());
        }
        let chain = Self::rp_chain(project, instance, device);
        match run("nft", &["delete", "chain", "inet", NFT_TABLE, &chain]) {
            Err(e) if is_missing(&e) => Ok(()),
            other => other.map(|_| ()),
        }
    }

    fn set_limits(&self, iface: &str, limits: &TrafficLimits) -> Result<()> {
        self.clear_limits(iface)?;

        if let Some(rate) = limits.ingress {
            let rate = format!("{}bit", rate);
            run("tc", &["qdisc", "add", "dev", iface, "root", "handle", "1:0", "htb", "default", "10"])?;
            run(
                "tc",
                &["class", "add", "dev", iface, "parent", "1:0", "classid", "1:10", "htb", "rate", &rate],
            )?;
        }
        if let Some(rate) = limits.egress {
            let rate = format!("{}bit", rate);
            run("tc", &["qdisc", "add", "dev", iface, "handle", "ffff:0", "ingress"])?;
            run(
                "tc",
                &[
                    "filter", "add", "dev", iface, "parent", "ffff:0", "protocol", "all", "u32",
                    "match", "u32", "0", "0", "police", "rate", &rate, "burst", "1024k", "mtu",
                    "64kb", "drop",
                ],
            )?;
        }
        Ok(())
    }

    fn clear_limits(&self, iface: &str) -> Result<()> {
        for args in [
            ["qdisc", "del", "dev", iface, "root"],
            ["qdisc", "del", "dev", iface, "ingress"],
        ] {
            match run("tc", &args) {
                // No qdisc installed.
                Err(Error::CommandFailed { message, .. })
                    if message.contains("Cannot delete qdisc with handle of zero")
                        || message.contains("Cannot find specified qdisc") => {}
                Err(e) if is_missing(&e) => {}
                other => {
                    other?;
                }
            }
        }
        Ok(())
    }

    fn pci_device(&self, slot: &str) -> Result<PciDevice> {
        sysfs::read_pci_device(&sysfs::pci_device_dir(&self.sysfs, slot))
    }

    fn pci_device_of_interface(&self, iface: &str) -> Result<PciDevice> {
        sysfs::read_pci_device(&self.net_dir(iface).join("device"))
    }

    fn pci_iommu_group(&self, slot: &str) -> Result<u64> {
        sysfs::iommu_group(&self.sysfs, slot)
    }

    fn pci_bind(&self, slot: &str, driver: &str) -> Result<()> {
        tracing::info!(slot = %slot, driver = %driver, "rebinding PCI device");
        sysfs::driver_override(&self.sysfs, slot, driver)
    }

    fn load_module(&self, name: &str) -> Result<()> {
        if self.sysfs.join("module").join(name.replace('-', "_")).exists() {
            return Ok(());
        }
        run("modprobe", &["-b", name]).map(|_| ())
    }

    fn network_cards(&self) -> Result<Vec<NetworkCard>> {
        sysfs::scan_network_cards(&self.sysfs)
    }

    fn virtual_functions(&self, parent: &str) -> Result<Vec<VirtualFunction>> {
        let entries = sysfs::scan_vfs(&self.sysfs, parent)?;
        let settings = sysfs::parse_vf_settings(&ip(&["link", "show", "dev", parent])?);

        Ok(entries
            .into_iter()
            .map(|(id, pci_slot, interface)| VirtualFunction {
                id,
                pci_slot,
                interface,
                settings: settings.get(&id).cloned().unwrap_or_default(),
            })
            .collect())
    }

    fn set_vf(&self, parent: &str, id: u32, settings: &VfSettings) -> Result<()> {
        let mac = settings
            .hwaddr
            .map(|m| m.to_string())
            .unwrap_or_else(|| "00:00:00:00:00:00".to_string());
        ip(&[
            "link",
            "set",
            "dev",
            parent,
            "vf",
            &id.to_string(),
            "mac",
            &mac,
            "vlan",
            &settings.vlan.to_string(),
            "spoofchk",
            if settings.spoofcheck { "on" } else { "off" },
        ])
        .map(|_| ())
    }

    fn numa_nodes(&self) -> Result<Vec<u32>> {
        sysfs::numa_nodes(&self.sysfs)
    }

    fn gpus(&self) -> Result<Vec<GpuCard>> {
        sysfs::scan_gpus(&self.sysfs, &self.procfs)
    }

    fn mdev_create(&self, pci_address: &str, profile: &str, uuid: &str) -> Result<()> {
        let path = sysfs::pci_device_dir(&self.sysfs, pci_address)
            .join("mdev_supported_types")
            .join(profile)
            .join("create");
        std::fs::write(&path, uuid)
            .map_err(|e| Error::host(format!("create mdev {} on {}", uuid, pci_address), e))
    }

    fn mdev_remove(&self, uuid: &str) -> Result<()> {
        let path = self.sysfs.join("bus/mdev/devices").join(uuid).join("remove");
        match std::fs::write(&path, "1\n") {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::not_found(format!("mdev {}", uuid)))
            }
            Err(e) => Err(Error::host(format!("remove mdev {}", uuid), e)),
        }
    }

    fn mdev_exists(&self, uuid: &str) -> bool {
        self.sysfs.join("bus/mdev/devices").join(uuid).exists()
    }

    fn mig_instance_exists(&self, gpu_minor: u32, gi: u32, ci: u32) -> bool {
        self.procfs
            .join(format!(
                "driver/nvidia/capabilities/gpu{}/mig/gi{}/ci{}/access",
                gpu_minor, gi, ci
            ))
            .exists()
    }

    fn usb_devices(&self) -> Result<Vec<UsbDeviceInfo>> {
        sysfs::scan_usb(&self.sysfs)
    }

    fn device_node(&self, path: &Path) -> Result<Option<DeviceNode>> {
        let meta = match std::fs::metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let kind = if meta.file_type().is_char_device() {
            NodeKind::Char
        } else if meta.file_type().is_block_device() {
            NodeKind::Block
        } else {
            return Err(Error::config(format!(
                "{} is not a character or block device",
                path.display()
            )));
        };
        Ok(Some(DeviceNode {
            kind,
            major: sysfs::dev_major(meta.rdev()),
            minor: sysfs::dev_minor(meta.rdev()),
        }))
    }

    fn create_device_node(&self, path: &Path, node: &DeviceNode, owner: &NodeOwner) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.remove_file(path)?;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| Error::config(format!("invalid path {}", path.display())))?;
        let kind = match node.kind {
            NodeKind::Char => libc::S_IFCHR,
            NodeKind::Block => libc::S_IFBLK,
        };
        let dev = sysfs::makedev(node.major, node.minor) as libc::dev_t;
        if unsafe { libc::mknod(c_path.as_ptr(), kind | owner.mode as libc::mode_t, dev) } != 0 {
            return Err(Error::host(
                format!("create device node {}", path.display()),
                std::io::Error::last_os_error(),
            ));
        }

        // mknod honours the umask.
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(owner.mode))?;
        std::os::unix::fs::chown(path, Some(owner.uid), Some(owner.gid))?;
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}
