//! sysfs and procfs readers.
//!
//! Every function takes the mount root explicitly so the same code reads the
//! live kernel and a directory tree built in a test.

use super::{GpuCard, NetworkCard, NvidiaGpu, PciDevice, UsbDeviceInfo, VfSettings};
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Parse `KEY=value` lines.
pub fn parse_uevent(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

fn read_trimmed(path: &Path) -> Result<String> {
    Ok(fs::read_to_string(path)?.trim().to_string())
}

fn read_optional(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

fn link_basename(path: &Path) -> Option<String> {
    fs::read_link(path)
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
}

fn numa_node(dir: &Path) -> Option<u32> {
    read_optional(&dir.join("numa_node"))
        .and_then(|v| v.parse::<i64>().ok())
        .and_then(|n| u32::try_from(n).ok())
}

fn strip_hex(v: &str) -> String {
    v.trim_start_matches("0x").to_ascii_lowercase()
}

/// Sorted directory entries; a missing directory reads as empty.
fn entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = match fs::read_dir(dir) {
        Ok(rd) => rd
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .collect::<Vec<_>>(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e.into()),
    };
    out.sort();
    Ok(out)
}

/// sysfs directory of a PCI slot.
pub fn pci_device_dir(sysfs: &Path, slot: &str) -> PathBuf {
    sysfs.join("bus/pci/devices").join(slot)
}

/// Read a PCI function from its sysfs directory.
///
/// The bound driver comes from the `driver` link, so it reflects rebinding
/// done after boot.
pub fn read_pci_device(dir: &Path) -> Result<PciDevice> {
    let uevent = match fs::read_to_string(dir.join("uevent")) {
        Ok(text) => parse_uevent(&text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::not_found(format!("PCI device {}", dir.display())))
        }
        Err(e) => return Err(e.into()),
    };

    let slot_name = uevent
        .get("PCI_SLOT_NAME")
        .cloned()
        .ok_or_else(|| Error::not_found(format!("PCI_SLOT_NAME in {}", dir.display())))?;
    let (vendor_id, product_id) = uevent
        .get("PCI_ID")
        .and_then(|id| id.split_once(':'))
        .map(|(v, p)| (v.to_ascii_lowercase(), p.to_ascii_lowercase()))
        .unwrap_or_default();
    let driver = link_basename(&dir.join("driver"))
        .or_else(|| uevent.get("DRIVER").cloned())
        .unwrap_or_default();

    Ok(PciDevice {
        slot_name,
        driver,
        vendor_id,
        product_id,
        numa_node: numa_node(dir),
    })
}

/// IOMMU group number of a PCI slot.
pub fn iommu_group(sysfs: &Path, slot: &str) -> Result<u64> {
    let link = pci_device_dir(sysfs, slot).join("iommu_group");
    let name = link_basename(&link)
        .ok_or_else(|| Error::not_found(format!("IOMMU group of {}", slot)))?;
    name.parse()
        .map_err(|_| Error::host("read IOMMU group", format!("{}: {:?}", slot, name)))
}

/// Rebind a PCI function to exactly `driver`.
///
/// The function is unbound from whatever holds it, the override is set and
/// the kernel asked to probe. An empty `driver` clears the override and
/// leaves the function unbound.
pub fn driver_override(sysfs: &Path, slot: &str, driver: &str) -> Result<()> {
    let dir = pci_device_dir(sysfs, slot);
    if !dir.exists() {
        return Err(Error::not_found(format!("PCI device {}", slot)));
    }

    if let Some(current) = link_basename(&dir.join("driver")) {
        if current == driver {
            return Ok(());
        }
        let unbind = dir.join("driver").join("unbind");
        fs::write(&unbind, slot)
            .map_err(|e| Error::host(format!("unbind {} from {}", slot, current), e))?;
    }

    let value = if driver.is_empty() { "\n" } else { driver };
    fs::write(dir.join("driver_override"), value)
        .map_err(|e| Error::host(format!("set driver override on {}", slot), e))?;

    if driver.is_empty() {
        return Ok(());
    }

    fs::write(sysfs.join("bus/pci/drivers_probe"), slot)
        .map_err(|e| Error::host(format!("probe {}", slot), e))?;

    let bound = read_pci_device(&dir)?.driver;
    if bound != driver {
        return Err(Error::host(
            format!("bind {} to {}", slot, driver),
            format!("device is bound to {:?}", bound),
        ));
    }
    Ok(())
}

/// SR-IOV capable network cards, by physical function interface.
pub fn scan_network_cards(sysfs: &Path) -> Result<Vec<NetworkCard>> {
    let mut cards = Vec::new();
    for iface in entries(&sysfs.join("class/net"))? {
        let device = iface.join("device");
        let total: u32 = read_optional(&device.join("sriov_totalvfs"))
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        if total == 0 {
            continue;
        }
        let pci = read_pci_device(&device)?;
        cards.push(NetworkCard {
            interface: file_name(&iface),
            pci_address: pci.slot_name,
            vendor_id: pci.vendor_id,
            product_id: pci.product_id,
            numa_node: pci.numa_node,
        });
    }
    Ok(cards)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// A VF discovered in sysfs: index, PCI slot and bound interface.
pub type VfEntry = (u32, String, Option<String>);

/// Virtual functions of a physical function interface.
pub fn scan_vfs(sysfs: &Path, parent: &str) -> Result<Vec<VfEntry>> {
    let device = sysfs.join("class/net").join(parent).join("device");
    if !device.exists() {
        return Err(Error::not_found(format!("interface {}", parent)));
    }

    let mut vfs = Vec::new();
    for entry in entries(&device)? {
        let name = file_name(&entry);
        let Some(id) = name.strip_prefix("virtfn").and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        let Some(slot) = link_basename(&entry) else {
            continue;
        };
        let iface = entries(&entry.join("net"))?.first().map(|p| file_name(p));
        vfs.push((id, slot, iface));
    }
    vfs.sort_by_key(|(id, _, _)| *id);
    Ok(vfs)
}

/// Parse per-VF settings from `ip link show <pf>` output.
pub fn parse_vf_settings(output: &str) -> BTreeMap<u32, VfSettings> {
    let mut out = BTreeMap::new();
    for line in output.lines() {
        let line = line.trim();
        let Some(rest) = line.strip_prefix("vf ") else {
            continue;
        };
        let mut words = rest.split_whitespace();
        let Some(id) = words.next().and_then(|w| w.parse::<u32>().ok()) else {
            continue;
        };

        let mut settings = VfSettings::default();
        let tokens: Vec<&str> = rest
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|t| !t.is_empty())
            .collect();
        for pair in tokens.windows(2) {
            match pair[0] {
                "link/ether" | "MAC" => {
                    settings.hwaddr = pair[1]
                        .parse::<crate::network::MacAddr>()
                        .ok()
                        .filter(|mac| mac.0 != [0; 6]);
                }
                "vlan" => settings.vlan = pair[1].parse().unwrap_or(0),
                _ => {}
            }
        }
        if let Some(idx) = tokens.iter().position(|t| *t == "spoof") {
            settings.spoofcheck = tokens.get(idx + 2) == Some(&"on");
        }
        out.insert(id, settings);
    }
    out
}

/// NUMA nodes listed under `devices/system/node`.
pub fn numa_nodes(sysfs: &Path) -> Result<Vec<u32>> {
    let mut nodes: Vec<u32> = entries(&sysfs.join("devices/system/node"))?
        .iter()
        .filter_map(|p| file_name(p).strip_prefix("node")?.parse().ok())
        .collect();
    nodes.sort_unstable();
    Ok(nodes)
}

fn read_gpu(sysfs: &Path, procfs: &Path, dir: &Path, with_vfs: bool) -> Result<GpuCard> {
    let pci = read_pci_device(dir)?;

    let mut mdev_profiles = BTreeMap::new();
    for profile in entries(&dir.join("mdev_supported_types"))? {
        let available = read_optional(&profile.join("available_instances"))
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        mdev_profiles.insert(file_name(&profile), available);
    }

    let drm_card_id = entries(&dir.join("drm"))?
        .iter()
        .filter_map(|p| file_name(p).strip_prefix("card")?.parse().ok())
        .next();

    let mut vfs = Vec::new();
    if with_vfs {
        for entry in entries(dir)? {
            if file_name(&entry).starts_with("virtfn") {
                if let Some(slot) = link_basename(&entry) {
                    vfs.push(read_gpu(sysfs, procfs, &pci_device_dir(sysfs, &slot), false)?);
                }
            }
        }
    }

    let info = procfs
        .join("driver/nvidia/gpus")
        .join(&pci.slot_name)
        .join("information");
    let nvidia = read_optional(&info).and_then(|text| {
        let mut uuid = None;
        let mut minor = None;
        for line in text.lines() {
            if let Some((k, v)) = line.split_once(':') {
                match k.trim() {
                    "GPU UUID" => uuid = Some(v.trim().to_string()),
                    "Device Minor" => minor = v.trim().parse().ok(),
                    _ => {}
                }
            }
        }
        Some(NvidiaGpu {
            uuid: uuid?,
            minor: minor?,
        })
    });

    Ok(GpuCard {
        pci_address: pci.slot_name,
        vendor_id: pci.vendor_id,
        product_id: pci.product_id,
        drm_card_id,
        numa_node: pci.numa_node,
        mdev_profiles,
        vfs,
        nvidia,
    })
}

/// Display-class PCI functions.
pub fn scan_gpus(sysfs: &Path, procfs: &Path) -> Result<Vec<GpuCard>> {
    let mut gpus = Vec::new();
    for dir in entries(&sysfs.join("bus/pci/devices"))? {
        let class = read_optional(&dir.join("class")).unwrap_or_default();
        if !class.starts_with("0x03") {
            continue;
        }
        // VFs are reported under their physical function.
        if dir.join("physfn").exists() {
            continue;
        }
        gpus.push(read_gpu(sysfs, procfs, &dir, true)?);
    }
    Ok(gpus)
}

/// USB devices under `bus/usb/devices`.
pub fn scan_usb(sysfs: &Path) -> Result<Vec<UsbDeviceInfo>> {
    let mut out = Vec::new();
    for dir in entries(&sysfs.join("bus/usb/devices"))? {
        let Some(vendor) = read_optional(&dir.join("idVendor")) else {
            continue;
        };
        let product = read_trimmed(&dir.join("idProduct"))?;
        let dev = read_trimmed(&dir.join("dev"))?;
        let (major, minor) = dev
            .split_once(':')
            .and_then(|(a, b)| Some((a.parse().ok()?, b.parse().ok()?)))
            .ok_or_else(|| Error::host("read USB device", format!("bad dev {:?}", dev)))?;

        out.push(UsbDeviceInfo {
            vendor_id: strip_hex(&vendor),
            product_id: strip_hex(&product),
            serial: read_optional(&dir.join("serial")).unwrap_or_default(),
            busnum: read_trimmed(&dir.join("busnum"))?.parse().unwrap_or(0),
            devnum: read_trimmed(&dir.join("devnum"))?.parse().unwrap_or(0),
            major,
            minor,
        });
    }
    Ok(out)
}

/// Major number of a `dev_t`.
pub fn dev_major(dev: u64) -> u32 {
    (((dev >> 32) & 0xffff_f000) | ((dev >> 8) & 0x0000_0fff)) as u32
}

/// Minor number of a `dev_t`.
pub fn dev_minor(dev: u64) -> u32 {
    (((dev >> 12) & 0xffff_ff00) | (dev & 0x0000_00ff)) as u32
}

/// Build a `dev_t`.
pub fn makedev(major: u32, minor: u32) -> u64 {
    let (major, minor) = (u64::from(major), u64::from(minor));
    ((major & 0xffff_f000) << 32)
        | ((major & 0x0000_0fff) << 8)
        | ((minor & 0xffff_ff00) << 12)
        | (minor & 0x0000_00ff)
}
