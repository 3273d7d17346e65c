//! Network interface drivers and the helpers they share.
//!
//! | nictype   | instance side            | host side                                 |
//! |-----------|--------------------------|-------------------------------------------|
//! | routed    | veth peer / tap          | gateway address, host routes, neigh proxy |
//! | ipvlan    | ipvlan slave of parent   | `lo` routes, neigh proxy (l3s)            |
//! | p2p       | veth peer / tap          | static routes via the host side           |
//! | bridged   | veth peer / tap          | host side enslaved to the bridge          |
//! | physical  | the parent itself        | VLAN, MTU/MAC snapshot, PCI rebind (VM)   |
//! | sriov     | a virtual function       | VF claim, VF settings, PCI rebind (VM)    |
//! | wireguard | as routed                | as routed, parent from the network        |

mod bridged;
mod ipvlan;
mod p2p;
mod physical;
mod routed;
mod sriov;
mod wireguard;

pub use bridged::NicBridged;
pub use ipvlan::NicIpvlan;
pub use p2p::NicP2p;
pub use physical::NicPhysical;
pub use routed::NicRouted;
pub use sriov::NicSriov;
pub use wireguard::NicWireguard;

use super::validate::{self, list_of, one_of, optional, uint32_range, Check};
use super::{
    DeviceCommon, DeviceConfig, Reverter, Rules, RunConfig, VOLATILE_CREATED, VOLATILE_HWADDR,
    VOLATILE_MTU,
};
use crate::error::{Error, Result};
use crate::host::{Host, LinkSettings, Route, TrafficLimits};
use crate::network::{split_list, Family, IpNet, MacAddr, IFNAMSIZ};
use crate::resources::VOLATILE_VLAN_PARENT;
use hostdev_protocol::keys;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

/// Main routing table.
pub(crate) const MAIN_TABLE: &str = "254";

/// Checker for one NIC field.
pub(super) fn nic_check(field: &str) -> Check {
    match field {
        "name" | "parent" | "host_name" => optional(validate::is_interface_name),
        "mtu" => optional(validate::is_network_mtu),
        "hwaddr" => optional(validate::is_network_mac),
        "vlan" => optional(validate::is_network_vlan),
        "gvrp" | "security.mac_filtering" | "attached" | "ipv4.neighbor_probe"
        | "ipv6.neighbor_probe" => optional(validate::is_bool),
        "queue.tx.length" | "limits.priority" | "boot.priority" | "ipv4.host_table"
        | "ipv6.host_table" => optional(validate::is_uint32),
        "limits.ingress" | "limits.egress" | "limits.max" => optional(validate::is_bit_rate),
        "ipv4.gateway" | "ipv6.gateway" => optional(one_of(&["auto", "none"])),
        "ipv4.address" | "ipv4.host_address" => optional(validate::is_ipv4_address),
        "ipv6.address" | "ipv6.host_address" => optional(validate::is_ipv6_address),
        "ipv4.routes" => optional(list_of(validate::is_ipv4_cidr)),
        "ipv6.routes" => optional(list_of(validate::is_ipv6_cidr)),
        "ipv4.host_tables" | "ipv6.host_tables" => optional(list_of(uint32_range(0, 255))),
        "io.bus" => optional(one_of(&["virtio", "usb"])),
        "vendorid" | "productid" => optional(validate::is_device_id),
        "pci" => optional(validate::is_pci_address),
        _ => optional(validate::is_any),
    }
}

/// Rules for the given NIC fields.
pub(super) fn nic_rules(fields: &[&str]) -> Rules {
    let mut rules = Rules::new();
    for field in fields {
        rules.insert(*field, nic_check(field));
    }
    rules
}

/// Parse the comma separated addresses of one family.
pub(super) fn addresses(config: &DeviceConfig, family: Family) -> Result<Vec<IpAddr>> {
    let key = family.key("address");
    split_list(config.get(&key))
        .iter()
        .map(|a| {
            a.parse::<IpAddr>()
                .map_err(|_| Error::validation(key.clone(), format!("invalid address {:?}", a)))
        })
        .collect()
}

/// Parse a comma separated CIDR list.
pub(super) fn cidrs(config: &DeviceConfig, key: &str) -> Result<Vec<IpNet>> {
    split_list(config.get(key))
        .iter()
        .map(|c| c.parse::<IpNet>())
        .collect()
}

/// Reject an address listed twice.
pub(super) fn check_duplicates(config: &DeviceConfig, family: Family) -> Result<()> {
    let key = family.key("address");
    let mut seen = Vec::new();
    for addr in split_list(config.get(&key)) {
        if seen.contains(&addr) {
            return Err(Error::config(format!("Duplicate address {:?} in {:?}", addr, key)));
        }
        seen.push(addr);
    }
    Ok(())
}

/// Routing tables host routes go into.
///
/// `host_tables` wins when set. Otherwise a legacy `host_table` adds one
/// table next to main. Main is always used when nothing else is configured.
pub(super) fn host_tables(config: &DeviceConfig, family: Family) -> Vec<String> {
    let tables = split_list(config.get(&family.key("host_tables")));
    if !tables.is_empty() {
        return tables;
    }
    match config.get(&family.key("host_table")) {
        "" | MAIN_TABLE => vec![MAIN_TABLE.to_string()],
        legacy => vec![legacy.to_string(), MAIN_TABLE.to_string()],
    }
}

/// Traffic limits from `limits.*`; `limits.max` sets both directions.
pub(super) fn traffic_limits(config: &DeviceConfig) -> Result<TrafficLimits> {
    let rate = |key: &str| -> Result<Option<u64>> {
        match config.get(key) {
            "" => Ok(None),
            v => validate::parse_bit_rate(v)
                .map(Some)
                .map_err(|reason| Error::validation(key, reason)),
        }
    };

    if let Some(max) = rate("limits.max")? {
        return Ok(TrafficLimits {
            ingress: Some(max),
            egress: Some(max),
        });
    }
    Ok(TrafficLimits {
        ingress: rate("limits.ingress")?,
        egress: rate("limits.egress")?,
    })
}

/// Keys the traffic limits are read from.
pub(super) const LIMIT_KEYS: [&str; 4] = ["limits.ingress", "limits.egress", "limits.max", "limits.priority"];

/// A free interface name starting with `prefix`.
pub(super) fn unique_host_name(host: &dyn Host, prefix: &str) -> Result<String> {
    for _ in 0..100 {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let take = IFNAMSIZ.saturating_sub(prefix.len()).min(8);
        let name = format!("{}{}", prefix, &suffix[..take]);
        if !host.interface_exists(&name) {
            return Ok(name);
        }
    }
    Err(Error::exhausted(format!("no free interface name with prefix {:?}", prefix)))
}

/// MAC address of the instance-side interface.
pub(super) fn nic_hwaddr(common: &DeviceCommon) -> Result<MacAddr> {
    match common.config.get("hwaddr") {
        "" => Ok(MacAddr::derive(&common.owner())),
        v => v.parse(),
    }
}

/// Link settings for a freshly created transport.
pub(super) fn transport_settings(common: &DeviceCommon) -> Result<LinkSettings> {
    let parse_u32 = |key: &str| -> Result<Option<u32>> {
        match common.config.get(key) {
            "" => Ok(None),
            v => v
                .parse()
                .map(Some)
                .map_err(|_| Error::validation(key, format!("invalid value {:?}", v))),
        }
    };
    Ok(LinkSettings {
        mtu: parse_u32("mtu")?,
        hwaddr: Some(nic_hwaddr(common)?),
        tx_queue_len: parse_u32("queue.tx.length")?,
    })
}

/// Create the veth pair (containers) or tap (VMs) for `host_name`.
///
/// Returns the name the instance side links to: the veth peer for
/// containers, the tap itself for VMs. An undo step removing it is pushed.
pub(super) fn create_transport<'a>(
    common: &'a DeviceCommon,
    revert: &mut Reverter<'a>,
    host_name: &str,
) -> Result<String> {
    let host = common.host();
    let settings = transport_settings(common)?;

    let link = if common.inst.is_vm() {
        host.create_tap(host_name, &settings)?;
        host_name.to_string()
    } else {
        let peer = unique_host_name(host, "veth")?;
        host.create_veth(host_name, &peer, &settings)?;
        peer
    };
    tracing::info!(device = %common.name, %host_name, %link, "created transport interface");

    let undo = host_name.to_string();
    revert.add(move || common.host().remove_interface(&undo));
    Ok(link)
}

/// Host-side interface name: the configured one, or a fresh one.
pub(super) fn choose_host_name(common: &DeviceCommon) -> Result<String> {
    match common.config.get("host_name") {
        "" => {
            let prefix = if common.inst.is_vm() { "tap" } else { "veth" };
            unique_host_name(common.host(), prefix)
        }
        name => Ok(name.to_string()),
    }
}

/// Append the items shared by every veth/tap based NIC.
pub(super) fn transport_items(run: &mut RunConfig, common: &DeviceCommon, link: &str) -> Result<()> {
    run.network(keys::TYPE, "phys")
        .network(keys::NAME, common.config.get("name"))
        .network(keys::FLAGS, "up")
        .network(keys::LINK, link)
        .network(keys::HWADDR, nic_hwaddr(common)?.to_string());
    if common.inst.is_vm() {
        run.network(keys::DEV_NAME, common.name.as_str());
        if common.config.has("mtu") {
            run.network(keys::MTU, common.config.get("mtu"));
        }
        if common.config.get("io.bus") == "usb" {
            run.descriptor.use_usb_bus = true;
        }
    } else if common.config.has("mtu") {
        run.network(keys::MTU, common.config.get("mtu"));
    }
    if common.config.has("limits.priority") {
        run.network(keys::LIMITS_PRIORITY, common.config.get("limits.priority"));
    }
    Ok(())
}

/// Whether a sysctl reads `1`.
pub(super) fn sysctl_enabled(host: &dyn Host, key: &str) -> Result<bool> {
    Ok(host.sysctl_get(key)?.trim() == "1")
}

/// Write a sysctl that may not exist for this interface type.
pub(super) fn sysctl_set_if_present(host: &dyn Host, key: &str, value: &str) -> Result<()> {
    ignore_missing(host.sysctl_set(key, value))
}

/// Treat a missing host object as success.
pub(super) fn ignore_missing(res: Result<()>) -> Result<()> {
    match res {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

/// Fail with [`Error::AddressInUse`] if any address is answered on `parent`.
///
/// One probe per address runs concurrently; probe errors are logged and
/// the address is treated as free.
pub(super) fn probe_addresses(host: &dyn Host, parent: &str, addrs: &[IpAddr], timeout: Duration) -> Result<()> {
    let results: Vec<(IpAddr, Result<bool>)> = std::thread::scope(|s| {
        let handles: Vec<_> = addrs
            .iter()
            .map(|addr| (*addr, s.spawn(move || host.probe_address(parent, addr, timeout))))
            .collect();
        handles
            .into_iter()
            .map(|(addr, h)| {
                let res = h
                    .join()
                    .unwrap_or_else(|_| Err(Error::host("probe address", "probe thread panicked")));
                (addr, res)
            })
            .collect()
    });

    for (addr, res) in results {
        match res {
            Ok(true) => {
                return Err(Error::AddressInUse {
                    address: addr.to_string(),
                    parent: parent.to_string(),
                })
            }
            Ok(false) => {}
            Err(e) => tracing::warn!(%addr, %parent, error = %e, "neighbour probe failed"),
        }
    }
    Ok(())
}

/// Reject a second NIC of `nictype` using an automatic gateway in the same
/// family.
pub(super) fn check_auto_gateway(common: &DeviceCommon, nictype: &str) -> Result<()> {
    let is_auto = |v: &str| v.is_empty() || v == "auto";

    for family in Family::ALL {
        let key = family.key("gateway");
        if !is_auto(common.config.get(&key)) {
            continue;
        }
        for (name, other) in common.inst.expanded_devices().iter() {
            if *name == common.name || other.kind() != "nic" || other.get("nictype") != nictype {
                continue;
            }
            if is_auto(other.get(&key)) {
                return Err(Error::config(format!(
                    "Existing NIC {:?} already uses {:?} in auto mode",
                    name, key
                )));
            }
        }
    }
    Ok(())
}

/// The parent interface to run on, creating a VLAN sub-interface when
/// `vlan` is set.
///
/// Returns the interface name and whether this call created it. Registration
/// on the VLAN is undone on rollback.
pub(super) fn acquire_parent<'a>(
    common: &'a DeviceCommon,
    revert: &mut Reverter<'a>,
    parent: &str,
) -> Result<(String, bool)> {
    let vlan = common.config.get("vlan");
    if vlan.is_empty() {
        return Ok((parent.to_string(), false));
    }

    let resources = &common.ctx.resources;
    let (name, created) = resources.vlan_acquire(
        common.host(),
        parent,
        vlan,
        common.config.is_true("gvrp"),
        common.user(),
    )?;

    let undo = name.clone();
    revert.add(move || resources.vlan_release(common.host(), &undo, &common.user(), created));
    Ok((name, created))
}

/// Volatile keys recording the VLAN parent.
pub(super) fn vlan_volatile(name: &str, created: bool, uses_vlan: bool) -> Vec<(&'static str, String)> {
    let mut out = vec![(VOLATILE_CREATED, created.to_string())];
    if uses_vlan {
        out.push((VOLATILE_VLAN_PARENT, name.to_string()));
    }
    out
}

/// Unregister from the recorded VLAN parent, removing it if this device
/// created it and nobody else uses it.
pub(super) fn release_parent(common: &DeviceCommon, values: &HashMap<String, String>) -> Result<()> {
    let Some(name) = values.get(VOLATILE_VLAN_PARENT).filter(|v| !v.is_empty()) else {
        return Ok(());
    };
    let created = values
        .get(VOLATILE_CREATED)
        .is_some_and(|v| validate::is_true(v));
    common
        .ctx
        .resources
        .vlan_release(common.host(), name, &common.user(), created)
}

/// Volatile keys recording the MTU and MAC of `iface` before start.
pub(super) fn link_snapshot(host: &dyn Host, iface: &str) -> Result<Vec<(&'static str, String)>> {
    let info = host.link_info(iface)?;
    Ok(vec![
        (VOLATILE_MTU, info.mtu.to_string()),
        (
            VOLATILE_HWADDR,
            info.hwaddr.map(|m| m.to_string()).unwrap_or_default(),
        ),
    ])
}

/// Put back the MTU and MAC recorded by [`link_snapshot`].
pub(super) fn link_restore(host: &dyn Host, iface: &str, values: &HashMap<String, String>) -> Result<()> {
    let mtu = values.get(VOLATILE_MTU).and_then(|v| v.parse().ok());
    let hwaddr = match values.get(VOLATILE_HWADDR).map(String::as_str) {
        None | Some("") => None,
        Some(v) => Some(v.parse::<MacAddr>()?),
    };
    if mtu.is_none() && hwaddr.is_none() {
        return Ok(());
    }
    tracing::debug!(%iface, ?mtu, "restoring interface settings");
    ignore_missing(host.set_link(
        iface,
        &LinkSettings {
            mtu,
            hwaddr,
            tx_queue_len: None,
        },
    ))
}

/// Apply configured `mtu` and `hwaddr` to an interface handed over as is.
pub(super) fn apply_link_config(host: &dyn Host, iface: &str, config: &DeviceConfig) -> Result<()> {
    let mtu = match config.get("mtu") {
        "" => None,
        v => Some(
            v.parse()
                .map_err(|_| Error::validation("mtu", format!("invalid value {:?}", v)))?,
        ),
    };
    let hwaddr = match config.get("hwaddr") {
        "" => None,
        v => Some(v.parse::<MacAddr>()?),
    };
    if mtu.is_none() && hwaddr.is_none() {
        return Ok(());
    }
    host.set_link(
        iface,
        &LinkSettings {
            mtu,
            hwaddr,
            tx_queue_len: None,
        },
    )
}

/// Resolve `network=` for NIC types whose parent comes from a managed
/// network of type `kind`.
///
/// Copies the network's `parent` and the inherited keys into `config`.
/// Keys in `banned` may not be set on the device itself.
pub(super) fn resolve_parent_network(
    common: &mut DeviceCommon,
    kind: &str,
    banned: &[&str],
    inherited: &[&str],
) -> Result<()> {
    let name = common.config.get("network").to_string();
    if name.is_empty() {
        return Ok(());
    }
    for key in banned {
        if common.config.has(key) {
            return Err(Error::config(format!(
                "Cannot use {:?} property in conjunction with \"network\" property",
                key
            )));
        }
    }

    let network = common.ctx.networks.network(&common.inst.project, &name)?;
    if !network.created {
        return Err(Error::config("Specified network is not fully created"));
    }
    if network.kind != kind {
        return Err(Error::config(format!("Specified network must be of type {}", kind)));
    }

    let parent = network.config_value("parent").to_string();
    common.config.set("parent", parent);
    for key in inherited {
        let value = network.config_value(key).to_string();
        if !value.is_empty() {
            common.config.set(*key, value);
        }
    }
    Ok(())
}

/// Routes for every table of the fan-out, plus a VRF route when `vrf` is set.
pub(super) fn fan_out(route: Route, tables: &[String], vrf: &str) -> Vec<Route> {
    let mut out = Vec::with_capacity(tables.len() + 1);
    if !vrf.is_empty() {
        out.push(route.clone().vrf(vrf));
    }
    for table in tables {
        out.push(route.clone().table(table.as_str()));
    }
    out
}

/// Add a route and push its removal.
pub(super) fn add_route<'a>(host: &'a dyn Host, revert: &mut Reverter<'a>, route: Route) -> Result<()> {
    host.route_add(&route)?;
    tracing::debug!(%route, "added route");
    revert.add(move || ignore_missing(host.route_delete(&route)));
    Ok(())
}

/// Add a neighbour proxy and push its removal.
pub(super) fn add_neigh_proxy<'a>(
    host: &'a dyn Host,
    revert: &mut Reverter<'a>,
    dev: &str,
    addr: IpAddr,
) -> Result<()> {
    host.neigh_proxy_add(dev, &addr)?;
    let dev = dev.to_string();
    revert.add(move || ignore_missing(host.neigh_proxy_delete(&dev, &addr)));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::fake::FakeHost;

    fn cfg(pairs: &[(&str, &str)]) -> DeviceConfig {
        pairs.iter().copied().collect()
    }

    #[test]
    fn test_table_fan_out() {
        assert_eq!(host_tables(&cfg(&[]), Family::V4), vec!["254"]);
        assert_eq!(host_tables(&cfg(&[("ipv4.host_table", "254")]), Family::V4), vec!["254"]);
        assert_eq!(
            host_tables(&cfg(&[("ipv4.host_table", "100")]), Family::V4),
            vec!["100", "254"]
        );
        assert_eq!(
            host_tables(&cfg(&[("ipv4.host_tables", "10,20"), ("ipv4.host_table", "100")]), Family::V4),
            vec!["10", "20"]
        );
        // Families are independent.
        assert_eq!(
            host_tables(&cfg(&[("ipv4.host_table", "100")]), Family::V6),
            vec!["254"]
        );
    }

    #[test]
    fn test_limits_max_overrides() {
        let limits = traffic_limits(&cfg(&[("limits.ingress", "1Mbit"), ("limits.max", "10Mbit")])).unwrap();
        assert_eq!(limits.ingress, Some(10_000_000));
        assert_eq!(limits.egress, Some(10_000_000));

        let limits = traffic_limits(&cfg(&[("limits.egress", "5kbit")])).unwrap();
        assert_eq!(limits.ingress, None);
        assert_eq!(limits.egress, Some(5_000));
    }

    #[test]
    fn test_duplicate_address() {
        let err = check_duplicates(&cfg(&[("ipv4.address", "192.0.2.1,192.0.2.1")]), Family::V4).unwrap_err();
        assert!(err.to_string().contains("Duplicate address"));
        assert!(check_duplicates(&cfg(&[("ipv4.address", "192.0.2.1,192.0.2.2")]), Family::V4).is_ok());
    }

    #[test]
    fn test_unique_host_name() {
        let host = FakeHost::new();
        let pattern = regex::Regex::new("^veth[0-9a-f]{8}$").unwrap();
        let name = unique_host_name(&host, "veth").unwrap();
        assert!(pattern.is_match(&name), "{}", name);
        assert!(pattern.is_match(&unique_host_name(&host, "veth").unwrap()));
    }

    #[test]
    fn test_probe_reports_address_in_use() {
        let host = FakeHost::new().with_address_in_use("192.0.2.9");
        let addrs: Vec<IpAddr> = vec!["192.0.2.8".parse().unwrap(), "192.0.2.9".parse().unwrap()];
        let err = probe_addresses(&host, "eth0", &addrs, Duration::from_millis(1)).unwrap_err();
        assert!(matches!(err, Error::AddressInUse { ref address, .. } if address == "192.0.2.9"));
        assert!(err.is_resource_exhausted());
    }

    #[test]
    fn test_probe_errors_count_as_free() {
        let host = FakeHost::new();
        host.fail_on("probe_address");
        let addrs: Vec<IpAddr> = vec!["192.0.2.8".parse().unwrap()];
        assert!(probe_addresses(&host, "eth0", &addrs, Duration::from_millis(1)).is_ok());
    }

    #[test]
    fn test_fan_out_with_vrf() {
        let route = Route::new("veth1", IpNet::host("192.0.2.5".parse().unwrap()));
        let routes = fan_out(route, &["100".to_string(), "254".to_string()], "blue");
        assert_eq!(routes.len(), 3);
        assert_eq!(routes[0].vrf.as_deref(), Some("blue"));
        assert_eq!(routes[2].table.as_deref(), Some("254"));
    }
}
