//! IPVLAN NIC (containers only).
//!
//! In `l3s` mode the host answers ARP/NDP for the instance addresses on the
//! parent and routes them through `lo`; in `l2` mode the instance is a plain
//! L2 peer on the parent network and nothing is programmed on the host.

use super::{
    acquire_parent, add_neigh_proxy, addresses, add_route, host_tables, ignore_missing, nic_rules,
    release_parent, sysctl_enabled, unique_host_name, vlan_volatile,
};
use crate::device::validate::{self, list_of, one_of, optional, required};
use crate::device::{
    require_kind, Device, DeviceCommon, DeviceConfig, Reverter, RunConfig, VOLATILE_CREATED,
    VOLATILE_HOST_NAME,
};
use crate::error::{Error, Result};
use crate::host::Route;
use crate::network::{host_device_name, split_list, Family, IpNet};
use crate::resources::VOLATILE_VLAN_PARENT;
use hostdev_protocol::keys;

const FIELDS: &[&str] = &[
    "name",
    "mtu",
    "hwaddr",
    "vlan",
    "gvrp",
    "ipv4.host_table",
    "ipv6.host_table",
];

/// IPVLAN operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    L3s,
    L2,
}

impl Mode {
    fn of(config: &DeviceConfig) -> Self {
        if config.get("mode") == "l2" {
            Mode::L2
        } else {
            Mode::L3s
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Mode::L3s => "l3s",
            Mode::L2 => "l2",
        }
    }
}

/// IPVLAN NIC driver.
#[derive(Clone)]
pub struct NicIpvlan {
    common: DeviceCommon,
}

impl NicIpvlan {
    pub(crate) fn new(common: DeviceCommon) -> Self {
        Self { common }
    }

    fn effective_parent(&self) -> String {
        let config = &self.common.config;
        host_device_name(config.get("parent"), config.get("vlan"))
    }

    fn post_stop(&self) -> Result<()> {
        let common = &self.common;
        let host = common.host();
        let values = common.volatile.get()?;
        let mut errs = Vec::new();

        let host_name = values.get(VOLATILE_HOST_NAME).cloned().unwrap_or_default();
        if !host_name.is_empty() && host.interface_exists(&host_name) {
            if let Err(e) = host.remove_interface(&host_name) {
                errs.push(e);
            }
        }

        if Mode::of(&common.config) == Mode::L3s {
            let parent = match values.get(VOLATILE_VLAN_PARENT) {
                Some(p) if !p.is_empty() => p.clone(),
                _ => self.effective_parent(),
            };
            for family in Family::ALL {
                let tables = host_tables(&common.config, family);
                for addr in addresses(&common.config, family)? {
                    for table in &tables {
                        let route = Route::new("lo", IpNet::host(addr)).table(table.as_str());
                        if let Err(e) = ignore_missing(host.route_delete(&route)) {
                            errs.push(e);
                        }
                    }
                    if let Err(e) = ignore_missing(host.neigh_proxy_delete(&parent, &addr)) {
                        errs.push(e);
                    }
                }
            }
        }

        if let Err(e) = release_parent(common, &values) {
            errs.push(e);
        }
        if let Err(e) = common
            .volatile
            .clear(&[VOLATILE_HOST_NAME, VOLATILE_CREATED, VOLATILE_VLAN_PARENT])
        {
            errs.push(e);
        }
        Error::from_cleanup(errs)
    }
}

impl Device for NicIpvlan {
    fn name(&self) -> &str {
        &self.common.name
    }

    fn config(&self) -> &DeviceConfig {
        &self.common.config
    }

    fn validate_config(&mut self) -> Result<()> {
        require_kind(&self.common.inst, true, false)?;
        let config = &self.common.config;
        let mode = Mode::of(config);

        let mut rules = nic_rules(FIELDS);
        rules.insert("parent", required(validate::is_interface_name));
        rules.insert("mode", optional(one_of(&["l3s", "l2"])));
        match mode {
            Mode::L3s => {
                rules.insert("ipv4.address", optional(list_of(validate::is_ipv4_address)));
                rules.insert("ipv6.address", optional(list_of(validate::is_ipv6_address)));
                rules.insert("ipv4.gateway", optional(one_of(&["auto", "none"])));
                rules.insert("ipv6.gateway", optional(one_of(&["auto", "none"])));
            }
            Mode::L2 => {
                rules.insert("ipv4.address", optional(list_of(validate::is_ipv4_address_or_cidr)));
                rules.insert("ipv6.address", optional(list_of(validate::is_ipv6_address_or_cidr)));
                rules.insert("ipv4.gateway", optional(validate::is_ipv4_address));
                rules.insert("ipv6.gateway", optional(validate::is_ipv6_address));
            }
        }
        config.validate(&rules)?;

        if mode == Mode::L2 {
            for family in Family::ALL {
                if config.has(&family.key("host_table")) {
                    return Err(Error::config("host_table option cannot be used in l2 mode"));
                }
            }
        }
        Ok(())
    }

    fn validate_environment(&self) -> Result<()> {
        let host = self.common.host();
        let config = &self.common.config;

        if !config.has("name") {
            return Err(Error::environment("Requires name property to start"));
        }
        let parent = config.get("parent");
        if !host.interface_exists(parent) {
            return Err(Error::environment(format!("Parent device {:?} doesn't exist", parent)));
        }
        if Mode::of(config) == Mode::L2 {
            return Ok(());
        }

        let effective = self.effective_parent();
        if config.has("vlan") && !host.interface_exists(&effective) {
            return Ok(());
        }

        let mut required = Vec::new();
        if config.has("ipv4.address") {
            required.push(format!("net/ipv4/conf/{}/forwarding", effective));
        }
        if config.has("ipv6.address") {
            required.push(format!("net/ipv6/conf/{}/forwarding", effective));
            required.push(format!("net/ipv6/conf/{}/proxy_ndp", effective));
        }
        for key in required {
            if !sysctl_enabled(host, &key).unwrap_or(false) {
                return Err(Error::environment(format!(
                    "IPVLAN in L3S mode requires sysctl {}=1",
                    key.replace('/', ".")
                )));
            }
        }
        Ok(())
    }

    fn can_hot_plug(&self) -> bool {
        false
    }

    fn start(&mut self) -> Result<RunConfig> {
        self.validate_environment()?;
        if !self.common.volatile_value(VOLATILE_HOST_NAME)?.is_empty() {
            tracing::warn!(device = %self.common.name, "cleaning up state of a previous start");
            self.post_stop()?;
        }

        let common = &self.common;
        let host = common.host();
        let config = &common.config;
        let mode = Mode::of(config);
        let mut revert = Reverter::new();

        let host_name = unique_host_name(host, "inc")?;
        let (parent, created) = acquire_parent(common, &mut revert, config.get("parent"))?;

        if created && mode == Mode::L3s {
            if config.has("ipv4.address") {
                host.sysctl_set(&format!("net/ipv4/conf/{}/forwarding", parent), "1")?;
            }
            if config.has("ipv6.address") {
                host.sysctl_set(&format!("net/ipv6/conf/{}/forwarding", parent), "1")?;
                host.sysctl_set(&format!("net/ipv6/conf/{}/proxy_ndp", parent), "1")?;
            }
        }

        let mut run = RunConfig::new();
        run.network(keys::NAME, config.get("name"))
            .network(keys::TYPE, "ipvlan")
            .network(keys::FLAGS, "up")
            .network(keys::IPVLAN_MODE, mode.as_str())
            .network(keys::IPVLAN_ISOLATION, "bridge")
            .network(keys::LINK, parent.as_str());
        if config.has("mtu") {
            run.network(keys::MTU, config.get("mtu"));
        }
        if config.has("hwaddr") {
            run.network(keys::HWADDR, config.get("hwaddr"));
        }

        for family in Family::ALL {
            let key = family.key("address");
            let entries = split_list(config.get(&key));

            match mode {
                Mode::L3s => {
                    let tables = host_tables(config, family);
                    for addr in addresses(config, family)? {
                        run.network(&key, IpNet::host(addr).to_string());
                        for table in &tables {
                            let route = Route::new("lo", IpNet::host(addr)).table(table.as_str());
                            add_route(host, &mut revert, route)?;
                        }
                        add_neigh_proxy(host, &mut revert, &parent, addr)?;
                    }
                    let gateway = config.get(&family.key("gateway"));
                    if !entries.is_empty() && (gateway.is_empty() || gateway == "auto") {
                        run.network(&family.key("gateway"), "dev");
                    }
                }
                Mode::L2 => {
                    for entry in &entries {
                        let value = if entry.contains('/') {
                            entry.clone()
                        } else {
                            let prefix = match family {
                                Family::V4 => 24,
                                Family::V6 => 64,
                            };
                            format!("{}/{}", entry, prefix)
                        };
                        run.network(&key, value);
                    }
                    if config.has(&family.key("gateway")) {
                        run.network(&family.key("gateway"), config.get(&family.key("gateway")));
                    }
                }
            }
        }

        let mut save = vec![(VOLATILE_HOST_NAME, host_name.clone())];
        save.extend(vlan_volatile(&parent, created, config.has("vlan")));
        common.save(&save)?;

        tracing::info!(device = %common.name, instance = %common.inst.key(), %parent, mode = mode.as_str(), "started ipvlan NIC");
        revert.success();
        Ok(run)
    }

    fn stop(&mut self) -> Result<RunConfig> {
        let host_name = self.common.volatile_value(VOLATILE_HOST_NAME)?;
        let mut run = RunConfig::new();
        if !host_name.is_empty() {
            run.network(keys::LINK, host_name);
        }
        let this = self.clone();
        run.post_hook(move || this.post_stop());
        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use crate::device::testing::*;
    use crate::device::Device;
    use crate::error::Error;
    use crate::host::fake::FakeHost;
    use crate::host::Route;
    use crate::network::IpNet;
    use hostdev_protocol::keys;

    fn ipvlan(extra: &[(&'static str, &'static str)]) -> Vec<(&'static str, &'static str)> {
        let mut cfg = vec![("type", "nic"), ("nictype", "ipvlan"), ("parent", "eth0"), ("name", "eth0")];
        cfg.extend_from_slice(extra);
        cfg
    }

    #[test]
    fn test_l3s_programs_host() {
        let fx = Fixture::new(FakeHost::new().with_routed_parent("eth0").with_interface("lo"));
        let inst = container("c1");
        let mut dev = fx
            .load(&inst, "eth0", &ipvlan(&[("ipv4.address", "192.0.2.20"), ("ipv4.host_table", "100")]))
            .unwrap();

        let run = dev.start().unwrap();
        let desc = &run.descriptor;
        assert_eq!(desc.network_value(keys::TYPE), Some("ipvlan"));
        assert_eq!(desc.network_value(keys::IPVLAN_MODE), Some("l3s"));
        assert_eq!(desc.network_value(keys::LINK), Some("eth0"));
        assert_eq!(desc.network_value("ipv4.address"), Some("192.0.2.20/32"));
        assert_eq!(desc.network_value("ipv4.gateway"), Some("dev"));

        let lo = |table: &str| Route::new("lo", IpNet::host("192.0.2.20".parse().unwrap())).table(table);
        assert_eq!(fx.host.routes(), vec![lo("100"), lo("254")]);
        assert!(fx.host.has_neigh_proxy("eth0", "192.0.2.20"));

        stop_and_cleanup(&mut dev).unwrap();
        stop_and_cleanup(&mut dev).unwrap();
        assert!(fx.host.routes().is_empty());
        assert!(!fx.host.has_neigh_proxy("eth0", "192.0.2.20"));
        assert!(fx.volatile(&inst, "eth0").is_empty());
    }

    #[test]
    fn test_l2_leaves_host_alone() {
        let fx = Fixture::new(FakeHost::new().with_interface("eth0"));
        let mut dev = fx
            .load(
                &container("c1"),
                "eth0",
                &ipvlan(&[
                    ("mode", "l2"),
                    ("ipv4.address", "192.0.2.30,192.0.2.40/25"),
                    ("ipv4.gateway", "192.0.2.1"),
                ]),
            )
            .unwrap();

        let run = dev.start().unwrap();
        let addrs: Vec<_> = run
            .descriptor
            .network_interface
            .iter()
            .filter(|i| i.key == "ipv4.address")
            .map(|i| i.value.as_str())
            .collect();
        assert_eq!(addrs, vec!["192.0.2.30/24", "192.0.2.40/25"]);
        assert_eq!(run.descriptor.network_value("ipv4.gateway"), Some("192.0.2.1"));
        assert!(fx.host.routes().is_empty());
        assert!(fx.host.state().neigh_proxies.is_empty());
    }

    #[test]
    fn test_validation() {
        let fx = Fixture::new(FakeHost::new());
        let err = fx.load(&vm("v1"), "eth0", &ipvlan(&[])).err().unwrap();
        assert!(err.is_unsupported_dev_type());

        let err = fx
            .load(&container("c1"), "eth0", &ipvlan(&[("mode", "l2"), ("ipv4.host_table", "100")]))
            .err()
            .unwrap();
        assert!(err.to_string().contains("l2 mode"));

        let err = fx
            .load(&container("c1"), "eth0", &[("type", "nic"), ("nictype", "ipvlan")])
            .err()
            .unwrap();
        assert!(matches!(err, Error::Validation { ref field, .. } if field == "parent"));
    }
}
