//! Routed NIC.
//!
//! The instance gets a point-to-point link; its addresses become reachable
//! through host routes and proxy ARP/NDP entries on the parent, without any
//! L2 presence on the parent network.

use super::{
    acquire_parent, add_neigh_proxy, add_route, addresses, check_auto_gateway, check_duplicates,
    choose_host_name, cidrs, create_transport, fan_out, host_tables, ignore_missing, nic_check,
    nic_rules, probe_addresses, release_parent, sysctl_enabled, sysctl_set_if_present,
    traffic_limits, transport_items, vlan_volatile, LIMIT_KEYS,
};
use crate::device::validate::{self, list_of, optional};
use crate::device::{
    require_kind, Device, DeviceCommon, DeviceConfig, Devices, Reverter, RunConfig,
    VOLATILE_CREATED, VOLATILE_HOST_NAME,
};
use crate::error::{Error, Result};
use crate::host::Route;
use crate::network::{host_device_name, Family, IpNet};
use crate::resources::VOLATILE_VLAN_PARENT;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const FIELDS: &[&str] = &[
    "name",
    "parent",
    "mtu",
    "queue.tx.length",
    "hwaddr",
    "host_name",
    "vlan",
    "gvrp",
    "vrf",
    "limits.ingress",
    "limits.egress",
    "limits.max",
    "limits.priority",
    "ipv4.gateway",
    "ipv6.gateway",
    "ipv4.routes",
    "ipv6.routes",
    "ipv4.host_address",
    "ipv6.host_address",
    "ipv4.host_table",
    "ipv6.host_table",
    "ipv4.host_tables",
    "ipv6.host_tables",
    "ipv4.neighbor_probe",
    "ipv6.neighbor_probe",
    "boot.priority",
    "io.bus",
];

/// Default host-side gateway address of a family.
fn default_gateway(family: Family) -> IpAddr {
    match family {
        Family::V4 => IpAddr::V4(Ipv4Addr::new(169, 254, 0, 1)),
        Family::V6 => IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1)),
    }
}

fn sysctl_display(key: &str) -> String {
    key.replace('/', ".")
}

/// Routed NIC driver.
#[derive(Clone)]
pub struct NicRouted {
    pub(super) common: DeviceCommon,
}

impl NicRouted {
    pub(crate) fn new(common: DeviceCommon) -> Self {
        Self { common }
    }

    /// Config checks shared with NICs built on routed mode.
    ///
    /// `extra` lists fields accepted on top of the routed ones.
    pub(super) fn validate_routed(&self, nictype: &str, extra: &[&str]) -> Result<()> {
        let config = &self.common.config;
        check_auto_gateway(&self.common, nictype)?;

        let mut rules = nic_rules(FIELDS);
        for field in extra {
            rules.insert(*field, nic_check(field));
        }
        rules.insert("ipv4.address", optional(list_of(validate::is_ipv4_address)));
        rules.insert("ipv6.address", optional(list_of(validate::is_ipv6_address)));
        config.validate(&rules)?;

        for family in Family::ALL {
            check_duplicates(config, family)?;
            if config.has(&family.key("routes")) && !config.has(&family.key("address")) {
                return Err(Error::config(format!(
                    "{}.routes requires {}.address to be set",
                    family.key_prefix(),
                    family.key_prefix()
                )));
            }
        }

        if config.has("vlan") && !config.has("parent") {
            return Err(Error::config(
                "The vlan setting can only be used when combined with a parent interface",
            ));
        }
        Ok(())
    }

    /// Parent interface including the VLAN suffix.
    fn effective_parent(&self) -> String {
        let config = &self.common.config;
        match config.get("parent") {
            "" => String::new(),
            parent => host_device_name(parent, config.get("vlan")),
        }
    }

    fn post_stop(&self) -> Result<()> {
        let common = &self.common;
        let host = common.host();
        let values = common.volatile.get()?;
        let mut errs = Vec::new();

        let host_name = values.get(VOLATILE_HOST_NAME).cloned().unwrap_or_default();
        if !host_name.is_empty() && host.interface_exists(&host_name) {
            match host.remove_interface(&host_name) {
                Ok(()) => tracing::info!(device = %common.name, %host_name, "removed host interface"),
                Err(e) => errs.push(e),
            }
        }

        let parent = match values.get(VOLATILE_VLAN_PARENT) {
            Some(vlan_parent) if !vlan_parent.is_empty() => vlan_parent.clone(),
            _ => self.effective_parent(),
        };
        if !parent.is_empty() {
            for family in Family::ALL {
                for addr in addresses(&common.config, family)? {
                    if let Err(e) = ignore_missing(host.neigh_proxy_delete(&parent, &addr)) {
                        errs.push(e);
                    }
                }
            }
        }

        if let Err(e) = release_parent(common, &values) {
            errs.push(e);
        }
        if let Err(e) = host.rp_filter_clear(&common.inst.project, &common.inst.name, &common.name) {
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

    /// Tear down what a previous start left behind.
    fn reconcile(&self) -> Result<()> {
        if !self.common.volatile_value(VOLATILE_HOST_NAME)?.is_empty() {
            tracing::warn!(device = %self.common.name, "cleaning up state of a previous start");
            self.post_stop()?;
        }
        Ok(())
    }
}

impl Device for NicRouted {
    fn name(&self) -> &str {
        &self.common.name
    }

    fn config(&self) -> &DeviceConfig {
        &self.common.config
    }

    fn validate_config(&mut self) -> Result<()> {
        require_kind(&self.common.inst, true, true)?;
        self.validate_routed("routed", &[])
    }

    fn validate_environment(&self) -> Result<()> {
        let common = &self.common;
        let host = common.host();
        let config = &common.config;

        if common.inst.is_container() && !config.has("name") {
            return Err(Error::environment("Requires name property to start"));
        }

        let parent = config.get("parent");
        if !parent.is_empty() {
            if !host.interface_exists(parent) {
                return Err(Error::environment(format!("Parent device {:?} doesn't exist", parent)));
            }

            let effective = self.effective_parent();
            // A VLAN interface created at start gets its sysctls set then.
            if config.has("vlan") && !host.interface_exists(&effective) {
                return Ok(());
            }

            let mut required = Vec::new();
            if config.has("ipv6.address") {
                required.push("net/ipv6/conf/all/forwarding".to_string());
                required.push("net/ipv6/conf/all/proxy_ndp".to_string());
                required.push(format!("net/ipv6/conf/{}/forwarding", effective));
                required.push(format!("net/ipv6/conf/{}/proxy_ndp", effective));
            }
            if config.has("ipv4.address") {
                required.push(format!("net/ipv4/conf/{}/forwarding", effective));
            }
            for key in required {
                if !sysctl_enabled(host, &key).unwrap_or(false) {
                    return Err(Error::environment(format!(
                        "Routed mode requires sysctl {}=1",
                        sysctl_display(&key)
                    )));
                }
            }
        }

        let vrf = config.get("vrf");
        if !vrf.is_empty() && !host.interface_exists(vrf) {
            return Err(Error::environment(format!("VRF {:?} doesn't exist", vrf)));
        }
        Ok(())
    }

    fn can_hot_plug(&self) -> bool {
        false
    }

    fn updatable_fields(&self, _old: &DeviceConfig) -> Vec<String> {
        LIMIT_KEYS.iter().map(|k| k.to_string()).collect()
    }

    fn start(&mut self) -> Result<RunConfig> {
        self.validate_environment()?;
        self.reconcile()?;

        let common = &self.common;
        let host = common.host();
        let config = &common.config;
        let mut revert = Reverter::new();

        let v4 = addresses(config, Family::V4)?;
        let v6 = addresses(config, Family::V6)?;

        let (parent, created) = match config.get("parent") {
            "" => (String::new(), false),
            parent => acquire_parent(common, &mut revert, parent)?,
        };
        if created {
            if !v4.is_empty() {
                host.sysctl_set(&format!("net/ipv4/conf/{}/forwarding", parent), "1")?;
            }
            if !v6.is_empty() {
                host.sysctl_set(&format!("net/ipv6/conf/{}/forwarding", parent), "1")?;
                host.sysctl_set(&format!("net/ipv6/conf/{}/proxy_ndp", parent), "1")?;
            }
        }

        if !parent.is_empty() {
            let mut probe = Vec::new();
            if validate::is_true_or_empty(config.get("ipv4.neighbor_probe")) {
                probe.extend(&v4);
            }
            if validate::is_true_or_empty(config.get("ipv6.neighbor_probe")) {
                probe.extend(&v6);
            }
            probe_addresses(host, &parent, &probe, common.ctx.probe_timeout)?;
        }

        let host_name = choose_host_name(common)?;
        let link = create_transport(common, &mut revert, &host_name)?;

        let limits = traffic_limits(config)?;
        if !limits.is_empty() {
            host.set_limits(&host_name, &limits)?;
        }

        if !v6.is_empty() {
            sysctl_set_if_present(host, &format!("net/ipv6/conf/{}/accept_ra", host_name), "0")?;
        }
        if !v4.is_empty() {
            sysctl_set_if_present(host, &format!("net/ipv4/conf/{}/rp_filter", host_name), "1")?;
        }

        let inst = &common.inst;
        host.rp_filter_setup(&inst.project, &inst.name, &common.name, &host_name)?;
        revert.add(move || host.rp_filter_clear(&inst.project, &inst.name, &common.name));

        let vrf = config.get("vrf");
        for (family, addrs) in [(Family::V4, &v4), (Family::V6, &v6)] {
            let Some(first) = addrs.first() else {
                continue;
            };

            let gateway = match config.get(&family.key("host_address")) {
                "" => default_gateway(family),
                v => v
                    .parse()
                    .map_err(|_| Error::validation(family.key("host_address"), "invalid address"))?,
            };
            host.addr_add(&host_name, &IpNet::host(gateway))?;
            sysctl_set_if_present(
                host,
                &format!("net/{}/conf/{}/forwarding", family.key_prefix(), host_name),
                "1",
            )?;

            let tables = host_tables(config, family);
            for addr in addrs.iter() {
                for route in fan_out(Route::new(&host_name, IpNet::host(*addr)), &tables, vrf) {
                    add_route(host, &mut revert, route)?;
                }
                if !parent.is_empty() {
                    add_neigh_proxy(host, &mut revert, &parent, *addr)?;
                }
            }

            for net in cidrs(config, &family.key("routes"))? {
                for route in fan_out(Route::new(&host_name, net).via(*first), &tables, vrf) {
                    add_route(host, &mut revert, route)?;
                }
            }
        }

        let mut save = vec![(VOLATILE_HOST_NAME, host_name.clone())];
        if !config.get("parent").is_empty() {
            save.extend(vlan_volatile(&parent, created, config.has("vlan")));
        }
        common.save(&save)?;

        let mut run = RunConfig::new();
        transport_items(&mut run, common, &link)?;
        if inst.is_container() {
            for (family, addrs) in [(Family::V4, &v4), (Family::V6, &v6)] {
                for addr in addrs.iter() {
                    let value = match family {
                        Family::V4 => format!("{}/32 0.0.0.0", addr),
                        Family::V6 => format!("{}/128", addr),
                    };
                    run.network(&family.key("address"), value);
                }
                let gateway = config.get(&family.key("gateway"));
                if !addrs.is_empty() && (gateway.is_empty() || gateway == "auto") {
                    let via = match config.get(&family.key("host_address")) {
                        "" => default_gateway(family).to_string(),
                        v => v.to_string(),
                    };
                    run.network(&family.key("gateway"), via);
                }
            }
        }

        tracing::info!(
            device = %common.name,
            instance = %inst.key(),
            %host_name,
            parent = %parent,
            "started routed NIC"
        );
        revert.success();
        Ok(run)
    }

    fn update(&mut self, _old_devices: &Devices, is_running: bool) -> Result<()> {
        if !is_running {
            return Ok(());
        }
        self.validate_environment()?;

        let host_name = self.common.volatile_value(VOLATILE_HOST_NAME)?;
        if host_name.is_empty() {
            return Ok(());
        }
        let limits = traffic_limits(&self.common.config)?;
        self.common.host().set_limits(&host_name, &limits)
    }

    fn stop(&mut self) -> Result<RunConfig> {
        let host_name = self.common.volatile_value(VOLATILE_HOST_NAME)?;
        let host = self.common.host();
        if !host_name.is_empty() && host.interface_exists(&host_name) {
            ignore_missing(host.clear_limits(&host_name))?;
        }

        let mut run = RunConfig::new();
        let this = self.clone();
        run.post_hook(move || this.post_stop());
        Ok(run)
    }
}
