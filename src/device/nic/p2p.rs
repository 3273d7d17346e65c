//! Point-to-point NIC: a veth or tap with optional static routes through it.

use super::{
    add_route, choose_host_name, cidrs, create_transport, ignore_missing, nic_rules,
    sysctl_set_if_present, traffic_limits, transport_items, LIMIT_KEYS,
};
use crate::device::{
    require_kind, Device, DeviceCommon, DeviceConfig, Devices, Reverter, RunConfig,
    VOLATILE_HOST_NAME,
};
use crate::error::{Error, Result};
use crate::host::{Host, Route};

const FIELDS: &[&str] = &[
    "name",
    "mtu",
    "queue.tx.length",
    "hwaddr",
    "host_name",
    "limits.ingress",
    "limits.egress",
    "limits.max",
    "limits.priority",
    "ipv4.routes",
    "ipv6.routes",
    "boot.priority",
    "io.bus",
];

const ROUTE_KEYS: [&str; 2] = ["ipv4.routes", "ipv6.routes"];

/// Routes of `config` through `dev`.
fn routes_of(config: &DeviceConfig, dev: &str) -> Result<Vec<Route>> {
    let mut out = Vec::new();
    for key in ROUTE_KEYS {
        for net in cidrs(config, key)? {
            out.push(Route::new(dev, net));
        }
    }
    Ok(out)
}

/// Point-to-point NIC driver.
#[derive(Clone)]
pub struct NicP2p {
    common: DeviceCommon,
}

impl NicP2p {
    pub(crate) fn new(common: DeviceCommon) -> Self {
        Self { common }
    }

    fn post_stop(&self) -> Result<()> {
        let host = self.common.host();
        let host_name = self.common.volatile_value(VOLATILE_HOST_NAME)?;
        let mut errs = Vec::new();

        if !host_name.is_empty() && host.interface_exists(&host_name) {
            if let Err(e) = host.remove_interface(&host_name) {
                errs.push(e);
            }
        }
        if let Err(e) = self.common.volatile.clear(&[VOLATILE_HOST_NAME]) {
            errs.push(e);
        }
        Error::from_cleanup(errs)
    }
}

fn replace_routes(host: &dyn Host, old: &[Route], new: &[Route]) -> Result<()> {
    for route in old.iter().filter(|r| !new.contains(r)) {
        ignore_missing(host.route_delete(route))?;
    }
    for route in new.iter().filter(|r| !old.contains(r)) {
        host.route_add(route)?;
    }
    Ok(())
}

impl Device for NicP2p {
    fn name(&self) -> &str {
        &self.common.name
    }

    fn config(&self) -> &DeviceConfig {
        &self.common.config
    }

    fn validate_config(&mut self) -> Result<()> {
        require_kind(&self.common.inst, true, true)?;
        self.common.config.validate(&nic_rules(FIELDS))
    }

    fn validate_environment(&self) -> Result<()> {
        if self.common.inst.is_container() && !self.common.config.has("name") {
            return Err(Error::environment("Requires name property to start"));
        }
        Ok(())
    }

    fn can_hot_plug(&self) -> bool {
        true
    }

    fn updatable_fields(&self, _old: &DeviceConfig) -> Vec<String> {
        LIMIT_KEYS
            .iter()
            .chain(ROUTE_KEYS.iter())
            .map(|k| k.to_string())
            .collect()
    }

    fn start(&mut self) -> Result<RunConfig> {
        self.validate_environment()?;
        if !self.common.volatile_value(VOLATILE_HOST_NAME)?.is_empty() {
            tracing::warn!(device = %self.common.name, "cleaning up state of a previous start");
            self.post_stop()?;
        }

        let common = &self.common;
        let host = common.host();
        let mut revert = Reverter::new();

        let host_name = choose_host_name(common)?;
        let link = create_transport(common, &mut revert, &host_name)?;
        sysctl_set_if_present(host, &format!("net/ipv6/conf/{}/accept_ra", host_name), "0")?;

        for route in routes_of(&common.config, &host_name)? {
            add_route(host, &mut revert, route)?;
        }

        let limits = traffic_limits(&common.config)?;
        if !limits.is_empty() {
            host.set_limits(&host_name, &limits)?;
        }

        common.save(&[(VOLATILE_HOST_NAME, host_name.clone())])?;

        let mut run = RunConfig::new();
        transport_items(&mut run, common, &link)?;
        tracing::info!(device = %common.name, instance = %common.inst.key(), %host_name, "started p2p NIC");
        revert.success();
        Ok(run)
    }

    fn update(&mut self, old_devices: &Devices, is_running: bool) -> Result<()> {
        if !is_running {
            return Ok(());
        }
        let host_name = self.common.volatile_value(VOLATILE_HOST_NAME)?;
        if host_name.is_empty() {
            return Ok(());
        }

        let host = self.common.host();
        let old = match old_devices.get(&self.common.name) {
            Some(config) => routes_of(config, &host_name)?,
            None => Vec::new(),
        };
        let new = routes_of(&self.common.config, &host_name)?;
        replace_routes(host, &old, &new)?;

        host.set_limits(&host_name, &traffic_limits(&self.common.config)?)
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

#[cfg(test)]
mod tests {
    use crate::device::testing::*;
    use crate::device::{Device, Devices, Driver, VOLATILE_HOST_NAME};
    use crate::host::fake::FakeHost;

    #[test]
    fn test_start_stop_with_routes() {
        let fx = Fixture::new(FakeHost::new());
        let inst = container("c1");
        let mut dev = fx
            .load(
                &inst,
                "eth1",
                &[("type", "nic"), ("nictype", "p2p"), ("name", "eth1"), ("ipv4.routes", "192.0.2.0/24")],
            )
            .unwrap();

        dev.start().unwrap();
        let host_name = fx.volatile(&inst, "eth1")[VOLATILE_HOST_NAME].clone();
        let routes = fx.host.routes();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].dev, host_name);
        assert!(routes[0].table.is_none());

        stop_and_cleanup(&mut dev).unwrap();
        stop_and_cleanup(&mut dev).unwrap();
        assert!(fx.host.state().links.is_empty());
        assert!(fx.volatile(&inst, "eth1").is_empty());
    }

    #[test]
    fn test_live_route_update() {
        let fx = Fixture::new(FakeHost::new());
        let inst = container("c1");
        let old = [("type", "nic"), ("nictype", "p2p"), ("name", "eth1"), ("ipv4.routes", "192.0.2.0/24")];
        let mut dev = fx.load(&inst, "eth1", &old).unwrap();
        dev.start().unwrap();

        let mut old_devices = Devices::new();
        old_devices.insert("eth1", old.iter().copied().collect());

        let Driver::P2p(p2p) = &mut dev else {
            panic!("expected p2p driver");
        };
        p2p.common.config.set("ipv4.routes", "198.51.100.0/24");
        dev.update(&old_devices, true).unwrap();

        let routes = fx.host.routes();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].dest.to_string(), "198.51.100.0/24");
    }

    #[test]
    fn test_requires_name_in_container() {
        let fx = Fixture::new(FakeHost::new());
        let dev = fx.load(&container("c1"), "eth1", &[("type", "nic"), ("nictype", "p2p")]).unwrap();
        assert!(dev.validate_environment().is_err());

        let dev = fx.load(&vm("v1"), "eth1", &[("type", "nic"), ("nictype", "p2p")]).unwrap();
        assert!(dev.validate_environment().is_ok());
    }
}
