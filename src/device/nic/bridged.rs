//! Bridged NIC: a veth or tap whose host side is enslaved to a bridge.
//!
//! Only reached through `network=` pointing at a bridge network, or when a
//! physical NIC's parent turns out to be a bridge.

use super::{
    add_route, choose_host_name, cidrs, create_transport, ignore_missing, nic_rules,
    sysctl_set_if_present, traffic_limits, transport_items, LIMIT_KEYS,
};
use crate::device::{
    require_kind, Device, DeviceCommon, DeviceConfig, Devices, Reverter, RunConfig,
    VOLATILE_HOST_NAME,
};
use crate::error::{Error, Result};
use crate::host::Route;

const FIELDS: &[&str] = &[
    "name",
    "parent",
    "network",
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

/// Bridged NIC driver.
#[derive(Clone)]
pub struct NicBridged {
    common: DeviceCommon,
}

impl NicBridged {
    pub(crate) fn new(common: DeviceCommon) -> Self {
        Self { common }
    }

    /// Routes to the instance through the bridge.
    fn bridge_routes(&self) -> Result<Vec<Route>> {
        let parent = self.common.config.get("parent");
        let mut out = Vec::new();
        for key in ["ipv4.routes", "ipv6.routes"] {
            for net in cidrs(&self.common.config, key)? {
                out.push(Route::new(parent, net));
            }
        }
        Ok(out)
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
        if !host_name.is_empty() {
            for route in self.bridge_routes()? {
                if let Err(e) = ignore_missing(host.route_delete(&route)) {
                    errs.push(e);
                }
            }
        }
        if let Err(e) = self.common.volatile.clear(&[VOLATILE_HOST_NAME]) {
            errs.push(e);
        }
        Error::from_cleanup(errs)
    }
}

impl Device for NicBridged {
    fn name(&self) -> &str {
        &self.common.name
    }

    fn config(&self) -> &DeviceConfig {
        &self.common.config
    }

    fn validate_config(&mut self) -> Result<()> {
        require_kind(&self.common.inst, true, true)?;
        let common = &mut self.common;

        let network = common.config.get("network").to_string();
        if !network.is_empty() {
            if common.config.has("parent") {
                return Err(Error::config(
                    "Cannot use \"parent\" property in conjunction with \"network\" property",
                ));
            }
            let net = common.ctx.networks.network(&common.inst.project, &network)?;
            if !net.created {
                return Err(Error::config("Specified network is not fully created"));
            }
            if net.kind != "bridge" {
                return Err(Error::config("Specified network must be of type bridge"));
            }
            common.config.set("parent", net.name);
        }

        common.config.validate(&nic_rules(FIELDS))?;
        if !common.config.has("parent") {
            return Err(Error::validation("parent", "required value"));
        }
        Ok(())
    }

    fn validate_environment(&self) -> Result<()> {
        let host = self.common.host();
        if self.common.inst.is_container() && !self.common.config.has("name") {
            return Err(Error::environment("Requires name property to start"));
        }
        let parent = self.common.config.get("parent");
        if !host.interface_exists(parent) {
            return Err(Error::environment(format!("Parent device {:?} doesn't exist", parent)));
        }
        if !host.is_bridge(parent) {
            return Err(Error::environment(format!("Parent device {:?} is not a bridge", parent)));
        }
        Ok(())
    }

    fn can_hot_plug(&self) -> bool {
        true
    }

    fn updatable_fields(&self, _old: &DeviceConfig) -> Vec<String> {
        LIMIT_KEYS.iter().map(|k| k.to_string()).collect()
    }

    fn start(&mut self) -> Result<RunConfig> {
        self.validate_environment()?;
        if !self.common.volatile_value(VOLATILE_HOST_NAME)?.is_empty() {
            tracing::warn!(device = %self.common.name, "cleaning up state of a previous start");
            self.post_stop()?;
        }

        let routes = self.bridge_routes()?;
        let common = &self.common;
        let host = common.host();
        let parent = common.config.get("parent");
        let mut revert = Reverter::new();

        let host_name = choose_host_name(common)?;
        let link = create_transport(common, &mut revert, &host_name)?;
        host.bridge_attach(parent, &host_name)?;

        // The host side only switches frames.
        sysctl_set_if_present(host, &format!("net/ipv6/conf/{}/disable_ipv6", host_name), "1")?;
        sysctl_set_if_present(host, &format!("net/ipv6/conf/{}/accept_ra", host_name), "0")?;

        let limits = traffic_limits(&common.config)?;
        if !limits.is_empty() {
            host.set_limits(&host_name, &limits)?;
        }

        for route in routes {
            add_route(host, &mut revert, route)?;
        }

        common.save(&[(VOLATILE_HOST_NAME, host_name.clone())])?;

        let mut run = RunConfig::new();
        transport_items(&mut run, common, &link)?;
        tracing::info!(device = %common.name, instance = %common.inst.key(), %host_name, bridge = %parent, "started bridged NIC");
        revert.success();
        Ok(run)
    }

    fn update(&mut self, _old_devices: &Devices, is_running: bool) -> Result<()> {
        if !is_running {
            return Ok(());
        }
        let host_name = self.common.volatile_value(VOLATILE_HOST_NAME)?;
        if host_name.is_empty() {
            return Ok(());
        }
        self.common
            .host()
            .set_limits(&host_name, &traffic_limits(&self.common.config)?)
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
    use crate::device::{Device, VOLATILE_HOST_NAME};
    use crate::host::fake::FakeHost;

    #[test]
    fn test_attach_to_bridge_and_clean_up() {
        let fx = Fixture::new(FakeHost::new().with_bridge("br0"));
        let inst = container("c1");
        let mut dev = fx
            .load(
                &inst,
                "eth0",
                &[
                    ("type", "nic"),
                    ("nictype", "physical"),
                    ("parent", "br0"),
                    ("name", "eth0"),
                    ("ipv4.routes", "192.0.2.0/28"),
                ],
            )
            .unwrap();
        dev.start().unwrap();

        let host_name = fx.volatile(&inst, "eth0")[VOLATILE_HOST_NAME].clone();
        assert_eq!(
            fx.host.state().links[&host_name].master.as_deref(),
            Some("br0")
        );
        assert_eq!(fx.host.sysctl(&format!("net/ipv6/conf/{}/disable_ipv6", host_name)).as_deref(), Some("1"));
        assert_eq!(fx.host.routes()[0].dev, "br0");

        stop_and_cleanup(&mut dev).unwrap();
        stop_and_cleanup(&mut dev).unwrap();
        assert!(fx.host.routes().is_empty());
        assert_eq!(fx.host.state().links.len(), 1);
    }

    #[test]
    fn test_bridge_network_sets_parent() {
        let fx = Fixture::with_networks(
            FakeHost::new().with_bridge("lxdbr0"),
            vec![network("lxdbr0", "bridge", &[])],
        );
        let dev = fx
            .load(&vm("v1"), "eth0", &[("type", "nic"), ("network", "lxdbr0")])
            .unwrap();
        assert_eq!(dev.config().get("parent"), "lxdbr0");
        assert!(dev.validate_environment().is_ok());
    }
}
