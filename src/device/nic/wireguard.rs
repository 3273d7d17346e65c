//! WireGuard NIC: routed mode on top of a managed WireGuard network.

use super::routed::NicRouted;
use crate::device::{require_kind, Device, DeviceCommon, DeviceConfig, Devices, RunConfig};
use crate::error::{Error, Result};
use crate::network::{split_list, Family, IpNet};

/// WireGuard NIC driver.
///
/// Resolves the network into a routed config, then delegates every
/// lifecycle call to [`NicRouted`].
#[derive(Clone)]
pub struct NicWireguard {
    inner: NicRouted,
}

impl NicWireguard {
    pub(crate) fn new(common: DeviceCommon) -> Self {
        Self {
            inner: NicRouted::new(common),
        }
    }

    /// Fill `parent` and missing addresses from the network.
    fn resolve_network(&mut self) -> Result<()> {
        let common = &mut self.inner.common;
        let name = common.config.get("network").to_string();
        if name.is_empty() {
            return Err(Error::config("Network property is required for WireGuard NIC"));
        }
        if common.config.has("parent") {
            return Err(Error::config(
                "Cannot use \"parent\" property in conjunction with \"network\" property",
            ));
        }

        let network = common.ctx.networks.network(&common.inst.project, &name)?;
        if !network.created {
            return Err(Error::config("Specified network is not fully created"));
        }
        if network.kind != "wireguard" {
            return Err(Error::config("Specified network must be of type wireguard"));
        }

        let parent = match network.config_value("interface") {
            "" => network.name.clone(),
            iface => iface.to_string(),
        };
        common.config.set("parent", parent);

        let seed = common.owner();
        for family in Family::ALL {
            let key = family.key("address");
            if common.config.has(&key) {
                continue;
            }
            let Some(subnet) = split_list(network.config_value(&key)).into_iter().next() else {
                continue;
            };
            let subnet: IpNet = subnet.parse()?;
            let addr = subnet.derive_host(&seed, &[subnet.addr()])?;
            tracing::debug!(device = %common.name, network = %name, %addr, "picked address from network subnet");
            common.config.set(key, addr.to_string());
        }
        Ok(())
    }
}

impl Device for NicWireguard {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn config(&self) -> &DeviceConfig {
        self.inner.config()
    }

    fn validate_config(&mut self) -> Result<()> {
        require_kind(&self.inner.common.inst, true, true)?;
        self.resolve_network()?;
        self.inner.validate_routed("wireguard", &["network"])
    }

    fn validate_environment(&self) -> Result<()> {
        self.inner.validate_environment()
    }

    fn can_hot_plug(&self) -> bool {
        true
    }

    fn updatable_fields(&self, old: &DeviceConfig) -> Vec<String> {
        self.inner.updatable_fields(old)
    }

    fn start(&mut self) -> Result<RunConfig> {
        self.inner.start()
    }

    fn update(&mut self, old_devices: &Devices, is_running: bool) -> Result<()> {
        self.inner.update(old_devices, is_running)
    }

    fn stop(&mut self) -> Result<RunConfig> {
        self.inner.stop()
    }
}

#[cfg(test)]
mod tests {
    use crate::device::testing::*;
    use crate::device::Device;
    use crate::host::fake::FakeHost;
    use std::net::IpAddr;

    fn wg_fixture(created: bool, kind: &str) -> Fixture {
        let mut net = network("wg0", kind, &[("interface", "wg-main"), ("ipv4.address", "10.8.0.1/24")]);
        net.created = created;
        Fixture::with_networks(FakeHost::new().with_routed_parent("wg-main"), vec![net])
    }

    #[test]
    fn test_address_derived_from_network() {
        let fx = wg_fixture(true, "wireguard");
        let inst = container("c1");
        let cfg = [("type", "nic"), ("network", "wg0"), ("name", "eth0")];

        let mut dev = fx.load(&inst, "eth0", &cfg).unwrap();
        assert_eq!(dev.config().get("parent"), "wg-main");

        let addr: IpAddr = dev.config().get("ipv4.address").parse().unwrap();
        assert_eq!(addr.to_string(), "10.8.0.33");

        // Start and stop must agree on the address.
        let again = fx.load(&inst, "eth0", &cfg).unwrap();
        assert_eq!(again.config().get("ipv4.address"), addr.to_string());

        dev.start().unwrap();
        assert!(fx.host.has_neigh_proxy("wg-main", &addr.to_string()));
        stop_and_cleanup(&mut dev).unwrap();
        assert!(!fx.host.has_neigh_proxy("wg-main", &addr.to_string()));
        assert!(fx.volatile(&inst, "eth0").is_empty());
        stop_and_cleanup(&mut dev).unwrap();
        assert!(fx.volatile(&inst, "eth0").is_empty());
    }

    #[test]
    fn test_static_address_kept() {
        let fx = wg_fixture(true, "wireguard");
        let dev = fx
            .load(
                &container("c1"),
                "eth0",
                &[("type", "nic"), ("network", "wg0"), ("ipv4.address", "10.8.0.50")],
            )
            .unwrap();
        assert_eq!(dev.config().get("ipv4.address"), "10.8.0.50");
    }

    #[test]
    fn test_network_must_be_usable() {
        let fx = wg_fixture(false, "wireguard");
        let err = fx
            .load(&container("c1"), "eth0", &[("type", "nic"), ("nictype", "wireguard"), ("network", "wg0")])
            .err()
            .unwrap();
        assert!(err.to_string().contains("not fully created"));

        let fx = wg_fixture(true, "bridge");
        let err = fx
            .load(&container("c1"), "eth0", &[("type", "nic"), ("nictype", "wireguard"), ("network", "wg0")])
            .err()
            .unwrap();
        assert!(err.to_string().contains("type wireguard"));

        let err = fx
            .load(&container("c1"), "eth0", &[("type", "nic"), ("nictype", "wireguard")])
            .err()
            .unwrap();
        assert!(err.to_string().contains("Network property is required"));
    }
}
