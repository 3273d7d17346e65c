//! Physical NIC: hand a host interface (or a VLAN on it) to the instance.
//!
//! Containers get the interface moved into their namespace, so its original
//! MTU and MAC are recorded and put back afterwards. VMs get the interface's
//! PCI function through vfio-pci.

use super::{
    acquire_parent, apply_link_config, link_restore, link_snapshot, nic_rules, release_parent,
    resolve_parent_network, vlan_volatile,
};
use crate::device::pci::{bind_vfio, restore_driver, VFIO_DRIVER};
use crate::device::validate::{self, required};
use crate::device::{
    require_kind, Device, DeviceCommon, DeviceConfig, Reverter, RunConfig, VOLATILE_CREATED,
    VOLATILE_HOST_NAME, VOLATILE_HWADDR, VOLATILE_MTU, VOLATILE_PCI_DRIVER, VOLATILE_PCI_SLOT,
};
use crate::error::{Error, Result};
use crate::resources::VOLATILE_VLAN_PARENT;
use hostdev_protocol::keys;
use std::collections::HashMap;

const CONTAINER_FIELDS: &[&str] = &["name", "mtu", "hwaddr", "vlan", "gvrp", "boot.priority", "network"];
const VM_FIELDS: &[&str] = &["name", "mtu", "boot.priority", "network"];

/// Physical NIC driver.
#[derive(Clone)]
pub struct NicPhysical {
    common: DeviceCommon,
}

impl NicPhysical {
    pub(crate) fn new(common: DeviceCommon) -> Self {
        Self { common }
    }

    fn started(&self) -> Result<bool> {
        let values = self.common.volatile.get()?;
        Ok([VOLATILE_HOST_NAME, VOLATILE_PCI_SLOT]
            .iter()
            .any(|k| values.get(*k).is_some_and(|v| !v.is_empty())))
    }

    fn start_container(&self) -> Result<RunConfig> {
        let common = &self.common;
        let host = common.host();
        let config = &common.config;
        let mut revert = Reverter::new();

        let (iface, created) = acquire_parent(common, &mut revert, config.get("parent"))?;

        let mut save = vec![(VOLATILE_HOST_NAME, iface.clone())];
        save.extend(vlan_volatile(&iface, created, config.has("vlan")));
        if !created {
            let snapshot = link_snapshot(host, &iface)?;
            apply_link_config(host, &iface, config)?;
            let undo_iface = iface.clone();
            let undo_values = snapshot
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect::<HashMap<_, _>>();
            revert.add(move || link_restore(host, &undo_iface, &undo_values));
            save.extend(snapshot);
        } else {
            apply_link_config(host, &iface, config)?;
        }
        common.save(&save)?;

        let mut run = RunConfig::new();
        run.network(keys::TYPE, "phys")
            .network(keys::NAME, config.get("name"))
            .network(keys::FLAGS, "up")
            .network(keys::LINK, iface.as_str());
        tracing::info!(device = %common.name, instance = %common.inst.key(), interface = %iface, created, "started physical NIC");
        revert.success();
        Ok(run)
    }

    fn start_vm(&self) -> Result<RunConfig> {
        let common = &self.common;
        let host = common.host();
        let parent = common.config.get("parent");
        let mut revert = Reverter::new();

        host.load_module(VFIO_DRIVER)?;
        let pci = host.pci_device_of_interface(parent)?;
        let (driver, group) = bind_vfio(common, &mut revert, &pci.slot_name)?;
        common.save(&[
            (VOLATILE_PCI_SLOT, pci.slot_name.clone()),
            (VOLATILE_PCI_DRIVER, driver),
        ])?;

        let mut run = RunConfig::new();
        run.network(keys::TYPE, "physical")
            .network(keys::DEV_NAME, common.name.as_str())
            .network(keys::PCI_SLOT_NAME, pci.slot_name.as_str())
            .network(keys::PCI_IOMMU_GROUP, group.to_string());
        if common.config.has("mtu") {
            run.network(keys::MTU, common.config.get("mtu"));
        }
        tracing::info!(device = %common.name, instance = %common.inst.key(), %parent, slot = %pci.slot_name, "started physical NIC passthrough");
        revert.success();
        Ok(run)
    }

    fn post_stop(&self) -> Result<()> {
        let common = &self.common;
        let values = common.volatile.get()?;
        let value = |key: &str| values.get(key).cloned().unwrap_or_default();
        let mut errs = Vec::new();

        let slot = value(VOLATILE_PCI_SLOT);
        if !slot.is_empty() {
            if let Err(e) = restore_driver(common, &slot, &value(VOLATILE_PCI_DRIVER)) {
                errs.push(e);
            }
        }

        let host_name = value(VOLATILE_HOST_NAME);
        let created = validate::is_true(&value(VOLATILE_CREATED));
        if !host_name.is_empty() && !created {
            if let Err(e) = link_restore(common.host(), &host_name, &values) {
                errs.push(e);
            }
        }
        if let Err(e) = release_parent(common, &values) {
            errs.push(e);
        }

        if let Err(e) = common.volatile.clear(&[
            VOLATILE_HOST_NAME,
            VOLATILE_CREATED,
            VOLATILE_VLAN_PARENT,
            VOLATILE_MTU,
            VOLATILE_HWADDR,
            VOLATILE_PCI_SLOT,
            VOLATILE_PCI_DRIVER,
        ]) {
            errs.push(e);
        }
        Error::from_cleanup(errs)
    }
}

impl Device for NicPhysical {
    fn name(&self) -> &str {
        &self.common.name
    }

    fn config(&self) -> &DeviceConfig {
        &self.common.config
    }

    fn validate_config(&mut self) -> Result<()> {
        require_kind(&self.common.inst, true, true)?;
        resolve_parent_network(
            &mut self.common,
            "physical",
            &["parent", "mtu", "vlan", "gvrp"],
            &["mtu", "vlan", "gvrp"],
        )?;

        let fields = if self.common.inst.is_vm() {
            VM_FIELDS
        } else {
            CONTAINER_FIELDS
        };
        let mut rules = nic_rules(fields);
        rules.insert("parent", required(validate::is_interface_name));
        self.common.config.validate(&rules)
    }

    fn validate_environment(&self) -> Result<()> {
        let common = &self.common;
        common.reject_stateful_migration("Network physical devices")?;
        if common.inst.is_container() && !common.config.has("name") {
            return Err(Error::environment("Requires name property to start"));
        }
        let parent = common.config.get("parent");
        if !common.host().interface_exists(parent) {
            return Err(Error::environment(format!("Parent device {:?} doesn't exist", parent)));
        }
        Ok(())
    }

    fn can_hot_plug(&self) -> bool {
        true
    }

    fn start(&mut self) -> Result<RunConfig> {
        self.validate_environment()?;
        if self.started()? {
            tracing::warn!(device = %self.common.name, "cleaning up state of a previous start");
            self.post_stop()?;
        }
        if self.common.inst.is_vm() {
            self.start_vm()
        } else {
            self.start_container()
        }
    }

    fn stop(&mut self) -> Result<RunConfig> {
        let mut run = RunConfig::new();
        let host_name = self.common.volatile_value(VOLATILE_HOST_NAME)?;
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
    use crate::device::{Device, VOLATILE_MTU};
    use crate::host::fake::FakeHost;
    use crate::host::PciDevice;
    use hostdev_protocol::keys;

    fn physical(extra: &[(&'static str, &'static str)]) -> Vec<(&'static str, &'static str)> {
        let mut cfg = vec![("type", "nic"), ("nictype", "physical"), ("parent", "eth1"), ("name", "eth0")];
        cfg.extend_from_slice(extra);
        cfg
    }

    #[test]
    fn test_reused_interface_settings_restored() {
        let fx = Fixture::new(FakeHost::new().with_interface("eth1"));
        let inst = container("c1");
        let mut dev = fx
            .load(&inst, "eth0", &physical(&[("mtu", "9000"), ("hwaddr", "0a:92:a7:0d:b7:d9")]))
            .unwrap();

        let run = dev.start().unwrap();
        assert_eq!(run.descriptor.network_value(keys::LINK), Some("eth1"));
        {
            let st = fx.host.state();
            assert_eq!(st.links["eth1"].mtu, 9000);
            assert_eq!(st.links["eth1"].hwaddr.map(|m| m.to_string()).as_deref(), Some("0a:92:a7:0d:b7:d9"));
        }
        assert_eq!(fx.volatile(&inst, "eth0")[VOLATILE_MTU], "1500");

        stop_and_cleanup(&mut dev).unwrap();
        assert_eq!(fx.host.state().links["eth1"].mtu, 1500);
        assert!(fx.host.has_link("eth1"));
        assert!(fx.volatile(&inst, "eth0").is_empty());
        stop_and_cleanup(&mut dev).unwrap();
    }

    #[test]
    fn test_vlan_created_and_removed() {
        let fx = Fixture::new(FakeHost::new().with_interface("eth1"));
        let inst = container("c1");
        let mut dev = fx.load(&inst, "eth0", &physical(&[("vlan", "10")])).unwrap();

        let run = dev.start().unwrap();
        assert_eq!(run.descriptor.network_value(keys::LINK), Some("eth1.10"));
        assert!(fx.host.has_link("eth1.10"));
        assert!(!fx.volatile(&inst, "eth0").contains_key(VOLATILE_MTU));

        stop_and_cleanup(&mut dev).unwrap();
        assert!(!fx.host.has_link("eth1.10"));
        assert!(fx.host.has_link("eth1"));
    }

    #[test]
    fn test_vm_passthrough_restores_driver() {
        let fx = Fixture::new(
            FakeHost::new()
                .with_interface("eth1")
                .with_interface_pci("eth1", "0000:05:00.0")
                .with_pci(
                    PciDevice {
                        slot_name: "0000:05:00.0".into(),
                        driver: "ixgbe".into(),
                        vendor_id: "8086".into(),
                        product_id: "10fb".into(),
                        numa_node: None,
                    },
                    7,
                ),
        );
        let inst = vm("v1");
        let mut dev = fx.load(&inst, "eth0", &[("type", "nic"), ("nictype", "physical"), ("parent", "eth1")]).unwrap();

        let run = dev.start().unwrap();
        assert_eq!(run.descriptor.network_value(keys::PCI_SLOT_NAME), Some("0000:05:00.0"));
        assert_eq!(run.descriptor.network_value(keys::PCI_IOMMU_GROUP), Some("7"));
        assert_eq!(fx.host.pci_driver("0000:05:00.0").as_deref(), Some("vfio-pci"));

        stop_and_cleanup(&mut dev).unwrap();
        assert_eq!(fx.host.pci_driver("0000:05:00.0").as_deref(), Some("ixgbe"));
        assert!(fx.volatile(&inst, "eth0").is_empty());
    }

    #[test]
    fn test_physical_network() {
        let fx = Fixture::with_networks(
            FakeHost::new().with_interface("eth1"),
            vec![network("phys0", "physical", &[("parent", "eth1"), ("mtu", "9000")])],
        );
        let dev = fx
            .load(&container("c1"), "eth0", &[("type", "nic"), ("network", "phys0"), ("name", "eth0")])
            .unwrap();
        assert_eq!(dev.config().get("parent"), "eth1");
        assert_eq!(dev.config().get("mtu"), "9000");

        let err = fx
            .load(&container("c1"), "eth0", &[("type", "nic"), ("network", "phys0"), ("mtu", "1400")])
            .err()
            .unwrap();
        assert!(err.to_string().contains("\"mtu\""));
    }

    #[test]
    fn test_vm_rules() {
        let fx = Fixture::new(FakeHost::new().with_interface("eth1"));
        assert!(fx.load(&vm("v1"), "eth0", &physical(&[("vlan", "10")])).is_err());

        let dev = fx
            .load(&vm_with("v1", &[("migration.stateful", "true")]), "eth0", &[("type", "nic"), ("nictype", "physical"), ("parent", "eth1")])
            .unwrap();
        assert!(dev.validate_environment().is_err());
    }
}
