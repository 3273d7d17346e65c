//! SR-IOV NIC: claim a free virtual function and hand it to the instance.

use super::{
    apply_link_config, ignore_missing, link_restore, link_snapshot, nic_hwaddr, nic_rules,
    resolve_parent_network,
};
use crate::device::pci::{bind_vfio, restore_driver, VFIO_DRIVER};
use crate::device::validate;
use crate::device::{
    require_kind, Device, DeviceCommon, DeviceConfig, Reverter, RunConfig, VOLATILE_HOST_NAME,
    VOLATILE_HWADDR, VOLATILE_MTU, VOLATILE_PCI_DRIVER, VOLATILE_PCI_SLOT, VOLATILE_VF_HWADDR,
    VOLATILE_VF_ID, VOLATILE_VF_PARENT, VOLATILE_VF_SPOOFCHECK, VOLATILE_VF_VLAN,
};
use crate::error::{Error, Result};
use crate::host::{LinkSettings, VfSettings};
use crate::network::MacAddr;
use crate::resources::CardSelector;
use hostdev_protocol::keys;
use std::collections::HashMap;

const FIELDS: &[&str] = &[
    "name",
    "parent",
    "network",
    "mtu",
    "hwaddr",
    "vlan",
    "security.mac_filtering",
    "boot.priority",
    "attached",
    "pci",
    "vendorid",
    "productid",
];

const SELECTOR_KEYS: [&str; 3] = ["pci", "vendorid", "productid"];

/// VF settings recorded before start.
fn recorded_vf_settings(values: &HashMap<String, String>) -> Result<VfSettings> {
    let value = |key: &str| values.get(key).map(String::as_str).unwrap_or("");
    Ok(VfSettings {
        hwaddr: match value(VOLATILE_VF_HWADDR) {
            "" => None,
            v => Some(v.parse::<MacAddr>()?),
        },
        vlan: value(VOLATILE_VF_VLAN).parse().unwrap_or(0),
        spoofcheck: validate::is_true(value(VOLATILE_VF_SPOOFCHECK)),
    })
}

/// SR-IOV NIC driver.
#[derive(Clone)]
pub struct NicSriov {
    common: DeviceCommon,
}

impl NicSriov {
    pub(crate) fn new(common: DeviceCommon) -> Self {
        Self { common }
    }

    fn selector(&self) -> CardSelector {
        let config = &self.common.config;
        CardSelector {
            pci: config.get("pci").to_string(),
            vendor_id: config.get("vendorid").to_string(),
            product_id: config.get("productid").to_string(),
        }
    }

    fn started(&self) -> Result<bool> {
        let values = self.common.volatile.get()?;
        Ok([VOLATILE_VF_PARENT, VOLATILE_HOST_NAME]
            .iter()
            .any(|k| values.get(*k).is_some_and(|v| !v.is_empty())))
    }

    /// NUMA nodes to prefer and to fall back to when picking a card.
    fn numa_preference(&self) -> Result<(Vec<u32>, Vec<u32>)> {
        let preferred = self.common.inst.numa_nodes()?;
        if preferred.is_empty() {
            return Ok((preferred, Vec::new()));
        }
        let fallback = self
            .common
            .host()
            .numa_nodes()?
            .into_iter()
            .filter(|n| !preferred.contains(n))
            .collect();
        Ok((preferred, fallback))
    }

    fn post_stop(&self) -> Result<()> {
        let common = &self.common;
        let host = common.host();
        let values = common.volatile.get()?;
        let value = |key: &str| values.get(key).cloned().unwrap_or_default();
        let mut errs = Vec::new();

        let mut claims = common.ctx.resources.sriov();

        let slot = value(VOLATILE_PCI_SLOT);
        if let Err(e) = restore_driver(common, &slot, &value(VOLATILE_PCI_DRIVER)) {
            errs.push(e);
        }

        let host_name = value(VOLATILE_HOST_NAME);
        if !host_name.is_empty() {
            if let Err(e) = link_restore(host, &host_name, &values) {
                errs.push(e);
            }
        }

        let parent = value(VOLATILE_VF_PARENT);
        if let (false, Ok(id)) = (parent.is_empty(), value(VOLATILE_VF_ID).parse::<u32>()) {
            match recorded_vf_settings(&values) {
                Ok(settings) => {
                    if let Err(e) = ignore_missing(host.set_vf(&parent, id, &settings)) {
                        errs.push(e);
                    }
                }
                Err(e) => errs.push(e),
            }
            claims.release(&parent, id, &common.owner());
            tracing::info!(device = %common.name, %parent, vf = id, "released virtual function");
        }
        drop(claims);

        if let Err(e) = common.volatile.clear(&[
            VOLATILE_VF_PARENT,
            VOLATILE_VF_ID,
            VOLATILE_VF_HWADDR,
            VOLATILE_VF_VLAN,
            VOLATILE_VF_SPOOFCHECK,
            VOLATILE_HOST_NAME,
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

impl Device for NicSriov {
    fn name(&self) -> &str {
        &self.common.name
    }

    fn config(&self) -> &DeviceConfig {
        &self.common.config
    }

    fn validate_config(&mut self) -> Result<()> {
        require_kind(&self.common.inst, true, true)?;
        resolve_parent_network(&mut self.common, "sriov", &["parent", "mtu", "vlan"], &["mtu", "vlan"])?;

        let config = &mut self.common.config;
        config.validate(&nic_rules(FIELDS))?;

        let selected = SELECTOR_KEYS.iter().any(|k| config.has(k));
        if config.has("parent") && selected {
            return Err(Error::config(
                "Cannot use \"parent\" together with \"pci\", \"vendorid\" or \"productid\"",
            ));
        }
        if !config.has("parent") && !selected {
            return Err(Error::validation("parent", "required value"));
        }
        if config.has("pci") && (config.has("vendorid") || config.has("productid")) {
            return Err(Error::config(
                "Cannot use \"pci\" together with \"vendorid\" or \"productid\"",
            ));
        }
        if config.has("productid") && !config.has("vendorid") {
            return Err(Error::config("Cannot use \"productid\" without \"vendorid\""));
        }
        if config.has("pci") {
            let pci = validate::normalize_pci_address(config.get("pci"))
                .map_err(|reason| Error::validation("pci", reason))?;
            config.set("pci", pci);
        }
        Ok(())
    }

    fn validate_environment(&self) -> Result<()> {
        let common = &self.common;
        common.reject_stateful_migration("Network SR-IOV devices")?;
        if common.inst.is_container() && !common.config.has("name") {
            return Err(Error::environment("Requires name property to start"));
        }
        let parent = common.config.get("parent");
        if !parent.is_empty() && !common.host().interface_exists(parent) {
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

        let common = &self.common;
        let config = &common.config;
        if config.has("attached") && !config.is_true("attached") {
            tracing::debug!(device = %common.name, "device not attached, skipping start");
            return Ok(RunConfig::new());
        }

        let host = common.host();
        let is_vm = common.inst.is_vm();
        if is_vm {
            host.load_module(VFIO_DRIVER)?;
        }
        let (numa, fallback) = self.numa_preference()?;
        let owner = common.owner();
        let resources = &common.ctx.resources;

        let mut revert = Reverter::new();
        let mut claims = resources.sriov();

        let parent = match config.get("parent") {
            "" => claims.find_parent(host, &self.selector(), &numa, &fallback)?,
            p => p.to_string(),
        };
        let vf = claims.free_vf(host, &parent, !is_vm)?;
        claims.claim(&parent, vf.id, &owner)?;
        {
            let (parent, owner) = (parent.clone(), owner.clone());
            revert.add(move || {
                resources.sriov().release(&parent, vf.id, &owner);
                Ok(())
            });
        }
        tracing::info!(device = %common.name, instance = %common.inst.key(), %parent, vf = vf.id, "claimed virtual function");

        let mac = nic_hwaddr(common)?;
        let vlan: u16 = match config.get("vlan") {
            "" => 0,
            v => v
                .parse()
                .map_err(|_| Error::validation("vlan", format!("invalid VLAN ID {:?}", v)))?,
        };
        let settings = VfSettings {
            hwaddr: Some(mac),
            vlan,
            spoofcheck: config.is_true("security.mac_filtering"),
        };
        host.set_vf(&parent, vf.id, &settings)?;
        {
            let (parent, old) = (parent.clone(), vf.settings.clone());
            revert.add(move || host.set_vf(&parent, vf.id, &old));
        }

        let mut save = vec![
            (VOLATILE_VF_PARENT, parent.clone()),
            (VOLATILE_VF_ID, vf.id.to_string()),
            (
                VOLATILE_VF_HWADDR,
                vf.settings.hwaddr.map(|m| m.to_string()).unwrap_or_default(),
            ),
            (VOLATILE_VF_VLAN, vf.settings.vlan.to_string()),
            (VOLATILE_VF_SPOOFCHECK, vf.settings.spoofcheck.to_string()),
        ];

        let mut run = RunConfig::new();
        if is_vm {
            let (driver, group) = bind_vfio(common, &mut revert, &vf.pci_slot)?;
            save.push((VOLATILE_PCI_SLOT, vf.pci_slot.clone()));
            save.push((VOLATILE_PCI_DRIVER, driver));

            run.network(keys::TYPE, "physical")
                .network(keys::DEV_NAME, common.name.as_str())
                .network(keys::PCI_SLOT_NAME, vf.pci_slot.as_str())
                .network(keys::PCI_IOMMU_GROUP, group.to_string())
                .network(keys::HWADDR, mac.to_string());
            if config.has("mtu") {
                run.network(keys::MTU, config.get("mtu"));
            }
        } else {
            let iface = vf
                .interface
                .clone()
                .ok_or_else(|| Error::not_found(format!("interface of VF {} on {}", vf.id, parent)))?;
            let snapshot = link_snapshot(host, &iface)?;
            apply_link_config(host, &iface, config)?;
            host.set_link(
                &iface,
                &LinkSettings {
                    hwaddr: Some(mac),
                    ..Default::default()
                },
            )?;
            {
                let iface = iface.clone();
                let values: HashMap<String, String> = snapshot
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.clone()))
                    .collect();
                revert.add(move || link_restore(host, &iface, &values));
            }
            save.extend(snapshot);
            save.push((VOLATILE_HOST_NAME, iface.clone()));

            run.network(keys::TYPE, "phys")
                .network(keys::NAME, config.get("name"))
                .network(keys::FLAGS, "up")
                .network(keys::LINK, iface.as_str())
                .network(keys::HWADDR, mac.to_string());
            if config.has("mtu") {
                run.network(keys::MTU, config.get("mtu"));
            }
        }

        common.save(&save)?;
        drop(claims);
        revert.success();
        Ok(run)
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
    use crate::device::{Device, Driver, VOLATILE_PCI_DRIVER, VOLATILE_PCI_SLOT, VOLATILE_VF_ID};
    use crate::host::fake::FakeHost;
    use crate::host::{NetworkCard, VfSettings, VirtualFunction};
    use hostdev_protocol::keys;
    use std::sync::Arc;

    fn sriov_host(vf_count: u32) -> FakeHost {
        let card = NetworkCard {
            interface: "eth1".into(),
            pci_address: "0000:01:00.0".into(),
            vendor_id: "8086".into(),
            product_id: "1572".into(),
            numa_node: Some(0),
        };
        let vfs = (0..vf_count)
            .map(|id| VirtualFunction {
                id,
                pci_slot: format!("0000:01:02.{}", id),
                interface: Some(format!("eth1v{}", id)),
                settings: VfSettings::default(),
            })
            .collect();
        FakeHost::new().with_numa_nodes(&[0, 1]).with_sriov_card(card, vfs)
    }

    fn vf_settings(fx: &Fixture, id: u32) -> VfSettings {
        fx.host.state().vfs["eth1"][id as usize].settings.clone()
    }

    #[test]
    fn test_container_claims_and_restores_vf() {
        let fx = Fixture::new(sriov_host(2));
        let inst = container("c1");
        let mut dev = fx
            .load(
                &inst,
                "eth0",
                &[
                    ("type", "nic"),
                    ("nictype", "sriov"),
                    ("parent", "eth1"),
                    ("name", "eth0"),
                    ("vlan", "100"),
                    ("mtu", "9000"),
                    ("security.mac_filtering", "true"),
                ],
            )
            .unwrap();

        let run = dev.start().unwrap();
        assert_eq!(run.descriptor.network_value(keys::LINK), Some("eth1v0"));
        let recorded = fx.volatile(&inst, "eth0");
        assert!(!recorded.contains_key(VOLATILE_PCI_DRIVER) && !recorded.contains_key(VOLATILE_PCI_SLOT));
        let settings = vf_settings(&fx, 0);
        assert_eq!(settings.vlan, 100);
        assert!(settings.spoofcheck);
        assert!(settings.hwaddr.is_some());
        assert_eq!(fx.host.state().links["eth1v0"].mtu, 9000);
        assert_eq!(fx.ctx.resources.sriov().owner("eth1", 0), Some("default/c1/eth0"));

        stop_and_cleanup(&mut dev).unwrap();
        assert_eq!(vf_settings(&fx, 0), VfSettings::default());
        assert_eq!(fx.host.state().links["eth1v0"].mtu, 1500);
        assert_eq!(fx.ctx.resources.sriov().owner("eth1", 0), None);
        assert!(fx.volatile(&inst, "eth0").is_empty());
        stop_and_cleanup(&mut dev).unwrap();
    }

    #[test]
    fn test_vm_binds_vf_to_vfio() {
        let fx = Fixture::new(sriov_host(1));
        let inst = vm("v1");
        let mut dev = fx
            .load(&inst, "eth0", &[("type", "nic"), ("nictype", "sriov"), ("vendorid", "8086")])
            .unwrap();

        let run = dev.start().unwrap();
        assert_eq!(run.descriptor.network_value(keys::PCI_SLOT_NAME), Some("0000:01:02.0"));
        assert_eq!(run.descriptor.network_value(keys::PCI_IOMMU_GROUP), Some("40"));
        assert_eq!(fx.host.pci_driver("0000:01:02.0").as_deref(), Some("vfio-pci"));

        stop_and_cleanup(&mut dev).unwrap();
        assert_eq!(fx.host.pci_driver("0000:01:02.0").as_deref(), Some("iavf"));
    }

    #[test]
    fn test_concurrent_claims_are_exclusive() {
        let fx = Arc::new(Fixture::new(sriov_host(2)));
        let cfg = [("type", "nic"), ("nictype", "sriov"), ("parent", "eth1"), ("name", "eth0")];

        let results: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|i| {
                    let fx = fx.clone();
                    s.spawn(move || {
                        let inst = container(&format!("c{}", i));
                        let mut dev = fx.load(&inst, "eth0", &cfg).unwrap();
                        dev.start().map(|_| fx.volatile(&inst, "eth0")[VOLATILE_VF_ID].clone())
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let mut claimed: Vec<String> = results.iter().filter_map(|r| r.as_ref().ok().cloned()).collect();
        claimed.sort();
        assert_eq!(claimed, vec!["0", "1"]);
        for err in results.iter().filter_map(|r| r.as_ref().err()) {
            assert!(err.is_resource_exhausted(), "{}", err);
        }
    }

    #[test]
    fn test_failed_set_vf_releases_claim() {
        let fx = Fixture::new(sriov_host(1));
        fx.host.fail_on("set_vf");
        let mut dev = fx
            .load(&container("c1"), "eth0", &[("type", "nic"), ("nictype", "sriov"), ("parent", "eth1"), ("name", "eth0")])
            .unwrap();
        assert!(dev.start().is_err());
        assert_eq!(fx.ctx.resources.sriov().owner("eth1", 0), None);
    }

    #[test]
    fn test_validation_rules() {
        let fx = Fixture::new(sriov_host(1));
        let c = container("c1");
        let err = fx
            .load(&c, "eth0", &[("type", "nic"), ("nictype", "sriov"), ("parent", "eth1"), ("vendorid", "8086")])
            .err()
            .unwrap();
        assert!(err.to_string().contains("\"parent\" together"));

        let err = fx.load(&c, "eth0", &[("type", "nic"), ("nictype", "sriov")]).err().unwrap();
        assert!(err.to_string().contains("parent"));

        let dev = fx
            .load(&c, "eth0", &[("type", "nic"), ("nictype", "sriov"), ("pci", "01:00.0")])
            .unwrap();
        assert_eq!(dev.config().get("pci"), "0000:01:00.0");

        let mut dev = fx
            .load(&c, "eth0", &[("type", "nic"), ("nictype", "sriov"), ("parent", "eth1"), ("name", "eth0"), ("attached", "false")])
            .unwrap();
        assert!(dev.start().unwrap().is_empty());
        assert!(matches!(dev, Driver::Sriov(_)));
    }
}
