//! Generic PCI passthrough (VMs only), plus the vfio rebinding helpers the
//! physical and SR-IOV NICs share.

use super::validate::{self, optional, required};
use super::{
    require_kind, Device, DeviceCommon, DeviceConfig, Reverter, Rules, RunConfig,
    VOLATILE_PCI_DRIVER, VOLATILE_PCI_SLOT,
};
use crate::error::{Error, Result};
use hostdev_protocol::keys;

/// Driver PCI functions are handed to VMs through.
pub(crate) const VFIO_DRIVER: &str = "vfio-pci";

/// Rebind `slot` to vfio-pci.
///
/// Returns the driver it was bound to before (empty when unbound) and its
/// IOMMU group. Rebinding back is pushed onto `revert`.
pub(super) fn bind_vfio<'a>(
    common: &'a DeviceCommon,
    revert: &mut Reverter<'a>,
    slot: &str,
) -> Result<(String, u64)> {
    let host = common.host();
    let _guard = common.ctx.resources.lock_pci(slot);

    let dev = host.pci_device(slot)?;
    let group = host.pci_iommu_group(slot)?;
    if dev.driver != VFIO_DRIVER {
        host.pci_bind(slot, VFIO_DRIVER)?;
        tracing::info!(%slot, from = %dev.driver, "bound PCI device to vfio-pci");
        let (undo_slot, undo_driver) = (slot.to_string(), dev.driver.clone());
        revert.add(move || common.host().pci_bind(&undo_slot, &undo_driver));
    }
    Ok((dev.driver, group))
}

/// Rebind `slot` to the driver recorded before start. An empty driver
/// leaves the slot unbound.
pub(super) fn restore_driver(common: &DeviceCommon, slot: &str, driver: &str) -> Result<()> {
    if slot.is_empty() {
        return Ok(());
    }
    let host = common.host();
    let _guard = common.ctx.resources.lock_pci(slot);

    let dev = match host.pci_device(slot) {
        Ok(dev) => dev,
        Err(e) if e.is_not_found() => return Ok(()),
        Err(e) => return Err(e),
    };
    if dev.driver == driver {
        return Ok(());
    }
    host.pci_bind(slot, driver)?;
    tracing::info!(%slot, %driver, "restored PCI driver");
    Ok(())
}

/// Items describing a passed-through PCI function.
pub(super) fn pci_items(run: &mut RunConfig, dev_name: &str, slot: &str, group: u64) {
    run.pci(keys::DEV_NAME, dev_name)
        .pci(keys::PCI_SLOT_NAME, slot)
        .pci(keys::PCI_IOMMU_GROUP, group.to_string());
}

/// PCI passthrough driver.
#[derive(Clone)]
pub struct PciPassthrough {
    common: DeviceCommon,
}

impl PciPassthrough {
    pub(crate) fn new(common: DeviceCommon) -> Self {
        Self { common }
    }

    fn post_stop(&self) -> Result<()> {
        let values = self.common.volatile.get()?;
        let slot = values.get(VOLATILE_PCI_SLOT).cloned().unwrap_or_default();
        let driver = values.get(VOLATILE_PCI_DRIVER).cloned().unwrap_or_default();

        let mut errs = Vec::new();
        if let Err(e) = restore_driver(&self.common, &slot, &driver) {
            errs.push(e);
        }
        if let Err(e) = self
            .common
            .volatile
            .clear(&[VOLATILE_PCI_SLOT, VOLATILE_PCI_DRIVER])
        {
            errs.push(e);
        }
        Error::from_cleanup(errs)
    }
}

impl Device for PciPassthrough {
    fn name(&self) -> &str {
        &self.common.name
    }

    fn config(&self) -> &DeviceConfig {
        &self.common.config
    }

    fn validate_config(&mut self) -> Result<()> {
        require_kind(&self.common.inst, false, true)?;

        let mut rules = Rules::new();
        rules
            .insert("address", required(validate::is_pci_address))
            .insert("firmware", optional(validate::is_bool));
        self.common.config.validate(&rules)?;

        let address = validate::normalize_pci_address(self.common.config.get("address"))
            .map_err(|reason| Error::validation("address", reason))?;
        self.common.config.set("address", address);
        Ok(())
    }

    fn validate_environment(&self) -> Result<()> {
        self.common.reject_stateful_migration("PCI devices")?;
        let address = self.common.config.get("address");
        match self.common.host().pci_device(address) {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Err(Error::environment(format!(
                "Invalid PCI address {:?} (no device found)",
                address
            ))),
            Err(e) => Err(e),
        }
    }

    fn can_hot_plug(&self) -> bool {
        true
    }

    fn start(&mut self) -> Result<RunConfig> {
        self.validate_environment()?;
        if !self.common.volatile_value(VOLATILE_PCI_SLOT)?.is_empty() {
            tracing::warn!(device = %self.common.name, "cleaning up state of a previous start");
            self.post_stop()?;
        }

        let common = &self.common;
        let slot = common.config.get("address");
        let mut revert = Reverter::new();

        common.host().load_module(VFIO_DRIVER)?;
        let (driver, group) = bind_vfio(common, &mut revert, slot)?;
        common.save(&[
            (VOLATILE_PCI_SLOT, slot.to_string()),
            (VOLATILE_PCI_DRIVER, driver),
        ])?;

        let mut run = RunConfig::new();
        pci_items(&mut run, &common.name, slot, group);
        tracing::info!(device = %common.name, instance = %common.inst.key(), %slot, iommu_group = group, "started PCI passthrough");
        revert.success();
        Ok(run)
    }

    fn stop(&mut self) -> Result<RunConfig> {
        let mut run = RunConfig::new();
        let slot = self.common.volatile_value(VOLATILE_PCI_SLOT)?;
        if !slot.is_empty() {
            run.pci(keys::DEV_NAME, self.common.name.as_str())
                .pci(keys::PCI_SLOT_NAME, slot);
        }
        let this = self.clone();
        run.post_hook(move || this.post_stop());
        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use crate::device::testing::*;
    use crate::device::{Device, VOLATILE_PCI_DRIVER};
    use crate::host::fake::FakeHost;
    use crate::host::PciDevice;
    use hostdev_protocol::keys;

    fn pci(slot: &str, driver: &str) -> PciDevice {
        PciDevice {
            slot_name: slot.to_string(),
            driver: driver.to_string(),
            vendor_id: "8086".to_string(),
            product_id: "1533".to_string(),
            numa_node: None,
        }
    }

    #[test]
    fn test_driver_restore_round_trip() {
        for original in ["igb", ""] {
            let fx = Fixture::new(FakeHost::new().with_pci(pci("0000:03:00.0", original), 12));
            let inst = vm("v1");
            let mut dev = fx.load(&inst, "nic", &[("type", "pci"), ("address", "03:00.0")]).unwrap();
            assert_eq!(dev.config().get("address"), "0000:03:00.0");

            let run = dev.start().unwrap();
            assert_eq!(fx.host.pci_driver("0000:03:00.0").as_deref(), Some("vfio-pci"));
            let items = &run.descriptor.pci_device;
            assert!(items.iter().any(|i| i.key == keys::PCI_IOMMU_GROUP && i.value == "12"));
            assert_eq!(fx.volatile(&inst, "nic")[VOLATILE_PCI_DRIVER], original);

            stop_and_cleanup(&mut dev).unwrap();
            assert_eq!(fx.host.pci_driver("0000:03:00.0").as_deref(), Some(original));
            assert!(fx.volatile(&inst, "nic").is_empty());

            stop_and_cleanup(&mut dev).unwrap();
        }
    }

    #[test]
    fn test_bind_failure_leaves_nothing_recorded() {
        let fx = Fixture::new(FakeHost::new().with_pci(pci("0000:03:00.0", "igb"), 12));
        fx.host.fail_on("pci_bind");
        let inst = vm("v1");
        let mut dev = fx.load(&inst, "nic", &[("type", "pci"), ("address", "0000:03:00.0")]).unwrap();
        assert!(dev.start().is_err());
        assert_eq!(fx.host.pci_driver("0000:03:00.0").as_deref(), Some("igb"));
        assert!(fx.volatile(&inst, "nic").is_empty());
    }

    #[test]
    fn test_environment_checks() {
        let fx = Fixture::new(FakeHost::new());
        let err = fx.load(&container("c1"), "nic", &[("type", "pci"), ("address", "0000:03:00.0")]).err().unwrap();
        assert!(err.is_unsupported_dev_type());

        let dev = fx.load(&vm("v1"), "nic", &[("type", "pci"), ("address", "0000:03:00.0")]).unwrap();
        assert!(dev.validate_environment().unwrap_err().to_string().contains("no device found"));

        let fx = Fixture::new(FakeHost::new().with_pci(pci("0000:03:00.0", "igb"), 12));
        let dev = fx
            .load(&vm_with("v1", &[("migration.stateful", "true")]), "nic", &[("type", "pci"), ("address", "0000:03:00.0")])
            .unwrap();
        assert!(dev.validate_environment().unwrap_err().to_string().contains("migration.stateful"));
    }
}
