//! Mediated GPU slices (vGPU) for VMs.

use super::validate::{self, optional, required};
use super::{
    gpu_selected, require_kind, validate_gpu_selection, Device, DeviceCommon, DeviceConfig,
    Reverter, Rules, RunConfig, VOLATILE_PCI_DRIVER, VOLATILE_PCI_SLOT, VOLATILE_VGPU_PARENT,
    VOLATILE_VGPU_UUID,
};
use crate::error::{Error, Result};
use crate::host::GpuCard;
use hostdev_protocol::keys;

/// GPU mdev driver.
#[derive(Clone)]
pub struct GpuMdev {
    common: DeviceCommon,
}

impl GpuMdev {
    pub(crate) fn new(common: DeviceCommon) -> Self {
        Self { common }
    }

    /// The one GPU selected by the config.
    fn selected_gpu(&self) -> Result<GpuCard> {
        let mut matched: Vec<GpuCard> = self
            .common
            .host()
            .gpus()?
            .into_iter()
            .filter(|gpu| gpu_selected(&self.common.config, gpu))
            .collect();
        if matched.len() > 1 {
            return Err(Error::config("VMs cannot match multiple GPUs per device"));
        }
        matched
            .pop()
            .ok_or_else(|| Error::environment("Failed to detect requested GPU device"))
    }

    fn post_stop(&self) -> Result<()> {
        let common = &self.common;
        let host = common.host();
        let values = common.volatile.get()?;
        let uuid = values.get(VOLATILE_VGPU_UUID).cloned().unwrap_or_default();
        let parent = match values.get(VOLATILE_VGPU_PARENT) {
            Some(parent) => parent.clone(),
            None => values.get(VOLATILE_PCI_SLOT).cloned().unwrap_or_default(),
        };
        let mut errs = Vec::new();

        if !uuid.is_empty() {
            let _guard = common.ctx.resources.lock_mdev(&parent);
            if host.mdev_exists(&uuid) {
                match host.mdev_remove(&uuid) {
                    Ok(()) => tracing::info!(device = %common.name, %uuid, "removed mdev"),
                    Err(e) => errs.push(e),
                }
            }
        }
        if let Err(e) = common
            .volatile
            .clear(&[VOLATILE_VGPU_UUID, VOLATILE_VGPU_PARENT, VOLATILE_PCI_SLOT, VOLATILE_PCI_DRIVER])
        {
            errs.push(e);
        }
        Error::from_cleanup(errs)
    }
}

impl Device for GpuMdev {
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
            .insert("mdev", required(validate::is_any))
            .insert("vendorid", optional(validate::is_device_id))
            .insert("productid", optional(validate::is_device_id))
            .insert("id", optional(validate::is_uint32))
            .insert("pci", optional(validate::is_pci_address));
        let config = &mut self.common.config;
        config.validate(&rules)?;
        validate_gpu_selection(config)?;

        if config.has("pci") {
            let pci = validate::normalize_pci_address(config.get("pci"))
                .map_err(|reason| Error::validation("pci", reason))?;
            config.set("pci", pci);
        }
        Ok(())
    }

    fn validate_environment(&self) -> Result<()> {
        self.common.reject_stateful_migration("GPU devices")?;
        let pci = self.common.config.get("pci");
        if !pci.is_empty() && self.common.host().pci_device(pci).is_err() {
            return Err(Error::environment(format!("Invalid PCI address {:?} (no device found)", pci)));
        }
        Ok(())
    }

    fn can_hot_plug(&self) -> bool {
        true
    }

    fn start(&mut self) -> Result<RunConfig> {
        self.validate_environment()?;

        let common = &self.common;
        let host = common.host();
        let profile = common.config.get("mdev");
        let parent = self.selected_gpu()?.pci_address;

        // Profile availability is only read with the parent's lock held.
        let _guard = common.ctx.resources.lock_mdev(&parent);
        let gpu = self.selected_gpu()?;
        if gpu.pci_address != parent {
            return Err(Error::environment("GPU selection changed during start"));
        }
        let candidates: Vec<&GpuCard> = std::iter::once(&gpu).chain(gpu.vfs.iter()).collect();
        if !candidates.iter().any(|c| c.mdev_profiles.contains_key(profile)) {
            return Err(Error::config(format!("Invalid mdev profile {:?}", profile)));
        }

        let mut revert = Reverter::new();
        let values = common.volatile.get()?;
        let recorded = values.get(VOLATILE_VGPU_UUID).cloned().unwrap_or_default();
        let recorded_slot = values.get(VOLATILE_PCI_SLOT).cloned().unwrap_or_default();

        let (uuid, slot) = if !recorded.is_empty() && host.mdev_exists(&recorded) {
            tracing::debug!(device = %common.name, uuid = %recorded, "reusing existing mdev");
            (recorded, recorded_slot)
        } else {
            let target = candidates
                .iter()
                .find(|c| c.mdev_profiles.get(profile).is_some_and(|n| *n > 0))
                .ok_or_else(|| Error::exhausted(format!("No available mdev for profile {:?}", profile)))?;

            let uuid = uuid::Uuid::new_v4().to_string();
            host.mdev_create(&target.pci_address, profile, &uuid)?;
            tracing::info!(device = %common.name, pci = %target.pci_address, %profile, %uuid, "created mdev");
            let undo = uuid.clone();
            revert.add(move || host.mdev_remove(&undo));
            (uuid, target.pci_address.clone())
        };

        let driver = match host.pci_device(&slot) {
            Ok(dev) => dev.driver,
            Err(e) if e.is_not_found() => String::new(),
            Err(e) => return Err(e),
        };
        common.save(&[
            (VOLATILE_PCI_SLOT, slot.clone()),
            (VOLATILE_PCI_DRIVER, driver),
            (VOLATILE_VGPU_UUID, uuid.clone()),
            (VOLATILE_VGPU_PARENT, parent.clone()),
        ])?;

        let mut run = RunConfig::new();
        run.gpu(keys::DEV_NAME, common.name.as_str())
            .gpu(keys::PCI_SLOT_NAME, slot)
            .gpu(keys::VGPU, uuid);
        revert.success();
        Ok(run)
    }

    fn stop(&mut self) -> Result<RunConfig> {
        let mut run = RunConfig::new();
        run.gpu(keys::DEV_NAME, self.common.name.as_str());
        let this = self.clone();
        run.post_hook(move || this.post_stop());
        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use crate::device::testing::*;
    use crate::device::{Device, RunConfig, VOLATILE_VGPU_PARENT, VOLATILE_VGPU_UUID};
    use crate::host::fake::FakeHost;
    use crate::host::GpuCard;
    use hostdev_protocol::keys;
    use std::collections::BTreeMap;
    use std::sync::{Arc, Barrier};
    use std::time::Duration;

    fn gpu(pci: &str, profiles: &[(&str, u64)], vfs: Vec<GpuCard>) -> GpuCard {
        GpuCard {
            pci_address: pci.to_string(),
            vendor_id: "10de".to_string(),
            product_id: "1eb8".to_string(),
            drm_card_id: Some(0),
            numa_node: None,
            mdev_profiles: profiles.iter().map(|(p, n)| (p.to_string(), *n)).collect::<BTreeMap<_, _>>(),
            vfs,
            nvidia: None,
        }
    }

    const CFG: [(&str, &str); 3] = [("type", "gpu"), ("gputype", "mdev"), ("mdev", "nvidia-63")];

    #[test]
    fn test_create_and_remove_mdev() {
        let fx = Fixture::new(FakeHost::new().with_gpu(gpu("0000:41:00.0", &[("nvidia-63", 1)], Vec::new())));
        let v1 = vm("v1");
        let mut dev = fx.load(&v1, "gpu0", &CFG).unwrap();

        let run = dev.start().unwrap();
        let uuid = fx.volatile(&v1, "gpu0")[VOLATILE_VGPU_UUID].clone();
        assert!(run.descriptor.gpu_device.iter().any(|i| i.key == keys::VGPU && i.value == uuid));
        assert!(fx.host.state().mdevs.contains_key(&uuid));

        // The only slot is taken.
        let mut other = fx.load(&vm("v2"), "gpu0", &CFG).unwrap();
        assert!(other.start().unwrap_err().is_resource_exhausted());

        stop_and_cleanup(&mut dev).unwrap();
        assert!(fx.host.state().mdevs.is_empty());
        assert!(fx.volatile(&v1, "gpu0").is_empty());
        stop_and_cleanup(&mut dev).unwrap();

        assert!(other.start().is_ok());
    }

    #[test]
    fn test_racing_starts_for_last_slot() {
        for _ in 0..50 {
            let fx = Arc::new(Fixture::new(
                FakeHost::new().with_gpu(gpu("0000:41:00.0", &[("nvidia-63", 1)], Vec::new())),
            ));
            let barrier = Arc::new(Barrier::new(2));

            let results: Vec<_> = std::thread::scope(|s| {
                let handles: Vec<_> = (0..2)
                    .map(|i| {
                        let fx = fx.clone();
                        let barrier = barrier.clone();
                        s.spawn(move || {
                            let mut dev = fx.load(&vm(&format!("v{}", i)), "gpu0", &CFG).unwrap();
                            barrier.wait();
                            dev.start().map(|_| ())
                        })
                    })
                    .collect();
                handles.into_iter().map(|h| h.join().unwrap()).collect()
            });

            assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
            for err in results.iter().filter_map(|r| r.as_ref().err()) {
                assert!(err.is_resource_exhausted(), "{}", err);
            }
        }
    }

    #[test]
    fn test_stop_locks_parent_of_virtual_function() {
        let vf = gpu("0000:41:00.4", &[("nvidia-63", 1)], Vec::new());
        let fx = Fixture::new(FakeHost::new().with_gpu(gpu("0000:41:00.0", &[], vec![vf])));
        let v1 = vm("v1");
        let mut dev = fx.load(&v1, "gpu0", &CFG).unwrap();
        dev.start().unwrap();
        assert_eq!(fx.volatile(&v1, "gpu0")[VOLATILE_VGPU_PARENT], "0000:41:00.0");

        let run = dev.stop().unwrap();
        {
            let held = fx.ctx.resources.lock_mdev("0000:41:00.0");
            let hooks = std::thread::spawn(move || RunConfig::run_post_hooks(run.post_hooks));
            std::thread::sleep(Duration::from_millis(50));
            assert_eq!(fx.host.state().mdevs.len(), 1);
            drop(held);
            hooks.join().unwrap().unwrap();
        }
        assert!(fx.host.state().mdevs.is_empty());
        assert!(fx.volatile(&v1, "gpu0").is_empty());
        stop_and_cleanup(&mut dev).unwrap();
        assert!(fx.volatile(&v1, "gpu0").is_empty());
    }

    #[test]
    fn test_existing_mdev_reused() {
        let fx = Fixture::new(FakeHost::new().with_gpu(gpu("0000:41:00.0", &[("nvidia-63", 2)], Vec::new())));
        let v1 = vm("v1");
        let mut dev = fx.load(&v1, "gpu0", &CFG).unwrap();
        dev.start().unwrap();
        let first = fx.volatile(&v1, "gpu0")[VOLATILE_VGPU_UUID].clone();

        dev.start().unwrap();
        assert_eq!(fx.volatile(&v1, "gpu0")[VOLATILE_VGPU_UUID], first);
        assert_eq!(fx.host.op_count("mdev_create"), 1);
    }

    #[test]
    fn test_profile_on_virtual_function() {
        let vf = gpu("0000:41:00.4", &[("nvidia-63", 1)], Vec::new());
        let fx = Fixture::new(FakeHost::new().with_gpu(gpu("0000:41:00.0", &[], vec![vf])));
        let mut dev = fx.load(&vm("v1"), "gpu0", &CFG).unwrap();
        let run = dev.start().unwrap();
        assert!(run
            .descriptor
            .gpu_device
            .iter()
            .any(|i| i.key == keys::PCI_SLOT_NAME && i.value == "0000:41:00.4"));
    }

    #[test]
    fn test_selection_errors() {
        let fx = Fixture::new(
            FakeHost::new()
                .with_gpu(gpu("0000:41:00.0", &[("nvidia-63", 1)], Vec::new()))
                .with_gpu(gpu("0000:42:00.0", &[("nvidia-63", 1)], Vec::new())),
        );
        let mut dev = fx.load(&vm("v1"), "gpu0", &CFG).unwrap();
        assert!(dev.start().unwrap_err().to_string().contains("multiple GPUs"));

        let mut dev = fx
            .load(&vm("v1"), "gpu0", &[("type", "gpu"), ("gputype", "mdev"), ("mdev", "nvidia-99"), ("pci", "41:00.0")])
            .unwrap();
        assert!(dev.start().unwrap_err().to_string().contains("Invalid mdev profile"));

        let err = fx.load(&container("c1"), "gpu0", &CFG).err().unwrap();
        assert!(err.is_unsupported_dev_type());
    }
}
