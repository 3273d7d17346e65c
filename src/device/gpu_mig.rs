//! NVIDIA MIG slices for containers.
//!
//! Nothing is set up on the host: the container runtime's NVIDIA hook does
//! the work, this driver only picks the slice.

use super::validate::{self, optional};
use super::{
    gpu_selected, require_kind, validate_gpu_selection, Device, DeviceCommon, DeviceConfig, Rules,
    RunConfig,
};
use crate::error::{Error, Result};
use crate::host::GpuCard;
use hostdev_protocol::keys;

/// GPU MIG driver.
#[derive(Clone)]
pub struct GpuMig {
    common: DeviceCommon,
}

impl GpuMig {
    pub(crate) fn new(common: DeviceCommon) -> Self {
        Self { common }
    }

    fn parse_index(&self, key: &str) -> Result<u32> {
        let value = self.common.config.get(key);
        value
            .parse()
            .map_err(|_| Error::validation(key, format!("invalid value {:?}", value)))
    }
}

impl Device for GpuMig {
    fn name(&self) -> &str {
        &self.common.name
    }

    fn config(&self) -> &DeviceConfig {
        &self.common.config
    }

    fn validate_config(&mut self) -> Result<()> {
        require_kind(&self.common.inst, true, false)?;

        let mut rules = Rules::new();
        rules
            .insert("mig.uuid", optional(validate::is_any))
            .insert("mig.gi", optional(validate::is_uint32))
            .insert("mig.ci", optional(validate::is_uint32))
            .insert("vendorid", optional(validate::is_device_id))
            .insert("productid", optional(validate::is_device_id))
            .insert("id", optional(validate::is_uint32))
            .insert("pci", optional(validate::is_pci_address));
        let config = &mut self.common.config;
        config.validate(&rules)?;
        validate_gpu_selection(config)?;

        let by_uuid = config.has("mig.uuid");
        let by_index = config.has("mig.gi") && config.has("mig.ci");
        let any_index = config.has("mig.gi") || config.has("mig.ci");
        if (by_uuid && any_index) || (!by_uuid && !by_index) {
            return Err(Error::config(
                "Either \"mig.uuid\" or both \"mig.gi\" and \"mig.ci\" must be set",
            ));
        }

        if config.has("pci") {
            let pci = validate::normalize_pci_address(config.get("pci"))
                .map_err(|reason| Error::validation("pci", reason))?;
            config.set("pci", pci);
        }
        Ok(())
    }

    fn validate_environment(&self) -> Result<()> {
        if !validate::is_true(self.common.inst.config_value("nvidia.runtime")) {
            return Err(Error::environment(
                "nvidia.runtime must be set to true for MIG GPUs to work",
            ));
        }
        Ok(())
    }

    fn can_hot_plug(&self) -> bool {
        false
    }

    fn start(&mut self) -> Result<RunConfig> {
        self.validate_environment()?;
        let common = &self.common;
        let host = common.host();

        let mut matched: Vec<GpuCard> = host
            .gpus()?
            .into_iter()
            .filter(|gpu| gpu_selected(&common.config, gpu))
            .collect();
        if matched.len() > 1 {
            return Err(Error::config("More than one GPU matched the MIG device"));
        }
        let gpu = matched
            .pop()
            .ok_or_else(|| Error::environment("Failed to detect requested GPU device"))?;
        let nvidia = gpu.nvidia.as_ref().ok_or_else(|| {
            Error::environment(format!(
                "Card {} isn't a NVIDIA GPU or driver isn't properly setup",
                gpu.pci_address
            ))
        })?;

        let device = match common.config.get("mig.uuid") {
            "" => {
                let gi = self.parse_index("mig.gi")?;
                let ci = self.parse_index("mig.ci")?;
                if !host.mig_instance_exists(nvidia.minor, gi, ci) {
                    return Err(Error::environment(format!(
                        "MIG instance {}/{} doesn't exist on GPU {}",
                        gi, ci, nvidia.uuid
                    )));
                }
                format!("MIG-{}/{}/{}", nvidia.uuid, gi, ci)
            }
            uuid if uuid.starts_with("MIG-") => uuid.to_string(),
            uuid => format!("MIG-{}", uuid),
        };

        tracing::info!(device = %common.name, instance = %common.inst.key(), pci = %gpu.pci_address, mig = %device, "selected MIG slice");
        let mut run = RunConfig::new();
        run.gpu(keys::NVIDIA_DEVICE, device);
        Ok(run)
    }

    fn stop(&mut self) -> Result<RunConfig> {
        Ok(RunConfig::new())
    }
}
