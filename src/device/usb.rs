//! USB passthrough.
//!
//! VMs get the matching devices as USB descriptors. Containers get a device
//! node per match plus its cgroup rule. Both keep following the selection
//! after start through a hotplug handler, so `required=false` devices may be
//! plugged in later.

use super::devnode::{owner_rules, NodeSetup};
use super::validate::{self, optional};
use super::{require_kind, Device, DeviceCommon, DeviceConfig, Rules, RunConfig};
use crate::error::{Error, Result};
use crate::host::{DeviceNode, NodeKind, UsbDeviceInfo};
use crate::hotplug::{Subscriber, UsbEvent};
use hostdev_protocol::{HotplugAction, UsbDevice};
use std::sync::Arc;

/// USB driver.
#[derive(Clone)]
pub struct Usb {
    common: DeviceCommon,
}

/// Whether a USB device is selected by the config. Unset keys match anything.
fn usb_is_ours(config: &DeviceConfig, event: &UsbEvent) -> bool {
    let matches = |key: &str, value: &str| config.get(key).is_empty() || config.get(key) == value;
    matches("vendorid", &event.vendor)
        && matches("productid", &event.product)
        && matches("serial", &event.serial)
        && matches("busnum", &event.busnum.to_string())
        && matches("devnum", &event.devnum.to_string())
}

/// A present device seen as an add event.
fn present(info: &UsbDeviceInfo) -> UsbEvent {
    UsbEvent {
        action: HotplugAction::Add,
        vendor: info.vendor_id.clone(),
        product: info.product_id.clone(),
        serial: info.serial.clone(),
        busnum: info.busnum,
        devnum: info.devnum,
        major: info.major,
        minor: info.minor,
        path: info.dev_path().trim_start_matches("/dev/").to_string(),
        uevent_parts: Vec::new(),
    }
}

/// Descriptor naming the device by bus and device number.
fn usb_descriptor(device: &str, event: &UsbEvent) -> UsbDevice {
    UsbDevice {
        device_name: format!("{}-{:03}-{:03}", device, event.busnum, event.devnum),
        host_device_path: format!("/dev/bus/usb/{:03}/{:03}", event.busnum, event.devnum),
    }
}

fn node_of(event: &UsbEvent) -> DeviceNode {
    DeviceNode {
        kind: NodeKind::Char,
        major: event.major,
        minor: event.minor,
    }
}

fn dest_of(event: &UsbEvent) -> String {
    format!("/dev/{}", event.path)
}

impl Usb {
    pub(crate) fn new(common: DeviceCommon) -> Self {
        Self { common }
    }

    fn is_required(&self) -> bool {
        validate::is_true(self.common.config.get("required"))
    }

    fn subscriber(&self) -> Subscriber {
        let inst = &self.common.inst;
        Subscriber::new(&inst.project, &inst.name, &self.common.name)
    }

    /// Matching devices currently plugged in.
    fn matching(&self) -> Result<Vec<UsbEvent>> {
        Ok(self
            .common
            .host()
            .usb_devices()?
            .iter()
            .map(present)
            .filter(|e| usb_is_ours(&self.common.config, e))
            .collect())
    }

    /// Subscribe to USB events for this device.
    fn register(&self) -> Result<()> {
        let config = self.common.config.clone();
        let device = self.common.name.clone();
        let nodes = if self.common.inst.is_container() {
            Some(NodeSetup::new(&self.common)?)
        } else {
            None
        };

        self.common.ctx.hotplug.register_usb(
            self.subscriber(),
            Arc::new(move |event: &UsbEvent| {
                if !usb_is_ours(&config, event) {
                    return Ok(None);
                }
                let mut run = RunConfig::new();
                if let Some(nodes) = &nodes {
                    let dest = dest_of(event);
                    match event.action {
                        HotplugAction::Add => nodes.add(&node_of(event), &dest, &mut run)?,
                        HotplugAction::Remove => {
                            nodes.detach(&dest, &mut run)?;
                            // The device is gone, the bind mount source can go too.
                            nodes.delete(&dest)?;
                        }
                    }
                    run.uevent(event.uevent_parts.clone());
                }
                tracing::info!(%device, action = ?event.action, vendor = %event.vendor, product = %event.product, "USB hotplug");
                run.usb(usb_descriptor(&device, event));
                Ok(Some(run))
            }),
        );
        Ok(())
    }

    fn start_vm(&self) -> Result<RunConfig> {
        let mut run = RunConfig::new();
        for event in self.matching()? {
            run.usb(usb_descriptor(&self.common.name, &event));
        }
        if self.is_required() && run.descriptor.usb_device.is_empty() {
            return Err(Error::environment("Required USB device not found"));
        }
        Ok(run)
    }

    fn start_container(&self) -> Result<RunConfig> {
        let nodes = NodeSetup::new(&self.common)?;
        let mut run = RunConfig::new();
        for event in self.matching()? {
            nodes.add(&node_of(&event), &dest_of(&event), &mut run)?;
        }
        if self.is_required() && run.descriptor.mounts.is_empty() {
            // Nothing else was created.
            nodes.delete_all()?;
            return Err(Error::environment("Required USB device not found"));
        }
        Ok(run)
    }
}

impl Device for Usb {
    fn name(&self) -> &str {
        &self.common.name
    }

    fn config(&self) -> &DeviceConfig {
        &self.common.config
    }

    fn validate_config(&mut self) -> Result<()> {
        require_kind(&self.common.inst, true, true)?;
        if self.common.inst.architecture == "s390x" {
            return Err(Error::config("USB devices aren't supported on s390x"));
        }

        let mut rules = Rules::new();
        rules
            .insert("vendorid", optional(validate::is_device_id))
            .insert("productid", optional(validate::is_device_id))
            .insert("serial", optional(validate::is_any))
            .insert("required", optional(validate::is_bool))
            .insert("busnum", optional(validate::is_uint32))
            .insert("devnum", optional(validate::is_uint32));
        owner_rules(&mut rules);
        self.common.config.validate(&rules)
    }

    fn validate_environment(&self) -> Result<()> {
        self.common.reject_stateful_migration("USB devices")
    }

    fn can_hot_plug(&self) -> bool {
        true
    }

    fn start(&mut self) -> Result<RunConfig> {
        self.validate_environment()?;
        let mut run = if self.common.inst.is_vm() {
            self.start_vm()?
        } else {
            self.start_container()?
        };

        let this = self.clone();
        run.post_hook(move || this.register());
        Ok(run)
    }

    fn stop(&mut self) -> Result<RunConfig> {
        self.common.ctx.hotplug.unregister_usb(&self.subscriber());

        let mut run = RunConfig::new();
        for event in self.matching()? {
            run.usb(usb_descriptor(&self.common.name, &event));
        }
        if self.common.inst.is_container() {
            let nodes = NodeSetup::new(&self.common)?;
            nodes.detach_all(&mut run)?;
            run.post_hook(move || nodes.delete_all());
        }
        Ok(run)
    }
}
