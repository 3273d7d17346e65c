//! Hotplug subscriptions.
//!
//! USB and Unix device drivers register a handler per device when they
//! start. The monitors in [`monitor`] feed kernel events into
//! [`HotplugRegistry::dispatch_usb`] and [`HotplugRegistry::dispatch_unix`],
//! which turn every non-empty handler result into a [`HotplugEvent`] for the
//! runtime.
//!
//! Handlers run on the monitor thread, outside the registry lock.

pub mod monitor;
pub mod uevent;

use crate::device::RunConfig;
use crate::error::Result;
use crate::host::DeviceNode;
use hostdev_protocol::{HotplugAction, HotplugEvent};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A USB device appearing or going away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbEvent {
    /// Add or remove.
    pub action: HotplugAction,
    /// Vendor ID (4 hex digits).
    pub vendor: String,
    /// Product ID (4 hex digits).
    pub product: String,
    /// Serial number, empty when unknown.
    pub serial: String,
    /// Bus number.
    pub busnum: u32,
    /// Device number.
    pub devnum: u32,
    /// Character device major.
    pub major: u32,
    /// Character device minor.
    pub minor: u32,
    /// Device node path relative to `/dev`.
    pub path: String,
    /// Raw uevent, forwarded into containers.
    pub uevent_parts: Vec<String>,
}

/// A device node appearing or going away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnixEvent {
    /// Add or remove.
    pub action: HotplugAction,
    /// Host path of the node.
    pub path: PathBuf,
    /// Node type and numbers, known on add only.
    pub node: Option<DeviceNode>,
}

/// Handler for USB events of one device.
pub type UsbHandler = Arc<dyn Fn(&UsbEvent) -> Result<Option<RunConfig>> + Send + Sync>;

/// Handler for device node events of one device.
pub type UnixHandler = Arc<dyn Fn(&UnixEvent) -> Result<Option<RunConfig>> + Send + Sync>;

/// The device a subscription belongs to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Subscriber {
    /// Project of the instance.
    pub project: String,
    /// Instance name.
    pub instance: String,
    /// Device name.
    pub device: String,
}

impl Subscriber {
    /// Subscriber for one device of an instance.
    pub fn new(project: &str, instance: &str, device: &str) -> Self {
        Self {
            project: project.to_string(),
            instance: instance.to_string(),
            device: device.to_string(),
        }
    }

    fn event(&self, action: HotplugAction, run: RunConfig) -> HotplugEvent {
        HotplugEvent {
            project: self.project.clone(),
            instance: self.instance.clone(),
            device: self.device.clone(),
            action,
            descriptor: run.descriptor,
        }
    }
}

/// Registered hotplug handlers.
#[derive(Default)]
pub struct HotplugRegistry {
    usb: Mutex<BTreeMap<Subscriber, UsbHandler>>,
    unix: Mutex<BTreeMap<Subscriber, (PathBuf, UnixHandler)>>,
}

impl HotplugRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `who` to USB events, replacing an earlier subscription.
    pub fn register_usb(&self, who: Subscriber, handler: UsbHandler) {
        tracing::debug!(instance = %who.instance, device = %who.device, "registered USB handler");
        self.usb.lock().insert(who, handler);
    }

    /// Drop the USB subscription of `who`.
    pub fn unregister_usb(&self, who: &Subscriber) {
        self.usb.lock().remove(who);
    }

    /// Subscribe `who` to events for the node at `path`.
    pub fn register_unix(&self, who: Subscriber, path: &Path, handler: UnixHandler) {
        tracing::debug!(instance = %who.instance, device = %who.device, path = %path.display(), "registered device node handler");
        self.unix.lock().insert(who, (path.to_path_buf(), handler));
    }

    /// Drop the device node subscription of `who`.
    pub fn unregister_unix(&self, who: &Subscriber) {
        self.unix.lock().remove(who);
    }

    /// Paths with at least one device node subscription.
    pub fn watched_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.unix.lock().values().map(|(p, _)| p.clone()).collect();
        paths.sort();
        paths.dedup();
        paths
    }

    /// Number of USB and device node subscriptions.
    pub fn len(&self) -> (usize, usize) {
        (self.usb.lock().len(), self.unix.lock().len())
    }

    /// Run every USB handler on `event`.
    pub fn dispatch_usb(&self, event: &UsbEvent) -> Vec<HotplugEvent> {
        let handlers: Vec<(Subscriber, UsbHandler)> = self
            .usb
            .lock()
            .iter()
            .map(|(who, h)| (who.clone(), h.clone()))
            .collect();

        let mut out = Vec::new();
        for (who, handler) in handlers {
            match handler(event) {
                Ok(Some(run)) if !run.descriptor.is_empty() => out.push(who.event(event.action, run)),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(instance = %who.instance, device = %who.device, error = %e, "USB hotplug handler failed")
                }
            }
        }
        out
    }

    /// Run the handlers subscribed to `event.path`.
    pub fn dispatch_unix(&self, event: &UnixEvent) -> Vec<HotplugEvent> {
        let handlers: Vec<(Subscriber, UnixHandler)> = self
            .unix
            .lock()
            .iter()
            .filter(|(_, (path, _))| *path == event.path)
            .map(|(who, (_, h))| (who.clone(), h.clone()))
            .collect();

        let mut out = Vec::new();
        for (who, handler) in handlers {
            match handler(event) {
                Ok(Some(run)) if !run.descriptor.is_empty() => out.push(who.event(event.action, run)),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(instance = %who.instance, device = %who.device, error = %e, "device node hotplug handler failed")
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::host::NodeKind;

    fn usb_event(vendor: &str) -> UsbEvent {
        UsbEvent {
            action: HotplugAction::Add,
            vendor: vendor.to_string(),
            product: "c52b".to_string(),
            serial: String::new(),
            busnum: 1,
            devnum: 4,
            major: 189,
            minor: 3,
            path: "bus/usb/001/004".to_string(),
            uevent_parts: Vec::new(),
        }
    }

    #[test]
    fn test_usb_dispatch_filters_by_handler() {
        let registry = HotplugRegistry::new();
        registry.register_usb(
            Subscriber::new("default", "c1", "mouse"),
            Arc::new(|e: &UsbEvent| {
                if e.vendor != "046d" {
                    return Ok(None);
                }
                let mut run = RunConfig::new();
                run.cgroup("devices.allow", format!("c {}:{} rwm", e.major, e.minor));
                Ok(Some(run))
            }),
        );
        registry.register_usb(
            Subscriber::new("default", "c2", "broken"),
            Arc::new(|_: &UsbEvent| Err(Error::host("create device node", "boom"))),
        );

        let events = registry.dispatch_usb(&usb_event("046d"));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].instance, "c1");
        assert_eq!(events[0].descriptor.cgroups[0].value, "c 189:3 rwm");

        assert!(registry.dispatch_usb(&usb_event("1050")).is_empty());

        registry.unregister_usb(&Subscriber::new("default", "c1", "mouse"));
        assert!(registry.dispatch_usb(&usb_event("046d")).is_empty());
    }

    #[test]
    fn test_unix_dispatch_by_path() {
        let registry = HotplugRegistry::new();
        let who = Subscriber::new("default", "c1", "serial");
        registry.register_unix(
            who.clone(),
            Path::new("/dev/ttyUSB0"),
            Arc::new(|e: &UnixEvent| {
                let mut run = RunConfig::new();
                if let Some(node) = e.node {
                    run.cgroup("devices.allow", format!("c {}:{} rwm", node.major, node.minor));
                }
                Ok(Some(run))
            }),
        );
        assert_eq!(registry.watched_paths(), vec![PathBuf::from("/dev/ttyUSB0")]);

        let add = UnixEvent {
            action: HotplugAction::Add,
            path: PathBuf::from("/dev/ttyUSB0"),
            node: Some(DeviceNode {
                kind: NodeKind::Char,
                major: 188,
                minor: 0,
            }),
        };
        assert_eq!(registry.dispatch_unix(&add).len(), 1);

        let other = UnixEvent {
            path: PathBuf::from("/dev/ttyUSB1"),
            ..add
        };
        assert!(registry.dispatch_unix(&other).is_empty());

        registry.unregister_unix(&who);
        assert!(registry.watched_paths().is_empty());
    }
}
