//! The handoff from a driver lifecycle call to the instance runtime.

use crate::error::{Error, Result};
use hostdev_protocol::{MountEntry, RunConfigItem, RunDescriptor, UsbDevice};

/// Cleanup to run once the runtime has detached the device.
pub type PostHook = Box<dyn FnOnce() -> Result<()> + Send>;

/// What a driver asks the runtime to attach or detach, plus post hooks.
///
/// Only ever appended to.
#[derive(Default)]
pub struct RunConfig {
    /// Serializable part handed to the runtime.
    pub descriptor: RunDescriptor,
    /// Callbacks the runtime must run after detaching.
    pub post_hooks: Vec<PostHook>,
}

impl RunConfig {
    /// Empty run config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a network interface item.
    pub fn network(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        self.descriptor
            .network_interface
            .push(RunConfigItem::new(key, value));
        self
    }

    /// Append a PCI device item.
    pub fn pci(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        self.descriptor.pci_device.push(RunConfigItem::new(key, value));
        self
    }

    /// Append a GPU device item.
    pub fn gpu(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        self.descriptor.gpu_device.push(RunConfigItem::new(key, value));
        self
    }

    /// Append a cgroup rule.
    pub fn cgroup(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        self.descriptor.cgroups.push(RunConfigItem::new(key, value));
        self
    }

    /// Append a USB device.
    pub fn usb(&mut self, device: UsbDevice) -> &mut Self {
        self.descriptor.usb_device.push(device);
        self
    }

    /// Append a mount entry.
    pub fn mount(&mut self, entry: MountEntry) -> &mut Self {
        self.descriptor.mounts.push(entry);
        self
    }

    /// Append a uevent to forward into the instance.
    pub fn uevent(&mut self, event: Vec<String>) -> &mut Self {
        self.descriptor.uevents.push(event);
        self
    }

    /// Append a post hook.
    pub fn post_hook<F>(&mut self, hook: F) -> &mut Self
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.post_hooks.push(Box::new(hook));
        self
    }

    /// Append all of `other`.
    pub fn extend(&mut self, other: RunConfig) {
        self.descriptor.extend(other.descriptor);
        self.post_hooks.extend(other.post_hooks);
    }

    /// Whether neither descriptors nor hooks are present.
    pub fn is_empty(&self) -> bool {
        self.descriptor.is_empty() && self.post_hooks.is_empty()
    }

    /// Run every post hook in order, collecting failures.
    ///
    /// A failing hook does not prevent later hooks from running.
    pub fn run_post_hooks(hooks: Vec<PostHook>) -> Result<()> {
        let mut errs = Vec::new();
        for hook in hooks {
            if let Err(e) = hook() {
                tracing::warn!(error = %e, "post hook failed");
                errs.push(e);
            }
        }
        Error::from_cleanup(errs)
    }
}

impl std::fmt::Debug for RunConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunConfig")
            .field("descriptor", &self.descriptor)
            .field("post_hooks", &self.post_hooks.len())
            .finish()
    }
}
