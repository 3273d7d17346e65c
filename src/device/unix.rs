//! Unix char and block devices for containers.

use super::devnode::{owner_rules, NodeSetup};
use super::validate::{self, optional};
use super::{require_kind, Device, DeviceCommon, DeviceConfig, Rules, RunConfig};
use crate::error::{Error, Result};
use crate::host::{DeviceNode, NodeKind};
use crate::hotplug::{Subscriber, UnixEvent};
use hostdev_protocol::HotplugAction;
use std::path::Path;
use std::sync::Arc;

/// Unix char/block driver.
#[derive(Clone)]
pub struct UnixDevice {
    common: DeviceCommon,
}

/// Host path of the node to mirror.
fn source_path(config: &DeviceConfig) -> &str {
    match config.get("source") {
        "" => config.get("path"),
        source => source,
    }
}

/// Path of the node inside the container.
fn dest_path(config: &DeviceConfig) -> &str {
    match config.get("path") {
        "" => config.get("source"),
        path => path,
    }
}

fn node_kind(config: &DeviceConfig) -> NodeKind {
    if config.kind() == "unix-block" {
        NodeKind::Block
    } else {
        NodeKind::Char
    }
}

fn wrong_kind(config: &DeviceConfig) -> Error {
    Error::environment(format!("Path specified is not a {} device", config.kind()))
}

/// The node to create, with `major`/`minor` overriding what the host has.
fn configured_node(config: &DeviceConfig, found: Option<DeviceNode>) -> Result<DeviceNode> {
    let num = |key: &str, fallback: Option<u32>| -> Result<u32> {
        match config.get(key) {
            "" => fallback.ok_or_else(|| Error::validation(key, "required value")),
            v => v
                .parse()
                .map_err(|_| Error::validation(key, format!("invalid value {:?}", v))),
        }
    };
    Ok(DeviceNode {
        kind: node_kind(config),
        major: num("major", found.map(|n| n.major))?,
        minor: num("minor", found.map(|n| n.minor))?,
    })
}

impl UnixDevice {
    pub(crate) fn new(common: DeviceCommon) -> Self {
        Self { common }
    }

    fn is_required(&self) -> bool {
        validate::is_true_or_empty(self.common.config.get("required"))
    }

    fn subscriber(&self) -> Subscriber {
        let inst = &self.common.inst;
        Subscriber::new(&inst.project, &inst.name, &self.common.name)
    }

    /// Watch the source path so the node follows the host device.
    fn register(&self) -> Result<()> {
        if self.is_required() {
            return Ok(());
        }
        let config = self.common.config.clone();
        let nodes = NodeSetup::new(&self.common)?;
        let device = self.common.name.clone();
        let source = source_path(&config).to_string();

        self.common.ctx.hotplug.register_unix(
            self.subscriber(),
            Path::new(&source),
            Arc::new(move |event: &UnixEvent| {
                let dest = dest_path(&config);
                let mut run = RunConfig::new();
                match event.action {
                    HotplugAction::Add => {
                        if nodes.exists(dest)? {
                            return Ok(None);
                        }
                        let Some(found) = event.node else {
                            return Ok(None);
                        };
                        if found.kind != node_kind(&config) {
                            return Err(wrong_kind(&config));
                        }
                        nodes.add(&configured_node(&config, Some(found))?, dest, &mut run)?;
                    }
                    HotplugAction::Remove => {
                        if !nodes.exists(dest)? {
                            return Ok(None);
                        }
                        nodes.detach(dest, &mut run)?;
                        nodes.delete(dest)?;
                    }
                }
                tracing::info!(%device, action = ?event.action, path = %event.path.display(), "device node hotplug");
                Ok(Some(run))
            }),
        );
        Ok(())
    }
}

impl Device for UnixDevice {
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
            .insert("source", optional(validate::is_abs_path))
            .insert("path", optional(validate::is_abs_path))
            .insert("major", optional(validate::is_uint32))
            .insert("minor", optional(validate::is_uint32))
            .insert("required", optional(validate::is_bool));
        owner_rules(&mut rules);
        let config = &self.common.config;
        config.validate(&rules)?;

        if !config.has("source") && !config.has("path") {
            return Err(Error::config(
                "Unix device entry is missing the required \"source\" or \"path\" property",
            ));
        }
        Ok(())
    }

    fn can_hot_plug(&self) -> bool {
        true
    }

    fn start(&mut self) -> Result<RunConfig> {
        let config = &self.common.config;
        let source = source_path(config);
        let dest = dest_path(config);
        let found = self.common.host().device_node(Path::new(source))?;

        let mut run = RunConfig::new();
        let numbers_given = config.has("major") && config.has("minor");
        if let Some(node) = found {
            if node.kind != node_kind(config) {
                return Err(wrong_kind(config));
            }
            let nodes = NodeSetup::new(&self.common)?;
            nodes.add(&configured_node(config, Some(node))?, dest, &mut run)?;
        } else if numbers_given {
            let nodes = NodeSetup::new(&self.common)?;
            nodes.add(&configured_node(config, None)?, dest, &mut run)?;
        } else if self.is_required() {
            return Err(Error::environment(
                "The required device path doesn't exist and the major and minor settings are not specified",
            ));
        } else {
            tracing::debug!(device = %self.common.name, %source, "device node absent, waiting for it");
        }

        let this = self.clone();
        run.post_hook(move || this.register());
        Ok(run)
    }

    fn stop(&mut self) -> Result<RunConfig> {
        self.common.ctx.hotplug.unregister_unix(&self.subscriber());

        let nodes = NodeSetup::new(&self.common)?;
        let mut run = RunConfig::new();
        nodes.detach_all(&mut run)?;
        run.post_hook(move || nodes.delete_all());
        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testing::*;
    use crate::host::fake::FakeHost;
    use hostdev_protocol::keys;
    use std::path::PathBuf;

    fn tty(major: u32, minor: u32) -> DeviceNode {
        DeviceNode {
            kind: NodeKind::Char,
            major,
            minor,
        }
    }

    #[test]
    fn test_existing_node_mirrored() {
        let fx = Fixture::new(FakeHost::new().with_node("/dev/ttyS0", tty(4, 64)));
        let c1 = container("c1");
        let mut dev = fx
            .load(&c1, "serial", &[("type", "unix-char"), ("source", "/dev/ttyS0"), ("path", "/dev/serial0")])
            .unwrap();

        let run = dev.start().unwrap();
        assert_eq!(run.descriptor.mounts[0].target_path, "dev/serial0");
        assert_eq!(run.descriptor.cgroups[0].value, "c 4:64 rwm");
        RunConfig::run_post_hooks(run.post_hooks).unwrap();
        // Required devices are not watched.
        assert_eq!(fx.ctx.hotplug.len(), (0, 0));

        stop_and_cleanup(&mut dev).unwrap();
        let nodes = fx.host.state().nodes.clone();
        assert_eq!(nodes.keys().collect::<Vec<_>>(), vec![&PathBuf::from("/dev/ttyS0")]);
        assert!(fx.volatile(&c1, "serial").is_empty());
        stop_and_cleanup(&mut dev).unwrap();
        assert!(fx.volatile(&c1, "serial").is_empty());
    }

    #[test]
    fn test_wrong_kind_rejected() {
        let fx = Fixture::new(FakeHost::new().with_node("/dev/ttyS0", tty(4, 64)));
        let mut dev = fx
            .load(&container("c1"), "disk", &[("type", "unix-block"), ("path", "/dev/ttyS0")])
            .unwrap();
        assert!(dev.start().unwrap_err().to_string().contains("not a unix-block device"));
    }

    #[test]
    fn test_numbers_without_host_node() {
        let fx = Fixture::new(FakeHost::new());
        let mut dev = fx
            .load(&container("c1"), "fuse", &[("type", "unix-char"), ("path", "/dev/fuse"), ("major", "10"), ("minor", "229")])
            .unwrap();
        let run = dev.start().unwrap();
        assert_eq!(run.descriptor.cgroups[0].value, "c 10:229 rwm");

        let mut dev = fx
            .load(&container("c1"), "fuse", &[("type", "unix-char"), ("path", "/dev/fuse")])
            .unwrap();
        assert!(dev.start().unwrap_err().to_string().contains("required device path doesn't exist"));
    }

    #[test]
    fn test_optional_node_follows_hotplug() {
        let fx = Fixture::new(FakeHost::new());
        let c1 = container("c1");
        let mut dev = fx
            .load(&c1, "usbserial", &[("type", "unix-char"), ("path", "/dev/ttyUSB0"), ("required", "false")])
            .unwrap();
        let run = dev.start().unwrap();
        assert!(run.descriptor.is_empty());
        RunConfig::run_post_hooks(run.post_hooks).unwrap();
        assert_eq!(fx.ctx.hotplug.watched_paths(), vec![PathBuf::from("/dev/ttyUSB0")]);

        let add = UnixEvent {
            action: HotplugAction::Add,
            path: PathBuf::from("/dev/ttyUSB0"),
            node: Some(tty(188, 0)),
        };
        let events = fx.ctx.hotplug.dispatch_unix(&add);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].descriptor.cgroups[0].value, "c 188:0 rwm");
        // A repeated add is a no-op.
        assert!(fx.ctx.hotplug.dispatch_unix(&add).is_empty());

        let remove = UnixEvent {
            action: HotplugAction::Remove,
            path: PathBuf::from("/dev/ttyUSB0"),
            node: None,
        };
        let events = fx.ctx.hotplug.dispatch_unix(&remove);
        assert_eq!(events[0].descriptor.cgroups[0].key, keys::DEVICES_DENY);
        assert!(fx.host.state().nodes.is_empty());

        stop_and_cleanup(&mut dev).unwrap();
        assert!(fx.ctx.hotplug.watched_paths().is_empty());
        assert!(fx.volatile(&c1, "usbserial").is_empty());
        stop_and_cleanup(&mut dev).unwrap();
        assert!(fx.volatile(&c1, "usbserial").is_empty());
    }

    #[test]
    fn test_config_rules() {
        let fx = Fixture::new(FakeHost::new());
        let err = fx.load(&container("c1"), "x", &[("type", "unix-char")]).err().unwrap();
        assert!(err.to_string().contains("\"source\" or \"path\""));

        let err = fx
            .load(&vm("v1"), "x", &[("type", "unix-char"), ("path", "/dev/ttyS0")])
            .err()
            .unwrap();
        assert!(err.is_unsupported_dev_type());

        assert!(fx
            .load(&container("c1"), "x", &[("type", "unix-char"), ("path", "/dev/ttyS0"), ("mode", "999")])
            .is_err());
    }
}
