//! Kernel uevent parsing.
//!
//! A netlink uevent datagram is a `action@devpath` header followed by
//! NUL-separated `KEY=value` pairs.

use super::UsbEvent;
use hostdev_protocol::HotplugAction;
use std::collections::BTreeMap;

/// One parsed uevent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uevent {
    /// `ACTION` value.
    pub action: String,
    /// All `KEY=value` properties.
    pub props: BTreeMap<String, String>,
    /// The `KEY=value` parts as received.
    pub parts: Vec<String>,
}

impl Uevent {
    /// Parse a raw datagram. Returns `None` for anything that is not a
    /// kernel uevent, such as udev's own re-broadcasts.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        let mut fields = buf
            .split(|b| *b == 0)
            .filter(|f| !f.is_empty())
            .map(|f| String::from_utf8_lossy(f).into_owned());

        let header = fields.next()?;
        if !header.contains('@') {
            return None;
        }

        let mut props = BTreeMap::new();
        let mut parts = Vec::new();
        for field in fields {
            if let Some((k, v)) = field.split_once('=') {
                props.insert(k.to_string(), v.to_string());
                parts.push(field.clone());
            }
        }
        let action = props.get("ACTION")?.clone();
        Some(Self {
            action,
            props,
            parts,
        })
    }

    /// Property value, `""` when absent.
    pub fn prop(&self, key: &str) -> &str {
        self.props.get(key).map(String::as_str).unwrap_or("")
    }

    /// Kernel device path, used to find the device in sysfs.
    pub fn devpath(&self) -> &str {
        self.prop("DEVPATH")
    }

    /// Convert a USB device add/remove into a [`UsbEvent`].
    ///
    /// Interfaces and other USB sub-objects are ignored. The serial number
    /// is not part of the uevent and is left empty.
    pub fn usb_event(&self) -> Option<UsbEvent> {
        if self.prop("SUBSYSTEM") != "usb" || self.prop("DEVTYPE") != "usb_device" {
            return None;
        }
        let action = match self.action.as_str() {
            "add" => HotplugAction::Add,
            "remove" => HotplugAction::Remove,
            _ => return None,
        };

        // PRODUCT is vendor/product/bcdDevice in unpadded hex.
        let mut product = self.prop("PRODUCT").split('/');
        let vendor = format!("{:0>4}", product.next()?);
        let product = format!("{:0>4}", product.next()?);

        let num = |key: &str| self.prop(key).parse::<u32>().ok();
        Some(UsbEvent {
            action,
            vendor,
            product,
            serial: String::new(),
            busnum: num("BUSNUM")?,
            devnum: num("DEVNUM")?,
            major: num("MAJOR")?,
            minor: num("MINOR")?,
            path: self.prop("DEVNAME").to_string(),
            uevent_parts: self.parts.clone(),
        })
    }
}
