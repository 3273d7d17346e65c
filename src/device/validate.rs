//! Field validators for device configuration.
//!
//! A validator is a function from the raw string value to `Ok(())` or a
//! reason. Combinators ([`optional`], [`required`], [`list_of`]) wrap them.
//! The caller attaches the field name when reporting.

use crate::network::{validate_interface_name, IpNet, MacAddr};
use std::net::IpAddr;

/// Outcome of checking one value.
pub type CheckResult = std::result::Result<(), String>;

/// A boxed validator.
pub type Check = Box<dyn Fn(&str) -> CheckResult + Send + Sync>;

/// Accept empty values, otherwise run `f`.
pub fn optional<F>(f: F) -> Check
where
    F: Fn(&str) -> CheckResult + Send + Sync + 'static,
{
    Box::new(move |v| if v.is_empty() { Ok(()) } else { f(v) })
}

/// Reject empty values, otherwise run `f`.
pub fn required<F>(f: F) -> Check
where
    F: Fn(&str) -> CheckResult + Send + Sync + 'static,
{
    Box::new(move |v| {
        if v.is_empty() {
            Err("required value".to_string())
        } else {
            f(v)
        }
    })
}

/// Run `f` on every entry of a comma separated list.
pub fn list_of<F>(f: F) -> impl Fn(&str) -> CheckResult + Send + Sync + 'static
where
    F: Fn(&str) -> CheckResult + Send + Sync + 'static,
{
    move |v| {
        for item in v.split(',') {
            f(item.trim())?;
        }
        Ok(())
    }
}

/// Accept one of a fixed set of values.
pub fn one_of(choices: &'static [&'static str]) -> impl Fn(&str) -> CheckResult + Send + Sync {
    move |v| {
        if choices.contains(&v) {
            Ok(())
        } else {
            Err(format!("must be one of {:?}", choices))
        }
    }
}

/// Accept an integer within `min..=max`.
pub fn uint32_range(min: u32, max: u32) -> impl Fn(&str) -> CheckResult + Send + Sync {
    move |v| {
        let n = parse_u32(v)?;
        if n < min || n > max {
            return Err(format!("value must be between {} and {}", min, max));
        }
        Ok(())
    }
}

/// Anything goes.
pub fn is_any(_: &str) -> CheckResult {
    Ok(())
}

/// `true`/`false` and the usual aliases.
pub fn is_bool(v: &str) -> CheckResult {
    match v.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" | "false" | "0" | "no" | "off" => Ok(()),
        _ => Err(format!("invalid boolean {:?}", v)),
    }
}

fn parse_u32(v: &str) -> std::result::Result<u32, String> {
    v.parse::<u32>()
        .map_err(|_| format!("invalid unsigned 32-bit integer {:?}", v))
}

/// Unsigned 32-bit integer.
pub fn is_uint32(v: &str) -> CheckResult {
    parse_u32(v).map(|_| ())
}

/// Linux interface name.
pub fn is_interface_name(v: &str) -> CheckResult {
    validate_interface_name(v).map_err(|e| e.to_string())
}

/// MAC address.
pub fn is_network_mac(v: &str) -> CheckResult {
    v.parse::<MacAddr>().map(|_| ()).map_err(|e| e.to_string())
}

/// VLAN tag.
pub fn is_network_vlan(v: &str) -> CheckResult {
    uint32_range(0, 4094)(v).map_err(|_| format!("invalid VLAN ID {:?}", v))
}

/// MTU accepted by the kernel for a link that may carry IPv6.
pub fn is_network_mtu(v: &str) -> CheckResult {
    uint32_range(1280, 16384)(v).map_err(|_| format!("invalid MTU {:?} (1280-16384)", v))
}

/// Single IPv4 address without prefix.
pub fn is_ipv4_address(v: &str) -> CheckResult {
    match v.parse::<IpAddr>() {
        Ok(IpAddr::V4(_)) => Ok(()),
        _ => Err(format!("not an IPv4 address {:?}", v)),
    }
}

/// Single IPv6 address without prefix.
pub fn is_ipv6_address(v: &str) -> CheckResult {
    match v.parse::<IpAddr>() {
        Ok(IpAddr::V6(_)) => Ok(()),
        _ => Err(format!("not an IPv6 address {:?}", v)),
    }
}

/// IPv4 network in CIDR notation.
pub fn is_ipv4_cidr(v: &str) -> CheckResult {
    match v.parse::<IpNet>() {
        Ok(net) if matches!(net.addr(), IpAddr::V4(_)) => Ok(()),
        _ => Err(format!("not an IPv4 CIDR network {:?}", v)),
    }
}

/// IPv6 network in CIDR notation.
pub fn is_ipv6_cidr(v: &str) -> CheckResult {
    match v.parse::<IpNet>() {
        Ok(net) if matches!(net.addr(), IpAddr::V6(_)) => Ok(()),
        _ => Err(format!("not an IPv6 CIDR network {:?}", v)),
    }
}

/// IPv4 address with optional prefix.
pub fn is_ipv4_address_or_cidr(v: &str) -> CheckResult {
    if v.contains('/') {
        is_ipv4_cidr(v)
    } else {
        is_ipv4_address(v)
    }
}

/// IPv6 address with optional prefix.
pub fn is_ipv6_address_or_cidr(v: &str) -> CheckResult {
    if v.contains('/') {
        is_ipv6_cidr(v)
    } else {
        is_ipv6_address(v)
    }
}

/// PCI address (`0000:01:00.0` or `01:00.0`).
pub fn is_pci_address(v: &str) -> CheckResult {
    normalize_pci_address(v).map(|_| ())
}

/// Normalise a PCI address to the `dddd:bb:ss.f` form, lower case.
pub fn normalize_pci_address(v: &str) -> std::result::Result<String, String> {
    let bad = || format!("invalid PCI address {:?}", v);
    let lower = v.to_ascii_lowercase();
    let parts: Vec<&str> = lower.split(':').collect();
    let (domain, bus, slotfn) = match parts.as_slice() {
        [bus, slotfn] => ("0000", *bus, *slotfn),
        [domain, bus, slotfn] => (*domain, *bus, *slotfn),
        _ => return Err(bad()),
    };
    let (slot, func) = slotfn.split_once('.').ok_or_else(bad)?;

    let hex = |s: &str, width: usize| {
        s.len() <= width && !s.is_empty() && s.chars().all(|c| c.is_ascii_hexdigit())
    };
    if !hex(domain, 4) || !hex(bus, 2) || !hex(slot, 2) || !(func.len() == 1 && hex(func, 1)) {
        return Err(bad());
    }
    if u8::from_str_radix(slot, 16).map_err(|_| bad())? > 0x1f
        || u8::from_str_radix(func, 16).map_err(|_| bad())? > 7
    {
        return Err(bad());
    }

    Ok(format!("{:0>4}:{:0>2}:{:0>2}.{}", domain, bus, slot, func))
}

/// USB or PCI vendor/product ID: four hex digits.
pub fn is_device_id(v: &str) -> CheckResult {
    if v.len() == 4 && v.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(())
    } else {
        Err(format!("invalid device ID {:?} (expected 4 hex digits)", v))
    }
}

/// Octal file mode (`0660`).
pub fn is_octal_mode(v: &str) -> CheckResult {
    u32::from_str_radix(v, 8)
        .ok()
        .filter(|m| *m <= 0o7777)
        .map(|_| ())
        .ok_or_else(|| format!("invalid file mode {:?}", v))
}

/// Absolute path.
pub fn is_abs_path(v: &str) -> CheckResult {
    if v.starts_with('/') {
        Ok(())
    } else {
        Err(format!("path {:?} must be absolute", v))
    }
}

/// Network bit rate (`100Mbit`, `1Gbit`, `500kbit`).
pub fn is_bit_rate(v: &str) -> CheckResult {
    parse_bit_rate(v).map(|_| ())
}

/// Parse a bit rate into bits per second.
pub fn parse_bit_rate(v: &str) -> std::result::Result<u64, String> {
    let bad = || format!("invalid bit rate {:?}", v);
    let idx = v.find(|c: char| !c.is_ascii_digit()).unwrap_or(v.len());
    let (num, unit) = v.split_at(idx);
    let num: u64 = num.parse().map_err(|_| bad())?;

    let mult: u64 = match unit.trim() {
        "" | "bit" => 1,
        "kbit" => 1_000,
        "Mbit" => 1_000_000,
        "Gbit" => 1_000_000_000,
        "Tbit" => 1_000_000_000_000,
        "Kibit" => 1 << 10,
        "Mibit" => 1 << 20,
        "Gibit" => 1 << 30,
        _ => return Err(bad()),
    };
    num.checked_mul(mult).ok_or_else(bad)
}

/// Parse a config boolean, treating anything unknown as false.
pub fn is_true(v: &str) -> bool {
    matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

/// Parse a config boolean where empty means true.
pub fn is_true_or_empty(v: &str) -> bool {
    v.is_empty() || is_true(v)
}

/// Parse a config boolean where empty means false.
pub fn is_false_or_empty(v: &str) -> bool {
    v.is_empty() || matches!(v.to_ascii_lowercase().as_str(), "false" | "0" | "no" | "off")
}
