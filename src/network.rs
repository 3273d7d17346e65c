//! Address primitives shared by the NIC drivers and host backends.
//!
//! - [`IpNet`]: an address with a prefix length (CIDR)
//! - [`MacAddr`]: an Ethernet hardware address
//! - [`Family`]: IPv4/IPv6 selector used to build per-family config keys

use crate::error::{Error, Result};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use uuid::Uuid;

/// Linux interface name limit, excluding the trailing NUL.
pub const IFNAMSIZ: usize = 15;

/// Address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    /// IPv4.
    V4,
    /// IPv6.
    V6,
}

impl Family {
    /// Both families, IPv4 first.
    pub const ALL: [Family; 2] = [Family::V4, Family::V6];

    /// Config key prefix (`ipv4` / `ipv6`).
    pub fn key_prefix(self) -> &'static str {
        match self {
            Family::V4 => "ipv4",
            Family::V6 => "ipv6",
        }
    }

    /// Build a per-family config key, e.g. `ipv4.address`.
    pub fn key(self, suffix: &str) -> String {
        format!("{}.{}", self.key_prefix(), suffix)
    }

    /// Prefix length of a single host route.
    pub fn host_prefix(self) -> u8 {
        match self {
            Family::V4 => 32,
            Family::V6 => 128,
        }
    }

    /// Family of an address.
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key_prefix())
    }
}

/// An IP address with a prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IpNet {
    addr: IpAddr,
    prefix: u8,
}

impl IpNet {
    /// Create a network, rejecting prefixes longer than the address.
    pub fn new(addr: IpAddr, prefix: u8) -> Result<Self> {
        if prefix > Family::of(&addr).host_prefix() {
            return Err(Error::config(format!(
                "invalid prefix length {} for {}",
                prefix, addr
            )));
        }
        Ok(Self { addr, prefix })
    }

    /// A single-host network (`/32` or `/128`).
    pub fn host(addr: IpAddr) -> Self {
        Self {
            prefix: Family::of(&addr).host_prefix(),
            addr,
        }
    }

    /// The address as given (host bits not masked).
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    /// Prefix length.
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Address family.
    pub fn family(&self) -> Family {
        Family::of(&self.addr)
    }

    /// The network with host bits cleared.
    pub fn network(&self) -> IpNet {
        let addr = match self.addr {
            IpAddr::V4(a) => IpAddr::V4(Ipv4Addr::from(u32::from(a) & mask32(self.prefix))),
            IpAddr::V6(a) => IpAddr::V6(Ipv6Addr::from(u128::from(a) & mask128(self.prefix))),
        };
        IpNet {
            addr,
            prefix: self.prefix,
        }
    }

    /// Whether `ip` falls inside this network.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let m = mask32(self.prefix);
                u32::from(net) & m == u32::from(*ip) & m
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let m = mask128(self.prefix);
                u128::from(net) & m == u128::from(*ip) & m
            }
            _ => false,
        }
    }

    /// Pick a pseudorandom host address inside the network, derived from `seed`.
    ///
    /// The same seed always yields the same address, across builds too: the
    /// offset comes from a name-based (v5) UUID. The network and (for
    /// IPv4) broadcast addresses are never returned, nor is any address in
    /// `exclude`.
    pub fn derive_host(&self, seed: &str, exclude: &[IpAddr]) -> Result<IpAddr> {
        let host_bits = u32::from(self.family().host_prefix() - self.prefix);
        if host_bits < 2 {
            return Err(Error::exhausted(format!(
                "subnet {} has no assignable host addresses",
                self
            )));
        }
        let last = if host_bits >= 128 {
            u128::MAX
        } else {
            (1u128 << host_bits) - 1
        };

        for attempt in 0u32..64 {
            let name = format!("{}/{}", seed, attempt);
            let offset = Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).as_u128() & last;
            if offset == 0 || (self.family() == Family::V4 && offset == last) {
                continue;
            }

            let candidate = match self.network().addr {
                IpAddr::V4(a) => IpAddr::V4(Ipv4Addr::from(u32::from(a) | offset as u32)),
                IpAddr::V6(a) => IpAddr::V6(Ipv6Addr::from(u128::from(a) | offset)),
            };
            if !exclude.contains(&candidate) {
                return Ok(candidate);
            }
        }

        Err(Error::exhausted(format!(
            "failed to find a free address in {}",
            self
        )))
    }
}

fn mask32(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

fn mask128(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(prefix))
    }
}

impl FromStr for IpNet {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| Error::config(format!("{:?} is not a CIDR network", s)))?;
        let addr: IpAddr = addr
            .parse()
            .map_err(|_| Error::config(format!("{:?} is not a valid IP address", addr)))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| Error::config(format!("{:?} is not a valid prefix length", prefix)))?;
        IpNet::new(addr, prefix)
    }
}

impl fmt::Display for IpNet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// An Ethernet hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// Stable address in the `00:16:3e` range derived from a seed.
    ///
    /// The same seed always yields the same address, so devices keep their
    /// MAC across restarts without persisting it.
    pub fn derive(seed: &str) -> Self {
        let h = Uuid::new_v5(&Uuid::NAMESPACE_OID, seed.as_bytes()).into_bytes();
        MacAddr([0x00, 0x16, 0x3e, h[0] & 0x7f, h[1], h[2]])
    }
}

impl FromStr for MacAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split([':', '-']).collect();
        if parts.len() != 6 {
            return Err(Error::config(format!("{:?} is not a MAC address", s)));
        }
        let mut out = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            if part.len() != 2 {
                return Err(Error::config(format!("{:?} is not a MAC address", s)));
            }
            out[i] = u8::from_str_radix(part, 16)
                .map_err(|_| Error::config(format!("{:?} is not a MAC address", s)))?;
        }
        Ok(MacAddr(out))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

/// Name of the interface to use for a parent and optional VLAN tag.
pub fn host_device_name(parent: &str, vlan: &str) -> String {
    if vlan.is_empty() {
        parent.to_string()
    } else {
        format!("{}.{}", parent, vlan)
    }
}

/// Check a Linux interface name.
pub fn validate_interface_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::config("interface name cannot be empty"));
    }
    if name.len() > IFNAMSIZ {
        return Err(Error::config(format!(
            "interface name {:?} is longer than {} characters",
            name, IFNAMSIZ
        )));
    }
    if name == "." || name == ".." {
        return Err(Error::config(format!("interface name {:?} is reserved", name)));
    }
    if name.chars().any(|c| c == '/' || c == ':' || c.is_whitespace()) {
        return Err(Error::config(format!(
            "interface name {:?} contains invalid characters",
            name
        )));
    }
    Ok(())
}

/// Split a comma separated list, trimming entries and dropping empty ones.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipnet_parse_and_display() {
        let net: IpNet = "192.0.2.17/24".parse().unwrap();
        assert_eq!(net.prefix(), 24);
        assert_eq!(net.to_string(), "192.0.2.17/24");
        assert_eq!(net.network().to_string(), "192.0.2.0/24");

        assert!("192.0.2.1".parse::<IpNet>().is_err());
        assert!("192.0.2.1/33".parse::<IpNet>().is_err());
        assert!("2001:db8::/129".parse::<IpNet>().is_err());
    }

    #[test]
    fn test_ipnet_contains() {
        let net: IpNet = "2001:db8::/64".parse().unwrap();
        assert!(net.contains(&"2001:db8::42".parse().unwrap()));
        assert!(!net.contains(&"2001:db9::42".parse().unwrap()));
        assert!(!net.contains(&"192.0.2.1".parse().unwrap()));
    }

    #[test]
    fn test_derived_host_stays_in_subnet_and_skips_excluded() {
        let net: IpNet = "10.10.0.1/30".parse().unwrap();
        let taken: IpAddr = "10.10.0.1".parse().unwrap();
        for i in 0..20 {
            let seed = format!("default/c{}/eth0", i);
            let ip = net.derive_host(&seed, &[taken]).unwrap();
            assert_eq!(ip, net.derive_host(&seed, &[taken]).unwrap());
            assert!(net.contains(&ip));
            assert_ne!(ip, taken);
            assert_ne!(ip.to_string(), "10.10.0.0");
            assert_ne!(ip.to_string(), "10.10.0.3");
        }
    }

    #[test]
    fn test_derived_host_is_pinned() {
        let net: IpNet = "10.8.0.1/24".parse().unwrap();
        let ip = net.derive_host("default/c1/eth0", &[net.addr()]).unwrap();
        assert_eq!(ip.to_string(), "10.8.0.33");
    }

    #[test]
    fn test_derived_host_single_address_subnet() {
        let net: IpNet = "10.0.0.1/32".parse().unwrap();
        assert!(net.derive_host("x", &[]).unwrap_err().is_resource_exhausted());
    }

    #[test]
    fn test_mac_roundtrip_and_derive() {
        let mac: MacAddr = "0A:16:3e:00:00:01".parse().unwrap();
        assert_eq!(mac.to_string(), "0a:16:3e:00:00:01");
        assert!("0a:16:3e:00:01".parse::<MacAddr>().is_err());

        let a = MacAddr::derive("default/c1/eth0");
        assert_eq!(a, MacAddr::derive("default/c1/eth0"));
        assert_ne!(a, MacAddr::derive("default/c1/eth1"));
        assert_eq!(&a.0[..3], &[0x00, 0x16, 0x3e]);
    }

    #[test]
    fn test_host_device_name() {
        assert_eq!(host_device_name("eth0", ""), "eth0");
        assert_eq!(host_device_name("eth0", "10"), "eth0.10");
    }

    #[test]
    fn test_interface_name_rules() {
        assert!(validate_interface_name("eth0").is_ok());
        assert!(validate_interface_name("averyveryverylongname").is_err());
        assert!(validate_interface_name("a/b").is_err());
        assert!(validate_interface_name("..").is_err());
    }

    #[test]
    fn test_split_list() {
        assert_eq!(split_list(" a, b ,,c"), vec!["a", "b", "c"]);
        assert!(split_list("").is_empty());
    }
}
