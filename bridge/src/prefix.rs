//! Address prefixes and MAC addresses used in bridge and route descriptions.

use crate::error::BridgeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// IPv4 prefix. The address is kept as given; containment masks it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Prefix {
    addr: Ipv4Addr,
    len: u8,
}

impl Ipv4Prefix {
    pub fn new(addr: Ipv4Addr, len: u8) -> Result<Self, BridgeError> {
        if len > 32 {
            return Err(BridgeError::InvalidPrefix(format!("{}/{}", addr, len)));
        }
        Ok(Self { addr, len })
    }

    /// Like `new`, clamping the length instead of failing. Usable in constants.
    pub const fn saturating(addr: Ipv4Addr, len: u8) -> Self {
        Self {
            addr,
            len: if len > 32 { 32 } else { len },
        }
    }

    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    pub fn prefix_len(&self) -> u8 {
        self.len
    }

    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::from(mask_bits_u32(self.len))
    }

    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.addr) & mask_bits_u32(self.len))
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let mask = mask_bits_u32(self.len);
        u32::from(ip) & mask == u32::from(self.addr) & mask
    }

    /// Last address below the broadcast address, used as the host side of a bridge.
    pub fn last_host(&self) -> Ipv4Addr {
        let bcast = u32::from(self.network()) | !mask_bits_u32(self.len);
        Ipv4Addr::from(bcast.saturating_sub(1))
    }
}

/// IPv6 prefix. The address is kept as given; containment masks it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv6Prefix {
    addr: Ipv6Addr,
    len: u8,
}

impl Ipv6Prefix {
    pub fn new(addr: Ipv6Addr, len: u8) -> Result<Self, BridgeError> {
        if len > 128 {
            return Err(BridgeError::InvalidPrefix(format!("{}/{}", addr, len)));
        }
        Ok(Self { addr, len })
    }

    pub const fn saturating(addr: Ipv6Addr, len: u8) -> Self {
        Self {
            addr,
            len: if len > 128 { 128 } else { len },
        }
    }

    pub fn addr(&self) -> Ipv6Addr {
        self.addr
    }

    pub fn prefix_len(&self) -> u8 {
        self.len
    }

    pub fn network(&self) -> Ipv6Addr {
        Ipv6Addr::from(u128::from(self.addr) & mask_bits_u128(self.len))
    }

    pub fn contains(&self, ip: Ipv6Addr) -> bool {
        let mask = mask_bits_u128(self.len);
        u128::from(ip) & mask == u128::from(self.addr) & mask
    }

    pub fn last_host(&self) -> Ipv6Addr {
        let last = u128::from(self.network()) | !mask_bits_u128(self.len);
        Ipv6Addr::from(last.saturating_sub(1))
    }

    /// Network bytes covered by the prefix. Only whole-byte prefixes are meaningful here.
    pub fn prefix_bytes(&self) -> Result<Vec<u8>, BridgeError> {
        if self.len % 8 != 0 {
            return Err(BridgeError::InvalidPrefix(self.to_string()));
        }
        Ok(self.network().octets()[..(self.len / 8) as usize].to_vec())
    }
}

/// Prefix of either family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpPrefix {
    V4(Ipv4Prefix),
    V6(Ipv6Prefix),
}

impl IpPrefix {
    pub fn addr(&self) -> IpAddr {
        match self {
            IpPrefix::V4(p) => IpAddr::V4(p.addr()),
            IpPrefix::V6(p) => IpAddr::V6(p.addr()),
        }
    }

    pub fn prefix_len(&self) -> u8 {
        match self {
            IpPrefix::V4(p) => p.prefix_len(),
            IpPrefix::V6(p) => p.prefix_len(),
        }
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self, ip) {
            (IpPrefix::V4(p), IpAddr::V4(ip)) => p.contains(ip),
            (IpPrefix::V6(p), IpAddr::V6(ip)) => p.contains(ip),
            _ => false,
        }
    }
}

impl From<Ipv4Prefix> for IpPrefix {
    fn from(p: Ipv4Prefix) -> Self {
        IpPrefix::V4(p)
    }
}

impl From<Ipv6Prefix> for IpPrefix {
    fn from(p: Ipv6Prefix) -> Self {
        IpPrefix::V6(p)
    }
}

fn mask_bits_u32(len: u8) -> u32 {
    if len == 0 { 0 } else { u32::MAX << (32 - len as u32) }
}

fn mask_bits_u128(len: u8) -> u128 {
    if len == 0 { 0 } else { u128::MAX << (128 - len as u32) }
}

fn split_prefix(s: &str) -> Result<(&str, u8), BridgeError> {
    let (addr, len) = s
        .split_once('/')
        .ok_or_else(|| BridgeError::InvalidPrefix(s.to_string()))?;
    let len = len
        .parse::<u8>()
        .map_err(|_| BridgeError::InvalidPrefix(s.to_string()))?;
    Ok((addr, len))
}

impl FromStr for Ipv4Prefix {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, len) = split_prefix(s)?;
        let addr = addr
            .parse::<Ipv4Addr>()
            .map_err(|_| BridgeError::InvalidPrefix(s.to_string()))?;
        Self::new(addr, len)
    }
}

impl FromStr for Ipv6Prefix {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, len) = split_prefix(s)?;
        let addr = addr
            .parse::<Ipv6Addr>()
            .map_err(|_| BridgeError::InvalidPrefix(s.to_string()))?;
        Self::new(addr, len)
    }
}

impl fmt::Display for Ipv4Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.len)
    }
}

impl fmt::Display for Ipv6Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.len)
    }
}

impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpPrefix::V4(p) => fmt::Display::fmt(p, f),
            IpPrefix::V6(p) => fmt::Display::fmt(p, f),
        }
    }
}

/// Ethernet address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Replaces the last octet, used to derive per-index addresses from a template.
    pub fn with_index(&self, index: u8) -> MacAddr {
        let mut m = self.0;
        m[5] = index;
        MacAddr(m)
    }

    pub fn prefix(&self) -> [u8; 5] {
        [self.0[0], self.0[1], self.0[2], self.0[3], self.0[4]]
    }
}

impl FromStr for MacAddr {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 6];
        let mut parts = s.split(':');
        for b in out.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| BridgeError::InvalidMac(s.to_string()))?;
            *b = u8::from_str_radix(part, 16).map_err(|_| BridgeError::InvalidMac(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(BridgeError::InvalidMac(s.to_string()));
        }
        Ok(MacAddr(out))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

macro_rules! serde_via_str {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

serde_via_str!(Ipv4Prefix);
serde_via_str!(Ipv6Prefix);
serde_via_str!(MacAddr);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_prefix_contains() {
        let p: Ipv4Prefix = "192.168.215.0/24".parse().unwrap();
        assert!(p.contains(Ipv4Addr::new(192, 168, 215, 7)));
        assert!(!p.contains(Ipv4Addr::new(192, 168, 216, 7)));
        assert_eq!(p.netmask(), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(p.last_host(), Ipv4Addr::new(192, 168, 215, 254));
    }

    #[test]
    fn test_zero_length_prefix_contains_everything() {
        let p: Ipv4Prefix = "0.0.0.0/0".parse().unwrap();
        assert!(p.contains(Ipv4Addr::new(8, 8, 8, 8)));
        let p6: Ipv6Prefix = "::/0".parse().unwrap();
        assert!(p6.contains("fd00::1".parse().unwrap()));
    }

    #[test]
    fn test_ipv6_prefix_bytes() {
        let p: Ipv6Prefix = "fd07:b51a:cc66:0:a617:db5e::/96".parse().unwrap();
        assert_eq!(p.prefix_bytes().unwrap().len(), 12);
        let odd: Ipv6Prefix = "fd00::/63".parse().unwrap();
        assert!(odd.prefix_bytes().is_err());
    }

    #[test]
    fn test_invalid_prefixes() {
        assert!("10.0.0.0".parse::<Ipv4Prefix>().is_err());
        assert!("10.0.0.0/33".parse::<Ipv4Prefix>().is_err());
        assert!("fd00::/129".parse::<Ipv6Prefix>().is_err());
    }

    #[test]
    fn test_mac_parse_and_index() {
        let m: MacAddr = "da:9b:d0:54:e2:00".parse().unwrap();
        assert_eq!(m.with_index(3).to_string(), "da:9b:d0:54:e2:03");
        assert_eq!(m.prefix(), [0xda, 0x9b, 0xd0, 0x54, 0xe2]);
        assert!("da:9b:d0:54:e2".parse::<MacAddr>().is_err());
        assert!("da:9b:d0:54:e2:00:01".parse::<MacAddr>().is_err());
    }
}
