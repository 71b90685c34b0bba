//! Host routing table snapshots and the validity rules used to detect bridge conflicts.

use crate::error::BridgeError;
use crate::prefix::{IpPrefix, Ipv4Prefix, Ipv6Prefix};
use bitflags::bitflags;
use std::net::IpAddr;
use tokio::sync::mpsc;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RouteFlags: u32 {
        /// Next hop is a gateway rather than a directly attached link.
        const GATEWAY = 1 << 0;
        /// Host route (/32 or /128).
        const HOST = 1 << 1;
        /// Configured by an administrator or VPN rather than derived from an address.
        const STATIC = 1 << 2;
        /// Default or otherwise global route that never conflicts with a bridge.
        const GLOBAL = 1 << 3;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub destination: IpPrefix,
    pub gateway: Option<IpAddr>,
    pub interface: String,
    pub flags: RouteFlags,
}

impl RouteEntry {
    pub fn new(destination: IpPrefix, interface: impl Into<String>, flags: RouteFlags) -> Self {
        Self {
            destination,
            gateway: None,
            interface: interface.into(),
            flags,
        }
    }

    pub fn with_gateway(mut self, gateway: IpAddr) -> Self {
        self.gateway = Some(gateway);
        self.flags |= RouteFlags::GATEWAY;
        self
    }

    /// Whether this route would steal traffic for `target`.
    ///
    /// Global and host routes are ignored. A covering route counts when it goes through a
    /// gateway or when it is attached to a link without being statically configured.
    pub fn claims(&self, target: IpAddr) -> bool {
        if self.flags.intersects(RouteFlags::GLOBAL | RouteFlags::HOST) {
            return false;
        }
        if !self.destination.contains(target) {
            return false;
        }
        self.flags.contains(RouteFlags::GATEWAY) || !self.flags.contains(RouteFlags::STATIC)
    }
}

/// Point-in-time copy of the host routing table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteTable {
    pub entries: Vec<RouteEntry>,
}

impl RouteTable {
    pub fn new(entries: Vec<RouteEntry>) -> Self {
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has_valid_route(&self, target: IpPrefix) -> bool {
        let addr = target.addr();
        self.entries.iter().any(|e| e.claims(addr))
    }

    /// Conflict per family for a bridge's subnets. Missing families never conflict.
    pub fn conflicts(&self, ip4: Option<Ipv4Prefix>, ip6: Option<Ipv6Prefix>) -> (bool, bool) {
        let v4 = ip4.is_some_and(|p| self.has_valid_route(p.into()));
        let v6 = ip6.is_some_and(|p| self.has_valid_route(p.into()));
        (v4, v6)
    }

    pub fn has_any_valid_routes(&self, ip4: Option<Ipv4Prefix>, ip6: Option<Ipv6Prefix>) -> bool {
        let (v4, v6) = self.conflicts(ip4, ip6);
        v4 || v6
    }
}

/// Notification that the host routing table may have changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteChange;

/// Where routing tables come from. The platform implementation reads the kernel; tests
/// substitute a fake.
pub trait RouteSource: Send + Sync {
    fn routing_table(&self) -> Result<RouteTable, BridgeError>;

    /// Stream of change notifications. Each call returns a fresh receiver.
    fn subscribe(&self) -> Result<mpsc::Receiver<RouteChange>, BridgeError>;
}

/// Source for platforms without a readable routing table. Never reports conflicts.
#[cfg(not(target_os = "linux"))]
pub struct EmptyRouteSource;

#[cfg(not(target_os = "linux"))]
impl RouteSource for EmptyRouteSource {
    fn routing_table(&self) -> Result<RouteTable, BridgeError> {
        Ok(RouteTable::default())
    }

    fn subscribe(&self) -> Result<mpsc::Receiver<RouteChange>, BridgeError> {
        Err(BridgeError::RouteTable("route change events not supported".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(s: &str) -> IpPrefix {
        s.parse::<Ipv4Prefix>().unwrap().into()
    }

    #[test]
    fn test_connected_route_conflicts() {
        let table = RouteTable::new(vec![RouteEntry::new(v4("192.168.215.0/24"), "en0", RouteFlags::empty())]);
        assert!(table.has_valid_route(v4("192.168.215.0/24")));
        assert!(!table.has_valid_route(v4("192.168.216.0/24")));
    }

    #[test]
    fn test_static_link_route_is_ignored() {
        let table = RouteTable::new(vec![RouteEntry::new(v4("192.168.215.0/24"), "bridge100", RouteFlags::STATIC)]);
        assert!(!table.has_valid_route(v4("192.168.215.0/24")));
    }

    #[test]
    fn test_static_gateway_route_conflicts() {
        let table = RouteTable::new(vec![
            RouteEntry::new(v4("192.168.0.0/16"), "utun3", RouteFlags::STATIC)
                .with_gateway("10.8.0.1".parse().unwrap()),
        ]);
        assert!(table.has_valid_route(v4("192.168.215.0/24")));
    }

    #[test]
    fn test_default_and_host_routes_are_ignored() {
        let table = RouteTable::new(vec![
            RouteEntry::new(v4("0.0.0.0/0"), "en0", RouteFlags::GLOBAL).with_gateway("10.0.0.1".parse().unwrap()),
            RouteEntry::new(v4("192.168.215.1/32"), "en0", RouteFlags::HOST),
        ]);
        assert!(!table.has_valid_route(v4("192.168.215.0/24")));
    }

    #[test]
    fn test_conflicts_per_family() {
        let table = RouteTable::new(vec![RouteEntry::new(v4("192.168.215.0/24"), "en0", RouteFlags::empty())]);
        let p4: Ipv4Prefix = "192.168.215.0/24".parse().unwrap();
        let p6: Ipv6Prefix = "fd00:1::/64".parse().unwrap();
        assert_eq!(table.conflicts(Some(p4), Some(p6)), (true, false));
        assert!(table.has_any_valid_routes(Some(p4), None));
        assert!(!table.has_any_valid_routes(None, Some(p6)));
    }
}
