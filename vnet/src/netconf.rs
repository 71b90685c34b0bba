//! Fixed addressing of the virtual network.

use ross_bridge::{Ipv4Prefix, Ipv6Prefix, MacAddr};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Guest-facing subnet.
pub const SUBNET4: Ipv4Addr = Ipv4Addr::new(0, 250, 250, 0);
pub const SUBNET4_LEN: u8 = 24;
pub const GATEWAY_IP4: Ipv4Addr = Ipv4Addr::new(0, 250, 250, 1);
pub const GUEST_IP4: Ipv4Addr = Ipv4Addr::new(0, 250, 250, 2);
pub const SERVICES_IP4: Ipv4Addr = Ipv4Addr::new(0, 250, 250, 200);
pub const EXT_HOST_NAT_IP4: Ipv4Addr = Ipv4Addr::new(0, 250, 250, 253);
/// Guest connections to this address reach host loopback.
pub const HOST_NAT_IP4: Ipv4Addr = Ipv4Addr::new(0, 250, 250, 254);

pub const SUBNET6: Ipv6Addr = Ipv6Addr::new(0xfd07, 0xb51a, 0xcc66, 0xf0, 0, 0, 0, 0);
pub const SUBNET6_LEN: u8 = 64;
pub const GATEWAY_IP6: Ipv6Addr = Ipv6Addr::new(0xfd07, 0xb51a, 0xcc66, 0xf0, 0, 0, 0, 1);
pub const GUEST_IP6: Ipv6Addr = Ipv6Addr::new(0xfd07, 0xb51a, 0xcc66, 0xf0, 0, 0, 0, 2);
pub const HOST_NAT_IP6: Ipv6Addr = Ipv6Addr::new(0xfd07, 0xb51a, 0xcc66, 0xf0, 0, 0, 0, 0xfe);

/// Container sub-network reachable through the machine bridge.
pub const SCON_SUBNET4: Ipv4Addr = Ipv4Addr::new(192, 168, 139, 0);
pub const SCON_SUBNET4_LEN: u8 = 24;
pub const SCON_HOST_BRIDGE_IP4: Ipv4Addr = Ipv4Addr::new(192, 168, 139, 3);
pub const SCON_SUBNET6: Ipv6Addr = Ipv6Addr::new(0xfd07, 0xb51a, 0xcc66, 0, 0, 0, 0, 0);
pub const SCON_SUBNET6_LEN: u8 = 64;
pub const SCON_HOST_BRIDGE_IP6: Ipv6Addr = Ipv6Addr::new(0xfd07, 0xb51a, 0xcc66, 0, 0, 0, 0, 3);

/// NAT64 prefix answered by the machine bridge's NDP proxy.
pub const NAT64_PREFIX: Ipv6Addr = Ipv6Addr::new(0xfd07, 0xb51a, 0xcc66, 0, 0xa617, 0xdb5e, 0, 0);
pub const NAT64_PREFIX_LEN: u8 = 96;

pub const GUEST_MAC_VNET: MacAddr = MacAddr([0xda, 0x9b, 0xd0, 0x54, 0xe0, 0x01]);
pub const GUEST_MAC_SCON_BRIDGE: MacAddr = MacAddr([0xda, 0x9b, 0xd0, 0x54, 0xe0, 0x02]);
pub const HOST_MAC_VNET: MacAddr = MacAddr([0xda, 0x9b, 0xd0, 0x54, 0xe1, 0x01]);
pub const HOST_MAC_SCON_BRIDGE: MacAddr = MacAddr([0xda, 0x9b, 0xd0, 0x54, 0xe1, 0x02]);
/// VLAN bridge MACs are this template with the router index in the last octet.
pub const VLAN_ROUTER_MAC_TEMPLATE: MacAddr = MacAddr([0xda, 0x9b, 0xd0, 0x54, 0xe2, 0x00]);

/// Stable identity of the machine bridge.
pub const MACHINE_BRIDGE_UUID: &str = "25ef1ee1-1ead-40fd-a97d-f9284917459b";

pub const BASE_MTU: usize = 1500;
pub const PREFERRED_MTU: usize = 65535;
pub const VIRTIO_NET_HDR_LEN: usize = 10;
pub const ETH_HDR_LEN: usize = 14;

pub const SUBNET4_PREFIX: Ipv4Prefix = Ipv4Prefix::saturating(SUBNET4, SUBNET4_LEN);
pub const SUBNET6_PREFIX: Ipv6Prefix = Ipv6Prefix::saturating(SUBNET6, SUBNET6_LEN);
pub const SCON_SUBNET4_PREFIX: Ipv4Prefix = Ipv4Prefix::saturating(SCON_SUBNET4, SCON_SUBNET4_LEN);
pub const SCON_SUBNET6_PREFIX: Ipv6Prefix = Ipv6Prefix::saturating(SCON_SUBNET6, SCON_SUBNET6_LEN);
pub const NAT64_PREFIX_V6: Ipv6Prefix = Ipv6Prefix::saturating(NAT64_PREFIX, NAT64_PREFIX_LEN);

pub fn is_gateway(ip: IpAddr) -> bool {
    ip == IpAddr::V4(GATEWAY_IP4) || ip == IpAddr::V6(GATEWAY_IP6)
}

pub fn is_guest(ip: IpAddr) -> bool {
    ip == IpAddr::V4(GUEST_IP4) || ip == IpAddr::V6(GUEST_IP6)
}

pub fn gateway_for(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(_) => IpAddr::V4(GATEWAY_IP4),
        IpAddr::V6(_) => IpAddr::V6(GATEWAY_IP6),
    }
}

pub fn guest_for(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(_) => IpAddr::V4(GUEST_IP4),
        IpAddr::V6(_) => IpAddr::V6(GUEST_IP6),
    }
}

/// Translates the host-NAT addresses to host loopback. Anything else is returned as is.
pub fn translate_host_ip(dst: IpAddr) -> IpAddr {
    match dst {
        IpAddr::V4(ip) if ip == HOST_NAT_IP4 => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip == HOST_NAT_IP6 => IpAddr::V6(Ipv6Addr::LOCALHOST),
        other => other,
    }
}

/// Whether traffic from the guest to `dst` should leave through a host socket.
pub fn should_forward(dst: IpAddr) -> bool {
    if dst.is_unspecified() || dst.is_multicast() || is_gateway(dst) {
        return false;
    }
    match dst {
        IpAddr::V4(ip) => !ip.is_broadcast() && ip != Ipv4Addr::new(0, 250, 250, 255),
        IpAddr::V6(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_nat_translation() {
        assert_eq!(translate_host_ip(IpAddr::V4(HOST_NAT_IP4)), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(translate_host_ip(IpAddr::V6(HOST_NAT_IP6)), IpAddr::V6(Ipv6Addr::LOCALHOST));
        let other: IpAddr = "1.1.1.1".parse().unwrap();
        assert_eq!(translate_host_ip(other), other);
    }

    #[test]
    fn test_should_forward() {
        assert!(should_forward("1.1.1.1".parse().unwrap()));
        assert!(should_forward(IpAddr::V4(HOST_NAT_IP4)));
        assert!(!should_forward(IpAddr::V4(GATEWAY_IP4)));
        assert!(!should_forward(IpAddr::V6(GATEWAY_IP6)));
        assert!(!should_forward("255.255.255.255".parse().unwrap()));
        assert!(!should_forward("0.250.250.255".parse().unwrap()));
        assert!(!should_forward("224.0.0.251".parse().unwrap()));
        assert!(!should_forward("ff02::1".parse().unwrap()));
        assert!(!should_forward("0.0.0.0".parse().unwrap()));
    }

    #[test]
    fn test_subnets() {
        assert!(SUBNET4_PREFIX.contains(GUEST_IP4));
        assert!(SUBNET6_PREFIX.contains(HOST_NAT_IP6));
        assert!(SCON_SUBNET4_PREFIX.contains(SCON_HOST_BRIDGE_IP4));
        assert_eq!(NAT64_PREFIX_V6.prefix_bytes().unwrap().len(), 12);
    }
}
