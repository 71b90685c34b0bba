//! Bridge descriptions passed between the control plane, the network core and the
//! native bridging layer.

use crate::prefix::{Ipv4Prefix, Ipv6Prefix, MacAddr};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::os::fd::RawFd;
use uuid::Uuid;

/// One container virtual network as reported by the guest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DockerBridgeConfig {
    #[serde(default)]
    pub ip4_subnet: Option<Ipv4Prefix>,
    #[serde(default)]
    pub ip6_subnet: Option<Ipv6Prefix>,
    #[serde(default)]
    pub guest_interface_name: String,
}

impl DockerBridgeConfig {
    /// The interface name does not distinguish networks, so it is dropped before the
    /// config is used as a key.
    pub fn stripped(&self) -> DockerBridgeConfig {
        DockerBridgeConfig {
            guest_interface_name: String::new(),
            ..self.clone()
        }
    }

    pub fn host_ip4(&self) -> Option<(Ipv4Addr, Ipv4Addr)> {
        self.ip4_subnet.map(|p| (p.last_host(), p.netmask()))
    }

    pub fn host_ip6(&self) -> Option<Ipv6Addr> {
        self.ip6_subnet.map(|p| p.last_host())
    }

    /// Stable identity for the native bridge created for this network.
    pub fn derive_uuid(&self) -> Uuid {
        let stripped = self.stripped();
        let mut hasher = Sha256::new();
        hasher.update(format!("{:?}", stripped).as_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        Uuid::from_bytes(bytes)
    }
}

/// Creation parameters for one native host bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BridgeNetworkConfig {
    pub guest_fd: RawFd,
    pub guest_scon_fd: RawFd,
    pub should_read_guest: bool,

    pub uuid: Uuid,
    pub ip4_address: Option<Ipv4Addr>,
    pub ip4_mask: Option<Ipv4Addr>,
    pub ip6_address: Option<Ipv6Addr>,

    pub host_override_mac: MacAddr,
    pub guest_mac: MacAddr,
    pub ndp_reply_prefix: Option<Ipv6Prefix>,
    pub allow_multicast: bool,

    pub max_link_mtu: u32,
}

impl BridgeNetworkConfig {
    pub fn has_ip4(&self) -> bool {
        self.ip4_address.is_some()
    }

    /// Drops the IPv4 side, leaving a v6-only bridge.
    pub fn without_ip4(mut self) -> Self {
        self.ip4_address = None;
        self.ip4_mask = None;
        self
    }
}

/// Creation parameters for the VLAN router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VlanRouterConfig {
    pub guest_fd: RawFd,
    pub mac_prefix: [u8; 5],
    pub max_vlan_interfaces: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(name: &str) -> DockerBridgeConfig {
        DockerBridgeConfig {
            ip4_subnet: Some("192.168.215.0/24".parse().unwrap()),
            ip6_subnet: Some("fd00:1234::/64".parse().unwrap()),
            guest_interface_name: name.to_string(),
        }
    }

    #[test]
    fn test_uuid_ignores_interface_name() {
        assert_eq!(config("br-1").derive_uuid(), config("br-2").derive_uuid());
        assert_eq!(config("br-1").stripped(), config("br-2").stripped());
    }

    #[test]
    fn test_uuid_differs_per_subnet() {
        let mut other = config("br-1");
        other.ip4_subnet = Some("192.168.216.0/24".parse().unwrap());
        assert_ne!(config("br-1").derive_uuid(), other.derive_uuid());
    }

    #[test]
    fn test_host_addresses() {
        let (ip, mask) = config("x").host_ip4().unwrap();
        assert_eq!(ip, Ipv4Addr::new(192, 168, 215, 254));
        assert_eq!(mask, Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(
            config("x").host_ip6().unwrap(),
            "fd00:1234::ffff:ffff:ffff:fffe".parse::<Ipv6Addr>().unwrap()
        );
    }

    #[test]
    fn test_config_deserializes_from_json() {
        let json = r#"{"ip4_subnet":"172.30.0.0/16","guest_interface_name":"br-x"}"#;
        let c: DockerBridgeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(c.ip4_subnet.unwrap().to_string(), "172.30.0.0/16");
        assert!(c.ip6_subnet.is_none());
        assert_eq!(c.guest_interface_name, "br-x");
    }
}
