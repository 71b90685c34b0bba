mod config;
mod error;
mod monitor;
mod native;
mod prefix;
#[cfg(target_os = "linux")]
mod proc_route;
mod route;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use config::{BridgeNetworkConfig, DockerBridgeConfig, VlanRouterConfig};
pub use error::BridgeError;
pub use monitor::{INDEX_SCON_MACHINE, MAX_VLAN_INTERFACES, RenewFn, RouteMon, SubnetState};
pub use native::{BridgeHandle, HostBridge, NativeBridge, RouterHandle, VlanRouter};
pub use prefix::{IpPrefix, Ipv4Prefix, Ipv6Prefix, MacAddr};
#[cfg(target_os = "linux")]
pub use proc_route::ProcRouteSource;
pub use route::{RouteChange, RouteEntry, RouteFlags, RouteSource, RouteTable};

use std::sync::Arc;

/// Route source for the current platform.
pub fn platform_route_source() -> Arc<dyn RouteSource> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(ProcRouteSource::new())
    }
    #[cfg(not(target_os = "linux"))]
    {
        Arc::new(route::EmptyRouteSource)
    }
}
