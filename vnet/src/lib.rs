mod config;
mod error;
mod forward;
mod host_bridge;
mod icmp;
mod link;
mod nat;
pub mod netconf;
mod network;
mod proxy;
mod relay;
mod stack;
mod tcp;
mod udp;
pub mod wire;

pub use config::{ConfigDiff, NetConfig};
pub use error::NetError;
pub use forward::{BoxedStream, Endpoint, ForwardSpec, GuestStream, HostForward, VsockDialer};
pub use link::LinkParams;
pub use nat::{FlowKey, Proto};
pub use network::{NetOptions, Network};
pub use proxy::{ProxyScheme, UpstreamProxy};
pub use stack::StackState;

pub use ross_bridge::{DockerBridgeConfig, Ipv4Prefix, Ipv6Prefix, NativeBridge, RouteSource};
