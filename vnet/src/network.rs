//! The VM network: one userspace stack wired to the guest link, plus the forwards and
//! host bridges around it. This is the only type callers need.

use crate::config::{ConfigDiff, NetConfig};
use crate::error::NetError;
use crate::forward::{ForwardSpec, ForwardTable, GuestDialers, HostForward, VsockDialer};
use crate::host_bridge::HostBridges;
use crate::icmp::IcmpForwarder;
use crate::link::{Link, LinkParams, unixgram_pair};
use crate::nat::{NatTable, Proto};
use crate::netconf::{GATEWAY_IP4, GUEST_IP4};
use crate::proxy::UpstreamProxy;
use crate::stack::{Stack, StackContext, StackHandle, StackState};
use crate::udp::UdpForwarder;
use ross_bridge::{DockerBridgeConfig, NativeBridge, RouteMon, RouteSource, platform_route_source};
use std::net::{IpAddr, SocketAddr};
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const DIAL_RETRY_INTERVAL: Duration = Duration::from_millis(250);
const DIAL_RETRY_TOTAL: Duration = Duration::from_secs(15);

/// Everything needed to bring up a [`Network`].
#[derive(Clone)]
pub struct NetOptions {
    pub link_mtu: usize,
    pub config: NetConfig,
    /// Host bridges are unavailable without one.
    pub native_bridge: Option<Arc<dyn NativeBridge>>,
    /// Defaults to the platform route source.
    pub route_source: Option<Arc<dyn RouteSource>>,
    pub vsock_dialer: Option<Arc<dyn VsockDialer>>,
}

impl NetOptions {
    pub fn new(link_mtu: usize) -> Self {
        Self {
            link_mtu,
            config: NetConfig::default(),
            native_bridge: None,
            route_source: None,
            vsock_dialer: None,
        }
    }

    pub fn config(mut self, config: NetConfig) -> Self {
        self.config = config;
        self
    }

    pub fn native_bridge(mut self, native: Arc<dyn NativeBridge>) -> Self {
        self.native_bridge = Some(native);
        self
    }

    pub fn route_source(mut self, source: Arc<dyn RouteSource>) -> Self {
        self.route_source = Some(source);
        self
    }

    pub fn vsock_dialer(mut self, dialer: Arc<dyn VsockDialer>) -> Self {
        self.vsock_dialer = Some(dialer);
        self
    }
}

pub struct Network {
    link_mtu: usize,
    nat: Arc<NatTable>,
    udp: Arc<UdpForwarder>,
    icmp: Arc<IcmpForwarder>,
    stack: StackHandle,
    stack_task: Mutex<Option<JoinHandle<StackState>>>,
    dialers: GuestDialers,
    forwards: ForwardTable,
    bridges: Option<Arc<HostBridges>>,
    config: Mutex<NetConfig>,
    proxy_tx: watch::Sender<Option<Arc<UpstreamProxy>>>,
    stop_tx: Mutex<Option<watch::Sender<()>>>,
    stop_rx: watch::Receiver<()>,
    closed: AtomicBool,
}

impl Network {
    /// Creates the guest link and starts the stack on it. Returns the guest end of the
    /// link for the VM's network device. Must run inside a tokio runtime.
    pub fn start_unixgram_pair(opts: NetOptions) -> Result<(Self, OwnedFd), NetError> {
        tokio::runtime::Handle::try_current().map_err(|e| NetError::Setup(format!("no tokio runtime: {e}")))?;
        let proxy = UpstreamProxy::from_config(&opts.config)?;
        if let Some(p) = &proxy {
            tracing::info!(proxy = %p, "Guest TCP goes through upstream proxy");
        }
        let (proxy_tx, proxy_rx) = watch::channel(proxy.map(Arc::new));

        let (host_fd, guest_fd) = unixgram_pair()?;
        let params = LinkParams::new(opts.link_mtu);
        tracing::debug!(link_mtu = params.link_mtu, mtu = params.mtu, vnet_hdr = params.vnet_hdr, "creating guest link");
        let link = Link::new(host_fd, params).map_err(|e| NetError::Setup(format!("guest link: {e}")))?;
        let writer = link.writer();

        let (stop_tx, stop_rx) = watch::channel(());
        let nat = Arc::new(NatTable::new());
        let icmp = IcmpForwarder::start(writer.clone(), nat.clone(), opts.config.icmp_enabled);
        let udp = UdpForwarder::new(
            nat.clone(),
            writer,
            icmp.clone(),
            opts.config.udp_idle_timeout(),
            stop_rx.clone(),
        );

        let ctx = StackContext {
            nat: nat.clone(),
            udp: udp.clone(),
            icmp: icmp.clone(),
            connect_timeout: opts.config.tcp_connect_timeout(),
            proxy: proxy_rx,
            stop: stop_rx.clone(),
        };
        let (stack, handle) = match Stack::new(link, ctx) {
            Ok(s) => s,
            Err(e) => {
                icmp.close();
                return Err(e);
            }
        };
        let stack_task = stack.spawn();

        let bridges = opts.native_bridge.map(|native| {
            let source = opts.route_source.unwrap_or_else(platform_route_source);
            Arc::new(HostBridges::new(
                native,
                Arc::new(RouteMon::new(source)),
                opts.link_mtu as u32,
                opts.config.network_bridge,
            ))
        });

        let dialers = GuestDialers {
            stack: Some(handle.clone()),
            vsock: opts.vsock_dialer,
        };

        let network = Self {
            link_mtu: opts.link_mtu,
            nat,
            udp,
            icmp,
            stack: handle,
            stack_task: Mutex::new(Some(stack_task)),
            dialers,
            forwards: ForwardTable::new(),
            bridges,
            config: Mutex::new(opts.config),
            proxy_tx,
            stop_tx: Mutex::new(Some(stop_tx)),
            stop_rx,
            closed: AtomicBool::new(false),
        };
        Ok((network, guest_fd))
    }

    /// Proxy new guest TCP connections currently go through.
    pub fn upstream_proxy(&self) -> Option<Arc<UpstreamProxy>> {
        self.proxy_tx.borrow().clone()
    }

    pub fn link_mtu(&self) -> usize {
        self.link_mtu
    }

    /// Running, or why the stack stopped.
    pub fn subscribe_state(&self) -> watch::Receiver<StackState> {
        self.stack.state()
    }

    /// Number of live TCP flows, guest-originated and host-dialed.
    pub fn flow_count(&self) -> usize {
        self.nat.count(Proto::Tcp)
    }

    pub fn udp_flow_count(&self) -> usize {
        self.udp.flow_count()
    }

    /// Connects to a TCP port on the guest's IPv4 address, appearing to come from the
    /// gateway.
    pub async fn dial_guest_tcp(&self, port: u16) -> Result<DuplexStream, NetError> {
        if self.is_closed() {
            return Err(NetError::Closed);
        }
        self.stack
            .dial_guest(SocketAddr::new(IpAddr::V4(GUEST_IP4), port), IpAddr::V4(GATEWAY_IP4))
            .await
    }

    /// Like [`dial_guest_tcp`](Self::dial_guest_tcp), retrying while the guest is not
    /// listening yet.
    pub async fn dial_guest_tcp_retry(&self, port: u16, cancel: CancellationToken) -> Result<DuplexStream, NetError> {
        let deadline = Instant::now() + DIAL_RETRY_TOTAL;
        loop {
            let res = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(NetError::Cancelled),
                r = tokio::time::timeout_at(deadline, self.dial_guest_tcp(port)) => r,
            };
            let err = match res {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(NetError::Closed)) => return Err(NetError::Closed),
                Ok(Err(e)) => e,
                Err(_) => return Err(NetError::Timeout),
            };
            if Instant::now() + DIAL_RETRY_INTERVAL >= deadline {
                return Err(err);
            }
            tracing::debug!(port, error = %err, "guest dial failed, retrying");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(NetError::Cancelled),
                _ = tokio::time::sleep(DIAL_RETRY_INTERVAL) => {}
            }
        }
    }

    pub fn start_forward(&self, spec: ForwardSpec) -> Result<Arc<HostForward>, NetError> {
        if self.is_closed() {
            return Err(NetError::Closed);
        }
        let fwd = self.forwards.start(spec, self.dialers.clone(), self.stop_rx.clone())?;
        tracing::info!(host = %fwd.spec().host, guest = %fwd.spec().guest, port = ?fwd.tcp_port(), "Forward started");
        Ok(fwd)
    }

    pub fn stop_forward(&self, spec: &ForwardSpec) -> Result<(), NetError> {
        self.forwards.stop(spec)?;
        tracing::info!(host = %spec.host, "Forward stopped");
        Ok(())
    }

    pub fn forward_count(&self) -> usize {
        self.forwards.len()
    }

    fn bridges(&self) -> Result<&Arc<HostBridges>, NetError> {
        self.bridges.as_ref().ok_or(NetError::BridgesDisabled)
    }

    /// Adds the guest-side fd of the next bridge slot: the machine bridge first, then the
    /// VLAN router.
    pub fn add_host_bridge_fd(&self, fd: OwnedFd) -> Result<(), NetError> {
        self.bridges()?.add_fd(fd)
    }

    pub fn add_vlan_bridge(&self, config: &DockerBridgeConfig) -> Result<usize, NetError> {
        self.bridges()?.add_vlan_bridge(config)
    }

    pub fn remove_vlan_bridge(&self, config: &DockerBridgeConfig) -> Result<usize, NetError> {
        self.bridges()?.remove_vlan_bridge(config)
    }

    pub fn clear_vlan_bridges(&self, include_machine: bool) -> Result<(), NetError> {
        self.bridges()?.clear_vlan_bridges(include_machine)
    }

    pub fn create_machine_host_bridge(&self) -> Result<(), NetError> {
        self.bridges()?.create_machine_bridge()
    }

    /// Watches the routing table and renews bridges whose routes were taken over.
    /// Runs until the Network closes.
    pub async fn monitor_host_bridge_routes(&self) -> Result<(), NetError> {
        let route_mon = self.bridges()?.route_mon().clone();
        route_mon.monitor().await?;
        Ok(())
    }

    /// Follows the config feed and turns host bridges on or off with the
    /// `network_bridge` setting. Runs until the feed ends or the Network closes.
    pub async fn monitor_host_bridge_setting(&self, mut feed: watch::Receiver<NetConfig>) -> Result<(), NetError> {
        let bridges = self.bridges.clone();
        let mut stop = self.stop_rx.clone();
        loop {
            tokio::select! {
                _ = stop.changed() => return Ok(()),
                changed = feed.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
            let new = feed.borrow_and_update().clone();
            let diff = {
                let mut current = self.config.lock().map_err(|_| NetError::Closed)?;
                let old = std::mem::replace(&mut *current, new.clone());
                ConfigDiff { old, new }
            };
            if diff.proxy_changed() {
                self.apply_proxy(&diff.new);
            }
            let Some(enabled) = diff.bridge_toggled() else {
                continue;
            };
            let Some(bridges) = bridges.clone() else {
                tracing::debug!(enabled, "no host bridges to toggle");
                continue;
            };

            tracing::info!(enabled, "Host bridge setting changed");
            let res = tokio::task::spawn_blocking(move || bridges.set_enabled(enabled))
                .await
                .map_err(|e| NetError::Setup(format!("bridge toggle task: {e}")))?;
            if let Err(e) = res {
                tracing::warn!(enabled, error = %e, "failed to apply host bridge setting");
            }
        }
    }

    /// Swaps the proxy for new connections. Established flows keep their path. An invalid
    /// value keeps the previous proxy.
    fn apply_proxy(&self, config: &NetConfig) {
        match UpstreamProxy::from_config(config) {
            Ok(proxy) => {
                match &proxy {
                    Some(p) => tracing::info!(proxy = %p, "Upstream proxy changed"),
                    None => tracing::info!("Upstream proxy disabled"),
                }
                self.proxy_tx.send_replace(proxy.map(Arc::new));
            }
            Err(e) => tracing::warn!(error = %e, "ignoring invalid upstream proxy setting"),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Shuts everything down: forwards, bridges, the ICMP proxy, then the stack and every
    /// flow. Safe to call more than once and while traffic is flowing.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(flows = self.flow_count(), forwards = self.forwards.len(), "Closing network");
        self.forwards.close_all();
        if let Some(bridges) = &self.bridges {
            bridges.stop();
        }
        self.icmp.close();
        // Dropping the sender is the stop signal.
        if let Ok(mut tx) = self.stop_tx.lock() {
            tx.take();
        }
    }

    /// Closes and waits for the stack task to finish.
    pub async fn shutdown(&self) -> StackState {
        self.close();
        let task = self.stack_task.lock().ok().and_then(|mut t| t.take());
        match task {
            Some(task) => task.await.unwrap_or(StackState::Stopped),
            None => *self.stack.state().borrow(),
        }
    }
}

impl Drop for Network {
    fn drop(&mut self) {
        self.close();
    }
}
