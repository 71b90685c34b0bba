//! The userspace stack and its dispatch task.
//!
//! One task owns the smoltcp interface, the socket set, the guest link and the TCP
//! forwarder. Guest frames are classified first: UDP and ICMP echo go straight to their
//! forwarders, TCP SYNs are held by the TCP forwarder, and whatever is left (ARP, NDP,
//! established TCP) is handed to smoltcp.

use crate::error::NetError;
use crate::icmp::{self, IcmpForwarder};
use crate::link::{Link, is_link_down};
use crate::nat::NatTable;
use crate::netconf::{
    GATEWAY_IP4, GATEWAY_IP6, GUEST_IP4, GUEST_IP6, GUEST_MAC_VNET, HOST_MAC_VNET, SUBNET4_LEN, SUBNET6_LEN,
    SUBNET6_PREFIX, is_gateway, is_guest, should_forward,
};
use crate::proxy::ProxyFeed;
use crate::tcp::{TcpForwarder, Verdict};
use crate::udp::UdpForwarder;
use crate::wire::{self, ETHERTYPE_ARP, IP_PROTO_UDP, NDP_FLAG_OVERRIDE, NDP_FLAG_SOLICITED};
use smoltcp::iface::{Config, Interface, SocketSet};
use smoltcp::time::Instant as SmolInstant;
use smoltcp::wire::{EthernetAddress, HardwareAddress, IpAddress, IpCidr};
use std::io;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::io::unix::AsyncFdReadyGuard;
use tokio::sync::{Notify, mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};

/// Upper bound on how long dispatch sleeps without a wakeup.
const MAX_POLL_DELAY: Duration = Duration::from_secs(1);
/// smoltcp forgets neighbors after 60 s; refresh well before that.
const NEIGHBOR_REFRESH: Duration = Duration::from_secs(30);
const COMMAND_QUEUE: usize = 64;
const ARP_REPLY: u16 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackState {
    Running,
    /// The guest end of the link went away.
    LinkDown,
    Stopped,
}

pub(crate) enum Command {
    DialGuest {
        guest: SocketAddr,
        src: IpAddr,
        reply: oneshot::Sender<Result<DuplexStream, NetError>>,
    },
}

/// Caller side of a running stack.
#[derive(Clone)]
pub struct StackHandle {
    cmd_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<StackState>,
}

impl StackHandle {
    /// Connects to `guest` from `src`, resolving once the guest accepts.
    pub async fn dial_guest(&self, guest: SocketAddr, src: IpAddr) -> Result<DuplexStream, NetError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::DialGuest { guest, src, reply })
            .await
            .map_err(|_| NetError::Closed)?;
        rx.await.map_err(|_| NetError::Closed)?
    }

    pub fn state(&self) -> watch::Receiver<StackState> {
        self.state_rx.clone()
    }
}

/// Collaborators the dispatch task drives.
pub struct StackContext {
    pub nat: Arc<NatTable>,
    pub udp: Arc<UdpForwarder>,
    pub icmp: Arc<IcmpForwarder>,
    pub connect_timeout: Duration,
    pub proxy: ProxyFeed,
    pub stop: watch::Receiver<()>,
}

pub struct Stack {
    iface: Interface,
    sockets: SocketSet<'static>,
    link: Link,
    tcp: TcpForwarder,
    udp: Arc<UdpForwarder>,
    icmp: Arc<IcmpForwarder>,
    notify: Arc<Notify>,
    cmd_rx: mpsc::Receiver<Command>,
    state_tx: watch::Sender<StackState>,
    stop: watch::Receiver<()>,
    clock: Instant,
}

enum Wake<'a> {
    Stop,
    Readable(AsyncFdReadyGuard<'a, std::os::fd::OwnedFd>),
    Writable(AsyncFdReadyGuard<'a, std::os::fd::OwnedFd>),
    Command(Option<Command>),
    Connected(Option<crate::tcp::ConnectResult>),
    Refresh,
    Poll,
}

impl Stack {
    /// Builds the interface on top of `link`. Any failing step fails the whole stack.
    pub fn new(mut link: Link, ctx: StackContext) -> Result<(Self, StackHandle), NetError> {
        let clock = Instant::now();
        let mut config = Config::new(HardwareAddress::Ethernet(EthernetAddress(HOST_MAC_VNET.0)));
        config.random_seed = uuid::Uuid::new_v4().as_u64_pair().0;
        let mut iface = Interface::new(config, &mut link, SmolInstant::from_micros(0));

        let mut addr_result = Ok(());
        iface.update_ip_addrs(|addrs| {
            for cidr in [
                IpCidr::new(IpAddress::Ipv4(GATEWAY_IP4), SUBNET4_LEN),
                IpCidr::new(IpAddress::Ipv6(GATEWAY_IP6), SUBNET6_LEN),
            ] {
                if addrs.push(cidr).is_err() {
                    addr_result = Err(NetError::Setup(format!("add address {cidr}")));
                }
            }
        });
        addr_result?;

        // Default routes through our own gateway addresses make any_ip accept every
        // destination.
        iface
            .routes_mut()
            .add_default_ipv4_route(GATEWAY_IP4)
            .map_err(|e| NetError::Setup(format!("ipv4 route: {e:?}")))?;
        iface
            .routes_mut()
            .add_default_ipv6_route(GATEWAY_IP6)
            .map_err(|e| NetError::Setup(format!("ipv6 route: {e:?}")))?;
        iface.set_any_ip(true);

        let notify = Arc::new(Notify::new());
        let mtu = link.params().mtu;
        let tcp = TcpForwarder::new(ctx.nat, notify.clone(), ctx.stop.clone(), ctx.connect_timeout, ctx.proxy, mtu);
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        let (state_tx, state_rx) = watch::channel(StackState::Running);

        let mut stack = Self {
            iface,
            sockets: SocketSet::new(Vec::new()),
            link,
            tcp,
            udp: ctx.udp,
            icmp: ctx.icmp,
            notify,
            cmd_rx,
            state_tx,
            stop: ctx.stop,
            clock,
        };
        stack.inject_static_neighbors();
        let now = stack.now();
        stack.iface.poll(now, &mut stack.link, &mut stack.sockets);

        Ok((stack, StackHandle { cmd_tx, state_rx }))
    }

    fn now(&self) -> SmolInstant {
        SmolInstant::from_micros(self.clock.elapsed().as_micros() as i64)
    }

    /// Teaches smoltcp the guest's addresses as if the guest had announced them.
    fn inject_static_neighbors(&mut self) {
        self.link.inject(wire::build_arp(
            ARP_REPLY,
            &HOST_MAC_VNET.0,
            &GUEST_MAC_VNET.0,
            GUEST_IP4,
            &HOST_MAC_VNET.0,
            GATEWAY_IP4,
        ));
        self.link.inject(wire::build_neighbor_advert(
            &HOST_MAC_VNET.0,
            &GUEST_MAC_VNET.0,
            GUEST_IP6,
            GATEWAY_IP6,
            GUEST_IP6,
            NDP_FLAG_OVERRIDE,
        ));
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<StackState> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) -> StackState {
        tracing::info!(mtu = self.link.params().mtu, vnet_hdr = self.link.params().vnet_hdr, "Network stack started");
        let fd = self.link.fd().clone();
        let notify = self.notify.clone();
        let mut refresh = tokio::time::interval(NEIGHBOR_REFRESH);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
        refresh.tick().await;

        let state = loop {
            let now = self.now();
            self.iface.poll(now, &mut self.link, &mut self.sockets);
            self.tcp.service(&mut self.sockets);
            self.iface.poll_egress(now, &mut self.link, &mut self.sockets);
            if let Err(e) = self.link.flush_outbox() {
                if is_link_down(&e) {
                    break StackState::LinkDown;
                }
                if e.kind() != io::ErrorKind::WouldBlock {
                    tracing::debug!(error = %e, "flush to guest failed");
                }
            }

            let delay = self
                .iface
                .poll_delay(now, &self.sockets)
                .map(Duration::from)
                .unwrap_or(MAX_POLL_DELAY)
                .min(MAX_POLL_DELAY);
            let has_outbox = self.link.outbox_len() > 0;

            let wake = tokio::select! {
                biased;
                _ = self.stop.changed() => Wake::Stop,
                guard = fd.readable() => match guard {
                    Ok(g) => Wake::Readable(g),
                    Err(e) => {
                        tracing::warn!(error = %e, "link poll failed");
                        Wake::Stop
                    }
                },
                guard = fd.writable(), if has_outbox => match guard {
                    Ok(g) => Wake::Writable(g),
                    Err(_) => Wake::Poll,
                },
                cmd = self.cmd_rx.recv() => Wake::Command(cmd),
                res = self.tcp.next_connect_result() => Wake::Connected(res),
                _ = notify.notified() => Wake::Poll,
                _ = refresh.tick() => Wake::Refresh,
                _ = tokio::time::sleep(delay) => Wake::Poll,
            };

            match wake {
                Wake::Stop | Wake::Command(None) => break StackState::Stopped,
                Wake::Readable(mut guard) => match guard.try_io(|_| self.link.recv_batch()) {
                    Ok(Ok(n)) => self.classify_batch(n),
                    Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof || is_link_down(&e) => {
                        break StackState::LinkDown;
                    }
                    Ok(Err(e)) => tracing::debug!(error = %e, "receive from guest failed"),
                    Err(_would_block) => {}
                },
                Wake::Writable(mut guard) => {
                    if let Ok(Err(e)) = guard.try_io(|_| self.link.flush_outbox()) {
                        if is_link_down(&e) {
                            break StackState::LinkDown;
                        }
                    }
                }
                Wake::Command(Some(Command::DialGuest { guest, src, reply })) => {
                    self.tcp.dial(guest, src, reply, &mut self.iface, &mut self.sockets);
                }
                Wake::Connected(Some(res)) => {
                    let now = self.now();
                    self.tcp
                        .on_connect_result(res, now, &mut self.iface, &mut self.sockets, &mut self.link);
                }
                Wake::Connected(None) => {}
                Wake::Refresh => self.inject_static_neighbors(),
                Wake::Poll => {}
            }
        };

        self.tcp.abort_all(&mut self.sockets);
        let now = self.now();
        self.iface.poll_egress(now, &mut self.link, &mut self.sockets);
        let _ = self.link.flush_outbox();

        match state {
            StackState::LinkDown => tracing::info!("Guest link down, network stack stopped"),
            _ => tracing::info!("Network stack stopped"),
        }
        self.state_tx.send_replace(state);
        state
    }

    fn classify_batch(&mut self, n: usize) {
        let mut replies = Vec::new();
        for i in 0..n {
            let Some(frame) = self.link.rx_frame_mut(i) else {
                continue;
            };
            let verdict = classify(frame, &self.udp, &self.icmp, &mut self.tcp, &mut self.sockets, &mut replies);
            self.link.set_pass(i, verdict == Verdict::Pass);
        }
        for reply in replies {
            self.link.queue_frame(&reply);
        }
    }
}

/// Decides where one guest frame goes.
fn classify(
    frame: &mut [u8],
    udp: &Arc<UdpForwarder>,
    icmp_fwd: &IcmpForwarder,
    tcp: &mut TcpForwarder,
    sockets: &mut SocketSet<'static>,
    replies: &mut Vec<Vec<u8>>,
) -> Verdict {
    // Promiscuous: any unicast destination MAC is ours.
    if frame[0] & 1 == 0 && frame[0..6] != HOST_MAC_VNET.0 {
        frame[0..6].copy_from_slice(&HOST_MAC_VNET.0);
    }
    if wire::ethertype(frame) == Some(ETHERTYPE_ARP) {
        return Verdict::Pass;
    }
    let Some(pkt) = wire::parse_ip(frame) else {
        return Verdict::Pass;
    };

    if pkt.proto == IP_PROTO_UDP && should_forward(pkt.dst) {
        udp.handle(frame);
        return Verdict::Consumed;
    }
    if icmp::is_echo_request(&pkt) && should_forward(pkt.dst) {
        icmp_fwd.handle_echo(&pkt);
        return Verdict::Consumed;
    }
    if let Some(target) = wire::neighbor_solicit_target(&pkt) {
        if let Some(reply) = proxy_neighbor_advert(frame, pkt.src, target) {
            replies.push(reply);
            return Verdict::Consumed;
        }
        return Verdict::Pass;
    }
    if wire::is_tcp_syn(&pkt) && should_forward(pkt.dst) {
        return tcp.on_syn(frame, sockets);
    }
    Verdict::Pass
}

/// Answers a solicitation for an address in the guest subnet that smoltcp does not own,
/// such as the host-NAT address.
fn proxy_neighbor_advert(frame: &[u8], src: IpAddr, target: Ipv6Addr) -> Option<Vec<u8>> {
    let IpAddr::V6(src) = src else {
        return None;
    };
    let target_ip = IpAddr::V6(target);
    if src.is_unspecified() || !SUBNET6_PREFIX.contains(target) || is_guest(target_ip) || is_gateway(target_ip) {
        return None;
    }
    let mut eth_src = [0u8; 6];
    eth_src.copy_from_slice(&frame[6..12]);
    tracing::trace!(target = %target, "answering neighbor solicitation");
    Some(wire::build_neighbor_advert(
        &eth_src,
        &HOST_MAC_VNET.0,
        target,
        src,
        target,
        NDP_FLAG_SOLICITED | NDP_FLAG_OVERRIDE,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netconf::HOST_NAT_IP6;
    use std::net::Ipv4Addr;

    #[test]
    fn test_proxy_na_only_for_foreign_subnet_addresses() {
        let frame = wire::build_eth_header(&HOST_MAC_VNET.0, &GUEST_MAC_VNET.0, wire::ETHERTYPE_IPV6);
        let src = IpAddr::V6(GUEST_IP6);

        let na = proxy_neighbor_advert(&frame, src, HOST_NAT_IP6).unwrap();
        assert_eq!(&na[0..6], &GUEST_MAC_VNET.0);
        let pkt = wire::parse_ip(&na).unwrap();
        assert_eq!(pkt.src, IpAddr::V6(HOST_NAT_IP6));
        assert_eq!(pkt.dst, src);
        assert_eq!(pkt.l4()[4], NDP_FLAG_SOLICITED | NDP_FLAG_OVERRIDE);

        assert!(proxy_neighbor_advert(&frame, src, GATEWAY_IP6).is_none());
        assert!(proxy_neighbor_advert(&frame, src, GUEST_IP6).is_none());
        assert!(proxy_neighbor_advert(&frame, src, "2001:db8::1".parse().unwrap()).is_none());
        assert!(proxy_neighbor_advert(&frame, IpAddr::V6(Ipv6Addr::UNSPECIFIED), HOST_NAT_IP6).is_none());
        assert!(proxy_neighbor_advert(&frame, IpAddr::V4(Ipv4Addr::LOCALHOST), HOST_NAT_IP6).is_none());
    }
}
