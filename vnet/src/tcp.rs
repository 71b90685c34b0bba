//! TCP forwarding.
//!
//! A guest SYN to a forwardable destination is held while a host connection is made in
//! the background. Once it succeeds, a smoltcp socket listening on exactly that
//! destination is created and the SYN is replayed into it, so the guest's handshake
//! completes against the userspace stack. Bytes are then relayed between the socket and
//! the host stream by [`crate::relay::pump`].
//!
//! Host-originated connections into the guest go the other way: the socket connects
//! out from a NAT port and the caller gets a byte stream once the guest accepts.

use crate::error::NetError;
use crate::icmp::unreachable_frame;
use crate::link::Link;
use crate::nat::{FlowKey, NatEntry, NatTable, Proto};
use crate::netconf::translate_host_ip;
use crate::proxy::{ProxyFeed, UpstreamProxy};
use crate::relay::{self, FlowChannels, HostEvent, TCP_READ_BUFFER_SIZE};
use crate::wire::{self, Unreachable};
use smoltcp::iface::{Interface, PollIngressSingleResult, SocketHandle, SocketSet};
use smoltcp::socket::tcp::{self, CongestionControl, State};
use smoltcp::wire::IpEndpoint;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{Notify, mpsc, oneshot, watch};
use tokio::time::Instant;

/// Socket buffers on both sides of the host connection.
const HOST_SOCKET_BUFFER: u32 = 4 * 1024 * 1024;
const MIN_STACK_BUFFER: usize = 256 * 1024;
const MAX_STACK_BUFFER: usize = 4 * 1024 * 1024;
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_RESULT_QUEUE: usize = 256;

/// Receive and send buffer size of each stack socket, scaled with the link MTU.
pub fn stack_buffer_size(mtu: usize) -> usize {
    (mtu * 64).clamp(MIN_STACK_BUFFER, MAX_STACK_BUFFER)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowPhase {
    SynSeen,
    Connecting,
    Established,
    Closing,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailure {
    Refused,
    HostUnreachable,
    NetUnreachable,
    Timeout,
}

impl ConnectFailure {
    pub fn from_io(e: &io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::HostUnreachable => return ConnectFailure::HostUnreachable,
            io::ErrorKind::NetworkUnreachable => return ConnectFailure::NetUnreachable,
            io::ErrorKind::TimedOut => return ConnectFailure::Timeout,
            _ => {}
        }
        match e.raw_os_error() {
            Some(libc::EHOSTUNREACH) | Some(libc::EHOSTDOWN) => ConnectFailure::HostUnreachable,
            Some(libc::ENETUNREACH) => ConnectFailure::NetUnreachable,
            _ => ConnectFailure::Refused,
        }
    }
}

pub struct ConnectResult {
    key: FlowKey,
    result: Result<TcpStream, ConnectFailure>,
}

/// Guest-side verdict for a frame the forwarder looked at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Hand the frame to smoltcp.
    Pass,
    Consumed,
}

type DialReply = oneshot::Sender<Result<DuplexStream, NetError>>;

struct TcpFlow {
    phase: FlowPhase,
    /// Held guest SYN while the host connection is pending.
    syn: Option<Vec<u8>>,
    socket: Option<SocketHandle>,
    chans: Option<FlowChannels>,
    /// Host data not yet accepted by the socket, with the offset already sent.
    pending: Option<(Vec<u8>, usize)>,
    host_eof: bool,
    dial: Option<(DialReply, Instant)>,
}

impl TcpFlow {
    fn inbound(syn: Vec<u8>) -> Self {
        Self {
            phase: FlowPhase::SynSeen,
            syn: Some(syn),
            socket: None,
            chans: None,
            pending: None,
            host_eof: false,
            dial: None,
        }
    }
}

pub struct TcpForwarder {
    flows: HashMap<FlowKey, TcpFlow>,
    /// Finished sockets kept for TIME_WAIT, reclaimable by a new SYN on the same tuple.
    lingering: HashMap<FlowKey, SocketHandle>,
    nat: Arc<NatTable>,
    connect_tx: mpsc::Sender<ConnectResult>,
    connect_rx: mpsc::Receiver<ConnectResult>,
    notify: Arc<Notify>,
    stop: watch::Receiver<()>,
    connect_timeout: Duration,
    proxy: ProxyFeed,
    buffer_size: usize,
}

impl TcpForwarder {
    pub fn new(
        nat: Arc<NatTable>,
        notify: Arc<Notify>,
        stop: watch::Receiver<()>,
        connect_timeout: Duration,
        proxy: ProxyFeed,
        mtu: usize,
    ) -> Self {
        let (connect_tx, connect_rx) = mpsc::channel(CONNECT_RESULT_QUEUE);
        Self {
            flows: HashMap::new(),
            lingering: HashMap::new(),
            nat,
            connect_tx,
            connect_rx,
            notify,
            stop,
            connect_timeout,
            proxy,
            buffer_size: stack_buffer_size(mtu),
        }
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    pub async fn next_connect_result(&mut self) -> Option<ConnectResult> {
        self.connect_rx.recv().await
    }

    fn new_socket(&self) -> tcp::Socket<'static> {
        let rx = tcp::SocketBuffer::new(vec![0u8; self.buffer_size]);
        let tx = tcp::SocketBuffer::new(vec![0u8; self.buffer_size]);
        let mut socket = tcp::Socket::new(rx, tx);
        socket.set_nagle_enabled(false);
        socket.set_ack_delay(None);
        socket.set_congestion_control(CongestionControl::Cubic);
        socket
    }

    /// Intercepts a guest SYN (no ACK) to a forwardable destination.
    pub fn on_syn(&mut self, frame: &mut [u8], sockets: &mut SocketSet<'static>) -> Verdict {
        let Some(pkt) = wire::parse_ip(frame) else {
            return Verdict::Pass;
        };
        let (Some(guest), Some(remote)) = (pkt.src_socket(), pkt.dst_socket()) else {
            return Verdict::Pass;
        };
        let (src, dst, ip_offset, l4_offset) = (pkt.src, pkt.dst, pkt.ip_offset, pkt.l4_offset);
        let key = FlowKey::new(Proto::Tcp, guest, remote);

        if let Some(flow) = self.flows.get(&key) {
            return match flow.phase {
                // Retransmitted SYN while the host connect is in flight.
                FlowPhase::SynSeen | FlowPhase::Connecting => Verdict::Consumed,
                _ => Verdict::Pass,
            };
        }

        if let Some(handle) = self.lingering.remove(&key) {
            let socket = sockets.get_mut::<tcp::Socket>(handle);
            tracing::debug!(guest = %guest, remote = %remote, state = %socket.state(), "reclaiming lingering socket");
            socket.abort();
            sockets.remove(handle);
        }

        wire::strip_sack_permitted(&mut frame[ip_offset..], l4_offset, src, dst);

        let target = SocketAddr::new(translate_host_ip(remote.ip()), remote.port());
        if let Err(e) = self.nat.insert(key, NatEntry::new(target)) {
            tracing::debug!(guest = %guest, remote = %remote, error = %e, "tcp nat insert failed");
            return Verdict::Consumed;
        }

        let mut flow = TcpFlow::inbound(frame.to_vec());
        let tx = self.connect_tx.clone();
        let timeout = self.connect_timeout;
        let proxy = self.proxy.borrow().clone();
        tokio::spawn(async move {
            let result = connect_host(target, timeout, proxy.as_deref()).await;
            let _ = tx.send(ConnectResult { key, result }).await;
        });
        flow.phase = FlowPhase::Connecting;
        self.flows.insert(key, flow);
        tracing::debug!(guest = %guest, remote = %remote, target = %target, "tcp connect started");
        Verdict::Consumed
    }

    /// Completes or fails a pending inbound flow.
    pub fn on_connect_result(
        &mut self,
        res: ConnectResult,
        now: smoltcp::time::Instant,
        iface: &mut Interface,
        sockets: &mut SocketSet<'static>,
        link: &mut Link,
    ) {
        let ConnectResult { key, result } = res;
        let Some(syn) = self.flows.get_mut(&key).and_then(|f| f.syn.take()) else {
            return;
        };

        let stream = match result {
            Ok(stream) => stream,
            Err(failure) => {
                tracing::debug!(guest = %key.guest, remote = %key.remote, ?failure, "tcp connect failed");
                if let Some(reply) = failure_reply(failure, &syn) {
                    link.queue_frame(&reply);
                }
                self.remove_flow(&key, sockets);
                return;
            }
        };

        if let Ok(local) = stream.local_addr() {
            self.nat.set_host_local(&key, local);
        }

        let mut socket = self.new_socket();
        if let Err(e) = socket.listen(endpoint(key.remote)) {
            tracing::debug!(guest = %key.guest, remote = %key.remote, error = ?e, "tcp listen failed");
            self.remove_flow(&key, sockets);
            return;
        }
        let handle = sockets.add(socket);

        // Replay the held SYN straight into the new socket.
        link.inject(syn);
        while link.has_injected() {
            if iface.poll_ingress_single(now, link, sockets) == PollIngressSingleResult::None {
                break;
            }
        }

        let socket = sockets.get_mut::<tcp::Socket>(handle);
        if socket.state() == State::Listen {
            tracing::debug!(guest = %key.guest, remote = %key.remote, "replayed SYN not accepted");
            socket.abort();
            sockets.remove(handle);
            self.remove_flow(&key, sockets);
            return;
        }

        let (chans, pump_chans) = relay::flow_channels();
        tokio::spawn(relay::pump(stream, pump_chans, self.notify.clone(), self.stop.clone()));
        if let Some(flow) = self.flows.get_mut(&key) {
            flow.socket = Some(handle);
            flow.chans = Some(chans);
            flow.phase = FlowPhase::Established;
        }
        tracing::debug!(guest = %key.guest, remote = %key.remote, "tcp flow established");
    }

    /// Opens a connection from `src` to `guest`. The reply carries the host end of the
    /// stream once the guest accepts.
    pub fn dial(
        &mut self,
        guest: SocketAddr,
        src: IpAddr,
        reply: DialReply,
        iface: &mut Interface,
        sockets: &mut SocketSet<'static>,
    ) {
        let port = match self.nat.allocate_port(Proto::Tcp, src, guest) {
            Ok(p) => p,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        let local = SocketAddr::new(src, port);
        let key = FlowKey::new(Proto::Tcp, guest, local);
        if let Err(e) = self.nat.insert(key, NatEntry::new(guest)) {
            let _ = reply.send(Err(e));
            return;
        }

        let mut socket = self.new_socket();
        if let Err(e) = socket.connect(iface.context(), endpoint(guest), endpoint(local)) {
            self.nat.remove(&key);
            let _ = reply.send(Err(NetError::GuestUnreachable(format!("connect: {e:?}"))));
            return;
        }
        let handle = sockets.add(socket);
        self.flows.insert(
            key,
            TcpFlow {
                phase: FlowPhase::Connecting,
                syn: None,
                socket: Some(handle),
                chans: None,
                pending: None,
                host_eof: false,
                dial: Some((reply, Instant::now() + DIAL_TIMEOUT)),
            },
        );
        tracing::debug!(guest = %guest, local = %local, "dialing guest");
    }

    /// Moves data between sockets and flow channels and retires finished flows.
    pub fn service(&mut self, sockets: &mut SocketSet<'static>) {
        self.lingering.retain(|_, handle| {
            if sockets.get::<tcp::Socket>(*handle).state() == State::Closed {
                sockets.remove(*handle);
                false
            } else {
                true
            }
        });

        let mut done = Vec::new();
        let now = Instant::now();
        for (key, flow) in self.flows.iter_mut() {
            let Some(handle) = flow.socket else {
                continue;
            };
            let socket = sockets.get_mut::<tcp::Socket>(handle);

            if flow.dial.is_some() && !service_dial(key, flow, socket, now, &self.notify, &self.stop) {
                done.push(*key);
                continue;
            }
            if let Some(chans) = flow.chans.as_mut() {
                relay_guest_to_host(chans, socket);
                relay_host_to_guest(flow, socket);
            }
            if flow.host_eof || flow.chans.as_ref().is_some_and(|c| c.to_host.is_none()) {
                flow.phase = FlowPhase::Closing;
            }
            if matches!(socket.state(), State::Closed | State::TimeWait) {
                done.push(*key);
            }
        }

        for key in done {
            self.remove_flow(&key, sockets);
        }
    }

    fn remove_flow(&mut self, key: &FlowKey, sockets: &mut SocketSet<'static>) {
        self.nat.remove(key);
        let Some(mut flow) = self.flows.remove(key) else {
            return;
        };
        flow.phase = FlowPhase::Done;
        if let Some(handle) = flow.socket {
            let state = sockets.get::<tcp::Socket>(handle).state();
            match state {
                State::Closed => {
                    sockets.remove(handle);
                }
                State::TimeWait => {
                    self.lingering.insert(*key, handle);
                }
                _ => {
                    sockets.get_mut::<tcp::Socket>(handle).abort();
                    self.lingering.insert(*key, handle);
                }
            }
        }
        tracing::debug!(guest = %key.guest, remote = %key.remote, "tcp flow closed");
    }

    /// Aborts every flow, for shutdown.
    pub fn abort_all(&mut self, sockets: &mut SocketSet<'static>) {
        let keys: Vec<FlowKey> = self.flows.keys().copied().collect();
        for key in keys {
            if let Some(handle) = self.flows.get(&key).and_then(|f| f.socket) {
                sockets.get_mut::<tcp::Socket>(handle).abort();
            }
            self.remove_flow(&key, sockets);
        }
    }
}

/// Returns false when the dial is over without a connection.
fn service_dial(
    key: &FlowKey,
    flow: &mut TcpFlow,
    socket: &mut tcp::Socket<'static>,
    now: Instant,
    notify: &Arc<Notify>,
    stop: &watch::Receiver<()>,
) -> bool {
    let Some((reply, deadline)) = flow.dial.take() else {
        return true;
    };
    match socket.state() {
        State::Established | State::CloseWait => {
            let (ours, theirs) = tokio::io::duplex(TCP_READ_BUFFER_SIZE);
            if reply.send(Ok(theirs)).is_err() {
                socket.abort();
                return false;
            }
            let (chans, pump_chans) = relay::flow_channels();
            tokio::spawn(relay::pump(ours, pump_chans, notify.clone(), stop.clone()));
            flow.chans = Some(chans);
            flow.phase = FlowPhase::Established;
            tracing::debug!(guest = %key.guest, "guest accepted connection");
            true
        }
        State::Closed => {
            let _ = reply.send(Err(NetError::GuestUnreachable(format!("{} refused", key.guest))));
            false
        }
        _ if now >= deadline => {
            socket.abort();
            let _ = reply.send(Err(NetError::Timeout));
            false
        }
        _ if reply.is_closed() => {
            socket.abort();
            false
        }
        _ => {
            flow.dial = Some((reply, deadline));
            true
        }
    }
}

fn relay_guest_to_host(chans: &mut FlowChannels, socket: &mut tcp::Socket<'static>) {
    let Some(to_host) = chans.to_host.as_ref() else {
        return;
    };
    while socket.can_recv() {
        let permit = match to_host.try_reserve() {
            Ok(p) => p,
            Err(mpsc::error::TrySendError::Full(())) => return,
            Err(mpsc::error::TrySendError::Closed(())) => {
                // Host write side is gone.
                socket.abort();
                return;
            }
        };
        match socket.recv(|buf| {
            let n = buf.len().min(TCP_READ_BUFFER_SIZE);
            (n, buf[..n].to_vec())
        }) {
            Ok(chunk) => permit.send(chunk),
            Err(_) => return,
        }
    }
    if !socket.may_recv() && !matches!(socket.state(), State::Listen | State::SynSent | State::SynReceived) {
        // Guest sent FIN: closing the channel half-closes the host stream.
        chans.to_host = None;
    }
}

fn relay_host_to_guest(flow: &mut TcpFlow, socket: &mut tcp::Socket<'static>) {
    if !flush_pending(flow, socket) {
        return;
    }
    if flow.host_eof {
        return;
    }
    let Some(chans) = flow.chans.as_mut() else {
        return;
    };
    while socket.can_send() {
        match chans.from_host.try_recv() {
            Ok(HostEvent::Data(data)) => {
                let n = socket.send_slice(&data).unwrap_or(0);
                if n < data.len() {
                    flow.pending = Some((data, n));
                    return;
                }
            }
            Ok(HostEvent::Eof) => {
                flow.host_eof = true;
                socket.close();
                return;
            }
            Ok(HostEvent::Error(e)) => {
                tracing::debug!(error = %e, "host connection failed, resetting guest");
                flow.host_eof = true;
                socket.abort();
                return;
            }
            Err(mpsc::error::TryRecvError::Empty) => return,
            Err(mpsc::error::TryRecvError::Disconnected) => {
                flow.host_eof = true;
                socket.abort();
                return;
            }
        }
    }
}

/// Returns true when nothing is left pending.
fn flush_pending(flow: &mut TcpFlow, socket: &mut tcp::Socket<'static>) -> bool {
    let Some((data, mut off)) = flow.pending.take() else {
        return true;
    };
    off += socket.send_slice(&data[off..]).unwrap_or(0);
    if off < data.len() {
        flow.pending = Some((data, off));
        return false;
    }
    true
}

fn endpoint(addr: SocketAddr) -> IpEndpoint {
    IpEndpoint::new(addr.ip().into(), addr.port())
}

/// What the guest sees when the host connection for its SYN fails. A timeout resets the
/// connection rather than leaving the guest to its own SYN retries.
fn failure_reply(failure: ConnectFailure, syn: &[u8]) -> Option<Vec<u8>> {
    match failure {
        ConnectFailure::Refused | ConnectFailure::Timeout => {
            wire::parse_ip(syn).and_then(|p| wire::build_tcp_rst_for_syn(&p))
        }
        ConnectFailure::HostUnreachable => unreachable_frame(Unreachable::Host, syn),
        ConnectFailure::NetUnreachable => unreachable_frame(Unreachable::Net, syn),
    }
}

async fn connect_host(
    target: SocketAddr,
    timeout: Duration,
    proxy: Option<&UpstreamProxy>,
) -> Result<TcpStream, ConnectFailure> {
    if let Some(proxy) = proxy.filter(|p| p.carries(target)) {
        tracing::debug!(target = %target, proxy = %proxy, "connecting through upstream proxy");
        return match tokio::time::timeout(timeout, proxy.connect(target)).await {
            Ok(res) => res,
            Err(_) => Err(ConnectFailure::Timeout),
        };
    }

    let sock = match target {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
    .map_err(|e| ConnectFailure::from_io(&e))?;
    // Best effort: the kernel caps these.
    let _ = sock.set_send_buffer_size(HOST_SOCKET_BUFFER);
    let _ = sock.set_recv_buffer_size(HOST_SOCKET_BUFFER);

    let stream = match tokio::time::timeout(timeout, sock.connect(target)).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => return Err(ConnectFailure::from_io(&e)),
        Err(_) => return Err(ConnectFailure::Timeout),
    };
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_buffer_size_clamps() {
        assert_eq!(stack_buffer_size(1500), MIN_STACK_BUFFER);
        assert_eq!(stack_buffer_size(16000), 16000 * 64);
        assert_eq!(stack_buffer_size(65517), MAX_STACK_BUFFER);
    }

    #[test]
    fn test_connect_failure_mapping() {
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert_eq!(ConnectFailure::from_io(&refused), ConnectFailure::Refused);
        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        assert_eq!(ConnectFailure::from_io(&reset), ConnectFailure::Refused);
        let host = io::Error::from_raw_os_error(libc::EHOSTUNREACH);
        assert_eq!(ConnectFailure::from_io(&host), ConnectFailure::HostUnreachable);
        let down = io::Error::from_raw_os_error(libc::EHOSTDOWN);
        assert_eq!(ConnectFailure::from_io(&down), ConnectFailure::HostUnreachable);
        let net = io::Error::from_raw_os_error(libc::ENETUNREACH);
        assert_eq!(ConnectFailure::from_io(&net), ConnectFailure::NetUnreachable);
    }

    #[tokio::test]
    async fn test_connect_refused_maps_to_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let res = connect_host(addr, Duration::from_secs(5), None).await;
        assert_eq!(res.err(), Some(ConnectFailure::Refused));
    }

    fn syn_from_guest() -> Vec<u8> {
        let mut frame = wire::build_tcp_frame(
            "0.250.250.2:40000".parse().unwrap(),
            "1.1.1.1:443".parse().unwrap(),
            1000,
            0,
            wire::TCP_SYN,
            &[],
            &[],
        )
        .unwrap();
        let mut eth = [0u8; 12];
        eth.copy_from_slice(&frame[0..12]);
        frame[0..6].copy_from_slice(&eth[6..12]);
        frame[6..12].copy_from_slice(&eth[0..6]);
        frame
    }

    #[test]
    fn test_connect_timeout_resets_guest() {
        let syn = syn_from_guest();
        for failure in [ConnectFailure::Timeout, ConnectFailure::Refused] {
            let reply = failure_reply(failure, &syn).unwrap();
            let pkt = wire::parse_ip(&reply).unwrap();
            assert_eq!(pkt.proto, wire::IP_PROTO_TCP);
            assert_eq!(wire::tcp_flags(pkt.l4()), Some(wire::TCP_RST | wire::TCP_ACK));
            assert_eq!(pkt.dst_socket(), Some("0.250.250.2:40000".parse().unwrap()));
            assert_eq!(&pkt.l4()[8..12], &1001u32.to_be_bytes());
        }
        let reply = failure_reply(ConnectFailure::HostUnreachable, &syn).unwrap();
        assert_eq!(wire::parse_ip(&reply).unwrap().proto, wire::IP_PROTO_ICMP);
    }

    #[tokio::test]
    async fn test_connect_goes_through_proxy_for_carried_targets() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap();
        let proxy = UpstreamProxy::parse(&format!("http://{proxy_addr}"), &[]).unwrap().unwrap();
        tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 512];
            let _ = conn.read(&mut buf).await.unwrap();
            conn.write_all(b"HTTP/1.1 403 Forbidden\r\n\r\n").await.unwrap();
        });

        let res = connect_host("198.51.100.7:443".parse().unwrap(), Duration::from_secs(5), Some(&proxy)).await;
        assert_eq!(res.err(), Some(ConnectFailure::Refused));
    }
}
