//! ICMP forwarding: echo proxying through unprivileged datagram sockets, relay of the
//! errors those echoes and the host flows provoke, and destination-unreachable synthesis
//! for the TCP and UDP forwarders.

use crate::link::LinkWriter;
use crate::nat::{FlowKey, NatTable, Proto};
use crate::netconf::{gateway_for, translate_host_ip};
use crate::udp::set_hop_limit;
use crate::wire::{
    self, ICMPV4_DEST_UNREACHABLE, ICMPV4_ECHO_REPLY, ICMPV4_ECHO_REQUEST, ICMPV4_TIME_EXCEEDED, ICMPV6_DEST_UNREACHABLE,
    ICMPV6_ECHO_REPLY, ICMPV6_ECHO_REQUEST, ICMPV6_PACKET_TOO_BIG, ICMPV6_TIME_EXCEEDED, IP_PROTO_ICMP, IP_PROTO_ICMPV6,
    IP_PROTO_TCP, IP_PROTO_UDP, Unreachable,
};
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::sys::socket::{AddressFamily, SockFlag, SockProtocol, SockType, socket};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::AsRawFd;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

const REQUEST_QUEUE: usize = 256;
/// Unanswered echoes are forgotten after this long.
const PENDING_TTL: Duration = Duration::from_secs(60);
const PENDING_PRUNE_AT: usize = 1024;
/// Largest quote that keeps an error within the minimum MTU of its family.
const MAX_QUOTE_V4: usize = 576 - 20 - 8;
const MAX_QUOTE_V6: usize = 1280 - 40 - 8;

/// Source address for an unreachable about `orig`: port unreachable comes from the
/// destination itself, everything else from the gateway.
fn unreachable_source(kind: Unreachable, orig: &wire::IpPacket<'_>) -> IpAddr {
    match kind {
        Unreachable::Port => orig.dst,
        Unreachable::Net | Unreachable::Host => gateway_for(orig.dst),
    }
}

/// Builds an unreachable frame for the guest about `frame`, which the guest sent.
pub fn unreachable_frame(kind: Unreachable, frame: &[u8]) -> Option<Vec<u8>> {
    let orig = wire::parse_ip(frame)?;
    wire::build_icmp_unreachable(kind, unreachable_source(kind, &orig), &orig)
}

/// Whether `frame` is an echo request.
pub fn is_echo_request(pkt: &wire::IpPacket<'_>) -> bool {
    let Some(&ty) = pkt.l4().first() else {
        return false;
    };
    match pkt.proto {
        IP_PROTO_ICMP => ty == ICMPV4_ECHO_REQUEST,
        IP_PROTO_ICMPV6 => ty == ICMPV6_ECHO_REQUEST,
        _ => false,
    }
}

/// Error types that quote the offending packet and are passed on to the guest.
fn is_relayed_error(ty: u8, v6: bool) -> bool {
    if v6 {
        matches!(ty, ICMPV6_DEST_UNREACHABLE | ICMPV6_PACKET_TOO_BIG | ICMPV6_TIME_EXCEEDED)
    } else {
        matches!(ty, ICMPV4_DEST_UNREACHABLE | ICMPV4_TIME_EXCEEDED)
    }
}

/// Writes `ident` and `seq` into an echo message, keeping its checksum valid.
fn rewrite_echo(msg: &mut [u8], ident: u16, seq: u16) {
    if msg.len() < 8 {
        return;
    }
    let mut cksum = u16::from_be_bytes([msg[2], msg[3]]);
    for (off, new) in [(4, ident), (6, seq)] {
        let old = u16::from_be_bytes([msg[off], msg[off + 1]]);
        cksum = wire::adjust_checksum(cksum, old, new);
        msg[off..off + 2].copy_from_slice(&new.to_be_bytes());
    }
    msg[2..4].copy_from_slice(&cksum.to_be_bytes());
}

#[derive(Debug)]
struct EchoRequest {
    /// Address actually pinged.
    target: IpAddr,
    guest: IpAddr,
    /// Destination as the guest addressed it.
    orig_dst: IpAddr,
    ident: u16,
    seq: u16,
    ttl: u8,
    message: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
struct PendingEcho {
    guest: IpAddr,
    orig_dst: IpAddr,
    ident: u16,
    seq: u16,
    ttl: u8,
    sent: Instant,
}

/// Echoes in flight, keyed by target and the sequence number used on the wire. Every
/// request gets its own wire sequence, so guests reusing an identifier or sequence
/// against the same target never share an entry.
#[derive(Default)]
struct PendingEchoes {
    map: HashMap<(IpAddr, u16), PendingEcho>,
    next_seq: u16,
}

impl PendingEchoes {
    /// Records `echo` and returns the sequence number to send it with.
    fn register(&mut self, target: IpAddr, echo: PendingEcho) -> u16 {
        if self.map.len() >= PENDING_PRUNE_AT {
            let now = Instant::now();
            self.map.retain(|_, p| now.duration_since(p.sent) < PENDING_TTL);
        }
        let mut seq = self.next_seq;
        for _ in 0..=u16::MAX {
            if !self.map.contains_key(&(target, seq)) {
                break;
            }
            seq = seq.wrapping_add(1);
        }
        self.next_seq = seq.wrapping_add(1);
        self.map.insert((target, seq), echo);
        seq
    }

    fn take(&mut self, target: IpAddr, seq: u16) -> Option<PendingEcho> {
        self.map.remove(&(target, seq))
    }
}

type PendingMap = Arc<Mutex<PendingEchoes>>;

fn lock_pending(pending: &PendingMap) -> MutexGuard<'_, PendingEchoes> {
    pending.lock().unwrap_or_else(|e| e.into_inner())
}

fn icmp_socket(v6: bool) -> io::Result<UdpSocket> {
    let (family, proto) = if v6 {
        (AddressFamily::Inet6, SockProtocol::IcmpV6)
    } else {
        (AddressFamily::Inet, SockProtocol::Icmp)
    };
    let fd = socket(family, SockType::Datagram, SockFlag::empty(), proto)?;
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;
    let sock = UdpSocket::from_std(std::net::UdpSocket::from(fd))?;
    if let Err(e) = queued::enable(&sock, v6) {
        tracing::debug!(error = %e, v6, "ICMP error queue unavailable");
    }
    Ok(sock)
}

pub struct IcmpForwarder {
    writer: LinkWriter,
    requests: Option<mpsc::Sender<EchoRequest>>,
    stop_tx: Mutex<Option<watch::Sender<()>>>,
}

impl IcmpForwarder {
    /// Opens the echo sockets and starts the request and reply loops. Must run inside a
    /// tokio runtime. Echo proxying is off when `enabled` is false or the host refuses
    /// ICMP sockets; unreachable synthesis always works.
    pub fn start(writer: LinkWriter, nat: Arc<NatTable>, enabled: bool) -> Arc<Self> {
        let (stop_tx, stop_rx) = watch::channel(());

        let mut sockets: Vec<(bool, Arc<UdpSocket>)> = Vec::new();
        if enabled {
            for v6 in [false, true] {
                match icmp_socket(v6) {
                    Ok(s) => sockets.push((v6, Arc::new(s))),
                    Err(e) => tracing::warn!(error = %e, v6, "ICMP sockets unavailable, dropping echo requests"),
                }
            }
        }

        let requests = if sockets.is_empty() {
            None
        } else {
            let relay = Arc::new(ReplyRelay {
                pending: PendingMap::default(),
                nat,
                writer: writer.clone(),
            });
            let (tx, rx) = mpsc::channel(REQUEST_QUEUE);
            tokio::spawn(proxy_requests(rx, sockets.clone(), relay.pending.clone(), stop_rx.clone()));
            for (v6, sock) in sockets {
                tokio::spawn(monitor_replies(sock, v6, relay.clone(), stop_rx.clone()));
            }
            Some(tx)
        };

        Arc::new(Self {
            writer,
            requests,
            stop_tx: Mutex::new(Some(stop_tx)),
        })
    }

    /// Hands a guest echo request to the proxy loop. Never blocks.
    pub fn handle_echo(&self, pkt: &wire::IpPacket<'_>) {
        let Some(requests) = &self.requests else {
            tracing::trace!(dst = %pkt.dst, "dropping echo request, ICMP forwarding unavailable");
            return;
        };
        let l4 = pkt.l4();
        if l4.len() < 8 {
            return;
        }
        let req = EchoRequest {
            target: translate_host_ip(pkt.dst),
            guest: pkt.src,
            orig_dst: pkt.dst,
            ident: u16::from_be_bytes([l4[4], l4[5]]),
            seq: u16::from_be_bytes([l4[6], l4[7]]),
            ttl: pkt.ttl,
            message: l4.to_vec(),
        };
        if requests.try_send(req).is_err() {
            tracing::trace!(dst = %pkt.dst, "echo request queue full");
        }
    }

    /// Sends a destination unreachable to the guest about `frame`.
    pub async fn send_unreachable(&self, kind: Unreachable, frame: &[u8]) {
        let Some(reply) = unreachable_frame(kind, frame) else {
            return;
        };
        if let Err(e) = self.writer.send(&reply).await {
            tracing::debug!(error = %e, ?kind, "failed to send ICMP unreachable");
        }
    }

    /// Stops both loops. Idempotent.
    pub fn close(&self) {
        let tx = self.stop_tx.lock().ok().and_then(|mut g| g.take());
        if tx.is_some() {
            tracing::debug!("ICMP forwarder stopped");
        }
    }
}

impl Drop for IcmpForwarder {
    fn drop(&mut self) {
        self.close();
    }
}

async fn proxy_requests(
    mut rx: mpsc::Receiver<EchoRequest>,
    sockets: Vec<(bool, Arc<UdpSocket>)>,
    pending: PendingMap,
    mut stop: watch::Receiver<()>,
) {
    let mut ttls: [Option<u8>; 2] = [None, None];
    loop {
        let mut req = tokio::select! {
            _ = stop.changed() => break,
            req = rx.recv() => match req {
                Some(req) => req,
                None => break,
            },
        };
        let v6 = req.target.is_ipv6();
        let Some((_, sock)) = sockets.iter().find(|(s6, _)| *s6 == v6) else {
            tracing::trace!(target = %req.target, "no ICMP socket for family");
            continue;
        };

        let echo = PendingEcho {
            guest: req.guest,
            orig_dst: req.orig_dst,
            ident: req.ident,
            seq: req.seq,
            ttl: req.ttl,
            sent: Instant::now(),
        };
        let wire_seq = lock_pending(&pending).register(req.target, echo);
        rewrite_echo(&mut req.message, req.ident, wire_seq);

        // The guest's hop limit goes out unchanged so traceroute sees every hop.
        if ttls[v6 as usize] != Some(req.ttl) {
            set_hop_limit(sock, req.ttl, v6);
            ttls[v6 as usize] = Some(req.ttl);
        }

        if let Err(e) = sock.send_to(&req.message, SocketAddr::new(req.target, 0)).await {
            tracing::debug!(error = %e, target = %req.target, "echo send failed");
            lock_pending(&pending).take(req.target, wire_seq);
        }
    }
}

/// Turns what the ICMP sockets receive into frames for the guest.
struct ReplyRelay {
    pending: PendingMap,
    nat: Arc<NatTable>,
    writer: LinkWriter,
}

impl ReplyRelay {
    /// Frame for a datagram read from an ICMP socket, sent by `from`.
    fn frame_for_datagram(&self, data: &[u8], from: IpAddr, v6: bool) -> Option<Vec<u8>> {
        let msg = icmp_message(data, v6)?;
        let ty = msg[0];
        if ty == if v6 { ICMPV6_ECHO_REPLY } else { ICMPV4_ECHO_REPLY } {
            return self.echo_reply_frame(msg, from);
        }
        if !is_relayed_error(ty, v6) {
            return None;
        }
        let quoted = Quoted::parse(&msg[8..], v6)?;
        let rest = [msg[4], msg[5], msg[6], msg[7]];
        match quoted.proto {
            IP_PROTO_ICMP | IP_PROTO_ICMPV6 => {
                let request = if v6 { ICMPV6_ECHO_REQUEST } else { ICMPV4_ECHO_REQUEST };
                if quoted.l4.first() != Some(&request) {
                    return None;
                }
                self.echo_error_frame(ty, msg[1], rest, from, quoted.dst, quoted.l4, Some(quoted.ttl))
            }
            IP_PROTO_TCP => self.flow_error_frame(ty, msg[1], rest, from, Proto::Tcp, &quoted),
            IP_PROTO_UDP => self.flow_error_frame(ty, msg[1], rest, from, Proto::Udp, &quoted),
            _ => None,
        }
    }

    fn echo_reply_frame(&self, msg: &[u8], from: IpAddr) -> Option<Vec<u8>> {
        let seq = u16::from_be_bytes([msg[6], msg[7]]);
        let Some(entry) = lock_pending(&self.pending).take(from, seq) else {
            tracing::trace!(from = %from, seq, "unmatched echo reply");
            return None;
        };
        let mut message = msg.to_vec();
        message[4..6].copy_from_slice(&entry.ident.to_be_bytes());
        message[6..8].copy_from_slice(&entry.seq.to_be_bytes());
        wire::build_icmp_frame(entry.orig_dst, entry.guest, message)
    }

    /// Error about one of our echoes to `target`; `echo` is the request as sent. The
    /// quote carries `ttl`, or the guest's own when the error came without one.
    #[allow(clippy::too_many_arguments)]
    fn echo_error_frame(
        &self,
        ty: u8,
        code: u8,
        rest: [u8; 4],
        offender: IpAddr,
        target: IpAddr,
        echo: &[u8],
        ttl: Option<u8>,
    ) -> Option<Vec<u8>> {
        if echo.len() < 8 {
            return None;
        }
        let seq = u16::from_be_bytes([echo[6], echo[7]]);
        let entry = lock_pending(&self.pending).take(target, seq)?;
        let proto = if entry.guest.is_ipv6() { IP_PROTO_ICMPV6 } else { IP_PROTO_ICMP };

        let mut l4 = echo[..echo.len().min(max_quote_l4(entry.guest))].to_vec();
        rewrite_echo(&mut l4, entry.ident, entry.seq);
        let quote = quote_packet(entry.guest, entry.orig_dst, proto, ttl.unwrap_or(entry.ttl), &l4)?;
        let src = if offender == target { entry.orig_dst } else { offender };
        error_frame(ty, code, rest, src, entry.guest, &quote)
    }

    /// Error about a host socket backing a guest TCP or UDP flow.
    fn flow_error_frame(
        &self,
        ty: u8,
        code: u8,
        rest: [u8; 4],
        offender: IpAddr,
        proto: Proto,
        quoted: &Quoted<'_>,
    ) -> Option<Vec<u8>> {
        if quoted.l4.len() < 8 {
            return None;
        }
        let sport = u16::from_be_bytes([quoted.l4[0], quoted.l4[1]]);
        let key = self.flow_for_host(proto, SocketAddr::new(quoted.src, sport))?;
        let target = self.nat.get(&key).map(|e| e.target.ip());

        let mut l4 = quoted.l4[..quoted.l4.len().min(max_quote_l4(key.guest.ip()))].to_vec();
        l4[0..2].copy_from_slice(&key.guest.port().to_be_bytes());
        l4[2..4].copy_from_slice(&key.remote.port().to_be_bytes());
        let proto_num = match proto {
            Proto::Tcp => IP_PROTO_TCP,
            Proto::Udp => IP_PROTO_UDP,
        };
        let quote = quote_packet(key.guest.ip(), key.remote.ip(), proto_num, quoted.ttl, &l4)?;
        let src = if Some(offender) == target { key.remote.ip() } else { offender };
        error_frame(ty, code, rest, src, key.guest.ip(), &quote)
    }

    /// Flow owning a host socket. Sockets bound to the wildcard address are indexed by it.
    fn flow_for_host(&self, proto: Proto, local: SocketAddr) -> Option<FlowKey> {
        self.nat.lookup_host(proto, local).or_else(|| {
            let any = if local.is_ipv6() {
                IpAddr::V6(Ipv6Addr::UNSPECIFIED)
            } else {
                IpAddr::V4(Ipv4Addr::UNSPECIFIED)
            };
            self.nat.lookup_host(proto, SocketAddr::new(any, local.port()))
        })
    }

    #[cfg(target_os = "linux")]
    fn frame_for_queued(&self, err: &queued::QueuedError) -> Option<Vec<u8>> {
        let v6 = err.target.is_ipv6();
        if !is_relayed_error(err.ty, v6) {
            return None;
        }
        let mut rest = [0u8; 4];
        if v6 && err.ty == ICMPV6_PACKET_TOO_BIG {
            rest = err.info.to_be_bytes();
        } else if !v6 && err.ty == ICMPV4_DEST_UNREACHABLE && err.code == 4 {
            rest[2..4].copy_from_slice(&(err.info as u16).to_be_bytes());
        }
        let offender = err.offender.unwrap_or(err.target);
        self.echo_error_frame(err.ty, err.code, rest, offender, err.target, &err.message, None)
    }

    async fn deliver(&self, frame: Vec<u8>) {
        if let Err(e) = self.writer.send(&frame).await {
            tracing::debug!(error = %e, "failed to relay ICMP message");
        }
    }
}

async fn monitor_replies(sock: Arc<UdpSocket>, v6: bool, relay: Arc<ReplyRelay>, mut stop: watch::Receiver<()>) {
    let mut buf = vec![0u8; 65536];
    loop {
        let frame = tokio::select! {
            _ = stop.changed() => break,
            r = sock.recv_from(&mut buf) => match r {
                Ok((n, from)) => relay.frame_for_datagram(&buf[..n], from.ip(), v6),
                Err(e) => {
                    tracing::debug!(error = %e, v6, "ICMP receive failed");
                    continue;
                }
            },
            r = queued::next(&sock) => match r {
                Ok(err) => {
                    tracing::trace!(?err, "queued ICMP error");
                    relay.frame_for_queued(&err)
                }
                Err(e) => {
                    tracing::debug!(error = %e, v6, "ICMP error queue read failed");
                    continue;
                }
            },
        };
        if let Some(frame) = frame {
            relay.deliver(frame).await;
        }
    }
}

/// ICMP message from a datagram socket read. Some platforms include the IPv4 header;
/// it is stripped.
fn icmp_message(data: &[u8], v6: bool) -> Option<&[u8]> {
    let mut msg = data;
    if !v6 && msg.first().is_some_and(|b| b >> 4 == 4) {
        let ihl = (msg[0] & 0x0f) as usize * 4;
        msg = msg.get(ihl..)?;
    }
    (msg.len() >= 8).then_some(msg)
}

/// Leading part of the packet quoted by an ICMP error.
#[derive(Debug)]
struct Quoted<'a> {
    src: IpAddr,
    dst: IpAddr,
    proto: u8,
    ttl: u8,
    l4: &'a [u8],
}

impl<'a> Quoted<'a> {
    fn parse(data: &'a [u8], v6: bool) -> Option<Self> {
        if v6 {
            if data.len() < 40 || data[0] >> 4 != 6 {
                return None;
            }
            let src: [u8; 16] = data[8..24].try_into().ok()?;
            let dst: [u8; 16] = data[24..40].try_into().ok()?;
            Some(Self {
                src: IpAddr::V6(Ipv6Addr::from(src)),
                dst: IpAddr::V6(Ipv6Addr::from(dst)),
                proto: data[6],
                ttl: data[7],
                l4: &data[40..],
            })
        } else {
            if data.len() < 20 || data[0] >> 4 != 4 {
                return None;
            }
            let ihl = (data[0] & 0x0f) as usize * 4;
            Some(Self {
                src: IpAddr::V4(Ipv4Addr::new(data[12], data[13], data[14], data[15])),
                dst: IpAddr::V4(Ipv4Addr::new(data[16], data[17], data[18], data[19])),
                proto: data[9],
                ttl: data[8],
                l4: data.get(ihl..)?,
            })
        }
    }
}

fn max_quote_l4(ip: IpAddr) -> usize {
    if ip.is_ipv6() { MAX_QUOTE_V6 - 40 } else { MAX_QUOTE_V4 - 20 }
}

/// IP packet as the guest sent it, for quoting in an error.
fn quote_packet(src: IpAddr, dst: IpAddr, proto: u8, ttl: u8, l4: &[u8]) -> Option<Vec<u8>> {
    let mut quote = Vec::with_capacity(40 + l4.len());
    match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => quote.extend_from_slice(&wire::build_ipv4_header(s, d, proto, l4.len(), ttl)),
        (IpAddr::V6(s), IpAddr::V6(d)) => quote.extend_from_slice(&wire::build_ipv6_header(s, d, proto, l4.len(), ttl)),
        _ => return None,
    }
    // Receivers do not check the quoted transport checksum.
    quote.extend_from_slice(l4);
    Some(quote)
}

fn error_frame(ty: u8, code: u8, rest: [u8; 4], src: IpAddr, dst: IpAddr, quote: &[u8]) -> Option<Vec<u8>> {
    let mut icmp = Vec::with_capacity(8 + quote.len());
    icmp.extend_from_slice(&[ty, code, 0, 0]);
    icmp.extend_from_slice(&rest);
    icmp.extend_from_slice(quote);
    wire::build_icmp_frame(src, dst, icmp)
}

/// Errors the Linux kernel queues against echo requests sent from ping sockets. They never
/// arrive as datagrams there.
#[cfg(target_os = "linux")]
mod queued {
    use nix::sys::socket::{ControlMessageOwned, MsgFlags, SockaddrStorage, recvmsg, setsockopt, sockopt};
    use std::io::{self, IoSliceMut};
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};
    use std::os::fd::{AsRawFd, RawFd};
    use tokio::io::Interest;
    use tokio::net::UdpSocket;

    #[derive(Debug)]
    pub(super) struct QueuedError {
        pub ty: u8,
        pub code: u8,
        /// Next-hop MTU for fragmentation needed and packet too big.
        pub info: u32,
        pub offender: Option<IpAddr>,
        pub target: IpAddr,
        /// Our echo request as sent.
        pub message: Vec<u8>,
    }

    pub(super) fn enable(sock: &UdpSocket, v6: bool) -> nix::Result<()> {
        if v6 {
            setsockopt(sock, sockopt::Ipv6RecvErr, &true)
        } else {
            setsockopt(sock, sockopt::Ipv4RecvErr, &true)
        }
    }

    pub(super) async fn next(sock: &UdpSocket) -> io::Result<QueuedError> {
        let fd = sock.as_raw_fd();
        sock.async_io(Interest::ERROR, || read(fd)).await
    }

    fn storage_ip(addr: &SockaddrStorage) -> Option<IpAddr> {
        if let Some(sin) = addr.as_sockaddr_in() {
            return Some(IpAddr::V4(*SocketAddrV4::from(*sin).ip()));
        }
        addr.as_sockaddr_in6().map(|sin6| IpAddr::V6(*SocketAddrV6::from(*sin6).ip()))
    }

    fn read(fd: RawFd) -> io::Result<QueuedError> {
        let mut buf = vec![0u8; 2048];
        let mut cmsg = nix::cmsg_space!(libc::sock_extended_err, libc::sockaddr_in6);
        let mut iov = [IoSliceMut::new(&mut buf)];
        let msg = recvmsg::<SockaddrStorage>(
            fd,
            &mut iov,
            Some(&mut cmsg),
            MsgFlags::MSG_ERRQUEUE | MsgFlags::MSG_DONTWAIT,
        )?;
        let n = msg.bytes;
        let target = msg.address.as_ref().and_then(storage_ip);

        let mut found = None;
        for c in msg.cmsgs()? {
            match c {
                ControlMessageOwned::Ipv4RecvErr(ee, offender) if ee.ee_origin == libc::SO_EE_ORIGIN_ICMP => {
                    let offender = offender.map(|sa| IpAddr::V4(Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr))));
                    found = Some((ee, offender));
                }
                ControlMessageOwned::Ipv6RecvErr(ee, offender) if ee.ee_origin == libc::SO_EE_ORIGIN_ICMP6 => {
                    let offender = offender.map(|sa| IpAddr::V6(Ipv6Addr::from(sa.sin6_addr.s6_addr)));
                    found = Some((ee, offender));
                }
                _ => {}
            }
        }
        let (ee, offender) = found.ok_or_else(|| io::Error::other("queued error without ICMP origin"))?;
        let target = target.ok_or_else(|| io::Error::other("queued error without destination"))?;
        Ok(QueuedError {
            ty: ee.ee_type,
            code: ee.ee_code,
            info: ee.ee_info,
            offender,
            target,
            message: buf[..n.min(buf.len())].to_vec(),
        })
    }
}

#[cfg(not(target_os = "linux"))]
mod queued {
    use std::io;
    use tokio::net::UdpSocket;

    #[derive(Debug)]
    pub(super) enum QueuedError {}

    pub(super) fn enable(_sock: &UdpSocket, _v6: bool) -> io::Result<()> {
        Ok(())
    }

    pub(super) async fn next(_sock: &UdpSocket) -> io::Result<QueuedError> {
        std::future::pending().await
    }
}

#[cfg(not(target_os = "linux"))]
impl ReplyRelay {
    fn frame_for_queued(&self, err: &queued::QueuedError) -> Option<Vec<u8>> {
        match *err {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{Link, LinkParams, unixgram_pair};
    use crate::nat::NatEntry;
    use crate::netconf::{GATEWAY_IP4, GUEST_IP4};
    use crate::wire::{build_udp_frame, checksum, parse_ip};
    use nix::sys::socket::MsgFlags;
    use std::os::fd::OwnedFd;

    fn udp_from_guest(dst: &str) -> Vec<u8> {
        let mut frame = build_udp_frame(
            SocketAddr::new(IpAddr::V4(GUEST_IP4), 40000),
            dst.parse().unwrap(),
            b"payload",
        )
        .unwrap();
        // Swap direction: guest -> host.
        let mut eth = [0u8; 12];
        eth.copy_from_slice(&frame[0..12]);
        frame[0..6].copy_from_slice(&eth[6..12]);
        frame[6..12].copy_from_slice(&eth[0..6]);
        frame
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn relay(nat: Arc<NatTable>) -> (ReplyRelay, OwnedFd, Link) {
        let (host, guest) = unixgram_pair().unwrap();
        fcntl(guest.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK)).unwrap();
        let link = Link::new(host, LinkParams::new(1500)).unwrap();
        let relay = ReplyRelay {
            pending: PendingMap::default(),
            nat,
            writer: link.writer(),
        };
        (relay, guest, link)
    }

    fn pending_echo(ident: u16, seq: u16) -> PendingEcho {
        PendingEcho {
            guest: IpAddr::V4(GUEST_IP4),
            orig_dst: ip("10.9.9.9"),
            ident,
            seq,
            ttl: 1,
            sent: Instant::now(),
        }
    }

    /// Echo request the host sent, as quoted back by a router.
    fn quoted_echo(target: &str, wire_seq: u16) -> Vec<u8> {
        let mut echo = vec![ICMPV4_ECHO_REQUEST, 0, 0, 0, 0x77, 0x77, 0, 0, b'p', b'i', b'n', b'g'];
        echo[6..8].copy_from_slice(&wire_seq.to_be_bytes());
        let cksum = checksum(&echo);
        echo[2..4].copy_from_slice(&cksum.to_be_bytes());
        let target: Ipv4Addr = target.parse().unwrap();
        let mut quote = wire::build_ipv4_header("192.168.1.5".parse().unwrap(), target, IP_PROTO_ICMP, echo.len(), 1).to_vec();
        quote.extend_from_slice(&echo);
        quote
    }

    fn time_exceeded(quote: &[u8]) -> Vec<u8> {
        let mut msg = vec![ICMPV4_TIME_EXCEEDED, 0, 0, 0, 0, 0, 0, 0];
        msg.extend_from_slice(quote);
        let cksum = checksum(&msg);
        msg[2..4].copy_from_slice(&cksum.to_be_bytes());
        msg
    }

    async fn guest_recv(fd: &OwnedFd) -> Vec<u8> {
        let fd = tokio::io::unix::AsyncFd::new(fd.as_raw_fd()).unwrap();
        let mut buf = vec![0u8; 2048];
        loop {
            let mut guard = fd.readable().await.unwrap();
            if let Ok(r) = guard.try_io(|fd| {
                nix::sys::socket::recv(*fd.get_ref(), &mut buf, MsgFlags::MSG_DONTWAIT).map_err(io::Error::from)
            }) {
                let n = r.unwrap();
                return buf[..n].to_vec();
            }
        }
    }

    #[test]
    fn test_port_unreachable_comes_from_destination() {
        let frame = udp_from_guest("10.1.2.3:9");
        let reply = unreachable_frame(Unreachable::Port, &frame).unwrap();
        let pkt = parse_ip(&reply).unwrap();
        assert_eq!(pkt.src, ip("10.1.2.3"));
        assert_eq!(pkt.dst, IpAddr::V4(GUEST_IP4));
        assert_eq!(pkt.l4()[0], ICMPV4_DEST_UNREACHABLE);
        assert_eq!(pkt.l4()[1], 3);
    }

    #[test]
    fn test_host_unreachable_comes_from_gateway() {
        let frame = udp_from_guest("10.1.2.3:9");
        let reply = unreachable_frame(Unreachable::Host, &frame).unwrap();
        let pkt = parse_ip(&reply).unwrap();
        assert_eq!(pkt.src, IpAddr::V4(GATEWAY_IP4));
        assert_eq!(pkt.l4()[1], 1);
        assert_eq!(checksum(pkt.l4()), 0);
    }

    #[test]
    fn test_icmp_message_strips_ipv4_header() {
        let reply = vec![ICMPV4_ECHO_REPLY, 0, 0, 0, 0, 1, 0, 9, b'x'];
        assert_eq!(icmp_message(&reply, false).unwrap(), &reply[..]);

        let mut with_ip = wire::build_ipv4_header(Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST, 1, reply.len(), 64).to_vec();
        with_ip.extend_from_slice(&reply);
        assert_eq!(icmp_message(&with_ip, false).unwrap(), &reply[..]);
        assert!(icmp_message(&reply[..4], false).is_none());
    }

    #[test]
    fn test_reused_ident_and_seq_get_distinct_wire_sequences() {
        let mut pending = PendingEchoes::default();
        let target = ip("1.1.1.1");
        let a = pending.register(target, pending_echo(100, 1));
        let b = pending.register(target, pending_echo(200, 1));
        let c = pending.register(target, pending_echo(100, 1));
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);

        assert_eq!(pending.take(target, b).unwrap().ident, 200);
        assert_eq!(pending.take(target, a).unwrap().ident, 100);
        assert!(pending.take(target, a).is_none());
        assert!(pending.take(ip("8.8.8.8"), c).is_none());
        assert_eq!(pending.take(target, c).unwrap().seq, 1);
    }

    #[test]
    fn test_rewrite_echo_keeps_checksum_valid() {
        let mut msg = vec![ICMPV4_ECHO_REQUEST, 0, 0, 0, 0, 5, 0, 6, 1, 2, 3];
        let cksum = checksum(&msg);
        msg[2..4].copy_from_slice(&cksum.to_be_bytes());
        rewrite_echo(&mut msg, 0xabcd, 0x1234);
        assert_eq!(&msg[4..8], &[0xab, 0xcd, 0x12, 0x34]);
        assert_eq!(checksum(&msg), 0);
    }

    #[tokio::test]
    async fn test_echo_reply_restores_guest_ident_and_seq() {
        let (relay, _guest, _link) = relay(Arc::new(NatTable::new()));
        let target = ip("10.9.9.9");
        let wire_seq = lock_pending(&relay.pending).register(target, pending_echo(0x4242, 7));

        let mut reply = vec![ICMPV4_ECHO_REPLY, 0, 0, 0, 0x77, 0x77, 0, 0, b'x'];
        reply[6..8].copy_from_slice(&wire_seq.to_be_bytes());
        let frame = relay.frame_for_datagram(&reply, target, false).unwrap();
        let pkt = parse_ip(&frame).unwrap();
        assert_eq!(pkt.src, target);
        assert_eq!(pkt.dst, IpAddr::V4(GUEST_IP4));
        assert_eq!(&pkt.l4()[4..8], &[0x42, 0x42, 0, 7]);
        assert_eq!(checksum(pkt.l4()), 0);

        // Already answered.
        assert!(relay.frame_for_datagram(&reply, target, false).is_none());
    }

    #[tokio::test]
    async fn test_time_exceeded_for_echo_names_the_hop() {
        let (relay, _guest, _link) = relay(Arc::new(NatTable::new()));
        let wire_seq = lock_pending(&relay.pending).register(ip("10.9.9.9"), pending_echo(0x4242, 7));

        let msg = time_exceeded(&quoted_echo("10.9.9.9", wire_seq));
        let frame = relay.frame_for_datagram(&msg, ip("203.0.113.1"), false).unwrap();
        let pkt = parse_ip(&frame).unwrap();
        assert_eq!(pkt.src, ip("203.0.113.1"));
        assert_eq!(pkt.dst, IpAddr::V4(GUEST_IP4));
        assert_eq!(pkt.l4()[0], ICMPV4_TIME_EXCEEDED);
        assert_eq!(checksum(pkt.l4()), 0);

        let inner = Quoted::parse(&pkt.l4()[8..], false).unwrap();
        assert_eq!(inner.src, IpAddr::V4(GUEST_IP4));
        assert_eq!(inner.dst, ip("10.9.9.9"));
        assert_eq!(inner.proto, IP_PROTO_ICMP);
        assert_eq!(&inner.l4[4..8], &[0x42, 0x42, 0, 7]);
        assert_eq!(checksum(inner.l4), 0);
        assert_eq!(checksum(&pkt.l4()[8..28]), 0);

        // The error settles the echo.
        assert!(lock_pending(&relay.pending).take(ip("10.9.9.9"), wire_seq).is_none());
    }

    #[tokio::test]
    async fn test_udp_flow_error_is_mapped_to_guest_flow() {
        let nat = Arc::new(NatTable::new());
        let key = FlowKey::new(
            Proto::Udp,
            SocketAddr::new(IpAddr::V4(GUEST_IP4), 40000),
            "10.9.9.9:53".parse().unwrap(),
        );
        nat.insert(key, NatEntry::new("10.9.9.9:53".parse().unwrap())).unwrap();
        nat.set_host_local(&key, "0.0.0.0:50000".parse().unwrap());
        let (relay, _guest, _link) = relay(nat);

        let udp = [0xc3, 0x50, 0, 53, 0, 12, 0, 0, b'q', b'u', b'e', b'r'];
        let mut quote =
            wire::build_ipv4_header("192.168.1.5".parse().unwrap(), "10.9.9.9".parse().unwrap(), IP_PROTO_UDP, 12, 64)
                .to_vec();
        quote.extend_from_slice(&udp);
        let mut msg = vec![ICMPV4_DEST_UNREACHABLE, 3, 0, 0, 0, 0, 0, 0];
        msg.extend_from_slice(&quote);

        let frame = relay.frame_for_datagram(&msg, ip("10.9.9.9"), false).unwrap();
        let pkt = parse_ip(&frame).unwrap();
        assert_eq!(pkt.src, ip("10.9.9.9"));
        assert_eq!(pkt.dst, IpAddr::V4(GUEST_IP4));
        assert_eq!(&pkt.l4()[0..2], &[ICMPV4_DEST_UNREACHABLE, 3]);
        let inner = Quoted::parse(&pkt.l4()[8..], false).unwrap();
        assert_eq!(inner.src, IpAddr::V4(GUEST_IP4));
        assert_eq!(inner.dst, ip("10.9.9.9"));
        assert_eq!(&inner.l4[0..4], &[0x9c, 0x40, 0, 53]);

        // Unknown host port.
        msg[8 + 20] = 0x01;
        assert!(relay.frame_for_datagram(&msg, ip("10.9.9.9"), false).is_none());
    }

    #[tokio::test]
    async fn test_monitor_replies_relays_time_exceeded() {
        let (relay, guest, _link) = relay(Arc::new(NatTable::new()));
        let wire_seq = lock_pending(&relay.pending).register(ip("10.9.9.9"), pending_echo(0x0102, 3));

        let sock = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = sock.local_addr().unwrap();
        let (stop_tx, stop_rx) = watch::channel(());
        let task = tokio::spawn(monitor_replies(sock, false, Arc::new(relay), stop_rx));

        let router = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        router.send_to(&time_exceeded(&quoted_echo("10.9.9.9", wire_seq)), addr).await.unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(2), guest_recv(&guest)).await.unwrap();
        let pkt = parse_ip(&frame).unwrap();
        assert_eq!(pkt.src, ip("127.0.0.1"));
        assert_eq!(pkt.l4()[0], ICMPV4_TIME_EXCEEDED);
        let inner = Quoted::parse(&pkt.l4()[8..], false).unwrap();
        assert_eq!(inner.src, IpAddr::V4(GUEST_IP4));
        assert_eq!(&inner.l4[4..8], &[0x01, 0x02, 0, 3]);

        drop(stop_tx);
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_send_unreachable_reaches_guest_and_close_is_idempotent() {
        let (host, guest) = unixgram_pair().unwrap();
        let link = Link::new(host, LinkParams::new(1500)).unwrap();
        let icmp = IcmpForwarder::start(link.writer(), Arc::new(NatTable::new()), false);

        icmp.send_unreachable(Unreachable::Net, &udp_from_guest("10.1.2.3:9")).await;
        let mut buf = vec![0u8; 2048];
        let n = nix::sys::socket::recv(guest.as_raw_fd(), &mut buf, MsgFlags::empty()).unwrap();
        let pkt = parse_ip(&buf[..n]).unwrap();
        assert_eq!(pkt.l4()[0], ICMPV4_DEST_UNREACHABLE);
        assert_eq!(pkt.l4()[1], 0);

        icmp.close();
        icmp.close();
        assert!(icmp.requests.is_none());
    }
}
