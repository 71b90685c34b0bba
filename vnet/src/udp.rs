//! UDP forwarding: one host socket per guest flow, torn down after an idle period.

use crate::icmp::IcmpForwarder;
use crate::link::LinkWriter;
use crate::nat::{FlowKey, NatEntry, NatTable, Proto};
use crate::netconf::translate_host_ip;
use crate::wire::{self, IP_PROTO_UDP, Unreachable};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

const FLOW_QUEUE: usize = 256;
const MAX_UDP_PAYLOAD_V4: usize = 65507;
const MAX_UDP_PAYLOAD_V6: usize = 65527;
const RECV_BUFFER_SIZE: usize = 65536;

struct FlowSlot {
    id: u64,
    tx: mpsc::Sender<Vec<u8>>,
}

pub struct UdpForwarder {
    flows: Mutex<HashMap<FlowKey, FlowSlot>>,
    next_id: AtomicU64,
    nat: Arc<NatTable>,
    writer: LinkWriter,
    icmp: Arc<IcmpForwarder>,
    idle_timeout: Duration,
    stop: watch::Receiver<()>,
}

/// Why a datagram was not forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Malformed,
    Fragmented,
    Oversized,
}

/// Validates a guest datagram and returns its payload length.
fn check_datagram(pkt: &wire::IpPacket<'_>) -> Result<usize, DropReason> {
    if pkt.fragmented {
        return Err(DropReason::Fragmented);
    }
    let l4 = pkt.l4();
    if pkt.proto != IP_PROTO_UDP || l4.len() < 8 {
        return Err(DropReason::Malformed);
    }
    let udp_len = u16::from_be_bytes([l4[4], l4[5]]) as usize;
    if udp_len < 8 || udp_len > l4.len() {
        return Err(DropReason::Malformed);
    }
    let max = if pkt.is_v6() { MAX_UDP_PAYLOAD_V6 } else { MAX_UDP_PAYLOAD_V4 };
    if udp_len - 8 > max {
        return Err(DropReason::Oversized);
    }
    Ok(udp_len - 8)
}

impl UdpForwarder {
    pub fn new(
        nat: Arc<NatTable>,
        writer: LinkWriter,
        icmp: Arc<IcmpForwarder>,
        idle_timeout: Duration,
        stop: watch::Receiver<()>,
    ) -> Arc<Self> {
        Arc::new(Self {
            flows: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            nat,
            writer,
            icmp,
            idle_timeout,
            stop,
        })
    }

    pub fn flow_count(&self) -> usize {
        self.flows.lock().map(|f| f.len()).unwrap_or(0)
    }

    /// Forwards one guest datagram, creating its flow on first use. Called from dispatch;
    /// never blocks.
    pub fn handle(self: &Arc<Self>, frame: &[u8]) {
        let Some(pkt) = wire::parse_ip(frame) else {
            return;
        };
        if let Err(reason) = check_datagram(&pkt) {
            tracing::debug!(src = %pkt.src, dst = %pkt.dst, ?reason, "dropping udp datagram");
            return;
        }
        let (Some(guest), Some(remote)) = (pkt.src_socket(), pkt.dst_socket()) else {
            return;
        };
        let key = FlowKey::new(Proto::Udp, guest, remote);

        let Ok(mut flows) = self.flows.lock() else {
            return;
        };
        if let Some(slot) = flows.get(&key) {
            match slot.tx.try_send(frame.to_vec()) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::trace!(guest = %key.guest, remote = %key.remote, "udp flow queue full");
                    return;
                }
                // Expired between lookups: start over with a new flow.
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    flows.remove(&key);
                }
            }
        }

        let target = SocketAddr::new(translate_host_ip(remote.ip()), remote.port());
        self.nat.remove(&key);
        if let Err(e) = self.nat.insert(key, NatEntry::new(target)) {
            tracing::debug!(error = %e, "udp nat insert failed");
            return;
        }

        let (tx, rx) = mpsc::channel(FLOW_QUEUE);
        if tx.try_send(frame.to_vec()).is_err() {
            return;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        flows.insert(key, FlowSlot { id, tx });
        drop(flows);

        tracing::debug!(guest = %key.guest, remote = %key.remote, target = %target, "udp flow created");
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.run_flow(key, target, rx).await {
                tracing::debug!(guest = %key.guest, remote = %key.remote, error = %e, "udp flow failed");
            }
            this.finish_flow(&key, id);
        });
    }

    fn finish_flow(&self, key: &FlowKey, id: u64) {
        if let Ok(mut flows) = self.flows.lock()
            && flows.get(key).is_some_and(|s| s.id == id)
        {
            flows.remove(key);
            self.nat.remove(key);
        }
        tracing::debug!(guest = %key.guest, remote = %key.remote, "udp flow closed");
    }

    async fn run_flow(&self, key: FlowKey, target: SocketAddr, mut rx: mpsc::Receiver<Vec<u8>>) -> io::Result<()> {
        let sock = bind_flow_socket(key.guest.port(), target.is_ipv6()).await?;
        sock.connect(target).await?;
        if let Ok(local) = sock.local_addr() {
            self.nat.set_host_local(&key, local);
        }

        let mut stop = self.stop.clone();
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let mut last_frame: Vec<u8> = Vec::new();
        let mut ttl: Option<u8> = None;
        let mut deadline = Instant::now() + self.idle_timeout;

        loop {
            tokio::select! {
                _ = stop.changed() => return Ok(()),
                _ = tokio::time::sleep_until(deadline) => return Ok(()),
                frame = rx.recv() => {
                    let Some(frame) = frame else { return Ok(()) };
                    deadline = Instant::now() + self.idle_timeout;
                    let Some(pkt) = wire::parse_ip(&frame) else { continue };
                    if ttl != Some(pkt.ttl) {
                        set_hop_limit(&sock, pkt.ttl, target.is_ipv6());
                        ttl = Some(pkt.ttl);
                    }
                    let payload = &pkt.l4()[8..];
                    match sock.send(payload).await {
                        Ok(_) => {}
                        Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                            self.icmp.send_unreachable(Unreachable::Port, &frame).await;
                        }
                        Err(e) => tracing::debug!(guest = %key.guest, remote = %key.remote, error = %e, "udp send failed"),
                    }
                    last_frame = frame;
                }
                r = sock.recv(&mut buf) => match r {
                    Ok(n) => {
                        deadline = Instant::now() + self.idle_timeout;
                        let Some(reply) = wire::build_udp_frame(key.remote, key.guest, &buf[..n]) else { continue };
                        if let Err(e) = self.writer.send(&reply).await {
                            tracing::debug!(error = %e, "udp reply to guest failed");
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                        if !last_frame.is_empty() {
                            self.icmp.send_unreachable(Unreachable::Port, &last_frame).await;
                        }
                    }
                    Err(e) => return Err(e),
                },
            }
        }
    }
}

/// Binds on the guest's source port when the host has it free, else an ephemeral port.
async fn bind_flow_socket(port: u16, v6: bool) -> io::Result<UdpSocket> {
    let any: IpAddr = if v6 {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    } else {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    };
    match UdpSocket::bind(SocketAddr::new(any, port)).await {
        Ok(s) => Ok(s),
        Err(e) => {
            tracing::trace!(port, error = %e, "guest source port unavailable");
            UdpSocket::bind(SocketAddr::new(any, 0)).await
        }
    }
}

pub(crate) fn set_hop_limit(sock: &UdpSocket, ttl: u8, v6: bool) {
    let res = if v6 {
        nix::sys::socket::setsockopt(sock, nix::sys::socket::sockopt::Ipv6Ttl, &(ttl as libc::c_int))
            .map_err(io::Error::from)
    } else {
        sock.set_ttl(ttl as u32)
    };
    if let Err(e) = res {
        tracing::trace!(ttl, error = %e, "failed to apply ttl");
    }
}
