//! Datagram link to the guest, presented to smoltcp as an Ethernet device.
//!
//! Each datagram on the socket is one Ethernet frame, prefixed with a virtio-net header
//! when the link MTU is above the standard Ethernet MTU. Receive drains the socket in
//! batches into preallocated buffers; transmit queues frames in an outbox that is flushed
//! with `sendmmsg` where available.

use crate::error::NetError;
use crate::netconf::{BASE_MTU, ETH_HDR_LEN, PREFERRED_MTU, VIRTIO_NET_HDR_LEN};
use crate::wire::{self, IP_PROTO_TCP};
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::sys::socket::{
    AddressFamily, MsgFlags, SockFlag, SockProtocol, SockType, UnixAddr, setsockopt, socketpair, sockopt,
};
use smoltcp::phy::{self, Checksum, ChecksumCapabilities, Device, DeviceCapabilities, Medium};
use smoltcp::time::Instant;
use std::collections::VecDeque;
use std::io::{self, IoSlice};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;

/// Frames per receive or send syscall.
const BATCH: usize = 64;
/// Large outbox to absorb bursts. Frames beyond it are dropped rather than stalling RX.
const OUTBOX_MAX: usize = 16384;
const POOL_MAX: usize = 256;
/// Kernel caps this to its configured maximum.
const SOCKET_BUF_SIZE: usize = 128 * 1024 * 1024;

/// Segment sizes the guest uses when splitting our TSO frames, for a 1500 byte guest MTU.
const GSO_MSS_V4: u16 = 1460;
const GSO_MSS_V6: u16 = 1440;

pub const VIRTIO_NET_HDR_F_NEEDS_CSUM: u8 = 1;
pub const VIRTIO_NET_HDR_GSO_NONE: u8 = 0;
pub const VIRTIO_NET_HDR_GSO_TCPV4: u8 = 1;
pub const VIRTIO_NET_HDR_GSO_TCPV6: u8 = 4;

/// Link sizing derived from the MTU the guest transport supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkParams {
    pub link_mtu: usize,
    /// IP MTU advertised to the stack.
    pub mtu: usize,
    pub vnet_hdr: bool,
    /// Zero when segmentation offload is off.
    pub gso_max_size: usize,
}

impl LinkParams {
    pub fn new(link_mtu: usize) -> Self {
        let link_mtu = link_mtu.clamp(576, PREFERRED_MTU);
        if link_mtu > BASE_MTU {
            // Room for the virtio-net header and a VLAN tag.
            let mtu = link_mtu - (VIRTIO_NET_HDR_LEN + 8);
            Self {
                link_mtu,
                mtu,
                vnet_hdr: true,
                gso_max_size: mtu,
            }
        } else {
            Self {
                link_mtu,
                mtu: link_mtu,
                vnet_hdr: false,
                gso_max_size: 0,
            }
        }
    }

    pub fn header_len(&self) -> usize {
        if self.vnet_hdr { VIRTIO_NET_HDR_LEN } else { 0 }
    }

    fn rx_buf_len(&self) -> usize {
        if self.vnet_hdr {
            VIRTIO_NET_HDR_LEN + ETH_HDR_LEN + PREFERRED_MTU
        } else {
            ETH_HDR_LEN + self.mtu + 4
        }
    }

    pub fn capabilities(&self) -> DeviceCapabilities {
        let mut checksum = ChecksumCapabilities::default();
        if self.vnet_hdr {
            // Finished by the guest from the partial sum we leave in the header.
            checksum.tcp = Checksum::None;
        } else {
            checksum.tcp = Checksum::Tx;
        }
        checksum.udp = Checksum::Tx;

        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ethernet;
        caps.max_transmission_unit = self.mtu + ETH_HDR_LEN;
        caps.max_burst_size = Some(BATCH);
        caps.checksum = checksum;
        caps
    }
}

/// The 10-byte legacy virtio-net header. Fields are little-endian on every supported host.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VirtioNetHdr {
    pub flags: u8,
    pub gso_type: u8,
    pub hdr_len: u16,
    pub gso_size: u16,
    pub csum_start: u16,
    pub csum_offset: u16,
}

impl VirtioNetHdr {
    pub fn to_bytes(&self) -> [u8; VIRTIO_NET_HDR_LEN] {
        let mut b = [0u8; VIRTIO_NET_HDR_LEN];
        b[0] = self.flags;
        b[1] = self.gso_type;
        b[2..4].copy_from_slice(&self.hdr_len.to_le_bytes());
        b[4..6].copy_from_slice(&self.gso_size.to_le_bytes());
        b[6..8].copy_from_slice(&self.csum_start.to_le_bytes());
        b[8..10].copy_from_slice(&self.csum_offset.to_le_bytes());
        b
    }

    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        if b.len() < VIRTIO_NET_HDR_LEN {
            return None;
        }
        Some(Self {
            flags: b[0],
            gso_type: b[1],
            hdr_len: u16::from_le_bytes([b[2], b[3]]),
            gso_size: u16::from_le_bytes([b[4], b[5]]),
            csum_start: u16::from_le_bytes([b[6], b[7]]),
            csum_offset: u16::from_le_bytes([b[8], b[9]]),
        })
    }
}

/// Prepares an outgoing TCP frame for checksum and segmentation offload.
///
/// The TCP checksum field is replaced with the pseudo-header sum; the guest completes it.
/// Frames whose payload exceeds one guest segment are marked for TSO.
pub fn offload_header(frame: &mut [u8]) -> VirtioNetHdr {
    let Some(pkt) = wire::parse_ip(frame) else {
        return VirtioNetHdr::default();
    };
    if pkt.proto != IP_PROTO_TCP || pkt.fragmented || pkt.l4().len() < 20 {
        return VirtioNetHdr::default();
    }
    let csum_start = pkt.ip_offset + pkt.l4_offset;
    let tcp_len = pkt.l4().len();
    let doff = (pkt.l4()[12] >> 4) as usize * 4;
    let v6 = pkt.is_v6();
    let partial = wire::partial_l4_checksum(pkt.src, pkt.dst, IP_PROTO_TCP, tcp_len);

    frame[csum_start + 16..csum_start + 18].copy_from_slice(&partial.to_be_bytes());
    let mut hdr = VirtioNetHdr {
        flags: VIRTIO_NET_HDR_F_NEEDS_CSUM,
        csum_start: csum_start as u16,
        csum_offset: 16,
        ..Default::default()
    };

    let mss = if v6 { GSO_MSS_V6 } else { GSO_MSS_V4 };
    if tcp_len.saturating_sub(doff) > mss as usize {
        hdr.gso_type = if v6 {
            VIRTIO_NET_HDR_GSO_TCPV6
        } else {
            VIRTIO_NET_HDR_GSO_TCPV4
        };
        hdr.gso_size = mss;
        hdr.hdr_len = (csum_start + doff) as u16;
    }
    hdr
}

#[cfg(target_os = "linux")]
const PAIR_FLAGS: SockFlag = SockFlag::SOCK_CLOEXEC;
#[cfg(not(target_os = "linux"))]
const PAIR_FLAGS: SockFlag = SockFlag::empty();

/// Creates the connected datagram pair. The first end is driven by the link, the second
/// goes to the guest transport.
pub fn unixgram_pair() -> Result<(OwnedFd, OwnedFd), NetError> {
    let (host, guest) = socketpair(AddressFamily::Unix, SockType::Datagram, None::<SockProtocol>, PAIR_FLAGS)
        .map_err(|e| NetError::Setup(format!("socketpair: {}", e)))?;

    for fd in [&host, &guest] {
        // Best effort: the kernel may cap or refuse large buffers.
        if let Err(e) = setsockopt(fd, sockopt::SndBuf, &SOCKET_BUF_SIZE) {
            tracing::debug!(error = %e, "failed to raise SO_SNDBUF");
        }
        if let Err(e) = setsockopt(fd, sockopt::RcvBuf, &SOCKET_BUF_SIZE) {
            tracing::debug!(error = %e, "failed to raise SO_RCVBUF");
        }
    }

    fcntl(host.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
        .map_err(|e| NetError::Setup(format!("set nonblocking: {}", e)))?;
    Ok((host, guest))
}

/// Errors after which the guest end is gone for good.
pub fn is_link_down(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

/// Preallocated receive batch. Each slot records whether the frame goes to smoltcp.
struct RxBatch {
    bufs: Vec<Vec<u8>>,
    lens: Vec<usize>,
    pass: Vec<bool>,
    count: usize,
    cursor: usize,
    offset: usize,
}

impl RxBatch {
    fn new(params: &LinkParams) -> Self {
        Self {
            bufs: (0..BATCH).map(|_| vec![0u8; params.rx_buf_len()]).collect(),
            lens: vec![0; BATCH],
            pass: vec![false; BATCH],
            count: 0,
            cursor: 0,
            offset: params.header_len(),
        }
    }

    fn frame(&self, i: usize) -> &[u8] {
        &self.bufs[i][self.offset..self.lens[i]]
    }

    fn next_pass(&mut self) -> Option<&[u8]> {
        while self.cursor < self.count {
            let i = self.cursor;
            self.cursor += 1;
            if self.pass[i] {
                self.pass[i] = false;
                return Some(self.frame(i));
            }
        }
        None
    }
}

struct TxQueue {
    outbox: VecDeque<Vec<u8>>,
    pool: Vec<Vec<u8>>,
    offset: usize,
}

impl TxQueue {
    fn buffer(&mut self, len: usize) -> Vec<u8> {
        let mut buf = self.pool.pop().unwrap_or_default();
        buf.clear();
        buf.resize(self.offset + len, 0);
        buf
    }

    /// Fills in the virtio-net header and queues the frame.
    fn push(&mut self, mut buf: Vec<u8>) {
        if self.offset > 0 {
            let hdr = offload_header(&mut buf[self.offset..]);
            buf[..self.offset].copy_from_slice(&hdr.to_bytes());
        }
        if self.outbox.len() < OUTBOX_MAX {
            self.outbox.push_back(buf);
        } else {
            tracing::trace!("outbox full, dropping frame");
        }
    }

    fn recycle(&mut self, buf: Vec<u8>) {
        if self.pool.len() < POOL_MAX {
            self.pool.push(buf);
        }
    }
}

/// The host end of the guest link. Owned by the dispatch task.
pub struct Link {
    fd: Arc<AsyncFd<OwnedFd>>,
    params: LinkParams,
    rx: RxBatch,
    inject: VecDeque<Vec<u8>>,
    tx: TxQueue,
}

impl Link {
    /// Registers `fd` with the reactor. Must run inside a tokio runtime.
    pub fn new(fd: OwnedFd, params: LinkParams) -> io::Result<Self> {
        Ok(Self {
            fd: Arc::new(AsyncFd::new(fd)?),
            rx: RxBatch::new(&params),
            inject: VecDeque::new(),
            tx: TxQueue {
                outbox: VecDeque::with_capacity(2048),
                pool: Vec::with_capacity(POOL_MAX),
                offset: params.header_len(),
            },
            params,
        })
    }

    pub fn params(&self) -> &LinkParams {
        &self.params
    }

    pub fn fd(&self) -> &Arc<AsyncFd<OwnedFd>> {
        &self.fd
    }

    pub fn writer(&self) -> LinkWriter {
        LinkWriter {
            fd: self.fd.clone(),
            vnet_hdr: self.params.vnet_hdr,
        }
    }

    /// Drains up to one batch of frames from the guest.
    ///
    /// Returns `WouldBlock` when nothing is pending, and `UnexpectedEof` when the guest
    /// end closed.
    pub fn recv_batch(&mut self) -> io::Result<usize> {
        self.rx.count = 0;
        self.rx.cursor = 0;
        let fd = self.fd.get_ref().as_raw_fd();
        let n = recv_frames(fd, &mut self.rx.bufs, &mut self.rx.lens)?;

        let min = self.rx.offset + ETH_HDR_LEN;
        let mut eof = true;
        for i in 0..n {
            if self.rx.lens[i] > 0 {
                eof = false;
            }
            // Undersized frames are never passed on.
            self.rx.pass[i] = self.rx.lens[i] >= min;
        }
        if eof {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
        }
        self.rx.count = n;
        Ok(n)
    }

    /// Frames of the current batch, for classification. Undersized frames are skipped.
    pub fn rx_len(&self) -> usize {
        self.rx.count
    }

    pub fn rx_frame_mut(&mut self, i: usize) -> Option<&mut [u8]> {
        if i >= self.rx.count || !self.rx.pass[i] {
            return None;
        }
        let (offset, len) = (self.rx.offset, self.rx.lens[i]);
        Some(&mut self.rx.bufs[i][offset..len])
    }

    /// Hands a classified frame to smoltcp (`true`) or consumes it (`false`).
    pub fn set_pass(&mut self, i: usize, pass: bool) {
        if i < self.rx.count {
            self.rx.pass[i] = pass;
        }
    }

    /// Queues a frame for smoltcp ahead of the current batch.
    pub fn inject(&mut self, frame: Vec<u8>) {
        self.inject.push_back(frame);
    }

    pub fn has_injected(&self) -> bool {
        !self.inject.is_empty()
    }

    pub fn has_pending_rx(&self) -> bool {
        !self.inject.is_empty() || self.rx.pass[self.rx.cursor..self.rx.count].contains(&true)
    }

    /// Queues a complete Ethernet frame for the guest.
    pub fn queue_frame(&mut self, frame: &[u8]) {
        let mut buf = self.tx.buffer(frame.len());
        let off = self.tx.offset;
        buf[off..].copy_from_slice(frame);
        self.tx.push(buf);
    }

    pub fn outbox_len(&self) -> usize {
        self.tx.outbox.len()
    }

    /// Sends queued frames. Returns `WouldBlock` while frames remain.
    pub fn flush_outbox(&mut self) -> io::Result<()> {
        let fd = self.fd.get_ref().as_raw_fd();
        flush_outbox_batched(fd, &mut self.tx)
    }
}

impl Device for Link {
    type RxToken<'a>
        = RxToken<'a>
    where
        Self: 'a;
    type TxToken<'a>
        = TxToken<'a>
    where
        Self: 'a;

    fn receive(&mut self, _timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let Link { rx, inject, tx, .. } = self;
        let frame = match inject.pop_front() {
            Some(f) => RxFrame::Owned(f),
            None => RxFrame::Borrowed(rx.next_pass()?),
        };
        Some((RxToken { frame }, TxToken { tx }))
    }

    fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
        if self.tx.outbox.len() >= OUTBOX_MAX {
            return None;
        }
        Some(TxToken { tx: &mut self.tx })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        self.params.capabilities()
    }
}

enum RxFrame<'a> {
    Owned(Vec<u8>),
    Borrowed(&'a [u8]),
}

pub struct RxToken<'a> {
    frame: RxFrame<'a>,
}

impl phy::RxToken for RxToken<'_> {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        match self.frame {
            RxFrame::Owned(buf) => f(&buf),
            RxFrame::Borrowed(buf) => f(buf),
        }
    }
}

pub struct TxToken<'a> {
    tx: &'a mut TxQueue,
}

impl phy::TxToken for TxToken<'_> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buf = self.tx.buffer(len);
        let off = self.tx.offset;
        let r = f(&mut buf[off..]);
        self.tx.push(buf);
        r
    }
}

/// Shared sending handle for tasks outside dispatch.
#[derive(Clone)]
pub struct LinkWriter {
    fd: Arc<AsyncFd<OwnedFd>>,
    vnet_hdr: bool,
}

impl LinkWriter {
    /// Sends one complete Ethernet frame, waiting for socket space.
    pub async fn send(&self, frame: &[u8]) -> io::Result<()> {
        let hdr = VirtioNetHdr::default().to_bytes();
        self.fd
            .async_io(Interest::WRITABLE, |fd| {
                let iov_hdr = [IoSlice::new(&hdr), IoSlice::new(frame)];
                let iov_plain = [IoSlice::new(frame)];
                let iov: &[IoSlice<'_>] = if self.vnet_hdr { &iov_hdr } else { &iov_plain };
                nix::sys::socket::sendmsg::<UnixAddr>(fd.as_raw_fd(), iov, &[], MsgFlags::MSG_DONTWAIT, None)
                    .map(|_| ())
                    .map_err(io::Error::from)
            })
            .await
    }
}

#[cfg(target_os = "linux")]
fn recv_frames(fd: RawFd, bufs: &mut [Vec<u8>], lens: &mut [usize]) -> io::Result<usize> {
    let batch = bufs.len().min(BATCH);
    // SAFETY: zeroed iovec/mmsghdr arrays are valid initial states.
    let mut iovecs: [libc::iovec; BATCH] = unsafe { std::mem::zeroed() };
    let mut msghdrs: [libc::mmsghdr; BATCH] = unsafe { std::mem::zeroed() };
    for (i, buf) in bufs.iter_mut().take(batch).enumerate() {
        iovecs[i] = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut _,
            iov_len: buf.len(),
        };
        msghdrs[i].msg_hdr.msg_iov = &mut iovecs[i];
        msghdrs[i].msg_hdr.msg_iovlen = 1;
    }

    loop {
        // SAFETY: every msghdr points at a live buffer of the advertised length.
        let n = unsafe {
            libc::recvmmsg(
                fd,
                msghdrs.as_mut_ptr(),
                batch as _,
                libc::MSG_DONTWAIT as _,
                std::ptr::null_mut(),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        let n = n as usize;
        for i in 0..n {
            lens[i] = msghdrs[i].msg_len as usize;
        }
        return Ok(n);
    }
}

#[cfg(not(target_os = "linux"))]
fn recv_frames(fd: RawFd, bufs: &mut [Vec<u8>], lens: &mut [usize]) -> io::Result<usize> {
    let mut n = 0;
    while n < bufs.len() {
        let buf = &mut bufs[n];
        // SAFETY: buf is a live, writable buffer of buf.len() bytes.
        let rc = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut _, buf.len(), libc::MSG_DONTWAIT) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock if n > 0 => break,
                _ => return Err(err),
            }
        }
        lens[n] = rc as usize;
        n += 1;
        if rc == 0 {
            break;
        }
    }
    Ok(n)
}

#[cfg(target_os = "linux")]
fn flush_outbox_batched(fd: RawFd, tx: &mut TxQueue) -> io::Result<()> {
    while !tx.outbox.is_empty() {
        let batch_size = tx.outbox.len().min(BATCH);

        // SAFETY: zeroed iovec/mmsghdr arrays are valid initial states.
        let mut iovecs: [libc::iovec; BATCH] = unsafe { std::mem::zeroed() };
        let mut msghdrs: [libc::mmsghdr; BATCH] = unsafe { std::mem::zeroed() };

        for (i, pkt) in tx.outbox.iter().take(batch_size).enumerate() {
            iovecs[i] = libc::iovec {
                iov_base: pkt.as_ptr() as *mut _,
                iov_len: pkt.len(),
            };
            msghdrs[i].msg_hdr.msg_iov = &mut iovecs[i];
            msghdrs[i].msg_hdr.msg_iovlen = 1;
        }

        // SAFETY: every msghdr points at a live outbox buffer.
        let sent = unsafe { libc::sendmmsg(fd, msghdrs.as_mut_ptr(), batch_size as _, libc::MSG_DONTWAIT as _) };

        if sent < 0 {
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => return Err(err),
                _ if is_link_down(&err) => return Err(err),
                _ => {
                    // Drop the offending frame so one bad packet cannot wedge the queue.
                    tracing::debug!(error = %err, "sendmmsg failed");
                    if let Some(buf) = tx.outbox.pop_front() {
                        tx.recycle(buf);
                    }
                    continue;
                }
            }
        }

        for _ in 0..sent {
            if let Some(buf) = tx.outbox.pop_front() {
                tx.recycle(buf);
            }
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn flush_outbox_batched(fd: RawFd, tx: &mut TxQueue) -> io::Result<()> {
    // No sendmmsg here; send one datagram at a time.
    while let Some(pkt) = tx.outbox.front() {
        // SAFETY: pkt is a live buffer of pkt.len() bytes.
        let rc = unsafe { libc::send(fd, pkt.as_ptr() as *const _, pkt.len(), libc::MSG_DONTWAIT) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => return Err(err),
                _ if is_link_down(&err) => return Err(err),
                _ => tracing::debug!(error = %err, "send failed"),
            }
        }
        if let Some(buf) = tx.outbox.pop_front() {
            tx.recycle(buf);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{TCP_ACK, build_tcp_frame, checksum, l4_checksum, parse_ip};
    use smoltcp::phy::{RxToken as _, TxToken as _};
    use std::net::SocketAddr;

    fn guest_recv(fd: &OwnedFd) -> Vec<u8> {
        let mut buf = vec![0u8; 70000];
        let n = nix::sys::socket::recv(fd.as_raw_fd(), &mut buf, MsgFlags::empty()).unwrap();
        buf.truncate(n);
        buf
    }

    fn guest_send(fd: &OwnedFd, data: &[u8]) {
        nix::sys::socket::send(fd.as_raw_fd(), data, MsgFlags::empty()).unwrap();
    }

    fn tcp_frame(payload: usize) -> Vec<u8> {
        let src: SocketAddr = "1.1.1.1:443".parse().unwrap();
        let dst: SocketAddr = "0.250.250.2:40000".parse().unwrap();
        build_tcp_frame(src, dst, 1, 1, TCP_ACK, &[], &vec![7u8; payload]).unwrap()
    }

    #[test]
    fn test_standard_mtu_disables_offload() {
        let p = LinkParams::new(1500);
        assert!(!p.vnet_hdr);
        assert_eq!(p.mtu, 1500);
        assert_eq!(p.gso_max_size, 0);
        assert_eq!(p.header_len(), 0);
        assert_eq!(p.capabilities().ip_mtu(), 1500);
    }

    #[test]
    fn test_large_mtu_subtracts_header_once() {
        let p = LinkParams::new(65535);
        assert!(p.vnet_hdr);
        assert_eq!(p.mtu, 65535 - 18);
        assert_eq!(p.gso_max_size, p.mtu);
        assert_eq!(p.capabilities().ip_mtu(), p.mtu);
        assert_eq!(LinkParams::new(p.link_mtu), p);
    }

    #[test]
    fn test_offload_marks_large_tcp_for_tso() {
        let mut frame = tcp_frame(4000);
        let hdr = offload_header(&mut frame);
        assert_eq!(hdr.flags, VIRTIO_NET_HDR_F_NEEDS_CSUM);
        assert_eq!(hdr.gso_type, VIRTIO_NET_HDR_GSO_TCPV4);
        assert_eq!(hdr.gso_size, GSO_MSS_V4);
        assert_eq!(hdr.csum_start, 34);
        assert_eq!(hdr.hdr_len, 54);
        assert_eq!(VirtioNetHdr::from_bytes(&hdr.to_bytes()), Some(hdr));

        // Completing the partial sum over the segment yields the real checksum.
        let pkt = parse_ip(&frame).unwrap();
        let mut seg = pkt.l4().to_vec();
        let finished = checksum(&seg);
        seg[16..18].copy_from_slice(&[0, 0]);
        assert_eq!(finished, l4_checksum(pkt.src, pkt.dst, IP_PROTO_TCP, &seg));
    }

    #[test]
    fn test_offload_small_tcp_has_no_gso() {
        let mut frame = tcp_frame(100);
        let hdr = offload_header(&mut frame);
        assert_eq!(hdr.flags, VIRTIO_NET_HDR_F_NEEDS_CSUM);
        assert_eq!(hdr.gso_type, VIRTIO_NET_HDR_GSO_NONE);
        assert_eq!(hdr.gso_size, 0);
    }

    #[tokio::test]
    async fn test_batch_receive_and_flush() {
        let (host, guest) = unixgram_pair().unwrap();
        let mut link = Link::new(host, LinkParams::new(1500)).unwrap();

        assert_eq!(link.recv_batch().unwrap_err().kind(), io::ErrorKind::WouldBlock);

        guest_send(&guest, &tcp_frame(10));
        guest_send(&guest, &[1, 2, 3]);
        guest_send(&guest, &tcp_frame(20));
        assert_eq!(link.recv_batch().unwrap(), 3);
        assert!(link.rx_frame_mut(1).is_none());
        link.set_pass(0, false);

        let (rx, _tx) = link.receive(Instant::from_millis(0)).unwrap();
        let len = rx.consume(|f| f.len());
        assert_eq!(len, tcp_frame(20).len());
        assert!(link.receive(Instant::from_millis(0)).is_none());

        link.inject(vec![9u8; 60]);
        let (rx, _tx) = link.receive(Instant::from_millis(0)).unwrap();
        assert_eq!(rx.consume(|f| f[0]), 9);

        let tx = link.transmit(Instant::from_millis(0)).unwrap();
        tx.consume(42, |buf| buf.fill(5));
        link.queue_frame(&[6u8; 42]);
        assert_eq!(link.outbox_len(), 2);
        link.flush_outbox().unwrap();
        assert_eq!(link.outbox_len(), 0);
        assert_eq!(guest_recv(&guest), vec![5u8; 42]);
        assert_eq!(guest_recv(&guest), vec![6u8; 42]);
    }

    #[tokio::test]
    async fn test_vnet_header_added_and_stripped() {
        let (host, guest) = unixgram_pair().unwrap();
        let mut link = Link::new(host, LinkParams::new(65535)).unwrap();

        let mut wire_frame = VirtioNetHdr::default().to_bytes().to_vec();
        wire_frame.extend_from_slice(&tcp_frame(10));
        guest_send(&guest, &wire_frame);
        assert_eq!(link.recv_batch().unwrap(), 1);
        assert_eq!(link.rx_frame_mut(0).unwrap().len(), tcp_frame(10).len());

        link.queue_frame(&tcp_frame(3000));
        link.flush_outbox().unwrap();
        let got = guest_recv(&guest);
        let hdr = VirtioNetHdr::from_bytes(&got).unwrap();
        assert_eq!(hdr.gso_type, VIRTIO_NET_HDR_GSO_TCPV4);
        assert_eq!(got.len(), VIRTIO_NET_HDR_LEN + tcp_frame(3000).len());

        link.writer().send(&[8u8; 60]).await.unwrap();
        let got = guest_recv(&guest);
        assert_eq!(&got[..VIRTIO_NET_HDR_LEN], &[0u8; VIRTIO_NET_HDR_LEN]);
        assert_eq!(&got[VIRTIO_NET_HDR_LEN..], &[8u8; 60]);
    }

    #[tokio::test]
    async fn test_peer_close_is_link_down() {
        let (host, guest) = unixgram_pair().unwrap();
        let mut link = Link::new(host, LinkParams::new(1500)).unwrap();
        drop(guest);
        link.queue_frame(&[0u8; 60]);
        let err = link.flush_outbox().unwrap_err();
        assert!(is_link_down(&err), "{err}");
    }
}
