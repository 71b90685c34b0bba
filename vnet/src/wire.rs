//! Ethernet frame utilities: parsing guest frames and building frames sent to the guest.

use crate::netconf::{ETH_HDR_LEN, GUEST_MAC_VNET, HOST_MAC_VNET};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_IPV6: u16 = 0x86dd;

pub const IP_PROTO_ICMP: u8 = 1;
pub const IP_PROTO_TCP: u8 = 6;
pub const IP_PROTO_UDP: u8 = 17;
pub const IP_PROTO_ICMPV6: u8 = 58;

const IPV6_EXT_HOP_BY_HOP: u8 = 0;
const IPV6_EXT_ROUTING: u8 = 43;
const IPV6_EXT_FRAGMENT: u8 = 44;
const IPV6_EXT_DEST_OPTS: u8 = 60;

pub const TCP_FIN: u8 = 0x01;
pub const TCP_SYN: u8 = 0x02;
pub const TCP_RST: u8 = 0x04;
pub const TCP_ACK: u8 = 0x10;

pub const ICMPV4_ECHO_REPLY: u8 = 0;
pub const ICMPV4_DEST_UNREACHABLE: u8 = 3;
pub const ICMPV4_ECHO_REQUEST: u8 = 8;
pub const ICMPV4_TIME_EXCEEDED: u8 = 11;
pub const ICMPV6_DEST_UNREACHABLE: u8 = 1;
pub const ICMPV6_PACKET_TOO_BIG: u8 = 2;
pub const ICMPV6_TIME_EXCEEDED: u8 = 3;
pub const ICMPV6_ECHO_REQUEST: u8 = 128;
pub const ICMPV6_ECHO_REPLY: u8 = 129;
pub const ICMPV6_NEIGHBOR_SOLICIT: u8 = 135;
pub const ICMPV6_NEIGHBOR_ADVERT: u8 = 136;

pub const NDP_FLAG_SOLICITED: u8 = 0x40;
pub const NDP_FLAG_OVERRIDE: u8 = 0x20;

/// Build an ethernet header.
pub fn build_eth_header(dst: &[u8; 6], src: &[u8; 6], ethertype: u16) -> [u8; 14] {
    let mut hdr = [0u8; 14];
    hdr[0..6].copy_from_slice(dst);
    hdr[6..12].copy_from_slice(src);
    hdr[12..14].copy_from_slice(&ethertype.to_be_bytes());
    hdr
}

pub fn ethertype(frame: &[u8]) -> Option<u16> {
    if frame.len() < ETH_HDR_LEN {
        return None;
    }
    Some(u16::from_be_bytes([frame[12], frame[13]]))
}

/// Calculate IP/ICMP checksum.
pub fn checksum(data: &[u8]) -> u16 {
    finalize_checksum(sum_be_words(data))
}

fn pseudo_header_sum(src: IpAddr, dst: IpAddr, proto: u8, len: usize) -> u64 {
    let mut sum = 0u64;
    match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            sum += sum_be_words(&s.octets());
            sum += sum_be_words(&d.octets());
        }
        (s, d) => {
            sum += sum_be_words(&to_v6(s).octets());
            sum += sum_be_words(&to_v6(d).octets());
        }
    }
    sum += proto as u64;
    sum += len as u64;
    sum
}

fn to_v6(ip: IpAddr) -> Ipv6Addr {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}

/// Calculate TCP/UDP/ICMPv6 checksum with pseudo-header.
pub fn l4_checksum(src: IpAddr, dst: IpAddr, proto: u8, data: &[u8]) -> u16 {
    finalize_checksum(pseudo_header_sum(src, dst, proto, data.len()) + sum_be_words(data))
}

/// Folded, uncomplemented pseudo-header sum, as expected by checksum offload.
pub fn partial_l4_checksum(src: IpAddr, dst: IpAddr, proto: u8, len: usize) -> u16 {
    !finalize_checksum(pseudo_header_sum(src, dst, proto, len))
}

#[inline]
fn finalize_checksum(mut sum: u64) -> u16 {
    // Fold carries into 16 bits.
    while (sum >> 16) != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Updates `cksum` after one 16-bit word of the covered data changed from `old` to `new`.
pub fn adjust_checksum(cksum: u16, old: u16, new: u16) -> u16 {
    finalize_checksum(!cksum as u64 + !old as u64 + new as u64)
}

/// Sum 16-bit big-endian words in `data` into a 64-bit accumulator.
#[inline]
fn sum_be_words(data: &[u8]) -> u64 {
    let mut sum = 0u64;
    let mut chunks = data.chunks_exact(8);
    for chunk in &mut chunks {
        let mut b = [0u8; 8];
        b.copy_from_slice(chunk);
        let x = u64::from_be_bytes(b);
        sum += (x >> 48) + ((x >> 32) & 0xffff) + ((x >> 16) & 0xffff) + (x & 0xffff);
    }
    let rest = chunks.remainder();
    let mut i = 0;
    while i + 1 < rest.len() {
        sum += u16::from_be_bytes([rest[i], rest[i + 1]]) as u64;
        i += 2;
    }
    // Odd trailing byte
    if i < rest.len() {
        sum += u16::from_be_bytes([rest[i], 0]) as u64;
    }
    sum
}

/// Build an IPv4 header.
pub fn build_ipv4_header(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, payload_len: usize, ttl: u8) -> [u8; 20] {
    let total_len = (20 + payload_len) as u16;
    let mut hdr = [0u8; 20];
    hdr[0] = 0x45; // version + IHL
    hdr[2..4].copy_from_slice(&total_len.to_be_bytes());
    hdr[6..8].copy_from_slice(&[0x40, 0]); // Don't fragment
    hdr[8] = ttl;
    hdr[9] = proto;
    hdr[12..16].copy_from_slice(&src.octets());
    hdr[16..20].copy_from_slice(&dst.octets());

    let cksum = checksum(&hdr);
    hdr[10..12].copy_from_slice(&cksum.to_be_bytes());
    hdr
}

/// Build an IPv6 header.
pub fn build_ipv6_header(src: Ipv6Addr, dst: Ipv6Addr, next_header: u8, payload_len: usize, hop_limit: u8) -> [u8; 40] {
    let mut hdr = [0u8; 40];
    hdr[0] = 0x60;
    hdr[4..6].copy_from_slice(&(payload_len as u16).to_be_bytes());
    hdr[6] = next_header;
    hdr[7] = hop_limit;
    hdr[8..24].copy_from_slice(&src.octets());
    hdr[24..40].copy_from_slice(&dst.octets());
    hdr
}

/// An IP packet located inside an Ethernet frame.
#[derive(Debug, Clone, Copy)]
pub struct IpPacket<'a> {
    pub src: IpAddr,
    pub dst: IpAddr,
    /// Transport protocol after any IPv6 extension headers.
    pub proto: u8,
    pub ttl: u8,
    pub fragmented: bool,
    /// Offset of the IP header within the frame.
    pub ip_offset: usize,
    /// Whole IP packet, trimmed to its declared length.
    pub ip: &'a [u8],
    /// Offset of the transport header inside `ip`.
    pub l4_offset: usize,
}

impl<'a> IpPacket<'a> {
    pub fn l4(&self) -> &'a [u8] {
        &self.ip[self.l4_offset..]
    }

    pub fn is_v6(&self) -> bool {
        self.src.is_ipv6()
    }

    /// Source and destination ports of a TCP or UDP packet.
    pub fn ports(&self) -> Option<(u16, u16)> {
        let l4 = self.l4();
        if l4.len() < 4 {
            return None;
        }
        Some((u16::from_be_bytes([l4[0], l4[1]]), u16::from_be_bytes([l4[2], l4[3]])))
    }

    pub fn src_socket(&self) -> Option<SocketAddr> {
        self.ports().map(|(s, _)| SocketAddr::new(self.src, s))
    }

    pub fn dst_socket(&self) -> Option<SocketAddr> {
        self.ports().map(|(_, d)| SocketAddr::new(self.dst, d))
    }
}

pub fn parse_ip(frame: &[u8]) -> Option<IpPacket<'_>> {
    match ethertype(frame)? {
        ETHERTYPE_IPV4 => parse_ipv4(frame),
        ETHERTYPE_IPV6 => parse_ipv6(frame),
        _ => None,
    }
}

fn parse_ipv4(frame: &[u8]) -> Option<IpPacket<'_>> {
    let p = &frame[ETH_HDR_LEN..];
    if p.len() < 20 || p[0] >> 4 != 4 {
        return None;
    }
    let ihl = (p[0] & 0x0f) as usize * 4;
    let total = u16::from_be_bytes([p[2], p[3]]) as usize;
    if ihl < 20 || total < ihl || p.len() < total {
        return None;
    }
    let frag = u16::from_be_bytes([p[6], p[7]]);
    let more_fragments = frag & 0x2000 != 0;
    let offset = frag & 0x1fff;
    Some(IpPacket {
        src: IpAddr::V4(Ipv4Addr::new(p[12], p[13], p[14], p[15])),
        dst: IpAddr::V4(Ipv4Addr::new(p[16], p[17], p[18], p[19])),
        proto: p[9],
        ttl: p[8],
        fragmented: more_fragments || offset != 0,
        ip_offset: ETH_HDR_LEN,
        ip: &p[..total],
        l4_offset: ihl,
    })
}

fn parse_ipv6(frame: &[u8]) -> Option<IpPacket<'_>> {
    let p = &frame[ETH_HDR_LEN..];
    if p.len() < 40 || p[0] >> 4 != 6 {
        return None;
    }
    let total = 40 + u16::from_be_bytes([p[4], p[5]]) as usize;
    if p.len() < total {
        return None;
    }
    let ip = &p[..total];
    let mut src = [0u8; 16];
    let mut dst = [0u8; 16];
    src.copy_from_slice(&ip[8..24]);
    dst.copy_from_slice(&ip[24..40]);

    let mut next = ip[6];
    let mut off = 40;
    let mut fragmented = false;
    loop {
        match next {
            IPV6_EXT_HOP_BY_HOP | IPV6_EXT_ROUTING | IPV6_EXT_DEST_OPTS => {
                if ip.len() < off + 8 {
                    return None;
                }
                next = ip[off];
                off += (ip[off + 1] as usize + 1) * 8;
            }
            IPV6_EXT_FRAGMENT => {
                if ip.len() < off + 8 {
                    return None;
                }
                fragmented = true;
                next = ip[off];
                off += 8;
            }
            _ => break,
        }
    }
    if off > ip.len() {
        return None;
    }

    Some(IpPacket {
        src: IpAddr::V6(Ipv6Addr::from(src)),
        dst: IpAddr::V6(Ipv6Addr::from(dst)),
        proto: next,
        ttl: ip[7],
        fragmented,
        ip_offset: ETH_HDR_LEN,
        ip,
        l4_offset: off,
    })
}

/// Wraps a transport payload in IP and Ethernet headers addressed to the guest.
pub fn build_ip_frame(src: IpAddr, dst: IpAddr, proto: u8, ttl: u8, l4: &[u8]) -> Option<Vec<u8>> {
    let mut frame = Vec::with_capacity(ETH_HDR_LEN + 40 + l4.len());
    match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            frame.extend_from_slice(&build_eth_header(&GUEST_MAC_VNET.0, &HOST_MAC_VNET.0, ETHERTYPE_IPV4));
            frame.extend_from_slice(&build_ipv4_header(s, d, proto, l4.len(), ttl));
        }
        (IpAddr::V6(s), IpAddr::V6(d)) => {
            frame.extend_from_slice(&build_eth_header(&GUEST_MAC_VNET.0, &HOST_MAC_VNET.0, ETHERTYPE_IPV6));
            frame.extend_from_slice(&build_ipv6_header(s, d, proto, l4.len(), ttl));
        }
        _ => return None,
    }
    frame.extend_from_slice(l4);
    Some(frame)
}

/// Build a UDP datagram frame to the guest.
pub fn build_udp_frame(src: SocketAddr, dst: SocketAddr, data: &[u8]) -> Option<Vec<u8>> {
    let udp_len = 8 + data.len();
    if udp_len > u16::MAX as usize {
        return None;
    }
    let mut udp = Vec::with_capacity(udp_len);
    udp.extend_from_slice(&src.port().to_be_bytes());
    udp.extend_from_slice(&dst.port().to_be_bytes());
    udp.extend_from_slice(&(udp_len as u16).to_be_bytes());
    udp.extend_from_slice(&[0, 0]);
    udp.extend_from_slice(data);

    let mut cksum = l4_checksum(src.ip(), dst.ip(), IP_PROTO_UDP, &udp);
    if cksum == 0 {
        cksum = 0xffff;
    }
    udp[6..8].copy_from_slice(&cksum.to_be_bytes());
    build_ip_frame(src.ip(), dst.ip(), IP_PROTO_UDP, 64, &udp)
}

/// Build a TCP segment frame to the guest.
pub fn build_tcp_frame(
    src: SocketAddr,
    dst: SocketAddr,
    seq: u32,
    ack: u32,
    flags: u8,
    options: &[u8],
    data: &[u8],
) -> Option<Vec<u8>> {
    debug_assert!(options.len() % 4 == 0);
    let tcp_len = 20 + options.len() + data.len();
    let mut tcp = Vec::with_capacity(tcp_len);
    tcp.extend_from_slice(&src.port().to_be_bytes());
    tcp.extend_from_slice(&dst.port().to_be_bytes());
    tcp.extend_from_slice(&seq.to_be_bytes());
    tcp.extend_from_slice(&ack.to_be_bytes());

    let doff_words = ((20 + options.len()) / 4) as u8;
    tcp.push(doff_words << 4);
    tcp.push(flags);
    let window: u16 = if flags & TCP_RST != 0 { 0 } else { u16::MAX };
    tcp.extend_from_slice(&window.to_be_bytes());
    tcp.extend_from_slice(&[0, 0]); // checksum placeholder
    tcp.extend_from_slice(&[0, 0]); // urgent pointer
    tcp.extend_from_slice(options);
    tcp.extend_from_slice(data);

    let cksum = l4_checksum(src.ip(), dst.ip(), IP_PROTO_TCP, &tcp);
    tcp[16..18].copy_from_slice(&cksum.to_be_bytes());
    tracing::trace!(seq, ack, flags, data_len = data.len(), "TCP tx");
    build_ip_frame(src.ip(), dst.ip(), IP_PROTO_TCP, 64, &tcp)
}

/// RST answering a guest SYN: the guest sees the remote refuse the connection.
pub fn build_tcp_rst_for_syn(syn: &IpPacket<'_>) -> Option<Vec<u8>> {
    let l4 = syn.l4();
    if l4.len() < 20 {
        return None;
    }
    let seq = u32::from_be_bytes([l4[4], l4[5], l4[6], l4[7]]);
    build_tcp_frame(
        syn.dst_socket()?,
        syn.src_socket()?,
        0,
        seq.wrapping_add(1),
        TCP_RST | TCP_ACK,
        &[],
        &[],
    )
}

/// Build an ICMP or ICMPv6 frame, filling in the checksum.
pub fn build_icmp_frame(src: IpAddr, dst: IpAddr, mut icmp: Vec<u8>) -> Option<Vec<u8>> {
    if icmp.len() < 4 {
        return None;
    }
    icmp[2..4].copy_from_slice(&[0, 0]);
    let (proto, cksum) = match (src, dst) {
        (IpAddr::V4(_), IpAddr::V4(_)) => (IP_PROTO_ICMP, checksum(&icmp)),
        (IpAddr::V6(_), IpAddr::V6(_)) => (IP_PROTO_ICMPV6, l4_checksum(src, dst, IP_PROTO_ICMPV6, &icmp)),
        _ => return None,
    };
    icmp[2..4].copy_from_slice(&cksum.to_be_bytes());
    build_ip_frame(src, dst, proto, 64, &icmp)
}

/// Reasons reported to the guest in a destination unreachable message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unreachable {
    Net,
    Host,
    Port,
}

impl Unreachable {
    pub fn code(&self, v6: bool) -> u8 {
        match (self, v6) {
            (Unreachable::Net, false) => 0,
            (Unreachable::Host, false) => 1,
            (Unreachable::Port, false) => 3,
            (Unreachable::Net, true) => 0,
            (Unreachable::Host, true) => 3,
            (Unreachable::Port, true) => 4,
        }
    }
}

/// Destination unreachable quoting `orig`, the offending IP packet sent by the guest.
pub fn build_icmp_unreachable(kind: Unreachable, src: IpAddr, orig: &IpPacket<'_>) -> Option<Vec<u8>> {
    let v6 = orig.is_v6();
    // Stay within the minimum MTU of each family.
    let max_quote = if v6 { 1280 - 40 - 8 } else { 576 - 20 - 8 };
    let quote = &orig.ip[..orig.ip.len().min(max_quote)];

    let mut icmp = Vec::with_capacity(8 + quote.len());
    icmp.push(if v6 { ICMPV6_DEST_UNREACHABLE } else { ICMPV4_DEST_UNREACHABLE });
    icmp.push(kind.code(v6));
    icmp.extend_from_slice(&[0; 6]);
    icmp.extend_from_slice(quote);
    build_icmp_frame(src, orig.src, icmp)
}

/// Build an ARP frame.
pub fn build_arp(
    operation: u16,
    eth_dst: &[u8; 6],
    sender_mac: &[u8; 6],
    sender_ip: Ipv4Addr,
    target_mac: &[u8; 6],
    target_ip: Ipv4Addr,
) -> Vec<u8> {
    let mut frame = Vec::with_capacity(14 + 28);
    frame.extend_from_slice(&build_eth_header(eth_dst, sender_mac, ETHERTYPE_ARP));
    let mut arp = [0u8; 28];
    arp[0..2].copy_from_slice(&[0, 1]); // hardware type: ethernet
    arp[2..4].copy_from_slice(&[0x08, 0]); // protocol type: IPv4
    arp[4] = 6;
    arp[5] = 4;
    arp[6..8].copy_from_slice(&operation.to_be_bytes());
    arp[8..14].copy_from_slice(sender_mac);
    arp[14..18].copy_from_slice(&sender_ip.octets());
    arp[18..24].copy_from_slice(target_mac);
    arp[24..28].copy_from_slice(&target_ip.octets());
    frame.extend_from_slice(&arp);
    frame
}

/// Build a neighbor advertisement carrying a target link-layer address option.
pub fn build_neighbor_advert(
    eth_dst: &[u8; 6],
    src_mac: &[u8; 6],
    src_ip: Ipv6Addr,
    dst_ip: Ipv6Addr,
    target: Ipv6Addr,
    flags: u8,
) -> Vec<u8> {
    let mut icmp = Vec::with_capacity(32);
    icmp.push(ICMPV6_NEIGHBOR_ADVERT);
    icmp.push(0);
    icmp.extend_from_slice(&[0, 0]);
    icmp.push(flags);
    icmp.extend_from_slice(&[0, 0, 0]);
    icmp.extend_from_slice(&target.octets());
    icmp.push(2); // target link-layer address
    icmp.push(1);
    icmp.extend_from_slice(src_mac);
    let cksum = l4_checksum(IpAddr::V6(src_ip), IpAddr::V6(dst_ip), IP_PROTO_ICMPV6, &icmp);
    icmp[2..4].copy_from_slice(&cksum.to_be_bytes());

    let mut frame = Vec::with_capacity(14 + 40 + icmp.len());
    frame.extend_from_slice(&build_eth_header(eth_dst, src_mac, ETHERTYPE_IPV6));
    // NDP requires a hop limit of 255.
    frame.extend_from_slice(&build_ipv6_header(src_ip, dst_ip, IP_PROTO_ICMPV6, icmp.len(), 255));
    frame.extend_from_slice(&icmp);
    frame
}

/// Target of a neighbor solicitation.
pub fn neighbor_solicit_target(pkt: &IpPacket<'_>) -> Option<Ipv6Addr> {
    if pkt.proto != IP_PROTO_ICMPV6 {
        return None;
    }
    let l4 = pkt.l4();
    if l4.len() < 24 || l4[0] != ICMPV6_NEIGHBOR_SOLICIT {
        return None;
    }
    let mut t = [0u8; 16];
    t.copy_from_slice(&l4[8..24]);
    Some(Ipv6Addr::from(t))
}

pub fn tcp_flags(l4: &[u8]) -> Option<u8> {
    l4.get(13).copied()
}

pub fn is_tcp_syn(pkt: &IpPacket<'_>) -> bool {
    pkt.proto == IP_PROTO_TCP
        && tcp_flags(pkt.l4()).is_some_and(|f| f & (TCP_SYN | TCP_ACK | TCP_RST) == TCP_SYN)
}

/// Replaces a SACK-permitted option with NOPs so the handshake never negotiates SACK.
/// Fixes the checksum when it changed anything. `ip_packet` is the whole IP packet.
pub fn strip_sack_permitted(ip_packet: &mut [u8], l4_offset: usize, src: IpAddr, dst: IpAddr) -> bool {
    let tcp = &mut ip_packet[l4_offset..];
    if tcp.len() < 20 {
        return false;
    }
    let doff = (tcp[12] >> 4) as usize * 4;
    if doff < 20 || doff > tcp.len() {
        return false;
    }

    let mut changed = false;
    let mut i = 20usize;
    while i < doff {
        match tcp[i] {
            0 => break, // EOL
            1 => i += 1,
            kind => {
                if i + 1 >= doff {
                    break;
                }
                let len = tcp[i + 1] as usize;
                if len < 2 || i + len > doff {
                    break;
                }
                if kind == 4 && len == 2 {
                    tcp[i] = 1;
                    tcp[i + 1] = 1;
                    changed = true;
                }
                i += len;
            }
        }
    }

    if changed {
        tcp[16..18].copy_from_slice(&[0, 0]);
        let cksum = l4_checksum(src, dst, IP_PROTO_TCP, tcp);
        tcp[16..18].copy_from_slice(&cksum.to_be_bytes());
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netconf::{GATEWAY_IP4, GATEWAY_IP6, GUEST_IP4, GUEST_IP6};

    fn sock(ip: &str, port: u16) -> SocketAddr {
        SocketAddr::new(ip.parse().unwrap(), port)
    }

    #[test]
    fn test_ipv4_header_checksum_verifies() {
        let hdr = build_ipv4_header(GATEWAY_IP4, GUEST_IP4, IP_PROTO_UDP, 8, 64);
        assert_eq!(checksum(&hdr), 0);
    }

    #[test]
    fn test_adjusted_checksum_matches_recomputed() {
        let mut msg = vec![ICMPV4_ECHO_REQUEST, 0, 0, 0, 0x12, 0x34, 0, 7, b'p', b'i', b'n', b'g'];
        let cksum = checksum(&msg);
        msg[2..4].copy_from_slice(&cksum.to_be_bytes());

        msg[6..8].copy_from_slice(&0xbeefu16.to_be_bytes());
        let adjusted = adjust_checksum(cksum, 7, 0xbeef);
        msg[2..4].copy_from_slice(&adjusted.to_be_bytes());
        assert_eq!(checksum(&msg), 0);
    }

    #[test]
    fn test_udp_frame_parses_back() {
        let frame = build_udp_frame(sock("1.1.1.1", 53), sock("0.250.250.2", 40000), b"hello").unwrap();
        let pkt = parse_ip(&frame).unwrap();
        assert_eq!(pkt.proto, IP_PROTO_UDP);
        assert_eq!(pkt.ports(), Some((53, 40000)));
        assert!(!pkt.fragmented);
        assert_eq!(l4_checksum(pkt.src, pkt.dst, IP_PROTO_UDP, pkt.l4()), 0);
        assert_eq!(&pkt.l4()[8..], b"hello");
    }

    #[test]
    fn test_ipv6_tcp_checksum_verifies() {
        let src = SocketAddr::new(IpAddr::V6(GATEWAY_IP6), 443);
        let dst = SocketAddr::new(IpAddr::V6(GUEST_IP6), 50000);
        let frame = build_tcp_frame(src, dst, 1, 2, TCP_ACK, &[], b"data").unwrap();
        let pkt = parse_ip(&frame).unwrap();
        assert!(pkt.is_v6());
        assert_eq!(l4_checksum(pkt.src, pkt.dst, IP_PROTO_TCP, pkt.l4()), 0);
    }

    #[test]
    fn test_strip_sack_permitted() {
        // MSS, SACK-permitted, NOP, window scale.
        let opts = [2, 4, 0x05, 0xb4, 4, 2, 1, 3, 3, 7, 1, 1];
        let mut frame = build_tcp_frame(
            sock("0.250.250.2", 40000),
            sock("1.1.1.1", 443),
            100,
            0,
            TCP_SYN,
            &opts,
            &[],
        )
        .unwrap();
        let (src, dst, l4_offset, ip_offset) = {
            let pkt = parse_ip(&frame).unwrap();
            assert!(is_tcp_syn(&pkt));
            (pkt.src, pkt.dst, pkt.l4_offset, pkt.ip_offset)
        };
        assert!(strip_sack_permitted(&mut frame[ip_offset..], l4_offset, src, dst));
        let pkt = parse_ip(&frame).unwrap();
        assert_eq!(&pkt.l4()[24..26], &[1, 1]);
        assert_eq!(l4_checksum(pkt.src, pkt.dst, IP_PROTO_TCP, pkt.l4()), 0);
        assert!(!strip_sack_permitted(&mut frame[ip_offset..], l4_offset, src, dst));
    }

    #[test]
    fn test_rst_for_syn() {
        let syn = build_tcp_frame(sock("0.250.250.2", 40000), sock("1.1.1.1", 443), 100, 0, TCP_SYN, &[], &[]).unwrap();
        let rst = build_tcp_rst_for_syn(&parse_ip(&syn).unwrap()).unwrap();
        let pkt = parse_ip(&rst).unwrap();
        assert_eq!(pkt.ports(), Some((443, 40000)));
        assert_eq!(tcp_flags(pkt.l4()), Some(TCP_RST | TCP_ACK));
        assert_eq!(&pkt.l4()[8..12], &101u32.to_be_bytes());
    }

    #[test]
    fn test_unreachable_codes_and_quote() {
        let udp = build_udp_frame(sock("0.250.250.2", 40000), sock("10.9.9.9", 9), b"x").unwrap();
        let orig = parse_ip(&udp).unwrap();
        let frame = build_icmp_unreachable(Unreachable::Port, orig.dst, &orig).unwrap();
        let pkt = parse_ip(&frame).unwrap();
        assert_eq!(pkt.dst, IpAddr::V4(GUEST_IP4));
        assert_eq!(pkt.l4()[0], ICMPV4_DEST_UNREACHABLE);
        assert_eq!(pkt.l4()[1], 3);
        assert_eq!(&pkt.l4()[8..], orig.ip);
        assert_eq!(checksum(pkt.l4()), 0);
        assert_eq!(Unreachable::Host.code(true), 3);
        assert_eq!(Unreachable::Port.code(true), 4);
    }

    #[test]
    fn test_ipv6_fragment_header_detected() {
        let mut payload = vec![IP_PROTO_UDP, 0, 0, 1, 0, 0, 0, 1];
        payload.extend_from_slice(&[0u8; 16]);
        let mut frame = build_eth_header(&HOST_MAC_VNET.0, &GUEST_MAC_VNET.0, ETHERTYPE_IPV6).to_vec();
        frame.extend_from_slice(&build_ipv6_header(GUEST_IP6, GATEWAY_IP6, IPV6_EXT_FRAGMENT, payload.len(), 64));
        frame.extend_from_slice(&payload);
        let pkt = parse_ip(&frame).unwrap();
        assert!(pkt.fragmented);
        assert_eq!(pkt.proto, IP_PROTO_UDP);
        assert_eq!(pkt.l4_offset, 48);
    }

    #[test]
    fn test_neighbor_advert_and_solicit() {
        let na = build_neighbor_advert(
            &HOST_MAC_VNET.0,
            &GUEST_MAC_VNET.0,
            GUEST_IP6,
            GATEWAY_IP6,
            GUEST_IP6,
            NDP_FLAG_OVERRIDE,
        );
        let pkt = parse_ip(&na).unwrap();
        assert_eq!(pkt.ttl, 255);
        assert_eq!(pkt.l4()[0], ICMPV6_NEIGHBOR_ADVERT);
        assert_eq!(l4_checksum(pkt.src, pkt.dst, IP_PROTO_ICMPV6, pkt.l4()), 0);
        assert!(neighbor_solicit_target(&pkt).is_none());
    }
}
