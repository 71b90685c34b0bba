//! Linux route source: `/proc/net/route`, `/proc/net/ipv6_route` and an rtnetlink
//! multicast socket for change events.

use crate::error::BridgeError;
use crate::prefix::{IpPrefix, Ipv4Prefix, Ipv6Prefix};
use crate::route::{RouteChange, RouteEntry, RouteFlags, RouteSource, RouteTable};
use nix::sys::socket::{
    AddressFamily, MsgFlags, NetlinkAddr, SockFlag, SockProtocol, SockType, bind, recv, socket,
};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;

const RTF_UP: u32 = 0x0001;
const RTF_GATEWAY: u32 = 0x0002;
const RTF_HOST: u32 = 0x0004;
const RTF_REJECT: u32 = 0x0200;
const RTF_LOCAL: u32 = 0x8000_0000;

const RTMGRP_IPV4_ROUTE: u32 = 0x40;
const RTMGRP_IPV6_ROUTE: u32 = 0x400;

/// Routing table reader backed by procfs.
#[derive(Debug, Clone)]
pub struct ProcRouteSource {
    route4: PathBuf,
    route6: PathBuf,
}

impl Default for ProcRouteSource {
    fn default() -> Self {
        Self::with_paths("/proc/net/route", "/proc/net/ipv6_route")
    }
}

impl ProcRouteSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_paths(route4: impl Into<PathBuf>, route6: impl Into<PathBuf>) -> Self {
        Self {
            route4: route4.into(),
            route6: route6.into(),
        }
    }
}

impl RouteSource for ProcRouteSource {
    fn routing_table(&self) -> Result<RouteTable, BridgeError> {
        let mut entries = match std::fs::read_to_string(&self.route4) {
            Ok(s) => parse_route4(&s)?,
            Err(e) => return Err(BridgeError::RouteTable(format!("{}: {}", self.route4.display(), e))),
        };
        // IPv6 may be disabled on the host.
        match std::fs::read_to_string(&self.route6) {
            Ok(s) => entries.extend(parse_route6(&s)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(BridgeError::RouteTable(format!("{}: {}", self.route6.display(), e))),
        }
        Ok(RouteTable::new(entries))
    }

    fn subscribe(&self) -> Result<mpsc::Receiver<RouteChange>, BridgeError> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| BridgeError::RouteTable(format!("no runtime for route events: {}", e)))?;

        let fd = socket(
            AddressFamily::Netlink,
            SockType::Raw,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            SockProtocol::NetlinkRoute,
        )?;
        bind(fd.as_raw_fd(), &NetlinkAddr::new(0, RTMGRP_IPV4_ROUTE | RTMGRP_IPV6_ROUTE))?;
        let fd = {
            let _guard = handle.enter();
            AsyncFd::new(fd)?
        };

        let (tx, rx) = mpsc::channel(16);
        handle.spawn(watch_netlink(fd, tx));
        Ok(rx)
    }
}

async fn watch_netlink(fd: AsyncFd<OwnedFd>, tx: mpsc::Sender<RouteChange>) {
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        let mut guard = tokio::select! {
            _ = tx.closed() => return,
            r = fd.readable() => match r {
                Ok(g) => g,
                Err(e) => {
                    tracing::warn!(error = %e, "route netlink socket failed");
                    return;
                }
            },
        };

        let mut changed = false;
        loop {
            match recv(fd.get_ref().as_raw_fd(), &mut buf, MsgFlags::MSG_DONTWAIT) {
                Ok(0) => break,
                Ok(_) => changed = true,
                Err(nix::errno::Errno::EAGAIN) => {
                    guard.clear_ready();
                    break;
                }
                Err(nix::errno::Errno::EINTR) => continue,
                // Overflow means we missed events; treat as a change.
                Err(nix::errno::Errno::ENOBUFS) => changed = true,
                Err(e) => {
                    tracing::warn!(error = %e, "route netlink recv failed");
                    return;
                }
            }
        }

        // A full channel already carries a pending change.
        if changed && tx.try_send(RouteChange).is_err() && tx.is_closed() {
            return;
        }
    }
}

fn bad(line: &str) -> BridgeError {
    BridgeError::RouteTable(format!("malformed route line: {}", line))
}

fn hex_u32(s: &str, line: &str) -> Result<u32, BridgeError> {
    u32::from_str_radix(s, 16).map_err(|_| bad(line))
}

/// Addresses in `/proc/net/route` are printed in host byte order.
fn proc_ipv4(s: &str, line: &str) -> Result<Ipv4Addr, BridgeError> {
    Ok(Ipv4Addr::from(hex_u32(s, line)?.to_ne_bytes()))
}

fn proc_ipv6(s: &str, line: &str) -> Result<Ipv6Addr, BridgeError> {
    if s.len() != 32 {
        return Err(bad(line));
    }
    let v = u128::from_str_radix(s, 16).map_err(|_| bad(line))?;
    Ok(Ipv6Addr::from(v))
}

fn classify(raw: u32, is_default: bool, is_host: bool) -> RouteFlags {
    // procfs carries no route origin, so nothing is marked STATIC here.
    let mut flags = RouteFlags::empty();
    if raw & RTF_GATEWAY != 0 {
        flags |= RouteFlags::GATEWAY;
    }
    if raw & RTF_HOST != 0 || is_host {
        flags |= RouteFlags::HOST;
    }
    if is_default {
        flags |= RouteFlags::GLOBAL;
    }
    flags
}

pub(crate) fn parse_route4(content: &str) -> Result<Vec<RouteEntry>, BridgeError> {
    let mut out = Vec::new();
    for line in content.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.is_empty() {
            continue;
        }
        if fields.len() < 8 {
            return Err(bad(line));
        }
        let flags = hex_u32(fields[3], line)?;
        if flags & RTF_UP == 0 || flags & RTF_REJECT != 0 {
            continue;
        }
        let dest = proc_ipv4(fields[1], line)?;
        let gateway = proc_ipv4(fields[2], line)?;
        let mask = proc_ipv4(fields[7], line)?;
        let len = u32::from(mask).count_ones() as u8;

        let prefix = Ipv4Prefix::new(dest, len)?;
        out.push(RouteEntry {
            destination: IpPrefix::V4(prefix),
            gateway: (!gateway.is_unspecified()).then_some(IpAddr::V4(gateway)),
            interface: fields[0].to_string(),
            flags: classify(flags, len == 0, len == 32),
        });
    }
    Ok(out)
}

pub(crate) fn parse_route6(content: &str) -> Result<Vec<RouteEntry>, BridgeError> {
    let mut out = Vec::new();
    for line in content.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.is_empty() {
            continue;
        }
        if fields.len() < 10 {
            return Err(bad(line));
        }
        let flags = hex_u32(fields[8], line)?;
        if flags & RTF_UP == 0 || flags & (RTF_REJECT | RTF_LOCAL) != 0 || fields[9] == "lo" {
            continue;
        }
        let dest = proc_ipv6(fields[0], line)?;
        let len = u8::from_str_radix(fields[1], 16).map_err(|_| bad(line))?;
        let gateway = proc_ipv6(fields[4], line)?;

        let prefix = Ipv6Prefix::new(dest, len)?;
        out.push(RouteEntry {
            destination: IpPrefix::V6(prefix),
            gateway: (!gateway.is_unspecified()).then_some(IpAddr::V6(gateway)),
            interface: fields[9].to_string(),
            flags: classify(flags, len == 0, len == 128),
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROUTE4: &str = "\
Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT
eth0\t00000000\t0100A8C0\t0003\t0\t0\t100\t00000000\t0\t0\t0
eth0\t0000A8C0\t00000000\t0001\t0\t0\t100\t00FFFFFF\t0\t0\t0
tun0\t0000A8C0\t0108000A\t0003\t0\t0\t0\t0000FFFF\t0\t0\t0
";

    const ROUTE6: &str = "\
fd07b51acc6600000000000000000000 40 00000000000000000000000000000000 00 00000000000000000000000000000000 00000100 00000001 00000000 00000001     eth0
00000000000000000000000000000001 80 00000000000000000000000000000000 00 00000000000000000000000000000000 00000000 00000002 00000000 80200001       lo
00000000000000000000000000000000 00 00000000000000000000000000000000 00 fe800000000000000000000000000001 00000400 00000001 00000000 00000003     eth0
";

    #[cfg(target_endian = "little")]
    #[test]
    fn test_parse_route4() {
        let entries = parse_route4(ROUTE4).unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries[0].flags.contains(RouteFlags::GLOBAL | RouteFlags::GATEWAY));
        assert_eq!(entries[1].destination.to_string(), "192.168.0.0/24");
        assert!(entries[1].gateway.is_none());
        assert_eq!(entries[2].destination.to_string(), "192.168.0.0/16");
        assert_eq!(entries[2].gateway, Some("10.0.8.1".parse().unwrap()));

        let table = RouteTable::new(entries);
        let bridge: Ipv4Prefix = "192.168.215.0/24".parse().unwrap();
        assert!(table.has_valid_route(bridge.into()));
    }

    #[test]
    fn test_parse_route6_skips_loopback() {
        let entries = parse_route6(ROUTE6).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].destination.to_string(), "fd07:b51a:cc66::/64");
        assert!(entries[1].flags.contains(RouteFlags::GLOBAL));
    }

    #[test]
    fn test_malformed_line_is_an_error() {
        assert!(parse_route4("header\neth0 zz\n").is_err());
    }

    #[test]
    fn test_routing_table_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let r4 = dir.path().join("route");
        std::fs::write(&r4, "Iface\tDestination\tGateway\tFlags\tRefCnt\tUse\tMetric\tMask\n").unwrap();
        let source = ProcRouteSource::with_paths(&r4, dir.path().join("missing"));
        assert!(source.routing_table().unwrap().is_empty());
    }
}
