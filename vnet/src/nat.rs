//! Flow table shared by the forwarders and host-originated dials.

use crate::error::NetError;
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;

/// Ports handed out for host-originated connections into the guest.
const NAT_PORT_FIRST: u16 = 49152;
const NAT_PORT_LAST: u16 = 65535;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Proto {
    Tcp,
    Udp,
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Proto::Tcp => f.write_str("tcp"),
            Proto::Udp => f.write_str("udp"),
        }
    }
}

/// A flow as the guest sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub proto: Proto,
    pub guest: SocketAddr,
    pub remote: SocketAddr,
}

impl FlowKey {
    pub fn new(proto: Proto, guest: SocketAddr, remote: SocketAddr) -> Self {
        Self { proto, guest, remote }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.proto, self.guest, self.remote)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NatEntry {
    /// Address actually dialed on the host.
    pub target: SocketAddr,
    /// Local address of the host socket, once bound.
    pub host_local: Option<SocketAddr>,
}

impl NatEntry {
    pub fn new(target: SocketAddr) -> Self {
        Self {
            target,
            host_local: None,
        }
    }
}

#[derive(Default)]
struct NatInner {
    flows: HashMap<FlowKey, NatEntry>,
    by_host: HashMap<(Proto, SocketAddr), FlowKey>,
    next_port: u16,
}

/// Live flows keyed by what the guest sees. A key is unique while live and reusable after
/// removal.
#[derive(Default)]
pub struct NatTable {
    inner: Mutex<NatInner>,
}

impl NatTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NatInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert(&self, key: FlowKey, entry: NatEntry) -> Result<(), NetError> {
        let mut inner = self.lock();
        if inner.flows.contains_key(&key) {
            return Err(NetError::DuplicateFlow(key.to_string()));
        }
        if let Some(local) = entry.host_local {
            inner.by_host.insert((key.proto, local), key);
        }
        inner.flows.insert(key, entry);
        Ok(())
    }

    pub fn remove(&self, key: &FlowKey) -> Option<NatEntry> {
        let mut inner = self.lock();
        let entry = inner.flows.remove(key)?;
        if let Some(local) = entry.host_local {
            inner.by_host.remove(&(key.proto, local));
        }
        Some(entry)
    }

    pub fn get(&self, key: &FlowKey) -> Option<NatEntry> {
        self.lock().flows.get(key).copied()
    }

    /// Records the host socket's local address for reverse lookups.
    pub fn set_host_local(&self, key: &FlowKey, local: SocketAddr) -> bool {
        let mut inner = self.lock();
        let Some(entry) = inner.flows.get_mut(key) else {
            return false;
        };
        let old = entry.host_local.replace(local);
        if let Some(old) = old {
            inner.by_host.remove(&(key.proto, old));
        }
        inner.by_host.insert((key.proto, local), *key);
        true
    }

    /// Flow owning a host-side local address.
    pub fn lookup_host(&self, proto: Proto, local: SocketAddr) -> Option<FlowKey> {
        self.lock().by_host.get(&(proto, local)).copied()
    }

    pub fn count(&self, proto: Proto) -> usize {
        self.lock().flows.keys().filter(|k| k.proto == proto).count()
    }

    /// Picks a source port for a connection from `src` to `guest` that no live flow uses.
    pub fn allocate_port(&self, proto: Proto, src: IpAddr, guest: SocketAddr) -> Result<u16, NetError> {
        let mut inner = self.lock();
        let span = (NAT_PORT_LAST - NAT_PORT_FIRST) as u32 + 1;
        if inner.next_port < NAT_PORT_FIRST {
            inner.next_port = NAT_PORT_FIRST;
        }
        for _ in 0..span {
            let port = inner.next_port;
            inner.next_port = if port == NAT_PORT_LAST { NAT_PORT_FIRST } else { port + 1 };
            let key = FlowKey::new(proto, guest, SocketAddr::new(src, port));
            if !inner.flows.contains_key(&key) {
                return Ok(port);
            }
        }
        Err(NetError::PortsExhausted)
    }
}
