//! Host forwards: listeners on the host whose connections are bridged into the guest.

use crate::error::NetError;
use crate::netconf::{GUEST_IP4, GUEST_IP6, gateway_for};
use crate::stack::StackHandle;
use async_trait::async_trait;
use nix::sys::socket::{setsockopt, sockopt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpSocket, UnixListener};
use tokio::sync::watch;

const LISTEN_BACKLOG: u32 = 1024;
const PRIVILEGED_PORTS: u16 = 1024;

/// Byte stream to or from the guest.
pub trait GuestStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> GuestStream for T {}

pub type BoxedStream = Box<dyn GuestStream>;

/// Opens streams to guest vsock ports.
#[async_trait]
pub trait VsockDialer: Send + Sync {
    async fn dial(&self, port: u32) -> io::Result<BoxedStream>;
}

/// One side of a forward.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Endpoint {
    /// `tcp:[addr:]port`. Without an address the host side listens on loopback and the
    /// guest side follows the family of the connecting peer.
    Tcp { addr: Option<IpAddr>, port: u16 },
    Unix(PathBuf),
    Vsock(u32),
}

impl FromStr for Endpoint {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || NetError::InvalidForwardSpec(s.to_string());
        let (kind, rest) = s.split_once(':').ok_or_else(invalid)?;
        match kind {
            "tcp" => {
                if let Ok(port) = rest.parse::<u16>() {
                    return Ok(Endpoint::Tcp { addr: None, port });
                }
                let addr: SocketAddr = rest.parse().map_err(|_| invalid())?;
                Ok(Endpoint::Tcp {
                    addr: Some(addr.ip()),
                    port: addr.port(),
                })
            }
            "unix" if !rest.is_empty() => Ok(Endpoint::Unix(PathBuf::from(rest))),
            "vsock" => Ok(Endpoint::Vsock(rest.parse().map_err(|_| invalid())?)),
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { addr: None, port } => write!(f, "tcp:{port}"),
            Endpoint::Tcp { addr: Some(ip), port } => write!(f, "tcp:{}", SocketAddr::new(*ip, *port)),
            Endpoint::Unix(p) => write!(f, "unix:{}", p.display()),
            Endpoint::Vsock(port) => write!(f, "vsock:{port}"),
        }
    }
}

impl TryFrom<String> for Endpoint {
    type Error = NetError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Endpoint> for String {
    fn from(e: Endpoint) -> Self {
        e.to_string()
    }
}

/// A host endpoint bridged to a guest endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardSpec {
    pub host: Endpoint,
    pub guest: Endpoint,
    /// Plumbing of the runtime itself: connections show the gateway as their source
    /// instead of the host's address.
    #[serde(default)]
    pub internal: bool,
}

impl ForwardSpec {
    pub fn new(host: &str, guest: &str) -> Result<Self, NetError> {
        let spec = Self {
            host: host.parse()?,
            guest: guest.parse()?,
            internal: false,
        };
        spec.validate()?;
        Ok(spec)
    }

    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    /// Identity of the forward: the host side as written.
    pub fn key(&self) -> String {
        self.host.to_string()
    }

    fn validate(&self) -> Result<(), NetError> {
        let ok_host = matches!(self.host, Endpoint::Tcp { .. } | Endpoint::Unix(_));
        let ok_guest = matches!(self.guest, Endpoint::Tcp { .. } | Endpoint::Vsock(_));
        if ok_host && ok_guest {
            Ok(())
        } else {
            Err(NetError::InvalidForwardSpec(format!("{} -> {}", self.host, self.guest)))
        }
    }
}

/// Ways into the guest available to forwards.
#[derive(Clone, Default)]
pub struct GuestDialers {
    pub stack: Option<StackHandle>,
    pub vsock: Option<Arc<dyn VsockDialer>>,
}

impl GuestDialers {
    async fn dial(&self, target: &Endpoint, peer: Option<SocketAddr>, internal: bool) -> Result<BoxedStream, NetError> {
        match target {
            Endpoint::Vsock(port) => {
                let dialer = self
                    .vsock
                    .as_ref()
                    .ok_or_else(|| NetError::GuestUnreachable("vsock unavailable".into()))?;
                Ok(dialer.dial(*port).await?)
            }
            Endpoint::Tcp { addr, port } => {
                let stack = self.stack.as_ref().ok_or(NetError::Closed)?;
                let v6 = peer.is_some_and(|p| match p.ip() {
                    IpAddr::V6(ip) => ip.to_ipv4_mapped().is_none(),
                    IpAddr::V4(_) => false,
                });
                let guest_ip = addr.unwrap_or(if v6 { IpAddr::V6(GUEST_IP6) } else { IpAddr::V4(GUEST_IP4) });
                let src = spoofed_source(guest_ip, internal || peer.is_none());
                let stream = stack.dial_guest(SocketAddr::new(guest_ip, *port), src).await?;
                Ok(Box::new(stream))
            }
            Endpoint::Unix(_) => Err(NetError::InvalidForwardSpec(target.to_string())),
        }
    }
}

/// Source address guest connections appear to come from. Loopback cannot be used, so
/// this is the host's default address, or the gateway without one.
fn spoofed_source(guest: IpAddr, internal: bool) -> IpAddr {
    if internal {
        return gateway_for(guest);
    }
    default_address(guest.is_ipv6()).unwrap_or_else(|| gateway_for(guest))
}

/// Address the host would use for internet traffic. Connecting a UDP socket sends nothing.
fn default_address(v6: bool) -> Option<IpAddr> {
    let (bind, remote): (SocketAddr, SocketAddr) = if v6 {
        (
            (Ipv6Addr::UNSPECIFIED, 0).into(),
            (Ipv6Addr::new(0x2001, 0x4860, 0x4860, 0, 0, 0, 0, 0x8888), 53).into(),
        )
    } else {
        ((Ipv4Addr::UNSPECIFIED, 0).into(), (Ipv4Addr::new(8, 8, 8, 8), 53).into())
    };
    let sock = std::net::UdpSocket::bind(bind).ok()?;
    sock.connect(remote).ok()?;
    let ip = sock.local_addr().ok()?.ip();
    (!ip.is_unspecified() && !ip.is_loopback()).then_some(ip)
}

/// Binds a TCP listener. Loopback on a privileged port binds the wildcard instead and
/// reports that peers must be checked for loopback.
fn listen_tcp(addr: SocketAddr) -> io::Result<(TcpListener, bool)> {
    let privileged = addr.ip().is_loopback() && addr.port() != 0 && addr.port() < PRIVILEGED_PORTS;
    let (bind, sock) = match (addr, privileged) {
        (SocketAddr::V4(_), true) => ((Ipv4Addr::UNSPECIFIED, addr.port()).into(), TcpSocket::new_v4()?),
        (SocketAddr::V6(_), true) => {
            let sock = TcpSocket::new_v6()?;
            // Only v6 was asked for.
            setsockopt(&sock, sockopt::Ipv6V6Only, &true)?;
            ((Ipv6Addr::UNSPECIFIED, addr.port()).into(), sock)
        }
        (SocketAddr::V4(_), false) => (addr, TcpSocket::new_v4()?),
        (SocketAddr::V6(_), false) => (addr, TcpSocket::new_v6()?),
    };
    sock.set_reuseaddr(true)?;
    sock.bind(bind)?;
    Ok((sock.listen(LISTEN_BACKLOG)?, privileged))
}

/// Binds `path`, replacing a stale socket left there. Any other file is left alone.
fn listen_unix(path: &Path) -> io::Result<UnixListener> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            std::fs::remove_file(path)?;
            tracing::debug!(path = %path.display(), "removed stale socket");
        }
        Ok(_) => {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{} exists and is not a socket", path.display()),
            ));
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    UnixListener::bind(path)
}

enum Listener {
    Tcp { listener: TcpListener, require_loopback: bool },
    Unix(UnixListener),
}

/// A running forward. Closing stops the listener; connections already bridged keep going
/// until the Network closes.
pub struct HostForward {
    spec: ForwardSpec,
    local: Option<SocketAddr>,
    unix_path: Option<PathBuf>,
    stop_tx: Mutex<Option<watch::Sender<()>>>,
}

impl HostForward {
    /// Binds the host side and starts accepting. Must run inside a tokio runtime.
    pub fn start(spec: ForwardSpec, dialers: GuestDialers, net_stop: watch::Receiver<()>) -> Result<Self, NetError> {
        spec.validate()?;
        let (listener, local, unix_path) = match &spec.host {
            Endpoint::Tcp { addr, port } => {
                let addr = SocketAddr::new(addr.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST)), *port);
                let (listener, require_loopback) = listen_tcp(addr)?;
                let local = listener.local_addr()?;
                (Listener::Tcp { listener, require_loopback }, Some(local), None)
            }
            Endpoint::Unix(path) => (Listener::Unix(listen_unix(path)?), None, Some(path.clone())),
            Endpoint::Vsock(_) => return Err(NetError::InvalidForwardSpec(spec.key())),
        };

        let (stop_tx, stop_rx) = watch::channel(());
        tokio::spawn(accept_loop(
            listener,
            spec.clone(),
            dialers,
            stop_rx,
            net_stop,
        ));
        tracing::info!(host = %spec.host, guest = %spec.guest, ?local, "Forward started");
        Ok(Self {
            spec,
            local,
            unix_path,
            stop_tx: Mutex::new(Some(stop_tx)),
        })
    }

    pub fn spec(&self) -> &ForwardSpec {
        &self.spec
    }

    /// Port actually bound, which differs from the spec for `port 0`.
    pub fn tcp_port(&self) -> Option<u16> {
        self.local.map(|a| a.port())
    }

    /// Stops accepting. Idempotent.
    pub fn close(&self) -> Result<(), NetError> {
        let Some(tx) = self.stop_tx.lock().ok().and_then(|mut g| g.take()) else {
            return Ok(());
        };
        drop(tx);
        if let Some(path) = &self.unix_path {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        tracing::debug!(host = %self.spec.host, "Forward closed");
        Ok(())
    }
}

impl Drop for HostForward {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(host = %self.spec.host, error = %e, "failed to close forward");
        }
    }
}

async fn accept_loop(
    listener: Listener,
    spec: ForwardSpec,
    dialers: GuestDialers,
    mut stop: watch::Receiver<()>,
    mut net_stop: watch::Receiver<()>,
) {
    loop {
        let accepted: io::Result<(BoxedStream, Option<SocketAddr>)> = tokio::select! {
            _ = stop.changed() => return,
            _ = net_stop.changed() => return,
            res = accept(&listener) => res,
        };
        let (conn, peer) = match accepted {
            Ok(c) => c,
            Err(e) => {
                tracing::debug!(host = %spec.host, error = %e, "accept failed");
                continue;
            }
        };
        if let (Listener::Tcp { require_loopback: true, .. }, Some(peer)) = (&listener, peer) {
            if !peer.ip().is_loopback() {
                tracing::debug!(host = %spec.host, peer = %peer, "rejecting non-loopback peer");
                continue;
            }
        }

        let dialers = dialers.clone();
        let spec = spec.clone();
        let net_stop = net_stop.clone();
        tokio::spawn(async move {
            if let Err(e) = bridge_conn(conn, peer, &spec, &dialers, net_stop).await {
                tracing::debug!(host = %spec.host, guest = %spec.guest, error = %e, "forward connection failed");
            }
        });
    }
}

async fn accept(listener: &Listener) -> io::Result<(BoxedStream, Option<SocketAddr>)> {
    match listener {
        Listener::Tcp { listener, .. } => {
            let (stream, peer) = listener.accept().await?;
            let _ = stream.set_nodelay(true);
            Ok((Box::new(stream), Some(peer)))
        }
        Listener::Unix(listener) => {
            let (stream, _) = listener.accept().await?;
            Ok((Box::new(stream), None))
        }
    }
}

async fn bridge_conn(
    mut host: BoxedStream,
    peer: Option<SocketAddr>,
    spec: &ForwardSpec,
    dialers: &GuestDialers,
    mut net_stop: watch::Receiver<()>,
) -> Result<(), NetError> {
    let mut guest = dialers.dial(&spec.guest, peer, spec.internal).await?;
    tokio::select! {
        res = tokio::io::copy_bidirectional(&mut host, &mut guest) => {
            let (up, down) = res?;
            tracing::trace!(host = %spec.host, up, down, "forward connection done");
        }
        _ = net_stop.changed() => {}
    }
    Ok(())
}

/// Running forwards keyed by their host side.
#[derive(Default)]
pub struct ForwardTable {
    forwards: Mutex<HashMap<String, Arc<HostForward>>>,
}

impl ForwardTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(
        &self,
        spec: ForwardSpec,
        dialers: GuestDialers,
        net_stop: watch::Receiver<()>,
    ) -> Result<Arc<HostForward>, NetError> {
        let key = spec.key();
        let mut forwards = self.forwards.lock().map_err(|_| NetError::Closed)?;
        if forwards.contains_key(&key) {
            return Err(NetError::DuplicateForward(key));
        }
        let fwd = Arc::new(HostForward::start(spec, dialers, net_stop)?);
        forwards.insert(key, fwd.clone());
        Ok(fwd)
    }

    pub fn stop(&self, spec: &ForwardSpec) -> Result<(), NetError> {
        let key = spec.key();
        let fwd = self
            .forwards
            .lock()
            .map_err(|_| NetError::Closed)?
            .remove(&key)
            .ok_or(NetError::UnknownForward(key))?;
        fwd.close()
    }

    pub fn len(&self) -> usize {
        self.forwards.lock().map(|f| f.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes and forgets every forward, logging failures.
    pub fn close_all(&self) {
        let drained: Vec<(String, Arc<HostForward>)> = match self.forwards.lock() {
            Ok(mut f) => f.drain().collect(),
            Err(_) => return,
        };
        for (key, fwd) in drained {
            tracing::debug!(spec = %key, "closing forward");
            if let Err(e) = fwd.close() {
                tracing::warn!(spec = %key, error = %e, "failed to close forward");
            }
        }
    }
}
