//! Peer addressing: UDP endpoints (numeric or hostname) and in-process local
//! channels, both tagged with a target control id.

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::mpsc;
use std::time::Duration;

use crate::error::{Error, Result};

/// A fully resolved transport endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Udp(SocketAddr),
    Local(u16),
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Udp(addr) => write!(f, "udp:{addr}"),
            Endpoint::Local(port) => write!(f, "local:{port}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum AddressKind {
    Ip(SocketAddr),
    Host { name: String, port: u16 },
    Local(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveState {
    InProgress,
    Ready(Endpoint),
    Failed,
}

/// Peer address. Hostnames resolve lazily: either synchronously with a
/// timeout via [`resolve`](Address::resolve), or in the background via
/// [`resolve_async`](Address::resolve_async) + [`poll_resolved`]
/// (Address::poll_resolved). The result is cached on the address.
#[derive(Debug)]
pub struct Address {
    kind: AddressKind,
    control_id: u8,
    resolved: Option<IpAddr>,
    pending: Option<mpsc::Receiver<Option<IpAddr>>>,
    failed: bool,
}

impl Clone for Address {
    fn clone(&self) -> Self {
        // An in-flight background resolution stays with the original.
        Self {
            kind: self.kind.clone(),
            control_id: self.control_id,
            resolved: self.resolved,
            pending: None,
            failed: self.failed,
        }
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.control_id == other.control_id
    }
}

impl Eq for Address {}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            AddressKind::Ip(addr) => write!(f, "udp:{addr}#{}", self.control_id),
            AddressKind::Host { name, port } => {
                write!(f, "udp:{name}:{port}#{}", self.control_id)
            }
            AddressKind::Local(port) => write!(f, "local:{port}#{}", self.control_id),
        }
    }
}

impl Address {
    /// Parse a `host:port` UDP address. A numeric IP is usable immediately;
    /// a hostname needs resolving first.
    pub fn udp(spec: &str) -> Result<Self> {
        if let Ok(addr) = spec.parse::<SocketAddr>() {
            return Ok(Self::from_socket_addr(addr));
        }
        let (host, port) = spec
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidAddress(spec.to_owned()))?;
        let port: u16 = port
            .parse()
            .map_err(|_| Error::InvalidAddress(spec.to_owned()))?;
        if host.is_empty() {
            return Err(Error::InvalidAddress(spec.to_owned()));
        }
        Ok(Self {
            kind: AddressKind::Host {
                name: host.to_owned(),
                port,
            },
            control_id: 0,
            resolved: None,
            pending: None,
            failed: false,
        })
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self {
            kind: AddressKind::Ip(addr),
            control_id: 0,
            resolved: Some(addr.ip()),
            pending: None,
            failed: false,
        }
    }

    /// An in-process channel endpoint (see `BindOptions::local`).
    pub fn local(port: u16) -> Self {
        Self {
            kind: AddressKind::Local(port),
            control_id: 0,
            resolved: None,
            pending: None,
            failed: false,
        }
    }

    pub fn with_control_id(mut self, id: u8) -> Self {
        self.control_id = id;
        self
    }

    pub fn control_id(&self) -> u8 {
        self.control_id
    }

    pub fn port(&self) -> u16 {
        match &self.kind {
            AddressKind::Ip(addr) => addr.port(),
            AddressKind::Host { port, .. } => *port,
            AddressKind::Local(port) => *port,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.endpoint().is_some()
    }

    /// The resolved endpoint, if resolution already happened (or was never
    /// needed).
    pub fn endpoint(&self) -> Option<Endpoint> {
        match &self.kind {
            AddressKind::Ip(addr) => Some(Endpoint::Udp(*addr)),
            AddressKind::Host { port, .. } => {
                self.resolved.map(|ip| Endpoint::Udp(SocketAddr::new(ip, *port)))
            }
            AddressKind::Local(port) => Some(Endpoint::Local(*port)),
        }
    }

    /// Resolve synchronously, waiting at most `timeout`. Expiry is an
    /// ordinary `Error::Timeout`; a later retry may still succeed.
    pub fn resolve(&mut self, timeout: Duration) -> Result<Endpoint> {
        if let Some(ep) = self.endpoint() {
            return Ok(ep);
        }
        self.resolve_async();
        let rx = self.pending.as_ref().ok_or(Error::Unresolved)?;
        match rx.recv_timeout(timeout) {
            Ok(Some(ip)) => {
                self.resolved = Some(ip);
                self.pending = None;
                self.endpoint().ok_or(Error::Unresolved)
            }
            Ok(None) => {
                self.failed = true;
                self.pending = None;
                Err(Error::Unresolved)
            }
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Kick off background resolution on a helper thread. No-op if already
    /// resolved or already in flight.
    pub fn resolve_async(&mut self) {
        if self.endpoint().is_some() || self.pending.is_some() {
            return;
        }
        let AddressKind::Host { name, port } = &self.kind else {
            return;
        };
        let (tx, rx) = mpsc::channel();
        let target = format!("{name}:{port}");
        std::thread::spawn(move || {
            let ip = target
                .to_socket_addrs()
                .ok()
                .and_then(|mut addrs| addrs.next())
                .map(|a| a.ip());
            let _ = tx.send(ip);
        });
        self.pending = Some(rx);
        self.failed = false;
    }

    /// Poll a background resolution started by `resolve_async`.
    pub fn poll_resolved(&mut self) -> ResolveState {
        if let Some(ep) = self.endpoint() {
            return ResolveState::Ready(ep);
        }
        if self.failed {
            return ResolveState::Failed;
        }
        let Some(rx) = &self.pending else {
            return ResolveState::Failed;
        };
        match rx.try_recv() {
            Ok(Some(ip)) => {
                self.resolved = Some(ip);
                self.pending = None;
                match self.endpoint() {
                    Some(ep) => ResolveState::Ready(ep),
                    None => ResolveState::Failed,
                }
            }
            Ok(None) | Err(mpsc::TryRecvError::Disconnected) => {
                self.failed = true;
                self.pending = None;
                ResolveState::Failed
            }
            Err(mpsc::TryRecvError::Empty) => ResolveState::InProgress,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_addresses_need_no_resolution() {
        let addr = Address::udp("127.0.0.1:4000").unwrap();
        assert!(addr.is_resolved());
        assert_eq!(
            addr.endpoint(),
            Some(Endpoint::Udp("127.0.0.1:4000".parse().unwrap()))
        );
    }

    #[test]
    fn hostnames_start_unresolved() {
        let addr = Address::udp("localhost:4000").unwrap();
        assert!(!addr.is_resolved());
        assert_eq!(addr.port(), 4000);
    }

    #[test]
    fn localhost_resolves() {
        let mut addr = Address::udp("localhost:5000").unwrap();
        let ep = addr.resolve(Duration::from_secs(5)).unwrap();
        match ep {
            Endpoint::Udp(sa) => assert_eq!(sa.port(), 5000),
            other => panic!("unexpected endpoint {other:?}"),
        }
        // Cached now.
        assert!(addr.is_resolved());
    }

    #[test]
    fn async_resolution_completes() {
        let mut addr = Address::udp("localhost:5001").unwrap();
        addr.resolve_async();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            match addr.poll_resolved() {
                ResolveState::Ready(Endpoint::Udp(sa)) => {
                    assert_eq!(sa.port(), 5001);
                    break;
                }
                ResolveState::Failed => panic!("resolution failed"),
                _ => {
                    assert!(std::time::Instant::now() < deadline, "resolution stalled");
                    std::thread::sleep(Duration::from_millis(5));
                }
            }
        }
    }

    #[test]
    fn bad_specs_are_rejected() {
        assert!(Address::udp("no-port").is_err());
        assert!(Address::udp(":123x").is_err());
    }

    #[test]
    fn equality_covers_control_id() {
        let a = Address::udp("127.0.0.1:4000").unwrap();
        let b = Address::udp("127.0.0.1:4000").unwrap().with_control_id(2);
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }
}
