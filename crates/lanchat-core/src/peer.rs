//! Peers and the peer directory
//!
//! The directory is owned by the presence side of the application: it learns
//! peers from broadcast announcements and keeps their last-known address.
//! The session layer only reads it, except for two write-backs: the session
//! port a peer listens on and whether the peer currently has a live session.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::time::SystemTime;

/// Unique integer identifying a chat participant, independent of its nickname
pub type PeerCode = i32;

/// A remote (or the local) chat participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// Unique peer code
    pub code: PeerCode,
    /// Current nickname
    pub nick: String,
    /// Last-known address; the trust anchor for session identification
    pub ip: IpAddr,
    /// Last-known presence port
    pub presence_port: u16,
    /// Port of the peer's session server, once advertised
    pub session_port: Option<u16>,
    /// Peer marked itself away
    pub away: bool,
    /// Peer is considered online by the presence layer
    pub online: bool,
    /// Last time the peer reported idle activity
    pub last_idle: Option<SystemTime>,
    /// At least one session connection to the peer is live
    pub tcp_enabled: bool,
}

impl Peer {
    /// Create an online peer with no session information yet
    pub fn new(code: PeerCode, nick: impl Into<String>, ip: IpAddr, presence_port: u16) -> Self {
        Self {
            code,
            nick: nick.into(),
            ip,
            presence_port,
            session_port: None,
            away: false,
            online: true,
            last_idle: None,
            tcp_enabled: false,
        }
    }

    /// Builder-style session port
    #[must_use]
    pub fn with_session_port(mut self, port: u16) -> Self {
        self.session_port = Some(port);
        self
    }

    /// Address of the peer's session server, if advertised
    #[must_use]
    pub fn session_addr(&self) -> Option<SocketAddr> {
        self.session_port.map(|port| SocketAddr::new(self.ip, port))
    }

    /// Whether `addr` is the address this peer is known by.
    ///
    /// IPv4-mapped IPv6 addresses compare equal to their IPv4 form, so a
    /// dual-stack listener does not defeat the check.
    #[must_use]
    pub fn matches_ip(&self, addr: IpAddr) -> bool {
        self.ip.to_canonical() == addr.to_canonical()
    }
}

/// Read access to known peers, plus the session layer's write-backs
pub trait Directory: Send + Sync {
    /// Look up a peer by code
    fn lookup(&self, code: PeerCode) -> Option<Peer>;

    /// Record the session port a peer listens on
    fn set_session_port(&self, code: PeerCode, port: u16);

    /// Record whether a peer has at least one live session connection
    fn set_tcp_enabled(&self, code: PeerCode, enabled: bool);
}

/// Concurrent in-memory directory
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    peers: DashMap<PeerCode, Peer>,
}

impl MemoryDirectory {
    /// Create an empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a peer, returning the previous record
    pub fn insert(&self, peer: Peer) -> Option<Peer> {
        self.peers.insert(peer.code, peer)
    }

    /// Remove a peer
    pub fn remove(&self, code: PeerCode) -> Option<Peer> {
        self.peers.remove(&code).map(|(_, peer)| peer)
    }

    /// Number of known peers
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether no peers are known
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Snapshot of all peers
    pub fn peers(&self) -> Vec<Peer> {
        self.peers.iter().map(|entry| entry.value().clone()).collect()
    }
}

impl Directory for MemoryDirectory {
    fn lookup(&self, code: PeerCode) -> Option<Peer> {
        self.peers.get(&code).map(|entry| entry.value().clone())
    }

    fn set_session_port(&self, code: PeerCode, port: u16) {
        if let Some(mut peer) = self.peers.get_mut(&code) {
            peer.session_port = Some(port);
        }
    }

    fn set_tcp_enabled(&self, code: PeerCode, enabled: bool) {
        if let Some(mut peer) = self.peers.get_mut(&code) {
            peer.tcp_enabled = enabled;
        }
    }
}
