//! Two-node test fixture for integration testing
//!
//! Runs two [`ChatNode`]s on loopback, each with its own directory and
//! download directory. Their presence layers are joined by an in-process
//! [`PresenceBus`] that routes directed announcements to the recipient as
//! presence events, delivered asynchronously like a broadcast datagram.
//!
//! # Example
//!
//! ```ignore
//! use lanchat_tests::fixtures::{BOB, TwoNodeFixture};
//!
//! #[tokio::test]
//! async fn test_private_message() {
//!     let fixture = TwoNodeFixture::started().await;
//!     fixture.alice.send_private(BOB, "hello").await.unwrap();
//!     fixture.cleanup().await;
//! }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use lanchat_core::{
    Announcement, ChatNode, MemoryDirectory, Peer, PeerCode, Presence, Result, SessionConfig,
};
use tempfile::TempDir;

/// Peer code of the first node
pub const ALICE: PeerCode = 5;

/// Peer code of the second node
pub const BOB: PeerCode = 9;

/// Ports each node may fall back through
const PORT_SPAN: u16 = 20;

const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Global port allocator for concurrent test execution
static NEXT_PORT: AtomicU16 = AtomicU16::new(24000);

/// Allocate a base port whose fallback range no other fixture uses
fn allocate_base_port() -> u16 {
    NEXT_PORT.fetch_add(PORT_SPAN, Ordering::SeqCst)
}

/// Poll `check` until it holds or `timeout` passes
pub async fn wait_until<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Await `future` or panic after five seconds
pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .unwrap_or_else(|_| panic!("timed out"))
}

// ═══════════════════════════════════════════════════════════════════════════
// Presence Bus
// ═══════════════════════════════════════════════════════════════════════════

/// In-process stand-in for the broadcast presence channel
#[derive(Default)]
pub struct PresenceBus {
    nodes: RwLock<HashMap<PeerCode, ChatNode>>,
    exposes: AtomicUsize,
    topics: AtomicUsize,
    announcements: Mutex<Vec<(PeerCode, Announcement)>>,
}

impl PresenceBus {
    /// Create an empty bus
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Presence handle for the node with `code`
    pub fn presence_for(self: &Arc<Self>, code: PeerCode) -> Arc<BusPresence> {
        Arc::new(BusPresence {
            code,
            bus: Arc::clone(self),
        })
    }

    /// Make a node reachable by announcements addressed to its code
    pub fn join(&self, node: &ChatNode) {
        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node.local_code(), node.clone());
    }

    /// Drop every node; nodes hold the bus through their presence handle
    pub fn clear(&self) {
        self.nodes.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Expose broadcasts seen so far
    pub fn expose_count(&self) -> usize {
        self.exposes.load(Ordering::SeqCst)
    }

    /// Get-topic broadcasts seen so far
    pub fn topic_count(&self) -> usize {
        self.topics.load(Ordering::SeqCst)
    }

    /// Every announcement sent, with its sender
    pub fn announcements(&self) -> Vec<(PeerCode, Announcement)> {
        self.announcements
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn route(&self, from: PeerCode, announcement: Announcement) {
        self.announcements
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((from, announcement.clone()));

        let target = self
            .nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&announcement.recipient())
            .cloned();

        match target {
            Some(node) => {
                let event = announcement.into_event(from);
                tokio::spawn(async move {
                    node.handle_presence_event(event);
                });
            }
            None => tracing::debug!("No node {} on the bus", announcement.recipient()),
        }
    }
}

/// One node's handle on the [`PresenceBus`]
pub struct BusPresence {
    code: PeerCode,
    bus: Arc<PresenceBus>,
}

impl Presence for BusPresence {
    fn broadcast_expose(&self) -> Result<()> {
        self.bus.exposes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn broadcast_get_topic(&self) -> Result<()> {
        self.bus.topics.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn announce(&self, announcement: Announcement) -> Result<()> {
        self.bus.route(self.code, announcement);
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Fixture
// ═══════════════════════════════════════════════════════════════════════════

/// Two nodes, `alice` and `bob`, on loopback
pub struct TwoNodeFixture {
    /// Node with code [`ALICE`]
    pub alice: ChatNode,
    /// Node with code [`BOB`]
    pub bob: ChatNode,
    /// Alice's view of the peer table
    pub alice_directory: Arc<MemoryDirectory>,
    /// Bob's view of the peer table
    pub bob_directory: Arc<MemoryDirectory>,
    /// Shared presence channel
    pub bus: Arc<PresenceBus>,
    /// Where alice stores received files
    pub alice_downloads: TempDir,
    /// Where bob stores received files
    pub bob_downloads: TempDir,
}

impl TwoNodeFixture {
    /// Create both nodes without starting their servers
    pub fn new() -> Self {
        Self::new_with_config(|_| {})
    }

    /// Create both nodes, letting `tweak` adjust each configuration
    pub fn new_with_config<F>(tweak: F) -> Self
    where
        F: Fn(&mut SessionConfig),
    {
        let bus = PresenceBus::new();
        let alice_downloads = TempDir::new().unwrap();
        let bob_downloads = TempDir::new().unwrap();

        let (alice, alice_directory) = Self::node(ALICE, "alice", &bus, &alice_downloads, &tweak);
        let (bob, bob_directory) = Self::node(BOB, "bob", &bus, &bob_downloads, &tweak);

        Self {
            alice,
            bob,
            alice_directory,
            bob_directory,
            bus,
            alice_downloads,
            bob_downloads,
        }
    }

    /// Create both nodes, start them and introduce them to each other
    pub async fn started() -> Self {
        let fixture = Self::new();
        fixture.start().await;
        fixture
    }

    fn node<F>(
        code: PeerCode,
        nick: &str,
        bus: &Arc<PresenceBus>,
        downloads: &TempDir,
        tweak: &F,
    ) -> (ChatNode, Arc<MemoryDirectory>)
    where
        F: Fn(&mut SessionConfig),
    {
        let mut config = SessionConfig::new(code);
        config.server.bind_ip = LOOPBACK;
        config.server.base_port = allocate_base_port();
        config.server.port_attempts = PORT_SPAN;
        config.server.connect_timeout = Duration::from_secs(2);
        config.identity.poll_interval = Duration::from_millis(10);
        config.identity.max_polls = 100;
        config.resolution.poll_interval = Duration::from_millis(10);
        config.resolution.max_polls = 50;
        config.transfer.download_dir = downloads.path().to_path_buf();
        config.transfer.chunk_size = 16 * 1024;
        config.transfer.accept_timeout = Duration::from_secs(5);
        config.transfer.handshake_timeout = Duration::from_secs(5);
        config.transfer.progress_interval = Duration::from_millis(20);
        tweak(&mut config);

        let directory = Arc::new(MemoryDirectory::new());
        directory.insert(Peer::new(code, nick, LOOPBACK, 6789));

        let node = ChatNode::new(config, directory.clone(), bus.presence_for(code)).unwrap();
        bus.join(&node);
        (node, directory)
    }

    /// Start both session servers and publish each node's record to the other
    pub async fn start(&self) {
        self.alice.start().await.unwrap();
        self.bob.start().await.unwrap();
        self.introduce();
    }

    /// Copy each node's own directory record into the other's directory,
    /// as the presence layer would after an expose round
    pub fn introduce(&self) {
        if let Some(alice) = self.alice_directory.peers().into_iter().find(|p| p.code == ALICE) {
            self.bob_directory.insert(alice);
        }
        if let Some(bob) = self.bob_directory.peers().into_iter().find(|p| p.code == BOB) {
            self.alice_directory.insert(bob);
        }
    }

    /// Stop both nodes and break the bus reference cycle
    pub async fn cleanup(self) {
        self.alice.stop().await;
        self.bob.stop().await;
        self.bus.clear();
    }
}

impl Default for TwoNodeFixture {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fixture_nodes_know_each_other() {
        let fixture = TwoNodeFixture::started().await;

        let bob = fixture.alice_directory.peers().into_iter().find(|p| p.code == BOB).unwrap();
        assert_eq!(bob.session_port, fixture.bob.session_port());
        assert!(fixture.bob_directory.peers().iter().any(|p| p.code == ALICE));

        fixture.cleanup().await;
    }

    #[test]
    fn test_port_allocation_is_disjoint() {
        let first = allocate_base_port();
        let second = allocate_base_port();
        assert!(second >= first + PORT_SPAN);
    }
}
