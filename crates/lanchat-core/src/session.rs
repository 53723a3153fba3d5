//! Peer session registry
//!
//! A session is the set of live connections attributed to one peer. The
//! registry creates a session on the first attach, keeps the directory's
//! tcp-enabled flag in step with it, and tears it down only when the last
//! connection reports that it closed.
//!
//! ```text
//!   peer 5 ──► [conn 3, conn 8]   canonical = conn 8 (newest)
//!   peer 9 ──► [conn 4]
//! ```
//!
//! The newest attached connection is canonical: `send` writes on it and
//! `enforce_single_connection` keeps it.
//!
//! Directory write-backs happen under the session's map entry so that attach
//! and teardown for one peer are serialized. No listener or connection
//! callback ever runs while a map guard is held.

use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::connection::{Connection, ConnectionId, ListenerControl, MessageListener};
use crate::error::{Result, SessionError};
use crate::peer::{Directory, Peer, PeerCode};

/// Receives messages from identified peers
pub trait SessionListener: Send + Sync {
    /// Handle a message from `from`. Runs on the connection's receive task.
    fn on_message(&self, text: String, from: &Peer);
}

impl<F> SessionListener for F
where
    F: Fn(String, &Peer) + Send + Sync,
{
    fn on_message(&self, text: String, from: &Peer) {
        self(text, from)
    }
}

/// Connections attributed to one peer
struct PeerSession {
    peer: Peer,
    /// Oldest first
    connections: Vec<Arc<Connection>>,
    listener: Option<Arc<dyn SessionListener>>,
}

/// Registry of per-peer sessions
pub struct SessionRegistry {
    sessions: DashMap<PeerCode, PeerSession>,
    directory: Arc<dyn Directory>,
    default_listener: RwLock<Option<Arc<dyn SessionListener>>>,
    local_code: PeerCode,
    connect_timeout: Duration,
}

impl SessionRegistry {
    /// Create an empty registry.
    ///
    /// `local_code` is sent as the identification message on outbound
    /// connections.
    pub fn new(directory: Arc<dyn Directory>, local_code: PeerCode, connect_timeout: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            directory,
            default_listener: RwLock::new(None),
            local_code,
            connect_timeout,
        }
    }

    /// Add an identified connection to the peer's session.
    ///
    /// Creates the session on first attach and marks the peer tcp-enabled.
    /// The connection's messages are forwarded to the session listener and
    /// its disconnect callback detaches it again.
    pub fn attach(self: &Arc<Self>, connection: Arc<Connection>, peer: Peer) {
        let code = peer.code;
        let connection_id = connection.id();

        {
            let mut session = self.sessions.entry(code).or_insert_with(|| PeerSession {
                peer: peer.clone(),
                connections: Vec::new(),
                listener: None,
            });
            session.peer = peer;
            session.connections.push(Arc::clone(&connection));
            self.directory.set_tcp_enabled(code, true);
        }

        connection.set_listener(Arc::new(SessionForwarder {
            registry: Arc::downgrade(self),
            code,
        }));

        let registry = Arc::downgrade(self);
        let registered = connection.set_on_disconnect(Box::new(move |id| {
            if let Some(registry) = registry.upgrade() {
                registry.detach_on_disconnect(code, id);
            }
        }));

        if !registered {
            // Closed before the callback could be installed
            self.detach_on_disconnect(code, connection_id);
            return;
        }

        connection.start_receiving();
        tracing::info!(
            "Attached connection {} to session with peer {} ({} live)",
            connection_id,
            code,
            self.connection_count(code)
        );
    }

    /// Remove a closed connection from its peer's session.
    ///
    /// This is the only teardown path: when the last connection goes, the
    /// peer is marked tcp-disabled and the session is dropped.
    pub fn detach_on_disconnect(&self, code: PeerCode, connection_id: ConnectionId) {
        let emptied = match self.sessions.entry(code) {
            Entry::Occupied(mut entry) => {
                entry
                    .get_mut()
                    .connections
                    .retain(|conn| conn.id() != connection_id);
                if entry.get().connections.is_empty() {
                    self.directory.set_tcp_enabled(code, false);
                    entry.remove();
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(_) => false,
        };

        if emptied {
            tracing::info!("Session with peer {} ended", code);
        } else {
            tracing::debug!("Connection {} detached from peer {}", connection_id, code);
        }
    }

    /// Send on the peer's canonical connection.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::SessionNotFound`] if the peer has no session,
    /// or a transport error if the write failed (the connection is then
    /// closed and detached through its callback).
    pub async fn send(&self, code: PeerCode, text: &str) -> Result<()> {
        let connection = self
            .canonical(code)
            .ok_or(SessionError::SessionNotFound(code))?;

        if connection.send(text).await {
            Ok(())
        } else {
            Err(SessionError::transport("session write failed"))
        }
    }

    fn canonical(&self, code: PeerCode) -> Option<Arc<Connection>> {
        self.sessions
            .get(&code)
            .and_then(|session| session.connections.last().cloned())
    }

    /// Close every connection to the peer except the canonical one.
    ///
    /// Returns how many connections were closed.
    pub fn enforce_single_connection(&self, code: PeerCode) -> usize {
        let extra: Vec<Arc<Connection>> = match self.sessions.get(&code) {
            Some(session) if session.connections.len() > 1 => {
                let keep = session.connections.len() - 1;
                session.connections[..keep].to_vec()
            }
            _ => return 0,
        };

        for connection in &extra {
            connection.disconnect();
        }

        tracing::debug!("Pruned {} duplicate connections to peer {}", extra.len(), code);
        extra.len()
    }

    /// Force-close every connection to the peer.
    ///
    /// Returns how many connections were closed.
    pub fn disconnect(&self, code: PeerCode) -> usize {
        let connections: Vec<Arc<Connection>> = self
            .sessions
            .get(&code)
            .map(|session| session.connections.clone())
            .unwrap_or_default();

        for connection in &connections {
            connection.disconnect();
        }
        connections.len()
    }

    /// Open an outbound session to the peer's advertised session port.
    ///
    /// The local peer code is sent as the identification message before the
    /// connection is attached.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NoSessionPort`] if the peer has not advertised
    /// a port, or the connect / write failure.
    pub async fn connect(self: &Arc<Self>, peer: &Peer) -> Result<()> {
        let addr = peer
            .session_addr()
            .ok_or(SessionError::NoSessionPort(peer.code))?;

        tracing::debug!("Opening session to peer {} at {}", peer.code, addr);
        let connection = Connection::connect(addr, self.connect_timeout).await?;

        if !connection.send(&self.local_code.to_string()).await {
            return Err(SessionError::transport("identification write failed"));
        }

        self.attach(connection, peer.clone());
        Ok(())
    }

    /// Connect unless a session already exists
    ///
    /// # Errors
    ///
    /// See [`connect`](Self::connect).
    pub async fn ensure_session(self: &Arc<Self>, peer: &Peer) -> Result<()> {
        if self.has_session(peer.code) {
            return Ok(());
        }
        self.connect(peer).await
    }

    /// Install a listener for one peer's session.
    ///
    /// Returns `false` if the peer has no session.
    pub fn set_session_listener(&self, code: PeerCode, listener: Arc<dyn SessionListener>) -> bool {
        match self.sessions.get_mut(&code) {
            Some(mut session) => {
                session.listener = Some(listener);
                true
            }
            None => false,
        }
    }

    /// Listener used by sessions without their own
    pub fn set_default_listener(&self, listener: Arc<dyn SessionListener>) {
        *self
            .default_listener
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(listener);
    }

    /// Whether the peer has a live session
    pub fn has_session(&self, code: PeerCode) -> bool {
        self.sessions.contains_key(&code)
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of live connections to the peer
    pub fn connection_count(&self, code: PeerCode) -> usize {
        self.sessions
            .get(&code)
            .map_or(0, |session| session.connections.len())
    }

    /// Codes of all peers with a live session
    pub fn active_peers(&self) -> Vec<PeerCode> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    /// Close every session
    pub fn close_all(&self) {
        let connections: Vec<Arc<Connection>> = self
            .sessions
            .iter()
            .flat_map(|entry| entry.connections.clone())
            .collect();

        for connection in connections {
            connection.disconnect();
        }
    }

    fn route(&self, code: PeerCode) -> Option<(Peer, Arc<dyn SessionListener>)> {
        let (peer, listener) = {
            let session = self.sessions.get(&code)?;
            (session.peer.clone(), session.listener.clone())
        };

        let listener = listener.or_else(|| {
            self.default_listener
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone()
        })?;

        // Prefer the freshest record (nick or away state may have changed)
        let peer = self.directory.lookup(code).unwrap_or(peer);
        Some((peer, listener))
    }
}

/// Connection listener forwarding to the owning session's listener
struct SessionForwarder {
    registry: Weak<SessionRegistry>,
    code: PeerCode,
}

impl MessageListener for SessionForwarder {
    fn on_message(&self, text: String) -> ListenerControl {
        let Some(registry) = self.registry.upgrade() else {
            return ListenerControl::Detach;
        };

        match registry.route(self.code) {
            Some((peer, listener)) => listener.on_message(text, &peer),
            None => tracing::debug!("No listener for message from peer {}, dropping", self.code),
        }
        ListenerControl::Keep
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::MemoryDirectory;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    fn setup() -> (Arc<MemoryDirectory>, Arc<SessionRegistry>) {
        let directory = Arc::new(MemoryDirectory::new());
        directory.insert(Peer::new(5, "alice", "127.0.0.1".parse().unwrap(), 6789));
        let registry = Arc::new(SessionRegistry::new(
            directory.clone(),
            1,
            Duration::from_secs(1),
        ));
        (directory, registry)
    }

    async fn pair() -> (Arc<Connection>, Arc<Connection>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(
            Connection::connect(addr, Duration::from_secs(1)),
            listener.accept()
        );
        (client.unwrap(), Connection::from_stream(accepted.unwrap().0).unwrap())
    }

    fn remote_listener(conn: &Arc<Connection>) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        conn.set_listener(Arc::new(move |text: String| {
            let _ = tx.send(text);
            ListenerControl::Keep
        }));
        conn.start_receiving();
        rx
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while tokio::time::Instant::now() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    #[tokio::test]
    async fn test_attach_forwards_with_peer_context() {
        let (directory, registry) = setup();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.set_default_listener(Arc::new(move |text: String, from: &Peer| {
            let _ = tx.send((text, from.code, from.nick.clone()));
        }));

        let (remote, local) = pair().await;
        registry.attach(local, directory.lookup(5).unwrap());
        assert!(directory.lookup(5).unwrap().tcp_enabled);

        remote.send("hi there").await;
        let (text, code, nick) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(text, "hi there");
        assert_eq!(code, 5);
        assert_eq!(nick, "alice");
    }

    #[tokio::test]
    async fn test_last_disconnect_clears_tcp_enabled() {
        let (directory, registry) = setup();
        let peer = directory.lookup(5).unwrap();

        let (remote_a, local_a) = pair().await;
        let (remote_b, local_b) = pair().await;
        registry.attach(local_a, peer.clone());
        registry.attach(local_b, peer);
        assert_eq!(registry.connection_count(5), 2);

        remote_a.disconnect();
        assert!(eventually(|| registry.connection_count(5) == 1).await);
        assert!(directory.lookup(5).unwrap().tcp_enabled);

        remote_b.disconnect();
        assert!(eventually(|| !registry.has_session(5)).await);
        assert!(!directory.lookup(5).unwrap().tcp_enabled);
        assert_eq!(registry.connection_count(5), 0);
    }

    #[tokio::test]
    async fn test_send_uses_newest_connection() {
        let (directory, registry) = setup();
        let peer = directory.lookup(5).unwrap();

        let (remote_old, local_old) = pair().await;
        let (remote_new, local_new) = pair().await;
        let mut old_rx = remote_listener(&remote_old);
        let mut new_rx = remote_listener(&remote_new);
        registry.attach(local_old, peer.clone());
        registry.attach(local_new, peer);

        registry.send(5, "ping").await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(2), new_rx.recv())
            .await
            .unwrap();
        assert_eq!(got.as_deref(), Some("ping"));
        assert!(old_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_enforce_single_connection_keeps_newest() {
        let (directory, registry) = setup();
        let peer = directory.lookup(5).unwrap();

        let (_r1, first) = pair().await;
        let (_r2, second) = pair().await;
        let (_r3, third) = pair().await;
        registry.attach(Arc::clone(&first), peer.clone());
        registry.attach(Arc::clone(&second), peer.clone());
        registry.attach(Arc::clone(&third), peer);

        assert_eq!(registry.enforce_single_connection(5), 2);
        assert!(!first.is_connected());
        assert!(!second.is_connected());
        assert!(third.is_connected());
        assert_eq!(registry.connection_count(5), 1);
        assert_eq!(registry.enforce_single_connection(5), 0);
    }

    #[tokio::test]
    async fn test_send_without_session() {
        let (_directory, registry) = setup();
        assert!(matches!(
            registry.send(5, "hello").await,
            Err(SessionError::SessionNotFound(5))
        ));
    }

    #[tokio::test]
    async fn test_attach_closed_connection_tears_down() {
        let (directory, registry) = setup();
        let (_remote, local) = pair().await;
        local.disconnect();

        registry.attach(local, directory.lookup(5).unwrap());
        assert!(!registry.has_session(5));
        assert!(!directory.lookup(5).unwrap().tcp_enabled);
    }

    #[tokio::test]
    async fn test_connect_requires_session_port() {
        let (directory, registry) = setup();
        let peer = directory.lookup(5).unwrap();
        assert!(matches!(
            registry.connect(&peer).await,
            Err(SessionError::NoSessionPort(5))
        ));
    }
}
