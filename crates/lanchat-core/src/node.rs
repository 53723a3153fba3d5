//! Chat node - session layer orchestrator
//!
//! The [`ChatNode`] wires the session server, session registry, transfer
//! engine and resolution buffer to the application's directory and presence
//! layer.
//!
//! ```text
//! presence events ──► ResolutionBuffer ──► EventRouter ──┬─► TransferEngine (file offers/answers)
//!                                                        └─► application EventSink (everything else)
//!
//! inbound TCP ──► SessionServer ──► IdentityResolver ──► SessionRegistry ──► SessionListener
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use lanchat_core::{ChatNode, MemoryDirectory, SessionConfig};
//! # use lanchat_core::presence::{Announcement, Presence};
//! # struct Quiet;
//! # impl Presence for Quiet {
//! #     fn broadcast_expose(&self) -> lanchat_core::Result<()> { Ok(()) }
//! #     fn broadcast_get_topic(&self) -> lanchat_core::Result<()> { Ok(()) }
//! #     fn announce(&self, _: Announcement) -> lanchat_core::Result<()> { Ok(()) }
//! # }
//!
//! #[tokio::main]
//! async fn main() -> lanchat_core::Result<()> {
//!     let directory = Arc::new(MemoryDirectory::new());
//!     let node = ChatNode::new(SessionConfig::new(1), directory, Arc::new(Quiet))?;
//!     node.start().await?;
//!
//!     node.send_private(5, "hello").await?;
//!     node.stop().await;
//!     Ok(())
//! }
//! ```

use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::peer::{Directory, Peer, PeerCode};
use crate::presence::{EventSink, Presence, PresenceEvent};
use crate::resolution::{ResolutionBuffer, Submission};
use crate::server::SessionServer;
use crate::session::{SessionListener, SessionRegistry};
use crate::transfer::{
    IncomingOffer, OfferListener, Transfer, TransferEngine, TransferKey, TransferListener,
    TransferProgress,
};

/// Sends file negotiation to the transfer engine and the rest to the app
struct EventRouter {
    transfers: Arc<TransferEngine>,
    app: RwLock<Option<Arc<dyn EventSink>>>,
}

impl EventSink for EventRouter {
    fn deliver(&self, peer: &Peer, event: PresenceEvent) {
        match event {
            PresenceEvent::FileOffer {
                file_name,
                size,
                hash,
                ..
            } => self.transfers.handle_offer(peer, &file_name, size, hash),
            PresenceEvent::FileAccept {
                file_name,
                size,
                hash,
                port,
                ..
            } => self
                .transfers
                .handle_accept(peer, &file_name, size, hash, port),
            PresenceEvent::FileReject {
                file_name, hash, ..
            } => self.transfers.handle_reject(peer, &file_name, hash),
            other => {
                let app = self.app.read().unwrap_or_else(PoisonError::into_inner).clone();
                match app {
                    Some(app) => app.deliver(peer, other),
                    None => tracing::trace!("No event sink installed, dropping {:?}", other),
                }
            }
        }
    }
}

/// Node inner state
struct NodeInner {
    /// Node configuration
    config: SessionConfig,
    /// Peer directory (owned by the presence side)
    directory: Arc<dyn Directory>,
    /// Session registry
    registry: Arc<SessionRegistry>,
    /// Inbound session listener
    server: SessionServer,
    /// File transfers
    transfers: Arc<TransferEngine>,
    /// Deferred delivery for unknown senders
    resolution: Arc<ResolutionBuffer>,
    /// Routes resolved presence events
    router: Arc<EventRouter>,
}

/// LAN chat session node
#[derive(Clone)]
pub struct ChatNode {
    inner: Arc<NodeInner>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Lifecycle
// ═══════════════════════════════════════════════════════════════════════════

impl ChatNode {
    /// Build a node around the application's directory and presence layer.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidConfig`] if the configuration is invalid.
    pub fn new(
        config: SessionConfig,
        directory: Arc<dyn Directory>,
        presence: Arc<dyn Presence>,
    ) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(SessionRegistry::new(
            Arc::clone(&directory),
            config.local_code,
            config.server.connect_timeout,
        ));
        let server = SessionServer::new(
            config.server.clone(),
            config.identity.clone(),
            config.local_code,
            Arc::clone(&directory),
            Arc::clone(&registry),
        );
        let transfers = Arc::new(TransferEngine::new(
            config.transfer.clone(),
            config.local_code,
            config.server.bind_ip,
            Arc::clone(&presence),
            Arc::clone(&directory),
        ));
        let router = Arc::new(EventRouter {
            transfers: Arc::clone(&transfers),
            app: RwLock::new(None),
        });
        let resolution = Arc::new(ResolutionBuffer::new(
            config.resolution.clone(),
            Arc::clone(&directory),
            presence,
            router.clone(),
        ));

        Ok(Self {
            inner: Arc::new(NodeInner {
                config,
                directory,
                registry,
                server,
                transfers,
                resolution,
                router,
            }),
        })
    }

    /// Start the session server.
    ///
    /// Returns the bound session port.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::PortsExhausted`] if no session port is free.
    /// The node keeps working without inbound sessions: outbound sessions,
    /// presence events and transfers are unaffected.
    pub async fn start(&self) -> Result<u16> {
        let port = self.inner.server.start().await?;
        tracing::info!("Chat node {} started", self.inner.config.local_code);
        Ok(port)
    }

    /// Stop accepting, close every session and cancel every transfer
    pub async fn stop(&self) {
        self.inner.server.stop().await;
        self.inner.registry.close_all();
        self.inner.transfers.cancel_all();
        tracing::info!("Chat node {} stopped", self.inner.config.local_code);
    }

    /// Whether the session server is accepting
    pub fn is_accepting(&self) -> bool {
        self.inner.server.is_accepting()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Presence Integration
// ═══════════════════════════════════════════════════════════════════════════

impl ChatNode {
    /// Feed an inbound presence event.
    ///
    /// Events from unknown senders are deferred until the sender resolves.
    pub fn handle_presence_event(&self, event: PresenceEvent) -> Submission {
        self.inner.resolution.submit(event)
    }

    /// Signal that the directory just learned `code`
    pub fn peer_known(&self, code: PeerCode) {
        self.inner.resolution.peer_known(code);
    }

    /// Install the sink for non-transfer presence events
    pub fn set_event_sink(&self, sink: Arc<dyn EventSink>) {
        *self
            .inner
            .router
            .app
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(sink);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Private Chat
// ═══════════════════════════════════════════════════════════════════════════

impl ChatNode {
    /// Listener for private messages from every peer
    pub fn set_session_listener(&self, listener: Arc<dyn SessionListener>) {
        self.inner.registry.set_default_listener(listener);
    }

    /// Send a private message, opening a session if none exists.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::PeerNotFound`] for an unknown peer,
    /// [`SessionError::NoSessionPort`] if the peer advertises no session
    /// port, or the connect / write failure.
    pub async fn send_private(&self, code: PeerCode, text: &str) -> Result<()> {
        let peer = self
            .inner
            .directory
            .lookup(code)
            .ok_or(SessionError::PeerNotFound(code))?;

        self.inner.registry.ensure_session(&peer).await?;
        self.inner.registry.send(code, text).await
    }

    /// Close every session with the peer
    pub fn disconnect_peer(&self, code: PeerCode) -> usize {
        self.inner.registry.disconnect(code)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// File Transfer
// ═══════════════════════════════════════════════════════════════════════════

impl ChatNode {
    /// Listener for transfer lifecycle and progress
    pub fn set_transfer_listener(&self, listener: Arc<dyn TransferListener>) {
        self.inner.transfers.set_listener(listener);
    }

    /// Listener for incoming offers
    pub fn set_offer_listener(&self, listener: Arc<dyn OfferListener>) {
        self.inner.transfers.set_offer_listener(listener);
    }

    /// Offer a file to a peer
    ///
    /// # Errors
    ///
    /// See [`TransferEngine::offer`].
    pub async fn offer_file(&self, to: PeerCode, path: &Path) -> Result<Arc<Transfer>> {
        self.inner.transfers.offer(to, path).await
    }

    /// Accept an incoming offer
    ///
    /// # Errors
    ///
    /// See [`TransferEngine::accept`].
    pub async fn accept_offer(&self, key: &TransferKey) -> Result<Arc<Transfer>> {
        self.inner.transfers.accept(key).await
    }

    /// Reject an incoming offer
    ///
    /// # Errors
    ///
    /// See [`TransferEngine::reject`].
    pub fn reject_offer(&self, key: &TransferKey) -> Result<()> {
        self.inner.transfers.reject(key)
    }

    /// Cancel a transfer
    ///
    /// # Errors
    ///
    /// See [`TransferEngine::cancel`].
    pub fn cancel_transfer(&self, key: &TransferKey) -> Result<()> {
        self.inner.transfers.cancel(key)
    }

    /// Progress of one transfer
    pub fn transfer_progress(&self, key: &TransferKey) -> Option<TransferProgress> {
        self.inner.transfers.progress(key)
    }

    /// Progress of every live transfer
    pub fn active_transfers(&self) -> Vec<TransferProgress> {
        self.inner.transfers.transfers()
    }

    /// Offers waiting for an answer
    pub fn pending_offers(&self) -> Vec<IncomingOffer> {
        self.inner.transfers.pending_offers()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Accessors
// ═══════════════════════════════════════════════════════════════════════════

impl ChatNode {
    /// Local peer code
    pub fn local_code(&self) -> PeerCode {
        self.inner.config.local_code
    }

    /// Node configuration
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Bound session port, if listening
    pub fn session_port(&self) -> Option<u16> {
        self.inner.server.port()
    }

    /// Peer directory
    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.inner.directory
    }

    /// Session registry
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.inner.registry
    }

    /// Transfer engine
    pub fn transfers(&self) -> &Arc<TransferEngine> {
        &self.inner.transfers
    }

    /// Resolution buffer
    pub fn resolution(&self) -> &Arc<ResolutionBuffer> {
        &self.inner.resolution
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::MemoryDirectory;
    use crate::presence::Announcement;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        announced: Mutex<Vec<Announcement>>,
    }

    impl Presence for Recorder {
        fn broadcast_expose(&self) -> Result<()> {
            Ok(())
        }
        fn broadcast_get_topic(&self) -> Result<()> {
            Ok(())
        }
        fn announce(&self, announcement: Announcement) -> Result<()> {
            self.announced.lock().unwrap().push(announcement);
            Ok(())
        }
    }

    #[derive(Default)]
    struct AppSink {
        events: Mutex<Vec<PresenceEvent>>,
    }

    impl EventSink for AppSink {
        fn deliver(&self, _peer: &Peer, event: PresenceEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn node() -> (Arc<MemoryDirectory>, ChatNode) {
        let directory = Arc::new(MemoryDirectory::new());
        directory.insert(Peer::new(5, "alice", "127.0.0.1".parse().unwrap(), 6789));
        let node = ChatNode::new(
            SessionConfig::new(1),
            directory.clone(),
            Arc::new(Recorder::default()),
        )
        .unwrap();
        (directory, node)
    }

    #[tokio::test]
    async fn test_router_splits_events() {
        let (_directory, node) = node();
        let sink = Arc::new(AppSink::default());
        node.set_event_sink(sink.clone());

        let topic = PresenceEvent::TopicChanged {
            from: 5,
            topic: "lunch".to_string(),
        };
        assert_eq!(node.handle_presence_event(topic.clone()), Submission::Delivered);

        let offer = PresenceEvent::FileOffer {
            from: 5,
            file_name: "report.pdf".to_string(),
            size: 1000,
            hash: 42,
        };
        node.handle_presence_event(offer);

        assert_eq!(*sink.events.lock().unwrap(), vec![topic]);
        assert_eq!(node.pending_offers().len(), 1);
    }

    #[tokio::test]
    async fn test_send_private_unknown_peer() {
        let (_directory, node) = node();
        assert!(matches!(
            node.send_private(77, "hi").await,
            Err(SessionError::PeerNotFound(77))
        ));
        assert!(matches!(
            node.send_private(5, "hi").await,
            Err(SessionError::NoSessionPort(5))
        ));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = SessionConfig::new(1);
        config.transfer.chunk_size = 0;
        let result = ChatNode::new(
            config,
            Arc::new(MemoryDirectory::new()),
            Arc::new(Recorder::default()),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_stop_without_start() {
        let (_directory, node) = node();
        tokio::time::timeout(Duration::from_secs(1), node.stop())
            .await
            .unwrap();
        assert!(!node.is_accepting());
        assert_eq!(node.session_port(), None);
    }
}
