//! Identification of inbound connections
//!
//! An accepted socket is anonymous. Its first message is the peer code the
//! remote claims to be, and the claim is only believed when the socket comes
//! from the address the presence layer most recently associated with that
//! code:
//!
//! ```text
//! accept ──► IdentityResolver ──► first message "5"
//!                                   │
//!            parse code ── Directory::lookup(5) ── peer.ip == socket ip ?
//!                                   │                        │
//!                               Unresolved              attributed Peer
//! ```
//!
//! Failures are never reported to the remote side. The connection is closed
//! and the reason is logged locally.

use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;

use crate::config::IdentityConfig;
use crate::connection::{Connection, ListenerControl, MessageListener};
use crate::peer::{Directory, Peer, PeerCode};

/// Why an inbound connection could not be attributed to a peer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Unresolved {
    /// No claim arrived in time
    #[error("no identity claim before the deadline")]
    Timeout,

    /// Connection closed before a claim arrived
    #[error("connection closed before identifying")]
    Disconnected,

    /// Claim is not a peer code
    #[error("malformed identity claim {0:?}")]
    Malformed(String),

    /// Claimed code is not in the directory
    #[error("unknown peer code {0}")]
    UnknownPeer(PeerCode),

    /// Socket address differs from the one the directory holds
    #[error("peer {code} is known at {expected}, connection came from {actual}")]
    AddressMismatch {
        /// Claimed code
        code: PeerCode,
        /// Address the directory records
        expected: IpAddr,
        /// Actual remote address
        actual: IpAddr,
    },
}

/// Validate an identity claim against the directory.
///
/// Succeeds only if the claim parses as a peer code, the directory knows the
/// code, and the peer's last-known address equals `remote_ip`.
pub fn validate_claim(
    claim: &str,
    remote_ip: IpAddr,
    directory: &dyn Directory,
) -> Result<Peer, Unresolved> {
    let code: PeerCode = claim
        .trim()
        .parse()
        .map_err(|_| Unresolved::Malformed(claim.to_string()))?;

    let peer = directory
        .lookup(code)
        .ok_or(Unresolved::UnknownPeer(code))?;

    if !peer.matches_ip(remote_ip) {
        return Err(Unresolved::AddressMismatch {
            code,
            expected: peer.ip,
            actual: remote_ip,
        });
    }

    Ok(peer)
}

/// One-shot listener capturing the first message
struct ClaimListener {
    tx: Mutex<Option<oneshot::Sender<String>>>,
}

impl MessageListener for ClaimListener {
    fn on_message(&self, text: String) -> ListenerControl {
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = tx {
            let _ = tx.send(text);
        }
        ListenerControl::Detach
    }
}

/// Pending identification of one accepted connection
pub struct IdentityResolver {
    connection: Arc<Connection>,
    claim_rx: oneshot::Receiver<String>,
    timeout: Duration,
}

impl IdentityResolver {
    /// Install the claim listener on a fresh connection.
    ///
    /// Must run before the connection starts receiving so the first message
    /// is the one captured.
    pub fn new(connection: Arc<Connection>, config: &IdentityConfig) -> Self {
        let (tx, claim_rx) = oneshot::channel();
        connection.set_listener(Arc::new(ClaimListener {
            tx: Mutex::new(Some(tx)),
        }));

        Self {
            connection,
            claim_rx,
            timeout: config.timeout(),
        }
    }

    /// Connection being identified
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Wait for the claim and validate it.
    ///
    /// On failure the connection is closed without telling the remote why.
    /// Messages sent after the claim stay queued on the connection for the
    /// session listener installed next.
    pub async fn resolve(self, directory: &dyn Directory) -> Result<Peer, Unresolved> {
        let remote = self.connection.remote_addr();

        let outcome = tokio::select! {
            biased;

            claim = tokio::time::timeout(self.timeout, self.claim_rx) => match claim {
                Ok(Ok(text)) => validate_claim(&text, remote.ip(), directory),
                Ok(Err(_)) => Err(Unresolved::Disconnected),
                Err(_) => Err(Unresolved::Timeout),
            },
            () = self.connection.closed() => Err(Unresolved::Disconnected),
        };

        match &outcome {
            Ok(peer) => {
                tracing::info!("Connection from {} identified as peer {} ({})", remote, peer.code, peer.nick);
            }
            Err(reason) => {
                tracing::debug!("Rejecting connection from {}: {}", remote, reason);
                self.connection.disconnect();
            }
        }

        outcome
    }
}
