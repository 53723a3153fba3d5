//! # LanChat Core
//!
//! Peer session layer for a LAN chat client whose peers are discovered over
//! an unordered, best-effort broadcast presence channel.
//!
//! This crate provides:
//! - Length-prefixed modified UTF-8 text frames, byte-compatible with legacy peers
//! - Framed TCP connections with a single-slot listener and a receive task
//! - A session server with sequential port fallback
//! - Identification of inbound connections anchored on the peer's known address
//! - A per-peer session registry
//! - Negotiated file transfer with progress and cancellation
//! - Deferred delivery of presence events from not-yet-known senders
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          ChatNode                               │
//! │   (wires everything to the app's Directory and Presence)        │
//! ├──────────────────────────────┬──────────────────────────────────┤
//! │  SessionServer               │  ResolutionBuffer                │
//! │  IdentityResolver            │  (unknown-sender events)         │
//! │  SessionRegistry             │  TransferEngine                  │
//! ├──────────────────────────────┴──────────────────────────────────┤
//! │                         Connection                              │
//! │   (one socket, one receive task, one write path)                │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                           Frames                                │
//! │   (u16 length + modified UTF-8)                                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![forbid(unsafe_code)]

pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod identity;
pub mod node;
pub mod peer;
pub mod presence;
pub mod resolution;
pub mod server;
pub mod session;
pub mod transfer;

pub use config::{IdentityConfig, ResolutionConfig, ServerConfig, SessionConfig, TransferConfig};
pub use connection::{Connection, ConnectionId, ListenerControl, MessageListener};
pub use error::{FrameError, Result, SessionError};
pub use identity::{IdentityResolver, Unresolved, validate_claim};
pub use node::ChatNode;
pub use peer::{Directory, MemoryDirectory, Peer, PeerCode};
pub use presence::{Announcement, EventSink, Presence, PresenceEvent};
pub use resolution::{ResolutionBuffer, Submission};
pub use server::SessionServer;
pub use session::{SessionListener, SessionRegistry};
pub use transfer::{
    FileHash, IncomingOffer, OfferListener, Transfer, TransferDirection, TransferEngine,
    TransferKey, TransferListener, TransferProgress, TransferState,
};

/// Well-known first session port
pub const DEFAULT_BASE_PORT: u16 = 6790;

/// Consecutive session ports tried before giving up
pub const DEFAULT_PORT_ATTEMPTS: u16 = 50;
