//! Error types for the session layer
//!
//! Errors are categorized the same way callers react to them:
//!
//! - **Transient**: the operation may succeed later without intervention
//!   (a peer that is not listening yet, a timeout, a refused connect)
//! - **Permanent**: retrying is pointless until something else changes
//!   (unknown peer, duplicate transfer, bad configuration)
//!
//! Most network faults never reach a caller as an error at all: a failing
//! [`Connection`](crate::connection::Connection) reports through its disconnect
//! callback and a failing transfer lands in `Failed`. The variants below cover
//! the operations that do return a `Result`.

use std::borrow::Cow;
use thiserror::Error;

use crate::peer::PeerCode;
use crate::transfer::TransferKey;

/// Errors that can occur in session layer operations
#[derive(Debug, Error, Clone)]
pub enum SessionError {
    // ============ Transport Errors ============
    /// Every port in the fallback range was taken
    #[error("No free session port: tried {attempts} ports starting at {base}")]
    PortsExhausted {
        /// First port tried
        base: u16,
        /// Number of consecutive ports tried
        attempts: u16,
    },

    /// Transport operation failed
    #[error("Transport error: {0}")]
    Transport(Cow<'static, str>),

    /// Socket or file I/O error
    #[error("I/O error: {0}")]
    Io(String),

    /// Text frame could not be encoded or decoded
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    // ============ Session Errors ============
    /// No live session for the peer
    #[error("No session for peer {0}")]
    SessionNotFound(PeerCode),

    /// Peer code is not in the directory
    #[error("Peer {0} not found in directory")]
    PeerNotFound(PeerCode),

    /// Peer is known but has not advertised a session port
    #[error("Peer {0} has no advertised session port")]
    NoSessionPort(PeerCode),

    // ============ Transfer Errors ============
    /// A live transfer already exists for the key
    #[error("Transfer already in progress: {0}")]
    DuplicateTransfer(TransferKey),

    /// No transfer or offer exists for the key
    #[error("Transfer not found: {0}")]
    TransferNotFound(TransferKey),

    /// Transfer protocol or streaming failure
    #[error("Transfer error: {0}")]
    Transfer(Cow<'static, str>),

    // ============ Configuration & State Errors ============
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// Operation not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(Cow<'static, str>),
}

impl SessionError {
    /// Returns true if this error is transient and may succeed on retry
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SessionError::Transport(_)
                | SessionError::Io(_)
                | SessionError::Timeout(_)
                | SessionError::NoSessionPort(_)
        )
    }

    /// Returns true if this error is permanent and will not succeed on retry
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            SessionError::PeerNotFound(_)
                | SessionError::SessionNotFound(_)
                | SessionError::DuplicateTransfer(_)
                | SessionError::TransferNotFound(_)
                | SessionError::InvalidConfig(_)
                | SessionError::Frame(_)
        )
    }

    /// Create a transport error with static context (zero allocation)
    #[must_use]
    pub const fn transport(context: &'static str) -> Self {
        SessionError::Transport(Cow::Borrowed(context))
    }

    /// Create a transfer error with static context (zero allocation)
    #[must_use]
    pub const fn transfer(context: &'static str) -> Self {
        SessionError::Transfer(Cow::Borrowed(context))
    }

    /// Create a timeout error with static context (zero allocation)
    #[must_use]
    pub const fn timeout(context: &'static str) -> Self {
        SessionError::Timeout(Cow::Borrowed(context))
    }

    /// Create an invalid state error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_state(context: &'static str) -> Self {
        SessionError::InvalidState(Cow::Borrowed(context))
    }

    /// Create an invalid configuration error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_config(context: &'static str) -> Self {
        SessionError::InvalidConfig(Cow::Borrowed(context))
    }
}

impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        SessionError::Io(err.to_string())
    }
}

/// Text frame codec errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Encoded text does not fit the 16-bit length prefix
    #[error("encoded text is {0} bytes, frame limit is 65535")]
    TooLong(usize),

    /// Byte sequence is not valid modified UTF-8
    #[error("malformed modified UTF-8 at byte {0}")]
    Malformed(usize),
}

/// Result type for session layer operations
pub type Result<T> = std::result::Result<T, SessionError>;
