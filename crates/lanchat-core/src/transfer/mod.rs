//! File transfer
//!
//! Transfers are negotiated through presence announcements and streamed over
//! a dedicated TCP connection to a port the receiver opens per transfer.
//!
//! # Transfer Flow
//!
//! ```text
//! Sender                                    Receiver
//!   |                                           |
//!   |== FileOffer (name, size, hash) ==========>|   presence
//!   |                                           |   bind ephemeral port
//!   |<========== FileAccept (... , port) =======|   presence
//!   |                                           |
//!   |-- connect (retried with backoff) -------->|   data connection
//!   |-- header frame -------------------------->|   validated
//!   |<------------------------------- READY ----|
//!   |-- raw file bytes ------------------------>|
//!   |<-------------------------------- DONE ----|
//!   |                                           |
//!   | [Completed]                   [Completed] |
//! ```
//!
//! A rejected offer is answered with `FileReject` instead and the sender
//! drops its pending transfer.

mod engine;
mod progress;
mod registry;
mod state;
mod wire;

pub use engine::{IncomingOffer, OfferListener, TransferEngine};
pub use progress::{ProgressMeter, TransferProgress, percent_complete};
pub use registry::TransferRegistry;
pub use state::{NoopTransferListener, Transfer, TransferDirection, TransferListener, TransferState};
pub use wire::{DONE, READY, TransferHeader};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use tokio::io::AsyncReadExt;

use crate::error::{Result, SessionError};
use crate::peer::PeerCode;

/// Content hash identifying a transfer (not an integrity check)
pub type FileHash = u64;

/// Unique key of a transfer: (peer, file name, hash).
///
/// On the sending side `peer` is the receiver, on the receiving side it is
/// the sender.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferKey {
    /// Remote peer
    pub peer: PeerCode,
    /// File name as announced
    pub file_name: String,
    /// Content hash
    pub hash: FileHash,
}

impl TransferKey {
    /// Create a transfer key
    pub fn new(peer: PeerCode, file_name: impl Into<String>, hash: FileHash) -> Self {
        Self {
            peer,
            file_name: file_name.into(),
            hash,
        }
    }
}

impl fmt::Display for TransferKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{:016x}", self.peer, self.file_name, self.hash)
    }
}

/// Reduce a file name received from the network to its final path component.
///
/// Returns `None` for names that would not name a regular file inside the
/// download directory.
pub fn sanitize_file_name(name: &str) -> Option<String> {
    let last = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim_matches(char::from(0))
        .trim();

    match last {
        "" | "." | ".." => None,
        name if name.contains(char::from(0)) => None,
        name => Some(name.to_string()),
    }
}

/// Compute the transfer hash of a file: the first eight bytes of its BLAKE3
/// digest.
///
/// # Errors
///
/// Returns an I/O error if the file cannot be read.
pub async fn hash_file(path: &Path) -> Result<FileHash> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest.as_bytes()[..8]);
    Ok(u64::from_be_bytes(prefix))
}

/// Hash of an in-memory buffer, matching [`hash_file`]
pub fn hash_bytes(data: &[u8]) -> FileHash {
    let digest = blake3::hash(data);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_be_bytes(prefix)
}

fn transfer_error(context: impl Into<String>) -> SessionError {
    SessionError::Transfer(context.into().into())
}
