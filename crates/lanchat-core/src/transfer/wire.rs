//! Data connection handshake
//!
//! The data connection reuses the session frame codec for its control
//! messages. The sender opens with a header frame, the receiver answers
//! [`READY`] once the header matches the accepted offer, raw file bytes
//! follow, and the receiver closes the exchange with [`DONE`].
//!
//! ```text
//! LANCHAT-XFER/1 <sender code> <hash, 16 hex digits> <size> <file name>
//! ```
//!
//! The file name is last so it may contain spaces.

use std::time::Duration;

use tokio::io::AsyncRead;

use super::{FileHash, TransferKey, transfer_error};
use crate::error::{Result, SessionError};
use crate::frame::FrameReader;
use crate::peer::PeerCode;

/// Header magic and protocol version
pub const HEADER_MAGIC: &str = "LANCHAT-XFER/1";

/// Receiver is ready for file bytes
pub const READY: &str = "READY";

/// Receiver has stored every byte
pub const DONE: &str = "DONE";

/// First frame on a data connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferHeader {
    /// Sender's peer code
    pub from: PeerCode,
    /// Content hash
    pub hash: FileHash,
    /// Size in bytes
    pub size: u64,
    /// File name as offered
    pub file_name: String,
}

impl TransferHeader {
    /// Render as a frame payload
    pub fn to_line(&self) -> String {
        format!(
            "{} {} {:016x} {} {}",
            HEADER_MAGIC, self.from, self.hash, self.size, self.file_name
        )
    }

    /// Parse a header frame.
    ///
    /// # Errors
    ///
    /// Returns a transfer error for a wrong magic or malformed field.
    pub fn parse(line: &str) -> Result<Self> {
        let mut parts = line.splitn(5, ' ');
        let (Some(magic), Some(from), Some(hash), Some(size), Some(file_name)) = (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) else {
            return Err(SessionError::transfer("truncated transfer header"));
        };

        if magic != HEADER_MAGIC {
            return Err(transfer_error(format!("unexpected header magic {magic:?}")));
        }

        Ok(Self {
            from: from
                .parse()
                .map_err(|_| SessionError::transfer("bad sender code in header"))?,
            hash: FileHash::from_str_radix(hash, 16)
                .map_err(|_| SessionError::transfer("bad hash in header"))?,
            size: size
                .parse()
                .map_err(|_| SessionError::transfer("bad size in header"))?,
            file_name: file_name.to_string(),
        })
    }

    /// Check the header against the transfer the receiver accepted.
    ///
    /// # Errors
    ///
    /// Returns a transfer error naming the first field that differs.
    pub fn validate(&self, key: &TransferKey, size: u64) -> Result<()> {
        if self.from != key.peer {
            return Err(SessionError::transfer("header sender does not match offer"));
        }
        if self.hash != key.hash || self.file_name != key.file_name {
            return Err(SessionError::transfer("header names a different file"));
        }
        if self.size != size {
            return Err(SessionError::transfer("header size does not match offer"));
        }
        Ok(())
    }
}

/// Read one control frame and require it to be `expected`.
///
/// # Errors
///
/// Returns a timeout error, a transfer error for any other frame or an
/// early close, or the underlying read error.
pub async fn expect_frame<R>(
    reader: &mut FrameReader<R>,
    expected: &'static str,
    timeout: Duration,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    match tokio::time::timeout(timeout, reader.next_frame()).await {
        Err(_) => Err(SessionError::Timeout(format!("waiting for {expected}").into())),
        Ok(Ok(Some(line))) if line == expected => Ok(()),
        Ok(Ok(Some(line))) => Err(transfer_error(format!("expected {expected}, got {line:?}"))),
        Ok(Ok(None)) => Err(transfer_error(format!("peer closed before {expected}"))),
        Ok(Err(e)) => Err(e),
    }
}
