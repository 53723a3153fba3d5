//! Presence layer boundary
//!
//! The broadcast presence transport lives outside this crate. The session
//! layer consumes it through [`Presence`] (outgoing broadcasts and directed
//! announcements) and is fed by it through [`PresenceEvent`]s, which may name
//! a sender the local [`Directory`](crate::peer::Directory) has not learned yet.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

use crate::error::Result;
use crate::peer::{Peer, PeerCode};
use crate::transfer::FileHash;

/// Directed file-negotiation announcement sent through the presence layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Announcement {
    /// Sender offers a file
    FileOffer {
        /// Recipient
        to: PeerCode,
        /// File name (no directory)
        file_name: String,
        /// Total size in bytes
        size: u64,
        /// Content hash, used only to identify the transfer
        hash: FileHash,
    },
    /// Receiver accepts; the offer echoed back with the data port
    FileAccept {
        /// Recipient (the original sender)
        to: PeerCode,
        /// File name
        file_name: String,
        /// Total size in bytes
        size: u64,
        /// Content hash
        hash: FileHash,
        /// Receiver's transfer-specific listening port
        port: u16,
    },
    /// Receiver declines the offer
    FileReject {
        /// Recipient (the original sender)
        to: PeerCode,
        /// File name
        file_name: String,
        /// Content hash
        hash: FileHash,
    },
}

impl Announcement {
    /// Peer the announcement is addressed to
    #[must_use]
    pub fn recipient(&self) -> PeerCode {
        match self {
            Self::FileOffer { to, .. } | Self::FileAccept { to, .. } | Self::FileReject { to, .. } => {
                *to
            }
        }
    }

    /// The event the recipient observes when this announcement arrives from `from`
    #[must_use]
    pub fn into_event(self, from: PeerCode) -> PresenceEvent {
        match self {
            Self::FileOffer {
                file_name,
                size,
                hash,
                ..
            } => PresenceEvent::FileOffer {
                from,
                file_name,
                size,
                hash,
            },
            Self::FileAccept {
                file_name,
                size,
                hash,
                port,
                ..
            } => PresenceEvent::FileAccept {
                from,
                file_name,
                size,
                hash,
                port,
            },
            Self::FileReject {
                file_name, hash, ..
            } => PresenceEvent::FileReject {
                from,
                file_name,
                hash,
            },
        }
    }
}

/// Outgoing side of the presence layer
pub trait Presence: Send + Sync {
    /// Ask every peer to re-announce itself
    fn broadcast_expose(&self) -> Result<()>;

    /// Ask for the current channel topic
    fn broadcast_get_topic(&self) -> Result<()>;

    /// Send a directed file-negotiation announcement
    fn announce(&self, announcement: Announcement) -> Result<()>;
}

/// Inbound presence event, tagged only by sender code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresenceEvent {
    /// Public chat line
    Message {
        /// Sender
        from: PeerCode,
        /// Text
        text: String,
    },
    /// Incoming file offer
    FileOffer {
        /// Sender
        from: PeerCode,
        /// File name
        file_name: String,
        /// Total size in bytes
        size: u64,
        /// Content hash
        hash: FileHash,
    },
    /// Our offer was accepted
    FileAccept {
        /// Receiver that accepted
        from: PeerCode,
        /// File name
        file_name: String,
        /// Total size in bytes
        size: u64,
        /// Content hash
        hash: FileHash,
        /// Port to connect to
        port: u16,
    },
    /// Our offer was rejected
    FileReject {
        /// Receiver that rejected
        from: PeerCode,
        /// File name
        file_name: String,
        /// Content hash
        hash: FileHash,
    },
    /// Channel topic changed
    TopicChanged {
        /// Peer that set it
        from: PeerCode,
        /// New topic
        topic: String,
    },
    /// Away flag changed
    Away {
        /// Peer
        from: PeerCode,
        /// New away state
        away: bool,
    },
    /// Idle notice
    Idle {
        /// Peer
        from: PeerCode,
        /// Idle since
        since: SystemTime,
    },
}

impl PresenceEvent {
    /// Code of the peer the event is attributed to
    #[must_use]
    pub fn sender(&self) -> PeerCode {
        match self {
            Self::Message { from, .. }
            | Self::FileOffer { from, .. }
            | Self::FileAccept { from, .. }
            | Self::FileReject { from, .. }
            | Self::TopicChanged { from, .. }
            | Self::Away { from, .. }
            | Self::Idle { from, .. } => *from,
        }
    }
}

/// Consumer of presence events whose sender is known
pub trait EventSink: Send + Sync {
    /// Deliver an event together with the sender's directory record
    fn deliver(&self, peer: &Peer, event: PresenceEvent);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_into_event() {
        let announcement = Announcement::FileAccept {
            to: 5,
            file_name: "report.pdf".to_string(),
            size: 1000,
            hash: 42,
            port: 51000,
        };
        assert_eq!(announcement.recipient(), 5);

        let event = announcement.into_event(9);
        assert_eq!(event.sender(), 9);
        assert!(matches!(event, PresenceEvent::FileAccept { port: 51000, .. }));
    }

    #[test]
    fn test_reject_into_event() {
        let event = Announcement::FileReject {
            to: 5,
            file_name: "a.txt".to_string(),
            hash: 1,
        }
        .into_event(7);
        assert_eq!(
            event,
            PresenceEvent::FileReject {
                from: 7,
                file_name: "a.txt".to_string(),
                hash: 1
            }
        );
    }
}
