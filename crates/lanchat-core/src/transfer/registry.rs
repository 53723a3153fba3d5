//! Transfer registry
//!
//! Holds at most one live transfer per key and direction. A terminal entry
//! may be replaced; entries are removed by identity so a stale task can
//! never evict the transfer that replaced it.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::TransferKey;
use super::state::{Transfer, TransferDirection};
use crate::error::{Result, SessionError};

/// Live transfers, keyed by (peer, file name, hash)
#[derive(Debug, Default)]
pub struct TransferRegistry {
    outgoing: DashMap<TransferKey, Arc<Transfer>>,
    incoming: DashMap<TransferKey, Arc<Transfer>>,
}

impl TransferRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self, direction: TransferDirection) -> &DashMap<TransferKey, Arc<Transfer>> {
        match direction {
            TransferDirection::Send => &self.outgoing,
            TransferDirection::Receive => &self.incoming,
        }
    }

    /// Register a transfer.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::DuplicateTransfer`] if a non-terminal transfer
    /// with the same key and direction exists.
    pub fn register(&self, transfer: &Arc<Transfer>) -> Result<()> {
        match self.map(transfer.direction()).entry(transfer.key().clone()) {
            Entry::Occupied(mut entry) => {
                if !entry.get().state().is_terminal() {
                    return Err(SessionError::DuplicateTransfer(transfer.key().clone()));
                }
                entry.insert(Arc::clone(transfer));
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(transfer));
            }
        }
        Ok(())
    }

    /// Remove this exact transfer. Returns whether it was present.
    pub fn remove(&self, transfer: &Arc<Transfer>) -> bool {
        self.map(transfer.direction())
            .remove_if(transfer.key(), |_, current| Arc::ptr_eq(current, transfer))
            .is_some()
    }

    /// Outgoing transfer for the key
    pub fn outgoing(&self, key: &TransferKey) -> Option<Arc<Transfer>> {
        self.outgoing.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Incoming transfer for the key
    pub fn incoming(&self, key: &TransferKey) -> Option<Arc<Transfer>> {
        self.incoming.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Whether an outgoing transfer exists for the key
    pub fn contains_outgoing(&self, key: &TransferKey) -> bool {
        self.outgoing.contains_key(key)
    }

    /// Whether an incoming transfer exists for the key
    pub fn contains_incoming(&self, key: &TransferKey) -> bool {
        self.incoming.contains_key(key)
    }

    /// Number of registered transfers in both directions
    pub fn len(&self) -> usize {
        self.outgoing.len() + self.incoming.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.outgoing.is_empty() && self.incoming.is_empty()
    }

    /// Snapshot of every registered transfer
    pub fn all(&self) -> Vec<Arc<Transfer>> {
        self.outgoing
            .iter()
            .chain(self.incoming.iter())
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}
