//! Unknown-sender resolution buffer
//!
//! Presence events carry only a sender code, and they can overtake the
//! announcement that introduces the sender. An event from a code the
//! directory does not know yet is parked here:
//!
//! ```text
//! event(from 77) ──► directory knows 77? ── yes ──► sink.deliver(peer, event)
//!                          │ no
//!                          ▼
//!              waiting set += 77  (first waiter: expose + get-topic broadcast)
//!                          │
//!              wait task: re-check every poll interval, wake early on
//!                         peer_known(), give up at the deadline
//!                          │
//!              waiting set -= 77 ──► deliver with peer, or drop and log
//! ```
//!
//! Each parked event waits on its own task so one unresolved sender never
//! holds up other traffic. The number of parked events is bounded.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

use crate::config::ResolutionConfig;
use crate::peer::{Directory, Peer, PeerCode};
use crate::presence::{EventSink, Presence, PresenceEvent};

/// What happened to a submitted event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// Sender was known; delivered immediately
    Delivered,
    /// Sender unknown; waiting for it to resolve
    Deferred,
    /// Too many events already waiting; dropped
    Dropped,
}

#[derive(Debug)]
struct Waiting {
    waiters: usize,
    since: Instant,
}

/// Defers delivery of events from not-yet-known peers
pub struct ResolutionBuffer {
    config: ResolutionConfig,
    directory: Arc<dyn Directory>,
    presence: Arc<dyn Presence>,
    sink: Arc<dyn EventSink>,
    waiting: DashMap<PeerCode, Waiting>,
    known: Notify,
    slots: Arc<Semaphore>,
}

impl ResolutionBuffer {
    /// Create a buffer delivering resolved events to `sink`
    pub fn new(
        config: ResolutionConfig,
        directory: Arc<dyn Directory>,
        presence: Arc<dyn Presence>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_pending));
        Self {
            config,
            directory,
            presence,
            sink,
            waiting: DashMap::new(),
            known: Notify::new(),
            slots,
        }
    }

    /// Deliver an event now if its sender is known, otherwise park it
    pub fn submit(self: &Arc<Self>, event: PresenceEvent) -> Submission {
        let code = event.sender();

        if let Some(peer) = self.directory.lookup(code) {
            self.sink.deliver(&peer, event);
            return Submission::Delivered;
        }

        let Ok(permit) = Arc::clone(&self.slots).try_acquire_owned() else {
            tracing::warn!("Resolution buffer full, dropping event from unknown peer {}", code);
            return Submission::Dropped;
        };

        let first_waiter = {
            let mut entry = self.waiting.entry(code).or_insert_with(|| Waiting {
                waiters: 0,
                since: Instant::now(),
            });
            entry.waiters += 1;
            entry.waiters == 1
        };

        if first_waiter {
            tracing::debug!("Peer {} unknown, requesting directory refresh", code);
            self.request_refresh();
        }

        let buffer = Arc::clone(self);
        tokio::spawn(async move { buffer.wait_and_deliver(code, event, permit).await });
        Submission::Deferred
    }

    fn request_refresh(&self) {
        if let Err(e) = self.presence.broadcast_expose() {
            tracing::warn!("Expose broadcast failed: {}", e);
        }
        if let Err(e) = self.presence.broadcast_get_topic() {
            tracing::warn!("Get-topic broadcast failed: {}", e);
        }
    }

    async fn wait_and_deliver(&self, code: PeerCode, event: PresenceEvent, _permit: OwnedSemaphorePermit) {
        let peer = self.wait_for_peer(code).await;
        let waited = self.release(code);

        match peer {
            Some(peer) => {
                tracing::debug!("Peer {} resolved after {:?}, delivering deferred event", code, waited);
                self.sink.deliver(&peer, event);
            }
            None => {
                tracing::info!(
                    "Dropping event from peer {}: still unknown after {:?}",
                    code,
                    self.config.timeout()
                );
            }
        }
    }

    async fn wait_for_peer(&self, code: PeerCode) -> Option<Peer> {
        let deadline = tokio::time::Instant::now() + self.config.timeout();

        loop {
            // Registered before the lookup so a peer_known() in between is seen
            let notified = self.known.notified();

            if let Some(peer) = self.directory.lookup(code) {
                return Some(peer);
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return None;
            }

            let pause = self.config.poll_interval.min(deadline - now);
            tokio::select! {
                () = notified => {}
                () = tokio::time::sleep(pause) => {}
            }
        }
    }

    /// Drop one waiter for `code`, returning how long the code had waited
    fn release(&self, code: PeerCode) -> Option<std::time::Duration> {
        match self.waiting.entry(code) {
            Entry::Occupied(mut entry) => {
                let waited = entry.get().since.elapsed();
                entry.get_mut().waiters -= 1;
                if entry.get().waiters == 0 {
                    entry.remove();
                }
                Some(waited)
            }
            Entry::Vacant(_) => None,
        }
    }

    /// Wake waiters early after the directory learned a peer
    pub fn peer_known(&self, code: PeerCode) {
        if self.waiting.contains_key(&code) {
            tracing::debug!("Peer {} became known, waking deferred events", code);
        }
        self.known.notify_waiters();
    }

    /// Whether events from `code` are waiting
    pub fn is_waiting(&self, code: PeerCode) -> bool {
        self.waiting.contains_key(&code)
    }

    /// Number of distinct codes being waited for
    pub fn waiting_count(&self) -> usize {
        self.waiting.len()
    }

    /// Number of parked events
    pub fn pending_events(&self) -> usize {
        self.config.max_pending - self.slots.available_permits()
    }
}
