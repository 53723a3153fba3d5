//! Transfer state machine
//!
//! ```text
//! Waiting ──► Connecting ──► Transferring ──► Completed
//!    │             │               │
//!    └─────────────┴───────────────┴────────► Failed
//! ```
//!
//! `Failed` is also where cancellation lands. Terminal states never change.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use tokio::sync::watch;

use super::TransferKey;
use super::progress::{TransferProgress, percent_complete};

/// Lifecycle state of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// Negotiating: offer sent, or accept announced and listening
    Waiting,
    /// Data connection being established
    Connecting,
    /// Bytes flowing
    Transferring,
    /// All bytes delivered and confirmed
    Completed,
    /// Error, rejection, or cancellation
    Failed,
}

impl TransferState {
    /// Whether the state is final
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether `next` is a legal successor
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Waiting, Self::Connecting)
                | (Self::Connecting, Self::Transferring)
                | (Self::Transferring, Self::Completed)
                | (Self::Waiting | Self::Connecting | Self::Transferring, Self::Failed)
        )
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Waiting => write!(f, "Waiting"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Transferring => write!(f, "Transferring"),
            Self::Completed => write!(f, "Completed"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Which side of the transfer this node is on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// Local file going out
    Send,
    /// Remote file coming in
    Receive,
}

/// Transfer lifecycle and progress notifications.
///
/// Every method defaults to doing nothing. Callbacks run on the task that
/// drives the transfer and must not block.
pub trait TransferListener: Send + Sync {
    /// Transfer created and negotiating
    fn on_waiting(&self, _transfer: &Transfer) {}

    /// Data connection being set up
    fn on_connecting(&self, _transfer: &Transfer) {}

    /// Streaming started
    fn on_transferring(&self, _transfer: &Transfer) {}

    /// Transfer finished successfully
    fn on_completed(&self, _transfer: &Transfer) {}

    /// Transfer failed, was rejected, or was cancelled
    fn on_failed(&self, _transfer: &Transfer, _reason: &str) {}

    /// Periodic progress: total bytes so far, bytes/sec over the rolling
    /// window, and integer percent
    fn on_progress(&self, _transfer: &Transfer, _bytes: u64, _speed: f64, _percent: u8) {}
}

/// Listener that ignores every notification
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTransferListener;

impl TransferListener for NoopTransferListener {}

/// One live transfer
pub struct Transfer {
    key: TransferKey,
    direction: TransferDirection,
    size: u64,
    /// Source file when sending, destination when receiving
    path: PathBuf,
    bytes: AtomicU64,
    /// Last reported speed, as `f64` bits
    speed_bits: AtomicU64,
    state: Mutex<TransferState>,
    cancel_tx: watch::Sender<bool>,
    listener: Arc<dyn TransferListener>,
    created_at: Instant,
}

impl Transfer {
    /// Create a transfer in `Waiting`
    pub fn new(
        key: TransferKey,
        direction: TransferDirection,
        size: u64,
        path: PathBuf,
        listener: Arc<dyn TransferListener>,
    ) -> Arc<Self> {
        let (cancel_tx, _) = watch::channel(false);
        Arc::new(Self {
            key,
            direction,
            size,
            path,
            bytes: AtomicU64::new(0),
            speed_bits: AtomicU64::new(0f64.to_bits()),
            state: Mutex::new(TransferState::Waiting),
            cancel_tx,
            listener,
            created_at: Instant::now(),
        })
    }

    /// Transfer key
    pub fn key(&self) -> &TransferKey {
        &self.key
    }

    /// Direction
    pub fn direction(&self) -> TransferDirection {
        self.direction
    }

    /// Total size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Local file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current state
    pub fn state(&self) -> TransferState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bytes moved so far
    pub fn bytes_transferred(&self) -> u64 {
        self.bytes.load(Ordering::Acquire)
    }

    /// Time since the transfer was created
    pub fn elapsed(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// Fire `on_waiting`; called once the transfer is registered
    pub(crate) fn announce_waiting(&self) {
        self.listener.on_waiting(self);
    }

    /// Move to `next` if the state machine allows it, notifying the listener.
    ///
    /// Returns whether the transition happened.
    pub fn advance(&self, next: TransferState) -> bool {
        if next == TransferState::Failed {
            return self.fail("failed");
        }

        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if !state.can_transition_to(next) {
                return false;
            }
            *state = next;
        }

        tracing::debug!("Transfer {} -> {}", self.key, next);
        match next {
            TransferState::Waiting => self.listener.on_waiting(self),
            TransferState::Connecting => self.listener.on_connecting(self),
            TransferState::Transferring => self.listener.on_transferring(self),
            TransferState::Completed => self.listener.on_completed(self),
            TransferState::Failed => {}
        }
        true
    }

    /// Mark completed
    pub fn complete(&self) -> bool {
        self.advance(TransferState::Completed)
    }

    /// Land in `Failed` with a reason. No-op once terminal.
    pub fn fail(&self, reason: &str) -> bool {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.is_terminal() {
                return false;
            }
            *state = TransferState::Failed;
        }

        self.cancel_tx.send_replace(true);
        tracing::debug!("Transfer {} failed: {}", self.key, reason);
        self.listener.on_failed(self, reason);
        true
    }

    /// Cancel the transfer. No-op after `Completed`.
    pub fn cancel(&self) -> bool {
        self.fail("cancelled")
    }

    /// Whether the transfer was cancelled or failed
    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    /// Wait until the transfer is cancelled or fails
    pub async fn cancelled(&self) {
        let mut rx = self.cancel_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Record the running byte count
    pub(crate) fn set_bytes(&self, bytes: u64) {
        self.bytes.store(bytes, Ordering::Release);
    }

    /// Publish a progress sample to the listener
    pub(crate) fn report_progress(&self, speed: f64) {
        self.speed_bits.store(speed.to_bits(), Ordering::Release);
        let bytes = self.bytes_transferred();
        self.listener
            .on_progress(self, bytes, speed, percent_complete(bytes, self.size));
    }

    /// Point-in-time progress snapshot
    pub fn progress(&self) -> TransferProgress {
        TransferProgress::new(
            self.key.clone(),
            self.direction,
            self.state(),
            self.bytes_transferred(),
            self.size,
            f64::from_bits(self.speed_bits.load(Ordering::Acquire)),
        )
    }
}

impl fmt::Debug for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transfer")
            .field("key", &self.key)
            .field("direction", &self.direction)
            .field("size", &self.size)
            .field("bytes", &self.bytes_transferred())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl TransferListener for Recorder {
        fn on_connecting(&self, _transfer: &Transfer) {
            self.events.lock().unwrap().push("connecting".into());
        }
        fn on_transferring(&self, _transfer: &Transfer) {
            self.events.lock().unwrap().push("transferring".into());
        }
        fn on_completed(&self, _transfer: &Transfer) {
            self.events.lock().unwrap().push("completed".into());
        }
        fn on_failed(&self, _transfer: &Transfer, reason: &str) {
            self.events.lock().unwrap().push(format!("failed: {reason}"));
        }
        fn on_progress(&self, _transfer: &Transfer, bytes: u64, _speed: f64, percent: u8) {
            self.events.lock().unwrap().push(format!("progress {bytes} {percent}%"));
        }
    }

    fn transfer(listener: Arc<dyn TransferListener>) -> Arc<Transfer> {
        Transfer::new(
            TransferKey::new(9, "report.pdf", 42),
            TransferDirection::Send,
            1000,
            PathBuf::from("report.pdf"),
            listener,
        )
    }

    #[test]
    fn test_legal_transitions() {
        use TransferState::*;
        assert!(Waiting.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Transferring));
        assert!(Transferring.can_transition_to(Completed));
        assert!(Waiting.can_transition_to(Failed));
        assert!(Transferring.can_transition_to(Failed));

        assert!(!Waiting.can_transition_to(Transferring));
        assert!(!Waiting.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Connecting));
    }

    #[test]
    fn test_happy_path_notifies_in_order() {
        let recorder = Arc::new(Recorder::default());
        let t = transfer(recorder.clone());

        assert!(t.advance(TransferState::Connecting));
        assert!(t.advance(TransferState::Transferring));
        t.set_bytes(500);
        t.report_progress(100.0);
        assert!(t.complete());

        assert_eq!(
            *recorder.events.lock().unwrap(),
            vec!["connecting", "transferring", "progress 500 50%", "completed"]
        );
    }

    #[test]
    fn test_cancel_after_completed_is_noop() {
        let recorder = Arc::new(Recorder::default());
        let t = transfer(recorder.clone());
        t.advance(TransferState::Connecting);
        t.advance(TransferState::Transferring);
        t.complete();

        assert!(!t.cancel());
        assert_eq!(t.state(), TransferState::Completed);
        assert!(!t.is_cancelled());
    }

    #[test]
    fn test_cancel_lands_in_failed() {
        let recorder = Arc::new(Recorder::default());
        let t = transfer(recorder.clone());

        assert!(t.cancel());
        assert!(!t.cancel());
        assert_eq!(t.state(), TransferState::Failed);
        assert!(t.is_cancelled());
        assert!(!t.advance(TransferState::Connecting));
        assert_eq!(*recorder.events.lock().unwrap(), vec!["failed: cancelled"]);
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let t = transfer(Arc::new(NoopTransferListener));
        let waiter = {
            let t = Arc::clone(&t);
            tokio::spawn(async move { t.cancelled().await })
        };
        t.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_progress_snapshot() {
        let t = transfer(Arc::new(NoopTransferListener));
        t.set_bytes(250);
        t.report_progress(50.0);

        let snapshot = t.progress();
        assert_eq!(snapshot.bytes_transferred, 250);
        assert_eq!(snapshot.percent, 25);
        assert_eq!(snapshot.state, TransferState::Waiting);
    }
}
