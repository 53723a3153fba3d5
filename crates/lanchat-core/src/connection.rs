//! Framed connections
//!
//! A [`Connection`] is a duplex text-message channel over one TCP socket. It
//! owns a single background receive task and a single write path.
//!
//! ```text
//!                  ┌──────────────────────────────────────────┐
//!   send(text) ───►│ writer (async mutex) ──► socket          │
//!                  │                                          │
//!   socket ───────►│ receive task ──► backlog ──► listener    │
//!                  │      ▲                          slot     │
//!   disconnect() ─►│ close signal (watch)                     │
//!                  └──────────────────────────────────────────┘
//! ```
//!
//! The listener slot holds at most one [`MessageListener`]. Installing a new
//! listener silently replaces the old one. Messages that arrive while the slot
//! is empty wait in a backlog and are handed, in order, to the next listener.
//! Only the receive task drains the backlog, so per-connection delivery order
//! is preserved across listener hand-overs.
//!
//! Network faults never surface as errors to senders. A failed write or read
//! closes the connection and fires the disconnect callback exactly once.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Notify, watch};

use crate::error::{Result, SessionError};
use crate::frame::{FrameReader, encode_frame};

/// Process-unique connection identifier
pub type ConnectionId = u64;

/// Identifier of an installed listener, used to detach it later
pub type ListenerId = u64;

/// Messages held for a missing listener before the oldest are dropped
pub const MAX_BACKLOG: usize = 1024;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// What a listener wants after handling a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerControl {
    /// Stay installed
    Keep,
    /// Remove this listener from the slot
    Detach,
}

/// Receives text messages from a connection
pub trait MessageListener: Send + Sync {
    /// Handle one message. Runs on the connection's receive task.
    fn on_message(&self, text: String) -> ListenerControl;
}

impl<F> MessageListener for F
where
    F: Fn(String) -> ListenerControl + Send + Sync,
{
    fn on_message(&self, text: String) -> ListenerControl {
        self(text)
    }
}

/// Called once when a connection closes
pub type DisconnectCallback = Box<dyn FnOnce(ConnectionId) + Send>;

#[derive(Default)]
struct ListenerSlot {
    current: Option<(ListenerId, Arc<dyn MessageListener>)>,
    backlog: VecDeque<String>,
}

/// Duplex text-message channel bound to one socket
pub struct Connection {
    id: ConnectionId,
    remote: SocketAddr,
    connected: AtomicBool,
    reader: Mutex<Option<FrameReader<OwnedReadHalf>>>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    slot: Mutex<ListenerSlot>,
    listener_changed: Notify,
    on_disconnect: Mutex<Option<DisconnectCallback>>,
    close_tx: watch::Sender<bool>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Connection {
    /// Wrap an established stream (accepted or connected).
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the stream has no peer address.
    pub fn from_stream(stream: TcpStream) -> Result<Arc<Self>> {
        let remote = stream.peer_addr()?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY for {}: {}", remote, e);
        }
        let (read_half, write_half) = stream.into_split();
        let (close_tx, _) = watch::channel(false);

        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Connection {} established with {}", id, remote);

        Ok(Arc::new(Self {
            id,
            remote,
            connected: AtomicBool::new(true),
            reader: Mutex::new(Some(FrameReader::new(read_half))),
            writer: tokio::sync::Mutex::new(Some(write_half)),
            slot: Mutex::new(ListenerSlot::default()),
            listener_changed: Notify::new(),
            on_disconnect: Mutex::new(None),
            close_tx,
        }))
    }

    /// Open an outbound connection.
    ///
    /// # Errors
    ///
    /// Returns a timeout error if the connect does not finish within
    /// `timeout`, or the underlying I/O error.
    pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<Arc<Self>> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| SessionError::timeout("session connect"))??;
        Self::from_stream(stream)
    }

    /// Connection identifier
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Address of the remote end
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Whether the connection is still open
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Send one text message.
    ///
    /// Does nothing on a closed connection. A write failure closes the
    /// connection and is reported only through the disconnect callback.
    /// Returns whether the message was written.
    pub async fn send(&self, text: &str) -> bool {
        if !self.is_connected() {
            return false;
        }

        let frame = match encode_frame(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Connection {}: dropping unencodable message: {}", self.id, e);
                return false;
            }
        };

        let mut close_rx = self.close_tx.subscribe();
        if *close_rx.borrow_and_update() {
            return false;
        }

        let mut guard = tokio::select! {
            biased;

            _ = close_rx.changed() => return false,
            guard = self.writer.lock() => guard,
        };
        let Some(writer) = guard.as_mut() else {
            return false;
        };

        // A peer that stops reading must not pin the socket past disconnect()
        let outcome = tokio::select! {
            biased;

            _ = close_rx.changed() => None,
            result = async {
                writer.write_all(&frame).await?;
                writer.flush().await
            } => Some(result),
        };

        match outcome {
            Some(Ok(())) => {
                // Closed while we held the writer; disconnect() could not take it
                if !self.is_connected() {
                    guard.take();
                }
                true
            }
            Some(Err(e)) => {
                tracing::debug!("Connection {}: write to {} failed: {}", self.id, self.remote, e);
                guard.take();
                drop(guard);
                self.disconnect();
                false
            }
            None => {
                tracing::debug!("Connection {}: write to {} abandoned on close", self.id, self.remote);
                guard.take();
                false
            }
        }
    }

    /// Install the message listener, replacing any previous one.
    ///
    /// Backlogged messages are delivered to the new listener by the receive
    /// task, in arrival order.
    pub fn set_listener(&self, listener: Arc<dyn MessageListener>) -> ListenerId {
        let id = NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed);
        lock(&self.slot).current = Some((id, listener));
        self.listener_changed.notify_one();
        id
    }

    /// Remove the listener if it is still the installed one
    pub fn detach_listener(&self, id: ListenerId) -> bool {
        let mut slot = lock(&self.slot);
        match &slot.current {
            Some((current, _)) if *current == id => {
                slot.current = None;
                true
            }
            _ => false,
        }
    }

    /// Whether a listener is installed
    pub fn has_listener(&self) -> bool {
        lock(&self.slot).current.is_some()
    }

    /// Number of messages waiting for a listener
    pub fn backlog_len(&self) -> usize {
        lock(&self.slot).backlog.len()
    }

    /// Register the disconnect callback.
    ///
    /// Returns `false` (and drops the callback) if the connection is already
    /// closed, in which case the caller must clean up itself.
    pub fn set_on_disconnect(&self, callback: DisconnectCallback) -> bool {
        let mut slot = lock(&self.on_disconnect);
        if !self.is_connected() {
            return false;
        }
        *slot = Some(callback);
        true
    }

    /// Start the background receive task.
    ///
    /// Only the first call spawns a task; later calls return `false`.
    pub fn start_receiving(self: &Arc<Self>) -> bool {
        let Some(mut reader) = lock(&self.reader).take() else {
            return false;
        };

        let conn = Arc::clone(self);
        let mut close_rx = self.close_tx.subscribe();

        tokio::spawn(async move {
            loop {
                if *close_rx.borrow_and_update() {
                    break;
                }

                tokio::select! {
                    biased;

                    _ = close_rx.changed() => {}
                    () = conn.listener_changed.notified() => conn.flush_backlog(),
                    frame = reader.next_frame() => match frame {
                        Ok(Some(text)) => {
                            conn.enqueue(text);
                            conn.flush_backlog();
                        }
                        Ok(None) => {
                            tracing::debug!("Connection {}: closed by {}", conn.id, conn.remote);
                            break;
                        }
                        Err(e) => {
                            tracing::debug!("Connection {}: read from {} failed: {}", conn.id, conn.remote, e);
                            break;
                        }
                    },
                }
            }

            drop(reader);
            conn.disconnect();
        });

        true
    }

    fn enqueue(&self, text: String) {
        let mut slot = lock(&self.slot);
        if slot.backlog.len() >= MAX_BACKLOG {
            slot.backlog.pop_front();
            tracing::warn!("Connection {}: backlog full, dropping oldest message", self.id);
        }
        slot.backlog.push_back(text);
    }

    /// Deliver backlogged messages to the current listener. Receive task only.
    fn flush_backlog(&self) {
        loop {
            let (listener_id, listener, text) = {
                let mut slot = lock(&self.slot);
                let Some((listener_id, listener)) = slot.current.clone() else {
                    return;
                };
                let Some(text) = slot.backlog.pop_front() else {
                    return;
                };
                (listener_id, listener, text)
            };

            if listener.on_message(text) == ListenerControl::Detach {
                self.detach_listener(listener_id);
            }
        }
    }

    /// Close the connection. Idempotent and callable from any task.
    pub fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }

        self.close_tx.send_replace(true);

        // A sender holding the writer sees the close signal and drops it
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
        lock(&self.reader).take();

        tracing::debug!("Connection {} to {} closed", self.id, self.remote);

        let callback = lock(&self.on_disconnect).take();
        if let Some(callback) = callback {
            callback(self.id);
        }
    }

    /// Wait until the connection is closed
    pub async fn closed(&self) {
        let mut rx = self.close_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}
