//! Session server
//!
//! Listens for inbound session connections. The listening port is found by
//! sequential fallback from a well-known base port; the chosen port is
//! written back to the local peer's directory record so the presence layer
//! can advertise it.
//!
//! Every accepted socket is wrapped in a [`Connection`] and handed to an
//! [`IdentityResolver`] on its own task. Identified connections are attached
//! to the [`SessionRegistry`]; everything else is closed. The accept loop
//! never waits on a resolution.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;

use crate::config::{IdentityConfig, ServerConfig};
use crate::connection::Connection;
use crate::error::{Result, SessionError};
use crate::identity::IdentityResolver;
use crate::peer::{Directory, PeerCode};
use crate::session::SessionRegistry;

/// Pause after a failed accept before trying again
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Bind a listener on the first free port in `base..base + attempts`.
///
/// # Errors
///
/// Returns [`SessionError::PortsExhausted`] if no port in the range binds.
pub async fn bind_with_fallback(ip: IpAddr, base: u16, attempts: u16) -> Result<TcpListener> {
    for offset in 0..attempts {
        let Some(port) = base.checked_add(offset) else {
            break;
        };

        match TcpListener::bind(SocketAddr::new(ip, port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) => tracing::debug!("Session port {} unavailable: {}", port, e),
        }
    }

    Err(SessionError::PortsExhausted { base, attempts })
}

/// Inbound session listener
pub struct SessionServer {
    config: ServerConfig,
    identity: IdentityConfig,
    local_code: PeerCode,
    directory: Arc<dyn Directory>,
    registry: Arc<SessionRegistry>,
    identification_slots: Arc<Semaphore>,
    /// Bound port, 0 while not listening
    port: AtomicU16,
    running: AtomicBool,
    exhaustion_reported: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionServer {
    /// Create a stopped server
    pub fn new(
        config: ServerConfig,
        identity: IdentityConfig,
        local_code: PeerCode,
        directory: Arc<dyn Directory>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        let identification_slots = Arc::new(Semaphore::new(config.max_pending_identifications));
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config,
            identity,
            local_code,
            directory,
            registry,
            identification_slots,
            port: AtomicU16::new(0),
            running: AtomicBool::new(false),
            exhaustion_reported: AtomicBool::new(false),
            shutdown_tx,
            accept_task: Mutex::new(None),
        }
    }

    /// Bind and start accepting.
    ///
    /// Returns the bound port, which is also recorded as the local peer's
    /// session port.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::PortsExhausted`] when no port in the range is
    /// free. The local peer then accepts no sessions; the condition is logged
    /// as an error only the first time. Returns an invalid state error if the
    /// server is already running.
    pub async fn start(&self) -> Result<u16> {
        if self.running.load(Ordering::Acquire) {
            return Err(SessionError::invalid_state("session server already running"));
        }

        let listener = match bind_with_fallback(
            self.config.bind_ip,
            self.config.base_port,
            self.config.port_attempts,
        )
        .await
        {
            Ok(listener) => listener,
            Err(e) => {
                if !self.exhaustion_reported.swap(true, Ordering::AcqRel) {
                    tracing::error!("{}; private chat and file transfer are unavailable", e);
                } else {
                    tracing::debug!("{}", e);
                }
                return Err(e);
            }
        };

        let port = listener.local_addr()?.port();
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(SessionError::invalid_state("session server already running"));
        }
        self.port.store(port, Ordering::Release);
        self.directory.set_session_port(self.local_code, port);
        self.shutdown_tx.send_replace(false);

        let task = tokio::spawn(accept_loop(
            listener,
            self.shutdown_tx.subscribe(),
            AcceptContext {
                identity: self.identity.clone(),
                directory: Arc::clone(&self.directory),
                registry: Arc::clone(&self.registry),
                slots: Arc::clone(&self.identification_slots),
            },
        ));
        *self
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);

        tracing::info!("Session server listening on {}:{}", self.config.bind_ip, port);
        Ok(port)
    }

    /// Stop accepting and close the listening socket. Idempotent.
    ///
    /// Established sessions are not affected.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }

        self.shutdown_tx.send_replace(true);
        self.port.store(0, Ordering::Release);

        let task = self
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!("Accept loop ended abnormally: {}", e);
            }
        }

        tracing::info!("Session server stopped");
    }

    /// Bound port, if listening
    pub fn port(&self) -> Option<u16> {
        match self.port.load(Ordering::Acquire) {
            0 => None,
            port => Some(port),
        }
    }

    /// Whether the accept loop is running
    pub fn is_accepting(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

struct AcceptContext {
    identity: IdentityConfig,
    directory: Arc<dyn Directory>,
    registry: Arc<SessionRegistry>,
    slots: Arc<Semaphore>,
}

async fn accept_loop(listener: TcpListener, mut shutdown: watch::Receiver<bool>, ctx: AcceptContext) {
    loop {
        if *shutdown.borrow_and_update() {
            break;
        }

        tokio::select! {
            biased;

            _ = shutdown.changed() => {}
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let Ok(permit) = Arc::clone(&ctx.slots).try_acquire_owned() else {
                        tracing::warn!("Too many pending identifications, dropping connection from {}", addr);
                        continue;
                    };

                    let connection = match Connection::from_stream(stream) {
                        Ok(connection) => connection,
                        Err(e) => {
                            tracing::debug!("Dropping connection from {}: {}", addr, e);
                            continue;
                        }
                    };

                    let resolver = IdentityResolver::new(Arc::clone(&connection), &ctx.identity);
                    connection.start_receiving();

                    let directory = Arc::clone(&ctx.directory);
                    let registry = Arc::clone(&ctx.registry);
                    tokio::spawn(async move {
                        let _permit = permit;
                        if let Ok(peer) = resolver.resolve(directory.as_ref()).await {
                            registry.attach(connection, peer);
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            },
        }
    }

    tracing::debug!("Accept loop terminated");
}
