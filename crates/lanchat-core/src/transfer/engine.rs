//! Transfer engine
//!
//! Drives both sides of the protocol: offers and their answers travel as
//! presence announcements, file bytes travel over a per-transfer TCP
//! connection. Each transfer runs on its own task and always ends in
//! `Completed` or `Failed` with a listener callback.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use dashmap::{DashMap, DashSet};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use super::progress::{ProgressMeter, TransferProgress};
use super::registry::TransferRegistry;
use super::state::{NoopTransferListener, Transfer, TransferDirection, TransferListener, TransferState};
use super::wire::{DONE, READY, TransferHeader, expect_frame};
use super::{FileHash, TransferKey, hash_file, sanitize_file_name, transfer_error};
use crate::config::TransferConfig;
use crate::error::{Result, SessionError};
use crate::frame::{FrameReader, write_frame};
use crate::peer::{Directory, Peer, PeerCode};
use crate::presence::{Announcement, Presence};

/// An offer received from a peer and not yet answered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingOffer {
    /// Key of the transfer; `peer` is the sender
    pub key: TransferKey,
    /// Sender's directory record at offer time
    pub from: Peer,
    /// Announced size in bytes
    pub size: u64,
    /// Name the file will be stored under
    pub local_name: String,
}

/// Notified of incoming offers so the application can accept or reject
pub trait OfferListener: Send + Sync {
    /// A peer offered a file
    fn on_offer(&self, offer: &IncomingOffer);
}

impl<F> OfferListener for F
where
    F: Fn(&IncomingOffer) + Send + Sync,
{
    fn on_offer(&self, offer: &IncomingOffer) {
        self(offer)
    }
}

/// File transfer engine
pub struct TransferEngine {
    config: TransferConfig,
    local_code: PeerCode,
    bind_ip: IpAddr,
    presence: Arc<dyn Presence>,
    directory: Arc<dyn Directory>,
    registry: TransferRegistry,
    offers: DashMap<TransferKey, IncomingOffer>,
    /// Destinations claimed by live receives
    reserved: DashSet<PathBuf>,
    listener: RwLock<Arc<dyn TransferListener>>,
    offer_listener: RwLock<Option<Arc<dyn OfferListener>>>,
}

impl TransferEngine {
    /// Create an engine.
    ///
    /// `bind_ip` is the address per-transfer listeners bind on.
    pub fn new(
        config: TransferConfig,
        local_code: PeerCode,
        bind_ip: IpAddr,
        presence: Arc<dyn Presence>,
        directory: Arc<dyn Directory>,
    ) -> Self {
        Self {
            config,
            local_code,
            bind_ip,
            presence,
            directory,
            registry: TransferRegistry::new(),
            offers: DashMap::new(),
            reserved: DashSet::new(),
            listener: RwLock::new(Arc::new(NoopTransferListener)),
            offer_listener: RwLock::new(None),
        }
    }

    /// Listener attached to transfers created from now on
    pub fn set_listener(&self, listener: Arc<dyn TransferListener>) {
        *self.listener.write().unwrap_or_else(PoisonError::into_inner) = listener;
    }

    /// Listener told about incoming offers
    pub fn set_offer_listener(&self, listener: Arc<dyn OfferListener>) {
        *self
            .offer_listener
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(listener);
    }

    fn listener(&self) -> Arc<dyn TransferListener> {
        Arc::clone(&self.listener.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Live transfers
    pub fn registry(&self) -> &TransferRegistry {
        &self.registry
    }

    // ============ Sender Side ============

    /// Offer a local file to a peer.
    ///
    /// The transfer waits in `Waiting` until the peer accepts or rejects.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::PeerNotFound`] for an unknown recipient,
    /// [`SessionError::DuplicateTransfer`] if the same file is already being
    /// offered to the peer, an I/O error if the file cannot be read, or the
    /// presence layer's error if the offer cannot be announced.
    pub async fn offer(&self, to: PeerCode, path: &Path) -> Result<Arc<Transfer>> {
        if self.directory.lookup(to).is_none() {
            return Err(SessionError::PeerNotFound(to));
        }

        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(transfer_error(format!("{} is not a file", path.display())));
        }
        let file_name = path
            .file_name()
            .and_then(|name| sanitize_file_name(&name.to_string_lossy()))
            .ok_or(SessionError::transfer("path has no file name"))?;

        let hash = hash_file(path).await?;
        let key = TransferKey::new(to, file_name, hash);
        let transfer = Transfer::new(
            key.clone(),
            TransferDirection::Send,
            metadata.len(),
            path.to_path_buf(),
            self.listener(),
        );

        self.registry.register(&transfer)?;
        transfer.announce_waiting();

        let announcement = Announcement::FileOffer {
            to,
            file_name: key.file_name.clone(),
            size: transfer.size(),
            hash,
        };
        if let Err(e) = self.presence.announce(announcement) {
            transfer.fail(&e.to_string());
            self.registry.remove(&transfer);
            return Err(e);
        }

        tracing::info!("Offered {} ({} bytes) to peer {}", key.file_name, transfer.size(), to);
        Ok(transfer)
    }

    /// The receiver accepted: connect to its port and stream the file
    pub fn handle_accept(
        self: &Arc<Self>,
        from: &Peer,
        file_name: &str,
        size: u64,
        hash: FileHash,
        port: u16,
    ) {
        let key = TransferKey::new(from.code, file_name, hash);
        let Some(transfer) = self.registry.outgoing(&key) else {
            tracing::debug!("Accept for unknown transfer {}, ignoring", key);
            return;
        };

        if size != transfer.size() {
            transfer.fail("accepted size does not match offer");
            self.registry.remove(&transfer);
            return;
        }

        if !transfer.advance(TransferState::Connecting) {
            tracing::debug!("Duplicate accept for {} in state {}", key, transfer.state());
            return;
        }

        let addr = SocketAddr::new(from.ip, port);
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.run_send(transfer, addr).await });
    }

    /// The receiver rejected: drop the pending transfer
    pub fn handle_reject(&self, from: &Peer, file_name: &str, hash: FileHash) {
        let key = TransferKey::new(from.code, file_name, hash);
        match self.registry.outgoing(&key) {
            Some(transfer) => {
                transfer.fail("rejected by peer");
                self.registry.remove(&transfer);
                tracing::info!("Peer {} rejected {}", from.code, file_name);
            }
            None => tracing::debug!("Reject for unknown transfer {}, ignoring", key),
        }
    }

    async fn run_send(self: Arc<Self>, transfer: Arc<Transfer>, addr: SocketAddr) {
        let result = tokio::select! {
            biased;

            () = transfer.cancelled() => Err(SessionError::transfer("cancelled")),
            result = self.stream_to(&transfer, addr) => result,
        };

        self.finish(&transfer, result);
    }

    async fn stream_to(&self, transfer: &Transfer, addr: SocketAddr) -> Result<()> {
        let mut stream = self.connect_with_retry(addr).await?;
        let (read_half, mut write_half) = stream.split();
        let mut reader = FrameReader::new(read_half);

        let header = TransferHeader {
            from: self.local_code,
            hash: transfer.key().hash,
            size: transfer.size(),
            file_name: transfer.key().file_name.clone(),
        };
        write_frame(&mut write_half, &header.to_line()).await?;
        expect_frame(&mut reader, READY, self.config.handshake_timeout).await?;

        if !transfer.advance(TransferState::Transferring) {
            return Err(SessionError::transfer("transfer no longer active"));
        }

        let mut file = tokio::fs::File::open(transfer.path()).await?;
        let mut buf = vec![0u8; self.config.chunk_size];
        let mut meter = ProgressMeter::new(self.config.speed_window, self.config.progress_interval);
        let mut sent = 0u64;
        meter.record(Instant::now(), 0);

        while sent < transfer.size() {
            let want = buf.len().min((transfer.size() - sent) as usize);
            let n = file.read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(SessionError::transfer("file shrank while sending"));
            }
            write_half.write_all(&buf[..n]).await?;

            sent += n as u64;
            transfer.set_bytes(sent);
            if let Some(speed) = meter.record(Instant::now(), sent) {
                transfer.report_progress(speed);
            }
        }
        write_half.flush().await?;
        transfer.report_progress(meter.speed());

        expect_frame(&mut reader, DONE, self.config.handshake_timeout).await
    }

    async fn connect_with_retry(&self, addr: SocketAddr) -> Result<TcpStream> {
        let mut delay = self.config.connect_backoff;
        let mut last_error = SessionError::transport("no connect attempt made");

        for attempt in 1..=self.config.connect_attempts {
            match tokio::time::timeout(self.config.handshake_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                    }
                    return Ok(stream);
                }
                Ok(Err(e)) => last_error = e.into(),
                Err(_) => last_error = SessionError::timeout("transfer connect"),
            }

            tracing::debug!(
                "Transfer connect to {} failed (attempt {}/{}): {}",
                addr,
                attempt,
                self.config.connect_attempts,
                last_error
            );
            if attempt < self.config.connect_attempts {
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
        }

        Err(last_error)
    }

    // ============ Receiver Side ============

    /// Record an incoming offer and tell the offer listener.
    ///
    /// Offers whose name cannot be stored safely are rejected at once.
    pub fn handle_offer(&self, from: &Peer, file_name: &str, size: u64, hash: FileHash) {
        let key = TransferKey::new(from.code, file_name, hash);

        let Some(local_name) = sanitize_file_name(file_name) else {
            tracing::warn!("Rejecting offer {} with unusable file name", key);
            let reject = Announcement::FileReject {
                to: from.code,
                file_name: file_name.to_string(),
                hash,
            };
            if let Err(e) = self.presence.announce(reject) {
                tracing::warn!("Failed to reject offer {}: {}", key, e);
            }
            return;
        };

        let offer = IncomingOffer {
            key: key.clone(),
            from: from.clone(),
            size,
            local_name,
        };
        self.offers.insert(key, offer.clone());
        tracing::info!("Peer {} offers {} ({} bytes)", from.code, file_name, size);

        let listener = self
            .offer_listener
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(listener) = listener {
            listener.on_offer(&offer);
        }
    }

    /// Offers not yet accepted or rejected
    pub fn pending_offers(&self) -> Vec<IncomingOffer> {
        self.offers.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Accept an offer: bind a listener, announce its port, and receive.
    ///
    /// The listener is bound before the accept is announced, so the sender
    /// can connect as soon as it hears about it.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::TransferNotFound`] if there is no such offer,
    /// [`SessionError::DuplicateTransfer`] if the same file is already being
    /// received from the peer (the offer is then rejected), or the bind /
    /// announce failure (the transfer is then `Failed`).
    pub async fn accept(self: &Arc<Self>, key: &TransferKey) -> Result<Arc<Transfer>> {
        let (_, offer) = self
            .offers
            .remove(key)
            .ok_or_else(|| SessionError::TransferNotFound(key.clone()))?;

        let destination = self.reserve_destination(&offer.local_name).await;
        let transfer = Transfer::new(
            key.clone(),
            TransferDirection::Receive,
            offer.size,
            destination,
            self.listener(),
        );
        if let Err(e) = self.registry.register(&transfer) {
            self.release_destination(&transfer);
            self.announce_reject(key);
            return Err(e);
        }
        transfer.announce_waiting();

        let bound = self.bind_transfer_listener(key).await.and_then(|listener| {
            let port = listener.local_addr()?.port();
            Ok((listener, port))
        });
        let (listener, port) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                self.abandon(&transfer, &e);
                return Err(e);
            }
        };

        let announcement = Announcement::FileAccept {
            to: key.peer,
            file_name: key.file_name.clone(),
            size: offer.size,
            hash: key.hash,
            port,
        };
        if let Err(e) = self.presence.announce(announcement) {
            self.abandon(&transfer, &e);
            return Err(e);
        }

        tracing::info!("Accepted {} from peer {}, listening on port {}", key.file_name, key.peer, port);

        let engine = Arc::clone(self);
        let receiving = Arc::clone(&transfer);
        let sender_ip = offer.from.ip;
        tokio::spawn(async move { engine.run_receive(receiving, listener, sender_ip).await });

        Ok(transfer)
    }

    /// Tear down a receive that never got as far as its task
    fn abandon(&self, transfer: &Arc<Transfer>, error: &SessionError) {
        transfer.fail(&error.to_string());
        self.registry.remove(transfer);
        self.release_destination(transfer);
    }

    fn announce_reject(&self, key: &TransferKey) {
        let reject = Announcement::FileReject {
            to: key.peer,
            file_name: key.file_name.clone(),
            hash: key.hash,
        };
        if let Err(e) = self.presence.announce(reject) {
            tracing::warn!("Failed to reject offer {}: {}", key, e);
        }
    }

    /// Claim the first free path for `name` in the download directory:
    /// `name`, then `name (1)`, `name (2)`...
    ///
    /// Paths claimed by other live receives count as taken even though
    /// nothing exists on disk for them yet.
    async fn reserve_destination(&self, name: &str) -> PathBuf {
        let dir = &self.config.download_dir;
        let (stem, extension) = match name.rsplit_once('.') {
            Some((stem, extension)) if !stem.is_empty() => (stem, Some(extension)),
            _ => (name, None),
        };

        for n in 0u32.. {
            let candidate = match (n, extension) {
                (0, _) => dir.join(name),
                (n, Some(extension)) => dir.join(format!("{stem} ({n}).{extension}")),
                (n, None) => dir.join(format!("{stem} ({n})")),
            };
            if tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
                continue;
            }
            if self.reserved.insert(candidate.clone()) {
                return candidate;
            }
        }

        dir.join(name)
    }

    fn release_destination(&self, transfer: &Transfer) {
        self.reserved.remove(transfer.path());
    }

    async fn bind_transfer_listener(&self, key: &TransferKey) -> Result<TcpListener> {
        let listener = TcpListener::bind(SocketAddr::new(self.bind_ip, 0)).await?;
        tracing::debug!("Transfer {} bound {}", key, listener.local_addr()?);
        Ok(listener)
    }

    /// Decline an offer.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::TransferNotFound`] if there is no such offer,
    /// or the presence layer's error.
    pub fn reject(&self, key: &TransferKey) -> Result<()> {
        if self.offers.remove(key).is_none() {
            return Err(SessionError::TransferNotFound(key.clone()));
        }

        self.presence.announce(Announcement::FileReject {
            to: key.peer,
            file_name: key.file_name.clone(),
            hash: key.hash,
        })?;
        tracing::info!("Rejected {} from peer {}", key.file_name, key.peer);
        Ok(())
    }

    async fn run_receive(self: Arc<Self>, transfer: Arc<Transfer>, listener: TcpListener, sender_ip: IpAddr) {
        let result = tokio::select! {
            biased;

            () = transfer.cancelled() => Err(SessionError::transfer("cancelled")),
            result = self.receive_into(&transfer, listener, sender_ip) => result,
        };

        if result.is_err() {
            let partial = partial_path(transfer.path());
            if let Err(e) = tokio::fs::remove_file(&partial).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("Failed to remove partial file {}: {}", partial.display(), e);
                }
            }
        }

        self.release_destination(&transfer);
        self.finish(&transfer, result);
    }

    async fn receive_into(&self, transfer: &Transfer, listener: TcpListener, sender_ip: IpAddr) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.config.accept_timeout;

        // Only the offering peer's address may deliver the file
        let mut stream = loop {
            let (stream, remote) = tokio::time::timeout_at(deadline, listener.accept())
                .await
                .map_err(|_| SessionError::timeout("sender did not connect"))??;

            if remote.ip().to_canonical() == sender_ip.to_canonical() {
                break stream;
            }
            tracing::warn!("Ignoring data connection from {} for {}", remote, transfer.key());
        };
        drop(listener);

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY: {}", e);
        }
        if !transfer.advance(TransferState::Connecting) {
            return Err(SessionError::transfer("transfer no longer active"));
        }

        let (read_half, mut write_half) = stream.split();
        let mut reader = FrameReader::new(read_half);

        let line = tokio::time::timeout(self.config.handshake_timeout, reader.next_frame())
            .await
            .map_err(|_| SessionError::timeout("waiting for transfer header"))??
            .ok_or(SessionError::transfer("sender closed before header"))?;
        TransferHeader::parse(&line)?.validate(transfer.key(), transfer.size())?;

        let partial = partial_path(transfer.path());
        let mut file = tokio::fs::File::create(&partial).await?;

        write_frame(&mut write_half, READY).await?;
        if !transfer.advance(TransferState::Transferring) {
            return Err(SessionError::transfer("transfer no longer active"));
        }

        let (mut read_half, leftover) = reader.into_parts();
        let mut meter = ProgressMeter::new(self.config.speed_window, self.config.progress_interval);
        meter.record(Instant::now(), 0);

        let mut received = leftover.len() as u64;
        if received > transfer.size() {
            return Err(SessionError::transfer("sender sent more than announced"));
        }
        file.write_all(&leftover).await?;

        let mut buf = vec![0u8; self.config.chunk_size];
        while received < transfer.size() {
            let want = buf.len().min((transfer.size() - received) as usize);
            let n = read_half.read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(SessionError::transfer("sender closed mid-transfer"));
            }
            file.write_all(&buf[..n]).await?;

            received += n as u64;
            transfer.set_bytes(received);
            if let Some(speed) = meter.record(Instant::now(), received) {
                transfer.report_progress(speed);
            }
        }
        transfer.set_bytes(received);

        file.flush().await?;
        drop(file);
        tokio::fs::rename(&partial, transfer.path()).await?;
        transfer.report_progress(meter.speed());

        write_frame(&mut write_half, DONE).await
    }

    fn finish(&self, transfer: &Arc<Transfer>, result: Result<()>) {
        match result {
            Ok(()) => {
                transfer.complete();
                tracing::info!(
                    "Transfer {} completed ({} bytes in {:.1}s)",
                    transfer.key(),
                    transfer.bytes_transferred(),
                    transfer.elapsed().as_secs_f64()
                );
            }
            Err(e) => {
                if transfer.fail(&e.to_string()) {
                    tracing::warn!("Transfer {} failed: {}", transfer.key(), e);
                }
            }
        }
        self.registry.remove(transfer);
    }

    // ============ Both Sides ============

    /// Cancel a transfer in either direction, or withdraw from an offer.
    ///
    /// Cancelling a completed transfer does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::TransferNotFound`] if nothing matches the key.
    pub fn cancel(&self, key: &TransferKey) -> Result<()> {
        let transfer = self
            .registry
            .outgoing(key)
            .or_else(|| self.registry.incoming(key));

        match transfer {
            Some(transfer) => {
                if transfer.cancel() {
                    tracing::info!("Cancelled transfer {}", key);
                }
                self.registry.remove(&transfer);
                Ok(())
            }
            None if self.offers.contains_key(key) => self.reject(key),
            None => Err(SessionError::TransferNotFound(key.clone())),
        }
    }

    /// Progress snapshot of a live transfer
    pub fn progress(&self, key: &TransferKey) -> Option<TransferProgress> {
        self.registry
            .outgoing(key)
            .or_else(|| self.registry.incoming(key))
            .map(|transfer| transfer.progress())
    }

    /// Progress snapshots of every live transfer
    pub fn transfers(&self) -> Vec<TransferProgress> {
        self.registry
            .all()
            .iter()
            .map(|transfer| transfer.progress())
            .collect()
    }

    /// Cancel every live transfer
    pub fn cancel_all(&self) {
        for transfer in self.registry.all() {
            transfer.cancel();
            self.registry.remove(&transfer);
        }
    }
}

/// Where bytes are written until the transfer completes
fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    destination.with_file_name(name)
}
