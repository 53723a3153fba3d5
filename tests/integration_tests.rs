//! Two-node integration tests over loopback TCP.
//!
//! Exercises identification, session aggregation, port fallback, the
//! unknown-sender buffer and the file transfer protocol end to end, with
//! presence traffic carried by the in-process bus.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lanchat_core::{
    Connection, EventSink, IncomingOffer, Peer, PresenceEvent, SessionError, Submission, Transfer,
    TransferKey, TransferListener, TransferState,
};
use lanchat_tests::fixtures::{ALICE, BOB, TwoNodeFixture, wait_until, within};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

const SETTLE: Duration = Duration::from_secs(3);

fn bob_session_addr(fixture: &TwoNodeFixture) -> SocketAddr {
    SocketAddr::new("127.0.0.1".parse().unwrap(), fixture.bob.session_port().unwrap())
}

/// Messages arriving on a node's sessions, as (nick, text)
fn session_inbox(node: &lanchat_core::ChatNode) -> mpsc::UnboundedReceiver<(String, String)> {
    let (tx, rx) = mpsc::unbounded_channel();
    node.set_session_listener(Arc::new(move |text: String, from: &Peer| {
        let _ = tx.send((from.nick.clone(), text));
    }));
    rx
}

/// Offers arriving at a node
fn offer_inbox(node: &lanchat_core::ChatNode) -> mpsc::UnboundedReceiver<IncomingOffer> {
    let (tx, rx) = mpsc::unbounded_channel();
    node.set_offer_listener(Arc::new(move |offer: &IncomingOffer| {
        let _ = tx.send(offer.clone());
    }));
    rx
}

struct ChannelSink(mpsc::UnboundedSender<(String, PresenceEvent)>);

impl EventSink for ChannelSink {
    fn deliver(&self, peer: &Peer, event: PresenceEvent) {
        let _ = self.0.send((peer.nick.clone(), event));
    }
}

fn write_file(dir: &Path, name: &str, len: usize) -> (std::path::PathBuf, Vec<u8>) {
    let data: Vec<u8> = (0..len).map(|i| (i.wrapping_mul(31) % 251) as u8).collect();
    let path = dir.join(name);
    std::fs::write(&path, &data).unwrap();
    (path, data)
}

// ============================================================================
// Private Sessions
// ============================================================================

#[tokio::test]
async fn test_private_message_between_nodes() {
    let fixture = TwoNodeFixture::started().await;
    let mut bob_inbox = session_inbox(&fixture.bob);
    let mut alice_inbox = session_inbox(&fixture.alice);

    fixture.alice.send_private(BOB, "hi bob").await.unwrap();

    let (nick, text) = within(bob_inbox.recv()).await.unwrap();
    assert_eq!(nick, "alice");
    assert_eq!(text, "hi bob");
    assert!(fixture.alice.sessions().has_session(BOB));
    assert!(fixture.bob.sessions().has_session(ALICE));
    assert!(fixture.bob_directory.peers().iter().any(|p| p.code == ALICE && p.tcp_enabled));

    // Bob answers over the session alice opened
    fixture.bob.send_private(ALICE, "hello alice").await.unwrap();
    let (nick, text) = within(alice_inbox.recv()).await.unwrap();
    assert_eq!(nick, "bob");
    assert_eq!(text, "hello alice");
    assert_eq!(fixture.bob.sessions().connection_count(ALICE), 1);

    fixture.cleanup().await;
}

#[tokio::test]
async fn test_messages_keep_order() {
    let fixture = TwoNodeFixture::started().await;
    let mut bob_inbox = session_inbox(&fixture.bob);

    for i in 0..50 {
        fixture.alice.send_private(BOB, &format!("line {i}")).await.unwrap();
    }
    for i in 0..50 {
        let (_, text) = within(bob_inbox.recv()).await.unwrap();
        assert_eq!(text, format!("line {i}"));
    }

    fixture.cleanup().await;
}

#[tokio::test]
async fn test_non_ascii_text_survives() {
    let fixture = TwoNodeFixture::started().await;
    let mut bob_inbox = session_inbox(&fixture.bob);

    let text = "naïve café \u{0} 😀";
    fixture.alice.send_private(BOB, text).await.unwrap();
    let (_, received) = within(bob_inbox.recv()).await.unwrap();
    assert_eq!(received, text);

    fixture.cleanup().await;
}

#[tokio::test]
async fn test_disconnect_marks_peer_tcp_disabled() {
    let fixture = TwoNodeFixture::started().await;
    let mut bob_inbox = session_inbox(&fixture.bob);

    fixture.alice.send_private(BOB, "ping").await.unwrap();
    within(bob_inbox.recv()).await.unwrap();

    assert_eq!(fixture.alice.disconnect_peer(BOB), 1);
    assert!(!fixture.alice.sessions().has_session(BOB));

    assert!(wait_until(SETTLE, || !fixture.bob.sessions().has_session(ALICE)).await);
    assert!(
        fixture
            .bob_directory
            .peers()
            .iter()
            .any(|p| p.code == ALICE && !p.tcp_enabled)
    );

    // A new message opens a fresh session
    fixture.alice.send_private(BOB, "again").await.unwrap();
    let (_, text) = within(bob_inbox.recv()).await.unwrap();
    assert_eq!(text, "again");

    fixture.cleanup().await;
}

#[tokio::test]
async fn test_send_to_unknown_peer_fails() {
    let fixture = TwoNodeFixture::started().await;

    let err = fixture.alice.send_private(4242, "anyone?").await.unwrap_err();
    assert!(matches!(err, SessionError::PeerNotFound(4242)));

    fixture.cleanup().await;
}

// ============================================================================
// Identification
// ============================================================================

#[tokio::test]
async fn test_spoofed_identity_is_rejected() {
    let fixture = TwoNodeFixture::started().await;
    // Known peer whose address is not the loopback the claim arrives from
    fixture
        .bob_directory
        .insert(Peer::new(33, "victim", "10.0.0.33".parse().unwrap(), 6789));

    let client = Connection::connect(bob_session_addr(&fixture), SETTLE).await.unwrap();
    client.start_receiving();
    assert!(client.send("33").await);

    within(client.closed()).await;
    assert!(!fixture.bob.sessions().has_session(33));
    assert!(!fixture.bob_directory.peers().iter().any(|p| p.code == 33 && p.tcp_enabled));

    fixture.cleanup().await;
}

#[tokio::test]
async fn test_unknown_and_malformed_claims_are_rejected() {
    let fixture = TwoNodeFixture::started().await;

    for claim in ["4242", "hello", ""] {
        let client = Connection::connect(bob_session_addr(&fixture), SETTLE).await.unwrap();
        client.start_receiving();
        assert!(client.send(claim).await);
        within(client.closed()).await;
    }
    assert_eq!(fixture.bob.sessions().session_count(), 0);

    fixture.cleanup().await;
}

#[tokio::test]
async fn test_silent_connection_times_out() {
    let fixture = TwoNodeFixture::started().await;

    let client = Connection::connect(bob_session_addr(&fixture), SETTLE).await.unwrap();
    client.start_receiving();

    // Identity wait is 10 ms x 100 in the fixture
    within(client.closed()).await;
    assert_eq!(fixture.bob.sessions().session_count(), 0);

    fixture.cleanup().await;
}

#[tokio::test]
async fn test_valid_claim_from_raw_connection() {
    let fixture = TwoNodeFixture::started().await;
    let mut bob_inbox = session_inbox(&fixture.bob);

    let client = Connection::connect(bob_session_addr(&fixture), SETTLE).await.unwrap();
    client.start_receiving();
    assert!(client.send(&ALICE.to_string()).await);
    assert!(client.send("sent right behind the claim").await);

    let (nick, text) = within(bob_inbox.recv()).await.unwrap();
    assert_eq!(nick, "alice");
    assert_eq!(text, "sent right behind the claim");

    client.disconnect();
    fixture.cleanup().await;
}

#[tokio::test]
async fn test_second_connection_joins_session() {
    let fixture = TwoNodeFixture::started().await;

    fixture.alice.send_private(BOB, "first").await.unwrap();
    let extra = Connection::connect(bob_session_addr(&fixture), SETTLE).await.unwrap();
    extra.start_receiving();
    assert!(extra.send(&ALICE.to_string()).await);

    assert!(wait_until(SETTLE, || fixture.bob.sessions().connection_count(ALICE) == 2).await);
    assert_eq!(fixture.bob.sessions().enforce_single_connection(ALICE), 1);
    assert_eq!(fixture.bob.sessions().connection_count(ALICE), 1);

    // The newest connection is the one kept
    assert!(within(async { fixture.bob.send_private(ALICE, "still here").await }).await.is_ok());
    let closed_first = wait_until(SETTLE, || fixture.alice.sessions().connection_count(BOB) == 0).await;
    assert!(closed_first);
    assert!(extra.is_connected());

    extra.disconnect();
    fixture.cleanup().await;
}

// ============================================================================
// Session Server
// ============================================================================

#[tokio::test]
async fn test_port_fallback() {
    let fixture = TwoNodeFixture::new();
    let base = fixture.alice.config().server.base_port;
    let _held = TcpListener::bind(("127.0.0.1", base)).await.unwrap();

    fixture.start().await;
    let port = fixture.alice.session_port().unwrap();
    assert!(port > base);
    assert!(fixture.alice.is_accepting());

    // Bob learns the fallback port and can reach alice on it
    let mut alice_inbox = session_inbox(&fixture.alice);
    fixture.bob.send_private(ALICE, "found you").await.unwrap();
    let (_, text) = within(alice_inbox.recv()).await.unwrap();
    assert_eq!(text, "found you");

    fixture.cleanup().await;
}

#[tokio::test]
async fn test_ports_exhausted_keeps_node_usable() {
    let fixture = TwoNodeFixture::new_with_config(|config| config.server.port_attempts = 1);
    let base = fixture.alice.config().server.base_port;
    let _held = TcpListener::bind(("127.0.0.1", base)).await.unwrap();

    let err = fixture.alice.start().await.unwrap_err();
    assert!(matches!(err, SessionError::PortsExhausted { attempts: 1, .. }));
    assert!(!fixture.alice.is_accepting());
    assert_eq!(fixture.alice.session_port(), None);

    fixture.bob.start().await.unwrap();
    fixture.introduce();

    // Outbound sessions still work
    let mut bob_inbox = session_inbox(&fixture.bob);
    fixture.alice.send_private(BOB, "no server, still talking").await.unwrap();
    let (_, text) = within(bob_inbox.recv()).await.unwrap();
    assert_eq!(text, "no server, still talking");

    // Bob cannot open a session towards alice
    let alice = fixture.bob_directory.peers().into_iter().find(|p| p.code == ALICE).unwrap();
    let err = fixture.bob.sessions().connect(&alice).await.unwrap_err();
    assert!(matches!(err, SessionError::NoSessionPort(ALICE)));

    fixture.cleanup().await;
}

// ============================================================================
// Unknown-Sender Resolution
// ============================================================================

#[tokio::test]
async fn test_event_from_unknown_sender_is_delivered_once_known() {
    let fixture = TwoNodeFixture::started().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    fixture.alice.set_event_sink(Arc::new(ChannelSink(tx)));
    let exposes = fixture.bus.expose_count();

    let event = PresenceEvent::Message {
        from: 77,
        text: "who am i".to_string(),
    };
    assert_eq!(fixture.alice.handle_presence_event(event.clone()), Submission::Deferred);
    assert!(fixture.alice.resolution().is_waiting(77));
    assert_eq!(fixture.bus.expose_count(), exposes + 1);
    assert!(fixture.bus.topic_count() >= 1);

    fixture
        .alice_directory
        .insert(Peer::new(77, "carol", "10.0.0.77".parse().unwrap(), 6789));
    fixture.alice.peer_known(77);

    let (nick, delivered) = within(rx.recv()).await.unwrap();
    assert_eq!(nick, "carol");
    assert_eq!(delivered, event);
    assert!(!fixture.alice.resolution().is_waiting(77));

    fixture.cleanup().await;
}

#[tokio::test]
async fn test_event_from_unknown_sender_is_dropped_after_deadline() {
    let fixture = TwoNodeFixture::started().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    fixture.alice.set_event_sink(Arc::new(ChannelSink(tx)));

    let event = PresenceEvent::Away { from: 77, away: true };
    assert_eq!(fixture.alice.handle_presence_event(event), Submission::Deferred);

    // Resolution wait is 10 ms x 50 in the fixture
    assert!(wait_until(SETTLE, || !fixture.alice.resolution().is_waiting(77)).await);
    assert!(wait_until(SETTLE, || fixture.alice.resolution().pending_events() == 0).await);
    assert!(rx.try_recv().is_err());

    fixture.cleanup().await;
}

#[tokio::test]
async fn test_event_from_known_sender_is_immediate() {
    let fixture = TwoNodeFixture::started().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    fixture.bob.set_event_sink(Arc::new(ChannelSink(tx)));

    let event = PresenceEvent::TopicChanged {
        from: ALICE,
        topic: "release day".to_string(),
    };
    assert_eq!(fixture.bob.handle_presence_event(event), Submission::Delivered);
    let (nick, _) = rx.try_recv().unwrap();
    assert_eq!(nick, "alice");

    fixture.cleanup().await;
}

// ============================================================================
// File Transfer
// ============================================================================

async fn wait_for_state(transfer: &lanchat_core::Transfer, state: TransferState) -> bool {
    wait_until(Duration::from_secs(10), || transfer.state() == state).await
}

#[tokio::test]
async fn test_file_transfer_completes() {
    let fixture = TwoNodeFixture::started().await;
    let mut offers = offer_inbox(&fixture.bob);
    let source = tempfile::tempdir().unwrap();
    let (path, data) = write_file(source.path(), "report.pdf", 300 * 1024 + 17);

    let sending = fixture.alice.offer_file(BOB, &path).await.unwrap();
    assert_eq!(sending.state(), TransferState::Waiting);
    assert_eq!(sending.key().peer, BOB);

    let offer = within(offers.recv()).await.unwrap();
    assert_eq!(offer.key.peer, ALICE);
    assert_eq!(offer.key.file_name, "report.pdf");
    assert_eq!(offer.size, data.len() as u64);
    assert_eq!(offer.from.nick, "alice");
    assert_eq!(fixture.bob.pending_offers().len(), 1);

    let receiving = fixture.bob.accept_offer(&offer.key).await.unwrap();
    assert!(fixture.bob.pending_offers().is_empty());

    assert!(wait_for_state(&receiving, TransferState::Completed).await);
    assert!(wait_for_state(&sending, TransferState::Completed).await);

    let stored = fixture.bob_downloads.path().join("report.pdf");
    assert_eq!(receiving.path(), stored.as_path());
    assert_eq!(std::fs::read(&stored).unwrap(), data);
    assert!(!fixture.bob_downloads.path().join("report.pdf.part").exists());

    assert_eq!(sending.bytes_transferred(), data.len() as u64);
    assert_eq!(receiving.progress().percent, 100);

    // Finished transfers leave the registry
    let transfers = fixture.alice.transfers().registry();
    assert!(wait_until(SETTLE, || !transfers.contains_outgoing(sending.key())).await);
    assert!(!fixture.bob.transfers().registry().contains_incoming(&offer.key));

    fixture.cleanup().await;
}

#[tokio::test]
async fn test_empty_file_transfer() {
    let fixture = TwoNodeFixture::started().await;
    let mut offers = offer_inbox(&fixture.bob);
    let source = tempfile::tempdir().unwrap();
    let (path, _) = write_file(source.path(), "empty.txt", 0);

    let sending = fixture.alice.offer_file(BOB, &path).await.unwrap();
    let offer = within(offers.recv()).await.unwrap();
    let receiving = fixture.bob.accept_offer(&offer.key).await.unwrap();

    assert!(wait_for_state(&receiving, TransferState::Completed).await);
    assert!(wait_for_state(&sending, TransferState::Completed).await);
    assert_eq!(std::fs::read(receiving.path()).unwrap().len(), 0);

    fixture.cleanup().await;
}

#[tokio::test]
async fn test_received_name_is_made_unique() {
    let fixture = TwoNodeFixture::started().await;
    let mut offers = offer_inbox(&fixture.bob);
    write_file(fixture.bob_downloads.path(), "report.pdf", 4);
    let source = tempfile::tempdir().unwrap();
    let (path, data) = write_file(source.path(), "report.pdf", 4096);

    fixture.alice.offer_file(BOB, &path).await.unwrap();
    let offer = within(offers.recv()).await.unwrap();
    let receiving = fixture.bob.accept_offer(&offer.key).await.unwrap();

    assert!(wait_for_state(&receiving, TransferState::Completed).await);
    let expected = fixture.bob_downloads.path().join("report (1).pdf");
    assert_eq!(receiving.path(), expected.as_path());
    assert_eq!(std::fs::read(expected).unwrap(), data);
    assert_eq!(std::fs::read(fixture.bob_downloads.path().join("report.pdf")).unwrap().len(), 4);

    fixture.cleanup().await;
}

#[tokio::test]
async fn test_duplicate_offer_is_refused() {
    let fixture = TwoNodeFixture::started().await;
    let source = tempfile::tempdir().unwrap();
    let (path, _) = write_file(source.path(), "notes.txt", 1024);

    let first = fixture.alice.offer_file(BOB, &path).await.unwrap();
    let err = fixture.alice.offer_file(BOB, &path).await.unwrap_err();
    assert!(matches!(err, SessionError::DuplicateTransfer(ref key) if key == first.key()));

    // Once the first is gone the file can be offered again
    fixture.alice.cancel_transfer(first.key()).unwrap();
    assert!(fixture.alice.offer_file(BOB, &path).await.is_ok());

    fixture.cleanup().await;
}

#[tokio::test]
async fn test_rejected_offer_fails_sender() {
    let fixture = TwoNodeFixture::started().await;
    let mut offers = offer_inbox(&fixture.bob);
    let source = tempfile::tempdir().unwrap();
    let (path, _) = write_file(source.path(), "unwanted.bin", 2048);

    let sending = fixture.alice.offer_file(BOB, &path).await.unwrap();
    let offer = within(offers.recv()).await.unwrap();
    fixture.bob.reject_offer(&offer.key).unwrap();

    assert!(wait_for_state(&sending, TransferState::Failed).await);
    let transfers = fixture.alice.transfers().registry();
    assert!(wait_until(SETTLE, || !transfers.contains_outgoing(sending.key())).await);
    assert!(fixture.bob.pending_offers().is_empty());
    assert!(std::fs::read_dir(fixture.bob_downloads.path()).unwrap().next().is_none());

    // Rejecting twice is an error
    assert!(matches!(
        fixture.bob.reject_offer(&offer.key),
        Err(SessionError::TransferNotFound(_))
    ));

    fixture.cleanup().await;
}

#[tokio::test]
async fn test_cancel_waiting_offer() {
    let fixture = TwoNodeFixture::started().await;
    let source = tempfile::tempdir().unwrap();
    let (path, _) = write_file(source.path(), "draft.txt", 100);

    let sending = fixture.alice.offer_file(BOB, &path).await.unwrap();
    fixture.alice.cancel_transfer(sending.key()).unwrap();

    assert_eq!(sending.state(), TransferState::Failed);
    assert!(sending.is_cancelled());
    assert!(fixture.alice.active_transfers().is_empty());

    // Accepting afterwards reaches no live transfer on alice's side
    let mut offers = offer_inbox(&fixture.bob);
    let offer = match fixture.bob.pending_offers().pop() {
        Some(offer) => offer,
        None => within(offers.recv()).await.unwrap(),
    };
    let receiving = fixture.bob.accept_offer(&offer.key).await.unwrap();
    fixture.bob.cancel_transfer(&offer.key).unwrap();
    assert!(wait_for_state(&receiving, TransferState::Failed).await);

    fixture.cleanup().await;
}

/// Percent values reported through `on_progress`
#[derive(Default)]
struct PercentLog(Mutex<Vec<u8>>);

impl TransferListener for PercentLog {
    fn on_progress(&self, _transfer: &Transfer, _bytes: u64, _speed: f64, percent: u8) {
        self.0.lock().unwrap().push(percent);
    }
}

#[tokio::test]
async fn test_cancel_mid_transfer_fails_both_sides() {
    // Small chunks keep a multi-megabyte file in flight long enough to cancel
    let fixture = TwoNodeFixture::new_with_config(|config| config.transfer.chunk_size = 512);
    fixture.start().await;
    let mut offers = offer_inbox(&fixture.bob);
    let source = tempfile::tempdir().unwrap();
    let (path, _) = write_file(source.path(), "archive.tar", 16 * 1024 * 1024);

    let sending = fixture.alice.offer_file(BOB, &path).await.unwrap();
    let offer = within(offers.recv()).await.unwrap();
    let receiving = fixture.bob.accept_offer(&offer.key).await.unwrap();

    assert!(wait_until(Duration::from_secs(10), || receiving.bytes_transferred() > 0).await);
    assert_eq!(receiving.state(), TransferState::Transferring);
    fixture.bob.cancel_transfer(&offer.key).unwrap();

    assert_eq!(receiving.state(), TransferState::Failed);
    assert!(receiving.is_cancelled());
    assert!(wait_for_state(&sending, TransferState::Failed).await);
    assert!(receiving.bytes_transferred() < receiving.size());

    let alice_transfers = fixture.alice.transfers().registry();
    assert!(wait_until(SETTLE, || alice_transfers.is_empty()).await);
    assert!(fixture.bob.transfers().registry().is_empty());

    // Neither the partial nor the final file is left behind
    let downloads = fixture.bob_downloads.path();
    assert!(wait_until(SETTLE, || std::fs::read_dir(downloads).unwrap().next().is_none()).await);

    fixture.cleanup().await;
}

#[tokio::test]
async fn test_progress_reports_rising_percent() {
    let fixture = TwoNodeFixture::new_with_config(|config| config.transfer.chunk_size = 256);
    fixture.start().await;
    let percents = Arc::new(PercentLog::default());
    fixture.alice.set_transfer_listener(percents.clone());
    let mut offers = offer_inbox(&fixture.bob);
    let source = tempfile::tempdir().unwrap();
    let (path, _) = write_file(source.path(), "video.mp4", 8 * 1024 * 1024);

    let sending = fixture.alice.offer_file(BOB, &path).await.unwrap();
    let offer = within(offers.recv()).await.unwrap();
    fixture.bob.accept_offer(&offer.key).await.unwrap();
    assert!(wait_until(Duration::from_secs(30), || sending.state() == TransferState::Completed).await);

    let reported = percents.0.lock().unwrap().clone();
    assert!(reported.len() >= 2, "progress reported {} times", reported.len());
    assert!(reported.windows(2).all(|pair| pair[0] <= pair[1]));
    assert!(reported[0] < 100);
    assert_eq!(reported.last(), Some(&100));

    fixture.cleanup().await;
}

#[tokio::test]
async fn test_cancel_unknown_transfer() {
    let fixture = TwoNodeFixture::started().await;
    let key = TransferKey::new(BOB, "ghost.txt", 1);

    assert!(matches!(
        fixture.alice.cancel_transfer(&key),
        Err(SessionError::TransferNotFound(_))
    ));
    assert!(fixture.alice.transfer_progress(&key).is_none());

    fixture.cleanup().await;
}

#[tokio::test]
async fn test_offer_to_unknown_peer_fails() {
    let fixture = TwoNodeFixture::started().await;
    let source = tempfile::tempdir().unwrap();
    let (path, _) = write_file(source.path(), "a.txt", 10);

    let err = fixture.alice.offer_file(4242, &path).await.unwrap_err();
    assert!(matches!(err, SessionError::PeerNotFound(4242)));
    assert!(fixture.bus.announcements().is_empty());

    fixture.cleanup().await;
}
