//! Two sessions negotiating through in-process relays and loopback hosts

use async_trait::async_trait;
use parking_lot::Mutex;
use signal_store::{NewSignal, SignalStore};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use super::*;
use crate::session::{Session, SessionField, SessionOptions, SessionSnapshot, SessionEvent};
use crate::signal::{
    BroadcastHub, Incoming, Route, SignalKind, SignalTransport, StoreSignaling, TransportError,
    TransportFactory,
};

const WAIT: Duration = Duration::from_secs(5);
const POLL: Duration = Duration::from_millis(300);

type SentLog = Arc<Mutex<Vec<(String, SignalKind)>>>;

/// Records every signal sent through the wrapped factory's transports.
struct Counting<F> {
    inner: F,
    sent: SentLog,
}

impl<F> Counting<F> {
    fn new(inner: F) -> Self {
        Self {
            inner,
            sent: Arc::default(),
        }
    }

    fn count(&self, from: &str, kind: SignalKind) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|(f, k)| f == from && *k == kind)
            .count()
    }
}

struct CountingTransport {
    inner: Arc<dyn SignalTransport>,
    sent: SentLog,
}

#[async_trait]
impl SignalTransport for CountingTransport {
    fn route(&self) -> &Route {
        self.inner.route()
    }

    async fn send(&self, kind: SignalKind, data: &str) -> Result<(), TransportError> {
        self.sent.lock().push((self.inner.route().from.clone(), kind));
        self.inner.send(kind, data).await
    }

    async fn poll(&self) -> Result<Option<Incoming>, TransportError> {
        self.inner.poll().await
    }
}

impl<F: TransportFactory> TransportFactory for Counting<F> {
    fn connect(&self, route: Route) -> Arc<dyn SignalTransport> {
        Arc::new(CountingTransport {
            inner: self.inner.connect(route),
            sent: self.sent.clone(),
        })
    }
}

/// Fails the first offer sent through any of its transports.
struct DropFirstOffer<F> {
    inner: F,
    dropped: Arc<Mutex<bool>>,
}

struct DropFirstOfferTransport {
    inner: Arc<dyn SignalTransport>,
    dropped: Arc<Mutex<bool>>,
}

#[async_trait]
impl SignalTransport for DropFirstOfferTransport {
    fn route(&self) -> &Route {
        self.inner.route()
    }

    async fn send(&self, kind: SignalKind, data: &str) -> Result<(), TransportError> {
        if kind == SignalKind::Offer && !std::mem::replace(&mut *self.dropped.lock(), true) {
            return Err(TransportError::Status(503));
        }
        self.inner.send(kind, data).await
    }

    async fn poll(&self) -> Result<Option<Incoming>, TransportError> {
        self.inner.poll().await
    }
}

impl<F: TransportFactory> TransportFactory for DropFirstOffer<F> {
    fn connect(&self, route: Route) -> Arc<dyn SignalTransport> {
        Arc::new(DropFirstOfferTransport {
            inner: self.inner.connect(route),
            dropped: self.dropped.clone(),
        })
    }
}

fn options() -> SessionOptions {
    SessionOptions {
        ready_retry: Duration::from_secs(4),
        retry_delay: Duration::from_millis(20),
    }
}

fn store_relay() -> (TempDir, Arc<SignalStore>, StoreSignaling) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SignalStore::open(dir.path()).unwrap());
    let signaling = StoreSignaling::new(store.clone(), POLL);
    (dir, store, signaling)
}

/// Every call status the session moved through, in order.
fn record_statuses(session: &Session) -> (Arc<Mutex<Vec<CallStatus>>>, crate::session::Subscription) {
    let history = Arc::new(Mutex::new(Vec::new()));
    let sink = history.clone();
    let subscription = session.subscribe(SessionField::CallStatus, move |event| {
        if let SessionEvent::CallStatus(status) = event {
            sink.lock().push(*status);
        }
    });
    (history, subscription)
}

async fn wait_until(
    session: &Session,
    what: &str,
    predicate: impl Fn(&SessionSnapshot) -> bool,
) -> SessionSnapshot {
    let mut changes = session.changes();
    let result = tokio::time::timeout(WAIT, changes.wait_for(|s| predicate(s))).await;
    match result {
        Ok(Ok(snapshot)) => snapshot.clone(),
        _ => panic!("timed out waiting for {}: {:?}", what, session.snapshot()),
    }
}

async fn connected_pair<F: TransportFactory>(signaling: &F, network: &LoopbackNetwork) -> (Session, Session) {
    let bob = Session::join("bob", "room-1", signaling, network, options()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let alice = Session::join("alice", "room-1", signaling, network, options()).await.unwrap();

    wait_until(&bob, "bob connected", |s| s.status == CallStatus::Connected).await;
    wait_until(&alice, "alice connected", |s| s.status == CallStatus::Connected).await;
    (bob, alice)
}

/// `first` joins, `second` joins 100 ms later. Whatever the names, the
/// second joiner heard a ready and offers while the first answers.
async fn assert_second_joiner_offers(first: &str, second: &str) {
    let (_dir, _store, signaling) = store_relay();
    let network = LoopbackNetwork::new();

    let p1 = Session::join(first, "room-1", &signaling, &network, options()).await.unwrap();
    let (p1_history, _p1_sub) = record_statuses(&p1);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let p2 = Session::join(second, "room-1", &signaling, &network, options()).await.unwrap();
    let (p2_history, _p2_sub) = record_statuses(&p2);

    let p1_view = wait_until(&p1, "first joiner connected", |s| s.status == CallStatus::Connected).await;
    let p2_view = wait_until(&p2, "second joiner connected", |s| s.status == CallStatus::Connected).await;

    let p2_history = p2_history.lock().clone();
    for status in [CallStatus::GotReady, CallStatus::SentOffer, CallStatus::GotAnswer] {
        assert!(p2_history.contains(&status), "{}: {:?}", second, p2_history);
    }
    assert!(!p2_history.contains(&CallStatus::SentAnswer), "{}: {:?}", second, p2_history);

    let p1_history = p1_history.lock().clone();
    let got_offer = p1_history.iter().position(|s| *s == CallStatus::GotOffer);
    let sent_answer = p1_history.iter().position(|s| *s == CallStatus::SentAnswer);
    assert!(got_offer.is_some() && got_offer < sent_answer, "{}: {:?}", first, p1_history);
    assert!(!p1_history.contains(&CallStatus::GotAnswer), "{}: {:?}", first, p1_history);
    assert_eq!(p1_history.last(), Some(&CallStatus::Connected));

    assert_eq!(p1_view.remote_identity, second);
    assert_eq!(p2_view.remote_identity, first);
    assert!(p1_view.errors.is_empty(), "{:?}", p1_view.errors);
    assert!(p2_view.errors.is_empty(), "{:?}", p2_view.errors);

    // Both ends exchanged their gathered candidate
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(network.candidates_applied(0), 1);
    assert_eq!(network.candidates_applied(1), 1);
}

#[tokio::test]
async fn test_role_resolution_through_store() {
    assert_second_joiner_offers("bob", "alice").await;
}

#[tokio::test]
async fn test_role_resolution_when_first_joiner_sorts_lower() {
    assert_second_joiner_offers("alice", "bob").await;
}

#[tokio::test]
async fn test_role_resolution_with_suffixed_names() {
    assert_second_joiner_offers("guest", "guest-2").await;
    assert_second_joiner_offers("guest-2", "guest").await;
}

#[tokio::test]
async fn test_ready_while_connected_is_ignored() {
    let (_dir, store, signaling) = store_relay();
    let signaling = Counting::new(signaling);
    let network = LoopbackNetwork::new();

    let (bob, alice) = connected_pair(&signaling, &network).await;
    let bob_offers = signaling.count("bob", SignalKind::Offer);
    let alice_offers = signaling.count("alice", SignalKind::Offer);

    store.post(NewSignal::new("alice", "room-1", "ready", "alice")).unwrap();
    store.post(NewSignal::new("bob", "room-1", "ready", "bob")).unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(bob.snapshot().status, CallStatus::Connected);
    assert_eq!(alice.snapshot().status, CallStatus::Connected);
    assert_eq!(signaling.count("bob", SignalKind::Offer), bob_offers);
    assert_eq!(signaling.count("alice", SignalKind::Offer), alice_offers);
    assert_eq!(bob.snapshot().remote_identity, "alice");
}

#[tokio::test]
async fn test_ready_reannounced_until_peer_appears() {
    let (_dir, _store, signaling) = store_relay();
    let signaling = Counting::new(signaling);
    let network = LoopbackNetwork::new();
    let fast = SessionOptions {
        ready_retry: Duration::from_millis(100),
        ..options()
    };

    let bob = Session::join("bob", "room-1", &signaling, &network, fast).await.unwrap();
    tokio::time::sleep(Duration::from_millis(450)).await;
    assert!(signaling.count("bob", SignalKind::Ready) >= 3);
    assert_eq!(bob.snapshot().status, CallStatus::SentReady);

    let alice = Session::join("alice", "room-1", &signaling, &network, fast).await.unwrap();
    wait_until(&bob, "bob connected", |s| s.status == CallStatus::Connected).await;
    wait_until(&alice, "alice connected", |s| s.status == CallStatus::Connected).await;

    let bob_readies = signaling.count("bob", SignalKind::Ready);
    let alice_readies = signaling.count("alice", SignalKind::Ready);
    tokio::time::sleep(Duration::from_millis(350)).await;
    assert_eq!(signaling.count("bob", SignalKind::Ready), bob_readies);
    assert_eq!(signaling.count("alice", SignalKind::Ready), alice_readies);
}

#[tokio::test]
async fn test_track_change_sends_one_offer() {
    let signaling = Counting::new(BroadcastHub::new(POLL));
    let network = LoopbackNetwork::new();
    let (bob, alice) = connected_pair(&signaling, &network).await;

    let senders = Arc::new(Mutex::new(Vec::new()));
    let _senders_sub = {
        let senders = senders.clone();
        alice.subscribe(SessionField::Senders, move |event| {
            if let SessionEvent::Senders(ids) = event {
                senders.lock().push(ids.clone());
            }
        })
    };

    let offers = signaling.count("alice", SignalKind::Offer);
    let camera = MediaStream::new("cam")
        .with_track(TrackKind::Audio, "mic-1")
        .with_track(TrackKind::Video, "cam-1");
    assert!(alice.add_track(camera));

    let view = wait_until(&bob, "two remote tracks", |s| s.remote_tracks.len() == 2).await;
    assert!(view.remote_tracks.iter().all(|t| t.stream_id == "cam"));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(signaling.count("alice", SignalKind::Offer), offers + 1);
    assert_eq!(alice.snapshot().local_tracks.len(), 2);

    assert!(alice.close_track("cam-1"));
    let view = wait_until(&bob, "one remote track", |s| s.remote_tracks.len() == 1).await;
    assert_eq!(view.remote_tracks[0].id, "mic-1");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(signaling.count("alice", SignalKind::Offer), offers + 2);

    assert_eq!(alice.snapshot().status, CallStatus::Connected);
    assert_eq!(bob.snapshot().status, CallStatus::Connected);
    let last = senders.lock().last().cloned();
    assert_eq!(last, Some(vec!["mic-1".to_string()]));
}

#[tokio::test]
async fn test_tracks_added_before_connecting_are_sent() {
    let signaling = BroadcastHub::new(POLL);
    let network = LoopbackNetwork::new();

    let bob = Session::join("bob", "room-1", &signaling, &network, options()).await.unwrap();
    bob.add_track(MediaStream::new("bob-stream").with_track(TrackKind::Audio, "bob-mic"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    let alice = Session::join("alice", "room-1", &signaling, &network, options()).await.unwrap();
    alice.add_track(MediaStream::new("alice-stream").with_track(TrackKind::Video, "alice-cam"));

    let bob_view = wait_until(&bob, "alice's track", |s| s.remote_tracks.len() == 1).await;
    let alice_view = wait_until(&alice, "bob's track", |s| s.remote_tracks.len() == 1).await;
    assert_eq!(bob_view.remote_tracks[0].id, "alice-cam");
    assert_eq!(alice_view.remote_tracks[0].id, "bob-mic");
}

#[tokio::test]
async fn test_chat_goes_over_the_data_channel() {
    let signaling = Counting::new(BroadcastHub::new(POLL));
    let network = LoopbackNetwork::new();
    let (bob, alice) = connected_pair(&signaling, &network).await;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let _chat = bob.subscribe(SessionField::Chat, move |event| {
        if let SessionEvent::Chat { from, text } = event {
            let _ = tx.send((from.clone(), text.clone()));
        }
    });

    assert!(alice.send_chat("hello bob"));
    let (from, text) = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(from, "alice");
    assert_eq!(text, "hello bob");
    assert_eq!(signaling.count("alice", SignalKind::Chat), 0);
}

#[tokio::test]
async fn test_identity_learned_in_session() {
    // Over a broadcast relay bob's first ready reaches nobody, so alice
    // only learns who offered through whoAreYou/iAm.
    let signaling = BroadcastHub::new(POLL);
    let network = LoopbackNetwork::new();
    let (bob, alice) = connected_pair(&signaling, &network).await;

    wait_until(&alice, "alice learns bob", |s| s.remote_identity == "bob").await;
    assert_eq!(bob.snapshot().remote_identity, "alice");
}

#[tokio::test]
async fn test_hangup_closes_the_other_side() {
    let (_dir, _store, signaling) = store_relay();
    let network = LoopbackNetwork::new();
    let (bob, alice) = connected_pair(&signaling, &network).await;

    bob.leave().await;
    wait_until(&alice, "alice closed", |s| s.status == CallStatus::Closed).await;
    assert!(alice.snapshot().errors.is_empty());
}

#[tokio::test]
async fn test_transport_failure_is_terminal() {
    let signaling = BroadcastHub::new(POLL);
    let network = LoopbackNetwork::new();
    let (bob, alice) = connected_pair(&signaling, &network).await;

    network.fail();
    wait_until(&bob, "bob failed", |s| s.status == CallStatus::Failed).await;
    wait_until(&alice, "alice failed", |s| s.status == CallStatus::Failed).await;

    alice.add_track(MediaStream::new("late").with_track(TrackKind::Audio, "late-mic"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(bob.snapshot().status, CallStatus::Failed);
    assert!(bob.snapshot().remote_tracks.is_empty());
}

#[tokio::test]
async fn test_malformed_offer_is_logged() {
    let (_dir, store, signaling) = store_relay();
    let network = LoopbackNetwork::new();
    let bob = Session::join("bob", "room-1", &signaling, &network, options()).await.unwrap();

    let errors = Arc::new(Mutex::new(Vec::new()));
    let _error_sub = {
        let errors = errors.clone();
        bob.subscribe(SessionField::Error, move |event| {
            if let SessionEvent::Error(message) = event {
                errors.lock().push(message.clone());
            }
        })
    };

    store.post(NewSignal::new("mallory", "room-1", "offer", "not json")).unwrap();
    let view = wait_until(&bob, "error logged", |s| !s.errors.is_empty()).await;

    assert!(view.errors[0].contains("Malformed offer"), "{:?}", view.errors);
    assert_eq!(view.status, CallStatus::SentReady);
    assert_eq!(errors.lock().len(), 1);
}

#[tokio::test]
async fn test_join_rejects_blank_names() {
    let signaling = BroadcastHub::new(POLL);
    let network = LoopbackNetwork::new();
    assert!(Session::join("  ", "room-1", &signaling, &network, options()).await.is_err());
    assert!(Session::join("bob", "", &signaling, &network, options()).await.is_err());
}

#[tokio::test]
async fn test_unsent_offer_does_not_wedge_the_call() {
    let (_dir, _store, signaling) = store_relay();
    let network = LoopbackNetwork::new();
    let flaky = DropFirstOffer {
        inner: signaling.clone(),
        dropped: Arc::default(),
    };

    // bob offers through the healthy relay; alice's offer is lost, so she
    // has to answer bob's offer with her own one rolled back.
    let bob = Session::join("bob", "room-1", &signaling, &network, options()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let alice = Session::join("alice", "room-1", &flaky, &network, options()).await.unwrap();

    let alice_view = wait_until(&alice, "alice connected", |s| s.status == CallStatus::Connected).await;
    wait_until(&bob, "bob connected", |s| s.status == CallStatus::Connected).await;

    assert_eq!(alice_view.errors.len(), 1, "{:?}", alice_view.errors);
    assert!(alice_view.errors[0].contains("Failed to create offer"), "{:?}", alice_view.errors);
    assert!(bob.snapshot().errors.is_empty(), "{:?}", bob.snapshot().errors);
}
