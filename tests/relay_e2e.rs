//! Two sessions meeting through a real HTTP relay
//!
//! The relay runs on an ephemeral port; calls use the in-memory loopback
//! host so the tests need no media stack.

use anyhow::Result;
use duet::{
    CallStatus, HttpSignaling, LoopbackNetwork, MediaStream, RelayServer, Session, SessionEvent,
    SessionField, SessionOptions, SessionSnapshot, SignalStore, TrackKind,
};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;

const POLL_WINDOW: Duration = Duration::from_millis(500);
const WAIT: Duration = Duration::from_secs(10);

fn options() -> SessionOptions {
    SessionOptions {
        ready_retry: Duration::from_secs(4),
        retry_delay: Duration::from_millis(50),
    }
}

async fn serve(listener: TcpListener, dir: &TempDir) -> Result<Arc<SignalStore>> {
    let store = Arc::new(SignalStore::open(dir.path().join("relay"))?);
    let server = RelayServer::new(store.clone(), listener.local_addr()?.to_string())
        .with_poll_timeout(POLL_WINDOW);
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    Ok(store)
}

async fn start_relay() -> Result<(TempDir, String)> {
    let dir = TempDir::new()?;
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let url = format!("http://{}/api/poll", listener.local_addr()?);
    serve(listener, &dir).await?;
    Ok((dir, url))
}

async fn wait_until(
    session: &Session,
    what: &str,
    predicate: impl Fn(&SessionSnapshot) -> bool,
) -> Result<SessionSnapshot> {
    let mut changes = session.changes();
    let snapshot = match tokio::time::timeout(WAIT, changes.wait_for(|s| predicate(s))).await {
        Ok(Ok(snapshot)) => snapshot.clone(),
        _ => anyhow::bail!("timed out waiting for {}: {:?}", what, session.snapshot()),
    };
    Ok(snapshot)
}

fn record_statuses(session: &Session) -> (Arc<Mutex<Vec<CallStatus>>>, duet::Subscription) {
    let history = Arc::new(Mutex::new(Vec::new()));
    let sink = history.clone();
    let subscription = session.subscribe(SessionField::CallStatus, move |event| {
        if let SessionEvent::CallStatus(status) = event {
            sink.lock().push(*status);
        }
    });
    (history, subscription)
}

/// `first` joins, `second` joins shortly after; `second` must end as the
/// offerer and `first` as the answerer whatever the names.
async fn assert_second_joiner_offers(first: &str, second: &str) -> Result<()> {
    let (_dir, url) = start_relay().await?;
    let signaling = HttpSignaling::new(&url, POLL_WINDOW);
    let network = LoopbackNetwork::new();

    let p1 = Session::join(first, "lobby", &signaling, &network, options()).await?;
    let (p1_history, _p1_sub) = record_statuses(&p1);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let p2 = Session::join(second, "lobby", &signaling, &network, options()).await?;
    let (p2_history, _p2_sub) = record_statuses(&p2);

    let p1_view = wait_until(&p1, "first joiner connected", |s| s.status == CallStatus::Connected).await?;
    let p2_view = wait_until(&p2, "second joiner connected", |s| s.status == CallStatus::Connected).await?;

    let p2_history = p2_history.lock().clone();
    assert!(p2_history.contains(&CallStatus::SentOffer), "{}: {:?}", second, p2_history);
    assert!(p2_history.contains(&CallStatus::GotAnswer), "{}: {:?}", second, p2_history);
    assert!(!p2_history.contains(&CallStatus::SentAnswer), "{}: {:?}", second, p2_history);
    let p1_history = p1_history.lock().clone();
    assert!(p1_history.contains(&CallStatus::SentAnswer), "{}: {:?}", first, p1_history);
    assert!(!p1_history.contains(&CallStatus::GotAnswer), "{}: {:?}", first, p1_history);

    assert_eq!(p1_view.remote_identity, second);
    assert_eq!(p2_view.remote_identity, first);
    Ok(())
}

#[tokio::test]
async fn test_second_joiner_offers() -> Result<()> {
    assert_second_joiner_offers("bob", "alice").await
}

#[tokio::test]
async fn test_second_joiner_offers_when_its_name_sorts_last() -> Result<()> {
    assert_second_joiner_offers("alice", "bob").await
}

#[tokio::test]
async fn test_renegotiation_over_relay() -> Result<()> {
    let (_dir, url) = start_relay().await?;
    let signaling = HttpSignaling::new(&url, POLL_WINDOW);
    let network = LoopbackNetwork::new();

    let bob = Session::join("bob", "studio", &signaling, &network, options()).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let alice = Session::join("alice", "studio", &signaling, &network, options()).await?;
    wait_until(&bob, "bob connected", |s| s.status == CallStatus::Connected).await?;
    wait_until(&alice, "alice connected", |s| s.status == CallStatus::Connected).await?;

    alice.add_track(MediaStream::new("alice-cam").with_track(TrackKind::Video, "cam"));
    let view = wait_until(&bob, "alice's camera", |s| s.remote_tracks.len() == 1).await?;
    assert_eq!(view.remote_tracks[0].kind, TrackKind::Video);
    assert_eq!(view.status, CallStatus::Connected);

    bob.add_track(MediaStream::new("bob-mic").with_track(TrackKind::Audio, "mic"));
    let view = wait_until(&alice, "bob's microphone", |s| s.remote_tracks.len() == 1).await?;
    assert_eq!(view.remote_tracks[0].id, "mic");

    alice.close_track("cam");
    wait_until(&bob, "camera gone", |s| s.remote_tracks.is_empty()).await?;

    assert_eq!(alice.snapshot().status, CallStatus::Connected);
    assert_eq!(bob.snapshot().status, CallStatus::Connected);
    assert!(alice.snapshot().errors.is_empty(), "{:?}", alice.snapshot().errors);
    assert!(bob.snapshot().errors.is_empty(), "{:?}", bob.snapshot().errors);
    Ok(())
}

#[tokio::test]
async fn test_stray_ready_keeps_call_up() -> Result<()> {
    let (_dir, url) = start_relay().await?;
    let signaling = HttpSignaling::new(&url, POLL_WINDOW);
    let network = LoopbackNetwork::new();

    let bob = Session::join("bob", "den", &signaling, &network, options()).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let alice = Session::join("alice", "den", &signaling, &network, options()).await?;
    wait_until(&bob, "bob connected", |s| s.status == CallStatus::Connected).await?;
    wait_until(&alice, "alice connected", |s| s.status == CallStatus::Connected).await?;

    let (bob_history, _bob_sub) = record_statuses(&bob);
    let client = reqwest::Client::new();
    for _ in 0..3 {
        client
            .post(&url)
            .json(&json!({"from": "alice", "to": "den", "type": "ready", "data": "alice"}))
            .send()
            .await?
            .error_for_status()?;
    }
    tokio::time::sleep(Duration::from_millis(800)).await;

    assert_eq!(bob.snapshot().status, CallStatus::Connected);
    assert!(bob_history.lock().is_empty(), "{:?}", bob_history.lock());
    Ok(())
}

#[tokio::test]
async fn test_hangup_over_relay() -> Result<()> {
    let (_dir, url) = start_relay().await?;
    let signaling = HttpSignaling::new(&url, POLL_WINDOW);
    let network = LoopbackNetwork::new();

    let bob = Session::join("bob", "booth", &signaling, &network, options()).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let alice = Session::join("alice", "booth", &signaling, &network, options()).await?;
    wait_until(&alice, "alice connected", |s| s.status == CallStatus::Connected).await?;

    alice.leave().await;
    wait_until(&bob, "bob closed", |s| s.status == CallStatus::Closed).await?;
    Ok(())
}

#[tokio::test]
async fn test_sessions_wait_out_relay_outage() -> Result<()> {
    // Reserve a port, then leave it closed while both sessions join.
    let reserved = TcpListener::bind("127.0.0.1:0").await?;
    let addr = reserved.local_addr()?;
    drop(reserved);

    let url = format!("http://{}/", addr);
    let signaling = HttpSignaling::new(&url, POLL_WINDOW);
    let network = LoopbackNetwork::new();
    let fast = SessionOptions {
        ready_retry: Duration::from_millis(500),
        ..options()
    };

    let bob = Session::join("bob", "attic", &signaling, &network, fast).await?;
    let alice = Session::join("alice", "attic", &signaling, &network, fast).await?;
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(bob.snapshot().status.awaiting_peer());
    assert!(alice.snapshot().status.awaiting_peer());

    let dir = TempDir::new()?;
    serve(TcpListener::bind(addr).await?, &dir).await?;

    wait_until(&bob, "bob connected", |s| s.status == CallStatus::Connected).await?;
    wait_until(&alice, "alice connected", |s| s.status == CallStatus::Connected).await?;
    Ok(())
}
