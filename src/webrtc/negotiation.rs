//! Negotiation state machine
//!
//! One [`Negotiator`] task per session consumes a single queue carrying
//! relay signals, host events and facade commands, plus its own ready
//! re-announce timer, so no two transitions ever race.
//!
//! Roles: whoever receives `ready` offers, whoever receives an offer
//! answers. Both `ready`s usually sit in the relay at once, so both sides
//! tend to offer. The participant that joined first is then polite: it
//! drops its own offer and answers, which leaves the later joiner as the
//! offerer. The other side ignores the colliding offer. Join times travel
//! in the `ready` payload; when they are missing or equal the greater
//! identity is polite.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::host::{HostError, HostEvent, HostSession};
use super::status::CallStatus;
use super::types::{
    AppMessage, IceCandidate, MediaStream, PeerConnectionState, ReadyAnnouncement, SdpType, SessionDescription,
};
use crate::session::{EventHub, SessionEvent, SessionSnapshot};
use crate::signal::{Incoming, SignalKind, SignalTransport, TransportError};

/// Everything the negotiator reacts to, in arrival order.
#[derive(Debug)]
pub enum Input {
    Signal(Incoming),
    Host(HostEvent),
    Command(Command),
}

/// Requests from the session facade.
#[derive(Debug)]
pub enum Command {
    SendChat(String),
    AddTrack(MediaStream),
    CloseTrack(String),
    /// Hang up and stop. The sender, if any, fires once closed.
    Leave(Option<oneshot::Sender<()>>),
}

#[derive(Debug, Error)]
enum NegotiationError {
    #[error("{0}")]
    Host(#[from] HostError),
    #[error("{0}")]
    Transport(#[from] TransportError),
    #[error("{0}")]
    Encoding(#[from] serde_json::Error),
}

pub struct Negotiator {
    view: SessionSnapshot,
    host: Arc<dyn HostSession>,
    transport: Arc<dyn SignalTransport>,
    hub: Arc<EventHub>,
    snapshot: watch::Sender<SessionSnapshot>,
    ready_retry: Duration,
    ready_deadline: Option<Instant>,
    /// Milliseconds since the Unix epoch when this session joined.
    joined_at: u64,
    remote_joined_at: Option<u64>,
    /// Our offer is out and its answer has not been applied.
    awaiting_answer: bool,
    /// Track ids attached when the outstanding offer was made.
    offered: Option<Vec<String>>,
    /// Track ids covered by the last completed offer/answer we initiated.
    negotiated: Vec<String>,
}

impl Negotiator {
    pub fn new(
        view: SessionSnapshot,
        host: Arc<dyn HostSession>,
        transport: Arc<dyn SignalTransport>,
        hub: Arc<EventHub>,
        snapshot: watch::Sender<SessionSnapshot>,
        ready_retry: Duration,
    ) -> Self {
        Self {
            view,
            host,
            transport,
            hub,
            snapshot,
            ready_retry,
            ready_deadline: None,
            joined_at: unix_millis(),
            remote_joined_at: None,
            awaiting_answer: false,
            offered: None,
            negotiated: Vec::new(),
        }
    }

    /// Announce `ready`, then process inputs until the session is left or
    /// every input sender is gone.
    pub async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<Input>) {
        self.announce_ready().await;

        loop {
            let deadline = self.ready_deadline;
            let ready_tick = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                input = inputs.recv() => match input {
                    Some(input) => {
                        if !self.handle(input).await {
                            break;
                        }
                    }
                    None => {
                        debug!("Session inputs closed");
                        self.leave().await;
                        break;
                    }
                },
                _ = ready_tick => self.on_ready_tick().await,
            }
        }

        debug!("Negotiator for {} in {} stopped", self.view.local_identity, self.view.room);
    }

    /// Returns false once the negotiator should stop.
    async fn handle(&mut self, input: Input) -> bool {
        match input {
            Input::Signal(signal) => self.on_signal(signal).await,
            Input::Host(event) => self.on_host_event(event).await,
            Input::Command(Command::Leave(reply)) => {
                self.leave().await;
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
                return false;
            }
            Input::Command(command) => self.on_command(command).await,
        }
        true
    }

    async fn announce_ready(&mut self) {
        let ready = ReadyAnnouncement::new(self.view.local_identity.clone(), self.joined_at);
        let sent = match serde_json::to_string(&ready) {
            Ok(data) => self.transport.send(SignalKind::Ready, &data).await.map_err(NegotiationError::from),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = sent {
            warn!("Failed to announce ready: {}", e);
        }
        if self.view.status == CallStatus::New {
            self.transition(CallStatus::SentReady);
        }
        self.ready_deadline = Some(Instant::now() + self.ready_retry);
    }

    async fn on_ready_tick(&mut self) {
        if self.view.status.awaiting_peer() {
            debug!("No peer yet in {}, announcing ready again", self.view.room);
            self.announce_ready().await;
        } else {
            self.ready_deadline = None;
        }
    }

    // Relay signals

    async fn on_signal(&mut self, signal: Incoming) {
        let status = self.view.status;
        if status == CallStatus::Closed
            || (status == CallStatus::Failed && signal.kind != SignalKind::Hangup)
        {
            debug!("Call is {}, dropping {} from {}", status, signal.kind, signal.from);
            return;
        }

        debug!("{} got {} from {}", self.view.local_identity, signal.kind, signal.from);
        let kind = signal.kind;
        match kind {
            SignalKind::Ready => self.on_ready(signal).await,
            SignalKind::Offer => self.on_offer(signal).await,
            SignalKind::Answer => self.on_answer(signal).await,
            SignalKind::Candidate => self.on_candidate(&signal.data).await,
            SignalKind::Chat => self.on_chat(&signal.from, signal.data),
            SignalKind::WhoAreYou => {
                let identity = self.view.local_identity.clone();
                if let Err(e) = self.transport.send(SignalKind::IAm, &identity).await {
                    warn!("Failed to answer whoAreYou: {}", e);
                }
            }
            SignalKind::IAm => self.learn_remote_identity(&signal.data),
            SignalKind::Hangup => self.on_hangup().await,
        }
    }

    async fn on_ready(&mut self, signal: Incoming) {
        let ready = ReadyAnnouncement::parse(&signal.data);
        if ready.joined_at.is_some() {
            self.remote_joined_at = ready.joined_at;
        }

        // Acting on a ready mid-negotiation would race the exchange already
        // under way, and a ready while in a call must not restart it.
        if !self.view.status.awaiting_peer() {
            debug!("Ignoring ready from {} while {}", signal.from, self.view.status);
            return;
        }

        let name = if ready.identity.is_empty() { &signal.from } else { &ready.identity };
        self.learn_remote_identity(name);

        if self.transition(CallStatus::GotReady) {
            self.create_offer().await;
        }
    }

    async fn on_offer(&mut self, signal: Incoming) {
        let offer = match parse_description(&signal.data, SdpType::Offer) {
            Ok(offer) => offer,
            Err(e) => {
                self.record_error(format!("Malformed offer from {}: {}", signal.from, e));
                return;
            }
        };

        if self.awaiting_answer {
            if !self.is_polite(&signal.from) {
                info!("Offer collision with {}, keeping ours", signal.from);
                return;
            }
            info!("Offer collision with {}, taking theirs", signal.from);
            if let Err(e) = self.host.rollback().await {
                self.record_error(format!("Failed to roll back offer: {}", e));
                return;
            }
            self.awaiting_answer = false;
            self.offered = None;
        }

        let in_call = self.view.status.in_call();
        if !in_call && !self.transition(CallStatus::GotOffer) {
            return;
        }

        match self.answer(offer).await {
            Ok(()) => {
                if in_call {
                    self.renegotiate_if_needed().await;
                } else {
                    self.transition(CallStatus::SentAnswer);
                }
            }
            Err(e) => self.record_error(format!("Failed to create answer: {}", e)),
        }
    }

    async fn on_answer(&mut self, signal: Incoming) {
        if !self.awaiting_answer {
            debug!("Ignoring unexpected answer from {}", signal.from);
            return;
        }

        let answer = match parse_description(&signal.data, SdpType::Answer) {
            Ok(answer) => answer,
            Err(e) => {
                self.record_error(format!("Malformed answer from {}: {}", signal.from, e));
                return;
            }
        };

        if let Err(e) = self.host.set_remote_description(answer).await {
            self.record_error(format!("Failed to apply answer: {}", e));
            return;
        }

        self.awaiting_answer = false;
        if let Some(offered) = self.offered.take() {
            self.negotiated = offered;
        }
        let senders = self.host.sender_track_ids().await;
        self.publish(SessionEvent::Senders(senders));

        if self.view.status == CallStatus::SentOffer {
            self.transition(CallStatus::GotAnswer);
        } else {
            self.renegotiate_if_needed().await;
        }
    }

    /// Candidates go straight to the host in arrival order; the host
    /// buffers any that precede their description.
    async fn on_candidate(&mut self, data: &str) {
        if data.is_empty() {
            return;
        }
        let candidate: IceCandidate = match serde_json::from_str(data) {
            Ok(candidate) => candidate,
            Err(e) => {
                warn!("Malformed candidate: {}", e);
                return;
            }
        };
        if candidate.candidate.is_empty() {
            return;
        }
        if let Err(e) = self.host.add_ice_candidate(candidate).await {
            warn!("Failed to add remote candidate: {}", e);
        }
    }

    fn on_chat(&mut self, from: &str, text: String) {
        let from = if self.view.remote_identity.is_empty() {
            from.to_string()
        } else {
            self.view.remote_identity.clone()
        };
        self.hub.publish(SessionEvent::Chat { from, text });
    }

    async fn on_hangup(&mut self) {
        info!("{} hung up", peer_name(&self.view.remote_identity));
        self.host.close().await;
        self.transition(CallStatus::Closed);
    }

    // Host events

    async fn on_host_event(&mut self, event: HostEvent) {
        match event {
            HostEvent::IceCandidate(candidate) => {
                let data = match candidate {
                    Some(candidate) => match serde_json::to_string(&candidate) {
                        Ok(data) => data,
                        Err(e) => {
                            warn!("Failed to encode candidate: {}", e);
                            return;
                        }
                    },
                    None => String::new(),
                };
                if let Err(e) = self.transport.send(SignalKind::Candidate, &data).await {
                    warn!("Failed to send candidate: {}", e);
                }
            }
            HostEvent::RemoteTrack(track) => {
                if !self.view.remote_tracks.iter().any(|t| t.id == track.id) {
                    debug!("Remote {} track {} added", track.kind, track.id);
                    self.view.remote_tracks.push(track);
                    self.publish(SessionEvent::RemoteTracks(self.view.remote_tracks.clone()));
                }
            }
            HostEvent::RemoteTrackRemoved(id) => {
                let before = self.view.remote_tracks.len();
                self.view.remote_tracks.retain(|t| t.id != id);
                if self.view.remote_tracks.len() != before {
                    debug!("Remote track {} removed", id);
                    self.publish(SessionEvent::RemoteTracks(self.view.remote_tracks.clone()));
                }
            }
            HostEvent::ConnectionState(state) => self.on_connection_state(state).await,
            HostEvent::NegotiationNeeded => self.renegotiate_if_needed().await,
            HostEvent::DataChannelOpen => {
                if self.view.remote_identity.is_empty() {
                    self.send_app(AppMessage::WhoAreYou).await;
                }
            }
            HostEvent::DataMessage(text) => match serde_json::from_str::<AppMessage>(&text) {
                Ok(AppMessage::Chat(chat)) => {
                    let from = self.view.remote_identity.clone();
                    self.on_chat(&from, chat);
                }
                Ok(AppMessage::WhoAreYou) => {
                    let identity = self.view.local_identity.clone();
                    self.send_app(AppMessage::IAm(identity)).await;
                }
                Ok(AppMessage::IAm(name)) => self.learn_remote_identity(&name),
                Err(e) => warn!("Unknown data channel message: {}", e),
            },
        }
    }

    async fn on_connection_state(&mut self, state: PeerConnectionState) {
        let next = match state {
            PeerConnectionState::New | PeerConnectionState::Connecting => return,
            PeerConnectionState::Connected => CallStatus::Connected,
            PeerConnectionState::Disconnected => CallStatus::Disconnected,
            PeerConnectionState::Failed => CallStatus::Failed,
            PeerConnectionState::Closed => CallStatus::Closed,
        };

        if self.transition(next) && next == CallStatus::Connected {
            // Tracks added while the call was being set up still need to
            // reach the other side.
            self.renegotiate_if_needed().await;
        }
    }

    // Facade commands

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::SendChat(text) => self.send_app(AppMessage::Chat(text)).await,
            Command::AddTrack(stream) => {
                let mut changed = false;
                for track in stream.tracks {
                    if !self.view.local_tracks.iter().any(|t| t.id == track.id) {
                        self.view.local_tracks.push(track);
                        changed = true;
                    }
                }
                if changed {
                    self.publish(SessionEvent::LocalTracks(self.view.local_tracks.clone()));
                    self.renegotiate_if_needed().await;
                }
            }
            Command::CloseTrack(id) => {
                let before = self.view.local_tracks.len();
                self.view.local_tracks.retain(|t| t.id != id);
                if self.view.local_tracks.len() == before {
                    debug!("No local track {} to close", id);
                    return;
                }
                if let Err(e) = self.host.remove_track(&id).await {
                    warn!("Failed to detach track {}: {}", id, e);
                }
                self.publish(SessionEvent::LocalTracks(self.view.local_tracks.clone()));
                self.renegotiate_if_needed().await;
            }
            Command::Leave(_) => {}
        }
    }

    async fn leave(&mut self) {
        if self.view.status == CallStatus::Closed {
            return;
        }
        if let Err(e) = self.transport.send(SignalKind::Hangup, "").await {
            warn!("Failed to send hangup: {}", e);
        }
        self.host.close().await;
        self.transition(CallStatus::Closed);
    }

    // Offer/answer

    /// Attach local tracks that have no sender yet, then send a fresh offer.
    /// Failures land in the error log.
    async fn create_offer(&mut self) {
        match self.offer().await {
            Ok(()) => {
                if !self.view.status.in_call() {
                    self.transition(CallStatus::SentOffer);
                }
            }
            Err(e) => {
                // A local offer that never reached the peer must not block
                // the next remote offer.
                if self.awaiting_answer {
                    if let Err(e) = self.host.rollback().await {
                        warn!("Failed to roll back unsent offer: {}", e);
                    }
                }
                self.awaiting_answer = false;
                self.offered = None;
                self.record_error(format!("Failed to create offer: {}", e));
            }
        }
    }

    async fn offer(&mut self) -> Result<(), NegotiationError> {
        let attached = self.host.sender_track_ids().await;
        for track in &self.view.local_tracks {
            if !attached.contains(&track.id) {
                self.host.add_track(track).await?;
            }
        }

        let offer = self.host.create_offer().await?;
        self.host.set_local_description(offer.clone()).await?;
        self.offered = Some(self.host.sender_track_ids().await);
        self.awaiting_answer = true;

        self.transport
            .send(SignalKind::Offer, &serde_json::to_string(&offer)?)
            .await?;
        Ok(())
    }

    async fn answer(&mut self, offer: SessionDescription) -> Result<(), NegotiationError> {
        self.host.set_remote_description(offer).await?;
        let answer = self.host.create_answer().await?;
        self.host.set_local_description(answer.clone()).await?;

        self.transport
            .send(SignalKind::Answer, &serde_json::to_string(&answer)?)
            .await?;
        Ok(())
    }

    /// In a call, offer again whenever the local track set differs from
    /// what the last offer we initiated covered.
    async fn renegotiate_if_needed(&mut self) {
        if !self.view.status.in_call() || self.awaiting_answer {
            return;
        }

        let mut local: Vec<&str> = self.view.local_tracks.iter().map(|t| t.id.as_str()).collect();
        let mut negotiated: Vec<&str> = self.negotiated.iter().map(String::as_str).collect();
        local.sort_unstable();
        negotiated.sort_unstable();
        if local == negotiated {
            return;
        }

        info!("Local tracks changed, renegotiating with {}", peer_name(&self.view.remote_identity));
        self.create_offer().await;
    }

    async fn send_app(&mut self, message: AppMessage) {
        let text = match serde_json::to_string(&message) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode app message: {}", e);
                return;
            }
        };
        if let Err(e) = self.host.send_data(&text).await {
            self.record_error(format!("Failed to send message: {}", e));
        }
    }

    /// Whether to yield to `remote` when both sides offered.
    fn is_polite(&self, remote: &str) -> bool {
        match self.remote_joined_at {
            Some(theirs) if theirs != self.joined_at => self.joined_at < theirs,
            _ => self.view.local_identity.as_str() > remote,
        }
    }

    // View bookkeeping

    /// Move to `next` if the state machine allows it. Illegal moves are
    /// logged and leave the status unchanged.
    fn transition(&mut self, next: CallStatus) -> bool {
        let current = self.view.status;
        if current == next {
            return false;
        }
        if !current.can_transition_to(next) {
            warn!(
                "{}: rejected call status change {} -> {}",
                self.view.local_identity, current, next
            );
            return false;
        }

        info!("{}: call status {} -> {}", self.view.local_identity, current, next);
        self.view.status = next;
        if !next.awaiting_peer() {
            self.ready_deadline = None;
        }
        self.publish(SessionEvent::CallStatus(next));
        true
    }

    /// The remote identity is learned once per call.
    fn learn_remote_identity(&mut self, name: &str) {
        if name.is_empty() || !self.view.remote_identity.is_empty() {
            return;
        }
        info!("{} is talking to {}", self.view.local_identity, name);
        self.view.remote_identity = name.to_string();
        self.publish(SessionEvent::RemoteIdentity(name.to_string()));
    }

    fn record_error(&mut self, message: String) {
        warn!("{}: {}", self.view.local_identity, message);
        self.view.errors.push(message.clone());
        self.publish(SessionEvent::Error(message));
    }

    fn publish(&self, event: SessionEvent) {
        self.snapshot.send_replace(self.view.clone());
        self.hub.publish(event);
    }
}

fn parse_description(data: &str, expected: SdpType) -> Result<SessionDescription, String> {
    let desc: SessionDescription = serde_json::from_str(data).map_err(|e| e.to_string())?;
    if desc.sdp_type != expected {
        return Err(format!("expected {:?}, got {:?}", expected, desc.sdp_type));
    }
    Ok(desc)
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

fn peer_name(identity: &str) -> &str {
    if identity.is_empty() {
        "peer"
    } else {
        identity
    }
}
