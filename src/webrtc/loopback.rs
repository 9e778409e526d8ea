//! In-memory host pair
//!
//! Two [`LoopbackHost`]s created from the same [`LoopbackNetwork`] behave
//! like the two ends of a peer connection without any networking.
//! Descriptions list the sender tracks, each side "gathers" one candidate
//! on its first local description, and the pair reports `connected` once
//! both ends hold a completed offer/answer. Data messages are delivered to
//! the other end's event sink.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

use super::host::{HostError, HostEvent, HostEventSink, HostFactory, HostSession};
use super::types::{
    IceCandidate, LocalTrack, PeerConnectionState, RemoteTrack, SdpType, SessionDescription, TrackKind,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

struct Side {
    events: HostEventSink,
    signaling: SignalingState,
    has_local: bool,
    has_remote: bool,
    gathered: bool,
    connected: bool,
    closed: bool,
    senders: Vec<LocalTrack>,
    remote_tracks: Vec<RemoteTrack>,
    candidates_applied: usize,
}

impl Side {
    fn new(events: HostEventSink) -> Self {
        Self {
            events,
            signaling: SignalingState::Stable,
            has_local: false,
            has_remote: false,
            gathered: false,
            connected: false,
            closed: false,
            senders: Vec::new(),
            remote_tracks: Vec::new(),
            candidates_applied: 0,
        }
    }

    fn negotiated(&self) -> bool {
        self.has_local && self.has_remote && self.signaling == SignalingState::Stable && !self.closed
    }
}

#[derive(Default)]
struct Link {
    sides: Vec<Side>,
}

type Outbox = Vec<(HostEventSink, HostEvent)>;

impl Link {
    fn side(&mut self, index: usize) -> Result<&mut Side, HostError> {
        let side = self
            .sides
            .get_mut(index)
            .ok_or_else(|| HostError::InvalidState("unknown loopback side".to_string()))?;
        if side.closed {
            return Err(HostError::Closed);
        }
        Ok(side)
    }

    /// Connect both ends once each holds a completed negotiation.
    fn check_connected(&mut self, outbox: &mut Outbox) {
        if self.sides.len() != 2 || !self.sides.iter().all(Side::negotiated) {
            return;
        }
        for side in self.sides.iter_mut().filter(|s| !s.connected) {
            side.connected = true;
            outbox.push((side.events.clone(), HostEvent::ConnectionState(PeerConnectionState::Connecting)));
            outbox.push((side.events.clone(), HostEvent::ConnectionState(PeerConnectionState::Connected)));
            outbox.push((side.events.clone(), HostEvent::DataChannelOpen));
        }
    }
}

/// Shared medium for one pair of loopback hosts. Clone it into both
/// sessions; each [`HostFactory::create`] call takes the next free end.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    link: Arc<Mutex<Link>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remote candidates applied so far by one end (0 or 1).
    pub fn candidates_applied(&self, side: usize) -> usize {
        self.link
            .lock()
            .sides
            .get(side)
            .map_or(0, |s| s.candidates_applied)
    }

    /// Simulate the transport failing underneath both ends.
    pub fn fail(&self) {
        let outbox: Outbox = {
            let mut link = self.link.lock();
            link.sides
                .iter_mut()
                .filter(|s| !s.closed)
                .map(|s| {
                    s.connected = false;
                    (s.events.clone(), HostEvent::ConnectionState(PeerConnectionState::Failed))
                })
                .collect()
        };
        deliver(outbox);
    }
}

#[async_trait]
impl HostFactory for LoopbackNetwork {
    async fn create(&self, events: HostEventSink) -> Result<Arc<dyn HostSession>, HostError> {
        let mut link = self.link.lock();
        if link.sides.len() >= 2 {
            return Err(HostError::InvalidState("loopback network already has two ends".to_string()));
        }
        link.sides.push(Side::new(events));
        let side = link.sides.len() - 1;
        debug!("Created loopback end {}", side);

        Ok(Arc::new(LoopbackHost {
            link: self.link.clone(),
            side,
        }))
    }
}

pub struct LoopbackHost {
    link: Arc<Mutex<Link>>,
    side: usize,
}

impl LoopbackHost {
    fn other(&self) -> usize {
        1 - self.side
    }

    fn describe(&self, sdp_type: SdpType, senders: &[LocalTrack]) -> SessionDescription {
        let mut sdp = format!("v=0\r\no=loopback {} 0 IN IP4 127.0.0.1\r\ns=-\r\n", self.side);
        for track in senders {
            sdp.push_str(&format!("a=track:{} {} {}\r\n", track.kind, track.stream_id, track.id));
        }
        SessionDescription { sdp_type, sdp }
    }

    fn local_candidate(&self) -> IceCandidate {
        IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2130706431 127.0.0.1 {} typ host",
                self.side + 1,
                9000 + self.side
            ),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }
    }
}

fn parse_tracks(sdp: &str) -> Result<Vec<RemoteTrack>, HostError> {
    if !sdp.contains("o=loopback ") {
        return Err(HostError::InvalidState("not a loopback description".to_string()));
    }

    let mut tracks = Vec::new();
    for line in sdp.lines().filter_map(|l| l.strip_prefix("a=track:")) {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let [kind, stream_id, id] = parts.as_slice() else {
            return Err(HostError::InvalidState(format!("bad track line {:?}", line)));
        };
        let kind = match *kind {
            "audio" => TrackKind::Audio,
            "video" => TrackKind::Video,
            other => return Err(HostError::InvalidState(format!("bad track kind {:?}", other))),
        };
        tracks.push(RemoteTrack {
            id: id.to_string(),
            kind,
            stream_id: stream_id.to_string(),
        });
    }
    Ok(tracks)
}

fn deliver(outbox: Outbox) {
    for (sink, event) in outbox {
        sink.emit(event);
    }
}

#[async_trait]
impl HostSession for LoopbackHost {
    async fn create_offer(&self) -> Result<SessionDescription, HostError> {
        let mut link = self.link.lock();
        let side = link.side(self.side)?;
        if side.signaling == SignalingState::HaveRemoteOffer {
            return Err(HostError::InvalidState("cannot offer in have-remote-offer".to_string()));
        }
        Ok(self.describe(SdpType::Offer, &side.senders))
    }

    async fn create_answer(&self) -> Result<SessionDescription, HostError> {
        let mut link = self.link.lock();
        let side = link.side(self.side)?;
        if side.signaling != SignalingState::HaveRemoteOffer {
            return Err(HostError::InvalidState("no remote offer to answer".to_string()));
        }
        Ok(self.describe(SdpType::Answer, &side.senders))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), HostError> {
        let mut outbox = Outbox::new();
        {
            let mut link = self.link.lock();
            let side = link.side(self.side)?;
            side.signaling = match (desc.sdp_type, side.signaling) {
                (SdpType::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                    SignalingState::HaveLocalOffer
                }
                (SdpType::Answer, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
                (sdp_type, state) => {
                    return Err(HostError::InvalidState(format!(
                        "cannot apply local {:?} in {:?}",
                        sdp_type, state
                    )));
                }
            };
            side.has_local = true;

            if !side.gathered {
                side.gathered = true;
                outbox.push((side.events.clone(), HostEvent::IceCandidate(Some(self.local_candidate()))));
                outbox.push((side.events.clone(), HostEvent::IceCandidate(None)));
            }
            link.check_connected(&mut outbox);
        }
        deliver(outbox);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), HostError> {
        let tracks = parse_tracks(&desc.sdp)?;
        let mut outbox = Outbox::new();
        {
            let mut link = self.link.lock();
            let side = link.side(self.side)?;
            side.signaling = match (desc.sdp_type, side.signaling) {
                (SdpType::Offer, SignalingState::Stable) => SignalingState::HaveRemoteOffer,
                (SdpType::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
                (sdp_type, state) => {
                    return Err(HostError::InvalidState(format!(
                        "cannot apply remote {:?} in {:?}",
                        sdp_type, state
                    )));
                }
            };
            side.has_remote = true;

            for track in &tracks {
                if !side.remote_tracks.contains(track) {
                    outbox.push((side.events.clone(), HostEvent::RemoteTrack(track.clone())));
                }
            }
            for track in &side.remote_tracks {
                if !tracks.contains(track) {
                    outbox.push((side.events.clone(), HostEvent::RemoteTrackRemoved(track.id.clone())));
                }
            }
            side.remote_tracks = tracks;

            link.check_connected(&mut outbox);
        }
        deliver(outbox);
        Ok(())
    }

    async fn rollback(&self) -> Result<(), HostError> {
        let mut link = self.link.lock();
        let side = link.side(self.side)?;
        if side.signaling != SignalingState::HaveLocalOffer {
            return Err(HostError::InvalidState("no local offer to roll back".to_string()));
        }
        side.signaling = SignalingState::Stable;
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<(), HostError> {
        let mut link = self.link.lock();
        link.side(self.side)?.candidates_applied += 1;
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<(), HostError> {
        let sink = {
            let mut link = self.link.lock();
            let side = link.side(self.side)?;
            if side.senders.iter().any(|t| t.id == track.id) {
                return Ok(());
            }
            side.senders.push(track.clone());
            side.events.clone()
        };
        sink.emit(HostEvent::NegotiationNeeded);
        Ok(())
    }

    async fn remove_track(&self, track_id: &str) -> Result<(), HostError> {
        let sink = {
            let mut link = self.link.lock();
            let side = link.side(self.side)?;
            let before = side.senders.len();
            side.senders.retain(|t| t.id != track_id);
            if side.senders.len() == before {
                return Ok(());
            }
            side.events.clone()
        };
        sink.emit(HostEvent::NegotiationNeeded);
        Ok(())
    }

    async fn sender_track_ids(&self) -> Vec<String> {
        let link = self.link.lock();
        link.sides
            .get(self.side)
            .map(|s| s.senders.iter().map(|t| t.id.clone()).collect())
            .unwrap_or_default()
    }

    async fn send_data(&self, text: &str) -> Result<(), HostError> {
        let sink = {
            let mut link = self.link.lock();
            if !link.side(self.side)?.connected {
                return Err(HostError::NotConnected);
            }
            let other = self.other();
            match link.sides.get(other) {
                Some(peer) if peer.connected && !peer.closed => peer.events.clone(),
                _ => return Err(HostError::NotConnected),
            }
        };
        sink.emit(HostEvent::DataMessage(text.to_string()));
        Ok(())
    }

    async fn close(&self) {
        let outbox: Outbox = {
            let mut link = self.link.lock();
            let Some(side) = link.sides.get_mut(self.side) else {
                return;
            };
            if side.closed {
                return;
            }
            side.closed = true;
            let was_connected = std::mem::replace(&mut side.connected, false);

            let other = self.other();
            match link.sides.get_mut(other) {
                Some(peer) if was_connected && peer.connected && !peer.closed => {
                    peer.connected = false;
                    vec![(
                        peer.events.clone(),
                        HostEvent::ConnectionState(PeerConnectionState::Disconnected),
                    )]
                }
                _ => Vec::new(),
            }
        };
        debug!("Closed loopback end {}", self.side);
        deliver(outbox);
    }
}
