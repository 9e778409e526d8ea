//! Media and negotiation types shared by hosts and the negotiator

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

/// A track this participant sends.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocalTrack {
    pub id: String,
    pub kind: TrackKind,
    pub stream_id: String,
}

/// A track received from the other participant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
    pub stream_id: String,
}

/// A group of local tracks added together, e.g. one camera and microphone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaStream {
    pub id: String,
    pub tracks: Vec<LocalTrack>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tracks: Vec::new(),
        }
    }

    pub fn with_track(mut self, kind: TrackKind, track_id: impl Into<String>) -> Self {
        self.tracks.push(LocalTrack {
            id: track_id.into(),
            kind,
            stream_id: self.id.clone(),
        });
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// `{"type":"offer"|"answer","sdp":"..."}` as carried in offer and
/// answer signals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

/// Connection state vocabulary reported by a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Application messages exchanged over the session's data channel,
/// `{"type":"chat","data":"..."}` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum AppMessage {
    Chat(String),
    WhoAreYou,
    IAm(String),
}

/// Payload of a `ready` signal.
///
/// `joined_at` (milliseconds since the Unix epoch) orders the two
/// participants when their offers collide. A bare identity, as sent by
/// older clients, parses with no join time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyAnnouncement {
    pub identity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub joined_at: Option<u64>,
}

impl ReadyAnnouncement {
    pub fn new(identity: impl Into<String>, joined_at: u64) -> Self {
        Self {
            identity: identity.into(),
            joined_at: Some(joined_at),
        }
    }

    pub fn parse(data: &str) -> Self {
        serde_json::from_str(data).unwrap_or_else(|_| Self {
            identity: data.to_string(),
            joined_at: None,
        })
    }
}

/// Settings for [`super::WebRtcHost`] peer connections.
#[derive(Debug, Clone, Default)]
pub struct WebRtcConfig {
    /// `stun:` URLs used for ICE
    pub stun_servers: Vec<String>,
    /// Feed silent frames into local audio tracks.
    pub silence: bool,
}
