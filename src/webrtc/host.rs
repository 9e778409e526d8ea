//! Host media-transport capability
//!
//! The negotiator never touches a concrete peer connection. It drives a
//! [`HostSession`] and reacts to the [`HostEvent`]s the host pushes into the
//! sink it was created with. [`super::WebRtcHost`] backs it with the
//! `webrtc` crate, [`super::LoopbackHost`] with an in-memory pair.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use super::types::{IceCandidate, LocalTrack, PeerConnectionState, RemoteTrack, SessionDescription};

#[derive(Debug, Error)]
pub enum HostError {
    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Data channel not open")]
    NotConnected,
    #[error("Session closed")]
    Closed,
}

/// Notifications raised by the host, in the order it observed them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// A local candidate was gathered; `None` marks the end of gathering.
    IceCandidate(Option<IceCandidate>),
    RemoteTrack(RemoteTrack),
    RemoteTrackRemoved(String),
    ConnectionState(PeerConnectionState),
    NegotiationNeeded,
    DataChannelOpen,
    DataMessage(String),
}

/// Where a host delivers its events. Cheap to clone into callbacks.
#[derive(Clone)]
pub struct HostEventSink(Arc<dyn Fn(HostEvent) + Send + Sync>);

impl HostEventSink {
    pub fn new(f: impl Fn(HostEvent) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn emit(&self, event: HostEvent) {
        (self.0)(event)
    }
}

/// One peer session on the host media transport.
#[async_trait]
pub trait HostSession: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, HostError>;

    async fn create_answer(&self) -> Result<SessionDescription, HostError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), HostError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), HostError>;

    /// Discard a local offer that has not been answered.
    async fn rollback(&self) -> Result<(), HostError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), HostError>;

    /// Start sending a track. Adding a track already sent is a no-op.
    async fn add_track(&self, track: &LocalTrack) -> Result<(), HostError>;

    async fn remove_track(&self, track_id: &str) -> Result<(), HostError>;

    /// Ids of the tracks currently attached to senders.
    async fn sender_track_ids(&self) -> Vec<String>;

    /// Send an application message over the session's data channel.
    async fn send_data(&self, text: &str) -> Result<(), HostError>;

    async fn close(&self);
}

#[async_trait]
pub trait HostFactory: Send + Sync {
    async fn create(&self, events: HostEventSink) -> Result<Arc<dyn HostSession>, HostError>;
}
