//! Call negotiation between the two participants of a room
//!
//! The [`Negotiator`] drives offer/answer over the relay and talks to the
//! media stack through [`HostSession`]:
//! - [`WebRtcHost`]: a real peer connection from the `webrtc` crate
//! - [`LoopbackHost`]: an in-memory pair for tests and local demos

mod host;
mod loopback;
mod negotiation;
mod peer;
mod status;
mod types;

#[cfg(test)]
mod tests;

pub use host::{HostError, HostEvent, HostEventSink, HostFactory, HostSession};
pub use loopback::{LoopbackHost, LoopbackNetwork};
pub use negotiation::{Command, Input, Negotiator};
pub use peer::{WebRtcHost, WebRtcHostFactory};
pub use status::CallStatus;
pub use types::{
    AppMessage, IceCandidate, LocalTrack, MediaStream, PeerConnectionState, ReadyAnnouncement, RemoteTrack,
    SdpType, SessionDescription, TrackKind, WebRtcConfig,
};
