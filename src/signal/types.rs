//! Relay message kinds and addressing

use serde::{Deserialize, Serialize};
use signal_store::Signal;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Every message kind carried through the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SignalKind {
    Ready,
    Offer,
    Answer,
    Candidate,
    Chat,
    WhoAreYou,
    IAm,
    Hangup,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Ready => "ready",
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Candidate => "candidate",
            SignalKind::Chat => "chat",
            SignalKind::WhoAreYou => "whoAreYou",
            SignalKind::IAm => "iAm",
            SignalKind::Hangup => "hangup",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignalKind {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ready" => Ok(SignalKind::Ready),
            "offer" => Ok(SignalKind::Offer),
            "answer" => Ok(SignalKind::Answer),
            "candidate" => Ok(SignalKind::Candidate),
            "chat" => Ok(SignalKind::Chat),
            "whoAreYou" => Ok(SignalKind::WhoAreYou),
            "iAm" => Ok(SignalKind::IAm),
            "hangup" => Ok(SignalKind::Hangup),
            other => Err(TransportError::Malformed(format!("unknown signal type {:?}", other))),
        }
    }
}

/// Sender identity and room, fixed for the lifetime of a transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    /// Local participant identity
    pub from: String,
    /// Room both participants address
    pub to: String,
}

impl Route {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// A signal delivered to this participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Incoming {
    pub from: String,
    pub kind: SignalKind,
    pub data: String,
}

impl TryFrom<Signal> for Incoming {
    type Error = TransportError;

    fn try_from(signal: Signal) -> Result<Self, Self::Error> {
        Ok(Self {
            kind: signal.kind.parse()?,
            from: signal.from,
            data: signal.data,
        })
    }
}

/// Errors from signal transport operations
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Relay responded with status {0}")]
    Status(u16),
    #[error("Malformed signal: {0}")]
    Malformed(String),
    #[error("Store error: {0}")]
    Store(#[from] signal_store::StoreError),
    #[error("Channel closed")]
    Closed,
}
