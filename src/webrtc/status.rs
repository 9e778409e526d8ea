//! Call status state machine

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a call stands, from this participant's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CallStatus {
    #[default]
    New,
    SentReady,
    GotReady,
    GotOffer,
    SentOffer,
    SentAnswer,
    GotAnswer,
    Connected,
    Failed,
    Disconnected,
    Closed,
}

impl CallStatus {
    /// Legal moves. Anything not listed is rejected by the negotiator.
    pub fn can_transition_to(self, next: CallStatus) -> bool {
        use CallStatus::*;

        if next == Closed {
            return self != Closed;
        }

        match self {
            New => matches!(next, SentReady | GotReady | GotOffer),
            SentReady => matches!(next, GotReady | GotOffer),
            // GotReady -> GotOffer when our own offer could not be made
            GotReady => matches!(next, SentOffer | GotOffer),
            GotOffer => matches!(next, SentAnswer),
            // SentOffer -> GotOffer is the polite side of an offer collision
            SentOffer => matches!(next, GotAnswer | GotOffer | Failed),
            SentAnswer => matches!(next, Connected | GotOffer | Failed),
            GotAnswer => matches!(next, Connected | GotOffer | Failed),
            Connected => matches!(next, Disconnected | Failed),
            Disconnected => matches!(next, Connected | Failed),
            Failed | Closed => false,
        }
    }

    /// The host transport has established this call at least once.
    /// Offers and answers exchanged now are renegotiations and leave the
    /// status alone.
    pub fn in_call(self) -> bool {
        matches!(self, CallStatus::Connected | CallStatus::Disconnected)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, CallStatus::Failed | CallStatus::Closed)
    }

    /// Nothing heard from the other participant yet.
    pub fn awaiting_peer(self) -> bool {
        matches!(self, CallStatus::New | CallStatus::SentReady)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::New => "new",
            CallStatus::SentReady => "sentReady",
            CallStatus::GotReady => "gotReady",
            CallStatus::GotOffer => "gotOffer",
            CallStatus::SentOffer => "sentOffer",
            CallStatus::SentAnswer => "sentAnswer",
            CallStatus::GotAnswer => "gotAnswer",
            CallStatus::Connected => "connected",
            CallStatus::Failed => "failed",
            CallStatus::Disconnected => "disconnected",
            CallStatus::Closed => "closed",
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
