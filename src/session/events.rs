//! Field-level change notifications for one session

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::trace;

use crate::webrtc::{CallStatus, LocalTrack, RemoteTrack};

/// What a subscriber can listen to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionField {
    RemoteIdentity,
    CallStatus,
    LocalTracks,
    RemoteTracks,
    /// The set of tracks attached to senders changed after an answer.
    Senders,
    Chat,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    RemoteIdentity(String),
    CallStatus(CallStatus),
    LocalTracks(Vec<LocalTrack>),
    RemoteTracks(Vec<RemoteTrack>),
    Senders(Vec<String>),
    Chat { from: String, text: String },
    Error(String),
}

impl SessionEvent {
    pub fn field(&self) -> SessionField {
        match self {
            SessionEvent::RemoteIdentity(_) => SessionField::RemoteIdentity,
            SessionEvent::CallStatus(_) => SessionField::CallStatus,
            SessionEvent::LocalTracks(_) => SessionField::LocalTracks,
            SessionEvent::RemoteTracks(_) => SessionField::RemoteTracks,
            SessionEvent::Senders(_) => SessionField::Senders,
            SessionEvent::Chat { .. } => SessionField::Chat,
            SessionEvent::Error(_) => SessionField::Error,
        }
    }
}

/// A copy of one participant's view of the call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub local_identity: String,
    /// Empty until learned from `ready` or `iAm`
    pub remote_identity: String,
    pub room: String,
    pub status: CallStatus,
    pub local_tracks: Vec<LocalTrack>,
    pub remote_tracks: Vec<RemoteTrack>,
    /// Append-only
    pub errors: Vec<String>,
}

type Callback = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    subscribers: HashMap<SessionField, Vec<(u64, Callback)>>,
}

/// Subscriber registry for one session.
#[derive(Default)]
pub struct EventHub {
    registry: Arc<Mutex<Registry>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for one field. It stays registered until the
    /// returned [`Subscription`] is dropped or unsubscribed.
    pub fn subscribe(
        &self,
        field: SessionField,
        callback: impl Fn(&SessionEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let mut registry = self.registry.lock();
        registry.next_id += 1;
        let id = registry.next_id;
        registry
            .subscribers
            .entry(field)
            .or_default()
            .push((id, Arc::new(callback)));

        Subscription {
            id,
            field,
            registry: Some(Arc::downgrade(&self.registry)),
        }
    }

    /// Call every subscriber of the event's field.
    pub fn publish(&self, event: SessionEvent) {
        // Snapshot under the lock so callbacks may subscribe or unsubscribe.
        let callbacks: Vec<Callback> = {
            let registry = self.registry.lock();
            match registry.subscribers.get(&event.field()) {
                Some(list) => list.iter().map(|(_, cb)| cb.clone()).collect(),
                None => return,
            }
        };

        trace!("Publishing {:?} to {} subscribers", event.field(), callbacks.len());
        for callback in callbacks {
            callback(&event);
        }
    }

    pub fn subscriber_count(&self, field: SessionField) -> usize {
        self.registry
            .lock()
            .subscribers
            .get(&field)
            .map_or(0, |list| list.len())
    }
}

/// Keeps a callback registered. Dropping it unregisters the callback.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    field: SessionField,
    registry: Option<Weak<Mutex<Registry>>>,
}

impl Subscription {
    pub fn field(&self) -> SessionField {
        self.field
    }

    pub fn unsubscribe(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        let Some(registry) = self.registry.take().and_then(|weak| weak.upgrade()) else {
            return;
        };
        let mut registry = registry.lock();
        if let Some(list) = registry.subscribers.get_mut(&self.field) {
            list.retain(|(id, _)| *id != self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.remove();
    }
}
