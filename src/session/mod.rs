//! Public face of one participant in a room
//!
//! [`Session::join`] wires a relay transport and a host session to a
//! negotiator task and hands back a handle for chat, tracks and
//! change notifications. Dropping the handle leaves the room.

mod events;

use anyhow::{bail, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info};

pub use events::{EventHub, SessionEvent, SessionField, SessionSnapshot, Subscription};

use crate::config::ClientConfig;
use crate::signal::{self, Route, TransportFactory};
use crate::webrtc::{Command, HostEventSink, HostFactory, Input, MediaStream, Negotiator};

/// Timing knobs for a session.
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    /// How long to wait for the other participant before announcing
    /// `ready` again.
    pub ready_retry: Duration,
    /// Pause after a failed poll before polling again.
    pub retry_delay: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            ready_retry: Duration::from_secs(4),
            retry_delay: Duration::from_millis(50),
        }
    }
}

impl From<&ClientConfig> for SessionOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            ready_retry: config.ready_retry(),
            retry_delay: config.retry_delay(),
        }
    }
}

pub struct Session {
    local_identity: String,
    room: String,
    inputs: mpsc::UnboundedSender<Input>,
    hub: Arc<EventHub>,
    snapshot: watch::Receiver<SessionSnapshot>,
    shutdown: watch::Sender<bool>,
}

impl Session {
    /// Join `room` as `identity`: start listening on the relay, announce
    /// `ready` and negotiate with whoever else is in the room.
    pub async fn join(
        identity: &str,
        room: &str,
        signaling: &dyn TransportFactory,
        hosts: &dyn HostFactory,
        options: SessionOptions,
    ) -> Result<Self> {
        let identity = identity.trim();
        let room = room.trim();
        if identity.is_empty() {
            bail!("identity must not be empty");
        }
        if room.is_empty() {
            bail!("room must not be empty");
        }

        let (inputs, input_rx) = mpsc::unbounded_channel();

        let host_inputs = inputs.clone();
        let host = hosts
            .create(HostEventSink::new(move |event| {
                let _ = host_inputs.send(Input::Host(event));
            }))
            .await
            .context("Failed to create host session")?;

        let transport = signaling.connect(Route::new(identity, room));

        let view = SessionSnapshot {
            local_identity: identity.to_string(),
            room: room.to_string(),
            ..Default::default()
        };
        let (snapshot_tx, snapshot) = watch::channel(view.clone());
        let hub = Arc::new(EventHub::new());

        let negotiator = Negotiator::new(
            view,
            host,
            transport.clone(),
            hub.clone(),
            snapshot_tx,
            options.ready_retry,
        );
        tokio::spawn(negotiator.run(input_rx));

        let (shutdown, shutdown_rx) = watch::channel(false);
        let signal_inputs = inputs.clone();
        tokio::spawn(signal::listen(transport, options.retry_delay, shutdown_rx, move |incoming| {
            let _ = signal_inputs.send(Input::Signal(incoming));
        }));

        info!("{} joined room {}", identity, room);
        Ok(Self {
            local_identity: identity.to_string(),
            room: room.to_string(),
            inputs,
            hub,
            snapshot,
            shutdown,
        })
    }

    pub fn local_identity(&self) -> &str {
        &self.local_identity
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    /// Send a chat message over the call's data channel. Returns false if
    /// the session has already stopped.
    pub fn send_chat(&self, text: impl Into<String>) -> bool {
        self.command(Command::SendChat(text.into()))
    }

    /// Start sending every track of `stream`.
    pub fn add_track(&self, stream: MediaStream) -> bool {
        self.command(Command::AddTrack(stream))
    }

    /// Stop sending one local track.
    pub fn close_track(&self, track_id: impl Into<String>) -> bool {
        self.command(Command::CloseTrack(track_id.into()))
    }

    /// Call `callback` whenever `field` changes. The callback runs on the
    /// negotiator task and must not block.
    pub fn subscribe(
        &self,
        field: SessionField,
        callback: impl Fn(&SessionEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.hub.subscribe(field, callback)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// A receiver that observes every change of the session's view.
    pub fn changes(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    /// Hang up, close the host session and stop polling the relay.
    pub async fn leave(self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.inputs.send(Input::Command(Command::Leave(Some(done_tx)))).is_ok() {
            let _ = done_rx.await;
        }
        let _ = self.shutdown.send(true);
        debug!("{} left room {}", self.local_identity, self.room);
    }

    fn command(&self, command: Command) -> bool {
        self.inputs.send(Input::Command(command)).is_ok()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.inputs.send(Input::Command(Command::Leave(None)));
        let _ = self.shutdown.send(true);
    }
}
