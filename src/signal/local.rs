//! In-process transports for same-host sessions and tests

use async_trait::async_trait;
use signal_store::{NewSignal, SignalStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use super::types::{Incoming, Route, SignalKind, TransportError};
use super::{SignalTransport, TransportFactory};

/// Talks to a [`SignalStore`] in the same process, skipping HTTP.
pub struct StoreTransport {
    store: Arc<SignalStore>,
    route: Route,
    poll_timeout: Duration,
}

impl StoreTransport {
    pub fn new(store: Arc<SignalStore>, route: Route, poll_timeout: Duration) -> Self {
        Self {
            store,
            route,
            poll_timeout,
        }
    }
}

#[async_trait]
impl SignalTransport for StoreTransport {
    fn route(&self) -> &Route {
        &self.route
    }

    async fn send(&self, kind: SignalKind, data: &str) -> Result<(), TransportError> {
        self.store.post(NewSignal::new(
            &self.route.from,
            &self.route.to,
            kind.as_str(),
            data,
        ))?;
        Ok(())
    }

    async fn poll(&self) -> Result<Option<Incoming>, TransportError> {
        match self
            .store
            .poll(&self.route.to, &self.route.from, self.poll_timeout)
            .await
        {
            Some(signal) => Incoming::try_from(signal).map(Some),
            None => Ok(None),
        }
    }
}

#[derive(Clone)]
pub struct StoreSignaling {
    store: Arc<SignalStore>,
    poll_timeout: Duration,
}

impl StoreSignaling {
    pub fn new(store: Arc<SignalStore>, poll_timeout: Duration) -> Self {
        Self { store, poll_timeout }
    }
}

impl TransportFactory for StoreSignaling {
    fn connect(&self, route: Route) -> Arc<dyn SignalTransport> {
        Arc::new(StoreTransport::new(self.store.clone(), route, self.poll_timeout))
    }
}

#[derive(Debug, Clone)]
struct Broadcast {
    from: String,
    to: String,
    kind: SignalKind,
    data: String,
}

/// Fan-out channel shared by every participant in the process. Nothing is
/// stored: a signal reaches only the transports connected when it was sent.
#[derive(Clone)]
pub struct BroadcastHub {
    tx: broadcast::Sender<Broadcast>,
    poll_timeout: Duration,
}

impl BroadcastHub {
    pub fn new(poll_timeout: Duration) -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx, poll_timeout }
    }
}

impl TransportFactory for BroadcastHub {
    fn connect(&self, route: Route) -> Arc<dyn SignalTransport> {
        Arc::new(BroadcastTransport {
            tx: self.tx.clone(),
            rx: Mutex::new(self.tx.subscribe()),
            route,
            poll_timeout: self.poll_timeout,
        })
    }
}

pub struct BroadcastTransport {
    tx: broadcast::Sender<Broadcast>,
    rx: Mutex<broadcast::Receiver<Broadcast>>,
    route: Route,
    poll_timeout: Duration,
}

#[async_trait]
impl SignalTransport for BroadcastTransport {
    fn route(&self) -> &Route {
        &self.route
    }

    async fn send(&self, kind: SignalKind, data: &str) -> Result<(), TransportError> {
        let message = Broadcast {
            from: self.route.from.clone(),
            to: self.route.to.clone(),
            kind,
            data: data.to_string(),
        };
        // Our own receiver keeps the channel open, so this only fails once
        // every transport is gone.
        self.tx.send(message).map_err(|_| TransportError::Closed)?;
        Ok(())
    }

    async fn poll(&self) -> Result<Option<Incoming>, TransportError> {
        let deadline = tokio::time::Instant::now() + self.poll_timeout;
        let mut rx = self.rx.lock().await;

        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Err(_) => return Ok(None),
                Ok(Ok(message)) => {
                    if message.to == self.route.to && message.from != self.route.from {
                        return Ok(Some(Incoming {
                            from: message.from,
                            kind: message.kind,
                            data: message.data,
                        }));
                    }
                }
                Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    warn!("{} missed {} broadcast signals", self.route.from, skipped);
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    debug!("Broadcast hub closed");
                    return Err(TransportError::Closed);
                }
            }
        }
    }
}
