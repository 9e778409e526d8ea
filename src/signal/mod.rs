//! Client side of the relay
//!
//! A [`SignalTransport`] posts signals for one fixed [`Route`] and retrieves
//! the ones addressed to it. Three transports share the trait:
//! - [`HttpTransport`]: the relay's HTTP long-poll protocol
//! - [`StoreTransport`]: an in-process [`signal_store::SignalStore`]
//! - [`BroadcastTransport`]: an in-process broadcast channel, no storage

mod http;
mod local;
mod types;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

pub use http::{HttpSignaling, HttpTransport};
pub use local::{BroadcastHub, BroadcastTransport, StoreSignaling, StoreTransport};
pub use types::{Incoming, Route, SignalKind, TransportError};

/// One participant's connection to the relay.
#[async_trait]
pub trait SignalTransport: Send + Sync {
    fn route(&self) -> &Route;

    /// Post a signal and return once the relay acknowledged it.
    async fn send(&self, kind: SignalKind, data: &str) -> Result<(), TransportError>;

    /// Wait up to the transport's poll window for one signal.
    /// `Ok(None)` means the window elapsed with nothing to deliver.
    async fn poll(&self) -> Result<Option<Incoming>, TransportError>;
}

/// Creates transports bound to a route, so a session can be joined
/// without knowing which relay backs it.
pub trait TransportFactory: Send + Sync {
    fn connect(&self, route: Route) -> Arc<dyn SignalTransport>;
}

/// Poll back-to-back until `shutdown` flips, handing every delivered signal
/// to `on_signal`. Failures are logged and retried after `retry_delay`.
pub async fn listen<F>(
    transport: Arc<dyn SignalTransport>,
    retry_delay: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut on_signal: F,
) where
    F: FnMut(Incoming) + Send,
{
    let route = transport.route().clone();
    debug!("Listening for {} in {}", route.from, route.to);

    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            result = transport.poll() => match result {
                Ok(Some(incoming)) => {
                    trace!("{} got {} from {}", route.from, incoming.kind, incoming.from);
                    on_signal(incoming);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Poll for {} in {} failed: {}", route.from, route.to, e);
                    tokio::time::sleep(retry_delay).await;
                }
            }
        }
    }

    debug!("Stopped listening for {} in {}", route.from, route.to);
}
