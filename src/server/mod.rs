mod handlers;

use anyhow::{Context, Result};
use axum::{
    routing::{get, MethodRouter},
    Router,
};
use signal_store::SignalStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;

#[derive(Clone)]
pub struct RelayState {
    pub store: Arc<SignalStore>,
    /// How long one GET waits for a signal before answering `{}`.
    pub poll_timeout: Duration,
}

/// HTTP front of a [`SignalStore`].
pub struct RelayServer {
    state: RelayState,
    addr: String,
}

impl RelayServer {
    pub fn new(store: Arc<SignalStore>, addr: String) -> Self {
        Self {
            state: RelayState {
                store,
                poll_timeout: Duration::from_secs(2),
            },
            addr,
        }
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.state.poll_timeout = timeout;
        self
    }

    pub fn router(&self) -> Router {
        // The relay protocol lives on both the root and the historic path.
        let relay = || -> MethodRouter<RelayState> {
            get(handlers::poll_signal)
                .post(handlers::post_signal)
                .options(handlers::cors_preflight)
        };

        Router::new()
            .route("/", relay())
            .route("/api/poll", relay())
            .route("/api/stats", get(handlers::relay_stats))
            .route("/health", get(handlers::health))
            .with_state(self.state.clone())
    }

    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(&self.addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.addr))?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!("Relay listening on http://{}", addr);
        }
        axum::serve(listener, self.router()).await?;
        Ok(())
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}
