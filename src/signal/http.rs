//! HTTP long-poll transport against a `duet relay`

use async_trait::async_trait;
use serde_json::Value;
use signal_store::{NewSignal, Signal};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::types::{Incoming, Route, SignalKind, TransportError};
use super::{SignalTransport, TransportFactory};

/// Extra time allowed on top of the relay's own poll window before a GET
/// is abandoned.
const POLL_GRACE: Duration = Duration::from_secs(10);

pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    route: Route,
    poll_timeout: Duration,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, url: impl Into<String>, route: Route, poll_timeout: Duration) -> Self {
        Self {
            client,
            url: url.into(),
            route,
            poll_timeout,
        }
    }
}

#[async_trait]
impl SignalTransport for HttpTransport {
    fn route(&self) -> &Route {
        &self.route
    }

    async fn send(&self, kind: SignalKind, data: &str) -> Result<(), TransportError> {
        let body = NewSignal::new(&self.route.from, &self.route.to, kind.as_str(), data);

        let response = self.client.post(&self.url).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(TransportError::Status(response.status().as_u16()));
        }

        debug!("Sent {} from {} to {}", kind, self.route.from, self.route.to);
        Ok(())
    }

    async fn poll(&self) -> Result<Option<Incoming>, TransportError> {
        let response = self
            .client
            .get(&self.url)
            .query(&[("to", self.route.to.as_str()), ("from", self.route.from.as_str())])
            .timeout(self.poll_timeout + POLL_GRACE)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(TransportError::Status(response.status().as_u16()));
        }

        let body: Value = response.json().await?;
        decode_poll_body(body)
    }
}

/// The relay answers `{}` when the poll window elapsed without a signal.
fn decode_poll_body(body: Value) -> Result<Option<Incoming>, TransportError> {
    match &body {
        Value::Object(map) if map.is_empty() => return Ok(None),
        Value::Object(_) => {}
        other => return Err(TransportError::Malformed(format!("expected object, got {}", other))),
    }

    let signal: Signal =
        serde_json::from_value(body).map_err(|e| TransportError::Malformed(e.to_string()))?;
    Incoming::try_from(signal).map(Some)
}

/// Hands out [`HttpTransport`]s sharing one connection pool.
#[derive(Clone)]
pub struct HttpSignaling {
    client: reqwest::Client,
    url: String,
    poll_timeout: Duration,
}

impl HttpSignaling {
    pub fn new(url: impl Into<String>, poll_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            poll_timeout,
        }
    }
}

impl TransportFactory for HttpSignaling {
    fn connect(&self, route: Route) -> Arc<dyn SignalTransport> {
        Arc::new(HttpTransport::new(
            self.client.clone(),
            self.url.clone(),
            route,
            self.poll_timeout,
        ))
    }
}
