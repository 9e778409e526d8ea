use axum::{
    extract::{Query, State},
    http::{header, HeaderName, StatusCode},
    response::{IntoResponse, Json, Response},
};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;
use signal_store::{NewSignal, StoreError};
use tracing::{debug, error};

use super::RelayState;

const ALLOW_METHODS: &str = "GET, POST, OPTIONS";

fn cors() -> [(HeaderName, &'static str); 3] {
    [
        (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        (header::ACCESS_CONTROL_ALLOW_METHODS, ALLOW_METHODS),
        (header::ACCESS_CONTROL_ALLOW_HEADERS, "Content-Type, *"),
    ]
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, cors(), Json(json!({ "error": message.into() }))).into_response()
}

#[derive(Debug, Deserialize)]
pub struct PollParams {
    #[serde(default)]
    to: String,
    #[serde(default)]
    from: String,
}

/// GET ?to=<room>&from=<identity> - claim one signal, waiting up to the
/// poll timeout. Responds `{}` when nothing arrived.
pub async fn poll_signal(
    State(state): State<RelayState>,
    Query(params): Query<PollParams>,
) -> Response {
    if params.to.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "missing 'to'");
    }

    match state.store.poll(&params.to, &params.from, state.poll_timeout).await {
        Some(signal) => (cors(), Json(json!(signal))).into_response(),
        None => (cors(), Json(json!({}))).into_response(),
    }
}

/// POST {from, to, type, data} - store one signal.
pub async fn post_signal(State(state): State<RelayState>, body: Bytes) -> Response {
    // Clients do not always send a JSON content type, so parse the raw body.
    let signal: NewSignal = match serde_json::from_slice(&body) {
        Ok(signal) => signal,
        Err(e) => {
            debug!("Rejected signal body: {}", e);
            return error_response(StatusCode::BAD_REQUEST, format!("invalid signal: {}", e));
        }
    };

    match state.store.post(signal) {
        Ok(_) => (cors(), Json(json!({ "ok": "ok" }))).into_response(),
        Err(e @ StoreError::Invalid(_)) => error_response(StatusCode::BAD_REQUEST, e.to_string()),
        Err(e) => {
            error!("Failed to store signal: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

pub async fn cors_preflight() -> impl IntoResponse {
    (
        StatusCode::NO_CONTENT,
        cors(),
        [(header::ACCESS_CONTROL_MAX_AGE, "86400")],
    )
}

pub async fn health() -> impl IntoResponse {
    (cors(), Json(json!({ "status": "ok" })))
}

pub async fn relay_stats(State(state): State<RelayState>) -> Response {
    match state.store.stats() {
        Ok(stats) => (
            cors(),
            Json(json!({
                "pending": stats.pending,
                "oldest_created_at": stats.oldest_created_at,
                "ttl_secs": state.store.ttl().as_secs(),
            })),
        )
            .into_response(),
        Err(e) => {
            error!("Failed to read relay stats: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}
