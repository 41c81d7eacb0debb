//! HTTP API handlers.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};

use crate::feed::ConnectionState;
use crate::orderbook::BookSnapshot;
use crate::service::{BookQuery, SessionStatus};

/// Application state shared with handlers.
#[derive(Clone)]
pub struct AppState {
    /// Book and session reads.
    pub query: Arc<dyn BookQuery>,
    /// Prometheus render handle, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    /// Create new app state.
    pub fn new(query: Arc<dyn BookQuery>) -> Self {
        Self {
            query,
            metrics: None,
        }
    }

    /// Serve `/metrics` from `handle`.
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Check if every tracked session is streaming.
    pub fn is_ready(&self) -> bool {
        let sessions = self.query.sessions();
        !sessions.is_empty()
            && sessions
                .iter()
                .all(|s| s.state == ConnectionState::Subscribed)
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("metrics", &self.metrics.is_some())
            .finish_non_exhaustive()
    }
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Status: "ok".
    pub status: &'static str,
}

/// Readiness check response.
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    /// Whether every session is subscribed.
    pub ready: bool,
    /// Per-symbol states.
    pub sessions: Vec<SessionState>,
}

/// Symbol and its state.
#[derive(Debug, Serialize)]
pub struct SessionState {
    /// Instrument symbol.
    pub symbol: String,
    /// Session state.
    pub state: ConnectionState,
}

/// Status response.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    /// Service status.
    pub status: &'static str,
    /// Every tracked session.
    pub sessions: Vec<SessionStatus>,
}

/// Error body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// What went wrong.
    pub error: String,
}

/// Book query parameters.
#[derive(Debug, Default, Deserialize)]
pub struct BookParams {
    /// Levels per side.
    pub depth: Option<usize>,
}

fn not_tracked(symbol: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: format!("symbol {symbol} is not tracked"),
        }),
    )
}

/// Health check handler - always returns 200.
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}

/// Readiness check handler - returns 200 if every session is subscribed, 503 otherwise.
pub async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    let is_ready = state.is_ready();
    let sessions = state
        .query
        .sessions()
        .into_iter()
        .map(|s| SessionState {
            symbol: s.symbol,
            state: s.state,
        })
        .collect();

    let response = ReadyResponse {
        ready: is_ready,
        sessions,
    };

    if is_ready {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

/// Status handler - returns every session with its counters.
pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let status = if state.is_ready() { "running" } else { "starting" };
    Json(StatusResponse {
        status,
        sessions: state.query.sessions(),
    })
}

/// Book handler - aggregated book for one symbol.
pub async fn book(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
    Query(params): Query<BookParams>,
) -> Result<Json<BookSnapshot>, (StatusCode, Json<ErrorResponse>)> {
    state
        .query
        .book(&symbol, params.depth)
        .map(Json)
        .ok_or_else(|| not_tracked(&symbol))
}

/// Session handler - state and counters for one symbol.
pub async fn session(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
) -> Result<Json<SessionStatus>, (StatusCode, Json<ErrorResponse>)> {
    state
        .query
        .session(&symbol)
        .map(Json)
        .ok_or_else(|| not_tracked(&symbol))
}

/// Metrics handler - Prometheus text exposition.
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            "metrics recorder not installed".to_string(),
        ),
    }
}
