//! HTTP Server
//!
//! Health, metrics, and the consumer-facing streaming surface of the relay.
//!
//! # Endpoints
//!
//! - `GET /health` - JSON health status with session statistics
//! - `GET /healthz` - Liveness probe (simple OK)
//! - `GET /readyz` - Readiness probe (503 once the engine is shutting down)
//! - `GET /metrics` - Prometheus metrics in text format
//! - `GET /sessions` - Open sessions with their phase and listener count
//! - `GET /prices/{scope}/{symbol}` - Last delivered value for a key
//! - `GET /stream/{scope}/{symbol}` - Server-sent `price` events for a key
//!
//! A stream subscribes one [`ChannelListener`] on connect. The current value
//! arrives first, then every change. Dropping the connection unsubscribes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::application::ports::Listener;
use crate::application::services::{EngineError, StreamEngine};
use crate::domain::key::SymbolKey;
use crate::domain::price::PriceUpdate;
use crate::domain::session::SessionPhase;
use crate::domain::subscription::ListenerId;
use crate::infrastructure::listener::ChannelListener;
use crate::infrastructure::metrics::get_metrics_handle;

/// Interval between SSE keep-alive comments.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

// =============================================================================
// Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status.
    pub status: HealthStatus,
    /// Relay version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Keys with an open session.
    pub open_sessions: usize,
    /// Listener registrations across all keys.
    pub listeners: usize,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Accepting subscriptions.
    Healthy,
    /// Shutdown in progress; new subscriptions are rejected.
    Stopping,
}

/// One entry of `GET /sessions`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    /// Canonical key.
    pub key: String,
    /// Lifecycle phase.
    pub phase: SessionPhase,
    /// Registered listeners.
    pub listeners: usize,
    /// Last delivered value.
    pub value: Option<String>,
}

/// Payload of a `price` event and of `GET /prices/...`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PricePayload {
    /// Canonical key, `SCOPE:SYMBOL`.
    pub key: String,
    /// Normalized scope.
    pub scope: String,
    /// Normalized symbol.
    pub symbol: String,
    /// The reading as text.
    pub value: String,
    /// When the reading was accepted, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_at: Option<DateTime<Utc>>,
}

impl From<&PriceUpdate> for PricePayload {
    fn from(update: &PriceUpdate) -> Self {
        Self {
            key: update.key.to_string(),
            scope: update.key.scope().to_string(),
            symbol: update.key.symbol().to_string(),
            value: update.value.to_string(),
            observed_at: Some(update.observed_at),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Engine errors mapped onto HTTP statuses.
struct ApiError(EngineError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::InvalidKey(_) => StatusCode::BAD_REQUEST,
            EngineError::InvalidSymbol { .. } => StatusCode::NOT_FOUND,
            EngineError::ShutDown => StatusCode::SERVICE_UNAVAILABLE,
        };
        (
            status,
            Json(ErrorBody {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

// =============================================================================
// Server State
// =============================================================================

/// Shared state for the HTTP server.
pub struct HttpState {
    version: String,
    started_at: Instant,
    engine: Arc<StreamEngine>,
    listener_buffer: usize,
}

impl HttpState {
    /// Create new server state.
    #[must_use]
    pub fn new(version: String, engine: Arc<StreamEngine>, listener_buffer: usize) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            engine,
            listener_buffer,
        }
    }
}

/// Build the relay's router.
#[must_use]
pub fn router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .route("/sessions", get(sessions_handler))
        .route("/prices/{scope}/{symbol}", get(price_handler))
        .route("/stream/{scope}/{symbol}", get(stream_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Server
// =============================================================================

/// Relay HTTP server.
pub struct HttpServer {
    port: u16,
    state: Arc<HttpState>,
    cancel: CancellationToken,
}

impl HttpServer {
    /// Create a new server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HttpState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HttpServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HttpServerError> {
        let app = router(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HttpServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "HTTP server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HttpServerError::ServerFailed(e.to_string()))?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Stopping => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    if state.engine.is_shut_down() {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    } else {
        (StatusCode::OK, "READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                handle.render(),
            )
        },
    )
}

async fn sessions_handler(State(state): State<Arc<HttpState>>) -> Json<Vec<SessionInfo>> {
    let engine = &state.engine;
    let sessions = engine
        .active_keys()
        .into_iter()
        .map(|key| SessionInfo {
            phase: engine.phase(&key),
            listeners: engine.listener_count(&key),
            value: engine.current_value_key(&key).map(|v| v.to_string()),
            key: key.to_string(),
        })
        .collect();
    Json(sessions)
}

async fn price_handler(
    State(state): State<Arc<HttpState>>,
    Path((scope, symbol)): Path<(String, String)>,
) -> Result<Json<PricePayload>, Response> {
    let key = SymbolKey::normalize(&scope, &symbol)
        .map_err(|e| ApiError(EngineError::from(e)).into_response())?;

    let value = state.engine.current_value_key(&key).ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                error: format!("no open session for {key}"),
            }),
        )
            .into_response()
    })?;

    Ok(Json(PricePayload {
        key: key.to_string(),
        scope: key.scope().to_string(),
        symbol: key.symbol().to_string(),
        value: value.to_string(),
        observed_at: None,
    }))
}

async fn stream_handler(
    State(state): State<Arc<HttpState>>,
    Path((scope, symbol)): Path<(String, String)>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let key = SymbolKey::normalize(&scope, &symbol).map_err(EngineError::from)?;
    let (listener, rx) = ChannelListener::new(state.listener_buffer);
    let id = listener.id();

    // Armed before subscribing: a client that disconnects while the session
    // is still opening leaves a registered listener behind.
    let guard = SubscriptionGuard {
        engine: Arc::clone(&state.engine),
        key: key.clone(),
        id,
    };

    state
        .engine
        .subscribe_key(&key, Arc::new(listener))
        .await?;
    tracing::info!(key = %key, listener = %id, "Stream client subscribed");

    let events = ReceiverStream::new(rx).map(move |update| {
        let _subscription = &guard;
        Event::default()
            .event("price")
            .json_data(PricePayload::from(&update))
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL)))
}

fn build_health_response(state: &HttpState) -> HealthResponse {
    let stats = state.engine.stats();
    let status = if state.engine.is_shut_down() {
        HealthStatus::Stopping
    } else {
        HealthStatus::Healthy
    };

    HealthResponse {
        status,
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        open_sessions: stats.open_sessions,
        listeners: stats.listeners,
    }
}

// =============================================================================
// Subscription Guard
// =============================================================================

/// Unsubscribes a stream's listener when the stream is dropped.
struct SubscriptionGuard {
    engine: Arc<StreamEngine>,
    key: SymbolKey,
    id: ListenerId,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let engine = Arc::clone(&self.engine);
        let key = self.key.clone();
        let id = self.id;
        handle.spawn(async move {
            engine.unsubscribe_key(&key, id).await;
            tracing::debug!(key = %key, listener = %id, "Stream client released");
        });
    }
}

// =============================================================================
// Errors
// =============================================================================

/// HTTP server errors.
#[derive(Debug, thiserror::Error)]
pub enum HttpServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================
