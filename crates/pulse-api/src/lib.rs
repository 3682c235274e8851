//! Pulse API -- local HTTP control and status API.
//!
//! HTTP on 127.0.0.1:9480 by default. Bearer token auth from ~/.pulse/api-token.
//! Lets a UI observe the session (state, discovered viewers) and drive it
//! (enable, disable, connect), and query the local log store.

use axum::{
    extract::{Json, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
    Router,
};
use pulse_session::{PeerDescriptor, SessionSnapshot};
use pulse_store::{MessageQuery, SqliteStore, StoreStats, StoredMessage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

/// Commands the API forwards to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlRequest {
    Enable,
    Disable,
    Connect(PeerDescriptor),
}

/// Callback into the session loop. Returns `false` once the loop is gone.
pub type ControlFn = Box<dyn Fn(ControlRequest) -> bool + Send + Sync>;

/// Shared state for all API handlers.
pub struct AppState {
    pub snapshot: watch::Receiver<SessionSnapshot>,
    pub control: ControlFn,
    pub store: Option<Arc<SqliteStore>>,
    pub bearer_token: String,
    pub start_time: std::time::Instant,
}

/// Build the axum router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/status", post(status))
        .route("/api/v1/peers", post(peers))
        .route("/api/v1/enable", post(enable))
        .route("/api/v1/disable", post(disable))
        .route("/api/v1/connect", post(connect))
        .route("/api/v1/messages", post(messages))
        .route("/api/v1/stats", post(stats))
        .with_state(state)
}

// ============================================================================
// Auth middleware (inline check)
// ============================================================================

fn check_auth(state: &AppState, headers: &HeaderMap) -> Result<(), (StatusCode, &'static str)> {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let expected = format!("Bearer {}", state.bearer_token);
    if auth != expected {
        return Err((StatusCode::UNAUTHORIZED, "invalid bearer token"));
    }
    Ok(())
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    #[serde(flatten)]
    pub session: SessionSnapshot,
}

#[derive(Serialize, Deserialize)]
pub struct PeerEntry {
    pub name: String,
    pub endpoint: String,
    pub is_selected: bool,
    pub is_connected: bool,
}

#[derive(Serialize, Deserialize)]
pub struct PeersResponse {
    pub total: usize,
    pub peers: Vec<PeerEntry>,
}

#[derive(Deserialize)]
pub struct ConnectRequest {
    pub name: String,
}

#[derive(Serialize, Deserialize)]
pub struct ControlResponse {
    pub ok: bool,
}

#[derive(Serialize)]
pub struct MessagesResponse {
    pub messages: Vec<StoredMessage>,
}

// ============================================================================
// Handlers
// ============================================================================

async fn status(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }

    Json(StatusResponse {
        uptime_secs: state.start_time.elapsed().as_secs(),
        session: state.snapshot.borrow().clone(),
    })
    .into_response()
}

async fn peers(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }

    let snapshot = state.snapshot.borrow().clone();
    let peers: Vec<PeerEntry> = snapshot
        .discovered_peers
        .iter()
        .map(|peer| PeerEntry {
            name: peer.name.clone(),
            endpoint: peer.endpoint.to_string(),
            is_selected: snapshot.is_selected(peer),
            is_connected: snapshot.connected_peer.as_ref().map(|p| &p.name) == Some(&peer.name),
        })
        .collect();

    Json(PeersResponse {
        total: peers.len(),
        peers,
    })
    .into_response()
}

fn forward(state: &AppState, request: ControlRequest) -> axum::response::Response {
    let label = match &request {
        ControlRequest::Enable => "enable",
        ControlRequest::Disable => "disable",
        ControlRequest::Connect(_) => "connect",
    };
    if (state.control)(request) {
        tracing::info!(request = label, "api: session control");
        Json(ControlResponse { ok: true }).into_response()
    } else {
        tracing::warn!(request = label, "api: session loop is not running");
        (StatusCode::SERVICE_UNAVAILABLE, "session not running").into_response()
    }
}

async fn enable(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }
    forward(&state, ControlRequest::Enable)
}

async fn disable(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }
    forward(&state, ControlRequest::Disable)
}

async fn connect(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ConnectRequest>,
) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }

    let peer = state
        .snapshot
        .borrow()
        .discovered_peers
        .iter()
        .find(|p| p.name == req.name)
        .cloned();

    match peer {
        Some(peer) => forward(&state, ControlRequest::Connect(peer)),
        None => (StatusCode::NOT_FOUND, "no such viewer").into_response(),
    }
}

async fn messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(query): Json<MessageQuery>,
) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }

    let Some(store) = &state.store else {
        return (StatusCode::SERVICE_UNAVAILABLE, "no store").into_response();
    };

    match store.messages(&query) {
        Ok(messages) => Json(MessagesResponse { messages }).into_response(),
        Err(e) => {
            tracing::error!("api: message query failed: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, "storage error").into_response()
        }
    }
}

async fn stats(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }

    let stats = match &state.store {
        Some(store) => match store.stats() {
            Ok(stats) => stats,
            Err(e) => {
                tracing::error!("api: stats query failed: {e}");
                return (StatusCode::INTERNAL_SERVER_ERROR, "storage error").into_response();
            }
        },
        None => StoreStats::default(),
    };
    Json(stats).into_response()
}
