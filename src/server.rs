//! HTTP surface: health probes and a chat endpoint

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::agents::memory::SharedSession;
use crate::app::{App, RunOptions};

/// Chat sessions held at once before the least recently used is dropped
pub const MAX_SESSIONS: usize = 1024;
/// Chat sessions unused for this long are dropped
pub const SESSION_IDLE_TTL: Duration = Duration::from_secs(30 * 60);

pub struct ServerState {
    app: Arc<App>,
    sessions: Mutex<SessionTable>,
    start_time: Instant,
}

impl ServerState {
    pub fn new(app: Arc<App>) -> Self {
        Self {
            app,
            sessions: Mutex::new(SessionTable::new(MAX_SESSIONS, SESSION_IDLE_TTL)),
            start_time: Instant::now(),
        }
    }

    pub fn with_session_limits(mut self, max_sessions: usize, idle_ttl: Duration) -> Self {
        self.sessions = Mutex::new(SessionTable::new(max_sessions, idle_ttl));
        self
    }
}

struct SessionEntry {
    session: SharedSession,
    last_used: Instant,
    tick: u64,
}

/// Chat sessions by id, bounded in count and idle time
struct SessionTable {
    entries: HashMap<String, SessionEntry>,
    tick: u64,
    max: usize,
    idle_ttl: Duration,
}

impl SessionTable {
    fn new(max: usize, idle_ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            tick: 0,
            max,
            idle_ttl,
        }
    }

    fn get(&mut self, id: &str) -> Option<SharedSession> {
        let expired = self.entries.get(id)?.last_used.elapsed() > self.idle_ttl;
        if expired {
            debug!(session_id = %id, "Chat session expired");
            self.entries.remove(id);
            return None;
        }

        self.tick += 1;
        let entry = self.entries.get_mut(id)?;
        entry.last_used = Instant::now();
        entry.tick = self.tick;
        Some(entry.session.clone())
    }

    fn insert(&mut self, session: SharedSession) {
        let idle_ttl = self.idle_ttl;
        self.entries.retain(|_, entry| entry.last_used.elapsed() <= idle_ttl);
        while !self.entries.is_empty() && self.entries.len() >= self.max {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.tick)
                .map(|(id, _)| id.clone());
            let Some(oldest) = oldest else { break };
            debug!(session_id = %oldest, "Evicting least recently used chat session");
            self.entries.remove(&oldest);
        }

        self.tick += 1;
        self.entries.insert(
            session.id().to_string(),
            SessionEntry {
                session,
                last_used: Instant::now(),
                tick: self.tick,
            },
        );
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    pub session_id: String,
    pub reply: String,
}

/// Error body for the API routes
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/live", get(live))
        .route("/health/ready", get(ready))
        .route("/api/chat", post(chat))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

/// Serve on `server.addr` until `shutdown` resolves
pub async fn serve(app: Arc<App>, shutdown: impl Future<Output = ()> + Send + 'static) -> std::io::Result<()> {
    let addr = app.settings().server.addr.clone();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %listener.local_addr()?, "Listening");

    let state = Arc::new(ServerState::new(app));
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn health(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let status = HealthStatus {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    };
    (StatusCode::OK, Json(status))
}

async fn live() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "alive" })))
}

/// Ready when every service passes its health check
async fn ready(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let mut services = BTreeMap::new();
    let mut all_ok = true;
    for (name, result) in state.app.health().await {
        let entry = match result {
            Ok(()) => "ok".to_string(),
            Err(e) => {
                all_ok = false;
                e.to_string()
            }
        };
        services.insert(name, entry);
    }

    if all_ok {
        (StatusCode::OK, Json(json!({ "status": "ready", "services": services })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "not_ready", "services": services })),
        )
    }
}

async fn chat(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    if request.message.trim().is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "message must not be empty"));
    }

    let session = match &request.session_id {
        Some(id) => state
            .sessions
            .lock()
            .get(id)
            .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("unknown session: {}", id)))?,
        None => {
            let session = state.app.new_session();
            state.sessions.lock().insert(session.clone());
            session
        }
    };

    let reply = state
        .app
        .run(&session, &request.message, RunOptions::default())
        .await
        .map_err(|e| {
            warn!(session_id = %session.id(), error = %e, "Chat turn failed");
            ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })?;

    Ok(Json(ChatResponse {
        session_id: session.id().to_string(),
        reply: reply.content,
    }))
}
