use std::convert::Infallible;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

use crate::memory::MemoryGateway;
use crate::persona::{seed_text, PersonaCompiler, PersonaProfile, PersonaSelection};
use crate::reconstruct::{MemorySource, MoodPoint, Reconstructor, UserProfile};
use crate::runtime::BackendRuntime;
use crate::transcript::Speaker;
use crate::turn::{TurnChunk, TurnError, TurnOrchestrator, TurnRequest, TurnResponse};

#[derive(Clone)]
pub struct ServerState {
    pub orchestrator: TurnOrchestrator,
    pub persona: Arc<PersonaCompiler>,
    pub reconstructor: Arc<Reconstructor>,
    pub memory: MemoryGateway,
    pub auth: BackendAuthConfig,
}

impl ServerState {
    pub fn from_runtime(runtime: &BackendRuntime, auth: BackendAuthConfig) -> Self {
        Self {
            orchestrator: runtime.orchestrator.clone(),
            persona: runtime.persona.clone(),
            reconstructor: runtime.reconstructor.clone(),
            memory: runtime.memory.clone(),
            auth,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackendAuthConfig {
    mode: AuthMode,
    token: Option<String>,
}

impl BackendAuthConfig {
    pub fn disabled() -> Self {
        Self {
            mode: AuthMode::Disabled,
            token: None,
        }
    }

    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            mode: AuthMode::Required,
            token: Some(token.into()),
        }
    }

    /// `CONFIDANT_BACKEND_AUTH_MODE` (default `required`) and `CONFIDANT_BACKEND_TOKEN`.
    pub fn from_env() -> Result<Self> {
        let mode = match std::env::var("CONFIDANT_BACKEND_AUTH_MODE") {
            Ok(raw) => raw.parse::<AuthMode>()?,
            Err(_) => AuthMode::Required,
        };
        let token = std::env::var("CONFIDANT_BACKEND_TOKEN")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        Self::with_mode(mode, token)
    }

    fn with_mode(mode: AuthMode, token: Option<String>) -> Result<Self> {
        match (mode, token) {
            (AuthMode::Required, None) => {
                bail!("CONFIDANT_BACKEND_TOKEN must be set unless CONFIDANT_BACKEND_AUTH_MODE=disabled")
            }
            (AuthMode::Required, Some(token)) => Ok(Self::bearer(token)),
            (AuthMode::Disabled, _) => {
                tracing::warn!("Backend auth is disabled; every /v1 route is open");
                Ok(Self::disabled())
            }
        }
    }

    /// Checks the request's bearer credential. The scheme is case-insensitive.
    fn admits(&self, headers: &HeaderMap) -> bool {
        let expected = match (self.mode, self.token.as_deref()) {
            (AuthMode::Disabled, _) => return true,
            (AuthMode::Required, None) => return false,
            (AuthMode::Required, Some(token)) => token,
        };
        headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().split_once(' '))
            .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("bearer"))
            .is_some_and(|(_, credential)| credential.trim() == expected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthMode {
    Required,
    Disabled,
}

impl FromStr for AuthMode {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "required" | "on" | "true" => Ok(Self::Required),
            "disabled" | "off" | "false" => Ok(Self::Disabled),
            other => bail!("Unknown backend auth mode '{}' (use 'required' or 'disabled')", other),
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PersonaResponse {
    pub selection: PersonaSelection,
    pub profile: PersonaProfile,
    /// True when generation failed and the fallback profile was returned.
    pub degraded: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SeedResponse {
    pub session_id: String,
    pub status: String,
}

#[derive(Debug, Deserialize)]
struct SourceQuery {
    #[serde(default)]
    source: MemorySource,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProactiveResponse {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TopicResponse {
    pub topic: String,
}

pub async fn serve_backend(runtime: BackendRuntime) -> Result<()> {
    let bind_addr = std::env::var("CONFIDANT_BACKEND_BIND")
        .unwrap_or_else(|_| "127.0.0.1:8787".to_string())
        .parse::<SocketAddr>()
        .context("Invalid CONFIDANT_BACKEND_BIND (expected host:port)")?;

    let auth = BackendAuthConfig::from_env()?;
    let state = Arc::new(ServerState::from_runtime(&runtime, auth));

    runtime.spawn_diagnostics_drain();
    runtime.provision_memory().await;

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind backend server to {}", bind_addr))?;
    tracing::info!("Confidant backend listening on http://{}", bind_addr);
    axum::serve(listener, app)
        .await
        .context("Backend server failed")?;
    Ok(())
}

pub fn router(state: Arc<ServerState>) -> Router {
    let protected = Router::new()
        .route("/health", get(health))
        .route("/persona", post(generate_persona))
        .route("/sessions/:id/seed", post(seed_session))
        .route("/chat", post(chat))
        .route("/chat/stream", post(chat_stream))
        .route("/sessions/:id/profile", get(get_profile))
        .route("/sessions/:id/proactive", get(get_proactive))
        .route("/sessions/:id/topic", get(get_topic))
        .route("/sessions/:id/mood-history", get(get_mood_history))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(state, auth_middleware));

    Router::new().nest("/v1", protected)
}

async fn auth_middleware(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Result<Response, StatusCode> {
    if !state.auth.admits(&headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(request).await)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn generate_persona(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<PersonaResponse>, (StatusCode, String)> {
    let started = Instant::now();
    let selection: PersonaSelection = serde_json::from_value(body)
        .map_err(|e| bad_request(format!("invalid persona selection: {e}")))?;
    let selection = selection
        .validate()
        .map_err(|e| bad_request(e.to_string()))?;

    let generated = state.persona.generate_profile(&selection).await;
    let degraded = generated.is_degraded();
    let response = PersonaResponse {
        selection,
        profile: generated.into_value(),
        degraded,
    };
    log_elapsed("generate_persona", "-", started);
    Ok(Json(response))
}

async fn seed_session(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
    Json(profile): Json<PersonaProfile>,
) -> Result<Json<SeedResponse>, (StatusCode, String)> {
    let session_id = require_session(session_id)?;
    let started = Instant::now();
    let stored = state
        .memory
        .write(&session_id, Speaker::Assistant, &seed_text(&profile), None)
        .await;
    log_elapsed("seed_session", &session_id, started);
    Ok(Json(SeedResponse {
        session_id,
        status: if stored { "seeded" } else { "skipped" }.to_string(),
    }))
}

async fn chat(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<TurnRequest>,
) -> Result<Json<TurnResponse>, (StatusCode, String)> {
    validate_turn(&request)?;
    let session_id = request.session_id.clone();
    let started = Instant::now();

    let result = state.orchestrator.run_turn(request).await;
    log_elapsed("chat", &session_id, started);
    result.map(Json).map_err(turn_error)
}

async fn chat_stream(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<TurnRequest>,
) -> Result<Response, (StatusCode, String)> {
    validate_turn(&request)?;
    tracing::info!("Streaming turn for session {}", request.session_id);

    let lines = state
        .orchestrator
        .stream_turn(request)
        .map(|item| Ok::<_, Infallible>(ndjson_line(item)));

    Ok((
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(lines),
    )
        .into_response())
}

fn ndjson_line(item: Result<TurnChunk, TurnError>) -> String {
    let mut line = match item {
        Ok(chunk) => serde_json::to_string(&chunk)
            .unwrap_or_else(|e| stream_error_line(&format!("failed to encode chunk: {e}"))),
        Err(e) => {
            tracing::error!("Streaming turn failed: {}", e);
            stream_error_line(&e.to_string())
        }
    };
    line.push('\n');
    line
}

fn stream_error_line(message: &str) -> String {
    serde_json::json!({
        "error": message,
        "status_code": StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
    })
    .to_string()
}

async fn get_profile(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
    Query(query): Query<SourceQuery>,
) -> Result<Json<UserProfile>, (StatusCode, String)> {
    let session_id = require_session(session_id)?;
    let started = Instant::now();
    let result = state.reconstructor.profile(&session_id, query.source).await;
    log_elapsed("profile", &session_id, started);
    result.map(Json).map_err(internal_error)
}

async fn get_proactive(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
    Query(query): Query<SourceQuery>,
) -> Result<Json<ProactiveResponse>, (StatusCode, String)> {
    let session_id = require_session(session_id)?;
    let started = Instant::now();
    let result = state
        .reconstructor
        .proactive_query(&session_id, query.source)
        .await;
    log_elapsed("proactive", &session_id, started);
    result
        .map(|message| Json(ProactiveResponse { message }))
        .map_err(internal_error)
}

async fn get_topic(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
) -> Result<Json<TopicResponse>, (StatusCode, String)> {
    let session_id = require_session(session_id)?;
    let started = Instant::now();
    let result = state.reconstructor.suggest_topic(&session_id).await;
    log_elapsed("topic", &session_id, started);
    result
        .map(|topic| Json(TopicResponse { topic }))
        .map_err(internal_error)
}

async fn get_mood_history(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
) -> Result<Json<Vec<MoodPoint>>, (StatusCode, String)> {
    let session_id = require_session(session_id)?;
    let started = Instant::now();
    let result = state.reconstructor.mood_timeline(&session_id).await;
    log_elapsed("mood_history", &session_id, started);
    result.map(Json).map_err(internal_error)
}

fn validate_turn(request: &TurnRequest) -> Result<(), (StatusCode, String)> {
    if request.session_id.trim().is_empty() {
        return Err(bad_request("session_id cannot be empty"));
    }
    if request.utterance.trim().is_empty() {
        return Err(bad_request("utterance cannot be empty"));
    }
    Ok(())
}

fn require_session(session_id: String) -> Result<String, (StatusCode, String)> {
    let trimmed = session_id.trim();
    if trimmed.is_empty() {
        return Err(bad_request("session id cannot be empty"));
    }
    Ok(trimmed.to_string())
}

fn log_elapsed(operation: &str, session_id: &str, started: Instant) {
    tracing::info!(
        "{} (session {}) completed in {:.2?}",
        operation,
        session_id,
        started.elapsed()
    );
}

fn bad_request(message: impl Into<String>) -> (StatusCode, String) {
    (StatusCode::BAD_REQUEST, message.into())
}

fn turn_error(error: TurnError) -> (StatusCode, String) {
    tracing::error!("Turn failed: {}", error);
    (StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
}

fn internal_error(error: anyhow::Error) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", error))
}
