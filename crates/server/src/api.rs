//! Control-plane HTTP routes.
//!
//! Thin JSON wrappers over [`Handoff`](crate::handoff::Handoff); every
//! failure becomes `{"error": code, "message": text}` with a status that
//! tells bad input, missing, conflict and dependency failures apart.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use relaydesk_protocol::{
    AgentStatus, Assignee, ChatMessage, Session, SessionMode, SessionStatus, UserInfo,
};

use crate::error::HandoffError;
use crate::handoff::{HandoffOutcome, SessionSummary};
use crate::state::AppState;
use crate::transition::StartStatus;
use crate::websocket::ws_handler;

type ApiResult<T> = Result<Json<T>, HandoffError>;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/session/start", post(start_session))
        .route("/api/session/end", post(end_session))
        .route("/api/session/transfer", post(transfer_session))
        .route("/api/session/info", get(session_info))
        .route("/api/session/messages", get(session_messages))
        .route("/api/session/user/active", get(user_active_session))
        .route("/api/session/user/{user_id}", get(user_sessions))
        .route("/api/agent/takeover", post(takeover))
        .route("/api/agent/assign-session", post(assign_session))
        .route("/api/agent/status", post(agent_status))
        .route("/api/agent/active-sessions/{agent_id}", get(agent_active_sessions))
        .route("/api/session/agent/{agent_id}", get(agent_sessions))
        .route("/api/sessions/ai", get(system_sessions))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

impl IntoResponse for HandoffError {
    fn into_response(self) -> Response {
        let status = match &self {
            HandoffError::InvalidIdentity { .. } => StatusCode::BAD_REQUEST,
            HandoffError::NotFound(_) => StatusCode::NOT_FOUND,
            HandoffError::AgentUnavailable(_) | HandoffError::Contended(_) => StatusCode::CONFLICT,
            HandoffError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            HandoffError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
        };
        if status.is_server_error() {
            warn!(
                component = "api",
                event = "api.request.failed",
                code = self.code(),
                error = %self,
                "Control-plane request failed"
            );
        }
        let body = serde_json::json!({
            "error": self.code(),
            "message": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub user_id: String,
    #[serde(default)]
    pub agent_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    pub session_id: String,
    pub assigned_agent: Assignee,
    pub mode: SessionMode,
    pub status: StartStatus,
}

async fn start_session(
    State(state): State<Arc<AppState>>,
    Json(body): Json<StartRequest>,
) -> ApiResult<StartResponse> {
    let agent_id = body.agent_id.as_deref().filter(|id| !id.is_empty());
    let outcome = state.handoff.start(&body.user_id, agent_id).await?;
    Ok(Json(StartResponse {
        session_id: outcome.session.id,
        assigned_agent: outcome.session.assigned_agent,
        mode: outcome.session.mode,
        status: outcome.start_status,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRequest {
    pub session_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndResponse {
    pub message: &'static str,
    pub session_id: String,
    pub status: SessionStatus,
}

async fn end_session(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SessionRequest>,
) -> ApiResult<EndResponse> {
    let session = state.handoff.end(&body.session_id).await?;
    Ok(Json(EndResponse {
        message: "Session ended",
        session_id: session.id,
        status: session.status,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRequest {
    pub agent_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandoffResponse {
    pub message: &'static str,
    pub session_id: String,
    pub agent_id: String,
    pub success: bool,
    pub session: Session,
    pub messages: Vec<ChatMessage>,
    pub user_info: Option<UserInfo>,
}

impl HandoffResponse {
    fn new(message: &'static str, agent_id: String, outcome: HandoffOutcome) -> Self {
        Self {
            message,
            session_id: outcome.session.id.clone(),
            agent_id,
            success: true,
            session: outcome.session,
            messages: outcome.messages,
            user_info: outcome.user_info,
        }
    }
}

async fn transfer_session(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ClaimRequest>,
) -> ApiResult<HandoffResponse> {
    let session_id = required_session(body.session_id)?;
    let outcome = state.handoff.transfer(&session_id, &body.agent_id).await?;
    Ok(Json(HandoffResponse::new(
        "Session transferred to agent",
        body.agent_id,
        outcome,
    )))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionQuery {
    pub session_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfoResponse {
    pub mode: SessionMode,
    pub status: SessionStatus,
    pub assigned_agent: Assignee,
}

async fn session_info(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionQuery>,
) -> ApiResult<SessionInfoResponse> {
    let session = state.handoff.session_info(&query.session_id).await?;
    Ok(Json(SessionInfoResponse {
        mode: session.mode,
        status: session.status,
        assigned_agent: session.assigned_agent,
    }))
}

#[derive(Debug, Serialize)]
pub struct MessagesResponse {
    pub messages: Vec<ChatMessage>,
}

async fn session_messages(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionQuery>,
) -> ApiResult<MessagesResponse> {
    let messages = state.handoff.messages(&query.session_id).await?;
    Ok(Json(MessagesResponse { messages }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserQuery {
    pub user_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSessionResponse {
    pub has_active_session: bool,
    pub session: Option<Session>,
}

async fn user_active_session(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UserQuery>,
) -> ApiResult<ActiveSessionResponse> {
    let session = state.handoff.user_active_session(&query.user_id).await?;
    Ok(Json(ActiveSessionResponse {
        has_active_session: session.is_some(),
        session,
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct StatusQuery {
    pub status: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SessionsResponse<T> {
    pub sessions: Vec<T>,
}

async fn user_sessions(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Query(query): Query<StatusQuery>,
) -> ApiResult<SessionsResponse<SessionSummary>> {
    let status = match query.status.as_deref().filter(|s| !s.is_empty()) {
        None => None,
        Some(raw) => Some(SessionStatus::parse(raw).ok_or_else(|| {
            HandoffError::InvalidIdentity {
                kind: "status",
                value: raw.to_string(),
            }
        })?),
    };
    let sessions = state.handoff.user_sessions(&user_id, status).await?;
    Ok(Json(SessionsResponse { sessions }))
}

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

async fn takeover(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ClaimRequest>,
) -> ApiResult<HandoffResponse> {
    let session_id = body.session_id.as_deref().filter(|id| !id.is_empty());
    let outcome = state.handoff.takeover(&body.agent_id, session_id).await?;
    Ok(Json(HandoffResponse::new(
        "Successfully took over system session",
        body.agent_id,
        outcome,
    )))
}

async fn assign_session(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ClaimRequest>,
) -> ApiResult<HandoffResponse> {
    let session_id = required_session(body.session_id)?;
    let outcome = state.handoff.assign(&body.agent_id, &session_id).await?;
    Ok(Json(HandoffResponse::new(
        "Successfully assigned session to agent",
        body.agent_id,
        outcome,
    )))
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatusBody {
    pub agent_id: String,
    pub status: AgentStatus,
}

async fn agent_status(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AgentStatusBody>,
) -> ApiResult<AgentStatusBody> {
    state
        .handoff
        .set_agent_status(&body.agent_id, body.status)
        .await?;
    Ok(Json(body))
}

async fn agent_active_sessions(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
) -> ApiResult<SessionsResponse<Session>> {
    let sessions = state.handoff.active_sessions_for_agent(&agent_id).await?;
    Ok(Json(SessionsResponse { sessions }))
}

async fn agent_sessions(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
) -> ApiResult<SessionsResponse<Session>> {
    let sessions = state.handoff.agent_sessions(&agent_id).await?;
    Ok(Json(SessionsResponse { sessions }))
}

async fn system_sessions(State(state): State<Arc<AppState>>) -> ApiResult<SessionsResponse<Session>> {
    let sessions = state.handoff.system_sessions().await?;
    Ok(Json(SessionsResponse { sessions }))
}

async fn health_handler() -> impl IntoResponse {
    "OK"
}

fn required_session(session_id: Option<String>) -> Result<String, HandoffError> {
    session_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| HandoffError::InvalidIdentity {
            kind: "session",
            value: String::new(),
        })
}
