//! Public API handlers.

use axum::{
    Json,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};

use crate::agent::{Agent, DeployAgentRequest};
use crate::metrics::{PoolStats, render_prometheus};
use crate::runner::OkResponse;
use crate::session::{CreateSessionRequest, SendMessageRequest, Session};

use super::error::ApiResult;
use super::sse::sse_response;
use super::state::AppState;

/// Tenant used until multi-tenant auth lands in front of this surface.
const DEFAULT_TENANT: &str = "default";

/// `GET /health` - pool stats, unauthenticated.
pub async fn health(State(state): State<AppState>) -> ApiResult<Json<PoolStats>> {
    Ok(Json(state.pool.stats().await?))
}

/// `GET /metrics` - Prometheus exposition text.
pub async fn metrics(State(state): State<AppState>) -> ApiResult<Response> {
    let stats = state.pool.stats().await?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        render_prometheus(&stats),
    )
        .into_response())
}

/// `POST /api/agents` - deploy or redeploy an agent.
pub async fn deploy_agent(
    State(state): State<AppState>,
    Json(request): Json<DeployAgentRequest>,
) -> ApiResult<(StatusCode, Json<Agent>)> {
    let agent = state
        .agents
        .deploy(DEFAULT_TENANT, &request.name, &request.path)
        .await?;
    Ok((StatusCode::CREATED, Json(agent)))
}

/// `GET /api/agents`
pub async fn list_agents(State(state): State<AppState>) -> ApiResult<Json<Vec<Agent>>> {
    Ok(Json(state.agents.list(DEFAULT_TENANT).await?))
}

/// `DELETE /api/agents/{name}`
pub async fn delete_agent(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<OkResponse>> {
    state.agents.delete(DEFAULT_TENANT, &name).await?;
    Ok(Json(OkResponse::ok()))
}

/// `POST /api/sessions`
pub async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> ApiResult<(StatusCode, Json<Session>)> {
    let session = state.sessions.create(DEFAULT_TENANT, &request.agent).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

/// `GET /api/sessions`
pub async fn list_sessions(State(state): State<AppState>) -> ApiResult<Json<Vec<Session>>> {
    Ok(Json(state.sessions.list(DEFAULT_TENANT).await?))
}

/// `GET /api/sessions/{id}`
pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Session>> {
    Ok(Json(state.sessions.get(DEFAULT_TENANT, &id).await?))
}

/// `POST /api/sessions/{id}/messages` - run a turn, stream the reply.
pub async fn send_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<SendMessageRequest>,
) -> ApiResult<Response> {
    let events = state
        .sessions
        .send_message(DEFAULT_TENANT, &id, &request.content)
        .await?;
    Ok(sse_response(events).into_response())
}

/// `POST /api/sessions/{id}/pause`
pub async fn pause_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Session>> {
    Ok(Json(state.sessions.pause(DEFAULT_TENANT, &id).await?))
}

/// `POST /api/sessions/{id}/resume`
pub async fn resume_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Session>> {
    Ok(Json(state.sessions.resume(DEFAULT_TENANT, &id).await?))
}

/// `DELETE /api/sessions/{id}`
pub async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<OkResponse>> {
    state.sessions.end(DEFAULT_TENANT, &id).await?;
    Ok(Json(OkResponse::ok()))
}
