//! Runner-internal HTTP surface: registry endpoints consumed by runners,
//! and the sandbox endpoints consumed by coordinators.

use axum::{
    Json,
    extract::{Path, Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

use ash_bridge_protocol::{BridgeCommand, BridgeEvent};

use crate::runner::{
    CreateSandboxRequest, CreateSandboxResponse, DeregisterRequest, HeartbeatRequest, NewSandbox,
    OkResponse, RegisterRequest,
};

use super::error::{ApiError, ApiResult};
use super::sse::sse_response;
use super::state::AppState;

/// Bearer check for `/internal/*` and `/runner/*`. A missing secret in the
/// configuration means single-machine mode: the check is disabled.
pub async fn require_internal_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(secret) = &state.internal_secret {
        let presented = request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "));
        if presented != Some(secret.as_str()) {
            return ApiError::unauthorized("internal secret required").into_response();
        }
    }
    next.run(request).await
}

/// `POST /internal/runners/register`
pub async fn register_runner(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> ApiResult<Json<OkResponse>> {
    state
        .coordinator
        .repository()
        .upsert(&request.id, &request.host, request.port, request.max_sandboxes)
        .await
        .map_err(crate::error::CoreError::Internal)?;
    Ok(Json(OkResponse::ok()))
}

/// `POST /internal/runners/heartbeat`
pub async fn heartbeat_runner(
    State(state): State<AppState>,
    Json(request): Json<HeartbeatRequest>,
) -> ApiResult<Json<OkResponse>> {
    let known = state
        .coordinator
        .repository()
        .heartbeat(&request.id, request.active, request.warming)
        .await
        .map_err(crate::error::CoreError::Internal)?;
    if !known {
        return Err(ApiError::NotFound(format!("runner {}", request.id)));
    }
    Ok(Json(OkResponse::ok()))
}

/// `POST /internal/runners/deregister`
pub async fn deregister_runner(
    State(state): State<AppState>,
    Json(request): Json<DeregisterRequest>,
) -> ApiResult<Json<OkResponse>> {
    state
        .coordinator
        .repository()
        .deregister(&request.id)
        .await
        .map_err(crate::error::CoreError::Internal)?;
    Ok(Json(OkResponse::ok()))
}

/// `POST /runner/sandboxes` - place a sandbox on this node.
pub async fn create_sandbox(
    State(state): State<AppState>,
    Json(request): Json<CreateSandboxRequest>,
) -> ApiResult<Json<CreateSandboxResponse>> {
    let source = state
        .local
        .create_sandbox(&NewSandbox {
            session_id: request.session_id,
            tenant: request.tenant,
            agent_name: request.agent,
            resume: request.resume,
        })
        .await?;
    Ok(Json(CreateSandboxResponse {
        ok: true,
        source: Some(source.to_string()),
    }))
}

/// `DELETE /runner/sandboxes/{id}`
pub async fn destroy_sandbox(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<OkResponse>> {
    state.local.destroy_sandbox(&id).await?;
    Ok(Json(OkResponse::ok()))
}

/// `POST /runner/sandboxes/{id}/cmd` - queries stream bridge events as
/// SSE; control commands acknowledge with JSON.
pub async fn sandbox_cmd(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(cmd): Json<BridgeCommand>,
) -> ApiResult<Response> {
    match cmd {
        BridgeCommand::Query { .. } => {
            state.local.mark_running(&id).await?;
            let events = match state.local.send_command(&id, cmd).await {
                Ok(events) => events,
                Err(e) => {
                    let _ = state.local.mark_waiting(&id).await;
                    return Err(e.into());
                }
            };

            let (tx, rx) = mpsc::channel(1);
            let local = state.local.clone();
            let write_timeout = state.sse_write_timeout;
            tokio::spawn(async move {
                let mut events = events;
                let mut client_alive = true;
                let mut completed = false;
                while let Some(event) = events.next().await {
                    let is_done = matches!(event, BridgeEvent::Done { .. });
                    if client_alive {
                        match tokio::time::timeout(write_timeout, tx.send(event)).await {
                            Ok(Ok(())) => {}
                            _ => client_alive = false,
                        }
                    }
                    if is_done {
                        completed = true;
                        break;
                    }
                }
                drop(tx);

                // Run/wait flips and persistence happen here, next to the
                // pool that owns the sandbox.
                if completed {
                    if let Err(e) = local.mark_waiting(&id).await {
                        warn!(sandbox_id = %id, error = ?e, "mark waiting failed");
                    }
                    if let Err(e) = local.persist_state(&id).await {
                        warn!(sandbox_id = %id, error = ?e, "persist after turn failed");
                    }
                }
            });

            Ok(sse_response(ReceiverStream::new(rx)).into_response())
        }
        other => {
            state.local.send_control(&id, other).await?;
            Ok(Json(OkResponse::ok()).into_response())
        }
    }
}
