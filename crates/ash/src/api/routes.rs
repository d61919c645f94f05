//! API route definitions.

use axum::{
    Router, middleware,
    routing::{delete, get, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::handlers;
use super::internal;
use super::state::AppState;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(Level::DEBUG));

    let api_routes = Router::new()
        .route("/agents", post(handlers::deploy_agent))
        .route("/agents", get(handlers::list_agents))
        .route("/agents/{name}", delete(handlers::delete_agent))
        .route("/sessions", post(handlers::create_session))
        .route("/sessions", get(handlers::list_sessions))
        .route("/sessions/{id}", get(handlers::get_session))
        .route("/sessions/{id}", delete(handlers::delete_session))
        .route("/sessions/{id}/messages", post(handlers::send_message))
        .route("/sessions/{id}/pause", post(handlers::pause_session))
        .route("/sessions/{id}/resume", post(handlers::resume_session));

    // Node-to-node surface; bearer-gated when an internal secret is set.
    let internal_routes = Router::new()
        .route("/internal/runners/register", post(internal::register_runner))
        .route("/internal/runners/heartbeat", post(internal::heartbeat_runner))
        .route(
            "/internal/runners/deregister",
            post(internal::deregister_runner),
        )
        .route("/runner/sandboxes", post(internal::create_sandbox))
        .route("/runner/sandboxes/{id}", delete(internal::destroy_sandbox))
        .route("/runner/sandboxes/{id}/cmd", post(internal::sandbox_cmd))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            internal::require_internal_auth,
        ));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .nest("/api", api_routes)
        .merge(internal_routes)
        .layer(trace_layer)
        .layer(CorsLayer::permissive())
        .with_state(state)
}
