//! HTTP router.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use bytes::Bytes;
use relay_core::{ReportId, SessionFilter, SessionId, SessionStatus};
use relay_session::SessionCoordinator;
use serde::Deserialize;
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    error::TransportError,
    sse::{MESSAGES_PATH, message_handler, sse_handler},
};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: SessionCoordinator,
}

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    status: Option<SessionStatus>,
    limit: Option<usize>,
}

/// Build the relay's router.
///
/// # Example
/// ```ignore
/// let app = create_router(coordinator);
/// axum::serve(listener, app).await?;
/// ```
#[must_use]
pub fn create_router(coordinator: SessionCoordinator) -> Router {
    let router = Router::new()
        .route("/sse", get(sse_handler))
        .route(MESSAGES_PATH, post(message_handler))
        .route("/sessions", get(list_sessions))
        .route("/sessions/{id}", get(session_status).delete(close_session))
        .route("/reports/{id}", get(read_report))
        .route("/capabilities", get(capabilities))
        .route("/stats", get(stats))
        .route("/health", get(health));

    #[cfg(feature = "websocket")]
    let router = router.route("/ws", get(crate::websocket::ws_handler));

    router
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { coordinator })
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats(State(state): State<AppState>) -> Result<impl IntoResponse, TransportError> {
    Ok(Json(state.coordinator.stats().await?))
}

async fn capabilities(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.coordinator.registry().capabilities())
}

async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, TransportError> {
    let filter = SessionFilter {
        status: query.status,
        limit: query.limit,
    };
    Ok(Json(state.coordinator.list(filter).await?))
}

async fn session_status(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
) -> Result<impl IntoResponse, TransportError> {
    Ok(Json(state.coordinator.status(id).await?))
}

async fn close_session(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
) -> Result<impl IntoResponse, TransportError> {
    state.coordinator.close(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn read_report(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, TransportError> {
    let report = state.coordinator.reports().read(&ReportId::new(id)).await?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        Bytes::from(report.payload),
    ))
}
