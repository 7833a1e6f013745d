//! HTTP route handlers.

use std::sync::Arc;

use axum::{
    Router,
    body::Bytes,
    extract::{State, rejection::JsonRejection},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::Serialize;
use serde_json::json;

use crate::broker::CommandResult;
use crate::dispatch::{Payload, RpcResponse, SessionId, SessionState};
use crate::service::BridgeService;
use crate::version::VersionInfo;

/// Header carrying the dispatcher session ID.
pub const SESSION_HEADER: &str = "mcp-session-id";

#[derive(Debug, Serialize)]
pub struct HealthCheckResponse {
    pub status: &'static str,
    pub version: VersionInfo,
    pub active_sessions: usize,
}

async fn health_check(State(service): State<Arc<BridgeService>>) -> Json<HealthCheckResponse> {
    Json(HealthCheckResponse {
        status: "READY",
        version: service.version().clone(),
        active_sessions: service.dispatcher().sessions().len(),
    })
}

async fn pending_commands(State(service): State<Arc<BridgeService>>) -> impl IntoResponse {
    Json(service.broker().poll_pending())
}

async fn command_result(
    State(service): State<Arc<BridgeService>>,
    payload: Result<Json<CommandResult>, JsonRejection>,
) -> Response {
    let Json(result) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            tracing::warn!(error = %rejection, "Rejected command result");
            return (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({ "detail": rejection.body_text() })),
            )
                .into_response();
        }
    };

    tracing::info!(command_id = %result.command_id, success = result.success, "Command result received");
    service.broker().submit_result(result);
    (StatusCode::OK, Json(json!({ "status": "received" }))).into_response()
}

async fn status(State(service): State<Arc<BridgeService>>) -> impl IntoResponse {
    Json(service.broker().status())
}

fn session_from_headers(headers: &HeaderMap) -> Option<SessionId> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(SessionId::from)
}

fn session_not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "session not found" })),
    )
        .into_response()
}

async fn rpc(
    State(service): State<Arc<BridgeService>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let payload = match Payload::from_slice(&body) {
        Ok(payload) => payload,
        Err(error) => {
            let response = RpcResponse::failure(serde_json::Value::Null, error);
            return (StatusCode::BAD_REQUEST, Json(response)).into_response();
        }
    };

    let dispatcher = service.dispatcher();

    // Without a header, a fresh session is opened. It is kept only if this
    // request initialized it.
    let (session, fresh) = match session_from_headers(&headers) {
        Some(id) if dispatcher.sessions().state(&id).is_some() => (id, false),
        Some(_) => return session_not_found(),
        None => (dispatcher.open_session(), true),
    };

    let reply = dispatcher.dispatch(&session, payload).await;

    let issue_header =
        fresh && dispatcher.sessions().state(&session) == Some(SessionState::Initialized);
    if fresh && !issue_header {
        dispatcher.close_session(&session);
    }

    let mut response = match reply {
        Some(body) => (StatusCode::OK, Json(body)).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    };
    if issue_header && let Ok(value) = HeaderValue::from_str(session.as_str()) {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    response
}

async fn close_rpc_session(
    State(service): State<Arc<BridgeService>>,
    headers: HeaderMap,
) -> Response {
    let Some(session) = session_from_headers(&headers) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": format!("missing {} header", SESSION_HEADER) })),
        )
            .into_response();
    };

    if service.dispatcher().close_session(&session) {
        (StatusCode::OK, Json(json!({}))).into_response()
    } else {
        session_not_found()
    }
}

async fn shutdown(State(service): State<Arc<BridgeService>>) -> impl IntoResponse {
    tracing::info!("Shutdown requested via HTTP");
    service.trigger_shutdown();
    (StatusCode::OK, Json(json!({})))
}

pub fn routes(service: Arc<BridgeService>) -> Router {
    Router::new()
        .route("/health-check", get(health_check))
        .route("/shutdown", post(shutdown))
        .route("/pending_commands", get(pending_commands))
        .route("/command_result", post(command_result))
        .route("/status", get(status))
        .route("/rpc", post(rpc).delete(close_rpc_session))
        .with_state(service)
}
