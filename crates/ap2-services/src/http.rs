//! Shared HTTP surface.
//!
//! Every role mounts the same three routes: `POST /a2a/message`,
//! `GET /health`, and `GET /.well-known/agent-card.json`. Role-specific
//! routers are merged on top. Error envelopes map to 4xx for protocol
//! errors and 5xx only for internal faults.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::trace::TraceLayer;

use ap2_a2a::{types, A2aMessage, MessageHandler};

use crate::card::AgentCard;

/// State shared by the common routes.
#[derive(Clone)]
pub struct A2aState {
    pub handler: Arc<MessageHandler>,
    pub card: Arc<AgentCard>,
}

/// Router with the routes every role exposes.
pub fn a2a_router(state: A2aState) -> Router {
    Router::new()
        .route("/a2a/message", post(handle_a2a_message))
        .route("/health", get(health))
        .route("/.well-known/agent-card.json", get(agent_card))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_a2a_message(
    State(state): State<A2aState>,
    Json(message): Json<A2aMessage>,
) -> Response {
    let response = state.handler.handle(message).await;
    let status = envelope_status(&response);
    (status, Json(response)).into_response()
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn agent_card(State(state): State<A2aState>) -> Json<AgentCard> {
    Json(state.card.as_ref().clone())
}

/// HTTP status for an outbound envelope: error envelopes are 4xx except
/// `INTERNAL_ERROR`, which is the one 5xx.
pub fn envelope_status(message: &A2aMessage) -> StatusCode {
    if message.data_part.data_type != types::ERROR {
        return StatusCode::OK;
    }
    match message.data_part.payload.get("error_code").and_then(|v| v.as_str()) {
        Some("INTERNAL_ERROR") => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_REQUEST,
    }
}

/// Map a protocol error onto a plain HTTP response: structured JSON body,
/// 4xx for protocol violations, 5xx only for internal faults.
pub fn protocol_error_response(error: ap2_common::ProtocolError) -> Response {
    let status = if error.error_code.is_client_error() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(error)).into_response()
}

/// Serve a router until the process is stopped.
pub async fn serve(router: Router, addr: std::net::SocketAddr) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, router).await
}
