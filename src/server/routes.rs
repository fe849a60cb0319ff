//! Reserved-route router and shared server state.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::broker::Broker;
use crate::github::UserProvider;

use super::registry::AgentRegistry;
use super::session;

/// State shared by every handler and every connection task.
#[derive(Clone)]
pub struct AppState {
    /// Which subdomains have a live agent.
    pub registry: Arc<AgentRegistry>,
    /// Pub/sub hub pairing ingress requests with agent responses.
    pub broker: Arc<Broker>,
    /// Resolves agent bearer tokens to identities.
    pub provider: Arc<dyn UserProvider>,
    /// Advertised on `/_config` for the device-flow login.
    pub github_client_id: String,
    /// How long the ingress waits for the agent round trip.
    pub forward_timeout: Duration,
}

/// Builds the router for the reserved (`/_*`) routes.
pub(crate) fn create_router(state: AppState) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(Level::DEBUG));

    Router::new()
        .route("/_health", get(health))
        .route("/_config", get(config))
        .route("/_websocket", get(session::websocket_handler))
        .layer(CorsLayer::permissive())
        .layer(trace_layer)
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn config(State(state): State<AppState>) -> Json<Value> {
    Json(json!({"github_client_id": state.github_client_id}))
}
