// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP + WebSocket transport for the gateway.

pub mod loopback;
pub mod ws;

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::GatewayState;

/// Build the axum `Router` with all gateway routes.
pub fn build_router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/api/v1/health", get(health))
        .route("/groupcall", get(ws::groupcall_handler))
        .route("/loopback", get(loopback::loopback_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// `GET /api/v1/health` — liveness plus occupancy counters.
async fn health(State(state): State<Arc<GatewayState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "running",
        "rooms": state.rooms.count().await,
        "participants": state.registry.count().await,
    }))
}
