use axum::{extract::State, routing::{get, post}, Json, Router};
use evonet_protocol::NodeMonitor;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;

use crate::pool::MigrantPool;

pub struct StatusState {
    pub node: NodeMonitor,
    pub pool: MigrantPool,
}

pub fn create_router(state: Arc<StatusState>) -> Router {
    Router::new()
        .route("/api/status", get(status_handler))
        .route("/api/ping", post(ping_handler))
        .layer(RequestBodyLimitLayer::new(64 * 1024))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn status_handler(State(state): State<Arc<StatusState>>) -> Json<Value> {
    let status = state.node.status().await;
    Json(json!({
        "control": status.control,
        "mailbox": status.mailbox,
        "migrants_waiting": state.pool.waiting(),
        "migrants_received": state.pool.received_from(),
    }))
}

async fn ping_handler(State(state): State<Arc<StatusState>>) -> Json<Value> {
    let status = state.node.status().await;
    Json(json!({
        "status": "ok",
        "node": status.control.node_id,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
