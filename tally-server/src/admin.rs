//! Admin endpoint: `/health` and `/metrics`, served by axum on the tokio
//! runtime that also runs the recorder.

use axum::extract::State;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use serde_json::{Value, json};
use std::sync::Arc;
use tally_core::config::{AdminConfig, RecorderConfig};
use tally_recorder::{EntrySender, RecorderMetrics};
use tracing::info;

/// Shared state for the admin router.
pub struct AdminState {
    pub metrics: Arc<RecorderMetrics>,
    pub sender: EntrySender,
    pub recorder: RecorderConfig,
    pub upstream: String,
}

pub fn build_admin_router(state: Arc<AdminState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Serve the admin router until the listener fails.
pub async fn start_admin(config: AdminConfig, state: Arc<AdminState>) -> anyhow::Result<()> {
    let app = build_admin_router(state);
    let listener = tokio::net::TcpListener::bind(config.addr.as_str()).await?;
    info!(addr = %config.addr, "Starting admin endpoint");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health_check(State(state): State<Arc<AdminState>>) -> Json<Value> {
    let queue = &state.sender;
    Json(json!({
        "status": if queue.is_closed() { "stopping" } else { "ok" },
        "version": env!("CARGO_PKG_VERSION"),
        "engine": "tally-monoio",
        "upstream": state.upstream,
        "recorder": {
            "queue_depth": queue.depth(),
            "queue_capacity": queue.capacity(),
            "overflow": state.recorder.overflow,
            "batch_size": state.recorder.batch_size,
            "flush_interval_ms": state.recorder.flush_interval_ms,
            "flush_timeout_ms": state.recorder.flush_timeout_ms,
        },
        "metrics_enabled": state.metrics.is_enabled(),
    }))
}

async fn metrics_handler(State(state): State<Arc<AdminState>>) -> String {
    state.metrics.render()
}
