//! Admin router tests, driven through `tower::ServiceExt::oneshot` without
//! binding a port.

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use std::sync::Arc;
use bytes::Bytes;
use chrono::Utc;
use tally_core::{HeaderMultimap, LogEntry, RequestSnapshot, ResponseSnapshot};
use tally_core::config::{OverflowPolicy, RecorderConfig};
use tally_recorder::{EntryReceiver, RecorderMetrics, Submit, intake_queue};
use tally_server::admin::{AdminState, build_admin_router};
use tower::ServiceExt; // .oneshot()

fn make_state(metrics_enabled: bool) -> (Arc<AdminState>, EntryReceiver) {
    let metrics = Arc::new(RecorderMetrics::new(metrics_enabled).unwrap());
    let (sender, rx) = intake_queue(8, OverflowPolicy::DropNewest, Arc::clone(&metrics));
    let state = Arc::new(AdminState {
        metrics,
        sender,
        recorder: RecorderConfig::default(),
        upstream: "http://backend:3000".into(),
    });
    (state, rx)
}

fn get_req(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_text(resp: axum::response::Response) -> String {
    let bytes = to_bytes(resp.into_body(), 1024 * 1024).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn entry(uri: &str) -> LogEntry {
    let request = RequestSnapshot {
        method: "GET".into(),
        host: "shop.local".into(),
        uri: uri.into(),
        header: HeaderMultimap::new(),
        body: Bytes::new(),
    };
    let response = ResponseSnapshot {
        status: 200,
        header: HeaderMultimap::new(),
        body: Bytes::new(),
    };
    LogEntry::new(request, response, Utc::now())
}

#[tokio::test]
async fn health_reports_recorder_settings() {
    let (state, _rx) = make_state(true);
    let resp = build_admin_router(state).oneshot(get_req("/health")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let json: serde_json::Value = serde_json::from_str(&body_text(resp).await).unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(json["upstream"], "http://backend:3000");
    assert_eq!(json["recorder"]["queue_capacity"], 8);
    assert_eq!(json["recorder"]["queue_depth"], 0);
    assert_eq!(json["recorder"]["batch_size"], 100);
    assert_eq!(json["recorder"]["overflow"], "block");
    assert_eq!(json["metrics_enabled"], true);
}

#[tokio::test]
async fn health_shows_queue_depth() {
    let (state, _rx) = make_state(true);
    assert_eq!(state.sender.try_submit(entry("/a")), Submit::Queued);
    assert_eq!(state.sender.try_submit(entry("/b")), Submit::Queued);

    let resp = build_admin_router(state).oneshot(get_req("/health")).await.unwrap();
    let json: serde_json::Value = serde_json::from_str(&body_text(resp).await).unwrap();
    assert_eq!(json["recorder"]["queue_depth"], 2);
}

#[tokio::test]
async fn health_reports_stopping_once_queue_closes() {
    let (state, mut rx) = make_state(false);
    rx.close();

    let resp = build_admin_router(state).oneshot(get_req("/health")).await.unwrap();
    let json: serde_json::Value = serde_json::from_str(&body_text(resp).await).unwrap();
    assert_eq!(json["status"], "stopping");
    assert_eq!(json["metrics_enabled"], false);
}

#[tokio::test]
async fn metrics_exposes_pipeline_counters() {
    let (state, _rx) = make_state(true);
    state.sender.try_submit(entry("/a"));
    state.metrics.record_flush("tick", "ok", 1, 0.01);

    let resp = build_admin_router(state).oneshot(get_req("/metrics")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let text = body_text(resp).await;
    assert!(text.contains("tally_entries_enqueued_total 1"), "got:\n{text}");
    assert!(text.contains("tally_entries_persisted_total 1"));
    assert!(text.contains("tally_flushes_total{outcome=\"ok\",trigger=\"tick\"} 1"));
}

#[tokio::test]
async fn metrics_is_empty_when_disabled() {
    let (state, _rx) = make_state(false);
    let resp = build_admin_router(state).oneshot(get_req("/metrics")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(body_text(resp).await.is_empty());
}

#[tokio::test]
async fn unknown_path_is_404() {
    let (state, _rx) = make_state(false);
    let resp = build_admin_router(state).oneshot(get_req("/nope")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}
