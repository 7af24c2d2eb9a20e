//! HTTP Route Integration Tests
//!
//! Drives the relay router in-process with `tower::ServiceExt::oneshot`.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use futures::StreamExt;
use tower::ServiceExt;

use common::{Probe, ScriptedSource, engine, key};
use price_stream_relay::{HttpState, StreamEngine, router};

fn app(engine: &Arc<StreamEngine>) -> Router {
    router(Arc::new(HttpState::new(
        "test-0.0.1".to_string(),
        Arc::clone(engine),
        16,
    )))
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = to_bytes(response.into_body(), 64 * 1024).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

// =============================================================================
// Probes
// =============================================================================

#[tokio::test]
async fn test_liveness_and_readiness() {
    let source = ScriptedSource::empty();
    let engine = Arc::new(engine(&source));
    let app = app(&engine);

    let response = app.clone().oneshot(get("/healthz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "OK");

    let response = app.clone().oneshot(get("/readyz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    engine.shutdown().await;

    let response = app.clone().oneshot(get("/readyz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let response = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let json: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(json["status"], "stopping");
}

#[tokio::test]
async fn test_health_reports_sessions() {
    let source = ScriptedSource::with(&[("BINANCE:BTCUSD", "42000")]);
    let engine = Arc::new(engine(&source));
    let probe = Probe::new();
    engine
        .subscribe("binance", "btcusd", probe.handle())
        .await
        .unwrap();

    let response = app(&engine).oneshot(get("/health")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["version"], "test-0.0.1");
    assert_eq!(json["open_sessions"], 1);
    assert_eq!(json["listeners"], 1);
}

// =============================================================================
// Prices & Sessions
// =============================================================================

#[tokio::test]
async fn test_price_lookup() {
    let source = ScriptedSource::with(&[("BINANCE:BTCUSD", "42,000.50")]);
    let engine = Arc::new(engine(&source));
    let app = app(&engine);

    let response = app
        .clone()
        .oneshot(get("/prices/binance/btcusd"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let probe = Probe::new();
    engine
        .subscribe("binance", "btcusd", probe.handle())
        .await
        .unwrap();

    let response = app
        .clone()
        .oneshot(get("/prices/binance/btcusd"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(json["key"], "BINANCE:BTCUSD");
    assert_eq!(json["value"], "42000.50");

    let response = app.oneshot(get("/sessions")).await.unwrap();
    let json: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(json[0]["key"], "BINANCE:BTCUSD");
    assert_eq!(json[0]["phase"], "open");
    assert_eq!(json[0]["listeners"], 1);
}

// =============================================================================
// Streaming
// =============================================================================

#[tokio::test]
async fn test_stream_rejects_invalid_key() {
    let source = ScriptedSource::empty();
    let engine = Arc::new(engine(&source));

    let response = app(&engine)
        .oneshot(get("/stream/%20/btcusd"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_stream_rejects_unknown_symbol() {
    let source = ScriptedSource::with(&[("BINANCE:BTCUSD", "42000")]);
    let engine = Arc::new(engine(&source));

    let response = app(&engine)
        .oneshot(get("/stream/binance/fakeusd"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_text(response).await;
    assert!(body.contains("BINANCE:FAKEUSD"), "{body}");
    assert!(!engine.has_session(&key("BINANCE:FAKEUSD")));
}

#[tokio::test]
async fn test_stream_after_shutdown_is_unavailable() {
    let source = ScriptedSource::with(&[("BINANCE:BTCUSD", "42000")]);
    let engine = Arc::new(engine(&source));
    engine.shutdown().await;

    let response = app(&engine)
        .oneshot(get("/stream/binance/btcusd"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_stream_sends_current_value_and_unsubscribes_on_drop() {
    let source = ScriptedSource::with(&[("BINANCE:BTCUSD", "42000")]);
    let engine = Arc::new(engine(&source));

    let response = app(&engine)
        .oneshot(get("/stream/binance/btcusd"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        response.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream")
    );
    assert_eq!(engine.listener_count(&key("BINANCE:BTCUSD")), 1);

    let mut frames = response.into_body().into_data_stream();
    let first = tokio::time::timeout(Duration::from_secs(1), frames.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let first = String::from_utf8(first.to_vec()).unwrap();
    assert!(first.contains("event: price"), "{first}");
    assert!(first.contains("\"value\":\"42000\""), "{first}");

    drop(frames);

    tokio::time::timeout(Duration::from_secs(1), async {
        while engine.has_session(&key("BINANCE:BTCUSD")) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(source.closes("BINANCE:BTCUSD"), 1);
}

#[tokio::test]
async fn test_stream_abandoned_during_open_releases_session() {
    let source = ScriptedSource::with(&[("BINANCE:BTCUSD", "42000")]);
    source.hold_opens();
    let engine = Arc::new(engine(&source));

    let abandoned = tokio::time::timeout(
        Duration::from_millis(50),
        app(&engine).oneshot(get("/stream/binance/btcusd")),
    )
    .await;
    assert!(abandoned.is_err());

    source.release_opens();
    tokio::time::timeout(Duration::from_secs(1), async {
        while source.closes("BINANCE:BTCUSD") == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert!(!engine.has_session(&key("BINANCE:BTCUSD")));
    assert_eq!(source.opens("BINANCE:BTCUSD"), 1);
    assert_eq!(engine.listener_count(&key("BINANCE:BTCUSD")), 0);
}
