//! Routing tests for the evaluator's HTTP surface.
//!
//! Tests use Axum's `Router` directly via `tower::ServiceExt` without
//! starting a TCP server. Connections that never upgrade are answered
//! here, so role routing can be checked without a `WebSocket` client.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use ensemble_core::config::EvaluatorConfig;
use ensemble_evaluator::router::build_router;
use ensemble_evaluator::state::EvaluatorState;
use ensemble_types::Snapshot;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

fn make_test_state() -> Arc<EvaluatorState> {
    let (state, _control_loop) = EvaluatorState::new(
        Snapshot::default(),
        EvaluatorConfig::default(),
        CancellationToken::new(),
    );
    state
}

async fn body_to_json(body: Body) -> Value {
    let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

// =========================================================================
// Tests
// =========================================================================

#[tokio::test]
async fn test_unknown_role_is_bad_request() {
    let router = build_router(make_test_state());

    let response = router
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["status"], 400);
    assert!(json["error"].as_str().unwrap().contains("metrics"));
}

#[tokio::test]
async fn test_nested_unknown_role_is_bad_request() {
    let router = build_router(make_test_state());

    let response = router
        .oneshot(Request::get("/clients/extra").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_root_path_is_bad_request() {
    let router = build_router(make_test_state());

    let response = router
        .oneshot(Request::get("/").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_known_role_without_upgrade_is_rejected() {
    let router = build_router(make_test_state());

    for path in ["/client", "/dispatch"] {
        let response = router
            .clone()
            .oneshot(Request::get(path).body(Body::empty()).unwrap())
            .await
            .unwrap();

        // Axum's own upgrade rejection, not the unknown-role JSON body.
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{path}");
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8_lossy(&bytes).to_lowercase();
        assert!(text.contains("upgrade"), "{path}: {text}");
        assert!(serde_json::from_slice::<Value>(&bytes).is_err(), "{path}: {text}");
    }
}
