#![cfg(feature = "cli")]

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{self, Body},
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;

use conversation_ledger::{build_router, Config, MemoryDatabase, SharedState};

fn app() -> Router {
    let db = Arc::new(MemoryDatabase::new_in_memory().unwrap());
    let state = Arc::new(SharedState::new(Config::default(), db).unwrap());
    build_router(state, Duration::from_secs(30))
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(match body {
            Some(value) => Body::from(value.to_string()),
            None => Body::empty(),
        })
        .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, json)
}

#[tokio::test]
async fn test_healthz() {
    let app = app();
    let (status, body) = send(&app, "GET", "/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_sync_then_read_buffer() {
    let app = app();
    let batch = json!({"messages": [
        {"role": "user", "content": "hi", "platform": "slack"},
        {"role": "assistant", "content": "hello", "platform": "slack"}
    ]});
    let (status, body) = send(&app, "POST", "/users/alice/sync", Some(batch)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["appended"], 2);

    let (status, body) = send(&app, "GET", "/users/alice/buffer", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 2);
    assert_eq!(body[0]["role"], "user");
}

#[tokio::test]
async fn test_divergent_sync_is_accepted_and_flagged() {
    let app = app();
    let message = |role: &str, content: &str| json!({"role": role, "content": content, "platform": "slack"});
    let first = json!({"messages": [
        message("user", "q1"), message("assistant", "a1"), message("user", "q2"), message("assistant", "a2")
    ]});
    send(&app, "POST", "/users/alice/sync", Some(first)).await;

    let divergent = json!({"messages": [
        message("user", "q1"), message("assistant", "a1"), message("user", "rewritten"), message("assistant", "a2")
    ]});
    let (status, body) = send(&app, "POST", "/users/alice/sync", Some(divergent)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["conflict"], true);
    assert_eq!(body["appended"], 4);

    let (_, stats) = send(&app, "GET", "/stats", None).await;
    assert_eq!(stats["counters"]["sync_conflicts"], 1);
}

#[tokio::test]
async fn test_invalid_user_id_is_bad_request() {
    let app = app();
    let batch = json!({"messages": [{"role": "user", "content": "hi", "platform": "slack"}]});
    let (status, body) = send(&app, "POST", "/users/bad%20id/sync", Some(batch)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], 400);
}

#[tokio::test]
async fn test_memory_lifecycle() {
    let app = app();
    let (status, created) = send(
        &app,
        "POST",
        "/memories",
        Some(json!({"text": "Prefers window seats", "tags": ["travel", "preferences"]})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = created["id"].as_i64().unwrap();

    let (status, fetched) = send(&app, "GET", &format!("/memories/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["access_count"], 1);

    let (status, found) = send(&app, "POST", "/memories/search", Some(json!({"keywords": ["travel"]}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(found["memories"].as_array().unwrap().len(), 1);

    let (status, _) = send(&app, "DELETE", &format!("/memories/{}", id), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = send(&app, "GET", &format!("/memories/{}", id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], 404);
}

#[tokio::test]
async fn test_search_validation_error() {
    let app = app();
    let (status, _) = send(
        &app,
        "POST",
        "/memories/search",
        Some(json!({"keywords": ["a"], "min_keywords": 0})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_scan_without_collaborator_reports_failed_span() {
    let app = app();
    let batch = json!({"messages": [
        {"role": "user", "content": "hi", "platform": "slack"},
        {"role": "assistant", "content": "hello", "platform": "slack"}
    ]});
    send(&app, "POST", "/users/alice/sync", Some(batch)).await;

    let (status, report) = send(&app, "POST", "/users/alice/topics/scan", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["failed_spans"], 1);
}

#[tokio::test]
async fn test_heatmap_tick_and_top() {
    let app = app();
    send(&app, "POST", "/memories", Some(json!({"text": "Uses kubectl daily", "tags": ["kubernetes"]}))).await;

    let (status, outcome) = send(
        &app,
        "POST",
        "/heatmap/tick",
        Some(json!({"events": [{"keyword": "kubernetes", "weight": "high"}]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["cycle"], 1);

    let (status, top) = send(&app, "GET", "/heatmap/top?n=5", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(top[0]["text"], "Uses kubectl daily");
    assert_eq!(top[0]["score"], 1.0);
}
