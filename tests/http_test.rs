mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use common::{get_test_config, in_memory_pipeline, TestPipeline};
use message_relay::http::router;
use serde_json::{json, Value};
use tower::ServiceExt;

fn app(t: &TestPipeline, create_per_minute: u32) -> Router {
    let mut config = get_test_config().http;
    config.create_per_minute = create_per_minute;
    router(t.pipeline.clone(), &config)
}

fn post_message(body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/messages")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_create_and_fetch_message() {
    let t = in_memory_pipeline();

    let response = app(&t, 0)
        .oneshot(post_message(r#"{"content": "hello", "processed": false}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    assert!(response.headers().contains_key("x-request-id"));
    let created = json_body(response).await;
    assert_eq!(created, json!({"id": 1, "content": "hello", "processed": false}));

    let response = app(&t, 0).oneshot(get("/messages/1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await, created);

    assert_eq!(t.publisher.published().len(), 1);
}

#[tokio::test]
async fn test_processed_defaults_to_false() {
    let t = in_memory_pipeline();

    let response = app(&t, 0)
        .oneshot(post_message(r#"{"content": "no flag"}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(json_body(response).await["processed"], false);
}

#[tokio::test]
async fn test_invalid_create_bodies() {
    let t = in_memory_pipeline();

    for body in ["{not json", r#"{"processed": true}"#, r#"{"content": "  "}"#] {
        let response = app(&t, 0).oneshot(post_message(body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body: {}", body);
        assert!(json_body(response).await["error"].is_string());
    }
    assert_eq!(t.repo.len(), 0);
}

#[tokio::test]
async fn test_store_failure_is_unprocessable() {
    let t = in_memory_pipeline();
    t.repo.fail_all();

    let response = app(&t, 0)
        .oneshot(post_message(r#"{"content": "x"}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let response = app(&t, 0).oneshot(get("/messages/stats")).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_missing_message_is_404() {
    let t = in_memory_pipeline();

    let response = app(&t, 0).oneshot(get("/messages/42")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(
        json_body(response).await,
        json!({"error": "message with id 42: not found"})
    );
}

#[tokio::test]
async fn test_malformed_id_is_json_400() {
    let t = in_memory_pipeline();

    for uri in ["/messages/abc", "/messages/1.5", "/messages/99999999999"] {
        let response = app(&t, 0).oneshot(get(uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "uri: {}", uri);
        assert_eq!(
            response.headers()["content-type"],
            "application/json",
            "uri: {}",
            uri
        );
        assert!(json_body(response).await["error"].is_string());
    }
}

#[tokio::test]
async fn test_stats_route() {
    let t = in_memory_pipeline();
    t.pipeline.create_message("a", true).await.unwrap();
    t.pipeline.create_message("b", false).await.unwrap();

    let response = app(&t, 0).oneshot(get("/messages/stats")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await, json!({"all": 2, "processed": 1}));
}

#[tokio::test]
async fn test_heartbeat() {
    let t = in_memory_pipeline();

    let response = app(&t, 0).oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&bytes[..], b".");
}

#[tokio::test]
async fn test_create_rate_limit() {
    let t = in_memory_pipeline();
    let app = app(&t, 2);

    for remaining in ["1", "0"] {
        let response = app
            .clone()
            .oneshot(post_message(r#"{"content": "x"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["x-ratelimit-limit"], "2");
        assert_eq!(response.headers()["x-ratelimit-remaining"], remaining);
    }

    let response = app
        .clone()
        .oneshot(post_message(r#"{"content": "x"}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(json_body(response).await, json!({"error": "too many requests"}));

    // other routes are not limited
    let response = app.oneshot(get("/messages/stats")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(t.repo.len(), 2);
}

#[tokio::test]
async fn test_oversized_headers_rejected() {
    let t = in_memory_pipeline();
    let mut config = get_test_config().http;
    config.max_header_bytes = 256;
    let app = router(t.pipeline.clone(), &config);

    let request = Request::builder()
        .uri("/messages/stats")
        .header("cookie", "x".repeat(512))
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE);
    assert!(response.headers().contains_key("x-request-id"));
    assert_eq!(
        json_body(response).await,
        json!({"error": "request header fields too large"})
    );

    let response = app.oneshot(get("/messages/stats")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
