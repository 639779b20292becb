//! Router assembly and the graceful HTTP server.
//!
//! Requests flow through request-id injection, tracing, a header size
//! check, a request deadline and body read/write deadlines before reaching
//! a handler. Create and stats routes may carry their own fixed-window rate
//! limit. Limits set to 0 in [`HttpConfig`] are left out.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::{
    timeout::{RequestBodyTimeoutLayer, ResponseBodyTimeoutLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use uuid::Uuid;

use super::handlers::{self, ApiError, AppState};
use super::rate_limit::{self, RateLimiter};
use crate::config::HttpConfig;
use crate::pipeline::MessagePipeline;
use crate::{Error, Result};

/// Builds the application router.
pub fn router(pipeline: MessagePipeline, config: &HttpConfig) -> Router {
    let state = AppState { pipeline };

    let mut create_routes = Router::new().route("/messages", post(handlers::create_message));
    if config.create_per_minute > 0 {
        create_routes = create_routes.route_layer(middleware::from_fn_with_state(
            Arc::new(RateLimiter::per_minute(config.create_per_minute)),
            rate_limit::enforce,
        ));
    }

    let mut stats_routes = Router::new().route("/messages/stats", get(handlers::get_stats));
    if config.stats_per_minute > 0 {
        stats_routes = stats_routes.route_layer(middleware::from_fn_with_state(
            Arc::new(RateLimiter::per_minute(config.stats_per_minute)),
            rate_limit::enforce,
        ));
    }

    let mut app = Router::new()
        .route("/health", get(handlers::heartbeat))
        .route("/messages/{id}", get(handlers::get_message))
        .merge(create_routes)
        .merge(stats_routes);

    if let Some(timeout) = config.write_timeout() {
        app = app.layer(ResponseBodyTimeoutLayer::new(timeout));
    }
    if let Some(timeout) = config.read_timeout() {
        app = app.layer(RequestBodyTimeoutLayer::new(timeout));
    }
    if let Some(timeout) = config.request_timeout() {
        app = app.layer(middleware::from_fn_with_state(timeout, enforce_timeout));
    }
    if config.max_header_bytes > 0 {
        app = app.layer(middleware::from_fn_with_state(
            config.max_header_bytes,
            limit_header_bytes,
        ));
    }

    app.layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(inject_request_id))
        .with_state(state)
}

/// Answers 408 with the usual JSON error body when the handler is still
/// running after `timeout`.
async fn enforce_timeout(State(timeout): State<Duration>, req: Request, next: Next) -> Response {
    match tokio::time::timeout(timeout, next.run(req)).await {
        Ok(response) => response,
        Err(_elapsed) => {
            warn!(timeout_ms = timeout.as_millis() as u64, "request timed out");
            ApiError::new(StatusCode::REQUEST_TIMEOUT, "request timeout").into_response()
        }
    }
}

/// Rejects requests whose header names and values add up to more than
/// `limit` bytes.
async fn limit_header_bytes(State(limit): State<usize>, req: Request, next: Next) -> Response {
    let size: usize = req
        .headers()
        .iter()
        .map(|(name, value)| name.as_str().len() + value.len())
        .sum();
    if size > limit {
        return ApiError::new(
            StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
            "request header fields too large",
        )
        .into_response();
    }
    next.run(req).await
}

/// Adds an `X-Request-Id` header to every response.
async fn inject_request_id(mut req: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    req.extensions_mut().insert(request_id.clone());

    let mut response = next.run(req).await;
    if let Ok(value) = request_id.parse() {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// A running HTTP server that stops accepting connections on
/// [`HttpServer::shutdown`] and lets in-flight requests finish.
pub struct HttpServer {
    local_addr: SocketAddr,
    stop: CancellationToken,
    task: tokio::sync::Mutex<Option<JoinHandle<std::io::Result<()>>>>,
}

impl HttpServer {
    /// Binds `addr` and starts serving on a background task.
    pub async fn start(addr: &str, app: Router) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let stop = CancellationToken::new();

        let signal = stop.clone();
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { signal.cancelled().await })
                .await
        });

        info!(addr = %local_addr, "HTTP server listening");
        Ok(Self {
            local_addr,
            stop,
            task: tokio::sync::Mutex::new(Some(task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting connections and waits for in-flight requests, or
    /// until `deadline` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] when called a second time, or the serve
    /// error if the server failed.
    pub async fn shutdown(&self, deadline: CancellationToken) -> Result<()> {
        let task = self.task.lock().await.take().ok_or(Error::Closed {
            component: "http server",
        })?;
        self.stop.cancel();

        tokio::select! {
            served = task => {
                served??;
                info!("HTTP server stopped gracefully");
                Ok(())
            }
            _ = deadline.cancelled() => {
                warn!("HTTP server still draining requests at the shutdown deadline");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    async fn slow() -> &'static str {
        tokio::time::sleep(Duration::from_secs(60)).await;
        "late"
    }

    fn timed(timeout: Duration) -> Router {
        Router::new()
            .route("/slow", get(slow))
            .route("/fast", get(|| async { "ok" }))
            .layer(middleware::from_fn_with_state(timeout, enforce_timeout))
    }

    fn get_request(uri: &str) -> Request {
        axum::http::Request::builder()
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_handler_gets_json_408() {
        let response = timed(Duration::from_millis(100))
            .oneshot(get_request("/slow"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
        assert_eq!(response.headers()["content-type"], "application/json");

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body, json!({"error": "request timeout"}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_handler_within_deadline() {
        let response = timed(Duration::from_millis(100))
            .oneshot(get_request("/fast"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_header_size_limit() {
        let app = Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(middleware::from_fn_with_state(64usize, limit_header_bytes));

        let response = app.clone().oneshot(get_request("/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let request = axum::http::Request::builder()
            .uri("/")
            .header("x-padding", "a".repeat(100))
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body, json!({"error": "request header fields too large"}));
    }
}
