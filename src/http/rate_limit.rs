use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    extract::{Request, State},
    http::{HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tokio::time::Instant;
use tracing::debug;

const LIMIT_HEADER: &str = "x-ratelimit-limit";
const REMAINING_HEADER: &str = "x-ratelimit-remaining";

struct Window {
    started: Instant,
    used: u32,
}

/// Fixed-window request counter shared by every request on a route.
pub struct RateLimiter {
    limit: u32,
    period: Duration,
    window: Mutex<Window>,
}

/// Outcome of [`RateLimiter::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub remaining: u32,
}

impl RateLimiter {
    pub fn new(limit: u32, period: Duration) -> Self {
        Self {
            limit,
            period,
            window: Mutex::new(Window {
                started: Instant::now(),
                used: 0,
            }),
        }
    }

    pub fn per_minute(limit: u32) -> Self {
        Self::new(limit, Duration::from_secs(60))
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Counts one request against the current window.
    pub fn acquire(&self) -> Decision {
        let mut window = self
            .window
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let now = Instant::now();
        if now.duration_since(window.started) >= self.period {
            window.started = now;
            window.used = 0;
        }

        if window.used >= self.limit {
            return Decision {
                allowed: false,
                remaining: 0,
            };
        }
        window.used += 1;
        Decision {
            allowed: true,
            remaining: self.limit - window.used,
        }
    }
}

/// Middleware rejecting requests over the limit with 429.
pub async fn enforce(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let decision = limiter.acquire();

    let mut response = if decision.allowed {
        next.run(request).await
    } else {
        debug!(path = %request.uri().path(), "rate limit exceeded");
        (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({"error": "too many requests"})),
        )
            .into_response()
    };

    let headers = response.headers_mut();
    headers.insert(LIMIT_HEADER, HeaderValue::from(limiter.limit()));
    headers.insert(REMAINING_HEADER, HeaderValue::from(decision.remaining));
    response
}
