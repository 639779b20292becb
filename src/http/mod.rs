//! HTTP surface: message intake, reads and a heartbeat.

pub mod handlers;
pub mod rate_limit;
pub mod server;

pub use handlers::AppState;
pub use rate_limit::RateLimiter;
pub use server::{router, HttpServer};
