pub mod config;
pub mod error;
pub mod message;
pub mod pipeline;
pub mod shutdown;

pub mod http;
pub mod kafka;
pub mod postgres;

pub use config::Config;
pub use error::{Error, Result};
pub use message::{Message, Stats};
pub use pipeline::MessagePipeline;
pub use shutdown::ShutdownCoordinator;
