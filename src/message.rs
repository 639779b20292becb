//! Domain types shared by the store, the broker adapters and the HTTP layer.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

/// A stored message. `id` is assigned by the store on creation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: i32,
    pub content: String,
    pub processed: bool,
}

impl Message {
    /// A message that only carries the processed flag for `id`; every other
    /// field keeps its zero value.
    pub fn processed_ack(id: i32) -> Self {
        Self {
            id,
            content: String::new(),
            processed: true,
        }
    }
}

/// Aggregate counts, always computed fresh by the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub all: i64,
    pub processed: i64,
}

/// Durable keyed storage of messages.
#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// Inserts a new row and returns its identifier.
    async fn create(&self, content: &str, processed: bool) -> Result<i32>;

    async fn get_by_id(&self, id: i32) -> Result<Message>;

    /// Touches only the `processed` column. Unknown ids yield
    /// [`Error::NotFound`](crate::Error::NotFound).
    async fn update_processed(&self, id: i32, processed: bool) -> Result<()>;

    async fn get_stats(&self) -> Result<Stats>;
}

/// Fire-and-forget publication of created messages.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    /// Enqueues the message for delivery. Waits only while the input buffer
    /// is full; delivery failures are reported through logs.
    async fn publish(&self, message: &Message);
}
