//! Use-case layer joining the store, the publisher and the ack consumer.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::kafka::ProcessedAckUsecase;
use crate::message::{Message, MessagePublisher, MessageRepository, Stats};
use crate::{Error, Result};

/// Creates messages, serves reads and applies processed acknowledgements.
///
/// Domain errors from the store pass through unchanged; infrastructure
/// errors are wrapped with the operation that failed.
#[derive(Clone)]
pub struct MessagePipeline {
    repo: Arc<dyn MessageRepository>,
    publisher: Arc<dyn MessagePublisher>,
}

impl MessagePipeline {
    pub fn new(repo: Arc<dyn MessageRepository>, publisher: Arc<dyn MessagePublisher>) -> Self {
        Self { repo, publisher }
    }

    /// Stores the message, then publishes it.
    ///
    /// Publishing only starts once the row exists. A message that is stored
    /// but never published is tolerated; the publisher logs the failure.
    pub async fn create_message(&self, content: &str, processed: bool) -> Result<Message> {
        if content.trim().is_empty() {
            return Err(Error::Validation("content must not be empty".to_string()));
        }

        let id = self
            .repo
            .create(content, processed)
            .await
            .map_err(|e| e.context("create message"))?;

        let message = Message {
            id,
            content: content.to_string(),
            processed,
        };
        self.publisher.publish(&message).await;
        debug!(message_id = id, "message created");

        Ok(message)
    }

    pub async fn get_message(&self, id: i32) -> Result<Message> {
        self.repo
            .get_by_id(id)
            .await
            .map_err(|e| e.context(format!("get message {}", id)))
    }

    /// Always read from the store.
    pub async fn get_stats(&self) -> Result<Stats> {
        self.repo
            .get_stats()
            .await
            .map_err(|e| e.context("get stats"))
    }

    /// Sets `processed` for `id`. Applying the same acknowledgement twice
    /// leaves the row unchanged.
    pub async fn apply_processed_ack(&self, id: i32) -> Result<()> {
        let ack = Message::processed_ack(id);
        self.repo
            .update_processed(ack.id, ack.processed)
            .await
            .map_err(|e| e.context("update processed"))
    }
}

#[async_trait]
impl ProcessedAckUsecase for MessagePipeline {
    async fn apply_processed_ack(&self, id: i32) -> Result<()> {
        MessagePipeline::apply_processed_ack(self, id).await
    }
}
