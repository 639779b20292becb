//! Consumer-group worker applying "processed" acknowledgements.
//!
//! A claim session runs `Idle -> Claimed -> (HandleOne)* -> SessionDone`.
//! Each record is decoded and applied through [`ProcessedAckUsecase`].
//! Records are marked consumed once handling returns, whether the store
//! update succeeded or not; undecodable records are logged and left
//! unmarked. Marked offsets are committed in the background and once more
//! when the session ends.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rdkafka::client::ClientContext;
use rdkafka::config::RDKafkaLogLevel;
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Message as _};
use rdkafka::TopicPartitionList;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::client::{client_config, forward_log};
use super::envelope::AckEnvelope;
use crate::config::KafkaConfig;
use crate::{Error, Result};

/// What the consumer needs from the use-case layer.
#[async_trait]
pub trait ProcessedAckUsecase: Send + Sync {
    async fn apply_processed_ack(&self, id: i32) -> Result<()>;
}

/// A record delivered on the acknowledgement topic.
#[derive(Debug, Clone)]
pub struct AckRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub timestamp: Option<DateTime<Utc>>,
    pub payload: Option<Vec<u8>>,
}

impl AckRecord {
    fn from_message(message: &BorrowedMessage<'_>) -> Self {
        Self {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            timestamp: message
                .timestamp()
                .to_millis()
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
            payload: message.payload().map(<[u8]>::to_vec),
        }
    }
}

/// Result of handling one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    Applied,
    /// Decoded, but the store update failed. The acknowledgement is lost.
    ApplyFailed,
    /// Not a valid acknowledgement payload; dropped without a store call.
    Undecodable,
}

impl HandleOutcome {
    /// Whether the record's offset may advance.
    pub fn should_mark(self) -> bool {
        !matches!(self, HandleOutcome::Undecodable)
    }
}

/// Decodes acknowledgement records and applies them.
#[derive(Clone)]
pub struct AckHandler {
    usecase: Arc<dyn ProcessedAckUsecase>,
}

impl AckHandler {
    pub fn new(usecase: Arc<dyn ProcessedAckUsecase>) -> Self {
        Self { usecase }
    }

    pub async fn handle(&self, record: &AckRecord) -> HandleOutcome {
        let ack = match record.payload.as_deref().map(AckEnvelope::from_bytes) {
            Some(Ok(ack)) => ack,
            Some(Err(e)) => {
                warn!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "message value from bytes"
                );
                return HandleOutcome::Undecodable;
            }
            None => {
                warn!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    "acknowledgement without payload"
                );
                return HandleOutcome::Undecodable;
            }
        };

        match self.usecase.apply_processed_ack(ack.id).await {
            Ok(()) => {
                debug!(message_id = ack.id, offset = record.offset, "message marked processed");
                HandleOutcome::Applied
            }
            Err(e) => {
                error!(
                    message_id = ack.id,
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    timestamp = ?record.timestamp,
                    error = %e,
                    "update processed message"
                );
                HandleOutcome::ApplyFailed
            }
        }
    }
}

/// One period of partition ownership.
#[async_trait]
pub trait ClaimSession: Send {
    /// Next delivered record, or `None` once the claim is released.
    async fn next_record(&mut self) -> Option<Result<AckRecord>>;

    /// Marks the record consumed so its offset is eligible for commit.
    fn mark(&mut self, record: &AckRecord) -> Result<()>;

    /// Commits every marked offset.
    fn commit(&mut self) -> Result<()>;
}

/// How a claim session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Stop was requested; pending offsets were committed.
    Stopped,
    /// Partitions were revoked or the record stream ended.
    Released,
    /// The record stream reported an error.
    Failed,
}

/// Drives a claim session until it is released or `stop` is cancelled.
pub async fn consume_claim<S: ClaimSession>(
    session: &mut S,
    handler: &AckHandler,
    stop: &CancellationToken,
) -> SessionEnd {
    loop {
        tokio::select! {
            biased;

            _ = stop.cancelled() => {
                if let Err(e) = session.commit() {
                    error!(error = %e, "commit on session end");
                }
                return SessionEnd::Stopped;
            }

            next = session.next_record() => match next {
                None => {
                    info!("claim message channel was closed");
                    if let Err(e) = session.commit() {
                        warn!(error = %e, "commit on claim release");
                    }
                    return SessionEnd::Released;
                }
                Some(Err(e)) => {
                    error!(error = %e, "error from consume");
                    return SessionEnd::Failed;
                }
                Some(Ok(record)) => {
                    let outcome = handler.handle(&record).await;
                    if outcome.should_mark() {
                        if let Err(e) = session.mark(&record) {
                            error!(
                                topic = %record.topic,
                                partition = record.partition,
                                offset = record.offset,
                                error = %e,
                                "mark message"
                            );
                        }
                    }
                }
            }
        }
    }
}

/// Consumer context that logs rebalances and ends the current claim
/// session when partitions are revoked.
pub struct AckConsumerContext {
    revoked: Arc<Notify>,
}

impl ClientContext for AckConsumerContext {
    fn log(&self, level: RDKafkaLogLevel, fac: &str, log_message: &str) {
        forward_log(level, fac, log_message);
    }
}

impl ConsumerContext for AckConsumerContext {
    fn pre_rebalance(&self, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Revoke(tpl) => {
                info!(partitions = tpl.count(), "partitions revoked, ending claim session");
                self.revoked.notify_one();
            }
            Rebalance::Assign(tpl) => {
                info!(partitions = tpl.count(), "partitions assigned");
            }
            Rebalance::Error(e) => {
                error!(error = %e, "rebalance error");
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(()) => debug!(partitions = offsets.count(), "offsets committed"),
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => {}
            Err(e) => warn!(error = %e, "offset commit failed"),
        }
    }
}

struct KafkaClaim<'a> {
    consumer: &'a StreamConsumer<AckConsumerContext>,
    revoked: &'a Notify,
}

#[async_trait]
impl ClaimSession for KafkaClaim<'_> {
    async fn next_record(&mut self) -> Option<Result<AckRecord>> {
        tokio::select! {
            _ = self.revoked.notified() => None,
            received = self.consumer.recv() => {
                Some(received.map(|m| AckRecord::from_message(&m)).map_err(Error::from))
            }
        }
    }

    fn mark(&mut self, record: &AckRecord) -> Result<()> {
        // the committed position is the next offset to read
        self.consumer
            .store_offset(&record.topic, record.partition, record.offset + 1)?;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        match self.consumer.commit_consumer_state(CommitMode::Sync) {
            Ok(()) | Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Consumer-group member for the acknowledgement topics.
pub struct AckConsumer {
    consumer: StreamConsumer<AckConsumerContext>,
    revoked: Arc<Notify>,
    topics: Vec<String>,
    handler: AckHandler,
    retry_backoff: Duration,
    closed: CancellationToken,
    running: tokio::sync::Mutex<()>,
}

impl AckConsumer {
    pub fn new(config: &KafkaConfig, usecase: Arc<dyn ProcessedAckUsecase>) -> Result<Self> {
        let consumer_config = &config.consumer;
        let revoked = Arc::new(Notify::new());

        let mut client_config = client_config(config);
        client_config
            .set("group.id", &consumer_config.group)
            .set("enable.auto.commit", "true")
            .set(
                "auto.commit.interval.ms",
                consumer_config.auto_commit_interval_ms.to_string(),
            )
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", consumer_config.session_timeout_ms.to_string())
            .set("fetch.wait.max.ms", consumer_config.max_wait_ms.to_string())
            .set("fetch.min.bytes", consumer_config.fetch_min_bytes.to_string())
            .set(
                "max.partition.fetch.bytes",
                consumer_config.fetch_default_bytes.to_string(),
            )
            .set("reconnect.backoff.ms", consumer_config.retry_backoff_ms.to_string());
        if let Some(max) = consumer_config.fetch_max_bytes {
            client_config.set("fetch.max.bytes", max.to_string());
        }

        let consumer: StreamConsumer<AckConsumerContext> =
            client_config.create_with_context(AckConsumerContext {
                revoked: revoked.clone(),
            })?;

        info!(
            group = %consumer_config.group,
            topics = ?consumer_config.topics,
            "processed messages consumer initialized"
        );

        Ok(Self {
            consumer,
            revoked,
            topics: consumer_config.topics.clone(),
            handler: AckHandler::new(usecase),
            retry_backoff: Duration::from_millis(consumer_config.retry_backoff_ms),
            closed: CancellationToken::new(),
            running: tokio::sync::Mutex::new(()),
        })
    }

    /// Joins the group and consumes until `cancel` fires or the consumer is
    /// closed. Blocking; run it on its own task.
    pub async fn start_consume(&self, cancel: CancellationToken) {
        let _running = self.running.lock().await;
        if self.closed.is_cancelled() {
            warn!("start_consume on a closed consumer");
            return;
        }

        let topics: Vec<&str> = self.topics.iter().map(String::as_str).collect();
        if let Err(e) = self.consumer.subscribe(&topics) {
            error!(error = %e, topics = ?self.topics, "subscribe");
            return;
        }

        let stop = self.closed.child_token();
        let link = {
            let stop = stop.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => stop.cancel(),
                    _ = stop.cancelled() => {}
                }
            })
        };

        while !stop.is_cancelled() {
            let mut claim = KafkaClaim {
                consumer: &self.consumer,
                revoked: &self.revoked,
            };
            match consume_claim(&mut claim, &self.handler, &stop).await {
                SessionEnd::Stopped => break,
                SessionEnd::Released => debug!("claim released, waiting for next assignment"),
                SessionEnd::Failed => {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep(self.retry_backoff) => {}
                    }
                }
            }
        }

        link.abort();
        info!("processed messages consumer stopped");
    }

    /// Stops the consume loop, waits for its final commit and leaves the
    /// group.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] when called a second time.
    pub async fn close(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::Closed {
                component: "processed messages consumer",
            });
        }
        self.closed.cancel();

        let _stopped = self.running.lock().await;
        self.consumer.unsubscribe();
        info!("processed messages consumer is closed");
        Ok(())
    }
}
