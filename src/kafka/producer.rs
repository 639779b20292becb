//! Asynchronous publisher for created messages.
//!
//! [`MessageProducer::publish`] hands an envelope to a bounded input channel
//! and returns. A dispatch task moves envelopes into librdkafka, which
//! batches, compresses and retries them. Failures from either step land on
//! an error stream that a drain task logs for the lifetime of the producer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::client::ClientContext;
use rdkafka::config::RDKafkaLogLevel;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message as _;
use rdkafka::producer::{BaseRecord, DeliveryResult, Producer, ProducerContext, ThreadedProducer};
use rdkafka::util::Timeout;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::client::{client_config, forward_log};
use super::envelope::PublishEnvelope;
use crate::config::{KafkaConfig, ProducerConfig};
use crate::message::{Message, MessagePublisher};
use crate::{Error, Result};

/// Wait applied while the local librdkafka queue is full.
const QUEUE_FULL_BACKOFF: Duration = Duration::from_millis(50);

/// A message that could not be handed to, or delivered by, the broker.
#[derive(Debug)]
pub struct DeliveryFailure {
    pub topic: String,
    pub message_id: Option<i32>,
    pub cause: Error,
}

pub type FailureSender = mpsc::UnboundedSender<DeliveryFailure>;
pub type FailureReceiver = mpsc::UnboundedReceiver<DeliveryFailure>;

/// Destination of encoded envelopes.
///
/// Implemented by librdkafka's threaded producer. Asynchronous delivery
/// failures are reported on the [`FailureSender`] the sink was built with.
pub trait RecordSink: Send + Sync + 'static {
    fn enqueue(&self, topic: &str, message_id: i32, payload: &[u8])
        -> std::result::Result<(), KafkaError>;

    fn flush(&self, timeout: Duration) -> std::result::Result<(), KafkaError>;
}

/// Producer context forwarding failed delivery reports to the error stream.
pub struct DeliveryReportContext {
    failures: FailureSender,
}

impl DeliveryReportContext {
    pub fn new(failures: FailureSender) -> Self {
        Self { failures }
    }
}

impl ClientContext for DeliveryReportContext {
    fn log(&self, level: RDKafkaLogLevel, fac: &str, log_message: &str) {
        forward_log(level, fac, log_message);
    }
}

impl ProducerContext for DeliveryReportContext {
    type DeliveryOpaque = Box<i32>;

    fn delivery(&self, delivery_result: &DeliveryResult<'_>, message_id: Self::DeliveryOpaque) {
        match delivery_result {
            Ok(delivered) => {
                debug!(
                    message_id = *message_id,
                    partition = delivered.partition(),
                    offset = delivered.offset(),
                    "message delivered"
                );
            }
            Err((e, undelivered)) => {
                let _ = self.failures.send(DeliveryFailure {
                    topic: undelivered.topic().to_string(),
                    message_id: Some(*message_id),
                    cause: Error::Kafka(e.clone()),
                });
            }
        }
    }
}

impl RecordSink for ThreadedProducer<DeliveryReportContext> {
    fn enqueue(
        &self,
        topic: &str,
        message_id: i32,
        payload: &[u8],
    ) -> std::result::Result<(), KafkaError> {
        let record: BaseRecord<'_, (), [u8], Box<i32>> =
            BaseRecord::with_opaque_to(topic, Box::new(message_id)).payload(payload);
        self.send(record).map_err(|(e, _)| e)
    }

    fn flush(&self, timeout: Duration) -> std::result::Result<(), KafkaError> {
        Producer::flush(self, Timeout::After(timeout))
    }
}

struct Workers<S> {
    sink: Arc<S>,
    dispatcher: JoinHandle<()>,
    drain: JoinHandle<()>,
}

/// Fire-and-forget publisher of created messages.
pub struct MessageProducer<S: RecordSink = ThreadedProducer<DeliveryReportContext>> {
    topic: String,
    flush_timeout: Duration,
    input: Mutex<Option<mpsc::Sender<PublishEnvelope>>>,
    workers: tokio::sync::Mutex<Option<Workers<S>>>,
    failed: Arc<AtomicU64>,
}

impl MessageProducer {
    /// Creates the librdkafka producer and starts the background tasks.
    ///
    /// Acknowledgement is required from the partition leader only, payloads
    /// are compressed, retries are bounded with a fixed backoff, and batches
    /// flush on whichever of the byte, count or time threshold is hit first.
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        let producer_config = &config.producer;
        let (failures, failures_rx) = mpsc::unbounded_channel();

        let producer: ThreadedProducer<DeliveryReportContext> = client_config(config)
            .set("acks", "1")
            .set("compression.type", &producer_config.compression)
            .set("message.send.max.retries", producer_config.retry_max.to_string())
            .set("retry.backoff.ms", producer_config.retry_backoff_ms.to_string())
            .set("batch.size", producer_config.flush_bytes.to_string())
            .set("batch.num.messages", producer_config.flush_messages.to_string())
            .set("linger.ms", producer_config.flush_frequency_ms.to_string())
            .set("message.timeout.ms", producer_config.timeout_ms.to_string())
            .create_with_context(DeliveryReportContext::new(failures.clone()))?;

        info!(
            topic = %producer_config.topic,
            brokers = ?config.brokers,
            "messages producer initialized"
        );

        Ok(Self::start(producer, producer_config, failures, failures_rx))
    }
}

impl<S: RecordSink> MessageProducer<S> {
    /// Starts the dispatch and drain tasks around an existing sink.
    ///
    /// `failures` must be the sending half of the stream the sink reports
    /// to; the drain task ends once every sender is gone.
    pub fn start(
        sink: S,
        config: &ProducerConfig,
        failures: FailureSender,
        failures_rx: FailureReceiver,
    ) -> Self {
        let sink = Arc::new(sink);
        let (input, input_rx) = mpsc::channel(config.input_buffer.max(1));
        let failed = Arc::new(AtomicU64::new(0));

        let dispatcher = tokio::spawn(dispatch(
            sink.clone(),
            config.topic.clone(),
            input_rx,
            failures,
        ));
        let drain = tokio::spawn(drain_failures(failures_rx, failed.clone()));

        Self {
            topic: config.topic.clone(),
            flush_timeout: config.timeout(),
            input: Mutex::new(Some(input)),
            workers: tokio::sync::Mutex::new(Some(Workers {
                sink,
                dispatcher,
                drain,
            })),
            failed,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Number of messages reported as undeliverable so far.
    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Enqueues a message. Waits only while the input buffer is full.
    pub async fn produce(&self, message: &Message) {
        let envelope = PublishEnvelope::new(message);
        let input = self
            .input
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        match input {
            Some(input) => {
                if input.send(envelope).await.is_err() {
                    warn!(message_id = message.id, "producer input closed, message dropped");
                }
            }
            None => {
                warn!(message_id = message.id, "publish after close, message dropped");
            }
        }
    }

    /// Stops accepting messages, flushes what is queued and waits for the
    /// background tasks to finish.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] when called a second time, or the flush
    /// error if queued messages could not be delivered within the producer
    /// timeout.
    pub async fn close(&self) -> Result<()> {
        let Workers {
            sink,
            dispatcher,
            drain,
        } = self
            .workers
            .lock()
            .await
            .take()
            .ok_or(Error::Closed {
                component: "messages producer",
            })?;

        self.input
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        if let Err(e) = dispatcher.await {
            error!(error = %e, "producer dispatch task failed");
        }

        let timeout = self.flush_timeout;
        let flushed = tokio::task::spawn_blocking(move || {
            let flushed = sink.flush(timeout);
            drop(sink);
            flushed
        })
        .await?;

        if let Err(e) = drain.await {
            error!(error = %e, "producer error drain task failed");
        }

        flushed?;
        info!(
            topic = %self.topic,
            failed = self.failed_count(),
            "messages producer is closed"
        );
        Ok(())
    }
}

#[async_trait]
impl<S: RecordSink> MessagePublisher for MessageProducer<S> {
    async fn publish(&self, message: &Message) {
        self.produce(message).await
    }
}

async fn dispatch<S: RecordSink>(
    sink: Arc<S>,
    topic: String,
    mut input: mpsc::Receiver<PublishEnvelope>,
    failures: FailureSender,
) {
    while let Some(envelope) = input.recv().await {
        let payload = match envelope.encode() {
            Ok(payload) => payload,
            Err(e) => {
                let _ = failures.send(DeliveryFailure {
                    topic: topic.clone(),
                    message_id: Some(envelope.id),
                    cause: e,
                });
                continue;
            }
        };

        loop {
            match sink.enqueue(&topic, envelope.id, payload) {
                Ok(()) => break,
                Err(KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull)) => {
                    debug!(message_id = envelope.id, "local producer queue full, waiting");
                    tokio::time::sleep(QUEUE_FULL_BACKOFF).await;
                }
                Err(e) => {
                    let _ = failures.send(DeliveryFailure {
                        topic: topic.clone(),
                        message_id: Some(envelope.id),
                        cause: Error::Kafka(e),
                    });
                    break;
                }
            }
        }
    }
    debug!(topic = %topic, "producer input closed, dispatch finished");
}

async fn drain_failures(mut failures: FailureReceiver, failed: Arc<AtomicU64>) {
    while let Some(failure) = failures.recv().await {
        failed.fetch_add(1, Ordering::Relaxed);
        error!(
            topic = %failure.topic,
            message_id = ?failure.message_id,
            error = %failure.cause,
            "messages producer error"
        );
    }
}
