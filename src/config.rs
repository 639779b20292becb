use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::{Error, Result};

/// Environment variable prefix; nested keys are separated by `__`,
/// e.g. `RELAY_KAFKA__PRODUCER__TOPIC`.
pub const ENV_PREFIX: &str = "RELAY";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub environment: Environment,
    /// Default log level when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    pub http: HttpConfig,
    pub postgres: PostgresConfig,
    pub kafka: KafkaConfig,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Production,
    Testing,
}

impl Environment {
    pub fn is_prod(&self) -> bool {
        matches!(self, Environment::Production)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Production => "production",
            Environment::Testing => "testing",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpConfig {
    pub addr: String,
    /// Whole-request deadline answered with 408; 0 disables it.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Deadline for reading a request body; 0 disables it.
    #[serde(default)]
    pub read_timeout_ms: u64,
    /// Deadline for streaming a response body; 0 disables it.
    #[serde(default)]
    pub write_timeout_ms: u64,
    /// Upper bound on the summed size of request header names and values;
    /// 0 disables the check.
    #[serde(default = "default_max_header_bytes")]
    pub max_header_bytes: usize,
    /// Create requests allowed per minute; 0 disables the limit.
    #[serde(default)]
    pub create_per_minute: u32,
    /// Stats requests allowed per minute; 0 disables the limit.
    #[serde(default)]
    pub stats_per_minute: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PostgresConfig {
    pub connection_url: String,
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: usize,
    #[serde(default)]
    pub migrate: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaConfig {
    #[serde(default = "default_client_id")]
    pub client_id: String,
    pub brokers: Vec<String>,
    pub producer: ProducerConfig,
    pub consumer: ConsumerConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProducerConfig {
    pub topic: String,
    #[serde(default = "default_producer_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_retry_max")]
    pub retry_max: u32,
    #[serde(default = "default_producer_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Best-effort number of bytes that triggers a flush.
    #[serde(default = "default_flush_bytes")]
    pub flush_bytes: usize,
    /// Best-effort number of messages that triggers a flush.
    #[serde(default = "default_flush_messages")]
    pub flush_messages: usize,
    /// Best-effort flush frequency.
    #[serde(default = "default_flush_frequency_ms")]
    pub flush_frequency_ms: u64,
    #[serde(default = "default_compression")]
    pub compression: String,
    /// Capacity of the publish input channel; callers wait when it is full.
    #[serde(default = "default_input_buffer")]
    pub input_buffer: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConsumerConfig {
    pub group: String,
    pub topics: Vec<String>,
    #[serde(default = "default_consumer_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
    #[serde(default = "default_fetch_min_bytes")]
    pub fetch_min_bytes: u32,
    #[serde(default = "default_fetch_default_bytes")]
    pub fetch_default_bytes: u32,
    #[serde(default)]
    pub fetch_max_bytes: Option<u32>,
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
    #[serde(default = "default_auto_commit_interval_ms")]
    pub auto_commit_interval_ms: u64,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("kafka.brokers")
                    .with_list_parse_key("kafka.consumer.topics")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.log_level.parse::<tracing::Level>().is_err() {
            return Err(Error::Validation(format!(
                "log_level {:?} is not one of trace, debug, info, warn, error",
                self.log_level
            )));
        }
        if self.shutdown_timeout_ms == 0 {
            return Err(Error::Validation(
                "shutdown_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.http.addr.trim().is_empty() {
            return Err(Error::Validation("http.addr is required".to_string()));
        }
        if self.postgres.connection_url.trim().is_empty() {
            return Err(Error::Validation(
                "postgres.connection_url is required".to_string(),
            ));
        }
        if self.kafka.brokers.iter().all(|b| b.trim().is_empty()) {
            return Err(Error::Validation("kafka.brokers is required".to_string()));
        }
        if self.kafka.producer.topic.trim().is_empty() {
            return Err(Error::Validation(
                "kafka.producer.topic is required".to_string(),
            ));
        }
        if self.kafka.consumer.group.trim().is_empty() {
            return Err(Error::Validation(
                "kafka.consumer.group is required".to_string(),
            ));
        }
        if self.kafka.consumer.topics.is_empty() {
            return Err(Error::Validation(
                "kafka.consumer.topics is required".to_string(),
            ));
        }
        Ok(())
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Human-readable list of the environment keys the loader recognises.
    pub fn env_description() -> String {
        let keys: [(&str, &str); 18] = [
            ("ENVIRONMENT", "development | production | testing"),
            ("LOG_LEVEL", "trace | debug | info | warn | error, default info"),
            ("SHUTDOWN_TIMEOUT_MS", "teardown deadline, default 10000"),
            ("HTTP__ADDR", "required, listen address"),
            ("HTTP__REQUEST_TIMEOUT_MS", "default 30000, 0 disables"),
            ("HTTP__READ_TIMEOUT_MS", "request body deadline, 0 disables"),
            ("HTTP__WRITE_TIMEOUT_MS", "response body deadline, 0 disables"),
            ("HTTP__MAX_HEADER_BYTES", "default 1048576, 0 disables"),
            ("HTTP__CREATE_PER_MINUTE", "0 disables the limit"),
            ("HTTP__STATS_PER_MINUTE", "0 disables the limit"),
            ("POSTGRES__CONNECTION_URL", "required"),
            ("POSTGRES__MAX_POOL_SIZE", "default 16"),
            ("POSTGRES__MIGRATE", "default false"),
            ("KAFKA__CLIENT_ID", "default message-relay"),
            ("KAFKA__BROKERS", "required, comma separated"),
            ("KAFKA__PRODUCER__TOPIC", "required"),
            ("KAFKA__CONSUMER__GROUP", "required"),
            ("KAFKA__CONSUMER__TOPICS", "required, comma separated"),
        ];

        keys.iter()
            .map(|(key, help)| format!("  {}_{}\t{}", ENV_PREFIX, key, help))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl HttpConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.request_timeout_ms)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.write_timeout_ms)
    }
}

fn non_zero_millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl ProducerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_shutdown_timeout_ms() -> u64 {
    10_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_max_header_bytes() -> usize {
    1 << 20
}

fn default_max_pool_size() -> usize {
    16
}

fn default_client_id() -> String {
    "message-relay".to_string()
}

fn default_producer_timeout_ms() -> u64 {
    10_000
}

fn default_retry_max() -> u32 {
    3
}

fn default_producer_retry_backoff_ms() -> u64 {
    100
}

fn default_flush_bytes() -> usize {
    16384
}

fn default_flush_messages() -> usize {
    10_000
}

fn default_flush_frequency_ms() -> u64 {
    5
}

fn default_compression() -> String {
    "snappy".to_string()
}

fn default_input_buffer() -> usize {
    256
}

fn default_consumer_retry_backoff_ms() -> u64 {
    2_000
}

fn default_max_wait_ms() -> u64 {
    500
}

fn default_fetch_min_bytes() -> u32 {
    1
}

fn default_fetch_default_bytes() -> u32 {
    1_048_576 // 1MB
}

fn default_session_timeout_ms() -> u64 {
    30_000
}

fn default_auto_commit_interval_ms() -> u64 {
    1_000
}
