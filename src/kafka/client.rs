use rdkafka::config::RDKafkaLogLevel;
use rdkafka::ClientConfig;
use tracing::{debug, error, info, warn};

use crate::config::KafkaConfig;

/// Base client configuration shared by the producer and the consumer.
pub fn client_config(config: &KafkaConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", config.brokers.join(","))
        .set("client.id", &config.client_id)
        .set_log_level(RDKafkaLogLevel::Info);
    client_config
}

/// Routes a librdkafka log line into `tracing`.
pub(crate) fn forward_log(level: RDKafkaLogLevel, facility: &str, message: &str) {
    match level {
        RDKafkaLogLevel::Emerg
        | RDKafkaLogLevel::Alert
        | RDKafkaLogLevel::Critical
        | RDKafkaLogLevel::Error => error!(target: "librdkafka", facility, "{}", message),
        RDKafkaLogLevel::Warning => warn!(target: "librdkafka", facility, "{}", message),
        RDKafkaLogLevel::Notice | RDKafkaLogLevel::Info => {
            info!(target: "librdkafka", facility, "{}", message)
        }
        RDKafkaLogLevel::Debug => debug!(target: "librdkafka", facility, "{}", message),
    }
}
