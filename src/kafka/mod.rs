pub mod client;
pub mod consumer;
pub mod envelope;
pub mod producer;


pub use consumer::{
    consume_claim, AckConsumer, AckHandler, AckRecord, ClaimSession, HandleOutcome,
    ProcessedAckUsecase, SessionEnd,
};
pub use envelope::{AckEnvelope, PublishEnvelope};
pub use producer::{DeliveryFailure, DeliveryReportContext, MessageProducer, RecordSink};
