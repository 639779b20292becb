use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::message::Message;
use crate::{Error, Result};

/// Wire form of a created message on the publish topic.
///
/// The payload is encoded as soon as the envelope is built; an encoding
/// failure is kept and only surfaces when [`PublishEnvelope::encode`] is
/// called.
#[derive(Debug, Clone)]
pub struct PublishEnvelope {
    pub id: i32,
    encoded: std::result::Result<Bytes, String>,
}

#[derive(Serialize)]
struct PublishPayload<'a> {
    id: i32,
    content: &'a str,
    processed: bool,
}

impl PublishEnvelope {
    pub fn new(message: &Message) -> Self {
        let payload = PublishPayload {
            id: message.id,
            content: &message.content,
            processed: message.processed,
        };
        let encoded = serde_json::to_vec(&payload)
            .map(Bytes::from)
            .map_err(|e| e.to_string());

        Self {
            id: message.id,
            encoded,
        }
    }

    pub fn encode(&self) -> Result<&[u8]> {
        match &self.encoded {
            Ok(bytes) => Ok(&bytes[..]),
            Err(e) => Err(Error::Encode(e.clone())),
        }
    }

    pub fn len(&self) -> usize {
        self.encoded.as_ref().map(Bytes::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Acknowledgement read from the processed topic. Only the id travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckEnvelope {
    pub id: i32,
}

impl AckEnvelope {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(Into::into)
    }

    /// The message this acknowledgement marks as processed.
    pub fn into_message(self) -> Message {
        Message::processed_ack(self.id)
    }
}
