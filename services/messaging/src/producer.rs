//! Kafka producer used by the outbox dispatcher.
//!
//! `send` resolves only after the broker acknowledged the record (or the
//! delivery timeout expired), which is what lets the dispatcher mark an
//! outbox row as dispatched.

use crate::config::KafkaConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("Failed to create producer: {0}")]
    CreationError(String),

    #[error("Failed to send message to topic {topic}: {message}")]
    SendError { topic: String, message: String },

    #[error("Producer timeout after {0:?}")]
    Timeout(Duration),
}

/// Broker acknowledgement for one record
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
}

/// Record to publish
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub topic: String,
    /// Partition key; profile events use the account ID
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl OutgoingMessage {
    pub fn new(topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            payload,
            headers: Vec::new(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn with_headers<I>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.headers.extend(headers);
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn kafka_headers(&self) -> OwnedHeaders {
        self.headers
            .iter()
            .fold(OwnedHeaders::new_with_capacity(self.headers.len()), |acc, (k, v)| {
                acc.insert(Header {
                    key: k.as_str(),
                    value: Some(v.as_bytes()),
                })
            })
    }
}

pub struct EventProducer {
    producer: FutureProducer,
    delivery_timeout: Duration,
}

impl EventProducer {
    pub fn new(config: &KafkaConfig) -> Result<Self, ProducerError> {
        info!(
            brokers = %config.bootstrap_servers,
            client_id = %config.client_id,
            "Creating Kafka producer"
        );

        let producer: FutureProducer = config
            .build_producer_config()
            .create()
            .map_err(|e| ProducerError::CreationError(e.to_string()))?;

        Ok(Self {
            producer,
            delivery_timeout: config.delivery_timeout(),
        })
    }

    /// Publish a record and wait for the broker ack
    #[instrument(skip(self, message), fields(topic = %message.topic, key = ?message.key))]
    pub async fn send(&self, message: OutgoingMessage) -> Result<DeliveryResult, ProducerError> {
        let mut record: FutureRecord<'_, str, [u8]> = FutureRecord::to(&message.topic)
            .payload(message.payload.as_slice())
            .headers(message.kafka_headers());

        if let Some(ref key) = message.key {
            record = record.key(key.as_str());
        }

        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(self.delivery_timeout))
            .await
            .map_err(|(e, _)| ProducerError::SendError {
                topic: message.topic.clone(),
                message: e.to_string(),
            })?;

        debug!(partition, offset, "Message acknowledged by broker");

        Ok(DeliveryResult {
            topic: message.topic,
            partition,
            offset,
            key: message.key,
        })
    }

    pub fn flush(&self, timeout: Duration) -> Result<(), ProducerError> {
        self.producer
            .flush(Timeout::After(timeout))
            .map_err(|_| ProducerError::Timeout(timeout))
    }
}

impl Drop for EventProducer {
    fn drop(&mut self) {
        info!("Shutting down Kafka producer");
        if let Err(e) = self.flush(Duration::from_secs(5)) {
            warn!(error = %e, "Failed to flush producer on shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers;

    #[test]
    fn test_outgoing_message_builder() {
        let message = OutgoingMessage::new("profiles.v1", b"{}".to_vec())
            .with_key("7c1b0b1e-0000-0000-0000-000000000001")
            .with_headers(headers::event_headers("e-1", "profile.created", "profiles-svc"))
            .with_header("trace", "t-1");

        assert_eq!(message.key.as_deref(), Some("7c1b0b1e-0000-0000-0000-000000000001"));
        assert_eq!(message.headers.len(), 6);
        assert_eq!(message.header(headers::EVENT_TYPE), Some("profile.created"));
        assert_eq!(message.header("missing"), None);
    }

    #[test]
    fn test_kafka_headers_keep_every_entry() {
        use rdkafka::message::Headers;

        let message = OutgoingMessage::new("t", vec![])
            .with_headers(headers::event_headers("e-2", "profile.deleted", "profiles-svc"));
        let kafka_headers = message.kafka_headers();

        assert_eq!(kafka_headers.count(), 5);
        let first = kafka_headers.get(0);
        assert_eq!(first.key, headers::EVENT_ID);
        assert_eq!(first.value, Some(b"e-2".as_slice()));
    }
}
