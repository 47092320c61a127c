//! Profiles messaging - Kafka plumbing for the profiles service
//!
//! Thin, typed wrappers over rdkafka shared by both directions of the
//! event flow:
//!
//! - the outbox dispatcher publishes profile events with [`EventProducer`],
//!   waiting for the broker ack before a row is marked dispatched;
//! - the inbox ingress consumes account events with [`EventConsumer`],
//!   committing an offset only after its [`MessageHandler`] stored the event.
//!
//! # Example
//!
//! ```rust,no_run
//! use profiles_messaging::{headers, EventProducer, KafkaConfig, OutgoingMessage};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = KafkaConfig::new("localhost:9092");
//!     let producer = EventProducer::new(&config)?;
//!
//!     let message = OutgoingMessage::new(&config.topics.profiles, b"{}".to_vec())
//!         .with_key("account-id")
//!         .with_headers(headers::event_headers("event-id", "profile.updated", "profiles-svc"));
//!     producer.send(message).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod consumer;
pub mod headers;
pub mod producer;

pub use config::{
    ConfigError, ConsumerConfig, KafkaConfig, ProducerConfig, SaslConfig, SaslMechanism,
    SecurityProtocol, SslConfig, TopicConfig,
};
pub use consumer::{
    ConsumerError, EventConsumer, IncomingMessage, MessageHandler, MessageMetadata,
};
pub use producer::{DeliveryResult, EventProducer, OutgoingMessage, ProducerError};

/// Re-exported so handler implementations need no direct dependency
pub use async_trait::async_trait;
