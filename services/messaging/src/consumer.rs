//! Kafka consumer loop feeding the inbox.
//!
//! Offsets are committed per message and only after the handler returned
//! `Ok`. When the handler fails, the same message is handed to it again after
//! a backoff; the loop never moves past an unhandled message, so a crash
//! leaves it to be redelivered.

use crate::config::KafkaConfig;
use crate::headers;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers, Message as KafkaMessage};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Failed to create consumer: {0}")]
    CreationError(String),

    #[error("Failed to subscribe to topics: {0}")]
    SubscriptionError(String),

    #[error("Message processing error: {0}")]
    ProcessingError(String),
}

#[derive(Debug, Clone)]
pub struct MessageMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    /// Broker timestamp in milliseconds
    pub timestamp: Option<i64>,
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub payload: Vec<u8>,
    pub metadata: MessageMetadata,
}

impl IncomingMessage {
    pub fn key_str(&self) -> Option<String> {
        self.metadata
            .key
            .as_ref()
            .and_then(|k| String::from_utf8(k.clone()).ok())
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.metadata.headers.get(key).map(|s| s.as_str())
    }

    /// Producer-assigned event ID, the inbox deduplication key
    pub fn event_id(&self) -> Option<&str> {
        self.header(headers::EVENT_ID)
    }

    pub fn event_type(&self) -> Option<&str> {
        self.header(headers::EVENT_TYPE)
    }
}

#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &IncomingMessage) -> Result<(), ConsumerError>;

    async fn on_error(&self, message: &IncomingMessage, error: &ConsumerError) {
        warn!(
            topic = %message.metadata.topic,
            partition = message.metadata.partition,
            offset = message.metadata.offset,
            error = %error,
            "Message handling failed"
        );
    }
}

pub struct EventConsumer {
    consumer: StreamConsumer,
    retry_backoff: Duration,
}

impl EventConsumer {
    pub fn new(config: &KafkaConfig) -> Result<Self, ConsumerError> {
        info!(
            brokers = %config.bootstrap_servers,
            group = %config.consumer.group_id,
            "Creating Kafka consumer"
        );

        let consumer: StreamConsumer = config
            .build_consumer_config()
            .create()
            .map_err(|e| ConsumerError::CreationError(e.to_string()))?;

        Ok(Self {
            consumer,
            retry_backoff: Duration::from_secs(1),
        })
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn subscribe(&self, topics: &[&str]) -> Result<(), ConsumerError> {
        info!(?topics, "Subscribing to topics");
        self.consumer
            .subscribe(topics)
            .map_err(|e| ConsumerError::SubscriptionError(e.to_string()))
    }

    /// Consume until `shutdown` is cancelled or the stream ends.
    #[instrument(skip(self, handler, shutdown))]
    pub async fn run<H: MessageHandler>(
        &self,
        handler: Arc<H>,
        shutdown: CancellationToken,
    ) -> Result<(), ConsumerError> {
        let stream = self.consumer.stream();
        tokio::pin!(stream);

        info!("Starting message consumption loop");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Consumer received shutdown signal");
                    break;
                }
                next = stream.next() => {
                    match next {
                        Some(Ok(borrowed)) => {
                            let incoming = convert_message(&borrowed);

                            debug!(
                                topic = %incoming.metadata.topic,
                                partition = incoming.metadata.partition,
                                offset = incoming.metadata.offset,
                                "Received message"
                            );

                            if !self.handle_until_accepted(handler.as_ref(), &incoming, &shutdown).await {
                                break;
                            }

                            if let Err(e) = self.consumer.commit_message(&borrowed, CommitMode::Async) {
                                warn!(error = %e, "Failed to commit offset");
                            }
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "Kafka error");
                        }
                        None => {
                            debug!("Stream ended");
                            break;
                        }
                    }
                }
            }
        }

        if let Err(e) = self.consumer.commit_consumer_state(CommitMode::Sync) {
            // fails when no offsets are stored yet
            debug!(error = %e, "Final commit skipped");
        }

        Ok(())
    }

    /// Returns false when shutdown interrupted the retries.
    async fn handle_until_accepted<H: MessageHandler>(
        &self,
        handler: &H,
        message: &IncomingMessage,
        shutdown: &CancellationToken,
    ) -> bool {
        loop {
            match handler.handle(message).await {
                Ok(()) => return true,
                Err(e) => {
                    handler.on_error(message, &e).await;
                    tokio::select! {
                        _ = shutdown.cancelled() => return false,
                        _ = tokio::time::sleep(self.retry_backoff) => {}
                    }
                }
            }
        }
    }
}

fn convert_message(msg: &BorrowedMessage<'_>) -> IncomingMessage {
    let mut headers = HashMap::new();
    if let Some(h) = msg.headers() {
        for header in h.iter() {
            if let Some(value) = header.value {
                if let Ok(v) = std::str::from_utf8(value) {
                    headers.insert(header.key.to_string(), v.to_string());
                }
            }
        }
    }

    IncomingMessage {
        payload: msg.payload().unwrap_or(&[]).to_vec(),
        metadata: MessageMetadata {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key: msg.key().map(|k| k.to_vec()),
            timestamp: msg.timestamp().to_millis(),
            headers,
        },
    }
}
