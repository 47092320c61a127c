//! Transactional outbox.
//!
//! Profile mutations insert an [`OutboxEvent`] in the same transaction as the
//! row change. The [`OutboxDispatcher`] later ships pending rows to the
//! broker and marks each one dispatched only after the broker acknowledged
//! it, so delivery is at-least-once. Rows are kept after dispatch.

use crate::config::OutboxConfig;
use crate::contracts::{
    ProfileCreated, ProfileDeleted, ProfileOfficialUpdated, ProfileUpdated, PROFILE_CREATED,
    PROFILE_DELETED, PROFILE_OFFICIAL_UPDATED, PROFILE_UPDATED,
};
use crate::models::Profile;
use crate::store::OutboxStore;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use profiles_messaging::{headers, EventProducer, OutgoingMessage};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    Pending,
    Dispatched,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Dispatched => "dispatched",
        }
    }
}

/// Row of the `outbox_events` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct OutboxEvent {
    /// Also sent as the `event_id` header; consumers deduplicate on it
    pub id: Uuid,
    pub topic: String,
    pub event_type: String,
    /// Partition key, the affected account ID
    pub key: String,
    pub payload: serde_json::Value,
    /// Flat JSON object of header name to value
    pub headers: serde_json::Value,
    pub status: String,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub next_attempt_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
}

impl OutboxEvent {
    pub fn new<T: Serialize>(
        topic: &str,
        event_type: &str,
        key: impl ToString,
        payload: &T,
        producer: &str,
    ) -> Result<Self> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let headers: serde_json::Map<String, serde_json::Value> =
            headers::event_headers(id, event_type, producer)
                .into_iter()
                .map(|(k, v)| (k, serde_json::Value::String(v)))
                .collect();

        Ok(Self {
            id,
            topic: topic.to_string(),
            event_type: event_type.to_string(),
            key: key.to_string(),
            payload: serde_json::to_value(payload).context("Failed to encode event payload")?,
            headers: serde_json::Value::Object(headers),
            status: OutboxStatus::Pending.as_str().to_string(),
            attempts: 0,
            last_error: None,
            next_attempt_at: now,
            created_at: now,
            dispatched_at: None,
        })
    }

    pub fn is_dispatched(&self) -> bool {
        self.status == OutboxStatus::Dispatched.as_str()
    }

    pub fn header_pairs(&self) -> Vec<(String, String)> {
        self.headers
            .as_object()
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Builds the outbox events written alongside profile mutations
#[derive(Debug, Clone)]
pub struct OutboxWriter {
    topic: String,
    producer: String,
}

impl OutboxWriter {
    pub fn new(topic: impl Into<String>, producer: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            producer: producer.into(),
        }
    }

    pub fn profile_created(&self, profile: &Profile) -> Result<OutboxEvent> {
        self.event(PROFILE_CREATED, profile.account_id, &ProfileCreated::from(profile))
    }

    pub fn profile_updated(&self, profile: &Profile) -> Result<OutboxEvent> {
        self.event(PROFILE_UPDATED, profile.account_id, &ProfileUpdated::from(profile))
    }

    pub fn profile_official_updated(&self, profile: &Profile) -> Result<OutboxEvent> {
        self.event(
            PROFILE_OFFICIAL_UPDATED,
            profile.account_id,
            &ProfileOfficialUpdated::from(profile),
        )
    }

    pub fn profile_deleted(&self, account_id: Uuid) -> Result<OutboxEvent> {
        let payload = ProfileDeleted {
            account_id,
            deleted_at: Utc::now(),
        };
        self.event(PROFILE_DELETED, account_id, &payload)
    }

    fn event<T: Serialize>(&self, event_type: &str, key: Uuid, payload: &T) -> Result<OutboxEvent> {
        OutboxEvent::new(&self.topic, event_type, key, payload, &self.producer)
    }
}

/// Ships one outbox event to the broker
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Resolves once the broker acknowledged the event
    async fn publish(&self, event: &OutboxEvent) -> Result<()>;
}

pub struct KafkaEventPublisher {
    producer: EventProducer,
}

impl KafkaEventPublisher {
    pub fn new(producer: EventProducer) -> Self {
        Self { producer }
    }
}

#[async_trait]
impl EventPublisher for KafkaEventPublisher {
    async fn publish(&self, event: &OutboxEvent) -> Result<()> {
        let payload = serde_json::to_vec(&event.payload).context("Failed to encode payload")?;
        let message = OutgoingMessage::new(&event.topic, payload)
            .with_key(&event.key)
            .with_headers(event.header_pairs());

        self.producer
            .send(message)
            .await
            .with_context(|| format!("Failed to publish event {}", event.id))?;
        Ok(())
    }
}

/// Background loop draining the outbox table
pub struct OutboxDispatcher {
    store: Arc<dyn OutboxStore>,
    publisher: Arc<dyn EventPublisher>,
    config: OutboxConfig,
}

impl OutboxDispatcher {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        publisher: Arc<dyn EventPublisher>,
        config: OutboxConfig,
    ) -> Self {
        Self {
            store,
            publisher,
            config,
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval_ms,
            "Outbox dispatcher started"
        );

        loop {
            let full_batch = match self.dispatch_batch(&shutdown).await {
                Ok(claimed) => claimed >= self.config.batch_size as usize,
                Err(e) => {
                    error!(error = %e, "Outbox poll failed");
                    false
                }
            };

            if shutdown.is_cancelled() {
                break;
            }
            // More rows are probably waiting
            if full_batch {
                continue;
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
            }
        }

        info!("Outbox dispatcher stopped");
    }

    /// Claim and publish one batch. Returns how many rows were claimed.
    #[instrument(skip(self, shutdown))]
    pub async fn dispatch_batch(&self, shutdown: &CancellationToken) -> Result<usize> {
        let events = self
            .store
            .claim_pending(self.config.batch_size, self.config.lease())
            .await?;

        if events.is_empty() {
            return Ok(0);
        }
        debug!(count = events.len(), "Claimed outbox events");

        for event in &events {
            // Unpublished claims become due again when their lease runs out
            if shutdown.is_cancelled() {
                break;
            }
            self.dispatch(event).await;
        }

        Ok(events.len())
    }

    async fn dispatch(&self, event: &OutboxEvent) {
        match self.publisher.publish(event).await {
            Ok(()) => {
                metrics::counter!("profiles_outbox_dispatched_total").increment(1);
                if let Err(e) = self.store.mark_dispatched(event.id).await {
                    // The event will be published again; consumers deduplicate
                    error!(event_id = %event.id, error = %e, "Failed to mark outbox event dispatched");
                }
            }
            Err(e) => {
                metrics::counter!("profiles_outbox_failed_total").increment(1);
                let attempts = event.attempts.max(0) as u32 + 1;
                let backoff = self.config.retry_backoff(attempts);
                let next_attempt_at = Utc::now()
                    + chrono::Duration::from_std(backoff).unwrap_or(chrono::Duration::zero());

                warn!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    attempts,
                    error = %e,
                    "Outbox publish failed"
                );

                if let Err(e) = self
                    .store
                    .mark_failed(event.id, &format!("{e:#}"), next_attempt_at)
                    .await
                {
                    error!(event_id = %event.id, error = %e, "Failed to record outbox failure");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryStore, RecordingPublisher};
    use crate::store::{ProfileStore, StoreTx};
    use std::time::Duration;

    fn writer() -> OutboxWriter {
        OutboxWriter::new("profiles.v1", "profiles-svc")
    }

    async fn store_with_events(count: usize) -> (InMemoryStore, Vec<Uuid>) {
        let store = InMemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let mut ids = Vec::new();
        for i in 0..count {
            let profile = Profile::new(Uuid::new_v4(), format!("user{i}"));
            let event = writer().profile_created(&profile).unwrap();
            ids.push(event.id);
            tx.insert_outbox_event(&event).await.unwrap();
        }
        tx.commit().await.unwrap();
        (store, ids)
    }

    fn config() -> OutboxConfig {
        OutboxConfig {
            batch_size: 2,
            ..OutboxConfig::default()
        }
    }

    #[test]
    fn test_event_carries_standard_headers() {
        let profile = Profile::new(Uuid::new_v4(), "alice");
        let event = writer().profile_updated(&profile).unwrap();
        let headers = event.header_pairs();
        let get = |k: &str| headers.iter().find(|(key, _)| key == k).map(|(_, v)| v.clone());

        assert_eq!(event.key, profile.account_id.to_string());
        assert_eq!(get(headers::EVENT_ID), Some(event.id.to_string()));
        assert_eq!(get(headers::EVENT_TYPE).as_deref(), Some("profile.updated"));
        assert_eq!(get(headers::PRODUCER).as_deref(), Some("profiles-svc"));
        assert_eq!(event.payload["username"], "alice");
        assert!(!event.is_dispatched());
    }

    #[tokio::test]
    async fn test_dispatch_marks_after_ack_and_keeps_rows() {
        let (store, ids) = store_with_events(3).await;
        let store = Arc::new(store);
        let publisher = Arc::new(RecordingPublisher::new());
        let dispatcher = OutboxDispatcher::new(store.clone(), publisher.clone(), config());
        let shutdown = CancellationToken::new();

        assert_eq!(dispatcher.dispatch_batch(&shutdown).await.unwrap(), 2);
        assert_eq!(dispatcher.dispatch_batch(&shutdown).await.unwrap(), 1);
        assert_eq!(dispatcher.dispatch_batch(&shutdown).await.unwrap(), 0);

        let published: Vec<Uuid> = publisher.published().iter().map(|e| e.id).collect();
        assert_eq!(published, ids);

        let rows = store.outbox_events().await;
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|e| e.is_dispatched() && e.dispatched_at.is_some()));
    }

    #[tokio::test]
    async fn test_failed_publish_is_retried_later() {
        let (store, ids) = store_with_events(1).await;
        let store = Arc::new(store);
        let publisher = Arc::new(RecordingPublisher::new());
        publisher.set_failing(true);
        let dispatcher = OutboxDispatcher::new(store.clone(), publisher.clone(), config());
        let shutdown = CancellationToken::new();

        assert_eq!(dispatcher.dispatch_batch(&shutdown).await.unwrap(), 1);

        let rows = store.outbox_events().await;
        let row = &rows[0];
        assert_eq!(row.id, ids[0]);
        assert!(!row.is_dispatched());
        assert_eq!(row.attempts, 1);
        assert!(row.last_error.is_some());
        assert!(row.next_attempt_at > Utc::now());

        // Not due yet
        publisher.set_failing(false);
        assert_eq!(dispatcher.dispatch_batch(&shutdown).await.unwrap(), 0);
        assert!(publisher.published().is_empty());
    }

    #[tokio::test]
    async fn test_publish_errors_do_not_stop_the_batch() {
        let (store, ids) = store_with_events(2).await;
        let store = Arc::new(store);
        let mut publisher = MockEventPublisher::new();
        let first = ids[0];
        publisher
            .expect_publish()
            .times(2)
            .returning(move |event| {
                if event.id == first {
                    Err(anyhow::anyhow!("broker unavailable"))
                } else {
                    Ok(())
                }
            });
        let dispatcher = OutboxDispatcher::new(store.clone(), Arc::new(publisher), config());

        dispatcher.dispatch_batch(&CancellationToken::new()).await.unwrap();

        let rows = store.outbox_events().await;
        assert!(!rows[0].is_dispatched());
        assert!(rows[1].is_dispatched());
    }

    #[tokio::test]
    async fn test_run_drains_then_stops_on_shutdown() {
        let (store, _) = store_with_events(5).await;
        let store = Arc::new(store);
        let publisher = Arc::new(RecordingPublisher::new());
        let dispatcher = Arc::new(OutboxDispatcher::new(
            store.clone(),
            publisher.clone(),
            OutboxConfig {
                batch_size: 2,
                poll_interval_ms: 10,
                ..OutboxConfig::default()
            },
        ));
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn({
            let dispatcher = dispatcher.clone();
            let shutdown = shutdown.clone();
            async move { dispatcher.run(shutdown).await }
        });

        for _ in 0..100 {
            if publisher.published().len() == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(publisher.published().len(), 5);
    }
}
