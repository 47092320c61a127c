//! Inbox for account events.
//!
//! [`InboxIngress`] stores every consumed message under its producer event
//! ID before the offset is committed; a redelivered message hits the same ID
//! and is dropped. [`InboxWorker`]s apply stored events on their own cadence
//! and classify each outcome, so a failing event is retried later without
//! holding up the topic or the rest of its batch.
//!
//! Events are applied without per-account sequence numbers. Redelivered or
//! late events for one account resolve as last write wins.

use crate::config::{InboxConfig, UnknownEventPolicy};
use crate::contracts::{
    AccountCreated, AccountDeleted, AccountUsernameUpdated, ACCOUNT_CREATED, ACCOUNT_DELETED,
    ACCOUNT_USERNAME_UPDATED,
};
use crate::error::ProfileResult;
use crate::store::InboxStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use profiles_messaging::{ConsumerError, IncomingMessage, MessageHandler};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxStatus {
    Pending,
    Processed,
    Failed,
}

impl InboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InboxStatus::Pending => "pending",
            InboxStatus::Processed => "processed",
            InboxStatus::Failed => "failed",
        }
    }
}

/// Row of the `inbox_events` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct InboxEvent {
    /// Producer-assigned event ID
    pub id: Uuid,
    pub topic: String,
    pub event_type: String,
    pub key: Option<String>,
    pub payload: serde_json::Value,
    pub status: String,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub next_retry_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl InboxEvent {
    pub fn pending(
        id: Uuid,
        topic: impl Into<String>,
        event_type: impl Into<String>,
        key: Option<String>,
        payload: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            topic: topic.into(),
            event_type: event_type.into(),
            key,
            payload,
            status: InboxStatus::Pending.as_str().to_string(),
            attempts: 0,
            last_error: None,
            next_retry_at: now,
            created_at: now,
            processed_at: None,
        }
    }

    pub fn has_status(&self, status: InboxStatus) -> bool {
        self.status == status.as_str()
    }
}

/// Domain operations behind the account events
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AccountEventHandler: Send + Sync {
    async fn account_created(&self, account_id: Uuid, username: &str) -> ProfileResult<()>;

    async fn account_username_updated(&self, account_id: Uuid, username: &str)
        -> ProfileResult<()>;

    async fn account_deleted(&self, account_id: Uuid) -> ProfileResult<()>;
}

/// Consumer callback that persists messages into the inbox
pub struct InboxIngress {
    store: Arc<dyn InboxStore>,
}

impl InboxIngress {
    pub fn new(store: Arc<dyn InboxStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl MessageHandler for InboxIngress {
    async fn handle(&self, message: &IncomingMessage) -> Result<(), ConsumerError> {
        let Some(event_id) = message.event_id().and_then(|id| Uuid::parse_str(id).ok()) else {
            // Cannot be deduplicated, so it is never stored
            warn!(
                topic = %message.metadata.topic,
                offset = message.metadata.offset,
                "Skipping message without a valid event_id header"
            );
            metrics::counter!("profiles_inbox_skipped_total").increment(1);
            return Ok(());
        };

        // Non-JSON bodies are kept verbatim and rejected by the worker
        let payload = serde_json::from_slice(&message.payload).unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(&message.payload).into_owned())
        });

        let event = InboxEvent::pending(
            event_id,
            &message.metadata.topic,
            message.event_type().unwrap_or_default(),
            message.key_str(),
            payload,
        );

        let inserted = self
            .store
            .insert_inbox_event(&event)
            .await
            .map_err(|e| ConsumerError::ProcessingError(format!("{e:#}")))?;

        if inserted {
            debug!(event_id = %event_id, event_type = %event.event_type, "Inbox event stored");
        } else {
            debug!(event_id = %event_id, "Duplicate delivery ignored");
            metrics::counter!("profiles_inbox_duplicate_total").increment(1);
        }
        Ok(())
    }
}

/// How one event attempt ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Processed,
    Failed(String),
    Retry(String),
}

/// Periodic loop applying pending inbox events
pub struct InboxWorker {
    id: usize,
    store: Arc<dyn InboxStore>,
    handler: Arc<dyn AccountEventHandler>,
    config: InboxConfig,
}

impl InboxWorker {
    pub fn new(
        id: usize,
        store: Arc<dyn InboxStore>,
        handler: Arc<dyn AccountEventHandler>,
        config: InboxConfig,
    ) -> Self {
        Self {
            id,
            store,
            handler,
            config,
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        info!(worker = self.id, tick_ms = self.config.tick_ms, "Inbox worker started");

        let mut ticker = tokio::time::interval(self.config.tick());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.process_batch(&shutdown).await {
                error!(worker = self.id, error = %e, "Inbox poll failed");
            }
        }

        info!(worker = self.id, "Inbox worker stopped");
    }

    /// Claim one batch and drive every event to its next state.
    /// Returns how many events were claimed.
    pub async fn process_batch(&self, shutdown: &CancellationToken) -> anyhow::Result<usize> {
        let events = self
            .store
            .claim_pending(self.config.batch_size, self.config.lease())
            .await?;

        for event in &events {
            // Claimed but untouched events are picked up again after the lease
            if shutdown.is_cancelled() {
                break;
            }
            let outcome = self.apply(event).await;
            self.record(event, outcome).await;
        }

        Ok(events.len())
    }

    async fn apply(&self, event: &InboxEvent) -> Outcome {
        debug!(worker = self.id, event_id = %event.id, event_type = %event.event_type, "Applying inbox event");

        let result = match event.event_type.as_str() {
            ACCOUNT_CREATED => match decode::<AccountCreated>(event) {
                Ok(p) => self.handler.account_created(p.account_id, &p.username).await,
                Err(outcome) => return outcome,
            },
            ACCOUNT_USERNAME_UPDATED => match decode::<AccountUsernameUpdated>(event) {
                Ok(p) => {
                    self.handler
                        .account_username_updated(p.account_id, &p.new_username)
                        .await
                }
                Err(outcome) => return outcome,
            },
            ACCOUNT_DELETED => match decode::<AccountDeleted>(event) {
                Ok(p) => self.handler.account_deleted(p.account_id).await,
                Err(outcome) => return outcome,
            },
            other => {
                warn!(event_id = %event.id, event_type = %other, "Unknown inbox event type");
                return match self.config.unknown_event_policy {
                    UnknownEventPolicy::Processed => Outcome::Processed,
                    UnknownEventPolicy::Failed => {
                        Outcome::Failed(format!("unknown event type '{other}'"))
                    }
                };
            }
        };

        match result {
            Ok(()) => Outcome::Processed,
            Err(e) if e.is_rejection() => {
                warn!(event_id = %event.id, code = e.code(), error = %e, "Inbox event rejected by domain");
                Outcome::Processed
            }
            Err(e) => Outcome::Retry(format!("{e}")),
        }
    }

    async fn record(&self, event: &InboxEvent, outcome: Outcome) {
        let result = match &outcome {
            Outcome::Processed => {
                metrics::counter!("profiles_inbox_processed_total").increment(1);
                self.store.mark_processed(event.id).await
            }
            Outcome::Failed(reason) => {
                metrics::counter!("profiles_inbox_failed_total").increment(1);
                self.store.mark_failed(event.id, reason).await
            }
            Outcome::Retry(reason) => {
                metrics::counter!("profiles_inbox_retried_total").increment(1);
                warn!(event_id = %event.id, error = %reason, "Inbox event will be retried");
                let delay = chrono::Duration::from_std(self.config.retry_delay())
                    .unwrap_or(chrono::Duration::minutes(1));
                self.store
                    .reschedule(event.id, reason, Utc::now() + delay)
                    .await
            }
        };

        if let Err(e) = result {
            error!(event_id = %event.id, ?outcome, error = %e, "Failed to record inbox outcome");
        }
    }
}

/// Poison payloads are terminal; they will never parse
fn decode<T: DeserializeOwned>(event: &InboxEvent) -> Result<T, Outcome> {
    serde_json::from_value(event.payload.clone()).map_err(|e| {
        error!(event_id = %event.id, event_type = %event.event_type, error = %e, "Bad inbox payload");
        Outcome::Processed
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProfileError;
    use crate::memory::InMemoryStore;
    use profiles_messaging::{headers, MessageMetadata};
    use serde_json::json;
    use std::collections::HashMap;

    fn message(event_id: Option<&str>, event_type: &str, payload: serde_json::Value) -> IncomingMessage {
        let mut hdrs = HashMap::new();
        if let Some(id) = event_id {
            hdrs.insert(headers::EVENT_ID.to_string(), id.to_string());
        }
        hdrs.insert(headers::EVENT_TYPE.to_string(), event_type.to_string());
        IncomingMessage {
            payload: serde_json::to_vec(&payload).unwrap(),
            metadata: MessageMetadata {
                topic: "accounts.v1".to_string(),
                partition: 0,
                offset: 7,
                key: None,
                timestamp: None,
                headers: hdrs,
            },
        }
    }

    fn created_payload(account_id: Uuid) -> serde_json::Value {
        json!({
            "account_id": account_id,
            "username": "alice",
            "created_at": "2024-03-01T10:00:00Z"
        })
    }

    async fn stored(store: &InMemoryStore, event: InboxEvent) -> Uuid {
        let id = event.id;
        store.insert_inbox_event(&event).await.unwrap();
        id
    }

    fn worker(store: Arc<InMemoryStore>, handler: MockAccountEventHandler) -> InboxWorker {
        InboxWorker::new(0, store, Arc::new(handler), InboxConfig::default())
    }

    #[tokio::test]
    async fn test_ingress_deduplicates_by_event_id() {
        let store = Arc::new(InMemoryStore::new());
        let ingress = InboxIngress::new(store.clone());
        let id = Uuid::new_v4().to_string();
        let msg = message(Some(id.as_str()), ACCOUNT_CREATED, created_payload(Uuid::new_v4()));

        ingress.handle(&msg).await.unwrap();
        ingress.handle(&msg).await.unwrap();

        let events = store.inbox_events().await;
        assert_eq!(events.len(), 1);
        assert!(events[0].has_status(InboxStatus::Pending));
        assert_eq!(events[0].event_type, ACCOUNT_CREATED);
    }

    #[tokio::test]
    async fn test_ingress_acks_messages_without_event_id() {
        let store = Arc::new(InMemoryStore::new());
        let ingress = InboxIngress::new(store.clone());

        ingress
            .handle(&message(None, ACCOUNT_CREATED, json!({})))
            .await
            .unwrap();
        ingress
            .handle(&message(Some("not-a-uuid"), ACCOUNT_CREATED, json!({})))
            .await
            .unwrap();

        assert!(store.inbox_events().await.is_empty());
    }

    #[tokio::test]
    async fn test_ingress_storage_failure_blocks_the_ack() {
        let store = Arc::new(InMemoryStore::new());
        store.fail_inbox_inserts(true);
        let ingress = InboxIngress::new(store.clone());
        let id = Uuid::new_v4().to_string();
        let msg = message(Some(id.as_str()), ACCOUNT_DELETED, json!({}));

        let result = ingress.handle(&msg).await;
        assert!(matches!(result, Err(ConsumerError::ProcessingError(_))));
    }

    #[tokio::test]
    async fn test_worker_applies_and_marks_processed() {
        let store = Arc::new(InMemoryStore::new());
        let account = Uuid::new_v4();
        let id = stored(
            &store,
            InboxEvent::pending(Uuid::new_v4(), "accounts.v1", ACCOUNT_CREATED, None, created_payload(account)),
        )
        .await;

        let mut handler = MockAccountEventHandler::new();
        handler
            .expect_account_created()
            .withf(move |id, name| *id == account && name.to_string() == "alice")
            .times(1)
            .returning(|_, _| Ok(()));

        let claimed = worker(store.clone(), handler)
            .process_batch(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(claimed, 1);
        let event = store.inbox_event(id).await.unwrap();
        assert!(event.has_status(InboxStatus::Processed));
        assert!(event.processed_at.is_some());
    }

    #[tokio::test]
    async fn test_domain_rejection_is_terminal() {
        let store = Arc::new(InMemoryStore::new());
        let id = stored(
            &store,
            InboxEvent::pending(
                Uuid::new_v4(),
                "accounts.v1",
                ACCOUNT_USERNAME_UPDATED,
                None,
                json!({"account_id": Uuid::new_v4(), "new_username": "bob", "updated_at": "2024-03-01T10:00:00Z"}),
            ),
        )
        .await;

        let mut handler = MockAccountEventHandler::new();
        handler
            .expect_account_username_updated()
            .returning(|_, _| Err(ProfileError::ProfileNotFound));

        worker(store.clone(), handler)
            .process_batch(&CancellationToken::new())
            .await
            .unwrap();

        assert!(store.inbox_event(id).await.unwrap().has_status(InboxStatus::Processed));
    }

    #[tokio::test]
    async fn test_transient_error_reschedules_after_delay() {
        let store = Arc::new(InMemoryStore::new());
        let id = stored(
            &store,
            InboxEvent::pending(
                Uuid::new_v4(),
                "accounts.v1",
                ACCOUNT_DELETED,
                None,
                json!({"account_id": Uuid::new_v4(), "deleted_at": "2024-03-01T10:00:00Z"}),
            ),
        )
        .await;

        let mut handler = MockAccountEventHandler::new();
        handler
            .expect_account_deleted()
            .times(1)
            .returning(|_| Err(ProfileError::Internal(anyhow::anyhow!("database is down"))));
        let worker = worker(store.clone(), handler);
        let before = Utc::now();

        worker.process_batch(&CancellationToken::new()).await.unwrap();

        let event = store.inbox_event(id).await.unwrap();
        assert!(event.has_status(InboxStatus::Pending));
        assert!(event.next_retry_at >= before + chrono::Duration::seconds(60));
        assert!(event.last_error.as_deref().unwrap_or_default().contains("database is down"));

        // Not due again yet
        assert_eq!(worker.process_batch(&CancellationToken::new()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_poison_and_unknown_events_do_not_block_the_batch() {
        let store = Arc::new(InMemoryStore::new());
        let poison = stored(
            &store,
            InboxEvent::pending(Uuid::new_v4(), "accounts.v1", ACCOUNT_CREATED, None, json!("garbage")),
        )
        .await;
        let unknown = stored(
            &store,
            InboxEvent::pending(Uuid::new_v4(), "accounts.v1", "account.suspended", None, json!({})),
        )
        .await;
        let account = Uuid::new_v4();
        let good = stored(
            &store,
            InboxEvent::pending(Uuid::new_v4(), "accounts.v1", ACCOUNT_CREATED, None, created_payload(account)),
        )
        .await;

        let mut handler = MockAccountEventHandler::new();
        handler
            .expect_account_created()
            .times(1)
            .returning(|_, _| Ok(()));

        worker(store.clone(), handler)
            .process_batch(&CancellationToken::new())
            .await
            .unwrap();

        for id in [poison, unknown, good] {
            assert!(store.inbox_event(id).await.unwrap().has_status(InboxStatus::Processed));
        }
    }

    #[tokio::test]
    async fn test_unknown_events_can_be_failed_by_policy() {
        let store = Arc::new(InMemoryStore::new());
        let id = stored(
            &store,
            InboxEvent::pending(Uuid::new_v4(), "accounts.v1", "account.suspended", None, json!({})),
        )
        .await;
        let config = InboxConfig {
            unknown_event_policy: UnknownEventPolicy::Failed,
            ..InboxConfig::default()
        };

        InboxWorker::new(0, store.clone(), Arc::new(MockAccountEventHandler::new()), config)
            .process_batch(&CancellationToken::new())
            .await
            .unwrap();

        assert!(store.inbox_event(id).await.unwrap().has_status(InboxStatus::Failed));
    }
}
