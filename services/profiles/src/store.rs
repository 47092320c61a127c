//! Relational storage capabilities.
//!
//! Reads go straight to the store. Writes that must land together, such as a
//! profile row and the outbox event describing it, go through a [`StoreTx`].
//! A transaction that is dropped without `commit` is rolled back.

use crate::inbox::InboxEvent;
use crate::models::{Page, Pagination, Profile, ProfileFilter};
use crate::outbox::OutboxEvent;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

/// Editable fields of a profile, written as a whole
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileChanges {
    pub pseudonym: Option<String>,
    pub description: Option<String>,
    pub avatar: Option<String>,
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn get_by_account_id(&self, account_id: Uuid) -> Result<Option<Profile>>;

    async fn get_by_username(&self, username: &str) -> Result<Option<Profile>>;

    /// Prefix search ordered by creation time, then account ID
    async fn filter(&self, filter: &ProfileFilter, page: Pagination) -> Result<Page<Profile>>;

    async fn ping(&self) -> Result<()>;

    async fn begin(&self) -> Result<Box<dyn StoreTx>>;
}

/// Writes scoped to one transaction.
///
/// Row-returning updates yield `None` when the row does not exist.
#[async_trait]
pub trait StoreTx: Send {
    async fn get_by_username(&mut self, username: &str) -> Result<Option<Profile>>;

    async fn insert_profile(&mut self, account_id: Uuid, username: &str) -> Result<Profile>;

    async fn update_profile(
        &mut self,
        account_id: Uuid,
        changes: &ProfileChanges,
    ) -> Result<Option<Profile>>;

    async fn set_username(&mut self, account_id: Uuid, username: &str) -> Result<Option<Profile>>;

    async fn set_official(&mut self, account_id: Uuid, official: bool) -> Result<Option<Profile>>;

    /// Returns the deleted row
    async fn delete_profile(&mut self, account_id: Uuid) -> Result<Option<Profile>>;

    async fn insert_outbox_event(&mut self, event: &OutboxEvent) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;
}

/// Dispatcher side of the outbox table
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Claim due pending events, oldest first, hiding them from other
    /// dispatchers for `lease`
    async fn claim_pending(&self, limit: u32, lease: Duration) -> Result<Vec<OutboxEvent>>;

    async fn mark_dispatched(&self, id: Uuid) -> Result<()>;

    /// Count a failed attempt and schedule the next one
    async fn mark_failed(&self, id: Uuid, error: &str, next_attempt_at: DateTime<Utc>)
        -> Result<()>;
}

#[async_trait]
pub trait InboxStore: Send + Sync {
    /// Store a received event. Returns false when the ID was already stored.
    async fn insert_inbox_event(&self, event: &InboxEvent) -> Result<bool>;

    /// Claim due pending events, oldest first, for at most `lease`
    async fn claim_pending(&self, limit: u32, lease: Duration) -> Result<Vec<InboxEvent>>;

    async fn mark_processed(&self, id: Uuid) -> Result<()>;

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<()>;

    /// Return an event to pending, due again at `next_retry_at`
    async fn reschedule(&self, id: Uuid, error: &str, next_retry_at: DateTime<Utc>) -> Result<()>;
}
