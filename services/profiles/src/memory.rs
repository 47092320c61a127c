//! In-memory adapters for tests and local runs.
//!
//! They follow the same contracts as the Postgres, S3 and Kafka adapters,
//! including rollback of uncommitted transactions, and can be told to fail.

use crate::inbox::{InboxEvent, InboxStatus};
use crate::models::{Page, Pagination, Profile, ProfileFilter};
use crate::object_store::{ObjectProbe, ObjectStore, PresignedUpload};
use crate::outbox::{EventPublisher, OutboxEvent, OutboxStatus};
use crate::store::{InboxStore, OutboxStore, ProfileChanges, ProfileStore, StoreTx};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
struct Tables {
    profiles: BTreeMap<Uuid, Profile>,
    /// Insertion order doubles as creation order
    outbox: Vec<OutboxEvent>,
    inbox: Vec<InboxEvent>,
}

#[derive(Debug, Default)]
struct Faults {
    outbox_inserts: AtomicBool,
    inbox_inserts: AtomicBool,
}

/// Relational store kept in process memory.
///
/// A transaction holds the table lock until it commits or is dropped, so
/// callers must not use the store directly while one is open.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<AsyncMutex<Tables>>,
    faults: Arc<Faults>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every outbox insert fail, aborting the enclosing transaction
    pub fn fail_outbox_inserts(&self, fail: bool) {
        self.faults.outbox_inserts.store(fail, Ordering::SeqCst);
    }

    pub fn fail_inbox_inserts(&self, fail: bool) {
        self.faults.inbox_inserts.store(fail, Ordering::SeqCst);
    }

    pub async fn profiles(&self) -> Vec<Profile> {
        self.tables.lock().await.profiles.values().cloned().collect()
    }

    pub async fn outbox_events(&self) -> Vec<OutboxEvent> {
        self.tables.lock().await.outbox.clone()
    }

    pub async fn inbox_events(&self) -> Vec<InboxEvent> {
        self.tables.lock().await.inbox.clone()
    }

    pub async fn inbox_event(&self, id: Uuid) -> Option<InboxEvent> {
        self.tables
            .lock()
            .await
            .inbox
            .iter()
            .find(|e| e.id == id)
            .cloned()
    }
}

fn lease_until(lease: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::zero())
}

fn matches(profile: &Profile, filter: &ProfileFilter) -> bool {
    let prefixed = |value: Option<&str>, prefix: &Option<String>| match prefix {
        Some(p) => value.map(|v| v.starts_with(p.as_str())).unwrap_or(false),
        None => true,
    };

    prefixed(Some(&profile.username), &filter.username_prefix)
        && prefixed(profile.pseudonym.as_deref(), &filter.pseudonym_prefix)
        && filter.official.map(|o| o == profile.official).unwrap_or(true)
}

#[async_trait]
impl ProfileStore for InMemoryStore {
    async fn get_by_account_id(&self, account_id: Uuid) -> Result<Option<Profile>> {
        Ok(self.tables.lock().await.profiles.get(&account_id).cloned())
    }

    async fn get_by_username(&self, username: &str) -> Result<Option<Profile>> {
        Ok(self
            .tables
            .lock()
            .await
            .profiles
            .values()
            .find(|p| p.username == username)
            .cloned())
    }

    async fn filter(&self, filter: &ProfileFilter, page: Pagination) -> Result<Page<Profile>> {
        let tables = self.tables.lock().await;
        let mut found: Vec<Profile> = tables
            .profiles
            .values()
            .filter(|p| matches(p, filter))
            .cloned()
            .collect();
        found.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.account_id.cmp(&b.account_id))
        });

        let total = found.len() as i64;
        let data = found
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .collect();

        Ok(Page {
            data,
            limit: page.limit,
            offset: page.offset,
            total,
        })
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn StoreTx>> {
        let guard = self.tables.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(InMemoryTx {
            guard,
            working,
            faults: self.faults.clone(),
        }))
    }
}

/// Works on a copy of the tables; commit swaps it in
struct InMemoryTx {
    guard: OwnedMutexGuard<Tables>,
    working: Tables,
    faults: Arc<Faults>,
}

impl InMemoryTx {
    fn modify(
        &mut self,
        account_id: Uuid,
        change: impl FnOnce(&mut Profile),
    ) -> Option<Profile> {
        let profile = self.working.profiles.get_mut(&account_id)?;
        change(profile);
        profile.updated_at = Utc::now();
        Some(profile.clone())
    }
}

#[async_trait]
impl StoreTx for InMemoryTx {
    async fn get_by_username(&mut self, username: &str) -> Result<Option<Profile>> {
        Ok(self
            .working
            .profiles
            .values()
            .find(|p| p.username == username)
            .cloned())
    }

    async fn insert_profile(&mut self, account_id: Uuid, username: &str) -> Result<Profile> {
        if self.working.profiles.contains_key(&account_id) {
            bail!("duplicate key value violates unique constraint \"profiles_pkey\"");
        }
        if self.working.profiles.values().any(|p| p.username == username) {
            bail!("duplicate key value violates unique constraint \"profiles_username_key\"");
        }
        let profile = Profile::new(account_id, username);
        self.working.profiles.insert(account_id, profile.clone());
        Ok(profile)
    }

    async fn update_profile(
        &mut self,
        account_id: Uuid,
        changes: &ProfileChanges,
    ) -> Result<Option<Profile>> {
        Ok(self.modify(account_id, |p| {
            p.pseudonym = changes.pseudonym.clone();
            p.description = changes.description.clone();
            p.avatar = changes.avatar.clone();
        }))
    }

    async fn set_username(&mut self, account_id: Uuid, username: &str) -> Result<Option<Profile>> {
        Ok(self.modify(account_id, |p| p.username = username.to_string()))
    }

    async fn set_official(&mut self, account_id: Uuid, official: bool) -> Result<Option<Profile>> {
        Ok(self.modify(account_id, |p| p.official = official))
    }

    async fn delete_profile(&mut self, account_id: Uuid) -> Result<Option<Profile>> {
        Ok(self.working.profiles.remove(&account_id))
    }

    async fn insert_outbox_event(&mut self, event: &OutboxEvent) -> Result<()> {
        if self.faults.outbox_inserts.load(Ordering::SeqCst) {
            bail!("outbox insert failed");
        }
        self.working.outbox.push(event.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let InMemoryTx {
            mut guard, working, ..
        } = *self;
        *guard = working;
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for InMemoryStore {
    async fn claim_pending(&self, limit: u32, lease: Duration) -> Result<Vec<OutboxEvent>> {
        let mut tables = self.tables.lock().await;
        let now = Utc::now();
        let until = lease_until(lease);

        let claimed = tables
            .outbox
            .iter_mut()
            .filter(|e| !e.is_dispatched() && e.next_attempt_at <= now)
            .take(limit as usize)
            .map(|e| {
                let snapshot = e.clone();
                e.next_attempt_at = until;
                snapshot
            })
            .collect();
        Ok(claimed)
    }

    async fn mark_dispatched(&self, id: Uuid) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let event = tables
            .outbox
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| anyhow!("outbox event {id} not found"))?;
        event.status = OutboxStatus::Dispatched.as_str().to_string();
        event.dispatched_at = Some(Utc::now());
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let event = tables
            .outbox
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| anyhow!("outbox event {id} not found"))?;
        event.attempts += 1;
        event.last_error = Some(error.to_string());
        event.next_attempt_at = next_attempt_at;
        Ok(())
    }
}

#[async_trait]
impl InboxStore for InMemoryStore {
    async fn insert_inbox_event(&self, event: &InboxEvent) -> Result<bool> {
        if self.faults.inbox_inserts.load(Ordering::SeqCst) {
            bail!("inbox insert failed");
        }
        let mut tables = self.tables.lock().await;
        if tables.inbox.iter().any(|e| e.id == event.id) {
            return Ok(false);
        }
        tables.inbox.push(event.clone());
        Ok(true)
    }

    async fn claim_pending(&self, limit: u32, lease: Duration) -> Result<Vec<InboxEvent>> {
        let mut tables = self.tables.lock().await;
        let now = Utc::now();
        let until = lease_until(lease);

        let claimed = tables
            .inbox
            .iter_mut()
            .filter(|e| e.has_status(InboxStatus::Pending) && e.next_retry_at <= now)
            .take(limit as usize)
            .map(|e| {
                e.attempts += 1;
                e.next_retry_at = until;
                e.clone()
            })
            .collect();
        Ok(claimed)
    }

    async fn mark_processed(&self, id: Uuid) -> Result<()> {
        self.set_inbox_status(id, InboxStatus::Processed, None).await
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<()> {
        self.set_inbox_status(id, InboxStatus::Failed, Some(error)).await
    }

    async fn reschedule(&self, id: Uuid, error: &str, next_retry_at: DateTime<Utc>) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let event = tables
            .inbox
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| anyhow!("inbox event {id} not found"))?;
        event.status = InboxStatus::Pending.as_str().to_string();
        event.last_error = Some(error.to_string());
        event.next_retry_at = next_retry_at;
        Ok(())
    }
}

impl InMemoryStore {
    async fn set_inbox_status(
        &self,
        id: Uuid,
        status: InboxStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let event = tables
            .inbox
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| anyhow!("inbox event {id} not found"))?;
        event.status = status.as_str().to_string();
        event.processed_at = Some(Utc::now());
        if let Some(error) = error {
            event.last_error = Some(error.to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    bytes: Vec<u8>,
    version: u64,
}

impl StoredObject {
    fn e_tag(&self) -> String {
        format!("\"{}\"", self.version)
    }
}

#[derive(Default)]
struct Objects {
    by_key: HashMap<String, StoredObject>,
    next_version: u64,
    /// Uploads that land right after the next ranged read of their key
    pending_writes: HashMap<String, Vec<u8>>,
}

impl Objects {
    fn insert(&mut self, key: &str, bytes: Vec<u8>) {
        self.next_version += 1;
        let version = self.next_version;
        self.by_key
            .insert(key.to_string(), StoredObject { bytes, version });
    }
}

/// Object store backed by a map of key to bytes. Every write gets a new ETag.
#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: Mutex<Objects>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stands in for a client upload through a presigned URL
    pub fn put(&self, key: &str, bytes: Vec<u8>) {
        self.lock().insert(key, bytes);
    }

    /// Overwrite `key` with `bytes` as soon as the next ranged read of it
    /// returns, like a client re-uploading while the service validates
    pub fn put_after_next_read(&self, key: &str, bytes: Vec<u8>) {
        self.lock().pending_writes.insert(key.to_string(), bytes);
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().by_key.get(key).map(|o| o.bytes.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().by_key.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.lock().by_key.is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Objects> {
        // A panicking test thread must not hide the objects from the others
        self.objects.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn presign_put(&self, key: &str, ttl: Duration) -> Result<PresignedUpload> {
        let expires = ttl.as_secs();
        Ok(PresignedUpload {
            upload_url: format!("memory://{key}?method=PUT&expires={expires}"),
            get_url: format!("memory://{key}?method=GET&expires={expires}"),
        })
    }

    async fn get_range(&self, key: &str, max_bytes: u64) -> Result<Option<ObjectProbe>> {
        let mut objects = self.lock();
        let read = objects.by_key.get(key).map(|object| ObjectProbe {
            bytes: object.bytes.iter().take(max_bytes as usize).copied().collect(),
            total_size: object.bytes.len() as u64,
            e_tag: object.e_tag(),
        });
        if let Some(bytes) = objects.pending_writes.remove(key) {
            objects.insert(key, bytes);
        }
        Ok(read)
    }

    async fn copy(&self, src: &str, dst: &str, if_match: &str) -> Result<Option<String>> {
        let mut objects = self.lock();
        let source = objects
            .by_key
            .get(src)
            .ok_or_else(|| anyhow!("no such key: {src}"))?;
        if source.e_tag() != if_match {
            return Ok(None);
        }
        let bytes = source.bytes.clone();
        objects.insert(dst, bytes);
        Ok(Some(dst.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.lock().by_key.remove(key);
        Ok(())
    }
}

/// Publisher that records what it was asked to send
#[derive(Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<OutboxEvent>>,
    failing: AtomicBool,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<OutboxEvent> {
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, event: &OutboxEvent) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("broker unavailable");
        }
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dropped_transaction_rolls_back() {
        let store = InMemoryStore::new();
        let account = Uuid::new_v4();

        {
            let mut tx = store.begin().await.unwrap();
            tx.insert_profile(account, "alice").await.unwrap();
        }

        assert!(store.get_by_account_id(account).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_commit_publishes_all_writes_together() {
        let store = InMemoryStore::new();
        let profile = Profile::new(Uuid::new_v4(), "alice");
        let event = crate::outbox::OutboxWriter::new("profiles.v1", "profiles-svc")
            .profile_created(&profile)
            .unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.insert_profile(profile.account_id, "alice").await.unwrap();
        tx.insert_outbox_event(&event).await.unwrap();
        tx.commit().await.unwrap();

        assert!(store.get_by_username("alice").await.unwrap().is_some());
        assert_eq!(store.outbox_events().await.len(), 1);
    }

    #[tokio::test]
    async fn test_filter_matches_prefixes_and_pages() {
        let store = InMemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        for name in ["anna", "annie", "bob"] {
            tx.insert_profile(Uuid::new_v4(), name).await.unwrap();
        }
        tx.commit().await.unwrap();

        let filter = ProfileFilter {
            username_prefix: Some("ann".to_string()),
            ..ProfileFilter::default()
        };
        let page = store
            .filter(&filter, Pagination { limit: 1, offset: 0 })
            .await
            .unwrap();

        assert_eq!(page.total, 2);
        assert_eq!(page.data.len(), 1);
        assert!(page.data[0].username.starts_with("ann"));
    }

    #[tokio::test]
    async fn test_copy_requires_the_read_version() {
        let objects = InMemoryObjectStore::new();
        objects.put("src", b"first".to_vec());
        let read = objects.get_range("src", 3).await.unwrap().unwrap();
        assert_eq!((read.bytes.as_slice(), read.total_size), (&b"fir"[..], 5));

        objects.put("src", b"second".to_vec());
        assert_eq!(objects.copy("src", "dst", &read.e_tag).await.unwrap(), None);
        assert!(!objects.contains("dst"));

        let read = objects.get_range("src", 16).await.unwrap().unwrap();
        let copied = objects.copy("src", "dst", &read.e_tag).await.unwrap();
        assert_eq!(copied.as_deref(), Some("dst"));
        assert_eq!(objects.get("dst"), Some(b"second".to_vec()));
    }
}
