use crate::config::DatabaseConfig;
use crate::inbox::{InboxEvent, InboxStatus};
use crate::models::{Page, Pagination, Profile, ProfileFilter};
use crate::outbox::{OutboxEvent, OutboxStatus};
use crate::store::{InboxStore, OutboxStore, ProfileChanges, ProfileStore, StoreTx};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

const PROFILE_COLUMNS: &str =
    "account_id, username, pseudonym, description, avatar, official, created_at, updated_at";

const OUTBOX_COLUMNS: &str = "id, topic, event_type, key, payload, headers, status, attempts, \
     last_error, next_attempt_at, created_at, dispatched_at";

const INBOX_COLUMNS: &str = "id, topic, event_type, key, payload, status, attempts, last_error, \
     next_retry_at, created_at, processed_at";

/// Profiles, outbox and inbox tables in PostgreSQL
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }
}

/// `LIKE` pattern matching values that start with `prefix` literally
fn like_prefix(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '\\' | '%' | '_') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

fn lease_until(lease: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::zero())
}

#[async_trait]
impl ProfileStore for PgStore {
    async fn get_by_account_id(&self, account_id: Uuid) -> Result<Option<Profile>> {
        let sql = format!("SELECT {PROFILE_COLUMNS} FROM profiles WHERE account_id = $1");
        sqlx::query_as::<_, Profile>(&sql)
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to query profile")
    }

    async fn get_by_username(&self, username: &str) -> Result<Option<Profile>> {
        let sql = format!("SELECT {PROFILE_COLUMNS} FROM profiles WHERE username = $1");
        sqlx::query_as::<_, Profile>(&sql)
            .bind(username)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to query profile by username")
    }

    #[instrument(skip(self))]
    async fn filter(&self, filter: &ProfileFilter, page: Pagination) -> Result<Page<Profile>> {
        const WHERE: &str = r#"
            WHERE ($1::text IS NULL OR username LIKE $1)
              AND ($2::text IS NULL OR pseudonym LIKE $2)
              AND ($3::boolean IS NULL OR official = $3)
        "#;

        let username = filter.username_prefix.as_deref().map(like_prefix);
        let pseudonym = filter.pseudonym_prefix.as_deref().map(like_prefix);

        let (total,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM profiles {WHERE}"))
            .bind(&username)
            .bind(&pseudonym)
            .bind(filter.official)
            .fetch_one(&self.pool)
            .await
            .context("Failed to count profiles")?;

        let sql = format!(
            "SELECT {PROFILE_COLUMNS} FROM profiles {WHERE} \
             ORDER BY created_at ASC, account_id ASC LIMIT $4 OFFSET $5"
        );
        let data = sqlx::query_as::<_, Profile>(&sql)
            .bind(&username)
            .bind(&pseudonym)
            .bind(filter.official)
            .bind(page.limit)
            .bind(page.offset)
            .fetch_all(&self.pool)
            .await
            .context("Failed to query profiles")?;

        Ok(Page {
            data,
            limit: page.limit,
            offset: page.offset,
            total,
        })
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("Database is unreachable")?;
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn StoreTx>> {
        let tx = self.pool.begin().await.context("Failed to begin transaction")?;
        Ok(Box::new(PgTx { tx }))
    }
}

/// Rolled back by sqlx when dropped uncommitted
struct PgTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTx for PgTx {
    async fn get_by_username(&mut self, username: &str) -> Result<Option<Profile>> {
        let sql = format!("SELECT {PROFILE_COLUMNS} FROM profiles WHERE username = $1 FOR UPDATE");
        sqlx::query_as::<_, Profile>(&sql)
            .bind(username)
            .fetch_optional(&mut *self.tx)
            .await
            .context("Failed to query profile by username")
    }

    async fn insert_profile(&mut self, account_id: Uuid, username: &str) -> Result<Profile> {
        let sql = format!(
            "INSERT INTO profiles (account_id, username, official, created_at, updated_at) \
             VALUES ($1, $2, FALSE, NOW(), NOW()) RETURNING {PROFILE_COLUMNS}"
        );
        sqlx::query_as::<_, Profile>(&sql)
            .bind(account_id)
            .bind(username)
            .fetch_one(&mut *self.tx)
            .await
            .context("Failed to insert profile")
    }

    async fn update_profile(
        &mut self,
        account_id: Uuid,
        changes: &ProfileChanges,
    ) -> Result<Option<Profile>> {
        let sql = format!(
            "UPDATE profiles SET pseudonym = $2, description = $3, avatar = $4, updated_at = NOW() \
             WHERE account_id = $1 RETURNING {PROFILE_COLUMNS}"
        );
        sqlx::query_as::<_, Profile>(&sql)
            .bind(account_id)
            .bind(&changes.pseudonym)
            .bind(&changes.description)
            .bind(&changes.avatar)
            .fetch_optional(&mut *self.tx)
            .await
            .context("Failed to update profile")
    }

    async fn set_username(&mut self, account_id: Uuid, username: &str) -> Result<Option<Profile>> {
        let sql = format!(
            "UPDATE profiles SET username = $2, updated_at = NOW() \
             WHERE account_id = $1 RETURNING {PROFILE_COLUMNS}"
        );
        sqlx::query_as::<_, Profile>(&sql)
            .bind(account_id)
            .bind(username)
            .fetch_optional(&mut *self.tx)
            .await
            .context("Failed to update username")
    }

    async fn set_official(&mut self, account_id: Uuid, official: bool) -> Result<Option<Profile>> {
        let sql = format!(
            "UPDATE profiles SET official = $2, updated_at = NOW() \
             WHERE account_id = $1 RETURNING {PROFILE_COLUMNS}"
        );
        sqlx::query_as::<_, Profile>(&sql)
            .bind(account_id)
            .bind(official)
            .fetch_optional(&mut *self.tx)
            .await
            .context("Failed to update official flag")
    }

    async fn delete_profile(&mut self, account_id: Uuid) -> Result<Option<Profile>> {
        let sql = format!("DELETE FROM profiles WHERE account_id = $1 RETURNING {PROFILE_COLUMNS}");
        sqlx::query_as::<_, Profile>(&sql)
            .bind(account_id)
            .fetch_optional(&mut *self.tx)
            .await
            .context("Failed to delete profile")
    }

    async fn insert_outbox_event(&mut self, event: &OutboxEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO outbox_events (
                id, topic, event_type, key, payload, headers,
                status, attempts, next_attempt_at, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, 0, $8, $9)
            "#,
        )
        .bind(event.id)
        .bind(&event.topic)
        .bind(&event.event_type)
        .bind(&event.key)
        .bind(&event.payload)
        .bind(&event.headers)
        .bind(OutboxStatus::Pending.as_str())
        .bind(event.next_attempt_at)
        .bind(event.created_at)
        .execute(&mut *self.tx)
        .await
        .context("Failed to insert outbox event")?;

        debug!(event_id = %event.id, event_type = %event.event_type, "Outbox event queued");
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.context("Failed to commit transaction")
    }
}

#[async_trait]
impl OutboxStore for PgStore {
    async fn claim_pending(&self, limit: u32, lease: Duration) -> Result<Vec<OutboxEvent>> {
        let sql = format!(
            r#"
            UPDATE outbox_events SET next_attempt_at = $3
            WHERE id IN (
                SELECT id FROM outbox_events
                WHERE status = $1 AND next_attempt_at <= NOW()
                ORDER BY created_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {OUTBOX_COLUMNS}
            "#
        );
        let mut events = sqlx::query_as::<_, OutboxEvent>(&sql)
            .bind(OutboxStatus::Pending.as_str())
            .bind(limit as i64)
            .bind(lease_until(lease))
            .fetch_all(&self.pool)
            .await
            .context("Failed to claim outbox events")?;

        // RETURNING order is unspecified
        events.sort_by_key(|e| e.created_at);
        Ok(events)
    }

    async fn mark_dispatched(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE outbox_events SET status = $2, dispatched_at = NOW(), last_error = NULL \
             WHERE id = $1",
        )
        .bind(id)
        .bind(OutboxStatus::Dispatched.as_str())
        .execute(&self.pool)
        .await
        .context("Failed to mark outbox event dispatched")?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE outbox_events SET attempts = attempts + 1, last_error = $2, next_attempt_at = $3 \
             WHERE id = $1",
        )
        .bind(id)
        .bind(error)
        .bind(next_attempt_at)
        .execute(&self.pool)
        .await
        .context("Failed to record outbox failure")?;
        Ok(())
    }
}

#[async_trait]
impl InboxStore for PgStore {
    #[instrument(skip(self, event), fields(event_id = %event.id))]
    async fn insert_inbox_event(&self, event: &InboxEvent) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO inbox_events (
                id, topic, event_type, key, payload,
                status, attempts, next_retry_at, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, 0, $7, $8)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(event.id)
        .bind(&event.topic)
        .bind(&event.event_type)
        .bind(&event.key)
        .bind(&event.payload)
        .bind(InboxStatus::Pending.as_str())
        .bind(event.next_retry_at)
        .bind(event.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert inbox event")?;

        Ok(result.rows_affected() == 1)
    }

    async fn claim_pending(&self, limit: u32, lease: Duration) -> Result<Vec<InboxEvent>> {
        let sql = format!(
            r#"
            UPDATE inbox_events SET attempts = attempts + 1, next_retry_at = $3
            WHERE id IN (
                SELECT id FROM inbox_events
                WHERE status = $1 AND next_retry_at <= NOW()
                ORDER BY created_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {INBOX_COLUMNS}
            "#
        );
        let mut events = sqlx::query_as::<_, InboxEvent>(&sql)
            .bind(InboxStatus::Pending.as_str())
            .bind(limit as i64)
            .bind(lease_until(lease))
            .fetch_all(&self.pool)
            .await
            .context("Failed to claim inbox events")?;

        events.sort_by_key(|e| e.created_at);
        Ok(events)
    }

    async fn mark_processed(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE inbox_events SET status = $2, processed_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(InboxStatus::Processed.as_str())
            .execute(&self.pool)
            .await
            .context("Failed to mark inbox event processed")?;
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE inbox_events SET status = $2, last_error = $3, processed_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(InboxStatus::Failed.as_str())
        .bind(error)
        .execute(&self.pool)
        .await
        .context("Failed to mark inbox event failed")?;
        Ok(())
    }

    async fn reschedule(&self, id: Uuid, error: &str, next_retry_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE inbox_events SET status = $2, last_error = $3, next_retry_at = $4 WHERE id = $1",
        )
        .bind(id)
        .bind(InboxStatus::Pending.as_str())
        .bind(error)
        .bind(next_retry_at)
        .execute(&self.pool)
        .await
        .context("Failed to reschedule inbox event")?;
        Ok(())
    }
}
