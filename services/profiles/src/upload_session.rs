//! Avatar upload sessions.
//!
//! A session has no server-side record. It exists only as an object under
//! its temp key, `profile/avatar/{account}/temp/{session}`, which the client
//! fills through a presigned PUT. Accepting a session validates the leading
//! bytes of that object and copies that exact version to the account's single
//! avatar slot, `profile/avatar/{account}`. The temp object survives an
//! accept; cancel and cleanup remove it.

use crate::config::AvatarConfig;
use crate::error::{ProfileError, ProfileResult};
use crate::media_validator::{MediaError, MediaValidator};
use crate::object_store::{ObjectStore, PresignedUpload};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Validate-and-copy rounds before giving up on an object that keeps changing
const MAX_ACCEPT_ATTEMPTS: u32 = 3;

pub fn temp_key(account_id: Uuid, session_id: Uuid) -> String {
    format!("profile/avatar/{account_id}/temp/{session_id}")
}

pub fn final_key(account_id: Uuid) -> String {
    format!("profile/avatar/{account_id}")
}

/// Presigned URLs for a new session
#[derive(Debug, Clone)]
pub struct OpenedSession {
    pub session_id: Uuid,
    pub upload: PresignedUpload,
}

pub struct UploadSessionManager {
    store: Arc<dyn ObjectStore>,
    validator: MediaValidator,
    probe_max_bytes: u64,
    ttl: Duration,
}

impl UploadSessionManager {
    pub fn new(store: Arc<dyn ObjectStore>, config: &AvatarConfig) -> Self {
        Self {
            store,
            validator: MediaValidator::new(config),
            probe_max_bytes: config.probe_max_bytes,
            ttl: config.upload_ttl(),
        }
    }

    /// Start a session. The temp slot is not checked; it may never be filled.
    #[instrument(skip(self), fields(account_id = %account_id))]
    pub async fn open_session(&self, account_id: Uuid) -> ProfileResult<OpenedSession> {
        let session_id = Uuid::new_v4();
        let upload = self
            .store
            .presign_put(&temp_key(account_id, session_id), self.ttl)
            .await?;

        debug!(session_id = %session_id, "Upload session opened");
        Ok(OpenedSession { session_id, upload })
    }

    /// Validate the uploaded object and promote it to the final key.
    ///
    /// The copy is pinned to the ETag of the bytes that were validated. If
    /// the client re-uploads in between, the new object is validated again.
    /// Returns `NoContentUploaded` when nothing was uploaded; callers decide
    /// whether that is an error.
    #[instrument(skip(self), fields(account_id = %account_id, session_id = %session_id))]
    pub async fn accept(&self, account_id: Uuid, session_id: Uuid) -> ProfileResult<String> {
        let temp = temp_key(account_id, session_id);

        for attempt in 1..=MAX_ACCEPT_ATTEMPTS {
            let read = self
                .store
                .get_range(&temp, self.probe_max_bytes)
                .await?
                .ok_or(MediaError::NoContentUploaded)?;

            if let Err(e) = self.validator.validate(&read.bytes, read.total_size) {
                if e != MediaError::NoContentUploaded {
                    metrics::counter!("profiles_avatar_rejected_total", "reason" => e.code())
                        .increment(1);
                    warn!(error = %e, size = read.total_size, "Avatar rejected");
                }
                return Err(ProfileError::Media(e));
            }

            match self
                .store
                .copy(&temp, &final_key(account_id), &read.e_tag)
                .await?
            {
                Some(avatar) => {
                    metrics::counter!("profiles_avatar_accepted_total").increment(1);
                    info!(avatar = %avatar, "Avatar accepted");
                    return Ok(avatar);
                }
                None => {
                    warn!(attempt, "Upload changed while being validated");
                }
            }
        }

        Err(ProfileError::Internal(anyhow::anyhow!(
            "upload kept changing after {MAX_ACCEPT_ATTEMPTS} attempts"
        )))
    }

    /// Drop whatever was uploaded for the session
    #[instrument(skip(self), fields(account_id = %account_id, session_id = %session_id))]
    pub async fn cancel(&self, account_id: Uuid, session_id: Uuid) -> ProfileResult<()> {
        self.store.delete(&temp_key(account_id, session_id)).await?;
        Ok(())
    }

    /// Final step of every update flow, whatever the accept outcome was
    pub async fn cleanup(&self, account_id: Uuid, session_id: Uuid) -> ProfileResult<()> {
        self.cancel(account_id, session_id).await
    }

    #[instrument(skip(self), fields(account_id = %account_id))]
    pub async fn delete_final_avatar(&self, account_id: Uuid) -> ProfileResult<()> {
        self.store.delete(&final_key(account_id)).await?;
        Ok(())
    }
}
