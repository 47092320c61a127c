//! Profile operations.
//!
//! Every mutation writes its row change and the matching outbox event in one
//! transaction. Avatar updates additionally touch object storage, always
//! before the transaction opens: the avatar object is in its final place
//! before any committed row can point at it, and a rejected upload never
//! reaches the database.

use crate::error::{ProfileError, ProfileResult};
use crate::inbox::AccountEventHandler;
use crate::media_validator::MediaError;
use crate::models::{Page, Pagination, Profile, ProfileFilter, UpdateProfileParams, UploadSession};
use crate::outbox::OutboxWriter;
use crate::store::{ProfileChanges, ProfileStore};
use crate::upload_session::UploadSessionManager;
use crate::upload_token::UploadTokenManager;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

const USERNAME_MIN_CHARS: usize = 3;
const USERNAME_MAX_CHARS: usize = 32;

/// Checks username shape; uniqueness is checked inside the write transaction
pub fn validate_username(username: &str) -> ProfileResult<()> {
    let len = username.chars().count();
    if !(USERNAME_MIN_CHARS..=USERNAME_MAX_CHARS).contains(&len) {
        return Err(ProfileError::UsernameNotAllowed(format!(
            "must be between {USERNAME_MIN_CHARS} and {USERNAME_MAX_CHARS} characters"
        )));
    }
    if let Some(c) = username
        .chars()
        .find(|c| !(c.is_alphanumeric() || *c == '_' || *c == '-'))
    {
        return Err(ProfileError::UsernameNotAllowed(format!(
            "contains invalid character '{c}'"
        )));
    }
    Ok(())
}

pub struct ProfileService {
    store: Arc<dyn ProfileStore>,
    sessions: UploadSessionManager,
    tokens: UploadTokenManager,
    outbox: OutboxWriter,
}

impl ProfileService {
    pub fn new(
        store: Arc<dyn ProfileStore>,
        sessions: UploadSessionManager,
        tokens: UploadTokenManager,
        outbox: OutboxWriter,
    ) -> Self {
        Self {
            store,
            sessions,
            tokens,
            outbox,
        }
    }

    pub async fn get_profile_by_account_id(&self, account_id: Uuid) -> ProfileResult<Profile> {
        self.store
            .get_by_account_id(account_id)
            .await?
            .ok_or(ProfileError::ProfileNotFound)
    }

    pub async fn get_profile_by_username(&self, username: &str) -> ProfileResult<Profile> {
        self.store
            .get_by_username(username)
            .await?
            .ok_or(ProfileError::ProfileNotFound)
    }

    pub async fn filter_profiles(
        &self,
        filter: &ProfileFilter,
        page: Pagination,
    ) -> ProfileResult<Page<Profile>> {
        Ok(self.store.filter(filter, page).await?)
    }

    /// Database reachability, for readiness probes
    pub async fn ping(&self) -> ProfileResult<()> {
        Ok(self.store.ping().await?)
    }

    /// Create the profile for a new account. Returns the existing one if present.
    #[instrument(skip(self), fields(account_id = %account_id))]
    pub async fn create_profile(&self, account_id: Uuid, username: &str) -> ProfileResult<Profile> {
        if let Some(existing) = self.store.get_by_account_id(account_id).await? {
            return Ok(existing);
        }
        validate_username(username)?;

        let mut tx = self.store.begin().await?;
        if tx.get_by_username(username).await?.is_some() {
            return Err(ProfileError::UsernameAlreadyTaken);
        }
        let profile = tx.insert_profile(account_id, username).await?;
        tx.insert_outbox_event(&self.outbox.profile_created(&profile)?)
            .await?;
        tx.commit().await?;

        metrics::counter!("profiles_created_total").increment(1);
        info!(username = %profile.username, "Profile created");
        Ok(profile)
    }

    /// Remove the profile and its avatar. Absent profiles are not an error.
    #[instrument(skip(self), fields(account_id = %account_id))]
    pub async fn delete_profile(&self, account_id: Uuid) -> ProfileResult<()> {
        let mut tx = self.store.begin().await?;
        let Some(deleted) = tx.delete_profile(account_id).await? else {
            return Ok(());
        };
        tx.insert_outbox_event(&self.outbox.profile_deleted(account_id)?)
            .await?;
        tx.commit().await?;

        metrics::counter!("profiles_deleted_total").increment(1);
        info!("Profile deleted");

        // No row references the object any more; a leftover is harmless
        if deleted.avatar.is_some() {
            if let Err(e) = self.sessions.delete_final_avatar(account_id).await {
                warn!(error = %e, "Failed to delete avatar of deleted profile");
            }
        }
        Ok(())
    }

    #[instrument(skip(self), fields(account_id = %account_id))]
    pub async fn update_profile_official(
        &self,
        account_id: Uuid,
        official: bool,
    ) -> ProfileResult<Profile> {
        self.get_profile_by_account_id(account_id).await?;

        let mut tx = self.store.begin().await?;
        let profile = tx
            .set_official(account_id, official)
            .await?
            .ok_or(ProfileError::ProfileNotFound)?;
        tx.insert_outbox_event(&self.outbox.profile_official_updated(&profile)?)
            .await?;
        tx.commit().await?;

        Ok(profile)
    }

    #[instrument(skip(self), fields(account_id = %account_id))]
    pub async fn update_profile_username(
        &self,
        account_id: Uuid,
        username: &str,
    ) -> ProfileResult<Profile> {
        let current = self.get_profile_by_account_id(account_id).await?;
        if current.username == username {
            return Ok(current);
        }
        validate_username(username)?;

        let mut tx = self.store.begin().await?;
        if let Some(holder) = tx.get_by_username(username).await? {
            if holder.account_id != account_id {
                return Err(ProfileError::UsernameAlreadyTaken);
            }
        }
        let profile = tx
            .set_username(account_id, username)
            .await?
            .ok_or(ProfileError::ProfileNotFound)?;
        tx.insert_outbox_event(&self.outbox.profile_updated(&profile)?)
            .await?;
        tx.commit().await?;

        Ok(profile)
    }

    /// Open an avatar upload session and sign a token bound to it
    #[instrument(skip(self), fields(account_id = %account_id))]
    pub async fn open_upload_session(&self, account_id: Uuid) -> ProfileResult<UploadSession> {
        let opened = self.sessions.open_session(account_id).await?;
        let upload_token = self.tokens.issue(account_id, opened.session_id)?;

        Ok(UploadSession {
            session_id: opened.session_id,
            upload_url: opened.upload.upload_url,
            get_url: opened.upload.get_url,
            upload_token,
        })
    }

    /// Session ID carried by a valid upload token of `account_id`
    pub fn verify_upload_token(&self, token: &str, account_id: Uuid) -> ProfileResult<Uuid> {
        self.tokens.verify(token, account_id)
    }

    pub async fn cancel_upload_session(
        &self,
        account_id: Uuid,
        session_id: Uuid,
    ) -> ProfileResult<()> {
        self.sessions.cancel(account_id, session_id).await
    }

    /// Replace the editable fields and settle the avatar of an upload session.
    ///
    /// With nothing uploaded in the session the current avatar is kept.
    #[instrument(skip(self, params), fields(account_id = %account_id, session_id = %params.upload_session_id))]
    pub async fn update_profile(
        &self,
        account_id: Uuid,
        params: UpdateProfileParams,
    ) -> ProfileResult<Profile> {
        let current = self.get_profile_by_account_id(account_id).await?;
        let session_id = params.upload_session_id;

        // The avatar object is removed only once the row stops referencing it
        let avatar = if params.delete_avatar {
            None
        } else {
            match self.sessions.accept(account_id, session_id).await {
                Ok(avatar) => Some(avatar),
                Err(ProfileError::Media(MediaError::NoContentUploaded)) => current.avatar.clone(),
                Err(e) => {
                    if let Err(cleanup) = self.sessions.cleanup(account_id, session_id).await {
                        warn!(error = %cleanup, "Failed to clean up rejected upload session");
                    }
                    return Err(e);
                }
            }
        };

        // The avatar, if any, is already in its final place
        self.sessions.cleanup(account_id, session_id).await?;

        let changes = ProfileChanges {
            pseudonym: params.pseudonym,
            description: params.description,
            avatar,
        };

        let mut tx = self.store.begin().await?;
        let profile = tx
            .update_profile(account_id, &changes)
            .await?
            .ok_or(ProfileError::ProfileNotFound)?;
        tx.insert_outbox_event(&self.outbox.profile_updated(&profile)?)
            .await?;
        tx.commit().await?;

        if params.delete_avatar && current.avatar.is_some() {
            if let Err(e) = self.sessions.delete_final_avatar(account_id).await {
                warn!(error = %e, "Failed to delete avatar object; it is no longer referenced");
            }
        }

        metrics::counter!("profiles_updated_total").increment(1);
        Ok(profile)
    }
}

#[async_trait]
impl AccountEventHandler for ProfileService {
    async fn account_created(&self, account_id: Uuid, username: &str) -> ProfileResult<()> {
        self.create_profile(account_id, username).await.map(|_| ())
    }

    async fn account_username_updated(&self, account_id: Uuid, username: &str) -> ProfileResult<()> {
        self.update_profile_username(account_id, username)
            .await
            .map(|_| ())
    }

    async fn account_deleted(&self, account_id: Uuid) -> ProfileResult<()> {
        self.delete_profile(account_id).await
    }
}
