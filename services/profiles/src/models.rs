use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Default page size for profile listings
pub const DEFAULT_PAGE_LIMIT: i64 = 10;
/// Largest page a caller may request
pub const MAX_PAGE_LIMIT: i64 = 100;

/// Stored user profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Profile {
    /// Owning account, assigned by the accounts service
    pub account_id: Uuid,
    pub username: String,
    pub pseudonym: Option<String>,
    pub description: Option<String>,
    /// Final object key of the avatar, if one was accepted
    pub avatar: Option<String>,
    /// Verified flag, set by moderators
    pub official: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Profile {
    pub fn new(account_id: Uuid, username: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            account_id,
            username: username.into(),
            pseudonym: None,
            description: None,
            avatar: None,
            official: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Query parameters for profile search
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileFilter {
    pub username_prefix: Option<String>,
    pub pseudonym_prefix: Option<String>,
    pub official: Option<bool>,
}

/// Limit/offset pair after clamping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub limit: i64,
    pub offset: i64,
}

impl Pagination {
    pub fn new(limit: Option<i64>, offset: Option<i64>) -> Self {
        let limit = match limit {
            Some(l) if l > 0 => l.min(MAX_PAGE_LIMIT),
            _ => DEFAULT_PAGE_LIMIT,
        };
        Self {
            limit,
            offset: offset.unwrap_or(0).max(0),
        }
    }
}

/// One page of results plus the total match count
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub limit: i64,
    pub offset: i64,
    pub total: i64,
}

/// Fields replaced by an update of one's own profile
#[derive(Debug, Clone, Default)]
pub struct UpdateProfileParams {
    pub pseudonym: Option<String>,
    pub description: Option<String>,
    /// Remove the current avatar instead of accepting an upload
    pub delete_avatar: bool,
    pub upload_session_id: Uuid,
}

/// A freshly opened avatar upload session, handed to the client
#[derive(Debug, Clone, Serialize)]
pub struct UploadSession {
    pub session_id: Uuid,
    pub upload_url: String,
    pub get_url: String,
    pub upload_token: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pagination_defaults_and_caps() {
        assert_eq!(Pagination::new(None, None), Pagination { limit: 10, offset: 0 });
        assert_eq!(Pagination::new(Some(500), Some(20)).limit, 100);
        assert_eq!(Pagination::new(Some(0), Some(-3)), Pagination { limit: 10, offset: 0 });
    }
}
