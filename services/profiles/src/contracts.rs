//! Event types and payloads exchanged over the broker.
//!
//! Payloads are decoded leniently: unknown fields are ignored so older
//! consumers keep working when producers add fields.

use crate::models::Profile;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const ACCOUNT_CREATED: &str = "account.created";
pub const ACCOUNT_USERNAME_UPDATED: &str = "account.username.updated";
pub const ACCOUNT_DELETED: &str = "account.deleted";

pub const PROFILE_CREATED: &str = "profile.created";
pub const PROFILE_UPDATED: &str = "profile.updated";
pub const PROFILE_OFFICIAL_UPDATED: &str = "profile.official.updated";
pub const PROFILE_DELETED: &str = "profile.deleted";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountCreated {
    pub account_id: Uuid,
    pub username: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountUsernameUpdated {
    pub account_id: Uuid,
    pub new_username: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountDeleted {
    pub account_id: Uuid,
    pub deleted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileCreated {
    pub account_id: Uuid,
    pub username: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileUpdated {
    pub account_id: Uuid,
    pub username: String,
    pub official: bool,
    pub pseudonym: Option<String>,
    pub description: Option<String>,
    pub avatar: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileOfficialUpdated {
    pub account_id: Uuid,
    pub official: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileDeleted {
    pub account_id: Uuid,
    pub deleted_at: DateTime<Utc>,
}

impl From<&Profile> for ProfileCreated {
    fn from(p: &Profile) -> Self {
        Self {
            account_id: p.account_id,
            username: p.username.clone(),
            created_at: p.created_at,
        }
    }
}

impl From<&Profile> for ProfileUpdated {
    fn from(p: &Profile) -> Self {
        Self {
            account_id: p.account_id,
            username: p.username.clone(),
            official: p.official,
            pseudonym: p.pseudonym.clone(),
            description: p.description.clone(),
            avatar: p.avatar.clone(),
            updated_at: p.updated_at,
        }
    }
}

impl From<&Profile> for ProfileOfficialUpdated {
    fn from(p: &Profile) -> Self {
        Self {
            account_id: p.account_id,
            official: p.official,
            updated_at: p.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_created_ignores_unknown_fields() {
        let raw = r#"{
            "account_id": "6f1f8a52-9a53-4c33-9a38-3a3f4e0d2f11",
            "username": "alice",
            "email": "alice@example.com",
            "created_at": "2024-03-01T10:00:00Z"
        }"#;

        let event: AccountCreated = serde_json::from_str(raw).unwrap();
        assert_eq!(event.username, "alice");
    }

    #[test]
    fn test_profile_updated_carries_clearable_fields() {
        let mut profile = Profile::new(Uuid::new_v4(), "alice");
        profile.avatar = Some(format!("profile/avatar/{}", profile.account_id));

        let json = serde_json::to_value(ProfileUpdated::from(&profile)).unwrap();
        assert_eq!(json["username"], "alice");
        assert!(json["pseudonym"].is_null());
        assert_eq!(json["avatar"], format!("profile/avatar/{}", profile.account_id));
    }
}
