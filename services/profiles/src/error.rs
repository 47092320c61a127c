use crate::media_validator::MediaError;
use thiserror::Error;

/// Errors surfaced by profile operations
#[derive(Error, Debug)]
pub enum ProfileError {
    #[error(transparent)]
    Media(#[from] MediaError),

    #[error("Profile not found")]
    ProfileNotFound,

    #[error("Username is already taken")]
    UsernameAlreadyTaken,

    #[error("Username is not allowed: {0}")]
    UsernameNotAllowed(String),

    #[error("Invalid upload token")]
    InvalidUploadToken,

    #[error("Internal error: {0:#}")]
    Internal(#[from] anyhow::Error),
}

impl ProfileError {
    /// Terminal, caller-facing failures. Retrying them cannot succeed.
    pub fn is_rejection(&self) -> bool {
        !matches!(self, ProfileError::Internal(_))
    }

    /// Stable machine-readable code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            ProfileError::Media(e) => e.code(),
            ProfileError::ProfileNotFound => "PROFILE_NOT_FOUND",
            ProfileError::UsernameAlreadyTaken => "USERNAME_ALREADY_TAKEN",
            ProfileError::UsernameNotAllowed(_) => "USERNAME_NOT_ALLOWED",
            ProfileError::InvalidUploadToken => "INVALID_UPLOAD_TOKEN",
            ProfileError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type ProfileResult<T> = std::result::Result<T, ProfileError>;
