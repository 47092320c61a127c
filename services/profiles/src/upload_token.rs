//! Upload tokens bind an upload session to the account that opened it.
//!
//! The client receives one together with the presigned URLs and must present
//! it when confirming or cancelling the session.

use crate::error::{ProfileError, ProfileResult};
use anyhow::Context;
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Resource scope carried by profile avatar tokens
pub const PROFILE_RESOURCE: &str = "profile";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadClaims {
    pub sub: String,
    pub iss: String,
    pub aud: String,
    pub exp: i64,
    pub iat: i64,
    pub upload_session_id: Uuid,
    pub resource: String,
    pub resource_id: String,
}

pub struct UploadTokenManager {
    issuer: String,
    ttl: Duration,
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl UploadTokenManager {
    pub fn new(issuer: impl Into<String>, secret: &str, ttl: Duration) -> Self {
        Self {
            issuer: issuer.into(),
            ttl,
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    pub fn issue(&self, account_id: Uuid, session_id: Uuid) -> ProfileResult<String> {
        let now = Utc::now().timestamp();
        let claims = UploadClaims {
            sub: account_id.to_string(),
            iss: self.issuer.clone(),
            aud: self.issuer.clone(),
            exp: now + self.ttl.as_secs() as i64,
            iat: now,
            upload_session_id: session_id,
            resource: PROFILE_RESOURCE.to_string(),
            resource_id: account_id.to_string(),
        };

        let token = encode(&Header::default(), &claims, &self.encoding)
            .context("Failed to sign upload token")?;
        Ok(token)
    }

    /// Check the token and return the session it was issued for
    pub fn verify(&self, token: &str, account_id: Uuid) -> ProfileResult<Uuid> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.issuer]);

        let claims = decode::<UploadClaims>(token, &self.decoding, &validation)
            .map_err(|e| {
                debug!(error = %e, "Upload token rejected");
                ProfileError::InvalidUploadToken
            })?
            .claims;

        let account = account_id.to_string();
        if claims.sub != account
            || claims.resource_id != account
            || claims.resource != PROFILE_RESOURCE
        {
            return Err(ProfileError::InvalidUploadToken);
        }

        Ok(claims.upload_session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> UploadTokenManager {
        UploadTokenManager::new("profiles-svc", "upload-secret", Duration::from_secs(3600))
    }

    #[test]
    fn test_token_yields_its_session() {
        let tokens = manager();
        let (account, session) = (Uuid::new_v4(), Uuid::new_v4());

        let token = tokens.issue(account, session).unwrap();
        assert_eq!(tokens.verify(&token, account).unwrap(), session);
    }

    #[test]
    fn test_token_is_bound_to_its_account() {
        let tokens = manager();
        let token = tokens.issue(Uuid::new_v4(), Uuid::new_v4()).unwrap();

        assert!(matches!(
            tokens.verify(&token, Uuid::new_v4()),
            Err(ProfileError::InvalidUploadToken)
        ));
    }

    #[test]
    fn test_foreign_signature_and_issuer_are_rejected() {
        let account = Uuid::new_v4();
        let forged = UploadTokenManager::new("profiles-svc", "other-secret", Duration::from_secs(60))
            .issue(account, Uuid::new_v4())
            .unwrap();
        let foreign = UploadTokenManager::new("media-svc", "upload-secret", Duration::from_secs(60))
            .issue(account, Uuid::new_v4())
            .unwrap();

        assert!(manager().verify(&forged, account).is_err());
        assert!(manager().verify(&foreign, account).is_err());
        assert!(manager().verify("not-a-jwt", account).is_err());
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let tokens = manager();
        let account = Uuid::new_v4();
        let now = Utc::now().timestamp();
        let claims = UploadClaims {
            sub: account.to_string(),
            iss: "profiles-svc".to_string(),
            aud: "profiles-svc".to_string(),
            exp: now - 3600,
            iat: now - 7200,
            upload_session_id: Uuid::new_v4(),
            resource: PROFILE_RESOURCE.to_string(),
            resource_id: account.to_string(),
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"upload-secret"),
        )
        .unwrap();

        assert!(tokens.verify(&token, account).is_err());
    }
}
