//! Bearer tokens issued by the accounts service.

use crate::api::ErrorResponse;
use crate::config::AuthConfig;
use async_trait::async_trait;
use axum::{
    extract::{FromRef, FromRequestParts},
    http::{header::AUTHORIZATION, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const ADMIN_ROLE: &str = "admin";
pub const MODERATOR_ROLE: &str = "moderator";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: Uuid,
    #[serde(default)]
    pub role: String,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing bearer token")]
    MissingToken,

    #[error("Invalid bearer token")]
    InvalidToken,

    #[error("Insufficient role")]
    Forbidden,
}

impl AuthError {
    pub fn reject(self) -> (StatusCode, Json<ErrorResponse>) {
        let (status, code) = match self {
            AuthError::MissingToken | AuthError::InvalidToken => {
                (StatusCode::UNAUTHORIZED, "UNAUTHORIZED")
            }
            AuthError::Forbidden => (StatusCode::FORBIDDEN, "FORBIDDEN"),
        };
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
                code: code.to_string(),
            }),
        )
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        self.reject().into_response()
    }
}

/// Authenticated caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub account_id: Uuid,
    pub role: String,
}

impl Principal {
    /// Admins and moderators may change the official flag
    pub fn can_moderate(&self) -> bool {
        self.role == ADMIN_ROLE || self.role == MODERATOR_ROLE
    }
}

pub struct BearerVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl BearerVerifier {
    pub fn new(config: &AuthConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // Audience belongs to the accounts service's contract, not ours
        validation.validate_aud = false;
        // set_issuer alone still accepts tokens that carry no iss at all
        if let Some(issuer) = &config.issuer {
            validation.set_issuer(&[issuer]);
            validation.set_required_spec_claims(&["exp", "iss"]);
        }

        Self {
            key: DecodingKey::from_secret(config.secret.as_bytes()),
            validation,
        }
    }

    pub fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        let claims = decode::<AccessClaims>(token, &self.key, &self.validation)
            .map_err(|e| {
                debug!(error = %e, "Bearer token rejected");
                AuthError::InvalidToken
            })?
            .claims;

        Ok(Principal {
            account_id: claims.sub,
            role: claims.role,
        })
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
    Arc<BearerVerifier>: FromRef<S>,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or(AuthError::MissingToken)?;

        Arc::<BearerVerifier>::from_ref(state).verify(token.trim())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Utc;
    use jsonwebtoken::{encode, EncodingKey, Header};

    pub(crate) const SECRET: &str = "accounts-secret";

    pub(crate) fn bearer(account_id: Uuid, role: &str) -> String {
        issued_bearer(account_id, role, None)
    }

    fn issued_bearer(account_id: Uuid, role: &str, issuer: Option<&str>) -> String {
        let claims = AccessClaims {
            sub: account_id,
            role: role.to_string(),
            exp: Utc::now().timestamp() + 600,
            iss: issuer.map(str::to_string),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn verifier(issuer: Option<&str>) -> BearerVerifier {
        BearerVerifier::new(&AuthConfig {
            secret: SECRET.to_string(),
            issuer: issuer.map(str::to_string),
        })
    }

    #[test]
    fn test_valid_token_yields_principal() {
        let account = Uuid::new_v4();
        let principal = verifier(None).verify(&bearer(account, "admin")).unwrap();

        assert_eq!(principal.account_id, account);
        assert!(principal.can_moderate());
    }

    #[test]
    fn test_plain_users_cannot_moderate() {
        let principal = verifier(None)
            .verify(&bearer(Uuid::new_v4(), "user"))
            .unwrap();
        assert!(!principal.can_moderate());
    }

    #[test]
    fn test_rejects_foreign_signature_and_missing_issuer() {
        let foreign = BearerVerifier::new(&AuthConfig {
            secret: "other".to_string(),
            issuer: None,
        });
        let token = bearer(Uuid::new_v4(), "user");

        assert_eq!(foreign.verify(&token), Err(AuthError::InvalidToken));
        assert_eq!(
            verifier(Some("accounts-svc")).verify(&token),
            Err(AuthError::InvalidToken)
        );
    }

    #[test]
    fn test_configured_issuer_must_match() {
        let verifier = verifier(Some("accounts-svc"));
        let account = Uuid::new_v4();

        let principal = verifier
            .verify(&issued_bearer(account, "user", Some("accounts-svc")))
            .unwrap();
        assert_eq!(principal.account_id, account);

        assert_eq!(
            verifier.verify(&issued_bearer(account, "user", Some("someone-else"))),
            Err(AuthError::InvalidToken)
        );
    }
}
