use crate::auth::{AuthError, BearerVerifier, Principal};
use crate::config::ApiConfig;
use crate::error::ProfileError;
use crate::models::{Page, Pagination, Profile, ProfileFilter, UpdateProfileParams, UploadSession};
use crate::service::ProfileService;
use anyhow::{Context, Result};
use axum::{
    extract::{FromRef, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, patch, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};
use uuid::Uuid;

pub const BASE_PATH: &str = "/profiles-svc/v1/profiles";

/// Header carrying the token returned with an upload session
pub const UPLOAD_TOKEN_HEADER: &str = "x-upload-token";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ProfileService>,
    pub verifier: Arc<BearerVerifier>,
}

impl FromRef<AppState> for Arc<BearerVerifier> {
    fn from_ref(state: &AppState) -> Self {
        state.verifier.clone()
    }
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

#[derive(Debug, Deserialize)]
pub struct ProfileListQuery {
    pub username_prefix: Option<String>,
    pub pseudonym_prefix: Option<String>,
    pub official: Option<bool>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Full replacement of the caller's editable fields
#[derive(Debug, Deserialize)]
pub struct UpdateProfileRequest {
    pub pseudonym: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub delete_avatar: bool,
}

#[derive(Debug, Deserialize)]
pub struct OfficialRequest {
    pub official: bool,
}

fn profile_error(err: ProfileError) -> ApiError {
    let status = match &err {
        ProfileError::Media(_)
        | ProfileError::UsernameAlreadyTaken
        | ProfileError::UsernameNotAllowed(_) => StatusCode::BAD_REQUEST,
        ProfileError::ProfileNotFound => StatusCode::NOT_FOUND,
        ProfileError::InvalidUploadToken => StatusCode::UNAUTHORIZED,
        ProfileError::Internal(e) => {
            error!(error = %e, "Request failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "Internal server error".to_string(),
                    code: err.code().to_string(),
                }),
            );
        }
    };

    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
            code: err.code().to_string(),
        }),
    )
}

/// `/me` routes do not reveal whether the caller's profile exists
fn me_error(err: ProfileError) -> ApiError {
    let (status, body) = profile_error(err);
    if status == StatusCode::NOT_FOUND {
        return (StatusCode::UNAUTHORIZED, body);
    }
    (status, body)
}

/// Session carried by the caller's `X-Upload-Token`
fn session_from_upload_token(
    state: &AppState,
    headers: &HeaderMap,
    principal: &Principal,
) -> Result<Uuid, ApiError> {
    let token = headers
        .get(UPLOAD_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| profile_error(ProfileError::InvalidUploadToken))?;

    state
        .service
        .verify_upload_token(token, principal.account_id)
        .map_err(profile_error)
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    let profiles = Router::new()
        .route("/", get(list_profiles))
        .route("/u/:username", get(get_profile_by_username))
        .route("/me", get(get_me).put(update_me))
        .route(
            "/me/upload-session",
            post(open_upload_session).delete(cancel_upload_session),
        )
        .route("/:account_id", get(get_profile))
        .route("/:account_id/official", patch(update_official));

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .nest(BASE_PATH, profiles)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "profiles-svc"
    }))
}

async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.service.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

#[instrument(skip(state))]
async fn list_profiles(
    State(state): State<AppState>,
    Query(params): Query<ProfileListQuery>,
) -> Result<Json<Page<Profile>>, ApiError> {
    let filter = ProfileFilter {
        username_prefix: params.username_prefix,
        pseudonym_prefix: params.pseudonym_prefix,
        official: params.official,
    };

    let page = state
        .service
        .filter_profiles(&filter, Pagination::new(params.limit, params.offset))
        .await
        .map_err(profile_error)?;
    Ok(Json(page))
}

async fn get_profile_by_username(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Json<Profile>, ApiError> {
    state
        .service
        .get_profile_by_username(&username)
        .await
        .map(Json)
        .map_err(profile_error)
}

async fn get_profile(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
) -> Result<Json<Profile>, ApiError> {
    state
        .service
        .get_profile_by_account_id(account_id)
        .await
        .map(Json)
        .map_err(profile_error)
}

async fn get_me(
    State(state): State<AppState>,
    principal: Principal,
) -> Result<Json<Profile>, ApiError> {
    state
        .service
        .get_profile_by_account_id(principal.account_id)
        .await
        .map(Json)
        .map_err(me_error)
}

#[instrument(skip(state, headers, body), fields(account_id = %principal.account_id))]
async fn update_me(
    State(state): State<AppState>,
    principal: Principal,
    headers: HeaderMap,
    Json(body): Json<UpdateProfileRequest>,
) -> Result<Json<Profile>, ApiError> {
    let upload_session_id = session_from_upload_token(&state, &headers, &principal)?;

    let params = UpdateProfileParams {
        pseudonym: body.pseudonym,
        description: body.description,
        delete_avatar: body.delete_avatar,
        upload_session_id,
    };

    state
        .service
        .update_profile(principal.account_id, params)
        .await
        .map(Json)
        .map_err(me_error)
}

async fn open_upload_session(
    State(state): State<AppState>,
    principal: Principal,
) -> Result<(StatusCode, Json<UploadSession>), ApiError> {
    let session = state
        .service
        .open_upload_session(principal.account_id)
        .await
        .map_err(me_error)?;
    Ok((StatusCode::CREATED, Json(session)))
}

async fn cancel_upload_session(
    State(state): State<AppState>,
    principal: Principal,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let session_id = session_from_upload_token(&state, &headers, &principal)?;

    state
        .service
        .cancel_upload_session(principal.account_id, session_id)
        .await
        .map_err(me_error)?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(state, principal, body), fields(caller = %principal.account_id))]
async fn update_official(
    State(state): State<AppState>,
    principal: Principal,
    Path(account_id): Path<Uuid>,
    Json(body): Json<OfficialRequest>,
) -> Result<Json<Profile>, ApiError> {
    if !principal.can_moderate() {
        return Err(AuthError::Forbidden.reject());
    }

    state
        .service
        .update_profile_official(account_id, body.official)
        .await
        .map(Json)
        .map_err(profile_error)
}

/// Serve the API until `shutdown` fires
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting profiles API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server error")?;

    info!("Profiles API server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::tests::{bearer, SECRET};
    use crate::config::{AuthConfig, AvatarConfig};
    use crate::media_validator::tests::encode;
    use crate::memory::{InMemoryObjectStore, InMemoryStore};
    use crate::outbox::OutboxWriter;
    use crate::upload_session::{temp_key, UploadSessionManager};
    use crate::upload_token::UploadTokenManager;
    use axum::body::Body;
    use axum::http::{header, Method, Request};
    use http_body_util::BodyExt;
    use image::ImageFormat;
    use std::time::Duration;
    use tower::ServiceExt;

    struct Harness {
        router: Router,
        service: Arc<ProfileService>,
        objects: Arc<InMemoryObjectStore>,
    }

    fn harness() -> Harness {
        let objects = Arc::new(InMemoryObjectStore::new());
        let service = Arc::new(ProfileService::new(
            Arc::new(InMemoryStore::new()),
            UploadSessionManager::new(objects.clone(), &AvatarConfig::default()),
            UploadTokenManager::new("profiles-svc", "upload-secret", Duration::from_secs(3600)),
            OutboxWriter::new("profiles.v1", "profiles-svc"),
        ));
        let state = AppState {
            service: service.clone(),
            verifier: Arc::new(BearerVerifier::new(&AuthConfig {
                secret: SECRET.to_string(),
                issuer: None,
            })),
        };
        Harness {
            router: create_router(state, &ApiConfig::default()),
            service,
            objects,
        }
    }

    fn request(method: Method, uri: &str, bearer_token: Option<&str>) -> axum::http::request::Builder {
        let builder = Request::builder().method(method).uri(uri);
        match bearer_token {
            Some(token) => builder.header(header::AUTHORIZATION, format!("Bearer {token}")),
            None => builder,
        }
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn json_body(value: serde_json::Value) -> Body {
        Body::from(serde_json::to_vec(&value).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let h = harness();
        let (status, body) = send(
            &h.router,
            request(Method::GET, "/health", None).body(Body::empty()).unwrap(),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_public_reads() {
        let h = harness();
        let account = Uuid::new_v4();
        h.service.create_profile(account, "alice").await.unwrap();
        h.service.create_profile(Uuid::new_v4(), "bob").await.unwrap();

        let (status, body) = send(
            &h.router,
            request(Method::GET, &format!("{BASE_PATH}/u/alice"), None)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["account_id"], account.to_string());

        let (status, body) = send(
            &h.router,
            request(Method::GET, &format!("{BASE_PATH}?username_prefix=al&limit=5"), None)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 1);
        assert_eq!(body["limit"], 5);
        assert_eq!(body["data"][0]["username"], "alice");

        let (status, body) = send(
            &h.router,
            request(Method::GET, &format!("{BASE_PATH}/{}", Uuid::new_v4()), None)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "PROFILE_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_me_requires_bearer_and_hides_missing_profile() {
        let h = harness();

        let (status, _) = send(
            &h.router,
            request(Method::GET, &format!("{BASE_PATH}/me"), None)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let token = bearer(Uuid::new_v4(), "user");
        let (status, body) = send(
            &h.router,
            request(Method::GET, &format!("{BASE_PATH}/me"), Some(&token))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "PROFILE_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_upload_flow_sets_avatar() {
        let h = harness();
        let account = Uuid::new_v4();
        h.service.create_profile(account, "alice").await.unwrap();
        let token = bearer(account, "user");

        let (status, session) = send(
            &h.router,
            request(Method::POST, &format!("{BASE_PATH}/me/upload-session"), Some(&token))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let session_id: Uuid = session["session_id"].as_str().unwrap().parse().unwrap();
        h.objects.put(
            &temp_key(account, session_id),
            encode(128, 128, ImageFormat::Png),
        );

        let (status, body) = send(
            &h.router,
            request(Method::PUT, &format!("{BASE_PATH}/me"), Some(&token))
                .header(UPLOAD_TOKEN_HEADER, session["upload_token"].as_str().unwrap())
                .header(header::CONTENT_TYPE, "application/json")
                .body(json_body(serde_json::json!({ "pseudonym": "Ally" })))
                .unwrap(),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pseudonym"], "Ally");
        assert_eq!(body["avatar"], format!("profile/avatar/{account}"));
    }

    #[tokio::test]
    async fn test_rejected_upload_reports_policy() {
        let h = harness();
        let account = Uuid::new_v4();
        h.service.create_profile(account, "alice").await.unwrap();
        let session = h.service.open_upload_session(account).await.unwrap();
        h.objects.put(
            &temp_key(account, session.session_id),
            encode(600, 600, ImageFormat::Png),
        );

        let (status, body) = send(
            &h.router,
            request(Method::PUT, &format!("{BASE_PATH}/me"), Some(&bearer(account, "user")))
                .header(UPLOAD_TOKEN_HEADER, session.upload_token.as_str())
                .header(header::CONTENT_TYPE, "application/json")
                .body(json_body(serde_json::json!({})))
                .unwrap(),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "RESOLUTION_TOO_LARGE");
    }

    #[tokio::test]
    async fn test_update_without_upload_token_is_unauthorized() {
        let h = harness();
        let account = Uuid::new_v4();
        h.service.create_profile(account, "alice").await.unwrap();
        let other_session = h.service.open_upload_session(Uuid::new_v4()).await.unwrap();

        for upload_token in [None, Some(other_session.upload_token.as_str())] {
            let mut builder = request(Method::PUT, &format!("{BASE_PATH}/me"), Some(&bearer(account, "user")))
                .header(header::CONTENT_TYPE, "application/json");
            if let Some(t) = upload_token {
                builder = builder.header(UPLOAD_TOKEN_HEADER, t);
            }
            let (status, body) =
                send(&h.router, builder.body(json_body(serde_json::json!({}))).unwrap()).await;

            assert_eq!(status, StatusCode::UNAUTHORIZED);
            assert_eq!(body["code"], "INVALID_UPLOAD_TOKEN");
        }
    }

    #[tokio::test]
    async fn test_cancel_upload_session() {
        let h = harness();
        let account = Uuid::new_v4();
        let session = h.service.open_upload_session(account).await.unwrap();
        let key = temp_key(account, session.session_id);
        h.objects.put(&key, vec![1, 2, 3]);

        let (status, _) = send(
            &h.router,
            request(Method::DELETE, &format!("{BASE_PATH}/me/upload-session"), Some(&bearer(account, "user")))
                .header(UPLOAD_TOKEN_HEADER, session.upload_token.as_str())
                .body(Body::empty())
                .unwrap(),
        )
        .await;

        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(!h.objects.contains(&key));
    }

    #[tokio::test]
    async fn test_official_flag_requires_moderation_role() {
        let h = harness();
        let account = Uuid::new_v4();
        h.service.create_profile(account, "alice").await.unwrap();
        let uri = format!("{BASE_PATH}/{account}/official");

        let (status, body) = send(
            &h.router,
            request(Method::PATCH, &uri, Some(&bearer(Uuid::new_v4(), "user")))
                .header(header::CONTENT_TYPE, "application/json")
                .body(json_body(serde_json::json!({ "official": true })))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "FORBIDDEN");

        let (status, body) = send(
            &h.router,
            request(Method::PATCH, &uri, Some(&bearer(Uuid::new_v4(), "moderator")))
                .header(header::CONTENT_TYPE, "application/json")
                .body(json_body(serde_json::json!({ "official": true })))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["official"], true);
    }
}
