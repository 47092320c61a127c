use profiles_messaging::KafkaConfig;
use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the profiles service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub api: ApiConfig,
    pub database: DatabaseConfig,
    pub s3: S3Config,
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub avatar: AvatarConfig,
    pub upload_token: UploadTokenConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub outbox: OutboxConfig,
    #[serde(default)]
    pub inbox: InboxConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name, also the `producer` header and token issuer
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// REST API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins (empty = any)
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Object storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
}

/// Avatar upload policy
#[derive(Debug, Clone, Deserialize)]
pub struct AvatarConfig {
    /// Largest accepted object, in bytes
    #[serde(default = "default_max_content_length")]
    pub max_content_length: u64,
    /// How many leading bytes are fetched for validation
    #[serde(default = "default_probe_max_bytes")]
    pub probe_max_bytes: u64,
    #[serde(default = "default_max_dimension")]
    pub max_width: u32,
    #[serde(default = "default_max_dimension")]
    pub max_height: u32,
    #[serde(default = "default_allowed_formats")]
    pub allowed_formats: Vec<String>,
    #[serde(default = "default_allowed_content_types")]
    pub allowed_content_types: Vec<String>,
    /// Lifetime of the presigned URLs and the upload token
    #[serde(default = "default_upload_ttl_secs")]
    pub upload_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadTokenConfig {
    /// HMAC secret for upload tokens
    pub secret: String,
}

/// Verification of bearer tokens issued by the accounts service
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    pub secret: String,
    /// Expected `iss` claim; not checked when absent
    pub issuer: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutboxConfig {
    #[serde(default = "default_outbox_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How long a claimed row stays invisible to other dispatchers
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_retry_max_secs")]
    pub retry_max_secs: u64,
}

/// Status given to inbox events of a type this service does not handle
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum UnknownEventPolicy {
    #[default]
    Processed,
    Failed,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InboxConfig {
    /// Number of concurrent inbox workers
    #[serde(default = "default_inbox_workers")]
    pub workers: usize,
    #[serde(default = "default_inbox_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    #[serde(default)]
    pub unknown_event_policy: UnknownEventPolicy,
}

// Default value functions
fn default_service_name() -> String {
    "profiles-svc".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_max_content_length() -> u64 {
    5 * 1024 * 1024 // 5 MiB
}

fn default_probe_max_bytes() -> u64 {
    512 * 1024 // 512 KiB
}

fn default_max_dimension() -> u32 {
    512
}

fn default_allowed_formats() -> Vec<String> {
    ["png", "jpeg", "jpg", "gif"].iter().map(|s| s.to_string()).collect()
}

fn default_allowed_content_types() -> Vec<String> {
    ["image/png", "image/jpeg", "image/jpg", "image/gif"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_upload_ttl_secs() -> u64 {
    3600
}

fn default_outbox_batch_size() -> u32 {
    50
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_lease_secs() -> u64 {
    30
}

fn default_retry_base_ms() -> u64 {
    500
}

fn default_retry_max_secs() -> u64 {
    300
}

fn default_inbox_workers() -> usize {
    2
}

fn default_inbox_batch_size() -> u32 {
    10
}

fn default_retry_delay_secs() -> u64 {
    60
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/profiles").required(false))
            .add_source(config::File::with_name("/etc/profiles/profiles").required(false))
            // PROFILES__DATABASE__URL -> database.url
            .add_source(
                config::Environment::with_prefix("PROFILES")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("api.cors_origins")
                    .with_list_parse_key("avatar.allowed_formats")
                    .with_list_parse_key("avatar.allowed_content_types"),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the service cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.database.url.trim().is_empty(), "database.url must be set");
        anyhow::ensure!(!self.s3.bucket.trim().is_empty(), "s3.bucket must be set");
        anyhow::ensure!(
            !self.upload_token.secret.trim().is_empty(),
            "upload_token.secret must be set"
        );
        anyhow::ensure!(!self.auth.secret.trim().is_empty(), "auth.secret must be set");
        anyhow::ensure!(
            self.avatar.probe_max_bytes > 0 && self.avatar.max_content_length > 0,
            "avatar size limits must be positive"
        );
        anyhow::ensure!(self.inbox.workers > 0, "inbox.workers must be at least 1");
        // tokio::time::interval panics on a zero period
        anyhow::ensure!(self.inbox.tick_ms > 0, "inbox.tick_ms must be positive");
        anyhow::ensure!(self.inbox.batch_size > 0, "inbox.batch_size must be at least 1");
        anyhow::ensure!(self.inbox.lease_secs > 0, "inbox.lease_secs must be positive");
        anyhow::ensure!(
            self.outbox.poll_interval_ms > 0,
            "outbox.poll_interval_ms must be positive"
        );
        anyhow::ensure!(self.outbox.batch_size > 0, "outbox.batch_size must be at least 1");
        anyhow::ensure!(self.outbox.lease_secs > 0, "outbox.lease_secs must be positive");
        self.kafka.validate()?;
        Ok(())
    }
}

impl AvatarConfig {
    pub fn upload_ttl(&self) -> Duration {
        Duration::from_secs(self.upload_ttl_secs)
    }
}

impl DatabaseConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl OutboxConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    /// Delay before the next publish attempt of a row that failed `attempts` times
    pub fn retry_backoff(&self, attempts: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempts.saturating_sub(1).min(16));
        let delay = Duration::from_millis(self.retry_base_ms.saturating_mul(factor));
        delay.min(Duration::from_secs(self.retry_max_secs))
    }
}

impl InboxConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
        }
    }
}

impl Default for AvatarConfig {
    fn default() -> Self {
        Self {
            max_content_length: default_max_content_length(),
            probe_max_bytes: default_probe_max_bytes(),
            max_width: default_max_dimension(),
            max_height: default_max_dimension(),
            allowed_formats: default_allowed_formats(),
            allowed_content_types: default_allowed_content_types(),
            upload_ttl_secs: default_upload_ttl_secs(),
        }
    }
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            batch_size: default_outbox_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
            lease_secs: default_lease_secs(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_secs: default_retry_max_secs(),
        }
    }
}

impl Default for InboxConfig {
    fn default() -> Self {
        Self {
            workers: default_inbox_workers(),
            batch_size: default_inbox_batch_size(),
            tick_ms: default_poll_interval_ms(),
            retry_delay_secs: default_retry_delay_secs(),
            lease_secs: default_lease_secs(),
            unknown_event_policy: UnknownEventPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Config {
        let source = config::Config::builder()
            .add_source(config::File::from_str(
                r#"
                [database]
                url = "postgres://localhost/profiles"

                [s3]
                bucket = "avatars"

                [kafka]
                bootstrap_servers = "localhost:9092"

                [upload_token]
                secret = "upload-secret"

                [auth]
                secret = "auth-secret"
                "#,
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap();
        source.try_deserialize().unwrap()
    }

    #[test]
    fn test_default_values() {
        let config = minimal();

        assert_eq!(config.service.name, "profiles-svc");
        assert_eq!(config.avatar.max_content_length, 5 * 1024 * 1024);
        assert_eq!(config.avatar.probe_max_bytes, 512 * 1024);
        assert_eq!((config.avatar.max_width, config.avatar.max_height), (512, 512));
        assert_eq!(config.avatar.upload_ttl(), Duration::from_secs(3600));
        assert_eq!(config.inbox.tick(), Duration::from_millis(500));
        assert_eq!(config.inbox.batch_size, 10);
        assert_eq!(config.inbox.retry_delay(), Duration::from_secs(60));
        assert_eq!(config.inbox.unknown_event_policy, UnknownEventPolicy::Processed);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_blank_secret() {
        let mut config = minimal();
        config.upload_token.secret = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_idle_loops() {
        let mut config = minimal();
        config.inbox.tick_ms = 0;
        assert!(config.validate().is_err());

        let mut config = minimal();
        config.outbox.poll_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = minimal();
        config.inbox.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = minimal();
        config.outbox.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_outbox_backoff_grows_and_caps() {
        let outbox = OutboxConfig::default();

        assert_eq!(outbox.retry_backoff(1), Duration::from_millis(500));
        assert_eq!(outbox.retry_backoff(2), Duration::from_millis(1000));
        assert_eq!(outbox.retry_backoff(4), Duration::from_millis(4000));
        assert_eq!(outbox.retry_backoff(40), Duration::from_secs(300));
    }
}
