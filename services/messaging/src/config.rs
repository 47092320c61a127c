//! Broker connection settings.
//!
//! [`KafkaConfig`] is deserialized as the `kafka` section of the service
//! configuration and turned into rdkafka `ClientConfig`s for the event
//! producer and the inbox consumer.

use rdkafka::config::ClientConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Security protocol for broker connections
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SecurityProtocol {
    #[default]
    Plaintext,
    Ssl,
    SaslPlaintext,
    SaslSsl,
}

impl SecurityProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityProtocol::Plaintext => "plaintext",
            SecurityProtocol::Ssl => "ssl",
            SecurityProtocol::SaslPlaintext => "sasl_plaintext",
            SecurityProtocol::SaslSsl => "sasl_ssl",
        }
    }

    fn uses_sasl(&self) -> bool {
        matches!(self, SecurityProtocol::SaslPlaintext | SecurityProtocol::SaslSsl)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SaslMechanism {
    #[default]
    Plain,
    ScramSha256,
    ScramSha512,
}

impl SaslMechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaslMechanism::Plain => "PLAIN",
            SaslMechanism::ScramSha256 => "SCRAM-SHA-256",
            SaslMechanism::ScramSha512 => "SCRAM-SHA-512",
        }
    }
}

/// SSL/TLS file locations
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SslConfig {
    pub ca_location: Option<String>,
    pub certificate_location: Option<String>,
    pub key_location: Option<String>,
    pub key_password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SaslConfig {
    #[serde(default)]
    pub mechanism: SaslMechanism,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Producer delivery guarantees.
///
/// The outbox dispatcher marks a row dispatched only once the broker acks it,
/// so `acks=all` plus idempotence is the default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerConfig {
    #[serde(default = "default_acks")]
    pub acks: String,
    #[serde(default = "default_true")]
    pub enable_idempotence: bool,
    /// Upper bound for a single delivery, in milliseconds
    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u64,
    #[serde(default = "default_linger_ms")]
    pub linger_ms: u64,
    #[serde(default = "default_compression")]
    pub compression_type: String,
}

fn default_acks() -> String {
    "all".to_string()
}

fn default_true() -> bool {
    true
}

fn default_delivery_timeout_ms() -> u64 {
    30_000
}

fn default_linger_ms() -> u64 {
    5
}

fn default_compression() -> String {
    "lz4".to_string()
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            acks: default_acks(),
            enable_idempotence: true,
            delivery_timeout_ms: default_delivery_timeout_ms(),
            linger_ms: default_linger_ms(),
            compression_type: default_compression(),
        }
    }
}

/// Consumer group settings. Offsets are always committed manually, after the
/// inbox row is durable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default = "default_group_id")]
    pub group_id: String,
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u64,
}

fn default_group_id() -> String {
    "profiles-svc".to_string()
}

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}

fn default_session_timeout_ms() -> u64 {
    30_000
}

fn default_max_poll_interval_ms() -> u64 {
    300_000
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group_id: default_group_id(),
            auto_offset_reset: default_auto_offset_reset(),
            session_timeout_ms: default_session_timeout_ms(),
            max_poll_interval_ms: default_max_poll_interval_ms(),
        }
    }
}

/// Topic names
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    /// Account lifecycle events consumed by the inbox
    #[serde(default = "default_accounts_topic")]
    pub accounts: String,
    /// Profile events published from the outbox
    #[serde(default = "default_profiles_topic")]
    pub profiles: String,
}

fn default_accounts_topic() -> String {
    "accounts.v1".to_string()
}

fn default_profiles_topic() -> String {
    "profiles.v1".to_string()
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            accounts: default_accounts_topic(),
            profiles: default_profiles_topic(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// Comma-separated list of broker addresses
    pub bootstrap_servers: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub security_protocol: SecurityProtocol,
    #[serde(default)]
    pub ssl: SslConfig,
    #[serde(default)]
    pub sasl: SaslConfig,
    #[serde(default)]
    pub producer: ProducerConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub topics: TopicConfig,
    /// Raw librdkafka properties applied last
    #[serde(default)]
    pub extra_properties: HashMap<String, String>,
}

fn default_client_id() -> String {
    "profiles-svc".to_string()
}

impl KafkaConfig {
    pub fn new(bootstrap_servers: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            client_id: default_client_id(),
            security_protocol: SecurityProtocol::default(),
            ssl: SslConfig::default(),
            sasl: SaslConfig::default(),
            producer: ProducerConfig::default(),
            consumer: ConsumerConfig::default(),
            topics: TopicConfig::default(),
            extra_properties: HashMap::new(),
        }
    }

    fn base_client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", &self.bootstrap_servers)
            .set("client.id", &self.client_id)
            .set("security.protocol", self.security_protocol.as_str());

        if let Some(ref ca) = self.ssl.ca_location {
            config.set("ssl.ca.location", ca);
        }
        if let Some(ref cert) = self.ssl.certificate_location {
            config.set("ssl.certificate.location", cert);
        }
        if let Some(ref key) = self.ssl.key_location {
            config.set("ssl.key.location", key);
        }
        if let Some(ref password) = self.ssl.key_password {
            config.set("ssl.key.password", password);
        }

        if self.security_protocol.uses_sasl() {
            config.set("sasl.mechanism", self.sasl.mechanism.as_str());
            if let Some(ref username) = self.sasl.username {
                config.set("sasl.username", username);
            }
            if let Some(ref password) = self.sasl.password {
                config.set("sasl.password", password);
            }
        }

        for (key, value) in &self.extra_properties {
            config.set(key, value);
        }

        config
    }

    pub fn build_producer_config(&self) -> ClientConfig {
        let mut config = self.base_client_config();

        config
            .set("acks", &self.producer.acks)
            .set(
                "enable.idempotence",
                self.producer.enable_idempotence.to_string(),
            )
            .set(
                "message.timeout.ms",
                self.producer.delivery_timeout_ms.to_string(),
            )
            .set("linger.ms", self.producer.linger_ms.to_string())
            .set("compression.type", &self.producer.compression_type);

        config
    }

    pub fn build_consumer_config(&self) -> ClientConfig {
        let mut config = self.base_client_config();

        config
            .set("group.id", &self.consumer.group_id)
            .set("auto.offset.reset", &self.consumer.auto_offset_reset)
            .set("enable.auto.commit", "false")
            .set(
                "session.timeout.ms",
                self.consumer.session_timeout_ms.to_string(),
            )
            .set(
                "max.poll.interval.ms",
                self.consumer.max_poll_interval_ms.to_string(),
            );

        config
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.producer.delivery_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bootstrap_servers.trim().is_empty() {
            return Err(ConfigError::MissingRequired("kafka.bootstrap_servers".to_string()));
        }

        if self.consumer.group_id.trim().is_empty() {
            return Err(ConfigError::MissingRequired("kafka.consumer.group_id".to_string()));
        }

        if self.topics.accounts.is_empty() || self.topics.profiles.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "kafka.topics".to_string(),
                message: "topic names must not be empty".to_string(),
            });
        }

        if self.security_protocol.uses_sasl() && self.sasl.username.is_none() {
            return Err(ConfigError::MissingRequired(
                "kafka.sasl.username (required for SASL)".to_string(),
            ));
        }

        Ok(())
    }
}
