//! Queue configuration for the Vigil pipeline.
//!
//! The queue section selects a backend (in-process memory queue or Kafka),
//! the topic names used for raw detection metadata and critical alerts, and
//! the timing of receive polls and reconnect attempts.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Which queue implementation backs the ingest adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueueBackend {
    #[default]
    Memory,
    Kafka,
}

/// Topic names used by the analytics pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    /// Topic carrying raw detection metadata from external producers
    #[serde(default = "default_metadata_raw_topic")]
    pub metadata_raw: String,
    /// Topic receiving republished, persisted alerts
    #[serde(default = "default_alerts_critical_topic")]
    pub alerts_critical: String,
}

fn default_metadata_raw_topic() -> String {
    "vigil.metadata.raw".to_string()
}

fn default_alerts_critical_topic() -> String {
    "vigil.alerts.critical".to_string()
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            metadata_raw: default_metadata_raw_topic(),
            alerts_critical: default_alerts_critical_topic(),
        }
    }
}

/// Security protocol for Kafka connections
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
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

/// SASL credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaslConfig {
    /// PLAIN, SCRAM-SHA-256 or SCRAM-SHA-512
    #[serde(default = "default_sasl_mechanism")]
    pub mechanism: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

fn default_sasl_mechanism() -> String {
    "PLAIN".to_string()
}

impl Default for SaslConfig {
    fn default() -> Self {
        Self {
            mechanism: default_sasl_mechanism(),
            username: None,
            password: None,
        }
    }
}

/// Kafka broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// Comma-separated list of broker addresses
    #[serde(default = "default_bootstrap_servers")]
    pub bootstrap_servers: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_group_id")]
    pub group_id: String,
    /// Auto offset reset: earliest, latest, none
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    #[serde(default)]
    pub security_protocol: SecurityProtocol,
    /// Path to CA certificate file
    pub ssl_ca_location: Option<String>,
    #[serde(default)]
    pub sasl: SaslConfig,
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Additional librdkafka properties
    #[serde(default)]
    pub extra_properties: HashMap<String, String>,
}

fn default_bootstrap_servers() -> String {
    "localhost:9092".to_string()
}

fn default_client_id() -> String {
    "vigil".to_string()
}

fn default_group_id() -> String {
    "vigil-metadata-ingest".to_string()
}

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}

fn default_session_timeout_ms() -> u64 {
    30000
}

fn default_request_timeout_ms() -> u64 {
    30000
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: default_bootstrap_servers(),
            client_id: default_client_id(),
            group_id: default_group_id(),
            auto_offset_reset: default_auto_offset_reset(),
            security_protocol: SecurityProtocol::default(),
            ssl_ca_location: None,
            sasl: SaslConfig::default(),
            session_timeout_ms: default_session_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            extra_properties: HashMap::new(),
        }
    }
}

impl KafkaConfig {
    pub fn new(bootstrap_servers: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            ..Default::default()
        }
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bootstrap_servers.is_empty() {
            return Err(ConfigError::MissingRequired(
                "queue.kafka.bootstrap_servers".to_string(),
            ));
        }
        if self.group_id.is_empty() {
            return Err(ConfigError::MissingRequired(
                "queue.kafka.group_id".to_string(),
            ));
        }
        if self.security_protocol.uses_sasl() && self.sasl.username.is_none() {
            return Err(ConfigError::MissingRequired(
                "queue.kafka.sasl.username (required for SASL)".to_string(),
            ));
        }
        Ok(())
    }

    #[cfg(feature = "kafka")]
    fn build_base_config(&self) -> rdkafka::config::ClientConfig {
        let mut config = rdkafka::config::ClientConfig::new();

        config.set("bootstrap.servers", &self.bootstrap_servers);
        config.set("client.id", &self.client_id);
        config.set("security.protocol", self.security_protocol.as_str());

        if let Some(ref ca) = self.ssl_ca_location {
            config.set("ssl.ca.location", ca);
        }

        if self.security_protocol.uses_sasl() {
            config.set("sasl.mechanism", &self.sasl.mechanism);
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

    /// Build a producer ClientConfig
    #[cfg(feature = "kafka")]
    pub fn build_producer_config(&self) -> rdkafka::config::ClientConfig {
        let mut config = self.build_base_config();
        config.set("acks", "all");
        config.set("enable.idempotence", "true");
        config.set("request.timeout.ms", self.request_timeout_ms.to_string());
        config
    }

    /// Build a consumer ClientConfig. Offsets are committed manually after
    /// each message is acknowledged.
    #[cfg(feature = "kafka")]
    pub fn build_consumer_config(&self) -> rdkafka::config::ClientConfig {
        let mut config = self.build_base_config();
        config.set("group.id", &self.group_id);
        config.set("auto.offset.reset", &self.auto_offset_reset);
        config.set("enable.auto.commit", "false");
        config.set("session.timeout.ms", self.session_timeout_ms.to_string());
        config
    }
}

/// Queue section of the service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default)]
    pub backend: QueueBackend,
    /// How long a single receive waits before returning empty
    #[serde(default = "default_receive_timeout_ms")]
    pub receive_timeout_ms: u64,
    /// Pause between reconnect attempts after a connection loss
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,
    #[serde(default)]
    pub topics: TopicConfig,
    #[serde(default)]
    pub kafka: KafkaConfig,
}

fn default_receive_timeout_ms() -> u64 {
    1000
}

fn default_reconnect_backoff_ms() -> u64 {
    5000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackend::default(),
            receive_timeout_ms: default_receive_timeout_ms(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
            topics: TopicConfig::default(),
            kafka: KafkaConfig::default(),
        }
    }
}

impl QueueConfig {
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.receive_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "queue.receive_timeout_ms".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        if self.topics.metadata_raw.is_empty() {
            return Err(ConfigError::MissingRequired(
                "queue.topics.metadata_raw".to_string(),
            ));
        }
        if self.topics.alerts_critical.is_empty() {
            return Err(ConfigError::MissingRequired(
                "queue.topics.alerts_critical".to_string(),
            ));
        }
        if self.backend == QueueBackend::Kafka {
            self.kafka.validate()?;
        }
        Ok(())
    }
}
