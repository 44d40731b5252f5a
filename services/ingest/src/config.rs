//! Configuration management for the Vigil service.
//!
//! This module handles loading and validating configuration from environment
//! variables and configuration files. Sections owned by other crates (queue,
//! detection, distributor, database) are embedded as-is.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::time::Duration;
pub use vigil_analytics::ConfigValidationError;
use vigil_analytics::{DatabaseConfig, DetectionConfig, DistributorConfig};
use vigil_pipeline::QueueConfig;

/// Main configuration for the service.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VigilConfig {
    #[serde(default)]
    pub sessions: SessionConfig,

    #[serde(default)]
    pub segments: SegmentConfig,

    #[serde(default)]
    pub rtsp: RtspConfig,

    #[serde(default)]
    pub detection: DetectionConfig,

    #[serde(default)]
    pub distributor: DistributorConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Streams started when the service boots
    #[serde(default)]
    pub streams: Vec<StreamDefinition>,
}

/// Stream session behaviour.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Attempts to open a source before a start fails
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    /// Fixed delay between open attempts in milliseconds
    #[serde(default = "default_connect_delay_ms")]
    pub connect_delay_ms: u64,

    /// Upper bound on a single open attempt in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// A read taking longer than this counts as a read failure
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Consecutive read failures that degrade a session
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,

    /// Frames buffered between segment ticks
    #[serde(default = "default_frame_buffer_size")]
    pub frame_buffer_size: usize,

    /// How long `stop` waits for the session task to finish
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
}

/// Rolling segment window and playlist rendering.
#[derive(Debug, Clone, Deserialize)]
pub struct SegmentConfig {
    /// Segments retained per camera (K)
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Interval between segment ticks in seconds (D)
    #[serde(default = "default_segment_duration_secs")]
    pub segment_duration_secs: f64,

    #[serde(default = "default_target_duration_secs")]
    pub target_duration_secs: u64,

    #[serde(default = "default_playlist_version")]
    pub playlist_version: u32,

    #[serde(default = "default_bandwidth")]
    pub bandwidth: u64,

    #[serde(default = "default_resolution")]
    pub resolution: String,

    #[serde(default)]
    pub artifact_backend: ArtifactBackend,

    /// Root directory for the filesystem backend
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    #[serde(default)]
    pub s3: Option<S3Config>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactBackend {
    #[default]
    Fs,
    Memory,
    S3,
}

/// S3 artifact storage configuration.
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

    /// Key prefix prepended to every artifact key
    #[serde(default)]
    pub prefix: Option<String>,
}

/// RTSP source tuning, used when the `rtsp` feature is enabled.
#[derive(Debug, Clone, Deserialize)]
pub struct RtspConfig {
    /// RTSP transport protocol (tcp, udp, or udp-mcast)
    #[serde(default = "default_transport")]
    pub transport: String,

    /// Jitter buffer latency in milliseconds
    #[serde(default = "default_latency_ms")]
    pub latency_ms: u32,

    #[serde(default = "default_width")]
    pub width: u32,

    #[serde(default = "default_height")]
    pub height: u32,

    /// Frames queued between the pipeline and the session
    #[serde(default = "default_frame_queue")]
    pub frame_queue: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// Prometheus exporter and health reporting.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_metrics_port")]
    pub port: u16,

    /// Interval between health log lines in seconds
    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,
}

/// A stream to start at boot.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct StreamDefinition {
    pub camera_id: String,
    pub url: String,
}

// Default value functions
fn default_connect_attempts() -> u32 {
    3
}
fn default_connect_delay_ms() -> u64 {
    5000
}
fn default_connect_timeout_ms() -> u64 {
    10000
}
fn default_read_timeout_ms() -> u64 {
    5000
}
fn default_error_threshold() -> u32 {
    3
}
fn default_frame_buffer_size() -> usize {
    30
}
fn default_stop_timeout_ms() -> u64 {
    5000
}
fn default_window_size() -> usize {
    5
}
fn default_segment_duration_secs() -> f64 {
    4.0
}
fn default_target_duration_secs() -> u64 {
    4
}
fn default_playlist_version() -> u32 {
    3
}
fn default_bandwidth() -> u64 {
    800_000
}
fn default_resolution() -> String {
    "640x480".to_string()
}
fn default_output_dir() -> String {
    "./hls_streams".to_string()
}
fn default_region() -> String {
    "us-east-1".to_string()
}
fn default_transport() -> String {
    "tcp".to_string()
}
fn default_latency_ms() -> u32 {
    200
}
fn default_width() -> u32 {
    640
}
fn default_height() -> u32 {
    480
}
fn default_frame_queue() -> usize {
    64
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}
fn default_metrics_port() -> u16 {
    9090
}
fn default_health_interval() -> u64 {
    30
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_attempts: default_connect_attempts(),
            connect_delay_ms: default_connect_delay_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            error_threshold: default_error_threshold(),
            frame_buffer_size: default_frame_buffer_size(),
            stop_timeout_ms: default_stop_timeout_ms(),
        }
    }
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            segment_duration_secs: default_segment_duration_secs(),
            target_duration_secs: default_target_duration_secs(),
            playlist_version: default_playlist_version(),
            bandwidth: default_bandwidth(),
            resolution: default_resolution(),
            artifact_backend: ArtifactBackend::default(),
            output_dir: default_output_dir(),
            s3: None,
        }
    }
}

impl Default for RtspConfig {
    fn default() -> Self {
        Self {
            transport: default_transport(),
            latency_ms: default_latency_ms(),
            width: default_width(),
            height: default_height(),
            frame_queue: default_frame_queue(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
            health_interval_secs: default_health_interval(),
        }
    }
}

impl VigilConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default config file (config/default.toml)
    /// 2. Environment-specific config (config/{env}.toml)
    /// 3. Environment variables (prefixed with VIGIL_)
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Override with environment variables (e.g., VIGIL_SESSIONS__ERROR_THRESHOLD)
            .add_source(
                Environment::with_prefix("VIGIL")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Create configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(
                Environment::with_prefix("VIGIL")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.sessions.connect_attempts == 0 {
            return Err(invalid("sessions.connect_attempts", "must be at least 1"));
        }
        if self.sessions.error_threshold == 0 {
            return Err(invalid("sessions.error_threshold", "must be at least 1"));
        }
        if self.sessions.frame_buffer_size == 0 {
            return Err(invalid("sessions.frame_buffer_size", "must be at least 1"));
        }
        if self.sessions.read_timeout_ms == 0 {
            return Err(invalid("sessions.read_timeout_ms", "must be greater than 0"));
        }

        if self.segments.window_size == 0 {
            return Err(invalid("segments.window_size", "must be at least 1"));
        }
        if !(self.segments.segment_duration_secs.is_finite() && self.segments.segment_duration_secs > 0.0) {
            return Err(invalid("segments.segment_duration_secs", "must be greater than 0"));
        }
        if self.segments.artifact_backend == ArtifactBackend::S3 {
            match self.segments.s3 {
                Some(ref s3) if !s3.bucket.is_empty() => {}
                _ => return Err(ConfigValidationError::MissingField("segments.s3.bucket".to_string())),
            }
        }

        self.detection.validate()?;
        self.distributor.validate()?;
        self.database.validate()?;
        self.queue
            .validate()
            .map_err(|e| invalid("queue", &e.to_string()))?;

        for stream in &self.streams {
            if stream.camera_id.trim().is_empty() {
                return Err(ConfigValidationError::MissingField("streams[].camera_id".to_string()));
            }
        }

        Ok(())
    }
}

fn invalid(field: &str, message: &str) -> ConfigValidationError {
    ConfigValidationError::InvalidValue {
        field: field.to_string(),
        message: message.to_string(),
    }
}

impl SessionConfig {
    pub fn connect_delay(&self) -> Duration {
        Duration::from_millis(self.connect_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

impl SegmentConfig {
    pub fn segment_interval(&self) -> Duration {
        Duration::from_secs_f64(self.segment_duration_secs)
    }
}
