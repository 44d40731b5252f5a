use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Errors found while validating analytics configuration
#[derive(Error, Debug, PartialEq)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

/// Where detections come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMode {
    /// Placeholder detections generated in-process
    #[default]
    Simulated,
    /// Detections received from the external inference pipeline
    Ingested,
}

/// Detection engine configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DetectionConfig {
    #[serde(default)]
    pub mode: DetectionMode,
    /// Delay between detection cycles of one camera
    #[serde(default = "default_cycle_interval_ms")]
    pub cycle_interval_ms: u64,
    /// Expected detections per cycle, clamped to [0.1, 5.0]
    #[serde(default = "default_detection_rate")]
    pub detection_rate: f64,
    #[serde(default = "default_max_detections_per_cycle")]
    pub max_detections_per_cycle: usize,
    /// Chance that a detection is attributed to an existing track
    #[serde(default = "default_reuse_probability")]
    pub reuse_probability: f64,
    /// Tracks not seen for this long are forgotten
    #[serde(default = "default_reuse_window_secs")]
    pub reuse_window_secs: u64,
    #[serde(default = "default_object_classes")]
    pub object_classes: Vec<String>,
    /// Object counts are broadcast every N cycles
    #[serde(default = "default_counts_every_cycles")]
    pub counts_every_cycles: u64,
    /// Fixed seed for reproducible synthetic detections
    #[serde(default)]
    pub seed: Option<u64>,
}

/// Subscriber delivery configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DistributorConfig {
    /// Buffered messages per subscriber channel
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// A subscriber that cannot accept a message within this window is dropped
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
}

/// Database configuration. Without a URL the in-memory entity store is used.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    #[serde(default)]
    pub url: Option<String>,
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

// Default value functions
fn default_cycle_interval_ms() -> u64 {
    1000
}

fn default_detection_rate() -> f64 {
    0.5
}

fn default_max_detections_per_cycle() -> usize {
    10
}

fn default_reuse_probability() -> f64 {
    0.3
}

fn default_reuse_window_secs() -> u64 {
    30
}

fn default_object_classes() -> Vec<String> {
    ["person", "car", "truck", "bus", "bicycle", "motorcycle"]
        .iter()
        .map(|c| c.to_string())
        .collect()
}

fn default_counts_every_cycles() -> u64 {
    10
}

fn default_channel_capacity() -> usize {
    256
}

fn default_send_timeout_ms() -> u64 {
    1000
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

fn default_true() -> bool {
    true
}

pub const MIN_DETECTION_RATE: f64 = 0.1;
pub const MAX_DETECTION_RATE: f64 = 5.0;

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            mode: DetectionMode::default(),
            cycle_interval_ms: default_cycle_interval_ms(),
            detection_rate: default_detection_rate(),
            max_detections_per_cycle: default_max_detections_per_cycle(),
            reuse_probability: default_reuse_probability(),
            reuse_window_secs: default_reuse_window_secs(),
            object_classes: default_object_classes(),
            counts_every_cycles: default_counts_every_cycles(),
            seed: None,
        }
    }
}

impl DetectionConfig {
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_millis(self.cycle_interval_ms)
    }

    pub fn reuse_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.reuse_window_secs as i64)
    }

    /// The configured rate forced into its supported range
    pub fn clamped_rate(&self) -> f64 {
        clamp_rate(self.detection_rate)
    }

    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.cycle_interval_ms == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "detection.cycle_interval_ms".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.reuse_probability) {
            return Err(ConfigValidationError::InvalidValue {
                field: "detection.reuse_probability".to_string(),
                message: "must be between 0 and 1".to_string(),
            });
        }
        if self.mode == DetectionMode::Simulated && self.object_classes.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "detection.object_classes".to_string(),
            ));
        }
        if self.counts_every_cycles == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "detection.counts_every_cycles".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

pub fn clamp_rate(rate: f64) -> f64 {
    if rate.is_nan() {
        return MIN_DETECTION_RATE;
    }
    rate.clamp(MIN_DETECTION_RATE, MAX_DETECTION_RATE)
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            send_timeout_ms: default_send_timeout_ms(),
        }
    }
}

impl DistributorConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.channel_capacity == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "distributor.channel_capacity".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            run_migrations: true,
        }
    }
}

impl DatabaseConfig {
    /// Get database connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Get database idle timeout as Duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.min_connections > self.max_connections {
            return Err(ConfigValidationError::InvalidValue {
                field: "database.min_connections".to_string(),
                message: "cannot exceed max_connections".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = DetectionConfig::default();
        assert_eq!(config.mode, DetectionMode::Simulated);
        assert_eq!(config.object_classes.len(), 6);
        assert_eq!(config.reuse_window(), chrono::Duration::seconds(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rate_is_clamped() {
        assert_eq!(clamp_rate(0.0), MIN_DETECTION_RATE);
        assert_eq!(clamp_rate(12.0), MAX_DETECTION_RATE);
        assert_eq!(clamp_rate(f64::NAN), MIN_DETECTION_RATE);
        assert_eq!(clamp_rate(2.5), 2.5);
    }

    #[test]
    fn test_invalid_reuse_probability() {
        let config = DetectionConfig {
            reuse_probability: 1.5,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_pool_bounds() {
        let config = DatabaseConfig {
            min_connections: 20,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
