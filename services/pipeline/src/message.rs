//! Detection message wire format.
//!
//! The same JSON document is consumed from the raw metadata topic and
//! republished, normalized, to the critical alerts topic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reasons a queue payload cannot be turned into an alert
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MessageError {
    #[error("Failed to decode message: {0}")]
    Decode(String),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: &'static str, message: String },
}

/// Axis-aligned bounding box, normalized or in pixel space depending on the producer
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub width: f64,
    #[serde(default)]
    pub height: f64,
}

impl BoundingBox {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Centre point used for zone membership tests
    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.width.is_finite() && self.height.is_finite()
    }
}

/// A detection as produced by the inference pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionMessage {
    /// Set on republished copies only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub camera_id: Option<String>,
    #[serde(default)]
    pub analytics_job_id: Option<String>,
    #[serde(default = "default_alert_type")]
    pub alert_type: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default = "default_object_class")]
    pub object_class: String,
    #[serde(default)]
    pub object_id: Option<String>,
    #[serde(default)]
    pub bbox: BoundingBox,
    #[serde(default)]
    pub snapshot_path: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

fn default_alert_type() -> String {
    "object_detected".to_string()
}

fn default_object_class() -> String {
    "unknown".to_string()
}

impl DetectionMessage {
    /// Decode a payload. Only JSON syntax and field types are checked here;
    /// use [`DetectionMessage::identifiers`] to enforce required fields.
    pub fn decode(payload: &[u8]) -> Result<Self, MessageError> {
        serde_json::from_slice(payload).map_err(|e| MessageError::Decode(e.to_string()))
    }

    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        serde_json::to_vec(self).map_err(|e| MessageError::Decode(e.to_string()))
    }

    /// Returns `(camera_id, analytics_job_id)` once the message is known to be
    /// complete enough to persist.
    pub fn identifiers(&self) -> Result<(&str, &str), MessageError> {
        let camera_id = non_empty(self.camera_id.as_deref()).ok_or(MessageError::MissingField("camera_id"))?;
        let job_id = non_empty(self.analytics_job_id.as_deref())
            .ok_or(MessageError::MissingField("analytics_job_id"))?;

        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(MessageError::InvalidValue {
                field: "confidence",
                message: format!("{} is outside [0, 1]", self.confidence),
            });
        }
        if !self.bbox.is_finite() {
            return Err(MessageError::InvalidValue {
                field: "bbox",
                message: "coordinates must be finite".to_string(),
            });
        }

        Ok((camera_id, job_id))
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_applies_defaults() {
        let message =
            DetectionMessage::decode(br#"{"camera_id":"cam-1","analytics_job_id":"job-1"}"#)
                .unwrap();

        assert_eq!(message.alert_type, "object_detected");
        assert_eq!(message.object_class, "unknown");
        assert_eq!(message.bbox, BoundingBox::default());
        assert_eq!(message.identifiers().unwrap(), ("cam-1", "job-1"));
    }

    #[test]
    fn test_missing_job_id_is_rejected() {
        let message = DetectionMessage::decode(br#"{"camera_id":"cam-1","confidence":0.9}"#).unwrap();
        assert_eq!(
            message.identifiers(),
            Err(MessageError::MissingField("analytics_job_id"))
        );
    }

    #[test]
    fn test_blank_camera_id_is_rejected() {
        let message =
            DetectionMessage::decode(br#"{"camera_id":"  ","analytics_job_id":"job-1"}"#).unwrap();
        assert_eq!(message.identifiers(), Err(MessageError::MissingField("camera_id")));
    }

    #[test]
    fn test_confidence_out_of_range() {
        let message = DetectionMessage::decode(
            br#"{"camera_id":"cam-1","analytics_job_id":"job-1","confidence":1.5}"#,
        )
        .unwrap();
        assert!(matches!(
            message.identifiers(),
            Err(MessageError::InvalidValue { field: "confidence", .. })
        ));
    }

    #[test]
    fn test_malformed_payload() {
        assert!(matches!(
            DetectionMessage::decode(b"not json"),
            Err(MessageError::Decode(_))
        ));
    }

    #[test]
    fn test_bbox_center() {
        let bbox = BoundingBox::new(0.2, 0.4, 0.2, 0.2);
        let (cx, cy) = bbox.center();
        assert!((cx - 0.3).abs() < 1e-9);
        assert!((cy - 0.5).abs() < 1e-9);
    }
}
