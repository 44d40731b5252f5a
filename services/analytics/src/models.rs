use crate::roi::RoiZone;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use vigil_pipeline::{BoundingBox, DetectionMessage};

pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// A camera known to the entity store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Camera {
    pub id: String,
    pub name: String,
    pub url: String,
    pub owner_id: Option<String>,
    pub status: String,
    pub is_active: bool,
}

/// Per-camera analytics configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsJob {
    pub id: String,
    pub camera_id: String,
    pub name: String,
    pub is_active: bool,
    /// Detections below this confidence are discarded
    pub confidence_threshold: f64,
    /// Upper bound on detections handled per cycle
    pub max_detections: usize,
    pub zones: Vec<RoiZone>,
}

/// What a detection event represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionKind {
    Detection,
    ZoneEntry,
    ZoneExit,
}

impl DetectionKind {
    /// Alert type recorded for events of this kind
    pub fn alert_type(&self) -> &'static str {
        match self {
            DetectionKind::Detection => "object_detected",
            DetectionKind::ZoneEntry => "zone_entry",
            DetectionKind::ZoneExit => "zone_exit",
        }
    }
}

/// Output of one detection cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionEvent {
    pub id: Uuid,
    pub kind: DetectionKind,
    pub camera_id: String,
    pub object_class: String,
    pub confidence: f64,
    pub bbox: BoundingBox,
    pub object_id: String,
    /// Set for zone entry and exit events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_path: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// A persisted alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub camera_id: String,
    pub analytics_job_id: String,
    pub alert_type: String,
    pub confidence: f64,
    pub object_class: String,
    pub object_id: Option<String>,
    pub bbox: BoundingBox,
    pub snapshot_path: Option<String>,
    pub metadata: Metadata,
    /// True once nothing downstream needs to act on the alert
    pub processed: bool,
}

impl AlertRecord {
    /// Record for a detection derived in-process
    pub fn from_event(event: &DetectionEvent, analytics_job_id: &str) -> Self {
        let mut metadata = event.metadata.clone();
        if let Some(ref zone_id) = event.zone_id {
            metadata.insert("zone_id".to_string(), zone_id.clone().into());
        }

        Self {
            id: event.id,
            timestamp: event.timestamp,
            camera_id: event.camera_id.clone(),
            analytics_job_id: analytics_job_id.to_string(),
            alert_type: event.kind.alert_type().to_string(),
            confidence: event.confidence,
            object_class: event.object_class.clone(),
            object_id: Some(event.object_id.clone()),
            bbox: event.bbox,
            snapshot_path: event.snapshot_path.clone(),
            metadata,
            processed: true,
        }
    }

    /// Normalized wire copy, carrying the record id and timestamp
    pub fn to_message(&self) -> DetectionMessage {
        DetectionMessage {
            id: Some(self.id.to_string()),
            timestamp: Some(self.timestamp),
            camera_id: Some(self.camera_id.clone()),
            analytics_job_id: Some(self.analytics_job_id.clone()),
            alert_type: self.alert_type.clone(),
            confidence: self.confidence,
            object_class: self.object_class.clone(),
            object_id: self.object_id.clone(),
            bbox: self.bbox,
            snapshot_path: self.snapshot_path.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: DetectionKind) -> DetectionEvent {
        DetectionEvent {
            id: Uuid::new_v4(),
            kind,
            camera_id: "cam-1".to_string(),
            object_class: "person".to_string(),
            confidence: 0.91,
            bbox: BoundingBox::new(0.1, 0.2, 0.1, 0.3),
            object_id: "person_0a1b2c3d".to_string(),
            zone_id: Some("zone-1".to_string()),
            snapshot_path: None,
            timestamp: Utc::now(),
            metadata: Metadata::new(),
        }
    }

    #[test]
    fn test_alert_from_zone_event() {
        let alert = AlertRecord::from_event(&event(DetectionKind::ZoneEntry), "job-1");
        assert_eq!(alert.alert_type, "zone_entry");
        assert_eq!(alert.analytics_job_id, "job-1");
        assert_eq!(alert.metadata.get("zone_id"), Some(&"zone-1".into()));
        assert!(alert.processed);
    }

    #[test]
    fn test_message_carries_id_and_timestamp() {
        let alert = AlertRecord::from_event(&event(DetectionKind::Detection), "job-1");
        let message = alert.to_message();
        assert_eq!(message.id, Some(alert.id.to_string()));
        assert_eq!(message.timestamp, Some(alert.timestamp));
        assert_eq!(message.identifiers().unwrap(), ("cam-1", "job-1"));
    }
}
