//! Metadata ingest adapter.
//!
//! Consumes detection metadata produced by the inference pipeline, persists
//! each valid message as an alert and republishes a normalized copy for
//! real-time consumers. Messages that can never succeed are acknowledged and
//! dropped; transient store failures are negatively acknowledged so the
//! queue redelivers them.

use crate::detection::{IngestedFeed, RawDetection};
use crate::entity_store::{EntityStore, StoreError};
use crate::event_publisher::EventPublisher;
use crate::models::{AlertRecord, AnalyticsJob};
use crate::roi::Point;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;
use vigil_pipeline::{
    DetectionMessage, IncomingMessage, MessageError, MessagePublisher, MessageSource,
    OutgoingMessage, QueueConfig,
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum IngestError {
    #[error("Invalid message: {0}")]
    InvalidMessage(#[from] MessageError),

    #[error("{entity} {id} not found")]
    EntityNotFound { entity: &'static str, id: String },

    #[error("Entity store unavailable: {0}")]
    StoreUnavailable(String),
}

impl From<StoreError> for IngestError {
    fn from(error: StoreError) -> Self {
        IngestError::StoreUnavailable(error.to_string())
    }
}

/// How a message is settled with the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Nack,
}

impl IngestError {
    pub fn disposition(&self) -> Disposition {
        match self {
            IngestError::InvalidMessage(_) | IngestError::EntityNotFound { .. } => Disposition::Ack,
            IngestError::StoreUnavailable(_) => Disposition::Nack,
        }
    }
}

/// Build the alert for an ingested detection. Zone ids whose polygon
/// contains the box centre are recorded under `metadata.zones`.
pub fn alert_from_message(message: &DetectionMessage, camera_id: &str, job: &AnalyticsJob) -> AlertRecord {
    let mut metadata = message.metadata.clone();
    let (cx, cy) = message.bbox.center();
    let zones: Vec<serde_json::Value> = job
        .zones
        .iter()
        .filter(|zone| zone.is_active && zone.contains(Point::new(cx, cy)))
        .map(|zone| zone.id.clone().into())
        .collect();
    if !zones.is_empty() {
        metadata.insert("zones".to_string(), serde_json::Value::Array(zones));
    }

    AlertRecord {
        id: Uuid::new_v4(),
        timestamp: message.timestamp.unwrap_or_else(Utc::now),
        camera_id: camera_id.to_string(),
        analytics_job_id: job.id.clone(),
        alert_type: message.alert_type.clone(),
        confidence: message.confidence,
        object_class: message.object_class.clone(),
        object_id: message.object_id.clone(),
        bbox: message.bbox,
        snapshot_path: message.snapshot_path.clone(),
        metadata,
        processed: false,
    }
}

pub struct MetadataIngestAdapter<S> {
    source: S,
    publisher: Arc<dyn MessagePublisher>,
    store: Arc<dyn EntityStore>,
    events: Option<EventPublisher>,
    feed: Option<IngestedFeed>,
    source_topic: String,
    alerts_topic: String,
    receive_timeout: Duration,
    reconnect_backoff: Duration,
}

impl<S: MessageSource> MetadataIngestAdapter<S> {
    pub fn new(
        source: S,
        publisher: Arc<dyn MessagePublisher>,
        store: Arc<dyn EntityStore>,
        config: &QueueConfig,
    ) -> Self {
        Self {
            source,
            publisher,
            store,
            events: None,
            feed: None,
            source_topic: config.topics.metadata_raw.clone(),
            alerts_topic: config.topics.alerts_critical.clone(),
            receive_timeout: config.receive_timeout(),
            reconnect_backoff: config.reconnect_backoff(),
        }
    }

    /// Broadcast persisted alerts to subscribers
    pub fn with_events(mut self, events: EventPublisher) -> Self {
        self.events = Some(events);
        self
    }

    /// Route accepted detections to the ingested detection backend
    pub fn with_feed(mut self, feed: IngestedFeed) -> Self {
        self.feed = Some(feed);
        self
    }

    /// Consume until `shutdown` is cancelled. Connection loss pauses for the
    /// reconnect backoff and then resubscribes.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        info!(topic = %self.source_topic, "Starting metadata ingest");
        let mut connected = false;

        while !shutdown.is_cancelled() {
            if !connected {
                match self.source.connect().await {
                    Ok(()) => {
                        info!(topic = %self.source_topic, "Connected to metadata queue");
                        connected = true;
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to connect to metadata queue");
                        if !self.pause(&shutdown).await {
                            break;
                        }
                        continue;
                    }
                }
            }

            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = self.source.receive(self.receive_timeout) => received,
            };

            match received {
                Ok(Some(message)) => {
                    self.dispatch(message).await;
                }
                Ok(None) => {}
                Err(e) => {
                    if e.requires_reconnect() {
                        warn!(error = %e, backoff = ?self.reconnect_backoff, "Lost connection to metadata queue");
                        metrics::counter!("vigil.ingest.reconnects").increment(1);
                        connected = false;
                    } else {
                        warn!(error = %e, "Receive from metadata queue failed");
                    }
                    if !self.pause(&shutdown).await {
                        break;
                    }
                }
            }
        }

        info!("Metadata ingest stopped");
    }

    /// Sleep for the reconnect backoff; false when shutdown interrupted it
    async fn pause(&self, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            _ = shutdown.cancelled() => false,
            _ = tokio::time::sleep(self.reconnect_backoff) => true,
        }
    }

    /// Process one message and settle it with the queue
    #[instrument(skip(self, message), fields(offset = message.metadata.offset, redelivery = message.metadata.redelivery_count))]
    pub async fn dispatch(&mut self, message: IncomingMessage) -> Disposition {
        let disposition = match self.handle_message(&message).await {
            Ok(alert) => {
                debug!(alert_id = %alert.id, camera_id = %alert.camera_id, "Metadata message ingested");
                Disposition::Ack
            }
            Err(e) => {
                let disposition = e.disposition();
                match disposition {
                    Disposition::Ack => {
                        warn!(error = %e, "Dropping metadata message");
                        metrics::counter!("vigil.ingest.rejected").increment(1);
                    }
                    Disposition::Nack => {
                        error!(error = %e, "Metadata message will be redelivered");
                    }
                }
                disposition
            }
        };

        let settled = match disposition {
            Disposition::Ack => self.source.ack(&message).await,
            Disposition::Nack => self.source.nack(&message).await,
        };
        if let Err(e) = settled {
            warn!(error = %e, ?disposition, "Failed to settle metadata message");
        }

        match disposition {
            Disposition::Ack => metrics::counter!("vigil.ingest.acked").increment(1),
            Disposition::Nack => metrics::counter!("vigil.ingest.nacked").increment(1),
        }
        disposition
    }

    /// Validate, persist and fan out one message
    pub async fn handle_message(&self, message: &IncomingMessage) -> Result<AlertRecord, IngestError> {
        let detection = DetectionMessage::decode(&message.payload)?;
        let (camera_id, job_id) = detection.identifiers()?;

        self.store
            .camera(camera_id)
            .await?
            .ok_or_else(|| IngestError::EntityNotFound {
                entity: "camera",
                id: camera_id.to_string(),
            })?;
        let job = self
            .store
            .analytics_job(job_id)
            .await?
            .ok_or_else(|| IngestError::EntityNotFound {
                entity: "analytics job",
                id: job_id.to_string(),
            })?;
        if job.camera_id != camera_id {
            debug!(camera_id, job_camera = %job.camera_id, "Analytics job belongs to another camera");
        }

        let alert = alert_from_message(&detection, camera_id, &job);
        self.store.save_alert(&alert).await?;
        info!(alert_id = %alert.id, camera_id = %alert.camera_id, alert_type = %alert.alert_type, "Alert created");

        // Persisting is the commit point; later steps only log on failure.
        self.republish(&alert).await;

        if let Some(ref events) = self.events {
            events.publish_alert(&alert).await;
        }
        if let Some(ref feed) = self.feed {
            feed.push(
                &alert.camera_id,
                RawDetection {
                    object_class: detection.object_class.clone(),
                    confidence: detection.confidence,
                    bbox: detection.bbox,
                    object_id: detection.object_id.clone(),
                    snapshot_path: detection.snapshot_path.clone(),
                    metadata: detection.metadata.clone(),
                },
            );
        }

        Ok(alert)
    }

    async fn republish(&self, alert: &AlertRecord) {
        let outgoing = match OutgoingMessage::new_json(&self.alerts_topic, &alert.to_message()) {
            Ok(message) => message
                .with_key(alert.camera_id.clone())
                .with_message_type("critical_alert"),
            Err(e) => {
                warn!(alert_id = %alert.id, error = %e, "Failed to encode critical alert");
                return;
            }
        };

        match self.publisher.publish(outgoing).await {
            Ok(()) => debug!(alert_id = %alert.id, topic = %self.alerts_topic, "Critical alert published"),
            Err(e) => {
                warn!(alert_id = %alert.id, error = %e, "Failed to publish critical alert");
                metrics::counter!("vigil.ingest.republish_failed").increment(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributor::EventDistributor;
    use crate::entity_store::{MemoryEntityStore, MockEntityStore};
    use crate::models::Camera;
    use crate::roi::RoiZone;
    use serde_json::json;
    use tokio_test::assert_ok;
    use vigil_pipeline::{MemoryQueue, MemorySubscription};

    const RAW: &str = "vigil.metadata.raw";
    const ALERTS: &str = "vigil.alerts.critical";

    fn camera() -> Camera {
        Camera {
            id: "cam-1".to_string(),
            name: "Gate".to_string(),
            url: "rtsp://gate".to_string(),
            owner_id: None,
            status: "active".to_string(),
            is_active: true,
        }
    }

    fn job() -> AnalyticsJob {
        AnalyticsJob {
            id: "job-1".to_string(),
            camera_id: "cam-1".to_string(),
            name: "Gate watch".to_string(),
            is_active: true,
            confidence_threshold: 0.5,
            max_detections: 10,
            zones: vec![RoiZone {
                id: "gate".to_string(),
                name: "Gate".to_string(),
                polygon: vec![
                    Point::new(0.0, 0.0),
                    Point::new(0.5, 0.0),
                    Point::new(0.5, 0.5),
                    Point::new(0.0, 0.5),
                ],
                alert_on_entry: true,
                alert_on_exit: false,
                is_active: true,
            }],
        }
    }

    fn seeded_store() -> Arc<MemoryEntityStore> {
        let store = Arc::new(MemoryEntityStore::new());
        store.insert_camera(camera());
        store.insert_job(job());
        store
    }

    fn config() -> QueueConfig {
        QueueConfig {
            receive_timeout_ms: 10,
            reconnect_backoff_ms: 10,
            ..Default::default()
        }
    }

    fn adapter(
        queue: &MemoryQueue,
        store: Arc<dyn EntityStore>,
    ) -> MetadataIngestAdapter<MemorySubscription> {
        MetadataIngestAdapter::new(queue.subscribe(RAW), Arc::new(queue.clone()), store, &config())
    }

    async fn publish(queue: &MemoryQueue, payload: serde_json::Value) {
        assert_ok!(queue.publish(OutgoingMessage::new_json(RAW, &payload).unwrap()).await);
    }

    async fn receive_one(adapter: &mut MetadataIngestAdapter<MemorySubscription>) -> IncomingMessage {
        adapter.source.connect().await.unwrap();
        adapter
            .source
            .receive(Duration::from_millis(100))
            .await
            .unwrap()
            .expect("message should be queued")
    }

    fn valid_payload() -> serde_json::Value {
        json!({
            "camera_id": "cam-1",
            "analytics_job_id": "job-1",
            "alert_type": "object_detected",
            "confidence": 0.87,
            "object_class": "person",
            "object_id": "trk-7",
            "bbox": {"x": 0.1, "y": 0.1, "width": 0.1, "height": 0.1},
            "metadata": {"source": "pipeline"}
        })
    }

    #[tokio::test]
    async fn test_missing_job_id_is_acked_without_alert() {
        let queue = MemoryQueue::new();
        let store = seeded_store();
        let mut adapter = adapter(&queue, store.clone());

        publish(&queue, json!({"camera_id": "cam-1", "confidence": 0.9})).await;
        let message = receive_one(&mut adapter).await;

        assert_eq!(adapter.dispatch(message).await, Disposition::Ack);
        assert!(store.alerts().is_empty());
        assert_eq!(queue.acked(RAW).len(), 1);
        assert!(queue.pending(RAW).is_empty());
    }

    #[tokio::test]
    async fn test_unknown_camera_is_acked() {
        let queue = MemoryQueue::new();
        let store = seeded_store();
        let mut adapter = adapter(&queue, store.clone());

        let mut payload = valid_payload();
        payload["camera_id"] = json!("cam-404");
        publish(&queue, payload).await;
        let message = receive_one(&mut adapter).await;

        let result = adapter.handle_message(&message).await;
        assert_eq!(
            result.unwrap_err(),
            IngestError::EntityNotFound {
                entity: "camera",
                id: "cam-404".to_string()
            }
        );
        assert_eq!(adapter.dispatch(message).await, Disposition::Ack);
        assert!(store.alerts().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_payload_is_acked() {
        let queue = MemoryQueue::new();
        let mut adapter = adapter(&queue, seeded_store());

        assert_ok!(queue.publish(OutgoingMessage::new(RAW, b"not json".to_vec())).await);
        let message = receive_one(&mut adapter).await;
        assert_eq!(adapter.dispatch(message).await, Disposition::Ack);
    }

    #[tokio::test]
    async fn test_valid_message_is_persisted_and_republished() {
        let queue = MemoryQueue::new();
        let store = seeded_store();
        let distributor = Arc::new(EventDistributor::new());
        let feed = IngestedFeed::new(8);
        let mut adapter = adapter(&queue, store.clone())
            .with_events(EventPublisher::new(distributor, store.clone(), false))
            .with_feed(feed.clone());

        publish(&queue, valid_payload()).await;
        let message = receive_one(&mut adapter).await;
        assert_eq!(adapter.dispatch(message).await, Disposition::Ack);

        let alerts = store.alerts();
        assert_eq!(alerts.len(), 1);
        let alert = &alerts[0];
        assert!(!alert.processed);
        assert_eq!(alert.object_id.as_deref(), Some("trk-7"));
        assert_eq!(alert.metadata["zones"], json!(["gate"]));
        assert_eq!(alert.metadata["source"], json!("pipeline"));

        let republished = queue.pending(ALERTS);
        assert_eq!(republished.len(), 1);
        assert_eq!(republished[0].key_str().as_deref(), Some("cam-1"));
        assert_eq!(republished[0].message_type(), Some("critical_alert"));
        let copy = DetectionMessage::decode(&republished[0].payload).unwrap();
        assert_eq!(copy.id, Some(alert.id.to_string()));
        assert!(copy.timestamp.is_some());

        assert_eq!(feed.pending("cam-1"), 1);
    }

    #[tokio::test]
    async fn test_store_outage_is_nacked_and_redelivered() {
        let queue = MemoryQueue::new();
        let mut store = MockEntityStore::new();
        store.expect_camera().returning(|_| Ok(Some(camera())));
        store.expect_analytics_job().returning(|_| Ok(Some(job())));
        store
            .expect_save_alert()
            .times(1)
            .returning(|_| Err(StoreError::Unavailable("connection refused".to_string())));
        let mut adapter = adapter(&queue, Arc::new(store));

        publish(&queue, valid_payload()).await;
        let message = receive_one(&mut adapter).await;
        assert_eq!(adapter.dispatch(message).await, Disposition::Nack);

        let pending = queue.pending(RAW);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].metadata.redelivery_count, 1);
        assert!(queue.pending(ALERTS).is_empty());
    }

    #[tokio::test]
    async fn test_republish_failure_still_acks() {
        let queue = MemoryQueue::new();
        let store = seeded_store();
        let mut adapter = adapter(&queue, store.clone());

        publish(&queue, valid_payload()).await;
        let message = receive_one(&mut adapter).await;
        queue.inject_publish_failures(1);

        assert_eq!(adapter.dispatch(message).await, Disposition::Ack);
        assert_eq!(store.alerts().len(), 1);
        assert!(queue.pending(ALERTS).is_empty());
    }

    #[tokio::test]
    async fn test_run_reconnects_after_connection_loss() {
        let queue = MemoryQueue::new();
        let store = seeded_store();
        let mut adapter = adapter(&queue, store.clone());
        let shutdown = CancellationToken::new();

        queue.inject_disconnects(1);
        publish(&queue, valid_payload()).await;

        let token = shutdown.clone();
        let task = tokio::spawn(async move { adapter.run(token).await });

        let persisted = tokio::time::timeout(Duration::from_secs(2), async {
            while store.alerts().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(persisted.is_ok(), "message should be processed after reconnect");

        shutdown.cancel();
        assert_ok!(task.await);
        assert_eq!(queue.acked(RAW).len(), 1);
    }

    #[test]
    fn test_dispositions() {
        assert_eq!(
            IngestError::InvalidMessage(MessageError::MissingField("camera_id")).disposition(),
            Disposition::Ack
        );
        assert_eq!(
            IngestError::StoreUnavailable("timeout".to_string()).disposition(),
            Disposition::Nack
        );
    }
}
