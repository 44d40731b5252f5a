//! Hands detection cycle output to the entity store and to subscribers.

use crate::detection::ObjectCount;
use crate::distributor::{EventDistributor, EventMessage, Scope, StreamStatusUpdate};
use crate::entity_store::EntityStore;
use crate::models::{AlertRecord, AnalyticsJob, DetectionEvent};
use std::sync::Arc;
use tracing::{debug, error};

fn camera_scopes(camera_id: &str) -> [Scope; 2] {
    [Scope::Global, Scope::Camera(camera_id.to_string())]
}

#[derive(Clone)]
pub struct EventPublisher {
    distributor: Arc<EventDistributor>,
    store: Arc<dyn EntityStore>,
    /// Persist cycle output as alerts. Off when detections come from the
    /// ingest adapter, which has already stored them.
    persist: bool,
}

impl EventPublisher {
    pub fn new(distributor: Arc<EventDistributor>, store: Arc<dyn EntityStore>, persist: bool) -> Self {
        Self {
            distributor,
            store,
            persist,
        }
    }

    pub fn distributor(&self) -> &Arc<EventDistributor> {
        &self.distributor
    }

    /// Persist and broadcast the events of one cycle. Store failures are
    /// logged per event and never abort the rest of the batch.
    pub async fn publish_cycle(&self, job: &AnalyticsJob, events: &[DetectionEvent]) {
        for event in events {
            if self.persist {
                let alert = AlertRecord::from_event(event, &job.id);
                if let Err(e) = self.store.save_alert(&alert).await {
                    error!(
                        camera_id = %event.camera_id,
                        alert_id = %alert.id,
                        error = %e,
                        "Failed to persist detection alert"
                    );
                    metrics::counter!("vigil.alerts.persist_failed").increment(1);
                }
            }

            self.distributor
                .broadcast_many(&EventMessage::detection(event), &camera_scopes(&event.camera_id))
                .await;
        }

        if !events.is_empty() {
            debug!(camera_id = %job.camera_id, events = events.len(), "Published cycle events");
        }
    }

    pub async fn publish_alert(&self, alert: &AlertRecord) {
        self.distributor
            .broadcast_many(&EventMessage::alert(alert), &camera_scopes(&alert.camera_id))
            .await;
    }

    pub async fn publish_counts(&self, camera_id: &str, counts: &[ObjectCount]) {
        self.distributor
            .broadcast_many(&EventMessage::object_counts(camera_id, counts), &camera_scopes(camera_id))
            .await;
    }

    pub async fn publish_stream_status(&self, update: &StreamStatusUpdate) {
        self.distributor
            .broadcast_many(&EventMessage::stream_status(update), &camera_scopes(&update.camera_id))
            .await;
    }
}
