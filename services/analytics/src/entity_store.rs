//! Entity store seam.
//!
//! Cameras and analytics jobs are owned by an external persistence layer;
//! this crate only reads them and writes alert records.

use crate::models::{AlertRecord, AnalyticsJob, Camera};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// Transient: the caller may retry later
    #[error("Entity store unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to decode {entity}: {message}")]
    Decode { entity: &'static str, message: String },
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn camera(&self, camera_id: &str) -> Result<Option<Camera>, StoreError>;

    async fn analytics_job(&self, job_id: &str) -> Result<Option<AnalyticsJob>, StoreError>;

    /// The active job configured for a camera, if any
    async fn active_job_for_camera(&self, camera_id: &str)
        -> Result<Option<AnalyticsJob>, StoreError>;

    async fn save_alert(&self, alert: &AlertRecord) -> Result<(), StoreError>;
}

#[derive(Default)]
struct Tables {
    cameras: HashMap<String, Camera>,
    jobs: HashMap<String, AnalyticsJob>,
    alerts: Vec<AlertRecord>,
}

/// Store kept in process memory, used when no database is configured
#[derive(Default)]
pub struct MemoryEntityStore {
    tables: RwLock<Tables>,
    unavailable: RwLock<Option<String>>,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_camera(&self, camera: Camera) {
        self.tables.write().cameras.insert(camera.id.clone(), camera);
    }

    pub fn insert_job(&self, job: AnalyticsJob) {
        self.tables.write().jobs.insert(job.id.clone(), job);
    }

    /// All persisted alerts, oldest first
    pub fn alerts(&self) -> Vec<AlertRecord> {
        self.tables.read().alerts.clone()
    }

    /// Make every call fail with [`StoreError::Unavailable`] until cleared
    pub fn set_unavailable(&self, reason: Option<&str>) {
        *self.unavailable.write() = reason.map(str::to_string);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        match self.unavailable.read().as_ref() {
            Some(reason) => Err(StoreError::Unavailable(reason.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl EntityStore for MemoryEntityStore {
    async fn camera(&self, camera_id: &str) -> Result<Option<Camera>, StoreError> {
        self.check_available()?;
        Ok(self.tables.read().cameras.get(camera_id).cloned())
    }

    async fn analytics_job(&self, job_id: &str) -> Result<Option<AnalyticsJob>, StoreError> {
        self.check_available()?;
        Ok(self.tables.read().jobs.get(job_id).cloned())
    }

    async fn active_job_for_camera(
        &self,
        camera_id: &str,
    ) -> Result<Option<AnalyticsJob>, StoreError> {
        self.check_available()?;
        let tables = self.tables.read();
        let mut jobs: Vec<&AnalyticsJob> = tables
            .jobs
            .values()
            .filter(|job| job.camera_id == camera_id && job.is_active)
            .collect();
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(jobs.first().map(|job| (*job).clone()))
    }

    async fn save_alert(&self, alert: &AlertRecord) -> Result<(), StoreError> {
        self.check_available()?;
        self.tables.write().alerts.push(alert.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: &str, camera_id: &str, is_active: bool) -> AnalyticsJob {
        AnalyticsJob {
            id: id.to_string(),
            camera_id: camera_id.to_string(),
            name: format!("job {id}"),
            is_active,
            confidence_threshold: 0.5,
            max_detections: 10,
            zones: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_active_job_lookup() {
        let store = MemoryEntityStore::new();
        store.insert_job(job("job-b", "cam-1", false));
        store.insert_job(job("job-a", "cam-1", true));
        store.insert_job(job("job-c", "cam-2", true));

        let found = store.active_job_for_camera("cam-1").await.unwrap();
        assert_eq!(found.map(|j| j.id), Some("job-a".to_string()));
        assert!(store.active_job_for_camera("cam-3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unavailable_store() {
        let store = MemoryEntityStore::new();
        store.set_unavailable(Some("connection refused"));
        assert!(matches!(
            store.camera("cam-1").await,
            Err(StoreError::Unavailable(_))
        ));

        store.set_unavailable(None);
        assert_eq!(store.camera("cam-1").await, Ok(None));
    }
}
