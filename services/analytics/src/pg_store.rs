use crate::config::DatabaseConfig;
use crate::entity_store::{EntityStore, StoreError};
use crate::models::{AlertRecord, AnalyticsJob, Camera};
use crate::roi::{Point, RoiZone};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, FromRow)]
struct CameraRow {
    id: String,
    name: String,
    url: String,
    owner_id: Option<String>,
    status: String,
    is_active: bool,
}

#[derive(Debug, FromRow)]
struct JobRow {
    id: String,
    camera_id: String,
    name: String,
    is_active: bool,
    confidence_threshold: f64,
    max_detections: i32,
}

#[derive(Debug, FromRow)]
struct RoiRow {
    id: String,
    name: String,
    polygon_points: String,
    is_active: bool,
    alert_on_entry: bool,
    alert_on_exit: bool,
}

impl From<CameraRow> for Camera {
    fn from(row: CameraRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            url: row.url,
            owner_id: row.owner_id,
            status: row.status,
            is_active: row.is_active,
        }
    }
}

impl RoiRow {
    /// Zones whose stored polygon cannot be parsed are skipped
    fn into_zone(self) -> Option<RoiZone> {
        match serde_json::from_str::<Vec<Point>>(&self.polygon_points) {
            Ok(polygon) => Some(RoiZone {
                id: self.id,
                name: self.name,
                polygon,
                alert_on_entry: self.alert_on_entry,
                alert_on_exit: self.alert_on_exit,
                is_active: self.is_active,
            }),
            Err(e) => {
                warn!(roi_id = %self.id, error = %e, "Skipping zone with unreadable polygon");
                None
            }
        }
    }
}

fn store_error(error: sqlx::Error) -> StoreError {
    match error {
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => StoreError::Decode {
            entity: "row",
            message: error.to_string(),
        },
        other => StoreError::Unavailable(other.to_string()),
    }
}

/// PostgreSQL-backed entity store
pub struct PgEntityStore {
    pool: PgPool,
}

impl PgEntityStore {
    /// Create a new store with connection pool
    pub async fn connect(url: &str, config: &DatabaseConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(url)
            .await
            .map_err(store_error)?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(format!("migration failed: {e}")))?;

        info!("Database migrations completed");
        Ok(())
    }

    async fn load_job(&self, row: JobRow) -> Result<AnalyticsJob, StoreError> {
        let rois = sqlx::query_as::<_, RoiRow>(
            r#"
            SELECT id, name, polygon_points, is_active, alert_on_entry, alert_on_exit
            FROM rois
            WHERE analytics_job_id = $1
            ORDER BY id
            "#,
        )
        .bind(&row.id)
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        Ok(AnalyticsJob {
            id: row.id,
            camera_id: row.camera_id,
            name: row.name,
            is_active: row.is_active,
            confidence_threshold: row.confidence_threshold,
            max_detections: row.max_detections.max(0) as usize,
            zones: rois.into_iter().filter_map(RoiRow::into_zone).collect(),
        })
    }

    /// Get the connection pool (for health checks)
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl EntityStore for PgEntityStore {
    async fn camera(&self, camera_id: &str) -> Result<Option<Camera>, StoreError> {
        let row = sqlx::query_as::<_, CameraRow>(
            "SELECT id, name, url, owner_id, status, is_active FROM cameras WHERE id = $1",
        )
        .bind(camera_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        Ok(row.map(Camera::from))
    }

    async fn analytics_job(&self, job_id: &str) -> Result<Option<AnalyticsJob>, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, camera_id, name, is_active, confidence_threshold, max_detections
            FROM analytics_jobs
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        match row {
            Some(row) => Ok(Some(self.load_job(row).await?)),
            None => Ok(None),
        }
    }

    async fn active_job_for_camera(
        &self,
        camera_id: &str,
    ) -> Result<Option<AnalyticsJob>, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, camera_id, name, is_active, confidence_threshold, max_detections
            FROM analytics_jobs
            WHERE camera_id = $1 AND is_active
            ORDER BY id
            LIMIT 1
            "#,
        )
        .bind(camera_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        match row {
            Some(row) => Ok(Some(self.load_job(row).await?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self, alert), fields(alert_id = %alert.id, camera_id = %alert.camera_id))]
    async fn save_alert(&self, alert: &AlertRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO alert_events (
                id, timestamp, camera_id, analytics_job_id, alert_type,
                confidence, object_class, object_id,
                bbox_x, bbox_y, bbox_width, bbox_height,
                snapshot_path, event_metadata, processed
            ) VALUES (
                $1, $2, $3, $4, $5,
                $6, $7, $8,
                $9, $10, $11, $12,
                $13, $14, $15
            )
            "#,
        )
        .bind(alert.id)
        .bind(alert.timestamp)
        .bind(&alert.camera_id)
        .bind(&alert.analytics_job_id)
        .bind(&alert.alert_type)
        .bind(alert.confidence)
        .bind(&alert.object_class)
        .bind(&alert.object_id)
        .bind(alert.bbox.x)
        .bind(alert.bbox.y)
        .bind(alert.bbox.width)
        .bind(alert.bbox.height)
        .bind(&alert.snapshot_path)
        .bind(serde_json::Value::Object(alert.metadata.clone()))
        .bind(alert.processed)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        debug!("Alert persisted");
        metrics::counter!("vigil.alerts.persisted").increment(1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roi_row_parses_polygon() {
        let row = RoiRow {
            id: "roi-1".to_string(),
            name: "Entrance".to_string(),
            polygon_points: r#"[{"x":0.1,"y":0.1},{"x":0.9,"y":0.1},{"x":0.5,"y":0.9}]"#
                .to_string(),
            is_active: true,
            alert_on_entry: true,
            alert_on_exit: true,
        };
        let zone = row.into_zone().unwrap();
        assert_eq!(zone.polygon.len(), 3);
        assert!(zone.alert_on_exit);
    }

    #[test]
    fn test_roi_row_with_bad_polygon_is_skipped() {
        let row = RoiRow {
            id: "roi-2".to_string(),
            name: "Broken".to_string(),
            polygon_points: "not json".to_string(),
            is_active: true,
            alert_on_entry: true,
            alert_on_exit: false,
        };
        assert!(row.into_zone().is_none());
    }

    #[test]
    fn test_pool_timeout_is_transient() {
        assert!(matches!(
            store_error(sqlx::Error::PoolTimedOut),
            StoreError::Unavailable(_)
        ));
    }
}
