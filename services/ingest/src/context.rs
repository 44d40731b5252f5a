//! The service's owned state.
//!
//! Everything a request handler or background loop needs is reached through
//! one [`ServiceContext`], built once at startup and dropped at shutdown.
//! Nothing here is process-global, so tests build as many contexts as they
//! like.

use crate::artifact::{ArtifactError, ArtifactStore, FsArtifactStore, MemoryArtifactStore};
use crate::config::{ArtifactBackend, SegmentConfig, VigilConfig};
use crate::segment::{Segment, SegmentPublisher};
use crate::session::{SessionError, SessionManager, StartOutcome, StopOutcome, StreamStatus};
use crate::source::SourceConnector;
use std::sync::Arc;
use tracing::{info, warn};
use vigil_analytics::{
    ClientCommand, ConnectionId, ConnectionStats, DetectionMode, EntityStore, EventDistributor,
    EventPublisher, EventSink, IngestedFeed, MetadataIngestAdapter, ObjectCount, Scope,
};
use vigil_pipeline::{MessagePublisher, MessageSource};

/// Detections buffered per camera for the ingested backend
const INGESTED_FEED_CAPACITY: usize = 256;

/// Build the artifact store selected by `segments.artifact_backend`.
pub async fn artifact_store(config: &SegmentConfig) -> anyhow::Result<Arc<dyn ArtifactStore>> {
    match config.artifact_backend {
        ArtifactBackend::Fs => {
            info!(output_dir = %config.output_dir, "Using filesystem artifact store");
            Ok(Arc::new(FsArtifactStore::new(&config.output_dir)))
        }
        ArtifactBackend::Memory => Ok(Arc::new(MemoryArtifactStore::new())),
        #[cfg(feature = "s3")]
        ArtifactBackend::S3 => {
            let s3 = config
                .s3
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("segments.s3 is required for the s3 backend"))?;
            Ok(Arc::new(crate::artifact::S3ArtifactStore::new(s3).await))
        }
        #[cfg(not(feature = "s3"))]
        ArtifactBackend::S3 => anyhow::bail!("artifact backend s3 requires the s3 feature"),
    }
}

pub struct ServiceContext {
    config: VigilConfig,
    sessions: SessionManager,
    distributor: Arc<EventDistributor>,
    store: Arc<dyn EntityStore>,
    publisher: Arc<SegmentPublisher>,
    events: EventPublisher,
    feed: IngestedFeed,
}

impl ServiceContext {
    pub fn new(
        config: VigilConfig,
        store: Arc<dyn EntityStore>,
        artifacts: Arc<dyn ArtifactStore>,
        connector: Arc<dyn SourceConnector>,
    ) -> Self {
        let distributor = Arc::new(EventDistributor::new());
        let feed = IngestedFeed::new(INGESTED_FEED_CAPACITY);
        let publisher = Arc::new(SegmentPublisher::new(config.segments.clone(), artifacts));

        // Ingested detections were persisted by the ingest adapter already.
        let persist = config.detection.mode == DetectionMode::Simulated;
        let events = EventPublisher::new(Arc::clone(&distributor), Arc::clone(&store), persist);

        let sessions = SessionManager::new(
            config.sessions.clone(),
            config.detection.clone(),
            connector,
            Arc::clone(&publisher),
            events.clone(),
            Arc::clone(&store),
            feed.clone(),
        );

        Self {
            config,
            sessions,
            distributor,
            store,
            publisher,
            events,
            feed,
        }
    }

    pub fn config(&self) -> &VigilConfig {
        &self.config
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn distributor(&self) -> &Arc<EventDistributor> {
        &self.distributor
    }

    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.store
    }

    pub fn publisher(&self) -> &Arc<SegmentPublisher> {
        &self.publisher
    }

    pub fn events(&self) -> &EventPublisher {
        &self.events
    }

    pub fn feed(&self) -> &IngestedFeed {
        &self.feed
    }

    pub async fn start_stream(&self, camera_id: &str, source: &str) -> Result<StartOutcome, SessionError> {
        self.sessions.start(camera_id, source).await
    }

    pub async fn stop_stream(&self, camera_id: &str) -> StopOutcome {
        self.sessions.stop(camera_id).await
    }

    pub fn stream_status(&self, camera_id: &str) -> Option<StreamStatus> {
        self.sessions.status(camera_id)
    }

    pub fn active_streams(&self) -> Vec<StreamStatus> {
        self.sessions.list_active()
    }

    pub fn playlist(&self, camera_id: &str) -> Vec<Segment> {
        self.publisher.playlist(camera_id)
    }

    /// End a camera's stream with a final playlist, keeping its artifacts
    pub async fn finalize_stream(&self, camera_id: &str) -> Result<bool, ArtifactError> {
        self.sessions.finalize(camera_id).await
    }

    /// Object counts of a live stream
    pub fn current_counts(&self, camera_id: &str) -> Option<Vec<ObjectCount>> {
        self.sessions.current_counts(camera_id)
    }

    /// Reset object counters of one stream, or of all streams
    pub fn reset_counters(&self, camera_id: Option<&str>) -> usize {
        self.sessions.reset_counters(camera_id)
    }

    pub fn set_detection_rate(&self, rate: f64) -> f64 {
        self.sessions.set_detection_rate(rate)
    }

    /// Register a subscriber connection. With a user id the connection is
    /// also subscribed to that user's scope.
    pub fn connect_subscriber(&self, sink: Arc<dyn EventSink>, user_id: Option<&str>) -> ConnectionId {
        self.distributor.connect(sink, user_id)
    }

    pub fn subscribe(&self, conn: ConnectionId, scope: Scope) -> bool {
        self.distributor.subscribe(conn, scope)
    }

    pub fn unsubscribe(&self, conn: ConnectionId, scope: &Scope) -> bool {
        self.distributor.unsubscribe(conn, scope)
    }

    pub fn disconnect_subscriber(&self, conn: ConnectionId) -> bool {
        self.distributor.drop_connection(conn)
    }

    pub async fn handle_command(&self, conn: ConnectionId, command: ClientCommand) {
        self.distributor.handle_command(conn, command).await
    }

    pub fn connection_stats(&self) -> ConnectionStats {
        self.distributor.connection_stats()
    }

    /// Metadata ingest adapter wired to this context's store and subscribers
    pub fn ingest_adapter<S: MessageSource>(
        &self,
        source: S,
        publisher: Arc<dyn MessagePublisher>,
    ) -> MetadataIngestAdapter<S> {
        let adapter = MetadataIngestAdapter::new(source, publisher, Arc::clone(&self.store), &self.config.queue)
            .with_events(self.events.clone());
        match self.config.detection.mode {
            DetectionMode::Ingested => adapter.with_feed(self.feed.clone()),
            DetectionMode::Simulated => adapter,
        }
    }

    /// Start the streams listed in the configuration. Failures are logged
    /// and do not prevent the remaining streams from starting.
    pub async fn start_configured_streams(&self) -> usize {
        let mut started = 0;
        for stream in &self.config.streams {
            match self.sessions.start(&stream.camera_id, &stream.url).await {
                Ok(StartOutcome::Started) => started += 1,
                Ok(StartOutcome::AlreadyActive) => {}
                Err(e) => {
                    warn!(camera_id = %stream.camera_id, error = %e, "Failed to start configured stream");
                }
            }
        }
        started
    }

    pub async fn shutdown(&self) {
        self.sessions.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::ScriptedConnector;
    use vigil_analytics::MemoryEntityStore;

    #[tokio::test]
    async fn test_memory_artifact_backend() {
        let config = SegmentConfig {
            artifact_backend: ArtifactBackend::Memory,
            ..Default::default()
        };
        assert!(artifact_store(&config).await.is_ok());
    }

    #[cfg(not(feature = "s3"))]
    #[tokio::test]
    async fn test_s3_backend_needs_feature() {
        let config = SegmentConfig {
            artifact_backend: ArtifactBackend::S3,
            ..Default::default()
        };
        assert!(artifact_store(&config).await.is_err());
    }

    #[tokio::test]
    async fn test_configured_streams_start_independently() {
        let mut config = VigilConfig::default();
        config.sessions.connect_attempts = 1;
        config.streams = vec![
            crate::config::StreamDefinition {
                camera_id: "good".to_string(),
                url: "scripted://good".to_string(),
            },
            crate::config::StreamDefinition {
                camera_id: "bad".to_string(),
                url: "scripted://bad".to_string(),
            },
        ];

        let connector = ScriptedConnector::default();
        connector.fail_opens("bad", 1);
        let context = ServiceContext::new(
            config,
            Arc::new(MemoryEntityStore::new()),
            Arc::new(MemoryArtifactStore::new()),
            Arc::new(connector),
        );

        assert_eq!(context.start_configured_streams().await, 1);
        assert!(context.stream_status("good").is_some());
        assert!(context.stream_status("bad").is_none());

        context.shutdown().await;
        assert!(context.active_streams().is_empty());
    }
}
