//! End-to-end session behaviour through the service context, using scripted
//! sources, the memory artifact store and channel subscribers.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use vigil_analytics::{
    AnalyticsJob, Camera, ChannelSink, DetectionMode, DistributorConfig, MemoryEntityStore, Scope,
};
use vigil_ingest::config::VigilConfig;
use vigil_ingest::scripted::{ReadStep, ScriptedConnector};
use vigil_ingest::{MemoryArtifactStore, ServiceContext, SessionState, StartOutcome, StopOutcome};
use vigil_pipeline::{MemoryQueue, MessagePublisher, OutgoingMessage};

struct Fixture {
    context: ServiceContext,
    connector: ScriptedConnector,
    artifacts: Arc<MemoryArtifactStore>,
    store: Arc<MemoryEntityStore>,
}

fn test_config() -> VigilConfig {
    let mut config = VigilConfig::default();
    config.sessions.connect_attempts = 3;
    config.sessions.connect_delay_ms = 5;
    config.sessions.connect_timeout_ms = 200;
    config.sessions.read_timeout_ms = 200;
    config.sessions.error_threshold = 3;
    config.sessions.stop_timeout_ms = 1000;
    config.segments.segment_duration_secs = 0.02;
    config.detection.cycle_interval_ms = 10;
    config.queue.receive_timeout_ms = 10;
    config.queue.reconnect_backoff_ms = 10;
    config
}

fn fixture(config: VigilConfig) -> Fixture {
    let connector = ScriptedConnector::new(Duration::from_millis(2));
    let artifacts = Arc::new(MemoryArtifactStore::new());
    let store = Arc::new(MemoryEntityStore::new());
    let context = ServiceContext::new(
        config,
        store.clone(),
        artifacts.clone(),
        Arc::new(connector.clone()),
    );
    Fixture {
        context,
        connector,
        artifacts,
        store,
    }
}

/// Subscriber limited to one camera's scope
fn camera_subscriber(context: &ServiceContext, camera_id: &str) -> mpsc::Receiver<Arc<str>> {
    let (sink, rx) = ChannelSink::new(&DistributorConfig::default());
    let conn = context.distributor().register(Arc::new(sink));
    assert!(context.subscribe(conn, Scope::Camera(camera_id.to_string())));
    rx
}

fn drain(rx: &mut mpsc::Receiver<Arc<str>>) -> Vec<Value> {
    let mut messages = Vec::new();
    while let Ok(payload) = rx.try_recv() {
        messages.push(serde_json::from_str(&payload).unwrap());
    }
    messages
}

fn status_states(messages: &[Value]) -> Vec<String> {
    messages
        .iter()
        .filter(|m| m["type"] == "stream_status")
        .map(|m| m["data"]["state"].as_str().unwrap().to_string())
        .collect()
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_error_threshold_degrades_and_removes_session() {
    let f = fixture(test_config());
    let mut rx = camera_subscriber(&f.context, "cam1");
    f.connector
        .script("cam1", [ReadStep::Fail, ReadStep::Fail, ReadStep::Fail]);

    assert_eq!(
        f.context.start_stream("cam1", "scripted://cam1").await,
        Ok(StartOutcome::Started)
    );

    wait_for(|| f.context.stream_status("cam1").is_none()).await;
    wait_for(|| f.connector.live_sources() == 0).await;

    // Teardown finishes with the final status broadcast
    tokio::time::sleep(Duration::from_millis(20)).await;
    let states = status_states(&drain(&mut rx));
    assert_eq!(states, vec!["connected", "degraded", "stopped"]);
    assert!(f.context.active_streams().is_empty());
    assert!(f.artifacts.keys().is_empty());
}

#[tokio::test]
async fn test_session_reports_connecting_while_opening() {
    let mut config = test_config();
    config.sessions.connect_delay_ms = 100;
    let f = fixture(config);
    f.connector.fail_opens("cam1", 1);

    let context = &f.context;
    let start = context.start_stream("cam1", "scripted://cam1");
    let observe = async {
        wait_for(|| context.stream_status("cam1").is_some()).await;
        context.stream_status("cam1").unwrap().state
    };
    let (started, observed) = tokio::join!(start, observe);

    assert_eq!(observed, SessionState::Connecting);
    assert_eq!(started, Ok(StartOutcome::Started));
    assert_eq!(f.context.stream_status("cam1").unwrap().state, SessionState::Connected);

    f.context.shutdown().await;
}

#[tokio::test]
async fn test_second_start_does_not_create_second_session() {
    let f = fixture(test_config());

    assert_eq!(
        f.context.start_stream("cam1", "scripted://cam1").await,
        Ok(StartOutcome::Started)
    );
    assert_eq!(
        f.context.start_stream("cam1", "scripted://other").await,
        Ok(StartOutcome::AlreadyActive)
    );

    assert_eq!(f.connector.open_attempts("cam1"), 1);
    assert_eq!(f.connector.live_sources(), 1);
    assert_eq!(f.context.active_streams().len(), 1);
    assert_eq!(f.context.stream_status("cam1").unwrap().source, "scripted://cam1");

    f.context.shutdown().await;
}

#[tokio::test]
async fn test_stop_releases_everything() {
    let f = fixture(test_config());
    let mut rx = camera_subscriber(&f.context, "cam1");

    f.context.start_stream("cam1", "scripted://cam1").await.unwrap();
    wait_for(|| {
        f.context
            .stream_status("cam1")
            .map(|s| s.segment_count >= 2 && s.frame_count > 0)
            .unwrap_or(false)
    })
    .await;
    assert!(f.artifacts.get("cam1/playlist.m3u8").is_some());
    assert!(f.artifacts.get("cam1/index.m3u8").is_some());

    assert_eq!(f.context.stop_stream("cam1").await, StopOutcome::Stopped);

    assert_eq!(f.connector.live_sources(), 0);
    assert!(f.artifacts.keys().is_empty());
    assert!(f.context.playlist("cam1").is_empty());
    assert!(f.context.stream_status("cam1").is_none());
    assert_eq!(f.context.stop_stream("cam1").await, StopOutcome::NotFound);

    let states = status_states(&drain(&mut rx));
    assert_eq!(states.first().map(String::as_str), Some("connected"));
    assert_eq!(states.last().map(String::as_str), Some("stopped"));
}

#[tokio::test]
async fn test_restart_after_stop() {
    let f = fixture(test_config());

    f.context.start_stream("cam1", "scripted://cam1").await.unwrap();
    f.context.stop_stream("cam1").await;
    assert_eq!(
        f.context.start_stream("cam1", "scripted://cam1").await,
        Ok(StartOutcome::Started)
    );
    assert_eq!(f.connector.open_attempts("cam1"), 2);
    assert_eq!(f.connector.live_sources(), 1);

    f.context.shutdown().await;
    assert_eq!(f.connector.live_sources(), 0);
}

#[tokio::test]
async fn test_window_keeps_last_five_segments() {
    let f = fixture(test_config());
    let publisher = f.context.publisher();
    let generation = Uuid::new_v4();
    publisher.open_window("cam1", generation).await;

    for _ in 0..6 {
        publisher.publish_tick("cam1", generation, &[]).await.unwrap();
    }

    let sequences: Vec<u64> = f.context.playlist("cam1").iter().map(|s| s.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3, 4, 5]);

    let segment_keys: Vec<String> = f
        .artifacts
        .keys()
        .into_iter()
        .filter(|k| k.ends_with(".ts"))
        .collect();
    assert_eq!(segment_keys.len(), 5);
    assert!(!segment_keys.contains(&"cam1/segment_000000.ts".to_string()));

    let media = f.artifacts.get_text("cam1/playlist.m3u8").unwrap();
    assert!(media.contains("#EXT-X-MEDIA-SEQUENCE:1\n"));

    assert!(f.context.finalize_stream("cam1").await.unwrap());
    let media = f.artifacts.get_text("cam1/playlist.m3u8").unwrap();
    assert!(media.ends_with("#EXT-X-ENDLIST\n"));
}

#[tokio::test]
async fn test_finalize_live_stream_keeps_final_playlist() {
    let f = fixture(test_config());
    let mut rx = camera_subscriber(&f.context, "cam1");

    f.context.start_stream("cam1", "scripted://cam1").await.unwrap();
    wait_for(|| {
        f.context
            .stream_status("cam1")
            .map(|s| s.segment_count >= 2)
            .unwrap_or(false)
    })
    .await;

    assert!(f.context.finalize_stream("cam1").await.unwrap());
    assert!(f.context.stream_status("cam1").is_none());
    assert_eq!(f.connector.live_sources(), 0);

    // Several segment intervals later the end marker is still in place
    tokio::time::sleep(Duration::from_millis(100)).await;
    let media = f.artifacts.get_text("cam1/playlist.m3u8").unwrap();
    assert!(media.ends_with("#EXT-X-ENDLIST\n"));
    assert_eq!(media.matches("#EXT-X-ENDLIST").count(), 1);
    assert!(f.artifacts.get("cam1/index.m3u8").is_some());

    let segments: Vec<String> = f
        .artifacts
        .keys()
        .into_iter()
        .filter(|k| k.ends_with(".ts"))
        .collect();
    assert!(!segments.is_empty());
    for segment in &segments {
        let name = segment.trim_start_matches("cam1/");
        assert!(media.contains(name), "{name} missing from final playlist");
    }

    // Stopping afterwards finds nothing to release
    assert_eq!(f.context.stop_stream("cam1").await, StopOutcome::NotFound);
    assert!(f.artifacts.get_text("cam1/playlist.m3u8").is_some());

    let states = status_states(&drain(&mut rx));
    assert_eq!(states.last().map(String::as_str), Some("stopped"));
}

#[tokio::test]
async fn test_broadcast_reaches_only_camera_subscribers() {
    let f = fixture(test_config());
    let mut cam1 = camera_subscriber(&f.context, "cam1");
    let mut cam2 = camera_subscriber(&f.context, "cam2");

    f.context.start_stream("cam1", "scripted://cam1").await.unwrap();
    f.context.stop_stream("cam1").await;

    assert!(!status_states(&drain(&mut cam1)).is_empty());
    assert!(drain(&mut cam2).is_empty());
}

#[tokio::test]
async fn test_ingested_detections_reach_subscribers() {
    let mut config = test_config();
    config.detection.mode = DetectionMode::Ingested;
    let f = fixture(config);

    f.store.insert_camera(Camera {
        id: "cam1".to_string(),
        name: "Dock".to_string(),
        url: "scripted://cam1".to_string(),
        owner_id: None,
        status: "active".to_string(),
        is_active: true,
    });
    f.store.insert_job(AnalyticsJob {
        id: "job1".to_string(),
        camera_id: "cam1".to_string(),
        name: "Dock watch".to_string(),
        is_active: true,
        confidence_threshold: 0.5,
        max_detections: 10,
        zones: Vec::new(),
    });

    let mut rx = camera_subscriber(&f.context, "cam1");
    f.context.start_stream("cam1", "scripted://cam1").await.unwrap();

    let queue = MemoryQueue::new();
    let raw_topic = f.context.config().queue.topics.metadata_raw.clone();
    let alerts_topic = f.context.config().queue.topics.alerts_critical.clone();
    let mut adapter = f
        .context
        .ingest_adapter(queue.subscribe(raw_topic.clone()), Arc::new(queue.clone()));
    let shutdown = CancellationToken::new();
    let ingest = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { adapter.run(shutdown).await }
    });

    let payload = serde_json::json!({
        "camera_id": "cam1",
        "analytics_job_id": "job1",
        "confidence": 0.9,
        "object_class": "person",
        "object_id": "trk-1",
        "bbox": {"x": 0.2, "y": 0.2, "width": 0.1, "height": 0.2}
    });
    queue
        .publish(OutgoingMessage::new_json(raw_topic, &payload).unwrap())
        .await
        .unwrap();

    let mut seen = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let message: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
            seen.push(message["type"].as_str().unwrap_or_default().to_string());
            if message["type"] == "detection" {
                assert_eq!(message["data"]["object_class"], "person");
                break;
            }
        }
    })
    .await
    .expect("detection not delivered");

    assert!(seen.iter().any(|kind| kind == "alert"));
    assert_eq!(f.store.alerts().len(), 1);
    assert_eq!(queue.pending(&alerts_topic).len(), 1);

    shutdown.cancel();
    ingest.await.unwrap();
    f.context.shutdown().await;
}
