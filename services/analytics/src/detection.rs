//! Detection engine.
//!
//! Each cycle pulls raw detections for one camera from a backend, resolves
//! object identity against the camera's tracks, maintains novelty-gated
//! per-class counts and derives zone entry/exit events.

use crate::config::{clamp_rate, DetectionConfig};
use crate::models::{AnalyticsJob, DetectionEvent, DetectionKind, Metadata};
use crate::roi::Point;
use crate::tracker::TrackRegistry;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, trace};
use uuid::Uuid;
use vigil_pipeline::BoundingBox;

/// A detection before identity resolution
#[derive(Debug, Clone, PartialEq)]
pub struct RawDetection {
    pub object_class: String,
    pub confidence: f64,
    pub bbox: BoundingBox,
    /// Tracker id assigned upstream, if any
    pub object_id: Option<String>,
    pub snapshot_path: Option<String>,
    pub metadata: Metadata,
}

/// Source of raw detections for a camera
pub trait DetectionBackend: Send {
    /// At most `limit` detections for this cycle
    fn detect(&mut self, camera_id: &str, job: &AnalyticsJob, limit: usize) -> Vec<RawDetection>;

    /// Adjust the expected detections per cycle where the backend supports it
    fn set_rate(&mut self, _rate: f64) {}

    fn name(&self) -> &'static str;
}

/// Buffer of externally produced detections, shared between the metadata
/// ingest adapter (producer) and camera sessions (consumers).
#[derive(Clone)]
pub struct IngestedFeed {
    queues: Arc<Mutex<HashMap<String, VecDeque<RawDetection>>>>,
    capacity: usize,
}

impl IngestedFeed {
    pub fn new(capacity: usize) -> Self {
        Self {
            queues: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Queue a detection for a camera, discarding the oldest when full
    pub fn push(&self, camera_id: &str, detection: RawDetection) {
        let mut queues = self.queues.lock();
        let queue = queues.entry(camera_id.to_string()).or_default();
        if queue.len() == self.capacity {
            queue.pop_front();
            metrics::counter!("vigil.detections.ingested_dropped").increment(1);
        }
        queue.push_back(detection);
    }

    pub fn drain(&self, camera_id: &str, limit: usize) -> Vec<RawDetection> {
        let mut queues = self.queues.lock();
        match queues.get_mut(camera_id) {
            Some(queue) => {
                let take = limit.min(queue.len());
                queue.drain(..take).collect()
            }
            None => Vec::new(),
        }
    }

    pub fn pending(&self, camera_id: &str) -> usize {
        self.queues.lock().get(camera_id).map(VecDeque::len).unwrap_or(0)
    }

    pub fn clear(&self, camera_id: &str) {
        self.queues.lock().remove(camera_id);
    }
}

/// Backend fed by the inference pipeline through an [`IngestedFeed`]
pub struct IngestedBackend {
    feed: IngestedFeed,
}

impl IngestedBackend {
    pub fn new(feed: IngestedFeed) -> Self {
        Self { feed }
    }
}

impl DetectionBackend for IngestedBackend {
    fn detect(&mut self, camera_id: &str, _job: &AnalyticsJob, limit: usize) -> Vec<RawDetection> {
        self.feed.drain(camera_id, limit)
    }

    fn name(&self) -> &'static str {
        "ingested"
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectCount {
    pub object_class: String,
    pub count: u64,
}

struct CameraState {
    tracks: TrackRegistry,
    counts: BTreeMap<String, u64>,
    cycles: u64,
}

pub struct DetectionEngine {
    config: DetectionConfig,
    backend: Box<dyn DetectionBackend>,
    cameras: HashMap<String, CameraState>,
    rng: StdRng,
}

impl DetectionEngine {
    pub fn new(config: DetectionConfig, backend: Box<dyn DetectionBackend>) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            backend,
            cameras: HashMap::new(),
            rng,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Run one cycle for a camera at the current time
    pub fn cycle(&mut self, camera_id: &str, job: &AnalyticsJob) -> Vec<DetectionEvent> {
        self.cycle_at(camera_id, job, Utc::now())
    }

    pub fn cycle_at(
        &mut self,
        camera_id: &str,
        job: &AnalyticsJob,
        now: DateTime<Utc>,
    ) -> Vec<DetectionEvent> {
        if !job.is_active {
            return Vec::new();
        }

        let Self {
            config,
            backend,
            cameras,
            rng,
        } = self;

        let state = cameras
            .entry(camera_id.to_string())
            .or_insert_with(|| CameraState {
                tracks: TrackRegistry::new(config.reuse_window()),
                counts: BTreeMap::new(),
                cycles: 0,
            });
        state.cycles += 1;
        let expired = state.tracks.prune(now);
        if expired > 0 {
            trace!(camera_id, expired, "Expired tracks");
        }

        let limit = config.max_detections_per_cycle.min(job.max_detections);
        let raw = backend.detect(camera_id, job, limit);

        let mut events = Vec::new();
        for detection in raw.into_iter().take(limit) {
            if detection.confidence < job.confidence_threshold {
                trace!(
                    camera_id,
                    confidence = detection.confidence,
                    threshold = job.confidence_threshold,
                    "Detection below job threshold"
                );
                continue;
            }

            let resolution = match detection.object_id.as_deref() {
                Some(id) => state.tracks.observe(id, &detection.object_class, now),
                None => state.tracks.resolve(
                    &detection.object_class,
                    now,
                    config.reuse_probability,
                    &mut *rng,
                ),
            };

            if resolution.is_new {
                *state
                    .counts
                    .entry(detection.object_class.clone())
                    .or_insert(0) += 1;
                metrics::counter!("vigil.detections.new_objects").increment(1);
            }

            let base = DetectionEvent {
                id: Uuid::new_v4(),
                kind: DetectionKind::Detection,
                camera_id: camera_id.to_string(),
                object_class: detection.object_class,
                confidence: detection.confidence.clamp(0.0, 1.0),
                bbox: detection.bbox,
                object_id: resolution.object_id.clone(),
                zone_id: None,
                snapshot_path: detection.snapshot_path,
                timestamp: now,
                metadata: detection.metadata,
            };

            let zone_events = match state.tracks.get_mut(&resolution.object_id) {
                Some(track) => {
                    let (cx, cy) = base.bbox.center();
                    let center = Point::new(cx, cy);
                    let mut derived = Vec::new();
                    for zone in job.zones.iter().filter(|z| z.is_active) {
                        if zone.contains(center) {
                            track.zones.insert(zone.id.clone());
                            if zone.alert_on_entry {
                                derived.push(zone_event(&base, DetectionKind::ZoneEntry, &zone.id));
                            }
                        } else if track.zones.remove(&zone.id) && zone.alert_on_exit {
                            derived.push(zone_event(&base, DetectionKind::ZoneExit, &zone.id));
                        }
                    }
                    derived
                }
                None => Vec::new(),
            };

            events.push(base);
            events.extend(zone_events);
        }

        metrics::counter!("vigil.detections.generated").increment(events.len() as u64);
        debug!(
            camera_id,
            backend = backend.name(),
            events = events.len(),
            "Detection cycle complete"
        );
        events
    }

    /// Current counts for a camera, sorted by class
    pub fn current_counts(&self, camera_id: &str) -> Vec<ObjectCount> {
        self.cameras
            .get(camera_id)
            .map(|state| {
                state
                    .counts
                    .iter()
                    .map(|(object_class, count)| ObjectCount {
                        object_class: object_class.clone(),
                        count: *count,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether the latest cycle for a camera is one whose counts are broadcast
    pub fn counts_due(&self, camera_id: &str) -> bool {
        let every = self.config.counts_every_cycles.max(1);
        self.cameras
            .get(camera_id)
            .map(|state| state.cycles > 0 && state.cycles % every == 0)
            .unwrap_or(false)
    }

    /// Reset counters of one camera, or of all cameras
    pub fn reset_counters(&mut self, camera_id: Option<&str>) {
        match camera_id {
            Some(id) => {
                if let Some(state) = self.cameras.get_mut(id) {
                    state.counts.clear();
                }
            }
            None => self.cameras.values_mut().for_each(|s| s.counts.clear()),
        }
    }

    pub fn set_detection_rate(&mut self, rate: f64) {
        let rate = clamp_rate(rate);
        self.config.detection_rate = rate;
        self.backend.set_rate(rate);
    }

    pub fn detection_rate(&self) -> f64 {
        self.config.detection_rate
    }

    /// Drop tracks and counters of a camera
    pub fn forget_camera(&mut self, camera_id: &str) {
        self.cameras.remove(camera_id);
    }

    pub fn live_tracks(&self, camera_id: &str) -> usize {
        self.cameras.get(camera_id).map(|s| s.tracks.len()).unwrap_or(0)
    }
}

fn zone_event(base: &DetectionEvent, kind: DetectionKind, zone_id: &str) -> DetectionEvent {
    DetectionEvent {
        id: Uuid::new_v4(),
        kind,
        zone_id: Some(zone_id.to_string()),
        ..base.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roi::RoiZone;
    use chrono::Duration;

    /// Backend replaying fixed detections every cycle
    struct FixedBackend {
        detections: Vec<RawDetection>,
    }

    impl DetectionBackend for FixedBackend {
        fn detect(&mut self, _camera_id: &str, _job: &AnalyticsJob, limit: usize) -> Vec<RawDetection> {
            self.detections.iter().take(limit).cloned().collect()
        }

        fn name(&self) -> &'static str {
            "fixed"
        }
    }

    fn raw(class: &str, confidence: f64, object_id: Option<&str>, bbox: BoundingBox) -> RawDetection {
        RawDetection {
            object_class: class.to_string(),
            confidence,
            bbox,
            object_id: object_id.map(str::to_string),
            snapshot_path: None,
            metadata: Metadata::new(),
        }
    }

    fn dock_zone(alert_on_exit: bool) -> RoiZone {
        RoiZone {
            id: "dock".to_string(),
            name: "Dock".to_string(),
            polygon: vec![
                Point::new(0.0, 0.0),
                Point::new(0.5, 0.0),
                Point::new(0.5, 0.5),
                Point::new(0.0, 0.5),
            ],
            alert_on_entry: true,
            alert_on_exit,
            is_active: true,
        }
    }

    fn job(zones: Vec<RoiZone>) -> AnalyticsJob {
        AnalyticsJob {
            id: "job-1".to_string(),
            camera_id: "cam-1".to_string(),
            name: "Dock watch".to_string(),
            is_active: true,
            confidence_threshold: 0.5,
            max_detections: 10,
            zones,
        }
    }

    fn config(reuse_probability: f64) -> DetectionConfig {
        DetectionConfig {
            reuse_probability,
            seed: Some(42),
            counts_every_cycles: 2,
            ..Default::default()
        }
    }

    fn engine(reuse_probability: f64, detections: Vec<RawDetection>) -> DetectionEngine {
        DetectionEngine::new(config(reuse_probability), Box::new(FixedBackend { detections }))
    }

    fn inside() -> BoundingBox {
        BoundingBox::new(0.1, 0.1, 0.1, 0.1)
    }

    fn outside() -> BoundingBox {
        BoundingBox::new(0.7, 0.7, 0.1, 0.1)
    }

    #[test]
    fn test_counting_is_novelty_gated() {
        let mut engine = engine(0.0, vec![raw("person", 0.9, Some("trk-1"), outside())]);
        let job = job(Vec::new());
        let now = Utc::now();

        for i in 0..3 {
            engine.cycle_at("cam-1", &job, now + Duration::seconds(i));
        }

        let counts = engine.current_counts("cam-1");
        assert_eq!(
            counts,
            vec![ObjectCount {
                object_class: "person".to_string(),
                count: 1
            }]
        );
    }

    #[test]
    fn test_new_identity_every_detection_without_reuse() {
        let mut engine = engine(0.0, vec![raw("car", 0.9, None, outside())]);
        let job = job(Vec::new());
        let now = Utc::now();

        let first = engine.cycle_at("cam-1", &job, now);
        let second = engine.cycle_at("cam-1", &job, now + Duration::seconds(1));
        assert_ne!(first[0].object_id, second[0].object_id);
        assert_eq!(engine.current_counts("cam-1")[0].count, 2);
    }

    #[test]
    fn test_cycles_reuse_live_track_of_same_class() {
        let mut engine = engine(
            1.0,
            vec![
                raw("car", 0.9, None, outside()),
                raw("person", 0.9, None, outside()),
            ],
        );
        let job = job(Vec::new());
        let now = Utc::now();

        let first = engine.cycle_at("cam-1", &job, now);
        let second = engine.cycle_at("cam-1", &job, now + Duration::seconds(1));
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);
        assert_eq!(first[0].object_id, second[0].object_id);
        assert_eq!(first[1].object_id, second[1].object_id);
        assert_ne!(second[0].object_id, second[1].object_id);
        let counts: Vec<u64> = engine.current_counts("cam-1").iter().map(|c| c.count).collect();
        assert_eq!(counts, vec![1, 1]);

        // Past the reuse window the track is gone and a new identity is minted
        let later = engine.cycle_at("cam-1", &job, now + Duration::seconds(120));
        assert_ne!(later[0].object_id, first[0].object_id);
        assert_eq!(engine.current_counts("cam-1")[0].count, 2);
    }

    #[test]
    fn test_zone_entry_event_is_emitted() {
        let mut engine = engine(0.0, vec![raw("person", 0.9, Some("trk-1"), inside())]);
        let events = engine.cycle_at("cam-1", &job(vec![dock_zone(false)]), Utc::now());

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, DetectionKind::Detection);
        assert_eq!(events[1].kind, DetectionKind::ZoneEntry);
        assert_eq!(events[1].zone_id.as_deref(), Some("dock"));
        assert_eq!(events[1].object_id, events[0].object_id);
    }

    #[test]
    fn test_zone_exit_event_when_object_leaves() {
        let feed = IngestedFeed::new(16);
        let mut engine = DetectionEngine::new(config(0.0), Box::new(IngestedBackend::new(feed.clone())));
        let job = job(vec![dock_zone(true)]);
        let now = Utc::now();

        feed.push("cam-1", raw("person", 0.9, Some("trk-1"), inside()));
        engine.cycle_at("cam-1", &job, now);

        feed.push("cam-1", raw("person", 0.9, Some("trk-1"), outside()));
        let events = engine.cycle_at("cam-1", &job, now + Duration::seconds(1));

        let kinds: Vec<DetectionKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![DetectionKind::Detection, DetectionKind::ZoneExit]);
    }

    #[test]
    fn test_malformed_zone_never_matches() {
        let mut broken = dock_zone(false);
        broken.polygon.truncate(2);
        let mut engine = engine(0.0, vec![raw("person", 0.9, None, inside())]);

        let events = engine.cycle_at("cam-1", &job(vec![broken]), Utc::now());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, DetectionKind::Detection);
    }

    #[test]
    fn test_low_confidence_detections_are_dropped() {
        let mut engine = engine(0.0, vec![raw("person", 0.3, None, inside())]);
        assert!(engine.cycle_at("cam-1", &job(Vec::new()), Utc::now()).is_empty());
        assert!(engine.current_counts("cam-1").is_empty());
    }

    #[test]
    fn test_inactive_job_yields_nothing() {
        let mut engine = engine(0.0, vec![raw("person", 0.9, None, inside())]);
        let mut job = job(Vec::new());
        job.is_active = false;
        assert!(engine.cycle_at("cam-1", &job, Utc::now()).is_empty());
    }

    #[test]
    fn test_job_limit_caps_detections() {
        let detections = (0..5).map(|_| raw("car", 0.9, None, outside())).collect();
        let mut engine = engine(0.0, detections);
        let mut job = job(Vec::new());
        job.max_detections = 2;
        assert_eq!(engine.cycle_at("cam-1", &job, Utc::now()).len(), 2);
    }

    #[test]
    fn test_counts_due_and_reset() {
        let mut engine = engine(0.0, vec![raw("bus", 0.9, None, outside())]);
        let job = job(Vec::new());
        let now = Utc::now();

        engine.cycle_at("cam-1", &job, now);
        assert!(!engine.counts_due("cam-1"));
        engine.cycle_at("cam-1", &job, now);
        assert!(engine.counts_due("cam-1"));

        engine.reset_counters(Some("cam-1"));
        assert!(engine.current_counts("cam-1").is_empty());
    }

    #[test]
    fn test_detection_rate_is_clamped() {
        let mut engine = engine(0.0, Vec::new());
        engine.set_detection_rate(12.0);
        assert_eq!(engine.detection_rate(), 5.0);
        engine.set_detection_rate(0.0);
        assert_eq!(engine.detection_rate(), 0.1);
    }

    #[test]
    fn test_cameras_are_isolated() {
        let mut engine = engine(1.0, vec![raw("person", 0.9, None, outside())]);
        let job = job(Vec::new());
        let now = Utc::now();

        let a = engine.cycle_at("cam-a", &job, now);
        let b = engine.cycle_at("cam-b", &job, now);
        assert_ne!(a[0].object_id, b[0].object_id);
        assert_eq!(engine.live_tracks("cam-a"), 1);
        assert_eq!(engine.live_tracks("cam-b"), 1);

        engine.forget_camera("cam-a");
        assert_eq!(engine.live_tracks("cam-a"), 0);
    }

    #[test]
    fn test_ingested_feed_is_bounded() {
        let feed = IngestedFeed::new(2);
        for i in 0..3 {
            feed.push("cam-1", raw("person", 0.5 + i as f64 / 10.0, None, inside()));
        }
        assert_eq!(feed.pending("cam-1"), 2);

        let drained = feed.drain("cam-1", 10);
        assert_eq!(drained.len(), 2);
        assert!((drained[0].confidence - 0.6).abs() < 1e-9);
        assert_eq!(feed.pending("cam-1"), 0);
    }
}
