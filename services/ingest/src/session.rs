//! Per-camera stream sessions.
//!
//! A session opens its source with bounded retries, then runs as one task
//! that reads frames, ticks the segment publisher and runs detection cycles.
//! Consecutive read failures up to the configured threshold degrade the
//! session, which tears it down and removes it from the active set.
//! Finalizing a session seals its playlist with an end marker before
//! stopping it, so its artifacts outlive the session.
//!
//! Cleanup is owned by the task. The async teardown deletes the segment
//! window and announces the final state; a [`SessionGuard`] held by the task
//! covers the paths where that never runs (abort, panic, a session dropped
//! before it was spawned).

use crate::artifact::ArtifactError;
use crate::config::SessionConfig;
use crate::segment::{SegmentError, SegmentPublisher};
use crate::source::{Frame, FrameSource, SourceConnector, SourceError};
use backoff::backoff::{Backoff, Constant};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;
use vigil_analytics::config::clamp_rate;
use vigil_analytics::{
    DetectionBackend, DetectionConfig, DetectionEngine, DetectionMode, EntityStore, EventPublisher,
    IngestedBackend, IngestedFeed, ObjectCount, SimulatedBackend, StreamStatusUpdate,
};

const MAX_CAMERA_ID_LEN: usize = 128;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("Invalid camera id: {0:?}")]
    InvalidCameraId(String),

    #[error(transparent)]
    Source(#[from] SourceError),

    /// The session was stopped while it was still connecting
    #[error("Session cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Degraded,
    Stopped,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Degraded => "degraded",
            SessionState::Stopped => "stopped",
        }
    }

    fn is_live(&self) -> bool {
        matches!(
            self,
            SessionState::Idle | SessionState::Connecting | SessionState::Connected
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyActive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    NotFound,
}

/// Point-in-time view of a session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamStatus {
    pub camera_id: String,
    pub state: SessionState,
    pub source: String,
    pub frame_count: u64,
    pub segment_count: u64,
    pub error_count: u32,
    pub retained_segments: usize,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Counters {
    state: SessionState,
    frame_count: u64,
    segment_count: u64,
    error_count: u32,
    last_activity: DateTime<Utc>,
}

/// State shared between a session task and status readers. The detection
/// engine lives here so counters and rate can be adjusted while the task
/// runs; the lock is never held across an await.
struct SessionShared {
    camera_id: String,
    source: String,
    generation: Uuid,
    created_at: DateTime<Utc>,
    counters: Mutex<Counters>,
    engine: Mutex<DetectionEngine>,
}

impl SessionShared {
    fn new(camera_id: &str, source: &str, engine: DetectionEngine) -> Self {
        let now = Utc::now();
        Self {
            camera_id: camera_id.to_string(),
            source: source.to_string(),
            generation: Uuid::new_v4(),
            created_at: now,
            engine: Mutex::new(engine),
            counters: Mutex::new(Counters {
                state: SessionState::Idle,
                frame_count: 0,
                segment_count: 0,
                error_count: 0,
                last_activity: now,
            }),
        }
    }

    fn state(&self) -> SessionState {
        self.counters.lock().state
    }

    fn set_state(&self, state: SessionState) {
        let mut counters = self.counters.lock();
        debug!(camera_id = %self.camera_id, from = %counters.state, to = %state, "Session state change");
        counters.state = state;
        counters.last_activity = Utc::now();
    }

    fn status(&self, retained_segments: usize) -> StreamStatus {
        let counters = self.counters.lock().clone();
        StreamStatus {
            camera_id: self.camera_id.clone(),
            state: counters.state,
            source: self.source.clone(),
            frame_count: counters.frame_count,
            segment_count: counters.segment_count,
            error_count: counters.error_count,
            retained_segments,
            created_at: self.created_at,
            last_activity: counters.last_activity,
        }
    }

    fn status_update(&self) -> StreamStatusUpdate {
        let counters = self.counters.lock();
        StreamStatusUpdate {
            camera_id: self.camera_id.clone(),
            state: counters.state.as_str().to_string(),
            frame_count: counters.frame_count,
            error_count: counters.error_count,
        }
    }
}

struct SessionEntry {
    shared: Arc<SessionShared>,
    cancel: CancellationToken,
    /// None until the source is open and the task spawned
    handle: Option<JoinHandle<()>>,
}

type SessionMap = Arc<Mutex<HashMap<String, SessionEntry>>>;

fn record_active(sessions: &HashMap<String, SessionEntry>) {
    metrics::gauge!("vigil.sessions.active").set(sessions.len() as f64);
}

/// Camera ids become artifact path components
fn validate_camera_id(camera_id: &str) -> Result<(), SessionError> {
    let valid = !camera_id.is_empty()
        && camera_id.len() <= MAX_CAMERA_ID_LEN
        && camera_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(SessionError::InvalidCameraId(camera_id.to_string()))
    }
}

pub struct SessionManager {
    config: SessionConfig,
    detection: RwLock<DetectionConfig>,
    connector: Arc<dyn SourceConnector>,
    publisher: Arc<SegmentPublisher>,
    events: EventPublisher,
    store: Arc<dyn EntityStore>,
    feed: IngestedFeed,
    sessions: SessionMap,
}

impl SessionManager {
    pub fn new(
        config: SessionConfig,
        detection: DetectionConfig,
        connector: Arc<dyn SourceConnector>,
        publisher: Arc<SegmentPublisher>,
        events: EventPublisher,
        store: Arc<dyn EntityStore>,
        feed: IngestedFeed,
    ) -> Self {
        Self {
            config,
            detection: RwLock::new(detection),
            connector,
            publisher,
            events,
            store,
            feed,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start a session for a camera. Returns `AlreadyActive` without side
    /// effects when a live session exists; an error means the source could
    /// not be opened and nothing was retained.
    #[instrument(skip(self))]
    pub async fn start(&self, camera_id: &str, source: &str) -> Result<StartOutcome, SessionError> {
        validate_camera_id(camera_id)?;

        let shared = Arc::new(SessionShared::new(camera_id, source, self.engine()));
        let cancel = CancellationToken::new();
        {
            let mut sessions = self.sessions.lock();
            if let Some(existing) = sessions.get(camera_id) {
                if existing.shared.state().is_live() {
                    debug!("Session already active");
                    return Ok(StartOutcome::AlreadyActive);
                }
                // Still tearing down; let it finish in the background.
                if let Some(old) = sessions.remove(camera_id) {
                    old.cancel.cancel();
                }
            }
            shared.set_state(SessionState::Connecting);
            sessions.insert(
                camera_id.to_string(),
                SessionEntry {
                    shared: Arc::clone(&shared),
                    cancel: cancel.clone(),
                    handle: None,
                },
            );
            record_active(&sessions);
        }

        let source = match self.connect(&shared, &cancel).await {
            Ok(source) => source,
            Err(e) => {
                self.remove_if_current(camera_id, shared.generation);
                metrics::counter!("vigil.sessions.failed").increment(1);
                return Err(e);
            }
        };

        self.publisher.open_window(camera_id, shared.generation).await;
        {
            let mut counters = shared.counters.lock();
            counters.state = SessionState::Connected;
            counters.last_activity = Utc::now();
        }

        let mut task = Some(self.session_task(Arc::clone(&shared), source, cancel));
        {
            let mut sessions = self.sessions.lock();
            if let Some(entry) = sessions.get_mut(camera_id) {
                if entry.shared.generation == shared.generation {
                    entry.handle = task.take().map(|task| tokio::spawn(task.run()));
                }
            }
        }
        if task.is_some() {
            // Stopped while connecting; dropping the task releases the source
            // and the window through its guard.
            debug!("Session stopped before it started");
            return Err(SessionError::Cancelled);
        }

        metrics::counter!("vigil.sessions.started").increment(1);
        info!(source = %shared.source, "Stream session started");

        Ok(StartOutcome::Started)
    }

    /// Open the source, retrying with a fixed delay. Unsupported sources
    /// fail without retrying.
    async fn connect(
        &self,
        shared: &SessionShared,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn FrameSource>, SessionError> {
        let attempts = self.config.connect_attempts.max(1);
        let connect_timeout = self.config.connect_timeout();
        let mut backoff = Constant::new(self.config.connect_delay());
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let opened = tokio::select! {
                _ = cancel.cancelled() => return Err(SessionError::Cancelled),
                result = tokio::time::timeout(
                    connect_timeout,
                    self.connector.open(&shared.camera_id, &shared.source),
                ) => result.unwrap_or_else(|_| Err(SourceError::Timeout(connect_timeout))),
            };

            match opened {
                Ok(source) => {
                    info!(attempt, source = %source.describe(), "Source opened");
                    return Ok(source);
                }
                Err(e @ SourceError::Unsupported(_)) => {
                    error!(error = %e, "Unsupported source");
                    return Err(e.into());
                }
                Err(e) if attempt >= attempts => {
                    error!(attempts = attempt, error = %e, "Failed to open source");
                    return Err(e.into());
                }
                Err(e) => {
                    let delay = backoff
                        .next_backoff()
                        .unwrap_or_else(|| self.config.connect_delay());
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Source open failed, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(SessionError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    fn engine(&self) -> DetectionEngine {
        let detection = self.detection.read().clone();
        let backend: Box<dyn DetectionBackend> = match detection.mode {
            DetectionMode::Simulated => Box::new(SimulatedBackend::new(&detection)),
            DetectionMode::Ingested => Box::new(IngestedBackend::new(self.feed.clone())),
        };
        DetectionEngine::new(detection, backend)
    }

    fn session_task(
        &self,
        shared: Arc<SessionShared>,
        source: Box<dyn FrameSource>,
        cancel: CancellationToken,
    ) -> SessionTask {
        let guard = SessionGuard {
            sessions: Arc::clone(&self.sessions),
            publisher: Arc::clone(&self.publisher),
            camera_id: shared.camera_id.clone(),
            generation: shared.generation,
        };
        SessionTask {
            runtime: SessionRuntime {
                shared,
                buffer: VecDeque::with_capacity(self.config.frame_buffer_size),
                buffer_limit: self.config.frame_buffer_size.max(1),
                error_threshold: self.config.error_threshold.max(1),
                publisher: Arc::clone(&self.publisher),
                events: self.events.clone(),
                store: Arc::clone(&self.store),
                feed: self.feed.clone(),
            },
            source,
            cancel,
            read_timeout: self.config.read_timeout(),
            segment_interval: self.publisher.config().segment_interval(),
            detection_interval: self.detection.read().cycle_interval(),
            guard,
        }
    }

    fn remove_if_current(&self, camera_id: &str, generation: Uuid) {
        let mut sessions = self.sessions.lock();
        if sessions.get(camera_id).map(|e| e.shared.generation) == Some(generation) {
            sessions.remove(camera_id);
            record_active(&sessions);
        }
    }

    /// Stop a session and wait for its teardown. A task that does not finish
    /// within the stop timeout is aborted; its guard still releases the
    /// session's resources.
    #[instrument(skip(self))]
    pub async fn stop(&self, camera_id: &str) -> StopOutcome {
        let entry = {
            let mut sessions = self.sessions.lock();
            let entry = sessions.remove(camera_id);
            record_active(&sessions);
            entry
        };
        let Some(entry) = entry else {
            return StopOutcome::NotFound;
        };

        entry.cancel.cancel();
        if let Some(mut handle) = entry.handle {
            let stop_timeout = self.config.stop_timeout();
            if tokio::time::timeout(stop_timeout, &mut handle).await.is_err() {
                warn!(timeout_ms = stop_timeout.as_millis() as u64, "Session did not stop in time, aborting");
                handle.abort();
            }
        }

        info!("Stream session stopped");
        StopOutcome::Stopped
    }

    /// End a camera's stream while keeping its artifacts: the playlist is
    /// sealed with an end marker, then the session is stopped. Returns false
    /// when the camera has no segment window.
    #[instrument(skip(self))]
    pub async fn finalize(&self, camera_id: &str) -> Result<bool, ArtifactError> {
        let Some(media) = self.publisher.seal(camera_id) else {
            debug!("No segment window to finalize");
            return Ok(false);
        };
        let stopped = self.stop(camera_id).await;

        // Written after the task is gone so no in-flight tick can overwrite it
        self.publisher.write_sealed(camera_id, media).await?;
        info!(session_stopped = stopped == StopOutcome::Stopped, "Stream finalized");
        Ok(true)
    }

    fn shared_sessions(&self) -> Vec<Arc<SessionShared>> {
        self.sessions
            .lock()
            .values()
            .map(|entry| Arc::clone(&entry.shared))
            .collect()
    }

    fn shared_session(&self, camera_id: &str) -> Option<Arc<SessionShared>> {
        self.sessions
            .lock()
            .get(camera_id)
            .map(|entry| Arc::clone(&entry.shared))
    }

    /// Per-class object counts of a live session
    pub fn current_counts(&self, camera_id: &str) -> Option<Vec<ObjectCount>> {
        let shared = self.shared_session(camera_id)?;
        let counts = shared.engine.lock().current_counts(camera_id);
        Some(counts)
    }

    /// Reset the object counters of one camera, or of every session when
    /// `camera_id` is None. Returns how many sessions were reset.
    pub fn reset_counters(&self, camera_id: Option<&str>) -> usize {
        let targets = match camera_id {
            Some(id) => self.shared_session(id).into_iter().collect(),
            None => self.shared_sessions(),
        };
        for shared in &targets {
            shared.engine.lock().reset_counters(Some(&shared.camera_id));
        }
        info!(camera_id = camera_id.unwrap_or("all"), sessions = targets.len(), "Object counters reset");
        targets.len()
    }

    /// Change the detection rate of running sessions and of sessions started
    /// later. Returns the rate applied after clamping.
    pub fn set_detection_rate(&self, rate: f64) -> f64 {
        let rate = clamp_rate(rate);
        self.detection.write().detection_rate = rate;
        for shared in self.shared_sessions() {
            shared.engine.lock().set_detection_rate(rate);
        }
        info!(rate, "Detection rate updated");
        rate
    }

    pub fn detection_rate(&self) -> f64 {
        self.detection.read().clamped_rate()
    }

    pub fn status(&self, camera_id: &str) -> Option<StreamStatus> {
        let shared = self.shared_session(camera_id)?;
        Some(shared.status(self.publisher.retained(camera_id)))
    }

    /// Status of every session, ordered by camera id
    pub fn list_active(&self) -> Vec<StreamStatus> {
        let mut statuses: Vec<StreamStatus> = self
            .shared_sessions()
            .iter()
            .map(|s| s.status(self.publisher.retained(&s.camera_id)))
            .collect();
        statuses.sort_by(|a, b| a.camera_id.cmp(&b.camera_id));
        statuses
    }

    pub fn active_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Stop every session. Returns how many were stopped.
    pub async fn shutdown(&self) -> usize {
        let camera_ids: Vec<String> = self.sessions.lock().keys().cloned().collect();
        let outcomes =
            futures::future::join_all(camera_ids.iter().map(|camera_id| self.stop(camera_id))).await;
        let stopped = outcomes
            .iter()
            .filter(|outcome| **outcome == StopOutcome::Stopped)
            .count();
        info!(stopped, "All stream sessions stopped");
        stopped
    }
}

/// Releases a session's entry and window when its task goes away without
/// running the async teardown.
struct SessionGuard {
    sessions: SessionMap,
    publisher: Arc<SegmentPublisher>,
    camera_id: String,
    generation: Uuid,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        {
            let mut sessions = self.sessions.lock();
            if sessions.get(&self.camera_id).map(|e| e.shared.generation) == Some(self.generation) {
                sessions.remove(&self.camera_id);
                record_active(&sessions);
            }
        }

        let Some(keys) = self.publisher.detach(&self.camera_id, self.generation) else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let publisher = Arc::clone(&self.publisher);
                let camera_id = self.camera_id.clone();
                handle.spawn(async move { publisher.delete_keys(&camera_id, &keys).await });
            }
            Err(_) => {
                warn!(camera_id = %self.camera_id, artifacts = keys.len(), "No runtime to delete artifacts");
            }
        }
    }
}

enum Exit {
    Cancelled,
    Degraded,
}

/// Session state owned by the task, apart from the source
struct SessionRuntime {
    shared: Arc<SessionShared>,
    buffer: VecDeque<Frame>,
    buffer_limit: usize,
    error_threshold: u32,
    publisher: Arc<SegmentPublisher>,
    events: EventPublisher,
    store: Arc<dyn EntityStore>,
    feed: IngestedFeed,
}

impl SessionRuntime {
    fn camera_id(&self) -> &str {
        &self.shared.camera_id
    }

    /// Record a read result. True when the error threshold is reached.
    fn on_read(&mut self, read: Result<Frame, SourceError>) -> bool {
        match read {
            Ok(frame) => {
                {
                    let mut counters = self.shared.counters.lock();
                    counters.frame_count += 1;
                    counters.error_count = 0;
                    counters.last_activity = Utc::now();
                }
                if self.buffer.len() >= self.buffer_limit {
                    self.buffer.pop_front();
                }
                self.buffer.push_back(frame);
                metrics::counter!("vigil.frames.read").increment(1);
                false
            }
            Err(e) => {
                let errors = {
                    let mut counters = self.shared.counters.lock();
                    counters.error_count += 1;
                    counters.error_count
                };
                metrics::counter!("vigil.frames.read_errors").increment(1);
                warn!(
                    camera_id = %self.camera_id(),
                    error = %e,
                    consecutive = errors,
                    threshold = self.error_threshold,
                    "Frame read failed"
                );
                errors >= self.error_threshold
            }
        }
    }

    async fn publish_segment(&mut self) {
        if self.shared.state() != SessionState::Connected {
            return;
        }
        let frames: Vec<Frame> = self.buffer.drain(..).collect();
        match self
            .publisher
            .publish_tick(&self.shared.camera_id, self.shared.generation, &frames)
            .await
        {
            Ok(segment) => {
                self.shared.counters.lock().segment_count += 1;
                trace!(camera_id = %self.camera_id(), sequence = segment.sequence, frames = frames.len(), "Segment tick");
            }
            Err(SegmentError::Finalized(_)) => {
                trace!(camera_id = %self.camera_id(), "Window finalized, segment skipped");
            }
            Err(e) => {
                warn!(camera_id = %self.camera_id(), error = %e, "Segment publish failed");
            }
        }
    }

    async fn detect(&mut self) {
        let camera_id = self.shared.camera_id.clone();
        let job = match self.store.active_job_for_camera(&camera_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                trace!(camera_id = %camera_id, "No active analytics job");
                return;
            }
            Err(e) => {
                warn!(camera_id = %camera_id, error = %e, "Failed to load analytics job");
                return;
            }
        };

        let (events, counts) = {
            let mut engine = self.shared.engine.lock();
            let events = engine.cycle(&camera_id, &job);
            let counts = engine
                .counts_due(&camera_id)
                .then(|| engine.current_counts(&camera_id));
            (events, counts)
        };
        metrics::counter!("vigil.detections.emitted").increment(events.len() as u64);
        self.events.publish_cycle(&job, &events).await;

        if let Some(counts) = counts {
            self.events.publish_counts(&camera_id, &counts).await;
        }
    }

    async fn teardown(&mut self) {
        self.buffer.clear();
        let camera_id = self.shared.camera_id.clone();
        self.shared.engine.lock().forget_camera(&camera_id);
        self.feed.clear(&camera_id);
        let released = self.publisher.release(&camera_id, self.shared.generation).await;

        self.shared.set_state(SessionState::Stopped);
        self.events.publish_stream_status(&self.shared.status_update()).await;
        info!(camera_id = %camera_id, released, "Session torn down");
    }
}

struct SessionTask {
    runtime: SessionRuntime,
    source: Box<dyn FrameSource>,
    cancel: CancellationToken,
    read_timeout: Duration,
    segment_interval: Duration,
    detection_interval: Duration,
    guard: SessionGuard,
}

impl SessionTask {
    async fn run(self) {
        let SessionTask {
            mut runtime,
            mut source,
            cancel,
            read_timeout,
            segment_interval,
            detection_interval,
            guard,
        } = self;

        runtime
            .events
            .publish_stream_status(&runtime.shared.status_update())
            .await;

        let start = Instant::now();
        let mut segment_tick = tokio::time::interval_at(start + segment_interval, segment_interval);
        segment_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut detection_tick = tokio::time::interval_at(start + detection_interval, detection_interval);
        detection_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Ticks must not push the read deadline back, so it only moves when
        // a read completes.
        let mut read_deadline = start + read_timeout;

        let exit = loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break Exit::Cancelled,
                _ = segment_tick.tick() => runtime.publish_segment().await,
                _ = detection_tick.tick() => runtime.detect().await,
                read = tokio::time::timeout_at(read_deadline, source.read_frame()) => {
                    read_deadline = Instant::now() + read_timeout;
                    let read = read.unwrap_or_else(|_| Err(SourceError::Timeout(read_timeout)));
                    if runtime.on_read(read) {
                        break Exit::Degraded;
                    }
                }
            }
        };

        match exit {
            Exit::Degraded => {
                runtime.shared.set_state(SessionState::Degraded);
                metrics::counter!("vigil.sessions.degraded").increment(1);
                error!(
                    camera_id = %runtime.camera_id(),
                    threshold = runtime.error_threshold,
                    "Error threshold reached, tearing down session"
                );
                runtime
                    .events
                    .publish_stream_status(&runtime.shared.status_update())
                    .await;
            }
            Exit::Cancelled => debug!(camera_id = %runtime.camera_id(), "Session cancelled"),
        }

        drop(source);
        runtime.teardown().await;
        drop(guard);
    }
}
