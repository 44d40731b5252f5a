//! Scripted sources for exercising sessions without a camera.
//!
//! Each camera gets a queue of read steps; once it is exhausted the source
//! keeps producing frames. Open failures can be injected per camera, and the
//! connector counts live sources so tests can assert that sessions release
//! them.

use crate::source::{Frame, FrameSource, SourceConnector, SourceError};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// Outcome of one scripted read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStep {
    Frame,
    Fail,
    /// Never completes. Stays at the front of the script, so every later
    /// read hangs as well.
    Hang,
}

#[derive(Default)]
struct ScriptState {
    open_failures: HashMap<String, u32>,
    scripts: HashMap<String, VecDeque<ReadStep>>,
    opens: HashMap<String, u32>,
    live: usize,
}

#[derive(Clone)]
pub struct ScriptedConnector {
    state: Arc<Mutex<ScriptState>>,
    frame_interval: Duration,
}

impl Default for ScriptedConnector {
    fn default() -> Self {
        Self::new(Duration::from_millis(5))
    }
}

impl ScriptedConnector {
    pub fn new(frame_interval: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(ScriptState::default())),
            frame_interval,
        }
    }

    /// Fail the next `count` opens for a camera
    pub fn fail_opens(&self, camera_id: &str, count: u32) {
        self.state
            .lock()
            .open_failures
            .insert(camera_id.to_string(), count);
    }

    /// Queue read outcomes for a camera's next source
    pub fn script(&self, camera_id: &str, steps: impl IntoIterator<Item = ReadStep>) {
        self.state
            .lock()
            .scripts
            .entry(camera_id.to_string())
            .or_default()
            .extend(steps);
    }

    /// Successful and failed open attempts for a camera
    pub fn open_attempts(&self, camera_id: &str) -> u32 {
        self.state.lock().opens.get(camera_id).copied().unwrap_or(0)
    }

    /// Sources currently alive
    pub fn live_sources(&self) -> usize {
        self.state.lock().live
    }
}

#[async_trait]
impl SourceConnector for ScriptedConnector {
    async fn open(&self, camera_id: &str, source: &str) -> Result<Box<dyn FrameSource>, SourceError> {
        let mut state = self.state.lock();
        *state.opens.entry(camera_id.to_string()).or_insert(0) += 1;

        if let Some(remaining) = state.open_failures.get_mut(camera_id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(SourceError::Unavailable(format!("scripted open failure for {source}")));
            }
        }

        state.live += 1;
        Ok(Box::new(ScriptedSource {
            camera_id: camera_id.to_string(),
            descriptor: source.to_string(),
            state: Arc::clone(&self.state),
            frame_interval: self.frame_interval,
            sequence: 0,
        }))
    }
}

pub struct ScriptedSource {
    camera_id: String,
    descriptor: String,
    state: Arc<Mutex<ScriptState>>,
    frame_interval: Duration,
    sequence: u64,
}

impl ScriptedSource {
    fn next_step(&self) -> ReadStep {
        let mut state = self.state.lock();
        let Some(script) = state.scripts.get_mut(&self.camera_id) else {
            return ReadStep::Frame;
        };
        match script.front() {
            Some(ReadStep::Hang) => ReadStep::Hang,
            _ => script.pop_front().unwrap_or(ReadStep::Frame),
        }
    }
}

#[async_trait]
impl FrameSource for ScriptedSource {
    async fn read_frame(&mut self) -> Result<Frame, SourceError> {
        // Wait before consuming a step so a cancelled read leaves the script intact.
        tokio::time::sleep(self.frame_interval).await;

        match self.next_step() {
            ReadStep::Frame => {
                let frame = Frame {
                    data: Bytes::from(format!("{}:{}", self.camera_id, self.sequence)),
                    sequence: self.sequence,
                    captured_at: Utc::now(),
                };
                self.sequence += 1;
                Ok(frame)
            }
            ReadStep::Fail => Err(SourceError::ReadFailed("scripted read failure".to_string())),
            ReadStep::Hang => std::future::pending().await,
        }
    }

    fn describe(&self) -> String {
        self.descriptor.clone()
    }
}

impl Drop for ScriptedSource {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.live = state.live.saturating_sub(1);
    }
}
