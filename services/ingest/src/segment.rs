//! Rolling HLS segment windows.
//!
//! Every tick of a connected session packages its buffered frames into a
//! segment artifact, appends it to the camera's window and rewrites the
//! media and master playlists. The window keeps the most recent K segments;
//! older ones are evicted and their artifacts deleted.
//!
//! Windows are tagged with the generation of the session that opened them,
//! so a session that has been replaced cannot publish into, or release, the
//! window of its successor. A finalized window accepts no more segments and
//! keeps its artifacts when released.

use crate::artifact::{ArtifactError, ArtifactStore};
use crate::config::SegmentConfig;
use crate::source::{Frame, PLACEHOLDER_PACKET};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const MEDIA_PLAYLIST: &str = "playlist.m3u8";
pub const MASTER_PLAYLIST: &str = "index.m3u8";

const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
const SEGMENT_CONTENT_TYPE: &str = "video/mp2t";
const PLACEHOLDER_REPEAT: usize = 1024;

#[derive(Error, Debug)]
pub enum SegmentError {
    #[error("No segment window for camera {0}")]
    NoWindow(String),

    /// The window was released or reopened by a newer session
    #[error("Segment window for camera {0} was superseded")]
    Superseded(String),

    #[error("Segment window for camera {0} is finalized")]
    Finalized(String),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

/// One published segment
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Segment {
    pub sequence: u64,
    /// Duration in seconds
    pub duration: f64,
    /// Artifact key, `{camera_id}/segment_{sequence:06}.ts`
    pub key: String,
    pub created_at: DateTime<Utc>,
}

impl Segment {
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

pub fn segment_key(camera_id: &str, sequence: u64) -> String {
    format!("{camera_id}/segment_{sequence:06}.ts")
}

fn playlist_key(camera_id: &str, name: &str) -> String {
    format!("{camera_id}/{name}")
}

/// Render a media playlist. `ended` appends `#EXT-X-ENDLIST`.
pub fn render_media_playlist(segments: &[Segment], target_duration: u64, version: u32, ended: bool) -> String {
    let media_sequence = segments.first().map(|s| s.sequence).unwrap_or(0);
    let longest = segments
        .iter()
        .map(|s| s.duration.ceil() as u64)
        .max()
        .unwrap_or(0);

    let mut out = String::new();
    let _ = writeln!(out, "#EXTM3U");
    let _ = writeln!(out, "#EXT-X-VERSION:{version}");
    let _ = writeln!(out, "#EXT-X-TARGETDURATION:{}", target_duration.max(longest));
    let _ = writeln!(out, "#EXT-X-MEDIA-SEQUENCE:{media_sequence}");
    for segment in segments {
        let _ = writeln!(out, "#EXTINF:{:.3},", segment.duration);
        let _ = writeln!(out, "{}", segment.file_name());
    }
    if ended {
        let _ = writeln!(out, "#EXT-X-ENDLIST");
    }
    out
}

pub fn render_master_playlist(bandwidth: u64, resolution: &str, version: u32) -> String {
    format!(
        "#EXTM3U\n#EXT-X-VERSION:{version}\n#EXT-X-STREAM-INF:BANDWIDTH={bandwidth},RESOLUTION={resolution}\n{MEDIA_PLAYLIST}\n"
    )
}

/// Segment payload: buffered frames back to back, or placeholder TS packets
/// when nothing was buffered.
fn build_payload(frames: &[Frame]) -> Bytes {
    if frames.is_empty() {
        return Bytes::from(PLACEHOLDER_PACKET.repeat(PLACEHOLDER_REPEAT));
    }
    let mut payload = BytesMut::with_capacity(frames.iter().map(|f| f.data.len()).sum());
    for frame in frames {
        payload.extend_from_slice(&frame.data);
    }
    payload.freeze()
}

struct Window {
    generation: Uuid,
    next_sequence: u64,
    segments: VecDeque<Segment>,
    finalized: bool,
}

impl Window {
    /// Artifacts owned by the window. None once finalized.
    fn keys(&self, camera_id: &str) -> Vec<String> {
        if self.finalized {
            return Vec::new();
        }
        let mut keys: Vec<String> = self.segments.iter().map(|s| s.key.clone()).collect();
        keys.push(playlist_key(camera_id, MEDIA_PLAYLIST));
        keys.push(playlist_key(camera_id, MASTER_PLAYLIST));
        keys
    }
}

pub struct SegmentPublisher {
    config: SegmentConfig,
    store: Arc<dyn ArtifactStore>,
    windows: Mutex<HashMap<String, Window>>,
}

impl SegmentPublisher {
    pub fn new(config: SegmentConfig, store: Arc<dyn ArtifactStore>) -> Self {
        Self {
            config,
            store,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SegmentConfig {
        &self.config
    }

    /// Start an empty window for a session. A window left behind by an
    /// earlier session of the same camera is replaced and, unless it was
    /// finalized, its artifacts deleted.
    pub async fn open_window(&self, camera_id: &str, generation: Uuid) {
        let replaced = self.windows.lock().insert(
            camera_id.to_string(),
            Window {
                generation,
                next_sequence: 0,
                segments: VecDeque::new(),
                finalized: false,
            },
        );

        if let Some(old) = replaced {
            debug!(camera_id, stale = %old.generation, finalized = old.finalized, "Replacing segment window");
            let keys: Vec<String> = old.segments.iter().map(|s| s.key.clone()).collect();
            if !old.finalized {
                self.delete_keys(camera_id, &keys).await;
            }
        }
    }

    /// Package frames into the next segment of a camera's window.
    pub async fn publish_tick(
        &self,
        camera_id: &str,
        generation: Uuid,
        frames: &[Frame],
    ) -> Result<Segment, SegmentError> {
        let sequence = {
            let mut windows = self.windows.lock();
            let window = windows
                .get_mut(camera_id)
                .ok_or_else(|| SegmentError::NoWindow(camera_id.to_string()))?;
            if window.generation != generation {
                return Err(SegmentError::Superseded(camera_id.to_string()));
            }
            if window.finalized {
                return Err(SegmentError::Finalized(camera_id.to_string()));
            }
            let sequence = window.next_sequence;
            window.next_sequence += 1;
            sequence
        };

        let segment = Segment {
            sequence,
            duration: self.config.segment_duration_secs,
            key: segment_key(camera_id, sequence),
            created_at: Utc::now(),
        };

        self.store
            .put(&segment.key, build_payload(frames), SEGMENT_CONTENT_TYPE)
            .await?;

        let rotated = {
            let mut windows = self.windows.lock();
            match windows.get_mut(camera_id) {
                Some(window) if window.generation == generation && !window.finalized => {
                    window.segments.push_back(segment.clone());
                    let mut evicted = Vec::new();
                    while window.segments.len() > self.config.window_size.max(1) {
                        if let Some(old) = window.segments.pop_front() {
                            evicted.push(old.key);
                        }
                    }
                    let media = render_media_playlist(
                        window.segments.make_contiguous(),
                        self.config.target_duration_secs,
                        self.config.playlist_version,
                        false,
                    );
                    Some((evicted, media))
                }
                _ => None,
            }
        };

        let Some((evicted, media)) = rotated else {
            self.delete_keys(camera_id, std::slice::from_ref(&segment.key)).await;
            return Err(SegmentError::Superseded(camera_id.to_string()));
        };

        self.write_playlists(camera_id, media).await?;
        self.delete_keys(camera_id, &evicted).await;

        metrics::counter!("vigil.segments.published").increment(1);
        metrics::counter!("vigil.segments.evicted").increment(evicted.len() as u64);
        debug!(camera_id, sequence, evicted = evicted.len(), "Segment published");

        Ok(segment)
    }

    async fn write_playlists(&self, camera_id: &str, media: String) -> Result<(), ArtifactError> {
        let master = render_master_playlist(
            self.config.bandwidth,
            &self.config.resolution,
            self.config.playlist_version,
        );
        self.store
            .put(&playlist_key(camera_id, MEDIA_PLAYLIST), Bytes::from(media), PLAYLIST_CONTENT_TYPE)
            .await?;
        self.store
            .put(&playlist_key(camera_id, MASTER_PLAYLIST), Bytes::from(master), PLAYLIST_CONTENT_TYPE)
            .await
    }

    /// Retained segments of a camera, oldest first
    pub fn playlist(&self, camera_id: &str) -> Vec<Segment> {
        self.windows
            .lock()
            .get(camera_id)
            .map(|w| w.segments.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn retained(&self, camera_id: &str) -> usize {
        self.windows
            .lock()
            .get(camera_id)
            .map(|w| w.segments.len())
            .unwrap_or(0)
    }

    /// Current media playlist text, if the camera has a window
    pub fn media_playlist(&self, camera_id: &str) -> Option<String> {
        self.windows.lock().get_mut(camera_id).map(|w| {
            render_media_playlist(
                w.segments.make_contiguous(),
                self.config.target_duration_secs,
                self.config.playlist_version,
                false,
            )
        })
    }

    /// Mark a camera's window as ended and render its final media playlist.
    /// Later ticks fail with [`SegmentError::Finalized`] and releasing the
    /// window leaves its artifacts in place. None when there is no window.
    pub fn seal(&self, camera_id: &str) -> Option<String> {
        let mut windows = self.windows.lock();
        let window = windows.get_mut(camera_id)?;
        window.finalized = true;
        Some(render_media_playlist(
            window.segments.make_contiguous(),
            self.config.target_duration_secs,
            self.config.playlist_version,
            true,
        ))
    }

    /// Write the playlists of a sealed window
    pub async fn write_sealed(&self, camera_id: &str, media: String) -> Result<(), ArtifactError> {
        self.write_playlists(camera_id, media).await?;
        info!(camera_id, "Playlist finalized");
        Ok(())
    }

    /// Seal a window and write its playlists with an end marker. Artifacts
    /// are kept. Returns false when the camera has no window.
    pub async fn finalize(&self, camera_id: &str) -> Result<bool, ArtifactError> {
        let Some(media) = self.seal(camera_id) else {
            return Ok(false);
        };
        self.write_sealed(camera_id, media).await?;
        Ok(true)
    }

    pub fn is_finalized(&self, camera_id: &str) -> bool {
        self.windows
            .lock()
            .get(camera_id)
            .map(|w| w.finalized)
            .unwrap_or(false)
    }

    /// Remove a session's window without touching storage. Returns the keys
    /// the caller must delete (none for a finalized window), or None if the
    /// window belongs to another session or is already gone.
    pub fn detach(&self, camera_id: &str, generation: Uuid) -> Option<Vec<String>> {
        let mut windows = self.windows.lock();
        if windows.get(camera_id).map(|w| w.generation) != Some(generation) {
            return None;
        }
        windows.remove(camera_id).map(|w| w.keys(camera_id))
    }

    /// Remove a session's window and delete its segments and playlists.
    /// Returns the number of artifacts deleted.
    pub async fn release(&self, camera_id: &str, generation: Uuid) -> usize {
        match self.detach(camera_id, generation) {
            Some(keys) => {
                self.delete_keys(camera_id, &keys).await;
                keys.len()
            }
            None => 0,
        }
    }

    /// Best-effort deletion; failures leave an orphaned artifact behind.
    pub async fn delete_keys(&self, camera_id: &str, keys: &[String]) {
        for key in keys {
            if let Err(e) = self.store.delete(key).await {
                warn!(camera_id, key = %key, error = %e, "Failed to delete artifact");
            }
        }
    }
}
