//! Frame sources.
//!
//! A [`SourceConnector`] opens a [`FrameSource`] for a camera from a source
//! descriptor (usually a URL). Sources release whatever they hold when
//! dropped, so a session can rely on scope exit for cleanup.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, Interval, MissedTickBehavior};

/// Errors that can occur while opening or reading a source.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SourceError {
    #[error("Source unavailable: {0}")]
    Unavailable(String),

    #[error("Frame read failed: {0}")]
    ReadFailed(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Source closed")]
    Closed,

    #[error("Unsupported source: {0}")]
    Unsupported(String),
}

/// One encoded or raw frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub data: Bytes,
    /// Position within the source, starting at 0
    pub sequence: u64,
    pub captured_at: DateTime<Utc>,
}

#[async_trait]
pub trait FrameSource: Send {
    /// Wait for the next frame. Must be cancel safe: dropping the future
    /// before it completes loses no frame.
    async fn read_frame(&mut self) -> Result<Frame, SourceError>;

    /// Human-readable description for status reports
    fn describe(&self) -> String;
}

#[async_trait]
pub trait SourceConnector: Send + Sync {
    async fn open(&self, camera_id: &str, source: &str) -> Result<Box<dyn FrameSource>, SourceError>;
}

/// TS packet header repeated to form a placeholder payload.
pub const PLACEHOLDER_PACKET: [u8; 4] = [0x47, 0x40, 0x00, 0x10];

/// Source producing placeholder frames at a fixed rate. Stands in for a
/// camera when no decode path is available (`synthetic://` URLs).
pub struct SyntheticSource {
    camera_id: String,
    ticker: Interval,
    sequence: u64,
    frame: Bytes,
}

impl SyntheticSource {
    pub fn new(camera_id: &str, fps: u32) -> Self {
        let period = Duration::from_secs_f64(1.0 / f64::from(fps.max(1)));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            camera_id: camera_id.to_string(),
            ticker,
            sequence: 0,
            frame: Bytes::from(PLACEHOLDER_PACKET.repeat(47)),
        }
    }
}

#[async_trait]
impl FrameSource for SyntheticSource {
    async fn read_frame(&mut self) -> Result<Frame, SourceError> {
        self.ticker.tick().await;
        let frame = Frame {
            data: self.frame.clone(),
            sequence: self.sequence,
            captured_at: Utc::now(),
        };
        self.sequence += 1;
        Ok(frame)
    }

    fn describe(&self) -> String {
        format!("synthetic://{}", self.camera_id)
    }
}

/// Parse the frame rate of a `synthetic://name?fps=N` descriptor.
fn synthetic_fps(source: &str) -> u32 {
    source
        .split_once('?')
        .and_then(|(_, query)| {
            query
                .split('&')
                .filter_map(|pair| pair.split_once('='))
                .find(|(key, _)| *key == "fps")
                .and_then(|(_, value)| value.parse().ok())
        })
        .unwrap_or(10)
}

/// Connector dispatching on the descriptor scheme: `synthetic://` always,
/// `rtsp://`/`rtsps://` when built with the `rtsp` feature.
pub struct DefaultConnector {
    #[cfg(feature = "rtsp")]
    rtsp: crate::rtsp_source::RtspConnector,
}

impl DefaultConnector {
    #[cfg(feature = "rtsp")]
    pub fn new(rtsp: &crate::config::RtspConfig, connect_timeout: Duration) -> Result<Self, SourceError> {
        Ok(Self {
            rtsp: crate::rtsp_source::RtspConnector::new(rtsp.clone(), connect_timeout)?,
        })
    }

    #[cfg(not(feature = "rtsp"))]
    pub fn new(_rtsp: &crate::config::RtspConfig, _connect_timeout: Duration) -> Result<Self, SourceError> {
        Ok(Self {})
    }
}

#[async_trait]
impl SourceConnector for DefaultConnector {
    async fn open(&self, camera_id: &str, source: &str) -> Result<Box<dyn FrameSource>, SourceError> {
        if source.starts_with("synthetic://") {
            return Ok(Box::new(SyntheticSource::new(camera_id, synthetic_fps(source))));
        }

        if source.starts_with("rtsp://") || source.starts_with("rtsps://") {
            #[cfg(feature = "rtsp")]
            return self.rtsp.open(camera_id, source).await;

            #[cfg(not(feature = "rtsp"))]
            return Err(SourceError::Unsupported(format!(
                "{source} (built without the rtsp feature)"
            )));
        }

        Err(SourceError::Unsupported(source.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_synthetic_frames_are_sequenced() {
        let mut source = SyntheticSource::new("cam-1", 100);
        let first = source.read_frame().await.unwrap();
        let second = source.read_frame().await.unwrap();

        assert_eq!(first.sequence, 0);
        assert_eq!(second.sequence, 1);
        assert_eq!(&first.data[..4], &PLACEHOLDER_PACKET);
        assert_eq!(source.describe(), "synthetic://cam-1");
    }

    #[test]
    fn test_synthetic_fps_parsing() {
        assert_eq!(synthetic_fps("synthetic://cam?fps=25"), 25);
        assert_eq!(synthetic_fps("synthetic://cam?x=1&fps=5"), 5);
        assert_eq!(synthetic_fps("synthetic://cam"), 10);
        assert_eq!(synthetic_fps("synthetic://cam?fps=abc"), 10);
    }

    #[tokio::test]
    async fn test_unknown_scheme_is_unsupported() {
        let connector = DefaultConnector::new(&Default::default(), Duration::from_secs(1)).unwrap();
        let result = connector.open("cam-1", "http://cam/stream").await;
        assert!(matches!(result, Err(SourceError::Unsupported(_))));
    }
}
