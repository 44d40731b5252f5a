//! Vigil Ingest
//!
//! Camera stream sessions and their rolling HLS output, plus the service
//! wiring that ties sessions, detection and subscribers together.
//!
//! # Architecture
//!
//! ```text
//! SourceConnector -> FrameSource -> Session task ─┬─> SegmentPublisher -> ArtifactStore
//!                                                 └─> DetectionEngine  -> EventPublisher -> EventDistributor
//! ```
//!
//! Sources are opened from descriptors: `synthetic://` always, `rtsp://`
//! with the `rtsp` feature. Artifacts go to the filesystem, memory, or S3
//! with the `s3` feature.

pub mod artifact;
pub mod config;
pub mod context;
#[cfg(feature = "rtsp")]
pub mod rtsp_source;
pub mod scripted;
pub mod segment;
pub mod session;
pub mod source;

pub use artifact::{ArtifactError, ArtifactStore, FsArtifactStore, MemoryArtifactStore};
pub use config::VigilConfig;
pub use context::ServiceContext;
pub use segment::{Segment, SegmentError, SegmentPublisher};
pub use session::{SessionError, SessionManager, SessionState, StartOutcome, StopOutcome, StreamStatus};
pub use source::{DefaultConnector, Frame, FrameSource, SourceConnector, SourceError};
