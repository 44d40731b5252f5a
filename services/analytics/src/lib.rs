//! Vigil Analytics
//!
//! Detection and alerting core for the Vigil camera platform. Detections
//! arrive from a pluggable backend (simulated, or ingested from the
//! inference pipeline), are attributed to object tracks, evaluated against
//! ROI zones and fanned out to subscribers.
//!
//! ## Architecture
//!
//! ```text
//! Message Queue             Entity Store            Subscribers
//! ┌──────────────┐         ┌──────────────┐        ┌──────────────┐
//! │ metadata.raw │         │ cameras/jobs │        │ global       │
//! └──────────────┘         │ alerts       │        │ camera:{id}  │
//!        │                 └──────────────┘        │ user:{id}    │
//!        ▼                        ▲                └──────────────┘
//! ┌──────────────┐                │                       ▲
//! │ Metadata     │────────────────┘                       │
//! │ Ingest       │─────────┐                              │
//! └──────────────┘         ▼                              │
//!        │          ┌──────────────┐   ┌──────────────┐   │
//!        ▼          │ Detection    │──▶│ Event        │───┘
//! ┌────────────────┐│ Engine       │   │ Distributor  │
//! │ alerts.critical│└──────────────┘   └──────────────┘
//! └────────────────┘
//! ```

pub mod config;
pub mod detection;
pub mod distributor;
pub mod entity_store;
pub mod event_publisher;
pub mod metadata_ingest;
pub mod models;
#[cfg(feature = "postgres")]
pub mod pg_store;
pub mod roi;
pub mod simulator;
pub mod tracker;

pub use config::{
    ConfigValidationError, DatabaseConfig, DetectionConfig, DetectionMode, DistributorConfig,
};
pub use detection::{
    DetectionBackend, DetectionEngine, IngestedBackend, IngestedFeed, ObjectCount, RawDetection,
};
pub use distributor::{
    BroadcastReport, ChannelSink, ClientCommand, ConnectionId, ConnectionStats, DeliveryError,
    EventDistributor, EventKind, EventMessage, EventSink, Scope, StreamStatusUpdate,
};
pub use entity_store::{EntityStore, MemoryEntityStore, StoreError};
pub use event_publisher::EventPublisher;
pub use metadata_ingest::{Disposition, IngestError, MetadataIngestAdapter};
pub use models::{AlertRecord, AnalyticsJob, Camera, DetectionEvent, DetectionKind, Metadata};
#[cfg(feature = "postgres")]
pub use pg_store::PgEntityStore;
pub use roi::{point_in_polygon, GeometryError, Point, RoiZone};
pub use simulator::SimulatedBackend;
pub use tracker::{ObjectTrack, Resolution, TrackRegistry};
