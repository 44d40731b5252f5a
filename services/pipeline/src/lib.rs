//! Vigil Pipeline - message queue plumbing for camera analytics
//!
//! This library carries detection metadata between the external inference
//! pipeline and the analytics service. It provides:
//!
//! - The detection message wire format shared by producers and consumers
//! - Queue traits with ack/nack semantics and a bounded receive
//! - An in-process queue, and Kafka backends behind the `kafka` feature
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use vigil_pipeline::{MemoryQueue, MessagePublisher, MessageSource, OutgoingMessage};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), vigil_pipeline::QueueError> {
//!     let queue = MemoryQueue::new();
//!     let mut subscription = queue.subscribe("vigil.metadata.raw");
//!     subscription.connect().await?;
//!
//!     queue
//!         .publish(OutgoingMessage::new("vigil.metadata.raw", b"{}".to_vec()))
//!         .await?;
//!
//!     if let Some(message) = subscription.receive(Duration::from_secs(1)).await? {
//!         subscription.ack(&message).await?;
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
#[cfg(feature = "kafka")]
pub mod consumer;
pub mod message;
#[cfg(feature = "kafka")]
pub mod producer;
pub mod queue;

// Re-export main types
pub use config::{ConfigError, KafkaConfig, QueueBackend, QueueConfig, SaslConfig, SecurityProtocol, TopicConfig};
#[cfg(feature = "kafka")]
pub use consumer::KafkaSource;
pub use message::{BoundingBox, DetectionMessage, MessageError};
#[cfg(feature = "kafka")]
pub use producer::KafkaPublisher;
pub use queue::{
    IncomingMessage, MemoryQueue, MemorySubscription, MessageMetadata, MessagePublisher,
    MessageSource, OutgoingMessage, QueueError,
};
