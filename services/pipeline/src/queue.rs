//! Queue abstractions shared by the ingest adapter and its backends.
//!
//! [`MessageSource`] is the consuming side (receive with a bounded wait,
//! then ack or nack), [`MessagePublisher`] the producing side. The
//! [`MemoryQueue`] implements both in-process and is the default backend;
//! the Kafka implementations live behind the `kafka` feature.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

/// Errors raised by queue backends
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueueError {
    #[error("Failed to create client: {0}")]
    Creation(String),

    #[error("Failed to subscribe to topics: {0}")]
    Subscription(String),

    #[error("Connection to queue lost: {0}")]
    ConnectionLost(String),

    #[error("Queue client is not connected")]
    NotConnected,

    #[error("Receive failed: {0}")]
    Receive(String),

    #[error("Failed to settle message at offset {offset}: {message}")]
    Settle { offset: i64, message: String },

    #[error("Failed to serialize message: {0}")]
    Serialization(String),

    #[error("Failed to publish to topic {topic}: {message}")]
    Publish { topic: String, message: String },
}

impl QueueError {
    /// Whether the consumer has to reconnect before receiving again
    pub fn requires_reconnect(&self) -> bool {
        matches!(self, QueueError::ConnectionLost(_) | QueueError::NotConnected)
    }
}

/// Metadata about a received message
#[derive(Debug, Clone, PartialEq)]
pub struct MessageMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    /// Producer timestamp in milliseconds
    pub timestamp: Option<i64>,
    pub headers: HashMap<String, String>,
    /// How many times this message was handed out before
    pub redelivery_count: u32,
}

/// A received message with payload and metadata
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMessage {
    pub payload: Vec<u8>,
    pub metadata: MessageMetadata,
}

impl IncomingMessage {
    /// Get the message key as a string
    pub fn key_str(&self) -> Option<String> {
        self.metadata
            .key
            .as_ref()
            .and_then(|k| String::from_utf8(k.clone()).ok())
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.metadata.headers.get(key).map(|s| s.as_str())
    }

    pub fn message_type(&self) -> Option<&str> {
        self.header("message-type")
    }
}

/// Message to be published
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub topic: String,
    /// Optional message key for partitioning
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl OutgoingMessage {
    pub fn new(topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            payload,
            headers: Vec::new(),
        }
    }

    /// Create a new outgoing message with a JSON payload
    pub fn new_json<T: serde::Serialize>(
        topic: impl Into<String>,
        message: &T,
    ) -> Result<Self, QueueError> {
        let payload =
            serde_json::to_vec(message).map_err(|e| QueueError::Serialization(e.to_string()))?;
        Ok(Self::new(topic, payload))
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn with_message_type(self, msg_type: impl Into<String>) -> Self {
        self.with_header("message-type", msg_type)
    }
}

/// Consuming side of a queue
#[async_trait]
pub trait MessageSource: Send {
    /// (Re)establish the subscription
    async fn connect(&mut self) -> Result<(), QueueError>;

    /// Wait at most `timeout` for the next message. `Ok(None)` means the wait
    /// elapsed without a message.
    async fn receive(&mut self, timeout: Duration) -> Result<Option<IncomingMessage>, QueueError>;

    /// Settle a message as processed; it is never redelivered
    async fn ack(&mut self, message: &IncomingMessage) -> Result<(), QueueError>;

    /// Request redelivery of a message
    async fn nack(&mut self, message: &IncomingMessage) -> Result<(), QueueError>;
}

/// Producing side of a queue
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish(&self, message: OutgoingMessage) -> Result<(), QueueError>;
}

#[derive(Default)]
struct TopicLog {
    pending: VecDeque<IncomingMessage>,
    in_flight: HashMap<i64, IncomingMessage>,
    acked: Vec<i64>,
}

#[derive(Default)]
struct QueueState {
    topics: HashMap<String, TopicLog>,
    next_offset: i64,
    /// Receives that will fail with a connection loss before the queue recovers
    pending_disconnects: u32,
    publish_failures: u32,
}

#[derive(Default)]
struct Shared {
    state: Mutex<QueueState>,
    notify: Notify,
}

/// In-process queue with at-least-once semantics.
///
/// Cloning yields another handle to the same queue. Messages nacked by a
/// subscriber go back to the front of their topic and are handed out again
/// with an incremented redelivery count.
#[derive(Clone, Default)]
pub struct MemoryQueue {
    shared: Arc<Shared>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumer bound to one topic
    pub fn subscribe(&self, topic: impl Into<String>) -> MemorySubscription {
        MemorySubscription {
            queue: self.clone(),
            topic: topic.into(),
            connected: false,
        }
    }

    /// Make the next `count` receives fail as if the broker connection dropped
    pub fn inject_disconnects(&self, count: u32) {
        self.shared.state.lock().pending_disconnects += count;
        self.shared.notify.notify_waiters();
    }

    /// Make the next `count` publishes fail
    pub fn inject_publish_failures(&self, count: u32) {
        self.shared.state.lock().publish_failures += count;
    }

    /// Messages waiting to be received on a topic
    pub fn pending(&self, topic: &str) -> Vec<IncomingMessage> {
        self.shared
            .state
            .lock()
            .topics
            .get(topic)
            .map(|log| log.pending.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Messages handed out but not yet settled
    pub fn in_flight(&self, topic: &str) -> usize {
        self.shared
            .state
            .lock()
            .topics
            .get(topic)
            .map(|log| log.in_flight.len())
            .unwrap_or(0)
    }

    /// Offsets acknowledged on a topic, in settlement order
    pub fn acked(&self, topic: &str) -> Vec<i64> {
        self.shared
            .state
            .lock()
            .topics
            .get(topic)
            .map(|log| log.acked.clone())
            .unwrap_or_default()
    }

    fn take_next(&self, topic: &str) -> Result<Option<IncomingMessage>, QueueError> {
        let mut state = self.shared.state.lock();
        if state.pending_disconnects > 0 {
            state.pending_disconnects -= 1;
            return Err(QueueError::ConnectionLost("broker connection reset".to_string()));
        }

        let log = state.topics.entry(topic.to_string()).or_default();
        match log.pending.pop_front() {
            Some(message) => {
                log.in_flight.insert(message.metadata.offset, message.clone());
                Ok(Some(message))
            }
            None => Ok(None),
        }
    }

    fn settle(&self, message: &IncomingMessage, redeliver: bool) -> Result<(), QueueError> {
        let offset = message.metadata.offset;
        let mut state = self.shared.state.lock();
        let log = state
            .topics
            .get_mut(&message.metadata.topic)
            .ok_or_else(|| QueueError::Settle {
                offset,
                message: format!("unknown topic {}", message.metadata.topic),
            })?;
        let mut settled = log.in_flight.remove(&offset).ok_or_else(|| QueueError::Settle {
            offset,
            message: "message is not in flight".to_string(),
        })?;

        if redeliver {
            settled.metadata.redelivery_count += 1;
            log.pending.push_front(settled);
            drop(state);
            self.shared.notify.notify_waiters();
        } else {
            log.acked.push(offset);
        }
        Ok(())
    }
}

#[async_trait]
impl MessagePublisher for MemoryQueue {
    async fn publish(&self, message: OutgoingMessage) -> Result<(), QueueError> {
        {
            let mut state = self.shared.state.lock();
            if state.publish_failures > 0 {
                state.publish_failures -= 1;
                return Err(QueueError::Publish {
                    topic: message.topic,
                    message: "simulated publish failure".to_string(),
                });
            }

            let offset = state.next_offset;
            state.next_offset += 1;

            let incoming = IncomingMessage {
                payload: message.payload,
                metadata: MessageMetadata {
                    topic: message.topic.clone(),
                    partition: 0,
                    offset,
                    key: message.key.map(String::into_bytes),
                    timestamp: Some(chrono::Utc::now().timestamp_millis()),
                    headers: message.headers.into_iter().collect(),
                    redelivery_count: 0,
                },
            };
            debug!(topic = %message.topic, offset, "Queued message");
            state
                .topics
                .entry(message.topic)
                .or_default()
                .pending
                .push_back(incoming);
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }
}

/// Consumer handle for one topic of a [`MemoryQueue`]
pub struct MemorySubscription {
    queue: MemoryQueue,
    topic: String,
    connected: bool,
}

impl MemorySubscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl MessageSource for MemorySubscription {
    async fn connect(&mut self) -> Result<(), QueueError> {
        self.connected = true;
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Option<IncomingMessage>, QueueError> {
        if !self.connected {
            return Err(QueueError::NotConnected);
        }

        let deadline = Instant::now() + timeout;
        loop {
            // Register interest before checking so a concurrent publish is not missed.
            let notified = self.queue.shared.notify.notified();
            match self.queue.take_next(&self.topic) {
                Ok(Some(message)) => return Ok(Some(message)),
                Ok(None) => {}
                Err(e) => {
                    self.connected = false;
                    return Err(e);
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&mut self, message: &IncomingMessage) -> Result<(), QueueError> {
        self.queue.settle(message, false)
    }

    async fn nack(&mut self, message: &IncomingMessage) -> Result<(), QueueError> {
        self.queue.settle(message, true)
    }
}
