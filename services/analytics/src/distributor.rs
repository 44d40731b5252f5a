//! Event distribution to connected subscribers.
//!
//! Connections are indexed three ways: the global set, per-camera sets and
//! per-user sets. All three live behind one lock so dropping a connection
//! removes it from every index at once. Broadcasts snapshot their targets,
//! release the lock and deliver concurrently; a failed delivery drops only
//! the connection it was addressed to.

use crate::config::DistributorConfig;
use crate::detection::ObjectCount;
use crate::models::{AlertRecord, DetectionEvent, DetectionKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type ConnectionId = Uuid;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeliveryError {
    #[error("Subscriber did not accept message within {0:?}")]
    Timeout(Duration),

    #[error("Subscriber connection closed")]
    Closed,
}

/// Where a subscriber receives messages
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn deliver(&self, payload: Arc<str>) -> Result<(), DeliveryError>;
}

/// Sink backed by a bounded channel; the receiving half belongs to the
/// transport (for example a websocket writer task).
pub struct ChannelSink {
    tx: mpsc::Sender<Arc<str>>,
    send_timeout: Duration,
}

impl ChannelSink {
    pub fn new(config: &DistributorConfig) -> (Self, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        (
            Self {
                tx,
                send_timeout: config.send_timeout(),
            },
            rx,
        )
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn deliver(&self, payload: Arc<str>) -> Result<(), DeliveryError> {
        match tokio::time::timeout(self.send_timeout, self.tx.send(payload)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(DeliveryError::Closed),
            Err(_) => Err(DeliveryError::Timeout(self.send_timeout)),
        }
    }
}

/// Broadcast target
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    Global,
    Camera(String),
    User(String),
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Global => write!(f, "global"),
            Scope::Camera(id) => write!(f, "camera:{id}"),
            Scope::User(id) => write!(f, "user:{id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Detection,
    ZoneEvent,
    Alert,
    ObjectCounts,
    StreamStatus,
    Pong,
}

/// Message delivered to subscribers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventMessage {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub camera_id: Option<String>,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct CountEntry<'a> {
    object_class: &'a str,
    count: u64,
    last_updated: DateTime<Utc>,
}

/// Stream session state change, as seen by subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamStatusUpdate {
    pub camera_id: String,
    pub state: String,
    pub frame_count: u64,
    pub error_count: u32,
}

impl EventMessage {
    fn new(kind: EventKind, camera_id: Option<&str>, data: serde_json::Value) -> Self {
        Self {
            kind,
            camera_id: camera_id.map(str::to_string),
            data,
            timestamp: Utc::now(),
        }
    }

    /// Detections and zone crossings share a payload shape
    pub fn detection(event: &DetectionEvent) -> Self {
        let kind = match event.kind {
            DetectionKind::Detection => EventKind::Detection,
            DetectionKind::ZoneEntry | DetectionKind::ZoneExit => EventKind::ZoneEvent,
        };
        Self::new(kind, Some(&event.camera_id), to_value(event))
    }

    pub fn alert(alert: &AlertRecord) -> Self {
        Self::new(EventKind::Alert, Some(&alert.camera_id), to_value(alert))
    }

    pub fn object_counts(camera_id: &str, counts: &[ObjectCount]) -> Self {
        let now = Utc::now();
        let entries: Vec<CountEntry<'_>> = counts
            .iter()
            .map(|c| CountEntry {
                object_class: &c.object_class,
                count: c.count,
                last_updated: now,
            })
            .collect();
        Self::new(EventKind::ObjectCounts, Some(camera_id), to_value(&entries))
    }

    pub fn stream_status(update: &StreamStatusUpdate) -> Self {
        Self::new(EventKind::StreamStatus, Some(&update.camera_id), to_value(update))
    }

    pub fn pong() -> Self {
        Self::new(EventKind::Pong, None, serde_json::Value::Null)
    }
}

fn to_value<T: Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to encode event payload");
        serde_json::Value::Null
    })
}

/// Commands a subscriber may send over its connection
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    SubscribeCamera { camera_id: String },
    UnsubscribeCamera { camera_id: String },
    SubscribeUser { user_id: String },
    Ping,
}

/// Outcome of one broadcast
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    pub total_connections: usize,
    pub global_subscribers: usize,
    pub camera_subscriptions: BTreeMap<String, usize>,
    pub user_subscriptions: BTreeMap<String, usize>,
}

#[derive(Default)]
struct Indices {
    sinks: HashMap<ConnectionId, Arc<dyn EventSink>>,
    global: HashSet<ConnectionId>,
    cameras: HashMap<String, HashSet<ConnectionId>>,
    users: HashMap<String, HashSet<ConnectionId>>,
}

impl Indices {
    fn members(&self, scope: &Scope) -> Option<&HashSet<ConnectionId>> {
        match scope {
            Scope::Global => Some(&self.global),
            Scope::Camera(id) => self.cameras.get(id),
            Scope::User(id) => self.users.get(id),
        }
    }

    fn remove_from(map: &mut HashMap<String, HashSet<ConnectionId>>, key: &str, conn: &ConnectionId) -> bool {
        let Some(set) = map.get_mut(key) else {
            return false;
        };
        let removed = set.remove(conn);
        if set.is_empty() {
            map.remove(key);
        }
        removed
    }
}

#[derive(Default)]
pub struct EventDistributor {
    indices: RwLock<Indices>,
}

impl EventDistributor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection without any subscription
    pub fn register(&self, sink: Arc<dyn EventSink>) -> ConnectionId {
        let id = Uuid::new_v4();
        self.indices.write().sinks.insert(id, sink);
        metrics::gauge!("vigil.distributor.connections").increment(1.0);
        debug!(connection_id = %id, "Connection registered");
        id
    }

    /// Register a connection and subscribe it globally and, when known, to its user
    pub fn connect(&self, sink: Arc<dyn EventSink>, user_id: Option<&str>) -> ConnectionId {
        let id = self.register(sink);
        self.subscribe(id, Scope::Global);
        if let Some(user_id) = user_id {
            self.subscribe(id, Scope::User(user_id.to_string()));
        }
        info!(connection_id = %id, user_id = ?user_id, "Subscriber connected");
        id
    }

    /// Returns false when the connection is unknown
    pub fn subscribe(&self, conn: ConnectionId, scope: Scope) -> bool {
        let mut indices = self.indices.write();
        if !indices.sinks.contains_key(&conn) {
            return false;
        }
        match scope {
            Scope::Global => {
                indices.global.insert(conn);
            }
            Scope::Camera(id) => {
                indices.cameras.entry(id).or_default().insert(conn);
            }
            Scope::User(id) => {
                indices.users.entry(id).or_default().insert(conn);
            }
        }
        true
    }

    pub fn unsubscribe(&self, conn: ConnectionId, scope: &Scope) -> bool {
        let mut indices = self.indices.write();
        match scope {
            Scope::Global => indices.global.remove(&conn),
            Scope::Camera(id) => Indices::remove_from(&mut indices.cameras, id, &conn),
            Scope::User(id) => Indices::remove_from(&mut indices.users, id, &conn),
        }
    }

    /// Remove a connection from every index
    pub fn drop_connection(&self, conn: ConnectionId) -> bool {
        let mut indices = self.indices.write();
        if indices.sinks.remove(&conn).is_none() {
            return false;
        }
        indices.global.remove(&conn);
        indices.cameras.retain(|_, set| {
            set.remove(&conn);
            !set.is_empty()
        });
        indices.users.retain(|_, set| {
            set.remove(&conn);
            !set.is_empty()
        });
        drop(indices);

        metrics::gauge!("vigil.distributor.connections").decrement(1.0);
        debug!(connection_id = %conn, "Connection dropped");
        true
    }

    pub fn is_subscribed(&self, conn: ConnectionId, scope: &Scope) -> bool {
        self.indices
            .read()
            .members(scope)
            .map(|set| set.contains(&conn))
            .unwrap_or(false)
    }

    pub fn connection_count(&self) -> usize {
        self.indices.read().sinks.len()
    }

    pub async fn broadcast(&self, message: &EventMessage, scope: &Scope) -> BroadcastReport {
        self.broadcast_many(message, std::slice::from_ref(scope)).await
    }

    /// Deliver once to every connection in the union of `scopes`
    pub async fn broadcast_many(&self, message: &EventMessage, scopes: &[Scope]) -> BroadcastReport {
        let targets: Vec<(ConnectionId, Arc<dyn EventSink>)> = {
            let indices = self.indices.read();
            let mut seen = HashSet::new();
            scopes
                .iter()
                .filter_map(|scope| indices.members(scope))
                .flatten()
                .filter(|id| seen.insert(**id))
                .filter_map(|id| indices.sinks.get(id).map(|sink| (*id, Arc::clone(sink))))
                .collect()
        };

        if targets.is_empty() {
            return BroadcastReport::default();
        }

        let payload: Arc<str> = match serde_json::to_string(message) {
            Ok(json) => json.into(),
            Err(e) => {
                warn!(error = %e, "Failed to serialize event message");
                return BroadcastReport::default();
            }
        };

        let results = join_all(targets.into_iter().map(|(id, sink)| {
            let payload = Arc::clone(&payload);
            async move { (id, sink.deliver(payload).await) }
        }))
        .await;

        let mut report = BroadcastReport::default();
        for (id, result) in results {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(connection_id = %id, error = %e, "Dropping subscriber after failed delivery");
                    self.drop_connection(id);
                    report.dropped += 1;
                }
            }
        }

        metrics::counter!("vigil.distributor.delivered").increment(report.delivered as u64);
        if report.dropped > 0 {
            metrics::counter!("vigil.distributor.dropped").increment(report.dropped as u64);
        }
        report
    }

    /// Send to a single connection; a failure drops it
    pub async fn send_to(&self, conn: ConnectionId, message: &EventMessage) -> Result<(), DeliveryError> {
        let sink = self
            .indices
            .read()
            .sinks
            .get(&conn)
            .cloned()
            .ok_or(DeliveryError::Closed)?;
        let payload: Arc<str> = serde_json::to_string(message)
            .map_err(|_| DeliveryError::Closed)?
            .into();

        let result = sink.deliver(payload).await;
        if result.is_err() {
            self.drop_connection(conn);
        }
        result
    }

    /// Apply a command received from a subscriber
    pub async fn handle_command(&self, conn: ConnectionId, command: ClientCommand) {
        match command {
            ClientCommand::SubscribeCamera { camera_id } => {
                if self.subscribe(conn, Scope::Camera(camera_id.clone())) {
                    info!(connection_id = %conn, camera_id = %camera_id, "Subscribed to camera");
                }
            }
            ClientCommand::UnsubscribeCamera { camera_id } => {
                if self.unsubscribe(conn, &Scope::Camera(camera_id.clone())) {
                    info!(connection_id = %conn, camera_id = %camera_id, "Unsubscribed from camera");
                }
            }
            ClientCommand::SubscribeUser { user_id } => {
                self.subscribe(conn, Scope::User(user_id));
            }
            ClientCommand::Ping => {
                // A failed reply has already dropped the connection
                if let Err(e) = self.send_to(conn, &EventMessage::pong()).await {
                    debug!(connection_id = %conn, error = %e, "Pong not delivered");
                }
            }
        }
    }

    pub fn connection_stats(&self) -> ConnectionStats {
        let indices = self.indices.read();
        ConnectionStats {
            total_connections: indices.sinks.len(),
            global_subscribers: indices.global.len(),
            camera_subscriptions: indices
                .cameras
                .iter()
                .map(|(id, set)| (id.clone(), set.len()))
                .collect(),
            user_subscriptions: indices
                .users
                .iter()
                .map(|(id, set)| (id.clone(), set.len()))
                .collect(),
        }
    }
}
