//! Kafka-backed [`MessageSource`].
//!
//! Offsets are committed per message on ack. A nack seeks the partition back
//! to the message offset so the broker hands it out again.

use crate::config::KafkaConfig;
use crate::queue::{IncomingMessage, MessageMetadata, MessageSource, QueueError};
use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Headers, Message as KafkaMessage};
use rdkafka::{Offset, TopicPartitionList};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

const SEEK_TIMEOUT: Duration = Duration::from_secs(1);

pub struct KafkaSource {
    config: KafkaConfig,
    topics: Vec<String>,
    consumer: Option<StreamConsumer>,
}

impl KafkaSource {
    pub fn new(config: KafkaConfig, topics: Vec<String>) -> Self {
        Self {
            config,
            topics,
            consumer: None,
        }
    }

    fn consumer(&self) -> Result<&StreamConsumer, QueueError> {
        self.consumer.as_ref().ok_or(QueueError::NotConnected)
    }
}

#[async_trait]
impl MessageSource for KafkaSource {
    async fn connect(&mut self) -> Result<(), QueueError> {
        info!(
            brokers = %self.config.bootstrap_servers,
            group = %self.config.group_id,
            topics = ?self.topics,
            "Connecting Kafka consumer"
        );

        let consumer: StreamConsumer = self
            .config
            .build_consumer_config()
            .create()
            .map_err(|e| QueueError::Creation(e.to_string()))?;

        let topics: Vec<&str> = self.topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topics)
            .map_err(|e| QueueError::Subscription(e.to_string()))?;

        self.consumer = Some(consumer);
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Option<IncomingMessage>, QueueError> {
        let consumer = self.consumer()?;

        let received = match tokio::time::timeout(timeout, consumer.recv()).await {
            Err(_) => return Ok(None),
            Ok(received) => received,
        };

        match received {
            Ok(borrowed) => {
                let incoming = convert_message(&borrowed);
                debug!(
                    topic = %incoming.metadata.topic,
                    partition = incoming.metadata.partition,
                    offset = incoming.metadata.offset,
                    "Received message"
                );
                Ok(Some(incoming))
            }
            Err(KafkaError::MessageConsumption(
                code @ (RDKafkaErrorCode::AllBrokersDown | RDKafkaErrorCode::BrokerTransportFailure),
            )) => {
                warn!(error = %code, "Kafka broker connection lost");
                self.consumer = None;
                Err(QueueError::ConnectionLost(code.to_string()))
            }
            Err(e) => Err(QueueError::Receive(e.to_string())),
        }
    }

    async fn ack(&mut self, message: &IncomingMessage) -> Result<(), QueueError> {
        let meta = &message.metadata;
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&meta.topic, meta.partition, Offset::Offset(meta.offset + 1))
            .map_err(|e| settle_error(meta.offset, e))?;

        self.consumer()?
            .commit(&tpl, CommitMode::Async)
            .map_err(|e| settle_error(meta.offset, e))
    }

    async fn nack(&mut self, message: &IncomingMessage) -> Result<(), QueueError> {
        let meta = &message.metadata;
        self.consumer()?
            .seek(&meta.topic, meta.partition, Offset::Offset(meta.offset), SEEK_TIMEOUT)
            .map_err(|e| settle_error(meta.offset, e))
    }
}

fn settle_error(offset: i64, error: KafkaError) -> QueueError {
    QueueError::Settle {
        offset,
        message: error.to_string(),
    }
}

/// Convert a borrowed Kafka message to our IncomingMessage type
fn convert_message<M: KafkaMessage>(msg: &M) -> IncomingMessage {
    let payload = msg.payload().unwrap_or(&[]).to_vec();
    let key = msg.key().map(|k| k.to_vec());

    let mut headers = HashMap::new();
    if let Some(h) = msg.headers() {
        for header in h.iter() {
            if let Some(value) = header.value {
                if let Ok(v) = String::from_utf8(value.to_vec()) {
                    headers.insert(header.key.to_string(), v);
                }
            }
        }
    }

    IncomingMessage {
        payload,
        metadata: MessageMetadata {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key,
            timestamp: msg.timestamp().to_millis(),
            headers,
            redelivery_count: 0,
        },
    }
}
