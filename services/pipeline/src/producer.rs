//! Kafka-backed [`MessagePublisher`].

use crate::config::KafkaConfig;
use crate::queue::{MessagePublisher, OutgoingMessage, QueueError};
use async_trait::async_trait;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

pub struct KafkaPublisher {
    producer: FutureProducer,
    default_timeout: Duration,
}

impl KafkaPublisher {
    pub fn new(config: &KafkaConfig) -> Result<Self, QueueError> {
        info!(brokers = %config.bootstrap_servers, "Creating Kafka producer");

        let producer: FutureProducer = config
            .build_producer_config()
            .create()
            .map_err(|e| QueueError::Creation(e.to_string()))?;

        Ok(Self {
            producer,
            default_timeout: config.request_timeout(),
        })
    }

    /// Flush all pending messages
    pub fn flush(&self, timeout: Duration) -> Result<(), QueueError> {
        self.producer
            .flush(Timeout::After(timeout))
            .map_err(|e| QueueError::Publish {
                topic: "*".to_string(),
                message: e.to_string(),
            })
    }
}

#[async_trait]
impl MessagePublisher for KafkaPublisher {
    #[instrument(skip(self, message), fields(topic = %message.topic, key = ?message.key))]
    async fn publish(&self, message: OutgoingMessage) -> Result<(), QueueError> {
        let mut headers = OwnedHeaders::new();
        for (key, value) in &message.headers {
            headers = headers.insert(Header {
                key: key.as_str(),
                value: Some(value.as_str()),
            });
        }

        let mut record = FutureRecord::to(&message.topic)
            .payload(&message.payload)
            .headers(headers);
        if let Some(ref k) = message.key {
            record = record.key(k);
        }

        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(self.default_timeout))
            .await
            .map_err(|(e, _)| QueueError::Publish {
                topic: message.topic.clone(),
                message: e.to_string(),
            })?;

        debug!(partition, offset, "Message delivered");
        Ok(())
    }
}

impl Drop for KafkaPublisher {
    fn drop(&mut self) {
        info!("Shutting down Kafka producer");
        if let Err(e) = self.flush(Duration::from_secs(5)) {
            warn!("Failed to flush producer on shutdown: {}", e);
        }
    }
}
