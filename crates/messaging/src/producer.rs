use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::transport::{OutboundMessage, TransportError};

/// Kafka producer used to republish messages to the retry and dead-letter topics.
pub struct KafkaPublisher {
    producer: FutureProducer,
    send_timeout: Duration,
}

impl KafkaPublisher {
    /// Create a new KafkaPublisher
    ///
    /// # Arguments
    /// * `brokers` - Comma-separated list of Kafka brokers (e.g., "localhost:9092")
    pub fn new(brokers: &str) -> Result<Self, TransportError> {
        info!("Creating Kafka producer for brokers: {}", brokers);

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .set("acks", "all") // Wait for all replicas to acknowledge
            .set("retries", "3")
            .create()?;

        Ok(Self {
            producer,
            send_timeout: Duration::from_secs(5),
        })
    }

    /// Publish `message` with its headers to `topic`
    pub async fn publish(&self, topic: &str, message: &OutboundMessage) -> Result<(), TransportError> {
        let headers = message
            .headers
            .iter()
            .fold(OwnedHeaders::new_with_capacity(message.headers.len()), |acc, (key, value)| {
                acc.insert(Header {
                    key: key.as_str(),
                    value: Some(value.as_slice()),
                })
            });

        let record = FutureRecord::to(topic)
            .key(message.key.as_slice())
            .payload(message.value.as_slice())
            .headers(headers);

        match self
            .producer
            .send(record, Timeout::After(self.send_timeout))
            .await
        {
            Ok((partition, offset)) => {
                debug!(topic, partition, offset, "Message published");
                Ok(())
            }
            Err((err, _)) => {
                warn!(topic, error = %err, "Failed to publish message");
                Err(TransportError::Publish(err.to_string()))
            }
        }
    }

    /// Wait for in-flight deliveries
    pub fn flush(&self, timeout: Duration) -> Result<(), TransportError> {
        self.producer.flush(Timeout::After(timeout))?;
        Ok(())
    }
}
