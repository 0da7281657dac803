use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::{Offset, TopicPartitionList};
use tracing::{debug, info};

use crate::producer::KafkaPublisher;
use crate::transport::{InboundMessage, MessageTransport, OutboundMessage, TransportError};

/// Kafka-backed transport: a manually committed consumer group plus a producer
/// for republishing.
pub struct KafkaTransport {
    consumer: StreamConsumer,
    publisher: KafkaPublisher,
    closed: AtomicBool,
}

impl KafkaTransport {
    /// Create a consumer in `group_id` subscribed to `topics`.
    ///
    /// Auto-commit is off; offsets only move through `commit`.
    pub fn new(brokers: &str, group_id: &str, topics: &[&str]) -> Result<Self, TransportError> {
        info!(
            "Creating Kafka consumer with group_id: {}, topics: {:?}",
            group_id, topics
        );

        let consumer: StreamConsumer = ClientConfig::new()
            .set("group.id", group_id)
            .set("bootstrap.servers", brokers)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "30000")
            .set("heartbeat.interval.ms", "10000")
            .create()?;

        consumer.subscribe(topics)?;

        let publisher = KafkaPublisher::new(brokers)?;

        info!("Kafka transport created successfully");
        Ok(Self {
            consumer,
            publisher,
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

fn detach(message: &BorrowedMessage<'_>) -> InboundMessage {
    let headers = message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .map(|h| (h.key.to_string(), h.value.unwrap_or_default().to_vec()))
                .collect()
        })
        .unwrap_or_default();

    InboundMessage {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().unwrap_or_default().to_vec(),
        value: message.payload().unwrap_or_default().to_vec(),
        headers,
    }
}

#[async_trait]
impl MessageTransport for KafkaTransport {
    async fn fetch(&self) -> Result<InboundMessage, TransportError> {
        self.ensure_open()?;

        let message = self.consumer.recv().await?;
        debug!(
            "Received message from topic: {}, partition: {}, offset: {}",
            message.topic(),
            message.partition(),
            message.offset()
        );
        Ok(detach(&message))
    }

    async fn commit(&self, message: &InboundMessage) -> Result<(), TransportError> {
        self.ensure_open()?;

        let mut offsets = TopicPartitionList::new();
        offsets.add_partition_offset(
            &message.topic,
            message.partition,
            Offset::Offset(message.offset + 1),
        )?;
        self.consumer.commit(&offsets, CommitMode::Async)?;
        Ok(())
    }

    async fn publish(&self, topic: &str, message: OutboundMessage) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.publisher.publish(topic, &message).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.consumer.unsubscribe();
        self.publisher.flush(Duration::from_secs(5))?;
        info!("Kafka transport closed");
        Ok(())
    }
}
