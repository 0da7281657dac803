use async_trait::async_trait;
use thiserror::Error;

/// Number of times a message has already been retried. Absent means zero.
pub const RETRY_COUNT_HEADER: &str = "x-retry-count";

/// Source topic of a dead-lettered message
pub const ORIGINAL_TOPIC_HEADER: &str = "x-original-topic";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("Failed to fetch message: {0}")]
    Fetch(String),

    #[error("Failed to publish message: {0}")]
    Publish(String),

    #[error("Transport is closed")]
    Closed,
}

/// A message fetched from a topic, detached from the underlying client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub headers: Vec<(String, Vec<u8>)>,
}

impl InboundMessage {
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_slice())
    }

    /// Retries already spent on this message; a missing or unparsable header counts as 0.
    pub fn retry_count(&self) -> u32 {
        self.header(RETRY_COUNT_HEADER)
            .and_then(|raw| std::str::from_utf8(raw).ok())
            .and_then(|text| text.trim().parse().ok())
            .unwrap_or(0)
    }
}

/// A message to republish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub headers: Vec<(String, Vec<u8>)>,
}

impl OutboundMessage {
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_slice())
    }
}

/// Message broker operations the ingestion consumer relies on.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Wait for the next message on any subscribed topic.
    async fn fetch(&self) -> Result<InboundMessage, TransportError>;

    /// Acknowledge `message` so it is not delivered again.
    async fn commit(&self, message: &InboundMessage) -> Result<(), TransportError>;

    /// Publish `message` to `topic`.
    async fn publish(&self, topic: &str, message: OutboundMessage) -> Result<(), TransportError>;

    /// Release the connection. Repeated calls are no-ops.
    async fn close(&self) -> Result<(), TransportError>;
}
