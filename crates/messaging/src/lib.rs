pub mod consumer;
pub mod kafka;
pub mod memory;
pub mod producer;
pub mod transport;

pub use consumer::{MessageHandler, RetryDecision, RetryPolicy, RetryingConsumer};
pub use kafka::KafkaTransport;
pub use memory::InMemoryTransport;
pub use producer::KafkaPublisher;
pub use transport::{
    InboundMessage, MessageTransport, OutboundMessage, TransportError, ORIGINAL_TOPIC_HEADER,
    RETRY_COUNT_HEADER,
};
