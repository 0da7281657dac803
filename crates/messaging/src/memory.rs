//! In-process transport for tests: topics are queues, commits are recorded.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::transport::{InboundMessage, MessageTransport, OutboundMessage, TransportError};

/// Transport double. Messages published to a subscribed topic are delivered
/// back to `fetch`, so retry loops play out exactly as they would on a broker
/// whose consumer also listens to the retry topic.
pub struct InMemoryTransport {
    subscriptions: Vec<String>,
    sender: mpsc::UnboundedSender<InboundMessage>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<InboundMessage>>,
    next_offset: AtomicI64,
    published: Mutex<Vec<(String, OutboundMessage)>>,
    committed: Mutex<Vec<InboundMessage>>,
    pending_fetch_failures: AtomicUsize,
    fail_publishes: AtomicBool,
    closed: AtomicBool,
}

impl InMemoryTransport {
    pub fn new(subscriptions: &[&str]) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            subscriptions: subscriptions.iter().map(|t| t.to_string()).collect(),
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
            next_offset: AtomicI64::new(0),
            published: Mutex::new(Vec::new()),
            committed: Mutex::new(Vec::new()),
            pending_fetch_failures: AtomicUsize::new(0),
            fail_publishes: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue a message as if a producer had written it to `topic`.
    pub fn push(&self, topic: &str, key: &[u8], value: &[u8], headers: Vec<(String, Vec<u8>)>) {
        self.deliver(topic, key.to_vec(), value.to_vec(), headers);
    }

    /// Make the next `count` fetches fail.
    pub fn fail_next_fetches(&self, count: usize) {
        self.pending_fetch_failures.store(count, Ordering::SeqCst);
    }

    pub fn set_fail_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::SeqCst);
    }

    /// Every successful publish, in order
    pub fn published(&self) -> Vec<(String, OutboundMessage)> {
        lock(&self.published).clone()
    }

    pub fn published_to(&self, topic: &str) -> Vec<OutboundMessage> {
        lock(&self.published)
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// Every committed message, in commit order
    pub fn committed(&self) -> Vec<InboundMessage> {
        lock(&self.committed).clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn deliver(&self, topic: &str, key: Vec<u8>, value: Vec<u8>, headers: Vec<(String, Vec<u8>)>) {
        let message = InboundMessage {
            topic: topic.to_string(),
            partition: 0,
            offset: self.next_offset.fetch_add(1, Ordering::SeqCst),
            key,
            value,
            headers,
        };
        // the receiver lives as long as self
        let _ = self.sender.send(message);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl MessageTransport for InMemoryTransport {
    async fn fetch(&self) -> Result<InboundMessage, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let injected = self
            .pending_fetch_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(TransportError::Fetch("injected fetch failure".to_string()));
        }

        self.receiver
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Closed)
    }

    async fn commit(&self, message: &InboundMessage) -> Result<(), TransportError> {
        lock(&self.committed).push(message.clone());
        Ok(())
    }

    async fn publish(&self, topic: &str, message: OutboundMessage) -> Result<(), TransportError> {
        if self.fail_publishes.load(Ordering::SeqCst) {
            return Err(TransportError::Publish(format!("publish to {} refused", topic)));
        }

        lock(&self.published).push((topic.to_string(), message.clone()));
        if self.subscriptions.iter().any(|t| t == topic) {
            self.deliver(topic, message.key, message.value, message.headers);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
