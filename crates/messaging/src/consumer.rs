use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use common::metrics::{self, MessageOutcome};
use futures_util::FutureExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::transport::{
    InboundMessage, MessageTransport, OutboundMessage, TransportError, ORIGINAL_TOPIC_HEADER,
    RETRY_COUNT_HEADER,
};

/// Processes the key and value of a consumed message.
///
/// Any error counts as a failure and sends the message down the retry path;
/// transient and permanent failures are not told apart.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, key: &[u8], value: &[u8]) -> anyhow::Result<()>;
}

/// Where a failed message goes next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { topic: String, attempt: u32 },
    DeadLetter { topic: String, attempts: u32 },
}

/// Bounded retry through a retry topic, then dead-lettering.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub source_topic: String,
    pub retry_topic: String,
    pub dlq_topic: String,
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn new(
        source_topic: impl Into<String>,
        retry_topic: impl Into<String>,
        dlq_topic: impl Into<String>,
        max_retries: u32,
    ) -> Self {
        Self {
            source_topic: source_topic.into(),
            retry_topic: retry_topic.into(),
            dlq_topic: dlq_topic.into(),
            max_retries,
        }
    }

    /// Decide the fate of a message that failed after `previous_retries` retries.
    pub fn decide(&self, previous_retries: u32) -> RetryDecision {
        let attempt = previous_retries.saturating_add(1);
        if attempt <= self.max_retries {
            RetryDecision::Retry {
                topic: self.retry_topic.clone(),
                attempt,
            }
        } else {
            RetryDecision::DeadLetter {
                topic: self.dlq_topic.clone(),
                attempts: attempt,
            }
        }
    }

    /// Build the republished copy of `message` for `decision`.
    pub fn outbound(&self, message: &InboundMessage, decision: &RetryDecision) -> OutboundMessage {
        let headers = match decision {
            RetryDecision::Retry { attempt, .. } => {
                vec![(RETRY_COUNT_HEADER.to_string(), attempt.to_string().into_bytes())]
            }
            RetryDecision::DeadLetter { attempts, .. } => vec![
                (
                    ORIGINAL_TOPIC_HEADER.to_string(),
                    self.source_topic.clone().into_bytes(),
                ),
                (RETRY_COUNT_HEADER.to_string(), attempts.to_string().into_bytes()),
            ],
        };

        OutboundMessage {
            key: message.key.clone(),
            value: message.value.clone(),
            headers,
        }
    }
}

/// Drains a topic into a `MessageHandler` with at-least-once delivery.
///
/// Every fetched message is committed whatever its outcome; failures are
/// redelivered only through the retry topic, so a poison message never stalls
/// its partition.
pub struct RetryingConsumer {
    transport: Arc<dyn MessageTransport>,
    policy: RetryPolicy,
    fetch_error_backoff: Duration,
}

impl RetryingConsumer {
    pub fn new(transport: Arc<dyn MessageTransport>, policy: RetryPolicy) -> Self {
        Self {
            transport,
            policy,
            fetch_error_backoff: Duration::from_secs(1),
        }
    }

    /// Pause between a failed fetch and the next attempt
    pub fn with_fetch_error_backoff(mut self, backoff: Duration) -> Self {
        self.fetch_error_backoff = backoff;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run until `shutdown` flips to `true` (or its sender is dropped).
    pub async fn consume<H>(&self, handler: &H, mut shutdown: watch::Receiver<bool>)
    where
        H: MessageHandler + ?Sized,
    {
        info!(topic = %self.policy.source_topic, "Consumer started");

        loop {
            if *shutdown.borrow() {
                info!("Consumer stopping: shutdown requested");
                return;
            }

            let fetched = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Consumer stopping: shutdown requested");
                        return;
                    }
                    continue;
                }
                fetched = self.transport.fetch() => fetched,
            };

            match fetched {
                Ok(message) => self.process(handler, message).await,
                Err(TransportError::Closed) => {
                    info!("Consumer stopping: transport closed");
                    return;
                }
                Err(e) => {
                    // Nothing was consumed, so the same offset is fetched again.
                    error!(error = %e, "Fetch failed");
                    metrics::record_fetch_error(&self.policy.source_topic);
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(self.fetch_error_backoff) => {}
                    }
                }
            }
        }
    }

    async fn process<H>(&self, handler: &H, message: InboundMessage)
    where
        H: MessageHandler + ?Sized,
    {
        let started = Instant::now();

        // A panicking handler counts as a failed attempt; the loop must keep committing.
        let handled = AssertUnwindSafe(handler.handle(&message.key, &message.value))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                error!(
                    topic = %message.topic,
                    offset = message.offset,
                    "Message handler panicked"
                );
                Err(anyhow::anyhow!("handler panicked: {}", panic_message(panic.as_ref())))
            });

        let outcome = match handled {
            Ok(()) => {
                debug!(
                    topic = %message.topic,
                    offset = message.offset,
                    "Message handled"
                );
                MessageOutcome::Success
            }
            Err(e) => {
                let decision = self.policy.decide(message.retry_count());
                self.republish(&message, &decision, &e).await;
                match decision {
                    RetryDecision::Retry { .. } => MessageOutcome::Retried,
                    RetryDecision::DeadLetter { .. } => MessageOutcome::DeadLettered,
                }
            }
        };

        if let Err(e) = self.transport.commit(&message).await {
            error!(
                topic = %message.topic,
                offset = message.offset,
                error = %e,
                "Failed to commit offset"
            );
        }

        metrics::record_message(outcome, started.elapsed().as_secs_f64());
    }

    async fn republish(&self, message: &InboundMessage, decision: &RetryDecision, cause: &anyhow::Error) {
        let outbound = self.policy.outbound(message, decision);
        let cause = format!("{:#}", cause);

        let topic = match decision {
            RetryDecision::Retry { topic, attempt } => {
                warn!(
                    offset = message.offset,
                    attempt,
                    error = %cause,
                    "Handler failed, scheduling retry"
                );
                topic
            }
            RetryDecision::DeadLetter { topic, attempts } => {
                error!(
                    offset = message.offset,
                    attempts,
                    error = %cause,
                    "Handler failed, sending message to DLQ"
                );
                topic
            }
        };

        if let Err(e) = self.transport.publish(topic, outbound).await {
            error!(topic = %topic, error = %e, "Failed to republish failed message");
        }
    }

    /// Release the transport. Safe to call more than once and while `consume` is running.
    pub async fn close(&self) -> Result<(), TransportError> {
        self.transport.close().await
    }
}

fn panic_message<'a>(panic: &'a (dyn Any + Send + 'static)) -> &'a str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const SOURCE: &str = "orders";
    const RETRY: &str = "orders-retry";
    const DLQ: &str = "orders-dlq";

    /// Fails the first `failures` calls, then succeeds; records retry headers it saw.
    struct ScriptedHandler {
        failures: usize,
        calls: AtomicUsize,
        seen_values: Mutex<Vec<Vec<u8>>>,
    }

    impl ScriptedHandler {
        fn failing(failures: usize) -> Self {
            Self {
                failures,
                calls: AtomicUsize::new(0),
                seen_values: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MessageHandler for ScriptedHandler {
        async fn handle(&self, _key: &[u8], value: &[u8]) -> anyhow::Result<()> {
            self.seen_values.lock().unwrap().push(value.to_vec());
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                anyhow::bail!("scripted failure #{}", call + 1);
            }
            Ok(())
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::new(SOURCE, RETRY, DLQ, 3)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    fn header_str(message: &OutboundMessage, name: &str) -> Option<String> {
        message
            .header(name)
            .map(|v| String::from_utf8(v.to_vec()).unwrap())
    }

    #[test]
    fn test_policy_decisions() {
        let policy = policy();
        assert_eq!(
            policy.decide(0),
            RetryDecision::Retry { topic: RETRY.to_string(), attempt: 1 }
        );
        assert_eq!(
            policy.decide(2),
            RetryDecision::Retry { topic: RETRY.to_string(), attempt: 3 }
        );
        assert_eq!(
            policy.decide(3),
            RetryDecision::DeadLetter { topic: DLQ.to_string(), attempts: 4 }
        );
    }

    #[tokio::test]
    async fn test_success_commits_without_republish() {
        let transport = Arc::new(InMemoryTransport::new(&[SOURCE, RETRY]));
        transport.push(SOURCE, b"k1", b"payload", vec![]);

        let consumer = Arc::new(RetryingConsumer::new(transport.clone(), policy()));
        let handler = Arc::new(ScriptedHandler::failing(0));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = {
            let consumer = consumer.clone();
            let handler = handler.clone();
            tokio::spawn(async move { consumer.consume(handler.as_ref(), shutdown_rx).await })
        };

        wait_until(|| transport.committed().len() == 1).await;
        shutdown_tx.send(true).unwrap();
        task.await.unwrap();

        assert_eq!(handler.calls(), 1);
        assert!(transport.published().is_empty());
    }

    #[tokio::test]
    async fn test_always_failing_handler_is_dead_lettered_after_three_retries() {
        let transport = Arc::new(InMemoryTransport::new(&[SOURCE, RETRY]));
        transport.push(SOURCE, b"order-key", b"not json", vec![]);

        let consumer = Arc::new(RetryingConsumer::new(transport.clone(), policy()));
        let handler = Arc::new(ScriptedHandler::failing(usize::MAX));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = {
            let consumer = consumer.clone();
            let handler = handler.clone();
            tokio::spawn(async move { consumer.consume(handler.as_ref(), shutdown_rx).await })
        };

        wait_until(|| transport.published_to(DLQ).len() == 1).await;
        wait_until(|| transport.committed().len() == 4).await;
        shutdown_tx.send(true).unwrap();
        task.await.unwrap();

        let retries = transport.published_to(RETRY);
        let counters: Vec<String> = retries
            .iter()
            .map(|m| header_str(m, RETRY_COUNT_HEADER).unwrap())
            .collect();
        assert_eq!(counters, vec!["1", "2", "3"]);

        let dead = &transport.published_to(DLQ)[0];
        assert_eq!(header_str(dead, ORIGINAL_TOPIC_HEADER).as_deref(), Some(SOURCE));
        assert_eq!(dead.key, b"order-key".to_vec());
        assert_eq!(dead.value, b"not json".to_vec());

        // one handler call and one commit per delivery
        assert_eq!(handler.calls(), 4);
        assert_eq!(transport.committed().len(), 4);
    }

    #[tokio::test]
    async fn test_fails_twice_then_succeeds() {
        let transport = Arc::new(InMemoryTransport::new(&[SOURCE, RETRY]));
        transport.push(SOURCE, b"k", b"v", vec![]);

        let consumer = Arc::new(RetryingConsumer::new(transport.clone(), policy()));
        let handler = Arc::new(ScriptedHandler::failing(2));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = {
            let consumer = consumer.clone();
            let handler = handler.clone();
            tokio::spawn(async move { consumer.consume(handler.as_ref(), shutdown_rx).await })
        };

        wait_until(|| transport.committed().len() == 3).await;
        shutdown_tx.send(true).unwrap();
        task.await.unwrap();

        let counters: Vec<String> = transport
            .published_to(RETRY)
            .iter()
            .map(|m| header_str(m, RETRY_COUNT_HEADER).unwrap())
            .collect();
        assert_eq!(counters, vec!["1", "2"]);
        assert!(transport.published_to(DLQ).is_empty());
        assert_eq!(handler.calls(), 3);
        assert_eq!(handler.seen_values.lock().unwrap().len(), 3);
    }

    /// Panics on values equal to `poison`, accepts everything else.
    struct PanickingHandler {
        poison: &'static [u8],
        accepted: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl MessageHandler for PanickingHandler {
        async fn handle(&self, _key: &[u8], value: &[u8]) -> anyhow::Result<()> {
            if value == self.poison {
                panic!("attempt to subtract with overflow");
            }
            self.accepted.lock().unwrap().push(value.to_vec());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_panicking_handler_is_dead_lettered_and_loop_continues() {
        let transport = Arc::new(InMemoryTransport::new(&[SOURCE, RETRY]));
        transport.push(SOURCE, b"bad", b"poison", vec![]);
        transport.push(SOURCE, b"good", b"fine", vec![]);

        let consumer = Arc::new(RetryingConsumer::new(transport.clone(), policy()));
        let handler = Arc::new(PanickingHandler {
            poison: b"poison",
            accepted: Mutex::new(Vec::new()),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = {
            let consumer = consumer.clone();
            let handler = handler.clone();
            tokio::spawn(async move { consumer.consume(handler.as_ref(), shutdown_rx).await })
        };

        wait_until(|| transport.published_to(DLQ).len() == 1).await;
        wait_until(|| transport.committed().len() == 5).await;
        shutdown_tx.send(true).unwrap();
        task.await.expect("consumer task must not unwind");

        assert_eq!(*handler.accepted.lock().unwrap(), vec![b"fine".to_vec()]);
        assert_eq!(transport.published_to(RETRY).len(), 3);
        assert_eq!(transport.published_to(DLQ)[0].value, b"poison".to_vec());
    }

    #[test]
    fn test_panic_message_extraction() {
        let literal: Box<dyn Any + Send> = Box::new("boom");
        let owned: Box<dyn Any + Send> = Box::new(String::from("bang"));
        let other: Box<dyn Any + Send> = Box::new(7u8);

        assert_eq!(panic_message(literal.as_ref()), "boom");
        assert_eq!(panic_message(owned.as_ref()), "bang");
        assert_eq!(panic_message(other.as_ref()), "non-string panic payload");
    }

    #[tokio::test]
    async fn test_fetch_errors_do_not_skip_messages() {
        let transport = Arc::new(InMemoryTransport::new(&[SOURCE, RETRY]));
        transport.push(SOURCE, b"k", b"v", vec![]);
        transport.fail_next_fetches(3);

        let consumer = Arc::new(
            RetryingConsumer::new(transport.clone(), policy())
                .with_fetch_error_backoff(Duration::from_millis(1)),
        );
        let handler = Arc::new(ScriptedHandler::failing(0));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = {
            let consumer = consumer.clone();
            let handler = handler.clone();
            tokio::spawn(async move { consumer.consume(handler.as_ref(), shutdown_rx).await })
        };

        wait_until(|| transport.committed().len() == 1).await;
        shutdown_tx.send(true).unwrap();
        task.await.unwrap();

        assert_eq!(transport.committed()[0].offset, 0);
        assert_eq!(handler.calls(), 1);
    }

    #[tokio::test]
    async fn test_publish_failure_still_commits() {
        let transport = Arc::new(InMemoryTransport::new(&[SOURCE, RETRY]));
        transport.set_fail_publishes(true);
        transport.push(SOURCE, b"k", b"v", vec![]);

        let consumer = Arc::new(RetryingConsumer::new(transport.clone(), policy()));
        let handler = Arc::new(ScriptedHandler::failing(usize::MAX));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = {
            let consumer = consumer.clone();
            let handler = handler.clone();
            tokio::spawn(async move { consumer.consume(handler.as_ref(), shutdown_rx).await })
        };

        wait_until(|| transport.committed().len() == 1).await;
        shutdown_tx.send(true).unwrap();
        task.await.unwrap();

        assert!(transport.published().is_empty());
        assert_eq!(handler.calls(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_while_waiting_for_messages() {
        let transport = Arc::new(InMemoryTransport::new(&[SOURCE, RETRY]));
        let consumer = Arc::new(RetryingConsumer::new(transport.clone(), policy()));
        let handler = ScriptedHandler::failing(0);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let run = consumer.consume(&handler, shutdown_rx);
        let stop = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            shutdown_tx.send(true).unwrap();
        };

        tokio::time::timeout(Duration::from_secs(2), async { tokio::join!(run, stop) })
            .await
            .expect("consumer must return after shutdown");
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let transport = Arc::new(InMemoryTransport::new(&[SOURCE]));
        let consumer = RetryingConsumer::new(transport.clone(), policy());

        assert!(consumer.close().await.is_ok());
        assert!(consumer.close().await.is_ok());
        assert!(transport.is_closed());

        // consuming a closed transport returns immediately
        let (_tx, rx) = watch::channel(false);
        consumer.consume(&ScriptedHandler::failing(0), rx).await;
    }
}
