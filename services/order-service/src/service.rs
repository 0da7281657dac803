//! Order service orchestration: cache warm-up, read-through lookups, validated
//! writes and the ingestion task lifecycle.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use common::config::IngestionConfig;
use domain::{DomainError, Order};
use messaging::{MessageHandler, RetryingConsumer};
use storage::{OrderCache, OrderRepository, StorageError};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Validation(#[from] DomainError),

    #[error("Failed to decode order: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Order not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(StorageError),

    #[error("Order processing timed out after {0:?}")]
    Timeout(Duration),

    #[error("Service cannot do this while {0:?}")]
    InvalidState(ServiceState),
}

impl From<StorageError> for ServiceError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(order_uid) => ServiceError::NotFound(order_uid),
            other => ServiceError::Storage(other),
        }
    }
}

/// Lifecycle: Uninitialized -> Running -> ShuttingDown -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Uninitialized,
    Running,
    ShuttingDown,
    Stopped,
}

pub struct OrderService {
    repository: Arc<dyn OrderRepository>,
    cache: Arc<dyn OrderCache>,
    config: IngestionConfig,
    state: Mutex<ServiceState>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    consumers: Mutex<Vec<Arc<RetryingConsumer>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl OrderService {
    pub fn new(
        repository: Arc<dyn OrderRepository>,
        cache: Arc<dyn OrderCache>,
        config: IngestionConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            repository,
            cache,
            config,
            state: Mutex::new(ServiceState::Uninitialized),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> ServiceState {
        *lock(&self.state)
    }

    /// Receiver that flips to `true` once shutdown begins.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Warm the cache from the store and mark the service running.
    ///
    /// A failed or slow warm-up is logged and the service starts with an
    /// empty cache; lookups then fall through to the store.
    pub async fn start(&self) -> Result<(), ServiceError> {
        {
            let state = lock(&self.state);
            if *state != ServiceState::Uninitialized {
                return Err(ServiceError::InvalidState(*state));
            }
        }

        info!("Loading orders into cache...");
        let timeout = self.config.startup_load_timeout;
        match tokio::time::timeout(timeout, self.repository.get_all_orders()).await {
            Ok(Ok(orders)) => {
                let count = orders.len();
                self.cache.setup_cache(orders);
                info!(count, "Cache warmed from store");
            }
            Ok(Err(e)) => {
                error!(error = %e, "Failed to load orders for cache warm-up, starting with empty cache");
            }
            Err(_) => {
                error!(?timeout, "Cache warm-up timed out, starting with empty cache");
            }
        }

        *lock(&self.state) = ServiceState::Running;
        info!("Order service running");
        Ok(())
    }

    /// Cache-aside lookup: a miss reads the store and fills the cache.
    pub async fn get_order(&self, order_uid: &str) -> Result<Arc<Order>, ServiceError> {
        if let Some(order) = self.cache.get(order_uid) {
            debug!(order_uid, "Cache hit");
            return Ok(order);
        }

        debug!(order_uid, "Cache miss, querying store");
        let order = self.repository.get_order_by_id(order_uid).await?;
        self.cache.set(order.clone());
        Ok(Arc::new(order))
    }

    /// Validate, persist, then cache. Nothing is cached unless the store write
    /// committed.
    pub async fn create_order(&self, order: Order) -> Result<String, ServiceError> {
        order.ensure_valid()?;

        let order_uid = self.repository.create_order(&order).await?;
        self.cache.set(order);

        info!(order_uid = %order_uid, "Order stored");
        Ok(order_uid)
    }

    /// Decode one ingested payload and store it within the processing timeout.
    pub async fn handle_message(&self, key: &[u8], value: &[u8]) -> Result<(), ServiceError> {
        let order: Order = serde_json::from_slice(value)?;
        debug!(
            key = %String::from_utf8_lossy(key),
            order_uid = %order.order_uid,
            "Processing order message"
        );

        let timeout = self.config.processing_timeout;
        tokio::time::timeout(timeout, self.create_order(order))
            .await
            .map_err(|_| ServiceError::Timeout(timeout))??;
        Ok(())
    }

    /// Run `consumer` in the background until shutdown.
    pub fn spawn_ingestion(self: &Arc<Self>, consumer: Arc<RetryingConsumer>) {
        let service = Arc::clone(self);
        let shutdown = self.shutdown.subscribe();
        lock(&self.consumers).push(Arc::clone(&consumer));

        self.track(tokio::spawn(async move {
            consumer.consume(service.as_ref(), shutdown).await;
            if let Err(e) = consumer.close().await {
                warn!(error = %e, "Failed to close consumer transport");
            }
        }));
    }

    fn track(&self, handle: JoinHandle<()>) {
        lock(&self.tasks).push(handle);
    }

    /// Signal cancellation without waiting for anything.
    pub fn begin_shutdown(&self) {
        {
            let mut state = lock(&self.state);
            if matches!(*state, ServiceState::ShuttingDown | ServiceState::Stopped) {
                return;
            }
            *state = ServiceState::ShuttingDown;
        }

        info!("Order service shutting down");
        // send_replace succeeds even with no receivers
        self.shutdown.send_replace(true);
    }

    /// Cancel background work, give it `grace` to finish, then release the
    /// cache. Repeated calls after the first completed one are no-ops.
    pub async fn shutdown(&self, grace: Duration) {
        if self.state() == ServiceState::Stopped {
            return;
        }
        self.begin_shutdown();

        let tasks: Vec<JoinHandle<()>> = lock(&self.tasks).drain(..).collect();
        let aborts: Vec<_> = tasks.iter().map(|task| task.abort_handle()).collect();

        match tokio::time::timeout(grace, futures_util::future::join_all(tasks)).await {
            Ok(results) => {
                for result in results {
                    match result {
                        Err(e) if e.is_panic() => {
                            error!(error = %e, "Background task panicked");
                        }
                        Err(e) => warn!(error = %e, "Background task ended abnormally"),
                        Ok(()) => {}
                    }
                }
            }
            Err(_) => {
                warn!(?grace, "Background tasks did not stop within grace period, aborting");
                for abort in aborts {
                    abort.abort();
                }
            }
        }

        // An aborted task never reaches its own close; closing twice is a no-op.
        let consumers: Vec<Arc<RetryingConsumer>> = lock(&self.consumers).drain(..).collect();
        for consumer in consumers {
            if let Err(e) = consumer.close().await {
                warn!(error = %e, "Failed to close consumer transport");
            }
        }

        self.cache.close();
        *lock(&self.state) = ServiceState::Stopped;
        info!("Order service stopped");
    }
}

#[async_trait]
impl MessageHandler for OrderService {
    async fn handle(&self, key: &[u8], value: &[u8]) -> anyhow::Result<()> {
        self.handle_message(key, value).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::fixtures::sample_order;
    use messaging::{InMemoryTransport, MessageTransport, RetryPolicy, ORIGINAL_TOPIC_HEADER};
    use storage::{InMemoryOrderRepository, TtlCache};
    use tokio_test::{assert_err, assert_ok};

    struct Harness {
        service: Arc<OrderService>,
        repository: Arc<InMemoryOrderRepository>,
        cache: Arc<TtlCache>,
    }

    fn harness(repository: InMemoryOrderRepository) -> Harness {
        let repository = Arc::new(repository);
        let cache = Arc::new(TtlCache::without_expiry());
        let service = Arc::new(OrderService::new(
            repository.clone(),
            cache.clone(),
            IngestionConfig::default(),
        ));
        Harness {
            service,
            repository,
            cache,
        }
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    #[tokio::test]
    async fn test_get_order_reads_through_once() {
        let h = harness(InMemoryOrderRepository::with_orders([sample_order("X1")]));

        let first = h.service.get_order("X1").await.unwrap();
        let second = h.service.get_order("X1").await.unwrap();

        assert_eq!(first.order_uid, "X1");
        assert_eq!(first, second);
        assert_eq!(h.repository.read_count(), 1);
    }

    #[tokio::test]
    async fn test_get_order_not_found() {
        let h = harness(InMemoryOrderRepository::new());

        let err = h.service.get_order("missing").await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(uid) if uid == "missing"));
        assert!(h.cache.is_empty());
    }

    #[tokio::test]
    async fn test_create_order_stores_then_caches() {
        let h = harness(InMemoryOrderRepository::new());

        let uid = h.service.create_order(sample_order("X2")).await.unwrap();
        assert_eq!(uid, "X2");
        assert!(h.repository.contains("X2").await);

        // Served from cache without touching the store
        assert_ok!(h.service.get_order("X2").await);
        assert_eq!(h.repository.read_count(), 0);
    }

    #[tokio::test]
    async fn test_create_order_rejects_inconsistent_total_price() {
        let h = harness(InMemoryOrderRepository::new());

        let mut order = sample_order("X3");
        order.items[0].price = 100;
        order.items[0].sale = 0;
        order.items[0].total_price = 50;

        let err = h.service.create_order(order).await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
        assert_eq!(h.repository.write_count(), 0);
        assert!(h.cache.get("X3").is_none());
    }

    #[tokio::test]
    async fn test_store_failure_leaves_cache_untouched() {
        let h = harness(InMemoryOrderRepository::new());
        h.repository.set_fail_writes(true);

        let err = h.service.create_order(sample_order("X4")).await.unwrap_err();
        assert!(matches!(err, ServiceError::Storage(_)));
        assert!(h.cache.get("X4").is_none());
    }

    #[tokio::test]
    async fn test_duplicate_order_is_a_storage_conflict() {
        let h = harness(InMemoryOrderRepository::with_orders([sample_order("X5")]));

        let err = h.service.create_order(sample_order("X5")).await.unwrap_err();
        assert!(matches!(err, ServiceError::Storage(StorageError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_start_warms_cache() {
        let h = harness(InMemoryOrderRepository::with_orders([
            sample_order("A"),
            sample_order("B"),
        ]));
        assert_eq!(h.service.state(), ServiceState::Uninitialized);

        assert_ok!(h.service.start().await);
        assert_eq!(h.service.state(), ServiceState::Running);
        assert_eq!(h.cache.len(), 2);

        let loads_after_warmup = h.repository.read_count();
        assert_ok!(h.service.get_order("A").await);
        assert_eq!(h.repository.read_count(), loads_after_warmup);
    }

    #[tokio::test]
    async fn test_start_proceeds_when_warmup_fails() {
        let h = harness(InMemoryOrderRepository::with_orders([sample_order("A")]));
        h.repository.set_fail_loads(true);

        assert_ok!(h.service.start().await);
        assert_eq!(h.service.state(), ServiceState::Running);
        assert!(h.cache.is_empty());
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let h = harness(InMemoryOrderRepository::new());
        assert_ok!(h.service.start().await);

        let err = h.service.start().await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidState(ServiceState::Running)));
    }

    #[tokio::test]
    async fn test_handle_message_decode_error_skips_store() {
        let h = harness(InMemoryOrderRepository::new());

        let err = h.service.handle_message(b"k", b"not json").await.unwrap_err();
        assert!(matches!(err, ServiceError::Decode(_)));
        assert_eq!(h.repository.write_count(), 0);
    }

    #[tokio::test]
    async fn test_handle_message_stores_order() {
        let h = harness(InMemoryOrderRepository::new());
        let payload = serde_json::to_vec(&sample_order("M1")).unwrap();

        assert_ok!(h.service.handle_message(b"M1", &payload).await);
        assert!(h.repository.contains("M1").await);
        assert!(h.cache.get("M1").is_some());
    }

    #[tokio::test]
    async fn test_message_handler_surfaces_errors() {
        let h = harness(InMemoryOrderRepository::new());
        assert_err!(MessageHandler::handle(h.service.as_ref(), b"k", b"{}").await);
    }

    #[tokio::test]
    async fn test_ingestion_end_to_end() {
        let h = harness(InMemoryOrderRepository::new());
        assert_ok!(h.service.start().await);

        let transport = Arc::new(InMemoryTransport::new(&["orders", "orders-retry"]));
        let policy = RetryPolicy::new("orders", "orders-retry", "orders-dlq", 3);
        let consumer = Arc::new(
            RetryingConsumer::new(transport.clone(), policy)
                .with_fetch_error_backoff(Duration::from_millis(5)),
        );

        let payload = serde_json::to_vec(&sample_order("E1")).unwrap();
        transport.push("orders", b"E1", &payload, vec![]);
        transport.push("orders", b"bad", b"{\"order_uid\":", vec![]);

        h.service.spawn_ingestion(consumer);

        let observed = transport.clone();
        wait_until(move || observed.published_to("orders-dlq").len() == 1).await;

        assert!(h.repository.contains("E1").await);
        assert!(h.cache.get("E1").is_some());

        let dead = transport.published_to("orders-dlq");
        assert_eq!(dead[0].key, b"bad".to_vec());
        assert_eq!(dead[0].header(ORIGINAL_TOPIC_HEADER), Some(b"orders".as_slice()));
        assert_eq!(transport.published_to("orders-retry").len(), 3);

        h.service.shutdown(Duration::from_secs(1)).await;
        assert_eq!(h.service.state(), ServiceState::Stopped);
        assert!(transport.is_closed());
        assert!(h.cache.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let h = harness(InMemoryOrderRepository::new());
        assert_ok!(h.service.start().await);

        let mut signal = h.service.shutdown_signal();
        h.service.shutdown(Duration::from_millis(100)).await;
        h.service.shutdown(Duration::from_millis(100)).await;

        assert!(*signal.borrow_and_update());
        assert_eq!(h.service.state(), ServiceState::Stopped);
    }

    fn harness_with_timeouts(
        repository: InMemoryOrderRepository,
        processing_timeout: Duration,
        startup_load_timeout: Duration,
    ) -> Harness {
        let repository = Arc::new(repository);
        let cache = Arc::new(TtlCache::without_expiry());
        let config = IngestionConfig {
            processing_timeout,
            startup_load_timeout,
            ..IngestionConfig::default()
        };
        let service = Arc::new(OrderService::new(repository.clone(), cache.clone(), config));
        Harness {
            service,
            repository,
            cache,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_store_write_times_out() {
        let h = harness(InMemoryOrderRepository::new());
        h.repository.set_latency(Duration::from_secs(60));
        let payload = serde_json::to_vec(&sample_order("T1")).unwrap();

        let started = tokio::time::Instant::now();
        let err = h.service.handle_message(b"T1", &payload).await.unwrap_err();

        assert!(matches!(err, ServiceError::Timeout(t) if t == Duration::from_secs(10)));
        assert!(started.elapsed() < Duration::from_secs(60));
        assert_eq!(h.repository.write_count(), 1);
        assert!(h.cache.get("T1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_processing_timeout_is_configurable() {
        let h = harness_with_timeouts(
            InMemoryOrderRepository::new(),
            Duration::from_secs(1),
            Duration::from_secs(30),
        );
        h.repository.set_latency(Duration::from_secs(2));
        let payload = serde_json::to_vec(&sample_order("T2")).unwrap();

        let err = h.service.handle_message(b"T2", &payload).await.unwrap_err();
        assert!(matches!(err, ServiceError::Timeout(t) if t == Duration::from_secs(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_proceeds_when_warmup_hangs() {
        let h = harness(InMemoryOrderRepository::with_orders([sample_order("A")]));
        h.repository.set_latency(Duration::from_secs(120));

        let started = tokio::time::Instant::now();
        assert_ok!(h.service.start().await);

        assert!(started.elapsed() >= Duration::from_secs(30));
        assert!(started.elapsed() < Duration::from_secs(120));
        assert_eq!(h.service.state(), ServiceState::Running);
        assert!(h.cache.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_survives_panicked_task() {
        let h = harness(InMemoryOrderRepository::new());
        h.service.track(tokio::spawn(async {
            panic!("ingestion task failure");
        }));

        h.service.shutdown(Duration::from_secs(1)).await;
        assert_eq!(h.service.state(), ServiceState::Stopped);
    }

    #[tokio::test]
    async fn test_malformed_price_is_dead_lettered_and_ingestion_continues() {
        let h = harness(InMemoryOrderRepository::new());
        let transport = Arc::new(InMemoryTransport::new(&["orders", "orders-retry"]));
        let consumer = Arc::new(RetryingConsumer::new(
            transport.clone(),
            RetryPolicy::new("orders", "orders-retry", "orders-dlq", 3),
        ));

        let mut extreme = sample_order("P1");
        extreme.items[0].sale = i64::MIN;
        transport.push("orders", b"P1", &serde_json::to_vec(&extreme).unwrap(), vec![]);
        transport.push("orders", b"P2", &serde_json::to_vec(&sample_order("P2")).unwrap(), vec![]);

        h.service.spawn_ingestion(consumer);

        let observed = transport.clone();
        wait_until(move || observed.published_to("orders-dlq").len() == 1).await;
        let observed = transport.clone();
        wait_until(move || observed.committed().len() == 5).await;

        assert!(h.repository.contains("P2").await);
        assert!(!h.repository.contains("P1").await);

        h.service.shutdown(Duration::from_secs(1)).await;
        assert!(transport.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_overrun_still_closes_transport() {
        let h = harness(InMemoryOrderRepository::new());
        h.repository.set_latency(Duration::from_secs(60));

        let transport = Arc::new(InMemoryTransport::new(&["orders"]));
        let consumer = Arc::new(RetryingConsumer::new(
            transport.clone(),
            RetryPolicy::new("orders", "orders-retry", "orders-dlq", 3),
        ));
        let payload = serde_json::to_vec(&sample_order("S1")).unwrap();
        transport.push("orders", b"S1", &payload, vec![]);

        h.service.spawn_ingestion(consumer);

        // the handler is now stuck in the slow store write
        let repository = h.repository.clone();
        wait_until(move || repository.write_count() == 1).await;

        h.service.shutdown(Duration::from_millis(100)).await;
        assert_eq!(h.service.state(), ServiceState::Stopped);
        assert!(transport.is_closed());
    }

    #[tokio::test]
    async fn test_shutdown_stops_idle_consumer() {
        let h = harness(InMemoryOrderRepository::new());
        let transport = Arc::new(InMemoryTransport::new(&["orders"]));
        let consumer = Arc::new(RetryingConsumer::new(
            transport.clone(),
            RetryPolicy::new("orders", "orders-retry", "orders-dlq", 3),
        ));

        h.service.spawn_ingestion(consumer);
        h.service.shutdown(Duration::from_secs(1)).await;

        assert!(transport.is_closed());
        assert!(matches!(transport.fetch().await, Err(messaging::TransportError::Closed)));
    }
}
