use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use domain::Order;
use tokio::sync::RwLock;

use super::OrderRepository;
use crate::StorageError;

/// Map-backed OrderRepository for tests and local runs without PostgreSQL.
///
/// Keeps the same contract as the database: duplicate ids conflict, unknown
/// ids are `NotFound`. Failures can be switched on to exercise error paths.
#[derive(Default)]
pub struct InMemoryOrderRepository {
    orders: RwLock<HashMap<String, Order>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
    fail_writes: AtomicBool,
    fail_loads: AtomicBool,
    latency: Mutex<Duration>,
}

impl InMemoryOrderRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Repository pre-populated with `orders`
    pub fn with_orders(orders: impl IntoIterator<Item = Order>) -> Self {
        let map = orders
            .into_iter()
            .map(|order| (order.order_uid.clone(), order))
            .collect();
        Self {
            orders: RwLock::new(map),
            ..Self::default()
        }
    }

    /// Number of `get_order_by_id` calls served so far
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of `create_order` calls attempted so far
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    /// Delay every write and load by `latency`, as a slow database would.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap_or_else(PoisonError::into_inner) = latency;
    }

    pub async fn contains(&self, order_uid: &str) -> bool {
        self.orders.read().await.contains_key(order_uid)
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.lock().unwrap_or_else(PoisonError::into_inner);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn unavailable() -> StorageError {
        StorageError::DatabaseError(sqlx::Error::PoolTimedOut)
    }
}

#[async_trait]
impl OrderRepository for InMemoryOrderRepository {
    async fn create_order(&self, order: &Order) -> Result<String, StorageError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }

        let mut orders = self.orders.write().await;
        if orders.contains_key(&order.order_uid) {
            return Err(StorageError::Conflict(order.order_uid.clone()));
        }
        orders.insert(order.order_uid.clone(), order.clone());
        Ok(order.order_uid.clone())
    }

    async fn get_order_by_id(&self, order_uid: &str) -> Result<Order, StorageError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.orders
            .read()
            .await
            .get(order_uid)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(order_uid.to_string()))
    }

    async fn get_all_orders(&self) -> Result<Vec<Order>, StorageError> {
        self.simulate_latency().await;
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        Ok(self.orders.read().await.values().cloned().collect())
    }

    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
