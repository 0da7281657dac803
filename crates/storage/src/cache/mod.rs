pub mod ttl_cache;

pub use ttl_cache::TtlCache;

use std::sync::Arc;

use domain::Order;

/// Read-through cache in front of the order store.
///
/// Best-effort only: nothing here can fail, and a miss is never an error.
pub trait OrderCache: Send + Sync {
    /// Store or overwrite the entry for `order.order_uid`, restarting its TTL.
    fn set(&self, order: Order);

    /// Return the live entry for `order_uid`, evicting it if it has expired.
    fn get(&self, order_uid: &str) -> Option<Arc<Order>>;

    /// Bulk load for startup warm-up; each entry gets a fresh TTL.
    fn setup_cache(&self, orders: Vec<Order>);

    /// Stop background eviction and drop all entries. Safe to call repeatedly.
    fn close(&self);
}
