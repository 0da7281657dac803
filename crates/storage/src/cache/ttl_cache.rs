use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use common::metrics;
use domain::Order;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::OrderCache;

struct CacheEntry {
    order: Arc<Order>,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if now >= at)
    }
}

type EntryMap = HashMap<String, CacheEntry>;

/// In-process order cache with per-entry expiry.
///
/// Entries expire `ttl` after their last write. Expired entries are dropped
/// lazily by `get` and eagerly by a background sweep that runs every `ttl`,
/// so keys that are never read again still get released. A zero `ttl`
/// disables both and keeps entries until `close`.
pub struct TtlCache {
    entries: Arc<RwLock<EntryMap>>,
    ttl: Option<Duration>,
    shutdown: watch::Sender<bool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl TtlCache {
    /// Create a cache. With a non-zero `ttl` the sweep task is spawned on the
    /// current Tokio runtime; outside a runtime only lazy expiry applies.
    pub fn new(ttl: Duration) -> Self {
        let entries = Arc::new(RwLock::new(HashMap::new()));
        let ttl = (!ttl.is_zero()).then_some(ttl);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let sweeper = match (ttl, tokio::runtime::Handle::try_current()) {
            (Some(period), Ok(handle)) => Some(handle.spawn(sweep_loop(
                Arc::clone(&entries),
                period,
                shutdown_rx,
            ))),
            (Some(_), Err(_)) => {
                warn!("No Tokio runtime available, cache sweep disabled; relying on lazy expiry");
                None
            }
            (None, _) => None,
        };

        info!(ttl_ms = ttl.map(|t| t.as_millis() as u64).unwrap_or(0), "Order cache initialized");

        Self {
            entries,
            ttl,
            shutdown,
            sweeper: Mutex::new(sweeper),
        }
    }

    /// Cache whose entries never expire.
    pub fn without_expiry() -> Self {
        Self::new(Duration::ZERO)
    }

    /// Number of stored entries, expired or not.
    pub fn len(&self) -> usize {
        read(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every expired entry and return how many were dropped.
    pub fn purge_expired(&self) -> usize {
        purge(&self.entries, Instant::now())
    }

    fn expiry(&self, now: Instant) -> Option<Instant> {
        self.ttl.map(|ttl| now + ttl)
    }
}

impl OrderCache for TtlCache {
    fn set(&self, order: Order) {
        let now = Instant::now();
        let key = order.order_uid.clone();
        let entry = CacheEntry {
            order: Arc::new(order),
            expires_at: self.expiry(now),
        };

        write(&self.entries).insert(key, entry);
    }

    fn get(&self, order_uid: &str) -> Option<Arc<Order>> {
        let now = Instant::now();

        {
            let entries = read(&self.entries);
            match entries.get(order_uid) {
                None => {
                    metrics::record_cache_request("memory", false);
                    return None;
                }
                Some(entry) if !entry.is_expired(now) => {
                    metrics::record_cache_request("memory", true);
                    return Some(Arc::clone(&entry.order));
                }
                Some(_) => {}
            }
        }

        // Re-check under the write lock: a concurrent `set` may have refreshed the key.
        let mut entries = write(&self.entries);
        if entries.get(order_uid).is_some_and(|entry| entry.is_expired(now)) {
            entries.remove(order_uid);
            debug!(order_uid, "Evicted expired cache entry on read");
        }
        metrics::record_cache_request("memory", false);
        None
    }

    fn setup_cache(&self, orders: Vec<Order>) {
        let now = Instant::now();
        let count = orders.len();

        let mut entries = write(&self.entries);
        for order in orders {
            let entry = CacheEntry {
                expires_at: self.expiry(now),
                order: Arc::new(order),
            };
            entries.insert(entry.order.order_uid.clone(), entry);
        }
        drop(entries);

        metrics::record_cache_warmup(count);
        info!(count, "Order cache warmed up");
    }

    fn close(&self) {
        // send only fails once the sweep task is gone, which is fine here
        let _ = self.shutdown.send(true);

        let handle = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
            info!("Order cache sweep stopped");
        }
        write(&self.entries).clear();
    }
}

async fn sweep_loop(entries: Arc<RwLock<EntryMap>>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!("Cache sweep stopped");
                    return;
                }
            }
            _ = ticker.tick() => {
                let removed = purge(&entries, Instant::now());
                if removed > 0 {
                    debug!(removed, "Cache sweep removed expired entries");
                }
            }
        }
    }
}

fn purge(entries: &RwLock<EntryMap>, now: Instant) -> usize {
    let mut entries = write(entries);
    let before = entries.len();
    entries.retain(|_, entry| !entry.is_expired(now));
    before - entries.len()
}

fn read(entries: &RwLock<EntryMap>) -> RwLockReadGuard<'_, EntryMap> {
    entries.read().unwrap_or_else(PoisonError::into_inner)
}

fn write(entries: &RwLock<EntryMap>) -> RwLockWriteGuard<'_, EntryMap> {
    entries.write().unwrap_or_else(PoisonError::into_inner)
}
