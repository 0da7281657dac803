use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_gauge, CounterVec, Encoder,
    HistogramVec, IntGauge, TextEncoder,
};

lazy_static! {
    // Ingestion metrics
    pub static ref MESSAGE_COUNTER: CounterVec = register_counter_vec!(
        "orders_ingested_messages_total",
        "Total number of consumed messages by outcome",
        &["outcome"]
    )
    .expect("metric cannot be created");

    pub static ref MESSAGE_DURATION: HistogramVec = register_histogram_vec!(
        "orders_message_duration_seconds",
        "Message handling duration in seconds",
        &["outcome"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .expect("metric cannot be created");

    pub static ref FETCH_ERRORS: CounterVec = register_counter_vec!(
        "orders_fetch_errors_total",
        "Total number of transport fetch errors",
        &["topic"]
    )
    .expect("metric cannot be created");

    // Cache metrics
    pub static ref CACHE_HIT_COUNTER: CounterVec = register_counter_vec!(
        "orders_cache_requests_total",
        "Total number of cache requests",
        &["cache_type", "status"]
    )
    .expect("metric cannot be created");

    pub static ref CACHE_WARMUP_SIZE: IntGauge = register_int_gauge!(
        "orders_cache_warmup_entries",
        "Number of orders loaded into the cache at startup"
    )
    .expect("metric cannot be created");

    // Store metrics
    pub static ref STORE_OPERATIONS: CounterVec = register_counter_vec!(
        "orders_store_operations_total",
        "Total number of order store operations",
        &["operation", "status"]
    )
    .expect("metric cannot be created");

    pub static ref STORE_DURATION: HistogramVec = register_histogram_vec!(
        "orders_store_duration_seconds",
        "Order store operation duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .expect("metric cannot be created");
}

/// What happened to a consumed message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    Success,
    Retried,
    DeadLettered,
}

impl MessageOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageOutcome::Success => "success",
            MessageOutcome::Retried => "retried",
            MessageOutcome::DeadLettered => "dead_lettered",
        }
    }
}

/// Get all metrics in Prometheus text format
pub fn gather_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Helper function to record a handled message
pub fn record_message(outcome: MessageOutcome, duration_secs: f64) {
    MESSAGE_COUNTER
        .with_label_values(&[outcome.as_str()])
        .inc();
    MESSAGE_DURATION
        .with_label_values(&[outcome.as_str()])
        .observe(duration_secs);
}

pub fn record_fetch_error(topic: &str) {
    FETCH_ERRORS.with_label_values(&[topic]).inc();
}

/// Helper function to record cache hit/miss
pub fn record_cache_request(cache_type: &str, hit: bool) {
    let status = if hit { "hit" } else { "miss" };
    CACHE_HIT_COUNTER
        .with_label_values(&[cache_type, status])
        .inc();
}

pub fn record_cache_warmup(entries: usize) {
    CACHE_WARMUP_SIZE.set(entries as i64);
}

/// Helper function to record order store operation
pub fn record_store_operation(operation: &str, success: bool, duration_secs: f64) {
    let status = if success { "success" } else { "error" };
    STORE_OPERATIONS
        .with_label_values(&[operation, status])
        .inc();
    STORE_DURATION
        .with_label_values(&[operation])
        .observe(duration_secs);
}
