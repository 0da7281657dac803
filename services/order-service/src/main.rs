use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use common::config::AppConfig;
use common::telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig};
use futures_util::stream::StreamExt;
use messaging::{KafkaTransport, RetryPolicy, RetryingConsumer};
use signal_hook::consts::signal::*;
use signal_hook_tokio::Signals;
use sqlx::postgres::PgPoolOptions;
use storage::{OrderCache, OrderRepository, PostgresOrderRepository, TtlCache};
use tokio::sync::watch;
use tracing::{error, info, warn};

mod handlers;
mod routes;
mod service;
mod state;

use service::OrderService;
use state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::from_env();

    init_telemetry(TelemetryConfig::from_env("order-service"))
        .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;

    info!("Starting Order Service...");
    info!("Configuration:");
    info!("  Kafka brokers: {}", config.kafka.brokers);
    info!(
        "  Topics: {} (retry: {}, dlq: {})",
        config.kafka.topic, config.kafka.retry_topic, config.kafka.dlq_topic
    );
    info!("  Cache TTL: {:?}", config.cache.ttl);
    info!("  Port: {}", config.server.port);

    // Connect to database
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await?;
    info!("Database connected");

    let repository: Arc<dyn OrderRepository> = Arc::new(PostgresOrderRepository::new(pool.clone()));
    let cache: Arc<dyn OrderCache> = Arc::new(TtlCache::new(config.cache.ttl));

    let service = Arc::new(OrderService::new(
        repository.clone(),
        cache,
        config.ingestion.clone(),
    ));
    service.start().await?;

    // Consume both the source and retry topics; the retry header tells them apart
    let transport = Arc::new(KafkaTransport::new(
        &config.kafka.brokers,
        &config.kafka.group_id,
        &[config.kafka.topic.as_str(), config.kafka.retry_topic.as_str()],
    )?);
    let policy = RetryPolicy::new(
        config.kafka.topic.as_str(),
        config.kafka.retry_topic.as_str(),
        config.kafka.dlq_topic.as_str(),
        config.ingestion.max_retries,
    );
    let consumer = Arc::new(
        RetryingConsumer::new(transport, policy)
            .with_fetch_error_backoff(config.ingestion.fetch_error_backoff),
    );
    service.spawn_ingestion(consumer);

    // Setup signal handling
    let signals = Signals::new([SIGTERM, SIGINT])?;
    let signals_handle = signals.handle();

    let app = routes::create_router(AppState::new(service.clone(), repository));
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Order service listening on {}", addr);

    let server = tokio::spawn(
        axum::serve(listener, app)
            .with_graceful_shutdown(cancelled(service.shutdown_signal()))
            .into_future(),
    );

    wait_for_signal(signals).await;
    info!("Received shutdown signal, stopping...");

    let grace = config.server.shutdown_grace;
    service.begin_shutdown();

    match tokio::time::timeout(grace, server).await {
        Ok(Ok(Ok(()))) => info!("HTTP server stopped"),
        Ok(Ok(Err(e))) => error!("Server error: {}", e),
        Ok(Err(e)) => error!("Server task failed: {}", e),
        Err(_) => warn!("HTTP server did not drain within {:?}", grace),
    }

    service.shutdown(grace).await;

    signals_handle.close();
    pool.close().await;
    shutdown_telemetry();

    info!("Order service shut down");
    Ok(())
}

async fn wait_for_signal(mut signals: Signals) {
    while let Some(signal) = signals.next().await {
        match signal {
            SIGTERM | SIGINT => return,
            _ => {}
        }
    }
}

async fn cancelled(mut shutdown: watch::Receiver<bool>) {
    // An Err means the sender is gone, which is also a shutdown
    let _ = shutdown.wait_for(|stopped| *stopped).await;
}
