mod app;
mod config;
mod core;

use std::sync::Arc;

use anyhow::{Context, Result};
use app::AppState;
use config::Config;
use core::registry::HealthThresholds;
use core::{ConsumptionConfig, ConsumptionLoop, Dispatcher, RedisLogClient, Registry, Router, RetryPark};
use frame_helpers::metrics::LoggingMetricsSink;
use frame_helpers::{logging, shutdown};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    logging::init_logging(
        "frame_orchestrator=info,redis=warn,tokio=warn",
        "FRAME_ORCHESTRATOR_LOG",
        "frame-orchestrator",
    );

    let config = Config::load().context("failed to load configuration")?;
    let consumer_id = config.consumer_id();

    let log_client = Arc::new(
        RedisLogClient::connect(&config.redis_url)
            .await
            .context("failed to connect to redis")?,
    );
    let registry = Arc::new(Registry::new());
    let metrics = Arc::new(LoggingMetricsSink);

    let state = AppState {
        registry: registry.clone(),
        log_client: log_client.clone(),
        metrics: metrics.clone(),
        shutdown: CancellationToken::new(),
        config: Arc::new(config.clone()),
    };

    info!(
        listen = %config.listen,
        upstream_stream = %config.upstream_stream,
        consumer_id = %consumer_id,
        "orchestrator starting"
    );

    tokio::spawn(shutdown::listen_shutdown(state.shutdown.clone()));

    tokio::spawn(core::run_health_monitor(
        registry.clone(),
        HealthThresholds {
            heartbeat_timeout: config.heartbeat_timeout,
            failure_threshold: config.failure_threshold,
            circuit_cooldown: config.circuit_cooldown,
            circuit_cooldown_cap: config.circuit_cooldown_cap,
            eviction_grace: config.eviction_grace,
        },
        config.health_tick,
        metrics.clone(),
        state.shutdown.clone(),
    ));

    let router = Router::new(registry.clone(), config.max_routing_attempts);
    let dispatcher = Dispatcher::new(
        log_client.clone(),
        registry.clone(),
        config.max_dispatch_retries,
        config.queue_cap_multiplier,
        metrics.clone(),
    );
    let retry_park = Arc::new(RetryPark::new(config.retry_park_cap));

    let consumption = ConsumptionLoop::new(
        log_client.clone(),
        router,
        dispatcher,
        retry_park,
        metrics.clone(),
        ConsumptionConfig {
            upstream_stream: config.upstream_stream.clone(),
            consumer_group: config.consumer_group.clone(),
            consumer_id,
            dlq_stream: config.dlq_stream.clone(),
            batch_size: config.batch_size,
            block_ms: config.block_ms,
            claim_idle_ms: config.claim_idle_ms,
            housekeeping_interval: config.housekeeping_interval,
            max_routing_attempts: config.max_routing_attempts,
        },
    );

    let consumption_shutdown = state.shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = consumption.run(consumption_shutdown).await {
            tracing::error!(error = %err, "consumption loop exited with error");
        }
    });

    core::run_control_server(&config.listen, state).await
}
