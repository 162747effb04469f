//! RiskVet Notification Dispatcher
//!
//! Background service that:
//! 1. Claims deliverable notification rows in batches
//! 2. Pushes them through their channel transports
//! 3. Records outcomes, leaving failed rows for retry
//! 4. Periodically sweeps stale in_progress evaluations to failed

use riskvet_common::{
    config::AppConfig,
    db::{DbPool, PgStore},
    engine::EvaluationEngine,
    metrics::register_metrics,
    notify::{outcome_channels, Dispatcher},
    store::Store,
    VERSION,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn, Level};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(true)
        .json()
        .init();

    info!("Starting RiskVet Notification Dispatcher v{}", VERSION);

    // Load configuration
    let config = AppConfig::load().map_err(|e| {
        tracing::error!(error = %e, "Failed to load configuration");
        e
    })?;

    // Initialize metrics
    register_metrics();
    if config.observability.metrics_port > 0 {
        let metrics_addr =
            SocketAddr::from(([0, 0, 0, 0], config.observability.metrics_port));
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(metrics_addr)
            .install()?;
        info!("Metrics exporter listening on {}", metrics_addr);
    }

    // Initialize database connection
    info!("Connecting to database...");
    let pool = DbPool::new(&config.database).await?;
    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool));

    let dispatcher = Dispatcher::from_config(store.clone(), &config.notifications)?;

    // The sweep is a terminal transition, so the engine needs the same
    // outcome channels the gateway uses
    let engine = EvaluationEngine::new(store.clone(), outcome_channels(&config.notifications));

    let interval = config.dispatch_interval();
    let stale_timeout = chrono::Duration::from_std(config.stale_timeout())
        .unwrap_or_else(|_| chrono::Duration::hours(1));
    let sweep_every = config.notifications.sweep_every_cycles.max(1);

    info!(
        interval_secs = interval.as_secs(),
        sweep_every_cycles = sweep_every,
        "Dispatcher ready, starting delivery cycles..."
    );

    // Circuit breaker state
    let mut consecutive_failures = 0u32;
    const MAX_FAILURES: u32 = 5;
    const CIRCUIT_BREAK_DURATION: std::time::Duration = std::time::Duration::from_secs(30);

    let mut cycle: u64 = 0;
    let mut ticker = tokio::time::interval(interval);

    loop {
        // Circuit breaker check
        if consecutive_failures >= MAX_FAILURES {
            warn!(
                failures = consecutive_failures,
                "Circuit breaker open, pausing..."
            );
            tokio::time::sleep(CIRCUIT_BREAK_DURATION).await;
            consecutive_failures = 0;
            info!("Circuit breaker reset, resuming...");
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
            _ = ticker.tick() => {
                cycle += 1;

                match dispatcher.dispatch_pending().await {
                    Ok(stats) => {
                        consecutive_failures = 0;
                        if stats.claimed > 0 {
                            info!(
                                cycle,
                                claimed = stats.claimed,
                                sent = stats.sent,
                                failed = stats.failed,
                                "Delivery cycle complete"
                            );
                        }
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        error!(
                            error = %e,
                            failures = consecutive_failures,
                            "Delivery cycle failed"
                        );
                    }
                }

                if cycle % sweep_every == 0 {
                    match engine.fail_stale(stale_timeout).await {
                        Ok(swept) if swept > 0 => {
                            metrics::counter!("riskvet_evaluations_swept_total")
                                .increment(swept);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!(error = %e, "Stale evaluation sweep failed");
                        }
                    }
                }
            }
        }
    }

    info!("Dispatcher shutting down");
    Ok(())
}
