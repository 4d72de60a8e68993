//! Tuneshare background worker.
//!
//! Runs, against one database and one broker:
//! - the outbox publisher, delivering staged events to Redpanda
//! - the revenue consumer, turning closed royalty periods into distributions
//! - the payment batch sweep, paying out open batches
//!
//! All three coordinate only through the database; any number of workers can
//! run side by side.

mod config;

use anyhow::Context;
use config::Config;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tuneshare_core::environment::{Clock, SystemClock};
use tuneshare_core::event::EventMetadata;
use tuneshare_core::event_bus::EventBus;
use tuneshare_ledger::distribution::{RevenueDistributor, RevenueEventHandler};
use tuneshare_ledger::payments::{BatchOrchestrator, MockPaymentGateway};
use tuneshare_postgres::{PostgresLedgerStore, PostgresOutbox};
use tuneshare_redpanda::RedpandaEventBus;
use tuneshare_runtime::{EventConsumer, MetricsServer, OutboxPublisher};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tuneshare=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    info!(
        redpanda_brokers = %config.redpanda.brokers,
        topic_prefix = %config.redpanda.topic_prefix,
        "Configuration loaded"
    );

    let mut metrics = MetricsServer::new(config.metrics_addr().context("invalid metrics address")?);
    metrics.start().context("failed to start metrics server")?;

    let pool = tuneshare_postgres::connect(&config.pool_settings())
        .await
        .context("failed to connect to the database")?;
    tuneshare_postgres::migrate(&pool)
        .await
        .context("failed to apply migrations")?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let ledger = Arc::new(PostgresLedgerStore::with_clock(pool.clone(), clock.clone()));
    let outbox = Arc::new(PostgresOutbox::new(pool));
    let bus: Arc<dyn EventBus> = Arc::new(
        RedpandaEventBus::builder()
            .brokers(&config.redpanda.brokers)
            .client_id(&config.redpanda.client_id)
            .topic_prefix(&config.redpanda.topic_prefix)
            .consumer_group(&config.redpanda.consumer_group)
            .build()
            .context("failed to create the Redpanda producer")?,
    );

    let fees = config.fee_schedule().map_err(anyhow::Error::msg)?;
    let consumer = EventConsumer::new(
        RevenueEventHandler::new(RevenueDistributor::new(ledger.clone(), clock.clone(), fees)),
        bus.clone(),
        config.consumer_retry(),
    );
    warn!("No payment provider configured; payouts go to the sandbox gateway");
    let orchestrator = BatchOrchestrator::new(
        ledger,
        MockPaymentGateway::shared(),
        clock.clone(),
        config.orchestrator_config(),
    );
    let publisher = OutboxPublisher::new(outbox, bus.clone(), clock, config.publisher_config());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tasks: Vec<(&str, JoinHandle<()>)> = vec![
        ("outbox publisher", {
            let shutdown = shutdown_rx.clone();
            tokio::spawn(async move { publisher.run(shutdown).await })
        }),
        ("revenue consumer", {
            let shutdown = shutdown_rx.clone();
            tokio::spawn(async move {
                if let Err(e) = consumer.run(shutdown).await {
                    error!(error = %e, "Revenue consumer failed");
                }
            })
        }),
        (
            "payment batch sweep",
            tokio::spawn(sweep_batches(
                orchestrator,
                Duration::from_secs(config.payments.sweep_interval),
                config.payments.batch_limit,
                shutdown_rx,
            )),
        ),
    ];
    info!(tasks = tasks.len(), "Worker started");

    shutdown_signal().await;
    shutdown_tx.send_replace(true);

    let grace = Duration::from_secs(config.shutdown_timeout);
    let drained = tokio::time::timeout(grace, async {
        for (name, handle) in tasks {
            if let Err(e) = handle.await {
                error!(task = name, error = %e, "Task ended abnormally");
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!(timeout_secs = config.shutdown_timeout, "Shutdown timed out; exiting anyway");
    }
    info!("Worker stopped");
    Ok(())
}

/// Pay out open batches every `interval` until shutdown.
async fn sweep_batches(
    orchestrator: BatchOrchestrator,
    interval: Duration,
    limit: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let metadata = EventMetadata::correlated().with_actor("batch-sweep");
                match orchestrator.process_pending(limit, metadata).await {
                    Ok(reports) if !reports.is_empty() => {
                        info!(batches = reports.len(), "Payment batch sweep finished");
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Payment batch sweep failed"),
                }
            }
        }
    }
    info!("Payment batch sweep stopped");
}

/// Waits for Ctrl+C (SIGINT) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C signal, shutting down gracefully..."),
        () = terminate => info!("Received SIGTERM signal, shutting down gracefully..."),
    }
}
