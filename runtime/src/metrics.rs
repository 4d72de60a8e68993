//! Prometheus exporter and metric catalogue.
//!
//! Metrics are recorded with the `metrics` macros where the work happens (the
//! ledger services, the publisher, the stores). [`MetricsServer::start`]
//! installs the Prometheus recorder, serves `/metrics` over HTTP and describes
//! every metric the workspace emits.
//!
//! ```rust,no_run
//! use tuneshare_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use thiserror::Error;

/// Errors from installing the exporter.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// The exporter could not be configured.
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Another recorder is already installed.
    #[error("Failed to install metrics recorder: {0}")]
    Install(String),
}

/// Prometheus scrape endpoint.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Server that will listen on `addr`.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the global recorder and start serving `/metrics`.
    ///
    /// Must be called from inside a Tokio runtime; the HTTP listener runs as a
    /// spawned task.
    ///
    /// # Errors
    ///
    /// [`MetricsError::Build`] for invalid bucket configuration or an unbindable
    /// address; [`MetricsError::Install`] if a recorder is already installed.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;
        let handle = recorder.handle();
        metrics::set_global_recorder(recorder).map_err(|e| MetricsError::Install(e.to_string()))?;

        tokio::spawn(async move {
            // `ExporterError` implements neither `Debug` nor `Display`.
            if exporter.await.is_err() {
                tracing::error!("Metrics listener stopped");
            }
        });

        describe_all();
        self.handle = Some(handle);
        tracing::info!(addr = %self.addr, "Metrics available at http://{}/metrics", self.addr);
        Ok(())
    }

    /// Current metrics in Prometheus text format; `None` before [`Self::start`].
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Describe every metric emitted by the workspace.
pub fn describe_all() {
    // Outbox publisher
    describe_counter!("outbox.claimed.total", "Outbox entries claimed for delivery");
    describe_counter!("outbox.published.total", "Outbox entries delivered to the channel");
    describe_counter!(
        "outbox.delivery_failures.total",
        "Delivery attempts that failed and consumed a retry"
    );
    describe_counter!(
        "outbox.dead_lettered.total",
        "Outbox entries moved to the dead-letter queue"
    );
    describe_counter!(
        "outbox.released.total",
        "Claimed entries released unattempted while the circuit was open"
    );
    describe_counter!(
        "outbox.reclaimed.total",
        "Stale processing entries reclaimed as failed attempts"
    );
    describe_counter!("outbox.cleaned.total", "Published entries purged after retention");
    describe_counter!(
        "outbox.store.retries.total",
        "Outbox store calls retried after a transient failure"
    );
    describe_counter!(
        "outbox.requeued.total",
        "Dead-lettered entries returned to pending by an operator"
    );
    describe_counter!(
        "outbox.discarded.total",
        "Dead-lettered entries deleted by an operator"
    );
    describe_gauge!("outbox.entries", "Outbox entries by status");
    describe_gauge!(
        "outbox.publisher.circuit_state",
        "Delivery circuit state (0 closed, 1 half-open, 2 open)"
    );
    describe_histogram!(
        "outbox.publish.duration_seconds",
        "Time taken to deliver one entry to the channel"
    );
    describe_histogram!("outbox.sweep.duration_seconds", "Time taken by one publisher sweep");

    // Event consumer
    describe_counter!(
        "consumer.envelopes.total",
        "Deliveries by outcome: handled, dead_lettered or abandoned"
    );
    describe_counter!(
        "consumer.subscription_errors.total",
        "Subscription items that were errors instead of deliveries"
    );

    // Delivery channel
    describe_histogram!(
        "redpanda.publish.duration_seconds",
        "Time until the broker acknowledged a publish"
    );
    describe_counter!(
        "redpanda.decode_failures.total",
        "Consumed messages that were not valid envelopes"
    );

    // Event store
    describe_counter!("event_store.appended.total", "Events appended to the event store");
    describe_counter!(
        "event_store.conflicts.total",
        "Appends rejected for a stale expected version"
    );

    // Reward pools and listen sessions
    describe_counter!("ledger.pools.opened.total", "Reward pools opened");
    describe_counter!(
        "ledger.pool.reservations.total",
        "Reservation attempts by outcome (granted or denied)"
    );
    describe_counter!(
        "ledger.pool.tokens_distributed.total",
        "Token units committed to listeners"
    );
    describe_counter!("ledger.pool.releases.total", "Reservations released");
    describe_counter!("ledger.pool.depleted.total", "Pools that crossed the depletion threshold");
    describe_gauge!("ledger.pool.available_tokens", "Token units available in a pool");
    describe_counter!("ledger.sessions.started.total", "Listen sessions started");
    describe_counter!(
        "ledger.sessions.resolved.total",
        "Listen sessions resolved by outcome (rewarded or failed)"
    );

    // Distribution and payments
    describe_counter!("ledger.distributions.total", "Revenue distributions created");
    describe_counter!(
        "ledger.distributions.revenue_cents.total",
        "Revenue distributed, in minor currency units"
    );
    describe_counter!("ledger.payments.total", "Gateway payments by outcome");
    describe_counter!("ledger.batches.settled.total", "Payment batches settled by status");
}
