//! Outbox publisher.
//!
//! Drains the outbox onto the event channel. Each sweep claims a batch
//! (oldest `occurred_at` first), publishes every entry keyed by its aggregate
//! ID, and records the outcome:
//!
//! - delivered: `published`, never sent again
//! - channel error: `failed` with one retry consumed, or `dead_letter` once the
//!   entry's budget is spent
//! - circuit open: released back to its previous status without consuming a retry
//!
//! Delivery is at least once. A crash between publish and `mark_published`
//! leaves the entry `processing`; [`OutboxPublisher::reclaim_stale`] turns it
//! into a failed attempt and it is delivered again. Consumers deduplicate on
//! [`Envelope::outbox_id`](tuneshare_core::event_bus::Envelope::outbox_id).

use crate::circuit_breaker::{BreakerConfig, CircuitBreaker};
use crate::retry::{RetryPolicy, retry_transient};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tuneshare_core::environment::Clock;
use tuneshare_core::event_bus::{EventBus, EventBusError};
use tuneshare_core::outbox::{OutboxEntry, OutboxError, OutboxStatus, OutboxStore};

/// Publisher failures.
#[derive(Error, Debug)]
pub enum PublisherError {
    /// The outbox store failed after retries.
    #[error("Outbox store error: {0}")]
    Store(#[from] OutboxError),

    /// The channel rejected a delivery.
    #[error("Delivery failed: {0}")]
    Delivery(#[from] EventBusError),

    /// Delivery skipped because the circuit is open.
    #[error("Delivery circuit is open")]
    CircuitOpen,
}

/// Publisher settings.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Entries claimed per sweep.
    pub batch_size: usize,
    /// Pause between sweeps.
    pub poll_interval: Duration,
    /// Age after which a `processing` claim is presumed abandoned.
    pub stale_after: chrono::Duration,
    /// Days published entries are kept before cleanup.
    pub retention_days: u32,
    /// Run cleanup every this many ticks.
    pub cleanup_every: u32,
    /// Backoff for transient store failures.
    pub store_retry: RetryPolicy,
    /// Delivery circuit thresholds.
    pub breaker: BreakerConfig,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_secs(1),
            stale_after: chrono::Duration::minutes(5),
            retention_days: 7,
            cleanup_every: 3_600,
            store_retry: RetryPolicy::default(),
            breaker: BreakerConfig::default(),
        }
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Entries claimed.
    pub claimed: u64,
    /// Entries delivered.
    pub published: u64,
    /// Entries that failed and will be retried.
    pub failed: u64,
    /// Entries that failed for the last time.
    pub dead_lettered: u64,
    /// Entries released unattempted.
    pub released: u64,
    /// Stale claims reclaimed before the sweep.
    pub reclaimed: u64,
}

impl SweepReport {
    /// Whether the sweep did nothing.
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        self.claimed == 0 && self.reclaimed == 0
    }
}

/// Outbox-to-channel publisher.
#[derive(Clone)]
pub struct OutboxPublisher {
    outbox: Arc<dyn OutboxStore>,
    bus: Arc<dyn EventBus>,
    clock: Arc<dyn Clock>,
    breaker: CircuitBreaker,
    config: PublisherConfig,
}

impl OutboxPublisher {
    /// Publisher over `outbox` and `bus`.
    #[must_use]
    pub fn new(
        outbox: Arc<dyn OutboxStore>,
        bus: Arc<dyn EventBus>,
        clock: Arc<dyn Clock>,
        config: PublisherConfig,
    ) -> Self {
        let breaker = CircuitBreaker::new(config.breaker);
        Self {
            outbox,
            bus,
            clock,
            breaker,
            config,
        }
    }

    /// Delivery circuit breaker.
    #[must_use]
    pub const fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Claim one batch and deliver it.
    ///
    /// Per-entry delivery failures are recorded on the entry, not returned.
    ///
    /// # Errors
    ///
    /// [`PublisherError::Store`] if the batch cannot be claimed.
    pub async fn sweep(&self) -> Result<SweepReport, PublisherError> {
        let started = Instant::now();
        let limit = self.config.batch_size;
        let claimed = self
            .store_call("claim_batch", || self.outbox.claim_batch(limit, self.clock.now()))
            .await?;

        let mut report = SweepReport {
            claimed: claimed.len() as u64,
            ..SweepReport::default()
        };
        if claimed.is_empty() {
            return Ok(report);
        }
        metrics::counter!("outbox.claimed.total").increment(report.claimed);

        for entry in &claimed {
            match self.publish_entry(entry).await {
                Ok(()) => report.published += 1,
                Err(PublisherError::CircuitOpen) => report.released += 1,
                Err(PublisherError::Delivery(e)) => match self.record_failure(entry, &e).await {
                    Some(OutboxStatus::DeadLetter) => report.dead_lettered += 1,
                    Some(_) => report.failed += 1,
                    None => {}
                },
                Err(PublisherError::Store(e)) => {
                    tracing::error!(
                        outbox_id = %entry.id,
                        error = %e,
                        "Outbox state update failed; entry stays claimed until reclaimed"
                    );
                }
            }
        }

        metrics::histogram!("outbox.sweep.duration_seconds").record(started.elapsed().as_secs_f64());
        tracing::debug!(
            claimed = report.claimed,
            published = report.published,
            failed = report.failed,
            dead_lettered = report.dead_lettered,
            released = report.released,
            "Outbox sweep finished"
        );
        Ok(report)
    }

    /// Deliver one claimed entry and mark it published.
    ///
    /// # Errors
    ///
    /// - [`PublisherError::CircuitOpen`]: the entry was released unattempted
    /// - [`PublisherError::Delivery`]: the channel rejected it; the entry is
    ///   still claimed and the caller records the failure
    /// - [`PublisherError::Store`]: the outcome could not be recorded
    pub async fn publish_entry(&self, entry: &OutboxEntry) -> Result<(), PublisherError> {
        if !self.breaker.allow().await {
            self.store_call("release", || self.outbox.release(entry.id))
                .await?;
            metrics::counter!("outbox.released.total").increment(1);
            return Err(PublisherError::CircuitOpen);
        }

        let started = Instant::now();
        let envelope = entry.envelope();
        if let Err(e) = self.bus.publish(&entry.routing_key, &envelope).await {
            self.breaker.record_failure().await;
            return Err(e.into());
        }
        self.breaker.record_success().await;
        metrics::histogram!("outbox.publish.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        self.store_call("mark_published", || {
            self.outbox.mark_published(entry.id, self.clock.now())
        })
        .await?;
        metrics::counter!("outbox.published.total", "topic" => entry.routing_key.clone())
            .increment(1);
        tracing::debug!(
            outbox_id = %entry.id,
            aggregate_id = %entry.aggregate_id,
            event_type = %entry.event.event_type,
            topic = %entry.routing_key,
            "Outbox entry published"
        );
        Ok(())
    }

    /// Move abandoned `processing` claims back into the retry pool.
    ///
    /// # Errors
    ///
    /// [`PublisherError::Store`] on store failure.
    pub async fn reclaim_stale(&self) -> Result<u64, PublisherError> {
        let stale_before = self.clock.now() - self.config.stale_after;
        let reclaimed = self
            .store_call("reclaim_stale", || self.outbox.reclaim_stale(stale_before))
            .await?;
        if reclaimed > 0 {
            tracing::warn!(reclaimed, "Reclaimed stale outbox claims");
            metrics::counter!("outbox.reclaimed.total").increment(reclaimed);
        }
        Ok(reclaimed)
    }

    /// Purge published entries older than the retention window.
    ///
    /// # Errors
    ///
    /// [`PublisherError::Store`] on store failure.
    pub async fn cleanup(&self) -> Result<u64, PublisherError> {
        let days = self.config.retention_days;
        let removed = self
            .store_call("cleanup_old_events", || {
                self.outbox.cleanup_old_events(days, self.clock.now())
            })
            .await?;
        if removed > 0 {
            tracing::info!(removed, retention_days = days, "Purged published outbox entries");
            metrics::counter!("outbox.cleaned.total").increment(removed);
        }
        Ok(removed)
    }

    /// One scheduler tick: reclaim, sweep, and optionally clean up.
    ///
    /// # Errors
    ///
    /// [`PublisherError::Store`] on store failure.
    pub async fn tick(&self, cleanup: bool) -> Result<SweepReport, PublisherError> {
        let reclaimed = self.reclaim_stale().await?;
        let mut report = self.sweep().await?;
        report.reclaimed = reclaimed;
        if cleanup {
            self.cleanup().await?;
        }
        self.record_backlog().await;
        Ok(report)
    }

    /// Sweep on `poll_interval` until `shutdown` flips to `true`.
    ///
    /// Tick errors are logged and the loop keeps going; the entry currently
    /// being delivered is finished before shutdown returns.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let every = self.config.cleanup_every.max(1);
        let mut ticks: u32 = 0;
        tracing::info!(
            batch_size = self.config.batch_size,
            poll_interval_ms = u64::try_from(self.config.poll_interval.as_millis()).unwrap_or(u64::MAX),
            "Outbox publisher started"
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    ticks = ticks.wrapping_add(1);
                    if let Err(e) = self.tick(ticks % every == 0).await {
                        tracing::error!(error = %e, "Outbox publisher tick failed");
                    }
                }
            }
        }
        tracing::info!("Outbox publisher stopped");
    }

    async fn record_failure(&self, entry: &OutboxEntry, error: &EventBusError) -> Option<OutboxStatus> {
        let message = error.to_string();
        let status = match self
            .store_call("mark_failed", || self.outbox.mark_failed(entry.id, message.clone()))
            .await
        {
            Ok(status) => status,
            Err(e) => {
                tracing::error!(outbox_id = %entry.id, error = %e, "Could not record delivery failure");
                return None;
            }
        };

        if status == OutboxStatus::DeadLetter {
            tracing::error!(
                outbox_id = %entry.id,
                aggregate_id = %entry.aggregate_id,
                event_type = %entry.event.event_type,
                attempts = entry.retry_count + 1,
                error = %message,
                "Outbox entry dead-lettered"
            );
            metrics::counter!("outbox.dead_lettered.total").increment(1);
        } else {
            tracing::warn!(
                outbox_id = %entry.id,
                topic = %entry.routing_key,
                attempt = entry.retry_count + 1,
                max_retries = entry.max_retries,
                error = %message,
                "Outbox delivery failed"
            );
            metrics::counter!("outbox.delivery_failures.total").increment(1);
        }
        Some(status)
    }

    async fn record_backlog(&self) {
        match self.outbox.counts().await {
            Ok(counts) => {
                for (status, n) in [
                    (OutboxStatus::Pending, counts.pending),
                    (OutboxStatus::Processing, counts.processing),
                    (OutboxStatus::Failed, counts.failed),
                    (OutboxStatus::DeadLetter, counts.dead_letter),
                ] {
                    #[allow(clippy::cast_precision_loss)]
                    metrics::gauge!("outbox.entries", "status" => status.as_str()).set(n as f64);
                }
            }
            Err(e) => tracing::debug!(error = %e, "Could not read outbox counts"),
        }
    }

    async fn store_call<'a, F, Fut, T>(&'a self, name: &'static str, op: F) -> Result<T, OutboxError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, OutboxError>> + 'a,
    {
        retry_transient(&self.config.store_retry, name, op, OutboxError::is_transient).await
    }
}
