//! Payment Batch Orchestrator.
//!
//! Pays each unresolved item of a batch through the gateway. Every item is
//! claimed in the store before the gateway call and its outcome recorded in a
//! separate unit of work, so a crash mid-batch leaves at most one item in
//! flight and the batch counters always match the items.
//!
//! Batches are never retried automatically. [`BatchOrchestrator::retry_failed_items`]
//! is the explicit re-processing entry point and touches only failed items.

use crate::error::{LedgerError, Result};
use crate::events::{PaymentEvent, aggregate_types, stage_all};
use crate::payments::batch::{BatchItem, BatchStatus, ItemOutcome, PaymentBatch, Recorded};
use crate::payments::gateway::{ChargeRequest, PaymentGateway};
use crate::types::{BatchId, PaymentId};
use chrono::{DateTime, Duration, Utc};
use futures::future::BoxFuture;
use std::sync::Arc;
use tuneshare_core::environment::Clock;
use tuneshare_core::event::EventMetadata;
use tuneshare_core::outbox::StagedEvent;

/// Persistence for payment batches.
pub trait PaymentBatchStore: Send + Sync {
    /// Persist a new batch and stage its events.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Storage`] on storage failure.
    fn insert_batch(
        &self,
        batch: PaymentBatch,
        staged: Vec<StagedEvent>,
    ) -> BoxFuture<'_, Result<()>>;

    /// Current batch state.
    ///
    /// # Errors
    ///
    /// [`LedgerError::NotFound`] for unknown batches.
    fn load_batch(&self, batch_id: BatchId) -> BoxFuture<'_, Result<PaymentBatch>>;

    /// Atomically apply [`PaymentBatch::begin_processing`]; also moves the
    /// batch's distribution to processing.
    ///
    /// # Errors
    ///
    /// Errors from [`PaymentBatch::begin_processing`], or storage failure.
    fn begin_processing(
        &self,
        batch_id: BatchId,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<PaymentBatch>>;

    /// Atomically apply [`PaymentBatch::claim_item`].
    ///
    /// # Errors
    ///
    /// Errors from [`PaymentBatch::claim_item`], or storage failure.
    fn claim_item(
        &self,
        batch_id: BatchId,
        payment_id: PaymentId,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Option<BatchItem>>>;

    /// Atomically apply [`PaymentBatch::record_outcome`], stage the resulting
    /// events and, when the batch settles, settle its distribution.
    ///
    /// # Errors
    ///
    /// Errors from [`PaymentBatch::record_outcome`], or storage failure.
    fn record_outcome(
        &self,
        batch_id: BatchId,
        payment_id: PaymentId,
        outcome: ItemOutcome,
        now: DateTime<Utc>,
        metadata: EventMetadata,
    ) -> BoxFuture<'_, Result<Recorded>>;

    /// Atomically apply [`PaymentBatch::reset_failed`]; the batch's
    /// distribution returns to processing.
    ///
    /// # Errors
    ///
    /// Errors from [`PaymentBatch::reset_failed`], or storage failure.
    fn reset_failed_items(
        &self,
        batch_id: BatchId,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Vec<PaymentId>>>;

    /// Batches still pending or processing, oldest first.
    ///
    /// # Errors
    ///
    /// Storage failure.
    fn open_batches(&self, limit: usize) -> BoxFuture<'_, Result<Vec<BatchId>>>;
}

/// Encode payment events for the outbox.
///
/// # Errors
///
/// [`LedgerError::Outbox`] if an event cannot be encoded.
pub fn stage_payment_events(
    batch_id: BatchId,
    events: &[PaymentEvent],
    metadata: &EventMetadata,
    now: DateTime<Utc>,
) -> Result<Vec<StagedEvent>> {
    stage_all(
        &batch_id.aggregate_id(),
        aggregate_types::PAYMENT_BATCH,
        events,
        metadata,
        now,
    )
}

/// Orchestrator settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Age after which another orchestrator's item claim is presumed abandoned.
    pub claim_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            claim_timeout: Duration::minutes(5),
        }
    }
}

/// Outcome of one pass over a batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchReport {
    /// Batch.
    pub batch_id: BatchId,
    /// Items sent to the gateway.
    pub attempted: u32,
    /// Items paid in this pass.
    pub succeeded: u32,
    /// Items failed in this pass.
    pub failed: u32,
    /// Items claimed elsewhere or already resolved.
    pub skipped: u32,
    /// Batch status after the pass.
    pub status: BatchStatus,
}

/// Batch orchestrator service.
#[derive(Clone)]
pub struct BatchOrchestrator {
    store: Arc<dyn PaymentBatchStore>,
    gateway: Arc<dyn PaymentGateway>,
    clock: Arc<dyn Clock>,
    config: OrchestratorConfig,
}

impl BatchOrchestrator {
    /// Orchestrator over `store` and `gateway`.
    #[must_use]
    pub fn new(
        store: Arc<dyn PaymentBatchStore>,
        gateway: Arc<dyn PaymentGateway>,
        clock: Arc<dyn Clock>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            clock,
            config,
        }
    }

    /// Pay every unresolved item of a batch.
    ///
    /// Gateway failures mark the item failed; they are not errors of the pass.
    ///
    /// # Errors
    ///
    /// Store failures, or [`LedgerError::InvalidTransition`]
    /// for settled batches.
    pub async fn process(&self, batch_id: BatchId, metadata: EventMetadata) -> Result<BatchReport> {
        let batch = self
            .store
            .begin_processing(batch_id, self.clock.now())
            .await?;
        let mut report = BatchReport {
            batch_id,
            attempted: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            status: batch.status,
        };

        let pending: Vec<PaymentId> = batch.unresolved().map(|i| i.payment_id).collect();
        for payment_id in pending {
            let now = self.clock.now();
            let Some(item) = self
                .store
                .claim_item(batch_id, payment_id, now, now - self.config.claim_timeout)
                .await?
            else {
                report.skipped += 1;
                continue;
            };

            report.attempted += 1;
            let outcome = self.charge(&batch, &item).await;
            let paid = matches!(outcome, ItemOutcome::Paid { .. });
            let recorded = self
                .store
                .record_outcome(batch_id, payment_id, outcome, self.clock.now(), metadata.clone())
                .await?;

            match recorded {
                Recorded::Duplicate => report.skipped += 1,
                Recorded::Applied { settled, .. } => {
                    if paid {
                        report.succeeded += 1;
                    } else {
                        report.failed += 1;
                    }
                    if let Some(status) = settled {
                        tracing::info!(
                            batch_id = %batch_id,
                            status = %status,
                            "Payment batch settled"
                        );
                        metrics::counter!(
                            "ledger.batches.settled.total",
                            "status" => status.as_str()
                        )
                        .increment(1);
                    }
                }
            }
        }

        report.status = self.store.load_batch(batch_id).await?.status;
        tracing::info!(
            batch_id = %batch_id,
            attempted = report.attempted,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            status = %report.status,
            "Payment batch pass finished"
        );
        Ok(report)
    }

    /// Process up to `limit` open batches. A failing batch is logged and the
    /// sweep moves on.
    ///
    /// # Errors
    ///
    /// Storage failure while listing batches.
    pub async fn process_pending(
        &self,
        limit: usize,
        metadata: EventMetadata,
    ) -> Result<Vec<BatchReport>> {
        let batch_ids = self.store.open_batches(limit).await?;
        let mut reports = Vec::with_capacity(batch_ids.len());
        for batch_id in batch_ids {
            match self.process(batch_id, metadata.clone()).await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    tracing::error!(batch_id = %batch_id, error = %e, "Payment batch pass failed");
                }
            }
        }
        Ok(reports)
    }

    /// Re-pay only the failed items of a batch.
    ///
    /// Completed items are never charged again.
    ///
    /// # Errors
    ///
    /// As [`Self::process`].
    pub async fn retry_failed_items(
        &self,
        batch_id: BatchId,
        metadata: EventMetadata,
    ) -> Result<BatchReport> {
        let reset = self
            .store
            .reset_failed_items(batch_id, self.clock.now())
            .await?;
        tracing::info!(batch_id = %batch_id, items = reset.len(), "Retrying failed payments");
        self.process(batch_id, metadata).await
    }

    /// Current batch state.
    ///
    /// # Errors
    ///
    /// [`LedgerError::NotFound`] or storage failure.
    pub async fn batch(&self, batch_id: BatchId) -> Result<PaymentBatch> {
        self.store.load_batch(batch_id).await
    }

    async fn charge(&self, batch: &PaymentBatch, item: &BatchItem) -> ItemOutcome {
        let request = ChargeRequest {
            idempotency_key: item.idempotency_key(batch.id),
            payment_id: item.payment_id,
            recipient: item.recipient,
            amount: item.amount,
            currency: batch.currency,
        };
        match self.gateway.charge(&request).await {
            Ok(receipt) => {
                metrics::counter!("ledger.payments.total", "outcome" => "completed").increment(1);
                ItemOutcome::Paid {
                    transaction_id: receipt.transaction_id,
                }
            }
            Err(e) => {
                let reason = e.to_string();
                let retryable = e.is_retryable();
                let failure = LedgerError::Gateway(e).public();
                tracing::warn!(
                    batch_id = %batch.id,
                    payment_id = %item.payment_id,
                    recipient = %item.recipient,
                    retryable,
                    error_reference = %failure.reference,
                    error = %reason,
                    "Payment failed"
                );
                metrics::counter!("ledger.payments.total", "outcome" => "failed").increment(1);
                ItemOutcome::Failed { reason, failure }
            }
        }
    }
}
