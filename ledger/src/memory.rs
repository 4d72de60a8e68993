//! In-memory ledger store.
//!
//! All business tables and the outbox live behind one mutex, so every unit of
//! work (a pool mutation plus its staged events, a distribution plus its batch)
//! is atomic. Each operation mutates copies and writes them back only when every
//! step succeeded.

use crate::distribution::engine::{Distribution, DistributionRequest, DistributionStatus, FeeSchedule};
use crate::distribution::service::{
    DistributionOutcome, DistributionStore, prepare_distribution, stage_settlement,
};
use crate::error::{LedgerError, Result};
use crate::ownership::OwnershipContract;
use crate::payments::batch::{BatchItem, BatchStatus, ItemOutcome, PaymentBatch, Recorded};
use crate::payments::orchestrator::{PaymentBatchStore, stage_payment_events};
use crate::rewards::allocator::{PoolChange, ReserveRequest, RewardPoolStore, stage_reward_events};
use crate::rewards::pool::{Reservation, RewardPool};
use crate::types::{
    BatchId, ContractId, DistributionId, Money, PaymentId, PoolId, ReservationId, Tokens, UserId,
};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tuneshare_core::environment::{Clock, SystemClock};
use tuneshare_core::event::EventMetadata;
use tuneshare_core::outbox::{
    OutboxCounts, OutboxEntry, OutboxError, OutboxLog, OutboxStatus, OutboxStore, StagedEvent,
};
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    pools: HashMap<PoolId, RewardPool>,
    reservations: HashMap<ReservationId, Reservation>,
    contracts: HashMap<ContractId, OwnershipContract>,
    closed_periods: Vec<DistributionRequest>,
    distributions: HashMap<DistributionId, Distribution>,
    batches: HashMap<BatchId, PaymentBatch>,
    outbox: OutboxLog,
}

impl Tables {
    fn stage(&mut self, staged: Vec<StagedEvent>, now: DateTime<Utc>) {
        for entry in staged {
            self.outbox.stage(entry, now);
        }
    }

    fn pool(&self, pool_id: PoolId) -> Result<RewardPool> {
        self.pools
            .get(&pool_id)
            .cloned()
            .ok_or_else(|| LedgerError::not_found("reward pool", pool_id))
    }

    fn reservation(&self, reservation_id: ReservationId) -> Result<Reservation> {
        self.reservations
            .get(&reservation_id)
            .cloned()
            .ok_or_else(|| LedgerError::not_found("reservation", reservation_id))
    }

    fn contract(&self, contract_id: ContractId) -> Result<OwnershipContract> {
        self.contracts
            .get(&contract_id)
            .cloned()
            .ok_or_else(|| LedgerError::not_found("ownership contract", contract_id))
    }

    fn batch(&self, batch_id: BatchId) -> Result<PaymentBatch> {
        self.batches
            .get(&batch_id)
            .cloned()
            .ok_or_else(|| LedgerError::not_found("payment batch", batch_id))
    }

    fn set_distribution_status(
        &mut self,
        distribution_id: Option<DistributionId>,
        status: DistributionStatus,
    ) {
        if let Some(d) = distribution_id.and_then(|id| self.distributions.get_mut(&id)) {
            d.status = status;
        }
    }
}

/// Ledger store kept in process memory.
///
/// Clones share the same tables. Used by tests and single-process local runs.
#[derive(Clone)]
pub struct InMemoryLedger {
    tables: Arc<Mutex<Tables>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryLedger {
    /// Empty ledger stamping outbox entries with wall-clock time.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Empty ledger stamping outbox entries with `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            tables: Arc::new(Mutex::new(Tables::default())),
            clock,
        }
    }

    /// Copy of every outbox entry in staging order.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Storage`] if the lock is poisoned.
    pub fn outbox_entries(&self) -> Result<Vec<OutboxEntry>> {
        Ok(self.lock()?.outbox.entries().to_vec())
    }

    /// Royalty periods recorded as closed.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Storage`] if the lock is poisoned.
    pub fn closed_periods(&self) -> Result<Vec<DistributionRequest>> {
        Ok(self.lock()?.closed_periods.clone())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| LedgerError::Storage("ledger tables lock poisoned".into()))
    }

    fn outbox_lock(&self) -> std::result::Result<MutexGuard<'_, Tables>, OutboxError> {
        self.tables
            .lock()
            .map_err(|_| OutboxError::Storage("ledger tables lock poisoned".into()))
    }

    fn pool_change<F>(
        &self,
        reservation_id: ReservationId,
        now: DateTime<Utc>,
        metadata: &EventMetadata,
        apply: F,
    ) -> Result<PoolChange>
    where
        F: FnOnce(&mut RewardPool, &mut Reservation) -> Result<Vec<crate::events::RewardEvent>>,
    {
        let mut tables = self.lock()?;
        let mut reservation = tables.reservation(reservation_id)?;
        let mut pool = tables.pool(reservation.pool_id)?;
        let events = apply(&mut pool, &mut reservation)?;
        let staged = stage_reward_events(pool.id, &events, metadata, now)?;

        tables.pools.insert(pool.id, pool.clone());
        tables.reservations.insert(reservation.id, reservation.clone());
        tables.stage(staged, now);
        Ok(PoolChange {
            reservation,
            pool,
            events,
        })
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl RewardPoolStore for InMemoryLedger {
    fn insert_pool(
        &self,
        pool: RewardPool,
        staged: Vec<StagedEvent>,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut tables = self.lock()?;
            let now = pool.created_at;
            tables.pools.insert(pool.id, pool);
            tables.stage(staged, now);
            Ok(())
        })
    }

    fn load_pool(&self, pool_id: PoolId) -> BoxFuture<'_, Result<RewardPool>> {
        Box::pin(async move { self.lock()?.pool(pool_id) })
    }

    fn load_reservation(
        &self,
        reservation_id: ReservationId,
    ) -> BoxFuture<'_, Result<Reservation>> {
        Box::pin(async move { self.lock()?.reservation(reservation_id) })
    }

    fn reserve(
        &self,
        request: ReserveRequest,
        now: DateTime<Utc>,
        metadata: EventMetadata,
    ) -> BoxFuture<'_, Result<PoolChange>> {
        Box::pin(async move {
            let mut tables = self.lock()?;
            let mut pool = tables.pool(request.pool_id)?;
            let (reservation, events) =
                pool.reserve(request.reservation_id, request.amount, request.claim, now)?;
            let staged = stage_reward_events(pool.id, &events, &metadata, now)?;

            tables.pools.insert(pool.id, pool.clone());
            tables.reservations.insert(reservation.id, reservation.clone());
            tables.stage(staged, now);
            Ok(PoolChange {
                reservation,
                pool,
                events,
            })
        })
    }

    fn commit(
        &self,
        reservation_id: ReservationId,
        final_amount: Tokens,
        now: DateTime<Utc>,
        metadata: EventMetadata,
    ) -> BoxFuture<'_, Result<PoolChange>> {
        Box::pin(async move {
            self.pool_change(reservation_id, now, &metadata, |pool, reservation| {
                pool.commit(reservation, final_amount, now)
            })
        })
    }

    fn release(
        &self,
        reservation_id: ReservationId,
        now: DateTime<Utc>,
        metadata: EventMetadata,
    ) -> BoxFuture<'_, Result<PoolChange>> {
        Box::pin(async move {
            self.pool_change(reservation_id, now, &metadata, |pool, reservation| {
                pool.release(reservation, now)
            })
        })
    }

    fn close_pool(
        &self,
        pool_id: PoolId,
        now: DateTime<Utc>,
        metadata: EventMetadata,
    ) -> BoxFuture<'_, Result<RewardPool>> {
        Box::pin(async move {
            let mut tables = self.lock()?;
            let mut pool = tables.pool(pool_id)?;
            let event = pool.close(now)?;
            let staged = stage_reward_events(pool_id, &[event], &metadata, now)?;
            tables.pools.insert(pool_id, pool.clone());
            tables.stage(staged, now);
            Ok(pool)
        })
    }
}

impl DistributionStore for InMemoryLedger {
    fn insert_contract(&self, contract: OwnershipContract) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.lock()?.contracts.insert(contract.id, contract);
            Ok(())
        })
    }

    fn load_contract(&self, contract_id: ContractId) -> BoxFuture<'_, Result<OwnershipContract>> {
        Box::pin(async move { self.lock()?.contract(contract_id) })
    }

    fn record_share_purchase(
        &self,
        contract_id: ContractId,
        holder: UserId,
        shares: u64,
        price: Money,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<OwnershipContract>> {
        Box::pin(async move {
            let mut tables = self.lock()?;
            let mut contract = tables.contract(contract_id)?;
            contract.purchase_shares(holder, shares, price, now)?;
            contract.validate()?;
            tables.contracts.insert(contract_id, contract.clone());
            Ok(contract)
        })
    }

    fn record_share_transfer(
        &self,
        contract_id: ContractId,
        seller: UserId,
        buyer: UserId,
        shares: u64,
        price: Money,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<OwnershipContract>> {
        Box::pin(async move {
            let mut tables = self.lock()?;
            let mut contract = tables.contract(contract_id)?;
            contract.transfer_shares(seller, buyer, shares, price, now)?;
            contract.validate()?;
            tables.contracts.insert(contract_id, contract.clone());
            Ok(contract)
        })
    }

    fn record_period_close(
        &self,
        request: DistributionRequest,
        staged: StagedEvent,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let now = self.clock.now();
            let mut tables = self.lock()?;
            tables.contract(request.contract_id)?;
            tables.closed_periods.push(request);
            tables.stage(vec![staged], now);
            Ok(())
        })
    }

    fn distribute(
        &self,
        request: DistributionRequest,
        fees: FeeSchedule,
        now: DateTime<Utc>,
        metadata: EventMetadata,
    ) -> BoxFuture<'_, Result<DistributionOutcome>> {
        Box::pin(async move {
            let mut tables = self.lock()?;
            let existing = tables.distributions.values().find(|d| {
                d.contract_id == request.contract_id
                    && d.period_start == request.period_start
                    && d.period_end == request.period_end
            });
            if let Some(existing) = existing {
                return Ok(DistributionOutcome::Existing(existing.clone()));
            }

            let contract = tables.contract(request.contract_id)?;
            let prepared = prepare_distribution(&contract, &request, &fees, now, &metadata)?;
            if let Some(batch) = prepared.batch {
                tables.batches.insert(batch.id, batch);
            }
            tables
                .distributions
                .insert(prepared.distribution.id, prepared.distribution.clone());
            tables.stage(prepared.staged, now);
            Ok(DistributionOutcome::Created(prepared.distribution))
        })
    }

    fn load_distribution(
        &self,
        distribution_id: DistributionId,
    ) -> BoxFuture<'_, Result<Distribution>> {
        Box::pin(async move {
            self.lock()?
                .distributions
                .get(&distribution_id)
                .cloned()
                .ok_or_else(|| LedgerError::not_found("distribution", distribution_id))
        })
    }
}

impl PaymentBatchStore for InMemoryLedger {
    fn insert_batch(
        &self,
        batch: PaymentBatch,
        staged: Vec<StagedEvent>,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut tables = self.lock()?;
            let now = batch.created_at;
            tables.batches.insert(batch.id, batch);
            tables.stage(staged, now);
            Ok(())
        })
    }

    fn load_batch(&self, batch_id: BatchId) -> BoxFuture<'_, Result<PaymentBatch>> {
        Box::pin(async move { self.lock()?.batch(batch_id) })
    }

    fn begin_processing(
        &self,
        batch_id: BatchId,
        _now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<PaymentBatch>> {
        Box::pin(async move {
            let mut tables = self.lock()?;
            let mut batch = tables.batch(batch_id)?;
            let was_pending = batch.status == BatchStatus::Pending;
            batch.begin_processing()?;
            if !was_pending {
                return Ok(batch);
            }
            tables.set_distribution_status(batch.distribution_id, DistributionStatus::Processing);
            tables.batches.insert(batch_id, batch.clone());
            Ok(batch)
        })
    }

    fn claim_item(
        &self,
        batch_id: BatchId,
        payment_id: PaymentId,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Option<BatchItem>>> {
        Box::pin(async move {
            let mut tables = self.lock()?;
            let mut batch = tables.batch(batch_id)?;
            let claimed = batch.claim_item(payment_id, now, stale_before)?;
            if claimed.is_some() {
                tables.batches.insert(batch_id, batch);
            }
            Ok(claimed)
        })
    }

    fn record_outcome(
        &self,
        batch_id: BatchId,
        payment_id: PaymentId,
        outcome: ItemOutcome,
        now: DateTime<Utc>,
        metadata: EventMetadata,
    ) -> BoxFuture<'_, Result<Recorded>> {
        Box::pin(async move {
            let mut tables = self.lock()?;
            let mut batch = tables.batch(batch_id)?;
            let recorded = batch.record_outcome(payment_id, outcome, now)?;
            let Recorded::Applied { events, settled } = &recorded else {
                return Ok(recorded);
            };

            let mut staged = stage_payment_events(batch_id, events, &metadata, now)?;
            if let (Some(status), Some(distribution_id)) = (settled, batch.distribution_id) {
                let status = DistributionStatus::from(*status);
                staged.extend(stage_settlement(distribution_id, status, &metadata, now)?);
                tables.set_distribution_status(Some(distribution_id), status);
            }
            tables.batches.insert(batch_id, batch);
            tables.stage(staged, now);
            Ok(recorded)
        })
    }

    fn reset_failed_items(
        &self,
        batch_id: BatchId,
        _now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Vec<PaymentId>>> {
        Box::pin(async move {
            let mut tables = self.lock()?;
            let mut batch = tables.batch(batch_id)?;
            let reset = batch.reset_failed()?;
            if !reset.is_empty() {
                tables.set_distribution_status(batch.distribution_id, DistributionStatus::Processing);
                tables.batches.insert(batch_id, batch);
            }
            Ok(reset)
        })
    }

    fn open_batches(&self, limit: usize) -> BoxFuture<'_, Result<Vec<BatchId>>> {
        Box::pin(async move {
            let tables = self.lock()?;
            let mut open: Vec<&PaymentBatch> = tables
                .batches
                .values()
                .filter(|b| !b.status.is_settled())
                .collect();
            open.sort_by_key(|b| b.created_at);
            Ok(open.into_iter().take(limit).map(|b| b.id).collect())
        })
    }
}

impl OutboxStore for InMemoryLedger {
    fn stage(&self, staged: StagedEvent) -> BoxFuture<'_, std::result::Result<OutboxEntry, OutboxError>> {
        Box::pin(async move {
            let now = self.clock.now();
            Ok(self.outbox_lock()?.outbox.stage(staged, now))
        })
    }

    fn claim_batch(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, std::result::Result<Vec<OutboxEntry>, OutboxError>> {
        Box::pin(async move { Ok(self.outbox_lock()?.outbox.claim_batch(limit, now)) })
    }

    fn mark_published(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, std::result::Result<(), OutboxError>> {
        Box::pin(async move { self.outbox_lock()?.outbox.mark_published(id, now) })
    }

    fn mark_failed(
        &self,
        id: Uuid,
        error: String,
    ) -> BoxFuture<'_, std::result::Result<OutboxStatus, OutboxError>> {
        Box::pin(async move { self.outbox_lock()?.outbox.mark_failed(id, &error) })
    }

    fn release(&self, id: Uuid) -> BoxFuture<'_, std::result::Result<(), OutboxError>> {
        Box::pin(async move { self.outbox_lock()?.outbox.release(id) })
    }

    fn reclaim_stale(
        &self,
        stale_before: DateTime<Utc>,
    ) -> BoxFuture<'_, std::result::Result<u64, OutboxError>> {
        Box::pin(async move { Ok(self.outbox_lock()?.outbox.reclaim_stale(stale_before)) })
    }

    fn cleanup_old_events(
        &self,
        older_than_days: u32,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, std::result::Result<u64, OutboxError>> {
        Box::pin(async move {
            Ok(self
                .outbox_lock()?
                .outbox
                .cleanup_old_events(older_than_days, now))
        })
    }

    fn dead_letters(
        &self,
        limit: usize,
    ) -> BoxFuture<'_, std::result::Result<Vec<OutboxEntry>, OutboxError>> {
        Box::pin(async move { Ok(self.outbox_lock()?.outbox.dead_letters(limit)) })
    }

    fn requeue_dead_letter(&self, id: Uuid) -> BoxFuture<'_, std::result::Result<(), OutboxError>> {
        Box::pin(async move { self.outbox_lock()?.outbox.requeue_dead_letter(id) })
    }

    fn counts(&self) -> BoxFuture<'_, std::result::Result<OutboxCounts, OutboxError>> {
        Box::pin(async move { Ok(self.outbox_lock()?.outbox.counts()) })
    }
}
