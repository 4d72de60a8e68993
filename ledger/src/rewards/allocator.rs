//! Reward Pool Allocator.
//!
//! [`RewardPoolStore`] is the only way pool counters change. Each store call is
//! one atomic unit: lock the pool, apply the pure [`RewardPool`] method, persist
//! the new counters and stage the resulting [`RewardEvent`]s in the outbox.

use crate::error::{LedgerError, Result};
use crate::events::{RewardEvent, aggregate_types, stage_all};
use crate::rewards::pool::{Reservation, ReservationClaim, RewardPool};
use crate::rewards::session::RewardPolicy;
use crate::types::{PoolId, ReservationId, Tokens};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::sync::Arc;
use tuneshare_core::environment::Clock;
use tuneshare_core::event::EventMetadata;
use tuneshare_core::outbox::StagedEvent;

/// A reservation to take.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReserveRequest {
    /// Pool to reserve from.
    pub pool_id: PoolId,
    /// Identifier for the new reservation.
    pub reservation_id: ReservationId,
    /// Tokens to set aside.
    pub amount: Tokens,
    /// Who the tokens are for.
    pub claim: ReservationClaim,
}

/// Result of one atomic pool mutation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolChange {
    /// Reservation after the change.
    pub reservation: Reservation,
    /// Pool after the change.
    pub pool: RewardPool,
    /// Events staged by the change; empty for idempotent repeats.
    pub events: Vec<RewardEvent>,
}

/// Persistence for pools and reservations.
pub trait RewardPoolStore: Send + Sync {
    /// Persist a newly opened pool and stage its `PoolOpened` event.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Storage`] on storage failure.
    fn insert_pool(
        &self,
        pool: RewardPool,
        staged: Vec<StagedEvent>,
    ) -> BoxFuture<'_, Result<()>>;

    /// Current pool state.
    ///
    /// # Errors
    ///
    /// [`LedgerError::NotFound`] for unknown pools.
    fn load_pool(&self, pool_id: PoolId) -> BoxFuture<'_, Result<RewardPool>>;

    /// Current reservation state.
    ///
    /// # Errors
    ///
    /// [`LedgerError::NotFound`] for unknown reservations.
    fn load_reservation(
        &self,
        reservation_id: ReservationId,
    ) -> BoxFuture<'_, Result<Reservation>>;

    /// Atomically apply [`RewardPool::reserve`].
    ///
    /// # Errors
    ///
    /// Whatever [`RewardPool::reserve`] returns; nothing is written on error.
    fn reserve(
        &self,
        request: ReserveRequest,
        now: DateTime<Utc>,
        metadata: EventMetadata,
    ) -> BoxFuture<'_, Result<PoolChange>>;

    /// Atomically apply [`RewardPool::commit`].
    ///
    /// # Errors
    ///
    /// Whatever [`RewardPool::commit`] returns; nothing is written on error.
    fn commit(
        &self,
        reservation_id: ReservationId,
        final_amount: Tokens,
        now: DateTime<Utc>,
        metadata: EventMetadata,
    ) -> BoxFuture<'_, Result<PoolChange>>;

    /// Atomically apply [`RewardPool::release`].
    ///
    /// # Errors
    ///
    /// Whatever [`RewardPool::release`] returns; nothing is written on error.
    fn release(
        &self,
        reservation_id: ReservationId,
        now: DateTime<Utc>,
        metadata: EventMetadata,
    ) -> BoxFuture<'_, Result<PoolChange>>;

    /// Atomically apply [`RewardPool::close`].
    ///
    /// # Errors
    ///
    /// Whatever [`RewardPool::close`] returns; nothing is written on error.
    fn close_pool(
        &self,
        pool_id: PoolId,
        now: DateTime<Utc>,
        metadata: EventMetadata,
    ) -> BoxFuture<'_, Result<RewardPool>>;
}

/// Encode pool events for the outbox.
///
/// # Errors
///
/// [`LedgerError::Outbox`] if an event cannot be encoded.
pub fn stage_reward_events(
    pool_id: PoolId,
    events: &[RewardEvent],
    metadata: &EventMetadata,
    now: DateTime<Utc>,
) -> Result<Vec<StagedEvent>> {
    stage_all(
        &pool_id.aggregate_id(),
        aggregate_types::REWARD_POOL,
        events,
        metadata,
        now,
    )
}

/// Allocator service.
#[derive(Clone)]
pub struct RewardAllocator {
    store: Arc<dyn RewardPoolStore>,
    clock: Arc<dyn Clock>,
    policy: RewardPolicy,
}

impl RewardAllocator {
    /// Allocator over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn RewardPoolStore>, clock: Arc<dyn Clock>, policy: RewardPolicy) -> Self {
        Self {
            store,
            clock,
            policy,
        }
    }

    /// Reward policy in force.
    #[must_use]
    pub const fn policy(&self) -> &RewardPolicy {
        &self.policy
    }

    /// Fund a pool for a validation period.
    ///
    /// # Errors
    ///
    /// Validation errors from [`RewardPool::open`], or storage failure.
    pub async fn open_pool(
        &self,
        total_tokens: Tokens,
        validation_start: DateTime<Utc>,
        validation_end: DateTime<Utc>,
        metadata: EventMetadata,
    ) -> Result<RewardPool> {
        let now = self.clock.now();
        let (pool, event) = RewardPool::open(
            PoolId::new(),
            total_tokens,
            validation_start,
            validation_end,
            self.policy.depletion_threshold,
            now,
        )?;
        let staged = stage_reward_events(pool.id, std::slice::from_ref(&event), &metadata, now)?;
        self.store.insert_pool(pool.clone(), staged).await?;

        tracing::info!(
            pool_id = %pool.id,
            total_tokens = total_tokens.value(),
            validation_start = %validation_start,
            validation_end = %validation_end,
            "Reward pool opened"
        );
        metrics::counter!("ledger.pools.opened.total").increment(1);
        Ok(pool)
    }

    /// Reserve `amount` tokens from a pool.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InsufficientPool`] when the pool cannot cover `amount`;
    /// the pool is unchanged. Other validation or storage errors as returned by the store.
    #[allow(clippy::cast_precision_loss)]
    pub async fn reserve(
        &self,
        pool_id: PoolId,
        amount: Tokens,
        claim: ReservationClaim,
        metadata: EventMetadata,
    ) -> Result<Reservation> {
        let request = ReserveRequest {
            pool_id,
            reservation_id: ReservationId::new(),
            amount,
            claim,
        };
        match self.store.reserve(request, self.clock.now(), metadata).await {
            Ok(change) => {
                tracing::debug!(
                    pool_id = %pool_id,
                    reservation_id = %change.reservation.id,
                    amount = amount.value(),
                    available = change.pool.available().value(),
                    "Tokens reserved"
                );
                metrics::counter!("ledger.pool.reservations.total", "outcome" => "granted")
                    .increment(1);
                metrics::gauge!("ledger.pool.available_tokens", "pool_id" => pool_id.to_string())
                    .set(change.pool.available().value() as f64);
                Ok(change.reservation)
            }
            Err(e @ LedgerError::InsufficientPool { .. }) => {
                tracing::info!(pool_id = %pool_id, amount = amount.value(), error = %e, "Reservation denied");
                metrics::counter!("ledger.pool.reservations.total", "outcome" => "denied")
                    .increment(1);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Finalize a reservation at `final_amount`, returning any surplus to the pool.
    ///
    /// # Errors
    ///
    /// Errors from [`RewardPool::commit`], or storage failure.
    pub async fn commit(
        &self,
        reservation_id: ReservationId,
        final_amount: Tokens,
        metadata: EventMetadata,
    ) -> Result<Reservation> {
        let change = self
            .store
            .commit(reservation_id, final_amount, self.clock.now(), metadata)
            .await?;
        if change.events.is_empty() {
            tracing::debug!(reservation_id = %reservation_id, "Reservation already committed");
            return Ok(change.reservation);
        }

        tracing::info!(
            pool_id = %change.pool.id,
            reservation_id = %reservation_id,
            reserved = change.reservation.amount.value(),
            committed = final_amount.value(),
            distributed = change.pool.distributed_tokens.value(),
            "Reservation committed"
        );
        metrics::counter!("ledger.pool.tokens_distributed.total").increment(final_amount.value());
        self.announce_depletion(&change);
        Ok(change.reservation)
    }

    /// Return a reservation's tokens to its pool.
    ///
    /// # Errors
    ///
    /// Errors from [`RewardPool::release`], or storage failure.
    pub async fn release(
        &self,
        reservation_id: ReservationId,
        metadata: EventMetadata,
    ) -> Result<Reservation> {
        let change = self
            .store
            .release(reservation_id, self.clock.now(), metadata)
            .await?;
        if !change.events.is_empty() {
            tracing::info!(
                pool_id = %change.pool.id,
                reservation_id = %reservation_id,
                amount = change.reservation.amount.value(),
                "Reservation released"
            );
            metrics::counter!("ledger.pool.releases.total").increment(1);
        }
        Ok(change.reservation)
    }

    /// Close a pool whose validation period has ended.
    ///
    /// # Errors
    ///
    /// Errors from [`RewardPool::close`], or storage failure.
    pub async fn close_pool(&self, pool_id: PoolId, metadata: EventMetadata) -> Result<RewardPool> {
        let pool = self
            .store
            .close_pool(pool_id, self.clock.now(), metadata)
            .await?;
        tracing::info!(
            pool_id = %pool_id,
            distributed = pool.distributed_tokens.value(),
            unused = pool.available().value(),
            "Reward pool closed"
        );
        Ok(pool)
    }

    /// Current pool state.
    ///
    /// # Errors
    ///
    /// [`LedgerError::NotFound`] or storage failure.
    pub async fn pool(&self, pool_id: PoolId) -> Result<RewardPool> {
        self.store.load_pool(pool_id).await
    }

    /// Current reservation state.
    ///
    /// # Errors
    ///
    /// [`LedgerError::NotFound`] or storage failure.
    pub async fn reservation(&self, reservation_id: ReservationId) -> Result<Reservation> {
        self.store.load_reservation(reservation_id).await
    }

    fn announce_depletion(&self, change: &PoolChange) {
        for event in &change.events {
            if let RewardEvent::PoolDepleted { pool_id, remaining } = event {
                tracing::warn!(
                    pool_id = %pool_id,
                    remaining = remaining.value(),
                    threshold = self.policy.depletion_threshold.value(),
                    "Reward pool depleted"
                );
                metrics::counter!("ledger.pool.depleted.total").increment(1);
            }
        }
    }
}
