//! Revenue distribution service and its store.
//!
//! [`DistributionStore::distribute`] is one unit of work: lock the contract,
//! return the existing distribution for the same contract and period if there
//! is one, otherwise calculate from the locked holdings, and persist the
//! distribution, its payment batch and the staged events together.

use crate::distribution::engine::{
    Distribution, DistributionRequest, DistributionStatus, FeeSchedule, calculate,
};
use crate::error::{LedgerError, Result};
use crate::events::{DistributionEvent, RevenueEvent, aggregate_types, stage_all};
use crate::ownership::OwnershipContract;
use crate::payments::batch::PaymentBatch;
use crate::payments::orchestrator::stage_payment_events;
use crate::types::{ArtistId, BasisPoints, ContractId, DistributionId, Money, SongId, UserId};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::sync::Arc;
use tuneshare_core::environment::Clock;
use tuneshare_core::event::EventMetadata;
use tuneshare_core::outbox::StagedEvent;

/// Whether a distribution call created a new distribution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DistributionOutcome {
    /// Calculated and persisted now.
    Created(Distribution),
    /// Already distributed for this contract and period.
    Existing(Distribution),
}

impl DistributionOutcome {
    /// The distribution either way.
    #[must_use]
    pub fn into_inner(self) -> Distribution {
        match self {
            Self::Created(d) | Self::Existing(d) => d,
        }
    }
}

/// Everything one distribution writes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreparedDistribution {
    /// The split.
    pub distribution: Distribution,
    /// Batch paying it; `None` when nobody is owed anything.
    pub batch: Option<PaymentBatch>,
    /// `RevenueDistributed` followed by `BatchCreated`.
    pub staged: Vec<StagedEvent>,
}

/// Calculate a distribution and the writes that go with it.
///
/// # Errors
///
/// Errors from [`calculate`], or [`LedgerError::Outbox`] if an event cannot be encoded.
pub fn prepare_distribution(
    contract: &OwnershipContract,
    request: &DistributionRequest,
    fees: &FeeSchedule,
    now: DateTime<Utc>,
    metadata: &EventMetadata,
) -> Result<PreparedDistribution> {
    let mut distribution = calculate(DistributionId::new(), contract, request, fees, now)?;

    let mut batch_staged = Vec::new();
    let batch = match PaymentBatch::for_distribution(&distribution, now)? {
        Some((batch, created)) => {
            distribution.batch_id = Some(batch.id);
            batch_staged = stage_payment_events(batch.id, &[created], metadata, now)?;
            Some(batch)
        }
        None => {
            distribution.status = DistributionStatus::Completed;
            None
        }
    };

    let distributed = DistributionEvent::RevenueDistributed {
        distribution_id: distribution.id,
        contract_id: distribution.contract_id,
        total_revenue: distribution.total_revenue,
        artist_amount: distribution.artist_amount,
        shareholder_amount: distribution.shareholder_total(),
        platform_amount: distribution.platform_total(),
        batch_id: distribution.batch_id,
        period_start: distribution.period_start,
        period_end: distribution.period_end,
    };
    let mut staged = stage_all(
        &distribution.id.aggregate_id(),
        aggregate_types::DISTRIBUTION,
        &[distributed],
        metadata,
        now,
    )?;
    staged.extend(batch_staged);

    Ok(PreparedDistribution {
        distribution,
        batch,
        staged,
    })
}

/// Encode a distribution status change for the outbox.
///
/// # Errors
///
/// [`LedgerError::Outbox`] if the event cannot be encoded.
pub fn stage_settlement(
    distribution_id: DistributionId,
    status: DistributionStatus,
    metadata: &EventMetadata,
    now: DateTime<Utc>,
) -> Result<Vec<StagedEvent>> {
    stage_all(
        &distribution_id.aggregate_id(),
        aggregate_types::DISTRIBUTION,
        &[DistributionEvent::DistributionSettled {
            distribution_id,
            status,
        }],
        metadata,
        now,
    )
}

/// Persistence for contracts and distributions.
pub trait DistributionStore: Send + Sync {
    /// Persist a new contract.
    ///
    /// # Errors
    ///
    /// Storage failure.
    fn insert_contract(&self, contract: OwnershipContract) -> BoxFuture<'_, Result<()>>;

    /// Current contract state.
    ///
    /// # Errors
    ///
    /// [`LedgerError::NotFound`] for unknown contracts.
    fn load_contract(&self, contract_id: ContractId) -> BoxFuture<'_, Result<OwnershipContract>>;

    /// Atomically apply [`OwnershipContract::purchase_shares`].
    ///
    /// # Errors
    ///
    /// Errors from [`OwnershipContract::purchase_shares`], or storage failure.
    fn record_share_purchase(
        &self,
        contract_id: ContractId,
        holder: UserId,
        shares: u64,
        price: Money,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<OwnershipContract>>;

    /// Atomically apply [`OwnershipContract::transfer_shares`].
    ///
    /// # Errors
    ///
    /// Errors from [`OwnershipContract::transfer_shares`], or storage failure.
    fn record_share_transfer(
        &self,
        contract_id: ContractId,
        seller: UserId,
        buyer: UserId,
        shares: u64,
        price: Money,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<OwnershipContract>>;

    /// Record that a royalty period closed and stage its revenue event.
    ///
    /// # Errors
    ///
    /// [`LedgerError::NotFound`] for unknown contracts, or storage failure.
    fn record_period_close(
        &self,
        request: DistributionRequest,
        staged: StagedEvent,
    ) -> BoxFuture<'_, Result<()>>;

    /// Distribute revenue for a contract and period, once.
    ///
    /// # Errors
    ///
    /// Errors from [`prepare_distribution`], [`LedgerError::NotFound`] or storage failure.
    fn distribute(
        &self,
        request: DistributionRequest,
        fees: FeeSchedule,
        now: DateTime<Utc>,
        metadata: EventMetadata,
    ) -> BoxFuture<'_, Result<DistributionOutcome>>;

    /// Distribution by ID.
    ///
    /// # Errors
    ///
    /// [`LedgerError::NotFound`] for unknown distributions.
    fn load_distribution(
        &self,
        distribution_id: DistributionId,
    ) -> BoxFuture<'_, Result<Distribution>>;
}

/// Distribution service.
#[derive(Clone)]
pub struct RevenueDistributor {
    store: Arc<dyn DistributionStore>,
    clock: Arc<dyn Clock>,
    fees: FeeSchedule,
}

impl RevenueDistributor {
    /// Distributor over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn DistributionStore>, clock: Arc<dyn Clock>, fees: FeeSchedule) -> Self {
        Self { store, clock, fees }
    }

    /// Fee schedule in force.
    #[must_use]
    pub const fn fees(&self) -> &FeeSchedule {
        &self.fees
    }

    /// Create an ownership contract for a song.
    ///
    /// # Errors
    ///
    /// Errors from [`OwnershipContract::new`], or storage failure.
    pub async fn register_contract(
        &self,
        song_id: SongId,
        artist_id: ArtistId,
        total_shares: u64,
        artist_retained: BasisPoints,
    ) -> Result<OwnershipContract> {
        let contract = OwnershipContract::new(
            ContractId::new(),
            song_id,
            artist_id,
            total_shares,
            artist_retained,
            self.clock.now(),
        )?;
        self.store.insert_contract(contract.clone()).await?;
        tracing::info!(
            contract_id = %contract.id,
            song_id = %song_id,
            total_shares,
            shares_for_sale = contract.shares_available_for_sale,
            "Ownership contract registered"
        );
        Ok(contract)
    }

    /// Sell shares of a contract.
    ///
    /// # Errors
    ///
    /// Errors from [`OwnershipContract::purchase_shares`], or storage failure.
    pub async fn purchase_shares(
        &self,
        contract_id: ContractId,
        holder: UserId,
        shares: u64,
        price: Money,
    ) -> Result<OwnershipContract> {
        let contract = self
            .store
            .record_share_purchase(contract_id, holder, shares, price, self.clock.now())
            .await?;
        tracing::info!(
            contract_id = %contract_id,
            holder = %holder,
            shares,
            shares_sold = contract.shares_sold,
            "Shares purchased"
        );
        Ok(contract)
    }

    /// Move shares of a contract from one holder to another.
    ///
    /// Distributions already made keep the holdings they were calculated from.
    ///
    /// # Errors
    ///
    /// Errors from [`OwnershipContract::transfer_shares`], or storage failure.
    pub async fn transfer_shares(
        &self,
        contract_id: ContractId,
        seller: UserId,
        buyer: UserId,
        shares: u64,
        price: Money,
    ) -> Result<OwnershipContract> {
        let contract = self
            .store
            .record_share_transfer(contract_id, seller, buyer, shares, price, self.clock.now())
            .await?;
        tracing::info!(
            contract_id = %contract_id,
            seller = %seller,
            buyer = %buyer,
            shares,
            price_cents = price.cents(),
            "Shares transferred"
        );
        Ok(contract)
    }

    /// Close a royalty period: stage a `RoyaltyPeriodClosed` event whose
    /// delivery triggers the distribution.
    ///
    /// # Errors
    ///
    /// Validation errors from [`DistributionRequest::validate`], or storage failure.
    pub async fn close_royalty_period(
        &self,
        request: DistributionRequest,
        metadata: EventMetadata,
    ) -> Result<()> {
        request.validate(&self.fees)?;
        let event = RevenueEvent::RoyaltyPeriodClosed {
            contract_id: request.contract_id,
            total_revenue: request.total_revenue,
            currency: request.currency,
            period_start: request.period_start,
            period_end: request.period_end,
            artist_share: request.artist_share,
        };
        let mut staged = stage_all(
            &request.contract_id.aggregate_id(),
            aggregate_types::REVENUE,
            &[event],
            &metadata,
            self.clock.now(),
        )?;
        let staged = staged
            .pop()
            .ok_or_else(|| LedgerError::InvariantViolation("revenue event was not staged".into()))?;
        self.store.record_period_close(request, staged).await?;
        tracing::info!(
            contract_id = %request.contract_id,
            total_revenue = request.total_revenue.cents(),
            period_start = %request.period_start,
            period_end = %request.period_end,
            "Royalty period closed"
        );
        Ok(())
    }

    /// Split revenue for a contract and period and create the payment batch.
    ///
    /// Repeating the call for the same contract and period returns the
    /// existing distribution.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InvalidPeriod`], [`LedgerError::InvalidAmount`] or
    /// [`LedgerError::InvalidPercentage`] before anything is written;
    /// [`LedgerError::NotFound`] for unknown contracts; storage failure.
    pub async fn distribute(
        &self,
        request: DistributionRequest,
        metadata: EventMetadata,
    ) -> Result<Distribution> {
        request.validate(&self.fees)?;
        let outcome = self
            .store
            .distribute(request, self.fees, self.clock.now(), metadata)
            .await?;

        match outcome {
            DistributionOutcome::Created(distribution) => {
                tracing::info!(
                    distribution_id = %distribution.id,
                    contract_id = %distribution.contract_id,
                    total_revenue = distribution.total_revenue.cents(),
                    artist_amount = distribution.artist_amount.cents(),
                    shareholders = distribution.payouts.len(),
                    platform_amount = distribution.platform_total().cents(),
                    batch_id = ?distribution.batch_id,
                    "Revenue distributed"
                );
                metrics::counter!("ledger.distributions.total").increment(1);
                metrics::counter!("ledger.distributions.revenue_cents.total")
                    .increment(distribution.total_revenue.cents());
                Ok(distribution)
            }
            DistributionOutcome::Existing(distribution) => {
                tracing::info!(
                    distribution_id = %distribution.id,
                    contract_id = %distribution.contract_id,
                    "Period already distributed"
                );
                Ok(distribution)
            }
        }
    }

    /// Distribution by ID.
    ///
    /// # Errors
    ///
    /// [`LedgerError::NotFound`] or storage failure.
    pub async fn distribution(&self, distribution_id: DistributionId) -> Result<Distribution> {
        self.store.load_distribution(distribution_id).await
    }

    /// Contract by ID.
    ///
    /// # Errors
    ///
    /// [`LedgerError::NotFound`] or storage failure.
    pub async fn contract(&self, contract_id: ContractId) -> Result<OwnershipContract> {
        self.store.load_contract(contract_id).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::Currency;
    use tuneshare_core::outbox::topic_for;

    #[test]
    fn prepared_distribution_stages_distribution_then_batch() {
        let now = Utc::now();
        let mut contract = OwnershipContract::new(
            ContractId::new(),
            SongId::new(),
            ArtistId::new(),
            100,
            BasisPoints::percent(50).unwrap(),
            now,
        )
        .unwrap();
        contract
            .purchase_shares(UserId::new(), 50, Money::ZERO, now)
            .unwrap();
        let request = DistributionRequest {
            contract_id: contract.id,
            total_revenue: Money::from_dollars(100),
            currency: Currency::Eur,
            period_start: now - chrono::Duration::days(30),
            period_end: now,
            artist_share: None,
        };

        let prepared =
            prepare_distribution(&contract, &request, &FeeSchedule::default(), now, &EventMetadata::correlated())
                .unwrap();

        let batch = prepared.batch.unwrap();
        assert_eq!(prepared.distribution.batch_id, Some(batch.id));
        assert_eq!(batch.items.len(), 2);
        assert_eq!(batch.distribution_id, Some(prepared.distribution.id));
        assert_eq!(prepared.staged.len(), 2);
        assert_eq!(prepared.staged[0].routing_key, topic_for(aggregate_types::DISTRIBUTION));
        assert_eq!(prepared.staged[1].routing_key, topic_for(aggregate_types::PAYMENT_BATCH));
        assert_eq!(
            prepared.staged[0].event.metadata.correlation_id,
            prepared.staged[1].event.metadata.correlation_id
        );
    }

    #[test]
    fn distribution_with_nobody_to_pay_is_complete_without_batch() {
        let now = Utc::now();
        let contract = OwnershipContract::new(
            ContractId::new(),
            SongId::new(),
            ArtistId::new(),
            100,
            BasisPoints::ZERO,
            now,
        )
        .unwrap();
        let request = DistributionRequest {
            contract_id: contract.id,
            total_revenue: Money::from_cents(1),
            currency: Currency::Usd,
            period_start: now - chrono::Duration::days(1),
            period_end: now,
            artist_share: None,
        };
        let prepared =
            prepare_distribution(&contract, &request, &FeeSchedule::default(), now, &EventMetadata::default())
                .unwrap();
        assert!(prepared.batch.is_none());
        assert_eq!(prepared.distribution.status, DistributionStatus::Completed);
        assert_eq!(prepared.staged.len(), 1);
    }
}
