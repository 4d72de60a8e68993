//! Revenue split calculation.
//!
//! Pure and synchronous. Two modes:
//!
//! - **Fractional ownership** (no fixed artist royalty): the platform fee comes
//!   off the top; the rest (`net`) is split by share count. The artist receives
//!   its retained percentage of `net`, each shareholder `net × shares / total_shares`,
//!   and the value of unsold shares reverts to the platform.
//! - **Royalty** (fixed artist share): fee and artist share are percentages of
//!   the total; the remaining investor pool is split among shareholders by their
//!   fraction of the shares sold.
//!
//! Every split floors. Whatever the floors leave over goes to the platform, so
//! `artist + Σ shareholders + platform == total` exactly.

use crate::error::{LedgerError, Result};
use crate::ownership::OwnershipContract;
use crate::payments::batch::BatchStatus;
use crate::types::{
    ArtistId, BasisPoints, BatchId, ContractId, Currency, DistributionId, Money, UserId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Platform fee configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FeeSchedule {
    /// Platform fee as a share of total revenue.
    pub platform_fee: BasisPoints,
}

impl FeeSchedule {
    /// Default platform fee: 5%.
    pub const DEFAULT_PLATFORM_FEE_BPS: u32 = 500;

    /// Schedule with the given fee.
    #[must_use]
    pub const fn new(platform_fee: BasisPoints) -> Self {
        Self { platform_fee }
    }
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            platform_fee: BasisPoints::new(Self::DEFAULT_PLATFORM_FEE_BPS)
                .unwrap_or(BasisPoints::ZERO),
        }
    }
}

/// Revenue to distribute for one contract and period.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionRequest {
    /// Contract earning the revenue.
    pub contract_id: ContractId,
    /// Revenue earned.
    pub total_revenue: Money,
    /// Currency of the revenue and every payment.
    pub currency: Currency,
    /// Period start.
    pub period_start: DateTime<Utc>,
    /// Period end.
    pub period_end: DateTime<Utc>,
    /// `Some` selects the royalty mode with this artist share; `None` the
    /// fractional-ownership mode.
    pub artist_share: Option<BasisPoints>,
}

impl DistributionRequest {
    /// Reject malformed requests before any state is touched.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InvalidPeriod`] unless `period_start < period_end`
    /// - [`LedgerError::InvalidAmount`] for zero revenue
    /// - [`LedgerError::InvalidPercentage`] if fee and artist share exceed 100%
    pub fn validate(&self, fees: &FeeSchedule) -> Result<()> {
        if self.period_start >= self.period_end {
            return Err(LedgerError::InvalidPeriod {
                start: self.period_start,
                end: self.period_end,
            });
        }
        if self.total_revenue.is_zero() {
            return Err(LedgerError::InvalidAmount(
                "total revenue must be positive".into(),
            ));
        }
        if let Some(artist_share) = self.artist_share {
            if fees.platform_fee.checked_add(artist_share).is_none() {
                return Err(LedgerError::InvalidPercentage(format!(
                    "platform fee {} plus artist share {artist_share} exceeds 100%",
                    fees.platform_fee
                )));
            }
        }
        Ok(())
    }

    /// Split mode selected by the request.
    #[must_use]
    pub const fn mode(&self) -> DistributionMode {
        match self.artist_share {
            Some(artist_share) => DistributionMode::Royalty { artist_share },
            None => DistributionMode::Fractional,
        }
    }
}

/// How revenue is split.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistributionMode {
    /// Split by share count, artist keeping its retained percentage.
    Fractional,
    /// Fixed artist royalty; shareholders split the investor pool.
    Royalty {
        /// Artist's share of total revenue.
        artist_share: BasisPoints,
    },
}

/// Distribution lifecycle, following its payment batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistributionStatus {
    /// Calculated; payments not started.
    #[default]
    Pending,
    /// Payments in progress.
    Processing,
    /// Every payment succeeded.
    Completed,
    /// Some payments failed.
    PartiallyCompleted,
    /// Every payment failed.
    Failed,
}

impl DistributionStatus {
    /// Column value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::PartiallyCompleted => "partially_completed",
            Self::Failed => "failed",
        }
    }

    /// Parse a column value.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Storage`] for unknown values.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "partially_completed" => Ok(Self::PartiallyCompleted),
            "failed" => Ok(Self::Failed),
            other => Err(LedgerError::Storage(format!(
                "unknown distribution status: {other}"
            ))),
        }
    }

    /// Whether every payment has resolved.
    #[must_use]
    pub const fn is_settled(self) -> bool {
        matches!(self, Self::Completed | Self::PartiallyCompleted | Self::Failed)
    }
}

impl fmt::Display for DistributionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<BatchStatus> for DistributionStatus {
    fn from(status: BatchStatus) -> Self {
        match status {
            BatchStatus::Pending => Self::Pending,
            BatchStatus::Processing => Self::Processing,
            BatchStatus::Completed => Self::Completed,
            BatchStatus::PartiallyCompleted => Self::PartiallyCompleted,
            BatchStatus::Failed => Self::Failed,
        }
    }
}

/// One shareholder's cut, with ownership frozen at calculation time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareholderPayout {
    /// Shareholder.
    pub holder: UserId,
    /// Shares held when the distribution was calculated.
    pub shares: u64,
    /// Ownership percentage at distribution.
    pub ownership: BasisPoints,
    /// Amount owed.
    pub amount: Money,
}

/// A calculated revenue split.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Distribution {
    /// Distribution.
    pub id: DistributionId,
    /// Contract.
    pub contract_id: ContractId,
    /// Artist paid.
    pub artist_id: ArtistId,
    /// Split mode.
    pub mode: DistributionMode,
    /// Revenue split.
    pub total_revenue: Money,
    /// Currency.
    pub currency: Currency,
    /// Period start.
    pub period_start: DateTime<Utc>,
    /// Period end.
    pub period_end: DateTime<Utc>,
    /// Platform fee proper.
    pub platform_fee: Money,
    /// Value of ownership nobody holds; reverts to the platform.
    pub unallocated: Money,
    /// Left over by flooring; goes to the platform.
    pub rounding_remainder: Money,
    /// Artist's amount.
    pub artist_amount: Money,
    /// Shareholder cuts in holder order.
    pub payouts: Vec<ShareholderPayout>,
    /// Lifecycle state.
    pub status: DistributionStatus,
    /// Batch paying the recipients; `None` when nobody is owed anything.
    pub batch_id: Option<BatchId>,
    /// When the split was calculated.
    pub created_at: DateTime<Utc>,
}

impl Distribution {
    /// Everything the platform keeps: fee, unallocated value and rounding remainder.
    #[must_use]
    pub fn platform_total(&self) -> Money {
        Money::from_cents(
            self.platform_fee.cents() + self.unallocated.cents() + self.rounding_remainder.cents(),
        )
    }

    /// Sum of shareholder payouts.
    #[must_use]
    pub fn shareholder_total(&self) -> Money {
        Money::from_cents(self.payouts.iter().map(|p| p.amount.cents()).sum())
    }

    /// `artist + Σ shareholders + platform == total`.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InvariantViolation`] when value was created or lost.
    pub fn check_conservation(&self) -> Result<()> {
        let paid = Money::checked_sum(
            std::iter::once(self.artist_amount)
                .chain(self.payouts.iter().map(|p| p.amount))
                .chain([self.platform_fee, self.unallocated, self.rounding_remainder]),
        )
        .ok_or_else(|| LedgerError::InvariantViolation("distribution total overflow".into()))?;
        if paid != self.total_revenue {
            return Err(LedgerError::InvariantViolation(format!(
                "distribution {} allocates {paid} of {}",
                self.id, self.total_revenue
            )));
        }
        Ok(())
    }
}

/// Calculate a distribution from the contract's current holdings.
///
/// The holdings are read once and frozen into the payouts.
///
/// # Errors
///
/// Validation errors from [`DistributionRequest::validate`];
/// [`LedgerError::InvariantViolation`] if the contract is inconsistent or the
/// split does not conserve value.
pub fn calculate(
    id: DistributionId,
    contract: &OwnershipContract,
    request: &DistributionRequest,
    fees: &FeeSchedule,
    now: DateTime<Utc>,
) -> Result<Distribution> {
    request.validate(fees)?;
    if request.contract_id != contract.id {
        return Err(LedgerError::InvariantViolation(format!(
            "request for contract {} calculated against contract {}",
            request.contract_id, contract.id
        )));
    }
    contract.validate()?;

    let total = request.total_revenue;
    let platform_fee = total.share(fees.platform_fee);
    let holdings = contract.snapshot();

    let (artist_amount, payouts, unallocated, pool) = match request.mode() {
        DistributionMode::Fractional => {
            let net = subtract(total, platform_fee)?;
            let artist = net.share(contract.artist_retained);
            let payouts = payouts(&holdings, net, contract.total_shares, contract.total_shares);
            let unsold = contract.shares_available_for_sale - contract.shares_sold;
            let unallocated = net.mul_ratio(unsold, contract.total_shares);
            (artist, payouts, unallocated, net)
        }
        DistributionMode::Royalty { artist_share } => {
            let artist = total.share(artist_share);
            let pool = subtract(subtract(total, platform_fee)?, artist)?;
            if contract.shares_sold == 0 {
                (artist, Vec::new(), pool, pool)
            } else {
                let payouts = payouts(&holdings, pool, contract.shares_sold, contract.total_shares);
                (artist, payouts, Money::ZERO, pool)
            }
        }
    };

    // The fractional pool still contains the artist's share; the royalty pool
    // does not.
    let pool_after_artist = match request.mode() {
        DistributionMode::Fractional => subtract(pool, artist_amount)?,
        DistributionMode::Royalty { .. } => pool,
    };
    let shareholder_total = Money::checked_sum(payouts.iter().map(|p| p.amount))
        .ok_or_else(|| LedgerError::InvariantViolation("payout total overflow".into()))?;
    let rounding_remainder =
        subtract(subtract(pool_after_artist, shareholder_total)?, unallocated)?;

    let distribution = Distribution {
        id,
        contract_id: contract.id,
        artist_id: contract.artist_id,
        mode: request.mode(),
        total_revenue: total,
        currency: request.currency,
        period_start: request.period_start,
        period_end: request.period_end,
        platform_fee,
        unallocated,
        rounding_remainder,
        artist_amount,
        payouts,
        status: DistributionStatus::Pending,
        batch_id: None,
        created_at: now,
    };
    distribution.check_conservation()?;
    Ok(distribution)
}

fn payouts(
    holdings: &[(UserId, u64)],
    pool: Money,
    denominator: u64,
    total_shares: u64,
) -> Vec<ShareholderPayout> {
    holdings
        .iter()
        .map(|&(holder, shares)| ShareholderPayout {
            holder,
            shares,
            ownership: BasisPoints::ratio(shares, total_shares),
            amount: pool.mul_ratio(shares, denominator),
        })
        .collect()
}

fn subtract(from: Money, amount: Money) -> Result<Money> {
    from.checked_sub(amount).ok_or_else(|| {
        LedgerError::InvariantViolation(format!("split of {from} allocates {amount}"))
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::SongId;
    use chrono::Duration;
    use proptest::prelude::*;

    fn period() -> (DateTime<Utc>, DateTime<Utc>) {
        let start = DateTime::<Utc>::UNIX_EPOCH + Duration::days(20_000);
        (start, start + Duration::days(30))
    }

    fn contract(total_shares: u64, retained_pct: u32) -> OwnershipContract {
        OwnershipContract::new(
            ContractId::new(),
            SongId::new(),
            ArtistId::new(),
            total_shares,
            BasisPoints::percent(retained_pct).unwrap(),
            period().0,
        )
        .unwrap()
    }

    fn request(
        contract: &OwnershipContract,
        cents: u64,
        artist_share: Option<BasisPoints>,
    ) -> DistributionRequest {
        let (period_start, period_end) = period();
        DistributionRequest {
            contract_id: contract.id,
            total_revenue: Money::from_cents(cents),
            currency: Currency::Usd,
            period_start,
            period_end,
            artist_share,
        }
    }

    fn ten_percent() -> FeeSchedule {
        FeeSchedule::new(BasisPoints::percent(10).unwrap())
    }

    #[test]
    fn fractional_split_with_two_shareholders() {
        // 1000 shares, artist keeps 20%; A holds 30%, B holds 10%; 10% fee.
        let mut c = contract(1_000, 20);
        let (a, b) = (UserId::new(), UserId::new());
        c.purchase_shares(a, 300, Money::ZERO, period().0).unwrap();
        c.purchase_shares(b, 100, Money::ZERO, period().0).unwrap();

        let d = calculate(
            DistributionId::new(),
            &c,
            &request(&c, 1_000, None),
            &ten_percent(),
            period().1,
        )
        .unwrap();

        assert_eq!(d.platform_fee, Money::from_cents(100));
        assert_eq!(d.artist_amount, Money::from_cents(180));
        let amount = |holder| d.payouts.iter().find(|p| p.holder == holder).unwrap().amount;
        assert_eq!(amount(a), Money::from_cents(270));
        assert_eq!(amount(b), Money::from_cents(90));
        assert_eq!(d.unallocated, Money::from_cents(360));
        assert_eq!(d.rounding_remainder, Money::ZERO);
        assert_eq!(d.platform_total(), Money::from_cents(460));
        assert_eq!(
            d.payouts.iter().find(|p| p.holder == a).unwrap().ownership,
            BasisPoints::percent(30).unwrap()
        );
        d.check_conservation().unwrap();
    }

    #[test]
    fn rounding_remainder_goes_to_platform() {
        let mut c = contract(3, 0);
        for _ in 0..3 {
            c.purchase_shares(UserId::new(), 1, Money::ZERO, period().0).unwrap();
        }
        let d = calculate(
            DistributionId::new(),
            &c,
            &request(&c, 100, None),
            &FeeSchedule::new(BasisPoints::ZERO),
            period().1,
        )
        .unwrap();
        assert!(d.payouts.iter().all(|p| p.amount == Money::from_cents(33)));
        assert_eq!(d.rounding_remainder, Money::from_cents(1));
        d.check_conservation().unwrap();
    }

    #[test]
    fn royalty_split_divides_investor_pool_by_shares_sold() {
        let mut c = contract(1_000, 20);
        let (a, b) = (UserId::new(), UserId::new());
        c.purchase_shares(a, 300, Money::ZERO, period().0).unwrap();
        c.purchase_shares(b, 100, Money::ZERO, period().0).unwrap();

        let artist_share = BasisPoints::percent(50).unwrap();
        let d = calculate(
            DistributionId::new(),
            &c,
            &request(&c, 10_000, Some(artist_share)),
            &ten_percent(),
            period().1,
        )
        .unwrap();

        assert_eq!(d.platform_fee, Money::from_cents(1_000));
        assert_eq!(d.artist_amount, Money::from_cents(5_000));
        // Investor pool 4000 split 3:1.
        assert_eq!(d.payouts[0].amount.cents() + d.payouts[1].amount.cents(), 4_000);
        assert_eq!(d.unallocated, Money::ZERO);
        d.check_conservation().unwrap();
    }

    #[test]
    fn royalty_pool_without_shareholders_reverts_to_platform() {
        let c = contract(100, 0);
        let d = calculate(
            DistributionId::new(),
            &c,
            &request(&c, 1_000, Some(BasisPoints::percent(40).unwrap())),
            &ten_percent(),
            period().1,
        )
        .unwrap();
        assert!(d.payouts.is_empty());
        assert_eq!(d.unallocated, Money::from_cents(500));
        assert_eq!(d.platform_total(), Money::from_cents(600));
    }

    #[test]
    fn malformed_requests_are_rejected() {
        let c = contract(100, 0);
        let mut r = request(&c, 1_000, None);
        r.period_end = r.period_start;
        assert!(matches!(r.validate(&ten_percent()), Err(LedgerError::InvalidPeriod { .. })));

        let r = request(&c, 0, None);
        assert!(matches!(r.validate(&ten_percent()), Err(LedgerError::InvalidAmount(_))));

        let r = request(&c, 1_000, Some(BasisPoints::percent(95).unwrap()));
        assert!(matches!(r.validate(&ten_percent()), Err(LedgerError::InvalidPercentage(_))));
    }

    #[test]
    fn mismatched_contract_is_an_invariant_violation() {
        let c = contract(100, 0);
        let other = contract(100, 0);
        assert!(matches!(
            calculate(
                DistributionId::new(),
                &c,
                &request(&other, 1_000, None),
                &ten_percent(),
                period().1,
            ),
            Err(LedgerError::InvariantViolation(_))
        ));
    }

    proptest! {
        #[test]
        fn every_cent_is_accounted_for(
            revenue in 1u64..10_000_000,
            fee_bps in 0u32..=5_000,
            retained_bps in 0u32..=10_000,
            artist_bps in proptest::option::of(0u32..=5_000),
            total_shares in 1u64..10_000,
            purchases in proptest::collection::vec(1u64..2_000, 0..12),
        ) {
            let mut c = OwnershipContract::new(
                ContractId::new(),
                SongId::new(),
                ArtistId::new(),
                total_shares,
                BasisPoints::new(retained_bps).unwrap(),
                period().0,
            ).unwrap();
            for shares in purchases {
                let _ = c.purchase_shares(UserId::new(), shares, Money::ZERO, period().0);
            }
            let fees = FeeSchedule::new(BasisPoints::new(fee_bps).unwrap());
            let r = request(&c, revenue, artist_bps.map(|b| BasisPoints::new(b).unwrap()));

            let d = calculate(DistributionId::new(), &c, &r, &fees, period().1).unwrap();
            let sum = d.artist_amount.cents()
                + d.shareholder_total().cents()
                + d.platform_total().cents();
            prop_assert_eq!(sum, revenue);
            prop_assert!(d.shareholder_total().cents() + d.platform_fee.cents() <= revenue);
        }
    }
}
