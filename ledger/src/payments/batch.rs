//! Payment batches and their items.
//!
//! Counters (`successful_payments`, `failed_payments`) are updated together
//! with the item they count, so the batch status is always derivable from the
//! counters alone.

use crate::distribution::engine::{Distribution, DistributionMode};
use crate::error::{LedgerError, PublicFailure, Result};
use crate::events::PaymentEvent;
use crate::types::{ArtistId, BatchId, Currency, DistributionId, Money, PaymentId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Purpose of a batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchType {
    /// Fixed-royalty distribution payouts.
    RoyaltyDistribution,
    /// Fractional-ownership revenue payouts.
    RevenueSharing,
    /// Listen-to-earn token payouts.
    ListenRewards,
    /// Refunds.
    Refunds,
}

impl BatchType {
    /// Column value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RoyaltyDistribution => "royalty_distribution",
            Self::RevenueSharing => "revenue_sharing",
            Self::ListenRewards => "listen_rewards",
            Self::Refunds => "refunds",
        }
    }

    /// Parse a column value.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Storage`] for unknown values.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "royalty_distribution" => Ok(Self::RoyaltyDistribution),
            "revenue_sharing" => Ok(Self::RevenueSharing),
            "listen_rewards" => Ok(Self::ListenRewards),
            "refunds" => Ok(Self::Refunds),
            other => Err(LedgerError::Storage(format!("unknown batch type: {other}"))),
        }
    }
}

/// Batch lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchStatus {
    /// Created; nothing attempted yet.
    Pending,
    /// Items being paid.
    Processing,
    /// Every item paid.
    Completed,
    /// Every item resolved, some failed.
    PartiallyCompleted,
    /// Every item failed.
    Failed,
}

impl BatchStatus {
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
            other => Err(LedgerError::Storage(format!("unknown batch status: {other}"))),
        }
    }

    /// Whether every item has resolved.
    #[must_use]
    pub const fn is_settled(self) -> bool {
        matches!(self, Self::Completed | Self::PartiallyCompleted | Self::Failed)
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Item lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemStatus {
    /// Waiting to be paid.
    Pending,
    /// Claimed by an orchestrator; gateway call in flight.
    Processing,
    /// Paid.
    Completed,
    /// Gateway refused or failed.
    Failed,
}

impl ItemStatus {
    /// Column value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
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
            "failed" => Ok(Self::Failed),
            other => Err(LedgerError::Storage(format!("unknown item status: {other}"))),
        }
    }

    /// Whether the item has a final outcome.
    #[must_use]
    pub const fn is_resolved(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who is paid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Recipient {
    /// Song artist.
    Artist(ArtistId),
    /// Fractional owner.
    Shareholder(UserId),
    /// Rewarded listener.
    Listener(UserId),
}

impl Recipient {
    /// Column value for the recipient kind.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Artist(_) => "artist",
            Self::Shareholder(_) => "shareholder",
            Self::Listener(_) => "listener",
        }
    }

    /// Recipient's identifier.
    #[must_use]
    pub const fn id(&self) -> &Uuid {
        match self {
            Self::Artist(id) => id.as_uuid(),
            Self::Shareholder(id) | Self::Listener(id) => id.as_uuid(),
        }
    }

    /// Rebuild from stored columns.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Storage`] for unknown kinds.
    pub fn from_parts(kind: &str, id: Uuid) -> Result<Self> {
        match kind {
            "artist" => Ok(Self::Artist(ArtistId::from_uuid(id))),
            "shareholder" => Ok(Self::Shareholder(UserId::from_uuid(id))),
            "listener" => Ok(Self::Listener(UserId::from_uuid(id))),
            other => Err(LedgerError::Storage(format!("unknown recipient kind: {other}"))),
        }
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

/// One payment in a batch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItem {
    /// Payment, unique within the batch.
    pub payment_id: PaymentId,
    /// Payee.
    pub recipient: Recipient,
    /// Amount owed.
    pub amount: Money,
    /// Lifecycle state.
    pub status: ItemStatus,
    /// Gateway attempts so far.
    pub attempts: u32,
    /// Gateway reference once paid.
    pub transaction_id: Option<String>,
    /// Last failure reason.
    pub error_message: Option<String>,
    /// When the current claim was taken.
    pub claimed_at: Option<DateTime<Utc>>,
    /// When the item resolved.
    pub resolved_at: Option<DateTime<Utc>>,
}

impl BatchItem {
    fn new(recipient: Recipient, amount: Money) -> Self {
        Self {
            payment_id: PaymentId::new(),
            recipient,
            amount,
            status: ItemStatus::Pending,
            attempts: 0,
            transaction_id: None,
            error_message: None,
            claimed_at: None,
            resolved_at: None,
        }
    }

    /// Gateway idempotency key: `batch_id:payment_id`.
    #[must_use]
    pub fn idempotency_key(&self, batch_id: BatchId) -> String {
        format!("{batch_id}:{}", self.payment_id)
    }
}

/// Gateway result for one item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ItemOutcome {
    /// Paid.
    Paid {
        /// Gateway reference.
        transaction_id: String,
    },
    /// Not paid.
    Failed {
        /// Full gateway error, kept on the item for operators.
        reason: String,
        /// What is published about it.
        failure: PublicFailure,
    },
}

/// Result of recording an item outcome.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Recorded {
    /// The outcome changed the batch.
    Applied {
        /// Events to stage.
        events: Vec<PaymentEvent>,
        /// Final status when this outcome settled the batch.
        settled: Option<BatchStatus>,
    },
    /// The item had already resolved; nothing changed.
    Duplicate,
}

/// A group of payments of one type and currency.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentBatch {
    /// Batch.
    pub id: BatchId,
    /// Purpose.
    pub batch_type: BatchType,
    /// Currency of every item.
    pub currency: Currency,
    /// Distribution paid by this batch.
    pub distribution_id: Option<DistributionId>,
    /// Payments.
    pub items: Vec<BatchItem>,
    /// Sum of item amounts.
    pub total_amount: Money,
    /// Items paid.
    pub successful_payments: u32,
    /// Items failed.
    pub failed_payments: u32,
    /// Lifecycle state.
    pub status: BatchStatus,
    /// When the batch was created.
    pub created_at: DateTime<Utc>,
    /// When every item resolved.
    pub settled_at: Option<DateTime<Utc>>,
}

impl PaymentBatch {
    /// New pending batch.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InvalidAmount`] for an empty batch, a zero-amount item,
    /// or a total that overflows.
    pub fn new(
        id: BatchId,
        batch_type: BatchType,
        currency: Currency,
        payments: Vec<(Recipient, Money)>,
        distribution_id: Option<DistributionId>,
        now: DateTime<Utc>,
    ) -> Result<(Self, PaymentEvent)> {
        if payments.is_empty() {
            return Err(LedgerError::InvalidAmount("payment batch has no items".into()));
        }
        if let Some((recipient, _)) = payments.iter().find(|(_, amount)| amount.is_zero()) {
            return Err(LedgerError::InvalidAmount(format!(
                "zero payment to {recipient}"
            )));
        }
        let total_amount = Money::checked_sum(payments.iter().map(|(_, amount)| *amount))
            .ok_or_else(|| LedgerError::InvalidAmount("batch total overflow".into()))?;
        let item_count = u32::try_from(payments.len())
            .map_err(|_| LedgerError::InvalidAmount("too many payments in one batch".into()))?;

        let batch = Self {
            id,
            batch_type,
            currency,
            distribution_id,
            items: payments
                .into_iter()
                .map(|(recipient, amount)| BatchItem::new(recipient, amount))
                .collect(),
            total_amount,
            successful_payments: 0,
            failed_payments: 0,
            status: BatchStatus::Pending,
            created_at: now,
            settled_at: None,
        };
        let event = PaymentEvent::BatchCreated {
            batch_id: id,
            batch_type,
            item_count,
            total_amount,
            currency,
        };
        Ok((batch, event))
    }

    /// Batch paying the artist and every shareholder of a distribution.
    ///
    /// Zero amounts are skipped; `None` when nobody is owed anything.
    ///
    /// # Errors
    ///
    /// As [`Self::new`].
    pub fn for_distribution(
        distribution: &Distribution,
        now: DateTime<Utc>,
    ) -> Result<Option<(Self, PaymentEvent)>> {
        let payments: Vec<(Recipient, Money)> =
            std::iter::once((Recipient::Artist(distribution.artist_id), distribution.artist_amount))
                .chain(
                    distribution
                        .payouts
                        .iter()
                        .map(|p| (Recipient::Shareholder(p.holder), p.amount)),
                )
                .filter(|(_, amount)| !amount.is_zero())
                .collect();
        if payments.is_empty() {
            return Ok(None);
        }
        let batch_type = match distribution.mode {
            DistributionMode::Fractional => BatchType::RevenueSharing,
            DistributionMode::Royalty { .. } => BatchType::RoyaltyDistribution,
        };
        Self::new(
            BatchId::new(),
            batch_type,
            distribution.currency,
            payments,
            Some(distribution.id),
            now,
        )
        .map(Some)
    }

    /// Move a pending batch to processing. No-op when already processing.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InvalidTransition`] for settled batches.
    pub fn begin_processing(&mut self) -> Result<()> {
        match self.status {
            BatchStatus::Pending => {
                self.status = BatchStatus::Processing;
                Ok(())
            }
            BatchStatus::Processing => Ok(()),
            other => Err(self.invalid("process", other.as_str())),
        }
    }

    /// Claim an item for a gateway call.
    ///
    /// Pending items are claimable, as are processing items whose claim is
    /// older than `stale_before` (their orchestrator is presumed dead; the
    /// gateway idempotency key prevents a double charge). Returns `None` for
    /// items that are resolved or freshly claimed elsewhere.
    ///
    /// # Errors
    ///
    /// [`LedgerError::NotFound`] for unknown items; [`LedgerError::InvalidTransition`]
    /// unless the batch is processing.
    pub fn claim_item(
        &mut self,
        payment_id: PaymentId,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<BatchItem>> {
        if self.status != BatchStatus::Processing {
            return Err(self.invalid("claim items of", self.status.as_str()));
        }
        let item = self.item_mut(payment_id)?;
        let claimable = match item.status {
            ItemStatus::Pending => true,
            ItemStatus::Processing => item.claimed_at.is_none_or(|at| at < stale_before),
            ItemStatus::Completed | ItemStatus::Failed => false,
        };
        if !claimable {
            return Ok(None);
        }
        item.status = ItemStatus::Processing;
        item.attempts += 1;
        item.claimed_at = Some(now);
        Ok(Some(item.clone()))
    }

    /// Record the gateway outcome of a claimed item and update the counters.
    ///
    /// Resolved items return [`Recorded::Duplicate`] and change nothing.
    ///
    /// # Errors
    ///
    /// [`LedgerError::NotFound`] for unknown items; [`LedgerError::InvalidTransition`]
    /// for items that were never claimed.
    pub fn record_outcome(
        &mut self,
        payment_id: PaymentId,
        outcome: ItemOutcome,
        now: DateTime<Utc>,
    ) -> Result<Recorded> {
        let batch_id = self.id;
        let item = self.item_mut(payment_id)?;
        match item.status {
            ItemStatus::Processing => {}
            ItemStatus::Completed | ItemStatus::Failed => return Ok(Recorded::Duplicate),
            ItemStatus::Pending => {
                return Err(LedgerError::InvalidTransition {
                    entity: "payment",
                    id: payment_id.to_string(),
                    action: "record an outcome for",
                    state: item.status.to_string(),
                });
            }
        }

        item.resolved_at = Some(now);
        item.claimed_at = None;
        let event = match outcome {
            ItemOutcome::Paid { transaction_id } => {
                item.status = ItemStatus::Completed;
                item.transaction_id = Some(transaction_id.clone());
                item.error_message = None;
                PaymentEvent::PaymentCompleted {
                    batch_id,
                    payment_id,
                    recipient: item.recipient,
                    amount: item.amount,
                    transaction_id,
                }
            }
            ItemOutcome::Failed { reason, failure } => {
                item.status = ItemStatus::Failed;
                item.error_message = Some(reason);
                PaymentEvent::PaymentFailed {
                    batch_id,
                    payment_id,
                    recipient: item.recipient,
                    amount: item.amount,
                    failure,
                }
            }
        };
        match event {
            PaymentEvent::PaymentCompleted { .. } => self.successful_payments += 1,
            _ => self.failed_payments += 1,
        }

        let mut events = vec![event];
        let settled = self.settle_if_resolved(now);
        if let Some(status) = settled {
            events.push(PaymentEvent::BatchSettled {
                batch_id,
                status,
                successful_payments: self.successful_payments,
                failed_payments: self.failed_payments,
            });
        }
        self.check_counters()?;
        Ok(Recorded::Applied { events, settled })
    }

    /// Return failed items to pending so they are paid again. Completed items
    /// are untouched. Returns the reset payment IDs.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InvariantViolation`] if the counters disagree with the items.
    pub fn reset_failed(&mut self) -> Result<Vec<PaymentId>> {
        let mut reset = Vec::new();
        for item in &mut self.items {
            if item.status == ItemStatus::Failed {
                item.status = ItemStatus::Pending;
                item.resolved_at = None;
                reset.push(item.payment_id);
            }
        }
        if reset.is_empty() {
            return Ok(reset);
        }
        let count = u32::try_from(reset.len()).unwrap_or(u32::MAX);
        self.failed_payments = self.failed_payments.checked_sub(count).ok_or_else(|| {
            LedgerError::InvariantViolation(format!(
                "batch {} counted {} failures but reset {count}",
                self.id, self.failed_payments
            ))
        })?;
        self.status = BatchStatus::Processing;
        self.settled_at = None;
        self.check_counters()?;
        Ok(reset)
    }

    /// Status implied by the counters.
    #[must_use]
    pub fn derive_status(&self) -> BatchStatus {
        let resolved = self.successful_payments + self.failed_payments;
        let count = u32::try_from(self.items.len()).unwrap_or(u32::MAX);
        if resolved < count {
            return if self.status == BatchStatus::Pending {
                BatchStatus::Pending
            } else {
                BatchStatus::Processing
            };
        }
        match (self.successful_payments, self.failed_payments) {
            (_, 0) => BatchStatus::Completed,
            (0, _) => BatchStatus::Failed,
            _ => BatchStatus::PartiallyCompleted,
        }
    }

    /// Items not yet resolved.
    pub fn unresolved(&self) -> impl Iterator<Item = &BatchItem> {
        self.items.iter().filter(|i| !i.status.is_resolved())
    }

    /// Item by payment ID.
    #[must_use]
    pub fn item(&self, payment_id: PaymentId) -> Option<&BatchItem> {
        self.items.iter().find(|i| i.payment_id == payment_id)
    }

    /// Counters agree with item statuses.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InvariantViolation`] when they do not.
    pub fn check_counters(&self) -> Result<()> {
        let count = |status| {
            u32::try_from(self.items.iter().filter(|i| i.status == status).count())
                .unwrap_or(u32::MAX)
        };
        let (completed, failed) = (count(ItemStatus::Completed), count(ItemStatus::Failed));
        if completed != self.successful_payments || failed != self.failed_payments {
            return Err(LedgerError::InvariantViolation(format!(
                "batch {} counters {}/{} disagree with items {completed}/{failed}",
                self.id, self.successful_payments, self.failed_payments
            )));
        }
        Ok(())
    }

    fn settle_if_resolved(&mut self, now: DateTime<Utc>) -> Option<BatchStatus> {
        let status = self.derive_status();
        if status.is_settled() {
            self.status = status;
            self.settled_at = Some(now);
            Some(status)
        } else {
            None
        }
    }

    fn item_mut(&mut self, payment_id: PaymentId) -> Result<&mut BatchItem> {
        let batch_id = self.id;
        self.items
            .iter_mut()
            .find(|i| i.payment_id == payment_id)
            .ok_or_else(|| LedgerError::not_found("payment", format!("{batch_id}:{payment_id}")))
    }

    fn invalid(&self, action: &'static str, state: &str) -> LedgerError {
        LedgerError::InvalidTransition {
            entity: "payment batch",
            id: self.id.to_string(),
            action,
            state: state.to_string(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::PublicStatus;
    use chrono::Duration;

    fn now() -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH + Duration::days(20_000)
    }

    fn batch(n: u64) -> PaymentBatch {
        let payments = (1..=n)
            .map(|i| (Recipient::Shareholder(UserId::new()), Money::from_cents(i * 100)))
            .collect();
        let (mut batch, _) = PaymentBatch::new(
            BatchId::new(),
            BatchType::RevenueSharing,
            Currency::Usd,
            payments,
            None,
            now(),
        )
        .unwrap();
        batch.begin_processing().unwrap();
        batch
    }

    fn pay(batch: &mut PaymentBatch, index: usize, outcome: ItemOutcome) -> Recorded {
        let id = batch.items[index].payment_id;
        batch.claim_item(id, now(), now()).unwrap().unwrap();
        batch.record_outcome(id, outcome, now()).unwrap()
    }

    fn paid() -> ItemOutcome {
        ItemOutcome::Paid {
            transaction_id: "txn".into(),
        }
    }

    fn declined() -> ItemOutcome {
        ItemOutcome::Failed {
            reason: "Payment declined: insufficient funds".into(),
            failure: PublicFailure {
                status: PublicStatus::Rejected,
                reference: Uuid::new_v4(),
            },
        }
    }

    #[test]
    fn new_batch_rejects_empty_and_zero_items() {
        assert!(PaymentBatch::new(BatchId::new(), BatchType::Refunds, Currency::Usd, vec![], None, now()).is_err());
        assert!(
            PaymentBatch::new(
                BatchId::new(),
                BatchType::Refunds,
                Currency::Usd,
                vec![(Recipient::Listener(UserId::new()), Money::ZERO)],
                None,
                now()
            )
            .is_err()
        );
    }

    #[test]
    fn all_paid_completes_batch() {
        let mut b = batch(2);
        assert!(matches!(pay(&mut b, 0, paid()), Recorded::Applied { settled: None, .. }));
        assert_eq!(b.derive_status(), BatchStatus::Processing);
        let recorded = pay(&mut b, 1, paid());
        assert!(matches!(recorded, Recorded::Applied { settled: Some(BatchStatus::Completed), ref events } if events.len() == 2));
        assert_eq!(b.status, BatchStatus::Completed);
        assert_eq!(b.total_amount, Money::from_cents(300));
    }

    #[test]
    fn mixed_outcomes_partially_complete() {
        let mut b = batch(3);
        pay(&mut b, 0, paid());
        pay(&mut b, 1, declined());
        pay(&mut b, 2, paid());
        assert_eq!(b.status, BatchStatus::PartiallyCompleted);
        assert_eq!((b.successful_payments, b.failed_payments), (2, 1));
        assert_eq!(b.items[1].error_message.as_deref(), Some("declined"));
    }

    #[test]
    fn all_failed_fails_batch() {
        let mut b = batch(1);
        pay(&mut b, 0, declined());
        assert_eq!(b.status, BatchStatus::Failed);
    }

    #[test]
    fn resolved_items_are_not_reclaimed_or_recounted() {
        let mut b = batch(2);
        pay(&mut b, 0, paid());
        let id = b.items[0].payment_id;
        assert!(b.claim_item(id, now(), now() + Duration::hours(1)).unwrap().is_none());
        assert_eq!(b.record_outcome(id, declined(), now()).unwrap(), Recorded::Duplicate);
        assert_eq!(b.successful_payments, 1);
        b.check_counters().unwrap();
    }

    #[test]
    fn fresh_claims_are_exclusive_and_stale_claims_are_reclaimed() {
        let mut b = batch(1);
        let id = b.items[0].payment_id;
        assert!(b.claim_item(id, now(), now()).unwrap().is_some());
        assert!(b.claim_item(id, now(), now()).unwrap().is_none());
        let later = now() + Duration::minutes(10);
        let reclaimed = b.claim_item(id, later, later).unwrap().unwrap();
        assert_eq!(reclaimed.attempts, 2);
    }

    #[test]
    fn unclaimed_outcome_is_rejected() {
        let mut b = batch(1);
        let id = b.items[0].payment_id;
        assert!(matches!(
            b.record_outcome(id, paid(), now()),
            Err(LedgerError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn reset_failed_only_touches_failed_items() {
        let mut b = batch(3);
        pay(&mut b, 0, paid());
        pay(&mut b, 1, declined());
        pay(&mut b, 2, declined());
        let reset = b.reset_failed().unwrap();
        assert_eq!(reset.len(), 2);
        assert_eq!(b.status, BatchStatus::Processing);
        assert_eq!((b.successful_payments, b.failed_payments), (1, 0));
        assert_eq!(b.items[0].status, ItemStatus::Completed);

        pay(&mut b, 1, paid());
        pay(&mut b, 2, paid());
        assert_eq!(b.status, BatchStatus::Completed);
        assert_eq!(b.items[2].attempts, 2);
    }

    #[test]
    fn idempotency_key_joins_batch_and_payment() {
        let b = batch(1);
        let key = b.items[0].idempotency_key(b.id);
        assert_eq!(key, format!("{}:{}", b.id, b.items[0].payment_id));
    }

    #[test]
    fn recipient_round_trips_through_columns() {
        let r = Recipient::Artist(ArtistId::new());
        assert_eq!(Recipient::from_parts(r.kind(), *r.id()).unwrap(), r);
        assert!(Recipient::from_parts("nobody", Uuid::nil()).is_err());
    }
}
