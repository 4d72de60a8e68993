//! Integration events staged in the outbox by ledger stores.
//!
//! Listen sessions are event-sourced and keep their own event type in
//! [`crate::rewards::session`]; the events here describe business changes made
//! to pools, distributions and payment batches, and are what downstream
//! consumers receive.

use crate::distribution::engine::DistributionStatus;
use crate::error::{PublicFailure, Result};
use crate::payments::batch::{BatchStatus, BatchType, Recipient};
use crate::types::{
    BasisPoints, BatchId, ContractId, Currency, DistributionId, Money, PaymentId, PoolId,
    ReservationId, SessionId, Tokens, UserId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tuneshare_core::event::{Event, EventMetadata};
use tuneshare_core::outbox::StagedEvent;
use tuneshare_core::stream::AggregateId;

/// Aggregate kinds, which also name the outbox topics.
pub mod aggregate_types {
    /// Reward pools and their reservations.
    pub const REWARD_POOL: &str = "reward_pool";
    /// Event-sourced listen sessions.
    pub const LISTEN_SESSION: &str = "listen_session";
    /// Revenue distributions.
    pub const DISTRIBUTION: &str = "distribution";
    /// Closed royalty periods awaiting distribution.
    pub const REVENUE: &str = "revenue";
    /// Payment batches.
    pub const PAYMENT_BATCH: &str = "payment_batch";
}

/// Changes to a reward pool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RewardEvent {
    /// A pool was funded for a validation period.
    PoolOpened {
        /// Pool.
        pool_id: PoolId,
        /// Tokens funded.
        total_tokens: Tokens,
        /// First instant reservations are accepted.
        validation_start: DateTime<Utc>,
        /// Instant reservations stop.
        validation_end: DateTime<Utc>,
    },
    /// Tokens set aside for an in-flight listen session.
    TokensReserved {
        /// Pool.
        pool_id: PoolId,
        /// Reservation.
        reservation_id: ReservationId,
        /// Session the reservation backs, if any.
        session_id: Option<SessionId>,
        /// Listener.
        user_id: UserId,
        /// Tokens reserved.
        amount: Tokens,
    },
    /// A reservation was finalized; `committed` tokens were distributed and the
    /// rest returned to the pool.
    ReservationCommitted {
        /// Pool.
        pool_id: PoolId,
        /// Reservation.
        reservation_id: ReservationId,
        /// Session the reservation backed.
        session_id: Option<SessionId>,
        /// Listener receiving the reward.
        user_id: UserId,
        /// Tokens originally reserved.
        reserved: Tokens,
        /// Tokens distributed.
        committed: Tokens,
    },
    /// A reservation was abandoned and its tokens returned.
    ReservationReleased {
        /// Pool.
        pool_id: PoolId,
        /// Reservation.
        reservation_id: ReservationId,
        /// Tokens returned.
        amount: Tokens,
    },
    /// Available tokens fell below the depletion threshold.
    PoolDepleted {
        /// Pool.
        pool_id: PoolId,
        /// Tokens still available.
        remaining: Tokens,
    },
    /// The validation period ended and the pool was closed.
    PoolClosed {
        /// Pool.
        pool_id: PoolId,
        /// Tokens distributed over the pool's life.
        distributed: Tokens,
        /// Tokens never distributed.
        unused: Tokens,
    },
}

impl Event for RewardEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::PoolOpened { .. } => "RewardPoolOpened.v1",
            Self::TokensReserved { .. } => "TokensReserved.v1",
            Self::ReservationCommitted { .. } => "ReservationCommitted.v1",
            Self::ReservationReleased { .. } => "ReservationReleased.v1",
            Self::PoolDepleted { .. } => "RewardPoolDepleted.v1",
            Self::PoolClosed { .. } => "RewardPoolClosed.v1",
        }
    }
}

/// Revenue facts that trigger a distribution.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RevenueEvent {
    /// A contract's royalty period closed with the given revenue.
    RoyaltyPeriodClosed {
        /// Contract earning the revenue.
        contract_id: ContractId,
        /// Revenue earned in the period.
        total_revenue: Money,
        /// Currency of the revenue.
        currency: Currency,
        /// Period start.
        period_start: DateTime<Utc>,
        /// Period end.
        period_end: DateTime<Utc>,
        /// Fixed artist royalty; absent for fractional-ownership contracts.
        artist_share: Option<BasisPoints>,
    },
}

impl Event for RevenueEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::RoyaltyPeriodClosed { .. } => "RoyaltyPeriodClosed.v1",
        }
    }
}

/// Distribution lifecycle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistributionEvent {
    /// Revenue was split and a payment batch created.
    RevenueDistributed {
        /// Distribution.
        distribution_id: DistributionId,
        /// Contract.
        contract_id: ContractId,
        /// Revenue split.
        total_revenue: Money,
        /// Artist's amount.
        artist_amount: Money,
        /// Sum paid to shareholders.
        shareholder_amount: Money,
        /// Platform fee including unallocated value and rounding remainder.
        platform_amount: Money,
        /// Batch paying the recipients.
        batch_id: Option<BatchId>,
        /// Period start.
        period_start: DateTime<Utc>,
        /// Period end.
        period_end: DateTime<Utc>,
    },
    /// Every payment of the distribution resolved.
    DistributionSettled {
        /// Distribution.
        distribution_id: DistributionId,
        /// Final status.
        status: DistributionStatus,
    },
}

impl Event for DistributionEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::RevenueDistributed { .. } => "RevenueDistributed.v1",
            Self::DistributionSettled { .. } => "DistributionSettled.v1",
        }
    }
}

/// Payment batch lifecycle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentEvent {
    /// A batch of payments was created.
    BatchCreated {
        /// Batch.
        batch_id: BatchId,
        /// Batch purpose.
        batch_type: BatchType,
        /// Number of payments.
        item_count: u32,
        /// Sum of payments.
        total_amount: Money,
        /// Currency of every payment.
        currency: Currency,
    },
    /// One payment succeeded.
    PaymentCompleted {
        /// Batch.
        batch_id: BatchId,
        /// Payment.
        payment_id: PaymentId,
        /// Payee.
        recipient: Recipient,
        /// Amount paid.
        amount: Money,
        /// Gateway transaction reference.
        transaction_id: String,
    },
    /// One payment failed.
    PaymentFailed {
        /// Batch.
        batch_id: BatchId,
        /// Payment.
        payment_id: PaymentId,
        /// Payee.
        recipient: Recipient,
        /// Amount attempted.
        amount: Money,
        /// Coarse status and the log reference of the gateway error. The
        /// gateway's own text stays on the batch item.
        failure: PublicFailure,
    },
    /// Every item resolved.
    BatchSettled {
        /// Batch.
        batch_id: BatchId,
        /// Final status.
        status: BatchStatus,
        /// Completed payments.
        successful_payments: u32,
        /// Failed payments.
        failed_payments: u32,
    },
}

impl Event for PaymentEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::BatchCreated { .. } => "PaymentBatchCreated.v1",
            Self::PaymentCompleted { .. } => "PaymentCompleted.v1",
            Self::PaymentFailed { .. } => "PaymentFailed.v1",
            Self::BatchSettled { .. } => "PaymentBatchSettled.v1",
        }
    }
}

/// Encode events about one aggregate as outbox entries.
///
/// # Errors
///
/// Returns [`LedgerError::Outbox`](crate::error::LedgerError::Outbox) if an event cannot be encoded.
pub fn stage_all<E: Event + Serialize>(
    aggregate_id: &AggregateId,
    aggregate_type: &str,
    events: &[E],
    metadata: &EventMetadata,
    occurred_at: DateTime<Utc>,
) -> Result<Vec<StagedEvent>> {
    events
        .iter()
        .map(|event| {
            StagedEvent::from_event(
                aggregate_id.clone(),
                aggregate_type,
                event,
                metadata.clone(),
                occurred_at,
            )
            .map_err(Into::into)
        })
        .collect()
}
