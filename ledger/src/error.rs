//! Ledger error taxonomy.
//!
//! Every variant carries enough detail for operators. Callers outside operator
//! tooling get a [`PublicFailure`] instead: a coarse status plus an opaque
//! reference that is logged next to the full error.

use crate::payments::gateway::GatewayError;
use crate::rewards::verification::VerificationError;
use crate::types::{PoolId, Tokens};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tuneshare_core::event_store::EventStoreError;
use tuneshare_core::outbox::OutboxError;
use uuid::Uuid;

/// Result alias for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Errors raised by ledger services and stores.
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Optimistic concurrency check failed; nothing was written.
    #[error("Concurrency conflict on {aggregate}: {detail}")]
    ConcurrencyConflict {
        /// Aggregate that moved on.
        aggregate: String,
        /// What was expected versus found.
        detail: String,
    },

    /// Reservation larger than the pool's available balance.
    #[error("Insufficient balance in pool {pool_id}: requested {requested}, available {available}")]
    InsufficientPool {
        /// Pool asked.
        pool_id: PoolId,
        /// Amount requested.
        requested: Tokens,
        /// Amount available.
        available: Tokens,
    },

    /// Period start is not before period end.
    #[error("Invalid period: start {start} is not before end {end}")]
    InvalidPeriod {
        /// Period start.
        start: DateTime<Utc>,
        /// Period end.
        end: DateTime<Utc>,
    },

    /// Zero, negative or otherwise unusable amount.
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Percentages out of range or summing above 100%.
    #[error("Invalid percentage: {0}")]
    InvalidPercentage(String),

    /// An invariant that should be impossible to break was broken. The unit of
    /// work is aborted.
    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    /// Entity lookup failed.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind.
        entity: &'static str,
        /// Identifier looked up.
        id: String,
    },

    /// The entity's state does not allow the action.
    #[error("Cannot {action} {entity} {id} while {state}")]
    InvalidTransition {
        /// Entity kind.
        entity: &'static str,
        /// Entity identifier.
        id: String,
        /// Attempted action.
        action: &'static str,
        /// Current state.
        state: String,
    },

    /// Payment gateway failure.
    #[error("Payment gateway error: {0}")]
    Gateway(#[from] GatewayError),

    /// Proof verification or risk scoring failure.
    #[error("Verification error: {0}")]
    Verification(#[from] VerificationError),

    /// Outbox failure.
    #[error(transparent)]
    Outbox(#[from] OutboxError),

    /// Storage failure.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<EventStoreError> for LedgerError {
    fn from(e: EventStoreError) -> Self {
        match e {
            EventStoreError::ConcurrencyConflict {
                aggregate_id,
                expected,
                actual,
            } => Self::ConcurrencyConflict {
                aggregate: aggregate_id.into_inner(),
                detail: format!("expected version {expected}, found {actual}"),
            },
            other => Self::Storage(other.to_string()),
        }
    }
}

impl LedgerError {
    /// Lookup failure helper.
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Whether the same call may succeed if retried (after reloading state).
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::ConcurrencyConflict { .. } | Self::Storage(_) => true,
            Self::Gateway(e) => e.is_retryable(),
            Self::Verification(e) => e.is_retryable(),
            Self::Outbox(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Short machine-readable code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::ConcurrencyConflict { .. } => "concurrency_conflict",
            Self::InsufficientPool { .. } => "insufficient_pool",
            Self::InvalidPeriod { .. } => "invalid_period",
            Self::InvalidAmount(_) => "invalid_amount",
            Self::InvalidPercentage(_) => "invalid_percentage",
            Self::InvariantViolation(_) => "invariant_violation",
            Self::NotFound { .. } => "not_found",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Gateway(_) => "gateway_error",
            Self::Verification(_) => "verification_error",
            Self::Outbox(_) => "outbox_error",
            Self::Storage(_) => "storage_error",
        }
    }

    /// Log the full error under a fresh reference and return what an end user may see.
    #[must_use]
    pub fn public(&self) -> PublicFailure {
        let reference = Uuid::new_v4();
        let status = match self {
            Self::InsufficientPool { .. }
            | Self::InvalidPeriod { .. }
            | Self::InvalidAmount(_)
            | Self::InvalidPercentage(_)
            | Self::InvalidTransition { .. }
            | Self::Gateway(GatewayError::Declined(_) | GatewayError::InvalidRecipient(_)) => {
                PublicStatus::Rejected
            }
            Self::NotFound { .. } => PublicStatus::NotFound,
            Self::ConcurrencyConflict { .. } => PublicStatus::Conflict,
            _ if self.is_retryable() => PublicStatus::Unavailable,
            _ => PublicStatus::Failed,
        };
        tracing::error!(
            error_reference = %reference,
            code = self.code(),
            error = %self,
            "Ledger operation failed"
        );
        PublicFailure { status, reference }
    }
}

/// Coarse outcome shown to end users.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublicStatus {
    /// The request was invalid for the current state.
    Rejected,
    /// Something referenced does not exist.
    NotFound,
    /// Someone else changed the same data; try again.
    Conflict,
    /// Temporary outage; try later.
    Unavailable,
    /// Internal failure.
    Failed,
}

/// User-facing failure: status plus an opaque reference into the logs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicFailure {
    /// Coarse status.
    pub status: PublicStatus,
    /// Reference to quote to support.
    pub reference: Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tuneshare_core::stream::{AggregateId, Version};

    #[test]
    fn event_store_conflicts_stay_conflicts() {
        let err: LedgerError = EventStoreError::ConcurrencyConflict {
            aggregate_id: AggregateId::new("listen_session-1"),
            expected: Version::new(2),
            actual: Version::new(3),
        }
        .into();
        assert!(matches!(err, LedgerError::ConcurrencyConflict { ref aggregate, .. } if aggregate == "listen_session-1"));
        assert!(err.is_retryable());
    }

    #[test]
    fn public_failure_hides_details() {
        let err = LedgerError::InvariantViolation("shares oversold".into());
        let public = err.public();
        assert_eq!(public.status, PublicStatus::Failed);

        let err = LedgerError::InsufficientPool {
            pool_id: PoolId::new(),
            requested: Tokens::new(50),
            available: Tokens::new(40),
        };
        assert_eq!(err.public().status, PublicStatus::Rejected);
        assert_eq!(LedgerError::Storage("down".into()).public().status, PublicStatus::Unavailable);
    }

    #[test]
    fn gateway_failures_map_to_coarse_statuses() {
        let declined = LedgerError::Gateway(GatewayError::Declined("card 4242 blocked".into()));
        assert_eq!(declined.public().status, PublicStatus::Rejected);
        let timeout = LedgerError::Gateway(GatewayError::Timeout);
        assert_eq!(timeout.public().status, PublicStatus::Unavailable);
        assert_ne!(declined.public().reference, declined.public().reference);
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(LedgerError::InvalidAmount("0".into()).code(), "invalid_amount");
        assert_eq!(LedgerError::not_found("pool", "p-1").to_string(), "pool not found: p-1");
    }
}
