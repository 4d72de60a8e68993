//! Reward pool accounting.
//!
//! A pool holds a fixed number of tokens for a validation period. Tokens move
//! from *available* to *reserved* when a listen session starts, and from
//! *reserved* to *distributed* (or back to available) when it resolves. At every
//! point `distributed + reserved <= total`.
//!
//! Everything here is pure; stores load a pool, call these methods under a row
//! lock and persist the result together with the returned events.

use crate::error::{LedgerError, Result};
use crate::events::RewardEvent;
use crate::types::{PoolId, ReservationId, SessionId, Tokens, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Whether a pool still accepts reservations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolStatus {
    /// Accepting reservations during its validation window.
    Open,
    /// Finalized; immutable.
    Closed,
}

impl PoolStatus {
    /// Column value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }

    /// Parse a column value.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Storage`] for unknown values.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "open" => Ok(Self::Open),
            "closed" => Ok(Self::Closed),
            other => Err(LedgerError::Storage(format!("unknown pool status: {other}"))),
        }
    }
}

/// Lifecycle of a reservation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationStatus {
    /// Tokens set aside.
    Held,
    /// Finalized; some or all tokens distributed.
    Committed,
    /// Abandoned; tokens returned.
    Released,
}

impl ReservationStatus {
    /// Column value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Held => "held",
            Self::Committed => "committed",
            Self::Released => "released",
        }
    }

    /// Parse a column value.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Storage`] for unknown values.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "held" => Ok(Self::Held),
            "committed" => Ok(Self::Committed),
            "released" => Ok(Self::Released),
            other => Err(LedgerError::Storage(format!(
                "unknown reservation status: {other}"
            ))),
        }
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who a reservation is for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReservationClaim {
    /// Listener.
    pub user_id: UserId,
    /// Session backed by the reservation.
    pub session_id: Option<SessionId>,
}

/// Tokens set aside from a pool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// Reservation.
    pub id: ReservationId,
    /// Pool the tokens come from.
    pub pool_id: PoolId,
    /// Listener.
    pub user_id: UserId,
    /// Session backed by the reservation.
    pub session_id: Option<SessionId>,
    /// Tokens reserved.
    pub amount: Tokens,
    /// Tokens distributed on commit.
    pub committed: Option<Tokens>,
    /// Lifecycle state.
    pub status: ReservationStatus,
    /// When it was taken.
    pub created_at: DateTime<Utc>,
    /// When it was committed or released.
    pub resolved_at: Option<DateTime<Utc>>,
}

/// A funded reward pool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardPool {
    /// Pool.
    pub id: PoolId,
    /// Tokens funded.
    pub total_tokens: Tokens,
    /// Tokens finalized to listeners.
    pub distributed_tokens: Tokens,
    /// Tokens held by open reservations.
    pub reserved_tokens: Tokens,
    /// First instant reservations are accepted.
    pub validation_start: DateTime<Utc>,
    /// Instant reservations stop.
    pub validation_end: DateTime<Utc>,
    /// Open or closed.
    pub status: PoolStatus,
    /// Available balance below which the pool counts as depleted.
    pub depletion_threshold: Tokens,
    /// Whether `PoolDepleted` has already been emitted.
    pub depletion_announced: bool,
    /// When the pool was opened.
    pub created_at: DateTime<Utc>,
    /// When the pool was closed.
    pub closed_at: Option<DateTime<Utc>>,
}

impl RewardPool {
    /// Fund a new pool.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InvalidAmount`] if `total_tokens` is zero
    /// - [`LedgerError::InvalidPeriod`] unless `validation_start < validation_end`
    pub fn open(
        id: PoolId,
        total_tokens: Tokens,
        validation_start: DateTime<Utc>,
        validation_end: DateTime<Utc>,
        depletion_threshold: Tokens,
        now: DateTime<Utc>,
    ) -> Result<(Self, RewardEvent)> {
        if total_tokens.is_zero() {
            return Err(LedgerError::InvalidAmount(
                "reward pool must be funded with at least one token unit".into(),
            ));
        }
        if validation_start >= validation_end {
            return Err(LedgerError::InvalidPeriod {
                start: validation_start,
                end: validation_end,
            });
        }
        let pool = Self {
            id,
            total_tokens,
            distributed_tokens: Tokens::ZERO,
            reserved_tokens: Tokens::ZERO,
            validation_start,
            validation_end,
            status: PoolStatus::Open,
            depletion_threshold,
            depletion_announced: false,
            created_at: now,
            closed_at: None,
        };
        let event = RewardEvent::PoolOpened {
            pool_id: id,
            total_tokens,
            validation_start,
            validation_end,
        };
        Ok((pool, event))
    }

    /// Tokens neither distributed nor reserved.
    #[must_use]
    pub const fn available(&self) -> Tokens {
        self.total_tokens
            .saturating_sub(self.distributed_tokens)
            .saturating_sub(self.reserved_tokens)
    }

    /// Whether the available balance is under the depletion threshold.
    #[must_use]
    pub fn is_depleted(&self) -> bool {
        self.available() < self.depletion_threshold
    }

    /// Whether the validation window contains `now`.
    #[must_use]
    pub fn in_validation_window(&self, now: DateTime<Utc>) -> bool {
        self.validation_start <= now && now < self.validation_end
    }

    /// Set aside `amount` tokens.
    ///
    /// Fails without changing anything if the pool is closed, outside its
    /// validation window, or short of tokens.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InvalidAmount`] for a zero amount
    /// - [`LedgerError::InvalidTransition`] if the pool is closed or outside its window
    /// - [`LedgerError::InsufficientPool`] if `amount > available`
    pub fn reserve(
        &mut self,
        reservation_id: ReservationId,
        amount: Tokens,
        claim: ReservationClaim,
        now: DateTime<Utc>,
    ) -> Result<(Reservation, Vec<RewardEvent>)> {
        if amount.is_zero() {
            return Err(LedgerError::InvalidAmount(
                "reservation must be at least one token unit".into(),
            ));
        }
        if self.status == PoolStatus::Closed {
            return Err(self.invalid("reserve from", "closed"));
        }
        if !self.in_validation_window(now) {
            return Err(self.invalid("reserve from", "outside its validation window"));
        }
        let available = self.available();
        if amount > available {
            return Err(LedgerError::InsufficientPool {
                pool_id: self.id,
                requested: amount,
                available,
            });
        }

        let mut next = self.clone();
        next.reserved_tokens = next
            .reserved_tokens
            .checked_add(amount)
            .ok_or_else(|| LedgerError::InvariantViolation("reserved tokens overflow".into()))?;
        next.check_invariant()?;
        *self = next;

        let reservation = Reservation {
            id: reservation_id,
            pool_id: self.id,
            user_id: claim.user_id,
            session_id: claim.session_id,
            amount,
            committed: None,
            status: ReservationStatus::Held,
            created_at: now,
            resolved_at: None,
        };
        let event = RewardEvent::TokensReserved {
            pool_id: self.id,
            reservation_id,
            session_id: claim.session_id,
            user_id: claim.user_id,
            amount,
        };
        Ok((reservation, vec![event]))
    }

    /// Finalize a held reservation, distributing `final_amount` and returning
    /// the rest to the pool.
    ///
    /// Committing an already-committed reservation with the same amount is a
    /// no-op that returns no events.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InvalidAmount`] if `final_amount` exceeds the reservation
    /// - [`LedgerError::InvalidTransition`] if the reservation was released or
    ///   committed with a different amount
    /// - [`LedgerError::InvariantViolation`] if the reservation belongs to another pool
    pub fn commit(
        &mut self,
        reservation: &mut Reservation,
        final_amount: Tokens,
        now: DateTime<Utc>,
    ) -> Result<Vec<RewardEvent>> {
        self.check_owns(reservation)?;
        match reservation.status {
            ReservationStatus::Held => {}
            ReservationStatus::Committed if reservation.committed == Some(final_amount) => {
                return Ok(Vec::new());
            }
            other => return Err(reservation_invalid(reservation, "commit", other)),
        }
        if final_amount > reservation.amount {
            return Err(LedgerError::InvalidAmount(format!(
                "cannot commit {final_amount} against a reservation of {}",
                reservation.amount
            )));
        }

        let mut next = self.clone();
        next.reserved_tokens = next
            .reserved_tokens
            .checked_sub(reservation.amount)
            .ok_or_else(|| {
                LedgerError::InvariantViolation(format!(
                    "pool {} holds fewer reserved tokens than reservation {}",
                    self.id, reservation.id
                ))
            })?;
        next.distributed_tokens = next
            .distributed_tokens
            .checked_add(final_amount)
            .ok_or_else(|| LedgerError::InvariantViolation("distributed tokens overflow".into()))?;
        next.check_invariant()?;

        let mut events = vec![RewardEvent::ReservationCommitted {
            pool_id: self.id,
            reservation_id: reservation.id,
            session_id: reservation.session_id,
            user_id: reservation.user_id,
            reserved: reservation.amount,
            committed: final_amount,
        }];
        if next.is_depleted() && !next.depletion_announced {
            next.depletion_announced = true;
            events.push(RewardEvent::PoolDepleted {
                pool_id: self.id,
                remaining: next.available(),
            });
        }

        *self = next;
        reservation.status = ReservationStatus::Committed;
        reservation.committed = Some(final_amount);
        reservation.resolved_at = Some(now);
        Ok(events)
    }

    /// Return a held reservation's tokens. Releasing twice is a no-op.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InvalidTransition`] if the reservation was committed
    /// - [`LedgerError::InvariantViolation`] if the reservation belongs to another pool
    pub fn release(
        &mut self,
        reservation: &mut Reservation,
        now: DateTime<Utc>,
    ) -> Result<Vec<RewardEvent>> {
        self.check_owns(reservation)?;
        match reservation.status {
            ReservationStatus::Held => {}
            ReservationStatus::Released => return Ok(Vec::new()),
            ReservationStatus::Committed => {
                return Err(reservation_invalid(
                    reservation,
                    "release",
                    ReservationStatus::Committed,
                ));
            }
        }

        let mut next = self.clone();
        next.reserved_tokens = next
            .reserved_tokens
            .checked_sub(reservation.amount)
            .ok_or_else(|| {
                LedgerError::InvariantViolation(format!(
                    "pool {} holds fewer reserved tokens than reservation {}",
                    self.id, reservation.id
                ))
            })?;
        next.check_invariant()?;
        *self = next;

        reservation.status = ReservationStatus::Released;
        reservation.resolved_at = Some(now);
        Ok(vec![RewardEvent::ReservationReleased {
            pool_id: self.id,
            reservation_id: reservation.id,
            amount: reservation.amount,
        }])
    }

    /// Close the pool once its window has ended and nothing is reserved.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InvalidTransition`] if the pool is already closed, still
    /// inside its window, or has open reservations.
    pub fn close(&mut self, now: DateTime<Utc>) -> Result<RewardEvent> {
        if self.status == PoolStatus::Closed {
            return Err(self.invalid("close", "closed"));
        }
        if now < self.validation_end {
            return Err(self.invalid("close", "inside its validation window"));
        }
        if !self.reserved_tokens.is_zero() {
            return Err(self.invalid("close", "holding open reservations"));
        }
        self.status = PoolStatus::Closed;
        self.closed_at = Some(now);
        Ok(RewardEvent::PoolClosed {
            pool_id: self.id,
            distributed: self.distributed_tokens,
            unused: self.available(),
        })
    }

    /// `distributed + reserved <= total`.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InvariantViolation`] when broken.
    pub fn check_invariant(&self) -> Result<()> {
        let committed = self
            .distributed_tokens
            .checked_add(self.reserved_tokens)
            .ok_or_else(|| LedgerError::InvariantViolation("pool accounting overflow".into()))?;
        if committed > self.total_tokens {
            return Err(LedgerError::InvariantViolation(format!(
                "pool {} over-committed: distributed {} + reserved {} > total {}",
                self.id, self.distributed_tokens, self.reserved_tokens, self.total_tokens
            )));
        }
        Ok(())
    }

    fn check_owns(&self, reservation: &Reservation) -> Result<()> {
        if reservation.pool_id == self.id {
            Ok(())
        } else {
            Err(LedgerError::InvariantViolation(format!(
                "reservation {} belongs to pool {}, not {}",
                reservation.id, reservation.pool_id, self.id
            )))
        }
    }

    fn invalid(&self, action: &'static str, state: &str) -> LedgerError {
        LedgerError::InvalidTransition {
            entity: "reward pool",
            id: self.id.to_string(),
            action,
            state: state.to_string(),
        }
    }
}

fn reservation_invalid(
    reservation: &Reservation,
    action: &'static str,
    status: ReservationStatus,
) -> LedgerError {
    LedgerError::InvalidTransition {
        entity: "reservation",
        id: reservation.id.to_string(),
        action,
        state: status.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;

    fn start() -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH + Duration::days(20_000)
    }

    fn pool(total: u64) -> RewardPool {
        RewardPool::open(
            PoolId::new(),
            Tokens::new(total),
            start(),
            start() + Duration::days(30),
            Tokens::new(10),
            start(),
        )
        .unwrap()
        .0
    }

    fn claim() -> ReservationClaim {
        ReservationClaim {
            user_id: UserId::new(),
            session_id: Some(SessionId::new()),
        }
    }

    fn during() -> DateTime<Utc> {
        start() + Duration::hours(1)
    }

    #[test]
    fn open_validates_inputs() {
        let id = PoolId::new();
        assert!(matches!(
            RewardPool::open(id, Tokens::ZERO, start(), start() + Duration::days(1), Tokens::ZERO, start()),
            Err(LedgerError::InvalidAmount(_))
        ));
        assert!(matches!(
            RewardPool::open(id, Tokens::new(5), start(), start(), Tokens::ZERO, start()),
            Err(LedgerError::InvalidPeriod { .. })
        ));
    }

    #[test]
    fn reserve_commit_release_walkthrough() {
        // 100 tokens; A reserves 60, B's 50 is refused, A commits 55.
        let mut pool = pool(100);

        let (mut a, events) = pool
            .reserve(ReservationId::new(), Tokens::new(60), claim(), during())
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(pool.reserved_tokens, Tokens::new(60));
        assert_eq!(pool.available(), Tokens::new(40));

        let before = pool.clone();
        let err = pool
            .reserve(ReservationId::new(), Tokens::new(50), claim(), during())
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InsufficientPool { requested, available, .. }
                if requested == Tokens::new(50) && available == Tokens::new(40)
        ));
        assert_eq!(pool, before);

        let events = pool.commit(&mut a, Tokens::new(55), during()).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(pool.distributed_tokens, Tokens::new(55));
        assert_eq!(pool.reserved_tokens, Tokens::ZERO);
        assert_eq!(pool.available(), Tokens::new(45));
        assert_eq!(a.status, ReservationStatus::Committed);
        assert_eq!(a.committed, Some(Tokens::new(55)));
    }

    #[test]
    fn commit_cannot_exceed_reservation() {
        let mut pool = pool(100);
        let (mut r, _) = pool
            .reserve(ReservationId::new(), Tokens::new(10), claim(), during())
            .unwrap();
        assert!(matches!(
            pool.commit(&mut r, Tokens::new(11), during()),
            Err(LedgerError::InvalidAmount(_))
        ));
        assert_eq!(r.status, ReservationStatus::Held);
    }

    #[test]
    fn repeated_commit_is_idempotent() {
        let mut pool = pool(100);
        let (mut r, _) = pool
            .reserve(ReservationId::new(), Tokens::new(10), claim(), during())
            .unwrap();
        pool.commit(&mut r, Tokens::new(7), during()).unwrap();
        let snapshot = pool.clone();

        assert!(pool.commit(&mut r, Tokens::new(7), during()).unwrap().is_empty());
        assert_eq!(pool, snapshot);
        assert!(matches!(
            pool.commit(&mut r, Tokens::new(8), during()),
            Err(LedgerError::InvalidTransition { .. })
        ));
        assert!(pool.release(&mut r, during()).is_err());
    }

    #[test]
    fn release_returns_tokens_once() {
        let mut pool = pool(100);
        let (mut r, _) = pool
            .reserve(ReservationId::new(), Tokens::new(30), claim(), during())
            .unwrap();
        assert_eq!(pool.release(&mut r, during()).unwrap().len(), 1);
        assert!(pool.release(&mut r, during()).unwrap().is_empty());
        assert_eq!(pool.available(), Tokens::new(100));
        assert!(matches!(
            pool.commit(&mut r, Tokens::new(1), during()),
            Err(LedgerError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn reservation_from_another_pool_is_rejected() {
        let mut first = pool(100);
        let mut second = pool(100);
        let (mut r, _) = first
            .reserve(ReservationId::new(), Tokens::new(5), claim(), during())
            .unwrap();
        assert!(matches!(
            second.commit(&mut r, Tokens::new(5), during()),
            Err(LedgerError::InvariantViolation(_))
        ));
    }

    #[test]
    fn reservations_only_inside_window() {
        let mut pool = pool(100);
        assert!(matches!(
            pool.reserve(ReservationId::new(), Tokens::new(5), claim(), start() - Duration::seconds(1)),
            Err(LedgerError::InvalidTransition { .. })
        ));
        assert!(pool
            .reserve(ReservationId::new(), Tokens::new(5), claim(), pool.validation_end)
            .is_err());
    }

    #[test]
    fn depletion_announced_once() {
        let mut pool = pool(100);
        let (mut a, _) = pool
            .reserve(ReservationId::new(), Tokens::new(92), claim(), during())
            .unwrap();
        let events = pool.commit(&mut a, Tokens::new(92), during()).unwrap();
        assert!(events
            .iter()
            .any(|e| matches!(e, RewardEvent::PoolDepleted { remaining, .. } if *remaining == Tokens::new(8))));

        let (mut b, _) = pool
            .reserve(ReservationId::new(), Tokens::new(2), claim(), during())
            .unwrap();
        let events = pool.commit(&mut b, Tokens::new(2), during()).unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn close_requires_end_of_window_and_no_reservations() {
        let mut pool = pool(100);
        let (mut r, _) = pool
            .reserve(ReservationId::new(), Tokens::new(40), claim(), during())
            .unwrap();
        let after = pool.validation_end + Duration::seconds(1);

        assert!(pool.close(during()).is_err());
        assert!(pool.close(after).is_err());

        pool.commit(&mut r, Tokens::new(25), after).unwrap();
        let event = pool.close(after).unwrap();
        assert_eq!(
            event,
            RewardEvent::PoolClosed {
                pool_id: pool.id,
                distributed: Tokens::new(25),
                unused: Tokens::new(75),
            }
        );
        assert_eq!(pool.status, PoolStatus::Closed);
        assert!(pool
            .reserve(ReservationId::new(), Tokens::new(1), claim(), after)
            .is_err());
    }

    #[derive(Clone, Debug)]
    enum Op {
        Reserve(u64),
        Commit(usize, u64),
        Release(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1u64..80).prop_map(Op::Reserve),
            (0usize..16, 0u64..80).prop_map(|(i, n)| Op::Commit(i, n)),
            (0usize..16).prop_map(Op::Release),
        ]
    }

    proptest! {
        #[test]
        fn accounting_invariant_holds_under_any_sequence(
            total in 1u64..500,
            ops in proptest::collection::vec(op(), 1..60),
        ) {
            let mut pool = pool(total);
            let mut reservations: Vec<Reservation> = Vec::new();

            for op in ops {
                let _ = match op {
                    Op::Reserve(n) => pool
                        .reserve(ReservationId::new(), Tokens::new(n), claim(), during())
                        .map(|(r, _)| reservations.push(r)),
                    Op::Commit(i, n) if !reservations.is_empty() => {
                        let idx = i % reservations.len();
                        pool.commit(&mut reservations[idx], Tokens::new(n), during()).map(|_| ())
                    }
                    Op::Release(i) if !reservations.is_empty() => {
                        let idx = i % reservations.len();
                        pool.release(&mut reservations[idx], during()).map(|_| ())
                    }
                    _ => Ok(()),
                };

                prop_assert!(pool.check_invariant().is_ok());
                let held: u64 = reservations
                    .iter()
                    .filter(|r| r.status == ReservationStatus::Held)
                    .map(|r| r.amount.value())
                    .sum();
                let distributed: u64 = reservations.iter().filter_map(|r| r.committed).map(Tokens::value).sum();
                prop_assert_eq!(pool.reserved_tokens.value(), held);
                prop_assert_eq!(pool.distributed_tokens.value(), distributed);
            }
        }
    }
}
