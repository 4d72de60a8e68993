//! Listen-to-earn session workflow.
//!
//! Ties the event-sourced [`ListenSession`] to the pool allocator and the
//! external verification collaborators. Pool calls never hold a session lock:
//! each step loads the session, decides, and appends with the loaded version as
//! the expected version, so concurrent steps on one session conflict instead of
//! overwriting each other.
//!
//! The session outcome is appended before the pool moves, so of a concurrent
//! reward and fail only the one that wins the append touches the pool. Both pool
//! steps are idempotent and every crash is recovered by repeating the call:
//! [`ListenRewardService::reward_session`] on a rewarded session finishes the
//! commit, [`ListenRewardService::fail_session`] on a failed one releases again.

use crate::error::{LedgerError, Result};
use crate::rewards::allocator::RewardAllocator;
use crate::rewards::pool::ReservationClaim;
use crate::rewards::session::{
    FailureReason, ListenSession, ListenSessionEvent, QualityScore, RewardTier, SessionStart,
    SessionStatus,
};
use crate::rewards::verification::{ListenProof, ProofVerdict, ProofVerifier, RiskScorer};
use crate::types::{ArtistId, PoolId, ReservationId, SessionId, SongId, Tokens, UserId};
use std::sync::Arc;
use tuneshare_core::aggregate::{Aggregate, Loaded, load_aggregate};
use tuneshare_core::environment::Clock;
use tuneshare_core::event::{EventMetadata, SerializedEvent};
use tuneshare_core::event_store::{AppendBatch, EventStore};
use tuneshare_core::stream::Version;

/// Playback start request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StartListen {
    /// Listener.
    pub user_id: UserId,
    /// Song.
    pub song_id: SongId,
    /// Song's artist.
    pub artist_id: ArtistId,
    /// Pool funding rewards for the current period.
    pub pool_id: PoolId,
    /// Listener tier.
    pub tier: RewardTier,
    /// Song length in seconds.
    pub song_duration_seconds: u32,
}

/// Listen session service.
#[derive(Clone)]
pub struct ListenRewardService {
    events: Arc<dyn EventStore>,
    allocator: RewardAllocator,
    verifier: Arc<dyn ProofVerifier>,
    risk: Arc<dyn RiskScorer>,
    clock: Arc<dyn Clock>,
}

impl ListenRewardService {
    /// Service over its collaborators.
    #[must_use]
    pub fn new(
        events: Arc<dyn EventStore>,
        allocator: RewardAllocator,
        verifier: Arc<dyn ProofVerifier>,
        risk: Arc<dyn RiskScorer>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            events,
            allocator,
            verifier,
            risk,
            clock,
        }
    }

    /// Start a session and reserve its maximum possible reward.
    ///
    /// If the pool cannot cover the full amount, whatever is left is reserved;
    /// if nothing can be reserved the session still starts and fails with
    /// [`FailureReason::PoolExhausted`] when it would be rewarded.
    ///
    /// # Errors
    ///
    /// Storage failures. A denied reservation is not an error.
    pub async fn start_session(
        &self,
        request: StartListen,
        metadata: EventMetadata,
    ) -> Result<ListenSession> {
        let session_id = SessionId::new();
        let wanted = self
            .allocator
            .policy()
            .reservation_for(request.song_duration_seconds, request.tier);
        let (reservation_id, reserved) = self
            .reserve_up_to(session_id, &request, wanted, &metadata)
            .await?;

        let start = SessionStart {
            session_id,
            user_id: request.user_id,
            song_id: request.song_id,
            artist_id: request.artist_id,
            pool_id: request.pool_id,
            tier: request.tier,
            song_duration_seconds: request.song_duration_seconds,
            reservation_id,
            reserved,
            started_at: self.clock.now(),
        };
        let event = ListenSessionEvent::Started(start);
        if let Err(e) = self
            .append(session_id, Version::INITIAL, &event, &metadata)
            .await
        {
            if let Some(id) = reservation_id {
                if let Err(release_error) = self.allocator.release(id, metadata.clone()).await {
                    tracing::error!(
                        session_id = %session_id,
                        reservation_id = %id,
                        error = %release_error,
                        "Failed to release reservation of a session that never started"
                    );
                }
            }
            return Err(e);
        }

        tracing::info!(
            session_id = %session_id,
            user_id = %request.user_id,
            song_id = %request.song_id,
            tier = ?request.tier,
            reserved = reserved.value(),
            "Listen session started"
        );
        metrics::counter!("ledger.sessions.started.total").increment(1);
        Ok(ListenSession::default().apply(&event))
    }

    /// Record the end of playback.
    ///
    /// Listens outside the accepted duration fail the session and release its
    /// reservation.
    ///
    /// # Errors
    ///
    /// [`LedgerError::NotFound`], [`LedgerError::InvalidTransition`],
    /// [`LedgerError::ConcurrencyConflict`] or storage failure.
    pub async fn complete_session(
        &self,
        session_id: SessionId,
        listen_seconds: u32,
        proof_hash: String,
        metadata: EventMetadata,
    ) -> Result<ListenSession> {
        let loaded = self.load(session_id).await?;
        let event = loaded.state.complete(
            listen_seconds,
            proof_hash,
            self.allocator.policy(),
            self.clock.now(),
        )?;
        self.record(session_id, loaded, event, metadata).await
    }

    /// Verify the listening proof and score the session for fraud.
    ///
    /// A proof whose hash differs from the one submitted at completion is
    /// treated as rejected.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Verification`] if a collaborator is unavailable (the
    /// session stays completed and the call may be retried), plus the errors of
    /// [`Self::complete_session`].
    pub async fn verify_session(
        &self,
        session_id: SessionId,
        proof: &ListenProof,
        metadata: EventMetadata,
    ) -> Result<ListenSession> {
        let loaded = self.load(session_id).await?;
        if loaded.state.status != SessionStatus::Completed {
            return Err(LedgerError::InvalidTransition {
                entity: "listen session",
                id: session_id.to_string(),
                action: "verify",
                state: loaded.state.status.to_string(),
            });
        }

        let verdict = if loaded.state.proof_hash.as_deref() == Some(proof.proof_hash.as_str()) {
            self.verifier.verify(&loaded.state, proof).await?
        } else {
            tracing::warn!(session_id = %session_id, "Proof hash does not match completed session");
            ProofVerdict {
                verified: false,
                quality: QualityScore::ZERO,
            }
        };
        let risk = self.risk.assess(&loaded.state).await?;
        let event = loaded.state.verify(
            verdict,
            risk,
            self.allocator.policy(),
            self.clock.now(),
        )?;
        self.record(session_id, loaded, event, metadata).await
    }

    /// Commit the verified reward from the pool.
    ///
    /// Sessions without a reservation fail with [`FailureReason::PoolExhausted`].
    /// Calling this again on a rewarded session completes an interrupted commit.
    ///
    /// # Errors
    ///
    /// [`LedgerError::NotFound`], [`LedgerError::InvalidTransition`],
    /// [`LedgerError::ConcurrencyConflict`] or storage failure.
    pub async fn reward_session(
        &self,
        session_id: SessionId,
        metadata: EventMetadata,
    ) -> Result<ListenSession> {
        let loaded = self.load(session_id).await?;
        if loaded.state.status == SessionStatus::Rewarded {
            self.commit_reward(session_id, &loaded.state, &metadata)
                .await?;
            return Ok(loaded.state);
        }

        let now = self.clock.now();
        if loaded.state.reservation_id().is_none() {
            let event = loaded.state.fail(FailureReason::PoolExhausted, now)?;
            return self.record(session_id, loaded, event, metadata).await;
        }

        let event = loaded.state.reward(loaded.state.final_reward, now)?;
        let state = self
            .record(session_id, loaded, event, metadata.clone())
            .await?;
        self.commit_reward(session_id, &state, &metadata).await?;
        Ok(state)
    }

    /// End a session without reward (caller timeout or cancellation).
    ///
    /// On an already failed session this only re-releases the reservation.
    ///
    /// # Errors
    ///
    /// [`LedgerError::NotFound`], [`LedgerError::InvalidTransition`] for
    /// rewarded sessions, [`LedgerError::ConcurrencyConflict`] or storage failure.
    pub async fn fail_session(
        &self,
        session_id: SessionId,
        reason: FailureReason,
        metadata: EventMetadata,
    ) -> Result<ListenSession> {
        let loaded = self.load(session_id).await?;
        if loaded.state.status == SessionStatus::Failed {
            self.release_reservation(&loaded.state, &metadata).await?;
            return Ok(loaded.state);
        }
        let event = loaded.state.fail(reason, self.clock.now())?;
        self.record(session_id, loaded, event, metadata).await
    }

    /// Current session state.
    ///
    /// # Errors
    ///
    /// [`LedgerError::NotFound`] or storage failure.
    pub async fn session(&self, session_id: SessionId) -> Result<ListenSession> {
        Ok(self.load(session_id).await?.state)
    }

    async fn reserve_up_to(
        &self,
        session_id: SessionId,
        request: &StartListen,
        wanted: Tokens,
        metadata: &EventMetadata,
    ) -> Result<(Option<ReservationId>, Tokens)> {
        if wanted.is_zero() {
            return Ok((None, Tokens::ZERO));
        }
        let claim = ReservationClaim {
            user_id: request.user_id,
            session_id: Some(session_id),
        };
        let mut amount = wanted;
        loop {
            match self
                .allocator
                .reserve(request.pool_id, amount, claim, metadata.clone())
                .await
            {
                Ok(reservation) => return Ok((Some(reservation.id), reservation.amount)),
                Err(LedgerError::InsufficientPool { available, .. })
                    if !available.is_zero() && available < amount =>
                {
                    amount = available;
                }
                Err(e @ (LedgerError::InsufficientPool { .. } | LedgerError::InvalidTransition { .. })) => {
                    tracing::info!(
                        session_id = %session_id,
                        pool_id = %request.pool_id,
                        error = %e,
                        "No reward reserved for session"
                    );
                    return Ok((None, Tokens::ZERO));
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn record(
        &self,
        session_id: SessionId,
        loaded: Loaded<ListenSession>,
        event: ListenSessionEvent,
        metadata: EventMetadata,
    ) -> Result<ListenSession> {
        self.append(session_id, loaded.version, &event, &metadata)
            .await?;
        let state = loaded.state.apply(&event);

        match &event {
            ListenSessionEvent::Failed { reason, .. } => {
                tracing::info!(session_id = %session_id, reason = ?reason, "Listen session failed");
                metrics::counter!("ledger.sessions.resolved.total", "outcome" => "failed")
                    .increment(1);
                self.release_reservation(&state, &metadata).await?;
            }
            ListenSessionEvent::Rewarded { committed, .. } => {
                tracing::info!(
                    session_id = %session_id,
                    committed = committed.value(),
                    "Listen session rewarded"
                );
                metrics::counter!("ledger.sessions.resolved.total", "outcome" => "rewarded")
                    .increment(1);
            }
            _ => {}
        }
        Ok(state)
    }

    async fn commit_reward(
        &self,
        session_id: SessionId,
        session: &ListenSession,
        metadata: &EventMetadata,
    ) -> Result<()> {
        let Some(reservation_id) = session.reservation_id() else {
            return Ok(());
        };
        self.allocator
            .commit(reservation_id, session.committed, metadata.clone())
            .await?;
        tracing::debug!(
            session_id = %session_id,
            reservation_id = %reservation_id,
            "Session reward committed"
        );
        Ok(())
    }

    async fn release_reservation(
        &self,
        session: &ListenSession,
        metadata: &EventMetadata,
    ) -> Result<()> {
        if let Some(reservation_id) = session.reservation_id() {
            self.allocator
                .release(reservation_id, metadata.clone())
                .await?;
        }
        Ok(())
    }

    async fn load(&self, session_id: SessionId) -> Result<Loaded<ListenSession>> {
        let loaded =
            load_aggregate::<ListenSession>(self.events.as_ref(), &session_id.aggregate_id())
                .await?;
        if loaded.is_new() {
            return Err(LedgerError::not_found("listen session", session_id));
        }
        Ok(loaded)
    }

    async fn append(
        &self,
        session_id: SessionId,
        expected: Version,
        event: &ListenSessionEvent,
        metadata: &EventMetadata,
    ) -> Result<()> {
        let serialized = SerializedEvent::from_event(event, metadata.clone())
            .map_err(|e| LedgerError::Storage(e.to_string()))?;
        let batch = AppendBatch::new(
            session_id.aggregate_id(),
            ListenSession::AGGREGATE_TYPE,
            expected,
            vec![serialized],
        )
        .at(self.clock.now());
        self.events.append(batch).await?;
        Ok(())
    }
}
