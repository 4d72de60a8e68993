//! Listen sessions: an event-sourced aggregate with a strict status machine.
//!
//! ```text
//! active ──► completed ──► verified ──► rewarded
//!    │           │             │
//!    └───────────┴─────────────┴──────► failed
//! ```
//!
//! `rewarded` and `failed` are terminal. Decision methods never mutate; they
//! return the event to append, and [`Aggregate::apply`] folds it in.

use crate::error::{LedgerError, Result};
use crate::rewards::verification::{ProofVerdict, RiskAction, RiskAssessment};
use crate::types::{ArtistId, PoolId, ReservationId, SessionId, SongId, Tokens, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tuneshare_core::aggregate::Aggregate;
use tuneshare_core::event::Event;

/// Listener subscription tier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RewardTier {
    /// ×1.0
    Basic,
    /// ×1.5
    Premium,
    /// ×2.0
    Vip,
    /// ×3.0
    Artist,
}

impl RewardTier {
    /// Reward multiplier in basis points (10000 = ×1.0).
    #[must_use]
    pub const fn multiplier_bps(self) -> u32 {
        match self {
            Self::Basic => 10_000,
            Self::Premium => 15_000,
            Self::Vip => 20_000,
            Self::Artist => 30_000,
        }
    }
}

/// Listening quality from the proof verifier, clamped to `0.0..=1.0`.
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct QualityScore(f64);

impl QualityScore {
    /// Worst quality.
    pub const ZERO: Self = Self(0.0);
    /// Best quality.
    pub const PERFECT: Self = Self(1.0);

    /// Validated score.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InvalidPercentage`] for NaN or values outside `0.0..=1.0`.
    pub fn new(value: f64) -> Result<Self> {
        if (0.0..=1.0).contains(&value) {
            Ok(Self(value))
        } else {
            Err(LedgerError::InvalidPercentage(format!(
                "quality score {value} outside 0.0..=1.0"
            )))
        }
    }

    /// Raw score.
    #[must_use]
    pub const fn value(self) -> f64 {
        self.0
    }

    /// `floor(tokens × score)`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn apply(self, tokens: Tokens) -> Tokens {
        // Score is in 0..=1 so the product never exceeds `tokens`.
        let scaled = (tokens.value() as f64 * self.0).floor();
        Tokens::new((scaled as u64).min(tokens.value()))
    }
}

/// Reward calculation parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RewardPolicy {
    /// Tokens earned per full minute listened before multipliers.
    pub base_rate_per_minute: Tokens,
    /// Ceiling on the base reward of one session.
    pub base_reward_cap: Tokens,
    /// Minimum listen for any song; shorter songs need half their duration.
    pub min_listen_seconds: u32,
    /// Longest listen accepted for one session.
    pub max_listen_seconds: u32,
    /// Available balance under which pools announce depletion.
    pub depletion_threshold: Tokens,
}

impl Default for RewardPolicy {
    fn default() -> Self {
        Self {
            base_rate_per_minute: Tokens::new(Tokens::UNITS_PER_TOKEN / 2),
            base_reward_cap: Tokens::whole(100),
            min_listen_seconds: 30,
            max_listen_seconds: 2 * 60 * 60,
            depletion_threshold: Tokens::whole(100),
        }
    }
}

impl RewardPolicy {
    /// Seconds needed for a song of `song_duration_seconds` to count.
    #[must_use]
    pub fn min_listen_for(&self, song_duration_seconds: u32) -> u32 {
        self.min_listen_seconds.min(song_duration_seconds / 2)
    }

    /// Base reward for a listen, before quality and tier.
    #[must_use]
    pub fn base_reward(&self, listen_seconds: u32) -> Tokens {
        let listened = u64::from(listen_seconds.min(self.max_listen_seconds));
        let earned = Tokens::new(listened * self.base_rate_per_minute.value() / 60);
        earned.min(self.base_reward_cap)
    }

    /// `base × quality × tier`, floored.
    #[must_use]
    pub fn final_reward(&self, base: Tokens, quality: QualityScore, tier: RewardTier) -> Tokens {
        quality.apply(base).scale(tier.multiplier_bps())
    }

    /// Most a session on a song of this length can earn; what gets reserved up front.
    #[must_use]
    pub fn reservation_for(&self, song_duration_seconds: u32, tier: RewardTier) -> Tokens {
        self.final_reward(
            self.base_reward(song_duration_seconds),
            QualityScore::PERFECT,
            tier,
        )
    }
}

/// Session lifecycle state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    /// Playback in progress.
    #[default]
    Active,
    /// Playback finished and proof submitted.
    Completed,
    /// Proof verified; final reward computed.
    Verified,
    /// Reward committed from the pool.
    Rewarded,
    /// Ended without reward.
    Failed,
}

impl SessionStatus {
    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Rewarded | Self::Failed)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Verified => "verified",
            Self::Rewarded => "rewarded",
            Self::Failed => "failed",
        })
    }
}

/// Why a session ended without reward.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum FailureReason {
    /// Listened less than the minimum.
    TooShort {
        /// Seconds listened.
        listened: u32,
        /// Seconds required.
        required: u32,
    },
    /// Listened longer than the maximum.
    TooLong {
        /// Seconds listened.
        listened: u32,
        /// Maximum seconds.
        max: u32,
    },
    /// The proof verifier rejected the proof.
    ProofRejected,
    /// The risk scorer blocked the session.
    RiskBlocked {
        /// Risk score.
        score: f64,
    },
    /// No tokens could be reserved for the session.
    PoolExhausted,
    /// Caller abandoned the session (timeout, cancellation).
    Cancelled {
        /// Caller-supplied reason.
        reason: String,
    },
}

/// Facts fixed when a session starts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStart {
    /// Session.
    pub session_id: SessionId,
    /// Listener.
    pub user_id: UserId,
    /// Song played.
    pub song_id: SongId,
    /// Song's artist.
    pub artist_id: ArtistId,
    /// Pool funding the reward.
    pub pool_id: PoolId,
    /// Listener tier.
    pub tier: RewardTier,
    /// Song length.
    pub song_duration_seconds: u32,
    /// Reservation backing the reward, if one could be taken.
    pub reservation_id: Option<ReservationId>,
    /// Tokens reserved.
    pub reserved: Tokens,
    /// When playback started.
    pub started_at: DateTime<Utc>,
}

/// Listen session events.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ListenSessionEvent {
    /// Playback started.
    Started(SessionStart),
    /// Playback finished within the accepted duration.
    Completed {
        /// Seconds listened.
        listen_seconds: u32,
        /// Proof identifier.
        proof_hash: String,
        /// Base reward earned.
        base_reward: Tokens,
        /// When playback finished.
        completed_at: DateTime<Utc>,
    },
    /// Proof accepted and final reward fixed.
    Verified {
        /// Listening quality.
        quality: QualityScore,
        /// Fraud score.
        risk_score: f64,
        /// Recommended action.
        risk_action: RiskAction,
        /// Reward to commit.
        final_reward: Tokens,
        /// When verification finished.
        verified_at: DateTime<Utc>,
    },
    /// Reward committed from the pool.
    Rewarded {
        /// Tokens distributed.
        committed: Tokens,
        /// When the commit happened.
        rewarded_at: DateTime<Utc>,
    },
    /// Session ended without reward.
    Failed {
        /// Why.
        reason: FailureReason,
        /// When.
        failed_at: DateTime<Utc>,
    },
}

impl Event for ListenSessionEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::Started(_) => "ListenSessionStarted.v1",
            Self::Completed { .. } => "ListenSessionCompleted.v1",
            Self::Verified { .. } => "ListenSessionVerified.v1",
            Self::Rewarded { .. } => "ListenSessionRewarded.v1",
            Self::Failed { .. } => "ListenSessionFailed.v1",
        }
    }
}

/// Listen session state.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ListenSession {
    /// Start facts; `None` until the session exists.
    pub start: Option<SessionStart>,
    /// Lifecycle state.
    pub status: SessionStatus,
    /// Seconds listened.
    pub listen_seconds: u32,
    /// Proof identifier.
    pub proof_hash: Option<String>,
    /// Base reward from listen time.
    pub base_reward: Tokens,
    /// Listening quality.
    pub quality: Option<QualityScore>,
    /// Fraud score.
    pub risk_score: Option<f64>,
    /// Reward fixed at verification.
    pub final_reward: Tokens,
    /// Tokens actually committed.
    pub committed: Tokens,
    /// Why the session failed.
    pub failure: Option<FailureReason>,
    /// When the session reached a terminal state.
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Aggregate for ListenSession {
    type Event = ListenSessionEvent;
    const AGGREGATE_TYPE: &'static str = crate::events::aggregate_types::LISTEN_SESSION;

    fn apply(mut self, event: &ListenSessionEvent) -> Self {
        match event {
            ListenSessionEvent::Started(start) => {
                self.start = Some(start.clone());
                self.status = SessionStatus::Active;
            }
            ListenSessionEvent::Completed {
                listen_seconds,
                proof_hash,
                base_reward,
                ..
            } => {
                self.status = SessionStatus::Completed;
                self.listen_seconds = *listen_seconds;
                self.proof_hash = Some(proof_hash.clone());
                self.base_reward = *base_reward;
            }
            ListenSessionEvent::Verified {
                quality,
                risk_score,
                final_reward,
                ..
            } => {
                self.status = SessionStatus::Verified;
                self.quality = Some(*quality);
                self.risk_score = Some(*risk_score);
                self.final_reward = *final_reward;
            }
            ListenSessionEvent::Rewarded {
                committed,
                rewarded_at,
            } => {
                self.status = SessionStatus::Rewarded;
                self.committed = *committed;
                self.resolved_at = Some(*rewarded_at);
            }
            ListenSessionEvent::Failed { reason, failed_at } => {
                self.status = SessionStatus::Failed;
                self.failure = Some(reason.clone());
                self.resolved_at = Some(*failed_at);
            }
        }
        self
    }
}

impl ListenSession {
    /// Session ID, once started.
    #[must_use]
    pub fn id(&self) -> Option<SessionId> {
        self.start.as_ref().map(|s| s.session_id)
    }

    /// Reservation backing the reward.
    #[must_use]
    pub fn reservation_id(&self) -> Option<ReservationId> {
        self.start.as_ref().and_then(|s| s.reservation_id)
    }

    /// Tokens reserved at start.
    #[must_use]
    pub fn reserved(&self) -> Tokens {
        self.start.as_ref().map_or(Tokens::ZERO, |s| s.reserved)
    }

    /// Record the end of playback.
    ///
    /// Listens outside the accepted duration produce a `Failed` event rather
    /// than an error.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InvalidTransition`] unless the session is active.
    pub fn complete(
        &self,
        listen_seconds: u32,
        proof_hash: String,
        policy: &RewardPolicy,
        now: DateTime<Utc>,
    ) -> Result<ListenSessionEvent> {
        let start = self.require(SessionStatus::Active, "complete")?;
        let required = policy.min_listen_for(start.song_duration_seconds);
        if listen_seconds < required {
            return Ok(ListenSessionEvent::Failed {
                reason: FailureReason::TooShort {
                    listened: listen_seconds,
                    required,
                },
                failed_at: now,
            });
        }
        if listen_seconds > policy.max_listen_seconds {
            return Ok(ListenSessionEvent::Failed {
                reason: FailureReason::TooLong {
                    listened: listen_seconds,
                    max: policy.max_listen_seconds,
                },
                failed_at: now,
            });
        }
        Ok(ListenSessionEvent::Completed {
            listen_seconds,
            proof_hash,
            base_reward: policy.base_reward(listen_seconds),
            completed_at: now,
        })
    }

    /// Apply the verifier's verdict and the risk assessment.
    ///
    /// The final reward is `base × quality × tier`, clamped to what was reserved.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InvalidTransition`] unless the session is completed.
    pub fn verify(
        &self,
        verdict: ProofVerdict,
        risk: RiskAssessment,
        policy: &RewardPolicy,
        now: DateTime<Utc>,
    ) -> Result<ListenSessionEvent> {
        let start = self.require(SessionStatus::Completed, "verify")?;
        if !verdict.verified {
            return Ok(ListenSessionEvent::Failed {
                reason: FailureReason::ProofRejected,
                failed_at: now,
            });
        }
        if risk.action == RiskAction::Block {
            return Ok(ListenSessionEvent::Failed {
                reason: FailureReason::RiskBlocked { score: risk.score },
                failed_at: now,
            });
        }
        let final_reward = policy
            .final_reward(self.base_reward, verdict.quality, start.tier)
            .min(start.reserved);
        Ok(ListenSessionEvent::Verified {
            quality: verdict.quality,
            risk_score: risk.score,
            risk_action: risk.action,
            final_reward,
            verified_at: now,
        })
    }

    /// Record the committed reward.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InvalidTransition`] unless the session is verified.
    pub fn reward(&self, committed: Tokens, now: DateTime<Utc>) -> Result<ListenSessionEvent> {
        self.require(SessionStatus::Verified, "reward")?;
        Ok(ListenSessionEvent::Rewarded {
            committed,
            rewarded_at: now,
        })
    }

    /// End the session without reward.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InvalidTransition`] if the session has not started or is terminal.
    pub fn fail(&self, reason: FailureReason, now: DateTime<Utc>) -> Result<ListenSessionEvent> {
        if self.start.is_none() || self.status.is_terminal() {
            return Err(self.invalid("fail"));
        }
        Ok(ListenSessionEvent::Failed {
            reason,
            failed_at: now,
        })
    }

    fn require(&self, status: SessionStatus, action: &'static str) -> Result<&SessionStart> {
        match &self.start {
            Some(start) if self.status == status => Ok(start),
            _ => Err(self.invalid(action)),
        }
    }

    fn invalid(&self, action: &'static str) -> LedgerError {
        LedgerError::InvalidTransition {
            entity: "listen session",
            id: self
                .id()
                .map_or_else(|| "<not started>".to_string(), |id| id.to_string()),
            action,
            state: self.status.to_string(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tuneshare_core::aggregate::replay;

    fn now() -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH
    }

    fn started(tier: RewardTier, reserved: Tokens, duration: u32) -> ListenSession {
        let start = SessionStart {
            session_id: SessionId::new(),
            user_id: UserId::new(),
            song_id: SongId::new(),
            artist_id: ArtistId::new(),
            pool_id: PoolId::new(),
            tier,
            song_duration_seconds: duration,
            reservation_id: Some(ReservationId::new()),
            reserved,
            started_at: now(),
        };
        ListenSession::default().apply(&ListenSessionEvent::Started(start))
    }

    fn allow() -> RiskAssessment {
        RiskAssessment {
            score: 0.1,
            action: RiskAction::Allow,
        }
    }

    fn verdict(quality: f64) -> ProofVerdict {
        ProofVerdict {
            verified: true,
            quality: QualityScore::new(quality).unwrap(),
        }
    }

    #[test]
    fn policy_defaults_match_listening_rules() {
        let policy = RewardPolicy::default();
        assert_eq!(policy.min_listen_for(240), 30);
        assert_eq!(policy.min_listen_for(40), 20);
        // 0.5 token per minute: three minutes earn 1.5 tokens.
        assert_eq!(policy.base_reward(180), Tokens::new(1_500));
        assert_eq!(policy.base_reward(7_200), Tokens::new(60_000));
        assert_eq!(policy.base_reward(1_000_000), Tokens::new(60_000));
    }

    #[test]
    fn base_reward_is_capped() {
        let policy = RewardPolicy {
            base_reward_cap: Tokens::new(1_000),
            ..RewardPolicy::default()
        };
        assert_eq!(policy.base_reward(600), Tokens::new(1_000));
    }

    #[test]
    fn tier_multipliers() {
        let policy = RewardPolicy::default();
        let base = Tokens::new(1_000);
        let q = QualityScore::new(0.5).unwrap();
        assert_eq!(policy.final_reward(base, q, RewardTier::Basic), Tokens::new(500));
        assert_eq!(policy.final_reward(base, q, RewardTier::Premium), Tokens::new(750));
        assert_eq!(policy.final_reward(base, q, RewardTier::Vip), Tokens::new(1_000));
        assert_eq!(policy.final_reward(base, q, RewardTier::Artist), Tokens::new(1_500));
    }

    #[test]
    fn quality_score_rejects_out_of_range() {
        assert!(QualityScore::new(1.01).is_err());
        assert!(QualityScore::new(-0.1).is_err());
        assert!(QualityScore::new(f64::NAN).is_err());
    }

    #[test]
    fn happy_path_reaches_rewarded() {
        let policy = RewardPolicy::default();
        let session = started(RewardTier::Premium, policy.reservation_for(200, RewardTier::Premium), 200);

        let completed = session.complete(180, "proof-1".into(), &policy, now()).unwrap();
        let session = session.apply(&completed);
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.base_reward, Tokens::new(1_500));

        let verified = session.verify(verdict(0.8), allow(), &policy, now()).unwrap();
        let session = session.apply(&verified);
        assert_eq!(session.status, SessionStatus::Verified);
        // 1500 × 0.8 × 1.5
        assert_eq!(session.final_reward, Tokens::new(1_800));

        let rewarded = session.reward(Tokens::new(1_800), now()).unwrap();
        let session = session.apply(&rewarded);
        assert_eq!(session.status, SessionStatus::Rewarded);
        assert!(session.fail(FailureReason::ProofRejected, now()).is_err());
    }

    #[test]
    fn short_listen_fails_the_session() {
        let policy = RewardPolicy::default();
        let session = started(RewardTier::Basic, Tokens::new(10), 240);
        let event = session.complete(10, "p".into(), &policy, now()).unwrap();
        assert!(matches!(
            event,
            ListenSessionEvent::Failed { reason: FailureReason::TooShort { listened: 10, required: 30 }, .. }
        ));
    }

    #[test]
    fn overlong_listen_fails_the_session() {
        let policy = RewardPolicy::default();
        let session = started(RewardTier::Basic, Tokens::new(10), 240);
        let event = session.complete(7_201, "p".into(), &policy, now()).unwrap();
        assert!(matches!(
            event,
            ListenSessionEvent::Failed { reason: FailureReason::TooLong { .. }, .. }
        ));
    }

    #[test]
    fn rejected_proof_and_blocked_risk_fail() {
        let policy = RewardPolicy::default();
        let session = started(RewardTier::Basic, Tokens::new(10_000), 240);
        let event = session.complete(120, "p".into(), &policy, now()).unwrap();
        let session = session.apply(&event);

        let rejected = ProofVerdict {
            verified: false,
            quality: QualityScore::PERFECT,
        };
        assert!(matches!(
            session.verify(rejected, allow(), &policy, now()).unwrap(),
            ListenSessionEvent::Failed { reason: FailureReason::ProofRejected, .. }
        ));

        let block = RiskAssessment {
            score: 0.97,
            action: RiskAction::Block,
        };
        assert!(matches!(
            session.verify(verdict(1.0), block, &policy, now()).unwrap(),
            ListenSessionEvent::Failed { reason: FailureReason::RiskBlocked { .. }, .. }
        ));
    }

    #[test]
    fn final_reward_clamped_to_reservation() {
        let policy = RewardPolicy::default();
        let session = started(RewardTier::Artist, Tokens::new(100), 600);
        let event = session.complete(600, "p".into(), &policy, now()).unwrap();
        let session = session.apply(&event);
        let event = session.verify(verdict(1.0), allow(), &policy, now()).unwrap();
        let session = session.apply(&event);
        assert_eq!(session.final_reward, Tokens::new(100));
    }

    #[test]
    fn out_of_order_transitions_are_rejected() {
        let policy = RewardPolicy::default();
        let session = started(RewardTier::Basic, Tokens::new(10), 240);
        assert!(session.verify(verdict(1.0), allow(), &policy, now()).is_err());
        assert!(session.reward(Tokens::new(1), now()).is_err());
        assert!(ListenSession::default()
            .complete(60, "p".into(), &policy, now())
            .is_err());
        assert!(ListenSession::default()
            .fail(FailureReason::PoolExhausted, now())
            .is_err());
    }

    #[test]
    fn replay_rebuilds_failed_session() {
        let session = started(RewardTier::Vip, Tokens::new(10), 240);
        let start = session.start.clone().unwrap();
        let events = vec![
            ListenSessionEvent::Started(start),
            ListenSessionEvent::Failed {
                reason: FailureReason::Cancelled {
                    reason: "client timeout".into(),
                },
                failed_at: now(),
            },
        ];
        let rebuilt: ListenSession = replay(events.iter());
        assert_eq!(rebuilt.status, SessionStatus::Failed);
        assert!(rebuilt.status.is_terminal());
        assert_eq!(rebuilt.reserved(), Tokens::new(10));
    }
}
