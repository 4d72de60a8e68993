//! Listen-to-earn rewards: pools, reservations and listen sessions.

pub mod allocator;
pub mod listen;
pub mod pool;
pub mod session;
pub mod verification;

pub use allocator::{PoolChange, RewardAllocator, RewardPoolStore, ReserveRequest};
pub use listen::{ListenRewardService, StartListen};
pub use pool::{PoolStatus, Reservation, ReservationClaim, ReservationStatus, RewardPool};
pub use session::{
    FailureReason, ListenSession, ListenSessionEvent, QualityScore, RewardPolicy, RewardTier,
    SessionStatus,
};
pub use verification::{
    ListenProof, ProofVerdict, ProofVerifier, RiskAction, RiskAssessment, RiskScorer,
    StaticRiskScorer, StaticVerifier, VerificationError,
};
