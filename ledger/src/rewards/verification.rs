//! Proof verification and risk scoring collaborators.
//!
//! Both are external systems; the ledger only consumes their verdicts. The
//! static implementations here serve local runs and tests.

use crate::rewards::session::{ListenSession, QualityScore};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Verification collaborator failure.
#[derive(Error, Debug, Clone)]
pub enum VerificationError {
    /// The collaborator could not be reached or timed out.
    #[error("verification service unavailable: {0}")]
    Unavailable(String),

    /// The submitted proof could not be parsed.
    #[error("malformed proof: {0}")]
    MalformedProof(String),
}

impl VerificationError {
    /// Whether retrying may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Listening proof submitted by the client when a session completes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenProof {
    /// Hash identifying the proof; stored on the session.
    pub proof_hash: String,
    /// Opaque proof payload passed through to the verifier.
    pub payload: Vec<u8>,
}

/// Outcome of proof verification.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProofVerdict {
    /// Whether the proof is valid.
    pub verified: bool,
    /// Listening quality, 0.0 to 1.0.
    pub quality: QualityScore,
}

/// What the risk scorer recommends.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskAction {
    /// Reward normally.
    Allow,
    /// Reward, but flag for human review.
    Review,
    /// Do not reward.
    Block,
}

/// Risk scorer output.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RiskAssessment {
    /// Fraud likelihood, 0.0 to 1.0.
    pub score: f64,
    /// Recommended action.
    pub action: RiskAction,
}

/// Verifies listening proofs.
pub trait ProofVerifier: Send + Sync {
    /// Verify `proof` for `session`.
    ///
    /// # Errors
    ///
    /// [`VerificationError`] if no verdict could be reached.
    fn verify<'a>(
        &'a self,
        session: &'a ListenSession,
        proof: &'a ListenProof,
    ) -> BoxFuture<'a, Result<ProofVerdict, VerificationError>>;
}

/// Scores sessions for fraud.
pub trait RiskScorer: Send + Sync {
    /// Assess a completed session.
    ///
    /// # Errors
    ///
    /// [`VerificationError`] if no assessment could be made.
    fn assess<'a>(
        &'a self,
        session: &'a ListenSession,
    ) -> BoxFuture<'a, Result<RiskAssessment, VerificationError>>;
}

/// Verifier that returns the same verdict for every proof with a non-empty hash.
#[derive(Clone, Copy, Debug)]
pub struct StaticVerifier {
    verdict: ProofVerdict,
}

impl StaticVerifier {
    /// Accept every proof with the given quality.
    #[must_use]
    pub const fn accepting(quality: QualityScore) -> Self {
        Self {
            verdict: ProofVerdict {
                verified: true,
                quality,
            },
        }
    }

    /// Reject every proof.
    #[must_use]
    pub const fn rejecting() -> Self {
        Self {
            verdict: ProofVerdict {
                verified: false,
                quality: QualityScore::ZERO,
            },
        }
    }
}

impl ProofVerifier for StaticVerifier {
    fn verify<'a>(
        &'a self,
        _session: &'a ListenSession,
        proof: &'a ListenProof,
    ) -> BoxFuture<'a, Result<ProofVerdict, VerificationError>> {
        Box::pin(async move {
            if proof.proof_hash.is_empty() {
                return Err(VerificationError::MalformedProof("empty proof hash".into()));
            }
            Ok(self.verdict)
        })
    }
}

/// Scorer that returns a fixed assessment.
#[derive(Clone, Copy, Debug)]
pub struct StaticRiskScorer {
    assessment: RiskAssessment,
}

impl StaticRiskScorer {
    /// Score every session as `score` with `action`.
    #[must_use]
    pub const fn new(score: f64, action: RiskAction) -> Self {
        Self {
            assessment: RiskAssessment { score, action },
        }
    }

    /// Allow everything.
    #[must_use]
    pub const fn allow_all() -> Self {
        Self::new(0.0, RiskAction::Allow)
    }
}

impl RiskScorer for StaticRiskScorer {
    fn assess<'a>(
        &'a self,
        _session: &'a ListenSession,
    ) -> BoxFuture<'a, Result<RiskAssessment, VerificationError>> {
        Box::pin(async move { Ok(self.assessment) })
    }
}
