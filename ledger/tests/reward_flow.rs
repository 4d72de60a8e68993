//! End-to-end listen-to-earn flows over the in-memory event store and ledger.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use chrono::{DateTime, Duration, Utc};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tuneshare_core::environment::Clock;
use tuneshare_core::event::{EventMetadata, RecordedEvent, SerializedEvent};
use tuneshare_core::event_store::{AppendBatch, EventStore, EventStoreError, EventStream, Snapshot};
use tuneshare_core::outbox::{OutboxStatus, OutboxStore, StagedEvent};
use tuneshare_core::stream::{AggregateId, Version};
use tuneshare_ledger::InMemoryLedger;
use tuneshare_ledger::LedgerError;
use tuneshare_ledger::events::aggregate_types;
use tuneshare_ledger::rewards::{
    FailureReason, ListenProof, ListenRewardService, ListenSessionEvent, PoolChange, QualityScore,
    Reservation, ReservationStatus, ReserveRequest, RewardAllocator, RewardPolicy, RewardPool,
    RewardPoolStore, RewardTier, RiskAction, SessionStatus, StartListen, StaticRiskScorer,
    StaticVerifier,
};
use tuneshare_ledger::types::{ArtistId, PoolId, ReservationId, SessionId, SongId, Tokens, UserId};
use tuneshare_testing::{InMemoryEventStore, ManualClock, manual_clock};

// ============================================================================
// Test Fixtures
// ============================================================================

struct Harness {
    ledger: InMemoryLedger,
    events: Arc<InMemoryEventStore>,
    allocator: RewardAllocator,
    service: ListenRewardService,
    clock: ManualClock,
}

fn harness(verifier: StaticVerifier, risk: StaticRiskScorer) -> Harness {
    tuneshare_testing::init_test_tracing();
    let clock = manual_clock();
    let clock_arc: Arc<dyn Clock> = Arc::new(clock.clone());
    let ledger = InMemoryLedger::with_clock(clock_arc.clone());
    let events = Arc::new(InMemoryEventStore::new());
    let allocator = RewardAllocator::new(
        Arc::new(ledger.clone()),
        clock_arc.clone(),
        RewardPolicy::default(),
    );
    let service = ListenRewardService::new(
        events.clone(),
        allocator.clone(),
        Arc::new(verifier),
        Arc::new(risk),
        clock_arc,
    );
    Harness {
        ledger,
        events,
        allocator,
        service,
        clock,
    }
}

fn accepting() -> Harness {
    harness(
        StaticVerifier::accepting(QualityScore::PERFECT),
        StaticRiskScorer::allow_all(),
    )
}

async fn open_pool(h: &Harness, total: Tokens) -> RewardPool {
    let now = h.clock.now();
    h.allocator
        .open_pool(
            total,
            now - Duration::hours(1),
            now + Duration::days(1),
            EventMetadata::correlated(),
        )
        .await
        .unwrap()
}

fn listen(pool: &RewardPool, tier: RewardTier, song_duration_seconds: u32) -> StartListen {
    StartListen {
        user_id: UserId::new(),
        song_id: SongId::new(),
        artist_id: ArtistId::new(),
        pool_id: pool.id,
        tier,
        song_duration_seconds,
    }
}

fn proof(hash: &str) -> ListenProof {
    ListenProof {
        proof_hash: hash.to_string(),
        payload: vec![1, 2, 3],
    }
}

/// Event store where a cancellation is recorded just ahead of the reward.
struct CancelledBeforeReward {
    inner: Arc<InMemoryEventStore>,
}

impl EventStore for CancelledBeforeReward {
    fn append(
        &self,
        batch: AppendBatch,
    ) -> BoxFuture<'_, Result<Vec<RecordedEvent>, EventStoreError>> {
        Box::pin(async move {
            let rewarding = batch
                .events
                .iter()
                .any(|e| e.event_type == "ListenSessionRewarded.v1");
            if rewarding {
                let cancelled = ListenSessionEvent::Failed {
                    reason: FailureReason::Cancelled {
                        reason: "client timeout".into(),
                    },
                    failed_at: batch.occurred_at,
                };
                let event = SerializedEvent::from_event(&cancelled, EventMetadata::correlated())
                    .unwrap();
                self.inner
                    .append(AppendBatch::new(
                        batch.aggregate_id.clone(),
                        batch.aggregate_type.clone(),
                        batch.expected_version,
                        vec![event],
                    )
                    .at(batch.occurred_at))
                    .await?;
            }
            self.inner.append(batch).await
        })
    }

    fn read(&self, aggregate_id: AggregateId, after: Version) -> EventStream<'_> {
        self.inner.read(aggregate_id, after)
    }

    fn current_version(
        &self,
        aggregate_id: AggregateId,
    ) -> BoxFuture<'_, Result<Version, EventStoreError>> {
        self.inner.current_version(aggregate_id)
    }

    fn save_snapshot(&self, snapshot: Snapshot) -> BoxFuture<'_, Result<(), EventStoreError>> {
        self.inner.save_snapshot(snapshot)
    }

    fn load_snapshot(
        &self,
        aggregate_id: AggregateId,
    ) -> BoxFuture<'_, Result<Option<Snapshot>, EventStoreError>> {
        self.inner.load_snapshot(aggregate_id)
    }
}

/// Pool store whose next commit is lost, as if the process died before it ran.
struct InterruptedCommit {
    inner: InMemoryLedger,
    armed: AtomicBool,
}

impl RewardPoolStore for InterruptedCommit {
    fn insert_pool(
        &self,
        pool: RewardPool,
        staged: Vec<StagedEvent>,
    ) -> BoxFuture<'_, tuneshare_ledger::Result<()>> {
        self.inner.insert_pool(pool, staged)
    }

    fn load_pool(&self, pool_id: PoolId) -> BoxFuture<'_, tuneshare_ledger::Result<RewardPool>> {
        self.inner.load_pool(pool_id)
    }

    fn load_reservation(
        &self,
        reservation_id: ReservationId,
    ) -> BoxFuture<'_, tuneshare_ledger::Result<Reservation>> {
        self.inner.load_reservation(reservation_id)
    }

    fn reserve(
        &self,
        request: ReserveRequest,
        now: DateTime<Utc>,
        metadata: EventMetadata,
    ) -> BoxFuture<'_, tuneshare_ledger::Result<PoolChange>> {
        self.inner.reserve(request, now, metadata)
    }

    fn commit(
        &self,
        reservation_id: ReservationId,
        final_amount: Tokens,
        now: DateTime<Utc>,
        metadata: EventMetadata,
    ) -> BoxFuture<'_, tuneshare_ledger::Result<PoolChange>> {
        if self.armed.swap(false, Ordering::SeqCst) {
            return Box::pin(async { Err(LedgerError::Storage("connection reset".into())) });
        }
        self.inner.commit(reservation_id, final_amount, now, metadata)
    }

    fn release(
        &self,
        reservation_id: ReservationId,
        now: DateTime<Utc>,
        metadata: EventMetadata,
    ) -> BoxFuture<'_, tuneshare_ledger::Result<PoolChange>> {
        RewardPoolStore::release(&self.inner, reservation_id, now, metadata)
    }

    fn close_pool(
        &self,
        pool_id: PoolId,
        now: DateTime<Utc>,
        metadata: EventMetadata,
    ) -> BoxFuture<'_, tuneshare_ledger::Result<RewardPool>> {
        self.inner.close_pool(pool_id, now, metadata)
    }
}

fn service_over(
    h: &Harness,
    events: Arc<dyn EventStore>,
    allocator: RewardAllocator,
) -> ListenRewardService {
    ListenRewardService::new(
        events,
        allocator,
        Arc::new(StaticVerifier::accepting(QualityScore::PERFECT)),
        Arc::new(StaticRiskScorer::allow_all()),
        Arc::new(h.clock.clone()),
    )
}

async fn verified_session(
    h: &Harness,
    service: &ListenRewardService,
    pool: &RewardPool,
) -> SessionId {
    let id = service
        .start_session(listen(pool, RewardTier::Basic, 180), EventMetadata::correlated())
        .await
        .unwrap()
        .id()
        .unwrap();
    h.clock.advance(Duration::seconds(120));
    service
        .complete_session(id, 120, "proof-1".into(), EventMetadata::correlated())
        .await
        .unwrap();
    service
        .verify_session(id, &proof("proof-1"), EventMetadata::correlated())
        .await
        .unwrap();
    id
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn verified_listen_commits_its_reward() {
    let h = accepting();
    let pool = open_pool(&h, Tokens::whole(1_000)).await;

    let session = h
        .service
        .start_session(listen(&pool, RewardTier::Basic, 180), EventMetadata::correlated())
        .await
        .unwrap();
    let session_id = session.id().unwrap();
    // 180 s at 0.5 tokens per minute.
    assert_eq!(session.reserved(), Tokens::new(1_500));
    assert_eq!(
        h.allocator.pool(pool.id).await.unwrap().reserved_tokens,
        Tokens::new(1_500)
    );

    h.clock.advance(Duration::seconds(120));
    h.service
        .complete_session(session_id, 120, "proof-1".into(), EventMetadata::correlated())
        .await
        .unwrap();
    let verified = h
        .service
        .verify_session(session_id, &proof("proof-1"), EventMetadata::correlated())
        .await
        .unwrap();
    assert_eq!(verified.status, SessionStatus::Verified);
    assert_eq!(verified.final_reward, Tokens::new(1_000));

    let rewarded = h
        .service
        .reward_session(session_id, EventMetadata::correlated())
        .await
        .unwrap();
    assert_eq!(rewarded.status, SessionStatus::Rewarded);
    assert_eq!(rewarded.committed, Tokens::new(1_000));

    let pool = h.allocator.pool(pool.id).await.unwrap();
    assert_eq!(pool.distributed_tokens, Tokens::new(1_000));
    assert!(pool.reserved_tokens.is_zero());
    assert_eq!(pool.available(), Tokens::new(999_000));
    assert_eq!(h.events.event_count(&session_id.aggregate_id()), 4);

    let reservation = h
        .allocator
        .reservation(session.reservation_id().unwrap())
        .await
        .unwrap();
    assert_eq!(reservation.status, ReservationStatus::Committed);
    assert_eq!(reservation.committed, Some(Tokens::new(1_000)));
}

#[tokio::test]
async fn premium_tier_multiplies_reward() {
    let h = accepting();
    let pool = open_pool(&h, Tokens::whole(1_000)).await;

    let session = h
        .service
        .start_session(listen(&pool, RewardTier::Premium, 180), EventMetadata::correlated())
        .await
        .unwrap();
    let id = session.id().unwrap();
    assert_eq!(session.reserved(), Tokens::new(2_250));

    h.service
        .complete_session(id, 180, "p".into(), EventMetadata::correlated())
        .await
        .unwrap();
    h.service
        .verify_session(id, &proof("p"), EventMetadata::correlated())
        .await
        .unwrap();
    let rewarded = h
        .service
        .reward_session(id, EventMetadata::correlated())
        .await
        .unwrap();
    assert_eq!(rewarded.committed, Tokens::new(2_250));
}

#[tokio::test]
async fn short_listen_fails_and_releases_reservation() {
    let h = accepting();
    let pool = open_pool(&h, Tokens::whole(1_000)).await;
    let session = h
        .service
        .start_session(listen(&pool, RewardTier::Basic, 180), EventMetadata::correlated())
        .await
        .unwrap();
    let id = session.id().unwrap();

    let failed = h
        .service
        .complete_session(id, 10, "p".into(), EventMetadata::correlated())
        .await
        .unwrap();
    assert_eq!(failed.status, SessionStatus::Failed);
    assert_eq!(
        failed.failure,
        Some(FailureReason::TooShort {
            listened: 10,
            required: 30
        })
    );

    let pool = h.allocator.pool(pool.id).await.unwrap();
    assert!(pool.reserved_tokens.is_zero());
    assert!(pool.distributed_tokens.is_zero());
    let reservation = h
        .allocator
        .reservation(session.reservation_id().unwrap())
        .await
        .unwrap();
    assert_eq!(reservation.status, ReservationStatus::Released);
}

#[tokio::test]
async fn mismatched_proof_hash_is_rejected() {
    let h = accepting();
    let pool = open_pool(&h, Tokens::whole(1_000)).await;
    let id = h
        .service
        .start_session(listen(&pool, RewardTier::Basic, 180), EventMetadata::correlated())
        .await
        .unwrap()
        .id()
        .unwrap();
    h.service
        .complete_session(id, 60, "submitted".into(), EventMetadata::correlated())
        .await
        .unwrap();

    let session = h
        .service
        .verify_session(id, &proof("forged"), EventMetadata::correlated())
        .await
        .unwrap();
    assert_eq!(session.failure, Some(FailureReason::ProofRejected));
    assert!(h.allocator.pool(pool.id).await.unwrap().reserved_tokens.is_zero());
}

#[tokio::test]
async fn risk_block_fails_session() {
    let h = harness(
        StaticVerifier::accepting(QualityScore::PERFECT),
        StaticRiskScorer::new(0.95, RiskAction::Block),
    );
    let pool = open_pool(&h, Tokens::whole(1_000)).await;
    let id = h
        .service
        .start_session(listen(&pool, RewardTier::Vip, 240), EventMetadata::correlated())
        .await
        .unwrap()
        .id()
        .unwrap();
    h.service
        .complete_session(id, 240, "p".into(), EventMetadata::correlated())
        .await
        .unwrap();
    let session = h
        .service
        .verify_session(id, &proof("p"), EventMetadata::correlated())
        .await
        .unwrap();

    assert!(matches!(
        session.failure,
        Some(FailureReason::RiskBlocked { .. })
    ));
    assert!(h.allocator.pool(pool.id).await.unwrap().reserved_tokens.is_zero());
}

#[tokio::test]
async fn nearly_empty_pool_reserves_what_is_left_then_nothing() {
    let h = accepting();
    let pool = open_pool(&h, Tokens::new(1_000)).await;

    let first = h
        .service
        .start_session(listen(&pool, RewardTier::Basic, 180), EventMetadata::correlated())
        .await
        .unwrap();
    assert_eq!(first.reserved(), Tokens::new(1_000));

    let second = h
        .service
        .start_session(listen(&pool, RewardTier::Basic, 180), EventMetadata::correlated())
        .await
        .unwrap();
    assert_eq!(second.reservation_id(), None);

    let failed = h
        .service
        .reward_session(second.id().unwrap(), EventMetadata::correlated())
        .await
        .unwrap();
    assert_eq!(failed.failure, Some(FailureReason::PoolExhausted));

    let pool = h.allocator.pool(pool.id).await.unwrap();
    assert_eq!(pool.reserved_tokens, Tokens::new(1_000));
    pool.check_invariant().unwrap();
}

#[tokio::test]
async fn cancelling_twice_releases_once() {
    let h = accepting();
    let pool = open_pool(&h, Tokens::whole(1_000)).await;
    let id = h
        .service
        .start_session(listen(&pool, RewardTier::Basic, 180), EventMetadata::correlated())
        .await
        .unwrap()
        .id()
        .unwrap();

    let reason = FailureReason::Cancelled {
        reason: "client timeout".into(),
    };
    h.service
        .fail_session(id, reason.clone(), EventMetadata::correlated())
        .await
        .unwrap();
    let again = h
        .service
        .fail_session(id, reason, EventMetadata::correlated())
        .await
        .unwrap();

    assert_eq!(again.status, SessionStatus::Failed);
    assert_eq!(h.events.event_count(&id.aggregate_id()), 2);
    let pool = h.allocator.pool(pool.id).await.unwrap();
    assert!(pool.reserved_tokens.is_zero());
    assert_eq!(pool.available(), Tokens::whole(1_000));
}

#[tokio::test]
async fn rewarded_session_cannot_be_failed() {
    let h = accepting();
    let pool = open_pool(&h, Tokens::whole(1_000)).await;
    let id = h
        .service
        .start_session(listen(&pool, RewardTier::Basic, 60), EventMetadata::correlated())
        .await
        .unwrap()
        .id()
        .unwrap();
    h.service
        .complete_session(id, 60, "p".into(), EventMetadata::correlated())
        .await
        .unwrap();
    h.service
        .verify_session(id, &proof("p"), EventMetadata::correlated())
        .await
        .unwrap();
    h.service
        .reward_session(id, EventMetadata::correlated())
        .await
        .unwrap();

    let err = h
        .service
        .fail_session(id, FailureReason::ProofRejected, EventMetadata::correlated())
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidTransition { .. }));
}

#[tokio::test]
async fn unknown_session_is_not_found() {
    let h = accepting();
    let err = h
        .service
        .session(tuneshare_ledger::types::SessionId::new())
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::NotFound { .. }));
}

#[tokio::test]
async fn pool_changes_are_staged_in_the_outbox() {
    let h = accepting();
    let pool = open_pool(&h, Tokens::whole(1_000)).await;
    let id = h
        .service
        .start_session(listen(&pool, RewardTier::Basic, 180), EventMetadata::correlated())
        .await
        .unwrap()
        .id()
        .unwrap();
    h.service
        .fail_session(id, FailureReason::ProofRejected, EventMetadata::correlated())
        .await
        .unwrap();

    let entries = h.ledger.outbox_entries().unwrap();
    let types: Vec<&str> = entries.iter().map(|e| e.event.event_type.as_str()).collect();
    assert_eq!(
        types,
        vec![
            "RewardPoolOpened.v1",
            "TokensReserved.v1",
            "ReservationReleased.v1"
        ]
    );
    assert!(entries
        .iter()
        .all(|e| e.aggregate_type == aggregate_types::REWARD_POOL && e.status == OutboxStatus::Pending));
    assert_eq!(h.ledger.counts().await.unwrap().pending, 3);
}

#[tokio::test]
async fn closing_pool_with_open_reservation_is_rejected() {
    let h = accepting();
    let pool = open_pool(&h, Tokens::whole(1_000)).await;
    let id = h
        .service
        .start_session(listen(&pool, RewardTier::Basic, 180), EventMetadata::correlated())
        .await
        .unwrap()
        .id()
        .unwrap();

    h.clock.advance(Duration::days(2));
    let err = h
        .allocator
        .close_pool(pool.id, EventMetadata::correlated())
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidTransition { .. }));

    h.service
        .fail_session(
            id,
            FailureReason::Cancelled {
                reason: "expired".into(),
            },
            EventMetadata::correlated(),
        )
        .await
        .unwrap();
    let closed = h
        .allocator
        .close_pool(pool.id, EventMetadata::correlated())
        .await
        .unwrap();
    assert!(closed.closed_at.is_some());
}

#[tokio::test]
async fn cancellation_racing_a_reward_leaves_the_pool_untouched() {
    let h = accepting();
    let pool = open_pool(&h, Tokens::whole(1_000)).await;
    let service = service_over(
        &h,
        Arc::new(CancelledBeforeReward {
            inner: h.events.clone(),
        }),
        h.allocator.clone(),
    );
    let id = verified_session(&h, &service, &pool).await;

    let err = service
        .reward_session(id, EventMetadata::correlated())
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::ConcurrencyConflict { .. }));
    let untouched = h.allocator.pool(pool.id).await.unwrap();
    assert!(untouched.distributed_tokens.is_zero());

    // The cancelling caller finishes its release; a retried reward is refused.
    let failed = service
        .fail_session(
            id,
            FailureReason::Cancelled {
                reason: "client timeout".into(),
            },
            EventMetadata::correlated(),
        )
        .await
        .unwrap();
    assert_eq!(failed.status, SessionStatus::Failed);
    assert!(matches!(
        service.reward_session(id, EventMetadata::correlated()).await,
        Err(LedgerError::InvalidTransition { .. })
    ));

    let pool = h.allocator.pool(pool.id).await.unwrap();
    assert!(pool.distributed_tokens.is_zero());
    assert!(pool.reserved_tokens.is_zero());
    assert_eq!(pool.available(), Tokens::whole(1_000));
}

#[tokio::test]
async fn interrupted_reward_commit_completes_on_retry() {
    let h = accepting();
    let pool = open_pool(&h, Tokens::whole(1_000)).await;
    let allocator = RewardAllocator::new(
        Arc::new(InterruptedCommit {
            inner: h.ledger.clone(),
            armed: AtomicBool::new(true),
        }),
        Arc::new(h.clock.clone()),
        RewardPolicy::default(),
    );
    let service = service_over(&h, h.events.clone(), allocator);
    let id = verified_session(&h, &service, &pool).await;

    let err = service
        .reward_session(id, EventMetadata::correlated())
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Storage(_)));
    assert_eq!(service.session(id).await.unwrap().status, SessionStatus::Rewarded);
    assert_eq!(
        h.allocator.pool(pool.id).await.unwrap().reserved_tokens,
        Tokens::new(1_500)
    );

    let rewarded = service
        .reward_session(id, EventMetadata::correlated())
        .await
        .unwrap();
    assert_eq!(rewarded.committed, Tokens::new(1_000));
    let pool = h.allocator.pool(pool.id).await.unwrap();
    assert_eq!(pool.distributed_tokens, Tokens::new(1_000));
    assert!(pool.reserved_tokens.is_zero());

    // A third call is a no-op.
    service
        .reward_session(id, EventMetadata::correlated())
        .await
        .unwrap();
    assert_eq!(
        h.allocator.pool(pool.id).await.unwrap().distributed_tokens,
        Tokens::new(1_000)
    );
}
