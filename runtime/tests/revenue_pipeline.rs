//! Royalty period close through delivery, distribution and payment settlement.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tuneshare_core::environment::Clock;
use tuneshare_core::event::{EventMetadata, SerializedEvent};
use tuneshare_core::event_bus::{Envelope, EventBus, dead_letter_topic};
use tuneshare_core::outbox::{OutboxStatus, StagedEvent, topic_for};
use tuneshare_core::stream::AggregateId;
use tuneshare_ledger::distribution::{
    Distribution, DistributionOutcome, DistributionRequest, DistributionStatus, DistributionStore,
    FeeSchedule, RevenueDistributor, RevenueEventHandler,
};
use tuneshare_ledger::events::aggregate_types;
use tuneshare_ledger::ownership::OwnershipContract;
use tuneshare_ledger::payments::{BatchOrchestrator, MockPaymentGateway, OrchestratorConfig};
use tuneshare_ledger::types::{
    ArtistId, BasisPoints, ContractId, Currency, DistributionId, Money, SongId, UserId,
};
use tuneshare_ledger::{InMemoryLedger, LedgerError};
use tuneshare_runtime::retry::RetryPolicy;
use tuneshare_runtime::{BreakerConfig, EventConsumer, OutboxPublisher, PublisherConfig};
use tuneshare_testing::{InMemoryEventBus, ManualClock, manual_clock};
use uuid::Uuid;

// ============================================================================
// Test Fixtures
// ============================================================================

struct Pipeline {
    ledger: InMemoryLedger,
    bus: InMemoryEventBus,
    clock: ManualClock,
    publisher: OutboxPublisher,
    distributor: RevenueDistributor,
    orchestrator: BatchOrchestrator,
}

fn pipeline() -> Pipeline {
    tuneshare_testing::init_test_tracing();
    let clock = manual_clock();
    let clock_arc: Arc<dyn Clock> = Arc::new(clock.clone());
    let ledger = InMemoryLedger::with_clock(clock_arc.clone());
    let bus = InMemoryEventBus::new();
    let publisher = OutboxPublisher::new(
        Arc::new(ledger.clone()),
        Arc::new(bus.clone()),
        clock_arc.clone(),
        PublisherConfig {
            batch_size: 50,
            poll_interval: Duration::from_millis(5),
            stale_after: ChronoDuration::minutes(5),
            retention_days: 7,
            cleanup_every: 1,
            store_retry: RetryPolicy::none(),
            breaker: BreakerConfig::default(),
        },
    );
    let distributor = RevenueDistributor::new(
        Arc::new(ledger.clone()),
        clock_arc.clone(),
        FeeSchedule::new(BasisPoints::percent(10).unwrap()),
    );
    let orchestrator = BatchOrchestrator::new(
        Arc::new(ledger.clone()),
        Arc::new(MockPaymentGateway::new()),
        clock_arc,
        OrchestratorConfig::default(),
    );
    Pipeline {
        ledger,
        bus,
        clock,
        publisher,
        distributor,
        orchestrator,
    }
}

async fn period_request(p: &Pipeline) -> DistributionRequest {
    let contract = p
        .distributor
        .register_contract(
            SongId::new(),
            ArtistId::new(),
            1_000,
            BasisPoints::percent(20).unwrap(),
        )
        .await
        .unwrap();
    p.distributor
        .purchase_shares(contract.id, UserId::new(), 300, Money::from_dollars(300))
        .await
        .unwrap();
    p.distributor
        .purchase_shares(contract.id, UserId::new(), 100, Money::from_dollars(100))
        .await
        .unwrap();
    let now = p.clock.now();
    DistributionRequest {
        contract_id: contract.id,
        total_revenue: Money::from_cents(1_000),
        currency: Currency::Usd,
        period_start: now - ChronoDuration::days(30),
        period_end: now,
        artist_share: None,
    }
}

/// Distribution store whose first `distribute` calls fail as if the database
/// dropped the connection.
struct FlakyStore {
    inner: InMemoryLedger,
    failures: AtomicU32,
    calls: AtomicU32,
}

impl DistributionStore for FlakyStore {
    fn insert_contract(&self, contract: OwnershipContract) -> BoxFuture<'_, tuneshare_ledger::Result<()>> {
        self.inner.insert_contract(contract)
    }

    fn load_contract(
        &self,
        contract_id: ContractId,
    ) -> BoxFuture<'_, tuneshare_ledger::Result<OwnershipContract>> {
        self.inner.load_contract(contract_id)
    }

    fn record_share_purchase(
        &self,
        contract_id: ContractId,
        holder: UserId,
        shares: u64,
        price: Money,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, tuneshare_ledger::Result<OwnershipContract>> {
        self.inner
            .record_share_purchase(contract_id, holder, shares, price, now)
    }

    fn record_share_transfer(
        &self,
        contract_id: ContractId,
        seller: UserId,
        buyer: UserId,
        shares: u64,
        price: Money,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, tuneshare_ledger::Result<OwnershipContract>> {
        self.inner
            .record_share_transfer(contract_id, seller, buyer, shares, price, now)
    }

    fn record_period_close(
        &self,
        request: DistributionRequest,
        staged: StagedEvent,
    ) -> BoxFuture<'_, tuneshare_ledger::Result<()>> {
        self.inner.record_period_close(request, staged)
    }

    fn distribute(
        &self,
        request: DistributionRequest,
        fees: FeeSchedule,
        now: DateTime<Utc>,
        metadata: EventMetadata,
    ) -> BoxFuture<'_, tuneshare_ledger::Result<DistributionOutcome>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Box::pin(async { Err(LedgerError::Storage("connection reset".into())) });
        }
        self.inner.distribute(request, fees, now, metadata)
    }

    fn load_distribution(
        &self,
        distribution_id: DistributionId,
    ) -> BoxFuture<'_, tuneshare_ledger::Result<Distribution>> {
        self.inner.load_distribution(distribution_id)
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy::builder()
        .max_retries(3)
        .initial_delay(Duration::from_millis(1))
        .max_delay(Duration::from_millis(5))
        .jitter(false)
        .build()
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

fn delivered_types(bus: &InMemoryEventBus) -> Vec<String> {
    bus.published()
        .into_iter()
        .map(|(_, envelope)| envelope.event.event_type)
        .collect()
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn closed_period_is_delivered_distributed_and_paid() {
    let p = pipeline();
    let request = period_request(&p).await;
    p.distributor
        .close_royalty_period(request, EventMetadata::correlated().with_actor("finance"))
        .await
        .unwrap();

    let report = p.publisher.tick(false).await.unwrap();
    assert_eq!(report.published, 1);
    let delivered = p.bus.published_to(&topic_for(aggregate_types::REVENUE));
    assert_eq!(delivered.len(), 1);

    // At-least-once delivery: the handler sees the same envelope twice.
    let handler = RevenueEventHandler::new(p.distributor.clone());
    let distribution = handler.handle(&delivered[0]).await.unwrap().unwrap();
    let again = handler.handle(&delivered[0]).await.unwrap().unwrap();
    assert_eq!(distribution.id, again.id);

    let batch_id = distribution.batch_id.unwrap();
    p.orchestrator
        .process(batch_id, EventMetadata::correlated())
        .await
        .unwrap();
    p.publisher.tick(false).await.unwrap();

    assert_eq!(
        delivered_types(&p.bus),
        vec![
            "RoyaltyPeriodClosed.v1",
            "RevenueDistributed.v1",
            "PaymentBatchCreated.v1",
            "PaymentCompleted.v1",
            "PaymentCompleted.v1",
            "PaymentCompleted.v1",
            "PaymentBatchSettled.v1",
            "DistributionSettled.v1",
        ]
    );
    let settled = p.distributor.distribution(distribution.id).await.unwrap();
    assert_eq!(settled.status, DistributionStatus::Completed);
    assert!(
        p.ledger
            .outbox_entries()
            .unwrap()
            .iter()
            .all(|e| e.status == OutboxStatus::Published)
    );
}

#[tokio::test]
async fn channel_outage_delays_but_does_not_lose_distribution_events() {
    let p = pipeline();
    let request = period_request(&p).await;
    p.distributor
        .distribute(request, EventMetadata::correlated())
        .await
        .unwrap();

    p.bus.fail_always();
    let report = p.publisher.tick(false).await.unwrap();
    assert_eq!(report.failed, 2);
    assert!(p.bus.published().is_empty());

    p.bus.heal();
    let report = p.publisher.tick(false).await.unwrap();
    assert_eq!(report.published, 2);
    assert_eq!(
        delivered_types(&p.bus),
        vec!["RevenueDistributed.v1", "PaymentBatchCreated.v1"]
    );
    let counts = p.ledger.outbox_entries().unwrap();
    assert!(counts.iter().all(|e| e.retry_count == 1));
}

#[tokio::test]
async fn transient_store_failure_is_retried_until_the_distribution_exists() {
    let p = pipeline();
    let request = period_request(&p).await;
    let store = Arc::new(FlakyStore {
        inner: p.ledger.clone(),
        failures: AtomicU32::new(1),
        calls: AtomicU32::new(0),
    });
    let distributor = RevenueDistributor::new(
        store.clone(),
        Arc::new(p.clock.clone()),
        FeeSchedule::new(BasisPoints::percent(10).unwrap()),
    );
    let consumer = Arc::new(EventConsumer::new(
        RevenueEventHandler::new(distributor),
        Arc::new(p.bus.clone()),
        fast_retry(),
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn({
        let consumer = consumer.clone();
        async move { consumer.run(shutdown_rx).await }
    });
    eventually("the subscription", || p.bus.subscriber_count() == 1).await;

    p.distributor
        .close_royalty_period(request, EventMetadata::correlated())
        .await
        .unwrap();
    p.publisher.tick(false).await.unwrap();
    let closed = p.bus.published_to(&topic_for(aggregate_types::REVENUE));
    assert_eq!(closed.len(), 1);

    eventually("the acknowledgement", || !p.bus.acknowledged().is_empty()).await;
    assert_eq!(p.bus.acknowledged(), vec![closed[0].outbox_id]);
    assert_eq!(store.calls.load(Ordering::SeqCst), 2);
    assert!(
        p.ledger
            .outbox_entries()
            .unwrap()
            .iter()
            .any(|e| e.event.event_type == "RevenueDistributed.v1")
    );
    assert!(
        p.bus
            .published_to(&dead_letter_topic(&topic_for(aggregate_types::REVENUE)))
            .is_empty()
    );

    shutdown_tx.send_replace(true);
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn undecodable_revenue_event_is_parked_for_an_operator() {
    let p = pipeline();
    let consumer = Arc::new(EventConsumer::new(
        RevenueEventHandler::new(p.distributor.clone()),
        Arc::new(p.bus.clone()),
        fast_retry(),
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn({
        let consumer = consumer.clone();
        async move { consumer.run(shutdown_rx).await }
    });
    eventually("the subscription", || p.bus.subscriber_count() == 1).await;

    let topic = topic_for(aggregate_types::REVENUE);
    let garbage = Envelope {
        outbox_id: Uuid::new_v4(),
        aggregate_id: AggregateId::new("contract-1"),
        aggregate_type: aggregate_types::REVENUE.to_string(),
        event: SerializedEvent::new(
            "RoyaltyPeriodClosed.v1".into(),
            b"not an event".to_vec(),
            EventMetadata::correlated(),
        ),
        occurred_at: p.clock.now(),
    };
    p.bus.publish(&topic, &garbage).await.unwrap();

    eventually("the acknowledgement", || !p.bus.acknowledged().is_empty()).await;
    let parked = p.bus.published_to(&dead_letter_topic(&topic));
    assert_eq!(parked, vec![garbage]);

    shutdown_tx.send_replace(true);
    task.await.unwrap().unwrap();
}

