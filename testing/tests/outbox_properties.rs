//! Property tests for the outbox lifecycle rules shared by every outbox store.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use chrono::Duration;
use proptest::prelude::*;
use std::collections::HashSet;
use tuneshare_core::environment::Clock;
use tuneshare_core::event::{EventMetadata, SerializedEvent};
use tuneshare_core::outbox::{DEFAULT_MAX_RETRIES, OutboxLog, OutboxStatus, StagedEvent, topic_for};
use tuneshare_core::stream::AggregateId;
use tuneshare_testing::test_clock;

// ============================================================================
// Operations
// ============================================================================

#[derive(Debug, Clone)]
enum Op {
    Claim(usize),
    Publish(usize),
    Fail(usize),
    Release(usize),
    Reclaim,
    Requeue(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1..4usize).prop_map(Op::Claim),
        (0..8usize).prop_map(Op::Publish),
        (0..8usize).prop_map(Op::Fail),
        (0..8usize).prop_map(Op::Release),
        Just(Op::Reclaim),
        (0..8usize).prop_map(Op::Requeue),
    ]
}

fn log_with(entries: usize) -> OutboxLog {
    let now = test_clock().now();
    let mut log = OutboxLog::new();
    for n in 0..entries {
        log.stage(
            StagedEvent {
                aggregate_id: AggregateId::new(format!("pool-{n}")),
                aggregate_type: "reward_pool".into(),
                routing_key: topic_for("reward_pool"),
                event: SerializedEvent::new(
                    "TokensReserved.v1".into(),
                    vec![],
                    EventMetadata::default(),
                ),
                occurred_at: now + Duration::seconds(i64::try_from(n).unwrap()),
                max_retries: DEFAULT_MAX_RETRIES,
            },
            now,
        );
    }
    log
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #[test]
    fn lifecycle_rules_hold_for_any_sequence(
        entries in 1..8usize,
        ops in prop::collection::vec(op(), 1..60),
    ) {
        let mut log = log_with(entries);
        let ids: Vec<_> = log.entries().iter().map(|e| e.id).collect();
        let mut now = test_clock().now();

        for op in ops {
            now += Duration::seconds(1);
            match op {
                Op::Claim(limit) => {
                    let processing: HashSet<_> = log
                        .entries()
                        .iter()
                        .filter(|e| e.status == OutboxStatus::Processing)
                        .map(|e| e.id)
                        .collect();
                    let claimed = log.claim_batch(limit, now);
                    prop_assert!(claimed.len() <= limit);
                    for entry in &claimed {
                        prop_assert!(!processing.contains(&entry.id), "entry claimed twice");
                    }
                    let order: Vec<_> = claimed.iter().map(|e| (e.occurred_at, e.created_at)).collect();
                    let mut sorted = order.clone();
                    sorted.sort();
                    prop_assert_eq!(order, sorted);
                }
                Op::Publish(i) => {
                    let id = ids[i % ids.len()];
                    let before = log.get(id).unwrap().status;
                    let result = log.mark_published(id, now);
                    prop_assert_eq!(result.is_err(), before == OutboxStatus::DeadLetter);
                }
                Op::Fail(i) => {
                    let id = ids[i % ids.len()];
                    let before = log.get(id).unwrap().clone();
                    match log.mark_failed(id, "broker unavailable") {
                        Ok(_) => prop_assert_eq!(log.get(id).unwrap().retry_count, before.retry_count + 1),
                        Err(_) => prop_assert_ne!(before.status, OutboxStatus::Processing),
                    }
                }
                Op::Release(i) => {
                    let id = ids[i % ids.len()];
                    let before = log.get(id).unwrap().clone();
                    if log.release(id).is_ok() {
                        prop_assert_eq!(log.get(id).unwrap().retry_count, before.retry_count);
                    }
                }
                Op::Reclaim => {
                    log.reclaim_stale(now);
                }
                Op::Requeue(i) => {
                    let id = ids[i % ids.len()];
                    if log.requeue_dead_letter(id).is_ok() {
                        prop_assert_eq!(log.get(id).unwrap().retry_count, 0);
                    }
                }
            }

            for entry in log.entries() {
                prop_assert!(entry.retry_count <= entry.max_retries);
                prop_assert_eq!(
                    entry.status == OutboxStatus::DeadLetter,
                    entry.retry_count >= entry.max_retries
                );
                prop_assert_eq!(entry.status == OutboxStatus::Processing, entry.claimed_at.is_some());
            }
        }
    }

    #[test]
    fn published_entries_are_never_claimed_again(entries in 1..8usize, rounds in 1..5usize) {
        let mut log = log_with(entries);
        let mut now = test_clock().now();
        let mut published = HashSet::new();

        for _ in 0..rounds {
            now += Duration::seconds(1);
            for entry in log.claim_batch(entries, now) {
                prop_assert!(!published.contains(&entry.id));
                log.mark_published(entry.id, now).unwrap();
                published.insert(entry.id);
            }
        }
        prop_assert_eq!(published.len(), entries);
        prop_assert_eq!(log.counts().published, entries as u64);
    }
}
