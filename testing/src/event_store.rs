//! `HashMap`-backed event store.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap on lock poisoning

use futures::StreamExt;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tuneshare_core::event::RecordedEvent;
use tuneshare_core::event_store::{
    AppendBatch, EventStore, EventStoreError, EventStream, Snapshot,
};
use tuneshare_core::stream::{AggregateId, Version};
use uuid::Uuid;

#[derive(Debug, Default)]
struct Streams {
    events: HashMap<AggregateId, Vec<RecordedEvent>>,
    snapshots: HashMap<AggregateId, Snapshot>,
}

/// Event store held in memory. Clones share the same data.
///
/// Appends take a write lock for the whole version check and insert, so two
/// concurrent appends with the same expected version cannot both succeed.
#[derive(Clone, Debug, Default)]
pub struct InMemoryEventStore {
    streams: Arc<RwLock<Streams>>,
}

impl InMemoryEventStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of events stored for an aggregate.
    #[must_use]
    pub fn event_count(&self, aggregate_id: &AggregateId) -> usize {
        self.streams
            .read()
            .unwrap()
            .events
            .get(aggregate_id)
            .map_or(0, Vec::len)
    }

    /// Total number of events across all aggregates.
    #[must_use]
    pub fn total_events(&self) -> usize {
        self.streams.read().unwrap().events.values().map(Vec::len).sum()
    }
}

impl EventStore for InMemoryEventStore {
    fn append(
        &self,
        batch: AppendBatch,
    ) -> BoxFuture<'_, Result<Vec<RecordedEvent>, EventStoreError>> {
        Box::pin(async move {
            let mut streams = self.streams.write().unwrap();
            let stream = streams
                .events
                .entry(batch.aggregate_id.clone())
                .or_default();
            let actual = Version::new(stream.len() as u64);
            if actual != batch.expected_version {
                return Err(EventStoreError::ConcurrencyConflict {
                    aggregate_id: batch.aggregate_id,
                    expected: batch.expected_version,
                    actual,
                });
            }

            let mut version = actual;
            let recorded: Vec<RecordedEvent> = batch
                .events
                .into_iter()
                .map(|event| {
                    version = version.next();
                    RecordedEvent {
                        event_id: Uuid::new_v4(),
                        aggregate_id: batch.aggregate_id.clone(),
                        aggregate_type: batch.aggregate_type.clone(),
                        version,
                        event,
                        occurred_at: batch.occurred_at,
                    }
                })
                .collect();
            stream.extend(recorded.iter().cloned());
            Ok(recorded)
        })
    }

    fn read(&self, aggregate_id: AggregateId, after: Version) -> EventStream<'_> {
        let events: Vec<RecordedEvent> = self
            .streams
            .read()
            .unwrap()
            .events
            .get(&aggregate_id)
            .map(|stream| {
                stream
                    .iter()
                    .filter(|e| e.version > after)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        futures::stream::iter(events.into_iter().map(Ok)).boxed()
    }

    fn current_version(
        &self,
        aggregate_id: AggregateId,
    ) -> BoxFuture<'_, Result<Version, EventStoreError>> {
        Box::pin(async move { Ok(Version::new(self.event_count(&aggregate_id) as u64)) })
    }

    fn save_snapshot(&self, snapshot: Snapshot) -> BoxFuture<'_, Result<(), EventStoreError>> {
        Box::pin(async move {
            let mut streams = self.streams.write().unwrap();
            let newer_exists = streams
                .snapshots
                .get(&snapshot.aggregate_id)
                .is_some_and(|existing| existing.version > snapshot.version);
            if !newer_exists {
                streams
                    .snapshots
                    .insert(snapshot.aggregate_id.clone(), snapshot);
            }
            Ok(())
        })
    }

    fn load_snapshot(
        &self,
        aggregate_id: AggregateId,
    ) -> BoxFuture<'_, Result<Option<Snapshot>, EventStoreError>> {
        Box::pin(async move {
            Ok(self
                .streams
                .read()
                .unwrap()
                .snapshots
                .get(&aggregate_id)
                .cloned())
        })
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use serde::{Deserialize, Serialize};
    use tuneshare_core::aggregate::{Aggregate, load_aggregate, snapshot_aggregate};
    use tuneshare_core::event::{Event, EventMetadata, SerializedEvent};

    #[derive(Clone, Debug, Serialize, Deserialize)]
    struct Played {
        seconds: u64,
    }

    impl Event for Played {
        fn event_type(&self) -> &'static str {
            "Played.v1"
        }
    }

    #[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Listening {
        seconds: u64,
        plays: u32,
    }

    impl Aggregate for Listening {
        type Event = Played;
        const AGGREGATE_TYPE: &'static str = "listening";

        fn apply(mut self, event: &Played) -> Self {
            self.seconds += event.seconds;
            self.plays += 1;
            self
        }
    }

    fn played(seconds: u64) -> SerializedEvent {
        SerializedEvent::from_event(&Played { seconds }, EventMetadata::default())
            .expect("encode")
    }

    fn batch(id: &AggregateId, expected: u64, events: Vec<SerializedEvent>) -> AppendBatch {
        AppendBatch::new(id.clone(), "listening", Version::new(expected), events)
    }

    #[tokio::test]
    async fn append_assigns_consecutive_versions() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new("listening-1");

        let first = store
            .append(batch(&id, 0, vec![played(10), played(20)]))
            .await
            .expect("first append");
        let second = store
            .append(batch(&id, 2, vec![played(5)]))
            .await
            .expect("second append");

        let versions: Vec<u64> = first
            .iter()
            .chain(second.iter())
            .map(|e| e.version.value())
            .collect();
        assert_eq!(versions, vec![1, 2, 3]);
        assert_eq!(
            store.current_version(id).await.expect("version"),
            Version::new(3)
        );
    }

    #[tokio::test]
    async fn stale_expected_version_conflicts_without_writing() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new("listening-1");
        store
            .append(batch(&id, 0, vec![played(10)]))
            .await
            .expect("append");

        let err = store
            .append(batch(&id, 0, vec![played(99)]))
            .await
            .expect_err("should conflict");
        assert!(matches!(
            err,
            EventStoreError::ConcurrencyConflict { expected, actual, .. }
                if expected == Version::INITIAL && actual == Version::new(1)
        ));
        assert_eq!(store.event_count(&id), 1);
    }

    #[tokio::test]
    async fn concurrent_appends_at_same_version_admit_one_winner() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new("listening-race");

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                let id = id.clone();
                tokio::spawn(async move { store.append(batch(&id, 0, vec![played(i)])).await })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.expect("join").is_ok() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(store.event_count(&id), 1);
    }

    #[tokio::test]
    async fn read_returns_only_later_versions() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new("listening-1");
        store
            .append(batch(&id, 0, vec![played(1), played(2), played(3)]))
            .await
            .expect("append");

        let tail: Vec<RecordedEvent> = store
            .read(id.clone(), Version::new(1))
            .try_collect()
            .await
            .expect("read");
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].version, Version::new(2));

        let unknown: Vec<RecordedEvent> = store
            .read(AggregateId::new("nobody"), Version::INITIAL)
            .try_collect()
            .await
            .expect("read");
        assert!(unknown.is_empty());
    }

    #[tokio::test]
    async fn load_aggregate_uses_snapshot_then_tail() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new("listening-1");
        store
            .append(batch(&id, 0, vec![played(10), played(20)]))
            .await
            .expect("append");

        let loaded = load_aggregate::<Listening>(&store, &id)
            .await
            .expect("load");
        snapshot_aggregate(&store, &id, &loaded, chrono::Utc::now())
            .await
            .expect("snapshot");

        store
            .append(batch(&id, 2, vec![played(5)]))
            .await
            .expect("append");

        let reloaded = load_aggregate::<Listening>(&store, &id)
            .await
            .expect("load");
        assert_eq!(reloaded.version, Version::new(3));
        assert_eq!(
            reloaded.state,
            Listening {
                seconds: 35,
                plays: 3
            }
        );
    }

    #[tokio::test]
    async fn older_snapshot_does_not_replace_newer() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new("listening-1");
        let snap = |version: u64| Snapshot {
            aggregate_id: id.clone(),
            aggregate_type: "listening".into(),
            version: Version::new(version),
            state: vec![],
            taken_at: chrono::Utc::now(),
        };

        store.save_snapshot(snap(5)).await.expect("save");
        store.save_snapshot(snap(3)).await.expect("save");

        let kept = store.load_snapshot(id.clone()).await.expect("load");
        assert_eq!(kept.map(|s| s.version), Some(Version::new(5)));
    }
}
