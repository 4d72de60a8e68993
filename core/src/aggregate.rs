//! Rebuilding aggregate state from its event history.
//!
//! An [`Aggregate`] is a fold: `apply` takes the current state and one event and
//! returns the next state, with no I/O. [`load_aggregate`] reads the latest
//! snapshot (if any), streams the remaining events from the store and folds them.

use crate::event::Event;
use crate::event_store::{EventStore, EventStoreError, Snapshot};
use crate::stream::{AggregateId, Version};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::{Serialize, de::DeserializeOwned};

/// State rebuilt by folding events.
pub trait Aggregate: Default + Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    /// Events this aggregate is built from.
    type Event: Event + Serialize + DeserializeOwned + Clone;

    /// Aggregate kind stored with every event.
    const AGGREGATE_TYPE: &'static str;

    /// Fold one event into the state. Must be pure.
    #[must_use]
    fn apply(self, event: &Self::Event) -> Self;
}

/// Aggregate state together with the version it reflects.
#[derive(Clone, Debug, PartialEq)]
pub struct Loaded<A> {
    /// Folded state.
    pub state: A,
    /// Version of the last event folded in.
    pub version: Version,
}

impl<A> Loaded<A> {
    /// Whether no events exist for the aggregate.
    #[must_use]
    pub const fn is_new(&self) -> bool {
        self.version.is_initial()
    }
}

/// Fold a sequence of events from the default state.
pub fn replay<'e, A>(events: impl IntoIterator<Item = &'e A::Event>) -> A
where
    A: Aggregate,
{
    events.into_iter().fold(A::default(), |state, event| state.apply(event))
}

/// Load an aggregate from its snapshot plus the events recorded after it.
///
/// # Errors
///
/// Propagates store failures; undecodable snapshots or events are reported as
/// [`EventStoreError::SerializationError`].
pub async fn load_aggregate<A: Aggregate>(
    store: &dyn EventStore,
    aggregate_id: &AggregateId,
) -> Result<Loaded<A>, EventStoreError> {
    let (mut state, mut version) = match store.load_snapshot(aggregate_id.clone()).await? {
        Some(snapshot) => {
            let state: A = bincode::deserialize(&snapshot.state)
                .map_err(|e| EventStoreError::SerializationError(e.to_string()))?;
            (state, snapshot.version)
        }
        None => (A::default(), Version::INITIAL),
    };

    let mut events = store.read(aggregate_id.clone(), version);
    while let Some(recorded) = events.try_next().await? {
        let event: A::Event = recorded
            .event
            .decode()
            .map_err(|e| EventStoreError::SerializationError(e.to_string()))?;
        state = state.apply(&event);
        version = recorded.version;
    }

    Ok(Loaded { state, version })
}

/// Persist a snapshot of already-loaded state.
///
/// # Errors
///
/// Returns [`EventStoreError::SerializationError`] if the state cannot be encoded,
/// or the store's error if saving fails.
pub async fn snapshot_aggregate<A: Aggregate>(
    store: &dyn EventStore,
    aggregate_id: &AggregateId,
    loaded: &Loaded<A>,
    taken_at: DateTime<Utc>,
) -> Result<(), EventStoreError> {
    let state = bincode::serialize(&loaded.state)
        .map_err(|e| EventStoreError::SerializationError(e.to_string()))?;
    store
        .save_snapshot(Snapshot {
            aggregate_id: aggregate_id.clone(),
            aggregate_type: A::AGGREGATE_TYPE.to_string(),
            version: loaded.version,
            state,
            taken_at,
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Clone, Debug, Serialize, Deserialize)]
    enum MeterEvent {
        Added(u64),
        Reset,
    }

    impl Event for MeterEvent {
        fn event_type(&self) -> &'static str {
            match self {
                Self::Added(_) => "MeterAdded.v1",
                Self::Reset => "MeterReset.v1",
            }
        }
    }

    #[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Meter {
        total: u64,
        resets: u32,
    }

    impl Aggregate for Meter {
        type Event = MeterEvent;
        const AGGREGATE_TYPE: &'static str = "meter";

        fn apply(mut self, event: &MeterEvent) -> Self {
            match event {
                MeterEvent::Added(n) => self.total += n,
                MeterEvent::Reset => {
                    self.total = 0;
                    self.resets += 1;
                }
            }
            self
        }
    }

    #[test]
    fn replay_folds_in_order() {
        let events = [
            MeterEvent::Added(3),
            MeterEvent::Reset,
            MeterEvent::Added(4),
            MeterEvent::Added(1),
        ];
        let meter: Meter = replay(events.iter());
        assert_eq!(meter, Meter { total: 5, resets: 1 });
    }

    #[test]
    fn replay_of_nothing_is_default() {
        let meter: Meter = replay(std::iter::empty());
        assert_eq!(meter, Meter::default());
    }

    #[test]
    fn loaded_reports_new() {
        let loaded = Loaded {
            state: Meter::default(),
            version: Version::INITIAL,
        };
        assert!(loaded.is_new());
    }

    fn event() -> impl proptest::strategy::Strategy<Value = MeterEvent> {
        use proptest::prelude::*;
        prop_oneof![(0u64..1_000).prop_map(MeterEvent::Added), Just(MeterEvent::Reset)]
    }

    proptest::proptest! {
        #[test]
        fn snapshot_plus_tail_matches_full_replay(
            events in proptest::collection::vec(event(), 0..50),
            split in 0usize..50,
        ) {
            let split = split.min(events.len());
            let full: Meter = replay(events.iter());
            let snapshot: Meter = replay(events[..split].iter());
            let resumed = events[split..].iter().fold(snapshot, Meter::apply);
            proptest::prop_assert_eq!(resumed, full);
        }
    }
}
