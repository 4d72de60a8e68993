//! Append-only event storage with optimistic concurrency.
//!
//! The event store is the source of truth for event-sourced aggregates such as
//! listen sessions. It offers exactly three things:
//!
//! - append a batch of events to one aggregate, guarded by the expected version
//! - read an aggregate's events back, lazily and in version order
//! - keep an optional snapshot per aggregate so replay can start part way
//!
//! # Implementations
//!
//! - `PostgresEventStore` (in `tuneshare-postgres`): production storage
//! - `InMemoryEventStore` (in `tuneshare-testing`): deterministic tests
//!
//! # Example
//!
//! ```no_run
//! use futures::TryStreamExt;
//! use tuneshare_core::event_store::{AppendBatch, EventStore, EventStoreError};
//! use tuneshare_core::stream::{AggregateId, Version};
//!
//! async fn example(store: &dyn EventStore) -> Result<(), EventStoreError> {
//!     let id = AggregateId::new("session-1");
//!     let batch = AppendBatch::new(id.clone(), "listen_session", Version::INITIAL, vec![]);
//!     store.append(batch).await?;
//!
//!     let history: Vec<_> = store.read(id, Version::INITIAL).try_collect().await?;
//!     println!("{} events", history.len());
//!     Ok(())
//! }
//! ```

use crate::event::{RecordedEvent, SerializedEvent};
use crate::stream::{AggregateId, Version};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use thiserror::Error;

/// Errors that can occur during event store operations.
#[derive(Error, Debug)]
pub enum EventStoreError {
    /// The aggregate moved on since the caller loaded it.
    ///
    /// Nothing was written. The caller should reload and retry or give up.
    #[error("Concurrency conflict on {aggregate_id}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        /// Aggregate where the conflict occurred.
        aggregate_id: AggregateId,
        /// Version the caller expected.
        expected: Version,
        /// Version actually stored.
        actual: Version,
    },

    /// Database connection or query failure.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Event or snapshot payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl EventStoreError {
    /// Whether retrying the same call may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::DatabaseError(_))
    }
}

/// Lazy, replayable stream of recorded events.
pub type EventStream<'a> = BoxStream<'a, Result<RecordedEvent, EventStoreError>>;

/// Events to append to a single aggregate in one atomic write.
#[derive(Clone, Debug)]
pub struct AppendBatch {
    /// Target aggregate.
    pub aggregate_id: AggregateId,
    /// Aggregate kind, stored alongside every event.
    pub aggregate_type: String,
    /// Version the caller believes the aggregate is at.
    pub expected_version: Version,
    /// Events to append, in order.
    pub events: Vec<SerializedEvent>,
    /// Timestamp recorded on every appended event.
    pub occurred_at: DateTime<Utc>,
}

impl AppendBatch {
    /// Batch stamped with the current wall-clock time.
    #[must_use]
    pub fn new(
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        expected_version: Version,
        events: Vec<SerializedEvent>,
    ) -> Self {
        Self {
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            expected_version,
            events,
            occurred_at: Utc::now(),
        }
    }

    /// Override the recorded timestamp (clock-driven callers, tests).
    #[must_use]
    pub const fn at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }
}

/// Stored state of an aggregate at a given version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    /// Aggregate the snapshot belongs to.
    pub aggregate_id: AggregateId,
    /// Aggregate kind.
    pub aggregate_type: String,
    /// Last event version folded into `state`.
    pub version: Version,
    /// Bincode-encoded aggregate state.
    pub state: Vec<u8>,
    /// When the snapshot was taken.
    pub taken_at: DateTime<Utc>,
}

/// Event store abstraction.
///
/// Methods return boxed futures rather than `async fn` so the trait stays
/// dyn-compatible and services can hold an `Arc<dyn EventStore>`.
pub trait EventStore: Send + Sync {
    /// Append `batch.events` to `batch.aggregate_id`.
    ///
    /// Succeeds only if the aggregate's current version equals
    /// `batch.expected_version`; the appended events receive consecutive
    /// versions after it. All events are written or none are.
    ///
    /// # Errors
    ///
    /// - [`EventStoreError::ConcurrencyConflict`] on version mismatch
    /// - [`EventStoreError::DatabaseError`] on storage failure
    fn append(
        &self,
        batch: AppendBatch,
    ) -> BoxFuture<'_, Result<Vec<RecordedEvent>, EventStoreError>>;

    /// Stream the aggregate's events with version greater than `after`, in
    /// version order. Unknown aggregates yield an empty stream.
    ///
    /// The stream is lazy; implementations page through storage as it is polled.
    fn read(&self, aggregate_id: AggregateId, after: Version) -> EventStream<'_>;

    /// Current version of the aggregate (`Version::INITIAL` when unknown).
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::DatabaseError`] on storage failure.
    fn current_version(
        &self,
        aggregate_id: AggregateId,
    ) -> BoxFuture<'_, Result<Version, EventStoreError>>;

    /// Store a snapshot, replacing any older one for the aggregate.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::DatabaseError`] on storage failure.
    fn save_snapshot(&self, snapshot: Snapshot) -> BoxFuture<'_, Result<(), EventStoreError>>;

    /// Latest snapshot for the aggregate, if any.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::DatabaseError`] on storage failure.
    fn load_snapshot(
        &self,
        aggregate_id: AggregateId,
    ) -> BoxFuture<'_, Result<Option<Snapshot>, EventStoreError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_database_errors_are_transient() {
        assert!(EventStoreError::DatabaseError("timeout".into()).is_transient());
        assert!(!EventStoreError::SerializationError("bad".into()).is_transient());
        assert!(
            !EventStoreError::ConcurrencyConflict {
                aggregate_id: AggregateId::new("a"),
                expected: Version::new(1),
                actual: Version::new(2),
            }
            .is_transient()
        );
    }

    #[test]
    fn conflict_message_names_versions() {
        let err = EventStoreError::ConcurrencyConflict {
            aggregate_id: AggregateId::new("session-1"),
            expected: Version::new(1),
            actual: Version::new(3),
        };
        assert_eq!(
            err.to_string(),
            "Concurrency conflict on session-1: expected version 1, found 3"
        );
    }

    #[test]
    fn batch_timestamp_override() {
        let at = DateTime::<Utc>::UNIX_EPOCH;
        let batch = AppendBatch::new(AggregateId::new("x"), "t", Version::INITIAL, vec![]).at(at);
        assert_eq!(batch.occurred_at, at);
        assert_eq!(batch.aggregate_type, "t");
    }
}
