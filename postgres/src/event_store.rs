//! `PostgreSQL` event store.
//!
//! Events live in the `events` table, one row per event. The unique
//! `(aggregate_id, version)` constraint backs the optimistic concurrency check:
//! two writers that both read version `n` race on inserting `n + 1` and the
//! loser gets a [`EventStoreError::ConcurrencyConflict`].

use crate::{is_unique_violation, to_i64, to_u64};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::future::BoxFuture;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tuneshare_core::event::{EventMetadata, RecordedEvent, SerializedEvent};
use tuneshare_core::event_store::{
    AppendBatch, EventStore, EventStoreError, EventStream, Snapshot,
};
use tuneshare_core::stream::{AggregateId, Version};
use uuid::Uuid;

/// Rows fetched per round trip when streaming an aggregate's history.
const READ_PAGE_SIZE: i64 = 500;

/// Event store backed by the `events` and `snapshots` tables.
#[derive(Clone, Debug)]
pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    /// Event store over an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and build an event store.
    ///
    /// # Errors
    ///
    /// [`EventStoreError::DatabaseError`] if the connection fails.
    pub async fn new(database_url: &str) -> Result<Self, EventStoreError> {
        let pool = PgPool::connect(database_url).await.map_err(db_error)?;
        Ok(Self { pool })
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn version_in(
        tx: &mut Transaction<'_, Postgres>,
        aggregate_id: &AggregateId,
    ) -> Result<Version, EventStoreError> {
        let (max,): (Option<i64>,) =
            sqlx::query_as("SELECT MAX(version) FROM events WHERE aggregate_id = $1")
                .bind(aggregate_id.as_str())
                .fetch_one(&mut **tx)
                .await
                .map_err(db_error)?;
        let version = to_u64(max.unwrap_or(0), "version").map_err(EventStoreError::DatabaseError)?;
        Ok(Version::new(version))
    }

    async fn append_in_tx(&self, batch: AppendBatch) -> Result<Vec<RecordedEvent>, EventStoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let actual = Self::version_in(&mut tx, &batch.aggregate_id).await?;
        if actual != batch.expected_version {
            return Err(conflict(&batch, actual));
        }

        let mut recorded = Vec::with_capacity(batch.events.len());
        let mut version = actual;
        for event in &batch.events {
            version = version.next();
            let event_id = Uuid::new_v4();
            let inserted = sqlx::query(
                r"
                INSERT INTO events (
                    event_id, aggregate_id, aggregate_type, version,
                    event_type, event_data, metadata, occurred_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ",
            )
            .bind(event_id)
            .bind(batch.aggregate_id.as_str())
            .bind(&batch.aggregate_type)
            .bind(to_i64(version.value(), "version").map_err(EventStoreError::DatabaseError)?)
            .bind(&event.event_type)
            .bind(&event.data)
            .bind(event.metadata.to_json())
            .bind(batch.occurred_at)
            .execute(&mut *tx)
            .await;

            if let Err(e) = inserted {
                if is_unique_violation(&e) {
                    drop(tx);
                    let actual = self.current_version(batch.aggregate_id.clone()).await?;
                    return Err(conflict(&batch, actual));
                }
                return Err(db_error(e));
            }

            recorded.push(RecordedEvent {
                event_id,
                aggregate_id: batch.aggregate_id.clone(),
                aggregate_type: batch.aggregate_type.clone(),
                version,
                event: event.clone(),
                occurred_at: batch.occurred_at,
            });
        }

        tx.commit().await.map_err(db_error)?;
        Ok(recorded)
    }
}

impl EventStore for PostgresEventStore {
    fn append(
        &self,
        batch: AppendBatch,
    ) -> BoxFuture<'_, Result<Vec<RecordedEvent>, EventStoreError>> {
        Box::pin(async move {
            let aggregate_type = batch.aggregate_type.clone();
            let aggregate_id = batch.aggregate_id.clone();
            match self.append_in_tx(batch).await {
                Ok(recorded) => {
                    metrics::counter!("event_store.appended.total", "aggregate_type" => aggregate_type)
                        .increment(recorded.len() as u64);
                    if let Some(last) = recorded.last() {
                        tracing::debug!(
                            aggregate_id = %aggregate_id,
                            version = %last.version,
                            count = recorded.len(),
                            "Events appended"
                        );
                    }
                    Ok(recorded)
                }
                Err(e @ EventStoreError::ConcurrencyConflict { .. }) => {
                    metrics::counter!("event_store.conflicts.total", "aggregate_type" => aggregate_type)
                        .increment(1);
                    tracing::warn!(aggregate_id = %aggregate_id, error = %e, "Append rejected");
                    Err(e)
                }
                Err(e) => Err(e),
            }
        })
    }

    fn read(&self, aggregate_id: AggregateId, after: Version) -> EventStream<'_> {
        let pool = self.pool.clone();
        async_stream::try_stream! {
            let mut cursor = to_i64(after.value(), "version").map_err(EventStoreError::DatabaseError)?;
            loop {
                let rows = sqlx::query(
                    r"
                    SELECT event_id, aggregate_id, aggregate_type, version,
                           event_type, event_data, metadata, occurred_at
                    FROM events
                    WHERE aggregate_id = $1 AND version > $2
                    ORDER BY version ASC
                    LIMIT $3
                    ",
                )
                .bind(aggregate_id.as_str())
                .bind(cursor)
                .bind(READ_PAGE_SIZE)
                .fetch_all(&pool)
                .await
                .map_err(db_error)?;

                let page_len = rows.len();
                for row in rows {
                    let event = row_to_event(&row)?;
                    cursor = to_i64(event.version.value(), "version").map_err(EventStoreError::DatabaseError)?;
                    yield event;
                }
                if i64::try_from(page_len).unwrap_or(i64::MAX) < READ_PAGE_SIZE {
                    break;
                }
            }
        }
        .boxed()
    }

    fn current_version(
        &self,
        aggregate_id: AggregateId,
    ) -> BoxFuture<'_, Result<Version, EventStoreError>> {
        Box::pin(async move {
            let (max,): (Option<i64>,) =
                sqlx::query_as("SELECT MAX(version) FROM events WHERE aggregate_id = $1")
                    .bind(aggregate_id.as_str())
                    .fetch_one(&self.pool)
                    .await
                    .map_err(db_error)?;
            let version =
                to_u64(max.unwrap_or(0), "version").map_err(EventStoreError::DatabaseError)?;
            Ok(Version::new(version))
        })
    }

    fn save_snapshot(&self, snapshot: Snapshot) -> BoxFuture<'_, Result<(), EventStoreError>> {
        Box::pin(async move {
            // An older snapshot never replaces a newer one.
            sqlx::query(
                r"
                INSERT INTO snapshots (aggregate_id, aggregate_type, version, state_data, taken_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (aggregate_id) DO UPDATE
                SET aggregate_type = EXCLUDED.aggregate_type,
                    version = EXCLUDED.version,
                    state_data = EXCLUDED.state_data,
                    taken_at = EXCLUDED.taken_at
                WHERE snapshots.version <= EXCLUDED.version
                ",
            )
            .bind(snapshot.aggregate_id.as_str())
            .bind(&snapshot.aggregate_type)
            .bind(to_i64(snapshot.version.value(), "version").map_err(EventStoreError::DatabaseError)?)
            .bind(&snapshot.state)
            .bind(snapshot.taken_at)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

            tracing::debug!(
                aggregate_id = %snapshot.aggregate_id,
                version = %snapshot.version,
                "Snapshot saved"
            );
            Ok(())
        })
    }

    fn load_snapshot(
        &self,
        aggregate_id: AggregateId,
    ) -> BoxFuture<'_, Result<Option<Snapshot>, EventStoreError>> {
        Box::pin(async move {
            let row = sqlx::query(
                r"
                SELECT aggregate_type, version, state_data, taken_at
                FROM snapshots
                WHERE aggregate_id = $1
                ",
            )
            .bind(aggregate_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

            let Some(row) = row else {
                return Ok(None);
            };
            let version: i64 = row.try_get("version").map_err(db_error)?;
            Ok(Some(Snapshot {
                aggregate_id,
                aggregate_type: row.try_get("aggregate_type").map_err(db_error)?,
                version: Version::new(
                    to_u64(version, "version").map_err(EventStoreError::DatabaseError)?,
                ),
                state: row.try_get("state_data").map_err(db_error)?,
                taken_at: row.try_get("taken_at").map_err(db_error)?,
            }))
        })
    }
}

fn row_to_event(row: &PgRow) -> Result<RecordedEvent, EventStoreError> {
    let version: i64 = row.try_get("version").map_err(db_error)?;
    let aggregate_id: String = row.try_get("aggregate_id").map_err(db_error)?;
    let metadata: serde_json::Value = row.try_get("metadata").map_err(db_error)?;
    let occurred_at: DateTime<Utc> = row.try_get("occurred_at").map_err(db_error)?;
    Ok(RecordedEvent {
        event_id: row.try_get("event_id").map_err(db_error)?,
        aggregate_id: AggregateId::new(aggregate_id),
        aggregate_type: row.try_get("aggregate_type").map_err(db_error)?,
        version: Version::new(to_u64(version, "version").map_err(EventStoreError::DatabaseError)?),
        event: SerializedEvent::new(
            row.try_get("event_type").map_err(db_error)?,
            row.try_get("event_data").map_err(db_error)?,
            EventMetadata::from_json(&metadata),
        ),
        occurred_at,
    })
}

fn conflict(batch: &AppendBatch, actual: Version) -> EventStoreError {
    EventStoreError::ConcurrencyConflict {
        aggregate_id: batch.aggregate_id.clone(),
        expected: batch.expected_version,
        actual,
    }
}

#[allow(clippy::needless_pass_by_value)] // Used as a map_err adapter
fn db_error(e: sqlx::Error) -> EventStoreError {
    EventStoreError::DatabaseError(e.to_string())
}
