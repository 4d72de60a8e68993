//! `PostgreSQL` transactional outbox.
//!
//! Business writes call [`stage_in`] with their own transaction, so the outbox
//! row commits or rolls back with the change it describes. Publishers claim
//! rows with `FOR UPDATE SKIP LOCKED`; concurrent publishers never claim the
//! same row. State changes load the row under a lock and apply the
//! [`OutboxEntry`] lifecycle methods so the rules match the in-memory outbox.

use crate::{to_i64, to_u64};
use chrono::{DateTime, Duration, Utc};
use futures::future::BoxFuture;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use std::str::FromStr;
use tuneshare_core::event::{EventMetadata, SerializedEvent};
use tuneshare_core::outbox::{
    OutboxCounts, OutboxEntry, OutboxError, OutboxStatus, OutboxStore, StagedEvent,
};
use tuneshare_core::stream::AggregateId;
use uuid::Uuid;

const ENTRY_COLUMNS: &str = "id, aggregate_id, aggregate_type, routing_key, event_type, \
     event_data, metadata, status, retry_count, max_retries, error_message, occurred_at, \
     created_at, claimed_at, published_at";

/// Insert staged events as pending outbox rows on `conn`.
///
/// # Errors
///
/// The driver error if an insert fails.
pub async fn stage_in(
    conn: &mut PgConnection,
    staged: Vec<StagedEvent>,
    now: DateTime<Utc>,
) -> Result<Vec<OutboxEntry>, sqlx::Error> {
    let mut entries = Vec::with_capacity(staged.len());
    for staged in staged {
        let entry = OutboxEntry::from_staged(staged, now);
        sqlx::query(
            r"
            INSERT INTO outbox (
                id, aggregate_id, aggregate_type, routing_key, event_type, event_data,
                metadata, status, retry_count, max_retries, occurred_at, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 0, $9, $10, $11)
            ",
        )
        .bind(entry.id)
        .bind(entry.aggregate_id.as_str())
        .bind(&entry.aggregate_type)
        .bind(&entry.routing_key)
        .bind(&entry.event.event_type)
        .bind(&entry.event.data)
        .bind(entry.event.metadata.to_json())
        .bind(entry.status.as_str())
        .bind(i32::try_from(entry.max_retries).unwrap_or(i32::MAX))
        .bind(entry.occurred_at)
        .bind(entry.created_at)
        .execute(&mut *conn)
        .await?;
        entries.push(entry);
    }
    Ok(entries)
}

/// Outbox over the `outbox` table.
#[derive(Clone, Debug)]
pub struct PostgresOutbox {
    pool: PgPool,
}

impl PostgresOutbox {
    /// Outbox over `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Entry by ID.
    ///
    /// # Errors
    ///
    /// [`OutboxError::NotFound`] or [`OutboxError::Storage`].
    pub async fn get(&self, id: Uuid) -> Result<OutboxEntry, OutboxError> {
        let row = sqlx::query(&format!("SELECT {ENTRY_COLUMNS} FROM outbox WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?
            .ok_or(OutboxError::NotFound(id))?;
        row_to_entry(&row)
    }

    /// Lock one row, apply `change` and write the new state back.
    pub(crate) async fn transition<T, F>(&self, id: Uuid, change: F) -> Result<T, OutboxError>
    where
        F: FnOnce(&mut OutboxEntry) -> Result<T, OutboxError> + Send,
        T: Send,
    {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        let row = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM outbox WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage)?
        .ok_or(OutboxError::NotFound(id))?;

        let mut entry = row_to_entry(&row)?;
        let result = change(&mut entry)?;
        write_state(&mut tx, &entry).await?;
        tx.commit().await.map_err(storage)?;
        Ok(result)
    }
}

impl OutboxStore for PostgresOutbox {
    fn stage(&self, staged: StagedEvent) -> BoxFuture<'_, Result<OutboxEntry, OutboxError>> {
        Box::pin(async move {
            let mut conn = self.pool.acquire().await.map_err(storage)?;
            let mut entries = stage_in(&mut conn, vec![staged], Utc::now())
                .await
                .map_err(storage)?;
            entries
                .pop()
                .ok_or_else(|| OutboxError::Storage("staged entry was not returned".into()))
        })
    }

    fn claim_batch(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Vec<OutboxEntry>, OutboxError>> {
        Box::pin(async move {
            let limit = to_i64(limit as u64, "limit").map_err(OutboxError::Storage)?;
            let rows = sqlx::query(&format!(
                r"
                WITH claimable AS (
                    SELECT id FROM outbox
                    WHERE status = 'pending'
                       OR (status = 'failed' AND retry_count < max_retries)
                    ORDER BY occurred_at, created_at
                    LIMIT $1
                    FOR UPDATE SKIP LOCKED
                )
                UPDATE outbox o
                SET status = 'processing', claimed_at = $2
                FROM claimable c
                WHERE o.id = c.id
                RETURNING {}
                ",
                prefixed_columns("o")
            ))
            .bind(limit)
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;

            let mut entries = rows
                .iter()
                .map(row_to_entry)
                .collect::<Result<Vec<_>, _>>()?;
            // RETURNING order is unspecified.
            entries.sort_by_key(|e| (e.occurred_at, e.created_at));
            Ok(entries)
        })
    }

    fn mark_published(&self, id: Uuid, now: DateTime<Utc>) -> BoxFuture<'_, Result<(), OutboxError>> {
        Box::pin(async move { self.transition(id, |entry| entry.mark_published(now)).await })
    }

    fn mark_failed(
        &self,
        id: Uuid,
        error: String,
    ) -> BoxFuture<'_, Result<OutboxStatus, OutboxError>> {
        Box::pin(async move {
            let status = self
                .transition(id, |entry| entry.mark_failed(&error))
                .await?;
            if status == OutboxStatus::DeadLetter {
                tracing::warn!(outbox_id = %id, error = %error, "Outbox entry dead-lettered");
            }
            Ok(status)
        })
    }

    fn release(&self, id: Uuid) -> BoxFuture<'_, Result<(), OutboxError>> {
        Box::pin(async move { self.transition(id, OutboxEntry::release).await })
    }

    fn reclaim_stale(&self, stale_before: DateTime<Utc>) -> BoxFuture<'_, Result<u64, OutboxError>> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE outbox
                SET retry_count = retry_count + 1,
                    status = CASE WHEN retry_count + 1 >= max_retries
                                  THEN 'dead_letter' ELSE 'failed' END,
                    error_message = 'processing claim timed out',
                    claimed_at = NULL
                WHERE status = 'processing' AND claimed_at < $1
                ",
            )
            .bind(stale_before)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
            Ok(result.rows_affected())
        })
    }

    fn cleanup_old_events(
        &self,
        older_than_days: u32,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<u64, OutboxError>> {
        Box::pin(async move {
            let cutoff = now - Duration::days(i64::from(older_than_days));
            let result = sqlx::query(
                "DELETE FROM outbox WHERE status = 'published' AND published_at < $1",
            )
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
            Ok(result.rows_affected())
        })
    }

    fn dead_letters(&self, limit: usize) -> BoxFuture<'_, Result<Vec<OutboxEntry>, OutboxError>> {
        Box::pin(async move {
            let limit = to_i64(limit as u64, "limit").map_err(OutboxError::Storage)?;
            let rows = sqlx::query(&format!(
                r"
                SELECT {ENTRY_COLUMNS} FROM outbox
                WHERE status = 'dead_letter'
                ORDER BY occurred_at, created_at
                LIMIT $1
                "
            ))
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;
            rows.iter().map(row_to_entry).collect()
        })
    }

    fn requeue_dead_letter(&self, id: Uuid) -> BoxFuture<'_, Result<(), OutboxError>> {
        Box::pin(async move {
            self.transition(id, OutboxEntry::requeue).await?;
            metrics::counter!("outbox.requeued.total").increment(1);
            tracing::info!(outbox_id = %id, "Dead-lettered entry requeued");
            Ok(())
        })
    }

    fn counts(&self) -> BoxFuture<'_, Result<OutboxCounts, OutboxError>> {
        Box::pin(async move {
            let rows: Vec<(String, i64)> =
                sqlx::query_as("SELECT status, COUNT(*) FROM outbox GROUP BY status")
                    .fetch_all(&self.pool)
                    .await
                    .map_err(storage)?;
            let mut counts = OutboxCounts::default();
            for (status, n) in rows {
                let n = to_u64(n, "count").map_err(OutboxError::Storage)?;
                counts.add(OutboxStatus::from_str(&status)?, n);
            }
            Ok(counts)
        })
    }
}

pub(crate) async fn write_state(conn: &mut PgConnection, entry: &OutboxEntry) -> Result<(), OutboxError> {
    sqlx::query(
        r"
        UPDATE outbox
        SET status = $2, retry_count = $3, error_message = $4,
            claimed_at = $5, published_at = $6
        WHERE id = $1
        ",
    )
    .bind(entry.id)
    .bind(entry.status.as_str())
    .bind(i32::try_from(entry.retry_count).unwrap_or(i32::MAX))
    .bind(&entry.error_message)
    .bind(entry.claimed_at)
    .bind(entry.published_at)
    .execute(conn)
    .await
    .map_err(storage)?;
    Ok(())
}

fn prefixed_columns(alias: &str) -> String {
    ENTRY_COLUMNS
        .split(", ")
        .map(|c| format!("{alias}.{c}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Decode an `outbox` row.
///
/// # Errors
///
/// [`OutboxError::Storage`] for missing columns or out-of-range values.
pub fn row_to_entry(row: &PgRow) -> Result<OutboxEntry, OutboxError> {
    let status: String = row.try_get("status").map_err(storage)?;
    let retry_count: i32 = row.try_get("retry_count").map_err(storage)?;
    let max_retries: i32 = row.try_get("max_retries").map_err(storage)?;
    let aggregate_id: String = row.try_get("aggregate_id").map_err(storage)?;
    let metadata: serde_json::Value = row.try_get("metadata").map_err(storage)?;
    Ok(OutboxEntry {
        id: row.try_get("id").map_err(storage)?,
        aggregate_id: AggregateId::new(aggregate_id),
        aggregate_type: row.try_get("aggregate_type").map_err(storage)?,
        routing_key: row.try_get("routing_key").map_err(storage)?,
        event: SerializedEvent::new(
            row.try_get("event_type").map_err(storage)?,
            row.try_get("event_data").map_err(storage)?,
            EventMetadata::from_json(&metadata),
        ),
        status: OutboxStatus::from_str(&status)?,
        retry_count: u32::try_from(retry_count)
            .map_err(|_| OutboxError::Storage(format!("negative retry_count {retry_count}")))?,
        max_retries: u32::try_from(max_retries)
            .map_err(|_| OutboxError::Storage(format!("negative max_retries {max_retries}")))?,
        error_message: row.try_get("error_message").map_err(storage)?,
        occurred_at: row.try_get("occurred_at").map_err(storage)?,
        created_at: row.try_get("created_at").map_err(storage)?,
        claimed_at: row.try_get("claimed_at").map_err(storage)?,
        published_at: row.try_get("published_at").map_err(storage)?,
    })
}

#[allow(clippy::needless_pass_by_value)] // Used as a map_err adapter
pub(crate) fn storage(e: sqlx::Error) -> OutboxError {
    OutboxError::Storage(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_returns_every_entry_column() {
        let columns = prefixed_columns("o");
        assert!(columns.starts_with("o.id, o.aggregate_id"));
        assert_eq!(columns.matches("o.").count(), ENTRY_COLUMNS.split(", ").count());
    }
}
