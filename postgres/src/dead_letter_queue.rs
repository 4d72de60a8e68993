//! Dead-letter operator tooling.
//!
//! An outbox entry that runs out of delivery attempts stays in the `outbox`
//! table with status `dead_letter` and is never retried automatically. This
//! module is what an operator uses to inspect those entries and either requeue
//! them (fresh attempts) or discard them. Every action is written to
//! `outbox_dead_letter_actions` for the audit trail.

use crate::outbox::{row_to_entry, storage, write_state};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tuneshare_core::outbox::{OutboxEntry, OutboxError, OutboxStatus};
use uuid::Uuid;

/// What an operator did with a dead-lettered entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Returned to pending with a fresh retry budget.
    Requeued,
    /// Deleted without delivery.
    Discarded,
}

impl Resolution {
    /// Column value.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Requeued => "requeued",
            Self::Discarded => "discarded",
        }
    }

    /// Parse a column value.
    ///
    /// # Errors
    ///
    /// [`OutboxError::Storage`] for unknown values.
    pub fn parse(s: &str) -> Result<Self, OutboxError> {
        match s {
            "requeued" => Ok(Self::Requeued),
            "discarded" => Ok(Self::Discarded),
            _ => Err(OutboxError::Storage(format!("Invalid dead-letter action: {s}"))),
        }
    }
}

/// One audit row.
#[derive(Debug, Clone)]
pub struct DeadLetterAction {
    /// Row ID.
    pub id: i64,
    /// Outbox entry acted on.
    pub outbox_id: Uuid,
    /// What was done.
    pub resolution: Resolution,
    /// Event type of the entry.
    pub event_type: String,
    /// Last delivery error at the time of the action.
    pub error_message: Option<String>,
    /// Attempts spent before the action.
    pub retry_count: i32,
    /// Who acted.
    pub actor: String,
    /// Operator notes.
    pub notes: Option<String>,
    /// When.
    pub acted_at: DateTime<Utc>,
}

/// Operator view over dead-lettered outbox entries.
///
/// # Example
///
/// ```no_run
/// use tuneshare_postgres::DeadLetterQueue;
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let dlq = DeadLetterQueue::new(pool);
/// for entry in dlq.list(50).await? {
///     println!("{} {} {:?}", entry.id, entry.event.event_type, entry.error_message);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct DeadLetterQueue {
    pool: PgPool,
}

impl DeadLetterQueue {
    /// Queue view over `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Dead-lettered entries, oldest first.
    ///
    /// # Errors
    ///
    /// [`OutboxError::Storage`] if the query fails.
    pub async fn list(&self, limit: usize) -> Result<Vec<OutboxEntry>, OutboxError> {
        #[allow(clippy::cast_possible_wrap)] // Limit is reasonable size, i64 is safe
        let rows = sqlx::query(
            r"
            SELECT id, aggregate_id, aggregate_type, routing_key, event_type, event_data,
                   metadata, status, retry_count, max_retries, error_message, occurred_at,
                   created_at, claimed_at, published_at
            FROM outbox
            WHERE status = 'dead_letter'
            ORDER BY occurred_at ASC, created_at ASC
            LIMIT $1
            ",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        rows.iter().map(row_to_entry).collect()
    }

    /// Number of dead-lettered entries; useful for alerting.
    ///
    /// # Errors
    ///
    /// [`OutboxError::Storage`] if the query fails.
    pub async fn count(&self) -> Result<i64, OutboxError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM outbox WHERE status = 'dead_letter'")
                .fetch_one(&self.pool)
                .await
                .map_err(storage)?;
        Ok(count)
    }

    /// Give an entry a fresh set of delivery attempts.
    ///
    /// # Errors
    ///
    /// [`OutboxError::NotFound`], [`OutboxError::InvalidTransition`] unless the
    /// entry is dead-lettered, or [`OutboxError::Storage`].
    pub async fn requeue(
        &self,
        id: Uuid,
        actor: &str,
        notes: Option<&str>,
    ) -> Result<(), OutboxError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        let mut entry = Self::lock_dead_letter(&mut tx, id).await?;
        let (retry_count, error_message) = (entry.retry_count, entry.error_message.clone());
        entry.requeue()?;
        write_state(&mut tx, &entry).await?;
        Self::record(
            &mut tx,
            &entry,
            Resolution::Requeued,
            retry_count,
            error_message.as_deref(),
            actor,
            notes,
        )
        .await?;
        tx.commit().await.map_err(storage)?;

        tracing::info!(outbox_id = %id, actor = actor, "Dead-lettered entry requeued");
        metrics::counter!("outbox.requeued.total").increment(1);
        Ok(())
    }

    /// Delete an entry that should never be delivered.
    ///
    /// # Errors
    ///
    /// [`OutboxError::NotFound`], [`OutboxError::InvalidTransition`] unless the
    /// entry is dead-lettered, or [`OutboxError::Storage`].
    pub async fn discard(&self, id: Uuid, actor: &str, reason: &str) -> Result<(), OutboxError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        let entry = Self::lock_dead_letter(&mut tx, id).await?;
        Self::record(
            &mut tx,
            &entry,
            Resolution::Discarded,
            entry.retry_count,
            entry.error_message.as_deref(),
            actor,
            Some(reason),
        )
        .await?;
        sqlx::query("DELETE FROM outbox WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        tx.commit().await.map_err(storage)?;

        tracing::warn!(outbox_id = %id, actor = actor, reason = reason, "Dead-lettered entry discarded");
        metrics::counter!("outbox.discarded.total").increment(1);
        Ok(())
    }

    /// Audit trail for one entry, oldest first.
    ///
    /// # Errors
    ///
    /// [`OutboxError::Storage`] if the query fails.
    pub async fn history(&self, outbox_id: Uuid) -> Result<Vec<DeadLetterAction>, OutboxError> {
        let rows = sqlx::query(
            r"
            SELECT id, outbox_id, action, event_type, error_message, retry_count,
                   actor, notes, acted_at
            FROM outbox_dead_letter_actions
            WHERE outbox_id = $1
            ORDER BY acted_at ASC, id ASC
            ",
        )
        .bind(outbox_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        rows.iter().map(Self::row_to_action).collect()
    }

    async fn lock_dead_letter(
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
    ) -> Result<OutboxEntry, OutboxError> {
        let row = sqlx::query(
            r"
            SELECT id, aggregate_id, aggregate_type, routing_key, event_type, event_data,
                   metadata, status, retry_count, max_retries, error_message, occurred_at,
                   created_at, claimed_at, published_at
            FROM outbox
            WHERE id = $1
            FOR UPDATE
            ",
        )
        .bind(id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(storage)?
        .ok_or(OutboxError::NotFound(id))?;

        let entry = row_to_entry(&row)?;
        if entry.status != OutboxStatus::DeadLetter {
            return Err(OutboxError::InvalidTransition {
                id,
                from: entry.status,
                action: "resolve",
            });
        }
        Ok(entry)
    }

    #[allow(clippy::too_many_arguments)]
    async fn record(
        tx: &mut Transaction<'_, Postgres>,
        entry: &OutboxEntry,
        resolution: Resolution,
        retry_count: u32,
        error_message: Option<&str>,
        actor: &str,
        notes: Option<&str>,
    ) -> Result<(), OutboxError> {
        sqlx::query(
            r"
            INSERT INTO outbox_dead_letter_actions (
                outbox_id, action, event_type, error_message, retry_count, actor, notes
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ",
        )
        .bind(entry.id)
        .bind(resolution.as_str())
        .bind(&entry.event.event_type)
        .bind(error_message)
        .bind(i32::try_from(retry_count).unwrap_or(i32::MAX))
        .bind(actor)
        .bind(notes)
        .execute(&mut **tx)
        .await
        .map_err(storage)?;
        Ok(())
    }

    fn row_to_action(row: &PgRow) -> Result<DeadLetterAction, OutboxError> {
        let action: String = row.try_get("action").map_err(storage)?;
        Ok(DeadLetterAction {
            id: row.try_get("id").map_err(storage)?,
            outbox_id: row.try_get("outbox_id").map_err(storage)?,
            resolution: Resolution::parse(&action)?,
            event_type: row.try_get("event_type").map_err(storage)?,
            error_message: row.try_get("error_message").map_err(storage)?,
            retry_count: row.try_get("retry_count").map_err(storage)?,
            actor: row.try_get("actor").map_err(storage)?,
            notes: row.try_get("notes").map_err(storage)?,
            acted_at: row.try_get("acted_at").map_err(storage)?,
        })
    }
}
