use super::{PostgresLedgerStore, column, db, from_document, stage, to_document};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use sqlx::{PgConnection, Row};
use tuneshare_core::event::EventMetadata;
use tuneshare_core::outbox::StagedEvent;
use tuneshare_ledger::LedgerError;
use tuneshare_ledger::distribution::service::stage_settlement;
use tuneshare_ledger::distribution::{Distribution, DistributionStatus};
use tuneshare_ledger::payments::orchestrator::stage_payment_events;
use tuneshare_ledger::payments::{
    BatchItem, BatchStatus, ItemOutcome, PaymentBatch, PaymentBatchStore, Recorded,
};
use tuneshare_ledger::types::{BatchId, DistributionId, PaymentId};
use uuid::Uuid;

type Result<T> = std::result::Result<T, LedgerError>;

/// Batch document without its items; items live in `payment_batch_items`.
fn batch_document(batch: &PaymentBatch) -> Result<serde_json::Value> {
    let mut document = to_document(batch)?;
    if let serde_json::Value::Object(fields) = &mut document {
        fields.remove("items");
    }
    Ok(document)
}

pub(super) async fn insert_batch_rows(
    conn: &mut PgConnection,
    batch: &PaymentBatch,
) -> Result<()> {
    sqlx::query(
        r"
        INSERT INTO payment_batches (
            id, batch_type, currency, distribution_id, status, document, created_at, settled_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ",
    )
    .bind(batch.id.as_uuid())
    .bind(batch.batch_type.as_str())
    .bind(batch.currency.code())
    .bind(batch.distribution_id.map(|d| *d.as_uuid()))
    .bind(batch.status.as_str())
    .bind(batch_document(batch)?)
    .bind(batch.created_at)
    .bind(batch.settled_at)
    .execute(&mut *conn)
    .await
    .map_err(db)?;

    for (position, item) in batch.items.iter().enumerate() {
        sqlx::query(
            r"
            INSERT INTO payment_batch_items (batch_id, payment_id, position, status, amount, item)
            VALUES ($1, $2, $3, $4, $5, $6)
            ",
        )
        .bind(batch.id.as_uuid())
        .bind(item.payment_id.as_uuid())
        .bind(
            i32::try_from(position)
                .map_err(|_| LedgerError::Storage("payment batch too large".into()))?,
        )
        .bind(item.status.as_str())
        .bind(column(item.amount.cents(), "amount")?)
        .bind(to_document(item)?)
        .execute(&mut *conn)
        .await
        .map_err(db)?;
    }
    Ok(())
}

async fn fetch_batch(
    conn: &mut PgConnection,
    batch_id: BatchId,
    lock: bool,
) -> Result<PaymentBatch> {
    let sql = format!(
        "SELECT document FROM payment_batches WHERE id = $1{}",
        if lock { " FOR UPDATE" } else { "" }
    );
    let row = sqlx::query(&sql)
        .bind(batch_id.as_uuid())
        .fetch_optional(&mut *conn)
        .await
        .map_err(db)?
        .ok_or_else(|| LedgerError::not_found("payment batch", batch_id))?;
    let mut document: serde_json::Value = row.try_get("document").map_err(db)?;

    let items: Vec<serde_json::Value> = sqlx::query_scalar(
        "SELECT item FROM payment_batch_items WHERE batch_id = $1 ORDER BY position",
    )
    .bind(batch_id.as_uuid())
    .fetch_all(&mut *conn)
    .await
    .map_err(db)?;

    if let serde_json::Value::Object(fields) = &mut document {
        fields.insert("items".into(), serde_json::Value::Array(items));
    }
    from_document(document)
}

/// Write back the batch row and every item whose state changed.
async fn save_batch(
    conn: &mut PgConnection,
    before: &PaymentBatch,
    after: &PaymentBatch,
) -> Result<()> {
    sqlx::query(
        "UPDATE payment_batches SET status = $2, document = $3, settled_at = $4 WHERE id = $1",
    )
    .bind(after.id.as_uuid())
    .bind(after.status.as_str())
    .bind(batch_document(after)?)
    .bind(after.settled_at)
    .execute(&mut *conn)
    .await
    .map_err(db)?;

    let changed = after
        .items
        .iter()
        .filter(|item| !before.items.contains(item));
    for item in changed {
        update_item(conn, after.id, item).await?;
    }
    Ok(())
}

async fn update_item(conn: &mut PgConnection, batch_id: BatchId, item: &BatchItem) -> Result<()> {
    sqlx::query(
        r"
        UPDATE payment_batch_items
        SET status = $3, item = $4
        WHERE batch_id = $1 AND payment_id = $2
        ",
    )
    .bind(batch_id.as_uuid())
    .bind(item.payment_id.as_uuid())
    .bind(item.status.as_str())
    .bind(to_document(item)?)
    .execute(&mut *conn)
    .await
    .map_err(db)?;
    Ok(())
}

pub(super) async fn set_distribution_status(
    conn: &mut PgConnection,
    distribution_id: Option<DistributionId>,
    status: DistributionStatus,
) -> Result<()> {
    let Some(distribution_id) = distribution_id else {
        return Ok(());
    };
    let document: Option<serde_json::Value> =
        sqlx::query_scalar("SELECT document FROM distributions WHERE id = $1 FOR UPDATE")
            .bind(distribution_id.as_uuid())
            .fetch_optional(&mut *conn)
            .await
            .map_err(db)?;
    let Some(document) = document else {
        return Ok(());
    };
    let mut distribution: Distribution = from_document(document)?;
    distribution.status = status;
    sqlx::query("UPDATE distributions SET status = $2, document = $3 WHERE id = $1")
        .bind(distribution_id.as_uuid())
        .bind(status.as_str())
        .bind(to_document(&distribution)?)
        .execute(&mut *conn)
        .await
        .map_err(db)?;
    Ok(())
}

impl PaymentBatchStore for PostgresLedgerStore {
    fn insert_batch(
        &self,
        batch: PaymentBatch,
        staged: Vec<StagedEvent>,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(db)?;
            insert_batch_rows(&mut tx, &batch).await?;
            stage(&mut tx, staged, batch.created_at).await?;
            tx.commit().await.map_err(db)?;
            Ok(())
        })
    }

    fn load_batch(&self, batch_id: BatchId) -> BoxFuture<'_, Result<PaymentBatch>> {
        Box::pin(async move {
            let mut conn = self.pool.acquire().await.map_err(db)?;
            fetch_batch(&mut conn, batch_id, false).await
        })
    }

    fn begin_processing(
        &self,
        batch_id: BatchId,
        _now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<PaymentBatch>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(db)?;
            let before = fetch_batch(&mut tx, batch_id, true).await?;
            let mut batch = before.clone();
            batch.begin_processing()?;
            if before.status == BatchStatus::Pending {
                save_batch(&mut tx, &before, &batch).await?;
                let processing = DistributionStatus::Processing;
                set_distribution_status(&mut tx, batch.distribution_id, processing).await?;
                tx.commit().await.map_err(db)?;
            }
            Ok(batch)
        })
    }

    fn claim_item(
        &self,
        batch_id: BatchId,
        payment_id: PaymentId,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Option<BatchItem>>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(db)?;
            let before = fetch_batch(&mut tx, batch_id, true).await?;
            let mut batch = before.clone();
            let claimed = batch.claim_item(payment_id, now, stale_before)?;
            if claimed.is_some() {
                save_batch(&mut tx, &before, &batch).await?;
                tx.commit().await.map_err(db)?;
            }
            Ok(claimed)
        })
    }

    fn record_outcome(
        &self,
        batch_id: BatchId,
        payment_id: PaymentId,
        outcome: ItemOutcome,
        now: DateTime<Utc>,
        metadata: EventMetadata,
    ) -> BoxFuture<'_, Result<Recorded>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(db)?;
            let before = fetch_batch(&mut tx, batch_id, true).await?;
            let mut batch = before.clone();
            let recorded = batch.record_outcome(payment_id, outcome, now)?;
            let Recorded::Applied { events, settled } = &recorded else {
                return Ok(recorded);
            };

            let mut staged = stage_payment_events(batch_id, events, &metadata, now)?;
            if let (Some(status), Some(distribution_id)) = (settled, batch.distribution_id) {
                let status = DistributionStatus::from(*status);
                staged.extend(stage_settlement(distribution_id, status, &metadata, now)?);
                set_distribution_status(&mut tx, Some(distribution_id), status).await?;
            }
            save_batch(&mut tx, &before, &batch).await?;
            stage(&mut tx, staged, now).await?;
            tx.commit().await.map_err(db)?;
            Ok(recorded)
        })
    }

    fn reset_failed_items(
        &self,
        batch_id: BatchId,
        _now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Vec<PaymentId>>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(db)?;
            let before = fetch_batch(&mut tx, batch_id, true).await?;
            let mut batch = before.clone();
            let reset = batch.reset_failed()?;
            if !reset.is_empty() {
                save_batch(&mut tx, &before, &batch).await?;
                let processing = DistributionStatus::Processing;
                set_distribution_status(&mut tx, batch.distribution_id, processing).await?;
                tx.commit().await.map_err(db)?;
            }
            Ok(reset)
        })
    }

    fn open_batches(&self, limit: usize) -> BoxFuture<'_, Result<Vec<BatchId>>> {
        Box::pin(async move {
            let limit = column(limit as u64, "limit")?;
            let ids: Vec<Uuid> = sqlx::query_scalar(
                r"
                SELECT id FROM payment_batches
                WHERE status IN ('pending', 'processing')
                ORDER BY created_at
                LIMIT $1
                ",
            )
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;
            Ok(ids.into_iter().map(BatchId::from_uuid).collect())
        })
    }
}
