use super::batches::insert_batch_rows;
use super::{PostgresLedgerStore, column, db, from_document, stage, to_document};
use crate::is_unique_violation;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use sqlx::PgConnection;
use tuneshare_core::event::EventMetadata;
use tuneshare_core::outbox::StagedEvent;
use tuneshare_ledger::LedgerError;
use tuneshare_ledger::distribution::service::prepare_distribution;
use tuneshare_ledger::distribution::{
    Distribution, DistributionOutcome, DistributionRequest, DistributionStore, FeeSchedule,
};
use tuneshare_ledger::ownership::OwnershipContract;
use tuneshare_ledger::types::{ContractId, DistributionId, Money, UserId};

type Result<T> = std::result::Result<T, LedgerError>;

async fn fetch_contract(
    conn: &mut PgConnection,
    contract_id: ContractId,
    lock: bool,
) -> Result<OwnershipContract> {
    let sql = format!(
        "SELECT document FROM ownership_contracts WHERE id = $1{}",
        if lock { " FOR UPDATE" } else { "" }
    );
    let document: serde_json::Value = sqlx::query_scalar(&sql)
        .bind(contract_id.as_uuid())
        .fetch_optional(conn)
        .await
        .map_err(db)?
        .ok_or_else(|| LedgerError::not_found("ownership contract", contract_id))?;
    from_document(document)
}

async fn update_contract(
    conn: &mut PgConnection,
    contract: &OwnershipContract,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query("UPDATE ownership_contracts SET document = $2, updated_at = $3 WHERE id = $1")
        .bind(contract.id.as_uuid())
        .bind(to_document(contract)?)
        .bind(now)
        .execute(conn)
        .await
        .map_err(db)?;
    Ok(())
}

async fn find_distribution(
    conn: &mut PgConnection,
    request: &DistributionRequest,
) -> Result<Option<Distribution>> {
    let document: Option<serde_json::Value> = sqlx::query_scalar(
        r"
        SELECT document FROM distributions
        WHERE contract_id = $1 AND period_start = $2 AND period_end = $3
        ",
    )
    .bind(request.contract_id.as_uuid())
    .bind(request.period_start)
    .bind(request.period_end)
    .fetch_optional(conn)
    .await
    .map_err(db)?;
    document.map(from_document).transpose()
}

/// Insert a distribution row; `false` when the period was already taken.
async fn insert_distribution_row(
    conn: &mut PgConnection,
    distribution: &Distribution,
) -> Result<bool> {
    let inserted = sqlx::query(
        r"
        INSERT INTO distributions (
            id, contract_id, period_start, period_end, status, batch_id, document, created_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ",
    )
    .bind(distribution.id.as_uuid())
    .bind(distribution.contract_id.as_uuid())
    .bind(distribution.period_start)
    .bind(distribution.period_end)
    .bind(distribution.status.as_str())
    .bind(distribution.batch_id.map(|b| *b.as_uuid()))
    .bind(to_document(distribution)?)
    .bind(distribution.created_at)
    .execute(conn)
    .await;
    match inserted {
        Ok(_) => Ok(true),
        Err(e) if is_unique_violation(&e) => Ok(false),
        Err(e) => Err(db(e)),
    }
}

impl PostgresLedgerStore {
    async fn distribute_once(
        &self,
        request: &DistributionRequest,
        fees: &FeeSchedule,
        now: DateTime<Utc>,
        metadata: &EventMetadata,
    ) -> Result<Option<DistributionOutcome>> {
        let mut tx = self.pool.begin().await.map_err(db)?;
        // The contract lock serializes distributions of the same contract.
        let contract = fetch_contract(&mut tx, request.contract_id, true).await?;
        if let Some(existing) = find_distribution(&mut tx, request).await? {
            return Ok(Some(DistributionOutcome::Existing(existing)));
        }

        let prepared = prepare_distribution(&contract, request, fees, now, metadata)?;
        if !insert_distribution_row(&mut tx, &prepared.distribution).await? {
            tx.rollback().await.map_err(db)?;
            return Ok(None);
        }
        if let Some(batch) = &prepared.batch {
            insert_batch_rows(&mut tx, batch).await?;
        }
        stage(&mut tx, prepared.staged, now).await?;
        tx.commit().await.map_err(db)?;
        Ok(Some(DistributionOutcome::Created(prepared.distribution)))
    }
}

impl DistributionStore for PostgresLedgerStore {
    fn insert_contract(&self, contract: OwnershipContract) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO ownership_contracts (id, song_id, artist_id, document, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $5)
                ",
            )
            .bind(contract.id.as_uuid())
            .bind(contract.song_id.as_uuid())
            .bind(contract.artist_id.as_uuid())
            .bind(to_document(&contract)?)
            .bind(contract.created_at)
            .execute(&self.pool)
            .await
            .map_err(db)?;
            Ok(())
        })
    }

    fn load_contract(&self, contract_id: ContractId) -> BoxFuture<'_, Result<OwnershipContract>> {
        Box::pin(async move {
            let mut conn = self.pool.acquire().await.map_err(db)?;
            fetch_contract(&mut conn, contract_id, false).await
        })
    }

    fn record_share_purchase(
        &self,
        contract_id: ContractId,
        holder: UserId,
        shares: u64,
        price: Money,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<OwnershipContract>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(db)?;
            let mut contract = fetch_contract(&mut tx, contract_id, true).await?;
            contract.purchase_shares(holder, shares, price, now)?;
            contract.validate()?;
            update_contract(&mut tx, &contract, now).await?;
            tx.commit().await.map_err(db)?;
            Ok(contract)
        })
    }

    fn record_share_transfer(
        &self,
        contract_id: ContractId,
        seller: UserId,
        buyer: UserId,
        shares: u64,
        price: Money,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<OwnershipContract>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(db)?;
            let mut contract = fetch_contract(&mut tx, contract_id, true).await?;
            contract.transfer_shares(seller, buyer, shares, price, now)?;
            contract.validate()?;
            update_contract(&mut tx, &contract, now).await?;
            tx.commit().await.map_err(db)?;
            Ok(contract)
        })
    }

    fn record_period_close(
        &self,
        request: DistributionRequest,
        staged: StagedEvent,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let now = self.clock.now();
            let mut tx = self.pool.begin().await.map_err(db)?;
            fetch_contract(&mut tx, request.contract_id, false).await?;
            sqlx::query(
                r"
                INSERT INTO royalty_periods (
                    contract_id, period_start, period_end, total_revenue, currency, closed_at
                ) VALUES ($1, $2, $3, $4, $5, $6)
                ",
            )
            .bind(request.contract_id.as_uuid())
            .bind(request.period_start)
            .bind(request.period_end)
            .bind(column(request.total_revenue.cents(), "total_revenue")?)
            .bind(request.currency.code())
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(db)?;
            stage(&mut tx, vec![staged], now).await?;
            tx.commit().await.map_err(db)?;
            Ok(())
        })
    }

    fn distribute(
        &self,
        request: DistributionRequest,
        fees: FeeSchedule,
        now: DateTime<Utc>,
        metadata: EventMetadata,
    ) -> BoxFuture<'_, Result<DistributionOutcome>> {
        Box::pin(async move {
            if let Some(outcome) = self.distribute_once(&request, &fees, now, &metadata).await? {
                return Ok(outcome);
            }
            // Another writer won the per-period constraint.
            let mut conn = self.pool.acquire().await.map_err(db)?;
            find_distribution(&mut conn, &request)
                .await?
                .map(DistributionOutcome::Existing)
                .ok_or_else(|| {
                    LedgerError::ConcurrencyConflict {
                        aggregate: request.contract_id.to_string(),
                        detail: "distribution period claimed concurrently".into(),
                    }
                })
        })
    }

    fn load_distribution(
        &self,
        distribution_id: DistributionId,
    ) -> BoxFuture<'_, Result<Distribution>> {
        Box::pin(async move {
            let document: serde_json::Value =
                sqlx::query_scalar("SELECT document FROM distributions WHERE id = $1")
                    .bind(distribution_id.as_uuid())
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(db)?
                    .ok_or_else(|| LedgerError::not_found("distribution", distribution_id))?;
            from_document(document)
        })
    }
}
