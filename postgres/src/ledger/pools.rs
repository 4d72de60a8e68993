use super::{PostgresLedgerStore, column, counter, db, stage};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Row};
use tuneshare_core::event::EventMetadata;
use tuneshare_core::outbox::StagedEvent;
use tuneshare_ledger::LedgerError;
use tuneshare_ledger::events::RewardEvent;
use tuneshare_ledger::rewards::allocator::{
    PoolChange, ReserveRequest, RewardPoolStore, stage_reward_events,
};
use tuneshare_ledger::rewards::pool::{Reservation, ReservationStatus, RewardPool, PoolStatus};
use tuneshare_ledger::types::{PoolId, ReservationId, SessionId, Tokens, UserId};
use uuid::Uuid;

type Result<T> = std::result::Result<T, LedgerError>;

const POOL_COLUMNS: &str = "id, total_tokens, distributed_tokens, reserved_tokens, \
     validation_start, validation_end, status, depletion_threshold, depletion_announced, \
     created_at, closed_at";

const RESERVATION_COLUMNS: &str =
    "id, pool_id, user_id, session_id, amount, committed, status, created_at, resolved_at";

async fn fetch_pool(conn: &mut PgConnection, pool_id: PoolId, lock: bool) -> Result<RewardPool> {
    let sql = format!(
        "SELECT {POOL_COLUMNS} FROM reward_pools WHERE id = $1{}",
        if lock { " FOR UPDATE" } else { "" }
    );
    let row = sqlx::query(&sql)
        .bind(pool_id.as_uuid())
        .fetch_optional(conn)
        .await
        .map_err(db)?
        .ok_or_else(|| LedgerError::not_found("reward pool", pool_id))?;
    row_to_pool(&row)
}

async fn fetch_reservation(
    conn: &mut PgConnection,
    reservation_id: ReservationId,
    lock: bool,
) -> Result<Reservation> {
    let sql = format!(
        "SELECT {RESERVATION_COLUMNS} FROM reward_reservations WHERE id = $1{}",
        if lock { " FOR UPDATE" } else { "" }
    );
    let row = sqlx::query(&sql)
        .bind(reservation_id.as_uuid())
        .fetch_optional(conn)
        .await
        .map_err(db)?
        .ok_or_else(|| LedgerError::not_found("reservation", reservation_id))?;
    row_to_reservation(&row)
}

async fn insert_pool_row(conn: &mut PgConnection, pool: &RewardPool) -> Result<()> {
    sqlx::query(&format!(
        "INSERT INTO reward_pools ({POOL_COLUMNS}) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"
    ))
    .bind(pool.id.as_uuid())
    .bind(column(pool.total_tokens.value(), "total_tokens")?)
    .bind(column(pool.distributed_tokens.value(), "distributed_tokens")?)
    .bind(column(pool.reserved_tokens.value(), "reserved_tokens")?)
    .bind(pool.validation_start)
    .bind(pool.validation_end)
    .bind(pool.status.as_str())
    .bind(column(pool.depletion_threshold.value(), "depletion_threshold")?)
    .bind(pool.depletion_announced)
    .bind(pool.created_at)
    .bind(pool.closed_at)
    .execute(conn)
    .await
    .map_err(db)?;
    Ok(())
}

async fn update_pool_row(conn: &mut PgConnection, pool: &RewardPool) -> Result<()> {
    sqlx::query(
        r"
        UPDATE reward_pools
        SET distributed_tokens = $2, reserved_tokens = $3, status = $4,
            depletion_announced = $5, closed_at = $6
        WHERE id = $1
        ",
    )
    .bind(pool.id.as_uuid())
    .bind(column(pool.distributed_tokens.value(), "distributed_tokens")?)
    .bind(column(pool.reserved_tokens.value(), "reserved_tokens")?)
    .bind(pool.status.as_str())
    .bind(pool.depletion_announced)
    .bind(pool.closed_at)
    .execute(conn)
    .await
    .map_err(db)?;
    Ok(())
}

async fn insert_reservation_row(conn: &mut PgConnection, reservation: &Reservation) -> Result<()> {
    sqlx::query(&format!(
        "INSERT INTO reward_reservations ({RESERVATION_COLUMNS}) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
    ))
    .bind(reservation.id.as_uuid())
    .bind(reservation.pool_id.as_uuid())
    .bind(reservation.user_id.as_uuid())
    .bind(reservation.session_id.map(|s| *s.as_uuid()))
    .bind(column(reservation.amount.value(), "amount")?)
    .bind(reservation.committed.map(|t| column(t.value(), "committed")).transpose()?)
    .bind(reservation.status.as_str())
    .bind(reservation.created_at)
    .bind(reservation.resolved_at)
    .execute(conn)
    .await
    .map_err(db)?;
    Ok(())
}

async fn update_reservation_row(conn: &mut PgConnection, reservation: &Reservation) -> Result<()> {
    sqlx::query(
        r"
        UPDATE reward_reservations
        SET committed = $2, status = $3, resolved_at = $4
        WHERE id = $1
        ",
    )
    .bind(reservation.id.as_uuid())
    .bind(reservation.committed.map(|t| column(t.value(), "committed")).transpose()?)
    .bind(reservation.status.as_str())
    .bind(reservation.resolved_at)
    .execute(conn)
    .await
    .map_err(db)?;
    Ok(())
}

fn row_to_pool(row: &PgRow) -> Result<RewardPool> {
    let tokens = |name: &str| -> Result<Tokens> {
        let value: i64 = row.try_get(name).map_err(db)?;
        Ok(Tokens::new(counter(value, name)?))
    };
    let status: String = row.try_get("status").map_err(db)?;
    let id: Uuid = row.try_get("id").map_err(db)?;
    Ok(RewardPool {
        id: PoolId::from_uuid(id),
        total_tokens: tokens("total_tokens")?,
        distributed_tokens: tokens("distributed_tokens")?,
        reserved_tokens: tokens("reserved_tokens")?,
        validation_start: row.try_get("validation_start").map_err(db)?,
        validation_end: row.try_get("validation_end").map_err(db)?,
        status: PoolStatus::parse(&status)?,
        depletion_threshold: tokens("depletion_threshold")?,
        depletion_announced: row.try_get("depletion_announced").map_err(db)?,
        created_at: row.try_get("created_at").map_err(db)?,
        closed_at: row.try_get("closed_at").map_err(db)?,
    })
}

fn row_to_reservation(row: &PgRow) -> Result<Reservation> {
    let id: Uuid = row.try_get("id").map_err(db)?;
    let pool_id: Uuid = row.try_get("pool_id").map_err(db)?;
    let user_id: Uuid = row.try_get("user_id").map_err(db)?;
    let session_id: Option<Uuid> = row.try_get("session_id").map_err(db)?;
    let amount: i64 = row.try_get("amount").map_err(db)?;
    let committed: Option<i64> = row.try_get("committed").map_err(db)?;
    let status: String = row.try_get("status").map_err(db)?;
    Ok(Reservation {
        id: ReservationId::from_uuid(id),
        pool_id: PoolId::from_uuid(pool_id),
        user_id: UserId::from_uuid(user_id),
        session_id: session_id.map(SessionId::from_uuid),
        amount: Tokens::new(counter(amount, "amount")?),
        committed: committed
            .map(|c| counter(c, "committed").map(Tokens::new))
            .transpose()?,
        status: ReservationStatus::parse(&status)?,
        created_at: row.try_get("created_at").map_err(db)?,
        resolved_at: row.try_get("resolved_at").map_err(db)?,
    })
}

impl PostgresLedgerStore {
    /// Lock a reservation and its pool, apply `apply`, write both back and stage the events.
    async fn change_reservation<F>(
        &self,
        reservation_id: ReservationId,
        now: DateTime<Utc>,
        metadata: &EventMetadata,
        apply: F,
    ) -> Result<PoolChange>
    where
        F: FnOnce(&mut RewardPool, &mut Reservation) -> Result<Vec<RewardEvent>> + Send,
    {
        let mut tx = self.pool.begin().await.map_err(db)?;
        let mut reservation = fetch_reservation(&mut tx, reservation_id, true).await?;
        let mut pool = fetch_pool(&mut tx, reservation.pool_id, true).await?;

        let events = apply(&mut pool, &mut reservation)?;
        if !events.is_empty() {
            let staged = stage_reward_events(pool.id, &events, metadata, now)?;
            update_pool_row(&mut tx, &pool).await?;
            update_reservation_row(&mut tx, &reservation).await?;
            stage(&mut tx, staged, now).await?;
        }
        tx.commit().await.map_err(db)?;

        Ok(PoolChange {
            reservation,
            pool,
            events,
        })
    }
}

impl RewardPoolStore for PostgresLedgerStore {
    fn insert_pool(&self, pool: RewardPool, staged: Vec<StagedEvent>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(db)?;
            insert_pool_row(&mut tx, &pool).await?;
            stage(&mut tx, staged, pool.created_at).await?;
            tx.commit().await.map_err(db)?;
            Ok(())
        })
    }

    fn load_pool(&self, pool_id: PoolId) -> BoxFuture<'_, Result<RewardPool>> {
        Box::pin(async move {
            let mut conn = self.pool.acquire().await.map_err(db)?;
            fetch_pool(&mut conn, pool_id, false).await
        })
    }

    fn load_reservation(&self, reservation_id: ReservationId) -> BoxFuture<'_, Result<Reservation>> {
        Box::pin(async move {
            let mut conn = self.pool.acquire().await.map_err(db)?;
            fetch_reservation(&mut conn, reservation_id, false).await
        })
    }

    fn reserve(
        &self,
        request: ReserveRequest,
        now: DateTime<Utc>,
        metadata: EventMetadata,
    ) -> BoxFuture<'_, Result<PoolChange>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(db)?;
            let mut pool = fetch_pool(&mut tx, request.pool_id, true).await?;
            let (reservation, events) =
                pool.reserve(request.reservation_id, request.amount, request.claim, now)?;
            let staged = stage_reward_events(pool.id, &events, &metadata, now)?;

            update_pool_row(&mut tx, &pool).await?;
            insert_reservation_row(&mut tx, &reservation).await?;
            stage(&mut tx, staged, now).await?;
            tx.commit().await.map_err(db)?;

            tracing::debug!(
                pool_id = %pool.id,
                reservation_id = %reservation.id,
                amount = reservation.amount.value(),
                available = pool.available().value(),
                "Reservation persisted"
            );
            Ok(PoolChange {
                reservation,
                pool,
                events,
            })
        })
    }

    fn commit(
        &self,
        reservation_id: ReservationId,
        final_amount: Tokens,
        now: DateTime<Utc>,
        metadata: EventMetadata,
    ) -> BoxFuture<'_, Result<PoolChange>> {
        Box::pin(async move {
            self.change_reservation(reservation_id, now, &metadata, |pool, reservation| {
                pool.commit(reservation, final_amount, now)
            })
            .await
        })
    }

    fn release(
        &self,
        reservation_id: ReservationId,
        now: DateTime<Utc>,
        metadata: EventMetadata,
    ) -> BoxFuture<'_, Result<PoolChange>> {
        Box::pin(async move {
            self.change_reservation(reservation_id, now, &metadata, |pool, reservation| {
                pool.release(reservation, now)
            })
            .await
        })
    }

    fn close_pool(
        &self,
        pool_id: PoolId,
        now: DateTime<Utc>,
        metadata: EventMetadata,
    ) -> BoxFuture<'_, Result<RewardPool>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(db)?;
            let mut pool = fetch_pool(&mut tx, pool_id, true).await?;
            let event = pool.close(now)?;
            let staged = stage_reward_events(pool_id, &[event], &metadata, now)?;
            update_pool_row(&mut tx, &pool).await?;
            stage(&mut tx, staged, now).await?;
            tx.commit().await.map_err(db)?;
            Ok(pool)
        })
    }
}
