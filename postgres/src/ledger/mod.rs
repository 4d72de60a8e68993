//! Ledger stores over `PostgreSQL`.
//!
//! One [`PostgresLedgerStore`] implements the reward pool, distribution and
//! payment batch store traits. Every trait call is one transaction: the rows it
//! changes are locked with `SELECT ... FOR UPDATE`, the pure domain method is
//! applied to the loaded value, and the new state is written back together
//! with the staged outbox events. Nothing is written when the domain method
//! rejects the change.
//!
//! Pools and reservations are stored column by column so the capacity
//! invariant is also a table constraint. Contracts, distributions and batches
//! keep their full state in a `JSONB` document next to the columns used for
//! lookups, uniqueness and sweeps.

mod batches;
mod distributions;
mod pools;

use crate::outbox::stage_in;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::{PgConnection, PgPool};
use std::sync::Arc;
use tuneshare_core::environment::{Clock, SystemClock};
use tuneshare_core::outbox::StagedEvent;
use tuneshare_ledger::LedgerError;

/// Ledger persistence over a connection pool.
#[derive(Clone)]
pub struct PostgresLedgerStore {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl PostgresLedgerStore {
    /// Store stamping outbox rows with wall-clock time.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self::with_clock(pool, Arc::new(SystemClock))
    }

    /// Store stamping outbox rows with `clock`.
    #[must_use]
    pub fn with_clock(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

async fn stage(
    conn: &mut PgConnection,
    staged: Vec<StagedEvent>,
    now: DateTime<Utc>,
) -> Result<(), LedgerError> {
    if staged.is_empty() {
        return Ok(());
    }
    stage_in(conn, staged, now).await.map_err(db)?;
    Ok(())
}

fn to_document<T: Serialize>(value: &T) -> Result<serde_json::Value, LedgerError> {
    serde_json::to_value(value).map_err(|e| LedgerError::Storage(format!("encode document: {e}")))
}

fn from_document<T: DeserializeOwned>(value: serde_json::Value) -> Result<T, LedgerError> {
    serde_json::from_value(value).map_err(|e| LedgerError::Storage(format!("decode document: {e}")))
}

fn column(value: u64, name: &str) -> Result<i64, LedgerError> {
    crate::to_i64(value, name).map_err(LedgerError::Storage)
}

fn counter(value: i64, name: &str) -> Result<u64, LedgerError> {
    crate::to_u64(value, name).map_err(LedgerError::Storage)
}

#[allow(clippy::needless_pass_by_value)] // Used as a map_err adapter
fn db(e: sqlx::Error) -> LedgerError {
    LedgerError::Storage(e.to_string())
}
