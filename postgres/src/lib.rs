//! `PostgreSQL` storage for Tuneshare.
//!
//! - [`PostgresEventStore`]: append-only event log with optimistic concurrency
//!   and snapshots
//! - [`PostgresOutbox`]: transactional outbox with `FOR UPDATE SKIP LOCKED`
//!   claims so several publishers can run side by side
//! - [`DeadLetterQueue`]: operator tooling for dead-lettered outbox entries
//! - [`PostgresLedgerStore`]: reward pools, ownership contracts, distributions
//!   and payment batches; every business write stages its events in the
//!   outbox inside the same transaction
//!
//! # Example
//!
//! ```no_run
//! use tuneshare_postgres::{PoolSettings, PostgresLedgerStore, PostgresOutbox, connect, migrate};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = connect(&PoolSettings::new("postgres://localhost/tuneshare")).await?;
//! migrate(&pool).await?;
//! let ledger = PostgresLedgerStore::new(pool.clone());
//! let outbox = PostgresOutbox::new(pool);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod dead_letter_queue;
pub mod event_store;
pub mod ledger;
pub mod outbox;

pub use dead_letter_queue::{DeadLetterAction, DeadLetterQueue, Resolution};
pub use event_store::PostgresEventStore;
pub use ledger::PostgresLedgerStore;
pub use outbox::PostgresOutbox;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;

/// Connection pool sizing and timeouts.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Connection URL.
    pub url: String,
    /// Upper bound on open connections.
    pub max_connections: u32,
    /// Connections kept open while idle.
    pub min_connections: u32,
    /// How long to wait for a free connection.
    pub acquire_timeout: Duration,
    /// Idle connections older than this are closed.
    pub idle_timeout: Duration,
}

impl PoolSettings {
    /// Defaults for `url`: 10 connections, 2 idle, 30 s acquire, 10 min idle.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 10,
            min_connections: 2,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

/// Open a connection pool.
///
/// # Errors
///
/// Returns the driver error if no connection can be established.
pub async fn connect(settings: &PoolSettings) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .min_connections(settings.min_connections)
        .acquire_timeout(settings.acquire_timeout)
        .idle_timeout(settings.idle_timeout)
        .connect(&settings.url)
        .await?;
    tracing::info!(
        max_connections = settings.max_connections,
        min_connections = settings.min_connections,
        "Database pool connected"
    );
    Ok(pool)
}

/// Apply the bundled schema migrations.
///
/// # Errors
///
/// Returns the migration error if any script fails.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Database migrations applied");
    Ok(())
}

/// Whether the error is a unique-constraint violation.
pub(crate) fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .is_some_and(|db| db.is_unique_violation())
}

/// Convert an unsigned counter to a `BIGINT` column value.
pub(crate) fn to_i64(value: u64, column: &str) -> Result<i64, String> {
    i64::try_from(value).map_err(|_| format!("{column} out of range: {value}"))
}

/// Convert a `BIGINT` column value to an unsigned counter.
pub(crate) fn to_u64(value: i64, column: &str) -> Result<u64, String> {
    u64::try_from(value).map_err(|_| format!("{column} is negative: {value}"))
}
