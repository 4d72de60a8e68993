//! # Tuneshare Ledger
//!
//! The money-moving core of Tuneshare:
//!
//! - [`rewards`]: listen-to-earn reward pools. Tokens are reserved when a listen
//!   session starts and committed or released when it resolves, so a pool never
//!   hands out more than it holds.
//! - [`distribution`]: royalty revenue split between platform, artist and
//!   fractional shareholders, exact to the cent.
//! - [`payments`]: payment batches and the orchestrator that pays them item by
//!   item through a [`PaymentGateway`](payments::PaymentGateway).
//!
//! Every state change stages its events into the outbox in the same unit of
//! work, so downstream consumers see exactly what was committed.
//!
//! ## Example
//!
//! ```
//! use tuneshare_ledger::distribution::{DistributionRequest, FeeSchedule, calculate};
//! use tuneshare_ledger::ownership::OwnershipContract;
//! use tuneshare_ledger::types::{
//!     ArtistId, BasisPoints, ContractId, Currency, DistributionId, Money, SongId, UserId,
//! };
//! use chrono::Utc;
//!
//! let now = Utc::now();
//! let retained = BasisPoints::new(1_000).unwrap();
//! let mut contract =
//!     OwnershipContract::new(ContractId::new(), SongId::new(), ArtistId::new(), 1_000, retained, now)
//!         .unwrap();
//! contract
//!     .purchase_shares(UserId::new(), 400, Money::from_cents(40_000), now)
//!     .unwrap();
//!
//! let request = DistributionRequest {
//!     contract_id: contract.id,
//!     total_revenue: Money::from_cents(100_000),
//!     currency: Currency::Usd,
//!     period_start: now - chrono::Duration::days(30),
//!     period_end: now,
//!     artist_share: None,
//! };
//! let split = calculate(DistributionId::new(), &contract, &request, &FeeSchedule::default(), now)
//!     .unwrap();
//! split.check_conservation().unwrap();
//! ```

pub mod distribution;
pub mod error;
pub mod events;
pub mod memory;
pub mod ownership;
pub mod payments;
pub mod rewards;
pub mod types;

pub use error::{LedgerError, PublicFailure, PublicStatus, Result};
pub use memory::InMemoryLedger;
