//! # Tuneshare Core
//!
//! Storage and delivery abstractions shared by every Tuneshare crate:
//!
//! - [`event`]: the [`Event`](event::Event) trait and its serialized forms
//! - [`stream`]: aggregate identifiers and versions
//! - [`event_store`]: append-only storage with optimistic concurrency
//! - [`aggregate`]: folding event history back into state
//! - [`outbox`]: the transactional outbox and its delivery lifecycle
//! - [`event_bus`]: the delivery channel the outbox publisher writes to
//! - [`environment`]: injected clock
//!
//! Nothing here performs I/O itself; implementations live in `tuneshare-postgres`,
//! `tuneshare-redpanda` and `tuneshare-testing`.

pub use chrono::{DateTime, Utc};
pub use uuid::Uuid;

pub mod aggregate;
pub mod environment;
pub mod event;
pub mod event_bus;
pub mod event_store;
pub mod outbox;
pub mod stream;
