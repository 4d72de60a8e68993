//! # Tuneshare Testing
//!
//! In-memory stand-ins for the storage and delivery infrastructure:
//!
//! - [`InMemoryEventStore`]: event store with optimistic concurrency
//! - [`InMemoryOutbox`]: standalone outbox table
//! - [`InMemoryEventBus`]: delivery channel that records publishes and can fail on demand
//! - [`FixedClock`] / [`ManualClock`]: deterministic time
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use tuneshare_testing::{InMemoryEventBus, InMemoryOutbox, test_clock};
//!
//! let outbox = Arc::new(InMemoryOutbox::with_clock(Arc::new(test_clock())));
//! let bus = InMemoryEventBus::new();
//! bus.fail_next(2);
//! assert!(bus.published().is_empty());
//! ```

use chrono::{DateTime, Utc};
use tuneshare_core::environment::Clock;

pub mod event_bus;
pub mod event_store;
pub mod outbox;

/// Clocks for deterministic tests.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use chrono::Duration;
    use std::sync::{Arc, Mutex};

    /// Clock that always returns the same instant.
    ///
    /// ```
    /// use tuneshare_testing::mocks::FixedClock;
    /// use tuneshare_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Clock pinned at `time`.
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when told to. Clones share the same time.
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    #[allow(clippy::unwrap_used)] // Lock poisoning only happens if a test already panicked
    impl ManualClock {
        /// Clock starting at `time`.
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move time forward.
        pub fn advance(&self, by: Duration) {
            let mut time = self.time.lock().unwrap();
            *time += by;
        }

        /// Jump to an absolute time.
        pub fn set(&self, to: DateTime<Utc>) {
            *self.time.lock().unwrap() = to;
        }
    }

    #[allow(clippy::unwrap_used)]
    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap()
        }
    }

    /// Fixed clock at 2025-01-01 00:00:00 UTC.
    ///
    /// # Panics
    ///
    /// Never in practice; the timestamp is a literal.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }

    /// Manual clock starting at 2025-01-01 00:00:00 UTC.
    #[must_use]
    pub fn manual_clock() -> ManualClock {
        ManualClock::new(test_clock().now())
    }
}

/// Route `tracing` output to the test harness. Safe to call from every test.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tuneshare=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

pub use event_bus::InMemoryEventBus;
pub use event_store::InMemoryEventStore;
pub use mocks::{FixedClock, ManualClock, manual_clock, test_clock};
pub use outbox::InMemoryOutbox;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Duration};

    #[test]
    fn test_clock_is_new_year_2025() {
        let now = test_clock().now();
        assert_eq!((now.year(), now.month(), now.day()), (2025, 1, 1));
    }

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = manual_clock();
        let other = clock.clone();
        clock.advance(Duration::minutes(5));
        assert_eq!(other.now() - test_clock().now(), Duration::minutes(5));
    }
}
