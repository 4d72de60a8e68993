//! # Tuneshare Runtime
//!
//! Long-running machinery shared by the worker binary:
//!
//! - [`publisher`]: the outbox publisher that drains staged events onto the
//!   event channel with retries, dead-lettering and a delivery circuit breaker
//! - [`consumer`]: the subscription loop that feeds deliveries to a handler,
//!   acknowledging only handled or dead-lettered envelopes
//! - [`retry`]: exponential backoff for transient store failures
//! - [`circuit_breaker`]: the delivery circuit breaker
//! - [`metrics`]: Prometheus exporter and metric descriptions
//!
//! ## Example
//!
//! ```ignore
//! use tuneshare_runtime::{OutboxPublisher, PublisherConfig};
//!
//! let publisher = OutboxPublisher::new(outbox, bus, clock, PublisherConfig::default());
//! let report = publisher.sweep().await?;
//! println!("published {}", report.published);
//! ```

pub mod circuit_breaker;
pub mod consumer;
pub mod metrics;
pub mod publisher;
pub mod retry;

pub use circuit_breaker::{BreakerConfig, CircuitBreaker};
pub use consumer::{EventConsumer, Outcome};
pub use metrics::{MetricsError, MetricsServer};
pub use publisher::{OutboxPublisher, PublisherConfig, PublisherError, SweepReport};
pub use retry::RetryPolicy;
