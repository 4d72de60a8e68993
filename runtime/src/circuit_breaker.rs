//! Circuit breaker guarding delivery to the event channel.
//!
//! When the channel keeps failing, every publish attempt would burn one unit of
//! an entry's retry budget and push healthy entries towards the dead-letter
//! queue. The breaker opens after `failure_threshold` consecutive failures;
//! while open the publisher releases claimed entries untouched. After
//! `open_for` one probe is let through (half-open) and `success_threshold`
//! successes close the circuit again.
//!
//! # States
//!
//! - **Closed**: deliveries pass; consecutive failures are counted.
//! - **Open**: deliveries are skipped until `open_for` has elapsed.
//! - **`HalfOpen`**: deliveries pass; one failure reopens the circuit.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Breaker thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before probing.
    pub open_for: Duration,
    /// Successes in half-open state that close the circuit.
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_for: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

/// Circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Deliveries pass.
    Closed,
    /// Deliveries are skipped.
    Open,
    /// Probing whether the channel recovered.
    HalfOpen,
}

impl State {
    /// Gauge value: 0 closed, 1 half-open, 2 open.
    #[must_use]
    pub const fn gauge(self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: State,
    failures: u32,
    successes: u32,
    opened_at: Option<Instant>,
}

/// Counters since the breaker was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BreakerStats {
    /// Successful deliveries recorded.
    pub successes: u64,
    /// Failed deliveries recorded.
    pub failures: u64,
    /// Deliveries skipped while open.
    pub rejections: u64,
}

/// Delivery circuit breaker. Clones share state.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Arc<RwLock<Inner>>,
    successes: Arc<AtomicU64>,
    failures: Arc<AtomicU64>,
    rejections: Arc<AtomicU64>,
}

impl CircuitBreaker {
    /// Closed breaker.
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Arc::new(RwLock::new(Inner {
                state: State::Closed,
                failures: 0,
                successes: 0,
                opened_at: None,
            })),
            successes: Arc::new(AtomicU64::new(0)),
            failures: Arc::new(AtomicU64::new(0)),
            rejections: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Current state.
    pub async fn state(&self) -> State {
        self.inner.read().await.state
    }

    /// Whether a delivery may be attempted now. Moves an expired open circuit
    /// to half-open.
    pub async fn allow(&self) -> bool {
        let mut inner = self.inner.write().await;
        if inner.state != State::Open {
            return true;
        }
        let expired = inner
            .opened_at
            .is_none_or(|at| at.elapsed() >= self.config.open_for);
        if expired {
            tracing::info!("Delivery circuit half-open, probing channel");
            inner.state = State::HalfOpen;
            inner.successes = 0;
            publish_state(State::HalfOpen);
            return true;
        }
        drop(inner);
        self.rejections.fetch_add(1, Ordering::Relaxed);
        false
    }

    /// Record a delivered message.
    pub async fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.write().await;
        match inner.state {
            State::Closed => inner.failures = 0,
            State::HalfOpen => {
                inner.successes += 1;
                if inner.successes >= self.config.success_threshold {
                    tracing::info!("Delivery circuit closed");
                    *inner = Inner {
                        state: State::Closed,
                        failures: 0,
                        successes: 0,
                        opened_at: None,
                    };
                    publish_state(State::Closed);
                }
            }
            State::Open => {}
        }
    }

    /// Record a failed delivery.
    pub async fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.write().await;
        match inner.state {
            State::Closed => {
                inner.failures += 1;
                if inner.failures >= self.config.failure_threshold {
                    tracing::warn!(
                        failures = inner.failures,
                        open_for_ms = u64::try_from(self.config.open_for.as_millis()).unwrap_or(u64::MAX),
                        "Delivery circuit opened"
                    );
                    inner.state = State::Open;
                    inner.opened_at = Some(Instant::now());
                    publish_state(State::Open);
                }
            }
            State::HalfOpen => {
                tracing::warn!("Delivery probe failed, circuit reopened");
                inner.state = State::Open;
                inner.opened_at = Some(Instant::now());
                inner.successes = 0;
                publish_state(State::Open);
            }
            State::Open => inner.opened_at = Some(Instant::now()),
        }
    }

    /// Counters since creation.
    #[must_use]
    pub fn stats(&self) -> BreakerStats {
        BreakerStats {
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
        }
    }

    /// Force the circuit closed.
    pub async fn reset(&self) {
        let mut inner = self.inner.write().await;
        tracing::info!("Delivery circuit manually reset");
        *inner = Inner {
            state: State::Closed,
            failures: 0,
            successes: 0,
            opened_at: None,
        };
        publish_state(State::Closed);
    }
}

fn publish_state(state: State) {
    metrics::gauge!("outbox.publisher.circuit_state").set(state.gauge());
}
