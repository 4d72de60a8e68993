//! Transactional outbox: events staged next to the business write that caused them.
//!
//! A service that changes business state stages the corresponding event as an
//! [`OutboxEntry`] inside the same transaction. A publisher later claims pending
//! entries, delivers them and records the outcome. The lifecycle is:
//!
//! ```text
//!            claim              deliver ok
//! pending ─────────► processing ──────────► published ──► (purged after retention)
//!    ▲                   │
//!    │ release           │ deliver failed
//!    └───────────────────┤
//!                        ▼
//!                      failed ── retry_count >= max_retries ──► dead_letter
//!                        │                                          │
//!                        └──────── claimable again ◄── operator requeue
//! ```
//!
//! [`OutboxLog`] holds these rules as plain in-memory state. Stores that keep
//! their outbox in memory wrap it; SQL stores implement the same transitions in
//! their queries.

use crate::event::{Event, EventError, EventMetadata, SerializedEvent};
use crate::event_bus::Envelope;
use crate::stream::AggregateId;
use chrono::{DateTime, Duration, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Default number of delivery attempts before an entry is dead-lettered.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default topic for events of an aggregate kind: `reward_pool` → `reward-pool-events`.
#[must_use]
pub fn topic_for(aggregate_type: &str) -> String {
    format!("{}-events", aggregate_type.replace('_', "-"))
}

/// Delivery state of an outbox entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum OutboxStatus {
    /// Waiting for its first delivery attempt.
    Pending,
    /// Claimed by a publisher.
    Processing,
    /// Delivered.
    Published,
    /// Last attempt failed; will be retried.
    Failed,
    /// Out of retries; needs an operator.
    DeadLetter,
}

impl OutboxStatus {
    /// Column value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Published => "published",
            Self::Failed => "failed",
            Self::DeadLetter => "dead_letter",
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = OutboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "published" => Ok(Self::Published),
            "failed" => Ok(Self::Failed),
            "dead_letter" => Ok(Self::DeadLetter),
            other => Err(OutboxError::Storage(format!("unknown outbox status: {other}"))),
        }
    }
}

/// Errors from outbox operations.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// No entry with this ID.
    #[error("Outbox entry not found: {0}")]
    NotFound(Uuid),

    /// The entry is not in a state that allows the requested action.
    #[error("Cannot {action} outbox entry {id} in status {from}")]
    InvalidTransition {
        /// Entry ID.
        id: Uuid,
        /// Current status.
        from: OutboxStatus,
        /// Attempted action.
        action: &'static str,
    },

    /// Event payload could not be encoded.
    #[error("Outbox serialization error: {0}")]
    Serialization(String),

    /// Storage failure.
    #[error("Outbox storage error: {0}")]
    Storage(String),
}

impl OutboxError {
    /// Whether retrying the same call may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

impl From<EventError> for OutboxError {
    fn from(e: EventError) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// An event to be written into the outbox alongside a business change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StagedEvent {
    /// Aggregate the event is about.
    pub aggregate_id: AggregateId,
    /// Aggregate kind.
    pub aggregate_type: String,
    /// Channel topic the event is delivered to.
    pub routing_key: String,
    /// Encoded event.
    pub event: SerializedEvent,
    /// When the business change happened.
    pub occurred_at: DateTime<Utc>,
    /// Delivery attempts before dead-lettering.
    pub max_retries: u32,
}

impl StagedEvent {
    /// Encode `event` for the outbox, routed to the aggregate kind's default topic.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Serialization`] if the event cannot be encoded.
    pub fn from_event<E: Event + Serialize>(
        aggregate_id: AggregateId,
        aggregate_type: &str,
        event: &E,
        metadata: EventMetadata,
        occurred_at: DateTime<Utc>,
    ) -> Result<Self, OutboxError> {
        Ok(Self {
            aggregate_id,
            aggregate_type: aggregate_type.to_string(),
            routing_key: topic_for(aggregate_type),
            event: SerializedEvent::from_event(event, metadata)?,
            occurred_at,
            max_retries: DEFAULT_MAX_RETRIES,
        })
    }

    /// Route to a specific topic.
    #[must_use]
    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = routing_key.into();
        self
    }

    /// Override the retry ceiling.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// A row of the outbox table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboxEntry {
    /// Entry ID; also the idempotency key consumers deduplicate on.
    pub id: Uuid,
    /// Aggregate the event is about.
    pub aggregate_id: AggregateId,
    /// Aggregate kind.
    pub aggregate_type: String,
    /// Channel topic.
    pub routing_key: String,
    /// Encoded event.
    pub event: SerializedEvent,
    /// Delivery state.
    pub status: OutboxStatus,
    /// Failed delivery attempts so far.
    pub retry_count: u32,
    /// Attempts allowed before dead-lettering.
    pub max_retries: u32,
    /// Last delivery error.
    pub error_message: Option<String>,
    /// When the business change happened.
    pub occurred_at: DateTime<Utc>,
    /// When the entry was staged.
    pub created_at: DateTime<Utc>,
    /// When the current claim was taken.
    pub claimed_at: Option<DateTime<Utc>>,
    /// When delivery succeeded.
    pub published_at: Option<DateTime<Utc>>,
}

impl OutboxEntry {
    /// New pending entry for a staged event.
    #[must_use]
    pub fn from_staged(staged: StagedEvent, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            aggregate_id: staged.aggregate_id,
            aggregate_type: staged.aggregate_type,
            routing_key: staged.routing_key,
            event: staged.event,
            status: OutboxStatus::Pending,
            retry_count: 0,
            max_retries: staged.max_retries,
            error_message: None,
            occurred_at: staged.occurred_at,
            created_at,
            claimed_at: None,
            published_at: None,
        }
    }

    /// Whether a publisher sweep may pick this entry up.
    #[must_use]
    pub const fn is_claimable(&self) -> bool {
        match self.status {
            OutboxStatus::Pending => true,
            OutboxStatus::Failed => self.retry_count < self.max_retries,
            _ => false,
        }
    }

    fn claim(&mut self, now: DateTime<Utc>) {
        self.status = OutboxStatus::Processing;
        self.claimed_at = Some(now);
    }

    /// Record a successful delivery. Already-published entries are left alone.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::InvalidTransition`] for dead-lettered entries.
    pub fn mark_published(&mut self, now: DateTime<Utc>) -> Result<(), OutboxError> {
        match self.status {
            OutboxStatus::Published => Ok(()),
            OutboxStatus::DeadLetter => Err(self.invalid("publish")),
            _ => {
                self.status = OutboxStatus::Published;
                self.published_at = Some(now);
                self.claimed_at = None;
                self.error_message = None;
                Ok(())
            }
        }
    }

    /// Record a failed delivery attempt and return the resulting status.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::InvalidTransition`] unless the entry is being processed.
    pub fn mark_failed(&mut self, error: &str) -> Result<OutboxStatus, OutboxError> {
        if self.status != OutboxStatus::Processing {
            return Err(self.invalid("fail"));
        }
        self.retry_count = self.retry_count.saturating_add(1);
        self.error_message = Some(error.to_string());
        self.claimed_at = None;
        self.status = if self.retry_count >= self.max_retries {
            OutboxStatus::DeadLetter
        } else {
            OutboxStatus::Failed
        };
        Ok(self.status)
    }

    /// Give a claim back without counting it as an attempt.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::InvalidTransition`] unless the entry is being processed.
    pub fn release(&mut self) -> Result<(), OutboxError> {
        if self.status != OutboxStatus::Processing {
            return Err(self.invalid("release"));
        }
        self.claimed_at = None;
        self.status = if self.retry_count == 0 {
            OutboxStatus::Pending
        } else {
            OutboxStatus::Failed
        };
        Ok(())
    }

    /// Operator action: give a dead-lettered entry a fresh set of attempts.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::InvalidTransition`] unless the entry is dead-lettered.
    pub fn requeue(&mut self) -> Result<(), OutboxError> {
        if self.status != OutboxStatus::DeadLetter {
            return Err(self.invalid("requeue"));
        }
        self.status = OutboxStatus::Pending;
        self.retry_count = 0;
        Ok(())
    }

    /// The message delivered on the channel for this entry.
    #[must_use]
    pub fn envelope(&self) -> Envelope {
        Envelope {
            outbox_id: self.id,
            aggregate_id: self.aggregate_id.clone(),
            aggregate_type: self.aggregate_type.clone(),
            event: self.event.clone(),
            occurred_at: self.occurred_at,
        }
    }

    const fn invalid(&self, action: &'static str) -> OutboxError {
        OutboxError::InvalidTransition {
            id: self.id,
            from: self.status,
            action,
        }
    }
}

/// Number of entries in each status.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OutboxCounts {
    /// Pending entries.
    pub pending: u64,
    /// Entries claimed by a publisher.
    pub processing: u64,
    /// Delivered entries not yet purged.
    pub published: u64,
    /// Entries waiting for a retry.
    pub failed: u64,
    /// Entries needing an operator.
    pub dead_letter: u64,
}

impl OutboxCounts {
    /// Increment the counter for `status`.
    pub const fn add(&mut self, status: OutboxStatus, n: u64) {
        match status {
            OutboxStatus::Pending => self.pending += n,
            OutboxStatus::Processing => self.processing += n,
            OutboxStatus::Published => self.published += n,
            OutboxStatus::Failed => self.failed += n,
            OutboxStatus::DeadLetter => self.dead_letter += n,
        }
    }
}

/// Storage for outbox entries.
///
/// Business stores stage entries inside their own transactions; this trait is
/// what the publisher and operator tooling use afterwards.
pub trait OutboxStore: Send + Sync {
    /// Stage an event outside any business transaction.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Storage`] on storage failure.
    fn stage(&self, staged: StagedEvent) -> BoxFuture<'_, Result<OutboxEntry, OutboxError>>;

    /// Atomically claim up to `limit` claimable entries, oldest `occurred_at`
    /// first (ties by `created_at`), and mark them `processing`.
    ///
    /// Concurrent callers never receive the same entry.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Storage`] on storage failure.
    fn claim_batch(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Vec<OutboxEntry>, OutboxError>>;

    /// Record a successful delivery. Idempotent.
    ///
    /// # Errors
    ///
    /// [`OutboxError::NotFound`], [`OutboxError::InvalidTransition`] or storage failure.
    fn mark_published(&self, id: Uuid, now: DateTime<Utc>)
    -> BoxFuture<'_, Result<(), OutboxError>>;

    /// Record a failed attempt; returns `Failed` or `DeadLetter`.
    ///
    /// # Errors
    ///
    /// [`OutboxError::NotFound`], [`OutboxError::InvalidTransition`] or storage failure.
    fn mark_failed(
        &self,
        id: Uuid,
        error: String,
    ) -> BoxFuture<'_, Result<OutboxStatus, OutboxError>>;

    /// Return a claim without consuming an attempt.
    ///
    /// # Errors
    ///
    /// [`OutboxError::NotFound`], [`OutboxError::InvalidTransition`] or storage failure.
    fn release(&self, id: Uuid) -> BoxFuture<'_, Result<(), OutboxError>>;

    /// Treat claims taken before `stale_before` as failed attempts
    /// (the publisher holding them is presumed dead). Returns how many were reclaimed.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Storage`] on storage failure.
    fn reclaim_stale(
        &self,
        stale_before: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<u64, OutboxError>>;

    /// Purge `published` entries delivered more than `older_than_days` ago.
    /// Entries in any other status are never removed.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Storage`] on storage failure.
    fn cleanup_old_events(
        &self,
        older_than_days: u32,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<u64, OutboxError>>;

    /// Dead-lettered entries, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Storage`] on storage failure.
    fn dead_letters(&self, limit: usize) -> BoxFuture<'_, Result<Vec<OutboxEntry>, OutboxError>>;

    /// Operator action: make a dead-lettered entry claimable again with a reset retry count.
    ///
    /// # Errors
    ///
    /// [`OutboxError::NotFound`], [`OutboxError::InvalidTransition`] or storage failure.
    fn requeue_dead_letter(&self, id: Uuid) -> BoxFuture<'_, Result<(), OutboxError>>;

    /// Entry counts per status.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Storage`] on storage failure.
    fn counts(&self) -> BoxFuture<'_, Result<OutboxCounts, OutboxError>>;
}

/// In-memory outbox table.
///
/// Not synchronized; owners wrap it in a lock together with whatever business
/// state must change atomically with it.
#[derive(Clone, Debug, Default)]
pub struct OutboxLog {
    entries: Vec<OutboxEntry>,
}

impl OutboxLog {
    /// Empty log.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Append a pending entry.
    pub fn stage(&mut self, staged: StagedEvent, now: DateTime<Utc>) -> OutboxEntry {
        let entry = OutboxEntry::from_staged(staged, now);
        self.entries.push(entry.clone());
        entry
    }

    /// Claim up to `limit` entries in delivery order.
    pub fn claim_batch(&mut self, limit: usize, now: DateTime<Utc>) -> Vec<OutboxEntry> {
        let mut candidates: Vec<usize> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_claimable())
            .map(|(i, _)| i)
            .collect();
        // Stable sort keeps staging order for identical timestamps.
        candidates.sort_by_key(|&i| (self.entries[i].occurred_at, self.entries[i].created_at));
        candidates.truncate(limit);

        candidates
            .into_iter()
            .map(|i| {
                let entry = &mut self.entries[i];
                entry.claim(now);
                entry.clone()
            })
            .collect()
    }

    /// See [`OutboxEntry::mark_published`].
    ///
    /// # Errors
    ///
    /// [`OutboxError::NotFound`] or [`OutboxError::InvalidTransition`].
    pub fn mark_published(&mut self, id: Uuid, now: DateTime<Utc>) -> Result<(), OutboxError> {
        self.get_mut(id)?.mark_published(now)
    }

    /// See [`OutboxEntry::mark_failed`].
    ///
    /// # Errors
    ///
    /// [`OutboxError::NotFound`] or [`OutboxError::InvalidTransition`].
    pub fn mark_failed(&mut self, id: Uuid, error: &str) -> Result<OutboxStatus, OutboxError> {
        self.get_mut(id)?.mark_failed(error)
    }

    /// See [`OutboxEntry::release`].
    ///
    /// # Errors
    ///
    /// [`OutboxError::NotFound`] or [`OutboxError::InvalidTransition`].
    pub fn release(&mut self, id: Uuid) -> Result<(), OutboxError> {
        self.get_mut(id)?.release()
    }

    /// Fail every claim taken before `stale_before`.
    pub fn reclaim_stale(&mut self, stale_before: DateTime<Utc>) -> u64 {
        let mut reclaimed = 0;
        for entry in &mut self.entries {
            let stale = entry.status == OutboxStatus::Processing
                && entry.claimed_at.is_some_and(|at| at < stale_before);
            if stale && entry.mark_failed("processing claim timed out").is_ok() {
                reclaimed += 1;
            }
        }
        reclaimed
    }

    /// Drop published entries older than the retention window.
    pub fn cleanup_old_events(&mut self, older_than_days: u32, now: DateTime<Utc>) -> u64 {
        let cutoff = now - Duration::days(i64::from(older_than_days));
        let before = self.entries.len();
        self.entries.retain(|e| {
            !(e.status == OutboxStatus::Published && e.published_at.is_some_and(|at| at < cutoff))
        });
        (before - self.entries.len()) as u64
    }

    /// Dead-lettered entries, oldest first.
    #[must_use]
    pub fn dead_letters(&self, limit: usize) -> Vec<OutboxEntry> {
        let mut dead: Vec<OutboxEntry> = self
            .entries
            .iter()
            .filter(|e| e.status == OutboxStatus::DeadLetter)
            .cloned()
            .collect();
        dead.sort_by_key(|e| (e.occurred_at, e.created_at));
        dead.truncate(limit);
        dead
    }

    /// See [`OutboxEntry::requeue`].
    ///
    /// # Errors
    ///
    /// [`OutboxError::NotFound`] or [`OutboxError::InvalidTransition`].
    pub fn requeue_dead_letter(&mut self, id: Uuid) -> Result<(), OutboxError> {
        self.get_mut(id)?.requeue()
    }

    /// Entry counts per status.
    #[must_use]
    pub fn counts(&self) -> OutboxCounts {
        let mut counts = OutboxCounts::default();
        for entry in &self.entries {
            counts.add(entry.status, 1);
        }
        counts
    }

    /// Look up an entry.
    #[must_use]
    pub fn get(&self, id: Uuid) -> Option<&OutboxEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// All entries in staging order.
    #[must_use]
    pub fn entries(&self) -> &[OutboxEntry] {
        &self.entries
    }

    fn get_mut(&mut self, id: Uuid) -> Result<&mut OutboxEntry, OutboxError> {
        self.entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(OutboxError::NotFound(id))
    }
}
