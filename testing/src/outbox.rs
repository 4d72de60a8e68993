//! Standalone in-memory outbox.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap on lock poisoning

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::sync::{Arc, Mutex};
use tuneshare_core::environment::{Clock, SystemClock};
use tuneshare_core::outbox::{
    OutboxCounts, OutboxEntry, OutboxError, OutboxLog, OutboxStatus, OutboxStore, StagedEvent,
};
use uuid::Uuid;

/// [`OutboxStore`] over a shared [`OutboxLog`]. Clones share the same table.
#[derive(Clone)]
pub struct InMemoryOutbox {
    log: Arc<Mutex<OutboxLog>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryOutbox {
    /// Empty outbox stamping entries with wall-clock time.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Empty outbox stamping entries with `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            log: Arc::new(Mutex::new(OutboxLog::new())),
            clock,
        }
    }

    /// Copy of one entry.
    #[must_use]
    pub fn entry(&self, id: Uuid) -> Option<OutboxEntry> {
        self.log.lock().unwrap().get(id).cloned()
    }

    /// Copy of every entry in staging order.
    #[must_use]
    pub fn entries(&self) -> Vec<OutboxEntry> {
        self.log.lock().unwrap().entries().to_vec()
    }

    /// Entries currently in `status`.
    #[must_use]
    pub fn with_status(&self, status: OutboxStatus) -> Vec<OutboxEntry> {
        self.log
            .lock()
            .unwrap()
            .entries()
            .iter()
            .filter(|e| e.status == status)
            .cloned()
            .collect()
    }
}

impl Default for InMemoryOutbox {
    fn default() -> Self {
        Self::new()
    }
}

impl OutboxStore for InMemoryOutbox {
    fn stage(&self, staged: StagedEvent) -> BoxFuture<'_, Result<OutboxEntry, OutboxError>> {
        Box::pin(async move {
            let now = self.clock.now();
            Ok(self.log.lock().unwrap().stage(staged, now))
        })
    }

    fn claim_batch(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Vec<OutboxEntry>, OutboxError>> {
        Box::pin(async move { Ok(self.log.lock().unwrap().claim_batch(limit, now)) })
    }

    fn mark_published(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<(), OutboxError>> {
        Box::pin(async move { self.log.lock().unwrap().mark_published(id, now) })
    }

    fn mark_failed(
        &self,
        id: Uuid,
        error: String,
    ) -> BoxFuture<'_, Result<OutboxStatus, OutboxError>> {
        Box::pin(async move { self.log.lock().unwrap().mark_failed(id, &error) })
    }

    fn release(&self, id: Uuid) -> BoxFuture<'_, Result<(), OutboxError>> {
        Box::pin(async move { self.log.lock().unwrap().release(id) })
    }

    fn reclaim_stale(
        &self,
        stale_before: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<u64, OutboxError>> {
        Box::pin(async move { Ok(self.log.lock().unwrap().reclaim_stale(stale_before)) })
    }

    fn cleanup_old_events(
        &self,
        older_than_days: u32,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<u64, OutboxError>> {
        Box::pin(async move {
            Ok(self
                .log
                .lock()
                .unwrap()
                .cleanup_old_events(older_than_days, now))
        })
    }

    fn dead_letters(&self, limit: usize) -> BoxFuture<'_, Result<Vec<OutboxEntry>, OutboxError>> {
        Box::pin(async move { Ok(self.log.lock().unwrap().dead_letters(limit)) })
    }

    fn requeue_dead_letter(&self, id: Uuid) -> BoxFuture<'_, Result<(), OutboxError>> {
        Box::pin(async move { self.log.lock().unwrap().requeue_dead_letter(id) })
    }

    fn counts(&self) -> BoxFuture<'_, Result<OutboxCounts, OutboxError>> {
        Box::pin(async move { Ok(self.log.lock().unwrap().counts()) })
    }
}
