//! Handler turning delivered revenue events into distributions.
//!
//! Delivery is at least once; the distributor's per-period uniqueness makes a
//! redelivered `RoyaltyPeriodClosed` return the existing distribution. The
//! subscription loop itself is `tuneshare_runtime::EventConsumer`, which retries
//! the errors [`LedgerError::is_retryable`] accepts and parks the rest.

use crate::distribution::engine::{Distribution, DistributionRequest};
use crate::distribution::service::RevenueDistributor;
use crate::error::{LedgerError, Result};
use crate::events::{RevenueEvent, aggregate_types};
use futures::future::BoxFuture;
use tuneshare_core::event::EventMetadata;
use tuneshare_core::event_bus::{Envelope, EnvelopeHandler};
use tuneshare_core::outbox::{OutboxError, topic_for};

/// Handles revenue events.
#[derive(Clone)]
pub struct RevenueEventHandler {
    distributor: RevenueDistributor,
}

impl RevenueEventHandler {
    /// Handler distributing through `distributor`.
    #[must_use]
    pub const fn new(distributor: RevenueDistributor) -> Self {
        Self { distributor }
    }

    /// Topics this handler consumes.
    #[must_use]
    pub fn topics() -> Vec<String> {
        vec![topic_for(aggregate_types::REVENUE)]
    }

    /// Handle one delivered envelope. Envelopes of other aggregate types are ignored.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Outbox`] for undecodable events, plus the errors of
    /// [`RevenueDistributor::distribute`].
    pub async fn handle(&self, envelope: &Envelope) -> Result<Option<Distribution>> {
        if envelope.aggregate_type != aggregate_types::REVENUE {
            return Ok(None);
        }
        let event: RevenueEvent = envelope
            .event
            .decode()
            .map_err(|e| LedgerError::Outbox(OutboxError::from(e)))?;
        let metadata = EventMetadata::caused_by(&envelope.event.metadata, envelope.outbox_id)
            .with_actor("revenue-consumer");

        match event {
            RevenueEvent::RoyaltyPeriodClosed {
                contract_id,
                total_revenue,
                currency,
                period_start,
                period_end,
                artist_share,
            } => {
                let request = DistributionRequest {
                    contract_id,
                    total_revenue,
                    currency,
                    period_start,
                    period_end,
                    artist_share,
                };
                self.distributor.distribute(request, metadata).await.map(Some)
            }
        }
    }
}

impl EnvelopeHandler for RevenueEventHandler {
    type Error = LedgerError;

    fn topics(&self) -> Vec<String> {
        Self::topics()
    }

    fn handle_envelope<'a>(&'a self, envelope: &'a Envelope) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if let Some(distribution) = self.handle(envelope).await? {
                tracing::debug!(
                    outbox_id = %envelope.outbox_id,
                    distribution_id = %distribution.id,
                    "Revenue event handled"
                );
            }
            Ok(())
        })
    }

    fn is_retryable(error: &LedgerError) -> bool {
        error.is_retryable()
    }
}
