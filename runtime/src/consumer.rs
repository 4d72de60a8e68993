//! Subscription loop for [`EnvelopeHandler`]s.
//!
//! Every delivery ends one of three ways:
//!
//! - handled: acknowledged, the channel moves on
//! - permanent failure: parked on the topic's dead-letter topic (see
//!   [`dead_letter_topic`]) for an operator, then acknowledged
//! - transient failure: retried with backoff for as long as it stays transient;
//!   on shutdown it is left unacknowledged and delivered again later
//!
//! A delivery is never acknowledged before one of the first two outcomes, so
//! no envelope is lost to a failed handler.

use crate::retry::{RetryPolicy, retry_transient};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::watch;
use tuneshare_core::event_bus::{
    Delivery, EnvelopeHandler, EventBus, EventBusError, dead_letter_topic,
};

/// How one delivery ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Handled and acknowledged.
    Handled,
    /// Failed permanently, parked on the dead-letter topic and acknowledged.
    DeadLettered,
    /// Left unacknowledged for redelivery.
    Abandoned,
}

impl Outcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Handled => "handled",
            Self::DeadLettered => "dead_lettered",
            Self::Abandoned => "abandoned",
        }
    }
}

/// Drives one handler over a bus subscription.
pub struct EventConsumer<H> {
    handler: H,
    bus: Arc<dyn EventBus>,
    retry: RetryPolicy,
}

impl<H: EnvelopeHandler> EventConsumer<H> {
    /// Consumer feeding `bus` deliveries to `handler`, backing off per `retry`
    /// between attempts at a transient failure.
    #[must_use]
    pub fn new(handler: H, bus: Arc<dyn EventBus>, retry: RetryPolicy) -> Self {
        Self {
            handler,
            bus,
            retry,
        }
    }

    /// Consume until `shutdown` flips to `true`.
    ///
    /// Errors on individual items of the subscription are logged and skipped.
    ///
    /// # Errors
    ///
    /// [`EventBusError::SubscriptionFailed`] if the subscription cannot be
    /// opened, [`EventBusError::ConnectionFailed`] if it ends before shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), EventBusError> {
        let topics = self.handler.topics();
        let mut stream = self.bus.subscribe(topics.clone()).await?;
        tracing::info!(topics = ?topics, "Event consumer started");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                next = stream.next() => {
                    match next {
                        Some(Ok(delivery)) => {
                            self.process(delivery, &mut shutdown).await;
                        }
                        Some(Err(e)) => {
                            metrics::counter!("consumer.subscription_errors.total").increment(1);
                            tracing::warn!(error = %e, "Subscription error, skipping item");
                        }
                        None => {
                            tracing::error!(topics = ?topics, "Subscription ended unexpectedly");
                            return Err(EventBusError::ConnectionFailed(
                                "subscription ended".to_string(),
                            ));
                        }
                    }
                }
            }
        }

        tracing::info!("Event consumer stopped");
        Ok(())
    }

    /// Handle one delivery to its end; see the module docs for the outcomes.
    pub async fn process(
        &self,
        delivery: Delivery,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Outcome {
        let outcome = loop {
            let result = retry_transient(
                &self.retry,
                "handle_envelope",
                || self.handler.handle_envelope(&delivery.envelope),
                H::is_retryable,
            )
            .await;
            match result {
                Ok(()) => break Outcome::Handled,
                Err(e) if H::is_retryable(&e) => {
                    tracing::error!(
                        outbox_id = %delivery.envelope.outbox_id,
                        aggregate_id = %delivery.envelope.aggregate_id,
                        error = %e,
                        "Envelope still failing after retries"
                    );
                    if *shutdown.borrow() {
                        break Outcome::Abandoned;
                    }
                    tokio::select! {
                        _ = shutdown.changed() => break Outcome::Abandoned,
                        () = tokio::time::sleep(self.retry.max_delay) => {}
                    }
                }
                Err(e) => {
                    let reason = e.to_string();
                    break self.park(&delivery, &reason).await;
                }
            }
        };

        metrics::counter!("consumer.envelopes.total", "outcome" => outcome.as_str()).increment(1);
        if outcome == Outcome::Abandoned {
            tracing::warn!(
                outbox_id = %delivery.envelope.outbox_id,
                "Leaving envelope unacknowledged for redelivery"
            );
        } else {
            delivery.ack();
        }
        outcome
    }

    async fn park(&self, delivery: &Delivery, reason: &str) -> Outcome {
        let topic = dead_letter_topic(&delivery.topic);
        tracing::error!(
            outbox_id = %delivery.envelope.outbox_id,
            aggregate_id = %delivery.envelope.aggregate_id,
            event_type = delivery.envelope.event_type(),
            dead_letter_topic = %topic,
            error = reason,
            "Envelope cannot be handled, parking it"
        );
        let parked: Result<(), EventBusError> = retry_transient(
            &self.retry,
            "park_envelope",
            || self.bus.publish(&topic, &delivery.envelope),
            |_| true,
        )
        .await;
        match parked {
            Ok(()) => Outcome::DeadLettered,
            Err(e) => {
                tracing::error!(
                    outbox_id = %delivery.envelope.outbox_id,
                    error = %e,
                    "Could not park envelope"
                );
                Outcome::Abandoned
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use std::sync::Mutex;
    use std::time::Duration;
    use tuneshare_core::event::{EventMetadata, SerializedEvent};
    use tuneshare_core::event_bus::{Acknowledgement, Envelope};
    use tuneshare_core::stream::AggregateId;
    use tuneshare_core::{Utc, Uuid};
    use tuneshare_testing::InMemoryEventBus;

    #[derive(Debug, Clone, Copy)]
    enum Failure {
        Transient,
        Permanent,
    }

    impl std::fmt::Display for Failure {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    /// Fails with the scripted errors first, then succeeds.
    struct Scripted {
        script: Mutex<Vec<Failure>>,
        handled: Mutex<Vec<Uuid>>,
    }

    impl Scripted {
        fn new(script: Vec<Failure>) -> Self {
            Self {
                script: Mutex::new(script),
                handled: Mutex::new(Vec::new()),
            }
        }
    }

    impl EnvelopeHandler for Scripted {
        type Error = Failure;

        fn topics(&self) -> Vec<String> {
            vec!["revenue-events".into()]
        }

        fn handle_envelope<'a>(
            &'a self,
            envelope: &'a Envelope,
        ) -> BoxFuture<'a, Result<(), Failure>> {
            Box::pin(async move {
                let mut script = self.script.lock().unwrap();
                if script.is_empty() {
                    self.handled.lock().unwrap().push(envelope.outbox_id);
                    return Ok(());
                }
                Err(script.remove(0))
            })
        }

        fn is_retryable(error: &Failure) -> bool {
            matches!(error, Failure::Transient)
        }
    }

    fn fast() -> RetryPolicy {
        RetryPolicy::builder()
            .max_retries(1)
            .initial_delay(Duration::from_millis(1))
            .max_delay(Duration::from_millis(1))
            .jitter(false)
            .build()
    }

    fn delivery() -> (Delivery, Acknowledgement) {
        Delivery::new(
            "revenue-events",
            Envelope {
                outbox_id: Uuid::new_v4(),
                aggregate_id: AggregateId::new("contract-1"),
                aggregate_type: "revenue".into(),
                event: SerializedEvent::new(
                    "RoyaltyPeriodClosed.v1".into(),
                    vec![],
                    EventMetadata::default(),
                ),
                occurred_at: Utc::now(),
            },
        )
    }

    fn consumer(script: Vec<Failure>) -> (EventConsumer<Scripted>, InMemoryEventBus) {
        let bus = InMemoryEventBus::new();
        (
            EventConsumer::new(Scripted::new(script), Arc::new(bus.clone()), fast()),
            bus,
        )
    }

    #[tokio::test]
    async fn transient_failures_are_retried_past_one_backoff_round() {
        let (consumer, _bus) = consumer(vec![Failure::Transient; 3]);
        let (_tx, mut shutdown) = watch::channel(false);
        let (delivery, mut acked) = delivery();
        let id = delivery.envelope.outbox_id;

        assert_eq!(consumer.process(delivery, &mut shutdown).await, Outcome::Handled);
        assert_eq!(acked.try_recv(), Ok(Some(())));
        assert_eq!(*consumer.handler.handled.lock().unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn permanent_failure_is_parked_then_acknowledged() {
        let (consumer, bus) = consumer(vec![Failure::Permanent]);
        let (_tx, mut shutdown) = watch::channel(false);
        let (delivery, mut acked) = delivery();
        let id = delivery.envelope.outbox_id;

        assert_eq!(consumer.process(delivery, &mut shutdown).await, Outcome::DeadLettered);
        assert_eq!(acked.try_recv(), Ok(Some(())));
        let parked = bus.published_to("revenue-events-dead-letter");
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].outbox_id, id);
    }

    #[tokio::test]
    async fn unparkable_envelope_is_left_unacknowledged() {
        let (consumer, bus) = consumer(vec![Failure::Permanent]);
        bus.fail_always();
        let (_tx, mut shutdown) = watch::channel(false);
        let (delivery, mut acked) = delivery();

        assert_eq!(consumer.process(delivery, &mut shutdown).await, Outcome::Abandoned);
        assert!(acked.try_recv().is_err());
    }

    #[tokio::test]
    async fn shutdown_abandons_a_still_failing_envelope() {
        let (consumer, _bus) = consumer(vec![Failure::Transient; 100]);
        let (tx, mut shutdown) = watch::channel(false);
        tx.send_replace(true);
        let (delivery, mut acked) = delivery();

        assert_eq!(consumer.process(delivery, &mut shutdown).await, Outcome::Abandoned);
        assert!(acked.try_recv().is_err());
        assert!(consumer.handler.handled.lock().unwrap().is_empty());
    }
}
