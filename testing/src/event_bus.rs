//! In-process delivery channel with failure injection.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap on lock poisoning

use futures::StreamExt;
use futures::future::BoxFuture;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tuneshare_core::event_bus::{Delivery, Envelope, EnvelopeStream, EventBus, EventBusError};
use uuid::Uuid;

#[derive(Debug, Default)]
struct Faults {
    fail_next: u32,
    fail_always: bool,
    failing_topics: HashSet<String>,
}

/// Event bus that records every successful publish and fans envelopes out to
/// subscribers. Clones share state.
///
/// Like a broker partition, a subscription hands out the next envelope only
/// after the previous delivery is acknowledged, and ends at the first one
/// dropped unacknowledged.
///
/// ```
/// use tuneshare_testing::InMemoryEventBus;
///
/// let bus = InMemoryEventBus::new();
/// bus.fail_next(1);
/// bus.fail_topic("revenue-events");
/// assert_eq!(bus.publish_attempts(), 0);
/// ```
#[derive(Clone, Debug)]
pub struct InMemoryEventBus {
    published: Arc<Mutex<Vec<(String, Envelope)>>>,
    attempts: Arc<Mutex<u64>>,
    acknowledged: Arc<Mutex<Vec<Uuid>>>,
    faults: Arc<Mutex<Faults>>,
    sender: broadcast::Sender<(String, Envelope)>,
}

impl InMemoryEventBus {
    /// Healthy bus.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            published: Arc::new(Mutex::new(Vec::new())),
            attempts: Arc::new(Mutex::new(0)),
            acknowledged: Arc::new(Mutex::new(Vec::new())),
            faults: Arc::new(Mutex::new(Faults::default())),
            sender,
        }
    }

    /// Fail the next `n` publishes, whatever the topic.
    pub fn fail_next(&self, n: u32) {
        self.faults.lock().unwrap().fail_next = n;
    }

    /// Fail every publish until [`heal`](Self::heal) is called.
    pub fn fail_always(&self) {
        self.faults.lock().unwrap().fail_always = true;
    }

    /// Fail publishes to one topic.
    pub fn fail_topic(&self, topic: impl Into<String>) {
        self.faults
            .lock()
            .unwrap()
            .failing_topics
            .insert(topic.into());
    }

    /// Clear all injected faults.
    pub fn heal(&self) {
        *self.faults.lock().unwrap() = Faults::default();
    }

    /// Every successfully published `(topic, envelope)` in order.
    #[must_use]
    pub fn published(&self) -> Vec<(String, Envelope)> {
        self.published.lock().unwrap().clone()
    }

    /// Envelopes published to `topic`.
    #[must_use]
    pub fn published_to(&self, topic: &str) -> Vec<Envelope> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Publish calls made, including failed ones.
    #[must_use]
    pub fn publish_attempts(&self) -> u64 {
        *self.attempts.lock().unwrap()
    }

    /// Open subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Outbox IDs of acknowledged deliveries, in order.
    #[must_use]
    pub fn acknowledged(&self) -> Vec<Uuid> {
        self.acknowledged.lock().unwrap().clone()
    }

    fn should_fail(&self, topic: &str) -> bool {
        let mut faults = self.faults.lock().unwrap();
        if faults.fail_always || faults.failing_topics.contains(topic) {
            return true;
        }
        if faults.fail_next > 0 {
            faults.fail_next -= 1;
            return true;
        }
        false
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus for InMemoryEventBus {
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        envelope: &'a Envelope,
    ) -> BoxFuture<'a, Result<(), EventBusError>> {
        Box::pin(async move {
            *self.attempts.lock().unwrap() += 1;
            if self.should_fail(topic) {
                return Err(EventBusError::PublishFailed {
                    topic: topic.to_string(),
                    reason: "injected failure".to_string(),
                });
            }
            self.published
                .lock()
                .unwrap()
                .push((topic.to_string(), envelope.clone()));
            // No receivers is fine; the publish is still recorded.
            let _ = self.sender.send((topic.to_string(), envelope.clone()));
            Ok(())
        })
    }

    fn subscribe(
        &self,
        topics: Vec<String>,
    ) -> BoxFuture<'_, Result<EnvelopeStream, EventBusError>> {
        Box::pin(async move {
            let mut receiver = self.sender.subscribe();
            let acknowledged = self.acknowledged.clone();
            let wanted: HashSet<String> = topics.into_iter().collect();
            let stream = async_stream::stream! {
                loop {
                    match receiver.recv().await {
                        Ok((topic, envelope)) => {
                            if !wanted.contains(&topic) {
                                continue;
                            }
                            let outbox_id = envelope.outbox_id;
                            let (delivery, acked) = Delivery::new(topic, envelope);
                            yield Ok(delivery);
                            if acked.await.is_err() {
                                tracing::debug!(%outbox_id, "Delivery dropped unacknowledged");
                                break;
                            }
                            acknowledged.lock().unwrap().push(outbox_id);
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            yield Err(EventBusError::TransportError(format!(
                                "subscriber lagged, {skipped} envelopes dropped"
                            )));
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            };
            Ok(stream.boxed())
        })
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tuneshare_core::event::{EventMetadata, SerializedEvent};
    use tuneshare_core::stream::AggregateId;
    use uuid::Uuid;

    fn envelope() -> Envelope {
        Envelope {
            outbox_id: Uuid::new_v4(),
            aggregate_id: AggregateId::new("contract-1"),
            aggregate_type: "royalty_period".into(),
            event: SerializedEvent::new("X.v1".into(), vec![], EventMetadata::default()),
            occurred_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn fail_next_counts_down() {
        let bus = InMemoryEventBus::new();
        bus.fail_next(2);
        let e = envelope();

        assert!(bus.publish("t", &e).await.is_err());
        assert!(bus.publish("t", &e).await.is_err());
        assert!(bus.publish("t", &e).await.is_ok());
        assert_eq!(bus.publish_attempts(), 3);
        assert_eq!(bus.published().len(), 1);
    }

    #[tokio::test]
    async fn failing_topic_leaves_others_alone() {
        let bus = InMemoryEventBus::new();
        bus.fail_topic("bad");
        let e = envelope();

        assert!(bus.publish("bad", &e).await.is_err());
        assert!(bus.publish("good", &e).await.is_ok());
        bus.heal();
        assert!(bus.publish("bad", &e).await.is_ok());
        assert_eq!(bus.published_to("bad").len(), 1);
    }

    #[tokio::test]
    async fn subscribers_only_see_their_topics() {
        let bus = InMemoryEventBus::new();
        let mut stream = bus
            .subscribe(vec!["revenue-events".to_string()])
            .await
            .expect("subscribe");

        let skipped = envelope();
        let wanted = envelope();
        bus.publish("other-events", &skipped).await.expect("publish");
        bus.publish("revenue-events", &wanted).await.expect("publish");

        let received = stream.next().await.expect("item").expect("envelope");
        assert_eq!(received.topic, "revenue-events");
        assert_eq!(received.envelope.outbox_id, wanted.outbox_id);
    }

    #[tokio::test]
    async fn next_delivery_waits_for_the_previous_ack() {
        let bus = InMemoryEventBus::new();
        let mut stream = bus
            .subscribe(vec!["revenue-events".to_string()])
            .await
            .expect("subscribe");
        let (first, second) = (envelope(), envelope());
        bus.publish("revenue-events", &first).await.expect("publish");
        bus.publish("revenue-events", &second).await.expect("publish");

        stream.next().await.expect("item").expect("delivery").ack();
        let next = stream.next().await.expect("item").expect("delivery");
        assert_eq!(next.envelope.outbox_id, second.outbox_id);
        assert_eq!(bus.acknowledged(), vec![first.outbox_id]);

        drop(next);
        assert!(stream.next().await.is_none());
        assert_eq!(bus.acknowledged(), vec![first.outbox_id]);
    }
}
