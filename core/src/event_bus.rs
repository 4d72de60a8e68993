//! Delivery channel abstraction used by the outbox publisher.
//!
//! The outbox publisher hands every claimed entry to an [`EventBus`] as an
//! [`Envelope`]. Delivery is at-least-once: consumers must deduplicate on
//! [`Envelope::outbox_id`]. Within one aggregate, events are published with the
//! aggregate ID as partition key so they keep their order.
//!
//! Subscribers receive each envelope wrapped in a [`Delivery`]. The channel
//! moves past an envelope only once its delivery is acknowledged; a delivery
//! dropped without [`Delivery::ack`] is delivered again.
//!
//! # Topic Naming
//!
//! Topics follow `{aggregate-type}-events` (see [`crate::outbox::topic_for`]):
//! `reward-pool-events`, `distribution-events`, `payment-batch-events`,
//! `revenue-events`.
//!
//! # Implementations
//!
//! - `InMemoryEventBus` (in `tuneshare-testing`): in-process, with failure injection
//! - `RedpandaEventBus` (in `tuneshare-redpanda`): Kafka-compatible broker

use crate::event::SerializedEvent;
use crate::stream::AggregateId;
use chrono::{DateTime, Utc};
use futures::channel::oneshot;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur during event bus operations.
#[derive(Error, Debug, Clone)]
pub enum EventBusError {
    /// Could not reach the channel.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The channel rejected or timed out a publish.
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// Topic being published to.
        topic: String,
        /// Failure reason.
        reason: String,
    },

    /// Subscribing failed.
    #[error("Subscription failed for topics {topics:?}: {reason}")]
    SubscriptionFailed {
        /// Requested topics.
        topics: Vec<String>,
        /// Failure reason.
        reason: String,
    },

    /// A received message could not be decoded.
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    /// Transport-level failure while consuming.
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// The message published for one outbox entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Outbox entry ID; consumers deduplicate on it.
    pub outbox_id: Uuid,
    /// Aggregate the event is about; used as the partition key.
    pub aggregate_id: AggregateId,
    /// Aggregate kind.
    pub aggregate_type: String,
    /// Encoded event with its metadata.
    pub event: SerializedEvent,
    /// When the business change happened.
    pub occurred_at: DateTime<Utc>,
}

impl Envelope {
    /// Versioned event type name.
    #[must_use]
    pub fn event_type(&self) -> &str {
        &self.event.event_type
    }
}

/// Topic that consumers park envelopes on when they cannot ever handle them.
#[must_use]
pub fn dead_letter_topic(topic: &str) -> String {
    format!("{topic}-dead-letter")
}

/// One envelope handed to a subscriber.
#[derive(Debug)]
pub struct Delivery {
    /// Logical topic it arrived on.
    pub topic: String,
    /// The delivered envelope.
    pub envelope: Envelope,
    ack: Option<oneshot::Sender<()>>,
}

/// Resolves once the matching [`Delivery`] is acknowledged, or fails with
/// [`oneshot::Canceled`] if it is dropped unacknowledged.
pub type Acknowledgement = oneshot::Receiver<()>;

impl Delivery {
    /// Delivery of `envelope` and the channel's end of its acknowledgement.
    #[must_use]
    pub fn new(topic: impl Into<String>, envelope: Envelope) -> (Self, Acknowledgement) {
        let (tx, rx) = oneshot::channel();
        let delivery = Self {
            topic: topic.into(),
            envelope,
            ack: Some(tx),
        };
        (delivery, rx)
    }

    /// Confirm the envelope is handled; the channel may now move past it.
    pub fn ack(mut self) {
        if let Some(tx) = self.ack.take() {
            // The channel may already be gone; nothing left to confirm to.
            let _ = tx.send(());
        }
    }
}

/// Stream of deliveries.
pub type EnvelopeStream = BoxStream<'static, Result<Delivery, EventBusError>>;

/// Publish/subscribe channel.
///
/// Uses boxed futures so publishers can hold an `Arc<dyn EventBus>`.
pub trait EventBus: Send + Sync {
    /// Publish one envelope to `topic`, keyed by its aggregate ID.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::PublishFailed`] or [`EventBusError::ConnectionFailed`]
    /// when the channel does not acknowledge the message.
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        envelope: &'a Envelope,
    ) -> BoxFuture<'a, Result<(), EventBusError>>;

    /// Subscribe to `topics`.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::SubscriptionFailed`] if the subscription cannot be set up.
    fn subscribe(&self, topics: Vec<String>) -> BoxFuture<'_, Result<EnvelopeStream, EventBusError>>;
}

/// Application side of a subscription, driven by a consumer loop.
pub trait EnvelopeHandler: Send + Sync {
    /// Handling failure.
    type Error: std::fmt::Display + Send + Sync;

    /// Topics to subscribe to.
    fn topics(&self) -> Vec<String>;

    /// Handle one envelope. Must be idempotent per [`Envelope::outbox_id`].
    ///
    /// # Errors
    ///
    /// Whatever the handler fails with; see [`EnvelopeHandler::is_retryable`].
    fn handle_envelope<'a>(
        &'a self,
        envelope: &'a Envelope,
    ) -> BoxFuture<'a, Result<(), Self::Error>>;

    /// Whether handling the same envelope again may succeed.
    fn is_retryable(error: &Self::Error) -> bool;
}
