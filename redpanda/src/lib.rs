//! Redpanda delivery channel for Tuneshare.
//!
//! [`RedpandaEventBus`] implements the core [`EventBus`] trait over rdkafka, so
//! it works against Redpanda or any other Kafka-compatible broker. The outbox
//! publisher hands it one [`Envelope`] per claimed outbox entry.
//!
//! # Wire format
//!
//! - Payload: the envelope as JSON
//! - Key: the aggregate ID, so every event of one aggregate lands on the same
//!   partition and keeps its order
//! - Headers: `outbox-id` and `event-type`, for consumers that route or
//!   deduplicate without decoding the payload
//!
//! # Delivery Semantics
//!
//! **At-least-once** on both sides. The publisher only marks an outbox entry
//! published after the broker acknowledges it. A subscription hands out one
//! [`Delivery`] at a time and commits its offset only after the subscriber
//! acknowledges it; a delivery dropped unacknowledged stops the subscription
//! uncommitted, so the group redelivers it. Consumers deduplicate on
//! [`Envelope::outbox_id`].
//!
//! # Example
//!
//! ```no_run
//! use tuneshare_core::event_bus::EventBus;
//! use tuneshare_redpanda::RedpandaEventBus;
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = RedpandaEventBus::builder()
//!     .brokers("localhost:9092")
//!     .consumer_group("revenue-distributor")
//!     .build()?;
//!
//! let mut stream = bus.subscribe(vec!["revenue-events".into()]).await?;
//! while let Some(delivery) = stream.next().await {
//!     let delivery = delivery?;
//!     println!("{}", delivery.envelope.event_type());
//!     delivery.ack();
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use futures::future::BoxFuture;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::time::{Duration, Instant};
use tuneshare_core::event_bus::{Delivery, Envelope, EnvelopeStream, EventBus, EventBusError};

/// Header carrying the outbox entry ID.
pub const OUTBOX_ID_HEADER: &str = "outbox-id";
/// Header carrying the versioned event type.
pub const EVENT_TYPE_HEADER: &str = "event-type";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Encode an envelope for the wire.
///
/// # Errors
///
/// [`EventBusError::PublishFailed`] if the envelope cannot be serialized.
pub fn encode(topic: &str, envelope: &Envelope) -> Result<Vec<u8>, EventBusError> {
    serde_json::to_vec(envelope).map_err(|e| EventBusError::PublishFailed {
        topic: topic.to_string(),
        reason: format!("Failed to serialize envelope: {e}"),
    })
}

/// Decode a payload received from the wire.
///
/// # Errors
///
/// [`EventBusError::DeserializationFailed`] if the payload is not an envelope.
pub fn decode(payload: &[u8]) -> Result<Envelope, EventBusError> {
    serde_json::from_slice(payload)
        .map_err(|e| EventBusError::DeserializationFailed(format!("Invalid envelope: {e}")))
}

/// Kafka-compatible event bus.
///
/// ```no_run
/// use tuneshare_redpanda::RedpandaEventBus;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = RedpandaEventBus::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .producer_acks("all")
///     .compression("lz4")
///     .topic_prefix("staging.")
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaEventBus {
    producer: FutureProducer,
    brokers: String,
    client_id: String,
    topic_prefix: String,
    timeout: Duration,
    consumer_group: Option<String>,
    auto_offset_reset: String,
}

impl RedpandaEventBus {
    /// Event bus with default settings.
    ///
    /// # Errors
    ///
    /// [`EventBusError::ConnectionFailed`] if the producer cannot be created.
    pub fn new(brokers: &str) -> Result<Self, EventBusError> {
        Self::builder().brokers(brokers).build()
    }

    /// Builder for custom settings.
    #[must_use]
    pub fn builder() -> RedpandaEventBusBuilder {
        RedpandaEventBusBuilder::default()
    }

    /// Bootstrap servers.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    /// Topic name on the broker for a routing key.
    #[must_use]
    pub fn physical_topic(&self, topic: &str) -> String {
        format!("{}{topic}", self.topic_prefix)
    }

    /// Routing key for a topic name on the broker.
    #[must_use]
    pub fn logical_topic(&self, physical: &str) -> String {
        logical_topic(&self.topic_prefix, physical)
    }

    fn consumer_group_for(&self, topics: &[String]) -> String {
        self.consumer_group.clone().unwrap_or_else(|| {
            let mut sorted = topics.to_vec();
            sorted.sort();
            format!("{}-{}", self.client_id, sorted.join("-"))
        })
    }
}

/// Builder for [`RedpandaEventBus`].
#[derive(Default)]
pub struct RedpandaEventBusBuilder {
    brokers: Option<String>,
    client_id: Option<String>,
    topic_prefix: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    consumer_group: Option<String>,
    auto_offset_reset: Option<String>,
}

impl RedpandaEventBusBuilder {
    /// Comma-separated bootstrap servers (required).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Client ID reported to the broker. Default: `tuneshare`.
    #[must_use]
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Prefix added to every topic name, e.g. per environment. Default: none.
    #[must_use]
    pub fn topic_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.topic_prefix = Some(prefix.into());
        self
    }

    /// Producer acknowledgment mode: `"0"`, `"1"` or `"all"`. Default: `"all"`.
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Compression codec: `none`, `gzip`, `snappy`, `lz4` or `zstd`. Default: `none`.
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// How long a publish may wait for the broker. Default: 5 seconds.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Consumer group for subscriptions.
    ///
    /// Instances sharing a group split the partitions between them. Without
    /// one, the group is derived from the client ID and the subscribed topics.
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }

    /// Where a new consumer group starts: `earliest`, `latest` or `error`. Default: `earliest`.
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Create the producer.
    ///
    /// # Errors
    ///
    /// [`EventBusError::ConnectionFailed`] when brokers are missing or the
    /// producer cannot be created.
    pub fn build(self) -> Result<RedpandaEventBus, EventBusError> {
        let brokers = self
            .brokers
            .filter(|b| !b.trim().is_empty())
            .ok_or_else(|| EventBusError::ConnectionFailed("Brokers not configured".to_string()))?;
        let client_id = self.client_id.unwrap_or_else(|| "tuneshare".to_string());
        let acks = self.producer_acks.unwrap_or_else(|| "all".to_string());
        let compression = self.compression.unwrap_or_else(|| "none".to_string());
        let timeout = self.timeout.unwrap_or(DEFAULT_TIMEOUT);

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("client.id", &client_id)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", &acks)
            .set("enable.idempotence", if acks == "all" { "true" } else { "false" })
            .set("compression.type", &compression)
            .create()
            .map_err(|e| EventBusError::ConnectionFailed(format!("Failed to create producer: {e}")))?;

        let auto_offset_reset = self
            .auto_offset_reset
            .unwrap_or_else(|| "earliest".to_string());
        tracing::info!(
            brokers = %brokers,
            client_id = %client_id,
            acks = %acks,
            compression = %compression,
            auto_offset_reset = %auto_offset_reset,
            "Redpanda event bus created"
        );

        Ok(RedpandaEventBus {
            producer,
            brokers,
            client_id,
            topic_prefix: self.topic_prefix.unwrap_or_default(),
            timeout,
            consumer_group: self.consumer_group,
            auto_offset_reset,
        })
    }
}

impl EventBus for RedpandaEventBus {
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        envelope: &'a Envelope,
    ) -> BoxFuture<'a, Result<(), EventBusError>> {
        Box::pin(async move {
            let topic = self.physical_topic(topic);
            let payload = encode(&topic, envelope)?;
            let outbox_id = envelope.outbox_id.to_string();
            let headers = OwnedHeaders::new()
                .insert(Header {
                    key: OUTBOX_ID_HEADER,
                    value: Some(outbox_id.as_str()),
                })
                .insert(Header {
                    key: EVENT_TYPE_HEADER,
                    value: Some(envelope.event_type()),
                });
            let record = FutureRecord::to(&topic)
                .payload(&payload)
                .key(envelope.aggregate_id.as_str())
                .headers(headers);

            let started = Instant::now();
            match self.producer.send(record, Timeout::After(self.timeout)).await {
                Ok((partition, offset)) => {
                    metrics::histogram!("redpanda.publish.duration_seconds")
                        .record(started.elapsed().as_secs_f64());
                    tracing::debug!(
                        topic = %topic,
                        partition = partition,
                        offset = offset,
                        outbox_id = %envelope.outbox_id,
                        event_type = envelope.event_type(),
                        "Envelope published"
                    );
                    Ok(())
                }
                Err((kafka_error, _)) => {
                    tracing::warn!(
                        topic = %topic,
                        outbox_id = %envelope.outbox_id,
                        error = %kafka_error,
                        "Failed to publish envelope"
                    );
                    Err(EventBusError::PublishFailed {
                        topic,
                        reason: kafka_error.to_string(),
                    })
                }
            }
        })
    }

    fn subscribe(&self, topics: Vec<String>) -> BoxFuture<'_, Result<EnvelopeStream, EventBusError>> {
        Box::pin(async move {
            let topics: Vec<String> = topics.iter().map(|t| self.physical_topic(t)).collect();
            let group = self.consumer_group_for(&topics);

            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &self.brokers)
                .set("client.id", &self.client_id)
                .set("group.id", &group)
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", &self.auto_offset_reset)
                .set("session.timeout.ms", "6000")
                .set("enable.partition.eof", "false")
                .create()
                .map_err(|e| EventBusError::SubscriptionFailed {
                    topics: topics.clone(),
                    reason: format!("Failed to create consumer: {e}"),
                })?;

            let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
            consumer
                .subscribe(&topic_refs)
                .map_err(|e| EventBusError::SubscriptionFailed {
                    topics: topics.clone(),
                    reason: format!("Failed to subscribe: {e}"),
                })?;

            tracing::info!(
                topics = ?topics,
                consumer_group = %group,
                "Subscribed to topics"
            );

            let (tx, rx) = tokio::sync::mpsc::channel(1);
            tokio::spawn(forward(consumer, tx, self.topic_prefix.clone()));

            let stream = async_stream::stream! {
                let mut rx = rx;
                while let Some(result) = rx.recv().await {
                    yield result;
                }
            };
            Ok(Box::pin(stream) as EnvelopeStream)
        })
    }
}

/// Pump messages from the consumer into the subscriber's channel, one at a time.
///
/// An offset is committed only after its delivery is acknowledged. A delivery
/// dropped unacknowledged stops the pump uncommitted, which hands the partition
/// back to the group from that offset. Undecodable messages are committed once
/// the error has been handed over, as no retry can decode them.
async fn forward(
    consumer: StreamConsumer,
    tx: tokio::sync::mpsc::Sender<Result<Delivery, EventBusError>>,
    topic_prefix: String,
) {
    use futures::StreamExt;
    use rdkafka::consumer::CommitMode;

    let mut stream = consumer.stream();
    while let Some(received) = stream.next().await {
        let message = match received {
            Ok(message) => message,
            Err(e) => {
                let err = EventBusError::TransportError(format!("Failed to receive message: {e}"));
                if tx.send(Err(err)).await.is_err() {
                    break;
                }
                continue;
            }
        };

        let decoded = match message.payload() {
            Some(payload) => decode(payload),
            None => Err(EventBusError::DeserializationFailed(
                "Message has no payload".to_string(),
            )),
        };
        match decoded {
            Ok(envelope) => {
                let topic = logical_topic(&topic_prefix, message.topic());
                let (delivery, acked) = Delivery::new(topic, envelope);
                if tx.send(Ok(delivery)).await.is_err() {
                    tracing::debug!("Subscriber dropped, stopping consumer");
                    break;
                }
                if acked.await.is_err() {
                    tracing::warn!(
                        topic = message.topic(),
                        partition = message.partition(),
                        offset = message.offset(),
                        "Delivery not acknowledged, stopping consumer without commit"
                    );
                    break;
                }
            }
            Err(e) => {
                metrics::counter!("redpanda.decode_failures.total").increment(1);
                tracing::warn!(
                    topic = message.topic(),
                    partition = message.partition(),
                    offset = message.offset(),
                    outbox_id = ?header(&message, OUTBOX_ID_HEADER),
                    error = %e,
                    "Undecodable message"
                );
                if tx.send(Err(e)).await.is_err() {
                    tracing::debug!("Subscriber dropped, stopping consumer");
                    break;
                }
            }
        }

        if let Err(e) = consumer.commit_message(&message, CommitMode::Async) {
            tracing::warn!(
                topic = message.topic(),
                partition = message.partition(),
                offset = message.offset(),
                error = %e,
                "Failed to commit offset (message may be redelivered)"
            );
        }
    }
    tracing::debug!("Consumer task exiting");
}

fn logical_topic(prefix: &str, physical: &str) -> String {
    physical.strip_prefix(prefix).unwrap_or(physical).to_string()
}

fn header<M: Message>(message: &M, key: &str) -> Option<String> {
    message.headers().and_then(|headers| {
        headers
            .iter()
            .find(|h| h.key == key)
            .and_then(|h| h.value)
            .map(|v| String::from_utf8_lossy(v).into_owned())
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tuneshare_core::event::{EventMetadata, SerializedEvent};
    use tuneshare_core::stream::AggregateId;

    fn envelope() -> Envelope {
        Envelope {
            outbox_id: tuneshare_core::Uuid::new_v4(),
            aggregate_id: AggregateId::new("distribution-1"),
            aggregate_type: "distribution".into(),
            event: SerializedEvent::new(
                "RevenueDistributed.v1".into(),
                vec![7, 8, 9],
                EventMetadata::correlated(),
            ),
            occurred_at: tuneshare_core::Utc::now(),
        }
    }

    #[test]
    fn redpanda_event_bus_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<RedpandaEventBus>();
        assert_sync::<RedpandaEventBus>();
    }

    #[test]
    fn wire_payload_is_the_json_envelope() {
        let envelope = envelope();
        let payload = encode("distribution-events", &envelope).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(json["aggregate_type"], "distribution");
        assert_eq!(decode(&payload).unwrap(), envelope);
    }

    #[test]
    fn garbage_payload_is_a_deserialization_error() {
        assert!(matches!(
            decode(b"not json"),
            Err(EventBusError::DeserializationFailed(_))
        ));
    }

    #[test]
    fn build_requires_brokers() {
        let result = RedpandaEventBus::builder().build();
        assert!(matches!(result, Err(EventBusError::ConnectionFailed(_))));
    }

    #[tokio::test]
    async fn topics_carry_the_configured_prefix() {
        let bus = RedpandaEventBus::builder()
            .brokers("localhost:9092")
            .topic_prefix("staging.")
            .client_id("worker-1")
            .build()
            .unwrap();
        assert_eq!(bus.physical_topic("revenue-events"), "staging.revenue-events");
        assert_eq!(bus.logical_topic("staging.revenue-events"), "revenue-events");
        assert_eq!(bus.logical_topic("other-events"), "other-events");
        assert_eq!(
            bus.consumer_group_for(&["b".into(), "a".into()]),
            "worker-1-a-b"
        );
    }
}
