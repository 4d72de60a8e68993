//! Event trait and the serialized forms events take on their way to storage.
//!
//! Domain events are plain `serde` types. They are encoded with `bincode` for the
//! event store and the outbox, and travel with [`EventMetadata`] that links them
//! to the request that caused them.
//!
//! # Example
//!
//! ```
//! use tuneshare_core::event::{Event, EventMetadata, SerializedEvent};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Clone, Debug, Serialize, Deserialize)]
//! enum PoolEvent {
//!     Opened { total: u64 },
//!     Depleted { remaining: u64 },
//! }
//!
//! impl Event for PoolEvent {
//!     fn event_type(&self) -> &'static str {
//!         match self {
//!             PoolEvent::Opened { .. } => "PoolOpened.v1",
//!             PoolEvent::Depleted { .. } => "PoolDepleted.v1",
//!         }
//!     }
//! }
//!
//! let serialized = SerializedEvent::from_event(
//!     &PoolEvent::Opened { total: 100 },
//!     EventMetadata::default(),
//! ).unwrap();
//! assert_eq!(serialized.event_type, "PoolOpened.v1");
//! ```

use crate::stream::{AggregateId, Version};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised while encoding or decoding events.
#[derive(Error, Debug)]
pub enum EventError {
    /// The event could not be encoded.
    #[error("Failed to serialize event: {0}")]
    SerializationError(String),

    /// The bytes could not be decoded into the requested event type.
    #[error("Failed to deserialize event: {0}")]
    DeserializationError(String),

    /// The stored event type has no decoder.
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),
}

/// An immutable fact that can be persisted and replayed.
///
/// `event_type` must be stable and versioned (`"TokensReserved.v1"`) so stored
/// rows can still be decoded after the schema evolves.
pub trait Event: Send + Sync + 'static {
    /// Stable, versioned type name of this event.
    fn event_type(&self) -> &'static str;

    /// Encode the event with bincode.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::SerializationError`] if encoding fails.
    fn to_bytes(&self) -> Result<Vec<u8>, EventError>
    where
        Self: Serialize,
    {
        bincode::serialize(self).map_err(|e| EventError::SerializationError(e.to_string()))
    }

    /// Decode an event from bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::DeserializationError`] if the bytes do not describe
    /// a value of this type.
    fn from_bytes(bytes: &[u8]) -> Result<Self, EventError>
    where
        Self: DeserializeOwned + Sized,
    {
        bincode::deserialize(bytes).map_err(|e| EventError::DeserializationError(e.to_string()))
    }
}

/// Tracing links carried by every stored event.
///
/// `correlation_id` ties together everything triggered by one external request;
/// `causation_id` names the event or command that directly caused this one.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Request-wide correlation identifier.
    pub correlation_id: Option<Uuid>,
    /// Identifier of the direct cause.
    pub causation_id: Option<Uuid>,
    /// Who or what triggered the change (user id, worker name).
    pub actor: Option<String>,
}

impl EventMetadata {
    /// Metadata for a fresh request with a new correlation ID.
    #[must_use]
    pub fn correlated() -> Self {
        Self {
            correlation_id: Some(Uuid::new_v4()),
            ..Self::default()
        }
    }

    /// Metadata for an event caused by `cause`, inheriting its correlation ID.
    #[must_use]
    pub fn caused_by(cause: &Self, causation_id: Uuid) -> Self {
        Self {
            correlation_id: cause.correlation_id.or(Some(causation_id)),
            causation_id: Some(causation_id),
            actor: cause.actor.clone(),
        }
    }

    /// Attach an actor.
    #[must_use]
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// JSON form used by the `metadata` JSONB columns.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "correlation_id": self.correlation_id,
            "causation_id": self.causation_id,
            "actor": self.actor,
        })
    }

    /// Parse the JSON column form. Missing or malformed fields become `None`.
    #[must_use]
    pub fn from_json(value: &serde_json::Value) -> Self {
        let uuid_field = |name: &str| {
            value
                .get(name)
                .and_then(serde_json::Value::as_str)
                .and_then(|s| Uuid::parse_str(s).ok())
        };
        Self {
            correlation_id: uuid_field("correlation_id"),
            causation_id: uuid_field("causation_id"),
            actor: value
                .get("actor")
                .and_then(serde_json::Value::as_str)
                .map(str::to_string),
        }
    }
}

/// An event encoded for storage or transport.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedEvent {
    /// Versioned event type name.
    pub event_type: String,
    /// Bincode payload.
    pub data: Vec<u8>,
    /// Correlation and causation links.
    pub metadata: EventMetadata,
}

impl SerializedEvent {
    /// Wrap already-encoded bytes.
    #[must_use]
    pub const fn new(event_type: String, data: Vec<u8>, metadata: EventMetadata) -> Self {
        Self {
            event_type,
            data,
            metadata,
        }
    }

    /// Encode a domain event.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::SerializationError`] if the event cannot be encoded.
    pub fn from_event<E: Event + Serialize>(
        event: &E,
        metadata: EventMetadata,
    ) -> Result<Self, EventError> {
        Ok(Self {
            event_type: event.event_type().to_string(),
            data: event.to_bytes()?,
            metadata,
        })
    }

    /// Decode the payload back into a domain event.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::DeserializationError`] if the payload is not an `E`.
    pub fn decode<E: Event + DeserializeOwned>(&self) -> Result<E, EventError> {
        E::from_bytes(&self.data)
    }
}

impl fmt::Display for SerializedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SerializedEvent {{ type: {}, size: {} bytes }}",
            self.event_type,
            self.data.len()
        )
    }
}

/// An event as it sits in the event store, with its position in the aggregate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedEvent {
    /// Unique event identifier.
    pub event_id: Uuid,
    /// Aggregate the event belongs to.
    pub aggregate_id: AggregateId,
    /// Aggregate kind (`"reward_pool"`, `"listen_session"`).
    pub aggregate_type: String,
    /// Version this event produced.
    pub version: Version,
    /// The encoded event.
    pub event: SerializedEvent,
    /// When the event was recorded.
    pub occurred_at: DateTime<Utc>,
}

impl RecordedEvent {
    /// Correlation ID from the event metadata.
    #[must_use]
    pub const fn correlation_id(&self) -> Option<Uuid> {
        self.event.metadata.correlation_id
    }

    /// Causation ID from the event metadata.
    #[must_use]
    pub const fn causation_id(&self) -> Option<Uuid> {
        self.event.metadata.causation_id
    }

    /// Versioned event type name.
    #[must_use]
    pub fn event_type(&self) -> &str {
        &self.event.event_type
    }
}
