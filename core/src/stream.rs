//! Aggregate identification and versioning types.
//!
//! Every event in the store belongs to exactly one aggregate instance, named by an
//! [`AggregateId`], and carries the [`Version`] it produced for that aggregate.
//! Versions are dense: an aggregate with `n` events has version `n`, and its first
//! event is stored at version 1.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error returned when an aggregate identifier fails validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid aggregate ID: {0}")]
pub struct ParseAggregateIdError(String);

/// Identifier of a single aggregate instance (`"pool-3f2a..."`, `"session-91c0..."`).
///
/// `FromStr` validates input and should be used for anything arriving from outside
/// the process. `new` and the `From` impls trust their input.
///
/// # Examples
///
/// ```
/// use tuneshare_core::stream::AggregateId;
///
/// let id = AggregateId::new("session-42");
/// assert_eq!(id.as_str(), "session-42");
///
/// let parsed: AggregateId = "pool-7".parse().unwrap();
/// assert_eq!(parsed, AggregateId::new("pool-7"));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AggregateId(String);

impl AggregateId {
    /// Create an aggregate ID from trusted input.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Build an ID of the form `{prefix}-{uuid}`.
    ///
    /// ```
    /// use tuneshare_core::stream::AggregateId;
    ///
    /// let id = AggregateId::prefixed("pool", uuid::Uuid::nil());
    /// assert_eq!(id.as_str(), "pool-00000000-0000-0000-0000-000000000000");
    /// ```
    #[must_use]
    pub fn prefixed(prefix: &str, id: uuid::Uuid) -> Self {
        Self(format!("{prefix}-{id}"))
    }

    /// The ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume the ID, returning the inner string.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for AggregateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for AggregateId {
    type Err = ParseAggregateIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(ParseAggregateIdError(
                "aggregate ID cannot be empty".to_string(),
            ));
        }
        if trimmed.len() > 255 {
            return Err(ParseAggregateIdError(format!(
                "aggregate ID longer than 255 bytes ({})",
                trimmed.len()
            )));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl From<String> for AggregateId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for AggregateId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for AggregateId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Per-aggregate event version used for optimistic concurrency.
///
/// `Version::INITIAL` (0) means "no events yet". Appending `n` events to an
/// aggregate at version `v` produces versions `v + 1 ..= v + n`.
///
/// # Examples
///
/// ```
/// use tuneshare_core::stream::Version;
///
/// let empty = Version::INITIAL;
/// assert_eq!(empty.next(), Version::new(1));
/// assert_eq!(Version::new(5).value(), 5);
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(u64);

impl Version {
    /// Version of an aggregate that has no events.
    pub const INITIAL: Self = Self(0);

    /// Wrap a raw version number.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The raw version number.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The version the next appended event will receive.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Whether the aggregate has no events.
    #[must_use]
    pub const fn is_initial(self) -> bool {
        self.0 == 0
    }

    /// Version reached after appending `count` events.
    #[must_use]
    pub const fn advance(self, count: u64) -> Self {
        Self(self.0.saturating_add(count))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Version {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Version> for u64 {
    fn from(version: Version) -> Self {
        version.0
    }
}
