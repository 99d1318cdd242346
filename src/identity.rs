//! Aggregate identity and stream naming.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque key scoping one aggregate instance within its type.
///
/// # Examples
///
/// ```
/// use eventfold_aggregates::AggregateId;
///
/// let id = AggregateId::from("user-1");
/// assert_eq!(id.as_str(), "user-1");
/// assert_eq!(id.to_string(), "user-1");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AggregateId(String);

impl AggregateId {
    /// Wrap any string-like value as an aggregate identity.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AggregateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AggregateId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for AggregateId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&AggregateId> for AggregateId {
    fn from(id: &AggregateId) -> Self {
        id.clone()
    }
}

impl AsRef<str> for AggregateId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Names one durable event stream: an aggregate type plus an identity.
///
/// Event and snapshot stores key everything by `StreamId`, so two aggregate
/// types may reuse the same identity string without colliding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId {
    /// Aggregate type name (e.g. `"user"`).
    pub aggregate_type: String,
    /// Instance identity within the type.
    pub id: AggregateId,
}

impl StreamId {
    pub fn new(aggregate_type: impl Into<String>, id: impl Into<AggregateId>) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.aggregate_type, self.id)
    }
}
