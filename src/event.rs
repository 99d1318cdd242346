//! Event metadata, envelopes, and the JSON form stores persist.
//!
//! Domain events are adjacently tagged serde enums
//! (`#[serde(tag = "type", content = "data")]`). Encoding splits that shape
//! into an `event_type` string and a JSON payload so stores never need the
//! concrete event type. Decoding reassembles it.

use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::AggregateId;

/// Metadata stamped on every event the engine commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Unique identity of this event (UUID v4).
    pub event_id: Uuid,
    /// The aggregate instance that owns the event.
    pub aggregate_id: AggregateId,
    /// The command that caused the event.
    pub command_id: String,
    /// Creation time, Unix epoch milliseconds.
    pub created_at: u64,
    /// Classification tags, used by downstream readers to select events.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
}

impl EventMetadata {
    /// Build metadata for a new event with a fresh id and the current time.
    pub fn new(
        aggregate_id: AggregateId,
        command_id: impl Into<String>,
        tags: BTreeSet<String>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            aggregate_id,
            command_id: command_id.into(),
            created_at: now_millis(),
            tags,
        }
    }
}

/// A committed event as returned to the caller of a command.
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope<E> {
    /// Per-stream sequence number assigned at commit (starts at 1).
    pub sequence: u64,
    pub metadata: EventMetadata,
    /// The domain event itself.
    pub payload: E,
}

/// An encoded event handed to [`EventStore::append`](crate::EventStore::append).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedEvent {
    /// Variant tag of the adjacently tagged domain event.
    pub event_type: String,
    /// The `"data"` part of the domain event; `null` for unit variants.
    pub payload: serde_json::Value,
    pub metadata: EventMetadata,
}

impl ProposedEvent {
    /// Attach the sequence number the store assigned.
    pub fn record(self, sequence: u64) -> RecordedEvent {
        RecordedEvent {
            sequence,
            event_type: self.event_type,
            payload: self.payload,
            metadata: self.metadata,
        }
    }
}

/// An event as stored durably and read back during recovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent {
    pub sequence: u64,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub metadata: EventMetadata,
}

/// Inclusive range of sequence numbers committed by one append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceRange {
    pub first: u64,
    pub last: u64,
}

impl SequenceRange {
    /// Number of events in the range.
    pub fn len(&self) -> usize {
        (self.last + 1).saturating_sub(self.first) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Encode a domain event into a [`ProposedEvent`].
///
/// # Errors
///
/// Returns `serde_json::Error` if the event cannot be serialized or does not
/// serialize to an adjacently tagged object with a string `"type"` field.
pub fn encode_event<E: Serialize>(
    event: &E,
    metadata: EventMetadata,
) -> serde_json::Result<ProposedEvent> {
    let value = serde_json::to_value(event)?;
    let serde_json::Value::Object(mut obj) = value else {
        return Err(serde_json::Error::custom(
            "domain event must serialize to an adjacently tagged object",
        ));
    };
    let Some(serde_json::Value::String(event_type)) = obj.remove("type") else {
        return Err(serde_json::Error::custom(
            "domain event is missing a string \"type\" tag",
        ));
    };
    let payload = obj.remove("data").unwrap_or(serde_json::Value::Null);

    Ok(ProposedEvent {
        event_type,
        payload,
        metadata,
    })
}

/// Decode a recorded event back into the domain event type.
///
/// Returns `None` for event types the domain enum does not know (or payloads
/// that no longer match it). Recovery skips such events.
pub fn decode_event<E: DeserializeOwned>(recorded: &RecordedEvent) -> Option<E> {
    let tagged = if recorded.payload.is_null() {
        serde_json::json!({ "type": recorded.event_type })
    } else {
        serde_json::json!({
            "type": recorded.event_type,
            "data": recorded.payload,
        })
    };
    serde_json::from_value(tagged).ok()
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
