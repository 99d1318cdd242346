//! The per-aggregate-type decision and fold contract.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};

use crate::command::{Command, CommandClass};

/// Why interpretation produced no events.
#[derive(Debug, thiserror::Error)]
pub enum InterpretError<E: std::error::Error + Send + Sync + 'static> {
    /// A guard (or handler) rejected the command.
    #[error(transparent)]
    Rejected(E),

    /// No guard and no handler matched the command.
    #[error("no rule matched the command")]
    Unhandled,
}

/// Decision and fold logic for one aggregate type.
///
/// One instance is shared by every unit of the type. The engine never
/// builds or mutates a `Value` itself: values only come out of
/// [`fold_create_event`](Behavior::fold_create_event) and
/// [`fold_update_event`](Behavior::fold_update_event).
///
/// # Contract
///
/// - Interpretation may await external work, but must not assume it runs
///   on the unit's task.
/// - Folds must be pure and deterministic. Recovery replays the same events
///   through them and expects the same value.
/// - The engine calls a fold only after the matching `has_*_listener`
///   returned `true` for the same arguments.
///
/// [`RuleBook`](crate::RuleBook) implements this trait from ordered rule
/// lists; implement it by hand when a `match` reads better.
#[async_trait]
pub trait Behavior: Send + Sync + 'static {
    /// Business state derived from the event history.
    type Value: Clone + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Commands this aggregate type accepts.
    type Command: Command;

    /// Events this aggregate type emits. Must use adjacently tagged serde
    /// (`#[serde(tag = "type", content = "data")]`).
    type Event: Clone + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Domain rejection type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Identifies this aggregate type (e.g. `"user"`). Used in stream names.
    fn aggregate_type(&self) -> &str;

    /// Whether `cmd` is meant for an identity that has no value yet.
    fn can_handle_as_creation(&self, cmd: &Self::Command) -> bool {
        cmd.class() == CommandClass::Creation
    }

    /// Decide the events for a creation command.
    async fn interpret_create(
        &self,
        cmd: &Self::Command,
    ) -> Result<Vec<Self::Event>, InterpretError<Self::Error>>;

    /// Decide the events for an update command against the current value.
    async fn interpret_update(
        &self,
        value: &Self::Value,
        cmd: &Self::Command,
    ) -> Result<Vec<Self::Event>, InterpretError<Self::Error>>;

    /// Whether `event` can bring a value into existence.
    fn has_create_listener(&self, event: &Self::Event) -> bool;

    /// Whether `event` can be folded into `value`.
    fn has_update_listener(&self, value: &Self::Value, event: &Self::Event) -> bool;

    /// Produce the first value from a creation event.
    fn fold_create_event(&self, event: &Self::Event) -> Self::Value;

    /// Fold an event into an existing value.
    fn fold_update_event(&self, value: Self::Value, event: &Self::Event) -> Self::Value;

    /// Classification tags stamped into each event's metadata.
    fn event_tags(&self, _event: &Self::Event) -> BTreeSet<String> {
        BTreeSet::from([self.aggregate_type().to_owned()])
    }
}
