//! Pure folding: event lists and snapshot-plus-tail recovery.
//!
//! Nothing here touches a store or a task. The unit uses [`fold_events`]
//! to stage the value a command would produce (and to catch orphan events
//! before they are persisted), and [`replay`] to rebuild state on activation.

use crate::behavior::Behavior;
use crate::snapshot::Snapshot;

/// An event with no fold rule for the value it would be applied to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("event at position {position} has no fold rule")]
pub struct Orphan {
    /// Index of the offending event in the folded list.
    pub position: usize,
}

/// Fold one event. Returns the untouched input when no rule listens.
pub fn step<B: Behavior>(
    behavior: &B,
    current: Option<B::Value>,
    event: &B::Event,
) -> Result<B::Value, Option<B::Value>> {
    match current {
        None if behavior.has_create_listener(event) => Ok(behavior.fold_create_event(event)),
        Some(value) if behavior.has_update_listener(&value, event) => {
            Ok(behavior.fold_update_event(value, event))
        }
        other => Err(other),
    }
}

/// Fold events in order on top of `seed`, failing on the first orphan.
///
/// # Errors
///
/// Returns [`Orphan`] with the index of the first event no rule handles.
pub fn fold_events<'a, B: Behavior>(
    behavior: &B,
    seed: Option<B::Value>,
    events: impl IntoIterator<Item = &'a B::Event>,
) -> Result<Option<B::Value>, Orphan> {
    let mut value = seed;
    for (position, event) in events.into_iter().enumerate() {
        match step(behavior, value, event) {
            Ok(next) => value = Some(next),
            Err(_) => return Err(Orphan { position }),
        }
    }
    Ok(value)
}

/// State rebuilt from a snapshot and the events after it.
#[derive(Debug, Clone, PartialEq)]
pub struct Recovered<V> {
    /// `None` if nothing has created a value yet.
    pub value: Option<V>,
    /// Highest sequence seen (snapshot or tail), folded or not.
    pub sequence: u64,
    /// Tail events actually folded on top of the snapshot.
    pub folded: u64,
}

/// Rebuild state from an optional snapshot and the ordered tail after it.
///
/// Tail items are `(sequence, event)`; `None` marks an event the domain
/// type could not decode. Events are facts here, so no guard or handler
/// runs. Undecodable events and events without a fold rule are skipped
/// (the sequence still advances). Items at or below the current sequence
/// are ignored.
pub fn replay<B: Behavior>(
    behavior: &B,
    snapshot: Option<Snapshot<B::Value>>,
    tail: impl IntoIterator<Item = (u64, Option<B::Event>)>,
) -> Recovered<B::Value> {
    let (mut value, mut sequence) = match snapshot {
        Some(snapshot) => (Some(snapshot.value), snapshot.sequence),
        None => (None, 0),
    };
    let mut folded = 0;

    for (seq, event) in tail {
        if seq <= sequence {
            tracing::debug!(seq, sequence, "ignoring already applied event");
            continue;
        }
        sequence = seq;
        let Some(event) = event else {
            tracing::debug!(seq, "skipping unrecognized event during replay");
            continue;
        };
        value = match step(behavior, value, &event) {
            Ok(next) => {
                folded += 1;
                Some(next)
            }
            Err(unchanged) => {
                tracing::warn!(seq, "skipping event with no fold rule during replay");
                unchanged
            }
        };
    }

    Recovered {
        value,
        sequence,
        folded,
    }
}
