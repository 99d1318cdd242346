//! Per-aggregate actors for event-sourced systems.
//!
//! Each aggregate identity is owned by one unit that serializes its
//! commands, persists the events they produce before acknowledging them,
//! folds those events into the current value, and rebuilds that value
//! from a snapshot plus the event tail when it is activated again.
//!
//! Domain logic is supplied as a [`Behavior`], usually a [`RuleBook`]
//! assembled from ordered guard, handler, and fold rules.

mod actor;
pub use actor::{
    AggregateHandle, DEFAULT_DEFERRED_CAPACITY, LifecycleState, PersistenceFaultPolicy,
    UnitConfig, UnitStatus, spawn_unit,
};
mod behavior;
pub use behavior::{Behavior, InterpretError};
mod command;
mod error;
mod event;
mod fold;
mod identity;
mod rules;
mod snapshot;
mod storage;
mod store;

pub use command::{Command, CommandClass, new_command_id};
pub use error::{ErrorClass, ExecuteError, RegistryError, StateError, StoreError};
pub use event::{
    EventEnvelope, EventMetadata, ProposedEvent, RecordedEvent, SequenceRange, decode_event,
    encode_event,
};
pub use fold::{Orphan, Recovered, fold_events, replay};
pub use identity::{AggregateId, StreamId};
pub use rules::{BoxFuture, Phase, RuleBook, RuleBookBuilder, RuleBookError, RuleDefect};
pub use snapshot::{
    FileSnapshotStore, InMemorySnapshotStore, NoSnapshots, Snapshot, SnapshotPolicy,
    SnapshotStore,
};
pub use storage::{EventStore, EventStream, FileEventStore, InMemoryEventStore, StreamLayout};
pub use store::{AggregateStore, AggregateStoreBuilder};
