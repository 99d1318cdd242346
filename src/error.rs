//! Crate-level error types for command execution, queries, and storage.

use std::io;

use crate::identity::AggregateId;

/// Coarse classification of a failed command, for host policy decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// A business rule rejected the command. Nothing changed.
    DomainRejection,
    /// The behavior has no rule for a command or event.
    ConfigurationFault,
    /// The durable append failed.
    PersistenceFault,
    /// Unexpected failure while interpreting, or the unit is unavailable.
    RuntimeFault,
}

/// Error returned when executing a command against an aggregate fails.
///
/// Generic over `E`, the domain error type the behavior's guards produce.
/// A failed command never changes the aggregate's value or sequence.
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError<E: std::error::Error + Send + Sync + 'static> {
    /// A guard rejected the command.
    #[error(transparent)]
    Rejected(E),

    /// Update command sent to an identity that has no value yet.
    #[error("aggregate '{0}' does not exist")]
    NotFound(AggregateId),

    /// Creation command sent to an identity that already has a value.
    #[error("aggregate '{0}' already exists")]
    AlreadyExists(AggregateId),

    /// No guard and no handler matched the command.
    #[error("no rule handles command '{command_id}'")]
    Unhandled { command_id: String },

    /// An emitted event has no fold rule for the state it would apply to.
    ///
    /// Persistence is aborted so that no unobservable event reaches the log.
    #[error("event '{event_type}' has no fold rule for the current state")]
    OrphanEvent { event_type: String },

    /// The durable append (or event encoding) failed.
    #[error("persistence failed: {0}")]
    Persistence(#[source] StoreError),

    /// Interpretation panicked or was cancelled.
    #[error("interpretation failed: {0}")]
    Runtime(String),

    /// The unit's deferred queue is full.
    #[error("aggregate busy: {0} commands already waiting")]
    Overloaded(usize),

    /// The unit backing this handle has stopped.
    #[error("aggregate unit is no longer running")]
    UnitGone,
}

impl<E: std::error::Error + Send + Sync + 'static> ExecuteError<E> {
    /// Classify this error per the engine's failure taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Rejected(_) | Self::NotFound(_) | Self::AlreadyExists(_) => {
                ErrorClass::DomainRejection
            }
            Self::Unhandled { .. } | Self::OrphanEvent { .. } => ErrorClass::ConfigurationFault,
            Self::Persistence(_) => ErrorClass::PersistenceFault,
            Self::Runtime(_) | Self::Overloaded(_) | Self::UnitGone => ErrorClass::RuntimeFault,
        }
    }
}

/// Error returned by state and existence queries.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// The identity has no value yet.
    #[error("aggregate '{0}' does not exist")]
    NotFound(AggregateId),

    #[error("aggregate unit is no longer running")]
    UnitGone,
}

/// Error raised by event and snapshot stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The stream head moved since the writer last observed it.
    #[error("sequence conflict on '{stream}': expected head {expected}, found {actual}")]
    Conflict {
        stream: String,
        expected: u64,
        actual: u64,
    },

    #[error("refusing to append an empty batch to '{0}'")]
    EmptyAppend(String),

    /// The stream name cannot be mapped onto storage safely.
    #[error("invalid stream name '{0}'")]
    InvalidStream(String),

    /// A stored record could not be parsed.
    #[error("corrupt record in '{stream}' at line {line}: {reason}")]
    Corrupt {
        stream: String,
        line: usize,
        reason: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether the stream may have changed despite the error.
    ///
    /// A conflict means another writer moved the head; an I/O failure may
    /// come after the batch reached the log. Either way the writer must
    /// re-read the stream before appending again.
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::Io(_))
    }
}

/// Error returned when the registry cannot produce a handle.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// No behavior instance was registered for the requested type.
    #[error("no behavior registered for '{0}'")]
    Unregistered(&'static str),

    /// Loading the aggregate's snapshot or history failed.
    #[error("recovery failed: {0}")]
    Recovery(#[from] StoreError),
}
