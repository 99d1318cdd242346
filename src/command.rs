//! Command classification and correlation.

use serde::{Deserialize, Serialize};

/// Which lifecycle phase a command is meant for.
///
/// Creation commands may only run against an identity that has no value
/// yet; update commands require an existing value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandClass {
    /// Brings an aggregate into existence.
    Creation,
    /// Changes an aggregate that already exists.
    Update,
}

/// A request to change an aggregate's state.
///
/// Implementors expose a command identity (copied into the metadata of
/// every event the command produces) and a [`CommandClass`].
///
/// # Examples
///
/// ```
/// use eventfold_aggregates::{Command, CommandClass, new_command_id};
///
/// struct Rename {
///     id: String,
///     name: String,
/// }
///
/// impl Command for Rename {
///     fn command_id(&self) -> &str {
///         &self.id
///     }
///     fn class(&self) -> CommandClass {
///         CommandClass::Update
///     }
/// }
///
/// let cmd = Rename { id: new_command_id(), name: "Carol".into() };
/// assert_eq!(cmd.class(), CommandClass::Update);
/// assert!(!cmd.command_id().is_empty());
/// ```
pub trait Command: Send + Sync + 'static {
    /// Correlation identity of this command instance.
    fn command_id(&self) -> &str;

    /// Whether this command creates or updates an aggregate.
    fn class(&self) -> CommandClass;
}

/// Generate a fresh command identity (a UUID v4 string).
pub fn new_command_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
