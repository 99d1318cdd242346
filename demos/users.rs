//! Self-contained example: a user aggregate described as a rule book,
//! driven through the `AggregateStoreBuilder` API with file-backed stores.
//!
//! Run with: `cargo run --example users`
//!
//! Set `RUST_LOG=eventfold_aggregates=debug` to watch units defer,
//! commit, snapshot, and recover.

use eventfold_aggregates::{
    AggregateStoreBuilder, Command, CommandClass, ErrorClass, ExecuteError, RuleBook,
    new_command_id,
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// User aggregate
// ---------------------------------------------------------------------------

/// Current state of one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct User {
    name: String,
    age: i32,
    deleted: bool,
}

#[derive(Debug, Clone)]
enum UserCommand {
    Create { name: String, age: i32 },
    Rename { name: String },
    Delete,
}

/// A command plus its correlation id.
struct Envelope {
    id: String,
    cmd: UserCommand,
}

impl From<UserCommand> for Envelope {
    fn from(cmd: UserCommand) -> Self {
        Self {
            id: new_command_id(),
            cmd,
        }
    }
}

impl Command for Envelope {
    fn command_id(&self) -> &str {
        &self.id
    }

    fn class(&self) -> CommandClass {
        match self.cmd {
            UserCommand::Create { .. } => CommandClass::Creation,
            _ => CommandClass::Update,
        }
    }
}

/// Domain events, adjacently tagged as every stored event must be.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
enum UserEvent {
    Created { name: String, age: i32 },
    Renamed { name: String },
    Deleted,
}

#[derive(Debug, thiserror::Error)]
enum UserError {
    #[error("age must be >= 0")]
    NegativeAge,
    #[error("User is already deleted")]
    AlreadyDeleted,
}

type Users = RuleBook<User, Envelope, UserEvent, UserError>;

fn users() -> Users {
    RuleBook::<User, Envelope, UserEvent, UserError>::builder("user")
        .reject_create_if(
            "negative-age",
            |e| matches!(e.cmd, UserCommand::Create { age, .. } if age < 0),
            |_| UserError::NegativeAge,
        )
        .create_on(
            "create",
            |e| matches!(e.cmd, UserCommand::Create { .. }),
            |e| match &e.cmd {
                UserCommand::Create { name, age } => Ok(vec![UserEvent::Created {
                    name: name.clone(),
                    age: *age,
                }]),
                _ => Ok(vec![]),
            },
        )
        .reject_update_if("deleted", |u, _| u.deleted, |_, _| UserError::AlreadyDeleted)
        .update_on(
            "rename",
            |_, e| matches!(e.cmd, UserCommand::Rename { .. }),
            |_, e| match &e.cmd {
                UserCommand::Rename { name } => Ok(vec![UserEvent::Renamed { name: name.clone() }]),
                _ => Ok(vec![]),
            },
        )
        .update_on(
            "delete",
            |_, e| matches!(e.cmd, UserCommand::Delete),
            |_, _| Ok(vec![UserEvent::Deleted]),
        )
        .fold_created(
            |ev| matches!(ev, UserEvent::Created { .. }),
            |ev| match ev {
                UserEvent::Created { name, age } => User {
                    name: name.clone(),
                    age: *age,
                    deleted: false,
                },
                _ => unreachable!("guarded by the predicate"),
            },
        )
        .fold_updated(
            |_, ev| matches!(ev, UserEvent::Renamed { .. }),
            |u, ev| match ev {
                UserEvent::Renamed { name } => User {
                    name: name.clone(),
                    ..u
                },
                _ => u,
            },
        )
        .fold_updated(
            |_, ev| matches!(ev, UserEvent::Deleted),
            |u, _| User { deleted: true, ..u },
        )
        .build()
        .expect("user rules are consistent")
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let tmp = tempfile::tempdir()?;

    let store = AggregateStoreBuilder::new()
        .base_dir(tmp.path())
        .behavior(users())
        .snapshot_every(3)
        .open()
        .await?;

    let alice = store.get::<Users>("alice").await?;
    alice
        .execute(
            UserCommand::Create {
                name: "Alice".into(),
                age: 30,
            }
            .into(),
        )
        .await?;
    for name in ["Alicia", "Ally", "Al", "Alice"] {
        alice
            .execute(UserCommand::Rename { name: name.into() }.into())
            .await?;
    }

    // Business rules reject without touching the log.
    let bob = store.get::<Users>("bob").await?;
    match bob
        .execute(
            UserCommand::Create {
                name: "Bob".into(),
                age: -1,
            }
            .into(),
        )
        .await
    {
        Err(e) if e.class() == ErrorClass::DomainRejection => println!("bob rejected: {e}"),
        other => return Err(format!("expected a rejection, got {other:?}").into()),
    }

    alice.execute(UserCommand::Delete.into()).await?;
    if let Err(ExecuteError::Rejected(e)) = alice
        .execute(UserCommand::Rename { name: "Zed".into() }.into())
        .await
    {
        println!("rename after delete rejected: {e}");
    }

    let status = alice.status().await?;
    println!(
        "alice: {:?} at sequence {} ({} events since snapshot)",
        alice.state().await?,
        status.sequence,
        status.events_since_snapshot
    );

    // Stop the unit, then let the registry recover it from disk.
    store.terminate::<Users>("alice").await;
    let alice = store.get::<Users>("alice").await?;
    let recovered = alice.state().await?;
    println!("recovered: {recovered:?}");

    assert_eq!(recovered.name, "Alice");
    assert!(recovered.deleted);
    assert_eq!(alice.status().await?.sequence, 6);
    assert!(!bob.exists().await?);

    println!("all assertions passed");

    Ok(())
}
