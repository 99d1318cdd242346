//! The aggregate unit: one task per identity that owns its value.
//!
//! A unit exclusively owns its lifecycle state, current value, and stream
//! sequence. It reaches the outside world only through its inbound channel,
//! so commands for one identity are serialized without locks while units
//! for different identities run fully in parallel.
//!
//! A command moves the unit to [`LifecycleState::Busy`] through two
//! suspension points: interpretation (run on its own task so a panic is
//! contained) and the durable append. While Busy the unit keeps answering
//! queries, and parks further commands in a FIFO holding queue that is
//! replayed, ahead of anything newer, as soon as the command settles.
//!
//! Public API: [`AggregateHandle`] (cloneable async handle) and
//! [`spawn_unit`] (recovers the unit's state, then starts its task).

use std::collections::VecDeque;
use std::future::Future;
use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinError;
use tokio_stream::StreamExt;
use tracing::Instrument;

use crate::behavior::{Behavior, InterpretError};
use crate::command::Command;
use crate::error::{ExecuteError, StateError, StoreError};
use crate::event::{EventEnvelope, EventMetadata, ProposedEvent, SequenceRange};
use crate::event::{decode_event, encode_event};
use crate::fold::{self, Recovered};
use crate::identity::{AggregateId, StreamId};
use crate::snapshot::{Snapshot, SnapshotPolicy, SnapshotStore};
use crate::storage::EventStore;

/// Capacity of a unit's inbound channel.
const MAILBOX_CAPACITY: usize = 32;

/// Default bound on commands parked while a unit is Busy.
pub const DEFAULT_DEFERRED_CAPACITY: usize = 1024;

/// Which messages a unit currently accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    /// No value restored or created yet.
    Uninitialized,
    /// A value exists and the unit is ready for the next command.
    Available,
    /// A command's interpretation or persistence is in flight.
    Busy,
}

/// What a unit does after a failed append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PersistenceFaultPolicy {
    /// Reply the fault and keep the pre-command state, unless the fault
    /// is [ambiguous](StoreError::is_ambiguous): then the unit re-reads the
    /// stream first, and stops if that fails.
    #[default]
    Fail,
    /// Reply the fault, then rebuild state from the durable stores before
    /// the next command. The unit stops if that recovery fails.
    Recover,
}

/// Per-unit configuration.
#[derive(Debug, Clone)]
pub struct UnitConfig {
    pub snapshot_policy: SnapshotPolicy,
    /// Deactivate after this long without a message. `None` never idles out.
    pub idle_timeout: Option<Duration>,
    /// Commands parked while Busy beyond this are refused with
    /// [`ExecuteError::Overloaded`].
    pub deferred_capacity: usize,
    pub on_persistence_fault: PersistenceFaultPolicy,
}

impl Default for UnitConfig {
    fn default() -> Self {
        Self {
            snapshot_policy: SnapshotPolicy::default(),
            idle_timeout: None,
            deferred_capacity: DEFAULT_DEFERRED_CAPACITY,
            on_persistence_fault: PersistenceFaultPolicy::default(),
        }
    }
}

/// A point-in-time view of a unit's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitStatus {
    pub lifecycle: LifecycleState,
    /// Sequence of the last committed event (0 for an empty stream).
    pub sequence: u64,
    /// Events folded since the last snapshot was written.
    pub events_since_snapshot: u64,
    /// Commands waiting in the holding queue.
    pub deferred: usize,
}

/// Result type sent back through the `Execute` reply channel.
type ExecuteResult<B> = Result<
    Vec<EventEnvelope<<B as Behavior>::Event>>,
    ExecuteError<<B as Behavior>::Error>,
>;

type Reply<B> = oneshot::Sender<ExecuteResult<B>>;

/// Messages sent from [`AggregateHandle`] to the unit.
pub(crate) enum UnitMessage<B: Behavior> {
    Execute { cmd: B::Command, reply: Reply<B> },
    GetState {
        reply: oneshot::Sender<Result<B::Value, StateError>>,
    },
    Exists { reply: oneshot::Sender<bool> },
    Status { reply: oneshot::Sender<UnitStatus> },
    Terminate,
}

/// A command parked while the unit was Busy.
struct Deferred<B: Behavior> {
    cmd: B::Command,
    reply: Reply<B>,
}

/// Events folded ahead of time, waiting on the append outcome.
struct Staged<B: Behavior> {
    next_value: B::Value,
    events: Vec<(EventMetadata, B::Event)>,
}

/// Where an in-flight command stands when its current future resolves.
enum Stage<B: Behavior> {
    Interpreted(Result<Vec<B::Event>, ExecuteError<B::Error>>),
    Appended {
        outcome: Result<SequenceRange, StoreError>,
        staged: Staged<B>,
    },
}

type StageFuture<B> = Pin<Box<dyn Future<Output = Stage<B>> + Send>>;

struct InFlight<B: Behavior> {
    /// Lifecycle to return to if the command fails.
    prior: LifecycleState,
    command_id: String,
    reply: Reply<B>,
    stage: StageFuture<B>,
}

struct AggregateUnit<B: Behavior> {
    stream: StreamId,
    behavior: Arc<B>,
    events: Arc<dyn EventStore>,
    snapshots: Arc<dyn SnapshotStore>,
    config: UnitConfig,
    lifecycle: LifecycleState,
    value: Option<B::Value>,
    sequence: u64,
    since_snapshot: u64,
    deferred: VecDeque<Deferred<B>>,
    in_flight: Option<InFlight<B>>,
}

impl<B: Behavior> AggregateUnit<B> {
    async fn run(mut self, mut rx: mpsc::Receiver<UnitMessage<B>>) {
        let mut inbox_open = true;
        loop {
            // Parked commands go first, in arrival order.
            while self.in_flight.is_none() {
                let Some(Deferred { cmd, reply }) = self.deferred.pop_front() else {
                    break;
                };
                self.begin(cmd, reply);
            }
            if !inbox_open && self.in_flight.is_none() {
                break;
            }
            let idle = self.in_flight.is_none().then_some(self.config.idle_timeout).flatten();

            tokio::select! {
                stage = settle(&mut self.in_flight), if self.in_flight.is_some() => {
                    if self.advance(stage).await.is_break() {
                        break;
                    }
                }
                msg = rx.recv(), if inbox_open => match msg {
                    Some(msg) => {
                        if self.handle(msg).is_break() {
                            break;
                        }
                    }
                    None => inbox_open = false,
                },
                _ = idle_sleep(idle), if idle.is_some() => {
                    tracing::info!("unit idle, shutting down");
                    break;
                }
            }
        }
        // Dropping `self` drops any pending reply senders; their callers
        // observe `UnitGone`.
    }

    fn handle(&mut self, msg: UnitMessage<B>) -> ControlFlow<()> {
        match msg {
            UnitMessage::Execute { cmd, reply } => {
                if self.in_flight.is_none() {
                    self.begin(cmd, reply);
                } else if self.deferred.len() >= self.config.deferred_capacity {
                    tracing::warn!(
                        command_id = cmd.command_id(),
                        deferred = self.deferred.len(),
                        "holding queue full, refusing command"
                    );
                    let _ = reply.send(Err(ExecuteError::Overloaded(self.deferred.len())));
                } else {
                    tracing::debug!(
                        command_id = cmd.command_id(),
                        deferred = self.deferred.len() + 1,
                        "unit busy, deferring command"
                    );
                    self.deferred.push_back(Deferred { cmd, reply });
                }
            }
            UnitMessage::GetState { reply } => {
                let result = self
                    .value
                    .clone()
                    .ok_or_else(|| StateError::NotFound(self.stream.id.clone()));
                let _ = reply.send(result);
            }
            UnitMessage::Exists { reply } => {
                let _ = reply.send(self.value.is_some());
            }
            UnitMessage::Status { reply } => {
                let _ = reply.send(self.status());
            }
            UnitMessage::Terminate => {
                tracing::info!(deferred = self.deferred.len(), "unit terminated");
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn status(&self) -> UnitStatus {
        UnitStatus {
            lifecycle: self.lifecycle,
            sequence: self.sequence,
            events_since_snapshot: self.since_snapshot,
            deferred: self.deferred.len(),
        }
    }

    /// Route a command by whether a value exists, and start interpreting it.
    fn begin(&mut self, cmd: B::Command, reply: Reply<B>) {
        let command_id = cmd.command_id().to_owned();
        let creation = self.behavior.can_handle_as_creation(&cmd);
        let span = tracing::debug_span!("interpret", command_id = %command_id);
        let behavior = Arc::clone(&self.behavior);

        let task = match (&self.value, creation) {
            (None, true) => {
                tokio::spawn(async move { behavior.interpret_create(&cmd).await }.instrument(span))
            }
            (None, false) => {
                let _ = reply.send(Err(ExecuteError::NotFound(self.stream.id.clone())));
                return;
            }
            (Some(_), true) => {
                let _ = reply.send(Err(ExecuteError::AlreadyExists(self.stream.id.clone())));
                return;
            }
            (Some(value), false) => {
                let value = value.clone();
                tokio::spawn(
                    async move { behavior.interpret_update(&value, &cmd).await }.instrument(span),
                )
            }
        };

        let unhandled_id = command_id.clone();
        let stage = async move {
            let result = match task.await {
                Ok(Ok(events)) => Ok(events),
                Ok(Err(InterpretError::Rejected(e))) => Err(ExecuteError::Rejected(e)),
                Ok(Err(InterpretError::Unhandled)) => Err(ExecuteError::Unhandled {
                    command_id: unhandled_id,
                }),
                Err(join) => Err(ExecuteError::Runtime(panic_message(join))),
            };
            Stage::Interpreted(result)
        };

        let prior = self.lifecycle;
        self.lifecycle = LifecycleState::Busy;
        self.in_flight = Some(InFlight {
            prior,
            command_id,
            reply,
            stage: Box::pin(stage),
        });
    }

    /// React to the in-flight command's current future resolving.
    async fn advance(&mut self, stage: Stage<B>) -> ControlFlow<()> {
        match stage {
            Stage::Interpreted(Ok(events)) if events.is_empty() => {
                self.settle_with(Ok(Vec::new()));
            }
            Stage::Interpreted(Ok(events)) => match self.persist(events) {
                Ok(next) => {
                    if let Some(flight) = self.in_flight.as_mut() {
                        flight.stage = next;
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "refusing to persist events");
                    self.settle_with(Err(e));
                }
            },
            Stage::Interpreted(Err(e)) => {
                if let ExecuteError::Runtime(reason) = &e {
                    tracing::error!(%reason, "interpretation failed");
                }
                self.settle_with(Err(e));
            }
            Stage::Appended {
                outcome: Ok(range),
                staged,
            } => self.commit(range, staged).await,
            Stage::Appended {
                outcome: Err(e), ..
            } => return self.persistence_failed(e).await,
        }
        ControlFlow::Continue(())
    }

    /// Encode, orphan-check, and stage the events, then start the append.
    fn persist(&self, events: Vec<B::Event>) -> Result<StageFuture<B>, ExecuteError<B::Error>> {
        let command_id = self
            .in_flight
            .as_ref()
            .map(|f| f.command_id.clone())
            .unwrap_or_default();

        let mut proposed: Vec<ProposedEvent> = Vec::with_capacity(events.len());
        for event in &events {
            let metadata = EventMetadata::new(
                self.stream.id.clone(),
                command_id.as_str(),
                self.behavior.event_tags(event),
            );
            let encoded = encode_event(event, metadata)
                .map_err(|e| ExecuteError::Persistence(StoreError::Serialization(e)))?;
            proposed.push(encoded);
        }

        let next_value = match fold::fold_events(&*self.behavior, self.value.clone(), &events) {
            Ok(Some(value)) => value,
            Ok(None) => {
                return Err(ExecuteError::Runtime("no events to persist".into()));
            }
            Err(orphan) => {
                return Err(ExecuteError::OrphanEvent {
                    event_type: proposed[orphan.position].event_type.clone(),
                });
            }
        };

        let staged = Staged {
            next_value,
            events: proposed
                .iter()
                .map(|p| p.metadata.clone())
                .zip(events)
                .collect(),
        };
        let store = Arc::clone(&self.events);
        let stream = self.stream.clone();
        let expected = self.sequence;
        Ok(Box::pin(async move {
            let outcome = store.append(&stream, expected, proposed).await;
            Stage::Appended { outcome, staged }
        }))
    }

    /// Install the staged value, acknowledge the caller, maybe snapshot.
    async fn commit(&mut self, range: SequenceRange, staged: Staged<B>) {
        let Some(flight) = self.in_flight.take() else {
            return;
        };
        let count = staged.events.len() as u64;
        self.value = Some(staged.next_value);
        self.sequence = range.last;
        self.lifecycle = LifecycleState::Available;
        self.since_snapshot += count;

        tracing::info!(
            command_id = %flight.command_id,
            first = range.first,
            last = range.last,
            "events committed"
        );
        let envelopes = staged
            .events
            .into_iter()
            .zip(range.first..)
            .map(|((metadata, payload), sequence)| EventEnvelope {
                sequence,
                metadata,
                payload,
            })
            .collect();
        let _ = flight.reply.send(Ok(envelopes));

        self.maybe_snapshot().await;
    }

    async fn maybe_snapshot(&mut self) {
        if !self.config.snapshot_policy.is_due(self.since_snapshot) {
            return;
        }
        let Some(value) = &self.value else {
            return;
        };
        let snapshot = match Snapshot::encode(self.sequence, LifecycleState::Available, value) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode snapshot");
                return;
            }
        };
        match self.snapshots.save(&self.stream, snapshot).await {
            Ok(()) => {
                tracing::debug!(sequence = self.sequence, "snapshot saved");
                self.since_snapshot = 0;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to save snapshot; will retry after next commit");
            }
        }
    }

    async fn persistence_failed(&mut self, error: StoreError) -> ControlFlow<()> {
        tracing::error!(%error, "append failed");
        // The log is authoritative: if the batch may have landed, or another
        // writer moved the head, the sequence we hold is no longer trusted.
        let resync = error.is_ambiguous()
            || self.config.on_persistence_fault == PersistenceFaultPolicy::Recover;
        self.settle_with(Err(ExecuteError::Persistence(error)));

        if resync && let Err(e) = self.recover().await {
            tracing::error!(error = %e, "recovery after persistence fault failed");
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    }

    /// Finish the in-flight command without committing anything.
    fn settle_with(&mut self, result: ExecuteResult<B>) {
        if let Some(flight) = self.in_flight.take() {
            self.lifecycle = flight.prior;
            let _ = flight.reply.send(result);
        }
    }

    async fn recover(&mut self) -> Result<(), StoreError> {
        let recovered = load(
            &*self.behavior,
            &self.stream,
            &*self.events,
            &*self.snapshots,
        )
        .await?;
        tracing::info!(
            sequence = recovered.sequence,
            folded = recovered.folded,
            exists = recovered.value.is_some(),
            "state recovered"
        );
        self.lifecycle = if recovered.value.is_some() {
            LifecycleState::Available
        } else {
            LifecycleState::Uninitialized
        };
        self.value = recovered.value;
        self.sequence = recovered.sequence;
        self.since_snapshot = recovered.folded;
        Ok(())
    }
}

/// Resolve the in-flight command's current future; pending when idle.
async fn settle<B: Behavior>(in_flight: &mut Option<InFlight<B>>) -> Stage<B> {
    match in_flight {
        Some(flight) => flight.stage.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn idle_sleep(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending().await,
    }
}

fn panic_message(err: JoinError) -> String {
    match err.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_owned())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "interpretation panicked".to_owned()),
        Err(err) => err.to_string(),
    }
}

/// Rebuild state from the latest usable snapshot plus the event tail.
///
/// A snapshot that is not `Available` or no longer decodes, or a snapshot
/// store that fails, falls back to full replay.
async fn load<B: Behavior>(
    behavior: &B,
    stream: &StreamId,
    events: &dyn EventStore,
    snapshots: &dyn SnapshotStore,
) -> Result<Recovered<B::Value>, StoreError> {
    let snapshot = match snapshots.load_latest(stream).await {
        Ok(Some(snapshot)) if snapshot.lifecycle != LifecycleState::Available => {
            tracing::warn!(lifecycle = ?snapshot.lifecycle, "ignoring snapshot taken outside Available");
            None
        }
        Ok(Some(snapshot)) => match snapshot.decode::<B::Value>() {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                tracing::warn!(error = %e, "snapshot no longer decodes; replaying full history");
                None
            }
        },
        Ok(None) => None,
        Err(e) => {
            tracing::warn!(error = %e, "failed to load snapshot; replaying full history");
            None
        }
    };

    let after = snapshot.as_ref().map_or(0, |s| s.sequence);
    let mut records = events.read_from(stream, after).await?;
    let mut tail = Vec::new();
    while let Some(record) = records.next().await {
        let record = record?;
        let event = decode_event::<B::Event>(&record);
        if event.is_none() {
            tracing::debug!(
                sequence = record.sequence,
                event_type = %record.event_type,
                "unrecognized event type"
            );
        }
        tail.push((record.sequence, event));
    }

    Ok(fold::replay(behavior, snapshot, tail))
}

/// Async handle to a running aggregate unit.
///
/// Lightweight, cloneable, and `Send + Sync`. Communicates with the unit's
/// task over a bounded channel.
pub struct AggregateHandle<B: Behavior> {
    id: AggregateId,
    sender: mpsc::Sender<UnitMessage<B>>,
}

// Manual `Clone` because `B` itself need not be `Clone` for the handle.
impl<B: Behavior> Clone for AggregateHandle<B> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            sender: self.sender.clone(),
        }
    }
}

impl<B: Behavior> std::fmt::Debug for AggregateHandle<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateHandle")
            .field("id", &self.id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl<B: Behavior> AggregateHandle<B> {
    /// The identity this handle addresses.
    pub fn id(&self) -> &AggregateId {
        &self.id
    }

    /// Send a command and wait for it to settle.
    ///
    /// Returns every committed event, in order, with its sequence and
    /// metadata. An accepted command that emits nothing returns an empty
    /// list.
    ///
    /// # Errors
    ///
    /// Exactly one error per failed command; nothing is committed. See
    /// [`ExecuteError::class`] for how variants map onto fault classes.
    pub async fn execute(&self, cmd: B::Command) -> ExecuteResult<B> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(UnitMessage::Execute { cmd, reply: tx })
            .await
            .map_err(|_| ExecuteError::UnitGone)?;
        rx.await.map_err(|_| ExecuteError::UnitGone)?
    }

    /// A clone of the current value. Answered even while a command is in
    /// flight (the value before that command).
    ///
    /// # Errors
    ///
    /// * [`StateError::NotFound`] -- nothing has created a value yet.
    /// * [`StateError::UnitGone`] -- the unit has stopped.
    pub async fn state(&self) -> Result<B::Value, StateError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(UnitMessage::GetState { reply: tx })
            .await
            .map_err(|_| StateError::UnitGone)?;
        rx.await.map_err(|_| StateError::UnitGone)?
    }

    /// Whether a value exists for this identity.
    pub async fn exists(&self) -> Result<bool, StateError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(UnitMessage::Exists { reply: tx })
            .await
            .map_err(|_| StateError::UnitGone)?;
        rx.await.map_err(|_| StateError::UnitGone)
    }

    pub async fn status(&self) -> Result<UnitStatus, StateError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(UnitMessage::Status { reply: tx })
            .await
            .map_err(|_| StateError::UnitGone)?;
        rx.await.map_err(|_| StateError::UnitGone)
    }

    /// Stop the unit and wait until it has exited.
    ///
    /// An in-flight command and any parked commands are answered with
    /// [`ExecuteError::UnitGone`]. Events already committed stay committed.
    pub async fn terminate(&self) {
        if self.sender.send(UnitMessage::Terminate).await.is_ok() {
            self.sender.closed().await;
        }
    }

    /// Check whether the unit backing this handle is still running.
    ///
    /// Returns `false` once the unit has exited (terminated, idle timeout,
    /// or failed re-recovery).
    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }
}

/// Recover a unit's state from the stores and start its task.
///
/// # Errors
///
/// Returns [`StoreError`] if the event history cannot be read. Snapshot
/// problems only cost a longer replay.
pub async fn spawn_unit<B: Behavior>(
    id: impl Into<AggregateId>,
    behavior: Arc<B>,
    events: Arc<dyn EventStore>,
    snapshots: Arc<dyn SnapshotStore>,
    config: UnitConfig,
) -> Result<AggregateHandle<B>, StoreError> {
    let id = id.into();
    let stream = StreamId::new(behavior.aggregate_type(), id.clone());
    let span = tracing::info_span!(
        "aggregate_unit",
        aggregate_type = %stream.aggregate_type,
        id = %stream.id,
    );

    let mut unit = AggregateUnit {
        stream,
        behavior,
        events,
        snapshots,
        config,
        lifecycle: LifecycleState::Uninitialized,
        value: None,
        sequence: 0,
        since_snapshot: 0,
        deferred: VecDeque::new(),
        in_flight: None,
    };
    unit.recover().instrument(span.clone()).await?;

    let (tx, rx) = mpsc::channel::<UnitMessage<B>>(MAILBOX_CAPACITY);
    tokio::spawn(unit.run(rx).instrument(span));

    Ok(AggregateHandle { id, sender: tx })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tempfile::TempDir;
    use tokio::sync::Semaphore;

    use super::*;
    use crate::behavior::test_fixtures::*;
    use crate::error::ErrorClass;
    use crate::snapshot::{FileSnapshotStore, InMemorySnapshotStore, NoSnapshots};
    use crate::storage::{FileEventStore, InMemoryEventStore};

    fn memory() -> (Arc<InMemoryEventStore>, Arc<InMemorySnapshotStore>) {
        (
            Arc::new(InMemoryEventStore::new()),
            Arc::new(InMemorySnapshotStore::new()),
        )
    }

    async fn spawn(
        behavior: UserBehavior,
        events: Arc<dyn EventStore>,
        snapshots: Arc<dyn SnapshotStore>,
        config: UnitConfig,
    ) -> AggregateHandle<UserBehavior> {
        spawn_unit("u-1", Arc::new(behavior), events, snapshots, config)
            .await
            .expect("spawn_unit should succeed")
    }

    async fn fresh() -> AggregateHandle<UserBehavior> {
        let (events, snapshots) = memory();
        spawn(user_behavior(), events, snapshots, UnitConfig::default()).await
    }

    /// Wraps the in-memory store, counting appends and optionally failing.
    #[derive(Default)]
    struct FlakyEvents {
        inner: InMemoryEventStore,
        appends: AtomicUsize,
        fail: AtomicBool,
        /// Commit the next batch, then report an error anyway.
        commit_then_fail: AtomicBool,
    }

    #[async_trait]
    impl EventStore for FlakyEvents {
        async fn append(
            &self,
            stream: &StreamId,
            expected_head: u64,
            events: Vec<ProposedEvent>,
        ) -> Result<SequenceRange, StoreError> {
            self.appends.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(StoreError::Io(std::io::Error::other("disk on fire")));
            }
            if self.commit_then_fail.swap(false, Ordering::SeqCst) {
                self.inner.append(stream, expected_head, events).await?;
                return Err(StoreError::Io(std::io::Error::other("fsync failed")));
            }
            self.inner.append(stream, expected_head, events).await
        }

        async fn read_from(
            &self,
            stream: &StreamId,
            after: u64,
        ) -> Result<crate::storage::EventStream, StoreError> {
            self.inner.read_from(stream, after).await
        }
    }

    /// Counts snapshot saves.
    #[derive(Default)]
    struct CountingSnapshots {
        inner: InMemorySnapshotStore,
        saves: AtomicU64,
    }

    #[async_trait]
    impl SnapshotStore for CountingSnapshots {
        async fn save(
            &self,
            stream: &StreamId,
            snapshot: Snapshot<serde_json::Value>,
        ) -> Result<(), StoreError> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            self.inner.save(stream, snapshot).await
        }

        async fn load_latest(
            &self,
            stream: &StreamId,
        ) -> Result<Option<Snapshot<serde_json::Value>>, StoreError> {
            self.inner.load_latest(stream).await
        }
    }

    #[tokio::test]
    async fn create_alice_commits_one_event() {
        let handle = fresh().await;
        let events = handle
            .execute(UserCommand::create("Alice", 30))
            .await
            .expect("create should succeed");

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].sequence, 1);
        assert_eq!(
            events[0].payload,
            UserEvent::Created {
                name: "Alice".into(),
                age: 30
            }
        );
        assert_eq!(events[0].metadata.aggregate_id.as_str(), "u-1");
        assert!(events[0].metadata.tags.contains("user"));

        let user = handle.state().await.expect("state");
        assert_eq!(
            user,
            User {
                name: "Alice".into(),
                age: 30,
                deleted: false
            }
        );
        let status = handle.status().await.expect("status");
        assert_eq!(status.lifecycle, LifecycleState::Available);
        assert_eq!(status.sequence, 1);
        assert_eq!(status.events_since_snapshot, 1);
    }

    #[tokio::test]
    async fn metadata_carries_the_command_id() {
        let handle = fresh().await;
        let cmd = UserCommand::create("Alice", 30);
        let command_id = cmd.command_id.clone();
        let events = handle.execute(cmd).await.expect("create");
        assert_eq!(events[0].metadata.command_id, command_id);
    }

    #[tokio::test]
    async fn negative_age_leaves_identity_uninitialized() {
        let handle = fresh().await;
        let err = handle
            .execute(UserCommand::create("Bob", -1))
            .await
            .expect_err("negative age must be rejected");
        assert_eq!(err.to_string(), "age must be >= 0");
        assert_eq!(err.class(), ErrorClass::DomainRejection);

        assert!(!handle.exists().await.expect("exists"));
        assert!(matches!(handle.state().await, Err(StateError::NotFound(_))));
        let status = handle.status().await.expect("status");
        assert_eq!(status.lifecycle, LifecycleState::Uninitialized);
        assert_eq!(status.sequence, 0);
    }

    #[tokio::test]
    async fn creating_twice_is_already_exists() {
        let handle = fresh().await;
        handle
            .execute(UserCommand::create("Alice", 30))
            .await
            .expect("create");
        let err = handle
            .execute(UserCommand::create("Alice", 31))
            .await
            .expect_err("second create must fail");
        assert!(matches!(err, ExecuteError::AlreadyExists(_)), "got {err:?}");
        assert_eq!(handle.state().await.expect("state").age, 30);
    }

    #[tokio::test]
    async fn update_before_create_is_not_found() {
        let handle = fresh().await;
        let err = handle
            .execute(UserCommand::change_name("Carol"))
            .await
            .expect_err("no value yet");
        assert!(matches!(err, ExecuteError::NotFound(_)), "got {err:?}");
        assert_eq!(handle.status().await.expect("status").sequence, 0);
    }

    #[tokio::test]
    async fn delete_then_rename_is_rejected() {
        let handle = fresh().await;
        handle
            .execute(UserCommand::create("Alice", 30))
            .await
            .expect("create");
        handle.execute(UserCommand::delete()).await.expect("delete");
        let err = handle
            .execute(UserCommand::change_name("Carol"))
            .await
            .expect_err("deleted users reject renames");
        assert_eq!(err.to_string(), "User is already deleted");

        let status = handle.status().await.expect("status");
        assert_eq!(status.sequence, 2);
        assert_eq!(handle.state().await.expect("state").name, "Alice");
    }

    #[tokio::test]
    async fn zero_events_is_success_without_append_or_snapshot() {
        let events = Arc::new(FlakyEvents::default());
        let snapshots = Arc::new(CountingSnapshots::default());
        let config = UnitConfig {
            snapshot_policy: SnapshotPolicy::every(1),
            ..UnitConfig::default()
        };
        let handle = spawn(user_behavior(), events.clone(), snapshots.clone(), config).await;
        handle
            .execute(UserCommand::create("Alice", 30))
            .await
            .expect("create");
        let before = handle.status().await.expect("status");

        let produced = handle.execute(UserCommand::touch()).await.expect("touch");
        assert!(produced.is_empty());

        assert_eq!(handle.status().await.expect("status"), before);
        assert_eq!(events.appends.load(Ordering::SeqCst), 1);
        assert_eq!(snapshots.saves.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn orphan_event_is_never_persisted() {
        let events = Arc::new(FlakyEvents::default());
        let (_, snapshots) = memory();
        let handle = spawn(user_behavior(), events.clone(), snapshots, UnitConfig::default()).await;
        handle
            .execute(UserCommand::create("Alice", 30))
            .await
            .expect("create");

        let err = handle
            .execute(UserCommand::audit())
            .await
            .expect_err("audited has no fold rule");
        assert!(
            matches!(&err, ExecuteError::OrphanEvent { event_type } if event_type == "Audited"),
            "got {err:?}"
        );
        assert_eq!(err.class(), ErrorClass::ConfigurationFault);
        assert_eq!(events.appends.load(Ordering::SeqCst), 1);
        assert_eq!(
            handle.status().await.expect("status").lifecycle,
            LifecycleState::Available
        );
    }

    #[tokio::test]
    async fn unhandled_command_is_a_configuration_fault() {
        let behavior = RuleBookFor::creation_only();
        let (events, snapshots) = memory();
        let handle = spawn(behavior, events, snapshots, UnitConfig::default()).await;
        handle
            .execute(UserCommand::create("Alice", 30))
            .await
            .expect("create");
        let cmd = UserCommand::delete();
        let command_id = cmd.command_id.clone();
        let err = handle.execute(cmd).await.expect_err("no update rules");
        assert!(
            matches!(&err, ExecuteError::Unhandled { command_id: id } if *id == command_id),
            "got {err:?}"
        );
        assert_eq!(err.class(), ErrorClass::ConfigurationFault);
    }

    /// Rule books built for individual tests.
    struct RuleBookFor;

    impl RuleBookFor {
        fn creation_only() -> UserBehavior {
            crate::rules::RuleBook::<User, UserCommand, UserEvent, UserError>::builder("user")
                .create_on(
                    "create",
                    |cmd: &UserCommand| matches!(cmd.action, UserAction::Create { .. }),
                    |_| {
                        Ok(vec![UserEvent::Created {
                            name: "Alice".into(),
                            age: 30,
                        }])
                    },
                )
                .fold_created(
                    |e| matches!(e, UserEvent::Created { .. }),
                    |_| User {
                        name: "Alice".into(),
                        age: 30,
                        deleted: false,
                    },
                )
                .build()
                .expect("valid")
        }

        /// A guard that panics when asked to rename to "boom".
        fn panicking_rename() -> UserBehavior {
            user_rule_builder()
                .reject_update_if(
                    "explode",
                    |_, cmd| matches!(&cmd.action, UserAction::ChangeName { name } if name == "boom"),
                    |_, _| panic!("guard exploded"),
                )
                .build()
                .expect("valid")
        }

        /// Renames wait for a permit from `gate` and track concurrency.
        fn gated(gate: Arc<Semaphore>, active: Arc<AtomicUsize>, peak: Arc<AtomicUsize>) -> UserBehavior {
            crate::rules::RuleBook::<User, UserCommand, UserEvent, UserError>::builder("user")
                .create_on(
                    "create",
                    |cmd: &UserCommand| matches!(cmd.action, UserAction::Create { .. }),
                    |cmd| match &cmd.action {
                        UserAction::Create { name, age } => Ok(vec![UserEvent::Created {
                            name: name.clone(),
                            age: *age,
                        }]),
                        _ => Ok(vec![]),
                    },
                )
                .update_on_async(
                    "gated-rename",
                    |_, cmd| matches!(cmd.action, UserAction::ChangeName { .. }),
                    move |_, cmd| {
                        let gate = Arc::clone(&gate);
                        let active = Arc::clone(&active);
                        let peak = Arc::clone(&peak);
                        let name = match &cmd.action {
                            UserAction::ChangeName { name } => name.clone(),
                            _ => String::new(),
                        };
                        async move {
                            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            let permit = gate.acquire().await.expect("gate open");
                            permit.forget();
                            active.fetch_sub(1, Ordering::SeqCst);
                            Ok(vec![UserEvent::NameChanged { name }])
                        }
                    },
                )
                .fold_created(
                    |e| matches!(e, UserEvent::Created { .. }),
                    |e| match e {
                        UserEvent::Created { name, age } => User {
                            name: name.clone(),
                            age: *age,
                            deleted: false,
                        },
                        _ => unreachable!("guarded by the predicate"),
                    },
                )
                .fold_updated(
                    |_, e| matches!(e, UserEvent::NameChanged { .. }),
                    |user, e| match e {
                        UserEvent::NameChanged { name } => User {
                            name: name.clone(),
                            ..user
                        },
                        _ => user,
                    },
                )
                .build()
                .expect("valid")
        }
    }

    #[tokio::test]
    async fn panicking_interpretation_is_a_runtime_fault() {
        let (events, snapshots) = memory();
        let handle = spawn(
            RuleBookFor::panicking_rename(),
            events,
            snapshots,
            UnitConfig::default(),
        )
        .await;
        handle
            .execute(UserCommand::create("Alice", 30))
            .await
            .expect("create");

        let err = handle
            .execute(UserCommand::change_name("boom"))
            .await
            .expect_err("handler panicked");
        assert!(
            matches!(&err, ExecuteError::Runtime(msg) if msg.contains("guard exploded")),
            "got {err:?}"
        );
        assert_eq!(err.class(), ErrorClass::RuntimeFault);

        // The unit survives and keeps its value.
        handle
            .execute(UserCommand::change_name("Carol"))
            .await
            .expect("next command works");
        assert_eq!(handle.state().await.expect("state").name, "Carol");
    }

    #[tokio::test]
    async fn deferred_commands_run_in_arrival_order_one_at_a_time() {
        let gate = Arc::new(Semaphore::new(0));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (events, snapshots) = memory();
        let handle = spawn(
            RuleBookFor::gated(gate.clone(), active.clone(), peak.clone()),
            events,
            snapshots,
            UnitConfig::default(),
        )
        .await;
        handle
            .execute(UserCommand::create("Alice", 30))
            .await
            .expect("create");

        let mut pending = Vec::new();
        for i in 0..5 {
            let h = handle.clone();
            pending.push(tokio::spawn(async move {
                h.execute(UserCommand::change_name(&format!("n{i}"))).await
            }));
            // Let each command reach the unit before sending the next.
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        // The first rename is in flight; the other four are parked.
        let status = handle.status().await.expect("status answered while busy");
        assert_eq!(status.lifecycle, LifecycleState::Busy);
        assert_eq!(status.deferred, 4);
        assert_eq!(handle.state().await.expect("state").name, "Alice");

        gate.add_permits(5);
        let mut sequences = Vec::new();
        for (i, task) in pending.into_iter().enumerate() {
            let events = task.await.expect("join").expect("rename should succeed");
            assert_eq!(
                events[0].payload,
                UserEvent::NameChanged {
                    name: format!("n{i}")
                }
            );
            sequences.push(events[0].sequence);
        }

        assert_eq!(sequences, vec![2, 3, 4, 5, 6]);
        assert_eq!(peak.load(Ordering::SeqCst), 1, "never two in flight");
        assert_eq!(handle.state().await.expect("state").name, "n4");
    }

    #[tokio::test]
    async fn full_holding_queue_refuses_commands() {
        let gate = Arc::new(Semaphore::new(0));
        let (events, snapshots) = memory();
        let config = UnitConfig {
            deferred_capacity: 1,
            ..UnitConfig::default()
        };
        let handle = spawn(
            RuleBookFor::gated(gate.clone(), Default::default(), Default::default()),
            events,
            snapshots,
            config,
        )
        .await;
        handle
            .execute(UserCommand::create("Alice", 30))
            .await
            .expect("create");

        let first = {
            let h = handle.clone();
            tokio::spawn(async move { h.execute(UserCommand::change_name("a")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = {
            let h = handle.clone();
            tokio::spawn(async move { h.execute(UserCommand::change_name("b")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = handle
            .execute(UserCommand::change_name("c"))
            .await
            .expect_err("queue is full");
        assert!(matches!(err, ExecuteError::Overloaded(1)), "got {err:?}");

        gate.add_permits(2);
        first.await.expect("join").expect("first rename");
        second.await.expect("join").expect("second rename");
        assert_eq!(handle.state().await.expect("state").name, "b");
    }

    #[tokio::test]
    async fn eleventh_event_triggers_snapshot_and_twelfth_restarts_count() {
        let (events, _) = memory();
        let snapshots = Arc::new(CountingSnapshots::default());
        let handle = spawn(
            user_behavior(),
            events,
            snapshots.clone(),
            UnitConfig::default(),
        )
        .await;
        handle
            .execute(UserCommand::create("Alice", 30))
            .await
            .expect("create");
        for i in 0..9 {
            handle
                .execute(UserCommand::change_name(&format!("n{i}")))
                .await
                .expect("rename");
        }
        let status = handle.status().await.expect("status");
        assert_eq!(status.events_since_snapshot, 10);
        assert_eq!(snapshots.saves.load(Ordering::SeqCst), 0);

        handle
            .execute(UserCommand::change_name("eleven"))
            .await
            .expect("rename");
        assert_eq!(snapshots.saves.load(Ordering::SeqCst), 1);
        assert_eq!(handle.status().await.expect("status").events_since_snapshot, 0);

        let stream = StreamId::new("user", "u-1");
        let saved = snapshots
            .load_latest(&stream)
            .await
            .expect("load")
            .expect("snapshot written");
        assert_eq!(saved.sequence, 11);
        assert_eq!(saved.lifecycle, LifecycleState::Available);
        assert_eq!(saved.value["name"], "eleven");

        handle
            .execute(UserCommand::change_name("twelve"))
            .await
            .expect("rename");
        assert_eq!(handle.status().await.expect("status").events_since_snapshot, 1);
    }

    #[tokio::test]
    async fn failed_snapshot_keeps_the_counter() {
        struct BrokenSnapshots;

        #[async_trait]
        impl SnapshotStore for BrokenSnapshots {
            async fn save(
                &self,
                _: &StreamId,
                _: Snapshot<serde_json::Value>,
            ) -> Result<(), StoreError> {
                Err(StoreError::Io(std::io::Error::other("read-only")))
            }

            async fn load_latest(
                &self,
                _: &StreamId,
            ) -> Result<Option<Snapshot<serde_json::Value>>, StoreError> {
                Ok(None)
            }
        }

        let (events, _) = memory();
        let config = UnitConfig {
            snapshot_policy: SnapshotPolicy::every(1),
            ..UnitConfig::default()
        };
        let handle = spawn(user_behavior(), events, Arc::new(BrokenSnapshots), config).await;
        handle
            .execute(UserCommand::create("Alice", 30))
            .await
            .expect("create");
        handle
            .execute(UserCommand::change_name("Bea"))
            .await
            .expect("commit succeeds even if the snapshot does not");
        assert_eq!(handle.status().await.expect("status").events_since_snapshot, 2);
    }

    #[tokio::test]
    async fn snapshot_recovery_matches_full_recovery_for_any_threshold() {
        for threshold in 1..=12 {
            let events: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
            let snapshots: Arc<dyn SnapshotStore> = Arc::new(InMemorySnapshotStore::new());
            let config = UnitConfig {
                snapshot_policy: SnapshotPolicy::every(threshold),
                ..UnitConfig::default()
            };
            let handle = spawn(
                user_behavior(),
                Arc::clone(&events),
                Arc::clone(&snapshots),
                config.clone(),
            )
            .await;
            handle
                .execute(UserCommand::create("Alice", 30))
                .await
                .expect("create");
            for i in 0..23 {
                handle
                    .execute(UserCommand::change_name(&format!("n{i}")))
                    .await
                    .expect("rename");
            }
            handle.execute(UserCommand::delete()).await.expect("delete");
            let live = handle.state().await.expect("state");
            handle.terminate().await;

            let with_snapshots =
                spawn(user_behavior(), Arc::clone(&events), snapshots, config.clone()).await;
            let from_history = spawn(user_behavior(), events, Arc::new(NoSnapshots), config).await;

            assert_eq!(with_snapshots.state().await.expect("state"), live, "threshold {threshold}");
            assert_eq!(from_history.state().await.expect("state"), live, "threshold {threshold}");
            assert_eq!(
                with_snapshots.status().await.expect("status").sequence,
                25,
                "threshold {threshold}"
            );
        }
    }

    #[tokio::test]
    async fn recovery_counts_tail_events_since_snapshot() {
        let (events, snapshots) = memory();
        let config = UnitConfig {
            snapshot_policy: SnapshotPolicy::every(3),
            ..UnitConfig::default()
        };
        let handle = spawn(user_behavior(), events.clone(), snapshots.clone(), config.clone()).await;
        handle
            .execute(UserCommand::create("Alice", 30))
            .await
            .expect("create");
        // Sequences 2..=6: a snapshot lands at 4, leaving 5 and 6 in the tail.
        for i in 0..5 {
            handle
                .execute(UserCommand::change_name(&format!("n{i}")))
                .await
                .expect("rename");
        }
        let live = handle.status().await.expect("status");
        assert_eq!(live.events_since_snapshot, 2);
        handle.terminate().await;

        let restored = spawn(user_behavior(), events, snapshots, config).await;
        let status = restored.status().await.expect("status");
        assert_eq!(status.sequence, 6);
        assert_eq!(status.events_since_snapshot, 2);
        assert_eq!(status.lifecycle, LifecycleState::Available);
    }

    #[tokio::test]
    async fn state_persists_across_respawn_on_disk() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let events: Arc<dyn EventStore> = Arc::new(FileEventStore::new(tmp.path()));
        let snapshots: Arc<dyn SnapshotStore> = Arc::new(FileSnapshotStore::new(tmp.path()));
        {
            let handle = spawn(
                user_behavior(),
                Arc::clone(&events),
                Arc::clone(&snapshots),
                UnitConfig::default(),
            )
            .await;
            handle
                .execute(UserCommand::create("Alice", 30))
                .await
                .expect("create");
            handle
                .execute(UserCommand::change_name("Bea"))
                .await
                .expect("rename");
            handle.terminate().await;
        }

        let events: Arc<dyn EventStore> = Arc::new(FileEventStore::new(tmp.path()));
        let handle = spawn(user_behavior(), events, snapshots, UnitConfig::default()).await;
        assert_eq!(handle.state().await.expect("state").name, "Bea");
        handle
            .execute(UserCommand::change_name("Cleo"))
            .await
            .expect("append continues after the recovered head");
        assert_eq!(handle.status().await.expect("status").sequence, 3);
    }

    #[tokio::test]
    async fn persistence_fault_reverts_to_prior_state() {
        let events = Arc::new(FlakyEvents::default());
        let (_, snapshots) = memory();
        let handle = spawn(user_behavior(), events.clone(), snapshots, UnitConfig::default()).await;
        handle
            .execute(UserCommand::create("Alice", 30))
            .await
            .expect("create");

        events.fail.store(true, Ordering::SeqCst);
        let err = handle
            .execute(UserCommand::change_name("Bea"))
            .await
            .expect_err("append fails");
        assert_eq!(err.class(), ErrorClass::PersistenceFault);

        let status = handle.status().await.expect("status");
        assert_eq!(status.lifecycle, LifecycleState::Available);
        assert_eq!(status.sequence, 1);
        assert_eq!(handle.state().await.expect("state").name, "Alice");

        events.fail.store(false, Ordering::SeqCst);
        handle
            .execute(UserCommand::change_name("Bea"))
            .await
            .expect("works once the store recovers");
        assert_eq!(handle.status().await.expect("status").sequence, 2);
    }

    #[tokio::test]
    async fn persistence_fault_during_creation_stays_uninitialized() {
        let events = Arc::new(FlakyEvents::default());
        events.fail.store(true, Ordering::SeqCst);
        let (_, snapshots) = memory();
        let handle = spawn(user_behavior(), events, snapshots, UnitConfig::default()).await;

        let err = handle
            .execute(UserCommand::create("Alice", 30))
            .await
            .expect_err("append fails");
        assert!(matches!(err, ExecuteError::Persistence(_)));
        assert!(!handle.exists().await.expect("exists"));
        assert_eq!(
            handle.status().await.expect("status").lifecycle,
            LifecycleState::Uninitialized
        );
    }

    #[tokio::test]
    async fn failed_ack_after_commit_resyncs_from_the_log() {
        let events = Arc::new(FlakyEvents::default());
        let (_, snapshots) = memory();
        let handle = spawn(user_behavior(), events.clone(), snapshots, UnitConfig::default()).await;
        handle
            .execute(UserCommand::create("Alice", 30))
            .await
            .expect("create");

        events.commit_then_fail.store(true, Ordering::SeqCst);
        let err = handle
            .execute(UserCommand::change_name("Bea"))
            .await
            .expect_err("the store reported a failure");
        assert_eq!(err.class(), ErrorClass::PersistenceFault);

        // The batch did land, so the unit adopts it.
        assert_eq!(handle.state().await.expect("state").name, "Bea");
        assert_eq!(handle.status().await.expect("status").sequence, 2);

        let next = handle
            .execute(UserCommand::change_name("Cleo"))
            .await
            .expect("appends continue from the real head");
        assert_eq!(next[0].sequence, 3);
    }

    #[tokio::test]
    async fn conflict_picks_up_the_other_writers_events() {
        let (events, snapshots) = memory();
        let handle = spawn(user_behavior(), events.clone(), snapshots, UnitConfig::default()).await;
        handle
            .execute(UserCommand::create("Alice", 30))
            .await
            .expect("create");

        let outside = encode_event(
            &UserEvent::NameChanged { name: "Zoe".into() },
            EventMetadata::new("u-1".into(), "elsewhere", Default::default()),
        )
        .expect("encode");
        events
            .append(&StreamId::new("user", "u-1"), 1, vec![outside])
            .await
            .expect("outside append");

        let err = handle
            .execute(UserCommand::change_name("Bea"))
            .await
            .expect_err("head moved underneath the unit");
        assert!(
            matches!(err, ExecuteError::Persistence(StoreError::Conflict { .. })),
            "got {err:?}"
        );
        assert_eq!(handle.state().await.expect("state").name, "Zoe");

        let next = handle
            .execute(UserCommand::change_name("Bea"))
            .await
            .expect("retry succeeds after resync");
        assert_eq!(next[0].sequence, 3);
    }

    #[tokio::test]
    async fn recover_policy_reloads_after_a_fault() {
        let events = Arc::new(FlakyEvents::default());
        let (_, snapshots) = memory();
        let config = UnitConfig {
            on_persistence_fault: PersistenceFaultPolicy::Recover,
            ..UnitConfig::default()
        };
        let handle = spawn(user_behavior(), events.clone(), snapshots, config).await;
        handle
            .execute(UserCommand::create("Alice", 30))
            .await
            .expect("create");

        events.fail.store(true, Ordering::SeqCst);
        handle
            .execute(UserCommand::change_name("Bea"))
            .await
            .expect_err("append fails");
        events.fail.store(false, Ordering::SeqCst);

        assert!(handle.is_alive());
        let status = handle.status().await.expect("status");
        assert_eq!(status.sequence, 1);
        assert_eq!(status.events_since_snapshot, 1);
        assert_eq!(handle.state().await.expect("state").name, "Alice");
    }

    #[tokio::test]
    async fn terminate_answers_parked_commands_with_unit_gone() {
        let gate = Arc::new(Semaphore::new(0));
        let (events, snapshots) = memory();
        let handle = spawn(
            RuleBookFor::gated(gate, Default::default(), Default::default()),
            events,
            snapshots,
            UnitConfig::default(),
        )
        .await;
        handle
            .execute(UserCommand::create("Alice", 30))
            .await
            .expect("create");

        let in_flight = {
            let h = handle.clone();
            tokio::spawn(async move { h.execute(UserCommand::change_name("a")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let parked = {
            let h = handle.clone();
            tokio::spawn(async move { h.execute(UserCommand::change_name("b")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        handle.terminate().await;
        assert!(!handle.is_alive());
        assert!(matches!(
            in_flight.await.expect("join"),
            Err(ExecuteError::UnitGone)
        ));
        assert!(matches!(
            parked.await.expect("join"),
            Err(ExecuteError::UnitGone)
        ));
        assert!(matches!(handle.state().await, Err(StateError::UnitGone)));
    }

    #[tokio::test]
    async fn idle_timeout_shuts_down_unit() {
        let (events, snapshots) = memory();
        let config = UnitConfig {
            idle_timeout: Some(Duration::from_millis(200)),
            ..UnitConfig::default()
        };
        let handle = spawn(user_behavior(), events.clone(), snapshots.clone(), config).await;
        handle
            .execute(UserCommand::create("Alice", 30))
            .await
            .expect("create");

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!handle.is_alive(), "unit should be gone after idle timeout");

        // Re-spawning recovers state from the stores.
        let handle = spawn(user_behavior(), events, snapshots, UnitConfig::default()).await;
        assert_eq!(handle.state().await.expect("state").name, "Alice");
    }

    #[tokio::test]
    async fn activity_prevents_idle_eviction() {
        let (events, snapshots) = memory();
        let config = UnitConfig {
            idle_timeout: Some(Duration::from_millis(300)),
            ..UnitConfig::default()
        };
        let handle = spawn(user_behavior(), events, snapshots, config).await;
        handle
            .execute(UserCommand::create("Alice", 30))
            .await
            .expect("create");
        for i in 0..5 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            handle
                .execute(UserCommand::change_name(&format!("n{i}")))
                .await
                .expect("rename");
        }
        assert!(handle.is_alive(), "unit should still be alive during activity");
    }
}
