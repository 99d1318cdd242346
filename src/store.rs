//! Top-level entry point that owns the stores, the registered behaviors,
//! and the cache of running units in a single [`AggregateStore`] type.
//!
//! The store is opened via [`AggregateStoreBuilder`], which selects the
//! event and snapshot backends and the per-unit configuration.

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};

use crate::actor::{AggregateHandle, PersistenceFaultPolicy, UnitConfig, spawn_unit};
use crate::behavior::Behavior;
use crate::error::RegistryError;
use crate::identity::AggregateId;
use crate::snapshot::{FileSnapshotStore, InMemorySnapshotStore, SnapshotPolicy, SnapshotStore};
use crate::storage::{EventStore, FileEventStore, InMemoryEventStore};

/// A cached handle with its behavior type erased.
trait LiveUnit: Send + Sync {
    fn is_alive(&self) -> bool;
    fn as_any(&self) -> &dyn Any;
}

impl<B: Behavior> LiveUnit for AggregateHandle<B> {
    fn is_alive(&self) -> bool {
        AggregateHandle::is_alive(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Activation slot for one identity.
///
/// The slot's own lock is held while its unit is recovered, so a slow
/// activation only delays callers asking for the same identity.
type Slot = Arc<Mutex<Option<Box<dyn LiveUnit>>>>;

/// Type-erased slot map keyed by `(TypeId, AggregateId)`.
///
/// `TypeId` identifies the behavior type at runtime. Downcasting through
/// [`LiveUnit::as_any`] recovers the typed handle.
type HandleCache = HashMap<(TypeId, AggregateId), Slot>;

/// One registered behavior instance per behavior type.
type BehaviorMap = HashMap<TypeId, Arc<dyn Any + Send + Sync>>;

/// Drop slots whose unit has stopped (or never started).
///
/// A slot still referenced outside the map belongs to a caller between
/// lookup and activation and is kept.
fn prune(cache: &mut HandleCache) {
    cache.retain(|_, slot| {
        if Arc::strong_count(slot) > 1 {
            return true;
        }
        match slot.try_lock() {
            Ok(unit) => unit.as_ref().is_some_and(|u| u.is_alive()),
            Err(_) => true,
        }
    });
}

/// Central registry that manages aggregate unit lifecycles.
///
/// Guarantees at most one live unit per identity per behavior type, which
/// is what keeps commands for one aggregate serialized.
///
/// `Clone` is cheap -- all internal state is `Arc`-wrapped.
#[derive(Clone)]
pub struct AggregateStore {
    events: Arc<dyn EventStore>,
    snapshots: Arc<dyn SnapshotStore>,
    behaviors: Arc<BehaviorMap>,
    cache: Arc<RwLock<HandleCache>>,
    config: UnitConfig,
}

// Manual `Debug` because the stores and cached handles are trait objects.
impl std::fmt::Debug for AggregateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateStore")
            .field("behaviors", &self.behaviors.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AggregateStore {
    pub fn builder() -> AggregateStoreBuilder {
        AggregateStoreBuilder::new()
    }

    /// Get a handle to an aggregate, spawning its unit if needed.
    ///
    /// If the unit is already running (cached and alive), returns a clone
    /// of the existing handle. Otherwise recovers the aggregate from the
    /// stores and starts a new unit. Recovery runs under the identity's
    /// slot lock only: two callers can never start two units for one
    /// identity, and other identities are not held up.
    ///
    /// # Errors
    ///
    /// * [`RegistryError::Unregistered`] -- no behavior of type `B` was
    ///   registered on the builder.
    /// * [`RegistryError::Recovery`] -- reading the event history failed.
    pub async fn get<B: Behavior>(
        &self,
        id: impl Into<AggregateId>,
    ) -> Result<AggregateHandle<B>, RegistryError> {
        let key = (TypeId::of::<B>(), id.into());
        let behavior = self.behavior::<B>()?;

        let slot = self.cache.read().await.get(&key).cloned();
        let slot = match slot {
            Some(slot) => slot,
            None => {
                let mut cache = self.cache.write().await;
                prune(&mut cache);
                Arc::clone(cache.entry(key.clone()).or_default())
            }
        };

        let mut unit = slot.lock().await;
        if let Some(cached) = unit.as_ref()
            && let Some(handle) = cached.as_any().downcast_ref::<AggregateHandle<B>>()
            && handle.is_alive()
        {
            return Ok(handle.clone());
        }

        tracing::debug!(
            aggregate_type = behavior.aggregate_type(),
            id = %key.1,
            "spawning unit"
        );
        // On failure the slot stays empty and is pruned later.
        let handle = spawn_unit(
            key.1,
            behavior,
            Arc::clone(&self.events),
            Arc::clone(&self.snapshots),
            self.config.clone(),
        )
        .await?;
        *unit = Some(Box::new(handle.clone()));
        Ok(handle)
    }

    /// Stop the unit for `id` and evict it from the cache.
    ///
    /// Returns `true` if a running unit was stopped. The next
    /// [`get`](Self::get) recovers a fresh unit from the stores.
    pub async fn terminate<B: Behavior>(&self, id: impl Into<AggregateId>) -> bool {
        let key = (TypeId::of::<B>(), id.into());
        let Some(slot) = self.cache.read().await.get(&key).cloned() else {
            return false;
        };
        let handle = slot.lock().await.take().and_then(|unit| {
            unit.as_any()
                .downcast_ref::<AggregateHandle<B>>()
                .filter(|h| h.is_alive())
                .cloned()
        });
        drop(slot);
        prune(&mut *self.cache.write().await);
        match handle {
            Some(handle) => {
                handle.terminate().await;
                true
            }
            None => false,
        }
    }

    /// Number of cached units that are still running.
    ///
    /// Also drops the cache entries of units that have stopped on their
    /// own, such as after an idle timeout.
    pub async fn live_units(&self) -> usize {
        let slots: Vec<Slot> = {
            let mut cache = self.cache.write().await;
            prune(&mut cache);
            cache.values().cloned().collect()
        };
        let mut live = 0;
        for slot in slots {
            if slot.lock().await.as_ref().is_some_and(|u| u.is_alive()) {
                live += 1;
            }
        }
        live
    }

    fn behavior<B: Behavior>(&self) -> Result<Arc<B>, RegistryError> {
        self.behaviors
            .get(&TypeId::of::<B>())
            .cloned()
            .and_then(|b| b.downcast::<B>().ok())
            .ok_or(RegistryError::Unregistered(type_name::<B>()))
    }
}

/// Builder for configuring and opening an [`AggregateStore`].
///
/// # Examples
///
/// ```no_run
/// # async fn example() -> std::io::Result<()> {
/// use eventfold_aggregates::AggregateStoreBuilder;
/// use std::time::Duration;
///
/// let store = AggregateStoreBuilder::new()
///     .base_dir("/tmp/my-app")
///     .snapshot_every(50)
///     .idle_timeout(Duration::from_secs(300))
///     .open()
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct AggregateStoreBuilder {
    base_dir: Option<PathBuf>,
    events: Option<Arc<dyn EventStore>>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    behaviors: BehaviorMap,
    config: UnitConfig,
}

impl AggregateStoreBuilder {
    /// Create a new builder with in-memory stores and default unit
    /// configuration.
    pub fn new() -> Self {
        Self {
            base_dir: None,
            events: None,
            snapshots: None,
            behaviors: HashMap::new(),
            config: UnitConfig::default(),
        }
    }

    /// Persist under `path`: selects [`FileEventStore`] and
    /// [`FileSnapshotStore`] for any store not set explicitly.
    pub fn base_dir(mut self, path: impl AsRef<Path>) -> Self {
        self.base_dir = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn event_store(mut self, store: Arc<dyn EventStore>) -> Self {
        self.events = Some(store);
        self
    }

    pub fn snapshot_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(store);
        self
    }

    /// Register the behavior used for aggregates of type `B`.
    ///
    /// Registering the same type twice keeps the last instance.
    pub fn behavior<B: Behavior>(mut self, behavior: B) -> Self {
        self.behaviors.insert(TypeId::of::<B>(), Arc::new(behavior));
        self
    }

    /// Snapshot once more than `n` events have been folded since the last
    /// one. Zero disables snapshots.
    pub fn snapshot_every(mut self, n: u64) -> Self {
        self.config.snapshot_policy = SnapshotPolicy::every(n);
        self
    }

    pub fn snapshot_policy(mut self, policy: SnapshotPolicy) -> Self {
        self.config.snapshot_policy = policy;
        self
    }

    /// Set the idle timeout for units.
    ///
    /// Units that receive no messages for this duration shut down; the
    /// next [`AggregateStore::get`] recovers them transparently.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = Some(timeout);
        self
    }

    pub fn deferred_capacity(mut self, capacity: usize) -> Self {
        self.config.deferred_capacity = capacity;
        self
    }

    pub fn on_persistence_fault(mut self, policy: PersistenceFaultPolicy) -> Self {
        self.config.on_persistence_fault = policy;
        self
    }

    /// Open the store.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if `base_dir` is set and cannot be created.
    pub async fn open(self) -> io::Result<AggregateStore> {
        if let Some(base) = &self.base_dir {
            tokio::fs::create_dir_all(base).await?;
        }

        let events = match (self.events, &self.base_dir) {
            (Some(store), _) => store,
            (None, Some(base)) => Arc::new(FileEventStore::new(base)) as Arc<dyn EventStore>,
            (None, None) => Arc::new(InMemoryEventStore::new()),
        };
        let snapshots = match (self.snapshots, &self.base_dir) {
            (Some(store), _) => store,
            (None, Some(base)) => {
                Arc::new(FileSnapshotStore::new(base)) as Arc<dyn SnapshotStore>
            }
            (None, None) => Arc::new(InMemorySnapshotStore::new()),
        };

        tracing::debug!(
            base_dir = ?self.base_dir,
            behaviors = self.behaviors.len(),
            "aggregate store opened"
        );

        Ok(AggregateStore {
            events,
            snapshots,
            behaviors: Arc::new(self.behaviors),
            cache: Arc::new(RwLock::new(HashMap::new())),
            config: self.config,
        })
    }
}

impl Default for AggregateStoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}
