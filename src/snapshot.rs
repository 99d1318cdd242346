//! Snapshot policy and snapshot persistence.
//!
//! A snapshot caches `(sequence, lifecycle, value)` for one stream so that
//! recovery only replays the tail after it. Snapshots are never
//! authoritative: losing or corrupting one only costs a longer replay.
//!
//! The file backend stores one JSON document per stream at
//! `<base_dir>/snapshots/<aggregate_type>/<instance_id>/snapshot.json`.
//! Writes are atomic via a temp-rename pattern to prevent corruption
//! from crashes mid-write.

use std::collections::HashMap;
use std::io;
use std::num::NonZeroU64;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::sync::RwLock;

use crate::actor::LifecycleState;
use crate::error::StoreError;
use crate::identity::StreamId;
use crate::storage::StreamLayout;

/// A point-in-time copy of an aggregate's value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(serialize = "V: Serialize", deserialize = "V: DeserializeOwned"))]
pub struct Snapshot<V> {
    /// Sequence of the last event folded into `value`.
    pub sequence: u64,
    /// Lifecycle state in effect when the snapshot was taken.
    pub lifecycle: LifecycleState,
    pub value: V,
}

impl Snapshot<serde_json::Value> {
    /// Capture `value` in the type-erased form stores persist.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the value cannot be serialized.
    pub fn encode<V: Serialize>(
        sequence: u64,
        lifecycle: LifecycleState,
        value: &V,
    ) -> serde_json::Result<Self> {
        Ok(Self {
            sequence,
            lifecycle,
            value: serde_json::to_value(value)?,
        })
    }

    /// Recover the typed snapshot.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the stored value no longer matches `V`.
    pub fn decode<V: DeserializeOwned>(self) -> serde_json::Result<Snapshot<V>> {
        Ok(Snapshot {
            sequence: self.sequence,
            lifecycle: self.lifecycle,
            value: serde_json::from_value(self.value)?,
        })
    }
}

/// When a unit writes a snapshot.
///
/// The unit counts events folded since its last snapshot. With
/// `Every(n)`, a snapshot is written once that count exceeds `n`: after ten
/// events the eleventh triggers the write, and the twelfth starts a fresh
/// cycle at one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotPolicy {
    Never,
    Every(NonZeroU64),
}

impl SnapshotPolicy {
    pub const DEFAULT_THRESHOLD: u64 = 10;

    /// `Every(n)`, or `Never` for zero.
    pub fn every(n: u64) -> Self {
        NonZeroU64::new(n).map_or(Self::Never, Self::Every)
    }

    pub fn is_due(&self, events_since_snapshot: u64) -> bool {
        match self {
            Self::Never => false,
            Self::Every(n) => events_since_snapshot > n.get(),
        }
    }
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self::every(Self::DEFAULT_THRESHOLD)
    }
}

/// Durable cache of the latest snapshot per stream.
#[async_trait]
pub trait SnapshotStore: Send + Sync + 'static {
    /// Store `snapshot` as the latest for `stream`.
    ///
    /// A snapshot older than the one already stored is ignored.
    async fn save(
        &self,
        stream: &StreamId,
        snapshot: Snapshot<serde_json::Value>,
    ) -> Result<(), StoreError>;

    /// Load the latest snapshot for `stream`, if any.
    async fn load_latest(
        &self,
        stream: &StreamId,
    ) -> Result<Option<Snapshot<serde_json::Value>>, StoreError>;
}

#[async_trait]
impl<T: SnapshotStore + ?Sized> SnapshotStore for Arc<T> {
    async fn save(
        &self,
        stream: &StreamId,
        snapshot: Snapshot<serde_json::Value>,
    ) -> Result<(), StoreError> {
        (**self).save(stream, snapshot).await
    }

    async fn load_latest(
        &self,
        stream: &StreamId,
    ) -> Result<Option<Snapshot<serde_json::Value>>, StoreError> {
        (**self).load_latest(stream).await
    }
}

/// Discards snapshots. Recovery always replays the full history.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSnapshots;

#[async_trait]
impl SnapshotStore for NoSnapshots {
    async fn save(&self, _: &StreamId, _: Snapshot<serde_json::Value>) -> Result<(), StoreError> {
        Ok(())
    }

    async fn load_latest(
        &self,
        _: &StreamId,
    ) -> Result<Option<Snapshot<serde_json::Value>>, StoreError> {
        Ok(None)
    }
}

/// Process-local snapshot store. Keeps the highest-sequence snapshot.
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    snapshots: RwLock<HashMap<StreamId, Snapshot<serde_json::Value>>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn save(
        &self,
        stream: &StreamId,
        snapshot: Snapshot<serde_json::Value>,
    ) -> Result<(), StoreError> {
        let mut snapshots = self.snapshots.write().await;
        match snapshots.get(stream) {
            Some(existing) if existing.sequence > snapshot.sequence => {}
            _ => {
                snapshots.insert(stream.clone(), snapshot);
            }
        }
        Ok(())
    }

    async fn load_latest(
        &self,
        stream: &StreamId,
    ) -> Result<Option<Snapshot<serde_json::Value>>, StoreError> {
        Ok(self.snapshots.read().await.get(stream).cloned())
    }
}

/// Snapshot store backed by one JSON file per stream.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    layout: StreamLayout,
}

impl FileSnapshotStore {
    /// Create a store rooted at `base_dir`. Directories are created lazily.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            layout: StreamLayout::new(base_dir),
        }
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    /// Writes to `snapshot.json.tmp`, then renames it over `snapshot.json`,
    /// so readers never see a partially written file.
    async fn save(
        &self,
        stream: &StreamId,
        snapshot: Snapshot<serde_json::Value>,
    ) -> Result<(), StoreError> {
        if let Some(existing) = self.load_latest(stream).await?
            && existing.sequence > snapshot.sequence
        {
            tracing::debug!(
                %stream,
                stored = existing.sequence,
                offered = snapshot.sequence,
                "keeping newer snapshot"
            );
            return Ok(());
        }

        let path = self.layout.snapshot_path(stream)?;
        let dir = path
            .parent()
            .expect("snapshot_path always has a parent directory");
        tokio::fs::create_dir_all(dir).await?;

        let tmp_path = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(&snapshot)?;
        tokio::fs::write(&tmp_path, &json).await?;
        tokio::fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    /// A missing file is `None`. So is a file that fails to parse; that is
    /// logged and treated as a cache miss.
    async fn load_latest(
        &self,
        stream: &StreamId,
    ) -> Result<Option<Snapshot<serde_json::Value>>, StoreError> {
        let path = self.layout.snapshot_path(stream)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice(&bytes) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to deserialize snapshot; treating as cache miss"
                );
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::test_fixtures::User;

    fn stream() -> StreamId {
        StreamId::new("user", "u-1")
    }

    fn alice() -> User {
        User {
            name: "Alice".into(),
            age: 30,
            deleted: false,
        }
    }

    fn snap(sequence: u64) -> Snapshot<serde_json::Value> {
        Snapshot::encode(sequence, LifecycleState::Available, &alice()).expect("encode")
    }

    #[test]
    fn default_policy_is_every_ten() {
        assert_eq!(SnapshotPolicy::default(), SnapshotPolicy::every(10));
    }

    #[test]
    fn policy_fires_once_threshold_is_exceeded() {
        let policy = SnapshotPolicy::every(10);
        assert!(!policy.is_due(10));
        assert!(policy.is_due(11));
        assert!(!policy.is_due(1));
    }

    #[test]
    fn zero_threshold_means_never() {
        assert_eq!(SnapshotPolicy::every(0), SnapshotPolicy::Never);
        assert!(!SnapshotPolicy::Never.is_due(u64::MAX));
    }

    #[test]
    fn encode_then_decode_restores_the_value() {
        let decoded: Snapshot<User> = snap(7).decode().expect("decode");
        assert_eq!(decoded.sequence, 7);
        assert_eq!(decoded.lifecycle, LifecycleState::Available);
        assert_eq!(decoded.value, alice());
    }

    #[test]
    fn decode_into_wrong_type_fails() {
        let result = snap(1).decode::<Vec<u8>>();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn no_snapshots_never_returns_anything() {
        let store = NoSnapshots;
        store.save(&stream(), snap(3)).await.expect("save");
        assert!(store.load_latest(&stream()).await.expect("load").is_none());
    }

    #[tokio::test]
    async fn in_memory_keeps_highest_sequence() {
        let store = InMemorySnapshotStore::new();
        store.save(&stream(), snap(5)).await.expect("save");
        store.save(&stream(), snap(3)).await.expect("save");
        let latest = store
            .load_latest(&stream())
            .await
            .expect("load")
            .expect("present");
        assert_eq!(latest.sequence, 5);

        store.save(&stream(), snap(9)).await.expect("save");
        let latest = store.load_latest(&stream()).await.expect("load").expect("present");
        assert_eq!(latest.sequence, 9);
    }

    #[tokio::test]
    async fn file_store_save_then_load_roundtrips() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let store = FileSnapshotStore::new(dir.path());

        store.save(&stream(), snap(7)).await.expect("save should succeed");
        let loaded = store
            .load_latest(&stream())
            .await
            .expect("load should succeed")
            .expect("snapshot should exist");
        assert_eq!(loaded.sequence, 7);
        assert_eq!(loaded.value["name"], "Alice");
    }

    #[tokio::test]
    async fn file_store_keeps_highest_sequence() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let store = FileSnapshotStore::new(dir.path());
        store.save(&stream(), snap(5)).await.expect("save");
        store.save(&stream(), snap(3)).await.expect("stale save is not an error");
        let latest = store.load_latest(&stream()).await.expect("load").expect("present");
        assert_eq!(latest.sequence, 5);

        store.save(&stream(), snap(9)).await.expect("save");
        let latest = store.load_latest(&stream()).await.expect("load").expect("present");
        assert_eq!(latest.sequence, 9);
    }

    #[tokio::test]
    async fn file_store_missing_is_none() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let store = FileSnapshotStore::new(dir.path());
        let loaded = store.load_latest(&StreamId::new("user", "nobody")).await.expect("load");
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn file_store_corrupt_json_is_cache_miss() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let store = FileSnapshotStore::new(dir.path());
        let path = StreamLayout::new(dir.path())
            .snapshot_path(&stream())
            .expect("valid stream");
        std::fs::create_dir_all(path.parent().unwrap()).expect("create dir");
        std::fs::write(&path, b"this is not valid json!!!").expect("write corrupt file");

        let loaded = store
            .load_latest(&stream())
            .await
            .expect("load should succeed (not Err)");
        assert!(loaded.is_none(), "corrupt JSON should be a cache miss");
    }

    #[tokio::test]
    async fn file_store_leaves_no_temp_file() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let store = FileSnapshotStore::new(dir.path());
        store.save(&stream(), snap(3)).await.expect("save should succeed");

        let final_path = StreamLayout::new(dir.path())
            .snapshot_path(&stream())
            .expect("valid stream");
        assert!(final_path.exists(), "final snapshot file should exist");
        assert!(
            !final_path.with_extension("json.tmp").exists(),
            "temp file should not exist after successful save"
        );
    }

    #[tokio::test]
    async fn file_store_rejects_unsafe_ids() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let store = FileSnapshotStore::new(dir.path());
        let err = store
            .save(&StreamId::new("user", "../escape"), snap(1))
            .await
            .expect_err("path traversal must be rejected");
        assert!(matches!(err, StoreError::InvalidStream(_)));
    }
}
