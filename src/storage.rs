//! Event storage trait and built-in backends.
//!
//! The file backend keeps one JSON Lines log per stream:
//! ```text
//! <base_dir>/
//!     streams/
//!         <aggregate_type>/
//!             <instance_id>/
//!                 events.jsonl    -- one line per committed batch
//!     snapshots/
//!         <aggregate_type>/
//!             <instance_id>/
//!                 snapshot.json
//! ```
//!
//! Each line holds the JSON array of [`RecordedEvent`]s from one append, so
//! a batch becomes visible all at once or not at all. A crash mid-write
//! leaves an unterminated last line; readers ignore it and the next append
//! truncates it away.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tokio_stream::Stream;

use crate::error::StoreError;
use crate::event::{ProposedEvent, RecordedEvent, SequenceRange};
use crate::identity::StreamId;

/// Ordered events read back from a stream.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<RecordedEvent, StoreError>> + Send>>;

/// Durable, per-stream, append-only event log.
///
/// Sequence numbers start at 1 and are dense within a stream.
#[async_trait]
pub trait EventStore: Send + Sync + 'static {
    /// Atomically append `events` after `expected_head`.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Conflict`] if the stream head is not `expected_head`.
    /// - [`StoreError::EmptyAppend`] if `events` is empty.
    /// - I/O and serialization errors from the backend.
    async fn append(
        &self,
        stream: &StreamId,
        expected_head: u64,
        events: Vec<ProposedEvent>,
    ) -> Result<SequenceRange, StoreError>;

    /// Every event with a sequence greater than `after`, in order.
    ///
    /// The stream is finite. To continue later, call again with the last
    /// sequence seen.
    async fn read_from(&self, stream: &StreamId, after: u64) -> Result<EventStream, StoreError>;
}

#[async_trait]
impl<T: EventStore + ?Sized> EventStore for Arc<T> {
    async fn append(
        &self,
        stream: &StreamId,
        expected_head: u64,
        events: Vec<ProposedEvent>,
    ) -> Result<SequenceRange, StoreError> {
        (**self).append(stream, expected_head, events).await
    }

    async fn read_from(&self, stream: &StreamId, after: u64) -> Result<EventStream, StoreError> {
        (**self).read_from(stream, after).await
    }
}

/// Number records from `head + 1` and report the range they occupy.
fn number(head: u64, events: Vec<ProposedEvent>) -> (Vec<RecordedEvent>, SequenceRange) {
    let range = SequenceRange {
        first: head + 1,
        last: head + events.len() as u64,
    };
    let records = events
        .into_iter()
        .zip(range.first..)
        .map(|(event, sequence)| event.record(sequence))
        .collect();
    (records, range)
}

fn event_stream(events: Vec<RecordedEvent>) -> EventStream {
    Box::pin(tokio_stream::iter(events.into_iter().map(Ok)))
}

/// Process-local event store. Useful for tests and ephemeral aggregates.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    streams: RwLock<HashMap<StreamId, Vec<RecordedEvent>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(
        &self,
        stream: &StreamId,
        expected_head: u64,
        events: Vec<ProposedEvent>,
    ) -> Result<SequenceRange, StoreError> {
        if events.is_empty() {
            return Err(StoreError::EmptyAppend(stream.to_string()));
        }
        let mut streams = self.streams.write().await;
        let log = streams.entry(stream.clone()).or_default();
        let head = log.len() as u64;
        if head != expected_head {
            return Err(StoreError::Conflict {
                stream: stream.to_string(),
                expected: expected_head,
                actual: head,
            });
        }
        let (records, range) = number(head, events);
        log.extend(records);
        Ok(range)
    }

    async fn read_from(&self, stream: &StreamId, after: u64) -> Result<EventStream, StoreError> {
        let streams = self.streams.read().await;
        let events: Vec<RecordedEvent> = streams
            .get(stream)
            .map(|log| {
                log.iter()
                    .filter(|e| e.sequence > after)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(event_stream(events))
    }
}

/// Maps stream names onto the on-disk directory layout.
///
/// Cheap to clone (it wraps a single `PathBuf`). Aggregate types and ids
/// become path components, so both are checked before use.
#[derive(Debug, Clone)]
pub struct StreamLayout {
    base_dir: PathBuf,
}

impl StreamLayout {
    /// Create a layout rooted at `base_dir`. Nothing is created on disk.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Returns the root directory of this layout.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// `<base_dir>/streams/<aggregate_type>/<instance_id>`
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidStream`] if either part is not a plain path
    /// component.
    pub fn stream_dir(&self, stream: &StreamId) -> Result<PathBuf, StoreError> {
        validate(stream)?;
        Ok(self
            .base_dir
            .join("streams")
            .join(&stream.aggregate_type)
            .join(stream.id.as_str()))
    }

    /// `<base_dir>/streams/<aggregate_type>/<instance_id>/events.jsonl`
    pub fn events_path(&self, stream: &StreamId) -> Result<PathBuf, StoreError> {
        Ok(self.stream_dir(stream)?.join("events.jsonl"))
    }

    /// `<base_dir>/snapshots/<aggregate_type>/<instance_id>/snapshot.json`
    pub fn snapshot_path(&self, stream: &StreamId) -> Result<PathBuf, StoreError> {
        validate(stream)?;
        Ok(self
            .base_dir
            .join("snapshots")
            .join(&stream.aggregate_type)
            .join(stream.id.as_str())
            .join("snapshot.json"))
    }

    /// Lists all instance ids that have a stream directory, sorted.
    ///
    /// Returns an empty vector if the aggregate type directory does not
    /// exist.
    pub async fn list_streams(&self, aggregate_type: &str) -> io::Result<Vec<String>> {
        let type_dir = self.base_dir.join("streams").join(aggregate_type);

        let mut entries = match tokio::fs::read_dir(&type_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                ids.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

fn validate(stream: &StreamId) -> Result<(), StoreError> {
    let safe = |part: &str| {
        !part.is_empty()
            && part != "."
            && part != ".."
            && !part.contains(['/', '\\', '\0'])
    };
    if safe(&stream.aggregate_type) && safe(stream.id.as_str()) {
        Ok(())
    } else {
        Err(StoreError::InvalidStream(stream.to_string()))
    }
}

/// A parsed log file.
#[derive(Debug)]
struct LogContents {
    events: Vec<RecordedEvent>,
    /// Byte length of the complete lines.
    valid_len: u64,
    /// An unterminated trailing line was found past `valid_len`.
    torn: bool,
}

fn parse_log(stream: &StreamId, bytes: &[u8]) -> Result<LogContents, StoreError> {
    let mut events: Vec<RecordedEvent> = Vec::new();
    let mut offset = 0;
    let mut line_no = 0;

    while offset < bytes.len() {
        line_no += 1;
        let rest = &bytes[offset..];
        let Some(end) = rest.iter().position(|b| *b == b'\n') else {
            return Ok(LogContents {
                events,
                valid_len: offset as u64,
                torn: true,
            });
        };

        let batch: Vec<RecordedEvent> =
            serde_json::from_slice(&rest[..end]).map_err(|e| StoreError::Corrupt {
                stream: stream.to_string(),
                line: line_no,
                reason: e.to_string(),
            })?;
        for event in batch {
            let expected = events.len() as u64 + 1;
            if event.sequence != expected {
                return Err(StoreError::Corrupt {
                    stream: stream.to_string(),
                    line: line_no,
                    reason: format!("expected sequence {expected}, found {}", event.sequence),
                });
            }
            events.push(event);
        }
        offset += end + 1;
    }

    Ok(LogContents {
        events,
        valid_len: offset as u64,
        torn: false,
    })
}

async fn read_log(stream: &StreamId, path: &Path) -> Result<LogContents, StoreError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => parse_log(stream, &bytes),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(LogContents {
            events: Vec::new(),
            valid_len: 0,
            torn: false,
        }),
        Err(e) => Err(e.into()),
    }
}

/// Event store backed by one JSON Lines file per stream.
///
/// Appends to one stream are serialized by a per-stream lock; different
/// streams never wait on each other. The store assumes it is the only
/// writer of its directory.
#[derive(Debug)]
pub struct FileEventStore {
    layout: StreamLayout,
    /// Known head per stream; `None` until the file has been scanned.
    heads: Mutex<HashMap<StreamId, Arc<Mutex<Option<u64>>>>>,
}

impl FileEventStore {
    /// Create a store rooted at `base_dir`. Directories are created lazily.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            layout: StreamLayout::new(base_dir),
            heads: Mutex::new(HashMap::new()),
        }
    }

    pub fn layout(&self) -> &StreamLayout {
        &self.layout
    }

    /// Instance ids of `aggregate_type` that have a stream on disk.
    pub async fn list_streams(&self, aggregate_type: &str) -> io::Result<Vec<String>> {
        self.layout.list_streams(aggregate_type).await
    }

    async fn head_slot(&self, stream: &StreamId) -> Arc<Mutex<Option<u64>>> {
        let mut heads = self.heads.lock().await;
        Arc::clone(heads.entry(stream.clone()).or_default())
    }

    /// Scan the log for its head, cutting off a torn tail first.
    async fn open_head(&self, stream: &StreamId, path: &Path) -> Result<u64, StoreError> {
        let log = read_log(stream, path).await?;
        if log.torn {
            tracing::warn!(
                stream = %stream,
                valid_len = log.valid_len,
                "truncating torn tail of event log"
            );
            let file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
            file.set_len(log.valid_len).await?;
            file.sync_data().await?;
        }
        Ok(log.events.len() as u64)
    }
}

#[async_trait]
impl EventStore for FileEventStore {
    async fn append(
        &self,
        stream: &StreamId,
        expected_head: u64,
        events: Vec<ProposedEvent>,
    ) -> Result<SequenceRange, StoreError> {
        if events.is_empty() {
            return Err(StoreError::EmptyAppend(stream.to_string()));
        }
        let path = self.layout.events_path(stream)?;
        let slot = self.head_slot(stream).await;
        let mut known = slot.lock().await;

        let head = match *known {
            Some(head) => head,
            None => {
                let head = self.open_head(stream, &path).await?;
                *known = Some(head);
                head
            }
        };
        if head != expected_head {
            return Err(StoreError::Conflict {
                stream: stream.to_string(),
                expected: expected_head,
                actual: head,
            });
        }

        let (records, range) = number(head, events);
        let mut line = serde_json::to_vec(&records)?;
        line.push(b'\n');

        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        // Forget the head until the write is durable, so a failed write is
        // rescanned (and its torn tail cut) before the next append.
        *known = None;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&line).await?;
        file.sync_data().await?;
        *known = Some(range.last);

        Ok(range)
    }

    async fn read_from(&self, stream: &StreamId, after: u64) -> Result<EventStream, StoreError> {
        let path = self.layout.events_path(stream)?;
        let log = read_log(stream, &path).await?;
        if log.torn {
            tracing::warn!(stream = %stream, "ignoring torn tail of event log");
        }
        let events: Vec<RecordedEvent> = log
            .events
            .into_iter()
            .filter(|e| e.sequence > after)
            .collect();
        Ok(event_stream(events))
    }
}
