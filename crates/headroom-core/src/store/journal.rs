//! Journal-backed usage store.
//!
//! Every insert and retraction is appended to a JSON-lines journal and
//! fsynced before the call returns. Queries are answered from an in-memory
//! index rebuilt by replaying the journal on open. Pruning rewrites the
//! journal with only the surviving events.

use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::AdmissionResult;
use crate::store::{MemoryUsageStore, UsageStore};
use crate::types::{shift_back, EventHandle, NodeId, TimeWindow, UsageEvent, WindowAggregate};

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalRecord {
    Insert { event: UsageEvent },
    Retract { handle: EventHandle },
}

impl JournalRecord {
    fn to_line(&self) -> AdmissionResult<Vec<u8>> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }
}

/// Append handle plus the length up to the last complete record.
#[derive(Debug)]
struct JournalWriter {
    file: File,
    committed: u64,
}

impl JournalWriter {
    async fn new(file: File) -> AdmissionResult<Self> {
        let committed = file.metadata().await?.len();
        Ok(Self { file, committed })
    }

    /// Appends one record line and syncs it.
    ///
    /// The file only ever grows by whole records: any bytes past the last
    /// committed record are cut before writing, and a failed write or sync
    /// is truncated away before the error is returned.
    async fn append(&mut self, line: &[u8]) -> AdmissionResult<()> {
        let len = self.file.metadata().await?.len();
        if len != self.committed {
            warn!(committed = self.committed, found = len, "Discarding uncommitted journal tail");
            self.file.set_len(self.committed).await?;
        }

        if let Err(err) = self.write_synced(line).await {
            if let Err(truncate_err) = self.file.set_len(self.committed).await {
                warn!(error = %truncate_err, "Could not truncate failed journal append");
            }
            return Err(err.into());
        }
        self.committed += line.len() as u64;
        Ok(())
    }

    async fn write_synced(&mut self, line: &[u8]) -> std::io::Result<()> {
        self.file.write_all(line).await?;
        self.file.sync_data().await
    }
}

/// Durable usage store backed by an append-only journal file.
#[derive(Debug)]
pub struct JournalUsageStore {
    path: PathBuf,
    index: MemoryUsageStore,
    writer: Mutex<JournalWriter>,
}

impl JournalUsageStore {
    /// Opens (or creates) the journal at `path` and replays it.
    ///
    /// Events at or before `now - retention` are not loaded. Lines that fail
    /// to parse, such as a torn final write, are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns `AdmissionError::StoreUnavailable` if the journal cannot be
    /// read or opened for appending.
    pub async fn open(
        path: impl AsRef<Path>,
        retention: Duration,
        now: DateTime<Utc>,
    ) -> AdmissionResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let index = MemoryUsageStore::new(retention);
        let cutoff = shift_back(now, retention);
        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => String::new(),
            Err(err) => return Err(err.into()),
        };

        let mut loaded = 0usize;
        let mut skipped = 0usize;
        for (lineno, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JournalRecord>(line) {
                Ok(JournalRecord::Insert { event }) => {
                    if event.timestamp > cutoff {
                        index.insert_event(event);
                        loaded += 1;
                    }
                }
                Ok(JournalRecord::Retract { handle }) => {
                    index.retract_event(handle);
                }
                Err(err) => {
                    skipped += 1;
                    warn!(path = %path.display(), line = lineno + 1, error = %err, "Skipping unreadable journal line");
                }
            }
        }

        let mut writer = OpenOptions::new().create(true).append(true).open(&path).await?;
        if !contents.is_empty() && !contents.ends_with('\n') {
            // Terminate a torn record so the next append starts a fresh line.
            writer.write_all(b"\n").await?;
            writer.sync_data().await?;
        }
        let writer = JournalWriter::new(writer).await?;
        info!(
            path = %path.display(),
            loaded,
            live = index.event_count(),
            nodes = index.tracked_nodes(),
            skipped,
            "Usage journal opened"
        );

        Ok(Self {
            path,
            index,
            writer: Mutex::new(writer),
        })
    }

    /// Path of the journal file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }


    /// Rewrites the journal with the live events only.
    ///
    /// Holds the writer lock throughout so no append can be lost between the
    /// snapshot and the rename.
    async fn compact(&self) -> AdmissionResult<()> {
        let mut writer = self.writer.lock().await;
        let events = self.index.events();

        let tmp = self.path.with_extension("compact");
        let mut buf = Vec::new();
        for event in events {
            buf.extend(JournalRecord::Insert { event }.to_line()?);
        }

        let mut file = File::create(&tmp).await?;
        file.write_all(&buf).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &self.path).await?;

        *writer = JournalWriter::new(OpenOptions::new().append(true).open(&self.path).await?).await?;
        debug!(path = %self.path.display(), bytes = buf.len(), "Usage journal compacted");
        Ok(())
    }
}

impl UsageStore for JournalUsageStore {
    fn insert(&self, event: UsageEvent) -> impl Future<Output = AdmissionResult<()>> + Send {
        async move {
            let mut writer = self.writer.lock().await;
            let record = JournalRecord::Insert { event };
            writer.append(&record.to_line()?).await?;
            if let JournalRecord::Insert { event } = record {
                self.index.insert_event(event);
            }
            Ok(())
        }
    }

    fn aggregate(
        &self,
        node: &NodeId,
        window: TimeWindow,
    ) -> impl Future<Output = AdmissionResult<WindowAggregate>> + Send {
        async move { Ok(self.index.aggregate_window(node, window)) }
    }

    fn aggregate_many(
        &self,
        nodes: &[NodeId],
        window: TimeWindow,
    ) -> impl Future<Output = AdmissionResult<Vec<WindowAggregate>>> + Send {
        async move { Ok(self.index.aggregate_window_many(nodes, window)) }
    }

    fn retract(&self, handle: EventHandle) -> impl Future<Output = AdmissionResult<bool>> + Send {
        async move {
            let mut writer = self.writer.lock().await;
            writer.append(&JournalRecord::Retract { handle }.to_line()?).await?;
            Ok(self.index.retract_event(handle))
        }
    }

    fn prune_before(&self, cutoff: DateTime<Utc>) -> impl Future<Output = AdmissionResult<usize>> + Send {
        async move {
            let pruned = self.index.prune_events(cutoff);
            if pruned > 0 {
                self.compact().await?;
            }
            Ok(pruned)
        }
    }

    fn len(&self) -> usize {
        self.index.event_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const DAY: Duration = Duration::from_secs(86_400);

    fn node(id: &str) -> NodeId {
        NodeId::new(id).unwrap()
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn window_at(secs: i64) -> TimeWindow {
        TimeWindow::ending_at(ts(secs), Duration::from_secs(60))
    }

    fn append_fragment(path: &Path) {
        use std::io::Write;

        let mut file = std::fs::OpenOptions::new().append(true).open(path).unwrap();
        file.write_all(b"{\"op\":\"insert\",\"ev").unwrap();
        file.sync_all().unwrap();
    }

    async fn line_count(path: &Path) -> usize {
        fs::read_to_string(path).await.unwrap().lines().count()
    }

    #[tokio::test]
    async fn test_events_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("usage.jsonl");

        {
            let store = JournalUsageStore::open(&path, DAY, ts(0)).await.unwrap();
            store.insert(UsageEvent::new(node("a"), ts(1), 30)).await.unwrap();
            store.insert(UsageEvent::new(node("a"), ts(2), 12)).await.unwrap();
            store.insert(UsageEvent::new(node("b"), ts(3), 5)).await.unwrap();
        }

        let store = JournalUsageStore::open(&path, DAY, ts(10)).await.unwrap();
        assert_eq!(store.len(), 3);
        let agg = store.aggregate(&node("a"), window_at(10)).await.unwrap();
        assert_eq!(agg.count, 2);
        assert_eq!(agg.total_workload, 42);
    }

    #[tokio::test]
    async fn test_retraction_is_durable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("usage.jsonl");

        {
            let store = JournalUsageStore::open(&path, DAY, ts(0)).await.unwrap();
            let event = UsageEvent::new(node("a"), ts(1), 30);
            let handle = event.handle;
            store.insert(event).await.unwrap();
            assert!(store.retract(handle).await.unwrap());
        }

        let store = JournalUsageStore::open(&path, DAY, ts(10)).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_expired_events_not_replayed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("usage.jsonl");

        {
            let store = JournalUsageStore::open(&path, DAY, ts(0)).await.unwrap();
            store.insert(UsageEvent::new(node("a"), ts(0), 1)).await.unwrap();
            store.insert(UsageEvent::new(node("a"), ts(100), 1)).await.unwrap();
        }

        let store = JournalUsageStore::open(&path, Duration::from_secs(60), ts(120))
            .await
            .unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_prune_compacts_journal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("usage.jsonl");
        let store = JournalUsageStore::open(&path, DAY, ts(0)).await.unwrap();

        for secs in 0..5 {
            store.insert(UsageEvent::new(node("a"), ts(secs), 1)).await.unwrap();
        }
        assert_eq!(line_count(&path).await, 5);

        assert_eq!(store.prune_before(ts(2)).await.unwrap(), 3);
        assert_eq!(line_count(&path).await, 2);

        // Appends still land in the rewritten file.
        store.insert(UsageEvent::new(node("a"), ts(6), 1)).await.unwrap();
        assert_eq!(line_count(&path).await, 3);
    }

    #[tokio::test]
    async fn test_torn_line_is_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("usage.jsonl");

        {
            let store = JournalUsageStore::open(&path, DAY, ts(0)).await.unwrap();
            store.insert(UsageEvent::new(node("a"), ts(1), 7)).await.unwrap();
        }
        append_fragment(&path);

        let store = JournalUsageStore::open(&path, DAY, ts(10)).await.unwrap();
        assert_eq!(store.len(), 1);
        store.insert(UsageEvent::new(node("a"), ts(11), 3)).await.unwrap();
        drop(store);

        let store = JournalUsageStore::open(&path, DAY, ts(20)).await.unwrap();
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_partial_write_does_not_swallow_next_insert() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("usage.jsonl");

        {
            let store = JournalUsageStore::open(&path, DAY, ts(0)).await.unwrap();
            store.insert(UsageEvent::new(node("a"), ts(1), 7)).await.unwrap();

            // A write that died half-way while the store keeps running.
            append_fragment(&path);

            store.insert(UsageEvent::new(node("a"), ts(2), 3)).await.unwrap();
            assert_eq!(store.len(), 2);
        }

        let store = JournalUsageStore::open(&path, DAY, ts(10)).await.unwrap();
        assert_eq!(store.len(), 2);
        let agg = store.aggregate(&node("a"), window_at(10)).await.unwrap();
        assert_eq!(agg.total_workload, 10);
        assert_eq!(line_count(&path).await, 2);
    }

    #[tokio::test]
    async fn test_creates_parent_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("usage.jsonl");
        let store = JournalUsageStore::open(&path, DAY, ts(0)).await.unwrap();
        assert_eq!(store.path(), path.as_path());
        assert!(path.exists());
    }
}
