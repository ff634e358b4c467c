// ============================================================================
// SECTION 10: RECORD SINK
// ============================================================================
// Append-only JSON-lines storage, one `<table>.jsonl` file per record kind.
// Batches are written in chunks, one `write_all` per chunk; single records
// written through `write_one` are the fallback path for publishes rejected by
// a closing task.
// ============================================================================

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::SinkConfig;
use crate::error::{SinkError, SinkResult};
use crate::records::{Record, RecordKind};
use crate::task::BatchConsumer;

#[derive(Debug, Default)]
struct SinkStats {
    rows_written: AtomicU64,
    chunks_written: AtomicU64,
    fallback_writes: AtomicU64,
    bytes_written: AtomicU64,
}

/// Point-in-time view of the sink counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SinkStatsSnapshot {
    pub rows_written: u64,
    pub chunks_written: u64,
    pub fallback_writes: u64,
    pub bytes_written: u64,
}

/// JSON-lines record storage.
#[derive(Debug)]
pub struct JsonLinesSink {
    directory: PathBuf,
    chunk_size: usize,
    files: DashMap<RecordKind, Arc<Mutex<File>>>,
    stats: SinkStats,
}

impl JsonLinesSink {
    /// Open the sink rooted at `directory`, creating it if needed.
    pub fn open(directory: impl AsRef<Path>, chunk_size: usize) -> SinkResult<Self> {
        let directory = directory.as_ref().to_path_buf();
        fs::create_dir_all(&directory).map_err(|source| SinkError::Io {
            path: directory.clone(),
            source,
        })?;

        info!(
            target: "procmon::sink",
            directory = %directory.display(),
            chunk_size,
            "Sink opened"
        );

        Ok(Self {
            directory,
            chunk_size: chunk_size.max(1),
            files: DashMap::new(),
            stats: SinkStats::default(),
        })
    }

    pub fn from_config(config: &SinkConfig) -> SinkResult<Self> {
        Self::open(&config.directory, config.chunk_size)
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn path_for(&self, kind: RecordKind) -> PathBuf {
        self.directory.join(format!("{}.jsonl", kind.table()))
    }

    /// Persist a batch, `chunk_size` rows per write. Returns the number of
    /// rows written. A failed chunk stops the batch; earlier chunks stay.
    pub fn write_batch<R: Record>(&self, records: &[R]) -> SinkResult<usize> {
        let mut written = 0;
        for chunk in records.chunks(self.chunk_size) {
            self.append(R::KIND, chunk)?;
            written += chunk.len();
        }
        Ok(written)
    }

    /// Persist a single record synchronously.
    pub fn write_one<R: Record>(&self, record: &R) -> SinkResult<()> {
        self.append(R::KIND, std::slice::from_ref(record))?;
        self.stats.fallback_writes.fetch_add(1, AtomicOrdering::Relaxed);
        Ok(())
    }

    fn append<R: Record>(&self, kind: RecordKind, rows: &[R]) -> SinkResult<()> {
        let mut payload = Vec::with_capacity(rows.len() * 192);
        for row in rows {
            serde_json::to_writer(&mut payload, row)?;
            payload.push(b'\n');
        }

        let path = self.path_for(kind);
        let file = self.file(kind, &path)?;
        file.lock()
            .write_all(&payload)
            .map_err(|source| SinkError::Io { path, source })?;

        self.stats.rows_written.fetch_add(rows.len() as u64, AtomicOrdering::Relaxed);
        self.stats.chunks_written.fetch_add(1, AtomicOrdering::Relaxed);
        self.stats.bytes_written.fetch_add(payload.len() as u64, AtomicOrdering::Relaxed);
        debug!(target: "procmon::sink", table = kind.table(), rows = rows.len(), "Chunk written");
        Ok(())
    }

    fn file(&self, kind: RecordKind, path: &Path) -> SinkResult<Arc<Mutex<File>>> {
        if let Some(file) = self.files.get(&kind) {
            return Ok(Arc::clone(file.value()));
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| SinkError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Arc::clone(
            self.files.entry(kind).or_insert_with(|| Arc::new(Mutex::new(file))).value(),
        ))
    }

    pub fn stats(&self) -> SinkStatsSnapshot {
        SinkStatsSnapshot {
            rows_written: self.stats.rows_written.load(AtomicOrdering::Relaxed),
            chunks_written: self.stats.chunks_written.load(AtomicOrdering::Relaxed),
            fallback_writes: self.stats.fallback_writes.load(AtomicOrdering::Relaxed),
            bytes_written: self.stats.bytes_written.load(AtomicOrdering::Relaxed),
        }
    }
}

/// Installs a shared sink as the consumer of one record kind's task.
pub struct SinkConsumer<R> {
    sink: Arc<JsonLinesSink>,
    _record: PhantomData<fn() -> R>,
}

impl<R> SinkConsumer<R> {
    pub fn new(sink: Arc<JsonLinesSink>) -> Self {
        Self {
            sink,
            _record: PhantomData,
        }
    }
}

impl<R> std::fmt::Debug for SinkConsumer<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkConsumer")
            .field("directory", &self.sink.directory)
            .field("record", &std::any::type_name::<R>())
            .finish()
    }
}

#[async_trait]
impl<R: Record> BatchConsumer<R> for SinkConsumer<R> {
    async fn consume(&self, batch: Vec<R>) -> anyhow::Result<()> {
        self.sink
            .write_batch(&batch)
            .with_context(|| format!("persisting {} rows to {}", batch.len(), R::KIND.table()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::ProcessIoStats;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    fn io_row(pid: u32) -> ProcessIoStats {
        ProcessIoStats {
            ip: "127.0.0.1".to_string(),
            timestamp: Utc::now(),
            uid: 0,
            pid,
            read_kbps: 1.0,
            write_kbps: 2.0,
            cancelled_write_kbps: 0.0,
            io_delay: 0,
            command: "nginx".into(),
        }
    }

    fn read_rows(path: &Path) -> Vec<ProcessIoStats> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn test_write_batch_in_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonLinesSink::open(dir.path().join("data"), 1000).unwrap();

        let rows: Vec<ProcessIoStats> = (0..2500).map(io_row).collect();
        assert_eq!(sink.write_batch(&rows).unwrap(), 2500);

        let stats = sink.stats();
        assert_eq!(stats.rows_written, 2500);
        assert_eq!(stats.chunks_written, 3);

        let stored = read_rows(&sink.path_for(RecordKind::Io));
        assert_eq!(stored.len(), 2500);
        assert_eq!(stored.first().map(|r| r.pid), Some(0));
        assert_eq!(stored.last().map(|r| r.pid), Some(2499));
    }

    #[test]
    fn test_write_one_appends() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonLinesSink::open(dir.path(), 10).unwrap();

        sink.write_batch(&[io_row(1), io_row(2)]).unwrap();
        sink.write_one(&io_row(3)).unwrap();

        let pids: Vec<u32> = read_rows(&sink.path_for(RecordKind::Io)).iter().map(|r| r.pid).collect();
        assert_eq!(pids, vec![1, 2, 3]);
        assert_eq!(sink.stats().fallback_writes, 1);
        assert!(sink.path_for(RecordKind::Io).ends_with("process_io_stats.jsonl"));
    }

    #[tokio::test]
    async fn test_sink_consumer_persists_batches() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(JsonLinesSink::open(dir.path(), 1000).unwrap());
        let consumer = SinkConsumer::<ProcessIoStats>::new(sink.clone());

        consumer.consume(vec![io_row(10), io_row(11)]).await.unwrap();

        assert_eq!(read_rows(&sink.path_for(RecordKind::Io)).len(), 2);
    }

    #[tokio::test]
    async fn test_unwritable_directory_is_a_consumer_error() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(JsonLinesSink::open(dir.path(), 1000).unwrap());
        // A directory where the table file should be makes every append fail.
        fs::create_dir(sink.path_for(RecordKind::Io)).unwrap();

        let consumer = SinkConsumer::<ProcessIoStats>::new(sink);
        let err = consumer.consume(vec![io_row(1)]).await.unwrap_err();
        assert!(format!("{:#}", err).contains("process_io_stats"));
    }
}
