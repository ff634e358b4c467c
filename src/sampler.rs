// ============================================================================
// SECTION 11: PIDSTAT SAMPLERS
// ============================================================================
// One sampler per record kind. Each runs `pidstat <flag> <interval>`, keeps
// the rows that mention a monitored process, parses them and publishes the
// records to the kind's batch task. A record rejected by a closing task is
// written straight to the sink instead.
// ============================================================================

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::MonitorConfig;
use crate::error::{SamplerError, SamplerResult};
use crate::records::{is_data_line, matches_process, Record};
use crate::sink::JsonLinesSink;
use crate::task::BatchTask;

/// What happened to one line of pidstat output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineOutcome {
    /// Banner, header, blank or averages line
    Skipped,
    /// Data row for a process nobody asked about
    Filtered,
    Malformed,
    Published,
    /// Task was closing; the record went straight to the sink
    FellBack,
    /// Task was closing and the direct write failed too
    Lost,
}

#[derive(Debug, Default)]
struct SamplerStats {
    lines_read: AtomicU64,
    published: AtomicU64,
    malformed: AtomicU64,
    fallback_writes: AtomicU64,
    lost: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SamplerStatsSnapshot {
    pub lines_read: u64,
    pub published: u64,
    pub malformed: u64,
    pub fallback_writes: u64,
    pub lost: u64,
}

/// Feeds one batch task from a `pidstat` child process.
#[derive(Debug)]
pub struct PidstatSampler<R: Record> {
    program: PathBuf,
    interval_secs: u64,
    ip: String,
    process_names: Vec<String>,
    task: Arc<BatchTask<R>>,
    sink: Arc<JsonLinesSink>,
    stats: SamplerStats,
}

impl<R: Record> PidstatSampler<R> {
    pub fn new(config: &MonitorConfig, task: Arc<BatchTask<R>>, sink: Arc<JsonLinesSink>) -> Self {
        Self {
            program: config.pidstat_path.clone(),
            interval_secs: config.interval_secs,
            ip: config.ip.clone(),
            process_names: config.process_names.clone(),
            task,
            sink,
            stats: SamplerStats::default(),
        }
    }

    /// Arguments passed to pidstat.
    pub fn args(&self) -> [String; 2] {
        [R::KIND.pidstat_flag().to_string(), self.interval_secs.to_string()]
    }

    /// Run pidstat until it exits or `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) -> SamplerResult<()> {
        let program = self.program.display().to_string();
        let mut child = Command::new(&self.program)
            .args(self.args())
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SamplerError::SpawnFailed {
                program: program.clone(),
                source,
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SamplerError::MissingStdout { program: program.clone() })?;

        info!(
            target: "procmon::sampler",
            kind = %R::KIND,
            program = %program,
            interval_secs = self.interval_secs,
            processes = ?self.process_names,
            "Sampler started"
        );

        self.ingest(BufReader::new(stdout), &shutdown).await?;

        if shutdown.is_cancelled() {
            if let Err(e) = child.kill().await {
                debug!(target: "procmon::sampler", kind = %R::KIND, error = %e, "pidstat already gone");
            }
            info!(target: "procmon::sampler", kind = %R::KIND, "Sampler stopped");
            return Ok(());
        }

        let status = child.wait().await?;
        if status.success() {
            info!(target: "procmon::sampler", kind = %R::KIND, "pidstat finished");
            Ok(())
        } else {
            Err(SamplerError::Exited {
                program,
                status: status.to_string(),
            })
        }
    }

    /// Consume report lines until end of input or cancellation.
    ///
    /// Lines are decoded lossily: command names may carry bytes that are not
    /// UTF-8, and such a row must not end the sampler.
    pub async fn ingest<B>(&self, mut reader: B, shutdown: &CancellationToken) -> SamplerResult<()>
    where
        B: AsyncBufRead + Unpin,
    {
        let mut raw = Vec::with_capacity(256);
        loop {
            raw.clear();
            let read = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                read = reader.read_until(b'\n', &mut raw) => read?,
            };
            if read == 0 {
                return Ok(());
            }
            let line = String::from_utf8_lossy(&raw);
            self.handle_line(line.trim_end_matches(['\n', '\r']), Utc::now()).await;
        }
    }

    /// Filter, parse and publish a single line.
    pub async fn handle_line(&self, line: &str, timestamp: DateTime<Utc>) -> LineOutcome {
        self.stats.lines_read.fetch_add(1, AtomicOrdering::Relaxed);

        if !is_data_line(line) {
            return LineOutcome::Skipped;
        }
        if !matches_process(line, &self.process_names) {
            return LineOutcome::Filtered;
        }

        let record = match R::parse(line, &self.ip, timestamp) {
            Ok(record) => record,
            Err(e) => {
                self.stats.malformed.fetch_add(1, AtomicOrdering::Relaxed);
                warn!(target: "procmon::sampler", kind = %R::KIND, error = %e, "Skipping malformed line");
                return LineOutcome::Malformed;
            }
        };

        match self.task.publish(record).await {
            Ok(()) => {
                self.stats.published.fetch_add(1, AtomicOrdering::Relaxed);
                LineOutcome::Published
            }
            Err(rejected) => {
                let record = rejected.into_inner();
                match self.sink.write_one(&record) {
                    Ok(()) => {
                        self.stats.fallback_writes.fetch_add(1, AtomicOrdering::Relaxed);
                        debug!(
                            target: "procmon::sampler",
                            kind = %R::KIND,
                            pid = record.pid(),
                            "Task closing, wrote record directly"
                        );
                        LineOutcome::FellBack
                    }
                    Err(e) => {
                        self.stats.lost.fetch_add(1, AtomicOrdering::Relaxed);
                        error!(
                            target: "procmon::sampler",
                            kind = %R::KIND,
                            pid = record.pid(),
                            command = record.command(),
                            error = %e,
                            "Record lost"
                        );
                        LineOutcome::Lost
                    }
                }
            }
        }
    }

    pub fn stats(&self) -> SamplerStatsSnapshot {
        SamplerStatsSnapshot {
            lines_read: self.stats.lines_read.load(AtomicOrdering::Relaxed),
            published: self.stats.published.load(AtomicOrdering::Relaxed),
            malformed: self.stats.malformed.load(AtomicOrdering::Relaxed),
            fallback_writes: self.stats.fallback_writes.load(AtomicOrdering::Relaxed),
            lost: self.stats.lost.load(AtomicOrdering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{ProcessCpuStats, RecordKind};
    use crate::task::TaskSettings;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    const REPORT: &str = "\
Linux 5.15.0-91-generic (web-01) \t03/01/2024 \t_x86_64_\t(8 CPU)

10:00:01 AM   UID       PID    %usr %system  %guest   %wait    %CPU   CPU  Command
10:00:02 AM     0      1234    2.00    1.00    0.00    0.50    3.00     5  nginx
10:00:02 AM     0      2222    9.00    1.00    0.00    0.00   10.00     1  sshd
10:00:02 AM   999      4321    1.00    0.00    0.00    0.00    1.00     2  mysqld
10:00:02 AM   999      bogus   1.00    0.00    0.00    0.00    1.00     2  mysqld

Average:        0      1234    2.00    1.00    0.00    0.50    3.00     -  nginx
";

    fn monitor(dir: &std::path::Path) -> MonitorConfig {
        MonitorConfig {
            process_names: vec!["nginx".to_string(), "mysqld".to_string()],
            pidstat_path: dir.join("no-such-pidstat"),
            ..MonitorConfig::default()
        }
    }

    fn sampler(
        dir: &std::path::Path,
    ) -> (PidstatSampler<ProcessCpuStats>, Arc<BatchTask<ProcessCpuStats>>, Arc<Mutex<Vec<u32>>>) {
        let sink = Arc::new(JsonLinesSink::open(dir, 1000).unwrap());
        let task = Arc::new(
            BatchTask::new("cpu", TaskSettings::new(64, 100, Duration::from_secs(60))).unwrap(),
        );
        let pids = Arc::new(Mutex::new(Vec::new()));
        let seen = pids.clone();
        task.set_consumer(move |batch: Vec<ProcessCpuStats>| -> anyhow::Result<()> {
            seen.lock().extend(batch.iter().map(|r| r.pid));
            Ok(())
        })
        .unwrap();
        task.start().unwrap();
        (PidstatSampler::new(&monitor(dir), task.clone(), sink), task, pids)
    }

    #[tokio::test]
    async fn test_ingest_filters_and_publishes() {
        let dir = tempfile::tempdir().unwrap();
        let (sampler, task, pids) = sampler(dir.path());

        sampler
            .ingest(REPORT.as_bytes(), &CancellationToken::new())
            .await
            .unwrap();
        task.close().await;

        assert_eq!(*pids.lock(), vec![1234, 4321]);
        let stats = sampler.stats();
        assert_eq!(stats.published, 2);
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.lines_read, 9);
    }

    #[tokio::test]
    async fn test_invalid_utf8_rows_do_not_stop_ingest() {
        let dir = tempfile::tempdir().unwrap();
        let (sampler, task, pids) = sampler(dir.path());

        let mut input = Vec::new();
        input.extend_from_slice(b"10:00:02 AM     0   12\xff\xfe34    2.00    1.00    0.00    0.50    3.00     5  nginx\n");
        input.extend_from_slice(b"10:00:02 AM     0      4321    1.00    0.00    0.00    0.00    1.00     2  mysqld\xff\r\n");
        input.extend_from_slice(b"10:00:02 AM     0      1234    2.00    1.00    0.00    0.50    3.00     5  nginx\n");

        sampler
            .ingest(input.as_slice(), &CancellationToken::new())
            .await
            .unwrap();
        task.close().await;

        assert_eq!(*pids.lock(), vec![4321, 1234]);
        let stats = sampler.stats();
        assert_eq!(stats.lines_read, 3);
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.published, 2);
    }

    #[tokio::test]
    async fn test_line_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        let (sampler, _task, _pids) = sampler(dir.path());
        let now = Utc::now();

        assert_eq!(sampler.handle_line("", now).await, LineOutcome::Skipped);
        assert_eq!(
            sampler
                .handle_line("10:00:02 AM  0  2222  9.00  1.00  0.00  0.00  10.00  1  sshd", now)
                .await,
            LineOutcome::Filtered
        );
        assert_eq!(
            sampler
                .handle_line("10:00:02 AM  0  1234  2.00  1.00  0.00  0.50  3.00  5  nginx", now)
                .await,
            LineOutcome::Published
        );
    }

    #[tokio::test]
    async fn test_closed_task_falls_back_to_sink() {
        let dir = tempfile::tempdir().unwrap();
        let (sampler, task, pids) = sampler(dir.path());
        task.close().await;

        let outcome = sampler
            .handle_line("10:00:02 AM  0  1234  2.00  1.00  0.00  0.50  3.00  5  nginx", Utc::now())
            .await;

        assert_eq!(outcome, LineOutcome::FellBack);
        assert!(pids.lock().is_empty());
        let stored = std::fs::read_to_string(dir.path().join(format!("{}.jsonl", RecordKind::Cpu.table()))).unwrap();
        assert_eq!(stored.lines().count(), 1);
        assert_eq!(sampler.stats().fallback_writes, 1);
    }

    #[tokio::test]
    async fn test_missing_program_fails_to_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let (sampler, _task, _pids) = sampler(dir.path());

        let err = sampler.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, SamplerError::SpawnFailed { .. }));
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn test_cancelled_ingest_returns() {
        let dir = tempfile::tempdir().unwrap();
        let (sampler, _task, _pids) = sampler(dir.path());
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        // A reader that never yields a line.
        let (_writer, reader) = tokio::io::duplex(64);
        sampler.ingest(BufReader::new(reader), &shutdown).await.unwrap();
        assert_eq!(sampler.stats().lines_read, 0);
    }

    #[test]
    fn test_args() {
        let dir = tempfile::tempdir().unwrap();
        let config = MonitorConfig {
            interval_secs: 3,
            ..monitor(dir.path())
        };
        let sink = Arc::new(JsonLinesSink::open(dir.path(), 10).unwrap());
        let task = Arc::new(BatchTask::<ProcessCpuStats>::new("cpu", TaskSettings::default()).unwrap());

        let sampler = PidstatSampler::new(&config, task, sink);
        assert_eq!(sampler.args(), ["-u".to_string(), "3".to_string()]);
    }
}
