// ============================================================================
// SECTION 9: PROCESS RECORDS
// ============================================================================
// Per-process samples parsed from `pidstat` report lines. Every data row
// starts with a timestamp that is either one field ("10:00:01") or two
// ("10:00:01 AM") depending on locale, so columns are located relative to
// that prefix. The command takes every field after the fixed columns.
// ============================================================================

use std::fmt::{self, Debug, Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use compact_str::CompactString;
use serde::{Deserialize, Serialize};

use crate::error::{SamplerError, SamplerResult};
use crate::{CPU_TASK, IO_TASK, MEMORY_TASK};

// ----------------------------------------------------------------------------
// 9.1 Record Kinds
// ----------------------------------------------------------------------------

/// The three pidstat reports the engine samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Cpu,
    Memory,
    Io,
}

impl RecordKind {
    pub const ALL: [RecordKind; 3] = [RecordKind::Cpu, RecordKind::Memory, RecordKind::Io];

    /// Name of the batch task that carries this kind
    pub fn task_name(&self) -> &'static str {
        match self {
            RecordKind::Cpu => CPU_TASK,
            RecordKind::Memory => MEMORY_TASK,
            RecordKind::Io => IO_TASK,
        }
    }

    /// Storage table (and sink file stem)
    pub fn table(&self) -> &'static str {
        match self {
            RecordKind::Cpu => "process_cpu_stats",
            RecordKind::Memory => "process_mem_stats",
            RecordKind::Io => "process_io_stats",
        }
    }

    /// pidstat report selector
    pub fn pidstat_flag(&self) -> &'static str {
        match self {
            RecordKind::Cpu => "-u",
            RecordKind::Memory => "-r",
            RecordKind::Io => "-d",
        }
    }
}

impl Display for RecordKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.task_name())
    }
}

/// A sample type that can be parsed from one pidstat row.
pub trait Record: Serialize + Clone + Debug + Send + Sync + 'static {
    const KIND: RecordKind;

    /// Parse one data row, stamping it with the host address and sample time.
    fn parse(line: &str, ip: &str, timestamp: DateTime<Utc>) -> SamplerResult<Self>;

    fn pid(&self) -> u32;

    fn command(&self) -> &str;
}

// ----------------------------------------------------------------------------
// 9.2 Line Helpers
// ----------------------------------------------------------------------------

/// Whether a line is a data row rather than the banner, a column header,
/// a blank separator or the trailing averages.
pub fn is_data_line(line: &str) -> bool {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with("Average:") || trimmed.starts_with("Linux") {
        return false;
    }
    !trimmed.split_whitespace().any(|field| field == "PID")
}

/// Whether a line mentions one of the monitored process names.
pub fn matches_process<S: AsRef<str>>(line: &str, process_names: &[S]) -> bool {
    process_names.iter().any(|name| line.contains(name.as_ref()))
}

/// The data columns of a row, past the timestamp prefix.
struct Columns<'a> {
    line: &'a str,
    fields: Vec<&'a str>,
}

impl<'a> Columns<'a> {
    /// Split a row that carries at least `min_columns` columns. Anything past
    /// the fixed columns belongs to the command, which may contain spaces.
    fn split(line: &'a str, min_columns: usize) -> SamplerResult<Self> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let offset = match fields.get(1) {
            Some(&"AM") | Some(&"PM") => 2,
            _ => 1,
        };
        let fields = fields.get(offset..).map(|rest| rest.to_vec()).unwrap_or_default();
        if fields.len() < min_columns {
            return Err(SamplerError::parse_line(
                line,
                format!(
                    "expected at least {} columns after the timestamp, found {}",
                    min_columns,
                    fields.len()
                ),
            ));
        }
        Ok(Self { line, fields })
    }

    fn len(&self) -> usize {
        self.fields.len()
    }

    fn get<T: FromStr>(&self, index: usize, column: &str) -> SamplerResult<T> {
        self.fields[index]
            .parse()
            .map_err(|_| SamplerError::parse_line(self.line, format!("invalid {} '{}'", column, self.fields[index])))
    }

    /// Command starting at column `from`, inner whitespace collapsed.
    fn command(&self, from: usize) -> CompactString {
        let mut command = CompactString::default();
        for (i, word) in self.fields[from..].iter().enumerate() {
            if i > 0 {
                command.push(' ');
            }
            command.push_str(word);
        }
        command
    }
}

// ----------------------------------------------------------------------------
// 9.3 CPU Statistics
// ----------------------------------------------------------------------------

/// One `pidstat -u` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessCpuStats {
    pub ip: String,
    pub timestamp: DateTime<Utc>,
    pub uid: u32,
    pub pid: u32,
    pub usr: f64,
    pub system: f64,
    pub guest: f64,
    /// Zero on sysstat releases that predate the %wait column
    pub wait: f64,
    pub total: f64,
    pub cpu: u32,
    pub command: CompactString,
}

impl Record for ProcessCpuStats {
    const KIND: RecordKind = RecordKind::Cpu;

    /// `UID PID %usr %system %guest [%wait] %CPU CPU Command`
    fn parse(line: &str, ip: &str, timestamp: DateTime<Utc>) -> SamplerResult<Self> {
        let columns = Columns::split(line, 8)?;
        // %CPU is a decimal, CPU is an integer: with a %wait column the
        // seventh field is %CPU, without one it is CPU.
        let has_wait = columns.len() >= 9 && columns.fields[6].contains('.');
        let rest = if has_wait { 7 } else { 6 };

        Ok(Self {
            ip: ip.to_string(),
            timestamp,
            uid: columns.get(0, "UID")?,
            pid: columns.get(1, "PID")?,
            usr: columns.get(2, "%usr")?,
            system: columns.get(3, "%system")?,
            guest: columns.get(4, "%guest")?,
            wait: if has_wait { columns.get(5, "%wait")? } else { 0.0 },
            total: columns.get(rest - 1, "%CPU")?,
            cpu: columns.get(rest, "CPU")?,
            command: columns.command(rest + 1),
        })
    }

    fn pid(&self) -> u32 {
        self.pid
    }

    fn command(&self) -> &str {
        &self.command
    }
}

// ----------------------------------------------------------------------------
// 9.4 Memory Statistics
// ----------------------------------------------------------------------------

/// One `pidstat -r` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessMemStats {
    pub ip: String,
    pub timestamp: DateTime<Utc>,
    pub uid: u32,
    pub pid: u32,
    pub minor_faults: f64,
    pub major_faults: f64,
    /// Virtual size in KiB
    pub vsz: u64,
    /// Resident set size in KiB
    pub rss: u64,
    pub mem_percent: f64,
    pub command: CompactString,
}

impl Record for ProcessMemStats {
    const KIND: RecordKind = RecordKind::Memory;

    /// `UID PID minflt/s majflt/s VSZ RSS %MEM Command`
    fn parse(line: &str, ip: &str, timestamp: DateTime<Utc>) -> SamplerResult<Self> {
        let columns = Columns::split(line, 8)?;

        Ok(Self {
            ip: ip.to_string(),
            timestamp,
            uid: columns.get(0, "UID")?,
            pid: columns.get(1, "PID")?,
            minor_faults: columns.get(2, "minflt/s")?,
            major_faults: columns.get(3, "majflt/s")?,
            vsz: columns.get(4, "VSZ")?,
            rss: columns.get(5, "RSS")?,
            mem_percent: columns.get(6, "%MEM")?,
            command: columns.command(7),
        })
    }

    fn pid(&self) -> u32 {
        self.pid
    }

    fn command(&self) -> &str {
        &self.command
    }
}

// ----------------------------------------------------------------------------
// 9.5 IO Statistics
// ----------------------------------------------------------------------------

/// One `pidstat -d` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessIoStats {
    pub ip: String,
    pub timestamp: DateTime<Utc>,
    pub uid: u32,
    pub pid: u32,
    pub read_kbps: f64,
    pub write_kbps: f64,
    /// Cancelled writes, kB/s
    pub cancelled_write_kbps: f64,
    /// Block IO delay in clock ticks
    pub io_delay: u64,
    pub command: CompactString,
}

impl Record for ProcessIoStats {
    const KIND: RecordKind = RecordKind::Io;

    /// `UID PID kB_rd/s kB_wr/s kB_ccwr/s iodelay Command`
    fn parse(line: &str, ip: &str, timestamp: DateTime<Utc>) -> SamplerResult<Self> {
        let columns = Columns::split(line, 7)?;

        Ok(Self {
            ip: ip.to_string(),
            timestamp,
            uid: columns.get(0, "UID")?,
            pid: columns.get(1, "PID")?,
            read_kbps: columns.get(2, "kB_rd/s")?,
            write_kbps: columns.get(3, "kB_wr/s")?,
            cancelled_write_kbps: columns.get(4, "kB_ccwr/s")?,
            io_delay: columns.get(5, "iodelay")?,
            command: columns.command(6),
        })
    }

    fn pid(&self) -> u32 {
        self.pid
    }

    fn command(&self) -> &str {
        &self.command
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn stamp() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 1).unwrap()
    }

    #[test]
    fn test_cpu_row_with_meridiem() {
        let line = "10:00:01 AM     0      1234    2.00    1.00    0.00    0.50    3.00     5  nginx";
        let stats = ProcessCpuStats::parse(line, "10.0.0.7", stamp()).unwrap();

        assert_eq!(stats.uid, 0);
        assert_eq!(stats.pid, 1234);
        assert_eq!(stats.usr, 2.0);
        assert_eq!(stats.system, 1.0);
        assert_eq!(stats.wait, 0.5);
        assert_eq!(stats.total, 3.0);
        assert_eq!(stats.cpu, 5);
        assert_eq!(stats.command.as_str(), "nginx");
        assert_eq!(stats.ip, "10.0.0.7");
        assert_eq!(stats.timestamp, stamp());
    }

    #[test]
    fn test_cpu_row_24h_without_wait_column() {
        let line = "10:00:01     1000      88    0.99    0.00    0.00    0.99     2  redis-server";
        let stats = ProcessCpuStats::parse(line, "h", stamp()).unwrap();

        assert_eq!(stats.uid, 1000);
        assert_eq!(stats.pid, 88);
        assert_eq!(stats.wait, 0.0);
        assert_eq!(stats.total, 0.99);
        assert_eq!(stats.cpu, 2);
        assert_eq!(stats.command(), "redis-server");
    }

    #[test]
    fn test_mem_row() {
        let line = "10:00:01 PM   999    4321     12.00      0.00  123456  65432   1.60  mysqld";
        let stats = ProcessMemStats::parse(line, "h", stamp()).unwrap();

        assert_eq!(stats.pid, 4321);
        assert_eq!(stats.minor_faults, 12.0);
        assert_eq!(stats.vsz, 123_456);
        assert_eq!(stats.rss, 65_432);
        assert_eq!(stats.mem_percent, 1.6);
        assert_eq!(stats.command.as_str(), "mysqld");
    }

    #[test]
    fn test_io_row() {
        let line = "10:00:01    0     77    4.00   16.00    0.00       3  postgres";
        let stats = ProcessIoStats::parse(line, "h", stamp()).unwrap();

        assert_eq!(stats.pid, 77);
        assert_eq!(stats.read_kbps, 4.0);
        assert_eq!(stats.write_kbps, 16.0);
        assert_eq!(stats.cancelled_write_kbps, 0.0);
        assert_eq!(stats.io_delay, 3);
        assert_eq!(stats.pid(), 77);
    }

    #[test]
    fn test_commands_with_spaces() {
        let line = "10:00:01 AM  1000  4242    3.00    1.00    0.00    0.00    4.00     3  Web Content";
        let stats = ProcessCpuStats::parse(line, "h", stamp()).unwrap();
        assert_eq!(stats.total, 4.0);
        assert_eq!(stats.cpu, 3);
        assert_eq!(stats.command.as_str(), "Web Content");

        // Nine columns, but the ninth is part of the command, not %wait.
        let line = "10:00:01  1000  4243    0.50    0.50    0.00    1.00     1  tmux: server";
        let stats = ProcessCpuStats::parse(line, "h", stamp()).unwrap();
        assert_eq!(stats.wait, 0.0);
        assert_eq!(stats.total, 1.0);
        assert_eq!(stats.cpu, 1);
        assert_eq!(stats.command.as_str(), "tmux: server");

        let line = "10:00:01 PM  1000  4242  3.00  0.00  2048000  512000  3.10  Web   Content";
        let stats = ProcessMemStats::parse(line, "h", stamp()).unwrap();
        assert_eq!(stats.rss, 512_000);
        assert_eq!(stats.command.as_str(), "Web Content");

        let line = "10:00:01  0  501  0.00  8.00  0.00  0  kworker/u16:2 flush";
        let stats = ProcessIoStats::parse(line, "h", stamp()).unwrap();
        assert_eq!(stats.write_kbps, 8.0);
        assert_eq!(stats.command.as_str(), "kworker/u16:2 flush");
    }

    #[test]
    fn test_malformed_rows_are_errors() {
        assert!(ProcessIoStats::parse("10:00:01 0 77 4.00 nginx", "h", stamp()).is_err());

        let err = ProcessMemStats::parse("10:00:01 0 abc 1 0 1 1 0.1 nginx", "h", stamp()).unwrap_err();
        assert!(matches!(err, SamplerError::ParseLine { .. }));
        assert!(err.to_string().contains("PID"));
    }

    #[test]
    fn test_line_classification() {
        assert!(!is_data_line("Linux 5.15.0 (web-01)  03/01/2024  _x86_64_  (8 CPU)"));
        assert!(!is_data_line(""));
        assert!(!is_data_line("10:00:01 AM   UID       PID    %usr %system  %guest   %wait    %CPU   CPU  Command"));
        assert!(!is_data_line("Average:        0      1234    2.00    1.00    0.00    0.50    3.00     -  nginx"));
        assert!(is_data_line("10:00:01 AM     0      1234    2.00    1.00    0.00    0.50    3.00     5  nginx"));

        let names = vec!["nginx".to_string(), "mysqld".to_string()];
        assert!(matches_process("10:00:01 0 1 0.1 nginx", &names));
        assert!(!matches_process("10:00:01 0 1 0.1 sshd", &names));
    }

    #[test]
    fn test_record_kind_names() {
        assert_eq!(RecordKind::Cpu.task_name(), "cpu");
        assert_eq!(RecordKind::Memory.table(), "process_mem_stats");
        assert_eq!(RecordKind::Io.pidstat_flag(), "-d");
        assert_eq!(ProcessCpuStats::KIND, RecordKind::Cpu);
        assert_eq!(RecordKind::Memory.to_string(), "memory");
    }
}
