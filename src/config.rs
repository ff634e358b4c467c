// ============================================================================
// SECTION 4: CONFIGURATION SYSTEM
// ============================================================================
// Configuration management with:
// - TOML file parsing
// - Environment variable overrides (PROCMON_ prefix, `__` as separator)
// - Validation
// - Defaults sized for a few monitored processes per host
// ============================================================================

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::task::TaskSettings;
use crate::{
    DEFAULT_FLUSH_INTERVAL_SECS, DEFAULT_MAX_BATCH_SIZE, DEFAULT_QUEUE_CAPACITY, DEFAULT_SAMPLE_INTERVAL_SECS,
    DEFAULT_SHUTDOWN_GRACE_MS, DEFAULT_SINK_CHUNK_SIZE,
};

// ----------------------------------------------------------------------------
// 4.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for the engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// What to sample and how often
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Batch task sizing shared by the cpu, memory and io tasks
    #[serde(default)]
    pub tasks: TaskConfig,

    /// Where batches are persisted
    #[serde(default)]
    pub sink: SinkConfig,

    /// Shutdown coordination
    #[serde(default)]
    pub shutdown: ShutdownConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("PROCMON_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| ConfigError::ParseError { message: e.to_string() })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from string (for testing)
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(toml_str).map_err(|e| ConfigError::ParseError { message: e.to_string() })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.monitor.interval_secs == 0 {
            return Err(ConfigError::invalid_value(
                "monitor.interval_secs",
                "Sampling interval must be at least 1 second",
            ));
        }

        if self.tasks.queue_capacity == 0 {
            return Err(ConfigError::invalid_value(
                "tasks.queue_capacity",
                "Queue capacity must be greater than zero",
            ));
        }

        if self.tasks.max_batch_size == 0 {
            return Err(ConfigError::invalid_value(
                "tasks.max_batch_size",
                "Batch size must be greater than zero",
            ));
        }

        if self.tasks.flush_interval.is_zero() {
            return Err(ConfigError::invalid_value(
                "tasks.flush_interval",
                "Flush interval must be greater than zero",
            ));
        }

        if self.sink.chunk_size == 0 {
            return Err(ConfigError::invalid_value(
                "sink.chunk_size",
                "Chunk size must be greater than zero",
            ));
        }

        Ok(())
    }

    /// Stricter checks needed before the engine can actually sample.
    pub fn validate_for_run(&self) -> Result<(), ConfigError> {
        self.validate()?;
        if self.monitor.process_names.iter().all(|name| name.trim().is_empty()) {
            return Err(ConfigError::missing_field("monitor.process_names"));
        }
        Ok(())
    }

    /// Create a default config file
    pub fn generate_default_config() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// 4.2 Monitor Configuration
// ----------------------------------------------------------------------------

/// What the samplers watch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Address recorded on every row to identify this host
    #[serde(default = "default_ip")]
    pub ip: String,

    /// Substrings matched against pidstat rows
    #[serde(default)]
    pub process_names: Vec<String>,

    /// pidstat reporting interval in seconds
    #[serde(default = "default_sample_interval")]
    pub interval_secs: u64,

    /// pidstat executable
    #[serde(default = "default_pidstat_path")]
    pub pidstat_path: PathBuf,

    #[serde(default = "default_true")]
    pub cpu: bool,

    #[serde(default = "default_true")]
    pub memory: bool,

    #[serde(default = "default_true")]
    pub io: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            ip: default_ip(),
            process_names: Vec::new(),
            interval_secs: default_sample_interval(),
            pidstat_path: default_pidstat_path(),
            cpu: true,
            memory: true,
            io: true,
        }
    }
}

fn default_ip() -> String {
    "127.0.0.1".into()
}

fn default_sample_interval() -> u64 {
    DEFAULT_SAMPLE_INTERVAL_SECS
}

fn default_pidstat_path() -> PathBuf {
    PathBuf::from("pidstat")
}

fn default_true() -> bool {
    true
}

// ----------------------------------------------------------------------------
// 4.3 Task Configuration
// ----------------------------------------------------------------------------

/// Queue and trigger sizing for batch tasks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Bounded queue depth; publishers wait while it is full
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Size trigger
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Time trigger
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            max_batch_size: default_max_batch_size(),
            flush_interval: default_flush_interval(),
        }
    }
}

impl TaskConfig {
    pub fn settings(&self) -> TaskSettings {
        TaskSettings {
            queue_capacity: self.queue_capacity,
            max_batch_size: self.max_batch_size,
            flush_interval: self.flush_interval,
        }
    }
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_max_batch_size() -> usize {
    DEFAULT_MAX_BATCH_SIZE
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(DEFAULT_FLUSH_INTERVAL_SECS)
}

// ----------------------------------------------------------------------------
// 4.4 Sink Configuration
// ----------------------------------------------------------------------------

/// JSON-lines persistence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Directory holding one `<table>.jsonl` file per record kind
    #[serde(default = "default_sink_directory")]
    pub directory: PathBuf,

    /// Rows per write when persisting a batch
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            directory: default_sink_directory(),
            chunk_size: default_chunk_size(),
        }
    }
}

fn default_sink_directory() -> PathBuf {
    PathBuf::from("./data")
}

fn default_chunk_size() -> usize {
    DEFAULT_SINK_CHUNK_SIZE
}

// ----------------------------------------------------------------------------
// 4.5 Shutdown Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// Wait before closing each task so in-flight publishes can land
    #[serde(default = "default_grace_period", with = "humantime_serde")]
    pub grace_period: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period: default_grace_period(),
        }
    }
}

fn default_grace_period() -> Duration {
    Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_MS)
}

// ----------------------------------------------------------------------------
// 4.6 Logging Configuration
// ----------------------------------------------------------------------------

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}
