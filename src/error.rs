// ============================================================================
// SECTION 3: ERROR HANDLING FRAMEWORK
// ============================================================================
// Error types for every subsystem in the engine. Pipeline errors describe the
// producer contract of a batch task; everything that happens inside a task's
// loop is logged there and never reaches these types' callers.
// ============================================================================

use std::fmt::{self, Debug, Display, Formatter};
use std::path::PathBuf;

use compact_str::CompactString;
use thiserror::Error;

// ----------------------------------------------------------------------------
// 3.1 Core Engine Errors
// ----------------------------------------------------------------------------

/// The main error type for the engine.
/// All subsystem errors can be converted to this type.
#[derive(Error, Debug)]
pub enum EngineError {
    // ---- Configuration Errors ----
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    // ---- Pipeline Errors ----
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    // ---- Sampling Errors ----
    #[error("Sampler error: {0}")]
    Sampler(#[from] SamplerError),

    // ---- Persistence Errors ----
    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    // ---- IO Errors ----
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // ---- Generic Errors ----
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            EngineError::Config(_) => false,
            EngineError::Pipeline(e) => e.is_recoverable(),
            EngineError::Sampler(e) => e.is_recoverable(),
            EngineError::Sink(_) => true,
            EngineError::Io(_) => true,
            EngineError::Internal(_) => false,
        }
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            EngineError::Config(_) => "config",
            EngineError::Pipeline(_) => "pipeline",
            EngineError::Sampler(_) => "sampler",
            EngineError::Sink(_) => "sink",
            EngineError::Io(_) => "io",
            EngineError::Internal(_) => "internal",
        }
    }

    /// Get suggested recovery action
    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            EngineError::Config(_) => RecoveryHint::FixConfiguration,
            EngineError::Pipeline(e) => e.recovery_hint(),
            EngineError::Sampler(e) => e.recovery_hint(),
            _ => RecoveryHint::RetryWithBackoff,
        }
    }
}

/// Hints for how to recover from an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryHint {
    /// No recovery possible
    None,
    /// Retry with exponential backoff
    RetryWithBackoff,
    /// Take the synchronous path instead of the queue
    Fallback,
    /// Fix configuration and restart
    FixConfiguration,
    /// Skip this item and continue
    Skip,
    /// Fix the calling code; the producer contract was broken
    FixCaller,
}

// ----------------------------------------------------------------------------
// 3.2 Pipeline Errors
// ----------------------------------------------------------------------------

/// Errors raised by batch tasks and the task registry.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Task '{task}' is closed; enqueue rejected")]
    EnqueueAfterClose { task: CompactString },

    #[error("Consumer of task '{task}' failed on a batch of {batch_len} items: {message}")]
    ConsumerFault {
        task: CompactString,
        batch_len: usize,
        message: String,
    },

    #[error("Task '{task}' was already started")]
    DuplicateStart { task: CompactString },

    #[error("Task '{task}' is closed and cannot be restarted")]
    TaskClosed { task: CompactString },

    #[error("Task '{task}' must be started from inside a tokio runtime")]
    NoRuntime { task: CompactString },

    #[error("Task '{task}' cannot start without a consumer")]
    MissingConsumer { task: CompactString },

    #[error("Task '{task}' already has a consumer installed")]
    ConsumerAlreadyInstalled { task: CompactString },

    #[error("Task '{task}' carries items of type {existing}, not {requested}")]
    TaskTypeMismatch {
        task: CompactString,
        existing: &'static str,
        requested: &'static str,
    },

    #[error("Invalid settings for task '{task}': {message}")]
    InvalidSettings { task: CompactString, message: String },
}

impl PipelineError {
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PipelineError::EnqueueAfterClose { .. } | PipelineError::ConsumerFault { .. }
        )
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            PipelineError::EnqueueAfterClose { .. } => RecoveryHint::Fallback,
            PipelineError::ConsumerFault { .. } => RecoveryHint::Skip,
            PipelineError::InvalidSettings { .. } => RecoveryHint::FixConfiguration,
            _ => RecoveryHint::FixCaller,
        }
    }

    /// Name of the task the error refers to.
    pub fn task(&self) -> &str {
        match self {
            PipelineError::EnqueueAfterClose { task }
            | PipelineError::ConsumerFault { task, .. }
            | PipelineError::DuplicateStart { task }
            | PipelineError::TaskClosed { task }
            | PipelineError::NoRuntime { task }
            | PipelineError::MissingConsumer { task }
            | PipelineError::ConsumerAlreadyInstalled { task }
            | PipelineError::TaskTypeMismatch { task, .. }
            | PipelineError::InvalidSettings { task, .. } => task,
        }
    }
}

// ----------------------------------------------------------------------------
// 3.3 Publish Error
// ----------------------------------------------------------------------------

/// A publish rejected because the task is closing or closed.
///
/// The item is handed back so the caller can route it somewhere else.
pub struct PublishError<T> {
    task: CompactString,
    item: T,
}

impl<T> PublishError<T> {
    pub(crate) fn new(task: CompactString, item: T) -> Self {
        Self { task, item }
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    /// Recover the rejected item.
    pub fn into_inner(self) -> T {
        self.item
    }
}

impl<T> Debug for PublishError<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublishError").field("task", &self.task).finish_non_exhaustive()
    }
}

impl<T> Display for PublishError<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Task '{}' is closed; enqueue rejected", self.task)
    }
}

impl<T> std::error::Error for PublishError<T> {}

impl<T> From<PublishError<T>> for PipelineError {
    fn from(err: PublishError<T>) -> Self {
        PipelineError::EnqueueAfterClose { task: err.task }
    }
}

impl<T> From<PublishError<T>> for EngineError {
    fn from(err: PublishError<T>) -> Self {
        EngineError::Pipeline(err.into())
    }
}

// ----------------------------------------------------------------------------
// 3.4 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Missing required configuration field: {field}")]
    MissingField { field: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn missing_field(field: impl Into<String>) -> Self {
        ConfigError::MissingField { field: field.into() }
    }
}

// ----------------------------------------------------------------------------
// 3.5 Sampler Errors
// ----------------------------------------------------------------------------

/// Errors from the pidstat samplers
#[derive(Error, Debug)]
pub enum SamplerError {
    #[error("Failed to spawn '{program}': {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' has no stdout pipe")]
    MissingStdout { program: String },

    #[error("Cannot parse line '{line}': {message}")]
    ParseLine { line: String, message: String },

    #[error("'{program}' exited with {status}")]
    Exited { program: String, status: String },

    #[error("Read failed: {0}")]
    Io(#[from] std::io::Error),
}

impl SamplerError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, SamplerError::SpawnFailed { .. } | SamplerError::MissingStdout { .. })
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            SamplerError::ParseLine { .. } => RecoveryHint::Skip,
            SamplerError::SpawnFailed { .. } => RecoveryHint::FixConfiguration,
            _ => RecoveryHint::RetryWithBackoff,
        }
    }

    pub fn parse_line(line: impl Into<String>, message: impl Into<String>) -> Self {
        SamplerError::ParseLine {
            line: line.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 3.6 Sink Errors
// ----------------------------------------------------------------------------

/// Errors from record persistence
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Write to {path} failed: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

// ----------------------------------------------------------------------------
// 3.7 Result Type Aliases
// ----------------------------------------------------------------------------

/// Standard result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Result type for batch task and registry operations
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Result type for sampler operations
pub type SamplerResult<T> = Result<T, SamplerError>;

/// Result type for sink operations
pub type SinkResult<T> = Result<T, SinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_error_returns_item() {
        let err = PublishError::new(CompactString::from("cpu"), vec![1, 2, 3]);
        assert_eq!(err.task(), "cpu");
        assert_eq!(err.to_string(), "Task 'cpu' is closed; enqueue rejected");
        assert_eq!(err.into_inner(), vec![1, 2, 3]);
    }

    #[test]
    fn test_publish_error_converts_to_enqueue_after_close() {
        let err: PipelineError = PublishError::new(CompactString::from("io"), 7u32).into();
        assert!(matches!(err, PipelineError::EnqueueAfterClose { ref task } if task.as_str() == "io"));
        assert!(err.is_recoverable());
        assert_eq!(err.recovery_hint(), RecoveryHint::Fallback);
    }

    #[test]
    fn test_contract_violations_are_not_recoverable() {
        let err = PipelineError::DuplicateStart { task: "memory".into() };
        assert!(!err.is_recoverable());
        assert_eq!(err.recovery_hint(), RecoveryHint::FixCaller);
        assert_eq!(err.task(), "memory");

        let engine: EngineError = err.into();
        assert_eq!(engine.category(), "pipeline");
        assert!(!engine.is_recoverable());
    }

    #[test]
    fn test_config_error_hint() {
        let err: EngineError = ConfigError::invalid_value("tasks.max_batch_size", "must be > 0").into();
        assert_eq!(err.recovery_hint(), RecoveryHint::FixConfiguration);
        assert!(err.to_string().contains("tasks.max_batch_size"));
    }
}
