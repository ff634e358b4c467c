//! # Procmon Engine
//!
//! Samples per-process CPU, memory and IO statistics from `pidstat` and moves
//! them to durable storage through named, batching collection tasks.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            PROCMON ENGINE                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │  SAMPLERS → BATCH TASKS (queue + buffer + loop) → SINKS                 │
//! │                   ▲                                                     │
//! │           TASK REGISTRY ← SHUTDOWN COORDINATOR (grace, close, join)     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Pipeline Guarantees
//!
//! - FIFO within a task, contiguous non-overlapping batches
//! - Size-triggered and time-triggered flushes, never concurrent
//! - Consumer faults are logged and the batch is dropped; the loop lives on
//! - Shutdown drains every queued item before acknowledging
//!
//! Delivery is memory-only and at-most-once. A consumer that keeps failing
//! loses every batch it is handed until it recovers.

// ============================================================================
// SECTION 1: MODULES
// ============================================================================

#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod records;
pub mod registry;
pub mod sampler;
pub mod shutdown;
pub mod sink;
pub mod task;

pub use config::{EngineConfig, LoggingConfig, MonitorConfig, ShutdownConfig, SinkConfig, TaskConfig};
pub use engine::Engine;
pub use error::{
    ConfigError, EngineError, EngineResult, PipelineError, PipelineResult, PublishError, RecoveryHint,
    SamplerError, SinkError,
};
pub use records::{ProcessCpuStats, ProcessIoStats, ProcessMemStats, Record, RecordKind};
pub use registry::{ManagedTask, TaskRegistry};
pub use shutdown::{ShutdownCoordinator, ShutdownReport};
pub use task::{BatchConsumer, BatchTask, TaskSettings, TaskState, TaskStatsSnapshot};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Engine version - follows semantic versioning
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_FULL_NAME: &str = "Procmon Telemetry Engine";

// ----------------------------------------------------------------------------
// Queue & Batch Sizes
// ----------------------------------------------------------------------------

/// Base queue depth; sized for roughly 1024 publishes per second per task
pub const BASE_CHANNEL_LEN: usize = 1024;

/// Default bounded queue capacity of a batch task
pub const DEFAULT_QUEUE_CAPACITY: usize = BASE_CHANNEL_LEN * 5;

/// Default size trigger of a batch task
pub const DEFAULT_MAX_BATCH_SIZE: usize = BASE_CHANNEL_LEN;

/// Rows per sink write when persisting a batch
pub const DEFAULT_SINK_CHUNK_SIZE: usize = 1000;

// ----------------------------------------------------------------------------
// Timing & Intervals
// ----------------------------------------------------------------------------

/// Default time trigger of a batch task (seconds)
pub const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 5;

/// Default pidstat sampling interval (seconds)
pub const DEFAULT_SAMPLE_INTERVAL_SECS: u64 = 1;

/// Delay before closing each task during shutdown, letting in-flight publishes land (milliseconds)
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 1000;

// ----------------------------------------------------------------------------
// Well-Known Task Names
// ----------------------------------------------------------------------------

pub const CPU_TASK: &str = "cpu";
pub const MEMORY_TASK: &str = "memory";
pub const IO_TASK: &str = "io";
