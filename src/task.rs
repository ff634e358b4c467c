// ============================================================================
// SECTION 6: BATCH TASKS
// ============================================================================
// A batch task is a named bounded queue plus a single loop that moves queued
// items into a buffer and hands the buffer to a consumer when either:
// - the buffer reaches `max_batch_size` (size trigger), or
// - the flush interval ticks with a non-empty buffer (time trigger).
//
// Closing the task closes the queue for writes, drains what is already queued,
// flushes what is left and then acknowledges. Only the loop touches the
// buffer, so consumer invocations never overlap and batches keep publish order.
// ============================================================================

use std::any::{type_name, Any};
use std::fmt::{self, Debug, Display, Formatter};
use std::mem;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use compact_str::CompactString;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::error::{PipelineError, PipelineResult, PublishError};
use crate::registry::ManagedTask;
use crate::{DEFAULT_FLUSH_INTERVAL_SECS, DEFAULT_MAX_BATCH_SIZE, DEFAULT_QUEUE_CAPACITY};

// ----------------------------------------------------------------------------
// 6.1 Task Settings
// ----------------------------------------------------------------------------

/// Sizing and triggers of a batch task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskSettings {
    /// Bounded queue depth. Publishers wait while it is full.
    pub queue_capacity: usize,
    /// Size trigger.
    pub max_batch_size: usize,
    /// Time trigger, measured from loop start.
    pub flush_interval: Duration,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            flush_interval: Duration::from_secs(DEFAULT_FLUSH_INTERVAL_SECS),
        }
    }
}

impl TaskSettings {
    pub fn new(queue_capacity: usize, max_batch_size: usize, flush_interval: Duration) -> Self {
        Self {
            queue_capacity,
            max_batch_size,
            flush_interval,
        }
    }

    fn validate(&self, task: &str) -> PipelineResult<()> {
        let invalid = |message: &str| PipelineError::InvalidSettings {
            task: task.into(),
            message: message.to_string(),
        };
        if self.queue_capacity == 0 {
            return Err(invalid("queue capacity must be greater than zero"));
        }
        if self.max_batch_size == 0 {
            return Err(invalid("max batch size must be greater than zero"));
        }
        if self.flush_interval.is_zero() {
            return Err(invalid("flush interval must be greater than zero"));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 6.2 Lifecycle State
// ----------------------------------------------------------------------------

/// Lifecycle of a batch task. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[repr(u8)]
pub enum TaskState {
    /// Constructed, loop not started
    Created = 0,
    /// Loop running
    Running = 1,
    /// Close requested, queue closed, drain in progress
    Closing = 2,
    /// Final flush done and acknowledged
    Closed = 3,
}

impl TaskState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TaskState::Created,
            1 => TaskState::Running,
            2 => TaskState::Closing,
            _ => TaskState::Closed,
        }
    }

    /// Whether publishes are still admitted
    pub fn accepts_items(&self) -> bool {
        matches!(self, TaskState::Created | TaskState::Running)
    }
}

impl Display for TaskState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Created => write!(f, "created"),
            TaskState::Running => write!(f, "running"),
            TaskState::Closing => write!(f, "closing"),
            TaskState::Closed => write!(f, "closed"),
        }
    }
}

// ----------------------------------------------------------------------------
// 6.3 Batch Consumer
// ----------------------------------------------------------------------------

/// Receives the batches of one task.
///
/// Called with non-empty batches of at most `max_batch_size` items, one call
/// at a time. An `Err` or a panic discards the batch; it is never retried.
/// A consumer must not publish to its own task: the loop is busy waiting on
/// the consumer and a full queue would never drain.
#[async_trait]
pub trait BatchConsumer<T: Send + 'static>: Send + Sync + 'static {
    async fn consume(&self, batch: Vec<T>) -> anyhow::Result<()>;
}

#[async_trait]
impl<T, F> BatchConsumer<T> for F
where
    T: Send + 'static,
    F: Fn(Vec<T>) -> anyhow::Result<()> + Send + Sync + 'static,
{
    async fn consume(&self, batch: Vec<T>) -> anyhow::Result<()> {
        (self)(batch)
    }
}

/// What caused a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushTrigger {
    Size,
    Time,
    Close,
}

impl FlushTrigger {
    fn as_str(&self) -> &'static str {
        match self {
            FlushTrigger::Size => "size",
            FlushTrigger::Time => "time",
            FlushTrigger::Close => "close",
        }
    }
}

// ----------------------------------------------------------------------------
// 6.4 Task Statistics
// ----------------------------------------------------------------------------

/// Counters shared between publishers and the loop.
#[derive(Debug, Default)]
struct TaskStats {
    published: AtomicU64,
    rejected: AtomicU64,
    batches_flushed: AtomicU64,
    items_flushed: AtomicU64,
    size_flushes: AtomicU64,
    time_flushes: AtomicU64,
    close_flushes: AtomicU64,
    consumer_faults: AtomicU64,
    items_discarded: AtomicU64,
    pending: AtomicUsize,
    queue_high_water: AtomicUsize,
}

impl TaskStats {
    fn record_publish(&self, depth: usize) {
        self.published.fetch_add(1, AtomicOrdering::Relaxed);

        let mut hwm = self.queue_high_water.load(AtomicOrdering::Relaxed);
        while depth > hwm {
            match self.queue_high_water.compare_exchange_weak(
                hwm,
                depth,
                AtomicOrdering::Relaxed,
                AtomicOrdering::Relaxed,
            ) {
                Ok(_) => break,
                Err(h) => hwm = h,
            }
        }
    }

    fn record_rejected(&self) {
        self.rejected.fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn record_flush(&self, trigger: FlushTrigger, items: usize) {
        self.batches_flushed.fetch_add(1, AtomicOrdering::Relaxed);
        self.items_flushed.fetch_add(items as u64, AtomicOrdering::Relaxed);
        let counter = match trigger {
            FlushTrigger::Size => &self.size_flushes,
            FlushTrigger::Time => &self.time_flushes,
            FlushTrigger::Close => &self.close_flushes,
        };
        counter.fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn record_fault(&self, items: usize) {
        self.consumer_faults.fetch_add(1, AtomicOrdering::Relaxed);
        self.items_discarded.fetch_add(items as u64, AtomicOrdering::Relaxed);
    }

    fn record_discard(&self, items: usize) {
        self.items_discarded.fetch_add(items as u64, AtomicOrdering::Relaxed);
    }

    fn set_pending(&self, pending: usize) {
        self.pending.store(pending, AtomicOrdering::Relaxed);
    }
}

/// Point-in-time view of a task's counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskStatsSnapshot {
    pub name: String,
    pub item_type: &'static str,
    pub state: TaskState,
    pub published: u64,
    pub rejected: u64,
    pub batches_flushed: u64,
    pub items_flushed: u64,
    pub size_flushes: u64,
    pub time_flushes: u64,
    pub close_flushes: u64,
    pub consumer_faults: u64,
    pub items_discarded: u64,
    /// Items sitting in the buffer, waiting for a trigger
    pub pending: usize,
    /// Items sitting in the queue, not yet seen by the loop
    pub queue_depth: usize,
    pub queue_high_water: usize,
}

// ----------------------------------------------------------------------------
// 6.5 Batch Task
// ----------------------------------------------------------------------------

/// A named queue, its buffer and the loop that flushes it.
///
/// Producer contract: [`set_consumer`](Self::set_consumer) once, then
/// [`start`](Self::start) once from inside a tokio runtime, then
/// [`publish`](Self::publish) as often as needed.
pub struct BatchTask<T: Send + 'static> {
    name: CompactString,
    settings: TaskSettings,
    sender: mpsc::Sender<T>,
    /// Taken by whichever of `start` or `close` gets to it first
    receiver: Mutex<Option<mpsc::Receiver<T>>>,
    consumer: Mutex<Option<Arc<dyn BatchConsumer<T>>>>,
    state: AtomicU8,
    close_requested: CancellationToken,
    drained: CancellationToken,
    stats: TaskStats,
}

impl<T: Send + 'static> BatchTask<T> {
    /// Create a task. Nothing runs until [`start`](Self::start).
    pub fn new(name: impl Into<CompactString>, settings: TaskSettings) -> PipelineResult<Self> {
        let name = name.into();
        settings.validate(&name)?;

        let (sender, receiver) = mpsc::channel(settings.queue_capacity);
        Ok(Self {
            name,
            settings,
            sender,
            receiver: Mutex::new(Some(receiver)),
            consumer: Mutex::new(None),
            state: AtomicU8::new(TaskState::Created as u8),
            close_requested: CancellationToken::new(),
            drained: CancellationToken::new(),
            stats: TaskStats::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &TaskSettings {
        &self.settings
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(AtomicOrdering::Acquire))
    }

    pub fn is_closed(&self) -> bool {
        self.state() == TaskState::Closed
    }

    /// Items in the buffer waiting for a trigger.
    pub fn pending(&self) -> usize {
        self.stats.pending.load(AtomicOrdering::Relaxed)
    }

    /// Items in the queue not yet picked up by the loop.
    pub fn queue_depth(&self) -> usize {
        self.settings.queue_capacity.saturating_sub(self.sender.capacity())
    }

    /// Install the batch handler. Must happen once, before `start`.
    pub fn set_consumer<C>(&self, consumer: C) -> PipelineResult<()>
    where
        C: BatchConsumer<T>,
    {
        let mut slot = self.consumer.lock();
        if slot.is_some() || self.state() != TaskState::Created {
            return Err(PipelineError::ConsumerAlreadyInstalled {
                task: self.name.clone(),
            });
        }
        *slot = Some(Arc::new(consumer));
        Ok(())
    }

    /// Spawn the loop onto the current tokio runtime.
    ///
    /// Calling this twice is a bug in the caller and returns
    /// [`PipelineError::DuplicateStart`]; the running loop is unaffected.
    /// Outside a runtime it returns [`PipelineError::NoRuntime`] and the task
    /// stays `Created`.
    pub fn start(self: &Arc<Self>) -> PipelineResult<()> {
        let consumer = self.consumer.lock().clone().ok_or_else(|| PipelineError::MissingConsumer {
            task: self.name.clone(),
        })?;
        let runtime = Handle::try_current().map_err(|_| PipelineError::NoRuntime {
            task: self.name.clone(),
        })?;

        if let Err(current) = self.state.compare_exchange(
            TaskState::Created as u8,
            TaskState::Running as u8,
            AtomicOrdering::AcqRel,
            AtomicOrdering::Acquire,
        ) {
            return Err(match TaskState::from_u8(current) {
                TaskState::Running => {
                    warn!(target: "procmon::task", task = %self.name, "Batch loop started twice");
                    PipelineError::DuplicateStart {
                        task: self.name.clone(),
                    }
                }
                _ => PipelineError::TaskClosed {
                    task: self.name.clone(),
                },
            });
        }

        let receiver = self.receiver.lock().take().ok_or_else(|| PipelineError::DuplicateStart {
            task: self.name.clone(),
        })?;

        let task = Arc::clone(self);
        runtime.spawn(async move { task.run(receiver, consumer).await });
        Ok(())
    }

    /// Queue an item, waiting while the queue is full.
    ///
    /// There is no timeout: a full queue on a task that never closes blocks
    /// the caller indefinitely. Returns the item inside the error once the
    /// task is closing or closed.
    pub async fn publish(&self, item: T) -> Result<(), PublishError<T>> {
        if !self.state().accepts_items() {
            return Err(self.reject(item));
        }
        match self.sender.send(item).await {
            Ok(()) => {
                self.stats.record_publish(self.queue_depth());
                Ok(())
            }
            Err(mpsc::error::SendError(item)) => Err(self.reject(item)),
        }
    }

    /// Blocking variant of [`publish`](Self::publish) for non-async threads.
    ///
    /// Panics when called from inside an async execution context, like
    /// `tokio::sync::mpsc::Sender::blocking_send`.
    pub fn publish_blocking(&self, item: T) -> Result<(), PublishError<T>> {
        if !self.state().accepts_items() {
            return Err(self.reject(item));
        }
        match self.sender.blocking_send(item) {
            Ok(()) => {
                self.stats.record_publish(self.queue_depth());
                Ok(())
            }
            Err(mpsc::error::SendError(item)) => Err(self.reject(item)),
        }
    }

    fn reject(&self, item: T) -> PublishError<T> {
        self.stats.record_rejected();
        PublishError::new(self.name.clone(), item)
    }

    /// Close the queue, drain it, flush what is left and wait for the
    /// acknowledgment. Safe to call more than once; every caller returns
    /// after the same final flush.
    pub async fn close(&self) {
        loop {
            let current = self.state();
            match current {
                TaskState::Running => {
                    if self.transition(TaskState::Running, TaskState::Closing) {
                        info!(target: "procmon::task", task = %self.name, "Close requested");
                        self.close_requested.cancel();
                        break;
                    }
                }
                TaskState::Created => {
                    if self.transition(TaskState::Created, TaskState::Closing) {
                        info!(target: "procmon::task", task = %self.name, "Closing task that never started");
                        self.close_unstarted().await;
                        break;
                    }
                }
                TaskState::Closing | TaskState::Closed => break,
            }
        }
        self.drained.cancelled().await;
    }

    fn transition(&self, from: TaskState, to: TaskState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, AtomicOrdering::AcqRel, AtomicOrdering::Acquire)
            .is_ok()
    }

    pub fn stats(&self) -> TaskStatsSnapshot {
        TaskStatsSnapshot {
            name: self.name.to_string(),
            item_type: type_name::<T>(),
            state: self.state(),
            published: self.stats.published.load(AtomicOrdering::Relaxed),
            rejected: self.stats.rejected.load(AtomicOrdering::Relaxed),
            batches_flushed: self.stats.batches_flushed.load(AtomicOrdering::Relaxed),
            items_flushed: self.stats.items_flushed.load(AtomicOrdering::Relaxed),
            size_flushes: self.stats.size_flushes.load(AtomicOrdering::Relaxed),
            time_flushes: self.stats.time_flushes.load(AtomicOrdering::Relaxed),
            close_flushes: self.stats.close_flushes.load(AtomicOrdering::Relaxed),
            consumer_faults: self.stats.consumer_faults.load(AtomicOrdering::Relaxed),
            items_discarded: self.stats.items_discarded.load(AtomicOrdering::Relaxed),
            pending: self.pending(),
            queue_depth: self.queue_depth(),
            queue_high_water: self.stats.queue_high_water.load(AtomicOrdering::Relaxed),
        }
    }

    // ------------------------------------------------------------------------
    // Loop
    // ------------------------------------------------------------------------

    async fn run(self: Arc<Self>, mut receiver: mpsc::Receiver<T>, consumer: Arc<dyn BatchConsumer<T>>) {
        let _completion = Completion { task: &*self };

        let period = self.settings.flush_interval;
        let max_batch = self.settings.max_batch_size;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut buffer: Vec<T> = Vec::with_capacity(max_batch);

        info!(
            target: "procmon::task",
            task = %self.name,
            queue_capacity = self.settings.queue_capacity,
            max_batch_size = max_batch,
            flush_interval_ms = period.as_millis() as u64,
            "Batch loop started"
        );

        loop {
            tokio::select! {
                _ = self.close_requested.cancelled() => break,
                received = receiver.recv() => match received {
                    Some(item) => {
                        buffer.push(item);
                        if buffer.len() >= max_batch {
                            let batch = mem::replace(&mut buffer, Vec::with_capacity(max_batch));
                            self.stats.set_pending(0);
                            self.flush(consumer.as_ref(), batch, FlushTrigger::Size).await;
                        } else {
                            self.stats.set_pending(buffer.len());
                        }
                    }
                    // Unreachable while the task holds its sender.
                    None => break,
                },
                _ = ticker.tick() => {
                    if buffer.is_empty() {
                        trace!(target: "procmon::task", task = %self.name, "Idle tick");
                    } else {
                        let batch = mem::replace(&mut buffer, Vec::with_capacity(max_batch));
                        self.stats.set_pending(0);
                        self.flush(consumer.as_ref(), batch, FlushTrigger::Time).await;
                    }
                }
            }
        }

        self.drain(receiver, Some(consumer.as_ref()), buffer).await;
    }

    async fn close_unstarted(&self) {
        let _completion = Completion { task: self };

        let receiver = self.receiver.lock().take();
        let consumer = self.consumer.lock().clone();
        if let Some(receiver) = receiver {
            self.drain(receiver, consumer.as_deref(), Vec::new()).await;
        }
    }

    /// Close the queue for writes and flush everything still in it.
    ///
    /// Publishers blocked on a full queue are released with an error. The
    /// final flush is split at `max_batch_size` so the consumer never sees a
    /// larger batch.
    async fn drain(&self, mut receiver: mpsc::Receiver<T>, consumer: Option<&dyn BatchConsumer<T>>, mut buffer: Vec<T>) {
        receiver.close();
        let max_batch = self.settings.max_batch_size;

        while let Some(item) = receiver.recv().await {
            buffer.push(item);
            if buffer.len() >= max_batch {
                let batch = mem::replace(&mut buffer, Vec::with_capacity(max_batch));
                self.flush_or_discard(consumer, batch).await;
            }
        }
        if !buffer.is_empty() {
            self.flush_or_discard(consumer, buffer).await;
        }
        self.stats.set_pending(0);

        debug!(target: "procmon::task", task = %self.name, "Queue drained");
    }

    async fn flush_or_discard(&self, consumer: Option<&dyn BatchConsumer<T>>, batch: Vec<T>) {
        match consumer {
            Some(consumer) => self.flush(consumer, batch, FlushTrigger::Close).await,
            None => {
                warn!(
                    target: "procmon::task",
                    task = %self.name,
                    batch_len = batch.len(),
                    "No consumer installed, discarding drained items"
                );
                self.stats.record_discard(batch.len());
            }
        }
    }

    /// Hand one batch to the consumer. Errors and panics stop here.
    async fn flush(&self, consumer: &dyn BatchConsumer<T>, batch: Vec<T>, trigger: FlushTrigger) {
        let batch_len = batch.len();
        let started = Instant::now();

        let outcome = AssertUnwindSafe(async move { consumer.consume(batch).await })
            .catch_unwind()
            .await;

        let message = match outcome {
            Ok(Ok(())) => {
                self.stats.record_flush(trigger, batch_len);
                debug!(
                    target: "procmon::task",
                    task = %self.name,
                    trigger = trigger.as_str(),
                    batch_len,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Batch flushed"
                );
                return;
            }
            Ok(Err(err)) => format!("{:#}", err),
            Err(panic) => format!("consumer panicked: {}", panic_message(panic.as_ref())),
        };

        self.stats.record_fault(batch_len);
        let fault = PipelineError::ConsumerFault {
            task: self.name.clone(),
            batch_len,
            message,
        };
        error!(
            target: "procmon::task",
            task = %self.name,
            trigger = trigger.as_str(),
            batch_len,
            error = %fault,
            "Batch discarded"
        );
    }
}

impl<T: Send + 'static> Debug for BatchTask<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchTask")
            .field("name", &self.name)
            .field("item_type", &type_name::<T>())
            .field("settings", &self.settings)
            .field("state", &self.state())
            .field("pending", &self.pending())
            .finish()
    }
}

#[async_trait]
impl<T: Send + 'static> ManagedTask for BatchTask<T> {
    fn name(&self) -> &str {
        BatchTask::name(self)
    }

    fn item_type(&self) -> &'static str {
        type_name::<T>()
    }

    fn state(&self) -> TaskState {
        BatchTask::state(self)
    }

    fn stats(&self) -> TaskStatsSnapshot {
        BatchTask::stats(self)
    }

    async fn close(&self) {
        BatchTask::close(self).await
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Marks the task closed and releases every `close` waiter when dropped,
/// including when the loop unwinds.
struct Completion<'a, T: Send + 'static> {
    task: &'a BatchTask<T>,
}

impl<T: Send + 'static> Drop for Completion<'_, T> {
    fn drop(&mut self) {
        self.task.state.store(TaskState::Closed as u8, AtomicOrdering::Release);
        self.task.drained.cancel();
        info!(target: "procmon::task", task = %self.task.name, "Task closed");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// ----------------------------------------------------------------------------
// 6.6 Tests
// ----------------------------------------------------------------------------
