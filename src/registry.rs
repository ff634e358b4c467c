// ============================================================================
// SECTION 7: TASK REGISTRY
// ============================================================================
// Process-wide directory of batch tasks keyed by name. The first caller for a
// name creates the task; every later caller gets the same instance, whatever
// settings it passes. Tasks of different item types live side by side and are
// handed back typed.
// ============================================================================

use std::any::{type_name, Any};
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use async_trait::async_trait;
use compact_str::CompactString;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};

use crate::error::{PipelineError, PipelineResult};
use crate::task::{BatchTask, TaskSettings, TaskState, TaskStatsSnapshot};

// ----------------------------------------------------------------------------
// 7.1 Managed Task Trait
// ----------------------------------------------------------------------------

/// The type-independent face of a batch task, used by shutdown and reporting.
#[async_trait]
pub trait ManagedTask: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Rust type name of the items the task carries
    fn item_type(&self) -> &'static str;

    fn state(&self) -> TaskState;

    fn stats(&self) -> TaskStatsSnapshot;

    /// Close, drain and wait for the acknowledgment. Idempotent.
    async fn close(&self);

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

// ----------------------------------------------------------------------------
// 7.2 Task Registry
// ----------------------------------------------------------------------------

/// Name-keyed directory of every batch task in the process.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: DashMap<CompactString, Arc<dyn ManagedTask>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the task registered under `name`, creating it with `settings`
    /// if it does not exist yet.
    ///
    /// Concurrent callers for the same name all receive the single instance
    /// created by the first one; their own `settings` are ignored. Asking for
    /// an existing name with a different item type is an error.
    pub fn get_or_create<T: Send + 'static>(
        &self,
        name: &str,
        settings: TaskSettings,
    ) -> PipelineResult<Arc<BatchTask<T>>> {
        let existing = self.tasks.get(name).map(|entry| Arc::clone(entry.value()));
        if let Some(task) = existing {
            return Self::downcast(name, task);
        }

        let task = match self.tasks.entry(CompactString::from(name)) {
            Entry::Occupied(occupied) => Arc::clone(occupied.get()),
            Entry::Vacant(vacant) => {
                let created = Arc::new(BatchTask::<T>::new(name, settings)?);
                vacant.insert(Arc::clone(&created) as Arc<dyn ManagedTask>);
                info!(
                    target: "procmon::registry",
                    task = name,
                    item_type = type_name::<T>(),
                    queue_capacity = settings.queue_capacity,
                    max_batch_size = settings.max_batch_size,
                    flush_interval_ms = settings.flush_interval.as_millis() as u64,
                    "Task created"
                );
                return Ok(created);
            }
        };
        Self::downcast(name, task)
    }

    fn downcast<T: Send + 'static>(name: &str, task: Arc<dyn ManagedTask>) -> PipelineResult<Arc<BatchTask<T>>> {
        let existing = task.item_type();
        task.into_any()
            .downcast::<BatchTask<T>>()
            .map(|task| {
                debug!(target: "procmon::registry", task = name, "Task reused");
                task
            })
            .map_err(|_| PipelineError::TaskTypeMismatch {
                task: name.into(),
                existing,
                requested: type_name::<T>(),
            })
    }

    /// Look up a task without creating it.
    pub fn get(&self, name: &str) -> Option<Arc<dyn ManagedTask>> {
        self.tasks.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Typed lookup without creating.
    pub fn get_typed<T: Send + 'static>(&self, name: &str) -> Option<PipelineResult<Arc<BatchTask<T>>>> {
        self.get(name).map(|task| Self::downcast(name, task))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.iter().map(|entry| entry.key().to_string()).collect();
        names.sort();
        names
    }

    /// Every registered task, in no particular order.
    pub fn tasks(&self) -> Vec<Arc<dyn ManagedTask>> {
        self.tasks.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Statistics of every task, sorted by name.
    pub fn snapshot(&self) -> Vec<TaskStatsSnapshot> {
        let mut stats: Vec<TaskStatsSnapshot> = self.tasks.iter().map(|entry| entry.value().stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }
}

impl Debug for TaskRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry").field("tasks", &self.names()).finish()
    }
}
