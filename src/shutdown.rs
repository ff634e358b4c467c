// ============================================================================
// SECTION 8: SHUTDOWN COORDINATION
// ============================================================================
// Closes every registered task concurrently. Each close waits a grace period
// first so publishes already in flight can land, then requests the close and
// waits for the task's final flush. The coordinator returns once every task
// has acknowledged.
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinSet;
use tokio::time::{sleep, Instant};
use tracing::{error, info};

use crate::registry::TaskRegistry;
use crate::task::{TaskState, TaskStatsSnapshot};
use crate::DEFAULT_SHUTDOWN_GRACE_MS;

/// Final statistics of a coordinated shutdown.
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    /// One entry per task, sorted by name
    pub tasks: Vec<TaskStatsSnapshot>,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
}

impl ShutdownReport {
    pub fn all_closed(&self) -> bool {
        self.tasks.iter().all(|task| task.state == TaskState::Closed)
    }

    pub fn items_flushed(&self) -> u64 {
        self.tasks.iter().map(|task| task.items_flushed).sum()
    }

    pub fn items_discarded(&self) -> u64 {
        self.tasks.iter().map(|task| task.items_discarded).sum()
    }
}

/// Drives the close of every task in a registry.
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    registry: Arc<TaskRegistry>,
    grace_period: Duration,
}

impl ShutdownCoordinator {
    pub fn new(registry: Arc<TaskRegistry>) -> Self {
        Self {
            registry,
            grace_period: Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_MS),
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Close every registered task and wait for all of them.
    ///
    /// Tasks are closed in parallel, so the whole shutdown takes roughly one
    /// grace period plus the slowest final flush. Tasks registered after the
    /// call starts are not closed.
    pub async fn shutdown(self) -> ShutdownReport {
        let started = Instant::now();
        let tasks = self.registry.tasks();

        info!(
            target: "procmon::shutdown",
            tasks = tasks.len(),
            grace_ms = self.grace_period.as_millis() as u64,
            "Shutting down batch tasks"
        );

        let mut closing = JoinSet::new();
        for task in tasks {
            let grace_period = self.grace_period;
            closing.spawn(async move {
                sleep(grace_period).await;
                info!(target: "procmon::shutdown", task = task.name(), "Closing task");
                task.close().await;
                let stats = task.stats();
                info!(
                    target: "procmon::shutdown",
                    task = task.name(),
                    items_flushed = stats.items_flushed,
                    items_discarded = stats.items_discarded,
                    "Task acknowledged close"
                );
                stats
            });
        }

        let mut reports = Vec::with_capacity(closing.len());
        while let Some(joined) = closing.join_next().await {
            match joined {
                Ok(stats) => reports.push(stats),
                Err(e) => error!(target: "procmon::shutdown", error = %e, "Task close aborted"),
            }
        }
        reports.sort_by(|a, b| a.name.cmp(&b.name));

        let report = ShutdownReport {
            tasks: reports,
            elapsed: started.elapsed(),
        };
        info!(
            target: "procmon::shutdown",
            tasks = report.tasks.len(),
            items_flushed = report.items_flushed(),
            items_discarded = report.items_discarded(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Shutdown complete"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{BatchTask, TaskSettings};
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    fn settings() -> TaskSettings {
        TaskSettings::new(64, 100, Duration::from_secs(60))
    }

    fn recorded(registry: &TaskRegistry, name: &str) -> (Arc<BatchTask<u32>>, Arc<Mutex<Vec<u32>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let task = registry.get_or_create::<u32>(name, settings()).unwrap();
        let sink = seen.clone();
        task.set_consumer(move |batch: Vec<u32>| -> anyhow::Result<()> {
            sink.lock().extend(batch);
            Ok(())
        })
        .unwrap();
        task.start().unwrap();
        (task, seen)
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drains_every_task() {
        let registry = Arc::new(TaskRegistry::new());
        let (cpu, cpu_seen) = recorded(&registry, "cpu");
        let (io, io_seen) = recorded(&registry, "io");

        for i in 0..5 {
            cpu.publish(i).await.unwrap();
            io.publish(i * 10).await.unwrap();
        }

        let report = ShutdownCoordinator::new(registry.clone())
            .with_grace_period(Duration::from_secs(1))
            .shutdown()
            .await;

        assert!(report.all_closed());
        assert_eq!(report.items_flushed(), 10);
        assert_eq!(*cpu_seen.lock(), vec![0, 1, 2, 3, 4]);
        assert_eq!(*io_seen.lock(), vec![0, 10, 20, 30, 40]);
        assert_eq!(
            report.tasks.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
            vec!["cpu", "io"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_period_applies_once_not_per_task() {
        let registry = Arc::new(TaskRegistry::new());
        for name in ["a", "b", "c", "d"] {
            recorded(&registry, name);
        }

        let started = Instant::now();
        let report = ShutdownCoordinator::new(registry)
            .with_grace_period(Duration::from_secs(1))
            .shutdown()
            .await;

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(1));
        assert!(elapsed < Duration::from_secs(2));
        assert_eq!(report.tasks.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publishes_during_grace_are_delivered() {
        let registry = Arc::new(TaskRegistry::new());
        let (task, seen) = recorded(&registry, "memory");

        let shutdown = tokio::spawn(
            ShutdownCoordinator::new(registry)
                .with_grace_period(Duration::from_millis(500))
                .shutdown(),
        );

        sleep(Duration::from_millis(100)).await;
        task.publish(7).await.unwrap();

        let report = shutdown.await.unwrap();
        assert!(report.all_closed());
        assert_eq!(*seen.lock(), vec![7]);
        assert!(task.publish(8).await.is_err());
    }

    #[tokio::test]
    async fn test_empty_registry_completes() {
        let report = ShutdownCoordinator::new(Arc::new(TaskRegistry::new()))
            .with_grace_period(Duration::ZERO)
            .shutdown()
            .await;
        assert!(report.tasks.is_empty());
        assert!(report.all_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unstarted_task_is_closed_too() {
        let registry = Arc::new(TaskRegistry::new());
        let idle = registry.get_or_create::<u32>("idle", settings()).unwrap();

        let report = ShutdownCoordinator::new(registry).shutdown().await;

        assert!(idle.is_closed());
        assert_eq!(report.tasks[0].state, TaskState::Closed);
    }
}
