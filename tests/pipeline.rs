//! End-to-end checks of registry, batch tasks, sink and shutdown together.

use std::collections::HashSet;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

use procmon_engine::sink::{JsonLinesSink, SinkConsumer};
use procmon_engine::{
    ProcessMemStats, Record, RecordKind, ShutdownCoordinator, TaskRegistry, TaskSettings, TaskState,
};

fn mem_row(pid: u32) -> ProcessMemStats {
    ProcessMemStats {
        ip: "10.1.2.3".to_string(),
        timestamp: Utc::now(),
        uid: 0,
        pid,
        minor_faults: 0.0,
        major_faults: 0.0,
        vsz: 1024,
        rss: 512,
        mem_percent: 0.1,
        command: "mysqld".into(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_publishers_lose_nothing_across_shutdown() {
    let registry = Arc::new(TaskRegistry::new());
    let batches: Arc<Mutex<Vec<Vec<(u32, u32)>>>> = Arc::new(Mutex::new(Vec::new()));

    let task = registry
        .get_or_create::<(u32, u32)>("pairs", TaskSettings::new(32, 16, Duration::from_millis(20)))
        .unwrap();
    let seen = batches.clone();
    task.set_consumer(move |batch: Vec<(u32, u32)>| -> anyhow::Result<()> {
        seen.lock().push(batch);
        Ok(())
    })
    .unwrap();
    task.start().unwrap();

    let publishers: Vec<_> = (0..4u32)
        .map(|producer| {
            let registry = registry.clone();
            tokio::spawn(async move {
                let task = registry
                    .get_or_create::<(u32, u32)>("pairs", TaskSettings::default())
                    .unwrap();
                for seq in 0..500u32 {
                    task.publish((producer, seq)).await.unwrap();
                }
            })
        })
        .collect();
    for publisher in publishers {
        publisher.await.unwrap();
    }

    let report = ShutdownCoordinator::new(registry.clone())
        .with_grace_period(Duration::from_millis(50))
        .shutdown()
        .await;

    assert!(report.all_closed());
    assert_eq!(report.items_flushed(), 2000);

    let batches = batches.lock();
    assert!(batches.iter().all(|batch| !batch.is_empty() && batch.len() <= 16));

    // Each producer's items arrive in the order it published them.
    let flattened: Vec<(u32, u32)> = batches.iter().flatten().copied().collect();
    for producer in 0..4u32 {
        let seqs: Vec<u32> = flattened.iter().filter(|(p, _)| *p == producer).map(|(_, s)| *s).collect();
        assert_eq!(seqs, (0..500).collect::<Vec<_>>());
    }
    let unique: HashSet<(u32, u32)> = flattened.into_iter().collect();
    assert_eq!(unique.len(), 2000);
}

#[tokio::test]
async fn sink_backed_task_persists_everything_on_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(JsonLinesSink::open(dir.path(), 1000).unwrap());
    let registry = Arc::new(TaskRegistry::new());

    let task = registry
        .get_or_create::<ProcessMemStats>(
            ProcessMemStats::KIND.task_name(),
            TaskSettings::new(128, 25, Duration::from_secs(30)),
        )
        .unwrap();
    task.set_consumer(SinkConsumer::<ProcessMemStats>::new(sink.clone())).unwrap();
    task.start().unwrap();

    for pid in 0..60 {
        task.publish(mem_row(pid)).await.unwrap();
    }

    let report = ShutdownCoordinator::new(registry)
        .with_grace_period(Duration::ZERO)
        .shutdown()
        .await;

    assert_eq!(task.state(), TaskState::Closed);
    assert_eq!(report.tasks[0].name, "memory");
    assert_eq!(report.tasks[0].items_flushed, 60);

    let stored = fs::read_to_string(sink.path_for(RecordKind::Memory)).unwrap();
    let pids: Vec<u32> = stored
        .lines()
        .map(|line| serde_json::from_str::<ProcessMemStats>(line).unwrap().pid)
        .collect();
    assert_eq!(pids, (0..60).collect::<Vec<_>>());

    // Late publishes are refused and hand the record back.
    let rejected = task.publish(mem_row(99)).await.unwrap_err();
    assert_eq!(rejected.into_inner().pid, 99);
}
