// ============================================================================
// SECTION 12: ENGINE
// ============================================================================
// Wires configuration, registry, sink, batch tasks and samplers together,
// waits for a termination signal (or for every sampler to stop), then stops
// the samplers and hands the tasks to the shutdown coordinator.
// ============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::select_all;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult, SamplerResult};
use crate::records::{ProcessCpuStats, ProcessIoStats, ProcessMemStats, Record, RecordKind};
use crate::registry::TaskRegistry;
use crate::sampler::{PidstatSampler, SamplerStatsSnapshot};
use crate::shutdown::{ShutdownCoordinator, ShutdownReport};
use crate::sink::{JsonLinesSink, SinkConsumer};
use crate::ENGINE_VERSION;

type SamplerExit = (RecordKind, SamplerResult<SamplerStatsSnapshot>);

/// The running monitor.
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    registry: Arc<TaskRegistry>,
    shutdown: CancellationToken,
    start_time: Instant,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            registry: Arc::new(TaskRegistry::new()),
            shutdown: CancellationToken::new(),
            start_time: Instant::now(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> Arc<TaskRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Request shutdown, as a termination signal would.
    pub fn shutdown(&self) {
        info!(target: "procmon::engine", "Shutdown requested");
        self.shutdown.cancel();
    }

    /// Run until a termination signal arrives or every sampler has stopped,
    /// then drain every task.
    pub async fn run(&self) -> EngineResult<ShutdownReport> {
        self.config.validate_for_run()?;

        info!(
            target: "procmon::engine",
            version = ENGINE_VERSION,
            ip = %self.config.monitor.ip,
            processes = ?self.config.monitor.process_names,
            "Starting engine"
        );

        let sink = Arc::new(JsonLinesSink::from_config(&self.config.sink)?);
        let signals = listen_for_signals()?;
        let mut samplers: JoinSet<SamplerExit> = JoinSet::new();
        for kind in RecordKind::ALL {
            if !self.kind_enabled(kind) {
                info!(target: "procmon::engine", kind = %kind, "Sampler disabled");
                continue;
            }
            match kind {
                RecordKind::Cpu => self.spawn_sampler::<ProcessCpuStats>(&mut samplers, &sink)?,
                RecordKind::Memory => self.spawn_sampler::<ProcessMemStats>(&mut samplers, &sink)?,
                RecordKind::Io => self.spawn_sampler::<ProcessIoStats>(&mut samplers, &sink)?,
            }
        }

        let signals = tokio::spawn(wait_for_signal(signals, self.shutdown.clone()));

        info!(target: "procmon::engine", samplers = samplers.len(), "Engine running");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                joined = samplers.join_next() => match joined {
                    Some(exit) => log_sampler_exit(exit),
                    None => {
                        warn!(target: "procmon::engine", "Every sampler has stopped");
                        break;
                    }
                },
            }
        }

        info!(target: "procmon::engine", "Stopping samplers");
        self.shutdown.cancel();
        signals.abort();
        while let Some(exit) = samplers.join_next().await {
            log_sampler_exit(exit);
        }

        let report = ShutdownCoordinator::new(self.registry())
            .with_grace_period(self.config.shutdown.grace_period)
            .shutdown()
            .await;

        let sink_stats = sink.stats();
        info!(
            target: "procmon::engine",
            uptime_secs = self.uptime().as_secs(),
            rows_written = sink_stats.rows_written,
            fallback_writes = sink_stats.fallback_writes,
            items_discarded = report.items_discarded(),
            "Engine stopped"
        );
        Ok(report)
    }

    fn kind_enabled(&self, kind: RecordKind) -> bool {
        match kind {
            RecordKind::Cpu => self.config.monitor.cpu,
            RecordKind::Memory => self.config.monitor.memory,
            RecordKind::Io => self.config.monitor.io,
        }
    }

    /// Create the kind's task with the sink as consumer, start it and spawn
    /// its sampler.
    fn spawn_sampler<R: Record>(
        &self,
        samplers: &mut JoinSet<SamplerExit>,
        sink: &Arc<JsonLinesSink>,
    ) -> EngineResult<()> {
        let task = self
            .registry
            .get_or_create::<R>(R::KIND.task_name(), self.config.tasks.settings())?;
        task.set_consumer(SinkConsumer::<R>::new(Arc::clone(sink)))?;
        task.start()?;

        let sampler = PidstatSampler::new(&self.config.monitor, task, Arc::clone(sink));
        let shutdown = self.shutdown.clone();
        samplers.spawn(async move {
            let result = sampler.run(shutdown).await.map(|()| sampler.stats());
            (R::KIND, result)
        });
        Ok(())
    }
}

fn log_sampler_exit(exit: Result<SamplerExit, tokio::task::JoinError>) {
    match exit {
        Ok((kind, Ok(stats))) => info!(
            target: "procmon::sampler",
            kind = %kind,
            published = stats.published,
            malformed = stats.malformed,
            fallback_writes = stats.fallback_writes,
            lost = stats.lost,
            "Sampler exited"
        ),
        Ok((kind, Err(e))) => error!(
            target: "procmon::sampler",
            kind = %kind,
            error = %e,
            recoverable = e.is_recoverable(),
            "Sampler failed"
        ),
        Err(e) => error!(target: "procmon::sampler", error = %e, "Sampler task aborted"),
    }
}

// ----------------------------------------------------------------------------
// Signals
// ----------------------------------------------------------------------------

fn listen_for_signals() -> EngineResult<Vec<(&'static str, Signal)>> {
    [
        ("SIGHUP", SignalKind::hangup()),
        ("SIGINT", SignalKind::interrupt()),
        ("SIGTERM", SignalKind::terminate()),
        ("SIGQUIT", SignalKind::quit()),
        ("SIGUSR1", SignalKind::user_defined1()),
        ("SIGUSR2", SignalKind::user_defined2()),
    ]
    .into_iter()
    .map(|(name, kind)| signal(kind).map(|stream| (name, stream)).map_err(EngineError::Io))
    .collect()
}

async fn wait_for_signal(mut signals: Vec<(&'static str, Signal)>, shutdown: CancellationToken) {
    let received = signals.iter_mut().map(|(name, stream)| {
        let name: &'static str = *name;
        Box::pin(async move {
            stream.recv().await;
            name
        })
    });
    let (name, _, _) = select_all(received).await;
    info!(target: "procmon::engine", signal = name, "Received termination signal");
    shutdown.cancel();
}
