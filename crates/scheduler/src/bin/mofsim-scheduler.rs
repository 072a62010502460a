//! mofsim-scheduler: runs the GPU scheduler daemon.
//!
//! Loads `config/scheduler.toml` (or defaults plus `MOFSIM_*` overrides),
//! starts the placement, health and supervision loops, and writes every
//! scheduler event to the log as JSON under its topic.
//!
//! With `--simulate-workers` each configured GPU gets an in-process worker
//! that heartbeats, acknowledges assignments and completes them after
//! `--job-ms`. `--demo-tasks N` submits a mixed batch at startup.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use mofsim_core::config::load_dotenv;
use mofsim_core::{GpuId, JobKind, Priority, SchedulerConfig, SchedulerEvent, TaskId, TaskSpec};
use mofsim_scheduler::{ChannelWorkerControl, SchedulerService, TaskOutcome, WorkerCommand};

// ── CLI ─────────────────────────────────────────────────────────────

/// Single-node GPU scheduler for MOF simulation jobs.
#[derive(Parser, Debug)]
#[command(name = "mofsim-scheduler", version, about)]
struct Cli {
    /// Path to scheduler.toml config file.
    #[arg(long, env = "MOFSIM_CONFIG", default_value = "config/scheduler.toml")]
    config: String,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, env = "MOFSIM_LOG", default_value = "info")]
    log_filter: String,

    /// Attach an in-process worker to every configured GPU.
    #[arg(long, default_value_t = false)]
    simulate_workers: bool,

    /// Simulated job duration in milliseconds.
    #[arg(long, default_value_t = 2000)]
    job_ms: u64,

    /// Number of demo tasks to submit at startup.
    #[arg(long, default_value_t = 0)]
    demo_tasks: usize,
}

// ── Simulated worker ────────────────────────────────────────────────

/// Stand-in for an external GPU worker process.
struct SimulatedWorker {
    worker_id: String,
    service: Arc<SchedulerService>,
    job: Duration,
    heartbeat: Duration,
}

impl SimulatedWorker {
    async fn run(
        self,
        mut commands: mpsc::UnboundedReceiver<WorkerCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut heartbeat = tokio::time::interval(self.heartbeat);
        let mut jobs: HashMap<TaskId, JoinHandle<()>> = HashMap::new();
        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if let Err(e) = self.service.heartbeat(&self.worker_id, None) {
                        warn!(worker_id = %self.worker_id, error = %e, "heartbeat rejected");
                    }
                    jobs.retain(|_, handle| !handle.is_finished());
                }
                command = commands.recv() => match command {
                    Some(WorkerCommand::Run(assignment)) => {
                        let task_id = assignment.task_id;
                        if let Err(e) = self.service.report_started(task_id, &self.worker_id) {
                            warn!(%task_id, error = %e, "start report rejected");
                            continue;
                        }
                        let service = Arc::clone(&self.service);
                        let job = self.job;
                        jobs.insert(task_id, tokio::spawn(async move {
                            tokio::time::sleep(job).await;
                            if let Err(e) = service.report(task_id, TaskOutcome::Completed) {
                                warn!(%task_id, error = %e, "completion report rejected");
                            }
                        }));
                    }
                    Some(WorkerCommand::Stop { task_id }) => {
                        if let Some(handle) = jobs.remove(&task_id) {
                            handle.abort();
                        }
                        if let Err(e) = self.service.report(task_id, TaskOutcome::Cancelled) {
                            debug!(%task_id, error = %e, "stop acknowledgement ignored");
                        }
                    }
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        for (_, handle) in jobs {
            handle.abort();
        }
        info!(worker_id = %self.worker_id, "simulated worker stopped");
    }
}

fn spawn_simulated_workers(
    service: &Arc<SchedulerService>,
    control: &ChannelWorkerControl,
    gpus: &[GpuId],
    job: Duration,
    shutdown: &watch::Receiver<bool>,
) -> anyhow::Result<Vec<JoinHandle<()>>> {
    let heartbeat = Duration::from_secs(service.config().health.heartbeat_interval_secs.max(1));
    let mut handles = Vec::with_capacity(gpus.len());
    for &gpu_id in gpus {
        let worker_id = format!("sim-worker-{gpu_id}");
        let commands = control.connect(&worker_id);
        service.register_worker(&worker_id, gpu_id)?;
        let worker = SimulatedWorker {
            worker_id,
            service: Arc::clone(service),
            job,
            heartbeat,
        };
        handles.push(tokio::spawn(worker.run(commands, shutdown.clone())));
    }
    info!(workers = handles.len(), "simulated workers attached");
    Ok(handles)
}

fn submit_demo_tasks(service: &SchedulerService, count: usize) {
    const MODELS: [&str; 3] = ["mace-mp-0-medium", "orb-v2", "sevennet-0"];
    for i in 0..count {
        let kind = JobKind::ALL[i % JobKind::ALL.len()];
        let priority = Priority::ALL[i % Priority::ALL.len()];
        let model = MODELS[i % MODELS.len()];
        let atoms = 50 + (i as u32 * 37) % 400;
        let mut spec = TaskSpec::new(kind, priority, model, atoms);
        spec.structure_id = Some(format!("demo-mof-{i:03}"));
        match service.submit(spec) {
            Ok(receipt) => debug!(task_id = %receipt.task_id, position = receipt.queue_position, "demo task submitted"),
            Err(e) => warn!(error = %e, "demo task rejected"),
        }
    }
    info!(count, "demo tasks submitted");
}

// ── Audit log ───────────────────────────────────────────────────────

async fn audit_events(mut events: broadcast::Receiver<SchedulerEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => info!(topic = event.topic(), event = %json, "scheduler event"),
                Err(e) => warn!(error = %e, "failed to serialize event"),
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "audit log lagging, events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_filter)),
        )
        .init();

    let config = match SchedulerConfig::from_file(&cli.config) {
        Ok(cfg) => {
            info!(path = %cli.config, "loaded scheduler config");
            cfg
        }
        Err(e) => {
            warn!(
                error = %e,
                path = %cli.config,
                "failed to load config, using defaults"
            );
            SchedulerConfig::from_env()?
        }
    };
    config.log_summary();
    let gpus: Vec<GpuId> = config.registry.gpus.iter().map(|g| g.id).collect();

    let control = Arc::new(ChannelWorkerControl::new());
    let service = Arc::new(SchedulerService::with_system_clock(config, control.clone()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let audit = tokio::spawn(audit_events(service.subscribe()));
    let workers = if cli.simulate_workers {
        spawn_simulated_workers(
            &service,
            &control,
            &gpus,
            Duration::from_millis(cli.job_ms),
            &shutdown_rx,
        )?
    } else {
        Vec::new()
    };
    if cli.demo_tasks > 0 {
        submit_demo_tasks(&service, cli.demo_tasks);
    }

    let loops = tokio::spawn(Arc::clone(&service).run(shutdown_rx));
    info!("mofsim-scheduler running, ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    shutdown_tx.send(true)?;

    loops.await?;
    for handle in workers {
        if let Err(e) = handle.await {
            warn!(error = %e, "simulated worker ended abnormally");
        }
    }
    audit.abort();

    let status = service.status();
    info!(
        queued = status.queue.total,
        placements = status.metrics.placements,
        "mofsim-scheduler exited cleanly"
    );
    Ok(())
}
