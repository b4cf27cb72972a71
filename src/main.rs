//! # Cadence CLI
//!
//! Persistent job scheduler with a single active timing loop.
//!
//! Usage:
//!   cadence run-scheduler                          # The one active scheduler process
//!   cadence worker --queues default,reports        # Run fired jobs
//!   cadence jobs add log --every 60                # Schedule a job (wakes the scheduler)
//!   cadence jobs add webhook --cron "0 8 * * *" --kwargs '{"url":"https://..."}'
//!   cadence jobs list                              # Show every job and its next fire time

mod targets;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use cadence_core::CadenceConfig;
use cadence_core::config::BrokerKind;
use cadence_scheduler::{
    EngineConfig, JobDefinition, JobUpdate, MemoryBroker, QueueDispatch, SchedulerEngine,
    SqliteBroker, SqliteJobStore, TaskBroker, TaskWorker, Trigger, WakeConsumer,
};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "cadence",
    version,
    about = "⏰ Cadence — persistent job scheduler with cross-process wake-ups"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the active scheduler (exactly one per deployment)
    RunScheduler {
        /// Also run a task worker inside this process
        #[arg(long)]
        with_worker: bool,
    },

    /// Run a task worker on the configured work queues
    Worker {
        /// Queues to consume (comma separated); defaults to worker.queues
        #[arg(short, long, value_delimiter = ',')]
        queues: Vec<String>,

        /// Concurrent tasks; defaults to worker.concurrency
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Manage scheduled jobs
    Jobs {
        #[command(subcommand)]
        action: JobsAction,
    },
}

#[derive(Subcommand)]
enum JobsAction {
    /// Schedule a new job
    Add {
        /// Task target to run
        target: String,

        /// Job ID (generated when omitted)
        #[arg(long)]
        id: Option<String>,

        #[command(flatten)]
        schedule: ScheduleArgs,

        #[command(flatten)]
        payload: PayloadArgs,
    },
    /// Change an existing job
    Update {
        id: String,

        /// New task target
        #[arg(long)]
        target: Option<String>,

        #[command(flatten)]
        schedule: ScheduleArgs,

        #[command(flatten)]
        payload: PayloadArgs,
    },
    /// List all jobs
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Show one job
    Show { id: String },
    /// Delete a job
    Remove { id: String },
    /// Stop a job from firing until resumed
    Pause { id: String },
    /// Resume a paused job
    Resume { id: String },
}

#[derive(Args)]
struct ScheduleArgs {
    /// Cron expression (5 fields, UTC)
    #[arg(long, conflicts_with_all = ["every", "at"])]
    cron: Option<String>,

    /// Interval in seconds
    #[arg(long, conflicts_with = "at")]
    every: Option<u64>,

    /// Fire once at this RFC 3339 instant
    #[arg(long)]
    at: Option<DateTime<Utc>>,

    /// First fire instant (RFC 3339), overriding the trigger's own
    #[arg(long)]
    start_at: Option<DateTime<Utc>>,
}

impl ScheduleArgs {
    fn trigger(&self) -> Option<Trigger> {
        if let Some(expression) = &self.cron {
            Some(Trigger::Cron { expression: expression.clone() })
        } else if let Some(every_secs) = self.every {
            Some(Trigger::Interval { every_secs })
        } else {
            self.at.map(|at| Trigger::Once { at })
        }
    }
}

#[derive(Args)]
struct PayloadArgs {
    /// Work queue the job is enqueued on
    #[arg(long)]
    queue: Option<String>,

    /// Positional arguments as a JSON array
    #[arg(long)]
    args: Option<String>,

    /// Keyword arguments as a JSON object
    #[arg(long)]
    kwargs: Option<String>,

    /// Misfire grace period in seconds
    #[arg(long)]
    grace: Option<u64>,
}

impl PayloadArgs {
    fn args(&self) -> Result<Option<Vec<Value>>> {
        self.args
            .as_deref()
            .map(|raw| serde_json::from_str(raw).context("--args must be a JSON array"))
            .transpose()
    }

    fn kwargs(&self) -> Result<Option<Map<String, Value>>> {
        self.kwargs
            .as_deref()
            .map(|raw| serde_json::from_str(raw).context("--kwargs must be a JSON object"))
            .transpose()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "cadence=debug,cadence_scheduler=debug,cadence_core=debug"
    } else {
        "cadence=info,cadence_scheduler=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    // Load config
    let config = if let Some(path) = &cli.config {
        CadenceConfig::load_from(&cadence_core::config::expand_path(path))?
    } else {
        CadenceConfig::load()?
    };

    match cli.command {
        Commands::RunScheduler { with_worker } => run_scheduler(&config, with_worker).await,
        Commands::Worker { queues, concurrency } => run_worker(&config, queues, concurrency).await,
        Commands::Jobs { action } => run_jobs(&config, action).await,
    }
}

fn open_store(config: &CadenceConfig) -> Result<Arc<SqliteJobStore>> {
    let path = config.store.resolved_path();
    let store = SqliteJobStore::open(&path, config.store.busy_timeout())
        .with_context(|| format!("opening job store {}", path.display()))?;
    Ok(Arc::new(store))
}

fn open_broker(config: &CadenceConfig) -> Result<Arc<dyn TaskBroker>> {
    Ok(match config.broker.kind {
        BrokerKind::Memory => Arc::new(MemoryBroker::new()),
        BrokerKind::Sqlite => {
            let path = config.broker.resolved_path();
            let broker = SqliteBroker::open(
                &path,
                config.broker.poll_interval(),
                config.broker.visibility_timeout(),
            )
            .with_context(|| format!("opening broker {}", path.display()))?;
            Arc::new(broker)
        }
    })
}

/// Register every schedule declared in the config file.
async fn register_static_schedules(engine: &SchedulerEngine, config: &CadenceConfig) -> Result<()> {
    for schedule in &config.schedules {
        let job = JobDefinition::from_static(schedule)?;
        engine.register_static(job).await?;
    }
    if !config.schedules.is_empty() {
        tracing::info!("📋 {} static schedule(s) registered", config.schedules.len());
    }
    Ok(())
}

async fn run_scheduler(config: &CadenceConfig, with_worker: bool) -> Result<()> {
    let store = open_store(config)?;
    let broker = open_broker(config)?;
    let targets = targets::builtin_targets();
    let bridge = Arc::new(QueueDispatch::new(broker.clone(), targets.clone()));
    let engine = Arc::new(SchedulerEngine::active(
        store,
        bridge,
        EngineConfig::from(&config.scheduler),
    ));
    engine.start();
    register_static_schedules(&engine, config).await?;

    if config.broker.kind == BrokerKind::Memory {
        tracing::warn!("⚠️ Memory broker: only this process can wake the scheduler or run its jobs");
    }

    let wake_queue = &config.scheduler.wake_queue;
    let consumer = WakeConsumer::start(
        broker.clone(),
        wake_queue.clone(),
        config.scheduler.wake_consumer_threads,
        engine.wake_callback()?,
    )?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let worker_handle = with_worker.then(|| {
        let worker = with_retention(
            TaskWorker::new(
                broker.clone(),
                targets,
                config.worker.queues.clone(),
                config.worker.concurrency,
            ),
            config,
        );
        tokio::spawn(async move { worker.run(stop_rx).await })
    });

    println!("⏰ Cadence scheduler v{}", env!("CARGO_PKG_VERSION"));
    println!("   🗄️  Job store:   {}", config.store.resolved_path().display());
    println!("   📨 Wake queue:  {wake_queue} ({:?} broker)", config.broker.kind);
    println!("   💤 Idle cap:    {}s", config.scheduler.max_idle_secs);
    if with_worker {
        println!("   👷 Worker:      {:?}", config.worker.queues);
    }
    println!();

    let mut loop_handle = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run().await })
    };
    let finished = tokio::select! {
        joined = &mut loop_handle => Some(joined),
        signal = tokio::signal::ctrl_c() => {
            signal?;
            None
        }
    };
    let outcome = match finished {
        Some(joined) => joined,
        None => {
            tracing::info!("🛑 Ctrl-C received, shutting down");
            engine.shutdown();
            loop_handle.await
        }
    };

    let _ = stop_tx.send(true);
    consumer.stop().await;
    if let Some(handle) = worker_handle {
        handle.await.ok();
    }

    let stats = engine.stats();
    tracing::info!(
        "📊 fired={} misfired={} dispatch_failures={} store_retries={}",
        stats.fired,
        stats.misfired,
        stats.dispatch_failures,
        stats.store_retries
    );
    outcome.context("scheduler loop panicked")??;
    Ok(())
}

fn with_retention(worker: TaskWorker, config: &CadenceConfig) -> TaskWorker {
    match config.worker.dead_letter_retention_secs {
        0 => worker,
        secs => worker.with_dead_letter_retention(Duration::from_secs(secs)),
    }
}

async fn run_worker(config: &CadenceConfig, queues: Vec<String>, concurrency: Option<usize>) -> Result<()> {
    let queues = if queues.is_empty() { config.worker.queues.clone() } else { queues };
    if queues.contains(&config.scheduler.wake_queue) {
        bail!("queue '{}' is reserved for scheduler wake-ups", config.scheduler.wake_queue);
    }
    if config.broker.kind == BrokerKind::Memory {
        tracing::warn!("⚠️ Memory broker: this worker only sees jobs fired in its own process");
    }

    let broker = open_broker(config)?;
    let engine = SchedulerEngine::passive(
        open_store(config)?,
        broker.clone(),
        config.scheduler.wake_queue.clone(),
        EngineConfig::from(&config.scheduler),
    );
    engine.start();
    register_static_schedules(&engine, config).await?;

    let worker = with_retention(
        TaskWorker::new(
            broker,
            targets::builtin_targets(),
            queues,
            concurrency.unwrap_or(config.worker.concurrency),
        ),
        config,
    );
    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { worker.run(stop_rx).await });

    tokio::signal::ctrl_c().await?;
    tracing::info!("🛑 Ctrl-C received, finishing in-flight tasks");
    let _ = stop_tx.send(true);
    handle.await?;
    engine.shutdown();
    Ok(())
}

async fn run_jobs(config: &CadenceConfig, action: JobsAction) -> Result<()> {
    let engine = SchedulerEngine::passive(
        open_store(config)?,
        open_broker(config)?,
        config.scheduler.wake_queue.clone(),
        EngineConfig::from(&config.scheduler),
    );
    engine.start();

    match action {
        JobsAction::Add { target, id, schedule, payload } => {
            let Some(trigger) = schedule.trigger() else {
                bail!("one of --cron, --every or --at is required");
            };
            let id = id.unwrap_or_else(cadence_scheduler::jobs::new_job_id);
            let mut job = JobDefinition::new(id, target, trigger);
            if let Some(start) = schedule.start_at {
                job = job.starting_at(start);
            }
            if let Some(queue) = &payload.queue {
                job = job.on_queue(queue);
            }
            if let Some(args) = payload.args()? {
                job = job.with_args(args);
            }
            if let Some(kwargs) = payload.kwargs()? {
                job = job.with_kwargs(kwargs);
            }
            if payload.grace.is_some() {
                job = job.with_misfire_grace(payload.grace);
            }
            let job = engine.add_job(job).await?;
            println!("✅ Job '{}' scheduled, next fire {}", job.id, fmt_time(job.next_fire_time));
        }
        JobsAction::Update { id, target, schedule, payload } => {
            let update = JobUpdate {
                trigger: schedule.trigger(),
                target,
                queue: payload.queue.clone(),
                args: payload.args()?,
                kwargs: payload.kwargs()?,
                next_fire_time: schedule.start_at.map(Some),
                misfire_grace_secs: payload.grace.map(Some),
            };
            if update.is_empty() {
                bail!("nothing to update");
            }
            let job = engine.update_job(&id, update).await?;
            println!("✏️ Job '{}' updated, next fire {}", job.id, fmt_time(job.next_fire_time));
        }
        JobsAction::List { json } => {
            let jobs = engine.list_jobs().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&jobs)?);
            } else if jobs.is_empty() {
                println!("No jobs scheduled.");
            } else {
                println!("{:<28} {:<24} {:<22} NEXT FIRE", "ID", "TRIGGER", "TARGET");
                for job in &jobs {
                    println!(
                        "{:<28} {:<24} {:<22} {}",
                        job.id,
                        job.trigger.describe(),
                        format!("{}@{}", job.target, job.queue),
                        fmt_time(job.next_fire_time)
                    );
                }
            }
        }
        JobsAction::Show { id } => match engine.get_job(&id).await? {
            Some(job) => println!("{}", serde_json::to_string_pretty(&job)?),
            None => bail!("job '{id}' not found"),
        },
        JobsAction::Remove { id } => {
            engine.remove_job(&id).await?;
            println!("🗑️ Job '{id}' removed");
        }
        JobsAction::Pause { id } => {
            engine.pause_job(&id).await?;
            println!("⏸️ Job '{id}' paused");
        }
        JobsAction::Resume { id } => {
            let job = engine.resume_job(&id).await?;
            println!("▶️ Job '{id}' resumed, next fire {}", fmt_time(job.next_fire_time));
        }
    }

    engine.shutdown();
    Ok(())
}

fn fmt_time(t: Option<DateTime<Utc>>) -> String {
    t.map(|t| t.to_rfc3339()).unwrap_or_else(|| "paused".into())
}
