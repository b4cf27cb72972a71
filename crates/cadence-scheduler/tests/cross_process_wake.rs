//! A passive engine and an active engine sharing one job store and one broker
//! file, the way a CLI process and the scheduler process do on a host.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use cadence_scheduler::{
    EngineConfig, FnHandler, JobDefinition, QueueDispatch, SchedulerEngine, SqliteBroker,
    SqliteJobStore, TargetRegistry, TaskBroker, TaskWorker, WakeConsumer,
};
use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};

fn temp_dir(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("cadence-it-{name}-{}", uuid::Uuid::new_v4().simple()))
}

fn open_store(dir: &std::path::Path) -> Arc<SqliteJobStore> {
    Arc::new(SqliteJobStore::open(&dir.join("jobs.db"), Duration::from_secs(5)).unwrap())
}

fn open_broker(dir: &std::path::Path) -> Arc<SqliteBroker> {
    Arc::new(
        SqliteBroker::open(
            &dir.join("broker.db"),
            Duration::from_millis(20),
            Duration::from_secs(30),
        )
        .unwrap(),
    )
}

fn config() -> EngineConfig {
    EngineConfig {
        // Long idle cap: only a delivered wake can make the job fire in time.
        max_idle: Duration::from_secs(60),
        ..EngineConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_passive_add_wakes_active_loop_and_job_runs() {
    let dir = temp_dir("wake");

    // Worker side: records every job id it runs.
    let (ran_tx, mut ran_rx) = mpsc::unbounded_channel::<String>();
    let mut targets = TargetRegistry::new();
    targets.register(
        "record",
        Arc::new(FnHandler(move |_: Vec<Value>, kwargs: Map<String, Value>| {
            let ran_tx = ran_tx.clone();
            async move {
                let id = kwargs.get("_job_id").and_then(Value::as_str).unwrap_or("?");
                ran_tx.send(id.to_string()).map_err(|e| e.to_string())
            }
        })),
    );

    // Active process.
    let active_broker: Arc<dyn TaskBroker> = open_broker(&dir);
    let active = Arc::new(SchedulerEngine::active(
        open_store(&dir),
        Arc::new(QueueDispatch::new(active_broker.clone(), targets.clone())),
        config(),
    ));
    let consumer = WakeConsumer::start(
        active_broker.clone(),
        "scheduler",
        1,
        active.wake_callback().unwrap(),
    )
    .unwrap();
    active.start();
    let loop_handle = {
        let active = active.clone();
        tokio::spawn(async move { active.run().await })
    };
    let worker = TaskWorker::new(active_broker.clone(), targets, vec!["default".into()], 1);
    let (stop_tx, stop_rx) = watch::channel(false);
    let worker_handle = tokio::spawn(async move { worker.run(stop_rx).await });

    // Let the active loop settle into its idle sleep.
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Passive process with its own connections.
    let passive = SchedulerEngine::passive(open_store(&dir), open_broker(&dir), "scheduler", config());
    passive.start();
    let due = Utc::now() + chrono::Duration::milliseconds(300);
    passive
        .add_job(JobDefinition::once("from-cli", "record", due))
        .await
        .unwrap();

    let ran = tokio::time::timeout(Duration::from_secs(10), ran_rx.recv())
        .await
        .expect("job did not run before the idle cap")
        .unwrap();
    assert_eq!(ran, "from-cli");
    assert!(Utc::now() >= due);
    assert_eq!(active.stats().fired, 1);
    assert!(active.stats().wakes_received >= 1);
    assert!(passive.get_job("from-cli").await.unwrap().is_none());

    stop_tx.send(true).unwrap();
    active.shutdown();
    consumer.stop().await;
    loop_handle.await.unwrap().unwrap();
    worker_handle.await.unwrap();
    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_passive_mutations_survive_without_active_process() {
    let dir = temp_dir("offline");
    let passive = SchedulerEngine::passive(open_store(&dir), open_broker(&dir), "scheduler", config());
    passive.start();
    passive
        .add_job(JobDefinition::interval("hourly", "record", 3600))
        .await
        .unwrap();
    passive.pause_job("hourly").await.unwrap();

    // A later process sees the paused job and the queued wake messages.
    let store = open_store(&dir);
    let broker = open_broker(&dir);
    let reopened = SchedulerEngine::passive(store, broker.clone(), "scheduler", config());
    let job = reopened.get_job("hourly").await.unwrap().unwrap();
    assert!(job.is_paused());
    assert_eq!(broker.pending("scheduler").await.unwrap(), 2);
    std::fs::remove_dir_all(&dir).ok();
}
