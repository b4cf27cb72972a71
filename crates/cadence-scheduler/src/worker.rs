//! Task worker — consumes work queues and runs fired jobs.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::watch;

use crate::broker::{TaskBroker, TaskMessage};
use crate::registry::TargetRegistry;

const ERROR_BACKOFF: Duration = Duration::from_millis(500);
const MAX_PURGE_INTERVAL: Duration = Duration::from_secs(3600);

/// Counters for a worker's lifetime.
#[derive(Debug, Default)]
pub struct WorkerStats {
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
    pub purged: AtomicU64,
}

pub struct TaskWorker {
    broker: Arc<dyn TaskBroker>,
    targets: TargetRegistry,
    queues: Vec<String>,
    concurrency: usize,
    fetch_slice: Duration,
    dead_letter_retention: Option<Duration>,
    stats: Arc<WorkerStats>,
}

impl TaskWorker {
    pub fn new(
        broker: Arc<dyn TaskBroker>,
        targets: TargetRegistry,
        queues: Vec<String>,
        concurrency: usize,
    ) -> Self {
        Self {
            broker,
            targets,
            queues,
            concurrency: concurrency.max(1),
            fetch_slice: Duration::from_millis(500),
            dead_letter_retention: None,
            stats: Arc::new(WorkerStats::default()),
        }
    }

    /// Periodically delete dead letters older than `retention` while running.
    pub fn with_dead_letter_retention(mut self, retention: Duration) -> Self {
        self.dead_letter_retention = Some(retention);
        self
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        self.stats.clone()
    }

    /// Process messages until `shutdown` flips to true. In-flight tasks finish first.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        tracing::info!(
            "👷 Worker started: queues={:?}, concurrency={}, targets={:?}",
            self.queues,
            self.concurrency,
            self.targets.names()
        );
        let janitor = self.dead_letter_retention.map(|retention| {
            tokio::spawn(purge_dead_letters(
                self.broker.clone(),
                retention,
                self.stats.clone(),
                shutdown.clone(),
            ))
        });
        let slots: Vec<_> = (0..self.concurrency)
            .map(|slot| {
                let lane = Lane {
                    broker: self.broker.clone(),
                    targets: self.targets.clone(),
                    queues: self.queues.clone(),
                    fetch_slice: self.fetch_slice,
                    stats: self.stats.clone(),
                };
                tokio::spawn(lane.run(slot, shutdown.clone()))
            })
            .collect();
        futures::future::join_all(slots).await;
        if let Some(janitor) = janitor {
            janitor.await.ok();
        }
        tracing::info!(
            "Worker stopped ({} succeeded, {} failed)",
            self.stats.succeeded.load(Ordering::Relaxed),
            self.stats.failed.load(Ordering::Relaxed)
        );
    }
}

/// Delete old dead letters now and then every `min(retention, 1h)` until shutdown.
async fn purge_dead_letters(
    broker: Arc<dyn TaskBroker>,
    retention: Duration,
    stats: Arc<WorkerStats>,
    mut shutdown: watch::Receiver<bool>,
) {
    let period = retention.clamp(Duration::from_millis(10), MAX_PURGE_INTERVAL);
    let mut ticks = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = ticks.tick() => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }
        match broker.purge_dead(retention).await {
            Ok(0) => {}
            Ok(n) => {
                stats.purged.fetch_add(n as u64, Ordering::Relaxed);
                tracing::info!("🧹 Purged {n} dead letters older than {}s", retention.as_secs());
            }
            Err(e) => tracing::warn!("⚠️ Dead-letter purge failed: {e}"),
        }
    }
}

/// One concurrent processing slot, polling every queue in turn.
struct Lane {
    broker: Arc<dyn TaskBroker>,
    targets: TargetRegistry,
    queues: Vec<String>,
    fetch_slice: Duration,
    stats: Arc<WorkerStats>,
}

impl Lane {
    async fn run(self, slot: usize, mut shutdown: watch::Receiver<bool>) {
        if self.queues.is_empty() {
            return;
        }
        let mut next = slot;
        loop {
            if *shutdown.borrow() {
                break;
            }
            let queue = &self.queues[next % self.queues.len()];
            next = next.wrapping_add(1);
            let fetched = tokio::select! {
                fetched = self.broker.fetch(queue, self.fetch_slice) => fetched,
                _ = shutdown.changed() => break,
            };
            match fetched {
                Ok(Some(message)) => self.process(message).await,
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("⚠️ Queue '{queue}' unavailable: {e}");
                    tokio::select! {
                        _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }
    }

    async fn process(&self, message: TaskMessage) {
        let outcome = if message.failed {
            Err("undecodable payload".to_string())
        } else if let Some(handler) = self.targets.get(&message.target) {
            tracing::debug!("▶️ Running {} ({}) from '{}'", message.target, message.id, message.queue);
            handler.run(&message.args, &message.kwargs).await
        } else {
            Err(format!("unknown target '{}'", message.target))
        };

        let settled = match outcome {
            Ok(()) => {
                self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
                tracing::info!("✅ Task {} ({}) done", message.target, message.id);
                self.broker.ack(&message).await
            }
            Err(reason) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!("❌ Task {} ({}) failed: {reason}", message.target, message.id);
                self.broker.reject(&message, &reason).await
            }
        };
        if let Err(e) = settled {
            tracing::warn!("⚠️ Could not settle message {}: {e}", message.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::registry::FnHandler;
    use serde_json::{Map, Value, json};
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_worker_runs_and_rejects() {
        let broker = Arc::new(MemoryBroker::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut targets = TargetRegistry::new();
        {
            let seen = seen.clone();
            targets.register(
                "record",
                Arc::new(FnHandler(move |args: Vec<Value>, _: Map<String, Value>| {
                    let seen = seen.clone();
                    async move {
                        seen.lock().unwrap().extend(args);
                        Ok(())
                    }
                })),
            );
        }
        targets.register(
            "boom",
            Arc::new(FnHandler(|_: Vec<Value>, _: Map<String, Value>| async {
                Err("exploded".to_string())
            })),
        );

        broker
            .enqueue(TaskMessage::new("default", "record", vec![json!(1)], Map::new()))
            .await
            .unwrap();
        broker
            .enqueue(TaskMessage::new("default", "boom", vec![], Map::new()))
            .await
            .unwrap();
        broker
            .enqueue(TaskMessage::new("default", "ghost", vec![], Map::new()))
            .await
            .unwrap();

        let worker = TaskWorker::new(broker.clone(), targets, vec!["default".into()], 2);
        let stats = worker.stats();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { worker.run(rx).await });

        for _ in 0..200 {
            if broker.pending("default").await.unwrap() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![json!(1)]);
        assert_eq!(stats.succeeded.load(Ordering::Relaxed), 1);
        assert_eq!(stats.failed.load(Ordering::Relaxed), 2);
        let mut reasons: Vec<_> = broker.dead_letters().into_iter().map(|(_, r)| r).collect();
        reasons.sort();
        assert_eq!(reasons, vec!["exploded".to_string(), "unknown target 'ghost'".to_string()]);
    }

    #[tokio::test]
    async fn test_worker_purges_expired_dead_letters() {
        let broker = Arc::new(MemoryBroker::new());
        broker
            .enqueue(TaskMessage::new("default", "ghost", vec![], Map::new()))
            .await
            .unwrap();

        let worker = TaskWorker::new(broker.clone(), TargetRegistry::new(), vec!["default".into()], 1)
            .with_dead_letter_retention(Duration::from_millis(50));
        let stats = worker.stats();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { worker.run(rx).await });

        for _ in 0..300 {
            if stats.purged.load(Ordering::Relaxed) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(stats.failed.load(Ordering::Relaxed), 1);
        assert_eq!(stats.purged.load(Ordering::Relaxed), 1);
        assert!(broker.dead_letters().is_empty());
    }
}
