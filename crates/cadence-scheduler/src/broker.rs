//! Task broker — named queues between the scheduler and the task workers.
//!
//! Delivery is at-least-once: a fetched message stays invisible until it is
//! acked or rejected; the SQLite broker hands it out again once its
//! visibility timeout lapses.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::BrokerError;
use crate::jobs::JobDefinition;

/// Target name carried by wake messages.
pub const WAKE_TARGET: &str = "wakeup-scheduler";

/// The in-memory broker keeps at most this many dead letters, dropping the oldest.
pub const MAX_DEAD_LETTERS: usize = 1000;

/// A unit of work on a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub id: String,
    pub queue: String,
    pub target: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    pub enqueued_at: DateTime<Utc>,
    /// The stored payload could not be decoded; only `id` and `queue` are meaningful.
    #[serde(skip)]
    pub failed: bool,
    /// How many times this message has been handed out, including this one.
    #[serde(skip)]
    pub deliveries: u32,
}

impl TaskMessage {
    pub fn new(queue: &str, target: &str, args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            queue: queue.to_string(),
            target: target.to_string(),
            args,
            kwargs,
            enqueued_at: Utc::now(),
            failed: false,
            deliveries: 0,
        }
    }

    /// The fire event of a scheduled job.
    pub fn for_job(job: &JobDefinition) -> Self {
        let mut message = Self::new(&job.queue, &job.target, job.args.clone(), job.kwargs.clone());
        message
            .kwargs
            .entry("_job_id")
            .or_insert_with(|| Value::String(job.id.clone()));
        message
    }

    /// An empty-payload wake notification.
    pub fn wake(queue: &str) -> Self {
        Self::new(queue, WAKE_TARGET, Vec::new(), Map::new())
    }

    fn poisoned(id: String, queue: String, deliveries: u32) -> Self {
        Self {
            id,
            queue,
            target: String::new(),
            args: Vec::new(),
            kwargs: Map::new(),
            enqueued_at: Utc::now(),
            failed: true,
            deliveries,
        }
    }
}

/// Queue transport shared by dispatch, the wake channel and the workers.
#[async_trait]
pub trait TaskBroker: Send + Sync {
    async fn enqueue(&self, message: TaskMessage) -> Result<(), BrokerError>;

    /// Take the next message from `queue`, waiting up to `timeout`.
    ///
    /// Cancel-safe: dropping the future never loses a message.
    async fn fetch(&self, queue: &str, timeout: Duration) -> Result<Option<TaskMessage>, BrokerError>;

    /// Processing finished; the message is gone for good.
    async fn ack(&self, message: &TaskMessage) -> Result<(), BrokerError>;

    /// Processing failed; park the message as dead with a reason.
    async fn reject(&self, message: &TaskMessage, reason: &str) -> Result<(), BrokerError>;

    /// Messages waiting or in flight on `queue`.
    async fn pending(&self, queue: &str) -> Result<usize, BrokerError>;

    /// Delete dead letters rejected more than `older_than` ago. Returns how many went.
    async fn purge_dead(&self, older_than: Duration) -> Result<usize, BrokerError>;
}

fn cutoff(older_than: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(older_than)
        .ok()
        .and_then(|age| Utc::now().checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

// ─── In-memory broker ──────────────────────────────────────

struct DeadLetter {
    message: TaskMessage,
    reason: String,
    rejected_at: DateTime<Utc>,
}

#[derive(Default)]
struct MemoryQueues {
    ready: HashMap<String, VecDeque<TaskMessage>>,
    in_flight: HashMap<String, TaskMessage>,
    dead: VecDeque<DeadLetter>,
}

/// In-process broker. Wake messages cannot leave the process.
#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<MemoryQueues>,
    arrivals: Notify,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryQueues>, BrokerError> {
        self.state
            .lock()
            .map_err(|e| BrokerError::Unavailable(format!("broker lock poisoned: {e}")))
    }

    fn try_pop(&self, queue: &str) -> Result<Option<TaskMessage>, BrokerError> {
        let mut state = self.lock()?;
        let Some(mut message) = state.ready.get_mut(queue).and_then(|q| q.pop_front()) else {
            return Ok(None);
        };
        message.deliveries += 1;
        state.in_flight.insert(message.id.clone(), message.clone());
        Ok(Some(message))
    }

    /// Rejected messages with their reasons, oldest first.
    pub fn dead_letters(&self) -> Vec<(TaskMessage, String)> {
        self.lock()
            .map(|s| {
                s.dead
                    .iter()
                    .map(|d| (d.message.clone(), d.reason.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Put a message on a queue as-is (including its `failed` flag).
    pub fn push_raw(&self, message: TaskMessage) -> Result<(), BrokerError> {
        self.lock()?
            .ready
            .entry(message.queue.clone())
            .or_default()
            .push_back(message);
        self.arrivals.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl TaskBroker for MemoryBroker {
    async fn enqueue(&self, message: TaskMessage) -> Result<(), BrokerError> {
        self.push_raw(message)
    }

    async fn fetch(&self, queue: &str, timeout: Duration) -> Result<Option<TaskMessage>, BrokerError> {
        let deadline = Instant::now() + timeout;
        loop {
            let arrived = self.arrivals.notified();
            tokio::pin!(arrived);
            // Register before checking so an enqueue in between is not missed.
            arrived.as_mut().enable();
            if let Some(message) = self.try_pop(queue)? {
                return Ok(Some(message));
            }
            if tokio::time::timeout_at(deadline, arrived).await.is_err() {
                return self.try_pop(queue);
            }
        }
    }

    async fn ack(&self, message: &TaskMessage) -> Result<(), BrokerError> {
        self.lock()?.in_flight.remove(&message.id);
        Ok(())
    }

    async fn reject(&self, message: &TaskMessage, reason: &str) -> Result<(), BrokerError> {
        let mut state = self.lock()?;
        let message = state.in_flight.remove(&message.id).unwrap_or_else(|| message.clone());
        if state.dead.len() >= MAX_DEAD_LETTERS {
            state.dead.pop_front();
        }
        state.dead.push_back(DeadLetter {
            message,
            reason: reason.to_string(),
            rejected_at: Utc::now(),
        });
        Ok(())
    }

    async fn pending(&self, queue: &str) -> Result<usize, BrokerError> {
        let state = self.lock()?;
        let ready = state.ready.get(queue).map_or(0, VecDeque::len);
        let in_flight = state.in_flight.values().filter(|m| m.queue == queue).count();
        Ok(ready + in_flight)
    }

    async fn purge_dead(&self, older_than: Duration) -> Result<usize, BrokerError> {
        let cutoff = cutoff(older_than);
        let mut state = self.lock()?;
        let before = state.dead.len();
        state.dead.retain(|d| d.rejected_at > cutoff);
        Ok(before - state.dead.len())
    }
}

// ─── SQLite broker ─────────────────────────────────────────

/// Durable broker on a SQLite file, shared by every process on the host.
/// Consumers poll the queue table on `poll_interval`.
pub struct SqliteBroker {
    conn: Mutex<Connection>,
    poll_interval: Duration,
    visibility_timeout: Duration,
    consumer_id: String,
}

impl SqliteBroker {
    pub fn open(
        path: &Path,
        poll_interval: Duration,
        visibility_timeout: Duration,
    ) -> Result<Self, BrokerError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| BrokerError::Unavailable(format!("create {}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS task_messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                queue TEXT NOT NULL,
                payload TEXT NOT NULL,            -- JSON TaskMessage
                enqueued_at TEXT NOT NULL,
                invisible_until_ms INTEGER,       -- set while a consumer holds it
                claimed_by TEXT,
                deliveries INTEGER NOT NULL DEFAULT 0,
                dead INTEGER NOT NULL DEFAULT 0,
                error TEXT,
                dead_at_ms INTEGER                -- set by reject
            );
            CREATE INDEX IF NOT EXISTS idx_task_messages_queue
                ON task_messages(queue, dead, seq);
            ",
        )?;
        // Files created before dead letters carried a timestamp.
        let has_dead_at: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM pragma_table_info('task_messages') WHERE name = 'dead_at_ms'",
            [],
            |r| r.get(0),
        )?;
        if !has_dead_at {
            conn.execute_batch("ALTER TABLE task_messages ADD COLUMN dead_at_ms INTEGER")?;
        }
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".into());
        Ok(Self {
            conn: Mutex::new(conn),
            poll_interval,
            visibility_timeout,
            consumer_id: format!("{host}:{}", std::process::id()),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, BrokerError> {
        self.conn
            .lock()
            .map_err(|e| BrokerError::Unavailable(format!("broker lock poisoned: {e}")))
    }

    fn try_claim(&self, queue: &str) -> Result<Option<TaskMessage>, BrokerError> {
        let now_ms = Utc::now().timestamp_millis();
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let row: Option<(i64, String, String, u32)> = tx
            .query_row(
                "SELECT seq, id, payload, deliveries FROM task_messages
                 WHERE queue = ?1 AND dead = 0
                   AND (invisible_until_ms IS NULL OR invisible_until_ms <= ?2)
                 ORDER BY seq LIMIT 1",
                params![queue, now_ms],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .optional()?;
        let Some((seq, id, payload, deliveries)) = row else {
            return Ok(None);
        };
        let deliveries = deliveries + 1;
        tx.execute(
            "UPDATE task_messages
             SET invisible_until_ms = ?2, claimed_by = ?3, deliveries = ?4
             WHERE seq = ?1",
            params![
                seq,
                now_ms + self.visibility_timeout.as_millis() as i64,
                self.consumer_id,
                deliveries
            ],
        )?;
        tx.commit()?;

        let message = match serde_json::from_str::<TaskMessage>(&payload) {
            Ok(mut message) => {
                message.id = id;
                message.deliveries = deliveries;
                message
            }
            Err(e) => {
                tracing::debug!("Undecodable message {id} on '{queue}': {e}");
                TaskMessage::poisoned(id, queue.to_string(), deliveries)
            }
        };
        Ok(Some(message))
    }
}

#[async_trait]
impl TaskBroker for SqliteBroker {
    async fn enqueue(&self, message: TaskMessage) -> Result<(), BrokerError> {
        let payload = serde_json::to_string(&message)?;
        self.lock()?.execute(
            "INSERT INTO task_messages (id, queue, payload, enqueued_at) VALUES (?1, ?2, ?3, ?4)",
            params![message.id, message.queue, payload, message.enqueued_at.to_rfc3339()],
        )?;
        Ok(())
    }

    async fn fetch(&self, queue: &str, timeout: Duration) -> Result<Option<TaskMessage>, BrokerError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(message) = self.try_claim(queue)? {
                return Ok(Some(message));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn ack(&self, message: &TaskMessage) -> Result<(), BrokerError> {
        self.lock()?
            .execute("DELETE FROM task_messages WHERE id = ?1", [&message.id])?;
        Ok(())
    }

    async fn reject(&self, message: &TaskMessage, reason: &str) -> Result<(), BrokerError> {
        self.lock()?.execute(
            "UPDATE task_messages
             SET dead = 1, invisible_until_ms = NULL, error = ?2, dead_at_ms = ?3
             WHERE id = ?1",
            params![message.id, reason, Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    async fn pending(&self, queue: &str) -> Result<usize, BrokerError> {
        let count: i64 = self.lock()?.query_row(
            "SELECT COUNT(*) FROM task_messages WHERE queue = ?1 AND dead = 0",
            [queue],
            |r| r.get(0),
        )?;
        Ok(count as usize)
    }

    async fn purge_dead(&self, older_than: Duration) -> Result<usize, BrokerError> {
        // Rows without a timestamp predate it and count as old.
        let purged = self.lock()?.execute(
            "DELETE FROM task_messages
             WHERE dead = 1 AND (dead_at_ms IS NULL OR dead_at_ms <= ?1)",
            [cutoff(older_than).timestamp_millis()],
        )?;
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn temp_db(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("cadence-broker-{name}-{}", uuid::Uuid::new_v4().simple()))
            .join("broker.db")
    }

    #[tokio::test]
    async fn test_memory_fetch_ack() {
        let broker = MemoryBroker::new();
        broker
            .enqueue(TaskMessage::new("default", "log", vec![], Map::new()))
            .await
            .unwrap();
        assert_eq!(broker.pending("default").await.unwrap(), 1);
        let message = broker
            .fetch("default", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.deliveries, 1);
        assert!(
            broker
                .fetch("default", Duration::from_millis(10))
                .await
                .unwrap()
                .is_none()
        );
        broker.ack(&message).await.unwrap();
        assert_eq!(broker.pending("default").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_memory_fetch_wakes_on_enqueue() {
        let broker = Arc::new(MemoryBroker::new());
        let consumer = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.fetch("scheduler", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let started = std::time::Instant::now();
        broker.enqueue(TaskMessage::wake("scheduler")).await.unwrap();
        let message = consumer.await.unwrap().unwrap().unwrap();
        assert_eq!(message.target, WAKE_TARGET);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_memory_reject_goes_to_dead_letters() {
        let broker = MemoryBroker::new();
        broker
            .enqueue(TaskMessage::new("default", "nope", vec![], Map::new()))
            .await
            .unwrap();
        let message = broker
            .fetch("default", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        broker.reject(&message, "unknown target").await.unwrap();
        let dead = broker.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].1, "unknown target");
        assert_eq!(broker.pending("default").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_memory_dead_letters_are_bounded_and_purged() {
        let broker = MemoryBroker::new();
        for i in 0..MAX_DEAD_LETTERS + 5 {
            let message = TaskMessage::new("default", &format!("t{i}"), vec![], Map::new());
            broker.reject(&message, "failed").await.unwrap();
        }
        let dead = broker.dead_letters();
        assert_eq!(dead.len(), MAX_DEAD_LETTERS);
        assert_eq!(dead[0].0.target, "t5");

        assert_eq!(broker.purge_dead(Duration::from_secs(3600)).await.unwrap(), 0);
        assert_eq!(broker.purge_dead(Duration::ZERO).await.unwrap(), MAX_DEAD_LETTERS);
        assert!(broker.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn test_sqlite_purge_dead_keeps_recent_and_live() {
        let path = temp_db("purge");
        let broker = SqliteBroker::open(&path, Duration::from_millis(10), Duration::from_secs(30)).unwrap();
        for target in ["old", "recent", "live"] {
            broker
                .enqueue(TaskMessage::new("default", target, vec![], Map::new()))
                .await
                .unwrap();
        }
        let old = broker.fetch("default", Duration::from_millis(50)).await.unwrap().unwrap();
        let recent = broker.fetch("default", Duration::from_millis(50)).await.unwrap().unwrap();
        broker.reject(&old, "failed").await.unwrap();
        broker.reject(&recent, "failed").await.unwrap();
        broker
            .lock()
            .unwrap()
            .execute(
                "UPDATE task_messages SET dead_at_ms = dead_at_ms - 7200000 WHERE id = ?1",
                [&old.id],
            )
            .unwrap();

        assert_eq!(broker.purge_dead(Duration::from_secs(3600)).await.unwrap(), 1);
        let dead: i64 = broker
            .lock()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM task_messages WHERE dead = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(dead, 1);
        assert_eq!(broker.pending("default").await.unwrap(), 1);
        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[tokio::test]
    async fn test_sqlite_roundtrip_between_connections() {
        let path = temp_db("roundtrip");
        let producer = SqliteBroker::open(&path, Duration::from_millis(10), Duration::from_secs(30)).unwrap();
        let consumer = SqliteBroker::open(&path, Duration::from_millis(10), Duration::from_secs(30)).unwrap();

        let job = JobDefinition::interval("report", "log", 60).on_queue("reports");
        producer.enqueue(TaskMessage::for_job(&job)).await.unwrap();

        assert!(consumer.fetch("default", Duration::from_millis(20)).await.unwrap().is_none());
        let message = consumer
            .fetch("reports", Duration::from_millis(200))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.target, "log");
        assert_eq!(message.kwargs["_job_id"], "report");
        assert!(!message.failed);
        consumer.ack(&message).await.unwrap();
        assert_eq!(producer.pending("reports").await.unwrap(), 0);
        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[tokio::test]
    async fn test_sqlite_redelivers_after_visibility_timeout() {
        let path = temp_db("redeliver");
        let broker = SqliteBroker::open(&path, Duration::from_millis(10), Duration::from_millis(50)).unwrap();
        broker.enqueue(TaskMessage::wake("scheduler")).await.unwrap();

        let first = broker.fetch("scheduler", Duration::from_millis(100)).await.unwrap().unwrap();
        assert!(broker.fetch("scheduler", Duration::ZERO).await.unwrap().is_none());
        tokio::time::sleep(Duration::from_millis(80)).await;
        let second = broker.fetch("scheduler", Duration::from_millis(100)).await.unwrap().unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.deliveries, 2);
        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[tokio::test]
    async fn test_sqlite_undecodable_payload_is_flagged() {
        let path = temp_db("poison");
        let broker = SqliteBroker::open(&path, Duration::from_millis(10), Duration::from_secs(30)).unwrap();
        broker
            .lock()
            .unwrap()
            .execute(
                "INSERT INTO task_messages (id, queue, payload, enqueued_at)
                 VALUES ('bad-1', 'scheduler', '{oops', '2026-01-01T00:00:00Z')",
                [],
            )
            .unwrap();
        let message = broker.fetch("scheduler", Duration::from_millis(50)).await.unwrap().unwrap();
        assert!(message.failed);
        assert_eq!(message.id, "bad-1");
        broker.reject(&message, "poisoned").await.unwrap();
        assert_eq!(broker.pending("scheduler").await.unwrap(), 0);
        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }
}
