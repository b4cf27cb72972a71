//! SQLite-backed job store — survives restarts, shared by every process on the host.
//!
//! Mutations run inside `BEGIN IMMEDIATE` transactions so two processes
//! claiming at the same time serialize on the database write lock. Every
//! call runs on the blocking pool, since waiting on that lock can take up
//! to the busy timeout.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};

use crate::error::StoreError;
use crate::jobs::{ClaimedJob, JobDefinition, JobUpdate, Trigger};
use crate::store::JobStore;

const JOB_COLUMNS: &str = "seq, id, trigger_data, target, queue, args, kwargs, next_fire_ms, misfire_grace_secs, created_at";

/// SQLite-backed persistence for scheduled jobs.
pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteJobStore {
    /// Open or create the job database.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Unavailable(format!("create {}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        // WAL lets readers in other processes proceed while one claims.
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.migrate()?;
        tracing::debug!("💾 Job store opened at {}", path.display());
        Ok(store)
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<(), StoreError> {
        self.lock()?.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS scheduler_jobs (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                trigger_type TEXT NOT NULL,       -- 'once', 'interval', 'cron'
                trigger_data TEXT NOT NULL,       -- JSON, tagged by type
                target TEXT NOT NULL,
                queue TEXT NOT NULL,
                args TEXT NOT NULL DEFAULT '[]',
                kwargs TEXT NOT NULL DEFAULT '{}',
                next_fire_ms INTEGER,             -- NULL while paused
                misfire_grace_secs INTEGER,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_scheduler_jobs_next
                ON scheduler_jobs(next_fire_ms);
            ",
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        lock_conn(&self.conn)
    }

    /// Run `f` against the connection on a blocking thread.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || f(&mut *lock_conn(&conn)?))
            .await
            .map_err(|e| StoreError::Unavailable(format!("job store task failed: {e}")))?
    }
}

fn lock_conn(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>, StoreError> {
    conn.lock()
        .map_err(|e| StoreError::Unavailable(format!("job store lock poisoned: {e}")))
}

/// A row that may fail to decode; the id and seq are always readable.
struct StoredRow {
    seq: i64,
    id: String,
    job: Result<JobDefinition, String>,
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredRow> {
    let seq: i64 = row.get(0)?;
    let id: String = row.get(1)?;
    let trigger_data: String = row.get(2)?;
    let target: String = row.get(3)?;
    let queue: String = row.get(4)?;
    let args: String = row.get(5)?;
    let kwargs: String = row.get(6)?;
    let next_fire_ms: Option<i64> = row.get(7)?;
    let misfire_grace_secs: Option<i64> = row.get(8)?;
    let created_at: String = row.get(9)?;

    let job = (|| -> Result<JobDefinition, String> {
        let trigger: Trigger =
            serde_json::from_str(&trigger_data).map_err(|e| format!("trigger: {e}"))?;
        let args = serde_json::from_str(&args).map_err(|e| format!("args: {e}"))?;
        let kwargs = serde_json::from_str(&kwargs).map_err(|e| format!("kwargs: {e}"))?;
        let next_fire_time = match next_fire_ms {
            Some(ms) => Some(
                DateTime::<Utc>::from_timestamp_millis(ms)
                    .ok_or_else(|| format!("next_fire_ms out of range: {ms}"))?,
            ),
            None => None,
        };
        let created_at = DateTime::parse_from_rfc3339(&created_at)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| format!("created_at: {e}"))?;
        Ok(JobDefinition {
            id: id.clone(),
            trigger,
            target,
            queue,
            args,
            kwargs,
            next_fire_time,
            misfire_grace_secs: misfire_grace_secs.map(|g| g.max(0) as u64),
            created_at,
        })
    })();

    Ok(StoredRow { seq, id, job })
}

fn trigger_type(trigger: &Trigger) -> &'static str {
    match trigger {
        Trigger::Once { .. } => "once",
        Trigger::Interval { .. } => "interval",
        Trigger::Cron { .. } => "cron",
    }
}

fn encode(job: &JobDefinition) -> Result<(String, String, String), StoreError> {
    let enc = |e: serde_json::Error| StoreError::InvalidTrigger(format!("encode job '{}': {e}", job.id));
    Ok((
        serde_json::to_string(&job.trigger).map_err(enc)?,
        serde_json::to_string(&job.args).map_err(enc)?,
        serde_json::to_string(&job.kwargs).map_err(enc)?,
    ))
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Write every mutable column of `job` back to its row.
fn write_back(conn: &Connection, job: &JobDefinition) -> Result<(), StoreError> {
    let (trigger_data, args, kwargs) = encode(job)?;
    conn.execute(
        "UPDATE scheduler_jobs
         SET trigger_type = ?2, trigger_data = ?3, target = ?4, queue = ?5, args = ?6,
             kwargs = ?7, next_fire_ms = ?8, misfire_grace_secs = ?9
         WHERE id = ?1",
        params![
            job.id,
            trigger_type(&job.trigger),
            trigger_data,
            job.target,
            job.queue,
            args,
            kwargs,
            job.next_fire_time.map(|t| t.timestamp_millis()),
            job.misfire_grace_secs.map(|g| g as i64),
        ],
    )?;
    Ok(())
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn add(&self, job: JobDefinition) -> Result<(), StoreError> {
        job.validate()?;
        let (trigger_data, args, kwargs) = encode(&job)?;
        self.with_conn(move |conn| {
            let result = conn.execute(
                "INSERT INTO scheduler_jobs
                 (id, trigger_type, trigger_data, target, queue, args, kwargs, next_fire_ms,
                  misfire_grace_secs, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    job.id,
                    trigger_type(&job.trigger),
                    trigger_data,
                    job.target,
                    job.queue,
                    args,
                    kwargs,
                    job.next_fire_time.map(|t| t.timestamp_millis()),
                    job.misfire_grace_secs.map(|g| g as i64),
                    job.created_at.to_rfc3339(),
                ],
            );
            match result {
                Ok(_) => Ok(()),
                Err(e) if is_unique_violation(&e) => Err(StoreError::DuplicateId(job.id)),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn update(&self, id: &str, update: JobUpdate) -> Result<JobDefinition, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let row = tx
                .query_row(
                    &format!("SELECT {JOB_COLUMNS} FROM scheduler_jobs WHERE id = ?1"),
                    [&id],
                    read_row,
                )
                .optional()?
                .ok_or_else(|| StoreError::NotFound(id.clone()))?;
            let mut job = row
                .job
                .map_err(|e| StoreError::Unavailable(format!("corrupt job '{id}': {e}")))?;
            update.apply(&mut job, Utc::now())?;
            write_back(&tx, &job)?;
            tx.commit()?;
            Ok(job)
        })
        .await
    }

    async fn remove(&self, id: &str) -> Result<(), StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let deleted = conn.execute("DELETE FROM scheduler_jobs WHERE id = ?1", [&id])?;
            if deleted == 0 {
                Err(StoreError::NotFound(id))
            } else {
                Ok(())
            }
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<Option<JobDefinition>, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {JOB_COLUMNS} FROM scheduler_jobs WHERE id = ?1"),
                    [&id],
                    read_row,
                )
                .optional()?;
            match row {
                Some(row) => row
                    .job
                    .map(Some)
                    .map_err(|e| StoreError::Unavailable(format!("corrupt job '{id}': {e}"))),
                None => Ok(None),
            }
        })
        .await
    }

    async fn list(&self) -> Result<Vec<JobDefinition>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM scheduler_jobs
                 ORDER BY next_fire_ms IS NULL, next_fire_ms, seq"
            ))?;
            let rows = stmt.query_map([], read_row)?;
            let mut jobs = Vec::new();
            for row in rows {
                let row = row?;
                match row.job {
                    Ok(job) => jobs.push(job),
                    Err(e) => tracing::warn!("⚠️ Skipping unreadable job '{}': {e}", row.id),
                }
            }
            Ok(jobs)
        })
        .await
    }

    async fn claim_due(&self, now: DateTime<Utc>) -> Result<Vec<ClaimedJob>, StoreError> {
        self.with_conn(move |conn| claim_due_rows(conn, now)).await
    }

    async fn next_wake_time(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.with_conn(|conn| {
            let ms: Option<i64> =
                conn.query_row("SELECT MIN(next_fire_ms) FROM scheduler_jobs", [], |r| r.get(0))?;
            Ok(ms.and_then(DateTime::<Utc>::from_timestamp_millis))
        })
        .await
    }
}

fn claim_due_rows(conn: &mut Connection, now: DateTime<Utc>) -> Result<Vec<ClaimedJob>, StoreError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let rows: Vec<StoredRow> = {
        let mut stmt = tx.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM scheduler_jobs
             WHERE next_fire_ms IS NOT NULL AND next_fire_ms <= ?1
             ORDER BY next_fire_ms, seq"
        ))?;
        let rows = stmt
            .query_map([now.timestamp_millis()], read_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows
    };

    let mut batch = Vec::with_capacity(rows.len());
    for row in rows {
        let job = match row.job {
            Ok(job) => job,
            Err(e) => {
                // Park it so it cannot keep the loop spinning.
                tracing::error!("❌ Pausing unreadable job '{}' (seq {}): {e}", row.id, row.seq);
                tx.execute(
                    "UPDATE scheduler_jobs SET next_fire_ms = NULL WHERE seq = ?1",
                    [row.seq],
                )?;
                continue;
            }
        };
        let Some((claimed, next)) = job.claim(now) else {
            continue;
        };
        match next {
            Some(next) => {
                tx.execute(
                    "UPDATE scheduler_jobs SET next_fire_ms = ?2 WHERE seq = ?1",
                    params![row.seq, next.timestamp_millis()],
                )?;
            }
            None => {
                tx.execute("DELETE FROM scheduler_jobs WHERE seq = ?1", [row.seq])?;
            }
        }
        batch.push(claimed);
    }
    tx.commit()?;
    Ok(batch)
}
