//! Scheduler Engine — the timing loop and the job mutation API.
//!
//! Exactly one process runs the engine in [`SchedulerMode::Active`]: it owns
//! the loop that sleeps until the earliest next fire time, claims due jobs
//! from the store and dispatches them. Every other process uses
//! [`SchedulerMode::Passive`]: it mutates the store and sends a wake message
//! so the active loop re-reads its sleep target.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use cadence_core::config::SchedulerConfig;

use crate::broker::TaskBroker;
use crate::consumer::WakeCallback;
use crate::dispatch::DispatchBridge;
use crate::error::{SchedulerError, StoreError};
use crate::jobs::{ClaimedJob, JobDefinition, JobUpdate, Trigger};
use crate::store::JobStore;
use crate::wake::{WakeChannel, WakeReason, WakeSignal};

const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerMode {
    /// Mutates jobs; never fires them.
    Passive,
    /// Runs the timing loop.
    Active,
}

/// Engine tunables, usually derived from [`SchedulerConfig`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Applied to jobs added without their own grace. `None` means no limit.
    pub misfire_grace_secs: Option<u64>,
    /// Longest single sleep, even with nothing scheduled.
    pub max_idle: Duration,
    pub store_retry_attempts: u32,
    pub store_retry_backoff: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

impl From<&SchedulerConfig> for EngineConfig {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            misfire_grace_secs: Some(config.misfire_grace_secs),
            max_idle: Duration::from_secs(config.max_idle_secs),
            store_retry_attempts: config.store_retry_attempts,
            store_retry_backoff: Duration::from_millis(config.store_retry_backoff_ms),
        }
    }
}

#[derive(Debug, Default)]
struct EngineStats {
    passes: AtomicU64,
    fired: AtomicU64,
    misfired: AtomicU64,
    dispatch_failures: AtomicU64,
    store_retries: AtomicU64,
    wakes_sent: AtomicU64,
    wakes_received: AtomicU64,
}

/// Point-in-time copy of the engine counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub passes: u64,
    pub fired: u64,
    pub misfired: u64,
    pub dispatch_failures: u64,
    pub store_retries: u64,
    pub wakes_sent: u64,
    pub wakes_received: u64,
}

pub struct SchedulerEngine {
    mode: SchedulerMode,
    store: Arc<dyn JobStore>,
    bridge: Option<Arc<dyn DispatchBridge>>,
    signal: Arc<WakeSignal>,
    wake: WakeChannel,
    running: AtomicBool,
    /// Set by the first `start`; never cleared.
    started: AtomicBool,
    config: EngineConfig,
    stats: EngineStats,
}

impl SchedulerEngine {
    /// Engine that runs the timing loop and dispatches through `bridge`.
    pub fn active(
        store: Arc<dyn JobStore>,
        bridge: Arc<dyn DispatchBridge>,
        config: EngineConfig,
    ) -> Self {
        let signal = Arc::new(WakeSignal::new());
        Self {
            mode: SchedulerMode::Active,
            store,
            bridge: Some(bridge),
            wake: WakeChannel::Local(signal.clone()),
            signal,
            running: AtomicBool::new(false),
            started: AtomicBool::new(false),
            config,
            stats: EngineStats::default(),
        }
    }

    /// Engine that only mutates jobs and wakes the active process through
    /// `wake_queue` on `broker`.
    pub fn passive(
        store: Arc<dyn JobStore>,
        broker: Arc<dyn TaskBroker>,
        wake_queue: impl Into<String>,
        config: EngineConfig,
    ) -> Self {
        Self {
            mode: SchedulerMode::Passive,
            store,
            bridge: None,
            signal: Arc::new(WakeSignal::new()),
            wake: WakeChannel::remote(broker, wake_queue),
            running: AtomicBool::new(false),
            started: AtomicBool::new(false),
            config,
            stats: EngineStats::default(),
        }
    }

    pub fn mode(&self) -> SchedulerMode {
        self.mode
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Enter the running state. Job mutations are refused before this.
    pub fn start(&self) {
        self.started.store(true, Ordering::Release);
        if !self.running.swap(true, Ordering::AcqRel) {
            tracing::info!("⏰ Scheduler engine started ({:?} mode)", self.mode);
        }
    }

    /// Leave the running state and wake the loop so it exits. Idempotent.
    pub fn shutdown(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            tracing::info!("🛑 Scheduler engine shutting down");
        }
        self.signal.set();
    }

    /// Ask the active loop to recompute its sleep target.
    pub async fn wakeup(&self) -> Result<(), SchedulerError> {
        self.wake.notify().await?;
        self.stats.wakes_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Receiving end for wake messages, handed to the wake consumer.
    pub fn wake_callback(&self) -> Result<WakeCallback, SchedulerError> {
        if self.mode != SchedulerMode::Active {
            return Err(SchedulerError::PassiveMode);
        }
        let signal = self.signal.clone();
        Ok(Arc::new(move || signal.set()))
    }

    pub fn stats(&self) -> StatsSnapshot {
        let s = &self.stats;
        StatsSnapshot {
            passes: s.passes.load(Ordering::Relaxed),
            fired: s.fired.load(Ordering::Relaxed),
            misfired: s.misfired.load(Ordering::Relaxed),
            dispatch_failures: s.dispatch_failures.load(Ordering::Relaxed),
            store_retries: s.store_retries.load(Ordering::Relaxed),
            wakes_sent: s.wakes_sent.load(Ordering::Relaxed),
            wakes_received: s.wakes_received.load(Ordering::Relaxed),
        }
    }

    // ─── Job mutations ────────────────────────────────────

    pub async fn add_job(&self, mut job: JobDefinition) -> Result<JobDefinition, SchedulerError> {
        self.ensure_running()?;
        if job.misfire_grace_secs.is_none() {
            job.misfire_grace_secs = self.config.misfire_grace_secs;
        }
        self.store.add(job.clone()).await?;
        tracing::info!("📅 Job added: '{}' ({}) → {}", job.id, job.trigger.describe(), job.target);
        self.notify_mutation().await;
        Ok(job)
    }

    pub async fn update_job(&self, id: &str, update: JobUpdate) -> Result<JobDefinition, SchedulerError> {
        self.ensure_running()?;
        let job = self.store.update(id, update).await?;
        tracing::info!("✏️ Job updated: '{}' next={}", job.id, fmt_next(job.next_fire_time));
        self.notify_mutation().await;
        Ok(job)
    }

    pub async fn remove_job(&self, id: &str) -> Result<(), SchedulerError> {
        self.ensure_running()?;
        self.store.remove(id).await?;
        tracing::info!("🗑️ Job removed: '{id}'");
        self.notify_mutation().await;
        Ok(())
    }

    pub async fn pause_job(&self, id: &str) -> Result<JobDefinition, SchedulerError> {
        self.update_job(id, JobUpdate::pause()).await
    }

    /// Resume a paused job from its trigger's next instant after now.
    /// Resuming a job that is not paused changes nothing.
    pub async fn resume_job(&self, id: &str) -> Result<JobDefinition, SchedulerError> {
        self.ensure_running()?;
        let job = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if !job.is_paused() {
            return Ok(job);
        }
        let update = JobUpdate {
            next_fire_time: Some(job.trigger.first_fire(Utc::now())),
            ..JobUpdate::default()
        };
        self.update_job(id, update).await
    }

    /// Insert `job`, or bring an existing job with the same id in line with it.
    /// Used for schedules declared in configuration at every process start.
    pub async fn register_static(&self, mut job: JobDefinition) -> Result<JobDefinition, SchedulerError> {
        self.ensure_running()?;
        if job.misfire_grace_secs.is_none() {
            job.misfire_grace_secs = self.config.misfire_grace_secs;
        }
        let stored = match self.store.add(job.clone()).await {
            Ok(()) => job,
            Err(StoreError::DuplicateId(_)) => {
                self.store.update(&job.id, JobUpdate::from_definition(&job)).await?
            }
            Err(e) => return Err(e.into()),
        };
        tracing::debug!("Static schedule registered: '{}'", stored.id);
        self.notify_mutation().await;
        Ok(stored)
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<JobDefinition>, SchedulerError> {
        Ok(self.store.get(id).await?)
    }

    pub async fn list_jobs(&self) -> Result<Vec<JobDefinition>, SchedulerError> {
        Ok(self.store.list().await?)
    }

    fn ensure_running(&self) -> Result<(), SchedulerError> {
        if self.is_running() { Ok(()) } else { Err(SchedulerError::NotRunning) }
    }

    /// The mutation is already durable; a failed wake only delays pickup
    /// until the active loop's next idle timeout.
    async fn notify_mutation(&self) {
        if let Err(e) = self.wakeup().await {
            tracing::warn!(
                "⚠️ Wake notification failed ({e}); change applies within {}s",
                self.config.max_idle.as_secs()
            );
        }
    }

    // ─── Timing loop ──────────────────────────────────────

    /// Run the timing loop until [`shutdown`](Self::shutdown).
    ///
    /// The engine must have been [`start`](Self::start)ed first. A shutdown
    /// that lands before the loop is first polled makes it return `Ok` at once.
    /// Returns `Err(StoreExhausted)` when the store stays unreachable past
    /// the retry budget; the caller should exit non-zero.
    pub async fn run(&self) -> Result<(), SchedulerError> {
        let Some(bridge) = self.bridge.clone() else {
            return Err(SchedulerError::PassiveMode);
        };
        if !self.started.load(Ordering::Acquire) {
            return Err(SchedulerError::NotRunning);
        }
        if !self.is_running() {
            tracing::info!("⏰ Scheduler loop not entered, engine already shut down");
            return Ok(());
        }
        tracing::info!(
            "⏰ Scheduler loop running (idle cap {}s)",
            self.config.max_idle.as_secs()
        );

        while self.is_running() {
            let next = self.with_store_retry("next_wake_time", || self.store.next_wake_time()).await?;
            let sleep = self.sleep_budget(next, Utc::now());
            tracing::debug!("💤 Sleeping {:?} (next fire {})", sleep, fmt_next(next));

            if self.signal.wait(sleep).await == WakeReason::Signaled {
                self.stats.wakes_received.fetch_add(1, Ordering::Relaxed);
            }
            if !self.is_running() {
                break;
            }

            let batch = self
                .with_store_retry("claim_due", || self.store.claim_due(Utc::now()))
                .await?;
            self.process_batch(bridge.as_ref(), batch).await;
            self.stats.passes.fetch_add(1, Ordering::Relaxed);
        }

        tracing::info!("⏰ Scheduler loop stopped");
        Ok(())
    }

    /// Time until `next`, capped by the idle limit. Past instants give zero.
    fn sleep_budget(&self, next: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Duration {
        match next {
            Some(next) => (next - now).to_std().unwrap_or(Duration::ZERO).min(self.config.max_idle),
            None => self.config.max_idle,
        }
    }

    async fn process_batch(&self, bridge: &dyn DispatchBridge, batch: Vec<ClaimedJob>) {
        for claimed in batch {
            let job = &claimed.job;
            if claimed.misfired {
                self.stats.misfired.fetch_add(1, Ordering::Relaxed);
                let late = (Utc::now() - claimed.fire_time).num_seconds();
                // A one-shot job has no later instant to fold into, so it runs late.
                if matches!(job.trigger, Trigger::Once { .. }) {
                    tracing::warn!(
                        "⏰ One-shot job '{}' is {late}s late (grace {:?}s), firing anyway",
                        job.id,
                        job.misfire_grace_secs
                    );
                } else {
                    tracing::warn!(
                        "⏭️ Job '{}' misfired: due {} ({late}s ago, grace {:?}s), skipped",
                        job.id,
                        claimed.fire_time.to_rfc3339(),
                        job.misfire_grace_secs
                    );
                    continue;
                }
            }
            match bridge.dispatch(job).await {
                Ok(()) => {
                    self.stats.fired.fetch_add(1, Ordering::Relaxed);
                    tracing::info!("🔔 Job fired: '{}' → {}@{}", job.id, job.target, job.queue);
                }
                Err(e) => {
                    self.stats.dispatch_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::error!("❌ Dispatch failed for job '{}': {e}", job.id);
                }
            }
        }
    }

    /// Run a store call, retrying transient failures with exponential backoff.
    async fn with_store_retry<T, F, Fut>(&self, op: &str, mut call: F) -> Result<T, SchedulerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let attempts = self.config.store_retry_attempts.max(1);
        let mut backoff = self.config.store_retry_backoff;
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    attempt += 1;
                    if attempt >= attempts {
                        tracing::error!("❌ Job store {op} failed {attempt} times, giving up: {e}");
                        return Err(SchedulerError::StoreExhausted { attempts: attempt, last: e });
                    }
                    self.stats.store_retries.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        "⚠️ Job store {op} failed (attempt {attempt}/{attempts}), retrying in {:?}: {e}",
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_RETRY_BACKOFF);
                }
            }
        }
    }
}

fn fmt_next(next: Option<DateTime<Utc>>) -> String {
    next.map(|t| t.to_rfc3339()).unwrap_or_else(|| "none".into())
}
