//! Job store contract and the in-process implementation.
//!
//! The store is the only state shared between processes and the source of
//! truth for every schedule. Each call is atomic: it either fully applies or
//! returns an error and changes nothing.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::jobs::{ClaimedJob, JobDefinition, JobUpdate};

/// Durable mapping from job id to definition and next fire time.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job. Fails with `DuplicateId` if the id exists.
    async fn add(&self, job: JobDefinition) -> Result<(), StoreError>;

    /// Apply a partial update, returning the stored result.
    async fn update(&self, id: &str, update: JobUpdate) -> Result<JobDefinition, StoreError>;

    async fn remove(&self, id: &str) -> Result<(), StoreError>;

    async fn get(&self, id: &str) -> Result<Option<JobDefinition>, StoreError>;

    /// All jobs ordered by next fire time, paused jobs last.
    async fn list(&self) -> Result<Vec<JobDefinition>, StoreError>;

    /// Atomically take every job due at `now`, advance each one's schedule
    /// (deleting finished one-shot jobs) and return the batch ordered by fire
    /// time, then insertion order. A job instant is returned to one caller only.
    async fn claim_due(&self, now: DateTime<Utc>) -> Result<Vec<ClaimedJob>, StoreError>;

    /// Earliest next fire time across unpaused jobs.
    async fn next_wake_time(&self) -> Result<Option<DateTime<Utc>>, StoreError>;
}

#[derive(Default)]
struct MemoryState {
    jobs: HashMap<String, (u64, JobDefinition)>,
    seq: u64,
}

/// In-process job store. Not durable; used for tests and single-process runs.
#[derive(Default)]
pub struct MemoryJobStore {
    state: Mutex<MemoryState>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        self.state
            .lock()
            .map_err(|e| StoreError::Unavailable(format!("job store lock poisoned: {e}")))
    }
}

/// Sort key: unpaused by time first, then insertion order.
fn order_key(seq: u64, job: &JobDefinition) -> (bool, Option<DateTime<Utc>>, u64) {
    (job.next_fire_time.is_none(), job.next_fire_time, seq)
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn add(&self, job: JobDefinition) -> Result<(), StoreError> {
        job.validate()?;
        let mut state = self.lock()?;
        if state.jobs.contains_key(&job.id) {
            return Err(StoreError::DuplicateId(job.id));
        }
        state.seq += 1;
        let seq = state.seq;
        state.jobs.insert(job.id.clone(), (seq, job));
        Ok(())
    }

    async fn update(&self, id: &str, update: JobUpdate) -> Result<JobDefinition, StoreError> {
        let mut state = self.lock()?;
        let (_, job) = state
            .jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        update.apply(job, Utc::now())?;
        Ok(job.clone())
    }

    async fn remove(&self, id: &str) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        state
            .jobs
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn get(&self, id: &str) -> Result<Option<JobDefinition>, StoreError> {
        Ok(self.lock()?.jobs.get(id).map(|(_, job)| job.clone()))
    }

    async fn list(&self) -> Result<Vec<JobDefinition>, StoreError> {
        let state = self.lock()?;
        let mut jobs: Vec<_> = state.jobs.values().collect();
        jobs.sort_by_key(|(seq, job)| order_key(*seq, job));
        Ok(jobs.into_iter().map(|(_, job)| job.clone()).collect())
    }

    async fn claim_due(&self, now: DateTime<Utc>) -> Result<Vec<ClaimedJob>, StoreError> {
        let mut state = self.lock()?;
        let mut due: Vec<(u64, ClaimedJob, Option<DateTime<Utc>>)> = state
            .jobs
            .values()
            .filter_map(|(seq, job)| job.claim(now).map(|(claimed, next)| (*seq, claimed, next)))
            .collect();
        due.sort_by_key(|(seq, claimed, _)| (claimed.fire_time, *seq));

        let mut batch = Vec::with_capacity(due.len());
        for (_, claimed, next) in due {
            match next {
                Some(next) => {
                    if let Some((_, job)) = state.jobs.get_mut(&claimed.job.id) {
                        job.next_fire_time = Some(next);
                    }
                }
                None => {
                    state.jobs.remove(&claimed.job.id);
                }
            }
            batch.push(claimed);
        }
        Ok(batch)
    }

    async fn next_wake_time(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .lock()?
            .jobs
            .values()
            .filter_map(|(_, job)| job.next_fire_time)
            .min())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::jobs::Trigger;
    use chrono::TimeZone;
    use std::sync::Arc;

    pub(crate) fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    /// Shared contract checks, run against every store implementation.
    pub(crate) async fn check_store_contract(store: Arc<dyn JobStore>) {
        // add then remove leaves no trace
        store
            .add(JobDefinition::interval("tmp", "log", 10).starting_at(at(10)))
            .await
            .unwrap();
        assert!(matches!(
            store
                .add(JobDefinition::interval("tmp", "log", 10))
                .await,
            Err(StoreError::DuplicateId(_))
        ));
        store.remove("tmp").await.unwrap();
        assert!(store.get("tmp").await.unwrap().is_none());
        assert!(matches!(store.remove("tmp").await, Err(StoreError::NotFound(_))));

        // update on a missing id mutates nothing
        let update = JobUpdate {
            target: Some("x".into()),
            ..JobUpdate::default()
        };
        assert!(matches!(
            store.update("missing", update).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(store.list().await.unwrap().is_empty());
        assert_eq!(store.next_wake_time().await.unwrap(), None);

        // A at 100 every 50, B once at 120
        store
            .add(JobDefinition::interval("A", "log", 50).starting_at(at(100)))
            .await
            .unwrap();
        store
            .add(JobDefinition::once("B", "log", at(120)))
            .await
            .unwrap();
        assert_eq!(store.next_wake_time().await.unwrap(), Some(at(100)));

        let batch = store.claim_due(at(100)).await.unwrap();
        assert_eq!(ids(&batch), vec!["A"]);
        assert_eq!(
            store.get("A").await.unwrap().unwrap().next_fire_time,
            Some(at(150))
        );
        assert!(store.claim_due(at(100)).await.unwrap().is_empty());
        assert_eq!(store.next_wake_time().await.unwrap(), Some(at(120)));

        let batch = store.claim_due(at(120)).await.unwrap();
        assert_eq!(ids(&batch), vec!["B"]);
        assert!(store.get("B").await.unwrap().is_none());

        let batch = store.claim_due(at(150)).await.unwrap();
        assert_eq!(ids(&batch), vec!["A"]);
        assert_eq!(batch[0].fire_time, at(150));
        assert_eq!(
            store.get("A").await.unwrap().unwrap().next_fire_time,
            Some(at(200))
        );

        // pausing removes the job from wake computation
        store.update("A", JobUpdate::pause()).await.unwrap();
        assert_eq!(store.next_wake_time().await.unwrap(), None);
        assert!(store.claim_due(at(10_000)).await.unwrap().is_empty());

        // ties at one instant come back in insertion order
        store
            .add(JobDefinition::interval("C", "log", 60).starting_at(at(300)))
            .await
            .unwrap();
        store
            .add(JobDefinition::interval("D", "log", 60).starting_at(at(300)))
            .await
            .unwrap();
        store
            .add(JobDefinition::interval("E", "log", 60).starting_at(at(290)))
            .await
            .unwrap();
        let batch = store.claim_due(at(300)).await.unwrap();
        assert_eq!(ids(&batch), vec!["E", "C", "D"]);

        let listed: Vec<_> = store.list().await.unwrap().into_iter().map(|j| j.id).collect();
        assert_eq!(listed.last().map(String::as_str), Some("A"));

        // invalid update is rejected and leaves the job alone
        let bad = JobUpdate {
            trigger: Some(Trigger::Interval { every_secs: 0 }),
            ..JobUpdate::default()
        };
        assert!(matches!(
            store.update("C", bad).await,
            Err(StoreError::InvalidTrigger(_))
        ));
        assert_eq!(
            store.get("C").await.unwrap().unwrap().trigger,
            Trigger::Interval { every_secs: 60 }
        );
    }

    /// Many concurrent claimers never see the same fire instant twice.
    pub(crate) async fn check_concurrent_claims(store: Arc<dyn JobStore>) {
        for i in 0..20 {
            store
                .add(JobDefinition::interval(format!("j{i}"), "log", 3600).starting_at(at(100)))
                .await
                .unwrap();
        }
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.claim_due(at(200)).await.unwrap()
            }));
        }
        let mut claimed = Vec::new();
        for handle in handles {
            claimed.extend(handle.await.unwrap().into_iter().map(|c| c.job.id));
        }
        claimed.sort();
        let before = claimed.len();
        claimed.dedup();
        assert_eq!(before, 20);
        assert_eq!(claimed.len(), 20);
    }

    pub(crate) fn ids(batch: &[ClaimedJob]) -> Vec<&str> {
        batch.iter().map(|c| c.job.id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_memory_store_contract() {
        check_store_contract(Arc::new(MemoryJobStore::new())).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_memory_store_concurrent_claims() {
        check_concurrent_claims(Arc::new(MemoryJobStore::new())).await;
    }

    #[tokio::test]
    async fn test_recurring_next_fire_strictly_increases() {
        let store = MemoryJobStore::new();
        store
            .add(JobDefinition::interval("r", "log", 7).starting_at(at(0)))
            .await
            .unwrap();
        let mut last = at(0);
        for now in [0, 3, 7, 30, 31, 100] {
            store.claim_due(at(now)).await.unwrap();
            let next = store.get("r").await.unwrap().unwrap().next_fire_time.unwrap();
            assert!(next >= last);
            assert!(next > at(now));
            last = next;
        }
    }
}
