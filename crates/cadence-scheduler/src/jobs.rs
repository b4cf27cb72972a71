//! Job definitions — the persisted data model for scheduled work.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::cron;
use crate::error::StoreError;

/// Longest accepted interval (ten years); keeps timestamp math in range.
pub const MAX_INTERVAL_SECS: u64 = 10 * 365 * 24 * 3600;

/// Queue a job is enqueued on when it does not name one.
pub const DEFAULT_QUEUE: &str = "default";

/// How/when a job fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// Fire once at a specific instant, then the job is deleted.
    Once { at: DateTime<Utc> },
    /// Fire every N seconds, anchored on the previous scheduled instant.
    Interval { every_secs: u64 },
    /// Fire on a cron schedule (UTC).
    Cron { expression: String },
}

impl Trigger {
    pub fn validate(&self) -> Result<(), StoreError> {
        match self {
            Trigger::Once { .. } => Ok(()),
            Trigger::Interval { every_secs } => {
                if *every_secs == 0 || *every_secs > MAX_INTERVAL_SECS {
                    Err(StoreError::InvalidTrigger(format!(
                        "interval must be within 1..={MAX_INTERVAL_SECS} seconds, got {every_secs}"
                    )))
                } else {
                    Ok(())
                }
            }
            Trigger::Cron { expression } => cron::parse(expression)
                .map(|_| ())
                .map_err(StoreError::InvalidTrigger),
        }
    }

    /// First fire instant for a job created (or re-triggered) at `now`.
    pub fn first_fire(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Once { at } => Some(*at),
            Trigger::Interval { every_secs } => Some(now + Duration::seconds(*every_secs as i64)),
            Trigger::Cron { expression } => cron::next_run_from_cron(expression, now),
        }
    }

    /// Next fire instant after the job fired for `fired_at` and was claimed at `now`.
    /// Missed instants are coalesced: the result is always strictly after `now`.
    pub fn next_after(&self, fired_at: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Once { .. } => None,
            Trigger::Interval { every_secs } => {
                let every = Duration::seconds(*every_secs as i64);
                if fired_at > now {
                    return Some(fired_at + every);
                }
                let elapsed = (now - fired_at).num_milliseconds();
                let steps = elapsed / every.num_milliseconds() + 1;
                Some(fired_at + Duration::milliseconds(every.num_milliseconds() * steps))
            }
            Trigger::Cron { expression } => cron::next_run_from_cron(expression, now.max(fired_at)),
        }
    }

    /// Short label used in logs and listings.
    pub fn describe(&self) -> String {
        match self {
            Trigger::Once { at } => format!("once@{}", at.to_rfc3339()),
            Trigger::Interval { every_secs } => format!("every {every_secs}s"),
            Trigger::Cron { expression } => format!("cron '{expression}'"),
        }
    }
}

/// A persisted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    /// Unique job ID.
    pub id: String,
    pub trigger: Trigger,
    /// Name of the work to run, resolved by the task subsystem.
    pub target: String,
    /// Task queue the fire event is enqueued on.
    #[serde(default = "default_queue")]
    pub queue: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    /// Next scheduled instant; `None` while paused.
    pub next_fire_time: Option<DateTime<Utc>>,
    /// How late a fire may be claimed and still run. `None` = no limit.
    pub misfire_grace_secs: Option<u64>,
    pub created_at: DateTime<Utc>,
}

fn default_queue() -> String {
    DEFAULT_QUEUE.to_string()
}

/// One entry of a claimed batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedJob {
    /// The job as stored at claim time (before its schedule advanced).
    pub job: JobDefinition,
    /// The scheduled instant this claim is for.
    pub fire_time: DateTime<Utc>,
    /// Claimed later than its grace period allows.
    pub misfired: bool,
}

impl JobDefinition {
    /// Create a job whose first fire time is derived from the trigger.
    pub fn new(id: impl Into<String>, target: impl Into<String>, trigger: Trigger) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            next_fire_time: trigger.first_fire(now),
            trigger,
            target: target.into(),
            queue: default_queue(),
            args: Vec::new(),
            kwargs: Map::new(),
            misfire_grace_secs: None,
            created_at: now,
        }
    }

    /// Create a one-shot job.
    pub fn once(id: impl Into<String>, target: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self::new(id, target, Trigger::Once { at })
    }

    /// Create a recurring interval job.
    pub fn interval(id: impl Into<String>, target: impl Into<String>, every_secs: u64) -> Self {
        Self::new(id, target, Trigger::Interval { every_secs })
    }

    /// Create a cron-scheduled job.
    pub fn cron(id: impl Into<String>, target: impl Into<String>, expression: &str) -> Self {
        Self::new(
            id,
            target,
            Trigger::Cron {
                expression: expression.to_string(),
            },
        )
    }

    /// Override the first fire instant.
    pub fn starting_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_fire_time = Some(at);
        self
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_misfire_grace(mut self, secs: Option<u64>) -> Self {
        self.misfire_grace_secs = secs;
        self
    }

    /// Build a job from a schedule declared in the config file.
    pub fn from_static(schedule: &cadence_core::config::StaticSchedule) -> Result<Self, StoreError> {
        let trigger = match (&schedule.cron, schedule.interval_secs, schedule.at) {
            (Some(expression), None, None) => Trigger::Cron {
                expression: expression.clone(),
            },
            (None, Some(every_secs), None) => Trigger::Interval { every_secs },
            (None, None, Some(at)) => Trigger::Once { at },
            _ => {
                return Err(StoreError::InvalidTrigger(format!(
                    "schedule '{}' needs exactly one of cron, interval_secs, at",
                    schedule.id
                )));
            }
        };
        let job = Self::new(&schedule.id, &schedule.target, trigger)
            .on_queue(&schedule.queue)
            .with_args(schedule.args.clone())
            .with_kwargs(schedule.kwargs.clone())
            .with_misfire_grace(schedule.misfire_grace_secs);
        job.validate()?;
        Ok(job)
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if self.id.trim().is_empty() {
            return Err(StoreError::InvalidTrigger("job id must not be empty".into()));
        }
        if self.target.trim().is_empty() || self.queue.trim().is_empty() {
            return Err(StoreError::InvalidTrigger(format!(
                "job '{}' needs a target and a queue",
                self.id
            )));
        }
        self.trigger.validate()
    }

    pub fn is_paused(&self) -> bool {
        self.next_fire_time.is_none()
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_fire_time.is_some_and(|t| t <= now)
    }

    /// Claim this job at `now` if it is due.
    ///
    /// Returns the claimed entry and the job's following fire time; `None` as
    /// the second element means the job is finished and must be deleted.
    pub fn claim(&self, now: DateTime<Utc>) -> Option<(ClaimedJob, Option<DateTime<Utc>>)> {
        let fire_time = self.next_fire_time.filter(|t| *t <= now)?;
        let misfired = self
            .misfire_grace_secs
            .is_some_and(|grace| now - fire_time > Duration::seconds(grace as i64));
        let next = self.trigger.next_after(fire_time, now);
        Some((
            ClaimedJob {
                job: self.clone(),
                fire_time,
                misfired,
            },
            next,
        ))
    }
}

/// Partial update applied by `JobStore::update`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub trigger: Option<Trigger>,
    pub target: Option<String>,
    pub queue: Option<String>,
    pub args: Option<Vec<Value>>,
    pub kwargs: Option<Map<String, Value>>,
    /// `Some(None)` pauses the job.
    pub next_fire_time: Option<Option<DateTime<Utc>>>,
    pub misfire_grace_secs: Option<Option<u64>>,
}

impl JobUpdate {
    /// An update that overwrites every user-controlled field with `job`'s values
    /// but leaves the schedule position alone.
    pub fn from_definition(job: &JobDefinition) -> Self {
        Self {
            trigger: Some(job.trigger.clone()),
            target: Some(job.target.clone()),
            queue: Some(job.queue.clone()),
            args: Some(job.args.clone()),
            kwargs: Some(job.kwargs.clone()),
            next_fire_time: None,
            misfire_grace_secs: Some(job.misfire_grace_secs),
        }
    }

    pub fn pause() -> Self {
        Self {
            next_fire_time: Some(None),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Apply onto `job`. A changed trigger on an unpaused job recomputes the
    /// next fire time from `now` unless the update sets one explicitly.
    pub fn apply(self, job: &mut JobDefinition, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut updated = job.clone();
        if let Some(trigger) = self.trigger
            && trigger != updated.trigger
        {
            updated.trigger = trigger;
            if self.next_fire_time.is_none() && !updated.is_paused() {
                updated.next_fire_time = updated.trigger.first_fire(now);
            }
        }
        if let Some(target) = self.target {
            updated.target = target;
        }
        if let Some(queue) = self.queue {
            updated.queue = queue;
        }
        if let Some(args) = self.args {
            updated.args = args;
        }
        if let Some(kwargs) = self.kwargs {
            updated.kwargs = kwargs;
        }
        if let Some(next) = self.next_fire_time {
            updated.next_fire_time = next;
        }
        if let Some(grace) = self.misfire_grace_secs {
            updated.misfire_grace_secs = grace;
        }
        updated.validate()?;
        *job = updated;
        Ok(())
    }
}

/// Generate a fresh job id.
pub fn new_job_id() -> String {
    format!("job-{}", uuid::Uuid::new_v4().simple())
}
