//! Scheduler error taxonomy.
//!
//! Store and mutation errors are returned to callers. Errors raised inside
//! the active loop are absorbed there (logged, retried) except
//! [`SchedulerError::StoreExhausted`], which ends the loop.

use thiserror::Error;

/// Job store failures.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Job already exists: {0}")]
    DuplicateId(String),

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Invalid trigger: {0}")]
    InvalidTrigger(String),

    /// Transient I/O or lock failure; the caller may retry.
    #[error("Job store unavailable: {0}")]
    Unavailable(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// Failure handing a fired job to the task subsystem.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Unknown target: {0}")]
    UnknownTarget(String),

    #[error("Queue unavailable: {0}")]
    QueueUnavailable(String),
}

/// Task broker failures.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Message encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for BrokerError {
    fn from(e: rusqlite::Error) -> Self {
        BrokerError::Unavailable(e.to_string())
    }
}

/// Errors surfaced by [`crate::SchedulerEngine`].
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("Scheduler is not running")]
    NotRunning,

    #[error("Operation requires an active scheduler")]
    PassiveMode,

    /// The store kept failing after every retry; the process should exit.
    #[error("Job store failed {attempts} consecutive times: {last}")]
    StoreExhausted { attempts: u32, last: StoreError },

    #[error("Wake consumer failed to start: {0}")]
    Consumer(#[from] std::io::Error),
}

impl SchedulerError {
    /// True for errors a mutation caller should treat as "no such job".
    pub fn is_not_found(&self) -> bool {
        matches!(self, SchedulerError::Store(StoreError::NotFound(_)))
    }
}
