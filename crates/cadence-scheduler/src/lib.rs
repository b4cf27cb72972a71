//! # Cadence Scheduler
//!
//! Persistent job scheduling with one active timing loop per deployment.
//!
//! ## Design Principles
//! - The job store is the only shared state — every process reads and writes it
//! - Exactly one process fires jobs; the others only mutate and wake it
//! - Wakes are hints: duplicates coalesce, lost ones are covered by the idle cap
//! - Firing hands the job to a work queue and never waits for it to run
//!
//! ## Architecture
//! ```text
//! Passive process (CLI, web app)          Active process (run-scheduler)
//!   SchedulerEngine::passive                SchedulerEngine::active
//!     ├── JobStore.add/update/remove          ├── loop: sleep → claim_due → dispatch
//!     └── WakeChannel::Remote ──┐             │     ▲
//!                               ▼             │     │ WakeSignal
//!                     broker queue "scheduler" ──► WakeConsumer (own thread)
//!                                             │
//!                                             └── QueueDispatch → work queues
//!                                                                    │
//!                                                     TaskWorker ◄───┘
//!                                                       └── TargetRegistry handlers
//! ```

pub mod broker;
pub mod consumer;
pub mod cron;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod jobs;
pub mod persistence;
pub mod registry;
pub mod store;
pub mod wake;
pub mod worker;

pub use broker::{MemoryBroker, SqliteBroker, TaskBroker, TaskMessage};
pub use consumer::{WakeCallback, WakeConsumer};
pub use dispatch::{DispatchBridge, QueueDispatch};
pub use engine::{EngineConfig, SchedulerEngine, SchedulerMode, StatsSnapshot};
pub use error::{BrokerError, DispatchError, SchedulerError, StoreError};
pub use jobs::{ClaimedJob, JobDefinition, JobUpdate, Trigger};
pub use persistence::SqliteJobStore;
pub use registry::{FnHandler, TargetRegistry, TaskHandler};
pub use store::{JobStore, MemoryJobStore};
pub use wake::{WakeChannel, WakeSignal};
pub use worker::TaskWorker;
