//! Wake-up signalling for the active scheduler loop.
//!
//! A wake is a hint, never a command: any number of signals before the loop
//! looks collapse into one re-scan, and a signal raised while nobody waits is
//! kept until the next wait.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::broker::{TaskBroker, TaskMessage};
use crate::error::BrokerError;

/// Why [`WakeSignal::wait`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    Signaled,
    TimedOut,
}

/// Coalescing one-consumer wake flag.
#[derive(Debug, Default)]
pub struct WakeSignal {
    flag: AtomicBool,
    notify: Notify,
}

impl WakeSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal. Safe to call from any thread, any number of times.
    pub fn set(&self) {
        self.flag.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Wait until the signal is raised or `timeout` elapses, consuming the
    /// signal if it was raised.
    pub async fn wait(&self, timeout: Duration) -> WakeReason {
        let deadline = Instant::now() + timeout;
        loop {
            if self.flag.swap(false, Ordering::AcqRel) {
                return WakeReason::Signaled;
            }
            // A stale permit from an already-consumed set() wakes us early;
            // the flag check above sends us back to sleep.
            if tokio::time::timeout_at(deadline, self.notify.notified()).await.is_err() {
                return if self.flag.swap(false, Ordering::AcqRel) {
                    WakeReason::Signaled
                } else {
                    WakeReason::TimedOut
                };
            }
        }
    }
}

/// Where a mutation's wake goes.
#[derive(Clone)]
pub enum WakeChannel {
    /// Same process as the active loop.
    Local(Arc<WakeSignal>),
    /// Another process: publish an empty wake message on the dedicated queue.
    Remote {
        broker: Arc<dyn TaskBroker>,
        queue: String,
    },
}

impl WakeChannel {
    pub fn remote(broker: Arc<dyn TaskBroker>, queue: impl Into<String>) -> Self {
        WakeChannel::Remote {
            broker,
            queue: queue.into(),
        }
    }

    pub async fn notify(&self) -> Result<(), BrokerError> {
        match self {
            WakeChannel::Local(signal) => {
                signal.set();
                Ok(())
            }
            WakeChannel::Remote { broker, queue } => {
                broker.enqueue(TaskMessage::wake(queue)).await
            }
        }
    }
}

impl std::fmt::Debug for WakeChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WakeChannel::Local(_) => f.write_str("WakeChannel::Local"),
            WakeChannel::Remote { queue, .. } => write!(f, "WakeChannel::Remote({queue})"),
        }
    }
}
