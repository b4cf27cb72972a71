//! Wake consumer — receives wake messages for the active scheduler.
//!
//! Runs on its own OS thread with a private runtime so a busy or blocked
//! scheduler runtime never delays wake delivery. Each received message only
//! raises the wake signal; nothing is executed on this thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::watch;

use crate::broker::{TaskBroker, TaskMessage};

/// Called once per received wake message.
pub type WakeCallback = Arc<dyn Fn() + Send + Sync>;

const FETCH_SLICE: Duration = Duration::from_secs(1);
const ERROR_BACKOFF: Duration = Duration::from_millis(500);

pub struct WakeConsumer {
    shutdown: watch::Sender<bool>,
    thread: Option<JoinHandle<()>>,
    received: Arc<AtomicU64>,
}

impl WakeConsumer {
    /// Start consuming `queue` with `threads` concurrent fetchers.
    pub fn start(
        broker: Arc<dyn TaskBroker>,
        queue: impl Into<String>,
        threads: usize,
        on_wake: WakeCallback,
    ) -> std::io::Result<Self> {
        let queue = queue.into();
        let threads = threads.max(1);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let received = Arc::new(AtomicU64::new(0));

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(threads)
            .thread_name("cadence-wake")
            .enable_all()
            .build()?;

        let counter = received.clone();
        let thread = std::thread::Builder::new()
            .name("cadence-wake-consumer".into())
            .spawn(move || {
                runtime.block_on(async move {
                    tracing::info!("📨 Wake consumer listening on '{queue}' ({threads} fetchers)");
                    let fetchers: Vec<_> = (0..threads)
                        .map(|_| {
                            tokio::spawn(consume(
                                broker.clone(),
                                queue.clone(),
                                on_wake.clone(),
                                shutdown_rx.clone(),
                                counter.clone(),
                            ))
                        })
                        .collect();
                    futures::future::join_all(fetchers).await;
                    tracing::info!("Wake consumer on '{queue}' stopped");
                });
            })?;

        Ok(Self {
            shutdown,
            thread: Some(thread),
            received,
        })
    }

    /// Wake messages delivered to the callback so far.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Stop fetching and wait for the consumer thread to exit.
    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(thread) = self.thread.take()
            && tokio::task::spawn_blocking(move || thread.join()).await.is_err()
        {
            tracing::warn!("Wake consumer thread did not shut down cleanly");
        }
    }
}

impl Drop for WakeConsumer {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

async fn consume(
    broker: Arc<dyn TaskBroker>,
    queue: String,
    on_wake: WakeCallback,
    mut shutdown: watch::Receiver<bool>,
    received: Arc<AtomicU64>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        let fetched = tokio::select! {
            fetched = broker.fetch(&queue, FETCH_SLICE) => fetched,
            _ = shutdown.changed() => break,
        };
        match fetched {
            Ok(Some(message)) => {
                received.fetch_add(u64::from(!message.failed), Ordering::Relaxed);
                handle(&message, &on_wake);
                if let Err(e) = broker.ack(&message).await {
                    tracing::warn!("⚠️ Failed to ack wake message {}: {e}", message.id);
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("⚠️ Wake queue '{queue}' unavailable: {e}");
                tokio::select! {
                    _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }
    }
}

fn handle(message: &TaskMessage, on_wake: &WakeCallback) {
    if message.failed {
        // Nothing useful to re-deliver; the loop's idle cap covers a lost wake.
        tracing::warn!("⚠️ Skipping undecodable wake message {}", message.id);
        return;
    }
    tracing::debug!("Wake message {} received", message.id);
    on_wake();
}
