//! Dispatch bridge — hands a fired job to the task subsystem.

use std::sync::Arc;

use async_trait::async_trait;

use crate::broker::{TaskBroker, TaskMessage};
use crate::error::DispatchError;
use crate::jobs::JobDefinition;
use crate::registry::TargetRegistry;

/// Submits a fired job for execution without waiting for it to run.
#[async_trait]
pub trait DispatchBridge: Send + Sync {
    async fn dispatch(&self, job: &JobDefinition) -> Result<(), DispatchError>;
}

/// Enqueues fired jobs on their work queue.
pub struct QueueDispatch {
    broker: Arc<dyn TaskBroker>,
    targets: TargetRegistry,
}

impl QueueDispatch {
    pub fn new(broker: Arc<dyn TaskBroker>, targets: TargetRegistry) -> Self {
        Self { broker, targets }
    }
}

#[async_trait]
impl DispatchBridge for QueueDispatch {
    async fn dispatch(&self, job: &JobDefinition) -> Result<(), DispatchError> {
        if !self.targets.accepts(&job.target) {
            return Err(DispatchError::UnknownTarget(job.target.clone()));
        }
        let message = TaskMessage::for_job(job);
        let message_id = message.id.clone();
        self.broker
            .enqueue(message)
            .await
            .map_err(|e| DispatchError::QueueUnavailable(format!("{}: {e}", job.queue)))?;
        tracing::debug!("Enqueued {} for job '{}' on '{}'", message_id, job.id, job.queue);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::registry::FnHandler;
    use serde_json::{Map, Value, json};
    use std::time::Duration;

    fn registry_with(name: &str) -> TargetRegistry {
        let mut registry = TargetRegistry::new();
        registry.register(
            name,
            Arc::new(FnHandler(|_: Vec<Value>, _: Map<String, Value>| async { Ok(()) })),
        );
        registry
    }

    #[tokio::test]
    async fn test_dispatch_enqueues_job_payload() {
        let broker = Arc::new(MemoryBroker::new());
        let bridge = QueueDispatch::new(broker.clone(), registry_with("report"));
        let job = JobDefinition::interval("daily", "report", 86_400)
            .on_queue("reports")
            .with_args(vec![json!("sales")]);
        bridge.dispatch(&job).await.unwrap();

        let message = broker
            .fetch("reports", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.target, "report");
        assert_eq!(message.args, vec![json!("sales")]);
        assert_eq!(message.kwargs["_job_id"], "daily");
    }

    #[tokio::test]
    async fn test_dispatch_rejects_unknown_target() {
        let broker = Arc::new(MemoryBroker::new());
        let bridge = QueueDispatch::new(broker.clone(), registry_with("report"));
        let job = JobDefinition::interval("x", "missing", 60);
        assert!(matches!(
            bridge.dispatch(&job).await,
            Err(DispatchError::UnknownTarget(t)) if t == "missing"
        ));
        assert_eq!(broker.pending("default").await.unwrap(), 0);
    }
}
