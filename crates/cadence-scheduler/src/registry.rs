//! Target registry — maps task target names to handlers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

/// Executable body of a task target.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, args: &[Value], kwargs: &Map<String, Value>) -> Result<(), String>;
}

/// Adapter turning an async closure into a [`TaskHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(Vec<Value>, Map<String, Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), String>> + Send,
{
    async fn run(&self, args: &[Value], kwargs: &Map<String, Value>) -> Result<(), String> {
        (self.0)(args.to_vec(), kwargs.clone()).await
    }
}

/// Known task targets.
///
/// An empty registry accepts any target name at dispatch time; a populated
/// one rejects names it does not know.
#[derive(Default, Clone)]
pub struct TargetRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        let name = name.into();
        tracing::debug!("Registered task target: {name}");
        self.handlers.insert(name, handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether a job naming `target` may be dispatched.
    pub fn accepts(&self, target: &str) -> bool {
        self.is_empty() || self.contains(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_registry_lookup() {
        let mut registry = TargetRegistry::new();
        assert!(registry.accepts("anything"));
        registry.register(
            "echo",
            Arc::new(FnHandler(|args: Vec<Value>, _kwargs: Map<String, Value>| async move {
                if args.is_empty() { Err("no args".to_string()) } else { Ok(()) }
            })),
        );
        assert!(registry.accepts("echo"));
        assert!(!registry.accepts("other"));
        assert_eq!(registry.names(), vec!["echo".to_string()]);

        let handler = registry.get("echo").unwrap();
        assert!(handler.run(&[Value::from(1)], &Map::new()).await.is_ok());
        assert_eq!(handler.run(&[], &Map::new()).await, Err("no args".into()));
    }
}
