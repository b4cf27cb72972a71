//! Built-in task targets shipped with the `cadence` binary.
//!
//! - `log`     — writes the job's arguments to the log
//! - `webhook` — POSTs JSON to `kwargs.url` (optional `kwargs.headers`, `kwargs.body`)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cadence_scheduler::{TargetRegistry, TaskHandler};
use serde_json::{Map, Value};

/// Registry of every target this binary can run.
pub fn builtin_targets() -> TargetRegistry {
    let mut registry = TargetRegistry::new();
    registry.register("log", Arc::new(LogTarget));
    registry.register("webhook", Arc::new(WebhookTarget::new()));
    registry
}

pub struct LogTarget;

#[async_trait]
impl TaskHandler for LogTarget {
    async fn run(&self, args: &[Value], kwargs: &Map<String, Value>) -> Result<(), String> {
        let job = kwargs.get("_job_id").and_then(Value::as_str).unwrap_or("-");
        tracing::info!("📝 [{job}] args={} kwargs={}", serde_json::Value::from(args.to_vec()), serde_json::Value::Object(kwargs.clone()));
        Ok(())
    }
}

pub struct WebhookTarget {
    client: reqwest::Client,
}

impl WebhookTarget {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl TaskHandler for WebhookTarget {
    async fn run(&self, args: &[Value], kwargs: &Map<String, Value>) -> Result<(), String> {
        let url = kwargs
            .get("url")
            .and_then(Value::as_str)
            .ok_or("webhook target needs a 'url' kwarg")?;
        let body = kwargs.get("body").cloned().unwrap_or_else(|| {
            serde_json::json!({
                "job_id": kwargs.get("_job_id"),
                "args": args,
                "fired_at": chrono::Utc::now().to_rfc3339(),
            })
        });

        let mut req = self
            .client
            .post(url)
            .json(&body)
            .timeout(Duration::from_secs(10));
        if let Some(headers) = kwargs.get("headers").and_then(Value::as_object) {
            for (key, value) in headers {
                if let Some(value) = value.as_str() {
                    req = req.header(key.as_str(), value);
                }
            }
        }

        let resp = req
            .send()
            .await
            .map_err(|e| format!("Webhook send failed: {e}"))?;
        if resp.status().is_success() {
            tracing::info!("✅ Webhook delivered to {url}");
            Ok(())
        } else {
            Err(format!("Webhook error {}", resp.status()))
        }
    }
}
