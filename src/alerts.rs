//! Falco alert ingestion: filter log lines, parse them into alerts and append them to the store.

// System
use std::sync::Arc;
use std::time::Duration;

// Third Party
use futures::StreamExt;
use k8s_openapi::chrono::{SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// Local
use crate::catalog::ALERT_COLLECTION;
use crate::config::FalcoConfig;
use crate::error::{Result, SyncError};
use crate::logs::LogSource;
use crate::recovery::{sleep_or_cancel, Backoff, RetryPolicy};
use crate::store::DocumentStore;

/// Falco priorities. A line mentioning none of them is not an alert.
pub const SEVERITY_TOKENS: &[&str] = &[
    "Emergency",
    "Alert",
    "Critical",
    "Error",
    "Warning",
    "Notice",
    "Informational",
    "Debug",
];

const UNKNOWN: &str = "Unknown";

/// Pause before looking for the pod again after its log stream ended cleanly.
const STREAM_RECONNECT_PAUSE: Duration = Duration::from_secs(1);

pub fn is_alert_line(line: &str) -> bool {
    SEVERITY_TOKENS.iter().any(|token| line.contains(token))
}

/// Parse a Falco output line. JSON objects are passed through as-is; plain text must look like
/// `<time>: <priority> <rule>: <output>`.
pub fn parse_alert_line(line: &str) -> Result<Map<String, Value>> {
    let trimmed = line.trim();
    if trimmed.starts_with('{') {
        return match serde_json::from_str::<Value>(trimmed)? {
            Value::Object(map) => Ok(map),
            _ => Err(SyncError::Parse("JSON line is not an object".to_string())),
        };
    }

    let mut parts = line.splitn(3, ": ");
    let (Some(time), Some(priority_and_rule), Some(output)) =
        (parts.next(), parts.next(), parts.next())
    else {
        return Err(SyncError::Parse(
            "expected `<time>: <priority> <rule>: <output>`".to_string(),
        ));
    };
    let priority_and_rule = priority_and_rule.trim();
    let (priority, rule) = match priority_and_rule.split_once(char::is_whitespace) {
        Some((priority, rule)) => (priority, rule.trim()),
        None => (priority_and_rule, UNKNOWN),
    };

    let mut alert = Map::new();
    alert.insert("time".to_string(), json!(time.trim()));
    alert.insert("priority".to_string(), json!(priority));
    alert.insert("rule".to_string(), json!(rule));
    alert.insert("output".to_string(), json!(output.trim()));
    Ok(alert)
}

fn field<'a>(alert: &'a Map<String, Value>, name: &str) -> Option<&'a str> {
    alert.get(name).and_then(Value::as_str)
}

/// `<time>-<rule>-<first 16 hex chars of sha256(output)>`. Used for auditing and
/// deduplication downstream; the store does not enforce it.
pub fn alert_fingerprint(alert: &Map<String, Value>) -> String {
    let digest = Sha256::digest(field(alert, "output").unwrap_or_default().as_bytes());
    let hash = hex::encode(digest);
    format!(
        "{}-{}-{}",
        field(alert, "time").unwrap_or_default(),
        field(alert, "rule").unwrap_or_default(),
        &hash[..16]
    )
}

pub fn alert_document(alert: Map<String, Value>, cluster: &str) -> Value {
    json!({
        "_event_type": "FALCO_ALERT",
        "_resource_type": "falco_alert",
        "_cluster": cluster,
        "_timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        "_priority": field(&alert, "priority").unwrap_or(UNKNOWN),
        "_rule": field(&alert, "rule").unwrap_or(UNKNOWN),
        "_output": field(&alert, "output").unwrap_or_default(),
        "_alert_id": alert_fingerprint(&alert),
        "data": alert,
    })
}

/// Why `AlertIngestor::run` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestorExit {
    Cancelled,
    Exhausted,
}

/// Tails the Falco pod log and appends each alert to `falco_alerts`.
pub struct AlertIngestor {
    logs: Arc<dyn LogSource>,
    store: Arc<dyn DocumentStore>,
    cluster: Arc<str>,
    config: FalcoConfig,
    policy: RetryPolicy,
}

impl AlertIngestor {
    pub fn new(
        logs: Arc<dyn LogSource>,
        store: Arc<dyn DocumentStore>,
        cluster: Arc<str>,
        config: FalcoConfig,
    ) -> Self {
        Self {
            logs,
            store,
            cluster,
            config,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Returns true when the line produced a stored alert.
    pub async fn handle_line(&self, line: &str) -> bool {
        if !is_alert_line(line) {
            return false;
        }
        let alert = match parse_alert_line(line) {
            Ok(alert) => alert,
            Err(e) => {
                debug!("Dropping log line: {}", e);
                return false;
            }
        };
        let rule = field(&alert, "rule").unwrap_or(UNKNOWN).to_string();
        let priority = field(&alert, "priority").unwrap_or(UNKNOWN).to_string();
        match self
            .store
            .insert(ALERT_COLLECTION, alert_document(alert, &self.cluster))
            .await
        {
            Ok(()) => {
                info!(rule = %rule, priority = %priority, "Stored Falco alert");
                true
            }
            Err(e) => {
                error!(rule = %rule, "Failed to store Falco alert: {}", e);
                false
            }
        }
    }

    /// Follow one pod's log until it ends. Ok(false) means cancelled.
    async fn follow(&self, pod: &str, cancel: &CancellationToken) -> Result<bool> {
        let mut lines = self
            .logs
            .stream_logs(pod, &self.config.namespace, &self.config.container)
            .await?;
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Ok(false),
                next = lines.next() => next,
            };
            match next {
                None => return Ok(true),
                Some(Ok(line)) => {
                    self.handle_line(&line).await;
                }
                Some(Err(e)) => return Err(e),
            }
        }
    }

    /// Locate a pod and follow it. Ok(None) means no pod is running yet.
    async fn attempt(&self, cancel: &CancellationToken) -> Result<Option<bool>> {
        let pods = self
            .logs
            .find_pods(&self.config.namespace, &self.config.label_selector)
            .await?;
        let Some(pod) = pods.first() else {
            return Ok(None);
        };
        info!(pod = %pod, "Watching logs from Falco pod");
        self.follow(pod, cancel).await.map(Some)
    }

    pub async fn run(self, cancel: CancellationToken) -> IngestorExit {
        info!(namespace = %self.config.namespace, "Starting to watch Falco logs");
        let mut backoff = Backoff::new(self.policy);
        let exit = loop {
            if cancel.is_cancelled() {
                break IngestorExit::Cancelled;
            }
            let resumed = match self.attempt(&cancel).await {
                Ok(None) => {
                    warn!(namespace = %self.config.namespace, "No Falco pods found");
                    sleep_or_cancel(self.config.pod_poll_interval(), &cancel).await
                }
                Ok(Some(false)) => break IngestorExit::Cancelled,
                Ok(Some(true)) => {
                    backoff.reset();
                    debug!("Falco log stream ended, reconnecting");
                    sleep_or_cancel(STREAM_RECONNECT_PAUSE, &cancel).await
                }
                Err(e) => {
                    let Some(delay) = backoff.record_failure() else {
                        error!("Max retries reached for Falco log watching: {}", e);
                        break IngestorExit::Exhausted;
                    };
                    warn!(
                        attempt = backoff.failures(),
                        max = backoff.max_failures(),
                        "Error watching Falco logs, retrying in {:?}: {}", delay, e
                    );
                    backoff.wait(delay, &cancel).await
                }
            };
            if !resumed {
                break IngestorExit::Cancelled;
            }
        };
        info!("Falco log watcher stopped");
        exit
    }
}
