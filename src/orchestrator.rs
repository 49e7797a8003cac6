// System
use std::sync::Arc;
use std::time::Duration;

// Third Party
use futures::FutureExt;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::info;

// Local
use crate::alerts::AlertIngestor;
use crate::catalog::ResourceKind;
use crate::config::Config;
use crate::logs::{KubeLogSource, LogSource};
use crate::reconciler::Reconciler;
use crate::recovery::RetryPolicy;
use crate::source::{KubeResourceSource, ResourceSource};
use crate::store::DocumentStore;
use crate::supervisor::{Supervisor, TaskFactory};

pub const ALERT_TASK: &str = "falco-alerts";

/// Creates the watch source for a kind each time its task (re)starts.
pub type SourceFactory = Arc<dyn Fn(&ResourceKind) -> Box<dyn ResourceSource> + Send + Sync>;

/// Runs one reconciler per catalog entry, one for namespaces and, if enabled, the alert
/// ingestor. Tasks share only the store.
pub struct Orchestrator {
    config: Arc<Config>,
    store: Arc<dyn DocumentStore>,
    cluster: Arc<str>,
    sources: SourceFactory,
    logs: Arc<dyn LogSource>,
    policy: RetryPolicy,
}

impl Orchestrator {
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn DocumentStore>,
        cluster: Arc<str>,
        sources: SourceFactory,
        logs: Arc<dyn LogSource>,
    ) -> Self {
        Self {
            config,
            store,
            cluster,
            sources,
            logs,
            policy: RetryPolicy::default(),
        }
    }

    /// Wire every task to the given Kubernetes client.
    pub fn with_client(
        client: &Client,
        config: Arc<Config>,
        store: Arc<dyn DocumentStore>,
        cluster: Arc<str>,
    ) -> Self {
        let source_client = client.clone();
        let sources: SourceFactory = Arc::new(move |kind: &ResourceKind| {
            Box::new(KubeResourceSource::new(&source_client, kind.clone())) as Box<dyn ResourceSource>
        });
        let logs = Arc::new(KubeLogSource::new(client));
        Self::new(config, store, cluster, sources, logs)
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn reconciler_task(&self, kind: ResourceKind) -> TaskFactory {
        let sources = self.sources.clone();
        let store = self.store.clone();
        let cluster = self.cluster.clone();
        let timeout = self.config.watch_timeout_seconds;
        let policy = self.policy;
        Arc::new(move |token: CancellationToken| {
            let mut reconciler = Reconciler::new(sources(&kind), store.clone(), cluster.clone(), timeout)
                .with_retry_policy(policy);
            if kind.is_namespace() {
                reconciler = reconciler.without_existence_check();
            }
            let kind = kind.clone();
            async move {
                let exit = reconciler.run(token).await;
                info!(kind = %kind, exit = ?exit, "Reconciler stopped");
            }
            .boxed()
        })
    }

    fn ingestor_task(&self) -> TaskFactory {
        let logs = self.logs.clone();
        let store = self.store.clone();
        let cluster = self.cluster.clone();
        let falco = self.config.falco.clone();
        let policy = self.policy;
        Arc::new(move |token: CancellationToken| {
            let ingestor =
                AlertIngestor::new(logs.clone(), store.clone(), cluster.clone(), falco.clone())
                    .with_retry_policy(policy);
            async move {
                let exit = ingestor.run(token).await;
                info!(exit = ?exit, "Alert ingestor stopped");
            }
            .boxed()
        })
    }

    /// Spawn every task into `supervisor`.
    pub fn start(&self, supervisor: &mut Supervisor) {
        for kind in &self.config.resources {
            supervisor.spawn(&kind.to_string(), self.reconciler_task(kind.clone()));
        }
        let namespace = ResourceKind::namespace();
        supervisor.spawn(&namespace.to_string(), self.reconciler_task(namespace));
        if self.config.falco.enabled {
            supervisor.spawn(ALERT_TASK, self.ingestor_task());
        }
    }

    /// Run until `cancel` fires (or every task has stopped), then shut down within
    /// `shutdown_timeout` per task.
    pub async fn run(self, cancel: CancellationToken, shutdown_timeout: Duration) {
        let mut supervisor = Supervisor::new(cancel);
        self.start(&mut supervisor);
        info!(
            cluster = %self.cluster,
            tasks = supervisor.len(),
            "Controller started. Watching resources and namespaces..."
        );
        supervisor.wait().await;
        supervisor.shutdown(shutdown_timeout).await;
    }
}
