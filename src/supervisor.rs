//! Named background tasks with individual cancellation, restart and bounded shutdown.

// System
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

// Third Party
use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Builds a fresh task future from the token it must obey.
pub type TaskFactory = Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, ()> + Send + Sync>;

struct Task {
    factory: TaskFactory,
    token: CancellationToken,
    /// Taken once the task's result has been observed.
    handle: Option<JoinHandle<()>>,
}

pub struct Supervisor {
    root: CancellationToken,
    tasks: BTreeMap<String, Task>,
}

impl Supervisor {
    /// Every task token is a child of `root`; cancelling it stops them all.
    pub fn new(root: CancellationToken) -> Self {
        Self {
            root,
            tasks: BTreeMap::new(),
        }
    }

    pub fn spawn(&mut self, name: &str, factory: TaskFactory) {
        if let Some(previous) = self.tasks.remove(name) {
            warn!(task = name, "Replacing existing task");
            previous.token.cancel();
        }
        let token = self.root.child_token();
        let handle = tokio::spawn(factory(token.clone()));
        debug!(task = name, "Spawned task");
        self.tasks.insert(
            name.to_string(),
            Task {
                factory,
                token,
                handle: Some(handle),
            },
        );
    }

    pub fn names(&self) -> Vec<String> {
        self.tasks.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Names of tasks that are still running.
    pub fn running(&self) -> Vec<String> {
        self.tasks
            .iter()
            .filter(|(_, task)| task.handle.as_ref().is_some_and(|h| !h.is_finished()))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Signal one task to stop. Returns false for unknown names.
    pub fn cancel(&self, name: &str) -> bool {
        match self.tasks.get(name) {
            Some(task) => {
                task.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Stop a task and start it again from its factory.
    pub async fn restart(&mut self, name: &str, timeout: Duration) -> bool {
        let Some(task) = self.tasks.remove(name) else {
            return false;
        };
        task.token.cancel();
        if let Some(handle) = task.handle {
            join_with_timeout(name, handle, timeout).await;
        }
        info!(task = name, "Restarting task");
        self.spawn(name, task.factory);
        true
    }

    /// Resolves once the root token is cancelled or every task has finished.
    pub async fn wait(&mut self) {
        let root = self.root.clone();
        let tasks = &mut self.tasks;
        let all_done = async move {
            for (name, task) in tasks.iter_mut() {
                if let Some(handle) = task.handle.as_mut() {
                    if let Err(e) = handle.await {
                        warn!(task = %name, "Task failed: {}", e);
                    }
                    task.handle = None;
                }
            }
        };
        tokio::select! {
            _ = root.cancelled() => {}
            _ = all_done => info!("All tasks finished"),
        }
    }

    /// Cancel everything and wait up to `timeout` per task before aborting it.
    pub async fn shutdown(self, timeout: Duration) {
        self.root.cancel();
        for (name, task) in self.tasks {
            if let Some(handle) = task.handle {
                join_with_timeout(&name, handle, timeout).await;
            }
        }
        info!("All tasks stopped");
    }
}

async fn join_with_timeout(name: &str, mut handle: JoinHandle<()>, timeout: Duration) {
    match tokio::time::timeout(timeout, &mut handle).await {
        Ok(Ok(())) => debug!(task = name, "Task stopped"),
        Ok(Err(e)) => warn!(task = name, "Task failed: {}", e),
        Err(_) => {
            warn!(task = name, "Task did not stop in {:?}, aborting", timeout);
            handle.abort();
        }
    }
}
