//! Log source boundary: finding the alert-producing pod and following its log.

// Third Party
use async_trait::async_trait;
use futures::{stream::BoxStream, AsyncBufRead, AsyncBufReadExt, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, ListParams, LogParams},
    Client,
};

// Local
use crate::error::{Result, SyncError};

pub type LineStream = BoxStream<'static, Result<String>>;

#[async_trait]
pub trait LogSource: Send + Sync {
    /// Names of pods in `namespace` matching `label_selector`.
    async fn find_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<String>>;

    /// Follow a container's log, one item per line without the trailing newline.
    async fn stream_logs(&self, pod: &str, namespace: &str, container: &str)
        -> Result<LineStream>;
}

/// Split a log body into lines; `\n` and `\r\n` terminators are stripped.
pub fn log_lines<R>(reader: R) -> LineStream
where
    R: AsyncBufRead + Send + 'static,
{
    Box::pin(reader).lines().map_err(SyncError::from).boxed()
}

pub struct KubeLogSource {
    client: Client,
}

impl KubeLogSource {
    pub fn new(client: &Client) -> Self {
        Self {
            client: client.clone(),
        }
    }
}

#[async_trait]
impl LogSource for KubeLogSource {
    async fn find_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<String>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = pods
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|pod| pod.metadata.name)
            .collect())
    }

    async fn stream_logs(
        &self,
        pod: &str,
        namespace: &str,
        container: &str,
    ) -> Result<LineStream> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = LogParams {
            container: Some(container.to_string()),
            follow: true,
            ..Default::default()
        };
        let body = pods.log_stream(pod, &params).await?;
        Ok(log_lines(body))
    }
}
