//! Watch API boundary: list, watch and existence check for one resource kind.

// Third Party
use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt, TryStreamExt};
use kube::{
    api::{Api, DynamicObject, ListParams, WatchEvent, WatchParams},
    Client,
};
use serde_json::Value;
use tracing::debug;

// Local
use crate::catalog::ResourceKind;
use crate::error::{Result, SyncError};
use crate::record::EventType;

/// One item from a watch stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Object { event_type: EventType, object: Value },
    /// Progress marker carrying no object.
    Bookmark { resource_version: String },
}

/// A complete listing of a kind at one resource version.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub items: Vec<Value>,
    pub resource_version: Option<String>,
}

pub type ChangeStream = BoxStream<'static, Result<Change>>;

#[async_trait]
pub trait ResourceSource: Send + Sync {
    fn kind(&self) -> &ResourceKind;

    /// False when the API server does not serve this kind.
    async fn exists(&self) -> Result<bool>;

    async fn list(&self) -> Result<Snapshot>;

    /// Changes after `resource_version` (current state when `None`). The server closes the stream
    /// after `timeout_seconds`.
    async fn watch(&self, resource_version: Option<&str>, timeout_seconds: u32)
        -> Result<ChangeStream>;
}

/// `ResourceSource` backed by the kube dynamic object API.
pub struct KubeResourceSource {
    client: Client,
    kind: ResourceKind,
    api: Api<DynamicObject>,
}

impl KubeResourceSource {
    pub fn new(client: &Client, kind: ResourceKind) -> Self {
        let api = Api::all_with(client.clone(), &kind.api_resource());
        Self {
            client: client.clone(),
            kind,
            api,
        }
    }

    fn classify(&self, error: kube::Error) -> SyncError {
        SyncError::from_kube(&self.kind.to_string(), error)
    }
}

fn convert_event(kind: &str, event: WatchEvent<DynamicObject>) -> Result<Change> {
    let (event_type, object) = match event {
        WatchEvent::Added(obj) => (EventType::Added, obj),
        WatchEvent::Modified(obj) => (EventType::Modified, obj),
        WatchEvent::Deleted(obj) => (EventType::Deleted, obj),
        WatchEvent::Bookmark(bookmark) => {
            return Ok(Change::Bookmark {
                resource_version: bookmark.metadata.resource_version,
            })
        }
        WatchEvent::Error(response) => return Err(SyncError::from_watch_status(kind, response)),
    };
    Ok(Change::Object {
        event_type,
        object: serde_json::to_value(&object)?,
    })
}

#[async_trait]
impl ResourceSource for KubeResourceSource {
    fn kind(&self) -> &ResourceKind {
        &self.kind
    }

    async fn exists(&self) -> Result<bool> {
        let resources = if self.kind.group.is_empty() {
            self.client
                .list_core_api_resources(&self.kind.version)
                .await
        } else {
            self.client
                .list_api_group_resources(&self.kind.api_version())
                .await
        };
        match resources {
            Ok(list) => Ok(list.resources.iter().any(|r| r.name == self.kind.plural)),
            Err(error) => match self.classify(error) {
                SyncError::KindNotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn list(&self) -> Result<Snapshot> {
        let list = self
            .api
            .list(&ListParams::default())
            .await
            .map_err(|e| self.classify(e))?;
        let items = list
            .items
            .iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Snapshot {
            items,
            resource_version: list.metadata.resource_version,
        })
    }

    async fn watch(
        &self,
        resource_version: Option<&str>,
        timeout_seconds: u32,
    ) -> Result<ChangeStream> {
        let params = WatchParams::default().timeout(timeout_seconds);
        let version = resource_version.unwrap_or("");
        debug!(kind = %self.kind, resource_version = version, "Opening watch");
        let stream = self
            .api
            .watch(&params, version)
            .await
            .map_err(|e| self.classify(e))?;
        let kind = self.kind.to_string();
        Ok(stream
            .map_err({
                let kind = kind.clone();
                move |e| SyncError::from_kube(&kind, e)
            })
            .and_then(move |event| futures::future::ready(convert_event(&kind, event)))
            .boxed())
    }
}
