//! Cluster identity attached to every mirrored document, resolved once at startup.

// System
use std::collections::BTreeMap;

// Third Party
use k8s_openapi::api::core::v1::Node;
use kube::{
    api::{Api, ListParams},
    config::Kubeconfig,
    Client,
};
use tracing::{debug, info};

pub const UNKNOWN_CLUSTER: &str = "unknown-cluster";

/// Node labels that carry the cluster name on common distributions, in priority order.
pub const CLUSTER_NAME_LABELS: &[&str] = &[
    "cluster-name",
    "kubernetes.azure.com/cluster",
    "eks.amazonaws.com/cluster-name",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentitySource {
    NodeLabel,
    KubeconfigContext,
    Config,
    Fallback,
}

/// First node carrying one of `CLUSTER_NAME_LABELS` wins.
pub fn cluster_from_node_labels<'a, I>(nodes: I) -> Option<String>
where
    I: IntoIterator<Item = &'a BTreeMap<String, String>>,
{
    nodes.into_iter().find_map(|labels| {
        CLUSTER_NAME_LABELS
            .iter()
            .find_map(|key| labels.get(*key))
            .filter(|value| !value.is_empty())
            .cloned()
    })
}

pub fn cluster_from_kubeconfig(kubeconfig: &Kubeconfig) -> Option<String> {
    let current = kubeconfig.current_context.as_deref()?;
    kubeconfig
        .contexts
        .iter()
        .find(|named| named.name == current)
        .and_then(|named| named.context.as_ref())
        .map(|context| context.cluster.clone())
        .filter(|cluster| !cluster.is_empty())
}

/// Picks the identity from already-gathered candidates.
pub fn choose_identity(
    from_nodes: Option<String>,
    from_context: Option<String>,
    configured: Option<&str>,
) -> (String, IdentitySource) {
    if let Some(name) = from_nodes {
        return (name, IdentitySource::NodeLabel);
    }
    if let Some(name) = from_context {
        return (name, IdentitySource::KubeconfigContext);
    }
    match configured.filter(|name| !name.is_empty()) {
        Some(name) => (name.to_string(), IdentitySource::Config),
        None => (UNKNOWN_CLUSTER.to_string(), IdentitySource::Fallback),
    }
}

async fn node_label_candidate(client: &Client) -> Option<String> {
    let nodes: Api<Node> = Api::all(client.clone());
    match nodes.list(&ListParams::default()).await {
        Ok(list) => cluster_from_node_labels(
            list.items
                .iter()
                .filter_map(|node| node.metadata.labels.as_ref()),
        ),
        Err(e) => {
            debug!("Could not get cluster name from node labels: {}", e);
            None
        }
    }
}

fn kubeconfig_candidate() -> Option<String> {
    match Kubeconfig::read() {
        Ok(kubeconfig) => cluster_from_kubeconfig(&kubeconfig),
        Err(e) => {
            debug!("Could not get cluster name from kubeconfig: {}", e);
            None
        }
    }
}

/// Node labels, then the active kubeconfig context, then the configured name.
pub async fn resolve_cluster_identity(client: &Client, configured: Option<&str>) -> String {
    let from_nodes = node_label_candidate(client).await;
    let from_context = if from_nodes.is_none() {
        kubeconfig_candidate()
    } else {
        None
    };
    let (name, source) = choose_identity(from_nodes, from_context, configured);
    info!(cluster = %name, source = ?source, "Resolved cluster identity");
    name
}
