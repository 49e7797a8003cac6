// Third Party
use kube::api::{ApiResource, GroupVersionKind};
use serde::Deserialize;

pub const AQUA_GROUP: &str = "aquasecurity.github.io";
pub const AQUA_VERSION: &str = "v1alpha1";
pub const NAMESPACE_COLLECTION: &str = "namespaces";
pub const ALERT_COLLECTION: &str = "falco_alerts";

/// The trivy-operator report kinds mirrored when the configuration names none.
const AQUA_REPORTS: &[(&str, &str)] = &[
    ("VulnerabilityReport", "vulnerabilityreports"),
    ("ClusterComplianceReport", "clustercompliancereports"),
    ("ClusterConfigAuditReport", "clusterconfigauditreports"),
    ("ClusterInfraAssessmentReport", "clusterinfraassessmentreports"),
    ("ClusterRbacAssessmentReport", "clusterrbacassessmentreports"),
    ("ClusterSbomReport", "clustersbomreports"),
    ("ClusterVulnerabilityReport", "clustervulnerabilityreports"),
    ("ConfigAuditReport", "configauditreports"),
    ("ExposedSecretReport", "exposedsecretreports"),
    ("InfraAssessmentReport", "infraassessmentreports"),
    ("RbacAssessmentReport", "rbacassessmentreports"),
    ("SbomReport", "sbomreports"),
];

/// Static description of one watched resource kind and where its mirror lives.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ResourceKind {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    /// Overrides the target collection, which otherwise is the plural name.
    #[serde(default)]
    pub collection: Option<String>,
}

impl ResourceKind {
    pub fn new(group: &str, version: &str, kind: &str, plural: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
            plural: plural.to_string(),
            collection: None,
        }
    }

    /// Core `v1/Namespace`, mirrored into its own fixed collection.
    pub fn namespace() -> Self {
        Self {
            collection: Some(NAMESPACE_COLLECTION.to_string()),
            ..Self::new("", "v1", "Namespace", "namespaces")
        }
    }

    pub fn collection_name(&self) -> &str {
        self.collection.as_deref().unwrap_or(&self.plural)
    }

    /// Value of the `_resource_type` document field.
    pub fn resource_type(&self) -> &str {
        if self.is_namespace() {
            "namespace"
        } else {
            &self.plural
        }
    }

    pub fn is_namespace(&self) -> bool {
        self.group.is_empty() && self.plural == "namespaces"
    }

    /// `group/version`, or just `version` for the core group.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    pub fn api_resource(&self) -> ApiResource {
        let gvk = GroupVersionKind::gvk(&self.group, &self.version, &self.kind);
        ApiResource::from_gvk_with_plural(&gvk, &self.plural)
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.plural)
        } else {
            write!(f, "{}.{}", self.plural, self.group)
        }
    }
}

pub fn default_catalog() -> Vec<ResourceKind> {
    AQUA_REPORTS
        .iter()
        .map(|(kind, plural)| ResourceKind::new(AQUA_GROUP, AQUA_VERSION, kind, plural))
        .collect()
}
