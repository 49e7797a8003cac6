// Third Party
use serde_json::{json, Value};

// Local
use crate::catalog::ResourceKind;
use crate::error::{Result, SyncError};

/// Provenance tag stored with every mirrored document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    InitialImport,
    Added,
    Modified,
    Deleted,
    Error,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::InitialImport => "INITIAL_IMPORT",
            EventType::Added => "ADDED",
            EventType::Modified => "MODIFIED",
            EventType::Deleted => "DELETED",
            EventType::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn metadata_str<'a>(object: &'a Value, field: &str) -> Option<&'a str> {
    object
        .get("metadata")
        .and_then(|meta| meta.get(field))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

pub fn object_uid(object: &Value) -> Option<&str> {
    metadata_str(object, "uid")
}

pub fn object_name(object: &Value) -> Option<&str> {
    metadata_str(object, "name")
}

pub fn object_resource_version(object: &Value) -> Option<&str> {
    metadata_str(object, "resourceVersion")
}

/// One external object as it is written to the mirror. The payload is stored untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct MirroredRecord<'a> {
    pub uid: String,
    pub kind: &'a ResourceKind,
    pub namespace: Option<String>,
    pub name: Option<String>,
    pub cluster: &'a str,
    pub event_type: EventType,
    pub payload: Value,
}

impl<'a> MirroredRecord<'a> {
    /// Fails with `MissingUid` when the object has no `metadata.uid`.
    pub fn from_object(
        kind: &'a ResourceKind,
        cluster: &'a str,
        event_type: EventType,
        payload: Value,
    ) -> Result<Self> {
        let Some(uid) = object_uid(&payload).map(str::to_string) else {
            return Err(SyncError::MissingUid {
                kind: kind.to_string(),
                name: object_name(&payload).map(str::to_string),
            });
        };
        Ok(Self {
            uid,
            kind,
            namespace: metadata_str(&payload, "namespace").map(str::to_string),
            name: object_name(&payload).map(str::to_string),
            cluster,
            event_type,
            payload,
        })
    }

    pub fn into_document(self) -> Value {
        json!({
            "_uid": self.uid,
            "_event_type": self.event_type.as_str(),
            "_resource_type": self.kind.resource_type(),
            "_api_group": self.kind.group,
            "_kind": self.kind.kind,
            "_namespace": self.namespace,
            "_name": self.name,
            "_cluster": self.cluster,
            "data": self.payload,
        })
    }
}
