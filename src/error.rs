//! Error types shared by the reconcilers, the alert ingestor and the store backends.

use thiserror::Error;

/// Coarse classification used by the retry loops to decide what to do with a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The object cannot be mirrored (e.g. it has no uid). Skip it and move on.
    MalformedInput,
    /// Network, timeout or server-side failure. Back off and retry.
    TransientTransport,
    /// The resource kind is not served by the API server. Retire the loop.
    PermanentAbsence,
    /// A log line could not be turned into an alert.
    ParseFailure,
    /// A single store write failed.
    StoreFailure,
    /// Startup configuration is unusable.
    Configuration,
}

#[derive(Error, Debug)]
pub enum SyncError {
    /// The object carries no `metadata.uid`.
    #[error("{kind} object {name:?} has no metadata.uid")]
    MissingUid { kind: String, name: Option<String> },

    /// The resource kind is not registered with the API server.
    #[error("Resource kind not found: {0}")]
    KindNotFound(String),

    /// The watch resource version is too old to resume from.
    #[error("Resource version expired for {kind}: {message}")]
    Expired { kind: String, message: String },

    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Error status delivered inside an open watch stream
    #[error("Watch stream error for {kind}: {message} (code {code})")]
    WatchStream {
        kind: String,
        message: String,
        code: u16,
    },

    /// A log line was rejected by the alert parser.
    #[error("Could not parse log line: {0}")]
    Parse(String),

    /// MongoDB driver error
    #[error("Store error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    /// A document could not be converted to BSON
    #[error("BSON conversion error: {0}")]
    Bson(#[from] mongodb::bson::ser::Error),

    /// Store error reported by a non-Mongo backend
    #[error("Store error: {0}")]
    Store(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for mirror operations
pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            SyncError::MissingUid { .. } => ErrorCategory::MalformedInput,
            SyncError::KindNotFound(_) => ErrorCategory::PermanentAbsence,
            SyncError::Expired { .. } | SyncError::Kube(_) | SyncError::WatchStream { .. } => {
                ErrorCategory::TransientTransport
            }
            SyncError::Parse(_) | SyncError::Serialization(_) => ErrorCategory::ParseFailure,
            SyncError::Mongo(_) | SyncError::Bson(_) | SyncError::Store(_) => {
                ErrorCategory::StoreFailure
            }
            SyncError::InvalidConfig(_) | SyncError::Io(_) => ErrorCategory::Configuration,
        }
    }

    /// True when retrying can never succeed because the kind is gone.
    pub fn is_permanent(&self) -> bool {
        self.category() == ErrorCategory::PermanentAbsence
    }

    /// Check if this error is worth a backoff-and-retry cycle
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::TransientTransport | ErrorCategory::StoreFailure
        )
    }

    /// Whether the watch cursor must be discarded and a fresh snapshot taken.
    pub fn invalidates_cursor(&self) -> bool {
        matches!(self, SyncError::Expired { .. })
    }

    /// Classify a kube client error for the given kind by HTTP status.
    pub fn from_kube(kind: &str, error: kube::Error) -> Self {
        match error {
            kube::Error::Api(kube::error::ErrorResponse { code: 404, .. }) => {
                SyncError::KindNotFound(kind.to_string())
            }
            kube::Error::Api(kube::error::ErrorResponse {
                code: 410, message, ..
            }) => SyncError::Expired {
                kind: kind.to_string(),
                message,
            },
            other => SyncError::Kube(other),
        }
    }

    /// Classify an error status received inside a watch stream.
    pub fn from_watch_status(kind: &str, response: kube::error::ErrorResponse) -> Self {
        match response.code {
            404 => SyncError::KindNotFound(kind.to_string()),
            410 => SyncError::Expired {
                kind: kind.to_string(),
                message: response.message,
            },
            code => SyncError::WatchStream {
                kind: kind.to_string(),
                message: response.message,
                code,
            },
        }
    }
}
