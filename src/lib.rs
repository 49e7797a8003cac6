//! Mirrors Kubernetes security-posture resources, namespaces and Falco alerts into MongoDB.
//!
//! Each resource kind gets its own [`reconciler::Reconciler`]: a full snapshot import with
//! garbage collection, followed by a watch loop with bounded exponential backoff. The
//! [`orchestrator::Orchestrator`] runs one per kind under a [`supervisor::Supervisor`].

pub mod alerts;
pub mod catalog;
pub mod config;
pub mod error;
pub mod identity;
pub mod logs;
pub mod orchestrator;
pub mod reconciler;
pub mod record;
pub mod recovery;
pub mod source;
pub mod store;
pub mod supervisor;
pub mod utils;

pub use error::{Result, SyncError};
