//! Cloud resource backend interface.
//!
//! The backend is the only shared state in the fleet: resource tags double as
//! the metadata store for leases. Implementations:
//!
//! - [`HttpBackend`]: JSON gateway in front of the provider API
//! - [`InMemoryBackend`]: simulated provider for tests and local runs

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;
use zoneclaim_id::{AttachmentId, NodeId, ResourceId};

use crate::model::{CreateRequest, ResourceDescriptor, ResourceFilter};

mod http;
pub mod memory;

pub use http::HttpBackend;
pub use memory::InMemoryBackend;

/// Errors reported by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The resource (or node) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The request conflicts with provider state, e.g. attaching a resource
    /// that is attached to another node.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Network failure or throttling; the same request may succeed later.
    #[error("transient backend error: {0}")]
    Transient(String),

    /// The provider refused the request as malformed or not allowed.
    #[error("invalid request: {0}")]
    Invalid(String),
}

impl BackendError {
    /// Returns true if retrying the same request can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Capability interface over one provider's zonal resources.
#[async_trait]
pub trait ResourceBackend: Send + Sync {
    /// List resources matching the filter.
    async fn describe(&self, filter: &ResourceFilter) -> Result<Vec<ResourceDescriptor>, BackendError>;

    /// Create a resource. The returned descriptor is usually still `creating`.
    async fn create(&self, request: &CreateRequest) -> Result<ResourceDescriptor, BackendError>;

    /// Attach (or associate) a resource to a node.
    ///
    /// Attaching a resource already attached to the same node returns the
    /// existing attachment. Attaching a resource attached to a different node
    /// fails with [`BackendError::Conflict`].
    async fn attach(&self, resource: &ResourceId, node: &NodeId) -> Result<AttachmentId, BackendError>;

    /// Merge tags into a resource's tag set, overwriting existing keys.
    async fn set_tags(
        &self,
        resource: &ResourceId,
        tags: &BTreeMap<String, String>,
    ) -> Result<(), BackendError>;

    /// Delete a resource. Deletion is asynchronous; poll for absence.
    async fn delete(&self, resource: &ResourceId) -> Result<(), BackendError>;

    /// Tags of the node itself.
    async fn node_tags(&self, node: &NodeId) -> Result<BTreeMap<String, String>, BackendError>;

    /// Merge tags into the node's own tag set.
    async fn set_node_tags(
        &self,
        node: &NodeId,
        tags: &BTreeMap<String, String>,
    ) -> Result<(), BackendError>;
}
