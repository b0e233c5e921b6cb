//! Resource tags as the shared metadata store.
//!
//! The backend offers no compare-and-swap on tags: a read followed by a
//! write can interleave with another node's write. Callers that depend on
//! exclusivity must confirm it through attach.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;
use zoneclaim_id::{NodeId, ResourceId};
use zoneclaim_reconcile::RetryPolicy;

use crate::backend::{BackendError, ResourceBackend};
use crate::model::{ResourceDescriptor, ResourceFilter};

/// Tag keys and values identifying this deployment's resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagKeys {
    pub id_key: String,
    pub id_value: Option<String>,
    pub kind_key: String,
    pub kind_value: Option<String>,
    pub pool_key: String,
    pub lease_key: String,
    pub publish_key: Option<String>,
}

impl Default for TagKeys {
    fn default() -> Self {
        Self {
            id_key: "Id".to_string(),
            id_value: None,
            kind_key: "Kind".to_string(),
            kind_value: None,
            pool_key: "autoscaling:groupName".to_string(),
            lease_key: "LeaseHold".to_string(),
            publish_key: None,
        }
    }
}

impl TagKeys {
    /// Selector tags a reusable resource must carry.
    pub fn selector(&self, pool: &str) -> BTreeMap<String, String> {
        let mut tags = BTreeMap::new();
        tags.insert(self.pool_key.clone(), pool.to_string());
        if let Some(value) = &self.id_value {
            tags.insert(self.id_key.clone(), value.clone());
        }
        if let Some(value) = &self.kind_value {
            tags.insert(self.kind_key.clone(), value.clone());
        }
        tags
    }
}

/// Read/write access to resource and node tags.
#[derive(Clone)]
pub struct TagStore {
    backend: Arc<dyn ResourceBackend>,
    retry: RetryPolicy,
}

impl TagStore {
    pub fn new(backend: Arc<dyn ResourceBackend>, retry: RetryPolicy) -> Self {
        Self { backend, retry }
    }

    pub fn backend(&self) -> &Arc<dyn ResourceBackend> {
        &self.backend
    }

    /// List resources. One-shot: transient failures surface to the caller.
    pub async fn describe(&self, filter: &ResourceFilter) -> Result<Vec<ResourceDescriptor>, BackendError> {
        self.backend.describe(filter).await
    }

    /// Fresh view of one resource, or `None` if it no longer exists.
    pub async fn read(&self, id: &ResourceId) -> Result<Option<ResourceDescriptor>, BackendError> {
        match self.describe(&ResourceFilter::by_id(id)).await {
            Ok(resources) => Ok(resources.into_iter().find(|r| r.id == *id)),
            Err(BackendError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Write one tag, retrying transient failures.
    pub async fn put(&self, id: &ResourceId, key: &str, value: &str) -> Result<(), BackendError> {
        let backend = &self.backend;
        let tags = &BTreeMap::from([(key.to_string(), value.to_string())]);

        debug!(resource_id = %id, key, value, "Writing tag");
        self.retry
            .run("write tag", BackendError::is_retryable, move || {
                backend.set_tags(id, tags)
            })
            .await
    }

    /// Write one tag on the node itself. One-shot like every call other than
    /// the lease write.
    pub async fn put_node(&self, node: &NodeId, key: &str, value: &str) -> Result<(), BackendError> {
        let tags = BTreeMap::from([(key.to_string(), value.to_string())]);
        debug!(node_id = %node, key, value, "Writing node tag");
        self.backend.set_node_tags(node, &tags).await
    }
}
