//! In-memory backend simulating an asynchronous provider.
//!
//! Provider-side transitions (creating -> available, attaching -> attached,
//! deleting -> absent) complete after a configurable number of observations,
//! so callers exercise the same polling paths they use against a real
//! provider.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;
use zoneclaim_id::{AttachmentId, NodeId, ResourceId};

use super::{BackendError, ResourceBackend};
use crate::model::{
    Attachment, AttachmentState, CreateRequest, ResourceDescriptor, ResourceFilter, ResourceKind,
    ResourceState,
};

#[derive(Debug, Clone, Copy)]
enum Transition {
    Become {
        state: ResourceState,
        attachment: Option<AttachmentState>,
    },
    Vanish,
}

#[derive(Debug)]
struct Pending {
    remaining: u32,
    transition: Transition,
}

#[derive(Debug)]
struct Entry {
    resource: ResourceDescriptor,
    pending: Option<Pending>,
}

impl Entry {
    /// Advance one observation. Returns true if the resource is now gone.
    fn observe(&mut self) -> bool {
        let Some(pending) = self.pending.as_mut() else {
            return false;
        };
        if pending.remaining > 0 {
            pending.remaining -= 1;
            return false;
        }

        let transition = pending.transition;
        self.pending = None;
        match transition {
            Transition::Become { state, attachment } => {
                self.resource.state = state;
                if let (Some(current), Some(next)) = (self.resource.attachment.as_mut(), attachment)
                {
                    current.state = next;
                }
                false
            }
            Transition::Vanish => true,
        }
    }
}

/// Call counters, for asserting on side effects.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CallCounts {
    pub describe: u32,
    pub create: u32,
    pub attach: u32,
    pub set_tags: u32,
    pub delete: u32,
}

#[derive(Debug, Default)]
struct Inner {
    resources: BTreeMap<ResourceId, Entry>,
    nodes: BTreeMap<NodeId, BTreeMap<String, String>>,
    next_id: u64,
    transient_failures: u32,
    fail_creation: bool,
    calls: CallCounts,
}

impl Inner {
    fn take_failure(&mut self) -> Result<(), BackendError> {
        if self.transient_failures > 0 {
            self.transient_failures -= 1;
            return Err(BackendError::Transient("simulated throttling".to_string()));
        }
        Ok(())
    }

    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{:06}", self.next_id)
    }

    fn interfaces_attached_to(&self, node: &NodeId) -> u32 {
        self.resources
            .values()
            .filter(|e| e.resource.kind == ResourceKind::Interface && e.resource.is_attached_to(node))
            .count() as u32
    }
}

/// Simulated provider.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    inner: Mutex<Inner>,
    settle_polls: u32,
}

impl InMemoryBackend {
    /// Create a backend whose transitions complete on the first observation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a backend whose transitions are observed `polls` times before
    /// they complete.
    pub fn with_settle_polls(polls: u32) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            settle_polls: polls,
        }
    }

    /// Register a node and its own tags.
    pub async fn add_node(&self, node: &NodeId, tags: BTreeMap<String, String>) {
        self.inner.lock().await.nodes.insert(node.clone(), tags);
    }

    /// Insert a resource as-is, with no pending transition.
    pub async fn insert(&self, resource: ResourceDescriptor) {
        self.inner.lock().await.resources.insert(
            resource.id.clone(),
            Entry {
                resource,
                pending: None,
            },
        );
    }

    /// Current view of a resource, without advancing transitions.
    pub async fn get(&self, id: &ResourceId) -> Option<ResourceDescriptor> {
        self.inner
            .lock()
            .await
            .resources
            .get(id)
            .map(|e| e.resource.clone())
    }

    /// All resources, without advancing transitions.
    pub async fn resources(&self) -> Vec<ResourceDescriptor> {
        self.inner
            .lock()
            .await
            .resources
            .values()
            .map(|e| e.resource.clone())
            .collect()
    }

    /// Simulate the holder node dying: the provider detaches the resource.
    pub async fn detach(&self, id: &ResourceId) {
        if let Some(entry) = self.inner.lock().await.resources.get_mut(id) {
            entry.resource.attachment = None;
            entry.resource.state = ResourceState::Available;
            entry.pending = None;
        }
    }

    /// Fail the next `count` describe/tag calls with a transient error.
    pub async fn fail_next(&self, count: u32) {
        self.inner.lock().await.transient_failures = count;
    }

    /// Make the next created resource end in the failed state.
    pub async fn fail_next_creation(&self) {
        self.inner.lock().await.fail_creation = true;
    }

    pub async fn calls(&self) -> CallCounts {
        self.inner.lock().await.calls
    }
}

#[async_trait]
impl ResourceBackend for InMemoryBackend {
    async fn describe(&self, filter: &ResourceFilter) -> Result<Vec<ResourceDescriptor>, BackendError> {
        let mut inner = self.inner.lock().await;
        inner.calls.describe += 1;
        inner.take_failure()?;

        let mut found = Vec::new();
        let mut vanished = Vec::new();
        for (id, entry) in inner.resources.iter_mut() {
            if !filter.matches_identity(&entry.resource) {
                continue;
            }
            if entry.observe() {
                vanished.push(id.clone());
                continue;
            }
            if filter.matches(&entry.resource) {
                found.push(entry.resource.clone());
            }
        }
        for id in vanished {
            debug!(resource_id = %id, "[MEMORY] Resource deleted");
            inner.resources.remove(&id);
        }

        Ok(found)
    }

    async fn create(&self, request: &CreateRequest) -> Result<ResourceDescriptor, BackendError> {
        if request.zone.is_empty() {
            return Err(BackendError::Invalid("zone must be set".to_string()));
        }

        let mut inner = self.inner.lock().await;
        inner.calls.create += 1;

        let kind = request.kind();
        let prefix = match kind {
            ResourceKind::Volume => "vol",
            ResourceKind::Interface => "eni",
            ResourceKind::Address => "eipalloc",
        };
        let id = ResourceId::try_from(inner.next_id(prefix))
            .map_err(|e| BackendError::Invalid(e.to_string()))?;

        let mut tags = request.tags.clone();
        tags.insert("Name".to_string(), request.name.clone());

        let resource = ResourceDescriptor {
            id: id.clone(),
            kind,
            zone: request.zone.clone(),
            state: ResourceState::Creating,
            attachment: None,
            tags,
        };

        let final_state = if std::mem::take(&mut inner.fail_creation) {
            ResourceState::Failed
        } else {
            ResourceState::Available
        };
        let pending = Pending {
            remaining: self.settle_polls,
            transition: Transition::Become {
                state: final_state,
                attachment: None,
            },
        };

        debug!(resource_id = %id, kind = %kind, zone = %request.zone, "[MEMORY] Resource created");
        inner.resources.insert(
            id,
            Entry {
                resource: resource.clone(),
                pending: Some(pending),
            },
        );

        Ok(resource)
    }

    async fn attach(&self, resource: &ResourceId, node: &NodeId) -> Result<AttachmentId, BackendError> {
        let mut inner = self.inner.lock().await;
        inner.calls.attach += 1;

        let interfaces = inner.interfaces_attached_to(node);
        let attachment_id = AttachmentId::try_from(inner.next_id("attach"))
            .map_err(|e| BackendError::Invalid(e.to_string()))?;

        let entry = inner
            .resources
            .get_mut(resource)
            .ok_or_else(|| BackendError::NotFound(resource.to_string()))?;

        if let Some(existing) = entry
            .resource
            .attachment
            .as_ref()
            .filter(|a| a.state != AttachmentState::Detached)
        {
            if existing.node_id == *node {
                return Ok(existing.attachment_id.clone());
            }
            return Err(BackendError::Conflict(format!(
                "{resource} is attached to {}",
                existing.node_id
            )));
        }

        if entry.resource.state != ResourceState::Available {
            return Err(BackendError::Invalid(format!(
                "{resource} is in state {}",
                entry.resource.state
            )));
        }

        let device_index = match entry.resource.kind {
            ResourceKind::Interface => Some(interfaces + 1),
            ResourceKind::Address if interfaces > 0 => {
                return Err(BackendError::Conflict(format!(
                    "multiple network interfaces attached to {node}; specify an interface"
                )));
            }
            _ => None,
        };

        entry.resource.attachment = Some(Attachment {
            attachment_id: attachment_id.clone(),
            node_id: node.clone(),
            state: AttachmentState::Attaching,
            device_index,
        });
        entry.pending = Some(Pending {
            remaining: self.settle_polls,
            transition: Transition::Become {
                state: ResourceState::InUse,
                attachment: Some(AttachmentState::Attached),
            },
        });

        debug!(resource_id = %resource, node_id = %node, "[MEMORY] Attach requested");
        Ok(attachment_id)
    }

    async fn set_tags(
        &self,
        resource: &ResourceId,
        tags: &BTreeMap<String, String>,
    ) -> Result<(), BackendError> {
        let mut inner = self.inner.lock().await;
        inner.calls.set_tags += 1;
        inner.take_failure()?;

        let entry = inner
            .resources
            .get_mut(resource)
            .ok_or_else(|| BackendError::NotFound(resource.to_string()))?;
        entry
            .resource
            .tags
            .extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn delete(&self, resource: &ResourceId) -> Result<(), BackendError> {
        let mut inner = self.inner.lock().await;
        inner.calls.delete += 1;

        let entry = inner
            .resources
            .get_mut(resource)
            .ok_or_else(|| BackendError::NotFound(resource.to_string()))?;
        entry.resource.state = ResourceState::Deleting;
        entry.resource.attachment = None;
        entry.pending = Some(Pending {
            remaining: self.settle_polls,
            transition: Transition::Vanish,
        });
        Ok(())
    }

    async fn node_tags(&self, node: &NodeId) -> Result<BTreeMap<String, String>, BackendError> {
        let mut inner = self.inner.lock().await;
        inner.take_failure()?;
        inner
            .nodes
            .get(node)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(node.to_string()))
    }

    async fn set_node_tags(
        &self,
        node: &NodeId,
        tags: &BTreeMap<String, String>,
    ) -> Result<(), BackendError> {
        let mut inner = self.inner.lock().await;
        inner.take_failure()?;
        inner
            .nodes
            .entry(node.clone())
            .or_default()
            .extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ResourceParams, VolumeParams};

    fn node(id: &str) -> NodeId {
        NodeId::parse(id).unwrap()
    }

    fn volume_request() -> CreateRequest {
        CreateRequest {
            zone: "us-east-1a".to_string(),
            name: "pool-a".to_string(),
            tags: BTreeMap::new(),
            params: ResourceParams::Volume(VolumeParams::default()),
        }
    }

    #[tokio::test]
    async fn test_create_settles_after_observations() {
        let backend = InMemoryBackend::with_settle_polls(1);
        let created = backend.create(&volume_request()).await.unwrap();
        assert_eq!(created.state, ResourceState::Creating);
        assert_eq!(created.tag("Name"), Some("pool-a"));

        let filter = ResourceFilter::by_id(&created.id);
        let first = backend.describe(&filter).await.unwrap();
        assert_eq!(first[0].state, ResourceState::Creating);
        let second = backend.describe(&filter).await.unwrap();
        assert_eq!(second[0].state, ResourceState::Available);
    }

    #[tokio::test]
    async fn test_attach_is_idempotent_and_detects_conflicts() {
        let backend = InMemoryBackend::new();
        let created = backend.create(&volume_request()).await.unwrap();
        backend
            .describe(&ResourceFilter::by_id(&created.id))
            .await
            .unwrap();

        let first = backend.attach(&created.id, &node("i-a")).await.unwrap();
        let again = backend.attach(&created.id, &node("i-a")).await.unwrap();
        assert_eq!(first, again);

        let err = backend.attach(&created.id, &node("i-b")).await.unwrap_err();
        assert!(matches!(err, BackendError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_attach_requires_available() {
        let backend = InMemoryBackend::with_settle_polls(3);
        let created = backend.create(&volume_request()).await.unwrap();
        let err = backend.attach(&created.id, &node("i-a")).await.unwrap_err();
        assert!(matches!(err, BackendError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_delete_vanishes() {
        let backend = InMemoryBackend::new();
        let created = backend.create(&volume_request()).await.unwrap();
        backend.delete(&created.id).await.unwrap();

        let found = backend
            .describe(&ResourceFilter::by_id(&created.id))
            .await
            .unwrap();
        assert!(found.is_empty());
        assert!(backend.get(&created.id).await.is_none());
    }

    #[tokio::test]
    async fn test_transient_failures() {
        let backend = InMemoryBackend::new();
        backend.fail_next(1).await;
        let err = backend.describe(&ResourceFilter::default()).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(backend.describe(&ResourceFilter::default()).await.is_ok());
    }
}
