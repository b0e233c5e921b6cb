//! Resource model shared by the backend, lease, and provisioning layers.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use zoneclaim_id::{AttachmentId, NodeId, ResourceId};

/// Kind of zonal resource managed by one provisioner run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Block volume.
    Volume,
    /// Network interface.
    Interface,
    /// Elastic (floating) IP address.
    Address,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Volume => "volume",
            Self::Interface => "interface",
            Self::Address => "address",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "volume" => Ok(Self::Volume),
            "interface" => Ok(Self::Interface),
            "address" => Ok(Self::Address),
            other => Err(format!("unknown resource kind: {other}")),
        }
    }
}

/// Provider-side lifecycle state.
///
/// ```text
/// creating -> available -> in-use -> deleting -> (absent)
///                 ^           |
///                 +-----------+  (detach)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceState {
    Creating,
    Available,
    InUse,
    Deleting,
    Deleted,
    /// Terminal: creation or deletion failed on the provider side.
    Failed,
}

impl ResourceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Available => "available",
            Self::InUse => "in-use",
            Self::Deleting => "deleting",
            Self::Deleted => "deleted",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attachment sub-state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttachmentState {
    Attaching,
    Attached,
    Detaching,
    Detached,
}

/// Binding of a resource to a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub attachment_id: AttachmentId,
    pub node_id: NodeId,
    pub state: AttachmentState,

    /// Interface slot on the node, for network interfaces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_index: Option<u32>,
}

/// A zonal resource as reported by the backend.
///
/// `zone` never changes after creation; only `tags` are mutated by this
/// system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub id: ResourceId,
    pub kind: ResourceKind,
    pub zone: String,
    pub state: ResourceState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,

    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl ResourceDescriptor {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    /// Node the resource is attached to, ignoring detached leftovers.
    pub fn attached_node(&self) -> Option<&NodeId> {
        self.attachment
            .as_ref()
            .filter(|a| a.state != AttachmentState::Detached)
            .map(|a| &a.node_id)
    }

    pub fn is_attached_to(&self, node: &NodeId) -> bool {
        self.attached_node() == Some(node)
    }

    /// True if every selector tag is present with the same value.
    pub fn has_tags(&self, selector: &BTreeMap<String, String>) -> bool {
        selector
            .iter()
            .all(|(k, v)| self.tags.get(k).is_some_and(|cur| cur == v))
    }
}

/// Query over the backend's resources. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceFilter {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ids: Vec<ResourceId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ResourceKind>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub states: Vec<ResourceState>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attached_to: Option<NodeId>,
}

impl ResourceFilter {
    pub fn by_id(id: &ResourceId) -> Self {
        Self {
            ids: vec![id.clone()],
            ..Self::default()
        }
    }

    pub fn kind(mut self, kind: ResourceKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = Some(zone.into());
        self
    }

    pub fn states(mut self, states: impl IntoIterator<Item = ResourceState>) -> Self {
        self.states = states.into_iter().collect();
        self
    }

    pub fn tags(mut self, tags: BTreeMap<String, String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn attached_to(mut self, node: NodeId) -> Self {
        self.attached_to = Some(node);
        self
    }

    /// Evaluate every criterion except `states`.
    pub fn matches_identity(&self, resource: &ResourceDescriptor) -> bool {
        (self.ids.is_empty() || self.ids.contains(&resource.id))
            && self.kind.is_none_or(|k| k == resource.kind)
            && self.zone.as_deref().is_none_or(|z| z == resource.zone)
            && resource.has_tags(&self.tags)
            && self
                .attached_to
                .as_ref()
                .is_none_or(|node| resource.is_attached_to(node))
    }

    pub fn matches(&self, resource: &ResourceDescriptor) -> bool {
        self.matches_identity(resource)
            && (self.states.is_empty() || self.states.contains(&resource.state))
    }
}

/// Volume creation parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeParams {
    pub volume_type: String,
    pub size_gb: u32,
    pub iops: u32,
    pub throughput: u32,
    pub encrypted: bool,
}

impl Default for VolumeParams {
    fn default() -> Self {
        Self {
            volume_type: "gp3".to_string(),
            size_gb: 300,
            iops: 3000,
            throughput: 500,
            encrypted: true,
        }
    }
}

/// Network interface creation parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet_id: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub security_group_ids: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Kind-specific creation parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceParams {
    Volume(VolumeParams),
    Interface(InterfaceParams),
    Address,
}

impl ResourceParams {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Volume(_) => ResourceKind::Volume,
            Self::Interface(_) => ResourceKind::Interface,
            Self::Address => ResourceKind::Address,
        }
    }
}

/// Request to create a resource in a zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRequest {
    pub zone: String,
    pub name: String,
    pub tags: BTreeMap<String, String>,
    pub params: ResourceParams,
}

impl CreateRequest {
    pub fn kind(&self) -> ResourceKind {
        self.params.kind()
    }
}
