//! Resource-level convergence targets built on the generic poller.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::watch;
use zoneclaim_id::{NodeId, ResourceId};
use zoneclaim_reconcile::{converge, poll, ConvergenceStatus, Observation, PollConfig};

use crate::backend::{BackendError, ResourceBackend};
use crate::error::ProvisionError;
use crate::model::{AttachmentState, ResourceDescriptor, ResourceFilter, ResourceState};

/// State to wait for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DesiredState {
    /// Created and unattached.
    Available,
    /// In use and attached to the given node.
    AttachedTo(NodeId),
    /// Gone from the provider.
    Deleted,
}

impl DesiredState {
    /// Classify one observation against this target.
    pub fn evaluate(&self, observation: &Observation<ResourceDescriptor>) -> ConvergenceStatus {
        let resource = match observation {
            Observation::Absent => {
                return match self {
                    DesiredState::Deleted => ConvergenceStatus::Converged,
                    _ => ConvergenceStatus::Diverged,
                };
            }
            Observation::Present(resource) => resource,
        };

        if resource.state == ResourceState::Failed {
            return ConvergenceStatus::Diverged;
        }

        match self {
            DesiredState::Deleted => match resource.state {
                ResourceState::Deleted => ConvergenceStatus::Converged,
                _ => ConvergenceStatus::Converging,
            },
            _ if matches!(resource.state, ResourceState::Deleting | ResourceState::Deleted) => {
                ConvergenceStatus::Diverged
            }
            DesiredState::Available => match resource.state {
                ResourceState::Available => ConvergenceStatus::Converged,
                ResourceState::Creating => ConvergenceStatus::Converging,
                _ => ConvergenceStatus::Unknown,
            },
            DesiredState::AttachedTo(node) => match resource.attachment.as_ref() {
                Some(a) if a.node_id != *node && a.state != AttachmentState::Detached => {
                    ConvergenceStatus::Diverged
                }
                Some(a)
                    if a.state == AttachmentState::Attached
                        && resource.state == ResourceState::InUse =>
                {
                    ConvergenceStatus::Converged
                }
                _ => ConvergenceStatus::Converging,
            },
        }
    }
}

/// Poll a resource until it reaches `desired`.
pub async fn wait_for_resource(
    backend: &Arc<dyn ResourceBackend>,
    id: &ResourceId,
    desired: DesiredState,
    config: PollConfig,
    cancel: watch::Receiver<bool>,
) -> Result<Observation<ResourceDescriptor>, ProvisionError> {
    let backend = backend.as_ref();
    let filter = &ResourceFilter::by_id(id);
    let fetch = move || async move {
        let mut found = backend.describe(filter).await?;
        match found.len() {
            0 => Ok(Observation::Absent),
            1 => Ok(Observation::Present(found.remove(0))),
            n => Err(BackendError::Invalid(format!("{n} resources share id {}", filter.ids[0]))),
        }
    };

    let events = poll(id.as_str(), fetch, |o| desired.evaluate(o), config, cancel);
    Ok(converge(events).await?)
}

/// Poll the node's own tags until one whose key equals or ends with
/// `key_suffix` appears, and return its value.
pub async fn wait_for_node_tag(
    backend: &Arc<dyn ResourceBackend>,
    node: &NodeId,
    key_suffix: &str,
    config: PollConfig,
    cancel: watch::Receiver<bool>,
) -> Result<String, ProvisionError> {
    let backend = backend.as_ref();
    let fetch = move || async move {
        match backend.node_tags(node).await {
            Ok(tags) => Ok(Observation::Present(tags)),
            Err(BackendError::NotFound(_)) => Ok(Observation::Absent),
            Err(e) => Err(e),
        }
    };
    let target = |o: &Observation<BTreeMap<String, String>>| match o.present() {
        Some(tags) if find_tag(tags, key_suffix).is_some() => ConvergenceStatus::Converged,
        _ => ConvergenceStatus::Converging,
    };

    let events = poll(format!("node/{node}"), fetch, target, config, cancel);
    let tags = converge(events).await?.into_present().unwrap_or_default();
    find_tag(&tags, key_suffix)
        .map(str::to_string)
        .ok_or_else(|| ProvisionError::NotFound(format!("node tag {key_suffix}")))
}

fn find_tag<'a>(tags: &'a BTreeMap<String, String>, key_suffix: &str) -> Option<&'a str> {
    tags.get(key_suffix)
        .or_else(|| {
            tags.iter()
                .find(|(k, _)| k.ends_with(key_suffix))
                .map(|(_, v)| v)
        })
        .map(String::as_str)
}
