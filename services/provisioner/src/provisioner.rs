//! Boot-time acquire, attach, and prepare sequence for one resource.
//!
//! ```text
//! resolve pool ─► attached to me? ──yes──► renew, converge, prepare(reattach)
//!                      │no
//!                      ▼
//!                 cached id claimable? ──yes──┐
//!                      │no                    │
//!                      ▼                      │
//!                 reusable + claimed? ──yes───┤
//!                      │no                    │
//!                      ▼                      ▼
//!                 create + claim ─────► save, wait available, attach,
//!                                       wait attached, prepare, publish
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tracing::{info, warn};
use zoneclaim_id::{AttachmentId, ResourceId};
use zoneclaim_reconcile::cancelled;

use crate::backend::ResourceBackend;
use crate::clock::Clock;
use crate::config::Config;
use crate::converge::{wait_for_node_tag, wait_for_resource, DesiredState};
use crate::disk::Initializer;
use crate::error::ProvisionError;
use crate::lease::{ClaimOutcome, LeaseManager, LeaseRecord};
use crate::model::{CreateRequest, ResourceDescriptor, ResourceFilter, ResourceState};
use crate::state::{LocalStateCache, LocalStateRecord};
use crate::tags::TagStore;

/// How the resource was obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquisition {
    /// The backend already showed it attached to this node.
    AlreadyAttached,
    /// Recovered from the local state file.
    Cached,
    /// An existing unattached resource was claimed.
    Reused { previous: Option<LeaseRecord> },
    /// Created by this run.
    Created,
}

/// Outcome of a successful provisioning run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionReport {
    /// The resource as last observed, attached to this node.
    pub resource: ResourceDescriptor,
    pub acquisition: Acquisition,
    pub attachment_id: Option<AttachmentId>,
}

/// Drives one resource kind from nothing to attached and prepared.
pub struct ResourceProvisioner {
    config: Config,
    backend: Arc<dyn ResourceBackend>,
    tags: TagStore,
    leases: LeaseManager,
    cache: LocalStateCache,
    initializer: Arc<dyn Initializer>,
    clock: Arc<dyn Clock>,
}

impl ResourceProvisioner {
    pub fn new(
        config: Config,
        backend: Arc<dyn ResourceBackend>,
        clock: Arc<dyn Clock>,
        initializer: Arc<dyn Initializer>,
    ) -> Self {
        let tags = TagStore::new(Arc::clone(&backend), config.tag_retry);
        let leases = LeaseManager::new(
            tags.clone(),
            config.tag_keys.lease_key.clone(),
            config.lease,
            Arc::clone(&clock),
        );
        let cache = LocalStateCache::open(&config.state_file);

        Self {
            config,
            backend,
            tags,
            leases,
            cache,
            initializer,
            clock,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run the full boot sequence.
    pub async fn provision(&self, cancel: watch::Receiver<bool>) -> Result<ProvisionReport, ProvisionError> {
        let node = &self.config.node_id;
        info!(
            node_id = %node,
            zone = %self.config.zone,
            kind = %self.config.kind,
            "Provisioning resource"
        );

        let pool = self.resolve_pool(cancel.clone()).await?;
        let selector = self.config.tag_keys.selector(&pool);
        ensure_running(&cancel, "discovery")?;

        if let Some(attached) = self.find_attached(&selector).await? {
            info!(resource_id = %attached.id, "Resource already attached to this node");
            let fresh = self.awaits_preparation(&attached.id)?;
            self.leases.renew(&attached, node).await?;
            self.save(&attached, !fresh)?;

            let ready = self
                .wait(&attached.id, DesiredState::AttachedTo(node.clone()), cancel.clone())
                .await?;
            self.prepare(&ready, fresh).await?;
            self.publish(&ready).await?;

            let attachment_id = ready.attachment.as_ref().map(|a| a.attachment_id.clone());
            return Ok(ProvisionReport {
                resource: ready,
                acquisition: Acquisition::AlreadyAttached,
                attachment_id,
            });
        }

        let (resource, acquisition, fresh) = match self.from_cache().await? {
            Some((cached, initialized)) => (cached, Acquisition::Cached, !initialized),
            None => {
                let (resource, acquisition) = self.acquire(&pool, &selector).await?;
                let fresh = acquisition == Acquisition::Created;
                (resource, acquisition, fresh)
            }
        };
        self.save(&resource, !fresh)?;
        ensure_running(&cancel, "attach")?;

        if !resource.is_attached_to(node) {
            self.wait(&resource.id, DesiredState::Available, cancel.clone())
                .await?;
        }

        let attachment_id = self.backend.attach(&resource.id, node).await.map_err(|e| {
            warn!(resource_id = %resource.id, error = %e, "Attach failed");
            ProvisionError::from(e)
        })?;
        info!(
            resource_id = %resource.id,
            attachment_id = %attachment_id,
            "Attach requested"
        );

        let ready = self
            .wait(&resource.id, DesiredState::AttachedTo(node.clone()), cancel.clone())
            .await?;
        ensure_running(&cancel, "prepare")?;

        self.prepare(&ready, fresh).await?;
        self.publish(&ready).await?;

        info!(
            resource_id = %ready.id,
            acquisition = ?acquisition,
            "Resource ready"
        );
        Ok(ProvisionReport {
            resource: ready,
            acquisition,
            attachment_id: Some(attachment_id),
        })
    }

    /// Delete the resource this node holds and clear the local record.
    ///
    /// Returns the deleted id, or `None` if there was nothing this node
    /// owned.
    pub async fn release(&self, cancel: watch::Receiver<bool>) -> Result<Option<ResourceId>, ProvisionError> {
        let node = &self.config.node_id;
        let Some(record) = self.cache.load()? else {
            info!("No local state, nothing to release");
            return Ok(None);
        };

        let Some(current) = self.tags.read(&record.resource_id).await? else {
            info!(resource_id = %record.resource_id, "Resource already gone");
            self.cache.clear()?;
            return Ok(None);
        };

        let holder = self.leases.lease_of(&current).map(|l| l.holder);
        let attached_elsewhere = current.attached_node().is_some_and(|n| n != node);
        if holder.as_ref() != Some(node) || attached_elsewhere {
            warn!(
                resource_id = %current.id,
                holder = ?holder,
                attached_to = ?current.attached_node(),
                "Resource owned by another node, forgetting it"
            );
            self.cache.clear()?;
            return Ok(None);
        }

        ensure_running(&cancel, "delete")?;
        self.backend.delete(&current.id).await?;
        info!(resource_id = %current.id, "Delete requested");

        self.wait(&current.id, DesiredState::Deleted, cancel).await?;
        self.cache.clear()?;
        info!(resource_id = %current.id, "Resource released");
        Ok(Some(current.id))
    }

    async fn resolve_pool(&self, cancel: watch::Receiver<bool>) -> Result<String, ProvisionError> {
        if let Some(pool) = &self.config.pool_name {
            return Ok(pool.clone());
        }

        let key = &self.config.tag_keys.pool_key;
        info!(node_id = %self.config.node_id, key = %key, "Waiting for pool tag on node");
        let pool = wait_for_node_tag(
            &self.backend,
            &self.config.node_id,
            key,
            self.config.pool_discovery,
            cancel,
        )
        .await?;
        info!(pool = %pool, "Discovered pool");
        Ok(pool)
    }

    /// Resource of this kind already attached to this node, per the backend.
    async fn find_attached(
        &self,
        selector: &BTreeMap<String, String>,
    ) -> Result<Option<ResourceDescriptor>, ProvisionError> {
        let filter = ResourceFilter::default()
            .kind(self.config.kind)
            .tags(selector.clone())
            .attached_to(self.config.node_id.clone());

        let mut found = self.tags.describe(&filter).await?;
        match found.len() {
            0 => Ok(None),
            1 => Ok(found.pop()),
            n => Err(ProvisionError::ConfigurationConflict(format!(
                "{n} {} resources are attached to {}",
                self.config.kind, self.config.node_id
            ))),
        }
    }

    /// Claim the resource recorded in the local state file, if it is still
    /// ours to claim, along with whether it was ever prepared. Stale records
    /// are discarded.
    async fn from_cache(&self) -> Result<Option<(ResourceDescriptor, bool)>, ProvisionError> {
        let Some(record) = self.cache.load()? else {
            return Ok(None);
        };

        if record.kind != self.config.kind {
            return Err(ProvisionError::ConfigurationConflict(format!(
                "state file {} records a {} but this run manages {}",
                self.cache.path().display(),
                record.kind,
                self.config.kind
            )));
        }

        let current = match self.tags.read(&record.resource_id).await? {
            Some(r) if r.zone == self.config.zone && is_usable(r.state) => r,
            other => {
                warn!(
                    resource_id = %record.resource_id,
                    state = ?other.as_ref().map(|r| r.state),
                    "Cached resource no longer usable, discarding"
                );
                self.cache.clear()?;
                return Ok(None);
            }
        };

        match self.leases.try_claim(&current, &self.config.node_id).await? {
            ClaimOutcome::Claimed { .. } => {
                info!(
                    resource_id = %current.id,
                    initialized = record.initialized,
                    "Reusing cached resource"
                );
                Ok(Some((current, record.initialized)))
            }
            ClaimOutcome::Rejected { holder, age_secs } => {
                warn!(
                    resource_id = %current.id,
                    holder = %holder,
                    age_secs,
                    "Cached resource taken over by another node, discarding"
                );
                self.cache.clear()?;
                Ok(None)
            }
            ClaimOutcome::Conflict { attached_to } => {
                warn!(
                    resource_id = %current.id,
                    attached_to = %attached_to,
                    "Cached resource attached to another node, discarding"
                );
                self.cache.clear()?;
                Ok(None)
            }
        }
    }

    /// Claim a reusable resource, or create one.
    async fn acquire(
        &self,
        pool: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<(ResourceDescriptor, Acquisition), ProvisionError> {
        let node = &self.config.node_id;
        let fallback = match self
            .leases
            .find_reusable(self.config.kind, &self.config.zone, selector)
            .await
        {
            Ok(candidate) => match self.leases.try_claim(&candidate, node).await? {
                ClaimOutcome::Claimed { previous, .. } => {
                    info!(resource_id = %candidate.id, "Claimed reusable resource");
                    return Ok((candidate, Acquisition::Reused { previous }));
                }
                ClaimOutcome::Rejected { holder, .. } => ProvisionError::LeaseRejected {
                    resource: candidate.id.to_string(),
                    holder: holder.to_string(),
                },
                ClaimOutcome::Conflict { attached_to } => ProvisionError::LeaseRejected {
                    resource: candidate.id.to_string(),
                    holder: attached_to.to_string(),
                },
            },
            Err(e) if e.is_expected() => e,
            Err(e) => return Err(e),
        };
        info!(
            zone = %self.config.zone,
            reason = fallback.reason_code(),
            detail = %fallback,
            "Creating a new resource"
        );

        let request = CreateRequest {
            zone: self.config.zone.clone(),
            name: pool.to_string(),
            tags: selector.clone(),
            params: self.config.params.clone(),
        };
        let (created, _lease) = self.leases.create_and_claim(&request, node).await?;
        Ok((created, Acquisition::Created))
    }

    fn save(&self, resource: &ResourceDescriptor, initialized: bool) -> Result<(), ProvisionError> {
        let record = LocalStateRecord {
            resource_id: resource.id.clone(),
            kind: resource.kind,
            zone: Some(resource.zone.clone()),
            claimed_at: Some(self.clock.now_unix()),
            initialized,
        };
        self.cache.save(&record)?;
        Ok(())
    }

    /// True if the state file records `id` as created here but never
    /// prepared.
    fn awaits_preparation(&self, id: &ResourceId) -> Result<bool, ProvisionError> {
        Ok(self
            .cache
            .load()?
            .is_some_and(|r| r.resource_id == *id && !r.initialized))
    }

    /// Prepare the attached resource. A fresh resource is recorded as
    /// initialized only once preparation succeeds.
    async fn prepare(&self, resource: &ResourceDescriptor, fresh: bool) -> Result<(), ProvisionError> {
        self.initializer.prepare(resource, fresh).await?;
        if fresh {
            self.save(resource, true)?;
        }
        Ok(())
    }

    async fn wait(
        &self,
        id: &ResourceId,
        desired: DesiredState,
        cancel: watch::Receiver<bool>,
    ) -> Result<ResourceDescriptor, ProvisionError> {
        let deleting = desired == DesiredState::Deleted;
        let observed = wait_for_resource(&self.backend, id, desired, self.config.poll, cancel).await?;
        match observed.into_present() {
            Some(resource) => Ok(resource),
            None if deleting => Ok(ResourceDescriptor {
                id: id.clone(),
                kind: self.config.kind,
                zone: self.config.zone.clone(),
                state: ResourceState::Deleted,
                attachment: None,
                tags: BTreeMap::new(),
            }),
            None => Err(ProvisionError::TerminalProviderFailure(format!("{id} vanished"))),
        }
    }

    async fn publish(&self, resource: &ResourceDescriptor) -> Result<(), ProvisionError> {
        let Some(key) = &self.config.tag_keys.publish_key else {
            return Ok(());
        };
        self.tags
            .put_node(&self.config.node_id, key, resource.id.as_str())
            .await?;
        info!(key = %key, resource_id = %resource.id, "Published resource on node");
        Ok(())
    }
}

/// Sleep for a random share of `max` so nodes booted together spread their
/// first backend calls. Ends early with `Cancelled` on shutdown.
pub async fn initial_wait(max: Duration, mut cancel: watch::Receiver<bool>) -> Result<(), ProvisionError> {
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    if max_ms == 0 {
        return Ok(());
    }
    let wait = Duration::from_millis(rand::rng().random_range(0..max_ms));
    info!(wait_ms = wait.as_millis() as u64, "Initial random wait");

    tokio::select! {
        biased;
        _ = cancelled(&mut cancel) => Err(ProvisionError::Cancelled(
            "shutdown requested during initial wait".to_string(),
        )),
        _ = tokio::time::sleep(wait) => Ok(()),
    }
}

fn is_usable(state: ResourceState) -> bool {
    !matches!(
        state,
        ResourceState::Failed | ResourceState::Deleting | ResourceState::Deleted
    )
}

fn ensure_running(cancel: &watch::Receiver<bool>, step: &str) -> Result<(), ProvisionError> {
    if *cancel.borrow() {
        return Err(ProvisionError::Cancelled(format!(
            "shutdown requested before {step}"
        )));
    }
    Ok(())
}
