//! Tag-encoded leases over zonal resources.
//!
//! A lease is a single tag whose value is `<holder>_<unix-seconds>`. Holders
//! never delete a lease; they overwrite it. Claims are optimistic: the read
//! and the write are not atomic, and the attach that follows a claim is what
//! actually arbitrates between two nodes that claimed at the same moment.
//!
//! ```text
//! lease tag           holder == me   now - ts > timeout   outcome
//! -----------------   ------------   ------------------   --------
//! absent/malformed         -                 -            Claimed
//! present                 yes                -            Claimed
//! present                 no                yes           Claimed (takeover)
//! present                 no                no            Rejected
//! ```

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};
use zoneclaim_id::NodeId;

use crate::backend::BackendError;
use crate::clock::Clock;
use crate::error::ProvisionError;
use crate::model::{CreateRequest, ResourceDescriptor, ResourceFilter, ResourceKind, ResourceState};
use crate::tags::TagStore;

/// Default time after which an unrenewed lease may be taken over.
pub const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(600);

/// Errors parsing a lease tag value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LeaseParseError {
    #[error("lease value {0:?} has no '_' separator")]
    MissingSeparator(String),

    #[error("lease value {value:?} has invalid timestamp: {reason}")]
    InvalidTimestamp { value: String, reason: String },

    #[error("lease value {value:?} has invalid holder: {reason}")]
    InvalidHolder { value: String, reason: String },
}

/// Decoded lease tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRecord {
    pub holder: NodeId,
    /// Unix seconds at which the lease was written.
    pub acquired_at: i64,
}

impl LeaseRecord {
    pub fn new(holder: NodeId, acquired_at: i64) -> Self {
        Self {
            holder,
            acquired_at,
        }
    }

    /// Parse `<holder>_<unix-seconds>`. The holder may itself contain `_`;
    /// only the last separator counts.
    pub fn parse(value: &str) -> Result<Self, LeaseParseError> {
        let (holder, ts) = value
            .rsplit_once('_')
            .ok_or_else(|| LeaseParseError::MissingSeparator(value.to_string()))?;

        let acquired_at = ts
            .parse::<i64>()
            .map_err(|e| LeaseParseError::InvalidTimestamp {
                value: value.to_string(),
                reason: e.to_string(),
            })?;
        let holder = NodeId::parse(holder).map_err(|e| LeaseParseError::InvalidHolder {
            value: value.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            holder,
            acquired_at,
        })
    }

    pub fn encode(&self) -> String {
        self.to_string()
    }

    /// Seconds since the lease was written. Negative under clock skew.
    pub fn age(&self, now: i64) -> i64 {
        now.saturating_sub(self.acquired_at)
    }

    /// True if the lease has gone unrenewed for strictly longer than `timeout`.
    pub fn is_stale(&self, now: i64, timeout: Duration) -> bool {
        self.age(now) > i64::try_from(timeout.as_secs()).unwrap_or(i64::MAX)
    }
}

impl fmt::Display for LeaseRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.holder, self.acquired_at)
    }
}

impl FromStr for LeaseRecord {
    type Err = LeaseParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Lease tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeasePolicy {
    pub timeout: Duration,
}

impl Default for LeasePolicy {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_LEASE_TIMEOUT,
        }
    }
}

/// Result of a claim attempt. Every call site handles all three.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This node now holds the lease. `previous` is the lease that was
    /// overwritten, if any.
    Claimed {
        lease: LeaseRecord,
        previous: Option<LeaseRecord>,
    },

    /// Another node holds a fresh lease.
    Rejected { holder: NodeId, age_secs: i64 },

    /// The resource is attached to another node, whatever the tag says.
    Conflict { attached_to: NodeId },
}

impl ClaimOutcome {
    pub fn is_claimed(&self) -> bool {
        matches!(self, Self::Claimed { .. })
    }
}

/// Claim, renewal, and takeover of resources.
#[derive(Clone)]
pub struct LeaseManager {
    tags: TagStore,
    lease_key: String,
    policy: LeasePolicy,
    clock: Arc<dyn Clock>,
}

impl LeaseManager {
    pub fn new(tags: TagStore, lease_key: impl Into<String>, policy: LeasePolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            tags,
            lease_key: lease_key.into(),
            policy,
            clock,
        }
    }

    pub fn policy(&self) -> LeasePolicy {
        self.policy
    }

    /// Lease currently recorded on a resource. Malformed values read as
    /// absent.
    pub fn lease_of(&self, resource: &ResourceDescriptor) -> Option<LeaseRecord> {
        let value = resource.tag(&self.lease_key)?;
        match LeaseRecord::parse(value) {
            Ok(lease) => Some(lease),
            Err(e) => {
                warn!(
                    resource_id = %resource.id,
                    error = %e,
                    "Ignoring malformed lease tag"
                );
                None
            }
        }
    }

    /// Find an unattached, available resource in `zone` carrying every
    /// selector tag.
    ///
    /// Candidates are ordered so the first one is the best bet: unleased
    /// first, then stale leases oldest first, then fresh leases. Fails with
    /// [`ProvisionError::NotFound`] if there is no candidate at all.
    pub async fn find_reusable(
        &self,
        kind: ResourceKind,
        zone: &str,
        selector: &std::collections::BTreeMap<String, String>,
    ) -> Result<ResourceDescriptor, ProvisionError> {
        let filter = ResourceFilter::default()
            .kind(kind)
            .zone(zone)
            .states([ResourceState::Available])
            .tags(selector.clone());

        let now = self.clock.now_unix();
        let mut candidates: Vec<(u8, i64, ResourceDescriptor)> = self
            .tags
            .describe(&filter)
            .await?
            .into_iter()
            .filter(|r| r.attached_node().is_none())
            .map(|r| {
                let (rank, ts) = match self.lease_of(&r) {
                    None => (0, i64::MIN),
                    Some(lease) if lease.is_stale(now, self.policy.timeout) => (1, lease.acquired_at),
                    Some(lease) => (2, lease.acquired_at),
                };
                (rank, ts, r)
            })
            .collect();

        candidates.sort_by(|a, b| match a.0.cmp(&b.0) {
            Ordering::Equal => a.1.cmp(&b.1).then_with(|| a.2.id.cmp(&b.2.id)),
            other => other,
        });

        match candidates.into_iter().next() {
            Some((_, _, resource)) => {
                debug!(resource_id = %resource.id, zone, "Found reusable resource");
                Ok(resource)
            }
            None => {
                info!(kind = %kind, zone, "No reusable resource");
                Err(ProvisionError::NotFound(format!(
                    "no available {kind} in {zone} matching selector"
                )))
            }
        }
    }

    /// Attempt to take the lease on `resource` for `holder`.
    ///
    /// The lease is re-read from the backend first so a stale descriptor
    /// from discovery cannot hide a claim made in the meantime.
    pub async fn try_claim(
        &self,
        resource: &ResourceDescriptor,
        holder: &NodeId,
    ) -> Result<ClaimOutcome, ProvisionError> {
        let current = self
            .tags
            .read(&resource.id)
            .await?
            .ok_or_else(|| ProvisionError::NotFound(resource.id.to_string()))?;

        if let Some(node) = current.attached_node().filter(|n| *n != holder) {
            info!(
                resource_id = %current.id,
                attached_to = %node,
                "Resource attached to another node"
            );
            return Ok(ClaimOutcome::Conflict {
                attached_to: node.clone(),
            });
        }

        let now = self.clock.now_unix();
        let previous = self.lease_of(&current);
        if let Some(lease) = &previous {
            if lease.holder != *holder && !lease.is_stale(now, self.policy.timeout) {
                info!(
                    resource_id = %current.id,
                    holder = %lease.holder,
                    age_secs = lease.age(now),
                    "Lease held by another node"
                );
                return Ok(ClaimOutcome::Rejected {
                    holder: lease.holder.clone(),
                    age_secs: lease.age(now),
                });
            }
        }

        let lease = self.write(&current, holder, now).await?;
        match &previous {
            Some(old) if old.holder != *holder => info!(
                resource_id = %current.id,
                previous_holder = %old.holder,
                previous_age_secs = old.age(now),
                "Took over stale lease"
            ),
            Some(_) => debug!(resource_id = %current.id, "Renewed own lease"),
            None => info!(resource_id = %current.id, "Claimed unleased resource"),
        }

        Ok(ClaimOutcome::Claimed { lease, previous })
    }

    /// Create a resource already carrying this node's lease.
    pub async fn create_and_claim(
        &self,
        request: &CreateRequest,
        holder: &NodeId,
    ) -> Result<(ResourceDescriptor, LeaseRecord), ProvisionError> {
        let lease = LeaseRecord::new(holder.clone(), self.clock.now_unix());
        let mut request = request.clone();
        request.tags.insert(self.lease_key.clone(), lease.encode());

        let created = self.tags.backend().create(&request).await?;
        info!(
            resource_id = %created.id,
            kind = %created.kind,
            zone = %created.zone,
            lease = %lease,
            "Created resource"
        );

        Ok((created, lease))
    }

    /// Overwrite the lease unconditionally. Used when an attachment already
    /// proves this node owns the resource.
    pub async fn renew(
        &self,
        resource: &ResourceDescriptor,
        holder: &NodeId,
    ) -> Result<LeaseRecord, ProvisionError> {
        let now = self.clock.now_unix();
        self.write(resource, holder, now).await
    }

    async fn write(
        &self,
        resource: &ResourceDescriptor,
        holder: &NodeId,
        now: i64,
    ) -> Result<LeaseRecord, ProvisionError> {
        let lease = LeaseRecord::new(holder.clone(), now);
        self.tags
            .put(&resource.id, &self.lease_key, &lease.encode())
            .await
            .map_err(|e| match e {
                BackendError::NotFound(detail) => ProvisionError::NotFound(detail),
                other => other.into(),
            })?;
        Ok(lease)
    }
}
