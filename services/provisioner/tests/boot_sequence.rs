//! Integration tests for the boot sequence.
//!
//! Each test boots one or more nodes against a shared in-memory backend whose
//! transitions settle after a few polls, so every wait goes through the
//! poller. Time is paused; the lease clock is driven by hand.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::watch;
use zoneclaim_id::{AttachmentId, NodeId, ResourceId};
use zoneclaim_provisioner::disk::Initializer;
use zoneclaim_provisioner::provisioner::initial_wait;
use zoneclaim_provisioner::model::{
    Attachment, AttachmentState, CreateRequest, ResourceDescriptor, ResourceKind, ResourceState,
};
use zoneclaim_provisioner::{
    Acquisition, Config, InMemoryBackend, LeaseManager, LeasePolicy, LocalStateCache,
    LocalStateRecord, ManualClock, ProvisionError, ProvisionReport, ResourceBackend,
    ResourceProvisioner, TagStore,
};
use zoneclaim_reconcile::{PollConfig, RetryPolicy};

const ZONE: &str = "us-east-1a";
const POOL_KEY: &str = "autoscaling:groupName";

/// Records every prepare call as (resource, fresh).
#[derive(Default)]
struct RecordingInitializer {
    calls: Mutex<Vec<(ResourceId, bool)>>,
}

impl RecordingInitializer {
    fn calls(&self) -> Vec<(ResourceId, bool)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Initializer for RecordingInitializer {
    async fn prepare(&self, resource: &ResourceDescriptor, fresh: bool) -> Result<(), ProvisionError> {
        self.calls.lock().unwrap().push((resource.id.clone(), fresh));
        Ok(())
    }
}

struct FailingInitializer;

#[async_trait]
impl Initializer for FailingInitializer {
    async fn prepare(&self, resource: &ResourceDescriptor, _fresh: bool) -> Result<(), ProvisionError> {
        Err(ProvisionError::Init(format!("mkfs failed on {}", resource.id)))
    }
}

struct Fleet {
    backend: Arc<InMemoryBackend>,
    clock: Arc<ManualClock>,
    dir: TempDir,
}

impl Fleet {
    fn new() -> Self {
        Self {
            backend: Arc::new(InMemoryBackend::with_settle_polls(2)),
            clock: Arc::new(ManualClock::new(1_000)),
            dir: TempDir::new().unwrap(),
        }
    }

    fn config(&self, node: &str, kind: ResourceKind) -> Config {
        let mut config = Config::new(NodeId::parse(node).unwrap(), ZONE, kind);
        config.pool_name = Some("pool-a".to_string());
        config.state_file = self.state_file(node);
        config.poll = PollConfig::new(Duration::from_secs(5), Duration::from_secs(120));
        config.tag_keys.publish_key = Some("ZoneclaimResource".to_string());
        config
    }

    fn state_file(&self, node: &str) -> PathBuf {
        self.dir.path().join(node).join("state.json")
    }

    fn provisioner(&self, config: Config, init: &Arc<RecordingInitializer>) -> ResourceProvisioner {
        ResourceProvisioner::new(config, self.backend.clone(), self.clock.clone(), init.clone())
    }

    async fn boot(&self, node: &str) -> (Result<ProvisionReport, ProvisionError>, Arc<RecordingInitializer>) {
        let init = Arc::new(RecordingInitializer::default());
        let provisioner = self.provisioner(self.config(node, ResourceKind::Volume), &init);
        let (_tx, rx) = watch::channel(false);
        (provisioner.provision(rx).await, init)
    }

    fn record(&self, node: &str) -> Option<LocalStateRecord> {
        LocalStateCache::open(self.state_file(node)).load().unwrap()
    }

    fn cached(&self, node: &str) -> Option<ResourceId> {
        self.record(node).map(|r| r.resource_id)
    }
}

fn attached_volume(id: &str, node: &str, tags: &[(&str, &str)]) -> ResourceDescriptor {
    ResourceDescriptor {
        id: ResourceId::parse(id).unwrap(),
        kind: ResourceKind::Volume,
        zone: ZONE.to_string(),
        state: ResourceState::InUse,
        attachment: Some(Attachment {
            attachment_id: AttachmentId::parse(format!("attach-{id}").as_str()).unwrap(),
            node_id: NodeId::parse(node).unwrap(),
            state: AttachmentState::Attached,
            device_index: None,
        }),
        tags: tags
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    }
}

#[tokio::test(start_paused = true)]
async fn test_first_boot_creates_and_formats() {
    let fleet = Fleet::new();
    let (report, init) = fleet.boot("i-a").await;
    let report = report.unwrap();

    assert_eq!(report.acquisition, Acquisition::Created);
    assert_eq!(report.resource.state, ResourceState::InUse);
    assert!(report.resource.is_attached_to(&NodeId::parse("i-a").unwrap()));
    assert!(report.attachment_id.is_some());
    assert_eq!(report.resource.tag("LeaseHold"), Some("i-a_1000"));
    assert_eq!(report.resource.tag(POOL_KEY), Some("pool-a"));

    assert_eq!(init.calls(), vec![(report.resource.id.clone(), true)]);
    assert_eq!(fleet.cached("i-a"), Some(report.resource.id.clone()));
    assert_eq!(fleet.backend.calls().await.create, 1);
}

#[tokio::test(start_paused = true)]
async fn test_restart_while_attached_skips_format() {
    let fleet = Fleet::new();
    let (first, _) = fleet.boot("i-a").await;
    let first = first.unwrap();

    fleet.clock.advance(100);
    let (second, init) = fleet.boot("i-a").await;
    let second = second.unwrap();

    assert_eq!(second.acquisition, Acquisition::AlreadyAttached);
    assert_eq!(second.resource.id, first.resource.id);
    assert_eq!(init.calls(), vec![(first.resource.id.clone(), false)]);
    assert_eq!(fleet.backend.calls().await.create, 1);

    let renewed = fleet.backend.get(&first.resource.id).await.unwrap();
    assert_eq!(renewed.tag("LeaseHold"), Some("i-a_1100"));
}

#[tokio::test(start_paused = true)]
async fn test_restart_after_detach_uses_cache() {
    let fleet = Fleet::new();
    let (first, _) = fleet.boot("i-a").await;
    let first = first.unwrap();
    fleet.backend.detach(&first.resource.id).await;

    fleet.clock.advance(100);
    let (second, init) = fleet.boot("i-a").await;
    let second = second.unwrap();

    assert_eq!(second.acquisition, Acquisition::Cached);
    assert_eq!(second.resource.id, first.resource.id);
    assert_eq!(init.calls(), vec![(first.resource.id.clone(), false)]);
    assert_eq!(fleet.backend.calls().await.create, 1);
}

#[tokio::test(start_paused = true)]
async fn test_replacement_takes_over_stale_resource() {
    let fleet = Fleet::new();
    let (first, _) = fleet.boot("i-a").await;
    let first = first.unwrap();

    // i-a is terminated; the provider detaches its volume.
    fleet.backend.detach(&first.resource.id).await;
    fleet.clock.advance(700);

    let (second, init) = fleet.boot("i-b").await;
    let second = second.unwrap();

    assert_eq!(second.resource.id, first.resource.id);
    let Acquisition::Reused { previous } = &second.acquisition else {
        panic!("expected reuse, got {:?}", second.acquisition);
    };
    assert_eq!(previous.as_ref().map(|l| l.holder.as_str()), Some("i-a"));
    assert_eq!(second.resource.tag("LeaseHold"), Some("i-b_1700"));
    assert_eq!(init.calls(), vec![(first.resource.id.clone(), false)]);
    assert_eq!(fleet.backend.calls().await.create, 1);
}

#[tokio::test(start_paused = true)]
async fn test_fresh_lease_forces_new_resource() {
    let fleet = Fleet::new();
    let (first, _) = fleet.boot("i-a").await;
    let first = first.unwrap();
    fleet.backend.detach(&first.resource.id).await;
    fleet.clock.advance(50);

    let (second, init) = fleet.boot("i-b").await;
    let second = second.unwrap();

    assert_eq!(second.acquisition, Acquisition::Created);
    assert_ne!(second.resource.id, first.resource.id);
    assert_eq!(init.calls(), vec![(second.resource.id.clone(), true)]);
    assert_eq!(fleet.backend.calls().await.create, 2);
}

#[tokio::test(start_paused = true)]
async fn test_stale_cache_is_discarded() {
    let fleet = Fleet::new();
    let (first, _) = fleet.boot("i-a").await;
    let first = first.unwrap();

    // While i-a is down, i-c takes the volume over and attaches it.
    fleet.backend.detach(&first.resource.id).await;
    fleet.clock.advance(700);
    let (taken, _) = fleet.boot("i-c").await;
    assert_eq!(taken.unwrap().resource.id, first.resource.id);

    fleet.clock.advance(10);
    let (second, _) = fleet.boot("i-a").await;
    let second = second.unwrap();

    assert_eq!(second.acquisition, Acquisition::Created);
    assert_ne!(second.resource.id, first.resource.id);
    assert_eq!(fleet.cached("i-a"), Some(second.resource.id.clone()));
}

#[tokio::test(start_paused = true)]
async fn test_multiple_attachments_are_a_conflict() {
    let fleet = Fleet::new();
    let tags = [(POOL_KEY, "pool-a")];
    fleet.backend.insert(attached_volume("vol-1", "i-a", &tags)).await;
    fleet.backend.insert(attached_volume("vol-2", "i-a", &tags)).await;

    let (result, init) = fleet.boot("i-a").await;
    let err = result.unwrap_err();
    assert_eq!(err.reason_code(), "configuration_conflict");
    assert!(init.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unrelated_attachment_is_ignored() {
    let fleet = Fleet::new();
    fleet
        .backend
        .insert(attached_volume("vol-root", "i-a", &[(POOL_KEY, "other")]))
        .await;

    let (result, _) = fleet.boot("i-a").await;
    assert_eq!(result.unwrap().acquisition, Acquisition::Created);
}

#[tokio::test(start_paused = true)]
async fn test_failed_creation_is_terminal() {
    let fleet = Fleet::new();
    fleet.backend.fail_next_creation().await;

    let (result, init) = fleet.boot("i-a").await;
    let err = result.unwrap_err();
    assert_eq!(err.reason_code(), "terminal_provider_failure");
    assert!(init.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_transient_lookup_failure_aborts_boot() {
    let fleet = Fleet::new();
    let (first, _) = fleet.boot("i-a").await;
    let first = first.unwrap();
    fleet.backend.detach(&first.resource.id).await;

    // One-shot lookups are not retried; the next boot starts over.
    fleet.backend.fail_next(1).await;
    let (second, init) = fleet.boot("i-a").await;
    assert_eq!(second.unwrap_err().reason_code(), "transient_backend");
    assert!(init.calls().is_empty());
    assert_eq!(fleet.cached("i-a"), Some(first.resource.id.clone()));

    let (third, _) = fleet.boot("i-a").await;
    let third = third.unwrap();
    assert_eq!(third.acquisition, Acquisition::Cached);
    assert_eq!(third.resource.id, first.resource.id);
}

#[tokio::test(start_paused = true)]
async fn test_crash_before_prepare_formats_on_restart() {
    let fleet = Fleet::new();
    let config = fleet.config("i-a", ResourceKind::Volume);
    let leases = LeaseManager::new(
        TagStore::new(fleet.backend.clone(), RetryPolicy::once()),
        "LeaseHold",
        LeasePolicy::default(),
        fleet.clock.clone(),
    );

    // The previous run created and recorded the volume, then died.
    let request = CreateRequest {
        zone: ZONE.to_string(),
        name: "pool-a".to_string(),
        tags: config.tag_keys.selector("pool-a"),
        params: config.params.clone(),
    };
    let (created, _) = leases
        .create_and_claim(&request, &config.node_id)
        .await
        .unwrap();
    let mut pending = LocalStateRecord::new(created.id.clone(), ResourceKind::Volume);
    pending.initialized = false;
    LocalStateCache::open(fleet.state_file("i-a"))
        .save(&pending)
        .unwrap();

    fleet.clock.advance(30);
    let (report, init) = fleet.boot("i-a").await;
    let report = report.unwrap();

    assert_eq!(report.acquisition, Acquisition::Cached);
    assert_eq!(init.calls(), vec![(created.id.clone(), true)]);
    assert!(fleet.record("i-a").unwrap().initialized);
    assert_eq!(fleet.backend.calls().await.create, 1);

    fleet.backend.detach(&created.id).await;
    let (again, init) = fleet.boot("i-a").await;
    again.unwrap();
    assert_eq!(init.calls(), vec![(created.id.clone(), false)]);
}

#[tokio::test(start_paused = true)]
async fn test_failed_prepare_is_retried_as_fresh() {
    let fleet = Fleet::new();
    let init: Arc<FailingInitializer> = Arc::new(FailingInitializer);
    let provisioner = ResourceProvisioner::new(
        fleet.config("i-a", ResourceKind::Volume),
        fleet.backend.clone(),
        fleet.clock.clone(),
        init,
    );
    let (_tx, rx) = watch::channel(false);
    let err = provisioner.provision(rx).await.unwrap_err();
    assert_eq!(err.reason_code(), "init_failed");

    let pending = fleet.record("i-a").unwrap();
    assert!(!pending.initialized);

    // Still attached from the failed run.
    let (report, init) = fleet.boot("i-a").await;
    let report = report.unwrap();
    assert_eq!(report.acquisition, Acquisition::AlreadyAttached);
    assert_eq!(init.calls(), vec![(pending.resource_id.clone(), true)]);
    assert!(fleet.record("i-a").unwrap().initialized);
}

#[tokio::test(start_paused = true)]
async fn test_pool_discovered_from_node_tags() {
    let fleet = Fleet::new();
    let node = NodeId::parse("i-a").unwrap();
    fleet
        .backend
        .add_node(
            &node,
            BTreeMap::from([(format!("aws:{POOL_KEY}"), "pool-x".to_string())]),
        )
        .await;

    let mut config = fleet.config("i-a", ResourceKind::Volume);
    config.pool_name = None;
    let init = Arc::new(RecordingInitializer::default());
    let (_tx, rx) = watch::channel(false);
    let report = fleet.provisioner(config, &init).provision(rx).await.unwrap();

    assert_eq!(report.resource.tag(POOL_KEY), Some("pool-x"));
    assert_eq!(report.resource.tag("Name"), Some("pool-x"));
}

#[tokio::test(start_paused = true)]
async fn test_publishes_resource_on_node() {
    let fleet = Fleet::new();
    let node = NodeId::parse("i-a").unwrap();
    fleet.backend.add_node(&node, BTreeMap::new()).await;

    let (report, _) = fleet.boot("i-a").await;
    let report = report.unwrap();

    let tags = fleet.backend.node_tags(&node).await.unwrap();
    assert_eq!(
        tags.get("ZoneclaimResource").map(String::as_str),
        Some(report.resource.id.as_str())
    );
}

#[tokio::test(start_paused = true)]
async fn test_initial_wait_honours_shutdown() {
    let (tx, rx) = watch::channel(false);
    tx.send(true).unwrap();

    let started = tokio::time::Instant::now();
    let err = initial_wait(Duration::from_secs(3_600), rx).await.unwrap_err();
    assert_eq!(err.reason_code(), "cancelled");
    assert_eq!(started.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn test_initial_wait_stays_within_bound() {
    let (_tx, rx) = watch::channel(false);
    let started = tokio::time::Instant::now();
    initial_wait(Duration::from_secs(30), rx).await.unwrap();
    assert!(started.elapsed() <= Duration::from_secs(30));
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_before_start() {
    let fleet = Fleet::new();
    let init = Arc::new(RecordingInitializer::default());
    let provisioner = fleet.provisioner(fleet.config("i-a", ResourceKind::Volume), &init);

    let (tx, rx) = watch::channel(false);
    tx.send(true).unwrap();
    let err = provisioner.provision(rx).await.unwrap_err();
    assert_eq!(err.reason_code(), "cancelled");
    assert_eq!(fleet.backend.calls().await.create, 0);
}

#[tokio::test(start_paused = true)]
async fn test_interface_gets_next_device_index() {
    let fleet = Fleet::new();
    let init = Arc::new(RecordingInitializer::default());
    let (_tx, rx) = watch::channel(false);
    let report = fleet
        .provisioner(fleet.config("i-a", ResourceKind::Interface), &init)
        .provision(rx)
        .await
        .unwrap();

    let attachment = report.resource.attachment.unwrap();
    assert_eq!(attachment.device_index, Some(1));
}

#[tokio::test(start_paused = true)]
async fn test_address_with_multiple_interfaces_is_a_conflict() {
    let fleet = Fleet::new();
    let init = Arc::new(RecordingInitializer::default());

    let (_tx, rx) = watch::channel(false);
    let mut interface = fleet.config("i-a", ResourceKind::Interface);
    interface.state_file = fleet.dir.path().join("eni.json");
    fleet
        .provisioner(interface, &init)
        .provision(rx.clone())
        .await
        .unwrap();

    let err = fleet
        .provisioner(fleet.config("i-a", ResourceKind::Address), &init)
        .provision(rx)
        .await
        .unwrap_err();
    assert_eq!(err.reason_code(), "configuration_conflict");
}

#[tokio::test(start_paused = true)]
async fn test_release_deletes_and_forgets() {
    let fleet = Fleet::new();
    let (first, _) = fleet.boot("i-a").await;
    let first = first.unwrap();

    let init = Arc::new(RecordingInitializer::default());
    let provisioner = fleet.provisioner(fleet.config("i-a", ResourceKind::Volume), &init);
    let (_tx, rx) = watch::channel(false);
    let released = provisioner.release(rx.clone()).await.unwrap();

    assert_eq!(released, Some(first.resource.id.clone()));
    assert!(fleet.backend.get(&first.resource.id).await.is_none());
    assert!(!fleet.state_file("i-a").exists());

    // Nothing left to release.
    assert_eq!(provisioner.release(rx).await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn test_release_refuses_foreign_resource() {
    let fleet = Fleet::new();
    let (first, _) = fleet.boot("i-a").await;
    let first = first.unwrap();
    fleet.backend.detach(&first.resource.id).await;
    fleet.clock.advance(700);
    fleet.boot("i-b").await.0.unwrap();

    let init = Arc::new(RecordingInitializer::default());
    let provisioner = fleet.provisioner(fleet.config("i-a", ResourceKind::Volume), &init);
    let (_tx, rx) = watch::channel(false);
    assert_eq!(provisioner.release(rx).await.unwrap(), None);
    assert!(fleet.backend.get(&first.resource.id).await.is_some());
    assert_eq!(fleet.cached("i-a"), None);
}
