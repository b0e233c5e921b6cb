//! Integration tests for the lease claim protocol.
//!
//! Several nodes share one in-memory backend and one controllable clock, and
//! race for the same zonal pool without any coordinator.

use std::collections::BTreeMap;
use std::sync::Arc;

use proptest::prelude::*;
use zoneclaim_id::NodeId;
use zoneclaim_provisioner::model::{CreateRequest, ResourceKind, ResourceParams, VolumeParams};
use zoneclaim_provisioner::{
    ClaimOutcome, InMemoryBackend, LeaseManager, LeasePolicy, LeaseRecord, ManualClock, TagStore,
};
use zoneclaim_reconcile::RetryPolicy;

const ZONE: &str = "us-east-1a";

fn node(id: &str) -> NodeId {
    NodeId::parse(id).unwrap()
}

fn selector() -> BTreeMap<String, String> {
    BTreeMap::from([("autoscaling:groupName".to_string(), "pool-a".to_string())])
}

fn request() -> CreateRequest {
    CreateRequest {
        zone: ZONE.to_string(),
        name: "pool-a".to_string(),
        tags: selector(),
        params: ResourceParams::Volume(VolumeParams::default()),
    }
}

fn leases(backend: &Arc<InMemoryBackend>, clock: &Arc<ManualClock>) -> LeaseManager {
    let tags = TagStore::new(backend.clone(), RetryPolicy::once());
    LeaseManager::new(tags, "LeaseHold", LeasePolicy::default(), clock.clone())
}

#[tokio::test]
async fn test_pool_scenario() {
    let backend = Arc::new(InMemoryBackend::new());
    let clock = Arc::new(ManualClock::new(1000));
    let leases = leases(&backend, &clock);

    // Empty pool: A creates r1 with lease A_1000.
    let (r1, lease) = leases.create_and_claim(&request(), &node("A")).await.unwrap();
    assert_eq!(lease.encode(), "A_1000");

    // B starts 50s later: r1 is found but A's lease is fresh, so B creates r2.
    clock.set(1050);
    let found = leases
        .find_reusable(ResourceKind::Volume, ZONE, &selector())
        .await
        .unwrap();
    assert_eq!(found.id, r1.id);
    let outcome = leases.try_claim(&found, &node("B")).await.unwrap();
    assert_eq!(
        outcome,
        ClaimOutcome::Rejected {
            holder: node("A"),
            age_secs: 50,
        }
    );
    let (r2, _) = leases.create_and_claim(&request(), &node("B")).await.unwrap();
    assert_ne!(r1.id, r2.id);

    // 700s after A's claim, C takes over the oldest stale lease.
    clock.set(1700);
    let found = leases
        .find_reusable(ResourceKind::Volume, ZONE, &selector())
        .await
        .unwrap();
    assert_eq!(found.id, r1.id);
    let outcome = leases.try_claim(&found, &node("C")).await.unwrap();
    assert_eq!(
        outcome,
        ClaimOutcome::Claimed {
            lease: LeaseRecord::new(node("C"), 1700),
            previous: Some(LeaseRecord::new(node("A"), 1000)),
        }
    );

    let stored = backend.get(&r1.id).await.unwrap();
    assert_eq!(stored.tag("LeaseHold"), Some("C_1700"));
    assert_eq!(backend.calls().await.create, 2);
}

#[tokio::test]
async fn test_self_claim_refreshes_timestamp_only() {
    let backend = Arc::new(InMemoryBackend::new());
    let clock = Arc::new(ManualClock::new(1000));
    let leases = leases(&backend, &clock);

    let (r1, _) = leases.create_and_claim(&request(), &node("A")).await.unwrap();
    clock.advance(5_000);

    let outcome = leases.try_claim(&r1, &node("A")).await.unwrap();
    let ClaimOutcome::Claimed { lease, previous } = outcome else {
        panic!("self-claim must succeed, got {outcome:?}");
    };
    assert_eq!(lease.holder, node("A"));
    assert_eq!(previous.map(|p| p.holder), Some(node("A")));
}

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(future)
}

/// Seed one resource leased by A at `t0`, then let `claimant` try at `t0 + delta`.
fn claim_after(t0: i64, delta: i64, claimant: &str) -> (ClaimOutcome, Option<String>) {
    block_on(async {
        let backend = Arc::new(InMemoryBackend::new());
        let clock = Arc::new(ManualClock::new(t0));
        let leases = leases(&backend, &clock);

        let (resource, _) = leases.create_and_claim(&request(), &node("A")).await.unwrap();
        clock.advance(delta);

        let outcome = leases.try_claim(&resource, &node(claimant)).await.unwrap();
        let stored = backend
            .get(&resource.id)
            .await
            .and_then(|r| r.tag("LeaseHold").map(str::to_string));
        (outcome, stored)
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_fresh_lease_rejects_other_nodes(t0 in 0i64..2_000_000_000, delta in 0i64..=600) {
        let (outcome, stored) = claim_after(t0, delta, "B");
        prop_assert_eq!(outcome, ClaimOutcome::Rejected { holder: node("A"), age_secs: delta });
        prop_assert_eq!(stored, Some(format!("A_{t0}")));
    }

    #[test]
    fn prop_stale_lease_is_taken_over(t0 in 0i64..2_000_000_000, delta in 601i64..100_000) {
        let (outcome, stored) = claim_after(t0, delta, "B");
        let now = t0 + delta;
        prop_assert_eq!(
            outcome,
            ClaimOutcome::Claimed {
                lease: LeaseRecord::new(node("B"), now),
                previous: Some(LeaseRecord::new(node("A"), t0)),
            }
        );
        prop_assert_eq!(stored, Some(format!("B_{now}")));
    }

    #[test]
    fn prop_self_claim_always_succeeds(t0 in 0i64..2_000_000_000, delta in 0i64..100_000) {
        let (outcome, stored) = claim_after(t0, delta, "A");
        prop_assert!(outcome.is_claimed());
        prop_assert_eq!(stored, Some(format!("A_{}", t0 + delta)));
    }
}
