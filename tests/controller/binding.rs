use bindery::bindery::api::types::{
    AccessMode, ClaimPhase, ClaimReference, ReclaimPolicy, VolumePhase,
};
use bindery::bindery::plugin::PluginRegistry;

use crate::support::{claim, claim_with_modes, eventually, volume, Cluster, SETTLE};

#[tokio::test]
async fn straight_bind_establishes_both_halves() {
    let cluster = Cluster::start(PluginRegistry::new());
    cluster
        .fake
        .seed_volume(volume("pv1", "10Gi", ReclaimPolicy::Retain));
    cluster.fake.seed_claim(claim("ns", "c1", "5Gi"));

    let fake = cluster.fake.clone();
    eventually("claim c1 to be bound", move || {
        fake.claim_snapshot("ns", "c1")
            .map(|c| c.status.phase == ClaimPhase::Bound)
            .unwrap_or(false)
    })
    .await;

    let bound = cluster.fake.claim_snapshot("ns", "c1").unwrap();
    assert_eq!(bound.bound_volume(), Some("pv1"));

    let fake = cluster.fake.clone();
    eventually("volume pv1 to report Bound", move || {
        fake.volume_snapshot("pv1")
            .map(|v| v.status.phase == VolumePhase::Bound)
            .unwrap_or(false)
    })
    .await;
    let pv = cluster.fake.volume_snapshot("pv1").unwrap();
    assert_eq!(
        pv.spec.claim_ref,
        Some(ClaimReference {
            namespace: "ns".to_string(),
            name: "c1".to_string(),
        })
    );

    cluster.shutdown().await;
}

#[tokio::test]
async fn best_fit_selects_the_smallest_sufficient_volume() {
    let cluster = Cluster::start(PluginRegistry::new());
    cluster
        .fake
        .seed_volume(volume("pv-1g", "1Gi", ReclaimPolicy::Retain));
    cluster
        .fake
        .seed_volume(volume("pv-5g", "5Gi", ReclaimPolicy::Retain));
    cluster
        .fake
        .seed_volume(volume("pv-10g", "10Gi", ReclaimPolicy::Retain));
    cluster.fake.seed_claim(claim("ns", "c", "2Gi"));

    let fake = cluster.fake.clone();
    eventually("claim to bind to pv-5g", move || {
        fake.claim_snapshot("ns", "c")
            .map(|c| c.bound_volume() == Some("pv-5g"))
            .unwrap_or(false)
    })
    .await;

    // The others stay Available.
    let fake = cluster.fake.clone();
    eventually("other volumes to stay available", move || {
        ["pv-1g", "pv-10g"].iter().all(|name| {
            fake.volume_snapshot(name)
                .map(|v| v.status.phase == VolumePhase::Available && v.spec.claim_ref.is_none())
                .unwrap_or(false)
        })
    })
    .await;

    cluster.shutdown().await;
}

#[tokio::test]
async fn exact_capacity_request_matches() {
    let cluster = Cluster::start(PluginRegistry::new());
    cluster
        .fake
        .seed_volume(volume("pv-exact", "5Gi", ReclaimPolicy::Retain));
    cluster.fake.seed_claim(claim("ns", "c", "5Gi"));

    let fake = cluster.fake.clone();
    eventually("exact-fit claim to bind", move || {
        fake.claim_snapshot("ns", "c")
            .map(|c| c.bound_volume() == Some("pv-exact"))
            .unwrap_or(false)
    })
    .await;

    cluster.shutdown().await;
}

#[tokio::test]
async fn unsatisfiable_mode_request_stays_pending() {
    let cluster = Cluster::start(PluginRegistry::new());
    cluster
        .fake
        .seed_volume(volume("pv-rwo", "10Gi", ReclaimPolicy::Retain));
    cluster.fake.seed_claim(claim_with_modes(
        "ns",
        "c-many",
        "1Gi",
        &[AccessMode::ReadWriteOnce, AccessMode::ReadWriteMany],
    ));

    // Give the controller time to (not) act.
    tokio::time::sleep(SETTLE).await;

    let parked = cluster.fake.claim_snapshot("ns", "c-many").unwrap();
    assert_eq!(parked.status.phase, ClaimPhase::Pending);
    assert!(parked.bound_volume().is_none());
    let pv = cluster.fake.volume_snapshot("pv-rwo").unwrap();
    assert!(pv.spec.claim_ref.is_none());

    cluster.shutdown().await;
}

#[tokio::test]
async fn prestamped_volume_goes_to_its_chosen_claim() {
    let cluster = Cluster::start(PluginRegistry::new());

    let mut pv = volume("pv-x", "10Gi", ReclaimPolicy::Retain);
    pv.spec.claim_ref = Some(ClaimReference {
        namespace: "ns".to_string(),
        name: "c-picked".to_string(),
    });
    cluster.fake.seed_volume(pv);

    // A crowd of identical claims races for the single volume.
    for i in 1..=20 {
        cluster.fake.seed_claim(claim("ns", &format!("c-{i}"), "5Gi"));
    }
    cluster.fake.seed_claim(claim("ns", "c-picked", "5Gi"));

    let fake = cluster.fake.clone();
    eventually("c-picked to win the volume", move || {
        fake.claim_snapshot("ns", "c-picked")
            .map(|c| c.status.phase == ClaimPhase::Bound && c.bound_volume() == Some("pv-x"))
            .unwrap_or(false)
    })
    .await;

    // Everybody else stays Pending and unbound.
    tokio::time::sleep(SETTLE).await;
    for i in 1..=20 {
        let loser = cluster.fake.claim_snapshot("ns", &format!("c-{i}")).unwrap();
        assert_eq!(loser.status.phase, ClaimPhase::Pending, "claim c-{i}");
        assert!(loser.bound_volume().is_none(), "claim c-{i}");
    }

    let pv = cluster.fake.volume_snapshot("pv-x").unwrap();
    assert_eq!(
        pv.spec.claim_ref.as_ref().map(ToString::to_string),
        Some("ns/c-picked".to_string())
    );

    let fake = cluster.fake.clone();
    eventually("pv-x to report Bound", move || {
        fake.volume_snapshot("pv-x")
            .map(|v| v.status.phase == VolumePhase::Bound)
            .unwrap_or(false)
    })
    .await;

    cluster.shutdown().await;
}

#[tokio::test]
async fn two_claims_racing_for_one_volume_leave_one_pending() {
    let cluster = Cluster::start(PluginRegistry::new());
    cluster
        .fake
        .seed_volume(volume("pv-solo", "10Gi", ReclaimPolicy::Retain));
    cluster.fake.seed_claim(claim("ns", "c-a", "5Gi"));
    cluster.fake.seed_claim(claim("ns", "c-b", "5Gi"));

    let fake = cluster.fake.clone();
    eventually("exactly one claim to win", move || {
        let a = fake.claim_snapshot("ns", "c-a").unwrap();
        let b = fake.claim_snapshot("ns", "c-b").unwrap();
        let winners = [&a, &b]
            .iter()
            .filter(|c| c.status.phase == ClaimPhase::Bound)
            .count();
        winners == 1
    })
    .await;

    tokio::time::sleep(SETTLE).await;
    let a = cluster.fake.claim_snapshot("ns", "c-a").unwrap();
    let b = cluster.fake.claim_snapshot("ns", "c-b").unwrap();
    let bound: Vec<_> = [("c-a", &a), ("c-b", &b)]
        .into_iter()
        .filter(|(_, c)| c.bound_volume().is_some())
        .collect();
    assert_eq!(bound.len(), 1, "exactly one claim may hold the volume");

    cluster.shutdown().await;
}

#[tokio::test]
async fn settled_cluster_stops_writing() {
    let cluster = Cluster::start(PluginRegistry::new());
    cluster
        .fake
        .seed_volume(volume("pv1", "10Gi", ReclaimPolicy::Retain));
    cluster.fake.seed_claim(claim("ns", "c1", "5Gi"));

    let fake = cluster.fake.clone();
    eventually("binding to settle", move || {
        let claim_bound = fake
            .claim_snapshot("ns", "c1")
            .map(|c| c.status.phase == ClaimPhase::Bound)
            .unwrap_or(false);
        let volume_bound = fake
            .volume_snapshot("pv1")
            .map(|v| v.status.phase == VolumePhase::Bound)
            .unwrap_or(false);
        claim_bound && volume_bound
    })
    .await;

    // Once at the fixed point, event echoes must not cause further writes.
    tokio::time::sleep(SETTLE).await;
    let writes = cluster.fake.total_writes();
    tokio::time::sleep(SETTLE).await;
    assert_eq!(
        cluster.fake.total_writes(),
        writes,
        "a settled cluster must be write-quiescent"
    );

    cluster.shutdown().await;
}
