use std::fs;
use std::path::Path;
use std::sync::Arc;

use bindery::bindery::api::types::{annotations, ClaimPhase, ReclaimPolicy, VolumePhase};
use bindery::bindery::plugin::hostpath::HostPathPlugin;
use bindery::bindery::plugin::{PluginRegistry, ProvisionerPlugin};

use crate::support::{claim, eventually, volume_with_path, Cluster, SETTLE};

fn hostpath_registry(root: &Path) -> PluginRegistry {
    let mut registry = PluginRegistry::new();
    registry
        .register(
            "standard",
            Arc::new(HostPathPlugin::with_root(root)) as Arc<dyn ProvisionerPlugin>,
        )
        .unwrap();
    registry
}

async fn bind_then_release(cluster: &Cluster, volume_name: &str) {
    cluster.fake.seed_claim(claim("ns", "c-r", "5Gi"));

    let fake = cluster.fake.clone();
    let name = volume_name.to_string();
    eventually("claim to bind before release", move || {
        fake.claim_snapshot("ns", "c-r")
            .map(|c| c.status.phase == ClaimPhase::Bound && c.bound_volume() == Some(name.as_str()))
            .unwrap_or(false)
    })
    .await;

    let fake = cluster.fake.clone();
    let name = volume_name.to_string();
    eventually("volume to report Bound", move || {
        fake.volume_snapshot(&name)
            .map(|v| v.status.phase == VolumePhase::Bound)
            .unwrap_or(false)
    })
    .await;

    assert!(cluster.fake.remove_claim("ns", "c-r"));
}

#[tokio::test]
async fn recycle_cycle_returns_the_volume_to_the_pool() {
    let root = tempfile::tempdir().unwrap();
    let backing = root.path().join("pv-recyc");
    fs::create_dir_all(&backing).unwrap();
    fs::write(backing.join("data.bin"), b"user bytes").unwrap();

    let cluster = Cluster::start(hostpath_registry(root.path()));
    cluster.fake.seed_volume(volume_with_path(
        "pv-recyc",
        "10Gi",
        ReclaimPolicy::Recycle,
        backing.to_str().unwrap(),
    ));

    bind_then_release(&cluster, "pv-recyc").await;

    // Bound → Released → (recycle) → Available, with the reference cleared.
    let fake = cluster.fake.clone();
    eventually("volume to come back Available", move || {
        fake.volume_snapshot("pv-recyc")
            .map(|v| v.status.phase == VolumePhase::Available && v.spec.claim_ref.is_none())
            .unwrap_or(false)
    })
    .await;

    let recycled = cluster.fake.volume_snapshot("pv-recyc").unwrap();
    assert!(!recycled.has_annotation(annotations::RECYCLE_REQUIRED));
    assert!(!recycled.has_annotation(annotations::RECYCLE_COMPLETED));

    // The scrub actually happened.
    let leftovers: Vec<_> = fs::read_dir(&backing).unwrap().collect();
    assert!(leftovers.is_empty(), "backing directory should be scrubbed");

    // A new claim can take the recycled volume.
    cluster.fake.seed_claim(claim("ns", "c-next", "5Gi"));
    let fake = cluster.fake.clone();
    eventually("recycled volume to serve a new claim", move || {
        fake.claim_snapshot("ns", "c-next")
            .map(|c| c.bound_volume() == Some("pv-recyc"))
            .unwrap_or(false)
    })
    .await;

    cluster.shutdown().await;
}

#[tokio::test]
async fn delete_cycle_removes_the_volume_entirely() {
    let root = tempfile::tempdir().unwrap();
    let backing = root.path().join("pv-del");
    fs::create_dir_all(&backing).unwrap();

    let cluster = Cluster::start(hostpath_registry(root.path()));
    cluster.fake.seed_volume(volume_with_path(
        "pv-del",
        "10Gi",
        ReclaimPolicy::Delete,
        backing.to_str().unwrap(),
    ));

    bind_then_release(&cluster, "pv-del").await;

    let fake = cluster.fake.clone();
    eventually("volume to disappear from the API", move || {
        fake.volume_snapshot("pv-del").is_none()
    })
    .await;
    assert!(!backing.exists(), "backing directory should be destroyed");

    cluster.shutdown().await;
}

#[tokio::test]
async fn retain_policy_parks_the_volume_released() {
    let root = tempfile::tempdir().unwrap();
    let backing = root.path().join("pv-keep");
    fs::create_dir_all(&backing).unwrap();
    fs::write(backing.join("precious.db"), b"keep me").unwrap();

    let cluster = Cluster::start(hostpath_registry(root.path()));
    cluster.fake.seed_volume(volume_with_path(
        "pv-keep",
        "10Gi",
        ReclaimPolicy::Retain,
        backing.to_str().unwrap(),
    ));

    bind_then_release(&cluster, "pv-keep").await;

    let fake = cluster.fake.clone();
    eventually("volume to report Released", move || {
        fake.volume_snapshot("pv-keep")
            .map(|v| v.status.phase == VolumePhase::Released)
            .unwrap_or(false)
    })
    .await;

    // No reclaim side effects, data untouched, and it stays that way.
    tokio::time::sleep(SETTLE).await;
    let parked = cluster.fake.volume_snapshot("pv-keep").unwrap();
    assert_eq!(parked.status.phase, VolumePhase::Released);
    assert!(!parked.has_annotation(annotations::RECYCLE_REQUIRED));
    assert!(!parked.has_annotation(annotations::DELETE_REQUIRED));
    assert!(parked.spec.claim_ref.is_some());
    assert!(backing.join("precious.db").exists());

    // A waiting claim must not be given the retained volume.
    cluster.fake.seed_claim(claim("ns", "c-hopeful", "5Gi"));
    tokio::time::sleep(SETTLE).await;
    let hopeful = cluster.fake.claim_snapshot("ns", "c-hopeful").unwrap();
    assert!(hopeful.bound_volume().is_none());

    cluster.shutdown().await;
}
