use std::path::Path;
use std::sync::Arc;

use bindery::bindery::api::quantity::Quantity;
use bindery::bindery::api::types::{annotations, ClaimPhase, VolumePhase, VolumeSource};
use bindery::bindery::plugin::hostpath::HostPathPlugin;
use bindery::bindery::plugin::{PluginRegistry, ProvisionerPlugin};

use crate::support::{claim, eventually, Cluster, SETTLE};

fn hostpath_registry(root: &Path, tag: &str) -> PluginRegistry {
    let mut registry = PluginRegistry::new();
    registry
        .register(
            tag,
            Arc::new(HostPathPlugin::with_root(root)) as Arc<dyn ProvisionerPlugin>,
        )
        .unwrap();
    registry
}

#[tokio::test]
async fn qos_tagged_claim_gets_a_provisioned_volume() {
    let root = tempfile::tempdir().unwrap();
    let cluster = Cluster::start(hostpath_registry(root.path(), "standard"));

    let mut c = claim("ns", "c2", "3Gi");
    c.set_annotation(annotations::QUALITY_OF_SERVICE, "standard");
    cluster.fake.seed_claim(c);

    // A volume appears, pre-bound and stamped with its lineage.
    let fake = cluster.fake.clone();
    eventually("a provisioned volume to appear", move || {
        !fake.volumes().is_empty()
    })
    .await;
    let created = cluster.fake.volumes().remove(0);
    assert_eq!(
        created.annotation(annotations::PROVISIONED_FOR),
        Some("ns/c2")
    );
    assert_eq!(
        created.annotation(annotations::QUALITY_OF_SERVICE),
        Some("standard")
    );
    assert_eq!(
        created.spec.claim_ref.as_ref().map(ToString::to_string),
        Some("ns/c2".to_string())
    );
    assert_eq!(created.spec.capacity, Quantity::new("3Gi"));

    // The claim binds to it and both sides reach Bound.
    let created_name = created.name().to_string();
    let fake = cluster.fake.clone();
    let expect = created_name.clone();
    eventually("claim c2 to bind to the new volume", move || {
        fake.claim_snapshot("ns", "c2")
            .map(|c| c.status.phase == ClaimPhase::Bound && c.bound_volume() == Some(expect.as_str()))
            .unwrap_or(false)
    })
    .await;

    let fake = cluster.fake.clone();
    let expect = created_name.clone();
    eventually("provisioned volume to reach Bound", move || {
        fake.volume_snapshot(&expect)
            .map(|v| v.status.phase == VolumePhase::Bound)
            .unwrap_or(false)
    })
    .await;

    // The back-end storage was realized.
    let realized = cluster.fake.volume_snapshot(&created_name).unwrap();
    assert!(realized.has_annotation(annotations::PROVISIONING_COMPLETED));
    let VolumeSource::HostPath { path } = &realized.spec.source else {
        panic!("hostPath source expected");
    };
    assert!(Path::new(path).is_dir(), "backing directory should exist");

    // Exactly one volume was provisioned despite event replays.
    tokio::time::sleep(SETTLE).await;
    assert_eq!(cluster.fake.volumes().len(), 1);

    cluster.shutdown().await;
}

#[tokio::test]
async fn unknown_qos_tag_leaves_the_claim_pending() {
    let root = tempfile::tempdir().unwrap();
    let cluster = Cluster::start(hostpath_registry(root.path(), "standard"));

    let mut c = claim("ns", "c-exotic", "3Gi");
    c.set_annotation(annotations::QUALITY_OF_SERVICE, "platinum");
    cluster.fake.seed_claim(c);

    tokio::time::sleep(SETTLE).await;
    assert!(cluster.fake.volumes().is_empty());
    let parked = cluster.fake.claim_snapshot("ns", "c-exotic").unwrap();
    assert_eq!(parked.status.phase, ClaimPhase::Pending);

    cluster.shutdown().await;
}

#[tokio::test]
async fn provisioned_volume_is_reserved_for_its_claim() {
    let root = tempfile::tempdir().unwrap();
    let cluster = Cluster::start(hostpath_registry(root.path(), "standard"));

    let mut owner = claim("ns", "c-owner", "3Gi");
    owner.set_annotation(annotations::QUALITY_OF_SERVICE, "standard");
    cluster.fake.seed_claim(owner);

    let fake = cluster.fake.clone();
    eventually("owner claim to bind", move || {
        fake.claim_snapshot("ns", "c-owner")
            .map(|c| c.status.phase == ClaimPhase::Bound)
            .unwrap_or(false)
    })
    .await;

    // A bystander requesting the same shape must not receive the
    // provisioned volume, nor trigger provisioning without a tag.
    cluster.fake.seed_claim(claim("ns", "c-bystander", "3Gi"));
    tokio::time::sleep(SETTLE).await;
    let bystander = cluster.fake.claim_snapshot("ns", "c-bystander").unwrap();
    assert!(bystander.bound_volume().is_none());
    assert_eq!(cluster.fake.volumes().len(), 1);

    cluster.shutdown().await;
}

#[tokio::test]
async fn deleting_a_provisioned_claim_reclaims_the_volume() {
    let root = tempfile::tempdir().unwrap();
    let cluster = Cluster::start(hostpath_registry(root.path(), "standard"));

    let mut c = claim("ns", "c-temp", "2Gi");
    c.set_annotation(annotations::QUALITY_OF_SERVICE, "standard");
    cluster.fake.seed_claim(c);

    let fake = cluster.fake.clone();
    eventually("claim to bind its provisioned volume", move || {
        fake.claim_snapshot("ns", "c-temp")
            .map(|c| c.status.phase == ClaimPhase::Bound)
            .unwrap_or(false)
    })
    .await;
    let created_name = cluster.fake.volumes().remove(0).name().to_string();

    // Provisioned volumes default to the Delete reclaim policy, so removing
    // the claim destroys the volume end to end.
    assert!(cluster.fake.remove_claim("ns", "c-temp"));
    let fake = cluster.fake.clone();
    let expect = created_name.clone();
    eventually("provisioned volume to be deleted", move || {
        fake.volume_snapshot(&expect).is_none()
    })
    .await;
    assert!(!root.path().join(&created_name).exists());

    cluster.shutdown().await;
}
