#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bindery::bindery::api::fake::FakeControllerClient;
use bindery::bindery::api::quantity::Quantity;
use bindery::bindery::api::types::{
    AccessMode, Claim, ClaimSpec, ObjectMeta, ReclaimPolicy, ResourceRequests,
    ResourceRequirements, Volume, VolumeSource, VolumeSpec, VolumeStatus,
};
use bindery::bindery::controller::{ControllerSettings, VolumeController};
use bindery::bindery::plugin::PluginRegistry;
use tokio::time::{sleep, Instant};

pub const SETTLE: Duration = Duration::from_millis(200);

pub fn volume(name: &str, capacity: &str, policy: ReclaimPolicy) -> Volume {
    Volume {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: VolumeSpec {
            capacity: Quantity::new(capacity),
            access_modes: vec![AccessMode::ReadWriteOnce],
            reclaim_policy: policy,
            source: VolumeSource::HostPath {
                path: format!("/tmp/bindery-it/{name}"),
            },
            claim_ref: None,
        },
        status: VolumeStatus::default(),
    }
}

pub fn volume_with_path(name: &str, capacity: &str, policy: ReclaimPolicy, path: &str) -> Volume {
    let mut volume = volume(name, capacity, policy);
    volume.spec.source = VolumeSource::HostPath {
        path: path.to_string(),
    };
    volume
}

pub fn claim(namespace: &str, name: &str, capacity: &str) -> Claim {
    claim_with_modes(namespace, name, capacity, &[AccessMode::ReadWriteOnce])
}

pub fn claim_with_modes(
    namespace: &str,
    name: &str,
    capacity: &str,
    modes: &[AccessMode],
) -> Claim {
    Claim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: ClaimSpec {
            resources: ResourceRequirements {
                requests: ResourceRequests {
                    storage: Quantity::new(capacity),
                },
            },
            access_modes: modes.to_vec(),
            volume_name: None,
        },
        status: Default::default(),
    }
}

/// Running controller wired to an in-memory API; stops on drop-site call.
pub struct Cluster {
    pub fake: FakeControllerClient,
    pub controller: VolumeController,
}

impl Cluster {
    pub fn start(registry: PluginRegistry) -> Self {
        let fake = FakeControllerClient::new();
        let controller = VolumeController::new(
            Arc::new(fake.clone()),
            Arc::new(registry),
            ControllerSettings {
                sync_period: Duration::from_secs(60),
                workers: 3,
            },
        );
        controller.run();
        Self { fake, controller }
    }

    pub async fn shutdown(self) {
        self.controller.stop(Duration::from_secs(2)).await;
    }
}

/// Polls until the condition holds, failing the test after a few seconds.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if check() {
            return;
        }
        if Instant::now() > deadline {
            panic!("timed out waiting for: {what}");
        }
        sleep(Duration::from_millis(10)).await;
    }
}
