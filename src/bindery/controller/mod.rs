/*
 * Copyright (C) 2025 The Bindery Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

pub mod claims;
pub mod index;
pub mod informer;
pub mod operations;
pub mod queue;
pub mod volumes;

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::bindery::api::client::ControllerClient;
use crate::bindery::api::types::{Claim, ObjectKey, Volume};
use crate::bindery::controller::index::VolumeIndex;
use crate::bindery::controller::informer::{Informer, InformerEvent, ListWatch};
use crate::bindery::controller::operations::OperationRunner;
use crate::bindery::controller::queue::KeyedQueue;
use crate::bindery::logger::{log_debug, log_error, log_info};
use crate::bindery::plugin::PluginRegistry;

const COMPONENT: &str = "controller";
const DEFAULT_SYNC_PERIOD: Duration = Duration::from_secs(10 * 60);
const DEFAULT_WORKERS: usize = 4;
const REQUEUE_DELAY: Duration = Duration::from_millis(500);
const TASK_SHUTDOWN_WAIT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug)]
pub struct ControllerSettings {
    /// Interval at which cached objects are re-emitted to self-heal from
    /// missed work.
    pub sync_period: Duration,
    /// Reconcile workers per resource type.
    pub workers: usize,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            sync_period: DEFAULT_SYNC_PERIOD,
            workers: DEFAULT_WORKERS,
        }
    }
}

/// Shared collaborators handed to the reconcilers.
pub struct ControllerContext {
    pub client: Arc<dyn ControllerClient>,
    pub registry: Arc<PluginRegistry>,
    pub volumes: Informer<Volume>,
    pub claims: Informer<Claim>,
    pub operations: OperationRunner,
}

impl ControllerContext {
    pub fn new(client: Arc<dyn ControllerClient>, registry: Arc<PluginRegistry>) -> Self {
        Self::with_sync_period(client, registry, DEFAULT_SYNC_PERIOD)
    }

    pub fn with_sync_period(
        client: Arc<dyn ControllerClient>,
        registry: Arc<PluginRegistry>,
        sync_period: Duration,
    ) -> Self {
        let volumes = Informer::new(ListWatch::volumes(Arc::clone(&client)), sync_period);
        let claims = Informer::new(ListWatch::claims(Arc::clone(&client)), sync_period);
        let operations = OperationRunner::new(Arc::clone(&client), Arc::clone(&registry));
        Self {
            client,
            registry,
            volumes,
            claims,
            operations,
        }
    }
}

/// State read and mutated only while holding the controller's main lock.
pub struct CoreState {
    pub index: VolumeIndex,
    /// Claim keys a volume has been provisioned for. Guards against double
    /// provisioning in the window before the claim annotation write lands.
    pub provisioned_claims: HashSet<String>,
}

impl CoreState {
    pub fn new() -> Self {
        Self {
            index: VolumeIndex::new(),
            provisioned_claims: HashSet::new(),
        }
    }
}

impl Default for CoreState {
    fn default() -> Self {
        Self::new()
    }
}

/// The persistent volume controller: two informers feeding de-duplicating
/// key queues, worker pools reconciling under a coarse main lock, and a
/// background runner for the side-effectful operations.
pub struct VolumeController {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    ctx: ControllerContext,
    core: Mutex<CoreState>,
    volume_queue: KeyedQueue,
    claim_queue: KeyedQueue,
    shutdown: CancellationToken,
    workers: usize,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl VolumeController {
    pub fn new(
        client: Arc<dyn ControllerClient>,
        registry: Arc<PluginRegistry>,
        settings: ControllerSettings,
    ) -> Self {
        let ctx = ControllerContext::with_sync_period(client, registry, settings.sync_period);
        let volume_queue = KeyedQueue::new();
        let claim_queue = KeyedQueue::new();

        // Informer dispatch only translates events into queued keys; all
        // real work happens on the workers under the main lock.
        {
            let queue = volume_queue.clone();
            ctx.volumes.set_handler(Box::new(move |event| match event {
                InformerEvent::Applied(volume) | InformerEvent::Removed(volume) => {
                    queue.enqueue(volume.key());
                }
            }));
        }
        {
            let queue = claim_queue.clone();
            ctx.claims.set_handler(Box::new(move |event| match event {
                InformerEvent::Applied(claim) | InformerEvent::Removed(claim) => {
                    queue.enqueue(claim.key());
                }
            }));
        }

        Self {
            inner: Arc::new(ControllerInner {
                ctx,
                core: Mutex::new(CoreState::new()),
                volume_queue,
                claim_queue,
                shutdown: CancellationToken::new(),
                workers: settings.workers.max(1),
                tasks: StdMutex::new(Vec::new()),
            }),
        }
    }

    pub fn context(&self) -> &ControllerContext {
        &self.inner.ctx
    }

    /// Starts the informers and worker pools. Idempotent only in the sense
    /// that it should be called once; a second call spawns duplicate workers.
    pub fn run(&self) {
        let mut tasks = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        tasks.push(self.inner.ctx.volumes.spawn(self.inner.shutdown.child_token()));
        tasks.push(self.inner.ctx.claims.spawn(self.inner.shutdown.child_token()));

        for _ in 0..self.inner.workers {
            let inner = Arc::clone(&self.inner);
            tasks.push(tokio::spawn(async move { volume_worker(inner).await }));
            let inner = Arc::clone(&self.inner);
            tasks.push(tokio::spawn(async move { claim_worker(inner).await }));
        }

        log_info(
            COMPONENT,
            "Controller started",
            &[("workers", self.inner.workers.to_string().as_str())],
        );
    }

    /// Shuts down: informers first, then the queues, then the operation
    /// runner with the given grace period for in-flight side effects.
    pub async fn stop(&self, grace: Duration) {
        log_info(COMPONENT, "Controller stopping", &[]);
        self.inner.shutdown.cancel();
        self.inner.volume_queue.close();
        self.inner.claim_queue.close();
        self.inner.ctx.operations.drain(grace).await;

        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self
                .inner
                .tasks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.drain(..).collect()
        };
        for task in tasks {
            if tokio::time::timeout(TASK_SHUTDOWN_WAIT, task).await.is_err() {
                log_error(COMPONENT, "Task did not stop in time", &[]);
            }
        }
        log_info(COMPONENT, "Controller stopped", &[]);
    }
}

fn requeue_later(queue: KeyedQueue, key: ObjectKey) {
    tokio::spawn(async move {
        sleep(REQUEUE_DELAY).await;
        queue.enqueue(key);
    });
}

async fn volume_worker(inner: Arc<ControllerInner>) {
    while let Some(key) = inner.volume_queue.next().await {
        let mut core = inner.core.lock().await;
        match inner.ctx.volumes.get(&key) {
            Some(volume) => {
                core.index.add(&volume);
                let claim_ref = volume.spec.claim_ref.clone();
                match volumes::reconcile_volume(&inner.ctx, &mut core, &volume).await {
                    Ok(phase) => {
                        log_debug(
                            COMPONENT,
                            "Volume reconciled",
                            &[("volume", key.name.as_str()), ("phase", phase.as_str())],
                        );
                        // Wake whoever may now make progress: the bound claim,
                        // or every unbound claim when capacity became
                        // available.
                        match claim_ref {
                            Some(reference) => inner.claim_queue.enqueue(reference.key()),
                            None => {
                                for claim in inner.ctx.claims.list_cached() {
                                    if claim.bound_volume().is_none() {
                                        inner.claim_queue.enqueue(claim.key());
                                    }
                                }
                            }
                        }
                    }
                    Err(err) => {
                        log_error(
                            COMPONENT,
                            "Volume reconcile failed",
                            &[
                                ("volume", key.name.as_str()),
                                ("error", err.to_string().as_str()),
                            ],
                        );
                        requeue_later(inner.volume_queue.clone(), key);
                    }
                }
            }
            None => {
                // The volume is gone; only the index entry remains.
                core.index.delete(&key.name);
            }
        }
    }
}

async fn claim_worker(inner: Arc<ControllerInner>) {
    while let Some(key) = inner.claim_queue.next().await {
        let mut core = inner.core.lock().await;
        match inner.ctx.claims.get(&key) {
            Some(claim) => match claims::reconcile_claim(&inner.ctx, &mut core, &claim).await {
                Ok(phase) => {
                    log_debug(
                        COMPONENT,
                        "Claim reconciled",
                        &[
                            ("claim", key.to_string().as_str()),
                            ("phase", phase.as_str()),
                        ],
                    );
                    // Nudge the bound volume so its phase catches up with a
                    // binding that just completed.
                    if let Some(updated) = inner.ctx.claims.get(&key) {
                        if let Some(volume_name) = updated.bound_volume() {
                            inner.volume_queue.enqueue(ObjectKey::cluster(volume_name));
                        }
                    }
                }
                Err(err) => {
                    log_error(
                        COMPONENT,
                        "Claim reconcile failed",
                        &[
                            ("claim", key.to_string().as_str()),
                            ("error", err.to_string().as_str()),
                        ],
                    );
                    requeue_later(inner.claim_queue.clone(), key);
                }
            },
            None => {
                // The claim was deleted: drop the provisioning guard and let
                // its volume notice the release.
                core.provisioned_claims.remove(&key.to_string());
                for volume in inner.ctx.volumes.list_cached() {
                    if let Some(reference) = &volume.spec.claim_ref {
                        if reference.key() == key {
                            inner.volume_queue.enqueue(volume.key());
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bindery::api::fake::FakeControllerClient;
    use crate::bindery::api::quantity::Quantity;
    use crate::bindery::api::types::{
        AccessMode, ClaimPhase, ClaimSpec, ObjectMeta, ReclaimPolicy, ResourceRequests,
        ResourceRequirements, VolumePhase, VolumeSource, VolumeSpec, VolumeStatus,
    };
    use tokio::time::Instant;

    fn volume(name: &str, capacity: &str) -> Volume {
        Volume {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: VolumeSpec {
                capacity: Quantity::new(capacity),
                access_modes: vec![AccessMode::ReadWriteOnce],
                reclaim_policy: ReclaimPolicy::Retain,
                source: VolumeSource::HostPath {
                    path: format!("/tmp/{name}"),
                },
                claim_ref: None,
            },
            status: VolumeStatus::default(),
        }
    }

    fn claim(namespace: &str, name: &str, capacity: &str) -> Claim {
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
                access_modes: vec![AccessMode::ReadWriteOnce],
                volume_name: None,
            },
            status: Default::default(),
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if check() {
                return;
            }
            if Instant::now() > deadline {
                panic!("condition not reached in time");
            }
            sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn running_controller_binds_a_claim_end_to_end() {
        let fake = FakeControllerClient::new();
        fake.seed_volume(volume("pv1", "10Gi"));
        fake.seed_claim(claim("ns", "c1", "5Gi"));

        let controller = VolumeController::new(
            Arc::new(fake.clone()),
            Arc::new(PluginRegistry::new()),
            ControllerSettings {
                sync_period: Duration::from_secs(60),
                workers: 2,
            },
        );
        controller.run();

        let probe = fake.clone();
        eventually(move || {
            probe
                .claim_snapshot("ns", "c1")
                .map(|c| c.status.phase == ClaimPhase::Bound)
                .unwrap_or(false)
        })
        .await;

        let bound_claim = fake.claim_snapshot("ns", "c1").unwrap();
        assert_eq!(bound_claim.bound_volume(), Some("pv1"));
        let bound_volume = fake.volume_snapshot("pv1").unwrap();
        assert_eq!(
            bound_volume.spec.claim_ref.as_ref().map(ToString::to_string),
            Some("ns/c1".to_string())
        );

        let probe = fake.clone();
        eventually(move || {
            probe
                .volume_snapshot("pv1")
                .map(|v| v.status.phase == VolumePhase::Bound)
                .unwrap_or(false)
        })
        .await;

        controller.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn claims_created_before_their_volume_still_bind() {
        let fake = FakeControllerClient::new();
        fake.seed_claim(claim("ns", "c1", "5Gi"));

        let controller = VolumeController::new(
            Arc::new(fake.clone()),
            Arc::new(PluginRegistry::new()),
            ControllerSettings {
                sync_period: Duration::from_secs(60),
                workers: 2,
            },
        );
        controller.run();

        // Let the claim be observed (and parked) first.
        sleep(Duration::from_millis(100)).await;
        fake.seed_volume(volume("pv-late", "10Gi"));

        let probe = fake.clone();
        eventually(move || {
            probe
                .claim_snapshot("ns", "c1")
                .map(|c| c.bound_volume() == Some("pv-late"))
                .unwrap_or(false)
        })
        .await;

        controller.stop(Duration::from_secs(1)).await;
    }
}
