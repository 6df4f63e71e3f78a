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

//! In-memory stand-in for the remote API, used by unit and integration tests.
//!
//! The fake keeps both collections under a single store with a monotonic
//! revision counter, rejects stale updates the way the real API signals
//! version conflicts, and fans watch events out to any number of
//! subscriptions. Individual verbs can be primed to fail once, and every
//! mutating verb is counted so tests can assert idempotence.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use reqwest::StatusCode;
use tokio::sync::{broadcast, mpsc};

use crate::bindery::api::client::{
    ApiFuture, ControllerClient, DynError, HttpError, WatchSubscription,
};
use crate::bindery::api::types::{
    Claim, ClaimList, ListMeta, Volume, VolumeList, WatchEvent, WatchEventType,
};

const EVENT_BUFFER: usize = 256;

pub const VERB_CREATE_VOLUME: &str = "create_volume";
pub const VERB_UPDATE_VOLUME: &str = "update_volume";
pub const VERB_UPDATE_VOLUME_STATUS: &str = "update_volume_status";
pub const VERB_DELETE_VOLUME: &str = "delete_volume";
pub const VERB_UPDATE_CLAIM: &str = "update_claim";
pub const VERB_UPDATE_CLAIM_STATUS: &str = "update_claim_status";

#[derive(Clone)]
pub struct FakeControllerClient {
    inner: Arc<FakeInner>,
}

struct FakeInner {
    state: Mutex<FakeState>,
    volume_events: broadcast::Sender<WatchEvent<Volume>>,
    claim_events: broadcast::Sender<WatchEvent<Claim>>,
}

#[derive(Default)]
struct FakeState {
    revision: u64,
    volumes: BTreeMap<String, Volume>,
    claims: BTreeMap<String, Claim>,
    writes: HashMap<&'static str, usize>,
    failures: HashMap<&'static str, VecDeque<String>>,
}

impl FakeState {
    fn next_revision(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }
}

fn conflict(name: &str) -> DynError {
    Box::new(HttpError::new(
        StatusCode::CONFLICT,
        format!("object '{name}' was modified concurrently"),
    ))
}

fn not_found(name: &str) -> DynError {
    Box::new(HttpError::new(
        StatusCode::NOT_FOUND,
        format!("object '{name}' not found"),
    ))
}

fn stale(current: Option<&str>, incoming: Option<&str>) -> bool {
    match (current, incoming) {
        (Some(current), Some(incoming)) => current != incoming,
        _ => false,
    }
}

fn claim_store_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

impl FakeControllerClient {
    pub fn new() -> Self {
        let (volume_events, _) = broadcast::channel(EVENT_BUFFER);
        let (claim_events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(FakeInner {
                state: Mutex::new(FakeState::default()),
                volume_events,
                claim_events,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take_failure(&self, verb: &'static str) -> Option<DynError> {
        let mut state = self.lock();
        let message = state.failures.get_mut(verb)?.pop_front()?;
        Some(Box::new(HttpError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            message,
        )))
    }

    fn count_write(state: &mut FakeState, verb: &'static str) {
        *state.writes.entry(verb).or_insert(0) += 1;
    }

    fn publish_volume(&self, event_type: WatchEventType, volume: Volume) {
        let _ = self.inner.volume_events.send(WatchEvent {
            event_type,
            object: volume,
        });
    }

    fn publish_claim(&self, event_type: WatchEventType, claim: Claim) {
        let _ = self.inner.claim_events.send(WatchEvent {
            event_type,
            object: claim,
        });
    }

    /// Inserts a volume as if an administrator had created it out of band.
    pub fn seed_volume(&self, mut volume: Volume) {
        let key = volume.name().to_string();
        {
            let mut state = self.lock();
            let revision = state.next_revision();
            volume.metadata.resource_version = Some(revision);
            state.volumes.insert(key, volume.clone());
        }
        self.publish_volume(WatchEventType::Added, volume);
    }

    /// Inserts a claim as if a user had created it out of band.
    pub fn seed_claim(&self, mut claim: Claim) {
        let key = claim_store_key(&claim.namespace(), claim.name());
        {
            let mut state = self.lock();
            let revision = state.next_revision();
            claim.metadata.resource_version = Some(revision);
            state.claims.insert(key, claim.clone());
        }
        self.publish_claim(WatchEventType::Added, claim);
    }

    /// Deletes a claim out of band, as the user's DELETE would.
    pub fn remove_claim(&self, namespace: &str, name: &str) -> bool {
        let removed = {
            let mut state = self.lock();
            state.claims.remove(&claim_store_key(namespace, name))
        };
        match removed {
            Some(claim) => {
                self.publish_claim(WatchEventType::Deleted, claim);
                true
            }
            None => false,
        }
    }

    pub fn volume_snapshot(&self, name: &str) -> Option<Volume> {
        self.lock().volumes.get(name).cloned()
    }

    pub fn claim_snapshot(&self, namespace: &str, name: &str) -> Option<Claim> {
        self.lock()
            .claims
            .get(&claim_store_key(namespace, name))
            .cloned()
    }

    pub fn volumes(&self) -> Vec<Volume> {
        self.lock().volumes.values().cloned().collect()
    }

    pub fn claims(&self) -> Vec<Claim> {
        self.lock().claims.values().cloned().collect()
    }

    /// Number of times the given mutating verb has been executed.
    pub fn writes(&self, verb: &'static str) -> usize {
        self.lock().writes.get(verb).copied().unwrap_or(0)
    }

    pub fn total_writes(&self) -> usize {
        self.lock().writes.values().sum()
    }

    /// Primes the next invocation of `verb` to fail with a server error.
    pub fn fail_next(&self, verb: &'static str, message: impl Into<String>) {
        self.lock()
            .failures
            .entry(verb)
            .or_default()
            .push_back(message.into());
    }

    fn open_watch<T>(
        receiver: broadcast::Receiver<WatchEvent<T>>,
        backlog: Vec<T>,
    ) -> WatchSubscription<T>
    where
        T: Clone + Send + 'static,
    {
        let (sender, out) = mpsc::channel(EVENT_BUFFER);
        let mut receiver = receiver;
        tokio::spawn(async move {
            for object in backlog {
                if sender
                    .send(WatchEvent {
                        event_type: WatchEventType::Modified,
                        object,
                    })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        if sender.send(event).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        WatchSubscription::new(out)
    }

    fn newer_than(resource_version: Option<&str>, object_revision: Option<&str>) -> bool {
        let Some(floor) = resource_version.and_then(|rv| rv.parse::<u64>().ok()) else {
            return true;
        };
        object_revision
            .and_then(|rv| rv.parse::<u64>().ok())
            .map(|rv| rv > floor)
            .unwrap_or(true)
    }
}

impl Default for FakeControllerClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ControllerClient for FakeControllerClient {
    fn get_volume(&self, name: String) -> ApiFuture<Option<Volume>> {
        let fake = self.clone();
        Box::pin(async move { Ok(fake.lock().volumes.get(&name).cloned()) })
    }

    fn list_volumes(&self) -> ApiFuture<VolumeList> {
        let fake = self.clone();
        Box::pin(async move {
            let state = fake.lock();
            Ok(VolumeList {
                metadata: ListMeta {
                    resource_version: Some(state.revision.to_string()),
                },
                items: state.volumes.values().cloned().collect(),
            })
        })
    }

    fn watch_volumes(&self, resource_version: Option<String>) -> ApiFuture<WatchSubscription<Volume>> {
        let fake = self.clone();
        Box::pin(async move {
            let receiver = fake.inner.volume_events.subscribe();
            let backlog: Vec<Volume> = fake
                .lock()
                .volumes
                .values()
                .filter(|volume| {
                    Self::newer_than(
                        resource_version.as_deref(),
                        volume.metadata.resource_version.as_deref(),
                    )
                })
                .cloned()
                .collect();
            Ok(Self::open_watch(receiver, backlog))
        })
    }

    fn create_volume(&self, mut volume: Volume) -> ApiFuture<Volume> {
        let fake = self.clone();
        Box::pin(async move {
            if let Some(err) = fake.take_failure(VERB_CREATE_VOLUME) {
                return Err(err);
            }
            let name = volume.name().to_string();
            if name.is_empty() {
                return Err(crate::bindery::util::new_error("volume has no metadata.name"));
            }
            {
                let mut state = fake.lock();
                if state.volumes.contains_key(&name) {
                    return Err(conflict(&name));
                }
                let revision = state.next_revision();
                volume.metadata.resource_version = Some(revision);
                state.volumes.insert(name, volume.clone());
                Self::count_write(&mut state, VERB_CREATE_VOLUME);
            }
            fake.publish_volume(WatchEventType::Added, volume.clone());
            Ok(volume)
        })
    }

    fn update_volume(&self, mut volume: Volume) -> ApiFuture<Volume> {
        let fake = self.clone();
        Box::pin(async move {
            if let Some(err) = fake.take_failure(VERB_UPDATE_VOLUME) {
                return Err(err);
            }
            let name = volume.name().to_string();
            {
                let mut state = fake.lock();
                let Some(existing) = state.volumes.get(&name).cloned() else {
                    return Err(not_found(&name));
                };
                if stale(
                    existing.metadata.resource_version.as_deref(),
                    volume.metadata.resource_version.as_deref(),
                ) {
                    return Err(conflict(&name));
                }
                // Status changes go through the status subresource.
                volume.status = existing.status;
                let revision = state.next_revision();
                volume.metadata.resource_version = Some(revision);
                state.volumes.insert(name, volume.clone());
                Self::count_write(&mut state, VERB_UPDATE_VOLUME);
            }
            fake.publish_volume(WatchEventType::Modified, volume.clone());
            Ok(volume)
        })
    }

    fn update_volume_status(&self, volume: Volume) -> ApiFuture<Volume> {
        let fake = self.clone();
        Box::pin(async move {
            if let Some(err) = fake.take_failure(VERB_UPDATE_VOLUME_STATUS) {
                return Err(err);
            }
            let name = volume.name().to_string();
            let updated = {
                let mut state = fake.lock();
                let Some(mut existing) = state.volumes.get(&name).cloned() else {
                    return Err(not_found(&name));
                };
                if stale(
                    existing.metadata.resource_version.as_deref(),
                    volume.metadata.resource_version.as_deref(),
                ) {
                    return Err(conflict(&name));
                }
                existing.status = volume.status;
                let revision = state.next_revision();
                existing.metadata.resource_version = Some(revision);
                state.volumes.insert(name, existing.clone());
                Self::count_write(&mut state, VERB_UPDATE_VOLUME_STATUS);
                existing
            };
            fake.publish_volume(WatchEventType::Modified, updated.clone());
            Ok(updated)
        })
    }

    fn delete_volume(&self, name: String) -> ApiFuture<()> {
        let fake = self.clone();
        Box::pin(async move {
            if let Some(err) = fake.take_failure(VERB_DELETE_VOLUME) {
                return Err(err);
            }
            let removed = {
                let mut state = fake.lock();
                let removed = state.volumes.remove(&name);
                if removed.is_some() {
                    Self::count_write(&mut state, VERB_DELETE_VOLUME);
                }
                removed
            };
            // Deleting an absent volume is not an error.
            if let Some(volume) = removed {
                fake.publish_volume(WatchEventType::Deleted, volume);
            }
            Ok(())
        })
    }

    fn get_claim(&self, namespace: String, name: String) -> ApiFuture<Option<Claim>> {
        let fake = self.clone();
        Box::pin(async move {
            Ok(fake
                .lock()
                .claims
                .get(&claim_store_key(&namespace, &name))
                .cloned())
        })
    }

    fn list_claims(&self) -> ApiFuture<ClaimList> {
        let fake = self.clone();
        Box::pin(async move {
            let state = fake.lock();
            Ok(ClaimList {
                metadata: ListMeta {
                    resource_version: Some(state.revision.to_string()),
                },
                items: state.claims.values().cloned().collect(),
            })
        })
    }

    fn watch_claims(&self, resource_version: Option<String>) -> ApiFuture<WatchSubscription<Claim>> {
        let fake = self.clone();
        Box::pin(async move {
            let receiver = fake.inner.claim_events.subscribe();
            let backlog: Vec<Claim> = fake
                .lock()
                .claims
                .values()
                .filter(|claim| {
                    Self::newer_than(
                        resource_version.as_deref(),
                        claim.metadata.resource_version.as_deref(),
                    )
                })
                .cloned()
                .collect();
            Ok(Self::open_watch(receiver, backlog))
        })
    }

    fn update_claim(&self, mut claim: Claim) -> ApiFuture<Claim> {
        let fake = self.clone();
        Box::pin(async move {
            if let Some(err) = fake.take_failure(VERB_UPDATE_CLAIM) {
                return Err(err);
            }
            let key = claim_store_key(&claim.namespace(), claim.name());
            {
                let mut state = fake.lock();
                let Some(existing) = state.claims.get(&key).cloned() else {
                    return Err(not_found(&key));
                };
                if stale(
                    existing.metadata.resource_version.as_deref(),
                    claim.metadata.resource_version.as_deref(),
                ) {
                    return Err(conflict(&key));
                }
                claim.status = existing.status;
                let revision = state.next_revision();
                claim.metadata.resource_version = Some(revision);
                state.claims.insert(key, claim.clone());
                Self::count_write(&mut state, VERB_UPDATE_CLAIM);
            }
            fake.publish_claim(WatchEventType::Modified, claim.clone());
            Ok(claim)
        })
    }

    fn update_claim_status(&self, claim: Claim) -> ApiFuture<Claim> {
        let fake = self.clone();
        Box::pin(async move {
            if let Some(err) = fake.take_failure(VERB_UPDATE_CLAIM_STATUS) {
                return Err(err);
            }
            let key = claim_store_key(&claim.namespace(), claim.name());
            let updated = {
                let mut state = fake.lock();
                let Some(mut existing) = state.claims.get(&key).cloned() else {
                    return Err(not_found(&key));
                };
                if stale(
                    existing.metadata.resource_version.as_deref(),
                    claim.metadata.resource_version.as_deref(),
                ) {
                    return Err(conflict(&key));
                }
                existing.status = claim.status;
                let revision = state.next_revision();
                existing.metadata.resource_version = Some(revision);
                state.claims.insert(key, existing.clone());
                Self::count_write(&mut state, VERB_UPDATE_CLAIM_STATUS);
                existing
            };
            fake.publish_claim(WatchEventType::Modified, updated.clone());
            Ok(updated)
        })
    }
}
