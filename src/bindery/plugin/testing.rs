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

//! Instrumented plugin used by unit and integration tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

use crate::bindery::api::client::DynResult;
use crate::bindery::api::types::{
    AccessMode, ObjectMeta, Volume, VolumeSource, VolumeSpec, VolumeStatus,
};
use crate::bindery::plugin::{PluginFuture, ProvisionerPlugin, VolumeOptions};
use crate::bindery::util::new_error;

/// Plugin double that records every side-effect call, can be primed to fail,
/// and can hold calls open until released so tests can observe in-flight
/// exclusion.
pub struct MockPlugin {
    calls: Mutex<Vec<String>>,
    fail_with: Mutex<Option<String>>,
    hold: Mutex<Option<CancellationToken>>,
    counter: AtomicUsize,
}

impl MockPlugin {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_with: Mutex::new(None),
            hold: Mutex::new(None),
            counter: AtomicUsize::new(0),
        }
    }

    /// Every subsequent side-effect call fails with this message.
    pub fn fail_with(&self, message: impl Into<String>) {
        *self.lock_poisonless(&self.fail_with) = Some(message.into());
    }

    pub fn clear_failure(&self) {
        *self.lock_poisonless(&self.fail_with) = None;
    }

    /// Until `release_operations` is called, side-effect calls block.
    pub fn hold_operations(&self) {
        *self.lock_poisonless(&self.hold) = Some(CancellationToken::new());
    }

    pub fn release_operations(&self) {
        if let Some(gate) = self.lock_poisonless(&self.hold).take() {
            gate.cancel();
        }
    }

    /// Calls recorded so far, as `"<operation>:<volume>"` strings.
    pub fn calls(&self) -> Vec<String> {
        self.lock_poisonless(&self.calls).clone()
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.lock_poisonless(&self.calls)
            .iter()
            .filter(|entry| entry.starts_with(&format!("{operation}:")))
            .count()
    }

    fn lock_poisonless<'a, T>(&self, mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
        mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn run(&self, operation: &'static str, volume: &Volume) -> PluginFuture<()> {
        self.lock_poisonless(&self.calls)
            .push(format!("{operation}:{}", volume.name()));
        let failure = self.lock_poisonless(&self.fail_with).clone();
        let gate = self.lock_poisonless(&self.hold).clone();
        Box::pin(async move {
            if let Some(gate) = gate {
                gate.cancelled().await;
            }
            match failure {
                Some(message) => Err(new_error(message)),
                None => Ok(()),
            }
        })
    }
}

impl Default for MockPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl ProvisionerPlugin for MockPlugin {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn can_support(&self, source: &VolumeSource) -> bool {
        matches!(source, VolumeSource::HostPath { .. })
    }

    fn new_template(&self, options: &VolumeOptions) -> DynResult<Volume> {
        let serial = self.counter.fetch_add(1, Ordering::SeqCst);
        let name = format!("pv-mock-{serial}");
        Ok(Volume {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                ..Default::default()
            },
            spec: VolumeSpec {
                capacity: options.capacity.clone(),
                access_modes: vec![AccessMode::ReadWriteOnce],
                reclaim_policy: options.reclaim_policy,
                source: VolumeSource::HostPath {
                    path: format!("/tmp/mock/{name}"),
                },
                claim_ref: None,
            },
            status: VolumeStatus::default(),
        })
    }

    fn provision(&self, volume: Volume) -> PluginFuture<()> {
        self.run("provision", &volume)
    }

    fn recycle(&self, volume: Volume) -> PluginFuture<()> {
        self.run("recycle", &volume)
    }

    fn delete(&self, volume: Volume) -> PluginFuture<()> {
        self.run("delete", &volume)
    }
}
