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

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::bindery::api::client::{ControllerClient, DynResult};
use crate::bindery::api::types::{annotations, Volume, VolumePhase};
use crate::bindery::logger::{log_error, log_info, log_warn};
use crate::bindery::plugin::PluginRegistry;

const COMPONENT: &str = "operation-runner";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationKind {
    Provision,
    Recycle,
    Delete,
}

impl OperationKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            OperationKind::Provision => "provision",
            OperationKind::Recycle => "recycle",
            OperationKind::Delete => "delete",
        }
    }

    pub const fn required_annotation(self) -> &'static str {
        match self {
            OperationKind::Provision => annotations::PROVISIONING_REQUIRED,
            OperationKind::Recycle => annotations::RECYCLE_REQUIRED,
            OperationKind::Delete => annotations::DELETE_REQUIRED,
        }
    }

    pub const fn completed_annotation(self) -> &'static str {
        match self {
            OperationKind::Provision => annotations::PROVISIONING_COMPLETED,
            OperationKind::Recycle => annotations::RECYCLE_COMPLETED,
            OperationKind::Delete => annotations::DELETE_COMPLETED,
        }
    }
}

/// The operation has been requested on the volume but has not reported
/// success yet.
pub fn operation_pending(volume: &Volume, kind: OperationKind) -> bool {
    volume.has_annotation(kind.required_annotation())
        && !volume.has_annotation(kind.completed_annotation())
}

/// The operation has been requested and has reported success.
pub fn operation_complete(volume: &Volume, kind: OperationKind) -> bool {
    volume.has_annotation(kind.required_annotation())
        && volume.has_annotation(kind.completed_annotation())
}

/// Executes provision/recycle/delete calls in background tasks with
/// per-volume exclusion.
///
/// `request` installs a busy marker for the volume name; while the marker is
/// held, further requests for the same volume are rejected immediately, so a
/// reconciler firing twice in quick succession never launches two concurrent
/// side effects against one volume. Different volumes proceed in parallel.
#[derive(Clone)]
pub struct OperationRunner {
    inner: Arc<RunnerInner>,
}

struct RunnerInner {
    client: Arc<dyn ControllerClient>,
    registry: Arc<PluginRegistry>,
    busy: Mutex<HashSet<String>>,
    shutdown: CancellationToken,
    in_flight: AtomicUsize,
    drained: Notify,
}

impl OperationRunner {
    pub fn new(client: Arc<dyn ControllerClient>, registry: Arc<PluginRegistry>) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                client,
                registry,
                busy: Mutex::new(HashSet::new()),
                shutdown: CancellationToken::new(),
                in_flight: AtomicUsize::new(0),
                drained: Notify::new(),
            }),
        }
    }

    /// Schedules the operation unless one is already running for this volume
    /// or the runner is shutting down. Returns whether the task was started.
    pub fn request(&self, volume: Volume, kind: OperationKind) -> bool {
        if self.inner.shutdown.is_cancelled() {
            return false;
        }
        let name = volume.name().to_string();
        if name.is_empty() {
            return false;
        }
        {
            let mut busy = self.lock_busy();
            if !busy.insert(name.clone()) {
                return false;
            }
        }
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        log_info(
            COMPONENT,
            "Starting volume operation",
            &[("volume", name.as_str()), ("operation", kind.as_str())],
        );
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            run_operation(inner, volume, kind).await;
        });
        true
    }

    /// Whether an operation is currently in flight for the volume.
    pub fn busy(&self, name: &str) -> bool {
        self.lock_busy().contains(name)
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Stops accepting work and waits up to `grace` for in-flight operations.
    /// Operations still running afterwards are abandoned; the surviving
    /// `*-required` annotations re-trigger them after a restart.
    pub async fn drain(&self, grace: Duration) {
        self.inner.shutdown.cancel();
        let deadline = Instant::now() + grace;
        loop {
            if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            let notified = self.inner.drained.notified();
            if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            if timeout_at(deadline, notified).await.is_err() {
                let remaining = self.inner.in_flight.load(Ordering::SeqCst);
                log_warn(
                    COMPONENT,
                    "Grace period elapsed, abandoning in-flight operations",
                    &[("remaining", remaining.to_string().as_str())],
                );
                return;
            }
        }
    }

    fn lock_busy(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.inner
            .busy
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn run_operation(inner: Arc<RunnerInner>, volume: Volume, kind: OperationKind) {
    let name = volume.name().to_string();
    let result = execute(&inner, volume, kind).await;

    match result {
        Ok(()) => record_success(&inner, &name, kind).await,
        Err(err) => {
            log_error(
                COMPONENT,
                "Volume operation failed",
                &[
                    ("volume", name.as_str()),
                    ("operation", kind.as_str()),
                    ("error", err.to_string().as_str()),
                ],
            );
            record_failure(&inner, &name, kind, &err.to_string()).await;
        }
    }

    {
        let mut busy = inner
            .busy
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        busy.remove(&name);
    }
    if inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
        inner.drained.notify_waiters();
    }
}

async fn execute(inner: &RunnerInner, volume: Volume, kind: OperationKind) -> DynResult<()> {
    let plugin = inner.registry.resolve_for_volume(&volume)?;
    match kind {
        OperationKind::Provision => plugin.provision(volume).await,
        OperationKind::Recycle => plugin.recycle(volume).await,
        OperationKind::Delete => plugin.delete(volume).await,
    }
}

/// Stamps the completed annotation on the freshest version of the volume so
/// the write does not clobber reconciler updates made while the plugin ran.
async fn record_success(inner: &RunnerInner, name: &str, kind: OperationKind) {
    match inner.client.get_volume(name.to_string()).await {
        Ok(Some(mut latest)) => {
            if latest.has_annotation(kind.completed_annotation()) {
                return;
            }
            latest.set_annotation(kind.completed_annotation(), "true");
            if let Err(err) = inner.client.update_volume(latest).await {
                log_error(
                    COMPONENT,
                    "Failed to record operation completion",
                    &[
                        ("volume", name),
                        ("operation", kind.as_str()),
                        ("error", err.to_string().as_str()),
                    ],
                );
            } else {
                log_info(
                    COMPONENT,
                    "Volume operation completed",
                    &[("volume", name), ("operation", kind.as_str())],
                );
            }
        }
        Ok(None) => {
            log_warn(
                COMPONENT,
                "Volume vanished before completion could be recorded",
                &[("volume", name), ("operation", kind.as_str())],
            );
        }
        Err(err) => {
            log_error(
                COMPONENT,
                "Failed to re-read volume after operation",
                &[("volume", name), ("error", err.to_string().as_str())],
            );
        }
    }
}

async fn record_failure(inner: &RunnerInner, name: &str, kind: OperationKind, message: &str) {
    match inner.client.get_volume(name.to_string()).await {
        Ok(Some(mut latest)) => {
            let message = Some(format!("{} failed: {}", kind.as_str(), message));
            // An unchanged failure is not written again, so a persistently
            // broken volume retries on resync rather than on its own echo.
            if latest.status.phase == VolumePhase::Failed && latest.status.message == message {
                return;
            }
            latest.status.phase = VolumePhase::Failed;
            latest.status.message = message;
            if let Err(err) = inner.client.update_volume_status(latest).await {
                log_error(
                    COMPONENT,
                    "Failed to record operation failure",
                    &[("volume", name), ("error", err.to_string().as_str())],
                );
            }
        }
        Ok(None) => {}
        Err(err) => {
            log_error(
                COMPONENT,
                "Failed to re-read volume after failed operation",
                &[("volume", name), ("error", err.to_string().as_str())],
            );
        }
    }
}
