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

use crate::bindery::api::client::DynResult;
use crate::bindery::api::types::{annotations, Claim, ReclaimPolicy, Volume, VolumePhase};
use crate::bindery::controller::operations::{
    operation_complete, operation_pending, OperationKind,
};
use crate::bindery::controller::{ControllerContext, CoreState};
use crate::bindery::logger::{log_error, log_info};
use crate::bindery::util::with_context;

const COMPONENT: &str = "volume-controller";

/// Drives one volume toward its fixed point.
///
/// An unbound volume is made Available; a bound volume whose claim vanished
/// is Released and reclaimed according to policy; provisioning, recycling,
/// and deletion progress through their annotation pairs, with the actual
/// side effects delegated to the operation runner.
pub async fn reconcile_volume(
    ctx: &ControllerContext,
    core: &mut CoreState,
    volume: &Volume,
) -> DynResult<VolumePhase> {
    let Some(reference) = volume.spec.claim_ref.clone() else {
        return reconcile_unbound(ctx, core, volume).await;
    };

    // The cache may be stale; confirm an apparent disappearance with a
    // direct read before treating the claim as gone.
    let claim = match ctx.claims.get(&reference.key()) {
        Some(claim) => Some(claim),
        None => {
            let fetched = ctx
                .client
                .get_claim(reference.namespace.clone(), reference.name.clone())
                .await
                .map_err(|err| {
                    with_context(
                        err,
                        format!("confirming existence of claim '{reference}'"),
                    )
                })?;
            if let Some(claim) = &fetched {
                ctx.claims.store(claim.clone());
            }
            fetched
        }
    };

    let Some(claim) = claim else {
        return reconcile_released(ctx, core, volume).await;
    };

    // A claim that names a different volume means the graph is corrupt;
    // abort loudly instead of guessing.
    if let Some(bound) = claim.bound_volume() {
        if bound != volume.name() {
            return fail(
                ctx,
                core,
                volume,
                format!(
                    "mismatched binding: claim '{}' is bound to volume '{}'",
                    claim.provisionable_key(),
                    bound
                ),
            )
            .await;
        }
    }

    if volume.has_annotation(annotations::PROVISIONING_REQUIRED) {
        if operation_pending(volume, OperationKind::Provision) {
            ctx.operations.request(volume.clone(), OperationKind::Provision);
            let written = ensure_phase(ctx, core, volume, VolumePhase::Pending, None).await?;
            return Ok(written.status.phase);
        }

        let owner = volume
            .annotation(annotations::PROVISIONED_FOR)
            .unwrap_or_default();
        if owner != claim.provisionable_key() {
            return fail(
                ctx,
                core,
                volume,
                format!(
                    "pre-bind mismatch: provisioned for '{}' but referenced by '{}'",
                    owner,
                    claim.provisionable_key()
                ),
            )
            .await;
        }
    }

    record_bound(ctx, core, volume, &claim).await
}

async fn record_bound(
    ctx: &ControllerContext,
    core: &mut CoreState,
    volume: &Volume,
    claim: &Claim,
) -> DynResult<VolumePhase> {
    if volume.status.phase != VolumePhase::Bound {
        log_info(
            COMPONENT,
            "Volume bound",
            &[
                ("volume", volume.name()),
                ("claim", claim.provisionable_key().as_str()),
            ],
        );
    }
    ensure_phase(ctx, core, volume, VolumePhase::Bound, None).await?;
    Ok(VolumePhase::Bound)
}

/// No claim holds the volume: it belongs in the Available pool, without any
/// leftover reclaim markers.
async fn reconcile_unbound(
    ctx: &ControllerContext,
    core: &mut CoreState,
    volume: &Volume,
) -> DynResult<VolumePhase> {
    let stale_keys = [
        annotations::RECYCLE_REQUIRED,
        annotations::RECYCLE_COMPLETED,
        annotations::DELETE_REQUIRED,
        annotations::DELETE_COMPLETED,
    ];
    let current = if stale_keys.iter().any(|key| volume.has_annotation(key)) {
        let mut updated = volume.clone();
        for key in stale_keys {
            updated.clear_annotation(key);
        }
        let written = ctx
            .client
            .update_volume(updated)
            .await
            .map_err(|err| with_context(err, "clearing stale reclaim markers"))?;
        core.index.add(&written);
        ctx.volumes.store(written.clone());
        written
    } else {
        volume.clone()
    };

    ensure_phase(ctx, core, &current, VolumePhase::Available, None).await?;
    Ok(VolumePhase::Available)
}

/// The referenced claim is confirmed gone: sequence Released → reclaim.
async fn reconcile_released(
    ctx: &ControllerContext,
    core: &mut CoreState,
    volume: &Volume,
) -> DynResult<VolumePhase> {
    // A finished recycle returns the volume to the pool.
    if operation_complete(volume, OperationKind::Recycle) {
        let mut updated = volume.clone();
        updated.spec.claim_ref = None;
        updated.clear_annotation(annotations::RECYCLE_REQUIRED);
        updated.clear_annotation(annotations::RECYCLE_COMPLETED);
        let written = ctx
            .client
            .update_volume(updated)
            .await
            .map_err(|err| with_context(err, "returning recycled volume to the pool"))?;
        core.index.add(&written);
        ctx.volumes.store(written.clone());
        log_info(COMPONENT, "Volume recycled", &[("volume", written.name())]);
        ensure_phase(ctx, core, &written, VolumePhase::Available, None).await?;
        return Ok(VolumePhase::Available);
    }

    // A finished delete removes the object; this is the terminal write.
    if operation_complete(volume, OperationKind::Delete) {
        ctx.client
            .delete_volume(volume.name().to_string())
            .await
            .map_err(|err| with_context(err, "deleting reclaimed volume"))?;
        core.index.delete(volume.name());
        ctx.volumes.forget(&volume.key());
        log_info(COMPONENT, "Volume deleted", &[("volume", volume.name())]);
        return Ok(VolumePhase::Released);
    }

    // Make the release visible before any side effect starts. A Failed
    // status from an earlier operation attempt is left in place so the
    // failure stays observable until the retry succeeds.
    let current = if volume.status.phase == VolumePhase::Failed {
        volume.clone()
    } else {
        ensure_phase(ctx, core, volume, VolumePhase::Released, None).await?
    };

    // Stamp the reclaim intent exactly once.
    let already_stamped = current.has_annotation(annotations::RECYCLE_REQUIRED)
        || current.has_annotation(annotations::DELETE_REQUIRED);
    let current = if already_stamped {
        current
    } else {
        let required = match current.spec.reclaim_policy {
            ReclaimPolicy::Recycle => Some(annotations::RECYCLE_REQUIRED),
            ReclaimPolicy::Delete => Some(annotations::DELETE_REQUIRED),
            ReclaimPolicy::Retain => None,
        };
        match required {
            Some(key) => {
                let mut updated = current.clone();
                // Only one operation marker may be live at a time; the
                // provisioning pair is history once reclaim begins.
                updated.clear_annotation(annotations::PROVISIONING_REQUIRED);
                updated.clear_annotation(annotations::PROVISIONING_COMPLETED);
                updated.set_annotation(key, "true");
                let written = ctx
                    .client
                    .update_volume(updated)
                    .await
                    .map_err(|err| with_context(err, "stamping reclaim intent"))?;
                core.index.add(&written);
                ctx.volumes.store(written.clone());
                log_info(
                    COMPONENT,
                    "Volume released",
                    &[
                        ("volume", written.name()),
                        ("policy", written.spec.reclaim_policy.as_str()),
                    ],
                );
                written
            }
            None => {
                // Retain: the volume stays Released until an administrator
                // intervenes.
                return Ok(VolumePhase::Released);
            }
        }
    };

    if operation_pending(&current, OperationKind::Recycle) {
        ctx.operations.request(current.clone(), OperationKind::Recycle);
    } else if operation_pending(&current, OperationKind::Delete) {
        ctx.operations.request(current.clone(), OperationKind::Delete);
    }

    Ok(VolumePhase::Released)
}

async fn fail(
    ctx: &ControllerContext,
    core: &mut CoreState,
    volume: &Volume,
    message: String,
) -> DynResult<VolumePhase> {
    log_error(
        COMPONENT,
        "Volume failed",
        &[("volume", volume.name()), ("reason", message.as_str())],
    );
    ensure_phase(ctx, core, volume, VolumePhase::Failed, Some(message)).await?;
    Ok(VolumePhase::Failed)
}

/// Writes the status when it differs, storing the returned object as the new
/// local truth. A volume already at the desired status produces no write.
async fn ensure_phase(
    ctx: &ControllerContext,
    core: &mut CoreState,
    volume: &Volume,
    phase: VolumePhase,
    message: Option<String>,
) -> DynResult<Volume> {
    if volume.status.phase == phase && volume.status.message == message {
        return Ok(volume.clone());
    }
    let mut updated = volume.clone();
    updated.status.phase = phase;
    updated.status.message = message;
    let written = ctx
        .client
        .update_volume_status(updated)
        .await
        .map_err(|err| {
            with_context(
                err,
                format!("updating volume '{}' status to {}", volume.name(), phase),
            )
        })?;
    core.index.add(&written);
    ctx.volumes.store(written.clone());
    Ok(written)
}
