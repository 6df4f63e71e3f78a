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

use std::sync::Arc;

use crate::bindery::api::client::DynResult;
use crate::bindery::api::types::{
    annotations, Claim, ClaimPhase, ClaimReference, ClaimStatus, ObjectKey, ReclaimPolicy, Volume,
};
use crate::bindery::controller::{ControllerContext, CoreState};
use crate::bindery::logger::{log_debug, log_error, log_info, log_warn};
use crate::bindery::plugin::{ProvisionerPlugin, VolumeOptions};
use crate::bindery::util::with_context;

const COMPONENT: &str = "claim-controller";

/// Drives one claim toward its fixed point.
///
/// Decision order: verify an existing binding, search the index for a
/// best-fit volume, request dynamic provisioning, otherwise stay Pending.
/// Every step is safe to repeat; a partially completed binding is finished
/// by the next pass.
pub async fn reconcile_claim(
    ctx: &ControllerContext,
    core: &mut CoreState,
    claim: &Claim,
) -> DynResult<ClaimPhase> {
    if let Some(volume_name) = claim.bound_volume() {
        return reconcile_bound_claim(ctx, core, claim, volume_name).await;
    }

    if let Some(candidate) = core.index.find_best_match(claim) {
        return bind(ctx, core, claim, candidate).await;
    }

    if let Some(tag) = claim.qos_tag() {
        if let Some(plugin) = ctx.registry.resolve(tag) {
            return provision(ctx, core, claim, tag, plugin).await;
        }
        log_warn(
            COMPONENT,
            "No plugin registered for quality-of-service tag",
            &[
                ("claim", claim.provisionable_key().as_str()),
                ("tag", tag),
            ],
        );
    }

    log_debug(
        COMPONENT,
        "No matching volume, claim stays pending",
        &[("claim", claim.provisionable_key().as_str())],
    );
    Ok(ClaimPhase::Pending)
}

async fn reconcile_bound_claim(
    ctx: &ControllerContext,
    core: &mut CoreState,
    claim: &Claim,
    volume_name: &str,
) -> DynResult<ClaimPhase> {
    let Some(volume) = ctx.volumes.get(&ObjectKey::cluster(volume_name)) else {
        // The referenced volume has not reached the cache yet; its arrival
        // re-triggers this claim.
        return Ok(ClaimPhase::Pending);
    };

    match &volume.spec.claim_ref {
        Some(reference) if reference.matches(claim) => {
            let desired = ClaimStatus {
                phase: ClaimPhase::Bound,
                capacity: Some(volume.spec.capacity.clone()),
                access_modes: volume.access_modes(),
            };
            if claim.status != desired {
                let mut updated = claim.clone();
                updated.status = desired;
                let written = ctx.client.update_claim_status(updated).await?;
                ctx.claims.store(written);
                log_info(
                    COMPONENT,
                    "Claim bound",
                    &[
                        ("claim", claim.provisionable_key().as_str()),
                        ("volume", volume_name),
                    ],
                );
            }
            Ok(ClaimPhase::Bound)
        }
        // Another claim holds the volume; the volume reconciler detects and
        // reports the mismatch.
        Some(_) => Ok(ClaimPhase::Pending),
        None => {
            // The claim side of the binding exists but the volume never
            // received its back-reference; finish the reciprocation.
            let mut updated = volume.clone();
            updated.spec.claim_ref = Some(ClaimReference::for_claim(claim));
            let written = ctx
                .client
                .update_volume(updated)
                .await
                .map_err(|err| {
                    with_context(err, format!("reciprocating binding on volume '{volume_name}'"))
                })?;
            core.index.add(&written);
            ctx.volumes.store(written);
            Ok(ClaimPhase::Pending)
        }
    }
}

/// Establishes both halves of a binding. The claim is written first; if the
/// volume write then fails, the half-bound pair is completed by the
/// back-reference branch on the next pass.
async fn bind(
    ctx: &ControllerContext,
    core: &mut CoreState,
    claim: &Claim,
    volume: Volume,
) -> DynResult<ClaimPhase> {
    let volume_name = volume.name().to_string();

    let mut updated_claim = claim.clone();
    updated_claim.spec.volume_name = Some(volume_name.clone());
    let written_claim = ctx.client.update_claim(updated_claim).await.map_err(|err| {
        with_context(
            err,
            format!(
                "binding claim '{}' to volume '{}'",
                claim.provisionable_key(),
                volume_name
            ),
        )
    })?;
    ctx.claims.store(written_claim);

    if volume.spec.claim_ref.is_none() {
        let mut updated_volume = volume;
        updated_volume.spec.claim_ref = Some(ClaimReference::for_claim(claim));
        let written = ctx.client.update_volume(updated_volume).await.map_err(|err| {
            with_context(
                err,
                format!("setting claim reference on volume '{volume_name}'"),
            )
        })?;
        core.index.add(&written);
        ctx.volumes.store(written);
    }

    log_info(
        COMPONENT,
        "Selected volume for claim",
        &[
            ("claim", claim.provisionable_key().as_str()),
            ("volume", volume_name.as_str()),
        ],
    );
    Ok(ClaimPhase::Pending)
}

/// Synthesizes a new volume from the plugin template and creates it. The
/// volume flows back through the cache and is realized by the volume
/// reconciler; the claim then finds it as a regular index match.
async fn provision(
    ctx: &ControllerContext,
    core: &mut CoreState,
    claim: &Claim,
    tag: &str,
    plugin: Arc<dyn ProvisionerPlugin>,
) -> DynResult<ClaimPhase> {
    let key = claim.provisionable_key();
    if claim.has_annotation(annotations::PROVISIONING_COMPLETED)
        || core.provisioned_claims.contains(&key)
    {
        return Ok(ClaimPhase::Pending);
    }

    let options = VolumeOptions {
        capacity: claim.requested_capacity().clone(),
        access_modes: claim.spec.access_modes.clone(),
        reclaim_policy: ReclaimPolicy::Delete,
        qos_tag: tag.to_string(),
    };
    let mut template = plugin.new_template(&options).map_err(|err| {
        with_context(err, format!("building volume template for claim '{key}'"))
    })?;
    template.spec.claim_ref = Some(ClaimReference::for_claim(claim));
    template.set_annotation(annotations::PROVISIONED_FOR, &key);
    template.set_annotation(annotations::PROVISIONING_REQUIRED, "true");
    template.set_annotation(annotations::QUALITY_OF_SERVICE, tag);

    let created = ctx
        .client
        .create_volume(template)
        .await
        .map_err(|err| with_context(err, format!("creating provisioned volume for claim '{key}'")))?;
    core.provisioned_claims.insert(key.clone());
    core.index.add(&created);
    log_info(
        COMPONENT,
        "Created volume for claim",
        &[("claim", key.as_str()), ("volume", created.name())],
    );
    ctx.volumes.store(created);

    // Persistent duplicate-provisioning guard; the in-memory set covers the
    // window if this write is lost.
    let mut updated_claim = claim.clone();
    updated_claim.set_annotation(annotations::PROVISIONING_COMPLETED, "true");
    match ctx.client.update_claim(updated_claim).await {
        Ok(written) => ctx.claims.store(written),
        Err(err) => log_error(
            COMPONENT,
            "Failed to mark claim as provisioned",
            &[("claim", key.as_str()), ("error", err.to_string().as_str())],
        ),
    }

    Ok(ClaimPhase::Pending)
}
