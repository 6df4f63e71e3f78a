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

use std::collections::{BTreeSet, HashMap};

use crate::bindery::api::types::{
    annotations, mode_signature, signature_modes, AccessMode, Claim, Volume,
};
use crate::bindery::logger::log_warn;

const COMPONENT: &str = "volume-index";

/// Index of volumes grouped by access-mode signature.
///
/// Groups look like:
///
///   "RWO"          [volumes sorted by capacity, smallest first]
///   "RWO+ROX"      [volumes sorted by capacity, smallest first]
///   "RWO+ROX+RWX"  [volumes sorted by capacity, smallest first]
///
/// which allows a claim to be matched against every group able to serve its
/// modes and then against the closest-without-going-under capacity.
#[derive(Default)]
pub struct VolumeIndex {
    groups: HashMap<String, Vec<IndexedVolume>>,
    names: HashMap<String, String>,
}

#[derive(Clone, Debug)]
struct IndexedVolume {
    capacity: i64,
    name: String,
    volume: Volume,
}

impl VolumeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or refreshes a volume. Re-adding the same volume replaces the
    /// previous entry, so repeated adds are idempotent.
    pub fn add(&mut self, volume: &Volume) {
        let name = volume.name().to_string();
        if name.is_empty() {
            return;
        }
        let capacity = match volume.spec.capacity.value() {
            Ok(capacity) => capacity,
            Err(err) => {
                log_warn(
                    COMPONENT,
                    "Skipping volume with unusable capacity",
                    &[("volume", name.as_str()), ("error", err.to_string().as_str())],
                );
                return;
            }
        };

        self.delete(&name);

        let signature = mode_signature(&volume.access_modes());
        let entry = IndexedVolume {
            capacity,
            name: name.clone(),
            volume: volume.clone(),
        };
        let group = self.groups.entry(signature.clone()).or_default();
        let position = group
            .binary_search_by(|probe| {
                (probe.capacity, probe.name.as_str()).cmp(&(entry.capacity, entry.name.as_str()))
            })
            .unwrap_or_else(|insert_at| insert_at);
        group.insert(position, entry);
        self.names.insert(name, signature);
    }

    /// Removes a volume by name. Unknown names are a no-op.
    pub fn delete(&mut self, name: &str) {
        let Some(signature) = self.names.remove(name) else {
            return;
        };
        if let Some(group) = self.groups.get_mut(&signature) {
            group.retain(|entry| entry.name != name);
            if group.is_empty() {
                self.groups.remove(&signature);
            }
        }
    }

    pub fn exists(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Finds the smallest indexed volume able to satisfy the claim.
    ///
    /// Every signature group whose mode set is a superset of the claim's
    /// requested modes is consulted; within a group the first adequate volume
    /// by capacity wins, and across groups the candidate with the smallest
    /// capacity wins, ties broken by name so selection is deterministic.
    pub fn find_best_match(&self, claim: &Claim) -> Option<Volume> {
        let requested: BTreeSet<AccessMode> = claim.spec.access_modes.iter().copied().collect();
        let desired = match claim.requested_capacity().value() {
            Ok(desired) => desired,
            Err(err) => {
                log_warn(
                    COMPONENT,
                    "Claim requests an unusable capacity",
                    &[
                        ("claim", claim.provisionable_key().as_str()),
                        ("error", err.to_string().as_str()),
                    ],
                );
                return None;
            }
        };

        let mut best: Option<&IndexedVolume> = None;
        for (signature, group) in &self.groups {
            if !signature_covers(signature, &requested) {
                continue;
            }
            let start = group.partition_point(|entry| entry.capacity < desired);
            let candidate = group[start..]
                .iter()
                .find(|entry| acceptable_for_claim(entry, claim));
            let Some(candidate) = candidate else {
                continue;
            };
            let better = match best {
                None => true,
                Some(current) => {
                    (candidate.capacity, candidate.name.as_str())
                        < (current.capacity, current.name.as_str())
                }
            };
            if better {
                best = Some(candidate);
            }
        }

        best.map(|entry| entry.volume.clone())
    }
}

fn signature_covers(signature: &str, requested: &BTreeSet<AccessMode>) -> bool {
    let Some(modes) = signature_modes(signature) else {
        return false;
    };
    let offered: BTreeSet<AccessMode> = modes.into_iter().collect();
    requested.is_subset(&offered)
}

/// A volume is usable by a claim when it is unclaimed or already half-bound to
/// that claim, and when any provisioning lineage points at that claim.
fn acceptable_for_claim(entry: &IndexedVolume, claim: &Claim) -> bool {
    if let Some(reference) = &entry.volume.spec.claim_ref {
        if !reference.matches(claim) {
            return false;
        }
    }
    if let Some(owner) = entry.volume.annotation(annotations::PROVISIONED_FOR) {
        if owner != claim.provisionable_key() {
            return false;
        }
    }
    true
}
