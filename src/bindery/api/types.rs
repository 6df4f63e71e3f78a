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

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::bindery::api::quantity::Quantity;

/// Reserved annotation keys shared with the remote API and external tooling.
/// The exact strings are part of the wire contract and must not change.
pub mod annotations {
    pub const PROVISIONING_REQUIRED: &str =
        "volume.experimental.kubernetes.io/provisioning-required";
    pub const PROVISIONING_COMPLETED: &str =
        "volume.experimental.kubernetes.io/provisioning-completed";

    pub const RECYCLE_REQUIRED: &str = "volume.experimental.kubernetes.io/recycle-required";
    pub const RECYCLE_COMPLETED: &str = "volume.experimental.kubernetes.io/recycle-completed";

    pub const DELETE_REQUIRED: &str = "volume.experimental.kubernetes.io/delete-required";
    pub const DELETE_COMPLETED: &str = "volume.experimental.kubernetes.io/delete-completed";

    /// `<namespace>/<name>` of the claim a volume was provisioned for.
    pub const PROVISIONED_FOR: &str = "volume.experimental.kubernetes.io/provisioned-for";

    /// Opaque tag selecting a provisioner plugin.
    pub const QUALITY_OF_SERVICE: &str = "volume.experimental.kubernetes.io/quality-of-service";
}

pub(crate) fn normalize_namespace(namespace: Option<&str>) -> String {
    namespace
        .filter(|ns| !ns.is_empty())
        .unwrap_or("default")
        .to_string()
}

/// Standard object metadata shared by volumes and claims.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ObjectMeta {
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
    #[serde(rename = "resourceVersion", skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

/// Metadata included with list responses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListMeta {
    #[serde(rename = "resourceVersion", skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

/// Cache and queue identity: `name` for cluster-scoped volumes,
/// `namespace/name` for claims.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AccessMode {
    #[serde(rename = "RWO")]
    ReadWriteOnce,
    #[serde(rename = "ROX")]
    ReadOnlyMany,
    #[serde(rename = "RWX")]
    ReadWriteMany,
}

impl AccessMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            AccessMode::ReadWriteOnce => "RWO",
            AccessMode::ReadOnlyMany => "ROX",
            AccessMode::ReadWriteMany => "RWX",
        }
    }

    pub fn parse_token(token: &str) -> Option<AccessMode> {
        match token {
            "RWO" => Some(AccessMode::ReadWriteOnce),
            "ROX" => Some(AccessMode::ReadOnlyMany),
            "RWX" => Some(AccessMode::ReadWriteMany),
            _ => None,
        }
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical signature over a set of access modes, e.g. `"RWO+ROX"`.
/// Duplicates are collapsed and the ordering is fixed so equal sets always
/// produce equal strings.
pub fn mode_signature(modes: &[AccessMode]) -> String {
    let mut sorted: Vec<AccessMode> = modes.to_vec();
    sorted.sort();
    sorted.dedup();
    sorted
        .iter()
        .map(|mode| mode.as_str())
        .collect::<Vec<_>>()
        .join("+")
}

/// Parses a signature produced by [`mode_signature`] back into a mode set.
pub fn signature_modes(signature: &str) -> Option<Vec<AccessMode>> {
    signature
        .split('+')
        .map(AccessMode::parse_token)
        .collect::<Option<Vec<_>>>()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReclaimPolicy {
    #[default]
    Retain,
    Recycle,
    Delete,
}

impl ReclaimPolicy {
    pub const fn as_str(self) -> &'static str {
        match self {
            ReclaimPolicy::Retain => "Retain",
            ReclaimPolicy::Recycle => "Recycle",
            ReclaimPolicy::Delete => "Delete",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumePhase {
    #[default]
    Pending,
    Available,
    Bound,
    Released,
    Failed,
}

impl VolumePhase {
    pub const fn as_str(self) -> &'static str {
        match self {
            VolumePhase::Pending => "Pending",
            VolumePhase::Available => "Available",
            VolumePhase::Bound => "Bound",
            VolumePhase::Released => "Released",
            VolumePhase::Failed => "Failed",
        }
    }
}

impl fmt::Display for VolumePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClaimPhase {
    #[default]
    Pending,
    Bound,
}

impl ClaimPhase {
    pub const fn as_str(self) -> &'static str {
        match self {
            ClaimPhase::Pending => "Pending",
            ClaimPhase::Bound => "Bound",
        }
    }
}

impl fmt::Display for ClaimPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Driver-specific backing store for a volume. Exactly one variant is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum VolumeSource {
    #[serde(rename = "hostPath")]
    HostPath { path: String },
    #[serde(rename = "nfs")]
    Nfs {
        server: String,
        path: String,
        #[serde(rename = "readOnly", default)]
        read_only: bool,
    },
    #[serde(rename = "blockDevice")]
    BlockDevice { device: String },
}

impl VolumeSource {
    pub fn kind(&self) -> &'static str {
        match self {
            VolumeSource::HostPath { .. } => "hostPath",
            VolumeSource::Nfs { .. } => "nfs",
            VolumeSource::BlockDevice { .. } => "blockDevice",
        }
    }

    /// Access modes the backing technology can serve when the volume does not
    /// declare its own set.
    pub fn intrinsic_modes(&self) -> Vec<AccessMode> {
        match self {
            VolumeSource::HostPath { .. } => vec![AccessMode::ReadWriteOnce],
            VolumeSource::Nfs { .. } => vec![
                AccessMode::ReadWriteOnce,
                AccessMode::ReadOnlyMany,
                AccessMode::ReadWriteMany,
            ],
            VolumeSource::BlockDevice { .. } => {
                vec![AccessMode::ReadWriteOnce, AccessMode::ReadOnlyMany]
            }
        }
    }
}

/// Back-reference from a volume to the claim that holds it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimReference {
    pub namespace: String,
    pub name: String,
}

impl ClaimReference {
    pub fn for_claim(claim: &Claim) -> Self {
        Self {
            namespace: claim.namespace(),
            name: claim.name().to_string(),
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::namespaced(self.namespace.clone(), self.name.clone())
    }

    pub fn matches(&self, claim: &Claim) -> bool {
        self.namespace == claim.namespace() && self.name == claim.name()
    }
}

impl fmt::Display for ClaimReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub capacity: Quantity,
    #[serde(rename = "accessModes", default, skip_serializing_if = "Vec::is_empty")]
    pub access_modes: Vec<AccessMode>,
    #[serde(rename = "reclaimPolicy", default)]
    pub reclaim_policy: ReclaimPolicy,
    pub source: VolumeSource,
    #[serde(rename = "claimRef", default, skip_serializing_if = "Option::is_none")]
    pub claim_ref: Option<ClaimReference>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeStatus {
    #[serde(default)]
    pub phase: VolumePhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A cluster-scoped piece of durable storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub metadata: ObjectMeta,
    pub spec: VolumeSpec,
    #[serde(default)]
    pub status: VolumeStatus,
}

impl Volume {
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::cluster(self.name())
    }

    /// Declared access modes, falling back to what the source can serve.
    pub fn access_modes(&self) -> Vec<AccessMode> {
        if self.spec.access_modes.is_empty() {
            self.spec.source.intrinsic_modes()
        } else {
            self.spec.access_modes.clone()
        }
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata.annotations.get(key).map(String::as_str)
    }

    pub fn has_annotation(&self, key: &str) -> bool {
        self.metadata.annotations.contains_key(key)
    }

    pub fn set_annotation(&mut self, key: &str, value: &str) {
        self.metadata
            .annotations
            .insert(key.to_string(), value.to_string());
    }

    pub fn clear_annotation(&mut self, key: &str) {
        self.metadata.annotations.remove(key);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequests {
    pub storage: Quantity,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    pub requests: ResourceRequests,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClaimSpec {
    #[serde(default)]
    pub resources: ResourceRequirements,
    #[serde(rename = "accessModes", default, skip_serializing_if = "Vec::is_empty")]
    pub access_modes: Vec<AccessMode>,
    #[serde(rename = "volumeName", default, skip_serializing_if = "Option::is_none")]
    pub volume_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClaimStatus {
    #[serde(default)]
    pub phase: ClaimPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<Quantity>,
    #[serde(rename = "accessModes", default, skip_serializing_if = "Vec::is_empty")]
    pub access_modes: Vec<AccessMode>,
}

/// A namespaced request for storage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub metadata: ObjectMeta,
    pub spec: ClaimSpec,
    #[serde(default)]
    pub status: ClaimStatus,
}

impl Claim {
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> String {
        normalize_namespace(self.metadata.namespace.as_deref())
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::namespaced(self.namespace(), self.name())
    }

    /// `namespace/name` form used by the `provisioned-for` annotation.
    pub fn provisionable_key(&self) -> String {
        format!("{}/{}", self.namespace(), self.name())
    }

    pub fn requested_capacity(&self) -> &Quantity {
        &self.spec.resources.requests.storage
    }

    pub fn bound_volume(&self) -> Option<&str> {
        self.spec
            .volume_name
            .as_deref()
            .filter(|name| !name.is_empty())
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata.annotations.get(key).map(String::as_str)
    }

    pub fn has_annotation(&self, key: &str) -> bool {
        self.metadata.annotations.contains_key(key)
    }

    pub fn set_annotation(&mut self, key: &str, value: &str) {
        self.metadata
            .annotations
            .insert(key.to_string(), value.to_string());
    }

    /// The quality-of-service tag requesting dynamic provisioning, if any.
    pub fn qos_tag(&self) -> Option<&str> {
        self.annotation(annotations::QUALITY_OF_SERVICE)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeList {
    #[serde(default)]
    pub metadata: ListMeta,
    #[serde(default)]
    pub items: Vec<Volume>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClaimList {
    #[serde(default)]
    pub metadata: ListMeta,
    #[serde(default)]
    pub items: Vec<Claim>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchEventType {
    #[serde(rename = "ADDED")]
    Added,
    #[serde(rename = "MODIFIED")]
    Modified,
    #[serde(rename = "DELETED")]
    Deleted,
    #[serde(rename = "ERROR")]
    Error,
}

/// A single entry in a watch stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchEvent<T> {
    #[serde(rename = "type")]
    pub event_type: WatchEventType,
    pub object: T,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_volume() -> Volume {
        Volume {
            metadata: ObjectMeta {
                name: Some("pv-1".to_string()),
                ..Default::default()
            },
            spec: VolumeSpec {
                capacity: Quantity::new("10Gi"),
                access_modes: vec![AccessMode::ReadWriteOnce],
                reclaim_policy: ReclaimPolicy::Retain,
                source: VolumeSource::HostPath {
                    path: "/var/lib/bindery/volumes/pv-1".to_string(),
                },
                claim_ref: None,
            },
            status: VolumeStatus::default(),
        }
    }

    #[test]
    fn mode_signature_is_canonical() {
        assert_eq!(mode_signature(&[AccessMode::ReadWriteOnce]), "RWO");
        assert_eq!(
            mode_signature(&[AccessMode::ReadWriteMany, AccessMode::ReadWriteOnce]),
            "RWO+RWX"
        );
        assert_eq!(
            mode_signature(&[
                AccessMode::ReadOnlyMany,
                AccessMode::ReadWriteOnce,
                AccessMode::ReadOnlyMany
            ]),
            "RWO+ROX"
        );
        assert_eq!(mode_signature(&[]), "");
    }

    #[test]
    fn signature_round_trips() {
        let modes = vec![AccessMode::ReadWriteOnce, AccessMode::ReadWriteMany];
        let signature = mode_signature(&modes);
        assert_eq!(signature_modes(&signature), Some(modes));
        assert_eq!(signature_modes("RWO+XYZ"), None);
    }

    #[test]
    fn volume_source_serializes_as_tagged_union() {
        let volume = sample_volume();
        let value = serde_json::to_value(&volume).unwrap();
        assert!(value["spec"]["source"]["hostPath"]["path"]
            .as_str()
            .unwrap()
            .contains("pv-1"));
        assert_eq!(value["spec"]["reclaimPolicy"], "Retain");
        assert_eq!(value["spec"]["accessModes"][0], "RWO");
    }

    #[test]
    fn volume_without_declared_modes_uses_source_modes() {
        let mut volume = sample_volume();
        volume.spec.access_modes.clear();
        assert_eq!(volume.access_modes(), vec![AccessMode::ReadWriteOnce]);

        volume.spec.source = VolumeSource::Nfs {
            server: "nas".to_string(),
            path: "/exports/a".to_string(),
            read_only: false,
        };
        assert_eq!(volume.access_modes().len(), 3);
    }

    #[test]
    fn claim_keys_normalize_namespace() {
        let claim = Claim {
            metadata: ObjectMeta {
                name: Some("c-1".to_string()),
                namespace: None,
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(claim.provisionable_key(), "default/c-1");
        assert_eq!(claim.key().to_string(), "default/c-1");
    }

    #[test]
    fn claim_reference_matches_its_claim() {
        let claim = Claim {
            metadata: ObjectMeta {
                name: Some("data".to_string()),
                namespace: Some("apps".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let reference = ClaimReference::for_claim(&claim);
        assert!(reference.matches(&claim));
        assert_eq!(reference.to_string(), "apps/data");
        assert_eq!(reference.key(), ObjectKey::namespaced("apps", "data"));
    }

    #[test]
    fn watch_event_decodes_wire_type() {
        let raw = r#"{"type":"DELETED","object":{"metadata":{"name":"c-1"},"spec":{},"status":{}}}"#;
        let event: WatchEvent<Claim> = serde_json::from_str(raw).unwrap();
        assert_eq!(event.event_type, WatchEventType::Deleted);
        assert_eq!(event.object.name(), "c-1");
    }

    #[test]
    fn bound_volume_ignores_empty_names() {
        let mut claim = Claim::default();
        assert!(claim.bound_volume().is_none());
        claim.spec.volume_name = Some(String::new());
        assert!(claim.bound_volume().is_none());
        claim.spec.volume_name = Some("pv-1".to_string());
        assert_eq!(claim.bound_volume(), Some("pv-1"));
    }
}
