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

pub mod hostpath;
pub mod testing;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::bindery::api::client::{DynResult, DynError};
use crate::bindery::api::quantity::Quantity;
use crate::bindery::api::types::{AccessMode, ReclaimPolicy, Volume, VolumeSource};
use crate::bindery::util::new_error;

pub type PluginFuture<T> = Pin<Box<dyn Future<Output = DynResult<T>> + Send>>;

/// Parameters a provisioner receives when asked for a fresh volume template.
#[derive(Clone, Debug)]
pub struct VolumeOptions {
    pub capacity: Quantity,
    pub access_modes: Vec<AccessMode>,
    pub reclaim_policy: ReclaimPolicy,
    /// The quality-of-service tag the template was requested under.
    pub qos_tag: String,
}

/// A back-end driver able to realize, scrub, and destroy volumes.
///
/// `provision`, `recycle`, and `delete` may block for an unbounded time and
/// may be replayed after a crash, so each must either verify-and-succeed
/// idempotently or fail with a distinguishable error.
pub trait ProvisionerPlugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this driver understands the given backing source.
    fn can_support(&self, source: &VolumeSource) -> bool;

    /// Builds a volume object not yet known to the API. The caller stamps
    /// identity-binding annotations before creating it.
    fn new_template(&self, options: &VolumeOptions) -> DynResult<Volume>;

    /// Realizes the back-end storage for an existing volume object.
    fn provision(&self, volume: Volume) -> PluginFuture<()>;

    /// Scrubs a released volume so it may be offered to a new claim.
    fn recycle(&self, volume: Volume) -> PluginFuture<()>;

    /// Destroys the underlying storage.
    fn delete(&self, volume: Volume) -> PluginFuture<()>;
}

/// Immutable mapping from quality-of-service tag to driver, assembled once at
/// controller startup.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: HashMap<String, Arc<dyn ProvisionerPlugin>>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.plugins.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        tag: impl Into<String>,
        plugin: Arc<dyn ProvisionerPlugin>,
    ) -> DynResult<()> {
        let tag = tag.into();
        if tag.is_empty() {
            return Err(new_error("quality-of-service tag must not be empty"));
        }
        if self.plugins.contains_key(&tag) {
            return Err(new_error(format!(
                "quality-of-service tag '{tag}' is already registered"
            )));
        }
        self.plugins.insert(tag, plugin);
        Ok(())
    }

    pub fn resolve(&self, tag: &str) -> Option<Arc<dyn ProvisionerPlugin>> {
        self.plugins.get(tag).cloned()
    }

    /// Resolves the driver for an existing volume: by its quality-of-service
    /// annotation when present, otherwise by the first driver that supports
    /// its backing source.
    pub fn resolve_for_volume(&self, volume: &Volume) -> Result<Arc<dyn ProvisionerPlugin>, DynError> {
        if let Some(tag) = volume.annotation(crate::bindery::api::types::annotations::QUALITY_OF_SERVICE)
        {
            return self.resolve(tag).ok_or_else(|| {
                new_error(format!(
                    "no plugin registered for quality-of-service tag '{tag}'"
                ))
            });
        }
        self.plugins
            .values()
            .find(|plugin| plugin.can_support(&volume.spec.source))
            .cloned()
            .ok_or_else(|| {
                new_error(format!(
                    "no plugin supports {} volume '{}'",
                    volume.spec.source.kind(),
                    volume.name()
                ))
            })
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.plugins.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MockPlugin;
    use super::*;
    use crate::bindery::api::types::annotations;

    fn mock_registry() -> (PluginRegistry, Arc<MockPlugin>) {
        let plugin = Arc::new(MockPlugin::new());
        let mut registry = PluginRegistry::new();
        registry
            .register("gold", plugin.clone() as Arc<dyn ProvisionerPlugin>)
            .unwrap();
        (registry, plugin)
    }

    #[test]
    fn duplicate_tags_are_rejected() {
        let (mut registry, plugin) = mock_registry();
        let err = registry
            .register("gold", plugin as Arc<dyn ProvisionerPlugin>)
            .unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }

    #[test]
    fn empty_tags_are_rejected() {
        let mut registry = PluginRegistry::new();
        let err = registry
            .register("", Arc::new(MockPlugin::new()) as Arc<dyn ProvisionerPlugin>)
            .unwrap_err();
        assert!(err.to_string().contains("must not be empty"));
    }

    #[test]
    fn resolve_for_volume_prefers_the_qos_annotation() {
        let (registry, plugin) = mock_registry();
        let options = VolumeOptions {
            capacity: Quantity::new("1Gi"),
            access_modes: vec![AccessMode::ReadWriteOnce],
            reclaim_policy: ReclaimPolicy::Delete,
            qos_tag: "gold".to_string(),
        };
        let mut volume = plugin.new_template(&options).unwrap();
        volume.set_annotation(annotations::QUALITY_OF_SERVICE, "gold");

        let resolved = registry.resolve_for_volume(&volume).unwrap();
        assert_eq!(resolved.name(), plugin.name());

        volume.set_annotation(annotations::QUALITY_OF_SERVICE, "unknown");
        assert!(registry.resolve_for_volume(&volume).is_err());
    }

    #[test]
    fn resolve_for_volume_falls_back_to_source_support() {
        let (registry, plugin) = mock_registry();
        let options = VolumeOptions {
            capacity: Quantity::new("1Gi"),
            access_modes: vec![AccessMode::ReadWriteOnce],
            reclaim_policy: ReclaimPolicy::Delete,
            qos_tag: "gold".to_string(),
        };
        let volume = plugin.new_template(&options).unwrap();
        assert!(registry.resolve_for_volume(&volume).is_ok());
    }

    #[test]
    fn tags_are_sorted() {
        let mut registry = PluginRegistry::new();
        registry
            .register("silver", Arc::new(MockPlugin::new()) as Arc<dyn ProvisionerPlugin>)
            .unwrap();
        registry
            .register("bronze", Arc::new(MockPlugin::new()) as Arc<dyn ProvisionerPlugin>)
            .unwrap();
        assert_eq!(registry.tags(), vec!["bronze", "silver"]);
    }
}
