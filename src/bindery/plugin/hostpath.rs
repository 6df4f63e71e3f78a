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

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use rand::Rng;

use crate::bindery::api::client::DynResult;
use crate::bindery::api::types::{
    AccessMode, ObjectMeta, Volume, VolumeSource, VolumeSpec, VolumeStatus,
};
use crate::bindery::config::Config;
use crate::bindery::logger::log_info;
use crate::bindery::plugin::{PluginFuture, ProvisionerPlugin, VolumeOptions};
use crate::bindery::util::{new_error, with_context};

const COMPONENT: &str = "hostpath-plugin";
const NAME_SUFFIX_LEN: usize = 8;
const NAME_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Driver backing volumes with plain directories under a configured root.
///
/// All three side effects are idempotent so replays after a crash converge:
/// provisioning an existing directory succeeds, recycling recreates it empty,
/// and deleting an absent directory succeeds.
pub struct HostPathPlugin {
    root: PathBuf,
}

impl HostPathPlugin {
    /// Creates the plugin rooted at `BINDERY_VOLUME_ROOT`, preparing the
    /// directory if necessary.
    pub fn new() -> DynResult<Self> {
        let root = Config::VolumeRoot.verify(None)?;
        Ok(Self { root })
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn generated_name() -> String {
        let mut rng = rand::thread_rng();
        let suffix: String = (0..NAME_SUFFIX_LEN)
            .map(|_| NAME_ALPHABET[rng.gen_range(0..NAME_ALPHABET.len())] as char)
            .collect();
        format!("pv-{suffix}")
    }

    /// Extracts the backing directory, refusing paths outside the root.
    fn backing_path(&self, volume: &Volume) -> DynResult<PathBuf> {
        let VolumeSource::HostPath { path } = &volume.spec.source else {
            return Err(new_error(format!(
                "volume '{}' is not hostPath backed",
                volume.name()
            )));
        };
        let path = Path::new(path);
        if !path.starts_with(&self.root) {
            return Err(new_error(format!(
                "refusing to manage '{}' outside volume root '{}'",
                path.display(),
                self.root.display()
            )));
        }
        Ok(path.to_path_buf())
    }
}

impl ProvisionerPlugin for HostPathPlugin {
    fn name(&self) -> &'static str {
        "hostpath"
    }

    fn can_support(&self, source: &VolumeSource) -> bool {
        matches!(source, VolumeSource::HostPath { .. })
    }

    fn new_template(&self, options: &VolumeOptions) -> DynResult<Volume> {
        let name = Self::generated_name();
        let path = self.root.join(&name);
        // Directory-backed volumes only ever serve a single writer, whatever
        // the claim asked for.
        let access_modes = vec![AccessMode::ReadWriteOnce];
        Ok(Volume {
            metadata: ObjectMeta {
                name: Some(name),
                ..Default::default()
            },
            spec: VolumeSpec {
                capacity: options.capacity.clone(),
                access_modes,
                reclaim_policy: options.reclaim_policy,
                source: VolumeSource::HostPath {
                    path: path.to_string_lossy().into_owned(),
                },
                claim_ref: None,
            },
            status: VolumeStatus::default(),
        })
    }

    fn provision(&self, volume: Volume) -> PluginFuture<()> {
        let path = self.backing_path(&volume);
        Box::pin(async move {
            let path = path?;
            fs::create_dir_all(&path)
                .map_err(|err| with_context(err, format!("provisioning '{}'", path.display())))?;
            log_info(
                COMPONENT,
                "Provisioned backing directory",
                &[("volume", volume.name()), ("path", &path.to_string_lossy())],
            );
            Ok(())
        })
    }

    fn recycle(&self, volume: Volume) -> PluginFuture<()> {
        let path = self.backing_path(&volume);
        Box::pin(async move {
            let path = path?;
            match fs::remove_dir_all(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(with_context(err, format!("scrubbing '{}'", path.display())))
                }
            }
            fs::create_dir_all(&path)
                .map_err(|err| with_context(err, format!("recreating '{}'", path.display())))?;
            log_info(
                COMPONENT,
                "Recycled backing directory",
                &[("volume", volume.name()), ("path", &path.to_string_lossy())],
            );
            Ok(())
        })
    }

    fn delete(&self, volume: Volume) -> PluginFuture<()> {
        let path = self.backing_path(&volume);
        Box::pin(async move {
            let path = path?;
            match fs::remove_dir_all(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(with_context(err, format!("deleting '{}'", path.display())))
                }
            }
            log_info(
                COMPONENT,
                "Deleted backing directory",
                &[("volume", volume.name()), ("path", &path.to_string_lossy())],
            );
            Ok(())
        })
    }
}
