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

pub mod args;

use std::sync::Arc;
use std::time::Duration;

use crate::bindery::api::client::{ApiClient, DynResult};
use crate::bindery::cli::args::{ControllerArgs, LogFormatArg};
use crate::bindery::controller::{ControllerSettings, VolumeController};
use crate::bindery::logger::{log_info, set_log_format, LogFormat};
use crate::bindery::plugin::hostpath::HostPathPlugin;
use crate::bindery::plugin::{PluginRegistry, ProvisionerPlugin};
use crate::bindery::util::{new_error, with_context};

const COMPONENT: &str = "main";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Builds the plugin registry from `--storage-class` flags. Plugin
/// registration is one-shot; an unknown plugin name is a startup failure.
pub fn build_registry(storage_classes: &[(String, String)]) -> DynResult<PluginRegistry> {
    let mut registry = PluginRegistry::new();
    let mut hostpath: Option<Arc<HostPathPlugin>> = None;

    for (tag, plugin_name) in storage_classes {
        let plugin: Arc<dyn ProvisionerPlugin> = match plugin_name.as_str() {
            "hostpath" => {
                let shared = match &hostpath {
                    Some(existing) => Arc::clone(existing),
                    None => {
                        let created = Arc::new(HostPathPlugin::new()?);
                        hostpath = Some(Arc::clone(&created));
                        created
                    }
                };
                shared
            }
            other => {
                return Err(new_error(format!(
                    "unknown provisioner plugin '{other}' for storage class '{tag}'"
                )))
            }
        };
        registry.register(tag.clone(), plugin)?;
        log_info(
            COMPONENT,
            "Registered provisioner",
            &[("tag", tag.as_str()), ("plugin", plugin_name.as_str())],
        );
    }

    Ok(registry)
}

/// Brings up the controller and runs until interrupted.
pub async fn run_controller(args: ControllerArgs) -> DynResult<()> {
    set_log_format(match args.log_format {
        LogFormatArg::Text => LogFormat::Text,
        LogFormatArg::Json => LogFormat::Json,
    });

    let sync_period = humantime::parse_duration(&args.sync_period)
        .map_err(|err| with_context(err, "invalid --sync-period"))?;
    let registry = build_registry(&args.storage_classes)?;
    if registry.is_empty() {
        log_info(
            COMPONENT,
            "No storage classes configured, dynamic provisioning is disabled",
            &[],
        );
    }

    let client = match &args.server {
        Some(endpoint) => ApiClient::new(endpoint)?,
        None => ApiClient::from_env()?,
    };

    let controller = VolumeController::new(
        Arc::new(client),
        Arc::new(registry),
        ControllerSettings {
            sync_period,
            workers: args.workers,
        },
    );
    controller.run();

    tokio::signal::ctrl_c()
        .await
        .map_err(|err| with_context(err, "waiting for shutdown signal"))?;
    log_info(COMPONENT, "Interrupt received, shutting down", &[]);
    controller.stop(SHUTDOWN_GRACE).await;
    Ok(())
}
