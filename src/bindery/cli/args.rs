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

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Parse a `<tag>/<plugin>` storage-class mapping, validating the format.
pub fn parse_storage_class(s: &str) -> Result<(String, String), String> {
    let parts: Vec<&str> = s.splitn(2, '/').collect();
    if parts.len() != 2 || parts[0].is_empty() || parts[1].is_empty() {
        Err(format!(
            "Invalid storage class '{}'. Must be in <tag>/<plugin> format.",
            s
        ))
    } else {
        Ok((parts[0].to_string(), parts[1].to_string()))
    }
}

/// The Bindery persistent-volume control plane.
#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = env!("CARGO_PKG_DESCRIPTION"))]
pub struct Bindery {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the volume binding controller
    Controller(ControllerArgs),
}

#[derive(Args)]
pub struct ControllerArgs {
    /// Map a quality-of-service tag to a provisioner plugin, as
    /// "<tag>/<plugin>" (repeatable)
    #[arg(long = "storage-class", value_name = "TAG/PLUGIN", value_parser = parse_storage_class)]
    pub storage_classes: Vec<(String, String)>,

    /// How often cached objects are resynchronized
    #[arg(long, default_value = "10m")]
    pub sync_period: String,

    /// Number of reconcile workers per resource
    #[arg(long, default_value_t = 4)]
    pub workers: usize,

    /// API endpoint, overriding BINDERY_SERVER
    #[arg(long)]
    pub server: Option<String>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormatArg::Text)]
    pub log_format: LogFormatArg,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum LogFormatArg {
    Text,
    Json,
}

impl std::fmt::Display for LogFormatArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            LogFormatArg::Text => "text",
            LogFormatArg::Json => "json",
        })
    }
}
