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

use bindery::bindery::cli::args::{Bindery, Commands};
use bindery::bindery::cli::run_controller;
use bindery::bindery::logger::log_error;
use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = Bindery::parse();
    let result = match cli.command {
        Commands::Controller(args) => run_controller(args).await,
    };
    if let Err(err) = result {
        log_error(
            "main",
            "Controller exited with error",
            &[("error", err.to_string().as_str())],
        );
        std::process::exit(1);
    }
}
