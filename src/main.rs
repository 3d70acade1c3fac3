/*
 * Copyright (C) 2026 The Castellan Authors
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

use castellan::castellan::cli::args::{Castellan, Commands};
use castellan::castellan::cli::commands;
use castellan::castellan::logger::{self, log_error, LogFormat};
use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = Castellan::parse();
    if cli.json_logs {
        logger::set_log_format(LogFormat::Json);
    }

    let result = match cli.command {
        Commands::Checkpointer(args) => commands::checkpointer::run(args).await,
        Commands::NodeAgent(args) => commands::node_agent::run(args).await,
        Commands::UpdateController(args) => commands::update_controller::run(args).await,
    };

    if let Err(err) = result {
        log_error("main", "fatal error", &[("error", &err.to_string())]);
        std::process::exit(1);
    }
}
