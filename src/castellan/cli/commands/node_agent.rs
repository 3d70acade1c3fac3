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

use crate::castellan::api::client::{ApiClient, ApiConfig};
use crate::castellan::cli::args::NodeAgentArgs;
use crate::castellan::cli::shutdown_token;
use crate::castellan::config::Config;
use crate::castellan::node::{Agent, SystemdManager};
use std::error::Error;

pub async fn run(args: NodeAgentArgs) -> Result<(), Box<dyn Error + Send + Sync>> {
    let client = ApiClient::new(&ApiConfig::from_env())?;
    let env_path = Config::RuntimeEnvFile.verify()?;

    let agent = Agent::new(args.node_name, client, SystemdManager, env_path);
    agent.run(shutdown_token()).await;
    Ok(())
}
