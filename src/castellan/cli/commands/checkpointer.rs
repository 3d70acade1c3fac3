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
use crate::castellan::checkpoint::manifest::ManifestStore;
use crate::castellan::checkpoint::runtime::LocalPodRuntime;
use crate::castellan::checkpoint::{Checkpointer, CheckpointerConfig};
use crate::castellan::cli::args::CheckpointerArgs;
use crate::castellan::cli::shutdown_token;
use crate::castellan::config::Config;
use std::error::Error;

pub async fn run(args: CheckpointerArgs) -> Result<(), Box<dyn Error + Send + Sync>> {
    let client = ApiClient::new(&ApiConfig::from_env())?;
    let runtime = LocalPodRuntime::new(args.runtime_endpoint)?;

    let active = Config::ActiveManifests.verify()?;
    let inactive = Config::InactiveManifests.verify()?;
    let secret_root = Config::CheckpointSecrets.verify()?;
    let config_map_root = Config::CheckpointConfigMaps.verify()?;
    let manifests = ManifestStore::new(active, inactive);

    let self_pod = match (args.pod_namespace, args.pod_name) {
        (Some(namespace), Some(name)) => Some((namespace, name)),
        _ => None,
    };
    let config = CheckpointerConfig {
        self_pod,
        grace_period: args.checkpoint_grace_period,
        tick_interval: args.tick_interval,
    };

    let checkpointer = Checkpointer::new(
        client,
        runtime,
        manifests,
        secret_root,
        config_map_root,
        config,
    );
    checkpointer.run(shutdown_token()).await;
    Ok(())
}
