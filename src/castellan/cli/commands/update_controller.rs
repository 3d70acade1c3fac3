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
use crate::castellan::api::types::SYSTEM_NAMESPACE;
use crate::castellan::cli::args::UpdateControllerArgs;
use crate::castellan::cli::shutdown_token;
use crate::castellan::cluster::{LeaderElectionConfig, LeaderElector, UpdateController};
use crate::castellan::logger::log_info;
use std::error::Error;

const COMPONENT: &str = "update-controller";

pub async fn run(args: UpdateControllerArgs) -> Result<(), Box<dyn Error + Send + Sync>> {
    let client = ApiClient::new(&ApiConfig::from_env())?;
    let cancel = shutdown_token();
    let elector = LeaderElector::new(
        client.clone(),
        LeaderElectionConfig::new(SYSTEM_NAMESPACE, &args.identity),
    );

    // Candidates block in the election loop; a leader that loses its
    // lease drops all in-memory state and re-enters it.
    loop {
        let Some(lease_lost) = elector.acquire(&cancel).await else {
            return Ok(());
        };

        let term = cancel.child_token();
        let term_trigger = term.clone();
        tokio::spawn(async move {
            lease_lost.cancelled().await;
            term_trigger.cancel();
        });

        let controller = UpdateController::new(client.clone(), &term);
        controller.wait_synced(&term).await;
        controller.run(term).await;

        if cancel.is_cancelled() {
            return Ok(());
        }
        log_info(COMPONENT, "re-entering election", &[]);
    }
}
