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

use crate::castellan::api::client::ApiClient;
use crate::castellan::api::types::Node;
use crate::castellan::api::watch::WatchCache;
use crate::castellan::cluster::components::NODE_PRIORITY;
use crate::castellan::cluster::version::Version;
use crate::castellan::logger::log_info;
use crate::castellan::node::{CURRENT_VERSION_ANNOTATION, DESIRED_VERSION_ANNOTATION};
use crate::castellan::util::error::{new_error, with_context};
use crate::castellan::util::poll::poll_immediate;
use std::error::Error;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const COMPONENT: &str = "update.node";

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const NODE_UPDATE_TIMEOUT: Duration = Duration::from_secs(120);

/// Updates every managed node by writing the desired-version
/// annotation and waiting for the node agent on each node to converge.
pub struct NodeUpdater {
    client: ApiClient,
    nodes: WatchCache<Node>,
}

impl NodeUpdater {
    pub fn new(client: ApiClient, nodes: WatchCache<Node>) -> Self {
        Self { client, nodes }
    }

    pub fn name(&self) -> &str {
        "nodes"
    }

    pub fn priority(&self) -> i32 {
        NODE_PRIORITY
    }

    /// The lowest version across managed nodes, so an interrupted
    /// rollout resumes where it left off.
    pub async fn current_version(&self) -> Result<Version, Box<dyn Error + Send + Sync>> {
        let mut lowest: Option<Version> = None;
        for node in self.nodes.items() {
            let name = node.metadata.name.clone().unwrap_or_default();
            let annotation = node
                .metadata
                .annotation(CURRENT_VERSION_ANNOTATION)
                .ok_or_else(|| new_error(format!("no version annotation for node {name}")))?;
            let version = Version::parse_from_image(annotation)
                .map_err(|err| with_context(err, format!("node {name} version")))?;
            lowest = match lowest {
                None => Some(version),
                Some(current) if version.semver() < current.semver() => Some(version),
                Some(current) => Some(current),
            };
        }
        lowest.ok_or_else(|| new_error("unable to get current version for nodes"))
    }

    pub async fn update_to(
        &self,
        target: &Version,
        cancel: &CancellationToken,
    ) -> Result<bool, Box<dyn Error + Send + Sync>> {
        let target_image = target.image_string();
        let mut progressed = false;

        for mut node in self.nodes.items() {
            let Some(name) = node.metadata.name.clone() else {
                continue;
            };
            if node.metadata.annotation(CURRENT_VERSION_ANNOTATION)
                == Some(target_image.as_str())
            {
                continue;
            }
            progressed = true;

            // The annotation delegates the actual mutation to the node
            // agent running on that node.
            log_info(
                COMPONENT,
                "requesting node update",
                &[("node", &name), ("image", &target_image)],
            );
            node.metadata
                .set_annotation(DESIRED_VERSION_ANNOTATION, target_image.clone());
            self.client.update(&node).await?;

            poll_immediate(cancel, POLL_INTERVAL, NODE_UPDATE_TIMEOUT, || {
                let name = name.clone();
                async move {
                    let node = self
                        .nodes
                        .get(None, &name)
                        .ok_or_else(|| new_error(format!("unable to find node {name}")))?;
                    let desired = node.metadata.annotation(DESIRED_VERSION_ANNOTATION);
                    let current = node.metadata.annotation(CURRENT_VERSION_ANNOTATION);
                    Ok(desired.is_some() && desired == current)
                }
            })
            .await
            .map_err(|err| with_context(err, format!("node {name} did not converge")))?;

            log_info(COMPONENT, "node update completed", &[("node", &name)]);
        }

        Ok(progressed)
    }
}
