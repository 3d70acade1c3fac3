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
use crate::castellan::api::types::{Deployment, Pod, ReplicaSet, SYSTEM_NAMESPACE};
use crate::castellan::cluster::components::{
    managed_priority, pod_available, selector_string, MIN_READY_WINDOW,
};
use crate::castellan::cluster::version::Version;
use crate::castellan::logger::log_info;
use crate::castellan::util::error::new_error;
use crate::castellan::util::poll::poll_immediate;
use std::error::Error;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const COMPONENT: &str = "update.deployment";

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const NEW_REPLICA_SET_TIMEOUT: Duration = Duration::from_secs(120);
const ROLLOUT_TIMEOUT: Duration = Duration::from_secs(300);

/// Rolling-updates one replicated deployment. By convention the
/// container to rewrite carries the same name as the deployment.
pub struct DeploymentUpdater {
    client: ApiClient,
    name: String,
    priority: i32,
}

impl DeploymentUpdater {
    pub fn new(
        client: ApiClient,
        deployment: &Deployment,
    ) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let priority = managed_priority("Deployment", &deployment.metadata)?;
        let name = deployment
            .metadata
            .name
            .clone()
            .ok_or_else(|| new_error("managed deployment has no name"))?;
        Ok(Self {
            client,
            name,
            priority,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub async fn current_version(&self) -> Result<Version, Box<dyn Error + Send + Sync>> {
        let deployment = self
            .client
            .get::<Deployment>(Some(SYSTEM_NAMESPACE), &self.name)
            .await?;
        for container in &deployment.spec.template.spec.containers {
            if container.name == self.name {
                let image = container.image.as_deref().ok_or_else(|| {
                    new_error(format!("deployment {} container has no image", self.name))
                })?;
                return Version::parse_from_image(image);
            }
        }
        Err(new_error(format!(
            "could not determine version for deployment {}",
            self.name
        )))
    }

    pub async fn update_to(
        &self,
        target: &Version,
        cancel: &CancellationToken,
    ) -> Result<bool, Box<dyn Error + Send + Sync>> {
        let mut deployment = self
            .client
            .get::<Deployment>(Some(SYSTEM_NAMESPACE), &self.name)
            .await?;
        let desired_replicas = deployment.spec.replicas.unwrap_or(1);
        let target_image = target.image_string();

        let mut mutated = false;
        for container in &mut deployment.spec.template.spec.containers {
            if container.name == self.name && container.image.as_deref() != Some(target_image.as_str())
            {
                container.image = Some(target_image.clone());
                mutated = true;
            }
        }

        if mutated {
            log_info(
                COMPONENT,
                "updating container image",
                &[("deployment", &self.name), ("image", &target_image)],
            );
            self.client.update(&deployment).await?;
        } else if self.rollout_complete(target, desired_replicas).await? {
            // Already targeting this version with a finished rollout.
            return Ok(false);
        }

        // A new replica set must appear for the rewritten template.
        poll_immediate(cancel, POLL_INTERVAL, NEW_REPLICA_SET_TIMEOUT, || async move {
            Ok(self.find_target_replica_set(target).await?.is_some())
        })
        .await?;

        poll_immediate(cancel, POLL_INTERVAL, ROLLOUT_TIMEOUT, || async move {
            self.rollout_complete(target, desired_replicas).await
        })
        .await?;

        Ok(true)
    }

    /// The replica set generated for the target version, identified by
    /// its owner reference and container image.
    async fn find_target_replica_set(
        &self,
        target: &Version,
    ) -> Result<Option<ReplicaSet>, Box<dyn Error + Send + Sync>> {
        let target_image = target.image_string();
        let replica_sets = self
            .client
            .list::<ReplicaSet>(Some(SYSTEM_NAMESPACE), None)
            .await?;
        Ok(replica_sets.items.into_iter().find(|rs| {
            let owned = rs
                .metadata
                .owner_references
                .iter()
                .any(|owner| owner.kind == "Deployment" && owner.name == self.name);
            let at_target = rs
                .spec
                .template
                .spec
                .containers
                .iter()
                .any(|c| c.name == self.name && c.image.as_deref() == Some(target_image.as_str()));
            owned && at_target
        }))
    }

    async fn rollout_complete(
        &self,
        target: &Version,
        desired_replicas: i32,
    ) -> Result<bool, Box<dyn Error + Send + Sync>> {
        let Some(replica_set) = self.find_target_replica_set(target).await? else {
            return Ok(false);
        };

        let selector = selector_string(&replica_set.spec.selector);
        let pods = self
            .client
            .list::<Pod>(Some(SYSTEM_NAMESPACE), Some(&selector))
            .await?;
        let available = pods
            .items
            .iter()
            .filter(|pod| pod_available(pod, MIN_READY_WINDOW))
            .count() as i32;

        let desired = replica_set.spec.replicas.unwrap_or(desired_replicas);
        Ok(available >= desired.max(desired_replicas))
    }
}
