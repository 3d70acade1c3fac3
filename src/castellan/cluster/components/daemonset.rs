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
use crate::castellan::api::types::{DaemonSet, Pod, SYSTEM_NAMESPACE};
use crate::castellan::api::watch::WatchCache;
use crate::castellan::cluster::components::{
    managed_priority, pod_available, selector_string, MIN_READY_WINDOW,
};
use crate::castellan::cluster::version::Version;
use crate::castellan::logger::log_info;
use crate::castellan::util::error::{new_error, with_context};
use crate::castellan::util::poll::poll_immediate;
use std::error::Error;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const COMPONENT: &str = "update.daemonset";

/// The daemon set whose pods include the central API server; its
/// update additionally waits for the discovery endpoint to answer with
/// the target version.
const API_SERVER_COMPONENT: &str = "kube-apiserver";

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const POD_REAPPEAR_TIMEOUT: Duration = Duration::from_secs(120);

/// Rolling-updates one daemon-scheduled set by rewriting its image and
/// deleting outdated pods one at a time.
pub struct DaemonSetUpdater {
    client: ApiClient,
    /// Local mirror of the system namespace's pods, used to confirm a
    /// deleted pod is really gone before judging availability.
    pods: WatchCache<Pod>,
    name: String,
    priority: i32,
}

impl DaemonSetUpdater {
    pub fn new(
        client: ApiClient,
        pods: WatchCache<Pod>,
        daemon_set: &DaemonSet,
    ) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let priority = managed_priority("DaemonSet", &daemon_set.metadata)?;
        let name = daemon_set
            .metadata
            .name
            .clone()
            .ok_or_else(|| new_error("managed daemon set has no name"))?;
        Ok(Self {
            client,
            pods,
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
        let daemon_set = self
            .client
            .get::<DaemonSet>(Some(SYSTEM_NAMESPACE), &self.name)
            .await?;
        for container in &daemon_set.spec.template.spec.containers {
            if container.name == self.name {
                let image = container.image.as_deref().ok_or_else(|| {
                    new_error(format!("daemon set {} container has no image", self.name))
                })?;
                return Version::parse_from_image(image);
            }
        }
        Err(new_error(format!(
            "could not determine version for daemon set {}",
            self.name
        )))
    }

    pub async fn update_to(
        &self,
        target: &Version,
        cancel: &CancellationToken,
    ) -> Result<bool, Box<dyn Error + Send + Sync>> {
        let mut daemon_set = self
            .client
            .get::<DaemonSet>(Some(SYSTEM_NAMESPACE), &self.name)
            .await?;
        let target_image = target.image_string();

        let mut progressed = false;
        for container in &mut daemon_set.spec.template.spec.containers {
            if container.name == self.name && container.image.as_deref() != Some(target_image.as_str())
            {
                log_info(
                    COMPONENT,
                    "updating container image",
                    &[("daemonset", &self.name), ("image", &target_image)],
                );
                container.image = Some(target_image.clone());
                self.client.update(&daemon_set).await?;
                progressed = true;
                break;
            }
        }

        let selector = selector_string(&daemon_set.spec.selector);
        let pods = self
            .client
            .list::<Pod>(Some(SYSTEM_NAMESPACE), Some(&selector))
            .await?;
        log_info(
            COMPONENT,
            "checking pods for outdated versions",
            &[("daemonset", &self.name), ("pods", &pods.items.len().to_string())],
        );

        for pod in &pods.items {
            let pod_version = self.pod_version(pod)?;
            if pod_version.same_version(target) {
                continue;
            }
            let Some(pod_name) = pod.metadata.name.clone() else {
                continue;
            };
            progressed = true;

            log_info(COMPONENT, "deleting outdated pod", &[("pod", &pod_name)]);
            self.client
                .delete::<Pod>(Some(SYSTEM_NAMESPACE), &pod_name)
                .await?;

            poll_immediate(cancel, POLL_INTERVAL, POD_REAPPEAR_TIMEOUT, || {
                let pod_name = pod_name.clone();
                let selector = selector.clone();
                async move {
                    // The deleted pod must first drop out of the local
                    // cache, or the availability check below would
                    // count its stale record.
                    if self.pods.get(Some(SYSTEM_NAMESPACE), &pod_name).is_some() {
                        return Ok(false);
                    }

                    let daemon_set = self
                        .client
                        .get::<DaemonSet>(Some(SYSTEM_NAMESPACE), &self.name)
                        .await?;
                    let desired = daemon_set
                        .status
                        .as_ref()
                        .map(|s| s.desired_number_scheduled)
                        .unwrap_or(0);

                    let current = self
                        .client
                        .list::<Pod>(Some(SYSTEM_NAMESPACE), Some(&selector))
                        .await?;
                    let observed = current.items.len() as i32;
                    let all_available = current
                        .items
                        .iter()
                        .all(|pod| pod_available(pod, MIN_READY_WINDOW));

                    Ok(desired == observed && all_available)
                }
            })
            .await
            .map_err(|err| {
                with_context(
                    err,
                    format!("daemon set {} pod {pod_name} did not reappear", self.name),
                )
            })?;

            if self.name == API_SERVER_COMPONENT {
                self.wait_for_discovery_version(target, cancel).await?;
            }
        }

        Ok(progressed)
    }

    fn pod_version(&self, pod: &Pod) -> Result<Version, Box<dyn Error + Send + Sync>> {
        for container in &pod.spec.containers {
            if container.name == self.name {
                let image = container.image.as_deref().ok_or_else(|| {
                    new_error(format!(
                        "pod {} container has no image",
                        pod.metadata.name.as_deref().unwrap_or("<unnamed>")
                    ))
                })?;
                return Version::parse_from_image(image);
            }
        }
        Err(new_error(format!(
            "unable to get current version for pod {}",
            pod.metadata.name.as_deref().unwrap_or("<unnamed>")
        )))
    }

    /// After replacing an API-server pod the responding server may
    /// still be the old one; block until discovery reports the target
    /// release.
    async fn wait_for_discovery_version(
        &self,
        target: &Version,
        cancel: &CancellationToken,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let expected = (
            target.semver().major,
            target.semver().minor,
            target.semver().patch,
        );
        poll_immediate(cancel, POLL_INTERVAL, POD_REAPPEAR_TIMEOUT, || async move {
            match self.client.server_version().await {
                Ok(info) => match extract_release_triple(&info.git_version) {
                    Some(running) => Ok(running == expected),
                    None => Ok(false),
                },
                // The server may be mid-restart; keep waiting.
                Err(_) => Ok(false),
            }
        })
        .await
        .map_err(|err| with_context(err, "api server did not reach target version"))
    }
}

/// Pulls the first `major.minor.patch` triple out of a version string
/// such as `v1.3.0+coreos.0`.
fn extract_release_triple(input: &str) -> Option<(u64, u64, u64)> {
    for token in input.split(|c: char| !c.is_ascii_digit() && c != '.') {
        let mut parts = token.split('.');
        let triple = (
            parts.next().and_then(|p| p.parse::<u64>().ok()),
            parts.next().and_then(|p| p.parse::<u64>().ok()),
            parts.next().and_then(|p| p.parse::<u64>().ok()),
        );
        if let (Some(major), Some(minor), Some(patch)) = triple {
            return Some((major, minor, patch));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_triple_extraction() {
        assert_eq!(extract_release_triple("v1.3.0"), Some((1, 3, 0)));
        assert_eq!(extract_release_triple("v1.3.0+coreos.0"), Some((1, 3, 0)));
        assert_eq!(extract_release_triple("release v10.2.33-rc.1"), Some((10, 2, 33)));
        assert_eq!(extract_release_triple("devel"), None);
        assert_eq!(extract_release_triple("v1.3"), None);
    }
}
