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

//! Cluster Update Controller: advances every managed component to the
//! desired version, one unit of progress per reconciliation cycle, in
//! an order that keeps the cluster operable throughout.

use crate::castellan::api::client::ApiClient;
use crate::castellan::api::types::{
    ConfigMap, DaemonSet, Deployment, Event, EventSource, Node, ObjectMeta, ObjectReference, Pod,
    SYSTEM_NAMESPACE, EVENT_TYPE_NORMAL, EVENT_TYPE_WARNING,
};
use crate::castellan::api::watch::WatchCache;
use crate::castellan::cluster::components::{
    highest_cluster_version, sort_components_by_priority, DaemonSetUpdater, DeploymentUpdater,
    ManagedComponent, NodeUpdater,
};
use crate::castellan::cluster::version::Version;
use crate::castellan::logger::{log_error, log_info, log_warn};
use crate::castellan::util::error::{new_error, with_context};
use chrono::Utc;
use std::error::Error;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

const COMPONENT: &str = "update-controller";

/// Configuration object that carries the desired cluster version.
pub const CLUSTER_CONFIG_MAP_NAME: &str = "cluster-config";
/// Key inside the configuration object holding the version reference.
pub const CLUSTER_VERSION_KEY: &str = "cluster.version";
/// Label selecting the records this controller manages.
pub const MANAGED_LABEL: &str = "update-controller-managed";

const IDLE_SLEEP: Duration = Duration::from_secs(30);
const ERROR_SLEEP: Duration = Duration::from_secs(1);
const PROGRESS_SLEEP: Duration = Duration::from_millis(1);

pub struct UpdateController {
    client: ApiClient,
    config_maps: WatchCache<ConfigMap>,
    daemon_sets: WatchCache<DaemonSet>,
    deployments: WatchCache<Deployment>,
    nodes: WatchCache<Node>,
    pods: WatchCache<Pod>,
}

impl UpdateController {
    /// Builds the controller and starts its watch-derived caches.
    pub fn new(client: ApiClient, cancel: &CancellationToken) -> Self {
        let config_maps = WatchCache::start(
            client.clone(),
            Some(SYSTEM_NAMESPACE.to_string()),
            None,
            cancel.child_token(),
        );
        let daemon_sets = WatchCache::start(
            client.clone(),
            Some(SYSTEM_NAMESPACE.to_string()),
            Some(MANAGED_LABEL.to_string()),
            cancel.child_token(),
        );
        let deployments = WatchCache::start(
            client.clone(),
            Some(SYSTEM_NAMESPACE.to_string()),
            Some(MANAGED_LABEL.to_string()),
            cancel.child_token(),
        );
        let nodes = WatchCache::start(
            client.clone(),
            None,
            Some(MANAGED_LABEL.to_string()),
            cancel.child_token(),
        );
        let pods = WatchCache::start(
            client.clone(),
            Some(SYSTEM_NAMESPACE.to_string()),
            None,
            cancel.child_token(),
        );

        Self {
            client,
            config_maps,
            daemon_sets,
            deployments,
            nodes,
            pods,
        }
    }

    pub async fn wait_synced(&self, cancel: &CancellationToken) {
        self.config_maps.wait_synced(cancel).await;
        self.daemon_sets.wait_synced(cancel).await;
        self.deployments.wait_synced(cancel).await;
        self.nodes.wait_synced(cancel).await;
        self.pods.wait_synced(cancel).await;
    }

    /// Reconciliation loop for one leadership term. Exits when the
    /// token fires; in-memory state does not survive the term.
    pub async fn run(&self, cancel: CancellationToken) {
        log_info(COMPONENT, "update controller running", &[]);
        loop {
            if cancel.is_cancelled() {
                log_info(COMPONENT, "update controller stopping", &[]);
                return;
            }

            let sleep_duration = match self.desired_version() {
                None => ERROR_SLEEP,
                Some(Err(err)) => {
                    log_error(
                        COMPONENT,
                        "invalid desired cluster version",
                        &[("error", &err.to_string())],
                    );
                    ERROR_SLEEP
                }
                Some(Ok(target)) => match self.update_to_version(&target, &cancel).await {
                    Ok(true) => PROGRESS_SLEEP,
                    Ok(false) => IDLE_SLEEP,
                    Err(err) => {
                        log_error(COMPONENT, "update cycle failed", &[("error", &err.to_string())]);
                        ERROR_SLEEP
                    }
                },
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    log_info(COMPONENT, "update controller stopping", &[]);
                    return;
                }
                _ = sleep(sleep_duration) => {}
            }
        }
    }

    fn desired_version(&self) -> Option<Result<Version, Box<dyn Error + Send + Sync>>> {
        let config = self
            .config_maps
            .get(Some(SYSTEM_NAMESPACE), CLUSTER_CONFIG_MAP_NAME)?;
        let reference = config.data.get(CLUSTER_VERSION_KEY)?;
        Some(Version::parse_from_image(reference))
    }

    /// One unit of progress toward `target`. Returns true when some
    /// component moved; false when the whole cluster is already there.
    pub async fn update_to_version(
        &self,
        target: &Version,
        cancel: &CancellationToken,
    ) -> Result<bool, Box<dyn Error + Send + Sync>> {
        let mut components = self.managed_components();
        if components.is_empty() {
            return Err(new_error("no managed components found"));
        }

        let highest = highest_cluster_version(&components).await?;
        sort_components_by_priority(&highest, target, &mut components);

        match run_update_step(&components, target, cancel).await {
            Ok(Some(name)) => {
                self.post_event(
                    EVENT_TYPE_NORMAL,
                    "ComponentUpdated",
                    &format!("Finished update of component {name} to {target}"),
                )
                .await;
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(err) => {
                self.post_event(EVENT_TYPE_WARNING, "ComponentUpdateFailed", &err.to_string())
                    .await;
                Err(err)
            }
        }
    }

    /// Builds the component list from the label-selected caches.
    /// Records with malformed priorities are skipped until they
    /// change.
    fn managed_components(&self) -> Vec<ManagedComponent> {
        let mut components = Vec::new();

        for daemon_set in self.daemon_sets.items() {
            match DaemonSetUpdater::new(self.client.clone(), self.pods.clone(), &daemon_set) {
                Ok(updater) => components.push(ManagedComponent::DaemonSet(updater)),
                Err(err) => {
                    log_warn(
                        COMPONENT,
                        "skipping managed daemon set",
                        &[("error", &err.to_string())],
                    );
                }
            }
        }

        for deployment in self.deployments.items() {
            match DeploymentUpdater::new(self.client.clone(), &deployment) {
                Ok(updater) => components.push(ManagedComponent::Deployment(updater)),
                Err(err) => {
                    log_warn(
                        COMPONENT,
                        "skipping managed deployment",
                        &[("error", &err.to_string())],
                    );
                }
            }
        }

        if !self.nodes.is_empty() {
            components.push(ManagedComponent::Node(NodeUpdater::new(
                self.client.clone(),
                self.nodes.clone(),
            )));
        }

        components
    }

    async fn post_event(&self, event_type: &str, reason: &str, message: &str) {
        let event = Event {
            metadata: ObjectMeta::named(
                Some(SYSTEM_NAMESPACE),
                &format!("castellan-update.{}", Utc::now().timestamp_millis()),
            ),
            involved_object: ObjectReference {
                kind: "ConfigMap".to_string(),
                namespace: Some(SYSTEM_NAMESPACE.to_string()),
                name: CLUSTER_CONFIG_MAP_NAME.to_string(),
            },
            reason: reason.to_string(),
            message: message.to_string(),
            event_type: event_type.to_string(),
            source: EventSource {
                component: COMPONENT.to_string(),
            },
            first_timestamp: None,
            last_timestamp: None,
        };
        if let Err(err) = self.client.post_event(event).await {
            log_warn(COMPONENT, "failed to post event", &[("error", &err.to_string())]);
        }
    }
}

/// Walks the sorted component list and drives the first component that
/// is not yet at the target. Returning after one unit of progress lets
/// the caller re-read the desired state before the next step, so a
/// target change mid-rollout wins over any stale plan.
pub(crate) async fn run_update_step(
    components: &[ManagedComponent],
    target: &Version,
    cancel: &CancellationToken,
) -> Result<Option<String>, Box<dyn Error + Send + Sync>> {
    for component in components {
        log_info(
            COMPONENT,
            "begin update of component",
            &[("component", component.name())],
        );
        let progressed = component.update_to(target, cancel).await.map_err(|err| {
            with_context(
                err,
                format!("failed update of component {}", component.name()),
            )
        })?;
        if progressed {
            log_info(
                COMPONENT,
                "finished update of component",
                &[("component", component.name())],
            );
            return Ok(Some(component.name().to_string()));
        }
        log_info(
            COMPONENT,
            "component already updated, moving on",
            &[("component", component.name())],
        );
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::castellan::cluster::components::FakeComponent;
    use std::sync::{Arc, Mutex};

    fn version(image: &str) -> Version {
        Version::parse_from_image(image).expect("test image")
    }

    fn fleet(calls: &Arc<Mutex<Vec<String>>>) -> Vec<ManagedComponent> {
        vec![
            ManagedComponent::Fake(FakeComponent::new("api", 1, "img:v1.0.0", Arc::clone(calls))),
            ManagedComponent::Fake(FakeComponent::new(
                "scheduler",
                2,
                "img:v1.0.0",
                Arc::clone(calls),
            )),
            ManagedComponent::Fake(FakeComponent::new(
                "proxy",
                3,
                "img:v1.0.0",
                Arc::clone(calls),
            )),
        ]
    }

    #[tokio::test]
    async fn one_step_per_cycle() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let components = fleet(&calls);
        let target = version("img:v2.0.0");

        // First cycle stops at the first component, without invoking
        // the second.
        let progressed = run_update_step(&components, &target, &cancel)
            .await
            .expect("step");
        assert_eq!(progressed.as_deref(), Some("api"));
        assert_eq!(*calls.lock().unwrap(), vec!["api".to_string()]);

        // The next cycle skips the now-updated component and moves the
        // second one.
        calls.lock().unwrap().clear();
        let progressed = run_update_step(&components, &target, &cancel)
            .await
            .expect("step");
        assert_eq!(progressed.as_deref(), Some("scheduler"));
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["api".to_string(), "scheduler".to_string()]
        );
    }

    #[tokio::test]
    async fn converged_cluster_reports_no_progress() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let components = fleet(&calls);
        let target = version("img:v2.0.0");

        for _ in 0..3 {
            run_update_step(&components, &target, &cancel)
                .await
                .expect("step");
        }
        let progressed = run_update_step(&components, &target, &cancel)
            .await
            .expect("step");
        assert!(progressed.is_none());
    }

    #[tokio::test]
    async fn component_errors_carry_the_component_name() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let components = vec![ManagedComponent::Fake(FakeComponent::failing(
            "api",
            1,
            "img:v1.0.0",
            Arc::clone(&calls),
        ))];

        let err = run_update_step(&components, &version("img:v2.0.0"), &cancel)
            .await
            .expect_err("failing component");
        assert!(err.to_string().contains("failed update of component api"));
    }
}
