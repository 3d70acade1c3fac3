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

//! Managed components: the uniform update capability over replicated
//! deployments, daemon-scheduled sets, and nodes.

pub mod daemonset;
pub mod deployment;
pub mod node;

use crate::castellan::api::types::{LabelSelector, ObjectMeta, Pod};
use crate::castellan::cluster::version::Version;
use crate::castellan::util::error::{new_error, with_context};
use chrono::Utc;
use std::error::Error;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub use daemonset::DaemonSetUpdater;
pub use deployment::DeploymentUpdater;
pub use node::NodeUpdater;

/// Integer priority; lower updates earlier on forward upgrades.
pub const UPDATE_PRIORITY_ANNOTATION: &str = "update-controller.castellan.dev/update-priority";

/// Nodes carry the fixed highest priority so they update last on
/// forward upgrades and first on rollbacks.
pub const NODE_PRIORITY: i32 = i32::MAX;

/// Minimum time a pod must have been ready before it counts as
/// available during a rollout.
pub const MIN_READY_WINDOW: Duration = Duration::from_secs(5);

/// One component the update controller manages. The three concrete
/// updaters are a closed set, so dispatch is a sum type rather than an
/// open interface.
pub enum ManagedComponent {
    Deployment(DeploymentUpdater),
    DaemonSet(DaemonSetUpdater),
    Node(NodeUpdater),
    #[cfg(test)]
    Fake(FakeComponent),
}

impl ManagedComponent {
    pub fn name(&self) -> &str {
        match self {
            ManagedComponent::Deployment(updater) => updater.name(),
            ManagedComponent::DaemonSet(updater) => updater.name(),
            ManagedComponent::Node(updater) => updater.name(),
            #[cfg(test)]
            ManagedComponent::Fake(fake) => fake.name(),
        }
    }

    pub fn priority(&self) -> i32 {
        match self {
            ManagedComponent::Deployment(updater) => updater.priority(),
            ManagedComponent::DaemonSet(updater) => updater.priority(),
            ManagedComponent::Node(updater) => updater.priority(),
            #[cfg(test)]
            ManagedComponent::Fake(fake) => fake.priority(),
        }
    }

    pub async fn current_version(&self) -> Result<Version, Box<dyn Error + Send + Sync>> {
        match self {
            ManagedComponent::Deployment(updater) => updater.current_version().await,
            ManagedComponent::DaemonSet(updater) => updater.current_version().await,
            ManagedComponent::Node(updater) => updater.current_version().await,
            #[cfg(test)]
            ManagedComponent::Fake(fake) => fake.current_version(),
        }
    }

    /// Drives the component one step toward `target`. Returns whether
    /// any mutation was performed; a component already at the target
    /// reports no progress.
    pub async fn update_to(
        &self,
        target: &Version,
        cancel: &CancellationToken,
    ) -> Result<bool, Box<dyn Error + Send + Sync>> {
        match self {
            ManagedComponent::Deployment(updater) => updater.update_to(target, cancel).await,
            ManagedComponent::DaemonSet(updater) => updater.update_to(target, cancel).await,
            ManagedComponent::Node(updater) => updater.update_to(target, cancel).await,
            #[cfg(test)]
            ManagedComponent::Fake(fake) => fake.update_to(target),
        }
    }
}

/// Parses the update-priority annotation off a managed record.
pub fn managed_priority(
    kind: &str,
    meta: &ObjectMeta,
) -> Result<i32, Box<dyn Error + Send + Sync>> {
    let name = meta.name.as_deref().unwrap_or("<unnamed>");
    let raw = meta
        .annotation(UPDATE_PRIORITY_ANNOTATION)
        .ok_or_else(|| {
            new_error(format!(
                "{kind} {name} has no {UPDATE_PRIORITY_ANNOTATION} annotation"
            ))
        })?;
    raw.parse::<i32>().map_err(|err| {
        with_context(
            err,
            format!("{kind} {name} has invalid update priority '{raw}'"),
        )
    })
}

/// Sorts components for the given update direction: ascending priority
/// when the target is at or above the highest observed version,
/// descending (rollback order) otherwise.
pub fn sort_components_by_priority(
    highest: &Version,
    target: &Version,
    components: &mut [ManagedComponent],
) {
    if target.semver() >= highest.semver() {
        components.sort_by_key(|c| c.priority());
    } else {
        components.sort_by_key(|c| std::cmp::Reverse(c.priority()));
    }
}

/// The cluster's effective current version: the highest version any
/// managed component is observed running.
pub async fn highest_cluster_version(
    components: &[ManagedComponent],
) -> Result<Version, Box<dyn Error + Send + Sync>> {
    let mut highest: Option<Version> = None;
    for component in components {
        let version = component.current_version().await.map_err(|err| {
            with_context(
                err,
                format!("unable to get version of component {}", component.name()),
            )
        })?;
        highest = match highest {
            None => Some(version),
            Some(current) if version.semver() > current.semver() => Some(version),
            Some(current) => Some(current),
        };
    }
    highest.ok_or_else(|| new_error("unable to get highest cluster version"))
}

/// A pod is available once it is running, ready, and has stayed ready
/// for the stabilization window.
pub fn pod_available(pod: &Pod, min_ready: Duration) -> bool {
    if !pod.is_running() || !pod.is_ready() {
        return false;
    }
    match pod.ready_since() {
        Some(since) => {
            let elapsed = Utc::now().signed_duration_since(since);
            elapsed.num_milliseconds() >= min_ready.as_millis() as i64
        }
        // No transition timestamp recorded; trust the ready condition.
        None => true,
    }
}

/// Renders a label selector as a store query string.
pub fn selector_string(selector: &LabelSelector) -> String {
    let mut pairs: Vec<String> = selector
        .match_labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    pairs.sort();
    pairs.join(",")
}

#[cfg(test)]
pub struct FakeComponent {
    name: String,
    priority: i32,
    version: std::sync::Mutex<Version>,
    fail: bool,
    calls: std::sync::Arc<std::sync::Mutex<Vec<String>>>,
}

#[cfg(test)]
impl FakeComponent {
    pub fn new(
        name: &str,
        priority: i32,
        image: &str,
        calls: std::sync::Arc<std::sync::Mutex<Vec<String>>>,
    ) -> Self {
        Self {
            name: name.to_string(),
            priority,
            version: std::sync::Mutex::new(Version::parse_from_image(image).expect("test image")),
            fail: false,
            calls,
        }
    }

    pub fn failing(
        name: &str,
        priority: i32,
        image: &str,
        calls: std::sync::Arc<std::sync::Mutex<Vec<String>>>,
    ) -> Self {
        Self {
            fail: true,
            ..Self::new(name, priority, image, calls)
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn current_version(&self) -> Result<Version, Box<dyn Error + Send + Sync>> {
        Ok(self.version.lock().unwrap().clone())
    }

    fn update_to(&self, target: &Version) -> Result<bool, Box<dyn Error + Send + Sync>> {
        self.calls.lock().unwrap().push(self.name.clone());
        if self.fail {
            return Err(new_error("injected update failure"));
        }
        let mut version = self.version.lock().unwrap();
        if version.same_version(target) {
            return Ok(false);
        }
        *version = target.clone();
        Ok(true)
    }
}
