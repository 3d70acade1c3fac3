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

//! Pod Checkpointer: keeps designated control-plane pods runnable on
//! this node even while the central object store is unreachable, by
//! snapshotting them to local manifests and promoting those snapshots
//! when the originals vanish.

pub mod config_map;
pub mod manifest;
pub mod projected;
pub mod runtime;
pub mod secret;

use crate::castellan::api::client::ApiClient;
use crate::castellan::api::types::{ConfigMap, ObjectMeta, Pod, Secret};
use crate::castellan::checkpoint::manifest::ManifestStore;
use crate::castellan::logger::{log_error, log_info, log_warn};
use crate::castellan::util::error::with_context;
use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

const COMPONENT: &str = "checkpointer";

/// Opt-in annotation; the value must be the string `"true"`.
pub const CHECKPOINT_ANNOTATION: &str = "checkpointer.castellan.dev/checkpoint";
/// Marks a manifest as a derived checkpoint of the named parent key.
pub const CHECKPOINT_OF_ANNOTATION: &str = "checkpointer.castellan.dev/checkpoint-of";

/// Checkpoint key of the central API server, which gets an extra
/// discovery health check before its parent counts as live.
pub const API_SERVER_KEY: &str = "kube-system-kube-apiserver";

/// Well-known system pods whose runtime-assigned name suffix is
/// collapsed to a stable key. Fixed list; not extended at runtime.
const COLLAPSED_NAME_PREFIXES: [&str; 2] = ["kube-apiserver", "kube-etcd"];

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(300);

/// Read access to the central object store, narrowed to what the
/// checkpointer consumes.
pub trait RemoteStore {
    fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl std::future::Future<Output = Result<Option<Secret>, Box<dyn Error + Send + Sync>>> + Send;

    fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl std::future::Future<Output = Result<Option<ConfigMap>, Box<dyn Error + Send + Sync>>> + Send;

    fn list_pods(
        &self,
        namespace: &str,
    ) -> impl std::future::Future<Output = Result<Vec<Pod>, Box<dyn Error + Send + Sync>>> + Send;

    fn discovery_healthy(&self) -> impl std::future::Future<Output = bool> + Send;
}

impl RemoteStore for ApiClient {
    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Secret>, Box<dyn Error + Send + Sync>> {
        self.get_opt::<Secret>(Some(namespace), name).await
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, Box<dyn Error + Send + Sync>> {
        self.get_opt::<ConfigMap>(Some(namespace), name).await
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>, Box<dyn Error + Send + Sync>> {
        Ok(self.list::<Pod>(Some(namespace), None).await?.items)
    }

    async fn discovery_healthy(&self) -> bool {
        self.server_version().await.is_ok()
    }
}

/// Read access to the node-local pod runtime.
pub trait PodRuntime {
    fn running_pods(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<Pod>, Box<dyn Error + Send + Sync>>> + Send;
}

/// Stable key a pod is bucketed under: `<namespace>-<collapsed name>`.
pub fn checkpoint_key(namespace: &str, name: &str) -> String {
    format!("{}-{}", namespace, collapse_pod_name(name))
}

fn collapse_pod_name(name: &str) -> &str {
    for prefix in COLLAPSED_NAME_PREFIXES {
        if name.starts_with(prefix) {
            return prefix;
        }
    }
    name
}

#[derive(Default)]
struct PodPair {
    parent: Option<Pod>,
    child: Option<Pod>,
}

/// Buckets local pods by checkpoint key. A pod bearing the opt-in
/// annotation is a parent under its own (collapsed) key; a pod bearing
/// the checkpoint-of annotation is a child under the named key.
fn classify_local_pods(pods: &[Pod]) -> HashMap<String, PodPair> {
    let mut pairs: HashMap<String, PodPair> = HashMap::new();

    for pod in pods {
        let (Some(namespace), Some(name)) =
            (pod.metadata.namespace.as_deref(), pod.metadata.name.as_deref())
        else {
            continue;
        };

        if pod.metadata.annotation(CHECKPOINT_ANNOTATION) == Some("true") {
            let key = checkpoint_key(namespace, name);
            let mut parent = pod.clone();
            parent.metadata.name = Some(collapse_pod_name(name).to_string());
            pairs.entry(key).or_default().parent = Some(parent);
        }

        if let Some(parent_key) = pod.metadata.annotation(CHECKPOINT_OF_ANNOTATION) {
            pairs.entry(parent_key.to_string()).or_default().child = Some(pod.clone());
        }
    }

    pairs
}

/// Reduces a live parent spec to a manifest that replays cleanly as a
/// static pod: identity and status fields that the runtime rejects are
/// stripped, and the manifest is tagged as a checkpoint of its parent.
fn sanitize_checkpoint(parent: &Pod, key: &str) -> Pod {
    let mut pod = parent.clone();
    pod.api_version = "v1".to_string();
    pod.kind = "Pod".to_string();

    let old_meta = std::mem::take(&mut pod.metadata);
    pod.metadata = ObjectMeta {
        name: old_meta.name,
        namespace: old_meta.namespace,
        labels: old_meta.labels,
        ..ObjectMeta::default()
    };
    pod.metadata.set_annotation(CHECKPOINT_OF_ANNOTATION, key);

    pod.spec.service_account_name = None;
    pod.status = None;

    pod.spec
        .volumes
        .retain(|v| !v.name.starts_with("default-token"));
    for container in pod
        .spec
        .containers
        .iter_mut()
        .chain(pod.spec.init_containers.iter_mut())
    {
        container
            .volume_mounts
            .retain(|vm| !vm.name.starts_with("default-token"));
    }

    pod
}

#[derive(Debug, Clone)]
pub struct CheckpointerConfig {
    /// Identity of the checkpointer's own pod, checkpointed straight
    /// to the active directory so it survives without a promotion.
    pub self_pod: Option<(String, String)>,
    /// Store-confirmed parent absence required before full collection.
    pub grace_period: Duration,
    pub tick_interval: Duration,
}

impl Default for CheckpointerConfig {
    fn default() -> Self {
        Self {
            self_pod: None,
            grace_period: DEFAULT_GRACE_PERIOD,
            tick_interval: DEFAULT_TICK_INTERVAL,
        }
    }
}

pub struct Checkpointer<S, R> {
    store: S,
    runtime: R,
    manifests: ManifestStore,
    secret_root: PathBuf,
    config_map_root: PathBuf,
    config: CheckpointerConfig,
    /// First store-confirmed absence per key; cleared whenever the
    /// parent reappears or the store becomes unreachable.
    absent_since: HashMap<String, Instant>,
}

impl<S: RemoteStore, R: PodRuntime> Checkpointer<S, R> {
    pub fn new(
        store: S,
        runtime: R,
        manifests: ManifestStore,
        secret_root: PathBuf,
        config_map_root: PathBuf,
        config: CheckpointerConfig,
    ) -> Self {
        Self {
            store,
            runtime,
            manifests,
            secret_root,
            config_map_root,
            config,
            absent_since: HashMap::new(),
        }
    }

    /// Runs reconciliation ticks until cancelled. The current tick
    /// always finishes before the loop exits.
    pub async fn run(mut self, cancel: CancellationToken) {
        log_info(COMPONENT, "begin pod checkpointing", &[]);
        loop {
            if let Err(err) = self.tick().await {
                log_error(COMPONENT, "tick failed", &[("error", &err.to_string())]);
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    log_info(COMPONENT, "stopping", &[]);
                    return;
                }
                _ = sleep(self.config.tick_interval) => {}
            }
        }
    }

    /// One observe-diff-act pass over every checkpointable pod key.
    pub async fn tick(&mut self) -> Result<(), Box<dyn Error + Send + Sync>> {
        let inactive = self
            .manifests
            .load_inactive()
            .map_err(|err| with_context(err, "failed to load checkpoint manifests"))?;

        let local_pods = match self.runtime.running_pods().await {
            Ok(pods) => pods,
            Err(err) => {
                // An unreachable runtime yields an empty local set,
                // which defers promotion rather than forcing it.
                log_warn(
                    COMPONENT,
                    "local pod runtime unreachable",
                    &[("error", &err.to_string())],
                );
                Vec::new()
            }
        };

        let mut pairs = classify_local_pods(&local_pods);

        // The API server sometimes leaves a manifest behind without a
        // serving process; only a passing discovery check makes it a
        // live parent.
        if pairs
            .get(API_SERVER_KEY)
            .map(|pair| pair.parent.is_some())
            .unwrap_or(false)
            && !self.store.discovery_healthy().await
        {
            log_warn(COMPONENT, "api server not serving, treating as absent", &[]);
            if let Some(pair) = pairs.get_mut(API_SERVER_KEY) {
                pair.parent = None;
            }
        }

        let self_key = self.handle_self_checkpoint(&pairs).await;

        // Identity of each on-disk checkpoint, for collection.
        let mut identities: HashMap<String, (String, String)> = HashMap::new();
        for (key, pod) in &inactive {
            if let (Some(ns), Some(name)) =
                (pod.metadata.namespace.clone(), pod.metadata.name.clone())
            {
                identities.insert(key.clone(), (ns, name));
            }
        }

        let mut keys: HashSet<String> = pairs.keys().cloned().collect();
        keys.extend(inactive.keys().cloned());

        for key in keys {
            if Some(&key) == self_key.as_ref() {
                continue;
            }
            let pair = pairs.remove(&key).unwrap_or_default();
            match (pair.parent, pair.child) {
                (Some(parent), child) => {
                    if let (Some(ns), Some(name)) = (
                        parent.metadata.namespace.clone(),
                        parent.metadata.name.clone(),
                    ) {
                        identities.insert(key.clone(), (ns, name));
                    }

                    if child.is_some() {
                        log_info(
                            COMPONENT,
                            "parent and checkpoint both running, retiring checkpoint",
                            &[("key", &key)],
                        );
                    }
                    // The parent is live: the active copy must go, the
                    // warm standby stays.
                    if self.manifests.active_exists(&key) {
                        if let Err(err) = self.manifests.remove_active(&key) {
                            log_error(
                                COMPONENT,
                                "failed to retire active checkpoint",
                                &[("key", &key), ("error", &err.to_string())],
                            );
                        }
                    }

                    match self.snapshot(&parent, &key).await {
                        Ok(pod) => {
                            if let Err(err) = self.manifests.write_inactive(&key, &pod) {
                                log_error(
                                    COMPONENT,
                                    "failed to write checkpoint manifest",
                                    &[("key", &key), ("error", &err.to_string())],
                                );
                            }
                        }
                        Err(err) => {
                            // Last-known-good wins: the existing
                            // inactive manifest stays untouched.
                            log_warn(
                                COMPONENT,
                                "snapshot failed, keeping previous checkpoint",
                                &[("key", &key), ("error", &err.to_string())],
                            );
                        }
                    }
                }
                (None, _) => {
                    if !self.manifests.active_exists(&key) {
                        if let Some(pod) = inactive.get(&key) {
                            log_info(
                                COMPONENT,
                                "parent vanished, promoting checkpoint",
                                &[("key", &key)],
                            );
                            let mut promoted = pod.clone();
                            promoted
                                .metadata
                                .set_annotation(CHECKPOINT_OF_ANNOTATION, &key);
                            if let Err(err) = self.manifests.write_active(&key, &promoted) {
                                log_error(
                                    COMPONENT,
                                    "failed to promote checkpoint",
                                    &[("key", &key), ("error", &err.to_string())],
                                );
                            }
                        }
                    }
                }
            }
        }

        self.collect_garbage(&identities, self_key.as_deref()).await;
        Ok(())
    }

    /// Writes the checkpointer's own manifest straight to the active
    /// directory; it cannot wait for a promotion it would have to
    /// perform itself.
    async fn handle_self_checkpoint(
        &self,
        pairs: &HashMap<String, PodPair>,
    ) -> Option<String> {
        let (self_namespace, self_name) = self.config.self_pod.clone()?;
        let self_key = checkpoint_key(&self_namespace, &self_name);

        let parent = pairs.get(&self_key).and_then(|pair| pair.parent.clone())?;
        match self.snapshot(&parent, &self_key).await {
            Ok(pod) => {
                if let Err(err) = self.manifests.write_active(&self_key, &pod) {
                    log_error(
                        COMPONENT,
                        "failed to write self checkpoint",
                        &[("key", &self_key), ("error", &err.to_string())],
                    );
                }
            }
            Err(err) => {
                log_warn(
                    COMPONENT,
                    "self snapshot failed",
                    &[("key", &self_key), ("error", &err.to_string())],
                );
            }
        }
        Some(self_key)
    }

    /// Sanitizes the parent spec and materializes its secret,
    /// configMap, and projected dependencies as host paths.
    async fn snapshot(&self, parent: &Pod, key: &str) -> Result<Pod, Box<dyn Error + Send + Sync>> {
        let mut pod = sanitize_checkpoint(parent, key);
        secret::checkpoint_secret_volumes(&self.store, &self.secret_root, &mut pod).await?;
        config_map::checkpoint_config_map_volumes(&self.store, &self.config_map_root, &mut pod)
            .await?;
        projected::checkpoint_projected_volumes(
            &self.store,
            &self.secret_root,
            &self.config_map_root,
            &mut pod,
        )
        .await?;
        Ok(pod)
    }

    /// Fully collects checkpoints whose parent the store has reported
    /// absent (or no longer opted in) for longer than the grace
    /// period. Store-unreachable windows reset the absence clock, so
    /// an outage can never trigger collection.
    async fn collect_garbage(
        &mut self,
        identities: &HashMap<String, (String, String)>,
        self_key: Option<&str>,
    ) {
        let namespaces: HashSet<&String> = identities.values().map(|(ns, _)| ns).collect();

        let mut remote_keys = HashSet::new();
        for namespace in namespaces {
            match self.store.list_pods(namespace).await {
                Ok(pods) => {
                    for pod in pods {
                        if pod.metadata.annotation(CHECKPOINT_ANNOTATION) != Some("true") {
                            continue;
                        }
                        if let (Some(ns), Some(name)) =
                            (pod.metadata.namespace.as_deref(), pod.metadata.name.as_deref())
                        {
                            remote_keys.insert(checkpoint_key(ns, name));
                        }
                    }
                }
                Err(err) => {
                    log_warn(
                        COMPONENT,
                        "store unreachable, deferring checkpoint collection",
                        &[("namespace", namespace), ("error", &err.to_string())],
                    );
                    self.absent_since.clear();
                    return;
                }
            }
        }

        let now = Instant::now();
        let mut collected = Vec::new();
        for (key, (namespace, name)) in identities {
            if Some(key.as_str()) == self_key {
                continue;
            }
            if remote_keys.contains(key) {
                self.absent_since.remove(key);
                continue;
            }
            let since = *self.absent_since.entry(key.clone()).or_insert(now);
            if now.duration_since(since) < self.config.grace_period {
                continue;
            }

            log_info(
                COMPONENT,
                "parent gone past grace period, collecting checkpoint",
                &[("key", key)],
            );
            if let Err(err) = self.remove_checkpoint(key, namespace, name) {
                log_error(
                    COMPONENT,
                    "failed to collect checkpoint",
                    &[("key", key), ("error", &err.to_string())],
                );
            } else {
                collected.push(key.clone());
            }
        }

        for key in collected {
            self.absent_since.remove(&key);
        }
        self.absent_since
            .retain(|key, _| identities.contains_key(key));
    }

    fn remove_checkpoint(
        &self,
        key: &str,
        namespace: &str,
        name: &str,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.manifests.remove_active(key)?;
        self.manifests.remove_inactive(key)?;
        remove_dir_if_present(&secret::pod_secret_path(&self.secret_root, namespace, name))?;
        remove_dir_if_present(&config_map::pod_config_map_path(
            &self.config_map_root,
            namespace,
            name,
        ))?;
        Ok(())
    }
}

fn remove_dir_if_present(dir: &Path) -> Result<(), Box<dyn Error + Send + Sync>> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(with_context(
            err,
            format!("failed to remove checkpoint data '{}'", dir.display()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::castellan::api::types::{PodSpec, VolumeMount, VolumeSpec};

    fn pod(namespace: &str, name: &str, annotations: &[(&str, &str)]) -> Pod {
        let mut meta = ObjectMeta::named(Some(namespace), name);
        for (key, value) in annotations {
            meta.set_annotation(key, *value);
        }
        Pod::new(meta, PodSpec::default())
    }

    #[test]
    fn collapse_applies_to_known_prefixes_only() {
        assert_eq!(collapse_pod_name("kube-apiserver-worker-0"), "kube-apiserver");
        assert_eq!(collapse_pod_name("kube-etcd-0"), "kube-etcd");
        assert_eq!(collapse_pod_name("kube-scheduler-abc"), "kube-scheduler-abc");
        assert_eq!(
            checkpoint_key("kube-system", "kube-apiserver-worker-0"),
            API_SERVER_KEY
        );
    }

    #[test]
    fn classification_buckets_parents_and_children() {
        let pods = vec![
            pod(
                "kube-system",
                "kube-apiserver-worker-0",
                &[(CHECKPOINT_ANNOTATION, "true")],
            ),
            pod(
                "kube-system",
                "kube-apiserver-checkpoint",
                &[(CHECKPOINT_OF_ANNOTATION, API_SERVER_KEY)],
            ),
            pod("kube-system", "kube-proxy-xyz", &[]),
        ];

        let pairs = classify_local_pods(&pods);
        assert_eq!(pairs.len(), 1);
        let pair = &pairs[API_SERVER_KEY];
        assert!(pair.parent.is_some());
        assert!(pair.child.is_some());
        assert_eq!(
            pair.parent.as_ref().unwrap().metadata.name.as_deref(),
            Some("kube-apiserver")
        );
    }

    #[test]
    fn unannotated_pods_are_ignored() {
        let pods = vec![pod("kube-system", "kube-scheduler-abc", &[])];
        assert!(classify_local_pods(&pods).is_empty());
    }

    #[test]
    fn sanitize_strips_identity_and_tags_checkpoint() {
        let mut parent = pod(
            "kube-system",
            "kube-apiserver",
            &[(CHECKPOINT_ANNOTATION, "true")],
        );
        parent.metadata.resource_version = Some("42".to_string());
        parent.spec.service_account_name = Some("default".to_string());
        parent.spec.volumes = vec![
            VolumeSpec {
                name: "default-token-abcde".to_string(),
                ..VolumeSpec::default()
            },
            VolumeSpec {
                name: "certs".to_string(),
                ..VolumeSpec::default()
            },
        ];
        parent.spec.containers = vec![crate::castellan::api::types::ContainerSpec {
            name: "kube-apiserver".to_string(),
            volume_mounts: vec![
                VolumeMount {
                    name: "default-token-abcde".to_string(),
                    mount_path: "/var/run/secrets".to_string(),
                    read_only: Some(true),
                },
                VolumeMount {
                    name: "certs".to_string(),
                    mount_path: "/etc/ssl".to_string(),
                    read_only: Some(true),
                },
            ],
            ..Default::default()
        }];
        parent.status = Some(Default::default());

        let sanitized = sanitize_checkpoint(&parent, API_SERVER_KEY);

        assert_eq!(
            sanitized.metadata.annotation(CHECKPOINT_OF_ANNOTATION),
            Some(API_SERVER_KEY)
        );
        assert!(sanitized.metadata.resource_version.is_none());
        assert!(sanitized.spec.service_account_name.is_none());
        assert!(sanitized.status.is_none());
        assert_eq!(sanitized.spec.volumes.len(), 1);
        assert_eq!(sanitized.spec.volumes[0].name, "certs");
        assert_eq!(sanitized.spec.containers[0].volume_mounts.len(), 1);
        // The opt-in annotation must not survive, or the checkpoint
        // would be re-processed as a parent.
        assert!(sanitized.metadata.annotation(CHECKPOINT_ANNOTATION).is_none());
    }
}
