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

//! Node Agent: converges the on-disk runtime configuration and the
//! managed system service to the desired state expressed in this
//! node's annotations, then reports the on-disk state back.

use crate::castellan::api::client::ApiClient;
use crate::castellan::api::types::{ConfigMap, Node, SYSTEM_NAMESPACE};
use crate::castellan::api::watch::{CacheEventType, WatchCache};
use crate::castellan::logger::{log_error, log_info};
use crate::castellan::node::env_file::{parse_env_file, write_env_file};
use crate::castellan::node::service::{ServiceManager, RESTART_DONE};
use crate::castellan::util::error::{new_error, with_context};
use std::collections::BTreeMap;
use std::error::Error;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

const COMPONENT: &str = "node-agent";

/// JSON string map describing the desired runtime configuration.
pub const DESIRED_CONFIG_ANNOTATION: &str = "node-agent.castellan.dev/desired-config";
/// JSON string map reflecting the on-disk state after reconciliation.
pub const CURRENT_CONFIG_ANNOTATION: &str = "node-agent.castellan.dev/current-config";
/// Bare image reference written by the update controller; folded into
/// the effective desired config as its version.
pub const DESIRED_VERSION_ANNOTATION: &str = "node-agent.castellan.dev/desired-version";
/// Bare image reference actually in the on-disk env file.
pub const CURRENT_VERSION_ANNOTATION: &str = "node-agent.castellan.dev/current-version";

pub const RUNTIME_VERSION_KEY: &str = "RUNTIME_VERSION";
pub const RUNTIME_FLAGS_KEY: &str = "RUNTIME_FLAGS";
pub const RUNTIME_CONFIG_KEY: &str = "RUNTIME_CONFIG";
/// Key inside the referenced configuration object holding the flags.
pub const CONFIG_MAP_FLAGS_KEY: &str = "runtime-flags";
/// The managed system unit.
pub const RUNTIME_UNIT: &str = "castellan-runtime.service";

const ON_DISK_CONFIG_PLACEHOLDER: &str = "on-disk configuration";

/// Resolves the node's effective desired configuration. The JSON map
/// is the primary contract; a bare desired-version annotation
/// overrides (or supplies) the version key alone.
pub fn effective_desired_config(
    node: &Node,
) -> Result<Option<BTreeMap<String, String>>, Box<dyn Error + Send + Sync>> {
    let mut desired: Option<BTreeMap<String, String>> = None;

    if let Some(raw) = node.metadata.annotation(DESIRED_CONFIG_ANNOTATION) {
        let parsed: BTreeMap<String, String> = serde_json::from_str(raw).map_err(|err| {
            with_context(
                err,
                format!("error unmarshaling config from {DESIRED_CONFIG_ANNOTATION}"),
            )
        })?;
        desired = Some(parsed);
    }

    if let Some(version) = node.metadata.annotation(DESIRED_VERSION_ANNOTATION) {
        desired
            .get_or_insert_with(BTreeMap::new)
            .insert(RUNTIME_VERSION_KEY.to_string(), version.to_string());
    }

    Ok(desired)
}

pub fn validate_config(
    desired: &BTreeMap<String, String>,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    match desired.get(RUNTIME_VERSION_KEY) {
        Some(version) if !version.is_empty() => Ok(()),
        _ => Err(new_error(format!(
            "configuration annotation does not contain required key: {RUNTIME_VERSION_KEY}"
        ))),
    }
}

/// Whether the on-disk file disagrees with the desired version or the
/// flags carried by the referenced configuration object.
pub fn config_has_changed(
    on_disk: &BTreeMap<String, String>,
    desired: &BTreeMap<String, String>,
    config_flags: Option<&str>,
) -> bool {
    if on_disk.get(RUNTIME_VERSION_KEY) != desired.get(RUNTIME_VERSION_KEY) {
        return true;
    }
    if let Some(flags) = config_flags {
        if on_disk.get(RUNTIME_FLAGS_KEY).map(String::as_str) != Some(flags) {
            return true;
        }
    }
    false
}

fn merge_env(
    on_disk: &BTreeMap<String, String>,
    desired: &BTreeMap<String, String>,
    config_flags: Option<&str>,
) -> BTreeMap<String, String> {
    let mut merged = on_disk.clone();
    if let Some(version) = desired.get(RUNTIME_VERSION_KEY) {
        merged.insert(RUNTIME_VERSION_KEY.to_string(), version.clone());
    }
    if let Some(flags) = config_flags {
        merged.insert(RUNTIME_FLAGS_KEY.to_string(), flags.to_string());
    }
    merged
}

/// Rewrites the node's current-config and current-version annotations
/// from the on-disk file, which is the source of truth.
fn publish_current_state(
    node: &mut Node,
    on_disk: &BTreeMap<String, String>,
    config_name: Option<&str>,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let mut current = BTreeMap::new();
    current.insert(
        RUNTIME_VERSION_KEY.to_string(),
        on_disk.get(RUNTIME_VERSION_KEY).cloned().unwrap_or_default(),
    );
    current.insert(
        RUNTIME_FLAGS_KEY.to_string(),
        on_disk.get(RUNTIME_FLAGS_KEY).cloned().unwrap_or_default(),
    );
    current.insert(
        RUNTIME_CONFIG_KEY.to_string(),
        config_name.unwrap_or(ON_DISK_CONFIG_PLACEHOLDER).to_string(),
    );
    let encoded = serde_json::to_string(&current)
        .map_err(|err| with_context(err, "error attempting to marshal current config"))?;
    node.metadata.set_annotation(CURRENT_CONFIG_ANNOTATION, encoded);

    if let Some(version) = on_disk.get(RUNTIME_VERSION_KEY) {
        node.metadata
            .set_annotation(CURRENT_VERSION_ANNOTATION, version.clone());
    }
    Ok(())
}

/// Applies one desired configuration to disk and the managed unit,
/// then updates the node's current-state annotations in place.
///
/// The service is never restarted before the new env file is
/// atomically installed, and the annotations always reflect the file
/// as re-read after the restart. Returns whether a restart happened.
pub async fn apply_config_update<M: ServiceManager>(
    service: &M,
    env_path: &Path,
    node: &mut Node,
    desired: &BTreeMap<String, String>,
    config_flags: Option<&str>,
) -> Result<bool, Box<dyn Error + Send + Sync>> {
    let on_disk = parse_env_file(env_path)?;
    let mut restarted = false;

    if config_has_changed(&on_disk, desired, config_flags) {
        let merged = merge_env(&on_disk, desired, config_flags);
        write_env_file(env_path, &merged)?;
        service.reload().await?;
        let status = service.restart_unit(RUNTIME_UNIT).await?;
        if status != RESTART_DONE {
            return Err(new_error(format!(
                "unexpected status received from service manager: {status}"
            )));
        }
        restarted = true;
    }

    let on_disk = parse_env_file(env_path)?;
    publish_current_state(node, &on_disk, desired.get(RUNTIME_CONFIG_KEY).map(String::as_str))?;
    Ok(restarted)
}

/// Per-node agent process: watches this node's record and reconciles
/// on every observed change.
pub struct Agent<M> {
    node_name: String,
    client: ApiClient,
    service: M,
    env_path: PathBuf,
}

impl<M: ServiceManager> Agent<M> {
    pub fn new(node_name: String, client: ApiClient, service: M, env_path: PathBuf) -> Self {
        Self {
            node_name,
            client,
            service,
            env_path,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        log_info(
            COMPONENT,
            "starting node agent",
            &[("node", &self.node_name)],
        );

        let nodes =
            WatchCache::<Node>::start(self.client.clone(), None, None, cancel.child_token());
        let config_maps = WatchCache::<ConfigMap>::start(
            self.client.clone(),
            Some(SYSTEM_NAMESPACE.to_string()),
            None,
            cancel.child_token(),
        );
        nodes.wait_synced(&cancel).await;
        config_maps.wait_synced(&cancel).await;

        let mut events = nodes.subscribe();
        if let Some(node) = nodes.get(None, &self.node_name) {
            self.reconcile(node, &config_maps).await;
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log_info(COMPONENT, "stopping", &[]);
                    return;
                }
                event = events.recv() => match event {
                    Some(event) => {
                        let matches_node = event.object.metadata.name.as_deref()
                            == Some(self.node_name.as_str());
                        if matches_node && event.event_type != CacheEventType::Deleted {
                            self.reconcile(event.object, &config_maps).await;
                        }
                    }
                    None => return,
                }
            }
        }
    }

    async fn reconcile(&self, mut node: Node, config_maps: &WatchCache<ConfigMap>) {
        log_info(COMPONENT, "begin node reconciliation", &[]);

        let desired = match effective_desired_config(&node) {
            Ok(desired) => desired,
            Err(err) => {
                log_error(COMPONENT, "invalid desired config", &[("error", &err.to_string())]);
                return;
            }
        };

        let Some(desired) = desired else {
            // No desired state yet. Publish the on-disk configuration
            // once so controllers can see where this node stands.
            if node.metadata.annotation(CURRENT_CONFIG_ANNOTATION).is_none() {
                match parse_env_file(&self.env_path) {
                    Ok(on_disk) => {
                        if publish_current_state(&mut node, &on_disk, None).is_ok() {
                            self.update_node(&node).await;
                        }
                    }
                    Err(err) => {
                        log_error(
                            COMPONENT,
                            "failed to read env file",
                            &[("error", &err.to_string())],
                        );
                    }
                }
            }
            return;
        };

        if let Err(err) = validate_config(&desired) {
            log_error(COMPONENT, "rejecting desired config", &[("error", &err.to_string())]);
            return;
        }

        let config_flags = match desired.get(RUNTIME_CONFIG_KEY) {
            Some(name) => match config_maps.get(Some(SYSTEM_NAMESPACE), name) {
                Some(cm) => Some(cm.data.get(CONFIG_MAP_FLAGS_KEY).cloned().unwrap_or_default()),
                None => {
                    log_error(
                        COMPONENT,
                        "configuration object does not exist",
                        &[("name", name)],
                    );
                    return;
                }
            },
            None => None,
        };

        match apply_config_update(
            &self.service,
            &self.env_path,
            &mut node,
            &desired,
            config_flags.as_deref(),
        )
        .await
        {
            Ok(restarted) => {
                if restarted {
                    log_info(COMPONENT, "runtime restarted with new configuration", &[]);
                }
                self.update_node(&node).await;
            }
            Err(err) => {
                log_error(
                    COMPONENT,
                    "failed to apply desired config",
                    &[("error", &err.to_string())],
                );
            }
        }
    }

    async fn update_node(&self, node: &Node) {
        if let Err(err) = self.client.update(node).await {
            // The next observation retries the annotation update.
            log_error(
                COMPONENT,
                "failed to update node annotations",
                &[("error", &err.to_string())],
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::castellan::api::types::ObjectMeta;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeManager {
        reloads: AtomicU32,
        restarts: AtomicU32,
        status: Mutex<Option<String>>,
    }

    impl FakeManager {
        fn failing(status: &str) -> Self {
            Self {
                status: Mutex::new(Some(status.to_string())),
                ..Self::default()
            }
        }
    }

    impl ServiceManager for FakeManager {
        async fn reload(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
            self.reloads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn restart_unit(&self, _unit: &str) -> Result<String, Box<dyn Error + Send + Sync>> {
            self.restarts.fetch_add(1, Ordering::SeqCst);
            let status = self.status.lock().unwrap().clone();
            Ok(status.unwrap_or_else(|| RESTART_DONE.to_string()))
        }
    }

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn node_with_annotations(pairs: &[(&str, &str)]) -> Node {
        let mut node = Node {
            metadata: ObjectMeta::named(None, "worker-0"),
            ..Node::default()
        };
        for (key, value) in pairs {
            node.metadata.set_annotation(key, *value);
        }
        node
    }

    #[test]
    fn change_detection() {
        let on_disk = env(&[
            (RUNTIME_VERSION_KEY, "version1"),
            (RUNTIME_FLAGS_KEY, "--peers='test'"),
        ]);

        // Nothing changed.
        assert!(!config_has_changed(
            &on_disk,
            &env(&[(RUNTIME_VERSION_KEY, "version1")]),
            Some("--peers='test'"),
        ));
        // Version changed.
        assert!(config_has_changed(
            &on_disk,
            &env(&[(RUNTIME_VERSION_KEY, "version2")]),
            Some("--peers='test'"),
        ));
        // Flags changed.
        assert!(config_has_changed(
            &on_disk,
            &env(&[(RUNTIME_VERSION_KEY, "version1")]),
            Some("--peers='other'"),
        ));
        // No configuration object referenced: flags are left alone.
        assert!(!config_has_changed(
            &on_disk,
            &env(&[(RUNTIME_VERSION_KEY, "version1")]),
            None,
        ));
    }

    #[test]
    fn desired_config_forms() {
        let node = node_with_annotations(&[(
            DESIRED_CONFIG_ANNOTATION,
            r#"{"RUNTIME_VERSION":"repo/img:v1.2.0","RUNTIME_CONFIG":"runtime-config"}"#,
        )]);
        let desired = effective_desired_config(&node).expect("parse").expect("present");
        assert_eq!(desired[RUNTIME_VERSION_KEY], "repo/img:v1.2.0");
        assert_eq!(desired[RUNTIME_CONFIG_KEY], "runtime-config");

        // Bare reference alone supplies only the version.
        let node = node_with_annotations(&[(DESIRED_VERSION_ANNOTATION, "repo/img:v1.3.0")]);
        let desired = effective_desired_config(&node).expect("parse").expect("present");
        assert_eq!(desired[RUNTIME_VERSION_KEY], "repo/img:v1.3.0");
        assert!(!desired.contains_key(RUNTIME_CONFIG_KEY));

        // Bare reference overrides the map's version key.
        let node = node_with_annotations(&[
            (
                DESIRED_CONFIG_ANNOTATION,
                r#"{"RUNTIME_VERSION":"repo/img:v1.2.0","RUNTIME_CONFIG":"runtime-config"}"#,
            ),
            (DESIRED_VERSION_ANNOTATION, "repo/img:v1.3.0"),
        ]);
        let desired = effective_desired_config(&node).expect("parse").expect("present");
        assert_eq!(desired[RUNTIME_VERSION_KEY], "repo/img:v1.3.0");
        assert_eq!(desired[RUNTIME_CONFIG_KEY], "runtime-config");

        assert!(effective_desired_config(&node_with_annotations(&[]))
            .expect("parse")
            .is_none());

        let node = node_with_annotations(&[(DESIRED_CONFIG_ANNOTATION, "not json")]);
        assert!(effective_desired_config(&node).is_err());
    }

    #[tokio::test]
    async fn no_change_means_no_restart() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env_path = dir.path().join("runtime.env");
        write_env_file(
            &env_path,
            &env(&[
                (RUNTIME_VERSION_KEY, "repo/img:v1.2.0"),
                (RUNTIME_FLAGS_KEY, "--peers='test'"),
                ("UNRELATED", "kept"),
            ]),
        )
        .expect("seed");

        let manager = FakeManager::default();
        let mut node = node_with_annotations(&[]);
        let desired = env(&[(RUNTIME_VERSION_KEY, "repo/img:v1.2.0")]);

        let restarted =
            apply_config_update(&manager, &env_path, &mut node, &desired, Some("--peers='test'"))
                .await
                .expect("apply");

        assert!(!restarted);
        assert_eq!(manager.restarts.load(Ordering::SeqCst), 0);
        assert_eq!(
            node.metadata.annotation(CURRENT_VERSION_ANNOTATION),
            Some("repo/img:v1.2.0")
        );
    }

    #[tokio::test]
    async fn version_change_restarts_once_and_converges() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env_path = dir.path().join("runtime.env");
        write_env_file(
            &env_path,
            &env(&[
                (RUNTIME_VERSION_KEY, "repo/img:v1.2.0"),
                (RUNTIME_FLAGS_KEY, "--peers='test'"),
                ("UNRELATED", "kept"),
            ]),
        )
        .expect("seed");

        let manager = FakeManager::default();
        let mut node = node_with_annotations(&[]);
        let desired = env(&[
            (RUNTIME_VERSION_KEY, "repo/img:v1.3.0"),
            (RUNTIME_CONFIG_KEY, "runtime-config"),
        ]);

        let restarted =
            apply_config_update(&manager, &env_path, &mut node, &desired, Some("--peers='test'"))
                .await
                .expect("apply");

        assert!(restarted);
        assert_eq!(manager.reloads.load(Ordering::SeqCst), 1);
        assert_eq!(manager.restarts.load(Ordering::SeqCst), 1);

        let on_disk = parse_env_file(&env_path).expect("parse");
        assert_eq!(on_disk[RUNTIME_VERSION_KEY], "repo/img:v1.3.0");
        assert_eq!(on_disk["UNRELATED"], "kept");

        assert_eq!(
            node.metadata.annotation(CURRENT_VERSION_ANNOTATION),
            Some("repo/img:v1.3.0")
        );
        let current: BTreeMap<String, String> = serde_json::from_str(
            node.metadata.annotation(CURRENT_CONFIG_ANNOTATION).expect("current config"),
        )
        .expect("valid json");
        assert_eq!(current[RUNTIME_VERSION_KEY], "repo/img:v1.3.0");
        assert_eq!(current[RUNTIME_CONFIG_KEY], "runtime-config");
    }

    #[tokio::test]
    async fn flags_change_rewrites_env_from_config_object() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env_path = dir.path().join("runtime.env");
        write_env_file(
            &env_path,
            &env(&[
                (RUNTIME_VERSION_KEY, "repo/img:v1.2.0"),
                (RUNTIME_FLAGS_KEY, "--peers='test'"),
            ]),
        )
        .expect("seed");

        let manager = FakeManager::default();
        let mut node = node_with_annotations(&[]);
        let desired = env(&[(RUNTIME_VERSION_KEY, "repo/img:v1.2.0")]);

        apply_config_update(&manager, &env_path, &mut node, &desired, Some("--peers='updated'"))
            .await
            .expect("apply");

        let on_disk = parse_env_file(&env_path).expect("parse");
        assert_eq!(on_disk[RUNTIME_FLAGS_KEY], "--peers='updated'");
        assert_eq!(manager.restarts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_restart_does_not_advance_current_version() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env_path = dir.path().join("runtime.env");
        write_env_file(&env_path, &env(&[(RUNTIME_VERSION_KEY, "repo/img:v1.2.0")]))
            .expect("seed");

        let manager = FakeManager::failing("failed");
        let mut node = node_with_annotations(&[]);
        let desired = env(&[(RUNTIME_VERSION_KEY, "repo/img:v1.3.0")]);

        let err = apply_config_update(&manager, &env_path, &mut node, &desired, None)
            .await
            .expect_err("restart failure surfaces");

        assert!(err.to_string().contains("unexpected status"));
        assert!(node.metadata.annotation(CURRENT_VERSION_ANNOTATION).is_none());
        assert!(node.metadata.annotation(CURRENT_CONFIG_ANNOTATION).is_none());
    }
}
