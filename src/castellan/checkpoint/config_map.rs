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

use crate::castellan::api::types::{
    ConfigMap, ConfigMapProjection, HostPathVolumeSource, KeyToPath, Pod,
};
use crate::castellan::checkpoint::RemoteStore;
use crate::castellan::util::atomic::{atomic_write, ensure_owned_dir, WriteOptions};
use crate::castellan::util::error::{new_error, with_context};
use std::error::Error;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_MAP_MODE: u32 = 0o600;

/// Checkpoints every configMap volume of the pod locally, then
/// converts the volume source to a host path.
///
/// The data lands at `<root>/<namespace>/<pod>/<configMapName>/<key>`.
pub async fn checkpoint_config_map_volumes<S: RemoteStore>(
    store: &S,
    root: &Path,
    pod: &mut Pod,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let (uid, gid) = pod.user_and_group();
    let namespace = pod
        .metadata
        .namespace
        .clone()
        .ok_or_else(|| new_error("pod is missing metadata namespace"))?;
    let pod_name = pod
        .metadata
        .name
        .clone()
        .ok_or_else(|| new_error("pod is missing metadata name"))?;

    for volume in &mut pod.spec.volumes {
        let Some(source) = volume.config_map.clone() else {
            continue;
        };

        let base = config_map_path(root, &namespace, &pod_name, &source.name);
        let optional = source.optional.unwrap_or(false);
        let config_map = store.get_config_map(&namespace, &source.name).await.map_err(|err| {
            with_context(
                err,
                format!("failed to checkpoint configMap for pod {namespace}/{pod_name}"),
            )
        })?;

        match config_map {
            Some(config_map) => {
                write_config_map_items(
                    &base,
                    &config_map,
                    &source.items,
                    source.default_mode,
                    optional,
                    uid,
                    gid,
                )?;
            }
            None if optional => {
                ensure_owned_dir(&base, 0o700, Some((uid, gid)))?;
            }
            None => {
                return Err(new_error(format!(
                    "failed to retrieve configMap {namespace}/{}",
                    source.name
                )));
            }
        }

        volume.config_map = None;
        volume.host_path = Some(HostPathVolumeSource {
            path: base.to_string_lossy().into_owned(),
            path_type: None,
        });
    }
    Ok(())
}

/// Checkpoints one configMap projection of a projected volume. The
/// data lands under the volume name, and each file name is the
/// projection path rather than the source key.
pub(crate) async fn checkpoint_config_map_projection<S: RemoteStore>(
    store: &S,
    root: &Path,
    namespace: &str,
    pod_name: &str,
    volume_name: &str,
    projection: &ConfigMapProjection,
    uid: u32,
    gid: u32,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let optional = projection.optional.unwrap_or(false);
    let config_map = store.get_config_map(namespace, &projection.name).await?;
    let config_map = match config_map {
        Some(config_map) => config_map,
        None if optional => return Ok(()),
        None => {
            return Err(new_error(format!(
                "failed to retrieve configMap {namespace}/{}",
                projection.name
            )))
        }
    };

    let base = config_map_path(root, namespace, pod_name, volume_name);
    write_config_map_items(&base, &config_map, &projection.items, None, optional, uid, gid)
}

fn write_config_map_items(
    base: &Path,
    config_map: &ConfigMap,
    items: &[KeyToPath],
    default_mode: Option<i32>,
    optional: bool,
    uid: u32,
    gid: u32,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    ensure_owned_dir(base, 0o700, Some((uid, gid)))?;
    let fallback_mode = default_mode
        .map(|m| m as u32)
        .unwrap_or(DEFAULT_CONFIG_MAP_MODE);

    if items.is_empty() {
        for (key, value) in &config_map.data {
            let options = WriteOptions::mode(fallback_mode).with_owner(uid, gid);
            atomic_write(&base.join(key), value.as_bytes(), &options).map_err(|err| {
                with_context(err, format!("failed to write configMap item '{key}'"))
            })?;
        }
        return Ok(());
    }

    for item in items {
        let Some(value) = config_map.data.get(&item.key) else {
            if optional {
                continue;
            }
            return Err(new_error(format!(
                "failed to find item {} in configMap {}",
                item.key,
                config_map.metadata.name.as_deref().unwrap_or("<unnamed>")
            )));
        };
        let mode = item.mode.map(|m| m as u32).unwrap_or(fallback_mode);
        let options = WriteOptions::mode(mode).with_owner(uid, gid);
        atomic_write(&base.join(&item.path), value.as_bytes(), &options).map_err(|err| {
            with_context(err, format!("failed to write configMap item '{}'", item.key))
        })?;
    }
    Ok(())
}

pub fn config_map_path(root: &Path, namespace: &str, pod_name: &str, object_name: &str) -> PathBuf {
    root.join(namespace).join(pod_name).join(object_name)
}

/// Root of every configMap checkpointed for one pod, used for cleanup.
pub fn pod_config_map_path(root: &Path, namespace: &str, pod_name: &str) -> PathBuf {
    root.join(namespace).join(pod_name)
}
