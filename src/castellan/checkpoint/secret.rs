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

use crate::castellan::api::types::{HostPathVolumeSource, KeyToPath, Pod, Secret, SecretProjection};
use crate::castellan::checkpoint::RemoteStore;
use crate::castellan::util::atomic::{atomic_write, ensure_owned_dir, WriteOptions};
use crate::castellan::util::error::{new_error, with_context};
use std::error::Error;
use std::path::{Path, PathBuf};

const DEFAULT_SECRET_MODE: u32 = 0o600;

/// Checkpoints every secret volume of the pod locally, then converts
/// the volume source to a host path.
///
/// The secret data lands at `<root>/<namespace>/<pod>/<secretName>/<key>`.
pub async fn checkpoint_secret_volumes<S: RemoteStore>(
    store: &S,
    root: &Path,
    pod: &mut Pod,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let (uid, gid) = pod.user_and_group();
    let namespace = required_meta(pod, "namespace")?;
    let pod_name = required_meta(pod, "name")?;

    for volume in &mut pod.spec.volumes {
        let Some(source) = volume.secret.clone() else {
            continue;
        };

        let base = secret_path(root, &namespace, &pod_name, &source.secret_name);
        let optional = source.optional.unwrap_or(false);
        let secret = store
            .get_secret(&namespace, &source.secret_name)
            .await
            .map_err(|err| {
                with_context(
                    err,
                    format!(
                        "failed to checkpoint secret for pod {namespace}/{pod_name}"
                    ),
                )
            })?;

        match secret {
            Some(secret) => {
                write_secret_items(
                    &base,
                    &secret,
                    &source.items,
                    source.default_mode,
                    optional,
                    uid,
                    gid,
                )?;
            }
            None if optional => {
                // An optional secret that is missing mounts as an empty
                // directory.
                ensure_owned_dir(&base, 0o700, Some((uid, gid)))?;
            }
            None => {
                return Err(new_error(format!(
                    "failed to retrieve secret {namespace}/{}",
                    source.secret_name
                )));
            }
        }

        volume.secret = None;
        volume.host_path = Some(HostPathVolumeSource {
            path: base.to_string_lossy().into_owned(),
            path_type: None,
        });
    }
    Ok(())
}

/// Checkpoints one secret projection of a projected volume. The data
/// lands under the volume name, and each file name is the projection
/// path rather than the source key.
pub(crate) async fn checkpoint_secret_projection<S: RemoteStore>(
    store: &S,
    root: &Path,
    namespace: &str,
    pod_name: &str,
    volume_name: &str,
    projection: &SecretProjection,
    uid: u32,
    gid: u32,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let optional = projection.optional.unwrap_or(false);
    let secret = store.get_secret(namespace, &projection.name).await?;
    let secret = match secret {
        Some(secret) => secret,
        None if optional => return Ok(()),
        None => {
            return Err(new_error(format!(
                "failed to retrieve secret {namespace}/{}",
                projection.name
            )))
        }
    };

    let base = secret_path(root, namespace, pod_name, volume_name);
    write_secret_items(&base, &secret, &projection.items, None, optional, uid, gid)
}

fn write_secret_items(
    base: &Path,
    secret: &Secret,
    items: &[KeyToPath],
    default_mode: Option<i32>,
    optional: bool,
    uid: u32,
    gid: u32,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    ensure_owned_dir(base, 0o700, Some((uid, gid)))?;
    let fallback_mode = default_mode.map(|m| m as u32).unwrap_or(DEFAULT_SECRET_MODE);

    if items.is_empty() {
        for (key, value) in &secret.data {
            let options = WriteOptions::mode(fallback_mode).with_owner(uid, gid);
            atomic_write(&base.join(key), &value.0, &options).map_err(|err| {
                with_context(err, format!("failed to write secret item '{key}'"))
            })?;
        }
        return Ok(());
    }

    for item in items {
        let Some(value) = secret.data.get(&item.key) else {
            if optional {
                continue;
            }
            return Err(new_error(format!(
                "failed to find item {} in secret {}",
                item.key,
                secret.metadata.name.as_deref().unwrap_or("<unnamed>")
            )));
        };
        let mode = item.mode.map(|m| m as u32).unwrap_or(fallback_mode);
        let options = WriteOptions::mode(mode).with_owner(uid, gid);
        atomic_write(&base.join(&item.path), &value.0, &options).map_err(|err| {
            with_context(err, format!("failed to write secret item '{}'", item.key))
        })?;
    }
    Ok(())
}

pub fn secret_path(root: &Path, namespace: &str, pod_name: &str, object_name: &str) -> PathBuf {
    root.join(namespace).join(pod_name).join(object_name)
}

/// Root of every secret checkpointed for one pod, used for cleanup.
pub fn pod_secret_path(root: &Path, namespace: &str, pod_name: &str) -> PathBuf {
    root.join(namespace).join(pod_name)
}

fn required_meta(pod: &Pod, field: &str) -> Result<String, Box<dyn Error + Send + Sync>> {
    let value = match field {
        "namespace" => pod.metadata.namespace.clone(),
        _ => pod.metadata.name.clone(),
    };
    value.ok_or_else(|| new_error(format!("pod is missing metadata {field}")))
}
