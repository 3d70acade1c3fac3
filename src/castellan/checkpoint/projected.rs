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

use crate::castellan::api::types::{HostPathVolumeSource, Pod, VolumeSpec};
use crate::castellan::checkpoint::config_map::checkpoint_config_map_projection;
use crate::castellan::checkpoint::secret::checkpoint_secret_projection;
use crate::castellan::checkpoint::RemoteStore;
use crate::castellan::util::error::{new_error, with_context};
use std::error::Error;
use std::path::Path;

/// Checkpoints every projected volume of the pod locally, then
/// converts the volume source to a host path.
///
/// All sources of one projected volume land in a single directory so
/// the rewritten host path can serve the whole mount: under the secret
/// root when any secret projection is present, under the configMap
/// root otherwise.
pub async fn checkpoint_projected_volumes<S: RemoteStore>(
    store: &S,
    secret_root: &Path,
    config_map_root: &Path,
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
        let Some(projected) = volume.projected.clone() else {
            continue;
        };

        if volume_has_downward_api_projection(volume) {
            return Err(new_error(format!(
                "no support to checkpoint projected downwardAPI for pod {namespace}/{pod_name}"
            )));
        }

        let root = if volume_has_secret_projection(volume) {
            secret_root
        } else {
            config_map_root
        };

        for source in &projected.sources {
            if let Some(projection) = &source.secret {
                checkpoint_secret_projection(
                    store,
                    root,
                    &namespace,
                    &pod_name,
                    &volume.name,
                    projection,
                    uid,
                    gid,
                )
                .await
                .map_err(|err| {
                    with_context(
                        err,
                        format!(
                            "failed to checkpoint projected secret for pod {namespace}/{pod_name}"
                        ),
                    )
                })?;
            }
            if let Some(projection) = &source.config_map {
                checkpoint_config_map_projection(
                    store,
                    root,
                    &namespace,
                    &pod_name,
                    &volume.name,
                    projection,
                    uid,
                    gid,
                )
                .await
                .map_err(|err| {
                    with_context(
                        err,
                        format!(
                            "failed to checkpoint projected configMap for pod {namespace}/{pod_name}"
                        ),
                    )
                })?;
            }
        }

        let base = root.join(&namespace).join(&pod_name).join(&volume.name);
        volume.projected = None;
        volume.host_path = Some(HostPathVolumeSource {
            path: base.to_string_lossy().into_owned(),
            path_type: None,
        });
    }
    Ok(())
}

fn volume_has_secret_projection(volume: &VolumeSpec) -> bool {
    volume
        .projected
        .as_ref()
        .map(|p| p.sources.iter().any(|s| s.secret.is_some()))
        .unwrap_or(false)
}

fn volume_has_downward_api_projection(volume: &VolumeSpec) -> bool {
    volume
        .projected
        .as_ref()
        .map(|p| p.sources.iter().any(|s| s.downward_api.is_some()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::castellan::api::types::{ProjectedVolumeSource, SecretProjection, VolumeProjection};

    fn projected_volume(sources: Vec<VolumeProjection>) -> VolumeSpec {
        VolumeSpec {
            name: "bundle".to_string(),
            projected: Some(ProjectedVolumeSource {
                sources,
                default_mode: None,
            }),
            ..VolumeSpec::default()
        }
    }

    #[test]
    fn detects_secret_projections() {
        let volume = projected_volume(vec![VolumeProjection {
            secret: Some(SecretProjection::default()),
            config_map: None,
            downward_api: None,
        }]);
        assert!(volume_has_secret_projection(&volume));
        assert!(!volume_has_downward_api_projection(&volume));
    }

    #[test]
    fn detects_downward_api_projections() {
        let volume = projected_volume(vec![VolumeProjection {
            secret: None,
            config_map: None,
            downward_api: Some(serde_json::json!({"items": []})),
        }]);
        assert!(volume_has_downward_api_projection(&volume));
    }
}
