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

use std::env;
use std::error::Error;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, PathBuf};

/// Enum for the well-known filesystem locations the controllers own.
#[derive(Debug)]
pub enum Config {
    /// Static pod manifests the local runtime runs unconditionally.
    ActiveManifests,
    /// Prepared checkpoint manifests the runtime ignores.
    InactiveManifests,
    /// Materialized secret data for checkpointed pods.
    CheckpointSecrets,
    /// Materialized configMap data for checkpointed pods.
    CheckpointConfigMaps,
    /// The node runtime's KEY=VALUE environment file.
    RuntimeEnvFile,
}

impl Config {
    /// Returns the associated environment variable for the config parameter.
    pub fn env_var(&self) -> &'static str {
        match self {
            Config::ActiveManifests => "CASTELLAN_ACTIVE_MANIFESTS",
            Config::InactiveManifests => "CASTELLAN_INACTIVE_MANIFESTS",
            Config::CheckpointSecrets => "CASTELLAN_CHECKPOINT_SECRETS",
            Config::CheckpointConfigMaps => "CASTELLAN_CHECKPOINT_CONFIGMAPS",
            Config::RuntimeEnvFile => "CASTELLAN_RUNTIME_ENV_FILE",
        }
    }

    /// Returns the default value for the config parameter.
    pub fn default_path(&self) -> &'static str {
        match self {
            Config::ActiveManifests => {
                #[cfg(test)]
                {
                    "/tmp/castellan-test/manifests/active"
                }
                #[cfg(not(test))]
                {
                    "/etc/castellan/manifests"
                }
            }
            Config::InactiveManifests => {
                #[cfg(test)]
                {
                    "/tmp/castellan-test/manifests/inactive"
                }
                #[cfg(not(test))]
                {
                    "/srv/castellan/manifests"
                }
            }
            Config::CheckpointSecrets => {
                #[cfg(test)]
                {
                    "/tmp/castellan-test/checkpoint-secrets"
                }
                #[cfg(not(test))]
                {
                    "/etc/castellan/checkpoint-secrets"
                }
            }
            Config::CheckpointConfigMaps => {
                #[cfg(test)]
                {
                    "/tmp/castellan-test/checkpoint-configmaps"
                }
                #[cfg(not(test))]
                {
                    "/etc/castellan/checkpoint-configmaps"
                }
            }
            Config::RuntimeEnvFile => {
                #[cfg(test)]
                {
                    "/tmp/castellan-test/runtime.env"
                }
                #[cfg(not(test))]
                {
                    "/etc/castellan/runtime.env"
                }
            }
        }
    }

    /// Returns the effective value, either from environment or default.
    pub fn get_path(&self) -> PathBuf {
        env::var(self.env_var()).map_or_else(
            |_| Self::normalize_path(self.default_path()),
            |value| Self::normalize_path(&value),
        )
    }

    /// Create the directory if needed and apply the desired mode.
    pub fn verify(&self) -> Result<PathBuf, Box<dyn Error + Send + Sync>> {
        let path = self.get_path();

        if matches!(self, Config::RuntimeEnvFile) {
            // Only the parent directory is expected for file parameters.
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|e| {
                    format!("Failed to create directory '{}': {}", parent.display(), e)
                })?;
            }
            return Ok(path);
        }

        if !&path.exists() {
            fs::create_dir_all(&path)
                .map_err(|e| format!("Failed to create directory '{}': {}", path.display(), e))?;
        } else if !path.is_dir() {
            return Err(format!("Path '{}' exists but is not a directory", path.display()).into());
        }

        if let Some(mode) = self.desired_mode() {
            let permissions = fs::Permissions::from_mode(mode);
            fs::set_permissions(&path, permissions).map_err(|e| {
                format!(
                    "Failed to set permissions on '{}': {}",
                    path.display(),
                    e
                )
            })?;
        }

        Ok(path)
    }

    /// Normalize a directory path by expanding ~, resolving ., .., and returning an absolute, cleaned path.
    fn normalize_path(input: &str) -> PathBuf {
        let path: PathBuf = match input {
            _ if input.starts_with("~/") => env::var("HOME")
                .ok()
                .map(|home| PathBuf::from(home).join(&input[2..])),
            _ if !input.starts_with('/') => env::current_dir().ok().map(|cwd| cwd.join(input)),
            _ => None,
        }
        .unwrap_or_else(|| PathBuf::from(input));

        path.components()
            .fold(PathBuf::new(), |mut normalized, component| {
                match component {
                    Component::CurDir => {}
                    Component::ParentDir => {
                        normalized.pop();
                    }
                    _ => normalized.push(component),
                }
                normalized
            })
    }

    fn desired_mode(&self) -> Option<u32> {
        match self {
            Config::ActiveManifests => Some(0o755),
            Config::InactiveManifests => Some(0o755),
            Config::CheckpointSecrets => Some(0o700),
            Config::CheckpointConfigMaps => Some(0o700),
            Config::RuntimeEnvFile => None,
        }
    }
}
