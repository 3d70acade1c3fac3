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

use crate::castellan::api::types::Pod;
use crate::castellan::logger::log_warn;
use crate::castellan::util::atomic::{atomic_write, WriteOptions};
use crate::castellan::util::error::with_context;
use std::collections::HashMap;
use std::error::Error;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const COMPONENT: &str = "checkpoint.manifest";
const MANIFEST_MODE: u32 = 0o644;

/// The two manifest directories the checkpointer owns on its node:
/// `active` holds static pod specs the local runtime runs
/// unconditionally, `inactive` holds prepared checkpoints the runtime
/// ignores.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    active_dir: PathBuf,
    inactive_dir: PathBuf,
}

impl ManifestStore {
    pub fn new(active_dir: PathBuf, inactive_dir: PathBuf) -> Self {
        Self {
            active_dir,
            inactive_dir,
        }
    }

    pub fn active_path(&self, key: &str) -> PathBuf {
        self.active_dir.join(format!("{key}.json"))
    }

    pub fn inactive_path(&self, key: &str) -> PathBuf {
        self.inactive_dir.join(format!("{key}.json"))
    }

    pub fn write_active(&self, key: &str, pod: &Pod) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.write_manifest(&self.active_path(key), pod)
    }

    pub fn write_inactive(&self, key: &str, pod: &Pod) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.write_manifest(&self.inactive_path(key), pod)
    }

    fn write_manifest(&self, path: &Path, pod: &Pod) -> Result<(), Box<dyn Error + Send + Sync>> {
        let encoded = serde_json::to_vec(pod)
            .map_err(|err| with_context(err, "failed to encode checkpoint manifest"))?;
        atomic_write(path, &encoded, &WriteOptions::mode(MANIFEST_MODE))
    }

    pub fn remove_active(&self, key: &str) -> Result<bool, Box<dyn Error + Send + Sync>> {
        remove_if_present(&self.active_path(key))
    }

    pub fn remove_inactive(&self, key: &str) -> Result<bool, Box<dyn Error + Send + Sync>> {
        remove_if_present(&self.inactive_path(key))
    }

    pub fn active_exists(&self, key: &str) -> bool {
        self.active_path(key).is_file()
    }

    pub fn inactive_exists(&self, key: &str) -> bool {
        self.inactive_path(key).is_file()
    }

    /// Loads every checkpoint manifest held in reserve, keyed by the
    /// file stem. Unreadable manifests are skipped with a warning;
    /// they are rebuilt from the store on the next snapshot.
    pub fn load_inactive(&self) -> Result<HashMap<String, Pod>, Box<dyn Error + Send + Sync>> {
        let mut manifests = HashMap::new();
        let entries = match fs::read_dir(&self.inactive_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(manifests),
            Err(err) => {
                return Err(with_context(
                    err,
                    format!(
                        "failed to read inactive manifest directory '{}'",
                        self.inactive_dir.display()
                    ),
                ))
            }
        };

        for entry in entries {
            let entry = entry.map_err(|err| {
                with_context(err, "failed to enumerate inactive manifest directory")
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(key) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            match read_manifest(&path)? {
                Some(pod) => {
                    manifests.insert(key, pod);
                }
                None => continue,
            }
        }
        Ok(manifests)
    }
}

fn read_manifest(path: &Path) -> Result<Option<Pod>, Box<dyn Error + Send + Sync>> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(with_context(
                err,
                format!("failed to read manifest '{}'", path.display()),
            ))
        }
    };
    match serde_json::from_slice::<Pod>(&raw) {
        Ok(pod) => Ok(Some(pod)),
        Err(err) => {
            let path_str = path.display().to_string();
            log_warn(
                COMPONENT,
                "unreadable checkpoint manifest, will rebuild from store",
                &[("path", &path_str), ("error", &err.to_string())],
            );
            Ok(None)
        }
    }
}

fn remove_if_present(path: &Path) -> Result<bool, Box<dyn Error + Send + Sync>> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(with_context(
            err,
            format!("failed to remove manifest '{}'", path.display()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::castellan::api::types::{ObjectMeta, PodSpec};

    fn store() -> (tempfile::TempDir, ManifestStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let active = dir.path().join("active");
        let inactive = dir.path().join("inactive");
        fs::create_dir_all(&active).expect("active dir");
        fs::create_dir_all(&inactive).expect("inactive dir");
        (dir, ManifestStore::new(active, inactive))
    }

    fn pod(namespace: &str, name: &str) -> Pod {
        Pod::new(ObjectMeta::named(Some(namespace), name), PodSpec::default())
    }

    #[test]
    fn write_and_reload_inactive_manifests() {
        let (_dir, store) = store();
        store
            .write_inactive("kube-system-kube-apiserver", &pod("kube-system", "kube-apiserver"))
            .expect("write");

        let loaded = store.load_inactive().expect("load");
        assert_eq!(loaded.len(), 1);
        assert_eq!(
            loaded["kube-system-kube-apiserver"].metadata.name.as_deref(),
            Some("kube-apiserver")
        );
    }

    #[test]
    fn removal_is_idempotent() {
        let (_dir, store) = store();
        store
            .write_active("kube-system-kube-apiserver", &pod("kube-system", "kube-apiserver"))
            .expect("write");

        assert!(store.active_exists("kube-system-kube-apiserver"));
        assert!(store.remove_active("kube-system-kube-apiserver").expect("remove"));
        assert!(!store.remove_active("kube-system-kube-apiserver").expect("re-remove"));
        assert!(!store.active_exists("kube-system-kube-apiserver"));
    }

    #[test]
    fn corrupt_manifest_is_skipped() {
        let (_dir, store) = store();
        fs::write(store.inactive_path("broken"), b"not json").expect("seed");
        store
            .write_inactive("kube-system-kube-scheduler", &pod("kube-system", "kube-scheduler"))
            .expect("write");

        let loaded = store.load_inactive().expect("load");
        assert_eq!(loaded.len(), 1);
        assert!(loaded.contains_key("kube-system-kube-scheduler"));
    }

    #[test]
    fn missing_directory_loads_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ManifestStore::new(dir.path().join("nope-a"), dir.path().join("nope-i"));
        assert!(store.load_inactive().expect("load").is_empty());
    }
}
