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

use crate::castellan::util::error::{new_error, with_context};
use nix::unistd::{chown, Gid, Uid};
use std::error::Error;
use std::fs::{self, File};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Ownership and permission bits applied to the temp file before the rename.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    pub mode: Option<u32>,
    pub owner: Option<(u32, u32)>,
}

impl WriteOptions {
    pub fn mode(mode: u32) -> Self {
        Self {
            mode: Some(mode),
            owner: None,
        }
    }

    pub fn with_owner(mut self, uid: u32, gid: u32) -> Self {
        self.owner = Some((uid, gid));
        self
    }
}

/// Replaces `target` with `data` without ever exposing a partial file.
///
/// The data is written to a sibling temp file on the same filesystem,
/// synced, then renamed over the target. Mode and ownership are applied
/// to the temp file so the target never exists with the wrong bits. The
/// temp file is removed on every failure path.
pub fn atomic_write(
    target: &Path,
    data: &[u8],
    options: &WriteOptions,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let parent = target.parent().ok_or_else(|| {
        new_error(format!(
            "Target '{}' does not have a parent directory",
            target.display()
        ))
    })?;

    fs::create_dir_all(parent).map_err(|e| {
        with_context(
            e,
            format!("Failed to create parent directory '{}'", parent.display()),
        )
    })?;

    let file_name = target
        .file_name()
        .ok_or_else(|| new_error(format!("Target '{}' has no file name", target.display())))?;
    let mut tmp_name = file_name.to_os_string();
    tmp_name.push(".tmp");
    let tmpfile_path = parent.join(tmp_name);

    let mut tmp_guard = TempFileGuard::new(tmpfile_path.clone());
    let mut tmpfile = File::create(&tmpfile_path).map_err(|e| {
        with_context(
            e,
            format!(
                "Failed to create temporary file '{}'",
                tmpfile_path.display()
            ),
        )
    })?;

    tmpfile.write_all(data).map_err(|e| {
        with_context(
            e,
            format!(
                "Failed to write to temporary file '{}'",
                tmpfile_path.display()
            ),
        )
    })?;
    tmpfile.sync_all().map_err(|e| {
        with_context(
            e,
            format!("Failed to sync temporary file '{}'", tmpfile_path.display()),
        )
    })?;
    drop(tmpfile);

    if let Some(mode) = options.mode {
        fs::set_permissions(&tmpfile_path, fs::Permissions::from_mode(mode)).map_err(|e| {
            with_context(
                e,
                format!("Failed to set mode on '{}'", tmpfile_path.display()),
            )
        })?;
    }
    if let Some((uid, gid)) = options.owner {
        chown(
            &tmpfile_path,
            Some(Uid::from_raw(uid)),
            Some(Gid::from_raw(gid)),
        )
        .map_err(|e| {
            with_context(
                e,
                format!("Failed to chown '{}'", tmpfile_path.display()),
            )
        })?;
    }

    fs::rename(&tmpfile_path, target)
        .map_err(|e| with_context(e, format!("Failed to replace file '{}'", target.display())))?;
    tmp_guard.keep();

    sync_parent(target)?;

    Ok(())
}

/// Creates `dir` (and parents) with the given mode, then applies ownership.
pub fn ensure_owned_dir(
    dir: &Path,
    mode: u32,
    owner: Option<(u32, u32)>,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    fs::create_dir_all(dir)
        .map_err(|e| with_context(e, format!("Failed to create directory '{}'", dir.display())))?;
    fs::set_permissions(dir, fs::Permissions::from_mode(mode))
        .map_err(|e| with_context(e, format!("Failed to set mode on '{}'", dir.display())))?;
    if let Some((uid, gid)) = owner {
        chown(dir, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)))
            .map_err(|e| with_context(e, format!("Failed to chown '{}'", dir.display())))?;
    }
    Ok(())
}

fn sync_parent(path: &Path) -> Result<(), Box<dyn Error + Send + Sync>> {
    if let Some(dir) = path.parent() {
        let dir_file = File::open(dir).map_err(|e| {
            with_context(e, format!("Failed to open directory '{}'", dir.display()))
        })?;
        dir_file.sync_all().map_err(|e| {
            with_context(e, format!("Failed to sync directory '{}'", dir.display()))
        })?;
    }
    Ok(())
}

struct TempFileGuard {
    path: PathBuf,
    keep: bool,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, keep: false }
    }

    fn keep(&mut self) {
        self.keep = true;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if !self.keep {
            let _ = fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_new_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("manifest.json");

        atomic_write(&target, b"{}", &WriteOptions::default()).expect("atomic write");

        assert_eq!(fs::read(&target).expect("read"), b"{}");
        assert!(
            fs::read_dir(dir.path())
                .expect("read dir")
                .all(|e| !e.unwrap().file_name().to_string_lossy().ends_with(".tmp")),
            "temp file left behind"
        );
    }

    #[test]
    fn replaces_existing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("runtime.env");
        fs::write(&target, b"old").expect("seed");

        atomic_write(&target, b"new", &WriteOptions::default()).expect("atomic write");

        assert_eq!(fs::read(&target).expect("read"), b"new");
    }

    #[test]
    fn applies_mode_bits() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("token");

        atomic_write(&target, b"secret", &WriteOptions::mode(0o600)).expect("atomic write");

        let mode = fs::metadata(&target)
            .expect("metadata")
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn missing_parent_is_created() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("ns/pod/volume/key");

        atomic_write(&target, b"v", &WriteOptions::default()).expect("atomic write");

        assert_eq!(fs::read(&target).expect("read"), b"v");
    }

    #[test]
    fn owned_dir_gets_mode() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("secrets/ns/pod");

        ensure_owned_dir(&target, 0o700, None).expect("ensure dir");

        let mode = fs::metadata(&target)
            .expect("metadata")
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o700);
    }
}
