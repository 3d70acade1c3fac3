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

//! The node runtime's `KEY=VALUE` environment file. The on-disk file
//! is the agent's source of truth; keys it does not manage are
//! preserved across writes.

use crate::castellan::logger::log_warn;
use crate::castellan::util::atomic::{atomic_write, WriteOptions};
use crate::castellan::util::error::with_context;
use std::collections::BTreeMap;
use std::error::Error;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

const COMPONENT: &str = "node.env-file";
const ENV_FILE_MODE: u32 = 0o644;

/// Parses the env file into a key map. A missing file reads as empty;
/// malformed lines are skipped with a warning.
pub fn parse_env_file(path: &Path) -> Result<BTreeMap<String, String>, Box<dyn Error + Send + Sync>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(err) => {
            return Err(with_context(
                err,
                format!("failed to read env file '{}'", path.display()),
            ))
        }
    };

    let mut env = BTreeMap::new();
    for line in raw.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match line.split_once('=') {
            Some((key, value)) => {
                env.insert(key.to_string(), value.to_string());
            }
            None => {
                log_warn(COMPONENT, "invalid env line", &[("line", line)]);
            }
        }
    }
    Ok(env)
}

pub fn render_env(env: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (key, value) in env {
        out.push_str(key);
        out.push('=');
        out.push_str(value);
        out.push('\n');
    }
    out
}

/// Atomically replaces the env file with the given key map.
pub fn write_env_file(
    path: &Path,
    env: &BTreeMap<String, String>,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    atomic_write(
        path,
        render_env(env).as_bytes(),
        &WriteOptions::mode(ENV_FILE_MODE),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_reads_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = parse_env_file(&dir.path().join("runtime.env")).expect("parse");
        assert!(env.is_empty());
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("runtime.env");
        fs::write(&path, "RUNTIME_VERSION=v1.0.0\nnot a pair\nEXTRA=kept\n").expect("seed");

        let env = parse_env_file(&path).expect("parse");
        assert_eq!(env.len(), 2);
        assert_eq!(env["RUNTIME_VERSION"], "v1.0.0");
        assert_eq!(env["EXTRA"], "kept");
    }

    #[test]
    fn values_keep_equals_signs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("runtime.env");
        fs::write(&path, "RUNTIME_FLAGS=--log-level=debug --cgroups=v2\n").expect("seed");

        let env = parse_env_file(&path).expect("parse");
        assert_eq!(env["RUNTIME_FLAGS"], "--log-level=debug --cgroups=v2");
    }

    #[test]
    fn round_trip_preserves_all_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("runtime.env");
        let mut env = BTreeMap::new();
        env.insert("RUNTIME_VERSION".to_string(), "v1.1.0".to_string());
        env.insert("UNRELATED".to_string(), "value".to_string());

        write_env_file(&path, &env).expect("write");
        let reread = parse_env_file(&path).expect("parse");
        assert_eq!(reread, env);
    }
}
