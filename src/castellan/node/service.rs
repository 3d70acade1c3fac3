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

use crate::castellan::util::error::with_context;
use std::error::Error;
use tokio::process::Command;

/// Restart status the agent requires before advancing its annotations.
pub const RESTART_DONE: &str = "done";

/// Local service manager: reload unit definitions and restart a named
/// unit, reporting a textual status on completion.
pub trait ServiceManager {
    fn reload(
        &self,
    ) -> impl std::future::Future<Output = Result<(), Box<dyn Error + Send + Sync>>> + Send;

    /// Restarts the unit and blocks until the manager reports a
    /// result. Returns the status string; anything other than
    /// [`RESTART_DONE`] means the restart did not complete.
    fn restart_unit(
        &self,
        unit: &str,
    ) -> impl std::future::Future<Output = Result<String, Box<dyn Error + Send + Sync>>> + Send;
}

/// Drives the host's systemd through `systemctl`.
#[derive(Debug, Clone, Default)]
pub struct SystemdManager;

impl ServiceManager for SystemdManager {
    async fn reload(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        let output = Command::new("systemctl")
            .arg("daemon-reload")
            .output()
            .await
            .map_err(|err| with_context(err, "failed to invoke systemctl daemon-reload"))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(with_context(
                std::io::Error::other(stderr.trim().to_string()),
                "systemctl daemon-reload failed",
            ));
        }
        Ok(())
    }

    async fn restart_unit(&self, unit: &str) -> Result<String, Box<dyn Error + Send + Sync>> {
        let output = Command::new("systemctl")
            .args(["restart", unit])
            .output()
            .await
            .map_err(|err| with_context(err, format!("failed to invoke systemctl restart {unit}")))?;
        if output.status.success() {
            Ok(RESTART_DONE.to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = stderr.trim();
            Ok(if stderr.is_empty() {
                "failed".to_string()
            } else {
                format!("failed: {stderr}")
            })
        }
    }
}
