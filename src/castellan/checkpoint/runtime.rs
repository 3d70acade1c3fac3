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

use crate::castellan::api::types::{List, Pod};
use crate::castellan::checkpoint::PodRuntime;
use crate::castellan::util::error::{new_error, with_context};
use std::error::Error;
use std::time::Duration;

/// Default read-only endpoint of the node-local pod runtime.
pub const DEFAULT_RUNTIME_PODS_URL: &str = "http://127.0.0.1:10255/pods";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Read-only client for the node-local pod runtime endpoint.
#[derive(Clone)]
pub struct LocalPodRuntime {
    http: reqwest::Client,
    pods_url: String,
}

impl LocalPodRuntime {
    pub fn new(pods_url: impl Into<String>) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| with_context(err, "failed to build pod-runtime client"))?;
        Ok(Self {
            http,
            pods_url: pods_url.into(),
        })
    }
}

impl PodRuntime for LocalPodRuntime {
    async fn running_pods(&self) -> Result<Vec<Pod>, Box<dyn Error + Send + Sync>> {
        let response = self
            .http
            .get(&self.pods_url)
            .send()
            .await
            .map_err(|err| with_context(err, "failed to reach local pod runtime"))?;
        if !response.status().is_success() {
            return Err(new_error(format!(
                "local pod runtime returned {}",
                response.status()
            )));
        }
        let list: List<Pod> = response
            .json()
            .await
            .map_err(|err| with_context(err, "failed to decode local pod list"))?;
        Ok(list.items)
    }
}
