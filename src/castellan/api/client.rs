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
    Event, List, RawWatchEvent, Resource, VersionInfo,
};
use crate::castellan::logger::log_warn;
use crate::castellan::util::error::{new_error, with_context};
use bytes::Bytes;
use chrono::Utc;
use futures_util::{Stream, StreamExt};
use openssl::pkcs12::Pkcs12;
use openssl::pkey::PKey;
use openssl::x509::X509;
use reqwest::tls::{Certificate, Identity};
use reqwest::{Client, Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::env;
use std::error::Error;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::sleep;

const COMPONENT: &str = "api.client";

/// Canonical environment variable for overriding the store endpoint.
const SERVER_ENV: &str = "CASTELLAN_SERVER";
const CA_FILE_ENV: &str = "CASTELLAN_CA_FILE";
const CLIENT_CERT_ENV: &str = "CASTELLAN_CLIENT_CERT";
const CLIENT_KEY_ENV: &str = "CASTELLAN_CLIENT_KEY";
const TOKEN_ENV: &str = "CASTELLAN_TOKEN";
const DEFAULT_SERVER_ENDPOINT: &str = "https://127.0.0.1:6443";

const RETRY_ATTEMPTS: usize = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(200);
const MAX_BACKOFF: Duration = Duration::from_secs(2);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub struct HttpError {
    pub status: StatusCode,
    pub message: String,
}

impl HttpError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        HttpError {
            status,
            message: message.into(),
        }
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "store returned {}: {}", self.status, self.message)
    }
}

impl Error for HttpError {}

/// Returns true when the error is a store 404 for the requested record.
pub fn is_not_found(err: &(dyn Error + 'static)) -> bool {
    let mut current: Option<&(dyn Error + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(http) = e.downcast_ref::<HttpError>() {
            return http.status == StatusCode::NOT_FOUND;
        }
        current = e.source();
    }
    false
}

fn should_retry_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn is_retryable_reqwest(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

fn next_backoff(current: Duration) -> Duration {
    current
        .checked_mul(2)
        .unwrap_or(MAX_BACKOFF)
        .min(MAX_BACKOFF)
}

fn sanitize_pem(pem: &str, label: &str) -> Result<Vec<u8>, Box<dyn Error + Send + Sync>> {
    let trimmed = pem.trim();
    if trimmed.is_empty() {
        return Err(new_error(format!("{label} payload is empty")));
    }
    if !trimmed.starts_with("-----BEGIN") {
        return Err(new_error(format!("{label} is not PEM encoded")));
    }
    Ok(trimmed.as_bytes().to_vec())
}

fn build_identity(cert_pem: &[u8], key_pem: &[u8]) -> Result<Identity, Box<dyn Error + Send + Sync>> {
    let cert = X509::from_pem(cert_pem)
        .map_err(|err| with_context(err, "failed to parse client certificate"))?;
    let key = PKey::private_key_from_pem(key_pem)
        .map_err(|err| with_context(err, "failed to parse client key"))?;
    let pkcs12 = Pkcs12::builder()
        .name("castellan-client")
        .pkey(&key)
        .cert(&cert)
        .build2("")
        .map_err(|err| with_context(err, "failed to build client PKCS#12 bundle"))?;
    let pkcs12_der = pkcs12
        .to_der()
        .map_err(|err| with_context(err, "failed to encode client PKCS#12 bundle"))?;
    Identity::from_pkcs12_der(&pkcs12_der, "")
        .map_err(|err| with_context(err, "failed to load client identity"))
}

/// Connection parameters for the central object store.
#[derive(Debug, Clone, Default)]
pub struct ApiConfig {
    pub server: Option<String>,
    pub ca_file: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    pub token: Option<String>,
}

impl ApiConfig {
    pub fn from_env() -> Self {
        Self {
            server: env::var(SERVER_ENV).ok(),
            ca_file: env::var(CA_FILE_ENV).ok().map(PathBuf::from),
            client_cert: env::var(CLIENT_CERT_ENV).ok().map(PathBuf::from),
            client_key: env::var(CLIENT_KEY_ENV).ok().map(PathBuf::from),
            token: env::var(TOKEN_ENV).ok(),
        }
    }
}

/// Client for the central object store.
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base: Url,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(config: &ApiConfig) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let endpoint = config
            .server
            .clone()
            .unwrap_or_else(|| DEFAULT_SERVER_ENDPOINT.to_string());
        let base = Url::parse(&endpoint)
            .map_err(|err| with_context(err, format!("invalid store endpoint '{endpoint}'")))?;

        let mut builder = Client::builder().connect_timeout(CONNECT_TIMEOUT);

        if let Some(ca_file) = &config.ca_file {
            let pem = fs::read_to_string(ca_file).map_err(|err| {
                with_context(err, format!("failed to read CA bundle '{}'", ca_file.display()))
            })?;
            let pem = sanitize_pem(&pem, "CA bundle")?;
            let certificate = Certificate::from_pem(&pem)
                .map_err(|err| with_context(err, "failed to parse CA bundle"))?;
            builder = builder.add_root_certificate(certificate);
        }

        if let (Some(cert_path), Some(key_path)) = (&config.client_cert, &config.client_key) {
            let cert_pem = fs::read_to_string(cert_path).map_err(|err| {
                with_context(
                    err,
                    format!("failed to read client certificate '{}'", cert_path.display()),
                )
            })?;
            let key_pem = fs::read_to_string(key_path).map_err(|err| {
                with_context(err, format!("failed to read client key '{}'", key_path.display()))
            })?;
            let identity = build_identity(
                &sanitize_pem(&cert_pem, "client certificate")?,
                &sanitize_pem(&key_pem, "client key")?,
            )?;
            builder = builder.identity(identity);
        }

        let http = builder
            .build()
            .map_err(|err| with_context(err, "failed to build store client"))?;

        Ok(Self {
            http,
            base,
            token: config.token.clone(),
        })
    }

    fn url(&self, path: &str) -> Result<Url, Box<dyn Error + Send + Sync>> {
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(|err| with_context(err, format!("invalid store path '{path}'")))
    }

    fn collection_path<T: Resource>(namespace: Option<&str>) -> String {
        match namespace {
            Some(ns) if T::namespaced() => {
                format!("{}/namespaces/{}/{}", T::api_path(), ns, T::plural())
            }
            _ => format!("{}/{}", T::api_path(), T::plural()),
        }
    }

    fn object_path<T: Resource>(namespace: Option<&str>, name: &str) -> String {
        format!("{}/{}", Self::collection_path::<T>(namespace), name)
    }

    async fn request_json<B, R>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&B>,
    ) -> Result<R, Box<dyn Error + Send + Sync>>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = self.url(path)?;
        let mut backoff = RETRY_BACKOFF;

        for attempt in 0..RETRY_ATTEMPTS {
            let mut request = self
                .http
                .request(method.clone(), url.clone())
                .timeout(REQUEST_TIMEOUT);
            if !query.is_empty() {
                request = request.query(query);
            }
            if let Some(token) = &self.token {
                request = request.bearer_auth(token);
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response
                            .json::<R>()
                            .await
                            .map_err(|err| with_context(err, "failed to decode store response"));
                    }
                    let message = response.text().await.unwrap_or_default();
                    if should_retry_status(status) && attempt + 1 < RETRY_ATTEMPTS {
                        log_warn(
                            COMPONENT,
                            "retrying store request",
                            &[("path", path), ("status", status.as_str())],
                        );
                    } else {
                        return Err(Box::new(HttpError::new(status, message)));
                    }
                }
                Err(err) => {
                    if is_retryable_reqwest(&err) && attempt + 1 < RETRY_ATTEMPTS {
                        log_warn(
                            COMPONENT,
                            "retrying store request",
                            &[("path", path), ("error", &err.to_string())],
                        );
                    } else {
                        return Err(with_context(err, format!("store request '{path}' failed")));
                    }
                }
            }

            sleep(backoff).await;
            backoff = next_backoff(backoff);
        }

        Err(new_error(format!("store request '{path}' exhausted retries")))
    }

    pub async fn get<T: Resource>(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<T, Box<dyn Error + Send + Sync>> {
        self.request_json::<(), T>(Method::GET, &Self::object_path::<T>(namespace, name), &[], None)
            .await
    }

    /// Like [`ApiClient::get`], mapping a store 404 to `None`.
    pub async fn get_opt<T: Resource>(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<T>, Box<dyn Error + Send + Sync>> {
        match self.get::<T>(namespace, name).await {
            Ok(object) => Ok(Some(object)),
            Err(err) if is_not_found(err.as_ref()) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn list<T: Resource>(
        &self,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<List<T>, Box<dyn Error + Send + Sync>> {
        let mut query = Vec::new();
        if let Some(selector) = label_selector {
            query.push(("labelSelector", selector));
        }
        self.request_json::<(), List<T>>(
            Method::GET,
            &Self::collection_path::<T>(namespace),
            &query,
            None,
        )
        .await
    }

    pub async fn create<T: Resource>(
        &self,
        namespace: Option<&str>,
        object: &T,
    ) -> Result<T, Box<dyn Error + Send + Sync>> {
        self.request_json(
            Method::POST,
            &Self::collection_path::<T>(namespace),
            &[],
            Some(object),
        )
        .await
    }

    pub async fn update<T: Resource>(&self, object: &T) -> Result<T, Box<dyn Error + Send + Sync>> {
        let meta = object.metadata();
        let name = meta
            .name
            .clone()
            .ok_or_else(|| new_error("cannot update a record without a name"))?;
        let namespace = meta.namespace.clone();
        self.request_json(
            Method::PUT,
            &Self::object_path::<T>(namespace.as_deref(), &name),
            &[],
            Some(object),
        )
        .await
    }

    pub async fn delete<T: Resource>(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let _: serde_json::Value = self
            .request_json::<(), serde_json::Value>(
                Method::DELETE,
                &Self::object_path::<T>(namespace, name),
                &[],
                None,
            )
            .await?;
        Ok(())
    }

    /// Discovery check: the version reported by whichever server answers.
    pub async fn server_version(&self) -> Result<VersionInfo, Box<dyn Error + Send + Sync>> {
        self.request_json::<(), VersionInfo>(Method::GET, "version", &[], None)
            .await
    }

    /// Posts a cluster event. Failures are reported to the caller but
    /// are expected to be treated as best-effort.
    pub async fn post_event(&self, mut event: Event) -> Result<(), Box<dyn Error + Send + Sync>> {
        let now = Utc::now();
        if event.first_timestamp.is_none() {
            event.first_timestamp = Some(now);
        }
        event.last_timestamp = Some(now);
        let namespace = event
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());
        let _: Event = self.create(Some(&namespace), &event).await?;
        Ok(())
    }

    /// Opens a watch stream on a collection, starting after
    /// `resource_version`.
    pub async fn watch<T: Resource>(
        &self,
        namespace: Option<&str>,
        label_selector: Option<&str>,
        resource_version: Option<&str>,
    ) -> Result<WatchLines, Box<dyn Error + Send + Sync>> {
        let url = self.url(&Self::collection_path::<T>(namespace))?;
        let mut request = self.http.get(url).query(&[("watch", "true")]);
        if let Some(selector) = label_selector {
            request = request.query(&[("labelSelector", selector)]);
        }
        if let Some(rv) = resource_version {
            request = request.query(&[("resourceVersion", rv)]);
        }
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|err| with_context(err, "failed to open watch stream"))?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(Box::new(HttpError::new(status, message)));
        }

        Ok(WatchLines {
            stream: Box::pin(response.bytes_stream()),
            buffer: Vec::new(),
        })
    }
}

/// Newline-delimited JSON watch events read from an open stream.
pub struct WatchLines {
    stream: Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
    buffer: Vec<u8>,
}

impl WatchLines {
    /// Returns the next event, or `None` when the server closed the
    /// stream. A malformed line is an error; callers re-list and
    /// re-watch.
    pub async fn next_event(
        &mut self,
    ) -> Result<Option<RawWatchEvent>, Box<dyn Error + Send + Sync>> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.buffer.drain(..=pos).collect();
                let line = &line[..line.len() - 1];
                if line.is_empty() {
                    continue;
                }
                let event: RawWatchEvent = serde_json::from_slice(line)
                    .map_err(|err| with_context(err, "malformed watch event"))?;
                return Ok(Some(event));
            }

            match self.stream.next().await {
                Some(Ok(chunk)) => self.buffer.extend_from_slice(&chunk),
                Some(Err(err)) => {
                    return Err(with_context(err, "watch stream failed"));
                }
                None => {
                    if self.buffer.iter().any(|b| !b.is_ascii_whitespace()) {
                        return Err(new_error("watch stream ended mid-event"));
                    }
                    return Ok(None);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::castellan::api::types::{Node, Pod};

    #[test]
    fn collection_paths_follow_api_groups() {
        assert_eq!(
            ApiClient::collection_path::<Pod>(Some("kube-system")),
            "api/v1/namespaces/kube-system/pods"
        );
        assert_eq!(ApiClient::collection_path::<Node>(None), "api/v1/nodes");
        assert_eq!(
            ApiClient::object_path::<Node>(None, "worker-0"),
            "api/v1/nodes/worker-0"
        );
    }

    #[test]
    fn not_found_detection_unwraps_context() {
        let inner: Box<dyn Error + Send + Sync> =
            Box::new(HttpError::new(StatusCode::NOT_FOUND, "no such pod"));
        let wrapped = with_context(inner, "fetching pod");
        assert!(is_not_found(wrapped.as_ref()));

        let other: Box<dyn Error + Send + Sync> =
            Box::new(HttpError::new(StatusCode::CONFLICT, "stale version"));
        assert!(!is_not_found(other.as_ref()));
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let first = next_backoff(RETRY_BACKOFF);
        assert_eq!(first, RETRY_BACKOFF * 2);
        assert_eq!(next_backoff(Duration::from_secs(30)), MAX_BACKOFF);
    }

    #[test]
    fn pem_sanitizing_rejects_non_pem() {
        assert!(sanitize_pem("", "CA bundle").is_err());
        assert!(sanitize_pem("not pem", "CA bundle").is_err());
        assert!(sanitize_pem("-----BEGIN CERTIFICATE-----\n", "CA bundle").is_ok());
    }
}
