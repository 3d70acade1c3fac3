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

//! Watch-derived caches: eventually-consistent local mirrors of
//! central-store collections, exposed as read-only lookups plus an
//! event channel consumed by a single reconciler.

use crate::castellan::api::client::ApiClient;
use crate::castellan::api::types::Resource;
use crate::castellan::logger::{log_debug, log_warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

const COMPONENT: &str = "api.watch";
const EVENT_BUFFER_SIZE: usize = 64;
const BACKOFF_INITIAL_MS: u64 = 200;
const BACKOFF_MAX_MS: u64 = 10_000;

/// Cache index: (namespace, name).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self {
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        }
    }

    fn of<T: Resource>(object: &T) -> Option<Self> {
        let meta = object.metadata();
        meta.name.as_ref().map(|name| Self {
            namespace: meta.namespace.clone(),
            name: name.clone(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEventType {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct CacheEvent<T> {
    pub event_type: CacheEventType,
    pub object: T,
}

struct Inner<T> {
    items: RwLock<HashMap<ObjectKey, T>>,
    sender: broadcast::Sender<CacheEvent<T>>,
    synced: AtomicBool,
}

/// Local mirror of one store collection, kept current by a background
/// list-then-watch task.
pub struct WatchCache<T: Resource> {
    inner: Arc<Inner<T>>,
}

impl<T: Resource> Clone for WatchCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Resource> WatchCache<T> {
    /// Starts the filler task. The cache drains on cancellation.
    pub fn start(
        client: ApiClient,
        namespace: Option<String>,
        label_selector: Option<String>,
        cancel: CancellationToken,
    ) -> Self {
        let cache = Self::detached();
        let inner = Arc::clone(&cache.inner);
        tokio::spawn(async move {
            run_cache_loop(inner, client, namespace, label_selector, cancel).await;
        });
        cache
    }

    /// A cache with no filler task. Used by tests and by callers that
    /// feed the cache themselves.
    pub fn detached() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        Self {
            inner: Arc::new(Inner {
                items: RwLock::new(HashMap::new()),
                sender,
                synced: AtomicBool::new(false),
            }),
        }
    }

    pub fn get(&self, namespace: Option<&str>, name: &str) -> Option<T> {
        let items = self.inner.items.read().expect("cache lock poisoned");
        items.get(&ObjectKey::new(namespace, name)).cloned()
    }

    pub fn items(&self) -> Vec<T> {
        let items = self.inner.items.read().expect("cache lock poisoned");
        items.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.items.read().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_synced(&self) -> bool {
        self.inner.synced.load(Ordering::SeqCst)
    }

    /// Blocks until the first successful list completes.
    pub async fn wait_synced(&self, cancel: &CancellationToken) {
        while !self.has_synced() && !cancel.is_cancelled() {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep(Duration::from_millis(50)) => {}
            }
        }
    }

    pub fn subscribe(&self) -> CacheSubscription<T> {
        CacheSubscription {
            receiver: self.inner.sender.subscribe(),
        }
    }

    /// Inserts an object directly, emitting the matching event.
    pub fn store(&self, object: T) {
        if let Some(key) = ObjectKey::of(&object) {
            let previous = {
                let mut items = self.inner.items.write().expect("cache lock poisoned");
                items.insert(key, object.clone())
            };
            let event_type = if previous.is_some() {
                CacheEventType::Modified
            } else {
                CacheEventType::Added
            };
            let _ = self.inner.sender.send(CacheEvent { event_type, object });
        }
        self.inner.synced.store(true, Ordering::SeqCst);
    }

    /// Removes an object directly, emitting a deletion event.
    pub fn discard(&self, namespace: Option<&str>, name: &str) {
        let removed = {
            let mut items = self.inner.items.write().expect("cache lock poisoned");
            items.remove(&ObjectKey::new(namespace, name))
        };
        if let Some(object) = removed {
            let _ = self.inner.sender.send(CacheEvent {
                event_type: CacheEventType::Deleted,
                object,
            });
        }
    }
}

/// Receiver half of a cache's event channel. Lagged intervals are
/// skipped; the cache itself remains authoritative.
pub struct CacheSubscription<T> {
    receiver: broadcast::Receiver<CacheEvent<T>>,
}

impl<T: Clone> CacheSubscription<T> {
    pub async fn recv(&mut self) -> Option<CacheEvent<T>> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

async fn run_cache_loop<T: Resource>(
    inner: Arc<Inner<T>>,
    client: ApiClient,
    namespace: Option<String>,
    label_selector: Option<String>,
    cancel: CancellationToken,
) {
    let mut backoff = Duration::from_millis(BACKOFF_INITIAL_MS);

    loop {
        if cancel.is_cancelled() {
            return;
        }

        let listed = client
            .list::<T>(namespace.as_deref(), label_selector.as_deref())
            .await;
        match listed {
            Ok(list) => {
                backoff = Duration::from_millis(BACKOFF_INITIAL_MS);
                let resource_version = list.metadata.resource_version.clone();
                replace_contents(&inner, list.items);
                inner.synced.store(true, Ordering::SeqCst);

                run_watch_phase(
                    &inner,
                    &client,
                    namespace.as_deref(),
                    label_selector.as_deref(),
                    resource_version.as_deref(),
                    &cancel,
                )
                .await;
            }
            Err(err) => {
                log_warn(
                    COMPONENT,
                    "collection list failed",
                    &[("collection", T::plural()), ("error", &err.to_string())],
                );
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(backoff) => {}
        }
        let next = backoff * 2;
        backoff = next.min(Duration::from_millis(BACKOFF_MAX_MS));
    }
}

async fn run_watch_phase<T: Resource>(
    inner: &Arc<Inner<T>>,
    client: &ApiClient,
    namespace: Option<&str>,
    label_selector: Option<&str>,
    resource_version: Option<&str>,
    cancel: &CancellationToken,
) {
    let mut lines = match client
        .watch::<T>(namespace, label_selector, resource_version)
        .await
    {
        Ok(lines) => lines,
        Err(err) => {
            log_warn(
                COMPONENT,
                "watch open failed",
                &[("collection", T::plural()), ("error", &err.to_string())],
            );
            return;
        }
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            event = lines.next_event() => match event {
                Ok(Some(raw)) => {
                    if !apply_raw_event(inner, &raw.event_type, raw.object) {
                        return;
                    }
                }
                Ok(None) => {
                    log_debug(
                        COMPONENT,
                        "watch stream closed",
                        &[("collection", T::plural())],
                    );
                    return;
                }
                Err(err) => {
                    log_warn(
                        COMPONENT,
                        "watch stream error",
                        &[("collection", T::plural()), ("error", &err.to_string())],
                    );
                    return;
                }
            }
        }
    }
}

fn replace_contents<T: Resource>(inner: &Arc<Inner<T>>, items: Vec<T>) {
    let mut fresh = HashMap::new();
    for object in items {
        if let Some(key) = ObjectKey::of(&object) {
            fresh.insert(key, object);
        }
    }

    let mut events = Vec::new();
    {
        let mut current = inner.items.write().expect("cache lock poisoned");
        for (key, object) in current.iter() {
            if !fresh.contains_key(key) {
                events.push(CacheEvent {
                    event_type: CacheEventType::Deleted,
                    object: object.clone(),
                });
            }
        }
        for object in fresh.values() {
            events.push(CacheEvent {
                event_type: CacheEventType::Modified,
                object: object.clone(),
            });
        }
        *current = fresh;
    }

    for event in events {
        let _ = inner.sender.send(event);
    }
}

/// Applies one decoded watch event. Returns false when the stream must
/// be re-established (error event or undecodable payload).
fn apply_raw_event<T: Resource>(
    inner: &Arc<Inner<T>>,
    event_type: &str,
    object: serde_json::Value,
) -> bool {
    match event_type {
        "ADDED" | "MODIFIED" => match serde_json::from_value::<T>(object) {
            Ok(object) => {
                if let Some(key) = ObjectKey::of(&object) {
                    let previous = {
                        let mut items = inner.items.write().expect("cache lock poisoned");
                        items.insert(key, object.clone())
                    };
                    let event_type = if previous.is_some() {
                        CacheEventType::Modified
                    } else {
                        CacheEventType::Added
                    };
                    let _ = inner.sender.send(CacheEvent { event_type, object });
                }
                true
            }
            Err(err) => {
                log_warn(
                    COMPONENT,
                    "undecodable watch object",
                    &[("collection", T::plural()), ("error", &err.to_string())],
                );
                false
            }
        },
        "DELETED" => match serde_json::from_value::<T>(object) {
            Ok(object) => {
                if let Some(key) = ObjectKey::of(&object) {
                    let mut items = inner.items.write().expect("cache lock poisoned");
                    items.remove(&key);
                    drop(items);
                    let _ = inner.sender.send(CacheEvent {
                        event_type: CacheEventType::Deleted,
                        object,
                    });
                }
                true
            }
            Err(err) => {
                log_warn(
                    COMPONENT,
                    "undecodable watch object",
                    &[("collection", T::plural()), ("error", &err.to_string())],
                );
                false
            }
        },
        "BOOKMARK" => true,
        other => {
            log_warn(
                COMPONENT,
                "watch reported error event",
                &[("collection", T::plural()), ("event", other)],
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::castellan::api::types::{ConfigMap, ObjectMeta};

    fn config_map(namespace: &str, name: &str, value: &str) -> ConfigMap {
        let mut cm = ConfigMap {
            metadata: ObjectMeta::named(Some(namespace), name),
            ..ConfigMap::default()
        };
        cm.data.insert("value".to_string(), value.to_string());
        cm
    }

    #[tokio::test]
    async fn store_and_lookup() {
        let cache: WatchCache<ConfigMap> = WatchCache::detached();
        cache.store(config_map("kube-system", "cluster-config", "v1"));

        let found = cache
            .get(Some("kube-system"), "cluster-config")
            .expect("cached");
        assert_eq!(found.data["value"], "v1");
        assert!(cache.get(Some("other"), "cluster-config").is_none());
        assert!(cache.has_synced());
    }

    #[tokio::test]
    async fn subscription_sees_adds_and_deletes() {
        let cache: WatchCache<ConfigMap> = WatchCache::detached();
        let mut sub = cache.subscribe();

        cache.store(config_map("kube-system", "cluster-config", "v1"));
        let event = sub.recv().await.expect("add event");
        assert_eq!(event.event_type, CacheEventType::Added);

        cache.store(config_map("kube-system", "cluster-config", "v2"));
        let event = sub.recv().await.expect("modify event");
        assert_eq!(event.event_type, CacheEventType::Modified);

        cache.discard(Some("kube-system"), "cluster-config");
        let event = sub.recv().await.expect("delete event");
        assert_eq!(event.event_type, CacheEventType::Deleted);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn apply_raw_event_updates_cache() {
        let cache: WatchCache<ConfigMap> = WatchCache::detached();
        let object = serde_json::to_value(config_map("kube-system", "cluster-config", "v1"))
            .expect("serialize");

        assert!(apply_raw_event(&cache.inner, "ADDED", object.clone()));
        assert_eq!(cache.len(), 1);

        assert!(apply_raw_event(&cache.inner, "DELETED", object));
        assert!(cache.is_empty());

        assert!(!apply_raw_event(
            &cache.inner,
            "ERROR",
            serde_json::Value::Null
        ));
    }
}
