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

//! Leader election over an annotated Endpoints record. Writes go
//! through the store's resource-version check, so two candidates
//! racing for the same lease cannot both win.

use crate::castellan::api::client::{ApiClient, HttpError};
use crate::castellan::api::types::{Endpoints, ObjectMeta};
use crate::castellan::logger::{log_info, log_warn};
use crate::castellan::util::error::with_context;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

const COMPONENT: &str = "election";

/// Annotation on the lock record carrying the serialized leader state.
pub const LEADER_ANNOTATION: &str = "castellan.dev/leader";
/// Name of the update controller's lock record.
pub const DEFAULT_LOCK_NAME: &str = "castellan-update-controller";

pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(15);
pub const DEFAULT_RENEW_DEADLINE: Duration = Duration::from_secs(10);
pub const DEFAULT_RETRY_PERIOD: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderRecord {
    pub holder: String,
    #[serde(rename = "leaseDurationSeconds")]
    pub lease_duration_secs: u64,
    #[serde(rename = "acquiredTime")]
    pub acquired: DateTime<Utc>,
    #[serde(rename = "renewedTime")]
    pub renewed: DateTime<Utc>,
}

impl LeaderRecord {
    fn expired_at(&self, now: DateTime<Utc>) -> bool {
        let lease = ChronoDuration::seconds(self.lease_duration_secs as i64);
        self.renewed + lease < now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockAction {
    Acquire,
    Renew,
    Wait,
}

fn evaluate_lock(record: Option<&LeaderRecord>, identity: &str, now: DateTime<Utc>) -> LockAction {
    match record {
        None => LockAction::Acquire,
        Some(record) if record.holder == identity => LockAction::Renew,
        Some(record) if record.expired_at(now) => LockAction::Acquire,
        Some(_) => LockAction::Wait,
    }
}

#[derive(Debug, Clone)]
pub struct LeaderElectionConfig {
    pub lock_namespace: String,
    pub lock_name: String,
    /// Unique identity of this candidate, typically the pod name.
    pub identity: String,
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

impl LeaderElectionConfig {
    pub fn new(lock_namespace: &str, identity: &str) -> Self {
        Self {
            lock_namespace: lock_namespace.to_string(),
            lock_name: DEFAULT_LOCK_NAME.to_string(),
            identity: identity.to_string(),
            lease_duration: DEFAULT_LEASE_DURATION,
            renew_deadline: DEFAULT_RENEW_DEADLINE,
            retry_period: DEFAULT_RETRY_PERIOD,
        }
    }
}

#[derive(Clone)]
pub struct LeaderElector {
    client: ApiClient,
    config: LeaderElectionConfig,
}

impl LeaderElector {
    pub fn new(client: ApiClient, config: LeaderElectionConfig) -> Self {
        Self { client, config }
    }

    /// Blocks in the election loop until this candidate holds the
    /// lease, then keeps renewing it in the background. The returned
    /// token fires when leadership is lost; `None` means `cancel`
    /// fired before the lease was won.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Option<CancellationToken> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            match self.try_acquire_or_renew().await {
                Ok(true) => break,
                Ok(false) => {}
                Err(err) => {
                    log_warn(
                        COMPONENT,
                        "election attempt failed",
                        &[("error", &err.to_string())],
                    );
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = sleep(self.jittered_retry()) => {}
            }
        }

        log_info(
            COMPONENT,
            "became leader",
            &[("identity", &self.config.identity)],
        );

        let lost = CancellationToken::new();
        let elector = self.clone();
        let renew_lost = lost.clone();
        let renew_cancel = cancel.clone();
        tokio::spawn(async move {
            elector.renew_loop(renew_cancel, renew_lost).await;
        });
        Some(lost)
    }

    async fn renew_loop(self, cancel: CancellationToken, lost: CancellationToken) {
        let mut last_renewal = Instant::now();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    // Process shutdown: stop renewing and let the
                    // lease expire for the next candidate.
                    lost.cancel();
                    return;
                }
                _ = sleep(self.config.retry_period) => {}
            }

            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    last_renewal = Instant::now();
                }
                Ok(false) => {
                    log_warn(COMPONENT, "lease taken over, stepping down", &[]);
                    lost.cancel();
                    return;
                }
                Err(err) => {
                    log_warn(
                        COMPONENT,
                        "lease renewal failed",
                        &[("error", &err.to_string())],
                    );
                    if last_renewal.elapsed() > self.config.renew_deadline {
                        log_warn(COMPONENT, "renew deadline passed, stepping down", &[]);
                        lost.cancel();
                        return;
                    }
                }
            }
        }
    }

    /// One compare-and-swap round against the lock record. Returns
    /// whether this candidate holds the lease afterwards.
    async fn try_acquire_or_renew(&self) -> Result<bool, Box<dyn Error + Send + Sync>> {
        let now = Utc::now();
        let existing = self
            .client
            .get_opt::<Endpoints>(Some(&self.config.lock_namespace), &self.config.lock_name)
            .await?;

        let Some(mut lock) = existing else {
            let mut lock = Endpoints {
                metadata: ObjectMeta::named(
                    Some(&self.config.lock_namespace),
                    &self.config.lock_name,
                ),
            };
            self.stamp_record(&mut lock, now, now)?;
            return match self.client.create(Some(&self.config.lock_namespace), &lock).await {
                Ok(_) => Ok(true),
                Err(err) if is_conflict(err.as_ref()) => Ok(false),
                Err(err) => Err(err),
            };
        };

        let record = lock
            .metadata
            .annotation(LEADER_ANNOTATION)
            .and_then(|raw| serde_json::from_str::<LeaderRecord>(raw).ok());

        let acquired = match evaluate_lock(record.as_ref(), &self.config.identity, now) {
            LockAction::Wait => return Ok(false),
            LockAction::Renew => record
                .as_ref()
                .map(|r| r.acquired)
                .unwrap_or(now),
            LockAction::Acquire => now,
        };

        self.stamp_record(&mut lock, acquired, now)?;
        match self.client.update(&lock).await {
            Ok(_) => Ok(true),
            Err(err) if is_conflict(err.as_ref()) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn stamp_record(
        &self,
        lock: &mut Endpoints,
        acquired: DateTime<Utc>,
        renewed: DateTime<Utc>,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let record = LeaderRecord {
            holder: self.config.identity.clone(),
            lease_duration_secs: self.config.lease_duration.as_secs(),
            acquired,
            renewed,
        };
        let encoded = serde_json::to_string(&record)
            .map_err(|err| with_context(err, "failed to encode leader record"))?;
        lock.metadata.set_annotation(LEADER_ANNOTATION, encoded);
        Ok(())
    }

    fn jittered_retry(&self) -> Duration {
        let base = self.config.retry_period;
        let spread = rand::thread_rng().gen_range(0.0..0.5);
        base.mul_f64(1.0 + spread)
    }
}

fn is_conflict(err: &(dyn Error + 'static)) -> bool {
    let mut current: Option<&(dyn Error + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(http) = e.downcast_ref::<HttpError>() {
            return http.status == StatusCode::CONFLICT;
        }
        current = e.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(holder: &str, renewed_secs_ago: i64) -> LeaderRecord {
        let now = Utc::now();
        LeaderRecord {
            holder: holder.to_string(),
            lease_duration_secs: 15,
            acquired: now - ChronoDuration::seconds(renewed_secs_ago + 30),
            renewed: now - ChronoDuration::seconds(renewed_secs_ago),
        }
    }

    #[test]
    fn missing_record_is_acquired() {
        assert_eq!(
            evaluate_lock(None, "candidate-a", Utc::now()),
            LockAction::Acquire
        );
    }

    #[test]
    fn own_record_is_renewed() {
        let record = record("candidate-a", 5);
        assert_eq!(
            evaluate_lock(Some(&record), "candidate-a", Utc::now()),
            LockAction::Renew
        );
    }

    #[test]
    fn fresh_foreign_lease_waits() {
        let record = record("candidate-b", 5);
        assert_eq!(
            evaluate_lock(Some(&record), "candidate-a", Utc::now()),
            LockAction::Wait
        );
    }

    #[test]
    fn expired_foreign_lease_is_taken_over() {
        let record = record("candidate-b", 60);
        assert_eq!(
            evaluate_lock(Some(&record), "candidate-a", Utc::now()),
            LockAction::Acquire
        );
    }

    #[test]
    fn leader_record_round_trips() {
        let record = record("candidate-a", 0);
        let encoded = serde_json::to_string(&record).expect("encode");
        let decoded: LeaderRecord = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded, record);
    }
}
