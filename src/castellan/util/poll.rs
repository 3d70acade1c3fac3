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

use crate::castellan::util::error::new_error;
use std::error::Error;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

type BoxedError = Box<dyn Error + Send + Sync>;

const CANCELLED_MESSAGE: &str = "operation cancelled";
const DEADLINE_MESSAGE: &str = "deadline exceeded";

/// Returns true when the error came from a poll deadline, not the condition.
pub fn is_deadline_error(err: &(dyn Error + 'static)) -> bool {
    err.to_string().contains(DEADLINE_MESSAGE)
}

/// Tries `condition` every `interval` until it returns true, an error,
/// the deadline passes, or `cancel` fires.
pub async fn poll<F, Fut>(
    cancel: &CancellationToken,
    interval: Duration,
    deadline: Duration,
    mut condition: F,
) -> Result<(), BoxedError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, BoxedError>>,
{
    let started = Instant::now();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(new_error(CANCELLED_MESSAGE)),
            _ = sleep(interval) => {}
        }
        if condition().await? {
            return Ok(());
        }
        if started.elapsed() >= deadline {
            return Err(new_error(format!(
                "{} after {:?}",
                DEADLINE_MESSAGE, deadline
            )));
        }
    }
}

/// Like [`poll`], except the condition is tried immediately before the
/// first interval elapses.
pub async fn poll_immediate<F, Fut>(
    cancel: &CancellationToken,
    interval: Duration,
    deadline: Duration,
    mut condition: F,
) -> Result<(), BoxedError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, BoxedError>>,
{
    if condition().await? {
        return Ok(());
    }
    poll(cancel, interval, deadline, condition).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn poll_immediate_returns_on_first_success() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        poll_immediate(
            &cancel,
            Duration::from_millis(5),
            Duration::from_secs(1),
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(true)
                }
            },
        )
        .await
        .expect("condition satisfied");

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn poll_reports_deadline() {
        let cancel = CancellationToken::new();
        let err = poll(
            &cancel,
            Duration::from_millis(5),
            Duration::from_millis(20),
            || async { Ok(false) },
        )
        .await
        .expect_err("deadline expected");

        assert!(is_deadline_error(err.as_ref()), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn poll_stops_when_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = poll(
            &cancel,
            Duration::from_millis(5),
            Duration::from_secs(5),
            || async { Ok(false) },
        )
        .await
        .expect_err("cancellation expected");

        assert!(err.to_string().contains("cancelled"));
    }

    #[tokio::test]
    async fn poll_propagates_condition_errors() {
        let cancel = CancellationToken::new();
        let err = poll_immediate(
            &cancel,
            Duration::from_millis(5),
            Duration::from_secs(1),
            || async { Err(new_error("boom")) },
        )
        .await
        .expect_err("condition error expected");

        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn poll_waits_for_late_success() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        poll(
            &cancel,
            Duration::from_millis(2),
            Duration::from_secs(5),
            move || {
                let counter = Arc::clone(&counter);
                async move { Ok(counter.fetch_add(1, Ordering::SeqCst) >= 2) }
            },
        )
        .await
        .expect("condition eventually satisfied");

        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
