// Copyright (c) 2025 Stepflow Team
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Timeout parsing and enforcement.
//!
//! Duration strings are digits with an optional `ms|s|m|h` suffix; bare
//! digits are milliseconds. Enforcement races the operation against a
//! monotonic timer; on expiry the run's cancellation token is cancelled,
//! an optional cleanup runs (at most once) and a [`TimeoutError`] carrying
//! the configured and observed times is returned.

use crate::cancel::CancellationToken;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Parses a duration string: `500ms`, `30s`, `5m`, `2h`, or raw `250`.
pub fn parse_duration(input: &str) -> Option<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    let (digits, suffix) = input.split_at(split);
    let value: u64 = digits.parse().ok()?;
    let millis = match suffix {
        "" | "ms" => value,
        "s" => value.checked_mul(1_000)?,
        "m" => value.checked_mul(60_000)?,
        "h" => value.checked_mul(3_600_000)?,
        _ => return None,
    };
    Some(Duration::from_millis(millis))
}

/// An operation exceeded its time budget.
#[derive(Debug, Clone, thiserror::Error)]
#[error("operation '{operation}' timed out after {elapsed_ms}ms (limit {timeout_ms}ms)")]
pub struct TimeoutError {
    /// Configured limit in milliseconds.
    pub timeout_ms: u64,
    /// Observed elapsed time in milliseconds.
    pub elapsed_ms: u64,
    /// Name of the timed-out operation.
    pub operation: String,
}

/// Races `operation` against `limit` on the monotonic clock.
///
/// On expiry the token is cancelled so the operation can unwind, `cleanup`
/// runs at most once, and the error reports configured and observed times.
pub async fn run_with_timeout<T, F, C>(
    name: &str,
    limit: Duration,
    token: &CancellationToken,
    operation: F,
    cleanup: Option<C>,
) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
    C: Future<Output = ()>,
{
    let start = Instant::now();
    tokio::select! {
        result = operation => Ok(result),
        _ = tokio::time::sleep(limit) => {
            token.cancel();
            if let Some(cleanup) = cleanup {
                cleanup.await;
            }
            Err(TimeoutError {
                timeout_ms: limit.as_millis() as u64,
                elapsed_ms: start.elapsed().as_millis() as u64,
                operation: name.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn duration_strings_parse_with_all_suffixes() {
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_duration("250"), Some(Duration::from_millis(250)));
    }

    #[test]
    fn malformed_durations_are_rejected() {
        for bad in ["", "s", "10x", "ms500", "1.5s", "-3s", "10 s"] {
            assert_eq!(parse_duration(bad), None, "accepted {bad:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fast_operation_wins_the_race() {
        let token = CancellationToken::new();
        let result = run_with_timeout(
            "fast",
            Duration::from_secs(1),
            &token,
            async { 42 },
            None::<std::future::Ready<()>>,
        )
        .await;
        assert_eq!(result.unwrap(), 42);
        assert!(!token.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_cancels_and_runs_cleanup_once() {
        let token = CancellationToken::new();
        let cleanups = Arc::new(AtomicUsize::new(0));
        let counter = cleanups.clone();

        let result: Result<(), TimeoutError> = run_with_timeout(
            "slow",
            Duration::from_millis(50),
            &token,
            async {
                tokio::time::sleep(Duration::from_secs(10)).await;
            },
            Some(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.timeout_ms, 50);
        assert_eq!(err.operation, "slow");
        assert!(token.is_cancelled());
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    }
}
