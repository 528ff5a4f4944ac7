// Copyright (c) 2025 Stepflow Team
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Retry decision policy.

use crate::document::RetrySpec;
use crate::error::{EngineError, ErrorCode};
use crate::policy::backoff::Backoff;
use regex::Regex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Custom retry predicate; consulted last.
pub type RetryPredicate = Arc<dyn Fn(&EngineError, u32) -> bool + Send + Sync>;

/// Policy deciding whether a failed attempt is retried and after how long.
#[derive(Clone, Default)]
pub struct RetryPolicy {
    /// Maximum attempts including the first.
    pub max_attempts: u32,
    /// Backoff curve between attempts.
    pub backoff: Backoff,
    /// When set, only these error kinds are retried.
    pub retryable_codes: Option<Vec<ErrorCode>>,
    /// Message patterns that make an error retryable regardless of kind.
    pub retryable_messages: Vec<Regex>,
    /// Error kinds that abort immediately, before any other check.
    pub abort_on: Vec<ErrorCode>,
    /// Optional custom predicate.
    pub predicate: Option<RetryPredicate>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("retryable_codes", &self.retryable_codes)
            .field("abort_on", &self.abort_on)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

impl From<&RetrySpec> for RetryPolicy {
    fn from(spec: &RetrySpec) -> Self {
        Self {
            max_attempts: spec.max.max(1),
            backoff: Backoff::from(spec),
            ..Self::default()
        }
    }
}

impl RetryPolicy {
    /// Single-attempt policy (no retries).
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Policy with the given attempt budget and backoff.
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            ..Self::default()
        }
    }

    /// Whether the error aborts retrying outright.
    pub fn should_abort(&self, error: &EngineError) -> bool {
        self.abort_on.contains(&error.code())
    }

    /// Whether attempt `attempt` (1-based, just failed) should be retried.
    pub fn should_retry(&self, error: &EngineError, attempt: u32) -> bool {
        if attempt >= self.max_attempts || self.should_abort(error) {
            return false;
        }
        let kind_allowed = match &self.retryable_codes {
            Some(codes) => {
                codes.contains(&error.code())
                    || self
                        .retryable_messages
                        .iter()
                        .any(|re| re.is_match(&error.to_string()))
            }
            None => true,
        };
        if !kind_allowed {
            return false;
        }
        match &self.predicate {
            Some(predicate) => predicate(error, attempt),
            None => true,
        }
    }

    /// Delay before the next attempt after `attempt` failed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff.delay(attempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::BackoffKind;

    fn adapter_error() -> EngineError {
        EngineError::AdapterFailed {
            adapter: "http".into(),
            action: "http.request.get".into(),
            message: "connection reset".into(),
            code: None,
        }
    }

    fn cancelled() -> EngineError {
        EngineError::Cancelled("engine stop".into())
    }

    #[test]
    fn retries_while_attempts_remain() {
        let policy = RetryPolicy::new(3, Backoff::new(BackoffKind::Fixed, 10).without_jitter());
        let err = adapter_error();
        assert!(policy.should_retry(&err, 1));
        assert!(policy.should_retry(&err, 2));
        assert!(!policy.should_retry(&err, 3));
    }

    #[test]
    fn abort_list_wins_over_attempt_budget() {
        let policy = RetryPolicy {
            max_attempts: 5,
            abort_on: vec![ErrorCode::Cancelled],
            ..RetryPolicy::default()
        };
        assert!(policy.should_abort(&cancelled()));
        assert!(!policy.should_retry(&cancelled(), 1));
        assert!(policy.should_retry(&adapter_error(), 1));
    }

    #[test]
    fn allow_list_restricts_retryable_kinds() {
        let policy = RetryPolicy {
            max_attempts: 5,
            retryable_codes: Some(vec![ErrorCode::StepTimeout]),
            ..RetryPolicy::default()
        };
        assert!(!policy.should_retry(&adapter_error(), 1));
        let timeout = EngineError::StepTimeout {
            step_id: "a".into(),
            timeout_ms: 100,
            elapsed_ms: 120,
        };
        assert!(policy.should_retry(&timeout, 1));
    }

    #[test]
    fn message_pattern_reopens_the_allow_list() {
        let policy = RetryPolicy {
            max_attempts: 5,
            retryable_codes: Some(vec![]),
            retryable_messages: vec![Regex::new("connection reset").unwrap()],
            ..RetryPolicy::default()
        };
        assert!(policy.should_retry(&adapter_error(), 1));
    }

    #[test]
    fn custom_predicate_is_consulted_last() {
        let policy = RetryPolicy {
            max_attempts: 5,
            predicate: Some(Arc::new(|_, attempt| attempt < 2)),
            ..RetryPolicy::default()
        };
        assert!(policy.should_retry(&adapter_error(), 1));
        assert!(!policy.should_retry(&adapter_error(), 2));
    }

    #[test]
    fn spec_conversion_clamps_attempts() {
        let spec = RetrySpec {
            max: 3,
            backoff: BackoffKind::Fixed,
            delay: 5,
        };
        let policy = RetryPolicy::from(&spec);
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.backoff.base_delay_ms, 5);
    }
}
