// Copyright (c) 2025 Stepflow Team
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Retry backoff arithmetic.

use crate::document::{BackoffKind, RetrySpec};
use rand::Rng;
use std::time::Duration;

const DEFAULT_MAX_DELAY_MS: u64 = 60_000;
const DEFAULT_MULTIPLIER: f64 = 2.0;
const DEFAULT_JITTER: f64 = 0.1;

/// Backoff curve computing the delay before retry attempt `n`.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Curve shape.
    pub kind: BackoffKind,
    /// Base delay in milliseconds.
    pub base_delay_ms: u64,
    /// Upper clip applied before jitter.
    pub max_delay_ms: u64,
    /// Growth factor for the exponential curve.
    pub multiplier: f64,
    /// Jitter fraction in `[0, 1]`; 0 disables jitter.
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            kind: BackoffKind::Exponential,
            base_delay_ms: 1000,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            multiplier: DEFAULT_MULTIPLIER,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl From<&RetrySpec> for Backoff {
    fn from(spec: &RetrySpec) -> Self {
        Self {
            kind: spec.backoff,
            base_delay_ms: spec.delay,
            ..Self::default()
        }
    }
}

impl Backoff {
    /// Creates a backoff with the given curve and base delay.
    pub fn new(kind: BackoffKind, base_delay_ms: u64) -> Self {
        Self {
            kind,
            base_delay_ms,
            ..Self::default()
        }
    }

    /// Disables jitter; handy for deterministic tests.
    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// Caps the pre-jitter delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, max: u64) -> Self {
        self.max_delay_ms = max;
        self
    }

    /// Delay before attempt `n` (1-based).
    ///
    /// fixed = base; linear = base * n; exponential = base * mult^(n-1).
    /// The result is clipped to `max_delay_ms`, then jittered by a uniform
    /// offset in `[-J, +J]` with `J = clipped * jitter`, clamped at zero
    /// and rounded to whole milliseconds.
    pub fn delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let raw = match self.kind {
            BackoffKind::Fixed => self.base_delay_ms as f64,
            BackoffKind::Linear => self.base_delay_ms as f64 * attempt as f64,
            BackoffKind::Exponential => {
                self.base_delay_ms as f64 * self.multiplier.powi(attempt as i32 - 1)
            }
        };
        let clipped = raw.min(self.max_delay_ms as f64);
        let jittered = if self.jitter > 0.0 {
            let j = clipped * self.jitter;
            let offset = rand::thread_rng().gen_range(-j..=j);
            (clipped + offset).max(0.0)
        } else {
            clipped
        };
        Duration::from_millis(jittered.round() as u64)
    }

    /// Sum of delays for attempts `1..=n`.
    pub fn total_delay(&self, attempts: u32) -> Duration {
        (1..=attempts).map(|n| self.delay(n)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_delay_is_constant() {
        let b = Backoff::new(BackoffKind::Fixed, 250).without_jitter();
        for n in 1..=5 {
            assert_eq!(b.delay(n), Duration::from_millis(250));
        }
    }

    #[test]
    fn linear_delay_scales_with_attempt() {
        let b = Backoff::new(BackoffKind::Linear, 100).without_jitter();
        assert_eq!(b.delay(1), Duration::from_millis(100));
        assert_eq!(b.delay(3), Duration::from_millis(300));
    }

    #[test]
    fn exponential_delay_follows_power_curve() {
        let b = Backoff::new(BackoffKind::Exponential, 100).without_jitter();
        assert_eq!(b.delay(1), Duration::from_millis(100));
        assert_eq!(b.delay(2), Duration::from_millis(200));
        assert_eq!(b.delay(4), Duration::from_millis(800));
    }

    #[test]
    fn delay_is_clipped_to_max() {
        let b = Backoff::new(BackoffKind::Exponential, 1000)
            .without_jitter()
            .with_max_delay_ms(3000);
        assert_eq!(b.delay(10), Duration::from_millis(3000));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let b = Backoff {
            kind: BackoffKind::Fixed,
            base_delay_ms: 1000,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            multiplier: DEFAULT_MULTIPLIER,
            jitter: 0.2,
        };
        for _ in 0..100 {
            let d = b.delay(1).as_millis() as f64;
            assert!((800.0..=1200.0).contains(&d), "delay {d} out of bounds");
        }
    }

    #[test]
    fn total_delay_sums_attempts() {
        let b = Backoff::new(BackoffKind::Linear, 100).without_jitter();
        assert_eq!(b.total_delay(3), Duration::from_millis(600));
    }

    #[test]
    fn spec_conversion_keeps_curve_and_base() {
        let spec = RetrySpec {
            max: 5,
            backoff: BackoffKind::Linear,
            delay: 42,
        };
        let b = Backoff::from(&spec);
        assert_eq!(b.kind, BackoffKind::Linear);
        assert_eq!(b.base_delay_ms, 42);
        assert_eq!(b.max_delay_ms, DEFAULT_MAX_DELAY_MS);
    }
}
