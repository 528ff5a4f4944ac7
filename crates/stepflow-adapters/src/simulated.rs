// Copyright (c) 2025 Stepflow Team
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Simulated adapter for offline development and testing.
//!
//! Models an external service with configurable latency and failure rate
//! so workflows can be exercised end to end without real providers.

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use stepflow_core::adapter::{Adapter, AdapterContext, AdapterResult, LogLevel};
use stepflow_core::error::Result;
use tokio::time::Instant;

/// Configuration for the simulated adapter.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Simulated latency range (min, max) in milliseconds.
    pub latency_range_ms: (u64, u64),
    /// Failure rate for testing error handling (0.0 to 1.0).
    pub failure_rate: f64,
    /// Seed for reproducible simulations.
    pub seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            latency_range_ms: (5, 20),
            failure_rate: 0.0,
            seed: None,
        }
    }
}

/// Adapter claiming `sim.*`; sleeps for a sampled latency, then succeeds
/// or fails according to the configured rate.
pub struct SimulatedAdapter {
    config: SimulationConfig,
    rng: Mutex<StdRng>,
}

impl SimulatedAdapter {
    /// Creates an adapter with the given configuration.
    pub fn new(config: SimulationConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            rng: Mutex::new(rng),
        }
    }

    fn sample(&self) -> (Duration, bool) {
        let mut rng = self.rng.lock();
        let (min, max) = self.config.latency_range_ms;
        let latency = if max > min {
            rng.gen_range(min..=max)
        } else {
            min
        };
        let fails = self.config.failure_rate > 0.0 && rng.gen::<f64>() < self.config.failure_rate;
        (Duration::from_millis(latency), fails)
    }
}

impl Default for SimulatedAdapter {
    fn default() -> Self {
        Self::new(SimulationConfig::default())
    }
}

#[async_trait]
impl Adapter for SimulatedAdapter {
    fn name(&self) -> &str {
        "sim"
    }

    fn supported_actions(&self) -> Vec<String> {
        vec!["sim.*".to_string()]
    }

    async fn execute(
        &self,
        action: &str,
        input: serde_json::Value,
        ctx: AdapterContext,
    ) -> Result<AdapterResult> {
        let start = Instant::now();
        let (latency, fails) = self.sample();

        tokio::select! {
            _ = tokio::time::sleep(latency) => {}
            _ = ctx.cancel.cancelled() => {
                return Ok(AdapterResult::failed("simulation cancelled")
                    .with_code("CANCELLED")
                    .with_duration(start.elapsed()));
            }
        }

        if fails {
            ctx.log(LogLevel::Warn, "simulated failure");
            return Ok(AdapterResult::failed(format!("simulated failure for '{action}'"))
                .with_code("SIMULATED_FAILURE")
                .with_duration(start.elapsed()));
        }

        Ok(AdapterResult::ok(serde_json::json!({
            "ok": true,
            "action": action,
            "echo": input,
        }))
        .with_duration(start.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_failures_are_reproducible() {
        let config = SimulationConfig {
            latency_range_ms: (0, 0),
            failure_rate: 0.5,
            seed: Some(7),
        };
        let a: Vec<bool> = {
            let adapter = SimulatedAdapter::new(config.clone());
            (0..32).map(|_| adapter.sample().1).collect()
        };
        let b: Vec<bool> = {
            let adapter = SimulatedAdapter::new(config);
            (0..32).map(|_| adapter.sample().1).collect()
        };
        assert_eq!(a, b);
        assert!(a.iter().any(|&f| f));
        assert!(a.iter().any(|&f| !f));
    }

    #[test]
    fn latency_stays_in_range() {
        let adapter = SimulatedAdapter::new(SimulationConfig {
            latency_range_ms: (5, 10),
            failure_rate: 0.0,
            seed: Some(1),
        });
        for _ in 0..50 {
            let (latency, _) = adapter.sample();
            assert!((5..=10).contains(&(latency.as_millis() as u64)));
        }
    }
}
