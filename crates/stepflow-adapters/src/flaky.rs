// Copyright (c) 2025 Stepflow Team
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Flaky adapter: fails a fixed number of times, then succeeds.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use stepflow_core::adapter::{Adapter, AdapterContext, AdapterResult};
use stepflow_core::error::Result;

/// Adapter claiming `flaky.*`.
///
/// The first `fail_first` executions return a failed result; subsequent
/// ones succeed. Retry behavior tests drive their scenarios with it.
pub struct FlakyAdapter {
    fail_first: u32,
    calls: AtomicU32,
}

impl FlakyAdapter {
    /// Creates an adapter that fails the first `fail_first` calls.
    pub fn failing_times(fail_first: u32) -> Self {
        Self {
            fail_first,
            calls: AtomicU32::new(0),
        }
    }

    /// Number of executions so far.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Adapter for FlakyAdapter {
    fn name(&self) -> &str {
        "flaky"
    }

    fn supported_actions(&self) -> Vec<String> {
        vec!["flaky.*".to_string()]
    }

    async fn execute(
        &self,
        _action: &str,
        _input: serde_json::Value,
        _ctx: AdapterContext,
    ) -> Result<AdapterResult> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_first {
            return Ok(AdapterResult::failed(format!(
                "transient failure on call {}",
                call + 1
            ))
            .with_code("TRANSIENT"));
        }
        Ok(AdapterResult::ok(serde_json::json!({
            "ok": true,
            "attempts": call + 1,
        })))
    }
}
