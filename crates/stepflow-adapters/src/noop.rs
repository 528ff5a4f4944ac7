// Copyright (c) 2025 Stepflow Team
// SPDX-License-Identifier: MIT OR Apache-2.0

//! No-op adapter: succeeds immediately with a constant output.

use async_trait::async_trait;
use stepflow_core::adapter::{Adapter, AdapterCapabilities, AdapterContext, AdapterResult, CostClass};
use stepflow_core::error::Result;

/// Adapter claiming `noop.*`; useful as a placeholder step.
#[derive(Debug, Default)]
pub struct NoopAdapter;

#[async_trait]
impl Adapter for NoopAdapter {
    fn name(&self) -> &str {
        "noop"
    }

    fn supported_actions(&self) -> Vec<String> {
        vec!["noop.*".to_string()]
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            cacheable: true,
            concurrent: true,
            idempotent: true,
            resources: Vec::new(),
            cost: CostClass::Free,
        }
    }

    async fn execute(
        &self,
        _action: &str,
        _input: serde_json::Value,
        _ctx: AdapterContext,
    ) -> Result<AdapterResult> {
        Ok(AdapterResult::ok(serde_json::json!({ "ok": true })))
    }
}
