// Copyright (c) 2025 Stepflow Team
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Echo adapter: returns its input unchanged.

use async_trait::async_trait;
use stepflow_core::adapter::{Adapter, AdapterCapabilities, AdapterContext, AdapterResult, CostClass};
use stepflow_core::error::Result;

/// Adapter claiming `echo.*`; the action output is the resolved input map.
#[derive(Debug, Default)]
pub struct EchoAdapter;

#[async_trait]
impl Adapter for EchoAdapter {
    fn name(&self) -> &str {
        "echo"
    }

    fn supported_actions(&self) -> Vec<String> {
        vec!["echo.*".to_string()]
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
        input: serde_json::Value,
        _ctx: AdapterContext,
    ) -> Result<AdapterResult> {
        Ok(AdapterResult::ok(input))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepflow_core::adapter::Adapter;

    #[test]
    fn claims_echo_namespace() {
        let adapter = EchoAdapter;
        assert!(adapter.supports("echo.say"));
        assert!(!adapter.supports("shell.exec"));
    }
}
