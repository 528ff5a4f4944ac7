// Copyright (c) 2025 Stepflow Team
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Adapter contract.
//!
//! An adapter implements a family of dotted actions (`http.request.*`).
//! The engine talks to adapters exclusively through this trait: pattern
//! based action claiming, optional input validation, and an async
//! `execute` receiving a read-only view of the run plus a cancellation
//! token. Concrete HTTP/shell/filesystem bodies live outside the core.

use crate::cancel::CancellationToken;
use crate::context::ContextView;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Rough cost classification used by planners and billing collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CostClass {
    Free,
    Low,
    Medium,
    High,
}

/// Static capabilities an adapter declares at registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterCapabilities {
    /// Results may be cached for identical inputs.
    pub cacheable: bool,
    /// Multiple actions may run concurrently.
    pub concurrent: bool,
    /// Re-running an action is safe.
    pub idempotent: bool,
    /// Named external resources the adapter needs (network, disk, ...).
    pub resources: Vec<String>,
    /// Cost class of a typical action.
    pub cost: CostClass,
}

impl Default for AdapterCapabilities {
    fn default() -> Self {
        Self {
            cacheable: false,
            concurrent: true,
            idempotent: false,
            resources: Vec::new(),
            cost: CostClass::Low,
        }
    }
}

/// Error details reported by an adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterErrorInfo {
    /// Human-readable message.
    pub message: String,
    /// Adapter-specific code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Structured details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    /// Stack trace or equivalent, when available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// Execution metrics attached to a result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdapterMetrics {
    /// Wall time of the action in milliseconds.
    pub duration_ms: u64,
    /// Adapter-specific metrics.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Outcome of one adapter action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterResult {
    /// Whether the action succeeded.
    pub success: bool,
    /// Output value on success.
    #[serde(default)]
    pub output: serde_json::Value,
    /// Error details on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<AdapterErrorInfo>,
    /// Log lines produced while executing.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<String>,
    /// Execution metrics.
    #[serde(default)]
    pub metrics: AdapterMetrics,
    /// Side effects performed (file written, request sent, ...).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub effects: Vec<String>,
    /// Events the adapter asks the engine to emit.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub emits: Vec<serde_json::Value>,
    /// Non-fatal warnings.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl AdapterResult {
    /// Successful result with the given output.
    pub fn ok(output: serde_json::Value) -> Self {
        Self {
            success: true,
            output,
            error: None,
            logs: Vec::new(),
            metrics: AdapterMetrics::default(),
            effects: Vec::new(),
            emits: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Failed result with a message.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: serde_json::Value::Null,
            error: Some(AdapterErrorInfo {
                message: message.into(),
                code: None,
                details: None,
                stack: None,
            }),
            logs: Vec::new(),
            metrics: AdapterMetrics::default(),
            effects: Vec::new(),
            emits: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Attaches an adapter-specific error code.
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        if let Some(error) = &mut self.error {
            error.code = Some(code.into());
        }
        self
    }

    /// Records the action duration.
    #[must_use]
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.metrics.duration_ms = duration.as_millis() as u64;
        self
    }
}

/// Log level for adapter-scoped logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Everything an adapter may see about the run it executes in.
///
/// The view is read-only; the only write channel an adapter has is the
/// [`AdapterResult`] it returns.
#[derive(Debug, Clone)]
pub struct AdapterContext {
    /// Workflow name.
    pub workflow_name: String,
    /// Step being executed.
    pub step_id: String,
    /// Execution id of the run.
    pub execution_id: String,
    /// Secrets, read-only.
    pub secrets: HashMap<String, String>,
    /// Scratch directory for the step.
    pub temp_dir: PathBuf,
    /// Cancellation token; observe at blocking boundaries.
    pub cancel: CancellationToken,
    /// Advisory time budget for the action.
    pub timeout: Option<Duration>,
    /// Working directory.
    pub cwd: PathBuf,
    /// Environment entries (workflow env merged with step env).
    pub env: HashMap<String, String>,
    /// Outputs of all previously completed steps.
    pub step_outputs: HashMap<String, serde_json::Value>,
    /// Workflow inputs.
    pub inputs: HashMap<String, serde_json::Value>,
    /// User-visible workflow context.
    pub workflow_context: HashMap<String, serde_json::Value>,
}

impl AdapterContext {
    /// Builds the context from a run snapshot.
    pub fn from_view(view: &ContextView, step_id: &str, env: HashMap<String, String>,
                     timeout: Option<Duration>, cancel: CancellationToken) -> Self {
        Self {
            workflow_name: view.info.workflow_name.clone(),
            step_id: step_id.to_string(),
            execution_id: view.info.execution_id.clone(),
            secrets: view.secrets.clone(),
            temp_dir: std::env::temp_dir().join(format!(
                "stepflow-{}-{step_id}",
                view.info.execution_id
            )),
            cancel,
            timeout,
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            env,
            step_outputs: view.steps.clone(),
            inputs: view.inputs.clone(),
            workflow_context: view.context.clone(),
        }
    }

    /// Scoped log line carrying workflow/step/execution fields.
    pub fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => debug!(
                workflow = %self.workflow_name,
                step_id = %self.step_id,
                execution_id = %self.execution_id,
                "{message}"
            ),
            LogLevel::Info => info!(
                workflow = %self.workflow_name,
                step_id = %self.step_id,
                execution_id = %self.execution_id,
                "{message}"
            ),
            LogLevel::Warn => warn!(
                workflow = %self.workflow_name,
                step_id = %self.step_id,
                execution_id = %self.execution_id,
                "{message}"
            ),
            LogLevel::Error => error!(
                workflow = %self.workflow_name,
                step_id = %self.step_id,
                execution_id = %self.execution_id,
                "{message}"
            ),
        }
    }
}

/// Matches a dotted action against a glob pattern.
///
/// `*` matches exactly one segment, except in trailing position where it
/// matches the whole remainder: `http.request.*` claims
/// `http.request.get`; `http.*` claims every http action.
pub fn action_matches(pattern: &str, action: &str) -> bool {
    let mut pattern_segments = pattern.split('.').peekable();
    let mut action_segments = action.split('.');
    loop {
        match pattern_segments.next() {
            None => return action_segments.next().is_none(),
            Some("*") if pattern_segments.peek().is_none() => {
                // Trailing wildcard swallows at least one segment.
                return action_segments.next().is_some();
            }
            Some(segment) => match action_segments.next() {
                Some(actual) if segment == "*" || segment == actual => {}
                _ => return false,
            },
        }
    }
}

/// The adapter contract.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Unique adapter name; also the namespace it claims by default.
    fn name(&self) -> &str;

    /// Adapter version string.
    fn version(&self) -> &str {
        "0.1.0"
    }

    /// Action patterns this adapter implements.
    fn supported_actions(&self) -> Vec<String>;

    /// Declared capabilities.
    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities::default()
    }

    /// Whether the adapter claims the action.
    fn supports(&self, action: &str) -> bool {
        self.supported_actions()
            .iter()
            .any(|pattern| action_matches(pattern, action))
    }

    /// Validates an input map for an action; returns problem descriptions.
    fn validate(&self, _action: &str, _input: &serde_json::Value) -> Vec<String> {
        Vec::new()
    }

    /// Called once when the engine starts.
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Called once when the engine stops.
    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }

    /// Executes one action.
    async fn execute(
        &self,
        action: &str,
        input: serde_json::Value,
        ctx: AdapterContext,
    ) -> Result<AdapterResult>;
}

impl std::fmt::Debug for dyn Adapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Adapter")
            .field("name", &self.name())
            .field("version", &self.version())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_patterns_match_exactly() {
        assert!(action_matches("shell.exec", "shell.exec"));
        assert!(!action_matches("shell.exec", "shell.exec.sudo"));
        assert!(!action_matches("shell.exec", "shell"));
    }

    #[test]
    fn inner_wildcard_matches_one_segment() {
        assert!(action_matches("http.*.get", "http.request.get"));
        assert!(!action_matches("http.*.get", "http.request.v2.get"));
    }

    #[test]
    fn trailing_wildcard_matches_remainder() {
        assert!(action_matches("http.request.*", "http.request.get"));
        assert!(action_matches("http.*", "http.request.post"));
        assert!(action_matches("http.*", "http.request.v2.post"));
        assert!(!action_matches("http.*", "http"));
        assert!(!action_matches("http.request.*", "http.request"));
    }

    #[test]
    fn result_constructors_set_success_flag() {
        let ok = AdapterResult::ok(serde_json::json!({"n": 1}));
        assert!(ok.success);
        assert!(ok.error.is_none());

        let failed = AdapterResult::failed("boom").with_code("E_BOOM");
        assert!(!failed.success);
        let error = failed.error.unwrap();
        assert_eq!(error.message, "boom");
        assert_eq!(error.code.as_deref(), Some("E_BOOM"));
    }
}
