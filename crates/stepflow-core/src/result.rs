// Copyright (c) 2025 Stepflow Team
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Result records produced by workflow runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Final status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failed,
    Partial,
    Timeout,
    Cancelled,
}

/// Execution status of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

pub(crate) fn serialize_duration<S>(
    duration: &Duration,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

pub(crate) fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let millis = u64::deserialize(deserializer)?;
    Ok(Duration::from_millis(millis))
}

/// Result of a single step execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    /// Step id.
    pub step_id: String,
    /// Final status.
    pub status: StepStatus,
    /// Wall time spent on the step, in milliseconds on the wire.
    #[serde(
        serialize_with = "serialize_duration",
        deserialize_with = "deserialize_duration"
    )]
    pub duration: Duration,
    /// Attempts made (1 for a first-try success, 0 for a skipped step).
    pub attempts: u32,
    /// Step output record on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    /// Failure or skip reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepResult {
    /// A skipped step with the given reason.
    pub fn skipped(step_id: &str, reason: impl Into<String>) -> Self {
        Self {
            step_id: step_id.to_string(),
            status: StepStatus::Skipped,
            duration: Duration::ZERO,
            attempts: 0,
            output: None,
            error: Some(reason.into()),
        }
    }
}

/// Aggregate counters for a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Total steps in the workflow.
    pub total_steps: usize,
    /// Steps that completed successfully.
    pub successful_steps: usize,
    /// Steps that failed.
    pub failed_steps: usize,
    /// Steps skipped by conditions or failure strategy.
    pub skipped_steps: usize,
    /// Number of phases in the execution plan.
    pub phases: usize,
}

/// Result of a whole workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    /// Workflow name.
    pub workflow_name: String,
    /// Execution id of the run.
    pub execution_id: String,
    /// Final status.
    pub status: RunStatus,
    /// Per-step results.
    pub step_results: HashMap<String, StepResult>,
    /// Workflow output projections computed at the end of the run.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub outputs: HashMap<String, serde_json::Value>,
    /// Total wall time, in milliseconds on the wire.
    #[serde(
        serialize_with = "serialize_duration",
        deserialize_with = "deserialize_duration"
    )]
    pub duration: Duration,
    /// Run start time.
    pub started_at: DateTime<Utc>,
    /// Run completion time.
    pub completed_at: DateTime<Utc>,
    /// Aggregate counters.
    pub metadata: RunMetadata,
    /// First fatal cause, when the run did not succeed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkflowResult {
    /// Whether the run reached a terminal success (full or partial).
    pub fn succeeded(&self) -> bool {
        matches!(self.status, RunStatus::Success | RunStatus::Partial)
    }
}
