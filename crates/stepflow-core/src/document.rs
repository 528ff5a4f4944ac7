// Copyright (c) 2025 Stepflow Team
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Typed representation of a parsed workflow document.
//!
//! The document model mirrors the YAML/JSON surface one-to-one. Field-level
//! validation (unknown keys, typo suggestions, reserved names) happens over
//! the raw value tree in [`crate::validate`] before deserialization into
//! these types, so the structs here stay permissive about absent optional
//! sections.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Document kind; all kinds share identical execution semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowKind {
    Workflow,
    Pipeline,
    Job,
    Playbook,
    Automation,
}

impl Default for WorkflowKind {
    fn default() -> Self {
        Self::Workflow
    }
}

/// Workflow identity and descriptive metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metadata {
    /// Workflow name; combined with `version` it identifies the workflow.
    pub name: String,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Classification tags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Owning team or person.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

/// Secret references resolved by a secrets provider collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecretsSpec {
    /// Provider name (e.g. `env`, `vault`).
    #[serde(default)]
    pub provider: Option<String>,
    /// Keys to resolve, optionally mapped to provider-side names.
    #[serde(default)]
    pub keys: HashMap<String, String>,
}

/// Trigger kind for a schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    Manual,
    Cron,
    Interval,
    Once,
    Event,
    Webhook,
}

/// A trigger declaration on the document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerSpec {
    /// Trigger kind.
    #[serde(rename = "type")]
    pub trigger_type: TriggerType,
    /// Cron expression (5 or 6 fields) for `cron` triggers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    /// Interval in milliseconds for `interval` triggers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,
    /// IANA timezone name; UTC when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    /// Earliest time the trigger may fire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<chrono::DateTime<chrono::Utc>>,
    /// Time after which the trigger expires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<chrono::DateTime<chrono::Utc>>,
    /// Maximum number of firings before the trigger expires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_executions: Option<u64>,
    /// Event source name for `event` triggers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Event filters; all entries must match the event data.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub filters: HashMap<String, serde_json::Value>,
    /// Endpoint string for `webhook` triggers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Suppress firing while a run for this schedule is in flight.
    #[serde(default)]
    pub skip_if_running: bool,
    /// Input merged into every job this trigger enqueues.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub input: HashMap<String, serde_json::Value>,
}

/// Backoff curve for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Linear,
    Exponential,
}

impl Default for BackoffKind {
    fn default() -> Self {
        Self::Exponential
    }
}

/// Retry declaration on a step or in `defaults`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySpec {
    /// Maximum attempts, including the first (must be >= 1).
    pub max: u32,
    /// Backoff curve.
    #[serde(default)]
    pub backoff: BackoffKind,
    /// Base delay in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub delay: u64,
}

fn default_retry_delay_ms() -> u64 {
    1000
}

impl Default for RetrySpec {
    fn default() -> Self {
        Self {
            max: 1,
            backoff: BackoffKind::Exponential,
            delay: default_retry_delay_ms(),
        }
    }
}

/// Workflow-wide defaults applied to steps that do not override them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Defaults {
    /// Default retry policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySpec>,
    /// Default step timeout as a duration string (`500ms`, `30s`, `5m`, `1h`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    /// Default adapter namespace for steps whose `uses` omits one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapter: Option<String>,
}

/// Failure handling strategy type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
    Abort,
    Continue,
    SkipDependent,
}

impl Default for FailureKind {
    fn default() -> Self {
        Self::Abort
    }
}

/// Failure policy declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureSpec {
    /// Strategy applied when a step fails.
    #[serde(rename = "type", default)]
    pub kind: FailureKind,
    /// Whether a run with some successes may finish as `partial`.
    #[serde(default)]
    pub allow_partial_success: bool,
    /// Abort once more than this many steps have failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_failures: Option<usize>,
    /// Steps whose failure always fails the run.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub critical_steps: Vec<String>,
}

impl Default for FailureSpec {
    fn default() -> Self {
        Self {
            kind: FailureKind::default(),
            allow_partial_success: false,
            max_failures: None,
            critical_steps: Vec::new(),
        }
    }
}

/// Run policies: failure handling, concurrency, sandboxing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Policies {
    /// Failure strategy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureSpec>,
    /// Maximum steps in flight for one run (unbounded when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    /// Sandbox profile name; interpretation belongs to the host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
}

/// A single step declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSpec {
    /// Step id, unique within the workflow; `[A-Za-z][A-Za-z0-9_-]*`.
    pub id: String,
    /// Dotted action name, e.g. `http.request.get`.
    pub uses: String,
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Input map; values may contain `${...}` templates.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub with: HashMap<String, serde_json::Value>,
    /// Ids of steps that must complete first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub needs: Vec<String>,
    /// Condition expression; the step is skipped when it evaluates false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    /// Retry policy override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySpec>,
    /// Timeout override as a duration string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    /// Treat failure of this step as non-fatal for the run.
    #[serde(default)]
    pub continue_on_error: bool,
    /// Extra environment entries for the adapter.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    /// Step output projections; values are template expressions.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub outputs: HashMap<String, String>,
}

/// The `workflow:` section holding the step list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowBody {
    /// Steps in declaration order.
    #[serde(default)]
    pub steps: Vec<StepSpec>,
}

/// Root of a workflow document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDocument {
    /// Document format version.
    pub version: String,
    /// Document kind.
    #[serde(default)]
    pub kind: WorkflowKind,
    /// Identity and descriptive metadata.
    pub metadata: Metadata,
    /// Free annotations; engine-controlled prefixes are rejected.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
    /// Declared inputs with default values.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub inputs: HashMap<String, serde_json::Value>,
    /// User-visible shared context seeded into every run.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,
    /// Secret references.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets: Option<SecretsSpec>,
    /// Trigger declarations.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub triggers: Vec<TriggerSpec>,
    /// Step defaults.
    #[serde(default)]
    pub defaults: Defaults,
    /// Run policies.
    #[serde(default)]
    pub policies: Policies,
    /// Workflow output projections computed at the end of a run.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub outputs: HashMap<String, String>,
    /// The step list.
    pub workflow: WorkflowBody,
}

impl WorkflowDocument {
    /// The workflow name from metadata.
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Steps of the workflow.
    pub fn steps(&self) -> &[StepSpec] {
        &self.workflow.steps
    }

    /// Looks up a step by id.
    pub fn step(&self, id: &str) -> Option<&StepSpec> {
        self.workflow.steps.iter().find(|s| s.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_document_roundtrips() {
        let yaml = r#"
version: "1.0"
kind: workflow
metadata: { name: hello }
workflow:
  steps:
    - id: greet
      uses: shell.exec
      with: { command: "echo hi" }
"#;
        let doc: WorkflowDocument = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(doc.name(), "hello");
        assert_eq!(doc.kind, WorkflowKind::Workflow);
        assert_eq!(doc.steps().len(), 1);
        assert_eq!(doc.steps()[0].uses, "shell.exec");
        assert!(doc.steps()[0].with.contains_key("command"));
    }

    #[test]
    fn camel_case_step_fields_deserialize() {
        let yaml = r#"
version: "1.0"
kind: pipeline
metadata: { name: cc }
workflow:
  steps:
    - id: a
      uses: http.request.get
      continueOnError: true
      retry: { max: 3, backoff: linear, delay: 250 }
      timeout: 5s
"#;
        let doc: WorkflowDocument = serde_yaml::from_str(yaml).unwrap();
        let step = &doc.steps()[0];
        assert!(step.continue_on_error);
        let retry = step.retry.as_ref().unwrap();
        assert_eq!(retry.max, 3);
        assert_eq!(retry.backoff, BackoffKind::Linear);
        assert_eq!(retry.delay, 250);
        assert_eq!(step.timeout.as_deref(), Some("5s"));
    }

    #[test]
    fn trigger_spec_parses_cron_and_interval() {
        let yaml = r#"
version: "1.0"
kind: workflow
metadata: { name: t }
triggers:
  - type: cron
    cron: "*/5 * * * *"
    timezone: Europe/Berlin
  - type: interval
    intervalMs: 60000
    maxExecutions: 10
workflow:
  steps:
    - id: s
      uses: noop.run
"#;
        let doc: WorkflowDocument = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(doc.triggers.len(), 2);
        assert_eq!(doc.triggers[0].trigger_type, TriggerType::Cron);
        assert_eq!(doc.triggers[0].cron.as_deref(), Some("*/5 * * * *"));
        assert_eq!(doc.triggers[1].interval_ms, Some(60_000));
        assert_eq!(doc.triggers[1].max_executions, Some(10));
    }
}
