// Copyright (c) 2025 Stepflow Team
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error taxonomy for the workflow engine.
//!
//! Every failure surfaced by the engine is one of a closed set of kinds:
//! security, schema, validation, adapter, step, execution, queue, scheduler.
//! Validation produces as many diagnostics as it can in one pass; runtime
//! errors carry the structured context the formatters need (code, path,
//! hint) without free-form string matching.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Convenience alias used across the engine.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Machine-readable code identifying an error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Security
    ReservedField,
    ReservedAnnotationPrefix,
    // Schema
    ParseFailure,
    UnknownField,
    MissingField,
    WrongType,
    InvalidEnum,
    InvalidValue,
    // Validation
    DuplicateStepId,
    InvalidStepId,
    UnknownStepReference,
    CircularDependency,
    ForwardReference,
    EmptyWorkflow,
    MissingInput,
    InvalidCondition,
    InvalidVariableReference,
    // Adapter
    UnknownAdapter,
    UnsupportedAction,
    AdapterFailed,
    // Step
    StepNotFound,
    StepTimeout,
    StepFailed,
    DependencyFailed,
    InvalidStepConfig,
    // Execution
    WorkflowTimeout,
    Cancelled,
    PartialFailure,
    // Queue
    QueueFull,
    JobNotFound,
    // Scheduler
    InvalidCron,
    ScheduleNotFound,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_else(|| format!("{self:?}"));
        f.write_str(&s)
    }
}

/// Severity of a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

/// A single validation finding with enough structure for both the human
/// and the JSON formatter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Error kind code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// JSON-path-like location in the document (e.g. `workflow.steps[2].retry`).
    pub path: String,
    /// Optional remediation hint ("did you mean `timeout`?").
    pub hint: Option<String>,
    /// Severity of the finding.
    pub severity: Severity,
    /// Extra structured context (offending value, allowed values, ...).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,
}

impl Diagnostic {
    /// Creates an error-severity diagnostic.
    pub fn error(code: ErrorCode, path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            path: path.into(),
            hint: None,
            severity: Severity::Error,
            context: HashMap::new(),
        }
    }

    /// Attaches a hint.
    #[must_use]
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Attaches a context entry.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.code, self.path, self.message)?;
        if let Some(hint) = &self.hint {
            write!(f, " ({hint})")?;
        }
        Ok(())
    }
}

/// Engine error type covering the closed taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// User attempted to set a reserved field or annotation prefix.
    #[error("security violation at {location}: field '{field}' is reserved ({reason})")]
    SecurityViolation {
        /// Offending field name.
        field: String,
        /// Location in the document ("workflow (root level)", "context", ...).
        location: String,
        /// Why the field is rejected.
        reason: String,
        /// Optional suggestion for a permitted alternative.
        suggestion: Option<String>,
    },

    /// YAML/JSON could not be parsed at all.
    #[error("failed to parse workflow document: {0}")]
    Parse(String),

    /// Structural or semantic validation failed; all findings are attached.
    #[error("workflow validation failed with {} issue(s); first: {}", .0.len(), first_message(.0))]
    Invalid(Vec<Diagnostic>),

    /// No adapter claims the given action.
    #[error("no adapter found for action '{action}' (registered: {})", .registered.join(", "))]
    UnknownAdapter {
        /// The action string that failed to resolve.
        action: String,
        /// Names of all registered adapters.
        registered: Vec<String>,
    },

    /// An adapter was found but does not support the action.
    #[error("adapter '{adapter}' does not support action '{action}'")]
    UnsupportedAction {
        /// Adapter that was consulted.
        adapter: String,
        /// The unsupported action.
        action: String,
    },

    /// An adapter reported an internal failure.
    #[error("adapter '{adapter}' failed executing '{action}': {message}")]
    AdapterFailed {
        /// Adapter that failed.
        adapter: String,
        /// Action being executed.
        action: String,
        /// Failure message from the adapter.
        message: String,
        /// Adapter-specific error code, if any.
        code: Option<String>,
    },

    /// Referenced step does not exist.
    #[error("step '{0}' not found")]
    StepNotFound(String),

    /// A step exceeded its time budget.
    #[error("step '{step_id}' timed out after {elapsed_ms}ms (limit {timeout_ms}ms)")]
    StepTimeout {
        /// Step that timed out.
        step_id: String,
        /// Configured timeout in milliseconds.
        timeout_ms: u64,
        /// Observed elapsed time in milliseconds.
        elapsed_ms: u64,
    },

    /// A step failed after exhausting its retry policy.
    #[error("step '{step_id}' failed after {attempts} attempt(s): {message}")]
    StepFailed {
        /// Step that failed.
        step_id: String,
        /// Number of attempts made.
        attempts: u32,
        /// Final failure message.
        message: String,
    },

    /// A step could not run because a dependency failed.
    #[error("step '{step_id}' skipped: dependency {dependency} failed")]
    DependencyFailed {
        /// Step that was skipped.
        step_id: String,
        /// The failed dependency.
        dependency: String,
    },

    /// Step configuration is invalid at execution time.
    #[error("invalid configuration for step '{step_id}': {reason}")]
    InvalidStepConfig {
        /// Step with the bad configuration.
        step_id: String,
        /// What is wrong with it.
        reason: String,
    },

    /// The whole run exceeded its time budget.
    #[error("workflow '{workflow}' timed out after {timeout_ms}ms")]
    WorkflowTimeout {
        /// Workflow name.
        workflow: String,
        /// Configured timeout in milliseconds.
        timeout_ms: u64,
    },

    /// The run was cancelled before completion.
    #[error("execution cancelled: {0}")]
    Cancelled(String),

    /// Some steps failed; summary of the damage.
    #[error("workflow '{workflow}' partially failed: {failed} of {total} step(s) failed")]
    PartialFailure {
        /// Workflow name.
        workflow: String,
        /// Number of failed steps.
        failed: usize,
        /// Total number of steps.
        total: usize,
    },

    /// The job queue is at capacity.
    #[error("job queue is full (max size {max_size})")]
    QueueFull {
        /// Configured maximum queue size.
        max_size: usize,
    },

    /// Job id not present in the queue.
    #[error("job '{0}' not found")]
    JobNotFound(String),

    /// Cron expression could not be parsed.
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCron {
        /// The offending expression.
        expression: String,
        /// Why it is invalid.
        reason: String,
    },

    /// Schedule id not registered.
    #[error("schedule '{0}' not found")]
    ScheduleNotFound(String),
}

fn first_message(diagnostics: &[Diagnostic]) -> String {
    diagnostics
        .first()
        .map(ToString::to_string)
        .unwrap_or_else(|| "unknown".to_string())
}

impl EngineError {
    /// The machine-readable code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::SecurityViolation { .. } => ErrorCode::ReservedField,
            Self::Parse(_) => ErrorCode::ParseFailure,
            Self::Invalid(diags) => diags
                .first()
                .map_or(ErrorCode::InvalidValue, |d| d.code),
            Self::UnknownAdapter { .. } => ErrorCode::UnknownAdapter,
            Self::UnsupportedAction { .. } => ErrorCode::UnsupportedAction,
            Self::AdapterFailed { .. } => ErrorCode::AdapterFailed,
            Self::StepNotFound(_) => ErrorCode::StepNotFound,
            Self::StepTimeout { .. } => ErrorCode::StepTimeout,
            Self::StepFailed { .. } => ErrorCode::StepFailed,
            Self::DependencyFailed { .. } => ErrorCode::DependencyFailed,
            Self::InvalidStepConfig { .. } => ErrorCode::InvalidStepConfig,
            Self::WorkflowTimeout { .. } => ErrorCode::WorkflowTimeout,
            Self::Cancelled(_) => ErrorCode::Cancelled,
            Self::PartialFailure { .. } => ErrorCode::PartialFailure,
            Self::QueueFull { .. } => ErrorCode::QueueFull,
            Self::JobNotFound(_) => ErrorCode::JobNotFound,
            Self::InvalidCron { .. } => ErrorCode::InvalidCron,
            Self::ScheduleNotFound(_) => ErrorCode::ScheduleNotFound,
        }
    }

    /// All diagnostics carried by this error (one synthesized for
    /// non-validation kinds).
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        match self {
            Self::Invalid(diags) => diags.clone(),
            Self::SecurityViolation {
                field,
                location,
                reason,
                suggestion,
            } => {
                let mut diag = Diagnostic::error(
                    ErrorCode::ReservedField,
                    location.clone(),
                    format!("field '{field}' is reserved: {reason}"),
                )
                .with_context("field", serde_json::Value::String(field.clone()));
                if let Some(s) = suggestion {
                    diag = diag.with_hint(s.clone());
                }
                vec![diag]
            }
            other => vec![Diagnostic::error(other.code(), "", other.to_string())],
        }
    }

    /// Whether the error kind is retryable by default policy.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::AdapterFailed { .. } | Self::StepTimeout { .. } | Self::StepFailed { .. }
        )
    }
}

impl From<serde_yaml::Error> for EngineError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}
