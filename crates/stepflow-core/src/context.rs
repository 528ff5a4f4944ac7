// Copyright (c) 2025 Stepflow Team
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-run execution context.
//!
//! One [`ContextStore`] exists per workflow run. The workflow executor is
//! the only writer (recording step outputs and bumping the attempt
//! counter); everything else, including adapters and the variable resolver,
//! reads an immutable [`ContextView`] snapshot. Snapshot/restore exists for
//! retry scenarios where a partially-applied mutation must be rolled back.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Immutable identity of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunInfo {
    /// Engine-minted execution id.
    pub execution_id: String,
    /// Workflow id (name@version).
    pub workflow_id: String,
    /// Workflow name.
    pub workflow_name: String,
    /// Workflow version.
    pub workflow_version: String,
    /// Run start time.
    pub started_at: DateTime<Utc>,
    /// What caused the run (`manual`, `cron`, `event:<source>`, ...).
    pub triggered_by: String,
}

impl RunInfo {
    /// Mints a new run identity for a workflow.
    pub fn new(name: &str, version: &str, triggered_by: &str) -> Self {
        Self {
            execution_id: Uuid::new_v4().to_string(),
            workflow_id: format!("{name}@{version}"),
            workflow_name: name.to_string(),
            workflow_version: version.to_string(),
            started_at: Utc::now(),
            triggered_by: triggered_by.to_string(),
        }
    }
}

/// Mutable portion of the run state.
#[derive(Debug, Clone, Default)]
struct ContextData {
    env: HashMap<String, String>,
    inputs: HashMap<String, serde_json::Value>,
    secrets: HashMap<String, String>,
    steps: HashMap<String, serde_json::Value>,
    context: HashMap<String, serde_json::Value>,
    attempt: u32,
}

/// Opaque snapshot of the mutable run state.
#[derive(Debug, Clone)]
pub struct ContextSnapshot(ContextData);

/// The per-run context store.
#[derive(Debug)]
pub struct ContextStore {
    info: RunInfo,
    data: RwLock<ContextData>,
}

impl ContextStore {
    /// Creates the store for a new run.
    pub fn new(
        info: RunInfo,
        env: HashMap<String, String>,
        inputs: HashMap<String, serde_json::Value>,
        secrets: HashMap<String, String>,
        context: HashMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            info,
            data: RwLock::new(ContextData {
                env,
                inputs,
                secrets,
                steps: HashMap::new(),
                context,
                attempt: 0,
            }),
        }
    }

    /// Run identity.
    pub fn info(&self) -> &RunInfo {
        &self.info
    }

    /// Records the output record of a completed step.
    pub fn record_step_output(&self, step_id: &str, record: serde_json::Value) {
        self.data.write().steps.insert(step_id.to_string(), record);
    }

    /// Sets a user-visible context value.
    pub fn set_context_value(&self, key: &str, value: serde_json::Value) {
        self.data.write().context.insert(key.to_string(), value);
    }

    /// Increments and returns the attempt counter.
    pub fn increment_attempt(&self) -> u32 {
        let mut data = self.data.write();
        data.attempt += 1;
        data.attempt
    }

    /// Current attempt counter.
    pub fn attempt(&self) -> u32 {
        self.data.read().attempt
    }

    /// Takes a snapshot of the mutable state.
    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot(self.data.read().clone())
    }

    /// Restores a previously taken snapshot.
    pub fn restore(&self, snapshot: ContextSnapshot) {
        *self.data.write() = snapshot.0;
    }

    /// Produces a read-only view for resolvers and adapters.
    pub fn view(&self) -> ContextView {
        let data = self.data.read();
        ContextView {
            info: self.info.clone(),
            env: data.env.clone(),
            inputs: data.inputs.clone(),
            secrets: data.secrets.clone(),
            steps: data.steps.clone(),
            context: data.context.clone(),
            attempt: data.attempt,
        }
    }
}

/// Read-only snapshot of a run's state, consumed by the variable resolver
/// and handed to adapters.
#[derive(Debug, Clone)]
pub struct ContextView {
    /// Run identity.
    pub info: RunInfo,
    /// Environment entries.
    pub env: HashMap<String, String>,
    /// Workflow inputs.
    pub inputs: HashMap<String, serde_json::Value>,
    /// Secrets (read-only).
    pub secrets: HashMap<String, String>,
    /// Outputs of completed steps, keyed by step id.
    pub steps: HashMap<String, serde_json::Value>,
    /// User-visible shared context.
    pub context: HashMap<String, serde_json::Value>,
    /// Attempt counter at snapshot time.
    pub attempt: u32,
}

impl ContextView {
    /// Resolves a dotted path rooted in one of
    /// `inputs|secrets|steps|context|env|workflow|run`.
    pub fn lookup(&self, path: &str) -> Option<serde_json::Value> {
        let (root, rest) = match path.split_once('.') {
            Some((root, rest)) => (root, Some(rest)),
            None => (path, None),
        };
        match root {
            "inputs" => lookup_in(&map_to_value(&self.inputs), rest),
            "context" => lookup_in(&map_to_value(&self.context), rest),
            "steps" => lookup_in(&map_to_value(&self.steps), rest),
            "env" => lookup_in(&string_map_to_value(&self.env), rest),
            "secrets" => lookup_in(&string_map_to_value(&self.secrets), rest),
            "workflow" => lookup_in(
                &serde_json::json!({
                    "id": self.info.workflow_id,
                    "name": self.info.workflow_name,
                    "version": self.info.workflow_version,
                }),
                rest,
            ),
            "run" => lookup_in(
                &serde_json::json!({
                    "id": self.info.execution_id,
                    "startedAt": self.info.started_at.to_rfc3339(),
                    "attempt": self.attempt,
                    "triggeredBy": self.info.triggered_by,
                }),
                rest,
            ),
            _ => None,
        }
    }
}

fn map_to_value(map: &HashMap<String, serde_json::Value>) -> serde_json::Value {
    serde_json::Value::Object(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
}

fn string_map_to_value(map: &HashMap<String, String>) -> serde_json::Value {
    serde_json::Value::Object(
        map.iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect(),
    )
}

fn lookup_in(value: &serde_json::Value, rest: Option<&str>) -> Option<serde_json::Value> {
    let Some(rest) = rest else {
        return Some(value.clone());
    };
    let mut current = value;
    for segment in rest.split('.') {
        current = match current {
            serde_json::Value::Object(map) => map.get(segment)?,
            serde_json::Value::Array(items) => {
                let index: usize = segment.parse().ok()?;
                items.get(index)?
            }
            _ => return None,
        };
    }
    Some(current.clone())
}
