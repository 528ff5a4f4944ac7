// Copyright (c) 2025 Stepflow Team
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Translation of validated documents into execution-ready form.
//!
//! A [`ParsedStep`] is the immutable runtime view of a step: its adapter
//! namespace resolved from the action string, workflow defaults folded in,
//! timeout parsed into a real [`Duration`]. [`ParsedWorkflow`] bundles the
//! steps with their dependency DAG; everything downstream (executor, engine,
//! dry-run planner) works on it and never on the raw document.

use crate::dag::WorkflowDag;
use crate::document::{
    FailureSpec, RetrySpec, StepSpec, TriggerSpec, WorkflowDocument, WorkflowKind,
};
use crate::error::Result;
use crate::policy::timeout::parse_duration;
use std::collections::HashMap;
use std::time::Duration;

/// Classification of the adapter namespace of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
    Http,
    Shell,
    Cli,
    Fs,
    Webhook,
    Plugin,
}

impl AdapterKind {
    /// Classifies a namespace string; anything not built-in is a plugin.
    pub fn classify(namespace: &str) -> Self {
        match namespace {
            "http" => Self::Http,
            "shell" => Self::Shell,
            "cli" => Self::Cli,
            "fs" => Self::Fs,
            "webhook" => Self::Webhook,
            _ => Self::Plugin,
        }
    }
}

/// Execution-ready step, created at parse time and immutable thereafter.
#[derive(Debug, Clone)]
pub struct ParsedStep {
    /// Step id.
    pub id: String,
    /// Display name (falls back to the id).
    pub name: String,
    /// Full dotted action string.
    pub action: String,
    /// First dotted segment of the action.
    pub namespace: String,
    /// Built-in/plugin classification of the namespace.
    pub kind: AdapterKind,
    /// Raw input map; values may contain templates.
    pub with: HashMap<String, serde_json::Value>,
    /// Dependencies.
    pub needs: Vec<String>,
    /// Skip condition.
    pub when: Option<String>,
    /// Effective retry policy (step override or workflow default).
    pub retry: Option<RetrySpec>,
    /// Effective timeout (step override or workflow default).
    pub timeout: Option<Duration>,
    /// Failure of this step does not fail the run.
    pub continue_on_error: bool,
    /// Extra environment entries.
    pub env: HashMap<String, String>,
    /// Output projections.
    pub outputs: HashMap<String, String>,
}

impl ParsedStep {
    fn from_spec(spec: &StepSpec, doc: &WorkflowDocument) -> Self {
        let (namespace, action) = resolve_action(&spec.uses, doc.defaults.adapter.as_deref());
        let timeout = spec
            .timeout
            .as_deref()
            .or(doc.defaults.timeout.as_deref())
            .and_then(parse_duration);
        Self {
            id: spec.id.clone(),
            name: spec.name.clone().unwrap_or_else(|| spec.id.clone()),
            kind: AdapterKind::classify(&namespace),
            namespace,
            action,
            with: spec.with.clone(),
            needs: spec.needs.clone(),
            when: spec.when.clone(),
            retry: spec.retry.clone().or_else(|| doc.defaults.retry.clone()),
            timeout,
            continue_on_error: spec.continue_on_error,
            env: spec.env.clone(),
            outputs: spec.outputs.clone(),
        }
    }
}

/// Resolves the namespace of an action string, applying the workflow's
/// default adapter when the action has no dotted prefix.
fn resolve_action(uses: &str, default_adapter: Option<&str>) -> (String, String) {
    match uses.split_once('.') {
        Some((namespace, _)) => (namespace.to_string(), uses.to_string()),
        None => match default_adapter {
            Some(ns) => (ns.to_string(), format!("{ns}.{uses}")),
            None => (uses.to_string(), uses.to_string()),
        },
    }
}

/// A validated workflow in execution-ready form.
#[derive(Debug, Clone)]
pub struct ParsedWorkflow {
    /// Workflow name.
    pub name: String,
    /// Workflow version.
    pub version: String,
    /// Document kind.
    pub kind: WorkflowKind,
    /// Declared inputs with defaults.
    pub inputs: HashMap<String, serde_json::Value>,
    /// Initial shared context.
    pub context: HashMap<String, serde_json::Value>,
    /// Workflow output projections.
    pub outputs: HashMap<String, String>,
    /// Failure strategy (document policy or defaults).
    pub failure: FailureSpec,
    /// Per-run step concurrency cap from policies.
    pub concurrency: Option<usize>,
    /// Trigger declarations.
    pub triggers: Vec<TriggerSpec>,
    /// Steps in declaration order.
    pub steps: Vec<ParsedStep>,
    /// Dependency DAG.
    pub dag: WorkflowDag,
}

impl ParsedWorkflow {
    /// Parses a validated document. Callers that start from text should use
    /// [`crate::validate::parse_document`] first.
    pub fn parse(doc: &WorkflowDocument) -> Result<Self> {
        let steps: Vec<ParsedStep> = doc
            .steps()
            .iter()
            .map(|s| ParsedStep::from_spec(s, doc))
            .collect();
        let dag = WorkflowDag::from_steps(doc.steps())?;
        Ok(Self {
            name: doc.metadata.name.clone(),
            version: doc.version.clone(),
            kind: doc.kind,
            inputs: doc.inputs.clone(),
            context: doc.context.clone(),
            outputs: doc.outputs.clone(),
            failure: doc.policies.failure.clone().unwrap_or_default(),
            concurrency: doc.policies.concurrency,
            triggers: doc.triggers.clone(),
            steps,
            dag,
        })
    }

    /// Looks up a parsed step by id.
    pub fn step(&self, id: &str) -> Option<&ParsedStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Phase partition of the step DAG.
    pub fn phases(&self) -> Vec<Vec<String>> {
        self.dag.phases()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validate::parse_document;

    #[test]
    fn adapter_namespace_comes_from_first_segment() {
        let doc = parse_document(
            r#"
version: "1.0"
metadata: { name: ns }
workflow:
  steps:
    - { id: a, uses: http.request.get }
    - { id: b, uses: shell.exec }
    - { id: c, uses: my_plugin.do.thing }
"#,
        )
        .unwrap();
        let wf = ParsedWorkflow::parse(&doc).unwrap();
        assert_eq!(wf.step("a").unwrap().namespace, "http");
        assert_eq!(wf.step("a").unwrap().kind, AdapterKind::Http);
        assert_eq!(wf.step("b").unwrap().kind, AdapterKind::Shell);
        assert_eq!(wf.step("c").unwrap().kind, AdapterKind::Plugin);
    }

    #[test]
    fn workflow_defaults_fold_into_steps() {
        let doc = parse_document(
            r#"
version: "1.0"
metadata: { name: defaults }
defaults:
  retry: { max: 4, backoff: fixed, delay: 100 }
  timeout: 30s
  adapter: shell
workflow:
  steps:
    - { id: plain, uses: exec }
    - id: custom
      uses: http.request.get
      retry: { max: 2 }
      timeout: 5s
"#,
        )
        .unwrap();
        let wf = ParsedWorkflow::parse(&doc).unwrap();

        let plain = wf.step("plain").unwrap();
        assert_eq!(plain.action, "shell.exec");
        assert_eq!(plain.retry.as_ref().unwrap().max, 4);
        assert_eq!(plain.timeout, Some(Duration::from_secs(30)));

        let custom = wf.step("custom").unwrap();
        assert_eq!(custom.retry.as_ref().unwrap().max, 2);
        assert_eq!(custom.timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn display_name_falls_back_to_id() {
        let doc = parse_document(
            r#"
version: "1.0"
metadata: { name: names }
workflow:
  steps:
    - { id: a, uses: noop.run }
    - { id: b, uses: noop.run, name: "Fancy step" }
"#,
        )
        .unwrap();
        let wf = ParsedWorkflow::parse(&doc).unwrap();
        assert_eq!(wf.step("a").unwrap().name, "a");
        assert_eq!(wf.step("b").unwrap().name, "Fancy step");
    }
}
