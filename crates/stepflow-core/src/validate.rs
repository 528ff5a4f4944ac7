// Copyright (c) 2025 Stepflow Team
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Schema validation for workflow documents.
//!
//! Validation runs in a fixed order: the security scan over the raw tree,
//! then structural checks (unknown fields with typo suggestions, missing
//! required fields, wrong types), then enum and range checks, then the step
//! graph checks (unique ids, resolvable `needs`, acyclicity, no forward
//! output references). Structural and semantic passes accumulate as many
//! diagnostics as they can instead of stopping at the first.

use crate::cron::CronExpression;
use crate::dag;
use crate::document::{StepSpec, TriggerType, WorkflowDocument};
use crate::error::{Diagnostic, EngineError, ErrorCode, Result};
use crate::policy::timeout::parse_duration;
use crate::resolve::template_refs;
use crate::security;
use crate::typo::suggestion_hint;
use serde_yaml::Value;
use std::collections::{HashMap, HashSet};

const ROOT_KEYS: &[&str] = &[
    "version", "kind", "metadata", "annotations", "inputs", "context", "secrets",
    "triggers", "defaults", "policies", "outputs", "workflow",
];
const METADATA_KEYS: &[&str] = &["name", "description", "tags", "owner"];
const SECRETS_KEYS: &[&str] = &["provider", "keys"];
const TRIGGER_KEYS: &[&str] = &[
    "type", "cron", "intervalMs", "timezone", "startDate", "endDate",
    "maxExecutions", "source", "filters", "endpoint", "skipIfRunning", "input",
];
const DEFAULTS_KEYS: &[&str] = &["retry", "timeout", "adapter"];
const POLICIES_KEYS: &[&str] = &["failure", "concurrency", "sandbox"];
const FAILURE_KEYS: &[&str] = &["type", "allowPartialSuccess", "maxFailures", "criticalSteps"];
const RETRY_KEYS: &[&str] = &["max", "backoff", "delay"];
const STEP_KEYS: &[&str] = &[
    "id", "uses", "name", "with", "needs", "when", "retry", "timeout",
    "continueOnError", "env", "outputs",
];
const WORKFLOW_KEYS: &[&str] = &["steps"];

const KIND_VALUES: &[&str] = &["workflow", "pipeline", "job", "playbook", "automation"];
const TRIGGER_TYPE_VALUES: &[&str] = &["manual", "cron", "interval", "once", "event", "webhook"];
const BACKOFF_VALUES: &[&str] = &["fixed", "linear", "exponential"];
const FAILURE_TYPE_VALUES: &[&str] = &["abort", "continue", "skipDependent"];

/// Prefixes a `when` expression reference is allowed to use.
pub const CONDITION_REF_PREFIXES: &[&str] =
    &["inputs.", "secrets.", "steps.", "context.", "env."];

/// Regular expression a step id must match: `[A-Za-z][A-Za-z0-9_-]*`.
pub fn is_valid_step_id(id: &str) -> bool {
    let mut chars = id.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Parses and fully validates a YAML or JSON workflow document.
///
/// This is the single entry point front-ends should use; the returned
/// document has passed every check in §validation order.
pub fn parse_document(source: &str) -> Result<WorkflowDocument> {
    let raw: Value =
        serde_yaml::from_str(source).map_err(|e| EngineError::Parse(e.to_string()))?;
    validate_raw(&raw)
}

/// Validates an already-parsed raw value tree.
pub fn validate_raw(raw: &Value) -> Result<WorkflowDocument> {
    // 1. Security scan before anything else.
    security::scan_document(raw)?;

    // 2. Structural checks over the raw tree.
    let mut diags = Vec::new();
    check_structure(raw, &mut diags);
    if !diags.is_empty() {
        return Err(EngineError::Invalid(diags));
    }

    let doc: WorkflowDocument = serde_yaml::from_value(raw.clone())
        .map_err(|e| EngineError::Parse(e.to_string()))?;

    // 3 + 4. Enum/range and step graph checks on the typed document.
    validate_document(&doc)?;
    Ok(doc)
}

/// Runs the semantic checks (enum/range + step graph) on a typed document.
///
/// Useful for documents constructed programmatically rather than parsed.
pub fn validate_document(doc: &WorkflowDocument) -> Result<()> {
    let mut diags = Vec::new();
    check_ranges(doc, &mut diags);
    check_step_graph(doc, &mut diags);
    if diags.is_empty() {
        Ok(())
    } else {
        Err(EngineError::Invalid(diags))
    }
}

fn unknown_key_diag(path: &str, key: &str, known: &[&str]) -> Diagnostic {
    let mut diag = Diagnostic::error(
        ErrorCode::UnknownField,
        path,
        format!("unknown field '{key}'"),
    )
    .with_context("field", Value::String(key.into()).into_json());
    if let Some(hint) = suggestion_hint(key, known) {
        diag = diag.with_hint(hint);
    }
    diag
}

trait IntoJson {
    fn into_json(self) -> serde_json::Value;
}

impl IntoJson for Value {
    fn into_json(self) -> serde_json::Value {
        serde_json::to_value(&self).unwrap_or(serde_json::Value::Null)
    }
}

fn check_unknown_keys(
    map: &serde_yaml::Mapping,
    known: &[&str],
    path: &str,
    diags: &mut Vec<Diagnostic>,
) {
    for key in map.keys() {
        match key {
            Value::String(name) => {
                if !known.contains(&name.as_str()) {
                    diags.push(unknown_key_diag(path, name, known));
                }
            }
            other => diags.push(Diagnostic::error(
                ErrorCode::WrongType,
                path,
                format!("non-string key {other:?}"),
            )),
        }
    }
}

fn expect_mapping<'a>(
    value: Option<&'a Value>,
    path: &str,
    required: bool,
    diags: &mut Vec<Diagnostic>,
) -> Option<&'a serde_yaml::Mapping> {
    match value {
        Some(v) => match v.as_mapping() {
            Some(m) => Some(m),
            None => {
                diags.push(Diagnostic::error(
                    ErrorCode::WrongType,
                    path,
                    "expected a mapping",
                ));
                None
            }
        },
        None => {
            if required {
                diags.push(Diagnostic::error(
                    ErrorCode::MissingField,
                    path,
                    "required section is missing",
                ));
            }
            None
        }
    }
}

fn expect_string(value: Option<&Value>, path: &str, required: bool, diags: &mut Vec<Diagnostic>) {
    match value {
        Some(Value::String(_)) => {}
        Some(_) => diags.push(Diagnostic::error(
            ErrorCode::WrongType,
            path,
            "expected a string",
        )),
        None if required => diags.push(Diagnostic::error(
            ErrorCode::MissingField,
            path,
            "required field is missing",
        )),
        None => {}
    }
}

fn check_enum(value: Option<&Value>, allowed: &[&str], path: &str, diags: &mut Vec<Diagnostic>) {
    if let Some(Value::String(s)) = value {
        if !allowed.contains(&s.as_str()) {
            diags.push(
                Diagnostic::error(
                    ErrorCode::InvalidEnum,
                    path,
                    format!("'{s}' is not one of {allowed:?}"),
                )
                .with_context("allowed", serde_json::json!(allowed)),
            );
        }
    }
}

fn check_retry_block(value: Option<&Value>, path: &str, diags: &mut Vec<Diagnostic>) {
    let Some(map) = expect_mapping(value, path, false, diags) else {
        return;
    };
    check_unknown_keys(map, RETRY_KEYS, path, diags);
    check_enum(
        map.get("backoff"),
        BACKOFF_VALUES,
        &format!("{path}.backoff"),
        diags,
    );
    match map.get("max") {
        Some(Value::Number(n)) => {
            if n.as_u64().map_or(true, |v| v < 1) {
                diags.push(Diagnostic::error(
                    ErrorCode::InvalidValue,
                    format!("{path}.max"),
                    "retry.max must be an integer >= 1",
                ));
            }
        }
        Some(_) => diags.push(Diagnostic::error(
            ErrorCode::WrongType,
            format!("{path}.max"),
            "expected an integer",
        )),
        None => diags.push(Diagnostic::error(
            ErrorCode::MissingField,
            format!("{path}.max"),
            "retry requires 'max'",
        )),
    }
}

fn check_timeout_string(value: Option<&Value>, path: &str, diags: &mut Vec<Diagnostic>) {
    match value {
        Some(Value::String(s)) => {
            if parse_duration(s).is_none() {
                diags.push(
                    Diagnostic::error(
                        ErrorCode::InvalidValue,
                        path,
                        format!("'{s}' is not a duration"),
                    )
                    .with_hint("use digits with an optional ms/s/m/h suffix, e.g. '30s'"),
                );
            }
        }
        Some(Value::Number(n)) => {
            diags.push(
                Diagnostic::error(
                    ErrorCode::WrongType,
                    path,
                    "expected a duration string",
                )
                .with_hint(format!("quote raw milliseconds: \"{n}\"")),
            );
        }
        None => {}
        Some(_) => diags.push(Diagnostic::error(
            ErrorCode::WrongType,
            path,
            "expected a duration string",
        )),
    }
}

fn check_structure(raw: &Value, diags: &mut Vec<Diagnostic>) {
    let Some(root) = raw.as_mapping() else {
        diags.push(Diagnostic::error(
            ErrorCode::WrongType,
            "workflow (root level)",
            "document root must be a mapping",
        ));
        return;
    };

    check_unknown_keys(root, ROOT_KEYS, "workflow (root level)", diags);
    expect_string(raw.get("version"), "version", true, diags);
    check_enum(raw.get("kind"), KIND_VALUES, "kind", diags);

    if let Some(metadata) = expect_mapping(raw.get("metadata"), "metadata", true, diags) {
        check_unknown_keys(metadata, METADATA_KEYS, "metadata", diags);
        expect_string(metadata.get("name"), "metadata.name", true, diags);
    }

    if let Some(secrets) = expect_mapping(raw.get("secrets"), "secrets", false, diags) {
        check_unknown_keys(secrets, SECRETS_KEYS, "secrets", diags);
    }

    if let Some(defaults) = expect_mapping(raw.get("defaults"), "defaults", false, diags) {
        check_unknown_keys(defaults, DEFAULTS_KEYS, "defaults", diags);
        check_retry_block(defaults.get("retry"), "defaults.retry", diags);
        check_timeout_string(defaults.get("timeout"), "defaults.timeout", diags);
    }

    if let Some(policies) = expect_mapping(raw.get("policies"), "policies", false, diags) {
        check_unknown_keys(policies, POLICIES_KEYS, "policies", diags);
        if let Some(failure) = expect_mapping(
            policies.get("failure"),
            "policies.failure",
            false,
            diags,
        ) {
            check_unknown_keys(failure, FAILURE_KEYS, "policies.failure", diags);
            check_enum(
                failure.get("type"),
                FAILURE_TYPE_VALUES,
                "policies.failure.type",
                diags,
            );
        }
    }

    if let Some(triggers) = raw.get("triggers") {
        match triggers.as_sequence() {
            Some(seq) => {
                for (i, trigger) in seq.iter().enumerate() {
                    let path = format!("triggers[{i}]");
                    let Some(map) = expect_mapping(Some(trigger), &path, false, diags) else {
                        continue;
                    };
                    check_unknown_keys(map, TRIGGER_KEYS, &path, diags);
                    let ty = map.get("type");
                    if ty.is_none() {
                        diags.push(Diagnostic::error(
                            ErrorCode::MissingField,
                            format!("{path}.type"),
                            "trigger requires 'type'",
                        ));
                    }
                    check_enum(ty, TRIGGER_TYPE_VALUES, &format!("{path}.type"), diags);
                }
            }
            None => diags.push(Diagnostic::error(
                ErrorCode::WrongType,
                "triggers",
                "expected a sequence",
            )),
        }
    }

    let Some(workflow) = expect_mapping(raw.get("workflow"), "workflow", true, diags) else {
        return;
    };
    check_unknown_keys(workflow, WORKFLOW_KEYS, "workflow", diags);
    let Some(steps) = workflow.get("steps") else {
        diags.push(Diagnostic::error(
            ErrorCode::MissingField,
            "workflow.steps",
            "workflow requires 'steps'",
        ));
        return;
    };
    let Some(steps) = steps.as_sequence() else {
        diags.push(Diagnostic::error(
            ErrorCode::WrongType,
            "workflow.steps",
            "expected a sequence",
        ));
        return;
    };

    for (i, step) in steps.iter().enumerate() {
        let path = format!("workflow.steps[{i}]");
        let Some(map) = expect_mapping(Some(step), &path, false, diags) else {
            continue;
        };
        check_unknown_keys(map, STEP_KEYS, &path, diags);
        expect_string(map.get("id"), &format!("{path}.id"), true, diags);
        expect_string(map.get("uses"), &format!("{path}.uses"), true, diags);
        check_retry_block(map.get("retry"), &format!("{path}.retry"), diags);
        check_timeout_string(
            map.get("timeout"),
            &format!("{path}.timeout"),
            diags,
        );
        if let Some(needs) = map.get("needs") {
            if needs.as_sequence().is_none() {
                diags.push(Diagnostic::error(
                    ErrorCode::WrongType,
                    format!("{path}.needs"),
                    "expected a sequence of step ids",
                ));
            }
        }
    }
}

fn check_ranges(doc: &WorkflowDocument, diags: &mut Vec<Diagnostic>) {
    for (i, trigger) in doc.triggers.iter().enumerate() {
        let path = format!("triggers[{i}]");
        match trigger.trigger_type {
            TriggerType::Cron => match &trigger.cron {
                Some(expr) => {
                    if let Err(e) = CronExpression::parse(expr) {
                        diags.push(Diagnostic::error(
                            ErrorCode::InvalidCron,
                            format!("{path}.cron"),
                            e.to_string(),
                        ));
                    }
                }
                None => diags.push(Diagnostic::error(
                    ErrorCode::MissingField,
                    format!("{path}.cron"),
                    "cron trigger requires 'cron'",
                )),
            },
            TriggerType::Interval => {
                if trigger.interval_ms.map_or(true, |ms| ms == 0) {
                    diags.push(Diagnostic::error(
                        ErrorCode::InvalidValue,
                        format!("{path}.intervalMs"),
                        "interval trigger requires a positive 'intervalMs'",
                    ));
                }
            }
            TriggerType::Event => {
                if trigger.source.is_none() {
                    diags.push(Diagnostic::error(
                        ErrorCode::MissingField,
                        format!("{path}.source"),
                        "event trigger requires 'source'",
                    ));
                }
            }
            TriggerType::Webhook => {
                if trigger.endpoint.is_none() {
                    diags.push(Diagnostic::error(
                        ErrorCode::MissingField,
                        format!("{path}.endpoint"),
                        "webhook trigger requires 'endpoint'",
                    ));
                }
            }
            TriggerType::Manual | TriggerType::Once => {}
        }
        if let Some(tz) = &trigger.timezone {
            if tz.parse::<chrono_tz::Tz>().is_err() {
                diags.push(Diagnostic::error(
                    ErrorCode::InvalidValue,
                    format!("{path}.timezone"),
                    format!("unknown timezone '{tz}'"),
                ));
            }
        }
    }
}

fn check_condition(step: &StepSpec, path: &str, diags: &mut Vec<Diagnostic>) {
    let Some(when) = &step.when else { return };
    if when.trim().is_empty() {
        diags.push(Diagnostic::error(
            ErrorCode::InvalidCondition,
            format!("{path}.when"),
            "condition must not be empty",
        ));
        return;
    }
    for reference in template_refs(when) {
        let allowed = CONDITION_REF_PREFIXES
            .iter()
            .any(|p| reference.starts_with(p));
        if !allowed {
            diags.push(
                Diagnostic::error(
                    ErrorCode::InvalidVariableReference,
                    format!("{path}.when"),
                    format!("reference '${{{reference}}}' must start with one of {CONDITION_REF_PREFIXES:?}"),
                )
                .with_context("reference", serde_json::Value::String(reference.clone())),
            );
        }
    }
}

fn check_step_graph(doc: &WorkflowDocument, diags: &mut Vec<Diagnostic>) {
    let steps = doc.steps();
    if steps.is_empty() {
        diags.push(Diagnostic::error(
            ErrorCode::EmptyWorkflow,
            "workflow.steps",
            "workflow has no steps",
        ));
        return;
    }

    let mut seen: HashMap<&str, usize> = HashMap::new();
    for (i, step) in steps.iter().enumerate() {
        let path = format!("workflow.steps[{i}]");
        if !is_valid_step_id(&step.id) {
            diags.push(
                Diagnostic::error(
                    ErrorCode::InvalidStepId,
                    format!("{path}.id"),
                    format!("'{}' is not a valid step id", step.id),
                )
                .with_hint("ids start with a letter and contain only letters, digits, '_' and '-'"),
            );
        }
        if let Some(first) = seen.insert(step.id.as_str(), i) {
            diags.push(
                Diagnostic::error(
                    ErrorCode::DuplicateStepId,
                    format!("{path}.id"),
                    format!("step id '{}' already used at workflow.steps[{first}]", step.id),
                )
                .with_context("step", serde_json::Value::String(step.id.clone())),
            );
        }
        check_condition(step, &path, diags);
    }

    let ids: HashSet<&str> = steps.iter().map(|s| s.id.as_str()).collect();
    for (i, step) in steps.iter().enumerate() {
        for dep in &step.needs {
            if !ids.contains(dep.as_str()) {
                diags.push(
                    Diagnostic::error(
                        ErrorCode::UnknownStepReference,
                        format!("workflow.steps[{i}].needs"),
                        format!("step '{}' depends on unknown step '{dep}'", step.id),
                    )
                    .with_context("reference", serde_json::Value::String(dep.clone())),
                );
            }
        }
    }
    // Cycle and forward-reference checks need a well-formed reference set.
    if !diags.is_empty() {
        return;
    }

    if let Some(cycle) = dag::find_cycle(steps) {
        diags.push(
            Diagnostic::error(
                ErrorCode::CircularDependency,
                "workflow.steps",
                format!("circular dependency: {}", cycle.join(" -> ")),
            )
            .with_context("cycle", serde_json::json!(cycle)),
        );
        return;
    }

    // Forward references: a step's outputs may only read steps that are
    // guaranteed to have completed, i.e. its transitive dependencies.
    for (i, step) in steps.iter().enumerate() {
        let ancestors = dag::transitive_dependencies(steps, &step.id);
        for (key, template) in &step.outputs {
            for reference in template_refs(template) {
                let Some(rest) = reference.strip_prefix("steps.") else {
                    continue;
                };
                let target = rest.split('.').next().unwrap_or(rest);
                if target == step.id {
                    continue;
                }
                if !ancestors.contains(target) {
                    diags.push(
                        Diagnostic::error(
                            ErrorCode::ForwardReference,
                            format!("workflow.steps[{i}].outputs.{key}"),
                            format!(
                                "output references step '{target}' which is not a dependency of '{}'",
                                step.id
                            ),
                        )
                        .with_hint(format!("add '{target}' to needs of '{}'", step.id)),
                    );
                }
            }
        }
    }
}
