// Copyright (c) 2025 Stepflow Team
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Reserved-field guard.
//!
//! The engine controls a closed set of field names and annotation prefixes
//! (billing, identity, audit, trace plumbing). Documents that try to set any
//! of them are rejected before structural validation runs, so a hostile
//! document cannot influence engine-internal bookkeeping even when the rest
//! of it is malformed.

use crate::error::{EngineError, Result};
use serde_yaml::Value;

/// Field names the engine refuses anywhere in user input.
pub const RESERVED_FIELDS: &[&str] = &[
    "_internal",
    "_billing",
    "_identity",
    "_ownership",
    "_usage",
    "_audit",
];

/// Identifiers minted by the engine; user documents may not set them.
pub const RESERVED_IDENTIFIERS: &[&str] = &[
    "executionId",
    "runId",
    "traceId",
    "userId",
    "workspaceId",
    "subscriptionId",
    "billingId",
    "pricingTier",
    "pricingModel",
    "billingSnapshot",
];

/// Annotation key prefixes owned by the engine.
pub const RESERVED_ANNOTATION_PREFIXES: &[&str] = &[
    "engine.",
    "system.",
    "internal.",
    "billing.",
    "audit.",
    "security.",
];

fn reserved_reason(field: &str) -> Option<&'static str> {
    if RESERVED_FIELDS.contains(&field) {
        Some("engine-controlled namespace")
    } else if RESERVED_IDENTIFIERS.contains(&field) {
        Some("identifier minted by the engine")
    } else {
        None
    }
}

fn violation(field: &str, location: &str, reason: &str) -> EngineError {
    EngineError::SecurityViolation {
        field: field.to_string(),
        location: location.to_string(),
        reason: reason.to_string(),
        suggestion: Some(format!(
            "remove '{field}'; the engine sets this value itself"
        )),
    }
}

fn check_keys(map: &serde_yaml::Mapping, location: &str) -> Result<()> {
    for key in map.keys() {
        if let Value::String(name) = key {
            if let Some(reason) = reserved_reason(name) {
                return Err(violation(name, location, reason));
            }
        }
    }
    Ok(())
}

fn mapping<'a>(value: &'a Value, key: &str) -> Option<&'a serde_yaml::Mapping> {
    value.get(key).and_then(Value::as_mapping)
}

/// Scans a raw document tree for reserved fields and annotation prefixes.
///
/// Covers the root keys, the `context` map, every step (including its
/// `with`, `env` and `outputs` maps) and the `annotations` keys. Returns the
/// first violation found; no other validation has run at that point.
pub fn scan_document(root: &Value) -> Result<()> {
    let Some(root_map) = root.as_mapping() else {
        return Ok(());
    };

    check_keys(root_map, "workflow (root level)")?;

    if let Some(context) = mapping(root, "context") {
        check_keys(context, "context")?;
    }

    if let Some(annotations) = mapping(root, "annotations") {
        for key in annotations.keys() {
            if let Value::String(name) = key {
                if let Some(reason) = reserved_reason(name) {
                    return Err(violation(name, "annotations", reason));
                }
                if let Some(prefix) = RESERVED_ANNOTATION_PREFIXES
                    .iter()
                    .find(|p| name.starts_with(*p))
                {
                    return Err(violation(
                        name,
                        "annotations",
                        &format!("annotation prefix '{prefix}' is engine-controlled"),
                    ));
                }
            }
        }
    }

    let steps = root
        .get("workflow")
        .and_then(|w| w.get("steps"))
        .and_then(Value::as_sequence);
    if let Some(steps) = steps {
        for (index, step) in steps.iter().enumerate() {
            let Some(step_map) = step.as_mapping() else {
                continue;
            };
            let id = step
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or("<unnamed>");
            let location = format!("workflow.steps[{index}] (step '{id}')");
            check_keys(step_map, &location)?;
            for section in ["with", "env", "outputs"] {
                if let Some(map) = mapping(step, section) {
                    check_keys(map, &format!("{location}.{section}"))?;
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Value {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn clean_document_passes() {
        let root = parse(
            r#"
version: "1.0"
kind: workflow
metadata: { name: ok }
context: { region: eu }
annotations: { team.owner: platform }
workflow:
  steps:
    - id: a
      uses: noop.run
      with: { value: 1 }
"#,
        );
        assert!(scan_document(&root).is_ok());
    }

    #[test]
    fn root_level_billing_field_is_rejected() {
        let root = parse(
            r#"
version: "1.0"
kind: workflow
metadata: { name: bad }
_billing: { plan: free }
workflow:
  steps: []
"#,
        );
        let err = scan_document(&root).unwrap_err();
        match err {
            EngineError::SecurityViolation { field, location, .. } => {
                assert_eq!(field, "_billing");
                assert_eq!(location, "workflow (root level)");
            }
            other => panic!("expected SecurityViolation, got {other:?}"),
        }
    }

    #[test]
    fn reserved_identifier_in_context_is_rejected() {
        let root = parse(
            r#"
version: "1.0"
metadata: { name: bad }
context: { executionId: sneaky }
workflow:
  steps: []
"#,
        );
        let err = scan_document(&root).unwrap_err();
        match err {
            EngineError::SecurityViolation { field, location, .. } => {
                assert_eq!(field, "executionId");
                assert_eq!(location, "context");
            }
            other => panic!("expected SecurityViolation, got {other:?}"),
        }
    }

    #[test]
    fn engine_annotation_prefix_is_rejected() {
        let root = parse(
            r#"
version: "1.0"
metadata: { name: bad }
annotations: { engine.max_retries: "5" }
workflow:
  steps: []
"#,
        );
        let err = scan_document(&root).unwrap_err();
        match err {
            EngineError::SecurityViolation { field, location, .. } => {
                assert_eq!(field, "engine.max_retries");
                assert_eq!(location, "annotations");
            }
            other => panic!("expected SecurityViolation, got {other:?}"),
        }
    }

    #[test]
    fn reserved_field_inside_step_with_is_rejected() {
        let root = parse(
            r#"
version: "1.0"
metadata: { name: bad }
workflow:
  steps:
    - id: a
      uses: noop.run
      with: { traceId: abc }
"#,
        );
        let err = scan_document(&root).unwrap_err();
        match err {
            EngineError::SecurityViolation { field, location, .. } => {
                assert_eq!(field, "traceId");
                assert!(location.contains("steps[0]"));
                assert!(location.ends_with(".with"));
            }
            other => panic!("expected SecurityViolation, got {other:?}"),
        }
    }
}
