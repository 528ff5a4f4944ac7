// Copyright (c) 2025 Stepflow Team
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Variable template resolution.
//!
//! Strings may embed `${path}` or `${path:default}` references, where
//! `path` is a dotted chain rooted in one of
//! `inputs|secrets|steps|context|env|workflow|run`. Resolution is a single
//! left-to-right pass: substituted text is never rescanned, and a reference
//! that resolves to nothing and carries no default is preserved literally
//! so later tooling may inject it.

use crate::context::ContextView;
use std::collections::HashMap;

/// Roots a template path may start with.
pub const TEMPLATE_ROOTS: &[&str] = &[
    "inputs", "secrets", "steps", "context", "env", "workflow", "run",
];

/// One `${...}` occurrence inside a string.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Token {
    /// Byte range of the whole `${...}` token.
    start: usize,
    end: usize,
    /// The dotted path.
    path: String,
    /// Optional default after `:`.
    default: Option<String>,
}

fn scan_tokens(input: &str) -> Vec<Token> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i + 1 < bytes.len() {
        if bytes[i] == b'$' && bytes[i + 1] == b'{' {
            if let Some(close) = input[i + 2..].find('}') {
                let end = i + 2 + close + 1;
                let body = &input[i + 2..end - 1];
                let (path, default) = match body.split_once(':') {
                    Some((p, d)) => (p.trim().to_string(), Some(d.to_string())),
                    None => (body.trim().to_string(), None),
                };
                tokens.push(Token {
                    start: i,
                    end,
                    path,
                    default,
                });
                i = end;
                continue;
            }
        }
        i += 1;
    }
    tokens
}

/// Extracts every template path referenced in a string (defaults stripped).
pub fn template_refs(input: &str) -> Vec<String> {
    scan_tokens(input).into_iter().map(|t| t.path).collect()
}

fn value_to_fragment(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// Expands templates inside a string, returning the expanded string.
pub fn resolve_str(input: &str, ctx: &ContextView) -> String {
    let tokens = scan_tokens(input);
    if tokens.is_empty() {
        return input.to_string();
    }
    let mut out = String::with_capacity(input.len());
    let mut cursor = 0;
    for token in &tokens {
        out.push_str(&input[cursor..token.start]);
        match ctx.lookup(&token.path) {
            Some(value) => out.push_str(&value_to_fragment(&value)),
            None => match &token.default {
                Some(default) => out.push_str(default),
                // Preserve the literal token for later injection.
                None => out.push_str(&input[token.start..token.end]),
            },
        }
        cursor = token.end;
    }
    out.push_str(&input[cursor..]);
    out
}

/// Expands templates inside a JSON value tree.
///
/// A string that consists of exactly one `${...}` token resolves to the
/// referenced value with its type intact (objects stay objects); strings
/// with surrounding text resolve via [`resolve_str`].
pub fn resolve_value(value: &serde_json::Value, ctx: &ContextView) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) => {
            let tokens = scan_tokens(s);
            if tokens.len() == 1 && tokens[0].start == 0 && tokens[0].end == s.len() {
                let token = &tokens[0];
                return match ctx.lookup(&token.path) {
                    Some(resolved) => resolved,
                    None => match &token.default {
                        Some(default) => serde_json::Value::String(default.clone()),
                        None => serde_json::Value::String(s.clone()),
                    },
                };
            }
            serde_json::Value::String(resolve_str(s, ctx))
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(|v| resolve_value(v, ctx)).collect())
        }
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, ctx)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Expands templates in a string-valued map (step `env`, output projections).
pub fn resolve_string_map(
    map: &HashMap<String, String>,
    ctx: &ContextView,
) -> HashMap<String, String> {
    map.iter()
        .map(|(k, v)| (k.clone(), resolve_str(v, ctx)))
        .collect()
}

/// Computes output projections: each template resolves to a typed value.
pub fn resolve_projections(
    outputs: &HashMap<String, String>,
    ctx: &ContextView,
) -> HashMap<String, serde_json::Value> {
    outputs
        .iter()
        .map(|(k, template)| {
            (
                k.clone(),
                resolve_value(&serde_json::Value::String(template.clone()), ctx),
            )
        })
        .collect()
}

/// Evaluates a `when` condition against the context.
///
/// Templates are expanded first. The expression then supports `==` and `!=`
/// between two operands (compared as trimmed strings, quotes stripped);
/// anything else is evaluated for truthiness, where the empty string,
/// `false`, `0`, `null` and an unresolved `${...}` reference are false.
pub fn evaluate_condition(expr: &str, ctx: &ContextView) -> bool {
    let resolved = resolve_str(expr, ctx);
    let trimmed = resolved.trim();

    if let Some((lhs, rhs)) = split_operator(trimmed, "==") {
        return normalize(lhs) == normalize(rhs);
    }
    if let Some((lhs, rhs)) = split_operator(trimmed, "!=") {
        return normalize(lhs) != normalize(rhs);
    }
    truthy(trimmed)
}

fn split_operator<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    expr.split_once(op)
}

fn normalize(operand: &str) -> &str {
    operand
        .trim()
        .trim_matches(|c| c == '"' || c == '\'')
}

fn truthy(value: &str) -> bool {
    if value.contains("${") {
        return false;
    }
    !matches!(value, "" | "false" | "0" | "null" | "undefined")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextStore, RunInfo};
    use std::collections::HashMap;

    fn view() -> ContextView {
        let store = ContextStore::new(
            RunInfo::new("demo", "2.1", "manual"),
            HashMap::from([("STAGE".to_string(), "prod".to_string())]),
            HashMap::from([
                ("name".to_string(), serde_json::json!("world")),
                ("count".to_string(), serde_json::json!(3)),
                (
                    "options".to_string(),
                    serde_json::json!({"verbose": true}),
                ),
            ]),
            HashMap::new(),
            HashMap::new(),
        );
        store.record_step_output(
            "fetch",
            serde_json::json!({"outputs": {"status": 200, "body": "ok"}}),
        );
        store.view()
    }

    #[test]
    fn embedded_templates_expand_in_place() {
        let ctx = view();
        assert_eq!(
            resolve_str("hello ${inputs.name}!", &ctx),
            "hello world!"
        );
        assert_eq!(
            resolve_str("status=${steps.fetch.outputs.status}", &ctx),
            "status=200"
        );
    }

    #[test]
    fn unresolved_reference_is_preserved_literally() {
        let ctx = view();
        assert_eq!(
            resolve_str("value: ${inputs.missing}", &ctx),
            "value: ${inputs.missing}"
        );
    }

    #[test]
    fn default_applies_only_when_undefined() {
        let ctx = view();
        assert_eq!(resolve_str("${inputs.missing:fallback}", &ctx), "fallback");
        assert_eq!(resolve_str("${inputs.name:fallback}", &ctx), "world");
    }

    #[test]
    fn resolution_is_idempotent_and_single_pass() {
        let ctx = view();
        let once = resolve_str("a=${inputs.name} b=${inputs.missing} c=${env.STAGE}", &ctx);
        let twice = resolve_str(&once, &ctx);
        assert_eq!(once, twice);
    }

    #[test]
    fn whole_token_string_keeps_value_type() {
        let ctx = view();
        let resolved = resolve_value(&serde_json::json!("${inputs.options}"), &ctx);
        assert_eq!(resolved, serde_json::json!({"verbose": true}));
        let resolved = resolve_value(&serde_json::json!("${inputs.count}"), &ctx);
        assert_eq!(resolved, serde_json::json!(3));
    }

    #[test]
    fn nested_structures_resolve_recursively() {
        let ctx = view();
        let input = serde_json::json!({
            "url": "https://api/${env.STAGE}/items",
            "nested": {"n": "${inputs.count}"},
            "list": ["${inputs.name}", "literal"],
        });
        let resolved = resolve_value(&input, &ctx);
        assert_eq!(
            resolved,
            serde_json::json!({
                "url": "https://api/prod/items",
                "nested": {"n": 3},
                "list": ["world", "literal"],
            })
        );
    }

    #[test]
    fn template_refs_reports_paths_without_defaults() {
        assert_eq!(
            template_refs("${inputs.a} and ${steps.b.outputs.c:zzz}"),
            vec!["inputs.a".to_string(), "steps.b.outputs.c".to_string()]
        );
    }

    #[test]
    fn conditions_compare_and_fall_back_to_truthiness() {
        let ctx = view();
        assert!(evaluate_condition("${env.STAGE} == prod", &ctx));
        assert!(evaluate_condition("${env.STAGE} != dev", &ctx));
        assert!(evaluate_condition("${inputs.count}", &ctx));
        assert!(!evaluate_condition("false", &ctx));
        assert!(!evaluate_condition("${inputs.missing}", &ctx));
        assert!(evaluate_condition("'prod' == \"prod\"", &ctx));
    }
}
