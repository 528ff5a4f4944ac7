// Copyright (c) 2025 Stepflow Team
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Dependency graph over workflow steps.
//!
//! Edges run from a dependency to its dependents, so descendants of a node
//! are the steps that (transitively) need it. The phase partition groups
//! steps by their depth under Kahn's algorithm; each phase is the maximum
//! set of steps that may run concurrently once all earlier phases finished.

use crate::document::StepSpec;
use crate::error::{Diagnostic, EngineError, ErrorCode, Result};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::{HashMap, HashSet, VecDeque};

/// Immutable DAG view of a workflow's steps.
#[derive(Debug, Clone)]
pub struct WorkflowDag {
    graph: DiGraph<String, ()>,
    nodes: HashMap<String, NodeIndex>,
}

impl WorkflowDag {
    /// Builds the DAG from validated steps.
    ///
    /// Expects ids to be unique and every `needs` target to exist; callers
    /// run [`crate::validate`] first. Cycles are still rejected here so a
    /// programmatically built workflow cannot smuggle one in.
    pub fn from_steps(steps: &[StepSpec]) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut nodes = HashMap::with_capacity(steps.len());
        for step in steps {
            let idx = graph.add_node(step.id.clone());
            nodes.insert(step.id.clone(), idx);
        }
        for step in steps {
            let to = nodes[&step.id];
            for dep in &step.needs {
                let from = *nodes.get(dep).ok_or_else(|| {
                    EngineError::Invalid(vec![Diagnostic::error(
                        ErrorCode::UnknownStepReference,
                        format!("workflow.steps ({})", step.id),
                        format!("unknown dependency '{dep}'"),
                    )])
                })?;
                graph.add_edge(from, to, ());
            }
        }
        if let Some(cycle) = find_cycle(steps) {
            return Err(EngineError::Invalid(vec![Diagnostic::error(
                ErrorCode::CircularDependency,
                "workflow.steps",
                format!("circular dependency: {}", cycle.join(" -> ")),
            )
            .with_context("cycle", serde_json::json!(cycle))]));
        }
        Ok(Self { graph, nodes })
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    /// Whether the DAG has no steps.
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Step ids in one valid topological order.
    pub fn execution_order(&self) -> Result<Vec<String>> {
        let order = petgraph::algo::toposort(&self.graph, None).map_err(|c| {
            EngineError::Invalid(vec![Diagnostic::error(
                ErrorCode::CircularDependency,
                "workflow.steps",
                format!("cycle involving step '{}'", self.graph[c.node_id()]),
            )])
        })?;
        Ok(order.into_iter().map(|i| self.graph[i].clone()).collect())
    }

    /// Phase partition per Kahn's algorithm.
    ///
    /// Phase 0 holds steps with no dependencies; phase `n` holds steps whose
    /// dependencies all live in phases `< n`.
    pub fn phases(&self) -> Vec<Vec<String>> {
        let mut depth: HashMap<NodeIndex, usize> = HashMap::new();
        let mut indegree: HashMap<NodeIndex, usize> = HashMap::new();
        let mut queue = VecDeque::new();
        for idx in self.graph.node_indices() {
            let d = self
                .graph
                .edges_directed(idx, Direction::Incoming)
                .count();
            indegree.insert(idx, d);
            if d == 0 {
                depth.insert(idx, 0);
                queue.push_back(idx);
            }
        }
        while let Some(idx) = queue.pop_front() {
            let next_depth = depth[&idx] + 1;
            for edge in self.graph.edges_directed(idx, Direction::Outgoing) {
                let target = edge.target();
                let entry = depth.entry(target).or_insert(0);
                *entry = (*entry).max(next_depth);
                if let Some(remaining) = indegree.get_mut(&target) {
                    *remaining -= 1;
                    if *remaining == 0 {
                        queue.push_back(target);
                    }
                }
            }
        }
        let phase_count = depth.values().copied().max().map_or(0, |d| d + 1);
        let mut phases = vec![Vec::new(); phase_count];
        // Preserve declaration order inside a phase for stable output.
        let mut indices: Vec<NodeIndex> = self.graph.node_indices().collect();
        indices.sort_by_key(|i| i.index());
        for idx in indices {
            phases[depth[&idx]].push(self.graph[idx].clone());
        }
        phases
    }

    /// Direct dependencies of a step.
    pub fn dependencies(&self, id: &str) -> Vec<String> {
        self.nodes.get(id).map_or_else(Vec::new, |&idx| {
            self.graph
                .edges_directed(idx, Direction::Incoming)
                .map(|e| self.graph[e.source()].clone())
                .collect()
        })
    }

    /// Direct dependents of a step.
    pub fn dependents(&self, id: &str) -> Vec<String> {
        self.nodes.get(id).map_or_else(Vec::new, |&idx| {
            self.graph
                .edges_directed(idx, Direction::Outgoing)
                .map(|e| self.graph[e.target()].clone())
                .collect()
        })
    }

    /// All transitive dependents of a step (BFS over outgoing edges).
    ///
    /// This is exactly the set a `skipDependent` failure strategy prunes.
    pub fn transitive_dependents(&self, id: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let Some(&start) = self.nodes.get(id) else {
            return seen;
        };
        let mut queue = VecDeque::from([start]);
        while let Some(idx) = queue.pop_front() {
            for edge in self.graph.edges_directed(idx, Direction::Outgoing) {
                let target = edge.target();
                if seen.insert(self.graph[target].clone()) {
                    queue.push_back(target);
                }
            }
        }
        seen
    }
}

/// Finds a dependency cycle via three-color DFS, returning the cycle path
/// closed on itself (e.g. `[a, b, c, a]`).
pub fn find_cycle(steps: &[StepSpec]) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    let needs: HashMap<&str, &[String]> = steps
        .iter()
        .map(|s| (s.id.as_str(), s.needs.as_slice()))
        .collect();
    let mut color: HashMap<&str, Color> =
        steps.iter().map(|s| (s.id.as_str(), Color::White)).collect();

    fn visit<'a>(
        node: &'a str,
        needs: &HashMap<&'a str, &'a [String]>,
        color: &mut HashMap<&'a str, Color>,
        stack: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        color.insert(node, Color::Gray);
        stack.push(node);
        for dep in needs.get(node).copied().unwrap_or(&[]) {
            let dep = dep.as_str();
            match color.get(dep) {
                Some(Color::Gray) => {
                    // Close the loop at the first occurrence of `dep`.
                    let start = stack.iter().position(|&n| n == dep).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        stack[start..].iter().map(|s| s.to_string()).collect();
                    cycle.push(dep.to_string());
                    return Some(cycle);
                }
                Some(Color::White) => {
                    if let Some(cycle) = visit(dep, needs, color, stack) {
                        return Some(cycle);
                    }
                }
                _ => {}
            }
        }
        stack.pop();
        color.insert(node, Color::Black);
        None
    }

    let mut stack = Vec::new();
    for step in steps {
        if color[step.id.as_str()] == Color::White {
            if let Some(cycle) = visit(step.id.as_str(), &needs, &mut color, &mut stack) {
                return Some(cycle);
            }
        }
    }
    None
}

/// Transitive dependencies (ancestors) of a step, by id.
pub fn transitive_dependencies(steps: &[StepSpec], id: &str) -> HashSet<String> {
    let needs: HashMap<&str, &[String]> = steps
        .iter()
        .map(|s| (s.id.as_str(), s.needs.as_slice()))
        .collect();
    let mut seen = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::from([id]);
    while let Some(node) = queue.pop_front() {
        for dep in needs.get(node).copied().unwrap_or(&[]) {
            if seen.insert(dep.clone()) {
                queue.push_back(dep.as_str());
            }
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str, needs: &[&str]) -> StepSpec {
        StepSpec {
            id: id.to_string(),
            uses: "noop.run".to_string(),
            name: None,
            with: HashMap::new(),
            needs: needs.iter().map(|s| s.to_string()).collect(),
            when: None,
            retry: None,
            timeout: None,
            continue_on_error: false,
            env: HashMap::new(),
            outputs: HashMap::new(),
        }
    }

    #[test]
    fn toposort_returns_every_step_once() {
        let steps = vec![
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["a"]),
            step("d", &["b", "c"]),
        ];
        let dag = WorkflowDag::from_steps(&steps).unwrap();
        let order = dag.execution_order().unwrap();
        assert_eq!(order.len(), 4);
        let pos: HashMap<&str, usize> = order
            .iter()
            .enumerate()
            .map(|(i, s)| (s.as_str(), i))
            .collect();
        assert!(pos["a"] < pos["b"]);
        assert!(pos["a"] < pos["c"]);
        assert!(pos["b"] < pos["d"]);
        assert!(pos["c"] < pos["d"]);
    }

    #[test]
    fn phases_group_by_dependency_depth() {
        let steps = vec![
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["a"]),
            step("d", &["b", "c"]),
        ];
        let dag = WorkflowDag::from_steps(&steps).unwrap();
        let phases = dag.phases();
        assert_eq!(phases.len(), 3);
        assert_eq!(phases[0], vec!["a"]);
        assert_eq!(phases[1], vec!["b", "c"]);
        assert_eq!(phases[2], vec!["d"]);
    }

    #[test]
    fn cycle_detection_returns_closed_path() {
        let steps = vec![step("a", &["c"]), step("b", &["a"]), step("c", &["b"])];
        let cycle = find_cycle(&steps).unwrap();
        assert_eq!(cycle.first(), cycle.last());
        assert_eq!(cycle.len(), 4);
        for id in ["a", "b", "c"] {
            assert!(cycle.iter().any(|s| s == id));
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let steps = vec![step("a", &["a"])];
        let cycle = find_cycle(&steps).unwrap();
        assert_eq!(cycle, vec!["a", "a"]);
    }

    #[test]
    fn transitive_dependents_match_bfs_closure() {
        let steps = vec![
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["b"]),
            step("d", &["a"]),
        ];
        let dag = WorkflowDag::from_steps(&steps).unwrap();
        let closure = dag.transitive_dependents("b");
        assert_eq!(closure, HashSet::from(["c".to_string()]));
        let closure = dag.transitive_dependents("a");
        assert_eq!(
            closure,
            HashSet::from(["b".to_string(), "c".to_string(), "d".to_string()])
        );
    }

    #[test]
    fn transitive_dependencies_are_ancestors() {
        let steps = vec![
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["b"]),
            step("d", &["a"]),
        ];
        let deps = transitive_dependencies(&steps, "c");
        assert_eq!(deps, HashSet::from(["a".to_string(), "b".to_string()]));
    }
}
