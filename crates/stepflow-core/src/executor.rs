// Copyright (c) 2025 Stepflow Team
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Whole-run orchestration.
//!
//! The executor walks the step DAG with a ready-set scheduler: every step
//! whose dependencies are satisfied is started, up to the per-workflow and
//! engine-wide concurrency caps, and the loop suspends on whichever running
//! step finishes next. Failures consult the failure strategy, which may
//! prune dependents, abort the run, or let it continue; aborts and the
//! workflow-level timeout cancel in-flight steps through the run's shared
//! cancellation token.

use crate::cancel::CancellationToken;
use crate::context::{ContextStore, RunInfo};
use crate::events::{names, EngineEvent, EventBus};
use crate::hooks::HookManager;
use crate::parser::ParsedWorkflow;
use crate::policy::failure::{FailureStrategy, ForcedStatus};
use crate::resolve::resolve_projections;
use crate::result::{RunMetadata, RunStatus, StepResult, StepStatus, WorkflowResult};
use crate::step_executor::StepExecutor;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Options for one workflow run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Input overrides merged over the document's declared inputs.
    pub inputs: HashMap<String, serde_json::Value>,
    /// Environment entries for the run.
    pub env: HashMap<String, String>,
    /// Resolved secrets for the run.
    pub secrets: HashMap<String, String>,
    /// What caused the run; defaults to `manual`.
    pub triggered_by: Option<String>,
    /// Workflow-level timeout.
    pub timeout: Option<Duration>,
    /// External cancellation token; a fresh one is minted when absent.
    pub cancel: Option<CancellationToken>,
    /// Pre-minted execution id (the engine assigns one at enqueue time).
    pub execution_id: Option<String>,
}

/// Orchestrates runs of parsed workflows.
pub struct WorkflowExecutor {
    steps: Arc<StepExecutor>,
    events: Arc<EventBus>,
    hooks: Arc<HookManager>,
    /// Engine-wide cap on concurrently running steps (0 = unbounded).
    max_concurrent_steps: usize,
}

impl WorkflowExecutor {
    /// Creates an executor.
    pub fn new(
        steps: Arc<StepExecutor>,
        events: Arc<EventBus>,
        hooks: Arc<HookManager>,
        max_concurrent_steps: usize,
    ) -> Self {
        Self {
            steps,
            events,
            hooks,
            max_concurrent_steps,
        }
    }

    async fn emit(&self, event: EngineEvent) {
        let _ = self.events.emit(event).await;
    }

    fn concurrency_limit(&self, workflow: &ParsedWorkflow) -> usize {
        let per_workflow = workflow.concurrency.unwrap_or(0);
        match (per_workflow, self.max_concurrent_steps) {
            (0, 0) => usize::MAX,
            (0, engine) => engine,
            (wf, 0) => wf,
            (wf, engine) => wf.min(engine),
        }
    }

    /// Runs a workflow to completion and returns its result.
    pub async fn execute(&self, workflow: &ParsedWorkflow, options: RunOptions) -> WorkflowResult {
        let triggered_by = options.triggered_by.as_deref().unwrap_or("manual");
        let mut run = RunInfo::new(&workflow.name, &workflow.version, triggered_by);
        if let Some(execution_id) = &options.execution_id {
            run.execution_id = execution_id.clone();
        }
        let cancel = options.cancel.clone().unwrap_or_default();

        let mut inputs = workflow.inputs.clone();
        inputs.extend(options.inputs.clone());
        let store = Arc::new(ContextStore::new(
            run.clone(),
            options.env.clone(),
            inputs,
            options.secrets.clone(),
            workflow.context.clone(),
        ));

        info!(
            workflow = %workflow.name,
            execution_id = %run.execution_id,
            steps = workflow.steps.len(),
            "Starting workflow run"
        );
        self.emit(
            EngineEvent::new(
                names::WORKFLOW_STARTED,
                serde_json::json!({
                    "workflow": workflow.name,
                    "version": workflow.version,
                    "triggeredBy": triggered_by,
                }),
            )
            .for_workflow(run.workflow_id.as_str())
            .for_run(run.execution_id.as_str()),
        )
        .await;
        let _ = self.hooks.before_workflow(&run).await;

        let started = Instant::now();
        let started_at = Utc::now();
        let outcome = self
            .run_steps(workflow, &store, &cancel, options.timeout)
            .await;

        // Workflow outputs are computed against the final context.
        let outputs = resolve_projections(&workflow.outputs, &store.view());

        let successful = outcome
            .results
            .values()
            .filter(|r| r.status == StepStatus::Success)
            .count();
        let failed = outcome
            .results
            .values()
            .filter(|r| r.status == StepStatus::Failed)
            .count();
        let skipped = outcome
            .results
            .values()
            .filter(|r| r.status == StepStatus::Skipped)
            .count();
        let total = workflow.steps.len();

        let status = final_status(&outcome, successful, failed, total, &outcome.strategy);
        let result = WorkflowResult {
            workflow_name: workflow.name.clone(),
            execution_id: run.execution_id.clone(),
            status,
            step_results: outcome.results,
            outputs,
            duration: started.elapsed(),
            started_at,
            completed_at: Utc::now(),
            metadata: RunMetadata {
                total_steps: total,
                successful_steps: successful,
                failed_steps: failed,
                skipped_steps: skipped,
                phases: workflow.phases().len(),
            },
            error: outcome.first_error,
        };

        let event_name = match result.status {
            RunStatus::Success | RunStatus::Partial => names::WORKFLOW_COMPLETED,
            RunStatus::Cancelled => names::WORKFLOW_CANCELLED,
            _ => names::WORKFLOW_FAILED,
        };
        self.emit(
            EngineEvent::new(
                event_name,
                serde_json::json!({
                    "status": result.status,
                    "durationMs": result.duration.as_millis() as u64,
                    "metadata": result.metadata,
                }),
            )
            .for_workflow(run.workflow_id.as_str())
            .for_run(run.execution_id.as_str()),
        )
        .await;
        if let Some(error) = &result.error {
            let _ = self.hooks.on_error(&run, error).await;
        }
        let _ = self.hooks.after_workflow(&run, &result).await;

        info!(
            workflow = %workflow.name,
            execution_id = %run.execution_id,
            status = ?result.status,
            duration_ms = result.duration.as_millis() as u64,
            "Workflow run finished"
        );
        result
    }

    async fn run_steps(
        &self,
        workflow: &ParsedWorkflow,
        store: &Arc<ContextStore>,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> RunOutcome {
        let strategy = FailureStrategy::new(workflow.failure.clone());
        let limit = self.concurrency_limit(workflow);
        let order = workflow
            .dag
            .execution_order()
            .unwrap_or_else(|_| workflow.steps.iter().map(|s| s.id.clone()).collect());

        let mut outcome = RunOutcome::new(strategy);
        let mut pending: Vec<String> = order;
        let mut satisfied: HashSet<String> = HashSet::new();
        let mut running: JoinSet<StepResult> = JoinSet::new();
        let mut in_flight = 0usize;
        let mut failures = 0usize;
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            if !outcome.aborted && !outcome.timed_out {
                self.prune_doomed(workflow, &mut pending, &satisfied, &mut outcome)
                    .await;
                let ready: Vec<String> = pending
                    .iter()
                    .filter(|id| {
                        workflow.step(id).map_or(false, |step| {
                            step.needs.iter().all(|dep| satisfied.contains(dep))
                        })
                    })
                    .cloned()
                    .collect();
                for id in ready {
                    if in_flight >= limit {
                        break;
                    }
                    let Some(step) = workflow.step(&id) else {
                        continue;
                    };
                    pending.retain(|p| p != &id);
                    let step = step.clone();
                    let store = store.clone();
                    let executor = self.steps.clone();
                    let token = cancel.clone();
                    debug!(step_id = %id, "Starting step");
                    running.spawn(async move { executor.execute(&step, &store, &token).await });
                    in_flight += 1;
                }
            }

            if in_flight == 0 {
                break;
            }

            let joined = match deadline {
                Some(deadline) if !outcome.timed_out => {
                    tokio::select! {
                        joined = running.join_next() => joined,
                        _ = tokio::time::sleep_until(deadline) => {
                            warn!(workflow = %workflow.name, "Workflow timeout fired, cancelling run");
                            outcome.timed_out = true;
                            outcome.first_error.get_or_insert_with(|| {
                                format!("workflow '{}' timed out", workflow.name)
                            });
                            cancel.cancel();
                            continue;
                        }
                    }
                }
                _ => running.join_next().await,
            };

            let Some(joined) = joined else {
                break;
            };
            in_flight -= 1;
            let result = match joined {
                Ok(result) => result,
                Err(join_err) => {
                    warn!(error = %join_err, "Step task aborted");
                    continue;
                }
            };
            let continue_on_error = workflow
                .step(&result.step_id)
                .map_or(false, |s| s.continue_on_error);
            let step_id = result.step_id.clone();
            let step_failed = result.status == StepStatus::Failed;
            let fatal = step_failed && !continue_on_error;
            if result.status == StepStatus::Success || (step_failed && continue_on_error) {
                satisfied.insert(step_id.clone());
            }
            if step_failed {
                outcome
                    .first_error
                    .get_or_insert_with(|| result.error.clone().unwrap_or_default());
            }
            outcome.results.insert(step_id.clone(), result);

            if fatal && !outcome.aborted && !outcome.timed_out {
                failures += 1;
                // Completed means success or failure-with-continue, which is
                // exactly what `satisfied` tracks.
                let decision = outcome
                    .strategy
                    .decide(&step_id, satisfied.len(), failures);
                if decision.skip_dependents {
                    self.skip_dependents(workflow, &step_id, &mut pending, &mut outcome)
                        .await;
                }
                if !decision.continue_run {
                    info!(
                        step_id = %step_id,
                        "Failure strategy aborts the run"
                    );
                    outcome.aborted = true;
                    outcome.forced = decision.forced_status;
                    cancel.cancel();
                }
            }
        }

        // Anything never started is skipped.
        let reason = if outcome.timed_out {
            "workflow timed out"
        } else if outcome.aborted {
            "workflow aborted"
        } else {
            "not reachable"
        };
        for id in pending {
            if !outcome.results.contains_key(&id) {
                self.record_skip(workflow, &id, reason, &mut outcome).await;
            }
        }
        outcome.cancelled = cancel.is_cancelled() && !outcome.timed_out && !outcome.aborted;
        outcome
    }

    /// Skips pending steps whose dependencies can no longer be satisfied.
    async fn prune_doomed(
        &self,
        workflow: &ParsedWorkflow,
        pending: &mut Vec<String>,
        satisfied: &HashSet<String>,
        outcome: &mut RunOutcome,
    ) {
        loop {
            let doomed: Option<(String, String)> = pending.iter().find_map(|id| {
                let step = workflow.step(id)?;
                step.needs.iter().find_map(|dep| {
                    if satisfied.contains(dep) {
                        return None;
                    }
                    match outcome.results.get(dep).map(|r| r.status) {
                        Some(StepStatus::Failed) => {
                            Some((id.clone(), format!("dependency {dep} failed")))
                        }
                        Some(StepStatus::Skipped) => {
                            Some((id.clone(), format!("dependency {dep} skipped")))
                        }
                        _ => None,
                    }
                })
            });
            let Some((id, reason)) = doomed else { break };
            pending.retain(|p| p != &id);
            self.record_skip(workflow, &id, &reason, outcome).await;
        }
    }

    async fn skip_dependents(
        &self,
        workflow: &ParsedWorkflow,
        failed_id: &str,
        pending: &mut Vec<String>,
        outcome: &mut RunOutcome,
    ) {
        let closure = workflow.dag.transitive_dependents(failed_id);
        for id in &closure {
            if pending.iter().any(|p| p == id) {
                pending.retain(|p| p != id);
                self.record_skip(
                    workflow,
                    id,
                    &format!("dependency {failed_id} failed"),
                    outcome,
                )
                .await;
            }
        }
    }

    async fn record_skip(
        &self,
        workflow: &ParsedWorkflow,
        step_id: &str,
        reason: &str,
        outcome: &mut RunOutcome,
    ) {
        debug!(step_id = %step_id, reason = %reason, "Skipping step");
        outcome
            .results
            .insert(step_id.to_string(), StepResult::skipped(step_id, reason));
        self.emit(
            EngineEvent::new(names::STEP_SKIPPED, serde_json::json!({ "reason": reason }))
                .for_workflow(format!("{}@{}", workflow.name, workflow.version))
                .for_step(step_id),
        )
        .await;
    }
}

struct RunOutcome {
    results: HashMap<String, StepResult>,
    strategy: FailureStrategy,
    first_error: Option<String>,
    aborted: bool,
    timed_out: bool,
    cancelled: bool,
    forced: Option<ForcedStatus>,
}

impl RunOutcome {
    fn new(strategy: FailureStrategy) -> Self {
        Self {
            results: HashMap::new(),
            strategy,
            first_error: None,
            aborted: false,
            timed_out: false,
            cancelled: false,
            forced: None,
        }
    }
}

/// Applies the final status rules of a finished run.
fn final_status(
    outcome: &RunOutcome,
    successful: usize,
    failed: usize,
    total: usize,
    strategy: &FailureStrategy,
) -> RunStatus {
    if outcome.timed_out {
        return RunStatus::Timeout;
    }
    if outcome.cancelled {
        return RunStatus::Cancelled;
    }
    if let Some(forced) = outcome.forced {
        return match forced {
            ForcedStatus::Failed => RunStatus::Failed,
            ForcedStatus::Partial => RunStatus::Partial,
        };
    }
    if failed == 0 {
        return RunStatus::Success;
    }
    if successful == 0 {
        return RunStatus::Failed;
    }
    let completed_ratio = successful as f64 / total as f64;
    let failed_ratio = failed as f64 / total as f64;
    if strategy.allow_partial_success() && completed_ratio >= 0.5 && failed_ratio < 0.5 {
        RunStatus::Partial
    } else {
        RunStatus::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{Adapter, AdapterContext, AdapterResult};
    use crate::document::{FailureKind, FailureSpec};
    use crate::registry::AdapterRegistry;
    use crate::validate::parse_document;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct ScriptedAdapter {
        /// Step actions that fail (by last action segment).
        failing: Vec<String>,
        /// Observed execution order.
        log: Arc<Mutex<Vec<String>>>,
        delay: Duration,
    }

    #[async_trait]
    impl Adapter for ScriptedAdapter {
        fn name(&self) -> &str {
            "mock"
        }

        fn supported_actions(&self) -> Vec<String> {
            vec!["mock.*".to_string()]
        }

        async fn execute(
            &self,
            action: &str,
            _input: serde_json::Value,
            _ctx: AdapterContext,
        ) -> crate::error::Result<AdapterResult> {
            tokio::time::sleep(self.delay).await;
            let op = action.rsplit('.').next().unwrap_or(action).to_string();
            self.log.lock().unwrap().push(op.clone());
            if self.failing.contains(&op) {
                Ok(AdapterResult::failed(format!("scripted failure of {op}")))
            } else {
                Ok(AdapterResult::ok(serde_json::json!({ "ok": true, "op": op })))
            }
        }
    }

    fn harness(failing: &[&str]) -> (WorkflowExecutor, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = Arc::new(AdapterRegistry::new());
        registry
            .register(Arc::new(ScriptedAdapter {
                failing: failing.iter().map(|s| s.to_string()).collect(),
                log: log.clone(),
                delay: Duration::from_millis(10),
            }))
            .unwrap();
        let events = Arc::new(EventBus::new());
        let hooks = Arc::new(HookManager::new());
        let steps = Arc::new(StepExecutor::new(
            registry,
            events.clone(),
            hooks.clone(),
            None,
            None,
        ));
        (WorkflowExecutor::new(steps, events, hooks, 0), log)
    }

    fn parse(yaml: &str) -> ParsedWorkflow {
        ParsedWorkflow::parse(&parse_document(yaml).unwrap()).unwrap()
    }

    const DIAMOND: &str = r#"
version: "1.0"
metadata: { name: diamond }
workflow:
  steps:
    - { id: a, uses: mock.a }
    - { id: b, uses: mock.b, needs: [a] }
    - { id: c, uses: mock.c, needs: [a] }
    - { id: d, uses: mock.d, needs: [b, c] }
"#;

    #[tokio::test(start_paused = true)]
    async fn happy_path_respects_dependency_order() {
        let (executor, log) = harness(&[]);
        let workflow = parse(DIAMOND);
        let result = executor.execute(&workflow, RunOptions::default()).await;

        assert_eq!(result.status, RunStatus::Success);
        assert_eq!(result.metadata.successful_steps, 4);
        assert_eq!(result.metadata.phases, 3);

        let order = log.lock().unwrap().clone();
        let pos = |op: &str| order.iter().position(|o| o == op).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("a") < pos("c"));
        assert!(pos("d") > pos("b"));
        assert!(pos("d") > pos("c"));
    }

    #[tokio::test(start_paused = true)]
    async fn dependency_failure_skips_downstream_steps() {
        let (executor, _) = harness(&["b"]);
        let workflow = parse(DIAMOND);
        let result = executor.execute(&workflow, RunOptions::default()).await;

        assert_eq!(result.step_results["a"].status, StepStatus::Success);
        assert_eq!(result.step_results["b"].status, StepStatus::Failed);
        assert_eq!(result.step_results["d"].status, StepStatus::Skipped);
        assert!(result.step_results["d"]
            .error
            .as_ref()
            .unwrap()
            .contains("dependency"));
    }

    #[tokio::test(start_paused = true)]
    async fn skip_dependent_strategy_yields_partial_run() {
        let (executor, _) = harness(&["b"]);
        let yaml = r#"
version: "1.0"
metadata: { name: fanout }
policies:
  failure: { type: skipDependent, allowPartialSuccess: true }
workflow:
  steps:
    - { id: a, uses: mock.a }
    - { id: b, uses: mock.b, needs: [a] }
    - { id: c, uses: mock.c, needs: [b] }
    - { id: d, uses: mock.d, needs: [a] }
"#;
        let workflow = parse(yaml);
        let result = executor.execute(&workflow, RunOptions::default()).await;

        assert_eq!(result.step_results["a"].status, StepStatus::Success);
        assert_eq!(result.step_results["b"].status, StepStatus::Failed);
        assert_eq!(result.step_results["c"].status, StepStatus::Skipped);
        assert_eq!(
            result.step_results["c"].error.as_deref(),
            Some("dependency b failed")
        );
        assert_eq!(result.step_results["d"].status, StepStatus::Success);
        assert_eq!(result.status, RunStatus::Partial);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_strategy_cancels_remaining_steps() {
        let (executor, log) = harness(&["a"]);
        let yaml = r#"
version: "1.0"
metadata: { name: chain }
policies:
  failure: { type: abort }
workflow:
  steps:
    - { id: a, uses: mock.a }
    - { id: b, uses: mock.b, needs: [a] }
    - { id: c, uses: mock.c, needs: [b] }
"#;
        let workflow = parse(yaml);
        let result = executor.execute(&workflow, RunOptions::default()).await;

        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.metadata.skipped_steps, 2);
        // Only the failing step ever reached the adapter.
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn continue_on_error_satisfies_dependents() {
        let (executor, _) = harness(&["a"]);
        let yaml = r#"
version: "1.0"
metadata: { name: ignore }
policies:
  failure: { type: continue, allowPartialSuccess: true }
workflow:
  steps:
    - { id: a, uses: mock.a, continueOnError: true }
    - { id: b, uses: mock.b, needs: [a] }
    - { id: c, uses: mock.c, needs: [a] }
"#;
        let workflow = parse(yaml);
        let result = executor.execute(&workflow, RunOptions::default()).await;

        assert_eq!(result.step_results["a"].status, StepStatus::Failed);
        assert_eq!(result.step_results["b"].status, StepStatus::Success);
        assert_eq!(result.step_results["c"].status, StepStatus::Success);
        // 2 of 3 succeeded and under half failed: partial.
        assert_eq!(result.status, RunStatus::Partial);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_budget_counts_continue_on_error_steps_as_completed() {
        let (executor, _) = harness(&["a", "b"]);
        let yaml = r#"
version: "1.0"
metadata: { name: budget }
policies:
  failure: { type: continue, allowPartialSuccess: true, maxFailures: 0 }
workflow:
  steps:
    - { id: a, uses: mock.a, continueOnError: true }
    - { id: b, uses: mock.b, needs: [a] }
"#;
        let workflow = parse(yaml);
        let result = executor.execute(&workflow, RunOptions::default()).await;

        assert_eq!(result.step_results["a"].status, StepStatus::Failed);
        assert_eq!(result.step_results["b"].status, StepStatus::Failed);
        // a completed in the continue-on-error sense, so the exhausted
        // failure budget still ends the run as partial.
        assert_eq!(result.status, RunStatus::Partial);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_budget_without_completions_forces_failed() {
        let (executor, _) = harness(&["a"]);
        let yaml = r#"
version: "1.0"
metadata: { name: budget }
policies:
  failure: { type: continue, allowPartialSuccess: true, maxFailures: 0 }
workflow:
  steps:
    - { id: a, uses: mock.a }
    - { id: b, uses: mock.b, needs: [a] }
"#;
        let workflow = parse(yaml);
        let result = executor.execute(&workflow, RunOptions::default()).await;

        assert_eq!(result.step_results["a"].status, StepStatus::Failed);
        assert_eq!(result.step_results["b"].status, StepStatus::Skipped);
        assert_eq!(result.status, RunStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_within_budget_keeps_running() {
        let (executor, _) = harness(&["a"]);
        let yaml = r#"
version: "1.0"
metadata: { name: budget }
policies:
  failure: { type: continue, allowPartialSuccess: true, maxFailures: 1 }
workflow:
  steps:
    - { id: a, uses: mock.a }
    - { id: b, uses: mock.b }
    - { id: c, uses: mock.c }
"#;
        let workflow = parse(yaml);
        let result = executor.execute(&workflow, RunOptions::default()).await;

        assert_eq!(result.step_results["a"].status, StepStatus::Failed);
        assert_eq!(result.step_results["b"].status, StepStatus::Success);
        assert_eq!(result.step_results["c"].status, StepStatus::Success);
        assert_eq!(result.status, RunStatus::Partial);
    }

    #[tokio::test(start_paused = true)]
    async fn workflow_timeout_cancels_and_reports() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = Arc::new(AdapterRegistry::new());
        registry
            .register(Arc::new(ScriptedAdapter {
                failing: Vec::new(),
                log: log.clone(),
                delay: Duration::from_secs(3600),
            }))
            .unwrap();
        let events = Arc::new(EventBus::new());
        let hooks = Arc::new(HookManager::new());
        let steps = Arc::new(StepExecutor::new(
            registry,
            events.clone(),
            hooks.clone(),
            None,
            None,
        ));
        let executor = WorkflowExecutor::new(steps, events, hooks, 0);

        let workflow = parse(
            r#"
version: "1.0"
metadata: { name: slowpoke }
workflow:
  steps:
    - { id: a, uses: mock.a }
"#,
        );
        let result = executor
            .execute(
                &workflow,
                RunOptions {
                    timeout: Some(Duration::from_millis(50)),
                    ..RunOptions::default()
                },
            )
            .await;

        assert_eq!(result.status, RunStatus::Timeout);
        assert!(result.error.as_ref().unwrap().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_cap_limits_parallelism() {
        let (executor, _) = harness(&[]);
        let yaml = r#"
version: "1.0"
metadata: { name: capped }
policies: { concurrency: 1 }
workflow:
  steps:
    - { id: a, uses: mock.a }
    - { id: b, uses: mock.b }
    - { id: c, uses: mock.c }
"#;
        let workflow = parse(yaml);
        let result = executor.execute(&workflow, RunOptions::default()).await;
        assert_eq!(result.status, RunStatus::Success);
        assert_eq!(result.metadata.successful_steps, 3);
    }

    #[test]
    fn final_status_applies_partial_threshold() {
        let strategy = FailureStrategy::new(FailureSpec {
            kind: FailureKind::Continue,
            allow_partial_success: true,
            ..FailureSpec::default()
        });
        let outcome = RunOutcome::new(strategy.clone());

        // 3 of 4 succeeded, 1 failed: partial.
        assert_eq!(
            final_status(&outcome, 3, 1, 4, &outcome.strategy),
            RunStatus::Partial
        );
        // Half failed: not partial.
        assert_eq!(
            final_status(&outcome, 2, 2, 4, &outcome.strategy),
            RunStatus::Failed
        );
        // No failures: success.
        assert_eq!(
            final_status(&outcome, 4, 0, 4, &outcome.strategy),
            RunStatus::Success
        );
        // Nothing succeeded: failed.
        assert_eq!(
            final_status(&outcome, 0, 4, 4, &outcome.strategy),
            RunStatus::Failed
        );
    }
}
