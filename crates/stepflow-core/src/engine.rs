// Copyright (c) 2025 Stepflow Team
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Top-level execution engine.
//!
//! Composes the job queue, the scheduler and the workflow executor: a pool
//! of queue workers dequeues jobs and runs one workflow executor instance
//! each, while the scheduler feeds the queue from its triggers. `start`
//! and `stop` are idempotent; stop first closes job intake, drains running
//! jobs for a grace period, and only then cancels what is still in flight.

use crate::adapter::Adapter;
use crate::cancel::CancellationToken;
use crate::document::RetrySpec;
use crate::error::Result;
use crate::events::{names, EngineEvent, EventBus};
use crate::executor::{RunOptions, WorkflowExecutor};
use crate::hooks::{Hook, HookManager};
use crate::parser::ParsedWorkflow;
use crate::policy::retry::RetryPolicy;
use crate::queue::{InMemoryJobQueue, Job, JobQueue, QueueConfig, QueueStats};
use crate::registry::AdapterRegistry;
use crate::result::{RunMetadata, RunStatus, StepResult, WorkflowResult};
use crate::scheduler::Scheduler;
use crate::step_executor::StepExecutor;
use crate::validate;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Queue worker pool size.
    pub worker_count: usize,
    /// Engine-wide cap on concurrently running steps (0 = unbounded).
    pub max_concurrent_steps: usize,
    /// Job queue configuration.
    pub queue: QueueConfig,
    /// Default step timeout when neither the step nor the workflow set one.
    pub default_step_timeout: Option<Duration>,
    /// Default retry policy when neither the step nor the workflow set one.
    pub default_retry: Option<RetrySpec>,
    /// How long `stop` waits for running jobs before cancelling them.
    pub drain_grace: Duration,
    /// Propagate hook failures instead of isolating them.
    pub fail_on_hook_error: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            max_concurrent_steps: 0,
            queue: QueueConfig::default(),
            default_step_timeout: None,
            default_retry: None,
            drain_grace: Duration::from_secs(30),
            fail_on_hook_error: false,
        }
    }
}

/// Queue/engine visible state of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    Queued,
    Running,
    Completed,
    Failed,
}

/// Tracked record of one execution request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Execution id handed back to the caller.
    pub execution_id: String,
    /// Workflow id (name@version).
    pub workflow_id: String,
    /// Current state.
    pub state: ExecutionState,
    /// Job backing this execution, for queued runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    /// Final result once the run finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<WorkflowResult>,
}

/// Aggregate engine statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStats {
    /// Whether the engine is started.
    pub running: bool,
    /// Registered workflows.
    pub workflows: usize,
    /// Registered schedules.
    pub schedules: usize,
    /// Tracked executions by state.
    pub executions: HashMap<String, usize>,
    /// Queue statistics.
    pub queue: QueueStats,
}

struct WorkerPool {
    intake: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Shared state a queue worker needs; cheap to clone into spawned tasks.
#[derive(Clone)]
struct JobRunner {
    queue: Arc<dyn JobQueue>,
    workflows: Arc<DashMap<String, Arc<ParsedWorkflow>>>,
    executions: Arc<DashMap<String, ExecutionRecord>>,
    run_tokens: Arc<DashMap<String, CancellationToken>>,
    executor: Arc<WorkflowExecutor>,
    events: Arc<EventBus>,
}

/// The execution engine.
pub struct ExecutionEngine {
    config: EngineConfig,
    registry: Arc<AdapterRegistry>,
    queue: Arc<dyn JobQueue>,
    events: Arc<EventBus>,
    hooks: Arc<HookManager>,
    scheduler: Arc<Scheduler>,
    executor: Arc<WorkflowExecutor>,
    workflows: Arc<DashMap<String, Arc<ParsedWorkflow>>>,
    executions: Arc<DashMap<String, ExecutionRecord>>,
    run_tokens: Arc<DashMap<String, CancellationToken>>,
    runner: JobRunner,
    pool: Mutex<Option<WorkerPool>>,
}

impl ExecutionEngine {
    /// Creates an engine with the in-memory reference queue.
    pub fn new(config: EngineConfig) -> Self {
        Self::with_queue(config, None)
    }

    /// Creates an engine over a caller-supplied queue implementation.
    pub fn with_queue(config: EngineConfig, queue: Option<Arc<dyn JobQueue>>) -> Self {
        let queue: Arc<dyn JobQueue> =
            queue.unwrap_or_else(|| Arc::new(InMemoryJobQueue::new(config.queue.clone())));
        let registry = Arc::new(AdapterRegistry::new());
        let events = Arc::new(EventBus::new());
        let hooks = Arc::new(HookManager::new().with_fail_on_hook_error(config.fail_on_hook_error));
        let steps = Arc::new(StepExecutor::new(
            registry.clone(),
            events.clone(),
            hooks.clone(),
            config.default_step_timeout,
            config.default_retry.as_ref().map(RetryPolicy::from),
        ));
        let executor = Arc::new(WorkflowExecutor::new(
            steps,
            events.clone(),
            hooks.clone(),
            config.max_concurrent_steps,
        ));
        let scheduler = Arc::new(Scheduler::new(queue.clone(), events.clone()));
        let workflows = Arc::new(DashMap::new());
        let executions = Arc::new(DashMap::new());
        let run_tokens = Arc::new(DashMap::new());
        let runner = JobRunner {
            queue: queue.clone(),
            workflows: workflows.clone(),
            executions: executions.clone(),
            run_tokens: run_tokens.clone(),
            executor: executor.clone(),
            events: events.clone(),
        };
        Self {
            config,
            registry,
            queue,
            events,
            hooks,
            scheduler,
            executor,
            workflows,
            executions,
            run_tokens,
            runner,
            pool: Mutex::new(None),
        }
    }

    /// Registers an adapter.
    pub fn register_adapter(&self, adapter: Arc<dyn Adapter>) -> Result<()> {
        self.registry.register(adapter)
    }

    /// Registers a lifecycle hook.
    pub fn register_hook(&self, hook: Arc<dyn Hook>) {
        self.hooks.register(hook);
    }

    /// The engine's event bus.
    pub fn event_bus(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    /// The engine's scheduler.
    pub fn scheduler(&self) -> Arc<Scheduler> {
        self.scheduler.clone()
    }

    /// Parses, validates and registers a workflow document source.
    ///
    /// Also registers schedules for the document's triggers.
    pub fn register_workflow_source(&self, source: &str) -> Result<Arc<ParsedWorkflow>> {
        let doc = validate::parse_document(source)?;
        let workflow = Arc::new(ParsedWorkflow::parse(&doc)?);
        self.register_workflow(workflow.clone())?;
        Ok(workflow)
    }

    /// Registers an already parsed workflow and its triggers.
    pub fn register_workflow(&self, workflow: Arc<ParsedWorkflow>) -> Result<()> {
        let workflow_id = format!("{}@{}", workflow.name, workflow.version);
        self.scheduler.register_workflow_triggers(&workflow)?;
        self.workflows.insert(workflow.name.clone(), workflow.clone());
        self.workflows.insert(workflow_id, workflow);
        Ok(())
    }

    fn lookup_workflow(&self, id: &str) -> Option<Arc<ParsedWorkflow>> {
        self.workflows.get(id).map(|entry| entry.value().clone())
    }

    /// Whether the worker pool is running.
    pub fn is_running(&self) -> bool {
        self.pool.lock().is_some()
    }

    /// Starts workers, scheduler loop and adapter `initialize` hooks.
    /// Idempotent.
    pub async fn start(&self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        self.registry.initialize_all().await?;

        let intake = CancellationToken::new();
        let mut handles = Vec::with_capacity(self.config.worker_count + 1);
        for worker in 0..self.config.worker_count {
            let runner = self.runner.clone();
            let token = intake.clone();
            handles.push(tokio::spawn(runner.worker_loop(worker, token)));
        }
        handles.push(tokio::spawn(
            self.scheduler.clone().run(intake.clone()),
        ));
        *self.pool.lock() = Some(WorkerPool { intake, handles });

        info!(workers = self.config.worker_count, "Engine started");
        let _ = self
            .events
            .emit(EngineEvent::new(names::ENGINE_STARTED, serde_json::json!({})))
            .await;
        Ok(())
    }

    /// Stops intake, drains running jobs up to the grace period, cancels
    /// stragglers and runs adapter `cleanup` hooks. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        let Some(pool) = self.pool.lock().take() else {
            return Ok(());
        };
        info!("Engine stopping, draining workers");
        pool.intake.cancel();

        let drain = async {
            for handle in pool.handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(self.config.drain_grace, drain)
            .await
            .is_err()
        {
            warn!("Drain grace elapsed, cancelling running executions");
            for entry in self.run_tokens.iter() {
                entry.value().cancel();
            }
        }

        self.registry.cleanup_all().await?;
        let _ = self
            .events
            .emit(EngineEvent::new(names::ENGINE_STOPPED, serde_json::json!({})))
            .await;
        info!("Engine stopped");
        Ok(())
    }

    /// Enqueues a workflow execution; returns the execution id.
    pub async fn execute_workflow(
        &self,
        workflow: Arc<ParsedWorkflow>,
        inputs: HashMap<String, serde_json::Value>,
    ) -> Result<String> {
        let workflow_id = format!("{}@{}", workflow.name, workflow.version);
        if self.lookup_workflow(&workflow_id).is_none() {
            self.register_workflow(workflow.clone())?;
        }

        let execution_id = Uuid::new_v4().to_string();
        let job = Job::workflow(
            workflow_id.clone(),
            serde_json::json!({
                "input": inputs,
                "executionId": execution_id,
                "triggeredBy": "api",
            }),
        );
        let job_id = self.queue.enqueue(job).await?;
        self.executions.insert(
            execution_id.clone(),
            ExecutionRecord {
                execution_id: execution_id.clone(),
                workflow_id,
                state: ExecutionState::Queued,
                job_id: Some(job_id.clone()),
                result: None,
            },
        );
        let _ = self
            .events
            .emit(
                EngineEvent::new(names::JOB_ENQUEUED, serde_json::json!({ "jobId": job_id }))
                    .for_run(execution_id.as_str()),
            )
            .await;
        Ok(execution_id)
    }

    /// Runs a workflow immediately, bypassing the queue.
    pub async fn execute_workflow_immediate(
        &self,
        workflow: &ParsedWorkflow,
        options: RunOptions,
    ) -> WorkflowResult {
        let execution_id = options
            .execution_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let cancel = options.cancel.clone().unwrap_or_default();
        self.run_tokens.insert(execution_id.clone(), cancel.clone());
        self.executions.insert(
            execution_id.clone(),
            ExecutionRecord {
                execution_id: execution_id.clone(),
                workflow_id: format!("{}@{}", workflow.name, workflow.version),
                state: ExecutionState::Running,
                job_id: None,
                result: None,
            },
        );

        let result = self
            .executor
            .execute(
                workflow,
                RunOptions {
                    execution_id: Some(execution_id.clone()),
                    cancel: Some(cancel),
                    ..options
                },
            )
            .await;

        self.run_tokens.remove(&execution_id);
        if let Some(mut record) = self.executions.get_mut(&execution_id) {
            record.state = if result.succeeded() {
                ExecutionState::Completed
            } else {
                ExecutionState::Failed
            };
            record.result = Some(result.clone());
        }
        result
    }

    /// Validates and plans a run without executing anything.
    ///
    /// Every step is reported as skipped; the planner also resolves which
    /// adapter each step would use.
    pub fn dry_run(&self, workflow: &ParsedWorkflow) -> WorkflowResult {
        let now = Utc::now();
        let mut step_results = HashMap::new();
        let mut adapters: HashMap<String, String> = HashMap::new();
        for step in &workflow.steps {
            step_results.insert(
                step.id.clone(),
                StepResult::skipped(&step.id, "dry run"),
            );
            let adapter = self
                .registry
                .resolve(&step.action)
                .map(|a| a.name().to_string())
                .unwrap_or_else(|_| format!("<unresolved: {}>", step.namespace));
            adapters.insert(step.id.clone(), adapter);
        }
        let total = workflow.steps.len();
        WorkflowResult {
            workflow_name: workflow.name.clone(),
            execution_id: Uuid::new_v4().to_string(),
            status: RunStatus::Success,
            step_results,
            outputs: HashMap::from([(
                "plan".to_string(),
                serde_json::json!({
                    "phases": workflow.phases(),
                    "adapters": adapters,
                }),
            )]),
            duration: Duration::ZERO,
            started_at: now,
            completed_at: now,
            metadata: RunMetadata {
                total_steps: total,
                successful_steps: 0,
                failed_steps: 0,
                skipped_steps: total,
                phases: workflow.phases().len(),
            },
            error: None,
        }
    }

    /// Status of a tracked execution.
    pub fn get_execution_status(&self, execution_id: &str) -> Option<ExecutionRecord> {
        self.executions
            .get(execution_id)
            .map(|entry| entry.value().clone())
    }

    /// All tracked executions.
    pub fn list_executions(&self) -> Vec<ExecutionRecord> {
        self.executions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Aggregate statistics.
    pub async fn stats(&self) -> EngineStats {
        let mut executions: HashMap<String, usize> = HashMap::new();
        for entry in self.executions.iter() {
            let key = serde_json::to_value(entry.value().state)
                .ok()
                .and_then(|v| v.as_str().map(str::to_owned))
                .unwrap_or_else(|| format!("{:?}", entry.value().state));
            *executions.entry(key).or_insert(0) += 1;
        }
        EngineStats {
            running: self.is_running(),
            workflows: self.workflows.len(),
            schedules: self.scheduler.list().len(),
            executions,
            queue: self.queue.stats().await,
        }
    }
}

impl JobRunner {
    fn lookup_workflow(&self, id: &str) -> Option<Arc<ParsedWorkflow>> {
        self.workflows.get(id).map(|entry| entry.value().clone())
    }

    async fn worker_loop(self, worker: usize, intake: CancellationToken) {
        debug!(worker, "Queue worker started");
        loop {
            if intake.is_cancelled() {
                break;
            }
            match self.queue.dequeue().await {
                Some(job) => {
                    let _ = self
                        .events
                        .emit(
                            EngineEvent::new(
                                names::JOB_DEQUEUED,
                                serde_json::json!({ "jobId": job.id, "worker": worker }),
                            )
                            .for_workflow(job.workflow_id.as_str()),
                        )
                        .await;
                    self.process_job(job).await;
                }
                None => {
                    tokio::select! {
                        _ = self.queue.wait_for_work() => {}
                        _ = intake.cancelled() => break,
                    }
                }
            }
        }
        debug!(worker, "Queue worker stopped");
    }

    async fn process_job(&self, job: Job) {
        let Some(workflow) = self.lookup_workflow(&job.workflow_id) else {
            warn!(job_id = %job.id, workflow = %job.workflow_id, "Job references unknown workflow");
            let _ = self
                .queue
                .mark_failed(
                    &job.id,
                    format!("workflow '{}' is not registered", job.workflow_id),
                )
                .await;
            return;
        };

        let inputs: HashMap<String, serde_json::Value> = job
            .payload
            .get("input")
            .and_then(|v| v.as_object())
            .map(|map| map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        let execution_id = job
            .payload
            .get("executionId")
            .and_then(|v| v.as_str())
            .map(str::to_owned)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let triggered_by = job
            .payload
            .get("triggeredBy")
            .and_then(|v| v.as_str())
            .unwrap_or("queue")
            .to_string();

        let cancel = CancellationToken::new();
        self.run_tokens.insert(execution_id.clone(), cancel.clone());
        if let Some(mut record) = self.executions.get_mut(&execution_id) {
            record.state = ExecutionState::Running;
        } else {
            self.executions.insert(
                execution_id.clone(),
                ExecutionRecord {
                    execution_id: execution_id.clone(),
                    workflow_id: job.workflow_id.clone(),
                    state: ExecutionState::Running,
                    job_id: Some(job.id.clone()),
                    result: None,
                },
            );
        }

        let timeout = job.timeout_ms.map(Duration::from_millis);
        let result = self
            .executor
            .execute(
                &workflow,
                RunOptions {
                    inputs,
                    triggered_by: Some(triggered_by),
                    timeout,
                    cancel: Some(cancel),
                    execution_id: Some(execution_id.clone()),
                    ..RunOptions::default()
                },
            )
            .await;

        self.run_tokens.remove(&execution_id);
        let succeeded = result.succeeded();
        if let Some(mut record) = self.executions.get_mut(&execution_id) {
            record.state = if succeeded {
                ExecutionState::Completed
            } else {
                ExecutionState::Failed
            };
            record.result = Some(result.clone());
        }

        let queue_result = if succeeded {
            self.queue
                .mark_completed(&job.id, serde_json::to_value(&result).unwrap_or_default())
                .await
        } else {
            self.queue
                .mark_failed(
                    &job.id,
                    result
                        .error
                        .clone()
                        .unwrap_or_else(|| format!("run ended with status {:?}", result.status)),
                )
                .await
        };
        if let Err(err) = queue_result {
            warn!(job_id = %job.id, error = %err, "Failed to update job status");
        }
    }
}

/// Convenience: parse + validate + immediately run a document in a fresh
/// single-shot engine. Used by tests and simple embedders.
pub async fn run_document(
    source: &str,
    adapters: Vec<Arc<dyn Adapter>>,
    options: RunOptions,
) -> Result<WorkflowResult> {
    let engine = Arc::new(ExecutionEngine::new(EngineConfig::default()));
    for adapter in adapters {
        engine.register_adapter(adapter)?;
    }
    let doc = validate::parse_document(source)?;
    let workflow = ParsedWorkflow::parse(&doc)?;
    Ok(engine.execute_workflow_immediate(&workflow, options).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterContext, AdapterResult};
    use async_trait::async_trait;

    struct InstantAdapter;

    #[async_trait]
    impl Adapter for InstantAdapter {
        fn name(&self) -> &str {
            "mock"
        }

        fn supported_actions(&self) -> Vec<String> {
            vec!["mock.*".to_string()]
        }

        async fn execute(
            &self,
            _action: &str,
            input: serde_json::Value,
            _ctx: AdapterContext,
        ) -> Result<AdapterResult> {
            Ok(AdapterResult::ok(serde_json::json!({ "echo": input })))
        }
    }

    const DOC: &str = r#"
version: "1.0"
metadata: { name: pipeline }
workflow:
  steps:
    - { id: a, uses: mock.one }
    - { id: b, uses: mock.two, needs: [a] }
"#;

    fn engine() -> Arc<ExecutionEngine> {
        let engine = Arc::new(ExecutionEngine::new(EngineConfig {
            worker_count: 2,
            ..EngineConfig::default()
        }));
        engine.register_adapter(Arc::new(InstantAdapter)).unwrap();
        engine
    }

    #[tokio::test]
    async fn immediate_execution_returns_result() {
        let engine = engine();
        let workflow = engine.register_workflow_source(DOC).unwrap();
        let result = engine
            .execute_workflow_immediate(&workflow, RunOptions::default())
            .await;
        assert_eq!(result.status, RunStatus::Success);
        assert_eq!(result.metadata.successful_steps, 2);

        let record = engine.get_execution_status(&result.execution_id).unwrap();
        assert_eq!(record.state, ExecutionState::Completed);
    }

    #[tokio::test]
    async fn queued_execution_completes_via_workers() {
        let engine = engine();
        let workflow = engine.register_workflow_source(DOC).unwrap();
        engine.start().await.unwrap();

        let execution_id = engine
            .execute_workflow(workflow, HashMap::new())
            .await
            .unwrap();

        // Poll until the worker finishes the run.
        let mut state = ExecutionState::Queued;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if let Some(record) = engine.get_execution_status(&execution_id) {
                state = record.state;
                if state == ExecutionState::Completed {
                    break;
                }
            }
        }
        assert_eq!(state, ExecutionState::Completed);
        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let engine = engine();
        engine.start().await.unwrap();
        engine.start().await.unwrap();
        assert!(engine.is_running());
        engine.stop().await.unwrap();
        engine.stop().await.unwrap();
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn dry_run_marks_all_steps_skipped() {
        let engine = engine();
        let workflow = engine.register_workflow_source(DOC).unwrap();
        let result = engine.dry_run(&workflow);

        assert_eq!(result.status, RunStatus::Success);
        assert_eq!(result.metadata.skipped_steps, 2);
        assert!(result
            .step_results
            .values()
            .all(|r| r.error.as_deref() == Some("dry run")));
        let plan = &result.outputs["plan"];
        assert_eq!(plan["adapters"]["a"], "mock");
    }

    #[tokio::test]
    async fn stats_expose_queue_and_workflows() {
        let engine = engine();
        let workflow = engine.register_workflow_source(DOC).unwrap();
        let _ = engine
            .execute_workflow_immediate(&workflow, RunOptions::default())
            .await;
        let stats = engine.stats().await;
        assert!(!stats.running);
        assert!(stats.workflows >= 1);
        assert_eq!(stats.executions.get("completed"), Some(&1));
    }
}
