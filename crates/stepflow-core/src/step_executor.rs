// Copyright (c) 2025 Stepflow Team
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Single-step execution pipeline.
//!
//! Order per step: evaluate `when`, resolve templates in `with` and `env`,
//! resolve the adapter, then run the adapter call under the step's timeout
//! and retry policy. Output projections are computed against the adapter
//! output merged into the context under `steps.<id>`. The workflow
//! executor guarantees a step is never started twice concurrently within
//! one run.

use crate::adapter::AdapterContext;
use crate::cancel::CancellationToken;
use crate::context::ContextStore;
use crate::error::EngineError;
use crate::events::{names, EngineEvent, EventBus};
use crate::hooks::HookManager;
use crate::parser::ParsedStep;
use crate::policy::retry::RetryPolicy;
use crate::policy::timeout::run_with_timeout;
use crate::registry::AdapterRegistry;
use crate::resolve::{evaluate_condition, resolve_projections, resolve_string_map, resolve_value};
use crate::result::{StepResult, StepStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Executes individual steps against the adapter registry.
pub struct StepExecutor {
    registry: Arc<AdapterRegistry>,
    events: Arc<EventBus>,
    hooks: Arc<HookManager>,
    /// Engine-level default timeout; a workflow's own default wins.
    default_timeout: Option<Duration>,
    /// Engine-level default retry policy.
    default_retry: Option<RetryPolicy>,
}

impl StepExecutor {
    /// Creates a step executor.
    pub fn new(
        registry: Arc<AdapterRegistry>,
        events: Arc<EventBus>,
        hooks: Arc<HookManager>,
        default_timeout: Option<Duration>,
        default_retry: Option<RetryPolicy>,
    ) -> Self {
        Self {
            registry,
            events,
            hooks,
            default_timeout,
            default_retry,
        }
    }

    async fn emit(&self, event: EngineEvent) {
        let _ = self.events.emit(event).await;
    }

    /// Runs one step to completion, skip, or failure.
    pub async fn execute(
        &self,
        step: &ParsedStep,
        store: &ContextStore,
        cancel: &CancellationToken,
    ) -> StepResult {
        let run = store.info().clone();
        let view = store.view();

        // 1. Condition.
        if let Some(when) = &step.when {
            if !evaluate_condition(when, &view) {
                let reason = format!("condition '{when}' evaluated to false");
                info!(step_id = %step.id, "Skipping step: {reason}");
                let result = StepResult::skipped(&step.id, reason);
                self.emit(
                    EngineEvent::new(
                        names::STEP_SKIPPED,
                        serde_json::json!({ "reason": result.error }),
                    )
                    .for_workflow(run.workflow_id.as_str())
                    .for_step(step.id.as_str())
                    .for_run(run.execution_id.as_str()),
                )
                .await;
                return result;
            }
        }

        // 2. Template resolution for input and environment.
        let input = serde_json::Value::Object(
            step.with
                .iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, &view)))
                .collect(),
        );
        let env = resolve_string_map(&step.env, &view);

        // 3. Adapter resolution.
        let adapter = match self.registry.resolve(&step.action) {
            Ok(adapter) => adapter,
            Err(err) => {
                error!(step_id = %step.id, action = %step.action, "{err}");
                return self.fail(step, &run, 0, Duration::ZERO, err).await;
            }
        };

        let problems = adapter.validate(&step.action, &input);
        if !problems.is_empty() {
            let err = EngineError::InvalidStepConfig {
                step_id: step.id.clone(),
                reason: problems.join("; "),
            };
            return self.fail(step, &run, 0, Duration::ZERO, err).await;
        }

        // 4. Retry loop under timeout.
        let policy = step
            .retry
            .as_ref()
            .map(RetryPolicy::from)
            .or_else(|| self.default_retry.clone())
            .unwrap_or_else(RetryPolicy::none);
        let timeout = step.timeout.or(self.default_timeout);

        let _ = self.hooks.before_step(&run, &step.id).await;
        self.emit(
            EngineEvent::new(
                names::STEP_STARTED,
                serde_json::json!({ "action": step.action, "name": step.name }),
            )
            .for_workflow(run.workflow_id.as_str())
            .for_step(step.id.as_str())
            .for_run(run.execution_id.as_str()),
        )
        .await;

        let started = Instant::now();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                let err = EngineError::Cancelled(format!("step '{}' cancelled", step.id));
                return self.fail(step, &run, attempt - 1, started.elapsed(), err).await;
            }

            debug!(step_id = %step.id, attempt, "Invoking adapter");
            let ctx = AdapterContext::from_view(
                &view,
                &step.id,
                env.clone(),
                timeout,
                cancel.clone(),
            );
            let call = adapter.execute(&step.action, input.clone(), ctx);
            let outcome = match timeout {
                Some(limit) => {
                    match run_with_timeout(&step.id, limit, cancel, call, None::<std::future::Ready<()>>)
                        .await
                    {
                        Ok(result) => result,
                        Err(timeout_err) => {
                            self.emit(
                                EngineEvent::new(
                                    names::STEP_TIMEOUT,
                                    serde_json::json!({
                                        "timeoutMs": timeout_err.timeout_ms,
                                        "elapsedMs": timeout_err.elapsed_ms,
                                    }),
                                )
                                .for_workflow(run.workflow_id.as_str())
                                .for_step(step.id.as_str())
                                .for_run(run.execution_id.as_str()),
                            )
                            .await;
                            Err(EngineError::StepTimeout {
                                step_id: step.id.clone(),
                                timeout_ms: timeout_err.timeout_ms,
                                elapsed_ms: timeout_err.elapsed_ms,
                            })
                        }
                    }
                }
                None => call.await,
            };

            let error = match outcome {
                Ok(result) if result.success => {
                    return self
                        .complete(step, store, attempt, started.elapsed(), result.output)
                        .await;
                }
                Ok(result) => {
                    let info = result.error.unwrap_or_else(|| crate::adapter::AdapterErrorInfo {
                        message: "adapter reported failure without details".to_string(),
                        code: None,
                        details: None,
                        stack: None,
                    });
                    EngineError::AdapterFailed {
                        adapter: adapter.name().to_string(),
                        action: step.action.clone(),
                        message: info.message,
                        code: info.code,
                    }
                }
                Err(err) => err,
            };

            if policy.should_retry(&error, attempt) {
                let delay = policy.delay_for(attempt);
                warn!(
                    step_id = %step.id,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Step failed, retrying"
                );
                store.increment_attempt();
                let _ = self.hooks.on_retry(&run, &step.id, attempt, delay).await;
                self.emit(
                    EngineEvent::new(
                        names::STEP_RETRYING,
                        serde_json::json!({
                            "attempt": attempt,
                            "maxAttempts": policy.max_attempts,
                            "delayMs": delay.as_millis() as u64,
                            "error": error.to_string(),
                        }),
                    )
                    .for_workflow(run.workflow_id.as_str())
                    .for_step(step.id.as_str())
                    .for_run(run.execution_id.as_str()),
                )
                .await;

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        let err = EngineError::Cancelled(format!(
                            "step '{}' cancelled during backoff", step.id
                        ));
                        return self.fail(step, &run, attempt, started.elapsed(), err).await;
                    }
                }
                continue;
            }

            return self.fail(step, &run, attempt, started.elapsed(), error).await;
        }
    }

    async fn complete(
        &self,
        step: &ParsedStep,
        store: &ContextStore,
        attempts: u32,
        duration: Duration,
        output: serde_json::Value,
    ) -> StepResult {
        let run = store.info().clone();

        // Make the raw output visible before projections are computed, so
        // templates may reference `steps.<id>.output`.
        store.record_step_output(
            &step.id,
            serde_json::json!({ "output": output, "outputs": output }),
        );
        let outputs = if step.outputs.is_empty() {
            output.clone()
        } else {
            serde_json::Value::Object(
                resolve_projections(&step.outputs, &store.view())
                    .into_iter()
                    .collect(),
            )
        };
        let record = serde_json::json!({ "output": output, "outputs": outputs });
        store.record_step_output(&step.id, record.clone());

        info!(
            step_id = %step.id,
            duration_ms = duration.as_millis() as u64,
            attempts,
            "Step completed"
        );
        let result = StepResult {
            step_id: step.id.clone(),
            status: StepStatus::Success,
            duration,
            attempts,
            output: Some(record),
            error: None,
        };
        self.emit(
            EngineEvent::new(
                names::STEP_COMPLETED,
                serde_json::json!({
                    "durationMs": duration.as_millis() as u64,
                    "output": result.output,
                }),
            )
            .for_workflow(run.workflow_id.as_str())
            .for_step(step.id.as_str())
            .for_run(run.execution_id.as_str()),
        )
        .await;
        let _ = self.hooks.after_step(&run, &result).await;
        result
    }

    async fn fail(
        &self,
        step: &ParsedStep,
        run: &crate::context::RunInfo,
        attempts: u32,
        duration: Duration,
        error: EngineError,
    ) -> StepResult {
        error!(step_id = %step.id, attempts, "Step failed: {error}");
        let result = StepResult {
            step_id: step.id.clone(),
            status: StepStatus::Failed,
            duration,
            attempts,
            output: None,
            error: Some(error.to_string()),
        };
        self.emit(
            EngineEvent::new(
                names::STEP_FAILED,
                serde_json::json!({
                    "error": error.to_string(),
                    "code": error.code(),
                    "attempts": attempts,
                    "continueOnError": step.continue_on_error,
                }),
            )
            .for_workflow(run.workflow_id.as_str())
            .for_step(step.id.as_str())
            .for_run(run.execution_id.as_str()),
        )
        .await;
        let _ = self.hooks.after_step(run, &result).await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{Adapter, AdapterResult};
    use crate::context::RunInfo;
    use crate::document::{BackoffKind, RetrySpec};
    use crate::parser::AdapterKind;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct CountingAdapter {
        fail_first: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Adapter for CountingAdapter {
        fn name(&self) -> &str {
            "test"
        }

        fn supported_actions(&self) -> Vec<String> {
            vec!["test.*".to_string()]
        }

        async fn execute(
            &self,
            _action: &str,
            input: serde_json::Value,
            _ctx: AdapterContext,
        ) -> crate::error::Result<AdapterResult> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                Ok(AdapterResult::failed("transient"))
            } else {
                Ok(AdapterResult::ok(serde_json::json!({ "echo": input })))
            }
        }
    }

    struct SlowAdapter;

    #[async_trait]
    impl Adapter for SlowAdapter {
        fn name(&self) -> &str {
            "slow"
        }

        fn supported_actions(&self) -> Vec<String> {
            vec!["slow.*".to_string()]
        }

        async fn execute(
            &self,
            _action: &str,
            _input: serde_json::Value,
            _ctx: AdapterContext,
        ) -> crate::error::Result<AdapterResult> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(AdapterResult::ok(serde_json::Value::Null))
        }
    }

    fn executor_with(adapter: Arc<dyn Adapter>) -> (StepExecutor, Arc<EventBus>) {
        let registry = Arc::new(AdapterRegistry::new());
        registry.register(adapter).unwrap();
        let events = Arc::new(EventBus::new());
        let executor = StepExecutor::new(
            registry,
            events.clone(),
            Arc::new(HookManager::new()),
            None,
            None,
        );
        (executor, events)
    }

    fn step(action: &str, retry: Option<RetrySpec>, timeout: Option<Duration>) -> ParsedStep {
        let namespace = action.split('.').next().unwrap().to_string();
        ParsedStep {
            id: "s1".to_string(),
            name: "s1".to_string(),
            action: action.to_string(),
            kind: AdapterKind::classify(&namespace),
            namespace,
            with: HashMap::new(),
            needs: Vec::new(),
            when: None,
            retry,
            timeout,
            continue_on_error: false,
            env: HashMap::new(),
            outputs: HashMap::new(),
        }
    }

    fn store() -> ContextStore {
        ContextStore::new(
            RunInfo::new("demo", "1.0", "manual"),
            HashMap::new(),
            HashMap::new(),
            HashMap::new(),
            HashMap::new(),
        )
    }

    fn capture(events: &EventBus, sink: Arc<Mutex<Vec<String>>>) {
        events.on_fn("*", move |event| {
            sink.lock().unwrap().push(event.event_type);
        });
    }

    #[tokio::test(start_paused = true)]
    async fn retry_until_success_counts_attempts() {
        let (executor, events) = executor_with(Arc::new(CountingAdapter {
            fail_first: 2,
            calls: AtomicU32::new(0),
        }));
        let seen = Arc::new(Mutex::new(Vec::new()));
        capture(&events, seen.clone());

        let retry = RetrySpec {
            max: 3,
            backoff: BackoffKind::Fixed,
            delay: 5,
        };
        let store = store();
        let result = executor
            .execute(&step("test.run", Some(retry), None), &store, &CancellationToken::new())
            .await;

        assert_eq!(result.status, StepStatus::Success);
        assert_eq!(result.attempts, 3);
        let seen = seen.lock().unwrap();
        assert_eq!(
            seen.iter().filter(|e| *e == names::STEP_RETRYING).count(),
            2
        );
        assert!(seen.iter().any(|e| e == names::STEP_COMPLETED));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_fail_the_step() {
        let (executor, _) = executor_with(Arc::new(CountingAdapter {
            fail_first: 10,
            calls: AtomicU32::new(0),
        }));
        let retry = RetrySpec {
            max: 2,
            backoff: BackoffKind::Fixed,
            delay: 1,
        };
        let store = store();
        let result = executor
            .execute(&step("test.run", Some(retry), None), &store, &CancellationToken::new())
            .await;

        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(result.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_produces_failed_step_with_timeout_event() {
        let (executor, events) = executor_with(Arc::new(SlowAdapter));
        let seen = Arc::new(Mutex::new(Vec::new()));
        capture(&events, seen.clone());

        let store = store();
        let result = executor
            .execute(
                &step("slow.call", None, Some(Duration::from_millis(20))),
                &store,
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(result.status, StepStatus::Failed);
        assert!(result.error.as_ref().unwrap().contains("timed out"));
        assert!(seen.lock().unwrap().iter().any(|e| e == names::STEP_TIMEOUT));
    }

    #[tokio::test]
    async fn false_condition_skips_without_adapter_call() {
        let adapter = Arc::new(CountingAdapter {
            fail_first: 0,
            calls: AtomicU32::new(0),
        });
        let (executor, events) = executor_with(adapter.clone());
        let seen = Arc::new(Mutex::new(Vec::new()));
        capture(&events, seen.clone());

        let mut s = step("test.run", None, None);
        s.when = Some("false".to_string());
        let store = store();
        let result = executor.execute(&s, &store, &CancellationToken::new()).await;

        assert_eq!(result.status, StepStatus::Skipped);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 0);
        assert!(seen.lock().unwrap().iter().any(|e| e == names::STEP_SKIPPED));
    }

    #[tokio::test]
    async fn unknown_adapter_fails_structurally() {
        let (executor, _) = executor_with(Arc::new(SlowAdapter));
        let store = store();
        let result = executor
            .execute(&step("ghost.run", None, None), &store, &CancellationToken::new())
            .await;
        assert_eq!(result.status, StepStatus::Failed);
        assert!(result.error.as_ref().unwrap().contains("no adapter found"));
    }

    #[tokio::test]
    async fn outputs_project_from_adapter_output() {
        let (executor, _) = executor_with(Arc::new(CountingAdapter {
            fail_first: 0,
            calls: AtomicU32::new(0),
        }));
        let mut s = step("test.run", None, None);
        s.with.insert("value".to_string(), serde_json::json!(7));
        s.outputs
            .insert("doubled".to_string(), "${steps.s1.output.echo.value}".to_string());
        let store = store();
        let result = executor.execute(&s, &store, &CancellationToken::new()).await;

        assert_eq!(result.status, StepStatus::Success);
        let view = store.view();
        assert_eq!(
            view.lookup("steps.s1.outputs.doubled"),
            Some(serde_json::json!(7))
        );
    }
}
