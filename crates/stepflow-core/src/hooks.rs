// Copyright (c) 2025 Stepflow Team
// SPDX-License-Identifier: MIT OR Apache-2.0

//! User-registered lifecycle hooks.
//!
//! A hook is a record of optional callbacks around workflow and step
//! execution. The manager invokes every registered hook sequentially, in
//! registration order; a failing hook is logged and isolated unless the
//! manager is configured to propagate hook errors.

use crate::context::RunInfo;
use crate::result::{StepResult, WorkflowResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Error type hooks may return.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

type HookResult = std::result::Result<(), HookError>;

/// Lifecycle hook; every callback has a no-op default.
#[async_trait]
pub trait Hook: Send + Sync {
    /// Identifies the hook in logs.
    fn name(&self) -> &str {
        "hook"
    }

    /// Runs before any step of a workflow starts.
    async fn before_workflow(&self, _run: &RunInfo) -> HookResult {
        Ok(())
    }

    /// Runs after the workflow finished, whatever the outcome.
    async fn after_workflow(&self, _run: &RunInfo, _result: &WorkflowResult) -> HookResult {
        Ok(())
    }

    /// Runs before each step.
    async fn before_step(&self, _run: &RunInfo, _step_id: &str) -> HookResult {
        Ok(())
    }

    /// Runs after each step.
    async fn after_step(&self, _run: &RunInfo, _result: &StepResult) -> HookResult {
        Ok(())
    }

    /// Runs when the workflow fails.
    async fn on_error(&self, _run: &RunInfo, _error: &str) -> HookResult {
        Ok(())
    }

    /// Runs before each retry attempt.
    async fn on_retry(&self, _run: &RunInfo, _step_id: &str, _attempt: u32, _delay: Duration) -> HookResult {
        Ok(())
    }

    /// Runs when a run is paused.
    async fn on_pause(&self, _run: &RunInfo) -> HookResult {
        Ok(())
    }

    /// Runs when a paused run resumes.
    async fn on_resume(&self, _run: &RunInfo) -> HookResult {
        Ok(())
    }
}

/// Invokes registered hooks at the right lifecycle moments.
#[derive(Default)]
pub struct HookManager {
    hooks: RwLock<Vec<Arc<dyn Hook>>>,
    fail_on_hook_error: bool,
}

macro_rules! dispatch {
    ($self:ident, $method:ident ( $($arg:expr),* )) => {{
        let hooks: Vec<Arc<dyn Hook>> = $self.hooks.read().clone();
        for hook in hooks {
            if let Err(err) = hook.$method($($arg),*).await {
                warn!(hook = %hook.name(), error = %err, "Hook failed");
                if $self.fail_on_hook_error {
                    return Err(err);
                }
            }
        }
        Ok(())
    }};
}

impl HookManager {
    /// Creates a manager that isolates hook failures.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes hook failures propagate to the caller.
    #[must_use]
    pub fn with_fail_on_hook_error(mut self, fail: bool) -> Self {
        self.fail_on_hook_error = fail;
        self
    }

    /// Registers a hook; invocation order equals registration order.
    pub fn register(&self, hook: Arc<dyn Hook>) {
        self.hooks.write().push(hook);
    }

    /// Number of registered hooks.
    pub fn len(&self) -> usize {
        self.hooks.read().len()
    }

    /// Whether no hooks are registered.
    pub fn is_empty(&self) -> bool {
        self.hooks.read().is_empty()
    }

    pub(crate) async fn before_workflow(&self, run: &RunInfo) -> HookResult {
        dispatch!(self, before_workflow(run))
    }

    pub(crate) async fn after_workflow(&self, run: &RunInfo, result: &WorkflowResult) -> HookResult {
        dispatch!(self, after_workflow(run, result))
    }

    pub(crate) async fn before_step(&self, run: &RunInfo, step_id: &str) -> HookResult {
        dispatch!(self, before_step(run, step_id))
    }

    pub(crate) async fn after_step(&self, run: &RunInfo, result: &StepResult) -> HookResult {
        dispatch!(self, after_step(run, result))
    }

    pub(crate) async fn on_error(&self, run: &RunInfo, error: &str) -> HookResult {
        dispatch!(self, on_error(run, error))
    }

    pub(crate) async fn on_retry(
        &self,
        run: &RunInfo,
        step_id: &str,
        attempt: u32,
        delay: Duration,
    ) -> HookResult {
        dispatch!(self, on_retry(run, step_id, attempt, delay))
    }

    #[allow(dead_code)]
    pub(crate) async fn on_pause(&self, run: &RunInfo) -> HookResult {
        dispatch!(self, on_pause(run))
    }

    #[allow(dead_code)]
    pub(crate) async fn on_resume(&self, run: &RunInfo) -> HookResult {
        dispatch!(self, on_resume(run))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct RecordingHook {
        label: &'static str,
        order: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Hook for RecordingHook {
        fn name(&self) -> &str {
            self.label
        }

        async fn before_workflow(&self, _run: &RunInfo) -> HookResult {
            self.order.lock().unwrap().push(self.label);
            Ok(())
        }
    }

    struct FailingHook {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Hook for FailingHook {
        async fn before_workflow(&self, _run: &RunInfo) -> HookResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err("hook exploded".into())
        }
    }

    fn run_info() -> RunInfo {
        RunInfo::new("demo", "1.0", "manual")
    }

    #[tokio::test]
    async fn hooks_run_in_registration_order() {
        let manager = HookManager::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        manager.register(Arc::new(RecordingHook {
            label: "first",
            order: order.clone(),
        }));
        manager.register(Arc::new(RecordingHook {
            label: "second",
            order: order.clone(),
        }));

        manager.before_workflow(&run_info()).await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn failing_hook_is_isolated_by_default() {
        let manager = HookManager::new();
        let calls = Arc::new(AtomicUsize::new(0));
        manager.register(Arc::new(FailingHook { calls: calls.clone() }));
        let order = Arc::new(Mutex::new(Vec::new()));
        manager.register(Arc::new(RecordingHook {
            label: "after",
            order: order.clone(),
        }));

        manager.before_workflow(&run_info()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*order.lock().unwrap(), vec!["after"]);
    }

    #[tokio::test]
    async fn fail_on_hook_error_propagates() {
        let manager = HookManager::new().with_fail_on_hook_error(true);
        manager.register(Arc::new(FailingHook {
            calls: Arc::new(AtomicUsize::new(0)),
        }));
        assert!(manager.before_workflow(&run_info()).await.is_err());
    }
}
