// Copyright (c) 2025 Stepflow Team
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Lifecycle event bus.
//!
//! Subscriptions are keyed by event name, with `*` as a catch-all.
//! Emission walks the exact-name list then the wildcard list, awaiting
//! each handler in registration order; a failing handler is logged and
//! isolated from the others unless the bus is configured to propagate.
//! Subscription lists are copied before dispatch, so handlers may
//! subscribe or unsubscribe concurrently.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// Well-known event names emitted by the engine.
pub mod names {
    pub const WORKFLOW_STARTED: &str = "workflow.started";
    pub const WORKFLOW_COMPLETED: &str = "workflow.completed";
    pub const WORKFLOW_FAILED: &str = "workflow.failed";
    pub const WORKFLOW_PAUSED: &str = "workflow.paused";
    pub const WORKFLOW_RESUMED: &str = "workflow.resumed";
    pub const WORKFLOW_CANCELLED: &str = "workflow.cancelled";
    pub const STEP_STARTED: &str = "step.started";
    pub const STEP_COMPLETED: &str = "step.completed";
    pub const STEP_FAILED: &str = "step.failed";
    pub const STEP_SKIPPED: &str = "step.skipped";
    pub const STEP_RETRYING: &str = "step.retrying";
    pub const STEP_TIMEOUT: &str = "step.timeout";
    pub const JOB_ENQUEUED: &str = "job.enqueued";
    pub const JOB_DEQUEUED: &str = "job.dequeued";
    pub const JOB_RETRY: &str = "job.retry";
    pub const SCHEDULE_TRIGGERED: &str = "schedule.triggered";
    pub const STATE_TRANSITION: &str = "state.transition";
    pub const ENGINE_STARTED: &str = "engine.started";
    pub const ENGINE_STOPPED: &str = "engine.stopped";
}

/// A lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    /// Event name, e.g. `step.completed`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Emission timestamp.
    pub timestamp: DateTime<Utc>,
    /// Workflow the event belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    /// Step the event belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    /// Run the event belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    /// Event payload.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl EngineEvent {
    /// Creates an event with the current timestamp.
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp: Utc::now(),
            workflow_id: None,
            step_id: None,
            run_id: None,
            payload,
        }
    }

    /// Tags the event with a workflow id.
    #[must_use]
    pub fn for_workflow(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    /// Tags the event with a step id.
    #[must_use]
    pub fn for_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    /// Tags the event with a run id.
    #[must_use]
    pub fn for_run(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }
}

/// Error type handlers may return; the bus only logs it.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Subscriber callback.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    /// Handles one event.
    async fn handle(&self, event: EngineEvent) -> std::result::Result<(), HandlerError>;
}

/// Adapts a plain closure into an [`EventHandler`].
struct FnHandler<F>(F);

#[async_trait::async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: Fn(EngineEvent) + Send + Sync,
{
    async fn handle(&self, event: EngineEvent) -> std::result::Result<(), HandlerError> {
        (self.0)(event);
        Ok(())
    }
}

/// Identifier returned by `on`; pass to `off` to unsubscribe.
pub type SubscriptionId = Uuid;

#[derive(Clone)]
struct Subscription {
    id: SubscriptionId,
    handler: Arc<dyn EventHandler>,
    once: bool,
}

/// Name-keyed pub/sub bus for engine lifecycle events.
pub struct EventBus {
    subscriptions: DashMap<String, Vec<Subscription>>,
    fail_on_handler_error: bool,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Creates a bus that isolates handler failures.
    pub fn new() -> Self {
        Self {
            subscriptions: DashMap::new(),
            fail_on_handler_error: false,
        }
    }

    /// Makes handler failures abort emission and surface to the emitter.
    #[must_use]
    pub fn with_fail_on_handler_error(mut self, fail: bool) -> Self {
        self.fail_on_handler_error = fail;
        self
    }

    /// Subscribes a handler to an event name (`*` for all events).
    pub fn on(&self, event: &str, handler: Arc<dyn EventHandler>) -> SubscriptionId {
        self.subscribe(event, handler, false)
    }

    /// Subscribes a plain closure.
    pub fn on_fn<F>(&self, event: &str, f: F) -> SubscriptionId
    where
        F: Fn(EngineEvent) + Send + Sync + 'static,
    {
        self.on(event, Arc::new(FnHandler(f)))
    }

    /// Subscribes a handler that is removed after its first invocation.
    pub fn once(&self, event: &str, handler: Arc<dyn EventHandler>) -> SubscriptionId {
        self.subscribe(event, handler, true)
    }

    /// Subscribes one handler to several event names.
    pub fn on_many(&self, events: &[&str], handler: Arc<dyn EventHandler>) -> Vec<SubscriptionId> {
        events
            .iter()
            .map(|event| self.on(event, handler.clone()))
            .collect()
    }

    fn subscribe(&self, event: &str, handler: Arc<dyn EventHandler>, once: bool) -> SubscriptionId {
        let id = Uuid::new_v4();
        self.subscriptions
            .entry(event.to_string())
            .or_default()
            .push(Subscription { id, handler, once });
        id
    }

    /// Removes a subscription.
    pub fn off(&self, event: &str, id: SubscriptionId) -> bool {
        match self.subscriptions.get_mut(event) {
            Some(mut subs) => {
                let before = subs.len();
                subs.retain(|s| s.id != id);
                before != subs.len()
            }
            None => false,
        }
    }

    /// Removes every subscription.
    pub fn clear(&self) {
        self.subscriptions.clear();
    }

    /// Number of subscribers for an exact event name.
    pub fn listener_count(&self, event: &str) -> usize {
        self.subscriptions.get(event).map_or(0, |subs| subs.len())
    }

    fn collect_for(&self, event_type: &str) -> Vec<Subscription> {
        let mut handlers = Vec::new();
        if let Some(subs) = self.subscriptions.get(event_type) {
            handlers.extend(subs.iter().cloned());
        }
        if event_type != "*" {
            if let Some(subs) = self.subscriptions.get("*") {
                handlers.extend(subs.iter().cloned());
            }
        }
        handlers
    }

    fn drop_once(&self, event_type: &str, fired: &[Subscription]) {
        let once_ids: Vec<SubscriptionId> =
            fired.iter().filter(|s| s.once).map(|s| s.id).collect();
        if once_ids.is_empty() {
            return;
        }
        for key in [event_type, "*"] {
            if let Some(mut subs) = self.subscriptions.get_mut(key) {
                subs.retain(|s| !once_ids.contains(&s.id));
            }
        }
    }

    /// Emits an event, awaiting each subscriber sequentially.
    pub async fn emit(&self, event: EngineEvent) -> std::result::Result<(), HandlerError> {
        let handlers = self.collect_for(&event.event_type);
        for subscription in &handlers {
            if let Err(err) = subscription.handler.handle(event.clone()).await {
                warn!(
                    event = %event.event_type,
                    error = %err,
                    "Event handler failed"
                );
                if self.fail_on_handler_error {
                    self.drop_once(&event.event_type, &handlers);
                    return Err(err);
                }
            }
        }
        self.drop_once(&event.event_type, &handlers);
        Ok(())
    }

    /// Emits without awaiting handler completion; dispatch happens on a
    /// spawned task in the same sequential order.
    pub fn emit_sync(&self, event: EngineEvent) {
        let handlers = self.collect_for(&event.event_type);
        self.drop_once(&event.event_type, &handlers);
        tokio::spawn(async move {
            for subscription in handlers {
                if let Err(err) = subscription.handler.handle(event.clone()).await {
                    warn!(event = %event.event_type, error = %err, "Event handler failed");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[tokio::test]
    async fn exact_and_wildcard_subscribers_both_fire() {
        let bus = EventBus::new();
        let exact = Arc::new(AtomicUsize::new(0));
        let all = Arc::new(AtomicUsize::new(0));

        let counter = exact.clone();
        bus.on_fn(names::STEP_COMPLETED, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = all.clone();
        bus.on_fn("*", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(EngineEvent::new(names::STEP_COMPLETED, serde_json::json!({})))
            .await
            .unwrap();
        bus.emit(EngineEvent::new(names::STEP_FAILED, serde_json::json!({})))
            .await
            .unwrap();

        assert_eq!(exact.load(Ordering::SeqCst), 1);
        assert_eq!(all.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn once_subscription_fires_a_single_time() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        bus.once(
            names::WORKFLOW_STARTED,
            Arc::new(FnHandler(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        );

        for _ in 0..3 {
            bus.emit(EngineEvent::new(names::WORKFLOW_STARTED, serde_json::json!({})))
                .await
                .unwrap();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count(names::WORKFLOW_STARTED), 0);
    }

    #[tokio::test]
    async fn off_unsubscribes_and_clear_empties() {
        let bus = EventBus::new();
        let id = bus.on_fn("a", |_| {});
        bus.on_fn("a", |_| {});
        assert_eq!(bus.listener_count("a"), 2);
        assert!(bus.off("a", id));
        assert_eq!(bus.listener_count("a"), 1);
        bus.clear();
        assert_eq!(bus.listener_count("a"), 0);
    }

    struct FailingHandler;

    #[async_trait::async_trait]
    impl EventHandler for FailingHandler {
        async fn handle(&self, _event: EngineEvent) -> std::result::Result<(), HandlerError> {
            Err("boom".into())
        }
    }

    #[tokio::test]
    async fn failing_handler_does_not_abort_others() {
        let bus = EventBus::new();
        bus.on("a", Arc::new(FailingHandler));
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        bus.on_fn("a", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(EngineEvent::new("a", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fail_on_handler_error_propagates() {
        let bus = EventBus::new().with_fail_on_handler_error(true);
        bus.on("a", Arc::new(FailingHandler));
        let result = bus.emit(EngineEvent::new("a", serde_json::json!({}))).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn subscribers_observe_emission_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.on_fn("*", move |event| {
            sink.lock().unwrap().push(event.event_type);
        });

        for name in ["first", "second", "third"] {
            bus.emit(EngineEvent::new(name, serde_json::json!({})))
                .await
                .unwrap();
        }
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second", "third"]);
    }
}
