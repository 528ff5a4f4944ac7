// Copyright (c) 2025 Stepflow Team
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Central scheduler: multiplexes trigger sources into the job queue.
//!
//! Cron, interval and once schedules fire from a tick loop that runs at
//! most once per second and corrects drift by comparing `next_run_at`
//! against the wall clock rather than accumulating sleeps. Event, webhook
//! and manual triggers fire on demand. After every dispatch the schedule's
//! execution count and expiry conditions are re-evaluated; a schedule in
//! `paused`, `disabled` or `expired` never fires.

use crate::cron::CronExpression;
use crate::document::{TriggerSpec, TriggerType};
use crate::error::{EngineError, Result};
use crate::events::{names, EngineEvent, EventBus};
use crate::cancel::CancellationToken;
use crate::parser::ParsedWorkflow;
use crate::queue::{Job, JobQueue};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Lifecycle status of a schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleStatus {
    Active,
    Paused,
    Disabled,
    Expired,
}

/// A registered trigger bound to a workflow.
#[derive(Debug, Clone)]
pub struct Schedule {
    /// Schedule id.
    pub id: String,
    /// Workflow this schedule runs.
    pub workflow_id: String,
    /// Trigger kind.
    pub trigger_type: TriggerType,
    /// Parsed cron expression for cron schedules.
    pub cron: Option<CronExpression>,
    /// Interval for interval schedules.
    pub interval_ms: Option<u64>,
    /// Timezone cron fields are evaluated in.
    pub timezone: Tz,
    /// Earliest fire time.
    pub start_date: Option<DateTime<Utc>>,
    /// Expiry time.
    pub end_date: Option<DateTime<Utc>>,
    /// Maximum number of firings.
    pub max_executions: Option<u64>,
    /// Firings so far.
    pub execution_count: u64,
    /// Lifecycle status.
    pub status: ScheduleStatus,
    /// Last fire time.
    pub last_run_at: Option<DateTime<Utc>>,
    /// Next planned fire time (cron/interval/once only).
    pub next_run_at: Option<DateTime<Utc>>,
    /// Input merged into every job this schedule enqueues.
    pub input: HashMap<String, serde_json::Value>,
    /// Suppress firing while a job for this schedule is still active.
    pub skip_if_running: bool,
    /// Event source for event schedules.
    pub source: Option<String>,
    /// Event filters; all entries must equal the event data.
    pub filters: HashMap<String, serde_json::Value>,
    /// Endpoint for webhook schedules.
    pub endpoint: Option<String>,
}

impl Schedule {
    /// Builds a schedule from a validated trigger declaration.
    pub fn from_trigger(workflow_id: &str, trigger: &TriggerSpec) -> Result<Self> {
        let cron = match (&trigger.trigger_type, &trigger.cron) {
            (TriggerType::Cron, Some(expr)) => Some(CronExpression::parse(expr)?),
            (TriggerType::Cron, None) => {
                return Err(EngineError::InvalidCron {
                    expression: String::new(),
                    reason: "cron trigger requires an expression".to_string(),
                })
            }
            _ => None,
        };
        let timezone = match &trigger.timezone {
            Some(name) => name.parse::<Tz>().map_err(|_| EngineError::InvalidCron {
                expression: trigger.cron.clone().unwrap_or_default(),
                reason: format!("unknown timezone '{name}'"),
            })?,
            None => Tz::UTC,
        };
        let mut schedule = Self {
            id: Uuid::new_v4().to_string(),
            workflow_id: workflow_id.to_string(),
            trigger_type: trigger.trigger_type,
            cron,
            interval_ms: trigger.interval_ms,
            timezone,
            start_date: trigger.start_date,
            end_date: trigger.end_date,
            max_executions: trigger.max_executions,
            execution_count: 0,
            status: ScheduleStatus::Active,
            last_run_at: None,
            next_run_at: None,
            input: trigger.input.clone(),
            skip_if_running: trigger.skip_if_running,
            source: trigger.source.clone(),
            filters: trigger.filters.clone(),
            endpoint: trigger.endpoint.clone(),
        };
        schedule.next_run_at = schedule.compute_next(Utc::now());
        Ok(schedule)
    }

    /// Computes the next planned fire time strictly after `now`.
    pub fn compute_next(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let base = match self.start_date {
            Some(start) if start > now => start,
            _ => now,
        };
        match self.trigger_type {
            TriggerType::Cron => self
                .cron
                .as_ref()
                .and_then(|cron| cron.next_occurrence(base, self.timezone)),
            TriggerType::Interval => {
                let interval = chrono::Duration::milliseconds(self.interval_ms? as i64);
                match self.last_run_at {
                    Some(last) => Some(last + interval),
                    None => Some(base + interval),
                }
            }
            TriggerType::Once => Some(self.start_date.unwrap_or(now)),
            TriggerType::Manual | TriggerType::Event | TriggerType::Webhook => None,
        }
    }

    fn check_expiry(&mut self, now: DateTime<Utc>) {
        let expired_by_date = self.end_date.is_some_and(|end| end < now);
        let expired_by_count = self
            .max_executions
            .is_some_and(|max| self.execution_count >= max);
        if expired_by_date || expired_by_count || self.trigger_type == TriggerType::Once {
            self.status = ScheduleStatus::Expired;
            self.next_run_at = None;
        }
    }
}

/// An external event offered to event schedules.
#[derive(Debug, Clone)]
pub struct EventTrigger {
    /// Source name schedules subscribe to.
    pub source: String,
    /// Event payload merged into job input under `event`.
    pub data: serde_json::Value,
}

/// An incoming webhook offered to webhook schedules.
#[derive(Debug, Clone)]
pub struct WebhookTrigger {
    /// Endpoint the webhook arrived on.
    pub endpoint: String,
    /// HTTP method.
    pub method: String,
    /// Request body.
    pub body: serde_json::Value,
    /// Request headers.
    pub headers: HashMap<String, String>,
}

/// Multiplexes triggers into the job queue.
pub struct Scheduler {
    schedules: RwLock<HashMap<String, Schedule>>,
    queue: Arc<dyn JobQueue>,
    events: Arc<EventBus>,
}

impl Scheduler {
    /// Creates a scheduler publishing into the given queue.
    pub fn new(queue: Arc<dyn JobQueue>, events: Arc<EventBus>) -> Self {
        Self {
            schedules: RwLock::new(HashMap::new()),
            queue,
            events,
        }
    }

    /// Registers a schedule; returns its id.
    pub fn add(&self, schedule: Schedule) -> String {
        let id = schedule.id.clone();
        info!(
            schedule_id = %id,
            workflow = %schedule.workflow_id,
            trigger = ?schedule.trigger_type,
            next_run_at = ?schedule.next_run_at,
            "Registered schedule"
        );
        self.schedules.write().insert(id.clone(), schedule);
        id
    }

    /// Registers schedules for every trigger a workflow declares.
    pub fn register_workflow_triggers(&self, workflow: &ParsedWorkflow) -> Result<Vec<String>> {
        let workflow_id = format!("{}@{}", workflow.name, workflow.version);
        let mut ids = Vec::new();
        for trigger in &workflow.triggers {
            let schedule = Schedule::from_trigger(&workflow_id, trigger)?;
            ids.push(self.add(schedule));
        }
        Ok(ids)
    }

    /// Looks up a schedule.
    pub fn get(&self, schedule_id: &str) -> Option<Schedule> {
        self.schedules.read().get(schedule_id).cloned()
    }

    /// All registered schedules.
    pub fn list(&self) -> Vec<Schedule> {
        self.schedules.read().values().cloned().collect()
    }

    fn set_status(&self, schedule_id: &str, status: ScheduleStatus) -> Result<()> {
        let mut schedules = self.schedules.write();
        let schedule = schedules
            .get_mut(schedule_id)
            .ok_or_else(|| EngineError::ScheduleNotFound(schedule_id.to_string()))?;
        if schedule.status != ScheduleStatus::Expired {
            schedule.status = status;
        }
        Ok(())
    }

    /// Pauses a schedule.
    pub fn pause(&self, schedule_id: &str) -> Result<()> {
        self.set_status(schedule_id, ScheduleStatus::Paused)
    }

    /// Resumes a paused schedule.
    pub fn resume(&self, schedule_id: &str) -> Result<()> {
        self.set_status(schedule_id, ScheduleStatus::Active)
    }

    /// Disables a schedule.
    pub fn disable(&self, schedule_id: &str) -> Result<()> {
        self.set_status(schedule_id, ScheduleStatus::Disabled)
    }

    /// Removes a schedule entirely.
    pub fn remove(&self, schedule_id: &str) -> Result<()> {
        self.schedules
            .write()
            .remove(schedule_id)
            .map(|_| ())
            .ok_or_else(|| EngineError::ScheduleNotFound(schedule_id.to_string()))
    }

    async fn has_active_job(&self, schedule_id: &str) -> bool {
        let tag = format!("schedule:{schedule_id}");
        self.queue
            .active_jobs()
            .await
            .iter()
            .any(|job| job.metadata.tags.contains(&tag))
    }

    /// Enqueues one job for a schedule, merging `extra` over its input.
    async fn fire(
        &self,
        schedule: &Schedule,
        extra: Option<(&str, serde_json::Value)>,
        triggered_by: &str,
    ) -> Result<String> {
        if schedule.skip_if_running && self.has_active_job(&schedule.id).await {
            debug!(schedule_id = %schedule.id, "Skipping fire: previous run still active");
            return Err(EngineError::Cancelled(format!(
                "schedule '{}' suppressed by skipIfRunning",
                schedule.id
            )));
        }

        let mut input = schedule.input.clone();
        if let Some((key, data)) = extra {
            input.insert(key.to_string(), data);
        }
        let job = Job::workflow(
            schedule.workflow_id.clone(),
            serde_json::json!({
                "input": input,
                "triggeredBy": triggered_by,
            }),
        )
        .with_tag(format!("schedule:{}", schedule.id));
        let job_id = job.id.clone();

        match self.queue.enqueue(job).await {
            Ok(_) => {}
            Err(EngineError::QueueFull { max_size }) => {
                warn!(
                    schedule_id = %schedule.id,
                    max_size,
                    "Queue full, dropping trigger"
                );
                return Err(EngineError::QueueFull { max_size });
            }
            Err(err) => return Err(err),
        }

        let _ = self
            .events
            .emit(
                EngineEvent::new(
                    names::SCHEDULE_TRIGGERED,
                    serde_json::json!({
                        "scheduleId": schedule.id,
                        "trigger": triggered_by,
                        "jobId": job_id,
                    }),
                )
                .for_workflow(schedule.workflow_id.as_str()),
            )
            .await;
        let _ = self
            .events
            .emit(
                EngineEvent::new(names::JOB_ENQUEUED, serde_json::json!({ "jobId": job_id }))
                    .for_workflow(schedule.workflow_id.as_str()),
            )
            .await;
        Ok(job_id)
    }

    fn after_fire(&self, schedule_id: &str, now: DateTime<Utc>) {
        let mut schedules = self.schedules.write();
        if let Some(schedule) = schedules.get_mut(schedule_id) {
            schedule.last_run_at = Some(now);
            schedule.execution_count += 1;
            schedule.next_run_at = schedule.compute_next(now);
            schedule.check_expiry(now);
        }
    }

    /// Fires a schedule directly, regardless of planned time.
    ///
    /// Returns the enqueued job id, or `None` when the schedule exists but
    /// is not active.
    pub async fn trigger_manual(
        &self,
        schedule_id: &str,
        input_override: Option<HashMap<String, serde_json::Value>>,
    ) -> Result<Option<String>> {
        let Some(mut schedule) = self.get(schedule_id) else {
            return Err(EngineError::ScheduleNotFound(schedule_id.to_string()));
        };
        if schedule.status != ScheduleStatus::Active {
            warn!(schedule_id = %schedule_id, status = ?schedule.status, "Manual trigger ignored");
            return Ok(None);
        }
        if let Some(overrides) = input_override {
            schedule.input.extend(overrides);
        }
        let job_id = self.fire(&schedule, None, "manual").await?;
        self.after_fire(schedule_id, Utc::now());
        Ok(Some(job_id))
    }

    /// Offers an event to all matching active event schedules.
    ///
    /// Event data merges into job input under `event`. Returns the job ids
    /// that were enqueued.
    pub async fn trigger_event(&self, trigger: EventTrigger) -> Result<Vec<String>> {
        let candidates: Vec<Schedule> = self
            .schedules
            .read()
            .values()
            .filter(|s| {
                s.status == ScheduleStatus::Active
                    && s.trigger_type == TriggerType::Event
                    && s.source.as_deref() == Some(trigger.source.as_str())
                    && filters_match(&s.filters, &trigger.data)
            })
            .cloned()
            .collect();

        let mut job_ids = Vec::new();
        let now = Utc::now();
        for schedule in candidates {
            match self
                .fire(
                    &schedule,
                    Some(("event", trigger.data.clone())),
                    &format!("event:{}", trigger.source),
                )
                .await
            {
                Ok(job_id) => {
                    self.after_fire(&schedule.id, now);
                    job_ids.push(job_id);
                }
                Err(EngineError::Cancelled(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(job_ids)
    }

    /// Offers an incoming webhook to all matching active webhook schedules.
    ///
    /// Webhook data merges into job input under `webhook`.
    pub async fn trigger_webhook(&self, trigger: WebhookTrigger) -> Result<Vec<String>> {
        let candidates: Vec<Schedule> = self
            .schedules
            .read()
            .values()
            .filter(|s| {
                s.status == ScheduleStatus::Active
                    && s.trigger_type == TriggerType::Webhook
                    && s.endpoint.as_deref() == Some(trigger.endpoint.as_str())
            })
            .cloned()
            .collect();

        let payload = serde_json::json!({
            "endpoint": trigger.endpoint,
            "method": trigger.method,
            "body": trigger.body,
            "headers": trigger.headers,
        });
        let mut job_ids = Vec::new();
        let now = Utc::now();
        for schedule in candidates {
            match self
                .fire(
                    &schedule,
                    Some(("webhook", payload.clone())),
                    &format!("webhook:{}", trigger.endpoint),
                )
                .await
            {
                Ok(job_id) => {
                    self.after_fire(&schedule.id, now);
                    job_ids.push(job_id);
                }
                Err(EngineError::Cancelled(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(job_ids)
    }

    /// Fires every due cron/interval/once schedule. Returns the number of
    /// jobs enqueued.
    pub async fn tick(&self, now: DateTime<Utc>) -> usize {
        let due: Vec<Schedule> = self
            .schedules
            .read()
            .values()
            .filter(|s| {
                s.status == ScheduleStatus::Active
                    && s.next_run_at.is_some_and(|next| next <= now)
            })
            .cloned()
            .collect();

        let mut fired = 0;
        for schedule in due {
            let triggered_by = match schedule.trigger_type {
                TriggerType::Cron => "cron",
                TriggerType::Interval => "interval",
                TriggerType::Once => "once",
                _ => continue,
            };
            match self.fire(&schedule, None, triggered_by).await {
                Ok(_) => fired += 1,
                Err(err) => {
                    debug!(schedule_id = %schedule.id, error = %err, "Trigger not dispatched");
                }
            }
            // Advance the plan even when the dispatch was suppressed, so a
            // stuck run does not make the schedule fire every tick.
            self.after_fire(&schedule.id, now);
        }
        fired
    }

    /// Tick loop: runs at most once per second until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!("Scheduler loop started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(1)) => {
                    self.tick(Utc::now()).await;
                }
            }
        }
        info!("Scheduler loop stopped");
    }
}

fn filters_match(filters: &HashMap<String, serde_json::Value>, data: &serde_json::Value) -> bool {
    filters
        .iter()
        .all(|(key, expected)| data.get(key) == Some(expected))
}
