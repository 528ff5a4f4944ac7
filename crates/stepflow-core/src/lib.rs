// Copyright (c) 2025 Stepflow Team
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core workflow automation engine.
//!
//! A workflow is a YAML/JSON document describing a DAG of steps, each step
//! invoking a named adapter action. This crate provides the execution
//! substrate: document model and validation (including the reserved-field
//! security guard), the step parser and dependency planner, retry/timeout/
//! failure policies, the step and workflow executors, the job queue and
//! scheduler, the top-level engine, and the lifecycle event/hook pipeline.
//!
//! ```no_run
//! use std::sync::Arc;
//! use stepflow_core::engine::{EngineConfig, ExecutionEngine};
//! use stepflow_core::executor::RunOptions;
//!
//! # async fn demo() -> stepflow_core::error::Result<()> {
//! let engine = Arc::new(ExecutionEngine::new(EngineConfig::default()));
//! let workflow = engine.register_workflow_source(
//!     r#"
//! version: "1.0"
//! kind: workflow
//! metadata: { name: hello }
//! workflow:
//!   steps:
//!     - id: greet
//!       uses: echo.say
//!       with: { message: "hi" }
//! "#,
//! )?;
//! let result = engine
//!     .execute_workflow_immediate(&workflow, RunOptions::default())
//!     .await;
//! println!("{:?}", result.status);
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod cancel;
pub mod context;
pub mod cron;
pub mod dag;
pub mod document;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod hooks;
pub mod parser;
pub mod policy;
pub mod queue;
pub mod registry;
pub mod resolve;
pub mod result;
pub mod scheduler;
pub mod security;
pub mod step_executor;
pub mod typo;
pub mod validate;

pub use adapter::{Adapter, AdapterContext, AdapterResult};
pub use cancel::CancellationToken;
pub use document::WorkflowDocument;
pub use engine::{EngineConfig, ExecutionEngine};
pub use error::{Diagnostic, EngineError, ErrorCode, Result};
pub use events::{EngineEvent, EventBus};
pub use executor::{RunOptions, WorkflowExecutor};
pub use hooks::{Hook, HookManager};
pub use parser::{ParsedStep, ParsedWorkflow};
pub use queue::{InMemoryJobQueue, Job, JobQueue};
pub use registry::AdapterRegistry;
pub use result::{RunStatus, StepResult, StepStatus, WorkflowResult};
pub use scheduler::{Schedule, Scheduler};
pub use validate::parse_document;
