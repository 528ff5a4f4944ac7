// Copyright (c) 2025 Stepflow Team
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Pure policy objects: backoff arithmetic, retry decisions, timeout
//! management and failure strategies.
//!
//! Everything here is deterministic for tests (jitter can be zeroed) and
//! free of engine state; the executors own the side effects.

pub mod backoff;
pub mod failure;
pub mod retry;
pub mod timeout;

pub use backoff::Backoff;
pub use failure::{FailureDecision, FailureStrategy, ForcedStatus};
pub use retry::RetryPolicy;
pub use timeout::{parse_duration, TimeoutError};
