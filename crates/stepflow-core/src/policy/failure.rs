// Copyright (c) 2025 Stepflow Team
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Failure strategy: what happens to the rest of a run after a step fails.

use crate::document::{FailureKind, FailureSpec};

/// Final status forced by a failure decision, when the strategy itself
/// determines the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForcedStatus {
    Failed,
    Partial,
}

/// Decision returned by [`FailureStrategy::decide`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureDecision {
    /// Whether the run keeps executing remaining steps.
    pub continue_run: bool,
    /// Whether workflow cleanup must run.
    pub run_cleanup: bool,
    /// Whether the failed step's transitive dependents are skipped.
    pub skip_dependents: bool,
    /// Status forced by the strategy; `None` leaves the final status to the
    /// end-of-run rules.
    pub forced_status: Option<ForcedStatus>,
}

/// Pure failure policy configured from the document's `policies.failure`.
#[derive(Debug, Clone, Default)]
pub struct FailureStrategy {
    spec: FailureSpec,
}

impl FailureStrategy {
    /// Builds the strategy from a document policy.
    pub fn new(spec: FailureSpec) -> Self {
        Self { spec }
    }

    /// Strategy kind.
    pub fn kind(&self) -> FailureKind {
        self.spec.kind
    }

    /// Whether partial success is allowed at the end of the run.
    pub fn allow_partial_success(&self) -> bool {
        self.spec.allow_partial_success
    }

    /// Whether a step is critical.
    pub fn is_critical(&self, step_id: &str) -> bool {
        self.spec.critical_steps.iter().any(|s| s == step_id)
    }

    /// Decides how the run proceeds after `step_id` failed.
    ///
    /// Decision order: critical step, then the failure budget, then the
    /// strategy type.
    pub fn decide(
        &self,
        step_id: &str,
        completed: usize,
        current_failures: usize,
    ) -> FailureDecision {
        if self.is_critical(step_id) {
            return FailureDecision {
                continue_run: false,
                run_cleanup: true,
                skip_dependents: true,
                forced_status: Some(ForcedStatus::Failed),
            };
        }

        if let Some(max) = self.spec.max_failures {
            if current_failures > max {
                let forced = if self.spec.allow_partial_success && completed > 0 {
                    ForcedStatus::Partial
                } else {
                    ForcedStatus::Failed
                };
                return FailureDecision {
                    continue_run: false,
                    run_cleanup: true,
                    skip_dependents: true,
                    forced_status: Some(forced),
                };
            }
        }

        match self.spec.kind {
            FailureKind::Abort => FailureDecision {
                continue_run: false,
                run_cleanup: true,
                skip_dependents: true,
                forced_status: None,
            },
            FailureKind::Continue => FailureDecision {
                continue_run: true,
                run_cleanup: false,
                skip_dependents: false,
                forced_status: None,
            },
            FailureKind::SkipDependent => FailureDecision {
                continue_run: true,
                run_cleanup: false,
                skip_dependents: true,
                forced_status: None,
            },
        }
    }
}
