// Copyright (c) 2025 Stepflow Team
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Reference adapters for the stepflow engine.
//!
//! These adapters exercise the full adapter contract without performing
//! real I/O: [`EchoAdapter`] returns its input, [`NoopAdapter`] succeeds
//! with a constant output, [`SimulatedAdapter`] models latency and failure
//! rates for offline development, and [`FlakyAdapter`] fails a configured
//! number of times before succeeding, which retry tests rely on.

mod echo;
mod flaky;
mod noop;
mod simulated;

pub use echo::EchoAdapter;
pub use flaky::FlakyAdapter;
pub use noop::NoopAdapter;
pub use simulated::{SimulatedAdapter, SimulationConfig};
