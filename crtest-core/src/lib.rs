// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! crtest Core Library
//!
//! Validates a checkpoint/restore facility by driving real test programs
//! through isolation setup, a suspend/resume cycle and post-cycle
//! state-equivalence checks. Provides the test catalog, isolation flavors,
//! the test process controller, the cycle driver, the visible-state
//! comparator and the bounded-concurrency scheduler.

pub mod catalog;
pub mod context;
pub mod cycle;
pub mod error;
pub mod flavor;
pub mod make;
pub mod process;
pub mod scenario;
pub mod scheduler;
pub mod visible;

// Re-export commonly used types
pub use catalog::{Catalog, TestDescriptor};
pub use context::{SuiteConfig, SuiteContext};
pub use cycle::CycleOptions;
pub use error::{SuiteError, SuiteResult};
pub use flavor::{Flavor, FlavorKind};
pub use process::TestProcess;
pub use scenario::{RunResult, Step};
pub use scheduler::{run_job, run_tests, Job, RunOptions};
pub use visible::VisibleState;
