// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Hidden worker entry point for pooled runs.
//!
//! The launcher hands each worker one serialized job description; the worker
//! runs the scenario executor for exactly that unit and exits with a status
//! reflecting pass/fail. Its stdout and stderr are already redirected into
//! the per-unit log.

use std::process::ExitCode;

use crtest_core::{run_job, Job, SuiteContext};

pub fn execute(payload: &str) -> ExitCode {
    let job = match Job::from_json(payload) {
        Ok(job) => job,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let ctx = SuiteContext::new(job.config.clone());
    if run_job(&job, &ctx) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
