// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Scenario executor.
//!
//! Composes the lifecycle for one (test, flavor) pair:
//! start -> pre-cycle snapshot -> cycle -> post-cycle compare -> stop.
//! The sequence is terminal on first failure: the failing step is recorded,
//! the test output is captured, the process tree is force-killed and the
//! flavor torn down before the failure is reported.

use nix::sys::signal::Signal;

use crate::catalog::TestDescriptor;
use crate::context::SuiteContext;
use crate::cycle::{run_cycle, CycleOptions};
use crate::error::{SuiteError, SuiteResult};
use crate::flavor::{Flavor, FlavorKind};
use crate::process::TestProcess;
use crate::visible::VisibleState;

/// Steps of one scenario, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Start,
    SnapshotPre,
    Cycle,
    Compare,
    Stop,
}

impl Step {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::SnapshotPre => "snapshot",
            Self::Cycle => "cycle",
            Self::Compare => "compare",
            Self::Stop => "stop",
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Outcome of one (test, flavor) execution.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub test: String,
    pub flavor: FlavorKind,
    pub passed: bool,
    pub failed_step: Option<Step>,
    pub error: Option<String>,
    /// Captured test output, populated on failure for diagnostics.
    pub output: String,
}

impl RunResult {
    fn pass(test: &str, flavor: FlavorKind) -> Self {
        Self {
            test: test.to_string(),
            flavor,
            passed: true,
            failed_step: None,
            error: None,
            output: String::new(),
        }
    }

    fn fail(test: &str, flavor: FlavorKind, step: Step, err: SuiteError, output: String) -> Self {
        Self {
            test: test.to_string(),
            flavor,
            passed: false,
            failed_step: Some(step),
            error: Some(err.to_string()),
            output,
        }
    }

    /// Print the result the way the aggregate log expects it: failing runs
    /// dump their captured output first, then the verdict line.
    pub fn report(&self) {
        match self.failed_step {
            None => println!("Test {} PASS", self.test),
            Some(step) => {
                println!("Test output: {}", "=".repeat(32));
                print!("{}", self.output);
                println!(" <<< {}", "=".repeat(32));
                if let Some(error) = &self.error {
                    println!("{}", error);
                }
                println!("Test {} FAIL at {}", self.test, step);
            }
        }
    }
}

/// Run one test across its flavor set, stopping at the first failing flavor.
pub fn run_unit(
    name: &str,
    desc: &TestDescriptor,
    flavors: &[FlavorKind],
    opts: &CycleOptions,
    ctx: &SuiteContext,
) -> Vec<RunResult> {
    let mut results = Vec::with_capacity(flavors.len());
    for &kind in flavors {
        let result = run_scenario(name, desc, kind, opts, ctx);
        let failed = !result.passed;
        results.push(result);
        if failed {
            break;
        }
    }
    results
}

/// Run one (test, flavor) scenario to its pass/fail conclusion.
pub fn run_scenario(
    name: &str,
    desc: &TestDescriptor,
    kind: FlavorKind,
    opts: &CycleOptions,
    ctx: &SuiteContext,
) -> RunResult {
    tracing::info!(test = name, flavor = %kind, "running scenario");

    let flavor = match Flavor::new(kind, ctx) {
        Ok(flavor) => flavor,
        Err(e) => return RunResult::fail(name, kind, Step::Start, e, String::new()),
    };
    let mut test = match TestProcess::new(name, desc.clone(), flavor, ctx) {
        Ok(test) => test,
        Err(e) => return RunResult::fail(name, kind, Step::Start, e, String::new()),
    };

    match run_steps(&mut test, opts, ctx) {
        Ok(()) => {
            tracing::info!(test = name, flavor = %kind, "scenario passed");
            RunResult::pass(name, kind)
        }
        Err((step, err)) => {
            tracing::warn!(test = name, flavor = %kind, step = %step, error = %err, "scenario failed");
            let output = test.output();
            // Cleanup failures must not mask the step that actually failed.
            let _ = test.kill(Signal::SIGKILL);
            RunResult::fail(name, kind, step, err, output)
        }
    }
}

fn run_steps(
    test: &mut TestProcess,
    opts: &CycleOptions,
    ctx: &SuiteContext,
) -> Result<(), (Step, SuiteError)> {
    test.start().map_err(|e| (Step::Start, e))?;

    let pid = test.getpid().map_err(|e| (Step::SnapshotPre, e))?;
    let before = VisibleState::capture(pid).map_err(|e| (Step::SnapshotPre, e))?;

    run_cycle(test, opts, ctx).map_err(|e| (Step::Cycle, e))?;

    let pid = test.getpid().map_err(|e| (Step::Compare, e))?;
    let after = VisibleState::capture(pid).map_err(|e| (Step::Compare, e))?;
    VisibleState::compare(&before, &after).map_err(|e| (Step::Compare, e))?;

    test.stop().map_err(|e| (Step::Stop, e))?;
    Ok(())
}

/// Convenience used by tests and the inline launcher.
pub fn all_passed(results: &[RunResult]) -> bool {
    results.iter().all(|r| r.passed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_names_follow_execution_order() {
        let steps = [
            Step::Start,
            Step::SnapshotPre,
            Step::Cycle,
            Step::Compare,
            Step::Stop,
        ];
        let names: Vec<&str> = steps.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["start", "snapshot", "cycle", "compare", "stop"]);
    }

    #[test]
    fn test_fail_result_carries_step_and_output() {
        let result = RunResult::fail(
            "static/pipe00",
            FlavorKind::Host,
            Step::Compare,
            SuiteError::StateMismatch { kind: "maps" },
            "output".to_string(),
        );
        assert!(!result.passed);
        assert_eq!(result.failed_step, Some(Step::Compare));
        assert!(result.error.unwrap().contains("maps"));
    }

    #[test]
    fn test_all_passed() {
        let pass = RunResult::pass("t", FlavorKind::Host);
        let fail = RunResult::fail(
            "t",
            FlavorKind::Host,
            Step::Stop,
            SuiteError::ResultCheck {
                last_line: String::new(),
            },
            String::new(),
        );
        assert!(all_passed(&[pass.clone()]));
        assert!(!all_passed(&[pass, fail]));
    }

    #[test]
    fn test_scenario_fails_at_start_without_suite() {
        // No suite directory and no make targets: the scenario must fail at
        // the start step and still produce a reportable result.
        let ctx = SuiteContext::new(crate::context::SuiteConfig {
            suite_dir: std::path::PathBuf::from("/nonexistent/suite"),
            ..Default::default()
        });
        let result = run_scenario(
            "missing/test",
            &TestDescriptor::default(),
            FlavorKind::Host,
            &CycleOptions::default(),
            &ctx,
        );
        assert!(!result.passed);
        assert_eq!(result.failed_step, Some(Step::Start));
    }
}
