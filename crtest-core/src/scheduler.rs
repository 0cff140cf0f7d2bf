// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Scheduler and bounded-concurrency launcher.
//!
//! Selection walks the requested test set and drops tests excluded by
//! pattern, declared for a different architecture, gated on a missing
//! checkpoint-tool feature, or skipped by their own self-check hook; the
//! survivors' declared flavors are intersected with the requested flavor set.
//! Execution is either inline (synchronous, abort on first failure) or fanned
//! out across a bounded pool of worker subprocesses, each handed one typed
//! job description and reaped into an aggregate pass/fail verdict.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::catalog::{Catalog, TestDescriptor};
use crate::context::{SuiteConfig, SuiteContext};
use crate::cycle::CycleOptions;
use crate::error::{SuiteError, SuiteResult};
use crate::flavor::FlavorKind;
use crate::process::checkskip;
use crate::scenario::{all_passed, run_unit};

/// Flavor set used when the caller does not narrow it down.
const DEFAULT_FLAVOR_REQUEST: &str = "h,ns,uns";

/// What to run and how.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Run every catalogued test.
    pub all: bool,
    /// Explicit test names, used when `all` is false.
    pub tests: Vec<String>,
    /// Comma-separated requested flavor names.
    pub flavor: Option<String>,
    /// Exclusion patterns, joined into one alternation.
    pub exclude: Vec<String>,
    /// Cycle options shipped to every unit.
    pub cycle: CycleOptions,
    /// Worker pool size; 0 runs units inline.
    pub parallel: u32,
}

/// Typed job description handed to a worker subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub test: String,
    pub desc: TestDescriptor,
    /// Flavor names to run, already intersected with the request.
    pub flavors: Vec<String>,
    pub cycle: CycleOptions,
    pub config: SuiteConfig,
}

impl Job {
    pub fn to_json(&self) -> SuiteResult<String> {
        serde_json::to_string(self).map_err(|e| SuiteError::Job {
            message: format!("serializing job: {}", e),
        })
    }

    pub fn from_json(payload: &str) -> SuiteResult<Self> {
        serde_json::from_str(payload).map_err(|e| SuiteError::Job {
            message: format!("parsing job: {}", e),
        })
    }

    pub fn flavor_kinds(&self) -> Vec<FlavorKind> {
        self.flavors
            .iter()
            .filter_map(|name| FlavorKind::from_name(name))
            .collect()
    }
}

/// Run one job to completion in this process, reporting each result.
pub fn run_job(job: &Job, ctx: &SuiteContext) -> bool {
    let results = run_unit(&job.test, &job.desc, &job.flavor_kinds(), &job.cycle, ctx);
    for result in &results {
        result.report();
    }
    all_passed(&results)
}

/// Compile the exclusion patterns into one alternation, if any.
fn build_exclude(patterns: &[String]) -> SuiteResult<Option<Regex>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let joined = format!(".*({})", patterns.join("|"));
    let regex = Regex::new(&joined).map_err(|e| SuiteError::Catalog {
        message: format!("bad exclusion pattern: {}", e),
    })?;
    tracing::debug!(pattern = %joined, "compiled exclusion list");
    Ok(Some(regex))
}

/// Intersect a test's declared flavors with the requested set, keeping the
/// declaration order.
fn select_flavors(desc: &TestDescriptor, requested: &[&str]) -> Vec<FlavorKind> {
    desc.flavors()
        .into_iter()
        .filter(|name| requested.contains(name))
        .filter_map(FlavorKind::from_name)
        .collect()
}

/// Whether a test's declared architecture matches the machine we run on.
fn arch_matches(desc: &TestDescriptor) -> bool {
    match &desc.arch {
        Some(arch) => arch == std::env::consts::ARCH,
        None => true,
    }
}

/// Select the (test, flavor-set) units a run will execute.
pub fn select_units(
    opts: &RunOptions,
    catalog: &Catalog,
    ctx: &SuiteContext,
) -> SuiteResult<Vec<Job>> {
    let torun: Vec<String> = if opts.all {
        catalog.names().map(str::to_string).collect()
    } else if !opts.tests.is_empty() {
        opts.tests.clone()
    } else {
        return Err(SuiteError::Catalog {
            message: "no tests selected: pass explicit names or run all".to_string(),
        });
    };

    let exclude = build_exclude(&opts.exclude)?;
    let requested: Vec<&str> = opts
        .flavor
        .as_deref()
        .unwrap_or(DEFAULT_FLAVOR_REQUEST)
        .split(',')
        .filter(|name| !name.is_empty())
        .collect();

    let mut units = Vec::new();
    for name in torun {
        if let Some(regex) = &exclude {
            if regex.is_match(&name) {
                tracing::info!(test = %name, "skipping (excluded)");
                continue;
            }
        }

        let desc = catalog.get(&name);
        if !arch_matches(&desc) {
            tracing::info!(test = %name, arch = desc.arch.as_deref(), "skipping (arch)");
            continue;
        }
        if let Some(feature) = &desc.feature {
            if !ctx.check_feature(feature)? {
                tracing::info!(test = %name, feature, "skipping (missing feature)");
                continue;
            }
        }
        if checkskip(&ctx.test_path(&name)) {
            tracing::info!(test = %name, "skipping (self check)");
            continue;
        }

        let flavors = select_flavors(&desc, &requested);
        if flavors.is_empty() {
            continue;
        }

        units.push(Job {
            test: name,
            desc,
            flavors: flavors.iter().map(|k| k.name().to_string()).collect(),
            cycle: opts.cycle.clone(),
            config: ctx.config().clone(),
        });
    }
    Ok(units)
}

struct Worker {
    child: Child,
    log: PathBuf,
}

/// Bounded pool of worker subprocesses, or an inline executor when the
/// pool size is zero.
pub struct Launcher {
    max: u32,
    workers: HashMap<u32, Worker>,
    fail: bool,
    /// Worker command template; the serialized job is appended as the final
    /// argument. Absent means re-executing the current binary's worker
    /// entry point.
    command: Option<(PathBuf, Vec<String>)>,
}

impl Launcher {
    pub fn new(max: u32) -> Self {
        Self {
            max,
            workers: HashMap::new(),
            fail: false,
            command: None,
        }
    }

    /// Pool driven by an explicit worker command instead of the current
    /// binary.
    pub fn with_command(max: u32, program: impl Into<PathBuf>, args: &[&str]) -> Self {
        Self {
            max,
            workers: HashMap::new(),
            fail: false,
            command: Some((program.into(), args.iter().map(|a| a.to_string()).collect())),
        }
    }

    fn worker_command(&self) -> SuiteResult<Command> {
        match &self.command {
            Some((program, args)) => {
                let mut cmd = Command::new(program);
                cmd.args(args);
                Ok(cmd)
            }
            None => {
                let exe = std::env::current_exe()
                    .map_err(|e| SuiteError::io("resolving worker executable", e))?;
                let mut cmd = Command::new(exe);
                cmd.arg("worker").arg("--job");
                Ok(cmd)
            }
        }
    }

    /// Whether any unit has failed so far.
    pub fn failed(&self) -> bool {
        self.fail
    }

    /// Dispatch one unit, inline or to a pooled worker.
    pub fn launch(&mut self, job: &Job, ctx: &SuiteContext) -> SuiteResult<()> {
        if self.max == 0 {
            if !run_job(job, ctx) {
                self.fail = true;
            }
            return Ok(());
        }

        if self.workers.len() >= self.max as usize {
            self.reap_blocking()?;
        }

        let log = PathBuf::from(format!("{}.log", job.test.replace('/', "_")));
        let logfile = std::fs::File::create(&log)
            .map_err(|e| SuiteError::io("creating worker log", e))?;
        let errfile = logfile
            .try_clone()
            .map_err(|e| SuiteError::io("creating worker log", e))?;

        let child = self
            .worker_command()?
            .arg(job.to_json()?)
            .stdin(Stdio::null())
            .stdout(logfile)
            .stderr(errfile)
            .spawn()
            .map_err(|e| SuiteError::io("spawning worker", e))?;

        tracing::debug!(test = %job.test, worker = child.id(), "dispatched worker");
        self.workers.insert(child.id(), Worker { child, log });
        Ok(())
    }

    /// Non-blocking sweep over the pool; true when anything was reaped.
    fn reap_ready(&mut self) -> SuiteResult<bool> {
        let mut done: Vec<(u32, ExitStatus)> = Vec::new();
        for (id, worker) in self.workers.iter_mut() {
            if let Some(status) = worker
                .child
                .try_wait()
                .map_err(|e| SuiteError::io("reaping worker", e))?
            {
                done.push((*id, status));
            }
        }

        let reaped = !done.is_empty();
        for (id, status) in done {
            if let Some(worker) = self.workers.remove(&id) {
                self.finish_worker(&worker, status);
            }
        }
        Ok(reaped)
    }

    /// Block until at least one worker has been reaped.
    ///
    /// Sweeps the pool non-blocking first, then parks in a blocking wait on
    /// one worker; anything else that exits in the meantime is picked up by
    /// the next sweep.
    fn reap_blocking(&mut self) -> SuiteResult<()> {
        if self.reap_ready()? {
            return Ok(());
        }
        let Some(id) = self.workers.keys().next().copied() else {
            return Ok(());
        };
        if let Some(mut worker) = self.workers.remove(&id) {
            let status = worker
                .child
                .wait()
                .map_err(|e| SuiteError::io("reaping worker", e))?;
            self.finish_worker(&worker, status);
        }
        Ok(())
    }

    /// Flush a worker's buffered log into the aggregate stream and record
    /// its verdict.
    fn finish_worker(&mut self, worker: &Worker, status: ExitStatus) {
        if !status.success() {
            self.fail = true;
        }
        match std::fs::read_to_string(&worker.log) {
            Ok(log) => print!("{}", log),
            Err(e) => tracing::warn!(log = %worker.log.display(), error = %e, "lost worker log"),
        }
        let _ = std::fs::remove_file(&worker.log);
    }

    /// Drain every remaining worker and report the aggregate verdict.
    pub fn finish(&mut self) -> SuiteResult<bool> {
        while !self.workers.is_empty() {
            self.reap_blocking()?;
        }
        Ok(!self.fail)
    }
}

/// Run the selected test set; true means every unit passed.
pub fn run_tests(opts: &RunOptions, catalog: &Catalog, ctx: &SuiteContext) -> SuiteResult<bool> {
    let units = select_units(opts, catalog, ctx)?;
    tracing::info!(units = units.len(), parallel = opts.parallel, "scheduling test units");

    let mut launcher = Launcher::new(opts.parallel);
    for job in &units {
        if launcher.failed() {
            tracing::warn!("failure recorded, not dispatching further units");
            break;
        }
        launcher.launch(job, ctx)?;
    }
    launcher.finish()
}
