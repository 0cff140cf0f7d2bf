// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Checkpoint/restore cycle driver.
//!
//! Issues dump, pre-dump, restore and page-server operations against a
//! running test through the external checkpoint/restore binary. Every
//! operation gets a fresh numbered image directory under a per-test,
//! per-pid base; iteration N > 1 chains to iteration N-1 as an incremental
//! base with memory-change tracking. All tool invocations are fail-fast.

use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};

use crate::context::SuiteContext;
use crate::error::{SuiteError, SuiteResult};
use crate::process::{read_pid_file, wait_pid_die, TestProcess};

/// Port the page-server side channel listens on.
const PAGE_SERVER_PORT: &str = "12345";
/// Page-server pid file inside the image directory.
const PAGE_SERVER_PIDFILE: &str = "ps.pid";

/// Options steering one dump/restore sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleOptions {
    /// Outer dump/restore passes.
    pub iters: u32,
    /// Pre-dumps before each final dump.
    pub pre: u32,
    /// Dump with --leave-running instead of killing and restoring.
    pub leave_running: bool,
    /// Route memory pages through a page-server daemon.
    pub page_server: bool,
    /// Skip the cycle entirely, only exercising the test itself.
    pub nocr: bool,
}

impl Default for CycleOptions {
    fn default() -> Self {
        Self {
            iters: 1,
            pre: 0,
            leave_running: false,
            page_server: false,
            nocr: false,
        }
    }
}

/// Invoker for the external checkpoint/restore binary.
#[derive(Debug, Clone)]
pub struct CrTool {
    path: PathBuf,
}

impl CrTool {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn run(&self, action: &str, args: &[String]) -> SuiteResult<i32> {
        tracing::info!(action, ?args, "running checkpoint tool");
        let status = Command::new(&self.path)
            .arg(action)
            .args(args)
            .status()
            .map_err(|e| SuiteError::io("spawning checkpoint tool", e))?;
        Ok(status.code().unwrap_or(-1))
    }

    /// Run an action against an image directory, fail-fast on non-zero exit.
    ///
    /// Every action logs to its own file inside the image directory and runs
    /// at full verbosity for post-mortem debugging.
    pub fn exec(
        &self,
        action: &str,
        image_dir: &Path,
        log: &str,
        opts: &[String],
    ) -> SuiteResult<()> {
        let mut args = vec![
            "-o".to_string(),
            log.to_string(),
            "-D".to_string(),
            image_dir.display().to_string(),
            "-v4".to_string(),
        ];
        args.extend_from_slice(opts);

        let status = self.run(action, &args)?;
        if status != 0 {
            return Err(SuiteError::CrCommand {
                action: action.to_string(),
                status,
            });
        }
        Ok(())
    }

    /// Lightweight capability check for a named feature.
    pub fn check(&self, feature: &str) -> SuiteResult<bool> {
        let args = vec![
            "-v0".to_string(),
            "--feature".to_string(),
            feature.to_string(),
        ];
        Ok(self.run("check", &args)? == 0)
    }
}

/// One dump/restore sequence against a running test.
pub struct CycleSession {
    tool: CrTool,
    base: PathBuf,
    iter: u32,
    page_server: bool,
}

impl CycleSession {
    /// Open a session, creating the per-test, per-pid dump base directory.
    pub fn new(ctx: &SuiteContext, test: &mut TestProcess, page_server: bool) -> SuiteResult<Self> {
        let pid = test.getpid()?;
        let base = ctx
            .output_dir()
            .join(test.name())
            .join(pid.as_raw().to_string());
        std::fs::create_dir_all(&base).map_err(|e| SuiteError::io("creating dump base dir", e))?;

        Ok(Self {
            tool: ctx.tool(),
            base,
            iter: 0,
            page_server,
        })
    }

    /// Image directory of the current iteration. Meaningless before the
    /// first dump has bumped the counter to 1.
    fn image_dir(&self) -> PathBuf {
        self.base.join(self.iter.to_string())
    }

    /// Dump the test into a fresh numbered image directory.
    ///
    /// `action` is either `dump` or `pre-dump`; `extra` carries per-call
    /// options such as `--leave-running`.
    pub fn dump(&mut self, action: &str, extra: &[String], test: &mut TestProcess) -> SuiteResult<()> {
        self.iter += 1;
        let image_dir = self.image_dir();
        std::fs::create_dir(&image_dir).map_err(|e| SuiteError::io("creating image dir", e))?;

        let mut opts = dump_args(test.getpid()?.as_raw(), self.iter);

        if self.page_server {
            tracing::info!("starting page server");
            self.tool.exec(
                "page-server",
                &image_dir,
                "page-server.log",
                &[
                    "--port".to_string(),
                    PAGE_SERVER_PORT.to_string(),
                    "--daemon".to_string(),
                    "--pidfile".to_string(),
                    PAGE_SERVER_PIDFILE.to_string(),
                ],
            )?;
            opts.extend([
                "--page-server".to_string(),
                "--address".to_string(),
                "127.0.0.1".to_string(),
                "--port".to_string(),
                PAGE_SERVER_PORT.to_string(),
            ]);
        }

        opts.extend_from_slice(extra);
        opts.extend(test.cr_opts()?);

        self.tool
            .exec(action, &image_dir, &format!("{}.log", action), &opts)?;

        if self.page_server {
            let ps_pid = read_pid_file(&image_dir.join(PAGE_SERVER_PIDFILE))?;
            wait_pid_die(ps_pid, "page server")?;
        }
        Ok(())
    }

    /// Restore the test from the current iteration's images, detached.
    pub fn restore(&self, test: &mut TestProcess) -> SuiteResult<()> {
        let mut opts = vec!["--restore-detached".to_string()];
        opts.extend(test.cr_opts()?);
        self.tool
            .exec("restore", &self.image_dir(), "restore.log", &opts)
    }
}

/// Per-dump target arguments; iterations past the first chain to the
/// previous image directory as an incremental base.
fn dump_args(pid: i32, iter: u32) -> Vec<String> {
    let mut args = vec!["-t".to_string(), pid.to_string()];
    if iter > 1 {
        args.extend([
            "--prev-images-dir".to_string(),
            format!("../{}", iter - 1),
            "--track-mem".to_string(),
        ]);
    }
    args
}

/// Drive the full dump/restore sequence for one running test.
pub fn run_cycle(
    test: &mut TestProcess,
    opts: &CycleOptions,
    ctx: &SuiteContext,
) -> SuiteResult<()> {
    if opts.nocr {
        return Ok(());
    }

    let mut session = CycleSession::new(ctx, test, opts.page_server)?;

    for _ in 0..opts.iters.max(1) {
        for _ in 0..opts.pre {
            session.dump("pre-dump", &[], test)?;
        }

        if opts.leave_running {
            session.dump("dump", &["--leave-running".to_string()], test)?;
        } else {
            session.dump("dump", &[], test)?;
            test.gone(true)?;
            session.restore(test)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_dump_targets_pid_only() {
        assert_eq!(dump_args(1234, 1), vec!["-t", "1234"]);
    }

    #[test]
    fn test_later_dumps_chain_to_previous_iteration() {
        assert_eq!(
            dump_args(1234, 2),
            vec!["-t", "1234", "--prev-images-dir", "../1", "--track-mem"]
        );
        assert_eq!(
            dump_args(1234, 5),
            vec!["-t", "1234", "--prev-images-dir", "../4", "--track-mem"]
        );
    }

    #[test]
    fn test_cycle_options_defaults() {
        let opts = CycleOptions::default();
        assert_eq!(opts.iters, 1);
        assert_eq!(opts.pre, 0);
        assert!(!opts.leave_running);
        assert!(!opts.page_server);
        assert!(!opts.nocr);
    }

    #[test]
    fn test_cycle_options_serde_round_trip() {
        let opts = CycleOptions {
            iters: 3,
            pre: 2,
            leave_running: true,
            page_server: true,
            nocr: false,
        };
        let json = serde_json::to_string(&opts).unwrap();
        let back: CycleOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(back.iters, 3);
        assert_eq!(back.pre, 2);
        assert!(back.leave_running);
        assert!(back.page_server);
    }

    #[test]
    fn test_image_dirs_follow_the_iteration_counter() {
        let mut session = CycleSession {
            tool: CrTool::new("/nonexistent/criu"),
            base: PathBuf::from("/tmp/dump/t/42"),
            iter: 0,
            page_server: false,
        };

        session.iter += 1;
        assert_eq!(session.image_dir(), PathBuf::from("/tmp/dump/t/42/1"));
        session.iter += 1;
        assert_eq!(session.image_dir(), PathBuf::from("/tmp/dump/t/42/2"));
    }

    #[test]
    fn test_missing_tool_check_is_io_error() {
        let tool = CrTool::new("/nonexistent/criu");
        assert!(matches!(
            tool.check("mnt_ns").unwrap_err(),
            SuiteError::Io { .. }
        ));
    }
}
