// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Test process lifecycle controller.
//!
//! Owns one test binary's lifecycle under a flavor: start through the build
//! collaborator, liveness probing, pid-file discovery, stop with result-marker
//! validation, and signal-plus-backoff death waits. The pid file is written by
//! the test binary itself; for namespaced flavors it is the namespace init pid
//! file, the root of the spawned tree.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::catalog::TestDescriptor;
use crate::context::SuiteContext;
use crate::error::{SuiteError, SuiteResult};
use crate::flavor::Flavor;
use crate::make::MakeRunner;

/// Thread fan-out forced on every spawned test.
const ENV_THREADS: (&str, &str) = ("CRTEST_THREADS", "100");
/// Unprivileged identity for non-suid tests.
const ENV_UID: (&str, &str) = ("CRTEST_UID", "18943");
const ENV_GID: (&str, &str) = ("CRTEST_GID", "58467");
const ENV_GROUPS: (&str, &str) = ("CRTEST_GROUPS", "27495 48244");

/// Literal token a passing test leaves on its last output line.
const PASS_MARKER: &str = "PASS";

/// First death-wait poll interval; doubles each round.
const DEATH_WAIT_START: Duration = Duration::from_millis(100);
/// Total death-wait budget.
const DEATH_WAIT_TIMEOUT: Duration = Duration::from_secs(3);

/// Wait for a pid to die with the default backoff schedule.
pub fn wait_pid_die(pid: Pid, who: &str) -> SuiteResult<()> {
    wait_pid_die_within(pid, who, DEATH_WAIT_TIMEOUT)
}

/// Signal-probe the pid with exponential backoff until it stops being
/// signalable or the budget runs out.
pub fn wait_pid_die_within(pid: Pid, who: &str, timeout: Duration) -> SuiteResult<()> {
    let mut step = DEATH_WAIT_START;
    while step < timeout {
        if kill(pid, None).is_err() {
            return Ok(());
        }
        tracing::debug!(who, pid = pid.as_raw(), wait_secs = step.as_secs_f64(), "waiting for death");
        std::thread::sleep(step);
        step *= 2;
    }
    Err(SuiteError::ProcessDidNotDie {
        pid: pid.as_raw(),
        who: who.to_string(),
        timeout_secs: timeout.as_secs_f64(),
    })
}

/// Read a pid from the first line of a pid file.
pub fn read_pid_file(path: &Path) -> SuiteResult<Pid> {
    let content =
        std::fs::read_to_string(path).map_err(|e| SuiteError::io("reading pid file", e))?;
    let raw = content
        .lines()
        .next()
        .unwrap_or("")
        .trim()
        .parse::<i32>()
        .map_err(|_| SuiteError::Start {
            reason: format!("pid file {} holds no pid", path.display()),
        })?;
    Ok(Pid::from_raw(raw))
}

/// Last line of a file, used for the trailing result marker.
pub fn tail_line(path: &Path) -> SuiteResult<String> {
    let content =
        std::fs::read_to_string(path).map_err(|e| SuiteError::io("reading test output", e))?;
    Ok(content.lines().last().unwrap_or("").to_string())
}

/// Absolute path for a file that may not exist yet: canonicalize the parent
/// and reattach the file name.
fn realize(path: &Path) -> SuiteResult<PathBuf> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let name = path.file_name().ok_or_else(|| SuiteError::Start {
        reason: format!("{} has no file name", path.display()),
    })?;
    let parent = std::fs::canonicalize(parent).map_err(|e| SuiteError::Start {
        reason: format!("cannot resolve {}: {}", parent.display(), e),
    })?;
    Ok(parent.join(name))
}

/// Per-test artifact path: `<test path>.<suffix>`.
fn artifact_path(test_path: &Path, suffix: &str) -> PathBuf {
    PathBuf::from(format!("{}.{}", test_path.display(), suffix))
}

/// Pid file for a test: the namespace init pid file under namespaced flavors,
/// a plain pid file otherwise.
fn pidfile_path(test_path: &Path, namespaced: bool) -> PathBuf {
    if namespaced {
        artifact_path(test_path, "init.pid")
    } else {
        artifact_path(test_path, "pid")
    }
}

/// Child environment for a test spawn.
fn start_env(
    desc: &TestDescriptor,
    flavor: &Flavor,
    pidfile: &Path,
) -> SuiteResult<Vec<(&'static str, String)>> {
    let mut env = vec![(ENV_THREADS.0, ENV_THREADS.1.to_string())];

    if desc.has_flag("suid") {
        tracing::debug!("test is SUID, keeping privileged identity");
    } else {
        env.push((ENV_UID.0, ENV_UID.1.to_string()));
        env.push((ENV_GID.0, ENV_GID.1.to_string()));
        env.push((ENV_GROUPS.0, ENV_GROUPS.1.to_string()));
    }

    if let Some(root) = flavor.root() {
        env.push(("CRTEST_NEWNS", "1".to_string()));
        env.push((
            "CRTEST_PIDFILE",
            realize(pidfile)?.display().to_string(),
        ));
        env.push(("CRTEST_ROOT", root.display().to_string()));
        if flavor.kind().user_ns() {
            env.push(("CRTEST_USERNS", "1".to_string()));
        }
    }

    Ok(env)
}

/// Whether a self-check hook next to the test asks for a skip.
///
/// The hook is `<path>.checkskip`; an executable hook exiting non-zero means
/// skip, everything else means run.
pub fn checkskip(test_path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    let hook = artifact_path(test_path, "checkskip");
    let executable = hook
        .metadata()
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false);
    if !executable {
        return false;
    }

    match Command::new(&hook).status() {
        Ok(status) if status.success() => false,
        _ => true,
    }
}

/// A running instance of a test binary under a flavor.
pub struct TestProcess {
    name: String,
    desc: TestDescriptor,
    flavor: Flavor,
    path: PathBuf,
    pid: Option<Pid>,
    make: MakeRunner,
}

impl TestProcess {
    /// Bind a controller to a test, clearing stale artifacts first.
    pub fn new(
        name: &str,
        desc: TestDescriptor,
        flavor: Flavor,
        ctx: &SuiteContext,
    ) -> SuiteResult<Self> {
        let path = ctx.test_path(name);
        let make = MakeRunner;
        make.action(&path, "cleanout", &[], None)?;

        Ok(Self {
            name: name.to_string(),
            desc,
            flavor,
            path,
            pid: None,
            make,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flavor(&self) -> &Flavor {
        &self.flavor
    }

    fn pidfile(&self) -> PathBuf {
        pidfile_path(&self.path, self.flavor.kind().is_namespaced())
    }

    /// Start the test binary and probe that it came up alive.
    pub fn start(&mut self) -> SuiteResult<()> {
        self.flavor.prepare(&self.path)?;

        tracing::info!(test = %self.name, flavor = %self.flavor.kind(), "starting test");

        let env = start_env(&self.desc, &self.flavor, &self.pidfile())?;
        self.make
            .action(&self.path, "pid", &env, self.flavor.root())
            .map_err(|e| SuiteError::Start {
                reason: e.to_string(),
            })?;

        let pid = self.getpid()?;
        kill(pid, None).map_err(|e| SuiteError::Start {
            reason: format!("test pid {} is not alive: {}", pid, e),
        })
    }

    /// Lazily read the pid from the pid file.
    pub fn getpid(&mut self) -> SuiteResult<Pid> {
        if let Some(pid) = self.pid {
            return Ok(pid);
        }
        let pid = read_pid_file(&self.pidfile())?;
        self.pid = Some(pid);
        Ok(pid)
    }

    /// Mark the process as gone: wait for death, clear the cached pid and
    /// drop the pid file on forced kills and namespaced runs.
    pub fn gone(&mut self, force: bool) -> SuiteResult<()> {
        if let Some(pid) = self.pid {
            wait_pid_die(pid, &self.name)?;
        }
        self.pid = None;

        if force || self.flavor.kind().is_namespaced() {
            match std::fs::remove_file(self.pidfile()) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(SuiteError::io("removing pid file", e)),
            }
        }
        Ok(())
    }

    /// Send a signal, confirm death and tear the flavor down.
    pub fn kill(&mut self, sig: Signal) -> SuiteResult<()> {
        if let Some(pid) = self.pid {
            let _ = kill(pid, sig);
            self.gone(sig == Signal::SIGKILL)?;
        }
        self.flavor.teardown()
    }

    /// Stop the test and validate the trailing PASS marker of its output.
    pub fn stop(&mut self) -> SuiteResult<()> {
        tracing::info!(test = %self.name, "stopping test");
        self.kill(Signal::SIGTERM)?;

        let last = tail_line(&artifact_path(&self.path, "out"))?;
        if last.split_whitespace().any(|w| w == PASS_MARKER) {
            Ok(())
        } else {
            Err(SuiteError::ResultCheck { last_line: last })
        }
    }

    /// The recorded output of the test, for failure diagnostics.
    pub fn output(&self) -> String {
        std::fs::read_to_string(artifact_path(&self.path, "out")).unwrap_or_default()
    }

    /// Options every checkpoint invocation against this test must carry.
    pub fn cr_opts(&mut self) -> SuiteResult<Vec<String>> {
        let mut opts = self.desc.extra_opts();
        opts.push("--pidfile".to_string());
        opts.push(realize(&self.pidfile())?.display().to_string());
        if let Some(root) = self.flavor.root() {
            opts.push("--root".to_string());
            opts.push(root.display().to_string());
        }
        Ok(opts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tempfile::TempDir;

    use crate::flavor::FlavorKind;

    // Tests never mount anything, flavors only carry paths here.
    fn make_flavor(kind: FlavorKind) -> Flavor {
        let ctx = SuiteContext::new(crate::context::SuiteConfig::default());
        Flavor::new(kind, &ctx).unwrap()
    }

    #[test]
    fn test_artifact_and_pidfile_paths() {
        let path = Path::new("suite/static/pipe00");
        assert_eq!(
            artifact_path(path, "out"),
            PathBuf::from("suite/static/pipe00.out")
        );
        assert_eq!(
            pidfile_path(path, false),
            PathBuf::from("suite/static/pipe00.pid")
        );
        assert_eq!(
            pidfile_path(path, true),
            PathBuf::from("suite/static/pipe00.init.pid")
        );
    }

    #[test]
    fn test_read_pid_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.pid");
        std::fs::write(&path, "4242\n").unwrap();
        assert_eq!(read_pid_file(&path).unwrap(), Pid::from_raw(4242));

        std::fs::write(&path, "not-a-pid\n").unwrap();
        assert!(matches!(
            read_pid_file(&path).unwrap_err(),
            SuiteError::Start { .. }
        ));
    }

    #[test]
    fn test_tail_line_returns_last_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.out");
        std::fs::write(&path, "starting\nworking\n12:00:01 PASS\n").unwrap();
        assert_eq!(tail_line(&path).unwrap(), "12:00:01 PASS");
    }

    #[test]
    fn test_wait_pid_die_on_reaped_child() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = Pid::from_raw(child.id() as i32);
        child.wait().unwrap();
        wait_pid_die(pid, "true").unwrap();
    }

    #[test]
    fn test_wait_pid_die_times_out_on_live_process() {
        let own = Pid::from_raw(std::process::id() as i32);
        let start = Instant::now();
        let err = wait_pid_die_within(own, "self", Duration::from_millis(300)).unwrap_err();
        assert!(matches!(err, SuiteError::ProcessDidNotDie { .. }));
        // 0.1 + 0.2 of sleeping, with headroom for slow machines.
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_start_env_unprivileged_identity() {
        let dir = TempDir::new().unwrap();
        let pidfile = dir.path().join("t.pid");
        let flavor = make_flavor(FlavorKind::Host);

        let env = start_env(&TestDescriptor::default(), &flavor, &pidfile).unwrap();
        let keys: Vec<&str> = env.iter().map(|(k, _)| *k).collect();
        assert!(keys.contains(&"CRTEST_THREADS"));
        assert!(keys.contains(&"CRTEST_UID"));
        assert!(keys.contains(&"CRTEST_GROUPS"));
        assert!(!keys.contains(&"CRTEST_NEWNS"));
    }

    #[test]
    fn test_start_env_suid_keeps_identity() {
        let dir = TempDir::new().unwrap();
        let pidfile = dir.path().join("t.pid");
        let flavor = make_flavor(FlavorKind::Host);
        let desc = TestDescriptor {
            flags: "suid".to_string(),
            ..TestDescriptor::default()
        };

        let env = start_env(&desc, &flavor, &pidfile).unwrap();
        assert!(!env.iter().any(|(k, _)| *k == "CRTEST_UID"));
    }

    #[test]
    fn test_start_env_namespaced_requests() {
        let dir = TempDir::new().unwrap();
        let pidfile = dir.path().join("t.init.pid");
        let flavor = make_flavor(FlavorKind::Namespaced { user_ns: true });

        let env = start_env(&TestDescriptor::default(), &flavor, &pidfile).unwrap();
        let get = |key: &str| {
            env.iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.clone())
        };
        assert_eq!(get("CRTEST_NEWNS").as_deref(), Some("1"));
        assert_eq!(get("CRTEST_USERNS").as_deref(), Some("1"));
        assert!(get("CRTEST_PIDFILE").unwrap().ends_with("t.init.pid"));
        assert!(get("CRTEST_ROOT").is_some());
    }

    #[test]
    fn test_checkskip_without_hook_runs() {
        let dir = TempDir::new().unwrap();
        assert!(!checkskip(&dir.path().join("sometest")));
    }

    #[test]
    fn test_checkskip_hook_exit_status() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let test_path = dir.path().join("sometest");
        let hook = dir.path().join("sometest.checkskip");

        std::fs::write(&hook, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&hook, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert!(!checkskip(&test_path));

        std::fs::write(&hook, "#!/bin/sh\nexit 1\n").unwrap();
        assert!(checkskip(&test_path));
    }
}
