// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! External build-system collaborator.
//!
//! Every test binary is built and driven through per-action make targets
//! (`<name>.pid`, `<name>.cleanout`, ...). Only the exit status is consulted.

use std::path::Path;
use std::process::Command;

use crate::error::{SuiteError, SuiteResult};

/// Invoker for the test suite's make-based build system.
#[derive(Debug, Default)]
pub struct MakeRunner;

impl MakeRunner {
    /// Run `make -C <dir> <base>.<action>` for the given test path.
    ///
    /// `env` entries are added on top of the inherited environment; `cwd`
    /// overrides the working directory (namespaced runs start from the
    /// isolation root).
    pub fn action(
        &self,
        test_path: &Path,
        action: &str,
        env: &[(&str, String)],
        cwd: Option<&Path>,
    ) -> SuiteResult<()> {
        let dir = test_path.parent().unwrap_or_else(|| Path::new("."));
        let base = test_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| SuiteError::Build {
                action: action.to_string(),
                path: test_path.to_path_buf(),
            })?;
        let target = format!("{}.{}", base, action);

        let mut cmd = Command::new("make");
        cmd.arg("--no-print-directory")
            .arg("-C")
            .arg(dir)
            .arg(&target);
        for (key, value) in env {
            cmd.env(key, value);
        }
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }

        tracing::debug!(dir = %dir.display(), target, "running make action");

        let status = cmd.status().map_err(|e| SuiteError::io("spawning make", e))?;
        if !status.success() {
            return Err(SuiteError::Build {
                action: action.to_string(),
                path: test_path.to_path_buf(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_missing_target_is_build_error() {
        let runner = MakeRunner;
        let err = runner
            .action(Path::new("/nonexistent/dir/test"), "pid", &[], None)
            .unwrap_err();
        // make either fails to chdir or fails on the target; both surface
        // as a build failure or a spawn error, never success.
        assert!(matches!(
            err,
            SuiteError::Build { .. } | SuiteError::Io { .. }
        ));
    }

    #[test]
    fn test_empty_path_is_build_error() {
        let runner = MakeRunner;
        let err = runner
            .action(&PathBuf::from("/"), "cleanout", &[], None)
            .unwrap_err();
        assert!(matches!(err, SuiteError::Build { action, .. } if action == "cleanout"));
    }
}
