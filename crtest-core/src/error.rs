// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Custom error types for crtest.
//!
//! This module defines explicit enum error types as per coding guidelines.
//! No `Box<dyn Error>`, no `anyhow::Result` - all errors are strongly typed.
//! Every variant is scenario-fatal: the executor never retries a failed step.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type for the crtest suite.
/// All errors are explicit variants - no catch-all or generic handling.
#[derive(Debug, Error)]
pub enum SuiteError {
    // =========================================================================
    // Isolation Flavor Errors
    // =========================================================================
    #[error("environment setup failed: {reason}")]
    EnvironmentSetup { reason: String },

    #[error("flavor teardown failed: {reason}")]
    Teardown { reason: String },

    // =========================================================================
    // Test Process Errors
    // =========================================================================
    #[error("test did not start: {reason}")]
    Start { reason: String },

    #[error("process {pid} ({who}) did not die within {timeout_secs}s")]
    ProcessDidNotDie {
        pid: i32,
        who: String,
        timeout_secs: f64,
    },

    #[error("result check failed: last output line {last_line:?} carries no PASS marker")]
    ResultCheck { last_line: String },

    #[error("build action '{action}' failed for {path}")]
    Build { action: String, path: PathBuf },

    // =========================================================================
    // Checkpoint/Restore Cycle Errors
    // =========================================================================
    #[error("checkpoint tool '{action}' exited with status {status}")]
    CrCommand { action: String, status: i32 },

    // =========================================================================
    // Visible-State Comparator Errors
    // =========================================================================
    #[error("visible state mismatch: {kind} differ across the cycle")]
    StateMismatch { kind: &'static str },

    // =========================================================================
    // Catalog / Dispatch Errors
    // =========================================================================
    #[error("catalog error: {message}")]
    Catalog { message: String },

    #[error("worker job error: {message}")]
    Job { message: String },

    // =========================================================================
    // System Errors
    // =========================================================================
    #[error("IO error: {context} - {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl SuiteError {
    /// Shorthand for wrapping an IO error with context.
    pub fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }
}

/// Result type alias using SuiteError.
pub type SuiteResult<T> = Result<T, SuiteError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cr_command_display_names_action() {
        let err = SuiteError::CrCommand {
            action: "pre-dump".to_string(),
            status: 1,
        };
        assert!(err.to_string().contains("pre-dump"));
        assert!(err.to_string().contains('1'));
    }

    #[test]
    fn test_state_mismatch_display_names_kind() {
        let err = SuiteError::StateMismatch { kind: "fds" };
        assert!(err.to_string().contains("fds"));
    }

    #[test]
    fn test_result_check_display_quotes_line() {
        let err = SuiteError::ResultCheck {
            last_line: "05:32:11 FAIL".to_string(),
        };
        assert!(err.to_string().contains("FAIL"));
    }
}
