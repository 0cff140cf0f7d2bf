// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Process-scoped suite context.
//!
//! Holds the state that is shared across all test runs inside one process:
//! the lazily-created isolation root for namespaced flavors and the memoized
//! checkpoint-tool feature cache. Worker subprocesses each build their own
//! context from the job payload, so races on first use only cost a redundant
//! computation, never correctness.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tempfile::TempDir;

use crate::cycle::CrTool;
use crate::error::{SuiteError, SuiteResult};

/// Configuration knobs shared by every component.
///
/// Serialized into worker job payloads so pooled workers resolve the same
/// paths as the launcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteConfig {
    /// Path to the external checkpoint/restore binary.
    pub tool_path: PathBuf,
    /// Directory the test binaries live under.
    pub suite_dir: PathBuf,
    /// Base directory for per-test dump image trees.
    pub output_dir: PathBuf,
}

impl Default for SuiteConfig {
    fn default() -> Self {
        Self {
            tool_path: PathBuf::from("criu"),
            suite_dir: PathBuf::from("suite"),
            output_dir: PathBuf::from("dump"),
        }
    }
}

/// Process-wide context injected into flavors and the scheduler.
pub struct SuiteContext {
    config: SuiteConfig,
    /// Shared root dir for namespaced flavors. Owned so it is removed when
    /// the process exits, after the lazy unmounts have detached.
    isolation_root: Mutex<Option<TempDir>>,
    /// Memoized per-feature capability checks.
    features: Mutex<HashMap<String, bool>>,
}

impl SuiteContext {
    pub fn new(config: SuiteConfig) -> Self {
        Self {
            config,
            isolation_root: Mutex::new(None),
            features: Mutex::new(HashMap::new()),
        }
    }

    pub fn suite_dir(&self) -> &Path {
        &self.config.suite_dir
    }

    pub fn output_dir(&self) -> &Path {
        &self.config.output_dir
    }

    pub fn config(&self) -> &SuiteConfig {
        &self.config
    }

    /// Invoker for the external checkpoint/restore binary.
    pub fn tool(&self) -> CrTool {
        CrTool::new(&self.config.tool_path)
    }

    /// Path of a test binary inside the suite directory.
    pub fn test_path(&self, name: &str) -> PathBuf {
        self.config.suite_dir.join(name)
    }

    /// The shared isolation root, created on first use.
    ///
    /// All namespaced test runs in this process bind their private mount
    /// views over this one directory.
    pub fn isolation_root(&self) -> SuiteResult<PathBuf> {
        let mut guard = self
            .isolation_root
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        if guard.is_none() {
            let dir = tempfile::Builder::new()
                .prefix("crtest-root-")
                .tempdir_in("/tmp")
                .map_err(|e| SuiteError::EnvironmentSetup {
                    reason: format!("cannot create isolation root: {}", e),
                })?;
            tracing::info!(root = %dir.path().display(), "created shared isolation root");
            *guard = Some(dir);
        }

        guard
            .as_ref()
            .map(|d| d.path().to_path_buf())
            .ok_or(SuiteError::EnvironmentSetup {
                reason: "isolation root vanished".to_string(),
            })
    }

    /// Whether the checkpoint tool supports a feature, memoized per name.
    pub fn check_feature(&self, feature: &str) -> SuiteResult<bool> {
        {
            let cache = self.features.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(&known) = cache.get(feature) {
                return Ok(known);
            }
        }

        tracing::info!(feature, "checking checkpoint tool feature");
        let available = self.tool().check(feature)?;

        let mut cache = self.features.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(feature.to_string(), available);
        Ok(available)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_paths() {
        let cfg = SuiteConfig::default();
        assert_eq!(cfg.tool_path, PathBuf::from("criu"));
        assert_eq!(cfg.output_dir, PathBuf::from("dump"));
    }

    #[test]
    fn test_isolation_root_is_a_singleton() {
        let ctx = SuiteContext::new(SuiteConfig::default());
        let first = ctx.isolation_root().unwrap();
        let second = ctx.isolation_root().unwrap();
        assert_eq!(first, second);
        assert!(first.starts_with("/tmp"));
        assert!(first.exists());
    }

    #[test]
    fn test_test_path_joins_suite_dir() {
        let ctx = SuiteContext::new(SuiteConfig {
            suite_dir: PathBuf::from("/work/suite"),
            ..SuiteConfig::default()
        });
        assert_eq!(
            ctx.test_path("static/pipe00"),
            PathBuf::from("/work/suite/static/pipe00")
        );
    }
}
