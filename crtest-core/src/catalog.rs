// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Test-case catalog: a static YAML mapping of test name to metadata.
//!
//! Each entry carries flags, a required checkpoint-tool feature, the
//! architecture the test applies to, the flavor set it may run under, and
//! extra options passed to every dump/restore invocation. Entries with no
//! body resolve to the default (empty) descriptor.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{SuiteError, SuiteResult};

/// Flavor set a test runs under when the catalog does not say otherwise.
const DEFAULT_FLAVORS: &str = "h ns uns";

/// Static metadata for one named test.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestDescriptor {
    /// Space-separated flag words, e.g. "suid".
    pub flags: String,
    /// Checkpoint-tool feature the test requires, if any.
    pub feature: Option<String>,
    /// Architecture the test applies to; absent means any.
    pub arch: Option<String>,
    /// Space-separated flavor names the test may run under.
    pub flavor: Option<String>,
    /// Space-separated extra options for every checkpoint invocation.
    pub opts: String,
}

impl TestDescriptor {
    /// Whether the descriptor declares the given flag word.
    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.split_whitespace().any(|f| f == flag)
    }

    /// Flavor names the test declares, defaulting to all of them.
    pub fn flavors(&self) -> Vec<&str> {
        self.flavor
            .as_deref()
            .unwrap_or(DEFAULT_FLAVORS)
            .split_whitespace()
            .collect()
    }

    /// Extra checkpoint options as individual arguments.
    pub fn extra_opts(&self) -> Vec<String> {
        self.opts.split_whitespace().map(String::from).collect()
    }
}

/// The loaded test catalog.
#[derive(Debug, Default)]
pub struct Catalog {
    tests: BTreeMap<String, TestDescriptor>,
}

impl Catalog {
    /// Load the catalog from a YAML file.
    pub fn load_file(path: impl AsRef<Path>) -> SuiteResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| SuiteError::Catalog {
            message: format!("cannot read {}: {}", path.display(), e),
        })?;
        Self::load_str(&content)
    }

    /// Load the catalog from a YAML string.
    pub fn load_str(content: &str) -> SuiteResult<Self> {
        // Entries may be bare names with a null body.
        let raw: BTreeMap<String, Option<TestDescriptor>> =
            serde_yaml::from_str(content).map_err(|e| SuiteError::Catalog {
                message: format!("YAML parse error: {}", e),
            })?;

        let tests = raw
            .into_iter()
            .map(|(name, desc)| (name, desc.unwrap_or_default()))
            .collect();

        Ok(Self { tests })
    }

    /// Descriptor for a test, falling back to the default descriptor for
    /// names the catalog does not know.
    pub fn get(&self, name: &str) -> TestDescriptor {
        self.tests.get(name).cloned().unwrap_or_default()
    }

    /// All catalogued test names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tests.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
static/pipe00:
static/maps01:
  flags: suid
  opts: --link-remap
static/utsname:
  feature: mnt_ns
  flavor: ns uns
transition/fork:
  arch: x86_64
"#;

    #[test]
    fn test_null_entry_gets_default_descriptor() {
        let cat = Catalog::load_str(SAMPLE).unwrap();
        let desc = cat.get("static/pipe00");
        assert_eq!(desc, TestDescriptor::default());
        assert_eq!(desc.flavors(), vec!["h", "ns", "uns"]);
        assert!(desc.extra_opts().is_empty());
    }

    #[test]
    fn test_flags_and_opts_split() {
        let cat = Catalog::load_str(SAMPLE).unwrap();
        let desc = cat.get("static/maps01");
        assert!(desc.has_flag("suid"));
        assert!(!desc.has_flag("sui"));
        assert_eq!(desc.extra_opts(), vec!["--link-remap".to_string()]);
    }

    #[test]
    fn test_declared_flavor_set() {
        let cat = Catalog::load_str(SAMPLE).unwrap();
        let desc = cat.get("static/utsname");
        assert_eq!(desc.flavors(), vec!["ns", "uns"]);
        assert_eq!(desc.feature.as_deref(), Some("mnt_ns"));
    }

    #[test]
    fn test_unknown_name_resolves_to_default() {
        let cat = Catalog::load_str(SAMPLE).unwrap();
        assert_eq!(cat.get("no/such/test"), TestDescriptor::default());
    }

    #[test]
    fn test_names_listing() {
        let cat = Catalog::load_str(SAMPLE).unwrap();
        assert_eq!(cat.len(), 4);
        assert!(cat.names().any(|n| n == "transition/fork"));
    }

    #[test]
    fn test_bad_yaml_is_catalog_error() {
        let err = Catalog::load_str("a: [unclosed").unwrap_err();
        assert!(matches!(err, SuiteError::Catalog { .. }));
    }
}
