// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Isolation flavors.
//!
//! A flavor is the environment a test runs in:
//!   h   -- host, the test shares the namespaces of the suite itself
//!   ns  -- the test runs in its own mount namespace over a minimal root
//!   uns -- ns plus a private user namespace
//!
//! Namespaced flavors bind a private mount view over the process-wide
//! isolation root, construct a minimal directory skeleton on first use and
//! mirror the test binary's dynamic libraries into it. Construction is
//! idempotent and safe against concurrent first use: the skeleton is gated by
//! an atomically-created sentinel file and library copies go through a
//! temp-file-then-rename sequence.

use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sys::stat::{makedev, mknod, Mode, SFlag};

use crate::context::SuiteContext;
use crate::error::{SuiteError, SuiteResult};

/// Skeleton directories created inside a fresh isolation root.
const ROOT_DIRS: &[&str] = &["bin", "etc", "lib", "lib64", "dev", "tmp"];

/// Sentinel marking an isolation root as fully constructed.
const CONSTRUCTED_SENTINEL: &str = ".constructed";

/// An isolation mode, as a closed variant set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlavorKind {
    /// Test runs directly on the host.
    Host,
    /// Test runs over a private mount namespace, optionally inside a user
    /// namespace as well.
    Namespaced { user_ns: bool },
}

impl FlavorKind {
    /// Parse a short flavor name as used by the catalog and the CLI.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "h" => Some(Self::Host),
            "ns" => Some(Self::Namespaced { user_ns: false }),
            "uns" => Some(Self::Namespaced { user_ns: true }),
            _ => None,
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::Host => "h",
            Self::Namespaced { user_ns: false } => "ns",
            Self::Namespaced { user_ns: true } => "uns",
        }
    }

    pub const fn is_namespaced(&self) -> bool {
        matches!(self, Self::Namespaced { .. })
    }

    pub const fn user_ns(&self) -> bool {
        matches!(self, Self::Namespaced { user_ns: true })
    }
}

impl std::fmt::Display for FlavorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A realized flavor for one test run.
#[derive(Debug)]
pub struct Flavor {
    kind: FlavorKind,
    /// Isolation root path; absent for the host flavor.
    root: Option<PathBuf>,
}

impl Flavor {
    /// Build a flavor, resolving the shared isolation root for namespaced
    /// kinds.
    pub fn new(kind: FlavorKind, ctx: &SuiteContext) -> SuiteResult<Self> {
        let root = if kind.is_namespaced() {
            Some(ctx.isolation_root()?)
        } else {
            None
        };
        Ok(Self { kind, root })
    }

    pub fn kind(&self) -> FlavorKind {
        self.kind
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// Prepare the environment the given test binary will run in.
    ///
    /// Host flavor is a no-op. Namespaced flavors bind the root privately
    /// over itself so nested mounts do not leak out, construct the skeleton
    /// if this root has not been constructed yet, and mirror the binary's
    /// library dependencies into it.
    pub fn prepare(&self, test_bin: &Path) -> SuiteResult<()> {
        let Some(root) = &self.root else {
            return Ok(());
        };

        tracing::info!(
            test = %test_bin.display(),
            root = %root.display(),
            "constructing isolation root"
        );

        mount(
            Some(root.as_path()),
            root.as_path(),
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|e| SuiteError::EnvironmentSetup {
            reason: format!("bind mount of {} failed: {}", root.display(), e),
        })?;
        mount(
            None::<&str>,
            root.as_path(),
            None::<&str>,
            MsFlags::MS_PRIVATE,
            None::<&str>,
        )
        .map_err(|e| SuiteError::EnvironmentSetup {
            reason: format!("making {} private failed: {}", root.display(), e),
        })?;

        construct_root(root)?;

        let libs = resolve_libraries(test_bin)?;
        mirror_libraries(root, &libs)
    }

    /// Release the mount resources of a namespaced flavor.
    pub fn teardown(&self) -> SuiteResult<()> {
        let Some(root) = &self.root else {
            return Ok(());
        };

        mount(
            None::<&str>,
            root.as_path(),
            None::<&str>,
            MsFlags::MS_PRIVATE,
            None::<&str>,
        )
        .map_err(|e| SuiteError::Teardown {
            reason: format!("making {} private failed: {}", root.display(), e),
        })?;
        umount2(root.as_path(), MntFlags::MNT_DETACH).map_err(|e| SuiteError::Teardown {
            reason: format!("lazy unmount of {} failed: {}", root.display(), e),
        })
    }
}

/// Build the minimal directory skeleton inside an isolation root.
///
/// Idempotent: a root already carrying the sentinel is left untouched, and
/// every creation step tolerates a concurrent run having won the race.
pub(crate) fn construct_root(root: &Path) -> SuiteResult<()> {
    if root.join(CONSTRUCTED_SENTINEL).exists() {
        return Ok(());
    }

    for dir in ROOT_DIRS {
        let path = root.join(dir);
        match std::fs::create_dir(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => {
                return Err(SuiteError::EnvironmentSetup {
                    reason: format!("mkdir {} failed: {}", path.display(), e),
                });
            }
        }
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o777)).map_err(|e| {
            SuiteError::EnvironmentSetup {
                reason: format!("chmod {} failed: {}", path.display(), e),
            }
        })?;
    }

    let tty = root.join("dev/tty");
    match mknod(
        &tty,
        SFlag::S_IFCHR,
        Mode::from_bits_truncate(0o666),
        makedev(5, 0),
    ) {
        Ok(()) => {
            std::fs::set_permissions(&tty, std::fs::Permissions::from_mode(0o666)).map_err(
                |e| SuiteError::EnvironmentSetup {
                    reason: format!("chmod {} failed: {}", tty.display(), e),
                },
            )?;
        }
        Err(nix::errno::Errno::EEXIST) => {}
        Err(e) => {
            return Err(SuiteError::EnvironmentSetup {
                reason: format!("mknod {} failed: {}", tty.display(), e),
            });
        }
    }

    // Atomic create-if-absent: losing this race means another run finished
    // construction first, which is fine.
    match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(root.join(CONSTRUCTED_SENTINEL))
    {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(SuiteError::EnvironmentSetup {
            reason: format!("creating construction sentinel failed: {}", e),
        }),
    }
}

/// Resolve the dynamic library dependencies of a test binary via ldd,
/// excluding virtual entries that have no backing file.
pub(crate) fn resolve_libraries(test_bin: &Path) -> SuiteResult<Vec<PathBuf>> {
    let output = Command::new("ldd")
        .arg(test_bin)
        .output()
        .map_err(|e| SuiteError::EnvironmentSetup {
            reason: format!("running ldd on {} failed: {}", test_bin.display(), e),
        })?;

    Ok(parse_ldd_output(&String::from_utf8_lossy(&output.stdout)))
}

/// Extract library paths from ldd output, skipping vdso/gate entries and
/// non-dynamic binaries.
pub(crate) fn parse_ldd_output(output: &str) -> Vec<PathBuf> {
    let mut libs = Vec::new();
    for line in output.lines() {
        if !line.starts_with('\t') {
            continue;
        }
        let line = line.trim();
        if line.starts_with("linux-gate.so")
            || line.starts_with("linux-vdso")
            || line.starts_with("not a dynamic")
            || line.starts_with("statically linked")
        {
            continue;
        }

        let words: Vec<&str> = line.split_whitespace().collect();
        let path = match words.as_slice() {
            [_, "=>", target, ..] => target,
            [target, ..] => target,
            [] => continue,
        };
        if path.starts_with('/') {
            libs.push(PathBuf::from(path));
        }
    }
    libs
}

/// Copy any library missing from the root to its mirrored path.
///
/// Copies land in a temp file next to the target and are renamed into place,
/// so two runs racing on the same library never expose a half-written file.
pub(crate) fn mirror_libraries(root: &Path, libs: &[PathBuf]) -> SuiteResult<()> {
    for lib in libs {
        let relative = lib.strip_prefix("/").unwrap_or(lib);
        let target = root.join(relative);
        if target.exists() {
            continue;
        }

        let parent = target.parent().unwrap_or(root);
        std::fs::create_dir_all(parent).map_err(|e| SuiteError::EnvironmentSetup {
            reason: format!("mkdir -p {} failed: {}", parent.display(), e),
        })?;

        let staged = tempfile::Builder::new()
            .suffix(".tso")
            .tempfile_in(parent)
            .map_err(|e| SuiteError::EnvironmentSetup {
                reason: format!("staging copy of {} failed: {}", lib.display(), e),
            })?;
        std::fs::copy(lib, staged.path()).map_err(|e| SuiteError::EnvironmentSetup {
            reason: format!("copying {} failed: {}", lib.display(), e),
        })?;
        staged
            .persist(&target)
            .map_err(|e| SuiteError::EnvironmentSetup {
                reason: format!("renaming into {} failed: {}", target.display(), e),
            })?;

        tracing::debug!(lib = %lib.display(), "mirrored library into root");
    }
    Ok(())
}
