// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Externally visible process state.
//!
//! A checkpoint/restore cycle must be behavior-preserving for everything a
//! process exposes to the outside: its open file descriptors and its mapped
//! memory ranges. Snapshots are captured before and after a cycle and
//! compared positionally; the enumeration order of /proc is taken at face
//! value on both sides.

use std::path::PathBuf;

use nix::unistd::Pid;

use crate::error::{SuiteError, SuiteResult};

/// Snapshot of a process's externally observable footprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisibleState {
    /// Open fd numbers, in /proc enumeration order.
    pub fds: Vec<u32>,
    /// Coalesced [start, end) memory-map ranges, ascending and
    /// non-overlapping.
    pub maps: Vec<(u64, u64)>,
}

impl VisibleState {
    /// Capture the visible state of a pid from /proc.
    pub fn capture(pid: Pid) -> SuiteResult<Self> {
        Ok(Self {
            fds: read_fds(pid)?,
            maps: read_maps(pid)?,
        })
    }

    /// Compare two snapshots element-wise.
    ///
    /// Any positional difference, including a missing or extra element,
    /// fails with the kind of list that diverged.
    pub fn compare(before: &Self, after: &Self) -> SuiteResult<()> {
        if before.fds != after.fds {
            return Err(SuiteError::StateMismatch { kind: "fds" });
        }
        if before.maps != after.maps {
            return Err(SuiteError::StateMismatch { kind: "maps" });
        }
        Ok(())
    }
}

fn proc_path(pid: Pid, entry: &str) -> PathBuf {
    PathBuf::from(format!("/proc/{}/{}", pid, entry))
}

/// Open fd numbers from the process's fdinfo directory.
fn read_fds(pid: Pid) -> SuiteResult<Vec<u32>> {
    let dir = proc_path(pid, "fdinfo");
    let entries = std::fs::read_dir(&dir).map_err(|e| SuiteError::io("listing fdinfo", e))?;

    let mut fds = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| SuiteError::io("listing fdinfo", e))?;
        if let Ok(fd) = entry.file_name().to_string_lossy().parse::<u32>() {
            fds.push(fd);
        }
    }
    Ok(fds)
}

/// Mapped ranges from /proc/<pid>/maps, coalesced.
fn read_maps(pid: Pid) -> SuiteResult<Vec<(u64, u64)>> {
    let content = std::fs::read_to_string(proc_path(pid, "maps"))
        .map_err(|e| SuiteError::io("reading maps", e))?;
    parse_maps(&content)
}

/// Parse maps lines into coalesced [start, end) ranges.
pub(crate) fn parse_maps(content: &str) -> SuiteResult<Vec<(u64, u64)>> {
    let bad_line = |line: &str| {
        SuiteError::io(
            "parsing maps",
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("malformed maps line: {}", line),
            ),
        )
    };

    let mut ranges = Vec::new();
    for line in content.lines() {
        let range = line.split_whitespace().next().unwrap_or("");
        let (start, end) = range.split_once('-').ok_or_else(|| bad_line(line))?;
        let start = u64::from_str_radix(start, 16).map_err(|_| bad_line(line))?;
        let end = u64::from_str_radix(end, 16).map_err(|_| bad_line(line))?;
        ranges.push((start, end));
    }
    Ok(coalesce(ranges))
}

/// Merge touching ranges into a minimal ascending sequence.
pub(crate) fn coalesce(ranges: Vec<(u64, u64)>) -> Vec<(u64, u64)> {
    let mut merged: Vec<(u64, u64)> = Vec::with_capacity(ranges.len());
    for (start, end) in ranges {
        match merged.last_mut() {
            Some(last) if last.1 == start => last.1 = end,
            _ => merged.push((start, end)),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coalesce_merges_touching_ranges() {
        let merged = coalesce(vec![(0x1000, 0x2000), (0x2000, 0x3000), (0x5000, 0x6000)]);
        assert_eq!(merged, vec![(0x1000, 0x3000), (0x5000, 0x6000)]);
    }

    #[test]
    fn test_coalesced_ranges_never_touch() {
        let merged = coalesce(vec![
            (0x1000, 0x2000),
            (0x2000, 0x2800),
            (0x2800, 0x3000),
            (0x4000, 0x5000),
            (0x5000, 0x5400),
        ]);
        for window in merged.windows(2) {
            assert!(window[0].1 < window[1].0, "ranges touch: {:?}", window);
        }
    }

    #[test]
    fn test_parse_maps_lines() {
        let content = "559a3c000000-559a3c021000 r--p 00000000 fd:01 123 /bin/cat\n\
                       559a3c021000-559a3c042000 r-xp 00021000 fd:01 123 /bin/cat\n\
                       7f0000000000-7f0000001000 rw-p 00000000 00:00 0\n";
        let ranges = parse_maps(content).unwrap();
        assert_eq!(
            ranges,
            vec![
                (0x559a3c000000, 0x559a3c042000),
                (0x7f0000000000, 0x7f0000001000),
            ]
        );
    }

    #[test]
    fn test_compare_is_reflexive() {
        let state = VisibleState {
            fds: vec![0, 1, 2, 5],
            maps: vec![(0x1000, 0x3000), (0x5000, 0x6000)],
        };
        VisibleState::compare(&state, &state).unwrap();
    }

    #[test]
    fn test_compare_names_fds_kind() {
        let before = VisibleState {
            fds: vec![0, 1, 2],
            maps: vec![(0x1000, 0x2000)],
        };
        let after = VisibleState {
            fds: vec![0, 1, 3],
            maps: vec![(0x1000, 0x2000)],
        };
        let err = VisibleState::compare(&before, &after).unwrap_err();
        assert!(matches!(err, SuiteError::StateMismatch { kind: "fds" }));
    }

    #[test]
    fn test_compare_names_maps_kind() {
        let before = VisibleState {
            fds: vec![0],
            maps: vec![(0x1000, 0x2000)],
        };
        let after = VisibleState {
            fds: vec![0],
            maps: vec![(0x1000, 0x3000)],
        };
        let err = VisibleState::compare(&before, &after).unwrap_err();
        assert!(matches!(err, SuiteError::StateMismatch { kind: "maps" }));
    }

    #[test]
    fn test_compare_length_mismatch_fails() {
        let before = VisibleState {
            fds: vec![0, 1],
            maps: vec![],
        };
        let after = VisibleState {
            fds: vec![0, 1, 2],
            maps: vec![],
        };
        assert!(VisibleState::compare(&before, &after).is_err());
    }

    #[test]
    fn test_capture_own_state() {
        let state = VisibleState::capture(Pid::from_raw(std::process::id() as i32)).unwrap();
        // stdio is open and the binary is mapped.
        assert!(!state.fds.is_empty());
        assert!(!state.maps.is_empty());
        for window in state.maps.windows(2) {
            assert!(window[0].1 < window[1].0);
        }
        VisibleState::compare(&state, &state).unwrap();
    }
}
