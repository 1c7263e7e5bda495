//! Attempt guard: the per-issue fail counter and the Principal's global
//! consecutive-failure escalation counter.
//!
//! The shape mirrors the teacher's `ConsecutiveFailures` tracker (separate
//! counters updated after each completed unit of work, compared against
//! configured thresholds) but counts whole-issue outcomes instead of
//! verification/review steps, and persists through [`crate::state_store`]
//! instead of living only in daemon memory.

use std::path::{Path, PathBuf};

use crate::state_store::{self, StateStoreError};
use crate::types::{AttemptRecord, FailureHistoryEntry};

/// Result of [`AttemptGuard::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptCheck {
    pub can_proceed: bool,
    pub attempt: u32,
}

/// Per-issue attempt bookkeeping, rooted at the state-root file layout from
/// spec Section 6: `fail_count` lives under the per-issue run directory,
/// the failure history journal is a single shared append-only file.
pub struct AttemptGuard {
    state_root: PathBuf,
    issue_id: u64,
    max_attempts: u32,
}

impl AttemptGuard {
    pub fn new(state_root: &Path, issue_id: u64, max_attempts: u32) -> Self {
        Self {
            state_root: state_root.to_path_buf(),
            issue_id,
            max_attempts,
        }
    }

    fn fail_count_path(&self) -> PathBuf {
        self.state_root.join(".ai/runs").join(format!("issue-{}", self.issue_id)).join("fail_count.txt")
    }

    fn failure_history_path(&self) -> PathBuf {
        self.state_root.join(".ai/state/failure_history.jsonl")
    }

    pub fn fail_count(&self) -> Result<u32, StateStoreError> {
        state_store::read_counter(&self.fail_count_path())
    }

    pub fn record(&self, issue_id: u64) -> Result<AttemptRecord, StateStoreError> {
        Ok(AttemptRecord {
            issue_id,
            fail_count: self.fail_count()?,
            max_attempts: self.max_attempts,
        })
    }

    /// `true` once `fail_count >= max_attempts`: the issue is escalated and
    /// must not be retried automatically.
    pub fn is_exhausted(&self) -> Result<bool, StateStoreError> {
        Ok(self.fail_count()? >= self.max_attempts)
    }

    /// The Worker runner's entry check (spec "Check()"): read-only view of
    /// whether this issue may proceed, and which attempt number the Worker
    /// is about to make.
    ///
    /// Unlike the literal spec wording, `fail_count` is bumped by
    /// [`record_failure`](Self::record_failure) at the *end* of a failed
    /// attempt rather than here at the start: a read-only `check` can be
    /// called freely (e.g. for logging) without double-counting, and the
    /// bound `fail_count <= max_attempts` holds either way.
    pub fn check(&self) -> Result<AttemptCheck, StateStoreError> {
        let count = self.fail_count()?;
        if count >= self.max_attempts {
            Ok(AttemptCheck {
                can_proceed: false,
                attempt: count,
            })
        } else {
            Ok(AttemptCheck {
                can_proceed: true,
                attempt: count + 1,
            })
        }
    }

    /// Record a failed attempt: bump `fail_count` and append a
    /// `failure_history.jsonl` entry. Returns the updated count.
    pub fn record_failure(&self, entry: FailureHistoryEntry) -> Result<u32, StateStoreError> {
        let next = self.fail_count()? + 1;
        state_store::write_counter(&self.fail_count_path(), next)?;
        state_store::append_jsonl(&self.failure_history_path(), &entry)?;
        Ok(next)
    }

    /// Reset the counter on a successful attempt, leaving the history
    /// journal intact for postmortem review.
    pub fn reset(&self) -> Result<(), StateStoreError> {
        state_store::write_counter(&self.fail_count_path(), 0)
    }
}

/// Global consecutive-failure counter gating new dispatch, rooted at
/// `<state_root>/consecutive_failures`.
pub struct ConsecutiveFailureGuard {
    path: PathBuf,
    threshold: u32,
}

impl ConsecutiveFailureGuard {
    pub fn new(state_root: &Path, threshold: u32) -> Self {
        Self {
            path: state_root.join(".ai/state/consecutive_failures"),
            threshold,
        }
    }

    pub fn count(&self) -> Result<u32, StateStoreError> {
        state_store::read_counter(&self.path)
    }

    /// `true` once the counter has reached the configured threshold: the
    /// Principal must halt new dispatch and surface an operator alert.
    pub fn should_halt(&self) -> Result<bool, StateStoreError> {
        Ok(self.count()? >= self.threshold)
    }

    pub fn record_failure(&self) -> Result<u32, StateStoreError> {
        let next = self.count()? + 1;
        state_store::write_counter(&self.path, next)?;
        Ok(next)
    }

    pub fn record_success(&self) -> Result<(), StateStoreError> {
        state_store::write_counter(&self.path, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(issue: u64, attempt: u32, retryable: bool) -> FailureHistoryEntry {
        FailureHistoryEntry {
            timestamp: Utc::now(),
            issue,
            attempt,
            pattern_id: None,
            kind: "build_failure".to_string(),
            retryable,
        }
    }

    #[test]
    fn records_failures_and_checks_exhaustion() {
        let dir = tempfile::tempdir().unwrap();
        let guard = AttemptGuard::new(dir.path(), 7, 3);
        assert_eq!(guard.fail_count().unwrap(), 0);
        assert!(!guard.is_exhausted().unwrap());

        guard.record_failure(entry(7, 1, true)).unwrap();
        guard.record_failure(entry(7, 2, true)).unwrap();
        assert!(!guard.is_exhausted().unwrap());

        guard.record_failure(entry(7, 3, false)).unwrap();
        assert!(guard.is_exhausted().unwrap());
    }

    #[test]
    fn check_reports_next_attempt_without_mutating_state() {
        let dir = tempfile::tempdir().unwrap();
        let guard = AttemptGuard::new(dir.path(), 11, 2);
        let first = guard.check().unwrap();
        assert_eq!(first, AttemptCheck { can_proceed: true, attempt: 1 });
        // Calling check() again before recording a failure must not advance state.
        assert_eq!(guard.check().unwrap(), first);

        guard.record_failure(entry(11, 1, true)).unwrap();
        assert_eq!(guard.check().unwrap(), AttemptCheck { can_proceed: true, attempt: 2 });

        guard.record_failure(entry(11, 2, false)).unwrap();
        assert_eq!(guard.check().unwrap(), AttemptCheck { can_proceed: false, attempt: 2 });
    }

    #[test]
    fn reset_clears_fail_count_but_keeps_history() {
        let dir = tempfile::tempdir().unwrap();
        let guard = AttemptGuard::new(dir.path(), 3, 2);
        guard.record_failure(entry(3, 1, true)).unwrap();
        guard.reset().unwrap();
        assert_eq!(guard.fail_count().unwrap(), 0);
        let history = std::fs::read_to_string(guard.failure_history_path()).unwrap();
        assert_eq!(history.lines().count(), 1);
    }

    #[test]
    fn consecutive_failure_guard_halts_at_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let guard = ConsecutiveFailureGuard::new(dir.path(), 2);
        assert!(!guard.should_halt().unwrap());
        guard.record_failure().unwrap();
        assert!(!guard.should_halt().unwrap());
        guard.record_failure().unwrap();
        assert!(guard.should_halt().unwrap());
        guard.record_success().unwrap();
        assert!(!guard.should_halt().unwrap());
    }
}
