//! Result checker: the Principal's passive poll over a dispatched issue.
//!
//! Reads whatever the Worker has written so far and never writes an
//! `IssueResult` itself except to synthesize a `crashed`/`timeout` outcome
//! when the Worker process is gone or overdue. PID liveness is a `kill(pid,
//! 0)` probe via the `nix` crate: is this PID, read back from a file, still
//! alive.

use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use orch_core::{
    read_trace, state_store, AttemptGuard, ExecutionTrace, IssueResult, IssueResultStatus,
    RepoKind, ResultDecision, ResultMetrics, ResultSession, StateStoreError, TraceStatus,
};
use thiserror::Error;

use crate::dispatcher::{LABEL_IN_PROGRESS, LABEL_WORKER_FAILED};
use crate::host::{HostAdapter, HostError};
use crate::worker;

#[derive(Debug, Error)]
pub enum ResultCheckerError {
    #[error(transparent)]
    Host(#[from] HostError),
    #[error(transparent)]
    StateStore(#[from] StateStoreError),
}

pub type Result<T> = std::result::Result<T, ResultCheckerError>;

pub struct ResultChecker<'a> {
    pub state_root: PathBuf,
    pub host: &'a dyn HostAdapter,
    pub worker_run_timeout: Duration,
    /// How long to sleep before returning `NotFound`, matching spec step
    /// "sleep the configured wait interval".
    pub poll_wait: Duration,
}

impl<'a> ResultChecker<'a> {
    /// Check `issue_id`'s outcome. `max_attempts` comes from the same
    /// config the Dispatcher used to size this issue's `AttemptGuard`.
    pub async fn check(&self, issue_id: u64, max_attempts: u32) -> Result<ResultDecision> {
        if let Some(result) = state_store::read_json::<IssueResult>(&worker::result_path(&self.state_root, issue_id))? {
            return self.translate_result(issue_id, &result, max_attempts).await;
        }

        match read_trace(&worker::trace_path(&self.state_root, issue_id))? {
            Some(trace) => self.handle_trace(issue_id, &trace).await,
            None => {
                tokio::time::sleep(self.poll_wait).await;
                Ok(ResultDecision::NotFound)
            }
        }
    }

    /// Translate a written `IssueResult` into a `ResultDecision`, handling
    /// the success-without-pr_url anomaly along the way.
    async fn translate_result(&self, issue_id: u64, result: &IssueResult, max_attempts: u32) -> Result<ResultDecision> {
        match result.status {
            IssueResultStatus::Success if result.is_anomalous_success() => {
                self.host.edit_issue_labels(issue_id, &[LABEL_WORKER_FAILED], &[LABEL_IN_PROGRESS]).await?;
                let _ = self
                    .host
                    .comment_on_issue(
                        issue_id,
                        "Worker reported success but produced no pull request URL. This is an anomaly; manual investigation required.",
                    )
                    .await;
                Ok(ResultDecision::FailFinal)
            }
            IssueResultStatus::Success | IssueResultStatus::SuccessNoChanges => Ok(ResultDecision::Success),
            IssueResultStatus::NeedsConflictResolution => Ok(ResultDecision::Wait),
            IssueResultStatus::Failed | IssueResultStatus::Crashed | IssueResultStatus::Timeout => {
                let guard = AttemptGuard::new(&self.state_root, issue_id, max_attempts);
                if guard.is_exhausted()? {
                    Ok(ResultDecision::FailFinal)
                } else {
                    Ok(ResultDecision::Retry)
                }
            }
        }
    }

    /// No `IssueResult` yet, but a trace exists: the Worker either crashed,
    /// is overdue, or is still legitimately running.
    async fn handle_trace(&self, issue_id: u64, trace: &ExecutionTrace) -> Result<ResultDecision> {
        if trace.status != TraceStatus::Running {
            // A terminal trace with no IssueResult is a narrow race (the
            // Worker finished writing the trace but was killed before it
            // could write the result); let the next poll retry rather than
            // guess at an outcome here.
            return Ok(ResultDecision::Unknown);
        }

        if !pid_is_alive(trace.worker_pid) {
            self.write_synthetic_result(issue_id, trace, IssueResultStatus::Crashed, "worker_crashed")?;
            self.host.edit_issue_labels(issue_id, &[], &[LABEL_IN_PROGRESS]).await?;
            return Ok(ResultDecision::FailRecoverable);
        }

        let elapsed_secs = Utc::now().signed_duration_since(trace.started_at).num_seconds().max(0) as u64;
        if elapsed_secs > self.worker_run_timeout.as_secs() {
            self.write_synthetic_result(issue_id, trace, IssueResultStatus::Timeout, "worker_timeout")?;
            self.host.edit_issue_labels(issue_id, &[], &[LABEL_IN_PROGRESS]).await?;
            return Ok(ResultDecision::FailRecoverable);
        }

        tokio::time::sleep(self.poll_wait).await;
        Ok(ResultDecision::Wait)
    }

    fn write_synthetic_result(
        &self,
        issue_id: u64,
        trace: &ExecutionTrace,
        status: IssueResultStatus,
        failure_stage: &str,
    ) -> Result<()> {
        let result = IssueResult {
            issue_id,
            status,
            repo: trace.repo.clone(),
            repo_type: RepoKind::Root,
            work_dir: String::new(),
            worktree_path: String::new(),
            branch: trace.branch.clone(),
            base_branch: trace.base_branch.clone(),
            head_sha: None,
            submodule_sha: None,
            consistency_status: None,
            failure_stage: Some(failure_stage.to_string()),
            recovery_command: None,
            timestamp_utc: Utc::now(),
            pr_url: None,
            session: ResultSession {
                worker_session_id: trace.trace_id.clone(),
                principal_session_id: String::new(),
                attempt_number: 0,
                previous_session_ids: Vec::new(),
                previous_failure_reason: trace.error.clone(),
                worker_pid: trace.worker_pid,
                worker_start_time: trace.worker_start_time,
            },
            metrics: ResultMetrics {
                duration_seconds: trace.duration_s.unwrap_or(0.0),
                retry_count: 0,
            },
        };
        state_store::write_json(&worker::result_path(&self.state_root, issue_id), &result)?;
        Ok(())
    }
}

#[cfg(unix)]
fn pid_is_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        // No permission to signal it, but it exists.
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn pid_is_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    use crate::host::{HostIssue, MergeState, PullRequest};

    #[derive(Default)]
    struct FakeHost {
        labels_added: Mutex<Vec<String>>,
        labels_removed: Mutex<Vec<String>>,
        comments: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl HostAdapter for FakeHost {
        async fn get_issue(&self, _id: u64) -> crate::host::Result<HostIssue> {
            unimplemented!()
        }
        async fn edit_issue_labels(&self, _id: u64, add: &[&str], remove: &[&str]) -> crate::host::Result<()> {
            self.labels_added.lock().unwrap().extend(add.iter().map(|s| s.to_string()));
            self.labels_removed.lock().unwrap().extend(remove.iter().map(|s| s.to_string()));
            Ok(())
        }
        async fn comment_on_issue(&self, _id: u64, body: &str) -> crate::host::Result<()> {
            self.comments.lock().unwrap().push(body.to_string());
            Ok(())
        }
        async fn close_issue(&self, _id: u64) -> crate::host::Result<()> {
            Ok(())
        }
        async fn get_issue_comments(&self, _id: u64, _limit: u32) -> crate::host::Result<Vec<String>> {
            Ok(Vec::new())
        }
        async fn get_latest_review_blocked_reason(&self, _id: u64) -> crate::host::Result<String> {
            Ok(String::new())
        }
        async fn get_pr_by_branch(&self, _branch: &str) -> crate::host::Result<Option<PullRequest>> {
            Ok(None)
        }
        async fn get_pr_merge_state(&self, _pr: u64) -> crate::host::Result<MergeState> {
            Ok(MergeState::Unknown)
        }
        async fn is_pr_open(&self, _pr: u64) -> crate::host::Result<bool> {
            Ok(false)
        }
        async fn create_pr(&self, _branch: &str, _base: &str, _title: &str, _body: &str) -> crate::host::Result<PullRequest> {
            unimplemented!()
        }
    }

    fn checker<'a>(state_root: PathBuf, host: &'a FakeHost) -> ResultChecker<'a> {
        ResultChecker {
            state_root,
            host,
            worker_run_timeout: Duration::from_secs(3600),
            poll_wait: Duration::from_millis(1),
        }
    }

    fn success_result(issue_id: u64, pr_url: Option<&str>) -> IssueResult {
        IssueResult {
            issue_id,
            status: IssueResultStatus::Success,
            repo: "root".to_string(),
            repo_type: RepoKind::Root,
            work_dir: "/tmp/wt".to_string(),
            worktree_path: "/tmp/wt".to_string(),
            branch: format!("feat/ai-issue-{issue_id}"),
            base_branch: "develop".to_string(),
            head_sha: Some("abc123".to_string()),
            submodule_sha: None,
            consistency_status: None,
            failure_stage: None,
            recovery_command: None,
            timestamp_utc: Utc::now(),
            pr_url: pr_url.map(|s| s.to_string()),
            session: ResultSession {
                worker_session_id: "sess".to_string(),
                principal_session_id: "psess".to_string(),
                attempt_number: 1,
                previous_session_ids: Vec::new(),
                previous_failure_reason: None,
                worker_pid: 1,
                worker_start_time: 0,
            },
            metrics: ResultMetrics { duration_seconds: 1.0, retry_count: 0 },
        }
    }

    #[tokio::test]
    async fn success_with_pr_url_decides_success() {
        let dir = tempfile::tempdir().unwrap();
        state_store::write_json(&worker::result_path(dir.path(), 1), &success_result(1, Some("https://example.com/pull/1"))).unwrap();
        let host = FakeHost::default();
        let decision = checker(dir.path().to_path_buf(), &host).check(1, 3).await.unwrap();
        assert!(matches!(decision, ResultDecision::Success));
    }

    #[tokio::test]
    async fn success_without_pr_url_is_an_anomaly() {
        let dir = tempfile::tempdir().unwrap();
        state_store::write_json(&worker::result_path(dir.path(), 2), &success_result(2, None)).unwrap();
        let host = FakeHost::default();
        let decision = checker(dir.path().to_path_buf(), &host).check(2, 3).await.unwrap();
        assert!(matches!(decision, ResultDecision::FailFinal));
        assert!(host.labels_added.lock().unwrap().contains(&LABEL_WORKER_FAILED.to_string()));
        assert!(host.labels_removed.lock().unwrap().contains(&LABEL_IN_PROGRESS.to_string()));
        assert_eq!(host.comments.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_result_retries_under_the_attempt_budget() {
        let dir = tempfile::tempdir().unwrap();
        let mut result = success_result(3, None);
        result.status = IssueResultStatus::Failed;
        state_store::write_json(&worker::result_path(dir.path(), 3), &result).unwrap();
        let host = FakeHost::default();
        let decision = checker(dir.path().to_path_buf(), &host).check(3, 3).await.unwrap();
        assert!(matches!(decision, ResultDecision::Retry));
    }

    #[tokio::test]
    async fn failed_result_fails_final_once_attempts_are_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let mut result = success_result(4, None);
        result.status = IssueResultStatus::Failed;
        state_store::write_json(&worker::result_path(dir.path(), 4), &result).unwrap();
        let guard = AttemptGuard::new(dir.path(), 4, 1);
        guard
            .record_failure(orch_core::FailureHistoryEntry {
                timestamp: Utc::now(),
                issue: 4,
                attempt: 1,
                pattern_id: None,
                kind: "build_failure".to_string(),
                retryable: true,
            })
            .unwrap();
        let host = FakeHost::default();
        let decision = checker(dir.path().to_path_buf(), &host).check(4, 1).await.unwrap();
        assert!(matches!(decision, ResultDecision::FailFinal));
    }

    #[tokio::test]
    async fn no_result_and_no_trace_returns_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let host = FakeHost::default();
        let decision = checker(dir.path().to_path_buf(), &host).check(5, 3).await.unwrap();
        assert!(matches!(decision, ResultDecision::NotFound));
    }

    #[tokio::test]
    async fn dead_pid_with_a_running_trace_is_marked_crashed() {
        let dir = tempfile::tempdir().unwrap();
        // PID 1 is init on any live Unix system under test; use a PID that
        // cannot plausibly be alive to deterministically simulate a crash.
        let dead_pid: u32 = 999_999;
        let trace = ExecutionTrace::new(6, "root", "feat/ai-issue-6", "develop", dead_pid, 0);
        state_store::write_json(&worker::trace_path(dir.path(), 6), &trace).unwrap();
        let host = FakeHost::default();
        let decision = checker(dir.path().to_path_buf(), &host).check(6, 3).await.unwrap();
        assert!(matches!(decision, ResultDecision::FailRecoverable));
        assert!(host.labels_removed.lock().unwrap().contains(&LABEL_IN_PROGRESS.to_string()));
        let written: IssueResult = state_store::read_json(&worker::result_path(dir.path(), 6)).unwrap().unwrap();
        assert_eq!(written.status, IssueResultStatus::Crashed);
    }

    #[tokio::test]
    async fn alive_pid_within_timeout_waits() {
        let dir = tempfile::tempdir().unwrap();
        let own_pid = std::process::id();
        let trace = ExecutionTrace::new(7, "root", "feat/ai-issue-7", "develop", own_pid, 0);
        state_store::write_json(&worker::trace_path(dir.path(), 7), &trace).unwrap();
        let host = FakeHost::default();
        let decision = checker(dir.path().to_path_buf(), &host).check(7, 3).await.unwrap();
        assert!(matches!(decision, ResultDecision::Wait));
    }

    #[tokio::test]
    async fn alive_pid_past_deadline_is_marked_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let own_pid = std::process::id();
        let mut trace = ExecutionTrace::new(8, "root", "feat/ai-issue-8", "develop", own_pid, 0);
        trace.started_at = Utc::now() - chrono::Duration::seconds(10);
        state_store::write_json(&worker::trace_path(dir.path(), 8), &trace).unwrap();
        let host = FakeHost::default();
        let mut checker = checker(dir.path().to_path_buf(), &host);
        checker.worker_run_timeout = Duration::from_secs(1);
        let decision = checker.check(8, 3).await.unwrap();
        assert!(matches!(decision, ResultDecision::FailRecoverable));
        let written: IssueResult = state_store::read_json(&worker::result_path(dir.path(), 8)).unwrap().unwrap();
        assert_eq!(written.status, IssueResultStatus::Timeout);
    }
}
