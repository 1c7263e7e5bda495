//! Dispatcher: the Principal-side per-issue orchestration cycle.
//!
//! Ties the host adapter, the Worker runner, and label/comment side effects
//! into the nine-step dispatch flow: resolve a session id, validate the
//! issue is eligible, auto-detect a merge issue, prepare the ticket, flip
//! labels, invoke the Worker runner under a deadline, and branch on the
//! resulting `IssueResult`.
//!
//! Shaped like a claim -> execute -> branch -> finalize cycle: a match over
//! the last completed unit of work decides the next phase, generalized from
//! step-phase transitions to `IssueResultStatus` transitions.

use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use orch_core::{
    AttemptGuard, FailureHistoryEntry, Id, IssueResult, IssueResultStatus, MergeIssueKind,
    SessionLogEntry, StateStoreError,
};
use orch_core::state_store;
use thiserror::Error;
use tracing::warn;

use crate::backend::BackendRegistry;
use crate::cleanup::with_guaranteed_cleanup;
use crate::host::{HostAdapter, HostError, MergeState};
use crate::worker::{self, WorkerContext, WorkerError, WorkerRunner};

/// Labels the orchestrator owns and may add/remove. `needs-human-review` and
/// `review-failed` are read (for the "## AWK Review blocked" extract) but
/// never written here: ownership of that pair sits with the out-of-scope
/// review subsystem (see DESIGN.md Open Questions).
pub const LABEL_AI_TASK: &str = "ai-task";
pub const LABEL_IN_PROGRESS: &str = "in-progress";
pub const LABEL_PR_READY: &str = "pr-ready";
pub const LABEL_COMPLETED: &str = "completed";
pub const LABEL_WORKER_FAILED: &str = "worker-failed";
pub const LABEL_MERGE_CONFLICT: &str = "merge-conflict";
pub const LABEL_NEEDS_REBASE: &str = "needs-rebase";

/// Default per-run deadline: 60 minutes.
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(3600);

#[derive(Debug, Error)]
pub enum DispatcherError {
    #[error(transparent)]
    Host(#[from] HostError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error(transparent)]
    StateStore(#[from] StateStoreError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// `status=success` without a `pr_url`: the sole invariant an otherwise
    /// well-formed `IssueResult` can still violate. Treated as terminal and
    /// surfaced for a human, never retried automatically.
    #[error("issue {issue_id}: worker reported success without a pr_url")]
    AnomalousSuccess { issue_id: u64 },
}

pub type Result<T> = std::result::Result<T, DispatcherError>;

/// Outcome of one [`Dispatcher::dispatch`] call.
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    /// Not eligible for dispatch (closed, missing `ai-task`, already
    /// `in-progress`/`worker-failed`). No worker ran, no state changed.
    Skipped { reason: String },
    /// Landed: `pr-ready` set, `in-progress` removed, `fail_count` reset.
    Succeeded { result: IssueResult },
    /// No diff was produced; the issue was closed as `completed`.
    NoChangesNeeded { result: IssueResult },
    /// An unresolved conflict or rebase; the worktree is left in place for a
    /// human or subagent flow. `in-progress` is intentionally left set.
    NeedsConflictResolution { result: IssueResult, worktree_path: String },
    /// Failed within the retry budget; `in-progress` removed so the next
    /// dispatch cycle retries.
    Retrying { result: IssueResult, fail_count: u32 },
    /// Retry budget exhausted; `worker-failed` applied, terminal.
    WorkerFailed { result: IssueResult, fail_count: u32 },
}

pub struct Dispatcher<'a> {
    pub state_root: PathBuf,
    pub repo_root: PathBuf,
    pub global_log_dir: PathBuf,
    pub config: &'a orch_core::Config,
    pub host: &'a dyn HostAdapter,
    pub backends: &'a BackendRegistry,
    pub worker_run_timeout: Duration,
}

impl<'a> Dispatcher<'a> {
    fn principal_session_path(&self) -> PathBuf {
        self.state_root.join(".ai/state/principal_session_id")
    }

    fn session_log_path(&self) -> PathBuf {
        self.state_root.join(".ai/state/session_log.jsonl")
    }

    fn ticket_snapshot_path(&self, issue_id: u64) -> PathBuf {
        self.state_root.join(".ai/temp").join(format!("ticket-{issue_id}.md"))
    }

    /// Step 1: resolve the Principal session id, minting and persisting one
    /// on first use so every entry this daemon lifetime writes to the
    /// session log shares it.
    fn resolve_principal_session_id(&self) -> Result<String> {
        if let Ok(existing) = std::fs::read_to_string(self.principal_session_path()) {
            let trimmed = existing.trim();
            if !trimmed.is_empty() {
                return Ok(trimmed.to_string());
            }
        }
        let id = Id::new().to_string();
        if let Some(parent) = self.principal_session_path().parent() {
            std::fs::create_dir_all(parent)?;
        }
        state_store::write_atomic(&self.principal_session_path(), id.as_bytes())?;
        Ok(id)
    }

    fn log_session(&self, session_id: &str, issue_id: Option<u64>, action: &str, detail: serde_json::Value) {
        let entry = SessionLogEntry {
            timestamp: Utc::now(),
            session_id: session_id.to_string(),
            issue_id,
            action: action.to_string(),
            detail,
        };
        if let Err(e) = state_store::append_jsonl(&self.session_log_path(), &entry) {
            warn!(issue_id = ?issue_id, error = %e, "failed to append session log entry");
        }
    }

    fn previous_result(&self, issue_id: u64) -> Option<IssueResult> {
        state_store::read_json(&worker::result_path(&self.state_root, issue_id))
            .ok()
            .flatten()
    }

    /// Step 3: auto-detect a merge issue when the caller didn't pass one
    /// explicitly. Tries the previous `IssueResult`'s `pr_url` first, then
    /// falls back to finding an open PR by branch name. A DIRTY merge state
    /// is a conflict; BEHIND calls for a rebase; anything else (including a
    /// host error) is treated as "not a merge issue".
    async fn detect_merge_issue(&self, issue_id: u64) -> Option<MergeIssueKind> {
        let branch = format!("feat/ai-issue-{issue_id}");

        let state = if let Some(pr_number) = self
            .previous_result(issue_id)
            .and_then(|r| r.pr_url)
            .as_deref()
            .and_then(pr_number_from_url)
        {
            match self.host.is_pr_open(pr_number).await {
                Ok(true) => self.host.get_pr_merge_state(pr_number).await.ok(),
                _ => None,
            }
        } else {
            None
        };

        let state = match state {
            Some(s) => s,
            None => match self.host.get_pr_by_branch(&branch).await {
                Ok(Some(pr)) if pr.is_open() => pr.merge_state(),
                _ => return None,
            },
        };

        match state {
            MergeState::Dirty => Some(MergeIssueKind::Conflict),
            MergeState::Behind => Some(MergeIssueKind::Rebase),
            MergeState::Clean | MergeState::Blocked | MergeState::Unknown => None,
        }
    }

    /// Run one full dispatch cycle for `issue_id`. `merge_issue_override`
    /// lets a caller (e.g. a retry explicitly triggered by an earlier
    /// `needs_conflict_resolution` outcome) skip auto-detection.
    pub async fn dispatch(
        &self,
        issue_id: u64,
        merge_issue_override: Option<MergeIssueKind>,
    ) -> Result<DispatchOutcome> {
        let principal_session_id = self.resolve_principal_session_id()?;

        // Step 2: load + validate eligibility.
        let issue = self.host.get_issue(issue_id).await?;
        if !issue.is_eligible() {
            let reason = if issue.state != "open" {
                "issue is not open".to_string()
            } else if !issue.labels.iter().any(|l| l == LABEL_AI_TASK) {
                "missing ai-task label".to_string()
            } else if issue.labels.iter().any(|l| l == LABEL_WORKER_FAILED) {
                "carries worker-failed".to_string()
            } else {
                "already in-progress".to_string()
            };
            return Ok(DispatchOutcome::Skipped { reason });
        }

        // Step 3: merge-issue auto-detection.
        let merge_issue = match merge_issue_override {
            Some(kind) => Some(kind),
            None => self.detect_merge_issue(issue_id).await,
        };

        // Step 4: prepare the ticket body: review-blocked extract plus a
        // merge-issue instruction block, snapshotted for audit.
        let mut ticket_body = issue.body.clone();
        if issue.labels.iter().any(|l| l == "needs-human-review" || l == "review-failed") {
            if let Ok(reason) = self.host.get_latest_review_blocked_reason(issue_id).await {
                if !reason.is_empty() {
                    ticket_body.push_str("\n\n## AWK Review blocked\n\n");
                    ticket_body.push_str(&reason);
                    ticket_body.push('\n');
                }
            }
        }
        if let Some(kind) = merge_issue {
            let branch = format!("feat/ai-issue-{issue_id}");
            let base_branch = match self.host.get_pr_by_branch(&branch).await {
                Ok(Some(pr)) => pr.base_branch,
                _ => self.config.base_branch(false).to_string(),
            };
            ticket_body.push_str(&merge_instruction_block(kind, &base_branch));
        }
        if let Some(parent) = self.ticket_snapshot_path(issue_id).parent() {
            std::fs::create_dir_all(parent)?;
        }
        state_store::write_atomic(&self.ticket_snapshot_path(issue_id), ticket_body.as_bytes())?;

        // Step 5: labels. `in-progress` first, then drop any stale
        // merge-issue labels once it's visibly claimed. An explicit or
        // auto-detected merge-issue dispatch also resets `fail_count`: it's
        // a fresh kind of attempt, not a retry of the original failure.
        self.host.edit_issue_labels(issue_id, &[LABEL_IN_PROGRESS], &[]).await?;
        if merge_issue.is_some() {
            self.host
                .edit_issue_labels(issue_id, &[], &[LABEL_MERGE_CONFLICT, LABEL_NEEDS_REBASE])
                .await?;
            AttemptGuard::new(&self.state_root, issue_id, self.config.escalation.max_attempts()).reset()?;
        }

        // Step 6: session log.
        self.log_session(
            &principal_session_id,
            Some(issue_id),
            "worker_dispatched",
            serde_json::json!({ "merge_issue": merge_issue.map(MergeIssueKind::as_str) }),
        );

        // Steps 7 + 9: invoke the Worker runner under a deadline. A
        // best-effort in-progress removal on a hard error keeps the issue
        // retryable even when the run never produced an `IssueResult` at
        // all (e.g. the host call that re-validates the issue failed).
        let ctx = WorkerContext {
            repo_override: None,
            previous_session_ids: Vec::new(),
            previous_failure_reason: self.previous_result(issue_id).and_then(|r| r.failure_stage),
            merge_issue,
            backend_name: self.config.default_backend.clone(),
        };
        let runner = WorkerRunner {
            state_root: self.state_root.clone(),
            repo_root: self.repo_root.clone(),
            global_log_dir: self.global_log_dir.clone(),
            config: self.config,
            host: self.host,
            backends: self.backends,
            principal_session_id: principal_session_id.clone(),
            worker_run_timeout: self.worker_run_timeout,
        };

        let deadline_result = with_guaranteed_cleanup(
            self.run_worker_with_deadline(&runner, issue_id, &ticket_body, ctx),
            |res: &std::result::Result<IssueResult, WorkerError>| {
                let ended_in_success = matches!(res, Ok(r) if r.status == IssueResultStatus::Success);
                if !ended_in_success {
                    let _ = std::fs::remove_file(worker::pid_path(&self.state_root, issue_id));
                }
            },
        )
        .await;

        let result = match deadline_result {
            Ok(r) => r,
            Err(e) => {
                let _ = self.host.edit_issue_labels(issue_id, &[], &[LABEL_IN_PROGRESS]).await;
                return Err(e.into());
            }
        };

        // Step 8: branch on the result.
        self.branch_on_result(issue_id, &principal_session_id, result, merge_issue).await
    }

    /// Run the Worker under `self.worker_run_timeout`; on deadline, write
    /// and return a synthetic `timeout` result instead of propagating a
    /// timeout error, matching spec step 7's "synthesize a timeout
    /// IssueResult" requirement.
    async fn run_worker_with_deadline(
        &self,
        runner: &WorkerRunner<'_>,
        issue_id: u64,
        ticket_body: &str,
        ctx: WorkerContext,
    ) -> std::result::Result<IssueResult, WorkerError> {
        match tokio::time::timeout(self.worker_run_timeout, runner.run(issue_id, ticket_body, ctx.clone())).await {
            Ok(inner) => inner,
            Err(_) => {
                warn!(
                    issue_id,
                    timeout_secs = self.worker_run_timeout.as_secs(),
                    "worker run exceeded its deadline"
                );
                self.synthesize_timeout_result(issue_id, &ctx)
            }
        }
    }

    fn synthesize_timeout_result(
        &self,
        issue_id: u64,
        ctx: &WorkerContext,
    ) -> std::result::Result<IssueResult, WorkerError> {
        let guard = AttemptGuard::new(&self.state_root, issue_id, self.config.escalation.max_attempts());
        let attempt_number = guard.fail_count().unwrap_or(0) + 1;
        guard.record_failure(FailureHistoryEntry {
            timestamp: Utc::now(),
            issue: issue_id,
            attempt: attempt_number,
            pattern_id: None,
            kind: "worker_timeout".to_string(),
            retryable: true,
        })?;

        let pid_file: Option<orch_core::PidFile> =
            state_store::read_json(&worker::pid_path(&self.state_root, issue_id))?;
        let branch = format!("feat/ai-issue-{issue_id}");
        let base_branch = self.config.base_branch(false).to_string();

        let result = IssueResult {
            issue_id,
            status: IssueResultStatus::Timeout,
            repo: String::new(),
            repo_type: orch_core::RepoKind::Root,
            work_dir: String::new(),
            worktree_path: String::new(),
            branch,
            base_branch,
            head_sha: None,
            submodule_sha: None,
            consistency_status: None,
            failure_stage: Some("worker_timeout".to_string()),
            recovery_command: None,
            timestamp_utc: Utc::now(),
            pr_url: None,
            session: orch_core::ResultSession {
                worker_session_id: pid_file.as_ref().map(|p| p.session_id.clone()).unwrap_or_default(),
                principal_session_id: String::new(),
                attempt_number,
                previous_session_ids: ctx.previous_session_ids.clone(),
                previous_failure_reason: ctx.previous_failure_reason.clone(),
                worker_pid: pid_file.as_ref().map(|p| p.pid).unwrap_or(0),
                worker_start_time: pid_file.as_ref().map(|p| p.start_time_unix).unwrap_or(0),
            },
            metrics: orch_core::ResultMetrics {
                duration_seconds: self.worker_run_timeout.as_secs_f64(),
                retry_count: 0,
            },
        };
        state_store::write_json(&worker::result_path(&self.state_root, issue_id), &result)?;
        Ok(result)
    }

    /// Step 8: the IssueResult-branching decision table.
    async fn branch_on_result(
        &self,
        issue_id: u64,
        principal_session_id: &str,
        result: IssueResult,
        merge_issue: Option<MergeIssueKind>,
    ) -> Result<DispatchOutcome> {
        let guard = AttemptGuard::new(&self.state_root, issue_id, self.config.escalation.max_attempts());

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
                self.log_session(principal_session_id, Some(issue_id), "anomalous_success", serde_json::Value::Null);
                Err(DispatcherError::AnomalousSuccess { issue_id })
            }
            IssueResultStatus::Success => {
                if merge_issue.is_some() {
                    if let Ok(Some(pr)) = self.host.get_pr_by_branch(&result.branch).await {
                        let still_unmerged = match pr.merge_state() {
                            MergeState::Dirty => Some((LABEL_MERGE_CONFLICT, "still dirty after push")),
                            MergeState::Behind => Some((LABEL_NEEDS_REBASE, "still behind after push")),
                            _ => None,
                        };
                        if let Some((label, reason)) = still_unmerged {
                            self.host.edit_issue_labels(issue_id, &[label], &[LABEL_IN_PROGRESS]).await?;
                            // The Worker believed it succeeded and already
                            // reset fail_count; only the Dispatcher's
                            // post-push re-verification can see this
                            // regression, so it alone records the failure.
                            guard.record_failure(FailureHistoryEntry {
                                timestamp: Utc::now(),
                                issue: issue_id,
                                attempt: result.session.attempt_number,
                                pattern_id: None,
                                kind: reason.to_string(),
                                retryable: true,
                            })?;
                            self.log_session(
                                principal_session_id,
                                Some(issue_id),
                                "merge_state_regressed",
                                serde_json::json!({ "reason": reason }),
                            );
                            return Ok(DispatchOutcome::Retrying { result, fail_count: guard.fail_count()? });
                        }
                    }
                }
                self.host
                    .edit_issue_labels(
                        issue_id,
                        &[LABEL_PR_READY],
                        &[LABEL_IN_PROGRESS, LABEL_MERGE_CONFLICT, LABEL_NEEDS_REBASE],
                    )
                    .await?;
                self.log_session(
                    principal_session_id,
                    Some(issue_id),
                    "worker_succeeded",
                    serde_json::json!({ "pr_url": result.pr_url }),
                );
                Ok(DispatchOutcome::Succeeded { result })
            }
            IssueResultStatus::SuccessNoChanges => {
                self.host.edit_issue_labels(issue_id, &[LABEL_COMPLETED], &[LABEL_IN_PROGRESS]).await?;
                let _ = self.host.comment_on_issue(issue_id, "No changes were required; closing.").await;
                self.host.close_issue(issue_id).await?;
                self.log_session(principal_session_id, Some(issue_id), "worker_succeeded_no_changes", serde_json::Value::Null);
                Ok(DispatchOutcome::NoChangesNeeded { result })
            }
            IssueResultStatus::NeedsConflictResolution => {
                self.log_session(
                    principal_session_id,
                    Some(issue_id),
                    "needs_conflict_resolution",
                    serde_json::json!({ "worktree_path": result.worktree_path }),
                );
                let worktree_path = result.worktree_path.clone();
                Ok(DispatchOutcome::NeedsConflictResolution { result, worktree_path })
            }
            IssueResultStatus::Failed | IssueResultStatus::Crashed | IssueResultStatus::Timeout => {
                let fail_count = guard.fail_count()?;
                if guard.is_exhausted()? {
                    self.host.edit_issue_labels(issue_id, &[LABEL_WORKER_FAILED], &[LABEL_IN_PROGRESS]).await?;
                    let _ = self.host.comment_on_issue(issue_id, &worker_failed_comment(issue_id, fail_count)).await;
                    self.log_session(
                        principal_session_id,
                        Some(issue_id),
                        "worker_failed",
                        serde_json::json!({ "fail_count": fail_count }),
                    );
                    Ok(DispatchOutcome::WorkerFailed { result, fail_count })
                } else {
                    self.host.edit_issue_labels(issue_id, &[], &[LABEL_IN_PROGRESS]).await?;
                    self.log_session(
                        principal_session_id,
                        Some(issue_id),
                        "worker_retry_scheduled",
                        serde_json::json!({ "fail_count": fail_count }),
                    );
                    Ok(DispatchOutcome::Retrying { result, fail_count })
                }
            }
        }
    }
}

/// Extract a trailing PR number from a host PR URL (`.../pull/123` ->
/// `123`), used to look up the previous attempt's PR directly instead of by
/// branch.
fn pr_number_from_url(url: &str) -> Option<u64> {
    url.rsplit('/').next()?.parse().ok()
}

fn merge_instruction_block(kind: MergeIssueKind, base_branch: &str) -> String {
    match kind {
        MergeIssueKind::Conflict => format!(
            "\n\n## Merge conflict detected\n\nThis branch conflicts with `{base_branch}`. Rebase and resolve before pushing:\n\n```\ngit fetch origin {base_branch}\ngit rebase origin/{base_branch}\n# resolve conflicts, then:\ngit rebase --continue\n```\n"
        ),
        MergeIssueKind::Rebase => format!(
            "\n\n## Branch behind base\n\nThis branch is behind `{base_branch}`. Rebase before pushing:\n\n```\ngit fetch origin {base_branch}\ngit rebase origin/{base_branch}\ngit push --force-with-lease\n```\n"
        ),
    }
}

fn worker_failed_comment(issue_id: u64, fail_count: u32) -> String {
    format!(
        "Worker failed after {fail_count} attempt(s) and exhausted the retry budget. \
         Inspect `.ai/runs/issue-{issue_id}/` for the worker log and diff summary before re-dispatching."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pr_number_from_url_extracts_trailing_digits() {
        assert_eq!(pr_number_from_url("https://github.com/acme/widgets/pull/482"), Some(482));
        assert_eq!(pr_number_from_url(""), None);
        assert_eq!(pr_number_from_url("https://github.com/acme/widgets/pull/abc"), None);
    }

    #[test]
    fn merge_instruction_block_mentions_base_branch() {
        let block = merge_instruction_block(MergeIssueKind::Conflict, "develop");
        assert!(block.contains("develop"));
        assert!(block.contains("rebase"));
    }

    #[test]
    fn worker_failed_comment_mentions_run_dir() {
        let comment = worker_failed_comment(42, 3);
        assert!(comment.contains("issue-42"));
        assert!(comment.contains('3'));
    }
}
