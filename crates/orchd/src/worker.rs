//! Worker runner: the end-to-end single-issue execution. Owns its worktree
//! and its own PID/trace files exclusively; the `IssueResult` it writes is
//! the sole Worker -> Principal communication channel.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::Utc;
use orch_core::{
    check_secrets, parse_ticket_body, protected_path_violations, submodule_boundary_violations,
    AttemptGuard, ConsistencyStatus, Id, IssueResult, IssueResultStatus, MergeIssueKind, PidFile,
    RepoBinding, RepoKind, ResultMetrics, ResultSession, StateStoreError, StepStatus,
    TicketMetadata, TraceRecorder, TraceStatus,
};
use orch_core::state_store;
use thiserror::Error;
use tracing::warn;

use crate::backend::{BackendOpts, BackendRegistry};
use crate::host::HostAdapter;
use crate::preflight;
use crate::scm;
use crate::worktree;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    StateStore(#[from] StateStoreError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WorkerError>;

/// Everything the Worker needs that is not derivable from the ticket body
/// itself: which attempt this is, what happened last time, and which repo
/// to target if the dispatcher is overriding the ticket's own `Repo:` line.
#[derive(Debug, Clone, Default)]
pub struct WorkerContext {
    pub repo_override: Option<String>,
    pub previous_session_ids: Vec<String>,
    pub previous_failure_reason: Option<String>,
    pub merge_issue: Option<MergeIssueKind>,
    pub backend_name: String,
}

pub struct WorkerRunner<'a> {
    pub state_root: PathBuf,
    pub repo_root: PathBuf,
    pub global_log_dir: PathBuf,
    pub config: &'a orch_core::Config,
    pub host: &'a dyn HostAdapter,
    pub backends: &'a BackendRegistry,
    pub principal_session_id: String,
    pub worker_run_timeout: Duration,
}

/// Workflow-internal paths unstaged before a root-kind commit, so a
/// Worker's run never commits the orchestrator's own state alongside the
/// user's change.
const WORKFLOW_INTERNAL_PATHS: &[&str] = &[".ai", ".worktrees"];

/// `.ai/results/issue-<id>.json`: shared with the Dispatcher, which reads it
/// back to re-verify a merge-issue's PR state and the Result checker, which
/// reads it to translate status into a [`orch_core::ResultDecision`].
pub(crate) fn result_path(state_root: &Path, issue_id: u64) -> PathBuf {
    state_root.join(".ai/results").join(format!("issue-{issue_id}.json"))
}

/// `.ai/state/pids/issue-<id>.json`: shared with the Dispatcher (safety-net
/// removal on a non-success exit) and the Result checker (crash/timeout
/// liveness probing).
pub(crate) fn pid_path(state_root: &Path, issue_id: u64) -> PathBuf {
    state_root.join(".ai/state/pids").join(format!("issue-{issue_id}.json"))
}

/// `.ai/state/traces/issue-<id>.json`: shared with the Result checker, which
/// reads the trace back when no `IssueResult` has been written yet.
pub(crate) fn trace_path(state_root: &Path, issue_id: u64) -> PathBuf {
    state_root.join(".ai/state/traces").join(format!("issue-{issue_id}.json"))
}

impl<'a> WorkerRunner<'a> {
    fn result_path(&self, issue_id: u64) -> PathBuf {
        result_path(&self.state_root, issue_id)
    }

    fn trace_path(&self, issue_id: u64) -> PathBuf {
        trace_path(&self.state_root, issue_id)
    }

    fn pid_path(&self, issue_id: u64) -> PathBuf {
        pid_path(&self.state_root, issue_id)
    }

    fn run_dir(&self, issue_id: u64) -> PathBuf {
        self.state_root.join(".ai/runs").join(format!("issue-{issue_id}"))
    }

    /// Run the full single-issue lifecycle, returning the `IssueResult`
    /// that was also durably written to `.ai/results/issue-<id>.json`.
    pub async fn run(&self, issue_id: u64, ticket_body: &str, ctx: WorkerContext) -> Result<IssueResult> {
        let start = Instant::now();
        let worker_session_id = Id::new().to_string();

        // Step 1: parse ticket, derive metadata, validate against config.
        let default_repo = ctx.repo_override.clone().unwrap_or_else(|| "root".to_string());
        let parsed = parse_ticket_body(ticket_body, &default_repo);
        let metadata = parsed.metadata;

        let binding = self.resolve_binding(&metadata.repo);
        let (repo_kind, repo_path) = match &binding {
            Some(b) => (b.kind, Some(b.path.clone())),
            None if metadata.repo == "root" => (RepoKind::Root, None),
            None => {
                return self
                    .write_failure(
                        issue_id,
                        &metadata,
                        &worker_session_id,
                        &ctx,
                        0,
                        "ticket_validation",
                        start.elapsed(),
                        None,
                    )
                    .await;
            }
        };

        if metadata.release && repo_kind != RepoKind::Root {
            return self
                .write_failure(
                    issue_id,
                    &metadata,
                    &worker_session_id,
                    &ctx,
                    0,
                    "ticket_validation",
                    start.elapsed(),
                    None,
                )
                .await;
        }

        let branch = format!("feat/ai-issue-{issue_id}");
        let base_branch = self.config.base_branch(metadata.release).to_string();

        // Step 2: attempt guard.
        let max_attempts = self.config.escalation.max_attempts();
        let guard = AttemptGuard::new(&self.state_root, issue_id, max_attempts);
        let check = guard.check()?;
        if !check.can_proceed {
            return self
                .write_failure(
                    issue_id,
                    &metadata,
                    &worker_session_id,
                    &ctx,
                    check.attempt,
                    "max_attempts_exceeded",
                    start.elapsed(),
                    None,
                )
                .await;
        }
        let attempt_number = check.attempt;

        // Step 3: preflight.
        let origin_url = binding.as_ref().and_then(|b| {
            if repo_kind == RepoKind::Submodule {
                submodule_origin_url(&self.repo_root, &b.path)
            } else {
                None
            }
        });
        if let Err(e) = preflight::check(
            &self.state_root,
            &self.repo_root,
            repo_kind,
            repo_path.as_deref(),
            origin_url.as_deref(),
        )
        .await
        {
            warn!(issue_id, error = %e, "preflight failed");
            return self
                .write_failure(
                    issue_id,
                    &metadata,
                    &worker_session_id,
                    &ctx,
                    attempt_number,
                    "preflight",
                    start.elapsed(),
                    None,
                )
                .await;
        }

        // Step 4: worktree setup + trace recorder + PID file.
        let handle = match worktree::setup(
            &self.repo_root,
            issue_id,
            &branch,
            repo_kind,
            repo_path.as_deref(),
            &base_branch,
        )
        .await
        {
            Ok(h) => h,
            Err(e) => {
                warn!(issue_id, error = %e, "worktree setup failed");
                return self
                    .write_failure(
                        issue_id,
                        &metadata,
                        &worker_session_id,
                        &ctx,
                        attempt_number,
                        "worktree_setup",
                        start.elapsed(),
                        None,
                    )
                    .await;
            }
        };

        let pid = std::process::id();
        let worker_start_time = process_start_time_unix(pid);
        let mut trace = TraceRecorder::start(
            &self.trace_path(issue_id),
            issue_id,
            &metadata.repo,
            &branch,
            &base_branch,
            pid,
            worker_start_time,
        )?;
        state_store::write_json(
            &self.pid_path(issue_id),
            &PidFile {
                pid,
                start_time_unix: worker_start_time,
                issue_id,
                session_id: worker_session_id.clone(),
                started_at: Utc::now(),
            },
        )?;
        let _pid_cleanup = crate::cleanup::DropGuard::new({
            let pid_path = self.pid_path(issue_id);
            move || {
                let _ = std::fs::remove_file(&pid_path);
            }
        });

        // A prior dispatch left this branch behind the base branch: rebase
        // before re-running the backend so the agent works on top of
        // current history. An unresolvable rebase is a terminal outcome
        // the operator must resolve by hand.
        if let Some(kind) = ctx.merge_issue {
            if scm::rebase_onto(&handle.worktree_dir, &base_branch).await.is_err() {
                let _ = scm::rebase_abort(&handle.worktree_dir).await;
                trace.finish(TraceStatus::Failed, Some(format!("unresolved {} against {base_branch}", kind.as_str())))?;
                return self
                    .write_conflict(issue_id, &metadata, &worker_session_id, &ctx, attempt_number, &handle, kind)
                    .await;
            }
        }

        // Step 5: build the prompt.
        let prior_feedback = if ctx.previous_failure_reason.is_some() {
            self.host
                .get_latest_review_blocked_reason(issue_id)
                .await
                .unwrap_or_default()
        } else {
            String::new()
        };
        let prompt = build_prompt(&parsed.body, repo_kind, repo_path.as_deref(), &prior_feedback);

        // Step 6: invoke the backend with retry/backoff.
        let step_idx = trace.begin_step("backend_invocation")?;
        let backend = match self.backends.get(&ctx.backend_name) {
            Ok(b) => b,
            Err(e) => {
                trace.finish_step(step_idx, StepStatus::Failed, Some(e.to_string()), serde_json::Value::Null)?;
                trace.finish(TraceStatus::Failed, Some(e.to_string()))?;
                return self
                    .write_failure(
                        issue_id,
                        &metadata,
                        &worker_session_id,
                        &ctx,
                        attempt_number,
                        "backend_unknown",
                        start.elapsed(),
                        Some(&handle),
                    )
                    .await;
            }
        };
        let opts = BackendOpts {
            prompt,
            working_dir: handle.work_dir.clone(),
            log_dir: self.global_log_dir.join("issues").join(issue_id.to_string()),
            max_attempts: 3,
            retry_delay: Duration::from_secs(5),
            timeout: crate::backend::DEFAULT_TIMEOUT,
        };
        let backend_result = backend.execute(&opts).await;
        let backend_result = match backend_result {
            Ok(r) => r,
            Err(e) => {
                trace.finish_step(step_idx, StepStatus::Failed, Some(e.to_string()), serde_json::Value::Null)?;
                trace.finish(TraceStatus::Failed, Some(e.to_string()))?;
                return self
                    .write_failure(
                        issue_id,
                        &metadata,
                        &worker_session_id,
                        &ctx,
                        attempt_number,
                        "backend_invocation",
                        start.elapsed(),
                        Some(&handle),
                    )
                    .await;
            }
        };

        if !backend_result.succeeded {
            trace.finish_step(
                step_idx,
                StepStatus::Failed,
                backend_result.failure_reason.clone(),
                serde_json::json!({"attempts": backend_result.attempts}),
            )?;
            let stage = backend_result.failure_stage.clone().unwrap_or_else(|| "backend_invocation".to_string());
            trace.finish(TraceStatus::Failed, backend_result.failure_reason.clone())?;
            return self
                .write_failure(
                    issue_id,
                    &metadata,
                    &worker_session_id,
                    &ctx,
                    attempt_number,
                    &stage,
                    start.elapsed(),
                    Some(&handle),
                )
                .await;
        }
        trace.finish_step(
            step_idx,
            StepStatus::Success,
            None,
            serde_json::json!({"attempts": backend_result.attempts}),
        )?;

        // Step 7: audit summary (git status --porcelain + git diff).
        if let Err(e) = self.write_audit_summary(issue_id, &handle.work_dir).await {
            warn!(issue_id, error = %e, "failed to write audit summary (non-fatal)");
        }

        // Step 8: stage changes + security gate.
        if let Err(e) = scm::add_all(&handle.worktree_dir).await {
            trace.finish(TraceStatus::Failed, Some(e.to_string()))?;
            return self
                .write_failure(
                    issue_id,
                    &metadata,
                    &worker_session_id,
                    &ctx,
                    attempt_number,
                    "git_add",
                    start.elapsed(),
                    Some(&handle),
                )
                .await;
        }
        if repo_kind == RepoKind::Root {
            for path in WORKFLOW_INTERNAL_PATHS {
                let _ = scm::unstage(&handle.worktree_dir, path).await;
            }
        }

        let staged_paths = scm::diff_cached_name_only(&handle.worktree_dir).await.unwrap_or_default();
        let diff_text = scm::diff_cached(&handle.worktree_dir).await.unwrap_or_default();

        let mut violations: Vec<String> = Vec::new();
        violations.extend(
            protected_path_violations(&staged_paths, &metadata.flags, &[], orch_core::DEFAULT_PROTECTED_PREFIXES)
                .into_iter(),
        );
        violations.extend(check_secrets(&diff_text, &metadata.flags).into_iter().map(|m| m.rule.to_string()));
        if repo_kind == RepoKind::Submodule {
            if let Some(path) = &repo_path {
                violations.extend(submodule_boundary_violations(&staged_paths, path, &metadata.flags));
            }
        }

        if !violations.is_empty() {
            warn!(issue_id, ?violations, "security gate blocked commit");
            trace.finish(TraceStatus::Failed, Some(format!("security violations: {}", violations.join(", "))))?;
            // Violations abort before commit; the worktree is not removed.
            return self
                .write_failure(
                    issue_id,
                    &metadata,
                    &worker_session_id,
                    &ctx,
                    attempt_number,
                    "security_check",
                    start.elapsed(),
                    Some(&handle),
                )
                .await;
        }

        // Step 9: commit.
        let commit_message = normalize_commit_message(&metadata.task_line.clone().unwrap_or_default());
        let mut consistency = None;
        let mut submodule_sha = None;

        match repo_kind {
            RepoKind::Root | RepoKind::Directory => {
                if staged_paths.is_empty() {
                    trace.finish(TraceStatus::Failed, Some("no staged changes".to_string()))?;
                    return self
                        .finalize_success_no_changes(issue_id, &metadata, &worker_session_id, &ctx, attempt_number, start.elapsed(), &handle)
                        .await;
                }
                if let Err(e) = scm::commit(&handle.worktree_dir, &commit_message).await {
                    trace.finish(TraceStatus::Failed, Some(e.to_string()))?;
                    return self
                        .write_failure(
                            issue_id,
                            &metadata,
                            &worker_session_id,
                            &ctx,
                            attempt_number,
                            "git_commit",
                            start.elapsed(),
                            Some(&handle),
                        )
                        .await;
                }
            }
            RepoKind::Submodule => {
                let path = repo_path.as_deref().expect("submodule binding always has a path");
                let submodule_dir = handle.worktree_dir.join(path);
                if let Err(e) = scm::commit(&submodule_dir, &commit_message).await {
                    trace.finish(TraceStatus::Failed, Some(e.to_string()))?;
                    return self
                        .write_failure(
                            issue_id,
                            &metadata,
                            &worker_session_id,
                            &ctx,
                            attempt_number,
                            "git_commit",
                            start.elapsed(),
                            Some(&handle),
                        )
                        .await;
                }
                submodule_sha = scm::rev_parse_head(&submodule_dir).await.ok();
                if let Err(e) = scm::commit(&handle.worktree_dir, &commit_message).await {
                    consistency = Some(ConsistencyStatus::SubmoduleCommittedParentFailed);
                    trace.finish(TraceStatus::Failed, Some(e.to_string()))?;
                    return self
                        .write_submodule_failure(
                            issue_id,
                            &metadata,
                            &worker_session_id,
                            &ctx,
                            attempt_number,
                            "git_commit",
                            start.elapsed(),
                            &handle,
                            submodule_sha,
                            consistency,
                        )
                        .await;
                }
                consistency = Some(ConsistencyStatus::Consistent);
            }
        }

        // Step 10: push.
        match repo_kind {
            RepoKind::Root | RepoKind::Directory => {
                if let Err(e) = scm::push_set_upstream(&handle.worktree_dir, &branch).await {
                    trace.finish(TraceStatus::Failed, Some(e.to_string()))?;
                    return self
                        .write_failure(
                            issue_id,
                            &metadata,
                            &worker_session_id,
                            &ctx,
                            attempt_number,
                            "git_push",
                            start.elapsed(),
                            Some(&handle),
                        )
                        .await;
                }
            }
            RepoKind::Submodule => {
                let path = repo_path.as_deref().expect("submodule binding always has a path");
                let submodule_dir = handle.worktree_dir.join(path);
                if let Err(e) = scm::push_set_upstream(&submodule_dir, &branch).await {
                    warn!(issue_id, error = %e, "submodule push failed");
                    trace.finish(TraceStatus::Failed, Some(e.to_string()))?;
                    return self
                        .write_submodule_failure(
                            issue_id,
                            &metadata,
                            &worker_session_id,
                            &ctx,
                            attempt_number,
                            "git_push",
                            start.elapsed(),
                            &handle,
                            submodule_sha,
                            Some(ConsistencyStatus::SubmodulePushFailed),
                        )
                        .await;
                }
                if let Err(e) = scm::push_set_upstream(&handle.worktree_dir, &branch).await {
                    trace.finish(TraceStatus::Failed, Some(e.to_string()))?;
                    return self
                        .write_submodule_failure(
                            issue_id,
                            &metadata,
                            &worker_session_id,
                            &ctx,
                            attempt_number,
                            "git_push",
                            start.elapsed(),
                            &handle,
                            submodule_sha,
                            Some(ConsistencyStatus::ParentPushFailedSubmodulePushed),
                        )
                        .await;
                }
            }
        }

        // Step 11: create-or-find PR.
        let title = normalize_pr_title(&metadata.task_line.clone().unwrap_or_default(), issue_id);
        let body = format!("Closes #{issue_id}\n\n{title}");
        let pr = match self.host.get_pr_by_branch(&branch).await {
            Ok(Some(existing)) => existing,
            _ => match self.host.create_pr(&branch, &base_branch, &title, &body).await {
                Ok(pr) => pr,
                Err(e) => {
                    trace.finish(TraceStatus::Failed, Some(e.to_string()))?;
                    return self
                        .write_failure(
                            issue_id,
                            &metadata,
                            &worker_session_id,
                            &ctx,
                            attempt_number,
                            "pr_create",
                            start.elapsed(),
                            Some(&handle),
                        )
                        .await;
                }
            },
        };

        let head_sha = scm::rev_parse_head(&handle.worktree_dir).await.ok();

        // Step 12: write the success IssueResult, reset fail_count, comment.
        guard.reset()?;
        trace.finish(TraceStatus::Success, None)?;

        let result = IssueResult {
            issue_id,
            status: IssueResultStatus::Success,
            repo: metadata.repo.clone(),
            repo_type: repo_kind,
            work_dir: handle.work_dir.to_string_lossy().to_string(),
            worktree_path: handle.worktree_dir.to_string_lossy().to_string(),
            branch: branch.clone(),
            base_branch: base_branch.clone(),
            head_sha,
            submodule_sha,
            consistency_status: consistency,
            failure_stage: None,
            recovery_command: None,
            timestamp_utc: Utc::now(),
            pr_url: Some(pr.url.clone()),
            session: ResultSession {
                worker_session_id,
                principal_session_id: self.principal_session_id.clone(),
                attempt_number,
                previous_session_ids: ctx.previous_session_ids.clone(),
                previous_failure_reason: ctx.previous_failure_reason.clone(),
                worker_pid: pid,
                worker_start_time,
            },
            metrics: ResultMetrics {
                duration_seconds: start.elapsed().as_secs_f64(),
                retry_count: backend_result.retry_count,
            },
        };
        state_store::write_json(&self.result_path(issue_id), &result)?;
        let _ = self
            .host
            .comment_on_issue(issue_id, "worker_complete: pull request opened, see linked PR.")
            .await;
        Ok(result)
    }

    async fn write_audit_summary(&self, issue_id: u64, work_dir: &Path) -> Result<()> {
        let status = scm::status_porcelain(work_dir).await.unwrap_or_default();
        let diff_text = scm::diff(work_dir).await.unwrap_or_default();
        let summary = format!("## git status --porcelain\n{status}\n\n## git diff\n{diff_text}\n");
        let path = self.run_dir(issue_id).join("summary.txt");
        std::fs::create_dir_all(self.run_dir(issue_id))?;
        std::fs::write(path, summary)?;
        Ok(())
    }

    fn resolve_binding(&self, repo_name: &str) -> Option<RepoBinding> {
        self.config.find_repo(repo_name).cloned()
    }

    #[allow(clippy::too_many_arguments)]
    async fn write_failure(
        &self,
        issue_id: u64,
        metadata: &TicketMetadata,
        worker_session_id: &str,
        ctx: &WorkerContext,
        attempt_number: u32,
        failure_stage: &str,
        elapsed: Duration,
        handle: Option<&worktree::WorktreeHandle>,
    ) -> Result<IssueResult> {
        let guard = AttemptGuard::new(&self.state_root, issue_id, self.config.escalation.max_attempts());
        guard.record_failure(orch_core::FailureHistoryEntry {
            timestamp: Utc::now(),
            issue: issue_id,
            attempt: attempt_number,
            pattern_id: None,
            kind: failure_stage.to_string(),
            retryable: failure_stage != "security_check" && failure_stage != "ticket_validation",
        })?;

        let (branch, base_branch, work_dir, worktree_path) = match handle {
            Some(h) => (
                h.branch.clone(),
                h.base_branch.clone(),
                h.work_dir.to_string_lossy().to_string(),
                h.worktree_dir.to_string_lossy().to_string(),
            ),
            None => (
                format!("feat/ai-issue-{issue_id}"),
                self.config.base_branch(metadata.release).to_string(),
                String::new(),
                String::new(),
            ),
        };

        let result = IssueResult {
            issue_id,
            status: IssueResultStatus::Failed,
            repo: metadata.repo.clone(),
            repo_type: RepoKind::Root,
            work_dir,
            worktree_path,
            branch,
            base_branch,
            head_sha: None,
            submodule_sha: None,
            consistency_status: None,
            failure_stage: Some(failure_stage.to_string()),
            recovery_command: None,
            timestamp_utc: Utc::now(),
            pr_url: None,
            session: ResultSession {
                worker_session_id: worker_session_id.to_string(),
                principal_session_id: self.principal_session_id.clone(),
                attempt_number,
                previous_session_ids: ctx.previous_session_ids.clone(),
                previous_failure_reason: ctx.previous_failure_reason.clone(),
                worker_pid: std::process::id(),
                worker_start_time: process_start_time_unix(std::process::id()),
            },
            metrics: ResultMetrics {
                duration_seconds: elapsed.as_secs_f64(),
                retry_count: 0,
            },
        };
        state_store::write_json(&self.result_path(issue_id), &result)?;
        Ok(result)
    }

    #[allow(clippy::too_many_arguments)]
    async fn write_submodule_failure(
        &self,
        issue_id: u64,
        metadata: &TicketMetadata,
        worker_session_id: &str,
        ctx: &WorkerContext,
        attempt_number: u32,
        failure_stage: &str,
        elapsed: Duration,
        handle: &worktree::WorktreeHandle,
        submodule_sha: Option<String>,
        consistency: Option<ConsistencyStatus>,
    ) -> Result<IssueResult> {
        let mut result = self
            .write_failure(
                issue_id,
                metadata,
                worker_session_id,
                ctx,
                attempt_number,
                failure_stage,
                elapsed,
                Some(handle),
            )
            .await?;
        result.repo_type = RepoKind::Submodule;
        result.submodule_sha = submodule_sha;
        result.consistency_status = consistency;
        // Terminal failure with a non-"consistent" status must carry a
        // concrete recovery command.
        result.recovery_command = Some(recovery_command_for(consistency, &handle.branch));
        state_store::write_json(&self.result_path(issue_id), &result)?;
        Ok(result)
    }

    /// An inherited branch could not be rebased cleanly onto the base
    /// branch; the worktree is left in place (post-abort, so usable) for a
    /// human to resolve.
    async fn write_conflict(
        &self,
        issue_id: u64,
        metadata: &TicketMetadata,
        worker_session_id: &str,
        ctx: &WorkerContext,
        attempt_number: u32,
        handle: &worktree::WorktreeHandle,
        kind: MergeIssueKind,
    ) -> Result<IssueResult> {
        let result = IssueResult {
            issue_id,
            status: IssueResultStatus::NeedsConflictResolution,
            repo: metadata.repo.clone(),
            repo_type: RepoKind::Root,
            work_dir: handle.work_dir.to_string_lossy().to_string(),
            worktree_path: handle.worktree_dir.to_string_lossy().to_string(),
            branch: handle.branch.clone(),
            base_branch: handle.base_branch.clone(),
            head_sha: None,
            submodule_sha: None,
            consistency_status: None,
            failure_stage: Some(format!("merge_{}", kind.as_str())),
            recovery_command: Some(format!(
                "cd {} && git rebase origin/{} # resolve conflicts, then git rebase --continue",
                handle.worktree_dir.display(),
                handle.base_branch
            )),
            timestamp_utc: Utc::now(),
            pr_url: None,
            session: ResultSession {
                worker_session_id: worker_session_id.to_string(),
                principal_session_id: self.principal_session_id.clone(),
                attempt_number,
                previous_session_ids: ctx.previous_session_ids.clone(),
                previous_failure_reason: ctx.previous_failure_reason.clone(),
                worker_pid: std::process::id(),
                worker_start_time: process_start_time_unix(std::process::id()),
            },
            metrics: ResultMetrics {
                duration_seconds: 0.0,
                retry_count: 0,
            },
        };
        state_store::write_json(&self.result_path(issue_id), &result)?;
        Ok(result)
    }

    #[allow(clippy::too_many_arguments)]
    async fn finalize_success_no_changes(
        &self,
        issue_id: u64,
        metadata: &TicketMetadata,
        worker_session_id: &str,
        ctx: &WorkerContext,
        attempt_number: u32,
        elapsed: Duration,
        handle: &worktree::WorktreeHandle,
    ) -> Result<IssueResult> {
        let guard = AttemptGuard::new(&self.state_root, issue_id, self.config.escalation.max_attempts());
        guard.reset()?;
        let result = IssueResult {
            issue_id,
            status: IssueResultStatus::SuccessNoChanges,
            repo: metadata.repo.clone(),
            repo_type: RepoKind::Root,
            work_dir: handle.work_dir.to_string_lossy().to_string(),
            worktree_path: handle.worktree_dir.to_string_lossy().to_string(),
            branch: handle.branch.clone(),
            base_branch: handle.base_branch.clone(),
            head_sha: scm::rev_parse_head(&handle.worktree_dir).await.ok(),
            submodule_sha: None,
            consistency_status: None,
            failure_stage: None,
            recovery_command: None,
            timestamp_utc: Utc::now(),
            pr_url: None,
            session: ResultSession {
                worker_session_id: worker_session_id.to_string(),
                principal_session_id: self.principal_session_id.clone(),
                attempt_number,
                previous_session_ids: ctx.previous_session_ids.clone(),
                previous_failure_reason: ctx.previous_failure_reason.clone(),
                worker_pid: std::process::id(),
                worker_start_time: process_start_time_unix(std::process::id()),
            },
            metrics: ResultMetrics {
                duration_seconds: elapsed.as_secs_f64(),
                retry_count: 0,
            },
        };
        state_store::write_json(&self.result_path(issue_id), &result)?;
        Ok(result)
    }
}

fn recovery_command_for(consistency: Option<ConsistencyStatus>, branch: &str) -> String {
    match consistency {
        Some(ConsistencyStatus::SubmoduleCommittedParentFailed) => {
            format!("cd <worktree> && git add <submodule_path> && git commit -m 'chore: update submodule pointer' && git push -u origin {branch}")
        }
        Some(ConsistencyStatus::SubmodulePushFailed) => {
            format!("cd <worktree>/<submodule_path> && git push -u origin {branch}")
        }
        Some(ConsistencyStatus::ParentPushFailedSubmodulePushed) => {
            format!("cd <worktree> && git push -u origin {branch}")
        }
        _ => String::new(),
    }
}

/// Build the prompt the backend CLI receives on stdin: repo rules
/// reference, work-dir instruction by kind, the ticket body, prior review
/// feedback (if any), and the forbidden-operation clauses from spec
/// Section 4.I step 5.
fn build_prompt(ticket_body: &str, kind: RepoKind, repo_path: Option<&str>, prior_feedback: &str) -> String {
    let work_dir_instruction = match kind {
        RepoKind::Root => {
            "You are working at the root of the repository.".to_string()
        }
        RepoKind::Directory => format!(
            "This is a monorepo change. Make your edits under `{}`; reference other paths relative to the repository root.",
            repo_path.unwrap_or("")
        ),
        RepoKind::Submodule => format!(
            "This change targets the submodule at `{}`. Do NOT edit any file outside this directory — \
             the parent repository's pointer to this submodule is updated automatically after your commit.",
            repo_path.unwrap_or("")
        ),
    };

    let mut sections = vec![
        "## Repo rules".to_string(),
        work_dir_instruction,
        String::new(),
        "## Task".to_string(),
        ticket_body.trim().to_string(),
    ];

    if !prior_feedback.trim().is_empty() {
        sections.push(String::new());
        sections.push("## Prior review feedback".to_string());
        sections.push(prior_feedback.trim().to_string());
    }

    sections.push(String::new());
    sections.push("## Constraints".to_string());
    sections.push(
        "You MUST NOT read any file under `state/principal/` or the session journal. \
         You MUST NOT run `git` yourself — commits, pushes, and PR creation happen \
         after you finish. You MUST NOT create pull requests."
            .to_string(),
    );

    sections.join("\n")
}

/// Commit-message normalization: `[type] subject`, lowercase, stripped to
/// `[a-z0-9 _-]`, default type `chore`, default subject `issue`.
pub fn normalize_commit_message(raw: &str) -> String {
    const TYPES: &[&str] = &["feat", "fix", "docs", "style", "refactor", "perf", "test", "chore"];

    let trimmed = raw.trim();
    let (kind, subject) = if let Some(rest) = trimmed.strip_prefix('[') {
        if let Some((kind, rest)) = rest.split_once(']') {
            (kind.trim(), rest.trim())
        } else {
            ("", trimmed)
        }
    } else {
        ("", trimmed)
    };

    let kind = kind.to_ascii_lowercase();
    let kind = if TYPES.contains(&kind.as_str()) { kind } else { "chore".to_string() };

    let subject: String = subject
        .to_ascii_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == ' ' || *c == '_' || *c == '-')
        .collect();
    let subject = subject.trim().to_string();
    let subject = if subject.is_empty() { "issue".to_string() } else { subject };

    format!("[{kind}] {subject}")
}

fn normalize_pr_title(task_line: &str, issue_id: u64) -> String {
    let trimmed = task_line.trim();
    if trimmed.is_empty() {
        format!("Issue #{issue_id}")
    } else {
        trimmed.to_string()
    }
}

/// Submodule origin URL lookup for Preflight's reachability probe: resolve
/// the submodule's `.git` file (a `gitdir: <path>` pointer, not a real repo)
/// to its real git directory, then read `remote.origin.url` from its config.
fn submodule_origin_url(repo_root: &Path, repo_path: &str) -> Option<String> {
    let dot_git = repo_root.join(repo_path).join(".git");
    let pointer = std::fs::read_to_string(&dot_git).ok()?;
    let gitdir_rel = pointer.trim().strip_prefix("gitdir: ")?;
    let gitdir = repo_root.join(repo_path).join(gitdir_rel);
    let config = std::fs::read_to_string(gitdir.join("config")).ok()?;

    let mut in_origin_section = false;
    for line in config.lines() {
        let line = line.trim();
        if line.starts_with('[') {
            in_origin_section = line == "[remote \"origin\"]";
            continue;
        }
        if in_origin_section {
            if let Some(url) = line.strip_prefix("url = ").or_else(|| line.strip_prefix("url=")) {
                return Some(url.trim().to_string());
            }
        }
    }
    None
}

/// Process start time, used only to disambiguate PID reuse in the PIDFile;
/// best-effort and platform-dependent, defaulting to 0 when unavailable.
#[cfg(target_os = "linux")]
fn process_start_time_unix(pid: u32) -> u64 {
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            let after_comm = stat.rsplit_once(')')?.1;
            after_comm.split_whitespace().nth(19)?.parse().ok()
        })
        .unwrap_or(0)
}

#[cfg(not(target_os = "linux"))]
fn process_start_time_unix(_pid: u32) -> u64 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_bracketed_type_and_subject() {
        assert_eq!(normalize_commit_message("[Fix] Handle Null Pointer!"), "[fix] handle null pointer");
    }

    #[test]
    fn defaults_type_to_chore_when_absent_or_unknown() {
        assert_eq!(normalize_commit_message("Add a feature"), "[chore] add a feature");
        assert_eq!(normalize_commit_message("[bogus] thing"), "[chore] thing");
    }

    #[test]
    fn defaults_subject_to_issue_when_blank() {
        assert_eq!(normalize_commit_message(""), "[chore] issue");
        assert_eq!(normalize_commit_message("[feat]"), "[chore] issue");
    }

    #[test]
    fn matches_spec_regex() {
        let re = regex::Regex::new(r"^\[[a-z]+\] [a-z0-9 _-]+$").unwrap();
        for raw in ["[Feat] Add Widget", "just text", "[docs] update README.md (v2)", ""] {
            assert!(re.is_match(&normalize_commit_message(raw)), "failed for {raw:?}");
        }
    }

    #[test]
    fn build_prompt_includes_submodule_boundary_warning() {
        let prompt = build_prompt("fix the bug", RepoKind::Submodule, Some("services/backend"), "");
        assert!(prompt.contains("Do NOT edit any file outside this directory"));
        assert!(prompt.contains("services/backend"));
    }

    #[test]
    fn build_prompt_includes_prior_feedback_section_when_present() {
        let prompt = build_prompt("fix it", RepoKind::Root, None, "Previous attempt left a failing test.");
        assert!(prompt.contains("## Prior review feedback"));
        assert!(prompt.contains("failing test"));
    }

    #[test]
    fn build_prompt_omits_feedback_section_when_absent() {
        let prompt = build_prompt("fix it", RepoKind::Root, None, "");
        assert!(!prompt.contains("## Prior review feedback"));
    }

    #[test]
    fn submodule_origin_url_reads_remote_from_gitdir_config() {
        let root = tempfile::tempdir().unwrap();
        let sub_dir = root.path().join("services/backend");
        let gitdir = root.path().join(".git/modules/services/backend");
        std::fs::create_dir_all(&sub_dir).unwrap();
        std::fs::create_dir_all(&gitdir).unwrap();
        std::fs::write(sub_dir.join(".git"), "gitdir: ../../.git/modules/services/backend\n").unwrap();
        std::fs::write(
            gitdir.join("config"),
            "[core]\n\trepositoryformatversion = 0\n[remote \"origin\"]\n\turl = git@example.com:org/backend.git\n\tfetch = +refs/heads/*:refs/remotes/origin/*\n",
        )
        .unwrap();

        let url = submodule_origin_url(root.path(), "services/backend");
        assert_eq!(url.as_deref(), Some("git@example.com:org/backend.git"));
    }

    #[test]
    fn submodule_origin_url_is_none_when_git_file_missing() {
        let root = tempfile::tempdir().unwrap();
        assert!(submodule_origin_url(root.path(), "services/backend").is_none());
    }
}
