//! Core data types for the orchestrator.
//!
//! These types mirror the data model in the design document: `Issue`,
//! `TicketMetadata`, `RepoKind`/`RepoBinding`, `Worktree`, `AttemptRecord`,
//! `PIDFile`, `ExecutionTrace`, `IssueResult`, and `SessionLog`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for sessions and traces.
/// Uses `UUIDv7` for time-ordered lexicographic sorting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Kind of repository an issue's ticket targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepoKind {
    Root,
    Directory,
    Submodule,
}

impl RepoKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Root => "root",
            Self::Directory => "directory",
            Self::Submodule => "submodule",
        }
    }
}

impl Default for RepoKind {
    fn default() -> Self {
        Self::Root
    }
}

/// Verification commands configured for a repo binding.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerifyCommands {
    #[serde(default)]
    pub build: Option<String>,
    #[serde(default)]
    pub test: Option<String>,
}

/// A named repository binding declared in `workflow.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoBinding {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: RepoKind,
    #[serde(default)]
    pub verify: VerifyCommands,
}

/// Capability flags parsed from a ticket's `## Constraints` section.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketFlags {
    pub allow_parent_changes: bool,
    pub allow_script_changes: bool,
    pub allow_secrets: bool,
}

/// Metadata derived from an issue body (design doc "ticket model").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TicketMetadata {
    /// Defaults to `"root"` when absent.
    pub repo: String,
    pub severity: Option<String>,
    pub source: Option<String>,
    pub release: bool,
    pub spec_name: Option<String>,
    pub task_line: Option<String>,
    #[serde(default)]
    pub flags: TicketFlags,
    /// repo name -> verification shell commands, from the `## Verification` section.
    #[serde(default)]
    pub verification: std::collections::BTreeMap<String, Vec<String>>,
}

impl TicketMetadata {
    pub fn with_default_repo(repo: &str) -> Self {
        Self {
            repo: repo.to_string(),
            ..Default::default()
        }
    }
}

/// Per-issue worktree binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worktree {
    pub issue_id: u64,
    pub branch: String,
    pub base_branch: String,
    pub worktree_dir: String,
    pub work_dir: String,
}

impl Worktree {
    pub fn branch_name(issue_id: u64) -> String {
        format!("feat/ai-issue-{issue_id}")
    }
}

/// Per-issue attempt counter plus the on-disk journal location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub issue_id: u64,
    pub fail_count: u32,
    pub max_attempts: u32,
}

/// A single line appended to `failure_history.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureHistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub issue: u64,
    pub attempt: u32,
    pub pattern_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    pub retryable: bool,
}

/// Liveness record written at worker start, removed at worker completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PidFile {
    pub pid: u32,
    pub start_time_unix: u64,
    pub issue_id: u64,
    pub session_id: String,
    pub started_at: DateTime<Utc>,
}

/// Status of a single execution trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    Running,
    Success,
    Failed,
}

impl TraceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

/// Status of an individual trace step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Success,
    Failed,
}

/// A single named step within an `ExecutionTrace`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceStep {
    pub name: String,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_s: Option<f64>,
    pub error: Option<String>,
    #[serde(default)]
    pub context: serde_json::Value,
}

/// Per-issue structured execution trace, written by the Worker runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionTrace {
    pub trace_id: String,
    pub issue_id: u64,
    pub repo: String,
    pub branch: String,
    pub base_branch: String,
    pub status: TraceStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_s: Option<f64>,
    pub error: Option<String>,
    pub worker_pid: u32,
    pub worker_start_time: u64,
    pub steps: Vec<TraceStep>,
}

impl ExecutionTrace {
    pub fn new(issue_id: u64, repo: &str, branch: &str, base_branch: &str, worker_pid: u32, worker_start_time: u64) -> Self {
        Self {
            trace_id: Id::new().to_string(),
            issue_id,
            repo: repo.to_string(),
            branch: branch.to_string(),
            base_branch: base_branch.to_string(),
            status: TraceStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            duration_s: None,
            error: None,
            worker_pid,
            worker_start_time,
            steps: Vec::new(),
        }
    }
}

/// Terminal status of a worker run, written into `IssueResult.status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueResultStatus {
    Success,
    SuccessNoChanges,
    Failed,
    Crashed,
    Timeout,
    NeedsConflictResolution,
}

impl IssueResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::SuccessNoChanges => "success_no_changes",
            Self::Failed => "failed",
            Self::Crashed => "crashed",
            Self::Timeout => "timeout",
            Self::NeedsConflictResolution => "needs_conflict_resolution",
        }
    }
}

/// Submodule/parent post-push coherence label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyStatus {
    Consistent,
    SubmoduleCommittedParentFailed,
    SubmodulePushFailed,
    ParentPushFailedSubmodulePushed,
}

impl ConsistencyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Consistent => "consistent",
            Self::SubmoduleCommittedParentFailed => "submodule_committed_parent_failed",
            Self::SubmodulePushFailed => "submodule_push_failed",
            Self::ParentPushFailedSubmodulePushed => "parent_push_failed_submodule_pushed",
        }
    }
}

/// Session bookkeeping embedded in `IssueResult`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultSession {
    pub worker_session_id: String,
    pub principal_session_id: String,
    pub attempt_number: u32,
    #[serde(default)]
    pub previous_session_ids: Vec<String>,
    pub previous_failure_reason: Option<String>,
    pub worker_pid: u32,
    pub worker_start_time: u64,
}

/// Metrics embedded in `IssueResult`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultMetrics {
    pub duration_seconds: f64,
    pub retry_count: u32,
}

/// The canonical, atomic, per-issue outcome file and sole Worker -> Principal
/// communication channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueResult {
    pub issue_id: u64,
    pub status: IssueResultStatus,
    pub repo: String,
    pub repo_type: RepoKind,
    pub work_dir: String,
    pub worktree_path: String,
    pub branch: String,
    pub base_branch: String,
    pub head_sha: Option<String>,
    pub submodule_sha: Option<String>,
    pub consistency_status: Option<ConsistencyStatus>,
    pub failure_stage: Option<String>,
    pub recovery_command: Option<String>,
    pub timestamp_utc: DateTime<Utc>,
    pub pr_url: Option<String>,
    pub session: ResultSession,
    pub metrics: ResultMetrics,
}

impl IssueResult {
    /// Spec invariant: `status=success` implies a non-empty `pr_url`.
    pub fn is_anomalous_success(&self) -> bool {
        self.status == IssueResultStatus::Success && self.pr_url.as_deref().unwrap_or("").is_empty()
    }
}

/// An append-only record in the Principal's session journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionLogEntry {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub issue_id: Option<u64>,
    pub action: String,
    #[serde(default)]
    pub detail: serde_json::Value,
}

/// Detected merge-issue condition for a dispatched issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeIssueKind {
    Conflict,
    Rebase,
}

impl MergeIssueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Conflict => "conflict",
            Self::Rebase => "rebase",
        }
    }
}

/// Decision returned by the result checker after translating an `IssueResult`
/// or a bare `ExecutionTrace`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultDecision {
    Success,
    Wait,
    Retry,
    FailFinal,
    FailRecoverable,
    Unknown,
    NotFound,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_generates_unique_values() {
        let id1 = Id::new();
        let id2 = Id::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn issue_result_status_serializes_to_spec_strings() {
        assert_eq!(
            serde_json::to_string(&IssueResultStatus::SuccessNoChanges).unwrap(),
            "\"success_no_changes\""
        );
        assert_eq!(
            serde_json::to_string(&IssueResultStatus::NeedsConflictResolution).unwrap(),
            "\"needs_conflict_resolution\""
        );
    }

    #[test]
    fn consistency_status_serializes_to_spec_strings() {
        assert_eq!(
            serde_json::to_string(&ConsistencyStatus::SubmoduleCommittedParentFailed).unwrap(),
            "\"submodule_committed_parent_failed\""
        );
    }

    #[test]
    fn worktree_branch_name_matches_convention() {
        assert_eq!(Worktree::branch_name(42), "feat/ai-issue-42");
    }

    #[test]
    fn repo_kind_default_is_root() {
        assert_eq!(RepoKind::default(), RepoKind::Root);
    }

    #[test]
    fn ticket_metadata_default_repo_is_root() {
        let meta = TicketMetadata::with_default_repo("root");
        assert_eq!(meta.repo, "root");
        assert_eq!(meta.flags, TicketFlags::default());
    }

    #[test]
    fn issue_result_anomalous_success_detection() {
        let result = IssueResult {
            issue_id: 1,
            status: IssueResultStatus::Success,
            repo: "root".into(),
            repo_type: RepoKind::Root,
            work_dir: "/tmp".into(),
            worktree_path: "/tmp/wt".into(),
            branch: "feat/ai-issue-1".into(),
            base_branch: "develop".into(),
            head_sha: None,
            submodule_sha: None,
            consistency_status: None,
            failure_stage: None,
            recovery_command: None,
            timestamp_utc: Utc::now(),
            pr_url: None,
            session: ResultSession {
                worker_session_id: "w".into(),
                principal_session_id: "p".into(),
                attempt_number: 1,
                previous_session_ids: vec![],
                previous_failure_reason: None,
                worker_pid: 1,
                worker_start_time: 0,
            },
            metrics: ResultMetrics {
                duration_seconds: 1.0,
                retry_count: 0,
            },
        };
        assert!(result.is_anomalous_success());
    }
}
