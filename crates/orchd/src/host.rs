//! Host adapter: issue and PR reads/writes against the cloud issue/PR host.
//!
//! Wraps the `gh` CLI (`Command::new("gh")`, JSON output parsed with
//! `serde_json`, stderr captured into the error on non-zero exit) via async
//! `tokio::process::Command` with a per-attempt retry/backoff idiom. Every
//! call runs under a per-op timeout (default 30s) and is retried with
//! exponential backoff on transient failures.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::warn;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum HostError {
    #[error("host command `{command}` timed out after {timeout_secs}s")]
    Timeout { command: String, timeout_secs: u64 },
    #[error("host command `{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
    #[error("failed to execute host CLI: {0}")]
    Exec(#[from] std::io::Error),
    #[error("failed to parse host response for `{command}`: {source}")]
    Parse {
        command: String,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, HostError>;

/// Issue state/label/body projection consumed from the host.
#[derive(Debug, Clone, Deserialize)]
pub struct HostIssue {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
    pub state: String,
}

impl HostIssue {
    /// Eligible iff open, carries `ai-task`, and carries neither
    /// `worker-failed` nor `in-progress`.
    pub fn is_eligible(&self) -> bool {
        self.state == "open"
            && self.labels.iter().any(|l| l == "ai-task")
            && !self.labels.iter().any(|l| l == "worker-failed")
            && !self.labels.iter().any(|l| l == "in-progress")
    }
}

#[derive(Debug, Clone)]
pub struct PullRequest {
    pub number: u64,
    pub url: String,
    pub state: String,
    pub base_branch: String,
    pub merge_state_status: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeState {
    Clean,
    Dirty,
    Behind,
    Blocked,
    Unknown,
}

impl PullRequest {
    pub fn merge_state(&self) -> MergeState {
        match self.merge_state_status.as_str() {
            "CLEAN" => MergeState::Clean,
            "DIRTY" => MergeState::Dirty,
            "BEHIND" => MergeState::Behind,
            "BLOCKED" => MergeState::Blocked,
            _ => MergeState::Unknown,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == "OPEN"
    }
}

/// The host operations an orchestrator dispatch cycle needs.
#[async_trait]
pub trait HostAdapter: Send + Sync {
    async fn get_issue(&self, id: u64) -> Result<HostIssue>;
    async fn edit_issue_labels(&self, id: u64, add: &[&str], remove: &[&str]) -> Result<()>;
    async fn comment_on_issue(&self, id: u64, body: &str) -> Result<()>;
    async fn close_issue(&self, id: u64) -> Result<()>;
    async fn get_issue_comments(&self, id: u64, limit: u32) -> Result<Vec<String>>;
    async fn get_latest_review_blocked_reason(&self, id: u64) -> Result<String>;
    async fn get_pr_by_branch(&self, branch: &str) -> Result<Option<PullRequest>>;
    async fn get_pr_merge_state(&self, pr: u64) -> Result<MergeState>;
    async fn is_pr_open(&self, pr: u64) -> Result<bool>;
    async fn create_pr(&self, branch: &str, base: &str, title: &str, body: &str) -> Result<PullRequest>;
}

/// `gh`-CLI-backed [`HostAdapter`].
pub struct GhHostAdapter {
    repo: Option<String>,
}

impl GhHostAdapter {
    pub fn new() -> Self {
        Self { repo: None }
    }

    /// Scope every invocation to a specific `owner/repo` (`gh --repo`),
    /// used when the ticket's repo binding differs from the CLI's cwd.
    pub fn for_repo(repo: impl Into<String>) -> Self {
        Self { repo: Some(repo.into()) }
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        self.run_with_retry(args, MAX_RETRIES).await
    }

    async fn run_with_retry(&self, args: &[&str], max_retries: u32) -> Result<String> {
        let mut backoff = INITIAL_BACKOFF;
        let mut last_err = None;
        for attempt in 0..=max_retries {
            match self.run_once(args).await {
                Ok(out) => return Ok(out),
                Err(e @ HostError::Timeout { .. }) => {
                    warn!(attempt, error = %e, "host call timed out, retrying");
                    last_err = Some(e);
                }
                Err(e @ HostError::CommandFailed { .. }) if is_transient(&e) => {
                    warn!(attempt, error = %e, "host call failed transiently, retrying");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
            if attempt < max_retries {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }
        Err(last_err.expect("loop always sets last_err before exhausting retries"))
    }

    async fn run_once(&self, args: &[&str]) -> Result<String> {
        let command_desc = format!("gh {}", args.join(" "));
        let mut full_args: Vec<&str> = Vec::with_capacity(args.len() + 2);
        if let Some(repo) = &self.repo {
            full_args.push("--repo");
            full_args.push(repo.as_str());
        }
        full_args.extend_from_slice(args);

        let fut = Command::new("gh")
            .args(&full_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output();

        let output = match timeout(DEFAULT_TIMEOUT, fut).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(HostError::Timeout {
                    command: command_desc,
                    timeout_secs: DEFAULT_TIMEOUT.as_secs(),
                })
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(HostError::CommandFailed {
                command: command_desc,
                stderr,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl Default for GhHostAdapter {
    fn default() -> Self {
        Self::new()
    }
}

fn is_transient(err: &HostError) -> bool {
    if let HostError::CommandFailed { stderr, .. } = err {
        let lower = stderr.to_ascii_lowercase();
        lower.contains("rate limit") || lower.contains("timeout") || lower.contains("502") || lower.contains("503")
    } else {
        false
    }
}

#[derive(Deserialize)]
struct RawIssue {
    number: u64,
    title: String,
    body: Option<String>,
    labels: Vec<RawLabel>,
    state: String,
}

#[derive(Deserialize)]
struct RawLabel {
    name: String,
}

#[derive(Deserialize)]
struct RawComment {
    body: String,
}

#[derive(Deserialize)]
struct RawPr {
    number: u64,
    url: String,
    state: String,
    #[serde(rename = "baseRefName")]
    base_ref_name: String,
    #[serde(rename = "mergeStateStatus", default)]
    merge_state_status: Option<String>,
}

#[async_trait]
impl HostAdapter for GhHostAdapter {
    async fn get_issue(&self, id: u64) -> Result<HostIssue> {
        let id_str = id.to_string();
        let out = self
            .run(&["issue", "view", &id_str, "--json", "number,title,body,labels,state"])
            .await?;
        let raw: RawIssue = serde_json::from_str(&out).map_err(|source| HostError::Parse {
            command: "gh issue view".to_string(),
            source,
        })?;
        Ok(HostIssue {
            number: raw.number,
            title: raw.title,
            body: raw.body.unwrap_or_default(),
            labels: raw.labels.into_iter().map(|l| l.name).collect(),
            state: raw.state.to_ascii_lowercase(),
        })
    }

    /// Labels are set operations, never accumulators: add/remove are
    /// idempotent w.r.t. repeated calls.
    async fn edit_issue_labels(&self, id: u64, add: &[&str], remove: &[&str]) -> Result<()> {
        let id_str = id.to_string();
        let mut args = vec!["issue", "edit", id_str.as_str()];
        for label in add {
            args.push("--add-label");
            args.push(label);
        }
        for label in remove {
            args.push("--remove-label");
            args.push(label);
        }
        if add.is_empty() && remove.is_empty() {
            return Ok(());
        }
        self.run(&args).await.map(|_| ())
    }

    async fn comment_on_issue(&self, id: u64, body: &str) -> Result<()> {
        let id_str = id.to_string();
        self.run(&["issue", "comment", &id_str, "--body", body]).await.map(|_| ())
    }

    async fn close_issue(&self, id: u64) -> Result<()> {
        let id_str = id.to_string();
        self.run(&["issue", "close", &id_str]).await.map(|_| ())
    }

    async fn get_issue_comments(&self, id: u64, limit: u32) -> Result<Vec<String>> {
        let id_str = id.to_string();
        let out = self
            .run(&["issue", "view", &id_str, "--json", "comments"])
            .await?;
        #[derive(Deserialize)]
        struct Wrapper {
            comments: Vec<RawComment>,
        }
        let wrapper: Wrapper = serde_json::from_str(&out).map_err(|source| HostError::Parse {
            command: "gh issue view --json comments".to_string(),
            source,
        })?;
        let mut comments: Vec<String> = wrapper.comments.into_iter().map(|c| c.body).collect();
        let start = comments.len().saturating_sub(limit as usize);
        Ok(comments.split_off(start))
    }

    async fn get_latest_review_blocked_reason(&self, id: u64) -> Result<String> {
        let comments = self.get_issue_comments(id, 50).await?;
        for comment in comments.iter().rev() {
            if let Some(pos) = comment.find("## AWK Review blocked") {
                return Ok(comment[pos..].to_string());
            }
        }
        Ok(String::new())
    }

    async fn get_pr_by_branch(&self, branch: &str) -> Result<Option<PullRequest>> {
        let out = self
            .run(&[
                "pr",
                "list",
                "--head",
                branch,
                "--state",
                "all",
                "--json",
                "number,url,state,baseRefName,mergeStateStatus",
                "--limit",
                "1",
            ])
            .await?;
        let raws: Vec<RawPr> = serde_json::from_str(&out).map_err(|source| HostError::Parse {
            command: "gh pr list".to_string(),
            source,
        })?;
        Ok(raws.into_iter().next().map(from_raw_pr))
    }

    async fn get_pr_merge_state(&self, pr: u64) -> Result<MergeState> {
        let pr_str = pr.to_string();
        let out = self
            .run(&["pr", "view", &pr_str, "--json", "mergeStateStatus"])
            .await?;
        #[derive(Deserialize)]
        struct Wrapper {
            #[serde(rename = "mergeStateStatus", default)]
            merge_state_status: Option<String>,
        }
        let wrapper: Wrapper = serde_json::from_str(&out).map_err(|source| HostError::Parse {
            command: "gh pr view --json mergeStateStatus".to_string(),
            source,
        })?;
        Ok(match wrapper.merge_state_status.as_deref() {
            Some("CLEAN") => MergeState::Clean,
            Some("DIRTY") => MergeState::Dirty,
            Some("BEHIND") => MergeState::Behind,
            Some("BLOCKED") => MergeState::Blocked,
            _ => MergeState::Unknown,
        })
    }

    async fn is_pr_open(&self, pr: u64) -> Result<bool> {
        let pr_str = pr.to_string();
        let out = self.run(&["pr", "view", &pr_str, "--json", "state"]).await?;
        #[derive(Deserialize)]
        struct Wrapper {
            state: String,
        }
        let wrapper: Wrapper = serde_json::from_str(&out).map_err(|source| HostError::Parse {
            command: "gh pr view --json state".to_string(),
            source,
        })?;
        Ok(wrapper.state == "OPEN")
    }

    async fn create_pr(&self, branch: &str, base: &str, title: &str, body: &str) -> Result<PullRequest> {
        self.run(&[
            "pr", "create", "--head", branch, "--base", base, "--title", title, "--body", body,
        ])
        .await?;
        self.get_pr_by_branch(branch)
            .await?
            .ok_or_else(|| HostError::CommandFailed {
                command: "gh pr create".to_string(),
                stderr: "PR not found immediately after creation".to_string(),
            })
    }
}

fn from_raw_pr(raw: RawPr) -> PullRequest {
    PullRequest {
        number: raw.number,
        url: raw.url,
        state: raw.state,
        base_branch: raw.base_ref_name,
        merge_state_status: raw.merge_state_status.unwrap_or_else(|| "UNKNOWN".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_eligibility_requires_ai_task_and_excludes_in_flight_labels() {
        let base = HostIssue {
            number: 1,
            title: "t".into(),
            body: String::new(),
            labels: vec!["ai-task".into()],
            state: "open".into(),
        };
        assert!(base.is_eligible());

        let closed = HostIssue {
            state: "closed".into(),
            ..base.clone()
        };
        assert!(!closed.is_eligible());

        let mut in_progress = base.clone();
        in_progress.labels.push("in-progress".into());
        assert!(!in_progress.is_eligible());

        let mut worker_failed = base.clone();
        worker_failed.labels.push("worker-failed".into());
        assert!(!worker_failed.is_eligible());

        let no_label = HostIssue {
            labels: vec![],
            ..base
        };
        assert!(!no_label.is_eligible());
    }

    #[test]
    fn merge_state_maps_known_strings() {
        let pr = PullRequest {
            number: 1,
            url: "https://example.com/pr/1".into(),
            state: "OPEN".into(),
            base_branch: "develop".into(),
            merge_state_status: "DIRTY".into(),
        };
        assert_eq!(pr.merge_state(), MergeState::Dirty);
        assert!(pr.is_open());
    }

    #[test]
    fn is_transient_detects_rate_limit_errors() {
        let err = HostError::CommandFailed {
            command: "gh issue view".into(),
            stderr: "API rate limit exceeded".into(),
        };
        assert!(is_transient(&err));
        let err = HostError::CommandFailed {
            command: "gh issue view".into(),
            stderr: "issue not found".into(),
        };
        assert!(!is_transient(&err));
    }
}
