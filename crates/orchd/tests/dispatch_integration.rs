//! Integration tests for the Principal -> Worker dispatch cycle, covering
//! spec §8 scenarios S1 (happy path), S2 (secret blocked), and S6
//! (max-attempts escalation) against a real git remote plus fake
//! Host/Backend test doubles, following the shape of the teacher's
//! `crates/loopd/tests/server_integration.rs`.

use std::path::Path;
use std::process::Command as StdCommand;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use orch_core::Config;
use orchd::backend::{Backend, BackendOpts, BackendRegistry, BackendResult};
use orchd::dispatcher::{DispatchOutcome, Dispatcher};
use orchd::host::{HostAdapter, HostIssue, MergeState, PullRequest};
use tempfile::TempDir;

fn git(dir: &Path, args: &[&str]) {
    let status = StdCommand::new("git").args(args).current_dir(dir).status().unwrap();
    assert!(status.success(), "git {args:?} failed in {dir:?}");
}

/// A bare `origin` remote plus a clone checked out on `develop`, the shape
/// `orchd::worktree::setup` expects to find at the repo root.
struct TestRepo {
    _origin_dir: TempDir,
    root_dir: TempDir,
}

impl TestRepo {
    fn new() -> Self {
        let origin_dir = TempDir::new().unwrap();
        git(origin_dir.path(), &["init", "--bare", "-q"]);

        let seed_dir = TempDir::new().unwrap();
        git(seed_dir.path(), &["init", "-q", "-b", "develop"]);
        git(seed_dir.path(), &["config", "user.email", "worker@example.com"]);
        git(seed_dir.path(), &["config", "user.name", "Worker"]);
        std::fs::write(seed_dir.path().join("README.md"), "hello\n").unwrap();
        git(seed_dir.path(), &["add", "-A"]);
        git(seed_dir.path(), &["commit", "-q", "-m", "init"]);
        git(
            seed_dir.path(),
            &["remote", "add", "origin", origin_dir.path().to_str().unwrap()],
        );
        git(seed_dir.path(), &["push", "-q", "-u", "origin", "develop"]);

        let root_dir = TempDir::new().unwrap();
        // `TempDir::new` already created an empty directory; `git clone`
        // is happy to clone into an existing empty one.
        std::fs::remove_dir(root_dir.path()).unwrap();
        git(
            root_dir.path().parent().unwrap(),
            &[
                "clone",
                "-q",
                origin_dir.path().to_str().unwrap(),
                root_dir.path().to_str().unwrap(),
            ],
        );
        git(root_dir.path(), &["config", "user.email", "worker@example.com"]);
        git(root_dir.path(), &["config", "user.name", "Worker"]);

        Self {
            _origin_dir: origin_dir,
            root_dir,
        }
    }

    fn root(&self) -> &Path {
        self.root_dir.path()
    }
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.default_backend = "fake".to_string();
    config
}

#[derive(Debug, Default)]
struct FakeHostState {
    labels: Vec<String>,
    comments: Vec<String>,
    closed: bool,
    pr: Option<PullRequest>,
}

/// A [`HostAdapter`] double that tracks label/comment side effects
/// in-memory instead of shelling out to `gh`.
struct FakeHost {
    issue_number: u64,
    body: String,
    state: Mutex<FakeHostState>,
}

impl FakeHost {
    fn new(issue_number: u64, body: impl Into<String>, initial_labels: &[&str]) -> Self {
        Self {
            issue_number,
            body: body.into(),
            state: Mutex::new(FakeHostState {
                labels: initial_labels.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            }),
        }
    }

    fn labels(&self) -> Vec<String> {
        self.state.lock().unwrap().labels.clone()
    }

    fn comments(&self) -> Vec<String> {
        self.state.lock().unwrap().comments.clone()
    }

    fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
}

#[async_trait]
impl HostAdapter for FakeHost {
    async fn get_issue(&self, id: u64) -> orchd::host::Result<HostIssue> {
        let state = self.state.lock().unwrap();
        Ok(HostIssue {
            number: id,
            title: "test issue".to_string(),
            body: self.body.clone(),
            labels: state.labels.clone(),
            state: "open".to_string(),
        })
    }

    async fn edit_issue_labels(&self, _id: u64, add: &[&str], remove: &[&str]) -> orchd::host::Result<()> {
        let mut state = self.state.lock().unwrap();
        for l in remove {
            state.labels.retain(|existing| existing != l);
        }
        for l in add {
            if !state.labels.iter().any(|existing| existing == l) {
                state.labels.push((*l).to_string());
            }
        }
        Ok(())
    }

    async fn comment_on_issue(&self, _id: u64, body: &str) -> orchd::host::Result<()> {
        self.state.lock().unwrap().comments.push(body.to_string());
        Ok(())
    }

    async fn close_issue(&self, _id: u64) -> orchd::host::Result<()> {
        self.state.lock().unwrap().closed = true;
        Ok(())
    }

    async fn get_issue_comments(&self, _id: u64, _limit: u32) -> orchd::host::Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn get_latest_review_blocked_reason(&self, _id: u64) -> orchd::host::Result<String> {
        Ok(String::new())
    }

    async fn get_pr_by_branch(&self, _branch: &str) -> orchd::host::Result<Option<PullRequest>> {
        Ok(self.state.lock().unwrap().pr.clone())
    }

    async fn get_pr_merge_state(&self, _pr: u64) -> orchd::host::Result<MergeState> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .pr
            .as_ref()
            .map(|pr| pr.merge_state())
            .unwrap_or(MergeState::Unknown))
    }

    async fn is_pr_open(&self, _pr: u64) -> orchd::host::Result<bool> {
        Ok(self.state.lock().unwrap().pr.as_ref().is_some_and(PullRequest::is_open))
    }

    async fn create_pr(&self, branch: &str, base: &str, title: &str, _body: &str) -> orchd::host::Result<PullRequest> {
        let pr = PullRequest {
            number: self.issue_number,
            url: format!("https://example.test/acme/widgets/pull/{}", self.issue_number),
            state: "OPEN".to_string(),
            base_branch: base.to_string(),
            merge_state_status: "CLEAN".to_string(),
        };
        assert!(!title.is_empty());
        assert_eq!(branch, format!("feat/ai-issue-{}", self.issue_number));
        self.state.lock().unwrap().pr = Some(pr.clone());
        Ok(pr)
    }
}

/// A [`Backend`] double whose behavior is scripted per test.
struct FakeBackend {
    write: Option<(&'static str, &'static str)>,
    succeed: bool,
}

impl FakeBackend {
    fn writing(path: &'static str, contents: &'static str) -> Self {
        Self {
            write: Some((path, contents)),
            succeed: true,
        }
    }

    fn always_fails() -> Self {
        Self {
            write: None,
            succeed: false,
        }
    }
}

#[async_trait]
impl Backend for FakeBackend {
    fn name(&self) -> &str {
        "fake"
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn execute(&self, opts: &BackendOpts) -> orchd::backend::Result<BackendResult> {
        if let Some((name, contents)) = self.write {
            std::fs::write(opts.working_dir.join(name), contents).unwrap();
        }
        Ok(BackendResult {
            attempts: 1,
            retry_count: 0,
            duration: Duration::from_millis(1),
            failure_stage: if self.succeed { None } else { Some("backend_invocation".to_string()) },
            failure_reason: if self.succeed { None } else { Some("scripted failure".to_string()) },
            succeeded: self.succeed,
            log_paths: Vec::new(),
        })
    }
}

fn registry(backend: Box<dyn Backend>) -> BackendRegistry {
    let mut registry = BackendRegistry::new();
    registry.register(backend);
    registry
}

/// S1: happy path. A ticket targeting the root repo produces a real commit,
/// a real push to `origin`, and a PR; the dispatcher lands `pr-ready` and
/// drops `in-progress`.
#[tokio::test]
async fn s1_happy_path_lands_pr_ready() {
    let repo = TestRepo::new();
    let state_root = TempDir::new().unwrap();
    let config = test_config();
    let backends = registry(Box::new(FakeBackend::writing("CHANGES.md", "fixed the bug\n")));
    let host = FakeHost::new(42, "Repo: root\n\nFix the thing.", &["ai-task"]);

    let dispatcher = Dispatcher {
        state_root: state_root.path().to_path_buf(),
        repo_root: repo.root().to_path_buf(),
        global_log_dir: state_root.path().join("logs"),
        config: &config,
        host: &host,
        backends: &backends,
        worker_run_timeout: Duration::from_secs(60),
    };

    let outcome = dispatcher.dispatch(42, None).await.unwrap();
    let result = match outcome {
        DispatchOutcome::Succeeded { result } => result,
        other => panic!("expected Succeeded, got {other:?}"),
    };

    assert_eq!(result.repo, "root");
    assert!(result.pr_url.is_some());
    assert!(result.head_sha.is_some());

    let labels = host.labels();
    assert!(labels.contains(&"ai-task".to_string()));
    assert!(labels.contains(&"pr-ready".to_string()));
    assert!(!labels.contains(&"in-progress".to_string()));

    // fail_count.txt resets to zero/absent on success (spec §8 invariant 2).
    let fail_count_path = state_root.path().join(".ai/runs/issue-42/fail_count.txt");
    if fail_count_path.exists() {
        let contents = std::fs::read_to_string(&fail_count_path).unwrap();
        assert_eq!(contents.trim(), "0");
    }
}

/// S2: a staged secret aborts the commit. No commit is created, the issue
/// is left retryable (labels minus `in-progress`), and `fail_count` becomes
/// 1, per spec §8 scenario S2.
#[tokio::test]
async fn s2_secret_in_diff_blocks_commit() {
    let repo = TestRepo::new();
    let state_root = TempDir::new().unwrap();
    let config = test_config();
    let backends = registry(Box::new(FakeBackend::writing(
        "config.toml",
        "api_key = \"abcd1234567890ab\"\n",
    )));
    let host = FakeHost::new(7, "Repo: root\n\nAdd config.", &["ai-task"]);

    let dispatcher = Dispatcher {
        state_root: state_root.path().to_path_buf(),
        repo_root: repo.root().to_path_buf(),
        global_log_dir: state_root.path().join("logs"),
        config: &config,
        host: &host,
        backends: &backends,
        worker_run_timeout: Duration::from_secs(60),
    };

    let outcome = dispatcher.dispatch(7, None).await.unwrap();
    let result = match outcome {
        DispatchOutcome::Retrying { result, fail_count } => {
            assert_eq!(fail_count, 1);
            result
        }
        other => panic!("expected Retrying, got {other:?}"),
    };

    assert_eq!(result.failure_stage.as_deref(), Some("security_check"));
    assert!(result.pr_url.is_none());

    let labels = host.labels();
    assert!(labels.contains(&"ai-task".to_string()));
    assert!(!labels.contains(&"in-progress".to_string()));

    // No commit landed: HEAD in the worktree still matches the seeded commit
    // on `develop` (nothing was pushed).
    let log = StdCommand::new("git")
        .args(["log", "--oneline", "origin/develop"])
        .current_dir(repo.root())
        .output()
        .unwrap();
    let log = String::from_utf8_lossy(&log.stdout);
    assert_eq!(log.lines().count(), 1, "no new commit should have reached origin");
}

/// S6: after `max_attempts` consecutive failures, the dispatcher applies
/// `worker-failed` and stops retrying, per spec §8 scenario S6.
#[tokio::test]
async fn s6_exhausts_retry_budget_then_escalates() {
    let repo = TestRepo::new();
    let state_root = TempDir::new().unwrap();
    let config = test_config();
    assert_eq!(config.escalation.max_attempts(), 3);
    let host = FakeHost::new(99, "Repo: root\n\nAlways fails.", &["ai-task"]);

    for attempt in 1..=3u32 {
        let backends = registry(Box::new(FakeBackend::always_fails()));
        let dispatcher = Dispatcher {
            state_root: state_root.path().to_path_buf(),
            repo_root: repo.root().to_path_buf(),
            global_log_dir: state_root.path().join("logs"),
            config: &config,
            host: &host,
            backends: &backends,
            worker_run_timeout: Duration::from_secs(60),
        };
        // A prior dispatch's failure clears `in-progress` but the fake host
        // starts every attempt `ai-task`-only; re-add eligibility the way a
        // real re-dispatch cycle would see the issue (still open, no
        // `worker-failed` yet).
        let outcome = dispatcher.dispatch(99, None).await.unwrap();
        match (attempt, outcome) {
            (1 | 2, DispatchOutcome::Retrying { fail_count, .. }) => assert_eq!(fail_count, attempt),
            (3, DispatchOutcome::WorkerFailed { fail_count, .. }) => assert_eq!(fail_count, 3),
            (n, other) => panic!("attempt {n}: unexpected outcome {other:?}"),
        }
    }

    let labels = host.labels();
    assert!(labels.contains(&"worker-failed".to_string()));
    assert!(!labels.contains(&"in-progress".to_string()));
    assert!(host.comments().iter().any(|c| c.contains("attempt")));
}
