//! The orchestrator daemon: wires the Dispatcher, the Result checker, and
//! the cleanup manager into a Principal loop that consumes an externally
//! supplied queue of issue ids.
//!
//! Construction logs its config then drives a loop, `tokio::spawn`-ing
//! concurrent work over `Arc`-cloned shared state, generalized from "resume
//! runs recorded in a database" to "recover issues whose PID file outlived
//! the process that wrote it, then dispatch the supplied queue".
//!
//! Ranking or selecting which issues to work on is out of scope (see
//! DESIGN.md); the caller decides what goes in the queue.

pub mod backend;
pub mod cleanup;
pub mod dispatcher;
pub mod host;
pub mod preflight;
pub mod result_checker;
pub mod scm;
pub mod worker;
pub mod worktree;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use orch_core::{Config, StateStoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::BackendRegistry;
use crate::cleanup::CleanupManager;
use crate::dispatcher::{DispatchOutcome, Dispatcher};
use crate::host::HostAdapter;
use crate::result_checker::ResultChecker;

/// Poll interval when the queue file is empty, and the wait the result
/// checker sleeps between "not found yet" checks.
pub const DEFAULT_POLL_WAIT: Duration = Duration::from_secs(30);

/// Stale-lock threshold: a lock file older than this is reclaimed rather
/// than treated as held by a live Principal.
pub const LOCK_STALE_AFTER: chrono::Duration = chrono::Duration::hours(1);

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("another principal is already running (pid {pid}, lock {path})")]
    AlreadyRunning { path: PathBuf, pid: u32 },
    #[error(transparent)]
    StateStore(#[from] StateStoreError),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, DaemonError>;

/// Static daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Root of `.ai/` state (results, traces, pids, locks).
    pub state_root: PathBuf,
    /// Root of the repository (or root-repo, for submodule bindings) being
    /// worked on.
    pub repo_root: PathBuf,
    /// Where per-attempt Worker logs are mirrored for `orchctl tail`.
    pub global_log_dir: PathBuf,
    /// Upper bound on issues dispatched concurrently.
    pub max_concurrent_issues: usize,
    /// Per-run deadline handed to the Dispatcher/Worker.
    pub worker_run_timeout: Duration,
    /// How long to sleep between queue-file polls when it's empty, and how
    /// long the result checker waits before reporting "not found yet".
    pub poll_wait: Duration,
}

impl DaemonConfig {
    pub fn lock_path(&self) -> PathBuf {
        self.state_root.join(".ai/state/principal.lock")
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            state_root: PathBuf::from("."),
            repo_root: PathBuf::from("."),
            global_log_dir: PathBuf::from(".ai/logs"),
            max_concurrent_issues: 4,
            worker_run_timeout: dispatcher::DEFAULT_RUN_TIMEOUT,
            poll_wait: DEFAULT_POLL_WAIT,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LockRecord {
    pid: u32,
    started_at: DateTime<Utc>,
}

/// OS-level singleton lock: an exclusive file holding the holder's PID and
/// start time. A lock older than [`LOCK_STALE_AFTER`] is reclaimed rather
/// than honored, since the process that wrote it may have been killed
/// without a chance to remove it.
pub struct PrincipalLock {
    path: PathBuf,
}

impl PrincipalLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(existing) = Self::read_record(path)? {
            let age = Utc::now().signed_duration_since(existing.started_at);
            if age < LOCK_STALE_AFTER && pid_is_alive(existing.pid) {
                return Err(DaemonError::AlreadyRunning {
                    path: path.to_path_buf(),
                    pid: existing.pid,
                });
            }
            warn!(pid = existing.pid, age_secs = age.num_seconds(), "reclaiming stale principal lock");
        }
        let record = LockRecord {
            pid: std::process::id(),
            started_at: Utc::now(),
        };
        orch_core::state_store::write_json(path, &record)?;
        Ok(Self { path: path.to_path_buf() })
    }

    fn read_record(path: &Path) -> Result<Option<LockRecord>> {
        Ok(orch_core::state_store::read_json(path)?)
    }
}

impl Drop for PrincipalLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(unix)]
fn pid_is_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn pid_is_alive(_pid: u32) -> bool {
    true
}

/// Read a newline-delimited queue file: one issue id per line, blank lines
/// and `#`-prefixed comments ignored. Missing file reads as an empty queue.
pub fn read_issue_queue(path: &Path) -> std::io::Result<Vec<u64>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.parse::<u64>().ok())
        .collect())
}

fn issue_id_from_pid_filename(name: &std::ffi::OsStr) -> Option<u64> {
    name.to_str()?.strip_prefix("issue-")?.strip_suffix(".json")?.parse().ok()
}

/// The Principal: one process per repo (enforced by [`PrincipalLock`])
/// dispatching a caller-supplied queue of issue ids, bounded to
/// `max_concurrent_issues` concurrent dispatches.
pub struct Daemon {
    config: DaemonConfig,
    workflow: Arc<Config>,
    host: Arc<dyn HostAdapter>,
    backends: Arc<BackendRegistry>,
    pub cleanup: Arc<CleanupManager>,
}

impl Daemon {
    pub fn new(config: DaemonConfig, workflow: Config, host: Arc<dyn HostAdapter>, backends: BackendRegistry) -> Self {
        Self {
            config,
            workflow: Arc::new(workflow),
            host,
            backends: Arc::new(backends),
            cleanup: Arc::new(CleanupManager::new()),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cleanup.cancellation_token()
    }

    /// Scan `.ai/state/pids/` for PID files left behind by a Worker that
    /// was still `Running` when this process (or a prior one) died, and
    /// resolve each through the Result checker so a crashed/timed-out run
    /// doesn't sit forever without `in-progress` being cleared.
    ///
    /// Mirrors a database-backed daemon's resume-on-startup scan, just over
    /// PID files instead of database rows.
    pub async fn recover_interrupted(&self) -> Result<Vec<u64>> {
        let pids_dir = self.config.state_root.join(".ai/state/pids");
        let entries = match std::fs::read_dir(&pids_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(DaemonError::Io { path: pids_dir, source }),
        };

        let checker = ResultChecker {
            state_root: self.config.state_root.clone(),
            host: self.host.as_ref(),
            worker_run_timeout: self.config.worker_run_timeout,
            poll_wait: Duration::ZERO,
        };
        let max_attempts = self.workflow.escalation.max_attempts();

        let mut recovered = Vec::new();
        for entry in entries.flatten() {
            let Some(issue_id) = issue_id_from_pid_filename(&entry.file_name()) else {
                continue;
            };
            match checker.check(issue_id, max_attempts).await {
                Ok(decision) => {
                    info!(issue_id, ?decision, "checked interrupted issue on startup");
                    recovered.push(issue_id);
                }
                Err(error) => warn!(issue_id, %error, "failed to check interrupted issue"),
            }
        }
        Ok(recovered)
    }

    /// Dispatch every id in `issue_ids`, at most `max_concurrent_issues` at
    /// a time. Each concurrent dispatch runs as its own `tokio::spawn`ed
    /// task over `Arc`-cloned shared state.
    pub async fn dispatch_batch(
        &self,
        issue_ids: &[u64],
    ) -> Vec<(u64, std::result::Result<DispatchOutcome, dispatcher::DispatcherError>)> {
        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.config.max_concurrent_issues.max(1)));
        let mut handles = Vec::with_capacity(issue_ids.len());

        for &issue_id in issue_ids {
            let semaphore = Arc::clone(&semaphore);
            let state_root = self.config.state_root.clone();
            let repo_root = self.config.repo_root.clone();
            let global_log_dir = self.config.global_log_dir.clone();
            let workflow = Arc::clone(&self.workflow);
            let host = Arc::clone(&self.host);
            let backends = Arc::clone(&self.backends);
            let worker_run_timeout = self.config.worker_run_timeout;

            handles.push(tokio::spawn(async move {
                let permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("semaphore is never closed while a dispatch is outstanding");
                let dispatcher = Dispatcher {
                    state_root,
                    repo_root,
                    global_log_dir,
                    config: &workflow,
                    host: host.as_ref(),
                    backends: &backends,
                    worker_run_timeout,
                };
                let outcome = dispatcher.dispatch(issue_id, None).await;
                drop(permit);
                (issue_id, outcome)
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(pair) => results.push(pair),
                Err(join_error) => warn!(%join_error, "dispatch task panicked"),
            }
        }
        results
    }

    /// Acquire the singleton lock, recover any interrupted issues, then
    /// repeatedly read `queue_path` and dispatch whatever it names until
    /// the cancellation token fires.
    pub async fn run(&self, queue_path: &Path) -> Result<()> {
        let _lock = PrincipalLock::acquire(&self.config.lock_path())?;
        info!(
            state_root = %self.config.state_root.display(),
            max_concurrent_issues = self.config.max_concurrent_issues,
            worker_run_timeout_s = self.config.worker_run_timeout.as_secs(),
            "principal starting"
        );

        let recovered = self.recover_interrupted().await?;
        if !recovered.is_empty() {
            info!(count = recovered.len(), "recovered interrupted issues on startup");
        }

        let token = self.cancellation_token();
        loop {
            if token.is_cancelled() {
                break;
            }
            let issue_ids = read_issue_queue(queue_path).unwrap_or_default();
            if issue_ids.is_empty() {
                tokio::select! {
                    () = tokio::time::sleep(self.config.poll_wait) => {}
                    () = token.cancelled() => break,
                }
                continue;
            }

            let outcomes = self.dispatch_batch(&issue_ids).await;
            for (issue_id, outcome) in &outcomes {
                match outcome {
                    Ok(outcome) => info!(issue_id, ?outcome, "dispatch complete"),
                    Err(error) => warn!(issue_id, %error, "dispatch failed"),
                }
            }
        }

        info!("principal shutting down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_file_parses_ids_and_skips_comments_and_blanks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.txt");
        std::fs::write(&path, "1\n# a comment\n\n2\n   3  \n").unwrap();
        assert_eq!(read_issue_queue(&path).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn missing_queue_file_is_an_empty_queue() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.txt");
        assert_eq!(read_issue_queue(&path).unwrap(), Vec::<u64>::new());
    }

    #[test]
    fn pid_filename_parses_issue_id() {
        assert_eq!(issue_id_from_pid_filename(std::ffi::OsStr::new("issue-42.json")), Some(42));
        assert_eq!(issue_id_from_pid_filename(std::ffi::OsStr::new("not-a-pid-file")), None);
    }

    #[test]
    fn lock_is_reclaimed_once_stale() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("principal.lock");
        let stale = LockRecord {
            pid: std::process::id(),
            started_at: Utc::now() - chrono::Duration::hours(2),
        };
        orch_core::state_store::write_json(&lock_path, &stale).unwrap();

        let lock = PrincipalLock::acquire(&lock_path).unwrap();
        drop(lock);
        assert!(!lock_path.exists());
    }

    #[test]
    fn lock_refuses_a_second_holder_while_fresh_and_alive() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("principal.lock");
        let _first = PrincipalLock::acquire(&lock_path).unwrap();
        let second = PrincipalLock::acquire(&lock_path);
        assert!(matches!(second, Err(DaemonError::AlreadyRunning { .. })));
    }
}
