//! SCM adapter: every source-control operation the Worker runner and
//! Worktree lifecycle need, each a function over a working directory with
//! an optional timeout, returning a [`ScmError`] that carries captured
//! stderr.
//!
//! Grounded on the teacher's git-wrapping idiom (`Command::new("git")`,
//! `current_dir`, stderr captured into the error on non-zero exit) but
//! expanded with every operation spec Section 4.C names that the teacher
//! lacked: `fetch`, `pull --ff-only`, `submodule sync`/`update --init
//! --recursive`, `rev-parse HEAD`, `diff --cached`, `push -u origin`,
//! `push --force-with-lease`, `rebase origin/<base>`.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;

/// Default timeout for a single SCM command (spec Section 5).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum ScmError {
    #[error("git command `{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
    #[error("git command `{command}` timed out after {timeout_secs}s")]
    Timeout { command: String, timeout_secs: u64 },
    #[error("failed to execute git: {0}")]
    Exec(#[from] std::io::Error),
    #[error("invalid utf-8 in git output for `{0}`")]
    InvalidUtf8(String),
}

pub type Result<T> = std::result::Result<T, ScmError>;

async fn run(dir: &Path, args: &[&str], timeout_dur: Duration) -> Result<String> {
    let command_desc = format!("git {}", args.join(" "));
    let fut = Command::new("git")
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output();

    let output = match timeout(timeout_dur, fut).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(ScmError::Timeout {
                command: command_desc,
                timeout_secs: timeout_dur.as_secs(),
            })
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(ScmError::CommandFailed {
            command: command_desc,
            stderr,
        });
    }

    String::from_utf8(output.stdout)
        .map(|s| s.trim().to_string())
        .map_err(|_| ScmError::InvalidUtf8(command_desc))
}

/// `git fetch origin`.
pub async fn fetch(dir: &Path) -> Result<()> {
    run(dir, &["fetch", "origin"], DEFAULT_TIMEOUT).await.map(|_| ())
}

/// `git show-ref --verify --quiet refs/heads/<branch>`.
pub async fn branch_exists(dir: &Path, branch: &str) -> Result<bool> {
    let refname = format!("refs/heads/{branch}");
    match run(dir, &["show-ref", "--verify", "--quiet", &refname], DEFAULT_TIMEOUT).await {
        Ok(_) => Ok(true),
        Err(ScmError::CommandFailed { .. }) => Ok(false),
        Err(other) => Err(other),
    }
}

/// `git show-ref --verify --quiet refs/remotes/origin/<branch>`.
pub async fn remote_branch_exists(dir: &Path, branch: &str) -> Result<bool> {
    let refname = format!("refs/remotes/origin/{branch}");
    match run(dir, &["show-ref", "--verify", "--quiet", &refname], DEFAULT_TIMEOUT).await {
        Ok(_) => Ok(true),
        Err(ScmError::CommandFailed { .. }) => Ok(false),
        Err(other) => Err(other),
    }
}

/// `git branch <branch> <start_point>`.
pub async fn create_branch_from(dir: &Path, branch: &str, start_point: &str) -> Result<()> {
    run(dir, &["branch", branch, start_point], DEFAULT_TIMEOUT).await.map(|_| ())
}

/// `git checkout <branch>`.
pub async fn checkout(dir: &Path, branch: &str) -> Result<()> {
    run(dir, &["checkout", branch], DEFAULT_TIMEOUT).await.map(|_| ())
}

/// `git pull --ff-only`.
pub async fn pull_ff_only(dir: &Path) -> Result<()> {
    run(dir, &["pull", "--ff-only"], DEFAULT_TIMEOUT).await.map(|_| ())
}

/// `git worktree add <path> <branch>`.
pub async fn worktree_add(dir: &Path, worktree_path: &Path, branch: &str) -> Result<()> {
    let path_str = worktree_path.to_string_lossy().to_string();
    run(dir, &["worktree", "add", &path_str, branch], DEFAULT_TIMEOUT)
        .await
        .map(|_| ())
}

/// `git worktree remove --force <path>`.
pub async fn worktree_remove_force(dir: &Path, worktree_path: &Path) -> Result<()> {
    let path_str = worktree_path.to_string_lossy().to_string();
    match run(dir, &["worktree", "remove", "--force", &path_str], DEFAULT_TIMEOUT).await {
        Ok(_) => Ok(()),
        // A worktree directory that was already removed from disk is not an error here;
        // the caller's goal ("gone") is already satisfied.
        Err(ScmError::CommandFailed { stderr, .. }) if stderr.contains("is not a working tree") => Ok(()),
        Err(other) => Err(other),
    }
}

/// `git submodule sync [--recursive] [<path>]`.
pub async fn submodule_sync(dir: &Path, path: Option<&str>, recursive: bool) -> Result<()> {
    let mut args = vec!["submodule", "sync"];
    if recursive {
        args.push("--recursive");
    }
    if let Some(p) = path {
        args.push(p);
    }
    run(dir, &args, DEFAULT_TIMEOUT).await.map(|_| ())
}

/// `git submodule update --init [--recursive] [<path>]`.
pub async fn submodule_update_init(dir: &Path, path: Option<&str>, recursive: bool) -> Result<()> {
    let mut args = vec!["submodule", "update", "--init"];
    if recursive {
        args.push("--recursive");
    }
    if let Some(p) = path {
        args.push(p);
    }
    run(dir, &args, DEFAULT_TIMEOUT).await.map(|_| ())
}

/// `git rev-parse HEAD`.
pub async fn rev_parse_head(dir: &Path) -> Result<String> {
    run(dir, &["rev-parse", "HEAD"], DEFAULT_TIMEOUT).await
}

/// `git diff --cached`.
pub async fn diff_cached(dir: &Path) -> Result<String> {
    run(dir, &["diff", "--cached"], DEFAULT_TIMEOUT).await
}

/// `git diff` (unstaged, for the post-run audit summary).
pub async fn diff(dir: &Path) -> Result<String> {
    run(dir, &["diff"], DEFAULT_TIMEOUT).await
}

/// `git diff --cached --name-only`: the staged file list consulted by the
/// security gate's protected-path and submodule-boundary checks.
pub async fn diff_cached_name_only(dir: &Path) -> Result<Vec<String>> {
    let out = run(dir, &["diff", "--cached", "--name-only"], DEFAULT_TIMEOUT).await?;
    Ok(if out.is_empty() {
        Vec::new()
    } else {
        out.lines().map(str::to_string).collect()
    })
}

/// `git status --porcelain`.
pub async fn status_porcelain(dir: &Path) -> Result<String> {
    run(dir, &["status", "--porcelain"], DEFAULT_TIMEOUT).await
}

/// Whether the working tree has no uncommitted changes.
pub async fn is_clean(dir: &Path) -> Result<bool> {
    Ok(status_porcelain(dir).await?.is_empty())
}

/// `git add -A`.
pub async fn add_all(dir: &Path) -> Result<()> {
    run(dir, &["add", "-A"], DEFAULT_TIMEOUT).await.map(|_| ())
}

/// `git reset <path>` for unstaging a specific path (e.g. workflow-internal
/// state dirs on the root repo before commit).
pub async fn unstage(dir: &Path, path: &str) -> Result<()> {
    match run(dir, &["reset", "--", path], DEFAULT_TIMEOUT).await {
        Ok(_) => Ok(()),
        Err(ScmError::CommandFailed { .. }) => Ok(()),
        Err(other) => Err(other),
    }
}

/// `git commit -m <message>`.
pub async fn commit(dir: &Path, message: &str) -> Result<()> {
    run(dir, &["commit", "-m", message], DEFAULT_TIMEOUT).await.map(|_| ())
}

/// `git push -u origin <branch>`.
pub async fn push_set_upstream(dir: &Path, branch: &str) -> Result<()> {
    run(dir, &["push", "-u", "origin", branch], DEFAULT_TIMEOUT)
        .await
        .map(|_| ())
}

/// `git push --force-with-lease`.
pub async fn push_force_with_lease(dir: &Path, branch: &str) -> Result<()> {
    run(dir, &["push", "--force-with-lease", "origin", branch], DEFAULT_TIMEOUT)
        .await
        .map(|_| ())
}

/// `git rebase origin/<base>`.
pub async fn rebase_onto(dir: &Path, base_branch: &str) -> Result<()> {
    let target = format!("origin/{base_branch}");
    run(dir, &["rebase", &target], DEFAULT_TIMEOUT).await.map(|_| ())
}

/// `git rebase --abort`, used to return a worktree to a clean state after a
/// rebase left unresolved conflicts.
pub async fn rebase_abort(dir: &Path) -> Result<()> {
    run(dir, &["rebase", "--abort"], DEFAULT_TIMEOUT).await.map(|_| ())
}

/// `git reset --hard HEAD`.
pub async fn reset_hard_head(dir: &Path) -> Result<()> {
    run(dir, &["reset", "--hard", "HEAD"], DEFAULT_TIMEOUT).await.map(|_| ())
}

/// `git clean -fd`.
pub async fn clean_fd(dir: &Path) -> Result<()> {
    run(dir, &["clean", "-fd"], DEFAULT_TIMEOUT).await.map(|_| ())
}

/// `git rev-parse --git-dir`, used to locate `index.lock` for stale-lock
/// removal during clean-reuse.
pub async fn git_dir(dir: &Path) -> Result<std::path::PathBuf> {
    let out = run(dir, &["rev-parse", "--git-dir"], DEFAULT_TIMEOUT).await?;
    let p = std::path::PathBuf::from(out);
    if p.is_absolute() {
        Ok(p)
    } else {
        Ok(dir.join(p))
    }
}

/// Remove a stale `index.lock` if one is present in the worktree's git dir.
/// Idempotent: a missing lock file is not an error.
pub async fn remove_stale_index_lock(dir: &Path) -> Result<()> {
    let gd = git_dir(dir).await?;
    let lock = gd.join("index.lock");
    if lock.exists() {
        std::fs::remove_file(&lock)?;
    }
    Ok(())
}

/// `git diff --name-only --diff-filter=U`: files with unresolved merge
/// conflicts. On command failure, conservatively report "conflict exists"
/// per spec Section 4.C.
pub async fn conflicted_paths(dir: &Path) -> Vec<String> {
    match run(dir, &["diff", "--name-only", "--diff-filter=U"], DEFAULT_TIMEOUT).await {
        Ok(out) if out.is_empty() => Vec::new(),
        Ok(out) => out.lines().map(str::to_string).collect(),
        Err(_) => vec!["<unknown: conflict check failed>".to_string()],
    }
}

/// `git ls-remote --exit-code <url>`, used by Preflight's cached
/// remote-reachability probe.
pub async fn ls_remote_reachable(url: &str) -> bool {
    let fut = Command::new("git")
        .args(["ls-remote", "--exit-code", url])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .output();
    match timeout(DEFAULT_TIMEOUT, fut).await {
        Ok(Ok(output)) => output.status.success(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;

    fn git(dir: &Path, args: &[&str]) {
        let status = StdCommand::new("git").args(args).current_dir(dir).status().unwrap();
        assert!(status.success(), "git {:?} failed", args);
    }

    fn init_repo(dir: &Path) {
        git(dir, &["init", "-q"]);
        git(dir, &["config", "user.email", "test@example.com"]);
        git(dir, &["config", "user.name", "Test"]);
        std::fs::write(dir.join("README.md"), "hello\n").unwrap();
        git(dir, &["add", "-A"]);
        git(dir, &["commit", "-q", "-m", "init"]);
    }

    #[tokio::test]
    async fn is_clean_reflects_working_tree_state() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        assert!(is_clean(dir.path()).await.unwrap());
        std::fs::write(dir.path().join("README.md"), "changed\n").unwrap();
        assert!(!is_clean(dir.path()).await.unwrap());
    }

    #[tokio::test]
    async fn branch_exists_detects_local_branches() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        assert!(!branch_exists(dir.path(), "feat/ai-issue-1").await.unwrap());
        create_branch_from(dir.path(), "feat/ai-issue-1", "HEAD").await.unwrap();
        assert!(branch_exists(dir.path(), "feat/ai-issue-1").await.unwrap());
    }

    #[tokio::test]
    async fn rev_parse_head_returns_a_sha() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let sha = rev_parse_head(dir.path()).await.unwrap();
        assert_eq!(sha.len(), 40);
    }

    #[tokio::test]
    async fn conflicted_paths_empty_on_clean_tree() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        assert!(conflicted_paths(dir.path()).await.is_empty());
    }

    #[tokio::test]
    async fn commit_with_no_staged_changes_fails() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let err = commit(dir.path(), "[chore] issue").await.unwrap_err();
        assert!(matches!(err, ScmError::CommandFailed { .. }));
    }
}
