//! Worktree lifecycle: create/reuse/cleanup a per-issue worktree and resolve
//! the work directory by repo kind, per spec Section 4.E.
//!
//! Generalizes the teacher's worktree-provider shape (a `create`/`cleanup`
//! pair) into the full decision tree spec.md describes: reuse-and-clean an
//! existing worktree, or fetch + ensure base + checkout + pull --ff-only +
//! ensure branch + `git worktree add` for a fresh one, then finalize by
//! repo kind.

use std::path::{Path, PathBuf};

use orch_core::RepoKind;
use thiserror::Error;

use crate::scm::{self, ScmError};

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error(transparent)]
    Scm(#[from] ScmError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("work directory {0} does not exist for repo kind 'directory'")]
    DirectoryMissing(PathBuf),
    #[error("submodule path {0} does not exist or has no .git")]
    SubmoduleMissing(PathBuf),
}

pub type Result<T> = std::result::Result<T, WorktreeError>;

/// Everything the worker needs to locate its working copy.
#[derive(Debug, Clone)]
pub struct WorktreeHandle {
    pub issue_id: u64,
    pub branch: String,
    pub base_branch: String,
    pub worktree_dir: PathBuf,
    pub work_dir: PathBuf,
}

/// `<root>/.worktrees/issue-<id>`.
pub fn worktree_path(root: &Path, issue_id: u64) -> PathBuf {
    root.join(".worktrees").join(format!("issue-{issue_id}"))
}

/// Set up (creating or reusing) the worktree for `issue_id`, then finalize
/// by repo kind. `repo_path` is the path of the bound repo relative to
/// `root`, used for `directory`/`submodule` kinds.
pub async fn setup(
    root: &Path,
    issue_id: u64,
    branch: &str,
    repo_kind: RepoKind,
    repo_path: Option<&str>,
    base_branch: &str,
) -> Result<WorktreeHandle> {
    let wt_dir = worktree_path(root, issue_id);

    if wt_dir.exists() {
        clean_reuse(&wt_dir).await?;
    } else {
        create_fresh(root, &wt_dir, branch, base_branch).await?;
    }

    let work_dir = finalize_by_kind(root, &wt_dir, repo_kind, repo_path).await?;

    Ok(WorktreeHandle {
        issue_id,
        branch: branch.to_string(),
        base_branch: base_branch.to_string(),
        worktree_dir: wt_dir,
        work_dir,
    })
}

/// Idempotent clean-reuse: remove a stale `index.lock`, `reset --hard HEAD`,
/// `clean -fd`. Never touches anything outside the worktree directory.
pub async fn clean_reuse(wt_dir: &Path) -> Result<()> {
    scm::remove_stale_index_lock(wt_dir).await?;
    scm::reset_hard_head(wt_dir).await?;
    scm::clean_fd(wt_dir).await?;
    Ok(())
}

async fn create_fresh(root: &Path, wt_dir: &Path, branch: &str, base_branch: &str) -> Result<()> {
    scm::fetch(root).await?;

    if !scm::branch_exists(root, base_branch).await? {
        let origin_base = format!("origin/{base_branch}");
        scm::create_branch_from(root, base_branch, &origin_base).await?;
    }
    scm::checkout(root, base_branch).await?;
    scm::pull_ff_only(root).await?;

    if !scm::branch_exists(root, branch).await? {
        if scm::remote_branch_exists(root, branch).await? {
            let origin_branch = format!("origin/{branch}");
            scm::create_branch_from(root, branch, &origin_branch).await?;
        } else {
            scm::create_branch_from(root, branch, base_branch).await?;
        }
    }

    scm::worktree_add(root, wt_dir, branch).await?;
    Ok(())
}

async fn finalize_by_kind(
    root: &Path,
    wt_dir: &Path,
    kind: RepoKind,
    repo_path: Option<&str>,
) -> Result<PathBuf> {
    match kind {
        RepoKind::Root => {
            scm::submodule_sync(wt_dir, None, true).await?;
            scm::submodule_update_init(wt_dir, None, true).await?;
            Ok(wt_dir.to_path_buf())
        }
        RepoKind::Directory => {
            let path = repo_path.expect("directory repo kind requires a repo_path");
            let dir = wt_dir.join(path);
            if !dir.is_dir() {
                scm::worktree_remove_force(root, wt_dir).await.ok();
                return Err(WorktreeError::DirectoryMissing(dir));
            }
            Ok(dir)
        }
        RepoKind::Submodule => {
            let path = repo_path.expect("submodule repo kind requires a repo_path");
            scm::submodule_sync(wt_dir, Some(path), false).await?;
            scm::submodule_update_init(wt_dir, Some(path), false).await?;
            let dir = wt_dir.join(path);
            if !dir.join(".git").exists() {
                scm::worktree_remove_force(root, wt_dir).await.ok();
                return Err(WorktreeError::SubmoduleMissing(dir));
            }
            Ok(dir)
        }
    }
}

/// Remove the worktree entirely (host-side terminal cleanup, not used by
/// the Worker itself).
pub async fn remove(root: &Path, wt_dir: &Path) -> Result<()> {
    scm::worktree_remove_force(root, wt_dir).await?;
    Ok(())
}
