//! Preflight: the per-kind precondition checks run before worktree setup.
//! Never mutates state other than the cached remote-accessibility probe.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use orch_core::{state_store, RepoKind, StateStoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scm::{self, ScmError};

/// Remote-reachability probes are cached for 5 minutes per URL.
const REACHABILITY_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Error)]
pub enum PreflightError {
    #[error("root working tree has uncommitted changes")]
    RootDirty,
    #[error("submodule at {0} has uncommitted changes")]
    SubmoduleDirty(PathBuf),
    #[error("directory repo path {0} does not exist")]
    DirectoryMissing(PathBuf),
    #[error("submodule path {0} does not exist or has no .git")]
    SubmoduleMissing(PathBuf),
    #[error("origin for submodule at {path} is not reachable: {url}")]
    SubmoduleRemoteUnreachable { path: PathBuf, url: String },
    #[error(transparent)]
    Scm(#[from] ScmError),
    #[error(transparent)]
    StateStore(#[from] StateStoreError),
}

pub type Result<T> = std::result::Result<T, PreflightError>;

#[derive(Debug, Default, Serialize, Deserialize)]
struct ReachabilityCache(HashMap<String, CacheEntry>);

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    accessible: bool,
    checked_at: DateTime<Utc>,
}

fn cache_path(state_root: &Path) -> PathBuf {
    state_root.join(".ai/state/cache/remote_accessibility.json")
}

async fn is_reachable_cached(state_root: &Path, url: &str) -> Result<bool> {
    let path = cache_path(state_root);
    let mut cache: ReachabilityCache = state_store::read_json(&path)?.unwrap_or_default();

    if let Some(entry) = cache.0.get(url) {
        let age = Utc::now().signed_duration_since(entry.checked_at);
        if age.to_std().map(|d| d < REACHABILITY_CACHE_TTL).unwrap_or(false) {
            return Ok(entry.accessible);
        }
    }

    let accessible = scm::ls_remote_reachable(url).await;
    cache.0.insert(
        url.to_string(),
        CacheEntry {
            accessible,
            checked_at: Utc::now(),
        },
    );
    state_store::write_json(&path, &cache)?;
    Ok(accessible)
}

/// Run the preflight checks for a ticket's resolved repo kind.
///
/// `origin_url` is only consulted for `RepoKind::Submodule`.
pub async fn check(
    state_root: &Path,
    root: &Path,
    kind: RepoKind,
    repo_path: Option<&str>,
    origin_url: Option<&str>,
) -> Result<()> {
    if !scm::is_clean(root).await? {
        return Err(PreflightError::RootDirty);
    }

    match kind {
        RepoKind::Root => {
            scm::submodule_sync(root, None, true).await?;
            scm::submodule_update_init(root, None, true).await?;
            // Every submodule must itself be clean.
            for submodule_dir in discover_submodule_dirs(root) {
                if !scm::is_clean(&submodule_dir).await? {
                    return Err(PreflightError::SubmoduleDirty(submodule_dir));
                }
            }
            Ok(())
        }
        RepoKind::Directory => {
            let path = repo_path.expect("directory repo kind requires a repo_path");
            let dir = root.join(path);
            if !dir.is_dir() {
                return Err(PreflightError::DirectoryMissing(dir));
            }
            Ok(())
        }
        RepoKind::Submodule => {
            let path = repo_path.expect("submodule repo kind requires a repo_path");
            let dir = root.join(path);
            if !dir.join(".git").exists() {
                return Err(PreflightError::SubmoduleMissing(dir));
            }
            if !scm::is_clean(&dir).await? {
                return Err(PreflightError::SubmoduleDirty(dir));
            }
            if let Some(url) = origin_url {
                if !is_reachable_cached(state_root, url).await? {
                    return Err(PreflightError::SubmoduleRemoteUnreachable {
                        path: dir,
                        url: url.to_string(),
                    });
                }
            }
            Ok(())
        }
    }
}

/// Best-effort discovery of submodule working directories via
/// `.gitmodules`; used only to enumerate which dirs to clean-check.
fn discover_submodule_dirs(root: &Path) -> Vec<PathBuf> {
    let gitmodules = root.join(".gitmodules");
    let Ok(content) = std::fs::read_to_string(&gitmodules) else {
        return Vec::new();
    };
    content
        .lines()
        .filter_map(|line| line.trim().strip_prefix("path = "))
        .map(|p| root.join(p))
        .filter(|p| p.is_dir())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;

    fn git(dir: &Path, args: &[&str]) {
        let status = StdCommand::new("git").args(args).current_dir(dir).status().unwrap();
        assert!(status.success());
    }

    fn init_repo(dir: &Path) {
        git(dir, &["init", "-q"]);
        git(dir, &["config", "user.email", "test@example.com"]);
        git(dir, &["config", "user.name", "Test"]);
        std::fs::write(dir.join("README.md"), "hi\n").unwrap();
        git(dir, &["add", "-A"]);
        git(dir, &["commit", "-q", "-m", "init"]);
    }

    #[tokio::test]
    async fn root_kind_requires_clean_tree() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let state_root = tempfile::tempdir().unwrap();
        assert!(check(state_root.path(), dir.path(), RepoKind::Root, None, None)
            .await
            .is_ok());

        std::fs::write(dir.path().join("README.md"), "dirty\n").unwrap();
        let err = check(state_root.path(), dir.path(), RepoKind::Root, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, PreflightError::RootDirty));
    }

    #[tokio::test]
    async fn directory_kind_requires_path_to_exist() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let state_root = tempfile::tempdir().unwrap();
        let err = check(
            state_root.path(),
            dir.path(),
            RepoKind::Directory,
            Some("services/missing"),
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PreflightError::DirectoryMissing(_)));
    }

    #[tokio::test]
    async fn reachability_cache_reuses_within_ttl() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let state_root = tempfile::tempdir().unwrap();
        let url = "/nonexistent/origin.git";
        let first = is_reachable_cached(state_root.path(), url).await.unwrap();
        assert!(!first);
        let cache: ReachabilityCache = state_store::read_json(&cache_path(state_root.path()))
            .unwrap()
            .unwrap();
        assert!(cache.0.contains_key(url));
    }
}
