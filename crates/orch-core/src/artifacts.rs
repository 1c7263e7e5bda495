//! Artifact mirroring: copy a worker's per-attempt log/summary out of its
//! (ephemeral, worktree-local) location into the durable global log
//! directory, recording a content checksum alongside the copy.

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use thiserror::Error;

use sha2::{Digest, Sha256};

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("source file not found: {0}")]
    SourceNotFound(PathBuf),
}

/// `<global_log_dir>/issues/<issue_id>/`
pub fn global_issue_dir(global_log_dir: &Path, issue_id: u64) -> PathBuf {
    global_log_dir.join("issues").join(issue_id.to_string())
}

fn compute_checksum(path: &Path) -> Result<String, ArtifactError> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Copy `source` (an iteration log, tail file, or summary living in the
/// worktree) into the global log directory for `issue_id`. Returns the
/// destination path and the SHA-256 checksum of the copied content.
pub fn mirror_artifact(
    global_log_dir: &Path,
    issue_id: u64,
    source: &Path,
) -> Result<(PathBuf, String), ArtifactError> {
    if !source.exists() {
        return Err(ArtifactError::SourceNotFound(source.to_path_buf()));
    }
    let checksum = compute_checksum(source)?;
    let dest_dir = global_issue_dir(global_log_dir, issue_id);
    fs::create_dir_all(&dest_dir)?;
    let filename = source
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "artifact".to_string());
    let dest = dest_dir.join(&filename);
    fs::copy(source, &dest)?;
    Ok((dest, checksum))
}
