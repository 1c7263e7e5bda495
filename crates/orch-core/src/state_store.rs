//! Atomic file-based state store.
//!
//! Every mutable record this system persists (consecutive failure counter,
//! per-issue fail_count, `IssueResult`, `ExecutionTrace`, `PIDFile`) goes
//! through `write_atomic`: write a temp file next to the target, fsync it,
//! then rename into place. Appenders (`failure_history.jsonl`, the session
//! journal) use `append_jsonl` instead and never rename.

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize record for {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to parse record at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Write `bytes` to `path` atomically: tmp file in the same directory,
/// fsync, then rename. Falls back to a backup-rename sequence when the
/// platform's rename cannot overwrite an existing file, restoring the
/// backup if the final rename fails. Never leaves both the original and
/// the temp file visible.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StateStoreError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(|source| StateStoreError::Io {
        path: parent.to_path_buf(),
        source,
    })?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|source| StateStoreError::Io {
        path: parent.to_path_buf(),
        source,
    })?;
    tmp.write_all(bytes).map_err(|source| StateStoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    tmp.as_file().sync_all().map_err(|source| StateStoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    match tmp.persist(path) {
        Ok(_) => Ok(()),
        Err(_) => {
            // Overwrite-by-rename failed (platform limitation): back up the
            // existing file, retry, and restore the backup on failure.
            let backup = path.with_extension("bak");
            if path.exists() {
                std::fs::rename(path, &backup).map_err(|source| StateStoreError::Io {
                    path: backup.clone(),
                    source,
                })?;
            }
            let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|source| StateStoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
            tmp.write_all(bytes).map_err(|source| StateStoreError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            tmp.as_file().sync_all().map_err(|source| StateStoreError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            match tmp.persist(path) {
                Ok(_) => {
                    let _ = std::fs::remove_file(&backup);
                    Ok(())
                }
                Err(e) => {
                    if backup.exists() {
                        let _ = std::fs::rename(&backup, path);
                    }
                    Err(StateStoreError::Io {
                        path: path.to_path_buf(),
                        source: e.error,
                    })
                }
            }
        }
    }
}

/// Serialize `value` to JSON and write it atomically.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StateStoreError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| StateStoreError::Serialize {
        path: path.to_path_buf(),
        source,
    })?;
    write_atomic(path, &bytes)
}

/// Read a JSON record. Returns `Ok(None)` when the file does not exist,
/// distinguishing "not found" from a parse/IO error.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StateStoreError> {
    match std::fs::read(path) {
        Ok(bytes) => {
            let value = serde_json::from_slice(&bytes).map_err(|source| StateStoreError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(StateStoreError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Append a single newline-terminated JSON record to `path`, creating the
/// file (and parent directories) if necessary. Used for append-only
/// journals; never uses tmp+rename.
pub fn append_jsonl<T: Serialize>(path: &Path, record: &T) -> Result<(), StateStoreError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(|source| StateStoreError::Io {
        path: parent.to_path_buf(),
        source,
    })?;
    let mut line = serde_json::to_vec(record).map_err(|source| StateStoreError::Serialize {
        path: path.to_path_buf(),
        source,
    })?;
    line.push(b'\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| StateStoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    file.write_all(&line).map_err(|source| StateStoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    file.sync_data().map_err(|source| StateStoreError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Read an integer counter file (`consecutive_failures`, `fail_count.txt`),
/// defaulting to zero when absent.
pub fn read_counter(path: &Path) -> Result<u32, StateStoreError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(content.trim().parse().unwrap_or(0)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(source) => Err(StateStoreError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

pub fn write_counter(path: &Path, value: u32) -> Result<(), StateStoreError> {
    write_atomic(path, value.to_string().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        value: u32,
    }

    #[test]
    fn write_then_read_json_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results").join("issue-1.json");
        let record = Sample { value: 7 };
        write_json(&path, &record).unwrap();
        let read_back: Sample = read_json(&path).unwrap().unwrap();
        assert_eq!(read_back, record);
    }

    #[test]
    fn read_json_missing_file_is_none_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        let result: Option<Sample> = read_json(&path).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn write_atomic_never_leaves_tmp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("fail_count.txt");
        write_atomic(&path, b"1").unwrap();
        write_atomic(&path, b"2").unwrap();
        let entries: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(Result::ok)
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(entries, vec!["fail_count.txt"]);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "2");
    }

    #[test]
    fn append_jsonl_appends_newline_terminated_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("failure_history.jsonl");
        append_jsonl(&path, &Sample { value: 1 }).unwrap();
        append_jsonl(&path, &Sample { value: 2 }).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], r#"{"value":1}"#);
        assert_eq!(lines[1], r#"{"value":2}"#);
    }

    #[test]
    fn counter_round_trips_and_defaults_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("consecutive_failures");
        assert_eq!(read_counter(&path).unwrap(), 0);
        write_counter(&path, 3).unwrap();
        assert_eq!(read_counter(&path).unwrap(), 3);
    }
}
