//! File-based state reader for orchd's `.ai/` tree.
//!
//! Unlike the teacher's HTTP client, there is no daemon socket to dial:
//! orchctl reads the same atomic JSON files the Principal and Worker write,
//! directly off disk.

use std::path::{Path, PathBuf};

use orch_core::{ExecutionTrace, IssueResult, PidFile};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    StateStore(#[from] orch_core::StateStoreError),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, ClientError>;

pub struct StateClient {
    state_root: PathBuf,
}

impl StateClient {
    pub fn new(state_root: PathBuf) -> Self {
        Self { state_root }
    }

    fn pids_dir(&self) -> PathBuf {
        self.state_root.join(".ai/state/pids")
    }

    fn pid_path(&self, issue_id: u64) -> PathBuf {
        self.pids_dir().join(format!("issue-{issue_id}.json"))
    }

    fn result_path(&self, issue_id: u64) -> PathBuf {
        self.state_root.join(".ai/results").join(format!("issue-{issue_id}.json"))
    }

    fn trace_path(&self, issue_id: u64) -> PathBuf {
        self.state_root.join(".ai/state/traces").join(format!("issue-{issue_id}.json"))
    }

    fn read_dir_ids(&self, dir: PathBuf) -> Result<Vec<u64>> {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(ClientError::Io { path: dir, source }),
        };
        let mut ids: Vec<u64> = entries
            .flatten()
            .filter_map(|entry| entry.file_name().to_str()?.strip_prefix("issue-")?.strip_suffix(".json")?.parse().ok())
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// Issue ids with a live PID file, i.e. believed in-flight.
    pub fn in_flight_issue_ids(&self) -> Result<Vec<u64>> {
        self.read_dir_ids(self.pids_dir())
    }

    /// Issue ids that have ever produced a result, landed or not.
    pub fn completed_issue_ids(&self) -> Result<Vec<u64>> {
        self.read_dir_ids(self.state_root.join(".ai/results"))
    }

    pub fn pid_file(&self, issue_id: u64) -> Result<Option<PidFile>> {
        Ok(orch_core::state_store::read_json(&self.pid_path(issue_id))?)
    }

    pub fn result(&self, issue_id: u64) -> Result<Option<IssueResult>> {
        Ok(orch_core::state_store::read_json(&self.result_path(issue_id))?)
    }

    pub fn trace(&self, issue_id: u64) -> Result<Option<ExecutionTrace>> {
        Ok(orch_core::state_store::read_json(&self.trace_path(issue_id))?)
    }

    /// Force-remove a stale PID file, e.g. when a worker crashed hard
    /// enough that the Principal's own crash detection never ran. Returns
    /// whether a file was actually there to remove.
    pub fn clear_pid(&self, issue_id: u64) -> Result<bool> {
        let path = self.pid_path(issue_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(ClientError::Io { path, source }),
        }
    }

    /// The most recent backend log file for an issue (`*.attempt-NN.log`,
    /// highest attempt by name sort), under
    /// `<global_log_dir>/issues/<issue_id>/`.
    pub fn latest_log_path(&self, global_log_dir: &Path, issue_id: u64) -> Result<Option<PathBuf>> {
        let dir = global_log_dir.join("issues").join(issue_id.to_string());
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(ClientError::Io { path: dir, source }),
        };
        let mut logs: Vec<PathBuf> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("log"))
            .collect();
        logs.sort();
        Ok(logs.pop())
    }
}
