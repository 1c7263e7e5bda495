//! Trace recorder: builds up an [`ExecutionTrace`] step by step and mirrors
//! it to `.ai/state/traces/issue-<id>.json` after every step, the way the
//! teacher's daemon appends an `EventPayload` after every phase transition
//! and keeps a durable record independent of process lifetime.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;

use crate::events::{self, Component, Event, EventLevel, EventSink};
use crate::state_store::{self, StateStoreError};
use crate::types::{ExecutionTrace, StepStatus, TraceStatus, TraceStep};

pub struct TraceRecorder {
    path: PathBuf,
    trace: ExecutionTrace,
    sink: Arc<dyn EventSink>,
}

impl TraceRecorder {
    /// `path` is the full path to `.ai/state/traces/issue-<id>.json`; the
    /// state store's atomic writer creates parent directories as needed.
    /// Events are mirrored to the process-wide default sink; use
    /// [`Self::start_with_sink`] to inject a different one (tests).
    pub fn start(
        path: &Path,
        issue_id: u64,
        repo: &str,
        branch: &str,
        base_branch: &str,
        worker_pid: u32,
        worker_start_time: u64,
    ) -> Result<Self, StateStoreError> {
        Self::start_with_sink(
            path,
            issue_id,
            repo,
            branch,
            base_branch,
            worker_pid,
            worker_start_time,
            events::default_sink(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn start_with_sink(
        path: &Path,
        issue_id: u64,
        repo: &str,
        branch: &str,
        base_branch: &str,
        worker_pid: u32,
        worker_start_time: u64,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, StateStoreError> {
        let trace = ExecutionTrace::new(issue_id, repo, branch, base_branch, worker_pid, worker_start_time);
        let recorder = Self {
            path: path.to_path_buf(),
            trace,
            sink,
        };
        recorder.flush()?;
        recorder.sink.emit(Event::new(
            Component::Trace,
            EventLevel::Info,
            Some(issue_id),
            format!("run started on {branch} against {base_branch}"),
        ));
        Ok(recorder)
    }

    fn flush(&self) -> Result<(), StateStoreError> {
        state_store::write_json(&self.path, &self.trace)
    }

    /// Begin a named step; returns its index for later completion.
    pub fn begin_step(&mut self, name: &str) -> Result<usize, StateStoreError> {
        self.trace.steps.push(TraceStep {
            name: name.to_string(),
            status: StepStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            duration_s: None,
            error: None,
            context: serde_json::Value::Null,
        });
        self.flush()?;
        self.sink.emit(Event::new(
            Component::Trace,
            EventLevel::Info,
            Some(self.trace.issue_id),
            format!("step started: {name}"),
        ));
        Ok(self.trace.steps.len() - 1)
    }

    /// Mark a previously begun step complete, recording its outcome.
    pub fn finish_step(
        &mut self,
        index: usize,
        status: StepStatus,
        error: Option<String>,
        context: serde_json::Value,
    ) -> Result<(), StateStoreError> {
        let ended_at = Utc::now();
        let mut step_name = String::new();
        if let Some(step) = self.trace.steps.get_mut(index) {
            let duration = (ended_at - step.started_at).num_milliseconds() as f64 / 1000.0;
            step.status = status;
            step.ended_at = Some(ended_at);
            step.duration_s = Some(duration);
            step.error = error.clone();
            step.context = context;
            step_name = step.name.clone();
        }
        self.flush()?;
        let level = if matches!(status, StepStatus::Failed) {
            EventLevel::Error
        } else {
            EventLevel::Info
        };
        let message = match &error {
            Some(e) => format!("step finished: {step_name} ({e})"),
            None => format!("step finished: {step_name}"),
        };
        self.sink
            .emit(Event::new(Component::Trace, level, Some(self.trace.issue_id), message));
        Ok(())
    }

    /// Close out the trace as a whole, writing the terminal status.
    pub fn finish(&mut self, status: TraceStatus, error: Option<String>) -> Result<(), StateStoreError> {
        let ended_at = Utc::now();
        let duration = (ended_at - self.trace.started_at).num_milliseconds() as f64 / 1000.0;
        self.trace.status = status;
        self.trace.ended_at = Some(ended_at);
        self.trace.duration_s = Some(duration);
        self.trace.error = error.clone();
        self.flush()?;
        let level = if matches!(status, TraceStatus::Failed) {
            EventLevel::Error
        } else {
            EventLevel::Info
        };
        let message = match &error {
            Some(e) => format!("run finished: {status:?} ({e})"),
            None => format!("run finished: {status:?}"),
        };
        self.sink
            .emit(Event::new(Component::Trace, level, Some(self.trace.issue_id), message));
        Ok(())
    }

    pub fn trace(&self) -> &ExecutionTrace {
        &self.trace
    }
}

/// Read back a previously written trace, e.g. for the result checker after
/// a crash. `path` is the full `.ai/state/traces/issue-<id>.json` path.
pub fn read_trace(path: &Path) -> Result<Option<ExecutionTrace>, StateStoreError> {
    state_store::read_json(path)
}
