pub mod artifacts;
pub mod attempt;
pub mod config;
pub mod events;
pub mod security;
pub mod state_store;
pub mod ticket;
pub mod trace;
pub mod types;

pub use artifacts::{global_issue_dir, mirror_artifact, ArtifactError};
pub use attempt::{AttemptCheck, AttemptGuard, ConsecutiveFailureGuard};
pub use config::{Config, ConfigError, EnvOverrides, EscalationConfig, GitConfig};
pub use events::{default_sink, Component, Event, EventLevel, EventSink, RecordingEventSink, TracingEventSink};
pub use security::{
    check as check_secrets, protected_path_violations, scan_diff, submodule_boundary_violations,
    SecretMatch, DEFAULT_PROTECTED_PREFIXES,
};
pub use state_store::StateStoreError;
pub use ticket::{parse_ticket_body, ParsedTicket};
pub use trace::{read_trace, TraceRecorder};
pub use types::{
    AttemptRecord, ConsistencyStatus, ExecutionTrace, FailureHistoryEntry, Id, IssueResult,
    IssueResultStatus, MergeIssueKind, PidFile, RepoBinding, RepoKind, ResultDecision,
    ResultMetrics, ResultSession, SessionLogEntry, StepStatus, TicketFlags, TicketMetadata,
    TraceStatus, TraceStep, VerifyCommands, Worktree,
};
