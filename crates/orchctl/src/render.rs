//! Output rendering for the orchctl CLI.

use orch_core::{ExecutionTrace, IssueResult, PidFile};

/// One row of `orchctl list`: an issue id plus whichever state files exist
/// for it.
pub struct ListRow {
    pub issue_id: u64,
    pub pid: Option<PidFile>,
    pub result: Option<IssueResult>,
}

pub fn print_list(rows: &[ListRow]) {
    if rows.is_empty() {
        println!("No issues in flight or recorded.");
        return;
    }

    println!("{:<10}  {:<24}  {:<10}  {:<20}", "ISSUE", "STATUS", "PID", "STARTED");
    println!("{}", "-".repeat(70));
    for row in rows {
        let (status, started) = match (&row.result, &row.pid) {
            (Some(result), _) => (result.status.as_str().to_string(), format_time(&result.timestamp_utc)),
            (None, Some(pid)) => ("running".to_string(), format_time(&pid.started_at)),
            (None, None) => ("unknown".to_string(), "-".to_string()),
        };
        let pid_str = row.pid.as_ref().map(|p| p.pid.to_string()).unwrap_or_else(|| "-".to_string());
        println!("{:<10}  {:<24}  {:<10}  {:<20}", row.issue_id, status, pid_str, started);
    }
    println!();
    println!("{} issue(s)", rows.len());
}

pub fn print_result(issue_id: u64, result: Option<&IssueResult>) {
    println!("Issue: {issue_id}");
    let Some(result) = result else {
        println!("  No result recorded yet.");
        return;
    };
    println!("  Status:        {}", result.status.as_str());
    println!("  Repo:          {} ({})", result.repo, result.repo_type.as_str());
    println!("  Branch:        {} -> {}", result.branch, result.base_branch);
    println!("  Worktree:      {}", result.worktree_path);
    if let Some(ref sha) = result.head_sha {
        println!("  Head SHA:      {sha}");
    }
    if let Some(ref pr_url) = result.pr_url {
        println!("  PR:            {pr_url}");
    }
    if let Some(ref stage) = result.failure_stage {
        println!("  Failure stage: {stage}");
    }
    if let Some(ref cmd) = result.recovery_command {
        println!("  Recovery:      {cmd}");
    }
    println!("  Attempt:       {}", result.session.attempt_number);
    println!("  Worker PID:    {}", result.session.worker_pid);
    println!("  Duration:      {:.1}s", result.metrics.duration_seconds);
    println!("  Retries:       {}", result.metrics.retry_count);
    println!("  Recorded:      {}", format_time(&result.timestamp_utc));
}

pub fn print_trace(issue_id: u64, trace: Option<&ExecutionTrace>) {
    println!("Trace for issue: {issue_id}");
    let Some(trace) = trace else {
        println!("  No trace recorded.");
        return;
    };
    println!("  Status:    {}", trace.status.as_str());
    println!("  Started:   {}", format_time(&trace.started_at));
    if let Some(ref ended) = trace.ended_at {
        println!("  Ended:     {}", format_time(ended));
    }
    if let Some(ref error) = trace.error {
        println!("  Error:     {error}");
    }
    if trace.steps.is_empty() {
        return;
    }
    println!();
    println!("  {:<24}  {:<10}  {:<8}", "STEP", "STATUS", "SECONDS");
    println!("  {}", "-".repeat(46));
    for step in &trace.steps {
        let duration = step.duration_s.map(|d| format!("{d:.1}")).unwrap_or_else(|| "-".to_string());
        println!("  {:<24}  {:<10}  {:<8}", step.name, step.status.as_str(), duration);
        if let Some(ref error) = step.error {
            println!("    error: {error}");
        }
    }
}

fn format_time(dt: &chrono::DateTime<chrono::Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}
