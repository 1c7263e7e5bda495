//! orchctl - operator CLI for inspecting orchd's on-disk state.
//!
//! Reads the `.ai/` tree directly; there is no daemon socket to dial.

mod client;
mod render;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use client::StateClient;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "orchctl")]
#[command(about = "Inspect the orchestrator's on-disk state")]
#[command(version)]
struct Cli {
    /// Root of `.ai/` state, matching the daemon's `--state-root`.
    #[arg(long, global = true, env = "AI_STATE_ROOT", default_value = ".")]
    state_root: PathBuf,

    /// Root of the directory `orchd --global-log-dir` writes under.
    #[arg(long, global = true, env = "AI_GLOBAL_LOG_DIR", default_value = ".ai/logs")]
    global_log_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List issues currently in flight or with a recorded result.
    List,
    /// Show the recorded `IssueResult` for an issue.
    Show {
        issue_id: u64,
    },
    /// Show the `ExecutionTrace` (step-by-step progress) for an issue.
    Trace {
        issue_id: u64,
    },
    /// Print the tail of the most recent backend log for an issue.
    Tail {
        issue_id: u64,
        /// Number of trailing lines to print.
        #[arg(long, default_value_t = 60)]
        lines: usize,
    },
    /// Force-remove a stale PID file for an issue.
    ClearPid {
        issue_id: u64,
    },
}

fn main() {
    let cli = Cli::parse();
    let client = StateClient::new(cli.state_root);

    let exit_code = match cli.command {
        Command::List => run_list(&client),
        Command::Show { issue_id } => run_show(&client, issue_id),
        Command::Trace { issue_id } => run_trace(&client, issue_id),
        Command::Tail { issue_id, lines } => run_tail(&client, &cli.global_log_dir, issue_id, lines),
        Command::ClearPid { issue_id } => run_clear_pid(&client, issue_id),
    };
    std::process::exit(exit_code);
}

fn run_list(client: &StateClient) -> i32 {
    let mut issue_ids = match client.in_flight_issue_ids() {
        Ok(ids) => ids,
        Err(e) => return fail(&e),
    };
    match client.completed_issue_ids() {
        Ok(ids) => {
            for id in ids {
                if !issue_ids.contains(&id) {
                    issue_ids.push(id);
                }
            }
        }
        Err(e) => return fail(&e),
    }
    issue_ids.sort_unstable();

    let mut rows = Vec::with_capacity(issue_ids.len());
    for issue_id in issue_ids {
        let pid = match client.pid_file(issue_id) {
            Ok(pid) => pid,
            Err(e) => return fail(&e),
        };
        let result = match client.result(issue_id) {
            Ok(result) => result,
            Err(e) => return fail(&e),
        };
        rows.push(render::ListRow { issue_id, pid, result });
    }
    render::print_list(&rows);
    0
}

fn run_show(client: &StateClient, issue_id: u64) -> i32 {
    match client.result(issue_id) {
        Ok(result) => {
            render::print_result(issue_id, result.as_ref());
            0
        }
        Err(e) => fail(&e),
    }
}

fn run_trace(client: &StateClient, issue_id: u64) -> i32 {
    match client.trace(issue_id) {
        Ok(trace) => {
            render::print_trace(issue_id, trace.as_ref());
            0
        }
        Err(e) => fail(&e),
    }
}

fn run_tail(client: &StateClient, global_log_dir: &std::path::Path, issue_id: u64, lines: usize) -> i32 {
    let log_path = match client.latest_log_path(global_log_dir, issue_id) {
        Ok(path) => path,
        Err(e) => return fail(&e),
    };
    let Some(log_path) = log_path else {
        println!("No logs recorded for issue {issue_id}.");
        return 0;
    };
    let content = match std::fs::read_to_string(&log_path) {
        Ok(content) => content,
        Err(e) => {
            eprintln!("failed to read {}: {e}", log_path.display());
            return 1;
        }
    };
    println!("==> {} <==", log_path.display());
    let all_lines: Vec<&str> = content.lines().collect();
    let start = all_lines.len().saturating_sub(lines);
    for line in &all_lines[start..] {
        println!("{line}");
    }
    0
}

fn run_clear_pid(client: &StateClient, issue_id: u64) -> i32 {
    match client.clear_pid(issue_id) {
        Ok(true) => {
            println!("Cleared PID file for issue {issue_id}.");
            0
        }
        Ok(false) => {
            println!("No PID file for issue {issue_id}.");
            0
        }
        Err(e) => fail(&e),
    }
}

fn fail(error: &client::ClientError) -> i32 {
    eprintln!("error: {error}");
    1
}
