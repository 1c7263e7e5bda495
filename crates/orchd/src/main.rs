//! orchd - the orchestrator Principal daemon.
//!
//! Loads `workflow.yaml`, builds the default backend registry and a
//! `gh`-backed host adapter, then drives the Principal loop against a
//! caller-supplied queue file until a shutdown signal arrives.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use orch_core::Config;
use orchd::backend::BackendRegistry;
use orchd::host::GhHostAdapter;
use orchd::{Daemon, DaemonConfig};
use tracing::error;
use tracing_subscriber::{fmt, EnvFilter};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "orchd", about = "Autonomous code-change orchestrator daemon")]
struct Args {
    /// Root of `.ai/` state (results, traces, pids, locks).
    #[arg(long, env = "AI_STATE_ROOT", default_value = ".")]
    state_root: PathBuf,

    /// Root of the repository being worked on.
    #[arg(long, env = "AI_REPO_ROOT", default_value = ".")]
    repo_root: PathBuf,

    /// Path to `workflow.yaml`. Missing file falls back to defaults.
    #[arg(long, env = "AI_CONFIG", default_value = ".ai/config/workflow.yaml")]
    config: PathBuf,

    /// Newline-delimited file of issue ids to dispatch, re-read every pass.
    #[arg(long, env = "AI_ISSUE_QUEUE", default_value = ".ai/queue.txt")]
    issue_queue: PathBuf,

    /// Upper bound on concurrently dispatched issues.
    #[arg(long, env = "AI_MAX_CONCURRENT_ISSUES", default_value_t = 4)]
    max_concurrent_issues: usize,

    /// Per-run deadline in seconds, handed to the Dispatcher/Worker.
    #[arg(long, env = "AI_WORKER_RUN_TIMEOUT_SECS", default_value_t = 3600)]
    worker_run_timeout_secs: u64,

    /// `owner/repo` passed to `gh --repo`; defaults to the `gh` CLI's own
    /// cwd-based resolution when unset.
    #[arg(long, env = "AI_GH_REPO")]
    gh_repo: Option<String>,
}

fn main() {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    let exit_code = runtime.block_on(run(args));
    std::process::exit(exit_code);
}

async fn run(args: Args) -> i32 {
    let mut workflow = if args.config.exists() {
        match Config::from_file(&args.config) {
            Ok(config) => config,
            Err(e) => {
                error!("failed to load {}: {e}", args.config.display());
                return 1;
            }
        }
    } else {
        Config::default()
    };
    if let Err(e) = workflow.apply_env_overrides() {
        error!("invalid environment override: {e}");
        return 1;
    }

    let host: Arc<dyn orchd::host::HostAdapter> = Arc::new(match &args.gh_repo {
        Some(repo) => GhHostAdapter::for_repo(repo.clone()),
        None => GhHostAdapter::new(),
    });
    let backends = BackendRegistry::with_defaults();

    let daemon_config = DaemonConfig {
        state_root: args.state_root,
        repo_root: args.repo_root,
        global_log_dir: PathBuf::from(".ai/logs"),
        max_concurrent_issues: args.max_concurrent_issues,
        worker_run_timeout: Duration::from_secs(args.worker_run_timeout_secs),
        poll_wait: orchd::DEFAULT_POLL_WAIT,
    };

    let daemon = Daemon::new(daemon_config, workflow, host, backends);
    let cleanup = Arc::clone(&daemon.cleanup);

    tokio::select! {
        result = daemon.run(&args.issue_queue) => {
            match result {
                Ok(()) => 0,
                Err(e) => {
                    error!("daemon error: {e}");
                    1
                }
            }
        }
        signum = cleanup.wait_for_signal() => signum,
    }
}
