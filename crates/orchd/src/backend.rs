//! Backend registry: pluggable AI-CLI backends, per spec Section 4.J.
//!
//! Grounded on the teacher's `Runner::execute_step` attempt-loop/backoff/
//! per-attempt logging shape (`iter-XX.log` + `iter-XX.tail.txt` naming,
//! last-200-lines tail extraction) generalized from a single hardcoded
//! `claude` invocation into a named-backend table, and from prompt-as-arg
//! into prompt-on-stdin per spec's CLI contract.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{info, warn};

/// Overall per-invocation timeout, per spec Section 5 (maps to synthetic
/// exit code 124 on elapse).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1800);
const TIMEOUT_EXIT_CODE: i32 = 124;
const NOT_FOUND_EXIT_CODE: i32 = 127;
const TAIL_LINES: usize = 200;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend '{0}' is not available (binary not in PATH)")]
    NotAvailable(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("backend '{name}' exited with code {code}")]
    ExitCode { name: String, code: i32 },
    #[error("backend '{name}' timed out after {timeout_secs}s")]
    Timeout { name: String, timeout_secs: u64 },
    #[error("unknown backend '{0}'")]
    UnknownBackend(String),
}

pub type Result<T> = std::result::Result<T, BackendError>;

#[derive(Debug, Clone)]
pub struct BackendOpts {
    pub prompt: String,
    pub working_dir: PathBuf,
    pub log_dir: PathBuf,
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct BackendResult {
    pub attempts: u32,
    pub retry_count: u32,
    pub duration: Duration,
    pub failure_stage: Option<String>,
    pub failure_reason: Option<String>,
    pub succeeded: bool,
    pub log_paths: Vec<PathBuf>,
}

/// `Name` / `Available` / `Execute(opts)` from spec Section 4.J.
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;
    fn is_available(&self) -> bool;
    async fn execute(&self, opts: &BackendOpts) -> Result<BackendResult>;
}

/// A CLI-invoked backend that pipes the prompt on stdin and honors
/// max-attempts/retry-delay/timeout, per spec's common `Execute` contract.
pub struct CliBackend {
    name: String,
    binary: String,
    extra_args: Vec<String>,
}

impl CliBackend {
    pub fn new(name: impl Into<String>, binary: impl Into<String>, extra_args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            binary: binary.into(),
            extra_args,
        }
    }

    fn log_path(log_dir: &Path, name: &str, attempt: u32) -> PathBuf {
        log_dir.join(format!("{name}.attempt-{attempt:02}.log"))
    }

    fn tail_path(log_dir: &Path, name: &str, attempt: u32) -> PathBuf {
        log_dir.join(format!("{name}.attempt-{attempt:02}.tail.txt"))
    }

    async fn execute_once(&self, opts: &BackendOpts, attempt: u32) -> Result<(PathBuf, String)> {
        std::fs::create_dir_all(&opts.log_dir)?;
        let log_path = Self::log_path(&opts.log_dir, &self.name, attempt);
        let tail_path = Self::tail_path(&opts.log_dir, &self.name, attempt);

        let mut cmd = Command::new(&self.binary);
        cmd.args(&self.extra_args)
            .current_dir(&opts.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BackendError::NotAvailable(self.name.clone())
            } else {
                BackendError::Io(e)
            }
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(opts.prompt.as_bytes()).await?;
        }

        let wait = child.wait_with_output();
        let output = match timeout(opts.timeout, wait).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(BackendError::Timeout {
                    name: self.name.clone(),
                    timeout_secs: opts.timeout.as_secs(),
                })
            }
        };

        let mut combined = Vec::with_capacity(output.stdout.len() + output.stderr.len());
        combined.extend_from_slice(&output.stdout);
        combined.extend_from_slice(&output.stderr);
        std::fs::write(&log_path, &combined)?;

        let text = String::from_utf8_lossy(&combined).to_string();
        let tail = tail_lines(&text, TAIL_LINES);
        let mut tail_file = std::fs::File::create(&tail_path)?;
        tail_file.write_all(tail.as_bytes())?;

        let code = output.status.code().unwrap_or(-1);
        if code == NOT_FOUND_EXIT_CODE {
            return Err(BackendError::NotAvailable(self.name.clone()));
        }
        if code != 0 {
            return Err(BackendError::ExitCode {
                name: self.name.clone(),
                code,
            });
        }

        Ok((log_path, text))
    }
}

#[async_trait]
impl Backend for CliBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_available(&self) -> bool {
        which(&self.binary)
    }

    /// Retries up to `opts.max_attempts` with fixed backoff. On timeout
    /// (124) or missing binary (127), does not retry further in the same
    /// run, per spec Section 4.I step 6.
    async fn execute(&self, opts: &BackendOpts) -> Result<BackendResult> {
        let start = Instant::now();
        let mut retry_count = 0;
        let mut log_paths = Vec::new();

        for attempt in 1..=opts.max_attempts.max(1) {
            info!(backend = %self.name, attempt, "invoking backend");
            match self.execute_once(opts, attempt).await {
                Ok((log_path, _text)) => {
                    log_paths.push(log_path);
                    return Ok(BackendResult {
                        attempts: attempt,
                        retry_count,
                        duration: start.elapsed(),
                        failure_stage: None,
                        failure_reason: None,
                        succeeded: true,
                        log_paths,
                    });
                }
                Err(BackendError::Timeout { .. }) => {
                    let reason = extract_failure_reason(&Self::tail_path(&opts.log_dir, &self.name, attempt));
                    return Ok(BackendResult {
                        attempts: attempt,
                        retry_count,
                        duration: start.elapsed(),
                        failure_stage: Some("backend_timeout".to_string()),
                        failure_reason: reason,
                        succeeded: false,
                        log_paths,
                    });
                }
                Err(BackendError::NotAvailable(_)) => {
                    return Ok(BackendResult {
                        attempts: attempt,
                        retry_count,
                        duration: start.elapsed(),
                        failure_stage: Some("backend_not_found".to_string()),
                        failure_reason: Some(format!("backend '{}' binary not found", self.name)),
                        succeeded: false,
                        log_paths,
                    });
                }
                Err(e @ BackendError::ExitCode { .. }) => {
                    warn!(backend = %self.name, attempt, error = %e, "backend run failed");
                    log_paths.push(Self::log_path(&opts.log_dir, &self.name, attempt));
                    if attempt < opts.max_attempts {
                        retry_count += 1;
                        tokio::time::sleep(opts.retry_delay).await;
                        continue;
                    }
                    let reason = extract_failure_reason(&Self::tail_path(&opts.log_dir, &self.name, attempt));
                    return Ok(BackendResult {
                        attempts: attempt,
                        retry_count,
                        duration: start.elapsed(),
                        failure_stage: Some("backend_exit_nonzero".to_string()),
                        failure_reason: reason,
                        succeeded: false,
                        log_paths,
                    });
                }
                Err(e) => return Err(e),
            }
        }

        unreachable!("loop always returns on its final iteration")
    }
}

fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

/// Well-known error-line prefixes scanned from the tail of the log,
/// per spec Section 4.J's `Execute` result contract.
const ERROR_PREFIXES: &[&str] = &["Error:", "error:", "FATAL:", "panic:", "Traceback (most recent call last):"];

fn extract_failure_reason(tail_path: &Path) -> Option<String> {
    let text = std::fs::read_to_string(tail_path).ok()?;
    text.lines()
        .rev()
        .find(|line| ERROR_PREFIXES.iter().any(|p| line.trim_start().starts_with(p)))
        .map(str::to_string)
}

fn which(binary: &str) -> bool {
    let Ok(path_var) = std::env::var("PATH") else {
        return false;
    };
    std::env::split_paths(&path_var).any(|dir| dir.join(binary).is_file())
}

/// Named-backend table resolved by name from config, per spec Section 4.J.
pub struct BackendRegistry {
    backends: HashMap<String, Box<dyn Backend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
        }
    }

    /// The default registry: `codex` and `claude-code`, matching spec
    /// Section 4.J's named examples.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(CliBackend::new("codex", "codex", vec!["exec".to_string()])));
        registry.register(Box::new(CliBackend::new(
            "claude-code",
            "claude",
            vec!["-p".to_string(), "--dangerously-skip-permissions".to_string()],
        )));
        registry
    }

    pub fn register(&mut self, backend: Box<dyn Backend>) {
        self.backends.insert(backend.name().to_string(), backend);
    }

    pub fn get(&self, name: &str) -> Result<&dyn Backend> {
        self.backends
            .get(name)
            .map(|b| b.as_ref())
            .ok_or_else(|| BackendError::UnknownBackend(name.to_string()))
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_lines_caps_output() {
        let text = (1..=300).map(|i| i.to_string()).collect::<Vec<_>>().join("\n");
        let tail = tail_lines(&text, 200);
        assert_eq!(tail.lines().count(), 200);
        assert_eq!(tail.lines().next().unwrap(), "101");
    }

    #[test]
    fn extract_failure_reason_finds_last_matching_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tail.txt");
        std::fs::write(&path, "building...\nerror: could not compile\nretrying\n").unwrap();
        let reason = extract_failure_reason(&path).unwrap();
        assert!(reason.contains("could not compile"));
    }

    #[test]
    fn registry_resolves_known_backend_names() {
        let registry = BackendRegistry::with_defaults();
        assert_eq!(registry.get("codex").unwrap().name(), "codex");
        assert_eq!(registry.get("claude-code").unwrap().name(), "claude-code");
        assert!(matches!(
            registry.get("nonexistent").unwrap_err(),
            BackendError::UnknownBackend(_)
        ));
    }

    #[tokio::test]
    async fn execute_reports_not_available_for_missing_binary() {
        let backend = CliBackend::new("ghost", "this-binary-does-not-exist-xyz", vec![]);
        let dir = tempfile::tempdir().unwrap();
        let opts = BackendOpts {
            prompt: "hello".into(),
            working_dir: dir.path().to_path_buf(),
            log_dir: dir.path().join("logs"),
            max_attempts: 1,
            retry_delay: Duration::from_millis(1),
            timeout: Duration::from_secs(5),
        };
        let result = backend.execute(&opts).await.unwrap();
        assert!(!result.succeeded);
        assert_eq!(result.failure_stage.as_deref(), Some("backend_not_found"));
    }
}
