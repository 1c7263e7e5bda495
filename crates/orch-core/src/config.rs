//! `workflow.yaml` configuration: load, default, and layer environment overrides.
//!
//! The on-disk format is YAML; defaulting and layered resolution follow the
//! same shape as other config loaders in this codebase family, just over a
//! typed `serde_yaml` document instead of a key=value file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::RepoBinding;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid env override {name}={value}: {reason}")]
    InvalidEnvOverride {
        name: &'static str,
        value: String,
        reason: &'static str,
    },
}

fn default_integration_branch() -> String {
    "develop".to_string()
}

fn default_release_branch() -> String {
    "main".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    #[serde(default = "default_integration_branch")]
    pub integration_branch: String,
    #[serde(default = "default_release_branch")]
    pub release_branch: String,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            integration_branch: default_integration_branch(),
            release_branch: default_release_branch(),
        }
    }
}

fn default_backend() -> String {
    "codex".to_string()
}

fn default_retry_count() -> u32 {
    2
}

fn default_retry_delay_seconds() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationConfig {
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_retry_delay_seconds")]
    pub retry_delay_seconds: u64,
}

impl EscalationConfig {
    /// `max_attempts = retry_count + 1`.
    pub fn max_attempts(&self) -> u32 {
        self.retry_count + 1
    }
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            retry_count: default_retry_count(),
            retry_delay_seconds: default_retry_delay_seconds(),
        }
    }
}

/// Root configuration, parsed from `<state_root>/.ai/config/workflow.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub repos: Vec<RepoBinding>,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub escalation: EscalationConfig,
    /// Name of the backend (from the `orchd::backend` registry) dispatched
    /// when a ticket does not name one explicitly. Not part of spec.md's
    /// wire format; an ambient default so the Worker runner always has a
    /// backend to resolve (see DESIGN.md).
    #[serde(default = "default_backend")]
    pub default_backend: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: "1".to_string(),
            repos: Vec::new(),
            git: GitConfig::default(),
            escalation: EscalationConfig::default(),
            default_backend: default_backend(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse_content(&content, path)
    }

    pub fn parse_content(content: &str, path: &Path) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn find_repo(&self, name: &str) -> Option<&RepoBinding> {
        self.repos.iter().find(|r| r.name == name)
    }

    /// Base branch for a ticket: release branch when `release=true`, else
    /// the integration branch.
    pub fn base_branch(&self, release: bool) -> &str {
        if release {
            &self.git.release_branch
        } else {
            &self.git.integration_branch
        }
    }

    /// Layer recognized `AI_*` environment variable overrides on top of the
    /// parsed config.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(value) = std::env::var("AI_MAX_ATTEMPTS") {
            let parsed: u32 = value.parse().map_err(|_| ConfigError::InvalidEnvOverride {
                name: "AI_MAX_ATTEMPTS",
                value: value.clone(),
                reason: "expected a positive integer",
            })?;
            self.escalation.retry_count = parsed.saturating_sub(1);
        }
        if let Ok(value) = std::env::var("AI_BASE_BRANCH") {
            self.git.integration_branch = value;
        }
        Ok(())
    }
}

/// Environment variable overrides not tied to `Config` fields, consulted
/// directly by the component that uses them (SCM timeouts, ticket overrides).
pub struct EnvOverrides;

impl EnvOverrides {
    pub fn remote_base() -> Option<String> {
        std::env::var("AI_REMOTE_BASE").ok()
    }

    pub fn branch_mode_reset() -> Option<String> {
        if std::env::var("AI_BRANCH_MODE").ok().as_deref() == Some("reset") {
            std::env::var("AI_RESET_BASE").ok()
        } else {
            None
        }
    }

    pub fn codex_timeout_secs() -> Option<u64> {
        std::env::var("AI_CODEX_TIMEOUT").ok().and_then(|v| v.parse().ok())
    }

    pub fn git_timeout_secs() -> Option<u64> {
        std::env::var("AI_GIT_TIMEOUT").ok().and_then(|v| v.parse().ok())
    }

    pub fn gh_timeout_secs() -> Option<u64> {
        std::env::var("AI_GH_TIMEOUT").ok().and_then(|v| v.parse().ok())
    }

    pub fn spec_name() -> Option<String> {
        std::env::var("AI_SPEC_NAME").ok()
    }

    pub fn task_line() -> Option<String> {
        std::env::var("AI_TASK_LINE").ok()
    }
}
