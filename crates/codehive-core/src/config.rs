//! Configuration management for Codehive
//!
//! Project-level settings for the execution queue, branch locks, timeouts,
//! snapshots, git and the external instruction executor.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::{CodehiveError, Result};

/// Directory holding all Codehive state inside a project
pub const STATE_DIR: &str = ".codehive";

/// Project-level Codehive configuration
///
/// Loaded from `.codehive/config.toml` in the project root.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CodehiveConfig {
    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub locks: LockConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub snapshots: SnapshotConfig,

    #[serde(default)]
    pub git: GitConfig,

    #[serde(default)]
    pub executor: ExecutorConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum instructions executing at once
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockConfig {
    /// Lifetime of a branch lock before another cycle may take it over
    #[serde(default = "default_lock_ttl_minutes")]
    pub ttl_minutes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Bound on a single AI generation call
    #[serde(default = "default_ai_secs")]
    pub ai_secs: u64,

    #[serde(default = "default_git_secs")]
    pub git_secs: u64,

    /// Bound on one instruction run by the external executor
    #[serde(default = "default_process_secs")]
    pub process_secs: u64,

    /// Wait between SIGTERM and SIGKILL
    #[serde(default = "default_kill_grace_secs")]
    pub kill_grace_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotConfig {
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Top-level directory or file names never captured
    #[serde(default = "default_excludes")]
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GitConfig {
    #[serde(default = "default_base_branch")]
    pub base_branch: String,

    #[serde(default = "default_remote")]
    pub remote: String,

    /// Program invoked as `{pr_tool} pr create ...`
    #[serde(default = "default_pr_tool")]
    pub pr_tool: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Coding-assistant CLI that receives instruction directives on stdin
    #[serde(default = "default_executor_program")]
    pub program: String,

    #[serde(default = "default_executor_args")]
    pub args: Vec<String>,
}

// Default value providers
fn default_max_concurrent() -> usize {
    3
}

fn default_lock_ttl_minutes() -> u64 {
    30
}

fn default_ai_secs() -> u64 {
    300
}

fn default_git_secs() -> u64 {
    60
}

fn default_process_secs() -> u64 {
    600
}

fn default_kill_grace_secs() -> u64 {
    5
}

fn default_retention_days() -> u32 {
    7
}

fn default_excludes() -> Vec<String> {
    vec![
        ".git".to_string(),
        STATE_DIR.to_string(),
        "node_modules".to_string(),
        "target".to_string(),
    ]
}

fn default_base_branch() -> String {
    "main".to_string()
}

fn default_remote() -> String {
    "origin".to_string()
}

fn default_pr_tool() -> String {
    "gh".to_string()
}

fn default_executor_program() -> String {
    "claude".to_string()
}

fn default_executor_args() -> Vec<String> {
    vec!["--print".to_string()]
}

impl CodehiveConfig {
    /// Load configuration from `.codehive/config.toml` or use defaults
    pub fn load_or_default(project_root: &Path) -> Result<Self> {
        let config_path = project_root.join(STATE_DIR).join("config.toml");

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: Self = toml::from_str(&content)
                .map_err(|e| CodehiveError::Config(format!("Failed to parse config file: {}", e)))?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Write default configuration to `.codehive/config.toml`
    pub fn write_default(project_root: &Path) -> Result<()> {
        let config_dir = project_root.join(STATE_DIR);
        std::fs::create_dir_all(&config_dir)?;

        let config_path = config_dir.join("config.toml");
        let content = toml::to_string_pretty(&Self::default())
            .map_err(|e| CodehiveError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue.max_concurrent == 0 {
            return Err(CodehiveError::Config(
                "queue.max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.locks.ttl_minutes == 0 {
            return Err(CodehiveError::Config(
                "locks.ttl_minutes must be at least 1".to_string(),
            ));
        }
        if self.executor.program.trim().is_empty() {
            return Err(CodehiveError::Config(
                "executor.program must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl LockConfig {
    pub fn ttl_millis(&self) -> i64 {
        (self.ttl_minutes as i64) * 60 * 1000
    }
}

impl TimeoutConfig {
    pub fn ai(&self) -> Duration {
        Duration::from_secs(self.ai_secs)
    }

    pub fn git(&self) -> Duration {
        Duration::from_secs(self.git_secs)
    }

    pub fn process(&self) -> Duration {
        Duration::from_secs(self.process_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_minutes: default_lock_ttl_minutes(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            ai_secs: default_ai_secs(),
            git_secs: default_git_secs(),
            process_secs: default_process_secs(),
            kill_grace_secs: default_kill_grace_secs(),
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
            exclude: default_excludes(),
        }
    }
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            base_branch: default_base_branch(),
            remote: default_remote(),
            pr_tool: default_pr_tool(),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            program: default_executor_program(),
            args: default_executor_args(),
        }
    }
}
