//! Subprocess execution abstraction for git and the PR tool

use async_trait::async_trait;
use codehive_core::{CodehiveError, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

/// Output from a finished command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            success: true,
        }
    }

    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            success: false,
        }
    }
}

impl From<Output> for CommandOutput {
    fn from(output: Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            success: output.status.success(),
        }
    }
}

/// Trait for running programs in the project directory (allows mocking in tests)
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`; a non-zero exit is `Ok` with `success: false`
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput>;

    fn working_dir(&self) -> &Path;

    async fn git(&self, args: &[&str]) -> Result<CommandOutput> {
        self.run("git", args).await
    }
}

/// Real runner backed by `tokio::process`
#[derive(Debug, Clone)]
pub struct ShellRunner {
    working_dir: PathBuf,
    timeout: Duration,
}

impl ShellRunner {
    pub fn new(working_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            working_dir: working_dir.into(),
            timeout,
        }
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    #[instrument(skip(self), fields(dir = %self.working_dir.display()))]
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        debug!("Executing {} {:?}", program, args);

        let child = Command::new(program)
            .args(args)
            .current_dir(&self.working_dir)
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, child).await {
            Ok(result) => result.map_err(|e| {
                CodehiveError::GitCommand(format!("Failed to execute {}: {}", program, e))
            })?,
            Err(_) => {
                warn!("{} {:?} timed out after {:?}", program, args, self.timeout);
                return Err(CodehiveError::Timeout(self.timeout.as_secs()));
            }
        };

        let output = CommandOutput::from(output);
        if !output.success {
            debug!("{} command failed: {}", program, output.stderr);
        }
        Ok(output)
    }

    fn working_dir(&self) -> &Path {
        &self.working_dir
    }
}

/// Mock runner for tests
///
/// Responses are keyed by the full command line (`"git checkout -b x"`).
/// Prefix responses match any command starting with the key; the first
/// registered prefix wins. Every invocation is recorded.
#[derive(Clone)]
pub struct MockCommandRunner {
    working_dir: PathBuf,
    responses: HashMap<String, CommandOutput>,
    prefix_responses: Vec<(String, CommandOutput)>,
    fallback: Option<CommandOutput>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl Default for MockCommandRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCommandRunner {
    pub fn new() -> Self {
        Self {
            working_dir: PathBuf::from("/mock/project"),
            responses: HashMap::new(),
            prefix_responses: Vec::new(),
            fallback: None,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn with_response(mut self, command: &str, output: CommandOutput) -> Self {
        self.responses.insert(command.to_string(), output);
        self
    }

    pub fn with_prefix_response(mut self, prefix: &str, output: CommandOutput) -> Self {
        self.prefix_responses.push((prefix.to_string(), output));
        self
    }

    /// Answer any unmatched command with `output`
    pub fn with_fallback(mut self, output: CommandOutput) -> Self {
        self.fallback = Some(output);
        self
    }

    /// Every command line run so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl CommandRunner for MockCommandRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let key = std::iter::once(program)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(key.clone());

        if let Some(output) = self.responses.get(&key) {
            return Ok(output.clone());
        }
        if let Some((_, output)) = self
            .prefix_responses
            .iter()
            .find(|(prefix, _)| key.starts_with(prefix.as_str()))
        {
            return Ok(output.clone());
        }
        self.fallback
            .clone()
            .ok_or_else(|| CodehiveError::GitCommand(format!("No mock response for: {}", key)))
    }

    fn working_dir(&self) -> &Path {
        &self.working_dir
    }
}
