//! Instruction executors
//!
//! [`ProcessExecutor`] pipes an instruction's directive into an external
//! coding-assistant CLI and interprets what comes back. The final JSON status
//! line, when present, decides the outcome:
//!
//! ```text
//! {"status": "success", "summary": "...", "token_usage": 1234}
//! ```
//!
//! Without one, exit status and keyword matching on stdout are used.
//!
//! Cancellation and timeouts terminate in two steps: SIGTERM, then a kill
//! after the grace window. The executor returns as soon as SIGTERM is sent.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};

use codehive_core::{CodehiveConfig, CodehiveError, Instruction, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub token_usage: u64,
}

impl ExecutionOutcome {
    pub fn succeeded(output: impl Into<String>, token_usage: u64) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
            token_usage,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
            token_usage: 0,
        }
    }
}

/// Runs one instruction to completion
///
/// `cancel` fires when the caller gives up on the instruction; implementations
/// should stop promptly and may return `CodehiveError::Cancelled`.
#[async_trait]
pub trait InstructionExecutor: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(
        &self,
        instruction: &Instruction,
        cancel: oneshot::Receiver<()>,
    ) -> Result<ExecutionOutcome>;
}

/// Prompt sent to the assistant on stdin
pub fn build_prompt(instruction: &Instruction) -> String {
    let mut prompt = format!(
        "{}\n\nExpected outcome: {}\n",
        instruction.directive, instruction.expected_outcome
    );
    if let Some(criteria) = &instruction.validation_criteria {
        prompt.push_str(&format!("Validation: {}\n", criteria));
    }
    prompt.push_str(
        "\nWhen finished, print one final line of JSON: \
         {\"status\": \"success\"|\"failure\", \"summary\": \"...\", \"token_usage\": N}\n",
    );
    prompt
}

#[derive(Debug, Deserialize)]
struct StatusLine {
    status: String,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default, alias = "tokens")]
    token_usage: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

fn success_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(success(ful(ly)?)?|completed|done)\b").expect("valid success pattern")
    })
}

fn failure_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(error|failed|failure|panicked)\b").expect("valid failure pattern")
    })
}

fn tokens_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)tokens?(?:\s+used)?\s*[:=]\s*(\d+)").expect("valid tokens pattern")
    })
}

fn last_status_line(stdout: &str) -> Option<StatusLine> {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .find_map(|line| serde_json::from_str::<StatusLine>(line).ok())
}

/// Interpret a finished assistant run
pub fn parse_outcome(exit_ok: bool, stdout: &str, stderr: &str) -> ExecutionOutcome {
    if let Some(status) = last_status_line(stdout) {
        let success = matches!(
            status.status.to_ascii_lowercase().as_str(),
            "success" | "succeeded" | "completed" | "ok"
        );
        let output = status
            .summary
            .unwrap_or_else(|| stdout.trim().to_string());
        let error = if success {
            None
        } else {
            Some(
                status
                    .error
                    .unwrap_or_else(|| format!("Executor reported status '{}'", status.status)),
            )
        };
        return ExecutionOutcome {
            success,
            output,
            error,
            token_usage: status.token_usage.unwrap_or(0),
        };
    }

    let token_usage = tokens_pattern()
        .captures_iter(stdout)
        .filter_map(|caps| caps.get(1)?.as_str().parse::<u64>().ok())
        .last()
        .unwrap_or(0);

    let success = exit_ok
        && (success_pattern().is_match(stdout) || !failure_pattern().is_match(stdout));
    let error = if success {
        None
    } else if !stderr.trim().is_empty() {
        Some(stderr.trim().to_string())
    } else if !exit_ok {
        Some("Executor exited with a non-zero status".to_string())
    } else {
        Some("Executor output reports a failure".to_string())
    };

    ExecutionOutcome {
        success,
        output: stdout.trim().to_string(),
        error,
        token_usage,
    }
}

enum Finished {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Executor backed by an external coding-assistant CLI
pub struct ProcessExecutor {
    program: String,
    args: Vec<String>,
    working_dir: PathBuf,
    timeout: Duration,
    kill_grace: Duration,
}

impl ProcessExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir: working_dir.into(),
            timeout: Duration::from_secs(600),
            kill_grace: Duration::from_secs(5),
        }
    }

    pub fn from_config(config: &CodehiveConfig, working_dir: impl Into<PathBuf>) -> Self {
        Self::new(
            config.executor.program.clone(),
            config.executor.args.clone(),
            working_dir,
        )
        .with_timeouts(config.timeouts.process(), config.timeouts.kill_grace())
    }

    pub fn with_timeouts(mut self, timeout: Duration, kill_grace: Duration) -> Self {
        self.timeout = timeout;
        self.kill_grace = kill_grace;
        self
    }

    /// SIGTERM now, kill after the grace window; does not wait for exit
    fn terminate(&self, mut child: Child) {
        let program = self.program.clone();
        let grace = self.kill_grace;

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            match child.id().map(i32::try_from) {
                Some(Ok(pid)) => {
                    if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
                        debug!("SIGTERM to {} ({}) failed: {}", program, pid, e);
                    }
                }
                _ => debug!("{} already exited", program),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }

        tokio::spawn(async move {
            if tokio::time::timeout(grace, child.wait()).await.is_err() {
                warn!(
                    "{} still running {}s after SIGTERM, killing",
                    program,
                    grace.as_secs()
                );
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        });
    }
}

fn drain<R>(pipe: Option<R>) -> tokio::task::JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

#[async_trait]
impl InstructionExecutor for ProcessExecutor {
    fn name(&self) -> &str {
        &self.program
    }

    #[instrument(skip(self, instruction, cancel), fields(instruction_id = %instruction.id))]
    async fn execute(
        &self,
        instruction: &Instruction,
        mut cancel: oneshot::Receiver<()>,
    ) -> Result<ExecutionOutcome> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CodehiveError::Other(format!("Failed to spawn {}: {}", self.program, e)))?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        if let Some(mut stdin) = child.stdin.take() {
            let prompt = build_prompt(instruction);
            if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                warn!("Could not write prompt to {}: {}", self.program, e);
            }
        }

        let finished = tokio::select! {
            status = child.wait() => Finished::Exited(status),
            _ = tokio::time::sleep(self.timeout) => Finished::TimedOut,
            Ok(()) = &mut cancel => Finished::Cancelled,
        };

        match finished {
            Finished::Exited(status) => {
                let status = status?;
                let stdout = stdout.await.unwrap_or_default();
                let stderr = stderr.await.unwrap_or_default();
                let outcome = parse_outcome(status.success(), &stdout, &stderr);
                info!(
                    success = outcome.success,
                    tokens = outcome.token_usage,
                    "{} finished",
                    self.program
                );
                Ok(outcome)
            }
            Finished::TimedOut => {
                warn!("{} timed out after {}s", self.program, self.timeout.as_secs());
                self.terminate(child);
                Ok(ExecutionOutcome::failed(
                    CodehiveError::Timeout(self.timeout.as_secs()).to_string(),
                ))
            }
            Finished::Cancelled => {
                info!("Cancelling {}", self.program);
                self.terminate(child);
                Err(CodehiveError::Cancelled(instruction.id.clone()))
            }
        }
    }
}
