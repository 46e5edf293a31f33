//! Feature branches, checkpoints, commits and merge requests
//!
//! Branch naming conventions:
//!
//! - `feature/cycle-{id}-{slug}`: one branch per TDD cycle
//! - `checkpoint/{phase}-phase-start`: HEAD at the start of a phase, used for rollback
//!
//! Operations return a [`GitResult`] instead of an error: git failures,
//! non-zero exits and timeouts are reported as `success: false`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, instrument, warn};

use codehive_core::config::GitConfig;
use codehive_core::{Phase, Result};

use crate::command::{CommandOutput, CommandRunner};
use crate::lock::{BranchLock, LockTable};
use crate::validate::{
    checkpoint_branch_name, feature_branch_name, validate_branch_name, validate_identifier,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitResult {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
}

impl GitResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
        }
    }

    fn from_output(output: CommandOutput) -> Self {
        if output.success {
            Self::ok(output.stdout.trim())
        } else {
            let error = if output.stderr.trim().is_empty() {
                output.stdout.trim().to_string()
            } else {
                output.stderr.trim().to_string()
            };
            Self {
                success: false,
                output: output.stdout.trim().to_string(),
                error: Some(error),
            }
        }
    }

    fn from_run(result: Result<CommandOutput>) -> Self {
        match result {
            Ok(output) => Self::from_output(output),
            Err(e) => Self::failed(e.to_string()),
        }
    }
}

/// Branch bookkeeping for one cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchState {
    pub cycle_id: String,
    pub feature_branch: String,
    pub base_branch: String,
    pub checkpoints: Vec<String>,
    pub last_commit: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Format a commit message with the phase's conventional prefix
///
/// Fails with `UnknownPhase` when `phase` is not one of the four phases.
pub fn commit_message(message: &str, phase: &str) -> Result<String> {
    let phase: Phase = phase.parse()?;
    Ok(format!("{}: {}", phase.commit_prefix(), message))
}

/// Manager for branch operations of every cycle in one working tree
pub struct BranchManager<R: CommandRunner> {
    runner: R,
    locks: Arc<LockTable>,
    states: Mutex<HashMap<String, BranchState>>,
    config: GitConfig,
}

impl<R: CommandRunner> BranchManager<R> {
    pub fn new(runner: R, locks: Arc<LockTable>, config: GitConfig) -> Self {
        Self {
            runner,
            locks,
            states: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    async fn git(&self, args: &[&str]) -> GitResult {
        GitResult::from_run(self.runner.git(args).await)
    }

    /// Switch to `feature/cycle-{id}-{slug}`, creating it from HEAD if absent
    #[instrument(skip(self))]
    pub async fn create_feature_branch(&self, cycle_id: &str, title: &str) -> GitResult {
        if let Err(e) = validate_identifier(cycle_id, "cycle_id") {
            return GitResult::failed(e.to_string());
        }
        let branch = feature_branch_name(cycle_id, title);
        let reference = format!("refs/heads/{}", branch);

        let exists = self
            .git(&["rev-parse", "--verify", "--quiet", &reference])
            .await
            .success;
        let result = if exists {
            debug!("Branch {} exists, switching", branch);
            self.git(&["checkout", &branch]).await
        } else {
            self.git(&["checkout", "-b", &branch]).await
        };

        if !result.success {
            warn!("Failed to create feature branch {}: {:?}", branch, result.error);
            return result;
        }

        let state = BranchState {
            cycle_id: cycle_id.to_string(),
            feature_branch: branch.clone(),
            base_branch: self.config.base_branch.clone(),
            checkpoints: Vec::new(),
            last_commit: None,
            created_at: Utc::now(),
        };
        self.states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(cycle_id.to_string(), state);

        info!("Cycle {} on branch {}", cycle_id, branch);
        GitResult::ok(branch)
    }

    /// Force `checkpoint/{tag}-phase-start` to HEAD without switching to it
    #[instrument(skip(self))]
    pub async fn create_checkpoint_branch(&self, cycle_id: &str, phase_tag: &str) -> GitResult {
        if let Err(e) = validate_identifier(phase_tag, "phase_tag") {
            return GitResult::failed(e.to_string());
        }
        let branch = checkpoint_branch_name(phase_tag);

        let result = self.git(&["branch", "-f", &branch, "HEAD"]).await;
        if !result.success {
            return result;
        }

        if let Some(state) = self
            .states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(cycle_id)
        {
            if !state.checkpoints.contains(&branch) {
                state.checkpoints.push(branch.clone());
            }
        }
        debug!("Checkpoint {} at HEAD", branch);
        GitResult::ok(branch)
    }

    /// Stage everything and commit with the phase prefix; output is the new HEAD
    #[instrument(skip(self))]
    pub async fn commit_changes(&self, message: &str, phase: Phase) -> GitResult {
        let message = format!("{}: {}", phase.commit_prefix(), message);

        let staged = self.git(&["add", "-A"]).await;
        if !staged.success {
            return staged;
        }

        let committed = self.git(&["commit", "-m", &message]).await;
        if !committed.success {
            if committed.output.contains("nothing to commit") {
                debug!("Nothing to commit for {:?}", message);
            } else {
                return committed;
            }
        }

        let head = self.git(&["rev-parse", "HEAD"]).await;
        if head.success {
            info!("Committed {} as {}", message, head.output);
        }
        head
    }

    /// Record `sha` as the latest commit of the cycle's branch
    pub fn record_commit(&self, cycle_id: &str, sha: &str) {
        if let Some(state) = self
            .states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(cycle_id)
        {
            state.last_commit = Some(sha.to_string());
        }
    }

    /// `git reset --hard {branch}`
    #[instrument(skip(self))]
    pub async fn rollback_to_checkpoint(&self, branch: &str) -> GitResult {
        if let Err(e) = validate_branch_name(branch) {
            return GitResult::failed(e.to_string());
        }
        let result = self.git(&["reset", "--hard", branch]).await;
        if result.success {
            warn!("Rolled back working tree to {}", branch);
        }
        result
    }

    /// Push the cycle's feature branch and open a pull request; output is its URL
    #[instrument(skip(self, body))]
    pub async fn create_merge_request(&self, cycle_id: &str, title: &str, body: &str) -> GitResult {
        let Some(state) = self.branch_state(cycle_id) else {
            return GitResult::failed("Branch state not found");
        };

        let pushed = self
            .git(&["push", "-u", &self.config.remote, &state.feature_branch])
            .await;
        if !pushed.success {
            return pushed;
        }

        let created = GitResult::from_run(
            self.runner
                .run(
                    &self.config.pr_tool,
                    &[
                        "pr",
                        "create",
                        "--base",
                        &state.base_branch,
                        "--head",
                        &state.feature_branch,
                        "--title",
                        title,
                        "--body",
                        body,
                    ],
                )
                .await,
        );
        if !created.success {
            return created;
        }

        let url = created
            .output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .last()
            .unwrap_or_default()
            .to_string();
        info!("Opened merge request for cycle {}: {}", cycle_id, url);
        GitResult::ok(url)
    }

    pub async fn current_branch(&self) -> GitResult {
        self.git(&["rev-parse", "--abbrev-ref", "HEAD"]).await
    }

    #[instrument(skip(self))]
    pub async fn delete_branch(&self, branch: &str, force: bool) -> GitResult {
        if let Err(e) = validate_branch_name(branch) {
            return GitResult::failed(e.to_string());
        }
        let flag = if force { "-D" } else { "-d" };
        self.git(&["branch", flag, branch]).await
    }

    /// Check out `branch` unless another cycle holds its lock
    #[instrument(skip(self))]
    pub async fn switch_to_branch(&self, cycle_id: &str, branch: &str) -> GitResult {
        if let Err(e) = validate_branch_name(branch) {
            return GitResult::failed(e.to_string());
        }
        if let Err(e) = self.locks.check_access(cycle_id, branch) {
            return GitResult::failed(e.to_string());
        }
        self.git(&["checkout", branch]).await
    }

    pub fn acquire_lock(&self, cycle_id: &str, branch: &str, holder: &str) -> bool {
        self.locks.acquire(cycle_id, branch, holder)
    }

    pub fn release_lock(&self, branch: &str) -> bool {
        self.locks.release(branch)
    }

    pub fn lock_holder(&self, branch: &str) -> Option<BranchLock> {
        self.locks.holder(branch)
    }

    /// Track an existing feature branch for a cycle started elsewhere
    ///
    /// Returns false when the cycle already has branch state.
    pub fn adopt_branch(&self, cycle_id: &str, branch: &str) -> bool {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        if states.contains_key(cycle_id) {
            return false;
        }
        states.insert(
            cycle_id.to_string(),
            BranchState {
                cycle_id: cycle_id.to_string(),
                feature_branch: branch.to_string(),
                base_branch: self.config.base_branch.clone(),
                checkpoints: Vec::new(),
                last_commit: None,
                created_at: Utc::now(),
            },
        );
        true
    }

    pub fn branch_state(&self, cycle_id: &str) -> Option<BranchState> {
        self.states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(cycle_id)
            .cloned()
    }

    /// Drop bookkeeping and locks once a cycle is finished
    pub fn forget_cycle(&self, cycle_id: &str) -> Option<BranchState> {
        self.locks.release_all_for(cycle_id);
        self.states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(cycle_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::MockCommandRunner;
    use codehive_core::{CodehiveError, FixedClock};

    fn manager(runner: MockCommandRunner) -> BranchManager<MockCommandRunner> {
        let locks = Arc::new(LockTable::new(Arc::new(FixedClock::new(1_000_000)), 1_800_000));
        BranchManager::new(runner, locks, GitConfig::default())
    }

    #[test]
    fn test_commit_message_prefixes() {
        let cases = [
            ("RED", "feat(tests): msg"),
            ("GREEN", "feat(impl): msg"),
            ("REFACTOR", "refactor: msg"),
            ("REVIEW", "test(review): msg"),
        ];
        for (phase, expected) in cases {
            assert_eq!(commit_message("msg", phase).unwrap(), expected);
        }

        let err = commit_message("msg", "DEPLOY").unwrap_err();
        assert!(matches!(err, CodehiveError::UnknownPhase(_)));
    }

    #[tokio::test]
    async fn test_create_feature_branch_creates_when_missing() {
        let runner = MockCommandRunner::new()
            .with_prefix_response("git rev-parse --verify", CommandOutput::failed(""))
            .with_prefix_response("git checkout -b", CommandOutput::ok(""));
        let branches = manager(runner);

        let result = branches
            .create_feature_branch("42", "Test Feature With Spaces")
            .await;
        assert!(result.success);
        assert_eq!(result.output, "feature/cycle-42-test-feature-with-spaces");
        assert_eq!(
            branches.runner().calls().last().unwrap(),
            "git checkout -b feature/cycle-42-test-feature-with-spaces"
        );

        let state = branches.branch_state("42").unwrap();
        assert_eq!(state.base_branch, "main");
    }

    #[tokio::test]
    async fn test_create_feature_branch_switches_when_present() {
        let runner = MockCommandRunner::new()
            .with_prefix_response("git rev-parse --verify", CommandOutput::ok("abc"))
            .with_prefix_response("git checkout", CommandOutput::ok(""));
        let branches = manager(runner);

        assert!(branches.create_feature_branch("7", "Login").await.success);
        assert_eq!(
            branches.runner().calls().last().unwrap(),
            "git checkout feature/cycle-7-login"
        );
    }

    #[tokio::test]
    async fn test_runner_error_becomes_failed_result() {
        let branches = manager(MockCommandRunner::new());
        let result = branches.create_feature_branch("7", "Login").await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("No mock response"));
        assert!(branches.branch_state("7").is_none());
    }

    #[tokio::test]
    async fn test_commit_changes_stages_then_commits() {
        let runner = MockCommandRunner::new()
            .with_response("git add -A", CommandOutput::ok(""))
            .with_prefix_response("git commit -m", CommandOutput::ok("[main abc] msg"))
            .with_response("git rev-parse HEAD", CommandOutput::ok("abc123\n"));
        let branches = manager(runner);

        let result = branches.commit_changes("add failing tests", Phase::Red).await;
        assert!(result.success);
        assert_eq!(result.output, "abc123");
        assert_eq!(
            branches.runner().calls(),
            vec![
                "git add -A",
                "git commit -m feat(tests): add failing tests",
                "git rev-parse HEAD"
            ]
        );
    }

    #[tokio::test]
    async fn test_merge_request_without_state() {
        let branches = manager(MockCommandRunner::new());
        let result = branches.create_merge_request("missing", "t", "b").await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Branch state not found"));
    }

    #[tokio::test]
    async fn test_merge_request_returns_last_output_line() {
        let runner = MockCommandRunner::new()
            .with_prefix_response("git rev-parse --verify", CommandOutput::failed(""))
            .with_prefix_response("git checkout -b", CommandOutput::ok(""))
            .with_prefix_response("git push", CommandOutput::ok(""))
            .with_prefix_response(
                "gh pr create",
                CommandOutput::ok("Creating pull request...\nhttps://example.com/pr/1\n"),
            );
        let branches = manager(runner);
        branches.create_feature_branch("9", "Search").await;

        let result = branches.create_merge_request("9", "Search", "body").await;
        assert!(result.success);
        assert_eq!(result.output, "https://example.com/pr/1");
        assert!(branches
            .runner()
            .calls()
            .contains(&"git push -u origin feature/cycle-9-search".to_string()));
    }

    #[tokio::test]
    async fn test_merge_request_for_adopted_branch() {
        let runner = MockCommandRunner::new()
            .with_prefix_response("git push", CommandOutput::ok(""))
            .with_prefix_response("gh pr create", CommandOutput::ok("https://example.com/pr/2"));
        let branches = manager(runner);

        assert!(branches.adopt_branch("11", "feature/cycle-11-export"));
        assert!(!branches.adopt_branch("11", "feature/cycle-11-other"));
        assert_eq!(
            branches.branch_state("11").unwrap().feature_branch,
            "feature/cycle-11-export"
        );

        let result = branches.create_merge_request("11", "Export", "body").await;
        assert!(result.success);
        assert_eq!(result.output, "https://example.com/pr/2");
        assert!(branches
            .runner()
            .calls()
            .contains(&"git push -u origin feature/cycle-11-export".to_string()));
    }

    #[tokio::test]
    async fn test_switch_to_locked_branch_fails() {
        let runner = MockCommandRunner::new().with_prefix_response("git checkout", CommandOutput::ok(""));
        let branches = manager(runner);

        assert!(branches.acquire_lock("c1", "feature/shared", "agent-a"));
        let blocked = branches.switch_to_branch("c2", "feature/shared").await;
        assert!(!blocked.success);
        assert!(blocked.error.unwrap().contains("Branch is locked"));

        assert!(branches.switch_to_branch("c1", "feature/shared").await.success);

        branches.release_lock("feature/shared");
        assert!(branches.switch_to_branch("c2", "feature/shared").await.success);
    }

    #[tokio::test]
    async fn test_checkpoint_recorded_on_state() {
        let runner = MockCommandRunner::new()
            .with_prefix_response("git rev-parse --verify", CommandOutput::failed(""))
            .with_prefix_response("git checkout -b", CommandOutput::ok(""))
            .with_response(
                "git branch -f checkpoint/red-phase-start HEAD",
                CommandOutput::ok(""),
            );
        let branches = manager(runner);
        branches.create_feature_branch("3", "Cart").await;

        let result = branches.create_checkpoint_branch("3", "red").await;
        assert!(result.success);
        assert_eq!(result.output, "checkpoint/red-phase-start");
        assert_eq!(
            branches.branch_state("3").unwrap().checkpoints,
            vec!["checkpoint/red-phase-start"]
        );
    }
}
