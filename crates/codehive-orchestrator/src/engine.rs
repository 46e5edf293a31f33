//! TDD cycle engine
//!
//! Drives one feature through RED -> GREEN -> REFACTOR -> REVIEW on its own
//! branch. Each `execute_phase` call runs the current phase, feeds the result
//! to [`transition`] and carries out the returned actions. The cycle record is
//! only saved once every action succeeded, so a failed commit leaves the
//! cycle in the phase it started in.

use chrono::Utc;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use codehive_core::config::TimeoutConfig;
use codehive_core::fail_open::fail_open;
use codehive_core::{
    Artifact, ArtifactKind, CodehiveError, Cycle, CycleStatus, DecisionPoint, Event, EventBus,
    FeatureRequest, Phase, Query, QueryStatus, QueryUrgency, Result, TestCase, TestStatus,
};
use codehive_git::{BranchManager, CommandRunner};
use codehive_store::{CycleDetails, CycleStore};

use crate::generator::{template_test, AiGenerator, ProjectContext};
use crate::state_machine::{transition, CycleAction, CycleEvent, CycleState};
use crate::workspace::WorkspaceManager;

/// Lock holder name used for branches owned by the engine
pub const ENGINE_HOLDER: &str = "tdd-engine";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PhaseOutcome {
    /// Pending blocking queries; the cycle did not advance
    Blocked { queries: Vec<Query> },
    /// The phase finished; `next_phase` is `None` once the cycle is complete
    Completed {
        phase: Phase,
        next_phase: Option<Phase>,
        merge_request_url: Option<String>,
    },
    /// REVIEW found failing tests and rolled back
    Failed {
        next_phase: Phase,
        failing_tests: Vec<String>,
    },
}

pub struct TddCycleEngine<R: CommandRunner> {
    cycles: CycleStore,
    branches: Arc<BranchManager<R>>,
    workspace: Arc<WorkspaceManager>,
    generator: Arc<dyn AiGenerator>,
    events: EventBus,
    ai_timeout: Duration,
}

impl<R: CommandRunner> TddCycleEngine<R> {
    pub fn new(
        cycles: CycleStore,
        branches: Arc<BranchManager<R>>,
        workspace: Arc<WorkspaceManager>,
        generator: Arc<dyn AiGenerator>,
        events: EventBus,
    ) -> Self {
        Self {
            cycles,
            branches,
            workspace,
            generator,
            events,
            ai_timeout: TimeoutConfig::default().ai(),
        }
    }

    pub fn with_ai_timeout(mut self, timeout: Duration) -> Self {
        self.ai_timeout = timeout;
        self
    }

    pub fn branches(&self) -> &BranchManager<R> {
        &self.branches
    }

    // ---------------------------------------------------------------------
    // Cycle lifecycle
    // ---------------------------------------------------------------------

    /// Create the cycle, its feature branch and the branch lock
    ///
    /// Nothing is kept if any step fails. The branch itself is left in place
    /// since it may already have existed.
    #[instrument(skip(self, request), fields(title = %request.title))]
    pub async fn start_cycle(&self, request: FeatureRequest) -> Result<Cycle> {
        if request.title.trim().is_empty() {
            return Err(CodehiveError::Validation(
                "Feature title is required".to_string(),
            ));
        }

        let mut cycle = Cycle::from_request(request);
        self.cycles.save_cycle(&cycle).await?;

        let branch = self
            .branches
            .create_feature_branch(&cycle.id, &cycle.title)
            .await;
        if !branch.success {
            let error = branch.error.unwrap_or_else(|| "unknown error".to_string());
            warn!("Feature branch failed for cycle {}, removing it: {}", cycle.id, error);
            self.cycles.delete_cycle(&cycle.id).await?;
            return Err(CodehiveError::GitCommand(error));
        }

        if !self
            .branches
            .acquire_lock(&cycle.id, &branch.output, ENGINE_HOLDER)
        {
            let holder_cycle = self
                .branches
                .lock_holder(&branch.output)
                .map(|lock| lock.cycle_id)
                .unwrap_or_default();
            warn!("Branch {} is locked by cycle {}", branch.output, holder_cycle);
            self.abandon_start(&cycle.id).await;
            return Err(CodehiveError::LockConflict {
                branch: branch.output,
                holder_cycle,
            });
        }

        cycle.branch_name = Some(branch.output.clone());
        if let Err(e) = self.save(&mut cycle).await {
            self.abandon_start(&cycle.id).await;
            return Err(e);
        }

        info!(cycle_id = %cycle.id, branch = %branch.output, "Started cycle");
        self.events.publish(Event::CycleStarted(cycle.clone()));
        Ok(cycle)
    }

    /// Undo a half-finished `start_cycle`
    async fn abandon_start(&self, cycle_id: &str) {
        self.branches.forget_cycle(cycle_id);
        fail_open("abandoned cycle removal", || self.cycles.delete_cycle(cycle_id)).await;
    }

    pub async fn get_cycle(&self, cycle_id: &str) -> Result<Cycle> {
        self.cycles.get_cycle(cycle_id).await
    }

    pub async fn list_cycles(&self, project_id: Option<&str>) -> Result<Vec<Cycle>> {
        self.cycles.list_cycles(project_id).await
    }

    pub async fn get_cycle_details(&self, cycle_id: &str) -> Result<CycleDetails> {
        self.cycles.details(cycle_id).await
    }

    /// Run the cycle's current phase
    #[instrument(skip(self))]
    pub async fn execute_phase(&self, cycle_id: &str) -> Result<PhaseOutcome> {
        let mut cycle = self.cycles.get_cycle(cycle_id).await?;
        ensure_open(&cycle)?;

        let blocking = self.cycles.blocking_queries(cycle_id).await?;
        if !blocking.is_empty() {
            if cycle.status == CycleStatus::Active {
                self.block(&mut cycle, &blocking).await?;
            }
            info!("Cycle {} blocked on {} queries", cycle_id, blocking.len());
            return Ok(PhaseOutcome::Blocked { queries: blocking });
        }
        if cycle.status == CycleStatus::Paused {
            return Err(CodehiveError::Cycle(format!(
                "Cycle {} is paused; resume it first",
                cycle_id
            )));
        }
        self.ensure_branch_lock(&cycle)?;

        let phase = cycle.phase;
        info!("Executing {} for cycle {}", phase, cycle_id);
        match phase {
            Phase::Red => self.run_red(&mut cycle).await,
            Phase::Green => self.run_green(&mut cycle).await,
            Phase::Refactor => self.run_refactor(&mut cycle).await,
            Phase::Review => self.run_review(&mut cycle).await,
        }
    }

    #[instrument(skip(self))]
    pub async fn pause_cycle(&self, cycle_id: &str) -> Result<Cycle> {
        let mut cycle = self.cycles.get_cycle(cycle_id).await?;
        if cycle.status != CycleStatus::Active {
            return Err(CodehiveError::Cycle(format!(
                "Cycle {} is {} and cannot be paused",
                cycle_id, cycle.status
            )));
        }
        self.block(&mut cycle, &[]).await?;
        Ok(cycle)
    }

    /// Resume a paused cycle once no blocking query is pending
    #[instrument(skip(self))]
    pub async fn resume_cycle(&self, cycle_id: &str) -> Result<Cycle> {
        let mut cycle = self.cycles.get_cycle(cycle_id).await?;
        if cycle.status != CycleStatus::Paused {
            return Err(CodehiveError::Cycle(format!(
                "Cycle {} is {} and cannot be resumed",
                cycle_id, cycle.status
            )));
        }
        let pending = self.cycles.blocking_queries(cycle_id).await?;
        if !pending.is_empty() {
            return Err(CodehiveError::Cycle(format!(
                "Cycle {} has {} pending blocking queries",
                cycle_id,
                pending.len()
            )));
        }
        self.resume(&mut cycle).await?;
        Ok(cycle)
    }

    #[instrument(skip(self))]
    pub async fn fail_cycle(&self, cycle_id: &str, reason: &str) -> Result<Cycle> {
        let mut cycle = self.cycles.get_cycle(cycle_id).await?;
        ensure_open(&cycle)?;

        let (state, actions) = self.advance(
            &cycle,
            CycleEvent::Error {
                message: reason.to_string(),
            },
        )?;
        self.run_actions(&cycle, actions).await?;
        state.apply_to(&mut cycle);
        self.save(&mut cycle).await?;
        self.branches.forget_cycle(cycle_id);

        self.events.publish(Event::CycleFailed {
            cycle_id: cycle_id.to_string(),
            reason: reason.to_string(),
        });
        Ok(cycle)
    }

    /// Record a test run result reported by an external runner
    pub async fn record_test_result(&self, test_id: &str, status: TestStatus) -> Result<TestCase> {
        let mut test = self.cycles.get_test(test_id).await?;
        test.status = status;
        test.updated_at = Utc::now();
        self.cycles.save_test(&test).await?;
        debug!("Test {} is now {:?}", test.name, status);
        Ok(test)
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    /// Ask a human; a blocking query pauses an active cycle
    #[instrument(skip(self, question, context))]
    pub async fn raise_query(
        &self,
        cycle_id: &str,
        question: &str,
        context: Option<String>,
        urgency: QueryUrgency,
    ) -> Result<Query> {
        let mut cycle = self.cycles.get_cycle(cycle_id).await?;
        ensure_open(&cycle)?;

        let mut query = Query::new(cycle_id, cycle.phase, question, urgency);
        query.context = context;
        self.cycles.save_query(&query).await?;
        self.events.publish(Event::QueryRaised(query.clone()));

        if query.is_blocking() && cycle.status == CycleStatus::Active {
            self.block(&mut cycle, std::slice::from_ref(&query)).await?;
        }
        Ok(query)
    }

    #[instrument(skip(self, answer))]
    pub async fn answer_query(&self, query_id: &str, answer: &str) -> Result<Query> {
        let mut query = self.pending_query(query_id).await?;
        query.status = QueryStatus::Answered;
        query.answer = Some(answer.to_string());
        query.answered_at = Some(Utc::now());
        self.cycles.save_query(&query).await?;

        info!("Query {} answered", query_id);
        self.events.publish(Event::QueryAnswered(query.clone()));
        self.resume_if_unblocked(&query.cycle_id).await?;
        Ok(query)
    }

    #[instrument(skip(self))]
    pub async fn dismiss_query(&self, query_id: &str) -> Result<Query> {
        let mut query = self.pending_query(query_id).await?;
        query.status = QueryStatus::Dismissed;
        query.answered_at = Some(Utc::now());
        self.cycles.save_query(&query).await?;

        info!("Query {} dismissed", query_id);
        self.resume_if_unblocked(&query.cycle_id).await?;
        Ok(query)
    }

    async fn pending_query(&self, query_id: &str) -> Result<Query> {
        let query = self.cycles.get_query(query_id).await?;
        if query.status != QueryStatus::Pending {
            return Err(CodehiveError::Validation(format!(
                "Query {} is no longer pending",
                query_id
            )));
        }
        Ok(query)
    }

    async fn resume_if_unblocked(&self, cycle_id: &str) -> Result<()> {
        let Some(mut cycle) = self.cycles.find_cycle(cycle_id).await? else {
            return Ok(());
        };
        if cycle.status == CycleStatus::Paused
            && self.cycles.blocking_queries(cycle_id).await?.is_empty()
        {
            self.resume(&mut cycle).await?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Phases
    // ---------------------------------------------------------------------

    async fn run_red(&self, cycle: &mut Cycle) -> Result<PhaseOutcome> {
        let context = project_context(cycle);
        let criteria = if cycle.acceptance_criteria.is_empty() {
            vec![cycle.title.clone()]
        } else {
            cycle.acceptance_criteria.clone()
        };

        // Criteria covered by an earlier, interrupted run keep their tests
        let existing = self.cycles.list_tests(&cycle.id).await?;
        let mut tokens = 0;
        for (index, criterion) in criteria.iter().enumerate() {
            if existing.iter().any(|t| &t.criterion == criterion) {
                continue;
            }

            let generated = match self
                .bounded("test generation", self.generator.generate_test(criterion, &context))
                .await
            {
                Ok(generated) => {
                    tokens += generated.token_usage;
                    self.report_decision(cycle, Phase::Red, generated.decision);
                    generated.value
                }
                Err(e) => {
                    warn!("Using template test for '{}': {}", criterion, e);
                    template_test(criterion, index)
                }
            };

            let test = TestCase::failing(
                &cycle.id,
                &generated.name,
                criterion,
                &generated.file_path,
                &generated.code,
            );
            self.cycles.save_test(&test).await?;
            self.persist_artifact(Artifact::new(
                &cycle.id,
                ArtifactKind::Test,
                &generated.file_path,
                &generated.code,
                Phase::Red,
            ))
            .await?;
        }
        debug!(tokens, "RED generation finished");

        let count = self.cycles.list_tests(&cycle.id).await?.len();
        let feature = cycle.title.clone();
        self.complete_phase(cycle, CycleEvent::TestsWritten { feature, count })
            .await
    }

    async fn run_green(&self, cycle: &mut Cycle) -> Result<PhaseOutcome> {
        let context = project_context(cycle);
        let failing: Vec<TestCase> = self
            .cycles
            .list_tests(&cycle.id)
            .await?
            .into_iter()
            .filter(|t| t.status == TestStatus::Failing)
            .collect();

        for mut test in failing {
            let generated = match self
                .bounded(
                    "implementation",
                    self.generator.generate_implementation(&test, &context),
                )
                .await
            {
                Ok(generated) => generated,
                Err(e) => {
                    // No template can stand in for an implementation
                    let query = self
                        .raise_query(
                            &cycle.id,
                            &format!("Could not generate an implementation for test '{}'", test.name),
                            Some(e.to_string()),
                            QueryUrgency::Blocking,
                        )
                        .await?;
                    return Ok(PhaseOutcome::Blocked {
                        queries: vec![query],
                    });
                }
            };
            self.report_decision(cycle, Phase::Green, generated.decision);

            let code = generated.value;
            self.persist_artifact(Artifact::new(
                &cycle.id,
                ArtifactKind::Code,
                &code.file_path,
                &code.content,
                Phase::Green,
            ))
            .await?;

            test.status = TestStatus::Passing;
            test.updated_at = Utc::now();
            self.cycles.save_test(&test).await?;
        }

        let count = self.cycles.list_tests(&cycle.id).await?.len();
        let feature = cycle.title.clone();
        self.complete_phase(cycle, CycleEvent::ImplementationWritten { feature, count })
            .await
    }

    async fn run_refactor(&self, cycle: &mut Cycle) -> Result<PhaseOutcome> {
        let context = project_context(cycle);
        let code: Vec<Artifact> = self
            .cycles
            .list_artifacts(&cycle.id)
            .await?
            .into_iter()
            .filter(|a| a.kind == ArtifactKind::Code)
            .collect();

        let count = code.len();
        for mut artifact in code {
            match self
                .bounded("refactor", self.generator.refactor(&artifact, &context))
                .await
            {
                Ok(generated) => {
                    self.report_decision(cycle, Phase::Refactor, generated.decision);
                    artifact.content = generated.value.content;
                    artifact.phase = Phase::Refactor;
                    self.persist_artifact(artifact).await?;
                }
                Err(e) => warn!("Keeping {} unrefactored: {}", artifact.path, e),
            }
        }

        let feature = cycle.title.clone();
        self.complete_phase(cycle, CycleEvent::Refactored { feature, count })
            .await
    }

    async fn run_review(&self, cycle: &mut Cycle) -> Result<PhaseOutcome> {
        let tests = self.cycles.list_tests(&cycle.id).await?;
        let failing_tests: Vec<String> = tests
            .iter()
            .filter(|t| t.status == TestStatus::Failing)
            .map(|t| t.name.clone())
            .collect();

        if !failing_tests.is_empty() {
            let (state, actions) = self.advance(
                cycle,
                CycleEvent::ReviewFailed {
                    failing_tests: failing_tests.clone(),
                },
            )?;
            self.run_actions(cycle, actions).await?;
            state.apply_to(cycle);
            self.save(cycle).await?;

            warn!(
                "REVIEW of cycle {} found {} failing tests",
                cycle.id,
                failing_tests.len()
            );
            return Ok(PhaseOutcome::Failed {
                next_phase: cycle.phase,
                failing_tests,
            });
        }

        let (state, actions) = self.advance(
            cycle,
            CycleEvent::ReviewPassed {
                feature: cycle.title.clone(),
            },
        )?;
        let merge_request_url = self.run_actions(cycle, actions).await?;
        state.apply_to(cycle);
        cycle.merge_request_url = merge_request_url.clone();
        cycle.completed_at = Some(Utc::now());
        self.save(cycle).await?;
        self.branches.forget_cycle(&cycle.id);

        info!(cycle_id = %cycle.id, "Cycle completed");
        self.events.publish(Event::CycleCompleted {
            cycle_id: cycle.id.clone(),
            merge_request_url: merge_request_url.clone(),
        });
        Ok(PhaseOutcome::Completed {
            phase: Phase::Review,
            next_phase: None,
            merge_request_url,
        })
    }

    /// Apply a successful phase event and report the next phase
    async fn complete_phase(&self, cycle: &mut Cycle, event: CycleEvent) -> Result<PhaseOutcome> {
        let phase = cycle.phase;
        let (state, actions) = self.advance(cycle, event)?;
        self.run_actions(cycle, actions).await?;
        state.apply_to(cycle);
        self.save(cycle).await?;

        self.events.publish(Event::PhaseCompleted {
            cycle_id: cycle.id.clone(),
            phase,
            next_phase: cycle.phase,
        });
        Ok(PhaseOutcome::Completed {
            phase,
            next_phase: Some(cycle.phase),
            merge_request_url: None,
        })
    }

    // ---------------------------------------------------------------------
    // State machine plumbing
    // ---------------------------------------------------------------------

    /// Compute the next state; invalid transitions are errors and change nothing
    fn advance(&self, cycle: &Cycle, event: CycleEvent) -> Result<(CycleState, Vec<CycleAction>)> {
        let failing_on_purpose = matches!(event, CycleEvent::Error { .. });
        let (state, actions) = transition(CycleState::of(cycle), event);
        match &state {
            CycleState::Failed { error } if !failing_on_purpose => {
                Err(CodehiveError::Cycle(error.clone()))
            }
            _ => Ok((state, actions)),
        }
    }

    /// Carry out actions in order; returns the merge request URL if one was opened
    async fn run_actions(&self, cycle: &Cycle, actions: Vec<CycleAction>) -> Result<Option<String>> {
        let branch = cycle.branch_name.clone().unwrap_or_default();
        let mut merge_request_url = None;

        for action in actions {
            match action {
                CycleAction::TakeSnapshot { phase } => {
                    fail_open("phase snapshot", || {
                        self.workspace.create_snapshot(&cycle.id, &branch, phase)
                    })
                    .await;
                }
                CycleAction::Checkpoint { tag } => {
                    fail_open("checkpoint branch", || async {
                        let result = self
                            .branches
                            .create_checkpoint_branch(&cycle.id, &tag)
                            .await;
                        if result.success {
                            Ok(result.output)
                        } else {
                            Err(CodehiveError::GitCommand(
                                result.error.unwrap_or_else(|| tag.clone()),
                            ))
                        }
                    })
                    .await;
                }
                CycleAction::Commit { phase, message } => {
                    let result = self.branches.commit_changes(&message, phase).await;
                    if !result.success {
                        return Err(CodehiveError::GitCommand(
                            result.error.unwrap_or_else(|| "commit failed".to_string()),
                        ));
                    }
                    self.branches.record_commit(&cycle.id, &result.output);
                }
                CycleAction::Rollback { branch } => {
                    let result = self.branches.rollback_to_checkpoint(&branch).await;
                    if !result.success {
                        return Err(CodehiveError::GitCommand(
                            result.error.unwrap_or_else(|| "rollback failed".to_string()),
                        ));
                    }
                }
                CycleAction::OpenMergeRequest => {
                    let body = merge_request_body(cycle);
                    let result = self
                        .branches
                        .create_merge_request(&cycle.id, &cycle.title, &body)
                        .await;
                    if !result.success {
                        return Err(CodehiveError::GitCommand(
                            result
                                .error
                                .unwrap_or_else(|| "merge request failed".to_string()),
                        ));
                    }
                    merge_request_url = Some(result.output);
                }
                CycleAction::Log { message } => info!(cycle_id = %cycle.id, "{}", message),
            }
        }
        Ok(merge_request_url)
    }

    async fn block(&self, cycle: &mut Cycle, queries: &[Query]) -> Result<()> {
        let query_ids: Vec<String> = queries.iter().map(|q| q.id.clone()).collect();
        let (state, actions) = self.advance(
            cycle,
            CycleEvent::Blocked {
                query_ids: query_ids.clone(),
            },
        )?;
        self.run_actions(cycle, actions).await?;
        state.apply_to(cycle);
        self.save(cycle).await?;

        self.events.publish(Event::CycleBlocked {
            cycle_id: cycle.id.clone(),
            query_ids,
        });
        Ok(())
    }

    async fn resume(&self, cycle: &mut Cycle) -> Result<()> {
        let (state, actions) = self.advance(cycle, CycleEvent::Resumed)?;
        self.run_actions(cycle, actions).await?;
        state.apply_to(cycle);
        self.save(cycle).await?;

        self.events.publish(Event::CycleResumed {
            cycle_id: cycle.id.clone(),
        });
        Ok(())
    }

    async fn save(&self, cycle: &mut Cycle) -> Result<()> {
        cycle.updated_at = Utc::now();
        self.cycles.save_cycle(cycle).await
    }

    /// Take the branch lock back if it lapsed; fail if another cycle holds it
    ///
    /// Also restores branch bookkeeping for cycles started by another process.
    fn ensure_branch_lock(&self, cycle: &Cycle) -> Result<()> {
        let Some(branch) = &cycle.branch_name else {
            return Ok(());
        };
        match self.branches.lock_holder(branch) {
            Some(lock) if lock.cycle_id != cycle.id => {
                return Err(CodehiveError::LockConflict {
                    branch: branch.clone(),
                    holder_cycle: lock.cycle_id,
                });
            }
            Some(_) => {}
            None => {
                self.branches.acquire_lock(&cycle.id, branch, ENGINE_HOLDER);
            }
        }
        if self.branches.adopt_branch(&cycle.id, branch) {
            debug!("Restored branch state for cycle {}", cycle.id);
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Helpers
    // ---------------------------------------------------------------------

    async fn persist_artifact(&self, artifact: Artifact) -> Result<()> {
        if let Err(e) = self
            .workspace
            .write_file(&artifact.path, &artifact.content)
            .await
        {
            warn!("Could not write {} to the workspace: {}", artifact.path, e);
        }
        self.cycles.save_artifact(&artifact).await
    }

    /// Bound an AI call by the configured timeout
    async fn bounded<T>(&self, what: &str, call: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.ai_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(CodehiveError::AiGeneration(msg))) => Err(CodehiveError::AiGeneration(msg)),
            Ok(Err(e)) => Err(CodehiveError::AiGeneration(format!("{}: {}", what, e))),
            Err(_) => Err(CodehiveError::AiGeneration(format!(
                "{} timed out after {}s",
                what,
                self.ai_timeout.as_secs()
            ))),
        }
    }

    fn report_decision(&self, cycle: &Cycle, phase: Phase, decision: Option<DecisionPoint>) {
        let Some(decision) = decision else {
            return;
        };
        info!(
            cycle_id = %cycle.id,
            "{} decision: {} (chose {:?})",
            phase,
            decision.summary,
            decision.chosen
        );
        self.events.publish(Event::DecisionPoint {
            cycle_id: cycle.id.clone(),
            phase,
            decision,
        });
    }
}

fn ensure_open(cycle: &Cycle) -> Result<()> {
    match cycle.status {
        CycleStatus::Completed | CycleStatus::Failed => Err(CodehiveError::Cycle(format!(
            "Cycle {} is already {}",
            cycle.id, cycle.status
        ))),
        _ => Ok(()),
    }
}

fn project_context(cycle: &Cycle) -> ProjectContext {
    ProjectContext {
        project_id: cycle.project_id.clone(),
        cycle_id: cycle.id.clone(),
        feature_title: cycle.title.clone(),
        feature_description: cycle.description.clone(),
    }
}

fn merge_request_body(cycle: &Cycle) -> String {
    let mut body = String::new();
    if !cycle.description.is_empty() {
        body.push_str(&cycle.description);
        body.push_str("\n\n");
    }
    if !cycle.acceptance_criteria.is_empty() {
        body.push_str("Acceptance criteria:\n");
        for criterion in &cycle.acceptance_criteria {
            body.push_str(&format!("- {}\n", criterion));
        }
        body.push('\n');
    }
    body.push_str(&format!("Developed test-first in cycle {}.", cycle.id));
    body
}
