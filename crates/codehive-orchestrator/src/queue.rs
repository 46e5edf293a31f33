//! Bounded-concurrency instruction queue
//!
//! Instructions wait for a semaphore permit in arrival order and then run
//! through the configured [`InstructionExecutor`]. Every status change goes
//! through the [`HierarchyStore`]; the queue itself only tracks which ids are
//! waiting or running so they can be cancelled.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, info, instrument, warn};

use codehive_core::fail_open::fail_open;
use codehive_core::{
    CodehiveError, HierarchyLevel, Instruction, Result, Status, UpdateInstruction, UpdateTask,
};
use codehive_store::HierarchyStore;

use crate::executor::{ExecutionOutcome, InstructionExecutor};

pub const CANCELLED_ERROR: &str = "Execution cancelled";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub queue_length: usize,
    pub running_count: usize,
    pub max_concurrent: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// Removed before it started; marked CANCELLED
    Dequeued,
    /// Asked the executor to stop; marked FAILED
    Stopped,
    NotQueued,
}

/// Final state of one queued instruction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub instruction_id: String,
    pub status: Status,
    pub output: Option<String>,
    pub error: Option<String>,
    pub token_usage: u64,
    pub execution_time_ms: u64,
}

impl ExecutionReport {
    fn cancelled(instruction_id: String, status: Status, execution_time_ms: u64) -> Self {
        Self {
            instruction_id,
            status,
            output: None,
            error: Some(CANCELLED_ERROR.to_string()),
            token_usage: 0,
            execution_time_ms,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == Status::Completed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskExecutionReport {
    pub task_id: String,
    pub status: Status,
    pub instructions: Vec<ExecutionReport>,
    /// Instructions already COMPLETED before this run
    pub skipped: usize,
}

struct QueueEntry {
    cancel: oneshot::Sender<()>,
    running: bool,
    /// Distinguishes this entry from a later one queued under the same id
    ticket: u64,
}

/// Drops the queue entry when `queue_instruction` returns or is abandoned
struct EntryGuard<'a> {
    queue: &'a ExecutionQueue,
    id: String,
    ticket: u64,
}

impl EntryGuard<'_> {
    /// Remove the entry now; false when a cancel already took it
    fn release(&self) -> bool {
        self.queue.remove_entry(&self.id, self.ticket)
    }
}

impl Drop for EntryGuard<'_> {
    fn drop(&mut self) {
        self.queue.remove_entry(&self.id, self.ticket);
    }
}

pub struct ExecutionQueue {
    hierarchy: Arc<HierarchyStore>,
    executor: Arc<dyn InstructionExecutor>,
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    entries: Mutex<HashMap<String, QueueEntry>>,
    next_ticket: AtomicU64,
}

impl ExecutionQueue {
    pub fn new(
        hierarchy: Arc<HierarchyStore>,
        executor: Arc<dyn InstructionExecutor>,
        max_concurrent: usize,
    ) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            hierarchy,
            executor,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            entries: Mutex::new(HashMap::new()),
            next_ticket: AtomicU64::new(0),
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, QueueEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn remove_entry(&self, id: &str, ticket: u64) -> bool {
        let mut entries = self.entries();
        if entries.get(id).map(|e| e.ticket) == Some(ticket) {
            entries.remove(id);
            true
        } else {
            false
        }
    }

    pub fn get_queue_status(&self) -> QueueStatus {
        let entries = self.entries();
        let running_count = entries.values().filter(|e| e.running).count();
        QueueStatus {
            queue_length: entries.len() - running_count,
            running_count,
            max_concurrent: self.max_concurrent,
        }
    }

    /// Run `instruction`, waiting for a free slot first; resolves once it finished
    #[instrument(skip(self, instruction), fields(instruction_id = %instruction.id))]
    pub async fn queue_instruction(&self, instruction: Instruction) -> Result<ExecutionReport> {
        let id = instruction.id.clone();
        let (tx, mut cancel) = oneshot::channel();
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        {
            let mut entries = self.entries();
            if entries.contains_key(&id) {
                return Err(CodehiveError::Validation(format!(
                    "Instruction {} is already queued",
                    id
                )));
            }
            entries.insert(
                id.clone(),
                QueueEntry {
                    cancel: tx,
                    running: false,
                    ticket,
                },
            );
        }
        let guard = EntryGuard {
            queue: self,
            id: id.clone(),
            ticket,
        };
        debug!("Queued instruction");

        let permit = tokio::select! {
            permit = self.semaphore.clone().acquire_owned() => permit
                .map_err(|_| CodehiveError::Other("Execution queue closed".to_string()))?,
            _ = &mut cancel => {
                return Ok(ExecutionReport::cancelled(id, Status::Cancelled, 0));
            }
        };

        // Cancelled between the permit being granted and now
        match self.entries().get_mut(&id) {
            Some(entry) if entry.ticket == ticket => entry.running = true,
            _ => return Ok(ExecutionReport::cancelled(id, Status::Cancelled, 0)),
        }

        self.hierarchy
            .update_instruction(
                &id,
                UpdateInstruction {
                    status: Some(Status::InProgress),
                    executed_by: Some(self.executor.name().to_string()),
                    ..Default::default()
                },
            )
            .await?;

        let clock = Instant::now();
        let result = self.executor.execute(&instruction, cancel).await;
        let execution_time_ms = clock.elapsed().as_millis() as u64;
        drop(permit);

        if !guard.release() {
            info!("Instruction was cancelled while running");
            return Ok(ExecutionReport::cancelled(
                id,
                Status::Failed,
                execution_time_ms,
            ));
        }

        let outcome = result.unwrap_or_else(|e| ExecutionOutcome::failed(e.to_string()));
        self.record_outcome(&id, outcome, execution_time_ms).await
    }

    async fn record_outcome(
        &self,
        id: &str,
        outcome: ExecutionOutcome,
        execution_time_ms: u64,
    ) -> Result<ExecutionReport> {
        let status = if outcome.success {
            Status::Completed
        } else {
            Status::Failed
        };
        let output = (!outcome.output.is_empty()).then(|| outcome.output.clone());
        self.hierarchy
            .update_instruction(
                id,
                UpdateInstruction {
                    status: Some(status),
                    output: output.clone(),
                    error: outcome.error.clone(),
                    execution_time_ms: Some(execution_time_ms),
                    ..Default::default()
                },
            )
            .await?;

        // The outcome is already stored; a lost token count only skews the rollup
        if outcome.token_usage > 0 {
            fail_open("instruction token usage", || {
                self.hierarchy.record_token_usage(
                    HierarchyLevel::Instruction,
                    id,
                    outcome.token_usage,
                )
            })
            .await;
        }

        if outcome.success {
            info!(tokens = outcome.token_usage, execution_time_ms, "Instruction completed");
        } else {
            warn!("Instruction failed: {:?}", outcome.error);
        }

        Ok(ExecutionReport {
            instruction_id: id.to_string(),
            status,
            output,
            error: outcome.error,
            token_usage: outcome.token_usage,
            execution_time_ms,
        })
    }

    /// Cancel a waiting or running instruction
    ///
    /// A running instruction is marked FAILED immediately; its process is
    /// signalled but not waited for.
    #[instrument(skip(self))]
    pub async fn cancel_instruction(&self, id: &str) -> Result<CancelOutcome> {
        let Some(entry) = self.entries().remove(id) else {
            return Ok(CancelOutcome::NotQueued);
        };
        let _ = entry.cancel.send(());

        if entry.running {
            self.hierarchy
                .update_instruction(
                    id,
                    UpdateInstruction {
                        status: Some(Status::Failed),
                        error: Some(CANCELLED_ERROR.to_string()),
                        ..Default::default()
                    },
                )
                .await?;
            info!("Stopped running instruction");
            Ok(CancelOutcome::Stopped)
        } else {
            self.hierarchy
                .update_instruction(id, UpdateInstruction::status(Status::Cancelled))
                .await?;
            info!("Removed queued instruction");
            Ok(CancelOutcome::Dequeued)
        }
    }

    /// Run a task's instructions in sequence order, stopping at the first failure
    ///
    /// Already COMPLETED instructions are skipped, so a failed task can be rerun.
    #[instrument(skip(self))]
    pub async fn execute_task(&self, task_id: &str) -> Result<TaskExecutionReport> {
        self.hierarchy
            .update_task(
                task_id,
                UpdateTask {
                    status: Some(Status::InProgress),
                    ..Default::default()
                },
            )
            .await?;

        let mut reports = Vec::new();
        let mut skipped = 0;
        let mut failed = false;
        for instruction in self.hierarchy.list_instructions(task_id).await? {
            if instruction.status == Status::Completed {
                skipped += 1;
                continue;
            }
            let report = self.queue_instruction(instruction).await?;
            let completed = report.is_completed();
            reports.push(report);
            if !completed {
                failed = true;
                break;
            }
        }

        let status = if failed {
            Status::Failed
        } else {
            Status::Completed
        };
        self.hierarchy
            .update_task(
                task_id,
                UpdateTask {
                    status: Some(status),
                    ..Default::default()
                },
            )
            .await?;
        info!(
            "Task {} {} after {} instructions",
            task_id,
            status,
            reports.len()
        );

        Ok(TaskExecutionReport {
            task_id: task_id.to_string(),
            status,
            instructions: reports,
            skipped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use codehive_core::{CreateEpic, CreateInstruction, CreateStory, CreateTask, EventBus};
    use codehive_store::{Filter, MemoryStore, RecordStore};
    use serde_json::Value;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Succeeds after a short delay and tracks peak concurrency
    struct CountingExecutor {
        running: AtomicUsize,
        peak: AtomicUsize,
        fail_directive: Option<String>,
    }

    impl CountingExecutor {
        fn new() -> Self {
            Self {
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                fail_directive: None,
            }
        }
    }

    #[async_trait]
    impl InstructionExecutor for CountingExecutor {
        fn name(&self) -> &str {
            "counting"
        }

        async fn execute(
            &self,
            instruction: &Instruction,
            _cancel: oneshot::Receiver<()>,
        ) -> Result<ExecutionOutcome> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);

            if self.fail_directive.as_deref() == Some(instruction.directive.as_str()) {
                return Ok(ExecutionOutcome::failed("assertion failed"));
            }
            Ok(ExecutionOutcome::succeeded(
                format!("done: {}", instruction.directive),
                10,
            ))
        }
    }

    /// Runs until cancelled
    struct BlockingExecutor;

    #[async_trait]
    impl InstructionExecutor for BlockingExecutor {
        fn name(&self) -> &str {
            "blocking"
        }

        async fn execute(
            &self,
            instruction: &Instruction,
            cancel: oneshot::Receiver<()>,
        ) -> Result<ExecutionOutcome> {
            let _ = cancel.await;
            Err(CodehiveError::Cancelled(instruction.id.clone()))
        }
    }

    /// Memory store whose counters are unavailable
    struct NoIncrementStore(MemoryStore);

    #[async_trait]
    impl RecordStore for NoIncrementStore {
        async fn put(&self, table: &str, id: &str, doc: Value) -> Result<()> {
            self.0.put(table, id, doc).await
        }

        async fn get(&self, table: &str, id: &str) -> Result<Option<Value>> {
            self.0.get(table, id).await
        }

        async fn delete(&self, table: &str, id: &str) -> Result<bool> {
            self.0.delete(table, id).await
        }

        async fn scan(&self, table: &str, filter: &Filter) -> Result<Vec<Value>> {
            self.0.scan(table, filter).await
        }

        async fn update(&self, table: &str, id: &str, patch: Value) -> Result<Value> {
            self.0.update(table, id, patch).await
        }

        async fn increment(
            &self,
            table: &str,
            _id: &str,
            _field: &str,
            _delta: i64,
        ) -> Result<i64> {
            Err(CodehiveError::Store(format!("{} is read-only", table)))
        }

        async fn set_if_null(
            &self,
            table: &str,
            id: &str,
            field: &str,
            value: Value,
        ) -> Result<bool> {
            self.0.set_if_null(table, id, field, value).await
        }
    }

    async fn task_with(
        hierarchy: &HierarchyStore,
        directives: &[&str],
    ) -> (String, String, Vec<Instruction>) {
        let epic = hierarchy
            .create_epic(CreateEpic::new("p1", "Epic"))
            .await
            .unwrap();
        let story = hierarchy
            .create_story(CreateStory::new(&epic.id, "Story"))
            .await
            .unwrap();
        let task = hierarchy
            .create_task(CreateTask::new(&story.id, "Task"))
            .await
            .unwrap();
        let mut instructions = Vec::new();
        for directive in directives {
            instructions.push(
                hierarchy
                    .create_instruction(CreateInstruction::new(&task.id, *directive, "ok"))
                    .await
                    .unwrap(),
            );
        }
        (epic.id, task.id, instructions)
    }

    fn hierarchy() -> Arc<HierarchyStore> {
        Arc::new(HierarchyStore::new(
            Arc::new(MemoryStore::new()),
            EventBus::new(),
        ))
    }

    async fn wait_for(queue: &ExecutionQueue, running: usize, waiting: usize) {
        for _ in 0..200 {
            let status = queue.get_queue_status();
            if status.running_count == running && status.queue_length == waiting {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("queue never reached {} running / {} waiting", running, waiting);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let hierarchy = hierarchy();
        let (epic_id, _task_id, instructions) =
            task_with(&hierarchy, &["a", "b", "c", "d", "e"]).await;
        let executor = Arc::new(CountingExecutor::new());
        let queue = Arc::new(ExecutionQueue::new(hierarchy.clone(), executor.clone(), 2));

        let handles: Vec<_> = instructions
            .into_iter()
            .map(|instruction| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.queue_instruction(instruction).await })
            })
            .collect();
        for handle in handles {
            let report = handle.await.unwrap().unwrap();
            assert_eq!(report.status, Status::Completed);
        }

        assert!(executor.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(queue.get_queue_status().running_count, 0);
        assert_eq!(hierarchy.get_epic(&epic_id).await.unwrap().token_usage, 50);
    }

    #[tokio::test]
    async fn test_results_are_persisted() {
        let hierarchy = hierarchy();
        let (_epic, _task, instructions) = task_with(&hierarchy, &["write parser"]).await;
        let queue = ExecutionQueue::new(hierarchy.clone(), Arc::new(CountingExecutor::new()), 3);

        let id = instructions[0].id.clone();
        queue
            .queue_instruction(instructions[0].clone())
            .await
            .unwrap();

        let stored = hierarchy.get_instruction(&id).await.unwrap();
        assert_eq!(stored.status, Status::Completed);
        assert_eq!(stored.output.as_deref(), Some("done: write parser"));
        assert_eq!(stored.executed_by.as_deref(), Some("counting"));
        assert_eq!(stored.token_usage, 10);
        assert!(stored.execution_time_ms.is_some());
        assert!(stored.started_at.is_some());
        assert!(stored.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_cancel_queued_and_running() {
        let hierarchy = hierarchy();
        let (_epic, _task, instructions) = task_with(&hierarchy, &["first", "second"]).await;
        let queue = Arc::new(ExecutionQueue::new(
            hierarchy.clone(),
            Arc::new(BlockingExecutor),
            1,
        ));
        let first = instructions[0].id.clone();
        let second = instructions[1].id.clone();

        let running = {
            let queue = queue.clone();
            let instruction = instructions[0].clone();
            tokio::spawn(async move { queue.queue_instruction(instruction).await })
        };
        wait_for(&queue, 1, 0).await;
        let waiting = {
            let queue = queue.clone();
            let instruction = instructions[1].clone();
            tokio::spawn(async move { queue.queue_instruction(instruction).await })
        };
        wait_for(&queue, 1, 1).await;

        assert_eq!(
            queue.cancel_instruction(&second).await.unwrap(),
            CancelOutcome::Dequeued
        );
        let report = waiting.await.unwrap().unwrap();
        assert_eq!(report.status, Status::Cancelled);
        assert_eq!(
            hierarchy.get_instruction(&second).await.unwrap().status,
            Status::Cancelled
        );

        assert_eq!(
            queue.cancel_instruction(&first).await.unwrap(),
            CancelOutcome::Stopped
        );
        running.await.unwrap().unwrap();
        let stored = hierarchy.get_instruction(&first).await.unwrap();
        assert_eq!(stored.status, Status::Failed);
        assert_eq!(stored.error.as_deref(), Some(CANCELLED_ERROR));

        assert_eq!(
            queue.cancel_instruction(&first).await.unwrap(),
            CancelOutcome::NotQueued
        );
    }

    #[tokio::test]
    async fn test_execute_task_stops_at_failure_and_resumes() {
        let hierarchy = hierarchy();
        let (_epic, task_id, instructions) =
            task_with(&hierarchy, &["one", "two", "three"]).await;

        let mut failing = CountingExecutor::new();
        failing.fail_directive = Some("two".to_string());
        let queue = ExecutionQueue::new(hierarchy.clone(), Arc::new(failing), 3);

        let report = queue.execute_task(&task_id).await.unwrap();
        assert_eq!(report.status, Status::Failed);
        assert_eq!(report.instructions.len(), 2);
        assert_eq!(
            hierarchy.get_instruction(&instructions[2].id).await.unwrap().status,
            Status::Pending
        );
        assert_eq!(
            hierarchy.get_task(&task_id).await.unwrap().status,
            Status::Failed
        );

        let queue = ExecutionQueue::new(hierarchy.clone(), Arc::new(CountingExecutor::new()), 3);
        let report = queue.execute_task(&task_id).await.unwrap();
        assert_eq!(report.status, Status::Completed);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.instructions.len(), 2);
        assert!(hierarchy
            .get_task(&task_id)
            .await
            .unwrap()
            .completed_at
            .is_some());
    }

    #[tokio::test]
    async fn test_abandoned_wait_leaves_no_entry() {
        let hierarchy = hierarchy();
        let (_epic, _task, instructions) = task_with(&hierarchy, &["first", "second"]).await;
        let queue = Arc::new(ExecutionQueue::new(
            hierarchy.clone(),
            Arc::new(BlockingExecutor),
            1,
        ));

        let running = {
            let queue = queue.clone();
            let instruction = instructions[0].clone();
            tokio::spawn(async move { queue.queue_instruction(instruction).await })
        };
        wait_for(&queue, 1, 0).await;

        let waited = tokio::time::timeout(
            Duration::from_millis(50),
            queue.queue_instruction(instructions[1].clone()),
        )
        .await;
        assert!(waited.is_err());
        assert_eq!(queue.get_queue_status().queue_length, 0);
        assert_eq!(
            queue.cancel_instruction(&instructions[1].id).await.unwrap(),
            CancelOutcome::NotQueued
        );

        // The same id can be queued again once the first wait is gone
        let requeued = {
            let queue = queue.clone();
            let instruction = instructions[1].clone();
            tokio::spawn(async move { queue.queue_instruction(instruction).await })
        };
        wait_for(&queue, 1, 1).await;
        assert_eq!(
            queue.cancel_instruction(&instructions[1].id).await.unwrap(),
            CancelOutcome::Dequeued
        );
        assert_eq!(requeued.await.unwrap().unwrap().status, Status::Cancelled);

        queue.cancel_instruction(&instructions[0].id).await.unwrap();
        running.await.unwrap().unwrap();
        assert_eq!(queue.get_queue_status().running_count, 0);
    }

    #[tokio::test]
    async fn test_outcome_persists_when_token_count_fails() {
        let hierarchy = Arc::new(HierarchyStore::new(
            Arc::new(NoIncrementStore(MemoryStore::new())),
            EventBus::new(),
        ));
        let (_epic, _task, instructions) = task_with(&hierarchy, &["write lexer"]).await;
        let queue = ExecutionQueue::new(hierarchy.clone(), Arc::new(CountingExecutor::new()), 1);

        let report = queue
            .queue_instruction(instructions[0].clone())
            .await
            .unwrap();
        assert_eq!(report.status, Status::Completed);

        let stored = hierarchy.get_instruction(&instructions[0].id).await.unwrap();
        assert_eq!(stored.status, Status::Completed);
        assert_eq!(stored.output.as_deref(), Some("done: write lexer"));
        assert!(stored.execution_time_ms.is_some());
        assert_eq!(stored.token_usage, 0);
    }
}
