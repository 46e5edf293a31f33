//! # codehive-orchestrator
//!
//! Orchestration engine for Codehive.
//!
//! This crate provides:
//! - The TDD cycle engine and its pure phase state machine
//! - Workspace snapshots, restore, change analysis and conflict detection
//! - A bounded-concurrency instruction queue
//! - Instruction executors, including one backed by an external assistant CLI
//! - The AI generator trait the engine delegates code generation to

mod engine;
mod executor;
mod generator;
mod queue;
mod state_machine;
mod workspace;

pub use engine::{PhaseOutcome, TddCycleEngine, ENGINE_HOLDER};
pub use executor::{
    build_prompt, parse_outcome, ExecutionOutcome, InstructionExecutor, ProcessExecutor,
};
pub use generator::{
    template_test, AiGenerator, Generated, GeneratedCode, GeneratedTest, ManualGenerator,
    ProjectContext,
};
pub use queue::{
    CancelOutcome, ExecutionQueue, ExecutionReport, QueueStatus, TaskExecutionReport,
    CANCELLED_ERROR,
};
pub use state_machine::{transition, CycleAction, CycleEvent, CycleState};
pub use workspace::{
    diff_files, hash_bytes, ChangeType, FileChange, FileRecord, WorkspaceManager,
    WorkspaceSnapshot,
};
