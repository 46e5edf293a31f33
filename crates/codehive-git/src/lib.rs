//! # codehive-git
//!
//! Git integration for Codehive cycles: a command-runner abstraction,
//! branch naming, per-branch TTL locks and the [`BranchManager`].

pub mod branch;
pub mod command;
pub mod lock;
pub mod validate;

pub use branch::{commit_message, BranchManager, BranchState, GitResult};
pub use command::{CommandOutput, CommandRunner, MockCommandRunner, ShellRunner};
pub use lock::{BranchLock, LockTable};
pub use validate::{
    checkpoint_branch_name, feature_branch_name, sanitize_slug, validate_branch_name,
    validate_identifier,
};
