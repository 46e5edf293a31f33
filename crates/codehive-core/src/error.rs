//! Unified error types for Codehive

use thiserror::Error;

/// Unified error type for all Codehive operations
#[derive(Error, Debug)]
pub enum CodehiveError {
    // Hierarchy / record errors
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Record store error: {0}")]
    Store(String),

    // Git errors
    #[error("Git command failed: {0}")]
    GitCommand(String),

    #[error("Branch is locked: {branch} (held by cycle {holder_cycle})")]
    LockConflict {
        branch: String,
        holder_cycle: String,
    },

    // Cycle errors
    #[error("AI generation failed: {0}")]
    AiGeneration(String),

    #[error("Unknown phase: {0}")]
    UnknownPhase(String),

    #[error("Cycle error: {0}")]
    Cycle(String),

    // Workspace errors
    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    // Execution errors
    #[error("Operation timed out after {0}s")]
    Timeout(u64),

    #[error("Execution cancelled: {0}")]
    Cancelled(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

impl CodehiveError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// True for errors describing an absent record or snapshot
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::SnapshotNotFound(_))
    }
}

/// Result type alias using CodehiveError
pub type Result<T> = std::result::Result<T, CodehiveError>;
