//! # codehive-store
//!
//! Persistence for Codehive: an abstract JSON record store with in-memory and
//! file-backed implementations, the Epic/Story/Task/Instruction hierarchy
//! built on top of it, and storage for TDD cycles.

pub mod cycles;
pub mod graph;
pub mod hierarchy;
pub mod record;

pub use cycles::{CycleDetails, CycleStore};
pub use graph::DependencyGraph;
pub use hierarchy::{
    progress_percent, EpicStatistics, HierarchyProgress, HierarchyStatistics, HierarchyStore,
    LevelCounts, StoryProgress, TaskProgress, ValidationReport,
};
pub use record::{FileStore, Filter, MemoryStore, Record, RecordStore, RecordStoreExt};
