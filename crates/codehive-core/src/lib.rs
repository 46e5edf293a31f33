//! # codehive-core
//!
//! Core types for the Codehive TDD orchestration engine.
//!
//! Work is decomposed into a four-level hierarchy (Epic → Story → Task →
//! Instruction) and each feature is driven through a RED → GREEN → REFACTOR →
//! REVIEW cycle on its own git branch.
//!
//! ## Crate Contents
//!
//! - Hierarchy entities, dependency edges and their update inputs
//! - Cycle, test, artifact and query types
//! - [`CodehiveError`] and the crate-wide [`Result`] alias
//! - Project configuration loaded from `.codehive/config.toml`
//! - The event bus shared by every manager

pub mod clock;
pub mod config;
pub mod cycle;
mod error;
pub mod events;
pub mod fail_open;
mod types;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::CodehiveConfig;
pub use cycle::*;
pub use error::{CodehiveError, Result};
pub use events::{BroadcastSink, Event, EventBus, EventKind, EventSink};
pub use types::*;
