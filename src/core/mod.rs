//! Core execution logic.
//!
//! This module contains:
//! - Workbench: event-sourced registry of artifacts, actions and views
//! - Journal: append-only log of workbench changes
//! - Limits: execution limits enforced by the runner
//! - Runner: per-artifact action queues against the sandbox
//! - Session: applies parser events to the workbench and runner

pub mod journal;
pub mod limits;
pub mod runner;
pub mod session;
pub mod workbench;

// Re-export commonly used types
pub use journal::{read_entries, replay, Journal, JournalEntry};
pub use limits::{ExecutionLimits, LimitViolation};
pub use runner::{ActionRunner, ABORTED_BY_USER, SKIPPED_AFTER_FAILURE};
pub use session::Session;
pub use workbench::{
    Workbench, WorkbenchChange, WorkbenchSnapshot, WorkbenchState, WorkbenchView,
    UNCLOSED_ACTION_ERROR,
};
