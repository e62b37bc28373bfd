//! Domain types for forgebench.
//!
//! This module contains the core data structures:
//! - Action: a single file write or shell command and its status
//! - Artifact: an ordered group of actions owned by one message
//! - Events: what the streaming parser recognized

pub mod action;
pub mod artifact;
pub mod events;

// Re-export commonly used types
pub use action::{Action, ActionKey, ActionKind, ActionState, ActionStatus, ArtifactKey};
pub use artifact::{ArtifactState, DEFAULT_TITLE};
pub use events::ParserEvent;
