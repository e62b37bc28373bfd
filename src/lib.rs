//! forgebench - Streaming artifact parser and sandboxed action runner
//!
//! Assistant replies embed build instructions inside streamed text:
//!
//! ```text
//! Sure! <artifact id="todo-app" title="Todo app">
//! <action type="file" path="index.html">...</action>
//! <action type="shell">npm install</action>
//! </artifact>
//! ```
//!
//! # Architecture
//!
//! - `parser`: incremental tag scanner and per-message state machine that
//!   turns a growing buffer into display text plus ordered events
//! - `core`: the session that applies those events, the per-artifact action
//!   runner, and the event-sourced workbench (with an optional journal)
//! - `stores`: files, terminal and preview views behind the workbench
//! - `sandbox`: the capability actions run against, with a local
//!   directory-backed implementation
//! - `domain`: artifact, action and event types
//! - `cli`: command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Show what a reply would display, or its events
//! forgebench parse reply.txt --events
//!
//! # Execute a reply's actions in a sandbox directory
//! forgebench run reply.txt --workdir ./out
//!
//! # Rebuild a session from its journal
//! forgebench replay <session-id>
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod parser;
pub mod sandbox;
pub mod stores;

// Re-export main types at crate root for convenience
pub use core::{ActionRunner, ExecutionLimits, Session, Workbench, WorkbenchChange, WorkbenchSnapshot};
pub use domain::{Action, ActionKey, ActionKind, ActionStatus, ArtifactKey, ParserEvent};
pub use parser::{ParseOutput, ParserOptions, StreamingMessageParser};
pub use sandbox::{LocalSandbox, Sandbox, SandboxError};
