//! Sandbox capability the runner executes actions against.
//!
//! The sandbox is an external collaborator: an isolated filesystem and
//! process host. The core only needs to write files, run commands with
//! captured output, and cancel a running command.

pub mod local;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

pub use local::LocalSandbox;

/// Receives command output chunks as they are produced
pub type OutputSink = mpsc::UnboundedSender<String>;

/// Identifies one command invocation so it can be cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandHandle(Uuid);

impl CommandHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CommandHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CommandHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Terminal result of a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Process exit code (-1 when killed by a signal)
    pub exit_code: i32,

    /// Combined stdout and stderr, in arrival order
    pub output: String,
}

impl CommandOutput {
    pub fn new(exit_code: i32, output: impl Into<String>) -> Self {
        Self {
            exit_code,
            output: output.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Errors reported by a sandbox
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Sandbox is not available: {0}")]
    Unavailable(String),

    #[error("Path escapes the sandbox root: {0}")]
    PathEscape(String),

    #[error("Command was cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Trait for sandboxed execution environments
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Human-readable sandbox name
    fn name(&self) -> &str;

    /// Resolve once the sandbox can accept operations (e.g. finished booting)
    async fn ready(&self) -> Result<(), SandboxError> {
        Ok(())
    }

    /// Create or overwrite a file, creating parent directories
    async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError>;

    /// Run a command to completion, streaming output chunks into `output`
    async fn run_command(
        &self,
        handle: CommandHandle,
        command: &str,
        output: OutputSink,
    ) -> Result<CommandOutput, SandboxError>;

    /// Ask the sandbox to terminate a running command
    async fn cancel(&self, handle: CommandHandle) -> Result<(), SandboxError>;
}
