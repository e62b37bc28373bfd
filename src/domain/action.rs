//! Actions declared inside artifacts.
//!
//! An action is identified by the message and artifact that own it plus its
//! ordinal position in the artifact. Kind and target are fixed once the open
//! tag is parsed; only content and status change afterwards.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The two kinds of side effect an action can request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Write a file into the sandbox
    File,

    /// Run a shell command in the sandbox
    Shell,
}

impl ActionKind {
    /// Parse the `type` attribute of an action tag
    pub fn from_attribute(value: &str) -> Option<Self> {
        match value {
            "file" => Some(Self::File),
            "shell" | "command" => Some(Self::Shell),
            _ => None,
        }
    }

    /// Whether content may be applied to the sandbox before the action closes.
    ///
    /// Commands are never streamable: a partial command line is not safe to run.
    pub fn is_streamable(self) -> bool {
        matches!(self, Self::File)
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File => write!(f, "file"),
            Self::Shell => write!(f, "shell"),
        }
    }
}

/// Stable identity of an action: (message, artifact, ordinal)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActionKey {
    pub message_id: String,
    pub artifact_id: String,
    pub index: usize,
}

impl ActionKey {
    pub fn new(message_id: impl Into<String>, artifact_id: impl Into<String>, index: usize) -> Self {
        Self {
            message_id: message_id.into(),
            artifact_id: artifact_id.into(),
            index,
        }
    }

    /// Key of the artifact that owns this action
    pub fn artifact(&self) -> ArtifactKey {
        ArtifactKey::new(self.message_id.clone(), self.artifact_id.clone())
    }
}

impl fmt::Display for ActionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.message_id, self.artifact_id, self.index)
    }
}

/// Identity of an artifact: artifact ids are only unique within a message
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactKey {
    pub message_id: String,
    pub artifact_id: String,
}

impl ArtifactKey {
    pub fn new(message_id: impl Into<String>, artifact_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            artifact_id: artifact_id.into(),
        }
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.message_id, self.artifact_id)
    }
}

/// Execution status of an action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    /// Declared, not yet dispatched
    Pending,

    /// Dispatched to the sandbox
    Running,

    /// Finished successfully
    Complete,

    /// Non-zero exit, sandbox error, or limit violation
    Failed,

    /// Never ran (earlier failure or abort), or cancelled while running
    Aborted,
}

impl ActionStatus {
    /// Terminal statuses never change again
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Aborted)
    }
}

impl Default for ActionStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        };
        write!(f, "{}", s)
    }
}

/// A fully closed action handed to the runner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub key: ActionKey,
    pub kind: ActionKind,

    /// File path for `file` actions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    /// File content or command line
    pub content: String,
}

/// Live view of an action as tracked by the workbench
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionState {
    pub key: ActionKey,
    pub kind: ActionKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub content: String,
    pub status: ActionStatus,

    /// Whether the closing tag has been seen
    #[serde(default)]
    pub closed: bool,

    /// Captured command output (failed or complete commands)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
