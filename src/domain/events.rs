//! Events produced by the streaming parser.
//!
//! The parser never mutates shared state. Each invocation returns an ordered
//! list of these events and a consumer applies them.

use serde::{Deserialize, Serialize};

use super::action::{Action, ActionKey, ActionKind, ArtifactKey};

/// One structural event recognized in a message stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ParserEvent {
    /// An artifact open tag was fully lexed
    ArtifactOpen {
        message_id: String,
        artifact_id: String,
        title: String,
    },

    /// The artifact close tag was seen
    ArtifactClose {
        message_id: String,
        artifact_id: String,
    },

    /// An action open tag was fully lexed; kind and target are now fixed
    ActionOpen {
        key: ActionKey,
        kind: ActionKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },

    /// More content for a streamable action.
    ///
    /// `offset` is where `delta` starts within the action content, so the
    /// concatenation of all deltas equals the content at close.
    ActionUpdate {
        key: ActionKey,
        kind: ActionKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        offset: usize,
        delta: String,
    },

    /// The action close tag was seen; content is final
    ActionClose { action: Action },
}

impl ParserEvent {
    /// Artifact this event belongs to
    pub fn artifact_key(&self) -> ArtifactKey {
        match self {
            Self::ArtifactOpen {
                message_id,
                artifact_id,
                ..
            }
            | Self::ArtifactClose {
                message_id,
                artifact_id,
            } => ArtifactKey::new(message_id.clone(), artifact_id.clone()),
            Self::ActionOpen { key, .. } | Self::ActionUpdate { key, .. } => key.artifact(),
            Self::ActionClose { action } => action.key.artifact(),
        }
    }

    /// Short label for logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::ArtifactOpen { .. } => "artifact_open",
            Self::ArtifactClose { .. } => "artifact_close",
            Self::ActionOpen { .. } => "action_open",
            Self::ActionUpdate { .. } => "action_update",
            Self::ActionClose { .. } => "action_close",
        }
    }
}
