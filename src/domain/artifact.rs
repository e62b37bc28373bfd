//! Artifacts: named groups of actions emitted within one message.

use serde::{Deserialize, Serialize};

use super::action::{ActionKey, ActionState, ArtifactKey};

/// Title used when the artifact tag carries none
pub const DEFAULT_TITLE: &str = "Untitled";

/// An artifact as tracked by the workbench
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactState {
    pub key: ArtifactKey,

    /// Display title
    pub title: String,

    /// Set once the artifact close tag is seen; never reopened
    pub closed: bool,

    /// Actions ordered by declaration index
    pub actions: Vec<ActionState>,
}

impl ArtifactState {
    /// Create an open artifact with no actions
    pub fn new(key: ArtifactKey, title: String) -> Self {
        Self {
            key,
            title,
            closed: false,
            actions: Vec::new(),
        }
    }

    pub fn action(&self, index: usize) -> Option<&ActionState> {
        self.position(index).ok().map(|pos| &self.actions[pos])
    }

    pub fn action_mut(&mut self, index: usize) -> Option<&mut ActionState> {
        match self.position(index) {
            Ok(pos) => Some(&mut self.actions[pos]),
            Err(_) => None,
        }
    }

    /// Insert keeping declaration order. Returns false if the index exists.
    pub fn insert_action(&mut self, action: ActionState) -> bool {
        match self.position(action.key.index) {
            Ok(_) => false,
            Err(pos) => {
                self.actions.insert(pos, action);
                true
            }
        }
    }

    /// Whether every registered action reached a terminal status
    pub fn is_settled(&self) -> bool {
        self.actions.iter().all(|a| a.status.is_terminal())
    }

    pub fn action_keys(&self) -> impl Iterator<Item = &ActionKey> {
        self.actions.iter().map(|a| &a.key)
    }

    fn position(&self, index: usize) -> Result<usize, usize> {
        self.actions.binary_search_by_key(&index, |a| a.key.index)
    }
}
