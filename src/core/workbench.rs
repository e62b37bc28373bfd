//! Workbench: the registry of artifacts, actions and their derived views.
//!
//! All writes are expressed as [`WorkbenchChange`] values and applied by a
//! single fold, so the current state can always be rebuilt by replaying
//! changes in order (see [`WorkbenchState::from_changes`]). Writers are the
//! session (parser events) and the action runner (status, output, files).
//! The workbench never touches the sandbox.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};

use crate::domain::{
    ActionKey, ActionKind, ActionState, ActionStatus, ArtifactKey, ArtifactState,
};
use crate::stores::{
    FileMap, FileModification, FilesStore, PreviewInfo, PreviewsStore, TerminalStore,
};

use super::journal::Journal;

/// Capacity of the change broadcast channel
const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// Error recorded on actions still open when their message ends
pub const UNCLOSED_ACTION_ERROR: &str = "stream ended before action closed";

/// Which workbench panel is showing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkbenchView {
    #[default]
    Code,
    Preview,
}

/// A single write to the workbench
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum WorkbenchChange {
    ArtifactAdded {
        key: ArtifactKey,
        title: String,
    },
    ArtifactUpdated {
        key: ArtifactKey,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        closed: Option<bool>,
    },
    ActionAdded {
        key: ActionKey,
        kind: ActionKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        content: String,
    },
    ActionContent {
        key: ActionKey,
        offset: usize,
        delta: String,
    },
    ActionClosed {
        key: ActionKey,
    },
    ActionStatus {
        key: ActionKey,
        status: ActionStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    FileWritten {
        path: String,
        content: String,
    },
    TerminalOutput {
        key: ActionKey,
        chunk: String,
    },
    PreviewDetected {
        preview: PreviewInfo,
    },
}

/// Serializable view of the whole workbench
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkbenchSnapshot {
    /// Artifacts in the order they were opened
    pub artifacts: Vec<ArtifactState>,
    pub active_artifact: Option<ArtifactKey>,
    pub files: FileMap,
    pub previews: Vec<PreviewInfo>,
    pub terminal: String,
    pub show_workbench: bool,
    pub show_terminal: bool,
    pub selected_file: Option<String>,
    pub current_view: WorkbenchView,
}

/// Plain workbench state; mutated only through [`WorkbenchState::apply`]
#[derive(Debug, Clone, Default)]
pub struct WorkbenchState {
    artifacts: HashMap<ArtifactKey, ArtifactState>,
    artifact_order: Vec<ArtifactKey>,
    files: FilesStore,
    terminal: TerminalStore,
    previews: PreviewsStore,
    show_workbench: bool,
    selected_file: Option<String>,
    current_view: WorkbenchView,
}

impl WorkbenchState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild state by replaying changes in order
    pub fn from_changes<'a>(changes: impl IntoIterator<Item = &'a WorkbenchChange>) -> Self {
        let mut state = Self::new();
        for change in changes {
            state.apply(change);
        }
        state
    }

    /// Apply one change. Returns false when it was a no-op (duplicate,
    /// stale, or referring to something unknown).
    pub fn apply(&mut self, change: &WorkbenchChange) -> bool {
        match change {
            WorkbenchChange::ArtifactAdded { key, title } => {
                if self.artifacts.contains_key(key) {
                    return false;
                }
                self.artifacts
                    .insert(key.clone(), ArtifactState::new(key.clone(), title.clone()));
                self.artifact_order.push(key.clone());
                self.show_workbench = true;
                true
            }
            WorkbenchChange::ArtifactUpdated { key, title, closed } => {
                let Some(artifact) = self.artifacts.get_mut(key) else {
                    warn!(artifact = %key, "Update for unknown artifact");
                    return false;
                };
                let mut changed = false;
                if let Some(title) = title.as_ref().filter(|t| **t != artifact.title) {
                    artifact.title = title.clone();
                    changed = true;
                }
                if *closed == Some(true) && !artifact.closed {
                    artifact.closed = true;
                    changed = true;
                }
                changed
            }
            WorkbenchChange::ActionAdded {
                key,
                kind,
                target,
                content,
            } => {
                let Some(artifact) = self.artifacts.get_mut(&key.artifact()) else {
                    warn!(action = %key, "Action for unknown artifact");
                    return false;
                };
                artifact.insert_action(ActionState {
                    key: key.clone(),
                    kind: *kind,
                    target: target.clone(),
                    content: content.clone(),
                    status: ActionStatus::Pending,
                    closed: false,
                    output: None,
                    error: None,
                })
            }
            WorkbenchChange::ActionClosed { key } => match self.action_mut(key) {
                Some(action) if !action.closed => {
                    action.closed = true;
                    true
                }
                _ => false,
            },
            WorkbenchChange::ActionContent { key, offset, delta } => {
                let Some(action) = self.action_mut(key) else {
                    return false;
                };
                let seen = action.content.len();
                if *offset > seen {
                    warn!(action = %key, offset, seen, "Content delta leaves a gap, dropping");
                    return false;
                }
                // Replayed deltas only contribute the part not seen yet
                match delta.get(seen - offset..) {
                    Some(unseen) if !unseen.is_empty() => {
                        action.content.push_str(unseen);
                        true
                    }
                    _ => false,
                }
            }
            WorkbenchChange::ActionStatus {
                key,
                status,
                output,
                error,
            } => {
                let Some(action) = self.action_mut(key) else {
                    return false;
                };
                if action.status.is_terminal() {
                    debug!(action = %key, current = %action.status, ignored = %status, "Action already settled");
                    return false;
                }
                action.status = *status;
                if output.is_some() {
                    action.output = output.clone();
                }
                if error.is_some() {
                    action.error = error.clone();
                }
                true
            }
            WorkbenchChange::FileWritten { path, content } => {
                self.files.record_write(path, content);
                if self.selected_file.is_none() {
                    self.selected_file = Some(path.trim_start_matches("./").to_string());
                }
                true
            }
            WorkbenchChange::TerminalOutput { key, chunk } => {
                self.terminal.record_output(key.clone(), chunk.clone());
                true
            }
            WorkbenchChange::PreviewDetected { preview } => {
                let first = self.previews.previews().is_empty();
                if !self.previews.add(preview.clone()) {
                    return false;
                }
                if first {
                    self.current_view = WorkbenchView::Preview;
                }
                true
            }
        }
    }

    pub fn artifact(&self, key: &ArtifactKey) -> Option<&ArtifactState> {
        self.artifacts.get(key)
    }

    pub fn action(&self, key: &ActionKey) -> Option<&ActionState> {
        self.artifacts.get(&key.artifact())?.action(key.index)
    }

    fn action_mut(&mut self, key: &ActionKey) -> Option<&mut ActionState> {
        self.artifacts.get_mut(&key.artifact())?.action_mut(key.index)
    }

    /// Artifacts in open order
    pub fn artifacts(&self) -> impl Iterator<Item = &ArtifactState> {
        self.artifact_order
            .iter()
            .filter_map(|key| self.artifacts.get(key))
    }

    /// Artifacts owned by one message, in open order
    pub fn artifacts_for_message<'a>(
        &'a self,
        message_id: &'a str,
    ) -> impl Iterator<Item = &'a ArtifactState> + 'a {
        self.artifacts().filter(move |a| a.key.message_id == message_id)
    }

    pub fn first_artifact(&self) -> Option<&ArtifactState> {
        self.artifact_order
            .first()
            .and_then(|key| self.artifacts.get(key))
    }

    /// The most recently opened artifact
    pub fn active_artifact(&self) -> Option<&ArtifactState> {
        self.artifact_order
            .last()
            .and_then(|key| self.artifacts.get(key))
    }

    /// Whether every registered action reached a terminal status
    pub fn is_settled(&self) -> bool {
        self.artifacts.values().all(ArtifactState::is_settled)
    }

    pub fn files(&self) -> &FilesStore {
        &self.files
    }

    pub fn terminal(&self) -> &TerminalStore {
        &self.terminal
    }

    pub fn previews(&self) -> &PreviewsStore {
        &self.previews
    }

    pub fn show_workbench(&self) -> bool {
        self.show_workbench
    }

    pub fn selected_file(&self) -> Option<&str> {
        self.selected_file.as_deref()
    }

    pub fn current_view(&self) -> WorkbenchView {
        self.current_view
    }

    pub fn snapshot(&self) -> WorkbenchSnapshot {
        WorkbenchSnapshot {
            artifacts: self.artifacts().cloned().collect(),
            active_artifact: self.active_artifact().map(|a| a.key.clone()),
            files: self.files.files().clone(),
            previews: self.previews.previews().to_vec(),
            terminal: self.terminal.transcript(),
            show_workbench: self.show_workbench,
            show_terminal: self.terminal.show_terminal(),
            selected_file: self.selected_file.clone(),
            current_view: self.current_view,
        }
    }
}

/// Shared, serialized access to the workbench state
pub struct Workbench {
    state: RwLock<WorkbenchState>,
    changes: broadcast::Sender<WorkbenchChange>,
    journal: Option<Journal>,
}

impl Default for Workbench {
    fn default() -> Self {
        Self::new()
    }
}

impl Workbench {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            state: RwLock::new(WorkbenchState::new()),
            changes,
            journal: None,
        }
    }

    /// Create a workbench that appends every applied change to a journal
    pub fn with_journal(journal: Journal) -> Self {
        Self {
            journal: Some(journal),
            ..Self::new()
        }
    }

    pub fn journal(&self) -> Option<&Journal> {
        self.journal.as_ref()
    }

    /// Receive every change applied from now on
    pub fn subscribe(&self) -> broadcast::Receiver<WorkbenchChange> {
        self.changes.subscribe()
    }

    /// Apply a change. Writes are serialized, and the journal and subscribers
    /// observe them in the order they were applied.
    pub async fn record(&self, change: WorkbenchChange) -> bool {
        let mut state = self.state.write().await;

        if !state.apply(&change) {
            return false;
        }

        if let Some(journal) = &self.journal {
            if let Err(e) = journal.append(&change).await {
                warn!(error = %e, "Failed to journal workbench change");
            }
        }

        // No subscribers is fine
        let _ = self.changes.send(change);
        true
    }

    pub async fn add_artifact(&self, key: ArtifactKey, title: String) -> bool {
        self.record(WorkbenchChange::ArtifactAdded { key, title }).await
    }

    pub async fn close_artifact(&self, key: ArtifactKey) -> bool {
        self.record(WorkbenchChange::ArtifactUpdated {
            key,
            title: None,
            closed: Some(true),
        })
        .await
    }

    pub async fn add_action(
        &self,
        key: ActionKey,
        kind: ActionKind,
        target: Option<String>,
        content: String,
    ) -> bool {
        self.record(WorkbenchChange::ActionAdded {
            key,
            kind,
            target,
            content,
        })
        .await
    }

    pub async fn close_action(&self, key: ActionKey) -> bool {
        self.record(WorkbenchChange::ActionClosed { key }).await
    }

    /// Abort the actions of a finished message whose closing tag never came.
    /// Returns the keys that were aborted.
    pub async fn seal_message(&self, message_id: &str) -> Vec<ActionKey> {
        let unclosed: Vec<ActionKey> = self
            .with_state(|state| {
                state
                    .artifacts_for_message(message_id)
                    .flat_map(|artifact| artifact.actions.iter())
                    .filter(|action| !action.closed && !action.status.is_terminal())
                    .map(|action| action.key.clone())
                    .collect()
            })
            .await;

        let mut sealed = Vec::with_capacity(unclosed.len());
        for key in unclosed {
            let aborted = self
                .set_status(
                    key.clone(),
                    ActionStatus::Aborted,
                    None,
                    Some(UNCLOSED_ACTION_ERROR.to_string()),
                )
                .await;
            if aborted {
                warn!(action = %key, "Action never closed before the stream ended");
                sealed.push(key);
            }
        }
        sealed
    }

    pub async fn append_content(&self, key: ActionKey, offset: usize, delta: String) -> bool {
        self.record(WorkbenchChange::ActionContent { key, offset, delta })
            .await
    }

    pub async fn set_status(
        &self,
        key: ActionKey,
        status: ActionStatus,
        output: Option<String>,
        error: Option<String>,
    ) -> bool {
        self.record(WorkbenchChange::ActionStatus {
            key,
            status,
            output,
            error,
        })
        .await
    }

    pub async fn file_written(&self, path: String, content: String) -> bool {
        self.record(WorkbenchChange::FileWritten { path, content })
            .await
    }

    pub async fn terminal_output(&self, key: ActionKey, chunk: String) -> bool {
        self.record(WorkbenchChange::TerminalOutput { key, chunk })
            .await
    }

    pub async fn preview_detected(&self, preview: PreviewInfo) -> bool {
        self.record(WorkbenchChange::PreviewDetected { preview })
            .await
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub async fn snapshot(&self) -> WorkbenchSnapshot {
        self.state.read().await.snapshot()
    }

    pub async fn artifact(&self, key: &ArtifactKey) -> Option<ArtifactState> {
        self.state.read().await.artifact(key).cloned()
    }

    pub async fn action(&self, key: &ActionKey) -> Option<ActionState> {
        self.state.read().await.action(key).cloned()
    }

    pub async fn status(&self, key: &ActionKey) -> Option<ActionStatus> {
        self.state.read().await.action(key).map(|a| a.status)
    }

    /// Actions of the most recently opened artifact
    pub async fn active_actions(&self) -> Vec<ActionState> {
        self.state
            .read()
            .await
            .active_artifact()
            .map(|a| a.actions.clone())
            .unwrap_or_default()
    }

    pub async fn first_artifact(&self) -> Option<ArtifactState> {
        self.state.read().await.first_artifact().cloned()
    }

    pub async fn is_settled(&self) -> bool {
        self.state.read().await.is_settled()
    }

    pub async fn files_count(&self) -> usize {
        self.state.read().await.files().files_count()
    }

    pub async fn file_modifications(&self) -> Vec<FileModification> {
        self.state.read().await.files().modifications()
    }

    /// Run a closure against the current state without cloning it
    pub async fn with_state<R>(&self, f: impl FnOnce(&WorkbenchState) -> R) -> R {
        f(&*self.state.read().await)
    }

    // ------------------------------------------------------------------
    // View state owned by the UI; not part of the change log
    // ------------------------------------------------------------------

    pub async fn reset_file_modifications(&self) {
        self.state.write().await.files.reset_modifications();
    }

    pub async fn set_selected_file(&self, path: Option<String>) {
        self.state.write().await.selected_file = path;
    }

    pub async fn set_show_workbench(&self, show: bool) {
        self.state.write().await.show_workbench = show;
    }

    pub async fn set_current_view(&self, view: WorkbenchView) {
        self.state.write().await.current_view = view;
    }

    pub async fn toggle_terminal(&self, value: Option<bool>) {
        self.state.write().await.terminal.toggle(value);
    }

    pub async fn resize_terminal(&self, cols: u16, rows: u16) {
        self.state.write().await.terminal.resize(cols, rows);
    }
}
