//! Terminal output captured from shell actions.

use serde::{Deserialize, Serialize};

use crate::domain::ActionKey;

/// One chunk of command output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalEntry {
    pub key: ActionKey,
    pub chunk: String,
}

#[derive(Debug, Clone, Default)]
pub struct TerminalStore {
    entries: Vec<TerminalEntry>,
    show_terminal: bool,

    /// Columns and rows reported by the attached view
    size: Option<(u16, u16)>,
}

impl TerminalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_output(&mut self, key: ActionKey, chunk: String) {
        self.entries.push(TerminalEntry { key, chunk });
    }

    pub fn entries(&self) -> &[TerminalEntry] {
        &self.entries
    }

    /// Everything written to the terminal, in arrival order
    pub fn transcript(&self) -> String {
        self.entries.iter().map(|e| e.chunk.as_str()).collect()
    }

    /// Output of a single action
    pub fn output_for(&self, key: &ActionKey) -> String {
        self.entries
            .iter()
            .filter(|e| &e.key == key)
            .map(|e| e.chunk.as_str())
            .collect()
    }

    pub fn show_terminal(&self) -> bool {
        self.show_terminal
    }

    pub fn resize(&mut self, cols: u16, rows: u16) {
        self.size = Some((cols, rows));
    }

    pub fn size(&self) -> Option<(u16, u16)> {
        self.size
    }

    /// Flip visibility, or force it when `value` is given
    pub fn toggle(&mut self, value: Option<bool>) {
        self.show_terminal = value.unwrap_or(!self.show_terminal);
    }
}
