//! Append-only journal of workbench changes.
//!
//! Each session writes newline-delimited JSON (JSONL) to
//! `<journal dir>/<session id>.jsonl`, one [`JournalEntry`] per applied
//! change. Replaying a journal through [`WorkbenchState::from_changes`]
//! rebuilds the workbench as it was.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use uuid::Uuid;

use super::workbench::{WorkbenchChange, WorkbenchState};

/// One journaled change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub session_id: Uuid,
    pub change: WorkbenchChange,
}

impl JournalEntry {
    pub fn new(session_id: Uuid, change: WorkbenchChange) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            session_id,
            change,
        }
    }
}

/// File-backed change journal for one session
#[derive(Debug, Clone)]
pub struct Journal {
    session_id: Uuid,
    path: PathBuf,
}

impl Journal {
    /// Create or open the journal for a session inside `dir`
    pub async fn open(dir: &Path, session_id: Uuid) -> Result<Self> {
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create journal directory: {}", dir.display()))?;

        Ok(Self {
            session_id,
            path: dir.join(format!("{}.jsonl", session_id)),
        })
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a change to the journal
    pub async fn append(&self, change: &WorkbenchChange) -> Result<()> {
        let entry = JournalEntry::new(self.session_id, change.clone());

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open journal: {}", self.path.display()))?;

        let json = serde_json::to_string(&entry).context("Failed to serialize journal entry")?;
        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .context("Failed to write journal entry")?;
        file.flush().await.context("Failed to flush journal")?;

        Ok(())
    }

    /// Read this session's entries in order
    pub async fn entries(&self) -> Result<Vec<JournalEntry>> {
        read_entries(&self.path).await
    }

    /// List session ids with a journal in `dir`, oldest journal first
    pub async fn list_sessions(dir: &Path) -> Result<Vec<Uuid>> {
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut sessions = Vec::new();
        let mut entries = fs::read_dir(dir)
            .await
            .with_context(|| format!("Failed to read journal directory: {}", dir.display()))?;

        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(stem) = name.strip_suffix(".jsonl") {
                    if let Ok(uuid) = Uuid::parse_str(stem) {
                        let modified = entry.metadata().await?.modified()?;
                        sessions.push((modified, uuid));
                    }
                }
            }
        }

        sessions.sort();
        Ok(sessions.into_iter().map(|(_, uuid)| uuid).collect())
    }
}

/// Read every entry of a journal file in order
pub async fn read_entries(path: &Path) -> Result<Vec<JournalEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file = File::open(path)
        .await
        .with_context(|| format!("Failed to open journal: {}", path.display()))?;

    let reader = BufReader::new(file);
    let mut lines = reader.lines();
    let mut entries = Vec::new();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let entry: JournalEntry = serde_json::from_str(&line)
            .with_context(|| format!("Failed to parse journal entry: {}", line))?;
        entries.push(entry);
    }

    Ok(entries)
}

/// Rebuild workbench state from a journal file
pub async fn replay(path: &Path) -> Result<WorkbenchState> {
    let entries = read_entries(path).await?;
    Ok(WorkbenchState::from_changes(entries.iter().map(|e| &e.change)))
}
