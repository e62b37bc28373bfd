//! File tree view of what actions wrote into the sandbox.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One entry in the file tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Dirent {
    File { content: String },
    Folder,
}

/// Sorted path → entry map
pub type FileMap = BTreeMap<String, Dirent>;

/// A file that changed since the last checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileModification {
    pub path: String,
    pub content: String,
}

/// Files written by actions, with change tracking against a checkpoint
#[derive(Debug, Clone, Default)]
pub struct FilesStore {
    files: FileMap,

    /// Content hashes at the last `reset_modifications`
    checkpoint: HashMap<String, String>,
}

impl FilesStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a write; parent folders are added as needed
    pub fn record_write(&mut self, path: &str, content: &str) {
        let path = normalize(path);

        let mut parent = String::new();
        let mut segments = path.split('/').peekable();
        while let Some(segment) = segments.next() {
            if segments.peek().is_none() {
                break;
            }
            if !parent.is_empty() {
                parent.push('/');
            }
            parent.push_str(segment);
            self.files.entry(parent.clone()).or_insert(Dirent::Folder);
        }

        self.files.insert(
            path,
            Dirent::File {
                content: content.to_string(),
            },
        );
    }

    pub fn files(&self) -> &FileMap {
        &self.files
    }

    /// Number of files (folders excluded)
    pub fn files_count(&self) -> usize {
        self.files
            .values()
            .filter(|d| matches!(d, Dirent::File { .. }))
            .count()
    }

    pub fn file(&self, path: &str) -> Option<&str> {
        match self.files.get(&normalize(path)) {
            Some(Dirent::File { content }) => Some(content),
            _ => None,
        }
    }

    /// Files that are new or whose content changed since the checkpoint
    pub fn modifications(&self) -> Vec<FileModification> {
        self.files
            .iter()
            .filter_map(|(path, dirent)| match dirent {
                Dirent::File { content } => Some((path, content)),
                Dirent::Folder => None,
            })
            .filter(|(path, content)| {
                self.checkpoint.get(*path) != Some(&content_hash(content))
            })
            .map(|(path, content)| FileModification {
                path: path.clone(),
                content: content.clone(),
            })
            .collect()
    }

    /// Take a new checkpoint of every file's content
    pub fn reset_modifications(&mut self) {
        self.checkpoint = self
            .files
            .iter()
            .filter_map(|(path, dirent)| match dirent {
                Dirent::File { content } => Some((path.clone(), content_hash(content))),
                Dirent::Folder => None,
            })
            .collect();
    }
}

/// SHA256 of content, hex encoded
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

fn normalize(path: &str) -> String {
    path.trim_start_matches("./").to_string()
}
