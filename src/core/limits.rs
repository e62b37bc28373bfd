//! Execution limits enforced by the action runner.
//!
//! Guards against runaway or unwanted side effects through configurable
//! limits on:
//! - Command duration (optional; commands run until done or aborted otherwise)
//! - File sizes
//! - Denylist patterns for file paths

use std::time::Duration;

use glob::Pattern;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Limits applied to every action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLimits {
    /// Per-command timeout in seconds (default: none)
    #[serde(default)]
    pub command_timeout_seconds: Option<u64>,

    /// Maximum file content size in bytes (default: 10MB)
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,

    /// Glob patterns for paths that actions may not write
    #[serde(default = "default_denylist")]
    pub denylist_patterns: Vec<String>,
}

fn default_max_file_bytes() -> u64 {
    10 * 1024 * 1024
} // 10MB

fn default_denylist() -> Vec<String> {
    vec![".git/**".to_string(), "**/.git/**".to_string()]
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            command_timeout_seconds: None,
            max_file_bytes: default_max_file_bytes(),
            denylist_patterns: default_denylist(),
        }
    }
}

impl ExecutionLimits {
    /// Effective timeout for a command, if any
    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_seconds
            .filter(|s| *s > 0)
            .map(Duration::from_secs)
    }

    /// Check if a file path matches any denylist pattern
    pub fn is_denylisted(&self, path: &str) -> bool {
        let path = path.trim_start_matches("./");
        self.denylist_patterns
            .iter()
            .filter_map(|p| Pattern::new(p).ok())
            .any(|pattern| pattern.matches(path))
    }

    /// Validate a file write against size limits and the denylist
    pub fn validate_write(&self, path: &str, content: &str) -> Result<(), LimitViolation> {
        if self.is_denylisted(path) {
            return Err(LimitViolation::DenylistMatch {
                path: path.to_string(),
            });
        }

        let size = content.len() as u64;
        if size > self.max_file_bytes {
            return Err(LimitViolation::MaxFileBytes {
                path: path.to_string(),
                actual: size,
                limit: self.max_file_bytes,
            });
        }

        Ok(())
    }
}

/// Limit violation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LimitViolation {
    #[error("File '{path}' exceeds maximum size: {actual} > {limit} bytes")]
    MaxFileBytes { path: String, actual: u64, limit: u64 },

    #[error("Path matches denylist pattern: {path}")]
    DenylistMatch { path: String },

    #[error("Command timed out after {seconds}s")]
    CommandTimeout { seconds: u64 },
}
