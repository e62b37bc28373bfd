//! Preview URLs announced by dev servers in command output.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// A server reachable for preview
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewInfo {
    pub port: u16,
    pub base_url: String,
}

#[derive(Debug, Clone, Default)]
pub struct PreviewsStore {
    previews: Vec<PreviewInfo>,
}

impl PreviewsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a preview unless its port is already known
    pub fn add(&mut self, preview: PreviewInfo) -> bool {
        if self.previews.iter().any(|p| p.port == preview.port) {
            return false;
        }
        self.previews.push(preview);
        true
    }

    pub fn previews(&self) -> &[PreviewInfo] {
        &self.previews
    }

    pub fn is_known(&self, port: u16) -> bool {
        self.previews.iter().any(|p| p.port == port)
    }
}

fn url_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(https?)://(localhost|127\.0\.0\.1|0\.0\.0\.0|\[::1\]):(\d{1,5})")
            .expect("preview URL pattern is valid")
    })
}

fn ansi_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").expect("ANSI pattern is valid"))
}

/// Find local server URLs in a chunk of terminal output
pub fn detect_previews(chunk: &str) -> Vec<PreviewInfo> {
    let plain = ansi_pattern().replace_all(chunk, "");

    url_pattern()
        .captures_iter(&plain)
        .filter_map(|caps| {
            let port: u16 = caps[3].parse().ok()?;
            let host = match &caps[2] {
                "0.0.0.0" => "localhost",
                other => other,
            };
            Some(PreviewInfo {
                port,
                base_url: format!("{}://{}:{}", &caps[1], host, port),
            })
        })
        .collect()
}
