//! Configuration for forgebench.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (FORGEBENCH_HOME, FORGEBENCH_WORKDIR)
//! 2. Config file (.forgebench/config.yaml)
//! 3. Defaults (~/.forgebench)
//!
//! Config file discovery:
//! - Searches current directory and parents for .forgebench/config.yaml
//! - Paths in config file are relative to the project root (the parent of .forgebench/)

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::core::ExecutionLimits;
use crate::sandbox::local::DEFAULT_SHELL;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

const CONFIG_DIR: &str = ".forgebench";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub home: Option<String>,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub limits: Option<ExecutionLimits>,
    #[serde(default)]
    pub journal: JournalConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SandboxConfig {
    /// Directory actions run in (relative to the project root)
    pub workdir: Option<String>,
    /// Shell used for commands
    pub shell: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JournalConfig {
    #[serde(default = "default_journal_enabled")]
    pub enabled: bool,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            enabled: default_journal_enabled(),
        }
    }
}

fn default_journal_enabled() -> bool {
    true
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Engine state (journals)
    pub home: PathBuf,
    /// Sandbox root for the local sandbox
    pub workdir: PathBuf,
    /// Shell for commands
    pub shell: String,
    /// Limits applied by the runner
    pub limits: ExecutionLimits,
    /// Whether sessions journal workbench changes
    pub journal_enabled: bool,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

impl ResolvedConfig {
    pub fn journal_dir(&self) -> PathBuf {
        self.home.join("journal")
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(CONFIG_DIR).join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's project root
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var(name).ok().filter(|v| !v.is_empty()).map(PathBuf::from)
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(CONFIG_DIR);

    let config_file = find_config_file();
    let file = match &config_file {
        Some(path) => Some(load_config_file(path)?),
        None => None,
    };

    // Project root is the parent of .forgebench/
    let base_dir = config_file
        .as_deref()
        .and_then(Path::parent)
        .and_then(Path::parent)
        .unwrap_or(Path::new("."));

    let home = env_path("FORGEBENCH_HOME")
        .or_else(|| {
            file.as_ref()
                .and_then(|f| f.home.as_deref())
                .map(|h| resolve_path(base_dir, h))
        })
        .unwrap_or(default_home);

    let workdir = env_path("FORGEBENCH_WORKDIR")
        .or_else(|| {
            file.as_ref()
                .and_then(|f| f.sandbox.workdir.as_deref())
                .map(|w| resolve_path(base_dir, w))
        })
        .unwrap_or_else(|| home.join("workspace"));

    let shell = file
        .as_ref()
        .and_then(|f| f.sandbox.shell.clone())
        .unwrap_or_else(|| DEFAULT_SHELL.to_string());

    let limits = file
        .as_ref()
        .and_then(|f| f.limits.clone())
        .unwrap_or_default();

    let journal_enabled = file
        .as_ref()
        .map(|f| f.journal.enabled)
        .unwrap_or_else(default_journal_enabled);

    Ok(ResolvedConfig {
        home,
        workdir,
        shell,
        limits,
        journal_enabled,
        config_file,
    })
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the journal directory ($FORGEBENCH_HOME/journal)
pub fn journal_dir() -> Result<PathBuf> {
    Ok(config()?.journal_dir())
}
