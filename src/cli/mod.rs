//! Command-line interface for forgebench.
//!
//! Provides commands for parsing an assistant reply, running its actions
//! against a local sandbox, replaying a session journal, and showing the
//! resolved configuration.

use std::io::{self, IsTerminal, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::{broadcast, oneshot};
use tracing::warn;
use uuid::Uuid;

use crate::config;
use crate::core::{read_entries, replay, Journal, Session, Workbench, WorkbenchChange, WorkbenchState};
use crate::domain::ActionStatus;
use crate::parser::StreamingMessageParser;
use crate::sandbox::LocalSandbox;

/// forgebench - Streaming artifact parser and sandboxed action runner
#[derive(Parser, Debug)]
#[command(name = "forgebench")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Parse a reply and print its display text
    Parse {
        /// Reply file ("-" or omitted reads stdin)
        input: Option<PathBuf>,

        /// Print parser events as JSON lines instead of display text
        #[arg(long)]
        events: bool,

        /// Feed the text in chunks of this many bytes (0 = all at once)
        #[arg(long, default_value = "0")]
        chunk_size: usize,
    },

    /// Parse a reply and execute its actions in a local sandbox
    Run {
        /// Reply file ("-" or omitted reads stdin)
        input: Option<PathBuf>,

        /// Sandbox directory (defaults to the configured workdir)
        #[arg(short, long, env = "FORGEBENCH_WORKDIR")]
        workdir: Option<PathBuf>,

        /// Feed the text in chunks of this many bytes (0 = all at once)
        #[arg(long, default_value = "0")]
        chunk_size: usize,

        /// Do not journal workbench changes
        #[arg(long)]
        no_journal: bool,
    },

    /// Rebuild the workbench from a session journal and print it
    Replay {
        /// Journal file, or a session ID under the journal directory
        journal: String,
    },

    /// List journaled sessions
    Sessions,

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Parse {
                input,
                events,
                chunk_size,
            } => parse_reply(input, events, chunk_size),
            Commands::Run {
                input,
                workdir,
                chunk_size,
                no_journal,
            } => run_reply(input, workdir, chunk_size, no_journal).await,
            Commands::Replay { journal } => replay_journal(&journal).await,
            Commands::Sessions => list_sessions().await,
            Commands::Config => show_config(),
        }
    }
}

/// Read the reply from a file, or from piped stdin
fn read_input(input: Option<PathBuf>) -> Result<String> {
    let text = match input {
        Some(path) if path != Path::new("-") => std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read input file: {}", path.display()))?,
        Some(_) => read_stdin()?,
        None if !io::stdin().is_terminal() => read_stdin()?,
        None => anyhow::bail!("No input provided. Pass a file or pipe to stdin"),
    };

    if text.trim().is_empty() {
        anyhow::bail!("Input is empty");
    }

    Ok(text)
}

fn read_stdin() -> Result<String> {
    let mut buffer = String::new();
    io::stdin()
        .read_to_string(&mut buffer)
        .context("Failed to read from stdin")?;
    Ok(buffer)
}

/// Growing prefixes of `text`, as a streamed reply would arrive
fn prefixes(text: &str, chunk_size: usize) -> Vec<&str> {
    if chunk_size == 0 {
        return vec![text];
    }

    let mut ends = Vec::new();
    let mut end = 0;
    while end < text.len() {
        end = (end + chunk_size).min(text.len());
        while !text.is_char_boundary(end) {
            end += 1;
        }
        ends.push(end);
    }
    ends.into_iter().map(|end| &text[..end]).collect()
}

const MESSAGE_ID: &str = "cli";

/// Parse a reply without executing anything
fn parse_reply(input: Option<PathBuf>, events: bool, chunk_size: usize) -> Result<()> {
    let text = read_input(input)?;
    let mut parser = StreamingMessageParser::new();
    let mut stdout = io::stdout().lock();

    let chunks = prefixes(&text, chunk_size);
    let last = chunks.len().saturating_sub(1);

    for (i, prefix) in chunks.into_iter().enumerate() {
        let output = parser.parse(MESSAGE_ID, prefix, i == last);

        if events {
            for event in &output.events {
                let json = serde_json::to_string(event).context("Failed to serialize event")?;
                writeln!(stdout, "{}", json)?;
            }
        } else {
            write!(stdout, "{}", output.display)?;
        }
    }

    if !events {
        writeln!(stdout)?;
    }

    Ok(())
}

/// Parse a reply and execute its actions
async fn run_reply(
    input: Option<PathBuf>,
    workdir: Option<PathBuf>,
    chunk_size: usize,
    no_journal: bool,
) -> Result<()> {
    let text = read_input(input)?;
    let cfg = config::config()?;

    let workdir = workdir.unwrap_or_else(|| cfg.workdir.clone());
    let sandbox = Arc::new(LocalSandbox::with_shell(&workdir, cfg.shell.clone()));

    let workbench = if cfg.journal_enabled && !no_journal {
        let journal = Journal::open(&cfg.journal_dir(), Uuid::new_v4()).await?;
        eprintln!("[Journal: {}]", journal.path().display());
        Workbench::with_journal(journal)
    } else {
        Workbench::new()
    };

    let session = Arc::new(Session::new(
        sandbox,
        Arc::new(workbench),
        cfg.limits.clone(),
    ));

    let (stop_printer, stopped) = oneshot::channel();
    let printer = tokio::spawn(print_changes(session.workbench().subscribe(), stopped));

    let interrupt = {
        let session = Arc::clone(&session);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, aborting all actions");
                session.abort_all().await;
            }
        })
    };

    let chunks = prefixes(&text, chunk_size);
    let last = chunks.len().saturating_sub(1);
    let mut stdout = io::stdout();

    for (i, prefix) in chunks.into_iter().enumerate() {
        let display = session.ingest(MESSAGE_ID, prefix, i == last).await;
        print!("{}", display);
        stdout.flush()?;
    }
    println!();

    session.drain().await;
    interrupt.abort();

    let _ = stop_printer.send(());
    if let Err(e) = printer.await {
        warn!(error = %e, "Status printer failed");
    }

    let snapshot = session.workbench().snapshot().await;
    let actions: Vec<_> = snapshot
        .artifacts
        .iter()
        .flat_map(|a| a.actions.iter())
        .collect();
    let failed = actions
        .iter()
        .filter(|a| a.status == ActionStatus::Failed)
        .count();

    eprintln!(
        "\n[Session {}: {} artifact(s), {} action(s), {} failed, {} file(s) in {}]",
        session.id(),
        snapshot.artifacts.len(),
        actions.len(),
        failed,
        session.workbench().files_count().await,
        workdir.display()
    );
    for preview in &snapshot.previews {
        eprintln!("[Preview: {}]", preview.base_url);
    }

    if failed > 0 {
        std::process::exit(1);
    }

    Ok(())
}

/// Print status lines for workbench changes until told to stop
async fn print_changes(
    mut changes: broadcast::Receiver<WorkbenchChange>,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            change = changes.recv() => match change {
                Ok(change) => print_change(&change),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Status printer fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = &mut stop => {
                while let Ok(change) = changes.try_recv() {
                    print_change(&change);
                }
                break;
            }
        }
    }
}

fn print_change(change: &WorkbenchChange) {
    match change {
        WorkbenchChange::ArtifactAdded { key, title } => {
            eprintln!("[artifact {}] {}", key, title);
        }
        WorkbenchChange::ActionStatus {
            key, status, error, ..
        } => match error {
            Some(error) if *status != ActionStatus::Running => {
                eprintln!("[action {}] {}: {}", key, status, error)
            }
            _ => eprintln!("[action {}] {}", key, status),
        },
        WorkbenchChange::TerminalOutput { chunk, .. } => {
            eprint!("  | {}", chunk);
        }
        WorkbenchChange::PreviewDetected { preview } => {
            eprintln!("[preview] {}", preview.base_url);
        }
        _ => {}
    }
}

/// Rebuild a session from its journal and print the snapshot as JSON
async fn replay_journal(journal: &str) -> Result<()> {
    let path = match Uuid::parse_str(journal) {
        Ok(session_id) => config::journal_dir()?.join(format!("{}.jsonl", session_id)),
        Err(_) => PathBuf::from(journal),
    };

    if !path.exists() {
        anyhow::bail!("Journal not found: {}", path.display());
    }

    let state: WorkbenchState = replay(&path).await?;
    let snapshot = state.snapshot();
    println!(
        "{}",
        serde_json::to_string_pretty(&snapshot).context("Failed to serialize snapshot")?
    );

    Ok(())
}

/// List journaled sessions, oldest first
async fn list_sessions() -> Result<()> {
    let dir = config::journal_dir()?;
    let lines = session_lines(&dir).await?;

    if lines.is_empty() {
        println!("No sessions in {}", dir.display());
        return Ok(());
    }

    for line in lines {
        println!("{}", line);
    }

    Ok(())
}

/// One line per journal: session id, change count, last change time
async fn session_lines(dir: &Path) -> Result<Vec<String>> {
    let mut lines = Vec::new();

    for session_id in Journal::list_sessions(dir).await? {
        let entries = read_entries(&dir.join(format!("{}.jsonl", session_id))).await?;
        let last = entries
            .last()
            .map(|e| e.timestamp.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        lines.push(format!("{}  {:>5} change(s)  {}", session_id, entries.len(), last));
    }

    Ok(lines)
}

/// Show resolved configuration
fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("forgebench configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:     {}", cfg.home.display());
    println!("  Journals: {}", cfg.journal_dir().display());
    println!("  Workdir:  {}", cfg.workdir.display());
    println!();
    println!("Sandbox:");
    println!("  Shell:    {}", cfg.shell);
    println!();
    println!("Limits:");
    match cfg.limits.command_timeout() {
        Some(timeout) => println!("  Command timeout: {}s", timeout.as_secs()),
        None => println!("  Command timeout: none"),
    }
    println!("  Max file size:   {} bytes", cfg.limits.max_file_bytes);
    println!("  Denylist:        {}", cfg.limits.denylist_patterns.join(", "));
    println!();
    println!("Journal: {}", if cfg.journal_enabled { "enabled" } else { "disabled" });

    Ok(())
}
