//! Directory-backed sandbox.
//!
//! Files are written under a root directory and commands run through the
//! configured shell with the root as working directory. This is the sandbox
//! the CLI uses; hosted environments plug in through the same trait.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{CommandHandle, CommandOutput, OutputSink, Sandbox, SandboxError};

/// Shell used when none is configured
pub const DEFAULT_SHELL: &str = "sh";

/// How long to keep collecting output after the process exited
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Sandbox rooted at a local directory
pub struct LocalSandbox {
    root: PathBuf,
    shell: String,

    /// Kill switches for running commands
    running: Mutex<HashMap<CommandHandle, oneshot::Sender<()>>>,
}

impl LocalSandbox {
    /// Create a sandbox rooted at `root` using the default shell
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_shell(root, DEFAULT_SHELL)
    }

    /// Create a sandbox with a custom shell (invoked as `<shell> -c <command>`)
    pub fn with_shell(root: impl Into<PathBuf>, shell: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            shell: shell.into(),
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a sandbox-relative path, refusing anything that leaves the root
    pub fn resolve(&self, path: &str) -> Result<PathBuf, SandboxError> {
        let relative = Path::new(path);

        if path.is_empty() || relative.is_absolute() {
            return Err(SandboxError::PathEscape(path.to_string()));
        }

        for component in relative.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(SandboxError::PathEscape(path.to_string()));
                }
            }
        }

        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    fn name(&self) -> &str {
        "local"
    }

    async fn ready(&self) -> Result<(), SandboxError> {
        fs::create_dir_all(&self.root).await.map_err(|e| {
            SandboxError::Unavailable(format!("cannot create {}: {}", self.root.display(), e))
        })
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError> {
        let full_path = self.resolve(path)?;

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        fs::write(&full_path, content).await?;
        debug!(path, bytes = content.len(), "Wrote file");

        Ok(())
    }

    async fn run_command(
        &self,
        handle: CommandHandle,
        command: &str,
        output: OutputSink,
    ) -> Result<CommandOutput, SandboxError> {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(command)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own group, so a cancel reaches everything the command started
        #[cfg(unix)]
        cmd.process_group(0);
        let mut child = cmd.spawn()?;

        let (kill_tx, mut kill_rx) = oneshot::channel();
        self.running.lock().await.insert(handle, kill_tx);

        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel();
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(forward_lines(stdout, chunk_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(forward_lines(stderr, chunk_tx.clone()));
        }
        drop(chunk_tx);

        let mut captured = String::new();
        let mut forward = |chunk: String| {
            captured.push_str(&chunk);
            // The receiver going away only means nobody is watching
            let _ = output.send(chunk);
        };

        let status = loop {
            tokio::select! {
                Some(chunk) = chunk_rx.recv() => forward(chunk),
                status = child.wait() => break Some(status?),
                _ = &mut kill_rx => {
                    debug!(%handle, "Killing command");
                    kill_tree(&mut child)?;
                    let _ = child.wait().await;
                    break None;
                }
            }
        };

        self.running.lock().await.remove(&handle);

        let drain = async {
            while let Some(chunk) = chunk_rx.recv().await {
                forward(chunk);
            }
        };
        if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, drain).await.is_err() {
            warn!(%handle, "Command output still open after exit, dropping the rest");
        }
        for reader in readers {
            reader.abort();
        }

        match status {
            Some(status) => Ok(CommandOutput::new(status.code().unwrap_or(-1), captured)),
            None => Err(SandboxError::Cancelled),
        }
    }

    async fn cancel(&self, handle: CommandHandle) -> Result<(), SandboxError> {
        if let Some(kill) = self.running.lock().await.remove(&handle) {
            let _ = kill.send(());
        }
        Ok(())
    }
}

/// Kill the command together with any processes it spawned
#[cfg(unix)]
fn kill_tree(child: &mut Child) -> std::io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            // Group already gone
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => return Err(e.into()),
        }
    }
    child.start_kill()
}

#[cfg(not(unix))]
fn kill_tree(child: &mut Child) -> std::io::Result<()> {
    child.start_kill()
}

/// Forward each line of a pipe as a chunk
fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(format!("{}\n", line)).is_err() {
                break;
            }
        }
    })
}
