//! Action runner: executes closed actions against the sandbox.
//!
//! Every artifact gets its own queue, drained by one worker task, so actions
//! of an artifact run strictly in declaration order while different
//! artifacts run concurrently. A failure halts the rest of that artifact's
//! queue (later actions end `aborted`); other artifacts are unaffected.
//!
//! File content streamed before an action closes is written through a
//! second per-artifact task that coalesces bursts of snapshots and only
//! writes the latest content per path. The queue worker waits for that task
//! to catch up before the final flush of a file action.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::domain::{Action, ActionKey, ActionKind, ActionStatus, ArtifactKey};
use crate::sandbox::{CommandHandle, CommandOutput, Sandbox, SandboxError};
use crate::stores::detect_previews;

use super::limits::{ExecutionLimits, LimitViolation};
use super::workbench::Workbench;

/// Error recorded on actions skipped because an earlier one failed
pub const SKIPPED_AFTER_FAILURE: &str = "skipped after an earlier action failed";

/// Error recorded on actions stopped by an abort
pub const ABORTED_BY_USER: &str = "aborted";

/// How long a cancelled command may take to report back
const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// How long to wait for the last output chunks of a finished command
const OUTPUT_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Runs actions from any number of artifacts
pub struct ActionRunner {
    sandbox: Arc<dyn Sandbox>,
    workbench: Arc<Workbench>,
    limits: ExecutionLimits,
    inner: Mutex<RunnerInner>,
}

#[derive(Default)]
struct RunnerInner {
    /// Token handed to queues created from now on
    cancel: CancellationToken,

    queues: HashMap<ArtifactKey, ArtifactQueue>,

    /// Token each artifact was opened under; an abort covers every artifact
    /// opened before it even if none of its actions has closed yet
    tokens: HashMap<ArtifactKey, CancellationToken>,

    /// Outlives drained queues so a failed artifact stays halted
    halted: HashMap<ArtifactKey, Arc<AtomicBool>>,

    /// Every action key ever enqueued
    enqueued: HashSet<ActionKey>,

    /// Content streamed so far for file actions that are still open
    streams: HashMap<ActionKey, String>,
}

struct ArtifactQueue {
    jobs: mpsc::UnboundedSender<Action>,
    writes: mpsc::UnboundedSender<StreamWrite>,
    worker: JoinHandle<()>,
    writer: JoinHandle<()>,
}

enum StreamWrite {
    Write { path: String, content: String },

    /// Acknowledged once every write sent before it has landed
    Barrier(oneshot::Sender<()>),
}

/// State shared by the two tasks of one artifact
struct QueueContext {
    artifact: ArtifactKey,
    sandbox: Arc<dyn Sandbox>,
    workbench: Arc<Workbench>,
    limits: ExecutionLimits,
    cancel: CancellationToken,
    halted: Arc<AtomicBool>,
}

/// Why a command stopped waiting
enum Stop {
    Finished(Result<CommandOutput, SandboxError>),
    Cancelled,
    TimedOut(Duration),
}

/// How a dispatched action ended
#[derive(Debug)]
enum Outcome {
    Complete {
        output: Option<String>,
    },
    Failed {
        output: Option<String>,
        error: String,
    },
    Aborted {
        output: Option<String>,
    },
}

impl ActionRunner {
    pub fn new(sandbox: Arc<dyn Sandbox>, workbench: Arc<Workbench>, limits: ExecutionLimits) -> Self {
        Self {
            sandbox,
            workbench,
            limits,
            inner: Mutex::new(RunnerInner::default()),
        }
    }

    pub fn limits(&self) -> &ExecutionLimits {
        &self.limits
    }

    /// Bind an artifact to the current abort token as soon as it opens
    pub async fn open_artifact(&self, artifact: &ArtifactKey) {
        let mut inner = self.inner.lock().await;
        let cancel = inner.cancel.clone();
        inner.tokens.entry(artifact.clone()).or_insert(cancel);
        inner.halted.entry(artifact.clone()).or_default();
    }

    /// Queue a closed action behind the earlier actions of its artifact.
    ///
    /// Returns false when the action was already enqueued once.
    #[instrument(skip(self, action), fields(action = %action.key, kind = %action.kind))]
    pub async fn enqueue(&self, action: Action) -> bool {
        let mut inner = self.inner.lock().await;

        if !inner.enqueued.insert(action.key.clone()) {
            debug!("Action already enqueued, ignoring");
            return false;
        }
        inner.streams.remove(&action.key);

        let queue = self.queue(&mut inner, &action.key.artifact());
        if queue.jobs.send(action).is_err() {
            warn!("Artifact queue is closed");
            return false;
        }

        debug!("Action enqueued");
        true
    }

    /// Write the content streamed so far for an open file action.
    ///
    /// `offset` is where `delta` starts in the action content; deltas already
    /// seen are ignored, so re-parsing a message never rewinds a file.
    pub async fn apply_streamed_content(&self, key: &ActionKey, target: &str, offset: usize, delta: &str) {
        let mut inner = self.inner.lock().await;

        if inner.enqueued.contains(key) {
            return;
        }

        let artifact = key.artifact();
        let stopped = inner
            .halted
            .get(&artifact)
            .is_some_and(|h| h.load(Ordering::SeqCst))
            || inner.tokens.get(&artifact).is_some_and(|t| t.is_cancelled());
        if stopped {
            inner.streams.remove(key);
            return;
        }

        let content = inner.streams.entry(key.clone()).or_default();
        let seen = content.len();
        if offset > seen {
            warn!(action = %key, offset, seen, "Streamed delta leaves a gap, dropping");
            return;
        }
        match delta.get(seen - offset..) {
            Some(unseen) if !unseen.is_empty() => content.push_str(unseen),
            _ => return,
        }
        let content = content.clone();

        if let Err(violation) = self.limits.validate_write(target, &content) {
            // The final flush reports it
            debug!(action = %key, %violation, "Skipping streamed write");
            return;
        }

        let queue = self.queue(&mut inner, &artifact);
        let _ = queue.writes.send(StreamWrite::Write {
            path: target.to_string(),
            content,
        });
    }

    /// Stop everything: in-flight commands are cancelled, queued actions end
    /// `aborted`. Artifacts opened afterwards run normally.
    #[instrument(skip(self))]
    pub async fn abort_all(&self) {
        let mut inner = self.inner.lock().await;
        let previous = mem::replace(&mut inner.cancel, CancellationToken::new());
        // Existing queues keep the cancelled token
        previous.cancel();
        for halted in inner.halted.values() {
            halted.store(true, Ordering::SeqCst);
        }
        inner.streams.clear();
        info!(queues = inner.queues.len(), "Aborted all actions");
    }

    /// Drop streamed content kept for actions that will never close
    pub async fn forget_streams(&self, keys: &[ActionKey]) {
        let mut inner = self.inner.lock().await;
        for key in keys {
            inner.streams.remove(key);
        }
    }

    /// Close every queue and wait until all queued work has finished
    pub async fn drain(&self) {
        let queues: Vec<(ArtifactKey, ArtifactQueue)> = {
            let mut inner = self.inner.lock().await;
            inner.queues.drain().collect()
        };

        for (artifact, queue) in queues {
            let ArtifactQueue {
                jobs,
                writes,
                worker,
                writer,
            } = queue;
            drop(jobs);
            drop(writes);

            if let Err(e) = worker.await {
                warn!(%artifact, error = %e, "Queue worker panicked");
            }
            if let Err(e) = writer.await {
                warn!(%artifact, error = %e, "Stream writer panicked");
            }
        }
    }

    /// Whether an artifact stopped running actions after a failure or abort
    pub async fn is_halted(&self, artifact: &ArtifactKey) -> bool {
        self.inner
            .lock()
            .await
            .halted
            .get(artifact)
            .is_some_and(|h| h.load(Ordering::SeqCst))
    }

    /// Find or start the queue of an artifact
    fn queue<'a>(&self, inner: &'a mut RunnerInner, artifact: &ArtifactKey) -> &'a ArtifactQueue {
        let current = inner.cancel.clone();
        let cancel = inner
            .tokens
            .entry(artifact.clone())
            .or_insert(current)
            .clone();
        let halted = inner.halted.entry(artifact.clone()).or_default().clone();

        inner
            .queues
            .entry(artifact.clone())
            .or_insert_with(|| self.spawn_queue(artifact.clone(), cancel, halted))
    }

    fn spawn_queue(
        &self,
        artifact: ArtifactKey,
        cancel: CancellationToken,
        halted: Arc<AtomicBool>,
    ) -> ArtifactQueue {
        debug!(%artifact, "Starting artifact queue");

        let ctx = Arc::new(QueueContext {
            artifact,
            sandbox: Arc::clone(&self.sandbox),
            workbench: Arc::clone(&self.workbench),
            limits: self.limits.clone(),
            cancel,
            halted,
        });

        let (jobs, jobs_rx) = mpsc::unbounded_channel();
        let (writes, writes_rx) = mpsc::unbounded_channel();

        let worker = tokio::spawn(run_queue(Arc::clone(&ctx), jobs_rx, writes.clone()));
        let writer = tokio::spawn(run_writer(ctx, writes_rx));

        ArtifactQueue {
            jobs,
            writes,
            worker,
            writer,
        }
    }
}

impl QueueContext {
    fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled() || self.halted.load(Ordering::SeqCst)
    }

    /// Wait for the sandbox, or for an abort. Err carries the reason the
    /// sandbox never became ready.
    async fn wait_ready(&self) -> Result<bool, SandboxError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Ok(false),
            ready = self.sandbox.ready() => ready.map(|_| true),
        }
    }

    async fn settle(&self, key: &ActionKey, outcome: Outcome) {
        let (status, output, error) = match outcome {
            Outcome::Complete { output } => (ActionStatus::Complete, output, None),
            Outcome::Failed { output, error } => {
                self.halted.store(true, Ordering::SeqCst);
                warn!(action = %key, %error, "Action failed");
                (ActionStatus::Failed, output, Some(error))
            }
            Outcome::Aborted { output } => {
                self.halted.store(true, Ordering::SeqCst);
                (ActionStatus::Aborted, output, Some(ABORTED_BY_USER.to_string()))
            }
        };

        self.workbench
            .set_status(key.clone(), status, output, error)
            .await;
        info!(action = %key, %status, "Action settled");
    }

    async fn skip(&self, key: &ActionKey) {
        let reason = if self.cancel.is_cancelled() {
            ABORTED_BY_USER
        } else {
            SKIPPED_AFTER_FAILURE
        };
        debug!(action = %key, reason, "Skipping action");
        self.workbench
            .set_status(key.clone(), ActionStatus::Aborted, None, Some(reason.to_string()))
            .await;
    }

    #[instrument(skip(self, action, writes), fields(action = %action.key, kind = %action.kind))]
    async fn execute(&self, action: &Action, writes: &mpsc::UnboundedSender<StreamWrite>) -> Outcome {
        self.workbench
            .set_status(action.key.clone(), ActionStatus::Running, None, None)
            .await;

        match action.kind {
            ActionKind::File => self.write_file(action, writes).await,
            ActionKind::Shell => self.run_command(action).await,
        }
    }

    async fn write_file(&self, action: &Action, writes: &mpsc::UnboundedSender<StreamWrite>) -> Outcome {
        let Some(path) = action.target.as_deref() else {
            return Outcome::Failed {
                output: None,
                error: "file action has no path".to_string(),
            };
        };

        if let Err(violation) = self.limits.validate_write(path, &action.content) {
            return Outcome::Failed {
                output: None,
                error: violation.to_string(),
            };
        }

        // Earlier streamed snapshots must land before the final content
        let (ack, landed) = oneshot::channel();
        if writes.send(StreamWrite::Barrier(ack)).is_ok() {
            let _ = landed.await;
        }

        let written = tokio::select! {
            _ = self.cancel.cancelled() => return Outcome::Aborted { output: None },
            written = self.sandbox.write_file(path, &action.content) => written,
        };

        match written {
            Ok(()) => {
                self.workbench
                    .file_written(path.to_string(), action.content.clone())
                    .await;
                debug!(path, bytes = action.content.len(), "File written");
                Outcome::Complete { output: None }
            }
            Err(e) => Outcome::Failed {
                output: None,
                error: e.to_string(),
            },
        }
    }

    async fn run_command(&self, action: &Action) -> Outcome {
        let handle = CommandHandle::new();
        let (sink, chunks) = mpsc::unbounded_channel();
        let mut forwarder = tokio::spawn(forward_output(
            Arc::clone(&self.workbench),
            action.key.clone(),
            chunks,
        ));

        info!(%handle, command = %action.content, "Running command");

        let run = self.sandbox.run_command(handle, &action.content, sink);
        tokio::pin!(run);

        let timeout = self.limits.command_timeout();
        let expiry = async {
            match timeout {
                Some(duration) => tokio::time::sleep(duration).await,
                None => std::future::pending::<()>().await,
            }
        };

        let stop = tokio::select! {
            result = &mut run => Stop::Finished(result),
            _ = self.cancel.cancelled() => Stop::Cancelled,
            _ = expiry => Stop::TimedOut(timeout.unwrap_or_default()),
        };

        let outcome = match stop {
            Stop::Finished(result) => self.command_outcome(result),
            Stop::Cancelled => self.interrupt(handle, &mut run, None).await,
            Stop::TimedOut(duration) => self.interrupt(handle, &mut run, Some(duration)).await,
        };

        if tokio::time::timeout(OUTPUT_FLUSH_TIMEOUT, &mut forwarder)
            .await
            .is_err()
        {
            forwarder.abort();
        }

        outcome
    }

    /// Cancel a command that is still running
    async fn interrupt<F>(&self, handle: CommandHandle, run: F, timed_out: Option<Duration>) -> Outcome
    where
        F: Future<Output = Result<CommandOutput, SandboxError>> + Unpin,
    {
        if let Err(e) = self.sandbox.cancel(handle).await {
            warn!(%handle, error = %e, "Sandbox failed to cancel command");
        }

        let output = match tokio::time::timeout(CANCEL_GRACE, run).await {
            Ok(Ok(CommandOutput { output, .. })) => Some(output),
            _ => None,
        };

        match timed_out {
            Some(duration) => Outcome::Failed {
                output,
                error: LimitViolation::CommandTimeout {
                    seconds: duration.as_secs(),
                }
                .to_string(),
            },
            None => Outcome::Aborted { output },
        }
    }

    fn command_outcome(&self, result: Result<CommandOutput, SandboxError>) -> Outcome {
        match result {
            Ok(out) if out.success() => Outcome::Complete {
                output: Some(out.output),
            },
            Ok(out) => Outcome::Failed {
                error: format!("Command exited with code {}", out.exit_code),
                output: Some(out.output),
            },
            Err(SandboxError::Cancelled) if self.cancel.is_cancelled() => {
                Outcome::Aborted { output: None }
            }
            Err(e) => Outcome::Failed {
                output: None,
                error: e.to_string(),
            },
        }
    }

    async fn flush_writes(&self, writes: Vec<(String, String)>) {
        for (path, content) in writes {
            if self.is_stopped() {
                debug!(artifact = %self.artifact, path, "Artifact stopped, dropping streamed write");
                continue;
            }
            match self.sandbox.write_file(&path, &content).await {
                Ok(()) => {
                    self.workbench.file_written(path, content).await;
                }
                Err(e) => warn!(artifact = %self.artifact, path, error = %e, "Streamed write failed"),
            }
        }
    }
}

/// Worker draining one artifact's queue in order
async fn run_queue(
    ctx: Arc<QueueContext>,
    mut jobs: mpsc::UnboundedReceiver<Action>,
    writes: mpsc::UnboundedSender<StreamWrite>,
) {
    let mut ready = false;

    while let Some(action) = jobs.recv().await {
        if ctx.is_stopped() {
            ctx.skip(&action.key).await;
            continue;
        }

        if !ready {
            match ctx.wait_ready().await {
                Ok(true) => ready = true,
                Ok(false) => {
                    ctx.skip(&action.key).await;
                    continue;
                }
                Err(e) => {
                    let outcome = Outcome::Failed {
                        output: None,
                        error: e.to_string(),
                    };
                    ctx.settle(&action.key, outcome).await;
                    continue;
                }
            }
        }

        let outcome = ctx.execute(&action, &writes).await;
        ctx.settle(&action.key, outcome).await;
    }

    debug!(artifact = %ctx.artifact, "Artifact queue closed");
}

/// Writer applying streamed file snapshots, latest per path
async fn run_writer(ctx: Arc<QueueContext>, mut writes: mpsc::UnboundedReceiver<StreamWrite>) {
    let mut ready = false;

    while let Some(first) = writes.recv().await {
        let mut batch = vec![first];
        while let Ok(next) = writes.try_recv() {
            batch.push(next);
        }

        if !ready && batch.iter().any(|w| matches!(w, StreamWrite::Write { .. })) {
            match ctx.wait_ready().await {
                Ok(true) => ready = true,
                Ok(false) => {}
                Err(e) => warn!(artifact = %ctx.artifact, error = %e, "Sandbox not ready for streamed writes"),
            }
        }

        let mut pending: Vec<(String, String)> = Vec::new();
        for write in batch {
            match write {
                StreamWrite::Write { path, content } => {
                    match pending.iter_mut().find(|(p, _)| *p == path) {
                        Some(slot) => slot.1 = content,
                        None => pending.push((path, content)),
                    }
                }
                StreamWrite::Barrier(ack) => {
                    if ready {
                        ctx.flush_writes(mem::take(&mut pending)).await;
                    } else {
                        pending.clear();
                    }
                    let _ = ack.send(());
                }
            }
        }

        if ready {
            ctx.flush_writes(pending).await;
        }
    }
}

/// Mirror command output into the terminal and look for preview URLs
async fn forward_output(
    workbench: Arc<Workbench>,
    key: ActionKey,
    mut chunks: mpsc::UnboundedReceiver<String>,
) {
    while let Some(chunk) = chunks.recv().await {
        for preview in detect_previews(&chunk) {
            let (port, url) = (preview.port, preview.base_url.clone());
            if workbench.preview_detected(preview).await {
                info!(action = %key, port, %url, "Preview detected");
            }
        }
        workbench.terminal_output(key.clone(), chunk).await;
    }
}
