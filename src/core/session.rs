//! Session: feeds streamed message text through the parser and applies the
//! resulting events to the workbench and the action runner, in order.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::domain::{ActionKind, ArtifactKey, ParserEvent};
use crate::parser::{ParserOptions, StreamingMessageParser};
use crate::sandbox::Sandbox;

use super::limits::ExecutionLimits;
use super::runner::ActionRunner;
use super::workbench::Workbench;

/// One chat session: a parser, a workbench and a runner wired together
pub struct Session {
    id: Uuid,
    parser: Mutex<StreamingMessageParser>,
    workbench: Arc<Workbench>,
    runner: ActionRunner,
}

impl Session {
    pub fn new(sandbox: Arc<dyn Sandbox>, workbench: Arc<Workbench>, limits: ExecutionLimits) -> Self {
        Self::with_options(sandbox, workbench, limits, ParserOptions::default())
    }

    pub fn with_options(
        sandbox: Arc<dyn Sandbox>,
        workbench: Arc<Workbench>,
        limits: ExecutionLimits,
        options: ParserOptions,
    ) -> Self {
        let id = workbench
            .journal()
            .map(|j| j.session_id())
            .unwrap_or_else(Uuid::new_v4);

        Self {
            id,
            parser: Mutex::new(StreamingMessageParser::with_options(options)),
            runner: ActionRunner::new(sandbox, Arc::clone(&workbench), limits),
            workbench,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn workbench(&self) -> &Arc<Workbench> {
        &self.workbench
    }

    pub fn runner(&self) -> &ActionRunner {
        &self.runner
    }

    /// Feed the full text of a message received so far.
    ///
    /// Returns the display text produced by this call only. Events are
    /// applied before returning; execution continues in the background.
    #[instrument(skip(self, full_text), fields(session = %self.id, len = full_text.len()))]
    pub async fn ingest(&self, message_id: &str, full_text: &str, is_final: bool) -> String {
        // Held while applying so invocations never interleave
        let mut parser = self.parser.lock().await;
        let output = parser.parse(message_id, full_text, is_final);

        for event in output.events {
            self.apply(event).await;
        }

        if is_final {
            let sealed = self.workbench.seal_message(message_id).await;
            self.runner.forget_streams(&sealed).await;
            info!(message_id, unclosed = sealed.len(), "Message finished");
        }

        output.display
    }

    async fn apply(&self, event: ParserEvent) {
        debug!(event = event.name(), artifact = %event.artifact_key(), "Applying parser event");

        match event {
            ParserEvent::ArtifactOpen {
                message_id,
                artifact_id,
                title,
            } => {
                let key = ArtifactKey::new(message_id, artifact_id);
                self.runner.open_artifact(&key).await;
                self.workbench.add_artifact(key, title).await;
            }
            ParserEvent::ArtifactClose {
                message_id,
                artifact_id,
            } => {
                self.workbench
                    .close_artifact(ArtifactKey::new(message_id, artifact_id))
                    .await;
            }
            ParserEvent::ActionOpen { key, kind, target } => {
                // Commands only appear once their full text is known
                if kind.is_streamable() {
                    self.workbench
                        .add_action(key, kind, target, String::new())
                        .await;
                }
            }
            ParserEvent::ActionUpdate {
                key,
                target,
                offset,
                delta,
                ..
            } => {
                if let Some(target) = &target {
                    self.runner
                        .apply_streamed_content(&key, target, offset, &delta)
                        .await;
                }
                self.workbench.append_content(key, offset, delta).await;
            }
            ParserEvent::ActionClose { action } => {
                self.workbench
                    .add_action(
                        action.key.clone(),
                        action.kind,
                        action.target.clone(),
                        action.content.clone(),
                    )
                    .await;
                if action.kind == ActionKind::File {
                    self.workbench
                        .append_content(action.key.clone(), 0, action.content.clone())
                        .await;
                }
                self.workbench.close_action(action.key.clone()).await;
                self.runner.enqueue(action).await;
            }
        }
    }

    /// Forget all parser state; the next call reparses every message from scratch
    pub async fn reset(&self) {
        self.parser.lock().await.reset();
    }

    /// Forget one message's parser state
    pub async fn reset_message(&self, message_id: &str) {
        self.parser.lock().await.reset_message(message_id);
    }

    pub async fn abort_all(&self) {
        self.runner.abort_all().await;
    }

    /// Wait until every enqueued action has settled
    pub async fn drain(&self) {
        self.runner.drain().await;
    }
}
