//! Shared test helpers: a scripted in-memory sandbox.
//!
//! Commands are interpreted by prefix:
//! - `fail ...` exits with code 1
//! - `sleep ...` runs until cancelled
//! - anything else echoes `ran <command>` and exits 0

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use forgebench::sandbox::{CommandHandle, CommandOutput, OutputSink, Sandbox, SandboxError};
use forgebench::{ActionKey, ActionStatus, Workbench};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// One operation the sandbox received
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Write { path: String, content: String },
    Command(String),
    Cancel,
}

pub struct ScriptedSandbox {
    calls: Mutex<Vec<Call>>,
    running: Mutex<HashMap<CommandHandle, CancellationToken>>,
    ready: Option<watch::Receiver<bool>>,
}

impl ScriptedSandbox {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            running: Mutex::new(HashMap::new()),
            ready: None,
        }
    }

    /// A sandbox that is not ready until `true` is sent
    pub fn gated() -> (Self, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let sandbox = Self {
            ready: Some(rx),
            ..Self::new()
        };
        (sandbox, tx)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Command(command) => Some(command),
                _ => None,
            })
            .collect()
    }

    /// Last content written to a path
    pub fn file(&self, path: &str) -> Option<String> {
        self.calls().into_iter().rev().find_map(|c| match c {
            Call::Write { path: p, content } if p == path => Some(content),
            _ => None,
        })
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Sandbox for ScriptedSandbox {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn ready(&self) -> Result<(), SandboxError> {
        if let Some(ready) = &self.ready {
            let mut ready = ready.clone();
            ready
                .wait_for(|r| *r)
                .await
                .map_err(|_| SandboxError::Unavailable("gate dropped".to_string()))?;
        }
        Ok(())
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError> {
        self.record(Call::Write {
            path: path.to_string(),
            content: content.to_string(),
        });
        Ok(())
    }

    async fn run_command(
        &self,
        handle: CommandHandle,
        command: &str,
        output: OutputSink,
    ) -> Result<CommandOutput, SandboxError> {
        self.record(Call::Command(command.to_string()));

        if command.starts_with("fail") {
            let _ = output.send("boom\n".to_string());
            return Ok(CommandOutput::new(1, "boom\n"));
        }

        if command.starts_with("sleep") {
            let token = CancellationToken::new();
            self.running.lock().unwrap().insert(handle, token.clone());
            let _ = output.send("sleeping\n".to_string());
            token.cancelled().await;
            return Err(SandboxError::Cancelled);
        }

        let line = format!("ran {}\n", command);
        let _ = output.send(line.clone());
        Ok(CommandOutput::new(0, line))
    }

    async fn cancel(&self, handle: CommandHandle) -> Result<(), SandboxError> {
        self.record(Call::Cancel);
        if let Some(token) = self.running.lock().unwrap().remove(&handle) {
            token.cancel();
        }
        Ok(())
    }
}

/// Poll until an action reaches `status`, failing after a few seconds
pub async fn wait_for_status(workbench: &Workbench, key: &ActionKey, status: ActionStatus) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if workbench.status(key).await == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;

    assert!(
        waited.is_ok(),
        "{} never reached {}, last seen {:?}",
        key,
        status,
        workbench.status(key).await
    );
}
