//! Action Runner Integration Tests
//!
//! Per-artifact ordering, fail-fast, abort, timeout and sandbox readiness.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{wait_for_status, Call, ScriptedSandbox};
use forgebench::core::{ABORTED_BY_USER, SKIPPED_AFTER_FAILURE};
use forgebench::{
    Action, ActionKey, ActionKind, ActionRunner, ActionStatus, ArtifactKey, ExecutionLimits,
    Workbench,
};

struct Harness {
    sandbox: Arc<ScriptedSandbox>,
    workbench: Arc<Workbench>,
    runner: ActionRunner,
}

impl Harness {
    fn new(sandbox: ScriptedSandbox, limits: ExecutionLimits) -> Self {
        let sandbox = Arc::new(sandbox);
        let workbench = Arc::new(Workbench::new());
        let runner = ActionRunner::new(sandbox.clone(), workbench.clone(), limits);
        Self {
            sandbox,
            workbench,
            runner,
        }
    }

    /// Register and enqueue a shell action
    async fn shell(&self, artifact: &str, index: usize, command: &str) -> ActionKey {
        let key = ActionKey::new("m1", artifact, index);
        self.workbench
            .add_artifact(key.artifact(), artifact.to_string())
            .await;
        self.workbench
            .add_action(key.clone(), ActionKind::Shell, None, command.to_string())
            .await;
        self.runner
            .enqueue(Action {
                key: key.clone(),
                kind: ActionKind::Shell,
                target: None,
                content: command.to_string(),
            })
            .await;
        key
    }

    async fn status(&self, key: &ActionKey) -> Option<ActionStatus> {
        self.workbench.status(key).await
    }
}

#[tokio::test]
async fn test_actions_run_in_declaration_order() {
    let h = Harness::new(ScriptedSandbox::new(), ExecutionLimits::default());

    for (i, command) in ["one", "two", "three"].iter().enumerate() {
        h.shell("a", i, command).await;
    }
    h.runner.drain().await;

    assert_eq!(h.sandbox.commands(), vec!["one", "two", "three"]);
}

#[tokio::test]
async fn test_failure_halts_only_its_artifact() {
    let h = Harness::new(ScriptedSandbox::new(), ExecutionLimits::default());

    let first = h.shell("a", 0, "echo ok").await;
    let second = h.shell("a", 1, "fail here").await;
    let third = h.shell("a", 2, "echo never").await;
    let other = h.shell("b", 0, "echo other").await;
    h.runner.drain().await;

    assert_eq!(h.status(&first).await, Some(ActionStatus::Complete));
    assert_eq!(h.status(&second).await, Some(ActionStatus::Failed));
    assert_eq!(h.status(&other).await, Some(ActionStatus::Complete));

    let skipped = h.workbench.action(&third).await.unwrap();
    assert_eq!(skipped.status, ActionStatus::Aborted);
    assert_eq!(skipped.error.as_deref(), Some(SKIPPED_AFTER_FAILURE));
    assert!(!h.sandbox.commands().contains(&"echo never".to_string()));

    // Output of the failed command is surfaced
    let failed = h.workbench.action(&second).await.unwrap();
    assert_eq!(failed.output.as_deref(), Some("boom\n"));
}

#[tokio::test]
async fn test_actions_enqueued_after_failure_are_aborted() {
    let h = Harness::new(ScriptedSandbox::new(), ExecutionLimits::default());

    let failing = h.shell("a", 0, "fail early").await;
    wait_for_status(&h.workbench, &failing, ActionStatus::Failed).await;

    let late = h.shell("a", 1, "echo late").await;
    h.runner.drain().await;

    assert_eq!(h.status(&late).await, Some(ActionStatus::Aborted));
    assert!(h.runner.is_halted(&ArtifactKey::new("m1", "a")).await);
}

#[tokio::test]
async fn test_abort_all_cancels_running_and_queued() {
    let h = Harness::new(ScriptedSandbox::new(), ExecutionLimits::default());

    let running = h.shell("a", 0, "sleep 30").await;
    let queued = h.shell("a", 1, "echo queued").await;
    wait_for_status(&h.workbench, &running, ActionStatus::Running).await;

    h.runner.abort_all().await;
    h.runner.drain().await;

    let aborted = h.workbench.action(&running).await.unwrap();
    assert_eq!(aborted.status, ActionStatus::Aborted);
    assert_eq!(aborted.error.as_deref(), Some(ABORTED_BY_USER));
    assert_eq!(h.status(&queued).await, Some(ActionStatus::Aborted));
    assert!(h.sandbox.calls().contains(&Call::Cancel));
    assert!(!h.sandbox.commands().contains(&"echo queued".to_string()));

    // Artifacts opened afterwards run normally
    let fresh = h.shell("b", 0, "echo fresh").await;
    h.runner.drain().await;
    assert_eq!(h.status(&fresh).await, Some(ActionStatus::Complete));
}

#[tokio::test]
async fn test_command_timeout_fails_action() {
    let limits = ExecutionLimits {
        command_timeout_seconds: Some(1),
        ..Default::default()
    };
    let h = Harness::new(ScriptedSandbox::new(), limits);

    let slow = h.shell("a", 0, "sleep 30").await;
    let after = h.shell("a", 1, "echo after").await;

    tokio::time::timeout(Duration::from_secs(10), h.runner.drain())
        .await
        .expect("drain should finish after the timeout");

    let timed_out = h.workbench.action(&slow).await.unwrap();
    assert_eq!(timed_out.status, ActionStatus::Failed);
    assert_eq!(timed_out.error.as_deref(), Some("Command timed out after 1s"));
    assert_eq!(h.status(&after).await, Some(ActionStatus::Aborted));
}

#[tokio::test]
async fn test_actions_wait_for_sandbox() {
    let (sandbox, gate) = ScriptedSandbox::gated();
    let h = Harness::new(sandbox, ExecutionLimits::default());

    let key = h.shell("a", 0, "echo booted").await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(h.status(&key).await, Some(ActionStatus::Pending));
    assert!(h.sandbox.commands().is_empty());

    gate.send(true).unwrap();
    wait_for_status(&h.workbench, &key, ActionStatus::Complete).await;
    assert_eq!(h.sandbox.commands(), vec!["echo booted"]);
}

#[tokio::test]
async fn test_abort_while_waiting_for_sandbox() {
    let (sandbox, _gate) = ScriptedSandbox::gated();
    let h = Harness::new(sandbox, ExecutionLimits::default());

    let key = h.shell("a", 0, "echo never").await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    h.runner.abort_all().await;
    h.runner.drain().await;

    assert_eq!(h.status(&key).await, Some(ActionStatus::Aborted));
    assert!(h.sandbox.commands().is_empty());
}

#[tokio::test]
async fn test_large_file_fails_on_limit() {
    let limits = ExecutionLimits {
        max_file_bytes: 4,
        ..Default::default()
    };
    let h = Harness::new(ScriptedSandbox::new(), limits);

    let key = ActionKey::new("m1", "a", 0);
    h.workbench.add_artifact(key.artifact(), "a".to_string()).await;
    h.workbench
        .add_action(key.clone(), ActionKind::File, Some("big.txt".to_string()), String::new())
        .await;
    h.runner
        .enqueue(Action {
            key: key.clone(),
            kind: ActionKind::File,
            target: Some("big.txt".to_string()),
            content: "too large".to_string(),
        })
        .await;
    h.runner.drain().await;

    let action = h.workbench.action(&key).await.unwrap();
    assert_eq!(action.status, ActionStatus::Failed);
    assert!(action.error.unwrap().contains("exceeds maximum size"));
    assert_eq!(h.sandbox.file("big.txt"), None);
}
