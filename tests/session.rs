//! Session Integration Tests
//!
//! Parser events applied to the workbench and runner end to end.

mod common;

use std::sync::Arc;

use common::{Call, ScriptedSandbox};
use forgebench::core::{WorkbenchView, ABORTED_BY_USER, UNCLOSED_ACTION_ERROR};
use forgebench::{ActionKey, ActionStatus, ArtifactKey, ExecutionLimits, Session, Workbench};

fn session() -> (Session, Arc<ScriptedSandbox>) {
    let sandbox = Arc::new(ScriptedSandbox::new());
    let session = Session::new(
        sandbox.clone(),
        Arc::new(Workbench::new()),
        ExecutionLimits::default(),
    );
    (session, sandbox)
}

/// Feed `text` as growing prefixes of `step` bytes
async fn stream(session: &Session, message_id: &str, text: &str, step: usize) -> String {
    let mut display = String::new();
    let mut end = 0;
    while end < text.len() {
        end = (end + step).min(text.len());
        while !text.is_char_boundary(end) {
            end += 1;
        }
        display.push_str(&session.ingest(message_id, &text[..end], end == text.len()).await);
    }
    display
}

const BUILD: &str = r#"Building it.
<artifact id="app" title="App">
<action type="file" path="src/main.js">console.log("hi");
</action>
<action type="shell">npm run dev</action>
<action type="shell">echo http://localhost:5173/</action>
</artifact>
Done."#;

#[tokio::test]
async fn test_streamed_reply_builds_workbench() {
    let (session, sandbox) = session();

    let display = stream(&session, "m1", BUILD, 7).await;
    session.drain().await;

    assert!(display.starts_with("Building it."));
    assert!(display.ends_with("Done."));

    assert_eq!(
        sandbox.file("src/main.js").as_deref(),
        Some("console.log(\"hi\");\n")
    );
    assert_eq!(
        sandbox.commands(),
        vec!["npm run dev", "echo http://localhost:5173/"]
    );

    let snapshot = session.workbench().snapshot().await;
    assert_eq!(snapshot.artifacts.len(), 1);
    let artifact = &snapshot.artifacts[0];
    assert!(artifact.closed);
    assert_eq!(artifact.title, "App");
    assert!(artifact
        .actions
        .iter()
        .all(|a| a.status == ActionStatus::Complete));

    assert!(snapshot.show_workbench);
    assert_eq!(snapshot.selected_file.as_deref(), Some("src/main.js"));
    assert_eq!(snapshot.previews.len(), 1);
    assert_eq!(snapshot.previews[0].port, 5173);
    assert_eq!(snapshot.current_view, WorkbenchView::Preview);
    assert!(snapshot.terminal.contains("ran npm run dev"));
}

#[tokio::test]
async fn test_command_not_run_before_close() {
    let (session, sandbox) = session();
    let text = r#"<artifact id="a" title="T"><action type="shell">rm -rf build && npm run build</action></artifact>"#;
    let close = text.find("</action>").unwrap();

    // Everything up to (not including) the close tag, in small pieces
    let mut end = 0;
    while end < close {
        end = (end + 3).min(close);
        session.ingest("m1", &text[..end], false).await;
        tokio::task::yield_now().await;
        assert!(sandbox.commands().is_empty(), "ran at {}", end);
    }
    assert!(session
        .workbench()
        .action(&ActionKey::new("m1", "a", 0))
        .await
        .is_none());

    session.ingest("m1", text, true).await;
    session.drain().await;
    assert_eq!(sandbox.commands(), vec!["rm -rf build && npm run build"]);
}

#[tokio::test]
async fn test_reset_message_isolates_messages() {
    let (session, sandbox) = session();
    let m_text = r#"<artifact id="a" title="M"><action type="shell">echo m</action></artifact>"#;
    let n_text = r#"<artifact id="b" title="N"><action type="shell">echo n</action></artifact>"#;
    let n_half = &n_text[..n_text.find("echo").unwrap()];

    session.ingest("m", m_text, false).await;
    session.ingest("n", n_half, false).await;

    session.reset_message("m").await;

    // Reparsing m from scratch never re-runs its command
    session.ingest("m", m_text, true).await;
    // n continues from its cursor
    session.ingest("n", n_text, true).await;
    session.drain().await;

    // Different artifacts run independently, in any order
    let mut commands = sandbox.commands();
    commands.sort();
    assert_eq!(commands, vec!["echo m", "echo n"]);

    let snapshot = session.workbench().snapshot().await;
    let keys: Vec<ArtifactKey> = snapshot.artifacts.iter().map(|a| a.key.clone()).collect();
    assert_eq!(keys, vec![ArtifactKey::new("m", "a"), ArtifactKey::new("n", "b")]);
    assert!(snapshot.artifacts.iter().all(|a| a.actions.len() == 1));
}

#[tokio::test]
async fn test_full_reset_and_replay_is_idempotent() {
    let (session, sandbox) = session();

    stream(&session, "m1", BUILD, 11).await;
    session.drain().await;
    let before = session.workbench().snapshot().await;
    let calls_before = sandbox.calls().len();

    session.reset().await;
    let display = session.ingest("m1", BUILD, true).await;
    session.drain().await;

    assert!(display.contains("Building it."));
    let after = session.workbench().snapshot().await;
    assert_eq!(after.artifacts, before.artifacts);
    assert_eq!(sandbox.calls().len(), calls_before);
}

#[tokio::test]
async fn test_unclosed_action_is_aborted_when_stream_ends() {
    let (session, sandbox) = session();
    let text = r#"<artifact id="a" title="T"><action type="file" path="half.txt">only half"#;

    session.ingest("m1", text, true).await;
    session.drain().await;

    let action = session
        .workbench()
        .action(&ActionKey::new("m1", "a", 0))
        .await
        .unwrap();
    assert_eq!(action.status, ActionStatus::Aborted);
    assert_eq!(action.error.as_deref(), Some(UNCLOSED_ACTION_ERROR));
    assert_eq!(action.content, "only half");

    // The streamed part was written; nothing is rolled back
    assert_eq!(sandbox.file("half.txt").as_deref(), Some("only half"));
    assert!(!sandbox.calls().iter().any(|c| matches!(c, Call::Command(_))));
}

#[tokio::test]
async fn test_abort_covers_artifacts_still_streaming() {
    let (session, sandbox) = session();
    let key = ActionKey::new("m1", "a", 0);

    session
        .ingest("m1", r#"<artifact id="a" title="A"><action type="shell">rm -rf bui"#, false)
        .await;
    session.abort_all().await;

    session
        .ingest(
            "m1",
            r#"<artifact id="a" title="A"><action type="shell">rm -rf build</action></artifact>"#,
            true,
        )
        .await;
    // Opened after the abort, so it runs
    session
        .ingest(
            "m2",
            r#"<artifact id="b" title="B"><action type="shell">ls</action></artifact>"#,
            true,
        )
        .await;
    session.drain().await;

    let aborted = session.workbench().action(&key).await.unwrap();
    assert_eq!(aborted.status, ActionStatus::Aborted);
    assert_eq!(aborted.error.as_deref(), Some(ABORTED_BY_USER));
    assert!(session.runner().is_halted(&ArtifactKey::new("m1", "a")).await);

    assert_eq!(sandbox.commands(), vec!["ls".to_string()]);
    assert_eq!(
        session.workbench().status(&ActionKey::new("m2", "b", 0)).await,
        Some(ActionStatus::Complete)
    );
}
