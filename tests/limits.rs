//! Execution Limits Integration Tests
//!
//! Limit configuration and enforcement through the session.

mod common;

use std::sync::Arc;

use common::ScriptedSandbox;
use forgebench::core::LimitViolation;
use forgebench::{ActionKey, ActionStatus, ExecutionLimits, Session, Workbench};

#[test]
fn test_limits_from_yaml() {
    let yaml = r#"
command_timeout_seconds: 30
max_file_bytes: 1024
denylist_patterns:
  - "secrets/**"
"#;

    let limits: ExecutionLimits = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(limits.command_timeout().map(|d| d.as_secs()), Some(30));
    assert_eq!(limits.max_file_bytes, 1024);
    assert!(limits.is_denylisted("secrets/key.pem"));
    // Custom list replaces the defaults
    assert!(!limits.is_denylisted(".git/config"));
}

#[test]
fn test_validate_write() {
    let limits = ExecutionLimits {
        max_file_bytes: 10,
        ..Default::default()
    };

    assert!(limits.validate_write("src/a.txt", "0123456789").is_ok());

    match limits.validate_write("src/a.txt", "0123456789x") {
        Err(LimitViolation::MaxFileBytes { actual, limit, .. }) => {
            assert_eq!(actual, 11);
            assert_eq!(limit, 10);
        }
        other => panic!("Expected MaxFileBytes violation, got {:?}", other),
    }

    assert_eq!(
        limits.validate_write("./.git/HEAD", "ref"),
        Err(LimitViolation::DenylistMatch {
            path: "./.git/HEAD".to_string()
        })
    );
}

#[tokio::test]
async fn test_denylisted_write_fails_and_halts_artifact() {
    let sandbox = Arc::new(ScriptedSandbox::new());
    let session = Session::new(
        sandbox.clone(),
        Arc::new(Workbench::new()),
        ExecutionLimits::default(),
    );

    let text = r#"<artifact id="a" title="T"><action type="file" path=".git/hooks/pre-commit">exit 0</action><action type="shell">git commit -m x</action></artifact>"#;
    session.ingest("m1", text, true).await;
    session.drain().await;

    let write = session
        .workbench()
        .action(&ActionKey::new("m1", "a", 0))
        .await
        .unwrap();
    assert_eq!(write.status, ActionStatus::Failed);
    assert!(write.error.unwrap().contains("denylist"));

    assert_eq!(
        session.workbench().status(&ActionKey::new("m1", "a", 1)).await,
        Some(ActionStatus::Aborted)
    );
    assert!(sandbox.calls().is_empty());
}
