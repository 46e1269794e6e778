//! Launching agent subprocesses and resolving their session ids.
#![cfg(unix)]

mod common;

use std::time::Duration;

use agent_trail_core::launcher::PLACEHOLDER_PREFIX;
use agent_trail_core::sources::claude::encode_workspace;
use agent_trail_core::stream::STATUS_EXITED;
use agent_trail_core::types::{EntryType, SourceKind};
use agent_trail_core::{
    ActiveSessionRegistry, CommandSpec, ExecutionLauncher, LaunchConfig, LaunchRequest, Resolution,
};
use common::{collect, fast_config, finished_status, materialize, sources};
use pretty_assertions::assert_eq;

fn launch_config(timeout: Duration) -> LaunchConfig {
    LaunchConfig {
        resolution_timeout: timeout,
        probe_interval: Duration::from_millis(50),
        staleness_window: Duration::from_secs(5),
    }
}

#[tokio::test]
async fn filesystem_evidence_resolves_and_streams_under_the_placeholder() {
    let home = tempfile::tempdir().unwrap();
    let workspace = tempfile::tempdir().unwrap();
    let project_dir = home
        .path()
        .join(".claude/projects")
        .join(encode_workspace(workspace.path()));
    let session_file = project_dir.join("fs-session.jsonl");

    let registry = ActiveSessionRegistry::new();
    let sources = sources(home.path(), registry.clone(), fast_config());
    let launcher = ExecutionLauncher::new(sources.clone(), launch_config(Duration::from_secs(30)));

    // The agent prints nothing useful; its transcript shows up after 200ms.
    let script = r#"sleep 0.2
mkdir -p "$(dirname "$TRAIL_FILE")"
printf '%s\n' '{"type":"user","message":{"role":"user","content":"hello agent"}}' > "$TRAIL_FILE"
echo "agent banner"
sleep 1"#;
    let command = CommandSpec::new("sh")
        .arg("-c")
        .arg(script)
        .env("TRAIL_FILE", session_file.to_string_lossy());

    let launched = launcher
        .launch(LaunchRequest {
            source: SourceKind::Claude,
            workspace: workspace.path().to_path_buf(),
            command,
            resume: None,
        })
        .await
        .unwrap();

    match &launched.resolved_by {
        Some(Resolution::Filesystem(location)) => assert_eq!(location.session_key, "fs-session"),
        other => panic!("expected filesystem resolution, got {other:?}"),
    }
    assert_eq!(launched.session_id.session_key, "fs-session");
    assert!(launched.placeholder_id.session_key.starts_with(PLACEHOLDER_PREFIX));
    assert!(registry.is_active(&launched.session_id));

    // A viewer that only knows the placeholder follows the rekey.
    let stream = sources.open_stream(&launched.placeholder_id.to_string()).await;
    let frames = collect(stream).await;
    assert_eq!(finished_status(&frames), Some(STATUS_EXITED));
    let log = materialize(&frames);
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].entry_type, EntryType::UserMessage);
    assert_eq!(log[0].content, "hello agent");

    launched.wait().await;
    assert!(registry.is_empty());
}

#[tokio::test]
async fn timeout_keeps_the_placeholder_listed_as_running() {
    let home = tempfile::tempdir().unwrap();
    let workspace = tempfile::tempdir().unwrap();
    let registry = ActiveSessionRegistry::new();
    let sources = sources(home.path(), registry.clone(), fast_config());
    let launcher = ExecutionLauncher::new(sources.clone(), launch_config(Duration::from_millis(300)));

    let launched = launcher
        .launch(LaunchRequest {
            source: SourceKind::Claude,
            workspace: workspace.path().to_path_buf(),
            command: CommandSpec::new("sh").arg("-c").arg("sleep 5"),
            resume: None,
        })
        .await
        .unwrap();

    assert_eq!(launched.resolved_by, Some(Resolution::Timeout));
    assert_eq!(launched.session_id, launched.placeholder_id);
    assert!(launched.pid.is_some());

    let project_id = launched.session_id.project().to_string();
    let sessions = sources.list_sessions(&project_id).await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].id, launched.placeholder_id);
    assert!(sessions[0].running);

    launched.cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), launched.wait())
        .await
        .unwrap();
    assert!(registry.is_empty());
}

#[tokio::test]
async fn unknown_program_is_a_hard_failure() {
    let home = tempfile::tempdir().unwrap();
    let registry = ActiveSessionRegistry::new();
    let launcher = ExecutionLauncher::new(
        sources(home.path(), registry.clone(), fast_config()),
        launch_config(Duration::from_secs(1)),
    );

    let result = launcher
        .launch(LaunchRequest {
            source: SourceKind::Gemini,
            workspace: home.path().to_path_buf(),
            command: CommandSpec::new("agent-trail-no-such-binary"),
            resume: None,
        })
        .await;
    assert!(result.is_err());
    assert!(registry.is_empty());
}
