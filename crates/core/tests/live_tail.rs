//! Live tailing of append-only JSONL sessions.

mod common;

use std::time::Duration;

use agent_trail_core::stream::{STATUS_COMPLETED, STATUS_EXITED};
use agent_trail_core::types::{ActionType, SessionId, SourceKind, StreamFrame};
use agent_trail_core::ActiveSessionRegistry;
use common::{append, collect, fast_config, finished_status, materialize, next_frame, sources, until_entries};
use pretty_assertions::assert_eq;

const USER: &str = r#"{"type":"user","message":{"role":"user","content":"build it"}}"#;
const TOOL_USE: &str = r#"{"type":"assistant","message":{"id":"m1","content":[{"type":"text","text":"Working."},{"type":"tool_use","id":"t1","name":"Bash","input":{"command":"make"}}]}}"#;
const TOOL_RESULT: &str = r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t1","content":"built"}]}}"#;
const REPLY: &str = r#"{"type":"assistant","message":{"id":"m2","content":[{"type":"text","text":"Done."}]}}"#;

fn command_output(entry: &agent_trail_core::types::NormalizedEntry) -> Option<String> {
    match entry.action() {
        Some(ActionType::CommandRun { result, .. }) => result.as_ref().and_then(|r| r.output.clone()),
        _ => None,
    }
}

#[tokio::test]
async fn appended_records_stream_until_the_session_exits() {
    let home = tempfile::tempdir().unwrap();
    let dir = home.path().join(".claude/projects/-work-app");
    std::fs::create_dir_all(&dir).unwrap();
    let file = dir.join("live.jsonl");
    append(&file, format!("{USER}\n").as_bytes());

    let registry = ActiveSessionRegistry::new();
    let id = SessionId::new(SourceKind::Claude, "-work-app", "live");
    registry.register(id.clone());
    let sources = sources(home.path(), registry.clone(), fast_config());

    let mut stream = sources.open_stream(&id.to_string()).await;
    let mut log = Vec::new();
    until_entries(&mut stream, &mut log, 1).await;
    assert_eq!(log[0].content, "build it");

    append(&file, format!("{TOOL_USE}\n").as_bytes());
    until_entries(&mut stream, &mut log, 3).await;
    assert_eq!(log[1].content, "Working.");
    assert_eq!(command_output(&log[2]), None);

    // A record split across two writes is parsed once, when complete.
    let (head, tail) = TOOL_RESULT.split_at(TOOL_RESULT.len() / 2);
    append(&file, head.as_bytes());
    tokio::time::sleep(Duration::from_millis(200)).await;
    append(&file, format!("{tail}\n").as_bytes());

    while command_output(&log[2]).is_none() {
        let frame = next_frame(&mut stream).await;
        assert!(matches!(frame, StreamFrame::JsonPatch(_)), "unexpected {frame:?}");
        common::apply(&mut log, &frame);
    }
    assert_eq!(command_output(&log[2]).as_deref(), Some("built"));
    assert_eq!(log.len(), 3);

    // Buffered assistant text is flushed when the tail finishes.
    append(&file, format!("{REPLY}\n").as_bytes());
    tokio::time::sleep(Duration::from_millis(200)).await;
    registry.unregister(&id);

    let rest = collect(stream).await;
    assert_eq!(finished_status(&rest), Some(STATUS_EXITED));
    for frame in &rest {
        common::apply(&mut log, frame);
    }
    assert_eq!(log.len(), 4);
    assert_eq!(log[3].content, "Done.");
}

#[tokio::test]
async fn inactive_session_replays_once_and_finishes() {
    let home = tempfile::tempdir().unwrap();
    let dir = home.path().join(".claude/projects/-work-app");
    std::fs::create_dir_all(&dir).unwrap();
    let file = dir.join("done.jsonl");
    append(&file, format!("{USER}\n{TOOL_USE}\n{TOOL_RESULT}\n").as_bytes());

    let sources = sources(home.path(), ActiveSessionRegistry::new(), fast_config());
    let frames = collect(sources.open_stream("claude:-work-app:done").await).await;
    assert_eq!(finished_status(&frames), Some(STATUS_COMPLETED));
    let log = materialize(&frames);
    assert_eq!(log.len(), 3);
    assert_eq!(command_output(&log[2]).as_deref(), Some("built"));
}

#[tokio::test]
async fn completion_marker_ends_a_live_codex_tail() {
    let home = tempfile::tempdir().unwrap();
    let dir = home.path().join(".codex/sessions/2025/05/07");
    std::fs::create_dir_all(&dir).unwrap();
    let uuid = "0196a4a1-8f1c-7d42-9a6b-000000000042";
    let file = dir.join(format!("rollout-2025-05-07T17-24-21-{uuid}.jsonl"));
    append(
        &file,
        format!(
            "{}\n{}\n",
            format_args!(r#"{{"type":"session_meta","payload":{{"id":"{uuid}","cwd":"/work/app"}}}}"#),
            r#"{"type":"event_msg","payload":{"type":"user_message","message":"hello"}}"#
        )
        .as_bytes(),
    );

    let registry = ActiveSessionRegistry::new();
    let id = SessionId::new(SourceKind::Codex, "%2Fwork%2Fapp", uuid);
    registry.register(id.clone());
    let sources = sources(home.path(), registry.clone(), fast_config());

    let mut stream = sources.open_stream(&id.to_string()).await;
    let mut log = Vec::new();
    until_entries(&mut stream, &mut log, 1).await;

    append(
        &file,
        concat!(
            r#"{"type":"event_msg","payload":{"type":"agent_message","message":"bye"}}"#,
            "\n",
            r#"{"type":"event_msg","payload":{"type":"shutdown_complete"}}"#,
            "\n"
        )
        .as_bytes(),
    );

    // Still registered, yet the stream finishes on the marker.
    let rest = collect(stream).await;
    assert_eq!(finished_status(&rest), Some(STATUS_COMPLETED));
    for frame in &rest {
        common::apply(&mut log, frame);
    }
    assert_eq!(log.last().map(|e| e.content.as_str()), Some("bye"));
    assert!(registry.is_active(&id));
}

#[tokio::test]
async fn dropping_the_stream_mid_tail_is_clean() {
    let home = tempfile::tempdir().unwrap();
    let dir = home.path().join(".claude/projects/-work-app");
    std::fs::create_dir_all(&dir).unwrap();
    append(&dir.join("drop.jsonl"), format!("{USER}\n").as_bytes());

    let registry = ActiveSessionRegistry::new();
    let id = SessionId::new(SourceKind::Claude, "-work-app", "drop");
    registry.register(id.clone());
    let sources = sources(home.path(), registry, fast_config());

    let mut stream = sources.open_stream(&id.to_string()).await;
    let mut log = Vec::new();
    until_entries(&mut stream, &mut log, 1).await;
    drop(stream);

    // The directory can be removed once the watcher is gone.
    std::fs::remove_dir_all(&dir).unwrap();
}
