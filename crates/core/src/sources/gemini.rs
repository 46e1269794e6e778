//! Gemini CLI chat recordings.
//!
//! ```text
//! <root>/<sha256(workspace)>/chats/session-2025-09-18T02-45-3b44bc68.json
//! ```
//!
//! Each file is one JSON document that the CLI rewrites after every
//! message, so sessions are streamed by reconciliation: every change
//! re-derives the unit list and only new or changed units are emitted.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use agent_trail_types::{
    ActionType, CommandExitStatus, CommandRunResult, NormalizedEntry, ProjectId, ProjectInfo, SessionId,
    SessionInfo, SourceKind, ToolResult,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::{
    file_name, file_stem, is_safe_key, modified, read_dir_entries, read_json, text_of, SessionLocation,
    SessionSource,
};
use crate::correlate::{set_command_result, set_tool_result};
use crate::discovery::{normalize_timestamp, system_time_to_rfc3339, title_from_message, TitleCache};
use crate::error::{DiscoveryError, StreamError};
use crate::stream::{reconcile_stream, EntryStream, Snapshot, StreamContext, Unit, WatchTarget};
use crate::tools::tool_use_entry;

const CHATS_DIR: &str = "chats";
const SESSION_PREFIX: &str = "session-";

#[derive(Debug, Clone)]
pub struct GeminiSource {
    root: PathBuf,
    summaries: TitleCache<Option<ChatSummary>>,
}

/// What a listing needs from one chat file.
#[derive(Debug, Clone)]
struct ChatSummary {
    session_id: Option<String>,
    title: Option<String>,
    created_at: Option<String>,
    updated_at: Option<String>,
}

/// `sha256(workspace)` as lowercase hex, the CLI's project directory name.
pub fn project_hash(workspace: &Path) -> String {
    hex::encode(Sha256::digest(workspace.to_string_lossy().as_bytes()))
}

fn is_session_file(path: &Path) -> bool {
    super::has_extension(path, "json") && file_name(path).starts_with(SESSION_PREFIX)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatFile {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    start_time: Option<Value>,
    #[serde(default)]
    last_updated: Option<Value>,
    #[serde(default)]
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatMessage {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    timestamp: Option<Value>,
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    content: Value,
    #[serde(default)]
    thoughts: Vec<Thought>,
    #[serde(default)]
    tool_calls: Vec<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct Thought {
    #[serde(default)]
    subject: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    timestamp: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolCall {
    #[serde(default)]
    id: Option<String>,
    name: String,
    #[serde(default)]
    args: Value,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    result_display: Value,
    #[serde(default)]
    timestamp: Option<Value>,
}

impl ChatFile {
    fn summary(&self) -> ChatSummary {
        ChatSummary {
            session_id: self.session_id.clone(),
            title: self.first_user_title(),
            created_at: self.start_time.as_ref().and_then(normalize_timestamp),
            updated_at: self.last_updated.as_ref().and_then(normalize_timestamp),
        }
    }

    fn first_user_title(&self) -> Option<String> {
        self.messages
            .iter()
            .filter(|m| m.kind == "user")
            .find_map(|m| title_from_message(&text_of(&m.content)))
    }
}

async fn read_chat(path: &Path) -> Result<ChatFile, StreamError> {
    let value = read_json(path).await?;
    serde_json::from_value(value).map_err(|e| StreamError::Io {
        path: path.to_path_buf(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
    })
}

impl GeminiSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            summaries: TitleCache::new(),
        }
    }

    fn chats_dir(&self, project_key: &str) -> PathBuf {
        self.root.join(project_key).join(CHATS_DIR)
    }

    async fn session_files(&self, project_key: &str) -> Result<Vec<(PathBuf, std::fs::Metadata)>, DiscoveryError> {
        let mut files: Vec<_> = read_dir_entries(&self.chats_dir(project_key))
            .await?
            .into_iter()
            .filter(|(p, m)| m.is_file() && is_session_file(p))
            .collect();
        files.sort_by_key(|(_, m)| std::cmp::Reverse(modified(m)));
        Ok(files)
    }
}

#[async_trait]
impl SessionSource for GeminiSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Gemini
    }

    async fn list_projects(&self) -> Result<Vec<ProjectInfo>, DiscoveryError> {
        let mut projects = Vec::new();
        for (dir, meta) in read_dir_entries(&self.root).await? {
            if !meta.is_dir() {
                continue;
            }
            let key = file_name(&dir);
            let files = self.session_files(&key).await?;
            if files.is_empty() {
                continue;
            }
            // The directory name is a one-way hash of the workspace path.
            let display_name = key.chars().take(12).collect();
            projects.push(ProjectInfo {
                id: ProjectId::new(SourceKind::Gemini, key),
                source: SourceKind::Gemini,
                display_name,
                path: None,
                location: dir.to_string_lossy().into_owned(),
                updated_at: files.iter().filter_map(|(_, m)| modified(m)).max().map(system_time_to_rfc3339),
                session_count: files.len(),
            });
        }
        projects.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(projects)
    }

    async fn list_sessions(&self, project_key: &str) -> Result<Vec<SessionInfo>, DiscoveryError> {
        if !is_safe_key(project_key) {
            return Ok(Vec::new());
        }
        let mut sessions = Vec::new();
        for (path, meta) in self.session_files(project_key).await? {
            let Some(mtime) = modified(&meta) else { continue };
            let load = || async {
                match read_chat(&path).await {
                    Ok(chat) => Some(chat.summary()),
                    Err(e) => {
                        tracing::debug!(path = %path.display(), error = %e, "Skipping unreadable chat file");
                        None
                    }
                }
            };
            let Some(summary) = self.summaries.get_or_load_at(&path, mtime, load).await else {
                continue;
            };
            let Some(key) = summary.session_id.or_else(|| file_stem(&path)) else {
                continue;
            };
            let mut info = SessionInfo::new(
                SessionId::new(SourceKind::Gemini, project_key, key),
                path.to_string_lossy(),
            );
            info.title = summary.title;
            info.created_at = summary.created_at;
            info.updated_at = summary
                .updated_at
                .or_else(|| Some(system_time_to_rfc3339(mtime)));
            sessions.push(info);
        }
        Ok(sessions)
    }

    async fn locate(&self, session: &SessionId) -> Result<SessionLocation, StreamError> {
        if !is_safe_key(&session.project_key) || !is_safe_key(&session.session_key) {
            return Err(StreamError::not_found(session.to_string()));
        }
        let mut files = self
            .session_files(&session.project_key)
            .await
            .map_err(|_| StreamError::not_found(session.to_string()))?;

        // File names embed the first 8 characters of the session id.
        let short: String = session.session_key.chars().take(8).collect();
        files.sort_by_key(|(p, _)| !file_name(p).contains(&short));

        for (path, _) in files {
            if file_stem(&path).as_deref() == Some(session.session_key.as_str()) {
                return Ok(self.location(session, path));
            }
            let Ok(chat) = read_chat(&path).await else { continue };
            if chat.session_id.as_deref() == Some(session.session_key.as_str()) {
                return Ok(self.location(session, path));
            }
        }
        Err(StreamError::not_found(session.to_string()))
    }

    fn open_stream(&self, location: SessionLocation, ctx: StreamContext) -> EntryStream {
        let target = WatchTarget::File(location.path.clone());
        reconcile_stream(GeminiSnapshot { path: location.path }, target, ctx)
    }

    async fn project_key_for(&self, workspace: &Path) -> String {
        project_hash(workspace)
    }

    fn scrape_session_id(&self, line: &str) -> Option<String> {
        super::scrape_init_line(line)
    }

    async fn find_recent_session(&self, workspace: &Path, since: SystemTime) -> Option<SessionLocation> {
        let project_key = project_hash(workspace);
        let (path, _) = super::newest_since(&self.chats_dir(&project_key), since, is_session_file).await?;
        let session_key = match read_chat(&path).await {
            Ok(chat) => chat.session_id,
            Err(_) => None,
        }
        .or_else(|| file_stem(&path))?;
        Some(SessionLocation {
            project_key,
            session_key,
            path,
        })
    }
}

impl GeminiSource {
    fn location(&self, session: &SessionId, path: PathBuf) -> SessionLocation {
        SessionLocation {
            project_key: session.project_key.clone(),
            session_key: session.session_key.clone(),
            path,
        }
    }
}

/// Re-reads one chat file into units.
#[derive(Debug, Clone)]
pub struct GeminiSnapshot {
    pub path: PathBuf,
}

#[async_trait]
impl Snapshot for GeminiSnapshot {
    async fn snapshot(&self) -> Result<Vec<Unit>, StreamError> {
        let chat = read_chat(&self.path).await?;
        Ok(chat_units(&chat))
    }
}

/// Units in display order: per message its thoughts, then its text, then
/// its tool calls.
fn chat_units(chat: &ChatFile) -> Vec<Unit> {
    let mut units = Vec::new();
    for (position, message) in chat.messages.iter().enumerate() {
        let id = message.id.clone().unwrap_or_else(|| position.to_string());
        let timestamp = message.timestamp.as_ref().and_then(normalize_timestamp);

        for (i, thought) in message.thoughts.iter().enumerate() {
            let text = match (thought.subject.trim(), thought.description.trim()) {
                ("", d) => d.to_string(),
                (s, "") => s.to_string(),
                (s, d) => format!("{s}\n\n{d}"),
            };
            if text.is_empty() {
                continue;
            }
            let ts = thought
                .timestamp
                .as_ref()
                .and_then(normalize_timestamp)
                .or_else(|| timestamp.clone());
            units.push(Unit::new(
                format!("{id}:thought:{i}"),
                NormalizedEntry::thinking(text).with_timestamp(ts),
            ));
        }

        let text = text_of(&message.content);
        let text = text.trim();
        if !text.is_empty() {
            let entry = match message.kind.as_str() {
                "user" => Some(NormalizedEntry::user(text)),
                "gemini" | "model" | "assistant" => Some(NormalizedEntry::assistant(text)),
                "info" | "warning" => Some(NormalizedEntry::system(text)),
                "error" => Some(NormalizedEntry::error(text)),
                other => {
                    tracing::debug!(kind = other, "Skipping message of unknown type");
                    None
                }
            };
            if let Some(entry) = entry {
                units.push(Unit::new(format!("{id}:content"), entry.with_timestamp(timestamp.clone())));
            }
        }

        for (j, raw) in message.tool_calls.iter().enumerate() {
            let call = match ToolCall::deserialize(raw) {
                Ok(call) => call,
                Err(e) => {
                    tracing::debug!(error = %e, "Skipping malformed tool call");
                    continue;
                }
            };
            let key = format!("{id}:tool:{}", call.id.clone().unwrap_or_else(|| j.to_string()));
            let ts = call
                .timestamp
                .as_ref()
                .and_then(normalize_timestamp)
                .or_else(|| timestamp.clone());
            let mut entry = tool_use_entry(&call.name, &call.args, None)
                .with_timestamp(ts)
                .with_metadata(raw.clone());
            fold_tool_result(&mut entry, &call);
            units.push(Unit::new(key, entry));
        }
    }
    units
}

/// Fold a finished call's outcome into its entry. Calls still scheduled or
/// executing are left as placeholders.
fn fold_tool_result(entry: &mut NormalizedEntry, call: &ToolCall) {
    let success = match call.status.as_deref() {
        Some("success") => true,
        Some("error" | "cancelled") => false,
        _ => return,
    };
    let display = match &call.result_display {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    };

    match entry.action() {
        Some(ActionType::CommandRun { .. }) => {
            set_command_result(
                entry,
                CommandRunResult {
                    exit_status: Some(CommandExitStatus::Success { success }),
                    output: display,
                },
            );
        }
        Some(ActionType::Tool { .. }) => {
            let result = match display {
                Some(text) => ToolResult::markdown(text),
                None if !call.result_display.is_null() => ToolResult::json(call.result_display.clone()),
                None => ToolResult::json(call.result.clone()),
            };
            set_tool_result(entry, result);
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::PatchEmitter;
    use crate::stream::Reconciler;
    use agent_trail_types::{EntryType, PatchOp};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn chat(messages: Value) -> ChatFile {
        serde_json::from_value(json!({
            "sessionId": "3b44bc68-1111-2222-3333-444455556666",
            "projectHash": "abc",
            "startTime": "2025-09-18T02:45:00.000Z",
            "lastUpdated": "2025-09-18T02:46:00.000Z",
            "messages": messages,
        }))
        .unwrap()
    }

    #[test]
    fn units_per_message() {
        let chat = chat(json!([
            {"id": "u1", "timestamp": "2025-09-18T02:45:01Z", "type": "user", "content": "List files"},
            {"id": "g1", "timestamp": "2025-09-18T02:45:02Z", "type": "gemini", "content": "Sure.",
             "thoughts": [{"subject": "Planning", "description": "Use ls", "timestamp": "2025-09-18T02:45:02Z"}],
             "toolCalls": [{"id": "c1", "name": "run_shell_command", "args": {"command": "ls"},
                            "status": "success", "resultDisplay": "a.txt\nb.txt"}]},
            {"id": "e1", "type": "error", "content": "Quota exceeded"}
        ]));
        let units = chat_units(&chat);
        let keys: Vec<_> = units.iter().map(|u| u.key.as_str()).collect();
        assert_eq!(keys, vec!["u1:content", "g1:thought:0", "g1:content", "g1:tool:c1", "e1:content"]);

        assert_eq!(units[1].entry.content, "Planning\n\nUse ls");
        match units[3].entry.action() {
            Some(ActionType::CommandRun {
                command,
                result: Some(result),
            }) => {
                assert_eq!(command, "ls");
                assert_eq!(result.output.as_deref(), Some("a.txt\nb.txt"));
                assert_eq!(result.exit_status, Some(CommandExitStatus::Success { success: true }));
            }
            other => panic!("unexpected action: {other:?}"),
        }
        assert_eq!(units[4].entry.entry_type, EntryType::ErrorMessage);
    }

    #[test]
    fn growing_file_emits_only_deltas() {
        let mut emitter = PatchEmitter::new();
        let mut reconciler = Reconciler::new();

        let first = chat(json!([
            {"id": "g1", "type": "gemini", "content": "",
             "toolCalls": [{"id": "c1", "name": "run_shell_command", "args": {"command": "ls"}, "status": "executing"}]}
        ]));
        reconciler.apply(chat_units(&first), &mut emitter);
        let ops = emitter.drain();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].op, PatchOp::Add);

        let second = chat(json!([
            {"id": "g1", "type": "gemini", "content": "",
             "toolCalls": [{"id": "c1", "name": "run_shell_command", "args": {"command": "ls"},
                            "status": "success", "resultDisplay": "a.txt"}]},
            {"id": "g2", "type": "gemini", "content": "Done."}
        ]));
        reconciler.apply(chat_units(&second), &mut emitter);
        let ops = emitter.drain();
        let shape: Vec<_> = ops.iter().map(|op| (op.op, op.index())).collect();
        assert_eq!(shape, vec![(PatchOp::Replace, Some(0)), (PatchOp::Add, Some(1))]);

        reconciler.apply(chat_units(&second), &mut emitter);
        assert!(emitter.is_empty());
    }

    #[test]
    fn content_parts_and_generic_tools() {
        let chat = chat(json!([
            {"id": "u1", "type": "user", "content": [{"text": "read"}, {"text": "this"}]},
            {"id": "g1", "type": "gemini", "content": "",
             "toolCalls": [{"id": "c2", "name": "save_memory", "args": {"fact": "x"},
                            "status": "error", "result": [{"functionResponse": {"response": {"error": "denied"}}}]}]}
        ]));
        let units = chat_units(&chat);
        assert_eq!(units[0].entry.content, "read\nthis");
        match units[1].entry.action() {
            Some(ActionType::Tool { result: Some(result), .. }) => {
                assert_eq!(result.value[0]["functionResponse"]["response"]["error"], "denied");
            }
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[tokio::test]
    async fn lists_locates_and_finds_recent() {
        let tmp = tempfile::tempdir().unwrap();
        let workspace = Path::new("/work/app");
        let hash = project_hash(workspace);
        let chats = tmp.path().join(&hash).join(CHATS_DIR);
        std::fs::create_dir_all(&chats).unwrap();
        let body = json!({
            "sessionId": "3b44bc68-1111-2222-3333-444455556666",
            "startTime": "2025-09-18T02:45:00.000Z",
            "lastUpdated": "2025-09-18T02:46:00.000Z",
            "messages": [{"id": "u1", "type": "user", "content": "Explain   this repo"}]
        });
        std::fs::write(chats.join("session-2025-09-18T02-45-3b44bc68.json"), body.to_string()).unwrap();

        let source = GeminiSource::new(tmp.path());
        let projects = source.list_projects().await.unwrap();
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].id.key, hash);

        let sessions = source.list_sessions(&hash).await.unwrap();
        assert_eq!(sessions[0].id.session_key, "3b44bc68-1111-2222-3333-444455556666");
        assert_eq!(sessions[0].title.as_deref(), Some("Explain this repo"));
        assert_eq!(sessions[0].created_at.as_deref(), Some("2025-09-18T02:45:00.000Z"));

        let location = source.locate(&sessions[0].id).await.unwrap();
        assert!(file_name(&location.path).contains("3b44bc68"));

        let since = SystemTime::now() - std::time::Duration::from_secs(60);
        let recent = source.find_recent_session(workspace, since).await.unwrap();
        assert_eq!(recent.session_key, "3b44bc68-1111-2222-3333-444455556666");
    }

    #[tokio::test]
    async fn listing_reparses_only_changed_files() {
        let tmp = tempfile::tempdir().unwrap();
        let chats = tmp.path().join("h").join(CHATS_DIR);
        std::fs::create_dir_all(&chats).unwrap();
        let file = chats.join("session-2025-09-18T02-45-aaaa.json");
        let write = |title: &str| {
            let body = json!({"sessionId": "aaaa", "messages": [{"type": "user", "content": title}]});
            std::fs::write(&file, body.to_string()).unwrap();
        };
        let set_mtime = |at: SystemTime| {
            std::fs::File::options().write(true).open(&file).unwrap().set_modified(at).unwrap();
        };

        let t0 = SystemTime::now() - std::time::Duration::from_secs(600);
        write("first title");
        set_mtime(t0);
        let source = GeminiSource::new(tmp.path());
        assert_eq!(source.list_sessions("h").await.unwrap()[0].title.as_deref(), Some("first title"));

        // Same mtime: the cached summary is served without reading the file.
        write("second title");
        set_mtime(t0);
        assert_eq!(source.list_sessions("h").await.unwrap()[0].title.as_deref(), Some("first title"));

        set_mtime(t0 + std::time::Duration::from_secs(1));
        assert_eq!(source.list_sessions("h").await.unwrap()[0].title.as_deref(), Some("second title"));
    }

    #[test]
    fn project_hash_is_sha256_hex() {
        assert_eq!(
            project_hash(Path::new("")),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
