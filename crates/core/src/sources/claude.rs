//! Claude Code sessions.
//!
//! ```text
//! <root>/<encoded-workspace>/<session-uuid>.jsonl
//! ```
//!
//! The encoded workspace is the absolute path with `/` and `.` replaced by
//! `-`. Each line is one record; the interesting fields sit either at the
//! top level or under `message`:
//!
//! ```json
//! {"type":"user","message":{"role":"user","content":"..."},"isMeta":false}
//! {"type":"assistant","message":{"id":"msg_1","content":[{"type":"tool_use",...}]}}
//! ```

use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::SystemTime;

use agent_trail_types::{
    ActionType, CommandExitStatus, CommandRunResult, NormalizedEntry, ProjectId, ProjectInfo, SessionId,
    SessionInfo, SourceKind, ToolResult,
};
use async_trait::async_trait;
use regex_lite::Regex;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::AsyncBufReadExt;

use super::{
    file_name, file_stem, has_extension, is_safe_key, modified, parse_record, read_dir_entries, text_of,
    SessionLocation, SessionSource,
};
use crate::correlate::{set_command_result, set_tool_result, CallTracker, TextBuffer, TextKind};
use crate::discovery::{decode_dashed_path, system_time_to_rfc3339, title_from_message, TitleCache};
use crate::error::{DiscoveryError, StreamError};
use crate::patch::PatchEmitter;
use crate::stream::{jsonl_stream, EntryStream, RecordConverter, StreamContext};
use crate::tools::tool_use_entry;

static COMMAND_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<command-name>(.*?)</command-name>").expect("static regex"));
static COMMAND_ARGS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<command-args>(.*?)</command-args>").expect("static regex"));
static COMMAND_STDOUT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<local-command-stdout>(.*?)</local-command-stdout>").expect("static regex")
});
static ANY_TAG_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<(command-message|system-reminder|local-command-stderr)>.*?</(command-message|system-reminder|local-command-stderr)>")
        .expect("static regex")
});

#[derive(Debug, Clone)]
pub struct ClaudeSource {
    root: PathBuf,
    titles: TitleCache,
}

impl ClaudeSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            titles: TitleCache::new(),
        }
    }

    fn session_path(&self, project_key: &str, session_key: &str) -> PathBuf {
        self.root.join(project_key).join(format!("{session_key}.jsonl"))
    }

    async fn title_for(&self, path: &Path) -> Option<String> {
        self.titles.get_or_load(path, || first_user_message(path)).await
    }
}

/// `/Users/me/app` → `-Users-me-app`
pub fn encode_workspace(workspace: &Path) -> String {
    workspace.to_string_lossy().replace(['/', '.'], "-")
}

#[async_trait]
impl SessionSource for ClaudeSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Claude
    }

    async fn list_projects(&self) -> Result<Vec<ProjectInfo>, DiscoveryError> {
        let mut projects = Vec::new();
        for (dir, meta) in read_dir_entries(&self.root).await? {
            if !meta.is_dir() {
                continue;
            }
            let key = file_name(&dir);
            let sessions: Vec<_> = read_dir_entries(&dir)
                .await?
                .into_iter()
                .filter(|(p, m)| m.is_file() && has_extension(p, "jsonl"))
                .collect();
            if sessions.is_empty() {
                continue;
            }
            let updated = sessions.iter().filter_map(|(_, m)| modified(m)).max();
            let resolved = decode_dashed_path(&key);
            projects.push(ProjectInfo {
                id: ProjectId::new(SourceKind::Claude, key),
                source: SourceKind::Claude,
                display_name: resolved.display_name,
                path: Some(resolved.full_path),
                location: dir.to_string_lossy().into_owned(),
                updated_at: updated.map(system_time_to_rfc3339),
                session_count: sessions.len(),
            });
        }
        projects.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(projects)
    }

    async fn list_sessions(&self, project_key: &str) -> Result<Vec<SessionInfo>, DiscoveryError> {
        if !is_safe_key(project_key) {
            return Ok(Vec::new());
        }
        let dir = self.root.join(project_key);
        let mut files: Vec<_> = read_dir_entries(&dir)
            .await?
            .into_iter()
            .filter(|(p, m)| m.is_file() && has_extension(p, "jsonl"))
            .collect();
        files.sort_by_key(|(_, m)| std::cmp::Reverse(modified(m)));

        let mut sessions = Vec::with_capacity(files.len());
        for (path, meta) in files {
            let Some(key) = file_stem(&path) else { continue };
            let id = SessionId::new(SourceKind::Claude, project_key, key);
            let mut info = SessionInfo::new(id, path.to_string_lossy());
            info.title = self.title_for(&path).await;
            info.created_at = meta.created().ok().map(system_time_to_rfc3339);
            info.updated_at = modified(&meta).map(system_time_to_rfc3339);
            sessions.push(info);
        }
        Ok(sessions)
    }

    async fn locate(&self, session: &SessionId) -> Result<SessionLocation, StreamError> {
        if !is_safe_key(&session.project_key) || !is_safe_key(&session.session_key) {
            return Err(StreamError::not_found(session.to_string()));
        }
        let path = self.session_path(&session.project_key, &session.session_key);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(SessionLocation {
                project_key: session.project_key.clone(),
                session_key: session.session_key.clone(),
                path,
            }),
            Ok(_) => Err(StreamError::not_found(session.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StreamError::not_found(session.to_string()))
            }
            Err(e) => Err(StreamError::io(path, e)),
        }
    }

    fn open_stream(&self, location: SessionLocation, ctx: StreamContext) -> EntryStream {
        jsonl_stream(location.path, ClaudeConverter::new(), ctx)
    }

    async fn project_key_for(&self, workspace: &Path) -> String {
        encode_workspace(workspace)
    }

    fn scrape_session_id(&self, line: &str) -> Option<String> {
        super::scrape_init_line(line)
    }

    async fn find_recent_session(&self, workspace: &Path, since: SystemTime) -> Option<SessionLocation> {
        let project_key = encode_workspace(workspace);
        let dir = self.root.join(&project_key);
        let (path, _) = super::newest_since(&dir, since, |p| has_extension(p, "jsonl")).await?;
        Some(SessionLocation {
            project_key,
            session_key: file_stem(&path)?,
            path,
        })
    }
}

/// Title source: the first user-typed string message.
async fn first_user_message(path: &Path) -> Option<String> {
    let file = tokio::fs::File::open(path).await.ok()?;
    let mut lines = tokio::io::BufReader::new(file).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if !line.contains("\"user\"") {
            continue;
        }
        let Ok(value) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        if record_kind(&value) != Some("user") || is_meta(&value) {
            continue;
        }
        if let Some(Value::String(text)) = message_of(&value).get("content") {
            if let Some(title) = title_from_message(&clean_command_tags(text)) {
                return Some(title);
            }
        }
    }
    None
}

fn record_kind(value: &Value) -> Option<&str> {
    value
        .get("type")
        .and_then(Value::as_str)
        .or_else(|| value.get("role").and_then(Value::as_str))
}

fn message_of(value: &Value) -> &Value {
    value.get("message").unwrap_or(value)
}

fn is_meta(value: &Value) -> bool {
    value.get("isMeta").and_then(Value::as_bool).unwrap_or(false)
}

/// Render slash-command wrappers as the command line the user typed and
/// drop harness-injected blocks.
pub fn clean_command_tags(text: &str) -> String {
    if let Some(name) = COMMAND_NAME.captures(text).and_then(|c| c.get(1)) {
        let args = COMMAND_ARGS
            .captures(text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim())
            .unwrap_or("");
        let name = name.as_str().trim();
        return if args.is_empty() {
            name.to_string()
        } else {
            format!("{name} {args}")
        };
    }
    if let Some(out) = COMMAND_STDOUT.captures(text).and_then(|c| c.get(1)) {
        return out.as_str().trim().to_string();
    }
    ANY_TAG_BLOCK.replace_all(text, "").trim().to_string()
}

#[derive(Debug, Deserialize)]
struct Message {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    content: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Block {
    Text {
        #[serde(default)]
        text: String,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Other,
}

/// Stream-scoped conversion state for one Claude transcript.
#[derive(Debug)]
pub struct ClaudeConverter {
    calls: CallTracker<()>,
    text: TextBuffer,
    workspace: Option<PathBuf>,
}

impl Default for ClaudeConverter {
    fn default() -> Self {
        Self::new()
    }
}

impl ClaudeConverter {
    pub fn new() -> Self {
        Self {
            calls: CallTracker::new(),
            text: TextBuffer::new("\n\n"),
            workspace: None,
        }
    }

    fn on_user(&mut self, value: &Value, timestamp: Option<String>, out: &mut PatchEmitter) {
        if is_meta(value) {
            return;
        }
        let Ok(message) = Message::deserialize(message_of(value)) else {
            tracing::debug!("Skipping user record without a message");
            return;
        };
        match message.content {
            Some(Value::String(text)) => {
                self.text.flush(out);
                let text = clean_command_tags(&text);
                if !text.is_empty() {
                    out.add(NormalizedEntry::user(text).with_timestamp(timestamp));
                }
            }
            Some(Value::Array(blocks)) => {
                for block in blocks {
                    match serde_json::from_value::<Block>(block) {
                        Ok(Block::Text { text }) => {
                            let text = clean_command_tags(&text);
                            self.text
                                .push(out, TextKind::User, None, &text, timestamp.clone());
                        }
                        Ok(Block::ToolResult {
                            tool_use_id,
                            content,
                            is_error,
                        }) => {
                            self.text.flush(out);
                            self.complete_call(&tool_use_id, &content, is_error, out);
                        }
                        Ok(_) => {}
                        Err(e) => tracing::debug!(error = %e, "Skipping malformed user block"),
                    }
                }
                self.text.flush(out);
            }
            _ => {}
        }
    }

    fn on_assistant(&mut self, value: &Value, timestamp: Option<String>, out: &mut PatchEmitter) {
        let Ok(message) = Message::deserialize(message_of(value)) else {
            tracing::debug!("Skipping assistant record without a message");
            return;
        };

        if value
            .get("isApiErrorMessage")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            self.text.flush(out);
            let text = message.content.as_ref().map(text_of).unwrap_or_default();
            out.add(
                NormalizedEntry::error(text.trim())
                    .with_timestamp(timestamp)
                    .with_metadata(value.clone()),
            );
            return;
        }

        let key = message.id.as_deref();
        match message.content {
            Some(Value::String(text)) => {
                self.text.push(out, TextKind::Assistant, key, &text, timestamp);
            }
            Some(Value::Array(blocks)) => {
                for block in blocks {
                    let raw = block.clone();
                    match serde_json::from_value::<Block>(block) {
                        Ok(Block::Text { text }) => {
                            self.text
                                .push(out, TextKind::Assistant, key, &text, timestamp.clone());
                        }
                        Ok(Block::Thinking { thinking }) => {
                            self.text
                                .push(out, TextKind::Thinking, key, &thinking, timestamp.clone());
                        }
                        Ok(Block::ToolUse { id, name, input }) => {
                            self.text.flush(out);
                            let entry = tool_use_entry(&name, &input, self.workspace.as_deref())
                                .with_timestamp(timestamp.clone())
                                .with_metadata(raw);
                            self.calls.begin(out, &id, entry, ());
                        }
                        Ok(_) => {}
                        Err(e) => tracing::debug!(error = %e, "Skipping malformed assistant block"),
                    }
                }
            }
            _ => {}
        }
    }

    fn complete_call(&mut self, call_id: &str, content: &Value, is_error: bool, out: &mut PatchEmitter) {
        let output = text_of(content);
        self.calls.complete(out, call_id, |entry, ()| {
            match entry.action() {
                Some(ActionType::CommandRun { .. }) => set_command_result(
                    entry,
                    CommandRunResult {
                        exit_status: Some(CommandExitStatus::Success { success: !is_error }),
                        output: Some(output),
                    },
                ),
                Some(ActionType::Tool { .. }) => {
                    set_tool_result(entry, ToolResult::markdown(output))
                }
                // Reads, edits, searches: nothing to fold in.
                _ => false,
            }
        });
    }
}

impl RecordConverter for ClaudeConverter {
    fn convert(&mut self, line: &str, out: &mut PatchEmitter) {
        let Some(value) = parse_record(line) else {
            return;
        };
        if self.workspace.is_none() {
            self.workspace = value.get("cwd").and_then(Value::as_str).map(PathBuf::from);
        }
        let timestamp = value
            .get("timestamp")
            .and_then(crate::discovery::normalize_timestamp);

        match record_kind(&value) {
            Some("user") => self.on_user(&value, timestamp, out),
            Some("assistant") => self.on_assistant(&value, timestamp, out),
            Some("system") => {
                let text = value
                    .get("content")
                    .map(text_of)
                    .or_else(|| message_of(&value).get("content").map(text_of))
                    .unwrap_or_default();
                if !text.trim().is_empty() {
                    self.text.flush(out);
                    out.add(
                        NormalizedEntry::system(text.trim())
                            .with_timestamp(timestamp)
                            .with_metadata(value.clone()),
                    );
                }
            }
            // summary, file-history-snapshot, progress, result, queue-operation...
            other => tracing::trace!(kind = ?other, "Ignoring record"),
        }
    }

    fn finish(&mut self, out: &mut PatchEmitter) {
        self.text.flush(out);
        if self.calls.open_count() > 0 {
            tracing::debug!(open = self.calls.open_count(), "Stream ended with open tool calls");
        }
    }
}
