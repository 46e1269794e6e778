//! Codex CLI rollouts.
//!
//! ```text
//! <root>/YYYY/MM/DD/rollout-2025-05-07T17-24-21-<uuid>.jsonl
//! ```
//!
//! The first line is a `session_meta` record carrying the session id and
//! working directory. Later lines wrap either a protocol event or a model
//! response item:
//!
//! ```json
//! {"timestamp":"..","type":"event_msg","payload":{"type":"agent_message","message":".."}}
//! {"timestamp":"..","type":"response_item","payload":{"type":"function_call","name":"shell",..}}
//! ```
//!
//! Older files (and `codex exec --json` output) use `{id, msg}` or bare
//! events instead of the `payload` envelope.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use agent_trail_types::{
    ActionType, CommandExitStatus, CommandRunResult, FileChange, NormalizedEntry, ProjectId, ProjectInfo,
    SessionId, SessionInfo, SourceKind, ToolResult,
};
use async_trait::async_trait;
use chrono::{Duration, Local};
use serde::{Deserialize, Deserializer};
use serde_json::{json, Map, Value};
use tokio::io::AsyncBufReadExt;

use super::{has_extension, is_safe_key, parse_record, read_dir_entries, text_of, SessionLocation, SessionSource};
use crate::correlate::{set_command_result, set_tool_result, CallTracker};
use crate::discovery::{normalize_timestamp, system_time_to_rfc3339, title_from_message, TitleCache};
use crate::error::{DiscoveryError, StreamError};
use crate::patch::PatchEmitter;
use crate::stream::{jsonl_stream, EntryStream, RecordConverter, StreamContext};
use crate::tools::{build_command_output, make_path_relative, one_line, tool_use_entry};

/// Project key for rollouts that never recorded a working directory.
pub const UNKNOWN_PROJECT: &str = "unknown";

const ROLLOUT_PREFIX: &str = "rollout-";
const UUID_LEN: usize = 36;

/// Injected context the CLI sends as user messages.
const CONTEXT_PREFIXES: &[&str] = &["<environment_context>", "<user_instructions>", "# AGENTS.md"];

#[derive(Debug, Clone)]
pub struct CodexSource {
    root: PathBuf,
    titles: TitleCache,
}

/// What the first line of a rollout says about it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct RolloutHeader {
    id: Option<String>,
    cwd: Option<String>,
    timestamp: Option<String>,
}

#[derive(Debug, Clone)]
struct Rollout {
    path: PathBuf,
    session_key: String,
    project_key: String,
    cwd: Option<String>,
    created_at: Option<String>,
    modified: Option<SystemTime>,
}

impl CodexSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            titles: TitleCache::new(),
        }
    }

    /// Every rollout under the root, newest first. Blocking directory walk.
    async fn scan(&self) -> Result<Vec<Rollout>, DiscoveryError> {
        let root = self.root.clone();
        let scanned = tokio::task::spawn_blocking(move || scan_rollouts(&root))
            .await
            .map_err(|e| DiscoveryError::Io {
                path: self.root.clone(),
                source: std::io::Error::other(e),
            })?;
        let mut rollouts = scanned?;
        rollouts.sort_by_key(|r| std::cmp::Reverse(r.modified));
        Ok(rollouts)
    }
}

pub fn encode_workspace(workspace: &str) -> String {
    urlencoding::encode(workspace).into_owned()
}

fn is_rollout(path: &Path) -> bool {
    has_extension(path, "jsonl")
        && path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(ROLLOUT_PREFIX))
}

/// `rollout-<timestamp>-<uuid>.jsonl` → `<uuid>`
fn uuid_from_file_name(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    let start = stem.len().checked_sub(UUID_LEN)?;
    let tail = stem.get(start..)?;
    (tail.len() == UUID_LEN && tail.chars().all(|c| c.is_ascii_hexdigit() || c == '-'))
        .then(|| tail.to_string())
}

fn scan_rollouts(root: &Path) -> Result<Vec<Rollout>, DiscoveryError> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in walkdir::WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::debug!(error = %e, "Skipping unreadable rollout entry");
                continue;
            }
        };
        if !entry.file_type().is_file() || !is_rollout(entry.path()) {
            continue;
        }
        let header = read_header_blocking(entry.path()).unwrap_or_default();
        let Some(session_key) = header.id.clone().or_else(|| uuid_from_file_name(entry.path())) else {
            continue;
        };
        let modified = entry.metadata().ok().and_then(|m| m.modified().ok());
        out.push(Rollout {
            path: entry.path().to_path_buf(),
            project_key: header
                .cwd
                .as_deref()
                .map(encode_workspace)
                .unwrap_or_else(|| UNKNOWN_PROJECT.to_string()),
            session_key,
            cwd: header.cwd,
            created_at: header.timestamp,
            modified,
        });
    }
    Ok(out)
}

fn read_header_blocking(path: &Path) -> Option<RolloutHeader> {
    use std::io::BufRead;
    let file = std::fs::File::open(path).ok()?;
    let mut line = String::new();
    std::io::BufReader::new(file).read_line(&mut line).ok()?;
    parse_header(&line)
}

fn parse_header(line: &str) -> Option<RolloutHeader> {
    let value: Value = serde_json::from_str(line.trim()).ok()?;
    let meta = match value.get("type").and_then(Value::as_str) {
        Some("session_meta") => value.get("payload")?,
        // Legacy header: `{"id":..,"timestamp":..,"instructions":..}`
        None => &value,
        Some(_) => return None,
    };
    let field = |key: &str| meta.get(key).and_then(Value::as_str).map(str::to_string);
    Some(RolloutHeader {
        id: field("id"),
        cwd: field("cwd"),
        timestamp: meta.get("timestamp").and_then(normalize_timestamp),
    })
}

#[async_trait]
impl SessionSource for CodexSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Codex
    }

    async fn list_projects(&self) -> Result<Vec<ProjectInfo>, DiscoveryError> {
        let mut projects: Vec<ProjectInfo> = Vec::new();
        for rollout in self.scan().await? {
            let updated = rollout.modified.map(system_time_to_rfc3339);
            if let Some(existing) = projects.iter_mut().find(|p| p.id.key == rollout.project_key) {
                existing.session_count += 1;
                if updated > existing.updated_at {
                    existing.updated_at = updated;
                }
                continue;
            }
            let display_name = rollout
                .cwd
                .as_deref()
                .and_then(|cwd| Path::new(cwd).file_name())
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| rollout.project_key.clone());
            projects.push(ProjectInfo {
                id: ProjectId::new(SourceKind::Codex, rollout.project_key.clone()),
                source: SourceKind::Codex,
                display_name,
                path: rollout.cwd.clone(),
                location: self.root.to_string_lossy().into_owned(),
                updated_at: updated,
                session_count: 1,
            });
        }
        projects.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(projects)
    }

    async fn list_sessions(&self, project_key: &str) -> Result<Vec<SessionInfo>, DiscoveryError> {
        let mut sessions = Vec::new();
        for rollout in self.scan().await? {
            if rollout.project_key != project_key {
                continue;
            }
            let id = SessionId::new(SourceKind::Codex, project_key, rollout.session_key.clone());
            let mut info = SessionInfo::new(id, rollout.path.to_string_lossy());
            let path = rollout.path.clone();
            info.title = self.titles.get_or_load(&rollout.path, || first_user_message(path)).await;
            info.created_at = rollout.created_at;
            info.updated_at = rollout.modified.map(system_time_to_rfc3339);
            sessions.push(info);
        }
        Ok(sessions)
    }

    async fn locate(&self, session: &SessionId) -> Result<SessionLocation, StreamError> {
        if !is_safe_key(&session.session_key) {
            return Err(StreamError::not_found(session.to_string()));
        }
        let rollouts = self.scan().await.map_err(|e| match e {
            DiscoveryError::PermissionDenied { path } => StreamError::PermissionDenied { path },
            other => StreamError::Io {
                path: self.root.clone(),
                source: std::io::Error::other(other),
            },
        })?;
        rollouts
            .into_iter()
            .find(|r| r.session_key == session.session_key)
            .map(|r| SessionLocation {
                project_key: r.project_key,
                session_key: r.session_key,
                path: r.path,
            })
            .ok_or_else(|| StreamError::not_found(session.to_string()))
    }

    fn open_stream(&self, location: SessionLocation, ctx: StreamContext) -> EntryStream {
        jsonl_stream(location.path, CodexConverter::new(), ctx)
    }

    async fn project_key_for(&self, workspace: &Path) -> String {
        encode_workspace(&workspace.to_string_lossy())
    }

    fn scrape_session_id(&self, line: &str) -> Option<String> {
        scrape_session_id(line)
    }

    async fn find_recent_session(&self, workspace: &Path, since: SystemTime) -> Option<SessionLocation> {
        let workspace = workspace.to_string_lossy();
        let today = Local::now().date_naive();
        // A session started just before midnight lands in yesterday's folder.
        for day in [today, today - Duration::days(1)] {
            let dir = self.root.join(day.format("%Y/%m/%d").to_string());
            let mut candidates: Vec<_> = read_dir_entries(&dir)
                .await
                .ok()?
                .into_iter()
                .filter(|(p, m)| m.is_file() && is_rollout(p))
                .filter_map(|(p, m)| Some((p, m.modified().ok()?)))
                .filter(|(_, mtime)| *mtime >= since)
                .collect();
            candidates.sort_by_key(|(_, mtime)| std::cmp::Reverse(*mtime));

            for (path, _) in candidates {
                let Some(line) = super::read_first_line(&path).await else {
                    continue;
                };
                let Some(header) = parse_header(&line) else {
                    continue;
                };
                if header.cwd.as_deref() != Some(&*workspace) {
                    continue;
                }
                let Some(session_key) = header.id.or_else(|| uuid_from_file_name(&path)) else {
                    continue;
                };
                return Some(SessionLocation {
                    project_key: encode_workspace(&workspace),
                    session_key,
                    path,
                });
            }
        }
        None
    }
}

/// Session id announced by `codex exec --json` or the app-server protocol.
pub fn scrape_session_id(line: &str) -> Option<String> {
    let value: Value = serde_json::from_str(line.trim()).ok()?;
    let non_empty = |v: Option<&Value>| {
        v.and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    match value.get("type").and_then(Value::as_str) {
        Some("thread.started") => return non_empty(value.get("thread_id")),
        Some("session_configured") => return non_empty(value.get("session_id")),
        _ => {}
    }
    if let Some(msg) = value.get("msg") {
        if msg.get("type").and_then(Value::as_str) == Some("session_configured") {
            return non_empty(msg.get("session_id"));
        }
    }
    match value.get("method").and_then(Value::as_str) {
        Some("sessionConfigured" | "session_configured") => {
            let params = value.get("params")?;
            non_empty(params.get("sessionId").or_else(|| params.get("session_id")))
        }
        _ => None,
    }
}

/// Title source: the first real user prompt.
async fn first_user_message(path: PathBuf) -> Option<String> {
    let file = tokio::fs::File::open(&path).await.ok()?;
    let mut lines = tokio::io::BufReader::new(file).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if !line.contains("user") {
            continue;
        }
        let Ok(value) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        let payload = value.get("payload").or_else(|| value.get("msg")).unwrap_or(&value);
        let text = match payload.get("type").and_then(Value::as_str) {
            Some("user_message") => payload.get("message").map(text_of),
            Some("message") if payload.get("role").and_then(Value::as_str) == Some("user") => {
                payload.get("content").map(text_of)
            }
            _ => None,
        };
        if let Some(text) = text.filter(|t| !is_injected_context(t)) {
            if let Some(title) = title_from_message(&text) {
                return Some(title);
            }
        }
    }
    None
}

fn is_injected_context(text: &str) -> bool {
    let trimmed = text.trim_start();
    CONTEXT_PREFIXES.iter().any(|p| trimmed.starts_with(p))
}

fn call_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("invalid call_id: {other}"))),
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct McpInvocation {
    #[serde(default)]
    server: String,
    #[serde(default)]
    tool: String,
    #[serde(default)]
    arguments: Option<Value>,
}

/// Protocol events this converter understands.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Event {
    UserMessage {
        #[serde(default)]
        message: String,
    },
    AgentMessage {
        #[serde(default)]
        message: String,
    },
    AgentReasoning {
        #[serde(default)]
        text: String,
    },
    ExecCommandBegin {
        #[serde(deserialize_with = "call_id")]
        call_id: String,
        #[serde(default)]
        command: Value,
    },
    ExecCommandEnd {
        #[serde(deserialize_with = "call_id")]
        call_id: String,
        #[serde(default)]
        stdout: Option<String>,
        #[serde(default)]
        stderr: Option<String>,
        #[serde(default)]
        aggregated_output: Option<String>,
        #[serde(default)]
        formatted_output: Option<String>,
        #[serde(default)]
        exit_code: Option<i32>,
    },
    PatchApplyBegin {
        #[serde(deserialize_with = "call_id")]
        call_id: String,
        #[serde(default)]
        changes: Map<String, Value>,
    },
    PatchApplyEnd {
        #[serde(deserialize_with = "call_id")]
        call_id: String,
        #[serde(default)]
        stdout: Option<String>,
        #[serde(default)]
        stderr: Option<String>,
        #[serde(default = "default_true")]
        success: bool,
    },
    McpToolCallBegin {
        #[serde(deserialize_with = "call_id")]
        call_id: String,
        invocation: McpInvocation,
    },
    McpToolCallEnd {
        #[serde(deserialize_with = "call_id")]
        call_id: String,
        #[serde(default)]
        result: Value,
    },
    WebSearchEnd {
        #[serde(default)]
        query: String,
    },
    PlanUpdate {
        #[serde(default)]
        plan: Vec<Value>,
    },
    Error {
        #[serde(default)]
        message: String,
    },
    StreamError {
        #[serde(default)]
        message: String,
    },
    TurnAborted {
        #[serde(default)]
        reason: Option<String>,
    },
    ShutdownComplete,
    #[serde(other)]
    Other,
}

/// Model response items.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Item {
    Message {
        #[serde(default)]
        role: String,
        #[serde(default)]
        content: Value,
    },
    Reasoning {
        #[serde(default)]
        summary: Value,
    },
    FunctionCall {
        name: String,
        #[serde(default)]
        arguments: Value,
        #[serde(deserialize_with = "call_id")]
        call_id: String,
    },
    FunctionCallOutput {
        #[serde(deserialize_with = "call_id")]
        call_id: String,
        #[serde(default)]
        output: Value,
    },
    CustomToolCall {
        name: String,
        #[serde(default)]
        input: String,
        #[serde(deserialize_with = "call_id")]
        call_id: String,
    },
    CustomToolCallOutput {
        #[serde(deserialize_with = "call_id")]
        call_id: String,
        #[serde(default)]
        output: Value,
    },
    #[serde(other)]
    Other,
}

const ITEM_TYPES: &[&str] = &[
    "message",
    "reasoning",
    "function_call",
    "function_call_output",
    "custom_tool_call",
    "custom_tool_call_output",
];

/// Stream-scoped conversion state for one rollout.
#[derive(Debug, Default)]
pub struct CodexConverter {
    calls: CallTracker<()>,
    cwd: Option<PathBuf>,
    has_session_meta: bool,
    last_agent_message: Option<String>,
    last_reasoning: Option<String>,
    complete: bool,
}

impl CodexConverter {
    pub fn new() -> Self {
        Self::default()
    }

    fn workspace(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    fn on_event(&mut self, payload: Value, timestamp: Option<String>, out: &mut PatchEmitter) {
        let raw = payload.clone();
        let event = match serde_json::from_value::<Event>(payload) {
            Ok(event) => event,
            Err(e) => {
                tracing::debug!(error = %e, "Skipping malformed codex event");
                return;
            }
        };

        match event {
            Event::UserMessage { message } => {
                let text = message.trim();
                if !text.is_empty() && !is_injected_context(text) {
                    out.add(NormalizedEntry::user(text).with_timestamp(timestamp));
                }
            }
            Event::AgentMessage { message } => {
                let text = message.trim().to_string();
                if text.is_empty() || self.last_agent_message.as_deref() == Some(text.as_str()) {
                    return;
                }
                out.add(NormalizedEntry::assistant(text.clone()).with_timestamp(timestamp));
                self.last_agent_message = Some(text);
            }
            Event::AgentReasoning { text } => self.add_reasoning(text, timestamp, out),
            Event::ExecCommandBegin { call_id, command } => {
                let entry = tool_use_entry("shell", &json!({ "command": command }), self.workspace())
                    .with_timestamp(timestamp)
                    .with_metadata(raw);
                self.calls.begin(out, &call_id, entry, ());
            }
            Event::ExecCommandEnd {
                call_id,
                stdout,
                stderr,
                aggregated_output,
                formatted_output,
                exit_code,
            } => {
                let output = formatted_output
                    .filter(|s| !s.trim().is_empty())
                    .or(aggregated_output.filter(|s| !s.trim().is_empty()))
                    .map(|s| s.trim().to_string())
                    .or_else(|| build_command_output(stdout.as_deref(), stderr.as_deref()));
                let result = CommandRunResult {
                    exit_status: exit_code.map(|code| CommandExitStatus::ExitCode { code }),
                    output,
                };
                self.calls
                    .complete(out, &call_id, |entry, ()| set_command_result(entry, result));
            }
            Event::PatchApplyBegin { call_id, changes } => {
                let files: Vec<_> = changes
                    .iter()
                    .map(|(path, change)| (path.clone(), patch_event_changes(change)))
                    .collect();
                self.begin_file_edits(&call_id, files, timestamp, Some(raw), out);
            }
            Event::PatchApplyEnd {
                call_id,
                stdout,
                stderr,
                success,
            } => {
                self.calls.complete(out, &call_id, |_, ()| false);
                if !success {
                    let detail = build_command_output(stderr.as_deref(), stdout.as_deref())
                        .unwrap_or_else(|| "Patch failed to apply".to_string());
                    out.add(NormalizedEntry::error(detail).with_timestamp(timestamp));
                }
            }
            Event::McpToolCallBegin { call_id, invocation } => {
                let name = format!("mcp__{}__{}", invocation.server, invocation.tool);
                let arguments = invocation.arguments.unwrap_or(Value::Null);
                let entry = tool_use_entry(&name, &arguments, self.workspace())
                    .with_timestamp(timestamp)
                    .with_metadata(raw);
                self.calls.begin(out, &call_id, entry, ());
            }
            Event::McpToolCallEnd { call_id, result } => {
                let result = mcp_result(result);
                self.calls
                    .complete(out, &call_id, |entry, ()| set_tool_result(entry, result));
            }
            Event::WebSearchEnd { query } => {
                let entry = tool_use_entry("web_search", &json!({ "query": query }), None)
                    .with_timestamp(timestamp)
                    .with_metadata(raw);
                out.add(entry);
            }
            Event::PlanUpdate { plan } => {
                out.add(plan_entry(&json!({ "plan": plan })).with_timestamp(timestamp));
            }
            Event::Error { message } | Event::StreamError { message } => {
                if !message.trim().is_empty() {
                    out.add(NormalizedEntry::error(message.trim()).with_timestamp(timestamp));
                }
            }
            Event::TurnAborted { reason } => {
                let text = match reason {
                    Some(reason) => format!("Turn aborted: {reason}"),
                    None => "Turn aborted".to_string(),
                };
                out.add(NormalizedEntry::system(text).with_timestamp(timestamp));
            }
            Event::ShutdownComplete => self.complete = true,
            // token_count, task_started, exec_command_output_delta, ...
            Event::Other => {}
        }
    }

    fn on_item(&mut self, payload: Value, timestamp: Option<String>, out: &mut PatchEmitter) {
        let raw = payload.clone();
        let item = match serde_json::from_value::<Item>(payload) {
            Ok(item) => item,
            Err(e) => {
                tracing::debug!(error = %e, "Skipping malformed codex response item");
                return;
            }
        };

        match item {
            // Rollouts with session_meta also record these as events.
            Item::Message { .. } | Item::Reasoning { .. } if self.has_session_meta => {}
            Item::Message { role, content } => {
                let text = text_of(&content);
                let text = text.trim();
                if text.is_empty() || is_injected_context(text) {
                    return;
                }
                let entry = match role.as_str() {
                    "user" => NormalizedEntry::user(text),
                    "assistant" => NormalizedEntry::assistant(text),
                    _ => return,
                };
                out.add(entry.with_timestamp(timestamp));
            }
            Item::Reasoning { summary } => {
                self.add_reasoning(text_of(&summary), timestamp, out);
            }
            Item::FunctionCall {
                name,
                arguments,
                call_id,
            } => {
                // `arguments` is a JSON document encoded as a string.
                let args = match &arguments {
                    Value::String(s) => serde_json::from_str(s).unwrap_or_else(|_| json!({ "input": s })),
                    other => other.clone(),
                };
                let entry = if name == "update_plan" {
                    plan_entry(&args)
                } else {
                    tool_use_entry(&name, &args, self.workspace())
                };
                self.calls
                    .begin(out, &call_id, entry.with_timestamp(timestamp).with_metadata(raw), ());
            }
            Item::FunctionCallOutput { call_id, output } | Item::CustomToolCallOutput { call_id, output } => {
                let (text, exit_code) = function_output(&output);
                self.calls.complete(out, &call_id, |entry, ()| match entry.action() {
                    Some(ActionType::CommandRun { .. }) => set_command_result(
                        entry,
                        CommandRunResult {
                            exit_status: exit_code.map(|code| CommandExitStatus::ExitCode { code }),
                            output: text,
                        },
                    ),
                    Some(ActionType::Tool { .. }) => {
                        set_tool_result(entry, ToolResult::markdown(text.unwrap_or_default()))
                    }
                    _ => false,
                });
            }
            Item::CustomToolCall { name, input, call_id } if name == "apply_patch" => {
                let files = parse_patch_text(&input);
                self.begin_file_edits(&call_id, files, timestamp, Some(raw), out);
            }
            Item::CustomToolCall { name, input, call_id } => {
                let entry = tool_use_entry(&name, &json!({ "input": input }), self.workspace())
                    .with_timestamp(timestamp)
                    .with_metadata(raw);
                self.calls.begin(out, &call_id, entry, ());
            }
            Item::Other => {}
        }
    }

    fn add_reasoning(&mut self, text: String, timestamp: Option<String>, out: &mut PatchEmitter) {
        let text = text.trim().to_string();
        if text.is_empty() || self.last_reasoning.as_deref() == Some(text.as_str()) {
            return;
        }
        out.add(NormalizedEntry::thinking(text.clone()).with_timestamp(timestamp));
        self.last_reasoning = Some(text);
    }

    /// One entry per touched file. The first is tracked under `call_id` so
    /// the end event pairs with it.
    fn begin_file_edits(
        &mut self,
        call_id: &str,
        files: Vec<(String, Vec<FileChange>)>,
        timestamp: Option<String>,
        metadata: Option<Value>,
        out: &mut PatchEmitter,
    ) {
        if self.calls.is_open(call_id) {
            return;
        }
        let mut first = true;
        for (path, changes) in files {
            let path = make_path_relative(&path, self.workspace());
            let mut entry = NormalizedEntry::tool_use(
                "apply_patch",
                ActionType::FileEdit {
                    path: path.clone(),
                    changes,
                },
                one_line(&path),
            )
            .with_timestamp(timestamp.clone());
            if let Some(meta) = metadata.clone() {
                entry = entry.with_metadata(meta);
            }
            if first {
                self.calls.begin(out, call_id, entry, ());
                first = false;
            } else {
                out.add(entry);
            }
        }
    }
}

impl RecordConverter for CodexConverter {
    fn convert(&mut self, line: &str, out: &mut PatchEmitter) {
        let Some(mut value) = parse_record(line) else {
            return;
        };
        let timestamp = value.get("timestamp").and_then(normalize_timestamp);
        let kind = value.get("type").and_then(Value::as_str).map(str::to_string);

        match kind.as_deref() {
            Some("session_meta") => {
                self.has_session_meta = true;
                self.set_cwd(value.get("payload"));
            }
            Some("turn_context") => self.set_cwd(value.get("payload")),
            Some("event_msg") => {
                if let Some(payload) = value.get_mut("payload").map(Value::take) {
                    self.on_event(payload, timestamp, out);
                }
            }
            Some("response_item") => {
                if let Some(payload) = value.get_mut("payload").map(Value::take) {
                    self.on_item(payload, timestamp, out);
                }
            }
            Some("compacted") => {}
            Some(t) if ITEM_TYPES.contains(&t) => self.on_item(value, timestamp, out),
            Some(_) => self.on_event(value, timestamp, out),
            None => match value.get_mut("msg").map(Value::take) {
                Some(msg) if msg.is_object() => self.on_event(msg, timestamp, out),
                // Legacy header line.
                _ => self.set_cwd(Some(&value)),
            },
        }
    }

    fn finish(&mut self, _out: &mut PatchEmitter) {
        if self.calls.open_count() > 0 {
            tracing::debug!(open = self.calls.open_count(), "Rollout ended with open calls");
        }
    }

    fn is_complete(&self) -> bool {
        self.complete
    }
}

impl CodexConverter {
    fn set_cwd(&mut self, payload: Option<&Value>) {
        if let Some(cwd) = payload.and_then(|p| p.get("cwd")).and_then(Value::as_str) {
            self.cwd = Some(PathBuf::from(cwd));
        }
    }
}

fn plan_entry(args: &Value) -> NormalizedEntry {
    let mut entry = tool_use_entry("update_plan", args, None);
    if let Some(ActionType::TodoManagement { operation, .. }) = entry.action_mut() {
        *operation = "update".to_string();
    }
    entry
}

/// `function_call_output.output` is either plain text or a JSON string
/// `{"output": "...", "metadata": {"exit_code": 0}}`.
fn function_output(output: &Value) -> (Option<String>, Option<i32>) {
    let structured = match output {
        Value::String(s) => serde_json::from_str::<Value>(s).ok().filter(Value::is_object),
        Value::Object(_) => Some(output.clone()),
        _ => None,
    };
    match structured {
        Some(obj) => {
            let text = obj
                .get("output")
                .or_else(|| obj.get("content"))
                .map(text_of)
                .map(|s| s.trim().to_string());
            let exit_code = obj
                .get("metadata")
                .and_then(|m| m.get("exit_code"))
                .and_then(Value::as_i64)
                .and_then(|c| i32::try_from(c).ok());
            (text, exit_code)
        }
        None => {
            let text = text_of(output);
            let text = text.trim();
            ((!text.is_empty()).then(|| text.to_string()), None)
        }
    }
}

/// `{"Ok": {"content": [...], "is_error": false}}` or `{"Err": "..."}`.
fn mcp_result(result: Value) -> ToolResult {
    if let Some(err) = result.get("Err") {
        return ToolResult::markdown(text_of(err));
    }
    let ok = result.get("Ok").cloned().unwrap_or(result);
    match ok.get("content").map(text_of) {
        Some(text) if !text.trim().is_empty() => ToolResult::markdown(text.trim()),
        _ => ToolResult::json(ok),
    }
}

/// One file's entry in a `patch_apply_begin` change map. Accepts both
/// `{"add": {..}}` and `{"type": "add", ..}` shapes.
fn patch_event_changes(change: &Value) -> Vec<FileChange> {
    let (kind, body) = match change {
        Value::String(kind) => (kind.as_str(), &Value::Null),
        Value::Object(map) => match map.get("type").and_then(Value::as_str) {
            Some(kind) => (kind, change),
            None => match map.iter().next() {
                Some((kind, body)) if map.len() == 1 => (kind.as_str(), body),
                _ => return Vec::new(),
            },
        },
        _ => return Vec::new(),
    };
    let field = |key: &str| body.get(key).and_then(Value::as_str).map(str::to_string);

    match kind {
        "add" => vec![FileChange::Write {
            content: field("content").unwrap_or_default(),
        }],
        "delete" => vec![FileChange::Delete],
        "update" => {
            let mut changes = Vec::new();
            if let Some(new_path) = field("move_path") {
                changes.push(FileChange::Rename { new_path });
            }
            if let Some(unified_diff) = field("unified_diff") {
                changes.push(FileChange::Edit {
                    unified_diff,
                    has_line_numbers: true,
                });
            }
            changes
        }
        _ => Vec::new(),
    }
}

/// Split an `apply_patch` envelope into per-file changes.
///
/// ```text
/// *** Begin Patch
/// *** Update File: src/lib.rs
/// @@
/// -old
/// +new
/// *** End Patch
/// ```
fn parse_patch_text(input: &str) -> Vec<(String, Vec<FileChange>)> {
    #[derive(PartialEq)]
    enum Op {
        Add,
        Delete,
        Update,
    }
    struct Section {
        path: String,
        op: Op,
        move_to: Option<String>,
        body: Vec<String>,
    }

    let mut sections: Vec<Section> = Vec::new();
    for line in input.lines() {
        let header = [
            ("*** Add File: ", Op::Add),
            ("*** Delete File: ", Op::Delete),
            ("*** Update File: ", Op::Update),
        ]
        .into_iter()
        .find_map(|(prefix, op)| line.strip_prefix(prefix).map(|p| (p.trim().to_string(), op)));

        if let Some((path, op)) = header {
            sections.push(Section {
                path,
                op,
                move_to: None,
                body: Vec::new(),
            });
            continue;
        }
        let Some(current) = sections.last_mut() else {
            continue;
        };
        if let Some(dest) = line.strip_prefix("*** Move to: ") {
            current.move_to = Some(dest.trim().to_string());
        } else if line.starts_with("*** End Patch") || line.starts_with("*** End of File") {
            continue;
        } else {
            current.body.push(line.to_string());
        }
    }

    sections
        .into_iter()
        .map(|s| {
            let changes = match s.op {
                Op::Add => {
                    let content: Vec<&str> = s
                        .body
                        .iter()
                        .map(|l| l.strip_prefix('+').unwrap_or(l))
                        .collect();
                    vec![FileChange::Write {
                        content: content.join("\n"),
                    }]
                }
                Op::Delete => vec![FileChange::Delete],
                Op::Update => {
                    let mut changes = Vec::new();
                    if let Some(new_path) = s.move_to {
                        changes.push(FileChange::Rename { new_path });
                    }
                    if !s.body.is_empty() {
                        let mut diff = format!("--- a/{0}\n+++ b/{0}\n", s.path);
                        for line in &s.body {
                            diff.push_str(line);
                            diff.push('\n');
                        }
                        changes.push(FileChange::Edit {
                            unified_diff: diff,
                            has_line_numbers: false,
                        });
                    }
                    changes
                }
            };
            (s.path, changes)
        })
        .collect()
}
