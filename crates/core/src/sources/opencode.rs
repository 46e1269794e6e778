//! OpenCode sessions.
//!
//! ```text
//! <root>/project/<projectID>.json              {id, worktree}
//! <root>/session/<projectID>/<sessionID>.json  {id, title, directory, time}
//! <root>/message/<sessionID>/<messageID>.json  {id, role, time}
//! <root>/part/<messageID>/<partID>.json        {id, type, text, tool, callID, state}
//! ```
//!
//! Every message part is its own file and is rewritten as it streams, so
//! sessions are reconciled: one unit per part, fingerprinted by its file
//! name and bytes.
//!
//! `part/` is shared by every session. A live stream watches it through a
//! filter that only lets through the message ids its last snapshot saw;
//! a brand-new message first shows up in `message/<sessionID>/`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use agent_trail_types::{
    ActionType, CommandExitStatus, CommandRunResult, NormalizedEntry, ProjectId, ProjectInfo, SessionId,
    SessionInfo, SourceKind, ToolResult,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use super::{
    file_name, file_stem, has_extension, is_safe_key, modified, read_dir_entries, read_json, SessionLocation,
    SessionSource,
};
use crate::correlate::{set_command_result, set_tool_result};
use crate::discovery::{normalize_timestamp, system_time_to_rfc3339};
use crate::error::{DiscoveryError, StreamError};
use crate::stream::{fingerprint, reconcile_stream, EntryStream, Snapshot, StreamContext, Unit, WatchTarget};
use crate::tools::tool_use_entry;
use crate::watcher::PathFilter;

/// Project id OpenCode uses for directories outside any repository.
pub const GLOBAL_PROJECT: &str = "global";

#[derive(Debug, Clone)]
pub struct OpencodeSource {
    root: PathBuf,
}

#[derive(Debug, Default, Deserialize)]
struct Times {
    #[serde(default)]
    created: Option<Value>,
    #[serde(default)]
    updated: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ProjectRecord {
    id: String,
    #[serde(default)]
    worktree: Option<String>,
    #[serde(default)]
    time: Times,
}

#[derive(Debug, Deserialize)]
struct SessionRecord {
    id: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    directory: Option<String>,
    #[serde(default)]
    time: Times,
}

#[derive(Debug, Deserialize)]
struct MessageRecord {
    id: String,
    #[serde(default)]
    role: String,
    #[serde(default)]
    time: Times,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum PartRecord {
    Text {
        #[serde(default)]
        text: String,
        #[serde(default)]
        synthetic: bool,
    },
    Reasoning {
        #[serde(default)]
        text: String,
    },
    Tool {
        tool: String,
        #[serde(default)]
        state: ToolState,
    },
    // step-start, step-finish, snapshot, patch, file, agent...
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
struct ToolState {
    #[serde(default)]
    status: String,
    #[serde(default)]
    input: Value,
    #[serde(default)]
    output: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

fn json_files(entries: Vec<(PathBuf, std::fs::Metadata)>) -> Vec<(PathBuf, std::fs::Metadata)> {
    let mut files: Vec<_> = entries
        .into_iter()
        .filter(|(p, m)| m.is_file() && has_extension(p, "json"))
        .collect();
    files.sort_by(|a, b| a.0.cmp(&b.0));
    files
}

async fn read_record<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    let value = match read_json(path).await {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "Skipping unreadable record");
            return None;
        }
    };
    match serde_json::from_value(value) {
        Ok(record) => Some(record),
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "Skipping malformed record");
            None
        }
    }
}

impl OpencodeSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn project_dir(&self) -> PathBuf {
        self.root.join("project")
    }

    fn session_dir(&self, project_key: &str) -> PathBuf {
        self.root.join("session").join(project_key)
    }

    async fn projects(&self) -> Result<Vec<ProjectRecord>, DiscoveryError> {
        let mut out = Vec::new();
        for (path, _) in json_files(read_dir_entries(&self.project_dir()).await?) {
            if let Some(record) = read_record::<ProjectRecord>(&path).await {
                out.push(record);
            }
        }
        Ok(out)
    }

    async fn sessions(&self, project_key: &str) -> Result<Vec<(PathBuf, SessionRecord, Option<SystemTime>)>, DiscoveryError> {
        let mut out = Vec::new();
        for (path, meta) in json_files(read_dir_entries(&self.session_dir(project_key)).await?) {
            if let Some(record) = read_record::<SessionRecord>(&path).await {
                out.push((path, record, modified(&meta)));
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl SessionSource for OpencodeSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Opencode
    }

    async fn list_projects(&self) -> Result<Vec<ProjectInfo>, DiscoveryError> {
        let mut projects = Vec::new();
        for project in self.projects().await? {
            if !is_safe_key(&project.id) {
                continue;
            }
            let sessions = self.sessions(&project.id).await?;
            if sessions.is_empty() {
                continue;
            }
            let updated = sessions
                .iter()
                .filter_map(|(_, s, mtime)| {
                    s.time
                        .updated
                        .as_ref()
                        .and_then(normalize_timestamp)
                        .or_else(|| mtime.map(system_time_to_rfc3339))
                })
                .max()
                .or_else(|| project.time.updated.as_ref().and_then(normalize_timestamp));
            let display_name = match project.worktree.as_deref() {
                Some(tree) if project.id != GLOBAL_PROJECT => Path::new(tree)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| tree.to_string()),
                _ => project.id.clone(),
            };
            projects.push(ProjectInfo {
                id: ProjectId::new(SourceKind::Opencode, project.id.clone()),
                source: SourceKind::Opencode,
                display_name,
                path: project.worktree.clone(),
                location: self.session_dir(&project.id).to_string_lossy().into_owned(),
                updated_at: updated,
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
        let mut sessions: Vec<SessionInfo> = self
            .sessions(project_key)
            .await?
            .into_iter()
            .map(|(path, record, mtime)| {
                let mut info = SessionInfo::new(
                    SessionId::new(SourceKind::Opencode, project_key, record.id),
                    path.to_string_lossy(),
                );
                info.title = record.title.filter(|t| !t.trim().is_empty());
                info.created_at = record.time.created.as_ref().and_then(normalize_timestamp);
                info.updated_at = record
                    .time
                    .updated
                    .as_ref()
                    .and_then(normalize_timestamp)
                    .or_else(|| mtime.map(system_time_to_rfc3339));
                info
            })
            .collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }

    async fn locate(&self, session: &SessionId) -> Result<SessionLocation, StreamError> {
        if !is_safe_key(&session.project_key) || !is_safe_key(&session.session_key) {
            return Err(StreamError::not_found(session.to_string()));
        }
        let file = format!("{}.json", session.session_key);
        let direct = self.session_dir(&session.project_key).join(&file);
        if tokio::fs::try_exists(&direct).await.unwrap_or(false) {
            return Ok(SessionLocation {
                project_key: session.project_key.clone(),
                session_key: session.session_key.clone(),
                path: direct,
            });
        }
        // The session may have been filed under a project minted after launch.
        let dirs = read_dir_entries(&self.root.join("session"))
            .await
            .map_err(|_| StreamError::not_found(session.to_string()))?;
        for (dir, meta) in dirs {
            let candidate = dir.join(&file);
            if meta.is_dir() && tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
                return Ok(SessionLocation {
                    project_key: file_name(&dir),
                    session_key: session.session_key.clone(),
                    path: candidate,
                });
            }
        }
        Err(StreamError::not_found(session.to_string()))
    }

    fn open_stream(&self, location: SessionLocation, ctx: StreamContext) -> EntryStream {
        let snapshot = OpencodeSnapshot::new(&self.root, location.path, location.session_key);
        let target = WatchTarget::Many(vec![
            WatchTarget::Dir {
                root: self.root.join("message").join(&snapshot.session_key),
                recursive: false,
                filter: None,
            },
            WatchTarget::Dir {
                root: self.root.join("part"),
                recursive: true,
                filter: Some(part_filter(snapshot.message_ids.clone())),
            },
        ]);
        reconcile_stream(snapshot, target, ctx)
    }

    async fn project_key_for(&self, workspace: &Path) -> String {
        let workspace = workspace.to_string_lossy();
        match self.projects().await {
            Ok(projects) => projects
                .into_iter()
                .find(|p| p.id != GLOBAL_PROJECT && p.worktree.as_deref() == Some(&*workspace))
                .map(|p| p.id)
                .unwrap_or_else(|| GLOBAL_PROJECT.to_string()),
            Err(_) => GLOBAL_PROJECT.to_string(),
        }
    }

    fn scrape_session_id(&self, line: &str) -> Option<String> {
        scrape_session_id(line)
    }

    async fn find_recent_session(&self, workspace: &Path, since: SystemTime) -> Option<SessionLocation> {
        let project_key = self.project_key_for(workspace).await;
        let mut candidates: Vec<_> = self
            .sessions(&project_key)
            .await
            .ok()?
            .into_iter()
            .filter(|(_, _, mtime)| mtime.is_some_and(|t| t >= since))
            .collect();
        candidates.sort_by_key(|(_, _, mtime)| std::cmp::Reverse(*mtime));

        let workspace = workspace.to_string_lossy();
        candidates
            .into_iter()
            .find(|(_, record, _)| record.directory.as_deref().map_or(true, |d| d == &*workspace))
            .map(|(path, record, _)| SessionLocation {
                project_key: project_key.clone(),
                session_key: record.id,
                path,
            })
    }
}

/// Any JSON line naming a `sessionID`, at the top level or inside the
/// event's `part`/`properties`.
pub fn scrape_session_id(line: &str) -> Option<String> {
    let value: Value = serde_json::from_str(line.trim()).ok()?;
    let candidates = [
        value.get("sessionID"),
        value.get("part").and_then(|p| p.get("sessionID")),
        value.get("properties").and_then(|p| p.get("sessionID")),
        value
            .get("properties")
            .and_then(|p| p.get("info"))
            .and_then(|i| i.get("sessionID")),
    ];
    let found = candidates
        .into_iter()
        .flatten()
        .find_map(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    found
}

/// Message ids of one session, as of its latest snapshot.
pub type MessageIds = Arc<RwLock<HashSet<String>>>;

/// Accepts `part/<messageID>` and the files under it for known messages.
fn part_filter(message_ids: MessageIds) -> PathFilter {
    Arc::new(move |path: &Path| {
        let ids = message_ids.read().unwrap_or_else(|e| e.into_inner());
        path.ancestors()
            .take(2)
            .filter_map(Path::file_name)
            .any(|name| ids.contains(&*name.to_string_lossy()))
    })
}

/// Re-reads a session's message and part files into units.
#[derive(Debug, Clone)]
pub struct OpencodeSnapshot {
    pub root: PathBuf,
    pub session_file: PathBuf,
    pub session_key: String,
    pub message_ids: MessageIds,
}

impl OpencodeSnapshot {
    pub fn new(root: &Path, session_file: PathBuf, session_key: String) -> Self {
        Self {
            root: root.to_path_buf(),
            session_file,
            session_key,
            message_ids: MessageIds::default(),
        }
    }
}

#[async_trait]
impl Snapshot for OpencodeSnapshot {
    async fn snapshot(&self) -> Result<Vec<Unit>, StreamError> {
        let session: SessionRecord = match read_json(&self.session_file).await {
            Ok(value) => serde_json::from_value(value).map_err(|e| StreamError::Io {
                path: self.session_file.clone(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            })?,
            Err(e) => return Err(e),
        };
        let workspace = session.directory.map(PathBuf::from);

        let message_dir = self.root.join("message").join(&self.session_key);
        let listed = read_dir_entries(&message_dir)
            .await
            .map_err(|e| StreamError::Io {
                path: message_dir.clone(),
                source: std::io::Error::other(e),
            })?;
        let mut messages = Vec::new();
        for (path, _) in json_files(listed) {
            if let Some(record) = read_record::<MessageRecord>(&path).await {
                messages.push(record);
            }
        }
        messages.sort_by(|a, b| {
            let created = |m: &MessageRecord| m.time.created.as_ref().and_then(Value::as_i64);
            created(a).cmp(&created(b)).then_with(|| a.id.cmp(&b.id))
        });
        *self.message_ids.write().unwrap_or_else(|e| e.into_inner()) =
            messages.iter().map(|m| m.id.clone()).collect();

        let mut units = Vec::new();
        for message in messages {
            let timestamp = message.time.created.as_ref().and_then(normalize_timestamp);
            let part_dir = self.root.join("part").join(&message.id);
            let Ok(parts) = read_dir_entries(&part_dir).await else {
                continue;
            };
            for (path, _) in json_files(parts) {
                let Ok(bytes) = tokio::fs::read(&path).await else {
                    continue;
                };
                let name = file_name(&path);
                if let Some(entry) = part_entry(&message.role, &bytes, workspace.as_deref()) {
                    let key = file_stem(&path).unwrap_or_else(|| name.clone());
                    let print = fingerprint(&[name.as_bytes(), &bytes]);
                    units.push(Unit::with_fingerprint(key, entry.with_timestamp(timestamp.clone()), print));
                }
            }
        }
        Ok(units)
    }
}

fn part_entry(role: &str, bytes: &[u8], workspace: Option<&Path>) -> Option<NormalizedEntry> {
    let raw: Value = match serde_json::from_slice(bytes) {
        Ok(v) => v,
        Err(e) => {
            // Half-written; the next pass picks it up.
            tracing::debug!(error = %e, "Skipping unparsable part");
            return None;
        }
    };
    let part = match PartRecord::deserialize(&raw) {
        Ok(part) => part,
        Err(e) => {
            tracing::debug!(error = %e, "Skipping malformed part");
            return None;
        }
    };

    match part {
        PartRecord::Text { synthetic: true, .. } => None,
        PartRecord::Text { text, .. } => {
            let text = text.trim();
            if text.is_empty() {
                return None;
            }
            match role {
                "user" => Some(NormalizedEntry::user(text)),
                _ => Some(NormalizedEntry::assistant(text)),
            }
        }
        PartRecord::Reasoning { text } => {
            let text = text.trim();
            (!text.is_empty()).then(|| NormalizedEntry::thinking(text))
        }
        PartRecord::Tool { tool, state } => {
            let mut entry = tool_use_entry(&tool, &state.input, workspace).with_metadata(raw);
            fold_state(&mut entry, &state);
            Some(entry)
        }
        PartRecord::Other => None,
    }
}

fn fold_state(entry: &mut NormalizedEntry, state: &ToolState) {
    let (success, output) = match state.status.as_str() {
        "completed" => (true, state.output.clone()),
        "error" => (false, state.error.clone().or_else(|| state.output.clone())),
        // pending, running
        _ => return,
    };
    match entry.action() {
        Some(ActionType::CommandRun { .. }) => {
            set_command_result(
                entry,
                CommandRunResult {
                    exit_status: Some(CommandExitStatus::Success { success }),
                    output: output.map(|o| o.trim().to_string()),
                },
            );
        }
        Some(ActionType::Tool { .. }) => {
            set_tool_result(entry, ToolResult::markdown(output.unwrap_or_default()));
        }
        _ => {}
    }
}
