//! Cursor agent chats.
//!
//! ```text
//! <root>/<md5(workspace)>/<chat-id>/store.db
//! ```
//!
//! `store.db` is a SQLite content store:
//!
//! - `blobs(id TEXT, data BLOB)`: messages and tree nodes, see [`super::blob`]
//! - `meta(key TEXT, value TEXT)`: `meta['0']` is hex-encoded JSON
//!   `{agentId, latestRootBlobId, name, createdAt}`
//!
//! Messages are ordered by the root blob's child references when the root
//! is known, otherwise by row order. The store is rewritten by the agent,
//! so streams reconcile on every change of the chat directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::SystemTime;

use agent_trail_types::{
    ActionType, CommandExitStatus, CommandRunResult, NormalizedEntry, ProjectId, ProjectInfo, SessionId,
    SessionInfo, SourceKind, ToolResult,
};
use async_trait::async_trait;
use md5::{Digest, Md5};
use regex_lite::Regex;
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use serde::Deserialize;
use serde_json::Value;

use super::blob::{child_refs, decode_blob, DecodedBlob};
use super::{file_name, is_safe_key, modified, read_dir_entries, text_of, SessionLocation, SessionSource};
use crate::correlate::{set_command_result, set_tool_result};
use crate::discovery::{normalize_timestamp, system_time_to_rfc3339, title_from_message, TitleCache};
use crate::error::{DiscoveryError, StreamError};
use crate::stream::{reconcile_stream, EntryStream, Snapshot, StreamContext, Unit, WatchTarget};
use crate::tools::tool_use_entry;

pub const STORE_FILE: &str = "store.db";
const META_KEY: &str = "0";

static USER_QUERY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<user_query>(.*?)</user_query>").expect("static regex"));

#[derive(Debug, Clone)]
pub struct CursorSource {
    root: PathBuf,
    summaries: TitleCache<Option<StoreSummary>>,
}

/// What a listing needs from one store.
#[derive(Debug, Clone)]
struct StoreSummary {
    title: Option<String>,
    created_at: Option<String>,
}

/// `md5(workspace)` as lowercase hex, the CLI's project directory name.
pub fn workspace_hash(workspace: &Path) -> String {
    hex::encode(Md5::digest(workspace.to_string_lossy().as_bytes()))
}

/// `meta['0']` after hex and JSON decoding.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMeta {
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub latest_root_blob_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub created_at: Option<Value>,
}

/// Raw contents of one store, in message order.
#[derive(Debug, Default)]
struct Store {
    meta: Option<ChatMeta>,
    blobs: Vec<(String, Vec<u8>)>,
}

fn open_read_only(path: &Path) -> rusqlite::Result<Connection> {
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
}

fn decode_meta(raw: &str) -> Option<ChatMeta> {
    let trimmed = raw.trim();
    let bytes = hex::decode(trimmed).unwrap_or_else(|_| trimmed.as_bytes().to_vec());
    match serde_json::from_slice(&bytes) {
        Ok(meta) => Some(meta),
        Err(e) => {
            tracing::debug!(error = %e, "Undecodable chat meta");
            None
        }
    }
}

fn read_meta(conn: &Connection) -> rusqlite::Result<Option<ChatMeta>> {
    let raw: Option<String> = conn
        .query_row("SELECT value FROM meta WHERE key = ?1", [META_KEY], |row| row.get(0))
        .optional()?;
    Ok(raw.as_deref().and_then(decode_meta))
}

/// Blocking: read meta and every blob, ordered for display.
fn load_store(path: &Path) -> rusqlite::Result<Store> {
    let conn = open_read_only(path)?;
    let meta = read_meta(&conn)?;

    let mut stmt = conn.prepare("SELECT id, data FROM blobs ORDER BY rowid")?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?)))?;
    let mut blobs = Vec::new();
    for row in rows {
        blobs.push(row?);
    }

    let root = meta.as_ref().and_then(|m| m.latest_root_blob_id.as_deref());
    if let Some(order) = root.and_then(|id| tree_order(&blobs, id)) {
        blobs = order;
    }
    Ok(Store { meta, blobs })
}

/// Children of the root blob, in reference order. `None` when the root is
/// missing or lists no known children.
fn tree_order(blobs: &[(String, Vec<u8>)], root_id: &str) -> Option<Vec<(String, Vec<u8>)>> {
    let (_, root) = blobs.iter().find(|(id, _)| id == root_id)?;
    let by_id: HashMap<&str, &Vec<u8>> = blobs.iter().map(|(id, data)| (id.as_str(), data)).collect();
    let ordered: Vec<_> = child_refs(root)
        .into_iter()
        .filter_map(|id| by_id.get(id.as_str()).map(|data| (id.clone(), (*data).clone())))
        .collect();
    (!ordered.is_empty()).then_some(ordered)
}

fn strip_user_query(text: &str) -> String {
    match USER_QUERY.captures(text).and_then(|c| c.get(1)) {
        Some(inner) => inner.as_str().trim().to_string(),
        None => text.trim().to_string(),
    }
}

/// One decoded chat message.
#[derive(Debug, Deserialize)]
struct Message {
    role: String,
    #[serde(default)]
    content: Value,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum Part {
    Text {
        #[serde(default)]
        text: String,
    },
    Reasoning {
        #[serde(default)]
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        #[serde(default)]
        args: Value,
    },
    #[serde(rename_all = "camelCase")]
    ToolResult {
        tool_call_id: String,
        #[serde(default)]
        result: Value,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Other,
}

fn parts_of(content: &Value) -> Vec<Part> {
    match content {
        Value::String(s) => vec![Part::Text { text: s.clone() }],
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| match Part::deserialize(p) {
                Ok(part) => Some(part),
                Err(e) => {
                    tracing::debug!(error = %e, "Skipping malformed message part");
                    None
                }
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn messages(store: &Store) -> impl Iterator<Item = (&str, Message)> {
    store.blobs.iter().filter_map(|(id, data)| match decode_blob(data) {
        DecodedBlob::Json(value) if value.get("role").is_some() => match Message::deserialize(&value) {
            Ok(message) => Some((id.as_str(), message)),
            Err(e) => {
                tracing::debug!(blob = %id, error = %e, "Skipping blob that is not a message");
                None
            }
        },
        _ => None,
    })
}

fn first_user_text(store: &Store) -> Option<String> {
    messages(store)
        .filter(|(_, m)| m.role == "user")
        .find_map(|(_, m)| title_from_message(&strip_user_query(&text_of(&m.content))))
}

fn summarize(store: &Store) -> StoreSummary {
    let meta = store.meta.as_ref();
    StoreSummary {
        title: meta
            .and_then(|m| m.name.as_deref())
            .and_then(title_from_message)
            .or_else(|| first_user_text(store)),
        created_at: meta.and_then(|m| m.created_at.as_ref()).and_then(normalize_timestamp),
    }
}

/// Convert a store to units. Tool results fold into their call's unit.
fn store_units(store: &Store) -> Vec<Unit> {
    let timestamp = store
        .meta
        .as_ref()
        .and_then(|m| m.created_at.as_ref())
        .and_then(normalize_timestamp);

    let mut units: Vec<(String, NormalizedEntry)> = Vec::new();
    let mut calls: HashMap<String, usize> = HashMap::new();

    for (blob_id, message) in messages(store) {
        match message.role.as_str() {
            "user" => {
                let text = strip_user_query(&text_of(&message.content));
                if !text.is_empty() {
                    units.push((format!("{blob_id}:user"), NormalizedEntry::user(text)));
                }
            }
            "assistant" => {
                for (i, part) in parts_of(&message.content).into_iter().enumerate() {
                    let key = format!("{blob_id}:{i}");
                    match part {
                        Part::Text { text } if !text.trim().is_empty() => {
                            units.push((key, NormalizedEntry::assistant(text.trim())));
                        }
                        Part::Reasoning { text } if !text.trim().is_empty() => {
                            units.push((key, NormalizedEntry::thinking(text.trim())));
                        }
                        Part::ToolCall {
                            tool_call_id,
                            tool_name,
                            args,
                        } => {
                            let entry = tool_use_entry(&tool_name, &args, None);
                            calls.insert(tool_call_id, units.len());
                            units.push((key, entry));
                        }
                        _ => {}
                    }
                }
            }
            "tool" => {
                for part in parts_of(&message.content) {
                    let Part::ToolResult {
                        tool_call_id,
                        result,
                        is_error,
                    } = part
                    else {
                        continue;
                    };
                    match calls.get(&tool_call_id) {
                        Some(&at) => fold_result(&mut units[at].1, result, is_error),
                        None => tracing::debug!(tool_call_id = %tool_call_id, "Tool result without a call; skipped"),
                    }
                }
            }
            // system prompts and anything newer
            _ => {}
        }
    }

    units
        .into_iter()
        .map(|(key, entry)| Unit::new(key, entry.with_timestamp(timestamp.clone())))
        .collect()
}

fn fold_result(entry: &mut NormalizedEntry, result: Value, is_error: bool) {
    match entry.action() {
        Some(ActionType::CommandRun { .. }) => {
            let output = text_of(&result);
            let output = if output.is_empty() && !result.is_null() {
                result.to_string()
            } else {
                output
            };
            set_command_result(
                entry,
                CommandRunResult {
                    exit_status: Some(CommandExitStatus::Success { success: !is_error }),
                    output: Some(output.trim().to_string()).filter(|s| !s.is_empty()),
                },
            );
        }
        Some(ActionType::Tool { .. }) => {
            let value = match result {
                Value::String(s) => ToolResult::markdown(s),
                other => ToolResult::json(other),
            };
            set_tool_result(entry, value);
        }
        _ => {}
    }
}

impl CursorSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            summaries: TitleCache::new(),
        }
    }

    /// Chat directories of a project that hold a store.
    async fn chats(&self, project_key: &str) -> Result<Vec<(PathBuf, SystemTime)>, DiscoveryError> {
        let mut chats = Vec::new();
        for (dir, meta) in read_dir_entries(&self.root.join(project_key)).await? {
            if !meta.is_dir() {
                continue;
            }
            let store = dir.join(STORE_FILE);
            if let Some(mtime) = store_mtime(&store).await {
                chats.push((dir, mtime));
            }
        }
        chats.sort_by_key(|(_, mtime)| std::cmp::Reverse(*mtime));
        Ok(chats)
    }
}

/// Latest write to the store, counting its WAL.
async fn store_mtime(store: &Path) -> Option<SystemTime> {
    let main = tokio::fs::metadata(store).await.ok()?;
    let mut mtime = modified(&main)?;
    let wal = PathBuf::from(format!("{}-wal", store.display()));
    if let Ok(meta) = tokio::fs::metadata(&wal).await {
        if let Some(wal_mtime) = modified(&meta) {
            mtime = mtime.max(wal_mtime);
        }
    }
    Some(mtime)
}

async fn load_store_async(path: PathBuf) -> Result<Store, StreamError> {
    if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
        return Err(StreamError::not_found(path.display().to_string()));
    }
    let db = path.clone();
    tokio::task::spawn_blocking(move || load_store(&db))
        .await
        .map_err(|e| StreamError::Io {
            path: path.clone(),
            source: std::io::Error::other(e),
        })?
        .map_err(|e| StreamError::sqlite(path, e))
}

#[async_trait]
impl SessionSource for CursorSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Cursor
    }

    async fn list_projects(&self) -> Result<Vec<ProjectInfo>, DiscoveryError> {
        let mut projects = Vec::new();
        for (dir, meta) in read_dir_entries(&self.root).await? {
            if !meta.is_dir() {
                continue;
            }
            let key = file_name(&dir);
            let chats = self.chats(&key).await?;
            if chats.is_empty() {
                continue;
            }
            projects.push(ProjectInfo {
                id: ProjectId::new(SourceKind::Cursor, key.clone()),
                source: SourceKind::Cursor,
                display_name: key.chars().take(12).collect(),
                path: None,
                location: dir.to_string_lossy().into_owned(),
                updated_at: chats.first().map(|(_, mtime)| system_time_to_rfc3339(*mtime)),
                session_count: chats.len(),
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
        for (dir, mtime) in self.chats(project_key).await? {
            let store_path = dir.join(STORE_FILE);
            let load = || async {
                match load_store_async(store_path.clone()).await {
                    Ok(store) => Some(summarize(&store)),
                    Err(e) => {
                        tracing::debug!(path = %store_path.display(), error = %e, "Skipping unreadable chat store");
                        None
                    }
                }
            };
            // `mtime` counts the WAL, so appends that have not been
            // checkpointed still invalidate the entry.
            let Some(summary) = self.summaries.get_or_load_at(&store_path, mtime, load).await else {
                continue;
            };
            let mut info = SessionInfo::new(
                SessionId::new(SourceKind::Cursor, project_key, file_name(&dir)),
                store_path.to_string_lossy(),
            );
            info.title = summary.title;
            info.created_at = summary.created_at;
            info.updated_at = Some(system_time_to_rfc3339(mtime));
            sessions.push(info);
        }
        Ok(sessions)
    }

    async fn locate(&self, session: &SessionId) -> Result<SessionLocation, StreamError> {
        if !is_safe_key(&session.project_key) || !is_safe_key(&session.session_key) {
            return Err(StreamError::not_found(session.to_string()));
        }
        let direct = self
            .root
            .join(&session.project_key)
            .join(&session.session_key)
            .join(STORE_FILE);
        if tokio::fs::try_exists(&direct).await.unwrap_or(false) {
            Ok(SessionLocation {
                project_key: session.project_key.clone(),
                session_key: session.session_key.clone(),
                path: direct,
            })
        } else {
            Err(StreamError::not_found(session.to_string()))
        }
    }

    fn open_stream(&self, location: SessionLocation, ctx: StreamContext) -> EntryStream {
        let chat_dir = location
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| location.path.clone());
        let target = WatchTarget::Dir {
            root: chat_dir,
            recursive: false,
            filter: None,
        };
        reconcile_stream(CursorSnapshot { path: location.path }, target, ctx)
    }

    async fn project_key_for(&self, workspace: &Path) -> String {
        workspace_hash(workspace)
    }

    fn scrape_session_id(&self, line: &str) -> Option<String> {
        super::scrape_init_line(line)
    }

    async fn find_recent_session(&self, workspace: &Path, since: SystemTime) -> Option<SessionLocation> {
        let project_key = workspace_hash(workspace);
        let (chat_dir, mtime) = self.chats(&project_key).await.ok()?.into_iter().next()?;
        if mtime < since {
            return None;
        }
        Some(SessionLocation {
            session_key: file_name(&chat_dir),
            path: chat_dir.join(STORE_FILE),
            project_key,
        })
    }
}

/// Re-reads one store into units.
#[derive(Debug, Clone)]
pub struct CursorSnapshot {
    pub path: PathBuf,
}

#[async_trait]
impl Snapshot for CursorSnapshot {
    async fn snapshot(&self) -> Result<Vec<Unit>, StreamError> {
        let store = load_store_async(self.path.clone()).await?;
        Ok(store_units(&store))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_trail_types::EntryType;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn create_store(path: &Path, meta: Option<Value>, blobs: &[(&str, Vec<u8>)]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(
            "CREATE TABLE blobs (id TEXT PRIMARY KEY, data BLOB);
             CREATE TABLE meta (key TEXT PRIMARY KEY, value TEXT);",
        )
        .unwrap();
        if let Some(meta) = meta {
            conn.execute(
                "INSERT INTO meta (key, value) VALUES ('0', ?1)",
                [hex::encode(meta.to_string())],
            )
            .unwrap();
        }
        for (id, data) in blobs {
            conn.execute(
                "INSERT INTO blobs (id, data) VALUES (?1, ?2)",
                rusqlite::params![id, data],
            )
            .unwrap();
        }
    }

    fn json_blob(value: Value) -> Vec<u8> {
        value.to_string().into_bytes()
    }

    fn conversation() -> Vec<(&'static str, Vec<u8>)> {
        vec![
            ("b0", json_blob(json!({"role": "system", "content": "You are an agent"}))),
            (
                "b1",
                json_blob(json!({"role": "user", "content": "<user_info>os</user_info>\n<user_query>run the tests</user_query>"})),
            ),
            (
                "b2",
                json_blob(json!({"role": "assistant", "content": [
                    {"type": "reasoning", "text": "Need cargo"},
                    {"type": "text", "text": "Running."},
                    {"type": "tool-call", "toolCallId": "t1", "toolName": "Shell", "args": {"command": "cargo test"}}
                ]})),
            ),
            (
                "b3",
                json_blob(json!({"role": "tool", "content": [
                    {"type": "tool-result", "toolCallId": "t1", "toolName": "Shell", "result": "ok"}
                ]})),
            ),
        ]
    }

    #[test]
    fn units_fold_tool_results() {
        let tmp = tempfile::tempdir().unwrap();
        let db = tmp.path().join("p").join("chat").join(STORE_FILE);
        create_store(&db, None, &conversation());

        let units = store_units(&load_store(&db).unwrap());
        let kinds: Vec<_> = units.iter().map(|u| u.entry.entry_type.clone()).collect();
        assert_eq!(kinds.len(), 4);
        assert_eq!(kinds[0], EntryType::UserMessage);
        assert_eq!(units[0].entry.content, "run the tests");
        assert_eq!(kinds[1], EntryType::Thinking);
        assert_eq!(kinds[2], EntryType::AssistantMessage);
        match units[3].entry.action() {
            Some(ActionType::CommandRun {
                command,
                result: Some(result),
            }) => {
                assert_eq!(command, "cargo test");
                assert_eq!(result.output.as_deref(), Some("ok"));
            }
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[test]
    fn root_blob_orders_messages() {
        let tmp = tempfile::tempdir().unwrap();
        let db = tmp.path().join("p").join("chat").join(STORE_FILE);
        let a = hex::encode([0xa1u8; 32]);
        let b = hex::encode([0xb2u8; 32]);

        // Root lists b before a, the reverse of insertion order.
        let mut root = Vec::new();
        for id in [[0xb2u8; 32], [0xa1u8; 32]] {
            root.extend_from_slice(&[0x0a, 32]);
            root.extend_from_slice(&id);
        }
        create_store(
            &db,
            Some(json!({"agentId": "x", "latestRootBlobId": "root", "name": "Refactor", "createdAt": 1_700_000_000_000i64})),
            &[
                (a.as_str(), json_blob(json!({"role": "user", "content": "first inserted"}))),
                (b.as_str(), json_blob(json!({"role": "user", "content": "second inserted"}))),
                ("root", root),
            ],
        );

        let store = load_store(&db).unwrap();
        assert_eq!(store.meta.as_ref().unwrap().name.as_deref(), Some("Refactor"));
        let units = store_units(&store);
        let contents: Vec<_> = units.iter().map(|u| u.entry.content.as_str()).collect();
        assert_eq!(contents, vec!["second inserted", "first inserted"]);
        assert_eq!(units[0].entry.timestamp.as_deref(), Some("2023-11-14T22:13:20.000Z"));
    }

    #[test]
    fn undecodable_blobs_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let db = tmp.path().join("p").join("chat").join(STORE_FILE);
        create_store(
            &db,
            None,
            &[
                ("x", vec![0xff, 0x00, 0x13]),
                ("y", json_blob(json!({"role": "assistant", "content": "still here"}))),
            ],
        );
        let units = store_units(&load_store(&db).unwrap());
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].entry.content, "still here");
    }

    #[tokio::test]
    async fn lists_and_locates_by_workspace_hash() {
        let tmp = tempfile::tempdir().unwrap();
        let workspace = Path::new("/work/app");
        let hash = workspace_hash(workspace);
        let db = tmp.path().join(&hash).join("chat-1").join(STORE_FILE);
        create_store(&db, Some(json!({"name": "Run tests"})), &conversation());

        let source = CursorSource::new(tmp.path());
        assert_eq!(source.project_key_for(workspace).await, hash);

        let projects = source.list_projects().await.unwrap();
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].session_count, 1);

        let sessions = source.list_sessions(&hash).await.unwrap();
        assert_eq!(sessions[0].id.to_string(), format!("cursor:{hash}:chat-1"));
        assert_eq!(sessions[0].title.as_deref(), Some("Run tests"));

        let location = source.locate(&sessions[0].id).await.unwrap();
        assert_eq!(location.path, db);

        let since = SystemTime::now() - std::time::Duration::from_secs(60);
        let recent = source.find_recent_session(workspace, since).await.unwrap();
        assert_eq!(recent.project_key, hash);
        assert_eq!(recent.session_key, "chat-1");
    }

    #[tokio::test]
    async fn recent_session_ignores_other_workspaces() {
        let tmp = tempfile::tempdir().unwrap();
        let db = tmp.path().join("unrelated_project_hash").join("other-chat").join(STORE_FILE);
        create_store(&db, None, &conversation());

        let source = CursorSource::new(tmp.path());
        let since = SystemTime::now() - std::time::Duration::from_secs(60);
        assert!(source.find_recent_session(Path::new("/work/app"), since).await.is_none());
    }

    #[test]
    fn workspace_hash_is_md5_hex() {
        assert_eq!(workspace_hash(Path::new("")), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[tokio::test]
    async fn listing_reuses_summary_of_unchanged_store() {
        let tmp = tempfile::tempdir().unwrap();
        let db = tmp.path().join("p").join("chat").join(STORE_FILE);
        create_store(&db, Some(json!({"name": "Original"})), &conversation());
        let t0 = SystemTime::now() - std::time::Duration::from_secs(600);
        let set_mtime = |at: SystemTime| {
            std::fs::File::options().write(true).open(&db).unwrap().set_modified(at).unwrap();
        };
        set_mtime(t0);

        let source = CursorSource::new(tmp.path());
        assert_eq!(source.list_sessions("p").await.unwrap()[0].title.as_deref(), Some("Original"));

        // A store that no longer opens is not read again while its mtime
        // is unchanged.
        std::fs::write(&db, b"not a database").unwrap();
        set_mtime(t0);
        let sessions = source.list_sessions("p").await.unwrap();
        assert_eq!(sessions[0].title.as_deref(), Some("Original"));

        set_mtime(t0 + std::time::Duration::from_secs(1));
        assert!(source.list_sessions("p").await.unwrap().is_empty());
    }

    #[test]
    fn meta_accepts_plain_json() {
        let meta = decode_meta(r#"{"name":"n","latestRootBlobId":"r"}"#).unwrap();
        assert_eq!(meta.latest_root_blob_id.as_deref(), Some("r"));
        assert!(decode_meta("zz-not-hex").is_none());
    }
}
