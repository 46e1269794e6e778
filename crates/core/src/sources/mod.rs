//! Source adapters: one per agent CLI, behind the [`SessionSource`] trait,
//! plus the [`SessionSources`] factory that routes composite ids to them.
//!
//! Adapters hold only immutable configuration (their root directory and a
//! title cache). Everything stream-scoped is built inside `open_stream`.

pub mod blob;
pub mod claude;
pub mod codex;
pub mod cursor;
pub mod gemini;
pub mod opencode;

use std::collections::HashMap;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use agent_trail_types::{ProjectId, ProjectInfo, SessionId, SessionInfo, SourceKind};
use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncBufReadExt;

use crate::config::StreamConfig;
use crate::error::{DiscoveryError, StreamError};
use crate::paths::SourceRoots;
use crate::registry::ActiveSessionRegistry;
use crate::stream::{error_stream, EntryStream, StreamContext};

pub use claude::ClaudeSource;
pub use codex::CodexSource;
pub use cursor::CursorSource;
pub use gemini::GeminiSource;
pub use opencode::OpencodeSource;

/// Where a session's backing store lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLocation {
    pub project_key: String,
    pub session_key: String,
    /// The JSONL/JSON file, the SQLite file, or the session's JSON record.
    pub path: PathBuf,
}

/// Capability contract every agent adapter implements.
#[async_trait]
pub trait SessionSource: Send + Sync + 'static {
    fn kind(&self) -> SourceKind;

    /// Every project this source knows about. A missing root is empty,
    /// not an error.
    async fn list_projects(&self) -> Result<Vec<ProjectInfo>, DiscoveryError>;

    /// Sessions of one project, most recently updated first.
    async fn list_sessions(&self, project_key: &str) -> Result<Vec<SessionInfo>, DiscoveryError>;

    /// Resolve a session to its backing store.
    async fn locate(&self, session: &SessionId) -> Result<SessionLocation, StreamError>;

    /// Start a stream over a located session. Each call gets fresh
    /// correlation state.
    fn open_stream(&self, location: SessionLocation, ctx: StreamContext) -> EntryStream;

    /// The project key this source files a workspace under.
    async fn project_key_for(&self, workspace: &Path) -> String;

    /// Session key announced on one line of the agent's stdout, if any.
    fn scrape_session_id(&self, line: &str) -> Option<String>;

    /// Newest session artifact for `workspace` modified at or after `since`.
    async fn find_recent_session(&self, workspace: &Path, since: SystemTime) -> Option<SessionLocation>;
}

/// Routes composite ids to the adapter for their source.
#[derive(Clone)]
pub struct SessionSources {
    adapters: HashMap<SourceKind, Arc<dyn SessionSource>>,
    registry: ActiveSessionRegistry,
    config: StreamConfig,
}

impl std::fmt::Debug for SessionSources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.adapters.keys().collect();
        kinds.sort();
        f.debug_struct("SessionSources")
            .field("adapters", &kinds)
            .field("config", &self.config)
            .finish()
    }
}

impl SessionSources {
    /// All five adapters over `roots`.
    pub fn new(roots: &SourceRoots, registry: ActiveSessionRegistry, config: StreamConfig) -> Self {
        Self::empty(registry, config)
            .with_source(Arc::new(ClaudeSource::new(roots.claude.clone())))
            .with_source(Arc::new(CodexSource::new(roots.codex.clone())))
            .with_source(Arc::new(GeminiSource::new(roots.gemini.clone())))
            .with_source(Arc::new(CursorSource::new(roots.cursor.clone())))
            .with_source(Arc::new(OpencodeSource::new(roots.opencode.clone())))
    }

    pub fn empty(registry: ActiveSessionRegistry, config: StreamConfig) -> Self {
        Self {
            adapters: HashMap::new(),
            registry,
            config,
        }
    }

    pub fn with_source(mut self, source: Arc<dyn SessionSource>) -> Self {
        self.adapters.insert(source.kind(), source);
        self
    }

    pub fn get(&self, kind: SourceKind) -> Option<Arc<dyn SessionSource>> {
        self.adapters.get(&kind).cloned()
    }

    pub fn registry(&self) -> &ActiveSessionRegistry {
        &self.registry
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    fn adapter(&self, kind: SourceKind) -> Result<Arc<dyn SessionSource>, DiscoveryError> {
        self.get(kind).ok_or(DiscoveryError::UnknownSource(kind))
    }

    pub async fn list_projects(&self, kind: SourceKind) -> Result<Vec<ProjectInfo>, DiscoveryError> {
        self.adapter(kind)?.list_projects().await
    }

    /// Projects of every registered source. A failing source is logged
    /// and skipped.
    pub async fn list_all_projects(&self) -> Vec<ProjectInfo> {
        let mut kinds: Vec<_> = self.adapters.keys().copied().collect();
        kinds.sort();
        let mut all = Vec::new();
        for kind in kinds {
            match self.list_projects(kind).await {
                Ok(projects) => all.extend(projects),
                Err(e) => tracing::warn!(source = %kind, error = %e, "Listing projects failed"),
            }
        }
        all
    }

    /// Sessions of `project_id` (`source:projectKey`), with `running`
    /// stamped from the registry. Active sessions that have no artifact
    /// on disk yet are listed too.
    pub async fn list_sessions(&self, project_id: &str) -> Result<Vec<SessionInfo>, DiscoveryError> {
        let project: ProjectId = project_id.parse()?;
        let mut sessions = self.adapter(project.source)?.list_sessions(&project.key).await?;

        for session in &mut sessions {
            session.running = self.registry.is_active(&session.id);
        }
        for id in self.registry.active_ids() {
            if id.source == project.source
                && id.project_key == project.key
                && !sessions.iter().any(|s| s.id == id)
            {
                let mut info = SessionInfo::new(id, String::new());
                info.running = true;
                sessions.insert(0, info);
            }
        }
        Ok(sessions)
    }

    /// Open a patch stream for `session_id`. Parse and lookup failures
    /// become a single `error` frame.
    pub async fn open_stream(&self, session_id: &str) -> EntryStream {
        let id: SessionId = match session_id.parse() {
            Ok(id) => id,
            Err(e) => return error_stream(StreamError::from(e).to_string()),
        };
        let Some(adapter) = self.get(id.source) else {
            return error_stream(StreamError::UnknownSource(id.source).to_string());
        };

        // A placeholder id that has since been resolved streams the real session.
        let target = self.registry.canonical(&id);
        match adapter.locate(&target).await {
            Ok(location) => {
                let ctx = StreamContext::new(target, self.registry.clone(), self.config.clone());
                adapter.open_stream(location, ctx)
            }
            Err(e) => {
                tracing::info!(session_id = %id, error = %e, "Cannot open stream");
                error_stream(e.to_string())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Shared filesystem helpers
// ---------------------------------------------------------------------------

/// Keys come from callers; they must not walk out of the source root.
pub(crate) fn is_safe_key(key: &str) -> bool {
    !key.is_empty()
        && key != "."
        && key != ".."
        && !key.contains(['/', '\\', '\0'])
}

/// Entries of `dir` with their metadata. A missing directory is empty.
pub(crate) async fn read_dir_entries(dir: &Path) -> Result<Vec<(PathBuf, Metadata)>, DiscoveryError> {
    let mut rd = match tokio::fs::read_dir(dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(DiscoveryError::io(dir, e)),
    };
    let mut out = Vec::new();
    while let Some(entry) = rd.next_entry().await.map_err(|e| DiscoveryError::io(dir, e))? {
        match entry.metadata().await {
            Ok(meta) => out.push((entry.path(), meta)),
            Err(e) => tracing::debug!(path = %entry.path().display(), error = %e, "Skipping unreadable entry"),
        }
    }
    Ok(out)
}

pub(crate) fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension().is_some_and(|e| e == ext)
}

pub(crate) fn file_stem(path: &Path) -> Option<String> {
    path.file_stem().map(|s| s.to_string_lossy().into_owned())
}

pub(crate) fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

pub(crate) fn modified(meta: &Metadata) -> Option<SystemTime> {
    meta.modified().ok()
}

/// First non-empty line of a text file.
pub(crate) async fn read_first_line(path: &Path) -> Option<String> {
    let file = tokio::fs::File::open(path).await.ok()?;
    let mut lines = tokio::io::BufReader::new(file).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if !line.trim().is_empty() {
            return Some(line);
        }
    }
    None
}

/// Parse one record, logging and discarding malformed input.
pub(crate) fn parse_record(line: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(line) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::debug!(error = %e, len = line.len(), "Skipping malformed record");
            None
        }
    }
}

/// Read and parse a whole JSON file.
pub(crate) async fn read_json(path: &Path) -> Result<Value, StreamError> {
    let bytes = tokio::fs::read(path).await.map_err(|e| StreamError::io(path, e))?;
    serde_json::from_slice(&bytes).map_err(|e| StreamError::Io {
        path: path.to_path_buf(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
    })
}

/// Newest file in `dir` accepted by `accept`, modified at or after `since`.
pub(crate) async fn newest_since(
    dir: &Path,
    since: SystemTime,
    accept: impl Fn(&Path) -> bool,
) -> Option<(PathBuf, SystemTime)> {
    read_dir_entries(dir)
        .await
        .ok()?
        .into_iter()
        .filter(|(path, meta)| meta.is_file() && accept(path))
        .filter_map(|(path, meta)| Some((path, modified(&meta)?)))
        .filter(|(_, mtime)| *mtime >= since)
        .max_by_key(|(_, mtime)| *mtime)
}

/// Text of a string, or of the `text` fields of an array of parts.
pub(crate) fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| match p {
                Value::String(s) => Some(s.as_str()),
                other => other.get("text").and_then(Value::as_str),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Object(_) => value
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        _ => String::new(),
    }
}

/// `{"type":"system","subtype":"init","session_id":...}` as printed by
/// stream-json CLIs.
pub(crate) fn scrape_init_line(line: &str) -> Option<String> {
    let value: Value = serde_json::from_str(line.trim()).ok()?;
    let is_init = matches!(value.get("type").and_then(Value::as_str), Some("system" | "init"))
        && value
            .get("subtype")
            .and_then(Value::as_str)
            .map_or(true, |s| s == "init");
    if !is_init {
        return None;
    }
    value
        .get("session_id")
        .or_else(|| value.get("sessionId"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use agent_trail_types::StreamFrame;

    #[test]
    fn safe_keys() {
        assert!(is_safe_key("abc-123"));
        assert!(is_safe_key("a:b"));
        assert!(!is_safe_key(".."));
        assert!(!is_safe_key("a/b"));
        assert!(!is_safe_key(""));
    }

    #[test]
    fn text_of_shapes() {
        assert_eq!(text_of(&serde_json::json!("hi")), "hi");
        assert_eq!(
            text_of(&serde_json::json!([{"type": "text", "text": "a"}, {"text": "b"}])),
            "a\nb"
        );
        assert_eq!(text_of(&serde_json::json!(42)), "");
    }

    #[test]
    fn scrape_init() {
        assert_eq!(
            scrape_init_line(r#"{"type":"system","subtype":"init","session_id":"abc"}"#).as_deref(),
            Some("abc")
        );
        assert_eq!(
            scrape_init_line(r#"{"type":"init","session_id":"g1"}"#).as_deref(),
            Some("g1")
        );
        assert!(scrape_init_line(r#"{"type":"assistant","session_id":"abc"}"#).is_none());
        assert!(scrape_init_line("not json").is_none());
    }

    #[tokio::test]
    async fn factory_reports_bad_ids_as_error_frames() {
        let tmp = tempfile::tempdir().unwrap();
        let sources = SessionSources::new(
            &SourceRoots::under(tmp.path()),
            ActiveSessionRegistry::new(),
            StreamConfig::default(),
        );

        let frames: Vec<_> = sources.open_stream("nope:p:s").await.collect().await;
        assert!(matches!(frames.as_slice(), [StreamFrame::Error(msg)] if msg.contains("nope")));

        let frames: Vec<_> = sources.open_stream("claude:proj:missing").await.collect().await;
        assert!(matches!(frames.as_slice(), [StreamFrame::Error(msg)] if msg.contains("not found")));
    }

    #[tokio::test]
    async fn factory_lists_registered_sessions_without_artifacts() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = ActiveSessionRegistry::new();
        let sources = SessionSources::new(&SourceRoots::under(tmp.path()), registry.clone(), StreamConfig::default());

        registry.register(SessionId::new(SourceKind::Claude, "proj", "pending-1"));
        let sessions = sources.list_sessions("claude:proj").await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert!(sessions[0].running);
        assert!(sources.list_projects(SourceKind::Codex).await.unwrap().is_empty());
    }
}
