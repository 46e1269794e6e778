//! Helpers shared by the adapters' listing code: workspace path recovery
//! from dash-encoded directory names, title previews, title caching and
//! timestamp normalization.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};

/// Titles longer than this are cut at a word boundary.
pub const TITLE_MAX_CHARS: usize = 80;

/// Upper bound on filesystem probes spent decoding one project name.
const MAX_PROBES: usize = 4096;

/// Result of decoding a dash-encoded workspace path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    pub full_path: String,
    pub display_name: String,
}

/// Recover `/Users/me/my-app` from `-Users-me-my-app`.
///
/// The encoding replaced `/` and `.` with `-`, so every dash is ambiguous.
/// Each dash is tried as `/`, `-` and `.` in turn; a `/` is only accepted
/// when the prefix before it is an existing directory, and the full result
/// must exist. When nothing on disk matches, every dash becomes `/`.
pub fn decode_dashed_path(encoded: &str) -> ResolvedPath {
    let name = encoded.strip_prefix('-').unwrap_or(encoded);
    if name.is_empty() {
        return ResolvedPath {
            full_path: "/".to_string(),
            display_name: "/".to_string(),
        };
    }

    let parts: Vec<&str> = name.split('-').collect();
    let mut probes = 0usize;
    let found = probe(&parts[1..], format!("/{}", parts[0]), &mut probes);
    let full_path = found.unwrap_or_else(|| format!("/{}", parts.join("/")));
    let display_name = Path::new(&full_path)
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| full_path.clone());

    ResolvedPath {
        full_path,
        display_name,
    }
}

fn probe(rest: &[&str], current: String, probes: &mut usize) -> Option<String> {
    *probes += 1;
    if *probes > MAX_PROBES {
        return None;
    }
    let Some((next, tail)) = rest.split_first() else {
        return Path::new(&current).exists().then_some(current);
    };

    if Path::new(&current).is_dir() {
        if let Some(found) = probe(tail, format!("{current}/{next}"), probes) {
            return Some(found);
        }
    }
    if let Some(found) = probe(tail, format!("{current}-{next}"), probes) {
        return Some(found);
    }
    // `.foo` directories encode as `--foo`, which splits into an empty part.
    probe(tail, format!("{current}.{next}"), probes)
}

/// Trim and truncate a string for display, preferring a word boundary.
/// Counts characters, not bytes.
pub fn truncate_preview(text: &str, max_len: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_len {
        return trimmed.to_string();
    }

    let truncated: String = trimmed.chars().take(max_len).collect();
    if let Some(space) = truncated.rfind(' ') {
        let chars_before = truncated[..space].chars().count();
        if chars_before > max_len / 2 {
            return format!("{}...", truncated[..space].trim_end());
        }
    }
    format!("{}...", truncated.trim_end())
}

/// First non-empty line of a message, collapsed to title length.
pub fn title_from_message(text: &str) -> Option<String> {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(truncate_preview(&collapsed, TITLE_MAX_CHARS))
    }
}

/// Caches listing data derived from a session's backing file, keyed by
/// path and mtime.
///
/// An entry is reused while the mtime is unchanged; a newer mtime reloads
/// it. Cloning shares the cache. The default payload is just the title;
/// adapters whose listings need more than a title cache a summary struct.
#[derive(Debug, Clone)]
pub struct TitleCache<T = Option<String>> {
    entries: Arc<Mutex<HashMap<PathBuf, (SystemTime, T)>>>,
}

impl<T> Default for TitleCache<T> {
    fn default() -> Self {
        Self {
            entries: Arc::default(),
        }
    }
}

impl<T: Clone> TitleCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached value for `path` at its current mtime, or run `load` and
    /// remember the result.
    pub async fn get_or_load<F, Fut>(&self, path: &Path, load: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let mtime = tokio::fs::metadata(path)
            .await
            .and_then(|m| m.modified())
            .ok();
        match mtime {
            Some(mtime) => self.get_or_load_at(path, mtime, load).await,
            None => load().await,
        }
    }

    /// Like [`get_or_load`](Self::get_or_load) with an mtime the caller
    /// already has, e.g. one that also counts a WAL file.
    pub async fn get_or_load_at<F, Fut>(&self, path: &Path, mtime: SystemTime, load: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if let Some((cached_at, value)) = self.lock().get(path) {
            if *cached_at == mtime {
                return value.clone();
            }
        }

        let value = load().await;
        self.lock().insert(path.to_path_buf(), (mtime, value.clone()));
        value
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, (SystemTime, T)>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub fn system_time_to_rfc3339(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn millis_to_rfc3339(millis: i64) -> Option<String> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Accept RFC 3339 strings or epoch numbers (seconds or milliseconds).
pub fn normalize_timestamp(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc).to_rfc3339_opts(SecondsFormat::Millis, true))
            .or_else(|| Some(s.clone()).filter(|s| !s.is_empty())),
        serde_json::Value::Number(n) => {
            let raw = n.as_i64()?;
            // Anything before 2001 in milliseconds is really seconds.
            let millis = if raw < 1_000_000_000_000 { raw * 1000 } else { raw };
            millis_to_rfc3339(millis)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn decode_falls_back_to_slashes() {
        let resolved = decode_dashed_path("-definitely-not-a-real-path-xyz");
        assert_eq!(resolved.full_path, "/definitely/not/a/real/path/xyz");
        assert_eq!(resolved.display_name, "xyz");
    }

    #[test]
    fn decode_prefers_existing_hyphenated_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let project = tmp.path().join("my-cool-app");
        std::fs::create_dir_all(&project).unwrap();

        let encoded = project.to_string_lossy().replace(['/', '.'], "-");
        let resolved = decode_dashed_path(&encoded);
        assert_eq!(resolved.full_path, project.to_string_lossy());
        assert_eq!(resolved.display_name, "my-cool-app");
    }

    #[test]
    fn decode_handles_dot_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let project = tmp.path().join(".config").join("tool");
        std::fs::create_dir_all(&project).unwrap();

        let encoded = project.to_string_lossy().replace(['/', '.'], "-");
        assert_eq!(decode_dashed_path(&encoded).full_path, project.to_string_lossy());
    }

    #[test]
    fn truncate_preview_word_boundary() {
        assert_eq!(truncate_preview("  short  ", 20), "short");
        assert_eq!(
            truncate_preview("the quick brown fox jumps", 18),
            "the quick brown..."
        );
        assert_eq!(truncate_preview("ééééééééé", 3), "ééé...");
    }

    #[test]
    fn title_collapses_whitespace() {
        assert_eq!(title_from_message("  fix\n the   bug "), Some("fix the bug".into()));
        assert_eq!(title_from_message(" \n "), None);
    }

    #[test]
    fn timestamps_normalize() {
        assert_eq!(
            normalize_timestamp(&serde_json::json!(1_700_000_000_000i64)).as_deref(),
            Some("2023-11-14T22:13:20.000Z")
        );
        assert_eq!(
            normalize_timestamp(&serde_json::json!(1_700_000_000)).as_deref(),
            Some("2023-11-14T22:13:20.000Z")
        );
        assert_eq!(
            normalize_timestamp(&serde_json::json!("2024-01-02T03:04:05Z")).as_deref(),
            Some("2024-01-02T03:04:05.000Z")
        );
        assert!(normalize_timestamp(&serde_json::Value::Null).is_none());
    }

    #[tokio::test]
    async fn title_cache_reloads_on_mtime_change() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("s.jsonl");
        std::fs::write(&file, "a").unwrap();

        let cache = TitleCache::new();
        let counter = AtomicUsize::new(0);
        let loads = &counter;
        let load = move || async move {
            loads.fetch_add(1, Ordering::SeqCst);
            Some("title".to_string())
        };

        assert_eq!(cache.get_or_load(&file, load).await.as_deref(), Some("title"));
        assert_eq!(cache.get_or_load(&file, load).await.as_deref(), Some("title"));
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        let later = SystemTime::now() + std::time::Duration::from_secs(60);
        std::fs::File::options()
            .write(true)
            .open(&file)
            .unwrap()
            .set_modified(later)
            .unwrap();
        cache.get_or_load(&file, load).await;
        assert_eq!(loads.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn title_cache_keys_on_caller_mtime() {
        let cache: TitleCache<usize> = TitleCache::new();
        let path = Path::new("/nonexistent/store.db");
        let t0 = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(10);
        let t1 = t0 + std::time::Duration::from_secs(1);

        assert_eq!(cache.get_or_load_at(path, t0, || async { 1 }).await, 1);
        assert_eq!(cache.get_or_load_at(path, t0, || async { 2 }).await, 1);
        assert_eq!(cache.get_or_load_at(path, t1, || async { 3 }).await, 3);
    }
}
