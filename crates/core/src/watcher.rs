//! Change notifications for a session's backing store.
//!
//! A [`FileWatch`] wraps a notify watcher and forwards matching events into
//! a capacity-1 tokio channel. Bursts collapse into a single pending wake-up
//! (`try_send` on a full channel is a no-op), which is all a stream needs:
//! every wake-up triggers a full re-read or re-scan anyway.
//!
//! Dropping the `FileWatch` drops the notify watcher and releases its
//! descriptors.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

/// Predicate over the paths of one notify event.
pub type PathFilter = Arc<dyn Fn(&Path) -> bool + Send + Sync>;

pub struct FileWatch {
    _watcher: RecommendedWatcher,
    rx: mpsc::Receiver<()>,
    root: PathBuf,
}

impl std::fmt::Debug for FileWatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWatch").field("root", &self.root).finish()
    }
}

impl FileWatch {
    /// Watch `root`. When `filter` is given, only events touching a path it
    /// accepts produce a wake-up.
    pub fn new(root: &Path, recursive: bool, filter: Option<PathFilter>) -> notify::Result<Self> {
        let (tx, rx) = mpsc::channel::<()>(1);

        let mut watcher =
            notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
                match res {
                    Ok(event) => {
                        if !matches!(
                            event.kind,
                            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                        ) {
                            return;
                        }
                        let relevant = match &filter {
                            Some(accept) => event.paths.iter().any(|p| accept(p)),
                            None => true,
                        };
                        if relevant {
                            // Full channel means a wake-up is already pending.
                            let _ = tx.try_send(());
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "File watcher error");
                    }
                }
            })?;

        let mode = if recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher.watch(root, mode)?;
        tracing::debug!(path = %root.display(), recursive, "Watching for changes");

        Ok(Self {
            _watcher: watcher,
            rx,
            root: root.to_path_buf(),
        })
    }

    /// Watch the parent directory of `file`, waking only for that file name.
    ///
    /// Watching the directory (not the file) survives writers that replace
    /// the file by rename.
    pub fn for_file(file: &Path) -> notify::Result<Self> {
        let parent = file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let name = file.file_name().map(|n| n.to_os_string());
        let filter: PathFilter = Arc::new(move |p: &Path| match &name {
            Some(name) => p.file_name() == Some(name.as_os_str()),
            None => true,
        });
        Self::new(parent, false, Some(filter))
    }

    /// Wait for the next wake-up. Returns `false` once the watcher is gone.
    pub async fn changed(&mut self) -> bool {
        self.rx.recv().await.is_some()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn wakes_on_write_to_watched_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("s.jsonl");
        std::fs::write(&file, b"").unwrap();

        let mut watch = FileWatch::for_file(&file).unwrap();
        std::fs::write(&file, b"{}\n").unwrap();

        let woke = tokio::time::timeout(Duration::from_secs(5), watch.changed()).await;
        assert_eq!(woke.ok(), Some(true));
    }

    #[test]
    fn missing_root_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FileWatch::new(&dir.path().join("absent"), false, None).is_err());
    }
}
