//! Stream controllers.
//!
//! Two shapes of backing store need two controllers:
//!
//! - [`jsonl_stream`] for append-only JSONL files. Reads by byte offset,
//!   accumulates partial lines, and hands each complete record to a
//!   [`RecordConverter`].
//! - [`reconcile_stream`] for stores that are rewritten in place or spread
//!   across many small files. Every pass re-derives the full list of
//!   emittable units from a [`Snapshot`] and the [`Reconciler`] emits only
//!   what changed.
//!
//! Both decide Replay vs Live once, at open time, from the registry. Live
//! streams run until the session drops out of the registry (or the store
//! reports completion), then do one last pass and finish. Dropping the
//! returned stream drops the watcher with it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;

use agent_trail_types::{NormalizedEntry, SessionId, StreamFrame};
use async_trait::async_trait;
use futures_util::Stream;
use sha2::{Digest, Sha256};
use tokio::time::MissedTickBehavior;

use crate::accumulator::LineAccumulator;
use crate::config::StreamConfig;
use crate::error::StreamError;
use crate::patch::PatchEmitter;
use crate::registry::ActiveSessionRegistry;
use crate::tail::FileTail;
use crate::watcher::{FileWatch, PathFilter};

/// Frames pushed to a viewer, in order. Never yields an `Err`: failures
/// arrive as a terminal [`StreamFrame::Error`].
pub type EntryStream = Pin<Box<dyn Stream<Item = StreamFrame> + Send>>;

/// Status sent in the `finished` frame when the whole store was read.
pub const STATUS_COMPLETED: &str = "completed";
/// Status sent when a live stream ends because its process went away.
pub const STATUS_EXITED: &str = "exited";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    Replay,
    Live,
}

/// Everything a controller needs besides the store itself.
#[derive(Debug, Clone)]
pub struct StreamContext {
    pub session_id: SessionId,
    pub registry: ActiveSessionRegistry,
    pub config: StreamConfig,
}

impl StreamContext {
    pub fn new(session_id: SessionId, registry: ActiveSessionRegistry, config: StreamConfig) -> Self {
        Self {
            session_id,
            registry,
            config,
        }
    }

    pub fn is_active(&self) -> bool {
        self.registry.is_active(&self.session_id)
    }

    pub fn mode(&self) -> StreamMode {
        if self.is_active() {
            StreamMode::Live
        } else {
            StreamMode::Replay
        }
    }
}

/// A single frame, then end of stream.
pub fn error_stream(message: impl Into<String>) -> EntryStream {
    let frame = StreamFrame::Error(message.into());
    Box::pin(futures_util::stream::iter([frame]))
}

// ---------------------------------------------------------------------------
// JSONL controller
// ---------------------------------------------------------------------------

/// Per-stream conversion of raw JSONL records into patches.
///
/// A fresh converter is built for every stream; all correlation state
/// lives inside it.
pub trait RecordConverter: Send + 'static {
    /// Convert one complete line. Malformed lines are logged and skipped.
    fn convert(&mut self, line: &str, out: &mut PatchEmitter);

    /// End of input: flush buffered text.
    fn finish(&mut self, _out: &mut PatchEmitter) {}

    /// The store has written its completion marker.
    fn is_complete(&self) -> bool {
        false
    }
}

struct JsonlState<C> {
    tail: FileTail,
    acc: LineAccumulator,
    emitter: PatchEmitter,
    converter: C,
}

impl<C: RecordConverter> JsonlState<C> {
    /// Read one chunk and convert every record it completed. `None` once
    /// the reader has caught up with the file.
    async fn pump(&mut self) -> Result<Option<Vec<StreamFrame>>, StreamError> {
        let read = self
            .tail
            .read_chunk()
            .await
            .map_err(|e| StreamError::io(self.tail.path(), e))?;
        if read.reset {
            self.acc.reset();
        }
        if read.bytes.is_empty() {
            return Ok(None);
        }
        let mut frames = Vec::new();
        for line in self.acc.push(&read.bytes) {
            self.converter.convert(&line, &mut self.emitter);
            frames.extend(self.emitter.take_frame());
        }
        Ok(Some(frames))
    }

    fn finish(&mut self) -> Vec<StreamFrame> {
        let mut frames = Vec::new();
        if let Some(line) = self.acc.finish() {
            self.converter.convert(&line, &mut self.emitter);
            frames.extend(self.emitter.take_frame());
        }
        self.converter.finish(&mut self.emitter);
        frames.extend(self.emitter.take_frame());
        frames
    }
}

/// Stream a JSONL session file through `converter`.
pub fn jsonl_stream<C: RecordConverter>(path: PathBuf, converter: C, ctx: StreamContext) -> EntryStream {
    Box::pin(async_stream::stream! {
        let mode = ctx.mode();
        tracing::info!(session_id = %ctx.session_id, path = %path.display(), ?mode, "Opening JSONL stream");

        let mut state = JsonlState {
            tail: FileTail::new(&path, ctx.config.read_chunk),
            acc: LineAccumulator::new(ctx.config.max_pending_bytes),
            emitter: PatchEmitter::new(),
            converter,
        };

        loop {
            match state.pump().await {
                Ok(Some(frames)) => for frame in frames { yield frame; },
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(session_id = %ctx.session_id, error = %e, "JSONL stream failed");
                    yield StreamFrame::Error(e.to_string());
                    return;
                }
            }
        }

        let mut status = STATUS_COMPLETED;
        if mode == StreamMode::Live && !state.converter.is_complete() {
            let mut watch = open_watch(&WatchTarget::File(path.clone()));
            let mut tick = tokio::time::interval(ctx.config.poll_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tick.tick().await;

            loop {
                tokio::select! {
                    changed = next_change(&mut watch) => {
                        if !changed {
                            watch = None;
                        }
                        tokio::time::sleep(ctx.config.debounce).await;
                    }
                    _ = tick.tick() => {}
                }

                // Sample liveness before reading so the last read covers
                // everything written before the process went away.
                let still_active = ctx.is_active();
                loop {
                    match state.pump().await {
                        Ok(Some(frames)) => for frame in frames { yield frame; },
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!(session_id = %ctx.session_id, error = %e, "JSONL tail failed");
                            yield StreamFrame::Error(e.to_string());
                            return;
                        }
                    }
                }

                if state.converter.is_complete() {
                    tracing::info!(session_id = %ctx.session_id, "Session wrote its completion marker");
                    break;
                }
                if !still_active {
                    tracing::info!(session_id = %ctx.session_id, "Session no longer active; finishing live tail");
                    status = STATUS_EXITED;
                    break;
                }
            }
        }

        for frame in state.finish() {
            yield frame;
        }
        yield StreamFrame::Finished(status.to_string());
    })
}

// ---------------------------------------------------------------------------
// Reconciliation controller
// ---------------------------------------------------------------------------

/// One emittable unit of a snapshot: a stable key, the entry it renders
/// to, and a fingerprint of the source bytes it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Unit {
    pub key: String,
    pub entry: NormalizedEntry,
    pub fingerprint: String,
}

impl Unit {
    /// Fingerprint the serialized entry itself.
    pub fn new(key: impl Into<String>, entry: NormalizedEntry) -> Self {
        let serialized = serde_json::to_vec(&entry).unwrap_or_default();
        let fingerprint = fingerprint(&[&serialized]);
        Self {
            key: key.into(),
            entry,
            fingerprint,
        }
    }

    pub fn with_fingerprint(key: impl Into<String>, entry: NormalizedEntry, fingerprint: String) -> Self {
        Self {
            key: key.into(),
            entry,
            fingerprint,
        }
    }
}

/// Hex SHA-256 over the concatenation of `parts`.
pub fn fingerprint(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    hex::encode(hasher.finalize())
}

/// Tracks what has been emitted: key → (index, fingerprint).
#[derive(Debug, Default)]
pub struct Reconciler {
    emitted: HashMap<String, (usize, String)>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Diff `units` against what was emitted. New keys are added in
    /// snapshot order, changed fingerprints replaced in place, unchanged
    /// units skipped. Keys that disappeared are left alone.
    pub fn apply(&mut self, units: Vec<Unit>, out: &mut PatchEmitter) -> usize {
        let mut changes = 0;
        for unit in units {
            match self.emitted.get_mut(&unit.key) {
                Some((index, seen)) => {
                    if *seen != unit.fingerprint {
                        out.replace(*index, unit.entry);
                        *seen = unit.fingerprint;
                        changes += 1;
                    }
                }
                None => {
                    let index = out.add(unit.entry);
                    self.emitted.insert(unit.key, (index, unit.fingerprint));
                    changes += 1;
                }
            }
        }
        changes
    }

    pub fn len(&self) -> usize {
        self.emitted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.emitted.is_empty()
    }
}

/// Produces the current ordered list of units for one session.
#[async_trait]
pub trait Snapshot: Send + Sync + 'static {
    async fn snapshot(&self) -> Result<Vec<Unit>, StreamError>;
}

/// What to watch while a reconciliation stream is live.
#[derive(Clone)]
pub enum WatchTarget {
    /// One file, rewritten in place or by rename.
    File(PathBuf),
    /// A directory tree; `filter` narrows which paths wake the stream.
    Dir {
        root: PathBuf,
        recursive: bool,
        filter: Option<PathFilter>,
    },
    /// Several targets at once. Directories missing at open are skipped.
    Many(Vec<WatchTarget>),
}

impl std::fmt::Debug for WatchTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchTarget::File(p) => f.debug_tuple("File").field(p).finish(),
            WatchTarget::Dir { root, recursive, .. } => f
                .debug_struct("Dir")
                .field("root", root)
                .field("recursive", recursive)
                .finish(),
            WatchTarget::Many(targets) => f.debug_list().entries(targets).finish(),
        }
    }
}

/// Stream a session whose units are re-derived by `snapshot` on change.
pub fn reconcile_stream<S: Snapshot>(snapshot: S, target: WatchTarget, ctx: StreamContext) -> EntryStream {
    Box::pin(async_stream::stream! {
        let mode = ctx.mode();
        tracing::info!(session_id = %ctx.session_id, ?target, ?mode, "Opening reconciliation stream");

        let mut emitter = PatchEmitter::new();
        let mut reconciler = Reconciler::new();

        match snapshot.snapshot().await {
            Ok(units) => {
                reconciler.apply(units, &mut emitter);
                if let Some(frame) = emitter.take_frame() {
                    yield frame;
                }
            }
            Err(e) => {
                tracing::warn!(session_id = %ctx.session_id, error = %e, "Initial snapshot failed");
                yield StreamFrame::Error(e.to_string());
                return;
            }
        }

        let mut status = STATUS_COMPLETED;
        if mode == StreamMode::Live {
            let mut watches = open_watches(&target);
            let mut tick = tokio::time::interval(ctx.config.poll_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tick.tick().await;

            loop {
                tokio::select! {
                    _ = next_change_any(&mut watches) => {
                        tokio::time::sleep(ctx.config.debounce).await;
                    }
                    _ = tick.tick() => {}
                }

                let still_active = ctx.is_active();
                match snapshot.snapshot().await {
                    Ok(units) => {
                        let changes = reconciler.apply(units, &mut emitter);
                        tracing::debug!(session_id = %ctx.session_id, changes, "Reconciled snapshot");
                        if let Some(frame) = emitter.take_frame() {
                            yield frame;
                        }
                    }
                    // Writers replace files non-atomically; a half-written
                    // store is retried on the next pass.
                    Err(e) if !e.is_not_found() => {
                        tracing::debug!(session_id = %ctx.session_id, error = %e, "Snapshot failed; retrying");
                    }
                    Err(e) => {
                        tracing::warn!(session_id = %ctx.session_id, error = %e, "Backing store disappeared");
                        yield StreamFrame::Error(e.to_string());
                        return;
                    }
                }

                if !still_active {
                    tracing::info!(session_id = %ctx.session_id, "Session no longer active; finishing");
                    status = STATUS_EXITED;
                    break;
                }
            }
        }

        yield StreamFrame::Finished(status.to_string());
    })
}

fn open_watches(target: &WatchTarget) -> Vec<FileWatch> {
    match target {
        WatchTarget::Many(targets) => targets
            .iter()
            .filter(|t| !matches!(t, WatchTarget::Dir { root, .. } if !root.is_dir()))
            .flat_map(open_watches)
            .collect(),
        single => open_watch(single).into_iter().collect(),
    }
}

fn open_watch(target: &WatchTarget) -> Option<FileWatch> {
    let result = match target {
        WatchTarget::File(path) => FileWatch::for_file(path),
        WatchTarget::Dir {
            root,
            recursive,
            filter,
        } => FileWatch::new(root, *recursive, filter.clone()),
        WatchTarget::Many(_) => return None,
    };
    match result {
        Ok(watch) => Some(watch),
        Err(e) => {
            // The poll tick still drives re-reads.
            tracing::warn!(error = %e, ?target, "Could not start watcher; falling back to polling");
            None
        }
    }
}

async fn next_change(watch: &mut Option<FileWatch>) -> bool {
    match watch {
        Some(w) => w.changed().await,
        None => std::future::pending().await,
    }
}

async fn next_change_any(watches: &mut [FileWatch]) {
    if watches.is_empty() {
        return std::future::pending().await;
    }
    let waits = watches.iter_mut().map(|w| Box::pin(w.changed()));
    let (changed, _, _) = futures_util::future::select_all(waits).await;
    if !changed {
        // A dead watcher would win every select; fall back to the tick.
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_trail_types::PatchOp;
    use pretty_assertions::assert_eq;

    fn unit(key: &str, text: &str) -> Unit {
        Unit::new(key, NormalizedEntry::assistant(text))
    }

    #[test]
    fn reconciler_adds_then_replaces() {
        let mut emitter = PatchEmitter::new();
        let mut reconciler = Reconciler::new();

        assert_eq!(reconciler.apply(vec![unit("a", "1"), unit("b", "2")], &mut emitter), 2);
        assert_eq!(reconciler.apply(vec![unit("a", "1"), unit("b", "2b")], &mut emitter), 1);

        let shape: Vec<_> = emitter.drain().iter().map(|op| (op.op, op.index())).collect();
        assert_eq!(
            shape,
            vec![
                (PatchOp::Add, Some(0)),
                (PatchOp::Add, Some(1)),
                (PatchOp::Replace, Some(1)),
            ]
        );
    }

    #[test]
    fn reconciler_is_idempotent() {
        let mut emitter = PatchEmitter::new();
        let mut reconciler = Reconciler::new();
        reconciler.apply(vec![unit("a", "1")], &mut emitter);
        emitter.drain();
        assert_eq!(reconciler.apply(vec![unit("a", "1")], &mut emitter), 0);
        assert!(emitter.is_empty());
    }

    #[test]
    fn reconciler_ignores_vanished_units() {
        let mut emitter = PatchEmitter::new();
        let mut reconciler = Reconciler::new();
        reconciler.apply(vec![unit("a", "1"), unit("b", "2")], &mut emitter);
        emitter.drain();
        assert_eq!(reconciler.apply(vec![unit("b", "2"), unit("c", "3")], &mut emitter), 1);
        let ops = emitter.drain();
        assert_eq!((ops[0].op, ops[0].index()), (PatchOp::Add, Some(2)));
        assert_eq!(reconciler.len(), 3);
    }

    #[test]
    fn fingerprint_separates_parts() {
        assert_ne!(fingerprint(&[b"ab", b"c"]), fingerprint(&[b"a", b"bc"]));
        assert_eq!(fingerprint(&[b"x"]).len(), 64);
    }

    #[tokio::test]
    async fn error_stream_yields_one_frame() {
        use futures_util::StreamExt;
        let frames: Vec<_> = error_stream("Session not found: x").collect().await;
        assert_eq!(frames, vec![StreamFrame::Error("Session not found: x".into())]);
    }
}
