//! Entry index allocation and patch emission.
//!
//! Every stream owns exactly one [`EntryIndexProvider`]. Indices are dense,
//! zero-based and only ever move forward, so an entry emitted at index `i`
//! can later be replaced at `i` without touching its neighbours.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use agent_trail_types::{NormalizedEntry, PatchOperation, StreamFrame};

/// Monotonic allocator for entry indices.
#[derive(Debug, Clone, Default)]
pub struct EntryIndexProvider(Arc<AtomicUsize>);

impl EntryIndexProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume allocation after `n` already-emitted entries.
    pub fn start_from(n: usize) -> Self {
        Self(Arc::new(AtomicUsize::new(n)))
    }

    /// Allocate the next index.
    pub fn next(&self) -> usize {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    /// The index the next call to [`next`](Self::next) will return.
    pub fn current(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

/// Collects patch operations produced while converting records.
///
/// Converters push into the emitter; the controller drains it after each
/// record (or reconciliation pass) and wraps the batch in one frame.
#[derive(Debug, Default)]
pub struct PatchEmitter {
    index: EntryIndexProvider,
    pending: Vec<PatchOperation>,
}

impl PatchEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(index: EntryIndexProvider) -> Self {
        Self {
            index,
            pending: Vec::new(),
        }
    }

    /// Append a new entry and return the index it was assigned.
    pub fn add(&mut self, entry: NormalizedEntry) -> usize {
        let index = self.index.next();
        self.pending.push(PatchOperation::add(index, entry));
        index
    }

    /// Mutate an already-emitted entry in place.
    pub fn replace(&mut self, index: usize, entry: NormalizedEntry) {
        debug_assert!(index < self.index.current(), "replace of unallocated index");
        self.pending.push(PatchOperation::replace(index, entry));
    }

    pub fn remove(&mut self, index: usize) {
        self.pending.push(PatchOperation::remove(index));
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Number of entries allocated so far on this stream.
    pub fn entry_count(&self) -> usize {
        self.index.current()
    }

    pub fn drain(&mut self) -> Vec<PatchOperation> {
        std::mem::take(&mut self.pending)
    }

    /// Drain pending operations into a frame, or `None` when nothing is pending.
    pub fn take_frame(&mut self) -> Option<StreamFrame> {
        if self.pending.is_empty() {
            None
        } else {
            Some(StreamFrame::JsonPatch(self.drain()))
        }
    }
}
