//! Per-stream correlation state shared by the record converters.
//!
//! [`CallTracker`] pairs "begin" and "end" records of one call id into a
//! single entry that is added once and replaced once. [`TextBuffer`] joins
//! fragments of one logical message so they are emitted as a single entry.
//!
//! Both live inside a converter that is constructed fresh for every stream.

use std::collections::HashMap;

use agent_trail_types::{
    ActionType, CommandRunResult, EntryType, NormalizedEntry, ToolResult,
};

use crate::patch::PatchEmitter;

/// An in-flight call: where its entry lives and what it looks like so far.
#[derive(Debug, Clone)]
pub struct OpenCall<S> {
    pub index: usize,
    pub entry: NormalizedEntry,
    pub state: S,
}

/// Call id → open call.
#[derive(Debug)]
pub struct CallTracker<S> {
    open: HashMap<String, OpenCall<S>>,
}

impl<S> Default for CallTracker<S> {
    fn default() -> Self {
        Self {
            open: HashMap::new(),
        }
    }
}

impl<S> CallTracker<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit the placeholder entry for a new call and start tracking it.
    ///
    /// A second `begin` for a call that is already open is ignored and
    /// returns `None`: the entry was added once and stays where it is.
    pub fn begin(
        &mut self,
        emitter: &mut PatchEmitter,
        call_id: &str,
        entry: NormalizedEntry,
        state: S,
    ) -> Option<usize> {
        if self.open.contains_key(call_id) {
            tracing::debug!(call_id, "Ignoring duplicate begin for open call");
            return None;
        }
        let index = emitter.add(entry.clone());
        self.open.insert(
            call_id.to_string(),
            OpenCall {
                index,
                entry,
                state,
            },
        );
        Some(index)
    }

    pub fn is_open(&self, call_id: &str) -> bool {
        self.open.contains_key(call_id)
    }

    pub fn get_mut(&mut self, call_id: &str) -> Option<&mut OpenCall<S>> {
        self.open.get_mut(call_id)
    }

    /// Mutate an open call's entry and emit a replace, keeping it open.
    pub fn update(
        &mut self,
        emitter: &mut PatchEmitter,
        call_id: &str,
        f: impl FnOnce(&mut NormalizedEntry, &mut S),
    ) -> bool {
        let Some(call) = self.open.get_mut(call_id) else {
            return false;
        };
        f(&mut call.entry, &mut call.state);
        emitter.replace(call.index, call.entry.clone());
        true
    }

    /// Close a call: evict it, let `f` merge the final result, and emit a
    /// replace at the original index. An end without a begin emits nothing.
    pub fn complete(
        &mut self,
        emitter: &mut PatchEmitter,
        call_id: &str,
        f: impl FnOnce(&mut NormalizedEntry, S) -> bool,
    ) -> Option<usize> {
        let Some(OpenCall {
            index,
            mut entry,
            state,
        }) = self.open.remove(call_id)
        else {
            tracing::debug!(call_id, "Completion without a matching begin; skipped");
            return None;
        };
        if f(&mut entry, state) {
            emitter.replace(index, entry);
        }
        Some(index)
    }

    /// Evict without emitting anything.
    pub fn take(&mut self, call_id: &str) -> Option<OpenCall<S>> {
        self.open.remove(call_id)
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }
}

/// Store a command result on a `command_run` entry. Returns false for any
/// other action.
pub fn set_command_result(entry: &mut NormalizedEntry, value: CommandRunResult) -> bool {
    match entry.action_mut() {
        Some(ActionType::CommandRun { result, .. }) => {
            *result = Some(value);
            true
        }
        _ => false,
    }
}

/// Store a tool result on a `tool` entry, or fold it into a command's output.
pub fn set_tool_result(entry: &mut NormalizedEntry, value: ToolResult) -> bool {
    match entry.action_mut() {
        Some(ActionType::Tool { result, .. }) => {
            *result = Some(value);
            true
        }
        Some(ActionType::CommandRun { result, .. }) => {
            let output = match value.value {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            result.get_or_insert_with(CommandRunResult::default).output = Some(output);
            true
        }
        _ => false,
    }
}

/// Kinds of text that get buffered until a boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextKind {
    User,
    Assistant,
    Thinking,
}

impl TextKind {
    fn entry_type(self) -> EntryType {
        match self {
            TextKind::User => EntryType::UserMessage,
            TextKind::Assistant => EntryType::AssistantMessage,
            TextKind::Thinking => EntryType::Thinking,
        }
    }
}

#[derive(Debug)]
struct PendingText {
    kind: TextKind,
    key: Option<String>,
    text: String,
    timestamp: Option<String>,
}

/// Buffers text chunks of one logical message.
///
/// A push with a different kind or grouping key flushes what is buffered
/// first. Callers flush explicitly at tool events and at end of input.
#[derive(Debug)]
pub struct TextBuffer {
    separator: &'static str,
    pending: Option<PendingText>,
}

impl TextBuffer {
    /// `separator` is inserted between chunks (`""` for streamed deltas,
    /// `"\n\n"` for whole content blocks).
    pub fn new(separator: &'static str) -> Self {
        Self {
            separator,
            pending: None,
        }
    }

    pub fn push(
        &mut self,
        emitter: &mut PatchEmitter,
        kind: TextKind,
        key: Option<&str>,
        chunk: &str,
        timestamp: Option<String>,
    ) {
        let same_group = self
            .pending
            .as_ref()
            .is_some_and(|p| p.kind == kind && p.key.as_deref() == key);
        if !same_group {
            self.flush(emitter);
        }
        match &mut self.pending {
            Some(pending) => {
                if !pending.text.is_empty() && !chunk.is_empty() {
                    pending.text.push_str(self.separator);
                }
                pending.text.push_str(chunk);
            }
            None => {
                self.pending = Some(PendingText {
                    kind,
                    key: key.map(str::to_string),
                    text: chunk.to_string(),
                    timestamp,
                });
            }
        }
    }

    /// Emit the buffered message, if any. Whitespace-only text is dropped.
    pub fn flush(&mut self, emitter: &mut PatchEmitter) -> Option<usize> {
        let pending = self.pending.take()?;
        let text = pending.text.trim();
        if text.is_empty() {
            return None;
        }
        let entry = NormalizedEntry::new(pending.kind.entry_type(), text)
            .with_timestamp(pending.timestamp);
        Some(emitter.add(entry))
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_none()
    }

    /// Drop buffered text without emitting it.
    pub fn clear(&mut self) {
        self.pending = None;
    }
}
