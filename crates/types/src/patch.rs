//! Patch wire format pushed to viewers.
//!
//! A stream is a sequence of frames:
//!
//! | Event name   | Data                                           |
//! |--------------|------------------------------------------------|
//! | `json_patch` | JSON array of [`PatchOperation`]               |
//! | `finished`   | `{"status": "..."}`                            |
//! | `error`      | `{"error": "..."}`                             |

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::entry::NormalizedEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "codegen", ts(export, export_to = "../../../viewer/src/types/generated/"))]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    Add,
    Replace,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "codegen", ts(export, export_to = "../../../viewer/src/types/generated/"))]
#[serde(tag = "type", content = "content", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PatchValue {
    NormalizedEntry(NormalizedEntry),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "codegen", ts(export, export_to = "../../../viewer/src/types/generated/"))]
pub struct PatchOperation {
    pub op: PatchOp,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<PatchValue>,
}

impl PatchOperation {
    pub fn add(index: usize, entry: NormalizedEntry) -> Self {
        Self {
            op: PatchOp::Add,
            path: entry_path(index),
            value: Some(PatchValue::NormalizedEntry(entry)),
        }
    }

    pub fn replace(index: usize, entry: NormalizedEntry) -> Self {
        Self {
            op: PatchOp::Replace,
            path: entry_path(index),
            value: Some(PatchValue::NormalizedEntry(entry)),
        }
    }

    pub fn remove(index: usize) -> Self {
        Self {
            op: PatchOp::Remove,
            path: entry_path(index),
            value: None,
        }
    }

    /// The entry index addressed by `path`, if it is an `/entries/{i}` path.
    pub fn index(&self) -> Option<usize> {
        self.path.strip_prefix("/entries/")?.parse().ok()
    }

    pub fn entry(&self) -> Option<&NormalizedEntry> {
        match &self.value {
            Some(PatchValue::NormalizedEntry(entry)) => Some(entry),
            None => None,
        }
    }
}

/// `/entries/{index}`
pub fn entry_path(index: usize) -> String {
    format!("/entries/{}", escape_path_segment(&index.to_string()))
}

/// Escape one JSON Pointer segment (RFC 6901). `~` must be escaped before `/`.
pub fn escape_path_segment(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

/// One server-push frame.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    JsonPatch(Vec<PatchOperation>),
    Finished(String),
    Error(String),
}

impl StreamFrame {
    pub fn event_name(&self) -> &'static str {
        match self {
            StreamFrame::JsonPatch(_) => "json_patch",
            StreamFrame::Finished(_) => "finished",
            StreamFrame::Error(_) => "error",
        }
    }

    pub fn data(&self) -> String {
        let value = match self {
            StreamFrame::JsonPatch(ops) => serde_json::to_value(ops).unwrap_or_default(),
            StreamFrame::Finished(status) => serde_json::json!({ "status": status }),
            StreamFrame::Error(error) => serde_json::json!({ "error": error }),
        };
        value.to_string()
    }

    /// `event: <name>\ndata: <json>\n\n`
    pub fn to_sse(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.event_name(), self.data())
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamFrame::JsonPatch(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_escape_path_segment_order() {
        assert_eq!(escape_path_segment("a/b"), "a~1b");
        assert_eq!(escape_path_segment("a~b"), "a~0b");
        assert_eq!(escape_path_segment("~/"), "~0~1");
        assert_eq!(escape_path_segment("12"), "12");
    }

    #[test]
    fn test_add_operation_wire_shape() {
        let op = PatchOperation::add(3, NormalizedEntry::assistant("hello"));
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(value["op"], "add");
        assert_eq!(value["path"], "/entries/3");
        assert_eq!(value["value"]["type"], "NORMALIZED_ENTRY");
        assert_eq!(value["value"]["content"]["content"], "hello");
        assert_eq!(op.index(), Some(3));
    }

    #[test]
    fn test_remove_has_no_value() {
        let value = serde_json::to_value(PatchOperation::remove(1)).unwrap();
        assert_eq!(value, json!({"op": "remove", "path": "/entries/1"}));
    }

    #[test]
    fn test_frames_to_sse() {
        let finished = StreamFrame::Finished("done".into());
        assert_eq!(finished.to_sse(), "event: finished\ndata: {\"status\":\"done\"}\n\n");
        assert!(finished.is_terminal());

        let error = StreamFrame::Error("session not found".into());
        assert_eq!(error.event_name(), "error");
        assert_eq!(error.data(), "{\"error\":\"session not found\"}");

        let patch = StreamFrame::JsonPatch(vec![PatchOperation::remove(0)]);
        assert!(patch.to_sse().starts_with("event: json_patch\ndata: [{"));
        assert!(!patch.is_terminal());
    }

    #[test]
    fn test_operation_round_trip() {
        let op = PatchOperation::replace(0, NormalizedEntry::thinking("hm"));
        let json = serde_json::to_string(&op).unwrap();
        let back: PatchOperation = serde_json::from_str(&json).unwrap();
        assert_eq!(back, op);
    }
}
