//! The canonical entry model every source adapter converts into.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// One rendered event of a session transcript.
///
/// `content` is a short human-readable rendering. `metadata` keeps the
/// original source record so downstream tooling can dig further.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "codegen", ts(export, export_to = "../../../viewer/src/types/generated/"))]
pub struct NormalizedEntry {
    pub timestamp: Option<String>,
    pub entry_type: EntryType,
    pub content: String,
    #[ts(type = "unknown")]
    pub metadata: Option<serde_json::Value>,
}

impl NormalizedEntry {
    pub fn new(entry_type: EntryType, content: impl Into<String>) -> Self {
        Self {
            timestamp: None,
            entry_type,
            content: content.into(),
            metadata: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(EntryType::UserMessage, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(EntryType::AssistantMessage, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(EntryType::SystemMessage, content)
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::new(EntryType::ErrorMessage, content)
    }

    pub fn thinking(content: impl Into<String>) -> Self {
        Self::new(EntryType::Thinking, content)
    }

    pub fn tool_use(
        tool_name: impl Into<String>,
        action_type: ActionType,
        content: impl Into<String>,
    ) -> Self {
        Self::new(
            EntryType::ToolUse {
                tool_name: tool_name.into(),
                action_type,
            },
            content,
        )
    }

    pub fn with_timestamp(mut self, timestamp: Option<String>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// The action of a `tool_use` entry, if this is one.
    pub fn action(&self) -> Option<&ActionType> {
        match &self.entry_type {
            EntryType::ToolUse { action_type, .. } => Some(action_type),
            _ => None,
        }
    }

    pub fn action_mut(&mut self) -> Option<&mut ActionType> {
        match &mut self.entry_type {
            EntryType::ToolUse { action_type, .. } => Some(action_type),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "codegen", ts(export, export_to = "../../../viewer/src/types/generated/"))]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntryType {
    UserMessage,
    AssistantMessage,
    SystemMessage,
    ErrorMessage,
    Thinking,
    ToolUse {
        tool_name: String,
        action_type: ActionType,
    },
}

/// What a tool invocation did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "codegen", ts(export, export_to = "../../../viewer/src/types/generated/"))]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionType {
    FileRead {
        path: String,
    },
    FileEdit {
        path: String,
        changes: Vec<FileChange>,
    },
    CommandRun {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<CommandRunResult>,
    },
    Search {
        query: String,
    },
    WebFetch {
        url: String,
    },
    Tool {
        tool_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        #[ts(type = "unknown")]
        arguments: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<ToolResult>,
    },
    TaskCreate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    PlanPresentation {
        plan: String,
    },
    TodoManagement {
        todos: Vec<TodoItem>,
        operation: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "codegen", ts(export, export_to = "../../../viewer/src/types/generated/"))]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum FileChange {
    Write {
        content: String,
    },
    Delete,
    Rename {
        new_path: String,
    },
    Edit {
        unified_diff: String,
        has_line_numbers: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "codegen", ts(export, export_to = "../../../viewer/src/types/generated/"))]
pub struct CommandRunResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<CommandExitStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "codegen", ts(export, export_to = "../../../viewer/src/types/generated/"))]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandExitStatus {
    ExitCode { code: i32 },
    Success { success: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "codegen", ts(export, export_to = "../../../viewer/src/types/generated/"))]
#[serde(rename_all = "snake_case")]
pub enum ToolResultValueType {
    Markdown,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "codegen", ts(export, export_to = "../../../viewer/src/types/generated/"))]
pub struct ToolResult {
    pub r#type: ToolResultValueType,
    #[ts(type = "unknown")]
    pub value: serde_json::Value,
}

impl ToolResult {
    pub fn markdown(text: impl Into<String>) -> Self {
        Self {
            r#type: ToolResultValueType::Markdown,
            value: serde_json::Value::String(text.into()),
        }
    }

    pub fn json(value: serde_json::Value) -> Self {
        Self {
            r#type: ToolResultValueType::Json,
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "codegen", ts(export, export_to = "../../../viewer/src/types/generated/"))]
pub struct TodoItem {
    pub content: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
}
