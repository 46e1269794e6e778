//! Tool-name classification shared by every source adapter.
//!
//! Each agent CLI names the same handful of tools differently (`Read`,
//! `read_file`, `read`...) and nests arguments under different keys
//! (`file_path`, `filePath`, `absolute_path`...). This module folds them
//! into one [`ActionType`] plus a one-line rendering for `content`.

use std::path::Path;

use agent_trail_types::{ActionType, FileChange, NormalizedEntry, TodoItem};
use serde_json::Value;
use similar::TextDiff;

/// Longest one-line rendering kept in `content`.
const MAX_RENDER_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolKind {
    Read,
    Write,
    Edit,
    Command,
    Search,
    WebFetch,
    WebSearch,
    Task,
    Todo,
    ExitPlan,
    Mcp { server: String, tool: String },
    Other,
}

/// Classify a vendor tool name, case-insensitively.
pub fn classify(name: &str) -> ToolKind {
    if let Some(rest) = name.strip_prefix("mcp__") {
        let (server, tool) = rest.split_once("__").unwrap_or((rest, ""));
        return ToolKind::Mcp {
            server: server.to_string(),
            tool: tool.to_string(),
        };
    }
    match name.to_ascii_lowercase().as_str() {
        "read" | "read_file" | "read_many_files" | "view" | "notebookread" => ToolKind::Read,
        "write" | "write_file" | "create_file" => ToolKind::Write,
        "edit" | "multiedit" | "replace" | "str_replace" | "edit_file" | "notebookedit"
        | "search_replace" => ToolKind::Edit,
        "bash" | "shell" | "run_shell_command" | "local_shell" | "exec_command"
        | "run_terminal_cmd" | "container.exec" => ToolKind::Command,
        "grep" | "glob" | "ls" | "list" | "list_directory" | "search_file_content"
        | "codebase_search" | "file_search" | "grep_search" => ToolKind::Search,
        "webfetch" | "web_fetch" => ToolKind::WebFetch,
        "websearch" | "web_search" | "google_web_search" => ToolKind::WebSearch,
        "task" | "agent" => ToolKind::Task,
        "todowrite" | "write_todos" | "todo_write" | "update_plan" => ToolKind::Todo,
        "exitplanmode" | "exit_plan_mode" => ToolKind::ExitPlan,
        _ => ToolKind::Other,
    }
}

/// Build a `tool_use` entry for a call to `name` with `input` arguments.
///
/// Paths are rendered relative to `workspace` when they live under it.
pub fn tool_use_entry(name: &str, input: &Value, workspace: Option<&Path>) -> NormalizedEntry {
    let kind = classify(name);
    let path = || {
        str_field(
            input,
            &["file_path", "filePath", "path", "absolute_path", "target_file", "notebook_path"],
        )
        .map(|p| make_path_relative(p, workspace))
        .unwrap_or_default()
    };

    let (action, content) = match kind {
        ToolKind::Read => {
            let path = path();
            (ActionType::FileRead { path: path.clone() }, path)
        }
        ToolKind::Write => {
            let path = path();
            let content = str_field(input, &["content", "contents"]).unwrap_or_default();
            (
                ActionType::FileEdit {
                    path: path.clone(),
                    changes: vec![FileChange::Write {
                        content: content.to_string(),
                    }],
                },
                path,
            )
        }
        ToolKind::Edit => {
            let path = path();
            let changes = edit_changes(&path, input);
            (
                ActionType::FileEdit {
                    path: path.clone(),
                    changes,
                },
                path,
            )
        }
        ToolKind::Command => {
            let command = input
                .get("command")
                .or_else(|| input.get("cmd"))
                .map(render_command)
                .unwrap_or_default();
            (
                ActionType::CommandRun {
                    command: command.clone(),
                    result: None,
                },
                command,
            )
        }
        ToolKind::Search => {
            let query = str_field(input, &["pattern", "query", "glob_pattern", "glob", "path"])
                .unwrap_or_default()
                .to_string();
            (ActionType::Search { query: query.clone() }, query)
        }
        ToolKind::WebFetch => {
            let url = str_field(input, &["url", "prompt"]).unwrap_or_default().to_string();
            (ActionType::WebFetch { url: url.clone() }, url)
        }
        ToolKind::WebSearch => {
            let query = str_field(input, &["query", "q"]).unwrap_or_default().to_string();
            (ActionType::Search { query: query.clone() }, query)
        }
        ToolKind::Task => {
            let description = str_field(input, &["description", "prompt"]).map(str::to_string);
            let content = description.clone().unwrap_or_else(|| name.to_string());
            (ActionType::TaskCreate { description }, content)
        }
        ToolKind::Todo => {
            let todos = todo_items(input);
            let content = format!("{} todo(s)", todos.len());
            (
                ActionType::TodoManagement {
                    todos,
                    operation: "write".to_string(),
                },
                content,
            )
        }
        ToolKind::ExitPlan => {
            let plan = str_field(input, &["plan"]).unwrap_or_default().to_string();
            (ActionType::PlanPresentation { plan }, "Plan".to_string())
        }
        ToolKind::Mcp { server, tool } => (
            ActionType::Tool {
                tool_name: name.to_string(),
                arguments: non_empty(input),
                result: None,
            },
            format!("mcp:{server}:{tool}"),
        ),
        ToolKind::Other => (
            ActionType::Tool {
                tool_name: name.to_string(),
                arguments: non_empty(input),
                result: None,
            },
            name.to_string(),
        ),
    };

    NormalizedEntry::tool_use(name, action, one_line(&content))
}

fn edit_changes(path: &str, input: &Value) -> Vec<FileChange> {
    if let Some(edits) = input.get("edits").and_then(Value::as_array) {
        return edits
            .iter()
            .filter_map(|edit| {
                let old = str_field(edit, &["old_string", "oldString", "old_str"])?;
                let new = str_field(edit, &["new_string", "newString", "new_str"]).unwrap_or("");
                Some(FileChange::Edit {
                    unified_diff: edit_diff(path, old, new),
                    has_line_numbers: false,
                })
            })
            .collect();
    }
    match str_field(input, &["old_string", "oldString", "old_str"]) {
        Some(old) => {
            let new = str_field(input, &["new_string", "newString", "new_str"]).unwrap_or("");
            vec![FileChange::Edit {
                unified_diff: edit_diff(path, old, new),
                has_line_numbers: false,
            }]
        }
        None => Vec::new(),
    }
}

/// Unified diff between two snippets, with `path` in the headers.
pub fn edit_diff(path: &str, old: &str, new: &str) -> String {
    TextDiff::from_lines(old, new)
        .unified_diff()
        .context_radius(3)
        .header(&format!("a/{path}"), &format!("b/{path}"))
        .to_string()
}

/// Render a command that may be a string or an argv array.
///
/// `["bash", "-lc", "ls -la"]` renders as `ls -la`.
pub fn render_command(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        Value::Array(parts) => {
            let argv: Vec<&str> = parts.iter().filter_map(Value::as_str).collect();
            match argv.as_slice() {
                [shell, flag, script]
                    if is_shell(shell) && matches!(*flag, "-c" | "-lc" | "-ic") =>
                {
                    script.trim().to_string()
                }
                _ => argv.join(" "),
            }
        }
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn is_shell(program: &str) -> bool {
    let base = program.rsplit('/').next().unwrap_or(program);
    matches!(base, "bash" | "sh" | "zsh" | "fish")
}

/// Combine captured stdout/stderr into one output string.
pub fn build_command_output(stdout: Option<&str>, stderr: Option<&str>) -> Option<String> {
    let out = stdout.map(str::trim).filter(|s| !s.is_empty());
    let err = stderr.map(str::trim).filter(|s| !s.is_empty());
    match (out, err) {
        (None, None) => None,
        (Some(o), None) => Some(o.to_string()),
        (None, Some(e)) => Some(e.to_string()),
        (Some(o), Some(e)) => Some(format!("{o}\n{e}")),
    }
}

/// Strip `workspace` from the front of `path` when it is inside it.
pub fn make_path_relative(path: &str, workspace: Option<&Path>) -> String {
    if let Some(ws) = workspace {
        if let Ok(rel) = Path::new(path).strip_prefix(ws) {
            let rel = rel.to_string_lossy();
            if !rel.is_empty() {
                return rel.into_owned();
            }
        }
    }
    path.to_string()
}

fn todo_items(input: &Value) -> Vec<TodoItem> {
    let list = input
        .get("todos")
        .or_else(|| input.get("plan"))
        .and_then(Value::as_array);
    let Some(list) = list else {
        return Vec::new();
    };
    list.iter()
        .filter_map(|item| {
            let content = str_field(item, &["content", "description", "step", "title"])?;
            Some(TodoItem {
                content: content.to_string(),
                status: str_field(item, &["status"]).unwrap_or("pending").to_string(),
                priority: str_field(item, &["priority"]).map(str::to_string),
            })
        })
        .collect()
}

/// First string value among `keys`.
pub fn str_field<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| value.get(*k).and_then(Value::as_str))
}

fn non_empty(value: &Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Object(map) if map.is_empty() => None,
        other => Some(other.clone()),
    }
}

/// First line of `text`, capped at a fixed width.
pub fn one_line(text: &str) -> String {
    let line = text.lines().next().unwrap_or("").trim();
    if line.chars().count() <= MAX_RENDER_CHARS {
        return line.to_string();
    }
    let cut: String = line.chars().take(MAX_RENDER_CHARS).collect();
    format!("{cut}...")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_classify_aliases() {
        assert_eq!(classify("Read"), ToolKind::Read);
        assert_eq!(classify("read_file"), ToolKind::Read);
        assert_eq!(classify("MultiEdit"), ToolKind::Edit);
        assert_eq!(classify("replace"), ToolKind::Edit);
        assert_eq!(classify("run_shell_command"), ToolKind::Command);
        assert_eq!(classify("SEARCH_FILE_CONTENT"), ToolKind::Search);
        assert_eq!(classify("webfetch"), ToolKind::WebFetch);
        assert_eq!(classify("google_web_search"), ToolKind::WebSearch);
        assert_eq!(classify("todowrite"), ToolKind::Todo);
        assert_eq!(classify("ExitPlanMode"), ToolKind::ExitPlan);
        assert_eq!(
            classify("mcp__github__create_issue"),
            ToolKind::Mcp {
                server: "github".into(),
                tool: "create_issue".into()
            }
        );
        assert_eq!(classify("frobnicate"), ToolKind::Other);
    }

    #[test]
    fn test_read_entry_relative_path() {
        let entry = tool_use_entry(
            "Read",
            &json!({"file_path": "/work/app/src/main.rs"}),
            Some(Path::new("/work/app")),
        );
        assert_eq!(entry.content, "src/main.rs");
        assert_eq!(
            entry.action(),
            Some(&ActionType::FileRead {
                path: "src/main.rs".into()
            })
        );
    }

    #[test]
    fn test_edit_entry_renders_diff() {
        let entry = tool_use_entry(
            "Edit",
            &json!({"file_path": "a.txt", "old_string": "foo\n", "new_string": "bar\n"}),
            None,
        );
        match entry.action() {
            Some(ActionType::FileEdit { path, changes }) => {
                assert_eq!(path, "a.txt");
                match &changes[0] {
                    FileChange::Edit {
                        unified_diff,
                        has_line_numbers,
                    } => {
                        assert!(unified_diff.contains("-foo"));
                        assert!(unified_diff.contains("+bar"));
                        assert!(!has_line_numbers);
                    }
                    other => panic!("unexpected change: {other:?}"),
                }
            }
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[test]
    fn test_multi_edit_yields_one_change_per_edit() {
        let entry = tool_use_entry(
            "MultiEdit",
            &json!({"file_path": "x", "edits": [
                {"old_string": "a", "new_string": "b"},
                {"old_string": "c", "new_string": "d"}
            ]}),
            None,
        );
        match entry.action() {
            Some(ActionType::FileEdit { changes, .. }) => assert_eq!(changes.len(), 2),
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[test]
    fn test_command_rendering() {
        assert_eq!(render_command(&json!(["bash", "-lc", "ls -la"])), "ls -la");
        assert_eq!(render_command(&json!(["ls"])), "ls");
        assert_eq!(render_command(&json!("git status")), "git status");

        let entry = tool_use_entry("Bash", &json!({"command": "cargo test"}), None);
        assert_eq!(entry.content, "cargo test");
        assert!(matches!(
            entry.action(),
            Some(ActionType::CommandRun { result: None, .. })
        ));
    }

    #[test]
    fn test_todos_and_unknown_tools() {
        let entry = tool_use_entry(
            "TodoWrite",
            &json!({"todos": [{"content": "write tests", "status": "in_progress"}]}),
            None,
        );
        match entry.action() {
            Some(ActionType::TodoManagement { todos, .. }) => {
                assert_eq!(todos[0].content, "write tests");
                assert_eq!(todos[0].status, "in_progress");
            }
            other => panic!("unexpected action: {other:?}"),
        }

        let entry = tool_use_entry("frobnicate", &json!({"x": 1}), None);
        assert_eq!(entry.content, "frobnicate");
        assert!(matches!(
            entry.action(),
            Some(ActionType::Tool { arguments: Some(_), .. })
        ));
    }

    #[test]
    fn test_command_output_and_one_line() {
        assert_eq!(build_command_output(Some("  "), None), None);
        assert_eq!(
            build_command_output(Some("out\n"), Some("err")).as_deref(),
            Some("out\nerr")
        );
        assert_eq!(one_line("first\nsecond"), "first");
        assert!(one_line(&"x".repeat(500)).ends_with("..."));
    }
}
