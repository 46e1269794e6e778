//! Listing records for projects and sessions.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::ids::{ProjectId, SessionId, SourceKind};

/// A project as seen by one source adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "codegen", ts(export, export_to = "../../../viewer/src/types/generated/"))]
pub struct ProjectInfo {
    #[ts(type = "string")]
    pub id: ProjectId,
    pub source: SourceKind,
    /// Human-readable name (usually the workspace directory name).
    pub display_name: String,
    /// Workspace path when the source records or encodes it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Directory or file backing this project.
    pub location: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    pub session_count: usize,
}

/// A session as seen by one source adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "codegen", ts(export, export_to = "../../../viewer/src/types/generated/"))]
pub struct SessionInfo {
    #[ts(type = "string")]
    pub id: SessionId,
    #[ts(type = "string")]
    pub project_id: ProjectId,
    /// Best-effort title derived from the first user message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    /// File or directory backing this session.
    pub location: String,
    /// Backed by a live subprocess right now.
    #[serde(default)]
    pub running: bool,
}

impl SessionInfo {
    pub fn new(id: SessionId, location: impl Into<String>) -> Self {
        let project_id = id.project();
        Self {
            id,
            project_id,
            title: None,
            created_at: None,
            updated_at: None,
            location: location.into(),
            running: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_info_new_derives_project() {
        let id = SessionId::new(SourceKind::Gemini, "abc", "session-1");
        let info = SessionInfo::new(id, "/tmp/x.json");
        assert_eq!(info.project_id.to_string(), "gemini:abc");
        assert!(!info.running);
    }

    #[test]
    fn test_session_info_skips_empty_optionals() {
        let id = SessionId::new(SourceKind::Claude, "p", "s");
        let json = serde_json::to_value(SessionInfo::new(id, "/x")).unwrap();
        assert!(json.get("title").is_none());
        assert_eq!(json["id"], "claude:p:s");
        assert_eq!(json["running"], false);
    }
}
