//! Centralized root directories for every source's on-disk store.
//!
//! Single source of truth. Adapters never call `dirs::home_dir()` themselves.

use std::path::{Path, PathBuf};

use agent_trail_types::SourceKind;

use crate::error::DiscoveryError;

/// Per-source root directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRoots {
    /// `~/.claude/projects`
    pub claude: PathBuf,
    /// `~/.codex/sessions`
    pub codex: PathBuf,
    /// `~/.gemini/tmp`
    pub gemini: PathBuf,
    /// `~/.cursor/chats`
    pub cursor: PathBuf,
    /// `$XDG_DATA_HOME/opencode/storage`
    pub opencode: PathBuf,
}

impl SourceRoots {
    /// Default roots under the user's home directory.
    pub fn from_home(home: &Path) -> Self {
        Self {
            claude: home.join(".claude").join("projects"),
            codex: home.join(".codex").join("sessions"),
            gemini: home.join(".gemini").join("tmp"),
            cursor: home.join(".cursor").join("chats"),
            opencode: home
                .join(".local")
                .join("share")
                .join("opencode")
                .join("storage"),
        }
    }

    /// Everything rooted under one directory (tests and sandboxes).
    pub fn under(base: &Path) -> Self {
        Self::from_home(base)
    }

    /// Default roots, then per-source env overrides
    /// (`AGENT_TRAIL_CLAUDE_DIR`, `AGENT_TRAIL_CODEX_DIR`, ...).
    pub fn from_env() -> Result<Self, DiscoveryError> {
        let home = dirs::home_dir().ok_or(DiscoveryError::HomeDirNotFound)?;
        let mut roots = Self::from_home(&home);
        if let Some(data) = std::env::var_os("XDG_DATA_HOME") {
            roots.opencode = PathBuf::from(data).join("opencode").join("storage");
        }
        for kind in SourceKind::ALL {
            if let Some(dir) = std::env::var_os(env_var_for(kind)) {
                *roots.get_mut(kind) = PathBuf::from(dir);
            }
        }
        Ok(roots)
    }

    pub fn get(&self, kind: SourceKind) -> &Path {
        match kind {
            SourceKind::Claude => &self.claude,
            SourceKind::Codex => &self.codex,
            SourceKind::Gemini => &self.gemini,
            SourceKind::Cursor => &self.cursor,
            SourceKind::Opencode => &self.opencode,
        }
    }

    fn get_mut(&mut self, kind: SourceKind) -> &mut PathBuf {
        match kind {
            SourceKind::Claude => &mut self.claude,
            SourceKind::Codex => &mut self.codex,
            SourceKind::Gemini => &mut self.gemini,
            SourceKind::Cursor => &mut self.cursor,
            SourceKind::Opencode => &mut self.opencode,
        }
    }
}

fn env_var_for(kind: SourceKind) -> String {
    format!("AGENT_TRAIL_{}_DIR", kind.as_str().to_ascii_uppercase())
}
