//! Composite identifiers.
//!
//! ```text
//! projectId = "{source}:{projectKey}"
//! sessionId = "{source}:{projectKey}:{sessionKey}"
//! ```
//!
//! The project key never contains `:`. Everything after the second colon is
//! the session key, verbatim, so session keys may themselves contain `:`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use ts_rs::TS;

/// The agent CLIs whose transcripts can be ingested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "codegen", ts(export, export_to = "../../../viewer/src/types/generated/"))]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Claude,
    Codex,
    Gemini,
    Cursor,
    Opencode,
}

impl SourceKind {
    pub const ALL: [SourceKind; 5] = [
        SourceKind::Claude,
        SourceKind::Codex,
        SourceKind::Gemini,
        SourceKind::Cursor,
        SourceKind::Opencode,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Claude => "claude",
            SourceKind::Codex => "codex",
            SourceKind::Gemini => "gemini",
            SourceKind::Cursor => "cursor",
            SourceKind::Opencode => "opencode",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claude" => Ok(SourceKind::Claude),
            "codex" => Ok(SourceKind::Codex),
            "gemini" => Ok(SourceKind::Gemini),
            "cursor" => Ok(SourceKind::Cursor),
            "opencode" => Ok(SourceKind::Opencode),
            "" => Err(IdParseError::MissingSource),
            other => Err(IdParseError::UnknownSource(other.to_string())),
        }
    }
}

/// Errors produced when parsing a composite identifier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdParseError {
    #[error("Identifier has no source prefix")]
    MissingSource,

    #[error("Unknown source: {0}")]
    UnknownSource(String),

    #[error("Identifier has no project key: {0}")]
    MissingProjectKey(String),

    #[error("Identifier has no session key: {0}")]
    MissingSessionKey(String),
}

/// `{source}:{projectKey}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProjectId {
    pub source: SourceKind,
    pub key: String,
}

impl ProjectId {
    pub fn new(source: SourceKind, key: impl Into<String>) -> Self {
        Self {
            source,
            key: key.into(),
        }
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.key)
    }
}

impl FromStr for ProjectId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (source, key) = s
            .split_once(':')
            .ok_or_else(|| IdParseError::MissingProjectKey(s.to_string()))?;
        let source = source.parse()?;
        if key.is_empty() || key.contains(':') {
            return Err(IdParseError::MissingProjectKey(s.to_string()));
        }
        Ok(Self::new(source, key))
    }
}

/// `{source}:{projectKey}:{sessionKey}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId {
    pub source: SourceKind,
    pub project_key: String,
    pub session_key: String,
}

impl SessionId {
    pub fn new(
        source: SourceKind,
        project_key: impl Into<String>,
        session_key: impl Into<String>,
    ) -> Self {
        Self {
            source,
            project_key: project_key.into(),
            session_key: session_key.into(),
        }
    }

    pub fn project(&self) -> ProjectId {
        ProjectId::new(self.source, self.project_key.clone())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.source, self.project_key, self.session_key)
    }
}

impl FromStr for SessionId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let source = parts.next().unwrap_or_default().parse()?;
        let project_key = match parts.next() {
            Some(k) if !k.is_empty() => k,
            _ => return Err(IdParseError::MissingProjectKey(s.to_string())),
        };
        let session_key = match parts.next() {
            Some(k) if !k.is_empty() => k,
            _ => return Err(IdParseError::MissingSessionKey(s.to_string())),
        };
        Ok(Self::new(source, project_key, session_key))
    }
}

macro_rules! string_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                raw.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

string_serde!(ProjectId);
string_serde!(SessionId);
