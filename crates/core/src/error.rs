//! Error types for streams, listings and launches.

use std::path::PathBuf;

use agent_trail_types::{IdParseError, SourceKind};
use thiserror::Error;

/// Errors that can occur when opening or driving a session stream.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Session not found: {id}")]
    SessionNotFound { id: String },

    #[error("Invalid identifier: {0}")]
    InvalidId(#[from] IdParseError),

    #[error("No adapter registered for source: {0}")]
    UnknownSource(SourceKind),

    #[error("Permission denied reading: {path}")]
    PermissionDenied { path: PathBuf },

    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("SQLite error in {path}: {source}")]
    Sqlite {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },
}

impl StreamError {
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::SessionNotFound { id: id.into() }
    }

    /// Classify an I/O error: a missing backing store is "not found", not a
    /// generic I/O failure.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::NotFound => Self::SessionNotFound {
                id: path.display().to_string(),
            },
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied { path },
            _ => Self::Io { path, source },
        }
    }

    pub fn sqlite(path: impl Into<PathBuf>, source: rusqlite::Error) -> Self {
        Self::Sqlite {
            path: path.into(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::SessionNotFound { .. })
    }
}

/// Errors that can occur while listing projects and sessions.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Source root directory not found: {path}")]
    RootNotFound { path: PathBuf },

    #[error("Cannot access source directory: {path}")]
    PermissionDenied { path: PathBuf },

    #[error("IO error accessing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Invalid identifier: {0}")]
    InvalidId(#[from] IdParseError),

    #[error("No adapter registered for source: {0}")]
    UnknownSource(SourceKind),
}

impl DiscoveryError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::NotFound => Self::RootNotFound { path },
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied { path },
            _ => Self::Io { path, source },
        }
    }
}

/// Errors surfaced to the caller of `ExecutionLauncher::launch`.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Failed to spawn {program}: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Child process did not expose {0}")]
    MissingStdio(&'static str),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}
