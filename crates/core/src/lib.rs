//! Normalizes the on-disk transcripts of several coding-agent CLIs into one
//! entry model and republishes them as incremental JSON-patch streams.
//!
//! Entry points: [`SessionSources`] for listing and streaming sessions, and
//! [`ExecutionLauncher`] for spawning agents and resolving their session ids.
pub mod accumulator;
pub mod config;
pub mod correlate;
pub mod discovery;
pub mod error;
pub mod launcher;
pub mod patch;
pub mod paths;
pub mod registry;
pub mod resolver;
pub mod sources;
pub mod stream;
pub mod tail;
pub mod tools;
pub mod watcher;

pub use config::{LaunchConfig, StreamConfig, SESSION_ID_ENV};
pub use error::{DiscoveryError, LaunchError, StreamError};
pub use launcher::{CommandSpec, ExecutionLauncher, LaunchRequest, LaunchedSession};
pub use patch::{EntryIndexProvider, PatchEmitter};
pub use paths::SourceRoots;
pub use registry::ActiveSessionRegistry;
pub use resolver::{resolve_session_id, Resolution};
pub use sources::{SessionLocation, SessionSource, SessionSources};
pub use stream::{EntryStream, StreamContext, StreamMode};

pub use agent_trail_types as types;
