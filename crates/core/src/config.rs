//! Tunables for stream controllers and the execution launcher.
//!
//! Defaults are compiled in; `from_env()` applies `AGENT_TRAIL_*` overrides.
//! Unparseable values are logged and ignored.

use std::time::Duration;

/// Stream controller tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    /// How often a live stream re-checks process liveness and re-reads.
    pub poll_interval: Duration,
    /// Window for coalescing bursts of watch events into one re-read.
    pub debounce: Duration,
    /// Bytes per read when draining a file.
    pub read_chunk: usize,
    /// A partial record larger than this is forced out of the accumulator.
    pub max_pending_bytes: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            debounce: Duration::from_millis(100),
            read_chunk: 64 * 1024,
            max_pending_bytes: 8 * 1024 * 1024,
        }
    }
}

impl StreamConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(ms) = env_u64("AGENT_TRAIL_POLL_MS") {
            cfg.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("AGENT_TRAIL_DEBOUNCE_MS") {
            cfg.debounce = Duration::from_millis(ms);
        }
        if let Some(bytes) = env_u64("AGENT_TRAIL_MAX_PENDING_BYTES") {
            cfg.max_pending_bytes = bytes as usize;
        }
        cfg
    }
}

/// Execution launcher and session resolver tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchConfig {
    /// Ceiling on the session-id resolution race.
    pub resolution_timeout: Duration,
    /// Filesystem probe cadence during resolution.
    pub probe_interval: Duration,
    /// Artifacts modified this long before spawn still count as fresh.
    pub staleness_window: Duration,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            resolution_timeout: Duration::from_secs(30),
            probe_interval: Duration::from_millis(250),
            staleness_window: Duration::from_secs(5),
        }
    }
}

impl LaunchConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(secs) = env_u64("AGENT_TRAIL_RESOLVE_TIMEOUT_SECS") {
            cfg.resolution_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = env_u64("AGENT_TRAIL_PROBE_MS") {
            cfg.probe_interval = Duration::from_millis(ms);
        }
        cfg
    }
}

/// Env var holding the caller-minted placeholder id, exported to children.
pub const SESSION_ID_ENV: &str = "AGENT_TRAIL_SESSION_ID";

fn env_u64(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(v) if v > 0 => Some(v),
        _ => {
            tracing::warn!(var = name, value = %raw, "Ignoring invalid numeric env override");
            None
        }
    }
}
