//! Learning the agent-assigned session id of a freshly spawned subprocess.
//! Stdout scraping races a filesystem probe, a timeout, process exit and
//! cancellation; the first one to produce an answer wins.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::LaunchConfig;
use crate::sources::{SessionLocation, SessionSource};

/// How long output still in flight at exit is waited for.
const EXIT_DRAIN: Duration = Duration::from_millis(500);

/// How (or whether) the real session id was learned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Announced on the subprocess's stdout.
    Stdout(String),
    /// A session artifact for the workspace showed up on disk.
    Filesystem(SessionLocation),
    /// Nothing within `resolution_timeout`; the placeholder stands.
    Timeout,
    /// The subprocess exited first; the placeholder stands.
    Exited,
    Cancelled,
}

impl Resolution {
    /// The resolved session key, if any signal produced one.
    pub fn session_key(&self) -> Option<&str> {
        match self {
            Self::Stdout(key) => Some(key),
            Self::Filesystem(location) => Some(&location.session_key),
            Self::Timeout | Self::Exited | Self::Cancelled => None,
        }
    }

    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Stdout(_) => "stdout",
            Self::Filesystem(_) => "filesystem",
            Self::Timeout => "timeout",
            Self::Exited => "exited",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Event inputs to the race.
#[derive(Debug)]
pub struct ResolveSignals {
    /// Lines of the subprocess's stdout. `None` skips scraping.
    pub stdout: Option<mpsc::Receiver<String>>,
    /// Fired once the subprocess has exited.
    pub exited: CancellationToken,
    /// Fired by the caller to abandon resolution.
    pub cancel: CancellationToken,
}

impl ResolveSignals {
    pub fn new(stdout: Option<mpsc::Receiver<String>>) -> Self {
        Self {
            stdout,
            exited: CancellationToken::new(),
            cancel: CancellationToken::new(),
        }
    }
}

/// What the filesystem probe looks for.
pub struct ResolveProbe<'a> {
    pub source: &'a dyn SessionSource,
    pub workspace: PathBuf,
    /// When the subprocess was spawned; the staleness window reaches back
    /// from here.
    pub spawned_at: SystemTime,
}

impl ResolveProbe<'_> {
    fn since(&self, config: &LaunchConfig) -> SystemTime {
        self.spawned_at
            .checked_sub(config.staleness_window)
            .unwrap_or(SystemTime::UNIX_EPOCH)
    }
}

/// Run the resolution race to completion.
pub async fn resolve_session_id(
    mut signals: ResolveSignals,
    probe: ResolveProbe<'_>,
    config: &LaunchConfig,
) -> Resolution {
    let since = probe.since(config);
    let deadline = tokio::time::sleep(config.resolution_timeout);
    tokio::pin!(deadline);

    let mut ticker = tokio::time::interval(config.probe_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut stdout_open = signals.stdout.is_some();

    let resolution = loop {
        tokio::select! {
            biased;

            _ = signals.cancel.cancelled() => break Resolution::Cancelled,

            line = recv_line(&mut signals.stdout), if stdout_open => match line {
                Some(line) => {
                    if let Some(key) = probe.source.scrape_session_id(&line) {
                        break Resolution::Stdout(key);
                    }
                }
                None => {
                    tracing::debug!("Subprocess stdout closed during resolution");
                    stdout_open = false;
                }
            },

            _ = ticker.tick() => {
                if let Some(location) = probe.source.find_recent_session(&probe.workspace, since).await {
                    break Resolution::Filesystem(location);
                }
            }

            _ = signals.exited.cancelled() => {
                // Lines printed right before exit may still be in the relay.
                break drain_scrape(&mut signals.stdout, probe.source)
                    .await
                    .map(Resolution::Stdout)
                    .unwrap_or(Resolution::Exited);
            }

            _ = &mut deadline => break Resolution::Timeout,
        }
    };

    tracing::info!(
        source = %probe.source.kind(),
        workspace = %probe.workspace.display(),
        resolved_by = resolution.label(),
        session_key = resolution.session_key().unwrap_or(""),
        "Session resolution finished"
    );
    resolution
}

async fn recv_line(rx: &mut Option<mpsc::Receiver<String>>) -> Option<String> {
    match rx {
        Some(rx) => rx.recv().await,
        None => None,
    }
}

/// Scrape what is left of stdout until the relay hangs up, bounded by
/// [`EXIT_DRAIN`].
async fn drain_scrape(rx: &mut Option<mpsc::Receiver<String>>, source: &dyn SessionSource) -> Option<String> {
    let rx = rx.as_mut()?;
    let drain = async {
        while let Some(line) = rx.recv().await {
            if let Some(key) = source.scrape_session_id(&line) {
                return Some(key);
            }
        }
        None
    };
    match tokio::time::timeout(EXIT_DRAIN, drain).await {
        Ok(key) => key,
        Err(_) => {
            tracing::debug!("Subprocess stdout still open after exit; giving up on it");
            None
        }
    }
}
