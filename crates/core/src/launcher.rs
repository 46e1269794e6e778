//! Spawning agent subprocesses and tying them to session ids.
//!
//! A launch mints a `pending-<uuid>` placeholder, registers it as active,
//! spawns the agent with the placeholder exported in its environment, and
//! races stdout against the filesystem to learn the real id. The registry
//! entry is rekeyed once that id is known; a monitor task drops it again
//! when the subprocess exits.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::SystemTime;

use agent_trail_types::{SessionId, SourceKind};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{LaunchConfig, SESSION_ID_ENV};
use crate::error::{DiscoveryError, LaunchError};
use crate::registry::ActiveSessionRegistry;
use crate::resolver::{resolve_session_id, ResolveProbe, ResolveSignals, Resolution};
use crate::sources::SessionSources;

/// Prefix of caller-minted session keys.
pub const PLACEHOLDER_PREFIX: &str = "pending-";

const STDOUT_BUFFER: usize = 256;

/// Program, arguments and extra environment for one agent invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub source: SourceKind,
    pub workspace: PathBuf,
    pub command: CommandSpec,
    /// Follow-up turn of an existing session: no resolution race, the
    /// session keeps its id.
    pub resume: Option<SessionId>,
}

/// A running agent subprocess.
#[derive(Debug)]
pub struct LaunchedSession {
    /// Real id when resolution succeeded, else the placeholder.
    pub session_id: SessionId,
    pub placeholder_id: SessionId,
    /// `None` for resumed sessions.
    pub resolved_by: Option<Resolution>,
    pub pid: Option<u32>,
    /// Cancel to kill the subprocess.
    pub cancel: CancellationToken,
    /// Fired once the subprocess has exited.
    pub exited: CancellationToken,
    monitor: JoinHandle<Option<ExitStatus>>,
}

impl LaunchedSession {
    pub fn is_resolved(&self) -> bool {
        self.session_id != self.placeholder_id
    }

    /// Wait for the subprocess to exit and its registry entry to be dropped.
    pub async fn wait(self) -> Option<ExitStatus> {
        match self.monitor.await {
            Ok(status) => status,
            Err(e) => {
                tracing::error!(session_id = %self.session_id, error = %e, "Session monitor panicked");
                None
            }
        }
    }
}

/// Spawns agent subprocesses against the same registry the stream factory
/// reads.
#[derive(Debug, Clone)]
pub struct ExecutionLauncher {
    sources: SessionSources,
    registry: ActiveSessionRegistry,
    config: LaunchConfig,
}

impl ExecutionLauncher {
    pub fn new(sources: SessionSources, config: LaunchConfig) -> Self {
        let registry = sources.registry().clone();
        Self {
            sources,
            registry,
            config,
        }
    }

    pub fn registry(&self) -> &ActiveSessionRegistry {
        &self.registry
    }

    pub async fn launch(&self, request: LaunchRequest) -> Result<LaunchedSession, LaunchError> {
        let adapter = self
            .sources
            .get(request.source)
            .ok_or(DiscoveryError::UnknownSource(request.source))?;

        let placeholder = match &request.resume {
            Some(id) => id.clone(),
            None => {
                let project_key = adapter.project_key_for(&request.workspace).await;
                SessionId::new(
                    request.source,
                    project_key,
                    format!("{PLACEHOLDER_PREFIX}{}", Uuid::new_v4()),
                )
            }
        };
        self.registry.register(placeholder.clone());

        let spawned_at = SystemTime::now();
        let mut child = match self.spawn(&request, &placeholder) {
            Ok(child) => child,
            Err(e) => {
                self.registry.unregister(&placeholder);
                return Err(e);
            }
        };
        let pid = child.id();
        tracing::info!(
            session_id = %placeholder,
            program = %request.command.program,
            pid = ?pid,
            resume = request.resume.is_some(),
            "Spawned agent subprocess"
        );

        let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => (stdout, stderr),
            (stdout, _) => {
                if let Err(e) = child.start_kill() {
                    tracing::warn!(session_id = %placeholder, error = %e, "Failed to kill subprocess");
                }
                self.registry.unregister(&placeholder);
                let missing = if stdout.is_none() { "stdout" } else { "stderr" };
                return Err(LaunchError::MissingStdio(missing));
            }
        };

        let (line_tx, line_rx) = mpsc::channel(STDOUT_BUFFER);
        let scrape = request.resume.is_none().then_some(line_tx);
        relay_lines(stdout, "stdout", placeholder.clone(), scrape);
        relay_lines(stderr, "stderr", placeholder.clone(), None);

        let cancel = CancellationToken::new();
        let exited = CancellationToken::new();
        let (final_tx, final_rx) = oneshot::channel();
        let monitor = tokio::spawn(monitor(
            child,
            cancel.clone(),
            exited.clone(),
            final_rx,
            placeholder.clone(),
            self.registry.clone(),
        ));

        let (session_id, resolved_by) = if request.resume.is_some() {
            (placeholder.clone(), None)
        } else {
            let signals = ResolveSignals {
                stdout: Some(line_rx),
                exited: exited.clone(),
                cancel: cancel.clone(),
            };
            let probe = ResolveProbe {
                source: &*adapter,
                workspace: request.workspace.clone(),
                spawned_at,
            };
            let resolution = resolve_session_id(signals, probe, &self.config).await;
            let session_id = match &resolution {
                Resolution::Stdout(key) => {
                    SessionId::new(request.source, placeholder.project_key.clone(), key.clone())
                }
                Resolution::Filesystem(location) => SessionId::new(
                    request.source,
                    location.project_key.clone(),
                    location.session_key.clone(),
                ),
                Resolution::Timeout | Resolution::Exited | Resolution::Cancelled => placeholder.clone(),
            };
            if session_id != placeholder {
                self.registry.rekey(&placeholder, session_id.clone());
            }
            (session_id, Some(resolution))
        };

        // Only fails if the monitor is gone, in which case it already cleaned up.
        let _ = final_tx.send(session_id.clone());

        Ok(LaunchedSession {
            session_id,
            placeholder_id: placeholder,
            resolved_by,
            pid,
            cancel,
            exited,
            monitor,
        })
    }

    fn spawn(&self, request: &LaunchRequest, placeholder: &SessionId) -> Result<Child, LaunchError> {
        let spec = &request.command;
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env(SESSION_ID_ENV, placeholder.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if request.workspace.is_dir() {
            cmd.current_dir(&request.workspace);
        }
        cmd.spawn().map_err(|source| LaunchError::SpawnFailed {
            program: spec.program.clone(),
            source,
        })
    }
}

/// Relay one output stream into tracing, optionally feeding the resolver.
fn relay_lines<R>(reader: R, stream: &'static str, id: SessionId, mut scrape: Option<mpsc::Sender<String>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if stream == "stderr" {
                        tracing::info!(session_id = %id, stream, "{line}");
                    } else {
                        tracing::debug!(session_id = %id, stream, "{line}");
                    }
                    if let Some(tx) = &scrape {
                        // The resolver hangs up once it has an answer.
                        if tx.send(line).await.is_err() {
                            scrape = None;
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(session_id = %id, stream, error = %e, "Output relay stopped");
                    break;
                }
            }
        }
    });
}

async fn monitor(
    mut child: Child,
    cancel: CancellationToken,
    exited: CancellationToken,
    final_id: oneshot::Receiver<SessionId>,
    placeholder: SessionId,
    registry: ActiveSessionRegistry,
) -> Option<ExitStatus> {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = cancel.cancelled() => {
            tracing::info!(session_id = %placeholder, "Killing agent subprocess");
            if let Err(e) = child.kill().await {
                tracing::warn!(session_id = %placeholder, error = %e, "Failed to kill subprocess");
            }
            child.wait().await
        }
    };
    let status = match status {
        Ok(status) => Some(status),
        Err(e) => {
            tracing::warn!(session_id = %placeholder, error = %e, "Waiting on subprocess failed");
            None
        }
    };
    exited.cancel();

    // The launch may have been dropped mid-resolution; fall back to whatever
    // the placeholder was rekeyed to.
    let id = match final_id.await {
        Ok(id) => id,
        Err(_) => registry.canonical(&placeholder),
    };
    registry.unregister(&id);
    tracing::info!(session_id = %id, status = ?status, "Agent subprocess exited");
    status
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::StreamConfig;
    use crate::paths::SourceRoots;
    use std::time::Duration;

    fn launcher(root: &std::path::Path, config: LaunchConfig) -> ExecutionLauncher {
        let sources = SessionSources::new(
            &SourceRoots::under(root),
            ActiveSessionRegistry::new(),
            StreamConfig::default(),
        );
        ExecutionLauncher::new(sources, config)
    }

    fn quick() -> LaunchConfig {
        LaunchConfig {
            resolution_timeout: Duration::from_secs(10),
            probe_interval: Duration::from_millis(50),
            staleness_window: Duration::from_secs(5),
        }
    }

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").arg("-c").arg(script)
    }

    #[tokio::test]
    async fn test_spawn_failure_unregisters() {
        let root = tempfile::tempdir().unwrap();
        let launcher = launcher(root.path(), quick());
        let err = launcher
            .launch(LaunchRequest {
                source: SourceKind::Claude,
                workspace: root.path().to_path_buf(),
                command: CommandSpec::new("/definitely/not/a/real/agent"),
                resume: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::SpawnFailed { .. }));
        assert!(launcher.registry().is_empty());
    }

    #[tokio::test]
    async fn test_stdout_resolution_rekeys_then_unregisters() {
        let root = tempfile::tempdir().unwrap();
        let launcher = launcher(root.path(), quick());
        let script = r#"echo '{"type":"system","subtype":"init","session_id":"real-1"}'; sleep 0.3"#;
        let launched = launcher
            .launch(LaunchRequest {
                source: SourceKind::Claude,
                workspace: root.path().to_path_buf(),
                command: sh(script),
                resume: None,
            })
            .await
            .unwrap();

        assert_eq!(launched.resolved_by, Some(Resolution::Stdout("real-1".into())));
        assert_eq!(launched.session_id.session_key, "real-1");
        assert!(launched.placeholder_id.session_key.starts_with(PLACEHOLDER_PREFIX));
        assert!(launched.is_resolved());

        let registry = launcher.registry().clone();
        assert!(registry.is_active(&launched.session_id));
        assert!(registry.is_active(&launched.placeholder_id));

        let real = launched.session_id.clone();
        let status = launched.wait().await;
        assert!(status.is_some_and(|s| s.success()));
        assert!(!registry.is_active(&real));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_placeholder_is_exported() {
        let root = tempfile::tempdir().unwrap();
        let launcher = launcher(root.path(), quick());
        let script = format!(
            r#"printf '{{"type":"system","subtype":"init","session_id":"%s"}}\n' "${SESSION_ID_ENV}""#
        );
        let launched = launcher
            .launch(LaunchRequest {
                source: SourceKind::Claude,
                workspace: root.path().to_path_buf(),
                command: sh(&script),
                resume: None,
            })
            .await
            .unwrap();
        // The child echoed back the composite placeholder it was given.
        assert_eq!(
            launched.session_id.session_key,
            launched.placeholder_id.to_string()
        );
        launched.wait().await;
    }

    #[tokio::test]
    async fn test_announcement_right_before_exit_resolves() {
        let root = tempfile::tempdir().unwrap();
        let launcher = launcher(root.path(), quick());
        let script = r#"echo '{"type":"system","subtype":"init","session_id":"real-1"}'"#;
        for _ in 0..25 {
            let launched = launcher
                .launch(LaunchRequest {
                    source: SourceKind::Claude,
                    workspace: root.path().to_path_buf(),
                    command: sh(script),
                    resume: None,
                })
                .await
                .unwrap();
            assert_eq!(launched.resolved_by, Some(Resolution::Stdout("real-1".into())));
            launched.wait().await;
        }
        assert!(launcher.registry().is_empty());
    }

    #[tokio::test]
    async fn test_exit_before_resolution_keeps_placeholder() {
        let root = tempfile::tempdir().unwrap();
        let launcher = launcher(root.path(), quick());
        let launched = launcher
            .launch(LaunchRequest {
                source: SourceKind::Codex,
                workspace: root.path().to_path_buf(),
                command: sh("echo nothing to see"),
                resume: None,
            })
            .await
            .unwrap();
        assert_eq!(launched.resolved_by, Some(Resolution::Exited));
        assert_eq!(launched.session_id, launched.placeholder_id);
        let registry = launcher.registry().clone();
        launched.wait().await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_kills_child() {
        let root = tempfile::tempdir().unwrap();
        let launcher = launcher(root.path(), quick());
        let resume = SessionId::new(SourceKind::Claude, "-work", "existing");
        let launched = launcher
            .launch(LaunchRequest {
                source: SourceKind::Claude,
                workspace: root.path().to_path_buf(),
                command: sh("sleep 30"),
                resume: Some(resume.clone()),
            })
            .await
            .unwrap();
        assert_eq!(launched.session_id, resume);
        assert_eq!(launched.resolved_by, None);
        assert!(launcher.registry().is_active(&resume));

        launched.cancel.cancel();
        let status = tokio::time::timeout(Duration::from_secs(5), launched.wait())
            .await
            .unwrap();
        assert!(status.is_some_and(|s| !s.success()));
        assert!(!launcher.registry().is_active(&resume));
    }
}
