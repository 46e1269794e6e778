//! trail-replay: print a session's patch stream, or list what is on disk.
//!
//! Usage:
//!   trail-replay claude:-home-me-app:5d1c...      # SSE frames on stdout
//!   trail-replay --list-projects codex            # JSON array
//!   trail-replay --list-projects all
//!   trail-replay --list-sessions gemini:ab12...   # JSON array
//!
//! Source roots default to the agents' home-directory locations and can be
//! overridden with AGENT_TRAIL_<SOURCE>_DIR. Logs go to stderr; set
//! RUST_LOG to change verbosity.

use std::io::Write;

use agent_trail_core::types::SourceKind;
use agent_trail_core::{ActiveSessionRegistry, SessionSources, SourceRoots, StreamConfig};
use anyhow::{bail, Context, Result};
use clap::Parser;
use futures_util::StreamExt;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "warn,agent_trail_core=info";

#[derive(Debug, Parser)]
#[command(name = "trail-replay", version, about = "Replay or list coding-agent sessions")]
struct Args {
    /// Composite session id (`source:projectKey:sessionKey`) to stream.
    session_id: Option<String>,

    /// List projects of one source, or of every source with `all`.
    #[arg(long, value_name = "SOURCE", conflicts_with_all = ["session_id", "list_sessions"])]
    list_projects: Option<String>,

    /// List sessions of a composite project id (`source:projectKey`).
    #[arg(long, value_name = "PROJECT_ID", conflicts_with = "session_id")]
    list_sessions: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let args = Args::parse();
    let roots = SourceRoots::from_env().context("resolving agent data directories")?;
    let sources = SessionSources::new(&roots, ActiveSessionRegistry::new(), StreamConfig::from_env());

    if let Some(source) = args.list_projects.as_deref() {
        let projects = if source.eq_ignore_ascii_case("all") {
            sources.list_all_projects().await
        } else {
            let kind: SourceKind = source.parse()?;
            sources.list_projects(kind).await?
        };
        return print_json(&projects);
    }

    if let Some(project_id) = args.list_sessions.as_deref() {
        let sessions = sources.list_sessions(project_id).await?;
        return print_json(&sessions);
    }

    let Some(session_id) = args.session_id else {
        bail!("expected a session id, --list-projects or --list-sessions");
    };

    let mut stream = sources.open_stream(&session_id).await;
    let mut stdout = std::io::stdout().lock();
    let mut failed = false;
    while let Some(frame) = stream.next().await {
        stdout.write_all(frame.to_sse().as_bytes())?;
        stdout.flush()?;
        if matches!(frame, agent_trail_core::types::StreamFrame::Error(_)) {
            failed = true;
        }
    }
    if failed {
        bail!("stream for {session_id} ended with an error");
    }
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, value)?;
    writeln!(stdout)?;
    Ok(())
}
