use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{load_config_from, Session, SessionEvent};
use shared::protocol::HostEnvelope;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

/// Attaches to a script host (or replays a recorded session) and logs every
/// session event.
#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = client_core::config::DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    /// Overrides `host_url` from the config file and environment.
    #[arg(long)]
    host_url: Option<String>,
    /// JSON array of recorded host envelopes to replay instead of connecting.
    #[arg(long)]
    replay: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let mut config = load_config_from(&args.config, |key| std::env::var(key).ok());
    if let Some(host_url) = args.host_url {
        config.host_url = host_url;
    }

    let session = match &args.replay {
        Some(path) => {
            let raw = std::fs::read(path)
                .with_context(|| format!("failed to read recording {}", path.display()))?;
            let envelopes: Vec<HostEnvelope> = serde_json::from_slice(&raw)
                .with_context(|| format!("invalid recording {}", path.display()))?;
            Session::replay(envelopes, &config)
        }
        None => Session::connect(&config)?,
    };
    let mut events = session.subscribe_events();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let finished = match &event {
                        SessionEvent::ConnectionChanged(state) => {
                            state.is_terminal() && args.replay.is_none()
                        }
                        SessionEvent::Ended => true,
                        _ => false,
                    };
                    log_event(&event);
                    if finished {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "monitor: events dropped"),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("monitor: interrupted");
                break;
            }
        }
    }

    session.shutdown().await;
    Ok(())
}

fn log_event(event: &SessionEvent) {
    match event {
        SessionEvent::ConnectionChanged(state) => info!(?state, "monitor: connection"),
        SessionEvent::SessionStarted(info) => info!(
            session_id = %info.session_id,
            new_session = info.is_new_session,
            "monitor: session started"
        ),
        SessionEvent::Message(message) => info!(
            seq = message.seq,
            delta_path = ?message.metadata.delta_path,
            "monitor: {}",
            serde_json::to_string(&message.message).unwrap_or_else(|err| err.to_string())
        ),
        SessionEvent::ScriptFinished { status, generation } => {
            info!(?status, generation, "monitor: script finished")
        }
        SessionEvent::Diagnostic(diagnostic) => warn!("monitor: {}", diagnostic.message()),
        SessionEvent::Ended => info!("monitor: session ended"),
    }
}
