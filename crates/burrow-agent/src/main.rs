//! Burrow Agent - dials destinations on behalf of a gateway
//!
//! The agent connects out to the gateway and relays every tunnel the gateway
//! asks for to a TCP destination reachable from the agent's network.

mod config;

use anyhow::{Context, Result};
use burrow_proto::SessionMode;
use burrow_relay::{Supervisor, TunnelRegistry, TunnelTransport};
use burrow_transport::TcpConnector;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::build_agent_settings;

/// Burrow tunnel agent - dials destinations on behalf of a gateway
#[derive(Parser, Debug)]
#[command(name = "burrow-agent")]
#[command(about = "Burrow tunnel agent - dials destinations on behalf of a gateway")]
#[command(version)]
#[command(long_about = r#"
Burrow Agent connects out to a gateway and relays each tunnel the gateway
opens to the requested host:port, as seen from the agent's network.

EXAMPLES:
  # Connect to a gateway; each tunnel is a stream on one connection
  burrow-agent --gateway gateway.example.com:8080

  # Carry tunnel traffic as request/response calls instead
  burrow-agent --gateway gateway.example.com:8080 --mode call

  # Start agent using config file
  burrow-agent --config agent.yaml --log-level debug

ENVIRONMENT VARIABLES:
  BURROW_GATEWAY     Gateway address (host:port)
  BURROW_AGENT_ID    Agent identifier
  BURROW_MODE        Session mode (stream or call)
"#)]
pub struct Args {
    /// Gateway address [default: 127.0.0.1:8080]
    #[arg(long, env = "BURROW_GATEWAY")]
    gateway: Option<String>,

    /// Agent ID (auto-generated if not specified)
    #[arg(long, env = "BURROW_AGENT_ID")]
    agent_id: Option<String>,

    /// Session mode: `stream` (a logical stream per tunnel) or `call` (tunnel writes as calls)
    #[arg(long, env = "BURROW_MODE")]
    mode: Option<SessionMode>,

    /// Configuration file (YAML)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Bytes read from a destination per data frame
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Destination dial timeout in seconds
    #[arg(long, value_name = "SECS")]
    dial_timeout: Option<u64>,

    /// Close tunnels idle for this many seconds (0 disables)
    #[arg(long, value_name = "SECS")]
    idle_timeout: Option<u64>,

    /// Give up after this many consecutive failed reconnects
    #[arg(long)]
    max_attempts: Option<usize>,
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        let mut sigint =
            signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
            _ = sigint.recv() => info!("Received SIGINT, shutting down..."),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logging first
    setup_logging(&args.log_level)?;

    info!("Burrow Agent starting...");

    let settings = build_agent_settings(args).context("Failed to build agent configuration")?;

    info!("Agent ID: {}", settings.agent_id);
    info!("Gateway: {}", settings.gateway_addr);
    info!("Mode: {}", settings.mode);

    let connector = Arc::new(TcpConnector::new(
        settings.gateway_addr.clone(),
        settings.agent_id.clone(),
    ));
    let supervisor = Supervisor::new(
        TunnelTransport::new(connector, settings.mode),
        TunnelRegistry::new(settings.agent_id),
        settings.relay,
    )
    .with_reconnect(settings.reconnect);

    let cancel = CancellationToken::new();
    let mut supervisor_task = tokio::spawn({
        let cancel = cancel.clone();
        async move { supervisor.run(cancel).await }
    });

    // The supervisor only returns on its own when reconnects are exhausted
    tokio::select! {
        signal = shutdown_signal() => {
            signal?;
            cancel.cancel();
            match supervisor_task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Supervisor error during shutdown: {}", e),
                Err(e) => error!("Supervisor task panicked: {}", e),
            }
        }
        result = &mut supervisor_task => {
            match result {
                Ok(Ok(())) => info!("Supervisor stopped"),
                Ok(Err(e)) => {
                    error!("Giving up on the gateway: {}", e);
                    return Err(e).context("Agent stopped");
                }
                Err(e) => {
                    error!("Supervisor task panicked: {}", e);
                    return Err(e.into());
                }
            }
        }
    }

    info!("Agent stopped");
    Ok(())
}
