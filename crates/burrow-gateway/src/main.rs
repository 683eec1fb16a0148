//! Burrow Gateway - local listeners tunneled through a connected agent
//!
//! Agents connect in on `--listen`. Every client accepted on a forward's local
//! address becomes a tunnel that the agent dials out to the forward's destination.

mod config;

use anyhow::{Context, Result};
use burrow_relay::Gateway;
use burrow_transport::TcpAcceptor;
use clap::Parser;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{build_gateway_settings, ForwardRule};

/// Burrow tunnel gateway - forwards local listeners through a connected agent
#[derive(Parser, Debug)]
#[command(name = "burrow-gateway")]
#[command(about = "Burrow tunnel gateway - forwards local listeners through a connected agent")]
#[command(version)]
#[command(long_about = r#"
Burrow Gateway accepts agent connections and forwards local TCP listeners
through them. Each client connection becomes one tunnel, dialed by the agent.

EXAMPLES:
  # Reach a database behind the agent on local port 15432
  burrow-gateway --listen 0.0.0.0:8080 --forward 127.0.0.1:15432=db.internal:5432

  # Several forwards at once
  burrow-gateway --forward 127.0.0.1:15432=db.internal:5432 \
    --forward 127.0.0.1:2222=bastion.internal:22

  # Start gateway using config file
  burrow-gateway --config gateway.yaml

ENVIRONMENT VARIABLES:
  BURROW_LISTEN      Address agents connect to
"#)]
pub struct Args {
    /// Address agents connect to [default: 0.0.0.0:8080]
    #[arg(long, short = 'l', env = "BURROW_LISTEN")]
    listen: Option<String>,

    /// Forward LOCAL=DEST (can be specified multiple times)
    #[arg(long, value_name = "LOCAL=DEST")]
    forward: Vec<ForwardRule>,

    /// Configuration file (YAML)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Seconds a client waits for an agent before being dropped
    #[arg(long, value_name = "SECS")]
    agent_wait: Option<u64>,

    /// Close tunnels idle for this many seconds (0 disables)
    #[arg(long, value_name = "SECS")]
    idle_timeout: Option<u64>,
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

    setup_logging(&args.log_level)?;

    info!("Burrow Gateway starting...");

    let settings =
        build_gateway_settings(args).context("Failed to build gateway configuration")?;

    if settings.forwards.is_empty() {
        warn!("No forwards configured; agents can connect but no tunnels will be opened");
    }

    let acceptor = TcpAcceptor::bind(&settings.listen)
        .await
        .with_context(|| format!("Failed to listen on {}", settings.listen))?;

    let gateway = Gateway::new(settings.gateway);
    let cancel = CancellationToken::new();
    let mut tasks = JoinSet::new();

    // Bind every forward before serving so a bad address fails startup
    let mut listeners = Vec::with_capacity(settings.forwards.len());
    for rule in settings.forwards {
        let listener = TcpListener::bind(&rule.local)
            .await
            .with_context(|| format!("Failed to bind forward {}", rule))?;
        info!("Forward: {}", rule);
        listeners.push((listener, rule.destination));
    }

    tasks.spawn(gateway.clone().serve(acceptor, cancel.clone()));
    for (listener, destination) in listeners {
        tasks.spawn(
            gateway
                .clone()
                .serve_forward(listener, destination, cancel.clone()),
        );
    }

    shutdown_signal().await?;
    cancel.cancel();

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            warn!("Gateway task failed: {}", e);
        }
    }

    let open_tunnels = gateway.registry().count().await;
    info!(open_tunnels, "Gateway stopped");
    Ok(())
}
