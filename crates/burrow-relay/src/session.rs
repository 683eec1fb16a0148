//! Agent supervisor: keeps the agent attached to its gateway

use std::sync::Arc;

use burrow_proto::SessionMode;
use burrow_transport::{Connector, StreamChannel};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::call::{serve_calls, CallSession};
use crate::config::RelayConfig;
use crate::dispatch::Dispatcher;
use crate::reconnect::{Backoff, ReconnectConfig, ReconnectError};
use crate::registry::TunnelRegistry;

/// How tunnels reach the gateway, chosen once at startup
pub enum TunnelTransport {
    /// Each tunnel a logical stream of one stream-mode connection
    Stream(StreamChannel),
    /// One call-mode connection carrying every tunnel
    Call(Arc<dyn Connector>),
}

impl TunnelTransport {
    pub fn new(connector: Arc<dyn Connector>, mode: SessionMode) -> Self {
        match mode {
            SessionMode::Stream => TunnelTransport::Stream(StreamChannel::new(connector)),
            SessionMode::Call => TunnelTransport::Call(connector),
        }
    }

    pub fn mode(&self) -> SessionMode {
        match self {
            TunnelTransport::Stream(_) => SessionMode::Stream,
            TunnelTransport::Call(_) => SessionMode::Call,
        }
    }
}

/// Runs the agent side of either transport until cancelled
pub struct Supervisor {
    transport: TunnelTransport,
    registry: TunnelRegistry,
    config: RelayConfig,
    reconnect: ReconnectConfig,
}

impl Supervisor {
    pub fn new(transport: TunnelTransport, registry: TunnelRegistry, config: RelayConfig) -> Self {
        Self {
            transport,
            registry,
            config,
            reconnect: ReconnectConfig::default(),
        }
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn registry(&self) -> &TunnelRegistry {
        &self.registry
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ReconnectError> {
        info!(
            origin = %self.registry.origin(),
            mode = %self.transport.mode(),
            "Supervisor started"
        );

        match &self.transport {
            TunnelTransport::Stream(channel) => {
                let result =
                    Dispatcher::new(channel.clone(), self.registry.clone(), self.config.clone())
                        .with_reconnect(self.reconnect.clone())
                        .run(cancel)
                        .await;
                channel.close().await;
                result
            }
            TunnelTransport::Call(connector) => self.run_calls(connector.as_ref(), cancel).await,
        }
    }

    /// Keep one call session open, serving the gateway's calls on it
    async fn run_calls(
        &self,
        connector: &dyn Connector,
        cancel: CancellationToken,
    ) -> Result<(), ReconnectError> {
        let mut backoff = Backoff::new(self.reconnect.clone());

        loop {
            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                connected = connector.connect(SessionMode::Call) => connected,
            };

            let io = match connected {
                Ok(io) => io,
                Err(e) => {
                    error!(gateway = %connector.describe(), error = %e, "Failed to open call session");
                    if !backoff.wait(&cancel).await? {
                        break;
                    }
                    continue;
                }
            };

            let started = Instant::now();
            let (session, incoming) =
                CallSession::start(io, connector.describe(), self.registry.clone());

            tokio::select! {
                _ = serve_calls(session.clone(), incoming, Some(self.config.clone())) => {}
                _ = cancel.cancelled() => {
                    session.close().await;
                    break;
                }
            }
            session.close().await;

            backoff.session_lost(started.elapsed());
            warn!(gateway = %connector.describe(), "Call session lost, reconnecting");

            if !backoff.wait(&cancel).await? {
                break;
            }
        }

        info!("Supervisor stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_transport::{memory, Acceptor};
    use std::time::Duration;

    fn fast_reconnect() -> ReconnectConfig {
        ReconnectConfig {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            jitter: 0.0,
            ..ReconnectConfig::default()
        }
    }

    #[test]
    fn test_transport_mode() {
        let (connector, _acceptor) = memory::link("agent-1");
        let connector: Arc<dyn Connector> = Arc::new(connector);

        assert_eq!(
            TunnelTransport::new(connector.clone(), SessionMode::Stream).mode(),
            SessionMode::Stream
        );
        assert_eq!(
            TunnelTransport::new(connector, SessionMode::Call).mode(),
            SessionMode::Call
        );
    }

    #[tokio::test]
    async fn test_call_supervisor_reconnects_after_session_loss() {
        let (connector, mut acceptor) = memory::link("agent-1");
        let supervisor = Supervisor::new(
            TunnelTransport::new(Arc::new(connector), SessionMode::Call),
            TunnelRegistry::new("agent-1"),
            RelayConfig::default(),
        )
        .with_reconnect(fast_reconnect());

        let cancel = CancellationToken::new();
        let run = tokio::spawn({
            let cancel = cancel.clone();
            async move { supervisor.run(cancel).await }
        });

        let (hello, first) = acceptor.accept().await.unwrap().unwrap();
        assert_eq!(hello.mode, SessionMode::Call);
        drop(first);

        let (hello, _second) = tokio::time::timeout(Duration::from_secs(2), acceptor.accept())
            .await
            .expect("supervisor should reconnect")
            .unwrap()
            .unwrap();
        assert_eq!(hello.agent_id, "agent-1");

        cancel.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let (connector, acceptor) = memory::link("agent-1");
        drop(acceptor);

        let supervisor = Supervisor::new(
            TunnelTransport::new(Arc::new(connector), SessionMode::Call),
            TunnelRegistry::new("agent-1"),
            RelayConfig::default(),
        )
        .with_reconnect(ReconnectConfig {
            max_attempts: Some(2),
            ..fast_reconnect()
        });

        let result = supervisor.run(CancellationToken::new()).await;
        assert!(matches!(result, Err(ReconnectError::MaxAttemptsReached(2))));
    }
}
