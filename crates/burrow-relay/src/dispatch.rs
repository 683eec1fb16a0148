//! Agent-side dispatcher for stream-mode sessions

use burrow_proto::Envelope;
use burrow_transport::{EnvelopeReceiver, EnvelopeSender, TunnelChannel, TunnelStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RelayConfig;
use crate::reconnect::{Backoff, ReconnectConfig, ReconnectError};
use crate::registry::{TunnelInfo, TunnelRegistry};
use crate::relay::run_tunnel;

/// Keeps one idle stream open towards the gateway and hands every stream that
/// receives a `DialRequest` to its own relay worker
pub struct Dispatcher<C: TunnelChannel> {
    channel: C,
    registry: TunnelRegistry,
    config: RelayConfig,
    reconnect: ReconnectConfig,
}

impl<C: TunnelChannel> Dispatcher<C> {
    pub fn new(channel: C, registry: TunnelRegistry, config: RelayConfig) -> Self {
        Self {
            channel,
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

    /// Run until `cancel` fires
    ///
    /// Only a failure to open a stream backs off. A stream that ends or misbehaves
    /// before its `DialRequest` is dropped and replaced right away, so a broken
    /// stream never delays the next tunnel. The only error is running out of
    /// reconnect attempts.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ReconnectError> {
        let mut backoff = Backoff::new(self.reconnect.clone());

        info!(origin = %self.registry.origin(), "Dispatcher started");

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let made = tokio::select! {
                _ = cancel.cancelled() => break,
                made = self.channel.make() => made,
            };

            let stream = match made {
                Ok(stream) => stream,
                Err(e) => {
                    error!(error = %e, "Failed to open tunnel stream");
                    if !backoff.wait(&cancel).await? {
                        break;
                    }
                    continue;
                }
            };
            backoff.succeeded();

            let (mut sender, mut receiver) = stream.split();
            debug!("Idle stream ready, waiting for dial request");

            let first = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = sender.finish().await;
                    break;
                }
                first = receiver.recv() => first,
            };

            match first {
                Ok(Some(Envelope::DialRequest { destination })) => {
                    self.spawn_tunnel(sender, receiver, destination).await;
                    continue;
                }
                Ok(Some(other)) => {
                    warn!(kind = other.kind(), "Expected a dial request, dropping stream");
                }
                Ok(None) => {
                    debug!("Stream closed before a dial request arrived");
                }
                Err(e) => {
                    warn!(error = %e, "Stream failed before a dial request arrived");
                }
            }

            let _ = sender.finish().await;
        }

        let active_tunnels = self.registry.count().await;
        info!(active_tunnels, "Dispatcher stopped");
        Ok(())
    }

    async fn spawn_tunnel(
        &self,
        sender: <C::Stream as TunnelStream>::Sender,
        receiver: <C::Stream as TunnelStream>::Receiver,
        destination: String,
    ) {
        let tunnel_id = self.registry.allocate_id(&destination);
        if let Err(e) = self
            .registry
            .insert(TunnelInfo::new(tunnel_id.clone()), None)
            .await
        {
            warn!(error = %e, "Tunnel registration failed");
        }

        let registry = self.registry.clone();
        let config = self.config.clone();

        tokio::spawn(async move {
            let report = run_tunnel(tunnel_id.clone(), sender, receiver, destination, config).await;
            registry.remove(&tunnel_id).await;
            debug!(tunnel_id = %tunnel_id, outcome = ?report.outcome, "Tunnel worker finished");
        });
    }
}
