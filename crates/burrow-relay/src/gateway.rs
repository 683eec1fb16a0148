//! Gateway side: accepts agent sessions and opens tunnels through them
//!
//! In stream mode the agent keeps an idle logical stream open on its stream
//! session; each tunnel consumes one by sending its `DialRequest`. In call mode
//! the gateway issues `CreateTunnel` on the agent's call session instead.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use burrow_proto::{Envelope, SessionHello, SessionMode, TunnelId};
use burrow_transport::{
    Acceptor, BoxedIo, EnvelopeReceiver, EnvelopeSender, Multiplexer, MuxRole, MuxStream,
    TransportError, TunnelStream,
};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::call::{serve_calls, CallSession};
use crate::config::RelayConfig;
use crate::registry::{TunnelInfo, TunnelRegistry};
use crate::relay::{relay, TunnelReport};

/// Errors opening a tunnel from the gateway
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("No agent available")]
    NoAgent,

    #[error("Agent could not reach {destination}: {reason}")]
    DialFailed { destination: String, reason: String },

    #[error("Timed out waiting for the agent's dial response")]
    Timeout,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Origin of tunnel ids allocated by the gateway
    pub label: String,
    pub relay: RelayConfig,
    /// How long `open_tunnel` waits for an idle agent stream
    pub agent_wait: Duration,
    /// Idle streams tried before giving up (stale streams are skipped)
    pub dial_attempts: usize,
    /// How long to wait for the agent's `DialResponse`
    pub response_timeout: Duration,
    /// Idle streams kept; extra streams are closed on arrival
    pub max_idle_streams: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let relay = RelayConfig::default();
        Self {
            label: "gateway".to_string(),
            response_timeout: relay.dial_timeout + Duration::from_secs(5),
            relay,
            agent_wait: Duration::from_secs(10),
            dial_attempts: 3,
            max_idle_streams: 64,
        }
    }
}

struct IdleStream {
    agent_id: String,
    stream: MuxStream,
}

/// A tunnel the gateway has opened through an agent
pub struct GatewayTunnel {
    pub tunnel_id: TunnelId,
    pub agent_id: String,
    sender: Box<dyn EnvelopeSender>,
    receiver: Box<dyn EnvelopeReceiver>,
    /// Call-mode tunnels are registered by their session
    registered: bool,
}

impl GatewayTunnel {
    pub fn into_parts(self) -> (Box<dyn EnvelopeSender>, Box<dyn EnvelopeReceiver>) {
        (self.sender, self.receiver)
    }
}

pub struct Gateway {
    config: GatewayConfig,
    registry: TunnelRegistry,
    idle: Mutex<VecDeque<IdleStream>>,
    idle_ready: Notify,
    stream_sessions: Mutex<Vec<Arc<Multiplexer>>>,
    session: RwLock<Option<Arc<CallSession>>>,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Arc<Self> {
        Arc::new(Self {
            registry: TunnelRegistry::new(config.label.clone()),
            config,
            idle: Mutex::new(VecDeque::new()),
            idle_ready: Notify::new(),
            stream_sessions: Mutex::new(Vec::new()),
            session: RwLock::new(None),
        })
    }

    pub fn registry(&self) -> &TunnelRegistry {
        &self.registry
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Accept agent sessions until `cancel` fires or the acceptor closes
    pub async fn serve<A: Acceptor>(self: Arc<Self>, mut acceptor: A, cancel: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = acceptor.accept() => accepted,
            };

            match accepted {
                Ok(Some((hello, io))) => self.admit(hello, io).await,
                Ok(None) => {
                    info!("Acceptor closed");
                    break;
                }
                Err(e) => warn!(error = %e, "Failed to accept agent session"),
            }
        }

        let session = self.session.write().await.take();
        if let Some(session) = session {
            session.close().await;
        }
        let stream_sessions: Vec<_> = lock(&self.stream_sessions).drain(..).collect();
        for mux in stream_sessions {
            mux.close();
        }
        lock(&self.idle).clear();
    }

    async fn admit(self: &Arc<Self>, hello: SessionHello, io: BoxedIo) {
        match hello.mode {
            SessionMode::Stream => {
                let label = format!("stream:{}", hello.agent_id);
                let (mux, mut incoming) = Multiplexer::start(io, label, MuxRole::Acceptor);
                {
                    let mut sessions = lock(&self.stream_sessions);
                    sessions.retain(|mux| !mux.is_closed());
                    sessions.push(mux);
                }

                let gateway = self.clone();
                let agent_id = hello.agent_id;
                tokio::spawn(async move {
                    while let Some(stream) = incoming.accept().await {
                        gateway.add_idle(IdleStream {
                            agent_id: agent_id.clone(),
                            stream,
                        });
                    }
                    debug!(agent_id = %agent_id, "Stream session ended");
                });
            }
            SessionMode::Call => {
                let (session, incoming) =
                    CallSession::start(io, hello.agent_id.clone(), self.registry.clone());

                let previous = self.session.write().await.replace(session.clone());
                if let Some(previous) = previous {
                    info!(agent_id = %previous.peer(), "Replacing call session");
                    previous.close().await;
                }

                let gateway = self.clone();
                tokio::spawn(async move {
                    serve_calls(session.clone(), incoming, None).await;

                    let mut slot = gateway.session.write().await;
                    if matches!(slot.as_ref(), Some(current) if Arc::ptr_eq(current, &session)) {
                        *slot = None;
                    }
                });
            }
        }
    }

    /// The agent's call session, if one is live
    pub async fn call_session(&self) -> Option<Arc<CallSession>> {
        let slot = self.session.read().await;
        slot.as_ref().filter(|session| !session.is_closed()).cloned()
    }

    /// Open a tunnel to `destination` through the connected agent
    ///
    /// Prefers a live call session; otherwise consumes idle streams, skipping any
    /// that turn out to be dead.
    pub async fn open_tunnel(&self, destination: &str) -> Result<GatewayTunnel, GatewayError> {
        if let Some(session) = self.call_session().await {
            let tunnel = session
                .open_tunnel(destination)
                .await
                .map_err(|e| match e {
                    TransportError::Remote(reason) => GatewayError::DialFailed {
                        destination: destination.to_string(),
                        reason,
                    },
                    other => GatewayError::Transport(other),
                })?;

            return Ok(GatewayTunnel {
                tunnel_id: tunnel.tunnel_id,
                agent_id: session.peer().to_string(),
                sender: Box::new(tunnel.sender),
                receiver: Box::new(tunnel.receiver),
                registered: true,
            });
        }

        let mut last_error = GatewayError::NoAgent;

        for attempt in 1..=self.config.dial_attempts.max(1) {
            let idle = self.next_idle_stream().await?;
            let (mut sender, mut receiver) = idle.stream.split();

            if let Err(e) = sender.send(Envelope::dial_request(destination)).await {
                debug!(attempt, error = %e, "Idle stream is stale");
                last_error = e.into();
                continue;
            }

            let response =
                tokio::time::timeout(self.config.response_timeout, receiver.recv()).await;

            match response {
                Ok(Ok(Some(Envelope::DialResponse { error: None }))) => {
                    return Ok(GatewayTunnel {
                        tunnel_id: self.registry.allocate_id(destination),
                        agent_id: idle.agent_id,
                        sender: Box::new(sender),
                        receiver: Box::new(receiver),
                        registered: false,
                    });
                }
                Ok(Ok(Some(Envelope::DialResponse {
                    error: Some(reason),
                }))) => {
                    let _ = sender.finish().await;
                    return Err(GatewayError::DialFailed {
                        destination: destination.to_string(),
                        reason,
                    });
                }
                Ok(Ok(Some(other))) => {
                    let _ = sender.finish().await;
                    return Err(GatewayError::Protocol(format!(
                        "expected DialResponse, got {}",
                        other.kind()
                    )));
                }
                Ok(Ok(None)) => {
                    debug!(attempt, "Idle stream closed before answering");
                    last_error = GatewayError::Transport(TransportError::StreamClosed);
                }
                Ok(Err(e)) => {
                    debug!(attempt, error = %e, "Idle stream failed before answering");
                    last_error = e.into();
                }
                Err(_) => {
                    let _ = sender.finish().await;
                    return Err(GatewayError::Timeout);
                }
            }
        }

        Err(last_error)
    }

    fn add_idle(&self, idle: IdleStream) {
        {
            let mut pool = lock(&self.idle);
            pool.retain(|queued| queued.stream.is_open());
            if pool.len() >= self.config.max_idle_streams.max(1) {
                warn!(agent_id = %idle.agent_id, "Idle stream pool full, closing stream");
                return;
            }
            pool.push_back(idle);
        }
        debug!("Idle agent stream added to pool");
        self.idle_ready.notify_waiters();
    }

    /// Number of idle agent streams waiting for a tunnel
    pub fn idle_streams(&self) -> usize {
        lock(&self.idle).len()
    }

    /// Take an idle stream, waiting up to `agent_wait` for one to arrive
    ///
    /// Callers wait concurrently, each against its own deadline.
    async fn next_idle_stream(&self) -> Result<IdleStream, GatewayError> {
        let deadline = Instant::now() + self.config.agent_wait;
        loop {
            let ready = self.idle_ready.notified();
            tokio::pin!(ready);
            // Registered before checking the pool so an arrival in between is not missed
            ready.as_mut().enable();

            let taken = lock(&self.idle).pop_front();
            if let Some(idle) = taken {
                return Ok(idle);
            }
            if tokio::time::timeout_at(deadline, ready).await.is_err() {
                return Err(GatewayError::NoAgent);
            }
        }
    }

    /// Relay a client connection to `destination` through the agent
    pub async fn forward(
        &self,
        socket: TcpStream,
        destination: &str,
    ) -> Result<TunnelReport, GatewayError> {
        let tunnel = self.open_tunnel(destination).await?;
        let tunnel_id = tunnel.tunnel_id.clone();
        let registered = tunnel.registered;

        if !registered {
            if let Err(e) = self
                .registry
                .insert(TunnelInfo::new(tunnel_id.clone()), None)
                .await
            {
                warn!(error = %e, "Tunnel registration failed");
            }
        }

        debug!(tunnel_id = %tunnel_id, agent_id = %tunnel.agent_id, "Forwarding client connection");
        let (sender, receiver) = tunnel.into_parts();
        let report = relay(tunnel_id.clone(), sender, receiver, socket, &self.config.relay).await;

        if !registered {
            self.registry.remove(&tunnel_id).await;
        }
        Ok(report)
    }

    /// Forward every client accepted on `listener` to `destination`
    pub async fn serve_forward(
        self: Arc<Self>,
        listener: TcpListener,
        destination: String,
        cancel: CancellationToken,
    ) {
        let local = listener
            .local_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_default();
        info!(listen = %local, destination = %destination, "Forwarding");

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            let (socket, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Failed to accept client");
                    continue;
                }
            };

            let gateway = self.clone();
            let destination = destination.clone();
            tokio::spawn(async move {
                debug!(client = %peer, destination = %destination, "Client connected");
                if let Err(e) = gateway.forward(socket, &destination).await {
                    warn!(client = %peer, destination = %destination, error = %e, "Tunnel not opened");
                }
            });
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
