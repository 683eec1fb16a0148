//! TCP connector and acceptor

use async_trait::async_trait;
use burrow_proto::{SessionHello, SessionMode};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::framed::{read_hello, write_hello};
use crate::{Acceptor, BoxedIo, Connector, TransportError, TransportResult};

/// Connects to a gateway over plain TCP
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
    agent_id: String,
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            agent_id: agent_id.into(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, mode: SessionMode) -> TransportResult<BoxedIo> {
        let mut stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| {
                TransportError::ConnectionError(format!("Failed to connect to {}: {}", self.addr, e))
            })?;

        stream.set_nodelay(true)?;

        let hello = SessionHello::new(self.agent_id.clone(), mode);
        write_hello(&mut stream, &hello).await?;

        debug!(gateway = %self.addr, mode = %mode, "Session connection established");

        Ok(Box::new(stream))
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}

type Handshaken = (SessionHello, BoxedIo);

/// Pause after a failed `accept` so fd exhaustion does not spin the loop
pub(crate) const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// Source of raw inbound connections for the accept loop
#[async_trait]
pub(crate) trait Listen: Send + Sync + 'static {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;
}

#[async_trait]
impl Listen for TcpListener {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }
}

/// Accepts session connections on a TCP listener
///
/// Handshakes run on their own tasks so a slow peer cannot hold up the accept loop.
pub struct TcpAcceptor {
    local_addr: SocketAddr,
    incoming: mpsc::Receiver<Handshaken>,
    accept_task: JoinHandle<()>,
}

impl TcpAcceptor {
    /// Time allowed for a peer to send its hello
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

    pub async fn bind(addr: &str) -> TransportResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (tx, incoming) = mpsc::channel(64);

        info!(listen_addr = %local_addr, "Accepting agent sessions");

        let accept_task = tokio::spawn(Self::accept_loop(listener, tx));

        Ok(Self {
            local_addr,
            incoming,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) async fn accept_loop<L: Listen>(listener: L, tx: mpsc::Sender<Handshaken>) {
        loop {
            let (mut stream, peer_addr) = match Listen::accept(&listener).await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Accept error");
                    tokio::time::sleep(ACCEPT_ERROR_PAUSE).await;
                    if tx.is_closed() {
                        break;
                    }
                    continue;
                }
            };

            let handshake_tx = tx.clone();
            tokio::spawn(async move {
                let _ = stream.set_nodelay(true);
                match tokio::time::timeout(Self::HANDSHAKE_TIMEOUT, read_hello(&mut stream)).await
                {
                    Ok(Ok(hello)) => {
                        debug!(
                            peer_addr = %peer_addr,
                            agent_id = %hello.agent_id,
                            mode = %hello.mode,
                            "Session handshake complete"
                        );
                        let _ = handshake_tx
                            .send((hello, Box::new(stream) as BoxedIo))
                            .await;
                    }
                    Ok(Err(e)) => {
                        warn!(peer_addr = %peer_addr, error = %e, "Session handshake failed");
                    }
                    Err(_) => {
                        warn!(peer_addr = %peer_addr, "Session handshake timed out");
                    }
                }
            });

            if tx.is_closed() {
                break;
            }
        }
    }
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    async fn accept(&mut self) -> TransportResult<Option<(SessionHello, BoxedIo)>> {
        Ok(self.incoming.recv().await)
    }
}

impl Drop for TcpAcceptor {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}
