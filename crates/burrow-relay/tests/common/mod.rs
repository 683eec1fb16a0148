//! Shared fixtures for relay integration tests
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use burrow_proto::{DataFrame, Envelope};
use burrow_relay::{Dispatcher, ReconnectConfig, RelayConfig, TunnelRegistry};
use burrow_transport::{
    memory, Acceptor, Connector, EnvelopeReceiver, MemoryAcceptor, Multiplexer, MuxIncoming,
    MuxReceiver, MuxRole, MuxSender, StreamChannel, TunnelStream,
};
use socket2::SockRef;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub const STEP: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub fn test_relay_config() -> RelayConfig {
    RelayConfig {
        drain_timeout: Duration::from_secs(1),
        ..RelayConfig::default()
    }
}

pub fn fast_reconnect() -> ReconnectConfig {
    ReconnectConfig {
        initial_backoff: Duration::from_millis(20),
        max_backoff: Duration::from_millis(200),
        jitter: 0.0,
        ..ReconnectConfig::default()
    }
}

/// Echoes everything, then half-closes once the client does
pub async fn echo_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = socket.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
                let _ = w.shutdown().await;
            });
        }
    });
    addr
}

/// An address nothing listens on
pub async fn refused_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);
    addr
}

/// Reads `trigger_len` bytes, then resets the connection
pub async fn reset_server(trigger_len: usize) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        if let Ok((mut socket, _)) = listener.accept().await {
            let mut buf = vec![0u8; trigger_len];
            let _ = socket.read_exact(&mut buf).await;
            let _ = SockRef::from(&socket).set_linger(Some(Duration::ZERO));
            drop(socket);
        }
    });
    addr
}

/// Writes `payload`, then closes
pub async fn blast_server(payload: Vec<u8>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        if let Ok((mut socket, _)) = listener.accept().await {
            let _ = socket.write_all(&payload).await;
            let _ = socket.shutdown().await;
            // Keep the read side open until the peer is done
            let mut sink = Vec::new();
            let _ = socket.read_to_end(&mut sink).await;
        }
    });
    addr
}

/// Accepts connections but never reads from them
pub async fn stalled_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    addr
}

pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Gateway side of a stream-mode link, driven by hand
pub struct StreamGateway {
    acceptor: MemoryAcceptor,
    session: Option<(Arc<Multiplexer>, MuxIncoming)>,
    /// Stream-mode connections accepted so far
    pub connections: usize,
}

impl StreamGateway {
    /// Next stream the agent opens, accepting its connection if needed
    pub async fn next_stream(&mut self) -> (MuxSender, MuxReceiver) {
        loop {
            if self.session.is_none() {
                let (hello, io) = tokio::time::timeout(STEP, self.acceptor.accept())
                    .await
                    .expect("agent should connect")
                    .unwrap()
                    .unwrap();
                self.connections += 1;
                let label = format!("gateway<-{}", hello.agent_id);
                self.session = Some(Multiplexer::start(io, label, MuxRole::Acceptor));
            }

            let (_, incoming) = self.session.as_mut().unwrap();
            let next = tokio::time::timeout(STEP, incoming.accept())
                .await
                .expect("agent should open a stream");
            match next {
                Some(stream) => return stream.split(),
                None => self.session = None,
            }
        }
    }

    /// Drop the current connection; every stream on it fails
    pub fn drop_connection(&mut self) {
        if let Some((mux, _)) = self.session.take() {
            mux.close();
        }
    }
}

pub struct RunningDispatcher {
    pub gateway: StreamGateway,
    pub registry: TunnelRegistry,
    pub cancel: CancellationToken,
}

/// A dispatcher on a memory link
pub fn start_dispatcher() -> RunningDispatcher {
    start_dispatcher_with(fast_reconnect())
}

pub fn start_dispatcher_with(reconnect: ReconnectConfig) -> RunningDispatcher {
    let (connector, acceptor) = memory::link("agent-1");
    let connector: Arc<dyn Connector> = Arc::new(connector);
    let registry = TunnelRegistry::new("agent-1");
    let cancel = CancellationToken::new();

    let dispatcher = Dispatcher::new(
        StreamChannel::new(connector),
        registry.clone(),
        test_relay_config(),
    )
    .with_reconnect(reconnect);

    let token = cancel.clone();
    tokio::spawn(async move { dispatcher.run(token).await });

    RunningDispatcher {
        gateway: StreamGateway {
            acceptor,
            session: None,
            connections: 0,
        },
        registry,
        cancel,
    }
}

/// Next envelope, failing the test if none arrives in time
pub async fn next_envelope<R: EnvelopeReceiver>(receiver: &mut R) -> Option<Envelope> {
    tokio::time::timeout(STEP, receiver.recv())
        .await
        .expect("timed out waiting for an envelope")
        .unwrap_or(None)
}

/// Collect `Data` bytes until a terminal frame; returns the bytes and that frame
pub async fn collect_data<R: EnvelopeReceiver>(receiver: &mut R) -> (Vec<u8>, DataFrame) {
    let mut bytes = Vec::new();
    loop {
        match next_envelope(receiver).await {
            Some(Envelope::Data(frame)) => {
                bytes.extend_from_slice(&frame.bytes);
                if frame.is_terminal() {
                    return (bytes, frame);
                }
            }
            other => panic!("expected Data, got {:?}", other),
        }
    }
}

/// Wait until `check` holds, polling briefly
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + STEP;
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "timed out: {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
