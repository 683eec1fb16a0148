//! The per-tunnel relay worker
//!
//! The same worker runs on both sides of a tunnel. On the dialing side
//! [`run_tunnel`] connects to the destination first and reports the result with a
//! `DialResponse`; the side that accepted the client socket calls [`relay`]
//! directly once its `DialRequest` succeeded.
//!
//! Two pumps move bytes while the tunnel is open:
//!
//! - inbound: channel `Data` frames are written to the socket
//! - outbound: socket reads are sent to the peer as `Data` frames
//!
//! Either pump may abort the tunnel; the other stops at its next await point.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use burrow_proto::{Envelope, TunnelId};
use burrow_transport::{EnvelopeReceiver, EnvelopeSender, TransportError};
use socket2::{SockRef, TcpKeepalive};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::state::{StateCell, TunnelEvent, TunnelState};

/// Reasons a tunnel fails
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Failed to connect to {destination}: {source}")]
    DialFailed {
        destination: String,
        source: io::Error,
    },

    #[error("Timed out connecting to {0}")]
    DialTimeout(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Socket error: {0}")]
    Socket(#[source] io::Error),

    #[error("Peer error: {0}")]
    Peer(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Channel ended before the tunnel closed")]
    ChannelEnded,

    #[error("No traffic for {0:?}")]
    IdleTimeout(Duration),
}

/// How a tunnel ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelOutcome {
    /// Both directions closed gracefully
    Completed,
    /// The destination could not be reached
    DialFailed(String),
    /// Torn down after an error on either side
    Aborted(String),
}

/// Summary returned once a worker has fully torn down its tunnel
#[derive(Debug, Clone)]
pub struct TunnelReport {
    pub tunnel_id: TunnelId,
    /// Bytes received from the peer and written to the socket
    pub to_socket: u64,
    /// Bytes read from the socket and sent to the peer
    pub from_socket: u64,
    pub state: TunnelState,
    pub outcome: TunnelOutcome,
    pub duration: Duration,
}

impl TunnelReport {
    pub fn is_success(&self) -> bool {
        self.outcome == TunnelOutcome::Completed
    }
}

/// Dial `destination` and relay between it and the channel
///
/// Always sends exactly one `DialResponse`, then tears the channel down the same
/// way whatever the outcome: finish the sender and drain the receiver.
pub async fn run_tunnel<S, R>(
    tunnel_id: TunnelId,
    mut sender: S,
    mut receiver: R,
    destination: String,
    config: RelayConfig,
) -> TunnelReport
where
    S: EnvelopeSender,
    R: EnvelopeReceiver,
{
    let started = Instant::now();
    debug!(tunnel_id = %tunnel_id, destination = %destination, "Dialing destination");

    let dialed = dial(&destination, &config).await;
    let response = match &dialed {
        Ok(_) => Envelope::dial_ok(),
        Err(e) => Envelope::dial_failed(e.to_string()),
    };
    let sent = sender.send(response).await;

    match (dialed, sent) {
        (Err(e), _) => {
            warn!(tunnel_id = %tunnel_id, error = %e, "Dial failed");
            finish_and_drain(&tunnel_id, &mut sender, &mut receiver, config.drain_timeout).await;
            TunnelReport {
                tunnel_id,
                to_socket: 0,
                from_socket: 0,
                state: TunnelState::Dialing.on(TunnelEvent::DialFailed),
                outcome: TunnelOutcome::DialFailed(e.to_string()),
                duration: started.elapsed(),
            }
        }
        (Ok(_socket), Err(e)) => {
            let reason = RelayError::from(e);
            warn!(tunnel_id = %tunnel_id, error = %reason, "Failed to send dial response");
            finish_and_drain(&tunnel_id, &mut sender, &mut receiver, config.drain_timeout).await;
            TunnelReport {
                tunnel_id,
                to_socket: 0,
                from_socket: 0,
                state: TunnelState::Failed,
                outcome: TunnelOutcome::Aborted(reason.to_string()),
                duration: started.elapsed(),
            }
        }
        (Ok(socket), Ok(())) => relay(tunnel_id, sender, receiver, socket, &config).await,
    }
}

/// Connect to a destination, applying the configured keep-alive
pub async fn dial(destination: &str, config: &RelayConfig) -> Result<TcpStream, RelayError> {
    let socket = tokio::time::timeout(config.dial_timeout, TcpStream::connect(destination))
        .await
        .map_err(|_| RelayError::DialTimeout(destination.to_string()))?
        .map_err(|source| RelayError::DialFailed {
            destination: destination.to_string(),
            source,
        })?;

    if let Some(period) = config.keepalive {
        // Not fatal: the tunnel works without it
        if let Err(e) = set_keepalive(&socket, period) {
            warn!(destination = %destination, error = %e, "Failed to enable TCP keep-alive");
        }
    }

    Ok(socket)
}

fn set_keepalive(socket: &TcpStream, period: Duration) -> io::Result<()> {
    let keepalive = TcpKeepalive::new().with_time(period);
    SockRef::from(socket).set_tcp_keepalive(&keepalive)
}

/// Relay between an established socket and the channel until the tunnel ends
pub async fn relay<S, R>(
    tunnel_id: TunnelId,
    mut sender: S,
    mut receiver: R,
    socket: TcpStream,
    config: &RelayConfig,
) -> TunnelReport
where
    S: EnvelopeSender,
    R: EnvelopeReceiver,
{
    let started = Instant::now();
    info!(tunnel_id = %tunnel_id, "Tunnel open");

    let state = StateCell::new(tunnel_id.clone(), TunnelState::Open);
    let teardown = Teardown::default();
    let activity = Activity::new();
    let pump = Pump {
        tunnel_id: &tunnel_id,
        teardown: &teardown,
        state: &state,
        activity: &activity,
        notice_timeout: config.drain_timeout,
    };

    let (reader, writer) = socket.into_split();
    let pumps_done = CancellationToken::new();

    let pumps = async {
        let counts = tokio::join!(
            pump_inbound(&pump, &mut receiver, writer),
            pump_outbound(&pump, &mut sender, reader, config.chunk_size),
        );
        pumps_done.cancel();
        counts
    };
    let ((to_socket, from_socket), ()) =
        tokio::join!(pumps, watch_idle(&pump, config.idle_timeout, &pumps_done));

    let outcome = match teardown.reason() {
        Some(reason) => {
            state.apply(TunnelEvent::Error);
            TunnelOutcome::Aborted(reason)
        }
        None => TunnelOutcome::Completed,
    };

    finish_and_drain(&tunnel_id, &mut sender, &mut receiver, config.drain_timeout).await;

    let report = TunnelReport {
        tunnel_id,
        to_socket,
        from_socket,
        state: state.get(),
        outcome,
        duration: started.elapsed(),
    };

    match &report.outcome {
        TunnelOutcome::Aborted(reason) => warn!(
            tunnel_id = %report.tunnel_id,
            to_socket = report.to_socket,
            from_socket = report.from_socket,
            reason = %reason,
            "Tunnel aborted"
        ),
        _ => info!(
            tunnel_id = %report.tunnel_id,
            to_socket = report.to_socket,
            from_socket = report.from_socket,
            duration_ms = report.duration.as_millis() as u64,
            "Tunnel closed"
        ),
    }

    report
}

/// Finish our side of the channel, then discard whatever the peer still sends
async fn finish_and_drain<S, R>(tunnel_id: &TunnelId, sender: &mut S, receiver: &mut R, limit: Duration)
where
    S: EnvelopeSender + ?Sized,
    R: EnvelopeReceiver + ?Sized,
{
    if let Err(e) = sender.finish().await {
        debug!(tunnel_id = %tunnel_id, error = %e, "Finishing channel failed");
    }

    let drain = async {
        let mut discarded = 0usize;
        while let Ok(Some(_)) = receiver.recv().await {
            discarded += 1;
        }
        discarded
    };

    match tokio::time::timeout(limit, drain).await {
        Ok(0) => {}
        Ok(discarded) => debug!(tunnel_id = %tunnel_id, discarded, "Drained channel"),
        Err(_) => warn!(tunnel_id = %tunnel_id, "Peer did not finish its side of the channel in time"),
    }
}

struct Abort {
    reason: String,
    notify_peer: bool,
}

/// First-error-wins abort shared by both pumps
#[derive(Default)]
struct Teardown {
    token: CancellationToken,
    abort: Mutex<Option<Abort>>,
}

impl Teardown {
    /// Record `reason` unless another abort got there first, then stop both pumps
    ///
    /// `notify_peer` is set for local failures the peer cannot learn about from
    /// the channel itself.
    fn abort(&self, reason: RelayError, notify_peer: bool) {
        {
            let mut slot = self.abort.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_none() {
                *slot = Some(Abort {
                    reason: reason.to_string(),
                    notify_peer,
                });
            }
        }
        self.token.cancel();
    }

    async fn cancelled(&self) {
        self.token.cancelled().await
    }

    fn reason(&self) -> Option<String> {
        let slot = self.abort.lock().unwrap_or_else(|e| e.into_inner());
        slot.as_ref().map(|abort| abort.reason.clone())
    }

    fn peer_notice(&self) -> Option<String> {
        let slot = self.abort.lock().unwrap_or_else(|e| e.into_inner());
        slot.as_ref()
            .filter(|abort| abort.notify_peer)
            .map(|abort| abort.reason.clone())
    }
}

/// Time of the last byte moved in either direction
struct Activity {
    started: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = self.started.elapsed().as_millis() as u64;
        self.last_ms.store(now, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }
}

struct Pump<'a> {
    tunnel_id: &'a TunnelId,
    teardown: &'a Teardown,
    state: &'a StateCell,
    activity: &'a Activity,
    notice_timeout: Duration,
}

/// Channel to socket. Returns bytes written.
async fn pump_inbound<R>(pump: &Pump<'_>, receiver: &mut R, mut writer: OwnedWriteHalf) -> u64
where
    R: EnvelopeReceiver + ?Sized,
{
    let mut written = 0u64;

    loop {
        let next = tokio::select! {
            _ = pump.teardown.cancelled() => break,
            next = receiver.recv() => next,
        };

        let frame = match next {
            Ok(Some(Envelope::Data(frame))) => frame,
            Ok(Some(other)) => {
                pump.teardown.abort(
                    RelayError::Protocol(format!("unexpected {} on an open tunnel", other.kind())),
                    false,
                );
                break;
            }
            Ok(None) => {
                pump.teardown.abort(RelayError::ChannelEnded, false);
                break;
            }
            Err(e) => {
                pump.teardown.abort(e.into(), false);
                break;
            }
        };

        // Bytes first, then error, then closed
        if !frame.bytes.is_empty() {
            pump.activity.touch();
            let write = tokio::select! {
                _ = pump.teardown.cancelled() => break,
                write = writer.write_all(&frame.bytes) => write,
            };
            if let Err(e) = write {
                pump.teardown.abort(RelayError::Socket(e), true);
                break;
            }
            written += frame.bytes.len() as u64;
        }

        if let Some(error) = frame.error {
            pump.teardown.abort(RelayError::Peer(error), false);
            break;
        }

        if frame.closed {
            debug!(tunnel_id = %pump.tunnel_id, "Peer closed its side");
            if let Err(e) = writer.shutdown().await {
                debug!(tunnel_id = %pump.tunnel_id, error = %e, "Socket shutdown failed");
            }
            pump.state.apply(TunnelEvent::RemoteEof);
            break;
        }
    }

    written
}

/// Socket to channel. Returns bytes read.
async fn pump_outbound<S>(
    pump: &Pump<'_>,
    sender: &mut S,
    mut reader: OwnedReadHalf,
    chunk_size: usize,
) -> u64
where
    S: EnvelopeSender + ?Sized,
{
    let mut buffer = vec![0u8; chunk_size.max(1)];
    let mut read_total = 0u64;

    loop {
        let read = tokio::select! {
            _ = pump.teardown.cancelled() => {
                notify_peer(pump, sender).await;
                break;
            }
            read = reader.read(&mut buffer) => read,
        };

        let envelope = match read {
            Ok(0) => Envelope::closed(),
            Ok(n) => {
                pump.activity.touch();
                read_total += n as u64;
                Envelope::data(&buffer[..n])
            }
            Err(e) => {
                warn!(tunnel_id = %pump.tunnel_id, error = %e, "Socket read failed");
                let notice = Envelope::error(e.to_string());
                let _ = tokio::time::timeout(pump.notice_timeout, sender.send(notice)).await;
                pump.teardown.abort(RelayError::Socket(e), false);
                break;
            }
        };

        let at_eof = matches!(&envelope, Envelope::Data(frame) if frame.closed);
        let sent = tokio::select! {
            _ = pump.teardown.cancelled() => {
                notify_peer(pump, sender).await;
                break;
            }
            sent = sender.send(envelope) => sent,
        };

        if let Err(e) = sent {
            pump.teardown.abort(e.into(), false);
            break;
        }

        if at_eof {
            debug!(tunnel_id = %pump.tunnel_id, "Socket reached EOF");
            pump.state.apply(TunnelEvent::LocalEof);
            break;
        }
    }

    read_total
}

async fn notify_peer<S>(pump: &Pump<'_>, sender: &mut S)
where
    S: EnvelopeSender + ?Sized,
{
    if let Some(reason) = pump.teardown.peer_notice() {
        let _ = tokio::time::timeout(pump.notice_timeout, sender.send(Envelope::error(reason))).await;
    }
}

async fn watch_idle(pump: &Pump<'_>, idle_timeout: Option<Duration>, done: &CancellationToken) {
    let Some(limit) = idle_timeout else {
        return;
    };

    loop {
        let remaining = limit.saturating_sub(pump.activity.idle_for());
        if remaining.is_zero() {
            warn!(tunnel_id = %pump.tunnel_id, idle = ?limit, "Tunnel idle, aborting");
            pump.teardown.abort(RelayError::IdleTimeout(limit), true);
            return;
        }

        tokio::select! {
            _ = done.cancelled() => return,
            _ = pump.teardown.cancelled() => return,
            _ = tokio::time::sleep(remaining) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use burrow_transport::TransportResult;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    struct ChanSender(Option<mpsc::Sender<Envelope>>);

    #[async_trait]
    impl EnvelopeSender for ChanSender {
        async fn send(&mut self, envelope: Envelope) -> TransportResult<()> {
            let tx = self.0.as_ref().ok_or(TransportError::StreamClosed)?;
            tx.send(envelope).await.map_err(|_| TransportError::ChannelClosed)
        }

        async fn finish(&mut self) -> TransportResult<()> {
            self.0 = None;
            Ok(())
        }
    }

    struct ChanReceiver(mpsc::Receiver<Envelope>);

    #[async_trait]
    impl EnvelopeReceiver for ChanReceiver {
        async fn recv(&mut self) -> TransportResult<Option<Envelope>> {
            Ok(self.0.recv().await)
        }
    }

    /// Worker-side halves plus the peer's view of them
    fn channel() -> (
        ChanSender,
        ChanReceiver,
        mpsc::Sender<Envelope>,
        mpsc::Receiver<Envelope>,
    ) {
        let (to_peer, from_worker) = mpsc::channel(16);
        let (to_worker, from_peer) = mpsc::channel(16);
        (
            ChanSender(Some(to_peer)),
            ChanReceiver(from_peer),
            to_worker,
            from_worker,
        )
    }

    fn test_config() -> RelayConfig {
        RelayConfig {
            drain_timeout: Duration::from_millis(500),
            ..RelayConfig::default()
        }
    }

    async fn echo_server() -> String {
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

    async fn refused_addr() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        addr
    }

    #[tokio::test]
    async fn test_dial_failure_reports_and_finishes() {
        let (sender, receiver, to_worker, mut from_worker) = channel();
        let destination = refused_addr().await;
        let id = TunnelId::new("agent", &destination, 1);

        drop(to_worker);
        let report = run_tunnel(id, sender, receiver, destination, test_config()).await;

        match from_worker.recv().await {
            Some(Envelope::DialResponse { error: Some(error) }) => {
                assert!(error.to_lowercase().contains("refused"), "{}", error)
            }
            other => panic!("expected failed dial response, got {:?}", other),
        }
        assert_eq!(from_worker.recv().await, None);
        assert!(matches!(report.outcome, TunnelOutcome::DialFailed(_)));
        assert_eq!(report.state, TunnelState::Failed);
    }

    #[tokio::test]
    async fn test_echo_round_trip_completes() {
        let (sender, receiver, to_worker, mut from_worker) = channel();
        let destination = echo_server().await;
        let id = TunnelId::new("agent", &destination, 1);

        let worker = tokio::spawn(run_tunnel(id, sender, receiver, destination, test_config()));

        assert_eq!(from_worker.recv().await, Some(Envelope::dial_ok()));
        to_worker.send(Envelope::data(b"hello".to_vec())).await.unwrap();
        to_worker.send(Envelope::closed()).await.unwrap();

        let mut echoed = Vec::new();
        loop {
            match from_worker.recv().await {
                Some(Envelope::Data(frame)) => {
                    echoed.extend_from_slice(&frame.bytes);
                    if frame.closed {
                        assert!(frame.error.is_none());
                        break;
                    }
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        drop(to_worker);

        let report = worker.await.unwrap();
        assert_eq!(echoed, b"hello");
        assert_eq!(report.outcome, TunnelOutcome::Completed);
        assert_eq!(report.state, TunnelState::Closed);
        assert_eq!(report.to_socket, 5);
        assert_eq!(report.from_socket, 5);
    }

    #[tokio::test]
    async fn test_peer_error_aborts_tunnel() {
        let (sender, receiver, to_worker, mut from_worker) = channel();
        let destination = echo_server().await;
        let id = TunnelId::new("agent", &destination, 1);

        let worker = tokio::spawn(run_tunnel(id, sender, receiver, destination, test_config()));
        assert_eq!(from_worker.recv().await, Some(Envelope::dial_ok()));

        to_worker.send(Envelope::error("client went away")).await.unwrap();
        drop(to_worker);

        let report = worker.await.unwrap();
        assert_eq!(report.state, TunnelState::Failed);
        match report.outcome {
            TunnelOutcome::Aborted(reason) => assert!(reason.contains("client went away")),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unexpected_envelope_aborts_tunnel() {
        let (sender, receiver, to_worker, mut from_worker) = channel();
        let destination = echo_server().await;
        let id = TunnelId::new("agent", &destination, 1);

        let worker = tokio::spawn(run_tunnel(id, sender, receiver, destination, test_config()));
        assert_eq!(from_worker.recv().await, Some(Envelope::dial_ok()));

        to_worker.send(Envelope::dial_request("elsewhere:1")).await.unwrap();
        drop(to_worker);

        let report = worker.await.unwrap();
        assert!(matches!(report.outcome, TunnelOutcome::Aborted(ref r) if r.contains("DialRequest")));
    }

    #[tokio::test]
    async fn test_channel_end_without_close_aborts() {
        let (sender, receiver, to_worker, mut from_worker) = channel();
        let destination = echo_server().await;
        let id = TunnelId::new("agent", &destination, 1);

        let worker = tokio::spawn(run_tunnel(id, sender, receiver, destination, test_config()));
        assert_eq!(from_worker.recv().await, Some(Envelope::dial_ok()));
        drop(to_worker);

        let report = worker.await.unwrap();
        assert_eq!(report.state, TunnelState::Failed);
    }

    #[tokio::test]
    async fn test_idle_timeout_notifies_peer() {
        let (sender, receiver, to_worker, mut from_worker) = channel();
        let destination = echo_server().await;
        let id = TunnelId::new("agent", &destination, 1);
        let config = RelayConfig {
            idle_timeout: Some(Duration::from_millis(100)),
            ..test_config()
        };

        let worker = tokio::spawn(run_tunnel(id, sender, receiver, destination, config));
        assert_eq!(from_worker.recv().await, Some(Envelope::dial_ok()));

        match from_worker.recv().await {
            Some(Envelope::Data(frame)) => assert!(frame.error.is_some()),
            other => panic!("expected error frame, got {:?}", other),
        }
        drop(to_worker);

        let report = worker.await.unwrap();
        assert!(matches!(report.outcome, TunnelOutcome::Aborted(_)));
    }

    #[tokio::test]
    async fn test_half_close_keeps_reverse_direction() {
        // Destination that waits for EOF, then answers
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let destination = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            socket.read_to_end(&mut request).await.unwrap();
            socket.write_all(&request).await.unwrap();
            socket.write_all(b"!").await.unwrap();
        });

        let (sender, receiver, to_worker, mut from_worker) = channel();
        let id = TunnelId::new("agent", &destination, 1);
        let worker = tokio::spawn(run_tunnel(id, sender, receiver, destination, test_config()));
        assert_eq!(from_worker.recv().await, Some(Envelope::dial_ok()));

        to_worker.send(Envelope::data(b"query".to_vec())).await.unwrap();
        to_worker.send(Envelope::closed()).await.unwrap();

        let mut response = Vec::new();
        while let Some(Envelope::Data(frame)) = from_worker.recv().await {
            response.extend_from_slice(&frame.bytes);
            if frame.closed {
                break;
            }
        }
        drop(to_worker);

        assert_eq!(response, b"query!");
        assert!(worker.await.unwrap().is_success());
    }

    #[tokio::test]
    async fn test_silent_peer_cannot_hold_tunnel_past_drain_timeout() {
        let (sender, receiver, to_worker, mut from_worker) = channel();
        let destination = echo_server().await;
        let id = TunnelId::new("agent", &destination, 1);
        let config = RelayConfig {
            drain_timeout: Duration::from_millis(200),
            ..test_config()
        };

        let worker = tokio::spawn(run_tunnel(id, sender, receiver, destination, config));
        assert_eq!(from_worker.recv().await, Some(Envelope::dial_ok()));

        // Close cleanly but never finish the channel: `to_worker` stays alive
        to_worker.send(Envelope::closed()).await.unwrap();
        while let Some(Envelope::Data(frame)) = from_worker.recv().await {
            if frame.closed {
                break;
            }
        }
        let closed_at = Instant::now();

        let report = tokio::time::timeout(Duration::from_secs(2), worker)
            .await
            .expect("drain must give up on a peer that never finishes")
            .unwrap();
        assert!(closed_at.elapsed() >= Duration::from_millis(150));
        assert_eq!(report.outcome, TunnelOutcome::Completed);
        assert_eq!(from_worker.recv().await, None);
        drop(to_worker);
    }
}
