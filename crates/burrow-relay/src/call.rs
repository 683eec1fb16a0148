//! Call-mode sessions: many tunnels multiplexed over one connection
//!
//! Tunnel traffic travels as `WriteToTunnel` calls. A tunnel sender waits for the
//! reply to one write before issuing the next, which keeps each tunnel's data in
//! order and leaves one chunk in flight per direction. Inbound writes are routed
//! to the tunnel's worker through the [`TunnelRegistry`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use burrow_proto::{Call, CallFrame, Envelope, Reply, TunnelId};
use burrow_transport::{
    BoxedIo, EnvelopeReceiver, EnvelopeSender, FramedReceiver, FramedSender, FramedStream,
    TransportError, TransportResult,
};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::RelayConfig;
use crate::registry::{RegistryError, TunnelInfo, TunnelRegistry};
use crate::relay::run_tunnel;

/// Frames queued for the connection writer
const OUTGOING_QUEUE: usize = 64;

/// Requests queued for the dispatcher
const INCOMING_QUEUE: usize = 64;

/// Inbound envelopes buffered per tunnel before writers have to wait
const ROUTE_CAPACITY: usize = 1;

/// A request received from the peer
#[derive(Debug)]
pub struct IncomingCall {
    pub call_id: u64,
    pub call: Call,
}

struct PendingCall {
    reply: oneshot::Sender<Reply>,
    /// Route to bind when a `CreateTunnel` we issued succeeds
    route: Option<mpsc::Sender<Envelope>>,
}

/// One call-mode connection and the tunnels routed over it
pub struct CallSession {
    peer: String,
    outgoing: mpsc::Sender<CallFrame>,
    pending: Mutex<HashMap<u64, PendingCall>>,
    next_call_id: AtomicU64,
    registry: TunnelRegistry,
    routes: Mutex<HashSet<TunnelId>>,
    closed: CancellationToken,
    shut_down: AtomicBool,
}

impl CallSession {
    /// Start the reader and writer tasks for `io`
    ///
    /// Requests from the peer come out of the returned receiver; hand it to
    /// [`serve_calls`]. The receiver ends when the session does.
    pub fn start(
        io: BoxedIo,
        peer: impl Into<String>,
        registry: TunnelRegistry,
    ) -> (Arc<Self>, mpsc::Receiver<IncomingCall>) {
        let peer = peer.into();
        let (writer, reader) =
            FramedStream::<CallFrame>::new(io, format!("call:{}", peer)).into_parts();
        let (outgoing, outgoing_rx) = mpsc::channel(OUTGOING_QUEUE);
        let (incoming_tx, incoming) = mpsc::channel(INCOMING_QUEUE);

        let session = Arc::new(Self {
            peer,
            outgoing,
            pending: Mutex::new(HashMap::new()),
            next_call_id: AtomicU64::new(1),
            registry,
            routes: Mutex::new(HashSet::new()),
            closed: CancellationToken::new(),
            shut_down: AtomicBool::new(false),
        });

        info!(peer = %session.peer, "Call session established");

        tokio::spawn(write_frames(writer, outgoing_rx, session.closed.clone()));
        tokio::spawn(read_frames(session.clone(), reader, incoming_tx));

        (session, incoming)
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn registry(&self) -> &TunnelRegistry {
        &self.registry
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Wait until the session has ended
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Number of tunnels currently routed over this session
    pub fn tunnel_count(&self) -> usize {
        self.lock_routes().len()
    }

    /// Issue a call and wait for its reply
    pub async fn call(&self, call: Call) -> TransportResult<Reply> {
        self.request(call, None).await
    }

    /// Queue the reply to a call received from the peer
    pub async fn respond(&self, call_id: u64, reply: Reply) -> TransportResult<()> {
        self.outgoing
            .send(CallFrame::Response { call_id, reply })
            .await
            .map_err(|_| TransportError::ChannelClosed)
    }

    /// Ask the peer to dial `destination` and open a tunnel to it
    ///
    /// The inbound route is registered before this returns, so no data the peer
    /// writes right after its reply can be missed.
    pub async fn open_tunnel(self: &Arc<Self>, destination: &str) -> TransportResult<CallTunnel> {
        let (route, inbound) = mpsc::channel(ROUTE_CAPACITY);
        let call = Call::CreateTunnel {
            destination: destination.to_string(),
        };

        match self.request(call, Some(route)).await? {
            Reply::CreateTunnel {
                tunnel_id: Some(tunnel_id),
                error: None,
            } => Ok(CallTunnel {
                tunnel_id: tunnel_id.clone(),
                sender: CallTunnelSender::established(tunnel_id, self.clone()),
                receiver: CallTunnelReceiver { inbound },
            }),
            Reply::CreateTunnel {
                error: Some(error), ..
            } => Err(TransportError::Remote(error)),
            other => Err(TransportError::ProtocolError(format!(
                "unexpected reply to CreateTunnel: {:?}",
                other
            ))),
        }
    }

    /// Close the session and drop every tunnel routed over it
    pub async fn close(&self) {
        self.shutdown().await;
    }

    async fn request(
        &self,
        call: Call,
        route: Option<mpsc::Sender<Envelope>>,
    ) -> TransportResult<Reply> {
        if self.is_closed() {
            return Err(TransportError::ChannelClosed);
        }

        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.lock_pending().insert(
            call_id,
            PendingCall {
                reply: reply_tx,
                route,
            },
        );
        let _guard = PendingGuard {
            session: self,
            call_id,
        };

        trace!(peer = %self.peer, call_id, call = call.name(), "Issuing call");
        self.outgoing
            .send(CallFrame::Request { call_id, call })
            .await
            .map_err(|_| TransportError::ChannelClosed)?;

        tokio::select! {
            reply = reply_rx => reply.map_err(|_| TransportError::ChannelClosed),
            _ = self.closed.cancelled() => Err(TransportError::ChannelClosed),
        }
    }

    /// Match a reply to its pending call
    async fn complete(&self, call_id: u64, reply: Reply) {
        let pending = self.lock_pending().remove(&call_id);
        let Some(pending) = pending else {
            debug!(peer = %self.peer, call_id, "Reply for unknown call");
            return;
        };

        let mut bound = None;
        if let (
            Some(route),
            Reply::CreateTunnel {
                tunnel_id: Some(tunnel_id),
                error: None,
            },
        ) = (pending.route, &reply)
        {
            match self.bind_route(tunnel_id.clone(), route).await {
                Ok(()) => bound = Some(tunnel_id.clone()),
                Err(e) => warn!(peer = %self.peer, error = %e, "Failed to route new tunnel"),
            }
        }

        if pending.reply.send(reply).is_err() {
            // The caller gave up; release the tunnel the peer just opened
            if let Some(tunnel_id) = bound {
                self.unbind_route(&tunnel_id).await;
                let close = CallFrame::Request {
                    call_id: self.next_call_id.fetch_add(1, Ordering::Relaxed),
                    call: Call::CloseTunnel { tunnel_id },
                };
                let _ = self.outgoing.try_send(close);
            }
        }
    }

    /// Route inbound writes for `tunnel_id` to `route`
    pub async fn bind_route(
        &self,
        tunnel_id: TunnelId,
        route: mpsc::Sender<Envelope>,
    ) -> Result<(), RegistryError> {
        self.registry
            .insert(TunnelInfo::new(tunnel_id.clone()), Some(route))
            .await?;
        self.lock_routes().insert(tunnel_id.clone());

        if self.is_closed() {
            self.unbind_route(&tunnel_id).await;
        }
        Ok(())
    }

    /// Stop routing `tunnel_id`; the worker's inbound queue ends
    ///
    /// Returns false if the tunnel was not routed by this session.
    pub async fn unbind_route(&self, tunnel_id: &TunnelId) -> bool {
        let owned = self.lock_routes().remove(tunnel_id);
        if owned {
            self.registry.remove(tunnel_id).await;
        }
        owned
    }

    fn owns(&self, tunnel_id: &TunnelId) -> bool {
        self.lock_routes().contains(tunnel_id)
    }

    async fn shutdown(&self) {
        self.closed.cancel();
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        // Dropping the reply senders fails every waiting caller
        let failed = {
            let mut pending = self.lock_pending();
            let count = pending.len();
            pending.clear();
            count
        };
        let routes: Vec<TunnelId> = self.lock_routes().drain().collect();
        let removed = self.registry.remove_all(&routes).await;

        info!(
            peer = %self.peer,
            failed_calls = failed,
            dropped_tunnels = removed,
            "Call session closed"
        );
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<u64, PendingCall>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_routes(&self) -> MutexGuard<'_, HashSet<TunnelId>> {
        self.routes.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Removes a pending call if its caller stops waiting
struct PendingGuard<'a> {
    session: &'a CallSession,
    call_id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.session.lock_pending().remove(&self.call_id);
    }
}

async fn write_frames(
    mut writer: FramedSender<CallFrame>,
    mut queue: mpsc::Receiver<CallFrame>,
    closed: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = closed.cancelled() => break,
            frame = queue.recv() => frame,
        };
        let Some(frame) = frame else { break };

        if let Err(e) = writer.send_frame(frame).await {
            warn!(error = %e, "Call session write failed");
            break;
        }
    }

    let _ = writer.close().await;
    closed.cancel();
}

async fn read_frames(
    session: Arc<CallSession>,
    mut reader: FramedReceiver<CallFrame>,
    incoming: mpsc::Sender<IncomingCall>,
) {
    loop {
        let frame = tokio::select! {
            _ = session.closed.cancelled() => break,
            frame = reader.recv_frame() => frame,
        };

        match frame {
            Ok(Some(CallFrame::Request { call_id, call })) => {
                if incoming.send(IncomingCall { call_id, call }).await.is_err() {
                    break;
                }
            }
            // Handled inline so a new tunnel's route exists before later frames
            Ok(Some(CallFrame::Response { call_id, reply })) => {
                session.complete(call_id, reply).await;
            }
            Ok(None) => {
                debug!(peer = %session.peer, "Peer closed the call session");
                break;
            }
            Err(e) => {
                warn!(peer = %session.peer, error = %e, "Call session read failed");
                break;
            }
        }
    }

    session.shutdown().await;
}

/// Handle requests from the peer until the session ends
///
/// With `dialer` set this side accepts `CreateTunnel` and runs a relay worker per
/// tunnel; without it, `CreateTunnel` is refused.
pub async fn serve_calls(
    session: Arc<CallSession>,
    mut incoming: mpsc::Receiver<IncomingCall>,
    dialer: Option<RelayConfig>,
) {
    while let Some(IncomingCall { call_id, call }) = incoming.recv().await {
        match call {
            Call::CreateTunnel { destination } => {
                let session = session.clone();
                match dialer.clone() {
                    Some(config) => {
                        tokio::spawn(create_tunnel(session, call_id, destination, config));
                    }
                    None => {
                        tokio::spawn(async move {
                            let reply = Reply::CreateTunnel {
                                tunnel_id: None,
                                error: Some(format!(
                                    "{} does not dial destinations",
                                    session.registry.origin()
                                )),
                            };
                            let _ = session.respond(call_id, reply).await;
                        });
                    }
                }
            }
            Call::WriteToTunnel { tunnel_id, data } => {
                let session = session.clone();
                // Waits on the tunnel's own queue; other tunnels keep flowing
                tokio::spawn(async move {
                    let delivered = if session.owns(&tunnel_id) {
                        session
                            .registry
                            .deliver(&tunnel_id, Envelope::Data(data))
                            .await
                    } else {
                        Err(RegistryError::NoSuchTunnel(tunnel_id))
                    };
                    let reply = Reply::WriteToTunnel {
                        error: delivered.err().map(|e| e.to_string()),
                    };
                    let _ = session.respond(call_id, reply).await;
                });
            }
            Call::CloseTunnel { tunnel_id } => {
                let error = if session.unbind_route(&tunnel_id).await {
                    None
                } else {
                    Some(RegistryError::NoSuchTunnel(tunnel_id).to_string())
                };
                let _ = session.respond(call_id, Reply::CloseTunnel { error }).await;
            }
        }
    }

    debug!(peer = %session.peer, "Call dispatcher stopped");
}

/// Dial result handed from a worker to the `CreateTunnel` handler
struct DialOutcome {
    error: Option<String>,
    /// Released once the reply is queued, before the worker writes any data
    ack: oneshot::Sender<()>,
}

async fn create_tunnel(
    session: Arc<CallSession>,
    call_id: u64,
    destination: String,
    config: RelayConfig,
) {
    let tunnel_id = session.registry.allocate_id(&destination);
    let (route, inbound) = mpsc::channel(ROUTE_CAPACITY);
    let (dial_tx, dial_rx) = oneshot::channel();

    let sender = CallTunnelSender {
        tunnel_id: tunnel_id.clone(),
        session: session.clone(),
        dial: Some(dial_tx),
        established: false,
        finished: false,
    };
    let receiver = CallTunnelReceiver { inbound };
    let worker = tokio::spawn(run_tunnel(
        tunnel_id.clone(),
        sender,
        receiver,
        destination,
        config,
    ));

    match dial_rx.await {
        Ok(DialOutcome { error: None, ack }) => {
            let reply = match session.bind_route(tunnel_id.clone(), route).await {
                Ok(()) => Reply::CreateTunnel {
                    tunnel_id: Some(tunnel_id.clone()),
                    error: None,
                },
                Err(e) => Reply::CreateTunnel {
                    tunnel_id: None,
                    error: Some(e.to_string()),
                },
            };
            let _ = session.respond(call_id, reply).await;
            let _ = ack.send(());
        }
        Ok(DialOutcome {
            error: Some(error),
            ack,
        }) => {
            drop(route);
            let reply = Reply::CreateTunnel {
                tunnel_id: None,
                error: Some(error),
            };
            let _ = session.respond(call_id, reply).await;
            let _ = ack.send(());
        }
        Err(_) => {
            drop(route);
            let reply = Reply::CreateTunnel {
                tunnel_id: None,
                error: Some("tunnel worker stopped before dialing".to_string()),
            };
            let _ = session.respond(call_id, reply).await;
        }
    }

    match worker.await {
        Ok(report) => debug!(tunnel_id = %report.tunnel_id, outcome = ?report.outcome, "Tunnel worker finished"),
        Err(e) => warn!(tunnel_id = %tunnel_id, error = %e, "Tunnel worker panicked"),
    }
}

/// A tunnel opened over a call session
pub struct CallTunnel {
    pub tunnel_id: TunnelId,
    pub sender: CallTunnelSender,
    pub receiver: CallTunnelReceiver,
}

/// Sends a tunnel's envelopes as calls
pub struct CallTunnelSender {
    tunnel_id: TunnelId,
    session: Arc<CallSession>,
    /// Present on the dialing side until the `DialResponse` is sent
    dial: Option<oneshot::Sender<DialOutcome>>,
    established: bool,
    finished: bool,
}

impl CallTunnelSender {
    fn established(tunnel_id: TunnelId, session: Arc<CallSession>) -> Self {
        Self {
            tunnel_id,
            session,
            dial: None,
            established: true,
            finished: false,
        }
    }
}

#[async_trait]
impl EnvelopeSender for CallTunnelSender {
    async fn send(&mut self, envelope: Envelope) -> TransportResult<()> {
        if self.finished {
            return Err(TransportError::StreamClosed);
        }

        match envelope {
            Envelope::Data(data) => {
                let call = Call::WriteToTunnel {
                    tunnel_id: self.tunnel_id.clone(),
                    data,
                };
                match self.session.call(call).await?.error() {
                    Some(error) => Err(TransportError::Remote(error.to_string())),
                    None => Ok(()),
                }
            }
            Envelope::DialResponse { error } => {
                let dial = self.dial.take().ok_or_else(|| {
                    TransportError::ProtocolError("dial response without a pending dial".into())
                })?;
                self.established = error.is_none();

                let (ack, acked) = oneshot::channel();
                dial.send(DialOutcome { error, ack })
                    .map_err(|_| TransportError::ChannelClosed)?;
                acked.await.map_err(|_| TransportError::ChannelClosed)
            }
            Envelope::DialRequest { .. } => Err(TransportError::ProtocolError(
                "dial requests travel as CreateTunnel calls".into(),
            )),
        }
    }

    async fn finish(&mut self) -> TransportResult<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.dial = None;

        if !self.established {
            return Ok(());
        }

        // If the peer closed first it has already dropped its route
        if self.session.unbind_route(&self.tunnel_id).await && !self.session.is_closed() {
            let reply = self
                .session
                .call(Call::CloseTunnel {
                    tunnel_id: self.tunnel_id.clone(),
                })
                .await?;
            if let Some(error) = reply.error() {
                debug!(tunnel_id = %self.tunnel_id, error = %error, "Peer refused CloseTunnel");
            }
        }
        Ok(())
    }
}

/// Receives the envelopes routed to one tunnel
pub struct CallTunnelReceiver {
    inbound: mpsc::Receiver<Envelope>,
}

#[async_trait]
impl EnvelopeReceiver for CallTunnelReceiver {
    async fn recv(&mut self) -> TransportResult<Option<Envelope>> {
        Ok(self.inbound.recv().await)
    }
}
