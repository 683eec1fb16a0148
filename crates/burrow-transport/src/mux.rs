//! Logical tunnel streams multiplexed over one stream-mode connection
//!
//! A [`Multiplexer`] owns one connection and runs a reader and a writer task for
//! it. Each logical stream gets its own inbound queue sized to the credit window,
//! so the reader never waits on a slow consumer and one stalled tunnel cannot
//! hold up the others. When the connection ends, every stream on it ends with it.

use async_trait::async_trait;
use burrow_proto::{Envelope, StreamFrame, StreamId, STREAM_WINDOW};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::framed::{FramedReceiver, FramedSender, FramedStream};
use crate::{
    BoxedIo, EnvelopeReceiver, EnvelopeSender, TransportError, TransportResult, TunnelStream,
};

/// Frames queued for the connection writer
const OUTGOING_QUEUE: usize = 256;

/// Streams opened by the peer and not yet accepted
const ACCEPT_QUEUE: usize = 64;

/// Which end of the connection this is; the two ends number streams apart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxRole {
    /// Opened the connection; allocates odd stream ids
    Initiator,
    /// Accepted the connection; allocates even stream ids
    Acceptor,
}

struct StreamSlot {
    inbound: Option<mpsc::Sender<Envelope>>,
    credit: Arc<Semaphore>,
    reset: CancellationToken,
    local_done: bool,
}

impl StreamSlot {
    /// Fail both halves; must run before `inbound` is dropped
    fn abort(&self) {
        self.reset.cancel();
        self.credit.close();
    }
}

/// One stream-mode connection and the logical streams routed over it
pub struct Multiplexer {
    label: String,
    outgoing: mpsc::Sender<StreamFrame>,
    streams: Mutex<HashMap<StreamId, StreamSlot>>,
    next_id: AtomicU32,
    closed: CancellationToken,
}

impl Multiplexer {
    /// Start the reader and writer tasks for `io`
    ///
    /// Streams the peer opens come out of the returned [`MuxIncoming`]; drop it
    /// to refuse them.
    pub fn start(io: BoxedIo, label: impl Into<String>, role: MuxRole) -> (Arc<Self>, MuxIncoming) {
        let label = label.into();
        let (writer, reader) =
            FramedStream::<StreamFrame>::new(io, format!("mux:{}", label)).into_parts();
        let (outgoing, outgoing_rx) = mpsc::channel(OUTGOING_QUEUE);
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_QUEUE);

        let mux = Arc::new(Self {
            label,
            outgoing,
            streams: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(match role {
                MuxRole::Initiator => 1,
                MuxRole::Acceptor => 2,
            }),
            closed: CancellationToken::new(),
        });

        info!(session = %mux.label, ?role, "Stream session established");

        tokio::spawn(write_frames(writer, outgoing_rx, mux.closed.clone()));
        tokio::spawn(read_frames(mux.clone(), reader, accept_tx));

        (mux, MuxIncoming { rx: accept_rx })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Wait until the connection has ended
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Logical streams currently open on this connection
    pub fn stream_count(&self) -> usize {
        self.lock_streams().len()
    }

    /// Open a new logical stream towards the peer
    pub async fn open(self: &Arc<Self>) -> TransportResult<MuxStream> {
        if self.is_closed() {
            return Err(TransportError::ChannelClosed);
        }

        let stream_id = self.next_id.fetch_add(2, Ordering::Relaxed);
        let stream = self.register(stream_id).ok_or_else(|| {
            TransportError::ProtocolError(format!("stream id {} already in use", stream_id))
        })?;

        self.outgoing
            .send(StreamFrame::Open { stream_id })
            .await
            .map_err(|_| TransportError::ChannelClosed)?;

        trace!(session = %self.label, stream_id, "Stream opened");
        Ok(stream)
    }

    /// Close the connection; every stream on it fails
    pub fn close(&self) {
        self.closed.cancel();
    }

    fn register(self: &Arc<Self>, stream_id: StreamId) -> Option<MuxStream> {
        let mut streams = self.lock_streams();
        if streams.contains_key(&stream_id) {
            return None;
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(STREAM_WINDOW as usize);
        let credit = Arc::new(Semaphore::new(STREAM_WINDOW as usize));
        let reset = CancellationToken::new();
        streams.insert(
            stream_id,
            StreamSlot {
                inbound: Some(inbound_tx),
                credit: credit.clone(),
                reset: reset.clone(),
                local_done: false,
            },
        );

        Some(MuxStream {
            sender: MuxSender {
                stream_id,
                mux: self.clone(),
                credit,
                reset: reset.clone(),
                finished: false,
            },
            receiver: MuxReceiver {
                stream_id,
                mux: self.clone(),
                inbound: inbound_rx,
                reset,
                consumed: 0,
            },
        })
    }

    fn on_frame(self: &Arc<Self>, frame: StreamFrame, accept: &mpsc::Sender<MuxStream>) {
        match frame {
            StreamFrame::Open { stream_id } => match self.register(stream_id) {
                Some(stream) => match accept.try_send(stream) {
                    Ok(()) => trace!(session = %self.label, stream_id, "Peer opened stream"),
                    Err(e) => {
                        // Forget the stream before its halves are dropped
                        self.abandon(stream_id, "streams are not being accepted");
                        drop(e);
                    }
                },
                None => self.send_reset(stream_id, "stream id already in use"),
            },
            StreamFrame::Envelope {
                stream_id,
                envelope,
            } => self.deliver(stream_id, envelope),
            StreamFrame::Credit {
                stream_id,
                envelopes,
            } => {
                if let Some(slot) = self.lock_streams().get(&stream_id) {
                    slot.credit.add_permits(envelopes as usize);
                }
            }
            StreamFrame::Finish { stream_id } => {
                let mut streams = self.lock_streams();
                let done = match streams.get_mut(&stream_id) {
                    Some(slot) => {
                        slot.inbound = None;
                        slot.local_done
                    }
                    None => false,
                };
                if done {
                    streams.remove(&stream_id);
                }
            }
            StreamFrame::Reset { stream_id, reason } => {
                let removed = self.lock_streams().remove(&stream_id);
                if let Some(slot) = removed {
                    debug!(session = %self.label, stream_id, reason = %reason, "Peer reset stream");
                    slot.abort();
                }
            }
        }
    }

    fn deliver(&self, stream_id: StreamId, envelope: Envelope) {
        let refused = {
            let streams = self.lock_streams();
            let Some(slot) = streams.get(&stream_id) else {
                trace!(session = %self.label, stream_id, "Envelope for unknown stream");
                return;
            };
            match &slot.inbound {
                Some(inbound) => match inbound.try_send(envelope) {
                    Ok(()) => None,
                    Err(TrySendError::Full(_)) => Some("credit window exceeded"),
                    Err(TrySendError::Closed(_)) => Some("stream no longer read"),
                },
                None => Some("envelope after finish"),
            }
        };

        if let Some(reason) = refused {
            warn!(session = %self.label, stream_id, reason, "Resetting stream");
            self.abandon(stream_id, reason);
        }
    }

    /// Drop a stream locally and tell the peer
    fn abandon(&self, stream_id: StreamId, reason: &str) {
        let removed = self.lock_streams().remove(&stream_id);
        if let Some(slot) = removed {
            slot.abort();
        }
        self.send_reset(stream_id, reason);
    }

    fn send_reset(&self, stream_id: StreamId, reason: &str) {
        let _ = self.outgoing.try_send(StreamFrame::Reset {
            stream_id,
            reason: reason.to_string(),
        });
    }

    /// Mark our sending side done; false if the stream is already gone
    fn finish_local(&self, stream_id: StreamId) -> bool {
        let mut streams = self.lock_streams();
        let Some(slot) = streams.get_mut(&stream_id) else {
            return false;
        };
        slot.local_done = true;
        if slot.inbound.is_none() {
            streams.remove(&stream_id);
        }
        true
    }

    /// Our receiving side went away before the peer finished
    fn receiver_dropped(&self, stream_id: StreamId) {
        let peer_still_sending = self
            .lock_streams()
            .get(&stream_id)
            .map_or(false, |slot| slot.inbound.is_some());
        if peer_still_sending {
            self.abandon(stream_id, "stream no longer read");
        }
    }

    fn teardown(&self) {
        self.closed.cancel();
        let dropped: Vec<StreamSlot> = self.lock_streams().drain().map(|(_, slot)| slot).collect();
        for slot in &dropped {
            slot.abort();
        }
        info!(session = %self.label, dropped_streams = dropped.len(), "Stream session closed");
    }

    fn lock_streams(&self) -> MutexGuard<'_, HashMap<StreamId, StreamSlot>> {
        self.streams.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multiplexer")
            .field("label", &self.label)
            .field("streams", &self.stream_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn write_frames(
    mut writer: FramedSender<StreamFrame>,
    mut queue: mpsc::Receiver<StreamFrame>,
    closed: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = closed.cancelled() => break,
            frame = queue.recv() => frame,
        };
        let Some(frame) = frame else { break };

        if let Err(e) = writer.send_frame(frame).await {
            warn!(error = %e, "Stream session write failed");
            break;
        }
    }

    let _ = writer.close().await;
    closed.cancel();
}

async fn read_frames(
    mux: Arc<Multiplexer>,
    mut reader: FramedReceiver<StreamFrame>,
    accept: mpsc::Sender<MuxStream>,
) {
    loop {
        let frame = tokio::select! {
            _ = mux.closed.cancelled() => break,
            frame = reader.recv_frame() => frame,
        };

        match frame {
            Ok(Some(frame)) => mux.on_frame(frame, &accept),
            Ok(None) => {
                debug!(session = %mux.label, "Peer closed the stream session");
                break;
            }
            Err(e) => {
                warn!(session = %mux.label, error = %e, "Stream session read failed");
                break;
            }
        }
    }

    mux.teardown();
}

/// Streams opened by the peer
pub struct MuxIncoming {
    rx: mpsc::Receiver<MuxStream>,
}

impl MuxIncoming {
    /// Next stream the peer opened; `None` once the connection is gone
    pub async fn accept(&mut self) -> Option<MuxStream> {
        self.rx.recv().await
    }
}

/// One logical stream of a [`Multiplexer`]
pub struct MuxStream {
    sender: MuxSender,
    receiver: MuxReceiver,
}

impl MuxStream {
    pub fn stream_id(&self) -> StreamId {
        self.sender.stream_id
    }

    /// False once the stream was reset or its connection ended
    pub fn is_open(&self) -> bool {
        !self.sender.reset.is_cancelled()
    }
}

impl fmt::Debug for MuxStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MuxStream")
            .field("session", &self.sender.mux.label)
            .field("stream_id", &self.sender.stream_id)
            .field("open", &self.is_open())
            .finish()
    }
}

impl TunnelStream for MuxStream {
    type Sender = MuxSender;
    type Receiver = MuxReceiver;

    fn split(self) -> (MuxSender, MuxReceiver) {
        (self.sender, self.receiver)
    }
}

/// Send half of a logical stream
pub struct MuxSender {
    stream_id: StreamId,
    mux: Arc<Multiplexer>,
    credit: Arc<Semaphore>,
    reset: CancellationToken,
    finished: bool,
}

#[async_trait]
impl EnvelopeSender for MuxSender {
    async fn send(&mut self, envelope: Envelope) -> TransportResult<()> {
        if self.finished || self.reset.is_cancelled() {
            return Err(TransportError::StreamClosed);
        }

        // Waits only on this stream's window
        let permit = self
            .credit
            .acquire()
            .await
            .map_err(|_| TransportError::StreamClosed)?;
        permit.forget();

        self.mux
            .outgoing
            .send(StreamFrame::Envelope {
                stream_id: self.stream_id,
                envelope,
            })
            .await
            .map_err(|_| TransportError::ChannelClosed)
    }

    async fn finish(&mut self) -> TransportResult<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        if !self.mux.finish_local(self.stream_id) {
            return Ok(());
        }
        self.mux
            .outgoing
            .send(StreamFrame::Finish {
                stream_id: self.stream_id,
            })
            .await
            .map_err(|_| TransportError::ChannelClosed)
    }
}

impl Drop for MuxSender {
    fn drop(&mut self) {
        if !self.finished && self.mux.finish_local(self.stream_id) {
            let _ = self.mux.outgoing.try_send(StreamFrame::Finish {
                stream_id: self.stream_id,
            });
        }
    }
}

/// Receive half of a logical stream
pub struct MuxReceiver {
    stream_id: StreamId,
    mux: Arc<Multiplexer>,
    inbound: mpsc::Receiver<Envelope>,
    reset: CancellationToken,
    consumed: u32,
}

impl MuxReceiver {
    /// Return credit in batches of half a window
    async fn release(&mut self) {
        self.consumed += 1;
        if self.consumed < STREAM_WINDOW / 2 {
            return;
        }
        let envelopes = std::mem::take(&mut self.consumed);
        let _ = self
            .mux
            .outgoing
            .send(StreamFrame::Credit {
                stream_id: self.stream_id,
                envelopes,
            })
            .await;
    }
}

#[async_trait]
impl EnvelopeReceiver for MuxReceiver {
    async fn recv(&mut self) -> TransportResult<Option<Envelope>> {
        match self.inbound.recv().await {
            Some(envelope) => {
                self.release().await;
                Ok(Some(envelope))
            }
            None if self.reset.is_cancelled() => Err(TransportError::ConnectionError(format!(
                "stream {} on {} was reset",
                self.stream_id, self.mux.label
            ))),
            None => Ok(None),
        }
    }
}

impl Drop for MuxReceiver {
    fn drop(&mut self) {
        self.mux.receiver_dropped(self.stream_id);
    }
}
