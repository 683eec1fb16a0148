//! Framed streams over any byte connection

use burrow_proto::{FrameCodec, SessionHello};
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::trace;

use crate::{BoxedIo, TransportError, TransportResult};

/// Hello frames are tiny; anything larger is not a burrow peer
const MAX_HELLO_SIZE: usize = 64 * 1024;

/// A connection carrying frames of type `T` in both directions
pub struct FramedStream<T> {
    sender: FramedSender<T>,
    receiver: FramedReceiver<T>,
}

impl<T> FramedStream<T> {
    pub fn new(io: BoxedIo, label: impl Into<String>) -> Self {
        let label = label.into();
        let (read, write) = tokio::io::split(io);
        Self {
            sender: FramedSender {
                writer: FramedWrite::new(write, FrameCodec::new()),
                finished: false,
                label: label.clone(),
            },
            receiver: FramedReceiver {
                reader: FramedRead::new(read, FrameCodec::new()),
                label,
            },
        }
    }

    /// Split into separate send and receive halves for concurrent use
    pub fn into_parts(self) -> (FramedSender<T>, FramedReceiver<T>) {
        (self.sender, self.receiver)
    }
}

impl<T> Debug for FramedStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedStream")
            .field("label", &self.sender.label)
            .field("finished", &self.sender.finished)
            .finish()
    }
}

/// Send half of a split framed stream
pub struct FramedSender<T> {
    writer: FramedWrite<WriteHalf<BoxedIo>, FrameCodec<T>>,
    finished: bool,
    label: String,
}

impl<T: Serialize + Debug + Send> FramedSender<T> {
    pub async fn send_frame(&mut self, item: T) -> TransportResult<()> {
        if self.finished {
            return Err(TransportError::StreamClosed);
        }

        trace!(stream = %self.label, frame = ?item, "Sending frame");
        self.writer.send(item).await?;
        Ok(())
    }

    /// Flush and shut down the write side; the peer observes end-of-stream
    pub async fn close(&mut self) -> TransportResult<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        SinkExt::<T>::close(&mut self.writer).await?;
        trace!(stream = %self.label, "Send side closed");
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

/// Receive half of a split framed stream
pub struct FramedReceiver<T> {
    reader: FramedRead<ReadHalf<BoxedIo>, FrameCodec<T>>,
    label: String,
}

impl<T: DeserializeOwned + Debug> FramedReceiver<T> {
    /// Returns `None` when the peer closed its side cleanly
    pub async fn recv_frame(&mut self) -> TransportResult<Option<T>> {
        match self.reader.next().await {
            Some(Ok(item)) => {
                trace!(stream = %self.label, frame = ?item, "Received frame");
                Ok(Some(item))
            }
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }
}

/// Write the session hello as the first frame of a connection
pub async fn write_hello<W>(io: &mut W, hello: &SessionHello) -> TransportResult<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = FrameCodec::to_bytes(hello)?;
    io.write_all(&frame).await?;
    io.flush().await?;
    Ok(())
}

/// Read the session hello written by [`write_hello`]
///
/// Reads exactly one frame so nothing past the hello is consumed.
pub async fn read_hello<R>(io: &mut R) -> TransportResult<SessionHello>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let length = io.read_u32().await? as usize;
    if length > MAX_HELLO_SIZE {
        return Err(TransportError::HandshakeFailed(format!(
            "hello frame too large: {} bytes",
            length
        )));
    }

    let mut payload = vec![0u8; length];
    io.read_exact(&mut payload).await?;

    let hello: SessionHello = FrameCodec::<SessionHello>::from_payload(&payload)
        .map_err(|e| TransportError::HandshakeFailed(e.to_string()))?;

    if hello.version != burrow_proto::PROTOCOL_VERSION {
        return Err(TransportError::HandshakeFailed(format!(
            "unsupported protocol version {}",
            hello.version
        )));
    }

    Ok(hello)
}
