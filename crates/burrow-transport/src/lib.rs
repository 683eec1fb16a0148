//! Transport abstraction layer for burrow sessions
//!
//! The relay engine never touches sockets of the channel directly. It works
//! against the traits in this crate:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                 burrow-relay (workers)                  │
//! │    EnvelopeSender / EnvelopeReceiver / TunnelChannel    │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │           burrow-transport (this crate)                 │
//! │  FramedStream: length-prefixed frames over any byte IO  │
//! │  Multiplexer: tunnel streams sharing one connection     │
//! │  Connector / Acceptor: session bootstrap + SessionHello │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!              ┌────────────┴────────────┐
//!              ↓                         ↓
//!        tcp (TcpStream)        memory (tokio::io::duplex)
//! ```

pub mod channel;
pub mod framed;
pub mod memory;
pub mod mux;
pub mod tcp;

#[cfg(test)]
mod tests;

use async_trait::async_trait;
use burrow_proto::{CodecError, Envelope, SessionHello, SessionMode};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

pub use channel::StreamChannel;
pub use framed::{read_hello, write_hello, FramedReceiver, FramedSender, FramedStream};
pub use memory::{MemoryAcceptor, MemoryConnector};
pub use mux::{Multiplexer, MuxIncoming, MuxReceiver, MuxRole, MuxSender, MuxStream};
pub use tcp::{TcpAcceptor, TcpConnector};

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Peer error: {0}")]
    Remote(String),

    #[error("Timeout")]
    Timeout,
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Byte-level connection underneath a session
pub trait AsyncIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncIo for T {}

/// Type-erased connection returned by connectors and acceptors
pub type BoxedIo = Box<dyn AsyncIo>;

/// Sending half of a tunnel's logical channel
#[async_trait]
pub trait EnvelopeSender: Send {
    /// Send one envelope to the peer
    async fn send(&mut self, envelope: Envelope) -> TransportResult<()>;

    /// Signal end-of-channel to the peer
    ///
    /// Must be idempotent: finishing an already finished sender returns `Ok(())`.
    async fn finish(&mut self) -> TransportResult<()>;
}

/// Receiving half of a tunnel's logical channel
#[async_trait]
pub trait EnvelopeReceiver: Send {
    /// Receive the next envelope
    ///
    /// Returns `None` once the peer has finished its sending side.
    async fn recv(&mut self) -> TransportResult<Option<Envelope>>;
}

#[async_trait]
impl<S: EnvelopeSender + ?Sized> EnvelopeSender for Box<S> {
    async fn send(&mut self, envelope: Envelope) -> TransportResult<()> {
        (**self).send(envelope).await
    }

    async fn finish(&mut self) -> TransportResult<()> {
        (**self).finish().await
    }
}

#[async_trait]
impl<R: EnvelopeReceiver + ?Sized> EnvelopeReceiver for Box<R> {
    async fn recv(&mut self) -> TransportResult<Option<Envelope>> {
        (**self).recv().await
    }
}

/// A tunnel's logical stream, split into independently owned halves
pub trait TunnelStream: Send + 'static {
    type Sender: EnvelopeSender + 'static;
    type Receiver: EnvelopeReceiver + 'static;

    fn split(self) -> (Self::Sender, Self::Receiver);
}

/// Opens one logical stream per tunnel (the `Make` call)
#[async_trait]
pub trait TunnelChannel: Send + Sync {
    type Stream: TunnelStream;

    async fn make(&self) -> TransportResult<Self::Stream>;
}

/// Client-side: establishes outgoing session connections
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new connection announcing `mode` in its [`SessionHello`]
    async fn connect(&self, mode: SessionMode) -> TransportResult<BoxedIo>;

    /// Human-readable peer description for logs
    fn describe(&self) -> String;
}

/// Server-side: accepts session connections together with their hello
#[async_trait]
pub trait Acceptor: Send {
    /// Returns `None` once no more connections will arrive
    async fn accept(&mut self) -> TransportResult<Option<(SessionHello, BoxedIo)>>;
}
