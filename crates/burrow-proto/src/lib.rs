//! Burrow Protocol Definitions
//!
//! This crate defines the message vocabulary exchanged between an agent and a
//! gateway, and the length-prefixed codec used to frame it on the wire.
//!
//! - [`Envelope`]: the per-tunnel stream messages (dial negotiation and data)
//! - [`StreamFrame`]: logical streams of envelopes sharing one stream-mode connection
//! - [`CallFrame`]: request/response calls used when many tunnels share one session
//! - [`SessionHello`]: the first frame of every transport connection
//! - [`TunnelId`]: structured tunnel identifier

pub mod calls;
pub mod codec;
pub mod envelope;
pub mod mux;
pub mod session;
pub mod tunnel_id;

pub use calls::{Call, CallFrame, Reply};
pub use codec::{CodecError, FrameCodec};
pub use envelope::{DataFrame, Envelope};
pub use mux::{StreamFrame, StreamId, STREAM_WINDOW};
pub use session::{SessionHello, SessionMode};
pub use tunnel_id::TunnelId;

/// Protocol version carried in [`SessionHello`]
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Default size of a socket read relayed as one `Data` frame
pub const DEFAULT_CHUNK_SIZE: usize = 4096;
