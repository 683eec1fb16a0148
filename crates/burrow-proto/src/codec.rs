//! Codec for encoding/decoding protocol frames
//!
//! Format: `[length: u32 big-endian][payload: bincode serialized message]`

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::MAX_FRAME_SIZE;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Length-prefixed bincode codec for one message type
pub struct FrameCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> FrameCodec<T> {
    /// Length header size
    pub const HEADER_SIZE: usize = 4;

    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for FrameCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for FrameCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for FrameCodec<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FrameCodec")
    }
}

impl<T: Serialize> FrameCodec<T> {
    /// Encode one message into a standalone frame
    pub fn to_bytes(msg: &T) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::new();
        Self::new().encode_ref(msg, &mut buf)?;
        Ok(buf.freeze())
    }

    fn encode_ref(&mut self, msg: &T, dst: &mut BytesMut) -> Result<(), CodecError> {
        let payload = bincode::serialize(msg)?;

        if payload.len() > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(payload.len()));
        }

        dst.reserve(Self::HEADER_SIZE + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

impl<T: DeserializeOwned> FrameCodec<T> {
    /// Decode a frame payload (without its length header)
    pub fn from_payload(payload: &[u8]) -> Result<T, CodecError> {
        Ok(bincode::deserialize(payload)?)
    }
}

impl<T: Serialize> Encoder<T> for FrameCodec<T> {
    type Error = CodecError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.encode_ref(&item, dst)
    }
}

impl<T: DeserializeOwned> Decoder for FrameCodec<T> {
    type Item = T;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least 4 bytes for length header
        if src.len() < Self::HEADER_SIZE {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[..Self::HEADER_SIZE]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(length));
        }

        if src.len() < Self::HEADER_SIZE + length {
            src.reserve(Self::HEADER_SIZE + length - src.len());
            return Ok(None);
        }

        src.advance(Self::HEADER_SIZE);
        let payload = src.split_to(length);

        Self::from_payload(&payload).map(Some)
    }
}
