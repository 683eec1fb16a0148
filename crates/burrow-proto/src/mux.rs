//! Stream-mode framing: logical streams over one connection
//!
//! A stream-mode connection carries one logical stream per tunnel. Streams are
//! numbered by the side that opens them. Each direction of a stream may have at
//! most [`STREAM_WINDOW`] envelopes outstanding; the receiver hands credit back
//! as its consumer takes envelopes, so a tunnel whose destination stalls only
//! stalls itself.

use crate::envelope::Envelope;
use serde::{Deserialize, Serialize};

pub type StreamId = u32;

/// Envelopes a sender may have outstanding on one stream before it needs credit
pub const STREAM_WINDOW: u32 = 16;

/// Wire frame of a stream-mode connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum StreamFrame {
    /// A new logical stream; the opener may send right away
    Open { stream_id: StreamId },
    /// One envelope on an open stream
    Envelope {
        stream_id: StreamId,
        envelope: Envelope,
    },
    /// The receiver consumed `envelopes` more envelopes
    Credit { stream_id: StreamId, envelopes: u32 },
    /// The sender will send nothing more on this stream
    Finish { stream_id: StreamId },
    /// Abandon the stream in both directions
    Reset { stream_id: StreamId, reason: String },
}

impl StreamFrame {
    pub fn stream_id(&self) -> StreamId {
        match self {
            StreamFrame::Open { stream_id }
            | StreamFrame::Envelope { stream_id, .. }
            | StreamFrame::Credit { stream_id, .. }
            | StreamFrame::Finish { stream_id }
            | StreamFrame::Reset { stream_id, .. } => *stream_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StreamFrame::Open { .. } => "Open",
            StreamFrame::Envelope { .. } => "Envelope",
            StreamFrame::Credit { .. } => "Credit",
            StreamFrame::Finish { .. } => "Finish",
            StreamFrame::Reset { .. } => "Reset",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FrameCodec;
    use bytes::BytesMut;
    use tokio_util::codec::Decoder;

    #[test]
    fn test_stream_id_of_every_kind() {
        let frames = [
            StreamFrame::Open { stream_id: 3 },
            StreamFrame::Envelope {
                stream_id: 3,
                envelope: Envelope::dial_ok(),
            },
            StreamFrame::Credit {
                stream_id: 3,
                envelopes: 8,
            },
            StreamFrame::Finish { stream_id: 3 },
            StreamFrame::Reset {
                stream_id: 3,
                reason: "gone".to_string(),
            },
        ];
        assert!(frames.iter().all(|frame| frame.stream_id() == 3));
    }

    #[test]
    fn test_frames_of_different_streams_decode_back_to_back() {
        let first = StreamFrame::Envelope {
            stream_id: 1,
            envelope: Envelope::data(vec![0xAB; 4096]),
        };
        let second = StreamFrame::Finish { stream_id: 3 };

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&FrameCodec::to_bytes(&first).unwrap());
        buf.extend_from_slice(&FrameCodec::to_bytes(&second).unwrap());

        let mut codec = FrameCodec::<StreamFrame>::new();
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(first));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(second));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }
}
