//! Tunnel stream messages

use serde::{Deserialize, Serialize};
use std::fmt;

/// Message exchanged on a tunnel's logical stream
///
/// The initiator sends exactly one [`Envelope::DialRequest`]; the receiver answers
/// with exactly one [`Envelope::DialResponse`] before any [`Envelope::Data`] flows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Envelope {
    /// Open a tunnel to `destination` (host:port)
    DialRequest { destination: String },
    /// Result of the dial; `None` means the TCP connection is open
    DialResponse {
        #[serde(default)]
        error: Option<String>,
    },
    /// A chunk of payload flowing in one direction
    Data(DataFrame),
}

/// Payload chunk for one direction of a tunnel
#[derive(Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DataFrame {
    #[serde(with = "serde_bytes")]
    pub bytes: Vec<u8>,
    /// No more data will follow in this direction (half-close)
    pub closed: bool,
    /// Abnormal termination; the whole tunnel must be torn down
    #[serde(default)]
    pub error: Option<String>,
}

impl Envelope {
    pub fn dial_request(destination: impl Into<String>) -> Self {
        Envelope::DialRequest {
            destination: destination.into(),
        }
    }

    pub fn dial_ok() -> Self {
        Envelope::DialResponse { error: None }
    }

    pub fn dial_failed(error: impl Into<String>) -> Self {
        Envelope::DialResponse {
            error: Some(error.into()),
        }
    }

    pub fn data(bytes: impl Into<Vec<u8>>) -> Self {
        Envelope::Data(DataFrame {
            bytes: bytes.into(),
            ..DataFrame::default()
        })
    }

    pub fn closed() -> Self {
        Envelope::Data(DataFrame {
            closed: true,
            ..DataFrame::default()
        })
    }

    /// Terminal error frame. It is also marked closed, since nothing follows it.
    pub fn error(error: impl Into<String>) -> Self {
        Envelope::Data(DataFrame {
            bytes: Vec::new(),
            closed: true,
            error: Some(error.into()),
        })
    }

    /// Short variant name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::DialRequest { .. } => "DialRequest",
            Envelope::DialResponse { .. } => "DialResponse",
            Envelope::Data(_) => "Data",
        }
    }
}

impl DataFrame {
    pub fn is_terminal(&self) -> bool {
        self.closed || self.error.is_some()
    }
}

// Payload bytes are summarized so per-chunk debug logs stay readable
impl fmt::Debug for DataFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataFrame")
            .field("len", &self.bytes.len())
            .field("closed", &self.closed)
            .field("error", &self.error)
            .finish()
    }
}

mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(data)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<u8>::deserialize(deserializer)
    }
}
