//! Request/response calls for sessions that multiplex many tunnels
//!
//! In call mode one connection carries every tunnel. Each side can issue calls;
//! responses are matched to requests by `call_id`.

use crate::envelope::DataFrame;
use crate::tunnel_id::TunnelId;
use serde::{Deserialize, Serialize};

/// A call issued by either side of a session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Call {
    /// Ask the peer to dial `destination` and allocate a tunnel for it
    CreateTunnel { destination: String },
    /// Deliver one data frame into an open tunnel
    WriteToTunnel { tunnel_id: TunnelId, data: DataFrame },
    /// The sender is done with the tunnel; the receiver drops its entry
    CloseTunnel { tunnel_id: TunnelId },
}

/// Reply to a [`Call`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Reply {
    CreateTunnel {
        tunnel_id: Option<TunnelId>,
        error: Option<String>,
    },
    WriteToTunnel {
        error: Option<String>,
    },
    CloseTunnel {
        error: Option<String>,
    },
}

/// Wire frame of a call-mode session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum CallFrame {
    Request { call_id: u64, call: Call },
    Response { call_id: u64, reply: Reply },
}

impl Call {
    pub fn name(&self) -> &'static str {
        match self {
            Call::CreateTunnel { .. } => "CreateTunnel",
            Call::WriteToTunnel { .. } => "WriteToTunnel",
            Call::CloseTunnel { .. } => "CloseTunnel",
        }
    }
}

impl Reply {
    /// Error string carried by the reply, whatever its kind
    pub fn error(&self) -> Option<&str> {
        match self {
            Reply::CreateTunnel { error, .. }
            | Reply::WriteToTunnel { error }
            | Reply::CloseTunnel { error } => error.as_deref(),
        }
    }
}
