//! Session handshake

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How tunnels are carried over a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// Each tunnel is a logical stream of [`crate::Envelope`]s, multiplexed as
    /// [`crate::StreamFrame`]s over one connection
    #[default]
    Stream,
    /// One connection for all tunnels, carrying [`crate::CallFrame`] frames
    Call,
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionMode::Stream => write!(f, "stream"),
            SessionMode::Call => write!(f, "call"),
        }
    }
}

impl FromStr for SessionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stream" => Ok(SessionMode::Stream),
            "call" => Ok(SessionMode::Call),
            other => Err(format!(
                "Invalid session mode '{}' (expected 'stream' or 'call')",
                other
            )),
        }
    }
}

/// First frame written by the connecting side of every transport connection
///
/// `agent_id` is an opaque identity tag; the relay only logs it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionHello {
    pub version: u32,
    pub agent_id: String,
    pub mode: SessionMode,
}

impl SessionHello {
    pub fn new(agent_id: impl Into<String>, mode: SessionMode) -> Self {
        Self {
            version: crate::PROTOCOL_VERSION,
            agent_id: agent_id.into(),
            mode,
        }
    }
}
