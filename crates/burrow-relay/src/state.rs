//! Tunnel life cycle state machine

use std::fmt;
use std::sync::Mutex;
use tracing::debug;

use burrow_proto::TunnelId;

/// Where a tunnel is in its life cycle
///
/// "Local" is the destination socket side of this process, "remote" is the peer
/// on the other end of the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Dialing,
    Open,
    /// The socket reached EOF and `closed` was sent to the peer
    HalfClosedLocal,
    /// The peer sent `closed` and the socket's write side was shut down
    HalfClosedRemote,
    /// Both directions finished gracefully
    Closed,
    /// Dial failure, I/O error, peer error, or channel failure
    Failed,
}

/// Inputs to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelEvent {
    Dialed,
    DialFailed,
    LocalEof,
    RemoteEof,
    Error,
}

impl TunnelState {
    pub fn on(self, event: TunnelEvent) -> TunnelState {
        use TunnelEvent::*;
        use TunnelState::*;

        match (self, event) {
            (Closed, _) | (Failed, _) => self,
            (_, Error) => Failed,
            (Dialing, Dialed) => Open,
            (Dialing, DialFailed) => Failed,
            (Open, LocalEof) => HalfClosedLocal,
            (Open, RemoteEof) => HalfClosedRemote,
            (HalfClosedLocal, RemoteEof) | (HalfClosedRemote, LocalEof) => Closed,
            // Repeated or out-of-order events leave the state unchanged
            (state, _) => state,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TunnelState::Closed | TunnelState::Failed)
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TunnelState::Dialing => "dialing",
            TunnelState::Open => "open",
            TunnelState::HalfClosedLocal => "half-closed-local",
            TunnelState::HalfClosedRemote => "half-closed-remote",
            TunnelState::Closed => "closed",
            TunnelState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// State shared by the two pump directions of one tunnel
#[derive(Debug)]
pub struct StateCell {
    tunnel_id: TunnelId,
    state: Mutex<TunnelState>,
}

impl StateCell {
    pub fn new(tunnel_id: TunnelId, initial: TunnelState) -> Self {
        Self {
            tunnel_id,
            state: Mutex::new(initial),
        }
    }

    /// Apply an event and return the resulting state
    pub fn apply(&self, event: TunnelEvent) -> TunnelState {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let before = *state;
        *state = before.on(event);

        if before != *state {
            debug!(
                tunnel_id = %self.tunnel_id,
                from = %before,
                to = %*state,
                event = ?event,
                "Tunnel state changed"
            );
        }

        *state
    }

    pub fn get(&self) -> TunnelState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
