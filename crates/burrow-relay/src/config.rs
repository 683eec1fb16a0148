//! Relay worker configuration

use std::time::Duration;

/// Largest `chunk_size` whose `Data` frame still fits in a wire frame
pub const MAX_CHUNK_SIZE: usize = burrow_proto::MAX_FRAME_SIZE / 2;

/// Tunables for relay workers on either side of a tunnel
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Maximum bytes read from the socket per `Data` frame
    pub chunk_size: usize,

    /// Timeout for dialing the destination
    pub dial_timeout: Duration,

    /// TCP keep-alive period on dialed sockets (`None` leaves the OS default)
    pub keepalive: Option<Duration>,

    /// Abort a tunnel that moves no bytes for this long (`None` disables)
    pub idle_timeout: Option<Duration>,

    /// How long teardown waits for the peer to finish its side of the channel
    pub drain_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            chunk_size: burrow_proto::DEFAULT_CHUNK_SIZE,
            dial_timeout: Duration::from_secs(30),
            keepalive: Some(Duration::from_secs(20)),
            idle_timeout: None,
            drain_timeout: Duration::from_secs(5),
        }
    }
}
