//! Structured tunnel identifier

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one tunnel for as long as it is live
///
/// `origin` names the side that allocated the identifier (an agent id or a gateway
/// label) and `seq` is a counter owned by that side's registry, so two live tunnels
/// never share an identifier even when they target the same destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TunnelId {
    pub origin: String,
    pub destination: String,
    pub seq: u64,
}

impl TunnelId {
    pub fn new(origin: impl Into<String>, destination: impl Into<String>, seq: u64) -> Self {
        Self {
            origin: origin.into(),
            destination: destination.into(),
            seq,
        }
    }
}

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}->{}", self.origin, self.seq, self.destination)
    }
}
