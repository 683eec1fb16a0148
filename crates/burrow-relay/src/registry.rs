//! Registry of live tunnels, keyed by tunnel id
//!
//! Each side of a session keeps one. The call-mode gateway also routes inbound
//! envelopes to tunnel workers through it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use burrow_proto::{Envelope, TunnelId};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

/// Registry lookup and routing errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no such tunnel: {0}")]
    NoSuchTunnel(TunnelId),

    #[error("tunnel already registered: {0}")]
    DuplicateTunnel(TunnelId),

    #[error("tunnel closed: {0}")]
    TunnelClosed(TunnelId),
}

/// Information about a live tunnel
#[derive(Debug, Clone)]
pub struct TunnelInfo {
    /// Identifier of the tunnel
    pub tunnel_id: TunnelId,
    /// Destination the tunnel relays to
    pub destination: String,
    /// When the tunnel was registered
    pub established_at: Instant,
}

impl TunnelInfo {
    pub fn new(tunnel_id: TunnelId) -> Self {
        Self {
            destination: tunnel_id.destination.clone(),
            tunnel_id,
            established_at: Instant::now(),
        }
    }
}

struct Entry {
    info: TunnelInfo,
    /// Inbound route for sessions that multiplex tunnels over one connection
    inbound: Option<mpsc::Sender<Envelope>>,
}

/// Tracks live tunnels and routes inbound data to their workers
///
/// Cloning is cheap; all clones share the same table and id counter.
#[derive(Clone)]
pub struct TunnelRegistry {
    origin: Arc<str>,
    next_seq: Arc<AtomicU64>,
    tunnels: Arc<RwLock<HashMap<TunnelId, Entry>>>,
}

impl TunnelRegistry {
    /// Create a registry whose allocated ids carry `origin`
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: Arc::from(origin.into()),
            next_seq: Arc::new(AtomicU64::new(1)),
            tunnels: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Allocate a fresh identifier for a tunnel to `destination`
    ///
    /// Sequence numbers are never reused by this registry, so the id cannot
    /// collide with any tunnel it has handed out before.
    pub fn allocate_id(&self, destination: &str) -> TunnelId {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        TunnelId::new(self.origin.as_ref(), destination, seq)
    }

    /// Register a live tunnel
    ///
    /// # Arguments
    /// * `info` - Tunnel information
    /// * `inbound` - Where `deliver` should route envelopes, if this tunnel is routed
    ///
    /// # Errors
    /// `DuplicateTunnel` if a live tunnel already uses the same id
    pub async fn insert(
        &self,
        info: TunnelInfo,
        inbound: Option<mpsc::Sender<Envelope>>,
    ) -> Result<(), RegistryError> {
        let mut tunnels = self.tunnels.write().await;

        if tunnels.contains_key(&info.tunnel_id) {
            return Err(RegistryError::DuplicateTunnel(info.tunnel_id));
        }

        debug!(
            tunnel_id = %info.tunnel_id,
            routed = inbound.is_some(),
            "Registering tunnel"
        );

        tunnels.insert(info.tunnel_id.clone(), Entry { info, inbound });

        info!(active_tunnels = tunnels.len(), "Tunnel registered");
        Ok(())
    }

    /// Route an envelope to the tunnel's worker
    ///
    /// Waits while the worker's inbound queue is full, so a slow destination
    /// holds back only its own caller.
    pub async fn deliver(&self, tunnel_id: &TunnelId, envelope: Envelope) -> Result<(), RegistryError> {
        let route = {
            let tunnels = self.tunnels.read().await;
            let entry = tunnels
                .get(tunnel_id)
                .ok_or_else(|| RegistryError::NoSuchTunnel(tunnel_id.clone()))?;
            entry
                .inbound
                .clone()
                .ok_or_else(|| RegistryError::NoSuchTunnel(tunnel_id.clone()))?
        };

        route
            .send(envelope)
            .await
            .map_err(|_| RegistryError::TunnelClosed(tunnel_id.clone()))
    }

    /// Remove a tunnel; dropping its route ends the worker's inbound queue
    pub async fn remove(&self, tunnel_id: &TunnelId) -> Option<TunnelInfo> {
        let mut tunnels = self.tunnels.write().await;

        match tunnels.remove(tunnel_id) {
            Some(entry) => {
                info!(
                    tunnel_id = %tunnel_id,
                    duration_secs = entry.info.established_at.elapsed().as_secs(),
                    active_tunnels = tunnels.len(),
                    "Tunnel unregistered"
                );
                Some(entry.info)
            }
            None => {
                debug!(tunnel_id = %tunnel_id, "Tunnel already unregistered");
                None
            }
        }
    }

    /// Remove a set of tunnels, returning how many were live
    pub async fn remove_all<'a>(&self, ids: impl IntoIterator<Item = &'a TunnelId>) -> usize {
        let mut tunnels = self.tunnels.write().await;
        let removed = ids
            .into_iter()
            .filter(|id| tunnels.remove(*id).is_some())
            .count();

        if removed > 0 {
            info!(
                removed,
                active_tunnels = tunnels.len(),
                "Tunnels unregistered"
            );
        }
        removed
    }

    pub async fn get(&self, tunnel_id: &TunnelId) -> Option<TunnelInfo> {
        let tunnels = self.tunnels.read().await;
        tunnels.get(tunnel_id).map(|entry| entry.info.clone())
    }

    pub async fn contains(&self, tunnel_id: &TunnelId) -> bool {
        self.tunnels.read().await.contains_key(tunnel_id)
    }

    /// Number of live tunnels
    pub async fn count(&self) -> usize {
        self.tunnels.read().await.len()
    }

    /// All live tunnels
    pub async fn list(&self) -> Vec<TunnelInfo> {
        let tunnels = self.tunnels.read().await;
        tunnels.values().map(|entry| entry.info.clone()).collect()
    }

    /// Drop every entry (shutdown)
    pub async fn clear(&self) {
        let mut tunnels = self.tunnels.write().await;
        let count = tunnels.len();
        tunnels.clear();

        info!(cleared_tunnels = count, "All tunnels cleared");
    }
}

impl std::fmt::Debug for TunnelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelRegistry")
            .field("origin", &self.origin)
            .field("next_seq", &self.next_seq.load(Ordering::Relaxed))
            .finish()
    }
}
