//! Stream-mode tunnel channel on top of a [`Connector`]

use async_trait::async_trait;
use burrow_proto::SessionMode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::mux::{Multiplexer, MuxRole, MuxStream};
use crate::{Connector, TransportResult, TunnelChannel};

/// Opens every tunnel stream as a logical stream of one shared connection
///
/// The connection is made on first use and made again on the next `make` after
/// it ends, so losing it fails every stream on it at once.
#[derive(Clone)]
pub struct StreamChannel {
    connector: Arc<dyn Connector>,
    session: Arc<Mutex<Option<Arc<Multiplexer>>>>,
    connections: Arc<AtomicU64>,
}

impl StreamChannel {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            session: Arc::new(Mutex::new(None)),
            connections: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of connections made so far
    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    /// The live connection, if any
    pub async fn session(&self) -> Option<Arc<Multiplexer>> {
        let slot = self.session.lock().await;
        slot.as_ref().filter(|mux| !mux.is_closed()).cloned()
    }

    /// Close the current connection, failing its streams
    pub async fn close(&self) {
        if let Some(mux) = self.session.lock().await.take() {
            mux.close();
        }
    }

    async fn connected(&self) -> TransportResult<Arc<Multiplexer>> {
        let mut slot = self.session.lock().await;
        if let Some(mux) = slot.as_ref().filter(|mux| !mux.is_closed()) {
            return Ok(mux.clone());
        }

        let io = self.connector.connect(SessionMode::Stream).await?;
        let n = self.connections.fetch_add(1, Ordering::Relaxed) + 1;
        let label = format!("{}#{}", self.connector.describe(), n);
        info!(session = %label, "Stream session connected");

        // The gateway never opens streams towards the agent
        let (mux, _refused) = Multiplexer::start(io, label, MuxRole::Initiator);
        *slot = Some(mux.clone());
        Ok(mux)
    }
}

#[async_trait]
impl TunnelChannel for StreamChannel {
    type Stream = MuxStream;

    async fn make(&self) -> TransportResult<Self::Stream> {
        self.connected().await?.open().await
    }
}
