//! In-process connector/acceptor pair
//!
//! Each `connect` creates a `tokio::io::duplex` pipe and hands the far end to the
//! acceptor, so the same framing code runs as over TCP.

use async_trait::async_trait;
use burrow_proto::{SessionHello, SessionMode};
use tokio::sync::mpsc;

use crate::{Acceptor, BoxedIo, Connector, TransportError, TransportResult};

/// Buffer size of each duplex pipe
const PIPE_CAPACITY: usize = 64 * 1024;

/// Create a connected connector/acceptor pair
pub fn link(agent_id: impl Into<String>) -> (MemoryConnector, MemoryAcceptor) {
    let (tx, rx) = mpsc::channel(16);
    (
        MemoryConnector {
            agent_id: agent_id.into(),
            tx,
        },
        MemoryAcceptor { rx },
    )
}

#[derive(Debug, Clone)]
pub struct MemoryConnector {
    agent_id: String,
    tx: mpsc::Sender<(SessionHello, BoxedIo)>,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, mode: SessionMode) -> TransportResult<BoxedIo> {
        let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
        let hello = SessionHello::new(self.agent_id.clone(), mode);

        self.tx
            .send((hello, Box::new(far)))
            .await
            .map_err(|_| TransportError::ChannelClosed)?;

        Ok(Box::new(near))
    }

    fn describe(&self) -> String {
        format!("memory://{}", self.agent_id)
    }
}

pub struct MemoryAcceptor {
    rx: mpsc::Receiver<(SessionHello, BoxedIo)>,
}

#[async_trait]
impl Acceptor for MemoryAcceptor {
    async fn accept(&mut self) -> TransportResult<Option<(SessionHello, BoxedIo)>> {
        Ok(self.rx.recv().await)
    }
}
