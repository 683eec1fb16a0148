//! Burrow relay engine
//!
//! A gateway on a public network opens TCP tunnels to destinations reachable only
//! from an agent's network. The agent connects out to the gateway, so the gateway
//! never needs a route into the private network.
//!
//! # Components
//!
//! - [`relay`]: the per-tunnel worker that dials a destination and pumps bytes
//! - [`Dispatcher`]: keeps an idle stream open and spawns a worker per `DialRequest`
//! - [`CallSession`]: many tunnels multiplexed over one connection as calls
//! - [`Supervisor`]: runs the agent side over either transport, reconnecting
//! - [`Gateway`]: accepts agent sessions and opens tunnels through them
//! - [`TunnelRegistry`]: live tunnels and inbound routing
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use burrow_proto::SessionMode;
//! use burrow_relay::{RelayConfig, Supervisor, TunnelRegistry, TunnelTransport};
//! use burrow_transport::TcpConnector;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let connector = Arc::new(TcpConnector::new("gateway.example.com:8080", "agent-1"));
//!     let supervisor = Supervisor::new(
//!         TunnelTransport::new(connector, SessionMode::Stream),
//!         TunnelRegistry::new("agent-1"),
//!         RelayConfig::default(),
//!     );
//!
//!     supervisor.run(CancellationToken::new()).await?;
//!     Ok(())
//! }
//! ```

pub mod call;
pub mod config;
pub mod dispatch;
pub mod gateway;
pub mod reconnect;
pub mod registry;
pub mod relay;
pub mod session;
pub mod state;

pub use call::{serve_calls, CallSession, CallTunnel, CallTunnelReceiver, CallTunnelSender};
pub use config::{RelayConfig, MAX_CHUNK_SIZE};
pub use dispatch::Dispatcher;
pub use gateway::{Gateway, GatewayConfig, GatewayError, GatewayTunnel};
pub use reconnect::{Backoff, ReconnectConfig, ReconnectError};
pub use registry::{RegistryError, TunnelInfo, TunnelRegistry};
pub use relay::{dial, relay, run_tunnel, RelayError, TunnelOutcome, TunnelReport};
pub use session::{Supervisor, TunnelTransport};
pub use state::{TunnelEvent, TunnelState};
