//! # Tor Onion Engine
//!
//! The circuit and cell engine of an onion-routing client: fixed-size
//! cells, layered per-hop encryption with running digests, incremental
//! circuit construction, stream multiplexing and the hidden-service
//! rendezvous protocol.
//!
//! ## Architecture
//!
//! ```text
//! TorClient
//!   ↓
//! CircuitManager (idle pool, keepalive, retries)
//!   ↓
//! Circuit (hops, streams, reactor task)
//!   ↓
//! Connection (one per relay, shared by circuits)
//!   ↓
//! Transport (supplied by the host)
//! ```
//!
//! The directory and the transport are collaborators the host provides
//! through the [`Directory`] and [`Transport`] traits. The library only
//! uses the `log` facade; hosts choose the logger.

pub mod circuit;
pub mod circuit_pool;
pub mod config;
pub mod connection_pool;
pub mod directory;
mod error;
pub mod hidden_service;
pub mod protocol;
pub mod transport;

pub use circuit::{Circuit, CircuitState, IncomingStream, Stream, StreamTarget};
pub use circuit_pool::{CircuitManager, CircuitStatus, MaintenanceReport};
pub use config::Settings;
pub use connection_pool::{ConnectionPool, ConnectionPoolStats};
pub use directory::{
    onion_address, parse_onion_host, Directory, IntroductionPoint, RendezvousServiceDescriptor,
};
pub use error::{ErrorCode, ErrorInfo, RendezvousPhase, Result, TorError};
pub use hidden_service::{HiddenService, HiddenServiceKeys, PortHandler};
pub use transport::{Transport, TransportStream};

use std::net::IpAddr;
use std::sync::Arc;

/// Exit port a RESOLVE exit must allow
const RESOLVE_EXIT_PORT: u16 = 80;

/// Per-request connect options
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Use a fresh circuit shared with no other request; it closes with the stream
    pub isolated: bool,
}

/// Main client handle
pub struct TorClient {
    manager: Arc<CircuitManager>,
}

impl TorClient {
    /// Create a client and start background circuit maintenance
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(
        settings: Settings,
        directory: Arc<dyn Directory>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        settings.validate()?;
        log::info!("Creating onion client");
        let manager = CircuitManager::new(Arc::new(settings), directory, transport);
        manager.start();
        log::info!("✅ Onion client created");
        Ok(Self { manager })
    }

    /// The circuit manager behind this client
    pub fn manager(&self) -> &Arc<CircuitManager> {
        &self.manager
    }

    /// Whether the directory can supply routers
    pub fn is_ready(&self) -> bool {
        !self.manager.is_closed() && self.manager.directory().is_ready()
    }

    /// Open a stream to `host:port`; `.onion` hosts go through the rendezvous protocol
    pub async fn connect(&self, host: &str, port: u16, options: ConnectOptions) -> Result<Stream> {
        if let Some(onion_id) = parse_onion_host(host) {
            return hidden_service::connect(&self.manager, &onion_id, port).await;
        }
        let target = StreamTarget::Host {
            address: host.to_string(),
            port,
        };
        self.manager.connect(target, Some(port), options.isolated).await
    }

    /// Open a BEGIN_DIR stream to the directory port of a relay
    pub async fn connect_directory(&self) -> Result<Stream> {
        self.manager.connect(StreamTarget::Directory, None, false).await
    }

    /// Resolve `hostname` through an exit
    pub async fn resolve(&self, hostname: &str) -> Result<Vec<IpAddr>> {
        self.manager.resolve(hostname, RESOLVE_EXIT_PORT).await
    }

    /// Serve `handler` as a hidden service under `keys`
    pub async fn provide_hidden_service(
        &self,
        keys: HiddenServiceKeys,
        handler: Arc<dyn PortHandler>,
    ) -> Result<HiddenService> {
        hidden_service::provide(&self.manager, keys, handler).await
    }

    /// Circuit counts
    pub fn status(&self) -> CircuitStatus {
        self.manager.status()
    }

    /// Circuit counts as JSON, for hosts that report status over a wire
    pub fn status_json(&self) -> serde_json::Value {
        let status = self.status();
        serde_json::json!({
            "ready": self.is_ready(),
            "circuits": status,
            "build_failures": self.manager.build_failures(),
            "connections": self.manager.connections().stats(),
        })
    }

    /// Destroy every circuit and close every connection
    pub fn close(&self) {
        log::info!("🔌 Closing onion client");
        self.manager.close();
    }
}

impl Drop for TorClient {
    fn drop(&mut self) {
        self.manager.close();
    }
}
