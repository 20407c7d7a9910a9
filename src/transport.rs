//! Transport collaborator
//!
//! A transport hands out reliable, ordered, authenticated byte streams to
//! routers (a TLS-like secure channel). The engine only ever reads and
//! writes whole cells on them.

use crate::error::Result;
use crate::protocol::Router;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// Byte stream to one router
pub trait TransportStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> TransportStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Opens byte streams to routers
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to `router`'s OR port
    async fn connect(&self, router: &Router) -> Result<Box<dyn TransportStream>>;
}
