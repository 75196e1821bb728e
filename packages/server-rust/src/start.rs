//! One-call startup: build the registry and keep it served over a tunnel.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::service::{BuildError, Registry};
use crate::tunnel::{Transport, Tunnel, TunnelConfig, TunnelError};

/// Where and how [`Registry::start`] connects.
#[derive(Debug, Clone)]
pub struct StartOptions {
    /// Relay address, `host:port` or `scheme://host:port`.
    pub addr: String,
    pub tunnel: TunnelConfig,
}

impl StartOptions {
    #[must_use]
    pub fn new(addr: impl Into<String>, tunnel: TunnelConfig) -> Self {
        Self {
            addr: addr.into(),
            tunnel,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("building registry: {0}")]
    Build(#[from] BuildError),
    #[error(transparent)]
    Tunnel(#[from] TunnelError),
}

impl Registry {
    /// Builds the dispatcher and serves it through `transport` until the
    /// tunnel ends. Build errors are returned before anything is dialed.
    pub async fn start<T: Transport>(
        self,
        transport: T,
        cancellation: &CancellationToken,
        options: StartOptions,
    ) -> Result<(), StartError> {
        let dispatcher = Arc::new(self.build()?);
        let tunnel = Tunnel::new(options.tunnel, transport, dispatcher);
        tunnel.dial_and_serve(cancellation, &options.addr).await?;
        Ok(())
    }
}
