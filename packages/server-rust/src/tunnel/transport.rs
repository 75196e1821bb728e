//! The seam between the tunnel lifecycle and a concrete multiplexed transport.

use async_trait::async_trait;
use axum::Router;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use super::config::{TlsConfig, TransportConfig};
use crate::network::HttpConfig;

/// An open, multiplexed connection to a relay.
///
/// Clones refer to the same connection.
#[async_trait]
pub trait TunnelConnection: Clone + Send + Sync + 'static {
    type SendStream: AsyncWrite + Send + Unpin + 'static;
    type RecvStream: AsyncRead + Send + Unpin + 'static;

    /// Opens a new bidirectional stream.
    async fn open_stream(&self) -> anyhow::Result<(Self::SendStream, Self::RecvStream)>;

    /// Closes the connection with an application close code.
    fn close(&self, code: u32, reason: &str);
}

/// Dials relays and serves relayed requests on the resulting connections.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Connection: TunnelConnection;

    /// Opens a connection to `addr`. `tls.server_name` is already resolved.
    async fn dial(
        &self,
        addr: &str,
        tls: &TlsConfig,
        config: &TransportConfig,
    ) -> anyhow::Result<Self::Connection>;

    /// Serves requests arriving on `connection` with `router` until the
    /// connection ends or `cancellation` fires. `Ok(())` means a clean close.
    ///
    /// `http` carries the limits `router` was built with; transports that
    /// buffer request bodies themselves must stop at `http.max_body_bytes`.
    async fn serve(
        &self,
        connection: Self::Connection,
        router: Router,
        http: &HttpConfig,
        cancellation: CancellationToken,
    ) -> anyhow::Result<()>;
}
