//! QUIC transport: `quinn` for the connection, `h3` for relayed requests.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Router;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use h3::error::ErrorLevel;
use h3::server::RequestStream;
use ops_core::protocol::APPLICATION_OK;
use quinn::crypto::rustls::QuicClientConfig;
use quinn::{ConnectionError, VarInt};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing::{debug, error};

use super::config::{socket_target, TlsConfig, TransportConfig};
use super::transport::{Transport, TunnelConnection};
use crate::network::HttpConfig;

/// Dials relays over QUIC and serves HTTP/3 requests they forward.
#[derive(Debug, Clone)]
pub struct QuicTransport {
    bind_addr: SocketAddr,
}

impl Default for QuicTransport {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
        }
    }
}

impl QuicTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Local address the client endpoint binds to.
    #[must_use]
    pub fn with_bind_addr(mut self, bind_addr: SocketAddr) -> Self {
        self.bind_addr = bind_addr;
        self
    }
}

/// An established QUIC connection. The endpoint is kept alive with it.
#[derive(Debug, Clone)]
pub struct QuicConnection {
    connection: quinn::Connection,
    _endpoint: quinn::Endpoint,
}

#[async_trait]
impl TunnelConnection for QuicConnection {
    type SendStream = quinn::SendStream;
    type RecvStream = quinn::RecvStream;

    async fn open_stream(&self) -> anyhow::Result<(quinn::SendStream, quinn::RecvStream)> {
        Ok(self.connection.open_bi().await?)
    }

    fn close(&self, code: u32, reason: &str) {
        self.connection
            .close(VarInt::from_u32(code), reason.as_bytes());
    }
}

#[async_trait]
impl Transport for QuicTransport {
    type Connection = QuicConnection;

    async fn dial(
        &self,
        addr: &str,
        tls: &TlsConfig,
        config: &TransportConfig,
    ) -> anyhow::Result<QuicConnection> {
        let target = socket_target(addr).ok_or_else(|| anyhow!("address {addr:?} has no port"))?;
        let remote = tokio::net::lookup_host(&target)
            .await
            .with_context(|| format!("resolving {target}"))?
            .next()
            .ok_or_else(|| anyhow!("no addresses found for {target}"))?;
        let server_name = tls
            .server_name
            .as_deref()
            .ok_or_else(|| anyhow!("no TLS server name for {addr}"))?;

        let mut client_config =
            quinn::ClientConfig::new(Arc::new(QuicClientConfig::try_from(client_crypto(tls)?)?));
        client_config.transport_config(Arc::new(transport_config(config)?));

        let mut endpoint = quinn::Endpoint::client(self.bind_addr)?;
        endpoint.set_default_client_config(client_config);
        let connection = endpoint.connect(remote, server_name)?.await?;
        debug!(%remote, "QUIC connection established");

        Ok(QuicConnection {
            connection,
            _endpoint: endpoint,
        })
    }

    async fn serve(
        &self,
        connection: QuicConnection,
        router: Router,
        http: &HttpConfig,
        cancellation: CancellationToken,
    ) -> anyhow::Result<()> {
        let quic = connection.connection.clone();
        let mut h3_conn: h3::server::Connection<h3_quinn::Connection, Bytes> =
            h3::server::builder()
                .build(h3_quinn::Connection::new(connection.connection))
                .await?;
        let max_body_bytes = http.max_body_bytes;

        loop {
            let accepted = tokio::select! {
                () = cancellation.cancelled() => return Ok(()),
                accepted = h3_conn.accept() => accepted,
            };
            match accepted {
                Ok(Some((request, stream))) => {
                    let router = router.clone();
                    tokio::spawn(async move {
                        let handled = handle_request(router, request, stream, max_body_bytes);
                        if let Err(err) = handled.await {
                            debug!(error = %err, "relayed request failed");
                        }
                    });
                }
                Ok(None) => return Ok(()),
                Err(err) => match err.get_error_level() {
                    ErrorLevel::ConnectionError => {
                        if closed_cleanly(quic.close_reason().as_ref()) {
                            debug!("relay closed the connection");
                            return Ok(());
                        }
                        error!(error = %err, "HTTP/3 connection failed");
                        return Err(err.into());
                    }
                    ErrorLevel::StreamError => debug!(error = %err, "HTTP/3 stream error"),
                },
            }
        }
    }
}

/// A peer close with [`APPLICATION_OK`] ends serving without an error.
fn closed_cleanly(reason: Option<&ConnectionError>) -> bool {
    matches!(
        reason,
        Some(ConnectionError::ApplicationClosed(close))
            if close.error_code == VarInt::from_u32(APPLICATION_OK)
    )
}

/// Request body buffered up to `limit` bytes.
#[derive(Debug)]
struct LimitedBody {
    buf: BytesMut,
    limit: usize,
}

#[derive(Debug, PartialEq, Eq)]
struct BodyTooLarge;

impl LimitedBody {
    fn new(limit: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            limit,
        }
    }

    /// Appends `chunk`, or refuses it without buffering when the total
    /// would exceed the limit.
    fn push<B: Buf>(&mut self, chunk: B) -> Result<(), BodyTooLarge> {
        if self.buf.len().saturating_add(chunk.remaining()) > self.limit {
            return Err(BodyTooLarge);
        }
        self.buf.put(chunk);
        Ok(())
    }

    fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

async fn handle_request(
    router: Router,
    request: http::Request<()>,
    mut stream: RequestStream<h3_quinn::BidiStream<Bytes>, Bytes>,
    max_body_bytes: usize,
) -> anyhow::Result<()> {
    let mut body = LimitedBody::new(max_body_bytes);
    let mut too_large = false;
    while let Some(chunk) = stream.recv_data().await? {
        if body.push(chunk).is_err() {
            too_large = true;
            break;
        }
    }

    let response = if too_large {
        debug!(limit = max_body_bytes, "relayed request body too large");
        (StatusCode::PAYLOAD_TOO_LARGE, "length limit exceeded").into_response()
    } else {
        let (parts, ()) = request.into_parts();
        let request = http::Request::from_parts(parts, Body::from(body.freeze()));
        router
            .oneshot(request)
            .await
            .unwrap_or_else(|never| match never {})
    };

    let (parts, body) = response.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX).await?;
    stream
        .send_response(http::Response::from_parts(parts, ()))
        .await?;
    if !bytes.is_empty() {
        stream.send_data(bytes).await?;
    }
    stream.finish().await?;
    Ok(())
}

fn client_crypto(tls: &TlsConfig) -> anyhow::Result<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    match &tls.ca_cert_path {
        Some(path) => {
            let pem = std::fs::read(path)
                .with_context(|| format!("reading CA bundle {}", path.display()))?;
            for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
                roots.add(cert?)?;
            }
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }

    let mut crypto = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    crypto.alpn_protocols = tls
        .alpn_protocols
        .iter()
        .map(|p| p.as_bytes().to_vec())
        .collect();
    Ok(crypto)
}

fn transport_config(config: &TransportConfig) -> anyhow::Result<quinn::TransportConfig> {
    let mut transport = quinn::TransportConfig::default();
    transport
        .max_idle_timeout(Some(quinn::IdleTimeout::try_from(config.idle_timeout)?))
        .keep_alive_interval(Some(config.keep_alive_interval));
    Ok(transport)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use super::*;

    #[test]
    fn client_crypto_offers_configured_alpn() {
        let crypto = client_crypto(&TlsConfig::default()).unwrap();
        assert_eq!(crypto.alpn_protocols, [b"lightwave".to_vec()]);
    }

    #[test]
    fn missing_ca_bundle_is_an_error() {
        let tls = TlsConfig {
            ca_cert_path: Some(PathBuf::from("/nonexistent/ca.pem")),
            ..TlsConfig::default()
        };
        let err = client_crypto(&tls).unwrap_err();
        assert!(err.to_string().contains("reading CA bundle"));
    }

    fn application_close(code: u32) -> ConnectionError {
        ConnectionError::ApplicationClosed(quinn::ApplicationClose {
            error_code: VarInt::from_u32(code),
            reason: Bytes::from_static(b"bye"),
        })
    }

    #[test]
    fn only_an_application_ok_close_is_clean() {
        assert!(closed_cleanly(Some(&application_close(APPLICATION_OK))));
        assert!(!closed_cleanly(Some(&application_close(42))));
        assert!(!closed_cleanly(Some(&ConnectionError::TimedOut)));
        assert!(!closed_cleanly(None));
    }

    #[test]
    fn body_within_limit_is_buffered() {
        let mut body = LimitedBody::new(8);
        body.push(Bytes::from_static(b"abcd")).unwrap();
        body.push(&b"efgh"[..]).unwrap();
        assert_eq!(body.freeze(), Bytes::from_static(b"abcdefgh"));
    }

    #[test]
    fn body_over_limit_is_refused() {
        let mut body = LimitedBody::new(8);
        body.push(Bytes::from_static(b"abcdef")).unwrap();
        assert_eq!(body.push(Bytes::from_static(b"ghi")), Err(BodyTooLarge));
        assert_eq!(body.freeze().len(), 6);
    }

    #[test]
    fn transport_config_accepts_defaults() {
        assert!(transport_config(&TransportConfig::default()).is_ok());
        let huge = TransportConfig {
            idle_timeout: Duration::MAX,
            ..TransportConfig::default()
        };
        assert!(transport_config(&huge).is_err());
    }
}
