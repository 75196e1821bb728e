//! Tunnel configuration types.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ops_core::protocol::NAME;
use ops_core::RegisterListenerResponse;
use url::Url;

use super::auth::{Authenticator, NoopAuthenticator};
use super::backoff::Backoff;
use super::error::TunnelError;
use crate::network::HttpConfig;

/// TLS settings for the relay connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConfig {
    /// Name verified against the relay certificate. Derived from the dial
    /// address when `None`.
    pub server_name: Option<String>,
    /// ALPN protocols offered during the handshake.
    pub alpn_protocols: Vec<String>,
    /// PEM bundle of trusted roots. The public web PKI is used when `None`.
    pub ca_cert_path: Option<PathBuf>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            server_name: None,
            alpn_protocols: vec![NAME.to_string()],
            ca_cert_path: None,
        }
    }
}

impl TlsConfig {
    /// Fills in `server_name` from `addr` when it is not set explicitly.
    pub(crate) fn resolve(&self, addr: &str) -> Result<Self, TunnelError> {
        let mut tls = self.clone();
        if tls.server_name.as_deref().is_none_or(str::is_empty) {
            let host = host_from_addr(addr).ok_or_else(|| TunnelError::InvalidAddress {
                addr: addr.to_string(),
                reason: "no host to derive a TLS server name from".to_string(),
            })?;
            tls.server_name = Some(host);
        }
        Ok(tls)
    }
}

/// Connection tuning passed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Idle period after which the connection is considered dead.
    pub idle_timeout: Duration,
    /// Interval between keep-alive probes.
    pub keep_alive_interval: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(20),
            keep_alive_interval: Duration::from_secs(10),
        }
    }
}

/// Invoked once per successful registration, before any request is served.
pub type ConnectionReadyCallback = Arc<dyn Fn(&RegisterListenerResponse) + Send + Sync>;

/// Everything a [`Tunnel`](super::Tunnel) needs besides its transport and
/// dispatcher.
#[derive(Clone)]
pub struct TunnelConfig {
    /// Name the listener registers under.
    pub namespace: String,
    pub tls: TlsConfig,
    pub transport: TransportConfig,
    pub http: HttpConfig,
    pub authenticator: Arc<dyn Authenticator>,
    pub on_connection_ready: Option<ConnectionReadyCallback>,
    pub backoff: Backoff,
    /// Seeds the jitter RNG. Entropy from the OS is used when `None`.
    pub backoff_seed: Option<u64>,
}

impl TunnelConfig {
    #[must_use]
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            tls: TlsConfig::default(),
            transport: TransportConfig::default(),
            http: HttpConfig::default(),
            authenticator: Arc::new(NoopAuthenticator),
            on_connection_ready: None,
            backoff: Backoff::default(),
            backoff_seed: None,
        }
    }

    #[must_use]
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    #[must_use]
    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    #[must_use]
    pub fn with_http(mut self, http: HttpConfig) -> Self {
        self.http = http;
        self
    }

    #[must_use]
    pub fn with_authenticator(mut self, authenticator: impl Authenticator + 'static) -> Self {
        self.authenticator = Arc::new(authenticator);
        self
    }

    #[must_use]
    pub fn on_connection_ready(
        mut self,
        callback: impl Fn(&RegisterListenerResponse) + Send + Sync + 'static,
    ) -> Self {
        self.on_connection_ready = Some(Arc::new(callback));
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    #[must_use]
    pub fn with_backoff_seed(mut self, seed: u64) -> Self {
        self.backoff_seed = Some(seed);
        self
    }
}

impl fmt::Debug for TunnelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelConfig")
            .field("namespace", &self.namespace)
            .field("tls", &self.tls)
            .field("transport", &self.transport)
            .field("http", &self.http)
            .field("on_connection_ready", &self.on_connection_ready.is_some())
            .field("backoff", &self.backoff)
            .field("backoff_seed", &self.backoff_seed)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Address parsing
// ---------------------------------------------------------------------------

/// Splits `host:port`, accepting bracketed IPv6 hosts.
pub(crate) fn split_host_port(addr: &str) -> Option<(&str, &str)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = tail.strip_prefix(':')?;
        return Some((host, port));
    }
    let (host, port) = addr.rsplit_once(':')?;
    if host.contains(':') {
        return None;
    }
    Some((host, port))
}

/// Host component of a `scheme://host:port` or bare `host:port` address.
pub(crate) fn host_from_addr(addr: &str) -> Option<String> {
    let host = if addr.contains("://") {
        let url = Url::parse(addr).ok()?;
        url.host_str()?.trim_matches(['[', ']']).to_string()
    } else {
        split_host_port(addr)?.0.to_string()
    };
    (!host.is_empty()).then_some(host)
}

/// `host:port` suitable for name resolution, with a scheme stripped.
pub(crate) fn socket_target(addr: &str) -> Option<String> {
    if addr.contains("://") {
        let url = Url::parse(addr).ok()?;
        let host = url.host_str()?;
        let port = url.port_or_known_default()?;
        return Some(format!("{host}:{port}"));
    }
    split_host_port(addr).map(|_| addr.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_name_from_host_port() {
        let tls = TlsConfig::default().resolve("relay.example.com:443").unwrap();
        assert_eq!(tls.server_name.as_deref(), Some("relay.example.com"));
        assert_eq!(tls.alpn_protocols, ["lightwave"]);
    }

    #[test]
    fn server_name_from_url() {
        let tls = TlsConfig::default().resolve("https://relay.example.com:8443").unwrap();
        assert_eq!(tls.server_name.as_deref(), Some("relay.example.com"));
    }

    #[test]
    fn server_name_from_ipv6() {
        let tls = TlsConfig::default().resolve("[::1]:443").unwrap();
        assert_eq!(tls.server_name.as_deref(), Some("::1"));
    }

    #[test]
    fn explicit_server_name_wins() {
        let tls = TlsConfig {
            server_name: Some("override.internal".to_string()),
            ..TlsConfig::default()
        }
        .resolve("relay.example.com:443")
        .unwrap();
        assert_eq!(tls.server_name.as_deref(), Some("override.internal"));
    }

    #[test]
    fn address_without_host_is_invalid() {
        for addr in [":443", "relay", ""] {
            let err = TlsConfig::default().resolve(addr).unwrap_err();
            assert!(matches!(err, TunnelError::InvalidAddress { .. }), "{addr}");
        }
    }

    #[test]
    fn socket_target_strips_scheme() {
        assert_eq!(
            socket_target("https://relay.example.com").as_deref(),
            Some("relay.example.com:443")
        );
        assert_eq!(socket_target("relay:7000").as_deref(), Some("relay:7000"));
        assert_eq!(socket_target("relay"), None);
    }

    #[test]
    fn transport_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.idle_timeout, Duration::from_secs(20));
        assert_eq!(config.keep_alive_interval, Duration::from_secs(10));
    }

    #[test]
    fn tunnel_config_builder() {
        let config = TunnelConfig::new("ns")
            .with_backoff_seed(3)
            .on_connection_ready(|_| {});
        assert_eq!(config.namespace, "ns");
        assert_eq!(config.backoff_seed, Some(3));
        assert!(config.on_connection_ready.is_some());
        assert!(format!("{config:?}").contains("\"ns\""));
    }
}
