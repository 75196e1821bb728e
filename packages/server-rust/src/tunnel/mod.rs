//! Dial-out tunnel: keeps a listener registered with a relay and serves the
//! requests it forwards.
//!
//! A [`Tunnel`] dials through a [`Transport`], registers its namespace with a
//! one-message-each-way handshake on a dedicated stream, then hands the
//! connection to the transport's request loop. Failures are retried under a
//! bounded [`Backoff`]; cancellation is terminal.

pub mod auth;
pub mod backoff;
pub mod client;
pub mod config;
pub mod error;
pub mod memory;
#[cfg(feature = "quic")]
pub mod quic;
pub mod session;
pub mod transport;

pub use auth::{Authenticator, AuthenticatorFn, BearerAuthenticator, NoopAuthenticator};
pub use backoff::Backoff;
pub use client::Tunnel;
pub use config::{ConnectionReadyCallback, TlsConfig, TransportConfig, TunnelConfig};
pub use error::TunnelError;
pub use memory::{AcceptedListener, MemoryRelay, MemoryTransport};
#[cfg(feature = "quic")]
pub use quic::QuicTransport;
pub use session::SessionState;
pub use transport::{Transport, TunnelConnection};
