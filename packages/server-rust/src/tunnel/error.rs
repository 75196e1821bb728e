use ops_core::{CodecError, ResponseCode};

/// Why a [`Tunnel`](super::Tunnel) stopped.
///
/// Everything except `Cancelled` and `InvalidAddress` is retried under the
/// tunnel's backoff policy; the variant returned is the last attempt's.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("tunnel cancelled")]
    Cancelled,

    #[error("invalid dial address {addr:?}: {reason}")]
    InvalidAddress { addr: String, reason: String },

    #[error("dial error: {0:#}")]
    Dial(#[source] anyhow::Error),

    #[error("opening registration stream: {0:#}")]
    OpenStream(#[source] anyhow::Error),

    #[error("authenticating register listener request: {0:#}")]
    Authenticate(#[source] anyhow::Error),

    #[error("encoding register listener request: {0}")]
    Encode(#[source] CodecError),

    #[error("decoding register listener response: {0}")]
    Decode(#[source] CodecError),

    #[error("unexpected response code: {0}")]
    UnexpectedResponseCode(ResponseCode),

    #[error("serving connection: {0:#}")]
    Serve(#[source] anyhow::Error),
}

impl TunnelError {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Errors that no further attempt can fix.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::InvalidAddress { .. })
    }
}
