//! Attaching credentials to the registration request.

use async_trait::async_trait;
use ops_core::RegisterListenerRequest;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Metadata key carrying bearer credentials.
pub const AUTHORIZATION_METADATA_KEY: &str = "Authorization";

/// Populates a [`RegisterListenerRequest`] before it is sent.
///
/// Called once per dial attempt. An error aborts that attempt; the request
/// is discarded with it.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(
        &self,
        cancellation: &CancellationToken,
        request: &mut RegisterListenerRequest,
    ) -> anyhow::Result<()>;
}

/// Leaves the request untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAuthenticator;

#[async_trait]
impl Authenticator for NoopAuthenticator {
    async fn authenticate(
        &self,
        _cancellation: &CancellationToken,
        request: &mut RegisterListenerRequest,
    ) -> anyhow::Result<()> {
        warn!(
            namespace = %request.service,
            "no authenticator configured; registering without credentials"
        );
        Ok(())
    }
}

/// Sets `Authorization: Bearer <token>` in the request metadata.
#[derive(Clone)]
pub struct BearerAuthenticator {
    token: String,
}

impl BearerAuthenticator {
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl std::fmt::Debug for BearerAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BearerAuthenticator")
            .field("token", &"<redacted>")
            .finish()
    }
}

#[async_trait]
impl Authenticator for BearerAuthenticator {
    async fn authenticate(
        &self,
        _cancellation: &CancellationToken,
        request: &mut RegisterListenerRequest,
    ) -> anyhow::Result<()> {
        request.metadata.insert(
            AUTHORIZATION_METADATA_KEY.to_string(),
            format!("Bearer {}", self.token),
        );
        Ok(())
    }
}

/// Adapts a synchronous closure into an [`Authenticator`].
#[derive(Clone)]
pub struct AuthenticatorFn<F>(pub F);

impl<F> std::fmt::Debug for AuthenticatorFn<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AuthenticatorFn")
    }
}

#[async_trait]
impl<F> Authenticator for AuthenticatorFn<F>
where
    F: Fn(&CancellationToken, &mut RegisterListenerRequest) -> anyhow::Result<()> + Send + Sync,
{
    async fn authenticate(
        &self,
        cancellation: &CancellationToken,
        request: &mut RegisterListenerRequest,
    ) -> anyhow::Result<()> {
        (self.0)(cancellation, request)
    }
}
