//! Per-call context handed to every operation handler.

use tokio_util::sync::CancellationToken;

/// Context carried with every operation call.
///
/// Always the first argument of an operation handler. Cloning is cheap.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    cancellation: CancellationToken,
    request_id: Option<String>,
}

impl CallContext {
    /// Creates a context that is never cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a context bound to `token`.
    #[must_use]
    pub fn with_cancellation(token: CancellationToken) -> Self {
        Self {
            cancellation: token,
            request_id: None,
        }
    }

    /// Attaches the transport-level request ID.
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Token cancelled when the caller stops caring about the result.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// The `x-request-id` of the HTTP request that triggered this call, if any.
    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_context_is_not_cancelled() {
        let ctx = CallContext::new();
        assert!(!ctx.is_cancelled());
        assert!(ctx.request_id().is_none());
    }

    #[test]
    fn context_observes_its_token() {
        let token = CancellationToken::new();
        let ctx = CallContext::with_cancellation(token.clone()).with_request_id("req-1");
        assert_eq!(ctx.request_id(), Some("req-1"));
        token.cancel();
        assert!(ctx.is_cancelled());
    }
}
