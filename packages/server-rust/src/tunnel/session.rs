//! Tunnel session state, published through a `watch` channel.

use tokio::sync::watch;
use tracing::debug;

/// Where a tunnel is in its connection lifecycle.
///
/// State machine: Idle -> Dialing -> Registering -> Serving -> Closed, with
/// a failed attempt moving to `Closed { clean: false }` and the next attempt
/// going back to `Dialing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No attempt has started.
    Idle,
    /// Opening the transport connection.
    Dialing,
    /// Exchanging the registration handshake.
    Registering,
    /// Registered; relayed requests are being served.
    Serving,
    /// The last attempt ended. `clean` is true for a clean close or cancellation.
    Closed { clean: bool },
}

impl SessionState {
    /// Returns a lowercase string label for the state.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Dialing => "dialing",
            Self::Registering => "registering",
            Self::Serving => "serving",
            Self::Closed { clean: true } => "closed",
            Self::Closed { clean: false } => "failed",
        }
    }
}

/// Owner side of the session state channel.
#[derive(Debug)]
pub(crate) struct SessionWatch {
    tx: watch::Sender<SessionState>,
}

impl SessionWatch {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(SessionState::Idle);
        Self { tx }
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }

    pub(crate) fn current(&self) -> SessionState {
        *self.tx.borrow()
    }

    /// Publishes `state` even when nobody is subscribed.
    pub(crate) fn set(&self, state: SessionState) {
        let previous = self.tx.send_replace(state);
        if previous != state {
            debug!(from = previous.as_str(), to = state.as_str(), "session state changed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_idle() {
        let session = SessionWatch::new();
        assert_eq!(session.current(), SessionState::Idle);
    }

    #[test]
    fn set_without_subscribers_is_kept() {
        let session = SessionWatch::new();
        session.set(SessionState::Dialing);
        assert_eq!(session.current(), SessionState::Dialing);
    }

    #[tokio::test]
    async fn subscribers_observe_transitions() {
        let session = SessionWatch::new();
        let mut rx = session.subscribe();

        session.set(SessionState::Serving);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), SessionState::Serving);
    }

    #[test]
    fn labels() {
        assert_eq!(SessionState::Closed { clean: true }.as_str(), "closed");
        assert_eq!(SessionState::Closed { clean: false }.as_str(), "failed");
        assert_eq!(SessionState::Registering.as_str(), "registering");
    }
}
