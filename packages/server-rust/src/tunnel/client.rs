//! The dial-out tunnel: connect, register, serve, retry.

use std::sync::Arc;

use axum::Router;
use ops_core::protocol::APPLICATION_OK;
use ops_core::{Decoder, Encoder, RegisterListenerRequest, RegisterListenerResponse};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument, Span};

use super::backoff::retry;
use super::config::{split_host_port, TlsConfig, TunnelConfig};
use super::error::TunnelError;
use super::session::{SessionState, SessionWatch};
use super::transport::{Transport, TunnelConnection};
use crate::network::build_router;
use crate::service::Dispatcher;

/// Keeps a listener registered with a relay and serves the relayed requests
/// with a compiled [`Dispatcher`].
pub struct Tunnel<T: Transport> {
    config: TunnelConfig,
    transport: T,
    dispatcher: Arc<Dispatcher>,
    session: SessionWatch,
}

impl<T: Transport> Tunnel<T> {
    #[must_use]
    pub fn new(config: TunnelConfig, transport: T, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            config,
            transport,
            dispatcher,
            session: SessionWatch::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    /// Receives every session state transition.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.session.subscribe()
    }

    /// Current session state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.session.current()
    }

    /// Dials `addr`, registers, and serves until the connection closes.
    ///
    /// Failed attempts are retried under the configured backoff. Returns
    /// `Ok(())` after a clean close, [`TunnelError::Cancelled`] once
    /// `cancellation` fires, and otherwise the error of the last attempt.
    pub async fn dial_and_serve(
        &self,
        cancellation: &CancellationToken,
        addr: &str,
    ) -> Result<(), TunnelError> {
        self.run(cancellation, addr)
            .instrument(tunnel_span(addr, &self.config.namespace))
            .await
    }

    async fn run(&self, cancellation: &CancellationToken, addr: &str) -> Result<(), TunnelError> {
        let tls = self.config.tls.resolve(addr)?;
        let router = build_router(
            Arc::clone(&self.dispatcher),
            &self.config.http,
            cancellation.clone(),
        );
        let mut rng = match self.config.backoff_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        let tls = &tls;
        let router = &router;
        retry(&self.config.backoff, &mut rng, cancellation, move |step| {
            self.attempt(cancellation, addr, tls, router.clone(), step)
        })
        .await
    }

    /// One dial, register, serve cycle.
    async fn attempt(
        &self,
        cancellation: &CancellationToken,
        addr: &str,
        tls: &TlsConfig,
        router: Router,
        step: u32,
    ) -> Result<(), TunnelError> {
        let result = self.connect_and_serve(cancellation, addr, tls, router, step).await;
        let clean = matches!(result, Ok(()) | Err(TunnelError::Cancelled));
        self.session.set(SessionState::Closed { clean });
        result
    }

    async fn connect_and_serve(
        &self,
        cancellation: &CancellationToken,
        addr: &str,
        tls: &TlsConfig,
        router: Router,
        step: u32,
    ) -> Result<(), TunnelError> {
        self.session.set(SessionState::Dialing);
        debug!(attempt = step + 1, "dialing relay");
        let connection = tokio::select! {
            biased;
            () = cancellation.cancelled() => return Err(TunnelError::Cancelled),
            dialed = self.transport.dial(addr, tls, &self.config.transport) => {
                dialed.map_err(TunnelError::Dial)?
            }
        };

        // Closes the connection cleanly when the caller cancels; exits quietly
        // once this attempt is over.
        let attempt_done = CancellationToken::new();
        let _attempt_guard = attempt_done.clone().drop_guard();
        tokio::spawn(close_on_cancel(
            connection.clone(),
            cancellation.clone(),
            attempt_done,
        ));

        self.session.set(SessionState::Registering);
        let response = tokio::select! {
            biased;
            () = cancellation.cancelled() => return Err(TunnelError::Cancelled),
            registered = self.register(cancellation, &connection) => registered?,
        };

        if let Some(ready) = &self.config.on_connection_ready {
            ready(&response);
        }

        info!("registered with relay; serving requests");
        self.session.set(SessionState::Serving);
        let serving = self.transport.serve(
            connection,
            router,
            &self.config.http,
            cancellation.clone(),
        );
        tokio::select! {
            biased;
            () = cancellation.cancelled() => Err(TunnelError::Cancelled),
            served = serving => {
                if cancellation.is_cancelled() {
                    return Err(TunnelError::Cancelled);
                }
                served.map_err(TunnelError::Serve)
            }
        }
    }

    /// Runs the registration handshake on a fresh stream.
    async fn register(
        &self,
        cancellation: &CancellationToken,
        connection: &T::Connection,
    ) -> Result<RegisterListenerResponse, TunnelError> {
        let (send, recv) = connection
            .open_stream()
            .await
            .map_err(TunnelError::OpenStream)?;
        let mut encoder = Encoder::new(send);
        let mut decoder = Decoder::new(recv);

        let result = self
            .handshake(cancellation, &mut encoder, &mut decoder)
            .await;

        if let Err(err) = encoder.close().await {
            debug!(error = %err, "closing registration stream");
        }
        decoder.close();
        result
    }

    async fn handshake(
        &self,
        cancellation: &CancellationToken,
        encoder: &mut Encoder<<T::Connection as TunnelConnection>::SendStream>,
        decoder: &mut Decoder<<T::Connection as TunnelConnection>::RecvStream>,
    ) -> Result<RegisterListenerResponse, TunnelError> {
        let mut request = RegisterListenerRequest::new(self.config.namespace.clone());
        self.config
            .authenticator
            .authenticate(cancellation, &mut request)
            .await
            .map_err(TunnelError::Authenticate)?;

        encoder
            .encode(&request)
            .await
            .map_err(TunnelError::Encode)?;
        let response: RegisterListenerResponse =
            decoder.decode().await.map_err(TunnelError::Decode)?;

        if !response.code.is_ok() {
            return Err(TunnelError::UnexpectedResponseCode(response.code));
        }
        Ok(response)
    }
}

impl<T: Transport + std::fmt::Debug> std::fmt::Debug for Tunnel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("config", &self.config)
            .field("transport", &self.transport)
            .field("state", &self.session.current())
            .finish_non_exhaustive()
    }
}

async fn close_on_cancel<C: TunnelConnection>(
    connection: C,
    cancellation: CancellationToken,
    attempt_done: CancellationToken,
) {
    tokio::select! {
        biased;
        () = cancellation.cancelled() => {
            debug!("cancelled; closing relay connection");
            connection.close(APPLICATION_OK, "");
        }
        () = attempt_done.cancelled() => {}
    }
}

fn tunnel_span(addr: &str, namespace: &str) -> Span {
    match split_host_port(addr) {
        Some((host, port)) => info_span!("tunnel", %namespace, %host, %port),
        None => info_span!("tunnel", %namespace, %addr),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use axum::body::Body;
    use http::Request;
    use ops_core::ResponseCode;
    use serde::Deserialize;
    use utoipa::ToSchema;

    use super::*;
    use crate::service::{CallContext, Registry, ServiceDescriptor, ServiceMetadata};
    use crate::tunnel::auth::{BearerAuthenticator, AUTHORIZATION_METADATA_KEY};
    use crate::tunnel::memory::{MemoryRelay, MemoryTransport};

    struct Example;

    #[derive(Deserialize, ToSchema)]
    struct FooInput {
        bar: String,
    }

    async fn foo(_svc: Arc<Example>, _ctx: CallContext, input: FooInput) -> anyhow::Result<String> {
        Ok(format!("hello {}", input.bar))
    }

    fn dispatcher() -> Arc<Dispatcher> {
        let mut registry = Registry::new();
        registry.register(
            ServiceDescriptor::new(Example)
                .metadata(ServiceMetadata::new("example"))
                .operation("Foo", foo),
        );
        Arc::new(registry.build().unwrap())
    }

    fn tunnel(relay: &MemoryRelay, config: TunnelConfig) -> Arc<Tunnel<MemoryTransport>> {
        Arc::new(Tunnel::new(
            config.with_backoff_seed(11),
            relay.transport(),
            dispatcher(),
        ))
    }

    fn spawn_tunnel(
        tunnel: &Arc<Tunnel<MemoryTransport>>,
        token: &CancellationToken,
        addr: &'static str,
    ) -> tokio::task::JoinHandle<Result<(), TunnelError>> {
        let tunnel = Arc::clone(tunnel);
        let token = token.clone();
        tokio::spawn(async move { tunnel.dial_and_serve(&token, addr).await })
    }

    #[tokio::test]
    async fn serves_relayed_requests_until_cancelled() {
        let relay = MemoryRelay::new();
        let token = CancellationToken::new();
        let tunnel = tunnel(&relay, TunnelConfig::new("billing"));
        let mut states = tunnel.subscribe_state();
        let handle = spawn_tunnel(&tunnel, &token, "relay.example.com:443");

        let listener = relay.accept().await.unwrap();
        assert_eq!(listener.registration().service, "billing");
        assert_eq!(listener.registration().version, ops_core::protocol::VERSION);
        states
            .wait_for(|s| *s == SessionState::Serving)
            .await
            .unwrap();

        let response = listener
            .send(
                Request::post("/example/Foo")
                    .body(Body::from(r#"{"bar":"testing"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], br#""hello testing""#);

        token.cancel();
        assert!(handle.await.unwrap().unwrap_err().is_cancelled());
        assert_eq!(listener.closed().await.0, APPLICATION_OK);
        assert_eq!(tunnel.state(), SessionState::Closed { clean: true });
        assert_eq!(
            relay.server_names(),
            [Some("relay.example.com".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_five_attempts_with_the_last_error() {
        let relay = MemoryRelay::new();
        relay.refuse_all_dials(true);
        let tunnel = tunnel(&relay, TunnelConfig::new("billing"));

        let err = tunnel
            .dial_and_serve(&CancellationToken::new(), "relay:443")
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::Dial(_)), "{err}");
        assert!(err.to_string().contains("connection refused"), "{err}");
        assert_eq!(relay.dial_count(), 5);
        assert_eq!(tunnel.state(), SessionState::Closed { clean: false });
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_dial_failures() {
        let relay = MemoryRelay::new();
        relay.refuse_next_dials(2);
        let token = CancellationToken::new();
        let tunnel = tunnel(&relay, TunnelConfig::new("billing"));
        let handle = spawn_tunnel(&tunnel, &token, "relay:443");

        let listener = relay.accept().await.unwrap();
        assert_eq!(relay.dial_count(), 3);
        listener.close(APPLICATION_OK, "relay shutting down");
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_registration_names_the_code() {
        let relay = MemoryRelay::new();
        relay.respond_with(ResponseCode::Unauthorized);
        let ready_calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&ready_calls);
        let config = TunnelConfig::new("billing").on_connection_ready(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let tunnel = tunnel(&relay, config);

        let err = tunnel
            .dial_and_serve(&CancellationToken::new(), "relay:443")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TunnelError::UnexpectedResponseCode(ResponseCode::Unauthorized)
        ));
        assert_eq!(relay.registrations().len(), 5);
        assert_eq!(ready_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn ready_callback_runs_once_before_serving() {
        let relay = MemoryRelay::new();
        let token = CancellationToken::new();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let record = Arc::clone(&seen);
        let config = TunnelConfig::new("billing").on_connection_ready(move |response| {
            record.lock().push(response.code);
        });
        let tunnel = tunnel(&relay, config);
        let mut states = tunnel.subscribe_state();
        let handle = spawn_tunnel(&tunnel, &token, "relay:443");

        states
            .wait_for(|s| *s == SessionState::Serving)
            .await
            .unwrap();
        assert_eq!(*seen.lock(), [ResponseCode::Ok]);

        token.cancel();
        assert!(handle.await.unwrap().unwrap_err().is_cancelled());
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn bearer_token_reaches_the_relay() {
        let relay = MemoryRelay::new();
        let token = CancellationToken::new();
        let config =
            TunnelConfig::new("billing").with_authenticator(BearerAuthenticator::new("s3cret"));
        let tunnel = tunnel(&relay, config);
        let handle = spawn_tunnel(&tunnel, &token, "relay:443");

        let listener = relay.accept().await.unwrap();
        assert_eq!(
            listener
                .registration()
                .metadata
                .get(AUTHORIZATION_METADATA_KEY)
                .map(String::as_str),
            Some("Bearer s3cret")
        );
        token.cancel();
        assert!(handle.await.unwrap().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_backoff_returns_cancelled() {
        let relay = MemoryRelay::new();
        relay.refuse_all_dials(true);
        let token = CancellationToken::new();
        let tunnel = tunnel(&relay, TunnelConfig::new("billing"));
        let handle = spawn_tunnel(&tunnel, &token, "relay:443");

        tokio::time::sleep(Duration::from_millis(150)).await;
        token.cancel();
        let err = handle.await.unwrap().unwrap_err();
        assert!(err.is_cancelled(), "{err}");
        assert!(relay.dial_count() < 5);
    }

    #[tokio::test]
    async fn cancellation_during_dial_returns_cancelled() {
        let relay = MemoryRelay::new();
        relay.stall_dials(true);
        let token = CancellationToken::new();
        let tunnel = tunnel(&relay, TunnelConfig::new("billing"));
        let mut states = tunnel.subscribe_state();
        let handle = spawn_tunnel(&tunnel, &token, "relay:443");

        states
            .wait_for(|s| *s == SessionState::Dialing)
            .await
            .unwrap();
        token.cancel();
        assert!(handle.await.unwrap().unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn cancellation_during_registration_closes_cleanly() {
        let relay = MemoryRelay::new();
        relay.stall_registrations(true);
        let token = CancellationToken::new();
        let tunnel = tunnel(&relay, TunnelConfig::new("billing"));
        let handle = spawn_tunnel(&tunnel, &token, "relay:443");

        let listener = relay.accept().await.unwrap();
        assert_eq!(listener.registration().service, "billing");
        assert_eq!(tunnel.state(), SessionState::Registering);

        token.cancel();
        assert!(handle.await.unwrap().unwrap_err().is_cancelled());
        assert_eq!(listener.closed().await.0, APPLICATION_OK);
        assert_eq!(relay.dial_count(), 1);
        assert_eq!(tunnel.state(), SessionState::Closed { clean: true });
    }

    #[tokio::test(start_paused = true)]
    async fn abnormal_close_is_retried() {
        let relay = MemoryRelay::new();
        let token = CancellationToken::new();
        let tunnel = tunnel(&relay, TunnelConfig::new("billing"));
        let handle = spawn_tunnel(&tunnel, &token, "relay:443");

        let first = relay.accept().await.unwrap();
        first.close(42, "relay restarting");
        let second = relay.accept().await.unwrap();
        assert_eq!(relay.dial_count(), 2);

        second.close(APPLICATION_OK, "");
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn address_without_host_fails_immediately() {
        let relay = MemoryRelay::new();
        let tunnel = tunnel(&relay, TunnelConfig::new("billing"));
        let err = tunnel
            .dial_and_serve(&CancellationToken::new(), "no-port")
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::InvalidAddress { .. }));
        assert_eq!(relay.dial_count(), 0);
    }
}
