//! In-process transport and relay.
//!
//! [`MemoryTransport`] dials a [`MemoryRelay`] living in the same process.
//! The relay answers every registration with a configurable
//! [`ResponseCode`] and hands accepted listeners out through
//! [`MemoryRelay::accept`], after which HTTP requests can be sent through the
//! listener's router. Used for loopback wiring and for tests of the tunnel
//! lifecycle.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use axum::body::Body;
use axum::response::Response;
use axum::Router;
use http::Request;
use ops_core::protocol::{read_message, write_message, APPLICATION_OK, MAX_MESSAGE_SIZE};
use ops_core::{RegisterListenerRequest, RegisterListenerResponse, ResponseCode};
use parking_lot::Mutex;
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing::debug;

use super::config::{TlsConfig, TransportConfig};
use super::transport::{Transport, TunnelConnection};
use crate::network::HttpConfig;

struct RelayedRequest {
    request: Request<Body>,
    reply: oneshot::Sender<Response>,
}

// ---------------------------------------------------------------------------
// Link: state shared by both ends of one connection
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Link {
    closed: CancellationToken,
    close_reason: Mutex<Option<(u32, String)>>,
}

impl Link {
    /// First close wins; later calls keep the original code.
    fn close(&self, code: u32, reason: &str) {
        {
            let mut slot = self.close_reason.lock();
            if slot.is_none() {
                *slot = Some((code, reason.to_string()));
            }
        }
        self.closed.cancel();
    }

    fn reason(&self) -> Option<(u32, String)> {
        self.close_reason.lock().clone()
    }
}

// ---------------------------------------------------------------------------
// Listener side
// ---------------------------------------------------------------------------

/// Listener end of an in-memory connection.
#[derive(Clone)]
pub struct MemoryConnection {
    link: Arc<Link>,
    streams: mpsc::UnboundedSender<DuplexStream>,
    requests: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<RelayedRequest>>>,
}

impl std::fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("closed", &self.link.closed.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl TunnelConnection for MemoryConnection {
    type SendStream = WriteHalf<DuplexStream>;
    type RecvStream = ReadHalf<DuplexStream>;

    async fn open_stream(&self) -> anyhow::Result<(Self::SendStream, Self::RecvStream)> {
        if self.link.closed.is_cancelled() {
            bail!("connection is closed");
        }
        let (local, remote) = tokio::io::duplex(MAX_MESSAGE_SIZE);
        self.streams
            .send(remote)
            .map_err(|_| anyhow!("relay is not accepting streams"))?;
        let (recv, send) = tokio::io::split(local);
        Ok((send, recv))
    }

    fn close(&self, code: u32, reason: &str) {
        self.link.close(code, reason);
    }
}

/// Dials a [`MemoryRelay`].
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    relay: MemoryRelay,
}

impl MemoryTransport {
    #[must_use]
    pub fn new(relay: MemoryRelay) -> Self {
        Self { relay }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    type Connection = MemoryConnection;

    async fn dial(
        &self,
        addr: &str,
        tls: &TlsConfig,
        _config: &TransportConfig,
    ) -> anyhow::Result<MemoryConnection> {
        let relay = &self.relay.inner;
        relay.dials.fetch_add(1, Ordering::SeqCst);
        relay.server_names.lock().push(tls.server_name.clone());

        if relay.stall_dials.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let refuse_one = relay
            .refuse_dials
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refuse_one || relay.refuse_all.load(Ordering::SeqCst) {
            bail!("connection refused: {addr}");
        }

        let link = Arc::new(Link::default());
        let (streams_tx, streams_rx) = mpsc::unbounded_channel();
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        tokio::spawn(Arc::clone(relay).handle_connection(RelayEnd {
            link: Arc::clone(&link),
            streams: streams_rx,
            requests: requests_tx,
        }));

        Ok(MemoryConnection {
            link,
            streams: streams_tx,
            requests: Arc::new(tokio::sync::Mutex::new(requests_rx)),
        })
    }

    async fn serve(
        &self,
        connection: MemoryConnection,
        router: Router,
        _http: &HttpConfig,
        cancellation: CancellationToken,
    ) -> anyhow::Result<()> {
        let mut requests = connection.requests.lock().await;
        loop {
            tokio::select! {
                () = cancellation.cancelled() => return Ok(()),
                () = connection.link.closed.cancelled() => {
                    return match connection.link.reason() {
                        Some((code, reason)) if code != APPLICATION_OK => {
                            Err(anyhow!("connection closed with code {code}: {reason}"))
                        }
                        _ => Ok(()),
                    };
                }
                next = requests.recv() => {
                    let Some(relayed) = next else { return Ok(()) };
                    let router = router.clone();
                    tokio::spawn(async move {
                        let response = router
                            .oneshot(relayed.request)
                            .await
                            .unwrap_or_else(|never| match never {});
                        // The relay may have stopped waiting.
                        let _ = relayed.reply.send(response);
                    });
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Relay side
// ---------------------------------------------------------------------------

struct RelayEnd {
    link: Arc<Link>,
    streams: mpsc::UnboundedReceiver<DuplexStream>,
    requests: mpsc::UnboundedSender<RelayedRequest>,
}

struct RelayInner {
    response_code: Mutex<ResponseCode>,
    refuse_dials: AtomicU32,
    refuse_all: AtomicBool,
    stall_dials: AtomicBool,
    stall_registrations: AtomicBool,
    dials: AtomicU32,
    server_names: Mutex<Vec<Option<String>>>,
    registrations: Mutex<Vec<RegisterListenerRequest>>,
    accepted_tx: mpsc::UnboundedSender<AcceptedListener>,
    accepted_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<AcceptedListener>>,
}

impl RelayInner {
    async fn handle_connection(self: Arc<Self>, mut end: RelayEnd) {
        let stream = tokio::select! {
            stream = end.streams.recv() => stream,
            () = end.link.closed.cancelled() => None,
        };
        let Some(stream) = stream else { return };
        let (mut recv, mut send) = tokio::io::split(stream);

        let request: RegisterListenerRequest = match read_message(&mut recv).await {
            Ok(request) => request,
            Err(err) => {
                debug!(error = %err, "relay: bad registration");
                return;
            }
        };
        self.registrations.lock().push(request.clone());

        if self.stall_registrations.load(Ordering::SeqCst) {
            // Hand the listener out but never answer; both halves stay open.
            let _ = self.accepted_tx.send(AcceptedListener {
                registration: request,
                link: Arc::clone(&end.link),
                requests: end.requests,
            });
            end.link.closed.cancelled().await;
            drop((recv, send));
            return;
        }

        let code = *self.response_code.lock();
        if let Err(err) = write_message(&mut send, &RegisterListenerResponse { code }).await {
            debug!(error = %err, "relay: writing registration response");
            return;
        }
        if code.is_ok() {
            // Nobody may be accepting; the listener is dropped then.
            let _ = self.accepted_tx.send(AcceptedListener {
                registration: request,
                link: end.link,
                requests: end.requests,
            });
        }
    }
}

/// An in-process relay for [`MemoryTransport`].
///
/// Clones share the same relay.
#[derive(Clone)]
pub struct MemoryRelay {
    inner: Arc<RelayInner>,
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRelay")
            .field("dials", &self.dial_count())
            .field("response_code", &*self.inner.response_code.lock())
            .finish_non_exhaustive()
    }
}

impl MemoryRelay {
    #[must_use]
    pub fn new() -> Self {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(RelayInner {
                response_code: Mutex::new(ResponseCode::Ok),
                refuse_dials: AtomicU32::new(0),
                refuse_all: AtomicBool::new(false),
                stall_dials: AtomicBool::new(false),
                stall_registrations: AtomicBool::new(false),
                dials: AtomicU32::new(0),
                server_names: Mutex::new(Vec::new()),
                registrations: Mutex::new(Vec::new()),
                accepted_tx,
                accepted_rx: tokio::sync::Mutex::new(accepted_rx),
            }),
        }
    }

    /// Transport that dials this relay.
    #[must_use]
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport::new(self.clone())
    }

    /// Code sent in every following registration response.
    pub fn respond_with(&self, code: ResponseCode) {
        *self.inner.response_code.lock() = code;
    }

    /// Refuses the next `count` dials.
    pub fn refuse_next_dials(&self, count: u32) {
        self.inner.refuse_dials.store(count, Ordering::SeqCst);
    }

    /// Refuses every dial while `refuse` is set.
    pub fn refuse_all_dials(&self, refuse: bool) {
        self.inner.refuse_all.store(refuse, Ordering::SeqCst);
    }

    /// Makes dials hang until the caller gives up.
    pub fn stall_dials(&self, stall: bool) {
        self.inner.stall_dials.store(stall, Ordering::SeqCst);
    }

    /// Leaves registration requests unanswered while `stall` is set. The
    /// listener is still handed out through [`MemoryRelay::accept`].
    pub fn stall_registrations(&self, stall: bool) {
        self.inner.stall_registrations.store(stall, Ordering::SeqCst);
    }

    /// Number of dials attempted so far, refused ones included.
    #[must_use]
    pub fn dial_count(&self) -> u32 {
        self.inner.dials.load(Ordering::SeqCst)
    }

    /// TLS server names presented by each dial, in order.
    #[must_use]
    pub fn server_names(&self) -> Vec<Option<String>> {
        self.inner.server_names.lock().clone()
    }

    /// Every registration request received, accepted or not.
    #[must_use]
    pub fn registrations(&self) -> Vec<RegisterListenerRequest> {
        self.inner.registrations.lock().clone()
    }

    /// Waits for the next listener whose registration was answered `OK`.
    pub async fn accept(&self) -> Option<AcceptedListener> {
        self.inner.accepted_rx.lock().await.recv().await
    }
}

/// A registered listener as seen from the relay.
pub struct AcceptedListener {
    registration: RegisterListenerRequest,
    link: Arc<Link>,
    requests: mpsc::UnboundedSender<RelayedRequest>,
}

impl std::fmt::Debug for AcceptedListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcceptedListener")
            .field("registration", &self.registration)
            .field("closed", &self.link.closed.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl AcceptedListener {
    #[must_use]
    pub fn registration(&self) -> &RegisterListenerRequest {
        &self.registration
    }

    /// Forwards `request` to the listener and waits for its response.
    pub async fn send(&self, request: Request<Body>) -> anyhow::Result<Response> {
        if self.link.closed.is_cancelled() {
            bail!("connection is closed");
        }
        let (reply, response) = oneshot::channel();
        self.requests
            .send(RelayedRequest { request, reply })
            .map_err(|_| anyhow!("listener is not serving"))?;
        tokio::select! {
            response = response => response.map_err(|_| anyhow!("listener dropped the request")),
            () = self.link.closed.cancelled() => Err(anyhow!("connection closed before a response")),
        }
    }

    /// Closes the connection from the relay side.
    pub fn close(&self, code: u32, reason: &str) {
        self.link.close(code, reason);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.link.closed.is_cancelled()
    }

    /// Waits until either side closes the connection and returns the close
    /// code and reason.
    pub async fn closed(&self) -> (u32, String) {
        self.link.closed.cancelled().await;
        self.link.reason().unwrap_or_default()
    }
}
