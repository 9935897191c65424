//! WebSocket session bridging
//!
//! One downstream client socket is bridged to one upstream node socket. Two
//! relay pumps move JSON-RPC envelopes between the sides while a watchdog
//! enforces upstream liveness; any terminal failure tears the session down
//! exactly once and leaves its trace in the bound endpoint's health state.

use axum::extract::State;
use axum::extract::WebSocketUpgrade;
use axum::extract::ws::{Message, WebSocket};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message as TungsteniteMessage};
use tracing::{debug, info, warn};

use crate::metrics::GatewayMetrics;
use crate::proxy::selection;
use crate::rpc::JsonRpcMessage;
use crate::state::{AppState, Endpoint};

/// Bound on dialing an upstream endpoint, for sessions and bare probes alike
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Liveness and forced-disconnect check cadence
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(1);

/// Type alias for upstream WebSocket stream
type UpstreamWsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Type alias for upstream WebSocket sender
type UpstreamSink = futures_util::stream::SplitSink<UpstreamWsStream, TungsteniteMessage>;

/// Type alias for upstream WebSocket receiver
type UpstreamSource = futures_util::stream::SplitStream<UpstreamWsStream>;

/// Type alias for client WebSocket sender
type ClientSink = futures_util::stream::SplitSink<WebSocket, Message>;

/// Type alias for client WebSocket receiver
type ClientSource = futures_util::stream::SplitStream<WebSocket>;

/// Handle WebSocket upgrade requests (GET /)
pub async fn ws_handler(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    let endpoint = selection::select_endpoint(&state);
    let header_timeout = state.config.header_timeout;

    debug!(url = %endpoint.url(), "upgrading downstream connection");

    ws.on_upgrade(move |socket| async move {
        GatewayMetrics::inc_sessions();

        match Connection::open(endpoint, socket).await {
            Ok(connection) => connection.run(header_timeout).await,
            Err(e) => warn!(error = %e, "failed to open session"),
        }

        GatewayMetrics::dec_active_sessions();
        info!("downstream session closed");
    })
}

/// State shared between the relay pumps, the watchdog, and in-flight forwards
struct ConnectionInner {
    endpoint: Arc<Endpoint>,
    connected_at: Instant,
    /// Single-writer-wins teardown guard; racing failure paths may all call
    /// `close`, only the first performs it.
    closing: AtomicBool,
    /// Set when the downstream side closed first, so an upstream read failure
    /// is not held against the endpoint.
    expected_close: AtomicBool,
    /// Terminal signal released by `close`
    closed: watch::Sender<bool>,
}

impl ConnectionInner {
    fn new(endpoint: Arc<Endpoint>) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            endpoint,
            connected_at: Instant::now(),
            closing: AtomicBool::new(false),
            expected_close: AtomicBool::new(false),
            closed,
        }
    }

    /// Initiate teardown; returns whether this caller performed it
    fn close(&self) -> bool {
        if self.closing.swap(true, Ordering::SeqCst) {
            return false;
        }

        self.endpoint.set_should_disconnect(true);
        info!(url = %self.endpoint.url(), "disconnecting from upstream");
        self.closed.send_replace(true);
        true
    }
}

/// One bridged session between a downstream client and an upstream node
pub struct Connection {
    inner: Arc<ConnectionInner>,
    closed_rx: watch::Receiver<bool>,
    client_sink: Arc<Mutex<ClientSink>>,
    client_source: ClientSource,
    upstream_sink: Arc<Mutex<UpstreamSink>>,
    upstream_source: UpstreamSource,
}

impl Connection {
    /// Dial the endpoint and bind it to the downstream socket
    ///
    /// A dial failure is recorded against the endpoint and closes the
    /// downstream socket before the error is returned.
    pub async fn open(endpoint: Arc<Endpoint>, client: WebSocket) -> eyre::Result<Self> {
        let dial = tokio::time::timeout(DIAL_TIMEOUT, connect_async(endpoint.url())).await;
        let upstream = match dial {
            Ok(Ok((upstream, _))) => upstream,
            Ok(Err(e)) => {
                return Err(dial_failed(&endpoint, client, eyre::Report::new(e)).await);
            }
            Err(_) => {
                let timeout = eyre::eyre!("dial timed out after {DIAL_TIMEOUT:?}");
                return Err(dial_failed(&endpoint, client, timeout).await);
            }
        };

        info!(url = %endpoint.url(), "connected to upstream");

        let inner = ConnectionInner::new(endpoint);
        let closed_rx = inner.closed.subscribe();
        let (client_sink, client_source) = client.split();
        let (upstream_sink, upstream_source) = upstream.split();

        Ok(Self {
            inner: Arc::new(inner),
            closed_rx,
            client_sink: Arc::new(Mutex::new(client_sink)),
            client_source,
            upstream_sink: Arc::new(Mutex::new(upstream_sink)),
            upstream_source,
        })
    }

    /// Bridge the two sockets until terminal failure
    pub async fn run(self, header_timeout: Duration) {
        let Connection {
            inner,
            mut closed_rx,
            client_sink,
            client_source,
            upstream_sink,
            upstream_source,
        } = self;

        let incoming = tokio::spawn(relay_downstream(
            inner.clone(),
            client_source,
            upstream_sink.clone(),
        ));
        let outgoing = tokio::spawn(relay_upstream(
            inner.clone(),
            upstream_source,
            client_sink.clone(),
        ));

        watchdog(&inner, &mut closed_rx, header_timeout).await;
        inner.close();

        // Unblock the pump reads so the socket halves they own get dropped.
        incoming.abort();
        outgoing.abort();
        let _ = incoming.await;
        let _ = outgoing.await;

        // Best-effort close handshake; try_lock so a forward stuck on a dead
        // peer cannot stall teardown.
        if let Ok(mut sink) = upstream_sink.try_lock() {
            let _ = sink.send(TungsteniteMessage::Close(None)).await;
            let _ = sink.close().await;
        }
        if let Ok(mut sink) = client_sink.try_lock() {
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        }
    }
}

/// Record a dial failure and close the downstream socket
async fn dial_failed(
    endpoint: &Endpoint,
    mut client: WebSocket,
    err: eyre::Report,
) -> eyre::Report {
    endpoint.record_failure();
    GatewayMetrics::inc_dial_failures();
    let _ = client.send(Message::Close(None)).await;
    err.wrap_err(format!("failed to dial {}", endpoint.url()))
}

/// Periodic liveness and forced-disconnect check for one session
async fn watchdog(
    inner: &ConnectionInner,
    closed: &mut watch::Receiver<bool>,
    header_timeout: Duration,
) {
    let mut ticker = tokio::time::interval(WATCHDOG_INTERVAL);

    loop {
        tokio::select! {
            _ = closed.changed() => return,
            _ = ticker.tick() => {
                if inner.endpoint.should_disconnect() {
                    info!(url = %inner.endpoint.url(), "endpoint flagged for disconnect");
                    inner.close();
                    return;
                }

                let last_header = inner.endpoint.last_header_at().unwrap_or(inner.connected_at);
                if last_header.elapsed() > header_timeout {
                    warn!(url = %inner.endpoint.url(), "no block header notification within timeout");
                    GatewayMetrics::inc_watchdog_timeouts();
                    inner.endpoint.record_failure();
                    inner.endpoint.mark_offline();
                    inner.close();
                    return;
                }
            }
        }
    }
}

/// Relay messages from the downstream client to the upstream node
async fn relay_downstream(
    inner: Arc<ConnectionInner>,
    mut source: ClientSource,
    upstream_sink: Arc<Mutex<UpstreamSink>>,
) {
    loop {
        let decoded = match source.next().await {
            Some(Ok(Message::Text(text))) => {
                serde_json::from_str::<JsonRpcMessage>(text.as_str()).ok()
            }
            Some(Ok(Message::Binary(data))) => {
                serde_json::from_slice::<JsonRpcMessage>(&data).ok()
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
        };

        let Some(msg) = decoded else {
            debug!("dropping malformed downstream payload");
            continue;
        };

        let inner = inner.clone();
        let sink = upstream_sink.clone();
        tokio::spawn(async move {
            forward_to_upstream(&inner, &sink, &msg).await;
        });
    }

    // Every exit here means the downstream side went away first.
    inner.expected_close.store(true, Ordering::SeqCst);
    inner.close();
}

/// Relay messages from the upstream node to the downstream client,
/// classifying block header notifications along the way
async fn relay_upstream(
    inner: Arc<ConnectionInner>,
    mut source: UpstreamSource,
    client_sink: Arc<Mutex<ClientSink>>,
) {
    loop {
        let decoded = match source.next().await {
            Some(Ok(TungsteniteMessage::Text(text))) => {
                serde_json::from_str::<JsonRpcMessage>(text.as_str()).ok()
            }
            Some(Ok(TungsteniteMessage::Binary(data))) => {
                serde_json::from_slice::<JsonRpcMessage>(&data).ok()
            }
            Some(Ok(
                TungsteniteMessage::Ping(_)
                | TungsteniteMessage::Pong(_)
                | TungsteniteMessage::Frame(_),
            )) => continue,
            Some(Ok(TungsteniteMessage::Close(_))) | Some(Err(_)) | None => {
                if !inner.expected_close.load(Ordering::SeqCst) {
                    inner.endpoint.mark_offline();
                }
                break;
            }
        };

        let Some(msg) = decoded else {
            debug!(url = %inner.endpoint.url(), "dropping malformed upstream payload");
            continue;
        };

        if msg.is_block_header_notification() {
            debug!(url = %inner.endpoint.url(), "block header notification");
            GatewayMetrics::inc_header_notifications();
            inner.endpoint.record_liveness();
        }

        let inner = inner.clone();
        let sink = client_sink.clone();
        tokio::spawn(async move {
            forward_to_client(&inner, &sink, &msg).await;
        });
    }

    inner.close();
}

/// Forward one envelope to the upstream node under the upstream write lock
async fn forward_to_upstream(
    inner: &ConnectionInner,
    sink: &Mutex<UpstreamSink>,
    msg: &JsonRpcMessage,
) {
    let Ok(payload) = serde_json::to_string(msg) else {
        return;
    };

    GatewayMetrics::inc_messages("upstream");

    let mut sink = sink.lock().await;
    if sink
        .send(TungsteniteMessage::Text(payload.into()))
        .await
        .is_err()
    {
        // Could not write; assume the upstream socket is gone.
        inner.close();
    }
}

/// Forward one envelope to the downstream client under the client write lock
async fn forward_to_client(
    inner: &ConnectionInner,
    sink: &Mutex<ClientSink>,
    msg: &JsonRpcMessage,
) {
    let Ok(payload) = serde_json::to_string(msg) else {
        return;
    };

    GatewayMetrics::inc_messages("downstream");

    let mut sink = sink.lock().await;
    if sink.send(Message::Text(payload.into())).await.is_err() {
        // Could not write; assume the client socket is gone.
        inner.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_inner() -> ConnectionInner {
        ConnectionInner::new(Arc::new(Endpoint::new("ws://localhost:8546")))
    }

    #[tokio::test]
    async fn test_close_performs_teardown_once() {
        let inner = test_inner();

        assert!(inner.close(), "first close performs teardown");
        assert!(!inner.close(), "second close is a no-op");

        assert!(inner.endpoint.should_disconnect());
        assert!(*inner.closed.subscribe().borrow());
    }

    #[tokio::test]
    async fn test_concurrent_close_has_exactly_one_winner() {
        let inner = Arc::new(test_inner());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let inner = inner.clone();
            handles.push(tokio::spawn(async move { inner.close() }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.expect("task should not panic") {
                winners += 1;
            }
        }

        assert_eq!(winners, 1, "exactly one caller performs the teardown");
        assert!(inner.endpoint.should_disconnect());
    }

    #[tokio::test]
    async fn test_watchdog_times_out_without_headers() {
        let inner = test_inner();
        let mut closed_rx = inner.closed.subscribe();

        // Let the connection age past the liveness bound.
        tokio::time::sleep(Duration::from_millis(30)).await;
        watchdog(&inner, &mut closed_rx, Duration::from_millis(10)).await;

        assert_eq!(inner.endpoint.failed_attempts(), 1);
        assert!(inner.endpoint.offline_since().is_some());
        assert!(inner.closing.load(Ordering::SeqCst));
        assert!(inner.endpoint.should_disconnect());
    }

    #[tokio::test]
    async fn test_watchdog_honors_forced_disconnect() {
        let inner = test_inner();
        let mut closed_rx = inner.closed.subscribe();

        inner.endpoint.set_should_disconnect(true);
        watchdog(&inner, &mut closed_rx, Duration::from_secs(600)).await;

        assert!(inner.closing.load(Ordering::SeqCst));
        assert!(
            inner.endpoint.offline_since().is_none(),
            "forced disconnect is not a health failure"
        );
        assert_eq!(inner.endpoint.failed_attempts(), 0);
    }

    #[tokio::test]
    async fn test_watchdog_exits_on_close_signal() {
        let inner = Arc::new(test_inner());
        let mut closed_rx = inner.closed.subscribe();

        let closer = inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            closer.close();
        });

        watchdog(&inner, &mut closed_rx, Duration::from_secs(600)).await;

        assert_eq!(
            inner.endpoint.failed_attempts(),
            0,
            "an externally closed session leaves health untouched"
        );
    }

    #[tokio::test]
    async fn test_watchdog_defers_while_headers_are_fresh() {
        let inner = test_inner();
        let mut closed_rx = inner.closed.subscribe();

        inner.endpoint.record_liveness();

        let result = tokio::time::timeout(
            Duration::from_millis(200),
            watchdog(&inner, &mut closed_rx, Duration::from_secs(600)),
        )
        .await;

        assert!(result.is_err(), "watchdog should still be waiting");
        assert_eq!(inner.endpoint.failed_attempts(), 0);
        assert!(!inner.closing.load(Ordering::SeqCst));
    }
}
