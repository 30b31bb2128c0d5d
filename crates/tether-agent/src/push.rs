//! Push transport
//!
//! Keeps a WebSocket session open to the push service. The service pushes
//! configuration overlays, asks for metrics reports and tunnels TCP
//! connections to the local S3 endpoint through numbered virtual channels.
//!
//! # Session lifecycle
//!
//! ```text
//! Connecting ──open──► Open ──close / error / liveness timeout──► Closing ──► Closed
//!      ▲                                                                        │
//!      └──────────────────────────── reconnect delay ◄───────────────────────────┘
//! ```
//!
//! All frames of a session are written by a single writer task. Dispatch, stats
//! pushes and tunnel readers hand their frames to it through a queue.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{sleep, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::{HeaderValue, Request};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use tether_common::settings::ManagementSettings;
use tether_common::{ConfigOverlay, Error, Result, SharedStore, AUTH_TOKEN_HEADER, MANAGEMENT_DATABASE};
use tether_proto::{encode_metrics_report, ChannelMessage, MessageType, PROTOCOL_NAME};

use crate::reconciler::Reconciler;
use crate::stats::SharedStatsSource;
use crate::tunnel::ChannelRegistry;

/// Frames queued for the writer before producers wait
const OUTBOUND_QUEUE_DEPTH: usize = 256;

/// Largest proxy CONNECT response head accepted
const MAX_PROXY_RESPONSE: usize = 8 * 1024;

/// Push session state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Opening the WebSocket
    Connecting,
    /// Session established, frames flowing
    Open,
    /// Session ending, channels being torn down
    Closing,
    /// No session; a reconnect is pending
    Closed,
}

/// Why a session ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEnd {
    /// The push service closed the connection
    PeerClosed,
    /// A ping went unanswered
    LivenessTimeout,
    /// Reading or writing the socket failed
    TransportError(String),
    /// Shutdown was requested
    Shutdown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Liveness {
    AwaitingPing,
    AwaitingPong,
}

/// WebSocket stream produced by [`connect_push`]
pub type PushStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Push transport for one instance
pub struct PushClient {
    instance_id: String,
    token: String,
    settings: ManagementSettings,
    reconciler: Arc<Reconciler>,
    stats: SharedStatsSource,
    store: SharedStore,
    state: watch::Sender<SessionState>,
}

impl PushClient {
    /// Create a push client; call [`PushClient::run`] to start it
    pub fn new(
        instance_id: impl Into<String>,
        token: impl Into<String>,
        settings: ManagementSettings,
        reconciler: Arc<Reconciler>,
        stats: SharedStatsSource,
        store: SharedStore,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Closed);
        Self {
            instance_id: instance_id.into(),
            token: token.into(),
            settings,
            reconciler,
            stats,
            store,
            state,
        }
    }

    /// Observe session state changes
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: SessionState) {
        self.state.send_replace(state);
    }

    /// Keep a session open until `shutdown` fires, reconnecting after the
    /// configured delay whenever it ends
    pub async fn run(&self, shutdown: CancellationToken) {
        loop {
            self.set_state(SessionState::Connecting);
            info!("Connecting to push server");

            match self.connect().await {
                Ok(ws) => {
                    info!("Connected to push server");
                    let end = self.run_session(ws, &shutdown).await;
                    info!(reason = ?end, "Disconnected from push server");
                }
                Err(e) => {
                    error!(error = %e, "Error from push server connection");
                    self.set_state(SessionState::Closed);
                }
            }

            if shutdown.is_cancelled() {
                break;
            }

            let delay = self.settings.reconnect_delay;
            info!(delay_ms = delay.as_millis() as u64, "Reconnecting to push server");
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }
        self.set_state(SessionState::Closed);
    }

    /// Open the WebSocket, through a proxy when the environment names one
    pub async fn connect(&self) -> Result<PushStream> {
        let url = self.settings.push_url(&self.instance_id)?;
        let proxy = select_proxy(&url, |name| std::env::var(name).ok());
        let proxy = proxy.map(|p| parse_proxy_url(&p)).transpose()?;
        connect_push(&url, &self.token, proxy.as_ref()).await
    }

    /// Drive one established session until it ends
    pub async fn run_session<S>(&self, ws: WebSocketStream<S>, shutdown: &CancellationToken) -> SessionEnd
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.set_state(SessionState::Open);

        let (sink, mut inbound) = ws.split();
        let (frame_tx, frame_rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_QUEUE_DEPTH);
        let (control_tx, control_rx) = mpsc::channel::<Message>(8);
        let mut writer = tokio::spawn(write_frames(sink, frame_rx, control_rx));

        let registry = ChannelRegistry::new(self.settings.tunnel.clone(), frame_tx.clone());
        let mut browser_access = self.reconciler.live().subscribe_browser_access();
        let mut browser_access_open = true;
        let mut changes = self.store.subscribe_changes();
        let mut changes_open = true;

        self.push_stats(&frame_tx, true);

        let mut liveness = Liveness::AwaitingPing;
        let deadline = sleep(self.settings.ping_interval);
        tokio::pin!(deadline);

        let end = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break SessionEnd::Shutdown,

                () = &mut deadline => match liveness {
                    Liveness::AwaitingPing => {
                        debug!("Sending ping to push server");
                        if control_tx.send(Message::Ping(Vec::new())).await.is_err() {
                            break SessionEnd::TransportError("writer stopped".to_string());
                        }
                        liveness = Liveness::AwaitingPong;
                        deadline.as_mut().reset(Instant::now() + self.settings.pong_timeout);
                    }
                    Liveness::AwaitingPong => {
                        warn!("Push server did not answer ping, terminating session");
                        break SessionEnd::LivenessTimeout;
                    }
                },

                message = inbound.next() => match message {
                    Some(Ok(Message::Binary(frame))) => {
                        self.dispatch(&frame, &registry, &frame_tx).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        liveness = Liveness::AwaitingPing;
                        deadline.as_mut().reset(Instant::now() + self.settings.ping_interval);
                    }
                    // tungstenite queues the pong reply itself
                    Some(Ok(Message::Ping(_))) => debug!("Ping from push server"),
                    Some(Ok(Message::Close(frame))) => {
                        debug!(frame = ?frame, "Push server closed session");
                        break SessionEnd::PeerClosed;
                    }
                    Some(Ok(other)) => {
                        warn!(kind = ?message_kind(&other), "Ignoring non-binary message from push server");
                    }
                    Some(Err(e)) => break SessionEnd::TransportError(e.to_string()),
                    None => break SessionEnd::PeerClosed,
                },

                changed = browser_access.changed(), if browser_access_open => match changed {
                    Ok(()) => {
                        let enabled = *browser_access.borrow_and_update();
                        if !enabled {
                            info!("Browser access disabled, closing tunnels");
                            registry.close_all();
                        }
                    }
                    Err(_) => browser_access_open = false,
                },

                change = changes.recv(), if changes_open => match change {
                    Ok(change) if change.bucket == MANAGEMENT_DATABASE => {}
                    Ok(change) => {
                        debug!(bucket = %change.bucket, "Storage changed, pushing stats");
                        self.push_stats(&frame_tx, true);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Storage change feed lagged, pushing stats");
                        self.push_stats(&frame_tx, true);
                    }
                    Err(broadcast::error::RecvError::Closed) => changes_open = false,
                },

                result = &mut writer => {
                    let reason = match result {
                        Ok(Ok(())) => "writer finished".to_string(),
                        Ok(Err(e)) => e.to_string(),
                        Err(e) => e.to_string(),
                    };
                    self.set_state(SessionState::Closing);
                    registry.close_all();
                    self.set_state(SessionState::Closed);
                    return SessionEnd::TransportError(reason);
                }
            }
        };

        self.set_state(SessionState::Closing);
        registry.close_all();
        drop(registry);

        if !matches!(end, SessionEnd::PeerClosed) {
            let _ = control_tx.send(Message::Close(None)).await;
        }
        drop(control_tx);
        drop(frame_tx);
        match tokio::time::timeout(Duration::from_secs(1), &mut writer).await {
            Ok(_) => {}
            Err(_) => writer.abort(),
        }

        self.set_state(SessionState::Closed);
        end
    }

    async fn dispatch(&self, frame: &[u8], registry: &ChannelRegistry, frame_tx: &mpsc::Sender<Vec<u8>>) {
        let message = match ChannelMessage::decode(frame) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Dropping malformed frame from push server");
                return;
            }
        };

        match message.message_type {
            MessageType::ConfigOverlay => match ConfigOverlay::from_slice(&message.payload) {
                Ok(overlay) => self.reconciler.apply_and_save(&overlay).await,
                Err(e) => error!(error = %e, "Could not parse pushed overlay"),
            },
            MessageType::MetricsRequest => self.push_stats(frame_tx, false),
            MessageType::ChannelClose => {
                registry.close(message.channel_number);
            }
            MessageType::ChannelPayload => {
                if self.reconciler.live().browser_access_enabled() {
                    registry.deliver(message.channel_number, message.payload);
                } else {
                    debug!(
                        channel = message.channel_number,
                        "Browser access disabled, dropping channel payload"
                    );
                }
            }
            other => error!(message_type = %other, "Unknown message type from push server"),
        }
    }

    fn push_stats(&self, frame_tx: &mpsc::Sender<Vec<u8>>, skip_cache: bool) {
        if !self.settings.stats.enabled {
            return;
        }
        let stats = self.stats.clone();
        let frame_tx = frame_tx.clone();
        tokio::spawn(async move {
            match stats.fetch(skip_cache).await {
                Ok(body) => {
                    if frame_tx.send(encode_metrics_report(&body)).await.is_err() {
                        debug!("Session ended before metrics report was sent");
                    }
                }
                Err(e) => error!(error = %e, "Failed to get metrics report"),
            }
        });
    }
}

fn message_kind(message: &Message) -> &'static str {
    match message {
        Message::Text(_) => "text",
        Message::Binary(_) => "binary",
        Message::Ping(_) => "ping",
        Message::Pong(_) => "pong",
        Message::Close(_) => "close",
        Message::Frame(_) => "frame",
    }
}

async fn write_frames<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut frames: mpsc::Receiver<Vec<u8>>,
    mut control: mpsc::Receiver<Message>,
) -> std::result::Result<(), tokio_tungstenite::tungstenite::Error>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        let message = tokio::select! {
            biased;
            message = control.recv() => match message {
                Some(message) => message,
                None => break,
            },
            frame = frames.recv() => match frame {
                Some(frame) => Message::Binary(frame),
                None => break,
            },
        };
        sink.send(message).await?;
    }
    sink.close().await
}

/// Pick the proxy for `url` from proxy environment variables.
///
/// `NO_PROXY` matches exact host names only. `HTTPS_PROXY` applies to secure
/// schemes and `HTTP_PROXY` to plain ones, with `ALL_PROXY` as the fallback.
/// Lowercase variable names are accepted too.
pub fn select_proxy(url: &Url, lookup: impl Fn(&str) -> Option<String>) -> Option<String> {
    let var = |name: &str| {
        lookup(name)
            .or_else(|| lookup(&name.to_ascii_lowercase()))
            .filter(|v| !v.trim().is_empty())
    };

    let host = url.host_str().unwrap_or_default();
    if let Some(no_proxy) = var("NO_PROXY") {
        if no_proxy.split(',').any(|entry| entry.trim() == host) {
            info!(no_proxy = %no_proxy, "Push server has proxy exclusion");
            return None;
        }
    }

    let scheme_proxy = match url.scheme() {
        "https" | "wss" => var("HTTPS_PROXY"),
        "http" | "ws" => var("HTTP_PROXY"),
        _ => None,
    };
    if let Some(proxy) = scheme_proxy {
        info!(proxy = %proxy, "Push server using proxy");
        return Some(proxy);
    }

    let all = var("ALL_PROXY");
    match &all {
        Some(proxy) => info!(proxy = %proxy, "Push server using wildcard proxy"),
        None => debug!("Push server not using proxy"),
    }
    all
}

fn parse_proxy_url(raw: &str) -> Result<Url> {
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("http://{}", raw)
    };
    Url::parse(&with_scheme).map_err(|e| Error::config(format!("invalid proxy url '{}': {}", raw, e)))
}

fn push_request(url: &Url, token: &str) -> Result<Request<()>> {
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| Error::transport(format!("invalid push request: {}", e)))?;
    let headers = request.headers_mut();
    headers.insert(
        AUTH_TOKEN_HEADER,
        HeaderValue::from_str(token).map_err(|_| Error::transport("token is not a valid header value"))?,
    );
    headers.insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(PROTOCOL_NAME));
    Ok(request)
}

/// Open the push WebSocket at `url`, tunneling through `proxy` with HTTP
/// `CONNECT` when given
pub async fn connect_push(url: &Url, token: &str, proxy: Option<&Url>) -> Result<PushStream> {
    let request = push_request(url, token)?;

    let (ws, _response) = match proxy {
        None => tokio_tungstenite::connect_async(request).await,
        Some(proxy) => {
            let stream = connect_via_proxy(proxy, url).await?;
            tokio_tungstenite::client_async_tls(request, stream).await
        }
    }
    .map_err(|e| Error::transport(format!("could not open push session: {}", e)))?;

    Ok(ws)
}

async fn connect_via_proxy(proxy: &Url, target: &Url) -> Result<TcpStream> {
    let proxy_host = proxy
        .host_str()
        .ok_or_else(|| Error::config(format!("proxy url '{}' has no host", proxy)))?;
    let proxy_port = proxy.port_or_known_default().unwrap_or(80);
    let host = target
        .host_str()
        .ok_or_else(|| Error::config(format!("push url '{}' has no host", target)))?;
    let port = target.port_or_known_default().unwrap_or(443);
    let authority = format!("{}:{}", host, port);

    let mut stream = TcpStream::connect((proxy_host, proxy_port))
        .await
        .map_err(|e| Error::transport(format!("could not reach proxy {}:{}: {}", proxy_host, proxy_port, e)))?;

    let mut connect = format!("CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n", authority);
    if !proxy.username().is_empty() {
        let credentials = format!("{}:{}", proxy.username(), proxy.password().unwrap_or_default());
        connect.push_str(&format!("Proxy-Authorization: Basic {}\r\n", BASE64.encode(credentials)));
    }
    connect.push_str("\r\n");
    stream
        .write_all(connect.as_bytes())
        .await
        .map_err(|e| Error::transport(format!("proxy write failed: {}", e)))?;

    // read byte by byte so nothing past the response head is consumed
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_PROXY_RESPONSE {
            return Err(Error::transport("proxy response head too large"));
        }
        let n = stream
            .read(&mut byte)
            .await
            .map_err(|e| Error::transport(format!("proxy read failed: {}", e)))?;
        if n == 0 {
            return Err(Error::transport("proxy closed connection during CONNECT"));
        }
        head.push(byte[0]);
    }

    let head = String::from_utf8_lossy(&head);
    let status_line = head.lines().next().unwrap_or_default();
    match status_line.split_whitespace().nth(1) {
        Some("200") => {
            debug!(proxy = %proxy_host, target = %authority, "Proxy tunnel established");
            Ok(stream)
        }
        _ => Err(Error::transport(format!("proxy refused CONNECT: {}", status_line))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use mockall::predicate::eq;
    use serde_json::{json, Value};
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::handshake::server::{
        ErrorResponse, Request as HandshakeRequest, Response as HandshakeResponse,
    };
    use tokio_tungstenite::tungstenite::protocol::Role;

    use tether_common::settings::TunnelTarget;
    use tether_common::store::{put_json, MemoryStore};
    use tether_common::{LiveConfig, MetadataStore, CREDENTIALS_KEY, OVERLAY_VERSION_KEY};
    use tether_proto::{encode, encode_data, encode_metrics_request, encode_overlay};

    use crate::credentials::tests::test_credentials;
    use crate::reconciler::PatchOutcome;
    use crate::stats::{MockStatsSource, SharedStatsSource};

    struct Harness {
        client: Arc<PushClient>,
        store: Arc<MemoryStore>,
        reconciler: Arc<Reconciler>,
    }

    async fn harness(stats: MockStatsSource, stats_enabled: bool, tunnel: TunnelTarget) -> Harness {
        let store = Arc::new(MemoryStore::new());
        store.create_bucket(MANAGEMENT_DATABASE).await.unwrap();
        put_json(
            store.as_ref(),
            MANAGEMENT_DATABASE,
            CREDENTIALS_KEY,
            &test_credentials(),
        )
        .await
        .unwrap();
        let reconciler = Arc::new(Reconciler::new(store.clone(), Arc::new(LiveConfig::default())));

        let mut settings = ManagementSettings::default();
        settings.stats.enabled = stats_enabled;
        settings.tunnel = tunnel;

        let stats: SharedStatsSource = Arc::new(stats);
        let client = Arc::new(PushClient::new(
            "inst-1",
            "tok",
            settings,
            reconciler.clone(),
            stats,
            store.clone(),
        ));
        Harness {
            client,
            store,
            reconciler,
        }
    }

    /// Start a session over an in-memory duplex; returns the server end
    async fn open_session(
        client: Arc<PushClient>,
        shutdown: CancellationToken,
    ) -> (
        WebSocketStream<tokio::io::DuplexStream>,
        tokio::task::JoinHandle<SessionEnd>,
    ) {
        let (client_io, server_io) = tokio::io::duplex(256 * 1024);
        let client_ws = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        let server_ws = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let session = tokio::spawn(async move { client.run_session(client_ws, &shutdown).await });
        (server_ws, session)
    }

    async fn next_frame(server: &mut WebSocketStream<tokio::io::DuplexStream>) -> ChannelMessage {
        loop {
            let message = timeout(Duration::from_secs(5), server.next())
                .await
                .expect("timed out waiting for frame")
                .expect("session closed")
                .unwrap();
            if let Message::Binary(frame) = message {
                return ChannelMessage::decode(&frame).unwrap();
            }
        }
    }

    async fn recording_target() -> (TunnelTarget, mpsc::UnboundedReceiver<&'static str>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = listener.accept().await.unwrap();
                let events_tx = events_tx.clone();
                let _ = events_tx.send("accepted");
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    loop {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => {
                                let _ = events_tx.send("closed");
                                break;
                            }
                            Ok(n) => {
                                if socket.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        (
            TunnelTarget {
                host: "127.0.0.1".to_string(),
                port,
            },
            events_rx,
        )
    }

    /// Story: tunneled connections only work while browser access is
    /// enabled, and turning it off tears down every open tunnel
    #[tokio::test]
    async fn story_browser_access_gates_tunnels() {
        let (target, mut events) = recording_target().await;
        let h = harness(MockStatsSource::new(), false, target).await;
        let (mut server, _session) = open_session(h.client.clone(), CancellationToken::new()).await;

        // disabled: no socket is opened
        server.send(Message::Binary(encode_data(1, b"early"))).await.unwrap();
        assert!(timeout(Duration::from_millis(200), events.recv()).await.is_err());

        let outcome = h
            .reconciler
            .patch(&serde_json::from_value(json!({"version": 1, "browserAccess": {"enabled": true}})).unwrap())
            .await
            .unwrap();
        assert_eq!(outcome, PatchOutcome::Applied { version: 1 });

        server.send(Message::Binary(encode_data(1, b"hello"))).await.unwrap();
        server.send(Message::Binary(encode_data(2, b"there"))).await.unwrap();
        assert_eq!(events.recv().await, Some("accepted"));
        assert_eq!(events.recv().await, Some("accepted"));

        let mut echoed: HashMap<u8, Vec<u8>> = HashMap::new();
        while echoed.values().map(Vec::len).sum::<usize>() < 10 {
            let msg = next_frame(&mut server).await;
            assert_eq!(msg.message_type, MessageType::ChannelPayload);
            echoed.entry(msg.channel_number).or_default().extend(msg.payload);
        }
        assert_eq!(echoed[&1], b"hello");
        assert_eq!(echoed[&2], b"there");

        h.reconciler
            .patch(&serde_json::from_value(json!({"version": 2, "browserAccess": {"enabled": false}})).unwrap())
            .await
            .unwrap();
        assert_eq!(events.recv().await, Some("closed"));
        assert_eq!(events.recv().await, Some("closed"));
    }

    /// Story: one tunneled connection whose local peer stops reading must not
    /// hold up the rest of the session
    #[tokio::test]
    async fn story_stalled_tunnel_leaves_session_responsive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (accepted_tx, mut accepted) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                let (socket, _) = listener.accept().await.unwrap();
                let _ = accepted_tx.send(());
                if held.is_empty() {
                    // first connection: accepted, never read
                    held.push(socket);
                    continue;
                }
                tokio::spawn(async move {
                    let mut socket = socket;
                    let (mut r, mut w) = socket.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        let target = TunnelTarget {
            host: "127.0.0.1".to_string(),
            port,
        };

        let h = harness(MockStatsSource::new(), false, target).await;
        h.reconciler
            .patch(&serde_json::from_value(json!({"version": 1, "browserAccess": {"enabled": true}})).unwrap())
            .await
            .unwrap();
        let (mut server, _session) = open_session(h.client.clone(), CancellationToken::new()).await;

        server.send(Message::Binary(encode_data(1, b"open"))).await.unwrap();
        timeout(Duration::from_secs(5), accepted.recv()).await.unwrap();

        let chunk = vec![7u8; 64 * 1024];
        for _ in 0..256 {
            server.send(Message::Binary(encode_data(1, &chunk))).await.unwrap();
        }
        server.send(Message::Binary(encode_data(2, b"ping"))).await.unwrap();
        timeout(Duration::from_secs(10), accepted.recv())
            .await
            .expect("second channel never opened");

        let echo = next_frame(&mut server).await;
        assert_eq!(echo.message_type, MessageType::ChannelPayload);
        assert_eq!(echo.channel_number, 2);
        assert_eq!(echo.payload, b"ping");
        assert_eq!(*h.client.subscribe_state().borrow(), SessionState::Open);
    }

    #[tokio::test]
    async fn test_metrics_request_sends_report() {
        let mut stats = MockStatsSource::new();
        stats
            .expect_fetch()
            .with(eq(true))
            .times(1)
            .returning(|_| Ok(br#"{"initial":true}"#.to_vec()));
        stats
            .expect_fetch()
            .with(eq(false))
            .times(1)
            .returning(|_| Ok(br#"{"a":1}"#.to_vec()));

        let h = harness(stats, true, TunnelTarget::default()).await;
        let (mut server, _session) = open_session(h.client.clone(), CancellationToken::new()).await;

        let initial = next_frame(&mut server).await;
        assert_eq!(initial.message_type, MessageType::MetricsReport);
        assert_eq!(initial.payload, br#"{"initial":true}"#);

        server.send(Message::Binary(encode_metrics_request())).await.unwrap();
        let report = next_frame(&mut server).await;
        assert_eq!(report.message_type, MessageType::MetricsReport);
        assert_eq!(report.channel_number, 0);
        assert_eq!(report.payload, br#"{"a":1}"#);
    }

    #[tokio::test]
    async fn test_storage_change_pushes_fresh_stats() {
        let mut stats = MockStatsSource::new();
        stats
            .expect_fetch()
            .with(eq(true))
            .times(2)
            .returning(|_| Ok(b"{}".to_vec()));

        let h = harness(stats, true, TunnelTarget::default()).await;
        let (mut server, _session) = open_session(h.client.clone(), CancellationToken::new()).await;
        next_frame(&mut server).await;

        // management writes do not count as storage changes
        h.store
            .put(MANAGEMENT_DATABASE, "some/key", json!(1))
            .await
            .unwrap();
        h.store.create_bucket("photos").await.unwrap();

        let report = next_frame(&mut server).await;
        assert_eq!(report.message_type, MessageType::MetricsReport);
        assert!(timeout(Duration::from_millis(200), server.next()).await.is_err());
    }

    #[tokio::test]
    async fn test_overlay_frame_is_applied_and_saved() {
        let h = harness(MockStatsSource::new(), false, TunnelTarget::default()).await;
        let (mut server, _session) = open_session(h.client.clone(), CancellationToken::new()).await;

        server
            .send(Message::Binary(encode_overlay(br#"{"version": 4, "instanceId": "pub"}"#)))
            .await
            .unwrap();
        // malformed overlays and unknown types leave the session open
        server.send(Message::Binary(encode_overlay(b"{not json"))).await.unwrap();
        server.send(Message::Binary(encode(MessageType::Unknown(42), 0, b""))).await.unwrap();
        server.send(Message::Binary(vec![1])).await.unwrap();

        let live = h.reconciler.live().clone();
        timeout(Duration::from_secs(5), async {
            while live.overlay_version() != Some(4) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(live.snapshot().public_instance_id.as_deref(), Some("pub"));
        assert_eq!(
            h.store.get(MANAGEMENT_DATABASE, OVERLAY_VERSION_KEY).await.unwrap(),
            Value::from(4)
        );
        assert_eq!(*h.client.subscribe_state().borrow(), SessionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_ping_terminates_session() {
        let h = harness(MockStatsSource::new(), false, TunnelTarget::default()).await;
        let started = Instant::now();
        // the server end is never read, so pings are never answered
        let (_server, session) = open_session(h.client.clone(), CancellationToken::new()).await;

        let end = session.await.unwrap();
        assert_eq!(end, SessionEnd::LivenessTimeout);
        assert!(started.elapsed() >= Duration::from_secs(20));
        assert_eq!(*h.client.subscribe_state().borrow(), SessionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_answered_pings_keep_session_open() {
        let h = harness(MockStatsSource::new(), false, TunnelTarget::default()).await;
        let (server, session) = open_session(h.client.clone(), CancellationToken::new()).await;
        let (mut server_tx, mut server_rx) = server.split();

        // reading drives tungstenite's automatic pong replies
        let reader = tokio::spawn(async move {
            let mut pings = 0;
            while let Some(Ok(message)) = server_rx.next().await {
                if message.is_ping() {
                    pings += 1;
                }
            }
            pings
        });

        tokio::time::sleep(Duration::from_secs(65)).await;
        assert!(!session.is_finished());

        server_tx.send(Message::Close(None)).await.unwrap();
        assert_eq!(session.await.unwrap(), SessionEnd::PeerClosed);
        assert!(reader.await.unwrap() >= 5);
    }

    /// Story: when the push service drops the session the client waits the
    /// reconnect delay, then opens a new one with the same credentials
    #[tokio::test]
    async fn story_reconnects_after_peer_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (handshake_tx, mut handshakes) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let mut closed_tx = Some(closed_tx);
            loop {
                let (socket, _) = listener.accept().await.unwrap();
                let handshake_tx = handshake_tx.clone();
                let callback = move |req: &HandshakeRequest,
                                     mut resp: HandshakeResponse|
                      -> std::result::Result<HandshakeResponse, ErrorResponse> {
                    let header = |name: &str| {
                        req.headers()
                            .get(name)
                            .and_then(|v: &HeaderValue| v.to_str().ok())
                            .unwrap_or_default()
                            .to_string()
                    };
                    let _ = handshake_tx.send((
                        header(AUTH_TOKEN_HEADER),
                        header(SEC_WEBSOCKET_PROTOCOL.as_str()),
                        Instant::now(),
                    ));
                    resp.headers_mut()
                        .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(PROTOCOL_NAME));
                    Ok(resp)
                };
                let mut ws = tokio_tungstenite::accept_hdr_async(socket, callback).await.unwrap();
                match closed_tx.take() {
                    Some(closed_tx) => {
                        // let the client settle into the open session first
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        let _ = closed_tx.send(Instant::now());
                        let _ = ws.close(None).await;
                        while ws.next().await.is_some() {}
                    }
                    None => {
                        tokio::spawn(async move { while ws.next().await.is_some() {} });
                    }
                }
            }
        });

        let store = Arc::new(MemoryStore::new());
        let reconciler = Arc::new(Reconciler::new(store.clone(), Arc::new(LiveConfig::default())));
        let mut settings = ManagementSettings::default();
        settings.stats.enabled = false;
        settings.reconnect_delay = Duration::from_millis(300);
        settings.push_url_override = Some(format!("ws://{}/api/v1/instance/inst-1/ws", addr));
        let client = Arc::new(PushClient::new(
            "inst-1",
            "tok",
            settings,
            reconciler,
            Arc::new(MockStatsSource::new()),
            store,
        ));

        let mut state = client.subscribe_state();
        let (states_tx, mut states) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while state.changed().await.is_ok() {
                let _ = states_tx.send(*state.borrow_and_update());
            }
        });

        let shutdown = CancellationToken::new();
        let run = {
            let client = client.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { client.run(shutdown).await })
        };

        let (token, protocol, _) = timeout(Duration::from_secs(5), handshakes.recv()).await.unwrap().unwrap();
        assert_eq!(token, "tok");
        assert_eq!(protocol, PROTOCOL_NAME);
        let closed_at = timeout(Duration::from_secs(5), closed_rx).await.unwrap().unwrap();

        let (token, protocol, reopened_at) =
            timeout(Duration::from_secs(5), handshakes.recv()).await.unwrap().unwrap();
        assert_eq!(token, "tok");
        assert_eq!(protocol, PROTOCOL_NAME);
        assert!(reopened_at.duration_since(closed_at) >= Duration::from_millis(300));

        let mut seen = Vec::new();
        while seen.len() < 6 {
            let next = timeout(Duration::from_secs(5), states.recv()).await.unwrap().unwrap();
            seen.push(next);
        }
        assert_eq!(
            seen,
            vec![
                SessionState::Connecting,
                SessionState::Open,
                SessionState::Closing,
                SessionState::Closed,
                SessionState::Connecting,
                SessionState::Open,
            ]
        );

        shutdown.cancel();
        timeout(Duration::from_secs(5), run).await.unwrap().unwrap();
        assert_eq!(*client.subscribe_state().borrow(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_shutdown_ends_session() {
        let h = harness(MockStatsSource::new(), false, TunnelTarget::default()).await;
        let shutdown = CancellationToken::new();
        let (_server, session) = open_session(h.client.clone(), shutdown.clone()).await;
        shutdown.cancel();
        assert_eq!(session.await.unwrap(), SessionEnd::Shutdown);
    }

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_select_proxy_rules() {
        let secure = Url::parse("wss://push.example.com/api/v1/instance/i/ws").unwrap();
        let plain = Url::parse("ws://push.example.com/ws").unwrap();

        assert_eq!(select_proxy(&secure, env(&[])), None);
        assert_eq!(
            select_proxy(&secure, env(&[("HTTPS_PROXY", "http://sp:3128"), ("HTTP_PROXY", "http://p:3128")])),
            Some("http://sp:3128".to_string())
        );
        assert_eq!(
            select_proxy(&plain, env(&[("HTTPS_PROXY", "http://sp:3128"), ("http_proxy", "http://p:3128")])),
            Some("http://p:3128".to_string())
        );
        assert_eq!(
            select_proxy(&plain, env(&[("HTTPS_PROXY", "http://sp:3128"), ("all_proxy", "http://all:1")])),
            Some("http://all:1".to_string())
        );
        assert_eq!(
            select_proxy(
                &secure,
                env(&[("NO_PROXY", "other, push.example.com"), ("HTTPS_PROXY", "http://sp:3128")])
            ),
            None
        );
        // exact host only, no suffix matching
        assert_eq!(
            select_proxy(&secure, env(&[("NO_PROXY", "example.com"), ("ALL_PROXY", "http://all:1")])),
            Some("http://all:1".to_string())
        );
    }

    #[test]
    fn test_parse_proxy_url_adds_scheme() {
        assert_eq!(parse_proxy_url("proxy:3128").unwrap().as_str(), "http://proxy:3128/");
        assert_eq!(
            parse_proxy_url("http://u:p@proxy:8080").unwrap().username(),
            "u"
        );
    }

    /// Story: behind a corporate proxy the session is opened through a
    /// CONNECT tunnel carrying the instance token and sub-protocol
    #[tokio::test]
    async fn story_connect_through_proxy() {
        // push server
        let ws_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ws_addr = ws_listener.local_addr().unwrap();
        let (token_tx, token_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (socket, _) = ws_listener.accept().await.unwrap();
            let callback = move |req: &HandshakeRequest,
                                 mut resp: HandshakeResponse|
                  -> std::result::Result<HandshakeResponse, ErrorResponse> {
                let token = req
                    .headers()
                    .get(AUTH_TOKEN_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                let _ = token_tx.send(token);
                resp.headers_mut()
                    .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(PROTOCOL_NAME));
                Ok(resp)
            };
            let mut ws = tokio_tungstenite::accept_hdr_async(socket, callback).await.unwrap();
            ws.send(Message::Binary(encode_metrics_request())).await.unwrap();
            while ws.next().await.is_some() {}
        });

        // CONNECT proxy
        let proxy_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = proxy_listener.local_addr().unwrap();
        let (connect_tx, connect_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (mut client, _) = proxy_listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut byte = [0u8; 1];
            while !head.ends_with(b"\r\n\r\n") {
                client.read_exact(&mut byte).await.unwrap();
                head.push(byte[0]);
            }
            let _ = connect_tx.send(String::from_utf8(head).unwrap());
            let mut upstream = TcpStream::connect(ws_addr).await.unwrap();
            client
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .unwrap();
            let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
        });

        let url = Url::parse(&format!("ws://{}/api/v1/instance/inst-1/ws", ws_addr)).unwrap();
        let proxy = Url::parse(&format!("http://{}", proxy_addr)).unwrap();
        let mut ws = connect_push(&url, "tok", Some(&proxy)).await.unwrap();

        let connect = connect_rx.await.unwrap();
        assert!(connect.starts_with(&format!("CONNECT {} HTTP/1.1\r\n", ws_addr)));
        assert_eq!(token_rx.await.unwrap(), "tok");

        let message = timeout(Duration::from_secs(5), ws.next()).await.unwrap().unwrap().unwrap();
        let frame = ChannelMessage::decode(&message.into_data()).unwrap();
        assert_eq!(frame.message_type, MessageType::MetricsRequest);
    }

    #[tokio::test]
    async fn test_proxy_refusal_is_reported() {
        let proxy_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = proxy_listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut client, _) = proxy_listener.accept().await.unwrap();
            let mut buf = [0u8; 512];
            let _ = client.read(&mut buf).await;
            let _ = client
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await;
        });

        let url = Url::parse("wss://push.example.com/ws").unwrap();
        let proxy = Url::parse(&format!("http://{}", proxy_addr)).unwrap();
        let err = connect_push(&url, "tok", Some(&proxy)).await.unwrap_err();
        assert!(err.to_string().contains("407"));
    }
}
