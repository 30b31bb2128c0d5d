//! Agent relay
//!
//! Side processes of a gateway deployment watch the relay instead of talking
//! to the control service themselves. Every WebSocket client connected to
//! `/watch` receives the currently loaded overlay on connect and every newly
//! applied overlay afterwards, as a `NEW_OVERLAY` text envelope.
//!
//! Idle clients are swept periodically: a client that did not answer the
//! previous ping is closed with code 1000, otherwise it is pinged again.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, RwLock};
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tether_agent::Reconciler;
use tether_common::protocol::RelayEnvelope;
use tether_common::settings::{RelaySettings, RELAY_WATCH_PATH};
use tether_common::{ConfigOverlay, Error, Result};

/// Close reason sent to clients that stopped answering pings
pub const IDLE_CLOSE_REASON: &str = "Connection idle";

/// Envelopes buffered per client before it is considered lagging
const UPDATE_FEED_CAPACITY: usize = 16;

/// Time an idle client gets to acknowledge the close
const CLOSE_GRACE_PERIOD: Duration = Duration::from_secs(5);

#[derive(Clone)]
struct RelayState {
    loaded: Arc<RwLock<ConfigOverlay>>,
    updates: broadcast::Sender<String>,
    liveness_interval: Duration,
    shutdown: CancellationToken,
}

/// WebSocket relay of applied overlays
pub struct AgentRelay {
    settings: RelaySettings,
    reconciler: Arc<Reconciler>,
    applied: broadcast::Receiver<ConfigOverlay>,
    loaded: Arc<RwLock<ConfigOverlay>>,
    updates: broadcast::Sender<String>,
}

impl AgentRelay {
    /// Create a relay starting from `loaded`, the overlay applied at bootstrap.
    ///
    /// The relay subscribes to applied overlays immediately, so it must be
    /// created before the transport starts.
    pub fn new(settings: RelaySettings, reconciler: Arc<Reconciler>, loaded: ConfigOverlay) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_FEED_CAPACITY);
        Self {
            applied: reconciler.subscribe_applied(),
            settings,
            reconciler,
            loaded: Arc::new(RwLock::new(loaded)),
            updates,
        }
    }

    /// Bind the configured listen address
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = format!("{}:{}", self.settings.bind_host, self.settings.port);
        TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::transport(format!("could not listen on {}: {}", addr, e)))
    }

    /// Serve clients on `listener` until `shutdown` fires
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let addr: Option<SocketAddr> = listener.local_addr().ok();
        info!(addr = ?addr, path = RELAY_WATCH_PATH, "Starting agent relay");

        let state = RelayState {
            loaded: self.loaded,
            updates: self.updates,
            liveness_interval: self.settings.liveness_interval,
            shutdown: shutdown.clone(),
        };
        let forwarder = tokio::spawn(forward_applied(
            self.applied,
            self.reconciler,
            state.clone(),
        ));

        let app = Router::new()
            .route(RELAY_WATCH_PATH, get(watch_handler))
            .with_state(state);

        let result = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.clone().cancelled_owned())
            .await
            .map_err(|e| Error::transport(format!("relay server error: {}", e)));

        shutdown.cancel();
        let _ = forwarder.await;
        info!("Agent relay stopped");
        result
    }
}

fn envelope(overlay: &ConfigOverlay) -> Result<String> {
    Ok(serde_json::to_string(&RelayEnvelope::new_overlay(overlay.clone()))?)
}

async fn forward_applied(
    mut applied: broadcast::Receiver<ConfigOverlay>,
    reconciler: Arc<Reconciler>,
    state: RelayState,
) {
    loop {
        let overlay = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            received = applied.recv() => match received {
                Ok(overlay) => overlay,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Relay missed applied overlays");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        let mut loaded = state.loaded.write().await;
        if let Err(e) = reconciler.save(Some(&*loaded), &overlay).await {
            // watchers keep the last overlay that made it to the store
            error!(
                configuration_version = ?overlay.version,
                error = %e,
                "Could not save overlay from relay, not announcing it"
            );
            continue;
        }
        *loaded = overlay;

        match envelope(&loaded) {
            Ok(text) => {
                let receivers = state.updates.send(text).unwrap_or(0);
                debug!(
                    configuration_version = ?loaded.version,
                    clients = receivers,
                    "Broadcast new overlay"
                );
            }
            Err(e) => error!(error = %e, "Could not encode overlay envelope"),
        }
    }
}

async fn watch_handler(ws: WebSocketUpgrade, State(state): State<RelayState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_client(socket, state))
}

async fn handle_client(socket: WebSocket, state: RelayState) {
    debug!("Relay client connected");
    let (mut sender, mut receiver) = socket.split();
    let mut updates = state.updates.subscribe();

    let initial = envelope(&*state.loaded.read().await);
    match initial {
        Ok(text) => {
            if sender.send(Message::Text(text.into())).await.is_err() {
                return;
            }
        }
        Err(e) => {
            error!(error = %e, "Could not encode overlay envelope");
            return;
        }
    }

    let mut alive = true;
    let mut sweep = interval_at(
        Instant::now() + state.liveness_interval,
        state.liveness_interval,
    );

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
            _ = sweep.tick() => {
                if !alive {
                    info!("Closing idle relay client");
                    let _ = sender
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::NORMAL,
                            reason: IDLE_CLOSE_REASON.into(),
                        })))
                        .await;
                    let _ = tokio::time::timeout(CLOSE_GRACE_PERIOD, async {
                        while let Some(Ok(message)) = receiver.next().await {
                            if let Message::Close(_) = message {
                                break;
                            }
                        }
                    })
                    .await;
                    break;
                }
                alive = false;
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
            }
            update = updates.recv() => {
                let text = match update {
                    Ok(text) => text,
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        match envelope(&*state.loaded.read().await) {
                            Ok(text) => text,
                            Err(_) => continue,
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            message = receiver.next() => match message {
                Some(Ok(Message::Pong(_))) => alive = true,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "Relay client read failed");
                    break;
                }
            },
        }
    }
    debug!("Relay client disconnected");
}
