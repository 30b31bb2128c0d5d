//! Virtual channel multiplexing
//!
//! The control service opens TCP connections to the instance's S3 endpoint
//! through the push session. Each connection is a numbered virtual channel;
//! the first payload on an unknown channel opens a local connection to the
//! tunnel target, and either side may close it.
//!
//! Bytes received before the local connection is established are queued and
//! written in arrival order once it is up. Delivery never waits on a local
//! socket: each channel buffers peer bytes in its own queue, and reading the
//! socket does not wait for pending writes to it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tether_common::settings::TunnelTarget;
use tether_proto::{encode_close, encode_data};

/// Read size on local sockets
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Registry of open virtual channels for one push session
pub struct ChannelRegistry {
    target: TunnelTarget,
    outbound: mpsc::Sender<Vec<u8>>,
    active: Arc<DashMap<u8, VirtualChannel>>,
    next_id: AtomicU64,
}

struct VirtualChannel {
    id: u64,
    cancel_token: CancellationToken,
    data_tx: mpsc::UnboundedSender<Vec<u8>>,
}

enum ChannelEnd {
    /// Local socket ended; the peer must be told
    Local,
    /// Closed by the peer or by the session
    Remote,
}

impl ChannelRegistry {
    /// Registry forwarding to `target`; encoded frames for the peer go to `outbound`
    pub fn new(target: TunnelTarget, outbound: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            target,
            outbound,
            active: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Number of open channels
    pub fn len(&self) -> usize {
        self.active.len()
    }

    /// Whether no channel is open
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Whether `channel` is open
    pub fn contains(&self, channel: u8) -> bool {
        self.active.contains_key(&channel)
    }

    /// Queue peer bytes for the local socket of `channel`, opening it first
    /// if the channel is unknown. Returns without waiting for the socket.
    pub fn deliver(&self, channel: u8, data: Vec<u8>) {
        let data_tx = match self.active.get(&channel) {
            Some(existing) => existing.data_tx.clone(),
            None => self.open(channel),
        };
        if data_tx.send(data).is_err() {
            debug!(channel, "Payload for a channel that just ended");
        }
    }

    fn open(&self, channel: u8) -> mpsc::UnboundedSender<Vec<u8>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel_token = CancellationToken::new();
        let (data_tx, data_rx) = mpsc::unbounded_channel();

        debug!(channel, target = %self.target.addr(), "Opening virtual channel");
        self.active.insert(
            channel,
            VirtualChannel {
                id,
                cancel_token: cancel_token.clone(),
                data_tx: data_tx.clone(),
            },
        );

        tokio::spawn(run_channel(
            channel,
            id,
            self.target.clone(),
            data_rx,
            self.outbound.clone(),
            cancel_token,
            self.active.clone(),
        ));

        data_tx
    }

    /// Close `channel` on request of the peer. Unknown channels are ignored.
    pub fn close(&self, channel: u8) -> bool {
        if let Some((_, session)) = self.active.remove(&channel) {
            debug!(channel, "Closing virtual channel");
            session.cancel_token.cancel();
            true
        } else {
            false
        }
    }

    /// Close every open channel without notifying the peer
    pub fn close_all(&self) {
        let count = self.active.len();
        if count > 0 {
            info!(count, "Closing all virtual channels");
            self.active.retain(|_, session| {
                session.cancel_token.cancel();
                false
            });
        }
    }
}

impl Drop for ChannelRegistry {
    fn drop(&mut self) {
        self.close_all();
    }
}

async fn run_channel(
    channel: u8,
    id: u64,
    target: TunnelTarget,
    data_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    outbound: mpsc::Sender<Vec<u8>>,
    cancel_token: CancellationToken,
    active: Arc<DashMap<u8, VirtualChannel>>,
) {
    let connected = tokio::select! {
        _ = cancel_token.cancelled() => return,
        result = TcpStream::connect(target.addr()) => result,
    };

    let stream = match connected {
        Ok(stream) => stream,
        Err(e) => {
            warn!(channel, target = %target.addr(), error = %e, "Could not open tunnel connection");
            active.remove_if(&channel, |_, session| session.id == id);
            let _ = outbound.send(encode_close(channel)).await;
            return;
        }
    };

    let (reader, writer) = stream.into_split();

    // both directions are polled independently; a local peer that stops
    // reading does not stop its responses from flowing upstream
    let end = tokio::select! {
        _ = cancel_token.cancelled() => ChannelEnd::Remote,
        end = pump_to_local(channel, writer, data_rx) => end,
        end = pump_to_peer(channel, reader, &outbound) => end,
    };

    if let ChannelEnd::Local = end {
        debug!(channel, "Local end closed virtual channel");
        active.remove_if(&channel, |_, session| session.id == id);
        let _ = outbound.send(encode_close(channel)).await;
    }
}

/// Write queued peer bytes to the local socket. Dropping the write half
/// shuts the socket down for writing.
async fn pump_to_local(
    channel: u8,
    mut writer: OwnedWriteHalf,
    mut data_rx: mpsc::UnboundedReceiver<Vec<u8>>,
) -> ChannelEnd {
    while let Some(bytes) = data_rx.recv().await {
        if let Err(e) = writer.write_all(&bytes).await {
            debug!(channel, error = %e, "Tunnel write failed");
            return ChannelEnd::Local;
        }
    }
    let _ = writer.shutdown().await;
    ChannelEnd::Remote
}

/// Forward local socket bytes upstream as channel payloads
async fn pump_to_peer(
    channel: u8,
    mut reader: OwnedReadHalf,
    outbound: &mpsc::Sender<Vec<u8>>,
) -> ChannelEnd {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => return ChannelEnd::Local,
            Ok(n) => {
                if outbound.send(encode_data(channel, &buf[..n])).await.is_err() {
                    return ChannelEnd::Remote;
                }
            }
            Err(e) => {
                debug!(channel, error = %e, "Tunnel read failed");
                return ChannelEnd::Local;
            }
        }
    }
}
