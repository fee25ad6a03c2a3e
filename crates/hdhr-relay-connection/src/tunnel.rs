//! The single active tunnel connection
//!
//! A relay process owns at most one established tunnel at a time. Relay logic
//! only sees two handles:
//!
//! - [`TunnelSender`]: cloneable, sends frames over whatever connection is
//!   currently active and reports `NotConnected` otherwise.
//! - [`TunnelConnection`]: the inbound frame sequence of one connection. It
//!   ends when that connection drops or is replaced.
//!
//! Writes are serialized by a dedicated writer task per connection, so frames
//! sent concurrently from several response windows never interleave.

use futures::{SinkExt, StreamExt};
use hdhr_relay_proto::{Frame, FrameCodec, FrameError, MAX_DATAGRAM_SIZE};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::ConnectionError;

/// Frames queued for the writer before `send` starts waiting
const WRITE_QUEUE_DEPTH: usize = 64;

/// Idle time before TCP keepalive starts
const KEEPALIVE_TIME: Duration = Duration::from_secs(30);

/// Identifier of one established connection
pub type ConnectionId = u64;

struct ActiveTunnel {
    id: ConnectionId,
    peer: SocketAddr,
    tx: mpsc::Sender<Frame>,
    closed: CancellationToken,
}

/// Handle for sending frames over the active tunnel
#[derive(Clone, Default)]
pub struct TunnelSender {
    active: Arc<Mutex<Option<ActiveTunnel>>>,
    next_id: Arc<AtomicU64>,
}

impl TunnelSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send a frame over the active connection
    ///
    /// Fails with `NotConnected` when no tunnel is established. Callers drop
    /// the datagram in that case; discovery clients rebroadcast on their own.
    pub async fn send(&self, frame: Frame) -> Result<(), ConnectionError> {
        self.send_checked(frame, None).await
    }

    /// Send a frame only if connection `id` is still the active one
    ///
    /// Replies to a request belong on the connection the request came in
    /// on. Once that connection has been replaced or lost this fails with
    /// `NotConnected` instead of writing to its successor.
    pub async fn send_on(&self, id: ConnectionId, frame: Frame) -> Result<(), ConnectionError> {
        self.send_checked(frame, Some(id)).await
    }

    async fn send_checked(
        &self,
        frame: Frame,
        expected: Option<ConnectionId>,
    ) -> Result<(), ConnectionError> {
        if frame.payload.len() > MAX_DATAGRAM_SIZE {
            return Err(FrameError::PayloadTooLarge(frame.payload.len()).into());
        }

        let tx = {
            let active = self.active.lock().await;
            match active.as_ref() {
                Some(tunnel) if expected.map_or(true, |id| id == tunnel.id) => tunnel.tx.clone(),
                _ => return Err(ConnectionError::NotConnected),
            }
        };

        tx.send(frame)
            .await
            .map_err(|_| ConnectionError::NotConnected)
    }

    pub async fn is_connected(&self) -> bool {
        self.active.lock().await.is_some()
    }

    /// Make `stream` the active tunnel, closing any previous one
    pub async fn attach(&self, stream: TcpStream) -> Result<TunnelConnection, ConnectionError> {
        configure_stream(&stream)?;
        let peer = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let closed = CancellationToken::new();
        let (tx, rx) = mpsc::channel(WRITE_QUEUE_DEPTH);

        let previous = {
            let mut active = self.active.lock().await;
            active.replace(ActiveTunnel {
                id,
                peer,
                tx,
                closed: closed.clone(),
            })
        };

        if let Some(previous) = previous {
            tracing::info!(
                previous_peer = %previous.peer,
                peer = %peer,
                "Replacing existing tunnel connection"
            );
            previous.closed.cancel();
        }

        tokio::spawn(write_loop(
            self.clone(),
            id,
            FramedWrite::new(write_half, FrameCodec),
            rx,
            closed.clone(),
        ));

        tracing::info!(connection_id = id, peer = %peer, "Tunnel connection established");

        Ok(TunnelConnection::new(id, peer, read_half, closed))
    }

    /// Forget connection `id` if it is still the active one
    async fn detach(&self, id: ConnectionId) {
        let mut active = self.active.lock().await;
        if active.as_ref().map(|tunnel| tunnel.id) == Some(id) {
            active.take();
        }
    }
}

async fn write_loop(
    sender: TunnelSender,
    id: ConnectionId,
    mut sink: FramedWrite<OwnedWriteHalf, FrameCodec>,
    mut rx: mpsc::Receiver<Frame>,
    closed: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = sink.send(frame).await {
                    tracing::warn!(connection_id = id, error = %e, "Tunnel write failed");
                    closed.cancel();
                    break;
                }
            }
        }
    }

    sender.detach(id).await;

    // Half-close so the peer sees the connection go away
    let _ = sink.close().await;
    tracing::debug!(connection_id = id, "Tunnel writer stopped");
}

fn configure_stream(stream: &TcpStream) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    let keepalive = socket2::TcpKeepalive::new().with_time(KEEPALIVE_TIME);
    socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
    Ok(())
}

/// Inbound side of one established tunnel connection
///
/// Yields frames in the order the peer sent them. The sequence is finite and
/// cannot be restarted: once it ends, wait for a new connection.
pub struct TunnelConnection {
    id: ConnectionId,
    peer: SocketAddr,
    frames: FramedRead<OwnedReadHalf, FrameCodec>,
    closed: CancellationToken,
    _guard: DropGuard,
}

impl TunnelConnection {
    fn new(
        id: ConnectionId,
        peer: SocketAddr,
        read_half: OwnedReadHalf,
        closed: CancellationToken,
    ) -> Self {
        Self {
            id,
            peer,
            frames: FramedRead::new(read_half, FrameCodec),
            _guard: closed.clone().drop_guard(),
            closed,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Next inbound frame
    ///
    /// Returns `None` once the connection has closed or been replaced. An
    /// `Err` means the stream is unusable; the connection is closed before
    /// the error is returned.
    pub async fn next_frame(&mut self) -> Option<Result<Frame, FrameError>> {
        let item = tokio::select! {
            _ = self.closed.cancelled() => None,
            item = self.frames.next() => item,
        };

        if !matches!(item, Some(Ok(_))) {
            self.closed.cancel();
        }

        item
    }
}
