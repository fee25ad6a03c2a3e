//! Requester-side discovery relay
//!
//! Runs on the network with the HDHomeRun apps. Listens for discovery
//! broadcasts, forwards each one over the tunnel to the responder-side relay,
//! and unicasts every reply that comes back to the client that asked.
//!
//! # Architecture
//!
//! Three tasks share the discovery socket, the tunnel sender and the pending
//! transaction queue:
//!
//! 1. **Discovery loop**: local broadcast → pending transaction → tunnel frame
//! 2. **Tunnel loop**: dial, read reply frames, match, unicast; redial on loss
//! 3. **Sweep**: evict transactions that outlived the staleness window

pub mod pending;
mod socket;

pub use pending::{PendingTransaction, PendingTransactions, TransactionId};
pub use socket::bind_discovery_socket;

use bytes::Bytes;
use hdhr_relay_connection::{ConnectionError, ReconnectConfig, TunnelDialer, TunnelSender};
use hdhr_relay_proto::{Frame, DEFAULT_TUNNEL_PORT, HDHOMERUN_DISCOVER_UDP_PORT, MAX_DATAGRAM_SIZE};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

/// Pause after a local socket error before receiving again
const RECV_ERROR_DELAY: Duration = Duration::from_millis(100);

/// Errors that stop the requester
#[derive(Error, Debug)]
pub enum RequesterError {
    #[error("Failed to bind discovery socket {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
}

/// Configuration for the requester-side relay
#[derive(Debug, Clone)]
pub struct RequesterConfig {
    /// Responder-side relay address (host:port)
    pub peer: String,

    /// Local address the discovery socket binds to
    pub discovery_addr: SocketAddr,

    /// How long a forwarded request waits for replies
    pub pending_timeout: Duration,

    /// How often stale transactions are evicted
    pub sweep_interval: Duration,

    /// Backoff between tunnel connection attempts
    pub reconnect: ReconnectConfig,
}

impl Default for RequesterConfig {
    fn default() -> Self {
        Self {
            peer: format!("localhost:{}", DEFAULT_TUNNEL_PORT),
            discovery_addr: (Ipv4Addr::UNSPECIFIED, HDHOMERUN_DISCOVER_UDP_PORT).into(),
            pending_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(1),
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// The requester-side relay
pub struct Requester {
    config: RequesterConfig,
    socket: Arc<UdpSocket>,
    tunnel: TunnelSender,
    pending: PendingTransactions,
}

impl Requester {
    /// Bind the discovery socket
    ///
    /// Fails if the socket cannot be bound; that is not retried.
    pub async fn bind(config: RequesterConfig) -> Result<Self, RequesterError> {
        let addr = config.discovery_addr;
        let socket =
            bind_discovery_socket(addr).map_err(|source| RequesterError::Bind { addr, source })?;

        tracing::info!(addr = %addr, "Listening for discovery broadcasts");

        Ok(Self {
            pending: PendingTransactions::new(config.pending_timeout),
            socket: Arc::new(socket),
            tunnel: TunnelSender::new(),
            config,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn tunnel(&self) -> &TunnelSender {
        &self.tunnel
    }

    pub fn pending(&self) -> &PendingTransactions {
        &self.pending
    }

    /// Relay until a fatal error
    ///
    /// Only a peer host the resolver does not know, before the first
    /// connection, ends the relay. Everything else is logged and retried.
    pub async fn run(self) -> Result<(), RequesterError> {
        tracing::info!(
            peer = %self.config.peer,
            pending_timeout_ms = self.config.pending_timeout.as_millis() as u64,
            "Requester relay starting"
        );

        // Dropping the set stops the background loops
        let mut tasks = JoinSet::new();
        tasks.spawn(discovery_loop(
            self.socket.clone(),
            self.tunnel.clone(),
            self.pending.clone(),
        ));
        tasks.spawn(sweep_loop(self.pending.clone(), self.config.sweep_interval));

        let dialer = TunnelDialer::new(
            self.config.peer.clone(),
            self.tunnel.clone(),
            self.config.reconnect.clone(),
        );

        tunnel_loop(dialer, self.socket, self.pending).await
    }
}

/// Forward local discovery broadcasts over the tunnel
async fn discovery_loop(socket: Arc<UdpSocket>, tunnel: TunnelSender, pending: PendingTransactions) {
    // One spare byte detects oversized datagrams
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE + 1];

    loop {
        let (len, origin) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                tracing::warn!(error = %e, "Discovery socket receive failed");
                tokio::time::sleep(RECV_ERROR_DELAY).await;
                continue;
            }
        };

        if len > MAX_DATAGRAM_SIZE {
            tracing::warn!(origin = %origin, "Dropping oversized discovery datagram");
            continue;
        }

        if !tunnel.is_connected().await {
            tracing::debug!(origin = %origin, "No tunnel, dropping discovery request");
            continue;
        }

        // Registered before sending so a fast reply always finds it
        let id = pending.register(origin).await;
        let frame = Frame::from_origin(Bytes::copy_from_slice(&buf[..len]), origin);

        match tunnel.send(frame).await {
            Ok(()) => {
                tracing::debug!(id, origin = %origin, bytes = len, "Discovery request forwarded");
            }
            Err(e) => {
                pending.cancel(id).await;
                tracing::debug!(origin = %origin, error = %e, "Dropping discovery request");
            }
        }
    }
}

/// Periodically evict transactions nobody answered in time
async fn sweep_loop(pending: PendingTransactions, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        for transaction in pending.evict_expired().await {
            if transaction.replies == 0 {
                tracing::debug!(
                    id = transaction.id,
                    origin = %transaction.origin,
                    "Discovery transaction timed out without reply"
                );
            }
        }
    }
}

/// Keep the tunnel up and deliver reply frames
async fn tunnel_loop(
    mut dialer: TunnelDialer,
    socket: Arc<UdpSocket>,
    pending: PendingTransactions,
) -> Result<(), RequesterError> {
    loop {
        let mut connection = dialer.connect().await?;
        tracing::info!(peer = %connection.peer_addr(), "Connected to responder relay");

        while let Some(item) = connection.next_frame().await {
            match item {
                Ok(frame) => deliver_reply(&socket, &pending, frame).await,
                Err(e) => {
                    tracing::warn!(error = %e, "Closing tunnel connection");
                    break;
                }
            }
        }

        drop(connection);

        // Replies for these can no longer arrive
        let dropped = pending.clear().await;
        tracing::info!(dropped_pending = dropped, "Tunnel connection lost");

        dialer.wait_before_reconnect().await;
    }
}

/// Send one reply back to the client that asked
async fn deliver_reply(socket: &UdpSocket, pending: &PendingTransactions, frame: Frame) {
    let Some(transaction) = pending.resolve(frame.origin).await else {
        tracing::info!(
            origin = ?frame.origin,
            bytes = frame.payload.len(),
            "Discarding reply with no pending transaction"
        );
        return;
    };

    match socket.send_to(&frame.payload, transaction.origin).await {
        Ok(_) => tracing::debug!(
            id = transaction.id,
            origin = %transaction.origin,
            bytes = frame.payload.len(),
            "Reply delivered"
        ),
        Err(e) => tracing::warn!(
            origin = %transaction.origin,
            error = %e,
            "Failed to deliver reply"
        ),
    }
}
