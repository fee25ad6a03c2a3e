//! Responder-side discovery relay
//!
//! Runs on the network that hosts the HDHomeRun devices. Accepts the tunnel
//! from the requester-side relay, re-broadcasts every forwarded discovery
//! request on the local network, and sends each reply back over the tunnel
//! tagged with the address of the client that asked.
//!
//! # Example Usage
//!
//! ```no_run
//! use hdhr_relay_responder::{Responder, ResponderConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let responder = Responder::bind(ResponderConfig::default()).await?;
//!     responder.run().await?;
//!     Ok(())
//! }
//! ```

mod query;

pub use query::query_devices;

use hdhr_relay_connection::{ConnectionError, TunnelConnection, TunnelListener, TunnelSender};
use hdhr_relay_proto::{DEFAULT_TUNNEL_PORT, HDHOMERUN_DISCOVER_UDP_PORT};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;

/// Pause after a failed accept before listening again
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Errors that stop the responder
#[derive(Error, Debug)]
pub enum ResponderError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
}

/// Configuration for the responder-side relay
#[derive(Debug, Clone)]
pub struct ResponderConfig {
    /// Address the tunnel listener binds to
    pub bind_addr: SocketAddr,

    /// Where forwarded requests are re-emitted: the subnet broadcast address,
    /// or a single device for targeted sends
    pub target_addr: SocketAddr,

    /// How long to collect replies for one forwarded request
    pub response_window: Duration,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            bind_addr: (Ipv4Addr::UNSPECIFIED, DEFAULT_TUNNEL_PORT).into(),
            target_addr: (Ipv4Addr::BROADCAST, HDHOMERUN_DISCOVER_UDP_PORT).into(),
            response_window: Duration::from_millis(500),
        }
    }
}

/// The responder-side relay
pub struct Responder {
    config: ResponderConfig,
    listener: TunnelListener,
}

impl Responder {
    /// Bind the tunnel listener
    ///
    /// Fails if the port cannot be bound; that is not retried.
    pub async fn bind(config: ResponderConfig) -> Result<Self, ResponderError> {
        let listener = TunnelListener::bind(config.bind_addr, TunnelSender::new()).await?;
        Ok(Self { config, listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ResponderError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept tunnel connections forever
    ///
    /// Each new connection replaces the previous one. Only a failure at
    /// startup is returned; data-plane errors are logged.
    pub async fn run(self) -> Result<(), ResponderError> {
        tracing::info!(
            bind_addr = %self.config.bind_addr,
            target_addr = %self.config.target_addr,
            response_window_ms = self.config.response_window.as_millis() as u64,
            "Responder relay waiting for requester relay"
        );

        // Dropping the set aborts every connection task
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let connection = match accepted {
                        Ok(connection) => connection,
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to accept tunnel connection");
                            tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                            continue;
                        }
                    };

                    connections.spawn(serve_connection(
                        connection,
                        self.listener.sender().clone(),
                        self.config.clone(),
                    ));
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }
    }
}

/// Handle frames from one tunnel connection until it ends
async fn serve_connection(
    mut connection: TunnelConnection,
    tunnel: TunnelSender,
    config: ResponderConfig,
) {
    let peer = connection.peer_addr();
    let connection_id = connection.id();

    // Response windows still open when the connection ends are aborted with it
    let mut queries = JoinSet::new();

    loop {
        tokio::select! {
            item = connection.next_frame() => {
                let request = match item {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => {
                        tracing::warn!(peer = %peer, error = %e, "Closing tunnel connection");
                        break;
                    }
                    None => break,
                };

                tracing::debug!(
                    peer = %peer,
                    bytes = request.payload.len(),
                    origin = ?request.origin,
                    "Forwarded request received"
                );

                queries.spawn(query_devices(
                    request,
                    config.target_addr,
                    config.response_window,
                    tunnel.clone(),
                    connection_id,
                ));
            }
            Some(result) = queries.join_next(), if !queries.is_empty() => {
                match result {
                    Ok(Ok(replies)) => tracing::debug!(replies, "Response window closed"),
                    Ok(Err(e)) => tracing::warn!(
                        target_addr = %config.target_addr,
                        error = %e,
                        "Failed to query devices"
                    ),
                    Err(e) => tracing::warn!(error = %e, "Query task failed"),
                }
            }
        }
    }

    tracing::info!(peer = %peer, connection_id, "Tunnel connection lost");
}
