//! Requester-side connection management

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;

use crate::reconnect::{Backoff, ReconnectConfig};
use crate::tunnel::{TunnelConnection, TunnelSender};
use crate::ConnectionError;

/// Upper bound on a single TCP connect attempt
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Append `default_port` to a peer given without one
///
/// Accepts `host`, `host:port`, `1.2.3.4`, `1.2.3.4:port`, `::1` and
/// `[::1]:port`.
pub fn with_default_port(peer: &str, default_port: u16) -> String {
    if peer.parse::<SocketAddr>().is_ok() {
        return peer.to_string();
    }

    match peer.parse::<IpAddr>() {
        Ok(IpAddr::V6(ip)) => format!("[{}]:{}", ip, default_port),
        Ok(IpAddr::V4(ip)) => format!("{}:{}", ip, default_port),
        Err(_) if peer.contains(':') => peer.to_string(),
        Err(_) => format!("{}:{}", peer, default_port),
    }
}

/// Resolver messages that mean the name does not exist
///
/// std reports getaddrinfo failures as uncategorized errors carrying the
/// resolver's text, so the text is all there is to go on.
const NAME_NOT_FOUND: &[&str] = &[
    "Name or service not known",
    "No address associated with hostname",
    "nodename nor servname provided, or not known",
    "Name does not resolve",
];

/// Whether a lookup failure is permanent rather than a resolver hiccup
fn is_name_not_found(error: &io::Error) -> bool {
    // Malformed "host:port" strings never resolve either
    if error.kind() == io::ErrorKind::InvalidInput {
        return true;
    }

    // WSAHOST_NOT_FOUND, WSANO_DATA
    #[cfg(windows)]
    if matches!(error.raw_os_error(), Some(11001 | 11004)) {
        return true;
    }

    let message = error.to_string();
    NAME_NOT_FOUND.iter().any(|known| message.contains(known))
}

fn lookup_error(peer: &str, source: io::Error) -> ConnectionError {
    if is_name_not_found(&source) {
        ConnectionError::UnknownHost(peer.to_string())
    } else {
        ConnectionError::Resolve {
            peer: peer.to_string(),
            source,
        }
    }
}

/// Dials the responder-side relay and keeps retrying until it answers
pub struct TunnelDialer {
    peer: String,
    sender: TunnelSender,
    backoff: Backoff,
    connected_once: bool,
}

impl TunnelDialer {
    /// `peer` must be in `host:port` form, see [`with_default_port`]
    pub fn new(peer: impl Into<String>, sender: TunnelSender, config: ReconnectConfig) -> Self {
        Self {
            peer: peer.into(),
            sender,
            backoff: Backoff::new(config),
            connected_once: false,
        }
    }

    pub fn sender(&self) -> &TunnelSender {
        &self.sender
    }

    /// Connect, retrying with backoff until a connection is established
    ///
    /// Only fails when the resolver reports that the peer host does not
    /// exist and no connection has succeeded yet. Every other failure,
    /// including a resolver that is not reachable yet, is retried forever.
    pub async fn connect(&mut self) -> Result<TunnelConnection, ConnectionError> {
        loop {
            tracing::info!(peer = %self.peer, "Connecting to peer relay...");

            match self.try_connect().await {
                Ok(connection) => {
                    self.backoff.reset();
                    self.connected_once = true;
                    return Ok(connection);
                }
                Err(ConnectionError::UnknownHost(host)) if !self.connected_once => {
                    return Err(ConnectionError::UnknownHost(host));
                }
                Err(e) => {
                    let delay = self.backoff.next_delay();
                    tracing::warn!(
                        peer = %self.peer,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Failed to connect to peer relay"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Back off after an established connection was lost
    pub async fn wait_before_reconnect(&mut self) {
        let delay = self.backoff.next_delay();
        tracing::info!(
            retry_in_ms = delay.as_millis() as u64,
            retries = self.backoff.retries(),
            "Reconnecting to peer relay"
        );
        tokio::time::sleep(delay).await;
    }

    async fn try_connect(&self) -> Result<TunnelConnection, ConnectionError> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host(&self.peer)
            .await
            .map_err(|source| lookup_error(&self.peer, source))?
            .collect();

        if addrs.is_empty() {
            return Err(ConnectionError::UnknownHost(self.peer.clone()));
        }

        let mut last_error = None;
        for addr in addrs {
            match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => return self.sender.attach(stream).await,
                Ok(Err(source)) => {
                    tracing::debug!(addr = %addr, error = %source, "Connect attempt failed");
                    last_error = Some(ConnectionError::Connect { addr, source });
                }
                Err(_) => {
                    tracing::debug!(addr = %addr, "Connect attempt timed out");
                    last_error = Some(ConnectionError::Connect {
                        addr,
                        source: std::io::ErrorKind::TimedOut.into(),
                    });
                }
            }
        }

        Err(last_error.unwrap_or_else(|| ConnectionError::UnknownHost(self.peer.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver_error(detail: &str) -> io::Error {
        io::Error::new(
            io::ErrorKind::Other,
            format!("failed to lookup address information: {}", detail),
        )
    }

    #[test]
    fn test_unknown_name_is_permanent() {
        for detail in [
            "Name or service not known",
            "No address associated with hostname",
            "nodename nor servname provided, or not known",
        ] {
            let error = lookup_error("tuners.example:65001", resolver_error(detail));
            assert!(
                matches!(error, ConnectionError::UnknownHost(ref peer) if peer == "tuners.example:65001"),
                "{detail} should be permanent"
            );
        }
    }

    #[test]
    fn test_resolver_outage_is_retried() {
        for detail in [
            "Temporary failure in name resolution",
            "System error",
            "Try again",
        ] {
            let error = lookup_error("tuners.example:65001", resolver_error(detail));
            assert!(
                matches!(error, ConnectionError::Resolve { .. }),
                "{detail} should be retried"
            );
        }

        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert!(matches!(
            lookup_error("tuners.example:65001", refused),
            ConnectionError::Resolve { .. }
        ));
    }

    #[test]
    fn test_malformed_peer_is_permanent() {
        let error = io::Error::new(io::ErrorKind::InvalidInput, "invalid socket address");
        assert!(matches!(
            lookup_error("tuners.example", error),
            ConnectionError::UnknownHost(_)
        ));
    }

    #[test]
    fn test_with_default_port() {
        assert_eq!(with_default_port("tuner-net.local", 65001), "tuner-net.local:65001");
        assert_eq!(with_default_port("tuner-net.local:9000", 65001), "tuner-net.local:9000");
        assert_eq!(with_default_port("10.8.0.1", 65001), "10.8.0.1:65001");
        assert_eq!(with_default_port("10.8.0.1:7000", 65001), "10.8.0.1:7000");
        assert_eq!(with_default_port("fd00::1", 65001), "[fd00::1]:65001");
        assert_eq!(with_default_port("[fd00::1]:7000", 65001), "[fd00::1]:7000");
    }
}
