//! Responder-side connection management

use std::net::SocketAddr;
use tokio::net::TcpListener;

use crate::tunnel::{TunnelConnection, TunnelSender};
use crate::ConnectionError;

/// Accepts tunnel connections from the requester-side relay
///
/// Only one tunnel is meaningful at a time: every accepted connection becomes
/// the active one and closes its predecessor.
pub struct TunnelListener {
    listener: TcpListener,
    sender: TunnelSender,
}

impl TunnelListener {
    /// Bind the listening socket
    ///
    /// A bind failure is a configuration error and is not retried.
    pub async fn bind(addr: SocketAddr, sender: TunnelSender) -> Result<Self, ConnectionError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ConnectionError::Bind { addr, source })?;

        tracing::info!(addr = %addr, "Tunnel listener bound");

        Ok(Self { listener, sender })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ConnectionError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn sender(&self) -> &TunnelSender {
        &self.sender
    }

    /// Wait for the next connection and make it the active tunnel
    pub async fn accept(&self) -> Result<TunnelConnection, ConnectionError> {
        let (stream, peer) = self.listener.accept().await?;
        tracing::info!(peer = %peer, "Peer relay connected");
        self.sender.attach(stream).await
    }
}
