//! Tunnel connection management
//!
//! Owns the single long-lived TCP connection between the two relays: accepting
//! it on the responder side, dialing and redialing it with backoff on the
//! requester side, and exposing a "send frame / frames arrive" interface that
//! hides reconnect churn from relay logic.

pub mod dialer;
pub mod listener;
pub mod reconnect;
pub mod tunnel;

pub use dialer::{with_default_port, TunnelDialer};
pub use listener::TunnelListener;
pub use reconnect::{Backoff, ReconnectConfig};
pub use tunnel::{ConnectionId, TunnelConnection, TunnelSender};

use hdhr_relay_proto::FrameError;
use std::net::SocketAddr;
use thiserror::Error;

/// Connection errors
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Tunnel not connected")]
    NotConnected,

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("Unknown host: {0}")]
    UnknownHost(String),

    #[error("Failed to resolve {peer}: {source}")]
    Resolve {
        peer: String,
        source: std::io::Error,
    },

    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
