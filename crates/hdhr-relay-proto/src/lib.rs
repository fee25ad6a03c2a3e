//! Tunnel Protocol Definitions
//!
//! This crate defines the frame format exchanged between the two discovery
//! relays, the stream codec that carries it over the tunnel, and a small
//! inspector for HDHomeRun discovery packets.

pub mod codec;
pub mod frame;
pub mod hdhomerun;

pub use codec::{FrameCodec, FrameError};
pub use frame::Frame;

/// UDP port HDHomeRun devices and apps use for discovery broadcasts
pub const HDHOMERUN_DISCOVER_UDP_PORT: u16 = 65001;

/// Default TCP port of the tunnel between the two relays
pub const DEFAULT_TUNNEL_PORT: u16 = HDHOMERUN_DISCOVER_UDP_PORT;

/// Largest discovery datagram the relays will carry (2 KiB)
pub const MAX_DATAGRAM_SIZE: usize = 2048;

/// Size of the frame length prefix
pub const LENGTH_FIELD_SIZE: usize = 2;

/// Largest encoded origin address (IPv6 address + port)
pub const MAX_ORIGIN_SIZE: usize = 18;

/// Largest value the frame length prefix may declare
pub const MAX_FRAME_LEN: usize = 1 + MAX_ORIGIN_SIZE + MAX_DATAGRAM_SIZE;
