//! Tunnel frame type

use bytes::{BufMut, Bytes, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::codec::FrameError;
use crate::{LENGTH_FIELD_SIZE, MAX_DATAGRAM_SIZE};

/// Unit of transfer across the tunnel
///
/// Carries one discovery datagram plus the address of the client that
/// originally broadcast the request. Replies travel back with the same
/// origin so the requester side knows where to deliver them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: Bytes,
    pub origin: Option<SocketAddr>,
}

impl Frame {
    pub fn new(payload: impl Into<Bytes>, origin: Option<SocketAddr>) -> Self {
        Self {
            payload: payload.into(),
            origin,
        }
    }

    /// Frame carrying a datagram received from `origin`
    pub fn from_origin(payload: impl Into<Bytes>, origin: SocketAddr) -> Self {
        Self::new(payload, Some(origin))
    }

    /// Number of bytes the origin occupies on the wire
    pub fn origin_len(&self) -> usize {
        match self.origin {
            None => 0,
            Some(SocketAddr::V4(_)) => 6,
            Some(SocketAddr::V6(_)) => 18,
        }
    }

    /// Value written into the length prefix
    pub fn frame_len(&self) -> usize {
        1 + self.origin_len() + self.payload.len()
    }

    /// Write the frame to `dst`
    ///
    /// Format: [frame_len: u16][origin_len: u8][origin][payload]
    pub fn encode_into(&self, dst: &mut BytesMut) -> Result<(), FrameError> {
        if self.payload.len() > MAX_DATAGRAM_SIZE {
            return Err(FrameError::PayloadTooLarge(self.payload.len()));
        }

        dst.reserve(LENGTH_FIELD_SIZE + self.frame_len());
        dst.put_u16(self.frame_len() as u16);
        dst.put_u8(self.origin_len() as u8);

        match self.origin {
            None => {}
            Some(SocketAddr::V4(addr)) => {
                dst.put_slice(&addr.ip().octets());
                dst.put_u16(addr.port());
            }
            Some(SocketAddr::V6(addr)) => {
                dst.put_slice(&addr.ip().octets());
                dst.put_u16(addr.port());
            }
        }

        dst.put_slice(&self.payload);
        Ok(())
    }

    /// Encode the frame to a standalone buffer
    pub fn to_bytes(&self) -> Result<Bytes, FrameError> {
        let mut buf = BytesMut::with_capacity(LENGTH_FIELD_SIZE + self.frame_len());
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }
}

/// Parse an origin field of the given length
pub(crate) fn decode_origin(bytes: &[u8]) -> Result<Option<SocketAddr>, FrameError> {
    match bytes.len() {
        0 => Ok(None),
        6 => {
            let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
            let port = u16::from_be_bytes([bytes[4], bytes[5]]);
            Ok(Some(SocketAddr::new(IpAddr::V4(ip), port)))
        }
        18 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&bytes[..16]);
            let port = u16::from_be_bytes([bytes[16], bytes[17]]);
            Ok(Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)))
        }
        other => Err(FrameError::ProtocolViolation(format!(
            "invalid origin length {}",
            other
        ))),
    }
}
