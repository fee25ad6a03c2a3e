//! Codec for encoding/decoding tunnel frames

use bytes::{Buf, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::frame::{decode_origin, Frame};
use crate::{LENGTH_FIELD_SIZE, MAX_DATAGRAM_SIZE, MAX_FRAME_LEN};

/// Codec errors
///
/// Every variant except `PayloadTooLarge` ends the connection it was raised
/// on. The decoder never tries to resynchronize a damaged stream.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Truncated frame: stream ended with {buffered} bytes of an incomplete frame")]
    TruncatedFrame { buffered: usize },

    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Length-prefixed tunnel frame codec
///
/// Used with `FramedRead`/`FramedWrite` over the two halves of the tunnel
/// socket.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        // Need the length prefix first
        if src.len() < LENGTH_FIELD_SIZE {
            return Ok(None);
        }

        let frame_len = u16::from_be_bytes([src[0], src[1]]) as usize;

        // An implausible length means the stream is desynchronized
        if frame_len == 0 || frame_len > MAX_FRAME_LEN {
            return Err(FrameError::ProtocolViolation(format!(
                "declared frame length {} outside 1..={}",
                frame_len, MAX_FRAME_LEN
            )));
        }

        let total = LENGTH_FIELD_SIZE + frame_len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_FIELD_SIZE);
        let mut body = src.split_to(frame_len);

        let origin_len = body.get_u8() as usize;
        if origin_len > body.len() {
            return Err(FrameError::ProtocolViolation(format!(
                "origin length {} exceeds frame body of {} bytes",
                origin_len,
                body.len()
            )));
        }

        let origin_bytes = body.split_to(origin_len);
        let origin = decode_origin(&origin_bytes)?;

        if body.len() > MAX_DATAGRAM_SIZE {
            return Err(FrameError::ProtocolViolation(format!(
                "payload of {} bytes exceeds maximum {}",
                body.len(),
                MAX_DATAGRAM_SIZE
            )));
        }

        Ok(Some(Frame {
            payload: body.freeze(),
            origin,
        }))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None if buf.is_empty() => Ok(None),
            None => Err(FrameError::TruncatedFrame {
                buffered: buf.len(),
            }),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        item.encode_into(dst)
    }
}
