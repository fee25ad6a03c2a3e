//! HDHomeRun discovery packet inspector
//!
//! The relays treat discovery datagrams as opaque bytes. This module is only
//! used by the `dump` diagnostic command to show what an app or tuner is
//! broadcasting.
//!
//! Packet layout: [type: u16 BE][length: u16 BE][payload][crc: u32 LE]

use thiserror::Error;

/// Header size: type (2) + length (2)
pub const HEADER_SIZE: usize = 4;

/// Trailing CRC size
pub const CRC_SIZE: usize = 4;

/// Packet parse errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("Packet too short: {0} bytes")]
    TooShort(usize),

    #[error("Length mismatch: header declares {declared} payload bytes, packet carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Tag 0x{tag:02x} runs past the end of the payload")]
    TruncatedTag { tag: u8 },
}

/// Known packet types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    DiscoverRequest,
    DiscoverReply,
    GetSetRequest,
    GetSetReply,
    UpgradeRequest,
    UpgradeReply,
    Unknown(u16),
}

impl From<u16> for PacketType {
    fn from(value: u16) -> Self {
        match value {
            2 => PacketType::DiscoverRequest,
            3 => PacketType::DiscoverReply,
            4 => PacketType::GetSetRequest,
            5 => PacketType::GetSetReply,
            6 => PacketType::UpgradeRequest,
            7 => PacketType::UpgradeReply,
            other => PacketType::Unknown(other),
        }
    }
}

impl PacketType {
    /// Discover and get/set payloads are tag-length-value sequences
    pub fn has_tags(&self) -> bool {
        matches!(
            self,
            PacketType::DiscoverRequest
                | PacketType::DiscoverReply
                | PacketType::GetSetRequest
                | PacketType::GetSetReply
        )
    }
}

/// Human-readable name of a tag
pub fn tag_name(tag: u8) -> Option<&'static str> {
    let name = match tag {
        0x01 => "DEVICE_TYPE",
        0x02 => "DEVICE_ID",
        0x03 => "GETSET_NAME",
        0x04 => "GETSET_VALUE",
        0x05 => "ERROR_MESSAGE",
        0x10 => "TUNER_COUNT",
        0x15 => "GETSET_LOCKKEY",
        0x27 => "LINEUP_URL",
        0x28 => "STORAGE_URL",
        0x29 => "DEVICE_AUTH_BIN_DEPRECATED",
        0x2A => "BASE_URL",
        0x2B => "DEVICE_AUTH_STR",
        0x2C => "STORAGE_ID",
        0x2D => "MULTI_TYPE",
        _ => return None,
    };
    Some(name)
}

/// A single tag-length-value entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub tag: u8,
    pub value: Vec<u8>,
}

/// A parsed discovery packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: PacketType,
    pub payload: Vec<u8>,
    pub crc: u32,
    pub crc_valid: bool,
    pub tags: Vec<Tag>,
}

impl Packet {
    pub fn parse(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < HEADER_SIZE + CRC_SIZE {
            return Err(PacketError::TooShort(data.len()));
        }

        let packet_type = PacketType::from(u16::from_be_bytes([data[0], data[1]]));
        let declared = u16::from_be_bytes([data[2], data[3]]) as usize;
        let actual = data.len() - HEADER_SIZE - CRC_SIZE;
        if declared != actual {
            return Err(PacketError::LengthMismatch { declared, actual });
        }

        let crc_offset = HEADER_SIZE + declared;
        let payload = data[HEADER_SIZE..crc_offset].to_vec();

        // The CRC is the only little-endian field
        let crc = u32::from_le_bytes([
            data[crc_offset],
            data[crc_offset + 1],
            data[crc_offset + 2],
            data[crc_offset + 3],
        ]);
        let crc_valid = crc32(&data[..crc_offset]) == crc;

        let tags = if packet_type.has_tags() {
            parse_tags(&payload)?
        } else {
            Vec::new()
        };

        Ok(Self {
            packet_type,
            payload,
            crc,
            crc_valid,
            tags,
        })
    }
}

/// Split a payload into tag-length-value entries
///
/// A length byte with the high bit set is followed by a second byte holding
/// the upper seven bits of the length.
pub fn parse_tags(payload: &[u8]) -> Result<Vec<Tag>, PacketError> {
    let mut tags = Vec::new();
    let mut pos = 0;

    while pos + 2 <= payload.len() {
        let tag = payload[pos];
        let mut len = payload[pos + 1] as usize;
        let mut start = pos + 2;

        if len & 0x80 != 0 {
            let high = *payload.get(pos + 2).ok_or(PacketError::TruncatedTag { tag })?;
            len = (len & 0x7F) | ((high as usize) << 7);
            start = pos + 3;
        }

        let end = start + len;
        if end > payload.len() {
            return Err(PacketError::TruncatedTag { tag });
        }

        tags.push(Tag {
            tag,
            value: payload[start..end].to_vec(),
        });
        pos = end;
    }

    Ok(tags)
}

/// CRC-32 (IEEE 802.3, reflected) as used by HDHomeRun packets
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }
    !crc
}
