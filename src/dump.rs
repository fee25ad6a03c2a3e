//! `dump` command: log every discovery packet seen on the local network

use anyhow::{Context, Result};
use hdhr_relay_proto::hdhomerun::{tag_name, Packet, Tag};
use hdhr_relay_proto::MAX_DATAGRAM_SIZE;
use hdhr_relay_requester::bind_discovery_socket;
use std::fmt::Write;
use std::net::SocketAddr;
use tracing::{info, warn};

/// Listen on `addr` and log each packet until the task is dropped
pub async fn run(addr: SocketAddr) -> Result<()> {
    let socket = bind_discovery_socket(addr)
        .with_context(|| format!("Failed to bind discovery socket {}", addr))?;

    info!(addr = %addr, "Dumping discovery packets");

    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (len, from) = socket
            .recv_from(&mut buf)
            .await
            .context("Discovery socket receive failed")?;

        match Packet::parse(&buf[..len]) {
            Ok(packet) => info!(from = %from, "{}", describe_packet(&packet)),
            Err(e) => warn!(from = %from, bytes = len, error = %e, "Malformed discovery packet"),
        }
    }
}

/// One-line summary of a packet and its tags
pub fn describe_packet(packet: &Packet) -> String {
    let mut out = format!("{:?} ({} bytes", packet.packet_type, packet.payload.len());
    if !packet.crc_valid {
        out.push_str(", bad crc");
    }
    out.push(')');

    for tag in &packet.tags {
        let _ = write!(out, " {}={}", describe_tag_name(tag.tag), describe_value(tag));
    }

    out
}

fn describe_tag_name(tag: u8) -> String {
    match tag_name(tag) {
        Some(name) => name.to_string(),
        None => format!("0x{:02X}", tag),
    }
}

fn describe_value(tag: &Tag) -> String {
    match (tag_name(tag.tag), tag.value.as_slice()) {
        (Some("DEVICE_TYPE" | "DEVICE_ID"), &[a, b, c, d]) => {
            format!("{:08X}", u32::from_be_bytes([a, b, c, d]))
        }
        (Some("TUNER_COUNT"), &[count]) => count.to_string(),
        (_, value) => match std::str::from_utf8(value) {
            Ok(text) if text.chars().all(|c| !c.is_control() || c == '\0') => {
                format!("{:?}", text.trim_end_matches('\0'))
            }
            _ => value.iter().map(|b| format!("{:02x}", b)).collect(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hdhr_relay_proto::hdhomerun::crc32;

    fn build_packet(packet_type: u16, payload: &[u8]) -> Vec<u8> {
        let mut data = packet_type.to_be_bytes().to_vec();
        data.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        data.extend_from_slice(payload);
        let crc = crc32(&data);
        data.extend_from_slice(&crc.to_le_bytes());
        data
    }

    #[test]
    fn test_describe_discover_reply() {
        let payload = [
            0x01, 0x04, 0x00, 0x00, 0x00, 0x01, // DEVICE_TYPE tuner
            0x02, 0x04, 0x10, 0x4A, 0xB3, 0x2C, // DEVICE_ID
            0x10, 0x01, 0x02, // TUNER_COUNT
            0x2A, 0x04, b'h', b't', b't', b'p', // BASE_URL
        ];
        let packet = Packet::parse(&build_packet(3, &payload)).unwrap();

        let line = describe_packet(&packet);
        assert_eq!(
            line,
            "DiscoverReply (21 bytes) DEVICE_TYPE=00000001 DEVICE_ID=104AB32C TUNER_COUNT=2 BASE_URL=\"http\""
        );
    }

    #[test]
    fn test_describe_flags_bad_crc_and_unknown_tags() {
        let mut data = build_packet(2, &[0x7E, 0x02, 0xFF, 0x00]);
        let last = data.len() - 1;
        data[last] ^= 0xFF;

        let packet = Packet::parse(&data).unwrap();
        assert_eq!(
            describe_packet(&packet),
            "DiscoverRequest (4 bytes, bad crc) 0x7E=ff00"
        );
    }
}
