use bytes::Bytes;
use hdhr_relay_connection::{ConnectionId, TunnelSender};
use hdhr_relay_proto::{Frame, MAX_DATAGRAM_SIZE};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};

/// Re-emit one forwarded request on the local network and relay the replies
///
/// Sends the payload from a fresh ephemeral socket, then listens on that
/// socket until `window` expires. Every reply becomes its own frame carrying
/// the request's origin. Returns the number of replies sent back over the
/// tunnel. Zero replies is normal when no device is present.
///
/// Replies only go out on `connection`, the tunnel the request arrived on.
/// If that tunnel is replaced mid-window the remaining replies are dropped.
pub async fn query_devices(
    request: Frame,
    target: SocketAddr,
    window: Duration,
    tunnel: TunnelSender,
    connection: ConnectionId,
) -> std::io::Result<usize> {
    let bind_addr: SocketAddr = if target.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };

    let socket = UdpSocket::bind(bind_addr).await?;
    if target.is_ipv4() {
        socket.set_broadcast(true)?;
    }

    socket.send_to(&request.payload, target).await?;
    tracing::debug!(
        target_addr = %target,
        bytes = request.payload.len(),
        origin = ?request.origin,
        "Request re-emitted on local network"
    );

    let deadline = Instant::now() + window;
    // One spare byte detects oversized replies
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE + 1];
    let mut relayed = 0;

    loop {
        let (len, device) = match timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Err(_) => break,
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "Reply socket error, closing response window");
                break;
            }
            Ok(Ok(received)) => received,
        };

        if len > MAX_DATAGRAM_SIZE {
            tracing::warn!(device = %device, "Dropping oversized reply datagram");
            continue;
        }

        let reply = Frame::new(Bytes::copy_from_slice(&buf[..len]), request.origin);
        match tunnel.send_on(connection, reply).await {
            Ok(()) => {
                relayed += 1;
                tracing::debug!(
                    device = %device,
                    bytes = len,
                    origin = ?request.origin,
                    "Reply forwarded over tunnel"
                );
            }
            Err(e) => {
                tracing::warn!(device = %device, error = %e, "Dropping reply");
            }
        }
    }

    Ok(relayed)
}
