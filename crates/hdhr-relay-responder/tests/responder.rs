//! Responder relay tests with a fake device on loopback

use futures::{SinkExt, StreamExt};
use hdhr_relay_proto::{Frame, FrameCodec, MAX_FRAME_LEN};
use hdhr_relay_responder::{Responder, ResponderConfig};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tokio_util::codec::Framed;

const WINDOW: Duration = Duration::from_millis(300);

async fn start_responder(device: SocketAddr) -> SocketAddr {
    let config = ResponderConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        target_addr: device,
        response_window: WINDOW,
    };
    let responder = Responder::bind(config).await.unwrap();
    let addr = responder.local_addr().unwrap();
    tokio::spawn(responder.run());
    addr
}

async fn connect(addr: SocketAddr) -> Framed<TcpStream, FrameCodec> {
    Framed::new(TcpStream::connect(addr).await.unwrap(), FrameCodec)
}

async fn recv_frame(tunnel: &mut Framed<TcpStream, FrameCodec>) -> Frame {
    timeout(Duration::from_secs(2), tunnel.next())
        .await
        .expect("frame within timeout")
        .expect("stream open")
        .expect("valid frame")
}

fn client() -> SocketAddr {
    "192.168.10.23:50123".parse().unwrap()
}

#[tokio::test]
async fn test_request_reemitted_and_replies_tagged_with_origin() {
    let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = start_responder(device.local_addr().unwrap()).await;
    let mut tunnel = connect(addr).await;

    tunnel
        .send(Frame::from_origin(vec![0, 2, 0, 4, 1, 2, 3, 4], client()))
        .await
        .unwrap();

    let mut buf = [0u8; 64];
    let (len, from) = timeout(Duration::from_secs(2), device.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..len], &[0, 2, 0, 4, 1, 2, 3, 4]);

    // Two answers to one request, e.g. two tuners
    device.send_to(b"reply-one", from).await.unwrap();
    device.send_to(b"reply-two", from).await.unwrap();

    let first = recv_frame(&mut tunnel).await;
    let second = recv_frame(&mut tunnel).await;
    assert_eq!(first.payload.as_ref(), b"reply-one");
    assert_eq!(second.payload.as_ref(), b"reply-two");
    assert_eq!(first.origin, Some(client()));
    assert_eq!(second.origin, Some(client()));
}

#[tokio::test]
async fn test_no_device_means_no_reply_frames() {
    let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = start_responder(device.local_addr().unwrap()).await;
    let mut tunnel = connect(addr).await;

    tunnel
        .send(Frame::from_origin(vec![1, 2, 3], client()))
        .await
        .unwrap();

    // The device hears the request but stays silent
    let mut buf = [0u8; 16];
    device.recv_from(&mut buf).await.unwrap();

    let result = timeout(WINDOW * 2, tunnel.next()).await;
    assert!(result.is_err(), "no frame expected");
}

#[tokio::test]
async fn test_replies_after_window_are_not_forwarded() {
    let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = start_responder(device.local_addr().unwrap()).await;
    let mut tunnel = connect(addr).await;

    tunnel
        .send(Frame::from_origin(vec![9], client()))
        .await
        .unwrap();

    let mut buf = [0u8; 16];
    let (_, from) = device.recv_from(&mut buf).await.unwrap();

    tokio::time::sleep(WINDOW + Duration::from_millis(200)).await;
    let _ = device.send_to(b"too-late", from).await;

    let result = timeout(Duration::from_millis(300), tunnel.next()).await;
    assert!(result.is_err(), "late reply must not be relayed");
}

#[tokio::test]
async fn test_overlapping_response_windows() {
    let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = start_responder(device.local_addr().unwrap()).await;
    let mut tunnel = connect(addr).await;

    let other: SocketAddr = "192.168.10.99:50999".parse().unwrap();
    tunnel
        .send(Frame::from_origin(b"req-1".to_vec(), client()))
        .await
        .unwrap();
    tunnel
        .send(Frame::from_origin(b"req-2".to_vec(), other))
        .await
        .unwrap();

    // Both requests arrive before either is answered
    let mut buf = [0u8; 16];
    let mut senders = Vec::new();
    for _ in 0..2 {
        let (len, from) = timeout(Duration::from_secs(2), device.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        senders.push((buf[..len].to_vec(), from));
    }

    for (request, from) in &senders {
        let mut reply = b"ack-".to_vec();
        reply.extend_from_slice(request);
        device.send_to(&reply, *from).await.unwrap();
    }

    let mut replies = vec![recv_frame(&mut tunnel).await, recv_frame(&mut tunnel).await];
    replies.sort_by(|a, b| a.payload.cmp(&b.payload));

    assert_eq!(replies[0].payload.as_ref(), b"ack-req-1");
    assert_eq!(replies[0].origin, Some(client()));
    assert_eq!(replies[1].payload.as_ref(), b"ack-req-2");
    assert_eq!(replies[1].origin, Some(other));
}

#[tokio::test]
async fn test_protocol_violation_closes_only_that_connection() {
    let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = start_responder(device.local_addr().unwrap()).await;

    let mut raw = TcpStream::connect(addr).await.unwrap();
    raw.write_all(&((MAX_FRAME_LEN + 100) as u16).to_be_bytes())
        .await
        .unwrap();

    // The responder hangs up
    let mut buf = [0u8; 8];
    let read = timeout(Duration::from_secs(2), raw.read(&mut buf))
        .await
        .unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));

    // A new connection relays normally
    let mut tunnel = connect(addr).await;
    tunnel
        .send(Frame::from_origin(vec![4, 2], client()))
        .await
        .unwrap();

    let mut dbuf = [0u8; 16];
    let (len, from) = timeout(Duration::from_secs(2), device.recv_from(&mut dbuf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&dbuf[..len], &[4, 2]);
    device.send_to(b"ok", from).await.unwrap();

    let reply = recv_frame(&mut tunnel).await;
    assert_eq!(reply.payload.as_ref(), b"ok");
}

#[tokio::test]
async fn test_replies_stay_with_the_connection_that_asked() {
    let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = start_responder(device.local_addr().unwrap()).await;
    let mut first = connect(addr).await;

    first
        .send(Frame::from_origin(b"old".to_vec(), client()))
        .await
        .unwrap();

    let mut buf = [0u8; 16];
    let (_, from) = timeout(Duration::from_secs(2), device.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();

    // A newer tunnel takes over while the first request's window is open
    let mut second = connect(addr).await;
    let ended = timeout(Duration::from_secs(2), first.next()).await.unwrap();
    assert!(matches!(ended, None | Some(Err(_))));

    device.send_to(b"old-reply", from).await.unwrap();

    let result = timeout(WINDOW * 2, second.next()).await;
    assert!(result.is_err(), "reply for the replaced tunnel must be dropped");
}
