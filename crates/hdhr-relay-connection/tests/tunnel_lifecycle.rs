//! Tunnel lifecycle tests over loopback TCP

use bytes::BytesMut;
use hdhr_relay_connection::{
    ConnectionError, ReconnectConfig, TunnelConnection, TunnelDialer, TunnelListener,
    TunnelSender,
};
use hdhr_relay_proto::{Frame, FrameError, MAX_FRAME_LEN};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

fn fast_reconnect() -> ReconnectConfig {
    ReconnectConfig {
        initial_backoff: Duration::from_millis(20),
        max_backoff: Duration::from_millis(100),
        multiplier: 2.0,
    }
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

async fn bind_listener() -> (TunnelListener, SocketAddr) {
    init_logging();
    let listener = TunnelListener::bind("127.0.0.1:0".parse().unwrap(), TunnelSender::new())
        .await
        .expect("bind listener");
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

async fn wait_disconnected(sender: &TunnelSender) {
    timeout(Duration::from_secs(2), async {
        while sender.is_connected().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("sender should detach");
}

async fn next(connection: &mut TunnelConnection) -> Option<Result<Frame, FrameError>> {
    timeout(Duration::from_secs(2), connection.next_frame())
        .await
        .expect("frame within timeout")
}

#[tokio::test]
async fn test_frames_flow_both_ways_in_order() {
    let (listener, addr) = bind_listener().await;

    let accept = tokio::spawn(async move {
        let connection = listener.accept().await.unwrap();
        (listener, connection)
    });

    let mut dialer = TunnelDialer::new(addr.to_string(), TunnelSender::new(), fast_reconnect());
    let mut client = dialer.connect().await.unwrap();
    let (listener, mut server) = accept.await.unwrap();

    let origin: SocketAddr = "192.168.1.50:40001".parse().unwrap();
    for i in 0..10u8 {
        dialer
            .sender()
            .send(Frame::from_origin(vec![i; 8], origin))
            .await
            .unwrap();
    }

    for i in 0..10u8 {
        let frame = next(&mut server).await.unwrap().unwrap();
        assert_eq!(frame.payload.as_ref(), &[i; 8]);
        assert_eq!(frame.origin, Some(origin));
    }

    listener
        .sender()
        .send(Frame::from_origin(vec![0xAB], origin))
        .await
        .unwrap();
    let reply = next(&mut client).await.unwrap().unwrap();
    assert_eq!(reply.payload.as_ref(), &[0xAB]);
}

#[tokio::test]
async fn test_concurrent_senders_do_not_interleave() {
    let (listener, addr) = bind_listener().await;
    let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

    let mut dialer = TunnelDialer::new(addr.to_string(), TunnelSender::new(), fast_reconnect());
    let _client = dialer.connect().await.unwrap();
    let mut server = accept.await.unwrap();

    let mut handles = Vec::new();
    for task in 0..8u8 {
        let sender = dialer.sender().clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..25 {
                sender
                    .send(Frame::new(vec![task; 1500], None))
                    .await
                    .unwrap();
            }
        }));
    }

    // Drain while the senders run so the socket buffer never stalls them
    for _ in 0..200 {
        let frame = next(&mut server).await.unwrap().unwrap();
        let first = frame.payload[0];
        assert_eq!(frame.payload.len(), 1500);
        assert!(frame.payload.iter().all(|b| *b == first));
    }

    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test]
async fn test_send_without_connection_is_not_connected() {
    let sender = TunnelSender::new();
    let result = sender.send(Frame::new(vec![1, 2, 3], None)).await;
    assert!(matches!(result, Err(ConnectionError::NotConnected)));
    assert!(!sender.is_connected().await);
}

#[tokio::test]
async fn test_new_connection_replaces_previous() {
    let (listener, addr) = bind_listener().await;

    let first_client = TcpStream::connect(addr).await.unwrap();
    let mut first = listener.accept().await.unwrap();

    let mut second_client = TcpStream::connect(addr).await.unwrap();
    let _second = listener.accept().await.unwrap();

    // The replaced connection ends its frame sequence
    assert!(next(&mut first).await.is_none());
    drop(first_client);

    // Frames now go to the newest connection
    listener
        .sender()
        .send(Frame::new(vec![7, 7], None))
        .await
        .unwrap();

    let mut buf = [0u8; 5];
    timeout(Duration::from_secs(2), second_client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(buf, [0, 3, 0, 7, 7]);
}

#[tokio::test]
async fn test_send_on_replaced_connection_is_refused() {
    let (listener, addr) = bind_listener().await;

    let _first_client = TcpStream::connect(addr).await.unwrap();
    let first = listener.accept().await.unwrap();
    let first_id = first.id();

    let mut second_client = TcpStream::connect(addr).await.unwrap();
    let second = listener.accept().await.unwrap();
    assert_ne!(first_id, second.id());

    // A reply meant for the first connection must not leak onto the second
    let stale = listener
        .sender()
        .send_on(first_id, Frame::new(vec![1, 1], None))
        .await;
    assert!(matches!(stale, Err(ConnectionError::NotConnected)));

    listener
        .sender()
        .send_on(second.id(), Frame::new(vec![2, 2], None))
        .await
        .unwrap();

    let mut buf = [0u8; 5];
    timeout(Duration::from_secs(2), second_client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(buf, [0, 3, 0, 2, 2]);
}

#[tokio::test]
async fn test_oversized_frame_closes_connection() {
    let (listener, addr) = bind_listener().await;

    let mut raw = TcpStream::connect(addr).await.unwrap();
    let mut connection = listener.accept().await.unwrap();

    let declared = (MAX_FRAME_LEN + 1) as u16;
    raw.write_all(&declared.to_be_bytes()).await.unwrap();

    let result = next(&mut connection).await;
    assert!(matches!(result, Some(Err(FrameError::ProtocolViolation(_)))));

    // The stream is over after a violation
    assert!(next(&mut connection).await.is_none());
    wait_disconnected(listener.sender()).await;

    // A fresh connection is unaffected
    let mut raw2 = TcpStream::connect(addr).await.unwrap();
    let mut connection2 = listener.accept().await.unwrap();

    let mut good = BytesMut::new();
    good.extend_from_slice(&Frame::new(vec![5u8; 3], None).to_bytes().unwrap());
    raw2.write_all(&good).await.unwrap();

    let frame = next(&mut connection2).await.unwrap().unwrap();
    assert_eq!(frame.payload.as_ref(), &[5, 5, 5]);
}

#[tokio::test]
async fn test_truncated_frame_at_close() {
    let (listener, addr) = bind_listener().await;

    let mut raw = TcpStream::connect(addr).await.unwrap();
    let mut connection = listener.accept().await.unwrap();

    let bytes = Frame::new(vec![1u8; 20], None).to_bytes().unwrap();
    raw.write_all(&bytes[..8]).await.unwrap();
    drop(raw);

    let result = next(&mut connection).await;
    assert!(matches!(result, Some(Err(FrameError::TruncatedFrame { .. }))));
    wait_disconnected(listener.sender()).await;
}

#[tokio::test]
async fn test_peer_close_ends_sequence_and_detaches() {
    let (listener, addr) = bind_listener().await;

    let raw = TcpStream::connect(addr).await.unwrap();
    let mut connection = listener.accept().await.unwrap();
    assert!(listener.sender().is_connected().await);

    drop(raw);

    assert!(next(&mut connection).await.is_none());
    wait_disconnected(listener.sender()).await;

    let result = listener.sender().send(Frame::new(vec![1], None)).await;
    assert!(matches!(result, Err(ConnectionError::NotConnected)));
}

#[tokio::test]
async fn test_dialer_retries_until_listener_appears() {
    // Reserve a port, then free it so the first attempts are refused
    let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = reserved.local_addr().unwrap();
    drop(reserved);

    let dial = tokio::spawn(async move {
        let mut dialer = TunnelDialer::new(addr.to_string(), TunnelSender::new(), fast_reconnect());
        dialer.connect().await.map(|connection| connection.peer_addr())
    });

    tokio::time::sleep(Duration::from_millis(150)).await;
    let listener = TunnelListener::bind(addr, TunnelSender::new()).await.unwrap();
    let _server = timeout(Duration::from_secs(5), listener.accept())
        .await
        .unwrap()
        .unwrap();

    let peer = timeout(Duration::from_secs(5), dial).await.unwrap().unwrap().unwrap();
    assert_eq!(peer, addr);
}

#[tokio::test]
async fn test_unknown_host_is_fatal_before_first_connection() {
    let mut dialer = TunnelDialer::new(
        "no-such-relay.invalid:65001",
        TunnelSender::new(),
        fast_reconnect(),
    );

    let result = timeout(Duration::from_secs(10), dialer.connect()).await.unwrap();
    assert!(matches!(result, Err(ConnectionError::UnknownHost(_))));
}

#[tokio::test]
async fn test_bind_conflict_is_reported() {
    let (_listener, addr) = bind_listener().await;
    let result = TunnelListener::bind(addr, TunnelSender::new()).await;
    assert!(matches!(result, Err(ConnectionError::Bind { .. })));
}
