//! Tests for transport abstraction layer

use super::*;
use async_trait::async_trait;
use burrow_proto::{Envelope, FrameCodec, SessionHello, SessionMode, STREAM_WINDOW};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Mock sender recording everything it is asked to send
#[derive(Debug, Default, Clone)]
pub struct MockSender {
    sent: Arc<Mutex<Vec<Envelope>>>,
    finished: Arc<Mutex<u32>>,
}

#[async_trait]
impl EnvelopeSender for MockSender {
    async fn send(&mut self, envelope: Envelope) -> TransportResult<()> {
        self.sent.lock().await.push(envelope);
        Ok(())
    }

    async fn finish(&mut self) -> TransportResult<()> {
        *self.finished.lock().await += 1;
        Ok(())
    }
}

async fn framed_pair() -> (FramedStream<Envelope>, FramedStream<Envelope>) {
    let (connector, mut acceptor) = memory::link("agent-test");
    let near = connector.connect(SessionMode::Stream).await.unwrap();
    let (hello, far) = acceptor.accept().await.unwrap().unwrap();
    assert_eq!(hello.agent_id, "agent-test");
    (
        FramedStream::new(near, "near"),
        FramedStream::new(far, "far"),
    )
}

#[tokio::test]
async fn test_framed_envelope_exchange() {
    let (near, far) = framed_pair().await;
    let (mut near_tx, _near_rx) = near.into_parts();
    let (_far_tx, mut far_rx) = far.into_parts();

    near_tx
        .send_frame(Envelope::dial_request("127.0.0.1:5432"))
        .await
        .unwrap();
    near_tx
        .send_frame(Envelope::data(b"ping".to_vec()))
        .await
        .unwrap();

    assert_eq!(
        far_rx.recv_frame().await.unwrap(),
        Some(Envelope::dial_request("127.0.0.1:5432"))
    );
    assert_eq!(
        far_rx.recv_frame().await.unwrap(),
        Some(Envelope::data(b"ping".to_vec()))
    );
}

#[tokio::test]
async fn test_close_is_idempotent_and_observed_by_peer() {
    let (near, far) = framed_pair().await;
    let (mut near_tx, _near_rx) = near.into_parts();
    let (_far_tx, mut far_rx) = far.into_parts();

    near_tx.close().await.unwrap();
    near_tx.close().await.unwrap();
    assert!(near_tx.is_finished());

    assert_eq!(far_rx.recv_frame().await.unwrap(), None);
    assert!(matches!(
        near_tx.send_frame(Envelope::closed()).await,
        Err(TransportError::StreamClosed)
    ));
}

#[tokio::test]
async fn test_half_close_keeps_other_direction_open() {
    let (near, far) = framed_pair().await;
    let (mut near_tx, mut near_rx) = near.into_parts();
    let (mut far_tx, mut far_rx) = far.into_parts();

    near_tx.close().await.unwrap();
    assert_eq!(far_rx.recv_frame().await.unwrap(), None);

    far_tx
        .send_frame(Envelope::data(b"late".to_vec()))
        .await
        .unwrap();
    assert_eq!(
        near_rx.recv_frame().await.unwrap(),
        Some(Envelope::data(b"late".to_vec()))
    );
}

#[tokio::test]
async fn test_dropped_peer_ends_stream() {
    let (near, far) = framed_pair().await;
    let (_near_tx, mut near_rx) = near.into_parts();
    drop(far);

    let result = tokio::time::timeout(Duration::from_secs(1), near_rx.recv_frame())
        .await
        .expect("recv should not hang after peer drop");
    assert!(matches!(result, Ok(None) | Err(_)));
}

#[tokio::test]
async fn test_memory_connect_fails_without_acceptor() {
    let (connector, acceptor) = memory::link("agent-test");
    drop(acceptor);

    let result = connector.connect(SessionMode::Call).await;
    assert!(matches!(result, Err(TransportError::ChannelClosed)));
}

/// Both ends of one stream-mode connection
async fn mux_pair() -> (Arc<Multiplexer>, Arc<Multiplexer>, MuxIncoming) {
    let (connector, mut acceptor) = memory::link("agent-test");
    let near = connector.connect(SessionMode::Stream).await.unwrap();
    let (_, far) = acceptor.accept().await.unwrap().unwrap();
    let (near, _) = Multiplexer::start(near, "near", MuxRole::Initiator);
    let (far, incoming) = Multiplexer::start(far, "far", MuxRole::Acceptor);
    (near, far, incoming)
}

async fn accepted(incoming: &mut MuxIncoming) -> MuxStream {
    tokio::time::timeout(Duration::from_secs(2), incoming.accept())
        .await
        .expect("peer should see the stream")
        .expect("connection should be up")
}

#[tokio::test]
async fn test_streams_share_one_connection() {
    let (connector, mut acceptor) = memory::link("agent-test");
    let channel = StreamChannel::new(Arc::new(connector));

    let first = channel.make().await.unwrap();
    let second = channel.make().await.unwrap();
    assert_ne!(first.stream_id(), second.stream_id());
    assert_eq!(channel.connections(), 1);

    let (hello, io) = acceptor.accept().await.unwrap().unwrap();
    assert_eq!(hello.mode, SessionMode::Stream);
    let (_far, mut incoming) = Multiplexer::start(io, "far", MuxRole::Acceptor);

    let (mut first_tx, _first_rx) = first.split();
    let (mut second_tx, _second_rx) = second.split();
    second_tx.send(Envelope::dial_ok()).await.unwrap();
    first_tx
        .send(Envelope::dial_request("db:5432"))
        .await
        .unwrap();

    let (_, mut far_first) = accepted(&mut incoming).await.split();
    let (_, mut far_second) = accepted(&mut incoming).await.split();
    assert_eq!(
        far_first.recv().await.unwrap(),
        Some(Envelope::dial_request("db:5432"))
    );
    assert_eq!(far_second.recv().await.unwrap(), Some(Envelope::dial_ok()));

    // No second connection was made
    assert!(tokio::time::timeout(Duration::from_millis(50), acceptor.accept())
        .await
        .is_err());
}

#[tokio::test]
async fn test_finishing_one_stream_leaves_others_open() {
    let (near, _far, mut incoming) = mux_pair().await;
    let (mut a_tx, _a_rx) = near.open().await.unwrap().split();
    let (mut b_tx, _b_rx) = near.open().await.unwrap().split();
    let (_, mut far_a) = accepted(&mut incoming).await.split();
    let (_, mut far_b) = accepted(&mut incoming).await.split();

    a_tx.finish().await.unwrap();
    a_tx.finish().await.unwrap();
    assert_eq!(far_a.recv().await.unwrap(), None);

    b_tx.send(Envelope::data(b"still here".to_vec())).await.unwrap();
    assert_eq!(
        far_b.recv().await.unwrap(),
        Some(Envelope::data(b"still here".to_vec()))
    );
}

#[tokio::test]
async fn test_connection_loss_fails_every_stream() {
    let (near, far, mut incoming) = mux_pair().await;
    let (mut a_tx, mut a_rx) = near.open().await.unwrap().split();
    let (_b_tx, mut b_rx) = near.open().await.unwrap().split();
    let _far_a = accepted(&mut incoming).await;
    let _far_b = accepted(&mut incoming).await;
    assert_eq!(near.stream_count(), 2);

    far.close();

    for rx in [&mut a_rx, &mut b_rx] {
        let result = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("recv should not hang after connection loss");
        assert!(result.is_err(), "{:?}", result);
    }
    assert!(near.is_closed());
    assert_eq!(near.stream_count(), 0);
    assert!(a_tx.send(Envelope::closed()).await.is_err());
}

#[tokio::test]
async fn test_unread_stream_does_not_block_others() {
    let (near, _far, mut incoming) = mux_pair().await;
    let (mut stalled_tx, _stalled_rx) = near.open().await.unwrap().split();
    let (mut live_tx, _live_rx) = near.open().await.unwrap().split();
    let (_, mut far_stalled) = accepted(&mut incoming).await.split();
    let (_, mut far_live) = accepted(&mut incoming).await.split();

    // Nobody reads the stalled stream; its window fills
    for _ in 0..STREAM_WINDOW {
        stalled_tx.send(Envelope::data(vec![1; 1024])).await.unwrap();
    }
    let mut blocked = tokio::spawn(async move {
        stalled_tx.send(Envelope::data(vec![2; 1024])).await.unwrap();
        stalled_tx
    });
    assert!(tokio::time::timeout(Duration::from_millis(100), &mut blocked)
        .await
        .is_err());

    for i in 0..(STREAM_WINDOW * 4) {
        live_tx.send(Envelope::data(vec![i as u8; 16])).await.unwrap();
        assert_eq!(
            far_live.recv().await.unwrap(),
            Some(Envelope::data(vec![i as u8; 16]))
        );
    }

    // Reading the stalled stream hands credit back
    for _ in 0..STREAM_WINDOW {
        far_stalled.recv().await.unwrap();
    }
    tokio::time::timeout(Duration::from_secs(2), blocked)
        .await
        .expect("credit should unblock the sender")
        .unwrap();
    assert_eq!(
        far_stalled.recv().await.unwrap(),
        Some(Envelope::data(vec![2; 1024]))
    );
}

#[tokio::test]
async fn test_dropped_receiver_resets_peer_sender() {
    let (near, _far, mut incoming) = mux_pair().await;
    let (_tx, rx) = near.open().await.unwrap().split();
    let (mut far_tx, _far_rx) = accepted(&mut incoming).await.split();

    drop(rx);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if far_tx.send(Envelope::data(vec![0; 8])).await.is_err() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "sender was never reset");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_stream_channel_reconnects_after_loss() {
    let (connector, mut acceptor) = memory::link("agent-test");
    let channel = StreamChannel::new(Arc::new(connector));

    let first = channel.make().await.unwrap();
    let (_, io) = acceptor.accept().await.unwrap().unwrap();
    drop(io);

    let (_tx, mut rx) = first.split();
    assert!(rx.recv().await.is_err());
    tokio::time::timeout(Duration::from_secs(2), async {
        while channel.session().await.is_some() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("session should be seen as closed");

    let _second = channel.make().await.unwrap();
    assert_eq!(channel.connections(), 2);
    assert!(acceptor.accept().await.unwrap().is_some());
}

#[tokio::test]
async fn test_tcp_handshake_carries_identity() {
    let mut acceptor = TcpAcceptor::bind("127.0.0.1:0").await.unwrap();
    let connector = TcpConnector::new(acceptor.local_addr().to_string(), "agent-42");

    let _io = connector.connect(SessionMode::Call).await.unwrap();
    let (hello, _far) = tokio::time::timeout(Duration::from_secs(2), acceptor.accept())
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(hello.agent_id, "agent-42");
    assert_eq!(hello.mode, SessionMode::Call);
}

#[tokio::test]
async fn test_tcp_connect_refused() {
    // Bind then drop to get a port nobody listens on
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let connector = TcpConnector::new(addr.to_string(), "agent-42");
    assert!(connector.connect(SessionMode::Stream).await.is_err());
}

#[tokio::test]
async fn test_read_hello_rejects_unknown_version() {
    let (mut a, mut b) = tokio::io::duplex(1024);
    let mut hello = SessionHello::new("agent", SessionMode::Stream);
    hello.version = 99;
    let frame = FrameCodec::to_bytes(&hello).unwrap();
    a.write_all(&frame).await.unwrap();

    let result = read_hello(&mut b).await;
    assert!(matches!(result, Err(TransportError::HandshakeFailed(_))));
}

#[tokio::test]
async fn test_read_hello_rejects_oversized_frame() {
    let (mut a, mut b) = tokio::io::duplex(1024);
    a.write_u32(10 * 1024 * 1024).await.unwrap();

    let result = read_hello(&mut b).await;
    assert!(matches!(result, Err(TransportError::HandshakeFailed(_))));
}

#[tokio::test]
async fn test_boxed_sender_delegates() {
    let mock = MockSender::default();
    let mut boxed: Box<dyn EnvelopeSender> = Box::new(mock.clone());

    boxed.send(Envelope::dial_ok()).await.unwrap();
    boxed.finish().await.unwrap();

    assert_eq!(mock.sent.lock().await.as_slice(), &[Envelope::dial_ok()]);
    assert_eq!(*mock.finished.lock().await, 1);
}

/// Listener whose every accept fails, as under fd exhaustion
struct FailingListener {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl tcp::Listen for FailingListener {
    async fn accept(&self) -> std::io::Result<(tokio::net::TcpStream, std::net::SocketAddr)> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            "too many open files",
        ))
    }
}

#[tokio::test(start_paused = true)]
async fn test_accept_errors_are_paced() {
    let calls = Arc::new(AtomicUsize::new(0));
    let (tx, _rx) = tokio::sync::mpsc::channel(1);
    let listener = FailingListener {
        calls: calls.clone(),
    };
    let accept_loop = tokio::spawn(TcpAcceptor::accept_loop(listener, tx));

    tokio::time::sleep(Duration::from_secs(1)).await;
    let seen = calls.load(Ordering::SeqCst);
    let paced = (1000 / tcp::ACCEPT_ERROR_PAUSE.as_millis()) as usize;
    assert!(seen >= 2, "accept retried {} times", seen);
    assert!(seen <= paced + 1, "accept retried {} times", seen);

    accept_loop.abort();
}

#[tokio::test]
async fn test_accept_loop_stops_when_acceptor_dropped() {
    let calls = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = tokio::sync::mpsc::channel(1);
    drop(rx);
    let listener = FailingListener {
        calls: calls.clone(),
    };

    tokio::time::timeout(
        Duration::from_secs(2),
        TcpAcceptor::accept_loop(listener, tx),
    )
    .await
    .expect("accept loop should exit once nobody receives");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
