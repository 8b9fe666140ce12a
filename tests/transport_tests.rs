//! Integration tests for framed links and flit capture.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use cxl_fabric::codec::mem::MemPacket;
use cxl_fabric::codec::{pack, Flit, Packet};
use cxl_fabric::common::{FormatError, TransportError};
use cxl_fabric::transport::capture::{CaptureSink, Direction};
use cxl_fabric::transport::{connect, ChannelCapture, Link, LinkEvent, LinkListener};

const MAX_FRAME: usize = 256;

async fn expect_frame(link: &mut Link) -> Bytes {
    match tokio::time::timeout(Duration::from_secs(5), link.recv()).await {
        Ok(LinkEvent::Frame(bytes)) => bytes,
        Ok(LinkEvent::Closed(reason)) => panic!("link closed: {:?}", reason),
        Err(_) => panic!("no frame within 5s"),
    }
}

async fn expect_closed(link: &mut Link) -> Option<TransportError> {
    match tokio::time::timeout(Duration::from_secs(5), link.recv()).await {
        Ok(LinkEvent::Closed(reason)) => reason,
        Ok(LinkEvent::Frame(bytes)) => panic!("unexpected frame {:?}", bytes),
        Err(_) => panic!("link still open after 5s"),
    }
}

/// Tests frames arrive once each and in send order.
#[tokio::test]
async fn test_pair_preserves_order() {
    let (a, mut b) = Link::pair(MAX_FRAME);
    for i in 0..100u8 {
        a.send(Bytes::from(vec![i; 4 + i as usize])).unwrap();
    }
    for i in 0..100u8 {
        let frame = expect_frame(&mut b).await;
        assert_eq!(frame.len(), 4 + i as usize);
        assert!(frame.iter().all(|&byte| byte == i));
    }
}

/// Tests a flit sent over a link decodes to the same packets.
#[tokio::test]
async fn test_flit_over_link() {
    let (a, mut b) = Link::pair(MAX_FRAME);
    let packets: Vec<Packet> = vec![
        MemPacket::mem_read(0x40).into(),
        MemPacket::mem_write(0x80, vec![7; 64]).into(),
    ];
    let (flit, rest) = pack(MAX_FRAME, packets.clone()).unwrap();
    assert!(rest.is_empty());
    a.send_flit(&flit).unwrap();

    let bytes = expect_frame(&mut b).await;
    assert_eq!(bytes.len(), MAX_FRAME);
    assert_eq!(Flit::decode(&bytes).unwrap().packets(), &packets[..]);
}

/// Tests a clean close delivers queued frames, then a single close event.
#[tokio::test]
async fn test_close_flushes_then_closes() {
    let (mut a, mut b) = Link::pair(MAX_FRAME);
    for i in 0..3u8 {
        a.send(Bytes::from(vec![i; 8])).unwrap();
    }
    a.close();

    for i in 0..3u8 {
        assert_eq!(expect_frame(&mut b).await[0], i);
    }
    assert!(expect_closed(&mut b).await.is_none());
    assert!(expect_closed(&mut b).await.is_none());
}

/// Tests a frame longer than the flit capacity ends the link with an error.
#[tokio::test]
async fn test_oversized_frame_closes_link() {
    let (local, mut remote) = tokio::io::duplex(1024);
    let mut link = Link::from_stream(local, "test".to_string(), 64, None);

    remote.write_all(&[0, 0, 0, 200]).await.unwrap();
    match expect_closed(&mut link).await {
        Some(TransportError::Format(FormatError::FrameLength { length, .. })) => {
            assert_eq!(length, 200)
        }
        other => panic!("unexpected close reason {:?}", other),
    }
}

/// Tests a frame cut short by the peer ends the link with an I/O error.
#[tokio::test]
async fn test_truncated_frame_closes_link() {
    let (local, mut remote) = tokio::io::duplex(1024);
    let mut link = Link::from_stream(local, "test".to_string(), 64, None);

    remote.write_all(&[0, 0, 0, 64]).await.unwrap();
    remote.write_all(&[0xaa; 10]).await.unwrap();
    remote.shutdown().await.unwrap();
    drop(remote);

    assert!(matches!(
        expect_closed(&mut link).await,
        Some(TransportError::Io(_))
    ));
}

/// Tests the capture sink sees sent and received flits without altering them.
#[tokio::test]
async fn test_capture_records_both_directions() {
    let (capture, mut records) = ChannelCapture::new();
    let sink: Arc<dyn CaptureSink> = Arc::new(capture);
    let (x, y) = tokio::io::duplex(1024);
    let mut a = Link::from_stream(x, "a".to_string(), MAX_FRAME, Some(sink));
    let mut b = Link::from_stream(y, "b".to_string(), MAX_FRAME, None);

    a.send(Bytes::from_static(&[1, 2, 3, 4])).unwrap();
    assert_eq!(&expect_frame(&mut b).await[..], &[1, 2, 3, 4]);
    b.send(Bytes::from_static(&[5, 6, 7, 8, 9])).unwrap();
    assert_eq!(&expect_frame(&mut a).await[..], &[5, 6, 7, 8, 9]);

    let tx = records.recv().await.unwrap();
    assert_eq!(tx.direction, Direction::Tx);
    assert_eq!(tx.link, a.id());
    assert_eq!(&tx.bytes[..], &[1, 2, 3, 4]);
    let rx = records.recv().await.unwrap();
    assert_eq!(rx.direction, Direction::Rx);
    assert_eq!(&rx.bytes[..], &[5, 6, 7, 8, 9]);
}

/// Tests the byte handler sees every frame and reports the close.
#[tokio::test]
async fn test_on_bytes_handler() {
    let (mut a, mut b) = Link::pair(MAX_FRAME);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let done = b.on_bytes(move |bytes| {
        let _ = tx.send(bytes);
    });

    a.send(Bytes::from_static(&[9; 4])).unwrap();
    a.send(Bytes::from_static(&[8; 4])).unwrap();
    a.close();

    assert_eq!(rx.recv().await.unwrap()[0], 9);
    assert_eq!(rx.recv().await.unwrap()[0], 8);
    assert!(done.await.unwrap().is_none());
    assert!(expect_closed(&mut b).await.is_none());
}

/// Tests links over TCP carry frames both ways.
#[tokio::test]
async fn test_tcp_link() {
    let listener = LinkListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().to_string();

    let dial = tokio::spawn(async move {
        connect(&addr, Duration::from_secs(5), MAX_FRAME, None).await
    });
    let mut server = listener.accept(MAX_FRAME, None).await.unwrap();
    let mut client = dial.await.unwrap().unwrap();

    client.send(Bytes::from_static(b"ping")).unwrap();
    assert_eq!(&expect_frame(&mut server).await[..], b"ping");
    server.send(Bytes::from_static(b"pong")).unwrap();
    assert_eq!(&expect_frame(&mut client).await[..], b"pong");

    client.close();
    assert!(expect_closed(&mut server).await.is_none());
}

/// Tests dialing a port nobody listens on fails with a connection error.
#[tokio::test]
async fn test_connect_refused() {
    let listener = LinkListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().to_string();
    drop(listener);

    let result = connect(&addr, Duration::from_secs(2), MAX_FRAME, None).await;
    assert!(matches!(
        result,
        Err(TransportError::ConnectionError { .. })
    ));
}
