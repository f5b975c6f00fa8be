//! Framed transport tests
//!
//! Drives the codec through `tokio_util::codec::Framed` over an in-memory
//! duplex pipe, the way sessions use it.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio_util::codec::Framed;

use wh_protocol::{Frame, FrameCodec, Message, StreamId};

#[tokio::test]
async fn test_frames_arrive_in_order_per_stream() {
    let (a, b) = tokio::io::duplex(64);
    let mut tx = Framed::new(a, FrameCodec::new());
    let mut rx = Framed::new(b, FrameCodec::new());

    let writer = tokio::spawn(async move {
        for i in 0..50u8 {
            let stream_id = StreamId::new(1 + (i % 2) as u32);
            tx.send(Frame::new(stream_id, Message::Data(Bytes::from(vec![i; 100]))))
                .await
                .unwrap();
        }
        tx.close().await.unwrap();
    });

    let mut last_seen = [None::<u8>; 3];
    while let Some(frame) = rx.next().await {
        let frame = frame.unwrap();
        let Message::Data(data) = frame.message else {
            panic!("expected data");
        };
        let slot = &mut last_seen[frame.stream_id.as_u32() as usize];
        if let Some(prev) = *slot {
            assert!(data[0] > prev, "frames reordered within a stream");
        }
        *slot = Some(data[0]);
    }

    writer.await.unwrap();
    assert_eq!(last_seen[1], Some(48));
    assert_eq!(last_seen[2], Some(49));
}

#[tokio::test]
async fn test_large_payload_survives_small_pipe() {
    let (a, b) = tokio::io::duplex(512);
    let mut tx = Framed::new(a, FrameCodec::new());
    let mut rx = Framed::new(b, FrameCodec::new());

    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();

    tokio::spawn(async move {
        tx.send(Frame::new(StreamId::new(9), Message::Data(Bytes::from(payload))))
            .await
            .unwrap();
    });

    let frame = rx.next().await.unwrap().unwrap();
    assert_eq!(frame.message, Message::Data(Bytes::from(expected)));
}
