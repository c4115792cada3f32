//! Integration tests for the control-channel framing
//!
//! Drives `ChannelCodec` through `tokio_util::codec::Framed` over an in-memory
//! duplex pipe, the way the agent and a controller talk to each other.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};
use tunwire_proto::{
    encode_connect_answer, AddressFamily, ChannelCodec, Command, ConnectAnswer, Message, Request,
};

#[tokio::test]
async fn test_requests_survive_framing() {
    let (agent_side, controller_side) = tokio::io::duplex(1024);
    let mut controller = FramedWrite::new(controller_side, ChannelCodec::default());
    let mut agent = FramedRead::new(agent_side, ChannelCodec::default());

    let requests = vec![
        Request::Connect {
            id: 0x01,
            family: AddressFamily::Ipv4,
            host: "10.0.0.5".to_string(),
            port: 80,
        },
        Request::Spawn {
            id: 0x04,
            command: "/bin/sh".to_string(),
        },
        Request::Data {
            id: 0x01,
            data: Bytes::from_static(b"GET / HTTP/1.0\r\n\r\n"),
        },
        Request::Close { id: 0x01 },
    ];

    for request in requests.clone() {
        controller.send(Message::from(request)).await.unwrap();
    }

    for expected in requests {
        let message = timeout(Duration::from_secs(5), agent.next())
            .await
            .expect("timed out")
            .expect("stream ended")
            .unwrap();
        assert_eq!(Request::parse(message).unwrap(), expected);
    }
}

#[tokio::test]
async fn test_answer_split_across_writes() {
    let (agent_side, mut controller_side) = tokio::io::duplex(1024);
    let mut agent = FramedRead::new(agent_side, ChannelCodec::default());

    let addr = "10.0.0.5:80".parse().unwrap();
    let mut frame = bytes::BytesMut::new();
    tokio_util::codec::Encoder::encode(
        &mut ChannelCodec::default(),
        Message::new(Command::Connect, 0x01, encode_connect_answer(&addr)),
        &mut frame,
    )
    .unwrap();

    // dribble the frame one byte at a time
    let writer = tokio::spawn(async move {
        for byte in frame.iter() {
            controller_side.write_all(&[*byte]).await.unwrap();
        }
        controller_side
    });

    let message = timeout(Duration::from_secs(5), agent.next())
        .await
        .expect("timed out")
        .expect("stream ended")
        .unwrap();
    let _controller_side = writer.await.unwrap();

    assert_eq!(message.command, Command::Connect);
    let answer = ConnectAnswer::decode(&message.payload).unwrap();
    assert!(answer.error.is_success());
    assert_eq!(answer.address, Some(addr));
}
