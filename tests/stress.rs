#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tempfile::TempDir;
use tiered_link::config::NetworkConfig;
use tiered_link::core::codec::{FrameCodec, PacketCodec};
use tiered_link::protocol::message::{ClientId, CommunicationData, Content, Priority};
use tiered_link::service::client::Client;
use tiered_link::service::server::Server;
use tokio::task::JoinSet;
use tokio_util::codec::Decoder;

#[test]
fn stress_message_encode_decode_large_series() {
    let codec = PacketCodec::default();
    let mut frames = FrameCodec::default();
    let mut buf = BytesMut::new();

    for size in [0usize, 1, 64, 512, 4096, 65536] {
        let text = "a".repeat(size);
        for seq in 0..500u64 {
            let data = CommunicationData::normal(text.clone(), Priority::Low).with_seq(seq);
            buf.extend_from_slice(&codec.encode(&data).unwrap());
            let packet = frames.decode(&mut buf).unwrap().unwrap().unwrap();
            assert_eq!(codec.decode_packet(&packet).unwrap().seq_num, seq);
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn stress_many_clients_all_acknowledged() {
    let clients = 16usize;
    let per_client = 25u64;

    let dir = TempDir::new().unwrap();
    let received = Arc::new(AtomicUsize::new(0));
    let counter = received.clone();
    let config = NetworkConfig::default_with_overrides(|c| {
        c.server.address = "127.0.0.1:0".to_string();
        c.server.output_root = dir.path().join("received");
    });
    let mut server = Server::new(config)
        .unwrap()
        .on_message(Arc::new(move |_: ClientId, _: String| {
            counter.fetch_add(1, Ordering::Relaxed);
        }));
    server.start(false).await.unwrap();
    let addr = server.local_addr().unwrap().to_string();

    let mut tasks = JoinSet::new();
    for n in 0..clients {
        let addr = addr.clone();
        tasks.spawn(async move {
            let mut client = Client::connect(&addr).await.unwrap();
            let priority = Priority::ALL[n % 3];
            let mut expected = Vec::new();
            for i in 0..per_client {
                expected.push(
                    client
                        .send_message(format!("client {n} message {i}"), priority)
                        .await
                        .unwrap(),
                );
            }

            let mut acked = Vec::new();
            while acked.len() < expected.len() {
                let data = client.recv_timeout(Duration::from_secs(10)).await.unwrap();
                if let Content::Acknowledgement { .. } = data.content {
                    acked.push(data.ack_num);
                }
            }
            acked.sort_unstable();
            assert_eq!(acked, expected);
            client.close().await;
        });
    }

    while let Some(res) = tasks.join_next().await {
        res.unwrap();
    }
    assert_eq!(received.load(Ordering::Relaxed), clients * per_client as usize);
    assert!(server.metrics().snapshot().connections_total >= clients as u64);
    server.stop().await;
}
