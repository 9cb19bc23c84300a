use bytes::BytesMut;
use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use tiered_link::config::PROTOCOL_VERSION;
use tiered_link::core::checksum::crc16;
use tiered_link::core::codec::{FrameCodec, PacketCodec};
use tiered_link::core::packet::ProtocolPacket;
use tiered_link::protocol::message::{CommunicationData, Content, FileChunk, Priority};
use tokio_util::codec::{Decoder, Encoder};

fn chunk_message(size: usize) -> CommunicationData {
    CommunicationData::new(
        Content::FileChunk(FileChunk {
            file_id: "bench".to_string(),
            file_name: "bench.bin".to_string(),
            file_size: size as u64,
            chunk_index: 0,
            total_chunks: 1,
            chunk_data: vec![0xA5; size],
            chunk_hash: String::new(),
        }),
        Priority::Medium,
    )
}

#[allow(clippy::unwrap_used)]
fn bench_packet_encode_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet_encode_decode");
    let payload_sizes = [64usize, 512, 4096, 65536, 1024 * 1024];

    for &size in &payload_sizes {
        let payload = vec![0u8; size];
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_function(format!("frame_encode_{size}b"), |b| {
            b.iter_batched(
                || ProtocolPacket::new(PROTOCOL_VERSION, payload.clone()),
                |packet| {
                    let mut buf = BytesMut::with_capacity(size + 16);
                    let mut codec = FrameCodec::default();
                    codec.encode(packet, &mut buf).unwrap();
                },
                BatchSize::SmallInput,
            )
        });

        group.bench_function(format!("frame_decode_{size}b"), |b| {
            let wire = ProtocolPacket::new(PROTOCOL_VERSION, payload.clone()).to_bytes();
            b.iter_batched(
                || BytesMut::from(&wire[..]),
                |mut buf| {
                    let mut codec = FrameCodec::default();
                    let decoded = codec.decode(&mut buf).unwrap();
                    assert!(matches!(decoded, Some(Ok(_))));
                },
                BatchSize::SmallInput,
            )
        });

        let message = chunk_message(size);
        let codec = PacketCodec::default();
        group.bench_function(format!("message_encode_{size}b"), |b| {
            b.iter(|| codec.encode(&message).unwrap())
        });

        let frame = codec.encode(&message).unwrap().to_vec();
        group.bench_function(format!("message_decode_{size}b"), |b| {
            b.iter(|| codec.decode(&frame).unwrap())
        });
    }

    group.finish();
}

fn bench_crc16(c: &mut Criterion) {
    let mut group = c.benchmark_group("crc16");
    for &size in &[64usize, 4096, 1024 * 1024] {
        let data = vec![0x5Au8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("crc16_{size}b"), |b| b.iter(|| crc16(&data)));
    }
    group.finish();
}

criterion_group!(benches, bench_packet_encode_decode, bench_crc16);
criterion_main!(benches);
