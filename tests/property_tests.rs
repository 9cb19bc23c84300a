//! Property-based tests using proptest
//!
//! Codec properties checked over randomly generated messages and corruptions.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;

use bytes::BytesMut;
use proptest::prelude::*;
use tiered_link::config::PROTOCOL_VERSION;
use tiered_link::core::checksum::crc16;
use tiered_link::core::codec::{FrameCodec, PacketCodec};
use tiered_link::core::packet::{ProtocolPacket, HEADER_SIZE};
use tiered_link::core::serialization::SerializationFormat;
use tiered_link::error::ProtocolError;
use tiered_link::protocol::message::{CommunicationData, Content, FileChunk, Priority};
use tokio_util::codec::Decoder;

fn priority() -> impl Strategy<Value = Priority> {
    prop_oneof![
        Just(Priority::High),
        Just(Priority::Medium),
        Just(Priority::Low)
    ]
}

fn message() -> impl Strategy<Value = CommunicationData> {
    let normal = (".{0,200}", priority(), any::<u64>())
        .prop_map(|(text, p, seq)| CommunicationData::normal(text, p).with_seq(seq));
    let chunk = (
        "[a-z0-9-]{1,36}",
        prop::collection::vec(any::<u8>(), 0..4096),
        any::<u32>(),
    )
        .prop_map(|(file_id, data, index)| {
            CommunicationData::new(
                Content::FileChunk(FileChunk {
                    file_id,
                    file_name: "blob.bin".to_string(),
                    file_size: data.len() as u64,
                    chunk_index: index,
                    total_chunks: index.saturating_add(1),
                    chunk_hash: String::new(),
                    chunk_data: data,
                }),
                Priority::Medium,
            )
        });
    let ack = (any::<u64>(), priority()).prop_map(|(n, p)| CommunicationData::acknowledgement(n, p));
    prop_oneof![normal, chunk, ack, Just(CommunicationData::heartbeat())]
}

proptest! {
    #[test]
    fn prop_encode_decode_is_identity(data in message()) {
        let codec = PacketCodec::default();
        let frame = codec.encode(&data).expect("encode");
        let (header, decoded) = codec.decode(&frame).expect("decode");
        prop_assert_eq!(header.version, PROTOCOL_VERSION);
        prop_assert_eq!(header.message_length as usize, frame.len() - HEADER_SIZE);
        prop_assert_eq!(decoded, data);
    }
}

proptest! {
    #[test]
    fn prop_every_format_round_trips(data in message(), format in prop_oneof![
        Just(SerializationFormat::Bincode),
        Just(SerializationFormat::Json),
        Just(SerializationFormat::MessagePack),
    ]) {
        let codec = PacketCodec::default().with_serializer(Arc::new(format));
        let frame = codec.encode(&data).expect("encode");
        let (_, decoded) = codec.decode(&frame).expect("decode");
        prop_assert_eq!(decoded, data);
    }
}

// CRC-16 catches every single-bit error; header corruption trips version or length checks.
// Only the reserved bytes are ignored on read.
proptest! {
    #[test]
    fn prop_single_bit_flip_is_rejected(data in message(), position in any::<prop::sample::Index>(), bit in 0u8..8) {
        let codec = PacketCodec::default();
        let mut frame = codec.encode(&data).expect("encode").to_vec();
        let index = position.index(frame.len());
        prop_assume!(!(1..4).contains(&index));

        frame[index] ^= 1 << bit;
        let result = codec.decode(&frame);
        prop_assert!(result.is_err(), "flip at byte {} bit {} went undetected", index, bit);
    }
}

proptest! {
    #[test]
    fn prop_reserved_bytes_are_ignored(data in message(), reserved in any::<[u8; 3]>()) {
        let codec = PacketCodec::default();
        let mut frame = codec.encode(&data).expect("encode").to_vec();
        frame[1..4].copy_from_slice(&reserved);
        let (_, decoded) = codec.decode(&frame).expect("decode");
        prop_assert_eq!(decoded, data);
    }
}

proptest! {
    #[test]
    fn prop_unsupported_version_is_rejected(version in any::<u8>(), payload in prop::collection::vec(any::<u8>(), 0..256)) {
        prop_assume!(version != PROTOCOL_VERSION);
        let bytes = ProtocolPacket::new(version, payload).to_bytes();
        prop_assert!(matches!(
            ProtocolPacket::from_bytes(&bytes),
            Err(ProtocolError::UnsupportedVersion(v)) if v == version
        ));
    }
}

proptest! {
    #[test]
    fn prop_truncated_frame_is_rejected(payload in prop::collection::vec(any::<u8>(), 1..512), cut in 1usize..64) {
        let bytes = ProtocolPacket::new(PROTOCOL_VERSION, payload).to_bytes();
        let cut = cut.min(bytes.len());
        prop_assert!(ProtocolPacket::from_bytes(&bytes[..bytes.len() - cut]).is_err());
    }
}

// A byte stream split at arbitrary points yields the same frames in order.
proptest! {
    #[test]
    fn prop_stream_decoder_handles_any_split(
        messages in prop::collection::vec(message(), 1..8),
        split in prop::collection::vec(1usize..97, 1..32),
    ) {
        let codec = PacketCodec::default();
        let mut wire = Vec::new();
        for data in &messages {
            wire.extend_from_slice(&codec.encode(data).expect("encode"));
        }

        let mut frames = FrameCodec::default();
        let mut buf = BytesMut::new();
        let mut decoded = Vec::new();
        let mut offset = 0;
        let mut steps = split.iter().cycle();
        while offset < wire.len() {
            let step = (*steps.next().expect("cycle")).min(wire.len() - offset);
            buf.extend_from_slice(&wire[offset..offset + step]);
            offset += step;
            while let Some(item) = frames.decode(&mut buf).expect("stream error") {
                let packet = item.expect("valid frame");
                decoded.push(codec.decode_packet(&packet).expect("payload"));
            }
        }
        prop_assert!(buf.is_empty());
        prop_assert_eq!(decoded, messages);
    }
}

// Appending the low-byte-first trailer leaves a zero residue
proptest! {
    #[test]
    fn prop_crc_residue_is_zero(data in prop::collection::vec(any::<u8>(), 0..2048)) {
        let mut framed = data.clone();
        framed.extend_from_slice(&crc16(&data).to_le_bytes());
        prop_assert_eq!(crc16(&framed), 0);
    }
}

#[test]
fn crc_known_vector() {
    assert_eq!(crc16(b"123456789"), 0x4B37);
}

#[test]
fn corrupt_frame_does_not_poison_stream() {
    let codec = PacketCodec::default();
    let first = codec.encode(&CommunicationData::normal("one", Priority::High)).unwrap();
    let mut bad = codec.encode(&CommunicationData::normal("two", Priority::High)).unwrap().to_vec();
    let last = bad.len() - 1;
    bad[last] ^= 0xFF;
    let third = codec.encode(&CommunicationData::normal("three", Priority::High)).unwrap();

    let mut buf = BytesMut::new();
    buf.extend_from_slice(&first);
    buf.extend_from_slice(&bad);
    buf.extend_from_slice(&third);

    let mut frames = FrameCodec::default();
    let a = frames.decode(&mut buf).unwrap().unwrap();
    let b = frames.decode(&mut buf).unwrap().unwrap();
    let c = frames.decode(&mut buf).unwrap().unwrap();
    assert!(a.is_ok());
    assert!(matches!(b, Err(ProtocolError::ChecksumMismatch { .. })));
    let c = codec.decode_packet(&c.unwrap()).unwrap();
    assert_eq!(
        c.content,
        Content::Normal {
            message: "three".to_string()
        }
    );
}
