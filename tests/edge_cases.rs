#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Boundary conditions of the wire format and the dispatch table

use bytes::BytesMut;
use futures::FutureExt;
use std::sync::Arc;
use tiered_link::config::PROTOCOL_VERSION;
use tiered_link::core::codec::{FrameCodec, PacketCodec};
use tiered_link::core::packet::{ProtocolHeader, ProtocolPacket, HEADER_SIZE};
use tiered_link::core::serialization::SerializationFormat;
use tiered_link::error::ProtocolError;
use tiered_link::protocol::dispatcher::Dispatcher;
use tiered_link::protocol::message::{CommunicationData, InfoType, Priority};
use tiered_link::utils::buffer_pool::BufferPool;
use tokio_util::codec::Decoder;

// ============================================================================
// FRAME LAYOUT
// ============================================================================

#[test]
fn test_known_frame_layout() {
    let bytes = ProtocolPacket::new(PROTOCOL_VERSION, b"123456789".to_vec()).to_bytes();
    assert_eq!(bytes.len(), HEADER_SIZE + 9 + 2);
    assert_eq!(bytes[0], PROTOCOL_VERSION);
    assert_eq!(&bytes[1..4], &[0, 0, 0]);
    assert_eq!(&bytes[4..8], &11u32.to_be_bytes());
    assert_eq!(&bytes[8..17], b"123456789");
    // CRC 0x4B37, low byte first
    assert_eq!(&bytes[17..], &[0x37, 0x4B]);
}

#[test]
fn test_empty_payload() {
    let bytes = ProtocolPacket::new(PROTOCOL_VERSION, Vec::new()).to_bytes();
    let decoded = ProtocolPacket::from_bytes(&bytes).expect("Should decode empty payload");
    assert!(decoded.payload.is_empty());
    assert_eq!(decoded.header.message_length, 2);
}

#[test]
fn test_swapped_checksum_bytes_rejected() {
    let mut bytes = ProtocolPacket::new(PROTOCOL_VERSION, b"123456789".to_vec()).to_bytes();
    let n = bytes.len();
    bytes.swap(n - 2, n - 1);
    assert!(matches!(
        ProtocolPacket::from_bytes(&bytes),
        Err(ProtocolError::ChecksumMismatch {
            expected: 0x374B,
            actual: 0x4B37
        })
    ));
}

#[test]
fn test_length_shorter_than_checksum_rejected() {
    let mut bytes = ProtocolHeader {
        version: PROTOCOL_VERSION,
        reserved: [0; 3],
        message_length: 1,
    }
    .to_bytes()
    .to_vec();
    bytes.push(0xAA);
    assert!(matches!(
        ProtocolPacket::from_bytes(&bytes),
        Err(ProtocolError::InvalidHeader)
    ));
}

#[test]
fn test_declared_length_disagreement_rejected() {
    let mut bytes = ProtocolPacket::new(PROTOCOL_VERSION, vec![1, 2, 3]).to_bytes();
    bytes.push(0);
    assert!(matches!(
        ProtocolPacket::from_bytes(&bytes),
        Err(ProtocolError::LengthMismatch {
            declared: 5,
            actual: 6
        })
    ));
}

#[test]
fn test_short_header_rejected() {
    assert!(matches!(
        ProtocolPacket::from_bytes(&[1, 0, 0]),
        Err(ProtocolError::InvalidHeader)
    ));
}

// ============================================================================
// SIZE LIMITS
// ============================================================================

#[test]
fn test_encode_over_limit_is_refused_not_truncated() {
    let codec = PacketCodec::new(
        Arc::new(SerializationFormat::Bincode),
        vec![PROTOCOL_VERSION],
        2048,
        BufferPool::new(4),
    );
    let data = CommunicationData::normal("x".repeat(4096), Priority::Low);
    match codec.encode(&data) {
        Err(ProtocolError::PacketTooLarge { size, max }) => {
            assert_eq!(max, 2048);
            assert!(size > 4096);
        }
        other => panic!("expected PacketTooLarge, got {:?}", other.map(|b| b.len())),
    }
}

#[test]
fn test_oversized_stream_frame_is_skipped() {
    let mut frames = FrameCodec::new(vec![PROTOCOL_VERSION], 1024);
    let oversized = ProtocolPacket::new(PROTOCOL_VERSION, vec![0u8; 5000]).to_bytes();
    let good = ProtocolPacket::new(PROTOCOL_VERSION, b"after".to_vec()).to_bytes();

    // Feed the oversized frame in two pieces to exercise the skip state
    let mut buf = BytesMut::from(&oversized[..100]);
    match frames.decode(&mut buf).unwrap() {
        Some(Err(ProtocolError::PacketTooLarge { size, max })) => {
            assert_eq!(size, oversized.len());
            assert_eq!(max, 1024);
        }
        other => panic!("expected oversized rejection, got {other:?}"),
    }
    assert!(buf.is_empty());

    buf.extend_from_slice(&oversized[100..]);
    buf.extend_from_slice(&good);
    let next = frames.decode(&mut buf).unwrap().unwrap().unwrap();
    assert_eq!(&next.payload[..], b"after");
    assert!(buf.is_empty());
}

#[test]
fn test_partial_frame_waits_for_more_bytes() {
    let mut frames = FrameCodec::default();
    let bytes = ProtocolPacket::new(PROTOCOL_VERSION, vec![9u8; 64]).to_bytes();
    let mut buf = BytesMut::from(&bytes[..HEADER_SIZE + 10]);
    assert!(frames.decode(&mut buf).unwrap().is_none());
    buf.extend_from_slice(&bytes[HEADER_SIZE + 10..]);
    assert!(frames.decode(&mut buf).unwrap().unwrap().is_ok());
}

// ============================================================================
// VERSION GATING
// ============================================================================

#[test]
fn test_additional_supported_version_accepted() {
    let writer = PacketCodec::default().with_version(2);
    let reader = PacketCodec::new(
        Arc::new(SerializationFormat::Bincode),
        vec![PROTOCOL_VERSION, 2],
        tiered_link::config::MAX_PACKET_SIZE,
        BufferPool::default(),
    );
    let frame = writer.encode(&CommunicationData::heartbeat()).unwrap();
    let (header, data) = reader.decode(&frame).unwrap();
    assert_eq!(header.version, 2);
    assert_eq!(data, CommunicationData::heartbeat());

    assert!(matches!(
        PacketCodec::default().decode(&frame),
        Err(ProtocolError::UnsupportedVersion(2))
    ));
}

#[test]
fn test_garbage_payload_with_valid_crc_is_deserialize_error() {
    let bytes = ProtocolPacket::new(PROTOCOL_VERSION, vec![0xFF; 32]).to_bytes();
    assert!(matches!(
        PacketCodec::default().decode(&bytes),
        Err(ProtocolError::DeserializeError(_))
    ));
}

// ============================================================================
// DISPATCH
// ============================================================================

#[tokio::test]
async fn test_unregistered_kind_is_unexpected() {
    let dispatcher = Dispatcher::new();
    dispatcher
        .register(InfoType::Heartbeat, |_, _| async { Ok(()) }.boxed())
        .unwrap();

    assert!(dispatcher.dispatch(1, CommunicationData::heartbeat()).await.is_ok());
    assert!(matches!(
        dispatcher
            .dispatch(1, CommunicationData::normal("?", Priority::Low))
            .await,
        Err(ProtocolError::UnexpectedMessage)
    ));
}
