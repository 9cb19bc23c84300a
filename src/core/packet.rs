//! # Protocol Packet
//!
//! Fixed 8-byte header followed by the serialized payload and a CRC-16 trailer.
//!
//! ```text
//! [0]      version          u8
//! [1..4]   reserved         3 bytes, zero on write, ignored on read
//! [4..8]   message_length   u32 big-endian, payload + checksum byte count
//! [8..N]   payload
//! [N..N+2] CRC-16(payload), low byte first
//! ```
//!
//! Packets are built fresh for every send and parsed fresh for every receive; they are never
//! mutated after construction.

use bytes::Bytes;

use crate::config::PROTOCOL_VERSION;
use crate::core::checksum::{self, CHECKSUM_SIZE};
use crate::error::{ProtocolError, Result};

/// Header length on the wire
pub const HEADER_SIZE: usize = 8;

/// Frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolHeader {
    pub version: u8,
    pub reserved: [u8; 3],
    /// Payload length plus checksum length
    pub message_length: u32,
}

impl ProtocolHeader {
    pub fn new(version: u8, payload_len: usize) -> Self {
        Self {
            version,
            reserved: [0; 3],
            message_length: (payload_len + CHECKSUM_SIZE) as u32,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0] = self.version;
        out[1..4].copy_from_slice(&self.reserved);
        out[4..8].copy_from_slice(&self.message_length.to_be_bytes());
        out
    }

    /// Parse the first eight bytes of `bytes`; version gating is done by the caller.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(ProtocolError::InvalidHeader);
        }
        Ok(Self {
            version: bytes[0],
            reserved: [bytes[1], bytes[2], bytes[3]],
            message_length: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        })
    }

    /// Payload length implied by `message_length`
    pub fn payload_len(&self) -> Result<usize> {
        (self.message_length as usize)
            .checked_sub(CHECKSUM_SIZE)
            .ok_or(ProtocolError::InvalidHeader)
    }

    /// Full frame size on the wire
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.message_length as usize
    }
}

/// A complete frame: header, opaque payload, checksum
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolPacket {
    pub header: ProtocolHeader,
    pub payload: Bytes,
    pub checksum: u16,
}

impl ProtocolPacket {
    /// Build a packet around an already serialized payload
    pub fn new(version: u8, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        Self {
            header: ProtocolHeader::new(version, payload.len()),
            checksum: checksum::crc16(&payload),
            payload,
        }
    }

    pub fn version(&self) -> u8 {
        self.header.version
    }

    pub fn frame_len(&self) -> usize {
        self.header.frame_len()
    }

    pub fn verify_checksum(&self) -> Result<()> {
        let actual = checksum::crc16(&self.payload);
        if actual == self.checksum {
            Ok(())
        } else {
            Err(ProtocolError::ChecksumMismatch {
                expected: self.checksum,
                actual,
            })
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.frame_len());
        out.extend_from_slice(&self.header.to_bytes());
        out.extend_from_slice(&self.payload);
        out.extend_from_slice(&checksum::to_wire(self.checksum));
        out
    }

    /// Parse one exact frame accepting only [`PROTOCOL_VERSION`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::from_bytes_with_versions(bytes, &[PROTOCOL_VERSION])
    }

    /// Parse one exact frame. Fails closed on short header, unsupported version,
    /// length disagreement or checksum mismatch.
    pub fn from_bytes_with_versions(bytes: &[u8], supported: &[u8]) -> Result<Self> {
        let header = ProtocolHeader::parse(bytes)?;
        if !supported.contains(&header.version) {
            return Err(ProtocolError::UnsupportedVersion(header.version));
        }

        let body = &bytes[HEADER_SIZE..];
        let declared = header.message_length as usize;
        if declared != body.len() {
            return Err(ProtocolError::LengthMismatch {
                declared,
                actual: body.len(),
            });
        }

        let payload_len = header.payload_len()?;
        let (payload, trailer) = body.split_at(payload_len);
        let packet = Self {
            header,
            payload: Bytes::copy_from_slice(payload),
            checksum: checksum::from_wire([trailer[0], trailer[1]]),
        };
        packet.verify_checksum()?;
        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;

    #[test]
    fn test_header_is_eight_bytes() {
        let header = ProtocolHeader::new(1, 10);
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(bytes[0], 1);
        assert_eq!(&bytes[1..4], &[0, 0, 0]);
        assert_eq!(u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]), 12);
    }

    #[test]
    fn test_packet_roundtrip() {
        let packet = ProtocolPacket::new(PROTOCOL_VERSION, vec![1, 2, 3, 4]);
        let bytes = packet.to_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE + 4 + CHECKSUM_SIZE);
        let decoded = ProtocolPacket::from_bytes(&bytes).expect("decode");
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_empty_payload() {
        let packet = ProtocolPacket::new(PROTOCOL_VERSION, Vec::new());
        let decoded = ProtocolPacket::from_bytes(&packet.to_bytes()).expect("decode");
        assert!(decoded.payload.is_empty());
        assert_eq!(decoded.checksum, 0xFFFF);
    }

    #[test]
    fn test_truncated_header() {
        let result = ProtocolPacket::from_bytes(&[1, 0, 0, 0, 0]);
        assert!(matches!(result, Err(ProtocolError::InvalidHeader)));
        assert!(matches!(
            ProtocolPacket::from_bytes(&[]),
            Err(ProtocolError::InvalidHeader)
        ));
    }

    #[test]
    fn test_unsupported_version() {
        let packet = ProtocolPacket::new(99, vec![0xAA; 5]);
        let result = ProtocolPacket::from_bytes(&packet.to_bytes());
        assert!(matches!(result, Err(ProtocolError::UnsupportedVersion(99))));

        let accepted = ProtocolPacket::from_bytes_with_versions(&packet.to_bytes(), &[1, 99]);
        assert!(accepted.is_ok());
    }

    #[test]
    fn test_length_mismatch() {
        let mut bytes = ProtocolPacket::new(PROTOCOL_VERSION, vec![7; 8]).to_bytes();
        bytes.push(0);
        assert!(matches!(
            ProtocolPacket::from_bytes(&bytes),
            Err(ProtocolError::LengthMismatch {
                declared: 10,
                actual: 11
            })
        ));
    }

    #[test]
    fn test_length_shorter_than_checksum() {
        let mut bytes = vec![PROTOCOL_VERSION, 0, 0, 0];
        bytes.extend_from_slice(&1u32.to_be_bytes());
        bytes.push(0);
        assert!(matches!(
            ProtocolPacket::from_bytes(&bytes),
            Err(ProtocolError::InvalidHeader)
        ));
    }

    #[test]
    fn test_checksum_corruption_detected() {
        let mut bytes = ProtocolPacket::new(PROTOCOL_VERSION, b"payload".to_vec()).to_bytes();
        bytes[HEADER_SIZE] ^= 0x01;
        assert!(matches!(
            ProtocolPacket::from_bytes(&bytes),
            Err(ProtocolError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_reserved_bytes_ignored_on_read() {
        let mut bytes = ProtocolPacket::new(PROTOCOL_VERSION, b"abc".to_vec()).to_bytes();
        bytes[1] = 0xFF;
        let decoded = ProtocolPacket::from_bytes(&bytes).expect("decode");
        assert_eq!(decoded.header.reserved, [0xFF, 0, 0]);
    }
}
