//! # Packet Codec
//!
//! Two layers live here:
//!
//! - [`PacketCodec`] turns a [`CommunicationData`] into a complete frame and back
//!   (`encode` / `decode`). Encoding draws its scratch buffer from a [`BufferPool`].
//! - [`FrameCodec`] is the `tokio_util` stream codec used by connection read loops. Its
//!   decoder yields `Result<ProtocolPacket>` items: a protocol error drops a single frame
//!   and the stream keeps going. Only I/O failures end the stream.

use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{trace, warn};

use crate::config::{TransportConfig, MAX_PACKET_SIZE, PROTOCOL_VERSION};
use crate::core::checksum::{self, CHECKSUM_SIZE};
use crate::core::packet::{ProtocolHeader, ProtocolPacket, HEADER_SIZE};
use crate::core::serialization::{PayloadSerializer, SerializationFormat};
use crate::error::{ProtocolError, Result};
use crate::protocol::message::CommunicationData;
use crate::utils::buffer_pool::{BufferPool, PooledBuffer};

/// Message-level encoder/decoder shared by every sender and reader.
#[derive(Clone)]
pub struct PacketCodec {
    serializer: Arc<dyn PayloadSerializer>,
    version: u8,
    supported_versions: Arc<[u8]>,
    max_packet_size: usize,
    buffers: BufferPool,
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(
            Arc::new(SerializationFormat::default()),
            vec![PROTOCOL_VERSION],
            MAX_PACKET_SIZE,
            BufferPool::default(),
        )
    }
}

impl PacketCodec {
    pub fn new(
        serializer: Arc<dyn PayloadSerializer>,
        supported_versions: Vec<u8>,
        max_packet_size: usize,
        buffers: BufferPool,
    ) -> Self {
        Self {
            serializer,
            version: PROTOCOL_VERSION,
            supported_versions: supported_versions.into(),
            max_packet_size,
            buffers,
        }
    }

    pub fn from_config(config: &TransportConfig) -> Self {
        Self::new(
            Arc::new(config.serialization_format),
            config.supported_versions.clone(),
            config.max_packet_size,
            BufferPool::with_limits(config.buffer_pool_size, config.max_packet_size),
        )
    }

    /// Swap the payload serializer; framing is untouched.
    pub fn with_serializer(mut self, serializer: Arc<dyn PayloadSerializer>) -> Self {
        self.serializer = serializer;
        self
    }

    /// Version byte written into outgoing headers
    pub fn with_version(mut self, version: u8) -> Self {
        self.version = version;
        self
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    pub fn supported_versions(&self) -> &[u8] {
        &self.supported_versions
    }

    pub fn format(&self) -> SerializationFormat {
        self.serializer.format()
    }

    /// Encode `data` as a complete frame in a pooled buffer.
    ///
    /// Fails with [`ProtocolError::PacketTooLarge`] when the framed size exceeds the
    /// configured maximum; nothing is truncated.
    pub fn encode(&self, data: &CommunicationData) -> Result<PooledBuffer> {
        let mut buf = self.buffers.acquire();
        buf.extend_from_slice(&[0u8; HEADER_SIZE]);
        self.serializer.serialize_into(data, &mut buf)?;

        let frame_len = buf.len() + CHECKSUM_SIZE;
        if frame_len > self.max_packet_size {
            return Err(ProtocolError::PacketTooLarge {
                size: frame_len,
                max: self.max_packet_size,
            });
        }

        let payload_len = buf.len() - HEADER_SIZE;
        let crc = checksum::crc16(&buf[HEADER_SIZE..]);
        buf.extend_from_slice(&checksum::to_wire(crc));

        let header = ProtocolHeader::new(self.version, payload_len);
        buf[..HEADER_SIZE].copy_from_slice(&header.to_bytes());

        trace!(
            info_type = %data.info_type(),
            frame_len,
            "Encoded frame"
        );
        Ok(buf)
    }

    /// Decode one complete frame into its header and payload.
    pub fn decode(&self, bytes: &[u8]) -> Result<(ProtocolHeader, CommunicationData)> {
        if bytes.len() > self.max_packet_size {
            return Err(ProtocolError::PacketTooLarge {
                size: bytes.len(),
                max: self.max_packet_size,
            });
        }
        let packet = ProtocolPacket::from_bytes_with_versions(bytes, &self.supported_versions)?;
        let data = self.decode_packet(&packet)?;
        Ok((packet.header, data))
    }

    /// Deserialize the payload of an already validated packet.
    pub fn decode_packet(&self, packet: &ProtocolPacket) -> Result<CommunicationData> {
        self.serializer.deserialize(&packet.payload)
    }

    /// Stream codec sharing this codec's limits
    pub fn frame_codec(&self) -> FrameCodec {
        FrameCodec::new(self.supported_versions.to_vec(), self.max_packet_size)
    }
}

/// Stream framing for connection read loops.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    supported_versions: Vec<u8>,
    max_packet_size: usize,
    /// Bytes of an oversized frame still to be discarded
    skip_remaining: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(vec![PROTOCOL_VERSION], MAX_PACKET_SIZE)
    }
}

impl FrameCodec {
    pub fn new(supported_versions: Vec<u8>, max_packet_size: usize) -> Self {
        Self {
            supported_versions,
            max_packet_size,
            skip_remaining: 0,
        }
    }

    fn discard(&mut self, src: &mut BytesMut) -> bool {
        let n = self.skip_remaining.min(src.len());
        src.advance(n);
        self.skip_remaining -= n;
        self.skip_remaining == 0
    }
}

impl Decoder for FrameCodec {
    type Item = Result<ProtocolPacket>;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> std::result::Result<Option<Self::Item>, Self::Error> {
        if self.skip_remaining > 0 && !self.discard(src) {
            return Ok(None);
        }

        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let header = ProtocolHeader::parse(&src[..HEADER_SIZE])?;
        let frame_len = header.frame_len();

        if frame_len > self.max_packet_size {
            // The declared length is still trusted for resynchronisation, so the frame is
            // skipped without being buffered.
            warn!(
                declared = frame_len,
                max = self.max_packet_size,
                "Discarding oversized frame"
            );
            src.advance(HEADER_SIZE);
            self.skip_remaining = header.message_length as usize;
            self.discard(src);
            return Ok(Some(Err(ProtocolError::PacketTooLarge {
                size: frame_len,
                max: self.max_packet_size,
            })));
        }

        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let frame = src.split_to(frame_len);
        Ok(Some(ProtocolPacket::from_bytes_with_versions(
            &frame,
            &self.supported_versions,
        )))
    }
}

impl Encoder<ProtocolPacket> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: ProtocolPacket, dst: &mut BytesMut) -> Result<()> {
        if item.frame_len() > self.max_packet_size {
            return Err(ProtocolError::PacketTooLarge {
                size: item.frame_len(),
                max: self.max_packet_size,
            });
        }
        dst.reserve(item.frame_len());
        dst.put_slice(&item.header.to_bytes());
        dst.put_slice(&item.payload);
        dst.put_slice(&checksum::to_wire(item.checksum));
        Ok(())
    }
}
